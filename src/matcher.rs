//! Turns an arrival index into one notification per subscription.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::index::ArrivalIndex;
use crate::names::NameLookup;

/// A standing interest in one route at one stop, published under `topic`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub route_id: String,
    pub stop_id: String,
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        route_id: impl Into<String>,
        stop_id: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            route_id: route_id.into(),
            stop_id: stop_id.into(),
        }
    }
}

/// Next-arrival message for a subscription. Serialized as the delivery payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// `false` when there is no upcoming arrival to report.
    pub is_valid: bool,
    pub route_number: String,
    pub stop_name: String,
    /// Seconds until the arrival, relative to the `now` it was computed for.
    pub next_arrival_time: i64,
}

impl Notification {
    pub fn invalid() -> Self {
        Self::default()
    }

    /// Absolute arrival time in epoch seconds.
    pub fn arrival_epoch(&self, now: i64) -> i64 {
        now + self.next_arrival_time
    }
}

/// Computes the notification of every subscription at time `now` (epoch seconds).
///
/// Each subscription yields exactly one entry keyed by its topic. Topics are
/// unique by configuration; if two subscriptions share one the later wins.
pub fn match_subscriptions(
    subscriptions: &[Subscription],
    index: &ArrivalIndex,
    now: i64,
    names: &dyn NameLookup,
) -> BTreeMap<String, Notification> {
    let mut results = BTreeMap::new();

    for sub in subscriptions {
        let notification = notify(sub, index, now, names);
        if results.insert(sub.topic.clone(), notification).is_some() {
            debug!(topic = %sub.topic, "Duplicate topic, later subscription wins");
        }
    }

    results
}

fn notify(
    sub: &Subscription,
    index: &ArrivalIndex,
    now: i64,
    names: &dyn NameLookup,
) -> Notification {
    let Some(arrival) = index.arrival(&sub.route_id, &sub.stop_id) else {
        return Notification::invalid();
    };

    let delta = match arrival.checked_sub(now) {
        Some(delta) if delta >= 0 => delta,
        _ => {
            debug!(topic = %sub.topic, arrival, now, "Stale arrival suppressed");
            return Notification::invalid();
        }
    };

    Notification {
        is_valid: true,
        route_number: names.route_name(&sub.route_id).unwrap_or_default().to_string(),
        stop_name: names.stop_name(&sub.stop_id).unwrap_or_default().to_string(),
        next_arrival_time: delta,
    }
}
