//! Notification payloads and human-readable output.
//!
//! Payloads are JSON records of the form
//! `{"is_valid":true,"route_number":"01","stop_name":"King at James","next_arrival_time":120}`.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{Local, TimeZone};
use tracing::{debug, info};

use crate::index::ArrivalIndex;
use crate::matcher::Notification;

/// Serializes a [`Notification`] into the payload handed to the publisher.
pub fn encode_payload(notification: &Notification) -> serde_json::Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(notification)?))
}

/// Parses a payload produced by [`encode_payload`].
pub fn decode_payload(payload: &[u8]) -> serde_json::Result<Notification> {
    serde_json::from_slice(payload)
}

/// Formats an epoch as local wall-clock time, e.g. `3:04 PM`.
pub fn clock_time(epoch: i64) -> String {
    match Local.timestamp_opt(epoch, 0).single() {
        Some(t) => t.format("%-I:%M %p").to_string(),
        None => epoch.to_string(),
    }
}

/// Logs every notification of a cycle, valid or not.
pub fn print_notifications(notifications: &BTreeMap<String, Notification>, now: i64) {
    for (topic, n) in notifications {
        if n.is_valid {
            info!(
                topic = %topic,
                route = %n.route_number,
                stop = %n.stop_name,
                seconds = n.next_arrival_time,
                at = %clock_time(n.arrival_epoch(now)),
                "Next arrival"
            );
        } else {
            info!(topic = %topic, "No valid notification");
        }
    }
}

/// Logs the earliest arrival of every (route, stop) pair, optionally filtered.
pub fn print_arrivals(index: &ArrivalIndex, route: Option<&str>, stop: Option<&str>) {
    let mut shown = 0usize;
    for (key, entry) in index.iter() {
        if route.is_some_and(|r| r != key.route_id) || stop.is_some_and(|s| s != key.stop_id) {
            continue;
        }
        shown += 1;
        info!(
            route = %key.route_id,
            stop = %key.stop_id,
            trip = %entry.trip_id,
            arrival = entry.arrival,
            at = %clock_time(entry.arrival),
            "Arrival"
        );
    }
    debug!(shown, total = index.len(), "Arrivals listed");
}
