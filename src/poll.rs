//! The fetch → decode → match → dispatch cycle, repeated on a fixed interval.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::dispatch::{DispatchReport, Dispatcher};
use crate::fetch::FeedSource;
use crate::index::ArrivalIndex;
use crate::matcher::{Notification, Subscription, match_subscriptions};
use crate::names::NameLookup;
use crate::output::clock_time;
use crate::parser::{DecodeError, decode_feed, trip_updates};
use crate::stats::FeedStats;

/// Feeds whose header is older than this are logged as stale.
const STALE_FEED_SECS: i64 = 300;

/// Extra time a cycle's dispatches get beyond their worst-case retry time.
const DEADLINE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("feed fetch failed: {0:#}")]
    Fetch(anyhow::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// What one cycle produced. Dispatch keeps running in the background;
/// `dispatch` resolves to its report.
pub struct CycleOutcome {
    pub stats: FeedStats,
    pub notifications: BTreeMap<String, Notification>,
    pub dispatch: JoinHandle<DispatchReport>,
}

pub struct Poller {
    source: Arc<dyn FeedSource>,
    subscriptions: Vec<Subscription>,
    names: Arc<dyn NameLookup>,
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    cycle_deadline: Duration,
    tracker: TaskTracker,
}

impl Poller {
    pub fn new(
        source: Arc<dyn FeedSource>,
        subscriptions: Vec<Subscription>,
        names: Arc<dyn NameLookup>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let cycle_deadline = dispatcher.policy().worst_case().saturating_add(DEADLINE_GRACE);
        Self {
            source,
            subscriptions,
            names,
            dispatcher,
            interval: Duration::from_secs(5),
            cycle_deadline,
            tracker: TaskTracker::new(),
        }
    }

    /// Pause between the end of one cycle and the start of the next.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_cycle_deadline(mut self, deadline: Duration) -> Self {
        self.cycle_deadline = deadline;
        self
    }

    /// Decodes a snapshot and computes every subscription's notification at `now`.
    pub fn evaluate(
        &self,
        bytes: &[u8],
        now: i64,
    ) -> Result<(FeedStats, BTreeMap<String, Notification>), DecodeError> {
        let feed = decode_feed(bytes)?;
        let stats = FeedStats::from_feed(&feed);
        let index = ArrivalIndex::build(&trip_updates(&feed));
        let notifications =
            match_subscriptions(&self.subscriptions, &index, now, self.names.as_ref());

        let valid = notifications.values().filter(|n| n.is_valid).count();
        let stats = stats.with_match_info(index.len(), self.subscriptions.len(), valid);
        Ok((stats, notifications))
    }

    /// Runs one cycle at time `now` (epoch seconds).
    ///
    /// Returns as soon as dispatch has been handed to a background supervisor.
    pub async fn run_cycle(&self, now: i64) -> Result<CycleOutcome, CycleError> {
        let bytes = self.source.fetch().await.map_err(CycleError::Fetch)?;
        let (stats, notifications) = self.evaluate(&bytes, now)?;

        if let Some(age) = stats.age_secs(now).filter(|age| *age > STALE_FEED_SECS) {
            warn!(age_secs = age, "Feed snapshot is stale");
        }

        debug!(
            entities = stats.total_entities,
            trip_updates = stats.trip_updates,
            deleted = stats.deleted,
            stop_time_updates = stats.stop_time_updates,
            with_stop_id = stats.with_stop_id,
            with_arrival = stats.with_arrival,
            with_departure = stats.with_departure,
            arrival_pct = stats.arrival_pct(),
            index_keys = stats.index_keys,
            subscriptions = stats.subscriptions,
            valid = stats.valid_notifications,
            "Feed indexed"
        );

        for (topic, n) in notifications.iter().filter(|(_, n)| n.is_valid) {
            info!(
                topic = %topic,
                route = %n.route_number,
                stop = %n.stop_name,
                at = %clock_time(n.arrival_epoch(now)),
                seconds = n.next_arrival_time,
                "Next arrival"
            );
        }

        let dispatch = self.spawn_dispatch(notifications.clone());

        Ok(CycleOutcome {
            stats,
            notifications,
            dispatch,
        })
    }

    fn spawn_dispatch(
        &self,
        notifications: BTreeMap<String, Notification>,
    ) -> JoinHandle<DispatchReport> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let deadline = self.cycle_deadline;

        self.tracker.spawn(
            async move {
                let report = dispatcher
                    .dispatch_all_within(&notifications, Some(deadline))
                    .await;

                for failure in &report.failed {
                    error!(topic = failure.topic(), error = %failure, "Dispatch failed");
                }
                info!(
                    delivered = report.delivered.len(),
                    failed = report.failed.len(),
                    skipped = report.skipped,
                    "Cycle dispatch finished"
                );
                report
            }
            .in_current_span(),
        )
    }

    /// Polls until `cancel` fires, then waits for in-flight dispatches and
    /// closes the publisher.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            source = %self.source.describe(),
            subscriptions = self.subscriptions.len(),
            interval_secs = self.interval.as_secs_f64(),
            "Poll loop started"
        );

        let mut cycle: u64 = 0;
        while !cancel.is_cancelled() {
            cycle += 1;
            let now = Utc::now().timestamp();

            let span = info_span!("cycle", cycle);
            if let Err(e) = self.run_cycle(now).instrument(span).await {
                error!(cycle, error = %e, "Cycle aborted");
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!(cycles = cycle, "Poll loop stopping");
        self.shutdown().await;
    }

    /// Waits for every dispatch started so far, then closes the publisher.
    pub async fn shutdown(&self) {
        self.tracker.close();
        if !self.tracker.is_empty() {
            info!(in_flight = self.tracker.len(), "Waiting for in-flight dispatches");
        }
        self.tracker.wait().await;

        if let Err(e) = self.dispatcher.close().await {
            warn!(error = %e, "Failed to close publisher");
        }
    }
}
