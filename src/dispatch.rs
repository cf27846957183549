//! Delivery of notifications with bounded retry.
//!
//! Every valid notification of a cycle is published from its own task, so a
//! topic that keeps timing out never holds back its siblings. A topic whose
//! attempts are all used up is reported as [`DispatchError::Exhausted`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::{self, JoinSet};
use tokio::time::Instant;
use tracing::{Instrument, debug, warn};

use crate::matcher::Notification;
use crate::output::encode_payload;
use crate::publish::Publisher;

/// How hard to try before giving up on one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    /// Total publish attempts per notification. `0` behaves like `1`.
    pub max_retries: u32,
    /// Upper bound on a single publish attempt.
    pub attempt_timeout: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

impl DispatchPolicy {
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Longest a single dispatch can take when every attempt times out.
    pub fn worst_case(&self) -> Duration {
        self.attempt_timeout.saturating_mul(self.attempts())
    }
}

/// Why a single publish attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    Timeout,
    Transport(String),
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Timeout => f.write_str("timed out"),
            AttemptFailure::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch to {topic} exhausted after {attempts} attempts, last {last}")]
    Exhausted {
        topic: String,
        attempts: u32,
        last: AttemptFailure,
    },

    #[error("failed to encode notification for {topic}: {source}")]
    Encode {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("dispatch to {topic} did not complete: {reason}")]
    Aborted { topic: String, reason: String },
}

impl DispatchError {
    pub fn topic(&self) -> &str {
        match self {
            DispatchError::Exhausted { topic, .. }
            | DispatchError::Encode { topic, .. }
            | DispatchError::Aborted { topic, .. } => topic,
        }
    }
}

/// A successful delivery and the attempt it succeeded on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub attempts: u32,
}

/// Outcome of dispatching one cycle's notifications.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub delivered: Vec<Delivery>,
    pub failed: Vec<DispatchError>,
    /// Invalid notifications, which are never published.
    pub skipped: usize,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_topics(&self) -> Vec<&str> {
        self.failed.iter().map(DispatchError::topic).collect()
    }

    fn sort(&mut self) {
        self.delivered.sort_by(|a, b| a.topic.cmp(&b.topic));
        self.failed.sort_by(|a, b| a.topic().cmp(b.topic()));
    }
}

/// Publishes notifications through a shared [`Publisher`].
pub struct Dispatcher {
    publisher: Arc<dyn Publisher>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(publisher: Arc<dyn Publisher>, policy: DispatchPolicy) -> Self {
        Self { publisher, policy }
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Publishes one notification, retrying up to the policy's attempt count.
    #[tracing::instrument(skip_all, fields(topic = %topic))]
    pub async fn dispatch(
        &self,
        topic: &str,
        notification: &Notification,
    ) -> Result<Delivery, DispatchError> {
        let payload = encode_payload(notification).map_err(|source| DispatchError::Encode {
            topic: topic.to_string(),
            source,
        })?;

        let attempts = self.policy.attempts();
        let mut last = None;

        for attempt in 1..=attempts {
            let publish = self.publisher.publish(topic, payload.clone());
            match tokio::time::timeout(self.policy.attempt_timeout, publish).await {
                Ok(Ok(())) => {
                    debug!(attempt, "Notification delivered");
                    return Ok(Delivery {
                        topic: topic.to_string(),
                        attempts: attempt,
                    });
                }
                Ok(Err(e)) => {
                    warn!(attempt, attempts, error = %e, "Publish error");
                    last = Some(AttemptFailure::Transport(format!("{e:#}")));
                }
                Err(_) => {
                    warn!(
                        attempt,
                        attempts,
                        timeout_ms = self.policy.attempt_timeout.as_millis() as u64,
                        "Publish timeout"
                    );
                    last = Some(AttemptFailure::Timeout);
                }
            }
        }

        Err(DispatchError::Exhausted {
            topic: topic.to_string(),
            attempts,
            last: last.unwrap_or(AttemptFailure::Timeout),
        })
    }

    /// Dispatches every valid notification on its own task and waits for all of them.
    pub async fn dispatch_all(
        self: &Arc<Self>,
        notifications: &BTreeMap<String, Notification>,
    ) -> DispatchReport {
        self.dispatch_all_within(notifications, None).await
    }

    /// Like [`Dispatcher::dispatch_all`], but gives up on unfinished tasks
    /// once `deadline` has elapsed and reports them as aborted.
    pub async fn dispatch_all_within(
        self: &Arc<Self>,
        notifications: &BTreeMap<String, Notification>,
        deadline: Option<Duration>,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut pending: HashMap<task::Id, String> = HashMap::new();
        let mut tasks = JoinSet::new();

        for (topic, notification) in notifications {
            if !notification.is_valid {
                report.skipped += 1;
                continue;
            }

            let dispatcher = Arc::clone(self);
            let task_topic = topic.clone();
            let notification = notification.clone();

            let handle = tasks.spawn(
                async move { dispatcher.dispatch(&task_topic, &notification).await }
                    .in_current_span(),
            );
            pending.insert(handle.id(), topic.clone());
        }

        // A deadline too far out to represent is no deadline.
        let deadline = deadline.and_then(|d| Instant::now().checked_add(d));

        loop {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, tasks.join_next_with_id()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(unfinished = tasks.len(), "Dispatch deadline elapsed");
                        tasks.abort_all();
                        break;
                    }
                },
                None => tasks.join_next_with_id().await,
            };

            match next {
                Some(Ok((id, result))) => {
                    pending.remove(&id);
                    match result {
                        Ok(delivery) => report.delivered.push(delivery),
                        Err(e) => report.failed.push(e),
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Dispatch task failed");
                    if let Some(topic) = pending.remove(&e.id()) {
                        let reason = if e.is_panic() {
                            "dispatch task panicked"
                        } else {
                            "dispatch task cancelled"
                        };
                        report.failed.push(DispatchError::Aborted {
                            topic,
                            reason: reason.to_string(),
                        });
                    }
                }
                None => break,
            }
        }

        for topic in pending.into_values() {
            report.failed.push(DispatchError::Aborted {
                topic,
                reason: "cycle deadline elapsed".to_string(),
            });
        }

        report.sort();
        report
    }

    /// Closes the underlying publisher.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.publisher.close().await
    }
}
