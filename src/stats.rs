use crate::gtfs_rt::FeedMessage;

/// Counts describing one feed snapshot and what a cycle made of it.
#[derive(Debug, Default, Clone)]
pub struct FeedStats {
    pub feed_timestamp: Option<u64>,
    pub total_entities: usize,

    // entity types
    pub trip_updates: usize,
    pub deleted: usize,

    // stop-time fields
    pub stop_time_updates: usize,
    pub with_stop_id: usize,
    pub with_arrival: usize,
    pub with_arrival_time: usize,
    pub with_departure: usize,

    // derived
    pub index_keys: usize,
    pub subscriptions: usize,
    pub valid_notifications: usize,
}

impl FeedStats {
    pub fn from_feed(feed: &FeedMessage) -> Self {
        let mut s = FeedStats {
            feed_timestamp: feed.header.timestamp,
            total_entities: feed.entity.len(),
            ..Default::default()
        };

        for e in &feed.entity {
            if e.is_deleted == Some(true) {
                s.deleted += 1;
            }

            let Some(tu) = &e.trip_update else {
                continue;
            };
            s.trip_updates += 1;

            for stu in &tu.stop_time_update {
                s.stop_time_updates += 1;

                if stu.stop_id.is_some() {
                    s.with_stop_id += 1;
                }

                if let Some(arrival) = &stu.arrival {
                    s.with_arrival += 1;

                    if arrival.time.is_some() {
                        s.with_arrival_time += 1;
                    }
                }

                if stu.departure.is_some() {
                    s.with_departure += 1;
                }
            }
        }

        s
    }

    pub fn pct(part: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            (part as f64 / total as f64) * 100.0
        }
    }

    /// Share of stop-time updates that carry a usable arrival prediction.
    pub fn arrival_pct(&self) -> f64 {
        Self::pct(self.with_arrival_time, self.stop_time_updates)
    }

    /// Seconds between the feed header timestamp and `now`, if the feed has one.
    pub fn age_secs(&self, now: i64) -> Option<i64> {
        self.feed_timestamp
            .and_then(|ts| i64::try_from(ts).ok())
            .map(|ts| now.saturating_sub(ts))
    }

    pub fn with_match_info(
        mut self,
        index_keys: usize,
        subscriptions: usize,
        valid_notifications: usize,
    ) -> Self {
        self.index_keys = index_keys;
        self.subscriptions = subscriptions;
        self.valid_notifications = valid_notifications;
        self
    }
}
