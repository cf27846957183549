//! Earliest-arrival index keyed by (route, stop).

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::parser::TripUpdate;

/// Composite key of the index. Two routes serving the same stop are distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArrivalKey {
    pub route_id: String,
    pub stop_id: String,
}

impl ArrivalKey {
    pub fn new(route_id: impl Into<String>, stop_id: impl Into<String>) -> Self {
        Self {
            route_id: route_id.into(),
            stop_id: stop_id.into(),
        }
    }
}

/// The earliest arrival seen for a key and the trip that reported it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrivalEntry {
    pub arrival: i64,
    pub trip_id: String,
}

/// Mapping from (route, stop) to the earliest predicted arrival of one feed snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArrivalIndex {
    entries: HashMap<ArrivalKey, ArrivalEntry>,
}

impl ArrivalIndex {
    /// Builds the index from trip updates in feed order.
    ///
    /// A stored value is only replaced by a strictly earlier arrival, so on a
    /// tie the first observation in traversal order is kept.
    pub fn build(updates: &[TripUpdate]) -> Self {
        let mut index = Self::default();

        for update in updates {
            for stop_time in &update.stop_times {
                let Some(arrival) = stop_time.arrival else {
                    continue;
                };
                index.observe(
                    ArrivalKey::new(update.route_id.as_str(), stop_time.stop_id.as_str()),
                    arrival,
                    &update.trip_id,
                );
            }
        }

        index
    }

    fn observe(&mut self, key: ArrivalKey, arrival: i64, trip_id: &str) {
        match self.entries.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(ArrivalEntry {
                    arrival,
                    trip_id: trip_id.to_string(),
                });
            }
            Entry::Occupied(mut slot) => {
                if arrival < slot.get().arrival {
                    slot.insert(ArrivalEntry {
                        arrival,
                        trip_id: trip_id.to_string(),
                    });
                }
            }
        }
    }

    pub fn get(&self, route_id: &str, stop_id: &str) -> Option<&ArrivalEntry> {
        self.entries.get(&ArrivalKey::new(route_id, stop_id))
    }

    /// Earliest arrival epoch for a (route, stop) pair, if any was predicted.
    pub fn arrival(&self, route_id: &str, stop_id: &str) -> Option<i64> {
        self.get(route_id, stop_id).map(|e| e.arrival)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries sorted by route then stop.
    pub fn iter(&self) -> impl Iterator<Item = (&ArrivalKey, &ArrivalEntry)> {
        let mut sorted: Vec<_> = self.entries.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        sorted.into_iter()
    }
}
