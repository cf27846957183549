//! Protobuf decoding of GTFS Realtime trip updates.
//!
//! The raw [`FeedMessage`] is reduced to a flat list of [`TripUpdate`]s that
//! only carry what arrival matching needs: the route, the trip and each stop's
//! predicted arrival.

use thiserror::Error;
use tracing::trace;

use crate::gtfs_rt::FeedMessage;
use prost::Message;

/// The snapshot is not a well-formed GTFS-RT feed. No partial result is kept.
#[derive(Debug, Error)]
#[error("malformed feed snapshot: {0}")]
pub struct DecodeError(#[from] prost::DecodeError);

/// One stop of a trip together with its predicted arrival, in epoch seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopTimeEntry {
    pub stop_id: String,
    pub arrival: Option<i64>,
}

/// Predicted progress of a single vehicle trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TripUpdate {
    pub route_id: String,
    pub trip_id: String,
    pub stop_times: Vec<StopTimeEntry>,
}

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
///
/// # Errors
///
/// Returns [`DecodeError`] if the bytes are not valid protobuf for a `FeedMessage`.
pub fn decode_feed(bytes: &[u8]) -> Result<FeedMessage, DecodeError> {
    Ok(FeedMessage::decode(bytes)?)
}

/// Extracts the trip updates of a decoded feed, in entity order.
///
/// Entities without a trip update are skipped, as are stop-time entries that
/// have no stop id or no predicted arrival time.
pub fn trip_updates(feed: &FeedMessage) -> Vec<TripUpdate> {
    let mut updates = Vec::new();

    for entity in &feed.entity {
        let Some(trip_update) = &entity.trip_update else {
            continue;
        };

        let stop_times = trip_update
            .stop_time_update
            .iter()
            .filter_map(|stu| {
                let stop_id = stu.stop_id.clone()?;
                let arrival = stu.arrival.as_ref().and_then(|a| a.time)?;
                Some(StopTimeEntry {
                    stop_id,
                    arrival: Some(arrival),
                })
            })
            .collect::<Vec<_>>();

        trace!(
            entity_id = %entity.id,
            stop_times = stop_times.len(),
            "Trip update decoded"
        );

        updates.push(TripUpdate {
            route_id: trip_update.trip.route_id.clone().unwrap_or_default(),
            trip_id: trip_update.trip.trip_id.clone().unwrap_or_default(),
            stop_times,
        });
    }

    updates
}

/// Decodes raw snapshot bytes straight into trip updates.
pub fn decode(bytes: &[u8]) -> Result<Vec<TripUpdate>, DecodeError> {
    let feed = decode_feed(bytes)?;
    Ok(trip_updates(&feed))
}
