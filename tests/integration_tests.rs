use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use bytes::Bytes;
use prost::Message;
use rumqttc::QoS;
use transit_notifier::config::Config;
use transit_notifier::dispatch::{DispatchError, DispatchPolicy, Dispatcher};
use transit_notifier::fetch::FileFeedSource;
use transit_notifier::gtfs_rt::trip_update::{StopTimeEvent, StopTimeUpdate};
use transit_notifier::gtfs_rt::{FeedEntity, FeedHeader, FeedMessage, TripDescriptor, TripUpdate};
use transit_notifier::index::ArrivalIndex;
use transit_notifier::matcher::{Notification, Subscription, match_subscriptions};
use transit_notifier::names::NameTables;
use transit_notifier::output::decode_payload;
use transit_notifier::parser::decode;
use transit_notifier::poll::Poller;
use transit_notifier::publish::Publisher;

const T: i64 = 1_760_000_000;

fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
}

fn names() -> NameTables {
    NameTables::load(&fixture("routes.txt"), &fixture("stops.txt")).expect("Failed to load names")
}

fn entity(id: &str, route: &str, stops: &[(&str, Option<i64>)]) -> FeedEntity {
    FeedEntity {
        id: id.to_string(),
        trip_update: Some(TripUpdate {
            trip: TripDescriptor {
                trip_id: Some(format!("trip-{id}")),
                route_id: Some(route.to_string()),
                ..Default::default()
            },
            stop_time_update: stops
                .iter()
                .map(|(stop, time)| StopTimeUpdate {
                    stop_id: Some(stop.to_string()),
                    arrival: time.map(|t| StopTimeEvent {
                        time: Some(t),
                        ..Default::default()
                    }),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn feed(entities: Vec<FeedEntity>) -> Vec<u8> {
    FeedMessage {
        header: FeedHeader {
            gtfs_realtime_version: "2.0".to_string(),
            timestamp: Some(T as u64),
            ..Default::default()
        },
        entity: entities,
    }
    .encode_to_vec()
}

fn notifications_at(bytes: &[u8], subs: &[Subscription], now: i64) -> BTreeMap<String, Notification> {
    let updates = decode(bytes).expect("Failed to decode feed");
    let index = ArrivalIndex::build(&updates);
    match_subscriptions(subs, &index, now, &names())
}

#[test]
fn test_upcoming_arrival_produces_valid_notification() {
    let bytes = feed(vec![entity("e1", "4384", &[("2591", Some(T))])]);
    let subs = vec![Subscription::new("t1", "4384", "2591")];

    let result = notifications_at(&bytes, &subs, T - 120);
    assert_eq!(
        result["t1"],
        Notification {
            is_valid: true,
            route_number: "01".to_string(),
            stop_name: "King at James".to_string(),
            next_arrival_time: 120,
        }
    );
}

#[test]
fn test_departed_arrival_is_suppressed() {
    let bytes = feed(vec![entity("e1", "4384", &[("2591", Some(T))])]);
    let subs = vec![Subscription::new("t1", "4384", "2591")];

    let result = notifications_at(&bytes, &subs, T + 10);
    assert!(!result["t1"].is_valid);
}

#[test]
fn test_earliest_of_several_trips_is_used() {
    let bytes = feed(vec![
        entity("e1", "4384", &[("2591", Some(T + 50))]),
        entity("e2", "4384", &[("2591", Some(T)), ("2593", None)]),
    ]);

    let index = ArrivalIndex::build(&decode(&bytes).unwrap());
    assert_eq!(index.arrival("4384", "2591"), Some(T));
    assert_eq!(index.get("4384", "2591").unwrap().trip_id, "trip-e2");
    assert_eq!(index.arrival("4384", "2593"), None);
}

#[test]
fn test_stop_absent_from_feed_is_invalid() {
    let bytes = feed(vec![entity("e1", "4384", &[("2591", Some(T))])]);
    let subs = vec![Subscription::new("t1", "4384", "2592")];

    let result = notifications_at(&bytes, &subs, T - 60);
    assert_eq!(result["t1"], Notification::invalid());
}

#[test]
fn test_config_fixture_drives_matching() {
    let config = Config::load(&fixture("config.json")).expect("Failed to load config");
    let bytes = feed(vec![
        entity("e1", "4384", &[("2591", Some(T + 300)), ("2593", Some(T + 400))]),
        entity("e2", "4385", &[("2592", Some(T - 30))]),
    ]);

    let result = notifications_at(&bytes, &config.subscriptions(), T);
    assert_eq!(result.len(), 3);
    assert_eq!(result["hsr/01/king-james"].next_arrival_time, 300);
    assert!(!result["hsr/02/barton-victoria"].is_valid);
    assert!(!result["hsr/20/james-hunter"].is_valid);

    let qos = config.topic_qos();
    assert_eq!(qos["hsr/01/king-james"], QoS::AtLeastOnce);
    assert_eq!(qos["hsr/20/james-hunter"], QoS::AtMostOnce);
    assert_eq!(config.mqtt_settings().client_id, "notifier-test");
}

struct FlakyBroker {
    down: Vec<&'static str>,
    delivered: Mutex<Vec<(String, Notification)>>,
}

#[async_trait::async_trait]
impl Publisher for FlakyBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> anyhow::Result<()> {
        if self.down.iter().any(|t| *t == topic) {
            return Err(anyhow!("connection refused"));
        }
        let notification = decode_payload(&payload)?;
        self.delivered
            .lock()
            .unwrap()
            .push((topic.to_string(), notification));
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_topic_does_not_affect_sibling() {
    let broker = Arc::new(FlakyBroker {
        down: vec!["t1"],
        delivered: Mutex::new(Vec::new()),
    });
    let dispatcher = Arc::new(Dispatcher::new(broker.clone(), DispatchPolicy::default()));

    let bytes = feed(vec![
        entity("e1", "4384", &[("2591", Some(T + 60))]),
        entity("e2", "4385", &[("2592", Some(T + 90))]),
    ]);
    let subs = vec![
        Subscription::new("t1", "4384", "2591"),
        Subscription::new("t2", "4385", "2592"),
    ];
    let notifications = notifications_at(&bytes, &subs, T);

    let report = dispatcher.dispatch_all(&notifications).await;

    assert_eq!(report.failed.len(), 1);
    assert!(matches!(
        &report.failed[0],
        DispatchError::Exhausted { topic, attempts: 3, .. } if topic == "t1"
    ));
    assert_eq!(report.delivered.len(), 1);

    let delivered = broker.delivered.lock().unwrap();
    assert_eq!(delivered[0].0, "t2");
    assert_eq!(delivered[0].1.stop_name, "Barton at Victoria");
    assert_eq!(delivered[0].1.next_arrival_time, 90);
}

#[tokio::test(start_paused = true)]
async fn test_full_pipeline_from_snapshot_file() {
    let path = std::env::temp_dir().join("transit_notifier_pipeline.pb");
    std::fs::write(
        &path,
        feed(vec![
            entity("e1", "4402", &[("2593", Some(T + 45))]),
            entity("e2", "4402", &[("2593", Some(T + 45))]),
        ]),
    )
    .unwrap();

    let broker = Arc::new(FlakyBroker {
        down: vec![],
        delivered: Mutex::new(Vec::new()),
    });
    let dispatcher = Arc::new(Dispatcher::new(broker.clone(), DispatchPolicy::default()));
    let poller = Poller::new(
        Arc::new(FileFeedSource::new(&path)),
        vec![Subscription::new("hsr/20/james-hunter", "4402", "2593")],
        Arc::new(names()),
        dispatcher,
    );

    let outcome = poller.run_cycle(T).await.expect("cycle failed");
    assert_eq!(outcome.stats.trip_updates, 2);
    assert_eq!(outcome.stats.index_keys, 1);

    let report = outcome.dispatch.await.unwrap();
    assert!(report.is_clean());
    poller.shutdown().await;

    let delivered = broker.delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].1.route_number, "20");
    assert_eq!(delivered[0].1.next_arrival_time, 45);

    std::fs::remove_file(&path).unwrap();
}
