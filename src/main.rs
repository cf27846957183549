//! CLI entry point for the transit arrival notifier.
//!
//! Polls a GTFS-RT trip updates feed, matches it against the configured
//! route/stop subscriptions and publishes next-arrival notifications.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use transit_notifier::{
    config::{BrokerConfig, BrokerTransport, Config},
    dispatch::Dispatcher,
    fetch::{
        BasicClient, FeedSource, FileFeedSource, HttpClient, HttpFeedSource,
        auth::{ApiKey, UrlParam},
    },
    index::ArrivalIndex,
    names::NameTables,
    output::{print_arrivals, print_notifications},
    parser::{decode_feed, trip_updates},
    poll::Poller,
    publish::{HttpPublisher, LogPublisher, MqttPublisher, Publisher},
    stats::FeedStats,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "transit_notifier")]
#[command(about = "Publishes next-arrival notifications from a GTFS-RT feed", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the feed and publish notifications until interrupted
    Run {
        /// Path to the JSON config file
        #[arg(short, long, default_value = "config/config.json")]
        config: String,

        /// Log payloads instead of publishing them
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Run a single cycle and print every subscription's notification
    Once {
        /// Path to the JSON config file
        #[arg(short, long, default_value = "config/config.json")]
        config: String,

        /// Also publish the valid notifications and wait for delivery
        #[arg(long, default_value_t = false)]
        publish: bool,
    },
    /// List the earliest arrival of every route and stop in a feed snapshot
    Arrivals {
        /// Path to file or URL to fetch
        #[arg(value_name = "FILE_OR_URL")]
        source: String,

        /// Only show this route id
        #[arg(short, long)]
        route: Option<String>,

        /// Only show this stop id
        #[arg(short, long)]
        stop: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    let _file_guard = init_logging()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, dry_run } => run(&config, dry_run).await?,
        Commands::Once { config, publish } => once(&config, publish).await?,
        Commands::Arrivals {
            source,
            route,
            stop,
        } => arrivals(&source, route.as_deref(), stop.as_deref()).await?,
    }

    Ok(())
}

/// Logging setup: colored stderr + JSON rolling log file.
fn init_logging() -> Result<WorkerGuard> {
    let log_file_path = std::env::var("LOG_FILE_PATH")
        .unwrap_or_else(|_| "logs/transit_notifier.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("transit_notifier.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    Ok(file_guard)
}

/// Runs the poll loop until Ctrl+C.
#[tracing::instrument]
async fn run(config_path: &str, dry_run: bool) -> Result<()> {
    let config = Config::load(config_path)?;
    let poller = build_poller(&config, dry_run)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                on_signal.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
    });

    info!("Press Ctrl+C to stop.");
    poller.run(cancel).await;
    info!("Stopped");
    Ok(())
}

/// Runs one cycle and prints the result, optionally publishing it.
#[tracing::instrument]
async fn once(config_path: &str, publish: bool) -> Result<()> {
    let config = Config::load(config_path)?;
    let now = Utc::now().timestamp();

    if !publish {
        let poller = build_poller(&config, true)?;
        let bytes = feed_source(&config.feed.source)?.fetch().await?;
        let (stats, notifications) = poller.evaluate(&bytes, now)?;
        info!(
            index_keys = stats.index_keys,
            valid = stats.valid_notifications,
            "Feed evaluated"
        );
        print_notifications(&notifications, now);
        return Ok(());
    }

    let poller = build_poller(&config, false)?;
    let outcome = poller.run_cycle(now).await?;
    print_notifications(&outcome.notifications, now);

    let report = outcome.dispatch.await?;
    poller.shutdown().await;

    if !report.is_clean() {
        bail!(
            "{} notification(s) could not be delivered: {}",
            report.failed.len(),
            report.failed_topics().join(", ")
        );
    }
    Ok(())
}

/// Lists every (route, stop) arrival found in a snapshot.
#[tracing::instrument(fields(source = %source))]
async fn arrivals(source: &str, route: Option<&str>, stop: Option<&str>) -> Result<()> {
    let bytes = feed_source(source)?.fetch().await?;
    let feed = decode_feed(&bytes)?;
    let stats = FeedStats::from_feed(&feed);
    info!(
        entities = stats.total_entities,
        trip_updates = stats.trip_updates,
        stop_time_updates = stats.stop_time_updates,
        arrival_pct = stats.arrival_pct(),
        "Feed parsed"
    );

    let index = ArrivalIndex::build(&trip_updates(&feed));
    print_arrivals(&index, route, stop);
    Ok(())
}

fn build_poller(config: &Config, dry_run: bool) -> Result<Poller> {
    let names = Arc::new(NameTables::load(&config.feed.routes, &config.feed.stops)?);
    let publisher = build_publisher(config, dry_run)?;
    let dispatcher = Arc::new(Dispatcher::new(publisher, config.dispatch_policy()));

    for sub in &config.subscribes {
        info!(
            topic = %sub.topic,
            qos = sub.qos,
            route_id = %sub.route_id,
            stop_id = %sub.stop_id,
            "Subscription"
        );
    }

    Ok(Poller::new(
        feed_source(&config.feed.source)?,
        config.subscriptions(),
        names,
        dispatcher,
    )
    .with_interval(config.poll_interval()))
}

/// Loads feed data from a local file path or fetches it over HTTP.
fn feed_source(source: &str) -> Result<Arc<dyn FeedSource>> {
    if source.starts_with("http") {
        let client = BasicClient::with_timeouts(REQUEST_TIMEOUT, CONNECT_TIMEOUT)?;
        Ok(Arc::new(HttpFeedSource::new(client, source)))
    } else {
        Ok(Arc::new(FileFeedSource::new(source)))
    }
}

fn build_publisher(config: &Config, dry_run: bool) -> Result<Arc<dyn Publisher>> {
    if dry_run {
        info!("Dry run, notifications are logged only");
        return Ok(Arc::new(LogPublisher));
    }

    let broker = &config.broker;
    if broker.transport == BrokerTransport::Mqtt {
        let settings = config.mqtt_settings();
        info!(
            host = %settings.host,
            port = settings.port,
            client_id = %settings.client_id,
            tls = settings.tls,
            "Publishing over MQTT"
        );
        let publisher = MqttPublisher::connect(&settings).with_topic_qos(config.topic_qos());
        return Ok(Arc::new(publisher));
    }

    let client = BasicClient::with_timeouts(REQUEST_TIMEOUT, CONNECT_TIMEOUT)?;

    match (&broker.api_key, &broker.api_key_param, &broker.api_key_header) {
        (Some(key), Some(param), _) => http_publisher(
            UrlParam {
                inner: client,
                param_name: param.clone(),
                key: key.clone(),
            },
            broker,
        ),
        (Some(key), None, Some(header)) => {
            http_publisher(ApiKey::new(client, header, key)?, broker)
        }
        (Some(key), None, None) => http_publisher(ApiKey::bearer(client, key)?, broker),
        (None, _, _) => http_publisher(client, broker),
    }
}

fn http_publisher<C: HttpClient + 'static>(
    client: C,
    broker: &BrokerConfig,
) -> Result<Arc<dyn Publisher>> {
    let mut publisher = HttpPublisher::new(client, &broker.url)?;
    if let Some(client_id) = &broker.client_id {
        publisher = publisher.with_client_id(client_id)?;
    }
    info!(broker = %broker.url, "Publishing over HTTP");
    Ok(Arc::new(publisher))
}
