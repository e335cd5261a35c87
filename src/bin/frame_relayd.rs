//! frame_relayd - frame-file relay daemon
//!
//! This daemon:
//! 1. Watches one stream's frame directory on a shared filesystem
//! 2. Detects new frame files (timestamp poll, filesystem watch, or strict
//!    sequence poll, selected by RELAY_STRATEGY)
//! 3. Publishes one MQTT message per frame, in production order
//! 4. Persists a resume watermark only after the broker confirmed delivery
//!
//! Runs until SIGINT/SIGTERM. The sequence strategy additionally exits
//! non-zero on the first publish failure (fail-fast debugging mode).

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use rumqttc::v5::MqttOptions;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use frame_relay::publish::{frame_topic, AckMode};
use frame_relay::{
    CursorStore, FailurePolicy, MqttGateway, Relay, RelocateWatch, SequencePoll, StreamPaths,
    TimestampPoll,
};

const DAEMON_NAME: &str = "frame_relayd";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Relay new frame files from a shared filesystem to MQTT"
)]
struct Args {
    /// MQTT broker address (host:port).
    #[arg(long, env = "MQTT_BROKER_ADDR", default_value = "127.0.0.1:1883")]
    mqtt_broker_addr: String,

    /// MQTT client identifier.
    #[arg(long, env = "MQTT_CLIENT_ID", default_value = DAEMON_NAME)]
    mqtt_client_id: String,

    /// MQTT username for authentication.
    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    /// MQTT password for authentication.
    #[arg(long, env = "MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    /// Topic prefix frame messages publish under; the stream name is
    /// appended for broker-side filtering.
    #[arg(long, env = "TOPIC_ID", default_value = "frame-processing")]
    topic_id: String,

    /// Stream this process relays (one stream per process).
    #[arg(long, env = "STREAM_NAME", default_value = "cam0")]
    stream_name: String,

    /// Root of the shared frames tree; frames live in <root>/<stream>/frames.
    #[arg(long, env = "FRAMES_DIR", default_value = "/mnt/nfs/streams")]
    frames_dir: PathBuf,

    /// Polling interval in milliseconds.
    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 500)]
    poll_interval_ms: u64,

    /// Change-detection strategy.
    #[arg(long, env = "RELAY_STRATEGY", value_enum, default_value = "timestamp")]
    strategy: Strategy,

    /// How long to wait for broker acknowledgment in milliseconds.
    #[arg(long, env = "PUBLISH_ACK_TIMEOUT_MS", default_value_t = 30_000)]
    publish_ack_timeout_ms: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Strategy {
    /// Poll the frames directory by modification time.
    Timestamp,
    /// Filesystem notifications on frames/pending, relocate to frames/done.
    Watch,
    /// Poll for strict dense sequential filenames; publish failure is fatal.
    Sequence,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.poll_interval_ms == 0 {
        return Err(anyhow!("POLL_INTERVAL_MS must be greater than zero"));
    }
    let interval = Duration::from_millis(args.poll_interval_ms);
    let ack_timeout = Duration::from_millis(args.publish_ack_timeout_ms);

    let paths = StreamPaths::new(&args.frames_dir, &args.stream_name);
    std::fs::create_dir_all(&paths.frames_dir).with_context(|| {
        format!(
            "could not create frames directory {}",
            paths.frames_dir.display()
        )
    })?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))
            .context("could not install signal handler")?;
    }

    log::info!(
        "{} v{} starting: stream={}, strategy={:?}",
        DAEMON_NAME,
        env!("CARGO_PKG_VERSION"),
        args.stream_name,
        args.strategy
    );
    log::info!("watching for new frames in {}", paths.frames_dir.display());

    match args.strategy {
        Strategy::Timestamp => {
            let cursor = CursorStore::timestamp(paths.timestamp_cursor());
            log::info!("using cursor file {}", cursor.path().display());
            let watermark = cursor.load();
            let detector = TimestampPoll::new(paths.frames_dir.clone(), args.stream_name.clone());
            let gateway = connect_gateway(&args, AckMode::Confirmed, ack_timeout)?;
            Relay::new(
                detector,
                gateway,
                Some(cursor),
                watermark,
                FailurePolicy::Retry,
            )
            .run(interval, &shutdown)
        }
        Strategy::Sequence => {
            let cursor = CursorStore::sequence(paths.sequence_cursor());
            log::info!("using cursor file {}", cursor.path().display());
            let watermark = cursor.load();
            let detector = SequencePoll::new(paths.frames_dir.clone(), args.stream_name.clone());
            let gateway = connect_gateway(&args, AckMode::Confirmed, ack_timeout)?;
            Relay::new(
                detector,
                gateway,
                Some(cursor),
                watermark,
                FailurePolicy::Fatal,
            )
            .run(interval, &shutdown)
        }
        Strategy::Watch => {
            let detector = RelocateWatch::new(
                paths.pending_dir(),
                paths.done_dir(),
                args.stream_name.clone(),
                interval,
            )?;
            let gateway = connect_gateway(&args, AckMode::Detached, ack_timeout)?;
            Relay::new(
                detector,
                gateway,
                None,
                frame_relay::Watermark::Membership,
                FailurePolicy::Retry,
            )
            .run(interval, &shutdown)
        }
    }
}

fn connect_gateway(args: &Args, mode: AckMode, ack_timeout: Duration) -> Result<MqttGateway> {
    let (host, port) = split_host_port(&args.mqtt_broker_addr)?;
    let mut options = MqttOptions::new(&args.mqtt_client_id, host, port);
    options.set_keep_alive(Duration::from_secs(60));
    options.set_clean_start(true);
    if let Some(user) = &args.mqtt_username {
        options.set_credentials(user, args.mqtt_password.clone().unwrap_or_default());
    }

    let topic = frame_topic(&args.topic_id, &args.stream_name);
    log::info!(
        "publishing to topic {} on {}",
        topic,
        args.mqtt_broker_addr
    );
    MqttGateway::connect(options, topic, mode, ack_timeout)
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port.parse().context("invalid MQTT port")?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port.parse().context("invalid MQTT port")?;
    Ok((host.to_string(), port))
}
