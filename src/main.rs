use std::time::Duration;

use clap::Parser;
use tokio::net::lookup_host;
use tracing::{error, info, warn};

use rtsp_relay::server::DEFAULT_PORT;
use rtsp_relay::transcode::DEFAULT_PROGRAM;
use rtsp_relay::{StreamConfig, StreamError, StreamRelay, TranscodeConfig, Transport};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Output options used when none are given, playable by jsmpeg
const DEFAULT_OPTIONS: &[(&str, &str)] = &[("-f", "mpegts"), ("-codec:v", "mpeg1video")];

#[derive(Parser, Debug)]
#[command(name = "rtsp-relay")]
#[command(about = "Relay an RTSP stream to browsers over WebSocket", long_about = None)]
struct Args {
    /// Source stream URL
    #[arg(env = "RTSP_RELAY_URL")]
    url: String,

    /// Stream name used in logs
    #[arg(long, env = "RTSP_RELAY_NAME", default_value = rtsp_relay::DEFAULT_STREAM_NAME)]
    name: String,

    /// WebSocket listen host
    #[arg(long, env = "RTSP_RELAY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// WebSocket listen port
    #[arg(long, env = "RTSP_RELAY_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Pull the source over TCP instead of UDP
    #[arg(long, env = "RTSP_RELAY_TCP")]
    tcp: bool,

    /// Transcoder binary
    #[arg(long, env = "RTSP_RELAY_FFMPEG_PATH", default_value = DEFAULT_PROGRAM)]
    ffmpeg_path: String,

    /// Extra transcoder option, `KEY=VALUE` or a bare `KEY`; repeatable
    #[arg(
        long = "ffmpeg-option",
        value_name = "KEY[=VALUE]",
        value_parser = parse_option,
        allow_hyphen_values = true
    )]
    ffmpeg_options: Vec<(String, String)>,

    /// Stop the stream after this long without output
    #[arg(
        long,
        env = "RTSP_RELAY_MAX_SILENCE_MS",
        default_value_t = 30_000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    max_silence_ms: u64,

    /// Restart after a stream error after this delay; 0 disables restarting
    #[arg(long, env = "RTSP_RELAY_RESTART_DELAY_MS", default_value_t = 5_000)]
    restart_delay_ms: u64,

    /// Log relay statistics at this interval; 0 disables the report
    #[arg(long, env = "RTSP_RELAY_STATS_INTERVAL_SECS", default_value_t = 30)]
    stats_interval_secs: u64,
}

fn parse_option(raw: &str) -> Result<(String, String), String> {
    let (key, value) = match raw.split_once('=') {
        Some((key, value)) => (key, value),
        None => (raw, ""),
    };

    if key.is_empty() {
        return Err(format!("missing option name in `{}`", raw));
    }

    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();

    let args = Args::parse();

    let bind_addr = lookup_host((args.host.as_str(), args.port))
        .await?
        .next()
        .ok_or_else(|| format!("no address found for host `{}`", args.host))?;

    let mut transcode = TranscodeConfig::new(&args.url).program(&args.ffmpeg_path);
    if args.tcp {
        transcode = transcode.transport(Transport::Tcp);
    }
    if args.ffmpeg_options.is_empty() {
        for (name, value) in DEFAULT_OPTIONS {
            transcode = transcode.flag(*name, *value);
        }
    } else {
        for (name, value) in &args.ffmpeg_options {
            transcode = transcode.flag(name, value);
        }
    }

    let config = StreamConfig::new(&args.name, transcode)
        .bind(bind_addr)
        .max_silence(Duration::from_millis(args.max_silence_ms));

    info!(
        stream = %args.name,
        url = %args.url,
        addr = %bind_addr,
        "rtsp-relay starting"
    );

    let (relay, mut errors) = StreamRelay::start(config).await?;
    let restart_delay = Duration::from_millis(args.restart_delay_ms);
    let stats_interval = Duration::from_secs(args.stats_interval_secs);

    tokio::select! {
        _ = supervise(&relay, &mut errors, restart_delay) => {
            info!("Supervision ended");
        }
        _ = report_stats(&relay, stats_interval) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    relay.shutdown().await;
    Ok(())
}

/// Restart the stream after each error until restarting is disabled
async fn supervise(
    relay: &StreamRelay,
    errors: &mut tokio::sync::mpsc::Receiver<StreamError>,
    delay: Duration,
) {
    while let Some(stream_error) = errors.recv().await {
        if delay.is_zero() {
            error!(error = %stream_error, "Stream failed, restarting disabled");
            return;
        }

        warn!(
            error = %stream_error,
            delay_ms = delay.as_millis() as u64,
            "Stream failed, restarting"
        );

        loop {
            tokio::time::sleep(delay).await;
            match relay.restart().await {
                Ok(()) => break,
                Err(e) => error!(error = %e, "Restart failed"),
            }
        }
    }
}

/// Log a stats line at every interval; never returns
async fn report_stats(relay: &StreamRelay, interval: Duration) {
    if interval.is_zero() {
        return std::future::pending().await;
    }

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        match relay.stats().await {
            Ok(stats) => info!(
                stream = %stats.name,
                phase = ?stats.phase,
                clients = stats.clients,
                bitrate_bps = stats.bitrate(),
                drop_ratio = stats.drop_ratio(),
                restarts = stats.restarts,
                "Relay stats"
            ),
            Err(e) => warn!(error = %e, "Relay stats unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_option() {
        assert_eq!(
            parse_option("-f=mpegts").unwrap(),
            ("-f".to_string(), "mpegts".to_string())
        );
        assert_eq!(
            parse_option("-stats").unwrap(),
            ("-stats".to_string(), String::new())
        );
        assert!(parse_option("=value").is_err());
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["rtsp-relay", "rtsp://cam/1"]).unwrap();

        assert_eq!(args.url, "rtsp://cam/1");
        assert_eq!(args.port, 9999);
        assert_eq!(args.ffmpeg_path, "ffmpeg");
        assert!(!args.tcp);
        assert!(args.ffmpeg_options.is_empty());
        assert_eq!(args.max_silence_ms, 30_000);
        assert_eq!(args.stats_interval_secs, 30);
    }

    #[test]
    fn test_zero_max_silence_rejected() {
        let result = Args::try_parse_from(["rtsp-relay", "rtsp://cam/1", "--max-silence-ms", "0"]);
        assert!(result.is_err());

        let args =
            Args::try_parse_from(["rtsp-relay", "rtsp://cam/1", "--max-silence-ms", "1"]).unwrap();
        assert_eq!(args.max_silence_ms, 1);
    }

    #[test]
    fn test_args_repeated_options() {
        let args = Args::try_parse_from([
            "rtsp-relay",
            "rtsp://cam/1",
            "--tcp",
            "--ffmpeg-option",
            "-f=mpegts",
            "--ffmpeg-option",
            "-r=30",
        ])
        .unwrap();

        assert!(args.tcp);
        assert_eq!(
            args.ffmpeg_options,
            vec![
                ("-f".to_string(), "mpegts".to_string()),
                ("-r".to_string(), "30".to_string()),
            ]
        );
    }
}
