use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use unison_proto::{Track, DURATION_UNKNOWN, MSECOND};
use unison_server::{ServerConfig, SyncServer, SystemClock, DEFAULT_LATENCY};

fn print_banner(addr: &str, port: u16, tracks: usize) {
    let version = env!("CARGO_PKG_VERSION");
    println!();
    println!("  ╭──────────────────────────────────────────╮");
    println!("  │   ▶  U N I S O N   S E R V E R           │");
    println!("  │      One timeline, every screen          │");
    println!("  ├──────────────────────────────────────────┤");
    println!("  │   Version:   {:<27} │", version);
    println!("  │   Control:   {:<27} │", format!("{addr}:{port}"));
    println!("  │   Playlist:  {:<27} │", format!("{tracks} track(s)"));
    println!("  ╰──────────────────────────────────────────╯");
    println!();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "unison_server=info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    let control_address = env::var("UNISON_CONTROL_ADDR").unwrap_or_else(|_| "0.0.0.0".into());
    let control_port: u16 = env::var("UNISON_CONTROL_PORT")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(3695);
    let clock_address =
        env::var("UNISON_CLOCK_ADDR").unwrap_or_else(|_| control_address.clone());
    let clock_port: u16 = env::var("UNISON_CLOCK_PORT")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(3696);
    let latency = env::var("UNISON_LATENCY_MS")
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .map(|ms| ms * MSECOND)
        .unwrap_or(DEFAULT_LATENCY);
    let stream_start_delay = env::var("UNISON_START_DELAY_MS")
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .map(|ms| ms * MSECOND)
        .unwrap_or(0);

    let playlist_path =
        env::var("UNISON_PLAYLIST").context("UNISON_PLAYLIST must point at a playlist file")?;
    let tracks = load_playlist(&playlist_path)
        .with_context(|| format!("could not load playlist {playlist_path}"))?;

    print_banner(&control_address, control_port, tracks.len());

    let config = ServerConfig {
        control_address,
        control_port,
        clock_address,
        clock_port,
        latency,
        stream_start_delay,
        tracks,
        transforms: HashMap::new(),
    };

    let server = SyncServer::new(config, Arc::new(SystemClock::new()));
    server.start().await?;

    // Surface join/leave and playlist progress in the log.
    let mut events = server.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::info!(?event, "server event");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.stop().await;
    Ok(())
}

/// Playlist file: one `URI SPACE DURATION_NS` per line; `-1` means unknown.
fn load_playlist(path: impl AsRef<Path>) -> anyhow::Result<Vec<Track>> {
    let contents = std::fs::read_to_string(path)?;
    let mut tracks = Vec::new();

    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (uri, duration) = line
            .rsplit_once(' ')
            .with_context(|| format!("line {}: expected `URI DURATION_NS`", lineno + 1))?;
        let duration = match duration {
            "-1" => DURATION_UNKNOWN,
            value => value
                .parse::<u64>()
                .with_context(|| format!("line {}: bad duration {value:?}", lineno + 1))?,
        };
        tracks.push(Track::new(uri.trim(), duration));
    }

    if tracks.is_empty() {
        anyhow::bail!("playlist has no tracks");
    }
    Ok(tracks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_playlist(name: &str, contents: &str) -> std::path::PathBuf {
        let path = env::temp_dir().join(format!("unison-{name}-{}.txt", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn parses_playlist_lines() {
        let path = write_playlist("ok", "http://media/a.mkv 10000000000\n\nrtsp://cam/live -1\n");
        let tracks = load_playlist(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0], Track::new("http://media/a.mkv", 10_000_000_000));
        assert_eq!(tracks[1], Track::new("rtsp://cam/live", DURATION_UNKNOWN));
    }

    #[test]
    fn rejects_missing_duration() {
        let path = write_playlist("bad", "just-a-uri-no-duration\n");
        let result = load_playlist(&path);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }
}
