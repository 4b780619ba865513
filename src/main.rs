//! # DB Link
//!
//! DroneBridge raw link receiver.
//!
//! Opens one kernel-filtered receive socket for the configured
//! (communication id, direction, port) triple and counts the frames that
//! reach user space.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::unix::AsyncFd;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use db_link::config::{Config, LoggingConfig};
use db_link::link::{open_receive_link, LinkSocket};
use db_link::protocol::addressing::ETHER_TYPE_DB;
use db_link::protocol::{CommId, Direction, OperatingMode, Port, RawFrameView};

/// Configuration file used when no path is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Number of frames between status log messages
const LOG_INTERVAL_FRAMES: u64 = 1000;

/// Ethernet header length in WIFI_COMPAT captures
const ETHERNET_HEADER_LEN: usize = 14;

/// Frame counters of one receiver
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct FrameStats {
    accepted: u64,
    malformed: u64,
    foreign: u64,
    bytes: u64,
}

/// What the read loop does with each capture
struct FrameSink {
    mode: OperatingMode,
    comm_id: CommId,
    direction: Direction,
    port: Port,
    stats: FrameStats,
    last_log: u64,
}

impl FrameSink {
    fn new(config: &Config) -> Self {
        Self {
            mode: config.link.mode,
            comm_id: config.link.comm_id,
            direction: config.link.direction,
            port: config.link.port,
            stats: FrameStats::default(),
            last_log: 0,
        }
    }

    /// Classify one capture and update the counters
    fn handle(&mut self, frame: &[u8]) {
        match self.mode {
            OperatingMode::Monitor => match RawFrameView::parse(frame) {
                // The kernel filter already matched; re-check in case a frame
                // was queued before the filter was attached
                Ok(view) if view.matches(self.comm_id, self.direction, self.port) => {
                    self.stats.accepted += 1;
                    self.stats.bytes += view.tail().len() as u64;
                    debug!("Frame on port {}: {} payload bytes", view.port(), view.tail().len());
                }
                Ok(_) => self.stats.foreign += 1,
                Err(e) => {
                    self.stats.malformed += 1;
                    debug!("Dropping capture: {}", e);
                }
            },
            OperatingMode::WifiCompat => {
                if frame.len() < ETHERNET_HEADER_LEN {
                    self.stats.malformed += 1;
                } else if u16::from_be_bytes([frame[12], frame[13]]) == ETHER_TYPE_DB {
                    self.stats.accepted += 1;
                    self.stats.bytes += (frame.len() - ETHERNET_HEADER_LEN) as u64;
                } else {
                    self.stats.foreign += 1;
                }
            }
        }

        if self.stats.accepted - self.last_log >= LOG_INTERVAL_FRAMES {
            info!(
                "Received {} frames on port {} ({} bytes, {} foreign, {} malformed)",
                self.stats.accepted,
                self.port,
                self.stats.bytes,
                self.stats.foreign,
                self.stats.malformed
            );
            self.last_log = self.stats.accepted;
        }
    }
}

/// Initialize logging to stdout, or to daily rolling files when a directory is set
///
/// `RUST_LOG` overrides the configured level.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.directory.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(&config.directory, "db-link.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Some(guard)
}

/// Read loop for non-blocking sockets, driven by the tokio reactor
async fn run_async(socket: LinkSocket, buffer_size: usize, sink: &mut FrameSink) -> Result<()> {
    let socket = AsyncFd::new(socket).context("Failed to register socket with the reactor")?;
    let mut buf = vec![0u8; buffer_size];

    loop {
        tokio::select! {
            ready = socket.readable() => {
                let mut guard = ready?;
                match guard.try_io(|inner| inner.get_ref().recv(&mut buf)) {
                    Ok(Ok(n)) => sink.handle(&buf[..n]),
                    Ok(Err(e)) => warn!("Receive failed: {}", e),
                    Err(_would_block) => continue,
                }
            }

            // Handle Ctrl+C for graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                return Ok(());
            }
        }
    }
}

/// Read loop for blocking sockets; each receive returns at least once per timeout
fn run_blocking(socket: LinkSocket, buffer_size: usize, sink: &mut FrameSink, stop: &AtomicBool) {
    let mut buf = vec![0u8; buffer_size];

    while !stop.load(Ordering::Relaxed) {
        match socket.recv(&mut buf) {
            Ok(n) => sink.handle(&buf[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(e) => warn!("Receive failed: {}", e),
        }
    }
}

/// Main entry point for DB Link
///
/// # Control Flow
///
/// 1. Load configuration (first argument, default `config/default.toml`)
/// 2. Set up logging
/// 3. Open the receive link and apply socket options
/// 4. Receive until Ctrl+C, logging counters every 1000 frames
///
/// # Errors
///
/// Returns error if the configuration is invalid or the link cannot be opened
/// (missing interface, missing `CAP_NET_RAW`, filter rejected, ...).
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path))?;

    let _log_guard = init_logging(&config.logging);

    info!("DB Link v{} starting...", env!("CARGO_PKG_VERSION"));
    info!(
        "Interface: {} Communication ID: {} Port: {}",
        config.link.interface, config.link.comm_id, config.link.port
    );

    let link = &config.link;
    let opened =
        open_receive_link(&link.interface, link.mode, link.comm_id, link.direction, link.port);
    let socket = match opened {
        Ok(socket) => socket,
        Err(e) => {
            error!("Could not open receive link: {}", e);
            return Err(e.into());
        }
    };

    let socket = if config.socket.receive_timeout_ms > 0 {
        let (secs, micros) = config.socket.receive_timeout();
        socket.set_receive_timeout(secs, micros)
    } else {
        socket
    };

    let mut sink = FrameSink::new(&config);
    let buffer_size = config.socket.buffer_size;

    if config.socket.nonblocking {
        let socket = socket.set_nonblocking()?;
        run_async(socket, buffer_size, &mut sink).await?;
    } else {
        let stop = Arc::new(AtomicBool::new(false));
        let worker = tokio::task::spawn_blocking({
            let stop = Arc::clone(&stop);
            move || {
                run_blocking(socket, buffer_size, &mut sink, &stop);
                sink
            }
        });

        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
        stop.store(true, Ordering::Relaxed);
        sink = worker.await.context("Receive worker panicked")?;
    }

    info!(
        "Total frames received: {} ({} bytes, {} foreign, {} malformed)",
        sink.stats.accepted, sink.stats.bytes, sink.stats.foreign, sink.stats.malformed
    );
    Ok(())
}
