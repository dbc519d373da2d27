//! hems-feeder: owns the serial line and publishes frames on the relay.
//!
//! Every frame read off the serial device is encoded as a
//! `serial <header> <payload>` line and fanned out to all connected
//! subscribers. Delivery is at most once: a subscriber that falls behind
//! loses messages.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn, Level};

use hems_core::config::{load_config, Config};
use hems_core::notify::WebhookNotifier;
use hems_core::{liveness, FrameReader, RelayMessage};

mod capture;

/// Messages buffered per subscriber before it starts losing them.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Parser)]
#[command(name = "hems-feeder", version, about = "Serial capture and relay publisher")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    /// Debug logging
    #[arg(short = 'D', long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read the serial device and publish frames
    Serve {
        /// Serial device (defaults to the config value)
        #[arg(short = 't', long, env = "HEMS_SERIAL_PORT")]
        serial_port: Option<PathBuf>,

        /// Address to listen on
        #[arg(short = 's', long, default_value = "0.0.0.0")]
        bind: String,

        /// Relay port (defaults to the config value)
        #[arg(short = 'p', long, env = "HEMS_SERVER_PORT")]
        server_port: Option<u16>,
    },

    /// Split a raw binary capture into relay lines on stdout
    Split { file: PathBuf },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli.config).unwrap_or_else(|e| {
        error!("Error loading config {}: {e}", cli.config.display());
        std::process::exit(1);
    });

    match cli.command {
        Commands::Serve {
            serial_port,
            bind,
            server_port,
        } => {
            let serial = serial_port.unwrap_or_else(|| config.serial.port.clone());
            let port = server_port.unwrap_or(config.relay.port);
            cmd_serve(&config, &serial, &bind, port).await
        }
        Commands::Split { file } => cmd_split(&file),
    }
}

fn cmd_split(file: &Path) {
    let lines = capture::split_file(file).unwrap_or_else(|e| {
        error!("Error reading {}: {e}", file.display());
        std::process::exit(1);
    });
    for line in &lines {
        println!("{line}");
    }
    info!("{} frame(s)", lines.len());
}

/// Report a fatal error through the webhook, if one is configured.
async fn notify_failure(config: &Config, detail: &str) -> bool {
    match &config.webhook {
        Some(webhook) => {
            WebhookNotifier::from_config(webhook)
                .notify_error("hems-feeder failed", detail)
                .await
        }
        None => false,
    }
}

async fn cmd_serve(config: &Config, serial: &Path, bind: &str, port: u16) {
    let addr = format!("{bind}:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind relay to {addr}: {e}");
            std::process::exit(1);
        }
    };
    info!("Relay listening on {addr}");

    let port_handle = match capture::open_serial(serial, config.serial.baud) {
        Ok(p) => p,
        Err(e) => {
            error!("Error opening serial port {}: {e}", serial.display());
            notify_failure(config, &format!("open {}: {e}", serial.display())).await;
            std::process::exit(1);
        }
    };

    let (tx, _) = broadcast::channel::<Arc<str>>(CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown) = watch::channel(false);
    let stop = Arc::new(AtomicBool::new(false));

    let mut reader_handle = {
        let tx = tx.clone();
        let stop = stop.clone();
        let liveness_file = config.liveness.serial.clone();
        tokio::task::spawn_blocking(move || {
            let mut reader = FrameReader::new(port_handle);
            capture::capture(&mut reader, &stop, capture::OnIdle::Wait, |frame| {
                let line = RelayMessage::encode(&frame);
                debug!("Publish {line}");
                // No subscribers is fine; the frame is simply dropped.
                let _ = tx.send(Arc::from(line));
                if let Err(e) = liveness::touch(&liveness_file) {
                    warn!("Failed to update liveness file {}: {e}", liveness_file.display());
                }
            })
        })
    };

    let accept_handle = tokio::spawn(accept_loop(listener, tx, shutdown));

    // A dead serial line ends the relay as well.
    let finished = tokio::select! {
        _ = wait_for_signal() => None,
        result = &mut reader_handle => Some(result),
    };
    stop.store(true, Ordering::Relaxed);
    let _ = shutdown_tx.send(true);

    let _ = accept_handle.await;
    let result = match finished {
        Some(result) => result,
        // The blocking read returns at the next serial timeout.
        None => reader_handle.await,
    };
    match result {
        Ok(Ok(stats)) => info!(
            "Serial capture stopped: {} frame(s), {} short read(s)",
            stats.frames, stats.short
        ),
        Ok(Err(e)) => {
            error!("Serial read failed: {e}");
            notify_failure(config, &format!("serial read: {e}")).await;
            std::process::exit(1);
        }
        Err(e) => error!("Serial reader task failed: {e}"),
    }
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    warn!("Shutdown requested");
}

async fn accept_loop(
    listener: TcpListener,
    tx: broadcast::Sender<Arc<str>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let subscriber_shutdown = shutdown.clone();
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            result = listener.accept() => match result {
                Ok((socket, peer)) => {
                    info!("Subscriber connected: {peer}");
                    tokio::spawn(publish(socket, tx.subscribe(), subscriber_shutdown.clone()));
                }
                Err(e) => warn!("Accept error: {e}"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    info!("Relay shutting down");
}

async fn publish(
    mut socket: TcpStream,
    mut rx: broadcast::Receiver<Arc<str>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            msg = rx.recv() => match msg {
                Ok(line) => {
                    let mut data = Vec::with_capacity(line.len() + 1);
                    data.extend_from_slice(line.as_bytes());
                    data.push(b'\n');
                    if socket.write_all(&data).await.is_err() {
                        debug!("Subscriber went away");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Subscriber lagging, dropped {n} message(s)");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn test_fan_out_to_subscribers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, _) = broadcast::channel::<Arc<str>>(16);
        let (shutdown_tx, shutdown) = watch::channel(false);
        let server = tokio::spawn(accept_loop(listener, tx.clone(), shutdown));

        let a = TcpStream::connect(addr).await.unwrap();
        let b = TcpStream::connect(addr).await.unwrap();
        // Wait for both subscriptions to register.
        while tx.receiver_count() < 2 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        tx.send(Arc::from("serial 5a00 010203")).unwrap();

        for stream in [a, b] {
            let mut lines = BufReader::new(stream).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            assert_eq!(line, "serial 5a00 010203");
        }

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_notify_failure_posts_webhook() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hook = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !String::from_utf8_lossy(&request).contains("serial read") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });

        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.webhook = Some(hems_core::config::WebhookConfig {
            url: format!("http://{addr}/hook"),
            interval_min: 60,
            stamp: dir.path().join("webhook.stamp"),
        });

        assert!(notify_failure(&config, "serial read: device disconnected").await);
        let request = hook.await.unwrap();
        assert!(request.starts_with("POST /hook"));
        assert!(request.contains("hems-feeder failed"));
        assert!(dir.path().join("webhook.stamp").exists());
    }

    #[tokio::test]
    async fn test_notify_failure_without_webhook() {
        assert!(!notify_failure(&Config::default(), "serial read: gone").await);
    }

    #[tokio::test]
    async fn test_publish_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();

        let (tx, _) = broadcast::channel::<Arc<str>>(16);
        let (shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(publish(socket, tx.subscribe(), shutdown));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        drop(client);
    }
}
