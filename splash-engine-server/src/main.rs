mod message;

use crate::message::{ClientMessage, ServerMessage};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use splash_engine::{
    EngineConfig, SplashEngine, SplashEvent, TierSet,
    feed::mexc::{MEXC_CONTRACT_TICKER_URL, MexcFeed},
    notify::BroadcastNotifier,
    persistence::{InMemoryRepository, SplashRepository, SqliteRepository},
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc},
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const DEFAULT_WS_PORT: u16 = 9002;
const DEFAULT_WS_BUFFER_SIZE: usize = 1_000;

#[tokio::main]
async fn main() {
    init_logging();

    info!("Starting splash engine server");

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "invalid engine configuration");
            std::process::exit(1);
        }
    };

    // Configurable buffer size via WS_BUFFER_SIZE env var
    let buffer_size = std::env::var("WS_BUFFER_SIZE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_WS_BUFFER_SIZE);
    info!("WebSocket broadcast buffer size: {}", buffer_size);
    let notifier = BroadcastNotifier::new(buffer_size);

    let feed_url =
        std::env::var("MEXC_TICKER_URL").unwrap_or_else(|_| MEXC_CONTRACT_TICKER_URL.to_string());
    let feed = match MexcFeed::new(feed_url.clone()) {
        Ok(feed) => feed,
        Err(error) => {
            error!(%error, "failed to build ticker feed client");
            std::process::exit(1);
        }
    };
    info!("Polling tickers from {}", feed_url);

    // Configurable via SPLASH_DB_PATH env var
    let repository: Arc<dyn SplashRepository> = match std::env::var("SPLASH_DB_PATH") {
        Ok(path) => match SqliteRepository::open(&path) {
            Ok(repository) => Arc::new(repository),
            Err(error) => {
                error!(%error, "failed to open splash record database at {}", path);
                std::process::exit(1);
            }
        },
        Err(_) => {
            warn!("SPLASH_DB_PATH not set, splash records are kept in memory only");
            Arc::new(InMemoryRepository::new())
        }
    };

    let engine = SplashEngine::new(config, feed, repository, Arc::new(notifier.clone()));

    // Configurable via WS_ADDR env var
    let server_addr = std::env::var("WS_ADDR")
        .ok()
        .and_then(|addr| addr.parse::<SocketAddr>().ok())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], DEFAULT_WS_PORT)));
    let listener = match TcpListener::bind(server_addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(%error, "failed to bind WebSocket server to {}", server_addr);
            std::process::exit(1);
        }
    };
    info!("WebSocket server listening on ws://{}", server_addr);

    tokio::spawn(start_websocket_server(listener, notifier, engine.tiers()));

    engine
        .run(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                error!(%error, "failed to listen for ctrl-c, running until killed");
                std::future::pending::<()>().await;
            }
        })
        .await;
}

/// Accept WebSocket clients and hand each one the splash event stream.
async fn start_websocket_server(
    listener: TcpListener,
    notifier: BroadcastNotifier,
    tiers: Arc<TierSet>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                info!("New WebSocket connection from {}", peer_addr);
                tokio::spawn(handle_client(
                    stream,
                    peer_addr,
                    notifier.subscribe(),
                    Arc::clone(&tiers),
                ));
            }
            Err(error) => {
                warn!(%error, "failed to accept WebSocket connection");
            }
        }
    }
}

/// Handle individual WebSocket client connection
async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    mut events: broadcast::Receiver<SplashEvent>,
    tiers: Arc<TierSet>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", peer_addr, e);
            return;
        }
    };

    info!("WebSocket handshake completed for {}", peer_addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Replies to this client only, events are interleaved with them
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let _ = reply_tx.send(ServerMessage::Welcome {
        message: "Connected to splash engine".to_string(),
        tiers: tiers.snapshot().as_ref().clone(),
        timestamp: Utc::now(),
    });

    let mut send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                reply = reply_rx.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(event) => ServerMessage::Splash(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Slow client, skip ahead rather than disconnect
                        warn!("Client {} lagged, skipped {} splash events", peer_addr, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Broadcast channel closed for {}", peer_addr);
                        break;
                    }
                },
            };

            match serde_json::to_string(&message) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(error) => warn!(%error, "failed to serialise message for {}", peer_addr),
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) => {
                    debug!("Received ping from {}", peer_addr);
                }
                Ok(Message::Text(text)) => {
                    let reply = apply_client_message(&tiers, text.as_str(), peer_addr);
                    if reply_tx.send(reply).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("WebSocket error for {}: {}", peer_addr, e);
                    break;
                }
                _ => {}
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    info!("WebSocket connection closed for {}", peer_addr);
}

/// Apply one client message and build the reply for that client.
fn apply_client_message(tiers: &TierSet, text: &str, peer_addr: SocketAddr) -> ServerMessage {
    match ClientMessage::parse(text) {
        Ok(ClientMessage::UpdateConfig { tiers: update }) => {
            info!(
                tiers = update.len(),
                "Tier configuration updated by {}", peer_addr
            );
            tiers.replace(update);
            ServerMessage::ConfigUpdated {
                tiers: tiers.snapshot().as_ref().clone(),
                timestamp: Utc::now(),
            }
        }
        Err(message) => {
            warn!("Rejected message from {}: {}", peer_addr, message);
            ServerMessage::Error { message }
        }
    }
}

/// Initialize logging
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // Structured output for log shippers via LOG_FORMAT=json
    if std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
