use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, header};
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tracing::{debug, error, info, warn};

use super::actor::RouterHandle;
use super::messages::ClientEvent;
use super::types::{ConnectionId, OutboundMessage, SignalingError};
use crate::config::{AllowedOrigins, SignalingConfig};

/// How long the writer gets to flush queued frames and the close frame
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Heartbeat {
    ping_interval: Duration,
    pong_timeout: Duration,
}

pub struct SignalingServer {
    listener: TcpListener,
    handle: RouterHandle,
    heartbeat: Heartbeat,
    origins: Arc<AllowedOrigins>,
}

impl SignalingServer {
    /// Bind the listener and start the supervisor
    pub async fn bind(config: &SignalingConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("Signaling server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            handle: RouterHandle::spawn(config.command_buffer),
            heartbeat: Heartbeat {
                // interval() panics on a zero period
                ping_interval: config.ping_interval.max(Duration::from_millis(1)),
                pong_timeout: config.pong_timeout,
            },
            origins: Arc::new(config.allowed_origins.clone()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> RouterHandle {
        self.handle.clone()
    }

    pub async fn run(self) -> std::io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> std::io::Result<()> {
        tokio::pin!(shutdown);

        loop {
            let (stream, addr) = tokio::select! {
                accepted = self.listener.accept() => accepted?,
                _ = &mut shutdown => {
                    info!("Signaling server shutting down");
                    return Ok(());
                }
            };
            let handle = self.handle.clone();
            let heartbeat = self.heartbeat;
            let origins = Arc::clone(&self.origins);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, handle, heartbeat, origins).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handle: RouterHandle,
    heartbeat: Heartbeat,
    origins: Arc<AllowedOrigins>,
) -> Result<(), SignalingError> {
    let check_origin = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let origin = req
            .headers()
            .get(header::ORIGIN)
            .map(|value| value.to_str().unwrap_or_default());
        if origins.permits(origin) {
            return Ok(resp);
        }
        warn!("Refusing {} from origin {:?}", addr, origin.unwrap_or_default());
        let mut refusal = ErrorResponse::new(Some("origin not allowed".to_owned()));
        *refusal.status_mut() = StatusCode::FORBIDDEN;
        Err(refusal)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, check_origin).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundMessage>();
    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Message>();

    let conn_id = handle.connect(tx).await?;
    info!("WebSocket connection from {} as {}", addr, conn_id);

    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(msg) = rx.recv() => {
                    let ws_msg = Message::Text(msg.into_inner());
                    if ws_tx.send(ws_msg).await.is_err() {
                        break;
                    }
                }
                Some(ctrl_msg) = ctrl_rx.recv() => {
                    if ws_tx.send(ctrl_msg).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
        // completes the closing handshake, or starts one if we hung up
        let _ = ws_tx.close().await;
    });

    let mut ping_interval = tokio::time::interval(heartbeat.ping_interval);
    // the first tick completes immediately
    ping_interval.tick().await;
    let mut waiting_for_pong = false;
    let mut pong_deadline: Option<tokio::time::Instant> = None;

    loop {
        let pong_timeout = async {
            match pong_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = ping_interval.tick() => {
                if waiting_for_pong {
                    warn!("No Pong received, disconnecting {}", conn_id);
                    break;
                }
                if ctrl_tx.send(Message::Ping(Bytes::new())).is_err() {
                    break;
                }
                waiting_for_pong = true;
                pong_deadline = Some(tokio::time::Instant::now() + heartbeat.pong_timeout);
                debug!("Ping sent to {}", conn_id);
            }

            _ = pong_timeout => {
                warn!("Pong timeout, disconnecting {}", conn_id);
                break;
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", conn_id, e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => handle_text_message(&text, conn_id, &handle).await,
                    Message::Pong(_) => {
                        waiting_for_pong = false;
                        pong_deadline = None;
                        debug!("Pong received from {}", conn_id);
                    }
                    Message::Close(_) => {
                        info!("Close received from {}", conn_id);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // the registry drops the other sender, so the writer drains and exits
    handle.disconnect(conn_id).await;
    drop(ctrl_tx);

    if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }
    info!("WebSocket disconnected: {} ({})", conn_id, addr);

    Ok(())
}

/// Malformed frames are logged and dropped; nothing is sent back.
async fn handle_text_message(text: &str, conn_id: ConnectionId, handle: &RouterHandle) {
    match ClientEvent::parse(text) {
        Ok(event) => {
            debug!("{} from {}", event.event_name(), conn_id);
            handle.dispatch(conn_id, event).await;
        }
        Err(e) => warn!("Ignoring frame from {}: {}", conn_id, e),
    }
}
