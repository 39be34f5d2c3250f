use std::collections::BTreeSet;

use tokio::sync::{mpsc, oneshot};
use tracing::info;

use super::messages::ClientEvent;
use super::router::SignalingRouter;
use super::types::{ConnectionId, OutboundMessage, RoomId, SignalingError};

/// Commands sent to the supervisor actor
pub(crate) enum RouterCommand {
    Connect {
        peer_tx: mpsc::UnboundedSender<OutboundMessage>,
        reply: oneshot::Sender<ConnectionId>,
    },
    Event {
        from: ConnectionId,
        event: ClientEvent,
    },
    Disconnect {
        id: ConnectionId,
        done: Option<oneshot::Sender<()>>,
    },
    MembersOf {
        room: RoomId,
        reply: oneshot::Sender<BTreeSet<ConnectionId>>,
    },
}

/// Owns the router. Commands run one at a time, so every room mutation and
/// every disconnect cleanup is serialized.
pub(crate) async fn supervisor_actor(mut rx: mpsc::Receiver<RouterCommand>) {
    let mut router = SignalingRouter::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            RouterCommand::Connect { peer_tx, reply } => {
                let id = router.connect(peer_tx);
                if reply.send(id).is_err() {
                    // connection task vanished before the reply
                    close_connection(&mut router, id);
                }
            }

            RouterCommand::Event { from, event } => router.dispatch(from, event),

            RouterCommand::Disconnect { id, done } => {
                close_connection(&mut router, id);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }

            RouterCommand::MembersOf { room, reply } => {
                let _ = reply.send(router.directory().members_of(&room));
            }
        }
    }

    info!(
        "Supervisor stopped with {} connections and {} rooms",
        router.registry().len(),
        router.directory().room_count()
    );
}

/// Leave every room the connection belongs to, notifying the remaining
/// members, then drop its identity. Graceful and abrupt closes both end here.
pub(crate) fn close_connection(router: &mut SignalingRouter, id: ConnectionId) {
    if !router.registry().exists(&id) {
        return;
    }

    let rooms = router.registry().rooms_of(&id);
    for room in &rooms {
        router.leave_room(id, room);
    }

    let leftover = router.unregister(&id);
    debug_assert!(leftover.is_empty(), "{} still in {:?}", id, leftover);
    info!("Connection {} closed ({} rooms cleaned up)", id, rooms.len());
}

/// Handle to communicate with the supervisor actor
#[derive(Clone)]
pub struct RouterHandle {
    pub(crate) tx: mpsc::Sender<RouterCommand>,
}

impl RouterHandle {
    /// Spawn the supervisor on the current runtime.
    pub fn spawn(command_buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel::<RouterCommand>(command_buffer.max(1));
        tokio::spawn(supervisor_actor(rx));
        Self { tx }
    }

    /// Register a new transport channel
    pub async fn connect(
        &self,
        peer_tx: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Result<ConnectionId, SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RouterCommand::Connect {
                peer_tx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SignalingError::Internal("actor channel closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| SignalingError::Internal("actor channel closed".to_string()))
    }

    /// Hand an inbound event to the router. Events from one connection are
    /// processed in the order they were submitted.
    pub async fn dispatch(&self, from: ConnectionId, event: ClientEvent) {
        let _ = self.tx.send(RouterCommand::Event { from, event }).await;
    }

    /// Run disconnect cleanup and wait until it has finished.
    pub async fn disconnect(&self, id: ConnectionId) {
        let (done_tx, done_rx) = oneshot::channel();
        let sent = self
            .tx
            .send(RouterCommand::Disconnect {
                id,
                done: Some(done_tx),
            })
            .await;
        if sent.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Snapshot of a room's members
    pub async fn members_of(&self, room: RoomId) -> Result<BTreeSet<ConnectionId>, SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RouterCommand::MembersOf {
                room,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SignalingError::Internal("actor channel closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| SignalingError::Internal("actor channel closed".to_string()))
    }
}
