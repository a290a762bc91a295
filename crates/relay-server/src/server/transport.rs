//! WebSocket side of connection handles and rooms.
//!
//! Each socket gets a bounded outbound queue drained by its writer task.
//! Rooms map a name to the queues of their members.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use relay_core::protocol::ServerFrame;
use relay_core::{ConnectionHandle, RelayError, RoomTransport};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct WsTransport {
    rooms: DashMap<String, HashMap<u64, mpsc::Sender<ServerFrame>>>,
    next_key: AtomicU64,
}

impl WsTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a handle with an outbound queue of `capacity` frames.
    pub fn open(self: &Arc<Self>, capacity: usize) -> (Arc<WsHandle>, mpsc::Receiver<ServerFrame>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = Arc::new(WsHandle {
            key: self.next_key.fetch_add(1, Ordering::Relaxed),
            sender,
            transport: Arc::clone(self),
            closed: CancellationToken::new(),
            dropped: AtomicU64::new(0),
        });
        (handle, receiver)
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.get(room).map(|members| members.len()).unwrap_or(0)
    }

    fn add_member(&self, room: &str, key: u64, sender: mpsc::Sender<ServerFrame>) {
        self.rooms.entry(room.to_string()).or_default().insert(key, sender);
    }

    fn remove_member(&self, room: &str, key: u64) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(&key);
        }
        self.rooms.remove_if(room, |_, members| members.is_empty());
    }

    fn remove_everywhere(&self, key: u64) {
        self.rooms.retain(|_, members| {
            members.remove(&key);
            !members.is_empty()
        });
    }
}

impl RoomTransport for WsTransport {
    fn emit_to_room(&self, room: &str, frame: ServerFrame) -> usize {
        let Some(members) = self.rooms.get(room) else {
            return 0;
        };
        members
            .values()
            .filter(|sender| sender.try_send(frame.clone()).is_ok())
            .count()
    }
}

/// Handle for one WebSocket connection.
#[derive(Debug)]
pub struct WsHandle {
    key: u64,
    sender: mpsc::Sender<ServerFrame>,
    transport: Arc<WsTransport>,
    closed: CancellationToken,
    dropped: AtomicU64,
}

impl WsHandle {
    /// Cancelled once the connection is asked to close.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Frames dropped because the outbound queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ConnectionHandle for WsHandle {
    fn send(&self, frame: ServerFrame) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::transport("connection closed"));
        }
        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "Outbound queue full, dropping frame");
                RelayError::transport("outbound queue full")
            }
            mpsc::error::TrySendError::Closed(_) => RelayError::transport("connection closed"),
        })
    }

    fn join(&self, room: &str) {
        if !self.is_closed() {
            self.transport.add_member(room, self.key, self.sender.clone());
        }
    }

    fn leave(&self, room: &str) {
        self.transport.remove_member(room, self.key);
    }

    fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(key = self.key, "Closing WebSocket handle");
            self.closed.cancel();
        }
        self.transport.remove_everywhere(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_queues_frames() {
        let transport = WsTransport::new();
        let (handle, mut rx) = transport.open(4);

        handle.send(ServerFrame::Pong).unwrap();
        assert_eq!(rx.recv().await, Some(ServerFrame::Pong));
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let transport = WsTransport::new();
        let (handle, _rx) = transport.open(1);

        handle.send(ServerFrame::Pong).unwrap();
        assert!(handle.send(ServerFrame::Pong).is_err());
        assert_eq!(handle.dropped(), 1);
    }

    #[tokio::test]
    async fn test_rooms_fan_out_and_close_leaves_all() {
        let transport = WsTransport::new();
        let (a, mut rx_a) = transport.open(4);
        let (b, mut rx_b) = transport.open(4);

        a.join("lobby");
        b.join("lobby");
        a.join("user.alice");
        assert_eq!(transport.room_size("lobby"), 2);

        let frame = ServerFrame::event("hello", vec![]);
        assert_eq!(transport.emit_to_room("lobby", frame.clone()), 2);
        assert_eq!(rx_a.recv().await, Some(frame.clone()));
        assert_eq!(rx_b.recv().await, Some(frame));

        a.close();
        assert!(a.is_closed());
        assert_eq!(transport.room_size("lobby"), 1);
        assert_eq!(transport.room_size("user.alice"), 0);
        assert!(a.send(ServerFrame::Pong).is_err());

        b.leave("lobby");
        assert_eq!(transport.emit_to_room("lobby", ServerFrame::Pong), 0);
    }
}
