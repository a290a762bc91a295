//! Shared fixtures for relay-core integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::connection::{Connection, ConnectionHandle, ConnectionId, Principal};
use relay_core::collaborators::IdentityProvider;
use relay_core::protocol::ServerFrame;
use relay_core::routing::RoomTransport;
use relay_core::RelayError;
use serde_json::Value;

/// Frames received by one mock connection.
#[derive(Default)]
pub struct Inbox {
    frames: Mutex<Vec<ServerFrame>>,
}

impl Inbox {
    pub fn push(&self, frame: ServerFrame) {
        self.frames.lock().push(frame);
    }

    pub fn frames(&self) -> Vec<ServerFrame> {
        self.frames.lock().clone()
    }

    /// `(correlation id, payload)` of every reply, in arrival order.
    pub fn replies(&self) -> Vec<(Value, Value)> {
        self.frames
            .lock()
            .iter()
            .filter_map(|f| match f {
                ServerFrame::Reply { id, payload } => Some((id.clone(), payload.clone())),
                _ => None,
            })
            .collect()
    }

    /// `(event, args)` of every pushed event.
    pub fn events(&self) -> Vec<(String, Vec<Value>)> {
        self.frames
            .lock()
            .iter()
            .filter_map(|f| match f {
                ServerFrame::Event { event, args } => Some((event.clone(), args.clone())),
                _ => None,
            })
            .collect()
    }
}

/// Room membership kept the way a socket transport would.
#[derive(Default)]
pub struct MockRooms {
    members: Mutex<HashMap<String, Vec<Arc<Inbox>>>>,
}

impl MockRooms {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn members(&self, room: &str) -> usize {
        self.members.lock().get(room).map(Vec::len).unwrap_or(0)
    }

    fn join(&self, room: &str, inbox: &Arc<Inbox>) {
        let mut members = self.members.lock();
        let list = members.entry(room.to_string()).or_default();
        if !list.iter().any(|m| Arc::ptr_eq(m, inbox)) {
            list.push(Arc::clone(inbox));
        }
    }

    fn leave(&self, room: &str, inbox: &Arc<Inbox>) {
        let mut members = self.members.lock();
        if let Some(list) = members.get_mut(room) {
            list.retain(|m| !Arc::ptr_eq(m, inbox));
            if list.is_empty() {
                members.remove(room);
            }
        }
    }

    fn leave_all(&self, inbox: &Arc<Inbox>) {
        let mut members = self.members.lock();
        for list in members.values_mut() {
            list.retain(|m| !Arc::ptr_eq(m, inbox));
        }
        members.retain(|_, list| !list.is_empty());
    }
}

impl RoomTransport for MockRooms {
    fn emit_to_room(&self, room: &str, frame: ServerFrame) -> usize {
        let members = self.members.lock();
        let Some(list) = members.get(room) else {
            return 0;
        };
        for inbox in list {
            inbox.push(frame.clone());
        }
        list.len()
    }
}

/// Connection handle recording everything sent to it.
pub struct MockHandle {
    pub inbox: Arc<Inbox>,
    rooms: Arc<MockRooms>,
    closed: AtomicBool,
}

impl MockHandle {
    pub fn new(rooms: &Arc<MockRooms>) -> Arc<Self> {
        Arc::new(Self {
            inbox: Arc::new(Inbox::default()),
            rooms: Arc::clone(rooms),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ConnectionHandle for MockHandle {
    fn send(&self, frame: ServerFrame) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::transport("connection closed"));
        }
        self.inbox.push(frame);
        Ok(())
    }

    fn join(&self, room: &str) {
        self.rooms.join(room, &self.inbox);
    }

    fn leave(&self, room: &str) {
        self.rooms.leave(room, &self.inbox);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.rooms.leave_all(&self.inbox);
    }
}

/// A standalone connection with a mock handle, not registered anywhere.
pub fn connection(
    id: &str,
    user: Option<Principal>,
    session: &str,
) -> (Connection, Arc<MockHandle>) {
    let rooms = MockRooms::new();
    let handle = MockHandle::new(&rooms);
    let conn = Connection::new(ConnectionId::from(id), user, session, handle.clone());
    (conn, handle)
}

/// Identity provider that rejects every principal.
pub struct RevokedIdentity;

#[async_trait]
impl IdentityProvider for RevokedIdentity {
    async fn refresh(&self, principal: &Principal) -> Result<Principal, RelayError> {
        Err(RelayError::unauthorized(format!("{} was revoked", principal.id)))
    }
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(1), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met within 1s");
}
