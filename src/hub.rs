//! Connection and room registry.
//!
//! ## Design
//! - HubStore: Arc<Mutex<Hub>>, shared across all socket tasks
//! - Every connection owns an unbounded outbound channel; the socket task
//!   drains it into the WebSocket sink
//! - Rooms are plain member sets keyed by name; fan-out walks the set and
//!   pushes into each member's channel
//!
//! ## Room lifecycle
//! 1. A connection joins "lobby" → the room is created implicitly
//! 2. Further joins add members; joining another room keeps the old membership
//! 3. Disconnect drops the connection from every room it joined
//! 4. Rooms are never destroyed, even when empty
//!
//! The lock is never held across an `.await`.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use crate::protocol::{Audience, ConnectionId, ServerEvent};

/// Shared hub handle.
pub type HubStore = Arc<Mutex<Hub>>;

/// A registered socket connection.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub outbound: mpsc::UnboundedSender<ServerEvent>,
    pub rooms: BTreeSet<String>,
    pub connected_at_ms: u64,
}

/// A broadcast scope.
#[derive(Debug, Clone)]
pub struct Room {
    pub name: String,
    pub members: BTreeSet<ConnectionId>,
    pub created_at_ms: u64,
}

#[derive(Debug, Default)]
pub struct Hub {
    pub connections: HashMap<ConnectionId, Connection>,
    pub rooms: HashMap<String, Room>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("connection '{0}' is not registered")]
    UnknownConnection(ConnectionId),
    #[error("hub lock poisoned")]
    Poisoned,
}

// ---------------------------------------------------------------------------
// Constructor helpers
// ---------------------------------------------------------------------------

pub fn new_hub_store() -> HubStore {
    Arc::new(Mutex::new(Hub::default()))
}

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

/// Register a new connection, returning its id and the receiving end of its
/// outbound channel.
pub fn connect(
    store: &HubStore,
) -> Result<(ConnectionId, mpsc::UnboundedReceiver<ServerEvent>), HubError> {
    let mut hub = store.lock().map_err(|_| HubError::Poisoned)?;
    let (tx, rx) = mpsc::unbounded_channel();
    let id = uuid::Uuid::new_v4().to_string();
    hub.connections.insert(
        id.clone(),
        Connection {
            id: id.clone(),
            outbound: tx,
            rooms: BTreeSet::new(),
            connected_at_ms: now_ms(),
        },
    );
    Ok((id, rx))
}

/// Remove a connection and its memberships.
///
/// Returns the rooms it was in, or `None` if the id was unknown.
pub fn disconnect(store: &HubStore, id: &str) -> Option<Vec<String>> {
    let mut hub = store.lock().ok()?;
    let conn = hub.connections.remove(id)?;
    for name in &conn.rooms {
        if let Some(room) = hub.rooms.get_mut(name) {
            room.members.remove(id);
        }
    }
    Some(conn.rooms.into_iter().collect())
}

// ---------------------------------------------------------------------------
// Rooms
// ---------------------------------------------------------------------------

/// Add a connection to a room, creating the room on first join.
///
/// Membership is additive. Returns the room's member count after the join.
pub fn join_room(store: &HubStore, id: &str, room: &str) -> Result<usize, HubError> {
    let mut hub = store.lock().map_err(|_| HubError::Poisoned)?;
    let conn = hub
        .connections
        .get_mut(id)
        .ok_or_else(|| HubError::UnknownConnection(id.to_string()))?;
    conn.rooms.insert(room.to_string());

    let entry = hub.rooms.entry(room.to_string()).or_insert_with(|| Room {
        name: room.to_string(),
        members: BTreeSet::new(),
        created_at_ms: now_ms(),
    });
    entry.members.insert(id.to_string());
    Ok(entry.members.len())
}

/// Current members of a room, sorted. Empty for unknown rooms.
pub fn room_members(store: &HubStore, room: &str) -> Vec<ConnectionId> {
    store
        .lock()
        .ok()
        .and_then(|hub| hub.rooms.get(room).map(|r| r.members.iter().cloned().collect()))
        .unwrap_or_default()
}

/// Rooms a connection has joined, sorted.
pub fn rooms_of(store: &HubStore, id: &str) -> Vec<String> {
    store
        .lock()
        .ok()
        .and_then(|hub| hub.connections.get(id).map(|c| c.rooms.iter().cloned().collect()))
        .unwrap_or_default()
}

pub fn connection_count(store: &HubStore) -> usize {
    store.lock().map(|hub| hub.connections.len()).unwrap_or(0)
}

pub fn room_exists(store: &HubStore, room: &str) -> bool {
    store.lock().map(|hub| hub.rooms.contains_key(room)).unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Push an event to a single connection. Returns whether it was queued.
pub fn send_to(store: &HubStore, id: &str, event: ServerEvent) -> bool {
    let Ok(hub) = store.lock() else {
        return false;
    };
    hub.connections
        .get(id)
        .map(|c| c.outbound.send(event).is_ok())
        .unwrap_or(false)
}

/// Push an event to every member of `room` except `exclude`.
///
/// Returns the number of connections the event was queued for. Unknown rooms
/// are a no-op.
pub fn deliver_to_room(
    store: &HubStore,
    room: &str,
    exclude: Option<&str>,
    event: &ServerEvent,
) -> usize {
    let Ok(hub) = store.lock() else {
        return 0;
    };
    let Some(r) = hub.rooms.get(room) else {
        return 0;
    };
    r.members
        .iter()
        .filter(|member| Some(member.as_str()) != exclude)
        .filter_map(|member| hub.connections.get(member))
        .filter(|conn| conn.outbound.send(event.clone()).is_ok())
        .count()
}

/// Push one event to a computed audience on behalf of `sender`.
///
/// A room audience that includes the sender reaches the sender even when it
/// never joined that room.
pub fn deliver(store: &HubStore, sender: &str, audience: &Audience, event: &ServerEvent) -> usize {
    match audience {
        Audience::Sender => usize::from(send_to(store, sender, event.clone())),
        Audience::Room { name, include_sender } => {
            let peers = deliver_to_room(store, name, Some(sender), event);
            if *include_sender && send_to(store, sender, event.clone()) {
                peers + 1
            } else {
                peers
            }
        }
    }
}
