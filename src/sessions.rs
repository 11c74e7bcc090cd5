//! Per-connection conversation table.
//!
//! Each AI-mode connection gets one worker task that exclusively owns its
//! [`Conversation`]. The socket loop only pushes [`TurnRequest`]s into the
//! worker's queue, so turns for one connection run strictly in order while
//! the socket keeps relaying.
//!
//! Closing a session drops the queue sender and raises the closed flag: the
//! worker finishes the turn it is on, skips anything still queued and drops
//! the conversation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::generation::{Conversation, GenerationBackend, Turn};
use crate::hub::{self, HubStore};
use crate::protocol::{now_timestamp, Audience, ChatMessage, ConnectionId, ServerEvent};

pub type SessionStore = Arc<Mutex<HashMap<ConnectionId, SessionHandle>>>;

/// One queued generation turn and where its reply goes.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub turn: Turn,
    pub audience: Audience,
    /// Room label stamped on the reply.
    pub room: Option<String>,
}

#[derive(Debug)]
pub struct SessionHandle {
    turns: mpsc::UnboundedSender<TurnRequest>,
    closed: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

/// What a worker needs besides its conversation.
#[derive(Clone)]
pub struct SessionContext {
    pub connection: ConnectionId,
    pub hub: HubStore,
    pub backend: Arc<dyn GenerationBackend>,
    pub ai_label: String,
}

pub fn new_session_store() -> SessionStore {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Start a worker for `ctx.connection`. Returns `false` (and starts nothing)
/// if a session for that id is already open.
pub fn open(store: &SessionStore, ctx: SessionContext, conversation: Conversation) -> bool {
    let Ok(mut sessions) = store.lock() else {
        return false;
    };
    if sessions.contains_key(&ctx.connection) {
        return false;
    }
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let id = ctx.connection.clone();
    let worker = tokio::spawn(run_worker(ctx, conversation, rx, Arc::clone(&closed)));
    sessions.insert(id, SessionHandle { turns: tx, closed, worker });
    true
}

/// Queue a turn. Returns `false` when no session is open for `id`.
pub fn submit(store: &SessionStore, id: &str, request: TurnRequest) -> bool {
    store
        .lock()
        .ok()
        .and_then(|sessions| sessions.get(id).map(|h| h.turns.send(request).is_ok()))
        .unwrap_or(false)
}

/// Remove and close a session. The returned handle resolves once the
/// worker has finished its in-flight turn.
pub fn close(store: &SessionStore, id: &str) -> Option<JoinHandle<()>> {
    let handle = store.lock().ok()?.remove(id)?;
    handle.closed.store(true, Ordering::SeqCst);
    Some(handle.worker)
}

pub fn contains(store: &SessionStore, id: &str) -> bool {
    store.lock().map(|s| s.contains_key(id)).unwrap_or(false)
}

pub fn len(store: &SessionStore) -> usize {
    store.lock().map(|s| s.len()).unwrap_or(0)
}

async fn run_worker(
    ctx: SessionContext,
    mut conversation: Conversation,
    mut turns: mpsc::UnboundedReceiver<TurnRequest>,
    closed: Arc<AtomicBool>,
) {
    while let Some(request) = turns.recv().await {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        let message = match conversation.send(ctx.backend.as_ref(), request.turn).await {
            Ok(text) => text,
            Err(e) => {
                let fallback = e.fallback();
                tracing::warn!(
                    connection = %ctx.connection,
                    error = %e,
                    fallback = ?fallback,
                    "generation failed"
                );
                fallback.text().to_string()
            }
        };
        let reply = ServerEvent::ReceiveMessage(ChatMessage {
            author: ctx.ai_label.clone(),
            message,
            image: None,
            room: request.room,
            time: now_timestamp(),
        });
        let delivered = hub::deliver(&ctx.hub, &ctx.connection, &request.audience, &reply);
        tracing::debug!(connection = %ctx.connection, delivered, "ai reply emitted");
    }
    tracing::debug!(
        connection = %ctx.connection,
        turns = conversation.history().len() / 2,
        "session worker finished"
    );
}
