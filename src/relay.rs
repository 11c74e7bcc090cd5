//! Relay server operations and the per-socket event loop.
//!
//! ## Message flow
//! 1. Socket opens → [`on_connect`]: hub registration, AI session, `welcome`
//! 2. `join_room` → [`on_join_room`]
//! 3. `send_message` → [`on_send_message`]: relayed copy to the audience right
//!    away, then (AI mode) one queued generation turn whose reply or fallback
//!    goes to the reply audience
//! 4. Socket closes → [`on_disconnect`]
//!
//! None of these block on generation; replies arrive through the hub from the
//! connection's session worker.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::config::Settings;
use crate::generation::{Conversation, GenerationBackend, Turn};
use crate::hub::{self, HubError, HubStore};
use crate::protocol::{
    now_timestamp, Audience, ChatMessage, ClientEvent, ConnectionId, SendMessage, ServerEvent,
    Welcome, ANONYMOUS_AUTHOR,
};
use crate::sessions::{self, SessionContext, SessionStore, TurnRequest};

/// Error codes carried by `error` events.
pub mod codes {
    pub const BAD_FRAME: &str = "bad_frame";
    pub const EMPTY_MESSAGE: &str = "empty_message";
    pub const INVALID_ROOM: &str = "invalid_room";
}

/// Everything the socket tasks share.
#[derive(Clone)]
pub struct RelayState {
    pub settings: Arc<Settings>,
    pub hub: HubStore,
    pub sessions: SessionStore,
    /// Present only in AI mode.
    pub backend: Option<Arc<dyn GenerationBackend>>,
}

impl RelayState {
    pub fn new(settings: Settings, backend: Option<Arc<dyn GenerationBackend>>) -> Self {
        let backend = backend.filter(|_| settings.ai.enabled);
        Self {
            settings: Arc::new(settings),
            hub: hub::new_hub_store(),
            sessions: sessions::new_session_store(),
            backend,
        }
    }

    pub fn ai_enabled(&self) -> bool {
        self.backend.is_some()
    }

    fn ai_label(&self) -> &str {
        &self.settings.ai.author_label
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Register a new connection and greet it.
pub fn on_connect(
    state: &RelayState,
) -> Result<(ConnectionId, mpsc::UnboundedReceiver<ServerEvent>), HubError> {
    let (id, outbound) = hub::connect(&state.hub)?;

    if let Some(backend) = &state.backend {
        let ctx = SessionContext {
            connection: id.clone(),
            hub: state.hub.clone(),
            backend: Arc::clone(backend),
            ai_label: state.ai_label().to_string(),
        };
        let conversation =
            Conversation::new(state.settings.ai.persona.clone(), state.settings.generation_params());
        sessions::open(&state.sessions, ctx, conversation);
    }

    hub::send_to(
        &state.hub,
        &id,
        ServerEvent::Welcome(Welcome {
            connection_id: id.clone(),
            broadcast_policy: state.settings.broadcast_policy,
            ai_author: state.ai_enabled().then(|| state.ai_label().to_string()),
        }),
    );
    tracing::info!(connection = %id, total = hub::connection_count(&state.hub), "user connected");
    Ok((id, outbound))
}

/// Join a room. Membership is additive; a blank name is rejected.
pub fn on_join_room(state: &RelayState, id: &str, room: &str) {
    let room = room.trim();
    if room.is_empty() {
        hub::send_to(&state.hub, id, ServerEvent::error(codes::INVALID_ROOM, "room name is empty"));
        return;
    }
    match hub::join_room(&state.hub, id, room) {
        Ok(members) => tracing::info!(connection = %id, room, members, "joined room"),
        Err(e) => tracing::warn!(connection = %id, room, error = %e, "join failed"),
    }
}

/// Relay a chat message and, in AI mode, queue a reply.
pub fn on_send_message(state: &RelayState, id: &str, payload: SendMessage) {
    if payload.is_blank() {
        hub::send_to(
            &state.hub,
            id,
            ServerEvent::error(codes::EMPTY_MESSAGE, "message has no text and no image"),
        );
        return;
    }

    let room = payload.room_name().map(str::to_string);
    let policy = state.settings.broadcast_policy;
    let audience = policy.audience_for(room.as_deref());
    let time = now_timestamp();
    tracing::debug!(
        connection = %id,
        room = room.as_deref().unwrap_or("-"),
        len = payload.message.len(),
        image = payload.image.is_some(),
        "message received"
    );

    if let Audience::Room { name, .. } = &audience {
        let author = payload
            .author
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .unwrap_or(ANONYMOUS_AUTHOR);
        let peer_copy = ServerEvent::ReceiveMessage(ChatMessage::relayed(&payload, author, &time));
        hub::deliver_to_room(&state.hub, name, Some(id), &peer_copy);
    }
    if audience.includes_sender() {
        let own_copy =
            ServerEvent::ReceiveMessage(ChatMessage::relayed(&payload, &state.settings.self_label, &time));
        hub::send_to(&state.hub, id, own_copy);
    }

    if !state.ai_enabled() {
        return;
    }
    if payload.author.as_deref() == Some(state.ai_label()) {
        tracing::debug!(connection = %id, "skipping generation for AI-authored message");
        return;
    }
    if payload.message.trim().is_empty() {
        return;
    }

    let request = TurnRequest {
        turn: Turn::from_payload(&payload),
        audience: policy.reply_audience_for(room.as_deref()),
        room,
    };
    if !sessions::submit(&state.sessions, id, request) {
        tracing::warn!(connection = %id, "no session for connection; reply dropped");
    }
}

/// Tear down a connection: close its session and drop hub state.
pub fn on_disconnect(state: &RelayState, id: &str) {
    sessions::close(&state.sessions, id);
    let rooms = hub::disconnect(&state.hub, id).unwrap_or_default();
    tracing::info!(connection = %id, rooms = rooms.len(), "user disconnected");
}

/// Decode one text frame and dispatch it.
pub fn handle_frame(state: &RelayState, id: &str, text: &str) {
    match serde_json::from_str::<ClientEvent>(text) {
        Ok(ClientEvent::JoinRoom(room)) => on_join_room(state, id, &room),
        Ok(ClientEvent::SendMessage(payload)) => on_send_message(state, id, payload),
        Err(e) => {
            tracing::debug!(connection = %id, error = %e, "malformed frame");
            hub::send_to(&state.hub, id, ServerEvent::error(codes::BAD_FRAME, e.to_string()));
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket handler
// ---------------------------------------------------------------------------

/// Drive one established socket until either side closes.
pub async fn handle_socket<S>(mut ws: WebSocketStream<S>, state: RelayState)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (id, mut outbound) = match on_connect(&state) {
        Ok(registered) => registered,
        Err(e) => {
            tracing::error!(error = %e, "could not register connection");
            let _ = ws.close(None).await;
            return;
        }
    };
    let (mut ws_sink, mut ws_stream) = ws.split();

    loop {
        tokio::select! {
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => handle_frame(&state, &id, &text),
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary / ping / pong
                    Some(Err(e)) => {
                        tracing::debug!(connection = %id, error = %e, "socket error");
                        break;
                    }
                }
            }

            event = outbound.recv() => {
                let Some(event) = event else { break };
                match event.to_json() {
                    Ok(text) => {
                        if ws_sink.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(connection = %id, error = %e, "unserializable event"),
                }
            }
        }
    }

    on_disconnect(&state, &id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use crate::protocol::BroadcastPolicy;
    use crate::providers::{Content, GenerateContentRequest, Part};
    use async_trait::async_trait;

    struct Reply(&'static str);

    #[async_trait]
    impl GenerationBackend for Reply {
        async fn generate(&self, _: &GenerateContentRequest) -> Result<Content, GenerationError> {
            Ok(Content::model(vec![Part::text(self.0)]))
        }
    }

    fn state(ai: bool, policy: BroadcastPolicy) -> RelayState {
        let mut settings = Settings::default();
        settings.ai.enabled = ai;
        settings.broadcast_policy = policy;
        let backend: Option<Arc<dyn GenerationBackend>> = ai.then(|| Arc::new(Reply("hi there")) as Arc<dyn GenerationBackend>);
        RelayState::new(settings, backend)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn messages(events: &[ServerEvent]) -> Vec<ChatMessage> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::ReceiveMessage(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_sends_welcome_without_ai() {
        let s = state(false, BroadcastPolicy::default());
        let (id, mut rx) = on_connect(&s).unwrap();
        match rx.try_recv().unwrap() {
            ServerEvent::Welcome(w) => {
                assert_eq!(w.connection_id, id);
                assert_eq!(w.ai_author, None);
            }
            other => panic!("expected welcome, got {other:?}"),
        }
    }

    #[test]
    fn test_no_room_echoes_to_sender_with_self_label() {
        let s = state(false, BroadcastPolicy::default());
        let (a, mut ra) = on_connect(&s).unwrap();
        let (_b, mut rb) = on_connect(&s).unwrap();
        drain(&mut ra);
        drain(&mut rb);

        on_send_message(&s, &a, SendMessage::text("hello"));
        let got = messages(&drain(&mut ra));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].author, "You");
        assert!(drain(&mut rb).is_empty());
    }

    #[test]
    fn test_room_peers_get_payload_author_or_anonymous() {
        let s = state(false, BroadcastPolicy::RoomExcludingSender);
        let (a, mut ra) = on_connect(&s).unwrap();
        let (b, mut rb) = on_connect(&s).unwrap();
        on_join_room(&s, &a, "lobby");
        on_join_room(&s, &b, "lobby");
        drain(&mut ra);
        drain(&mut rb);

        let mut payload = SendMessage::text("hi");
        payload.room = Some("lobby".into());
        on_send_message(&s, &a, payload.clone());
        assert_eq!(messages(&drain(&mut rb))[0].author, ANONYMOUS_AUTHOR);
        assert!(drain(&mut ra).is_empty());

        payload.author = Some("Ann".into());
        on_send_message(&s, &a, payload);
        assert_eq!(messages(&drain(&mut rb))[0].author, "Ann");
    }

    #[test]
    fn test_blank_message_is_rejected() {
        let s = state(false, BroadcastPolicy::default());
        let (a, mut ra) = on_connect(&s).unwrap();
        drain(&mut ra);
        on_send_message(&s, &a, SendMessage::text("   "));
        assert!(matches!(
            drain(&mut ra).as_slice(),
            [ServerEvent::Error(e)] if e.code == codes::EMPTY_MESSAGE
        ));
    }

    #[test]
    fn test_bad_frame_gets_error_event() {
        let s = state(false, BroadcastPolicy::default());
        let (a, mut ra) = on_connect(&s).unwrap();
        drain(&mut ra);
        handle_frame(&s, &a, "{not json");
        assert!(matches!(
            drain(&mut ra).as_slice(),
            [ServerEvent::Error(e)] if e.code == codes::BAD_FRAME
        ));
    }

    #[test]
    fn test_blank_room_join_is_rejected() {
        let s = state(false, BroadcastPolicy::default());
        let (a, mut ra) = on_connect(&s).unwrap();
        drain(&mut ra);
        on_join_room(&s, &a, "  ");
        assert!(hub::rooms_of(&s.hub, &a).is_empty());
        assert!(matches!(
            drain(&mut ra).as_slice(),
            [ServerEvent::Error(e)] if e.code == codes::INVALID_ROOM
        ));
    }

    #[test]
    fn test_disconnect_clears_hub() {
        let s = state(false, BroadcastPolicy::default());
        let (a, _ra) = on_connect(&s).unwrap();
        on_join_room(&s, &a, "lobby");
        on_disconnect(&s, &a);
        assert_eq!(hub::connection_count(&s.hub), 0);
        assert!(hub::room_exists(&s.hub, "lobby"));
    }

    #[tokio::test]
    async fn test_ai_mode_opens_session_and_replies() {
        let s = state(true, BroadcastPolicy::default());
        let (a, mut ra) = on_connect(&s).unwrap();
        assert!(sessions::contains(&s.sessions, &a));
        assert!(matches!(ra.recv().await, Some(ServerEvent::Welcome(w)) if w.ai_author.as_deref() == Some("Gemini AI")));

        on_send_message(&s, &a, SendMessage::text("hello"));
        let echo = ra.recv().await;
        assert!(matches!(echo, Some(ServerEvent::ReceiveMessage(ref m)) if m.author == "You"));
        let reply = ra.recv().await;
        assert!(matches!(reply, Some(ServerEvent::ReceiveMessage(ref m)) if m.author == "Gemini AI" && m.message == "hi there"));

        on_disconnect(&s, &a);
        assert!(!sessions::contains(&s.sessions, &a));
    }

    #[tokio::test]
    async fn test_ai_authored_message_does_not_trigger_generation() {
        let s = state(true, BroadcastPolicy::default());
        let (a, mut ra) = on_connect(&s).unwrap();
        ra.recv().await;
        let mut payload = SendMessage::text("I am the AI");
        payload.author = Some("Gemini AI".into());
        on_send_message(&s, &a, payload);
        assert!(matches!(ra.recv().await, Some(ServerEvent::ReceiveMessage(_))));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(ra.try_recv().is_err());
    }
}
