//! Chat client: connection handle plus the state a front end renders.
//!
//! [`ChatClient`] owns the socket. A writer task drains outbound events into
//! the sink and a reader task turns inbound frames into [`ClientUpdate`]s.
//! [`ClientState`] is plain data: the append-only message list, connectivity,
//! the current room and the call-mode [`VoiceLoop`].

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::RelayError;
use crate::generation::{sniff_image_mime, DEFAULT_IMAGE_MIME};
use crate::protocol::{
    now_timestamp, BroadcastPolicy, ChatMessage, ClientEvent, SendMessage, ServerEvent,
};
use crate::voice::{SpeechCapabilities, VoiceCommand, VoiceLoop};
use crate::web::SOCKET_PATH;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientState {
    pub connected: bool,
    pub connection_id: Option<String>,
    /// Room sent with every message; `None` chats privately with the server.
    pub room: Option<String>,
    pub author: Option<String>,
    /// Label used for optimistic copies of our own messages.
    pub self_label: String,
    policy: BroadcastPolicy,
    ai_author: Option<String>,
    messages: Vec<ChatMessage>,
    pub voice: VoiceLoop,
}

impl ClientState {
    pub fn new(author: Option<String>, room: Option<String>, caps: SpeechCapabilities) -> Self {
        Self {
            connected: false,
            connection_id: None,
            room: room.filter(|r| !r.trim().is_empty()),
            author,
            self_label: crate::config::DEFAULT_SELF_LABEL.to_string(),
            policy: BroadcastPolicy::default(),
            ai_author: None,
            messages: Vec::new(),
            voice: VoiceLoop::new(caps),
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn policy(&self) -> BroadcastPolicy {
        self.policy
    }

    pub fn ai_author(&self) -> Option<&str> {
        self.ai_author.as_deref()
    }

    /// Whether the server will send our own message back to us.
    pub fn server_echoes(&self) -> bool {
        self.policy.echoes_to_sender(self.room.as_deref())
    }

    /// Package a message for sending.
    ///
    /// Returns `None` (and changes nothing) when disconnected or when there is
    /// neither text nor an image. Appends an optimistic local copy only when
    /// the server will not echo the message.
    pub fn prepare_send(&mut self, text: &str, image: Option<String>) -> Option<SendMessage> {
        let text = text.trim();
        if !self.connected || (text.is_empty() && image.is_none()) {
            return None;
        }
        let payload = SendMessage {
            message: text.to_string(),
            image,
            author: self.author.clone(),
            room: self.room.clone(),
        };
        if !self.server_echoes() {
            self.messages.push(ChatMessage::relayed(&payload, &self.self_label, &now_timestamp()));
        }
        Some(payload)
    }

    /// Apply one inbound event. Returns voice commands to carry out.
    pub fn on_event(&mut self, event: ServerEvent) -> Vec<VoiceCommand> {
        match event {
            ServerEvent::Welcome(w) => {
                self.connected = true;
                self.connection_id = Some(w.connection_id);
                self.policy = w.broadcast_policy;
                self.ai_author = w.ai_author;
                Vec::new()
            }
            ServerEvent::ReceiveMessage(msg) => self.on_receive(msg),
            ServerEvent::Error(_) => Vec::new(),
        }
    }

    pub fn on_receive(&mut self, msg: ChatMessage) -> Vec<VoiceCommand> {
        let commands = match self.ai_author.as_deref() {
            Some(ai) => self.voice.on_message(&msg.author, ai, &msg.message),
            None => Vec::new(),
        };
        self.messages.push(msg);
        commands
    }

    pub fn on_connected(&mut self) {
        self.connected = true;
    }

    pub fn on_disconnected(&mut self) -> Vec<VoiceCommand> {
        self.connected = false;
        self.voice.exit_call()
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ClientUpdate {
    Event(ServerEvent),
    /// The socket closed; carries the transport error if there was one.
    Disconnected(Option<String>),
}

pub struct ChatClient {
    outbound: mpsc::UnboundedSender<ClientEvent>,
    updates: mpsc::UnboundedReceiver<ClientUpdate>,
}

impl ChatClient {
    /// Open the socket and, if `room` is set, join it straight away.
    pub async fn connect(url: &str, room: Option<&str>) -> Result<Self, RelayError> {
        let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (up_tx, up_rx) = mpsc::unbounded_channel::<ClientUpdate>();

        if let Some(room) = room.map(str::trim).filter(|r| !r.is_empty()) {
            let _ = out_tx.send(ClientEvent::JoinRoom(room.to_string()));
        }

        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let text = match event.to_json() {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping unserializable event");
                        continue;
                    }
                };
                if sink.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            loop {
                let update = match stream.next().await {
                    Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => ClientUpdate::Event(event),
                        Err(e) => {
                            tracing::warn!(error = %e, "ignoring malformed server frame");
                            continue;
                        }
                    },
                    Some(Ok(WsMessage::Close(_))) | None => {
                        let _ = up_tx.send(ClientUpdate::Disconnected(None));
                        break;
                    }
                    Some(Err(e)) => {
                        let _ = up_tx.send(ClientUpdate::Disconnected(Some(e.to_string())));
                        break;
                    }
                    Some(Ok(_)) => continue,
                };
                if up_tx.send(update).is_err() {
                    break;
                }
            }
        });

        Ok(Self { outbound: out_tx, updates: up_rx })
    }

    pub fn send(&self, event: ClientEvent) -> Result<(), RelayError> {
        self.outbound.send(event).map_err(|_| RelayError::NotConnected)
    }

    pub fn send_message(&self, payload: SendMessage) -> Result<(), RelayError> {
        self.send(ClientEvent::SendMessage(payload))
    }

    pub fn join(&self, room: &str) -> Result<(), RelayError> {
        self.send(ClientEvent::JoinRoom(room.to_string()))
    }

    /// Next inbound update; `None` once the reader task is gone.
    pub async fn next_update(&mut self) -> Option<ClientUpdate> {
        self.updates.recv().await
    }
}

/// Turn `http://host:port` (or a bare `host:port`) into the socket URL.
pub fn socket_url(server: &str) -> String {
    let server = server.trim().trim_end_matches('/');
    let base = if let Some(rest) = server.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = server.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if server.starts_with("ws://") || server.starts_with("wss://") {
        server.to_string()
    } else {
        format!("ws://{server}")
    };
    if base.ends_with(SOCKET_PATH) {
        base
    } else {
        format!("{base}{SOCKET_PATH}")
    }
}

/// Read an image file and encode it as a base64 data URL.
pub async fn encode_image_file(path: &Path) -> Result<String, RelayError> {
    let bytes = tokio::fs::read(path).await?;
    let mime = sniff_image_mime(&bytes)
        .or_else(|| mime_from_extension(path))
        .unwrap_or(DEFAULT_IMAGE_MIME);
    Ok(format!("data:{mime};base64,{}", BASE64.encode(&bytes)))
}

fn mime_from_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Welcome;
    use crate::voice::VoiceState;

    fn welcome(policy: BroadcastPolicy) -> ServerEvent {
        ServerEvent::Welcome(Welcome {
            connection_id: "c1".into(),
            broadcast_policy: policy,
            ai_author: Some("Gemini AI".into()),
        })
    }

    fn chat(author: &str, text: &str) -> ChatMessage {
        ChatMessage {
            author: author.into(),
            message: text.into(),
            image: None,
            room: None,
            time: "2025-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn test_send_refused_while_disconnected() {
        let mut s = ClientState::new(None, None, SpeechCapabilities::none());
        assert!(s.prepare_send("hello", None).is_none());
        assert!(s.messages().is_empty());
    }

    #[test]
    fn test_send_refuses_blank_text_without_image() {
        let mut s = ClientState::new(None, None, SpeechCapabilities::none());
        s.on_event(welcome(BroadcastPolicy::default()));
        assert!(s.prepare_send("   ", None).is_none());
        assert!(s.prepare_send("", Some("aGk=".into())).is_some());
    }

    #[test]
    fn test_no_room_relies_on_server_echo() {
        let mut s = ClientState::new(None, None, SpeechCapabilities::none());
        s.on_event(welcome(BroadcastPolicy::RoomExcludingSender));
        let payload = s.prepare_send("  hi  ", None).unwrap();
        assert_eq!(payload.message, "hi");
        assert!(s.messages().is_empty());
    }

    #[test]
    fn test_room_excluding_sender_appends_optimistically() {
        let mut s = ClientState::new(Some("Ann".into()), Some("lobby".into()), SpeechCapabilities::none());
        s.on_event(welcome(BroadcastPolicy::RoomExcludingSender));
        let payload = s.prepare_send("hi all", None).unwrap();
        assert_eq!(payload.room.as_deref(), Some("lobby"));
        assert_eq!(payload.author.as_deref(), Some("Ann"));
        assert_eq!(s.messages().len(), 1);
        assert_eq!(s.messages()[0].author, "You");
    }

    #[test]
    fn test_room_including_sender_waits_for_echo() {
        let mut s = ClientState::new(None, Some("lobby".into()), SpeechCapabilities::none());
        s.on_event(welcome(BroadcastPolicy::RoomIncludingSender));
        s.prepare_send("hi", None).unwrap();
        assert!(s.messages().is_empty());
    }

    #[test]
    fn test_receive_appends_in_order() {
        let mut s = ClientState::new(None, None, SpeechCapabilities::none());
        s.on_receive(chat("You", "a"));
        s.on_receive(chat("Gemini AI", "b"));
        let texts: Vec<_> = s.messages().iter().map(|m| m.message.as_str()).collect();
        assert_eq!(texts, ["a", "b"]);
    }

    #[test]
    fn test_ai_message_in_call_mode_is_spoken() {
        let mut s = ClientState::new(None, None, SpeechCapabilities::full());
        s.on_event(welcome(BroadcastPolicy::default()));
        s.voice.enter_call().unwrap();
        let cmds = s.on_receive(chat("Gemini AI", "Hello"));
        assert!(matches!(cmds.as_slice(), [VoiceCommand::Speak(_, t)] if t == "Hello"));
        assert_eq!(s.voice.state(), VoiceState::Speaking);
    }

    #[test]
    fn test_disconnect_leaves_call_mode() {
        let mut s = ClientState::new(None, None, SpeechCapabilities::full());
        s.on_event(welcome(BroadcastPolicy::default()));
        s.voice.enter_call().unwrap();
        assert_eq!(s.on_disconnected(), vec![VoiceCommand::StopAll]);
        assert!(!s.connected);
    }

    #[test]
    fn test_socket_url_forms() {
        assert_eq!(socket_url("http://localhost:5000"), "ws://localhost:5000/socket");
        assert_eq!(socket_url("https://chat.example/"), "wss://chat.example/socket");
        assert_eq!(socket_url("127.0.0.1:5000"), "ws://127.0.0.1:5000/socket");
        assert_eq!(socket_url("ws://h:1/socket"), "ws://h:1/socket");
    }

    #[tokio::test]
    async fn test_encode_image_file_builds_data_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pic.bin");
        tokio::fs::write(&path, [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]).await.unwrap();
        let url = encode_image_file(&path).await.unwrap();
        assert_eq!(url, "data:image/png;base64,iVBORw0KGgo=");
    }

    #[tokio::test]
    async fn test_encode_image_file_missing_is_io_error() {
        let err = encode_image_file(Path::new("/definitely/not/here.png")).await.unwrap_err();
        assert!(matches!(err, RelayError::Io(_)));
    }
}
