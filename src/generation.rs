//! Generation backend and per-connection conversations.
//!
//! A [`Conversation`] owns the persona, the generation parameters and the
//! linear turn history of one connection. It sends each turn through a
//! [`GenerationBackend`] exactly once: no retry, no timeout. History only
//! grows on success.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Client;

use crate::error::{BlockReason, GenerationError};
use crate::protocol::SendMessage;
use crate::providers::{
    safety_settings, ApiErrorEnvelope, Content, GenerateContentRequest, GenerateContentResponse,
    GenerationConfig, InlineData, ListModelsResponse, ModelInfo, Part, SafetyThreshold,
};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";

/// Mime type assumed for images that carry no data-URL header and no
/// recognisable magic bytes.
pub const DEFAULT_IMAGE_MIME: &str = "image/jpeg";

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Something that turns a full request into the model's reply content.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, request: &GenerateContentRequest) -> Result<Content, GenerationError>;
}

/// Fixed generation parameters, applied to every turn.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub safety_threshold: SafetyThreshold,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_output_tokens: 1024,
            safety_threshold: SafetyThreshold::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Turns
// ---------------------------------------------------------------------------

/// One user turn: text plus an optional decoded inline image.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub text: String,
    pub image: Option<InlineData>,
}

impl Turn {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), image: None }
    }

    /// Build a turn from an inbound payload. An image that fails to decode is
    /// dropped and the text still goes through.
    pub fn from_payload(payload: &SendMessage) -> Self {
        let image = payload.image.as_deref().and_then(|raw| {
            let decoded = decode_inline_image(raw);
            if decoded.is_none() {
                tracing::warn!("dropping undecodable inline image ({} bytes)", raw.len());
            }
            decoded
        });
        Self { text: payload.message.clone(), image }
    }

    pub fn into_content(self) -> Content {
        let mut parts = Vec::with_capacity(2);
        if !self.text.trim().is_empty() {
            parts.push(Part::text(&self.text));
        }
        if let Some(img) = self.image {
            parts.push(Part { inline_data: Some(img), ..Part::default() });
        }
        Content::user(parts)
    }
}

/// Decode a base64 image, optionally wrapped as `data:<mime>;base64,<data>`.
///
/// Returns `None` for empty or invalid base64.
pub fn decode_inline_image(raw: &str) -> Option<InlineData> {
    let raw = raw.trim();
    let (declared_mime, data) = match raw.strip_prefix("data:") {
        Some(rest) => {
            let (header, data) = rest.split_once(',')?;
            let mime = header.strip_suffix(";base64")?;
            (Some(mime).filter(|m| !m.is_empty()), data)
        }
        None => (None, raw),
    };
    if data.is_empty() {
        return None;
    }
    let bytes = BASE64.decode(data).ok()?;
    let mime = declared_mime
        .map(str::to_string)
        .or_else(|| sniff_image_mime(&bytes).map(str::to_string))
        .unwrap_or_else(|| DEFAULT_IMAGE_MIME.to_string());
    Some(InlineData { mime_type: mime, data: data.to_string() })
}

/// Recognise common image formats by their magic bytes.
pub fn sniff_image_mime(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => Some("image/png"),
        [0xFF, 0xD8, 0xFF, ..] => Some("image/jpeg"),
        [b'G', b'I', b'F', b'8', ..] => Some("image/gif"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some("image/webp"),
        _ => None,
    }
}

/// Flatten model content into chat text. Function calls are rendered as
/// `[tool call] name {args}` lines.
pub fn reply_text(content: &Content) -> String {
    let mut out = String::new();
    for part in &content.parts {
        if let Some(text) = &part.text {
            out.push_str(text);
        }
        if let Some(call) = &part.function_call {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&format!("[tool call] {} {}", call.name, call.args));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// Per-connection conversation handle.
#[derive(Debug, Clone)]
pub struct Conversation {
    persona: String,
    params: GenerationParams,
    history: Vec<Content>,
}

impl Conversation {
    pub fn new(persona: impl Into<String>, params: GenerationParams) -> Self {
        Self { persona: persona.into(), params, history: Vec::new() }
    }

    pub fn history(&self) -> &[Content] {
        &self.history
    }

    pub fn persona(&self) -> &str {
        &self.persona
    }

    /// Full request for the next turn: history followed by `turn`.
    pub fn build_request(&self, turn: &Content) -> GenerateContentRequest {
        let mut contents = self.history.clone();
        contents.push(turn.clone());
        GenerateContentRequest {
            contents,
            system_instruction: Some(self.persona.as_str())
                .filter(|p| !p.trim().is_empty())
                .map(Content::system),
            generation_config: GenerationConfig {
                temperature: self.params.temperature,
                max_output_tokens: self.params.max_output_tokens,
            },
            safety_settings: safety_settings(self.params.safety_threshold),
        }
    }

    /// Send one turn and return the reply text.
    pub async fn send(
        &mut self,
        backend: &dyn GenerationBackend,
        turn: Turn,
    ) -> Result<String, GenerationError> {
        let user = turn.into_content();
        let request = self.build_request(&user);
        let mut reply = backend.generate(&request).await?;
        let text = reply_text(&reply);
        if text.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        if reply.role.is_none() {
            reply.role = Some("model".to_string());
        }
        self.history.push(user);
        self.history.push(reply);
        Ok(text)
    }
}

// ---------------------------------------------------------------------------
// Gemini REST backend
// ---------------------------------------------------------------------------

pub struct GeminiBackend {
    client: Client,
    api_key: String,
    model: String,
    api_base: String,
}

impl GeminiBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            api_base: api_base.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// `models/<id>` regardless of whether the configured id carries the prefix.
    fn model_path(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/v1beta/{}", self.api_base.trim_end_matches('/'), suffix)
    }

    /// List the models visible to this credential.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, GenerationError> {
        let response = self
            .client
            .get(self.url("models"))
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_http_error(status.as_u16(), &body));
        }
        let parsed: ListModelsResponse =
            serde_json::from_str(&body).map_err(|e| GenerationError::Malformed(e.to_string()))?;
        Ok(parsed.models)
    }
}

#[async_trait]
impl GenerationBackend for GeminiBackend {
    async fn generate(&self, request: &GenerateContentRequest) -> Result<Content, GenerationError> {
        let url = self.url(&format!("{}:generateContent", self.model_path()));
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_http_error(status.as_u16(), &body));
        }

        let parsed: GenerateContentResponse =
            serde_json::from_str(&body).map_err(|e| GenerationError::Malformed(e.to_string()))?;
        interpret_response(parsed)
    }
}

/// Map a non-2xx reply to an error, recognising quota exhaustion.
pub fn classify_http_error(status: u16, body: &str) -> GenerationError {
    let api = serde_json::from_str::<ApiErrorEnvelope>(body).ok().map(|e| e.error);
    let detail = api
        .as_ref()
        .map(|e| e.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| body.to_string());
    let exhausted = api.as_ref().is_some_and(|e| e.status == "RESOURCE_EXHAUSTED");
    if status == 429 || exhausted {
        GenerationError::QuotaExceeded(detail)
    } else {
        GenerationError::Http { status, body: detail }
    }
}

/// Pull the reply content out of a successful response, turning block and
/// finish reasons into errors.
pub fn interpret_response(response: GenerateContentResponse) -> Result<Content, GenerationError> {
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(GenerationError::Blocked(block_reason(&reason)));
    }
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or(GenerationError::EmptyResponse)?;

    if let Some(reason) = candidate.finish_reason.as_deref() {
        match block_reason(reason) {
            BlockReason::Other(_) => {}
            blocked => return Err(GenerationError::Blocked(blocked)),
        }
    }

    candidate
        .content
        .filter(|c| !c.parts.is_empty())
        .ok_or(GenerationError::EmptyResponse)
}

/// Normalise a reported block/finish reason.
pub fn block_reason(reason: &str) -> BlockReason {
    match reason {
        "SAFETY" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => BlockReason::Safety,
        "RECITATION" => BlockReason::Recitation,
        other => BlockReason::Other(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::FunctionCall;

    fn response(json: &str) -> GenerateContentResponse {
        serde_json::from_str(json).unwrap()
    }

    struct Echo;

    #[async_trait]
    impl GenerationBackend for Echo {
        async fn generate(&self, request: &GenerateContentRequest) -> Result<Content, GenerationError> {
            let last = request.contents.last().map(reply_text).unwrap_or_default();
            Ok(Content { role: None, parts: vec![Part::text(&format!("echo: {last}"))] })
        }
    }

    struct Refuse;

    #[async_trait]
    impl GenerationBackend for Refuse {
        async fn generate(&self, _: &GenerateContentRequest) -> Result<Content, GenerationError> {
            Err(GenerationError::Blocked(BlockReason::Safety))
        }
    }

    #[test]
    fn test_decode_plain_base64_png() {
        // 89 50 4E 47 0D 0A 1A 0A
        let img = decode_inline_image("iVBORw0KGgo=").unwrap();
        assert_eq!(img.mime_type, "image/png");
        assert_eq!(img.data, "iVBORw0KGgo=");
    }

    #[test]
    fn test_decode_data_url_uses_declared_mime_and_strips_prefix() {
        let img = decode_inline_image("data:image/webp;base64,aGVsbG8=").unwrap();
        assert_eq!(img.mime_type, "image/webp");
        assert_eq!(img.data, "aGVsbG8=");
    }

    #[test]
    fn test_decode_unknown_bytes_default_mime() {
        let img = decode_inline_image("aGVsbG8=").unwrap();
        assert_eq!(img.mime_type, DEFAULT_IMAGE_MIME);
    }

    #[test]
    fn test_decode_rejects_invalid_base64() {
        assert!(decode_inline_image("not base64!!").is_none());
    }

    #[test]
    fn test_decode_rejects_empty_and_non_base64_data_url() {
        assert!(decode_inline_image("").is_none());
        assert!(decode_inline_image("data:image/png;base64,").is_none());
        assert!(decode_inline_image("data:text/plain,hello").is_none());
    }

    #[test]
    fn test_sniff_jpeg_and_gif() {
        assert_eq!(sniff_image_mime(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(sniff_image_mime(b"GIF89a"), Some("image/gif"));
        assert_eq!(sniff_image_mime(b"RIFF\0\0\0\0WEBPVP8"), Some("image/webp"));
        assert_eq!(sniff_image_mime(b"xx"), None);
    }

    #[test]
    fn test_turn_from_payload_drops_bad_image() {
        let payload = SendMessage {
            message: "look".into(),
            image: Some("%%%".into()),
            ..SendMessage::default()
        };
        let turn = Turn::from_payload(&payload);
        assert_eq!(turn.text, "look");
        assert!(turn.image.is_none());
    }

    #[test]
    fn test_turn_into_content_orders_text_then_image() {
        let turn = Turn { text: "what is this".into(), image: decode_inline_image("aGVsbG8=") };
        let content = turn.into_content();
        assert_eq!(content.role.as_deref(), Some("user"));
        assert_eq!(content.parts.len(), 2);
        assert!(content.parts[0].text.is_some());
        assert!(content.parts[1].inline_data.is_some());
    }

    #[test]
    fn test_reply_text_renders_function_call() {
        let content = Content::model(vec![
            Part::text("Checking."),
            Part {
                function_call: Some(FunctionCall {
                    name: "get_weather".into(),
                    args: serde_json::json!({"city": "Oslo"}),
                }),
                ..Part::default()
            },
        ]);
        assert_eq!(reply_text(&content), "Checking.\n[tool call] get_weather {\"city\":\"Oslo\"}");
    }

    #[test]
    fn test_build_request_carries_persona_and_params() {
        let params = GenerationParams {
            temperature: 0.2,
            max_output_tokens: 99,
            safety_threshold: SafetyThreshold::BlockOnlyHigh,
        };
        let conv = Conversation::new("You are terse.", params);
        let req = conv.build_request(&Turn::text("hi").into_content());
        assert_eq!(req.contents.len(), 1);
        assert_eq!(req.system_instruction.unwrap().parts[0].text.as_deref(), Some("You are terse."));
        assert_eq!(req.generation_config.max_output_tokens, 99);
        assert!(req.safety_settings.iter().all(|s| s.threshold == SafetyThreshold::BlockOnlyHigh));
    }

    #[test]
    fn test_build_request_blank_persona_has_no_system_instruction() {
        let conv = Conversation::new("  ", GenerationParams::default());
        assert!(conv.build_request(&Turn::text("hi").into_content()).system_instruction.is_none());
    }

    #[tokio::test]
    async fn test_conversation_history_grows_on_success() {
        let mut conv = Conversation::new("p", GenerationParams::default());
        let first = conv.send(&Echo, Turn::text("one")).await.unwrap();
        assert_eq!(first, "echo: one");
        conv.send(&Echo, Turn::text("two")).await.unwrap();
        assert_eq!(conv.history().len(), 4);
        assert_eq!(conv.history()[1].role.as_deref(), Some("model"));
    }

    #[tokio::test]
    async fn test_conversation_history_unchanged_on_failure() {
        let mut conv = Conversation::new("p", GenerationParams::default());
        let err = conv.send(&Refuse, Turn::text("bad")).await.unwrap_err();
        assert!(matches!(err, GenerationError::Blocked(BlockReason::Safety)));
        assert!(conv.history().is_empty());
    }

    #[test]
    fn test_interpret_prompt_block_is_safety() {
        let r = response(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#);
        assert!(matches!(interpret_response(r), Err(GenerationError::Blocked(BlockReason::Safety))));
    }

    #[test]
    fn test_interpret_recitation_finish() {
        let r = response(r#"{"candidates":[{"finishReason":"RECITATION"}]}"#);
        assert!(matches!(
            interpret_response(r),
            Err(GenerationError::Blocked(BlockReason::Recitation))
        ));
    }

    #[test]
    fn test_interpret_no_candidates_is_empty() {
        let r = response(r#"{"candidates":[]}"#);
        assert!(matches!(interpret_response(r), Err(GenerationError::EmptyResponse)));
    }

    #[test]
    fn test_interpret_max_tokens_with_text_is_ok() {
        let r = response(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"partial"}]},"finishReason":"MAX_TOKENS"}]}"#,
        );
        let content = interpret_response(r).unwrap();
        assert_eq!(reply_text(&content), "partial");
    }

    #[test]
    fn test_classify_429_is_quota() {
        let err = classify_http_error(
            429,
            r#"{"error":{"code":429,"message":"slow down","status":"RESOURCE_EXHAUSTED"}}"#,
        );
        assert!(matches!(err, GenerationError::QuotaExceeded(ref m) if m == "slow down"));
    }

    #[test]
    fn test_classify_resource_exhausted_without_429() {
        let err = classify_http_error(400, r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#);
        assert!(matches!(err, GenerationError::QuotaExceeded(_)));
    }

    #[test]
    fn test_classify_other_status_keeps_body() {
        let err = classify_http_error(503, "upstream down");
        assert!(matches!(err, GenerationError::Http { status: 503, ref body } if body == "upstream down"));
    }

    #[test]
    fn test_model_path_prefix_handling() {
        let a = GeminiBackend::new("k", "gemini-1.5-flash", DEFAULT_API_BASE);
        let b = GeminiBackend::new("k", "models/gemini-1.5-flash", DEFAULT_API_BASE);
        assert_eq!(a.model_path(), b.model_path());
        assert_eq!(a.url("models"), "https://generativelanguage.googleapis.com/v1beta/models");
    }
}
