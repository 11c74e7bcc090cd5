//! Crate-level error types.
//!
//! [`RelayError`] covers everything that can stop the process or a client
//! connection. [`GenerationError`] covers the generation backend only; those
//! errors never reach the transport and are folded into a [`Fallback`] chat
//! message instead.

use thiserror::Error;

/// Placeholder credential value shipped in sample configs.
pub const PLACEHOLDER_API_KEY: &str = "YOUR_GEMINI_API_KEY";

#[derive(Debug, Error)]
pub enum RelayError {
    /// AI mode is on but no usable credential was supplied.
    #[error("GEMINI_API_KEY is not set or is a placeholder; export it, pass --api-key, or set api_key in the config file")]
    MissingCredential,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),

    #[error("not connected")]
    NotConnected,
}

/// Why the backend refused or failed to produce a reply.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The prompt or the reply was blocked; carries the reported reason.
    #[error("blocked by the backend: {0}")]
    Blocked(BlockReason),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(String),

    #[error("backend returned no candidates")]
    EmptyResponse,

    #[error("could not decode backend response: {0}")]
    Malformed(String),
}

/// Reported cause of a block, normalised from the backend's finish/block reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    Safety,
    Recitation,
    Other(String),
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::Safety => write!(f, "safety"),
            BlockReason::Recitation => write!(f, "recitation"),
            BlockReason::Other(reason) => write!(f, "{}", reason.to_lowercase()),
        }
    }
}

/// User-facing replacement for a failed generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    Safety,
    Recitation,
    Quota,
    Generic,
}

impl Fallback {
    pub const ALL: [Fallback; 4] = [
        Fallback::Safety,
        Fallback::Recitation,
        Fallback::Quota,
        Fallback::Generic,
    ];

    pub fn text(self) -> &'static str {
        match self {
            Fallback::Safety => {
                "I can't respond to that because it was flagged by content-safety filters."
            }
            Fallback::Recitation => {
                "I can't respond to that because the reply would recite protected material."
            }
            Fallback::Quota => {
                "The AI service has hit its usage quota. Please try again later."
            }
            Fallback::Generic => "Oops! An error occurred while generating a reply. Check backend logs.",
        }
    }
}

impl GenerationError {
    /// Pick the fallback message for this failure.
    pub fn fallback(&self) -> Fallback {
        match self {
            GenerationError::Blocked(BlockReason::Safety) => Fallback::Safety,
            GenerationError::Blocked(BlockReason::Recitation) => Fallback::Recitation,
            GenerationError::QuotaExceeded(_) => Fallback::Quota,
            GenerationError::Http { status: 429, .. } => Fallback::Quota,
            _ => Fallback::Generic,
        }
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            GenerationError::Malformed(e.to_string())
        } else {
            GenerationError::Transport(e.to_string())
        }
    }
}
