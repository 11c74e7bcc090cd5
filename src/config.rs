//! Process settings.
//!
//! Layering, lowest to highest precedence:
//! 1. built-in defaults ([`Settings::default`])
//! 2. optional TOML file (`--config <path>`)
//! 3. environment (`GEMINI_API_KEY`, `PORT`)
//! 4. command-line flags ([`Overrides`])
//!
//! Everything the relay needs is read from the resulting [`Settings`]; nothing
//! downstream looks at the environment again.

use std::path::Path;

use serde::Deserialize;

use crate::error::{RelayError, PLACEHOLDER_API_KEY};
use crate::generation::{GenerationParams, DEFAULT_API_BASE};
use crate::protocol::BroadcastPolicy;
use crate::providers::SafetyThreshold;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_AI_LABEL: &str = "Gemini AI";
pub const DEFAULT_SELF_LABEL: &str = "You";
pub const DEFAULT_ALLOWED_ORIGINS: [&str; 2] = ["http://localhost:3000", "http://localhost:5173"];
pub const DEFAULT_PERSONA: &str =
    "You are Gemini AI, a friendly participant in a group chat. Keep replies short and conversational.";

pub const ENV_API_KEY: &str = "GEMINI_API_KEY";
pub const ENV_PORT: &str = "PORT";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub allowed_origins: OriginPolicy,
    pub broadcast_policy: BroadcastPolicy,
    /// Author label the sender sees on its own echoed messages.
    pub self_label: String,
    pub ai: AiSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AiSettings {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub model: String,
    pub persona: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub safety_threshold: SafetyThreshold,
    pub author_label: String,
    pub api_base: String,
    /// Query the model list at startup and log it.
    pub list_models: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            allowed_origins: OriginPolicy::default(),
            broadcast_policy: BroadcastPolicy::default(),
            self_label: DEFAULT_SELF_LABEL.to_string(),
            ai: AiSettings::default(),
        }
    }
}

impl Default for AiSettings {
    fn default() -> Self {
        let params = GenerationParams::default();
        Self {
            enabled: true,
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            persona: DEFAULT_PERSONA.to_string(),
            temperature: params.temperature,
            max_output_tokens: params.max_output_tokens,
            safety_threshold: params.safety_threshold,
            author_label: DEFAULT_AI_LABEL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            list_models: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Origins
// ---------------------------------------------------------------------------

/// Which browser origins may open the socket or read HTTP responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginPolicy {
    Any,
    List(Vec<String>),
}

impl Default for OriginPolicy {
    fn default() -> Self {
        OriginPolicy::List(DEFAULT_ALLOWED_ORIGINS.iter().map(|o| o.to_string()).collect())
    }
}

impl OriginPolicy {
    /// Build from configured entries; a lone `*` means any origin.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let list: Vec<String> = entries
            .into_iter()
            .map(|e| e.as_ref().trim().trim_end_matches('/').to_string())
            .filter(|e| !e.is_empty())
            .collect();
        if list.iter().any(|e| e == "*") {
            OriginPolicy::Any
        } else {
            OriginPolicy::List(list)
        }
    }

    /// Requests without an `Origin` header (CLI tools, server-to-server) are
    /// always allowed.
    pub fn allows(&self, origin: Option<&str>) -> bool {
        match (self, origin) {
            (_, None) | (OriginPolicy::Any, _) => true,
            (OriginPolicy::List(list), Some(origin)) => {
                let origin = origin.trim_end_matches('/');
                list.iter().any(|allowed| allowed == origin)
            }
        }
    }

    /// Like [`allows`](Self::allows), but a page served by this relay
    /// (origin authority equal to the request's `Host`) is always allowed.
    pub fn allows_request(&self, origin: Option<&str>, host: Option<&str>) -> bool {
        self.allows(origin) || matches!((origin, host), (Some(o), Some(h)) if same_origin(o, h))
    }
}

/// `http://host:port` (or `https://`) against a bare `Host` header value.
fn same_origin(origin: &str, host: &str) -> bool {
    let authority = origin
        .trim_end_matches('/')
        .strip_prefix("http://")
        .or_else(|| origin.trim_end_matches('/').strip_prefix("https://"));
    let host = host.trim();
    match authority {
        Some(authority) => !host.is_empty() && authority.eq_ignore_ascii_case(host),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// TOML file
// ---------------------------------------------------------------------------

/// On-disk shape. Every field is optional; absent fields keep the lower layer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub allowed_origins: Option<Vec<String>>,
    pub broadcast_policy: Option<BroadcastPolicy>,
    pub self_label: Option<String>,
    #[serde(default)]
    pub ai: FileAiConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileAiConfig {
    pub enabled: Option<bool>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub persona: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub safety_threshold: Option<SafetyThreshold>,
    pub author_label: Option<String>,
    pub api_base: Option<String>,
    pub list_models: Option<bool>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, RelayError> {
        let raw = std::fs::read_to_string(path).map_err(|source| RelayError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&raw, &path.display().to_string())
    }

    pub fn parse(raw: &str, origin: &str) -> Result<Self, RelayError> {
        toml::from_str(raw).map_err(|source| RelayError::ConfigParse {
            path: origin.to_string(),
            source,
        })
    }
}

// ---------------------------------------------------------------------------
// Command-line overrides
// ---------------------------------------------------------------------------

/// Highest-precedence layer, filled from `serve` flags.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config: Option<std::path::PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub allowed_origins: Option<Vec<String>>,
    pub broadcast_policy: Option<BroadcastPolicy>,
    pub no_ai: bool,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub persona: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub safety_threshold: Option<SafetyThreshold>,
    pub ai_label: Option<String>,
    pub api_base: Option<String>,
    pub skip_model_list: bool,
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

impl Settings {
    /// Resolve all layers and validate. `env` is the environment lookup
    /// (normally `|k| std::env::var(k).ok()`).
    pub fn resolve<F>(overrides: &Overrides, env: F) -> Result<Self, RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();
        if let Some(path) = &overrides.config {
            settings.apply_file(FileConfig::load(path)?);
        }
        settings.apply_env(env)?;
        settings.apply_overrides(overrides);
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_file(&mut self, file: FileConfig) {
        if let Some(host) = file.host {
            self.host = host;
        }
        if let Some(port) = file.port {
            self.port = port;
        }
        if let Some(origins) = file.allowed_origins {
            self.allowed_origins = OriginPolicy::from_entries(origins);
        }
        if let Some(policy) = file.broadcast_policy {
            self.broadcast_policy = policy;
        }
        if let Some(label) = file.self_label {
            self.self_label = label;
        }

        let ai = file.ai;
        let s = &mut self.ai;
        if let Some(v) = ai.enabled {
            s.enabled = v;
        }
        if ai.api_key.is_some() {
            s.api_key = ai.api_key;
        }
        if let Some(v) = ai.model {
            s.model = v;
        }
        if let Some(v) = ai.persona {
            s.persona = v;
        }
        if let Some(v) = ai.temperature {
            s.temperature = v;
        }
        if let Some(v) = ai.max_output_tokens {
            s.max_output_tokens = v;
        }
        if let Some(v) = ai.safety_threshold {
            s.safety_threshold = v;
        }
        if let Some(v) = ai.author_label {
            s.author_label = v;
        }
        if let Some(v) = ai.api_base {
            s.api_base = v;
        }
        if let Some(v) = ai.list_models {
            s.list_models = v;
        }
    }

    pub fn apply_env<F>(&mut self, env: F) -> Result<(), RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = env(ENV_API_KEY).filter(|k| !k.trim().is_empty()) {
            self.ai.api_key = Some(key);
        }
        if let Some(raw) = env(ENV_PORT) {
            self.port = raw
                .trim()
                .parse()
                .map_err(|_| RelayError::InvalidConfig(format!("{ENV_PORT}={raw:?} is not a valid port")))?;
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, o: &Overrides) {
        if let Some(host) = &o.host {
            self.host = host.clone();
        }
        if let Some(port) = o.port {
            self.port = port;
        }
        if let Some(origins) = &o.allowed_origins {
            self.allowed_origins = OriginPolicy::from_entries(origins);
        }
        if let Some(policy) = o.broadcast_policy {
            self.broadcast_policy = policy;
        }
        if o.no_ai {
            self.ai.enabled = false;
        }
        if o.skip_model_list {
            self.ai.list_models = false;
        }
        let s = &mut self.ai;
        if let Some(v) = &o.api_key {
            s.api_key = Some(v.clone());
        }
        if let Some(v) = &o.model {
            s.model = v.clone();
        }
        if let Some(v) = &o.persona {
            s.persona = v.clone();
        }
        if let Some(v) = o.temperature {
            s.temperature = v;
        }
        if let Some(v) = o.max_output_tokens {
            s.max_output_tokens = v;
        }
        if let Some(v) = o.safety_threshold {
            s.safety_threshold = v;
        }
        if let Some(v) = &o.ai_label {
            s.author_label = v.clone();
        }
        if let Some(v) = &o.api_base {
            s.api_base = v.clone();
        }
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.self_label.trim().is_empty() {
            return Err(RelayError::InvalidConfig("self_label must not be empty".into()));
        }
        if !self.ai.enabled {
            return Ok(());
        }
        if self.credential().is_none() {
            return Err(RelayError::MissingCredential);
        }
        if !(0.0..=2.0).contains(&self.ai.temperature) {
            return Err(RelayError::InvalidConfig(format!(
                "temperature {} is outside 0.0..=2.0",
                self.ai.temperature
            )));
        }
        if self.ai.max_output_tokens == 0 {
            return Err(RelayError::InvalidConfig("max_output_tokens must be greater than 0".into()));
        }
        if self.ai.author_label.trim().is_empty() {
            return Err(RelayError::InvalidConfig("AI author label must not be empty".into()));
        }
        if self.ai.author_label == self.self_label {
            return Err(RelayError::InvalidConfig(
                "AI author label and self label must differ".into(),
            ));
        }
        Ok(())
    }

    /// The API key, unless it is missing, blank, or the shipped placeholder.
    pub fn credential(&self) -> Option<&str> {
        self.ai
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty() && *k != PLACEHOLDER_API_KEY)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            temperature: self.ai.temperature,
            max_output_tokens: self.ai.max_output_tokens,
            safety_threshold: self.ai.safety_threshold,
        }
    }

    /// AI label when AI mode is on.
    pub fn ai_author(&self) -> Option<&str> {
        self.ai.enabled.then_some(self.ai.author_label.as_str())
    }
}
