use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

use crate::config::Overrides;
use crate::protocol::BroadcastPolicy;
use crate::providers::SafetyThreshold;

#[derive(Parser)]
#[command(name = "chat-relay")]
#[command(version)]
#[command(about = "A WebSocket chat relay with rooms and an optional Gemini participant")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the relay server
    Serve(ServeArgs),
    /// Chat from the terminal against a running relay
    Chat(ChatArgs),
    /// Print a shell completion script
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(clap::Args, Debug, Default)]
pub struct ServeArgs {
    /// TOML settings file
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Listen host [default: 0.0.0.0]
    #[arg(long)]
    pub host: Option<String>,

    /// Listen port [default: 5000, or $PORT]
    #[arg(long, short)]
    pub port: Option<u16>,

    /// Allowed browser origin; repeat or comma-separate, `*` for any
    #[arg(long = "allow-origin", value_delimiter = ',')]
    pub allow_origin: Option<Vec<String>>,

    /// Who receives a room message
    #[arg(long, value_enum)]
    pub broadcast_policy: Option<BroadcastPolicy>,

    /// Relay only; never call the generation backend
    #[arg(long)]
    pub no_ai: bool,

    /// Gemini API key [default: $GEMINI_API_KEY]
    #[arg(long)]
    pub api_key: Option<String>,

    /// Model id (e.g. gemini-1.5-flash)
    #[arg(long)]
    pub model: Option<String>,

    /// System prompt for the AI participant
    #[arg(long)]
    pub persona: Option<String>,

    #[arg(long)]
    pub temperature: Option<f32>,

    #[arg(long)]
    pub max_output_tokens: Option<u32>,

    /// Content-safety threshold for every harm category
    #[arg(long, value_enum)]
    pub safety_threshold: Option<SafetyThreshold>,

    /// Author label on AI replies
    #[arg(long)]
    pub ai_label: Option<String>,

    /// Backend base URL
    #[arg(long)]
    pub api_base: Option<String>,

    /// Skip listing models at startup
    #[arg(long)]
    pub skip_model_list: bool,
}

impl ServeArgs {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            config: self.config.clone(),
            host: self.host.clone(),
            port: self.port,
            allowed_origins: self.allow_origin.clone(),
            broadcast_policy: self.broadcast_policy,
            no_ai: self.no_ai,
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            persona: self.persona.clone(),
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
            safety_threshold: self.safety_threshold,
            ai_label: self.ai_label.clone(),
            api_base: self.api_base.clone(),
            skip_model_list: self.skip_model_list,
        }
    }
}

#[derive(clap::Args, Debug)]
pub struct ChatArgs {
    /// Relay address
    #[arg(long, short, default_value = "http://localhost:5000")]
    pub server: String,

    /// Room to join on connect; omit to chat privately with the AI
    #[arg(long, short)]
    pub room: Option<String>,

    /// Display name shown to other room members
    #[arg(long, short)]
    pub name: Option<String>,
}

/// One line typed into the terminal client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatInput {
    Empty,
    Text(String),
    Join(String),
    Image { path: String, text: String },
    Quit,
    Help,
    /// A `/command` we do not know, or one missing its argument.
    Invalid(String),
}

pub fn parse_chat_line(line: &str) -> ChatInput {
    let line = line.trim();
    if line.is_empty() {
        return ChatInput::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return ChatInput::Text(line.to_string());
    };
    let (name, rest) = command.split_once(char::is_whitespace).unwrap_or((command, ""));
    let rest = rest.trim();
    match name {
        "quit" | "exit" => ChatInput::Quit,
        "help" => ChatInput::Help,
        "join" if !rest.is_empty() => ChatInput::Join(rest.to_string()),
        "image" if !rest.is_empty() => {
            let (path, text) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            ChatInput::Image { path: path.to_string(), text: text.trim().to_string() }
        }
        _ => ChatInput::Invalid(line.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serve(argv: &[&str]) -> ServeArgs {
        let mut full = vec!["chat-relay", "serve"];
        full.extend_from_slice(argv);
        match Args::parse_from(full).command {
            Command::Serve(a) => a,
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_serve_minimal_has_no_overrides() {
        let o = serve(&[]).overrides();
        assert!(o.port.is_none());
        assert!(o.api_key.is_none());
        assert!(!o.no_ai);
    }

    #[test]
    fn test_serve_full() {
        let a = serve(&[
            "--port",
            "9000",
            "--host",
            "127.0.0.1",
            "--allow-origin",
            "http://a.test,http://b.test",
            "--broadcast-policy",
            "room-including-sender",
            "--model",
            "gemini-1.5-pro",
            "--temperature",
            "0.3",
            "--safety-threshold",
            "block-only-high",
            "--skip-model-list",
        ]);
        assert_eq!(a.port, Some(9000));
        assert_eq!(a.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(a.allow_origin.as_ref().map(Vec::len), Some(2));
        assert_eq!(a.broadcast_policy, Some(BroadcastPolicy::RoomIncludingSender));
        assert_eq!(a.safety_threshold, Some(SafetyThreshold::BlockOnlyHigh));
        assert_eq!(a.temperature, Some(0.3));
        assert!(a.overrides().skip_model_list);
    }

    #[test]
    fn test_serve_no_ai_flag() {
        assert!(serve(&["--no-ai"]).overrides().no_ai);
    }

    #[test]
    fn test_chat_defaults() {
        let Command::Chat(c) = Args::parse_from(["chat-relay", "chat"]).command else {
            panic!("expected chat");
        };
        assert_eq!(c.server, "http://localhost:5000");
        assert!(c.room.is_none());
        assert!(c.name.is_none());
    }

    #[test]
    fn test_chat_with_room_and_name() {
        let Command::Chat(c) =
            Args::parse_from(["chat-relay", "chat", "--room", "lobby", "-n", "Ann"]).command
        else {
            panic!("expected chat");
        };
        assert_eq!(c.room.as_deref(), Some("lobby"));
        assert_eq!(c.name.as_deref(), Some("Ann"));
    }

    #[test]
    fn test_completions_subcommand() {
        let cmd = Args::parse_from(["chat-relay", "completions", "bash"]).command;
        assert!(matches!(cmd, Command::Completions { shell: Shell::Bash }));
    }

    #[test]
    fn test_parse_chat_lines() {
        assert_eq!(parse_chat_line("   "), ChatInput::Empty);
        assert_eq!(parse_chat_line(" hello "), ChatInput::Text("hello".into()));
        assert_eq!(parse_chat_line("/join lobby"), ChatInput::Join("lobby".into()));
        assert_eq!(parse_chat_line("/quit"), ChatInput::Quit);
        assert!(matches!(parse_chat_line("/call"), ChatInput::Invalid(_)));
        assert_eq!(
            parse_chat_line("/image cat.png what is this?"),
            ChatInput::Image { path: "cat.png".into(), text: "what is this?".into() }
        );
        assert_eq!(
            parse_chat_line("/image cat.png"),
            ChatInput::Image { path: "cat.png".into(), text: String::new() }
        );
    }

    #[test]
    fn test_parse_chat_line_rejects_bare_join_and_unknown() {
        assert!(matches!(parse_chat_line("/join"), ChatInput::Invalid(_)));
        assert!(matches!(parse_chat_line("/dance"), ChatInput::Invalid(_)));
    }

    #[test]
    fn test_unknown_policy_rejected() {
        assert!(Args::try_parse_from(["chat-relay", "serve", "--broadcast-policy", "everyone"]).is_err());
    }
}
