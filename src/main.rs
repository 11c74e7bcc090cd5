use std::path::Path;
use std::sync::Arc;

use chat_relay::cli::{parse_chat_line, Args, ChatArgs, ChatInput, Command, ServeArgs};
use chat_relay::client::{self, ChatClient, ClientState, ClientUpdate};
use chat_relay::config::Settings;
use chat_relay::error::RelayError;
use chat_relay::generation::{GeminiBackend, GenerationBackend};
use chat_relay::protocol::{ChatMessage, ServerEvent};
use chat_relay::relay::RelayState;
use chat_relay::voice::SpeechCapabilities;
use chat_relay::web;
use clap::{CommandFactory, Parser};
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

async fn run_serve(args: ServeArgs) -> Result<(), RelayError> {
    let settings = Settings::resolve(&args.overrides(), |key| std::env::var(key).ok())?;

    let backend: Option<Arc<dyn GenerationBackend>> = if settings.ai.enabled {
        let key = settings.credential().ok_or(RelayError::MissingCredential)?;
        let gemini = GeminiBackend::new(key, &settings.ai.model, &settings.ai.api_base);
        if settings.ai.list_models {
            log_models(&gemini).await;
        }
        Some(Arc::new(gemini))
    } else {
        tracing::info!("AI mode off; relaying only");
        None
    };

    web::serve(RelayState::new(settings, backend)).await
}

/// Log the models this key can use for `generateContent`. Never fatal.
async fn log_models(backend: &GeminiBackend) {
    let models = match backend.list_models().await {
        Ok(models) => models,
        Err(e) => {
            tracing::warn!(error = %e, "could not list models");
            return;
        }
    };
    let usable: Vec<_> = models.iter().filter(|m| m.supports_generate_content()).collect();
    tracing::info!(total = models.len(), usable = usable.len(), "models listed");
    for m in &usable {
        tracing::info!(model = %m.name, display = m.display_name.as_deref().unwrap_or("-"), "supports generateContent");
    }
    let configured = backend.model().trim_start_matches("models/");
    if !usable.iter().any(|m| m.name.trim_start_matches("models/") == configured) {
        tracing::warn!(model = configured, "configured model is not in the generateContent list");
    }
}

// ---------------------------------------------------------------------------
// chat
// ---------------------------------------------------------------------------

fn print_message(msg: &ChatMessage, state: &ClientState) {
    let author = if msg.author == state.self_label {
        msg.author.bright_blue().bold()
    } else if Some(msg.author.as_str()) == state.ai_author() {
        msg.author.bright_magenta().bold()
    } else {
        msg.author.bright_green().bold()
    };
    let room = msg.room.as_deref().map(|r| format!(" #{r}")).unwrap_or_default();
    let image = if msg.image.is_some() { " [image]".dimmed().to_string() } else { String::new() };
    println!("{} {}{} {}{}", msg.short_time().dimmed(), author, room.dimmed(), msg.message, image);
}

fn print_help() {
    eprintln!("{}", "  /join <room>          join a room (messages then go to it)".bright_blue());
    eprintln!("{}", "  /image <path> [text]  send an image with optional text".bright_blue());
    eprintln!("{}", "  /quit                 leave".bright_blue());
}

async fn run_chat(args: ChatArgs) -> Result<(), RelayError> {
    let url = client::socket_url(&args.server);
    let mut conn = ChatClient::connect(&url, args.room.as_deref()).await?;
    // No speech front end in the terminal: call mode stays unavailable and
    // the voice commands returned by the state updates are always empty.
    let mut state = ClientState::new(args.name.clone(), args.room.clone(), SpeechCapabilities::none());
    state.on_connected();

    eprintln!("{}", format!("  Connected to {}", url).bright_green());
    if let Some(room) = &state.room {
        eprintln!("{}", format!("  Joined #{}", room).bright_green());
    }
    eprintln!("{}", "  Type /help for commands.".bright_blue());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            update = conn.next_update() => {
                match update {
                    Some(ClientUpdate::Event(event)) => {
                        match &event {
                            ServerEvent::ReceiveMessage(msg) => print_message(msg, &state),
                            ServerEvent::Error(e) => eprintln!("{}", format!("  server: {}", e.message).yellow()),
                            ServerEvent::Welcome(_) => {}
                        }
                        let _ = state.on_event(event);
                    }
                    Some(ClientUpdate::Disconnected(reason)) => {
                        let _ = state.on_disconnected();
                        let reason = reason.unwrap_or_else(|| "closed by server".to_string());
                        eprintln!("{}", format!("  Disconnected: {}", reason).red());
                        break;
                    }
                    None => break,
                }
            }

            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let (text, image) = match parse_chat_line(&line) {
                    ChatInput::Empty => continue,
                    ChatInput::Quit => break,
                    ChatInput::Help => {
                        print_help();
                        continue;
                    }
                    ChatInput::Invalid(raw) => {
                        eprintln!("{}", format!("  unknown command: {}", raw).yellow());
                        continue;
                    }
                    ChatInput::Join(room) => {
                        conn.join(&room)?;
                        eprintln!("{}", format!("  Joined #{}", room).bright_green());
                        state.room = Some(room);
                        continue;
                    }
                    ChatInput::Text(text) => (text, None),
                    ChatInput::Image { path, text } => match client::encode_image_file(Path::new(&path)).await {
                        Ok(image) => (text, Some(image)),
                        Err(e) => {
                            eprintln!("{}", format!("  could not read image: {}", e).yellow());
                            continue;
                        }
                    },
                };
                let optimistic = !state.server_echoes();
                if let Some(payload) = state.prepare_send(&text, image) {
                    conn.send_message(payload)?;
                    if optimistic {
                        if let Some(own) = state.messages().last() {
                            print_message(own, &state);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    let args = Args::parse();

    let result = match args.command {
        Command::Serve(serve) => run_serve(serve).await,
        Command::Chat(chat) => run_chat(chat).await,
        Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Args::command(), "chat-relay", &mut std::io::stdout());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}
