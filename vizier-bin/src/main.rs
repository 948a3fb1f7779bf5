use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vizier_core::{
    config::Config,
    error::ChatError,
    model::ChatMessage,
    provider::{ChatConfig, ChatOptions, LlmApi},
    providers::dify::Dify,
    store::{ConversationBindings, ConversationStore},
    stream::StreamTransport,
};

#[derive(Parser)]
#[command(author, version, about = "vizier chat CLI smoke tool", long_about = None)]
struct Cli {
    /// Config file (JSON or TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one chat turn, continuing the session's conversation if bound
    Chat {
        #[arg(short, long, help = "Message from the user")]
        message: String,
        #[arg(short, long, default_value = "cli", help = "Chat session id")]
        session: String,
        /// Stream the reply (prints deltas live)
        #[arg(long)]
        stream: bool,
        /// Use chunked `data:` lines instead of SSE when streaming
        #[arg(long, requires = "stream")]
        chunked: bool,
    },
    /// Drop the stored conversation binding of a session
    Forget {
        #[arg(short, long, default_value = "cli", help = "Chat session id")]
        session: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    let store = Arc::new(ConversationBindings::open_file(&cfg.store.path)?);
    tracing::debug!(path = %cfg.store.path, base_url = %cfg.provider.base_url, "loaded config");

    match cli.command {
        Commands::Chat {
            message,
            session,
            stream,
            chunked,
        } => {
            let dify = Dify::from_config(&cfg, store.clone())?;
            // A bound session continues its conversation across invocations;
            // `forget` starts it fresh.
            let config = ChatConfig {
                conversation_id: store.get(&session),
                stream,
                transport: chunked.then_some(StreamTransport::Chunked),
                ..Default::default()
            };
            let failure: Arc<Mutex<Option<ChatError>>> = Arc::default();
            let sink = failure.clone();
            let options = ChatOptions::new(session.clone(), vec![ChatMessage::user(message)])
                .config(config)
                .on_controller(|token| {
                    tokio::spawn(async move {
                        if tokio::signal::ctrl_c().await.is_ok() {
                            token.cancel();
                        }
                    });
                })
                .on_update(|_, delta| {
                    print!("{delta}");
                    io::stdout().flush().ok();
                })
                .on_finish(move |text, resp| {
                    if stream {
                        println!();
                    } else {
                        println!("{text}");
                    }
                    if let Some(usage) = resp.usage() {
                        eprintln!(
                            "[tokens: {} prompt, {} completion]",
                            usage.prompt_tokens, usage.completion_tokens
                        );
                    }
                })
                .on_error(move |err| {
                    if let Ok(mut slot) = sink.lock() {
                        *slot = Some(err);
                    }
                });

            dify.chat(options).await?;
            if let Some(err) = failure.lock().ok().and_then(|mut slot| slot.take()) {
                return Err(err.into());
            }
            if let Some(id) = store.get(&session) {
                eprintln!("[session {session} -> conversation {id}]");
            }
        }
        Commands::Forget { session } => {
            store.set(&session, None)?;
            eprintln!("[session {session} forgotten]");
        }
    }

    Ok(())
}
