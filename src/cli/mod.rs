//! Command-line interface parsing and handling
//!
//! This module parses command-line arguments, assembles the configured
//! controller, and dispatches into the chat loop or the one-shot command.

pub mod chat;
pub mod say;

use std::error::Error;

use clap::{Parser, Subcommand};
use tracing::warn;

use crate::cli::chat::run_chat;
use crate::cli::say::{run_say, SayOptions};
use crate::core::config::Config;
use crate::core::controller::ChatController;
use crate::core::persistence::JsonFileStore;
use crate::core::session::SessionStore;

#[derive(Parser)]
#[command(name = "lia-chat")]
#[command(about = "A terminal chat client for the LIA local assistant backend")]
#[command(
    long_about = "lia-chat talks to a running LIA backend, streaming replies \
token by token and keeping a durable multi-session conversation history.\n\n\
Configuration lives in a TOML file in the platform config directory; every \
setting can be overridden on the command line.\n\n\
Commands inside the chat loop:\n\
  /new              Start a new session\n\
  /sessions         List sessions with titles and ages\n\
  /switch <id>      Switch to a session\n\
  /delete <id>      Delete a session\n\
  /status           Check backend connectivity\n\
  /quit             Exit"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Backend base URL (default: http://localhost:8000)
    #[arg(short = 'u', long, global = true)]
    pub base_url: Option<String>,

    /// Model mode: "local" or "general"
    #[arg(short = 'm', long, global = true)]
    pub mode: Option<String>,

    /// Ask the backend for a reasoning trace alongside the reply
    #[arg(short = 't', long, global = true)]
    pub thinking: bool,

    /// Use the single-shot endpoint instead of streaming
    #[arg(long, global = true)]
    pub no_stream: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send one prompt, print the reply, and exit
    Say {
        /// The prompt to send
        prompt: Vec<String>,
    },
}

pub async fn run() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            warn!("{err}; continuing with defaults");
            Config::default()
        }
    };

    let base_url = args
        .base_url
        .unwrap_or_else(|| config.base_url().to_string());
    let mode = args.mode.unwrap_or_else(|| config.mode().to_string());
    let thinking_mode = args.thinking || config.thinking_mode();
    let streaming = !args.no_stream;

    match args.command {
        Some(Commands::Say { prompt }) => {
            run_say(
                prompt,
                SayOptions {
                    base_url,
                    mode,
                    thinking_mode,
                    streaming,
                },
            )
            .await
        }
        None => {
            let store = SessionStore::open(Box::new(JsonFileStore::new(
                JsonFileStore::default_path()?,
            )))
            .await;
            let controller = ChatController::new(
                store,
                reqwest::Client::new(),
                base_url,
                mode,
                thinking_mode,
                streaming,
            );
            run_chat(controller).await
        }
    }
}
