//! One-shot "say" command: stream a single reply to stdout and exit.

use std::error::Error;
use std::io::{self, Write};

use crate::core::controller::{ChatController, Submission, TurnUpdate};
use crate::core::persistence::MemoryStore;
use crate::core::session::SessionStore;

pub struct SayOptions {
    pub base_url: String,
    pub mode: String,
    pub thinking_mode: bool,
    pub streaming: bool,
}

pub async fn run_say(prompt: Vec<String>, options: SayOptions) -> Result<(), Box<dyn Error>> {
    let prompt = prompt.join(" ");
    if prompt.is_empty() {
        eprintln!("Usage: lia-chat say <prompt>");
        std::process::exit(1);
    }

    // One-shot invocations stay out of the durable history.
    let store = SessionStore::open(Box::new(MemoryStore::new())).await;
    let mut controller = ChatController::new(
        store,
        reqwest::Client::new(),
        options.base_url,
        options.mode,
        options.thinking_mode,
        options.streaming,
    );

    match controller.submit(&prompt).await? {
        Submission::Streaming => {
            let mut printed_tokens = false;
            loop {
                match controller.next_update().await {
                    TurnUpdate::Token(text) => {
                        printed_tokens = true;
                        print!("{text}");
                        io::stdout().flush()?;
                    }
                    TurnUpdate::Thinking(_) | TurnUpdate::DecodeFailure(_) => {}
                    TurnUpdate::Rendered(content) => {
                        // The final body supersedes the incremental tokens.
                        if printed_tokens {
                            println!();
                        }
                        println!("{content}");
                        printed_tokens = false;
                    }
                    TurnUpdate::Finished => {
                        if printed_tokens {
                            println!();
                        }
                        break;
                    }
                }
            }
        }
        Submission::Complete => {
            if let Some(reply) = controller.messages().last() {
                println!("{}", reply.content);
            }
        }
    }

    Ok(())
}
