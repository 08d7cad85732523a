//! Interactive line-based chat loop.
//!
//! This is the thin presentation collaborator over the controller: it
//! reads input lines, issues controller commands, and prints the reactive
//! state. Streamed tokens are echoed as they arrive; the authoritative
//! final body, when it differs, is printed on its own line afterwards.

use std::error::Error;
use std::io::{self, Write};

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::core::controller::{ChatController, Submission, TurnUpdate};
use crate::core::session::{relative_age, title_for};

pub async fn run_chat(mut controller: ChatController) -> Result<(), Box<dyn Error>> {
    println!("lia-chat — type a message, or /help for commands.");
    println!("Backend: {}", controller.probe_connectivity().await);

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        print!("> ");
        io::stdout().flush()?;

        let line = match lines.next_line().await? {
            Some(line) => line,
            None => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('/') {
            if handle_command(&mut controller, command).await? {
                break;
            }
            continue;
        }

        match controller.submit(line).await {
            Ok(Submission::Streaming) => pump_stream(&mut controller).await?,
            Ok(Submission::Complete) => {
                if let Some(reply) = controller.messages().last() {
                    println!("{}", reply.content);
                }
            }
            Err(err) => eprintln!("{err}"),
        }
    }

    Ok(())
}

async fn pump_stream(controller: &mut ChatController) -> Result<(), Box<dyn Error>> {
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
                return Ok(());
            }
        }
    }
}

/// Returns `true` when the loop should exit.
async fn handle_command(
    controller: &mut ChatController,
    command: &str,
) -> Result<bool, Box<dyn Error>> {
    let mut parts = command.split_whitespace();
    match parts.next() {
        Some("quit") | Some("q") | Some("exit") => return Ok(true),
        Some("new") => {
            let id = controller.new_session().await;
            println!("Started session {id}.");
        }
        Some("sessions") => {
            let store = controller.session_store();
            if store.sessions().is_empty() {
                println!("No sessions yet.");
            }
            for session in store.sessions() {
                let marker = if store.active_id() == Some(session.id) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{marker} {}  {}  ({})",
                    session.id,
                    title_for(session),
                    relative_age(session.updated_at)
                );
            }
        }
        Some("switch") => match parts.next().and_then(|raw| raw.parse::<u64>().ok()) {
            Some(id) => {
                controller.switch_session(id);
                for message in controller.messages() {
                    println!("[{}] {}", message.role.as_str(), message.content);
                }
            }
            None => eprintln!("Usage: /switch <session-id>"),
        },
        Some("delete") => match parts.next().and_then(|raw| raw.parse::<u64>().ok()) {
            Some(id) => {
                if let Err(err) = controller.delete_session(id).await {
                    eprintln!("{err}");
                }
            }
            None => eprintln!("Usage: /delete <session-id>"),
        },
        Some("status") => {
            println!("Backend: {}", controller.probe_connectivity().await);
        }
        Some("help") => {
            println!("/new               start a new session");
            println!("/sessions          list sessions");
            println!("/switch <id>       switch to a session");
            println!("/delete <id>       delete a session");
            println!("/status            check backend connectivity");
            println!("/quit              exit");
        }
        _ => eprintln!("Unknown command: /{command}"),
    }
    Ok(false)
}
