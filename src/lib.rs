//! lia-chat is a terminal client for the LIA local assistant backend.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the session model, the streaming pipeline (frame
//!   decoding, event classification, message folding), durable persistence,
//!   connectivity tracking, and the per-turn orchestration state machine.
//! - [`api`] defines the wire payloads exchanged with the backend's chat,
//!   streaming, and health endpoints.
//! - [`cli`] parses arguments and runs the interactive chat loop or the
//!   one-shot `say` command.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::run`].

pub mod api;
pub mod cli;
pub mod core;
pub mod utils;
