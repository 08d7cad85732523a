pub mod accumulator;
pub mod chat_stream;
pub mod config;
pub mod connectivity;
pub mod controller;
pub mod event;
pub mod message;
pub mod persistence;
pub mod session;
pub mod sse;
