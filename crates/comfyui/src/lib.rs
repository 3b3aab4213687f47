//! ComfyUI session transport.
//!
//! One [`session::Session`] per server: typed wire message parsing, binary
//! frame demultiplexing, HTTP API wrappers, reconnection with configurable
//! backoff, an HTTP polling fallback when the event channel cannot be
//! opened, and a broadcast stream of [`events::SessionEvent`]s.
//!
//! The pool consumes sessions through the [`transport::SessionTransport`]
//! trait, which is the full capability set scheduling requires.

pub mod api;
pub mod config;
pub mod events;
pub mod frames;
pub mod messages;
pub mod poller;
pub mod processor;
pub mod reconnect;
pub mod session;
pub mod transport;
