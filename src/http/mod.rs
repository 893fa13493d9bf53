//! HTTP layer: wire parsing and serialization, content-encoding negotiation,
//! and the per-request I/O engine that lets blocking handler code coexist
//! with an event-driven transport.
//!
//! # Layout
//!
//! - **`parser`**: incremental request-head parser (bodies are delivered
//!   separately, on demand)
//! - **`request`**: immutable per-request facts ([`request::RequestInfo`])
//! - **`response`**: attached responses and the default error pages
//! - **`writer`**: response-head and chunked-body serialization
//! - **`encoding`**: Accept-Encoding parsing and negotiation, gzip/deflate
//!   codecs
//! - **`io`**: the request lifecycle engine ([`io::RequestIo`]) with its
//!   blocking body adapters
//! - **`ws`**: websocket handshake, frame codec and message I/O
//!
//! # Request lifecycle
//!
//! ```text
//!        ┌──────────┐
//!        │   Sync   │ ← handler runs on the transport task
//!        └────┬─────┘
//!             │ handler returns
//!             ▼
//!        ┌──────────┐  continuation scheduled   ┌──────────┐
//!        │   Idle   │ ────────────────────────> │  Async   │
//!        └────┬─────┘ <──────────────────────── └────┬─────┘
//!             │         continuation returns         │
//!             │ response sent                        │ upgrade
//!             ▼                                      ▼
//!          (done)                             ┌───────────┐
//!                                             │ WebSocket │
//!                                             └───────────┘
//!
//!   any state ──teardown with work in flight──> Zombie (terminal)
//! ```

pub mod encoding;
pub mod io;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
pub mod ws;
