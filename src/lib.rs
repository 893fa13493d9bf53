//! Warden - embeddable HTTP daemon
//!
//! An HTTP/1.1 server engine that bridges an event-driven transport with
//! plain blocking handler code: handlers run synchronously per request, defer
//! slow work to a bounded worker pool with [`RequestIo::run_async`], and read
//! or write bodies through ordinary `std::io` streams while the transport
//! suspends and resumes the underlying connection.

pub mod config;
pub mod error;
pub mod http;
pub mod server;

pub use config::{ClientAddrMode, Config, SocketKind};
pub use error::Error;
pub use http::encoding::Encoding;
pub use http::io::{BodyReader, BodyWriter, Phase, RequestIo, WRITE_HIGH_WATER};
pub use http::request::{Method, RequestInfo};
pub use http::response::{Body, Response};
pub use http::ws::{WsMessage, WsReader, WsWriter};
pub use server::daemon::Daemon;
