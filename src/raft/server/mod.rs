//! Server layer - protocol implementations
//!
//! - `in_process`: in-memory message routing for multi-broker tests
//! - `http`: axum server and reqwest client with JSON bodies

pub mod http;
pub mod in_process;

pub use http::{HttpMessageSender, HttpServer, StatusProvider};
pub use in_process::{InProcessMessageSender, InProcessServer};
