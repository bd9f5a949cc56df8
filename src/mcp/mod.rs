//! Session-pinned client plumbing for the JSON-RPC tool backend.
//!
//! - [`session`]: session token lifecycle and the once-only handshake
//! - [`client`]: HTTP JSON-RPC client with id correlation
//! - [`sse`]: event-stream frame decoder
//! - [`registry`]: tool discovery index and completion-API name mapping
//! - [`types`]: wire types and envelope helpers

pub mod client;
pub mod registry;
pub mod session;
pub mod sse;
pub mod types;

pub use client::{McpClient, ToolBackend};
pub use registry::ToolRegistry;
pub use session::{SESSION_HEADER, SessionRegistry, SessionState};
