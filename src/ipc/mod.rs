//! TCP+msgpack IPC transport layer.
//!
//! Exposes the orchestrator to the UI layer and to the external execution
//! system over length-prefixed msgpack frames (see [`codec`]).

pub mod codec;
pub mod handlers;
pub mod router;
pub mod server;

pub use server::IpcServer;
