//! Storage node agent
//!
//! Holds chunk bytes on local disk, serves them over HTTP to the
//! coordinator and heartbeats to it on a fixed interval.

pub mod heartbeat;
pub mod http;
pub mod server;
pub mod store;

pub use heartbeat::HeartbeatTask;
pub use server::NodeServer;
pub use store::LocalChunkStore;
