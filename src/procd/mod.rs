//! The tracking daemon: its wire protocol, a client, the server loop and the
//! manager that keeps one running for this process.

mod client;
pub mod lifecycle;
pub mod protocol;
pub mod server;

pub use client::ProcdClient;
pub use lifecycle::{LifecycleState, ProcdManager, ProcdOptions};
pub use server::{ProcdServer, ServerConfig};
