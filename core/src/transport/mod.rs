//! Master-worker transport
//!
//! Every connection starts with one [`Request`] frame answered by a
//! [`Reply`]. `Register` and `SignOut` are one-shot; a `Stream` request
//! turns the connection into the node's long-lived message stream, carrying
//! [`Envelope`]s in both directions. Frames are newline-delimited JSON.

mod client;
pub mod frame;
mod message;
mod server;

pub use client::{StreamReceiver, StreamSender, WorkerClient};
pub use message::{Envelope, HeartbeatData, Message, NodeInfo, Reply, Request};
pub use server::{MasterServer, ServerEvent};

#[cfg(test)]
mod tests;
