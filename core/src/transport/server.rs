//! Master-side control server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::frame::{self, FrameReader, FrameWriter};
use super::message::{Envelope, Message, Reply, Request};
use crate::config::CONTROL_RPC_TIMEOUT;
use crate::error::SwarmResult;
use crate::node::{WorkerNode, WorkerNodes};

/// Something the server observed about a worker
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A worker registered
    Registered(String),
    /// A worker signed out
    SignedOut(String),
    /// A message arrived on a worker's stream
    Message(Envelope),
    /// A worker's stream closed
    Disconnected(String),
}

/// Accepts worker connections and routes their streams
pub struct MasterServer {
    listener: TcpListener,
    nodes: Arc<WorkerNodes>,
    token: Option<String>,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl MasterServer {
    /// Bind the listener
    pub async fn bind(
        addr: SocketAddr,
        nodes: Arc<WorkerNodes>,
        token: Option<String>,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> SwarmResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            nodes,
            token,
            events,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SwarmResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` is cancelled
    ///
    /// Returns once every connection has closed and flushed what was
    /// queued for its worker.
    pub async fn serve(self, shutdown: CancellationToken) {
        let addr = self.listener.local_addr().ok();
        tracing::info!(addr = ?addr, "Master listening for workers");

        let connections = TaskTracker::new();
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            let connection = Connection {
                nodes: Arc::clone(&self.nodes),
                token: self.token.clone(),
                events: self.events.clone(),
                shutdown: shutdown.clone(),
            };
            connections.spawn(async move {
                if let Err(e) = connection.handle(stream, peer).await {
                    tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
                }
            });
        }

        connections.close();
        connections.wait().await;
        tracing::info!("Master server stopped");
    }
}

struct Connection {
    nodes: Arc<WorkerNodes>,
    token: Option<String>,
    events: mpsc::UnboundedSender<ServerEvent>,
    shutdown: CancellationToken,
}

impl Connection {
    async fn handle(self, stream: TcpStream, peer: SocketAddr) -> SwarmResult<()> {
        let (mut reader, mut writer) = frame::split(stream);

        let request: Request = match timeout(CONTROL_RPC_TIMEOUT, reader.recv()).await {
            Ok(Ok(Some(request))) => request,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tracing::debug!(peer = %peer, "No request before deadline");
                return Ok(());
            }
        };

        if let Some(expected) = &self.token {
            if request.token() != Some(expected.as_str()) {
                tracing::warn!(peer = %peer, "Rejected request with invalid token");
                return writer.send(&Reply::reject("invalid token")).await;
            }
        }

        match request {
            Request::Register { mut node, .. } => {
                if node.ip.is_empty() {
                    node.ip = peer.ip().to_string();
                }
                let id = node.id.clone();
                tracing::info!(node_id = %id, ip = %node.ip, os = %node.os, arch = %node.arch, "Worker registered");
                self.nodes.insert(WorkerNode::new(node));
                writer.send(&Reply::ok()).await?;
                let _ = self.events.send(ServerEvent::Registered(id));
                Ok(())
            }
            Request::SignOut { node_id, .. } => {
                self.nodes.remove(&node_id);
                tracing::info!(node_id = %node_id, "Worker signed out");
                writer.send(&Reply::ok()).await?;
                let _ = self.events.send(ServerEvent::SignedOut(node_id));
                Ok(())
            }
            Request::Stream { node_id, .. } => {
                let Some(node) = self.nodes.get(&node_id) else {
                    tracing::warn!(node_id = %node_id, "Stream requested by unregistered node");
                    return writer.send(&Reply::reject("unknown node")).await;
                };
                writer.send(&Reply::ok()).await?;
                self.pump(node, reader, writer).await;
                Ok(())
            }
        }
    }

    async fn pump(self, node: Arc<WorkerNode>, mut reader: FrameReader, mut writer: FrameWriter) {
        let node_id = node.id().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        node.attach(tx.clone());
        tracing::debug!(node_id = %node_id, "Worker stream opened");

        let writer_id = node_id.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let kind = message.kind();
                if let Err(e) = writer.send(&Envelope::new(writer_id.as_str(), message)).await {
                    tracing::warn!(node_id = %writer_id, kind, error = %e, "Send to worker failed");
                    break;
                }
            }
        });

        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = reader.recv::<Envelope>() => received,
            };
            match received {
                Ok(Some(envelope)) => {
                    let envelope = Envelope::new(node_id.as_str(), envelope.message);
                    if self.events.send(ServerEvent::Message(envelope)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "Bad frame from worker");
                    break;
                }
            }
        }

        node.detach(&tx);
        drop(tx);
        // Flush anything already queued, such as a final quit.
        let _ = timeout(CONTROL_RPC_TIMEOUT, writer_task).await;
        tracing::debug!(node_id = %node_id, "Worker stream closed");
        let _ = self.events.send(ServerEvent::Disconnected(node_id));
    }
}
