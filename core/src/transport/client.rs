//! Worker-side connection to the master

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio::time::timeout;

use super::frame::{self, FrameReader, FrameWriter};
use super::message::{Envelope, Message, NodeInfo, Reply, Request};
use crate::config::CONTROL_RPC_TIMEOUT;
use crate::error::{SwarmError, SwarmResult};

/// Issues control requests to the master and opens the message stream
#[derive(Debug, Clone)]
pub struct WorkerClient {
    master: SocketAddr,
    token: Option<String>,
    node: NodeInfo,
}

impl WorkerClient {
    /// Create a client for `node`
    pub fn new(master: SocketAddr, token: Option<String>, node: NodeInfo) -> Self {
        Self {
            master,
            token,
            node,
        }
    }

    /// This worker's node id
    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    /// Master address
    pub fn master(&self) -> SocketAddr {
        self.master
    }

    async fn call(&self, request: Request) -> SwarmResult<(FrameReader, FrameWriter)> {
        let stream = TcpStream::connect(self.master).await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = frame::split(stream);
        writer.send(&request).await?;

        let reply: Reply = reader
            .recv()
            .await?
            .ok_or_else(|| SwarmError::transport("master closed the connection"))?;
        if !reply.ok {
            return Err(SwarmError::transport(format!(
                "master rejected request: {}",
                reply.message
            )));
        }
        Ok((reader, writer))
    }

    /// Register this node with the master
    pub async fn register(&self) -> SwarmResult<()> {
        let request = Request::Register {
            token: self.token.clone(),
            node: self.node.clone(),
        };
        timeout(CONTROL_RPC_TIMEOUT, self.call(request))
            .await
            .map_err(|_| SwarmError::Timeout("register"))??;
        Ok(())
    }

    /// Remove this node from the master
    pub async fn sign_out(&self) -> SwarmResult<()> {
        let request = Request::SignOut {
            token: self.token.clone(),
            node_id: self.node.id.clone(),
        };
        timeout(CONTROL_RPC_TIMEOUT, self.call(request))
            .await
            .map_err(|_| SwarmError::Timeout("sign out"))??;
        Ok(())
    }

    /// Open the bidirectional message stream
    pub async fn open_stream(&self) -> SwarmResult<(StreamReceiver, StreamSender)> {
        let request = Request::Stream {
            token: self.token.clone(),
            node_id: self.node.id.clone(),
        };
        let (reader, writer) = timeout(CONTROL_RPC_TIMEOUT, self.call(request))
            .await
            .map_err(|_| SwarmError::Timeout("open stream"))??;
        Ok((
            StreamReceiver(reader),
            StreamSender {
                writer,
                node_id: self.node.id.clone(),
            },
        ))
    }
}

/// Receiving half of a worker's stream
#[derive(Debug)]
pub struct StreamReceiver(FrameReader);

impl StreamReceiver {
    /// Next message from the master; `None` once the stream closed
    pub async fn recv(&mut self) -> SwarmResult<Option<Message>> {
        Ok(self.0.recv::<Envelope>().await?.map(|envelope| envelope.message))
    }
}

/// Sending half of a worker's stream
#[derive(Debug)]
pub struct StreamSender {
    writer: FrameWriter,
    node_id: String,
}

impl StreamSender {
    /// Send a message to the master
    pub async fn send(&mut self, message: Message) -> SwarmResult<()> {
        self.writer
            .send(&Envelope::new(self.node_id.as_str(), message))
            .await
    }
}
