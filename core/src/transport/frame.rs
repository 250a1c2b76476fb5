//! Newline-delimited JSON framing over TCP

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::error::SwarmResult;

/// Longest accepted frame; stats reports from large runs stay well below it
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Reading half of a framed connection
#[derive(Debug)]
pub struct FrameReader(FramedRead<OwnedReadHalf, LinesCodec>);

/// Writing half of a framed connection
#[derive(Debug)]
pub struct FrameWriter(FramedWrite<OwnedWriteHalf, LinesCodec>);

/// Split a TCP stream into framed halves
pub fn split(stream: TcpStream) -> (FrameReader, FrameWriter) {
    let (read, write) = stream.into_split();
    (
        FrameReader(FramedRead::new(
            read,
            LinesCodec::new_with_max_length(MAX_FRAME_LEN),
        )),
        FrameWriter(FramedWrite::new(
            write,
            LinesCodec::new_with_max_length(MAX_FRAME_LEN),
        )),
    )
}

impl FrameReader {
    /// Read the next frame; `None` once the peer closed the connection
    pub async fn recv<T: DeserializeOwned>(&mut self) -> SwarmResult<Option<T>> {
        match self.0.next().await {
            Some(line) => Ok(Some(serde_json::from_str(&line?)?)),
            None => Ok(None),
        }
    }
}

impl FrameWriter {
    /// Write one frame
    pub async fn send<T: Serialize>(&mut self, value: &T) -> SwarmResult<()> {
        let line = serde_json::to_string(value)?;
        self.0.send(line).await?;
        Ok(())
    }
}
