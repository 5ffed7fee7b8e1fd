//! TCP transport for node-to-node frames.
//!
//! Every connection is split into a framed read half and a framed write half.
//! Frame boundaries come from the length prefix, so a writer that holds the
//! write half exclusively for one `send` never interleaves with another.

use std::io;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use super::codec::FrameCodec;

pub type FrameReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
pub type FrameWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

/// Split a connected stream into framed halves.
pub fn split_framed(stream: TcpStream, codec: &FrameCodec) -> io::Result<(FrameReader, FrameWriter)> {
    // Frames are latency-sensitive and already batched by the codec.
    stream.set_nodelay(true)?;
    let (read, write) = stream.into_split();
    Ok((
        FramedRead::new(read, codec.framing()),
        FramedWrite::new(write, codec.framing()),
    ))
}

/// Open a frame connection to `addr` (the next hop's frame listener).
pub async fn dial(addr: &str, codec: &FrameCodec) -> io::Result<(FrameReader, FrameWriter)> {
    tracing::debug!(peer = %addr, "Dialing next hop");
    let stream = TcpStream::connect(addr).await?;
    split_framed(stream, codec)
}

/// Bind the listener that accepts connections from the previous hop.
pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    tracing::debug!(addr = %listener.local_addr()?, "Bound frame listener");
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::RequestId;
    use futures::{SinkExt, StreamExt};

    #[tokio::test]
    async fn dial_and_accept_exchange_frames() {
        let codec = FrameCodec::default();
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = split_framed(stream, &FrameCodec::default()).unwrap();
            let raw = reader.next().await.unwrap().unwrap();
            writer.send(raw.freeze()).await.unwrap();
        });

        let (mut reader, mut writer) = dial(&addr, &codec).await.unwrap();
        let id = RequestId::new();
        writer.send(codec.encode(id, b"ping").unwrap()).await.unwrap();

        let echoed = reader.next().await.unwrap().unwrap();
        let frame = codec.decode(&echoed).unwrap();
        assert_eq!(frame.id, id);
        assert_eq!(frame.payload.as_ref(), b"ping");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn dial_unreachable_fails() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(dial(&addr, &FrameCodec::default()).await.is_err());
    }
}
