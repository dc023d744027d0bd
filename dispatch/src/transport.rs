//! Length-prefixed framing over a TCP stream.
//!
//! Every message is a 1-byte command, an 8-byte little-endian payload
//! length, then the payload (zero length is legal). Endianness is
//! negotiated once per connection during the handshake; a peer with the
//! opposite byte order gets every multi-byte payload field byte-swapped at
//! unpack time through the `swap` flag carried by the connection.

use crate::protocol::{Command, ProtocolError};
use shared::{Reader, Record, WireError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

/// Refuse frames beyond this size.
const MAX_FRAME: u64 = 1 << 32;

/// Endian flag for a little-endian peer.
pub const ENDIAN_LITTLE: u8 = 1;

/// One framed message.
#[derive(Debug)]
pub struct Frame {
    /// Leading command byte.
    pub command: Command,
    /// Raw payload.
    pub payload: Vec<u8>,
}

/// A framed connection with negotiated endianness.
pub struct Connection {
    stream: TcpStream,
    /// Whether payload fields from this peer need byte-swapping.
    pub swap: bool,
}

impl Connection {
    /// Wrap an accepted or connected stream; `swap` starts false until the
    /// handshake has negotiated byte order.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            swap: false,
        }
    }

    /// Send one frame.
    pub async fn send(&mut self, command: Command, payload: &[u8]) -> Result<(), ProtocolError> {
        trace!(?command, len = payload.len(), "send frame");
        let mut header = [0u8; 9];
        header[0] = command as u8;
        header[1..9].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        self.stream.write_all(&header).await?;
        if !payload.is_empty() {
            self.stream.write_all(payload).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// Send a record as one frame.
    pub async fn send_record<R: Record>(
        &mut self,
        command: Command,
        record: &R,
    ) -> Result<(), ProtocolError> {
        self.send(command, &record.to_bytes()).await
    }

    /// Receive one frame.
    pub async fn recv(&mut self) -> Result<Frame, ProtocolError> {
        let mut header = [0u8; 9];
        self.stream.read_exact(&mut header).await?;
        let command = Command::from_byte(header[0])?;
        let len = u64::from_le_bytes(header[1..9].try_into().expect("nine-byte header"));
        if len > MAX_FRAME {
            return Err(ProtocolError::FrameTooLarge {
                got: len,
                limit: MAX_FRAME,
            });
        }
        let mut payload = vec![0u8; len as usize];
        if len > 0 {
            self.stream.read_exact(&mut payload).await?;
        }
        trace!(?command, len, "recv frame");
        Ok(Frame { command, payload })
    }

    /// Decode a frame payload as a record, honoring the negotiated swap.
    pub fn decode<R: Record>(&self, frame: &Frame) -> Result<R, WireError> {
        R::from_bytes(&frame.payload, self.swap)
    }

    /// A reader over a frame payload with the negotiated swap.
    pub fn reader<'a>(&self, frame: &'a Frame) -> Reader<'a> {
        Reader::new(&frame.payload, self.swap)
    }

    /// Worker side of the handshake: CONNECT(endian) → CFG(endian),
    /// then host info exchange, then the master's verdict.
    pub async fn handshake_worker(
        &mut self,
        my_info_bytes: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        self.send(Command::Connect, &[ENDIAN_LITTLE]).await?;
        let reply = self.recv().await?;
        if reply.command != Command::Cfg {
            return Err(ProtocolError::UnexpectedCommand(reply.command));
        }
        let master_endian = reply.payload.first().copied().unwrap_or(ENDIAN_LITTLE);
        self.swap = master_endian != ENDIAN_LITTLE;

        self.send(Command::Ok, my_info_bytes).await?;
        let master_info = self.recv().await?;
        if master_info.command != Command::Ok {
            return Err(ProtocolError::UnexpectedCommand(master_info.command));
        }
        let verdict = self.recv().await?;
        match verdict.command {
            Command::Ok => Ok(master_info.payload),
            Command::Err => Err(ProtocolError::PeerError(
                String::from_utf8_lossy(&verdict.payload).into_owned(),
            )),
            other => Err(ProtocolError::UnexpectedCommand(other)),
        }
    }

    /// Master side of the handshake; returns the worker's host-info bytes.
    pub async fn handshake_master(
        &mut self,
        my_info_bytes: &[u8],
        first: Frame,
    ) -> Result<Vec<u8>, ProtocolError> {
        if first.command != Command::Connect {
            return Err(ProtocolError::UnexpectedCommand(first.command));
        }
        let worker_endian = first.payload.first().copied().unwrap_or(ENDIAN_LITTLE);
        self.swap = worker_endian != ENDIAN_LITTLE;
        self.send(Command::Cfg, &[ENDIAN_LITTLE]).await?;

        let info = self.recv().await?;
        if info.command != Command::Ok {
            self.send(Command::Err, b"expected host info").await?;
            return Err(ProtocolError::UnexpectedCommand(info.command));
        }
        self.send(Command::Ok, my_info_bytes).await?;
        self.send(Command::Ok, &[]).await?;
        Ok(info.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let server = listener.accept();
        let (client, server) = tokio::join!(client, server);
        (
            Connection::new(client.unwrap()),
            Connection::new(server.unwrap().0),
        )
    }

    #[tokio::test]
    async fn frames_roundtrip() {
        let (mut a, mut b) = pair().await;
        a.send(Command::GetWork, b"hello").await.unwrap();
        let frame = b.recv().await.unwrap();
        assert_eq!(frame.command, Command::GetWork);
        assert_eq!(frame.payload, b"hello");

        // Zero-length payloads are legal.
        b.send(Command::Ok, &[]).await.unwrap();
        let frame = a.recv().await.unwrap();
        assert_eq!(frame.command, Command::Ok);
        assert!(frame.payload.is_empty());
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let (mut a, mut b) = pair().await;
        // Hand-craft a header with an absurd length.
        let mut header = vec![Command::PutParts as u8];
        header.extend_from_slice(&(MAX_FRAME + 1).to_le_bytes());
        a.stream.write_all(&header).await.unwrap();
        a.stream.flush().await.unwrap();
        assert!(matches!(
            b.recv().await,
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn handshake_negotiates_and_exchanges_info() {
        let (mut worker, mut master) = pair().await;
        let worker_task = tokio::spawn(async move {
            let master_info = worker.handshake_worker(b"worker-host").await.unwrap();
            (worker, master_info)
        });
        let first = master.recv().await.unwrap();
        let worker_info = master
            .handshake_master(b"master-host", first)
            .await
            .unwrap();
        assert_eq!(worker_info, b"worker-host");
        let (worker, master_info) = worker_task.await.unwrap();
        assert_eq!(master_info, b"master-host");
        assert!(!worker.swap);
        assert!(!master.swap);
    }
}
