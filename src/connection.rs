//! Deadline-bounded frame I/O over a generic async socket.
//!
//! Split into a [`FrameReader`] and [`FrameWriter`] pair (mirroring the
//! original's split `bufio.Reader`/`bufio.Writer`) so a connection's read
//! loop and its reply-writer task can own a half each after
//! `tokio::io::split`.

use crate::errors::ProtocolError;
use crate::frame;
use crate::frame::Frame;
use crate::pool;
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::time::timeout;

/// Reads frames off a socket half, applying an idle deadline while waiting
/// for the next frame to start and a tighter read deadline once bytes
/// start arriving.
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        FrameReader {
            reader,
            buffer: pool::get(),
        }
    }

    /// Read the next complete frame, or `Ok(None)` on a clean EOF/idle
    /// timeout — both are treated as "no more frames" rather than errors.
    #[tracing::instrument(skip(self))]
    pub async fn read_frame(
        &mut self,
        idle_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Option<Frame>, ProtocolError> {
        loop {
            if let Some(total) = frame::check(&self.buffer) {
                let (parsed, consumed) = frame::parse(&self.buffer)?;
                debug_assert_eq!(consumed, total);
                self.buffer.advance(consumed);
                return Ok(Some(parsed));
            }

            let deadline = if self.buffer.is_empty() {
                idle_timeout
            } else {
                read_timeout
            };

            let mut chunk = [0u8; 4096];
            let read = match timeout(deadline, self.reader.read(&mut chunk)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(ProtocolError::Io(e)),
                Err(_elapsed) => {
                    if self.buffer.is_empty() {
                        tracing::debug!("connection idle timeout");
                        return Ok(None);
                    }
                    return Err(ProtocolError::Timeout);
                }
            };

            if read == 0 {
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }
}

impl<R> Drop for FrameReader<R> {
    fn drop(&mut self) {
        pool::put(std::mem::take(&mut self.buffer));
    }
}

/// Writes frames to a socket half under a write deadline.
pub struct FrameWriter<W> {
    writer: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        FrameWriter {
            writer: BufWriter::new(writer),
        }
    }

    #[tracing::instrument(skip(self, frame))]
    pub async fn write_frame(
        &mut self,
        frame: &Frame,
        write_timeout: Duration,
    ) -> Result<(), ProtocolError> {
        let mut buf = pool::get();
        if let Err(e) = frame::encode(&mut buf, frame) {
            pool::put(buf);
            return Err(e);
        }

        let outcome = timeout(write_timeout, async {
            self.writer.write_all(&buf).await?;
            self.writer.flush().await
        })
        .await;

        pool::put(buf);

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProtocolError::Io(e)),
            Err(_elapsed) => Err(ProtocolError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameType, FLAG_FIN};
    use bytes::Bytes;

    fn sample_frame() -> Frame {
        Frame {
            ftype: FrameType::HaproxyNotify,
            flags: FLAG_FIN,
            stream_id: 1,
            frame_id: 1,
            data: Bytes::from_static(b"hello"),
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips_over_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let mut writer = FrameWriter::new(client_write);
        let frame = sample_frame();
        writer
            .write_frame(&frame, Duration::from_secs(1))
            .await
            .unwrap();
        drop(client_read);

        let mut reader = FrameReader::new(server_read);
        let received = reader
            .read_frame(Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap()
            .expect("frame should have been read");

        assert_eq!(received.ftype, frame.ftype);
        assert_eq!(received.data, frame.data);
        drop(server_write);
    }

    #[tokio::test]
    async fn read_frame_returns_none_on_clean_eof() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = FrameReader::new(server);
        let result = reader
            .read_frame(Duration::from_millis(100), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn read_frame_times_out_while_idle() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);
        let result = reader
            .read_frame(Duration::from_millis(20), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.is_none());
        drop(client);
    }

    #[tokio::test]
    async fn multiple_frames_pipelined_are_each_read() {
        let (client, server) = tokio::io::duplex(4096);
        let (_client_read, client_write) = tokio::io::split(client);
        let (server_read, _server_write) = tokio::io::split(server);

        let mut writer = FrameWriter::new(client_write);
        let frame = sample_frame();
        writer.write_frame(&frame, Duration::from_secs(1)).await.unwrap();
        writer.write_frame(&frame, Duration::from_secs(1)).await.unwrap();

        let mut reader = FrameReader::new(server_read);
        let first = reader
            .read_frame(Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        let second = reader
            .read_frame(Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.data, frame.data);
        assert_eq!(second.data, frame.data);
    }
}
