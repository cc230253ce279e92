//! Frame channels: the reliable, ordered byte pipe an exchange runs over.
//!
//! Physical transport is outside this crate. Anything that can move whole
//! frames in order implements [`FrameChannel`]; two implementations ship
//! here, an in-process pair and a length-prefixed adapter over any tokio
//! byte stream.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ChannelError;

/// A bidirectional, ordered channel of frames to exactly one peer.
#[async_trait]
pub trait FrameChannel: Send + Sync {
    /// Send one frame. May be called concurrently.
    async fn send(&self, frame: Vec<u8>) -> Result<(), ChannelError>;

    /// Next inbound frame, or `None` once the peer is gone.
    /// Must be cancellation safe: dropping the future loses no frame.
    async fn recv(&self) -> Option<Vec<u8>>;
}

/// One end of an in-process channel pair.
pub struct MemoryChannel {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl MemoryChannel {
    /// Two connected ends.
    pub fn pair() -> (MemoryChannel, MemoryChannel) {
        Self::pair_with_capacity(64)
    }

    pub fn pair_with_capacity(capacity: usize) -> (MemoryChannel, MemoryChannel) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            MemoryChannel {
                tx: a_tx,
                rx: Mutex::new(a_rx),
            },
            MemoryChannel {
                tx: b_tx,
                rx: Mutex::new(b_rx),
            },
        )
    }
}

#[async_trait]
impl FrameChannel for MemoryChannel {
    async fn send(&self, frame: Vec<u8>) -> Result<(), ChannelError> {
        self.tx.send(frame).await.map_err(|_| ChannelError::Closed)
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        self.rx.lock().await.recv().await
    }
}

/// Write one length-prefixed frame: a 4-byte big-endian length, then the bytes.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8], max_frame_size: usize) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    if frame.len() > max_frame_size || frame.len() > u32::MAX as usize {
        return Err(ChannelError::FrameTooLarge {
            size: frame.len(),
            max: max_frame_size,
        });
    }
    let mut buf = Vec::with_capacity(4 + frame.len());
    buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
    buf.extend_from_slice(frame);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. A clean end of stream before the
/// length prefix yields `Ok(None)`.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Vec<u8>>, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_size {
        return Err(ChannelError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        });
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

/// [`FrameChannel`] over any async byte stream, such as a `TcpStream`.
///
/// A background task reads frames into a queue so that `recv` stays
/// cancellation safe. Must be created inside a tokio runtime.
pub struct StreamChannel<S> {
    writer: Mutex<WriteHalf<S>>,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    reader: JoinHandle<()>,
    max_frame_size: usize,
}

impl<S> StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(io: S, max_frame_size: usize) -> Self {
        let (mut read_half, write_half) = tokio::io::split(io);
        let (tx, rx) = mpsc::channel(16);
        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half, max_frame_size).await {
                    Ok(Some(frame)) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("stream closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "dropping stream after read failure");
                        break;
                    }
                }
            }
        });
        Self {
            writer: Mutex::new(write_half),
            inbound: Mutex::new(rx),
            reader,
            max_frame_size,
        }
    }
}

#[async_trait]
impl<S> FrameChannel for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, frame: Vec<u8>) -> Result<(), ChannelError> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &frame, self.max_frame_size).await
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        self.inbound.lock().await.recv().await
    }
}

impl<S> Drop for StreamChannel<S> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn memory_pair_is_bidirectional() {
        let (a, b) = MemoryChannel::pair();
        a.send(b"ping".to_vec()).await.unwrap();
        b.send(b"pong".to_vec()).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), b"ping");
        assert_eq!(a.recv().await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn memory_pair_reports_closure() {
        let (a, b) = MemoryChannel::pair();
        a.send(b"last".to_vec()).await.unwrap();
        drop(a);
        assert_eq!(b.recv().await.unwrap(), b"last");
        assert!(b.recv().await.is_none());
        assert!(matches!(b.send(vec![1]).await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn frame_is_length_prefixed() {
        let mut mock = Builder::new().write(&[0, 0, 0, 3, b'a', b'b', b'c']).build();
        write_frame(&mut mock, b"abc", 1024).await.unwrap();
    }

    #[tokio::test]
    async fn reads_frames_until_eof() {
        let mut mock = Builder::new()
            .read(&[0, 0, 0, 2, 7, 8])
            .read(&[0, 0, 0, 0])
            .build();
        assert_eq!(read_frame(&mut mock, 1024).await.unwrap(), Some(vec![7, 8]));
        assert_eq!(read_frame(&mut mock, 1024).await.unwrap(), Some(vec![]));
        assert_eq!(read_frame(&mut mock, 1024).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frames_are_refused() {
        let mut mock = Builder::new().read(&[0, 0, 1, 0]).build();
        assert!(matches!(
            read_frame(&mut mock, 16).await,
            Err(ChannelError::FrameTooLarge { size: 256, max: 16 })
        ));

        let mut sink = Builder::new().build();
        assert!(matches!(
            write_frame(&mut sink, &[0; 32], 16).await,
            Err(ChannelError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn stream_channel_over_duplex() {
        let (left, right) = tokio::io::duplex(1024);
        let a = StreamChannel::new(left, 1024);
        let b = StreamChannel::new(right, 1024);
        a.send(vec![1, 2, 3]).await.unwrap();
        a.send(vec![4]).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(b.recv().await.unwrap(), vec![4]);
        drop(a);
        assert!(b.recv().await.is_none());
    }
}
