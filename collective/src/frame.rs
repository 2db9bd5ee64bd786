//! The framed wire protocol between group members.
//!
//! Every frame is `u64` big-endian payload length, `u32` big-endian kind
//! header, then the payload: JSON for control commands, raw `f32` data
//! for tensors. Tensor sends are zero-copy casts of the caller's slice.

use std::{io, mem::size_of};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type LenType = u64;
type Header = u32;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();
const HEADER_SIZE: usize = size_of::<Header>();

const KIND_CONTROL: Header = 1;
const KIND_PARTIAL: Header = 2;
const KIND_REDUCED: Header = 3;

/// Control commands exchanged during rendezvous, barriers and teardown.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Control {
    /// A joining process announces its rank to the hub.
    Join { rank: usize },
    /// The hub confirms group membership.
    Welcome { world_size: usize },
    /// Arrival at a barrier.
    Barrier,
    /// Release from a barrier.
    Release,
    /// Orderly shutdown of the link.
    Disconnect,
}

/// An outgoing frame; tensor payloads borrow the caller's buffer.
#[derive(Debug)]
pub enum Frame<'a> {
    Control(Control),
    /// A process's locally accumulated gradient contribution.
    Partial(&'a [f32]),
    /// The averaged gradient broadcast by the hub.
    Reduced(&'a [f32]),
}

/// An incoming frame; tensor payloads are decoded into owned buffers.
#[derive(Debug, PartialEq)]
pub enum FrameOwned {
    Control(Control),
    Partial(Vec<f32>),
    Reduced(Vec<f32>),
}

/// The sending end of a framed link.
pub struct FrameSender<W> {
    tx: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameSender<W> {
    pub fn new(tx: W) -> Self {
        Self {
            tx,
            buf: Vec::new(),
        }
    }

    /// Sends one frame through the inner writer.
    pub async fn send(&mut self, frame: &Frame<'_>) -> io::Result<()> {
        let Self { tx, buf } = self;

        buf.clear();
        buf.resize(LEN_TYPE_SIZE, 0);

        let tail: Option<&[u8]> = match frame {
            Frame::Control(cmd) => {
                buf.extend_from_slice(&KIND_CONTROL.to_be_bytes());
                serde_json::to_writer(&mut *buf, cmd)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                None
            }
            Frame::Partial(nums) => {
                buf.extend_from_slice(&KIND_PARTIAL.to_be_bytes());
                Some(bytemuck::cast_slice(nums))
            }
            Frame::Reduced(nums) => {
                buf.extend_from_slice(&KIND_REDUCED.to_be_bytes());
                Some(bytemuck::cast_slice(nums))
            }
        };

        let len = buf.len() - LEN_TYPE_SIZE + tail.map(<[_]>::len).unwrap_or_default();
        let header = (len as LenType).to_be_bytes();
        buf[..header.len()].copy_from_slice(&header);

        tx.write_all(buf).await?;
        if let Some(data) = tail {
            tx.write_all(data).await?;
        }

        tx.flush().await
    }
}

/// The receiving end of a framed link.
pub struct FrameReceiver<R> {
    rx: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReceiver<R> {
    pub fn new(rx: R) -> Self {
        Self {
            rx,
            buf: Vec::new(),
        }
    }

    /// Waits for the next frame from the inner reader.
    pub async fn recv(&mut self) -> io::Result<FrameOwned> {
        let mut len_buf = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut len_buf).await?;
        let len = LenType::from_be_bytes(len_buf) as usize;

        if len < HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes is shorter than its header"),
            ));
        }

        self.buf.resize(len, 0);
        self.rx.read_exact(&mut self.buf).await?;

        let (kind_buf, body) = self.buf.split_at(HEADER_SIZE);
        let kind = Header::from_be_bytes(kind_buf.try_into().expect("split above"));

        match kind {
            KIND_CONTROL => {
                let cmd = serde_json::from_slice(body)?;
                Ok(FrameOwned::Control(cmd))
            }
            KIND_PARTIAL | KIND_REDUCED => {
                let nums = decode_f32(body)?;
                Ok(match kind {
                    KIND_PARTIAL => FrameOwned::Partial(nums),
                    _ => FrameOwned::Reduced(nums),
                })
            }
            byte => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("received an invalid kind header {byte}"),
            )),
        }
    }
}

/// Decodes a raw tensor body without assuming the buffer is aligned.
fn decode_f32(body: &[u8]) -> io::Result<Vec<f32>> {
    if body.len() % size_of::<f32>() != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("tensor body of {} bytes is not a whole f32 count", body.len()),
        ));
    }

    Ok(body
        .chunks_exact(size_of::<f32>())
        .map(|c| f32::from_ne_bytes(c.try_into().expect("exact chunks")))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(frame: Frame<'_>) -> FrameOwned {
        let (client, server) = tokio::io::duplex(4096);
        let (_, tx) = tokio::io::split(client);
        let (rx, _) = tokio::io::split(server);

        let mut sender = FrameSender::new(tx);
        let mut receiver = FrameReceiver::new(rx);

        sender.send(&frame).await.unwrap();
        receiver.recv().await.unwrap()
    }

    #[tokio::test]
    async fn control_frames_roundtrip() {
        let got = roundtrip(Frame::Control(Control::Join { rank: 3 })).await;
        assert_eq!(got, FrameOwned::Control(Control::Join { rank: 3 }));

        let got = roundtrip(Frame::Control(Control::Barrier)).await;
        assert_eq!(got, FrameOwned::Control(Control::Barrier));
    }

    #[tokio::test]
    async fn tensor_frames_roundtrip() {
        let xs = [1.0f32, -2.5, 3.25, f32::MAX];

        let got = roundtrip(Frame::Partial(&xs)).await;
        assert_eq!(got, FrameOwned::Partial(xs.to_vec()));

        let got = roundtrip(Frame::Reduced(&xs)).await;
        assert_eq!(got, FrameOwned::Reduced(xs.to_vec()));
    }

    #[tokio::test]
    async fn empty_tensor_is_valid() {
        let got = roundtrip(Frame::Partial(&[])).await;
        assert_eq!(got, FrameOwned::Partial(Vec::new()));
    }
}
