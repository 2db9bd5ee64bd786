//! Collective-communication backend for data-parallel training.
//!
//! One process per accelerator device joins a process group through a TCP
//! rendezvous; rank 0 acts as the hub. The group exposes the three
//! operations the training loop needs: a barrier, a gradient mean
//! all-reduce and a teardown.

mod error;
mod frame;
mod group;
mod topology;

use tokio::io::{AsyncRead, AsyncWrite};

pub use error::CollectiveError;
pub use frame::{Control, Frame, FrameOwned, FrameReceiver, FrameSender};
pub use group::{Link, ProcessGroup, TcpProcessGroup};
pub use topology::ProcessTopology;

/// The collective module's result type.
pub type Result<T> = std::result::Result<T, CollectiveError>;

/// Creates both ends of a framed link over a reader/writer pair.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// A `Link` bundling a frame receiver and a frame sender.
pub fn link<R, W>(rx: R, tx: W) -> Link<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    Link::new(FrameReceiver::new(rx), FrameSender::new(tx))
}
