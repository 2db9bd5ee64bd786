//! Process-group establishment and the collective operations.
//!
//! Topology is hub-and-spoke: every non-root rank holds one link to
//! rank 0, which relays barriers and performs the gradient reduction.
//! The group is generic over the link transport so tests can assemble
//! groups from in-memory duplex pairs.

use std::{env, num::NonZeroUsize, time::Duration};

use log::{info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    time,
};

use crate::{
    error::CollectiveError,
    frame::{Control, Frame, FrameOwned, FrameReceiver, FrameSender},
    topology::ProcessTopology,
    Result,
};

const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);
const CONNECT_ATTEMPTS: usize = 60;

/// One framed connection to a peer.
pub struct Link<R, W> {
    rx: FrameReceiver<R>,
    tx: FrameSender<W>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> Link<R, W> {
    pub fn new(rx: FrameReceiver<R>, tx: FrameSender<W>) -> Self {
        Self { rx, tx }
    }

    async fn send(&mut self, frame: &Frame<'_>) -> Result<()> {
        Ok(self.tx.send(frame).await?)
    }

    async fn recv(&mut self) -> Result<FrameOwned> {
        Ok(self.rx.recv().await?)
    }

    /// Receives a frame and requires it to be the given control command.
    async fn expect_control(&mut self, want: Control) -> Result<()> {
        match self.recv().await? {
            FrameOwned::Control(cmd) if cmd == want => Ok(()),
            other => Err(CollectiveError::Protocol(format!(
                "expected {want:?}, got {other:?}"
            ))),
        }
    }
}

enum Links<R, W> {
    /// Single-process group: every collective op is a local no-op.
    Solo,
    /// Rank 0: one link per non-root rank, indexed by rank - 1.
    Root(Vec<Link<R, W>>),
    /// Non-root rank: the single link to rank 0.
    Leaf(Link<R, W>),
}

/// A joined collective-communication context.
///
/// `teardown` must be called exactly once when training completes or is
/// interrupted; it is idempotent and a no-op for a solo group.
pub struct ProcessGroup<R, W> {
    topology: ProcessTopology,
    links: Option<Links<R, W>>,
}

/// The group over real TCP connections, as produced by [`TcpProcessGroup::init`].
pub type TcpProcessGroup = ProcessGroup<OwnedReadHalf, OwnedWriteHalf>;

impl<R, W> ProcessGroup<R, W> {
    /// Creates the single-process group (distributed mode not requested).
    pub fn solo() -> Self {
        Self {
            topology: ProcessTopology::solo(),
            links: Some(Links::Solo),
        }
    }

    /// Assembles the root side of a group from pre-established links,
    /// ordered by peer rank. Used by tests and alternative transports.
    pub fn root_over(links: Vec<Link<R, W>>) -> Self {
        let world_size = NonZeroUsize::new(links.len() + 1).expect("at least one member");
        Self {
            topology: ProcessTopology::new(0, world_size),
            links: Some(Links::Root(links)),
        }
    }

    /// Assembles a non-root member from its link to rank 0.
    pub fn leaf_over(rank: usize, world_size: NonZeroUsize, link: Link<R, W>) -> Self {
        Self {
            topology: ProcessTopology::new(rank, world_size),
            links: Some(Links::Leaf(link)),
        }
    }

    #[inline]
    pub fn topology(&self) -> ProcessTopology {
        self.topology
    }

    fn links_mut(&mut self) -> Result<&mut Links<R, W>> {
        self.links
            .as_mut()
            .ok_or_else(|| CollectiveError::Protocol("group already torn down".into()))
    }
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> ProcessGroup<R, W> {
    /// Blocks until every member of the group has arrived.
    ///
    /// Used to serialize a shared checkpoint read: no process proceeds
    /// while another might still be writing.
    pub async fn barrier(&mut self) -> Result<()> {
        match self.links_mut()? {
            Links::Solo => Ok(()),
            Links::Root(links) => {
                for link in links.iter_mut() {
                    link.expect_control(Control::Barrier).await?;
                }
                for link in links.iter_mut() {
                    link.send(&Frame::Control(Control::Release)).await?;
                }
                Ok(())
            }
            Links::Leaf(link) => {
                link.send(&Frame::Control(Control::Barrier)).await?;
                link.expect_control(Control::Release).await
            }
        }
    }

    /// Averages `buf` element-wise across all members of the group.
    ///
    /// Every process returns with identical values: the mean of all
    /// local contributions. For a solo group the buffer is already its
    /// own mean and is left untouched.
    pub async fn all_reduce_mean(&mut self, buf: &mut [f32]) -> Result<()> {
        let world_size = self.topology.world_size();

        match self.links_mut()? {
            Links::Solo => Ok(()),
            Links::Root(links) => {
                let mut acc = buf.to_vec();
                for link in links.iter_mut() {
                    match link.recv().await? {
                        FrameOwned::Partial(part) => {
                            check_len(part.len(), acc.len())?;
                            for (a, p) in acc.iter_mut().zip(&part) {
                                *a += p;
                            }
                        }
                        other => {
                            return Err(CollectiveError::Protocol(format!(
                                "expected Partial, got {other:?}"
                            )))
                        }
                    }
                }

                let inv = 1.0 / world_size as f32;
                for a in acc.iter_mut() {
                    *a *= inv;
                }

                for link in links.iter_mut() {
                    link.send(&Frame::Reduced(&acc)).await?;
                }

                buf.copy_from_slice(&acc);
                Ok(())
            }
            Links::Leaf(link) => {
                link.send(&Frame::Partial(buf)).await?;
                match link.recv().await? {
                    FrameOwned::Reduced(mean) => {
                        check_len(mean.len(), buf.len())?;
                        buf.copy_from_slice(&mean);
                        Ok(())
                    }
                    other => Err(CollectiveError::Protocol(format!(
                        "expected Reduced, got {other:?}"
                    ))),
                }
            }
        }
    }

    /// Releases the communication context.
    ///
    /// Idempotent: the first call disconnects the links, later calls and
    /// solo groups are no-ops. Send failures during shutdown are logged
    /// and swallowed; the peers may already be gone.
    pub async fn teardown(&mut self) {
        match self.links.take() {
            None | Some(Links::Solo) => {}
            Some(Links::Root(mut links)) => {
                for link in links.iter_mut() {
                    if let Err(e) = link.send(&Frame::Control(Control::Disconnect)).await {
                        warn!("disconnect send failed: {e}");
                    }
                }
            }
            Some(Links::Leaf(mut link)) => {
                if let Err(e) = link.send(&Frame::Control(Control::Disconnect)).await {
                    warn!("disconnect send failed: {e}");
                }
            }
        }
    }
}

fn check_len(got: usize, expected: usize) -> Result<()> {
    if got == expected {
        Ok(())
    } else {
        Err(CollectiveError::SizeMismatch { got, expected })
    }
}

/// Rendezvous parameters, read from the environment the way the original
/// launcher exports them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendezvous {
    pub rank: usize,
    pub world_size: NonZeroUsize,
    pub master_addr: String,
    pub master_port: u16,
}

impl Rendezvous {
    /// Reads the rendezvous configuration through a lookup function.
    ///
    /// Returns `UnavailableBackend` when any of the four variables is
    /// missing or unparseable, and `InitializationFailed` when they are
    /// present but inconsistent (rank outside the world).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).ok_or(CollectiveError::UnavailableBackend);

        let world_size: usize = get("WORLD_SIZE")?
            .parse()
            .map_err(|_| CollectiveError::UnavailableBackend)?;
        let rank: usize = get("RANK")?
            .parse()
            .map_err(|_| CollectiveError::UnavailableBackend)?;
        let master_addr = get("MASTER_ADDR")?;
        let master_port: u16 = get("MASTER_PORT")?
            .parse()
            .map_err(|_| CollectiveError::UnavailableBackend)?;

        let world_size = NonZeroUsize::new(world_size).ok_or_else(|| {
            CollectiveError::InitializationFailed("WORLD_SIZE must be at least 1".into())
        })?;
        if rank >= world_size.get() {
            return Err(CollectiveError::InitializationFailed(format!(
                "rank {rank} outside world of {world_size}"
            )));
        }

        Ok(Self {
            rank,
            world_size,
            master_addr,
            master_port,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }
}

impl TcpProcessGroup {
    /// Establishes the process group.
    ///
    /// When `requested` is false this is the solo group. Otherwise the
    /// rendezvous configuration is taken from the environment; a missing
    /// configuration is `UnavailableBackend` and any failure to confirm
    /// group membership is `InitializationFailed`.
    pub async fn init(requested: bool) -> Result<Self> {
        if !requested {
            return Ok(Self::solo());
        }

        let rdv = Rendezvous::from_env()?;
        if rdv.world_size.get() == 1 {
            info!("world size is 1, running as a solo group");
            return Ok(Self::solo());
        }

        time::timeout(RENDEZVOUS_TIMEOUT, Self::rendezvous(rdv))
            .await
            .map_err(|_| {
                CollectiveError::InitializationFailed("rendezvous timed out".into())
            })?
    }

    async fn rendezvous(rdv: Rendezvous) -> Result<Self> {
        let world_size = rdv.world_size.get();

        if rdv.rank == 0 {
            let addr = format!("{}:{}", rdv.master_addr, rdv.master_port);
            let listener = TcpListener::bind(&addr).await.map_err(|e| {
                CollectiveError::InitializationFailed(format!("cannot bind {addr}: {e}"))
            })?;
            info!("rank 0 awaiting {} peer(s) at {addr}", world_size - 1);

            let mut links: Vec<Option<Link<OwnedReadHalf, OwnedWriteHalf>>> =
                (1..world_size).map(|_| None).collect();

            for _ in 1..world_size {
                let (stream, peer) = listener.accept().await?;
                let (rx, tx) = stream.into_split();
                let mut link = Link::new(FrameReceiver::new(rx), FrameSender::new(tx));

                let rank = match link.recv().await? {
                    FrameOwned::Control(Control::Join { rank }) => rank,
                    other => {
                        return Err(CollectiveError::InitializationFailed(format!(
                            "expected Join from {peer}, got {other:?}"
                        )))
                    }
                };
                if rank == 0 || rank >= world_size {
                    return Err(CollectiveError::InitializationFailed(format!(
                        "peer {peer} announced invalid rank {rank}"
                    )));
                }
                let slot = &mut links[rank - 1];
                if slot.is_some() {
                    return Err(CollectiveError::InitializationFailed(format!(
                        "duplicate rank {rank} from {peer}"
                    )));
                }
                info!("rank {rank} joined from {peer}");
                *slot = Some(link);
            }

            let mut links: Vec<_> = links.into_iter().map(|l| l.expect("all slots filled")).collect();
            for link in links.iter_mut() {
                link.send(&Frame::Control(Control::Welcome { world_size }))
                    .await?;
            }

            Ok(Self::root_over(links))
        } else {
            let addr = format!("{}:{}", rdv.master_addr, rdv.master_port);
            let stream = Self::connect_with_retry(&addr).await?;
            let (rx, tx) = stream.into_split();
            let mut link = Link::new(FrameReceiver::new(rx), FrameSender::new(tx));

            link.send(&Frame::Control(Control::Join { rank: rdv.rank }))
                .await?;
            match link.recv().await? {
                FrameOwned::Control(Control::Welcome { world_size: w }) if w == world_size => {
                    info!("rank {} confirmed in world of {w}", rdv.rank);
                }
                other => {
                    return Err(CollectiveError::InitializationFailed(format!(
                        "membership not confirmed: got {other:?}"
                    )))
                }
            }

            Ok(Self::leaf_over(rdv.rank, rdv.world_size, link))
        }
    }

    async fn connect_with_retry(addr: &str) -> Result<TcpStream> {
        let mut last_err = None;
        for _ in 0..CONNECT_ATTEMPTS {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    last_err = Some(e);
                    time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
        Err(CollectiveError::InitializationFailed(format!(
            "cannot reach {addr}: {}",
            last_err.expect("at least one attempt")
        )))
    }
}
