use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg},
};
use futures::future;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{CollectiveChannel, Reduce};
use crate::error::{Result, WorkerErr};

/// Both ends of the connection to one peer.
struct Link<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    rx: OnoReceiver<R>,
    tx: OnoSender<W>,
}

enum Role<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Rank 0, linked to every other rank, ordered by rank.
    Hub { spokes: Vec<Link<R, W>> },
    Spoke { hub: Link<R, W> },
}

/// A collective channel over a star topology.
///
/// Rank 0 is the hub: it receives every contribution, sums them in rank order and sends
/// the result back, so every rank ends up with the same bits.
pub struct StarChannel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    rank: usize,
    world_size: usize,
    role: Role<R, W>,
    rx_buf: Vec<u64>,
    barrier_seq: u64,
}

async fn recv_command<R>(rx: &mut OnoReceiver<R>, buf: &mut Vec<u64>) -> Result<Command>
where
    R: AsyncRead + Unpin,
{
    match rx.recv_into::<Msg, _>(buf).await? {
        Msg::Control(cmd) => Ok(cmd),
        Msg::Err(detail) => Err(WorkerErr::protocol(format!("peer failed: {detail}"))),
        other => Err(WorkerErr::protocol(format!(
            "expected a control message, got {}",
            other.kind()
        ))),
    }
}

async fn recv_numbers<'buf, R, T>(
    rx: &mut OnoReceiver<R>,
    buf: &'buf mut Vec<u64>,
    len: usize,
) -> Result<&'buf mut [T]>
where
    R: AsyncRead + Unpin,
    T: Reduce,
{
    let payload = match rx.recv_into::<Msg<'buf>, _>(buf).await? {
        Msg::Data(payload) => payload,
        Msg::Err(detail) => return Err(WorkerErr::protocol(format!("peer failed: {detail}"))),
        other => {
            return Err(WorkerErr::protocol(format!(
                "expected a reduction payload, got {}",
                other.kind()
            )));
        }
    };

    let got = payload.len();
    let nums = T::from_payload(payload)
        .ok_or_else(|| WorkerErr::protocol("peers reduced buffers of different types"))?;

    if got != len {
        return Err(WorkerErr::protocol(format!(
            "peers reduced buffers of different lengths, got {got} and expected {len}"
        )));
    }

    Ok(nums)
}

/// Sends `msg` to every spoke at once.
async fn broadcast<R, W>(spokes: &mut [Link<R, W>], msg: &Msg<'_>) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    future::try_join_all(spokes.iter_mut().map(|spoke| spoke.tx.send(msg))).await?;
    Ok(())
}

impl<R, W> StarChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Builds the hub side, running the handshake with every spoke.
    ///
    /// # Arguments
    /// * `world_size` - The amount of ranks, the hub included.
    /// * `links` - One connection per spoke, in any order.
    ///
    /// # Errors
    /// Returns `WorkerErr::Setup` if a spoke claims a rank out of range or taken, or a
    /// world size other than `world_size`, or if some rank is missing.
    pub async fn hub<I>(world_size: usize, links: I) -> Result<Self>
    where
        I: IntoIterator<Item = (OnoReceiver<R>, OnoSender<W>)>,
    {
        let mut rx_buf = Vec::new();
        let mut slots: Vec<Option<Link<R, W>>> = (1..world_size).map(|_| None).collect();

        for (mut rx, mut tx) in links {
            let cmd = recv_command(&mut rx, &mut rx_buf)
                .await
                .map_err(WorkerErr::setup)?;

            let Command::Join { rank, world_size: theirs } = cmd else {
                return Err(WorkerErr::setup(format!("expected a join, got {cmd:?}")));
            };

            if theirs != world_size {
                return Err(WorkerErr::setup(format!(
                    "rank {rank} believes the world has {theirs} ranks instead of {world_size}"
                )));
            }

            let slot = rank
                .checked_sub(1)
                .and_then(|i| slots.get_mut(i))
                .ok_or_else(|| WorkerErr::setup(format!("rank {rank} can't join as a spoke")))?;

            if slot.is_some() {
                return Err(WorkerErr::setup(format!("rank {rank} joined twice")));
            }

            tx.send(&Msg::Control(Command::Welcome { world_size })).await?;
            debug!(rank = rank; "spoke joined");
            *slot = Some(Link { rx, tx });
        }

        let spokes = slots
            .into_iter()
            .enumerate()
            .map(|(i, link)| link.ok_or_else(|| WorkerErr::setup(format!("rank {} never joined", i + 1))))
            .collect::<Result<_>>()?;

        Ok(Self {
            rank: 0,
            world_size,
            role: Role::Hub { spokes },
            rx_buf,
            barrier_seq: 0,
        })
    }

    /// Builds a spoke side, joining the hub at the other end of `rx` and `tx`.
    ///
    /// # Errors
    /// Returns `WorkerErr::Setup` if the hub does not welcome this rank into a world of
    /// the same size.
    pub async fn spoke(
        rank: usize,
        world_size: usize,
        rx: OnoReceiver<R>,
        tx: OnoSender<W>,
    ) -> Result<Self> {
        let mut hub = Link { rx, tx };
        let mut rx_buf = Vec::new();

        hub.tx
            .send(&Msg::Control(Command::Join { rank, world_size }))
            .await?;

        match recv_command(&mut hub.rx, &mut rx_buf)
            .await
            .map_err(WorkerErr::setup)?
        {
            Command::Welcome { world_size: theirs } if theirs == world_size => {}
            other => {
                return Err(WorkerErr::setup(format!(
                    "rank {rank} was not welcomed, got {other:?}"
                )));
            }
        }

        Ok(Self {
            rank,
            world_size,
            role: Role::Spoke { hub },
            rx_buf,
            barrier_seq: 0,
        })
    }
}

impl<R, W> CollectiveChannel for StarChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn all_reduce_sum<T: Reduce>(&mut self, buf: &mut [T]) -> Result<()> {
        let Self { role, rx_buf, .. } = self;

        match role {
            Role::Hub { spokes } => {
                for spoke in spokes.iter_mut() {
                    let nums = recv_numbers::<_, T>(&mut spoke.rx, rx_buf, buf.len()).await?;
                    buf.iter_mut().zip(nums.iter()).for_each(|(acc, &x)| *acc += x);
                }

                let msg = Msg::Data(T::as_payload(buf));
                broadcast(spokes, &msg).await?;
            }
            Role::Spoke { hub } => {
                let len = buf.len();
                hub.tx.send(&Msg::Data(T::as_payload(buf))).await?;

                let nums = recv_numbers::<_, T>(&mut hub.rx, rx_buf, len).await?;
                buf.copy_from_slice(nums);
            }
        }

        Ok(())
    }

    async fn barrier(&mut self) -> Result<()> {
        let Self {
            role,
            rx_buf,
            barrier_seq,
            ..
        } = self;
        let seq = *barrier_seq;

        match role {
            Role::Hub { spokes } => {
                for (i, spoke) in spokes.iter_mut().enumerate() {
                    match recv_command(&mut spoke.rx, rx_buf).await? {
                        Command::Barrier { seq: theirs } if theirs == seq => {}
                        other => {
                            return Err(WorkerErr::protocol(format!(
                                "rank {} sent {other:?} at barrier {seq}",
                                i + 1
                            )));
                        }
                    }
                }

                broadcast(spokes, &Msg::Control(Command::Release { seq })).await?;
            }
            Role::Spoke { hub } => {
                hub.tx.send(&Msg::Control(Command::Barrier { seq })).await?;

                match recv_command(&mut hub.rx, rx_buf).await? {
                    Command::Release { seq: theirs } if theirs == seq => {}
                    other => {
                        return Err(WorkerErr::protocol(format!(
                            "hub sent {other:?} at barrier {seq}"
                        )));
                    }
                }
            }
        }

        *barrier_seq += 1;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        let rank = self.rank;
        let Self { role, rx_buf, .. } = self;
        let msg = Msg::Control(Command::Disconnect);

        match role {
            Role::Hub { spokes } => {
                for spoke in spokes.iter_mut() {
                    let cmd = recv_command(&mut spoke.rx, rx_buf).await?;
                    if cmd != Command::Disconnect {
                        return Err(WorkerErr::protocol(format!(
                            "expected a disconnect, got {cmd:?}"
                        )));
                    }
                }

                broadcast(spokes, &msg).await?;
            }
            Role::Spoke { hub } => {
                hub.tx.send(&msg).await?;
                let cmd = recv_command(&mut hub.rx, rx_buf).await?;
                if cmd != Command::Disconnect {
                    return Err(WorkerErr::protocol(format!(
                        "expected a disconnect, got {cmd:?}"
                    )));
                }
            }
        }

        debug!(rank = rank; "left the run");
        Ok(())
    }
}
