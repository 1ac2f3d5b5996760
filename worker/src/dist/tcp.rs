use std::time::Duration;

use log::{debug, info};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::{self, Instant},
};

use super::{StarChannel, Topology};
use crate::error::{Result, WorkerErr};

/// The port used when neither `--port` nor `MASTER_PORT` is given.
pub const DEFAULT_PORT: u16 = 10685;

/// How long ranks wait for each other before giving up on the run.
pub const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(60);

const RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Connects every rank into a star around rank 0.
///
/// Rank 0 listens on the master address and waits for every other rank to join, the
/// other ranks keep dialing it until it answers.
///
/// # Errors
/// Returns `WorkerErr::Setup` if the address can't be bound or reached, a handshake
/// fails or `timeout` runs out first.
pub async fn rendezvous(
    topology: &Topology,
    timeout: Duration,
) -> Result<StarChannel<OwnedReadHalf, OwnedWriteHalf>> {
    let addr = format!("{}:{}", topology.master_addr, topology.port);

    let rendezvous = async {
        if topology.rank == 0 {
            accept_spokes(&addr, topology.world_size).await
        } else {
            join_hub(&addr, topology.rank, topology.world_size, timeout).await
        }
    };

    match time::timeout(timeout, rendezvous).await {
        Ok(channel) => channel,
        Err(_) => Err(WorkerErr::setup(format!(
            "rendezvous at {addr} timed out after {timeout:?}"
        ))),
    }
}

async fn accept_spokes(
    addr: &str,
    world_size: usize,
) -> Result<StarChannel<OwnedReadHalf, OwnedWriteHalf>> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| WorkerErr::setup(format!("failed to bind {addr}: {e}")))?;
    info!("waiting for {} ranks at {addr}", world_size - 1);

    let mut links = Vec::with_capacity(world_size - 1);
    for _ in 1..world_size {
        let (stream, peer) = listener.accept().await.map_err(WorkerErr::setup)?;
        stream.set_nodelay(true)?;
        debug!("connection from {peer}");

        let (rx, tx) = stream.into_split();
        links.push(comms::channel(rx, tx));
    }

    StarChannel::hub(world_size, links).await
}

async fn join_hub(
    addr: &str,
    rank: usize,
    world_size: usize,
    timeout: Duration,
) -> Result<StarChannel<OwnedReadHalf, OwnedWriteHalf>> {
    let deadline = Instant::now() + timeout;

    let stream = loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => break stream,
            Err(e) if Instant::now() + RETRY_INTERVAL < deadline => {
                debug!("rank 0 at {addr} not reachable yet: {e}");
                time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                return Err(WorkerErr::setup(format!("failed to reach {addr}: {e}")));
            }
        }
    };

    stream.set_nodelay(true)?;
    let (rx, tx) = stream.into_split();
    let (rx, tx) = comms::channel(rx, tx);
    StarChannel::spoke(rank, world_size, rx, tx).await
}
