//! The distributed context: who this process is and how it talks to its peers.

mod local;
mod star;
mod tcp;

use std::{env, ops::AddAssign, time::Duration};

use comms::msg::Payload;
use log::{debug, info};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

pub use local::LocalChannel;
pub use star::StarChannel;
pub use tcp::{DEFAULT_PORT, RENDEZVOUS_TIMEOUT, rendezvous};

use crate::error::{Result, WorkerErr};

/// A number type that can travel in a reduction.
pub trait Reduce: Copy + AddAssign + Send + Sync + 'static {
    fn as_payload(buf: &mut [Self]) -> Payload<'_>;

    /// Views a received payload as numbers of this type, `None` if its kind differs.
    fn from_payload(payload: Payload<'_>) -> Option<&mut [Self]>;
}

impl Reduce for f32 {
    fn as_payload(buf: &mut [Self]) -> Payload<'_> {
        Payload::F32(buf)
    }

    fn from_payload(payload: Payload<'_>) -> Option<&mut [Self]> {
        match payload {
            Payload::F32(nums) => Some(nums),
            _ => None,
        }
    }
}

impl Reduce for u64 {
    fn as_payload(buf: &mut [Self]) -> Payload<'_> {
        Payload::U64(buf)
    }

    fn from_payload(payload: Payload<'_>) -> Option<&mut [Self]> {
        match payload {
            Payload::U64(nums) => Some(nums),
            _ => None,
        }
    }
}

/// The collective operations every worker takes part in.
///
/// Every worker must issue the same calls in the same order, a call only returns once
/// every worker made it.
#[allow(unused)]
#[trait_variant::make(CollectiveChannel: Send)]
pub trait CollectiveChannelTemplate {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Replaces `buf` on every worker with the elementwise sum of every worker's `buf`.
    ///
    /// # Errors
    /// Returns `WorkerErr::Protocol` if the workers contributed buffers of different kinds
    /// or lengths.
    async fn all_reduce_sum<T: Reduce>(&mut self, buf: &mut [T]) -> Result<()>;

    /// Waits until every worker reaches the barrier.
    async fn barrier(&mut self) -> Result<()>;

    /// Tells the peers this worker is done, no collective may follow.
    async fn shutdown(&mut self) -> Result<()>;
}

/// The compute device a worker is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu { ordinal: usize },
}

/// The immutable identity of a worker within the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub rank: usize,
    pub world_size: usize,
    pub local_rank: usize,
    pub device: Device,
}

impl WorkerIdentity {
    pub fn is_main(&self) -> bool {
        self.rank == 0
    }
}

/// The process layout handed down by the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub rank: usize,
    pub world_size: usize,
    pub local_rank: usize,
    pub master_addr: String,
    pub port: u16,
}

impl Topology {
    /// Reads the layout from the launcher variables.
    ///
    /// # Arguments
    /// * `var` - Looks a variable up by name.
    /// * `port` - Overrides `MASTER_PORT` when given.
    ///
    /// # Returns
    /// `None` when `WORLD_SIZE` is not set, that is a single process run.
    pub fn from_vars<F>(var: F, port: Option<u16>) -> Result<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(world_size) = var("WORLD_SIZE") else {
            return Ok(None);
        };

        let parse = |name: &str, value: String| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|e| WorkerErr::setup(format!("{name}={value} is not valid: {e}")))
        };

        let world_size = parse("WORLD_SIZE", world_size)?;
        let rank = match var("RANK") {
            Some(value) => parse("RANK", value)?,
            None => return Err(WorkerErr::setup("WORLD_SIZE is set but RANK is not")),
        };
        let local_rank = match var("LOCAL_RANK") {
            Some(value) => parse("LOCAL_RANK", value)?,
            None => rank,
        };

        if world_size == 0 || rank >= world_size {
            return Err(WorkerErr::setup(format!(
                "rank {rank} is out of a world of size {world_size}"
            )));
        }

        let port = match (port, var("MASTER_PORT")) {
            (Some(port), _) => port,
            (None, Some(value)) => value
                .trim()
                .parse()
                .map_err(|e| WorkerErr::setup(format!("MASTER_PORT={value} is not valid: {e}")))?,
            (None, None) => DEFAULT_PORT,
        };

        Ok(Some(Self {
            rank,
            world_size,
            local_rank,
            master_addr: var("MASTER_ADDR").unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
        }))
    }
}

/// The collective channel of a run, either the single process one or a TCP star.
pub enum Collective {
    Local(LocalChannel),
    Tcp(StarChannel<OwnedReadHalf, OwnedWriteHalf>),
}

impl CollectiveChannel for Collective {
    fn rank(&self) -> usize {
        match self {
            Collective::Local(channel) => CollectiveChannel::rank(channel),
            Collective::Tcp(channel) => CollectiveChannel::rank(channel),
        }
    }

    fn world_size(&self) -> usize {
        match self {
            Collective::Local(channel) => CollectiveChannel::world_size(channel),
            Collective::Tcp(channel) => CollectiveChannel::world_size(channel),
        }
    }

    async fn all_reduce_sum<T: Reduce>(&mut self, buf: &mut [T]) -> Result<()> {
        match self {
            Collective::Local(channel) => CollectiveChannel::all_reduce_sum(channel, buf).await,
            Collective::Tcp(channel) => CollectiveChannel::all_reduce_sum(channel, buf).await,
        }
    }

    async fn barrier(&mut self) -> Result<()> {
        match self {
            Collective::Local(channel) => CollectiveChannel::barrier(channel).await,
            Collective::Tcp(channel) => CollectiveChannel::barrier(channel).await,
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        match self {
            Collective::Local(channel) => CollectiveChannel::shutdown(channel).await,
            Collective::Tcp(channel) => CollectiveChannel::shutdown(channel).await,
        }
    }
}

/// Everything a worker needs to take part in the run.
pub struct DistributedContext {
    pub identity: WorkerIdentity,
    pub channel: Collective,
}

/// Joins the run described by the launcher variables.
///
/// # Arguments
/// * `port` - Overrides `MASTER_PORT` when given.
///
/// # Errors
/// Returns `WorkerErr::Setup` if the variables are invalid or the rendezvous fails.
pub async fn setup(port: Option<u16>) -> Result<DistributedContext> {
    let topology = Topology::from_vars(|name| env::var(name).ok(), port)?;
    setup_with(topology, RENDEZVOUS_TIMEOUT).await
}

/// Like [`setup`] but with an explicit layout and rendezvous timeout.
pub async fn setup_with(topology: Option<Topology>, timeout: Duration) -> Result<DistributedContext> {
    let Some(topology) = topology else {
        info!("no WORLD_SIZE set, running as a single process");
        return Ok(DistributedContext {
            identity: WorkerIdentity {
                rank: 0,
                world_size: 1,
                local_rank: 0,
                device: Device::Cpu { ordinal: 0 },
            },
            channel: Collective::Local(LocalChannel::new()),
        });
    };

    let identity = WorkerIdentity {
        rank: topology.rank,
        world_size: topology.world_size,
        local_rank: topology.local_rank,
        device: Device::Cpu {
            ordinal: topology.local_rank,
        },
    };

    let channel = if topology.world_size == 1 {
        Collective::Local(LocalChannel::new())
    } else {
        Collective::Tcp(rendezvous(&topology, timeout).await?)
    };

    debug!(
        rank = identity.rank,
        world_size = identity.world_size,
        local_rank = identity.local_rank;
        "joined the run"
    );

    Ok(DistributedContext { identity, channel })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn missing_world_size_is_single_process() {
        assert_eq!(Topology::from_vars(vars(&[("RANK", "0")]), None).unwrap(), None);
    }

    #[test]
    fn port_flag_overrides_master_port() {
        let env = vars(&[
            ("RANK", "1"),
            ("WORLD_SIZE", "2"),
            ("MASTER_PORT", "1234"),
        ]);

        let topology = Topology::from_vars(&env, Some(4321)).unwrap().unwrap();
        assert_eq!(topology.port, 4321);
        assert_eq!(topology.master_addr, "127.0.0.1");
        assert_eq!(topology.local_rank, 1);

        let topology = Topology::from_vars(&env, None).unwrap().unwrap();
        assert_eq!(topology.port, 1234);
    }

    #[test]
    fn default_port_is_used_without_master_port() {
        let env = vars(&[("RANK", "0"), ("WORLD_SIZE", "1"), ("LOCAL_RANK", "3")]);

        let topology = Topology::from_vars(env, None).unwrap().unwrap();
        assert_eq!(topology.port, DEFAULT_PORT);
        assert_eq!(topology.local_rank, 3);
    }

    #[test]
    fn rank_outside_the_world_is_a_setup_error() {
        let env = vars(&[("RANK", "2"), ("WORLD_SIZE", "2")]);
        assert!(matches!(
            Topology::from_vars(env, None),
            Err(WorkerErr::Setup(_))
        ));
    }

    #[tokio::test]
    async fn single_process_context_binds_device_zero() {
        let ctx = setup_with(None, RENDEZVOUS_TIMEOUT).await.unwrap();

        assert!(ctx.identity.is_main());
        assert_eq!(ctx.identity.device, Device::Cpu { ordinal: 0 });
        assert_eq!(CollectiveChannel::world_size(&ctx.channel), 1);
    }
}
