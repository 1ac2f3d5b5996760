#![allow(dead_code)]

use futures::future;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use worker::dist::StarChannel;

pub type DuplexChannel = StarChannel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// Connects `world_size` ranks in memory, index `i` of the result is rank `i`.
pub async fn star(world_size: usize) -> Vec<DuplexChannel> {
    let mut hub_ends = Vec::new();
    let mut spoke_ends = Vec::new();

    for _ in 1..world_size {
        let (a, b) = tokio::io::duplex(1 << 20);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        hub_ends.push(comms::channel(ar, aw));
        spoke_ends.push(comms::channel(br, bw));
    }

    let spokes = spoke_ends
        .into_iter()
        .enumerate()
        .map(|(i, (rx, tx))| DuplexChannel::spoke(i + 1, world_size, rx, tx));

    let (hub, spokes) = tokio::join!(
        DuplexChannel::hub(world_size, hub_ends),
        future::join_all(spokes)
    );

    let mut channels = vec![hub.unwrap()];
    channels.extend(spokes.into_iter().map(Result::unwrap));
    channels
}
