use std::{io, num::NonZeroUsize, thread};

use comms::{Collective, LocalGroup, Rendezvous, Solo, TcpGroup};
use log::{debug, info};

use crate::{config::TrainConfig, error::Result, metrics::EpochReport, trainer::Trainer};

/// Trains a group of `workers` replicas, one per thread of this process.
///
/// # Returns
/// The reports of every worker, indexed by rank.
pub fn train_local(config: TrainConfig, workers: NonZeroUsize) -> Result<Vec<Vec<EpochReport>>> {
    config.validate()?;
    info!(workers = workers.get(); "spawning local workers");

    let handles: Vec<_> = LocalGroup::group(workers)
        .into_iter()
        .map(|collective| {
            let config = config.clone();
            thread::spawn(move || run(collective, config))
        })
        .collect();

    handles
        .into_iter()
        .map(|handle| {
            handle
                .join()
                .map_err(|_| io::Error::other("worker thread panicked"))?
        })
        .collect()
}

/// Trains this process' replica of a group connected through TCP.
///
/// The master listens at `addr` until every other rank connected to it, a
/// group of one trains on its own without listening.
///
/// # Arguments
/// * `config` - The run, equal on every worker.
/// * `addr` - The master's address.
/// * `rank` - This worker's rank.
/// * `world_size` - The amount of workers in the group.
pub fn train_tcp(
    config: TrainConfig,
    addr: &str,
    rank: usize,
    world_size: usize,
) -> Result<Vec<EpochReport>> {
    config.validate()?;

    match (world_size, rank) {
        (0 | 1, _) => run(Solo::new(), config),
        (_, 0) => {
            let rendezvous = Rendezvous::bind(addr)?;
            info!(addr = addr, world_size = world_size; "waiting for workers");
            run(rendezvous.accept(world_size)?, config)
        }
        _ => run(TcpGroup::connect(addr, rank, world_size)?, config),
    }
}

fn run<C: Collective>(collective: C, config: TrainConfig) -> Result<Vec<EpochReport>> {
    debug!(rank = collective.rank(), world_size = collective.world_size(); "worker joined");
    Trainer::new(collective, config)?.run()
}
