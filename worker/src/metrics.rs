use std::{collections::BTreeMap, time::Duration};

/// Local counters of a worker, never reduced across the group.
#[derive(Debug, Default, Clone)]
pub struct WorkerMetrics {
    pub steps: u64,
    pub samples: u64,
    pub pruned_channels: u64,
}

impl WorkerMetrics {
    #[inline]
    pub fn bump_step(&mut self) {
        self.steps += 1;
    }

    #[inline]
    pub fn add_samples(&mut self, n: usize) {
        self.samples += n as u64;
    }

    #[inline]
    pub fn add_pruned(&mut self, n: usize) {
        self.pruned_channels += n as u64;
    }
}

/// The reduced metrics of an epoch, identical on every worker of the group.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    /// Hidden channels of the model at the end of the epoch.
    pub hidden: usize,
    pub train: BTreeMap<String, f32>,
    pub val: BTreeMap<String, f32>,
    /// Mean wall time of a training step on this worker.
    pub step_time: Option<Duration>,
}
