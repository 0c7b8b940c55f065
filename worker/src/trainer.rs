use std::collections::{BTreeMap, HashMap};

use comms::Collective;
use log::{debug, info};
use rand::{SeedableRng, rngs::StdRng};
use secure_ml::{
    grad_mode::NoGradGuard,
    meters::{Meter, MeterLayout, MeterOptions, TimerMeter, meters_for},
    optimization::{AdamW, Optimizer},
    params::ParamStore,
    reduction::{MeterReducer, allreduce_gradients},
    tensor::Tensor,
};

use crate::{
    config::{PruneConfig, TrainConfig},
    data::Synthetic,
    error::Result,
    metrics::{EpochReport, WorkerMetrics},
    model::{GatedMlp, Losses},
};

/// Trains a replica of the model alongside the rest of the group.
///
/// Every worker must run the same config, gradients are averaged on every
/// step and the meters are reduced at the end of every epoch.
pub struct Trainer<C: Collective> {
    collective: C,
    config: TrainConfig,
    store: ParamStore,
    model: GatedMlp,
    optimizer: AdamW,
    data: Synthetic,
    train_meters: HashMap<String, Meter>,
    val_meters: HashMap<String, Meter>,
    step_timer: TimerMeter,
    metrics: WorkerMetrics,
}

impl<C: Collective> Trainer<C> {
    /// Creates a new `Trainer`.
    ///
    /// The model is initialized from the seed, so every replica starts equal,
    /// while the samples depend on the rank.
    pub fn new(collective: C, config: TrainConfig) -> Result<Self> {
        config.validate()?;

        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(config.seed);
        let model = GatedMlp::new(
            &mut store,
            (config.in_features, config.hidden, config.out_features),
            config.encrypt,
            &mut rng,
        );

        let optimizer = AdamW::new(model.params(), config.optimizer)?;
        let data = Synthetic::new(
            config.in_features,
            config.out_features,
            config.seed,
            collective.rank() as u64,
        );

        let options = MeterOptions {
            layout: MeterLayout::Classification,
            pruning: config.prune.is_some(),
            topk: Vec::new(),
            window: config.meter_window,
        };

        let train_meters = meters_for("train", &options);
        let val_meters = meters_for("val", &options);

        Ok(Self {
            collective,
            config,
            store,
            model,
            optimizer,
            data,
            train_meters,
            val_meters,
            step_timer: TimerMeter::new("train_step_time"),
            metrics: WorkerMetrics::default(),
        })
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    pub fn store(&self) -> &ParamStore {
        &self.store
    }

    pub fn model(&self) -> &GatedMlp {
        &self.model
    }

    /// Runs every epoch of the config.
    ///
    /// # Returns
    /// The reduced metrics of every epoch.
    pub fn run(&mut self) -> Result<Vec<EpochReport>> {
        let mut reports = Vec::with_capacity(self.config.epochs);

        for epoch in 1..=self.config.epochs {
            for _ in 0..self.config.steps_per_epoch {
                self.train_step()?;
            }

            self.validate()?;
            let report = self.reduce(epoch)?;

            if self.collective.is_master() {
                info!(
                    epoch = epoch,
                    hidden = report.hidden,
                    train_loss = report.train.get("loss").copied().unwrap_or(f32::NAN),
                    val_loss = report.val.get("loss").copied().unwrap_or(f32::NAN);
                    "epoch finished"
                );
            }

            reports.push(report);
        }

        info!(
            rank = self.collective.rank(),
            steps = self.metrics.steps,
            samples = self.metrics.samples;
            "training finished"
        );

        Ok(reports)
    }

    /// Makes a single optimization step on a fresh batch.
    pub fn train_step(&mut self) -> Result<Losses> {
        let batch = self.data.batch(self.config.batch_size);
        self.step_timer.start();

        let (model, collective, gate_l1) = (&self.model, &self.collective, self.config.gate_l1);
        let losses = self
            .optimizer
            .step_with_closure(&mut self.store, |_grad, store| {
                let losses = model.forward_backward(store, &batch, gate_l1)?;
                allreduce_gradients(collective, store)?;
                Ok(losses)
            })?;
        self.optimizer.zero_grad(&mut self.store)?;

        self.step_timer.stop();
        self.metrics.bump_step();
        self.metrics.add_samples(batch.len());

        cache(&mut self.train_meters, "loss", losses.mse);
        cache(&mut self.train_meters, "loss_l2", losses.l2);
        cache(&mut self.train_meters, "loss_bn_l1", losses.gate_l1);

        debug!(step = self.metrics.steps, loss = losses.mse; "step done");

        if let Some(prune) = self.config.prune {
            self.maybe_prune(prune)?;
        }

        Ok(losses)
    }

    /// Measures the model on a few batches without tracking gradients.
    fn validate(&mut self) -> Result<()> {
        let _no_grad = NoGradGuard::new();

        for _ in 0..self.config.val_steps {
            let batch = self.data.batch(self.config.batch_size);
            let losses = self.model.forward_backward(&mut self.store, &batch, 0.)?;
            cache(&mut self.val_meters, "loss", losses.mse);
        }

        Ok(())
    }

    fn maybe_prune(&mut self, PruneConfig { step, keep }: PruneConfig) -> Result<()> {
        if self.metrics.steps != step as u64 {
            return Ok(());
        }

        let before = self.model.hidden(&self.store)?;
        let verbose = self.collective.is_master();

        if let Some(mask) = self
            .model
            .prune(&mut self.store, &mut self.optimizer, keep, verbose)?
        {
            self.metrics.add_pruned(before - mask.kept());
            info!(
                rank = self.collective.rank(),
                before = before,
                after = mask.kept();
                "pruned hidden channels"
            );
        }

        Ok(())
    }

    fn reduce(&mut self, epoch: usize) -> Result<EpochReport> {
        let reducer = MeterReducer::new(&self.collective, self.collective.world_size() > 1);
        let (method, encrypt) = (self.config.reduce, self.config.encrypt);

        let train = reducer.reduce_and_flush(&mut self.train_meters, method, encrypt)?;
        let val = reducer.reduce_and_flush(&mut self.val_meters, method, encrypt)?;
        let step_time = self.step_timer.flush();

        Ok(EpochReport {
            epoch,
            hidden: self.model.hidden(&self.store)?,
            train: reveal(train)?,
            val: reveal(val)?,
            step_time,
        })
    }
}

fn cache(meters: &mut HashMap<String, Meter>, key: &str, value: f32) {
    if let Some(meter) = meters.get_mut(key).and_then(Meter::as_scalar_mut) {
        meter.cache(value);
    }
}

fn reveal(values: BTreeMap<String, Tensor>) -> Result<BTreeMap<String, f32>> {
    values
        .into_iter()
        .map(|(name, value)| Ok((name, value.item()?)))
        .collect()
}
