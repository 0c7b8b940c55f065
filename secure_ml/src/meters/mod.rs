//! Training metrics, grouped per phase.

mod scalar;
mod timer;

use std::{collections::HashMap, num::NonZeroUsize};

pub use scalar::ScalarMeter;
pub use timer::TimerMeter;

/// Any meter kept by the training loop.
///
/// Only scalar meters take part in reductions.
#[derive(Debug, Clone)]
pub enum Meter {
    Scalar(ScalarMeter),
    Timer(TimerMeter),
}

impl Meter {
    pub fn name(&self) -> &str {
        match self {
            Meter::Scalar(m) => m.name(),
            Meter::Timer(m) => m.name(),
        }
    }

    pub fn as_scalar(&self) -> Option<&ScalarMeter> {
        match self {
            Meter::Scalar(m) => Some(m),
            Meter::Timer(_) => None,
        }
    }

    pub fn as_scalar_mut(&mut self) -> Option<&mut ScalarMeter> {
        match self {
            Meter::Scalar(m) => Some(m),
            Meter::Timer(_) => None,
        }
    }
}

impl From<ScalarMeter> for Meter {
    fn from(value: ScalarMeter) -> Self {
        Self::Scalar(value)
    }
}

impl From<TimerMeter> for Meter {
    fn from(value: TimerMeter) -> Self {
        Self::Timer(value)
    }
}

/// The set of metrics a task reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterLayout {
    /// Loss and top-k errors.
    Classification,
    /// Classification, also measured on the whole network.
    Distill,
    /// Loss and accuracy.
    Segmentation,
    /// Segmentation, also measured on the whole network.
    SegmentationDistill,
}

/// Options for building a family of meters.
#[derive(Debug, Clone)]
pub struct MeterOptions {
    pub layout: MeterLayout,
    pub pruning: bool,
    pub topk: Vec<usize>,
    pub window: Option<NonZeroUsize>,
}

impl Default for MeterOptions {
    fn default() -> Self {
        Self {
            layout: MeterLayout::Classification,
            pruning: false,
            topk: vec![1, 5],
            window: None,
        }
    }
}

/// Builds the meters of a phase, keyed by metric.
///
/// Each meter is named `{phase}_{key}`. The regularization losses are only
/// tracked while training with pruning enabled.
///
/// # Arguments
/// * `phase` - The phase, like `train` or `val`.
/// * `options` - What to measure.
pub fn meters_for(phase: &str, options: &MeterOptions) -> HashMap<String, Meter> {
    let whole = matches!(
        options.layout,
        MeterLayout::Distill | MeterLayout::SegmentationDistill
    );
    let segmentation = matches!(
        options.layout,
        MeterLayout::Segmentation | MeterLayout::SegmentationDistill
    );

    let mut keys = vec!["loss".to_string()];
    if segmentation {
        keys.push("acc".to_string());
    }

    if whole {
        keys.push("loss_whole".to_string());
        if segmentation {
            keys.push("acc_whole".to_string());
        }
    }

    if phase == "train" && options.pruning {
        keys.push("loss_l2".to_string());
        keys.push("loss_bn_l1".to_string());
    }

    if !segmentation {
        for k in &options.topk {
            keys.push(format!("top{k}_error"));
            if whole {
                keys.push(format!("top{k}_error_whole"));
            }
        }
    }

    keys.into_iter()
        .map(|key| {
            let name = format!("{phase}_{key}");
            let meter = match options.window {
                Some(window) => ScalarMeter::with_window(name, window),
                None => ScalarMeter::new(name),
            };

            (key, Meter::Scalar(meter))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted_keys(meters: &HashMap<String, Meter>) -> Vec<&str> {
        let mut keys: Vec<_> = meters.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    #[test]
    fn classification_train_with_pruning() {
        let options = MeterOptions {
            pruning: true,
            ..Default::default()
        };
        let meters = meters_for("train", &options);

        assert_eq!(
            sorted_keys(&meters),
            ["loss", "loss_bn_l1", "loss_l2", "top1_error", "top5_error"]
        );
        assert_eq!(meters["top5_error"].name(), "train_top5_error");
    }

    #[test]
    fn regularization_losses_only_while_training() {
        let options = MeterOptions {
            pruning: true,
            ..Default::default()
        };
        let meters = meters_for("val", &options);
        assert!(!meters.contains_key("loss_l2"));
    }

    #[test]
    fn distill_layouts_add_whole_network_meters() {
        let options = MeterOptions {
            layout: MeterLayout::Distill,
            topk: vec![1],
            ..Default::default()
        };
        assert_eq!(
            sorted_keys(&meters_for("val", &options)),
            ["loss", "loss_whole", "top1_error", "top1_error_whole"]
        );

        let options = MeterOptions {
            layout: MeterLayout::SegmentationDistill,
            ..Default::default()
        };
        assert_eq!(
            sorted_keys(&meters_for("val", &options)),
            ["acc", "acc_whole", "loss", "loss_whole"]
        );
    }
}
