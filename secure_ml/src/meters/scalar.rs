use std::{collections::VecDeque, num::NonZeroUsize};

use crate::tensor::Tensor;

/// Recent values of a named scalar metric.
///
/// Values are buffered until the meter is flushed, flushing clears the buffer
/// and keeps the reduced value around as the last value.
#[derive(Debug, Clone)]
pub struct ScalarMeter {
    name: String,
    values: VecDeque<f32>,
    window: Option<NonZeroUsize>,
    last: Option<Tensor>,
}

impl ScalarMeter {
    /// Creates a new unbounded `ScalarMeter`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: VecDeque::new(),
            window: None,
            last: None,
        }
    }

    /// Creates a new `ScalarMeter` that only keeps the latest `window` values.
    pub fn with_window(name: impl Into<String>, window: NonZeroUsize) -> Self {
        Self {
            window: Some(window),
            ..Self::new(name)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Buffers a single value, evicting the oldest one if the window is full.
    pub fn cache(&mut self, value: f32) {
        self.values.push_back(value);

        if let Some(window) = self.window {
            while self.values.len() > window.get() {
                self.values.pop_front();
            }
        }
    }

    /// Buffers every value of `values` in order.
    pub fn cache_list<I>(&mut self, values: I)
    where
        I: IntoIterator<Item = f32>,
    {
        for value in values {
            self.cache(value);
        }
    }

    /// Returns the buffered values, oldest first.
    pub fn values(&self) -> Vec<f32> {
        self.values.iter().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Clears the buffer and records `value` as the last value.
    pub fn flush(&mut self, value: Option<Tensor>) {
        self.values.clear();
        self.last = value;
    }

    /// Returns the value recorded by the latest flush.
    pub fn last_value(&self) -> Option<&Tensor> {
        self.last.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_evicts_oldest_values() {
        let mut meter = ScalarMeter::with_window("train_loss", NonZeroUsize::new(3).unwrap());
        meter.cache_list([1.0, 2.0, 3.0, 4.0]);
        meter.cache(5.0);

        assert_eq!(meter.values(), [3.0, 4.0, 5.0]);
    }

    #[test]
    fn flush_clears_and_keeps_last_value() {
        let mut meter = ScalarMeter::new("val_acc");
        meter.cache_list([0.5, 0.7]);
        meter.flush(Some(Tensor::scalar(0.6)));

        assert!(meter.is_empty());
        assert_eq!(meter.last_value().unwrap().item().unwrap(), 0.6);

        meter.flush(None);
        assert!(meter.last_value().is_none());
    }
}
