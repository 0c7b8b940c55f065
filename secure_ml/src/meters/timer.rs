use std::time::{Duration, Instant};

/// Accumulated wall time of a recurring phase, like a training step.
#[derive(Debug, Clone, Default)]
pub struct TimerMeter {
    name: String,
    total: Duration,
    count: u32,
    started: Option<Instant>,
}

impl TimerMeter {
    /// Creates a new `TimerMeter`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts timing, restarting if it was already started.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Stops timing and accumulates the elapsed time, if it was started.
    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.record(started.elapsed());
        }
    }

    #[inline]
    pub fn record(&mut self, elapsed: Duration) {
        self.total += elapsed;
        self.count += 1;
    }

    /// Returns the mean of the recorded durations.
    pub fn mean(&self) -> Option<Duration> {
        (self.count > 0).then(|| self.total / self.count)
    }

    /// Returns the mean of the recorded durations and starts over.
    pub fn flush(&mut self) -> Option<Duration> {
        let mean = self.mean();
        self.total = Duration::ZERO;
        self.count = 0;
        self.started = None;
        mean
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_recorded_durations() {
        let mut timer = TimerMeter::new("train_step_time");
        assert!(timer.mean().is_none());

        timer.record(Duration::from_millis(10));
        timer.record(Duration::from_millis(30));
        assert_eq!(timer.flush(), Some(Duration::from_millis(20)));
        assert!(timer.mean().is_none());
    }

    #[test]
    fn stop_without_start_records_nothing() {
        let mut timer = TimerMeter::new("t");
        timer.stop();
        assert!(timer.mean().is_none());

        timer.start();
        timer.stop();
        assert!(timer.mean().is_some());
    }
}
