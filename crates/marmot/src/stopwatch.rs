// Wall-clock timing for the epoch loop.

use std::time::{Duration, Instant};

/// A simple stopwatch: start, take lap splits, stop.
///
/// The epoch loop reads it only at full barriers (after every device has
/// drained), so the measured spans cover completed work.
#[derive(Debug, Default)]
pub struct Stopwatch {
    start: Option<Instant>,
    laps: Vec<Duration>,
}

impl Stopwatch {
    pub fn new() -> Self {
        Self {
            start: None,
            laps: Vec::new(),
        }
    }

    /// Start (or restart) the stopwatch.
    pub fn start(&mut self) {
        self.start = Some(Instant::now());
        self.laps.clear();
    }

    /// Record a lap split without stopping.
    pub fn lap(&mut self) -> Duration {
        let elapsed = self.start.map(|s| s.elapsed()).unwrap_or_default();
        self.laps.push(elapsed);
        elapsed
    }

    /// Stop and return the total elapsed time.
    pub fn stop(&mut self) -> Duration {
        let elapsed = self.start.map(|s| s.elapsed()).unwrap_or_default();
        self.start = None;
        elapsed
    }

    /// All recorded laps.
    pub fn laps(&self) -> &[Duration] {
        &self.laps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopwatch_basic() {
        let mut watch = Stopwatch::new();
        watch.start();
        let lap = watch.lap();
        let total = watch.stop();
        assert!(total >= lap);
        assert_eq!(watch.laps().len(), 1);
        // Stopped watch reports zero.
        assert_eq!(watch.stop(), Duration::ZERO);
    }
}
