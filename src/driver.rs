use std::time::Duration;

use crate::carbon::{CarbonShipper, ShipError};
use crate::datapoint::{now_epoch, CounterCache};
use crate::samplers::Sampler;

/// Fixed-interval tick loop: read every sampler, resolve through the
/// counter cache, ship the batch. See spec §4.8.
pub struct Driver {
    samplers: Vec<Box<dyn Sampler>>,
    cache: CounterCache,
    shipper: CarbonShipper,
    interval_secs: i64,
    dry_run: bool,
}

impl Driver {
    pub fn new(
        samplers: Vec<Box<dyn Sampler>>,
        cache: CounterCache,
        shipper: CarbonShipper,
        interval: Duration,
        dry_run: bool,
    ) -> Self {
        Self {
            samplers,
            cache,
            shipper,
            interval_secs: interval.as_secs().max(1) as i64,
            dry_run,
        }
    }

    /// Runs samplers in registration order, resolving each datapoint
    /// through the counter cache at the given tick timestamp.
    fn run_tick(&mut self, ts: i64) -> Vec<(String, f64, i64)> {
        let mut resolved = Vec::new();
        for sampler in &mut self.samplers {
            for dp in sampler.read() {
                if let Some(tuple) = self.cache.resolve(&dp, Some(ts)) {
                    resolved.push(tuple);
                }
            }
        }
        resolved
    }

    pub async fn run(mut self) -> Result<(), ShipError> {
        let mut next_tick = now_epoch();
        loop {
            next_tick = next_scheduled_tick(next_tick, now_epoch(), self.interval_secs);
            let wait = (next_tick - now_epoch()).max(0);
            if wait > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(wait as u64)) => {}
                    _ = tokio::signal::ctrl_c() => {
                        log::info!("stop signal received, shutting down");
                        self.stop();
                        return Ok(());
                    }
                }
            }

            let ts = now_epoch();
            let resolved = self.run_tick(ts);
            if self.dry_run {
                log::debug!("dry-run: {} datapoints would have shipped", resolved.len());
            } else {
                self.shipper.send(&resolved)?;
            }
            next_tick += self.interval_secs;
        }
    }

    /// Unblocks any sampler holding a tailer open. See spec §5: a stop
    /// signal must close the tailer's file handles, not just the sleep.
    fn stop(&mut self) {
        for sampler in &mut self.samplers {
            sampler.stop();
        }
    }
}

fn next_scheduled_tick(mut next_tick: i64, now: i64, interval: i64) -> i64 {
    while next_tick < now {
        next_tick += interval;
    }
    next_tick
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapoint::Datapoint;

    #[test]
    fn skips_missed_ticks() {
        assert_eq!(next_scheduled_tick(0, 125, 60), 180);
    }

    #[test]
    fn stays_put_when_already_scheduled_ahead() {
        assert_eq!(next_scheduled_tick(100, 50, 60), 100);
    }

    struct CountingSampler {
        value: f64,
    }

    impl Sampler for CountingSampler {
        fn read(&mut self) -> Vec<Datapoint> {
            self.value += 100.0;
            vec![Datapoint::counter("cpu", self.value)]
        }
    }

    struct StoppableSampler {
        stopped: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    impl Sampler for StoppableSampler {
        fn read(&mut self) -> Vec<Datapoint> {
            Vec::new()
        }

        fn stop(&mut self) {
            self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn stop_reaches_every_sampler() {
        let stopped = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut driver = Driver::new(
            vec![Box::new(StoppableSampler { stopped: stopped.clone() })],
            CounterCache::new(12 * 3600, 4),
            CarbonShipper::new("127.0.0.1:1".to_string(), "host", Duration::from_millis(1), Some(0)),
            Duration::from_secs(60),
            true,
        );
        driver.stop();
        assert!(stopped.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn run_tick_resolves_counters_across_calls() {
        let mut driver = Driver::new(
            vec![Box::new(CountingSampler { value: 0.0 })],
            CounterCache::new(12 * 3600, 4),
            CarbonShipper::new("127.0.0.1:1".to_string(), "host", Duration::from_millis(1), Some(0)),
            Duration::from_secs(60),
            true,
        );
        assert!(driver.run_tick(10).is_empty());
        let second = driver.run_tick(11);
        assert_eq!(second, vec![("cpu".to_string(), 100.0, 11)]);
    }
}
