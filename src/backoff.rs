// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Exponential backoff with jitter for reconnect loops.

use crate::config::ReconnectConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_interval: Duration,
    randomization_factor: f64,
    multiplier: f64,
    max_interval: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(cfg: &ReconnectConfig) -> Self {
        let initial_interval = Duration::from_millis(cfg.initial_interval_ms);

        ExponentialBackoff {
            initial_interval,
            randomization_factor: cfg.randomization_factor.clamp(0.0, 1.0),
            multiplier: cfg.multiplier.max(1.0),
            max_interval: Duration::from_millis(cfg.max_interval_ms),
            current: initial_interval,
        }
    }

    pub fn reset(&mut self) {
        self.current = self.initial_interval;
    }

    /// Returns the next wait interval, randomized within
    /// `current ± randomization_factor * current`, and grows the base interval
    /// by the multiplier up to the max interval.
    pub fn next_backoff(&mut self) -> Duration {
        let base = self.current.as_secs_f64();
        let delta = self.randomization_factor * base;
        let interval = if delta > 0.0 {
            let min = base - delta;
            min + rand::random::<f64>() * (2.0 * delta)
        } else {
            base
        };

        self.current = self
            .current
            .mul_f64(self.multiplier)
            .min(self.max_interval);

        Duration::from_secs_f64(interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(randomization_factor: f64) -> ReconnectConfig {
        ReconnectConfig {
            initial_interval_ms: 100,
            randomization_factor,
            multiplier: 2.0,
            max_interval_ms: 500,
        }
    }

    #[test]
    fn grow_until_max_interval() {
        let mut backoff = ExponentialBackoff::new(&cfg(0.0));

        let intervals: Vec<u128> = (0..5).map(|_| backoff.next_backoff().as_millis()).collect();

        assert_eq!(intervals, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn reset_to_initial_interval() {
        let mut backoff = ExponentialBackoff::new(&cfg(0.0));
        backoff.next_backoff();
        backoff.next_backoff();

        backoff.reset();

        assert_eq!(backoff.next_backoff(), Duration::from_millis(100));
    }

    #[test]
    fn randomize_within_bounds() {
        let mut backoff = ExponentialBackoff::new(&cfg(0.5));

        for _ in 0..50 {
            backoff.reset();
            let interval = backoff.next_backoff();
            assert!(interval >= Duration::from_millis(50));
            assert!(interval <= Duration::from_millis(150));
        }
    }
}
