// Copyright 2025 the oxserver authors
//
// SPDX-License-Identifier: MIT

//! Main-loop counters, published through tracing once per second. Cheap
//! enough to bump unconditionally; the publish cadence keeps the log
//! readable at 90 frames per second.

use std::time;

use tracing::debug;

const PUBLISH_INTERVAL: time::Duration = time::Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct Counters {
    pub frames_drawn: u64,
    pub frames_skipped: u64,
    pub reconcile_errors: u64,
    pub clients_rejected: u64,
    pub layers_active: usize,
}

pub struct Stats {
    pub counters: Counters,
    last_publish: time::Instant,
    last_frames_drawn: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            counters: Counters::default(),
            last_publish: time::Instant::now(),
            last_frames_drawn: 0,
        }
    }

    /// Called once per loop iteration.
    pub fn tick(&mut self) {
        let now = time::Instant::now();
        if now.duration_since(self.last_publish) < PUBLISH_INTERVAL {
            return;
        }

        let fps = (self.counters.frames_drawn - self.last_frames_drawn) as f64
            / now.duration_since(self.last_publish).as_secs_f64();

        debug!(
            fps,
            frames_drawn = self.counters.frames_drawn,
            frames_skipped = self.counters.frames_skipped,
            reconcile_errors = self.counters.reconcile_errors,
            clients_rejected = self.counters.clients_rejected,
            layers_active = self.counters.layers_active,
            "compositor stats"
        );

        self.last_publish = now;
        self.last_frames_drawn = self.counters.frames_drawn;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut stats = Stats::new();
        stats.counters.frames_drawn += 1;
        stats.counters.frames_skipped += 1;
        stats.tick();

        assert_eq!(stats.counters.frames_drawn, 1);
        assert_eq!(stats.counters.frames_skipped, 1);
    }
}
