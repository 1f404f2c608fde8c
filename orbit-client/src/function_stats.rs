use orbit_proto::FunctionStats;

/// Running duration statistics of one instrumented function.
///
/// The variance uses the Welford recurrence
/// `var_n = ((n-1) * var_{n-1} + (x - avg_n) * (x - avg_{n-1})) / n`
/// in double precision. Durations on long captures reach 1e16 ns, where the
/// textbook `E[X^2] - E[X]^2` form cancels catastrophically.
#[derive(Debug, Clone, Copy, Default)]
pub struct FunctionStatsAccumulator {
    count: u64,
    total_time_ns: u64,
    min_ns: u64,
    max_ns: u64,
    avg_ns: f64,
    variance_ns: f64,
}

impl FunctionStatsAccumulator {
    pub fn update(&mut self, duration_ns: u64) {
        self.count += 1;
        self.total_time_ns += duration_ns;
        if self.count == 1 {
            self.min_ns = duration_ns;
            self.max_ns = duration_ns;
        } else {
            self.min_ns = self.min_ns.min(duration_ns);
            self.max_ns = self.max_ns.max(duration_ns);
        }
        let duration = duration_ns as f64;
        let count = self.count as f64;
        let previous_avg = self.avg_ns;
        self.avg_ns = previous_avg + (duration - previous_avg) / count;
        self.variance_ns = ((count - 1.0) * self.variance_ns
            + (duration - self.avg_ns) * (duration - previous_avg))
            / count;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn to_proto(self) -> FunctionStats {
        FunctionStats {
            count: self.count,
            total_time_ns: self.total_time_ns,
            average_time_ns: self.avg_ns.round() as u64,
            min_ns: self.min_ns,
            max_ns: self.max_ns,
            variance_ns: self.variance_ns,
            std_dev_ns: self.variance_ns.sqrt(),
        }
    }
}

impl From<FunctionStats> for FunctionStatsAccumulator {
    fn from(stats: FunctionStats) -> Self {
        FunctionStatsAccumulator {
            count: stats.count,
            total_time_ns: stats.total_time_ns,
            min_ns: stats.min_ns,
            max_ns: stats.max_ns,
            avg_ns: stats.average_time_ns as f64,
            variance_ns: stats.variance_ns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_moments() {
        let mut stats = FunctionStatsAccumulator::default();
        for duration in [10, 20, 30] {
            stats.update(duration);
        }
        let proto = stats.to_proto();
        assert_eq!(proto.count, 3);
        assert_eq!(proto.total_time_ns, 60);
        assert_eq!(proto.average_time_ns, 20);
        assert_eq!(proto.min_ns, 10);
        assert_eq!(proto.max_ns, 30);
        // Population variance of {10, 20, 30}.
        assert!((proto.variance_ns - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn welford_matches_batch_formula_on_large_durations() {
        // 200k durations around 1e16 ns with pseudo-random jitter; no rand
        // needed, xorshift is plenty.
        let mut state = 0x9e3779b97f4a7c15u64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let durations: Vec<u64> = (0..200_000)
            .map(|_| 10_000_000_000_000_000 + next() % 1_000_000_000)
            .collect();

        let mut stats = FunctionStatsAccumulator::default();
        for &duration in &durations {
            stats.update(duration);
        }

        // Batch two-pass reference.
        let count = durations.len() as f64;
        let mean = durations.iter().map(|&d| d as f64).sum::<f64>() / count;
        let batch_variance = durations
            .iter()
            .map(|&d| {
                let delta = d as f64 - mean;
                delta * delta
            })
            .sum::<f64>()
            / count;

        let relative_error = (stats.to_proto().variance_ns - batch_variance).abs()
            / batch_variance.max(f64::MIN_POSITIVE);
        assert!(
            relative_error < 1e-5,
            "relative error too large: {relative_error}"
        );
    }
}
