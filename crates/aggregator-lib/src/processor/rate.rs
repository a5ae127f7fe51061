//! Rate derivation
//!
//! Computes gauge rates from cumulative counters using the previous
//! tick's value for the same `(set key, metric)`. A rate is suppressed on
//! first observation, when the entity was recreated (`create_time`
//! advanced), or when no time has passed. A counter that goes backwards
//! without a recreate breaks the cumulative invariant: the whole set is
//! dropped from the batch and the baseline restarts.

use super::DataProcessor;
use crate::model::{DataBatch, MetricValue, RATE_DERIVATIONS};
use crate::observability::PipelineMetrics;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::error;

struct RateState {
    value: i64,
    create_time: DateTime<Utc>,
    time: DateTime<Utc>,
}

pub struct RateCalculator {
    resolution: ChronoDuration,
    state: HashMap<(String, String), RateState>,
    metrics: PipelineMetrics,
}

impl RateCalculator {
    pub fn new(resolution: Duration) -> Self {
        Self {
            resolution: ChronoDuration::from_std(resolution)
                .unwrap_or_else(|_| ChronoDuration::seconds(60)),
            state: HashMap::new(),
            metrics: PipelineMetrics::new(),
        }
    }
}

impl DataProcessor for RateCalculator {
    fn name(&self) -> &'static str {
        "rate_calculator"
    }

    fn process(&mut self, mut batch: DataBatch) -> Result<DataBatch> {
        let mut drops = Vec::new();

        for (key, set) in batch.metric_sets.iter_mut() {
            for (source_name, rate_metric) in RATE_DERIVATIONS {
                let Some(MetricValue::Int(value)) =
                    set.metric_values.get(*source_name).copied()
                else {
                    continue;
                };

                let state_key = (key.clone(), source_name.to_string());
                if let Some(prev) = self.state.get(&state_key) {
                    if prev.create_time == set.create_time && set.scrape_time > prev.time {
                        let delta_v = value - prev.value;
                        if delta_v < 0 {
                            error!(
                                key = %key,
                                metric = %source_name,
                                previous = prev.value,
                                current = value,
                                "Cumulative counter went backwards without a recreate; dropping set"
                            );
                            drops.push(key.clone());
                        } else {
                            let delta_t =
                                (set.scrape_time - prev.time).num_milliseconds() as f64 / 1000.0;
                            set.metric_values.insert(
                                rate_metric.name.to_string(),
                                MetricValue::Float(delta_v as f64 / delta_t),
                            );
                        }
                    }
                    // create_time advanced or no time passed: suppress the
                    // rate for this tick and rebase below.
                }

                self.state.insert(
                    state_key,
                    RateState {
                        value,
                        create_time: set.create_time,
                        time: set.scrape_time,
                    },
                );
            }
        }

        for key in drops {
            self.metrics.inc_invariant_breaches();
            batch.metric_sets.remove(&key);
        }

        // Entities gone for more than two resolutions start over.
        let cutoff = batch.timestamp - self.resolution * 2;
        self.state.retain(|_, s| s.time >= cutoff);

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        pod_container_key, MetricSet, MetricSetType, METRIC_CPU_USAGE,
    };
    use chrono::TimeZone;

    const RESOLUTION: Duration = Duration::from_secs(60);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn batch_with_cpu(
        at: DateTime<Utc>,
        create_time: DateTime<Utc>,
        cpu: i64,
    ) -> DataBatch {
        let mut batch = DataBatch::new(at);
        let mut set = MetricSet::new(MetricSetType::PodContainer);
        set.create_time = create_time;
        set.scrape_time = at;
        set.add_value(&METRIC_CPU_USAGE, MetricValue::Int(cpu));
        batch
            .metric_sets
            .insert(pod_container_key("ns1", "p1", "c1"), set);
        batch
    }

    fn cpu_rate(batch: &DataBatch) -> Option<MetricValue> {
        batch
            .metric_sets
            .get(&pod_container_key("ns1", "p1", "c1"))
            .and_then(|set| set.metric_values.get("cpu/usage_rate"))
            .copied()
    }

    #[test]
    fn test_first_observation_has_no_rate() {
        let mut calc = RateCalculator::new(RESOLUTION);
        let batch = calc.process(batch_with_cpu(t0(), t0(), 0)).unwrap();
        assert_eq!(cpu_rate(&batch), None);
    }

    #[test]
    fn test_rate_from_consecutive_batches() {
        let mut calc = RateCalculator::new(RESOLUTION);
        calc.process(batch_with_cpu(t0(), t0(), 0)).unwrap();

        let later = t0() + ChronoDuration::seconds(60);
        let batch = calc
            .process(batch_with_cpu(later, t0(), 60_000_000_000))
            .unwrap();

        // 60e9 ns over 60 s is 1e9 ns/s, i.e. one full core.
        assert_eq!(cpu_rate(&batch), Some(MetricValue::Float(1e9)));
    }

    #[test]
    fn test_restart_suppresses_rate_once() {
        let mut calc = RateCalculator::new(RESOLUTION);
        calc.process(batch_with_cpu(t0(), t0(), 50_000_000_000)).unwrap();

        // The container restarted: create_time advanced and the counter
        // reset. No rate this tick.
        let restart = t0() + ChronoDuration::seconds(60);
        let batch = calc
            .process(batch_with_cpu(restart, restart, 1_000_000_000))
            .unwrap();
        assert_eq!(cpu_rate(&batch), None);

        // The tick after the restart derives from the fresh baseline.
        let later = restart + ChronoDuration::seconds(60);
        let batch = calc
            .process(batch_with_cpu(later, restart, 31_000_000_000))
            .unwrap();
        assert_eq!(cpu_rate(&batch), Some(MetricValue::Float(0.5e9)));
    }

    #[test]
    fn test_no_elapsed_time_suppresses_rate() {
        let mut calc = RateCalculator::new(RESOLUTION);
        calc.process(batch_with_cpu(t0(), t0(), 100)).unwrap();
        let batch = calc.process(batch_with_cpu(t0(), t0(), 200)).unwrap();
        assert_eq!(cpu_rate(&batch), None);
    }

    #[test]
    fn test_backwards_counter_drops_set() {
        let mut calc = RateCalculator::new(RESOLUTION);
        calc.process(batch_with_cpu(t0(), t0(), 1000)).unwrap();

        let later = t0() + ChronoDuration::seconds(60);
        let batch = calc.process(batch_with_cpu(later, t0(), 500)).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_stale_state_evicted_after_gap() {
        let mut calc = RateCalculator::new(RESOLUTION);
        calc.process(batch_with_cpu(t0(), t0(), 1000)).unwrap();

        // A batch without the entity, three resolutions later, evicts the
        // stale entry.
        let gap = t0() + ChronoDuration::seconds(180);
        calc.process(DataBatch::new(gap)).unwrap();

        // The entity coming back is a first observation again.
        let back = gap + ChronoDuration::seconds(60);
        let batch = calc
            .process(batch_with_cpu(back, t0(), 100_000))
            .unwrap();
        assert_eq!(cpu_rate(&batch), None);
    }
}
