//! Source manager
//!
//! Fans one tick's scrape out to every source in parallel, bounded by a
//! semaphore, with a single wall-clock deadline measured from tick start.
//! Slow or failing sources lose their contribution for the tick; the
//! merged batch is always produced.

use super::{MetricsSource, MetricsSourceProvider};
use crate::model::DataBatch;
use crate::observability::PipelineMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tracing::warn;

/// Wall-clock budget for all scrapes of one tick.
pub const DEFAULT_METRICS_SCRAPE_TIMEOUT: Duration = Duration::from_secs(20);

/// Concurrent scrape cap; excess scrapes queue against the same deadline.
pub const DEFAULT_MAX_PARALLELISM: usize = 3;

pub struct SourceManager {
    provider: Arc<dyn MetricsSourceProvider>,
    scrape_timeout: Duration,
    semaphore: Arc<Semaphore>,
    metrics: PipelineMetrics,
}

impl SourceManager {
    pub fn new(
        provider: Arc<dyn MetricsSourceProvider>,
        scrape_timeout: Duration,
        max_parallelism: usize,
    ) -> Self {
        Self {
            provider,
            scrape_timeout,
            semaphore: Arc::new(Semaphore::new(max_parallelism)),
            metrics: PipelineMetrics::new(),
        }
    }
}

#[async_trait]
impl MetricsSource for SourceManager {
    fn name(&self) -> String {
        "source_manager".to_string()
    }

    async fn scrape_metrics(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> DataBatch {
        let sources = self.provider.sources();
        self.metrics.set_sources_scraped(sources.len() as i64);

        let deadline = Instant::now() + self.scrape_timeout;
        let mut scrapes: FuturesUnordered<_> = sources
            .into_iter()
            .map(|source| {
                let semaphore = self.semaphore.clone();
                let metrics = self.metrics.clone();
                async move {
                    let name = source.name();
                    let _permit = match timeout_at(deadline, semaphore.acquire_owned()).await {
                        Ok(Ok(permit)) => permit,
                        Ok(Err(_)) => return None,
                        Err(_) => {
                            metrics.inc_scrape_timeouts();
                            warn!(source = %name, "Scrape still queued at deadline; dropping");
                            return None;
                        }
                    };
                    match timeout_at(deadline, source.scrape_metrics(start, end)).await {
                        Ok(batch) => Some((name, batch)),
                        Err(_) => {
                            metrics.inc_scrape_timeouts();
                            warn!(source = %name, "Scrape exceeded deadline; dropping contribution");
                            None
                        }
                    }
                }
            })
            .collect();

        // Merge in arrival order; the key spaces of per-node sources are
        // disjoint by construction, so a duplicate is an anomaly and the
        // first-arrived entry wins.
        let mut batch = DataBatch::new(end);
        while let Some(result) = scrapes.next().await {
            let Some((name, partial)) = result else {
                continue;
            };
            for (key, set) in partial.metric_sets {
                match batch.metric_sets.entry(key) {
                    Entry::Occupied(entry) => {
                        self.metrics.inc_duplicate_keys();
                        warn!(
                            source = %name,
                            key = %entry.key(),
                            "Duplicate metric set key across sources; keeping first"
                        );
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(set);
                    }
                }
            }
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{node_key, MetricSet, MetricSetType, MetricValue, METRIC_MEMORY_USAGE};
    use chrono::TimeZone;

    struct FakeSource {
        name: String,
        delay: Duration,
        sets: Vec<(String, MetricSet)>,
    }

    #[async_trait]
    impl MetricsSource for FakeSource {
        fn name(&self) -> String {
            self.name.clone()
        }

        async fn scrape_metrics(&self, _start: DateTime<Utc>, end: DateTime<Utc>) -> DataBatch {
            tokio::time::sleep(self.delay).await;
            let mut batch = DataBatch::new(end);
            for (key, set) in &self.sets {
                batch.metric_sets.insert(key.clone(), set.clone());
            }
            batch
        }
    }

    struct StaticProvider {
        sources: Vec<Arc<dyn MetricsSource>>,
    }

    impl MetricsSourceProvider for StaticProvider {
        fn sources(&self) -> Vec<Arc<dyn MetricsSource>> {
            self.sources.clone()
        }
    }

    fn node_set(value: i64) -> MetricSet {
        let mut set = MetricSet::new(MetricSetType::Node);
        set.add_value(&METRIC_MEMORY_USAGE, MetricValue::Int(value));
        set
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 0).unwrap();
        (end - chrono::Duration::seconds(60), end)
    }

    fn manager_for(sources: Vec<Arc<dyn MetricsSource>>, parallelism: usize) -> SourceManager {
        SourceManager::new(
            Arc::new(StaticProvider { sources }),
            DEFAULT_METRICS_SCRAPE_TIMEOUT,
            parallelism,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_merges_disjoint_sources() {
        let sources: Vec<Arc<dyn MetricsSource>> = vec![
            Arc::new(FakeSource {
                name: "a".into(),
                delay: Duration::from_millis(10),
                sets: vec![(node_key("n1"), node_set(1))],
            }),
            Arc::new(FakeSource {
                name: "b".into(),
                delay: Duration::from_millis(10),
                sets: vec![(node_key("n2"), node_set(2))],
            }),
        ];
        let manager = manager_for(sources, DEFAULT_MAX_PARALLELISM);

        let (start, end) = window();
        let batch = manager.scrape_metrics(start, end).await;

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.timestamp, end);
        assert!(batch.metric_sets.contains_key(&node_key("n1")));
        assert!(batch.metric_sets.contains_key(&node_key("n2")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_dropped_at_deadline() {
        let sources: Vec<Arc<dyn MetricsSource>> = vec![
            Arc::new(FakeSource {
                name: "fast".into(),
                delay: Duration::from_secs(1),
                sets: vec![(node_key("n1"), node_set(1))],
            }),
            Arc::new(FakeSource {
                name: "slow".into(),
                delay: DEFAULT_METRICS_SCRAPE_TIMEOUT * 2,
                sets: vec![(node_key("n2"), node_set(2))],
            }),
        ];
        let manager = manager_for(sources, DEFAULT_MAX_PARALLELISM);

        let started = Instant::now();
        let (start, end) = window();
        let batch = manager.scrape_metrics(start, end).await;

        // The tick completes at the deadline, not at the slow source's
        // pace, and contains nothing from the slow source.
        assert_eq!(started.elapsed(), DEFAULT_METRICS_SCRAPE_TIMEOUT);
        assert_eq!(batch.len(), 1);
        assert!(batch.metric_sets.contains_key(&node_key("n1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_key_keeps_first_arrived() {
        let sources: Vec<Arc<dyn MetricsSource>> = vec![
            Arc::new(FakeSource {
                name: "late".into(),
                delay: Duration::from_secs(2),
                sets: vec![(node_key("n1"), node_set(2))],
            }),
            Arc::new(FakeSource {
                name: "early".into(),
                delay: Duration::from_millis(10),
                sets: vec![(node_key("n1"), node_set(1))],
            }),
        ];
        let manager = manager_for(sources, DEFAULT_MAX_PARALLELISM);

        let (start, end) = window();
        let batch = manager.scrape_metrics(start, end).await;

        assert_eq!(batch.len(), 1);
        let set = &batch.metric_sets[&node_key("n1")];
        assert_eq!(
            set.metric_values["memory/usage"],
            MetricValue::Int(1),
            "first-arrived entry must win"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallelism_is_bounded() {
        let sources: Vec<Arc<dyn MetricsSource>> = (0..6)
            .map(|i| {
                Arc::new(FakeSource {
                    name: format!("s{i}"),
                    delay: Duration::from_secs(1),
                    sets: vec![(node_key(&format!("n{i}")), node_set(i))],
                }) as Arc<dyn MetricsSource>
            })
            .collect();
        let manager = manager_for(sources, 3);

        let started = Instant::now();
        let (start, end) = window();
        let batch = manager.scrape_metrics(start, end).await;

        // Six one-second scrapes through three permits take two rounds.
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(batch.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_scrapes_share_the_deadline() {
        // Three sources hold all permits past the deadline; the fourth
        // never runs and is dropped while queued.
        let mut sources: Vec<Arc<dyn MetricsSource>> = (0..3)
            .map(|i| {
                Arc::new(FakeSource {
                    name: format!("hog{i}"),
                    delay: DEFAULT_METRICS_SCRAPE_TIMEOUT * 2,
                    sets: vec![(node_key(&format!("hog{i}")), node_set(i))],
                }) as Arc<dyn MetricsSource>
            })
            .collect();
        sources.push(Arc::new(FakeSource {
            name: "queued".into(),
            delay: Duration::from_millis(1),
            sets: vec![(node_key("queued"), node_set(9))],
        }));
        let manager = manager_for(sources, 3);

        let started = Instant::now();
        let (start, end) = window();
        let batch = manager.scrape_metrics(start, end).await;

        assert_eq!(started.elapsed(), DEFAULT_METRICS_SCRAPE_TIMEOUT);
        assert!(batch.is_empty());
    }
}
