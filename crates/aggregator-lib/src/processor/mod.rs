//! Processor chain
//!
//! Each processor is a transformation `DataBatch -> DataBatch` applied on
//! the tick worker. The chain is ordered and reordering changes
//! semantics: enrichment runs before aggregation so namespace and cluster
//! sets inherit enriched labels, and the rate calculator runs last so
//! derived rates exist on aggregated sets too.

pub mod enrich;
pub mod node_aggregator;
pub mod rate;
pub mod rollup;

pub use enrich::{NamespaceEnricher, PodEnricher};
pub use node_aggregator::NodeContainerAggregator;
pub use rate::RateCalculator;
pub use rollup::{ClusterAggregator, NamespaceAggregator, PodAggregator};

use crate::kubernetes::{NamespaceCache, PodCache};
use crate::model::DataBatch;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

/// One stage of the chain. Implementations may add, remove, or mutate
/// metric sets; apart from the rate calculator's own cache they hold no
/// state across ticks.
pub trait DataProcessor: Send {
    fn name(&self) -> &'static str;
    fn process(&mut self, batch: DataBatch) -> Result<DataBatch>;
}

/// The standard chain, in its fixed order.
pub fn default_processors(
    pod_cache: Arc<PodCache>,
    namespace_cache: Arc<NamespaceCache>,
    resolution: Duration,
) -> Vec<Box<dyn DataProcessor>> {
    vec![
        Box::new(PodEnricher::new(pod_cache)),
        Box::new(NamespaceEnricher::new(namespace_cache)),
        Box::new(NodeContainerAggregator::new()),
        Box::new(PodAggregator::new()),
        Box::new(NamespaceAggregator::new()),
        Box::new(ClusterAggregator::new()),
        Box::new(RateCalculator::new(resolution)),
    ]
}
