pub mod batch;
pub mod summary;

pub use batch::{
    BatchAggregates, BatchItem, BatchItemResult, BatchSummary, Interruption, ItemOutcome,
    VariationMetrics, AI_GENERATION_COST_PER_IMAGE_USD,
};
pub use summary::write_batch_summary;
