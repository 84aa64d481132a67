use serde::{Deserialize, Serialize};

use crate::edits::{EditRequest, ProviderFailure, ProviderOutcome};

/// Provider cost charged per generated image, in USD.
pub const AI_GENERATION_COST_PER_IMAGE_USD: f64 = 0.50;

/// Metrics the caller attaches to a variation. The engine carries them
/// through untouched and only aggregates them.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VariationMetrics {
    pub cost_saved: f64,
    pub time_saved_hours: f64,
    pub predicted_ctr: f64,
    pub engagement_score: f64,
}

#[derive(Debug, Clone)]
pub struct BatchItem {
    pub variation_id: String,
    pub request: EditRequest,
    pub metrics: VariationMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Succeeded {
        result_url: String,
        refined_prompt: Option<String>,
        seed: Option<i64>,
    },
    Failed {
        error: ProviderFailure,
    },
}

impl ItemOutcome {
    /// Collapses a final provider outcome into the per-item record.
    ///
    /// A `Pending` outcome at this point means nobody drove the job to a
    /// terminal state; it is recorded as a malformed result rather than
    /// dropped.
    pub fn from_final(outcome: ProviderOutcome, request: &EditRequest) -> Self {
        match outcome {
            ProviderOutcome::Immediate(image) => Self::Succeeded {
                result_url: image.result_url,
                refined_prompt: image
                    .refined_prompt
                    .or_else(|| Some(request.prompt().to_string()).filter(|p| !p.is_empty())),
                seed: image.seed.or(request.seed()),
            },
            ProviderOutcome::Pending(job) => Self::Failed {
                error: ProviderFailure::malformed(
                    202,
                    "",
                    format!("job {} was never polled to completion", job.job_id),
                ),
            },
            ProviderOutcome::Failed(error) => Self::Failed { error },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn result_url(&self) -> Option<&str> {
        match self {
            Self::Succeeded { result_url, .. } => Some(result_url.as_str()),
            Self::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ProviderFailure> {
        match self {
            Self::Succeeded { .. } => None,
            Self::Failed { error } => Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub position: usize,
    pub variation_id: String,
    pub outcome: ItemOutcome,
    pub metrics: VariationMetrics,
    pub polls: u32,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interruption {
    Cancelled,
    DeadlineExceeded,
}

impl Interruption {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BatchAggregates {
    pub total_cost_saved: f64,
    pub total_time_saved_hours: f64,
    pub avg_ctr: f64,
    pub avg_engagement: f64,
    pub ai_generation_cost: f64,
    pub roi_percentage: f64,
}

impl BatchAggregates {
    /// Aggregates over the successful subset only. With no successes every
    /// field stays zero.
    pub fn over_successes<'a>(items: impl IntoIterator<Item = &'a BatchItemResult>) -> Self {
        let successes: Vec<&VariationMetrics> = items
            .into_iter()
            .filter(|item| item.outcome.is_success())
            .map(|item| &item.metrics)
            .collect();
        if successes.is_empty() {
            return Self::default();
        }

        let count = successes.len() as f64;
        let total_cost_saved: f64 = successes.iter().map(|m| m.cost_saved).sum();
        let total_time_saved_hours: f64 = successes.iter().map(|m| m.time_saved_hours).sum();
        let avg_ctr = successes.iter().map(|m| m.predicted_ctr).sum::<f64>() / count;
        let avg_engagement = successes.iter().map(|m| m.engagement_score).sum::<f64>() / count;
        let ai_generation_cost = count * AI_GENERATION_COST_PER_IMAGE_USD;
        let roi_percentage = (total_cost_saved - ai_generation_cost) / ai_generation_cost * 100.0;

        Self {
            total_cost_saved,
            total_time_saved_hours,
            avg_ctr: round_to(avg_ctr, 3),
            avg_engagement: round_to(avg_engagement, 1),
            ai_generation_cost,
            roi_percentage: round_to(roi_percentage, 1),
        }
    }
}

/// Result of one batch run. Items appear in request order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub requested: usize,
    pub items: Vec<BatchItemResult>,
    pub succeeded: usize,
    pub failed: usize,
    pub aggregates: BatchAggregates,
    pub interruption: Option<Interruption>,
}

impl BatchSummary {
    pub fn new(requested: usize) -> Self {
        Self {
            requested,
            items: Vec::with_capacity(requested),
            succeeded: 0,
            failed: 0,
            aggregates: BatchAggregates::default(),
            interruption: None,
        }
    }

    pub fn push(&mut self, item: BatchItemResult) {
        if item.outcome.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.items.push(item);
    }

    pub fn finish(mut self, interruption: Option<Interruption>) -> Self {
        self.interruption = interruption;
        self.aggregates = BatchAggregates::over_successes(&self.items);
        self
    }

    /// True when every requested item has a recorded result.
    pub fn is_complete(&self) -> bool {
        self.interruption.is_none() && self.items.len() == self.requested
    }

    pub fn successes(&self) -> impl Iterator<Item = &BatchItemResult> {
        self.items.iter().filter(|item| item.outcome.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &BatchItemResult> {
        self.items.iter().filter(|item| !item.outcome.is_success())
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
