//! Failure-driven local correction.
//!
//! A failed verification is classified into one of five [`FailureType`]s,
//! the planner looks up the strategy for that kind and attempt index, and the
//! rollback manager computes which nodes to reset before the retry.

mod classifier;
mod planner;
mod rollback;

pub use classifier::classify;
pub use planner::{plan, RepairPlan, RepairStrategy};
pub use rollback::{
    Checkpoint, RollbackError, RollbackManager, RollbackPlan, RollbackRecord, MAX_CHECKPOINTS,
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    GroundingFail,
    StateFail,
    ExtractionFail,
    ComputeFail,
    PlanFail,
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FailureType::GroundingFail => "GROUNDING_FAIL",
            FailureType::StateFail => "STATE_FAIL",
            FailureType::ExtractionFail => "EXTRACTION_FAIL",
            FailureType::ComputeFail => "COMPUTE_FAIL",
            FailureType::PlanFail => "PLAN_FAIL",
        })
    }
}
