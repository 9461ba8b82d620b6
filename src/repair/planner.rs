use serde::{Deserialize, Serialize};

use super::FailureType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStrategy {
    SwitchAnchor,
    WaitForElement,
    DismissInterstitial,
    Renavigate,
    WidenScope,
    AdjustExtraction,
    ReflectCompute,
    RollbackToCollect,
}

impl RepairStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            RepairStrategy::SwitchAnchor => "switch anchor",
            RepairStrategy::WaitForElement => "wait for element",
            RepairStrategy::DismissInterstitial => "dismiss interstitial",
            RepairStrategy::Renavigate => "re-navigate",
            RepairStrategy::WidenScope => "widen page scope",
            RepairStrategy::AdjustExtraction => "adjust extraction rule",
            RepairStrategy::ReflectCompute => "reflective re-derivation",
            RepairStrategy::RollbackToCollect => "rollback to collect",
        }
    }
}

impl std::fmt::Display for RepairStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairPlan {
    pub failure: FailureType,
    pub strategy: RepairStrategy,
    pub rollback_depth: u8,
    pub attempt_index: u32,
}

/// Candidate fixes per failure kind, in the order successive attempts try them.
const fn candidates(failure: FailureType) -> &'static [(RepairStrategy, u8)] {
    match failure {
        FailureType::GroundingFail => &[
            (RepairStrategy::SwitchAnchor, 0),
            (RepairStrategy::WaitForElement, 0),
        ],
        FailureType::StateFail => &[
            (RepairStrategy::DismissInterstitial, 0),
            (RepairStrategy::Renavigate, 1),
        ],
        FailureType::ExtractionFail => &[
            (RepairStrategy::WidenScope, 0),
            (RepairStrategy::AdjustExtraction, 0),
        ],
        FailureType::ComputeFail => &[(RepairStrategy::ReflectCompute, 0)],
        FailureType::PlanFail => &[(RepairStrategy::RollbackToCollect, 2)],
    }
}

/// `plan(failure_type, attempt_index) -> (strategy, rollback_depth)`
///
/// Past the end of the candidate list the last candidate repeats.
pub fn plan(failure: FailureType, attempt_index: u32) -> RepairPlan {
    let table = candidates(failure);
    let index = (attempt_index as usize).min(table.len() - 1);
    let (strategy, rollback_depth) = table[index];
    RepairPlan {
        failure,
        strategy,
        rollback_depth,
        attempt_index,
    }
}
