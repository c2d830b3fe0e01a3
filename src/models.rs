//! Core data types shared by the recommendation path and the collaborators.

use serde::{Deserialize, Serialize};

/// Approval state of a catalog item. Only [`ApprovalState::Ranked`] items
/// are ever recommended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Graveyard,
    WorkInProgress,
    Pending,
    Ranked,
    Approved,
    Qualified,
    Loved,
}

/// A model's prediction for one item under one option mask.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub score_mean: f64,
    pub score_std: f64,
    pub accuracy_mean: f64,
    pub accuracy_std: f64,
}

/// Score range within which a candidate counts as a good recommendation
/// for a user.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptanceWindow {
    pub lower: f64,
    pub upper: f64,
}

impl AcceptanceWindow {
    pub fn contains(&self, score: f64) -> bool {
        self.lower <= score && score <= self.upper
    }
}
