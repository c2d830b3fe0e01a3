//! Reference [`Model`]: a small parametric accuracy model.
//!
//! The trainer writes the fitted parameters as JSON:
//!
//! ```json
//! { "skill": 210.0, "consistency": 0.97, "accuracy_spread": 0.01,
//!   "score_spread": 12.0, "max_elements": 4000 }
//! ```
//!
//! Difficulty is the item's score at perfect accuracy. A player's expected
//! accuracy falls off quadratically as difficulty rises past their skill,
//! and the predicted score is the item's score at that accuracy.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::sync::Arc;

use crate::models::Prediction;
use crate::predict::OptionMask;
use crate::traits::{Item, Model, ModelLoader};

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorModel {
    /// Score of the hardest content the player comfortably handles.
    pub skill: f64,
    /// Expected accuracy on content exactly at `skill`.
    pub consistency: f64,
    #[serde(default)]
    pub accuracy_spread: f64,
    #[serde(default)]
    pub score_spread: f64,
    /// Longest item (in structural elements) seen during training.
    pub max_elements: usize,
}

impl Model for ErrorModel {
    fn predict(&self, item: &dyn Item, options: OptionMask) -> Result<Prediction> {
        let elements = item.structural_element_count();
        if elements > self.max_elements {
            bail!(
                "item {} has {} elements, model was trained on at most {}",
                item.id(),
                elements,
                self.max_elements
            );
        }

        let difficulty = item.performance(options, 1.0);
        let ratio = difficulty / self.skill;
        let accuracy_mean = (1.0 - (1.0 - self.consistency) * ratio * ratio).clamp(0.0, 1.0);

        Ok(Prediction {
            score_mean: item.performance(options, accuracy_mean),
            score_std: self.score_spread * ratio,
            accuracy_mean,
            accuracy_std: self.accuracy_spread * ratio,
        })
    }
}

pub struct ErrorModelLoader;

impl ModelLoader for ErrorModelLoader {
    fn decode(&self, bytes: &[u8]) -> Result<Arc<dyn Model>> {
        let model: ErrorModel = serde_json::from_slice(bytes).context("model is not valid JSON")?;
        if !(model.skill > 0.0) {
            bail!("model skill must be positive, got {}", model.skill);
        }
        if !(0.0..=1.0).contains(&model.consistency) {
            bail!("model consistency must be in [0, 1], got {}", model.consistency);
        }
        Ok(Arc::new(model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fake_item;

    const PARAMS: &str = r#"{"skill": 100.0, "consistency": 0.98, "accuracy_spread": 0.01,
                            "score_spread": 5.0, "max_elements": 50}"#;

    #[test]
    fn decodes_and_predicts() {
        let model = ErrorModelLoader.decode(PARAMS.as_bytes()).unwrap();
        // fake items score 100 * accuracy, i.e. exactly at skill
        let p = model.predict(&fake_item(1), OptionMask::NONE).unwrap();
        assert!((p.accuracy_mean - 0.98).abs() < 1e-9);
        assert!((p.score_mean - 98.0).abs() < 1e-9);
        assert!((p.score_std - 5.0).abs() < 1e-9);
    }

    #[test]
    fn out_of_domain_item_is_an_error() {
        let mut params: serde_json::Value = serde_json::from_str(PARAMS).unwrap();
        params["max_elements"] = 5.into();
        let model = ErrorModelLoader.decode(params.to_string().as_bytes()).unwrap();
        // fake items have 10 elements
        assert!(model.predict(&fake_item(1), OptionMask::NONE).is_err());
    }

    #[test]
    fn rejects_bad_blobs() {
        assert!(ErrorModelLoader.decode(b"not json").is_err());
        assert!(ErrorModelLoader
            .decode(br#"{"skill": 0.0, "consistency": 0.9, "max_elements": 10}"#)
            .is_err());
    }
}
