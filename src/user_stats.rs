//! Acceptance windows derived from a user's recent scores.

use crate::models::AcceptanceWindow;

/// Weight ratio between consecutive scores, most recent first.
pub const DECAY: f64 = 0.95;

/// Build the window from scores ordered most recent first.
///
/// - lower: decay-weighted mean minus one standard deviation
/// - upper: best score plus half a standard deviation
///
/// The upper bound is deliberately loose since models under-predict on
/// hard content they have not seen. Only the first `limit` scores are used.
/// Returns `None` when there is no history to work from.
pub fn acceptance_window(scores: &[f64], limit: usize) -> Option<AcceptanceWindow> {
    let scores = &scores[..scores.len().min(limit)];
    if scores.is_empty() {
        return None;
    }

    let mut weight = 1.0;
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for score in scores {
        weighted_sum += weight * score;
        weight_total += weight;
        weight *= DECAY;
    }
    let weighted_mean = weighted_sum / weight_total;

    let n = scores.len() as f64;
    let mean = scores.iter().sum::<f64>() / n;
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();

    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    Some(AcceptanceWindow {
        lower: weighted_mean - std,
        upper: max + std / 2.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn empty_history_has_no_window() {
        assert!(acceptance_window(&[], 100).is_none());
    }

    #[test]
    fn constant_history_collapses_to_a_point() {
        let window = acceptance_window(&[200.0; 10], 100).unwrap();
        assert!(close(window.lower, 200.0));
        assert!(close(window.upper, 200.0));
    }

    #[test]
    fn recent_scores_weigh_more() {
        // [300, 100]: weights 1 and 0.95, population std = 100
        let window = acceptance_window(&[300.0, 100.0], 100).unwrap();
        let weighted = (300.0 + 0.95 * 100.0) / 1.95;
        assert!(close(window.lower, weighted - 100.0));
        assert!(close(window.upper, 300.0 + 50.0));

        let reversed = acceptance_window(&[100.0, 300.0], 100).unwrap();
        assert!(reversed.lower < window.lower);
    }

    #[test]
    fn history_beyond_limit_is_ignored() {
        let mut scores = vec![150.0; 3];
        scores.push(10_000.0);
        let window = acceptance_window(&scores, 3).unwrap();
        assert!(close(window.upper, 150.0));
    }
}
