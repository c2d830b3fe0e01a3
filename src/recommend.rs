//! The recommendation algorithm.
//!
//! For a user with a trained model:
//!
//! 1. Resolve the user's [`AcceptanceWindow`] (cached for a few hours).
//! 2. Parse the requested option pins.
//! 3. Pull candidates from the shared supply, predicting every consistent
//!    option mask, and return the first prediction that lands inside the
//!    window with high enough accuracy.
//!
//! At most `max_candidates` candidates are inspected per request.

use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use crate::dispatch::CommandError;
use crate::models::{AcceptanceWindow, Prediction};
use crate::predict::{parse_modifiers, predict_item, OptionMask};
use crate::services::Services;
use crate::traits::{Item, ItemLibrary, Model};
use crate::user_stats::acceptance_window;

/// A chosen candidate and the options it should be played with.
#[derive(Debug, Clone)]
pub struct Recommendation {
    pub item: Arc<dyn Item>,
    pub options: OptionMask,
    pub prediction: Prediction,
}

pub fn no_model_message(upload_url: &str) -> String {
    format!(
        "I haven't trained a model for you yet. Please go to {} and upload your replays. \
         To associate the replays with your account, send me the command `!gen-token` \
         and enter that along with your replays.",
        upload_url
    )
}

/// The user's model, or the "go upload replays" failure.
pub async fn require_model(
    services: &Services,
    user: &str,
) -> Result<Arc<dyn Model>, CommandError> {
    match services.models.get(user).await? {
        Some(model) => Ok(model),
        None => Err(CommandError::Failure(no_model_message(&services.upload_url))),
    }
}

/// Cached acceptance window for `user`, recomputed from the library on a
/// miss or after expiry.
pub async fn user_window(
    services: &Services,
    library: &dyn ItemLibrary,
    user: &str,
) -> Result<AcceptanceWindow, CommandError> {
    let key = user.to_string();
    if let Some(window) = services.stats.get(&key) {
        return Ok(window);
    }

    let scores = library
        .recent_scores(user, services.settings.history_limit)
        .await?;
    let window = acceptance_window(&scores, services.settings.history_limit).ok_or_else(|| {
        CommandError::failure("no recent scores found for you, play some ranked maps first")
    })?;

    debug!(%user, lower = window.lower, upper = window.upper, "computed acceptance window");
    services
        .stats
        .set(key, window, Utc::now() + services.settings.stats_ttl);
    Ok(window)
}

pub async fn recommend(
    services: &Services,
    library: &dyn ItemLibrary,
    user: &str,
    args: &str,
) -> Result<Recommendation, CommandError> {
    let model = require_model(services, user).await?;
    let window = user_window(services, library, user).await?;
    let (with, without) = parse_modifiers(args).map_err(|e| CommandError::failure(e.to_string()))?;

    let min_accuracy = services.settings.min_accuracy;
    for inspected in 1..=services.settings.max_candidates {
        let item = services.supply.next().await;
        let predictions = predict_item(model.as_ref(), item.as_ref(), with, without);

        let hit = predictions.into_iter().find(|(_, p)| {
            window.contains(p.score_mean) && p.accuracy_mean >= min_accuracy
        });
        if let Some((options, prediction)) = hit {
            debug!(%user, item = item.id(), %options, inspected, "found recommendation");
            return Ok(Recommendation {
                item,
                options,
                prediction,
            });
        }
    }

    Err(CommandError::failure("not enough candidates, try again later"))
}

/// `[<link> <name>] [with MODS ]predicted: 97.00% | 180.00pp`
pub fn format_recommendation(rec: &Recommendation, link_base: &str) -> String {
    let mods = if rec.options.is_empty() {
        String::new()
    } else {
        format!("with {} ", rec.options)
    };
    format!(
        "[{}{} {}] {}predicted: {:.2}% | {:.2}pp",
        link_base,
        rec.item.id(),
        rec.item.display_name(),
        mods,
        rec.prediction.accuracy_mean * 100.0,
        rec.prediction.score_mean,
    )
}

/// Single-item prediction with spreads, as returned by `!predict`.
pub fn format_prediction(item: &dyn Item, options: OptionMask, prediction: &Prediction) -> String {
    let mods = if options.is_empty() {
        String::new()
    } else {
        format!("{} ", options)
    };
    format!(
        "{} {}predicted: {:.2}% +- {:.2}% | {:.2}pp +- {:.2}pp",
        item.display_name(),
        mods,
        prediction.accuracy_mean * 100.0,
        prediction.accuracy_std * 100.0,
        prediction.score_mean,
        prediction.score_std,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predict::GameOption;
    use crate::testing::{fake_item, services_with, FakeLibrary, TableModel};

    fn window(lower: f64, upper: f64) -> AcceptanceWindow {
        AcceptanceWindow { lower, upper }
    }

    #[tokio::test]
    async fn without_model_fails_with_upload_hint() {
        let services = services_with(vec![fake_item(1)], None);
        let library = FakeLibrary::new(vec![]);

        let err = recommend(&services, &library, "alice", "").await.unwrap_err();
        match err {
            CommandError::Failure(msg) => {
                assert!(msg.contains(&services.upload_url));
                assert!(msg.contains("!gen-token"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn picks_first_candidate_in_window() {
        let model = TableModel::default()
            .with(1, OptionMask::NONE, 400.0, 0.99)
            .with(2, OptionMask::NONE, 180.0, 0.90)
            .with(3, OptionMask::NONE, 180.0, 0.97);
        let services = services_with(vec![fake_item(1), fake_item(2), fake_item(3)], Some(model));
        services.stats.set(
            "alice".to_string(),
            window(100.0, 250.0),
            Utc::now() + chrono::Duration::hours(1),
        );
        let library = FakeLibrary::new(vec![]);

        let rec = recommend(&services, &library, "alice", "-DT -HD -HR").await.unwrap();
        assert_eq!(rec.item.id(), 3);
        assert!(rec.options.is_empty());
        assert_eq!(
            format_recommendation(&rec, "https://osu.ppy.sh/b/"),
            "[https://osu.ppy.sh/b/3 item 3] predicted: 97.00% | 180.00pp"
        );
    }

    #[tokio::test]
    async fn exhaustion_is_a_failure() {
        let model = TableModel::default();
        let mut services = services_with(vec![fake_item(1)], Some(model));
        services.settings.max_candidates = 5;
        services.stats.set(
            "alice".to_string(),
            window(100.0, 250.0),
            Utc::now() + chrono::Duration::hours(1),
        );
        let library = FakeLibrary::new(vec![]);

        let err = recommend(&services, &library, "alice", "").await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::Failure(ref m) if m == "not enough candidates, try again later"
        ));
    }

    #[tokio::test]
    async fn bad_modifiers_cite_the_token() {
        let services = services_with(vec![fake_item(1)], Some(TableModel::default()));
        services
            .stats
            .set("alice".to_string(), window(0.0, 1.0), Utc::now() + chrono::Duration::hours(1));
        let library = FakeLibrary::new(vec![]);

        let err = recommend(&services, &library, "alice", "+XX").await.unwrap_err();
        assert!(matches!(err, CommandError::Failure(ref m) if m.contains("+XX")));
    }

    #[tokio::test]
    async fn window_is_computed_once_then_cached() {
        let services = services_with(vec![fake_item(1)], Some(TableModel::default()));
        let library = FakeLibrary::new(vec![]).with_scores("alice", vec![200.0, 150.0]);

        let first = user_window(&services, &library, "alice").await.unwrap();
        assert_eq!(library.score_lookups(), 1);
        let second = user_window(&services, &library, "alice").await.unwrap();
        assert_eq!(library.score_lookups(), 1);
        assert_eq!(first, second);

        let err = user_window(&services, &library, "nobody").await.unwrap_err();
        assert!(matches!(err, CommandError::Failure(_)));
    }

    #[test]
    fn formats_options_when_present() {
        let rec = Recommendation {
            item: Arc::new(fake_item(42)),
            options: OptionMask::of(&[GameOption::Hidden, GameOption::DoubleTime]),
            prediction: Prediction {
                score_mean: 123.456,
                score_std: 1.0,
                accuracy_mean: 0.98765,
                accuracy_std: 0.01,
            },
        };
        assert_eq!(
            format_recommendation(&rec, "https://osu.ppy.sh/b/"),
            "[https://osu.ppy.sh/b/42 item 42] with DTHD predicted: 98.77% | 123.46pp"
        );
        assert_eq!(
            format_prediction(rec.item.as_ref(), rec.options, &rec.prediction),
            "item 42 DTHD predicted: 98.77% +- 1.00% | 123.46pp +- 1.00pp"
        );
    }
}
