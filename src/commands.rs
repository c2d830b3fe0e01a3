//! Built-in chat commands and the completion reporter.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use crate::dispatch::{
    Command, CommandContext, CommandError, CommandRegistry, Outbox, PeriodicTask,
};
use crate::predict::parse_modifiers;
use crate::queue::JobStatus;
use crate::recommend::{format_prediction, format_recommendation, recommend, require_model};
use crate::services::Services;

/// `!r`, `!rec`, `!recommend [mods]`
pub struct RecommendCommand;

#[async_trait]
impl Command for RecommendCommand {
    fn names(&self) -> &'static [&'static str] {
        &["!r", "!rec", "!recommend"]
    }

    fn description(&self) -> &str {
        "Recommend a map, optionally pinning options on (+HD) or off (-DT)"
    }

    async fn run(&self, ctx: &CommandContext<'_>, args: &str) -> Result<Vec<String>, CommandError> {
        let rec = recommend(ctx.services, ctx.library, ctx.sender, args).await?;
        Ok(vec![format_recommendation(&rec, &ctx.services.settings.link_base)])
    }
}

/// `!gen-token`
pub struct GenTokenCommand;

#[async_trait]
impl Command for GenTokenCommand {
    fn names(&self) -> &'static [&'static str] {
        &["!gen-token"]
    }

    fn description(&self) -> &str {
        "Issue a token that associates uploaded replays with your account"
    }

    async fn run(&self, ctx: &CommandContext<'_>, args: &str) -> Result<Vec<String>, CommandError> {
        if !args.is_empty() {
            return Err(CommandError::failure(format!(
                "gen-token takes no arguments, got: {:?}",
                args
            )));
        }

        let token = ctx.services.tokens.issue(ctx.sender);
        Ok(vec![
            format!("token: {}", token),
            "To copy the token, type `/savelog` and then navigate to your osu!/Chat \
             directory and open the newest file."
                .to_string(),
        ])
    }
}

/// `!predict <id> [mods]`
///
/// Predicts one item under exactly the requested options; unpinned options
/// are off.
pub struct PredictCommand;

#[async_trait]
impl Command for PredictCommand {
    fn names(&self) -> &'static [&'static str] {
        &["!predict"]
    }

    fn description(&self) -> &str {
        "Predict your result on one map"
    }

    async fn run(&self, ctx: &CommandContext<'_>, args: &str) -> Result<Vec<String>, CommandError> {
        let (id, mods) = match args.split_once(char::is_whitespace) {
            Some((id, mods)) => (id, mods),
            None => (args, ""),
        };
        if id.is_empty() {
            return Err(CommandError::failure("usage: !predict <map id> [mods]"));
        }
        let id: u64 = id
            .parse()
            .map_err(|_| CommandError::failure(format!("not a map id: {:?}", id)))?;

        let model = require_model(ctx.services, ctx.sender).await?;
        let (with, _) = parse_modifiers(mods).map_err(|e| CommandError::failure(e.to_string()))?;

        let item = ctx
            .library
            .lookup(id)
            .await?
            .ok_or_else(|| CommandError::failure(format!("unknown map id: {}", id)))?;

        // options that were not pinned on are off
        let prediction = model
            .predict(item.as_ref(), with)
            .map_err(|e| CommandError::failure(format!("cannot predict map {}: {}", id, e)))?;

        Ok(vec![format_prediction(item.as_ref(), with, &prediction)])
    }
}

/// `!help`: one line per registered command.
pub struct HelpCommand {
    lines: Vec<String>,
}

impl HelpCommand {
    const DESCRIPTION: &'static str = "List the available commands";

    /// Snapshot the commands registered so far; `!help` itself is listed
    /// last.
    pub fn for_registry(registry: &CommandRegistry) -> Self {
        let mut lines: Vec<String> = registry
            .commands()
            .iter()
            .map(|command| format!("{}: {}", command.names().join(", "), command.description()))
            .collect();
        lines.push(format!("!help: {}", Self::DESCRIPTION));
        Self { lines }
    }
}

#[async_trait]
impl Command for HelpCommand {
    fn names(&self) -> &'static [&'static str] {
        &["!help"]
    }

    fn description(&self) -> &str {
        Self::DESCRIPTION
    }

    async fn run(
        &self,
        _ctx: &CommandContext<'_>,
        _args: &str,
    ) -> Result<Vec<String>, CommandError> {
        Ok(self.lines.clone())
    }
}

/// Messages each user whose training job has finished, once.
///
/// A successful retrain also evicts the user's cached model so the next
/// command loads the new one.
pub struct ReportCompletedJobs {
    interval: Duration,
}

impl ReportCompletedJobs {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl PeriodicTask for ReportCompletedJobs {
    fn name(&self) -> &str {
        "report-training"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self, services: &Services, outbox: &dyn Outbox) -> anyhow::Result<()> {
        let Some(queue) = &services.queue else {
            return Ok(());
        };

        for job in queue.poll_completed().await? {
            let message = match job.status {
                JobStatus::Success => {
                    services.models.invalidate(&job.user);
                    "Your model has been trained, try !r to get a recommendation."
                }
                _ => "Training your model failed. Please try uploading your replays again.",
            };
            info!(
                job = job.id,
                user = %job.user,
                status = %job.status,
                "reporting training result"
            );
            if let Err(e) = outbox.send(&job.user, message).await {
                warn!(
                    job = job.id,
                    user = %job.user,
                    error = %e,
                    "failed to report training result"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AcceptanceWindow;
    use crate::predict::{GameOption, OptionMask};
    use crate::testing::{fake_item, services_with, FakeLibrary, RecordingOutbox, TableModel};
    use chrono::Utc;

    async fn run(
        command: &dyn Command,
        services: &Services,
        library: &FakeLibrary,
        args: &str,
    ) -> Result<Vec<String>, CommandError> {
        let ctx = CommandContext {
            services,
            sender: "alice",
            library,
        };
        command.run(&ctx, args).await
    }

    #[tokio::test]
    async fn help_lists_every_builtin() {
        let services = services_with(vec![], None);
        let library = FakeLibrary::new(vec![]);
        let registry = CommandRegistry::with_builtins();

        let help = registry.find("!help").unwrap();
        let lines = run(help.as_ref(), &services, &library, "").await.unwrap();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("!r, !rec, !recommend: "));
        assert!(lines[1].starts_with("!gen-token: "));
        assert!(lines[2].starts_with("!predict: "));
        assert_eq!(lines[3], "!help: List the available commands");
    }

    #[tokio::test]
    async fn gen_token_issues_verifiable_token() {
        let services = services_with(vec![], None);
        let library = FakeLibrary::new(vec![]);

        let lines = run(&GenTokenCommand, &services, &library, "").await.unwrap();
        assert_eq!(lines.len(), 2);
        let token = lines[0].strip_prefix("token: ").unwrap();
        assert_eq!(services.tokens.verify(token).unwrap().user, "alice");
    }

    #[tokio::test]
    async fn gen_token_rejects_arguments() {
        let services = services_with(vec![], None);
        let library = FakeLibrary::new(vec![]);

        let err = run(&GenTokenCommand, &services, &library, "please").await.unwrap_err();
        assert!(matches!(err, CommandError::Failure(ref m) if m.contains("please")));
    }

    #[tokio::test]
    async fn recommend_command_formats_reply() {
        let model =
            TableModel::default().with(5, OptionMask::of(&[GameOption::HardRock]), 200.0, 0.99);
        let services = services_with(vec![fake_item(5)], Some(model));
        services.stats.set(
            "alice".to_string(),
            AcceptanceWindow {
                lower: 100.0,
                upper: 250.0,
            },
            Utc::now() + chrono::Duration::hours(1),
        );
        let library = FakeLibrary::new(vec![]);

        let lines = run(&RecommendCommand, &services, &library, "+HR").await.unwrap();
        assert_eq!(
            lines,
            vec!["[https://osu.ppy.sh/b/5 item 5] with HR predicted: 99.00% | 200.00pp".to_string()]
        );
    }

    #[tokio::test]
    async fn predict_uses_exactly_the_requested_options() {
        let model = TableModel::default()
            .with(9, OptionMask::of(&[GameOption::Hidden]), 150.0, 0.98)
            .with(9, OptionMask::of(&[GameOption::Hidden, GameOption::HardRock]), 999.0, 0.5);
        let services = services_with(vec![], Some(model));
        let library = FakeLibrary::new(vec![fake_item(9)]);

        let lines = run(&PredictCommand, &services, &library, "9 +HD").await.unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("item 9 HD predicted: 98.00%"), "{}", lines[0]);

        let err = run(&PredictCommand, &services, &library, "10").await.unwrap_err();
        assert!(matches!(err, CommandError::Failure(ref m) if m.contains("unknown map id")));

        let err = run(&PredictCommand, &services, &library, "abc").await.unwrap_err();
        assert!(matches!(err, CommandError::Failure(_)));
    }

    #[tokio::test]
    async fn report_without_queue_is_a_no_op() {
        let services = services_with(vec![], None);
        let outbox = RecordingOutbox::default();
        ReportCompletedJobs::new(Duration::from_secs(1))
            .run(&services, &outbox)
            .await
            .unwrap();
        assert!(outbox.sent().is_empty());
    }

    #[tokio::test]
    async fn report_messages_each_finished_job_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::Config::minimal();
        config.db.path = dir.path().join("queue.sqlite");
        let queue = crate::queue::TrainQueue::open(&config).await.unwrap();

        let ok = queue.enqueue("alice", None).await.unwrap();
        let bad = queue.enqueue("bob", None).await.unwrap();
        queue.dequeue().await.unwrap();
        queue.dequeue().await.unwrap();
        queue.update_status(ok, JobStatus::Success).await.unwrap();
        queue.update_status(bad, JobStatus::Failed).await.unwrap();

        let services = services_with(vec![], Some(TableModel::default())).with_queue(queue);
        services.models.get("alice").await.unwrap();
        assert!(services.models.contains("alice"));

        let outbox = RecordingOutbox::default();
        let task = ReportCompletedJobs::new(Duration::from_secs(1));
        task.run(&services, &outbox).await.unwrap();
        task.run(&services, &outbox).await.unwrap();

        let sent = outbox.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "alice");
        assert!(sent[0].1.contains("trained"));
        assert_eq!(sent[1].0, "bob");
        assert!(sent[1].1.contains("failed"));
        assert!(!services.models.contains("alice"));
    }
}
