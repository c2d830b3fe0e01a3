//! `combine queue submit` and `combine queue list`.
//!
//! `submit` is the queue half of the replay upload flow: the uploader has
//! already stored replays under `<train.replay_dir>/<user>` and hands over
//! the token the user got from `!gen-token`.

use anyhow::{bail, Context, Result};

use crate::config::Config;
use crate::model_cache::check_user_dir_name;
use crate::queue::TrainQueue;
use crate::token::{TokenError, TokenSigner};

/// Verify `token` and enqueue a training job for its user.
pub async fn run_queue_submit(config: &Config, token: &str, age_days: Option<i64>) -> Result<()> {
    let signer = TokenSigner::from_file(
        &config.token.secret_path,
        chrono::Duration::hours(config.token.ttl_hours),
    )?;
    let claims = match signer.verify(token) {
        Ok(claims) => claims,
        Err(TokenError::Expired) => bail!("expired token"),
        Err(e) => bail!("invalid token: {}", e),
    };

    let age_days = match age_days {
        None => None,
        Some(days) if days < 0 => bail!("age must be non-negative, got {}", days),
        Some(days) => Some(u32::try_from(days).context("age is too large")?),
    };

    check_user_dir_name(&claims.user)?;
    let replay_dir = config.train.replay_dir.join(&claims.user);
    std::fs::create_dir_all(&replay_dir)
        .with_context(|| format!("Failed to create replay directory: {}", replay_dir.display()))?;

    let queue = TrainQueue::open(config).await?;
    let id = queue.enqueue(&claims.user, age_days).await?;
    queue.close().await;

    println!("queue submit");
    println!("  job: {}", id);
    println!("  user: {}", claims.user);
    println!("  replays: {}", replay_dir.display());
    Ok(())
}

/// Print the most recent jobs.
pub async fn run_queue_list(config: &Config, limit: i64) -> Result<()> {
    let queue = TrainQueue::open(config).await?;
    let jobs = queue.list(limit).await?;
    queue.close().await;

    if jobs.is_empty() {
        println!("No training jobs.");
        return Ok(());
    }

    println!(
        "{:<6} {:<20} {:<12} {:>5} {:>9}   {}",
        "ID", "USER", "STATUS", "AGE", "REPORTED", "SUBMITTED"
    );
    println!("{}", "-".repeat(76));
    for job in &jobs {
        let age = job
            .age_days
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<6} {:<20} {:<12} {:>5} {:>9}   {}",
            job.id,
            job.user,
            job.status,
            age,
            if job.reported { "yes" } else { "no" },
            format_ts_relative(job.insert_time / 1000)
        );
    }
    Ok(())
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
