//! `combine token issue` and `combine token verify`.

use anyhow::{bail, Result};
use chrono::DateTime;

use crate::config::Config;
use crate::token::TokenSigner;

fn signer(config: &Config) -> Result<TokenSigner> {
    TokenSigner::from_file(
        &config.token.secret_path,
        chrono::Duration::hours(config.token.ttl_hours),
    )
}

/// Print a fresh token for `user` on stdout.
pub fn run_token_issue(config: &Config, user: &str) -> Result<()> {
    if user.trim().is_empty() {
        bail!("user must not be empty");
    }
    println!("{}", signer(config)?.issue(user));
    Ok(())
}

pub fn run_token_verify(config: &Config, token: &str) -> Result<()> {
    let claims = match signer(config)?.verify(token) {
        Ok(claims) => claims,
        Err(e) => bail!("{}", e),
    };

    let fmt = |ts: i64| {
        DateTime::from_timestamp(ts, 0)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| ts.to_string())
    };
    println!("token valid");
    println!("  user: {}", claims.user);
    println!("  issued: {}", fmt(claims.issued));
    println!("  expires: {}", fmt(claims.expires));
    Ok(())
}
