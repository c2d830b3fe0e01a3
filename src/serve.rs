//! `combine serve`: run the chat service until the connection drops or the
//! process is interrupted.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::config::Config;
use crate::dispatch::{Dispatcher, Outbox};
use crate::irc::{Connection, Credentials};
use crate::services::Services;

pub async fn run_service(config: &Config, self_test: bool) -> Result<()> {
    let mut config = config.clone();
    if self_test {
        config.dispatch.mode = "self-test".to_string();
    }

    let services = Arc::new(Services::from_config(&config).await?);
    let bot = config.irc.username.clone();
    let dispatcher = Arc::new(Dispatcher::from_config(&config, services, &bot));

    let credentials = Credentials {
        username: bot,
        password: config.irc.password.clone(),
    };
    let mut connection = Connection::connect(
        &config.irc.host,
        config.irc.port,
        &credentials,
        &config.irc.channel,
        dispatcher.clone(),
    )
    .await
    .with_context(|| format!("Failed to connect to {}:{}", config.irc.host, config.irc.port))?;

    if config.is_self_test() {
        println!("self-test: press enter to send yourself a recommendation, or type a command");
        let stdin = BufReader::new(tokio::io::stdin());
        let outbox = connection.handle();
        let bot = connection.nick().to_string();
        tokio::spawn(async move { self_test_loop(stdin, dispatcher, &outbox, &bot).await });
    }

    tokio::select! {
        _ = connection.join() => warn!("connection lost"),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            connection.stop();
            connection.join().await;
        }
    }

    connection.close().await?;
    Ok(())
}

/// Dispatch each input line as a message from the bot to itself. An empty
/// line means `!r`. Returns when `input` is exhausted.
pub async fn self_test_loop<R>(
    input: R,
    dispatcher: Arc<Dispatcher>,
    outbox: &dyn Outbox,
    bot: &str,
) where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed to read self-test input");
                break;
            }
        };
        let line = line.trim();
        let command = if line.is_empty() { "!r" } else { line };
        dispatcher.dispatch(outbox, bot, bot, command).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{AcceptPolicy, BufferEcho, CommandRegistry, ReplyMode};
    use crate::testing::{services_with, RecordingOutbox, UPLOAD_URL};

    #[tokio::test]
    async fn self_test_lines_reach_the_bot_and_are_echoed() {
        let echo = Arc::new(BufferEcho::default());
        let dispatcher = Arc::new(Dispatcher::new(
            CommandRegistry::with_builtins(),
            Arc::new(services_with(vec![], None)),
            AcceptPolicy::SelfOnly("combine".to_string()),
            ReplyMode::Echo(echo.clone()),
        ));
        let outbox = RecordingOutbox::default();

        let input: &[u8] = b"\n  !gen-token  \n!unknown\n";
        self_test_loop(input, dispatcher, &outbox, "combine").await;

        let sent = outbox.sent();
        assert_eq!(sent.len(), 3, "{:?}", sent);
        assert!(sent.iter().all(|(user, _)| user == "combine"));
        // the empty line asked for a recommendation; there is no model yet
        assert!(sent[0].1.starts_with("Error: "));
        assert!(sent[0].1.contains(UPLOAD_URL));
        assert!(sent[1].1.starts_with("token: "));
        assert_eq!(echo.lines(), sent);
    }
}
