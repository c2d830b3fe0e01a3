//! Command registry and dispatcher.
//!
//! Commands are registered once at startup in a [`CommandRegistry`] and
//! looked up by the first whitespace-delimited token of a message. The
//! [`Dispatcher`] applies the configured acceptance policy, runs the
//! command and turns its result into chat replies:
//!
//! | Result | Reply |
//! |--------|-------|
//! | `Ok(lines)` | each line, in order |
//! | `Err(CommandError::Failure(msg))` | exactly one `Error: <msg>` |
//! | `Err(CommandError::Internal(_))` | nothing; logged at error |
//! | unknown command / rejected sender | nothing |
//!
//! Periodic tasks are armed alongside the connection and run with a fixed
//! delay between executions.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::irc::ConnectionError;
use crate::services::Services;
use crate::traits::ItemLibrary;

#[derive(Debug, Error)]
pub enum CommandError {
    /// A user-facing problem; the message is sent back verbatim.
    #[error("{0}")]
    Failure(String),
    /// Anything else. Never shown in chat.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CommandError {
    pub fn failure(message: impl Into<String>) -> Self {
        CommandError::Failure(message.into())
    }
}

/// Where replies go.
#[async_trait]
pub trait Outbox: Send + Sync {
    async fn send(&self, user: &str, text: &str) -> Result<(), ConnectionError>;
}

/// Everything a command invocation may touch.
pub struct CommandContext<'a> {
    pub services: &'a Services,
    /// Nick of the user who sent the message.
    pub sender: &'a str,
    /// Library handle owned by this invocation.
    pub library: &'a dyn ItemLibrary,
}

#[async_trait]
pub trait Command: Send + Sync {
    /// Trigger strings, e.g. `["!r", "!rec"]`.
    fn names(&self) -> &'static [&'static str];

    fn description(&self) -> &str;

    /// Run with the text after the trigger, returning the reply lines.
    async fn run(&self, ctx: &CommandContext<'_>, args: &str) -> Result<Vec<String>, CommandError>;
}

/// A job run on a fixed delay for the lifetime of the connection.
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    async fn run(&self, services: &Services, outbox: &dyn Outbox) -> anyhow::Result<()>;
}

pub struct CommandRegistry {
    commands: Vec<Arc<dyn Command>>,
    by_trigger: HashMap<&'static str, usize>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
            by_trigger: HashMap::new(),
        }
    }

    /// Registry with `!r`, `!gen-token`, `!predict` and `!help`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::commands::RecommendCommand));
        registry.register(Arc::new(crate::commands::GenTokenCommand));
        registry.register(Arc::new(crate::commands::PredictCommand));
        let help = crate::commands::HelpCommand::for_registry(&registry);
        registry.register(Arc::new(help));
        registry
    }

    /// Register `command` under all of its names. A later registration
    /// takes over any trigger it shares with an earlier one.
    pub fn register(&mut self, command: Arc<dyn Command>) {
        let index = self.commands.len();
        for &name in command.names() {
            if self.by_trigger.insert(name, index).is_some() {
                warn!(trigger = name, "command trigger registered twice");
            }
        }
        self.commands.push(command);
    }

    pub fn find(&self, trigger: &str) -> Option<&Arc<dyn Command>> {
        self.by_trigger.get(trigger).map(|&i| &self.commands[i])
    }

    pub fn commands(&self) -> &[Arc<dyn Command>] {
        &self.commands
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Which inbound messages are acted on.
#[derive(Debug, Clone)]
pub enum AcceptPolicy {
    /// The message target must be one of these (the bot's own nick means
    /// private messages).
    Channels(HashSet<String>),
    /// Only messages the bot sent itself.
    SelfOnly(String),
}

impl AcceptPolicy {
    pub fn accepts(&self, sender: &str, target: &str) -> bool {
        match self {
            AcceptPolicy::Channels(targets) => targets.contains(target),
            AcceptPolicy::SelfOnly(bot) => sender == bot,
        }
    }
}

/// Receives a copy of every reply before it is sent.
pub trait EchoSink: Send + Sync {
    fn echo(&self, user: &str, text: &str);
}

/// Writes replies to stdout.
pub struct StdoutEcho;

impl EchoSink for StdoutEcho {
    fn echo(&self, user: &str, text: &str) {
        println!("{} <- {}", user, text);
    }
}

/// Collects echoed replies in memory.
#[derive(Default)]
pub struct BufferEcho {
    lines: Mutex<Vec<(String, String)>>,
}

impl BufferEcho {
    pub fn lines(&self) -> Vec<(String, String)> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl EchoSink for BufferEcho {
    fn echo(&self, user: &str, text: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((user.to_string(), text.to_string()));
    }
}

#[derive(Clone)]
pub enum ReplyMode {
    Direct,
    Echo(Arc<dyn EchoSink>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Not a command, or not from an accepted sender.
    Ignored,
    /// The command ran and its replies were sent.
    Handled,
    /// The command failed; an error reply may have been sent.
    Failed,
}

pub struct Dispatcher {
    registry: CommandRegistry,
    periodic: Vec<Arc<dyn PeriodicTask>>,
    services: Arc<Services>,
    accept: AcceptPolicy,
    reply: ReplyMode,
}

impl Dispatcher {
    pub fn new(
        registry: CommandRegistry,
        services: Arc<Services>,
        accept: AcceptPolicy,
        reply: ReplyMode,
    ) -> Self {
        Self {
            registry,
            periodic: Vec::new(),
            services,
            accept,
            reply,
        }
    }

    /// Dispatcher with the built-in commands and the policy the config
    /// selects for `bot`.
    pub fn from_config(config: &Config, services: Arc<Services>, bot: &str) -> Self {
        let (accept, reply) = if config.is_self_test() {
            (
                AcceptPolicy::SelfOnly(bot.to_string()),
                ReplyMode::Echo(Arc::new(StdoutEcho)),
            )
        } else {
            let mut targets: HashSet<String> = config.dispatch.channels.iter().cloned().collect();
            targets.insert(bot.to_string());
            let reply = if config.dispatch.echo {
                ReplyMode::Echo(Arc::new(StdoutEcho))
            } else {
                ReplyMode::Direct
            };
            (AcceptPolicy::Channels(targets), reply)
        };

        let mut dispatcher = Self::new(CommandRegistry::with_builtins(), services, accept, reply);
        dispatcher.add_periodic(Arc::new(crate::commands::ReportCompletedJobs::new(
            config.train.report_interval(),
        )));
        dispatcher
    }

    pub fn add_periodic(&mut self, task: Arc<dyn PeriodicTask>) {
        self.periodic.push(task);
    }

    /// Handle one inbound message from `sender` addressed to `target`.
    pub async fn dispatch(
        &self,
        outbox: &dyn Outbox,
        sender: &str,
        target: &str,
        text: &str,
    ) -> DispatchOutcome {
        if !self.accept.accepts(sender, target) {
            return DispatchOutcome::Ignored;
        }

        let text = text.trim();
        let (trigger, args) = match text.split_once(char::is_whitespace) {
            Some((trigger, rest)) => (trigger, rest.trim()),
            None => (text, ""),
        };
        let Some(command) = self.registry.find(trigger) else {
            return DispatchOutcome::Ignored;
        };

        debug!(trigger, args, "dispatching command");
        match self.run_command(command.as_ref(), sender, args).await {
            Ok(lines) => {
                for line in lines {
                    self.reply(outbox, sender, &line).await;
                }
                DispatchOutcome::Handled
            }
            Err(CommandError::Failure(message)) => {
                debug!(trigger, %message, "command failed");
                self.reply(outbox, sender, &format!("Error: {}", message)).await;
                DispatchOutcome::Failed
            }
            Err(CommandError::Internal(e)) => {
                error!(trigger, error = %format!("{:#}", e), "command raised an internal error");
                DispatchOutcome::Failed
            }
        }
    }

    async fn run_command(
        &self,
        command: &dyn Command,
        sender: &str,
        args: &str,
    ) -> Result<Vec<String>, CommandError> {
        let library = self.services.libraries.connect()?;
        let ctx = CommandContext {
            services: &self.services,
            sender,
            library: library.as_ref(),
        };
        command.run(&ctx, args).await
    }

    async fn reply(&self, outbox: &dyn Outbox, user: &str, text: &str) {
        if let ReplyMode::Echo(sink) = &self.reply {
            sink.echo(user, text);
        }
        if let Err(e) = outbox.send(user, text).await {
            warn!(%user, error = %e, "failed to send reply");
        }
    }

    /// Start every periodic task. Each runs until `stop` flips to `true`.
    pub fn arm_periodic(
        &self,
        outbox: Arc<dyn Outbox>,
        stop: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        self.periodic
            .iter()
            .map(|task| {
                let task = task.clone();
                let services = self.services.clone();
                let outbox = outbox.clone();
                let mut stop = stop.clone();
                let span = info_span!("periodic", task = task.name());
                tokio::spawn(
                    async move {
                        let interval_ms = task.interval().as_millis() as u64;
                        info!(interval_ms, "periodic task armed");
                        loop {
                            tokio::select! {
                                _ = tokio::time::sleep(task.interval()) => {}
                                _ = stop.changed() => break,
                            }
                            if *stop.borrow() {
                                break;
                            }
                            if let Err(e) = task.run(&services, outbox.as_ref()).await {
                                warn!(error = %format!("{:#}", e), "periodic task failed");
                            }
                        }
                        debug!("periodic task stopped");
                    }
                    .instrument(span),
                )
            })
            .collect()
    }
}
