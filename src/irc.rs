//! The chat connection.
//!
//! Speaks the small subset of IRC the service needs: the login handshake,
//! joining one channel, answering `PING` and sending/receiving `PRIVMSG`.
//!
//! ```text
//!            connect()                stop() / EOF / read error       close()
//! (socket) ───────────▶ running ─────────────────────────────▶ stopped ───────▶ closed
//!                          │
//!                          └─ receive loop: one task per PRIVMSG
//! ```
//!
//! Every outbound line goes through one write lock so lines from
//! concurrently running commands never interleave mid-line.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::dispatch::{Dispatcher, Outbox};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("message may not contain line breaks")]
    InvalidMessage,
    #[error("connection is closed")]
    ClosedConnection,
    #[error("connection is still running")]
    InvalidState,
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    /// Sent as `PASS` when non-empty.
    pub password: String,
}

/// A line from the server that the service acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Ping(String),
    PrivMsg {
        sender: String,
        target: String,
        text: String,
    },
}

/// Parse one line (without its terminator). Lines the service does not
/// care about yield `None`.
pub fn parse_line(line: &str) -> Option<Inbound> {
    if let Some(token) = line.strip_prefix("PING ") {
        return Some(Inbound::Ping(token.to_string()));
    }

    // :nick!user@host PRIVMSG target :text
    let rest = line.strip_prefix(':')?;
    let (prefix, rest) = rest.split_once(' ')?;
    let rest = rest.strip_prefix("PRIVMSG ")?;
    let (target, text) = rest.split_once(" :")?;
    let sender = prefix.split('!').next()?;
    if sender.is_empty() || target.is_empty() {
        return None;
    }
    Some(Inbound::PrivMsg {
        sender: sender.to_string(),
        target: target.to_string(),
        text: text.to_string(),
    })
}

struct Shared {
    writer: Mutex<Option<OwnedWriteHalf>>,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    exited_rx: watch::Receiver<bool>,
}

impl Shared {
    async fn write_line(&self, line: &str) -> Result<(), ConnectionError> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(ConnectionError::ClosedConnection);
        };
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        Ok(())
    }

    async fn send(&self, user: &str, text: &str) -> Result<(), ConnectionError> {
        if text.contains(['\n', '\r']) {
            return Err(ConnectionError::InvalidMessage);
        }
        if !self.running.load(Ordering::SeqCst) {
            return Err(ConnectionError::ClosedConnection);
        }
        if let Err(e) = self.write_line(&format!("PRIVMSG {} :{}", user, text)).await {
            if matches!(e, ConnectionError::Io(_)) {
                warn!(error = %e, "write failed, stopping connection");
                self.stop();
            }
            return Err(e);
        }
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_tx.send_replace(true);
    }
}

/// Cloneable sending half of a [`Connection`], handed to commands.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

#[async_trait]
impl Outbox for ConnectionHandle {
    async fn send(&self, user: &str, text: &str) -> Result<(), ConnectionError> {
        self.shared.send(user, text).await
    }
}

pub struct Connection {
    shared: Arc<Shared>,
    nick: String,
    periodic: Vec<JoinHandle<()>>,
}

impl Connection {
    /// Connect, log in and join `#channel`, then start receiving.
    ///
    /// Returns only after the handshake has been written; the dispatcher's
    /// periodic tasks are armed before this returns.
    pub async fn connect(
        host: &str,
        port: u16,
        credentials: &Credentials,
        channel: &str,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self, ConnectionError> {
        let stream = TcpStream::connect((host, port)).await?;
        let (reader, mut writer) = stream.into_split();

        let user = &credentials.username;
        let mut handshake = String::new();
        if !credentials.password.is_empty() {
            handshake.push_str(&format!("PASS {}\r\n", credentials.password));
        }
        handshake.push_str(&format!("NICK {}\r\n", user));
        handshake.push_str(&format!("USER {} {} {} :{}\r\n", user, user, user, user));
        handshake.push_str(&format!("JOIN #{}\r\n", channel));
        writer.write_all(handshake.as_bytes()).await?;
        info!(%host, port, nick = %user, %channel, "connected");

        let (stop_tx, stop_rx) = watch::channel(false);
        let (exited_tx, exited_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            writer: Mutex::new(Some(writer)),
            running: AtomicBool::new(true),
            stop_tx,
            exited_rx,
        });

        let span = info_span!("irc", nick = %user);
        let receive = receive_loop(
            shared.clone(),
            reader,
            dispatcher.clone(),
            stop_rx.clone(),
            exited_tx,
        );
        tokio::spawn(receive.instrument(span));

        let outbox: Arc<dyn Outbox> = Arc::new(ConnectionHandle {
            shared: shared.clone(),
        });
        let periodic = dispatcher.arm_periodic(outbox, stop_rx);

        Ok(Self {
            shared,
            nick: user.clone(),
            periodic,
        })
    }

    /// The identity this connection logged in as.
    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: self.shared.clone(),
        }
    }

    /// Send `text` to `user` as a private message.
    pub async fn send(&self, user: &str, text: &str) -> Result<(), ConnectionError> {
        self.shared.send(user, text).await
    }

    /// Mark the connection stopped and wake the receive loop. Does not wait.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Wait until the receive loop has exited.
    pub async fn join(&self) {
        let mut exited = self.shared.exited_rx.clone();
        // the sender only drops after publishing `true`
        let _ = exited.wait_for(|done| *done).await;
    }

    /// Release the socket. Only valid once the connection has stopped.
    pub async fn close(&mut self) -> Result<(), ConnectionError> {
        if self.is_running() {
            return Err(ConnectionError::InvalidState);
        }
        for task in self.periodic.drain(..) {
            task.abort();
        }
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            writer.shutdown().await?;
        }
        debug!("connection closed");
        Ok(())
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    reader: OwnedReadHalf,
    dispatcher: Arc<Dispatcher>,
    mut stop: watch::Receiver<bool>,
    exited: watch::Sender<bool>,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            read = reader.read_until(b'\n', &mut buf) => read,
            _ = stop.changed() => {
                debug!("stop requested");
                break;
            }
        };
        match read {
            Ok(0) => {
                info!("server closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "read failed");
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\r', '\n']);
        match parse_line(line) {
            Some(Inbound::Ping(token)) => {
                trace!(%token, "ping");
                if let Err(e) = shared.write_line(&format!("PONG {}", token)).await {
                    warn!(error = %e, "failed to answer ping");
                    break;
                }
            }
            Some(Inbound::PrivMsg { sender, target, text }) => {
                spawn_message(&shared, &dispatcher, sender, target, text);
            }
            None => trace!(%line, "ignoring line"),
        }
    }

    shared.stop();
    exited.send_replace(true);
}

fn spawn_message(
    shared: &Arc<Shared>,
    dispatcher: &Arc<Dispatcher>,
    sender: String,
    target: String,
    text: String,
) {
    let outbox = ConnectionHandle {
        shared: shared.clone(),
    };
    let dispatcher = dispatcher.clone();
    let span = info_span!("message", %sender, %target);
    tokio::spawn(
        async move {
            let run = dispatcher.dispatch(&outbox, &sender, &target, &text);
            if let Err(panic) = AssertUnwindSafe(run).catch_unwind().await {
                error!(panic = %panic_message(panic.as_ref()), "command task panicked");
            }
        }
        .instrument(span),
    );
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
