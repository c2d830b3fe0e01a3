//! # Combine
//!
//! A chat-driven map recommendation service with a durable background
//! training queue.
//!
//! Users message the bot over IRC. The bot answers with a map drawn from a
//! continuously refilled candidate pool, filtered through a model trained
//! on that user's replays. Training runs out of process: uploads enqueue a
//! job, a separate worker runs the trainer, and the chat service reports
//! completion back to the user.
//!
//! ## Architecture
//!
//! ```text
//!  IRC ──▶ ┌────────────┐ task/msg ┌────────────┐   ┌───────────────┐
//!          │ Connection │─────────▶│ Dispatcher │──▶│   Commands    │
//!  IRC ◀── └────────────┘◀─────────└─────┬──────┘   │ !r  !predict  │
//!               ▲          replies       │          └──────┬────────┘
//!               │                 periodic report          │
//!               │                        ▼                 ▼
//!               │               ┌────────────────┐  ┌─────────────────────┐
//!               └───────────────│  train_queue   │  │ Supply · Model LRU  │
//!                               │    (SQLite)    │  │ Stats · Predictions │
//!                               └───────┬────────┘  └─────────────────────┘
//!                                       ▼
//!                               combine worker ──▶ trainer subprocess
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! combine init                          # database + token secret
//! combine worker &                      # training worker
//! combine serve                         # chat service
//! combine queue submit --token <token>  # after replays are uploaded
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`irc`] | Chat connection, receive loop |
//! | [`dispatch`] | Command registry, dispatcher, periodic tasks |
//! | [`commands`] | `!r`, `!gen-token`, `!predict`, completion reports |
//! | [`supply`] | Shared candidate pool |
//! | [`predict`] | Option masks and per-item prediction |
//! | [`recommend`] | Candidate filtering against the user's window |
//! | [`cache`] | Expiring key/value cache |
//! | [`model_cache`] | LRU cache of per-user models |
//! | [`queue`] | Durable training queue |
//! | [`worker`] | Training worker loop |
//! | [`token`] | Upload tokens |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error_model;
pub mod irc;
pub mod logging;
pub mod migrate;
pub mod model_cache;
pub mod models;
pub mod predict;
pub mod queue;
pub mod queue_cmd;
pub mod recommend;
pub mod serve;
pub mod services;
pub mod supply;
pub mod token;
pub mod token_cmd;
pub mod traits;
pub mod user_stats;
pub mod worker;

#[cfg(test)]
mod testing;
