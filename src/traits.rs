//! Collaborator interfaces.
//!
//! The recommendation engine never parses catalog files or runs model
//! inference itself. It talks to two collaborators through the traits in
//! this module:
//!
//! ```text
//! ┌──────────────────┐  connect()  ┌──────────────┐  list()/lookup()  ┌────────┐
//! │ LibraryConnector │────────────▶│ ItemLibrary  │──────────────────▶│  Item  │
//! └──────────────────┘  per task   └──────────────┘                   └───┬────┘
//!                                                                         │
//! ┌──────────────────┐  decode()   ┌──────────────┐  predict(item, mask)  │
//! │   ModelLoader    │────────────▶│    Model     │◀──────────────────────┘
//! └──────────────────┘             └──────────────┘
//! ```
//!
//! Reference implementations live in [`crate::catalog`] and
//! [`crate::error_model`]; tests substitute in-memory fakes.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

use crate::models::{ApprovalState, Prediction};
use crate::predict::OptionMask;

// ═══════════════════════════════════════════════════════════════════════
// Item Library
// ═══════════════════════════════════════════════════════════════════════

/// A catalog item that can be recommended.
pub trait Item: Send + Sync + fmt::Debug {
    /// Stable identifier, also used to build the link sent to users.
    fn id(&self) -> u64;

    /// Human-readable name (e.g. `"Artist - Title [Version]"`).
    fn display_name(&self) -> String;

    fn approval_state(&self) -> ApprovalState;

    /// Number of structural sub-elements (hit objects). Items with fewer
    /// than two are never candidates.
    fn structural_element_count(&self) -> usize;

    /// Score awarded for playing this item with `options` at `accuracy`
    /// (in `[0, 1]`).
    fn performance(&self, options: OptionMask, accuracy: f64) -> f64;
}

/// A handle onto the item catalog and players' score history.
///
/// Handles are not shared between concurrently running commands; each task
/// obtains its own from a [`LibraryConnector`].
#[async_trait]
pub trait ItemLibrary: Send + Sync {
    /// Look up a single item. `Ok(None)` means the id is unknown.
    async fn lookup(&self, id: u64) -> Result<Option<Arc<dyn Item>>>;

    /// List up to `limit` items published or ranked at or after `since`.
    ///
    /// Entries that fail to decode are returned as `Err` individually so the
    /// caller can skip them without losing the rest of the batch.
    async fn list(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Result<Arc<dyn Item>>>>;

    /// A user's most recent scores, most recent first.
    async fn recent_scores(&self, user: &str, limit: usize) -> Result<Vec<f64>>;
}

/// Builds independent [`ItemLibrary`] handles from immutable configuration.
pub trait LibraryConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn ItemLibrary>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Model
// ═══════════════════════════════════════════════════════════════════════

/// A trained per-user model.
pub trait Model: Send + Sync {
    /// Predict the user's result on `item` played with `options`.
    ///
    /// Returns an error when the item lies outside what the model can
    /// reason about; callers treat that as "no prediction for this item".
    fn predict(&self, item: &dyn Item, options: OptionMask) -> Result<Prediction>;
}

/// Decodes the opaque blob the trainer persisted for a user.
pub trait ModelLoader: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Arc<dyn Model>>;
}
