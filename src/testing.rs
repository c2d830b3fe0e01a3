//! In-memory collaborators for unit tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::dispatch::Outbox;
use crate::irc::ConnectionError;
use crate::model_cache::{ModelCache, ModelStore};
use crate::models::{ApprovalState, Prediction};
use crate::predict::OptionMask;
use crate::services::{RecommendSettings, Services};
use crate::supply::SupplySettings;
use crate::token::TokenSigner;
use crate::traits::{Item, ItemLibrary, LibraryConnector, Model};

pub const UPLOAD_URL: &str = "http://upload.test/";

#[derive(Debug, Clone)]
pub struct FakeItem {
    pub id: u64,
}

pub fn fake_item(id: u64) -> FakeItem {
    FakeItem { id }
}

impl Item for FakeItem {
    fn id(&self) -> u64 {
        self.id
    }
    fn display_name(&self) -> String {
        format!("item {}", self.id)
    }
    fn approval_state(&self) -> ApprovalState {
        ApprovalState::Ranked
    }
    fn structural_element_count(&self) -> usize {
        10
    }
    fn performance(&self, _options: OptionMask, accuracy: f64) -> f64 {
        100.0 * accuracy
    }
}

/// Library that lists the same items on every call.
#[derive(Clone, Default)]
pub struct FakeLibrary {
    items: Vec<FakeItem>,
    scores: HashMap<String, Vec<f64>>,
    score_lookups: Arc<AtomicUsize>,
}

impl FakeLibrary {
    pub fn new(items: Vec<FakeItem>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    pub fn with_scores(mut self, user: &str, scores: Vec<f64>) -> Self {
        self.scores.insert(user.to_string(), scores);
        self
    }

    pub fn score_lookups(&self) -> usize {
        self.score_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ItemLibrary for FakeLibrary {
    async fn lookup(&self, id: u64) -> Result<Option<Arc<dyn Item>>> {
        Ok(self
            .items
            .iter()
            .find(|item| item.id == id)
            .map(|item| Arc::new(item.clone()) as Arc<dyn Item>))
    }

    async fn list(
        &self,
        _since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Result<Arc<dyn Item>>>> {
        Ok(self
            .items
            .iter()
            .take(limit)
            .map(|item| Ok(Arc::new(item.clone()) as Arc<dyn Item>))
            .collect())
    }

    async fn recent_scores(&self, user: &str, limit: usize) -> Result<Vec<f64>> {
        self.score_lookups.fetch_add(1, Ordering::SeqCst);
        let mut scores = self.scores.get(user).cloned().unwrap_or_default();
        scores.truncate(limit);
        Ok(scores)
    }
}

impl LibraryConnector for FakeLibrary {
    fn connect(&self) -> Result<Box<dyn ItemLibrary>> {
        Ok(Box::new(self.clone()))
    }
}

/// Model answering from a fixed `(item, mask)` table. Anything not in the
/// table predicts a score no window accepts.
#[derive(Default, Clone)]
pub struct TableModel {
    table: HashMap<(u64, OptionMask), Prediction>,
}

impl TableModel {
    pub fn with(mut self, id: u64, options: OptionMask, score: f64, accuracy: f64) -> Self {
        self.table.insert(
            (id, options),
            Prediction {
                score_mean: score,
                score_std: 0.0,
                accuracy_mean: accuracy,
                accuracy_std: 0.0,
            },
        );
        self
    }
}

impl Model for TableModel {
    fn predict(&self, item: &dyn Item, options: OptionMask) -> Result<Prediction> {
        Ok(self
            .table
            .get(&(item.id(), options))
            .copied()
            .unwrap_or(Prediction {
                score_mean: -1.0,
                score_std: 0.0,
                accuracy_mean: 0.0,
                accuracy_std: 0.0,
            }))
    }
}

/// Hands every user the same model, or none.
struct SharedModelStore(Option<Arc<dyn Model>>);

#[async_trait]
impl ModelStore for SharedModelStore {
    async fn load(&self, _user: &str) -> Result<Option<Arc<dyn Model>>> {
        Ok(self.0.clone())
    }
}

/// Services over [`FakeLibrary`] `items` where every user has `model`.
pub fn services_with(items: Vec<FakeItem>, model: Option<TableModel>) -> Services {
    let library = Arc::new(FakeLibrary::new(items));
    let store = SharedModelStore(model.map(|m| Arc::new(m) as Arc<dyn Model>));
    let models = ModelCache::new(Box::new(store), NonZeroUsize::new(8).unwrap());
    let tokens = TokenSigner::new(b"test secret".to_vec(), chrono::Duration::hours(12));
    let supply = SupplySettings {
        retry_delay: Duration::from_millis(1),
        ..SupplySettings::default()
    };
    Services::new(
        library,
        models,
        tokens,
        RecommendSettings::default(),
        supply,
        UPLOAD_URL,
    )
    .unwrap()
}

/// Records every message instead of sending it.
#[derive(Default)]
pub struct RecordingOutbox {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingOutbox {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Outbox for RecordingOutbox {
    async fn send(&self, user: &str, text: &str) -> Result<(), ConnectionError> {
        self.sent
            .lock()
            .unwrap()
            .push((user.to_string(), text.to_string()));
        Ok(())
    }
}
