//! JSON catalog adapter for [`ItemLibrary`].
//!
//! The catalog file is an export of the item database:
//!
//! ```json
//! {
//!   "items": [
//!     { "id": 315, "artist": "xi", "title": "FREEDOM DiVE", "version": "FOUR DIMENSIONS",
//!       "approval": "ranked", "hit_objects": 1983, "ranked_at": "2012-06-08T00:00:00Z",
//!       "base_score": 390.0 }
//!   ],
//!   "scores": { "alice": [212.5, 198.0] }
//! }
//! ```
//!
//! Items are decoded one by one when the file is opened so a single broken
//! entry is reported on its own instead of poisoning the whole catalog.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::models::ApprovalState;
use crate::predict::{GameOption, OptionMask};
use crate::traits::{Item, ItemLibrary, LibraryConnector};

/// Accuracy exponent of the reference score curve.
const ACCURACY_EXPONENT: i32 = 8;

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogItem {
    pub id: u64,
    pub artist: String,
    pub title: String,
    pub version: String,
    pub approval: ApprovalState,
    pub hit_objects: usize,
    #[serde(default)]
    pub ranked_at: Option<DateTime<Utc>>,
    /// Score for a perfect play without options.
    pub base_score: f64,
}

fn option_multiplier(option: GameOption) -> f64 {
    match option {
        GameOption::DoubleTime => 1.5,
        GameOption::Hidden => 1.06,
        GameOption::HardRock => 1.1,
    }
}

impl Item for CatalogItem {
    fn id(&self) -> u64 {
        self.id
    }

    fn display_name(&self) -> String {
        format!("{} - {} [{}]", self.artist, self.title, self.version)
    }

    fn approval_state(&self) -> ApprovalState {
        self.approval
    }

    fn structural_element_count(&self) -> usize {
        self.hit_objects
    }

    fn performance(&self, options: OptionMask, accuracy: f64) -> f64 {
        let multiplier: f64 = options.options().map(option_multiplier).product();
        self.base_score * multiplier * accuracy.clamp(0.0, 1.0).powi(ACCURACY_EXPONENT)
    }
}

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default)]
    items: Vec<Value>,
    #[serde(default)]
    scores: HashMap<String, Vec<f64>>,
}

struct Catalog {
    items: Vec<Result<Arc<CatalogItem>, String>>,
    scores: HashMap<String, Vec<f64>>,
}

/// Parses the catalog once; every [`connect`](LibraryConnector::connect)
/// hands out a cheap handle onto the same data.
pub struct CatalogConnector {
    catalog: Arc<Catalog>,
}

impl CatalogConnector {
    pub fn open(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog: {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse catalog: {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(content)?;
        let items = file
            .items
            .into_iter()
            .enumerate()
            .map(|(i, value)| {
                serde_json::from_value::<CatalogItem>(value)
                    .map(Arc::new)
                    .map_err(|e| format!("catalog entry {}: {}", i, e))
            })
            .collect();
        Ok(Self {
            catalog: Arc::new(Catalog {
                items,
                scores: file.scores,
            }),
        })
    }
}

impl LibraryConnector for CatalogConnector {
    fn connect(&self) -> Result<Box<dyn ItemLibrary>> {
        Ok(Box::new(CatalogLibrary {
            catalog: self.catalog.clone(),
        }))
    }
}

struct CatalogLibrary {
    catalog: Arc<Catalog>,
}

#[async_trait]
impl ItemLibrary for CatalogLibrary {
    async fn lookup(&self, id: u64) -> Result<Option<Arc<dyn Item>>> {
        Ok(self
            .catalog
            .items
            .iter()
            .flatten()
            .find(|item| item.id == id)
            .map(|item| item.clone() as Arc<dyn Item>))
    }

    async fn list(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Result<Arc<dyn Item>>>> {
        let entries = self.catalog.items.iter().filter_map(|entry| match entry {
            Ok(item) => item
                .ranked_at
                .filter(|ranked_at| *ranked_at >= since)
                .map(|_| Ok(item.clone() as Arc<dyn Item>)),
            Err(e) => Some(Err(anyhow!("{}", e))),
        });
        Ok(entries.take(limit).collect())
    }

    async fn recent_scores(&self, user: &str, limit: usize) -> Result<Vec<f64>> {
        let mut scores = self.catalog.scores.get(user).cloned().unwrap_or_default();
        scores.truncate(limit);
        Ok(scores)
    }
}
