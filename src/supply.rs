//! The shared candidate pool.
//!
//! [`CandidateSupply`] behaves like an infinite iterator over eligible items.
//! It owns a shuffled buffer that is refilled with one bulk fetch from the
//! item library whenever it runs dry. Every recommendation request pulls from
//! the same supply, one caller at a time, so no two requests ever see the same
//! candidate from one fill.

use chrono::{Duration as ChronoDuration, Utc};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SupplyConfig;
use crate::models::ApprovalState;
use crate::traits::{Item, ItemLibrary};

/// Refill parameters.
#[derive(Debug, Clone)]
pub struct SupplySettings {
    /// Only items ranked within this trailing window are fetched.
    pub window: ChronoDuration,
    /// Maximum items requested per refill.
    pub refill_limit: usize,
    /// Minimum structural sub-elements for an item to be eligible.
    pub min_elements: usize,
    /// Back-off after a refill that failed or produced nothing eligible.
    pub retry_delay: Duration,
}

impl From<&SupplyConfig> for SupplySettings {
    fn from(config: &SupplyConfig) -> Self {
        Self {
            window: ChronoDuration::days(config.window_days),
            refill_limit: config.refill_limit,
            min_elements: config.min_elements,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

impl Default for SupplySettings {
    fn default() -> Self {
        Self::from(&SupplyConfig::default())
    }
}

struct Pool {
    library: Box<dyn ItemLibrary>,
    buffer: Vec<Arc<dyn Item>>,
    refills: u64,
}

pub struct CandidateSupply {
    pool: Mutex<Pool>,
    settings: SupplySettings,
}

impl CandidateSupply {
    /// `library` is owned by the supply and used only while the pool lock
    /// is held.
    pub fn new(library: Box<dyn ItemLibrary>, settings: SupplySettings) -> Self {
        Self {
            pool: Mutex::new(Pool {
                library,
                buffer: Vec::new(),
                refills: 0,
            }),
            settings,
        }
    }

    /// Take the next candidate, refilling first if the pool is empty.
    ///
    /// Waits as long as it takes for the library to produce an eligible
    /// item; concurrent callers queue behind the pool lock.
    pub async fn next(&self) -> Arc<dyn Item> {
        let mut pool = self.pool.lock().await;
        loop {
            if let Some(item) = pool.buffer.pop() {
                return item;
            }
            if !self.refill(&mut pool).await {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }
    }

    /// Number of completed refills so far.
    pub async fn refills(&self) -> u64 {
        self.pool.lock().await.refills
    }

    /// Returns `false` when nothing usable came back.
    async fn refill(&self, pool: &mut Pool) -> bool {
        let since = Utc::now() - self.settings.window;
        let fetched = match pool.library.list(since, self.settings.refill_limit).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "candidate refill failed");
                return false;
            }
        };

        let total = fetched.len();
        let mut eligible: Vec<Arc<dyn Item>> = Vec::with_capacity(total);
        for entry in fetched {
            match entry {
                Ok(item) if self.is_eligible(item.as_ref()) => eligible.push(item),
                Ok(item) => debug!(item = item.id(), "skipping ineligible candidate"),
                Err(e) => warn!(error = %e, "skipping item that failed to load"),
            }
        }

        if eligible.is_empty() {
            warn!(fetched = total, "candidate refill produced no eligible items");
            return false;
        }

        eligible.shuffle(&mut rand::thread_rng());
        info!(fetched = total, eligible = eligible.len(), "refilled candidate pool");
        pool.buffer = eligible;
        pool.refills += 1;
        true
    }

    fn is_eligible(&self, item: &dyn Item) -> bool {
        item.approval_state() == ApprovalState::Ranked
            && item.structural_element_count() >= self.settings.min_elements
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predict::OptionMask;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug)]
    struct Stub {
        id: u64,
        state: ApprovalState,
        elements: usize,
    }

    impl Item for Stub {
        fn id(&self) -> u64 {
            self.id
        }
        fn display_name(&self) -> String {
            format!("stub {}", self.id)
        }
        fn approval_state(&self) -> ApprovalState {
            self.state
        }
        fn structural_element_count(&self) -> usize {
            self.elements
        }
        fn performance(&self, _options: OptionMask, accuracy: f64) -> f64 {
            accuracy
        }
    }

    /// Each `list` call returns a fresh batch: `eligible` ranked items, one
    /// graveyard item, one item with a single element and one decode error.
    struct Batches {
        eligible: u64,
        calls: Arc<AtomicU64>,
        fail_first: bool,
    }

    #[async_trait]
    impl ItemLibrary for Batches {
        async fn lookup(&self, _id: u64) -> Result<Option<Arc<dyn Item>>> {
            Ok(None)
        }

        async fn list(
            &self,
            _since: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<Result<Arc<dyn Item>>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(anyhow!("library offline"));
            }
            let base = call * 1000;
            let mut out: Vec<Result<Arc<dyn Item>>> = (0..self.eligible)
                .map(|i| {
                    Ok(Arc::new(Stub {
                        id: base + i,
                        state: ApprovalState::Ranked,
                        elements: 10,
                    }) as Arc<dyn Item>)
                })
                .collect();
            out.push(Ok(Arc::new(Stub {
                id: base + 900,
                state: ApprovalState::Graveyard,
                elements: 10,
            })));
            out.push(Ok(Arc::new(Stub {
                id: base + 901,
                state: ApprovalState::Ranked,
                elements: 1,
            })));
            out.push(Err(anyhow!("truncated file")));
            out.truncate(limit);
            Ok(out)
        }

        async fn recent_scores(&self, _user: &str, _limit: usize) -> Result<Vec<f64>> {
            Ok(vec![])
        }
    }

    fn supply(eligible: u64, fail_first: bool) -> (CandidateSupply, Arc<AtomicU64>) {
        let calls = Arc::new(AtomicU64::new(0));
        let library = Batches {
            eligible,
            calls: calls.clone(),
            fail_first,
        };
        let settings = SupplySettings {
            retry_delay: Duration::from_millis(5),
            ..SupplySettings::default()
        };
        (CandidateSupply::new(Box::new(library), settings), calls)
    }

    #[tokio::test]
    async fn yields_each_eligible_item_once_per_fill() {
        let (supply, calls) = supply(5, false);

        let mut seen = HashSet::new();
        for _ in 0..5 {
            let item = supply.next().await;
            assert!(item.id() < 900, "ineligible item {} yielded", item.id());
            assert!(seen.insert(item.id()), "duplicate {}", item.id());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Sixth pull forces a second fill.
        let item = supply.next().await;
        assert!(item.id() >= 1000);
        assert_eq!(supply.refills().await, 2);
    }

    #[tokio::test]
    async fn single_eligible_item_per_fill_never_blocks() {
        let (supply, _) = supply(1, false);
        for round in 0..3u64 {
            let item = supply.next().await;
            assert_eq!(item.id(), round * 1000);
        }
    }

    #[tokio::test]
    async fn library_failure_is_retried() {
        let (supply, calls) = supply(2, true);
        let item = supply.next().await;
        assert!(item.id() >= 1000);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_get_distinct_items() {
        let (supply, _) = supply(20, false);
        let supply = Arc::new(supply);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let supply = supply.clone();
            handles.push(tokio::spawn(async move { supply.next().await.id() }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            assert!(ids.insert(handle.await.unwrap()));
        }
        assert_eq!(ids.len(), 20);
        assert_eq!(supply.refills().await, 1);
    }
}
