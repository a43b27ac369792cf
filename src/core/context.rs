//! Shared findings store.
//!
//! `SharedContext` is the append-only, categorized key/value store that
//! completed tasks write into and that strategies, the aggregator and the
//! budget router read from. Each category has its own lock, so writers to
//! different categories never contend.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::core::finding::{Category, Finding, FindingDraft};
use crate::core::task::TaskId;
use crate::error::{Error, Result};
use crate::util::blocking;
use crate::{rlog_trace, rlog_warn};

/// Durable mirror for findings (the persisted `findings` table).
pub trait FindingMirror: Send + Sync {
    /// Upsert a finding on `(category, key)`.
    fn upsert_finding(&self, finding: &Finding) -> Result<()>;
}

#[derive(Debug, Default)]
struct CategoryStore {
    /// Latest value per key.
    current: BTreeMap<String, Finding>,
    /// Every write in arrival order, kept for audit.
    history: Vec<Finding>,
}

/// Thread-safe, categorized findings store with last-write-wins per key.
///
/// Cloning is cheap and clones share the same underlying store.
#[derive(Clone)]
pub struct SharedContext {
    categories: Arc<BTreeMap<Category, RwLock<CategoryStore>>>,
    mirror: Option<Arc<dyn FindingMirror>>,
    mirror_failures: Arc<AtomicU64>,
}

impl SharedContext {
    pub fn new() -> Self {
        let categories = Category::ALL
            .into_iter()
            .map(|c| (c, RwLock::new(CategoryStore::default())))
            .collect();
        Self {
            categories: Arc::new(categories),
            mirror: None,
            mirror_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Mirror every write into a durable store.
    pub fn with_mirror(mut self, mirror: Arc<dyn FindingMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    fn store(&self, category: Category) -> &RwLock<CategoryStore> {
        // Every category is inserted in `new`.
        &self.categories[&category]
    }

    /// Upsert a finding. Always succeeds in memory.
    ///
    /// Returns `true` if the key was new to its category. A failing mirror
    /// is logged and counted, never surfaced to the writer.
    pub fn put(&self, category: Category, key: &str, value: Value, producer: TaskId) -> bool {
        let finding = Finding::from_draft(FindingDraft::new(category, key, value), producer);
        self.put_finding(finding)
    }

    pub(crate) fn put_finding(&self, finding: Finding) -> bool {
        let is_new = self.put_unmirrored(&finding);
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.upsert_finding(&finding) {
                self.note_mirror_failure(&finding, &e);
            }
        }
        is_new
    }

    /// Store a finding in memory only; the caller mirrors it later with
    /// [`SharedContext::mirror_findings`].
    pub(crate) fn put_unmirrored(&self, finding: &Finding) -> bool {
        let is_new = {
            let mut store = self
                .store(finding.category)
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            store.history.push(finding.clone());
            store
                .current
                .insert(finding.key.clone(), finding.clone())
                .is_none()
        };
        rlog_trace!(
            "SharedContext::put {}/{} new={} by={}",
            finding.category,
            finding.key,
            is_new,
            finding.produced_by.short()
        );
        is_new
    }

    /// Write findings to the mirror on the blocking pool.
    ///
    /// Failures are logged and counted like those of [`SharedContext::put`].
    pub async fn mirror_findings(&self, findings: Vec<Finding>) {
        let Some(mirror) = self.mirror.clone() else {
            return;
        };
        if findings.is_empty() {
            return;
        }
        let failed = blocking(move || {
            Ok(findings
                .into_iter()
                .filter_map(|finding| match mirror.upsert_finding(&finding) {
                    Ok(()) => None,
                    Err(e) => Some((finding, e)),
                })
                .collect::<Vec<_>>())
        })
        .await;
        match failed {
            Ok(failed) => {
                for (finding, e) in failed {
                    self.note_mirror_failure(&finding, &e);
                }
            }
            Err(e) => {
                self.mirror_failures.fetch_add(1, Ordering::Relaxed);
                rlog_warn!("Finding mirror batch did not run: {}", e);
            }
        }
    }

    fn note_mirror_failure(&self, finding: &Finding, error: &Error) {
        self.mirror_failures.fetch_add(1, Ordering::Relaxed);
        rlog_warn!(
            "Failed to mirror finding {}/{}: {}",
            finding.category,
            finding.key,
            error
        );
    }

    /// Current value for a key, if any.
    pub fn get(&self, category: Category, key: &str) -> Option<Value> {
        self.get_finding(category, key).map(|f| f.value)
    }

    pub fn get_finding(&self, category: Category, key: &str) -> Option<Finding> {
        let store = self
            .store(category)
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        store.current.get(key).cloned()
    }

    /// Current findings of a category, ordered by key.
    pub fn query(&self, category: Category) -> Vec<Finding> {
        self.query_where(category, |_| true)
    }

    /// Current findings of a category matching `filter`, ordered by key.
    pub fn query_where<F>(&self, category: Category, filter: F) -> Vec<Finding>
    where
        F: Fn(&Finding) -> bool,
    {
        let store = self
            .store(category)
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        store
            .current
            .values()
            .filter(|f| filter(f))
            .cloned()
            .collect()
    }

    /// Current keys of a category, ordered.
    pub fn keys(&self, category: Category) -> Vec<String> {
        let store = self
            .store(category)
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        store.current.keys().cloned().collect()
    }

    /// Whether the category holds at least one finding.
    pub fn has(&self, category: Category) -> bool {
        self.count(category) > 0
    }

    /// Number of distinct keys in a category.
    pub fn count(&self, category: Category) -> usize {
        self.store(category)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .len()
    }

    /// Every write ever made to a category, oldest first.
    pub fn history(&self, category: Category) -> Vec<Finding> {
        self.store(category)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .clone()
    }

    /// Number of distinct keys across all categories.
    pub fn total(&self) -> usize {
        Category::ALL.into_iter().map(|c| self.count(c)).sum()
    }

    /// Number of writes that could not be mirrored.
    pub fn mirror_failures(&self) -> u64 {
        self.mirror_failures.load(Ordering::Relaxed)
    }
}

impl Default for SharedContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SharedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedContext")
            .field("findings", &self.total())
            .field("mirrored", &self.mirror.is_some())
            .finish()
    }
}
