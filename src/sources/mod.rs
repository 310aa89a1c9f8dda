//! Source adapters: paged, incremental iterators over upstream items.
//!
//! An adapter owns upstream pagination, politeness delays between pages and
//! deduplication across the pages it emits. It never writes to the store.
//! Batches arrive on a bounded channel; the runner pulls one batch, processes
//! it fully, then pulls the next — the channel's capacity of 1 is the
//! per-page back-pressure.

pub mod static_list;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

pub use static_list::{StaticListAdapter, StaticListParams};

/// Target number of items per batch.
pub const BATCH_SIZE: usize = 100;

/// Minimum pause between upstream page fetches for network adapters.
pub const PAGE_DELAY_MS: u64 = 1_000;

/// One normalized upstream candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateItem {
    pub download_url: String,
    pub website_url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub author_url: Option<String>,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default)]
    pub source_created_at: Option<i64>,
    /// Upstream-reported width, when the site exposes it.
    #[serde(default)]
    pub width: Option<i64>,
    #[serde(default)]
    pub height: Option<i64>,
}

/// One page's worth of candidates.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub items: Vec<CandidateItem>,
}

impl Batch {
    pub fn new(items: Vec<CandidateItem>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Receiving half of a batch sequence. The sender dropping the channel is
/// the end-of-sequence sentinel; an `Err` item aborts the run.
pub type BatchReceiver = mpsc::Receiver<Result<Batch>>;

/// Contract every source adapter implements.
pub trait SourceAdapter: Send + Sync {
    /// Stable tag matching `Source::kind`.
    fn kind(&self) -> &'static str;

    /// Validate an opaque params object against this adapter's schema.
    fn validate_params(&self, params: &serde_json::Value) -> Result<()>;

    /// Start fetching. Emits at most `limit` items across all batches; the
    /// sequence is finite, non-restartable, and must terminate promptly when
    /// `cancel` fires. Network adapters pause at least [`PAGE_DELAY_MS`]
    /// between upstream page fetches.
    fn fetch_batches(
        &self,
        params: serde_json::Value,
        limit: usize,
        cancel: CancellationToken,
    ) -> BatchReceiver;
}

/// Dispatch table from `Source::kind` to the adapter, populated at startup.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in adapter registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(StaticListAdapter::new()));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(kind).cloned()
    }

    /// Resolve `kind` or fail with a validation error naming it.
    pub fn resolve(&self, kind: &str) -> Result<Arc<dyn SourceAdapter>> {
        self.get(kind)
            .ok_or_else(|| Error::validation(format!("unknown source kind '{}'", kind)))
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_resolves_static() {
        let registry = AdapterRegistry::with_builtins();
        assert!(registry.get("static").is_some());
        assert!(registry.get("unknown").is_none());
        assert!(matches!(
            registry.resolve("unknown"),
            Err(Error::Validation(_))
        ));
        assert_eq!(registry.kinds(), vec!["static"]);
    }
}
