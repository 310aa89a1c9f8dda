//! Built-in adapter serving a fixed item list from its params.
//!
//! Useful for curated URL lists driven by manual runs, and as the
//! deterministic fixture in tests. No network, so no politeness delay
//! between pages.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Batch, BatchReceiver, CandidateItem, SourceAdapter, BATCH_SIZE};
use crate::{Error, Result};

/// Params schema for the `static` adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticListParams {
    /// Items to emit, in order.
    pub items: Vec<CandidateItem>,
    /// Items per batch; defaults to [`BATCH_SIZE`].
    #[serde(default)]
    pub page_size: Option<usize>,
}

/// Adapter of kind `static`.
#[derive(Default)]
pub struct StaticListAdapter;

impl StaticListAdapter {
    pub fn new() -> Self {
        Self
    }

    fn parse_params(params: &serde_json::Value) -> Result<StaticListParams> {
        let parsed: StaticListParams = serde_json::from_value(params.clone())
            .map_err(|e| Error::validation(format!("invalid static adapter params: {}", e)))?;
        if parsed.page_size == Some(0) {
            return Err(Error::validation("page_size must be positive"));
        }
        for item in &parsed.items {
            if item.download_url.is_empty() {
                return Err(Error::validation("every item needs a download_url"));
            }
        }
        Ok(parsed)
    }
}

impl SourceAdapter for StaticListAdapter {
    fn kind(&self) -> &'static str {
        "static"
    }

    fn validate_params(&self, params: &serde_json::Value) -> Result<()> {
        Self::parse_params(params).map(|_| ())
    }

    fn fetch_batches(
        &self,
        params: serde_json::Value,
        limit: usize,
        cancel: CancellationToken,
    ) -> BatchReceiver {
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let parsed = match Self::parse_params(&params) {
                Ok(parsed) => parsed,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            let page_size = parsed.page_size.unwrap_or(BATCH_SIZE);
            let mut seen: HashSet<String> = HashSet::new();
            let mut emitted = 0usize;
            let mut page: Vec<CandidateItem> = Vec::with_capacity(page_size);

            for item in parsed.items {
                if emitted >= limit {
                    break;
                }
                if !seen.insert(item.download_url.clone()) {
                    continue;
                }
                page.push(item);
                emitted += 1;

                if page.len() == page_size {
                    let batch = Batch::new(std::mem::take(&mut page));
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = tx.send(Ok(batch)) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            }

            if !page.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tx.send(Ok(Batch::new(page))) => {}
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(n: usize) -> CandidateItem {
        CandidateItem {
            download_url: format!("https://example.com/full/{}.jpg", n),
            website_url: format!("https://example.com/view/{}", n),
            title: None,
            author: None,
            author_url: None,
            nsfw: false,
            source_created_at: None,
            width: None,
            height: None,
        }
    }

    fn params(items: Vec<CandidateItem>, page_size: Option<usize>) -> serde_json::Value {
        serde_json::to_value(StaticListParams { items, page_size }).unwrap()
    }

    async fn collect(mut rx: BatchReceiver) -> Vec<Batch> {
        let mut batches = Vec::new();
        while let Some(batch) = rx.recv().await {
            batches.push(batch.unwrap());
        }
        batches
    }

    #[tokio::test]
    async fn pages_respect_page_size_and_limit() {
        let adapter = StaticListAdapter::new();
        let items: Vec<_> = (0..10).map(item).collect();
        let rx = adapter.fetch_batches(params(items, Some(3)), 7, CancellationToken::new());

        let batches = collect(rx).await;
        let sizes: Vec<_> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn duplicates_are_dropped_across_pages() {
        let adapter = StaticListAdapter::new();
        let mut items: Vec<_> = (0..4).map(item).collect();
        items.push(item(0));
        items.push(item(2));
        let rx = adapter.fetch_batches(params(items, Some(2)), 100, CancellationToken::new());

        let total: usize = collect(rx).await.iter().map(Batch::len).sum();
        assert_eq!(total, 4);
    }

    #[tokio::test]
    async fn cancel_terminates_the_sequence() {
        let adapter = StaticListAdapter::new();
        let items: Vec<_> = (0..50).map(item).collect();
        let cancel = CancellationToken::new();
        let mut rx = adapter.fetch_batches(params(items, Some(10)), 100, cancel.clone());

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.len(), 10);

        cancel.cancel();
        // After cancellation the channel drains to the sentinel promptly.
        while let Some(batch) = rx.recv().await {
            batch.unwrap();
        }
    }

    #[tokio::test]
    async fn invalid_params_surface_on_the_channel() {
        let adapter = StaticListAdapter::new();
        assert!(adapter
            .validate_params(&serde_json::json!({"items": "nope"}))
            .is_err());

        let mut rx = adapter.fetch_batches(
            serde_json::json!({"items": "nope"}),
            10,
            CancellationToken::new(),
        );
        assert!(rx.recv().await.unwrap().is_err());
    }
}
