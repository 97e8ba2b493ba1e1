//! Parsed-document cache keyed by content hash.
//!
//! Readers get an `Arc<Document>`; a refresh parses outside the lock and then
//! swaps the pointer, so a reader never observes a partially built document.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};

use playbook_shared::{Document, content_hash};
use playbook_storage::Storage;

/// Holds the most recently parsed document.
#[derive(Debug, Default)]
pub struct DocumentCache {
    current: RwLock<Option<Arc<Document>>>,
}

impl DocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Document for `raw`, parsing only when its hash differs from the cached one.
    pub fn document(&self, raw: &str) -> Arc<Document> {
        let hash = content_hash(raw);
        if let Some(doc) = self.cached(&hash) {
            return doc;
        }

        let doc = Arc::new(playbook_methodology::parse(raw));
        self.swap(Arc::clone(&doc));
        doc
    }

    /// Like [`DocumentCache::document`], but consults the persisted cache
    /// before parsing and populates it afterwards.
    ///
    /// Persisted-cache failures only cost a re-parse; they are logged, not returned.
    pub async fn document_with_store(&self, raw: &str, storage: &Storage) -> Arc<Document> {
        let hash = content_hash(raw);
        if let Some(doc) = self.cached(&hash) {
            return doc;
        }

        match storage.get_cached_document(&hash).await {
            Ok(Some(doc)) => {
                debug!(hash = %hash, "document loaded from persisted cache");
                let doc = Arc::new(doc);
                self.swap(Arc::clone(&doc));
                return doc;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "persisted document cache unavailable"),
        }

        let doc = Arc::new(playbook_methodology::parse(raw));
        if !storage.is_readonly() {
            if let Err(e) = storage.put_cached_document(&doc).await {
                warn!(error = %e, "failed to persist parsed document");
            }
        }
        self.swap(Arc::clone(&doc));
        doc
    }

    fn cached(&self, hash: &str) -> Option<Arc<Document>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|doc| doc.content_hash == hash)
            .cloned()
    }

    fn swap(&self, doc: Arc<Document>) {
        info!(
            hash = %doc.content_hash,
            phases = doc.phases.len(),
            "methodology document refreshed"
        );
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(doc);
    }
}
