//! The durable state the enrichment pipeline depends on.
//!
//! Every method failing means the store is unavailable, which aborts the
//! whole run: without it the pipeline cannot tell whether a task was
//! already enriched.

use std::time::Duration;

use async_trait::async_trait;

use playbook_shared::{EnrichmentRecord, Result};
use playbook_storage::Storage;

#[async_trait]
pub trait EnrichmentStore: Send + Sync {
    async fn get_record(&self, task_id: &str) -> Result<Option<EnrichmentRecord>>;

    async fn put_record(&self, record: &EnrichmentRecord) -> Result<()>;

    /// Take the exclusive per-task lease. `false` means someone else holds it.
    async fn try_acquire_lease(&self, task_id: &str, holder: &str, ttl: Duration)
    -> Result<bool>;

    async fn release_lease(&self, task_id: &str, holder: &str) -> Result<()>;
}

#[async_trait]
impl EnrichmentStore for Storage {
    async fn get_record(&self, task_id: &str) -> Result<Option<EnrichmentRecord>> {
        Storage::get_record(self, task_id).await
    }

    async fn put_record(&self, record: &EnrichmentRecord) -> Result<()> {
        Storage::put_record(self, record).await
    }

    async fn try_acquire_lease(
        &self,
        task_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool> {
        Storage::try_acquire_lease(self, task_id, holder, ttl).await
    }

    async fn release_lease(&self, task_id: &str, holder: &str) -> Result<()> {
        Storage::release_lease(self, task_id, holder).await
    }
}
