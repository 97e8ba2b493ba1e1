//! Task-tracker capability. The tracker owns task identity and completion;
//! Playbook only reads tasks and proposes description updates.

use async_trait::async_trait;

use playbook_shared::{ExternalTask, Result};

#[async_trait]
pub trait TaskTracker: Send + Sync {
    /// All tasks in a project. Pagination is the implementation's concern.
    async fn list_tasks(&self, project_id: &str) -> Result<Vec<ExternalTask>>;

    /// Replace a task's description.
    async fn update_description(&self, task_id: &str, description: &str) -> Result<()>;
}
