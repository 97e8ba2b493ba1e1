//! Domain logic for Playbook.
//!
//! This crate ties the parsed methodology to the outside world: matching
//! questions and tasks to phases, enriching tracker tasks with generated
//! guidance, and answering questions within a conversation.

pub mod assistant;
pub mod bridge;
pub mod cache;
pub mod conversation;
pub mod description;
pub mod enrichment;
pub mod generation;
pub mod matcher;
pub mod status;
pub mod store;
pub mod tracker;

pub use assistant::{Answer, Assistant, AssistantOptions, Grounding};
pub use cache::DocumentCache;
pub use conversation::ConversationStore;
pub use enrichment::{
    CancelFlag, EnrichmentPipeline, EnrichmentPolicy, EnrichmentProgress, EnrichmentReport,
    SilentEnrichmentProgress,
};
pub use generation::TextGenerator;
pub use matcher::{MatchOptions, Matcher, PhaseMatch};
pub use store::EnrichmentStore;
pub use tracker::TaskTracker;
