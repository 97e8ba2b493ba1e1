//! Methodology document parsing and canonical rendering.
//!
//! [`parse`] turns a plain-text implementation path into a [`Document`]:
//! an overview, an ordered list of phases with typed subsections, and any
//! trailing reference blocks. Parsing is total; structural anomalies are
//! reported as diagnostics on the document rather than as errors.

mod parser;
mod render;

use tracing::{debug, instrument};

use playbook_shared::Document;

pub use render::{render_phase, to_text};

/// Parse raw methodology text into a structured document.
#[instrument(skip_all, fields(bytes = raw.len()))]
pub fn parse(raw: &str) -> Document {
    let document = parser::parse_document(raw);
    debug!(
        phases = document.phases.len(),
        sections = document.sections.len(),
        diagnostics = document.diagnostics.len(),
        "parsed methodology document"
    );
    document
}
