//! Core domain types for Playbook knowledge bases.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Separator between fingerprinted fields; cannot occur in parsed line text.
const FIELD_SEP: &[u8] = b"\x1f";

/// SHA-256 hex digest of arbitrary text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// SectionKind
// ---------------------------------------------------------------------------

/// The four typed subsections a phase may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Activities,
    Requirements,
    Steps,
    Deliverables,
}

impl SectionKind {
    /// All kinds in canonical rendering order.
    pub const ALL: [SectionKind; 4] = [
        Self::Activities,
        Self::Requirements,
        Self::Steps,
        Self::Deliverables,
    ];

    /// Canonical heading text written by the serializer.
    pub fn heading(&self) -> &'static str {
        match self {
            Self::Activities => "Key Activities",
            Self::Requirements => "Requirements",
            Self::Steps => "Implementation Steps",
            Self::Deliverables => "Deliverables",
        }
    }

    /// Stable lowercase label (used in fingerprints and excerpts).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activities => "activities",
            Self::Requirements => "requirements",
            Self::Steps => "steps",
            Self::Deliverables => "deliverables",
        }
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// One stage of the methodology document.
///
/// Each typed subsection is `None` when its heading never appeared and
/// `Some(vec![])` when the heading appeared with no items under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    /// Ordinal taken from the phase marker (not from position).
    pub index: u32,
    /// Short label, e.g. "Planning & Setup".
    pub title: String,
    /// Free-text duration such as "Weeks 1-2".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<String>,
    /// Unstructured text between the marker and the first subsection.
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub activities: Option<Vec<String>>,
    #[serde(default)]
    pub requirements: Option<Vec<String>>,
    #[serde(default)]
    pub steps: Option<Vec<String>>,
    #[serde(default)]
    pub deliverables: Option<Vec<String>>,
}

impl Phase {
    /// A phase with no notes and no subsections.
    pub fn new(index: u32, title: impl Into<String>, time_range: Option<String>) -> Self {
        Self {
            index,
            title: title.into(),
            time_range,
            notes: String::new(),
            activities: None,
            requirements: None,
            steps: None,
            deliverables: None,
        }
    }

    /// Items of one subsection, or `None` if the subsection is absent.
    pub fn section(&self, kind: SectionKind) -> Option<&[String]> {
        match kind {
            SectionKind::Activities => self.activities.as_deref(),
            SectionKind::Requirements => self.requirements.as_deref(),
            SectionKind::Steps => self.steps.as_deref(),
            SectionKind::Deliverables => self.deliverables.as_deref(),
        }
    }

    /// Mutable slot for one subsection.
    pub fn section_slot(&mut self, kind: SectionKind) -> &mut Option<Vec<String>> {
        match kind {
            SectionKind::Activities => &mut self.activities,
            SectionKind::Requirements => &mut self.requirements,
            SectionKind::Steps => &mut self.steps,
            SectionKind::Deliverables => &mut self.deliverables,
        }
    }

    /// Present subsections in canonical order.
    pub fn sections(&self) -> impl Iterator<Item = (SectionKind, &[String])> {
        SectionKind::ALL
            .into_iter()
            .filter_map(|kind| self.section(kind).map(|items| (kind, items)))
    }

    /// Non-blank lines of the notes block.
    pub fn note_lines(&self) -> impl Iterator<Item = &str> {
        self.notes.lines().map(str::trim).filter(|l| !l.is_empty())
    }

    /// "Phase 2: Configuration & Development".
    pub fn heading(&self) -> String {
        format!("Phase {}: {}", self.index, self.title)
    }

    /// Deterministic hash over the full phase content.
    ///
    /// Changes whenever any field that could influence generated guidance
    /// changes; used to decide whether enrichment is stale.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.index.to_string().as_bytes());
        hasher.update(FIELD_SEP);
        hasher.update(self.title.as_bytes());
        hasher.update(FIELD_SEP);
        hasher.update(self.time_range.as_deref().unwrap_or("").as_bytes());
        hasher.update(FIELD_SEP);
        hasher.update(self.notes.as_bytes());
        for kind in SectionKind::ALL {
            hasher.update(FIELD_SEP);
            hasher.update(kind.as_str().as_bytes());
            match self.section(kind) {
                None => hasher.update(b"-"),
                Some(items) => {
                    hasher.update(b"+");
                    for item in items {
                        hasher.update(FIELD_SEP);
                        hasher.update(item.as_bytes());
                    }
                }
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A named free-text block trailing the phases (e.g. "Domain Knowledge").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedSection {
    pub name: String,
    pub text: String,
}

/// Kind of structural anomaly noticed while parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A line that looks like a phase marker but does not parse as one.
    MalformedPhaseHeading,
    /// A phase ordinal that was already used earlier in the document.
    DuplicatePhaseIndex { index: u32 },
    /// A phase ordinal lower than the one before it.
    NonIncreasingPhaseIndex { index: u32, previous: u32 },
    /// A subsection heading with no items following it.
    EmptySubsection { phase: u32, section: SectionKind },
}

/// A non-fatal parse anomaly. Never changes the parse result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseDiagnostic {
    /// 1-based line number in the raw text.
    pub line: usize,
    pub kind: DiagnosticKind,
    /// The offending line, trimmed.
    pub text: String,
}

/// Parsed methodology document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// SHA-256 of the raw text this document was parsed from.
    pub content_hash: String,
    /// Text before the first phase marker.
    pub overview: String,
    /// Phases in document order.
    pub phases: Vec<Phase>,
    /// Trailing named blocks in document order.
    #[serde(default)]
    pub sections: Vec<NamedSection>,
    /// Parse anomalies, for diagnostics only.
    #[serde(default)]
    pub diagnostics: Vec<ParseDiagnostic>,
}

impl Document {
    /// First phase carrying `index`, in document order.
    pub fn phase(&self, index: u32) -> Option<&Phase> {
        self.phases.iter().find(|p| p.index == index)
    }

    /// Named block by case-insensitive name.
    pub fn section(&self, name: &str) -> Option<&NamedSection> {
        self.sections
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    /// Whether the document has any phases.
    pub fn has_phases(&self) -> bool {
        !self.phases.is_empty()
    }
}

// ---------------------------------------------------------------------------
// External tasks & enrichment state
// ---------------------------------------------------------------------------

/// A task owned by the external tracker. Never owned by Playbook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalTask {
    /// Opaque, stable tracker identifier.
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_on: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
}

impl ExternalTask {
    /// An open task with no description.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            completed: false,
            due_on: None,
            assignee: None,
        }
    }
}

/// What was last applied to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub task_id: String,
    pub matched_phase_index: u32,
    /// [`Phase::fingerprint`] of the phase content used.
    pub content_fingerprint: String,
    pub generated_text: String,
    pub applied_at: DateTime<Utc>,
}
