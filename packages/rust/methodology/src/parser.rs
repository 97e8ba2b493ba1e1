//! Line-oriented methodology parser.
//!
//! Recognizes three kinds of structural marker:
//! - Phase markers: `PHASE <n>: <title> (<duration>)`
//! - Subsection headings inside a phase: `Key Activities`, `Requirements`,
//!   `Implementation Steps`, `Deliverables` (plus short aliases)
//! - Trailing document sections: `Domain Knowledge`, `Common Challenges`,
//!   `Checklist`
//!
//! Everything else is content. Content is never dropped: it lands in the
//! overview, a phase's notes, a subsection's items, or a trailing section.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use playbook_shared::{
    DiagnosticKind, Document, NamedSection, ParseDiagnostic, Phase, SectionKind, content_hash,
};

// ---------------------------------------------------------------------------
// Regex patterns (compiled once)
// ---------------------------------------------------------------------------

/// Matches `PHASE 2: Configuration & Development (Weeks 3-6)` once heading
/// decoration has been stripped. The duration group is optional.
static PHASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^phase\s+(\d+)\s*[:.\-–—]\s*(.+?)\s*(?:\(([^()]*)\))?$").expect("phase regex")
});

/// Lines that start like a phase marker; used only for diagnostics.
static PHASE_LIKE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:#+\s*\**\s*(?i:phase)|\**\s*PHASE)\s+\d").expect("phase-like regex")
});

/// List leaders: `-`, `*`, `+`, `•`, `1.`, `1)`, optionally followed by a checkbox.
static LEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[-*+•▪◦]|\d+[.)])\s+(?:\[[ xX]\]\s*)?|^\[[ xX]\]\s*").expect("leader regex")
});

// ---------------------------------------------------------------------------
// Marker classification
// ---------------------------------------------------------------------------

/// Canonical trailing section names.
pub(crate) const DOMAIN_KNOWLEDGE: &str = "Domain Knowledge";
pub(crate) const COMMON_CHALLENGES: &str = "Common Challenges";
pub(crate) const CHECKLIST: &str = "Checklist";

enum Marker {
    Phase {
        index: u32,
        title: String,
        time_range: Option<String>,
    },
    Subsection(SectionKind),
    Trailing(&'static str),
}

/// Strip heading decoration: leading `#`s and a `**bold**` wrapper.
fn heading_text(line: &str) -> &str {
    let text = line.trim().trim_start_matches('#').trim();
    if text.starts_with("**") {
        text.trim_matches('*').trim()
    } else {
        text
    }
}

/// Normalized key for keyword headings: lowercase, no trailing colon.
fn heading_key(text: &str) -> String {
    text.trim_end_matches(':').trim().to_lowercase()
}

fn subsection_kind(key: &str) -> Option<SectionKind> {
    match key {
        "key activities" | "activities" => Some(SectionKind::Activities),
        "requirements" | "key requirements" => Some(SectionKind::Requirements),
        "implementation steps" | "steps" => Some(SectionKind::Steps),
        "deliverables" | "key deliverables" => Some(SectionKind::Deliverables),
        _ => None,
    }
}

fn trailing_section(key: &str) -> Option<&'static str> {
    match key {
        "domain knowledge" => Some(DOMAIN_KNOWLEDGE),
        "common challenges" | "challenges" => Some(COMMON_CHALLENGES),
        "checklist" | "implementation checklist" => Some(CHECKLIST),
        _ => None,
    }
}

/// Classify one raw line. Returns `None` for ordinary content.
fn classify(line: &str) -> Option<Marker> {
    let text = heading_text(line);
    if text.is_empty() {
        return None;
    }

    if let Some(caps) = PHASE_RE.captures(text) {
        // Ordinal 0 or overflow is not a valid marker; the caller records it.
        let index = caps[1].parse::<u32>().ok().filter(|i| *i > 0)?;
        let time_range = caps
            .get(3)
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty());
        return Some(Marker::Phase {
            index,
            title: caps[2].trim().to_string(),
            time_range,
        });
    }

    let key = heading_key(text);
    if let Some(kind) = subsection_kind(&key) {
        return Some(Marker::Subsection(kind));
    }
    trailing_section(&key).map(Marker::Trailing)
}

/// Remove one list leader from an item line.
pub(crate) fn strip_leader(line: &str) -> &str {
    let trimmed = line.trim();
    match LEADER_RE.find(trimmed) {
        Some(m) => trimmed[m.end()..].trim(),
        None => trimmed,
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

struct PhaseBuilder {
    phase: Phase,
    notes: Vec<String>,
    current: Option<SectionKind>,
    /// Line of the most recent heading for each subsection, for diagnostics.
    heading_lines: Vec<(SectionKind, usize, String)>,
}

impl PhaseBuilder {
    fn new(index: u32, title: String, time_range: Option<String>) -> Self {
        Self {
            phase: Phase::new(index, title, time_range),
            notes: Vec::new(),
            current: None,
            heading_lines: Vec::new(),
        }
    }

    fn open_subsection(&mut self, kind: SectionKind, line_no: usize, raw: &str) {
        // A repeated heading appends to the existing list.
        self.phase.section_slot(kind).get_or_insert_with(Vec::new);
        self.current = Some(kind);
        self.heading_lines
            .push((kind, line_no, raw.trim().to_string()));
    }

    fn push_content(&mut self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        match self.current {
            None => self.notes.push(trimmed.to_string()),
            Some(kind) => {
                let item = strip_leader(trimmed);
                if !item.is_empty() {
                    self.phase
                        .section_slot(kind)
                        .get_or_insert_with(Vec::new)
                        .push(item.to_string());
                }
            }
        }
    }

    fn finish(mut self, diagnostics: &mut Vec<ParseDiagnostic>) -> Phase {
        self.phase.notes = self.notes.join("\n");
        let mut reported = HashSet::new();
        for (kind, line, text) in self.heading_lines {
            let empty = self.phase.section(kind).is_some_and(<[String]>::is_empty);
            if empty && reported.insert(kind) {
                diagnostics.push(ParseDiagnostic {
                    line,
                    kind: DiagnosticKind::EmptySubsection {
                        phase: self.phase.index,
                        section: kind,
                    },
                    text,
                });
            }
        }
        self.phase
    }
}

/// Accumulates a block of free text, keeping interior blank lines.
#[derive(Default)]
struct TextBlock {
    lines: Vec<String>,
}

impl TextBlock {
    fn push(&mut self, line: &str) {
        self.lines.push(line.trim_end().to_string());
    }

    fn finish(self) -> String {
        self.lines.join("\n").trim().to_string()
    }
}

enum Cursor {
    Overview,
    Phase(PhaseBuilder),
    Trailing(&'static str, TextBlock),
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse raw methodology text. Total: never fails.
pub(crate) fn parse_document(raw: &str) -> Document {
    let mut overview = TextBlock::default();
    let mut phases: Vec<Phase> = Vec::new();
    let mut sections: Vec<NamedSection> = Vec::new();
    let mut diagnostics: Vec<ParseDiagnostic> = Vec::new();

    let mut seen_indices: HashSet<u32> = HashSet::new();
    let mut previous_index: Option<u32> = None;
    let mut cursor = Cursor::Overview;

    for (i, line) in raw.lines().enumerate() {
        let line_no = i + 1;

        match classify(line) {
            Some(Marker::Phase {
                index,
                title,
                time_range,
            }) => {
                close(cursor, &mut phases, &mut sections, &mut diagnostics);

                if !seen_indices.insert(index) {
                    diagnostics.push(ParseDiagnostic {
                        line: line_no,
                        kind: DiagnosticKind::DuplicatePhaseIndex { index },
                        text: line.trim().to_string(),
                    });
                } else if let Some(previous) = previous_index.filter(|p| index < *p) {
                    diagnostics.push(ParseDiagnostic {
                        line: line_no,
                        kind: DiagnosticKind::NonIncreasingPhaseIndex { index, previous },
                        text: line.trim().to_string(),
                    });
                }
                previous_index = Some(index);

                cursor = Cursor::Phase(PhaseBuilder::new(index, title, time_range));
            }
            Some(Marker::Trailing(name)) => {
                close(cursor, &mut phases, &mut sections, &mut diagnostics);
                cursor = Cursor::Trailing(name, TextBlock::default());
            }
            Some(Marker::Subsection(kind)) => match &mut cursor {
                Cursor::Phase(builder) => builder.open_subsection(kind, line_no, line),
                // Outside a phase a subsection heading is plain text.
                Cursor::Overview => overview.push(line),
                Cursor::Trailing(_, block) => block.push(line),
            },
            None => {
                if PHASE_LIKE_RE.is_match(line.trim()) {
                    diagnostics.push(ParseDiagnostic {
                        line: line_no,
                        kind: DiagnosticKind::MalformedPhaseHeading,
                        text: line.trim().to_string(),
                    });
                }
                match &mut cursor {
                    Cursor::Overview => overview.push(line),
                    Cursor::Phase(builder) => builder.push_content(line),
                    Cursor::Trailing(_, block) => block.push(line),
                }
            }
        }
    }
    close(cursor, &mut phases, &mut sections, &mut diagnostics);

    Document {
        content_hash: content_hash(raw),
        overview: overview.finish(),
        phases,
        sections,
        diagnostics,
    }
}

/// Flush whatever the cursor was accumulating.
fn close(
    cursor: Cursor,
    phases: &mut Vec<Phase>,
    sections: &mut Vec<NamedSection>,
    diagnostics: &mut Vec<ParseDiagnostic>,
) {
    match cursor {
        Cursor::Overview => {}
        Cursor::Phase(builder) => phases.push(builder.finish(diagnostics)),
        Cursor::Trailing(name, block) => sections.push(NamedSection {
            name: name.to_string(),
            text: block.finish(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fixture() {
        let content = std::fs::read_to_string("../../../fixtures/methodology/path.txt")
            .expect("read fixture");
        let doc = parse_document(&content);

        assert!(doc.overview.starts_with("IMPLEMENTATION PATH"));
        assert_eq!(doc.phases.len(), 4);

        let first = &doc.phases[0];
        assert_eq!(first.index, 1);
        assert_eq!(first.title, "Planning & Setup");
        assert_eq!(first.time_range.as_deref(), Some("Weeks 1-2"));
        assert!(first.notes.starts_with("Align stakeholders"));
        assert_eq!(first.activities.as_ref().map(Vec::len), Some(3));
        assert_eq!(
            first.deliverables.as_deref(),
            Some(&["Kickoff checklist".to_string(), "Project charter".to_string()][..])
        );
        assert!(first.steps.is_none());

        let second = &doc.phases[1];
        assert_eq!(second.notes, "");
        assert_eq!(
            second.activities.as_ref().unwrap()[0],
            "Integrate API credentials for the client tenant"
        );
        assert_eq!(second.steps.as_ref().map(Vec::len), Some(4));

        // Heading present, no items.
        assert_eq!(doc.phases[2].requirements, Some(vec![]));

        let names: Vec<&str> = doc.sections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec![DOMAIN_KNOWLEDGE, COMMON_CHALLENGES, CHECKLIST]);
        assert!(doc.sections[2].text.contains("[x] Training scheduled"));

        assert_eq!(doc.diagnostics.len(), 1);
        assert!(matches!(
            doc.diagnostics[0].kind,
            DiagnosticKind::EmptySubsection {
                phase: 3,
                section: SectionKind::Requirements
            }
        ));
    }

    #[test]
    fn empty_input_yields_empty_document() {
        let doc = parse_document("");
        assert!(doc.phases.is_empty());
        assert_eq!(doc.overview, "");
        assert!(doc.sections.is_empty());
        assert!(doc.diagnostics.is_empty());
    }

    #[test]
    fn text_without_markers_is_overview() {
        let doc = parse_document("Just some notes.\n\nNothing structured here.\n");
        assert!(doc.phases.is_empty());
        assert_eq!(doc.overview, "Just some notes.\n\nNothing structured here.");
    }

    #[test]
    fn index_comes_from_marker_not_position() {
        let doc = parse_document("PHASE 3: Later\nPHASE 7: Much later\n");
        let indices: Vec<u32> = doc.phases.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![3, 7]);
    }

    #[test]
    fn duplicate_index_keeps_both_phases() {
        let doc = parse_document("PHASE 1: First\n- a\nPHASE 1: Again\n- b\n");
        assert_eq!(doc.phases.len(), 2);
        assert_eq!(doc.phases[0].title, "First");
        assert_eq!(doc.phases[1].title, "Again");
        assert!(matches!(
            doc.diagnostics[0].kind,
            DiagnosticKind::DuplicatePhaseIndex { index: 1 }
        ));
        assert_eq!(doc.diagnostics[0].line, 3);
    }

    #[test]
    fn decreasing_index_is_diagnosed_not_rejected() {
        let doc = parse_document("PHASE 2: B\nPHASE 1: A\n");
        assert_eq!(doc.phases.len(), 2);
        assert!(matches!(
            doc.diagnostics[0].kind,
            DiagnosticKind::NonIncreasingPhaseIndex {
                index: 1,
                previous: 2
            }
        ));
    }

    #[test]
    fn marker_variants() {
        let doc = parse_document(
            "## Phase 1 - Discovery\n**PHASE 2: Build (Weeks 3-4)**\nphase 3. Launch ()\n",
        );
        assert_eq!(doc.phases.len(), 3);
        assert_eq!(doc.phases[0].title, "Discovery");
        assert_eq!(doc.phases[0].time_range, None);
        assert_eq!(doc.phases[1].title, "Build");
        assert_eq!(doc.phases[1].time_range.as_deref(), Some("Weeks 3-4"));
        assert_eq!(doc.phases[2].title, "Launch");
        assert_eq!(doc.phases[2].time_range, None);
    }

    #[test]
    fn title_keeps_inner_parentheses() {
        let doc = parse_document("PHASE 1: Setup (Core) Work (Weeks 1-2)\n");
        assert_eq!(doc.phases[0].title, "Setup (Core) Work");
        assert_eq!(doc.phases[0].time_range.as_deref(), Some("Weeks 1-2"));
    }

    #[test]
    fn malformed_marker_is_absorbed_and_diagnosed() {
        let doc = parse_document("PHASE 1: Real\nnote\nPHASE 0: Zero\nPHASE two: Words\n");
        assert_eq!(doc.phases.len(), 1);
        assert_eq!(doc.phases[0].notes, "note\nPHASE 0: Zero\nPHASE two: Words");
        let malformed = doc
            .diagnostics
            .iter()
            .filter(|d| d.kind == DiagnosticKind::MalformedPhaseHeading)
            .count();
        // "PHASE two" does not start with a digit, so only the zero ordinal is flagged.
        assert_eq!(malformed, 1);
    }

    #[test]
    fn subsection_headings_are_case_insensitive() {
        let doc = parse_document(
            "PHASE 1: X\n### KEY ACTIVITIES\n- a\n**Implementation steps:**\n1) first\n2) second\nkey deliverables:\n* thing\n",
        );
        let phase = &doc.phases[0];
        assert_eq!(phase.activities, Some(vec!["a".to_string()]));
        assert_eq!(
            phase.steps,
            Some(vec!["first".to_string(), "second".to_string()])
        );
        assert_eq!(phase.deliverables, Some(vec!["thing".to_string()]));
    }

    #[test]
    fn repeated_subsection_appends_and_keeps_duplicates() {
        let doc = parse_document("PHASE 1: X\nSteps\n- a\n- a\nDeliverables\n- d\nSteps\n- b\n");
        assert_eq!(
            doc.phases[0].steps,
            Some(vec!["a".to_string(), "a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn unrecognized_heading_inside_subsection_becomes_item() {
        let doc = parse_document("PHASE 1: X\nDeliverables\n## Appendix\n- d\n");
        assert_eq!(
            doc.phases[0].deliverables,
            Some(vec!["## Appendix".to_string(), "d".to_string()])
        );
    }

    #[test]
    fn subsection_heading_in_overview_is_text() {
        let doc = parse_document("Requirements\nEverything is required.\nPHASE 1: X\n");
        assert_eq!(doc.overview, "Requirements\nEverything is required.");
        assert_eq!(doc.phases[0].requirements, None);
    }

    #[test]
    fn phase_after_trailing_section_starts_new_phase() {
        let doc = parse_document("PHASE 1: A\nChecklist\n- x\nPHASE 2: B\n- y\n");
        assert_eq!(doc.phases.len(), 2);
        assert_eq!(doc.sections.len(), 1);
        assert_eq!(doc.sections[0].text, "- x");
        assert_eq!(doc.phases[1].notes, "- y");
    }

    #[test]
    fn strip_leader_variants() {
        assert_eq!(strip_leader("- item"), "item");
        assert_eq!(strip_leader("  12. item"), "item");
        assert_eq!(strip_leader("3) item"), "item");
        assert_eq!(strip_leader("• item"), "item");
        assert_eq!(strip_leader("- [ ] item"), "item");
        assert_eq!(strip_leader("[x] item"), "item");
        assert_eq!(strip_leader("plain item"), "plain item");
        assert_eq!(strip_leader("- 1. nested"), "1. nested");
    }
}
