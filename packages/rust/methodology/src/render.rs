//! Canonical text rendering of parsed documents.
//!
//! The output re-parses to the same overview, phases and sections, so a
//! document can be normalized by `to_text(&parse(raw))`.

use playbook_shared::{Document, Phase};

/// Render a whole document in canonical form.
pub fn to_text(document: &Document) -> String {
    let mut blocks: Vec<String> = Vec::new();

    if !document.overview.is_empty() {
        blocks.push(document.overview.clone());
    }
    for phase in &document.phases {
        blocks.push(render_phase(phase));
    }
    for section in &document.sections {
        if section.text.is_empty() {
            blocks.push(section.name.clone());
        } else {
            blocks.push(format!("{}\n{}", section.name, section.text));
        }
    }

    let mut out = blocks.join("\n\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Render one phase: marker line, notes, then each present subsection.
pub fn render_phase(phase: &Phase) -> String {
    let mut lines = vec![marker_line(phase)];

    lines.extend(phase.note_lines().map(str::to_string));

    for (kind, items) in phase.sections() {
        lines.push(String::new());
        lines.push(format!("{}:", kind.heading()));
        lines.extend(items.iter().map(|item| format!("- {item}")));
    }

    lines.join("\n")
}

fn marker_line(phase: &Phase) -> String {
    match &phase.time_range {
        Some(time) => format!("PHASE {}: {} ({time})", phase.index, phase.title),
        // An empty duration keeps a title ending in ")" from being read back as one.
        None if phase.title.ends_with(')') => {
            format!("PHASE {}: {} ()", phase.index, phase.title)
        }
        None => format!("PHASE {}: {}", phase.index, phase.title),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;

    fn same_structure(a: &Document, b: &Document) {
        assert_eq!(a.overview, b.overview);
        assert_eq!(a.phases, b.phases);
        assert_eq!(a.sections, b.sections);
    }

    #[test]
    fn fixture_reparses_identically() {
        let content = std::fs::read_to_string("../../../fixtures/methodology/path.txt")
            .expect("read fixture");
        let first = parse(&content);
        let text = to_text(&first);
        let second = parse(&text);
        same_structure(&first, &second);

        // Rendering is a fixed point after one pass.
        assert_eq!(to_text(&second), text);
    }

    #[test]
    fn render_phase_marks_empty_sections() {
        let mut phase = Phase::new(3, "Testing", Some("Weeks 7-8".into()));
        phase.notes = "Plan carefully.".into();
        phase.requirements = Some(vec![]);
        phase.deliverables = Some(vec!["UAT sign-off".into()]);

        let text = render_phase(&phase);
        assert_eq!(
            text,
            "PHASE 3: Testing (Weeks 7-8)\nPlan carefully.\n\nRequirements:\n\nDeliverables:\n- UAT sign-off"
        );
    }

    #[test]
    fn title_with_parentheses_survives() {
        let doc = parse("PHASE 1: Setup (Core)  ()\n");
        assert_eq!(doc.phases[0].title, "Setup (Core)");
        assert_eq!(doc.phases[0].time_range, None);
        let again = parse(&to_text(&doc));
        same_structure(&doc, &again);
    }

    #[test]
    fn empty_document_renders_empty() {
        assert_eq!(to_text(&Document::default()), "");
    }
}
