//! The delimited guidance block Playbook writes into task descriptions.
//!
//! Only the text between the begin and end lines belongs to Playbook.
//! Everything outside the block is user-owned and is carried over verbatim.
//!
//! ```text
//! === PLAYBOOK GUIDANCE: Phase 2 — Configuration & Development ===
//! Generated by AI Assistant on 2026-10-19
//!
//! <generated text>
//! === END PLAYBOOK GUIDANCE ===
//! ```

use chrono::NaiveDate;

const BEGIN_PREFIX: &str = "=== PLAYBOOK GUIDANCE:";
const END_LINE: &str = "=== END PLAYBOOK GUIDANCE ===";

/// Quote generated lines that would read as block delimiters.
fn neutralize_markers(text: &str) -> String {
    text.lines()
        .map(|line| {
            let trimmed = line.trim();
            if trimmed.starts_with(BEGIN_PREFIX) || trimmed == END_LINE {
                format!("> {trimmed}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render a complete guidance block.
///
/// Delimiter lines inside `text` are quoted so the block always ends at its
/// own end line.
pub fn render_block(
    phase_index: u32,
    phase_title: &str,
    assistant_name: &str,
    date: NaiveDate,
    text: &str,
) -> String {
    format!(
        "{BEGIN_PREFIX} Phase {phase_index} — {phase_title} ===\n\
         Generated by {assistant_name} on {}\n\n\
         {}\n\
         {END_LINE}",
        date.format("%Y-%m-%d"),
        neutralize_markers(text.trim())
    )
}

/// Byte range of the first complete block, from its begin line through its end line.
///
/// The begin line closest to the end line wins, so an orphaned begin line
/// left earlier in the text is treated as user content.
fn find_block(description: &str) -> Option<(usize, usize)> {
    let mut offset = 0;
    let mut begin = None;

    for raw in description.split_inclusive('\n') {
        let line = raw.trim_end_matches(['\n', '\r']);
        let trimmed = line.trim();
        if trimmed.starts_with(BEGIN_PREFIX) {
            begin = Some(offset);
        } else if trimmed == END_LINE {
            if let Some(start) = begin {
                return Some((start, offset + line.len()));
            }
        }
        offset += raw.len();
    }
    None
}

/// Insert `block`, replacing an existing block in place or appending after a blank line.
pub fn compose_description(existing: &str, block: &str) -> String {
    match find_block(existing) {
        Some((start, end)) => format!("{}{block}{}", &existing[..start], &existing[end..]),
        None if existing.trim().is_empty() => block.to_string(),
        None => format!("{}\n\n{block}", existing.trim_end()),
    }
}

/// The description with any guidance block removed, i.e. the user-owned text.
pub fn strip_block(description: &str) -> String {
    match find_block(description) {
        Some((start, end)) => {
            let before = description[..start].trim_end();
            let after = description[end..].trim_start();
            match (before.is_empty(), after.is_empty()) {
                (true, _) => after.to_string(),
                (_, true) => before.to_string(),
                _ => format!("{before}\n\n{after}"),
            }
        }
        None => description.to_string(),
    }
}
