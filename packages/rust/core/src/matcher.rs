//! Lexical relevance matching of free text against methodology phases.
//!
//! Queries and phase text are normalized (case-folded, punctuation stripped,
//! stop words removed) and compared as token sets. Each distinct query token
//! scores [`TITLE_WEIGHT`] when it appears in the phase title, otherwise
//! [`BODY_WEIGHT`] when it appears anywhere in the notes or subsection items.

use std::collections::HashSet;

use tracing::{debug, instrument};

use playbook_methodology::render_phase;
use playbook_shared::{Document, MatchingConfig, Phase};

pub const TITLE_WEIGHT: u32 = 3;
pub const BODY_WEIGHT: u32 = 1;

/// Marker appended to excerpts cut at the size limit.
const TRUNCATION_MARKER: &str = "\n[... truncated ...]";

/// Words that carry no phase-specific signal.
const STOP_WORDS: &[&str] = &[
    "a", "about", "all", "an", "and", "any", "are", "as", "at", "be", "by", "can", "do", "does",
    "for", "from", "get", "has", "have", "how", "i", "if", "in", "into", "is", "it", "its", "me",
    "my", "of", "on", "or", "our", "should", "so", "that", "the", "their", "then", "there",
    "this", "to", "up", "us", "we", "what", "when", "where", "which", "who", "why", "will",
    "with", "you", "your",
];

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Case-fold and replace every non-alphanumeric character with a space.
pub fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect()
}

/// Normalized tokens in order of appearance, stop words removed.
pub fn tokenize(text: &str) -> Vec<String> {
    normalize(text)
        .split_whitespace()
        .filter(|t| !STOP_WORDS.contains(t))
        .map(str::to_string)
        .collect()
}

fn token_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// Truncate to at most `max_chars` characters on a char boundary.
///
/// The cut is marked when the marker fits inside the limit; the result never
/// exceeds `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let marker_chars = TRUNCATION_MARKER.chars().count();
    let (keep, marker) = if max_chars > marker_chars {
        (max_chars - marker_chars, TRUNCATION_MARKER)
    } else {
        (max_chars, "")
    };
    let byte_idx = text
        .char_indices()
        .nth(keep)
        .map_or(text.len(), |(idx, _)| idx);
    format!("{}{marker}", &text[..byte_idx])
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// Excerpt sizing.
#[derive(Debug, Clone)]
pub struct MatchOptions {
    pub max_excerpt_chars: usize,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            max_excerpt_chars: 1500,
        }
    }
}

impl From<&MatchingConfig> for MatchOptions {
    fn from(config: &MatchingConfig) -> Self {
        Self {
            max_excerpt_chars: config.max_excerpt_chars,
        }
    }
}

/// One ranked phase with its supporting excerpt.
#[derive(Debug, Clone)]
pub struct PhaseMatch<'a> {
    pub phase: &'a Phase,
    pub excerpt: String,
    pub score: u32,
}

/// Scores phases against free text.
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    options: MatchOptions,
}

impl Matcher {
    pub fn new(options: MatchOptions) -> Self {
        Self { options }
    }

    /// Rank phases by relevance to `query`, best first, at most `top_k`.
    ///
    /// Only phases containing at least one query token are returned; an empty
    /// result means there is no phase-specific context. `hint` prefers one
    /// phase index among equal scores and never adds or removes results.
    #[instrument(skip_all, fields(top_k = top_k, hint = ?hint))]
    pub fn match_phases<'a>(
        &self,
        query: &str,
        document: &'a Document,
        top_k: usize,
        hint: Option<u32>,
    ) -> Vec<PhaseMatch<'a>> {
        let query_tokens = token_set(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, &'a Phase, u32)> = document
            .phases
            .iter()
            .enumerate()
            .filter_map(|(position, phase)| {
                let score = score_phase(&query_tokens, phase);
                (score > 0).then_some((position, phase, score))
            })
            .collect();

        scored.sort_by(|(pos_a, a, score_a), (pos_b, b, score_b)| {
            score_b
                .cmp(score_a)
                .then_with(|| {
                    let hinted_a = Some(a.index) == hint;
                    let hinted_b = Some(b.index) == hint;
                    hinted_b.cmp(&hinted_a)
                })
                .then_with(|| a.index.cmp(&b.index))
                .then_with(|| pos_a.cmp(pos_b))
        });

        let matches: Vec<PhaseMatch<'a>> = scored
            .into_iter()
            .take(top_k.max(1))
            .map(|(_, phase, score)| PhaseMatch {
                phase,
                excerpt: self.excerpt(phase, &query_tokens),
                score,
            })
            .collect();

        debug!(
            query_tokens = query_tokens.len(),
            matched = matches.len(),
            best = matches.first().map(|m| m.phase.index),
            "matched query against phases"
        );
        matches
    }

    /// Excerpt of a whole phase, for callers that already know which phase they want.
    pub fn phase_excerpt(&self, phase: &Phase) -> String {
        truncate_chars(&render_phase(phase), self.options.max_excerpt_chars)
    }

    /// Heading line plus the items that contain a query token.
    ///
    /// When only the title matched, the whole phase is used instead.
    fn excerpt(&self, phase: &Phase, query_tokens: &HashSet<String>) -> String {
        let hits = |text: &str| tokenize(text).iter().any(|t| query_tokens.contains(t));

        let mut lines = vec![heading_line(phase)];
        lines.extend(
            phase
                .note_lines()
                .filter(|line| hits(*line))
                .map(|line| format!("Notes: {line}")),
        );
        for (kind, items) in phase.sections() {
            lines.extend(
                items
                    .iter()
                    .filter(|item| hits(item.as_str()))
                    .map(|item| format!("{}: {item}", kind.heading())),
            );
        }

        if lines.len() == 1 {
            return self.phase_excerpt(phase);
        }
        truncate_chars(&lines.join("\n"), self.options.max_excerpt_chars)
    }
}

fn heading_line(phase: &Phase) -> String {
    match &phase.time_range {
        Some(time) => format!("{} ({time})", phase.heading()),
        None => phase.heading(),
    }
}

fn score_phase(query_tokens: &HashSet<String>, phase: &Phase) -> u32 {
    let title = token_set(&phase.title);

    let mut body = token_set(&phase.notes);
    for (_, items) in phase.sections() {
        for item in items {
            body.extend(tokenize(item));
        }
    }

    query_tokens
        .iter()
        .map(|token| {
            if title.contains(token) {
                TITLE_WEIGHT
            } else if body.contains(token) {
                BODY_WEIGHT
            } else {
                0
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two-phase document from the enrichment scenario.
    fn scenario_document() -> Document {
        let mut planning = Phase::new(1, "Planning & Setup", None);
        planning.deliverables = Some(vec!["kickoff checklist".into()]);
        let mut config = Phase::new(2, "Configuration & Development", None);
        config.activities = Some(vec!["integrate API credentials".into()]);
        Document {
            phases: vec![planning, config],
            ..Default::default()
        }
    }

    fn fixture_document() -> Document {
        let content = std::fs::read_to_string("../../../fixtures/methodology/path.txt")
            .expect("read fixture");
        playbook_methodology::parse(&content)
    }

    #[test]
    fn tokenize_strips_punctuation_and_stop_words() {
        assert_eq!(
            tokenize("Set up the API-credentials!"),
            vec!["set", "api", "credentials"]
        );
        assert_eq!(normalize("Go-Live & Support"), "go live   support");
        assert!(tokenize("how do I?").is_empty());
    }

    #[test]
    fn api_credentials_match_configuration_phase() {
        let doc = scenario_document();
        let matches = Matcher::default().match_phases("Set up API credentials", &doc, 1, None);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].phase.index, 2);
        assert_eq!(matches[0].score, 2 * BODY_WEIGHT);
        assert!(matches[0].excerpt.contains("integrate API credentials"));
    }

    #[test]
    fn no_shared_token_is_empty() {
        let doc = scenario_document();
        assert!(
            Matcher::default()
                .match_phases("quarterly budget review", &doc, 3, None)
                .is_empty()
        );
        assert!(Matcher::default().match_phases("", &doc, 3, None).is_empty());
    }

    #[test]
    fn title_outweighs_body() {
        let mut a = Phase::new(1, "Testing", None);
        a.activities = Some(vec!["write training plan".into()]);
        let b = Phase::new(2, "Training", None);
        let doc = Document {
            phases: vec![a, b],
            ..Default::default()
        };
        let matches = Matcher::default().match_phases("training", &doc, 2, None);
        assert_eq!(matches[0].phase.index, 2);
        assert_eq!(matches[0].score, TITLE_WEIGHT);
        assert_eq!(matches[1].score, BODY_WEIGHT);
    }

    #[test]
    fn ties_prefer_hint_then_lower_index() {
        let mut a = Phase::new(1, "Alpha", None);
        a.steps = Some(vec!["review data".into()]);
        let mut b = Phase::new(2, "Beta", None);
        b.steps = Some(vec!["review data".into()]);
        let doc = Document {
            phases: vec![b, a],
            ..Default::default()
        };
        let matcher = Matcher::default();

        let plain = matcher.match_phases("review", &doc, 2, None);
        assert_eq!(plain[0].phase.index, 1);

        let hinted = matcher.match_phases("review", &doc, 2, Some(2));
        assert_eq!(hinted[0].phase.index, 2);
        assert_eq!(hinted.len(), 2);
    }

    #[test]
    fn hint_never_overrides_a_better_score() {
        let doc = scenario_document();
        let matches = Matcher::default().match_phases("API credentials", &doc, 3, Some(1));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].phase.index, 2);
    }

    #[test]
    fn every_match_shares_a_token_with_the_query() {
        let doc = fixture_document();
        let matcher = Matcher::default();
        for query in [
            "who signs the charter",
            "training materials for admins",
            "monitor adoption after cut over",
            "single sign-on",
        ] {
            let query_tokens = token_set(query);
            for m in matcher.match_phases(query, &doc, 4, None) {
                let mut text = m.phase.title.clone();
                text.push(' ');
                text.push_str(&m.phase.notes);
                for (_, items) in m.phase.sections() {
                    text.push(' ');
                    text.push_str(&items.join(" "));
                }
                assert!(
                    token_set(&text).iter().any(|t| query_tokens.contains(t)),
                    "phase {} matched {query:?} without a shared token",
                    m.phase.index
                );
            }
        }
    }

    #[test]
    fn excerpt_holds_heading_and_matched_items_only() {
        let doc = fixture_document();
        let matches = Matcher::default().match_phases("webhook delivery", &doc, 1, None);
        let excerpt = &matches[0].excerpt;
        assert!(excerpt.starts_with("Phase 2: Configuration & Development (Weeks 3-6)"));
        assert!(excerpt.contains("Implementation Steps: Validate webhook delivery"));
        assert!(!excerpt.contains("Import reference data"));
    }

    #[test]
    fn title_only_match_uses_whole_phase() {
        let doc = fixture_document();
        let matches = Matcher::default().match_phases("support", &doc, 1, None);
        assert_eq!(matches[0].phase.index, 4);
        assert!(matches[0].excerpt.contains("Hypercare report"));
    }

    #[test]
    fn excerpt_is_bounded() {
        let doc = fixture_document();
        let matcher = Matcher::new(MatchOptions {
            max_excerpt_chars: 40,
        });
        let matches = matcher.match_phases("credentials", &doc, 1, None);
        let excerpt = &matches[0].excerpt;
        assert!(excerpt.ends_with(TRUNCATION_MARKER));
        assert_eq!(excerpt.chars().count(), 40);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("exact", 5), "exact");

        let text = "é".repeat(50);
        let cut = truncate_chars(&text, 30);
        assert_eq!(cut.chars().count(), 30);
        assert!(cut.starts_with("éééééééééé"));
        assert!(cut.ends_with(TRUNCATION_MARKER));

        // Too small for the marker: a plain cut.
        assert_eq!(truncate_chars("ééééé", 2), "éé");
    }

    #[test]
    fn zero_top_k_is_treated_as_one() {
        let doc = fixture_document();
        assert_eq!(
            Matcher::default().match_phases("deliverables report", &doc, 0, None).len(),
            1
        );
    }
}
