//! Grounded question answering over the methodology.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument};

use playbook_shared::{AppConfig, Document, Result};

use crate::conversation::{ConversationStore, Turn};
use crate::generation::{TextGenerator, answer_request, generate_with_timeout};
use crate::matcher::{MatchOptions, Matcher, truncate_chars};

/// Phases considered when answering a question.
const ANSWER_TOP_K: usize = 3;

/// Where an answer's context came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Grounding {
    /// Excerpts of these phases, best first.
    Matched { phases: Vec<u32> },
    /// Nothing matched; the session's previous phase was used.
    Hinted { phase: u32 },
    /// Nothing phase-specific; the document overview was used.
    Overview,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub phase_index: Option<u32>,
    pub grounding: Grounding,
}

#[derive(Debug, Clone)]
pub struct AssistantOptions {
    pub model: String,
    pub generation_timeout: Duration,
    pub overview_max_chars: usize,
    pub match_options: MatchOptions,
}

impl AssistantOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model: config.generation.model.clone(),
            generation_timeout: config.generation.timeout(),
            overview_max_chars: config.matching.overview_max_chars,
            match_options: MatchOptions::from(&config.matching),
        }
    }
}

/// Answers questions, remembering context per chat session.
pub struct Assistant {
    generator: Arc<dyn TextGenerator>,
    conversations: ConversationStore,
    matcher: Matcher,
    options: AssistantOptions,
}

impl Assistant {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        conversations: ConversationStore,
        options: AssistantOptions,
    ) -> Self {
        Self {
            generator,
            conversations,
            matcher: Matcher::new(options.match_options.clone()),
            options,
        }
    }

    /// Answer `question` within `session_id`.
    pub async fn ask(&self, session_id: &str, question: &str, document: &Document) -> Result<Answer> {
        self.ask_at(session_id, question, document, Utc::now()).await
    }

    /// [`Assistant::ask`] with an explicit clock.
    ///
    /// A generation failure is returned and leaves the session untouched.
    #[instrument(skip_all, fields(session_id = session_id))]
    pub async fn ask_at(
        &self,
        session_id: &str,
        question: &str,
        document: &Document,
        now: DateTime<Utc>,
    ) -> Result<Answer> {
        let resolution = self.conversations.resolve(session_id, question, document, now);
        let matches = self.matcher.match_phases(
            &resolution.effective_query,
            document,
            ANSWER_TOP_K,
            resolution.phase_hint,
        );

        let hinted = resolution
            .phase_hint
            .and_then(|index| document.phase(index));

        let (context, phase_index, grounding) = if let Some(best) = matches.first() {
            let context = matches
                .iter()
                .map(|m| m.excerpt.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            let phases = matches.iter().map(|m| m.phase.index).collect();
            (context, Some(best.phase.index), Grounding::Matched { phases })
        } else if let Some(phase) = hinted {
            (
                self.matcher.phase_excerpt(phase),
                Some(phase.index),
                Grounding::Hinted { phase: phase.index },
            )
        } else {
            (self.overview_context(document), None, Grounding::Overview)
        };

        let history = self.conversations.history(session_id, now);
        let request = answer_request(question.trim(), &context, &history, &self.options.model);
        let generated =
            generate_with_timeout(self.generator.as_ref(), &request, self.options.generation_timeout)
                .await?;

        info!(?phase_index, tokens_out = generated.tokens_out, "answered question");

        let purged = self.conversations.purge_expired(now);
        if purged > 0 {
            debug!(purged, "dropped idle sessions");
        }

        self.conversations.record(
            session_id,
            Turn {
                question: question.trim().to_string(),
                phase_index,
                answer: generated.text.clone(),
            },
            now,
        );

        Ok(Answer {
            text: generated.text,
            phase_index,
            grounding,
        })
    }

    /// Forget everything about a session. Returns whether it existed.
    pub fn reset(&self, session_id: &str) -> bool {
        self.conversations.reset(session_id)
    }

    fn overview_context(&self, document: &Document) -> String {
        if document.overview.is_empty() {
            return "(The methodology document has no overview.)".into();
        }
        truncate_chars(&document.overview, self.options.overview_max_chars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use playbook_shared::{PlaybookError, Phase};

    use crate::generation::{GeneratedText, GenerationRequest};

    #[derive(Default)]
    struct PromptLog {
        prompts: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl TextGenerator for PromptLog {
        async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedText> {
            if self.fail {
                return Err(PlaybookError::Generation("upstream 500".into()));
            }
            let mut prompts = self.prompts.lock().unwrap();
            prompts.push(request.prompt.clone());
            Ok(GeneratedText {
                text: format!("answer {}", prompts.len()),
                ..Default::default()
            })
        }
    }

    impl PromptLog {
        fn last_prompt(&self) -> String {
            self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    fn document() -> Document {
        let mut planning = Phase::new(1, "Planning & Setup", None);
        planning.deliverables = Some(vec!["kickoff checklist".into()]);
        let mut config = Phase::new(2, "Configuration & Development", None);
        config.activities = Some(vec!["integrate API credentials".into()]);
        Document {
            overview: "IMPLEMENTATION PATH: ONBOARDING".into(),
            phases: vec![planning, config],
            ..Default::default()
        }
    }

    fn assistant(generator: Arc<PromptLog>) -> Assistant {
        let options = AssistantOptions {
            generation_timeout: Duration::from_secs(1),
            ..AssistantOptions::from_config(&AppConfig::default())
        };
        Assistant::new(
            generator,
            ConversationStore::new(Duration::from_secs(600), 10),
            options,
        )
    }

    #[tokio::test]
    async fn matched_question_is_grounded_on_phase_excerpt() {
        let log = Arc::new(PromptLog::default());
        let assistant = assistant(Arc::clone(&log));

        let answer = assistant
            .ask("s1", "How do we integrate API credentials?", &document())
            .await
            .expect("ask");
        assert_eq!(answer.phase_index, Some(2));
        assert_eq!(answer.grounding, Grounding::Matched { phases: vec![2] });
        assert!(log.last_prompt().contains("Key Activities: integrate API credentials"));
    }

    #[tokio::test]
    async fn follow_up_uses_previous_phase() {
        let log = Arc::new(PromptLog::default());
        let assistant = assistant(Arc::clone(&log));
        let doc = document();
        let t0 = Utc::now();

        assistant
            .ask_at("s1", "What is in the kickoff checklist?", &doc, t0)
            .await
            .unwrap();
        let follow_up = assistant
            .ask_at("s1", "Who approves that?", &doc, t0 + chrono::Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(follow_up.grounding, Grounding::Hinted { phase: 1 });
        let prompt = log.last_prompt();
        assert!(prompt.contains("kickoff checklist"));
        assert!(prompt.contains("Q: What is in the kickoff checklist?"));

        // After the idle timeout the same follow-up has no context.
        let late = assistant
            .ask_at("s1", "Who approves that?", &doc, t0 + chrono::Duration::seconds(700))
            .await
            .unwrap();
        assert_eq!(late.grounding, Grounding::Overview);
        assert!(log.last_prompt().contains("IMPLEMENTATION PATH: ONBOARDING"));
    }

    #[tokio::test]
    async fn unmatched_question_without_session_uses_overview() {
        let log = Arc::new(PromptLog::default());
        let answer = assistant(Arc::clone(&log))
            .ask("s1", "Is there a budget?", &document())
            .await
            .unwrap();
        assert_eq!(answer.phase_index, None);
        assert_eq!(answer.grounding, Grounding::Overview);
    }

    #[tokio::test]
    async fn failed_generation_leaves_session_unchanged() {
        let log = Arc::new(PromptLog {
            fail: true,
            ..Default::default()
        });
        let assistant = assistant(Arc::clone(&log));
        let doc = document();

        let err = assistant
            .ask("s1", "What is in the kickoff checklist?", &doc)
            .await
            .unwrap_err();
        assert!(matches!(err, PlaybookError::Generation(_)));
        assert!(!assistant.reset("s1"));
    }

    #[tokio::test]
    async fn reset_forgets_the_phase() {
        let log = Arc::new(PromptLog::default());
        let assistant = assistant(Arc::clone(&log));
        let doc = document();

        assistant
            .ask("s1", "What is in the kickoff checklist?", &doc)
            .await
            .unwrap();
        assert!(assistant.reset("s1"));
        let answer = assistant.ask("s1", "Who approves that?", &doc).await.unwrap();
        assert_eq!(answer.grounding, Grounding::Overview);
    }

    #[tokio::test]
    async fn idle_sessions_are_dropped_when_another_session_is_answered() {
        let log = Arc::new(PromptLog::default());
        let assistant = assistant(Arc::clone(&log));
        let doc = document();
        let t0 = Utc::now();

        assistant
            .ask_at("s1", "What is in the kickoff checklist?", &doc, t0)
            .await
            .unwrap();
        assistant
            .ask_at("s2", "Is there a budget?", &doc, t0 + chrono::Duration::seconds(700))
            .await
            .unwrap();
        assert!(!assistant.reset("s1"));
        assert!(assistant.reset("s2"));
    }

    #[tokio::test]
    async fn explicit_phase_reference_wins_over_session() {
        let log = Arc::new(PromptLog::default());
        let assistant = assistant(Arc::clone(&log));
        let doc = document();

        assistant
            .ask("s1", "What is in the kickoff checklist?", &doc)
            .await
            .unwrap();
        let answer = assistant
            .ask("s1", "What happens in phase 2?", &doc)
            .await
            .unwrap();
        assert_eq!(answer.phase_index, Some(2));
    }
}
