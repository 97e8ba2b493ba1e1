//! Text-generation capability and the prompts Playbook sends to it.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use playbook_shared::{PlaybookError, Result};

use crate::conversation::Turn;

const DEFAULT_TEMPERATURE: f32 = 0.7;

/// What a request is for; lets the generator pick limits per use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    TaskGuidance,
    Answer,
}

/// A single generation call.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub kind: PromptKind,
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
}

/// Generated text plus usage accounting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneratedText {
    pub text: String,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub latency_ms: u64,
}

/// Opaque text generation. Implementations own transport and credentials.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedText>;
}

/// Call `generator`, treating a timeout or blank output as a generation failure.
pub async fn generate_with_timeout(
    generator: &dyn TextGenerator,
    request: &GenerationRequest,
    timeout: Duration,
) -> Result<GeneratedText> {
    let started = Instant::now();
    let generated = tokio::time::timeout(timeout, generator.generate(request))
        .await
        .map_err(|_| {
            warn!(timeout_ms = timeout.as_millis() as u64, "generation timed out");
            PlaybookError::Generation(format!("timed out after {}s", timeout.as_secs_f32()))
        })??;

    if generated.text.trim().is_empty() {
        return Err(PlaybookError::Generation("empty response".into()));
    }

    Ok(GeneratedText {
        latency_ms: generated
            .latency_ms
            .max(started.elapsed().as_millis() as u64),
        ..generated
    })
}

// ---------------------------------------------------------------------------
// Prompt builders
// ---------------------------------------------------------------------------

/// Guidance for one tracker task, grounded on a phase excerpt.
pub fn task_guidance_request(task_title: &str, excerpt: &str, model: &str) -> GenerationRequest {
    let prompt = format!(
        "Write implementation guidance for the following task.\n\n\
         TASK: {task_title}\n\n\
         RELEVANT METHODOLOGY:\n{excerpt}\n\n\
         Cover:\n\
         1. The purpose of this task within its phase\n\
         2. Requirements that apply to it\n\
         3. How to complete it effectively\n\
         4. Common pitfalls to avoid\n\
         5. How it connects to the rest of the implementation\n\n\
         Use short paragraphs with headings. Stay within the methodology above."
    );
    GenerationRequest {
        kind: PromptKind::TaskGuidance,
        model: model.to_string(),
        system: "You are an expert consultant providing implementation guidance.".into(),
        prompt,
        temperature: DEFAULT_TEMPERATURE,
    }
}

/// A chat answer grounded on methodology context and recent turns.
pub fn answer_request(
    question: &str,
    grounding: &str,
    history: &[Turn],
    model: &str,
) -> GenerationRequest {
    let mut prompt = format!("CONTEXT FROM THE IMPLEMENTATION PATH:\n{grounding}\n\n");

    if !history.is_empty() {
        prompt.push_str("EARLIER IN THIS CONVERSATION:\n");
        for turn in history {
            prompt.push_str(&format!("Q: {}\nA: {}\n", turn.question, turn.answer));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "QUESTION:\n{question}\n\n\
         Give a practical answer based on the context above. \
         Reference the relevant phase where it applies."
    ));

    GenerationRequest {
        kind: PromptKind::Answer,
        model: model.to_string(),
        system: "You are an expert consultant providing guidance on implementation.".into(),
        prompt,
        temperature: DEFAULT_TEMPERATURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl TextGenerator for Fixed {
        async fn generate(&self, _request: &GenerationRequest) -> Result<GeneratedText> {
            Ok(GeneratedText {
                text: self.0.into(),
                ..Default::default()
            })
        }
    }

    struct Slow;

    #[async_trait]
    impl TextGenerator for Slow {
        async fn generate(&self, _request: &GenerationRequest) -> Result<GeneratedText> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(GeneratedText::default())
        }
    }

    #[tokio::test]
    async fn timeout_is_a_generation_error() {
        let request = task_guidance_request("t", "e", "m");
        let err = generate_with_timeout(&Slow, &request, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, PlaybookError::Generation(_)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn blank_output_is_rejected() {
        let request = task_guidance_request("t", "e", "m");
        let err = generate_with_timeout(&Fixed("  \n"), &request, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("empty response"));

        let ok = generate_with_timeout(&Fixed("Do it."), &request, Duration::from_secs(1))
            .await
            .expect("generate");
        assert_eq!(ok.text, "Do it.");
    }

    #[test]
    fn guidance_prompt_carries_title_and_excerpt() {
        let request = task_guidance_request(
            "Set up API credentials",
            "Phase 2: Configuration & Development",
            "gpt-3.5-turbo",
        );
        assert_eq!(request.kind, PromptKind::TaskGuidance);
        assert!(request.prompt.contains("TASK: Set up API credentials"));
        assert!(request.prompt.contains("Phase 2: Configuration & Development"));
    }

    #[test]
    fn answer_prompt_includes_history() {
        let history = vec![Turn {
            question: "What is phase 1?".into(),
            phase_index: Some(1),
            answer: "Planning.".into(),
        }];
        let request = answer_request("And then?", "ctx", &history, "m");
        assert!(request.prompt.contains("Q: What is phase 1?\nA: Planning."));
        assert!(request.prompt.ends_with("Reference the relevant phase where it applies."));

        let request = answer_request("And then?", "ctx", &[], "m");
        assert!(!request.prompt.contains("EARLIER"));
    }
}
