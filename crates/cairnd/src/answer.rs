//! Answer generation boundary.
//!
//! The actual answer generator is an external collaborator; the main hub
//! only needs `Answer(question) → text`. Implementations here are stand-ins:
//! a canned lookup table for tests and a trivial echo for the demo daemon.

use std::collections::HashMap;
use thiserror::Error;

use cairn_core::crypto::normalize_question;

#[derive(Debug, Clone, Error)]
pub enum AnswerError {
    #[error("answer generation failed: {0}")]
    Failed(String),
}

/// Produces an answer for a question, or fails.
pub trait AnswerProvider: Send + Sync {
    fn answer(&self, question: &str) -> Result<String, AnswerError>;
}

/// Canned answers keyed by normalized question, with an optional fallback.
#[derive(Default)]
pub struct StaticAnswers {
    answers: HashMap<String, String>,
    fallback: Option<String>,
}

impl StaticAnswers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, question: &str, answer: &str) -> Self {
        self.answers
            .insert(normalize_question(question), answer.to_string());
        self
    }

    pub fn with_fallback(mut self, answer: &str) -> Self {
        self.fallback = Some(answer.to_string());
        self
    }
}

impl AnswerProvider for StaticAnswers {
    fn answer(&self, question: &str) -> Result<String, AnswerError> {
        self.answers
            .get(&normalize_question(question))
            .cloned()
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| AnswerError::Failed("no answer available".to_string()))
    }
}

/// Echoes the question back. Demo daemon only.
pub struct EchoAnswers;

impl AnswerProvider for EchoAnswers {
    fn answer(&self, question: &str) -> Result<String, AnswerError> {
        Ok(format!("echo: {question}"))
    }
}

/// Always fails. Exercises the ERROR-capsule path in tests.
pub struct FailingAnswers;

impl AnswerProvider for FailingAnswers {
    fn answer(&self, _question: &str) -> Result<String, AnswerError> {
        Err(AnswerError::Failed("generator unavailable".to_string()))
    }
}
