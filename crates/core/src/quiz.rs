use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    sync::Arc,
};

use serde::{
    Deserialize, Deserializer,
    de::{MapAccess, Visitor},
};
use tracing::{debug, warn};

use crate::{
    config::QuizConfig,
    error::{PipelineError, Result},
    llm::{LanguageModel, SchemaHint, extract_json},
    types::{Difficulty, Module, Question, Quiz},
};

const MIN_OPTIONS: usize = 2;
const MAX_OPTIONS: usize = 5;

/// Option entries in provider order, duplicates included.
struct RawOptions(Vec<(String, String)>);

impl<'de> Deserialize<'de> for RawOptions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct OptionsVisitor;

        impl<'de> Visitor<'de> for OptionsVisitor {
            type Value = RawOptions;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of option keys to option text")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(4));
                while let Some((key, text)) = map.next_entry::<String, String>()? {
                    entries.push((key, text));
                }
                Ok(RawOptions(entries))
            }
        }

        deserializer.deserialize_map(OptionsVisitor)
    }
}

#[derive(Deserialize)]
struct RawQuestion {
    #[serde(alias = "prompt")]
    question: Option<String>,
    options: Option<RawOptions>,
    correct_answer: Option<String>,
    explanation: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawQuestions {
    Wrapped { questions: Vec<RawQuestion> },
    Bare(Vec<RawQuestion>),
}

pub struct QuizGenerator {
    llm: Arc<dyn LanguageModel>,
    config: QuizConfig,
}

impl QuizGenerator {
    pub fn new(llm: Arc<dyn LanguageModel>, config: QuizConfig) -> Self {
        Self { llm, config }
    }

    /// Generates and validates a quiz for one module.
    ///
    /// An answer that fails validation gets exactly one more attempt with a stricter
    /// instruction; a second failure is a `QuizValidationError`.
    pub async fn generate(
        &self,
        module: &Module,
        text: &str,
        difficulty: Difficulty,
    ) -> Result<Quiz> {
        let count = self.config.questions_per_module;
        let prompt = quiz_prompt(module, text, difficulty, count, None);
        let content = self.llm.generate(&prompt, SchemaHint::QuizQuestions).await?;

        let questions = match parse_questions(&content, count) {
            Ok(questions) => questions,
            Err(reason) => {
                warn!(
                    video_id = module.video_id.as_str(),
                    module_index = module.module_index,
                    reason = reason.as_str(),
                    "Quiz output rejected, retrying with stricter instruction"
                );
                let prompt = quiz_prompt(module, text, difficulty, count, Some(&reason));
                let content = self.llm.generate(&prompt, SchemaHint::QuizQuestions).await?;
                parse_questions(&content, count).map_err(|reason| {
                    PipelineError::QuizValidationError {
                        module_index: module.module_index,
                        reason,
                    }
                })?
            }
        };

        debug!(
            video_id = module.video_id.as_str(),
            module_index = module.module_index,
            questions = questions.len(),
            "Quiz generated"
        );

        Ok(Quiz {
            video_id: module.video_id.clone(),
            module_index: module.module_index,
            difficulty,
            questions,
        })
    }
}

fn difficulty_guidance(difficulty: Difficulty) -> (&'static str, usize) {
    match difficulty {
        Difficulty::Easy => (
            "recall of facts stated directly in the text, with clearly wrong distractors",
            3,
        ),
        Difficulty::Medium => (
            "understanding and applying the ideas in the text, with plausible distractors",
            4,
        ),
        Difficulty::Hard => (
            "analysis and comparison of ideas across the text, with closely related distractors",
            5,
        ),
    }
}

fn quiz_prompt(
    module: &Module,
    text: &str,
    difficulty: Difficulty,
    count: usize,
    previous_error: Option<&str>,
) -> String {
    let (focus, options) = difficulty_guidance(difficulty);
    let keys: Vec<String> = ('A'..='Z').take(options).map(String::from).collect();

    let mut prompt = format!(
        "Create {count} {difficulty} multiple-choice questions in JSON format from the text below.\n\
         Questions should test {focus}.\n\n\
         Format each question as a JSON object with:\n\
         - \"question\" (string)\n\
         - \"options\" (object with {} keys)\n\
         - \"correct_answer\" ({})\n\
         - \"explanation\" (string)\n\n\
         Module: {}\n\n\
         Text: {}\n",
        keys.join("-"),
        keys.join("/"),
        module.title,
        text
    );

    if let Some(error) = previous_error {
        prompt.push_str(&format!(
            "\nYour previous answer was rejected: {error}.\n\
             Return ONLY a JSON array of {count} questions, with no prose and no markdown fence. \
             Every question needs between {MIN_OPTIONS} and {MAX_OPTIONS} options keyed by \
             distinct single uppercase letters, and correct_answer must be exactly one of those \
             keys.\n"
        ));
    }
    prompt
}

/// Parses and validates untrusted provider output into exactly `count` questions.
///
/// Extra questions are dropped; fewer than `count` is a validation failure.
pub fn parse_questions(
    content: &str,
    count: usize,
) -> std::result::Result<Vec<Question>, String> {
    let json = extract_json(content).ok_or("no JSON in provider output")?;
    let raw: RawQuestions =
        serde_json::from_str(json).map_err(|e| format!("malformed quiz JSON: {e}"))?;
    let raw = match raw {
        RawQuestions::Wrapped { questions } => questions,
        RawQuestions::Bare(questions) => questions,
    };

    if raw.is_empty() {
        return Err("no questions in provider output".to_string());
    }
    if raw.len() < count {
        return Err(format!("expected {count} questions, got {}", raw.len()));
    }

    raw.into_iter()
        .take(count)
        .enumerate()
        .map(|(i, q)| validate_question(q).map_err(|reason| format!("question {i}: {reason}")))
        .collect()
}

fn validate_question(raw: RawQuestion) -> std::result::Result<Question, String> {
    let prompt = raw
        .question
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .ok_or("missing question text")?;

    let RawOptions(entries) = raw.options.ok_or("missing options")?;
    if !(MIN_OPTIONS..=MAX_OPTIONS).contains(&entries.len()) {
        return Err(format!(
            "expected {MIN_OPTIONS}-{MAX_OPTIONS} options, got {}",
            entries.len()
        ));
    }

    let mut seen = HashSet::new();
    let mut options = BTreeMap::new();
    for (key, text) in entries {
        let key = key.trim().to_string();
        let mut chars = key.chars();
        let single_upper = matches!((chars.next(), chars.next()), (Some(c), None) if c.is_ascii_uppercase());
        if !single_upper {
            return Err(format!("option key '{key}' is not a single uppercase letter"));
        }
        if !seen.insert(key.clone()) {
            return Err(format!("duplicate option key '{key}'"));
        }
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(format!("option '{key}' has no text"));
        }
        options.insert(key, text);
    }

    let correct_answer = raw
        .correct_answer
        .map(|a| a.trim().to_ascii_uppercase())
        .filter(|a| !a.is_empty())
        .ok_or("missing correct_answer")?;
    if !options.contains_key(&correct_answer) {
        return Err(format!(
            "correct_answer '{correct_answer}' is not one of the options"
        ));
    }

    Ok(Question {
        prompt,
        options,
        correct_answer,
        explanation: raw.explanation.unwrap_or_default().trim().to_string(),
    })
}
