//! Recognizing agent requests for human input.

use serde::Deserialize;
use serde_json::Value;

use crate::state::{Answers, QuestionItem, QuestionOption};

/// Tool name the agent uses to ask the user a question.
pub const ASK_USER_TOOL: &str = "AskUserQuestion";

const MIN_OPTIONS: usize = 2;
const MAX_OPTIONS: usize = 3;

#[derive(Debug, Deserialize)]
struct AskInput {
    #[serde(default)]
    questions: Vec<AskQuestion>,
}

#[derive(Debug, Deserialize)]
struct AskQuestion {
    question: String,
    #[serde(default)]
    header: Option<String>,
    #[serde(default)]
    options: Vec<QuestionOption>,
    #[serde(default, rename = "multiSelect")]
    multi_select: bool,
}

/// Questions to route to a human when `name`/`input` is an interceptable
/// request: at least one question, each offering two or three options.
pub fn human_input_request(name: &str, input: &Value) -> Option<Vec<QuestionItem>> {
    if name != ASK_USER_TOOL {
        return None;
    }
    let parsed: AskInput = serde_json::from_value(input.clone()).ok()?;
    if parsed.questions.is_empty() {
        return None;
    }
    let shaped = parsed
        .questions
        .iter()
        .all(|q| (MIN_OPTIONS..=MAX_OPTIONS).contains(&q.options.len()));
    if !shaped {
        return None;
    }
    Some(
        parsed
            .questions
            .into_iter()
            .map(|q| QuestionItem {
                question: q.question,
                header: q.header,
                options: q.options,
                multi_select: q.multi_select,
            })
            .collect(),
    )
}

/// Tool input carrying the human's answers, handed back with the permission
/// grant so the tool returns them to the agent instead of prompting.
pub fn answered_input(input: &Value, answers: &Answers) -> Value {
    let answers = Value::Object(
        answers
            .iter()
            .map(|(question, answer)| (question.clone(), Value::String(answer.clone())))
            .collect(),
    );
    let mut updated = match input {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    updated.insert("answers".to_string(), answers);
    Value::Object(updated)
}
