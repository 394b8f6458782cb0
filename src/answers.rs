use std::{fs, path::Path};

use indexmap::IndexMap;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::errors::{FileOperation, IoError, ParseError};

#[derive(Debug, Error, Diagnostic)]
#[error("question '{name}' was asked but no answer was provided")]
#[diagnostic(
    code(kopye_test::answers::missing_answer),
    help("Add an answer for '{name}' with `with_answers`, or give the question a default")
)]
pub struct MissingAnswerError {
    pub name: String,
}

#[derive(Debug, Error, Diagnostic)]
pub enum AnswerFileError {
    #[error("I/O error within answers domain")]
    #[diagnostic(code(kopye_test::answers::io))]
    Io(#[from] IoError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Parse(#[from] ParseError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionType {
    #[default]
    #[serde(alias = "text")]
    Input,
    Password,
    Editor,
    Number,
    Confirm,
    #[serde(alias = "select")]
    List,
    #[serde(alias = "raw_list")]
    RawList,
    Expand,
    #[serde(alias = "multiselect")]
    Checkbox,
}

/// How a question type treats a mocked candidate answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnswerFamily {
    /// `null` is a legitimate selection.
    ClosedChoice,
    /// `null` and `""` mean "nothing typed".
    FreeText,
    Boolean,
    Other,
}
impl QuestionType {
    fn family(self) -> AnswerFamily {
        match self {
            Self::List | Self::RawList | Self::Expand => AnswerFamily::ClosedChoice,
            Self::Input | Self::Password | Self::Editor => AnswerFamily::FreeText,
            Self::Confirm => AnswerFamily::Boolean,
            Self::Number | Self::Checkbox => AnswerFamily::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Question {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub r#type: QuestionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
}
impl Question {
    pub fn new(r#type: QuestionType, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: None,
            r#type,
            default: None,
            choices: None,
        }
    }

    pub fn input(name: impl Into<String>) -> Self {
        Self::new(QuestionType::Input, name)
    }

    pub fn confirm(name: impl Into<String>) -> Self {
        Self::new(QuestionType::Confirm, name)
    }

    pub fn list<I, S>(name: impl Into<String>, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(QuestionType::List, name).with_choices(choices)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.choices = Some(choices.into_iter().map(Into::into).collect());
        self
    }

    /// The text shown to a human: the message when present, the name otherwise.
    pub fn label(&self) -> &str {
        self.message.as_deref().unwrap_or(&self.name)
    }
}

/// One prompt call: a single question or an ordered batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Questions(pub Vec<Question>);
impl From<Question> for Questions {
    fn from(question: Question) -> Self {
        Self(vec![question])
    }
}
impl From<Vec<Question>> for Questions {
    fn from(questions: Vec<Question>) -> Self {
        Self(questions)
    }
}
impl<const N: usize> From<[Question; N]> for Questions {
    fn from(questions: [Question; N]) -> Self {
        Self(questions.into())
    }
}

/// Mocked answers keyed by question name.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct AnswerTable(pub IndexMap<String, Value>);
impl AnswerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a table from a TOML fixture (`name = value` pairs).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, AnswerFileError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path)
            .map_err(|error| IoError::new(FileOperation::Read, path.to_path_buf(), error))?;

        let parsed: AnswerTable =
            toml::from_str(&content).map_err(|error| ParseError::toml(path.to_path_buf(), error))?;

        Ok(parsed)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Last write wins per key; keys absent from `other` are kept.
    pub fn merge(&mut self, other: AnswerTable) {
        for (name, value) in other.0 {
            self.0.insert(name, value);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
impl From<serde_json::Map<String, Value>> for AnswerTable {
    fn from(map: serde_json::Map<String, Value>) -> Self {
        Self(map.into_iter().collect())
    }
}
impl<K, V, const N: usize> From<[(K, V); N]> for AnswerTable
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from(pairs: [(K, V); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }
}

/// Final answers of one prompt call, in question order. `None` marks an unresolved answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResolvedAnswers(pub IndexMap<String, Option<Value>>);
impl ResolvedAnswers {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name).and_then(Option::as_ref)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Answers as a JSON object; unresolved answers are omitted.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .filter_map(|(name, value)| value.clone().map(|value| (name.clone(), value)))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ResolveOptions {
    pub throw_on_missing_answer: bool,
}

/// Resolves the final answer of `question` against the mocked `answers`.
///
/// The rules differ per question type:
///
/// - closed-choice (`list`, `rawlist`, `expand`): an explicit `null` is a valid selection.
/// - free-text (`input`, `password`, `editor`): `null` or `""` fall back to the default.
/// - `confirm`: `null` or no entry resolve to `true`, whatever the default; `false` is kept.
/// - anything else: any explicit entry wins, otherwise the default.
///
/// # Errors
///
/// Returns a [`MissingAnswerError`] when `throw_on_missing_answer` is set, the table has no
/// entry for the question and the question has no default.
pub fn resolve(
    question: &Question,
    answers: &AnswerTable,
    options: &ResolveOptions,
) -> Result<Option<Value>, MissingAnswerError> {
    let candidate = answers.get(&question.name);

    if candidate.is_none() && question.default.is_none() && options.throw_on_missing_answer {
        return Err(MissingAnswerError {
            name: question.name.clone(),
        });
    }

    let fallback = || question.default.clone();

    let resolved = match question.r#type.family() {
        AnswerFamily::ClosedChoice | AnswerFamily::Other => candidate.cloned().or_else(fallback),
        AnswerFamily::FreeText => match candidate {
            None | Some(Value::Null) => fallback(),
            Some(Value::String(text)) if text.is_empty() => fallback(),
            Some(value) => Some(value.clone()),
        },
        AnswerFamily::Boolean => match candidate {
            None | Some(Value::Null) => Some(Value::Bool(true)),
            Some(value) => Some(value.clone()),
        },
    };

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lenient() -> ResolveOptions {
        ResolveOptions::default()
    }

    fn strict() -> ResolveOptions {
        ResolveOptions {
            throw_on_missing_answer: true,
        }
    }

    #[test]
    fn test_confirm_without_answer_is_true() {
        let question = Question::confirm("proceed");

        let resolved = resolve(&question, &AnswerTable::new(), &lenient()).unwrap();

        assert_eq!(resolved, Some(json!(true)));
    }

    #[test]
    fn test_confirm_false_is_kept() {
        let question = Question::confirm("proceed").with_default(true);
        let answers = AnswerTable::from([("proceed", false)]);

        let resolved = resolve(&question, &answers, &lenient()).unwrap();

        assert_eq!(resolved, Some(json!(false)));
    }

    #[test]
    fn test_confirm_without_answer_ignores_false_default() {
        let question = Question::confirm("proceed").with_default(false);

        let resolved = resolve(&question, &AnswerTable::new(), &lenient()).unwrap();

        assert_eq!(resolved, Some(json!(true)));
    }

    #[test]
    fn test_confirm_null_answer_is_true() {
        let question = Question::confirm("proceed").with_default(false);
        let answers = AnswerTable::from([("proceed", Value::Null)]);

        let resolved = resolve(&question, &answers, &lenient()).unwrap();

        assert_eq!(resolved, Some(json!(true)));
    }

    #[test]
    fn test_list_null_is_a_selection() {
        let question = Question::list("license", ["MIT", "Apache-2.0"]).with_default("MIT");
        let answers = AnswerTable::from([("license", Value::Null)]);

        let resolved = resolve(&question, &answers, &lenient()).unwrap();

        assert_eq!(resolved, Some(Value::Null));
    }

    #[test]
    fn test_list_without_answer_uses_default() {
        let question = Question::list("license", ["MIT", "Apache-2.0"]).with_default("MIT");

        let resolved = resolve(&question, &AnswerTable::new(), &lenient()).unwrap();

        assert_eq!(resolved, Some(json!("MIT")));
    }

    #[test]
    fn test_input_null_falls_back_to_default() {
        let question = Question::input("name").with_default("my-app");
        let answers = AnswerTable::from([("name", Value::Null)]);

        let resolved = resolve(&question, &answers, &lenient()).unwrap();

        assert_eq!(resolved, Some(json!("my-app")));
    }

    #[test]
    fn test_input_empty_string_falls_back_to_default() {
        let question = Question::input("name").with_default("my-app");
        let answers = AnswerTable::from([("name", "")]);

        let resolved = resolve(&question, &answers, &lenient()).unwrap();

        assert_eq!(resolved, Some(json!("my-app")));
    }

    #[test]
    fn test_other_types_keep_explicit_null() {
        let question = Question::new(QuestionType::Number, "port").with_default(8080);
        let answers = AnswerTable::from([("port", Value::Null)]);

        let resolved = resolve(&question, &answers, &lenient()).unwrap();

        assert_eq!(resolved, Some(Value::Null));
    }

    #[test]
    fn test_missing_answer_is_undefined_when_lenient() {
        let question = Question::input("name");

        let resolved = resolve(&question, &AnswerTable::new(), &lenient()).unwrap();

        assert_eq!(resolved, None);
    }

    #[test]
    fn test_missing_answer_fails_when_strict() {
        let question = Question::input("name");

        let error = resolve(&question, &AnswerTable::new(), &strict()).unwrap_err();

        assert_eq!(error.name, "name");
        assert!(error.to_string().contains("'name'"));
    }

    #[test]
    fn test_strict_mode_accepts_default() {
        let question = Question::input("name").with_default("fallback");

        let resolved = resolve(&question, &AnswerTable::new(), &strict()).unwrap();

        assert_eq!(resolved, Some(json!("fallback")));
    }

    #[test]
    fn test_strict_mode_applies_to_confirm() {
        let question = Question::confirm("proceed");

        assert!(resolve(&question, &AnswerTable::new(), &strict()).is_err());
    }

    #[test]
    fn test_merge_is_last_write_wins() {
        let mut answers = AnswerTable::from([("foo", json!(1)), ("bar", json!("kept"))]);

        answers.merge(AnswerTable::from([("foo", 2)]));

        assert_eq!(answers.get("foo"), Some(&json!(2)));
        assert_eq!(answers.get("bar"), Some(&json!("kept")));
    }

    #[test]
    fn test_question_type_aliases() {
        let question: Question =
            serde_json::from_value(json!({ "name": "tags", "type": "multiselect" })).unwrap();

        assert_eq!(question.r#type, QuestionType::Checkbox);

        let question: Question = serde_json::from_value(json!({ "name": "title" })).unwrap();

        assert_eq!(question.r#type, QuestionType::Input);
    }

    #[test]
    fn test_answer_table_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("answers.toml");
        std::fs::write(&path, "name = \"demo\"\nproceed = false\nport = 3000\n").unwrap();

        let answers = AnswerTable::from_file(&path).unwrap();

        assert_eq!(answers.get("name"), Some(&json!("demo")));
        assert_eq!(answers.get("proceed"), Some(&json!(false)));
        assert_eq!(answers.get("port"), Some(&json!(3000)));
    }

    #[test]
    fn test_answer_table_from_invalid_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("answers.toml");
        std::fs::write(&path, "name = ").unwrap();

        let error = AnswerTable::from_file(&path).unwrap_err();

        assert!(matches!(error, AnswerFileError::Parse(_)));
    }
}
