use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use async_trait::async_trait;
use inquire::{Confirm, CustomType, Editor, MultiSelect, Password, Select, Text};
use miette::Diagnostic;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::{
    answers::{
        resolve, AnswerTable, MissingAnswerError, Question, QuestionType, Questions,
        ResolveOptions, ResolvedAnswers,
    },
    generator::Generator,
};

#[derive(Debug, Error, Diagnostic)]
pub enum PromptError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    MissingAnswer(#[from] MissingAnswerError),

    #[error("Error occurred trying to prompt user")]
    #[diagnostic(code(kopye_test::prompt::terminal))]
    Terminal(#[from] inquire::InquireError),

    #[error("question '{name}' needs choices")]
    #[diagnostic(
        code(kopye_test::prompt::missing_choices),
        help("List and checkbox questions must declare `choices`")
    )]
    MissingChoices { name: String },
}

/// Post-processes each mocked answer after resolution.
pub type AnswerCallback = Rc<dyn Fn(&Question, Option<Value>) -> Option<Value>>;

/// The prompt capability of a generator.
#[async_trait(?Send)]
pub trait Prompter {
    async fn prompt(&self, questions: &Questions) -> Result<ResolvedAnswers, PromptError>;
}

/// Asks questions on the terminal with `inquire`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompter;

impl TerminalPrompter {
    fn ask(question: &Question) -> Result<Value, PromptError> {
        let label = question.label();

        let answer = match question.r#type {
            QuestionType::Input => {
                let default = question.default.as_ref().and_then(Value::as_str);
                let mut text = Text::new(label);
                if let Some(default) = default {
                    text = text.with_default(default);
                }
                Value::String(text.prompt()?)
            }
            QuestionType::Password => {
                Value::String(Password::new(label).without_confirmation().prompt()?)
            }
            QuestionType::Editor => Value::String(Editor::new(label).prompt()?),
            QuestionType::Number => {
                let mut number = CustomType::<f64>::new(label);
                if let Some(default) = question.default.as_ref().and_then(Value::as_f64) {
                    number = number.with_default(default);
                }
                Value::from(number.prompt()?)
            }
            QuestionType::Confirm => {
                let default = question
                    .default
                    .as_ref()
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                Value::Bool(Confirm::new(label).with_default(default).prompt()?)
            }
            QuestionType::List | QuestionType::RawList | QuestionType::Expand => {
                let choices = Self::choices(question)?;
                Value::String(Select::new(label, choices).prompt()?)
            }
            QuestionType::Checkbox => {
                let choices = Self::choices(question)?;
                let picked = MultiSelect::new(label, choices).prompt()?;
                Value::Array(picked.into_iter().map(Value::String).collect())
            }
        };

        Ok(answer)
    }

    fn choices(question: &Question) -> Result<Vec<String>, PromptError> {
        question
            .choices
            .clone()
            .filter(|choices| !choices.is_empty())
            .ok_or_else(|| PromptError::MissingChoices {
                name: question.name.clone(),
            })
    }
}

#[async_trait(?Send)]
impl Prompter for TerminalPrompter {
    async fn prompt(&self, questions: &Questions) -> Result<ResolvedAnswers, PromptError> {
        let mut answers = ResolvedAnswers::default();

        for question in &questions.0 {
            let answer = Self::ask(question)?;
            answers.0.insert(question.name.clone(), Some(answer));
        }

        Ok(answers)
    }
}

/// A question the interceptor answered, with the answer it gave.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AskedQuestion {
    pub name: String,
    pub question: Question,
    pub answer: Option<Value>,
}

/// Replaces a generator's prompter with one that answers from an [`AnswerTable`].
pub struct PromptInterceptor {
    answers: RefCell<AnswerTable>,
    options: Cell<ResolveOptions>,
    callback: RefCell<Option<AnswerCallback>>,
    asked: RefCell<Vec<AskedQuestion>>,
}

impl std::fmt::Debug for PromptInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptInterceptor")
            .field("answers", &self.answers.borrow())
            .field("options", &self.options.get())
            .field("asked", &self.asked.borrow().len())
            .finish()
    }
}

impl PromptInterceptor {
    fn new(answers: AnswerTable, options: ResolveOptions) -> Self {
        Self {
            answers: RefCell::new(answers),
            options: Cell::new(options),
            callback: RefCell::new(None),
            asked: RefCell::new(Vec::new()),
        }
    }

    /// Installs mocked prompting on `generator`.
    ///
    /// The generator's prompter is swapped only the first time. Later calls merge `answers`
    /// into the active table and replace the options, keeping the same interceptor.
    pub fn install(
        generator: &dyn Generator,
        answers: AnswerTable,
        options: ResolveOptions,
    ) -> Rc<PromptInterceptor> {
        let base = generator.base();

        if let Some(existing) = base.interceptor() {
            log::debug!(
                "updating mocked answers for generator '{}'",
                base.namespace()
            );
            existing.answers.borrow_mut().merge(answers);
            existing.options.set(options);
            return existing;
        }

        log::debug!("intercepting prompts of generator '{}'", base.namespace());

        let interceptor = Rc::new(PromptInterceptor::new(answers, options));
        base.set_interceptor(Rc::clone(&interceptor));

        interceptor
    }

    pub fn set_callback(&self, callback: AnswerCallback) {
        *self.callback.borrow_mut() = Some(callback);
    }

    pub fn answers(&self) -> AnswerTable {
        self.answers.borrow().clone()
    }

    pub fn options(&self) -> ResolveOptions {
        self.options.get()
    }

    pub fn asked_questions(&self) -> Vec<AskedQuestion> {
        self.asked.borrow().clone()
    }
}

#[async_trait(?Send)]
impl Prompter for PromptInterceptor {
    async fn prompt(&self, questions: &Questions) -> Result<ResolvedAnswers, PromptError> {
        // answers are known up front, but callers still get a suspension point
        tokio::task::yield_now().await;

        let table = self.answers.borrow().clone();
        let options = self.options.get();
        let callback = self.callback.borrow().clone();

        let mut resolved = ResolvedAnswers::default();

        for question in &questions.0 {
            let mut answer = resolve(question, &table, &options)?;

            if let Some(callback) = &callback {
                answer = callback(question, answer);
            }

            self.asked.borrow_mut().push(AskedQuestion {
                name: question.name.clone(),
                question: question.clone(),
                answer: answer.clone(),
            });

            resolved.0.insert(question.name.clone(), answer);
        }

        Ok(resolved)
    }
}
