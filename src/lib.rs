//! Test harness for kopye generators.
//!
//! A [`RunContext`] resolves a target directory, an environment and a generator, answers the
//! generator's prompts from a mocked [`AnswerTable`], and records everything it writes in an
//! in-memory [`VirtualFileStore`] that tests assert against and may commit to disk.

pub mod answers;
pub mod api;
pub mod channel;
pub mod config;
pub mod context;
pub mod environment;
pub mod errors;
pub mod generator;
pub mod preview;
pub mod prompt;
pub mod result;
pub mod settings;
pub mod template;
pub mod transactions;
pub mod utils;
pub mod vfs;
pub mod workspace;

pub use answers::{AnswerTable, Question, QuestionType, Questions, ResolveOptions, ResolvedAnswers};
pub use api::{run_generator, run_registered, run_with_settings_file};
pub use channel::ErrorChannel;
pub use context::{
    CallbackResult, ErrorOrigin, GeneratorExecutionError, RunContext, RunError, RunState,
    StageKind, StageMisuseError,
};
pub use environment::{Environment, EnvironmentHandle, EnvironmentOptions, MemoryEnvironment};
pub use generator::{Generator, GeneratorBase, GeneratorError, GeneratorRef};
pub use prompt::{PromptInterceptor, Prompter};
pub use result::RunResult;
pub use settings::RunSettings;
pub use utils::init_logging;
pub use vfs::{FileContents, FileState, Snapshot, VirtualFileStore};
pub use workspace::TemporaryWorkspace;
