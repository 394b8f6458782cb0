use std::{
    any::Any,
    cell::RefMut,
    fmt,
    path::{Path, PathBuf},
    rc::Rc,
};

use indexmap::IndexMap;
use miette::Diagnostic;
use serde_json::Value;
use tempfile::TempDir;
use thiserror::Error;
use tokio::{sync::mpsc::UnboundedReceiver, task::LocalSet};

use crate::{
    answers::{AnswerFileError, AnswerTable, ResolveOptions},
    channel::ErrorChannel,
    environment::{
        create_environment, EnvironmentError, EnvironmentFactory, EnvironmentHandle,
        EnvironmentOptions,
    },
    errors::{FileOperation, IoError},
    generator::{
        into_factory, Generator, GeneratorBase, GeneratorError, GeneratorFactory, GeneratorRef,
        InstantiateOptions,
    },
    prompt::{AnswerCallback, AskedQuestion, PromptInterceptor},
    result::RunResult,
    settings::RunSettings,
    vfs::{
        CommitError, FileContents, FsAdapter, LocalFs, SharedStore, Snapshot, StoreError,
        VirtualFileStore,
    },
    workspace::{TemporaryWorkspace, WorkspaceError},
};

/// Error type stage callbacks may fail with.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;
pub type CallbackResult = Result<(), CallbackError>;

type TargetDirectoryCallback = Box<dyn FnOnce(&Path, &RunContext) -> CallbackResult>;
type EnvironmentCallback = Box<dyn FnOnce(&EnvironmentHandle, &RunContext) -> CallbackResult>;
type GeneratorCallback = Box<dyn FnOnce(&mut dyn Generator, &RunContext) -> CallbackResult>;
type ErrorListener = Box<dyn FnMut(&RunError)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Callbacks and seeds may still be queued.
    Building,
    Running,
    Completed,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    TargetDirectory,
    Environment,
    Generator,
}
impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TargetDirectory => write!(f, "target directory"),
            Self::Environment => write!(f, "environment"),
            Self::Generator => write!(f, "generator"),
        }
    }
}

/// Where an execution failure was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOrigin {
    /// Emitted on the environment's error channel.
    Environment,
    /// Emitted on the generator's error channel.
    Generator,
    /// Returned from the generator's `run`.
    Execution,
    /// A panic caught while `catch_run_errors` was set.
    Panic,
}
impl fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Environment => write!(f, "environment error channel"),
            Self::Generator => write!(f, "generator error channel"),
            Self::Execution => write!(f, "run"),
            Self::Panic => write!(f, "panic"),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
#[error("generator execution failed ({origin}): {source}")]
#[diagnostic(code(kopye_test::run::execution))]
pub struct GeneratorExecutionError {
    pub origin: ErrorOrigin,
    #[source]
    pub source: GeneratorError,
}
impl GeneratorExecutionError {
    pub fn new(origin: ErrorOrigin, source: GeneratorError) -> Self {
        Self { origin, source }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum StageMisuseError {
    #[error("the run has already started")]
    #[diagnostic(
        code(kopye_test::run::already_started),
        help("Build a new RunContext for every run")
    )]
    AlreadyStarted,

    #[error("the run context was torn down")]
    #[diagnostic(code(kopye_test::run::torn_down))]
    TornDown,

    #[error("the {stage} stage has no value to revisit")]
    #[diagnostic(
        code(kopye_test::run::stage_unavailable),
        help("Register stage callbacks before the run, or before tearing the context down")
    )]
    StageUnavailable { stage: StageKind },

    #[error("files can only be committed after a completed run (state: {state:?})")]
    #[diagnostic(code(kopye_test::run::not_completed))]
    NotCompleted { state: RunState },
}

#[derive(Debug, Error, Diagnostic)]
pub enum RunError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error("I/O error within run domain")]
    #[diagnostic(code(kopye_test::run::io))]
    Io(#[from] IoError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Environment(#[from] EnvironmentError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Answers(#[from] AnswerFileError),

    #[error("unable to seed the file store")]
    #[diagnostic(code(kopye_test::run::seed))]
    Seed(#[from] StoreError),

    #[error("{stage} callback failed: {source}")]
    #[diagnostic(code(kopye_test::run::callback))]
    Callback {
        stage: StageKind,
        #[source]
        source: CallbackError,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Execution(#[from] GeneratorExecutionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    StageMisuse(#[from] StageMisuseError),
}

/// Callback queue and resolved value of one pipeline stage.
struct Stage<V, C> {
    queue: Vec<C>,
    resolved: Option<V>,
}
impl<V, C> Default for Stage<V, C> {
    fn default() -> Self {
        Self {
            queue: Vec::new(),
            resolved: None,
        }
    }
}

enum AnswerSource {
    Table(AnswerTable),
    File(PathBuf),
}

enum Seed {
    Files {
        base: Option<PathBuf>,
        files: Vec<(PathBuf, FileContents)>,
    },
    Config {
        key_path: String,
        value: Value,
    },
    LocalConfig(Value),
}

/// An error channel the run listens on, from its stage until the run ends.
struct Watched {
    origin: ErrorOrigin,
    channel: ErrorChannel,
    errors: UnboundedReceiver<GeneratorError>,
}
impl Watched {
    fn subscribe(origin: ErrorOrigin, channel: &ErrorChannel) -> Self {
        let channel = channel.clone();
        let errors = channel.subscribe();

        Self {
            origin,
            channel,
            errors,
        }
    }

    /// An error already queued on the channel.
    fn pending(&mut self) -> Result<(), GeneratorExecutionError> {
        match self.errors.try_recv() {
            Ok(error) => Err(GeneratorExecutionError::new(self.origin, error)),
            Err(_) => Ok(()),
        }
    }

    fn release(mut self) {
        self.channel.unsubscribe();

        while let Ok(error) = self.errors.try_recv() {
            log::warn!("dropping additional error from {}: {}", self.origin, error);
        }
    }
}

/// Drives one generator through `TargetDirectory -> Environment -> Generator`, then runs it.
///
/// Callbacks queued with `on_target_directory`, `on_environment` and `on_generator` fire when
/// their stage resolves, stage by stage and in registration order within a stage. A callback
/// queued after its stage resolved runs immediately. Errors from the environment's channel, the
/// generator's channel or `run` itself end the run in [`RunState::Errored`] and reach the
/// `on_error` listeners exactly once.
///
/// # Example
///
/// ```rust,ignore
/// let mut ctx = RunContext::new(GeneratorRef::factory(|base| App { base }))
///     .with_answers([("name", "demo")])
///     .with_files([("README.md", "seeded")]);
///
/// let result = ctx.run().await?;
/// result.assert_file("src/main.rs");
/// ```
pub struct RunContext {
    generator_ref: GeneratorRef,
    settings: RunSettings,
    state: RunState,
    torn_down: bool,
    arguments: Vec<String>,
    options: IndexMap<String, Value>,
    mock_prompts: bool,
    answer_sources: Vec<AnswerSource>,
    answers: AnswerTable,
    answer_callback: Option<AnswerCallback>,
    seeds: Vec<Seed>,
    dependencies: Vec<(String, GeneratorFactory)>,
    shared_environment: Option<EnvironmentHandle>,
    environment_factory: EnvironmentFactory,
    fs_adapter: Rc<dyn FsAdapter>,
    store: SharedStore,
    interceptor: Option<Rc<PromptInterceptor>>,
    target_directory: Stage<PathBuf, TargetDirectoryCallback>,
    environment: Stage<EnvironmentHandle, EnvironmentCallback>,
    generator: Stage<Box<dyn Generator>, GeneratorCallback>,
    environment_errors: Option<Watched>,
    generator_errors: Option<Watched>,
    error_listeners: Vec<ErrorListener>,
    workspace: Option<TemporaryWorkspace>,
    temp_dir: Option<TempDir>,
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("generator", &self.generator_ref)
            .field("state", &self.state)
            .field("settings", &self.settings)
            .field("target_directory", &self.target_directory.resolved)
            .field("files", &self.store.borrow().len())
            .finish()
    }
}

impl RunContext {
    pub fn new(generator: impl Into<GeneratorRef>) -> Self {
        Self {
            generator_ref: generator.into(),
            settings: RunSettings::default(),
            state: RunState::Building,
            torn_down: false,
            arguments: Vec::new(),
            options: IndexMap::new(),
            mock_prompts: true,
            answer_sources: Vec::new(),
            answers: AnswerTable::new(),
            answer_callback: None,
            seeds: Vec::new(),
            dependencies: Vec::new(),
            shared_environment: None,
            environment_factory: Rc::new(create_environment),
            fs_adapter: Rc::new(LocalFs),
            store: VirtualFileStore::default().shared(),
            interceptor: None,
            target_directory: Stage::default(),
            environment: Stage::default(),
            generator: Stage::default(),
            environment_errors: None,
            generator_errors: None,
            error_listeners: Vec::new(),
            workspace: None,
            temp_dir: None,
        }
    }

    pub fn with_settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.settings.namespace = namespace.into();
        self
    }

    /// Runs in `directory` instead of a fresh temporary directory.
    pub fn in_dir(mut self, directory: impl Into<PathBuf>) -> Self {
        self.settings.target_directory = Some(directory.into());
        self
    }

    /// Switches the process working directory into the target directory for the run.
    pub fn change_cwd(mut self, enabled: bool) -> Self {
        self.settings.change_cwd = enabled;
        self
    }

    pub fn with_environment_options(mut self, options: EnvironmentOptions) -> Self {
        self.settings.environment = options;
        self
    }

    pub fn with_resolve_options(mut self, options: ResolveOptions) -> Self {
        self.settings.resolve = options;
        self
    }

    pub fn throw_on_missing_answer(mut self, enabled: bool) -> Self {
        self.settings.resolve.throw_on_missing_answer = enabled;
        self
    }

    pub fn catch_run_errors(mut self, enabled: bool) -> Self {
        self.settings.catch_run_errors = enabled;
        self
    }

    pub fn commit_on_completion(mut self, enabled: bool) -> Self {
        self.settings.commit_on_completion = enabled;
        self
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(arguments.into_iter().map(Into::into));
        self
    }

    pub fn with_options<I, K, V>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        for (name, value) in options {
            self.options.insert(name.into(), value.into());
        }
        self
    }

    /// Merges mocked answers into the answer table: last write wins per key.
    ///
    /// After the generator stage resolved, the answers go straight to its interceptor, which is
    /// installed first if prompts were not mocked yet.
    pub fn with_answers(mut self, answers: impl Into<AnswerTable>) -> Self {
        self.mock_prompts = true;
        self.add_answers(AnswerSource::Table(answers.into()));
        self
    }

    /// Merges answers read from a TOML file when the generator stage resolves.
    pub fn with_answers_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.mock_prompts = true;
        self.add_answers(AnswerSource::File(path.into()));
        self
    }

    pub fn with_answer_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&crate::answers::Question, Option<Value>) -> Option<Value> + 'static,
    {
        self.answer_callback = Some(Rc::new(callback));
        self
    }

    /// Leaves the generator's own prompter in place.
    pub fn without_prompt_mocking(mut self) -> Self {
        self.mock_prompts = false;
        self.answer_sources.clear();
        self
    }

    /// Seeds files, relative to the target directory, before the generator starts. Once the
    /// generator stage resolved, seeds are written to the store right away.
    pub fn with_files<I, P, C>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<PathBuf>,
        C: Into<FileContents>,
    {
        self.add_seed(Seed::Files {
            base: None,
            files: collect_files(files),
        });
        self
    }

    /// Seeds files under `base` before the generator starts.
    pub fn with_files_in<I, P, C>(mut self, base: impl Into<PathBuf>, files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<PathBuf>,
        C: Into<FileContents>,
    {
        self.add_seed(Seed::Files {
            base: Some(base.into()),
            files: collect_files(files),
        });
        self
    }

    /// Merges `value` into the config file at the dotted `key_path`.
    pub fn with_config(mut self, key_path: impl Into<String>, value: Value) -> Self {
        self.add_seed(Seed::Config {
            key_path: key_path.into(),
            value,
        });
        self
    }

    /// Merges `value` into the generator's own section of the config file.
    pub fn with_local_config(mut self, value: Value) -> Self {
        self.add_seed(Seed::LocalConfig(value));
        self
    }

    /// Registers an extra generator in the environment during the environment stage.
    pub fn with_generator<F, G>(mut self, namespace: impl Into<String>, factory: F) -> Self
    where
        F: Fn(GeneratorBase) -> G + 'static,
        G: Generator + 'static,
    {
        self.dependencies
            .push((namespace.into(), into_factory(factory)));
        self
    }

    /// Runs against a caller-owned environment instead of creating one.
    pub fn with_environment(mut self, environment: EnvironmentHandle) -> Self {
        self.shared_environment = Some(environment);
        self
    }

    pub fn with_environment_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(EnvironmentOptions) -> EnvironmentHandle + 'static,
    {
        self.environment_factory = Rc::new(factory);
        self
    }

    pub fn with_fs_adapter(mut self, adapter: Rc<dyn FsAdapter>) -> Self {
        self.fs_adapter = adapter;
        self
    }

    pub fn on_target_directory<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Path, &RunContext) -> CallbackResult + 'static,
    {
        match self.target_directory.resolved.clone() {
            Some(directory) => {
                let outcome = callback(&directory, &self);
                self.after_late_callback(StageKind::TargetDirectory, outcome);
            }
            None if self.is_settled() => self.stage_unavailable(StageKind::TargetDirectory),
            None => self.target_directory.queue.push(Box::new(callback)),
        }
        self
    }

    pub fn on_environment<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&EnvironmentHandle, &RunContext) -> CallbackResult + 'static,
    {
        match self.environment.resolved.clone() {
            Some(environment) => {
                let outcome = callback(&environment, &self);
                self.after_late_callback(StageKind::Environment, outcome);
            }
            None if self.is_settled() => self.stage_unavailable(StageKind::Environment),
            None => self.environment.queue.push(Box::new(callback)),
        }
        self
    }

    pub fn on_generator<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&mut dyn Generator, &RunContext) -> CallbackResult + 'static,
    {
        match self.generator.resolved.take() {
            Some(mut generator) => {
                let outcome = callback(generator.as_mut(), &self);
                self.generator.resolved = Some(generator);
                self.after_late_callback(StageKind::Generator, outcome);
            }
            None if self.is_settled() => self.stage_unavailable(StageKind::Generator),
            None => self.generator.queue.push(Box::new(callback)),
        }
        self
    }

    /// Listens on the context's error channel.
    pub fn on_error<F>(mut self, listener: F) -> Self
    where
        F: FnMut(&RunError) + 'static,
    {
        self.error_listeners.push(Box::new(listener));
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn target_directory(&self) -> Option<&Path> {
        self.target_directory.resolved.as_deref()
    }

    pub fn environment(&self) -> Option<&EnvironmentHandle> {
        self.environment.resolved.as_ref()
    }

    pub fn generator(&self) -> Option<&dyn Generator> {
        self.generator.resolved.as_deref()
    }

    /// Mutable access to the run's store. Do not hold it across an `.await`.
    pub fn fs(&self) -> RefMut<'_, VirtualFileStore> {
        self.store.borrow_mut()
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn snapshot(&self) -> Snapshot {
        self.store.borrow().snapshot()
    }

    /// The answer table handed to the interceptor, once the generator stage resolved.
    pub fn answers(&self) -> &AnswerTable {
        &self.answers
    }

    pub fn asked_questions(&self) -> Vec<AskedQuestion> {
        self.interceptor
            .as_ref()
            .map(|interceptor| interceptor.asked_questions())
            .unwrap_or_default()
    }

    /// Runs the pipeline to completion.
    ///
    /// # Errors
    ///
    /// Returns the [`RunError`] that moved the context to [`RunState::Errored`], after handing
    /// it to every `on_error` listener. A second call fails with
    /// [`StageMisuseError::AlreadyStarted`].
    pub async fn run(&mut self) -> Result<RunResult, RunError> {
        if self.torn_down {
            return Err(StageMisuseError::TornDown.into());
        }
        if self.state != RunState::Building {
            return Err(StageMisuseError::AlreadyStarted.into());
        }

        self.state = RunState::Running;
        log::debug!("run started for {:?}", self.generator_ref);

        let outcome = self.drive().await;

        for watched in [self.environment_errors.take(), self.generator_errors.take()]
            .into_iter()
            .flatten()
        {
            watched.release();
        }

        match outcome {
            Ok(()) => {
                self.state = RunState::Completed;
                log::debug!("run completed");
                Ok(self.result())
            }
            Err(error) => {
                self.state = RunState::Errored;
                log::debug!("run errored: {}", error);
                self.notify(&error);
                Err(error)
            }
        }
    }

    /// Writes the store to the target directory.
    ///
    /// # Errors
    ///
    /// Fails with [`StageMisuseError::NotCompleted`] before a completed run, and with the first
    /// [`CommitError`] otherwise.
    pub async fn commit_files(&self) -> Result<usize, RunError> {
        if self.state != RunState::Completed {
            return Err(StageMisuseError::NotCompleted { state: self.state }.into());
        }

        let Some(directory) = self.target_directory.resolved.clone() else {
            return Err(StageMisuseError::StageUnavailable {
                stage: StageKind::TargetDirectory,
            }
            .into());
        };

        self.commit_to(&directory).await
    }

    /// Releases the workspace and drops the environment, the generator and any temporary
    /// target directory. Stage callbacks registered afterwards have nothing to run against.
    pub fn teardown(&mut self) -> Result<(), RunError> {
        self.torn_down = true;
        self.target_directory.resolved = None;
        self.environment.resolved = None;
        self.generator.resolved = None;
        self.interceptor = None;
        self.temp_dir = None;

        if let Some(mut workspace) = self.workspace.take() {
            workspace.release()?;
        }

        log::debug!("run context torn down");

        Ok(())
    }

    async fn drive(&mut self) -> Result<(), RunError> {
        let directory = self.resolve_target_directory()?;
        let environment = self.resolve_environment()?;
        self.resolve_generator(&directory, &environment)?;
        self.execute().await?;

        if self.settings.commit_on_completion {
            self.commit_to(&directory).await?;
        }

        Ok(())
    }

    fn resolve_target_directory(&mut self) -> Result<PathBuf, RunError> {
        let directory = match (
            self.settings.target_directory.clone(),
            self.settings.change_cwd,
        ) {
            (Some(directory), true) => self.enter(TemporaryWorkspace::acquire_in(directory)?),
            (None, true) => self.enter(TemporaryWorkspace::acquire()?),
            (Some(directory), false) => {
                std::fs::create_dir_all(&directory).map_err(|error| {
                    IoError::new(FileOperation::Mkdir, directory.clone(), error)
                })?;
                directory
            }
            (None, false) => {
                let dir = tempfile::tempdir().map_err(|error| {
                    IoError::new(FileOperation::Mkdir, std::env::temp_dir(), error)
                })?;
                let directory = dir.path().to_path_buf();
                self.temp_dir = Some(dir);
                directory
            }
        };

        log::debug!("target directory resolved: {}", directory.display());

        self.store.borrow_mut().set_root(&directory);
        self.target_directory.resolved = Some(directory.clone());

        for callback in std::mem::take(&mut self.target_directory.queue) {
            callback(&directory, self).map_err(|source| RunError::Callback {
                stage: StageKind::TargetDirectory,
                source,
            })?;
        }

        Ok(directory)
    }

    fn enter(&mut self, workspace: TemporaryWorkspace) -> PathBuf {
        let directory = workspace.path().to_path_buf();
        self.workspace = Some(workspace);
        directory
    }

    fn resolve_environment(&mut self) -> Result<EnvironmentHandle, RunError> {
        let environment = match &self.shared_environment {
            Some(environment) => Rc::clone(environment),
            None => (self.environment_factory)(self.settings.environment.clone()),
        };

        for (namespace, factory) in std::mem::take(&mut self.dependencies) {
            environment.register(&namespace, factory);
        }

        log::debug!("environment resolved");

        self.environment.resolved = Some(Rc::clone(&environment));
        self.environment_errors = Some(Watched::subscribe(
            ErrorOrigin::Environment,
            environment.errors(),
        ));

        for callback in std::mem::take(&mut self.environment.queue) {
            callback(&environment, self).map_err(|source| RunError::Callback {
                stage: StageKind::Environment,
                source,
            })?;
        }

        self.pending_errors()?;

        Ok(environment)
    }

    fn resolve_generator(
        &mut self,
        directory: &Path,
        environment: &EnvironmentHandle,
    ) -> Result<(), RunError> {
        let target = match &self.generator_ref {
            GeneratorRef::Namespace(_) => self.generator_ref.clone(),
            GeneratorRef::Factory(factory) => {
                environment.register(&self.settings.namespace, Rc::clone(factory));
                GeneratorRef::namespace(self.settings.namespace.clone())
            }
        };

        let options = InstantiateOptions {
            generator_args: self.arguments.clone(),
            generator_options: self.options.clone(),
            destination_root: directory.to_path_buf(),
            config_file: self.settings.config_file.clone(),
            store: Rc::clone(&self.store),
        };

        let mut generator = Rc::clone(environment).instantiate(&target, options)?;
        self.generator_errors = Some(Watched::subscribe(
            ErrorOrigin::Generator,
            generator.base().errors(),
        ));

        if self.mock_prompts {
            for source in std::mem::take(&mut self.answer_sources) {
                match source {
                    AnswerSource::Table(table) => self.answers.merge(table),
                    AnswerSource::File(path) => self.answers.merge(AnswerTable::from_file(path)?),
                }
            }

            let interceptor = PromptInterceptor::install(
                generator.as_ref(),
                self.answers.clone(),
                self.settings.resolve,
            );

            if let Some(callback) = &self.answer_callback {
                interceptor.set_callback(Rc::clone(callback));
            }

            self.interceptor = Some(interceptor);
        }

        let namespace = generator.base().namespace().to_string();

        for seed in std::mem::take(&mut self.seeds) {
            plant(&mut self.store.borrow_mut(), &self.settings.config_file, &namespace, seed)?;
        }

        log::debug!("generator '{}' resolved", namespace);

        for callback in std::mem::take(&mut self.generator.queue) {
            callback(generator.as_mut(), self).map_err(|source| RunError::Callback {
                stage: StageKind::Generator,
                source,
            })?;
        }

        self.pending_errors()?;
        self.generator.resolved = Some(generator);

        Ok(())
    }

    /// Fails with the first error already emitted on a watched channel.
    fn pending_errors(&mut self) -> Result<(), GeneratorExecutionError> {
        for watched in [&mut self.environment_errors, &mut self.generator_errors]
            .into_iter()
            .flatten()
        {
            watched.pending()?;
        }

        Ok(())
    }

    async fn execute(&mut self) -> Result<(), RunError> {
        let (Some(generator), Some(environment_errors), Some(generator_errors)) = (
            self.generator.resolved.take(),
            self.environment_errors.as_mut(),
            self.generator_errors.as_mut(),
        ) else {
            return Err(StageMisuseError::StageUnavailable {
                stage: StageKind::Generator,
            }
            .into());
        };

        log::debug!("running generator '{}'", generator.base().namespace());

        let running = run_generator(generator, self.settings.catch_run_errors);
        tokio::pin!(running);

        let outcome = tokio::select! {
            biased;
            Some(error) = environment_errors.errors.recv() => {
                Err(GeneratorExecutionError::new(ErrorOrigin::Environment, error))
            }
            Some(error) = generator_errors.errors.recv() => {
                Err(GeneratorExecutionError::new(ErrorOrigin::Generator, error))
            }
            finished = &mut running => finished,
        };

        // errors emitted during the generator's last poll are already queued
        let outcome = outcome.and_then(|generator| {
            environment_errors.pending()?;
            generator_errors.pending()?;
            Ok(generator)
        });

        self.generator.resolved = Some(outcome?);

        Ok(())
    }

    async fn commit_to(&self, directory: &Path) -> Result<usize, RunError> {
        // commit works on a copy so no store borrow is held across awaits
        let store = self.store.borrow().clone();

        let written = store
            .commit(directory, Rc::clone(&self.fs_adapter))
            .await?;

        log::debug!("committed {} files to {}", written, directory.display());

        Ok(written)
    }

    fn result(&self) -> RunResult {
        RunResult::new(
            self.target_directory.resolved.clone().unwrap_or_default(),
            self.generator
                .resolved
                .as_ref()
                .map(|generator| generator.base().namespace().to_string())
                .unwrap_or_else(|| self.settings.namespace.clone()),
            self.snapshot(),
            self.asked_questions(),
        )
    }

    fn add_answers(&mut self, source: AnswerSource) {
        if self.generator.resolved.is_none() {
            if self.is_settled() {
                self.stage_unavailable(StageKind::Generator);
            } else {
                self.answer_sources.push(source);
            }
            return;
        }

        let answers = match source {
            AnswerSource::Table(answers) => answers,
            AnswerSource::File(path) => match AnswerTable::from_file(path) {
                Ok(answers) => answers,
                Err(error) => return self.report(error.into()),
            },
        };

        if let Some(generator) = self.generator.resolved.as_deref() {
            let interceptor =
                PromptInterceptor::install(generator, answers.clone(), self.settings.resolve);

            if self.interceptor.is_none() {
                if let Some(callback) = &self.answer_callback {
                    interceptor.set_callback(Rc::clone(callback));
                }
                self.interceptor = Some(interceptor);
            }
        }

        self.answers.merge(answers);
    }

    fn add_seed(&mut self, seed: Seed) {
        let namespace = self
            .generator
            .resolved
            .as_ref()
            .map(|generator| generator.base().namespace().to_string());

        match namespace {
            Some(namespace) => {
                let planted = plant(
                    &mut self.store.borrow_mut(),
                    &self.settings.config_file,
                    &namespace,
                    seed,
                );

                if let Err(error) = planted {
                    self.report(error.into());
                }
            }
            None if self.is_settled() => self.stage_unavailable(StageKind::Generator),
            None => self.seeds.push(seed),
        }
    }

    fn is_settled(&self) -> bool {
        self.torn_down || matches!(self.state, RunState::Completed | RunState::Errored)
    }

    fn after_late_callback(&mut self, stage: StageKind, outcome: CallbackResult) {
        if let Err(source) = outcome {
            self.report(RunError::Callback { stage, source });
        }
    }

    fn stage_unavailable(&mut self, stage: StageKind) {
        self.report(StageMisuseError::StageUnavailable { stage }.into());
    }

    /// Hands an error raised outside `run` to the listeners.
    fn report(&mut self, error: RunError) {
        log::warn!("{}", error);
        self.notify(&error);
    }

    fn notify(&mut self, error: &RunError) {
        for listener in self.error_listeners.iter_mut() {
            listener(error);
        }
    }
}

fn collect_files<I, P, C>(files: I) -> Vec<(PathBuf, FileContents)>
where
    I: IntoIterator<Item = (P, C)>,
    P: Into<PathBuf>,
    C: Into<FileContents>,
{
    files
        .into_iter()
        .map(|(path, contents)| (path.into(), contents.into()))
        .collect()
}

fn plant(
    store: &mut VirtualFileStore,
    config_file: &str,
    namespace: &str,
    seed: Seed,
) -> Result<(), StoreError> {
    match seed {
        Seed::Files { base, files } => {
            for (path, contents) in files {
                match &base {
                    Some(base) => store.write_in(base, path, contents)?,
                    None => store.write(path, contents)?,
                };
            }
        }
        Seed::Config { key_path, value } => {
            store.write_config(config_file, &key_path, value)?;
        }
        Seed::LocalConfig(value) => {
            store.write_config(config_file, namespace, value)?;
        }
    }

    Ok(())
}

/// Runs the generator. With `catch_panics` it runs as a local task so a panic comes back as a
/// [`GeneratorError::Panicked`] instead of unwinding through the caller.
async fn run_generator(
    mut generator: Box<dyn Generator>,
    catch_panics: bool,
) -> Result<Box<dyn Generator>, GeneratorExecutionError> {
    if !catch_panics {
        let outcome = generator.run().await;

        return match outcome {
            Ok(()) => Ok(generator),
            Err(error) => Err(GeneratorExecutionError::new(ErrorOrigin::Execution, error)),
        };
    }

    let local = LocalSet::new();
    let task = local.spawn_local(async move {
        let outcome = generator.run().await;
        (generator, outcome)
    });

    match local.run_until(task).await {
        Ok((generator, Ok(()))) => Ok(generator),
        Ok((_, Err(error))) => Err(GeneratorExecutionError::new(ErrorOrigin::Execution, error)),
        Err(join_error) => {
            let message = if join_error.is_panic() {
                panic_message(join_error.into_panic())
            } else {
                join_error.to_string()
            };

            Err(GeneratorExecutionError::new(
                ErrorOrigin::Panic,
                GeneratorError::Panicked(message),
            ))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
