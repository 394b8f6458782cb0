use std::{
    cell::{RefCell, RefMut},
    fmt,
    path::{Path, PathBuf},
    rc::Rc,
};

use async_trait::async_trait;
use indexmap::IndexMap;
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

use crate::{
    answers::{Questions, ResolvedAnswers},
    channel::ErrorChannel,
    environment::EnvironmentHandle,
    prompt::{PromptError, PromptInterceptor, Prompter, TerminalPrompter},
    template::TemplateError,
    vfs::{SharedStore, StoreError, VirtualFileStore},
};

/// Anything a generator can fail with, whether returned from `run` or emitted on a channel.
#[derive(Debug, Error, Diagnostic)]
pub enum GeneratorError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Prompt(#[from] PromptError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Template(#[from] TemplateError),

    #[error("{0}")]
    #[diagnostic(code(kopye_test::generator::message))]
    Message(String),

    #[error("generator panicked: {0}")]
    #[diagnostic(
        code(kopye_test::generator::panicked),
        help("Set `catch_run_errors = false` to let the panic reach the test")
    )]
    Panicked(String),
}
impl GeneratorError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// Builds a generator around the base the environment prepared for it.
pub type GeneratorFactory = Rc<dyn Fn(GeneratorBase) -> Box<dyn Generator>>;

/// What to run: a namespace registered in the environment, or a factory.
#[derive(Clone)]
pub enum GeneratorRef {
    Namespace(String),
    Factory(GeneratorFactory),
}
impl GeneratorRef {
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self::Namespace(namespace.into())
    }

    pub fn factory<F, G>(factory: F) -> Self
    where
        F: Fn(GeneratorBase) -> G + 'static,
        G: Generator + 'static,
    {
        Self::Factory(into_factory(factory))
    }
}
impl fmt::Debug for GeneratorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespace(namespace) => f.debug_tuple("Namespace").field(namespace).finish(),
            Self::Factory(_) => f.write_str("Factory(..)"),
        }
    }
}
impl From<&str> for GeneratorRef {
    fn from(namespace: &str) -> Self {
        Self::namespace(namespace)
    }
}

/// Boxes a typed constructor into a [`GeneratorFactory`].
pub fn into_factory<F, G>(factory: F) -> GeneratorFactory
where
    F: Fn(GeneratorBase) -> G + 'static,
    G: Generator + 'static,
{
    Rc::new(move |base| Box::new(factory(base)) as Box<dyn Generator>)
}

/// What an environment needs to instantiate a generator for one run.
#[derive(Debug, Clone)]
pub struct InstantiateOptions {
    pub generator_args: Vec<String>,
    pub generator_options: IndexMap<String, Value>,
    pub destination_root: PathBuf,
    pub config_file: String,
    pub store: SharedStore,
}
impl InstantiateOptions {
    pub fn new(destination_root: impl Into<PathBuf>, store: SharedStore) -> Self {
        Self {
            generator_args: Vec::new(),
            generator_options: IndexMap::new(),
            destination_root: destination_root.into(),
            config_file: crate::settings::DEFAULT_CONFIG_FILE.to_string(),
            store,
        }
    }
}

/// The capability set every generator carries: prompting, an error channel, its environment
/// and the store it writes into.
pub struct GeneratorBase {
    namespace: String,
    arguments: Vec<String>,
    options: IndexMap<String, Value>,
    destination_root: PathBuf,
    config_file: String,
    store: SharedStore,
    environment: EnvironmentHandle,
    errors: ErrorChannel,
    prompter: RefCell<Rc<dyn Prompter>>,
    interceptor: RefCell<Option<Rc<PromptInterceptor>>>,
}

impl fmt::Debug for GeneratorBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorBase")
            .field("namespace", &self.namespace)
            .field("arguments", &self.arguments)
            .field("options", &self.options)
            .field("destination_root", &self.destination_root)
            .field("intercepted", &self.interceptor.borrow().is_some())
            .finish()
    }
}

impl GeneratorBase {
    pub fn new(
        namespace: impl Into<String>,
        environment: EnvironmentHandle,
        options: InstantiateOptions,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            arguments: options.generator_args,
            options: options.generator_options,
            destination_root: options.destination_root,
            config_file: options.config_file,
            store: options.store,
            environment,
            errors: ErrorChannel::new(),
            prompter: RefCell::new(Rc::new(TerminalPrompter)),
            interceptor: RefCell::new(None),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn options(&self) -> &IndexMap<String, Value> {
        &self.options
    }

    pub fn option(&self, name: &str) -> Option<&Value> {
        self.options.get(name)
    }

    pub fn destination_root(&self) -> &Path {
        &self.destination_root
    }

    pub fn destination_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.destination_root.join(relative)
    }

    pub fn environment(&self) -> &EnvironmentHandle {
        &self.environment
    }

    pub fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Mutable access to the store. Do not hold it across an `.await`.
    pub fn fs(&self) -> RefMut<'_, VirtualFileStore> {
        self.store.borrow_mut()
    }

    /// Asks one question or an ordered batch through the current prompter.
    pub async fn prompt(
        &self,
        questions: impl Into<Questions>,
    ) -> Result<ResolvedAnswers, PromptError> {
        let questions = questions.into();
        let prompter = self.prompter.borrow().clone();

        prompter.prompt(&questions).await
    }

    pub fn set_prompter(&self, prompter: Rc<dyn Prompter>) {
        *self.prompter.borrow_mut() = prompter;
    }

    pub fn interceptor(&self) -> Option<Rc<PromptInterceptor>> {
        self.interceptor.borrow().clone()
    }

    pub(crate) fn set_interceptor(&self, interceptor: Rc<PromptInterceptor>) {
        self.set_prompter(Rc::clone(&interceptor) as Rc<dyn Prompter>);
        *self.interceptor.borrow_mut() = Some(interceptor);
    }

    /// This generator's section of the local config file, `{}` when absent.
    pub fn local_config(&self) -> Result<Value, StoreError> {
        let document = self.store.borrow().read_json(&self.config_file)?;

        Ok(document
            .and_then(|mut document| document.get_mut(&self.namespace).map(Value::take))
            .unwrap_or_else(|| Value::Object(serde_json::Map::new())))
    }

    /// Merges `partial` into this generator's section of the local config file.
    pub fn save_local_config(&self, partial: Value) -> Result<(), StoreError> {
        let config_file = self.config_file.clone();

        self.store
            .borrow_mut()
            .write_config(config_file, &self.namespace, partial)?;

        Ok(())
    }
}

/// A generator the harness can drive.
#[async_trait(?Send)]
pub trait Generator {
    fn base(&self) -> &GeneratorBase;

    async fn run(&mut self) -> Result<(), GeneratorError>;
}
