use std::{cell::RefCell, fmt, rc::Rc};

use indexmap::IndexMap;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    channel::ErrorChannel,
    generator::{Generator, GeneratorBase, GeneratorFactory, GeneratorRef, InstantiateOptions},
};

/// Namespace given to generators instantiated straight from a factory.
pub const ANONYMOUS_NAMESPACE: &str = "kopye:anonymous";

#[derive(Debug, Error, Diagnostic)]
pub enum EnvironmentError {
    #[error("no generator registered under '{namespace}'")]
    #[diagnostic(
        code(kopye_test::environment::generator_not_found),
        help("Registered namespaces: {registered}")
    )]
    GeneratorNotFound {
        namespace: String,
        registered: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SharedOptions {
    pub local_config_only: bool,
}
impl Default for SharedOptions {
    fn default() -> Self {
        Self {
            local_config_only: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EnvironmentOptions {
    pub new_error_handler: bool,
    pub shared_options: SharedOptions,
}
impl Default for EnvironmentOptions {
    fn default() -> Self {
        Self {
            new_error_handler: true,
            shared_options: SharedOptions::default(),
        }
    }
}

pub type EnvironmentHandle = Rc<dyn Environment>;

/// Builds the environment of a run when the caller did not supply one.
pub type EnvironmentFactory = Rc<dyn Fn(EnvironmentOptions) -> EnvironmentHandle>;

/// Registry and instantiation point for generators.
pub trait Environment {
    fn options(&self) -> &EnvironmentOptions;

    fn register(&self, namespace: &str, factory: GeneratorFactory);

    fn is_registered(&self, namespace: &str) -> bool;

    fn instantiate(
        self: Rc<Self>,
        generator: &GeneratorRef,
        options: InstantiateOptions,
    ) -> Result<Box<dyn Generator>, EnvironmentError>;

    fn errors(&self) -> &ErrorChannel;
}

/// An in-memory environment: a namespace registry and an error channel.
pub struct MemoryEnvironment {
    options: EnvironmentOptions,
    registry: RefCell<IndexMap<String, GeneratorFactory>>,
    errors: ErrorChannel,
}

impl fmt::Debug for MemoryEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEnvironment")
            .field("options", &self.options)
            .field("registered", &self.namespaces())
            .finish()
    }
}

impl MemoryEnvironment {
    pub fn new(options: EnvironmentOptions) -> Self {
        Self {
            options,
            registry: RefCell::new(IndexMap::new()),
            errors: ErrorChannel::new(),
        }
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.registry.borrow().keys().cloned().collect()
    }

    /// Shared options become generator options the caller did not set explicitly.
    fn apply_shared_options(&self, options: &mut IndexMap<String, Value>) {
        options
            .entry("local_config_only".to_string())
            .or_insert(Value::Bool(self.options.shared_options.local_config_only));
    }
}

impl Environment for MemoryEnvironment {
    fn options(&self) -> &EnvironmentOptions {
        &self.options
    }

    fn register(&self, namespace: &str, factory: GeneratorFactory) {
        log::debug!("registering generator '{}'", namespace);

        self.registry
            .borrow_mut()
            .insert(namespace.to_string(), factory);
    }

    fn is_registered(&self, namespace: &str) -> bool {
        self.registry.borrow().contains_key(namespace)
    }

    fn instantiate(
        self: Rc<Self>,
        generator: &GeneratorRef,
        mut options: InstantiateOptions,
    ) -> Result<Box<dyn Generator>, EnvironmentError> {
        let (namespace, factory) = match generator {
            GeneratorRef::Namespace(namespace) => {
                let factory = self.registry.borrow().get(namespace).cloned();

                let Some(factory) = factory else {
                    return Err(EnvironmentError::GeneratorNotFound {
                        namespace: namespace.clone(),
                        registered: self.namespaces().join(", "),
                    });
                };

                (namespace.clone(), factory)
            }
            GeneratorRef::Factory(factory) => (ANONYMOUS_NAMESPACE.to_string(), Rc::clone(factory)),
        };

        self.apply_shared_options(&mut options.generator_options);

        log::debug!("instantiating generator '{}'", namespace);

        let environment: Rc<dyn Environment> = self;
        let base = GeneratorBase::new(namespace, environment, options);

        Ok(factory(base))
    }

    fn errors(&self) -> &ErrorChannel {
        &self.errors
    }
}

/// The default environment factory.
pub fn create_environment(options: EnvironmentOptions) -> EnvironmentHandle {
    Rc::new(MemoryEnvironment::new(options))
}
