#![allow(dead_code)]

use std::{cell::RefCell, path::PathBuf, rc::Rc};

use async_trait::async_trait;
use kopye_test::{
    template::{copy_template_dir, write_template},
    Generator, GeneratorBase, GeneratorError, Question, RunError,
};
use serde_json::{json, Value};

/// Prompts for a project name, a test flag and a license, then writes a README and saves the
/// name into its local config.
pub struct AppGenerator {
    base: GeneratorBase,
}
impl AppGenerator {
    pub fn new(base: GeneratorBase) -> Self {
        Self { base }
    }
}

#[async_trait(?Send)]
impl Generator for AppGenerator {
    fn base(&self) -> &GeneratorBase {
        &self.base
    }

    async fn run(&mut self) -> Result<(), GeneratorError> {
        let answers = self
            .base
            .prompt([
                Question::input("name")
                    .with_message("Project name")
                    .with_default("app"),
                Question::confirm("tests").with_default(false),
                Question::list("license", ["MIT", "Apache-2.0"]).with_default("MIT"),
            ])
            .await?;

        let name = answers
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("app")
            .to_string();
        let license = answers
            .get("license")
            .and_then(Value::as_str)
            .unwrap_or("MIT")
            .to_string();

        self.base
            .fs()
            .write("README.md", format!("# {}\n\nLicensed under {}.\n", name, license))?;

        if answers.get("tests") == Some(&Value::Bool(true)) {
            self.base.fs().write("tests/smoke.txt", "ok\n")?;
        }

        self.base.save_local_config(json!({ "name": name }))?;

        Ok(())
    }
}

/// Asks one question that has no default.
pub struct StrictGenerator {
    base: GeneratorBase,
}
impl StrictGenerator {
    pub fn new(base: GeneratorBase) -> Self {
        Self { base }
    }
}

#[async_trait(?Send)]
impl Generator for StrictGenerator {
    fn base(&self) -> &GeneratorBase {
        &self.base
    }

    async fn run(&mut self) -> Result<(), GeneratorError> {
        self.base.prompt(Question::input("owner")).await?;

        Ok(())
    }
}

/// Renders a template directory from disk into the store.
pub struct TemplateGenerator {
    base: GeneratorBase,
    templates: PathBuf,
}
impl TemplateGenerator {
    pub fn factory(templates: PathBuf) -> impl Fn(GeneratorBase) -> TemplateGenerator {
        move |base| TemplateGenerator {
            base,
            templates: templates.clone(),
        }
    }
}

#[async_trait(?Send)]
impl Generator for TemplateGenerator {
    fn base(&self) -> &GeneratorBase {
        &self.base
    }

    async fn run(&mut self) -> Result<(), GeneratorError> {
        let answers = self
            .base
            .prompt(Question::input("name").with_default("app"))
            .await?;
        let context = answers.to_value();

        copy_template_dir(&mut self.base.fs(), &self.templates, "", &context)?;
        write_template(&mut self.base.fs(), "NOTES.md", "notes for {{ name }}", &context)?;

        Ok(())
    }
}

/// How [`FailingGenerator`] fails.
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    EnvironmentChannel,
    GeneratorChannel,
    Returned,
    Panic,
}

pub struct FailingGenerator {
    base: GeneratorBase,
    failure: Failure,
}
impl FailingGenerator {
    pub fn factory(failure: Failure) -> impl Fn(GeneratorBase) -> FailingGenerator {
        move |base| FailingGenerator { base, failure }
    }
}

#[async_trait(?Send)]
impl Generator for FailingGenerator {
    fn base(&self) -> &GeneratorBase {
        &self.base
    }

    async fn run(&mut self) -> Result<(), GeneratorError> {
        self.base.fs().write("partial.txt", "started\n")?;

        match self.failure {
            Failure::EnvironmentChannel => {
                self.base
                    .environment()
                    .errors()
                    .emit(GeneratorError::msg("environment exploded"));
            }
            Failure::GeneratorChannel => {
                self.base
                    .errors()
                    .emit(GeneratorError::msg("generator exploded"));
            }
            Failure::Returned => return Err(GeneratorError::msg("run failed")),
            Failure::Panic => panic!("generator panicked on purpose"),
        }

        // keep running after the emit, the context must still stop at the first error
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        Ok(())
    }
}

/// Writes one file named after its first argument.
pub struct ArgumentsGenerator {
    base: GeneratorBase,
}
impl ArgumentsGenerator {
    pub fn new(base: GeneratorBase) -> Self {
        Self { base }
    }
}

#[async_trait(?Send)]
impl Generator for ArgumentsGenerator {
    fn base(&self) -> &GeneratorBase {
        &self.base
    }

    async fn run(&mut self) -> Result<(), GeneratorError> {
        let name = self
            .base
            .arguments()
            .first()
            .cloned()
            .ok_or_else(|| GeneratorError::msg("missing name argument"))?;
        let options = Value::Object(self.base.options().clone().into_iter().collect());

        self.base
            .fs()
            .write_json(format!("{}.json", name), &options)?;

        Ok(())
    }
}

/// Collects every error a context reports to its `on_error` listeners.
#[derive(Debug, Clone, Default)]
pub struct ErrorLog(Rc<RefCell<Vec<String>>>);
impl ErrorLog {
    pub fn listener(&self) -> impl FnMut(&RunError) + 'static {
        let log = Rc::clone(&self.0);
        move |error| log.borrow_mut().push(error.to_string())
    }

    pub fn messages(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}

/// Records stage callback invocations in order.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Rc<RefCell<Vec<&'static str>>>);
impl CallLog {
    pub fn record(&self, label: &'static str) {
        self.0.borrow_mut().push(label);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.0.borrow().clone()
    }
}
