use std::path::Path;

use crate::{
    context::RunContext,
    generator::{Generator, GeneratorBase, GeneratorRef},
    settings::{RunSettings, SettingsError},
};

/// Prepares a run of the generator `factory` builds.
///
/// The factory is registered under the run's namespace (`kopye:test` unless changed with
/// [`RunContext::with_namespace`]) when the environment stage resolves.
pub fn run_generator<F, G>(factory: F) -> RunContext
where
    F: Fn(GeneratorBase) -> G + 'static,
    G: Generator + 'static,
{
    RunContext::new(GeneratorRef::factory(factory))
}

/// Prepares a run of a generator registered in the environment under `namespace`.
///
/// Register it with [`RunContext::with_generator`], or bring an environment that already knows
/// it with [`RunContext::with_environment`].
pub fn run_registered(namespace: &str) -> RunContext {
    RunContext::new(GeneratorRef::namespace(namespace))
}

/// Prepares a run configured from a TOML settings file.
///
/// # Errors
///
/// Returns a [`SettingsError`] if the file cannot be read or is not valid settings TOML.
pub fn run_with_settings_file(
    generator: impl Into<GeneratorRef>,
    settings: impl AsRef<Path>,
) -> Result<RunContext, SettingsError> {
    let settings = RunSettings::from_file(settings)?;

    log::debug!("loaded run settings: {:?}", settings);

    Ok(RunContext::new(generator).with_settings(settings))
}
