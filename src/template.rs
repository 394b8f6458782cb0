use std::path::{Path, PathBuf};

use miette::Diagnostic;
use serde_json::Value;
use tera::{Context, Tera};
use thiserror::Error;
use walkdir::WalkDir;

use crate::{
    errors::{FileOperation, IoError},
    vfs::{StoreError, VirtualFileStore},
};

#[derive(Debug, Error, Diagnostic)]
pub enum TemplateError {
    #[error("I/O error within template domain")]
    #[diagnostic(code(kopye_test::template::io))]
    Io(#[from] IoError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error("template context must be a JSON object")]
    #[diagnostic(
        code(kopye_test::template::invalid_context),
        help("Pass answers as an object, e.g. `json!({{ \"name\": \"demo\" }})`")
    )]
    InvalidContext {
        #[source]
        source: tera::Error,
    },

    #[error("Error occurred attempting to render template '{name}'")]
    #[diagnostic(code(kopye_test::template::render))]
    Render {
        name: String,
        #[source]
        source: tera::Error,
    },

    #[error("unable to strip prefix from directory")]
    #[diagnostic(code(kopye_test::template::strip_prefix))]
    StripPrefix {
        path: PathBuf,
        dir: PathBuf,
        source: std::path::StripPrefixError,
    },
}

const TERA_FILE_EXTENSION: &str = "tera";

fn make_tera_context(context: &Value) -> Result<Context, TemplateError> {
    Context::from_value(context.clone()).map_err(|error| TemplateError::InvalidContext { source: error })
}

fn render(tera: &mut Tera, name: &str, template: &str, ctx: &Context) -> Result<String, TemplateError> {
    tera.render_str(template, ctx)
        .map_err(|error| TemplateError::Render {
            name: name.to_string(),
            source: error,
        })
}

/// Renders every path segment as a template. Returns `None` when any segment renders empty,
/// which is how a template directory makes a file or folder conditional.
///
/// For example, with `tests=false` the path
/// `{% if tests %}tests{% endif %}/{{project}}.rs` yields `None`.
fn render_path_segments(
    path: &Path,
    tera: &mut Tera,
    ctx: &Context,
) -> Result<Option<PathBuf>, TemplateError> {
    let mut result = PathBuf::new();

    for component in path.components() {
        let segment_str = component.as_os_str().to_string_lossy();

        let rendered = render(tera, &path.display().to_string(), &segment_str, ctx)?;

        if rendered.trim().is_empty() {
            return Ok(None);
        }

        result.push(rendered.trim());
    }

    Ok(Some(result))
}

/// Renders `template` with `context` and writes the result at `path` in the store.
pub fn write_template(
    store: &mut VirtualFileStore,
    path: impl AsRef<Path>,
    template: &str,
    context: &Value,
) -> Result<String, TemplateError> {
    let path = path.as_ref();
    let ctx = make_tera_context(context)?;
    let mut tera = Tera::default();

    let rendered = render(&mut tera, &path.display().to_string(), template, &ctx)?;

    Ok(store.write(path, rendered)?)
}

/// Copies a template directory from disk into the store under `destination`.
///
/// Path segments are rendered as templates (an empty segment skips the entry), files ending in
/// `.tera` are rendered and lose the extension, every other file is copied verbatim. Returns the
/// store keys written, in walk order.
pub fn copy_template_dir(
    store: &mut VirtualFileStore,
    source_directory: &Path,
    destination: impl AsRef<Path>,
    context: &Value,
) -> Result<Vec<String>, TemplateError> {
    let destination = destination.as_ref();
    let ctx = make_tera_context(context)?;
    let mut tera = Tera::default();
    let mut written = Vec::new();

    for entry in WalkDir::new(source_directory).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(error) => {
                let path = error.path().unwrap_or_else(|| Path::new("")).to_path_buf();

                Err(IoError::new(FileOperation::Read, path, error.into()))?
            }
        };

        if entry.file_type().is_dir() {
            continue;
        }

        let full_path = entry.path();
        let relative = full_path
            .strip_prefix(source_directory)
            .map_err(|error| TemplateError::StripPrefix {
                path: full_path.to_path_buf(),
                dir: source_directory.to_path_buf(),
                source: error,
            })?;

        let Some(rendered_path) = render_path_segments(relative, &mut tera, &ctx)? else {
            log::debug!("skipping {}: a path segment rendered empty", relative.display());
            continue;
        };

        let mut file_contents = std::fs::read_to_string(full_path)
            .map_err(|error| IoError::new(FileOperation::Read, full_path.to_path_buf(), error))?;

        let mut final_dest = rendered_path.clone();

        let is_tera = rendered_path
            .extension()
            .map(|ext| ext == TERA_FILE_EXTENSION)
            .unwrap_or(false);

        if is_tera {
            let file_stem = final_dest.file_stem().unwrap_or_default().to_owned();
            final_dest.set_file_name(file_stem);

            file_contents = render(
                &mut tera,
                &relative.display().to_string(),
                &file_contents,
                &ctx,
            )?;
        }

        written.push(store.write(destination.join(final_dest), file_contents)?);
    }

    Ok(written)
}
