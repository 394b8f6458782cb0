use std::path::{Path, PathBuf};

use predicates::Predicate;
use serde_json::Value;

use crate::{
    prompt::AskedQuestion,
    utils::{normalize_path, path_to_key},
    vfs::Snapshot,
};

/// What a completed run left behind: the store snapshot and the questions the generator asked.
///
/// The `assert_*` helpers panic with a readable message, so they read like `assert!` in tests.
#[derive(Debug, Clone)]
pub struct RunResult {
    target_directory: PathBuf,
    namespace: String,
    snapshot: Snapshot,
    asked_questions: Vec<AskedQuestion>,
}

impl RunResult {
    pub fn new(
        target_directory: PathBuf,
        namespace: String,
        snapshot: Snapshot,
        asked_questions: Vec<AskedQuestion>,
    ) -> Self {
        Self {
            target_directory,
            namespace,
            snapshot,
            asked_questions,
        }
    }

    pub fn target_directory(&self) -> &Path {
        &self.target_directory
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn asked_questions(&self) -> &[AskedQuestion] {
        &self.asked_questions
    }

    /// The answer given the last time `name` was asked.
    pub fn answer(&self, name: &str) -> Option<&Value> {
        self.asked_questions
            .iter()
            .rev()
            .find(|asked| asked.name == name)
            .and_then(|asked| asked.answer.as_ref())
    }

    /// Contents of the file at `path`, or `None` when missing or deleted.
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<&str> {
        self.snapshot.contents(&self.key(path))
    }

    /// # Panics
    ///
    /// When the store holds no contents at `path`.
    pub fn assert_file(&self, path: impl AsRef<Path>) {
        let key = self.key(path);

        if self.snapshot.contents(&key).is_none() {
            panic!(
                "expected file '{}' to exist, store holds: [{}]",
                key,
                self.listing()
            );
        }
    }

    /// # Panics
    ///
    /// When the store holds contents at `path`.
    pub fn assert_no_file(&self, path: impl AsRef<Path>) {
        let key = self.key(path);

        if self.snapshot.contents(&key).is_some() {
            panic!("expected file '{}' to be absent", key);
        }
    }

    /// # Panics
    ///
    /// When the file is missing or its contents fail `predicate`.
    pub fn assert_file_content<P>(&self, path: impl AsRef<Path>, predicate: P)
    where
        P: Predicate<str>,
    {
        let key = self.key(path);

        let Some(contents) = self.snapshot.contents(&key) else {
            panic!("expected file '{}' to exist", key);
        };

        if !predicate.eval(contents) {
            panic!(
                "contents of '{}' do not satisfy `{}`:\n{}",
                key, predicate, contents
            );
        }
    }

    /// # Panics
    ///
    /// When the file is missing or does not contain `needle`.
    pub fn assert_file_contains(&self, path: impl AsRef<Path>, needle: &str) {
        self.assert_file_content(path, predicates::str::contains(needle));
    }

    /// Checks that the JSON file at `path` contains `expected`: objects match by subset, any
    /// other value must be equal.
    ///
    /// # Panics
    ///
    /// When the file is missing, is not JSON, or does not contain `expected`.
    pub fn assert_json_file_content(&self, path: impl AsRef<Path>, expected: &Value) {
        let key = self.key(path);

        let Some(contents) = self.snapshot.contents(&key) else {
            panic!("expected JSON file '{}' to exist", key);
        };

        let actual: Value = match serde_json::from_str(contents) {
            Ok(actual) => actual,
            Err(error) => panic!("'{}' is not valid JSON: {}", key, error),
        };

        if !json_contains(&actual, expected) {
            panic!(
                "'{}' does not contain {}\nactual: {}",
                key, expected, actual
            );
        }
    }

    /// Prints every file with its contents.
    pub fn dump_files(&self) {
        for (key, entry) in &self.snapshot.0 {
            match &entry.contents {
                Some(contents) => println!("{}\n{}\n", key, contents),
                None => println!("{} (deleted)\n", key),
            }
        }
    }

    pub fn print_tree(&self) {
        let root_name = self
            .target_directory
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string());

        crate::preview::print_tree(&self.snapshot, &root_name);
    }

    fn key(&self, path: impl AsRef<Path>) -> String {
        let path = path.as_ref();
        let relative = path.strip_prefix(&self.target_directory).unwrap_or(path);

        path_to_key(&normalize_path(relative))
    }

    fn listing(&self) -> String {
        self.snapshot.keys().collect::<Vec<_>>().join(", ")
    }
}

fn json_contains(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(actual), Value::Object(expected)) => {
            expected.iter().all(|(key, expected)| {
                actual
                    .get(key)
                    .is_some_and(|actual| json_contains(actual, expected))
            })
        }
        _ => actual == expected,
    }
}
