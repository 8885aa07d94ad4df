//! Static language registry loaded from JSON.
//!
//! ```json
//! [
//!   {
//!     "id": "cpp17",
//!     "full_name": "C++17 (GCC)",
//!     "code_filename": "main.cpp",
//!     "compile_cmd": "g++ -std=c++17 -O2 -o main main.cpp",
//!     "execute_cmd": ["./main"]
//!   }
//! ]
//! ```

use std::collections::HashSet;
use std::io;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LanguageError {
    #[error("language not found: {0}")]
    NotFound(String),
    #[error("no language uses the {0:?} extension")]
    NoExtensionMatch(String),
    #[error("multiple languages use the {extension:?} extension: {}", .ids.join(", "))]
    Ambiguous { extension: String, ids: Vec<String> },
    #[error("duplicate language id: {0}")]
    Duplicate(String),
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid language registry: {0}")]
    Json(#[from] serde_json::Error),
}

/// A command as a discrete argument vector. Accepts a JSON array of arguments
/// or a single string split on whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "CommandSpec")]
pub struct CommandLine(Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandSpec {
    Line(String),
    Args(Vec<String>),
}

impl TryFrom<CommandSpec> for CommandLine {
    type Error = String;

    fn try_from(spec: CommandSpec) -> Result<Self, Self::Error> {
        let args: Vec<String> = match spec {
            CommandSpec::Line(line) => line.split_whitespace().map(str::to_owned).collect(),
            CommandSpec::Args(args) => args,
        };
        if args.first().is_none_or(|program| program.is_empty()) {
            return Err("command must name a program".to_owned());
        }
        Ok(Self(args))
    }
}

impl CommandLine {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(args.into_iter().map(Into::into).collect())
    }

    pub fn args(&self) -> &[String] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileStep {
    None,
    Command(CommandLine),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "LanguageRecord")]
pub struct Language {
    pub id: String,
    pub full_name: String,
    pub code_filename: String,
    pub compile: CompileStep,
    pub execute: CommandLine,
    /// Extension used for detection, with its leading dot.
    pub extension: String,
    pub env_version_cmd: Option<CommandLine>,
    pub hello_world_code: Option<String>,
    /// Process limit for the execute step, for runtimes that need threads (a JVM).
    pub max_processes: Option<NonZeroU32>,
}

#[derive(Deserialize)]
struct LanguageRecord {
    id: String,
    #[serde(default)]
    full_name: Option<String>,
    code_filename: String,
    #[serde(default)]
    compile_cmd: Option<CommandLine>,
    execute_cmd: CommandLine,
    #[serde(default)]
    extension: Option<String>,
    #[serde(default)]
    env_version_cmd: Option<CommandLine>,
    #[serde(default)]
    hello_world_code: Option<String>,
    #[serde(default)]
    max_processes: Option<NonZeroU32>,
}

impl From<LanguageRecord> for Language {
    fn from(record: LanguageRecord) -> Self {
        let extension = record
            .extension
            .map(|ext| normalize_extension(&ext))
            .unwrap_or_else(|| extension_of(&record.code_filename));
        Self {
            full_name: record.full_name.unwrap_or_else(|| record.id.clone()),
            id: record.id,
            code_filename: record.code_filename,
            compile: match record.compile_cmd {
                Some(command) => CompileStep::Command(command),
                None => CompileStep::None,
            },
            execute: record.execute_cmd,
            extension,
            env_version_cmd: record.env_version_cmd,
            hello_world_code: record.hello_world_code,
            max_processes: record.max_processes,
        }
    }
}

impl Language {
    pub fn needs_compilation(&self) -> bool {
        matches!(self.compile, CompileStep::Command(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    languages: Vec<Language>,
}

impl LanguageRegistry {
    pub fn new(languages: Vec<Language>) -> Result<Self, LanguageError> {
        let mut seen = HashSet::new();
        for language in &languages {
            if !seen.insert(language.id.as_str()) {
                return Err(LanguageError::Duplicate(language.id.clone()));
            }
        }
        Ok(Self { languages })
    }

    pub fn from_path(path: &Path) -> Result<Self, LanguageError> {
        let json = std::fs::read_to_string(path).map_err(|source| LanguageError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self, LanguageError> {
        Self::new(serde_json::from_str(json)?)
    }

    pub fn languages(&self) -> &[Language] {
        &self.languages
    }

    pub fn get(&self, id: &str) -> Result<&Language, LanguageError> {
        self.languages
            .iter()
            .find(|language| language.id == id)
            .ok_or_else(|| LanguageError::NotFound(id.to_owned()))
    }

    /// Exact extension match; `cpp` and `.cpp` are equivalent.
    pub fn find_by_extension(&self, extension: &str) -> Result<&Language, LanguageError> {
        let extension = normalize_extension(extension);
        let matches: Vec<&Language> = self
            .languages
            .iter()
            .filter(|language| language.extension == extension)
            .collect();
        debug!(extension = %extension, count = matches.len(), "found languages");
        match matches.as_slice() {
            [] => Err(LanguageError::NoExtensionMatch(extension)),
            [language] => Ok(language),
            many => Err(LanguageError::Ambiguous {
                extension,
                ids: many.iter().map(|language| language.id.clone()).collect(),
            }),
        }
    }

    /// Language for a source file: by id when given, otherwise by the file's extension.
    pub fn resolve(&self, id: Option<&str>, filename: &Path) -> Result<&Language, LanguageError> {
        match id {
            Some(id) => self.get(id),
            None => self.find_by_extension(&extension_of(&filename.to_string_lossy())),
        }
    }
}

fn normalize_extension(extension: &str) -> String {
    if extension.is_empty() || extension.starts_with('.') {
        extension.to_owned()
    } else {
        format!(".{extension}")
    }
}

fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}
