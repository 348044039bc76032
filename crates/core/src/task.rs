//! Task definitions: extension-scoped external command templates.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub const PLACEHOLDER_SRC_FOLDER: &str = "src_folder";
pub const PLACEHOLDER_DST_FOLDER: &str = "dst_folder";
pub const PLACEHOLDER_NAME: &str = "name";
pub const PLACEHOLDER_EXTENSION: &str = "extension";

const KNOWN_PLACEHOLDERS: [&str; 4] = [
    PLACEHOLDER_SRC_FOLDER,
    PLACEHOLDER_DST_FOLDER,
    PLACEHOLDER_NAME,
    PLACEHOLDER_EXTENSION,
];

/// Lowercase and strip the leading dot: `".HEIC"` becomes `"heic"`.
pub fn normalize_extension(extension: &str) -> String {
    extension.trim().trim_start_matches('.').to_ascii_lowercase()
}

pub fn is_valid_extension(extension: &str) -> bool {
    !extension.is_empty() && extension.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Extension of a file name, normalized. Empty when there is none.
pub fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(normalize_extension)
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    source: String,
    segments: Vec<Segment>,
}

/// Values substituted into a [`CommandTemplate`] for one attempt.
#[derive(Debug, Clone)]
pub struct CommandValues<'a> {
    pub src_folder: &'a Path,
    pub dst_folder: &'a Path,
    pub name: &'a str,
    pub extension: &'a str,
}

impl CommandTemplate {
    pub fn compile(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source;

        while let Some(open) = rest.find("{{") {
            literal.push_str(&rest[..open]);
            let after_open = &rest[open + 2..];
            let Some(close) = after_open.find("}}") else {
                bail!("unclosed '{{{{' in command template");
            };

            let token = after_open[..close].trim();
            let key = token.strip_prefix('.').unwrap_or(token).trim();
            let Some(known) = KNOWN_PLACEHOLDERS.iter().find(|candidate| **candidate == key)
            else {
                bail!(
                    "unknown placeholder '{{{{{token}}}}}', expected one of: {}",
                    KNOWN_PLACEHOLDERS
                        .iter()
                        .map(|k| format!("{{{{.{k}}}}}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            };

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Placeholder(known));
            rest = &after_open[close + 2..];
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// An empty command accepts the file unchanged.
    pub fn is_empty(&self) -> bool {
        self.source.trim().is_empty()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, values: &CommandValues<'_>) -> Result<String> {
        let mut rendered = String::with_capacity(self.source.len() + 64);

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => rendered.push_str(text),
                Segment::Placeholder(key) => {
                    let value = match *key {
                        PLACEHOLDER_SRC_FOLDER => path_value(values.src_folder)?,
                        PLACEHOLDER_DST_FOLDER => path_value(values.dst_folder)?,
                        PLACEHOLDER_NAME => values.name,
                        _ => values.extension,
                    };
                    check_interpolated_value(key, value)?;
                    rendered.push_str(value);
                }
            }
        }

        Ok(rendered)
    }
}

fn path_value(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("path is not valid UTF-8: {}", path.display()))
}

/// Values end up inside a `sh -c` line, so only a conservative character set
/// is allowed and parent-directory components are rejected.
fn check_interpolated_value(key: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        bail!("placeholder '{key}' rendered to an empty value");
    }

    if let Some(bad) = value
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '/' | '.' | '_' | '-' | '+')))
    {
        bail!("placeholder '{key}' value {value:?} contains unsafe character {bad:?}");
    }

    if Path::new(value)
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        bail!("placeholder '{key}' value {value:?} contains a parent directory component");
    }

    Ok(())
}

#[derive(Debug, Clone)]
pub struct TaskDefinition {
    name: String,
    extensions: Vec<String>,
    command: CommandTemplate,
}

impl TaskDefinition {
    pub fn new(name: &str, extensions: &[&str], command: &str) -> Result<Self> {
        RawTask {
            name: name.to_string(),
            extensions: extensions.iter().map(ToString::to_string).collect(),
            command: command.to_string(),
        }
        .into_definition()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn command(&self) -> &CommandTemplate {
        &self.command
    }

    /// `extension` must already be normalized.
    pub fn matches(&self, extension: &str) -> bool {
        self.extensions.iter().any(|ext| ext == extension)
    }
}

impl fmt::Display for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.extensions.join(", "))
    }
}

#[derive(Debug, Deserialize)]
struct RawTaskFile {
    #[serde(default)]
    tasks: Vec<RawTask>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    name: String,
    #[serde(default)]
    extensions: Vec<String>,
    #[serde(default)]
    command: String,
}

impl RawTask {
    fn into_definition(self) -> Result<TaskDefinition> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            bail!("task name must not be empty");
        }
        if self.extensions.is_empty() {
            bail!("task {name} has no extensions");
        }

        let mut extensions = Vec::with_capacity(self.extensions.len());
        for raw in &self.extensions {
            let ext = normalize_extension(raw);
            if !is_valid_extension(&ext) {
                bail!("task {name} has invalid extension {raw:?}");
            }
            if !extensions.contains(&ext) {
                extensions.push(ext);
            }
        }

        let command = CommandTemplate::compile(&self.command)
            .with_context(|| format!("task {name} unable to parse command"))?;

        Ok(TaskDefinition {
            name,
            extensions,
            command,
        })
    }
}

/// The ordered task chain plus the directory commands run in.
#[derive(Debug, Clone)]
pub struct TaskList {
    tasks: Vec<TaskDefinition>,
    base_dir: PathBuf,
}

impl TaskList {
    pub fn new(tasks: Vec<TaskDefinition>, base_dir: PathBuf) -> Result<Self> {
        let mut seen = HashSet::new();
        for task in &tasks {
            if !seen.insert(task.name()) {
                bail!("duplicate task name: {}", task.name());
            }
        }
        Ok(Self { tasks, base_dir })
    }

    /// Reads a YAML task file, or TOML when the file ends in `.toml`.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read task file: {}", path.display()))?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let parsed: RawTaskFile = if is_toml {
            toml::from_str(&raw)
                .with_context(|| format!("failed to parse task TOML: {}", path.display()))?
        } else {
            serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse task YAML: {}", path.display()))?
        };

        let tasks = parsed
            .tasks
            .into_iter()
            .map(RawTask::into_definition)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("error validating task file: {}", path.display()))?;

        let base_dir = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf())
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Self::new(tasks, base_dir)
    }

    pub fn tasks(&self) -> &[TaskDefinition] {
        &self.tasks
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Fallback chain for `extension`, in configuration order.
    pub fn matching<'a>(&'a self, extension: &'a str) -> impl Iterator<Item = &'a TaskDefinition> {
        self.tasks.iter().filter(move |task| task.matches(extension))
    }

    pub fn handles_extension(&self, extension: &str) -> bool {
        let normalized = normalize_extension(extension);
        let found = self.matching(&normalized).next().is_some();
        found
    }
}
