//! Ordered, fallback-capable execution of task commands against isolated
//! temporary workspaces.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gate::ConcurrencyGate;
use crate::task::{extension_of, normalize_extension, CommandValues, TaskDefinition, TaskList};

const WORK_DIR_PREFIX: &str = "upload-optimizer";

/// The original file handed to the pipeline.
#[derive(Debug, Clone)]
pub struct SourceFile {
    filename: String,
    extension: String,
    size: u64,
    path: PathBuf,
}

impl SourceFile {
    pub fn new(filename: impl Into<String>, path: impl Into<PathBuf>, size: u64) -> Self {
        let filename = filename.into();
        Self {
            extension: extension_of(&filename),
            filename,
            size,
            path: path.into(),
        }
    }

    pub async fn from_path(path: &Path) -> Result<Self> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("unable to get file info: {}", path.display()))?;
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("file name is not valid UTF-8: {}", path.display()))?;
        Ok(Self::new(filename, path, metadata.len()))
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Normalized, without the dot.
    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Output of the first successful attempt. Owns the directory holding the
/// file, so dropping it removes the file.
#[derive(Debug)]
pub struct ProcessedFile {
    dir: TempDir,
    path: PathBuf,
    extension: String,
    size: u64,
    task: String,
}

impl ProcessedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Name of the task that produced this file.
    pub fn task(&self) -> &str {
        &self.task
    }

    /// `original` with its extension swapped for this file's extension.
    pub fn file_name_for(&self, original: &str) -> String {
        replace_extension(original, &self.extension)
    }

    /// Renames the file inside its own directory.
    pub async fn rename(&mut self, file_name: &str) -> Result<()> {
        if Path::new(file_name).file_name() != Some(std::ffi::OsStr::new(file_name)) {
            bail!("invalid file name: {file_name:?}");
        }
        let target = self.dir.path().join(file_name);
        tokio::fs::rename(&self.path, &target)
            .await
            .with_context(|| format!("unable to rename output to {file_name}"))?;
        self.path = target;
        Ok(())
    }
}

#[derive(Debug)]
pub struct AttemptError {
    pub task: String,
    pub error: anyhow::Error,
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} failed: {:#}", self.task, self.error)
    }
}

#[derive(Debug)]
pub struct AttemptFailures(pub Vec<AttemptError>);

impl fmt::Display for AttemptFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{single}"),
            failures => {
                write!(f, "{} tasks failed:", failures.len())?;
                for failure in failures {
                    write!(f, "\n  - {failure}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no task found for file extension {extension:?}")]
    NoMatchingTask { extension: String },
    #[error("{0}")]
    AttemptsFailed(AttemptFailures),
}

impl PipelineError {
    pub fn attempts(&self) -> &[AttemptError] {
        match self {
            Self::NoMatchingTask { .. } => &[],
            Self::AttemptsFailed(failures) => &failures.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    tasks: Arc<TaskList>,
    gate: ConcurrencyGate,
    work_dir: PathBuf,
}

impl Pipeline {
    pub fn new(tasks: Arc<TaskList>, gate: ConcurrencyGate, work_dir: PathBuf) -> Self {
        Self {
            tasks,
            gate,
            work_dir,
        }
    }

    pub fn tasks(&self) -> &TaskList {
        &self.tasks
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn handles_extension(&self, extension: &str) -> bool {
        self.tasks.handles_extension(extension)
    }

    /// Runs the fallback chain for the source's extension until one task
    /// succeeds.
    pub async fn process(&self, source: &SourceFile) -> Result<ProcessedFile, PipelineError> {
        let extension = normalize_extension(source.extension());
        let mut failures = Vec::new();

        for task in self.tasks.matching(&extension) {
            match self.attempt(task, source, &extension).await {
                Ok(processed) => {
                    info!(
                        task = task.name(),
                        failed_attempts = failures.len(),
                        size = processed.size(),
                        "task produced output"
                    );
                    return Ok(processed);
                }
                Err(error) => {
                    warn!(task = task.name(), error = %format!("{error:#}"), "task attempt failed");
                    failures.push(AttemptError {
                        task: task.name().to_string(),
                        error,
                    });
                }
            }
        }

        if failures.is_empty() {
            Err(PipelineError::NoMatchingTask { extension })
        } else {
            Err(PipelineError::AttemptsFailed(AttemptFailures(failures)))
        }
    }

    async fn attempt(
        &self,
        task: &TaskDefinition,
        source: &SourceFile,
        extension: &str,
    ) -> Result<ProcessedFile> {
        let _permit = self.gate.acquire().await?;

        let work = WorkItem::allocate(&self.work_dir, source, extension).await?;

        if task.command().is_empty() {
            debug!(task = task.name(), "empty command, accepting file unchanged");
            return work.accept_source(task).await;
        }

        let command_line = task
            .command()
            .render(&work.command_values(extension))
            .context("unable to generate command to be run")?;

        debug!(task = task.name(), command = %command_line, "running task command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(&command_line)
            .current_dir(self.tasks.base_dir())
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("unable to start command: {command_line}"))?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            bail!(
                "{} while running command:\n{}\nOutput:\n{}",
                output.status,
                command_line,
                combined.trim_end()
            );
        }

        work.into_output(task).await
    }
}

/// One attempt's workspace. Both directories are deleted on drop unless the
/// destination is handed over through [`WorkItem::into_output`].
struct WorkItem {
    src: TempDir,
    dst: TempDir,
    stem: String,
    input: PathBuf,
}

impl WorkItem {
    async fn allocate(work_dir: &Path, source: &SourceFile, extension: &str) -> Result<Self> {
        let src = tempfile::Builder::new()
            .prefix(&format!("{WORK_DIR_PREFIX}-src-"))
            .tempdir_in(work_dir)
            .with_context(|| format!("unable to create temp folder in {}", work_dir.display()))?;
        let dst = tempfile::Builder::new()
            .prefix(&format!("{WORK_DIR_PREFIX}-dst-"))
            .tempdir_in(work_dir)
            .with_context(|| format!("unable to create temp folder in {}", work_dir.display()))?;

        let stem = format!("file-{}", Uuid::new_v4().simple());
        let input = src.path().join(format!("{stem}.{extension}"));

        tokio::fs::copy(source.path(), &input)
            .await
            .with_context(|| format!("unable to write temp file: {}", input.display()))?;

        Ok(Self {
            src,
            dst,
            stem,
            input,
        })
    }

    fn command_values<'a>(&'a self, extension: &'a str) -> CommandValues<'a> {
        CommandValues {
            src_folder: self.src.path(),
            dst_folder: self.dst.path(),
            name: &self.stem,
            extension,
        }
    }

    async fn accept_source(self, task: &TaskDefinition) -> Result<ProcessedFile> {
        let file_name = self
            .input
            .file_name()
            .context("temp file has no name")?
            .to_owned();
        tokio::fs::rename(&self.input, self.dst.path().join(file_name))
            .await
            .context("unable to move file into output folder")?;
        self.into_output(task).await
    }

    async fn into_output(self, task: &TaskDefinition) -> Result<ProcessedFile> {
        let mut entries = tokio::fs::read_dir(self.dst.path())
            .await
            .context("unable to read output folder")?;
        let mut outputs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("unable to read output folder")?
        {
            outputs.push(entry);
        }

        if outputs.len() != 1 {
            bail!(
                "unexpected number of files in output folder: {}",
                outputs.len()
            );
        }

        let output = outputs.remove(0);
        let metadata = output
            .metadata()
            .await
            .context("unable to get output file info")?;
        if !metadata.is_file() {
            bail!("output is not a regular file: {}", output.path().display());
        }
        if metadata.len() == 0 {
            bail!("output file is empty: {}", output.path().display());
        }

        let path = output.path();
        let extension = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(extension_of)
            .unwrap_or_default();

        Ok(ProcessedFile {
            dir: self.dst,
            path,
            extension,
            size: metadata.len(),
            task: task.name().to_string(),
        })
    }
}

/// Replacement happens only when the result is strictly smaller.
pub fn should_replace(original_size: u64, processed_size: u64) -> bool {
    processed_size < original_size
}

/// Swaps the extension of `file_name`, matching the old one case-insensitively.
pub fn replace_extension(file_name: &str, new_extension: &str) -> String {
    let old = extension_of(file_name);
    let stem = if old.is_empty() {
        file_name
    } else {
        trim_suffix_case_insensitive(file_name, &format!(".{old}"))
    };

    if new_extension.is_empty() {
        stem.to_string()
    } else {
        format!("{stem}.{new_extension}")
    }
}

fn trim_suffix_case_insensitive<'a>(value: &'a str, suffix: &str) -> &'a str {
    if value.len() >= suffix.len()
        && value.is_char_boundary(value.len() - suffix.len())
        && value[value.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
    {
        &value[..value.len() - suffix.len()]
    } else {
        value
    }
}

pub fn format_size(size: u64) -> String {
    const KB: u64 = 1 << 10;
    const MB: u64 = 1 << 20;
    const GB: u64 = 1 << 30;
    const TB: u64 = 1 << 40;

    match size {
        s if s >= TB => format!("{:.2} TB", s as f64 / TB as f64),
        s if s >= GB => format!("{:.2} GB", s as f64 / GB as f64),
        s if s >= MB => format!("{:.2} MB", s as f64 / MB as f64),
        s if s >= KB => format!("{:.2} KB", s as f64 / KB as f64),
        s => format!("{s} bytes"),
    }
}
