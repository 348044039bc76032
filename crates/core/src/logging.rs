use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::Metadata;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriter;

pub const DEFAULT_LOG_FILTER: &str = "info";
/// Applied only when the user did not pick a filter explicitly.
pub const DEFAULT_NOISE_FILTER: &str = "hyper_util=warn,reqwest=warn,notify=warn";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_FILE_PREFIX: &str = "upload-optimizer";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";
pub const REDACTION_PLACEHOLDER: &str = "***REDACTED***";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingOptions {
    pub log_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            log_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    /// What the user asked for, before noise suppression.
    pub requested: String,
    pub effective: String,
}

#[derive(Debug)]
pub enum FileSink {
    Ready {
        log_dir: PathBuf,
        retention_files: usize,
        appender: RollingFileAppender,
    },
    Disabled {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSink {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn log_dir(&self) -> Option<&Path> {
        match self {
            Self::Ready { log_dir, .. } => Some(log_dir),
            Self::Disabled {
                attempted_log_dir, ..
            } => attempted_log_dir.as_deref(),
        }
    }
}

/// Precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then the
/// default. Noisy dependency targets are quieted unless the user was
/// explicit.
pub fn compose_filters(options: &LoggingOptions) -> LogFilters {
    let requested = if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    };

    let explicit = options.cli_log_filter.is_some() || options.verbose > 0;
    let effective = if explicit || options.noise_filter.trim().is_empty() {
        requested.clone()
    } else {
        format!("{},{requested}", options.noise_filter)
    };

    LogFilters {
        requested,
        effective,
    }
}

pub fn build_file_sink(options: &LoggingOptions) -> FileSink {
    let Some(log_dir) = options.log_dir.clone() else {
        return FileSink::Disabled {
            attempted_log_dir: None,
            reason: "no log directory configured".to_string(),
        };
    };

    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSink::Disabled {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let retention_files = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir)
    {
        Ok(appender) => FileSink::Ready {
            log_dir,
            retention_files,
            appender,
        },
        Err(error) => FileSink::Disabled {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

/// Wraps a writer factory so every complete line is scrubbed of credentials
/// before it reaches the sink.
#[derive(Debug)]
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }

    fn make_writer_for(&'a self, metadata: &Metadata<'_>) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer_for(metadata))
    }
}

#[derive(Debug)]
pub struct RedactingWriter<W: Write> {
    inner: W,
    pending: Vec<u8>,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    fn emit(&mut self, chunk: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(chunk);
        self.inner
            .write_all(redact_sensitive_text(&text).as_bytes())
    }

    fn drain_pending(&mut self, complete_lines_only: bool) -> io::Result<()> {
        let end = if complete_lines_only {
            match self.pending.iter().rposition(|byte| *byte == b'\n') {
                Some(index) => index + 1,
                None => return Ok(()),
            }
        } else {
            self.pending.len()
        };
        if end == 0 {
            return Ok(());
        }
        let chunk: Vec<u8> = self.pending.drain(..end).collect();
        for line in chunk.split_inclusive(|byte| *byte == b'\n') {
            self.emit(line)?;
        }
        Ok(())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        self.drain_pending(true)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain_pending(false)?;
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.drain_pending(false);
        let _ = self.inner.flush();
    }
}

/// Masks URL userinfo and the values of credential-looking `key=value` or
/// `key: value` pairs.
pub fn redact_sensitive_text(input: &str) -> String {
    redact_assignments(&redact_userinfo(input))
}

fn redact_userinfo(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut cursor = 0;

    while let Some(offset) = input[cursor..].find("://") {
        let authority_start = cursor + offset + 3;
        let authority_end = input[authority_start..]
            .find(|ch: char| ch.is_whitespace() || "/?#\"'<>".contains(ch))
            .map_or(input.len(), |end| authority_start + end);

        output.push_str(&input[cursor..authority_start]);
        match input[authority_start..authority_end].rfind('@') {
            Some(at) if at > 0 => {
                output.push_str(REDACTION_PLACEHOLDER);
                output.push_str(&input[authority_start + at..authority_end]);
            }
            _ => output.push_str(&input[authority_start..authority_end]),
        }
        cursor = authority_end;
    }

    output.push_str(&input[cursor..]);
    output
}

fn redact_assignments(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut output = String::with_capacity(input.len());
    let mut cursor = 0;
    let mut index = 0;

    while index < bytes.len() {
        if !matches!(bytes[index], b'=' | b':') {
            index += 1;
            continue;
        }

        let key_start = input[..index]
            .rfind(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_' || ch == '-'))
            .map_or(0, |pos| pos + 1);
        if key_start == index || !is_sensitive_key(&input[key_start..index].to_ascii_lowercase()) {
            index += 1;
            continue;
        }

        let mut value_start = index + 1;
        while value_start < bytes.len() && bytes[value_start].is_ascii_whitespace() {
            value_start += 1;
        }
        if input[value_start..]
            .get(..7)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("bearer "))
        {
            value_start += 7;
        }
        if value_start >= bytes.len() {
            break;
        }

        let (secret_start, secret_end) = match bytes[value_start] {
            quote @ (b'"' | b'\'') => {
                let start = value_start + 1;
                let end = input[start..]
                    .find(quote as char)
                    .map_or(input.len(), |offset| start + offset);
                (start, end)
            }
            _ => {
                let end = input[value_start..]
                    .find(|ch: char| ch.is_ascii_whitespace() || "&,;)]}\"'".contains(ch))
                    .map_or(input.len(), |offset| value_start + offset);
                (value_start, end)
            }
        };

        if secret_end > secret_start {
            output.push_str(&input[cursor..secret_start]);
            output.push_str(REDACTION_PLACEHOLDER);
            cursor = secret_end;
            index = secret_end;
        } else {
            index += 1;
        }
    }

    output.push_str(&input[cursor..]);
    output
}

fn is_sensitive_key(key: &str) -> bool {
    matches!(key, "key" | "pwd" | "passwd" | "authorization" | "cookie")
        || key.contains("token")
        || key.contains("secret")
        || key.contains("password")
        || key.ends_with("_key")
        || key.ends_with("-key")
        || key.ends_with("apikey")
}
