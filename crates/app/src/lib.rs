use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use upload_optimizer_core::config::{resolve_relative_to, AppConfig};
use upload_optimizer_core::gate::ConcurrencyGate;
use upload_optimizer_core::immich::ImmichClient;
use upload_optimizer_core::jobs::JobRegistry;
use upload_optimizer_core::logging::{
    self, FileSink, LoggingOptions, RedactingMakeWriter, DEFAULT_LOG_FILTER,
};
use upload_optimizer_core::pipeline::Pipeline;
use upload_optimizer_core::redirect::UserAgentDenylist;
use upload_optimizer_core::server::{app_router, AppState, UploadFilter};
use upload_optimizer_core::task::TaskList;
use upload_optimizer_core::upstream::UpstreamClient;
use upload_optimizer_core::watcher::DirectoryWatcher;

#[derive(Parser, Debug)]
#[command(
    name = "upload-optimizer",
    about = "Optimizing upload proxy for Immich"
)]
struct Cli {
    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, env = "IUO_LOG_DIR", help = "Directory for rolling log files")]
    log_dir: Option<PathBuf>,

    #[arg(long, env = "IUO_CONFIG", help = "Path to a TOML settings file")]
    config: Option<PathBuf>,

    #[arg(long, env = "IUO_UPSTREAM", help = "Upstream Immich server URL")]
    upstream: Option<String>,

    #[arg(long, env = "IUO_LISTEN", help = "Address to listen on")]
    listen: Option<String>,

    #[arg(long, env = "IUO_TASKS_FILE", help = "Path to the task list file")]
    tasks_file: Option<PathBuf>,

    #[arg(long, env = "IUO_FILTER_PATH", help = "Upload path pattern to intercept")]
    filter_path: Option<String>,

    #[arg(long, env = "IUO_FILTER_FORM_KEY", help = "Form field carrying the file")]
    filter_form_key: Option<String>,

    #[arg(long, env = "IUO_MAX_CONCURRENT", help = "Maximum concurrent task commands")]
    max_concurrent: Option<usize>,

    #[arg(long, env = "IUO_WORK_DIR", help = "Directory for temporary files")]
    work_dir: Option<PathBuf>,

    #[arg(long, env = "IUO_WATCH_DIR", help = "Directory to watch for new files")]
    watch_dir: Option<PathBuf>,

    #[arg(long, env = "IUO_UNDONE_DIR", help = "Where files that failed to upload are copied")]
    undone_dir: Option<PathBuf>,

    #[arg(long, env = "IUO_API_KEY", help = "Immich API key used by the watcher")]
    api_key: Option<String>,

    #[arg(long, env = "IUO_DEVICE_ID", help = "Device id reported for watched uploads")]
    device_id: Option<String>,
}

impl Cli {
    fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(upstream) = &self.upstream {
            config.upstream.url = upstream.clone();
        }
        if let Some(listen) = &self.listen {
            config.server.listen = listen.clone();
        }
        if let Some(tasks_file) = &self.tasks_file {
            config.processing.tasks_file = tasks_file.clone();
        }
        if let Some(filter_path) = &self.filter_path {
            config.upstream.filter_path = filter_path.clone();
        }
        if let Some(form_key) = &self.filter_form_key {
            config.upstream.filter_form_key = form_key.clone();
        }
        if let Some(max_concurrent) = self.max_concurrent {
            config.processing.max_concurrent_tasks = max_concurrent;
        }
        if let Some(work_dir) = &self.work_dir {
            config.processing.work_dir = Some(work_dir.clone());
        }
        if let Some(watch_dir) = &self.watch_dir {
            config.watch.dir = Some(watch_dir.clone());
        }
        if let Some(undone_dir) = &self.undone_dir {
            config.watch.undone_dir = Some(undone_dir.clone());
        }
        if let Some(api_key) = &self.api_key {
            config.watch.api_key = Some(api_key.clone());
        }
        if let Some(device_id) = &self.device_id {
            config.watch.device_id = device_id.clone();
        }
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_dir.as_deref(), cli.verbose, cli.log_filter.as_deref());
    log_startup_metadata(cli.config.as_deref());

    let config = load_config(&cli)?;
    run_server(config).await
}

/// Settings file first, then CLI/env overrides. A relative task file in the
/// settings file is resolved against the settings file's directory.
fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match cli.config.as_deref() {
        Some(path) => {
            let mut config = AppConfig::load_from_path(path)?;
            if let Some(config_dir) = path.parent() {
                config.processing.tasks_file =
                    resolve_relative_to(config_dir, &config.processing.tasks_file);
            }
            config
        }
        None => AppConfig::default(),
    };

    cli.apply_overrides(&mut config);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn init_logging(log_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let options = LoggingOptions {
        log_dir: log_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filter = logging::compose_filters(&options).effective;

    match logging::build_file_sink(&options) {
        FileSink::Ready { appender, .. } => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(RedactingMakeWriter::new(appender))
                        .with_filter(parse_env_filter_with_fallback(&filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSink::Disabled {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&filter, "console")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            if let Some(attempted_log_dir) = attempted_log_dir {
                warn!(
                    attempted_log_dir = %attempted_log_dir.display(),
                    reason = %reason,
                    "Persistent file logging unavailable; continuing with console-only logging"
                );
            }
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(config_path: Option<&Path>) {
    let pid = std::process::id();
    match config_path {
        Some(config_path) => info!(
            pid,
            version = env!("CARGO_PKG_VERSION"),
            config_path = %config_path.display(),
            "Runtime startup metadata"
        ),
        None => info!(pid, version = env!("CARGO_PKG_VERSION"), "Runtime startup metadata"),
    }
}

async fn run_server(config: AppConfig) -> Result<()> {
    let upstream_url = config.upstream_url()?;
    let tasks = TaskList::load_from_path(&config.processing.tasks_file)?;
    info!(
        tasks_file = %config.processing.tasks_file.display(),
        tasks = tasks.len(),
        "Loaded task list"
    );

    let work_dir = config.work_dir();
    tokio::fs::create_dir_all(&work_dir)
        .await
        .with_context(|| format!("unable to create work directory: {}", work_dir.display()))?;

    let pipeline = Pipeline::new(
        Arc::new(tasks),
        ConcurrencyGate::new(config.processing.max_concurrent_tasks),
        work_dir,
    );
    let upstream = UpstreamClient::new(upstream_url.clone())?;
    let state = AppState::new(
        pipeline.clone(),
        Arc::new(JobRegistry::default()),
        upstream,
        UploadFilter::new(
            config.upstream.filter_path.clone(),
            config.upstream.filter_form_key.clone(),
        ),
        Arc::new(UserAgentDenylist::default()),
    );

    let shutdown = CancellationToken::new();
    let watcher_task = match (&config.watch.dir, &config.watch.undone_dir, &config.watch.api_key)
    {
        (Some(watch_dir), Some(undone_dir), Some(api_key)) => {
            let uploader = ImmichClient::new(upstream_url, api_key, &config.watch.device_id)?;
            let watcher =
                DirectoryWatcher::new(watch_dir, undone_dir, pipeline, Arc::new(uploader)).await?;
            let cancel = shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(error) = watcher.run(cancel).await {
                    warn!(error = %format!("{error:#}"), "Directory watcher stopped");
                }
            }))
        }
        _ => None,
    };

    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("unable to listen on {}", config.server.listen))?;
    info!(
        addr = %config.server.listen,
        upstream = %config.upstream.url,
        "Starting upload optimizer"
    );

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            serve_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(watcher_task) = watcher_task {
        if let Err(error) = watcher_task.await {
            warn!(error = %error, "Directory watcher task panicked");
        }
    }
    info!("Shut down cleanly");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "Unable to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "Unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingOptions {
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        noise_filter: noise_base.to_string(),
        ..Default::default()
    };

    logging::compose_filters(&options).effective
}


#[cfg(test)]
mod log_filter_tests {
    use super::*;

    const NOISE: &str = "hyper_util=warn,reqwest=warn";

    #[test]
    fn uses_noise_and_default_info_without_overrides() {
        let selected = select_log_filter(NOISE, None, 0, None);
        assert_eq!(selected, format!("{NOISE},info"));
    }

    #[test]
    fn uses_noise_with_rust_log_when_no_cli_overrides() {
        let selected = select_log_filter(NOISE, Some("debug"), 0, None);
        assert_eq!(selected, format!("{NOISE},debug"));
    }

    #[test]
    fn verbose_flag_overrides_rust_log() {
        let selected = select_log_filter(NOISE, Some("info"), 1, None);
        assert_eq!(selected, "debug");
    }

    #[test]
    fn double_verbose_enables_trace() {
        let selected = select_log_filter(NOISE, Some("info"), 2, None);
        assert_eq!(selected, "trace");
    }

    #[test]
    fn explicit_log_filter_has_highest_precedence() {
        let selected = select_log_filter(
            NOISE,
            Some("warn"),
            2,
            Some("upload_optimizer_core=trace"),
        );
        assert_eq!(selected, "upload_optimizer_core=trace");
    }
}
