//! Directory ingestion: files dropped into the watch tree are optimized and
//! uploaded, then removed locally.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use walkdir::WalkDir;

use crate::immich::AssetUploader;
use crate::pipeline::{format_size, should_replace, Pipeline, SourceFile};

struct WatchTable {
    watcher: RecommendedWatcher,
    dirs: HashMap<PathBuf, RecursiveMode>,
}

pub struct DirectoryWatcher {
    root: PathBuf,
    undone_dir: PathBuf,
    pipeline: Pipeline,
    uploader: Arc<dyn AssetUploader>,
    table: Mutex<WatchTable>,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
}

impl DirectoryWatcher {
    /// Registers a watch on every directory under `root`. Files are not
    /// touched until [`DirectoryWatcher::run`].
    pub async fn new(
        root: &Path,
        undone_dir: &Path,
        pipeline: Pipeline,
        uploader: Arc<dyn AssetUploader>,
    ) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("watch directory not found: {}", root.display()))?;

        let (tx, events) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })
        .context("failed to create filesystem watcher")?;

        let watcher = Self {
            root,
            undone_dir: undone_dir.to_path_buf(),
            pipeline,
            uploader,
            table: Mutex::new(WatchTable {
                watcher,
                dirs: HashMap::new(),
            }),
            events,
        };

        info!(root = %watcher.root.display(), "starting recursive directory watch");
        watcher.watch_tree(&watcher.root).await?;
        Ok(watcher)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directories currently watched.
    pub fn watched_dirs(&self) -> Vec<PathBuf> {
        self.table().dirs.keys().cloned().collect()
    }

    fn table(&self) -> MutexGuard<'_, WatchTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Processes the files already present, then reacts to events until
    /// `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let root = self.root.clone();
        self.process_tree(&root).await;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.events.recv() => event,
            };

            match event {
                Some(Ok(event)) => self.handle_event(event).await,
                Some(Err(err)) => warn!(error = %err, "filesystem watch error"),
                None => break,
            }
        }

        self.unwatch_all();
        info!(root = %self.root.display(), "directory watch stopped");
        Ok(())
    }

    async fn handle_event(&self, event: Event) {
        match event.kind {
            EventKind::Create(CreateKind::Folder) => {
                for path in &event.paths {
                    self.ingest_new_dir(path).await;
                }
            }
            EventKind::Create(CreateKind::Any) => {
                for path in event.paths.iter().filter(|path| path.is_dir()) {
                    self.ingest_new_dir(path).await;
                }
            }
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
                for path in &event.paths {
                    self.process_file(path).await;
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in &event.paths {
                    if path.is_dir() {
                        self.ingest_new_dir(path).await;
                    } else {
                        self.process_file(path).await;
                    }
                }
            }
            _ => {}
        }
    }

    /// Watches `dir` and everything below it, then processes the files
    /// already inside.
    async fn ingest_new_dir(&self, dir: &Path) {
        self.watch_new_dir(dir).await;
        self.process_tree(dir).await;
    }

    async fn watch_new_dir(&self, dir: &Path) {
        if let Err(err) = self.watch_tree(dir).await {
            warn!(dir = %dir.display(), error = %format!("{err:#}"), "failed to watch new directory");
        }
    }

    async fn watch_tree(&self, dir: &Path) -> Result<()> {
        for dir in walk(dir, EntryKind::Dir).await? {
            let mut table = self.table();
            if table.dirs.contains_key(&dir) {
                continue;
            }
            table
                .watcher
                .watch(&dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("failed to add watch for {}", dir.display()))?;
            table.dirs.insert(dir.clone(), RecursiveMode::NonRecursive);
            debug!(dir = %dir.display(), "added watch for directory");
        }
        Ok(())
    }

    fn unwatch_all(&self) {
        let mut table = self.table();
        let dirs: Vec<PathBuf> = table.dirs.drain().map(|(dir, _)| dir).collect();
        for dir in dirs {
            if let Err(err) = table.watcher.unwatch(&dir) {
                debug!(dir = %dir.display(), error = %err, "failed to remove watch");
            }
        }
    }

    async fn process_tree(&self, dir: &Path) {
        let files = match walk(dir, EntryKind::File).await {
            Ok(files) => files,
            Err(err) => {
                warn!(dir = %dir.display(), error = %format!("{err:#}"), "failed to scan directory");
                return;
            }
        };
        for file in files {
            self.process_file(&file).await;
        }
    }

    pub(crate) async fn process_file(&self, path: &Path) {
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => return,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "file vanished before processing");
                return;
            }
        }

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.optimize_and_upload(path)
            .instrument(info_span!("file", file = %name))
            .await;
    }

    async fn optimize_and_upload(&self, path: &Path) {
        let source = match SourceFile::from_path(path).await {
            Ok(source) => source,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "unable to read file");
                return;
            }
        };

        if !self.pipeline.handles_extension(source.extension()) {
            info!(
                extension = source.extension(),
                "no task for this extension, uploading unmodified"
            );
            self.upload_original(path).await;
            return;
        }

        info!(size = %format_size(source.size()), "processing file");

        let mut processed = match self.pipeline.process(&source).await {
            Ok(processed) => processed,
            Err(err) => {
                warn!(error = %err, "processing failed, uploading original");
                self.upload_original(path).await;
                return;
            }
        };

        if !should_replace(source.size(), processed.size()) {
            info!(
                original = %format_size(source.size()),
                processed = %format_size(processed.size()),
                "no size reduction, uploading original"
            );
            self.upload_original(path).await;
            return;
        }

        let upload_name = processed.file_name_for(source.filename());
        if let Err(err) = processed.rename(&upload_name).await {
            warn!(error = %format!("{err:#}"), "uploading original instead");
            self.upload_original(path).await;
            return;
        }

        match self.uploader.upload_asset(processed.path()).await {
            Ok(()) => {
                info!(
                    original = %format_size(source.size()),
                    processed = %format_size(processed.size()),
                    "optimized file uploaded"
                );
                remove_uploaded(path).await;
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "upload failed");
                self.quarantine(path).await;
            }
        }
    }

    async fn upload_original(&self, path: &Path) {
        match self.uploader.upload_asset(path).await {
            Ok(()) => {
                info!("original file uploaded");
                remove_uploaded(path).await;
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "upload failed");
                self.quarantine(path).await;
            }
        }
    }

    /// Copies `path` under the undone directory, keeping its position
    /// relative to the watch root. The original stays where it is.
    async fn quarantine(&self, path: &Path) {
        let destination = self.undone_path(path);
        let result = async {
            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("unable to create {}", parent.display()))?;
            }
            tokio::fs::copy(path, &destination)
                .await
                .with_context(|| format!("unable to copy to {}", destination.display()))
        }
        .await;

        match result {
            Ok(_) => info!(destination = %destination.display(), "file copied to undone directory"),
            Err(err) => warn!(error = %format!("{err:#}"), "failed to copy file to undone directory"),
        }
    }

    fn undone_path(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.root) {
            Ok(relative) => self.undone_dir.join(relative),
            Err(_) => self
                .undone_dir
                .join(path.file_name().unwrap_or(path.as_os_str())),
        }
    }
}

async fn remove_uploaded(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %err, "failed to remove file after upload");
    }
}

#[derive(Debug, Clone, Copy)]
enum EntryKind {
    Dir,
    File,
}

async fn walk(root: &Path, kind: EntryKind) -> Result<Vec<PathBuf>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut found = Vec::new();
        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(root = %root.display(), error = %err, "error walking directory");
                    continue;
                }
            };
            let wanted = match kind {
                EntryKind::Dir => entry.file_type().is_dir(),
                EntryKind::File => entry.file_type().is_file(),
            };
            if wanted {
                found.push(entry.into_path());
            }
        }
        found
    })
    .await
    .context("directory walk task failed")
}
