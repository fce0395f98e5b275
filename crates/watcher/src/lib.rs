//! Watch mode: re-analyze and re-execute on debounced filesystem changes.
//!
//! The watcher owns filesystem watchers over every manifest discovered
//! during analysis and over each script's declared input patterns. Change
//! events are filtered against those patterns (so a build writing its own
//! output cannot retrigger itself), debounced, and then drive a fresh
//! analyzer+executor iteration. Running service children are handed from one
//! executor to the next and adopted when their fingerprints are unchanged.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use wireit_analyzer::Analyzer;
use wireit_cache::Cache;
use wireit_executor::{Executor, ExecutorOptions, FailureMode, ServiceMap, WorkerPool};
use wireit_fs::PatternMatcher;
use wireit_manifest::ManifestReader;
use wireit_protocol::{Diagnostic, ExecutionEvent, ScriptReference};

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("failed to set up filesystem watcher: {0}")]
    Notify(#[from] notify::Error),
}

/// Observable watcher states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Initial,
    Running,
    Watching,
    Debouncing,
    Queued,
    Aborted,
}

pub struct WatcherOptions {
    pub pool: WorkerPool,
    pub cache: Option<Arc<Cache>>,
    pub failure_mode: FailureMode,
    pub debounce: Duration,
    pub abort: watch::Receiver<bool>,
}

/// What events should wake the next iteration.
struct Interest {
    manifests: HashSet<PathBuf>,
    inputs: Vec<(PathBuf, PatternMatcher)>,
    /// Literal input files above their package directory (ancestor
    /// lockfiles); watched individually.
    ancestor_files: HashSet<PathBuf>,
}

impl Interest {
    fn empty() -> Self {
        Self {
            manifests: HashSet::new(),
            inputs: Vec::new(),
            ancestor_files: HashSet::new(),
        }
    }

    fn is_manifest(&self, path: &Path) -> bool {
        self.manifests.contains(path)
    }

    fn is_relevant(&self, path: &Path) -> bool {
        if self.is_manifest(path) {
            return true;
        }
        if self.ancestor_files.contains(path) {
            return true;
        }
        // Engine-owned state is never an input.
        if path
            .components()
            .any(|component| component.as_os_str() == ".wireit")
        {
            return false;
        }
        for (package_dir, matcher) in &self.inputs {
            let Ok(relative) = path.strip_prefix(package_dir) else {
                continue;
            };
            let relative = relative.to_string_lossy().replace('\\', "/");
            if matcher.decide(&relative) {
                return true;
            }
        }
        false
    }
}

/// The debounced analyze/execute loop.
pub struct Watcher {
    root: ScriptReference,
    extra_args: Vec<String>,
    reader: Arc<ManifestReader>,
    options: WatcherOptions,
    state_tx: watch::Sender<WatchState>,
    events_tx: broadcast::Sender<ExecutionEvent>,
}

impl Watcher {
    pub fn new(root: ScriptReference, extra_args: Vec<String>, options: WatcherOptions) -> Self {
        let (state_tx, _) = watch::channel(WatchState::Initial);
        let (events_tx, _) = broadcast::channel(4096);
        Self {
            root,
            extra_args,
            reader: Arc::new(ManifestReader::new()),
            options,
            state_tx,
            events_tx,
        }
    }

    /// Observe state transitions (used by tests and the CLI status line).
    pub fn states(&self) -> watch::Receiver<WatchState> {
        self.state_tx.subscribe()
    }

    /// Event stream spanning all executor iterations.
    pub fn events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events_tx.subscribe()
    }

    /// Run until the abort signal fires.
    pub async fn watch(&self) -> Result<(), WatchError> {
        let (fs_tx, mut fs_rx) = mpsc::channel::<notify::Result<notify::Event>>(1024);
        let mut fs_watcher = RecommendedWatcher::new(
            move |result| {
                let _ = fs_tx.blocking_send(result);
            },
            notify::Config::default(),
        )?;
        let mut watched: HashSet<PathBuf> = HashSet::new();
        let mut interest = Interest::empty();
        let mut services = ServiceMap::new();
        let mut abort = self.options.abort.clone();
        let analyzer = Analyzer::new(self.reader.clone());

        loop {
            self.set_state(WatchState::Running);
            let analysis = analyzer
                .analyze(self.root.clone(), &self.extra_args)
                .await;

            // Whether analysis succeeded or not, watch every manifest we
            // touched so a fix wakes us up.
            for manifest in self.reader.manifest_paths() {
                interest.manifests.insert(manifest.clone());
                watch_path(&mut fs_watcher, &mut watched, &manifest);
            }

            let mut queued = false;
            match analysis {
                Err(diagnostics) => {
                    log_diagnostics(&diagnostics);
                }
                Ok(analysis) => {
                    interest = build_interest(&analysis.graph, &self.reader);
                    for manifest in &interest.manifests {
                        watch_path(&mut fs_watcher, &mut watched, manifest);
                    }
                    for (package_dir, _) in &interest.inputs {
                        watch_path(&mut fs_watcher, &mut watched, package_dir);
                    }
                    for ancestor in &interest.ancestor_files {
                        watch_path(&mut fs_watcher, &mut watched, ancestor);
                    }

                    let executor = Executor::new(
                        analysis.graph.clone(),
                        ExecutorOptions {
                            pool: self.options.pool.clone(),
                            cache: self.options.cache.clone(),
                            failure_mode: self.options.failure_mode,
                            abort: self.options.abort.clone(),
                            adoptees: std::mem::take(&mut services),
                        },
                    );
                    self.relay_events(&executor);

                    // Watch for changes while the build runs; a relevant one
                    // queues an immediate re-run.
                    let execute = executor.execute();
                    tokio::pin!(execute);
                    let result = loop {
                        tokio::select! {
                            result = &mut execute => break result,
                            event = fs_rx.recv() => {
                                if self.note_event(event, &interest, &mut queued) {
                                    self.set_state(WatchState::Queued);
                                }
                            }
                        }
                    };
                    match result {
                        Ok(fingerprint) => {
                            log::info!(
                                "Build of {} finished ({})",
                                self.root.name,
                                &fingerprint.digest()[..8]
                            );
                        }
                        Err(failures) => {
                            for failure in &failures {
                                log::error!("{failure}");
                            }
                        }
                    }
                    services = executor.detach_services().await;
                }
            }

            if *abort.borrow() {
                self.shutdown(std::mem::take(&mut services)).await;
                return Ok(());
            }
            if queued {
                continue;
            }

            self.set_state(WatchState::Watching);
            // Wait for the first relevant event, then debounce: every
            // further event restarts the timer.
            loop {
                tokio::select! {
                    biased;
                    _ = abort.changed() => {
                        if *abort.borrow() {
                            self.shutdown(std::mem::take(&mut services)).await;
                            return Ok(());
                        }
                    }
                    event = fs_rx.recv() => {
                        let mut relevant = false;
                        if self.note_event(event, &interest, &mut relevant) {
                            self.set_state(WatchState::Debouncing);
                            if self.debounce(&mut fs_rx, &interest, &mut abort).await {
                                break;
                            }
                            self.shutdown(std::mem::take(&mut services)).await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Absorb events until the debounce interval passes quietly. Returns
    /// false when aborted instead.
    async fn debounce(
        &self,
        fs_rx: &mut mpsc::Receiver<notify::Result<notify::Event>>,
        interest: &Interest,
        abort: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            let timer = tokio::time::sleep(self.options.debounce);
            tokio::pin!(timer);
            tokio::select! {
                biased;
                _ = abort.changed() => {
                    if *abort.borrow() {
                        return false;
                    }
                }
                () = &mut timer => return true,
                event = fs_rx.recv() => {
                    let mut noted = false;
                    let _ = self.note_event(event, interest, &mut noted);
                    // Timer restarts on the next loop iteration.
                }
            }
        }
    }

    /// Record one filesystem event. Returns true when it was relevant;
    /// invalidates the manifest cache for manifest changes.
    fn note_event(
        &self,
        event: Option<notify::Result<notify::Event>>,
        interest: &Interest,
        flag: &mut bool,
    ) -> bool {
        let Some(Ok(event)) = event else {
            return false;
        };
        let mut relevant = false;
        for path in &event.paths {
            if interest.is_manifest(path) {
                if let Some(package_dir) = path.parent() {
                    self.reader.invalidate(package_dir);
                }
                relevant = true;
            } else if interest.is_relevant(path) {
                relevant = true;
            }
        }
        if relevant {
            *flag = true;
        }
        relevant
    }

    fn relay_events(&self, executor: &Executor) {
        let mut source = executor.events();
        let sink = self.events_tx.clone();
        tokio::spawn(async move {
            while let Ok(event) = source.recv().await {
                let _ = sink.send(event);
            }
        });
    }

    async fn shutdown(&self, services: ServiceMap) {
        for (_, mut adoptable) in services {
            adoptable.child.kill_and_wait().await;
        }
        self.set_state(WatchState::Aborted);
    }

    fn set_state(&self, state: WatchState) {
        self.state_tx.send_replace(state);
    }
}

fn watch_path(
    watcher: &mut RecommendedWatcher,
    watched: &mut HashSet<PathBuf>,
    path: &Path,
) {
    if !watched.insert(path.to_path_buf()) {
        return;
    }
    if let Err(err) = watcher.watch(path, RecursiveMode::Recursive) {
        log::warn!("Failed to watch {}: {err}", path.display());
        watched.remove(path);
    }
}

fn build_interest(graph: &wireit_analyzer::BuildGraph, reader: &ManifestReader) -> Interest {
    let mut interest = Interest::empty();
    interest
        .manifests
        .extend(graph.manifest_paths().into_iter());
    interest.manifests.extend(reader.manifest_paths());
    for config in graph.scripts() {
        let Some(patterns) = &config.files else {
            continue;
        };
        match PatternMatcher::new(patterns) {
            Ok(matcher) => interest
                .inputs
                .push((config.reference.package_dir.clone(), matcher)),
            Err(err) => {
                log::warn!("Unwatchable patterns for {}: {err}", config.reference);
            }
        }
        // Ancestor lockfiles resolve above the package dir; track them by
        // absolute path since the per-package matchers cannot reach them.
        for pattern in patterns {
            if pattern.starts_with("../")
                && !pattern.contains(|c| matches!(c, '*' | '?' | '[' | '{'))
            {
                let mut absolute = config.reference.package_dir.clone();
                absolute.push(pattern);
                interest.ancestor_files.insert(normalize(&absolute));
            }
        }
    }
    interest
}

/// Lexical `..` resolution so watched ancestor paths compare equal to the
/// paths notify reports.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn log_diagnostics(diagnostics: &[Diagnostic]) {
    for diagnostic in diagnostics {
        let rendered = match &diagnostic.location {
            Some(location) => {
                let (line, col) = location.line_col();
                format!(
                    "{}:{line}:{col} [{}] {}",
                    location.path.display(),
                    diagnostic.kind,
                    diagnostic.message
                )
            }
            None => format!("[{}] {}", diagnostic.kind, diagnostic.message),
        };
        match diagnostic.severity {
            wireit_protocol::Severity::Error => log::error!("{rendered}"),
            wireit_protocol::Severity::Warning => log::warn!("{rendered}"),
            wireit_protocol::Severity::Info => log::info!("{rendered}"),
        }
    }
}
