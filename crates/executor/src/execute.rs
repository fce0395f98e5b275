use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use wireit_analyzer::{BuildGraph, ScriptConfig, ScriptKind};
use wireit_cache::{Cache, OutputFile};
use wireit_fingerprint::Fingerprint;
use wireit_protocol::{
    EventKind, ExecutionEvent, Failure, FailureReason, ScriptKey, ScriptReference,
};

use crate::pool::WorkerPool;
use crate::service::{wait_flag, AdoptableService, ServiceHandle, ServiceMap, ServiceState, ServiceTask};
use crate::state;

/// How the rest of the build reacts when one script fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Let running scripts finish; do not start new ones.
    #[default]
    NoNew,
    /// Keep starting scripts whose own dependencies have not failed.
    Continue,
    /// Signal running children immediately and start nothing new.
    Kill,
}

impl FailureMode {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "no-new" => Ok(FailureMode::NoNew),
            "continue" => Ok(FailureMode::Continue),
            "kill" => Ok(FailureMode::Kill),
            other => Err(format!(
                "failure mode must be one of no-new, continue, kill; got {other:?}"
            )),
        }
    }
}

/// Why a script counted as successful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessKind {
    /// Stored fingerprint matched; nothing ran.
    Fresh,
    /// Outputs restored from the cache; nothing ran.
    Cached,
    /// The command ran to a zero exit.
    Ran,
    /// Grouping script; nothing to run.
    NoCommand,
    /// Service reached its ready state (or is available unstarted).
    Service,
}

/// The memoized result every observer of a script sees.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success {
        fingerprint: Fingerprint,
        kind: SuccessKind,
    },
    Failure {
        reason: FailureReason,
    },
}

/// Aggregates failures and drives the failure-mode reaction.
pub(crate) struct FailureBus {
    mode: FailureMode,
    failures: Mutex<Vec<Failure>>,
    failing: watch::Sender<bool>,
    kill: watch::Sender<bool>,
}

impl FailureBus {
    fn new(mode: FailureMode) -> Self {
        Self {
            mode,
            failures: Mutex::new(Vec::new()),
            failing: watch::channel(false).0,
            kill: watch::channel(false).0,
        }
    }

    pub(crate) fn record(&self, failure: Failure) {
        // Derivative reasons point at another script's root cause, and
        // abort/cancellation is reported by the caller that requested it.
        let record = !failure.reason.is_derivative()
            && !matches!(
                failure.reason,
                FailureReason::Aborted | FailureReason::StartCancelled
            );
        if record {
            self.failures.lock().expect("failure list lock").push(failure);
        }
        // send_replace: the flag must stick even while nobody is subscribed.
        self.failing.send_replace(true);
        if self.mode == FailureMode::Kill {
            self.kill.send_replace(true);
        }
    }

    fn is_failing(&self) -> bool {
        *self.failing.subscribe().borrow()
    }

    fn subscribe_kill(&self) -> watch::Receiver<bool> {
        self.kill.subscribe()
    }

    fn failures(&self) -> Vec<Failure> {
        self.failures.lock().expect("failure list lock").clone()
    }
}

/// Options for one executor iteration.
pub struct ExecutorOptions {
    pub pool: WorkerPool,
    pub cache: Option<Arc<Cache>>,
    pub failure_mode: FailureMode,
    /// Cooperative abort signal; flips to true at most once.
    pub abort: watch::Receiver<bool>,
    /// Services detached from the previous iteration, for adoption.
    pub adoptees: ServiceMap,
}

struct Inner {
    graph: Arc<BuildGraph>,
    pool: WorkerPool,
    cache: Option<Arc<Cache>>,
    abort: watch::Receiver<bool>,
    events: broadcast::Sender<ExecutionEvent>,
    bus: Arc<FailureBus>,
    executions: Mutex<HashMap<ScriptKey, watch::Receiver<Option<Outcome>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    services: Mutex<HashMap<ScriptKey, ServiceHandle>>,
    adoptees: Mutex<ServiceMap>,
    persistent: HashSet<ScriptKey>,
}

/// Runs one build graph to completion.
///
/// Cloning is cheap; clones share the same execution state.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    pub fn new(graph: Arc<BuildGraph>, options: ExecutorOptions) -> Self {
        let (events, _) = broadcast::channel(1024);
        let persistent = persistent_services(&graph);
        Self {
            inner: Arc::new(Inner {
                graph,
                pool: options.pool,
                cache: options.cache,
                abort: options.abort,
                events,
                bus: Arc::new(FailureBus::new(options.failure_mode)),
                executions: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                services: Mutex::new(HashMap::new()),
                adoptees: Mutex::new(options.adoptees),
                persistent,
            }),
        }
    }

    /// Subscribe to the executor's event stream (script outcomes, child
    /// output lines, service transitions).
    pub fn events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }

    /// Drive the graph to completion: the root's fingerprint on success, or
    /// every aggregated failure.
    pub async fn execute(&self) -> Result<Fingerprint, Vec<Failure>> {
        // Adoptees whose script no longer exists in the graph have no
        // chance to be adopted; stop them before running anything.
        let orphans: Vec<AdoptableService> = {
            let mut adoptees = self.inner.adoptees.lock().expect("adoptee lock");
            let known: HashSet<ScriptKey> =
                self.inner.graph.scripts().map(ScriptConfig::key).collect();
            let orphan_keys: Vec<ScriptKey> = adoptees
                .keys()
                .filter(|key| !known.contains(*key))
                .cloned()
                .collect();
            orphan_keys
                .into_iter()
                .filter_map(|key| adoptees.remove(&key))
                .collect()
        };
        for mut orphan in orphans {
            orphan.child.kill_and_wait().await;
        }

        let root_key = self.inner.graph.root_key().clone();
        let outcome = self.execute_script(&root_key).await;

        // Let in-flight sibling work settle before reporting, so the failure
        // list is complete and no child outlives `execute` untracked.
        loop {
            let handle = {
                let mut tasks = self.inner.tasks.lock().expect("task list lock");
                tasks.pop()
            };
            match handle {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }

        match outcome {
            Outcome::Success { fingerprint, .. } => Ok(fingerprint),
            Outcome::Failure { reason } => {
                let mut failures = self.inner.bus.failures();
                if failures.is_empty() {
                    failures.push(Failure::new(
                        self.inner.graph.root().reference.clone(),
                        reason,
                    ));
                }
                Err(failures)
            }
        }
    }

    /// Handles of every service this executor created.
    pub fn services(&self) -> Vec<ServiceHandle> {
        self.inner
            .services
            .lock()
            .expect("service map lock")
            .values()
            .cloned()
            .collect()
    }

    /// Detach all running services for adoption by a successor executor.
    /// Services that have nothing running simply drop out.
    pub async fn detach_services(&self) -> ServiceMap {
        let handles = self.services();
        let mut map = ServiceMap::new();
        for handle in handles {
            if let Some(adoptable) = handle.detach().await {
                map.insert(handle.reference().key(), adoptable);
            }
        }
        map
    }

    /// Stop every service and wait for the children to exit.
    pub async fn stop_services(&self) {
        let handles = self.services();
        for handle in &handles {
            handle.stop();
        }
        for handle in &handles {
            let _ = handle.wait_terminated().await;
        }
    }

    /// At-most-one execution per script: the first caller spawns the task,
    /// every caller waits on the same channel.
    fn execution(&self, key: &ScriptKey) -> watch::Receiver<Option<Outcome>> {
        let mut executions = self.inner.executions.lock().expect("execution map lock");
        if let Some(receiver) = executions.get(key) {
            return receiver.clone();
        }
        let (tx, rx) = watch::channel(None);
        executions.insert(key.clone(), rx.clone());
        drop(executions);

        let executor = self.clone();
        let key = key.clone();
        let handle = tokio::spawn(async move {
            let outcome = executor.run_script(&key).await;
            let _ = tx.send(Some(outcome));
        });
        self.inner.tasks.lock().expect("task list lock").push(handle);
        rx
    }

    async fn execute_script(&self, key: &ScriptKey) -> Outcome {
        let mut receiver = self.execution(key);
        let outcome = receiver
            .wait_for(Option::is_some)
            .await
            .expect("execution channel is not dropped before resolving");
        outcome.clone().expect("checked above")
    }

    /// Execute dependencies (in shuffled order) and collect their outcomes
    /// paired with the dependency edges.
    async fn execute_dependencies(
        &self,
        config: &ScriptConfig,
    ) -> Result<Vec<(usize, Outcome)>, Outcome> {
        let mut order: Vec<usize> = (0..config.dependencies.len()).collect();
        order.shuffle(&mut rand::thread_rng());

        // Launch all of them before awaiting any, so siblings overlap.
        let receivers: Vec<(usize, watch::Receiver<Option<Outcome>>)> = order
            .iter()
            .map(|&index| (index, self.execution(&config.dependencies[index].target)))
            .collect();

        let mut outcomes = Vec::with_capacity(receivers.len());
        let mut first_failure: Option<ScriptReference> = None;
        for (index, mut receiver) in receivers {
            let outcome = receiver
                .wait_for(Option::is_some)
                .await
                .expect("execution channel is not dropped before resolving")
                .clone()
                .expect("checked above");
            if matches!(outcome, Outcome::Failure { .. }) && first_failure.is_none() {
                first_failure = Some(config.dependencies[index].reference.clone());
            }
            outcomes.push((index, outcome));
        }

        if let Some(dependency) = first_failure {
            return Err(Outcome::Failure {
                reason: FailureReason::DependencyFailed { dependency },
            });
        }
        Ok(outcomes)
    }

    async fn run_script(&self, key: &ScriptKey) -> Outcome {
        let config = self
            .inner
            .graph
            .get(key)
            .expect("every reachable key has a config")
            .clone();

        if *self.inner.abort.borrow() {
            return self.fail(&config, FailureReason::Aborted);
        }

        // Failure-mode gate: in no-new and kill modes, nothing new starts
        // once anything has failed.
        if self.inner.bus.is_failing() && self.inner.bus.mode != FailureMode::Continue {
            return self.fail(&config, FailureReason::StartCancelled);
        }

        // Services expose their pre-start phases on the same channel their
        // handle will observe; the machine task takes over at `unstarted`.
        let service_state = config
            .is_service()
            .then(|| watch::channel(ServiceState::Initial).0);

        if let Some(state) = &service_state {
            state.send_replace(ServiceState::ExecutingDeps);
        }
        let dependency_outcomes = match self.execute_dependencies(&config).await {
            Ok(outcomes) => outcomes,
            Err(failure) => {
                if let Some(state) = &service_state {
                    state.send_replace(ServiceState::Failed);
                }
                if let Outcome::Failure { reason } = &failure {
                    self.inner
                        .bus
                        .record(Failure::new(config.reference.clone(), reason.clone()));
                }
                return failure;
            }
        };

        let mut fingerprints: Vec<(&wireit_analyzer::Dependency, Fingerprint)> =
            Vec::with_capacity(dependency_outcomes.len());
        for (index, outcome) in &dependency_outcomes {
            if let Outcome::Success { fingerprint, .. } = outcome {
                fingerprints.push((&config.dependencies[*index], fingerprint.clone()));
            }
        }
        let fingerprint_refs: Vec<(&wireit_analyzer::Dependency, &Fingerprint)> = fingerprints
            .iter()
            .map(|(dependency, fingerprint)| (*dependency, fingerprint))
            .collect();

        if let Some(state) = &service_state {
            state.send_replace(ServiceState::Fingerprinting);
        }
        let fingerprint = match Fingerprint::compute(&config, &fingerprint_refs).await {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                if let Some(state) = &service_state {
                    state.send_replace(ServiceState::Failed);
                }
                return self.fail(
                    &config,
                    FailureReason::UnknownErrorThrown {
                        message: err.to_string(),
                    },
                );
            }
        };

        match &config.kind {
            ScriptKind::NoCommand => Outcome::Success {
                fingerprint,
                kind: SuccessKind::NoCommand,
            },
            ScriptKind::OneShot { .. } => self.run_one_shot(&config, fingerprint).await,
            ScriptKind::Service { .. } => {
                let state_tx = service_state.expect("created above for services");
                self.run_service(&config, fingerprint, state_tx).await
            }
        }
    }

    async fn run_one_shot(&self, config: &ScriptConfig, fingerprint: Fingerprint) -> Outcome {
        let script = &config.reference;

        let previous = state::read_previous_fingerprint(script).await;
        if fingerprint.fully_tracked() {
            if let Some(previous) = &previous {
                if previous == &fingerprint {
                    self.emit(script, EventKind::Fresh);
                    return Outcome::Success {
                        fingerprint,
                        kind: SuccessKind::Fresh,
                    };
                }
                // Unequal fingerprints must expose a difference; anything
                // else is an engine bug worth a loud stop.
                let difference = fingerprint.difference(previous);
                let Some(difference) = difference else {
                    panic!(
                        "fingerprints differ with no detected difference: {} vs {}",
                        fingerprint.canonical(),
                        previous.canonical()
                    );
                };
                log::debug!("{} will re-run: {difference}", config.reference);
            }

            // The cache is consulted before cleaning, so a hit avoids both
            // the clean and the run.
            if let Some(cache) = &self.inner.cache {
                match cache.get(script, fingerprint.digest()).await {
                    Ok(Some(hit)) => {
                        if let Err(err) = state::clean_output(config).await {
                            return self.fail(
                                config,
                                FailureReason::UnknownErrorThrown {
                                    message: err.to_string(),
                                },
                            );
                        }
                        if let Err(err) = hit.apply().await {
                            return self.fail(
                                config,
                                FailureReason::UnknownErrorThrown {
                                    message: err.to_string(),
                                },
                            );
                        }
                        if let Err(err) = state::write_fingerprint(script, &fingerprint).await {
                            return self.fail(
                                config,
                                FailureReason::UnknownErrorThrown {
                                    message: err.to_string(),
                                },
                            );
                        }
                        self.emit(script, EventKind::Cached);
                        return Outcome::Success {
                            fingerprint,
                            kind: SuccessKind::Cached,
                        };
                    }
                    Ok(None) => {}
                    Err(err) => {
                        log::warn!("Cache lookup failed for {script}: {err}");
                    }
                }
            }
        }

        // Start (and register as consumer of) the service dependencies this
        // run needs.
        let mut consumed_services: Vec<ServiceHandle> = Vec::new();
        for dependency in &config.dependencies {
            let is_service = self
                .inner
                .graph
                .get(&dependency.target)
                .is_some_and(ScriptConfig::is_service);
            if !is_service {
                continue;
            }
            let handle = {
                let services = self.inner.services.lock().expect("service map lock");
                services.get(&dependency.target).cloned()
            };
            if let Some(handle) = handle {
                handle.start();
                consumed_services.push(handle);
            }
        }
        for handle in &consumed_services {
            if let Err(reason) = handle.wait_started().await {
                let reason = match reason {
                    FailureReason::StartCancelled => FailureReason::StartCancelled,
                    _ => FailureReason::DependencyServiceExitedUnexpectedly {
                        dependency: handle.reference().clone(),
                    },
                };
                release_all(&consumed_services);
                return self.fail(config, reason);
            }
        }

        let outcome = self
            .run_one_shot_command(config, fingerprint, previous)
            .await;
        release_all(&consumed_services);
        outcome
    }

    async fn run_one_shot_command(
        &self,
        config: &ScriptConfig,
        fingerprint: Fingerprint,
        previous: Option<Fingerprint>,
    ) -> Outcome {
        let script = &config.reference;

        // Clean policy, applied only when we are really about to run.
        let should_clean = match config.clean {
            wireit_analyzer::CleanPolicy::Always => true,
            wireit_analyzer::CleanPolicy::Never => false,
            wireit_analyzer::CleanPolicy::IfFileDeleted => previous
                .as_ref()
                .is_some_and(|previous| state::input_file_was_deleted(previous, &fingerprint)),
        };
        if should_clean {
            if let Err(err) = state::clean_output(config).await {
                return self.fail(
                    config,
                    FailureReason::UnknownErrorThrown {
                        message: err.to_string(),
                    },
                );
            }
        }

        let mut abort = self.inner.abort.clone();
        let permit = tokio::select! {
            biased;
            _ = wait_flag(&mut abort) => {
                return self.fail(config, FailureReason::Aborted);
            }
            permit = self.inner.pool.acquire() => permit,
        };

        if self.inner.bus.is_failing() && self.inner.bus.mode != FailureMode::Continue {
            return self.fail(config, FailureReason::StartCancelled);
        }

        // An interrupted run must never look fresh later.
        if let Err(err) = state::delete_fingerprint(script).await {
            return self.fail(
                config,
                FailureReason::UnknownErrorThrown {
                    message: err.to_string(),
                },
            );
        }

        state::reset_log(script).await;
        let mut child = match crate::child::ScriptChild::spawn(
            config,
            self.inner.events.clone(),
            Some(state::log_path(script)),
        ) {
            Ok(child) => child,
            Err(reason) => return self.fail(config, reason),
        };
        self.emit(script, EventKind::Spawned);

        let mut kill = self.inner.bus.subscribe_kill();
        // The select resolves to a value first so the child can be killed
        // outside the arms.
        enum Waited {
            Interrupted(FailureReason),
            Exited(Result<(), FailureReason>),
        }
        let waited = tokio::select! {
            biased;
            _ = wait_flag(&mut abort) => Waited::Interrupted(FailureReason::Aborted),
            _ = wait_flag(&mut kill) => Waited::Interrupted(FailureReason::Killed),
            result = child.wait() => Waited::Exited(result),
        };
        let result = match waited {
            Waited::Interrupted(reason) => {
                child.kill_and_wait().await;
                Err(reason)
            }
            Waited::Exited(result) => result,
        };
        drop(permit);

        match result {
            Ok(()) => {
                self.emit(script, EventKind::ExitZero);
                if fingerprint.fully_tracked() {
                    self.archive_outputs(config, &fingerprint).await;
                }
                if let Err(err) = state::write_fingerprint(script, &fingerprint).await {
                    return self.fail(
                        config,
                        FailureReason::UnknownErrorThrown {
                            message: err.to_string(),
                        },
                    );
                }
                Outcome::Success {
                    fingerprint,
                    kind: SuccessKind::Ran,
                }
            }
            Err(reason) => self.fail(config, reason),
        }
    }

    /// Copy the files matched by the output globs into the cache.
    async fn archive_outputs(&self, config: &ScriptConfig, fingerprint: &Fingerprint) {
        let Some(cache) = &self.inner.cache else {
            return;
        };
        let Some(patterns) = config.output.clone() else {
            return;
        };
        let package_dir = config.reference.package_dir.clone();
        let matched = tokio::task::spawn_blocking(move || {
            wireit_fs::expand_globs(&package_dir, &patterns)
        })
        .await
        .expect("glob expansion task does not panic");
        let files = match matched {
            Ok(files) => files
                .into_iter()
                .map(|file| OutputFile {
                    absolute: file.absolute,
                    relative: file.relative,
                })
                .collect(),
            Err(err) => {
                log::warn!("Skipping cache write for {}: {err}", config.reference);
                return;
            }
        };
        match cache
            .set(&config.reference, fingerprint.digest(), files)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                log::debug!("Cache declined to store {}", config.reference);
            }
            Err(err) => {
                log::warn!("Cache write failed for {}: {err}", config.reference);
            }
        }
    }

    async fn run_service(
        &self,
        config: &ScriptConfig,
        fingerprint: Fingerprint,
        state_tx: watch::Sender<ServiceState>,
    ) -> Outcome {
        let key = config.key();

        // Adoption decision: a previous iteration's child keeps running when
        // the fingerprint is unchanged, otherwise it is stopped first.
        let adoptee = {
            let mut adoptees = self.inner.adoptees.lock().expect("adoptee lock");
            adoptees.remove(&key)
        };
        let adopted = match adoptee {
            Some(adoptee) if adoptee.fingerprint == fingerprint => Some(adoptee.child),
            Some(mut adoptee) => {
                // Stale adoptee: its configuration changed, so it stops here
                // and the service task spawns a replacement from `unstarted`.
                state_tx.send_replace(ServiceState::StoppingAdoptee);
                adoptee.child.kill_and_wait().await;
                self.emit(&config.reference, EventKind::ServiceStopped);
                None
            }
            None => None,
        };

        let mut upstreams = Vec::new();
        for dependency in &config.dependencies {
            let is_service = self
                .inner
                .graph
                .get(&dependency.target)
                .is_some_and(ScriptConfig::is_service);
            if !is_service {
                continue;
            }
            let handle = {
                let services = self.inner.services.lock().expect("service map lock");
                services.get(&dependency.target).cloned()
            };
            if let Some(handle) = handle {
                upstreams.push(handle);
            }
        }

        let persistent = self.inner.persistent.contains(&key);
        let handle = ServiceTask {
            config: config.clone(),
            fingerprint: fingerprint.clone(),
            persistent,
            adopted,
            upstreams,
            events: self.inner.events.clone(),
            failures: self.inner.bus.clone(),
            abort: self.inner.abort.clone(),
        }
        .spawn(state_tx);

        self.inner
            .services
            .lock()
            .expect("service map lock")
            .insert(key, handle.clone());

        if persistent {
            handle.start();
            if let Err(reason) = handle.wait_started().await {
                return Outcome::Failure { reason };
            }
        }

        Outcome::Success {
            fingerprint,
            kind: SuccessKind::Service,
        }
    }

    fn emit(&self, script: &ScriptReference, kind: EventKind) {
        let _ = self
            .inner
            .events
            .send(ExecutionEvent::new(script.clone(), kind));
    }

    fn fail(&self, config: &ScriptConfig, reason: FailureReason) -> Outcome {
        self.emit(
            &config.reference,
            EventKind::Failed {
                code: reason.as_code(),
            },
        );
        self.inner
            .bus
            .record(Failure::new(config.reference.clone(), reason.clone()));
        Outcome::Failure { reason }
    }
}

fn release_all(handles: &[ServiceHandle]) {
    for handle in handles {
        handle.release();
    }
}

/// Services that must keep running after the build settles: those reachable
/// from the root without passing through a one-shot script (a one-shot's
/// service dependencies live only as long as that run).
fn persistent_services(graph: &BuildGraph) -> HashSet<ScriptKey> {
    let mut persistent = HashSet::new();
    let mut queue = vec![graph.root_key().clone()];
    let mut seen: HashSet<ScriptKey> = queue.iter().cloned().collect();
    while let Some(key) = queue.pop() {
        let Some(config) = graph.get(&key) else {
            continue;
        };
        match config.kind {
            ScriptKind::OneShot { .. } => continue,
            ScriptKind::Service { .. } => {
                persistent.insert(key.clone());
            }
            ScriptKind::NoCommand => {}
        }
        for dependency in &config.dependencies {
            if seen.insert(dependency.target.clone()) {
                queue.push(dependency.target.clone());
            }
        }
    }
    persistent
}
