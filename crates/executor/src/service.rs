//! The per-service, per-executor lifecycle state machine.
//!
//! Services do not run to completion; they are started on demand by
//! consumers and stopped when no consumer needs them, on abort, or when the
//! executor hands off to a successor in watch mode. Termination resolves
//! exactly once in `stopped` or `failed`; `detached` leaves the child
//! running for the next executor to adopt.

use std::collections::HashMap;

use regex::Regex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use wireit_analyzer::ScriptConfig;
use wireit_fingerprint::Fingerprint;
use wireit_protocol::{
    EventKind, ExecutionEvent, Failure, FailureReason, ScriptKey, ScriptReference,
};

use crate::child::ScriptChild;
use crate::execute::FailureBus;

/// Observable lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Initial,
    ExecutingDeps,
    Fingerprinting,
    StoppingAdoptee,
    Unstarted,
    DepsStarting,
    Starting,
    Started,
    Stopping,
    Stopped,
    Failing,
    Failed,
    Detached,
}

impl ServiceState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ServiceState::Stopped | ServiceState::Failed | ServiceState::Detached
        )
    }
}

/// A running child handed from one executor iteration to the next.
#[derive(Debug)]
pub struct AdoptableService {
    pub fingerprint: Fingerprint,
    pub child: ScriptChild,
}

/// Services detached from a finished executor, keyed by script.
pub type ServiceMap = HashMap<ScriptKey, AdoptableService>;

enum Command {
    /// Register a consumer and start if not yet started.
    Start,
    /// A consumer is done with this service.
    Release,
    /// Stop now regardless of consumers.
    Stop,
    /// Hand the running child to a successor executor.
    Detach {
        reply: oneshot::Sender<Option<AdoptableService>>,
    },
}

type Terminated = Option<Result<(), FailureReason>>;

/// Shared handle to one service's state machine.
#[derive(Clone)]
pub struct ServiceHandle {
    reference: ScriptReference,
    fingerprint: Fingerprint,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ServiceState>,
    terminated: watch::Receiver<Terminated>,
}

impl ServiceHandle {
    pub fn reference(&self) -> &ScriptReference {
        &self.reference
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Register a consumer; the service starts on the first one.
    pub fn start(&self) {
        let _ = self.commands.send(Command::Start);
    }

    /// Balance one prior [`ServiceHandle::start`]. A service with no
    /// remaining consumers stops unless it is persistent.
    pub fn release(&self) {
        let _ = self.commands.send(Command::Release);
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    /// Detach the running child for adoption. `None` when there is nothing
    /// running to hand over.
    pub async fn detach(&self) -> Option<AdoptableService> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Detach { reply }).is_err() {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    /// Resolves once the service is `started`, or with the failure that
    /// prevented it.
    pub async fn wait_started(&self) -> Result<(), FailureReason> {
        let mut state = self.state.clone();
        let mut terminated = self.terminated.clone();
        loop {
            {
                let current = *state.borrow_and_update();
                if current == ServiceState::Started {
                    return Ok(());
                }
            }
            if let Some(result) = terminated.borrow_and_update().clone() {
                return match result {
                    Ok(()) => Err(FailureReason::StartCancelled),
                    Err(reason) => Err(reason),
                };
            }
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(FailureReason::StartCancelled);
                    }
                }
                changed = terminated.changed() => {
                    if changed.is_err() {
                        return Err(FailureReason::StartCancelled);
                    }
                }
            }
        }
    }

    /// Resolves when the service reaches `stopped` or `failed`. Detached
    /// services never resolve this; the successor executor owns them.
    pub async fn wait_terminated(&self) -> Result<(), FailureReason> {
        let mut terminated = self.terminated.clone();
        loop {
            if let Some(result) = terminated.borrow_and_update().clone() {
                return result;
            }
            if terminated.changed().await.is_err() {
                return Ok(());
            }
        }
    }
}

/// Everything the state machine task needs.
pub(crate) struct ServiceTask {
    pub config: ScriptConfig,
    pub fingerprint: Fingerprint,
    pub persistent: bool,
    pub adopted: Option<ScriptChild>,
    pub upstreams: Vec<ServiceHandle>,
    pub events: broadcast::Sender<ExecutionEvent>,
    pub failures: std::sync::Arc<FailureBus>,
    pub abort: watch::Receiver<bool>,
}

impl ServiceTask {
    /// Spawn the state machine and return its handle.
    ///
    /// The executor drives `initial` through `stopping-adoptee` on
    /// `state_tx` before calling this; the task takes over at `unstarted`.
    pub(crate) fn spawn(self, state_tx: watch::Sender<ServiceState>) -> ServiceHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (terminated_tx, terminated_rx) = watch::channel(None);
        let handle = ServiceHandle {
            reference: self.config.reference.clone(),
            fingerprint: self.fingerprint.clone(),
            commands: commands_tx,
            state: state_tx.subscribe(),
            terminated: terminated_rx,
        };
        tokio::spawn(run(self, state_tx, commands_rx, terminated_tx));
        handle
    }
}

struct Machine {
    task: ServiceTask,
    state_tx: watch::Sender<ServiceState>,
    terminated_tx: watch::Sender<Terminated>,
    consumers: usize,
}

async fn run(
    task: ServiceTask,
    state_tx: watch::Sender<ServiceState>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    terminated_tx: watch::Sender<Terminated>,
) {
    let mut machine = Machine {
        task,
        state_tx,
        terminated_tx,
        consumers: 0,
    };
    machine.run(&mut commands).await;
}

impl Machine {
    fn set_state(&self, state: ServiceState) {
        self.state_tx.send_replace(state);
    }

    fn emit(&self, kind: EventKind) {
        let _ = self
            .task
            .events
            .send(ExecutionEvent::new(self.task.config.reference.clone(), kind));
    }

    fn resolve_terminated(&self, result: Result<(), FailureReason>) {
        let _ = self.terminated_tx.send(Some(result));
    }

    fn release_upstreams(&self) {
        for upstream in &self.task.upstreams {
            upstream.release();
        }
    }

    async fn run(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) {
        self.set_state(ServiceState::Unstarted);
        if !self.unstarted_phase(commands).await {
            return;
        }
        if !self.deps_starting_phase().await {
            return;
        }
        let Some(child) = self.starting_phase().await else {
            return;
        };
        self.started_phase(commands, child).await;
    }

    /// Wait in `unstarted` for the first consumer. Returns false when the
    /// machine reached a terminal state instead.
    async fn unstarted_phase(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> bool {
        let mut abort = self.task.abort.clone();
        loop {
            tokio::select! {
                biased;
                _ = wait_flag(&mut abort) => {
                    self.stop_unstarted().await;
                    return false;
                }
                command = commands.recv() => match command {
                    None => {
                        self.stop_unstarted().await;
                        return false;
                    }
                    Some(Command::Start) => {
                        self.consumers += 1;
                        return true;
                    }
                    Some(Command::Release) => {
                        self.consumers = self.consumers.saturating_sub(1);
                    }
                    Some(Command::Stop) => {
                        self.stop_unstarted().await;
                        return false;
                    }
                    Some(Command::Detach { reply }) => {
                        // An adopted child that nobody started this
                        // iteration passes through to the next executor.
                        let adoptable = self.task.adopted.take().map(|child| AdoptableService {
                            fingerprint: self.task.fingerprint.clone(),
                            child,
                        });
                        self.set_state(ServiceState::Detached);
                        let _ = reply.send(adoptable);
                        return false;
                    }
                },
            }
        }
    }

    async fn stop_unstarted(&mut self) {
        if let Some(mut child) = self.task.adopted.take() {
            self.set_state(ServiceState::Stopping);
            child.kill_and_wait().await;
        }
        self.set_state(ServiceState::Stopped);
        self.resolve_terminated(Ok(()));
    }

    /// Start upstream services and wait for all of them.
    async fn deps_starting_phase(&mut self) -> bool {
        self.set_state(ServiceState::DepsStarting);
        for upstream in &self.task.upstreams {
            upstream.start();
        }
        for upstream in self.task.upstreams.clone() {
            if upstream.wait_started().await.is_err() {
                self.fail(FailureReason::DependencyServiceExitedUnexpectedly {
                    dependency: upstream.reference().clone(),
                })
                .await;
                return false;
            }
        }
        true
    }

    /// Spawn or adopt the child. Returns `None` on a terminal state.
    async fn starting_phase(&mut self) -> Option<ScriptChild> {
        self.set_state(ServiceState::Starting);

        if let Some(child) = self.task.adopted.take() {
            self.emit(EventKind::ServiceAdopted);
            self.set_state(ServiceState::Started);
            return Some(child);
        }

        crate::state::reset_log(&self.task.config.reference).await;
        let mut child = match ScriptChild::spawn(
            &self.task.config,
            self.task.events.clone(),
            Some(crate::state::log_path(&self.task.config.reference)),
        ) {
            Ok(child) => child,
            Err(reason) => {
                self.fail(reason).await;
                return None;
            }
        };

        let ready_pattern = match &self.task.config.kind {
            wireit_analyzer::ScriptKind::Service { ready_line, .. } => ready_line.clone(),
            _ => None,
        };
        if let Some(pattern) = ready_pattern {
            // Validated during analysis; an invalid pattern cannot get here.
            let regex = Regex::new(&pattern).expect("readiness pattern was validated");
            let mut lines = child.subscribe_stdout();
            let mut abort = self.task.abort.clone();
            enum Waited {
                Ready,
                Aborted,
                Exited,
            }
            let mut lines_open = true;
            loop {
                // The select resolves to a value first so the child can be
                // borrowed again afterwards.
                let waited = tokio::select! {
                    biased;
                    _ = wait_flag(&mut abort) => Waited::Aborted,
                    line = lines.recv(), if lines_open => match line {
                        Ok(line) if regex.is_match(&line) => Waited::Ready,
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {
                            // stdout ended without the pattern; wait for the
                            // exit arm from here on.
                            lines_open = false;
                            continue;
                        }
                    },
                    _ = child.wait() => Waited::Exited,
                };
                match waited {
                    Waited::Ready => break,
                    Waited::Aborted => {
                        self.set_state(ServiceState::Stopping);
                        child.kill_and_wait().await;
                        self.set_state(ServiceState::Stopped);
                        self.resolve_terminated(Ok(()));
                        self.release_upstreams();
                        return None;
                    }
                    Waited::Exited => {
                        self.fail(FailureReason::ServiceExitedUnexpectedly).await;
                        return None;
                    }
                }
            }
        }

        self.emit(EventKind::ServiceStarted);
        self.set_state(ServiceState::Started);
        Some(child)
    }

    async fn started_phase(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        mut child: ScriptChild,
    ) {
        // Watch upstream services; an unexpected upstream failure takes this
        // service down too.
        let (upstream_exit_tx, mut upstream_exit_rx) =
            mpsc::channel::<ScriptReference>(1);
        for upstream in self.task.upstreams.clone() {
            let tx = upstream_exit_tx.clone();
            tokio::spawn(async move {
                if upstream.wait_terminated().await.is_err() {
                    let _ = tx.send(upstream.reference().clone()).await;
                }
            });
        }
        drop(upstream_exit_tx);

        enum Step {
            Stop,
            Detach(oneshot::Sender<Option<AdoptableService>>),
            UpstreamFailed(ScriptReference),
            Exited,
        }

        let mut abort = self.task.abort.clone();
        loop {
            // The select resolves to a value first so the child can be
            // borrowed again afterwards.
            let step = tokio::select! {
                biased;
                _ = wait_flag(&mut abort) => Step::Stop,
                command = commands.recv() => match command {
                    None | Some(Command::Stop) => Step::Stop,
                    Some(Command::Start) => {
                        self.consumers += 1;
                        continue;
                    }
                    Some(Command::Release) => {
                        self.consumers = self.consumers.saturating_sub(1);
                        if self.consumers == 0 && !self.task.persistent {
                            Step::Stop
                        } else {
                            continue;
                        }
                    }
                    Some(Command::Detach { reply }) => Step::Detach(reply),
                },
                Some(dependency) = upstream_exit_rx.recv() => {
                    Step::UpstreamFailed(dependency)
                }
                _ = child.wait() => Step::Exited,
            };

            match step {
                Step::Stop => {
                    self.stop_child(&mut child).await;
                    return;
                }
                Step::Detach(reply) => {
                    self.set_state(ServiceState::Detached);
                    let _ = reply.send(Some(AdoptableService {
                        fingerprint: self.task.fingerprint.clone(),
                        child,
                    }));
                    return;
                }
                Step::UpstreamFailed(dependency) => {
                    self.set_state(ServiceState::Failing);
                    child.kill_and_wait().await;
                    self.fail(FailureReason::DependencyServiceExitedUnexpectedly {
                        dependency,
                    })
                    .await;
                    return;
                }
                Step::Exited => {
                    self.set_state(ServiceState::Failing);
                    self.fail(FailureReason::ServiceExitedUnexpectedly).await;
                    return;
                }
            }
        }
    }

    async fn stop_child(&mut self, child: &mut ScriptChild) {
        self.set_state(ServiceState::Stopping);
        child.kill_and_wait().await;
        self.set_state(ServiceState::Stopped);
        self.emit(EventKind::ServiceStopped);
        self.resolve_terminated(Ok(()));
        self.release_upstreams();
    }

    async fn fail(&mut self, reason: FailureReason) {
        self.set_state(ServiceState::Failed);
        self.emit(EventKind::Failed {
            code: reason.as_code(),
        });
        self.task.failures.record(Failure::new(
            self.task.config.reference.clone(),
            reason.clone(),
        ));
        self.resolve_terminated(Err(reason));
        self.release_upstreams();
    }
}

/// Resolves when the flag becomes true; never resolves if the sender is
/// gone.
pub(crate) async fn wait_flag(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}
