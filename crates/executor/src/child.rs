//! Child processes for script commands.
//!
//! Commands run through `sh -c` from the script's package directory, with
//! the config's env overlay applied and extra arguments appended. Both
//! output streams are read line by line and forwarded onto the executor's
//! event stream; stdout lines additionally fan out to a broadcast channel so
//! the service lifecycle can watch for its readiness pattern.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc};
use wireit_analyzer::ScriptConfig;
use wireit_protocol::{EventKind, ExecutionEvent, FailureReason};

/// A spawned script command.
pub struct ScriptChild {
    child: Child,
    stdout_lines: broadcast::Sender<String>,
}

/// Append-only sink for the per-script last-run log.
async fn open_log(path: &std::path::Path) -> Option<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok()?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .ok()
}

impl std::fmt::Debug for ScriptChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptChild")
            .field("pid", &self.child.id())
            .finish()
    }
}

impl ScriptChild {
    /// Spawn the config's command. `events` receives one `Output` event per
    /// line of stdout or stderr; `log_path`, when set, additionally records
    /// the lines as the script's last-run log.
    pub fn spawn(
        config: &ScriptConfig,
        events: broadcast::Sender<ExecutionEvent>,
        log_path: Option<std::path::PathBuf>,
    ) -> Result<Self, FailureReason> {
        let command = config
            .command()
            .expect("only scripts with a command spawn children");
        let full_command = append_extra_args(command, &config.extra_args);

        let mut builder = Command::new("sh");
        builder
            .arg("-c")
            .arg(&full_command)
            .current_dir(&config.reference.package_dir)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = builder.spawn().map_err(|err| FailureReason::SpawnError {
            message: err.to_string(),
        })?;

        let (stdout_lines, _) = broadcast::channel(256);

        // A single writer owns the log file; both stream readers feed it
        // through one channel so concurrent stdout and stderr output cannot
        // interleave mid-line.
        let log_tx = log_path.map(|path| {
            let (tx, mut rx) = mpsc::channel::<String>(256);
            tokio::spawn(async move {
                let Some(mut log) = open_log(&path).await else {
                    return;
                };
                while let Some(line) = rx.recv().await {
                    let mut buffer = line.into_bytes();
                    buffer.push(b'\n');
                    let _ = log.write_all(&buffer).await;
                }
            });
            tx
        });

        if let Some(stdout) = child.stdout.take() {
            let events = events.clone();
            let script = config.reference.clone();
            let lines_tx = stdout_lines.clone();
            let log_tx = log_tx.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if let Some(log) = &log_tx {
                        let _ = log.send(line.clone()).await;
                    }
                    let _ = lines_tx.send(line.clone());
                    let _ = events.send(ExecutionEvent::new(
                        script.clone(),
                        EventKind::Output {
                            stderr: false,
                            line,
                        },
                    ));
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let events = events.clone();
            let script = config.reference.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if let Some(log) = &log_tx {
                        let _ = log.send(line.clone()).await;
                    }
                    let _ = events.send(ExecutionEvent::new(
                        script.clone(),
                        EventKind::Output { stderr: true, line },
                    ));
                }
            });
        }

        Ok(Self {
            child,
            stdout_lines,
        })
    }

    /// Subscribe to stdout lines (used for readiness matching).
    pub fn subscribe_stdout(&self) -> broadcast::Receiver<String> {
        self.stdout_lines.subscribe()
    }

    /// Wait for the child to exit on its own, mapping the status onto a
    /// failure reason when it was unsuccessful.
    pub async fn wait(&mut self) -> Result<(), FailureReason> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|err| FailureReason::UnknownErrorThrown {
                message: format!("failed to await child: {err}"),
            })?;
        status_to_result(status)
    }

    /// Begin killing the child without waiting for it to exit.
    pub fn start_kill(&mut self) {
        let _ = self.child.start_kill();
    }

    /// Kill the child and wait until it is gone.
    pub async fn kill_and_wait(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

fn status_to_result(status: std::process::ExitStatus) -> Result<(), FailureReason> {
    if status.success() {
        return Ok(());
    }
    if let Some(code) = status.code() {
        return Err(FailureReason::ExitNonZero { code });
    }
    Err(FailureReason::Signal {
        signal: signal_name(&status),
    })
}

#[cfg(unix)]
fn signal_name(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(2) => "SIGINT".to_string(),
        Some(9) => "SIGKILL".to_string(),
        Some(15) => "SIGTERM".to_string(),
        Some(n) => format!("signal {n}"),
        None => "unknown signal".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_name(_status: &std::process::ExitStatus) -> String {
    "unknown signal".to_string()
}

/// Append extra arguments to the shell command, quoted so they arrive as
/// single arguments.
fn append_extra_args(command: &str, extra_args: &[String]) -> String {
    if extra_args.is_empty() {
        return command.to_string();
    }
    let mut full = String::from(command);
    for arg in extra_args {
        full.push(' ');
        full.push('\'');
        full.push_str(&arg.replace('\'', "'\\''"));
        full.push('\'');
    }
    full
}
