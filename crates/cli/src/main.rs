//! The `wireit` command.

mod render;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tokio::sync::{broadcast, watch};
use wireit_analyzer::Analyzer;
use wireit_cache::{Cache, CacheSelection};
use wireit_executor::{Executor, ExecutorOptions, FailureMode, WorkerPool};
use wireit_manifest::ManifestReader;
use wireit_protocol::{Diagnostic, DiagnosticKind, EventKind, ExecutionEvent, ScriptReference};
use wireit_watcher::{Watcher, WatcherOptions};

#[derive(Parser, Debug)]
#[command(
    name = "wireit",
    version,
    about = "Dependency-aware, incremental script running for package.json"
)]
struct Args {
    /// Script to run; defaults to the npm lifecycle event when launched
    /// through a package script.
    script: Option<String>,

    /// Re-run whenever input files or manifests change.
    #[arg(long)]
    watch: bool,

    /// Maximum concurrently running commands (a number or "infinity");
    /// overrides WIREIT_PARALLEL.
    #[arg(long, value_name = "N")]
    parallel: Option<String>,

    /// Reaction to a script failure: no-new, continue, or kill; overrides
    /// WIREIT_FAILURES.
    #[arg(long, value_name = "MODE")]
    failures: Option<String>,

    /// Extra arguments appended to the root script's command.
    #[arg(last = true)]
    extra_args: Vec<String>,
}

#[derive(Default)]
struct RunCounts {
    fresh: usize,
    cached: usize,
    ran: usize,
}

fn main() -> anyhow::Result<()> {
    use anyhow::Context;
    let runtime =
        tokio::runtime::Runtime::new().context("failed to start the async runtime")?;
    let code = runtime.block_on(run());
    // Leave time for final log lines to flush through stderr.
    runtime.shutdown_timeout(Duration::from_secs(1));
    std::process::exit(code);
}

async fn run() -> i32 {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .init();

    let args = Args::parse();

    let Some(script_name) = args
        .script
        .clone()
        .or_else(|| std::env::var("npm_lifecycle_event").ok())
    else {
        let diagnostic = Diagnostic::bare(
            DiagnosticKind::LaunchedIncorrectly,
            "No script to run: pass a script name, or launch wireit from a package script",
        );
        eprintln!("{}", render::render(&diagnostic));
        return 1;
    };

    let package_dir = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("error: cannot determine working directory: {err}");
            return 1;
        }
    };

    let pool = match parallel_limit(args.parallel.as_deref()) {
        Ok(limit) => WorkerPool::new(limit),
        Err(message) => {
            let diagnostic = Diagnostic::bare(DiagnosticKind::InvalidUsage, message);
            eprintln!("{}", render::render(&diagnostic));
            return 1;
        }
    };

    let failure_mode = {
        let value = args
            .failures
            .clone()
            .or_else(|| std::env::var("WIREIT_FAILURES").ok());
        match value.as_deref().map(FailureMode::parse).transpose() {
            Ok(mode) => mode.unwrap_or_default(),
            Err(message) => {
                let diagnostic = Diagnostic::bare(DiagnosticKind::InvalidUsage, message);
                eprintln!("{}", render::render(&diagnostic));
                return 1;
            }
        }
    };

    let cache = match CacheSelection::from_env() {
        Ok(selection) => Cache::from_selection(selection).map(Arc::new),
        Err(message) => {
            let diagnostic = Diagnostic::bare(DiagnosticKind::InvalidUsage, message);
            eprintln!("{}", render::render(&diagnostic));
            return 1;
        }
    };

    let root = ScriptReference::new(package_dir, script_name);
    let (abort_tx, abort_rx) = watch::channel(false);
    spawn_interrupt_handler(abort_tx);

    if args.watch {
        let watcher = Arc::new(Watcher::new(
            root,
            args.extra_args.clone(),
            WatcherOptions {
                pool,
                cache,
                failure_mode,
                debounce: Duration::from_millis(100),
                abort: abort_rx,
            },
        ));
        spawn_event_printer(watcher.events(), None);
        return match watcher.watch().await {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("error: {err}");
                1
            }
        };
    }

    let analyzer = Analyzer::new(Arc::new(ManifestReader::new()));
    let analysis = match analyzer.analyze(root, &args.extra_args).await {
        Ok(analysis) => analysis,
        Err(diagnostics) => {
            for diagnostic in &diagnostics {
                eprintln!("{}", render::render(diagnostic));
            }
            return 1;
        }
    };
    for warning in &analysis.warnings {
        eprintln!("{}", render::render(warning));
    }

    let executor = Executor::new(
        analysis.graph.clone(),
        ExecutorOptions {
            pool,
            cache,
            failure_mode,
            abort: abort_rx,
            adoptees: Default::default(),
        },
    );
    let counts = Arc::new(Mutex::new(RunCounts::default()));
    spawn_event_printer(executor.events(), Some(counts.clone()));

    match executor.execute().await {
        Err(failures) => {
            for failure in &failures {
                eprintln!("❌ {failure}");
            }
            executor.stop_services().await;
            1
        }
        Ok(_) => {
            print_summary(&counts);
            wait_for_services(&executor).await
        }
    }
}

/// With a persistent service running, stay alive until the services stop
/// (via Ctrl-C abort or their own failure).
async fn wait_for_services(executor: &Executor) -> i32 {
    let services: Vec<_> = executor
        .services()
        .into_iter()
        .filter(|handle| !handle.state().is_terminal())
        .collect();
    if services.is_empty() {
        return 0;
    }
    log::info!(
        "{} service(s) running; press Ctrl-C to stop",
        services.len()
    );
    let mut code = 0;
    for handle in &services {
        if handle.wait_terminated().await.is_err() {
            code = 1;
        }
    }
    code
}

fn print_summary(counts: &Arc<Mutex<RunCounts>>) {
    let counts = counts.lock().expect("summary counter lock");
    let executed = counts.fresh + counts.cached + counts.ran;
    if executed == 0 {
        return;
    }
    let skipped = counts.fresh + counts.cached;
    let percent = skipped as f64 / executed as f64 * 100.0;
    log::info!(
        "Ran {} script(s), skipped {} ({percent:.1}% incremental)",
        counts.ran,
        skipped
    );
}

fn parallel_limit(arg: Option<&str>) -> Result<Option<usize>, String> {
    let value = match arg {
        Some(value) => Some(value.to_string()),
        None => std::env::var("WIREIT_PARALLEL").ok(),
    };
    match value.as_deref() {
        None => Ok(Some(WorkerPool::default_limit())),
        Some("infinity") => Ok(None),
        Some(raw) => match raw.parse::<usize>() {
            Ok(n) if n > 0 => Ok(Some(n)),
            _ => Err(format!(
                "WIREIT_PARALLEL must be a positive integer or \"infinity\"; got {raw:?}"
            )),
        },
    }
}

/// First Ctrl-C requests a cooperative abort; the second exits immediately.
fn spawn_interrupt_handler(abort: watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted; stopping (press Ctrl-C again to force-exit)");
            let _ = abort.send(true);
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

/// Forward execution events to the terminal: child output verbatim, state
/// changes as log lines.
fn spawn_event_printer(
    mut events: broadcast::Receiver<ExecutionEvent>,
    counts: Option<Arc<Mutex<RunCounts>>>,
) {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Dropped {skipped} output line(s)");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let name = &event.script.name;
            match event.kind {
                EventKind::Output { stderr: false, line } => println!("[{name}] {line}"),
                EventKind::Output { stderr: true, line } => eprintln!("[{name}] {line}"),
                EventKind::Fresh => {
                    bump(&counts, |c| c.fresh += 1);
                    log::info!("✓ [{name}] already fresh");
                }
                EventKind::Cached => {
                    bump(&counts, |c| c.cached += 1);
                    log::info!("✓ [{name}] restored from cache");
                }
                EventKind::ExitZero => {
                    bump(&counts, |c| c.ran += 1);
                    log::info!("✓ [{name}] executed successfully");
                }
                EventKind::Spawned => log::debug!("[{name}] running"),
                EventKind::ServiceStarted => log::info!("[{name}] service started"),
                EventKind::ServiceAdopted => {
                    log::info!("[{name}] service unchanged, adopted without restart");
                }
                EventKind::ServiceStopped => log::info!("[{name}] service stopped"),
                EventKind::Failed { code } => log::error!("[{name}] failed ({code})"),
            }
        }
    });
}

fn bump(counts: &Option<Arc<Mutex<RunCounts>>>, apply: impl FnOnce(&mut RunCounts)) {
    if let Some(counts) = counts {
        apply(&mut counts.lock().expect("summary counter lock"));
    }
}
