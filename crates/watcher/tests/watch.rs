use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;
use wireit_executor::{FailureMode, WorkerPool};
use wireit_protocol::{EventKind, ExecutionEvent, ScriptReference};
use wireit_watcher::{WatchState, Watcher, WatcherOptions};

const DEV_MANIFEST: &str = r#"{
    "scripts": {"dev": "wireit", "serve": "wireit", "b": "wireit"},
    "wireit": {
        "dev": {"dependencies": ["serve", "b"]},
        "serve": {
            "command": "echo up; sleep 30",
            "service": {"readyWhen": {"lineMatches": "up"}},
            "files": ["serve.conf"],
            "packageLocks": []
        },
        "b": {
            "command": "echo ran >> b.log",
            "files": ["b.in"],
            "output": [],
            "packageLocks": []
        }
    }
}"#;

fn write_fixture(dir: &Path) {
    std::fs::write(dir.join("package.json"), DEV_MANIFEST).unwrap();
    std::fs::write(dir.join("serve.conf"), "port=8000").unwrap();
    std::fs::write(dir.join("b.in"), "v1").unwrap();
}

struct Session {
    watcher: Arc<Watcher>,
    abort: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<Result<(), wireit_watcher::WatchError>>,
}

fn start(dir: &Path, script: &str) -> Session {
    let (abort, abort_rx) = watch::channel(false);
    let watcher = Arc::new(Watcher::new(
        ScriptReference::new(dir.to_path_buf(), script),
        Vec::new(),
        WatcherOptions {
            pool: WorkerPool::new(Some(4)),
            cache: None,
            failure_mode: FailureMode::NoNew,
            debounce: Duration::from_millis(100),
            abort: abort_rx,
        },
    ));
    let handle = tokio::spawn({
        let watcher = watcher.clone();
        async move { watcher.watch().await }
    });
    Session {
        watcher,
        abort,
        handle,
    }
}

async fn wait_for_event(
    events: &mut tokio::sync::broadcast::Receiver<ExecutionEvent>,
    predicate: impl Fn(&ExecutionEvent) -> bool,
) -> ExecutionEvent {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    panic!("event stream closed before the expected event")
                }
            }
        }
    })
    .await
    .expect("expected event within timeout")
}

async fn shut_down(session: Session) {
    session.abort.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), session.handle)
        .await
        .expect("watcher exits after abort")
        .unwrap()
        .unwrap();
}

fn line_count(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|text| text.lines().count())
        .unwrap_or(0)
}

#[cfg_attr(
    not(target_os = "linux"),
    ignore = "filesystem watcher latency is only reliable on Linux"
)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn input_change_triggers_a_rebuild() {
    let temp = TempDir::new().unwrap();
    write_fixture(temp.path());

    let session = start(temp.path(), "b");
    let mut events = session.watcher.events();

    wait_for_event(&mut events, |event| event.kind == EventKind::ExitZero).await;
    assert_eq!(line_count(&temp.path().join("b.log")), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    std::fs::write(temp.path().join("b.in"), "v2").unwrap();

    wait_for_event(&mut events, |event| event.kind == EventKind::ExitZero).await;
    assert_eq!(line_count(&temp.path().join("b.log")), 2);

    shut_down(session).await;
}

#[cfg_attr(
    not(target_os = "linux"),
    ignore = "filesystem watcher latency is only reliable on Linux"
)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn output_writes_do_not_retrigger_builds() {
    let temp = TempDir::new().unwrap();
    write_fixture(temp.path());

    let session = start(temp.path(), "b");
    let mut events = session.watcher.events();
    wait_for_event(&mut events, |event| event.kind == EventKind::ExitZero).await;

    // b.log is written by the build itself and is not an input; the watcher
    // must settle instead of looping.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(line_count(&temp.path().join("b.log")), 1);
    let mut states = session.watcher.states();
    assert_eq!(*states.borrow_and_update(), WatchState::Watching);

    shut_down(session).await;
}

// §8 scenario 5: an unrelated change leaves the service's fingerprint
// untouched, so the running child is adopted, not restarted.
#[cfg_attr(
    not(target_os = "linux"),
    ignore = "filesystem watcher latency is only reliable on Linux"
)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unchanged_service_is_adopted_across_iterations() {
    let temp = TempDir::new().unwrap();
    write_fixture(temp.path());

    let session = start(temp.path(), "dev");
    let mut events = session.watcher.events();

    wait_for_event(&mut events, |event| {
        event.kind == EventKind::ServiceStarted && event.script.name == "serve"
    })
    .await;

    // Edit a file that only affects script b.
    tokio::time::sleep(Duration::from_millis(300)).await;
    std::fs::write(temp.path().join("b.in"), "v2").unwrap();

    wait_for_event(&mut events, |event| {
        event.kind == EventKind::ServiceAdopted && event.script.name == "serve"
    })
    .await;

    // Exactly one service-started across both iterations.
    let mut extra_starts = 0;
    while let Ok(event) = events.try_recv() {
        if event.kind == EventKind::ServiceStarted && event.script.name == "serve" {
            extra_starts += 1;
        }
    }
    assert_eq!(extra_starts, 0);

    shut_down(session).await;
}

// §8 scenario 6: changing the service's command produces a new fingerprint;
// the old child stops and a new one starts.
#[cfg_attr(
    not(target_os = "linux"),
    ignore = "filesystem watcher latency is only reliable on Linux"
)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn changed_service_restarts() {
    let temp = TempDir::new().unwrap();
    write_fixture(temp.path());

    let session = start(temp.path(), "dev");
    let mut events = session.watcher.events();

    wait_for_event(&mut events, |event| {
        event.kind == EventKind::ServiceStarted && event.script.name == "serve"
    })
    .await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let changed = DEV_MANIFEST.replace("sleep 30", "sleep 31");
    std::fs::write(temp.path().join("package.json"), changed).unwrap();

    wait_for_event(&mut events, |event| {
        event.kind == EventKind::ServiceStopped && event.script.name == "serve"
    })
    .await;
    wait_for_event(&mut events, |event| {
        event.kind == EventKind::ServiceStarted && event.script.name == "serve"
    })
    .await;

    shut_down(session).await;
}
