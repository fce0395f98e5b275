//! Per-script on-disk state: the fingerprint file and the clean policy.

use std::collections::BTreeSet;
use std::path::PathBuf;

use wireit_analyzer::ScriptConfig;
use wireit_fingerprint::Fingerprint;
use wireit_fs::expand_globs;
use wireit_protocol::ScriptReference;

const FINGERPRINT_FILE: &str = "fingerprint";
const LOG_FILE: &str = "last-run.log";

fn fingerprint_path(script: &ScriptReference) -> PathBuf {
    script.state_dir().join(FINGERPRINT_FILE)
}

/// Where the last run's child output is recorded.
pub fn log_path(script: &ScriptReference) -> PathBuf {
    script.state_dir().join(LOG_FILE)
}

/// Truncate the last-run log ahead of a new spawn.
pub async fn reset_log(script: &ScriptReference) {
    match tokio::fs::remove_file(log_path(script)).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => log::warn!("Could not reset last-run log for {script}: {err}"),
    }
}

/// The fingerprint recorded by the last successful run, if any. Unreadable
/// or unparsable state is treated as "no previous run".
pub async fn read_previous_fingerprint(script: &ScriptReference) -> Option<Fingerprint> {
    let path = fingerprint_path(script);
    let contents = tokio::fs::read_to_string(&path).await.ok()?;
    match Fingerprint::parse(&contents) {
        Ok(fingerprint) => Some(fingerprint),
        Err(err) => {
            log::warn!("Ignoring unreadable fingerprint file {}: {err}", path.display());
            None
        }
    }
}

pub async fn write_fingerprint(
    script: &ScriptReference,
    fingerprint: &Fingerprint,
) -> std::io::Result<()> {
    let path = fingerprint_path(script);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, fingerprint.canonical()).await
}

/// Deleted before every spawn so an interrupted build can never be mistaken
/// for a fresh one.
pub async fn delete_fingerprint(script: &ScriptReference) -> std::io::Result<()> {
    match tokio::fs::remove_file(fingerprint_path(script)).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Whether the `if-file-deleted` clean policy should fire: the previous run
/// saw an input file that no longer exists.
pub fn input_file_was_deleted(previous: &Fingerprint, current: &Fingerprint) -> bool {
    let current_files: BTreeSet<&str> = current.input_files().collect();
    previous
        .input_files()
        .any(|path| !current_files.contains(path))
}

/// Delete everything matching the script's output globs, then prune
/// directories that the deletions emptied. Returns the number of files
/// removed.
pub async fn clean_output(config: &ScriptConfig) -> Result<usize, wireit_fs::GlobError> {
    let Some(patterns) = config.output.clone() else {
        return Ok(0);
    };
    if patterns.is_empty() {
        return Ok(0);
    }
    let package_dir = config.reference.package_dir.clone();
    tokio::task::spawn_blocking(move || {
        let matched = expand_globs(&package_dir, &patterns)?;
        let mut parents: BTreeSet<PathBuf> = BTreeSet::new();
        let mut removed = 0usize;
        for file in &matched {
            if std::fs::remove_file(&file.absolute).is_ok() {
                removed += 1;
            }
            let mut dir = file.absolute.parent();
            while let Some(current) = dir {
                if current == package_dir.as_path() {
                    break;
                }
                parents.insert(current.to_path_buf());
                dir = current.parent();
            }
        }
        // Deepest first, so nested empty directories collapse upward.
        for dir in parents.iter().rev() {
            // Only empty directories are removed; this fails harmlessly on
            // non-empty ones.
            let _ = std::fs::remove_dir(dir);
        }
        Ok(removed)
    })
    .await
    .expect("clean task does not panic")
}
