use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use wireit_protocol::ScriptReference;

use crate::{CacheError, CacheHit, OutputFile};

const MANIFEST_NAME: &str = "manifest.json";
const FILES_SUBDIR: &str = "files";

/// What one cache entry restores.
#[derive(Debug, Serialize, Deserialize)]
struct EntryManifest {
    files: Vec<String>,
}

/// Content-addressed directory copies under each script's state dir.
///
/// Layout: `.wireit/<hex name>/cache/<fingerprint digest>/{manifest.json,
/// files/...}`. Reads are fail-safe: a corrupt or half-written entry is a
/// miss, not an error. Writes go through a temporary sibling directory and a
/// rename so a concurrent reader never observes a partial entry.
#[derive(Debug, Default)]
pub struct LocalCache {
    /// Trips on the first write failure that indicates the backing storage
    /// is unusable, and never resets for the life of the process.
    down: AtomicBool,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_dir(script: &ScriptReference, digest: &str) -> PathBuf {
        script.state_dir().join("cache").join(digest)
    }

    pub(crate) async fn get(
        &self,
        script: &ScriptReference,
        digest: &str,
    ) -> Result<Option<CacheHit>, CacheError> {
        if self.down.load(Ordering::Relaxed) {
            return Ok(None);
        }
        let entry_dir = Self::entry_dir(script, digest);
        let manifest_path = entry_dir.join(MANIFEST_NAME);
        let bytes = match tokio::fs::read(&manifest_path).await {
            Ok(bytes) => bytes,
            Err(_) => return Ok(None),
        };
        let manifest: EntryManifest = match serde_json::from_slice(&bytes) {
            Ok(manifest) => manifest,
            Err(err) => {
                log::warn!(
                    "Ignoring corrupt cache entry {}: {err}",
                    manifest_path.display()
                );
                return Ok(None);
            }
        };
        Ok(Some(CacheHit {
            entry_dir: entry_dir.join(FILES_SUBDIR),
            package_dir: script.package_dir.clone(),
            files: manifest.files,
        }))
    }

    pub(crate) async fn set(
        &self,
        script: &ScriptReference,
        digest: &str,
        files: Vec<OutputFile>,
    ) -> Result<bool, CacheError> {
        if self.down.load(Ordering::Relaxed) {
            return Ok(false);
        }
        let entry_dir = Self::entry_dir(script, digest);
        if tokio::fs::try_exists(&entry_dir).await.unwrap_or(false) {
            return Ok(true);
        }

        let parent = entry_dir
            .parent()
            .expect("cache entry dir has a parent")
            .to_path_buf();
        if let Err(err) = tokio::fs::create_dir_all(&parent).await {
            log::warn!(
                "Cache storage is unavailable ({}): {err}; disabling caching for this process",
                parent.display()
            );
            self.down.store(true, Ordering::Relaxed);
            return Ok(false);
        }

        let staging = parent.join(format!(".tmp-{digest}"));
        let result = write_entry(&staging, &files).await;
        match result {
            Ok(()) => {
                match tokio::fs::rename(&staging, &entry_dir).await {
                    Ok(()) => Ok(true),
                    Err(_) => {
                        // Lost a race with another writer of the same digest;
                        // the surviving entry has identical contents.
                        let _ = tokio::fs::remove_dir_all(&staging).await;
                        Ok(true)
                    }
                }
            }
            Err(err) => {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                log::warn!("Failed to write cache entry for {script}: {err}");
                Ok(false)
            }
        }
    }
}

async fn write_entry(staging: &Path, files: &[OutputFile]) -> Result<(), CacheError> {
    let files_dir = staging.join(FILES_SUBDIR);
    let manifest = EntryManifest {
        files: files.iter().map(|file| file.relative.clone()).collect(),
    };
    let staging = staging.to_path_buf();
    let files = files.to_vec();
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&files_dir).map_err(|source| CacheError::Io {
            path: files_dir.clone(),
            source,
        })?;
        for file in &files {
            let to = files_dir.join(&file.relative);
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent).map_err(|source| CacheError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            std::fs::copy(&file.absolute, &to).map_err(|source| CacheError::Io {
                path: file.absolute.clone(),
                source,
            })?;
        }
        let manifest_path = staging.join(MANIFEST_NAME);
        let bytes = serde_json::to_vec(&manifest).expect("manifest serializes");
        std::fs::write(&manifest_path, bytes).map_err(|source| CacheError::Io {
            path: manifest_path,
            source,
        })?;
        Ok(())
    })
    .await
    .expect("cache write task does not panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Cache;

    fn output(package_dir: &Path, relative: &str) -> OutputFile {
        OutputFile {
            absolute: package_dir.join(relative),
            relative: relative.to_string(),
        }
    }

    #[tokio::test]
    async fn round_trips_output_files() {
        let temp = tempfile::tempdir().unwrap();
        let script = ScriptReference::new(temp.path().to_path_buf(), "build");
        std::fs::create_dir_all(temp.path().join("lib")).unwrap();
        std::fs::write(temp.path().join("lib/a.js"), b"compiled").unwrap();

        let cache = Cache::Local(LocalCache::new());
        let stored = cache
            .set(&script, "digest-1", vec![output(temp.path(), "lib/a.js")])
            .await
            .unwrap();
        assert!(stored);

        // Delete the original and restore from cache.
        std::fs::remove_file(temp.path().join("lib/a.js")).unwrap();
        let hit = cache.get(&script, "digest-1").await.unwrap().unwrap();
        assert_eq!(hit.files(), ["lib/a.js"]);
        hit.apply().await.unwrap();
        assert_eq!(
            std::fs::read(temp.path().join("lib/a.js")).unwrap(),
            b"compiled"
        );
    }

    #[tokio::test]
    async fn missing_entry_is_a_miss() {
        let temp = tempfile::tempdir().unwrap();
        let script = ScriptReference::new(temp.path().to_path_buf(), "build");
        let cache = Cache::Local(LocalCache::new());
        assert!(cache.get(&script, "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_manifest_is_a_miss() {
        let temp = tempfile::tempdir().unwrap();
        let script = ScriptReference::new(temp.path().to_path_buf(), "build");
        let entry = LocalCache::entry_dir(&script, "bad");
        std::fs::create_dir_all(&entry).unwrap();
        std::fs::write(entry.join(MANIFEST_NAME), b"not json").unwrap();

        let cache = Cache::Local(LocalCache::new());
        assert!(cache.get(&script, "bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_set_with_same_digest_is_a_noop() {
        let temp = tempfile::tempdir().unwrap();
        let script = ScriptReference::new(temp.path().to_path_buf(), "build");
        std::fs::write(temp.path().join("out.txt"), b"v1").unwrap();

        let cache = Cache::Local(LocalCache::new());
        assert!(cache
            .set(&script, "d", vec![output(temp.path(), "out.txt")])
            .await
            .unwrap());

        // Same digest means same bytes by construction; the entry stays.
        std::fs::write(temp.path().join("out.txt"), b"v2").unwrap();
        assert!(cache
            .set(&script, "d", vec![output(temp.path(), "out.txt")])
            .await
            .unwrap());

        std::fs::remove_file(temp.path().join("out.txt")).unwrap();
        let hit = cache.get(&script, "d").await.unwrap().unwrap();
        hit.apply().await.unwrap();
        assert_eq!(std::fs::read(temp.path().join("out.txt")).unwrap(), b"v1");
    }

    #[tokio::test]
    async fn missing_source_file_declines_without_latching() {
        let temp = tempfile::tempdir().unwrap();
        let script = ScriptReference::new(temp.path().to_path_buf(), "build");
        let cache = Cache::Local(LocalCache::new());

        let stored = cache
            .set(&script, "d", vec![output(temp.path(), "ghost.txt")])
            .await
            .unwrap();
        assert!(!stored);

        // A later valid write still works: the latch only trips when the
        // cache storage itself is unusable.
        std::fs::write(temp.path().join("real.txt"), b"x").unwrap();
        assert!(cache
            .set(&script, "d2", vec![output(temp.path(), "real.txt")])
            .await
            .unwrap());
    }
}
