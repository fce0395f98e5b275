//! Output caching.
//!
//! The executor talks to one [`Cache`], selected from `WIREIT_CACHE`. A
//! backend stores the files matched by a script's output globs under the
//! fingerprint digest and can restore them byte-identically later. Backends
//! signal temporary refusal by returning `false` from `set`; unexpected
//! errors propagate.

mod local;

use std::path::PathBuf;

use thiserror::Error;
use wireit_protocol::ScriptReference;

pub use local::LocalCache;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("corrupt cache manifest at {path}: {source}")]
    CorruptManifest {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// A file to archive, named by its path relative to the package directory.
#[derive(Debug, Clone)]
pub struct OutputFile {
    pub absolute: PathBuf,
    pub relative: String,
}

/// A matching cache entry. Dropping it without calling
/// [`CacheHit::apply`] has no effect.
#[derive(Debug)]
pub struct CacheHit {
    entry_dir: PathBuf,
    package_dir: PathBuf,
    files: Vec<String>,
}

impl CacheHit {
    /// Restore the archived output files into the package directory.
    pub async fn apply(self) -> Result<(), CacheError> {
        let CacheHit {
            entry_dir,
            package_dir,
            files,
        } = self;
        tokio::task::spawn_blocking(move || {
            for relative in &files {
                let from = entry_dir.join(relative);
                let to = package_dir.join(relative);
                if let Some(parent) = to.parent() {
                    std::fs::create_dir_all(parent).map_err(|source| CacheError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
                std::fs::copy(&from, &to).map_err(|source| CacheError::Io {
                    path: from.clone(),
                    source,
                })?;
            }
            Ok(())
        })
        .await
        .expect("cache restore task does not panic")
    }

    /// Relative paths this hit would restore.
    pub fn files(&self) -> &[String] {
        &self.files
    }
}

/// Which backend `WIREIT_CACHE` selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSelection {
    Local,
    Github,
    None,
}

impl CacheSelection {
    /// Parse the `WIREIT_CACHE` value. The default is `none` on CI and
    /// `local` otherwise.
    pub fn from_env_values(
        cache_value: Option<&str>,
        ci_value: Option<&str>,
    ) -> Result<Self, String> {
        match cache_value {
            Some("local") => Ok(CacheSelection::Local),
            Some("github") => Ok(CacheSelection::Github),
            Some("none") => Ok(CacheSelection::None),
            Some(other) => Err(format!(
                "WIREIT_CACHE must be one of local, github, none; got {other:?}"
            )),
            None => {
                if ci_value == Some("true") {
                    Ok(CacheSelection::None)
                } else {
                    Ok(CacheSelection::Local)
                }
            }
        }
    }

    pub fn from_env() -> Result<Self, String> {
        let cache = std::env::var("WIREIT_CACHE").ok();
        let ci = std::env::var("CI").ok();
        Self::from_env_values(cache.as_deref(), ci.as_deref())
    }
}

/// The cache the executor uses, behind one concrete dispatch point.
#[derive(Debug)]
pub enum Cache {
    Local(LocalCache),
}

impl Cache {
    /// Build a cache from the environment selection. `Github` is handled by
    /// an external collaborator; selecting it here logs a warning and
    /// disables caching.
    pub fn from_selection(selection: CacheSelection) -> Option<Self> {
        match selection {
            CacheSelection::Local => Some(Cache::Local(LocalCache::new())),
            CacheSelection::Github => {
                log::warn!(
                    "WIREIT_CACHE=github is not available in this build; caching is disabled"
                );
                None
            }
            CacheSelection::None => None,
        }
    }

    /// Look up the entry for `fingerprint_digest`.
    pub async fn get(
        &self,
        script: &ScriptReference,
        fingerprint_digest: &str,
    ) -> Result<Option<CacheHit>, CacheError> {
        match self {
            Cache::Local(local) => local.get(script, fingerprint_digest).await,
        }
    }

    /// Archive `files` under `fingerprint_digest`. Returns `false` when the
    /// backend declined (temporarily or because its outage latch tripped).
    pub async fn set(
        &self,
        script: &ScriptReference,
        fingerprint_digest: &str,
        files: Vec<OutputFile>,
    ) -> Result<bool, CacheError> {
        match self {
            Cache::Local(local) => local.set(script, fingerprint_digest, files).await,
        }
    }
}
