use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use wireit_protocol::PackageReference;

use crate::package::PackageJson;

/// Why a manifest could not be turned into a [`PackageJson`].
#[derive(Debug, Clone)]
pub enum ManifestFailure {
    /// The file does not exist (or could not be read).
    Missing { path: PathBuf, message: String },
    /// The file exists but is not valid JSON.
    Syntax {
        path: Arc<PathBuf>,
        contents: Arc<str>,
        offset: usize,
        message: String,
    },
}

type ManifestResult = Result<Arc<PackageJson>, ManifestFailure>;
type Entry = Arc<OnceCell<ManifestResult>>;

/// Async `package.json` cache keyed by package directory.
///
/// Each directory is read at most once per reader generation; concurrent
/// requests for the same directory share the in-flight read. The watcher
/// calls [`ManifestReader::invalidate`] when a manifest changes on disk so
/// the next analysis re-reads it.
#[derive(Default)]
pub struct ManifestReader {
    entries: Mutex<HashMap<PathBuf, Entry>>,
}

impl ManifestReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read and parse the manifest of `package`, going to disk at most once.
    pub async fn read(&self, package: &PackageReference) -> ManifestResult {
        let cell = {
            let mut entries = self.entries.lock().expect("manifest cache lock");
            entries
                .entry(package.package_dir.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        cell.get_or_init(|| load(package.manifest_path()))
            .await
            .clone()
    }

    /// Drop the cached manifest for one package directory.
    pub fn invalidate(&self, package_dir: &Path) {
        let mut entries = self.entries.lock().expect("manifest cache lock");
        entries.remove(package_dir);
    }

    /// Drop everything. Used when the watcher cannot tell which manifest
    /// changed.
    pub fn invalidate_all(&self) {
        let mut entries = self.entries.lock().expect("manifest cache lock");
        entries.clear();
    }

    /// Manifest file paths read so far. The watcher watches these.
    pub fn manifest_paths(&self) -> Vec<PathBuf> {
        let entries = self.entries.lock().expect("manifest cache lock");
        entries
            .keys()
            .map(|dir| dir.join("package.json"))
            .collect()
    }
}

async fn load(path: PathBuf) -> ManifestResult {
    let contents = match tokio::fs::read_to_string(&path).await {
        Ok(contents) => contents,
        Err(err) => {
            return Err(ManifestFailure::Missing {
                path,
                message: err.to_string(),
            })
        }
    };
    match PackageJson::parse(path.clone(), contents.clone()) {
        Ok(package) => Ok(Arc::new(package)),
        Err(err) => Err(ManifestFailure::Syntax {
            path: Arc::new(path),
            contents: Arc::from(contents),
            offset: err.offset,
            message: err.message,
        }),
    }
}
