//! Content-addressed fingerprints.
//!
//! A fingerprint describes everything that could affect a script's output:
//! the host platform, the command and its arguments, the clean policy and
//! output globs, the environment overlay, a sorted hash of every declared
//! input file, and the fingerprints of cascading dependencies. Two runs with
//! equal fingerprints are interchangeable; that equality is what makes
//! freshness and caching sound.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wireit_analyzer::{Dependency, ScriptConfig, ScriptKind};
use wireit_fs::{expand_globs, ContentHash, GlobError};

/// The engine version participates in every fingerprint, so upgrading the
/// engine invalidates prior builds the same way upgrading the runtime did in
/// the reference implementation.
const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error(transparent)]
    Glob(#[from] GlobError),

    #[error("failed to hash {path}: {source}")]
    Hash {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ServiceData {
    ready_line: Option<String>,
}

/// The normalized record. Field order here is the canonical serialization
/// order and also the comparison order of [`Fingerprint::difference`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FingerprintData {
    platform: String,
    arch: String,
    engine_version: String,
    command: Option<String>,
    extra_args: Vec<String>,
    clean: String,
    output: Option<Vec<String>>,
    service: Option<ServiceData>,
    env: BTreeMap<String, String>,
    files: BTreeMap<String, String>,
    dependencies: BTreeMap<String, String>,
    fully_tracked: bool,
}

/// The first observed difference between two fingerprints, in a fixed check
/// order so "why did this re-run" messages are deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Difference {
    Platform,
    Arch,
    EngineVersion,
    Command,
    ExtraArgs,
    Clean,
    Output,
    ServiceConfig,
    EnvAdded { name: String },
    EnvRemoved { name: String },
    EnvChanged { name: String },
    FileAdded { path: String },
    FileRemoved { path: String },
    FileChanged { path: String },
    DependencyAdded { key: String },
    DependencyRemoved { key: String },
    DependencyChanged { key: String },
    TrackingChanged,
}

impl std::fmt::Display for Difference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Difference::Platform => f.write_str("the platform changed"),
            Difference::Arch => f.write_str("the CPU architecture changed"),
            Difference::EngineVersion => f.write_str("the engine version changed"),
            Difference::Command => f.write_str("the command changed"),
            Difference::ExtraArgs => f.write_str("the extra arguments changed"),
            Difference::Clean => f.write_str("the clean policy changed"),
            Difference::Output => f.write_str("the output globs changed"),
            Difference::ServiceConfig => f.write_str("the service configuration changed"),
            Difference::EnvAdded { name } => write!(f, "env variable {name} was added"),
            Difference::EnvRemoved { name } => write!(f, "env variable {name} was removed"),
            Difference::EnvChanged { name } => write!(f, "env variable {name} changed"),
            Difference::FileAdded { path } => write!(f, "input file {path} was added"),
            Difference::FileRemoved { path } => write!(f, "input file {path} was removed"),
            Difference::FileChanged { path } => write!(f, "input file {path} changed"),
            Difference::DependencyAdded { key } => write!(f, "dependency {key} was added"),
            Difference::DependencyRemoved { key } => write!(f, "dependency {key} was removed"),
            Difference::DependencyChanged { key } => write!(f, "dependency {key} changed"),
            Difference::TrackingChanged => f.write_str("input tracking changed"),
        }
    }
}

/// A computed fingerprint: the normalized record, its canonical JSON string,
/// and the sha256 digest of that string.
///
/// Equality is string equality of the canonical serialization.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    data: FingerprintData,
    canonical: String,
    digest: String,
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for Fingerprint {}

impl Fingerprint {
    fn from_data(data: FingerprintData) -> Self {
        let canonical =
            serde_json::to_string(&data).expect("fingerprint data always serializes");
        let digest = ContentHash::of_bytes(canonical.as_bytes()).into_string();
        Self {
            data,
            canonical,
            digest,
        }
    }

    /// Compute the fingerprint of `config`.
    ///
    /// `dependency_fingerprints` must hold one entry per dependency of the
    /// config; only edges with `cascade` set contribute to the record.
    pub async fn compute(
        config: &ScriptConfig,
        dependency_fingerprints: &[(&Dependency, &Fingerprint)],
    ) -> Result<Self, FingerprintError> {
        let mut dependencies = BTreeMap::new();
        let mut deps_fully_tracked = true;
        for (dependency, fingerprint) in dependency_fingerprints {
            if !dependency.cascade {
                continue;
            }
            if !fingerprint.fully_tracked() {
                deps_fully_tracked = false;
            }
            dependencies.insert(
                dependency.target.as_str().to_string(),
                fingerprint.digest().to_string(),
            );
        }

        let mut files = BTreeMap::new();
        if let Some(patterns) = &config.files {
            let matched = {
                let package_dir = config.reference.package_dir.clone();
                let patterns = patterns.clone();
                tokio::task::spawn_blocking(move || expand_globs(&package_dir, &patterns))
                    .await
                    .expect("glob expansion task does not panic")?
            };
            for file in matched {
                let hash = wireit_fs::hash_file(file.absolute.clone())
                    .await
                    .map_err(|source| FingerprintError::Hash {
                        path: file.relative.clone(),
                        source,
                    })?;
                files.insert(file.relative, hash.into_string());
            }
        }

        let self_fully_tracked = match &config.kind {
            // Groupers produce nothing, services produce no files: both are
            // tracked as long as their dependencies are.
            ScriptKind::NoCommand | ScriptKind::Service { .. } => true,
            ScriptKind::OneShot { .. } => config.files.is_some() && config.output.is_some(),
        };

        let service = match &config.kind {
            ScriptKind::Service { ready_line, .. } => Some(ServiceData {
                ready_line: ready_line.clone(),
            }),
            _ => None,
        };

        let data = FingerprintData {
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            engine_version: ENGINE_VERSION.to_string(),
            command: config.command().map(str::to_string),
            extra_args: config.extra_args.clone(),
            clean: config.clean.as_str().to_string(),
            output: config.output.clone(),
            service,
            env: config.env.clone(),
            files,
            dependencies,
            fully_tracked: deps_fully_tracked && self_fully_tracked,
        };
        Ok(Self::from_data(data))
    }

    /// The canonical serialization. This is what gets written to the
    /// fingerprint file and compared for freshness.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// sha256 of the canonical serialization; keys cache entries.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn fully_tracked(&self) -> bool {
        self.data.fully_tracked
    }

    /// Relative paths of the input files this fingerprint hashed, in sorted
    /// order. The `if-file-deleted` clean policy compares these across runs.
    pub fn input_files(&self) -> impl Iterator<Item = &str> {
        self.data.files.keys().map(String::as_str)
    }

    /// Parse a previously stored canonical serialization.
    pub fn parse(canonical: &str) -> Result<Self, serde_json::Error> {
        let data: FingerprintData = serde_json::from_str(canonical)?;
        // Re-serialize rather than trusting the input string, so equality
        // stays canonical even if the stored file was reformatted.
        Ok(Self::from_data(data))
    }

    /// The first difference from `previous`, checked in the fixed field
    /// order. `None` means the fingerprints are equal.
    pub fn difference(&self, previous: &Fingerprint) -> Option<Difference> {
        let a = &self.data;
        let b = &previous.data;
        if a.platform != b.platform {
            return Some(Difference::Platform);
        }
        if a.arch != b.arch {
            return Some(Difference::Arch);
        }
        if a.engine_version != b.engine_version {
            return Some(Difference::EngineVersion);
        }
        if a.command != b.command {
            return Some(Difference::Command);
        }
        if a.extra_args != b.extra_args {
            return Some(Difference::ExtraArgs);
        }
        if a.clean != b.clean {
            return Some(Difference::Clean);
        }
        if a.output != b.output {
            return Some(Difference::Output);
        }
        if a.service != b.service {
            return Some(Difference::ServiceConfig);
        }
        if let Some(difference) = map_difference(
            &a.env,
            &b.env,
            |name| Difference::EnvAdded { name },
            |name| Difference::EnvRemoved { name },
            |name| Difference::EnvChanged { name },
        ) {
            return Some(difference);
        }
        if let Some(difference) = map_difference(
            &a.files,
            &b.files,
            |path| Difference::FileAdded { path },
            |path| Difference::FileRemoved { path },
            |path| Difference::FileChanged { path },
        ) {
            return Some(difference);
        }
        if let Some(difference) = map_difference(
            &a.dependencies,
            &b.dependencies,
            |key| Difference::DependencyAdded { key },
            |key| Difference::DependencyRemoved { key },
            |key| Difference::DependencyChanged { key },
        ) {
            return Some(difference);
        }
        // Almost always implied by the fields above, but `files: None` and
        // `files: []` produce the same empty file map while tracking differs.
        if a.fully_tracked != b.fully_tracked {
            return Some(Difference::TrackingChanged);
        }
        None
    }
}

/// Added entries first, then removed, then changed, each in sorted key order.
fn map_difference(
    current: &BTreeMap<String, String>,
    previous: &BTreeMap<String, String>,
    added: impl Fn(String) -> Difference,
    removed: impl Fn(String) -> Difference,
    changed: impl Fn(String) -> Difference,
) -> Option<Difference> {
    for key in current.keys() {
        if !previous.contains_key(key) {
            return Some(added(key.clone()));
        }
    }
    for key in previous.keys() {
        if !current.contains_key(key) {
            return Some(removed(key.clone()));
        }
    }
    for (key, value) in current {
        if previous.get(key) != Some(value) {
            return Some(changed(key.clone()));
        }
    }
    None
}
