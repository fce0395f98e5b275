use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use wireit_manifest::PackageJson;
use wireit_protocol::{Location, ScriptKey, ScriptReference};

/// What to do with previous output before a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanPolicy {
    Always,
    Never,
    IfFileDeleted,
}

impl CleanPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            CleanPolicy::Always => "always",
            CleanPolicy::Never => "never",
            CleanPolicy::IfFileDeleted => "if-file-deleted",
        }
    }
}

/// The three script shapes the executor dispatches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptKind {
    /// A grouping node: dependencies only, nothing to run.
    NoCommand,
    /// A command that runs to completion.
    OneShot { command: String },
    /// A command that stays up until stopped.
    Service {
        command: String,
        /// Regex source matched against stdout lines to detect readiness.
        /// Absent means "ready as soon as spawned".
        ready_line: Option<String>,
    },
}

/// An edge of the build graph, stored by key into the config arena.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub target: ScriptKey,
    pub reference: ScriptReference,
    /// Where the specifier appears, for diagnostics.
    pub specifier: Location,
    /// Whether the dependency's fingerprint flows into the dependent's.
    pub cascade: bool,
}

/// A fully analyzed script. Created during analysis, never mutated after.
#[derive(Debug, Clone)]
pub struct ScriptConfig {
    pub reference: ScriptReference,
    pub kind: ScriptKind,
    /// Sorted by `(package_dir, name)` after the cycle pass.
    pub dependencies: Vec<Dependency>,
    /// The manifest this script was declared in.
    pub manifest: Arc<PackageJson>,
    /// Input patterns. `None` means unknown inputs, which disables freshness
    /// and caching for this script and all transitive dependents.
    pub files: Option<Vec<String>>,
    /// Output patterns used for cache archiving and cleaning.
    pub output: Option<Vec<String>>,
    pub clean: CleanPolicy,
    /// Environment overlay for the child process.
    pub env: BTreeMap<String, String>,
    /// Extra command-line arguments; only ever set on the root script.
    pub extra_args: Vec<String>,
    /// Position of the wireit config (or the script entry when the script
    /// has no wireit section).
    pub declaration: Location,
}

impl ScriptConfig {
    pub fn command(&self) -> Option<&str> {
        match &self.kind {
            ScriptKind::NoCommand => None,
            ScriptKind::OneShot { command } | ScriptKind::Service { command, .. } => Some(command),
        }
    }

    pub fn is_service(&self) -> bool {
        matches!(self.kind, ScriptKind::Service { .. })
    }

    pub fn key(&self) -> ScriptKey {
        self.reference.key()
    }
}

/// The analyzed build graph: an arena of configs keyed by canonical
/// reference string, plus the root key. Dependencies store keys rather than
/// config objects, so the graph holds no ownership cycles even while the
/// dependency relation is (pre-validation) cyclic.
#[derive(Debug)]
pub struct BuildGraph {
    configs: HashMap<ScriptKey, ScriptConfig>,
    root: ScriptKey,
}

impl BuildGraph {
    pub(crate) fn new(configs: HashMap<ScriptKey, ScriptConfig>, root: ScriptKey) -> Self {
        debug_assert!(configs.contains_key(&root));
        Self { configs, root }
    }

    pub fn root_key(&self) -> &ScriptKey {
        &self.root
    }

    pub fn root(&self) -> &ScriptConfig {
        &self.configs[&self.root]
    }

    pub fn get(&self, key: &ScriptKey) -> Option<&ScriptConfig> {
        self.configs.get(key)
    }

    pub fn scripts(&self) -> impl Iterator<Item = &ScriptConfig> {
        self.configs.values()
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Every manifest file that participated in this graph, for watching.
    pub fn manifest_paths(&self) -> BTreeSet<PathBuf> {
        self.configs
            .values()
            .map(|config| config.reference.manifest_path())
            .collect()
    }
}
