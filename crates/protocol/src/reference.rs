use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A package directory, always held as an absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageReference {
    pub package_dir: PathBuf,
}

impl PackageReference {
    pub fn new(package_dir: impl Into<PathBuf>) -> Self {
        Self {
            package_dir: package_dir.into(),
        }
    }

    /// Path of this package's manifest file.
    pub fn manifest_path(&self) -> PathBuf {
        self.package_dir.join("package.json")
    }
}

/// Identifies one script: the absolute package directory plus the script name.
///
/// References order by `(package_dir, name)`, which is the sort order used for
/// dependency lists and fingerprint maps everywhere in the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScriptReference {
    pub package_dir: PathBuf,
    pub name: String,
}

impl ScriptReference {
    pub fn new(package_dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            package_dir: package_dir.into(),
            name: name.into(),
        }
    }

    pub fn package(&self) -> PackageReference {
        PackageReference::new(self.package_dir.clone())
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.package_dir.join("package.json")
    }

    /// Per-script on-disk state directory: `.wireit/<hex of name>` under the
    /// package. Holds the fingerprint file and the local cache entries. The
    /// hex encoding keeps names with `/` or `:` filesystem-safe.
    pub fn state_dir(&self) -> PathBuf {
        let mut encoded = String::with_capacity(self.name.len() * 2);
        for byte in self.name.as_bytes() {
            encoded.push_str(&format!("{byte:02x}"));
        }
        self.package_dir.join(".wireit").join(encoded)
    }

    /// Canonical string encoding: the JSON serialization of the two-element
    /// array `[package_dir, name]`. Used as a map key across the engine.
    pub fn key(&self) -> ScriptKey {
        let tuple = (self.package_dir.to_string_lossy(), &self.name);
        ScriptKey(serde_json::to_string(&tuple).expect("tuple of strings serializes"))
    }

    /// Inverse of [`ScriptReference::key`].
    pub fn from_key(key: &ScriptKey) -> Option<Self> {
        let (dir, name): (String, String) = serde_json::from_str(&key.0).ok()?;
        Some(Self::new(PathBuf::from(dir), name))
    }

    /// Short human-readable label: the script name, qualified with the
    /// package directory when it differs from `relative_to`.
    pub fn label(&self, relative_to: &Path) -> String {
        if self.package_dir == relative_to {
            self.name.clone()
        } else {
            let shown = pathdiff_lossy(relative_to, &self.package_dir);
            format!("{}:{}", shown, self.name)
        }
    }
}

impl PartialOrd for ScriptReference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScriptReference {
    fn cmp(&self, other: &Self) -> Ordering {
        self.package_dir
            .cmp(&other.package_dir)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl fmt::Display for ScriptReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.package_dir.display(), self.name)
    }
}

/// The canonical string form of a [`ScriptReference`].
///
/// Deterministic, so it can key `HashMap`s and `BTreeMap`s and appear inside
/// fingerprint serializations. The build graph arena stores configs under
/// this key and dependencies refer to it rather than holding config objects,
/// which keeps the (potentially cyclic at analysis time) graph free of
/// ownership cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptKey(String);

impl ScriptKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn pathdiff_lossy(base: &Path, target: &Path) -> String {
    let base_components: Vec<_> = base.components().collect();
    let target_components: Vec<_> = target.components().collect();
    let mut shared = 0;
    while shared < base_components.len()
        && shared < target_components.len()
        && base_components[shared] == target_components[shared]
    {
        shared += 1;
    }
    let mut out = PathBuf::new();
    for _ in shared..base_components.len() {
        out.push("..");
    }
    for component in &target_components[shared..] {
        out.push(component);
    }
    if out.as_os_str().is_empty() {
        ".".to_string()
    } else {
        out.to_string_lossy().into_owned()
    }
}
