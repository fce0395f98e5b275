use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinSet;
use wireit_manifest::{JsonNode, ManifestFailure, ManifestReader, PackageJson};
use wireit_protocol::{
    Diagnostic, DiagnosticKind, Location, Range, ScriptKey, ScriptReference,
};

use crate::config::{BuildGraph, CleanPolicy, Dependency, ScriptConfig, ScriptKind};

/// The literal `scripts` entry that hands a script over to the wireit runner.
const RUNNER_COMMAND: &str = "wireit";

/// The lockfile included as an implicit input when `packageLocks` is not
/// configured.
const DEFAULT_PACKAGE_LOCK: &str = "package-lock.json";

/// A successful analysis: the graph plus any warnings produced along the way.
#[derive(Debug)]
pub struct Analysis {
    pub graph: Arc<BuildGraph>,
    pub warnings: Vec<Diagnostic>,
}

/// Resolves a root script reference to a validated build graph.
pub struct Analyzer {
    reader: Arc<ManifestReader>,
}

/// What one placeholder upgrade produced.
enum Upgrade {
    Config(Box<ScriptConfig>),
    ManifestMissing { path: PathBuf },
    ManifestSyntax(Diagnostic),
    NoScriptsSection { location: Location },
    ScriptMissing { location: Location },
    Invalid(Vec<Diagnostic>),
}

impl Analyzer {
    pub fn new(reader: Arc<ManifestReader>) -> Self {
        Self { reader }
    }

    pub fn reader(&self) -> &Arc<ManifestReader> {
        &self.reader
    }

    /// Analyze the graph rooted at `root`. `extra_args` attach to the root
    /// script only (they participate in its fingerprint).
    pub async fn analyze(
        &self,
        root: ScriptReference,
        extra_args: &[String],
    ) -> Result<Analysis, Vec<Diagnostic>> {
        let root_key = root.key();
        let mut scheduled: HashSet<ScriptKey> = HashSet::new();
        let mut outcomes: HashMap<ScriptKey, Upgrade> = HashMap::new();
        let mut mentions: HashMap<ScriptKey, Vec<Location>> = HashMap::new();
        let mut warnings: Vec<Diagnostic> = Vec::new();

        // First pass: placeholder walk. Each task reads and validates one
        // script without awaiting any other script, so manifest IO runs in
        // parallel and cycles cannot deadlock the walk. New references found
        // while draining are scheduled immediately.
        let mut tasks: JoinSet<(ScriptReference, Upgrade, Vec<Diagnostic>)> = JoinSet::new();
        scheduled.insert(root_key.clone());
        tasks.spawn(upgrade_placeholder(self.reader.clone(), root.clone()));

        while let Some(joined) = tasks.join_next().await {
            let (reference, upgrade, mut task_warnings) =
                joined.unwrap_or_else(|err| panic!("analysis task panicked: {err}"));
            warnings.append(&mut task_warnings);
            if let Upgrade::Config(config) = &upgrade {
                for dependency in &config.dependencies {
                    mentions
                        .entry(dependency.target.clone())
                        .or_default()
                        .push(dependency.specifier.clone());
                    if scheduled.insert(dependency.target.clone()) {
                        tasks.spawn(upgrade_placeholder(
                            self.reader.clone(),
                            dependency.reference.clone(),
                        ));
                    }
                }
            }
            outcomes.insert(reference.key(), upgrade);
        }

        let mut errors: Vec<Diagnostic> = Vec::new();
        let mut configs: HashMap<ScriptKey, ScriptConfig> = HashMap::new();
        let mut syntax_reported: HashSet<PathBuf> = HashSet::new();

        for (key, upgrade) in outcomes {
            let is_root = key == root_key;
            let mentioned = mentions.get(&key).cloned().unwrap_or_default();
            match upgrade {
                Upgrade::Config(config) => {
                    configs.insert(key, *config);
                }
                Upgrade::ManifestMissing { path } => {
                    if is_root {
                        errors.push(Diagnostic::bare(
                            DiagnosticKind::MissingPackageJson,
                            format!("No package.json was found at {}", path.display()),
                        ));
                    }
                    for location in mentioned {
                        errors.push(Diagnostic::error(
                            DiagnosticKind::DependencyOnMissingPackageJson,
                            format!(
                                "This dependency references a package with no package.json ({})",
                                path.display()
                            ),
                            location,
                        ));
                    }
                }
                Upgrade::ManifestSyntax(diagnostic) => {
                    let path = diagnostic
                        .location
                        .as_ref()
                        .map(|location| location.path.as_ref().clone())
                        .unwrap_or_default();
                    if syntax_reported.insert(path) {
                        errors.push(diagnostic);
                    }
                }
                Upgrade::NoScriptsSection { location } => {
                    if is_root {
                        errors.push(Diagnostic::error(
                            DiagnosticKind::NoScriptsInPackageJson,
                            "This package.json has no scripts section",
                            location.clone(),
                        ));
                    }
                    for mention in mentioned {
                        errors.push(Diagnostic::error(
                            DiagnosticKind::DependencyOnMissingScript,
                            "This dependency references a package whose package.json \
                             has no scripts section",
                            mention,
                        ));
                    }
                }
                Upgrade::ScriptMissing { location } => {
                    if is_root {
                        errors.push(Diagnostic::error(
                            DiagnosticKind::ScriptNotFound,
                            format!(
                                "Script {:?} was not found in the scripts section",
                                ScriptReference::from_key(&key)
                                    .map(|reference| reference.name)
                                    .unwrap_or_default()
                            ),
                            location.clone(),
                        ));
                    }
                    for mention in mentioned {
                        errors.push(Diagnostic::error(
                            DiagnosticKind::DependencyOnMissingScript,
                            "This dependency references a script that does not exist",
                            mention,
                        ));
                    }
                }
                Upgrade::Invalid(diagnostics) => {
                    errors.extend(diagnostics);
                }
            }
        }

        if !errors.is_empty() {
            errors.extend(std::mem::take(&mut warnings));
            return Err(errors);
        }

        // Second pass: depth-first cycle check, then deterministic sorting of
        // every dependency list so later traversals and fingerprints are
        // order-insensitive.
        if let Some(cycle) = find_cycle(&configs, &root_key) {
            errors.push(cycle);
            errors.extend(std::mem::take(&mut warnings));
            return Err(errors);
        }

        if let Some(root_config) = configs.get_mut(&root_key) {
            root_config.extra_args = extra_args.to_vec();
        }
        for config in configs.values_mut() {
            config
                .dependencies
                .sort_by(|a, b| a.reference.cmp(&b.reference));
        }

        Ok(Analysis {
            graph: Arc::new(BuildGraph::new(configs, root_key)),
            warnings,
        })
    }
}

/// Depth-first walk with an on-trail set. Returns the `cycle` diagnostic for
/// the first cycle found, listing each hop in source order.
fn find_cycle(
    configs: &HashMap<ScriptKey, ScriptConfig>,
    root: &ScriptKey,
) -> Option<Diagnostic> {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        OnTrail,
        Done,
    }

    let mut states: HashMap<ScriptKey, State> = HashMap::new();
    // (key, index of the next dependency to visit)
    let mut trail: Vec<(ScriptKey, usize)> = Vec::new();

    states.insert(root.clone(), State::OnTrail);
    trail.push((root.clone(), 0));

    while let Some((key, next_index)) = trail.last().cloned() {
        let config = &configs[&key];
        if next_index >= config.dependencies.len() {
            states.insert(key, State::Done);
            trail.pop();
            continue;
        }
        trail.last_mut().expect("trail non-empty").1 += 1;
        let dependency = &config.dependencies[next_index];
        match states.get(&dependency.target) {
            None => {
                states.insert(dependency.target.clone(), State::OnTrail);
                trail.push((dependency.target.clone(), 0));
            }
            Some(State::OnTrail) => {
                // The trail from the re-entered node onward, plus the closing
                // edge, is the cycle.
                let start = trail
                    .iter()
                    .position(|(k, _)| *k == dependency.target)
                    .expect("on-trail node is on the trail");
                let hops: Vec<&ScriptConfig> = trail[start..]
                    .iter()
                    .map(|(k, _)| &configs[k])
                    .collect();
                let names: Vec<String> = hops
                    .iter()
                    .map(|config| config.reference.name.clone())
                    .chain(std::iter::once(
                        configs[&dependency.target].reference.name.clone(),
                    ))
                    .collect();
                let mut diagnostic = Diagnostic::error(
                    DiagnosticKind::Cycle,
                    format!("Cycle detected in dependencies: {}", names.join(" -> ")),
                    edge_to_successor(&trail, start, configs, dependency),
                );
                for (position, config) in hops.iter().enumerate().skip(1) {
                    let edge = edge_to_successor(&trail, start + position, configs, dependency);
                    diagnostic = diagnostic.with_label(
                        edge,
                        format!("{} depends on the next script in the cycle", config.reference.name),
                    );
                }
                return Some(diagnostic);
            }
            Some(State::Done) => {}
        }
    }
    None
}

/// The specifier location of the edge leaving `trail[position]` toward the
/// next node on the cycle (or the closing edge for the last hop).
fn edge_to_successor(
    trail: &[(ScriptKey, usize)],
    position: usize,
    configs: &HashMap<ScriptKey, ScriptConfig>,
    closing: &Dependency,
) -> Location {
    let (key, next_index) = &trail[position];
    let config = &configs[key];
    if position + 1 < trail.len() {
        // next_index was already advanced past the edge that was taken.
        config.dependencies[next_index - 1].specifier.clone()
    } else {
        closing.specifier.clone()
    }
}

async fn upgrade_placeholder(
    reader: Arc<ManifestReader>,
    reference: ScriptReference,
) -> (ScriptReference, Upgrade, Vec<Diagnostic>) {
    let mut warnings = Vec::new();
    let upgrade = match reader.read(&reference.package()).await {
        Err(ManifestFailure::Missing { path, .. }) => Upgrade::ManifestMissing { path },
        Err(ManifestFailure::Syntax {
            path,
            contents,
            offset,
            message,
        }) => Upgrade::ManifestSyntax(Diagnostic::error(
            DiagnosticKind::InvalidJsonSyntax,
            format!("Invalid JSON: {message}"),
            Location::new(path, contents, Range::new(offset, 1)),
        )),
        Ok(manifest) => upgrade_script(&manifest, &reference, &mut warnings),
    };
    (reference, upgrade, warnings)
}

fn upgrade_script(
    manifest: &Arc<PackageJson>,
    reference: &ScriptReference,
    warnings: &mut Vec<Diagnostic>,
) -> Upgrade {
    let scripts_node = manifest.scripts_node();
    if scripts_node.and_then(|node| node.as_object()).is_none() {
        return Upgrade::NoScriptsSection {
            location: manifest.file_location(),
        };
    }

    let Some(entry) = manifest.script(&reference.name) else {
        if let Some((_, config_key_range)) = manifest.wireit_config(&reference.name) {
            return Upgrade::Invalid(vec![Diagnostic::error(
                DiagnosticKind::WireitConfigButNoScript,
                format!(
                    "This wireit config has no matching entry in the scripts section \
                     for {:?}",
                    reference.name
                ),
                manifest.location(config_key_range),
            )]);
        }
        let scripts_key = manifest
            .root()
            .member("scripts")
            .map(|member| member.key_range)
            .unwrap_or(Range::new(0, 0));
        return Upgrade::ScriptMissing {
            location: manifest.location(scripts_key),
        };
    };

    let Some(script_command) = entry.command.filter(|command| !command.trim().is_empty()) else {
        return Upgrade::Invalid(vec![Diagnostic::error(
            DiagnosticKind::InvalidConfigSyntax,
            "A script command must be a non-blank string",
            manifest.location(entry.value_range),
        )]);
    };

    let Some((config_node, config_key_range)) = manifest.wireit_config(&reference.name) else {
        // Not a wireit script: run it as-is, with unknown inputs.
        return Upgrade::Config(Box::new(ScriptConfig {
            reference: reference.clone(),
            kind: ScriptKind::OneShot {
                command: script_command.to_string(),
            },
            dependencies: Vec::new(),
            manifest: manifest.clone(),
            files: None,
            output: None,
            clean: CleanPolicy::Always,
            env: BTreeMap::new(),
            extra_args: Vec::new(),
            declaration: manifest.location(entry.name_range),
        }));
    };

    if script_command != RUNNER_COMMAND {
        warnings.push(Diagnostic::warning(
            DiagnosticKind::ScriptNotWireit,
            format!(
                "This script has a wireit config, so its scripts entry should be \
                 \"{RUNNER_COMMAND}\""
            ),
            manifest.location(entry.value_range),
        ));
    }

    validate_wireit_config(manifest, reference, config_node, config_key_range)
}

fn validate_wireit_config(
    manifest: &Arc<PackageJson>,
    reference: &ScriptReference,
    node: &JsonNode,
    config_key_range: Range,
) -> Upgrade {
    let mut errors: Vec<Diagnostic> = Vec::new();

    if node.as_object().is_none() {
        return Upgrade::Invalid(vec![Diagnostic::error(
            DiagnosticKind::InvalidConfigSyntax,
            format!("Expected an object, but was {}", node.type_name()),
            manifest.location(node.range),
        )]);
    }

    let command = match node.member("command") {
        None => None,
        Some(member) => match member.value.as_str() {
            Some(command) if !command.trim().is_empty() => Some(command.to_string()),
            _ => {
                errors.push(Diagnostic::error(
                    DiagnosticKind::InvalidConfigSyntax,
                    "command must be a non-blank string",
                    manifest.location(member.value.range),
                ));
                None
            }
        },
    };

    let dependencies = collect_dependencies(manifest, reference, node, &mut errors);

    if command.is_none() && node.member("dependencies").is_none() {
        errors.push(Diagnostic::error(
            DiagnosticKind::InvalidConfigSyntax,
            "A wireit config must set at least one of command or dependencies",
            manifest.location(config_key_range),
        ));
    }

    let files = collect_string_array(manifest, node, "files", &mut errors);
    let output = collect_string_array(manifest, node, "output", &mut errors);

    let clean = match node.member("clean") {
        None => CleanPolicy::Always,
        Some(member) => match (member.value.as_bool(), member.value.as_str()) {
            (Some(true), _) => CleanPolicy::Always,
            (Some(false), _) => CleanPolicy::Never,
            (_, Some("if-file-deleted")) => CleanPolicy::IfFileDeleted,
            _ => {
                errors.push(Diagnostic::error(
                    DiagnosticKind::InvalidConfigSyntax,
                    "clean must be true, false, or \"if-file-deleted\"",
                    manifest.location(member.value.range),
                ));
                CleanPolicy::Always
            }
        },
    };

    let package_locks = match node.member("packageLocks") {
        None => None,
        Some(member) => match member.value.as_array() {
            None => {
                errors.push(Diagnostic::error(
                    DiagnosticKind::InvalidConfigSyntax,
                    "packageLocks must be an array of filenames",
                    manifest.location(member.value.range),
                ));
                None
            }
            Some(items) => {
                let mut names = Vec::new();
                for item in items {
                    match item.as_str() {
                        Some(name) if !name.is_empty() && !name.contains('/') => {
                            names.push(name.to_string());
                        }
                        _ => errors.push(Diagnostic::error(
                            DiagnosticKind::InvalidConfigSyntax,
                            "packageLocks entries must be filenames, not paths",
                            manifest.location(item.range),
                        )),
                    }
                }
                Some(names)
            }
        },
    };

    let env = match node.member("env") {
        None => BTreeMap::new(),
        Some(member) => match member.value.as_object() {
            None => {
                errors.push(Diagnostic::error(
                    DiagnosticKind::InvalidConfigSyntax,
                    "env must be an object mapping names to string values",
                    manifest.location(member.value.range),
                ));
                BTreeMap::new()
            }
            Some(members) => {
                let mut env = BTreeMap::new();
                for entry in members {
                    match entry.value.as_str() {
                        Some(value) => {
                            env.insert(entry.key.clone(), value.to_string());
                        }
                        None => errors.push(Diagnostic::error(
                            DiagnosticKind::InvalidConfigSyntax,
                            "env values must be strings",
                            manifest.location(entry.value.range),
                        )),
                    }
                }
                env
            }
        },
    };

    let service = parse_service(manifest, node, &mut errors);

    let kind = match (command, service) {
        (Some(command), Some(ready_line)) => ScriptKind::Service {
            command,
            ready_line,
        },
        (Some(command), None) => ScriptKind::OneShot { command },
        (None, Some(_)) => {
            errors.push(Diagnostic::error(
                DiagnosticKind::InvalidConfigSyntax,
                "A service needs a command",
                manifest.location(config_key_range),
            ));
            ScriptKind::NoCommand
        }
        (None, None) => ScriptKind::NoCommand,
    };

    if !errors.is_empty() {
        return Upgrade::Invalid(errors);
    }

    // Package-lock expansion: model the runtime's resolution up the directory
    // chain by including every ancestor's lockfile as an input.
    let files = files.map(|mut patterns| {
        let lock_names = package_locks.unwrap_or_else(|| vec![DEFAULT_PACKAGE_LOCK.to_string()]);
        if !lock_names.is_empty() {
            patterns.extend(lock_patterns(&reference.package_dir, &lock_names));
        }
        patterns
    });

    Upgrade::Config(Box::new(ScriptConfig {
        reference: reference.clone(),
        kind,
        dependencies,
        manifest: manifest.clone(),
        files,
        output,
        clean,
        env,
        extra_args: Vec::new(),
        declaration: manifest.location(config_key_range),
    }))
}

/// `service: true` or `service: {readyWhen: {lineMatches: "regex"}}`.
/// Returns `Some(ready_line)` when the script is a service.
fn parse_service(
    manifest: &Arc<PackageJson>,
    node: &JsonNode,
    errors: &mut Vec<Diagnostic>,
) -> Option<Option<String>> {
    let member = node.member("service")?;
    if let Some(flag) = member.value.as_bool() {
        return flag.then_some(None);
    }
    let Some(_) = member.value.as_object() else {
        errors.push(Diagnostic::error(
            DiagnosticKind::InvalidConfigSyntax,
            "service must be true or an object",
            manifest.location(member.value.range),
        ));
        return None;
    };
    let line_matches = member
        .value
        .get("readyWhen")
        .and_then(|ready| ready.member("lineMatches"));
    match line_matches {
        None => Some(None),
        Some(line_member) => match line_member.value.as_str() {
            None => {
                errors.push(Diagnostic::error(
                    DiagnosticKind::InvalidConfigSyntax,
                    "lineMatches must be a string containing a regular expression",
                    manifest.location(line_member.value.range),
                ));
                Some(None)
            }
            Some(pattern) => match regex::Regex::new(pattern) {
                Ok(_) => Some(Some(pattern.to_string())),
                Err(err) => {
                    errors.push(Diagnostic::error(
                        DiagnosticKind::InvalidConfigSyntax,
                        format!("Invalid regular expression: {err}"),
                        manifest.location(line_member.value.range),
                    ));
                    Some(None)
                }
            },
        },
    }
}

fn collect_string_array(
    manifest: &Arc<PackageJson>,
    node: &JsonNode,
    key: &str,
    errors: &mut Vec<Diagnostic>,
) -> Option<Vec<String>> {
    let member = node.member(key)?;
    match member.value.as_array() {
        None => {
            errors.push(Diagnostic::error(
                DiagnosticKind::InvalidConfigSyntax,
                format!("{key} must be an array of glob patterns"),
                manifest.location(member.value.range),
            ));
            None
        }
        Some(items) => {
            let mut patterns = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(pattern) if !pattern.is_empty() => patterns.push(pattern.to_string()),
                    _ => errors.push(Diagnostic::error(
                        DiagnosticKind::InvalidConfigSyntax,
                        format!("{key} entries must be non-empty strings"),
                        manifest.location(item.range),
                    )),
                }
            }
            Some(patterns)
        }
    }
}

fn collect_dependencies(
    manifest: &Arc<PackageJson>,
    reference: &ScriptReference,
    node: &JsonNode,
    errors: &mut Vec<Diagnostic>,
) -> Vec<Dependency> {
    let Some(member) = node.member("dependencies") else {
        return Vec::new();
    };
    let Some(items) = member.value.as_array() else {
        errors.push(Diagnostic::error(
            DiagnosticKind::InvalidConfigSyntax,
            "dependencies must be an array",
            manifest.location(member.value.range),
        ));
        return Vec::new();
    };

    let mut dependencies: Vec<Dependency> = Vec::with_capacity(items.len());
    let mut first_seen: HashMap<ScriptKey, Location> = HashMap::new();

    for item in items {
        // Either a plain specifier string, or {script, cascade}.
        let (specifier_node, cascade) = if item.as_str().is_some() {
            (item, true)
        } else if item.as_object().is_some() {
            let Some(script_member) = item.member("script") else {
                errors.push(Diagnostic::error(
                    DiagnosticKind::InvalidConfigSyntax,
                    "A dependency object must have a script property",
                    manifest.location(item.range),
                ));
                continue;
            };
            let cascade = item
                .get("cascade")
                .and_then(|value| value.as_bool())
                .unwrap_or(true);
            (&script_member.value, cascade)
        } else {
            errors.push(Diagnostic::error(
                DiagnosticKind::InvalidConfigSyntax,
                "Dependencies must be strings or objects",
                manifest.location(item.range),
            ));
            continue;
        };

        let Some(specifier) = specifier_node.as_str().filter(|s| !s.is_empty()) else {
            errors.push(Diagnostic::error(
                DiagnosticKind::InvalidConfigSyntax,
                "A dependency must be a non-empty string",
                manifest.location(specifier_node.range),
            ));
            continue;
        };
        let location = manifest.location(specifier_node.range);

        let target = match resolve_specifier(reference, specifier) {
            Ok(target) => target,
            Err(message) => {
                errors.push(Diagnostic::error(
                    DiagnosticKind::InvalidConfigSyntax,
                    message,
                    location,
                ));
                continue;
            }
        };

        let key = target.key();
        if let Some(first) = first_seen.get(&key) {
            errors.push(
                Diagnostic::error(
                    DiagnosticKind::DuplicateDependency,
                    format!("This dependency resolves to {} again", target.name),
                    location,
                )
                .with_label(first.clone(), "first declared here"),
            );
            continue;
        }
        first_seen.insert(key.clone(), location.clone());

        dependencies.push(Dependency {
            target: key,
            reference: target,
            specifier: location,
            cascade,
        });
    }

    dependencies
}

/// Resolve a dependency specifier against the referencing package.
///
/// Specifiers starting with `.` are cross-package: `./path:script` or
/// `../path:script`, split on the first `:`.
fn resolve_specifier(
    referencing: &ScriptReference,
    specifier: &str,
) -> Result<ScriptReference, String> {
    if !specifier.starts_with('.') {
        return Ok(ScriptReference::new(
            referencing.package_dir.clone(),
            specifier,
        ));
    }
    let Some((relative, script)) = specifier.split_once(':') else {
        return Err(format!(
            "Cross-package dependency must have the form \"./path:script\", got {specifier:?}"
        ));
    };
    if relative.is_empty() || script.is_empty() {
        return Err(
            "Cross-package dependency needs a non-empty path and a non-empty script name"
                .to_string(),
        );
    }
    let package_dir = normalize_path(&referencing.package_dir.join(relative));
    if package_dir == referencing.package_dir {
        return Err(
            "Cross-package dependency must lead to a different package".to_string(),
        );
    }
    Ok(ScriptReference::new(package_dir, script))
}

/// Lexical path normalization: resolves `.` and `..` without touching the
/// filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// One pattern per lock name per ancestor directory, from the package itself
/// up to the filesystem root.
fn lock_patterns(package_dir: &Path, lock_names: &[String]) -> Vec<String> {
    let mut patterns = Vec::new();
    let mut prefix = String::new();
    let mut dir = Some(package_dir);
    while let Some(current) = dir {
        for name in lock_names {
            patterns.push(format!("{prefix}{name}"));
        }
        prefix.push_str("../");
        dir = current.parent();
    }
    patterns
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_package_specifier_resolves_in_place() {
        let referencing = ScriptReference::new("/repo/pkg", "build");
        let resolved = resolve_specifier(&referencing, "test").unwrap();
        assert_eq!(resolved, ScriptReference::new("/repo/pkg", "test"));
    }

    #[test]
    fn cross_package_specifier_splits_on_first_colon() {
        let referencing = ScriptReference::new("/repo/pkg", "build");
        let resolved = resolve_specifier(&referencing, "../other:build:weird").unwrap();
        assert_eq!(resolved.package_dir, PathBuf::from("/repo/other"));
        assert_eq!(resolved.name, "build:weird");
    }

    #[test]
    fn cross_package_specifier_must_change_package() {
        let referencing = ScriptReference::new("/repo/pkg", "build");
        assert!(resolve_specifier(&referencing, "./:build").is_err());
        assert!(resolve_specifier(&referencing, ".").is_err());
        assert!(resolve_specifier(&referencing, "./other:").is_err());
    }

    #[test]
    fn normalize_collapses_dot_segments() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
    }

    #[test]
    fn lock_patterns_cover_every_ancestor() {
        let patterns = lock_patterns(
            Path::new("/repo/packages/app"),
            &["package-lock.json".to_string()],
        );
        assert!(patterns.contains(&"package-lock.json".to_string()));
        assert!(patterns.contains(&"../package-lock.json".to_string()));
        assert!(patterns.contains(&"../../package-lock.json".to_string()));
        assert!(patterns.contains(&"../../../package-lock.json".to_string()));
        // /repo/packages/app -> app, packages, repo, /
        assert_eq!(patterns.len(), 4);
    }

    #[test]
    fn lock_patterns_support_multiple_names() {
        let patterns = lock_patterns(
            Path::new("/repo"),
            &["package-lock.json".to_string(), "yarn.lock".to_string()],
        );
        assert_eq!(patterns.len(), 4);
        assert_eq!(patterns[0], "package-lock.json");
        assert_eq!(patterns[1], "yarn.lock");
    }
}
