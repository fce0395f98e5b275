use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use wireit_analyzer::{Analysis, Analyzer, CleanPolicy, ScriptKind};
use wireit_manifest::ManifestReader;
use wireit_protocol::{Diagnostic, DiagnosticKind, ScriptReference, Severity};

fn write_manifest(dir: &Path, contents: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("package.json"), contents).unwrap();
}

async fn analyze(dir: &Path, script: &str) -> Result<Analysis, Vec<Diagnostic>> {
    let analyzer = Analyzer::new(Arc::new(ManifestReader::new()));
    analyzer
        .analyze(ScriptReference::new(dir.to_path_buf(), script), &[])
        .await
}

fn kinds(diagnostics: &[Diagnostic]) -> Vec<DiagnosticKind> {
    diagnostics.iter().map(|d| d.kind).collect()
}

#[tokio::test]
async fn analyzes_a_two_script_graph() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"build": "wireit", "gen": "wireit"},
            "wireit": {
                "build": {
                    "command": "tsc",
                    "dependencies": ["gen"],
                    "files": ["src/**/*.ts"],
                    "output": ["lib/**"]
                },
                "gen": {"command": "codegen", "files": ["schema.json"], "output": ["gen/**"]}
            }
        }"#,
    );

    let analysis = analyze(temp.path(), "build").await.unwrap();
    assert!(analysis.warnings.is_empty());
    let graph = analysis.graph;
    assert_eq!(graph.len(), 2);

    let root = graph.root();
    assert_eq!(root.reference.name, "build");
    assert_eq!(root.command(), Some("tsc"));
    assert_eq!(root.dependencies.len(), 1);
    assert_eq!(root.dependencies[0].reference.name, "gen");
    assert!(root.dependencies[0].cascade);
    assert_eq!(root.output.as_deref(), Some(&["lib/**".to_string()][..]));

    let gen = graph.get(&root.dependencies[0].target).unwrap();
    assert_eq!(gen.command(), Some("codegen"));
}

#[tokio::test]
async fn plain_scripts_run_without_wireit_config() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{"scripts": {"lint": "eslint ."}}"#,
    );

    let analysis = analyze(temp.path(), "lint").await.unwrap();
    let root = analysis.graph.root();
    assert_eq!(root.command(), Some("eslint ."));
    assert!(root.files.is_none());
    assert!(root.dependencies.is_empty());
}

#[tokio::test]
async fn script_not_invoking_runner_warns() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"build": "tsc"},
            "wireit": {"build": {"command": "tsc"}}
        }"#,
    );

    let analysis = analyze(temp.path(), "build").await.unwrap();
    assert_eq!(analysis.warnings.len(), 1);
    let warning = &analysis.warnings[0];
    assert_eq!(warning.kind, DiagnosticKind::ScriptNotWireit);
    assert_eq!(warning.severity, Severity::Warning);
    let location = warning.location.as_ref().unwrap();
    // Points at the scripts entry value, "tsc".
    let excerpt = &location.contents
        [location.range.offset..location.range.offset + location.range.length];
    assert_eq!(excerpt, "\"tsc\"");
}

#[tokio::test]
async fn cycle_produces_single_diagnostic_listing_hops() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"a": "wireit", "b": "wireit"},
            "wireit": {
                "a": {"command": "true", "dependencies": ["b"]},
                "b": {"command": "true", "dependencies": ["a"]}
            }
        }"#,
    );

    let errors = analyze(temp.path(), "a").await.unwrap_err();
    let cycles: Vec<_> = errors
        .iter()
        .filter(|d| d.kind == DiagnosticKind::Cycle)
        .collect();
    assert_eq!(cycles.len(), 1);
    let cycle = cycles[0];
    assert!(cycle.message.contains("a -> b -> a"), "{}", cycle.message);
    // Primary location for the first hop plus one label for the closing hop.
    assert!(cycle.location.is_some());
    assert_eq!(cycle.supplemental.len(), 1);
}

#[tokio::test]
async fn self_cycle_is_detected() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"a": "wireit"},
            "wireit": {"a": {"command": "true", "dependencies": ["a"]}}
        }"#,
    );

    let errors = analyze(temp.path(), "a").await.unwrap_err();
    assert_eq!(kinds(&errors), vec![DiagnosticKind::Cycle]);
}

#[tokio::test]
async fn duplicate_dependency_points_at_both_occurrences() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"a": "wireit", "b": "wireit"},
            "wireit": {
                "a": {"command": "true", "dependencies": ["b", "b"]},
                "b": {"command": "true"}
            }
        }"#,
    );

    let errors = analyze(temp.path(), "a").await.unwrap_err();
    let duplicate = errors
        .iter()
        .find(|d| d.kind == DiagnosticKind::DuplicateDependency)
        .expect("duplicate-dependency diagnostic");
    assert_eq!(duplicate.supplemental.len(), 1);
}

#[tokio::test]
async fn cross_package_dependencies_resolve() {
    let temp = TempDir::new().unwrap();
    let app = temp.path().join("app");
    let lib = temp.path().join("lib");
    write_manifest(
        &app,
        r#"{
            "scripts": {"build": "wireit"},
            "wireit": {"build": {"command": "tsc", "dependencies": ["../lib:build"]}}
        }"#,
    );
    write_manifest(
        &lib,
        r#"{
            "scripts": {"build": "wireit"},
            "wireit": {"build": {"command": "tsc"}}
        }"#,
    );

    let analysis = analyze(&app, "build").await.unwrap();
    let root = analysis.graph.root();
    assert_eq!(root.dependencies.len(), 1);
    let dep = analysis.graph.get(&root.dependencies[0].target).unwrap();
    // TempDir paths may traverse symlinks; compare the tail.
    assert!(dep.reference.package_dir.ends_with("lib"));
    assert_eq!(dep.reference.name, "build");
}

#[tokio::test]
async fn dependency_on_missing_package_is_reported_at_specifier() {
    let temp = TempDir::new().unwrap();
    let app = temp.path().join("app");
    write_manifest(
        &app,
        r#"{
            "scripts": {"build": "wireit"},
            "wireit": {"build": {"command": "tsc", "dependencies": ["../nowhere:build"]}}
        }"#,
    );

    let errors = analyze(&app, "build").await.unwrap_err();
    assert_eq!(
        kinds(&errors),
        vec![DiagnosticKind::DependencyOnMissingPackageJson]
    );
    let location = errors[0].location.as_ref().unwrap();
    let excerpt = &location.contents
        [location.range.offset..location.range.offset + location.range.length];
    assert_eq!(excerpt, "\"../nowhere:build\"");
}

#[tokio::test]
async fn missing_root_script_is_script_not_found() {
    let temp = TempDir::new().unwrap();
    write_manifest(temp.path(), r#"{"scripts": {"other": "true"}}"#);

    let errors = analyze(temp.path(), "build").await.unwrap_err();
    assert_eq!(kinds(&errors), vec![DiagnosticKind::ScriptNotFound]);
}

#[tokio::test]
async fn missing_dependency_script_is_reported_at_specifier() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"a": "wireit"},
            "wireit": {"a": {"command": "true", "dependencies": ["missing"]}}
        }"#,
    );

    let errors = analyze(temp.path(), "a").await.unwrap_err();
    assert_eq!(
        kinds(&errors),
        vec![DiagnosticKind::DependencyOnMissingScript]
    );
}

#[tokio::test]
async fn wireit_config_without_script_entry_errors() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"a": "wireit"},
            "wireit": {
                "a": {"command": "true", "dependencies": ["ghost"]},
                "ghost": {"command": "boo"}
            }
        }"#,
    );

    let errors = analyze(temp.path(), "a").await.unwrap_err();
    assert_eq!(
        kinds(&errors),
        vec![DiagnosticKind::WireitConfigButNoScript]
    );
}

#[tokio::test]
async fn invalid_json_reports_offset() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("package.json"), "{ nope }").unwrap();

    let errors = analyze(temp.path(), "build").await.unwrap_err();
    assert_eq!(kinds(&errors), vec![DiagnosticKind::InvalidJsonSyntax]);
}

#[tokio::test]
async fn missing_manifest_is_reported() {
    let temp = TempDir::new().unwrap();
    let errors = analyze(&temp.path().join("void"), "build").await.unwrap_err();
    assert_eq!(kinds(&errors), vec![DiagnosticKind::MissingPackageJson]);
}

#[tokio::test]
async fn invalid_clean_value_is_rejected() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"a": "wireit"},
            "wireit": {"a": {"command": "true", "clean": "sometimes"}}
        }"#,
    );

    let errors = analyze(temp.path(), "a").await.unwrap_err();
    assert_eq!(kinds(&errors), vec![DiagnosticKind::InvalidConfigSyntax]);
}

#[tokio::test]
async fn clean_if_file_deleted_parses() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"a": "wireit"},
            "wireit": {"a": {"command": "true", "clean": "if-file-deleted"}}
        }"#,
    );

    let analysis = analyze(temp.path(), "a").await.unwrap();
    assert_eq!(analysis.graph.root().clean, CleanPolicy::IfFileDeleted);
}

#[tokio::test]
async fn config_needs_command_or_dependencies() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"a": "wireit"},
            "wireit": {"a": {"files": ["x"]}}
        }"#,
    );

    let errors = analyze(temp.path(), "a").await.unwrap_err();
    assert!(kinds(&errors).contains(&DiagnosticKind::InvalidConfigSyntax));
}

#[tokio::test]
async fn package_locks_expand_to_every_ancestor() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"a": "wireit"},
            "wireit": {"a": {"command": "true", "files": ["src/**"]}}
        }"#,
    );

    let analysis = analyze(temp.path(), "a").await.unwrap();
    let files = analysis.graph.root().files.clone().unwrap();
    assert_eq!(files[0], "src/**");
    assert!(files.contains(&"package-lock.json".to_string()));
    assert!(files.contains(&"../package-lock.json".to_string()));
}

#[tokio::test]
async fn empty_package_locks_disables_expansion() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"a": "wireit"},
            "wireit": {"a": {"command": "true", "files": ["src/**"], "packageLocks": []}}
        }"#,
    );

    let analysis = analyze(temp.path(), "a").await.unwrap();
    let files = analysis.graph.root().files.clone().unwrap();
    assert_eq!(files, vec!["src/**".to_string()]);
}

#[tokio::test]
async fn package_lock_paths_are_rejected() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"a": "wireit"},
            "wireit": {"a": {"command": "true", "packageLocks": ["sub/lock.json"]}}
        }"#,
    );

    let errors = analyze(temp.path(), "a").await.unwrap_err();
    assert_eq!(kinds(&errors), vec![DiagnosticKind::InvalidConfigSyntax]);
}

#[tokio::test]
async fn grouper_has_no_command() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"all": "wireit", "a": "wireit"},
            "wireit": {
                "all": {"dependencies": ["a"]},
                "a": {"command": "true"}
            }
        }"#,
    );

    let analysis = analyze(temp.path(), "all").await.unwrap();
    assert_eq!(analysis.graph.root().kind, ScriptKind::NoCommand);
}

#[tokio::test]
async fn service_with_readiness_pattern_parses() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"serve": "wireit"},
            "wireit": {
                "serve": {
                    "command": "server",
                    "service": {"readyWhen": {"lineMatches": "listening on .*"}}
                }
            }
        }"#,
    );

    let analysis = analyze(temp.path(), "serve").await.unwrap();
    match &analysis.graph.root().kind {
        ScriptKind::Service {
            command,
            ready_line,
        } => {
            assert_eq!(command, "server");
            assert_eq!(ready_line.as_deref(), Some("listening on .*"));
        }
        other => panic!("expected service, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_readiness_regex_is_rejected() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"serve": "wireit"},
            "wireit": {
                "serve": {
                    "command": "server",
                    "service": {"readyWhen": {"lineMatches": "("}}
                }
            }
        }"#,
    );

    let errors = analyze(temp.path(), "serve").await.unwrap_err();
    assert_eq!(kinds(&errors), vec![DiagnosticKind::InvalidConfigSyntax]);
}

#[tokio::test]
async fn cascade_false_is_carried_on_the_edge() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"a": "wireit", "b": "wireit"},
            "wireit": {
                "a": {
                    "command": "true",
                    "dependencies": [{"script": "b", "cascade": false}]
                },
                "b": {"command": "true"}
            }
        }"#,
    );

    let analysis = analyze(temp.path(), "a").await.unwrap();
    let root = analysis.graph.root();
    assert_eq!(root.dependencies.len(), 1);
    assert!(!root.dependencies[0].cascade);
}

#[tokio::test]
async fn dependencies_are_sorted_deterministically() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"all": "wireit", "zeta": "wireit", "alpha": "wireit"},
            "wireit": {
                "all": {"dependencies": ["zeta", "alpha"]},
                "zeta": {"command": "true"},
                "alpha": {"command": "true"}
            }
        }"#,
    );

    let analysis = analyze(temp.path(), "all").await.unwrap();
    let names: Vec<_> = analysis
        .graph
        .root()
        .dependencies
        .iter()
        .map(|d| d.reference.name.clone())
        .collect();
    assert_eq!(names, vec!["alpha", "zeta"]);
}

#[tokio::test]
async fn env_overlay_is_collected() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"a": "wireit"},
            "wireit": {"a": {"command": "true", "env": {"MODE": "prod", "A": "1"}}}
        }"#,
    );

    let analysis = analyze(temp.path(), "a").await.unwrap();
    let env = &analysis.graph.root().env;
    assert_eq!(env.get("MODE").map(String::as_str), Some("prod"));
    assert_eq!(env.len(), 2);
}

#[tokio::test]
async fn extra_args_attach_to_root_only() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"a": "wireit", "b": "wireit"},
            "wireit": {
                "a": {"command": "true", "dependencies": ["b"]},
                "b": {"command": "true"}
            }
        }"#,
    );

    let analyzer = Analyzer::new(Arc::new(ManifestReader::new()));
    let analysis = analyzer
        .analyze(
            ScriptReference::new(temp.path().to_path_buf(), "a"),
            &["--flag".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(analysis.graph.root().extra_args, vec!["--flag".to_string()]);
    let dep_key = &analysis.graph.root().dependencies[0].target;
    assert!(analysis.graph.get(dep_key).unwrap().extra_args.is_empty());
}
