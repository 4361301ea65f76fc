use latticeruntime::loader::{scan_dir, LoadError};
use latticeruntime::ComponentRegistry;
use std::path::{Path, PathBuf};

fn write(dir: &Path, name: &str, contents: &str) {
    std::fs::write(dir.join(name), contents).unwrap();
}

#[test]
fn test_scan_finds_manifests_in_name_order() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "b.component.json",
        r#"{"type": "demo.second", "command": ["sh", "-c", "true"], "category": "demo"}"#,
    );
    write(
        dir.path(),
        "a.component.json",
        r#"{"type": "demo.first", "command": ["sh"], "script": "first.sh", "requirements": "numpy"}"#,
    );
    write(dir.path(), "first.sh", "exit 0\n");
    write(dir.path(), "notes.txt", "not a manifest");

    let found = scan_dir(dir.path()).unwrap();

    let types: Vec<&str> = found
        .iter()
        .map(|(component, _)| component.manifest().component_type.as_str())
        .collect();
    assert_eq!(types, vec!["demo.first", "demo.second"]);

    let (first, source) = &found[0];
    assert_eq!(first.manifest().metadata.requirements, "numpy");
    assert_eq!(
        source.files,
        vec![PathBuf::from("a.component.json"), PathBuf::from("first.sh")]
    );
    assert_eq!(found[1].0.manifest().metadata.category, "demo");
}

#[test]
fn test_registry_registers_scanned_components() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "x.component.json", r#"{"type": "demo.x", "command": ["true"]}"#);
    let registry = ComponentRegistry::new();

    assert_eq!(registry.scan_dir(dir.path()).unwrap(), 1);

    assert!(registry.contains("demo.x"));
    assert_eq!(registry.source("demo.x").unwrap().root, dir.path());
    assert_eq!(registry.metadata("demo.x").unwrap().category, "general");
}

#[test]
fn test_manifest_without_command_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "bad.component.json", r#"{"type": "demo.bad", "command": []}"#);

    let err = scan_dir(dir.path()).err().unwrap();

    assert!(matches!(err, LoadError::Invalid { ref reason, .. } if reason == "missing command"));
}

#[test]
fn test_manifest_with_missing_script_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "gone.component.json",
        r#"{"type": "demo.gone", "command": ["sh"], "script": "gone.sh"}"#,
    );

    assert!(matches!(scan_dir(dir.path()), Err(LoadError::Invalid { .. })));
}

#[test]
fn test_malformed_manifest_reports_its_path() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "broken.component.json", "{ not json");

    match scan_dir(dir.path()) {
        Err(LoadError::Manifest { path, .. }) => {
            assert_eq!(path, dir.path().join("broken.component.json"));
        }
        other => panic!("expected a manifest error, got {:?}", other.map(|f| f.len())),
    }
}

#[test]
fn test_missing_directory_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();

    assert!(matches!(
        scan_dir(&dir.path().join("absent")),
        Err(LoadError::Io { .. })
    ));
}
