//! Structural repair on realistic nested trees.

use std::fs;
use std::path::Path;

use stepwright_core::{find_nested_root, repair_if_nested, RepairConfig};
use walkdir::WalkDir;

fn snapshot(root: &Path) -> Vec<(String, String)> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().display().to_string();
            (rel, fs::read_to_string(e.path()).unwrap())
        })
        .collect()
}

fn nested_project(dir: &Path) -> std::path::PathBuf {
    let root = dir.join("shop");
    fs::create_dir_all(root.join("lib")).unwrap();
    fs::write(root.join("pubspec.yaml"), "name: shop\n").unwrap();
    fs::write(root.join("lib/main.dart"), "void main() {}\n").unwrap();

    let inner = root.join("shop");
    fs::create_dir_all(inner.join("lib/screens")).unwrap();
    fs::write(inner.join("pubspec.yaml"), "name: shop\nversion: 2\n").unwrap();
    fs::write(inner.join("lib/screens/cart.dart"), "class Cart {}\n").unwrap();
    root
}

#[test]
fn repair_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let root = nested_project(dir.path());
    let config = RepairConfig::default();

    let first = repair_if_nested(&root, &config).unwrap();
    assert!(first.repaired());
    let after_first = snapshot(&root);

    let second = repair_if_nested(&root, &config).unwrap();
    assert!(!second.repaired());
    assert_eq!(second.files_moved, 0);
    assert_eq!(snapshot(&root), after_first);
}

#[test]
fn merged_tree_keeps_outer_only_files() {
    let dir = tempfile::tempdir().unwrap();
    let root = nested_project(dir.path());
    repair_if_nested(&root, &RepairConfig::default()).unwrap();

    assert!(find_nested_root(&root, &RepairConfig::default()).is_none());
    assert_eq!(
        fs::read_to_string(root.join("pubspec.yaml")).unwrap(),
        "name: shop\nversion: 2\n"
    );
    assert!(root.join("lib/main.dart").exists());
    assert!(root.join("lib/screens/cart.dart").exists());
    let leftovers: Vec<_> = fs::read_dir(&root)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(".stepwright-nested"))
        .collect();
    assert!(leftovers.is_empty());
}
