#![forbid(unsafe_code)]

use palisade_config::ConfigManager;
use std::fs;

#[test]
fn records_and_detects_hash_changes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mgr = ConfigManager::new(dir.path().to_path_buf()).expect("manager");

    fs::write(&mgr.paths.rules, r#"[{"type": "allow", "ip": "10.0.0.2"}]"#).expect("write rules");
    let meta = mgr.record_version().expect("record");
    assert_eq!(meta.version, 1);

    let snap = mgr.snapshot();
    assert!(!snap.tampered);
    assert_eq!(snap.version, 1);

    fs::write(&mgr.paths.rules, r#"[{"type": "deny", "ip": "10.0.0.9"}]"#).expect("rewrite rules");
    let snap = mgr.snapshot();
    assert!(snap.tampered);
}

#[test]
fn fresh_root_reports_version_zero_untampered() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mgr = ConfigManager::new(dir.path().to_path_buf()).expect("manager");

    let snap = mgr.snapshot();
    assert_eq!(snap.version, 0);
    assert!(!snap.tampered);

    // stray lines in the meta file are skipped, known fields still parse
    fs::write(
        dir.path().join("state").join("config_meta"),
        "version=3\nnote=manual edit\nhash=\n",
    )
    .expect("write meta");
    assert_eq!(mgr.snapshot().version, 3);
}

#[test]
fn rollback_restores_previous_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mgr = ConfigManager::new(dir.path().to_path_buf()).expect("manager");

    fs::write(&mgr.paths.rules, "v1").expect("write v1");
    mgr.record_version().expect("record v1");

    fs::write(&mgr.paths.rules, "v2").expect("write v2");
    mgr.record_version().expect("record v2");

    let snap = mgr.rollback().expect("rollback");
    assert_eq!(snap.version, 1);
    assert!(!snap.tampered);
    let restored = fs::read_to_string(&mgr.paths.rules).expect("read rules");
    assert_eq!(restored, "v1");
}

#[test]
fn resolve_path_rejects_escapes_from_the_root() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mgr = ConfigManager::new(dir.path().to_path_buf()).expect("manager");

    let inside = mgr.paths.rules.to_string_lossy().to_string();
    assert!(mgr.resolve_path(&inside).is_ok());

    assert!(mgr.resolve_path("/etc/passwd").is_err());
}

#[test]
fn old_backups_are_pruned() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mgr = ConfigManager::new_with_backups(dir.path().to_path_buf(), 2).expect("manager");

    for n in 0..4 {
        fs::write(&mgr.paths.rules, format!("v{n}")).expect("write");
        mgr.record_version().expect("record");
    }

    let versions_dir = dir.path().join("state").join("versions");
    let mut kept: Vec<u64> = fs::read_dir(versions_dir)
        .expect("read versions")
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_string_lossy().parse().ok())
        .collect();
    kept.sort_unstable();
    assert_eq!(kept, vec![3, 4]);
}
