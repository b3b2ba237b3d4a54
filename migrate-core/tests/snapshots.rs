mod common;

use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

use common::*;
use migrate_core::config::Mode;
use migrate_core::ledger::BackupLedger;
use migrate_core::{InterruptLatch, MigrateError, Orchestrator, Outcome};

#[test]
fn test_rollback_returns_site_to_pre_import_state() {
    let site_dir = TempDir::new().unwrap();
    let root = site_dir.path();
    write_live_site(root);
    let before = tree_snapshot(root, &[]);
    let packages = TempDir::new().unwrap();
    let archive = packages.path().join("site.zip");
    write_zip(&archive, &duplicator_entries());

    let fake = Arc::new(FakeWp::new());
    let site = fake_site(root, &fake);
    let settings = import_settings(&archive, root);
    Orchestrator::new(&settings, InterruptLatch::detached())
        .without_tool_checks()
        .import_archive(&archive, None, &site)
        .unwrap();
    assert_ne!(tree_snapshot(root, &["db-backups", "wp-content.backup-"]), before);

    let mut settings = settings.clone();
    settings.mode = Mode::Rollback {
        site: root.to_path_buf(),
        snapshot: None,
    };
    let outcome = Orchestrator::new(&settings, InterruptLatch::detached())
        .without_tool_checks()
        .rollback(&site, None)
        .unwrap();

    assert_eq!(outcome, Outcome::RolledBack);
    assert_eq!(tree_snapshot(root, &["db-backups"]), before);
}

#[test]
fn test_interrupt_after_snapshot_then_rollback_restores_site() {
    let site_dir = TempDir::new().unwrap();
    let root = site_dir.path();
    write_live_site(root);
    let before = tree_snapshot(root, &[]);
    let packages = TempDir::new().unwrap();
    let archive = packages.path().join("site.zip");
    write_zip(&archive, &duplicator_entries());

    // The latch trips while the snapshot is being taken; the run stops at
    // the next phase boundary with the content already moved aside.
    let latch = InterruptLatch::detached();
    let fake = Arc::new(FakeWp::new().interrupt_after("db export", latch));
    let site = fake_site(root, &fake);
    let settings = import_settings(&archive, root);
    let err = Orchestrator::new(&settings, latch)
        .without_tool_checks()
        .import_archive(&archive, None, &site)
        .unwrap_err();

    assert!(matches!(err, MigrateError::Interrupted { .. }));
    assert_eq!(err.exit_code(), 130);
    assert!(!fake.calls().iter().any(|c| c.starts_with("db import") || c.starts_with("db reset")));
    assert!(!root.join(".maintenance").exists());
    assert!(!root.join("wp-content").exists());
    let set = BackupLedger::new(&site).find(None).unwrap();
    assert!(set.content.as_deref().is_some_and(|c| c.is_dir()));

    let mut settings = settings.clone();
    settings.mode = Mode::Rollback {
        site: root.to_path_buf(),
        snapshot: Some(set.stamp.clone()),
    };
    let fresh = Arc::new(FakeWp::new());
    let site = fake_site(root, &fresh);
    let outcome = Orchestrator::new(&settings, InterruptLatch::detached())
        .without_tool_checks()
        .rollback(&site, Some(&set.stamp))
        .unwrap();

    assert_eq!(outcome, Outcome::RolledBack);
    assert_eq!(tree_snapshot(root, &["db-backups"]), before);
}

#[test]
fn test_rollback_to_unknown_snapshot_lists_available() {
    let site_dir = TempDir::new().unwrap();
    let root = site_dir.path();
    write_live_site(root);
    fs::create_dir_all(root.join("db-backups")).unwrap();
    fs::write(root.join("db-backups/20240101-000000.sql"), LIVE_DB).unwrap();

    let fake = Arc::new(FakeWp::new());
    let site = fake_site(root, &fake);
    let mut settings = import_settings(root, root);
    settings.mode = Mode::Rollback {
        site: root.to_path_buf(),
        snapshot: Some("19990101-000000".to_string()),
    };

    let err = Orchestrator::new(&settings, InterruptLatch::detached())
        .rollback(&site, Some("19990101-000000"))
        .unwrap_err();
    assert!(matches!(err, MigrateError::UserInput(_)));
    assert!(err.to_string().contains("20240101-000000"));
}

#[test]
fn test_backup_only_keeps_site_live() {
    let site_dir = TempDir::new().unwrap();
    let root = site_dir.path();
    write_live_site(root);
    let before = tree_snapshot(root, &[]);

    let fake = Arc::new(FakeWp::new());
    let site = fake_site(root, &fake);
    let mut settings = import_settings(root, root);
    settings.mode = Mode::BackupOnly {
        site: root.to_path_buf(),
    };

    let outcome = Orchestrator::new(&settings, InterruptLatch::detached())
        .backup_only(&site)
        .unwrap();
    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(tree_snapshot(root, &["db-backups", "wp-content.backup-"]), before);

    let set = BackupLedger::new(&site).find(None).unwrap();
    let database = set.database.expect("database snapshot");
    let manifest = BackupLedger::new(&site)
        .read_manifest(&database)
        .unwrap()
        .expect("manifest");
    assert!(manifest.digest.is_some());
    let content = set.content.expect("content copy");
    assert!(content.join("plugins/akismet/akismet.php").exists());
    assert!(set.config.is_some());
    assert!(!fake.calls().iter().any(|c| c.starts_with("maintenance-mode")));
}
