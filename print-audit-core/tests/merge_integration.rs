use std::fs;
use std::path::Path;

use tempfile::tempdir;

use print_audit_core::grouping::{group_directory, GrammarChoice, NamingGrammar, Part};
use print_audit_core::merge::{
    merge_group, MergeError, MergeOptions, MtimePolicy, DEFAULT_TIMESTAMP_FORMAT,
    DEFAULT_UTC_OFFSET_MINUTES,
};
use print_audit_core::progress::{ProgressPaths, ProgressStore};
use print_audit_core::report::Stage;
use print_audit_core::synchronise::merge_all;

fn write_parts(dir: &Path, parts: &[(&str, &[u8])]) {
    fs::create_dir_all(dir).unwrap();
    for (name, bytes) in parts {
        fs::write(dir.join(name), bytes).unwrap();
    }
}

fn options(out: &Path) -> MergeOptions {
    MergeOptions::new(
        out,
        DEFAULT_TIMESTAMP_FORMAT,
        MtimePolicy::Max,
        DEFAULT_UTC_OFFSET_MINUTES,
    )
    .unwrap()
}

fn ctrl() -> NamingGrammar {
    GrammarChoice::Ctrl.build().unwrap()
}

#[test]
fn test_group_without_metadata_is_named_by_key_only() {
    let root = tempdir().unwrap();
    let src = root.path().join("decrypted");
    write_parts(
        &src,
        &[
            ("2wpa_ctrl_job13_10012-2", b"two"),
            ("1wpa_ctrl_job13_10011-2", b"one"),
        ],
    );
    let store = ProgressStore::open(ProgressPaths::in_dir(root.path())).unwrap();

    let report = merge_all(&src, &ctrl(), &store, &options(&root.path().join("merge")));

    let artifact = &report.artifacts[0];
    assert_eq!(artifact.timestamp, None);
    assert_eq!(artifact.path, root.path().join("merge").join("wpa-job13-2"));
    assert_eq!(fs::read(&artifact.path).unwrap(), b"onetwo");
}

#[test]
fn test_duplicate_sequence_fails_only_that_group() {
    let root = tempdir().unwrap();
    let src = root.path().join("decrypted");
    write_parts(
        &src,
        &[
            ("1wpa_ctrl_job13_10011-2", b"a"),
            ("01wpa_ctrl_job13_10011-2", b"b"),
            ("1abc_ctrl_job1_5-1", b"fine"),
        ],
    );
    let store = ProgressStore::open(ProgressPaths::in_dir(root.path())).unwrap();
    let out = root.path().join("merge");

    let report = merge_all(&src, &ctrl(), &store, &options(&out));

    assert_eq!(report.summary.succeeded, 1);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.failures[0].name, "wpa-job13-2");
    assert_eq!(report.failures[0].stage, Stage::Merge);
    assert!(out.join("abc-job1-1").exists());
    assert!(!out.join("wpa-job13-2").exists());
}

#[test]
fn test_unreadable_part_leaves_best_effort_artifact() {
    let root = tempdir().unwrap();
    let src = root.path().join("decrypted");
    write_parts(
        &src,
        &[
            ("1wpa_ctrl_job13_10011-2", b"one"),
            ("3wpa_ctrl_job13_10013-2", b"three"),
        ],
    );
    let mut store = ProgressStore::open(ProgressPaths::in_dir(root.path())).unwrap();
    store
        .upsert_metadata("1wpa_ctrl_job13_10011-2", 1_704_151_800, 7)
        .unwrap();

    let grammar = ctrl();
    let mut parts: Vec<Part> = group_directory(&grammar, &src)
        .remove("wpa-job13-2")
        .unwrap();
    // Listed but gone by the time it is read.
    parts.push(grammar.part(&src, "2wpa_ctrl_job13_10012-2").unwrap());

    let artifact = merge_group("wpa-job13-2", &parts, &store, &options(&root.path().join("merge")))
        .unwrap();

    assert!(!artifact.is_complete());
    assert_eq!(artifact.parts_written, 2);
    assert_eq!(artifact.parts_failed, 1);
    assert_eq!(artifact.timestamp.as_deref(), Some("20240102073000"));
    assert_eq!(fs::read(&artifact.path).unwrap(), b"onethree");
}

#[test]
fn test_empty_group_is_rejected() {
    let root = tempdir().unwrap();
    let store = ProgressStore::open(ProgressPaths::in_dir(root.path())).unwrap();
    let err = merge_group("k", &[], &store, &options(root.path())).unwrap_err();
    assert!(matches!(err, MergeError::EmptyGroup(_)));
}

#[test]
fn test_ctrl_job_grammar_groups_by_prefix_job_and_operation() {
    let root = tempdir().unwrap();
    let src = root.path().join("decrypted");
    write_parts(
        &src,
        &[
            ("printer_ctrl__job123_002-print.dat", b"2"),
            ("printer_ctrl__job123_001-print.dat", b"1"),
            ("printer_ctrl__job123_001-scan.dat", b"s"),
            ("1wpa_ctrl_job13_10011-2", b"other grammar"),
        ],
    );
    let grammar = GrammarChoice::CtrlJob.build().unwrap();

    let groups = group_directory(&grammar, &src);

    let keys: Vec<_> = groups.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["printer-123-print", "printer-123-scan"]);
    let seqs: Vec<_> = groups["printer-123-print"].iter().map(|p| p.sequence).collect();
    assert_eq!(seqs, vec![1, 2]);
}

#[test]
fn test_missing_source_directory_yields_no_groups() {
    let root = tempdir().unwrap();
    assert!(group_directory(&ctrl(), &root.path().join("absent")).is_empty());
}
