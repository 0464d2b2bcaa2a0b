use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::{tempdir, TempDir};

use print_audit_core::contract::{
    DecryptionError, MockCommandRunner, MockDecryptor, MockTransport, RemoteItem, ToolInvocation,
    ToolOutcome, TransportError,
};
use print_audit_core::convert::{ConvertOptions, Converter, OutputFormat};
use print_audit_core::fetch::FetchLayout;
use print_audit_core::grouping::GrammarChoice;
use print_audit_core::merge::{
    MergeOptions, MtimePolicy, DEFAULT_TIMESTAMP_FORMAT, DEFAULT_UTC_OFFSET_MINUTES,
};
use print_audit_core::progress::{ProgressPaths, ProgressStore};
use print_audit_core::report::Stage;
use print_audit_core::stability::StabilityOptions;
use print_audit_core::synchronise::{merge_all, run, synchronise, PipelineConfig};

const REMOTE_DIR: &str = "/root/abc/uploads";

struct Workspace {
    _root: TempDir,
    layout: FetchLayout,
    state_dir: PathBuf,
    merge_dir: PathBuf,
    converted_dir: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let root = tempdir().unwrap();
        let base = root.path().to_path_buf();
        Self {
            layout: FetchLayout {
                remote_dir: REMOTE_DIR.to_string(),
                download_dir: base.join("downloads"),
                decrypt_dir: base.join("decrypted"),
            },
            state_dir: base.clone(),
            merge_dir: base.join("merge"),
            converted_dir: base.join("converted"),
            _root: root,
        }
    }

    fn store(&self) -> ProgressStore {
        ProgressStore::open(ProgressPaths::in_dir(&self.state_dir)).unwrap()
    }

    fn merge_options(&self, policy: MtimePolicy) -> MergeOptions {
        MergeOptions::new(
            &self.merge_dir,
            DEFAULT_TIMESTAMP_FORMAT,
            policy,
            DEFAULT_UTC_OFFSET_MINUTES,
        )
        .unwrap()
    }

    fn pipeline(&self, convert: bool) -> PipelineConfig {
        PipelineConfig {
            layout: self.layout.clone(),
            stability: quick(),
            grammar: GrammarChoice::Ctrl.build().unwrap(),
            merge: self.merge_options(MtimePolicy::Max),
            converted_dir: convert.then(|| self.converted_dir.clone()),
        }
    }
}

fn quick() -> StabilityOptions {
    StabilityOptions {
        interval: Duration::from_secs(1),
        max_rounds: 0,
    }
}

/// Remote files as `(name, plaintext, mtime)`; ciphertext is `enc:` + plaintext.
fn remote(files: &[(&str, &[u8], i64)]) -> (Vec<RemoteItem>, HashMap<String, Vec<u8>>) {
    let mut items = Vec::new();
    let mut contents = HashMap::new();
    for (name, plain, mtime) in files {
        let mut cipher = b"enc:".to_vec();
        cipher.extend_from_slice(plain);
        items.push(RemoteItem {
            name: name.to_string(),
            size: cipher.len() as u64,
            modified_at: *mtime,
        });
        contents.insert(name.to_string(), cipher);
    }
    (items, contents)
}

/// Lists `items` forever and serves `contents` on fetch.
fn serving(items: Vec<RemoteItem>, contents: HashMap<String, Vec<u8>>) -> MockTransport {
    let mut transport = MockTransport::new();
    transport.expect_list().returning(move |_| Ok(items.clone()));
    transport
        .expect_fetch()
        .returning(move |remote_file: &str, local: &Path| {
            let name = remote_file.rsplit('/').next().unwrap_or(remote_file);
            let bytes = contents
                .get(name)
                .ok_or_else(|| TransportError::NotFound(remote_file.to_string()))?;
            fs::write(local, bytes)?;
            Ok(bytes.len() as u64)
        });
    transport
}

/// A transport that only lists; any fetch panics the test.
fn listing_only(items: Vec<RemoteItem>) -> MockTransport {
    let mut transport = MockTransport::new();
    transport.expect_list().returning(move |_| Ok(items.clone()));
    transport
}

fn strip_enc(ciphertext: &[u8]) -> Result<Vec<u8>, DecryptionError> {
    ciphertext
        .strip_prefix(b"enc:")
        .map(<[u8]>::to_vec)
        .ok_or(DecryptionError::InvalidCiphertext)
}

fn decryptor() -> MockDecryptor {
    let mut decryptor = MockDecryptor::new();
    decryptor.expect_decrypt().returning(strip_enc);
    decryptor
}

fn idle_converter() -> Converter<MockCommandRunner> {
    Converter::new(MockCommandRunner::new(), ConvertOptions::default())
}

fn job13() -> Vec<(&'static str, &'static [u8], i64)> {
    vec![
        // 2024-01-01T23:30:00Z
        ("3wpa_ctrl_job13_10013-2", b"CCC", 1_704_151_800),
        ("1wpa_ctrl_job13_10011-2", b"AAA", 1_704_151_000),
        ("2wpa_ctrl_job13_10012-2", b"BBB", 1_704_151_500),
        ("notes.txt", b"not a part", 1),
    ]
}

#[tokio::test(start_paused = true)]
async fn test_second_sync_on_unchanged_listing_does_no_work() {
    let ws = Workspace::new();
    let (items, contents) = remote(&job13());

    let mut store = ws.store();
    let first = synchronise(&ws.layout, quick(), &serving(items.clone(), contents), &decryptor(), &mut store)
        .await
        .unwrap();
    assert_eq!(first.listed, 4);
    assert_eq!(first.fetch.succeeded, 4);
    assert_eq!(first.decrypt.succeeded, 4);
    assert!(first.failures.is_empty());
    for item in &items {
        assert!(store.has_fetched(&item.name));
        assert!(store.has_decrypted(&item.name));
    }
    assert_eq!(
        fs::read(ws.layout.decrypt_dir.join("1wpa_ctrl_job13_10011-2")).unwrap(),
        b"AAA"
    );
    drop(store);

    // Fresh process: records come back from disk; no fetch or decrypt expectations are set.
    let mut store = ws.store();
    let second = synchronise(&ws.layout, quick(), &listing_only(items), &MockDecryptor::new(), &mut store)
        .await
        .unwrap();
    assert_eq!(second.fetch.skipped, 4);
    assert_eq!(second.fetch.attempted, 0);
    assert_eq!(second.decrypt.skipped, 4);
    assert_eq!(second.decrypt.attempted, 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_local_files_are_redone() {
    let ws = Workspace::new();
    let (items, contents) = remote(&job13());
    let mut store = ws.store();
    synchronise(&ws.layout, quick(), &serving(items.clone(), contents.clone()), &decryptor(), &mut store)
        .await
        .unwrap();

    fs::remove_file(ws.layout.download_dir.join("1wpa_ctrl_job13_10011-2")).unwrap();
    fs::remove_file(ws.layout.decrypt_dir.join("2wpa_ctrl_job13_10012-2")).unwrap();

    let mut transport = listing_only(items);
    transport
        .expect_fetch()
        .times(1)
        .returning(move |remote_file: &str, local: &Path| {
            assert!(remote_file.ends_with("/1wpa_ctrl_job13_10011-2"));
            fs::write(local, &contents["1wpa_ctrl_job13_10011-2"])?;
            Ok(7)
        });
    let mut decrypt_once = MockDecryptor::new();
    decrypt_once.expect_decrypt().times(1).returning(strip_enc);

    let report = synchronise(&ws.layout, quick(), &transport, &decrypt_once, &mut store)
        .await
        .unwrap();
    assert_eq!(report.fetch.succeeded, 1);
    assert_eq!(report.fetch.skipped, 3);
    assert_eq!(report.decrypt.succeeded, 1);
    assert_eq!(report.decrypt.skipped, 3);
    assert_eq!(
        fs::read(ws.layout.decrypt_dir.join("2wpa_ctrl_job13_10012-2")).unwrap(),
        b"BBB"
    );
}

#[tokio::test(start_paused = true)]
async fn test_item_failures_do_not_stop_siblings() {
    let ws = Workspace::new();
    let (mut items, mut contents) = remote(&[
        ("1abc_ctrl_job1_5-1", b"good", 10),
        ("2abc_ctrl_job1_5-1", b"good too", 20),
    ]);
    // Corrupt ciphertext for one item; the other vanishes between listing and fetch.
    items.push(RemoteItem {
        name: "3abc_ctrl_job1_5-1".to_string(),
        size: 3,
        modified_at: 30,
    });
    contents.insert("3abc_ctrl_job1_5-1".to_string(), b"???".to_vec());
    items.push(RemoteItem {
        name: "4abc_ctrl_job1_5-1".to_string(),
        size: 3,
        modified_at: 40,
    });

    let mut store = ws.store();
    let report = synchronise(&ws.layout, quick(), &serving(items, contents), &decryptor(), &mut store)
        .await
        .unwrap();

    assert_eq!(report.fetch.succeeded, 3);
    assert_eq!(report.fetch.failed, 1);
    assert_eq!(report.decrypt.succeeded, 2);
    assert_eq!(report.decrypt.failed, 1);

    let failed: Vec<_> = report.failures.iter().map(|f| (f.name.as_str(), f.stage)).collect();
    assert!(failed.contains(&("3abc_ctrl_job1_5-1", Stage::Decrypt)));
    assert!(failed.contains(&("4abc_ctrl_job1_5-1", Stage::Fetch)));

    assert!(store.has_fetched("3abc_ctrl_job1_5-1"));
    assert!(!store.has_decrypted("3abc_ctrl_job1_5-1"));
    assert!(!store.has_fetched("4abc_ctrl_job1_5-1"));
    assert!(!ws.layout.download_dir.join(".4abc_ctrl_job1_5-1.partial").exists());
    // Metadata is kept even for failed items.
    assert_eq!(store.get_metadata("4abc_ctrl_job1_5-1").unwrap().mtime, 40);
}

#[tokio::test(start_paused = true)]
async fn test_full_run_merges_in_sequence_order_with_utc8_timestamp() {
    let ws = Workspace::new();
    let (items, contents) = remote(&job13());
    let mut store = ws.store();

    let report = run(
        &ws.pipeline(false),
        &serving(items, contents),
        &decryptor(),
        &idle_converter(),
        &mut store,
    )
    .await
    .unwrap();

    assert!(report.convert.is_none());
    assert_eq!(report.merge.summary.succeeded, 1);
    assert_eq!(report.merge.artifacts.len(), 1);
    let artifact = &report.merge.artifacts[0];
    assert_eq!(artifact.group_key, "wpa-job13-2");
    assert_eq!(artifact.timestamp.as_deref(), Some("20240102073000"));
    assert_eq!(
        artifact.path,
        ws.merge_dir.join("wpa-job13-2_20240102073000")
    );
    assert_eq!(fs::read(&artifact.path).unwrap(), b"AAABBBCCC");

    // notes.txt is decrypted but never merged.
    let merged: Vec<_> = fs::read_dir(&ws.merge_dir).unwrap().collect();
    assert_eq!(merged.len(), 1);
    assert_eq!(report.failures().count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_full_run_converts_artifacts_when_enabled() {
    let ws = Workspace::new();
    let (items, contents) = remote(&job13());
    let mut store = ws.store();

    let mut runner = MockCommandRunner::new();
    runner.expect_is_available().returning(|_| true);
    runner
        .expect_run()
        .times(1)
        .returning(|invocation: &ToolInvocation, _timeout: Duration| {
            fs::write(&invocation.output, b"%PDF-1.7")?;
            Ok(ToolOutcome {
                exit_code: Some(0),
                stderr: String::new(),
            })
        });
    let converter = Converter::new(
        runner,
        ConvertOptions {
            format: OutputFormat::Pdf,
            ..ConvertOptions::default()
        },
    );

    let report = run(
        &ws.pipeline(true),
        &serving(items, contents),
        &decryptor(),
        &converter,
        &mut store,
    )
    .await
    .unwrap();

    let convert = report.convert.expect("conversion should have run");
    assert_eq!(convert.summary.succeeded, 1);
    assert!(ws
        .converted_dir
        .join("wpa-job13-2_20240102073000.pdf")
        .exists());
}

#[tokio::test(start_paused = true)]
async fn test_min_policy_uses_first_arrival() {
    let ws = Workspace::new();
    let (items, contents) = remote(&job13());
    let mut store = ws.store();
    synchronise(&ws.layout, quick(), &serving(items, contents), &decryptor(), &mut store)
        .await
        .unwrap();

    let grammar = GrammarChoice::Ctrl.build().unwrap();
    let report = merge_all(
        &ws.layout.decrypt_dir,
        &grammar,
        &store,
        &ws.merge_options(MtimePolicy::Min),
    );
    // 2024-01-01T23:16:40Z
    assert_eq!(
        report.artifacts[0].timestamp.as_deref(),
        Some("20240102071640")
    );
}

#[tokio::test(start_paused = true)]
async fn test_rerunning_merge_never_overwrites() {
    let ws = Workspace::new();
    let (items, contents) = remote(&job13());
    let mut store = ws.store();
    synchronise(&ws.layout, quick(), &serving(items, contents), &decryptor(), &mut store)
        .await
        .unwrap();

    let grammar = GrammarChoice::Ctrl.build().unwrap();
    let options = ws.merge_options(MtimePolicy::Max);
    let first = merge_all(&ws.layout.decrypt_dir, &grammar, &store, &options);
    let second = merge_all(&ws.layout.decrypt_dir, &grammar, &store, &options);

    assert_eq!(
        first.artifacts[0].path,
        ws.merge_dir.join("wpa-job13-2_20240102073000")
    );
    assert_eq!(
        second.artifacts[0].path,
        ws.merge_dir.join("wpa-job13-2_20240102073000_1")
    );
    assert_eq!(fs::read(&first.artifacts[0].path).unwrap(), b"AAABBBCCC");
    assert_eq!(fs::read(&second.artifacts[0].path).unwrap(), b"AAABBBCCC");
}
