use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use mockall::Sequence;
use tempfile::tempdir;

use print_audit_core::contract::{ConversionError, MockCommandRunner, ToolInvocation, ToolOutcome};
use print_audit_core::convert::{ConvertOptions, Converter, OutputFormat, ToolChoice};

const PJL_STREAM: &[u8] = b"\x1b%-12345X@PJL JOB\r\n\x1bE...";

fn pdf_options(tool: ToolChoice) -> ConvertOptions {
    ConvertOptions {
        format: OutputFormat::Pdf,
        tool,
        timeout: Duration::from_secs(5),
        ..ConvertOptions::default()
    }
}

fn exit(code: i32) -> ToolOutcome {
    ToolOutcome {
        exit_code: Some(code),
        stderr: if code == 0 { String::new() } else { "bad stream".to_string() },
    }
}

#[tokio::test]
async fn falls_back_to_next_candidate_after_failure() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("wpa-job13-2_20240102073000");
    fs::write(&input, PJL_STREAM).unwrap();
    let out = dir.path().join("converted");

    let mut seq = Sequence::new();
    let mut runner = MockCommandRunner::new();
    runner.expect_is_available().returning(|_| true);
    runner
        .expect_run()
        .times(1)
        .in_sequence(&mut seq)
        .withf(|inv: &ToolInvocation, _| inv.program == "gpcl6")
        .returning(|_, _| Ok(exit(1)));
    runner
        .expect_run()
        .times(1)
        .in_sequence(&mut seq)
        .withf(|inv: &ToolInvocation, _| inv.program == "pcl6")
        .returning(|inv: &ToolInvocation, _| {
            fs::write(&inv.output, b"%PDF-1.7")?;
            Ok(exit(0))
        });

    let converter = Converter::new(runner, pdf_options(ToolChoice::Auto));
    let outputs = converter.convert(&input, &out).await.unwrap();

    assert_eq!(outputs, vec![out.join("wpa-job13-2_20240102073000.pdf")]);
}

#[tokio::test]
async fn pinned_tool_is_the_only_attempt() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("job");
    fs::write(&input, PJL_STREAM).unwrap();

    let mut runner = MockCommandRunner::new();
    runner
        .expect_is_available()
        .withf(|program: &str| program == "gs")
        .returning(|_| true);
    runner.expect_run().times(1).returning(|_, _| Ok(exit(1)));

    let converter = Converter::new(runner, pdf_options(ToolChoice::Gs));
    let err = converter.convert(&input, dir.path()).await.unwrap_err();

    match err {
        ConversionError::AllCandidatesFailed { input: failed, last } => {
            assert_eq!(failed, input);
            assert!(last.contains("gs"), "{last}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn zero_exit_without_output_is_not_success() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("job");
    fs::write(&input, b"%PDF-1.4 tiny").unwrap();

    let mut runner = MockCommandRunner::new();
    runner.expect_is_available().returning(|_| true);
    // gs, gpcl6, pcl6 all "succeed" without writing anything.
    runner.expect_run().times(3).returning(|_, _| Ok(exit(0)));

    let converter = Converter::new(runner, pdf_options(ToolChoice::Auto));
    assert!(converter.convert(&input, dir.path()).await.is_err());
}

#[tokio::test]
async fn missing_tools_are_skipped_without_running() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("job");
    fs::write(&input, PJL_STREAM).unwrap();

    let mut runner = MockCommandRunner::new();
    runner.expect_is_available().returning(|_| false);
    runner.expect_run().times(0);

    let converter = Converter::new(runner, pdf_options(ToolChoice::Auto));
    let (summary, failures) = converter.render_path(&input, &dir.path().join("out")).await;

    assert_eq!(summary.failed, 1);
    assert_eq!(failures.len(), 1);
    assert!(failures[0].error.contains("not found"), "{}", failures[0].error);
}

#[tokio::test]
async fn timeout_moves_on_to_the_next_candidate() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("job");
    fs::write(&input, b"%!PS-Adobe-3.0").unwrap();

    let mut runner = MockCommandRunner::new();
    runner.expect_is_available().returning(|_| true);
    runner
        .expect_run()
        .returning(|inv: &ToolInvocation, timeout: Duration| {
            if inv.program == "gs" {
                return Err(ConversionError::Timeout {
                    program: inv.program.clone(),
                    seconds: timeout.as_secs(),
                });
            }
            fs::write(&inv.output, b"%PDF")?;
            Ok(exit(0))
        });

    let converter = Converter::new(runner, pdf_options(ToolChoice::Auto));
    let outputs = converter.convert(&input, dir.path()).await.unwrap();
    assert_eq!(outputs, vec![dir.path().join("job.pdf")]);
}

#[tokio::test]
async fn directory_render_converts_every_file() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("merge");
    fs::create_dir_all(&src).unwrap();
    for name in ["a-1-1_20240101000000", "b-1-1_20240101000000"] {
        fs::write(src.join(name), PJL_STREAM).unwrap();
    }
    let out = dir.path().join("converted");

    let mut runner = MockCommandRunner::new();
    runner.expect_is_available().returning(|_| true);
    runner
        .expect_run()
        .times(2)
        .returning(|inv: &ToolInvocation, _| {
            fs::write(&inv.output, b"%PDF")?;
            Ok(exit(0))
        });

    let converter = Converter::new(runner, pdf_options(ToolChoice::Auto));
    let (summary, failures) = converter.render_path(&src, &out).await;

    assert_eq!(summary.succeeded, 2);
    assert!(failures.is_empty());
    let mut produced: Vec<PathBuf> = fs::read_dir(&out)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    produced.sort();
    assert_eq!(
        produced,
        vec![
            out.join("a-1-1_20240101000000.pdf"),
            out.join("b-1-1_20240101000000.pdf")
        ]
    );
}

#[tokio::test]
async fn output_from_an_earlier_render_does_not_count() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("art");
    fs::write(&input, PJL_STREAM).unwrap();
    let out = dir.path().join("converted");
    fs::create_dir_all(&out).unwrap();
    fs::write(out.join("art.pdf"), b"%PDF old render").unwrap();

    let mut seq = Sequence::new();
    let mut runner = MockCommandRunner::new();
    runner.expect_is_available().returning(|_| true);
    // gpcl6 exits 0 without writing; pcl6 produces the file.
    runner
        .expect_run()
        .times(1)
        .in_sequence(&mut seq)
        .withf(|inv: &ToolInvocation, _| inv.program == "gpcl6")
        .returning(|_, _| Ok(exit(0)));
    runner
        .expect_run()
        .times(1)
        .in_sequence(&mut seq)
        .withf(|inv: &ToolInvocation, _| inv.program == "pcl6")
        .returning(|inv: &ToolInvocation, _| {
            fs::write(&inv.output, b"%PDF fresh")?;
            Ok(exit(0))
        });

    let converter = Converter::new(runner, pdf_options(ToolChoice::Auto));
    let outputs = converter.convert(&input, &out).await.unwrap();

    assert_eq!(outputs, vec![out.join("art.pdf")]);
    assert_eq!(fs::read(out.join("art.pdf")).unwrap(), b"%PDF fresh");
}

#[tokio::test]
async fn pinned_no_op_with_stale_pages_fails() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("art");
    fs::write(&input, PJL_STREAM).unwrap();
    fs::write(dir.path().join("art-001.png"), b"old page").unwrap();
    fs::write(dir.path().join("art-extra-001.png"), b"other job").unwrap();

    let mut runner = MockCommandRunner::new();
    runner.expect_is_available().returning(|_| true);
    runner.expect_run().times(1).returning(|_, _| Ok(exit(0)));

    let options = ConvertOptions {
        tool: ToolChoice::Gpcl6,
        ..ConvertOptions::default()
    };
    let converter = Converter::new(runner, options);
    assert!(converter.convert(&input, dir.path()).await.is_err());
    assert!(!dir.path().join("art-001.png").exists());
    assert!(dir.path().join("art-extra-001.png").exists());
}
