use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Output},
};

use gifsmith_core::logging::{
    crash_dir, enter_encode_context, install_crash_reporter, mark_frame, CrashReporter,
    EncodeStage,
};
use tempfile::tempdir;
use uuid::Uuid;

const CHILD_MODE_ENV: &str = "GIFSMITH_PANIC_CHILD_MODE";
const CHILD_DATA_DIR_ENV: &str = "GIFSMITH_PANIC_CHILD_DATA_DIR";
const CHILD_JOB_ID: &str = "6f1c2d3e-4b5a-4c7d-8e9f-0a1b2c3d4e5f";

/// Re-run this test binary, filtered to the child entrypoint, so the panic
/// happens in a separate process.
fn run_panic_child(mode: &str, data_dir: &Path) -> Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .arg("panic_hook_child_entrypoint")
        .arg("--exact")
        .arg("--nocapture")
        .env(CHILD_MODE_ENV, mode)
        .env(CHILD_DATA_DIR_ENV, data_dir)
        .output()
        .expect("run panic hook child")
}

fn crash_artifacts(data_dir: &Path) -> Vec<PathBuf> {
    let mut paths = fs::read_dir(crash_dir(data_dir))
        .expect("read crash directory")
        .map(|entry| entry.expect("read crash directory entry").path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("log"))
        .collect::<Vec<_>>();
    paths.sort();
    paths
}

#[test]
fn panic_hook_child_entrypoint() {
    let Ok(mode) = std::env::var(CHILD_MODE_ENV) else {
        return;
    };
    let data_dir = PathBuf::from(
        std::env::var(CHILD_DATA_DIR_ENV).expect("child data dir must be set"),
    );

    assert!(matches!(
        install_crash_reporter(Some(data_dir.as_path())),
        CrashReporter::Enabled { .. }
    ));
    assert!(matches!(
        install_crash_reporter(Some(data_dir.as_path())),
        CrashReporter::Enabled {
            newly_installed: false,
            ..
        }
    ));

    match mode.as_str() {
        "worker_thread" => {
            let worker = std::thread::Builder::new()
                .name("gifsmith-encode-test".to_string())
                .spawn(|| {
                    let job_id = Uuid::parse_str(CHILD_JOB_ID).expect("job id");
                    let _context = enter_encode_context(Some(job_id), 5);
                    mark_frame(EncodeStage::Encode, Some(3));
                    panic!("intentional panic on encoder thread")
                })
                .expect("spawn worker");
            let _ = worker.join();
            panic!("worker thread panicked");
        }
        "unwritable" => {
            let crash_dir = crash_dir(&data_dir);
            if crash_dir.exists() {
                fs::remove_dir_all(&crash_dir).expect("remove crash directory");
            }
            fs::write(&crash_dir, b"not-a-directory").expect("replace crash directory with file");
            panic!("intentional panic with unwritable crash dir");
        }
        other => panic!("unknown panic hook child mode: {other}"),
    }
}

#[test]
fn crash_report_names_thread_job_and_frame() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("worker_thread", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let artifacts = crash_artifacts(data_dir.path());
    assert!(!artifacts.is_empty(), "expected crash artifacts");

    let contents: Vec<String> = artifacts
        .iter()
        .map(|path| fs::read_to_string(path).expect("read crash artifact"))
        .collect();
    assert!(contents.iter().any(|c| {
        c.contains("thread=gifsmith-encode-test")
            && c.contains("payload=intentional panic on encoder thread")
            && c.contains(&format!("job_id={CHILD_JOB_ID}"))
            && c.contains("stage=encode")
            && c.contains("frame_index=3")
    }));
    assert!(artifacts.iter().any(|path| path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.contains("-6f1c2d3e-"))));
    // The main thread panics outside any encode.
    assert!(contents.iter().any(|c| c.contains("job_id=none")));
    assert!(contents.iter().all(|c| c.contains("backtrace_policy=")));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("thread panicked while panicking"));
}

#[test]
fn unwritable_crash_dir_warns_and_does_not_repanic() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("unwritable", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("intentional panic with unwritable crash dir"));
    assert!(stderr.contains("Warning: could not write crash report under"));
    assert!(!stderr.contains("thread panicked while panicking"));
}
