use tagledger::core::error::TagError;
use tagledger::core::fsio;
use tagledger::core::lock::{self, LockOutcome};
use tagledger::core::policy::{self, AuthorityTier, Policy};
use tagledger::core::store::Store;
use tagledger::core::tag_id::{TagId, TagType};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};
use tempfile::tempdir;

#[test]
fn policy_file_overrides_defaults() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path());
    fs::create_dir_all(&store.state_dir).unwrap();
    fs::write(
        store.default_policy_path(),
        r#"
reservation_expiry_hours = 24
max_checkpoints = 3
rollback_lock_timeout = 0.5

[topline]
max_scan_lines = 5

[authority_hierarchy]
highest = ["design/**"]
high = []
medium = []
low = []
"#,
    )
    .unwrap();

    let policy = policy::load_policy(&store, None).unwrap();
    assert_eq!(policy.reservation_expiry_hours, 24);
    assert_eq!(policy.max_checkpoints, 3);
    assert_eq!(policy.max_scan_lines, 5);
    assert_eq!(policy.rollback_lock_timeout, Duration::from_millis(500));
    assert_eq!(
        policy.authority_tier("design/api.md"),
        Some(AuthorityTier::Highest)
    );
    assert_eq!(policy.authority_tier("src/lib.rs"), None);
    // Untouched keys keep their defaults.
    assert!(policy.backup_before_rollback);
}

#[test]
fn policy_missing_default_is_not_an_error() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path());
    let policy = policy::load_policy(&store, None).unwrap();
    assert_eq!(policy.max_checkpoints, 10);
}

#[test]
fn policy_explicit_missing_path_is_config_missing() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path());
    let err = policy::load_policy(&store, Some(&tmp.path().join("nope.toml"))).unwrap_err();
    assert!(matches!(err, TagError::ConfigMissing(_)));
    assert_eq!(err.kind(), "config_missing");
}

#[test]
fn policy_rejects_bad_values() {
    assert!(matches!(
        Policy::from_toml_str("rollback_lock_timeout = -1.0\n"),
        Err(TagError::ValidationError(_))
    ));
    assert!(matches!(
        Policy::from_toml_str("eligible = [\"[\"]\n"),
        Err(TagError::PatternError(_))
    ));
    assert!(matches!(
        Policy::from_toml_str("max_checkpoints = \"ten\"\n"),
        Err(TagError::TomlError(_))
    ));
}

#[test]
fn policy_eligibility_honours_exclusions() {
    let policy = Policy::default();
    assert!(policy.is_eligible("src/lib.rs"));
    assert!(policy.is_eligible("README.md"));
    assert!(!policy.is_eligible(".git/config"));
    assert!(!policy.is_eligible(".tagledger/ledger.jsonl"));
    assert!(!policy.is_eligible("target/debug/build.rs"));
}

#[test]
fn store_keys_are_root_relative() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path());
    let abs = tmp.path().join("src").join("lib.rs");
    assert_eq!(store.relative_key(&abs), "src/lib.rs");
    assert_eq!(store.relative_key(Path::new("docs/a.md")), "docs/a.md");
    assert_eq!(store.resolve_key("src/lib.rs"), abs);
    assert!(store.ledger_path().starts_with(tmp.path().join(".tagledger")));
}

#[test]
fn tag_ids_parse_and_render() {
    let id: TagId = "@SPEC:USER-AUTH-0042".parse().unwrap();
    assert_eq!(id.tag_type, TagType::Spec);
    assert_eq!(id.domain, "USER-AUTH");
    assert_eq!(id.numeric(), Some(42));
    assert_eq!(id.key(), "SPEC:USER-AUTH-0042");
    assert_eq!(id.to_string(), "@SPEC:USER-AUTH-0042");

    assert!("@SPEC:auth-001".parse::<TagId>().is_err());
    assert!("@FOO:AUTH-001".parse::<TagId>().is_err());
    assert!("@SPEC:AUTH-01".parse::<TagId>().is_err());

    let found = TagId::find_all("see @CODE:PAY-001 and @TEST:PAY-001, not @SPEC:PAY-1");
    assert_eq!(found.len(), 2);
    assert_eq!(found[1].tag_type, TagType::Test);
}

#[test]
fn lock_is_exclusive_until_dropped() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("state").join("x.lock");

    let lease = lock::try_acquire_lock(&path).unwrap().expect("first acquire");
    assert!(lock::try_acquire_lock(&path).unwrap().is_none());
    drop(lease);
    assert!(!path.exists());
    assert!(lock::try_acquire_lock(&path).unwrap().is_some());
}

#[test]
fn lock_wait_fails_open_after_timeout() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("held.lock");
    let _held = lock::try_acquire_lock(&path).unwrap().unwrap();

    let started = Instant::now();
    let outcome = lock::acquire_with_timeout(&path, Duration::from_millis(60)).unwrap();
    assert!(matches!(outcome, LockOutcome::FailedOpen { .. }));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn lock_held_for_long_is_not_taken_over() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("slow.lock");
    let held = lock::try_acquire_lock(&path).unwrap().unwrap();
    let aged = std::time::SystemTime::now() - Duration::from_secs(3600);
    fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(aged)
        .unwrap();

    let outcome = lock::acquire_with_timeout(&path, Duration::from_millis(100)).unwrap();
    assert!(!outcome.is_acquired());
    assert!(fs::read_to_string(&path).unwrap().contains(held.token()));
    drop(outcome);
    assert!(path.exists());

    drop(held);
    assert!(!path.exists());
}

#[test]
fn lock_waiters_take_turns() {
    let tmp = tempdir().unwrap();
    let path = Arc::new(tmp.path().join("turns.lock"));
    let counter = Arc::new(std::sync::Mutex::new(Vec::new()));
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let path = Arc::clone(&path);
            let counter = Arc::clone(&counter);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                let outcome = lock::acquire_with_timeout(&path, Duration::from_secs(5)).unwrap();
                assert!(outcome.is_acquired());
                counter.lock().unwrap().push(i);
                std::thread::sleep(Duration::from_millis(5));
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(counter.lock().unwrap().len(), 4);
}

#[test]
fn atomic_write_replaces_whole_file() {
    let tmp = tempdir().unwrap();
    let target = tmp.path().join("nested").join("index.json");
    fsio::write_atomic(&target, b"first version, longer").unwrap();
    fsio::write_atomic(&target, b"second").unwrap();
    assert_eq!(fs::read(&target).unwrap(), b"second");

    let leftovers: Vec<_> = fs::read_dir(target.parent().unwrap())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn append_line_keeps_lines_whole() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("log.jsonl");
    fsio::append_json_line(&path, &serde_json::json!({"n": 1})).unwrap();
    fsio::append_line(&path, r#"{"n":2}"#).unwrap();
    let content = fs::read_to_string(&path).unwrap();
    assert_eq!(content, "{\"n\":1}\n{\"n\":2}\n");
}

fn run_json(root: &Path, args: &[&str]) -> Value {
    let output = Command::new(env!("CARGO_BIN_EXE_tagledger"))
        .arg("--root")
        .arg(root)
        .args(["--format", "json"])
        .args(args)
        .output()
        .expect("run tagledger");
    assert!(
        output.status.success(),
        "command failed: {:?}\nstderr: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("parse json")
}

#[test]
fn cli_ledger_round_trip() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();

    let appended = run_json(
        root,
        &[
            "ledger", "append", "--op", "create", "--id", "@SPEC:AUTH-001", "--state", "active",
            "--path", "specs/auth.md", "--link", "test=@TEST:AUTH-001",
        ],
    );
    assert_eq!(appended["cmd"], "ledger.append");
    assert_eq!(appended["appended"], 1);

    let shown = run_json(root, &["ledger", "show", "@SPEC:AUTH-001"]);
    assert_eq!(shown["state"], "active");
    assert_eq!(shown["links"]["TEST"][0], "@TEST:AUTH-001");

    let listed = run_json(root, &["ledger", "list", "--state", "active"]);
    assert_eq!(listed["count"], 1);

    let missing = Command::new(env!("CARGO_BIN_EXE_tagledger"))
        .arg("--root")
        .arg(root)
        .args(["ledger", "show", "@SPEC:NOPE-001"])
        .output()
        .unwrap();
    assert!(!missing.status.success());
}

#[test]
fn cli_checkpoint_create_and_restore() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join("src")).unwrap();
    fs::write(root.join("src/lib.rs"), "pub fn ok() {}\n").unwrap();

    let created = run_json(root, &["checkpoint", "create", "-d", "baseline", "src/lib.rs"]);
    let id = created["checkpoint"]["id"].as_str().unwrap().to_string();

    fs::write(root.join("src/lib.rs"), "broken").unwrap();
    let restored = run_json(root, &["checkpoint", "rollback", &id]);
    assert_eq!(restored["success"], true);
    assert_eq!(
        fs::read_to_string(root.join("src/lib.rs")).unwrap(),
        "pub fn ok() {}\n"
    );

    let history = run_json(root, &["checkpoint", "history"]);
    assert_eq!(history["history"][0]["outcome"], "success");
}

#[test]
fn cli_hook_reads_stdin_and_reports() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join("specs")).unwrap();
    fs::write(root.join("specs/pay.md"), "# @SPEC:PAY-001 Payments\n").unwrap();

    let mut child = Command::new(env!("CARGO_BIN_EXE_tagledger"))
        .arg("--root")
        .arg(root)
        .arg("hook")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(br#"{"changed_files": ["specs/pay.md"], "actor": "agent", "checkpoint": "after edit"}"#)
        .unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());

    let response: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(response["status"], "ok");
    assert_eq!(response["counts"]["records_appended"], 1);
    assert_eq!(response["checkpoint"]["files"], 1);
}

fn run_hook(root: &Path, extra: &[&str], input: &[u8]) -> (bool, Value) {
    let mut child = Command::new(env!("CARGO_BIN_EXE_tagledger"))
        .arg("--root")
        .arg(root)
        .args(extra)
        .arg("hook")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(input).unwrap();
    let output = child.wait_with_output().unwrap();
    let response = serde_json::from_slice(&output.stdout).expect("hook prints json");
    (output.status.success(), response)
}

#[test]
fn cli_hook_malformed_request_reports_error() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();

    let (ok, response) = run_hook(root, &[], b"not json");
    assert!(ok);
    assert_eq!(response["status"], "error");
    assert_eq!(response["error"]["kind"], "json");

    let missing = root.join("nope.toml");
    let (ok, response) = run_hook(
        root,
        &["--policy", missing.to_str().unwrap()],
        br#"{"changed_files": []}"#,
    );
    assert!(ok);
    assert_eq!(response["status"], "error");
    assert_eq!(response["error"]["kind"], "config_missing");
    assert!(!root.join(".tagledger").join("ledger.jsonl").exists());
}
