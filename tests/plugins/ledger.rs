use tagledger::core::error::TagError;
use tagledger::core::policy::Policy;
use tagledger::core::store::Store;
use tagledger::core::tag_id::TagType;
use tagledger::core::time;
use tagledger::plugins::ledger::{LedgerManager, LedgerOp, LedgerRecord, TagState, project};
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

const HOUR: u64 = 3600;

#[test]
fn test_create_active_spec_is_indexed() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path());
    let policy = Policy::default();
    let ledger = LedgerManager::new(&store, &policy);

    let receipt = ledger
        .append(
            LedgerRecord::new(LedgerOp::Create, "@SPEC:AUTH-001")
                .with_state(TagState::Active)
                .with_path("specs/auth.md"),
        )
        .unwrap();
    assert_eq!(receipt.appended, 1);
    assert!(receipt.locked);

    let entry = ledger.get("@SPEC:AUTH-001").unwrap().expect("entry indexed");
    assert_eq!(entry.tag_type, TagType::Spec);
    assert_eq!(entry.domain, "AUTH");
    assert_eq!(entry.state, TagState::Active);
    assert_eq!(entry.primary_path.as_deref(), Some("specs/auth.md"));

    // The persisted index agrees with the lookup.
    let raw = fs::read_to_string(store.index_path()).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(doc["entries"]["@SPEC:AUTH-001"]["type"], "SPEC");
    assert_eq!(doc["entries"]["@SPEC:AUTH-001"]["state"], "active");
}

#[test]
fn test_stale_reservation_expires_and_is_rescinded() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path());
    let policy = Policy::default();
    let ledger = LedgerManager::new(&store, &policy);

    let reserved_at = time::now_epoch_secs() - 73 * HOUR;
    ledger
        .append(LedgerRecord::new(LedgerOp::Reserve, "@CODE:PAY-002").at(reserved_at))
        .unwrap();
    assert_eq!(
        ledger.get("@CODE:PAY-002").unwrap().unwrap().state,
        TagState::Reserved
    );

    let expired = ledger.find_expired().unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, "@CODE:PAY-002");

    let rescinded = ledger.rescind_expired("janitor").unwrap();
    assert_eq!(rescinded, vec!["@CODE:PAY-002".to_string()]);
    assert_eq!(
        ledger.get("@CODE:PAY-002").unwrap().unwrap().state,
        TagState::Rescinded
    );
    assert!(ledger.find_expired().unwrap().is_empty());
}

#[test]
fn test_fresh_reservation_is_not_expired() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path());
    let policy = Policy::default();
    let ledger = LedgerManager::new(&store, &policy);

    let reserved_at = time::now_epoch_secs() - 71 * HOUR;
    ledger
        .append(LedgerRecord::new(LedgerOp::Reserve, "@CODE:PAY-003").at(reserved_at))
        .unwrap();
    assert!(ledger.find_expired().unwrap().is_empty());
    assert!(ledger.rescind_expired("janitor").unwrap().is_empty());
}

#[test]
fn test_rebuild_is_byte_identical() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path());
    let policy = Policy::default();
    let ledger = LedgerManager::new(&store, &policy);

    ledger
        .append_batch(vec![
            LedgerRecord::new(LedgerOp::Create, "@SPEC:AUTH-001")
                .at(100)
                .with_path("specs/auth.md")
                .with_link(TagType::Test, "@TEST:AUTH-001"),
            LedgerRecord::new(LedgerOp::Create, "@TEST:AUTH-001")
                .at(101)
                .with_path("tests/auth.rs"),
            LedgerRecord::new(LedgerOp::Update, "@SPEC:AUTH-001")
                .at(102)
                .with_path("docs/auth.md"),
        ])
        .unwrap();
    let first = fs::read(store.index_path()).unwrap();

    fs::remove_file(store.index_path()).unwrap();
    ledger.rebuild_index().unwrap();
    let second = fs::read(store.index_path()).unwrap();
    assert_eq!(first, second);

    ledger.rebuild_index().unwrap();
    assert_eq!(first, fs::read(store.index_path()).unwrap());
}

#[test]
fn test_projection_ignores_ledger_order() {
    let records = vec![
        LedgerRecord::new(LedgerOp::Create, "@SPEC:CART-001")
            .at(10)
            .with_path("specs/cart.md"),
        LedgerRecord::new(LedgerOp::Update, "@SPEC:CART-001")
            .at(20)
            .with_state(TagState::Active),
        LedgerRecord::new(LedgerOp::Deprecated, "@SPEC:CART-001").at(30),
        LedgerRecord::new(LedgerOp::Reserve, "@CODE:CART-002").at(15),
    ];
    let mut shuffled = records.clone();
    shuffled.reverse();
    shuffled.swap(0, 2);

    let a = project(&records);
    let b = project(&shuffled);
    assert_eq!(a.index, b.index);
    assert_eq!(
        a.index.get("@SPEC:CART-001").unwrap().state,
        TagState::Deprecated
    );
    assert_eq!(
        a.index.get("@CODE:CART-002").unwrap().state,
        TagState::Reserved
    );
}

#[test]
fn test_terminal_state_is_final() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path());
    let policy = Policy::default();
    let ledger = LedgerManager::new(&store, &policy);

    ledger
        .append_batch(vec![
            LedgerRecord::new(LedgerOp::Create, "@DOC:GUIDE-001")
                .at(1)
                .with_state(TagState::Active),
            LedgerRecord::new(LedgerOp::Rescind, "@DOC:GUIDE-001").at(2),
            LedgerRecord::new(LedgerOp::Update, "@DOC:GUIDE-001")
                .at(3)
                .with_state(TagState::Active),
            LedgerRecord::new(LedgerOp::Deprecated, "@DOC:GUIDE-001").at(4),
            LedgerRecord::migrate("@DOC:GUIDE-001", "@DOC:GUIDE-009").at(5),
        ])
        .unwrap();

    let entry = ledger.get("@DOC:GUIDE-001").unwrap().unwrap();
    assert_eq!(entry.state, TagState::Rescinded);
    assert_eq!(entry.migrated_to, None);
}

#[test]
fn test_migrate_records_target() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path());
    let policy = Policy::default();
    let ledger = LedgerManager::new(&store, &policy);

    ledger
        .append(LedgerRecord::new(LedgerOp::Create, "@SPEC:AUTH-001").at(1))
        .unwrap();
    ledger
        .append(LedgerRecord::migrate("@SPEC:AUTH-001", "SPEC:AUTH-002").at(2))
        .unwrap();

    let entry = ledger.get("SPEC:AUTH-001").unwrap().unwrap();
    assert_eq!(entry.state, TagState::Migrated);
    assert_eq!(entry.migrated_to.as_deref(), Some("@SPEC:AUTH-002"));
}

#[test]
fn test_migrate_without_target_is_rejected_before_write() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path());
    let policy = Policy::default();
    let ledger = LedgerManager::new(&store, &policy);

    let err = ledger
        .append_batch(vec![
            LedgerRecord::new(LedgerOp::Create, "@SPEC:AUTH-001"),
            LedgerRecord::new(LedgerOp::Migrate, "@SPEC:AUTH-001"),
        ])
        .unwrap_err();
    assert!(matches!(err, TagError::ValidationError(_)));
    assert!(!store.ledger_path().exists());
}

#[test]
fn test_malformed_ledger_lines_are_skipped() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path());
    let policy = Policy::default();
    let ledger = LedgerManager::new(&store, &policy);

    fs::create_dir_all(&store.state_dir).unwrap();
    let lines = [
        r#"{"op":"CREATE","id":"@SPEC:AUTH-001","ts":"100Z"}"#,
        "{not json",
        r#"{"op":"CREATE","id":"@SPEC:auth-1","ts":"101Z"}"#,
        r#"{"op":"CREATE","id":"@CODE:AUTH-001","ts":"later"}"#,
        r#"{"op":"CREATE","id":"@CODE:AUTH-002","ts":"102Z"}"#,
    ];
    fs::write(store.ledger_path(), lines.join("\n") + "\n").unwrap();

    let report = ledger.rebuild_index().unwrap();
    assert_eq!(report.index_entries, 2);
    assert_eq!(report.applied, 2);
    let skipped: Vec<usize> = report.skipped.iter().map(|s| s.line).collect();
    assert_eq!(skipped, vec![2, 3, 4]);

    let index = ledger.read_index().unwrap();
    assert!(index.get("@SPEC:AUTH-001").is_some());
    assert!(index.get("@CODE:AUTH-002").is_some());
}

#[test]
fn test_read_index_replays_when_index_missing() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path());
    let policy = Policy::default();
    let ledger = LedgerManager::new(&store, &policy);

    ledger
        .append(LedgerRecord::new(LedgerOp::Issue, "@TEST:LOGIN-004"))
        .unwrap();
    fs::remove_file(store.index_path()).unwrap();

    let index = ledger.read_index().unwrap();
    assert_eq!(index.len(), 1);
    assert!(!store.index_path().exists());
    assert_eq!(index.next_number(TagType::Test, "LOGIN"), 5);
    assert_eq!(index.next_number(TagType::Code, "LOGIN"), 1);
}

#[test]
fn test_snapshot_is_read_only_copy() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path());
    let policy = Policy::default();
    let ledger = LedgerManager::new(&store, &policy);

    assert!(matches!(ledger.snapshot(), Err(TagError::NotFound(_))));

    ledger
        .append(LedgerRecord::new(LedgerOp::Create, "@SPEC:AUTH-001"))
        .unwrap();
    let path = ledger.snapshot().unwrap();
    assert_eq!(
        fs::read(&path).unwrap(),
        fs::read(store.ledger_path()).unwrap()
    );
    assert!(fs::metadata(&path).unwrap().permissions().readonly());

    let names = ledger.list_snapshots().unwrap();
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("ledger-"));
}

#[test]
fn test_concurrent_appends_lose_nothing() {
    let tmp = tempdir().unwrap();
    let root = Arc::new(tmp.path().to_path_buf());

    let handles: Vec<_> = (0..6)
        .map(|worker| {
            let root = Arc::clone(&root);
            std::thread::spawn(move || {
                let store = Store::new(root.as_path());
                let policy = Policy::default();
                let ledger = LedgerManager::new(&store, &policy);
                for n in 0..5 {
                    let id = format!("@CODE:W{}-{:03}", worker, n + 1);
                    ledger
                        .append(LedgerRecord::new(LedgerOp::Create, id).with_actor("worker"))
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let store = Store::new(root.as_path());
    let policy = Policy::default();
    let ledger = LedgerManager::new(&store, &policy);
    let lines = fs::read_to_string(store.ledger_path()).unwrap();
    assert_eq!(lines.lines().count(), 30);
    for line in lines.lines() {
        serde_json::from_str::<serde_json::Value>(line).unwrap();
    }
    assert_eq!(ledger.rebuild_index().unwrap().index_entries, 30);
    assert!(!store.ledger_lock_path().exists());
}
