//! Isolation-level conformance and the end-to-end locking scenarios:
//! shared/exclusive blocking, deadlock victim selection, serializable
//! phantom validation, and foreign-key ordering.

use rowlock::{
    row, Engine, EngineConfig, Error, IsolationLevel, LockMode, Predicate, TableSchema, TxnState,
    Value,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn engine() -> Arc<Engine> {
    Arc::new(Engine::new(EngineConfig {
        lock_timeout: Duration::from_millis(300),
        deadlock_check_interval: Duration::from_millis(5),
        ..EngineConfig::default()
    }))
}

/// produit(id, prix) and panier(id, produit -> produit.id).
fn shop(e: &Engine) {
    e.create_table(TableSchema::new("produit")).unwrap();
    e.create_table(TableSchema::new("panier").with_foreign_key("produit", "produit"))
        .unwrap();
    let tx = e.begin(IsolationLevel::ReadCommitted).unwrap();
    for (id, prix) in [(0, 5), (1, 3), (2, 8)] {
        e.insert(
            tx,
            "produit",
            &Value::Int(id),
            row(&[("prix", Value::Int(prix)), ("stock", Value::Int(10))]),
        )
        .unwrap();
    }
    e.commit(tx).unwrap();
}

#[test]
fn test_scenario_shared_blocks_exclusive_until_commit() {
    let e = engine();
    shop(&e);

    let a = e.begin(IsolationLevel::ReadCommitted).unwrap();
    e.select_for_share(a, "produit", &Value::Int(0)).unwrap();

    let e2 = e.clone();
    let handle = thread::spawn(move || {
        let b = e2.begin(IsolationLevel::ReadCommitted).unwrap();
        let r = e2.select_for_update(b, "produit", &Value::Int(0));
        (b, r)
    });

    thread::sleep(Duration::from_millis(50));
    // B is still waiting on A's shared lock.
    let locks = e.inspect_locks("produit");
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].1, LockMode::Shared);
    assert_eq!(locks[0].2, a);

    e.commit(a).unwrap();
    let (b, r) = handle.join().unwrap();
    assert!(r.unwrap().is_some());
    assert!(e
        .inspect_locks("produit")
        .iter()
        .any(|(_, mode, holder)| *mode == LockMode::Exclusive && *holder == b));
    e.commit(b).unwrap();
}

#[test]
fn test_scenario_two_cycle_deadlock_one_victim() {
    let e = engine();
    shop(&e);

    let a = e.begin(IsolationLevel::ReadCommitted).unwrap();
    let b = e.begin(IsolationLevel::ReadCommitted).unwrap();
    e.select_for_update(a, "produit", &Value::Int(1)).unwrap();
    e.select_for_update(b, "produit", &Value::Int(2)).unwrap();

    let e_a = e.clone();
    let h_a = thread::spawn(move || e_a.select_for_update(a, "produit", &Value::Int(2)));
    let e_b = e.clone();
    let h_b = thread::spawn(move || e_b.select_for_update(b, "produit", &Value::Int(1)));

    let r_a = h_a.join().unwrap();
    let r_b = h_b.join().unwrap();

    let (survivor, victim) = match (&r_a, &r_b) {
        (Ok(_), Err(Error::DeadlockAborted { .. })) => (a, b),
        (Err(Error::DeadlockAborted { .. }), Ok(_)) => (b, a),
        other => panic!("expected exactly one deadlock victim, got {:?}", other),
    };
    assert_eq!(e.state_of(victim).unwrap(), TxnState::Aborted);

    // The caller-side abort of the victim is idempotent.
    e.abort(victim).unwrap();
    // The survivor proceeds and commits.
    e.commit(survivor).unwrap();
    assert!(e.inspect_locks("produit").is_empty());
}

#[test]
fn test_scenario_serializable_phantom_fails_commit() {
    let e = engine();
    shop(&e);

    let a = e.begin(IsolationLevel::Serializable).unwrap();
    let expensive = Predicate::ColumnRange {
        column: "prix".into(),
        min: Some(Value::Int(5)),
        max: None,
    };
    let seen = e.scan(a, "produit", &expensive).unwrap();
    assert_eq!(seen.len(), 2);

    let b = e.begin(IsolationLevel::ReadCommitted).unwrap();
    e.insert(
        b,
        "produit",
        &Value::Int(3),
        row(&[("prix", Value::Int(6))]),
    )
    .unwrap();
    e.commit(b).unwrap();

    let err = e.commit(a).unwrap_err();
    assert!(matches!(err, Error::SerializationFailure { .. }));
    assert_eq!(e.state_of(a).unwrap(), TxnState::Aborted);

    // A retry from scratch sees the phantom and commits cleanly.
    let a2 = e.begin(IsolationLevel::Serializable).unwrap();
    assert_eq!(e.scan(a2, "produit", &expensive).unwrap().len(), 3);
    e.commit(a2).unwrap();
}

#[test]
fn test_scenario_serializable_insert_outside_predicate_commits() {
    let e = engine();
    shop(&e);

    let a = e.begin(IsolationLevel::Serializable).unwrap();
    let expensive = Predicate::ColumnRange {
        column: "prix".into(),
        min: Some(Value::Int(5)),
        max: None,
    };
    e.scan(a, "produit", &expensive).unwrap();

    let b = e.begin(IsolationLevel::ReadCommitted).unwrap();
    e.insert(b, "produit", &Value::Int(3), row(&[("prix", Value::Int(1))]))
        .unwrap();
    e.commit(b).unwrap();

    // prix = 1 is outside the scanned range: no serialization conflict.
    e.commit(a).unwrap();
}

#[test]
fn test_scenario_fk_delete_ordering() {
    let e = engine();
    shop(&e);

    let tx = e.begin(IsolationLevel::ReadCommitted).unwrap();
    e.insert(tx, "panier", &Value::Int(100), row(&[("produit", Value::Int(0))]))
        .unwrap();
    e.commit(tx).unwrap();

    // Deleting the referenced produit fails while the panier row exists.
    let tx = e.begin(IsolationLevel::ReadCommitted).unwrap();
    let err = e.delete(tx, "produit", &Value::Int(0)).unwrap_err();
    assert!(matches!(err, Error::ForeignKeyViolation { .. }));
    e.abort(tx).unwrap();

    // After the referencing row is gone the delete succeeds.
    let tx = e.begin(IsolationLevel::ReadCommitted).unwrap();
    e.delete(tx, "panier", &Value::Int(100)).unwrap();
    e.delete(tx, "produit", &Value::Int(0)).unwrap();
    e.commit(tx).unwrap();

    let tx = e.begin(IsolationLevel::ReadCommitted).unwrap();
    assert!(e.read(tx, "produit", &Value::Int(0)).unwrap().is_none());
    e.commit(tx).unwrap();
}

#[test]
fn test_fk_concurrent_nonkey_edits_do_not_block() {
    let e = engine();
    shop(&e);

    let tx = e.begin(IsolationLevel::ReadCommitted).unwrap();
    e.insert(
        tx,
        "panier",
        &Value::Int(100),
        row(&[("produit", Value::Int(0)), ("quantite", Value::Int(1))]),
    )
    .unwrap();
    e.commit(tx).unwrap();

    // One transaction edits the parent's price, another edits the child's
    // quantity; neither touches a key column, so neither blocks.
    let a = e.begin(IsolationLevel::ReadCommitted).unwrap();
    e.write(a, "produit", &Value::Int(0), row(&[("prix", Value::Int(7))]))
        .unwrap();

    let b = e.begin(IsolationLevel::ReadCommitted).unwrap();
    e.write(b, "panier", &Value::Int(100), row(&[("quantite", Value::Int(3))]))
        .unwrap();

    e.commit(a).unwrap();
    e.commit(b).unwrap();
}

#[test]
fn test_read_committed_non_repeatable_read() {
    let e = engine();
    shop(&e);

    let b = e.begin(IsolationLevel::ReadCommitted).unwrap();
    let first = e.read(b, "produit", &Value::Int(0)).unwrap().unwrap();
    assert_eq!(first.get("prix"), Some(&Value::Int(5)));

    let a = e.begin(IsolationLevel::ReadCommitted).unwrap();
    e.write(a, "produit", &Value::Int(0), row(&[("prix", Value::Int(9))]))
        .unwrap();
    e.commit(a).unwrap();

    // Same row, same transaction, different committed value: the
    // non-repeatable read is reproducible at ReadCommitted.
    let second = e.read(b, "produit", &Value::Int(0)).unwrap().unwrap();
    assert_eq!(second.get("prix"), Some(&Value::Int(9)));
    e.commit(b).unwrap();
}

#[test]
fn test_repeatable_read_blocks_intervening_writer() {
    let e = engine();
    shop(&e);

    let b = e.begin(IsolationLevel::RepeatableRead).unwrap();
    let first = e.read(b, "produit", &Value::Int(0)).unwrap().unwrap();
    assert_eq!(first.get("prix"), Some(&Value::Int(5)));

    // The reader's Shared lock is held to commit, so the writer cannot
    // slip a new committed value in between the two reads.
    let a = e.begin(IsolationLevel::ReadCommitted).unwrap();
    let err = e
        .write(a, "produit", &Value::Int(0), row(&[("prix", Value::Int(9))]))
        .unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }));
    e.abort(a).unwrap();

    let second = e.read(b, "produit", &Value::Int(0)).unwrap().unwrap();
    assert_eq!(second.get("prix"), Some(&Value::Int(5)));
    e.commit(b).unwrap();
}

#[test]
fn test_serializable_reads_are_repeatable() {
    let e = engine();
    shop(&e);

    let b = e.begin(IsolationLevel::Serializable).unwrap();
    let first = e.read(b, "produit", &Value::Int(0)).unwrap().unwrap();

    // Serializable reads take no locks, so the writer commits freely...
    let a = e.begin(IsolationLevel::ReadCommitted).unwrap();
    e.write(a, "produit", &Value::Int(0), row(&[("prix", Value::Int(9))]))
        .unwrap();
    e.commit(a).unwrap();

    // ...the snapshot keeps the second read identical...
    let second = e.read(b, "produit", &Value::Int(0)).unwrap().unwrap();
    assert_eq!(first.get("prix"), second.get("prix"));

    // ...and the conflict surfaces at commit time instead.
    assert!(matches!(
        e.commit(b).unwrap_err(),
        Error::SerializationFailure { .. }
    ));
}

#[test]
fn test_repeatable_read_phantom_gap_stays_open() {
    let e = engine();
    shop(&e);

    let b = e.begin(IsolationLevel::RepeatableRead).unwrap();
    let expensive = Predicate::ColumnRange {
        column: "prix".into(),
        min: Some(Value::Int(5)),
        max: None,
    };
    assert_eq!(e.scan(b, "produit", &expensive).unwrap().len(), 2);

    // Without an explicit predicate lock the insert is not blocked...
    let a = e.begin(IsolationLevel::ReadCommitted).unwrap();
    e.insert(a, "produit", &Value::Int(3), row(&[("prix", Value::Int(6))]))
        .unwrap();
    e.commit(a).unwrap();

    // ...but the snapshot keeps it invisible inside the transaction.
    assert_eq!(e.scan(b, "produit", &expensive).unwrap().len(), 2);
    e.commit(b).unwrap();

    let c = e.begin(IsolationLevel::RepeatableRead).unwrap();
    assert_eq!(e.scan(c, "produit", &expensive).unwrap().len(), 3);
    e.commit(c).unwrap();
}

#[test]
fn test_explicit_predicate_lock_closes_phantom_gap() {
    let e = engine();
    shop(&e);

    let b = e.begin(IsolationLevel::RepeatableRead).unwrap();
    let expensive = Predicate::ColumnRange {
        column: "prix".into(),
        min: Some(Value::Int(5)),
        max: None,
    };
    assert_eq!(e.scan_for_share(b, "produit", &expensive).unwrap().len(), 2);

    // A matching insert now blocks until the range lock is gone.
    let a = e.begin(IsolationLevel::ReadCommitted).unwrap();
    let err = e
        .insert(a, "produit", &Value::Int(3), row(&[("prix", Value::Int(6))]))
        .unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }));

    // A non-matching insert is unaffected.
    e.insert(a, "produit", &Value::Int(4), row(&[("prix", Value::Int(1))]))
        .unwrap();
    e.commit(a).unwrap();
    e.commit(b).unwrap();
}

#[test]
fn test_table_lock_closes_gap_coarsely() {
    let e = engine();
    shop(&e);

    let b = e.begin(IsolationLevel::RepeatableRead).unwrap();
    e.lock_table(b, "produit", LockMode::Shared).unwrap();

    // The table lock covers every row, so even an unrelated insert blocks.
    let a = e.begin(IsolationLevel::ReadCommitted).unwrap();
    let err = e
        .insert(a, "produit", &Value::Int(9), row(&[("prix", Value::Int(1))]))
        .unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }));
    e.abort(a).unwrap();
    e.commit(b).unwrap();

    // Released with the transaction.
    let c = e.begin(IsolationLevel::ReadCommitted).unwrap();
    e.insert(c, "produit", &Value::Int(9), row(&[("prix", Value::Int(1))]))
        .unwrap();
    e.commit(c).unwrap();
}
