use super::*;
use crate::engine::{EngineTransaction, RequestCallback, TransactionCallbacks, UpgradeContext};
use crate::key::{Key, KeyPath, KeyRange};
use crate::types::{
    CursorDirection, IndexParameters, RequestOutput, RequestTarget, StoreParameters, StoreRequest,
    TransactionMode,
};
use serde_json::json;
use std::sync::mpsc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn engine() -> MemoryEngine {
    MemoryEngine::new().unwrap()
}

fn people_schema(upgrade: &dyn UpgradeContext) -> EngineResult<()> {
    upgrade.create_object_store(
        "people",
        &StoreParameters {
            key_path: Some(KeyPath::single("id")),
            auto_increment: true,
        },
    )?;
    upgrade.create_index(
        "people",
        "email",
        &KeyPath::single("email"),
        &IndexParameters {
            unique: true,
            multi_entry: false,
        },
    )
}

fn open_with(
    engine: &MemoryEngine,
    name: &str,
    version: Option<u32>,
    upgrade: impl FnOnce(&dyn UpgradeContext) -> EngineResult<()> + Send + 'static,
) -> EngineResult<Arc<dyn EngineConnection>> {
    let (tx, rx) = mpsc::channel();
    let err_tx = tx.clone();
    engine.open(
        name,
        version,
        OpenCallbacks::new(
            move |conn| {
                let _ = tx.send(Ok(conn));
            },
            move |err| {
                let _ = err_tx.send(Err(err));
            },
        )
        .on_upgrade_needed(upgrade),
    );
    rx.recv_timeout(TIMEOUT).unwrap()
}

fn open_people(engine: &MemoryEngine) -> Arc<dyn EngineConnection> {
    open_with(engine, "MyDb", Some(1), people_schema).unwrap()
}

/// Runs `body` inside a new transaction on the event loop and waits for
/// the transaction to finish.
fn in_transaction(
    conn: &Arc<dyn EngineConnection>,
    stores: &[&str],
    mode: TransactionMode,
    body: impl FnOnce(Arc<dyn EngineTransaction>) + Send + 'static,
) -> EngineResult<()> {
    let (tx, rx) = mpsc::channel();
    let abort_tx = tx.clone();
    let start_tx = tx.clone();
    let stores: Vec<String> = stores.iter().map(|s| s.to_string()).collect();
    let conn_in_loop = Arc::clone(conn);
    conn.dispatch(Box::new(move || {
        let callbacks = TransactionCallbacks::new(
            move || {
                let _ = tx.send(Ok(()));
            },
            move |err| {
                let _ = abort_tx.send(Err(err));
            },
        );
        match conn_in_loop.transaction(&stores, mode, callbacks) {
            Ok(transaction) => body(transaction),
            Err(err) => {
                let _ = start_tx.send(Err(err));
            }
        }
    }));
    rx.recv_timeout(TIMEOUT).unwrap()
}

fn add(value: serde_json::Value) -> StoreRequest {
    StoreRequest::Add { value, key: None }
}

fn ignore() -> RequestCallback {
    Box::new(|_| {})
}

fn count(conn: &Arc<dyn EngineConnection>, store: &str) -> usize {
    let (tx, rx) = mpsc::channel();
    let target = RequestTarget::store(store);
    in_transaction(conn, &[store], TransactionMode::ReadOnly, move |t| {
        t.request(
            target,
            StoreRequest::Count(None),
            Box::new(move |out| {
                let _ = tx.send(out);
            }),
        )
        .unwrap();
    })
    .unwrap();
    match rx.recv_timeout(TIMEOUT).unwrap().unwrap() {
        RequestOutput::Count(n) => n,
        other => panic!("unexpected output {other:?}"),
    }
}

#[test]
fn new_database_runs_upgrade_from_zero() {
    let engine = engine();
    let (tx, rx) = mpsc::channel();
    let conn = open_with(&engine, "MyDb", Some(1), move |upgrade| {
        let _ = tx.send((upgrade.old_version(), upgrade.new_version()));
        people_schema(upgrade)
    })
    .unwrap();

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (0, 1));
    assert_eq!(conn.version(), 1);
    assert_eq!(conn.object_store_names(), vec!["people".to_string()]);
    assert_eq!(
        engine.snapshot_databases(),
        vec![DatabaseInfo {
            name: "MyDb".into(),
            version: 1
        }]
    );
}

#[test]
fn reopening_at_same_version_skips_upgrade() {
    let engine = engine();
    open_people(&engine).close();
    let conn = open_with(&engine, "MyDb", Some(1), |_| {
        Err(EngineError::invalid_state("upgrade must not run"))
    })
    .unwrap();
    assert_eq!(conn.version(), 1);
}

#[test]
fn omitted_version_opens_current() {
    let engine = engine();
    open_with(&engine, "MyDb", Some(3), people_schema)
        .unwrap()
        .close();
    let conn = open_with(&engine, "MyDb", None, |_| Ok(())).unwrap();
    assert_eq!(conn.version(), 3);
}

#[test]
fn lower_version_is_rejected() {
    let engine = engine();
    open_with(&engine, "MyDb", Some(2), people_schema)
        .unwrap()
        .close();
    let err = open_with(&engine, "MyDb", Some(1), |_| Ok(()))
        .err()
        .expect("open below the current version succeeded");
    assert_eq!(
        err,
        EngineError::VersionTooLow {
            requested: 1,
            current: 2
        }
    );
}

#[test]
fn failed_upgrade_restores_previous_schema() {
    let engine = engine();
    open_people(&engine).close();

    let err = open_with(&engine, "MyDb", Some(2), |upgrade| {
        upgrade.create_object_store("cars", &StoreParameters::default())?;
        Err(EngineError::data("boom"))
    })
    .err()
    .expect("failing upgrade opened the database");
    assert_eq!(err, EngineError::data("boom"));

    let conn = open_with(&engine, "MyDb", None, |_| Ok(())).unwrap();
    assert_eq!(conn.version(), 1);
    assert_eq!(conn.object_store_names(), vec!["people".to_string()]);
}

#[test]
fn failed_first_upgrade_leaves_no_database() {
    let engine = engine();
    let result = open_with(&engine, "Broken", Some(1), |_| Err(EngineError::data("no")));
    assert!(result.is_err());
    assert!(engine.snapshot_databases().is_empty());
}

#[test]
fn add_then_get_returns_record_with_generated_key() {
    let engine = engine();
    let conn = open_people(&engine);
    let (tx, rx) = mpsc::channel();
    in_transaction(&conn, &["people"], TransactionMode::ReadWrite, move |t| {
        let reader = Arc::clone(&t);
        t.request(
            RequestTarget::store("people"),
            add(json!({"name": "Ada", "email": "ada@example.com"})),
            Box::new(move |out| {
                let Ok(RequestOutput::Key(key)) = out else {
                    return;
                };
                reader
                    .request(
                        RequestTarget::store("people"),
                        StoreRequest::Get(KeyRange::only(key)),
                        Box::new(move |out| {
                            let _ = tx.send(out);
                        }),
                    )
                    .unwrap();
            }),
        )
        .unwrap();
    })
    .unwrap();

    let out = rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(
        out,
        RequestOutput::Value(Some(
            json!({"name": "Ada", "email": "ada@example.com", "id": 1})
        ))
    );
}

#[test]
fn failed_request_aborts_and_rolls_back() {
    let engine = engine();
    let conn = open_people(&engine);
    let result = in_transaction(&conn, &["people"], TransactionMode::ReadWrite, |t| {
        t.request(
            RequestTarget::store("people"),
            add(json!({"email": "dup@example.com"})),
            ignore(),
        )
        .unwrap();
        t.request(
            RequestTarget::store("people"),
            add(json!({"email": "dup@example.com"})),
            ignore(),
        )
        .unwrap();
    });
    assert!(matches!(result, Err(EngineError::Constraint(_))));
    assert_eq!(count(&conn, "people"), 0);
}

#[test]
fn error_handler_sees_failed_request_before_abort() {
    let engine = engine();
    let conn = open_people(&engine);
    let (tx, rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();
    let abort_tx = done_tx.clone();
    let loop_conn = Arc::clone(&conn);
    conn.dispatch(Box::new(move || {
        let callbacks = TransactionCallbacks::new(
            move || {
                let _ = done_tx.send("complete");
            },
            move |_| {
                let _ = abort_tx.send("abort");
            },
        )
        .on_error(move |err| {
            let _ = tx.send(err);
        });
        let t = loop_conn
            .transaction(&["people".into()], TransactionMode::ReadWrite, callbacks)
            .unwrap();
        t.request(
            RequestTarget::store("people"),
            StoreRequest::Put {
                value: json!({"email": 5}),
                key: Some(Key::from(1)),
            },
            ignore(),
        )
        .unwrap();
    }));
    assert!(matches!(
        rx.recv_timeout(TIMEOUT).unwrap(),
        EngineError::Data(_)
    ));
    assert_eq!(done_rx.recv_timeout(TIMEOUT).unwrap(), "abort");
}

#[test]
fn transactions_outside_the_loop_are_rejected() {
    let engine = engine();
    let conn = open_people(&engine);
    let err = conn
        .transaction(
            &["people".into()],
            TransactionMode::ReadOnly,
            TransactionCallbacks::new(|| {}, |_| {}),
        )
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::InvalidState(_)));
}

#[test]
fn unknown_store_in_scope_is_not_found() {
    let engine = engine();
    let conn = open_people(&engine);
    let err = in_transaction(&conn, &["cars"], TransactionMode::ReadOnly, |_| {}).unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[test]
fn read_only_transaction_rejects_writes() {
    let engine = engine();
    let conn = open_people(&engine);
    let (tx, rx) = mpsc::channel();
    in_transaction(&conn, &["people"], TransactionMode::ReadOnly, move |t| {
        let result = t.request(RequestTarget::store("people"), StoreRequest::Clear, ignore());
        let _ = tx.send(result);
    })
    .unwrap();
    assert!(matches!(
        rx.recv_timeout(TIMEOUT).unwrap(),
        Err(EngineError::ReadOnly(_))
    ));
}

#[test]
fn empty_transaction_commits() {
    let engine = engine();
    let conn = open_people(&engine);
    assert!(in_transaction(&conn, &["people"], TransactionMode::ReadWrite, |_| {}).is_ok());
}

#[test]
fn explicit_abort_discards_writes() {
    let engine = engine();
    let conn = open_people(&engine);
    let result = in_transaction(&conn, &["people"], TransactionMode::ReadWrite, |t| {
        t.request(
            RequestTarget::store("people"),
            add(json!({"email": "x"})),
            ignore(),
        )
        .unwrap();
        t.abort().unwrap();
    });
    assert!(matches!(result, Err(EngineError::Aborted(_))));
    assert_eq!(count(&conn, "people"), 0);
}

#[test]
fn later_transaction_waits_for_overlapping_writer() {
    let engine = engine();
    let conn = open_people(&engine);
    let (tx, rx) = mpsc::channel();
    let loop_conn = Arc::clone(&conn);
    conn.dispatch(Box::new(move || {
        let scope = ["people".to_string()];
        let writer = loop_conn
            .transaction(
                &scope,
                TransactionMode::ReadWrite,
                TransactionCallbacks::new(|| {}, |_| {}),
            )
            .unwrap();
        let reader = loop_conn
            .transaction(
                &scope,
                TransactionMode::ReadOnly,
                TransactionCallbacks::new(|| {}, |_| {}),
            )
            .unwrap();
        reader
            .request(
                RequestTarget::store("people"),
                StoreRequest::Count(None),
                Box::new(move |out| {
                    let _ = tx.send(out);
                }),
            )
            .unwrap();
        writer
            .request(
                RequestTarget::store("people"),
                add(json!({"email": "first"})),
                ignore(),
            )
            .unwrap();
    }));
    assert_eq!(
        rx.recv_timeout(TIMEOUT).unwrap().unwrap(),
        RequestOutput::Count(1)
    );
}

fn seed(conn: &Arc<dyn EngineConnection>, emails: &[&str]) {
    let records: Vec<_> = emails.iter().map(|e| json!({ "email": e })).collect();
    in_transaction(conn, &["people"], TransactionMode::ReadWrite, move |t| {
        for record in records {
            t.request(RequestTarget::store("people"), add(record), ignore())
                .unwrap();
        }
    })
    .unwrap();
}

#[test]
fn index_cursor_walks_in_reverse() {
    let engine = engine();
    let conn = open_people(&engine);
    seed(&conn, &["b", "c", "a"]);

    let (tx, rx) = mpsc::channel();
    in_transaction(&conn, &["people"], TransactionMode::ReadOnly, move |t| {
        t.open_cursor(
            RequestTarget::index("people", "email"),
            None,
            CursorDirection::Prev,
            false,
            Box::new(move |step| {
                if let Ok(Some(cursor)) = step {
                    let _ = tx.send((cursor.key().clone(), cursor.primary_key().clone()));
                    cursor.continue_().unwrap();
                }
            }),
        )
        .unwrap();
    })
    .unwrap();

    let seen: Vec<_> = rx.try_iter().collect();
    assert_eq!(
        seen,
        vec![
            (Key::from("c"), Key::from(2)),
            (Key::from("b"), Key::from(1)),
            (Key::from("a"), Key::from(3)),
        ]
    );
}

#[test]
fn cursor_respects_range_and_end_marker() {
    let engine = engine();
    let conn = open_people(&engine);
    seed(&conn, &["a", "b", "c", "d"]);

    let (tx, rx) = mpsc::channel();
    let range = KeyRange::bound(2, 3, false, false).unwrap();
    in_transaction(&conn, &["people"], TransactionMode::ReadOnly, move |t| {
        t.open_cursor(
            RequestTarget::store("people"),
            Some(range),
            CursorDirection::Next,
            true,
            Box::new(move |step| match step {
                Ok(Some(cursor)) => {
                    assert!(cursor.value().is_none());
                    let _ = tx.send(Some(cursor.primary_key().clone()));
                    cursor.continue_().unwrap();
                }
                Ok(None) => {
                    let _ = tx.send(None);
                }
                Err(_) => {}
            }),
        )
        .unwrap();
    })
    .unwrap();

    let seen: Vec<_> = rx.try_iter().collect();
    assert_eq!(seen, vec![Some(Key::from(2)), Some(Key::from(3)), None]);
}

#[test]
fn cursor_update_and_delete_modify_records() {
    let engine = engine();
    let conn = open_people(&engine);
    seed(&conn, &["a", "b", "c"]);

    in_transaction(&conn, &["people"], TransactionMode::ReadWrite, |t| {
        t.open_cursor(
            RequestTarget::store("people"),
            None,
            CursorDirection::Next,
            false,
            Box::new(|step| {
                let Ok(Some(cursor)) = step else { return };
                let mut record = cursor.value().cloned().unwrap();
                if record["email"] == "b" {
                    cursor.delete(Box::new(|_| {})).unwrap();
                } else {
                    record["seen"] = json!(true);
                    cursor.update(record, Box::new(|_| {})).unwrap();
                }
                cursor.continue_().unwrap();
            }),
        )
        .unwrap();
    })
    .unwrap();

    let (tx, rx) = mpsc::channel();
    in_transaction(&conn, &["people"], TransactionMode::ReadOnly, move |t| {
        t.request(
            RequestTarget::store("people"),
            StoreRequest::GetAll {
                range: None,
                limit: None,
            },
            Box::new(move |out| {
                let _ = tx.send(out);
            }),
        )
        .unwrap();
    })
    .unwrap();
    assert_eq!(
        rx.recv_timeout(TIMEOUT).unwrap().unwrap(),
        RequestOutput::Values(vec![
            json!({"email": "a", "id": 1, "seen": true}),
            json!({"email": "c", "id": 3, "seen": true}),
        ])
    );
}

#[test]
fn advancing_twice_in_one_step_fails() {
    let engine = engine();
    let conn = open_people(&engine);
    seed(&conn, &["a", "b"]);
    let (tx, rx) = mpsc::channel();
    in_transaction(&conn, &["people"], TransactionMode::ReadOnly, move |t| {
        t.open_cursor(
            RequestTarget::store("people"),
            None,
            CursorDirection::Next,
            false,
            Box::new(move |step| {
                if let Ok(Some(cursor)) = step {
                    cursor.continue_().unwrap();
                    let _ = tx.send(cursor.continue_());
                }
            }),
        )
        .unwrap();
    })
    .unwrap();
    assert!(matches!(
        rx.recv_timeout(TIMEOUT).unwrap(),
        Err(EngineError::InvalidState(_))
    ));
}

#[test]
fn delete_is_blocked_by_open_connection() {
    let engine = engine();
    let conn = open_people(&engine);

    let (tx, rx) = mpsc::channel();
    let err_tx = tx.clone();
    engine.delete_database(
        "MyDb",
        DeleteCallbacks::new(
            move || {
                let _ = tx.send(Ok(()));
            },
            move |err| {
                let _ = err_tx.send(Err(err));
            },
        ),
    );
    let err = rx.recv_timeout(TIMEOUT).unwrap().unwrap_err();
    assert!(err.is_blocked());
    assert_eq!(conn.object_store_names(), vec!["people".to_string()]);
}

#[test]
fn delete_succeeds_when_connection_closes_on_notice() {
    let engine = engine();
    let conn = open_people(&engine);
    let closer = Arc::clone(&conn);
    conn.set_on_version_change(Box::new(move |change| {
        assert_eq!(change.new_version, None);
        closer.close();
    }));

    let (tx, rx) = mpsc::channel();
    let err_tx = tx.clone();
    engine.delete_database(
        "MyDb",
        DeleteCallbacks::new(
            move || {
                let _ = tx.send(Ok(()));
            },
            move |err| {
                let _ = err_tx.send(Err(err));
            },
        ),
    );
    assert!(rx.recv_timeout(TIMEOUT).unwrap().is_ok());
    assert!(engine.snapshot_databases().is_empty());
}

#[test]
fn upgrade_waits_for_closing_connection_to_finish() {
    let engine = engine();
    let conn = open_people(&engine);
    let closer = Arc::clone(&conn);
    conn.set_on_version_change(Box::new(move |_| closer.close()));

    let upgraded = open_with(&engine, "MyDb", Some(2), |upgrade| {
        upgrade.create_object_store("cars", &StoreParameters::default())
    })
    .unwrap();
    assert_eq!(upgraded.version(), 2);
    assert_eq!(
        upgraded.object_store_names(),
        vec!["cars".to_string(), "people".to_string()]
    );
}

#[test]
fn databases_lists_name_and_version() {
    let engine = engine();
    open_people(&engine);
    let (tx, rx) = mpsc::channel();
    engine.databases(Box::new(move |list| {
        let _ = tx.send(list);
    }));
    let list = rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].name, "MyDb");
}

#[test]
fn data_migration_inside_upgrade_transaction() {
    let engine = engine();
    let conn = open_people(&engine);
    seed(&conn, &["a"]);
    conn.close();

    let upgraded = open_with(&engine, "MyDb", Some(2), |upgrade| {
        upgrade.transaction().request(
            RequestTarget::store("people"),
            add(json!({"email": "migrated"})),
            Box::new(|_| {}),
        )
    })
    .unwrap();
    assert_eq!(count(&upgraded, "people"), 2);
}
