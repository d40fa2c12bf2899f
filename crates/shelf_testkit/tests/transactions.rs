//! Transaction behavior seen through the database façade.

use shelf_core::{
    with_transaction, CoreError, CursorAction, CursorEntry, CursorQuery, EngineError, Key,
    RequestTarget, StoreRequest, TransactionMode,
};
use shelf_engine::{EngineConnection, EngineFactory, OpenCallbacks};
use shelf_testkit::prelude::*;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

fn raw_connection(test_shelf: &TestShelf, name: &str) -> Arc<dyn EngineConnection> {
    let (tx, rx) = mpsc::channel();
    let err_tx = tx.clone();
    test_shelf.engine.open(
        name,
        None,
        OpenCallbacks::new(
            move |conn| tx.send(Ok(conn)).unwrap(),
            move |err| err_tx.send(Err(err)).unwrap(),
        ),
    );
    rx.recv_timeout(Duration::from_secs(5))
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn shared_bulk_add_is_atomic() {
    let test_shelf = TestShelf::people().await;
    transaction::test_bulk_atomicity(&test_shelf.db(None)).await;
}

#[tokio::test]
async fn bulk_add_returns_keys_in_order() {
    let test_shelf = TestShelf::people().await;
    let db = test_shelf.db(None);
    let people: Vec<Person> = (1..=3).map(Person::numbered).collect();
    let keys = db.bulk_add("people", &people).await.unwrap();
    assert_eq!(keys, vec![Key::from(1), Key::from(2), Key::from(3)]);
    assert!(db.bulk_add::<Person>("people", &[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_bulk_put_resolves_without_a_transaction() {
    let test_shelf = TestShelf::people().await;
    let db = test_shelf.db(None);
    assert_eq!(db.bulk_put::<Person>("people", &[]).await.unwrap(), None);
    // no store lookup happens either
    assert_eq!(db.bulk_put::<Person>("boats", &[]).await.unwrap(), None);
}

#[tokio::test]
async fn bulk_put_overwrites_and_returns_last_key() {
    let test_shelf = scenarios::populated_people(2).await;
    let db = test_shelf.db(None);
    let mut first: Person = db.get_by_id("people", 1).await.unwrap().unwrap();
    first.name = "First".into();
    let last = db
        .bulk_put("people", &[first.clone(), Person::numbered(3)])
        .await
        .unwrap();
    assert_eq!(last, Some(Key::from(3)));
    let stored: Option<Person> = db.get_by_id("people", 1).await.unwrap();
    assert_eq!(stored, Some(first));
}

#[tokio::test]
async fn failed_update_rolls_back() {
    let test_shelf = TestShelf::people().await;
    transaction::test_failed_update_rolls_back(&test_shelf.db(None)).await;
}

#[tokio::test]
async fn index_lookups_follow_writes() {
    let test_shelf = TestShelf::people().await;
    index::test_index_consistency(&test_shelf.db(None)).await;
}

#[tokio::test]
async fn bulk_delete_removes_each_key_and_returns_the_rest() {
    let test_shelf = scenarios::populated_people(4).await;
    let db = test_shelf.db(None);

    let left: Vec<Person> = db
        .bulk_delete("people", &[Key::from(1), Key::from(3), Key::from(42)])
        .await
        .unwrap();
    let ids: Vec<Option<u32>> = left.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![Some(2), Some(4)]);

    // the unique email index forgets the deleted records
    db.add("people", &Person::numbered(1)).await.unwrap();
    assert_eq!(db.count("people", None).await.unwrap(), 3);

    let everyone: Vec<Person> = db.bulk_delete("people", &[]).await.unwrap();
    assert_eq!(everyone.len(), 3);
}

#[tokio::test]
async fn failed_bulk_delete_deletes_nothing() {
    let test_shelf = scenarios::populated_people(3).await;
    let db = test_shelf.db(None);

    // people do not read back as cars, so the shared transaction aborts
    let err = db
        .bulk_delete::<Car>("people", &[Key::from(1), Key::from(2)])
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Serialization(_)));
    assert_eq!(db.count("people", None).await.unwrap(), 3);
    assert!(db.get_by_id::<Person>("people", 1).await.unwrap().is_some());
}

#[tokio::test]
async fn delete_is_blocked_by_an_open_connection() {
    let test_shelf = scenarios::populated_people(1).await;
    let db = test_shelf.db(None);
    let other = raw_connection(&test_shelf, "MyDb");

    let err = db.delete_database().await.unwrap_err();
    assert!(matches!(err, CoreError::DeleteBlocked { database } if database == "MyDb"));
    assert_eq!(db.count("people", None).await.unwrap(), 1);

    other.close();
    test_shelf.delete_database("MyDb").await.unwrap();
    assert!(test_shelf.databases().await.unwrap().is_empty());

    // the declaration survives; the next operation recreates the database
    assert_eq!(db.count("people", None).await.unwrap(), 0);
}

#[tokio::test]
async fn custom_transactions_span_several_stores() {
    let test_shelf = scenarios::people_and_garage().await;
    let db = test_shelf.db(None);
    db.create_object_store(cars_store(), None).await.unwrap();

    let conn = db.connect().await.unwrap();
    let owner = with_transaction(
        &conn,
        &["people", "cars"],
        TransactionMode::ReadWrite,
        |scope, outcome| {
            let cars = scope.clone();
            let outcome = outcome.clone();
            scope.request(
                RequestTarget::store("people"),
                StoreRequest::Add {
                    value: serde_json::to_value(Person::new("Ada", "ada@example.com"))?,
                    key: None,
                },
                move |output| {
                    let key = output.into_key().map_err(CoreError::Transaction)?;
                    let mut car = Car::new("AB-1", "Volvo");
                    car.owners = vec![key.as_number().unwrap_or_default() as u32];
                    cars.request(
                        RequestTarget::store("cars"),
                        StoreRequest::Put {
                            value: serde_json::to_value(car)?,
                            key: None,
                        },
                        move |_| {
                            outcome.set(key);
                            Ok(())
                        },
                    )
                },
            )
        },
    )
    .await
    .unwrap();
    drop(conn);

    assert_eq!(owner, Key::from(1));
    let car: Option<Car> = db.get_by_index("cars", "owners", 1).await.unwrap();
    assert_eq!(car.unwrap().plate, "AB-1");
}

#[tokio::test]
async fn cursor_visitor_stops_early() {
    let test_shelf = scenarios::populated_people(10).await;
    let db = test_shelf.db(None);

    let visited = db
        .for_each_cursor(
            CursorQuery::store("people"),
            TransactionMode::ReadWrite,
            |entry: CursorEntry<Person>| {
                if entry.value.id == Some(4) {
                    CursorAction::Stop
                } else {
                    CursorAction::Delete
                }
            },
        )
        .await
        .unwrap();
    assert_eq!(visited, 4);
    assert_eq!(db.count("people", None).await.unwrap(), 7);
}

#[tokio::test]
async fn unique_violation_in_cursor_update_rolls_back_the_walk() {
    let test_shelf = scenarios::populated_people(3).await;
    let db = test_shelf.db(None);

    let err = db
        .for_each_cursor(
            CursorQuery::store("people"),
            TransactionMode::ReadWrite,
            |entry: CursorEntry<Person>| {
                CursorAction::Update(Person {
                    email: "same@example.com".into(),
                    ..entry.value
                })
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Transaction(EngineError::Constraint(_))
    ));
    let first: Option<Person> = db.get_by_id("people", 1).await.unwrap();
    assert_eq!(first.unwrap().email, "person1@example.com");
}
