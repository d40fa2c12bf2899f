//! Cross-crate integration test helpers.
//!
//! Provides a harness that mirrors every write in an in-memory model and
//! checks the database against it, plus reusable checks for transaction
//! and index behavior.

use crate::fixtures::TestShelf;
use crate::generators::RecordOperation;
use serde::{Deserialize, Serialize};
use shelf_core::{CoreError, Database, DatabaseConfig, EngineError, StoreSchema};
use std::collections::BTreeMap;

/// A record of the harness store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// Primary key.
    pub id: u32,
    /// Payload.
    pub note: String,
}

/// `harness` at version 1 with a `notes` store keyed by `id`.
pub fn notes_config() -> DatabaseConfig {
    DatabaseConfig::new("harness", 1).store(StoreSchema::new("notes").key_path("id"))
}

/// A test harness for integration testing.
pub struct IntegrationHarness {
    /// The shelf under test.
    pub test_shelf: TestShelf,
    db: Database,
    records: BTreeMap<u32, Note>,
}

impl IntegrationHarness {
    /// Creates a harness over a fresh `harness` database.
    pub async fn new() -> Self {
        let test_shelf = TestShelf::with([notes_config()]).await;
        let db = test_shelf.db(Some("harness"));
        Self {
            test_shelf,
            db,
            records: BTreeMap::new(),
        }
    }

    /// The database under test.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Applies an operation to the database and the model, asserting that
    /// both agree on its outcome.
    pub async fn apply(&mut self, op: &RecordOperation) {
        match op {
            RecordOperation::Put { id, note } => {
                let record = Note {
                    id: *id,
                    note: note.clone(),
                };
                let stored = self
                    .db
                    .update("notes", &record)
                    .await
                    .expect("Failed to put record");
                assert_eq!(stored, record);
                self.records.insert(*id, record);
            }
            RecordOperation::Add { id, note } => {
                let record = Note {
                    id: *id,
                    note: note.clone(),
                };
                let result = self.db.add("notes", &record).await;
                if self.records.contains_key(id) {
                    assert!(
                        matches!(
                            result,
                            Err(CoreError::Transaction(EngineError::Constraint(_)))
                        ),
                        "Adding existing key {id} should fail, got {result:?}"
                    );
                } else {
                    let keyed = result.expect("Failed to add record");
                    assert_eq!(keyed.value, record);
                    self.records.insert(*id, record);
                }
            }
            RecordOperation::Delete { id } => {
                self.db
                    .delete("notes", *id)
                    .await
                    .expect("Failed to delete record");
                self.records.remove(id);
            }
            RecordOperation::Get { id } => {
                self.get_and_verify(*id).await;
            }
        }
    }

    /// Gets a record and verifies it matches the model.
    pub async fn get_and_verify(&self, id: u32) -> Option<Note> {
        let actual: Option<Note> = self
            .db
            .get_by_key("notes", id)
            .await
            .expect("Failed to get record");
        assert_eq!(
            actual.as_ref(),
            self.records.get(&id),
            "Record mismatch for {id}"
        );
        actual
    }

    /// Verifies that the store holds exactly the model's records, in key
    /// order.
    pub async fn verify_all(&self) {
        let all: Vec<Note> = self.db.get_all("notes").await.expect("Failed to get all");
        let expected: Vec<Note> = self.records.values().cloned().collect();
        assert_eq!(all, expected, "Store contents differ from the model");
        let count = self.db.count("notes", None).await.expect("Failed to count");
        assert_eq!(count, expected.len());
    }

    /// Returns the count of tracked records.
    pub fn tracked_count(&self) -> usize {
        self.records.len()
    }
}

/// Test transaction integration.
pub mod transaction {
    use super::*;
    use crate::fixtures::Person;

    /// Checks that a bulk add with one failing record leaves the store
    /// untouched, while per-item adds keep the records before the failure.
    pub async fn test_bulk_atomicity(db: &Database) {
        let before = db.count("people", None).await.expect("Failed to count");
        let batch = vec![
            Person::new("Ann", "ann@example.com"),
            Person::new("Bob", "bob@example.com"),
            Person::new("Ann again", "ann@example.com"),
        ];

        let err = db.bulk_add("people", &batch).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Transaction(EngineError::Constraint(_))
        ));
        assert_eq!(db.count("people", None).await.expect("Failed to count"), before);

        let results = db
            .bulk_add_each("people", &batch)
            .await
            .expect("Failed to open connection");
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(results[2].is_err());
        assert_eq!(
            db.count("people", None).await.expect("Failed to count"),
            before + 2
        );
    }

    /// Checks that a failed update rolls back and leaves the original
    /// record.
    pub async fn test_failed_update_rolls_back(db: &Database) {
        let ann = db
            .add("people", &Person::new("Ann", "ann@example.com"))
            .await
            .expect("Failed to add");
        db.add("people", &Person::new("Bob", "bob@example.com"))
            .await
            .expect("Failed to add");

        let clash = Person {
            email: "bob@example.com".into(),
            ..ann.value.clone()
        };
        assert!(db.update("people", &clash).await.is_err());

        let stored: Option<Person> = db
            .get_by_key("people", ann.key)
            .await
            .expect("Failed to get");
        assert_eq!(stored, Some(ann.value));
    }
}

/// Test index integration.
pub mod index {
    use super::*;
    use crate::fixtures::Person;
    use shelf_core::KeyRange;

    /// Checks that index lookups follow record writes and deletes.
    pub async fn test_index_consistency(db: &Database) {
        let people: Vec<Person> = (0..10).map(Person::numbered).collect();
        let keys = db.bulk_add("people", &people).await.expect("Failed to add");

        for key in keys.iter().take(5) {
            db.delete("people", key.clone()).await.expect("Failed to delete");
        }

        for (n, person) in people.iter().enumerate() {
            let found: Option<Person> = db
                .get_by_index("people", "email", person.email.as_str())
                .await
                .expect("Failed to get by index");
            assert_eq!(found.is_some(), n >= 5, "Index entry for {}", person.email);
        }
        let remaining = db
            .count_by_index("people", "email", Some(KeyRange::all()))
            .await
            .expect("Failed to count");
        assert_eq!(remaining, 5);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestShelf;

    #[tokio::test]
    async fn test_integration_harness() {
        let mut harness = IntegrationHarness::new().await;
        harness
            .apply(&RecordOperation::Put {
                id: 1,
                note: "a".into(),
            })
            .await;
        harness
            .apply(&RecordOperation::Add {
                id: 1,
                note: "b".into(),
            })
            .await;
        assert_eq!(harness.tracked_count(), 1);
        assert_eq!(harness.get_and_verify(1).await.unwrap().note, "a");
        harness.verify_all().await;
    }

    #[tokio::test]
    async fn test_bulk_atomicity() {
        let test_shelf = TestShelf::people().await;
        transaction::test_bulk_atomicity(&test_shelf.db(None)).await;
    }

    #[tokio::test]
    async fn test_failed_update_rolls_back() {
        let test_shelf = TestShelf::people().await;
        transaction::test_failed_update_rolls_back(&test_shelf.db(None)).await;
    }

    #[tokio::test]
    async fn test_index_consistency() {
        let test_shelf = TestShelf::people().await;
        index::test_index_consistency(&test_shelf.db(None)).await;
    }
}
