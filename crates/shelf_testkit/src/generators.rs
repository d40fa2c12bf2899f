//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random test data
//! that maintains required invariants.

use crate::fixtures::Person;
use proptest::prelude::*;
use shelf_core::{IndexSchema, Key, StoreSchema};

/// Strategy for generating valid store and index names.
pub fn store_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for generating scalar keys.
pub fn key_strategy() -> impl Strategy<Value = Key> {
    prop_oneof![
        (-1_000i64..1_000).prop_map(Key::from),
        prop::string::string_regex("[a-z]{1,8}")
            .expect("Invalid regex")
            .prop_map(Key::from),
    ]
}

/// Strategy for generating people without ids.
///
/// Emails are derived from the name; use [`unique_people_strategy`] when
/// the unique `email` index must not be violated.
pub fn person_strategy() -> impl Strategy<Value = Person> {
    prop::string::string_regex("[A-Z][a-z]{1,9}")
        .expect("Invalid regex")
        .prop_map(|name| {
            let email = format!("{}@example.com", name.to_lowercase());
            Person::new(&name, &email)
        })
}

/// Strategy for generating people with pairwise distinct emails.
pub fn unique_people_strategy(max: usize) -> impl Strategy<Value = Vec<Person>> {
    prop::collection::btree_set("[a-z]{1,10}", 0..max).prop_map(|names| {
        names
            .into_iter()
            .map(|name| Person::new(&name, &format!("{name}@example.com")))
            .collect()
    })
}

/// Strategy for generating valid store schemas with a handful of
/// indexes.
pub fn store_schema_strategy() -> impl Strategy<Value = StoreSchema> {
    (
        store_name_strategy(),
        any::<bool>(),
        prop::collection::btree_set(store_name_strategy(), 0..4),
    )
        .prop_map(|(name, auto_increment, indexes)| {
            let mut schema = StoreSchema::new(name)
                .key_path("id")
                .auto_increment(auto_increment);
            for index in indexes {
                schema = schema.index(IndexSchema::new(index.clone(), index));
            }
            schema
        })
}

/// An operation on a keyed store.
#[derive(Debug, Clone)]
pub enum RecordOperation {
    /// Write a record under a key, replacing any existing one
    Put {
        /// Record key
        id: u32,
        /// Record payload
        note: String,
    },
    /// Add a record; fails if the key exists
    Add {
        /// Record key
        id: u32,
        /// Record payload
        note: String,
    },
    /// Delete a record
    Delete {
        /// Record key
        id: u32,
    },
    /// Read a record
    Get {
        /// Record key
        id: u32,
    },
}

fn record_id_strategy() -> impl Strategy<Value = u32> {
    0u32..16
}

/// Strategy for generating record operations over a small key space, so
/// that collisions happen.
pub fn record_operation_strategy() -> impl Strategy<Value = RecordOperation> {
    let note = || prop::string::string_regex("[a-z]{0,6}").expect("Invalid regex");
    prop_oneof![
        3 => (record_id_strategy(), note()).prop_map(|(id, note)| RecordOperation::Put { id, note }),
        2 => (record_id_strategy(), note()).prop_map(|(id, note)| RecordOperation::Add { id, note }),
        1 => record_id_strategy().prop_map(|id| RecordOperation::Delete { id }),
        2 => record_id_strategy().prop_map(|id| RecordOperation::Get { id }),
    ]
}

/// Strategy for generating a sequence of operations.
pub fn operation_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<RecordOperation>> {
    prop::collection::vec(record_operation_strategy(), min_ops..max_ops)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn store_schema_is_valid(schema in store_schema_strategy()) {
            prop_assert!(schema.validate().is_ok());
        }

        #[test]
        fn unique_people_have_distinct_emails(people in unique_people_strategy(8)) {
            let mut emails: Vec<_> = people.iter().map(|p| p.email.clone()).collect();
            emails.sort();
            emails.dedup();
            prop_assert_eq!(emails.len(), people.len());
        }

        #[test]
        fn keys_round_trip_through_json(key in key_strategy()) {
            let json = serde_json::to_value(&key).unwrap();
            prop_assert_eq!(serde_json::from_value::<Key>(json).unwrap(), key);
        }
    }
}
