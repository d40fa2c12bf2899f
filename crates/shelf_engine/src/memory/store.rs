//! Object store and index data held by the memory engine.

use crate::error::{EngineError, EngineResult};
use crate::key::{Key, KeyPath, KeyRange};
use crate::types::{IndexParameters, RequestOutput, StoreParameters, StoreRequest};
use serde_json::Value;
use std::collections::BTreeMap;

/// Largest key the generator hands out (2^53).
const MAX_GENERATED_KEY: u64 = 9_007_199_254_740_992;

/// A reversible modification, recorded so an abort can undo it.
#[derive(Debug, Clone)]
pub(crate) enum Change {
    /// A record slot changed; `previous` is what it held before.
    Record { key: Key, previous: Option<Value> },
    /// The key generator moved; the value is where it was.
    Generator(u64),
}

#[derive(Debug, Clone)]
pub(crate) struct IndexState {
    pub key_path: KeyPath,
    pub unique: bool,
    pub multi_entry: bool,
}

impl IndexState {
    /// Index keys a record contributes. Records whose key path yields
    /// nothing valid are not indexed.
    fn keys_for(&self, record: &Value) -> Vec<Key> {
        match self.key_path.extract(record) {
            Ok(Some(Key::Array(mut items))) if self.multi_entry => {
                items.sort();
                items.dedup();
                items
            }
            Ok(Some(key)) => vec![key],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ObjectStoreState {
    pub name: String,
    pub key_path: Option<KeyPath>,
    pub auto_increment: bool,
    pub next_key: u64,
    pub records: BTreeMap<Key, Value>,
    pub indexes: BTreeMap<String, IndexState>,
}

impl ObjectStoreState {
    pub fn new(name: &str, params: &StoreParameters) -> EngineResult<Self> {
        if let Some(path) = &params.key_path {
            path.validate()?;
            if params.auto_increment
                && (path.is_compound() || matches!(path, KeyPath::Single(p) if p.is_empty()))
            {
                return Err(EngineError::InvalidAccess(format!(
                    "auto-increment store {name} needs a non-empty single key path"
                )));
            }
        }
        Ok(Self {
            name: name.to_string(),
            key_path: params.key_path.clone(),
            auto_increment: params.auto_increment,
            next_key: 1,
            records: BTreeMap::new(),
            indexes: BTreeMap::new(),
        })
    }

    pub fn create_index(
        &mut self,
        name: &str,
        key_path: &KeyPath,
        params: &IndexParameters,
    ) -> EngineResult<()> {
        if self.indexes.contains_key(name) {
            return Err(EngineError::constraint(format!(
                "index {name} already exists on {}",
                self.name
            )));
        }
        key_path.validate()?;
        if params.multi_entry && key_path.is_compound() {
            return Err(EngineError::InvalidAccess(format!(
                "multi-entry index {name} cannot use a compound key path"
            )));
        }
        let index = IndexState {
            key_path: key_path.clone(),
            unique: params.unique,
            multi_entry: params.multi_entry,
        };
        if index.unique {
            let mut seen = BTreeMap::new();
            for (primary, record) in &self.records {
                for key in index.keys_for(record) {
                    if let Some(other) = seen.insert(key.clone(), primary) {
                        return Err(EngineError::constraint(format!(
                            "records {other} and {primary} share key {key} of unique index {name}"
                        )));
                    }
                }
            }
        }
        self.indexes.insert(name.to_string(), index);
        Ok(())
    }

    fn index(&self, name: &str) -> EngineResult<&IndexState> {
        self.indexes.get(name).ok_or_else(|| {
            EngineError::not_found(format!("index {name} on object store {}", self.name))
        })
    }

    /// Executes a request against the store, or one of its indexes when
    /// `index` is set. Writes are recorded in `changes`.
    pub fn execute(
        &mut self,
        index: Option<&str>,
        request: StoreRequest,
        changes: &mut Vec<Change>,
    ) -> EngineResult<RequestOutput> {
        if let Some(index) = index {
            return self.execute_on_index(index, request);
        }
        let all = KeyRange::all();
        Ok(match request {
            StoreRequest::Add { value, key } => RequestOutput::Key(self.put(value, key, true, changes)?),
            StoreRequest::Put { value, key } => RequestOutput::Key(self.put(value, key, false, changes)?),
            StoreRequest::Get(range) => RequestOutput::Value(
                self.records.range(range.bounds()).next().map(|(_, v)| v.clone()),
            ),
            StoreRequest::GetAll { range, limit } => RequestOutput::Values(
                self.records
                    .range(range.as_ref().unwrap_or(&all).bounds())
                    .take(limit.unwrap_or(usize::MAX))
                    .map(|(_, v)| v.clone())
                    .collect(),
            ),
            StoreRequest::GetAllKeys { range, limit } => RequestOutput::Keys(
                self.records
                    .range(range.as_ref().unwrap_or(&all).bounds())
                    .take(limit.unwrap_or(usize::MAX))
                    .map(|(k, _)| k.clone())
                    .collect(),
            ),
            StoreRequest::Count(range) => RequestOutput::Count(
                self.records
                    .range(range.as_ref().unwrap_or(&all).bounds())
                    .count(),
            ),
            StoreRequest::Delete(range) => {
                let doomed: Vec<Key> = self
                    .records
                    .range(range.bounds())
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in doomed {
                    let previous = self.records.remove(&key);
                    changes.push(Change::Record { key, previous });
                }
                RequestOutput::Done
            }
            StoreRequest::Clear => {
                let records = std::mem::take(&mut self.records);
                changes.extend(records.into_iter().map(|(key, value)| Change::Record {
                    key,
                    previous: Some(value),
                }));
                RequestOutput::Done
            }
        })
    }

    fn execute_on_index(&self, name: &str, request: StoreRequest) -> EngineResult<RequestOutput> {
        let (range, limit) = match &request {
            StoreRequest::Get(range) => (Some(range), Some(1)),
            StoreRequest::GetAll { range, limit } | StoreRequest::GetAllKeys { range, limit } => {
                (range.as_ref(), *limit)
            }
            StoreRequest::Count(range) => (range.as_ref(), None),
            _ => {
                return Err(EngineError::invalid_state(format!(
                    "index {name} is read-only, write through object store {}",
                    self.name
                )))
            }
        };
        let entries = self.index_entries(name, range)?;
        let mut primaries = entries
            .into_iter()
            .map(|(_, primary)| primary)
            .take(limit.unwrap_or(usize::MAX));
        Ok(match request {
            StoreRequest::Get(_) => {
                RequestOutput::Value(primaries.next().and_then(|pk| self.records.get(&pk).cloned()))
            }
            StoreRequest::GetAll { .. } => RequestOutput::Values(
                primaries
                    .filter_map(|pk| self.records.get(&pk).cloned())
                    .collect(),
            ),
            StoreRequest::GetAllKeys { .. } => RequestOutput::Keys(primaries.collect()),
            _ => RequestOutput::Count(primaries.count()),
        })
    }

    /// `(index key, primary key)` pairs of an index within a range, in
    /// index order.
    pub fn index_entries(&self, name: &str, range: Option<&KeyRange>) -> EngineResult<Vec<(Key, Key)>> {
        let index = self.index(name)?;
        let mut entries: Vec<(Key, Key)> = self
            .records
            .iter()
            .flat_map(move |(primary, record)| {
                index
                    .keys_for(record)
                    .into_iter()
                    .filter(move |key| range.map_or(true, |r| r.contains(key)))
                    .map(move |key| (key, primary.clone()))
            })
            .collect();
        entries.sort();
        Ok(entries)
    }

    fn put(
        &mut self,
        mut value: Value,
        explicit: Option<Key>,
        no_overwrite: bool,
        changes: &mut Vec<Change>,
    ) -> EngineResult<Key> {
        let key = match (self.key_path.clone(), explicit) {
            (Some(path), Some(_)) => {
                return Err(EngineError::data(format!(
                    "object store {} uses key path {path}, an explicit key is not allowed",
                    self.name
                )))
            }
            (Some(path), None) => match path.extract(&value)? {
                Some(key) => key,
                None if self.auto_increment => {
                    let key = self.generate(changes)?;
                    path.inject(&mut value, &key)?;
                    key
                }
                None => {
                    return Err(EngineError::data(format!(
                        "record has no key at key path {path}"
                    )))
                }
            },
            (None, Some(key)) => key,
            (None, None) if self.auto_increment => self.generate(changes)?,
            (None, None) => {
                return Err(EngineError::data(format!(
                    "object store {} has no key path and no key was provided",
                    self.name
                )))
            }
        };

        if self.auto_increment {
            self.bump_generator(&key, changes);
        }
        if no_overwrite && self.records.contains_key(&key) {
            return Err(EngineError::constraint(format!(
                "key {key} already exists in object store {}",
                self.name
            )));
        }
        self.check_unique(&key, &value)?;

        let previous = self.records.insert(key.clone(), value);
        changes.push(Change::Record {
            key: key.clone(),
            previous,
        });
        Ok(key)
    }

    fn generate(&mut self, changes: &mut Vec<Change>) -> EngineResult<Key> {
        if self.next_key > MAX_GENERATED_KEY {
            return Err(EngineError::constraint(format!(
                "key generator of object store {} is exhausted",
                self.name
            )));
        }
        changes.push(Change::Generator(self.next_key));
        let key = Key::from(self.next_key);
        self.next_key += 1;
        Ok(key)
    }

    fn bump_generator(&mut self, key: &Key, changes: &mut Vec<Change>) {
        if let Some(n) = key.as_number() {
            if n >= self.next_key as f64 {
                changes.push(Change::Generator(self.next_key));
                self.next_key = if n >= MAX_GENERATED_KEY as f64 {
                    MAX_GENERATED_KEY + 1
                } else {
                    n.floor() as u64 + 1
                };
            }
        }
    }

    fn check_unique(&self, primary: &Key, value: &Value) -> EngineResult<()> {
        for (name, index) in self.indexes.iter().filter(|(_, i)| i.unique) {
            for key in index.keys_for(value) {
                let taken = self
                    .records
                    .iter()
                    .filter(|(other, _)| *other != primary)
                    .any(|(_, record)| index.keys_for(record).contains(&key));
                if taken {
                    return Err(EngineError::constraint(format!(
                        "key {key} already exists in unique index {name} of {}",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Reverts a recorded change.
    pub fn undo(&mut self, change: Change) {
        match change {
            Change::Record { key, previous: Some(value) } => {
                self.records.insert(key, value);
            }
            Change::Record { key, previous: None } => {
                self.records.remove(&key);
            }
            Change::Generator(next) => self.next_key = next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn people() -> ObjectStoreState {
        let mut store = ObjectStoreState::new(
            "people",
            &StoreParameters {
                key_path: Some(KeyPath::single("id")),
                auto_increment: true,
            },
        )
        .unwrap();
        store
            .create_index(
                "email",
                &KeyPath::single("email"),
                &IndexParameters {
                    unique: true,
                    multi_entry: false,
                },
            )
            .unwrap();
        store
    }

    fn add(store: &mut ObjectStoreState, value: Value) -> EngineResult<Key> {
        let mut changes = Vec::new();
        match store.execute(None, StoreRequest::Add { value, key: None }, &mut changes)? {
            RequestOutput::Key(key) => Ok(key),
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn auto_increment_injects_generated_key() {
        let mut store = people();
        let key = add(&mut store, json!({"name": "Ada", "email": "ada@x"})).unwrap();
        assert_eq!(key, Key::from(1));
        assert_eq!(store.records[&key]["id"], json!(1));
    }

    #[test]
    fn explicit_numeric_key_moves_generator() {
        let mut store = people();
        add(&mut store, json!({"id": 10, "email": "a"})).unwrap();
        let next = add(&mut store, json!({"email": "b"})).unwrap();
        assert_eq!(next, Key::from(11));
    }

    #[test]
    fn add_rejects_existing_key() {
        let mut store = people();
        add(&mut store, json!({"id": 1, "email": "a"})).unwrap();
        let err = add(&mut store, json!({"id": 1, "email": "b"})).unwrap_err();
        assert!(matches!(err, EngineError::Constraint(_)));
    }

    #[test]
    fn unique_index_rejects_duplicates() {
        let mut store = people();
        add(&mut store, json!({"email": "same"})).unwrap();
        let err = add(&mut store, json!({"email": "same"})).unwrap_err();
        assert!(matches!(err, EngineError::Constraint(_)));
    }

    #[test]
    fn put_over_same_record_keeps_unique_key() {
        let mut store = people();
        add(&mut store, json!({"id": 1, "email": "same"})).unwrap();
        let mut changes = Vec::new();
        let out = store
            .execute(
                None,
                StoreRequest::Put {
                    value: json!({"id": 1, "email": "same", "name": "changed"}),
                    key: None,
                },
                &mut changes,
            )
            .unwrap();
        assert_eq!(out, RequestOutput::Key(Key::from(1)));
    }

    #[test]
    fn explicit_key_with_key_path_is_rejected() {
        let mut store = people();
        let mut changes = Vec::new();
        let err = store
            .execute(
                None,
                StoreRequest::Put {
                    value: json!({"email": "x"}),
                    key: Some(Key::from(3)),
                },
                &mut changes,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Data(_)));
    }

    #[test]
    fn undo_restores_previous_state() {
        let mut store = people();
        add(&mut store, json!({"email": "a"})).unwrap();

        let mut changes = Vec::new();
        store
            .execute(None, StoreRequest::Add { value: json!({"email": "b"}), key: None }, &mut changes)
            .unwrap();
        store.execute(None, StoreRequest::Clear, &mut changes).unwrap();
        assert!(store.records.is_empty());

        for change in changes.into_iter().rev() {
            store.undo(change);
        }
        assert_eq!(store.records.len(), 1);
        assert_eq!(store.next_key, 2);
    }

    #[test]
    fn multi_entry_index_lists_each_element() {
        let mut store = ObjectStoreState::new("tags", &StoreParameters::default()).unwrap();
        store
            .create_index(
                "tag",
                &KeyPath::single("tags"),
                &IndexParameters {
                    unique: false,
                    multi_entry: true,
                },
            )
            .unwrap();
        let mut changes = Vec::new();
        store
            .execute(
                None,
                StoreRequest::Put {
                    value: json!({"tags": ["b", "a", "b"]}),
                    key: Some(Key::from(1)),
                },
                &mut changes,
            )
            .unwrap();
        let entries = store.index_entries("tag", None).unwrap();
        assert_eq!(
            entries,
            vec![(Key::from("a"), Key::from(1)), (Key::from("b"), Key::from(1))]
        );
    }

    #[test]
    fn unique_index_creation_checks_existing_records() {
        let mut store = ObjectStoreState::new("s", &StoreParameters::default()).unwrap();
        let mut changes = Vec::new();
        for key in [1, 2] {
            store
                .execute(
                    None,
                    StoreRequest::Put {
                        value: json!({"v": "dup"}),
                        key: Some(Key::from(key)),
                    },
                    &mut changes,
                )
                .unwrap();
        }
        let err = store
            .create_index(
                "v",
                &KeyPath::single("v"),
                &IndexParameters {
                    unique: true,
                    multi_entry: false,
                },
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Constraint(_)));
    }

    #[test]
    fn index_requests_read_through_to_records() {
        let mut store = people();
        add(&mut store, json!({"email": "b@x"})).unwrap();
        add(&mut store, json!({"email": "a@x"})).unwrap();
        let mut changes = Vec::new();
        let out = store
            .execute(
                Some("email"),
                StoreRequest::GetAllKeys {
                    range: None,
                    limit: None,
                },
                &mut changes,
            )
            .unwrap();
        assert_eq!(out, RequestOutput::Keys(vec![Key::from(2), Key::from(1)]));

        let err = store
            .execute(Some("email"), StoreRequest::Clear, &mut changes)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[test]
    fn auto_increment_requires_single_key_path() {
        let err = ObjectStoreState::new(
            "bad",
            &StoreParameters {
                key_path: Some(KeyPath::compound(["a", "b"])),
                auto_increment: true,
            },
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidAccess(_)));
    }
}
