// Tagged record operations executed against a container table.
//
// One `Op` is one transaction: it either fully applies and persists, or the
// in-memory state is rolled back to the pre-operation image. Traversal
// (`get_all`, `next_after`) sits outside the tagged path; reads never persist.
use std::ops::Bound;

use serde_json::Value;

use crate::core::container::Container;
use crate::core::error::{Error, ErrorKind};
use crate::core::key::{self, Key};

#[derive(Clone, Debug)]
pub enum Op {
    Add(Value),
    Get(Key),
    Put(Value),
    Delete(Key),
    Clear,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OpOutcome {
    Stored(Key),
    Fetched(Option<Value>),
    Deleted(bool),
    Cleared,
}

impl Container {
    pub fn execute(&mut self, table_name: &str, op: Op) -> Result<OpOutcome, Error> {
        match op {
            Op::Get(record_key) => {
                let table = self.table(table_name)?;
                Ok(OpOutcome::Fetched(table.records.get(&record_key).cloned()))
            }
            Op::Add(record) => {
                let table = self.table(table_name)?;
                let record_key = key::extract(&record, &table.key_field)?;
                if table.records.contains_key(&record_key) {
                    return Err(Error::new(ErrorKind::Constraint)
                        .with_message("primary key already exists")
                        .with_table(table_name)
                        .with_key(record_key.to_string()));
                }
                self.store_record(table_name, record_key.clone(), record)?;
                Ok(OpOutcome::Stored(record_key))
            }
            Op::Put(record) => {
                let table = self.table(table_name)?;
                let record_key = key::extract(&record, &table.key_field)?;
                self.store_record(table_name, record_key.clone(), record)?;
                Ok(OpOutcome::Stored(record_key))
            }
            Op::Delete(record_key) => {
                let table = self.table_mut(table_name)?;
                let Some(previous) = table.records.remove(&record_key) else {
                    // Deleting an absent key is a successful no-op.
                    return Ok(OpOutcome::Deleted(true));
                };
                if let Err(err) = self.persist() {
                    if let Ok(table) = self.table_mut(table_name) {
                        table.records.insert(record_key, previous);
                    }
                    return Err(transaction_error(err));
                }
                Ok(OpOutcome::Deleted(true))
            }
            Op::Clear => {
                let table = self.table_mut(table_name)?;
                let previous = std::mem::take(&mut table.records);
                if let Err(err) = self.persist() {
                    if let Ok(table) = self.table_mut(table_name) {
                        table.records = previous;
                    }
                    return Err(transaction_error(err));
                }
                Ok(OpOutcome::Cleared)
            }
        }
    }

    fn store_record(
        &mut self,
        table_name: &str,
        record_key: Key,
        record: Value,
    ) -> Result<(), Error> {
        let table = self.table_mut(table_name)?;
        let previous = table.records.insert(record_key.clone(), record);
        if let Err(err) = self.persist() {
            if let Ok(table) = self.table_mut(table_name) {
                match previous {
                    Some(previous) => {
                        table.records.insert(record_key, previous);
                    }
                    None => {
                        table.records.remove(&record_key);
                    }
                }
            }
            return Err(transaction_error(err));
        }
        Ok(())
    }

    /// Every record in ascending primary-key order.
    pub fn get_all(&self, table_name: &str) -> Result<Vec<Value>, Error> {
        let table = self.table(table_name)?;
        Ok(table.records.values().cloned().collect())
    }

    /// The cursor step: first record strictly after `after`, or the first
    /// record of the table when `after` is `None`.
    pub fn next_after(
        &self,
        table_name: &str,
        after: Option<&Key>,
    ) -> Result<Option<(Key, Value)>, Error> {
        let table = self.table(table_name)?;
        let mut range = match after {
            Some(record_key) => table
                .records
                .range((Bound::Excluded(record_key.clone()), Bound::Unbounded)),
            None => table.records.range::<Key, _>(..),
        };
        Ok(range
            .next()
            .map(|(record_key, record)| (record_key.clone(), record.clone())))
    }
}

fn transaction_error(err: Error) -> Error {
    Error::new(ErrorKind::Transaction)
        .with_message("operation failed to persist")
        .with_source(err)
}

#[cfg(test)]
mod tests {
    use super::{Op, OpOutcome};
    use crate::core::container::{Container, TableSpec};
    use crate::core::error::ErrorKind;
    use crate::core::key::Key;
    use serde_json::json;

    fn open_students(dir: &tempfile::TempDir) -> Container {
        let path = dir.path().join("learns.cabinite");
        Container::open_or_create(&path, 1, &[TableSpec::new("students")]).expect("create")
    }

    #[test]
    fn add_then_get_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut container = open_students(&dir);
        let record = json!({"id": 7, "name": "Alice", "job": "engineer"});

        let outcome = container
            .execute("students", Op::Add(record.clone()))
            .expect("add");
        assert_eq!(outcome, OpOutcome::Stored(Key::Int(7)));

        let outcome = container
            .execute("students", Op::Get(Key::Int(7)))
            .expect("get");
        assert_eq!(outcome, OpOutcome::Fetched(Some(record)));
    }

    #[test]
    fn get_missing_key_is_absent_not_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut container = open_students(&dir);
        let outcome = container
            .execute("students", Op::Get(Key::Int(404)))
            .expect("get");
        assert_eq!(outcome, OpOutcome::Fetched(None));
    }

    #[test]
    fn add_duplicate_key_is_constraint_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut container = open_students(&dir);
        container
            .execute("students", Op::Add(json!({"id": 1, "name": "Alice"})))
            .expect("add");

        let err = container
            .execute("students", Op::Add(json!({"id": 1, "name": "Bob"})))
            .expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::Constraint);

        // The first record is untouched.
        let outcome = container
            .execute("students", Op::Get(Key::Int(1)))
            .expect("get");
        assert_eq!(
            outcome,
            OpOutcome::Fetched(Some(json!({"id": 1, "name": "Alice"})))
        );
    }

    #[test]
    fn put_replaces_existing_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut container = open_students(&dir);
        container
            .execute("students", Op::Add(json!({"id": 1, "name": "Alice"})))
            .expect("add");

        let outcome = container
            .execute("students", Op::Put(json!({"id": 1, "name": "Alicia"})))
            .expect("put");
        assert_eq!(outcome, OpOutcome::Stored(Key::Int(1)));

        let outcome = container
            .execute("students", Op::Get(Key::Int(1)))
            .expect("get");
        assert_eq!(
            outcome,
            OpOutcome::Fetched(Some(json!({"id": 1, "name": "Alicia"})))
        );
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut container = open_students(&dir);
        container
            .execute("students", Op::Add(json!({"id": 1})))
            .expect("add");

        let outcome = container
            .execute("students", Op::Delete(Key::Int(1)))
            .expect("delete");
        assert_eq!(outcome, OpOutcome::Deleted(true));

        let outcome = container
            .execute("students", Op::Delete(Key::Int(1)))
            .expect("delete again");
        assert_eq!(outcome, OpOutcome::Deleted(true));
    }

    #[test]
    fn clear_empties_the_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut container = open_students(&dir);
        for id in [1, 2, 3] {
            container
                .execute("students", Op::Add(json!({"id": id})))
                .expect("add");
        }

        let outcome = container.execute("students", Op::Clear).expect("clear");
        assert_eq!(outcome, OpOutcome::Cleared);
        assert_eq!(container.get_all("students").expect("get_all"), Vec::<serde_json::Value>::new());
    }

    #[test]
    fn get_all_is_key_ordered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut container = open_students(&dir);
        for id in [3, 1, 2] {
            container
                .execute("students", Op::Add(json!({"id": id})))
                .expect("add");
        }

        let records = container.get_all("students").expect("get_all");
        let ids: Vec<i64> = records
            .iter()
            .map(|record| record["id"].as_i64().expect("id"))
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn integer_keys_order_before_text_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut container = open_students(&dir);
        container
            .execute("students", Op::Add(json!({"id": "10"})))
            .expect("add text");
        container
            .execute("students", Op::Add(json!({"id": 2})))
            .expect("add int");

        let records = container.get_all("students").expect("get_all");
        assert_eq!(records[0]["id"], json!(2));
        assert_eq!(records[1]["id"], json!("10"));
    }

    #[test]
    fn cursor_steps_in_ascending_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut container = open_students(&dir);
        for id in [3, 1, 2] {
            container
                .execute("students", Op::Add(json!({"id": id})))
                .expect("add");
        }

        let mut seen = Vec::new();
        let mut position: Option<Key> = None;
        while let Some((record_key, record)) = container
            .next_after("students", position.as_ref())
            .expect("next")
        {
            seen.push(record["id"].as_i64().expect("id"));
            position = Some(record_key);
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn unknown_table_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut container = open_students(&dir);
        let err = container
            .execute("teachers", Op::Get(Key::Int(1)))
            .expect_err("unknown table");
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = container.get_all("teachers").expect_err("unknown table");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn add_without_key_field_is_usage_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut container = open_students(&dir);
        let err = container
            .execute("students", Op::Add(json!({"name": "Alice"})))
            .expect_err("missing key");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
