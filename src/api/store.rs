//! Purpose: Async store facade: open/cache container handles and run operations.
//! Exports: `Store`, `ContainerHandle`, `ApiResult`.
//! Role: Stable boundary for the CLI and embedders; mirrors CLI semantics.
//! Invariants: At most one live engine per (name, version); cache hits reuse it.
//! Invariants: Every operation suspends the caller once and resumes it once.
#![allow(clippy::result_large_err)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::core::container::{Container, ContainerInfo, TableSpec};
use crate::core::engine::{self, Request};
use crate::core::error::{Error, ErrorKind};
use crate::core::key::Key;
use crate::core::op::{Op, OpOutcome};

pub type ApiResult<T> = Result<T, Error>;

const CONTAINER_EXTENSION: &str = "cabinite";

/// A directory of containers plus the open-handle cache.
///
/// The cache maps `(container name, version)` to a live handle. It is
/// populated on first successful open and cleared only by explicit
/// `close`/`close_all` teardown.
pub struct Store {
    dir: PathBuf,
    handles: Mutex<HashMap<(String, u32), ContainerHandle>>,
}

impl Store {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create-or-open a container at `version`, creating any tables from
    /// `specs` that its schema is missing. A cached handle for the same
    /// `(name, version)` is returned as-is, without re-running the upgrade.
    pub async fn open(
        &self,
        name: &str,
        version: u32,
        specs: &[TableSpec],
    ) -> ApiResult<ContainerHandle> {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(&(name.to_string(), version)) {
            return Ok(handle.clone());
        }

        let path = self.container_path(name)?;
        self.ensure_dir()?;
        let container = Container::open_or_create(&path, version, specs)?;
        let handle = ContainerHandle {
            name: Arc::from(name),
            version: container.schema_version(),
            tx: engine::spawn(container),
        };
        handles.insert((name.to_string(), version), handle.clone());
        tracing::info!(container = name, version, "container handle opened");
        Ok(handle)
    }

    /// Open an existing container at its stored version (no upgrade step).
    /// Fails with `NotFound` when the container file does not exist.
    pub async fn open_existing(&self, name: &str) -> ApiResult<ContainerHandle> {
        let mut handles = self.handles.lock().await;
        // The file lock guarantees one engine per container file, so at most
        // one cached entry can carry this name.
        if let Some(handle) = handles.values().find(|handle| handle.name() == name) {
            return Ok(handle.clone());
        }

        let path = self.container_path(name)?;
        let container = Container::open_current(&path)?;
        let version = container.schema_version();
        let handle = ContainerHandle {
            name: Arc::from(name),
            version,
            tx: engine::spawn(container),
        };
        handles.insert((name.to_string(), version), handle.clone());
        tracing::info!(container = name, version, "container handle opened");
        Ok(handle)
    }

    /// Tear down the cached handle for `(name, version)`, stopping its engine
    /// and releasing the container lock. Returns whether an entry existed.
    pub async fn close(&self, name: &str, version: u32) -> bool {
        let removed = {
            let mut handles = self.handles.lock().await;
            handles.remove(&(name.to_string(), version))
        };
        match removed {
            Some(handle) => {
                handle.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Tear down every cached handle.
    pub async fn close_all(&self) {
        let drained: Vec<ContainerHandle> = {
            let mut handles = self.handles.lock().await;
            handles.drain().map(|(_, handle)| handle).collect()
        };
        for handle in drained {
            handle.shutdown().await;
        }
    }

    /// Names of the container files currently present in the store directory.
    pub fn container_names(&self) -> ApiResult<Vec<String>> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(err) => {
                return Err(Error::new(ErrorKind::Io)
                    .with_message("failed to read store directory")
                    .with_path(&self.dir)
                    .with_source(err));
            }
        };
        for entry in entries {
            let entry = entry.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to read store directory entry")
                    .with_path(&self.dir)
                    .with_source(err)
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(CONTAINER_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn container_path(&self, name: &str) -> ApiResult<PathBuf> {
        if name.is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("container name must not be empty"));
        }
        if name.contains('/') || name.contains('\\') {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("container name must not contain path separators"));
        }
        Ok(self.dir.join(format!("{name}.{CONTAINER_EXTENSION}")))
    }

    fn ensure_dir(&self) -> ApiResult<()> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            Error::new(ErrorKind::Open)
                .with_message("failed to create store directory")
                .with_path(&self.dir)
                .with_source(err)
        })
    }
}

/// A live handle on an open container. Cloning is cheap; all clones share the
/// same engine. Operations after the engine has been torn down fail with
/// `Transaction`.
#[derive(Clone, Debug)]
pub struct ContainerHandle {
    name: Arc<str>,
    version: u32,
    tx: mpsc::Sender<Request>,
}

impl ContainerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Insert a record; fails with `Constraint` if its key is already present.
    pub async fn add(&self, table: &str, record: Value) -> ApiResult<Key> {
        match self.execute(table, Op::Add(record)).await? {
            OpOutcome::Stored(key) => Ok(key),
            outcome => Err(unexpected_outcome(outcome)),
        }
    }

    /// Fetch a record; `None` when no record has the key.
    pub async fn get(&self, table: &str, key: Key) -> ApiResult<Option<Value>> {
        match self.execute(table, Op::Get(key)).await? {
            OpOutcome::Fetched(record) => Ok(record),
            outcome => Err(unexpected_outcome(outcome)),
        }
    }

    /// Insert-or-replace a record.
    pub async fn put(&self, table: &str, record: Value) -> ApiResult<Key> {
        match self.execute(table, Op::Put(record)).await? {
            OpOutcome::Stored(key) => Ok(key),
            outcome => Err(unexpected_outcome(outcome)),
        }
    }

    /// Delete by key; succeeds (true) whether or not the key existed.
    pub async fn delete(&self, table: &str, key: Key) -> ApiResult<bool> {
        match self.execute(table, Op::Delete(key)).await? {
            OpOutcome::Deleted(deleted) => Ok(deleted),
            outcome => Err(unexpected_outcome(outcome)),
        }
    }

    /// Remove every record in the table.
    pub async fn clear(&self, table: &str) -> ApiResult<()> {
        match self.execute(table, Op::Clear).await? {
            OpOutcome::Cleared => Ok(()),
            outcome => Err(unexpected_outcome(outcome)),
        }
    }

    /// Every record in ascending primary-key order.
    pub async fn get_all(&self, table: &str) -> ApiResult<Vec<Value>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::GetAll {
                table: table.to_string(),
                reply,
            })
            .await
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())?
    }

    /// Lazy ascending traversal: the visitor runs once per record, and the
    /// call resolves only after the last record has been visited.
    pub async fn each(&self, table: &str, mut visitor: impl FnMut(Value)) -> ApiResult<()> {
        let mut position: Option<Key> = None;
        loop {
            let (reply, rx) = oneshot::channel();
            self.tx
                .send(Request::CursorNext {
                    table: table.to_string(),
                    after: position.take(),
                    reply,
                })
                .await
                .map_err(|_| engine_gone())?;
            match rx.await.map_err(|_| engine_gone())?? {
                Some((key, record)) => {
                    visitor(record);
                    position = Some(key);
                }
                None => return Ok(()),
            }
        }
    }

    /// Names of the tables in the container schema.
    pub async fn table_names(&self) -> ApiResult<Vec<String>> {
        Ok(self
            .info()
            .await?
            .tables
            .into_iter()
            .map(|table| table.name)
            .collect())
    }

    /// Schema version and per-table record counts.
    pub async fn info(&self) -> ApiResult<ContainerInfo> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Info { reply })
            .await
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())
    }

    async fn execute(&self, table: &str, op: Op) -> ApiResult<OpOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Execute {
                table: table.to_string(),
                op,
                reply,
            })
            .await
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())?
    }

    async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Request::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

fn engine_gone() -> Error {
    Error::new(ErrorKind::Transaction).with_message("container engine is not running")
}

fn unexpected_outcome(outcome: OpOutcome) -> Error {
    Error::new(ErrorKind::Internal)
        .with_message(format!("unexpected operation outcome: {outcome:?}"))
}

#[cfg(test)]
mod tests {
    use super::Store;
    use crate::core::container::TableSpec;
    use crate::core::error::ErrorKind;
    use crate::core::key::Key;
    use serde_json::json;

    fn students() -> Vec<TableSpec> {
        vec![TableSpec::new("students")]
    }

    #[tokio::test]
    async fn open_twice_reuses_the_cached_handle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path());

        let first = store.open("learns", 1, &students()).await.expect("open");
        first
            .add("students", json!({"id": 1, "name": "Alice"}))
            .await
            .expect("add");

        // A fresh open of the same (name, version) would hit the file lock;
        // the cached handle is returned instead and sees the same engine.
        let second = store.open("learns", 1, &students()).await.expect("reopen");
        let record = second
            .get("students", Key::Int(1))
            .await
            .expect("get")
            .expect("record");
        assert_eq!(record["name"], "Alice");
    }

    #[tokio::test]
    async fn upgrade_adds_missing_tables_and_preserves_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path());

        let handle = store.open("learns", 1, &students()).await.expect("open");
        handle
            .add("students", json!({"id": 7, "name": "Alice"}))
            .await
            .expect("add");
        store.close("learns", 1).await;

        let upgraded = store
            .open(
                "learns",
                2,
                &[
                    TableSpec::new("students"),
                    TableSpec::new("teachers").with_key_field("badge"),
                ],
            )
            .await
            .expect("upgrade");
        let info = upgraded.info().await.expect("info");
        assert_eq!(info.schema_version, 2);
        let mut names = upgraded.table_names().await.expect("table names");
        names.sort();
        assert_eq!(names, vec!["students".to_string(), "teachers".to_string()]);

        let record = upgraded
            .get("students", Key::Int(7))
            .await
            .expect("get")
            .expect("record");
        assert_eq!(record["name"], "Alice");
    }

    #[tokio::test]
    async fn version_regression_fails_to_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path());

        store.open("learns", 2, &students()).await.expect("open");
        store.close("learns", 2).await;

        let err = store
            .open("learns", 1, &students())
            .await
            .expect_err("regression");
        assert_eq!(err.kind(), ErrorKind::Open);
    }

    #[tokio::test]
    async fn add_and_get_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path());
        let handle = store.open("learns", 1, &students()).await.expect("open");

        let record = json!({"id": "1719300000000", "name": "Alice", "age": 30});
        let key = handle
            .add("students", record.clone())
            .await
            .expect("add");
        assert_eq!(key, Key::Text("1719300000000".to_string()));

        let fetched = handle
            .get("students", key)
            .await
            .expect("get")
            .expect("record");
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn duplicate_add_fails_and_put_replaces() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path());
        let handle = store.open("learns", 1, &students()).await.expect("open");

        handle
            .add("students", json!({"id": 1, "name": "Alice"}))
            .await
            .expect("add");
        let err = handle
            .add("students", json!({"id": 1, "name": "Bob"}))
            .await
            .expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::Constraint);

        handle
            .put("students", json!({"id": 1, "name": "Bob"}))
            .await
            .expect("put");
        let record = handle
            .get("students", Key::Int(1))
            .await
            .expect("get")
            .expect("record");
        assert_eq!(record["name"], "Bob");
    }

    #[tokio::test]
    async fn delete_missing_key_succeeds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path());
        let handle = store.open("learns", 1, &students()).await.expect("open");

        let deleted = handle
            .delete("students", Key::Int(404))
            .await
            .expect("delete");
        assert!(deleted);
    }

    #[tokio::test]
    async fn get_all_returns_key_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path());
        let handle = store.open("learns", 1, &students()).await.expect("open");

        for id in [3, 1, 2] {
            handle
                .add("students", json!({"id": id}))
                .await
                .expect("add");
        }
        let records = handle.get_all("students").await.expect("get_all");
        let ids: Vec<i64> = records.iter().map(|r| r["id"].as_i64().expect("id")).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn each_visits_every_record_once_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path());
        let handle = store.open("learns", 1, &students()).await.expect("open");

        for id in [3, 1, 2] {
            handle
                .add("students", json!({"id": id}))
                .await
                .expect("add");
        }

        let mut seen = Vec::new();
        handle
            .each("students", |record| {
                seen.push(record["id"].as_i64().expect("id"));
            })
            .await
            .expect("each");
        // The traversal resolved, so every record has been visited.
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn clear_leaves_an_empty_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path());
        let handle = store.open("learns", 1, &students()).await.expect("open");

        handle
            .add("students", json!({"id": 1}))
            .await
            .expect("add");
        handle.clear("students").await.expect("clear");
        let records = handle.get_all("students").await.expect("get_all");
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn second_store_is_locked_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store_a = Store::new(dir.path());
        let store_b = Store::new(dir.path());

        store_a.open("learns", 1, &students()).await.expect("open");
        let err = store_b
            .open("learns", 1, &students())
            .await
            .expect_err("locked");
        assert_eq!(err.kind(), ErrorKind::Open);
    }

    #[tokio::test]
    async fn close_releases_the_container() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path());

        let handle = store.open("learns", 1, &students()).await.expect("open");
        assert!(store.close("learns", 1).await);
        assert!(!store.close("learns", 1).await);

        // The engine is gone for surviving clones...
        let err = handle
            .get("students", Key::Int(1))
            .await
            .expect_err("engine gone");
        assert_eq!(err.kind(), ErrorKind::Transaction);

        // ...and the lock is released, so a fresh open succeeds.
        store.open("learns", 1, &students()).await.expect("reopen");
    }

    #[tokio::test]
    async fn open_existing_uses_the_stored_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path());

        store.open("learns", 3, &students()).await.expect("open");
        store.close("learns", 3).await;

        let handle = store.open_existing("learns").await.expect("open existing");
        assert_eq!(handle.version(), 3);

        let err = store.open_existing("absent").await.expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn container_names_lists_store_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path());

        store.open("beta", 1, &students()).await.expect("open");
        store.open("alpha", 1, &students()).await.expect("open");
        store.close_all().await;

        let names = store.container_names().expect("names");
        assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[tokio::test]
    async fn invalid_container_names_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path());

        let err = store
            .open("../escape", 1, &students())
            .await
            .expect_err("separator");
        assert_eq!(err.kind(), ErrorKind::Usage);

        let err = store.open("", 1, &students()).await.expect_err("empty");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
