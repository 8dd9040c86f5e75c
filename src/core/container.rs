// Container file creation/opening with header validation, digest-checked JSON
// bodies, exclusive locking, and version-gated schema upgrades.
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use libc::{EACCES, EPERM};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::core::error::{Error, ErrorKind};
use crate::core::key::{self, DEFAULT_KEY_FIELD, Key};

const MAGIC: [u8; 4] = *b"CBNT";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 64;

/// A table to create on open: name plus the primary-key field, default `"id"`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableSpec {
    name: String,
    key_field: String,
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_field: DEFAULT_KEY_FIELD.to_string(),
        }
    }

    /// An empty key field falls back to the default.
    pub fn with_key_field(mut self, key_field: impl Into<String>) -> Self {
        let key_field = key_field.into();
        self.key_field = if key_field.is_empty() {
            DEFAULT_KEY_FIELD.to_string()
        } else {
            key_field
        };
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }
}

#[derive(Clone, Debug)]
pub struct Table {
    pub(crate) key_field: String,
    pub(crate) records: BTreeMap<Key, Value>,
}

impl Table {
    fn new(key_field: String) -> Self {
        Self {
            key_field,
            records: BTreeMap::new(),
        }
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct ContainerInfo {
    pub schema_version: u32,
    pub tables: Vec<TableInfo>,
}

#[derive(Clone, Debug)]
pub struct TableInfo {
    pub name: String,
    pub key_field: String,
    pub records: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct ContainerHeader {
    schema_version: u32,
    body_len: u64,
    digest: [u8; 32],
}

impl ContainerHeader {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&self.schema_version.to_le_bytes());
        buf[16..24].copy_from_slice(&self.body_len.to_le_bytes());
        buf[24..56].copy_from_slice(&self.digest);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("header too small"));
        }
        if buf[0..4] != MAGIC {
            return Err(Error::new(ErrorKind::Corrupt).with_message("bad magic"));
        }
        let format_version = u32::from_le_bytes(read_4(buf, 4));
        if format_version != FORMAT_VERSION {
            return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
                "unsupported container format version {format_version}"
            )));
        }
        let schema_version = u32::from_le_bytes(read_4(buf, 8));
        let body_len = u64::from_le_bytes(read_8(buf, 16));
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&buf[24..56]);
        Ok(Self {
            schema_version,
            body_len,
            digest,
        })
    }
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn read_8(buf: &[u8], offset: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    out
}

#[derive(Serialize, Deserialize)]
struct BodySnapshot {
    tables: BTreeMap<String, TableSnapshot>,
}

#[derive(Serialize, Deserialize)]
struct TableSnapshot {
    key_field: String,
    records: Vec<Value>,
}

#[derive(Debug)]
pub struct Container {
    path: PathBuf,
    // Held for the container lifetime; dropping it releases the lock.
    _lock: File,
    schema_version: u32,
    tables: BTreeMap<String, Table>,
}

impl Container {
    /// Create-or-open at the requested version. A missing file is created at
    /// that version; an existing file at a lower stored version is upgraded by
    /// creating exactly the tables missing from its schema. Opening below the
    /// stored version fails.
    pub fn open_or_create(
        path: impl AsRef<Path>,
        requested: u32,
        specs: &[TableSpec],
    ) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if requested == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("container version must be a positive integer"));
        }

        let lock = acquire_lock(&path)?;
        if fs::metadata(&path).is_ok() {
            let mut container = Self::load(path, lock)?;
            if requested < container.schema_version {
                return Err(Error::new(ErrorKind::Open)
                    .with_message(format!(
                        "requested version {requested} is older than stored version {}",
                        container.schema_version
                    ))
                    .with_path(&container.path)
                    .with_hint("Open with the stored version or a newer one."));
            }
            if requested > container.schema_version {
                container.upgrade_to(requested, specs)?;
            }
            Ok(container)
        } else {
            let mut container = Self {
                path: path.clone(),
                _lock: lock,
                schema_version: 0,
                tables: BTreeMap::new(),
            };
            container.upgrade_to(requested, specs)?;
            tracing::info!(path = %path.display(), version = requested, "container created");
            Ok(container)
        }
    }

    /// Open an existing container at its stored version, with no upgrade step.
    pub fn open_current(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let lock = acquire_lock(&path)?;
        if fs::metadata(&path).is_err() {
            drop(lock);
            let _ = fs::remove_file(lock_path(&path));
            return Err(Error::new(ErrorKind::NotFound)
                .with_message("no such container")
                .with_path(&path)
                .with_hint("Create it first with `cabinite container create <name>`."));
        }
        Self::load(path, lock)
    }

    fn load(path: PathBuf, lock: File) -> Result<Self, Error> {
        let bytes = fs::read(&path).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read container")
                .with_path(&path)
                .with_source(err)
        })?;
        if bytes.len() < HEADER_SIZE {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("container file too small")
                .with_path(&path));
        }

        let header = ContainerHeader::decode(&bytes[..HEADER_SIZE])
            .map_err(|err| err.with_path(&path))?;
        let body = &bytes[HEADER_SIZE..];
        if body.len() as u64 != header.body_len {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("body length mismatch")
                .with_path(&path));
        }
        let digest: [u8; 32] = Sha256::digest(body).into();
        if digest != header.digest {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("body digest mismatch")
                .with_path(&path));
        }

        let snapshot: BodySnapshot = serde_json::from_slice(body).map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message("undecodable container body")
                .with_path(&path)
                .with_source(err)
        })?;

        let mut tables = BTreeMap::new();
        for (name, table_snapshot) in snapshot.tables {
            let mut records = BTreeMap::new();
            for record in table_snapshot.records {
                let record_key =
                    key::extract(&record, &table_snapshot.key_field).map_err(|err| {
                        Error::new(ErrorKind::Corrupt)
                            .with_message("stored record has an invalid primary key")
                            .with_path(&path)
                            .with_table(&name)
                            .with_source(err)
                    })?;
                if records.insert(record_key.clone(), record).is_some() {
                    return Err(Error::new(ErrorKind::Corrupt)
                        .with_message("duplicate primary key in stored table")
                        .with_path(&path)
                        .with_table(&name)
                        .with_key(record_key.to_string()));
                }
            }
            tables.insert(
                name,
                Table {
                    key_field: table_snapshot.key_field,
                    records,
                },
            );
        }

        tracing::debug!(
            path = %path.display(),
            version = header.schema_version,
            "container opened"
        );
        Ok(Self {
            path,
            _lock: lock,
            schema_version: header.schema_version,
            tables,
        })
    }

    /// The upgrade step: create the requested tables that are missing, leave
    /// existing tables untouched, persist at the new schema version.
    fn upgrade_to(&mut self, version: u32, specs: &[TableSpec]) -> Result<(), Error> {
        let previous = self.schema_version;
        for spec in specs {
            if spec.name().is_empty() {
                return Err(
                    Error::new(ErrorKind::Usage).with_message("table name must not be empty")
                );
            }
            if !self.tables.contains_key(spec.name()) {
                tracing::info!(
                    table = spec.name(),
                    key_field = spec.key_field(),
                    "creating table"
                );
                self.tables.insert(
                    spec.name().to_string(),
                    Table::new(spec.key_field().to_string()),
                );
            }
        }
        self.schema_version = version;
        self.persist()?;
        if previous > 0 {
            tracing::info!(
                path = %self.path.display(),
                previous,
                version,
                "container schema upgraded"
            );
        }
        Ok(())
    }

    /// Serialize the full state and atomically replace the container file.
    pub(crate) fn persist(&self) -> Result<(), Error> {
        let mut tables = BTreeMap::new();
        for (name, table) in &self.tables {
            tables.insert(
                name.clone(),
                TableSnapshot {
                    key_field: table.key_field.clone(),
                    records: table.records.values().cloned().collect(),
                },
            );
        }
        let body = serde_json::to_vec(&BodySnapshot { tables }).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode container body")
                .with_source(err)
        })?;
        let header = ContainerHeader {
            schema_version: self.schema_version,
            body_len: body.len() as u64,
            digest: Sha256::digest(&body).into(),
        };

        let tmp = tmp_path(&self.path);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to create container temp file")
                    .with_path(&tmp)
                    .with_source(err)
            })?;
        write_all(&mut file, &header.encode(), &tmp)?;
        write_all(&mut file, &body, &tmp)?;
        file.sync_all().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to sync container temp file")
                .with_path(&tmp)
                .with_source(err)
        })?;
        fs::rename(&tmp, &self.path).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to replace container file")
                .with_path(&self.path)
                .with_source(err)
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn table(&self, name: &str) -> Result<&Table, Error> {
        self.tables.get(name).ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message("no such table")
                .with_path(&self.path)
                .with_table(name)
        })
    }

    pub(crate) fn table_mut(&mut self, name: &str) -> Result<&mut Table, Error> {
        let path = self.path.clone();
        self.tables.get_mut(name).ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message("no such table")
                .with_path(path)
                .with_table(name)
        })
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn info(&self) -> ContainerInfo {
        ContainerInfo {
            schema_version: self.schema_version,
            tables: self
                .tables
                .iter()
                .map(|(name, table)| TableInfo {
                    name: name.clone(),
                    key_field: table.key_field.clone(),
                    records: table.records.len(),
                })
                .collect(),
        }
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn acquire_lock(path: &Path) -> Result<File, Error> {
    let lock_path = lock_path(path);
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to open container lock file")
                .with_path(&lock_path)
                .with_source(err)
        })?;
    lock_file
        .try_lock_exclusive()
        .map_err(|err| lock_error(err, path))?;
    Ok(lock_file)
}

fn lock_error(err: io::Error, path: &Path) -> Error {
    let errno = err.raw_os_error().unwrap_or_default();
    let message = if errno == EACCES || errno == EPERM {
        "container lock was denied"
    } else if err.kind() == io::ErrorKind::WouldBlock {
        "container is locked by another process"
    } else {
        "failed to lock container"
    };
    Error::new(ErrorKind::Open)
        .with_message(message)
        .with_path(path)
        .with_source(err)
}

fn write_all(file: &mut File, bytes: &[u8], path: &Path) -> Result<(), Error> {
    file.write_all(bytes).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to write container temp file")
            .with_path(path)
            .with_source(err)
    })
}
