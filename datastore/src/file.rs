// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage backend keeping one JSON file per record

use crate::{Error, StoreBackend, Table};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Age after which a record lock is assumed to belong to a dead process.
const STALE_LOCK: Duration = Duration::from_secs(30);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);
const LOCK_ATTEMPTS: u32 = 200;

/// An exclusively created `<id>.lock` file next to a record, removed on drop.
///
/// Every process sharing a store directory takes it around its
/// read-then-write sequences on that record.
struct RecordLock {
    path: Utf8PathBuf,
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn lock_is_stale(path: &Utf8Path) -> bool {
    match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => modified.elapsed().is_ok_and(|age| age > STALE_LOCK),
        Err(_) => false,
    }
}

/// Stores each record at `<root>/<table>/<id>.json`.
///
/// Writes go to a temporary file that is renamed into place, so a crash never
/// leaves a half-written record behind. Several processes may share one
/// directory.
pub struct JsonFileBackend {
    root: Utf8PathBuf,
    // Serializes check-then-write sequences within this process.
    lock: Mutex<()>,
}

impl JsonFileBackend {
    /// Opens (creating if needed) a store rooted at `root`.
    pub async fn open(root: &Utf8Path) -> Result<Self, Error> {
        for table in Table::ALL {
            let dir = root.join(table.name());
            tokio::fs::create_dir_all(&dir).await.map_err(|err| Error::Io {
                message: format!("creating {dir}"),
                err,
            })?;
        }
        Ok(JsonFileBackend { root: root.to_owned(), lock: Mutex::new(()) })
    }

    fn path(&self, table: Table, id: Uuid) -> Utf8PathBuf {
        self.root.join(table.name()).join(format!("{id}.json"))
    }

    async fn lock_record(
        &self,
        table: Table,
        id: Uuid,
    ) -> Result<RecordLock, Error> {
        let path = self.path(table, id).with_extension("lock");
        for _ in 0..LOCK_ATTEMPTS {
            let created = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            match created {
                Ok(_) => return Ok(RecordLock { path }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path).await {
                        let _ = tokio::fs::remove_file(&path).await;
                        continue;
                    }
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(err) => {
                    return Err(Error::Io {
                        message: format!("creating {path}"),
                        err,
                    });
                }
            }
        }
        Err(Error::Io {
            message: format!("locking {path}"),
            err: std::io::Error::new(
                ErrorKind::WouldBlock,
                "record is locked by another writer",
            ),
        })
    }

    async fn read(
        &self,
        table: Table,
        id: Uuid,
        path: &Utf8Path,
    ) -> Result<Option<serde_json::Value>, Error> {
        let contents = match tokio::fs::read(path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(Error::Io {
                    message: format!("reading {path}"),
                    err,
                });
            }
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|err| Error::Serde { table, id, err })
    }

    async fn write(
        &self,
        table: Table,
        id: Uuid,
        doc: &serde_json::Value,
    ) -> Result<(), Error> {
        let path = self.path(table, id);
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_vec_pretty(doc)
            .map_err(|err| Error::Serde { table, id, err })?;
        tokio::fs::write(&tmp, contents).await.map_err(|err| Error::Io {
            message: format!("writing {tmp}"),
            err,
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|err| Error::Io {
            message: format!("renaming {tmp} to {path}"),
            err,
        })
    }
}

#[async_trait]
impl StoreBackend for JsonFileBackend {
    async fn get(
        &self,
        table: Table,
        id: Uuid,
    ) -> Result<Option<serde_json::Value>, Error> {
        self.read(table, id, &self.path(table, id)).await
    }

    async fn insert(
        &self,
        table: Table,
        id: Uuid,
        doc: serde_json::Value,
    ) -> Result<(), Error> {
        let _guard = self.lock.lock().await;
        let _record = self.lock_record(table, id).await?;
        if self.read(table, id, &self.path(table, id)).await?.is_some() {
            return Err(Error::ObjectAlreadyExists { table, id });
        }
        self.write(table, id, &doc).await
    }

    async fn replace(
        &self,
        table: Table,
        id: Uuid,
        doc: serde_json::Value,
    ) -> Result<(), Error> {
        let _guard = self.lock.lock().await;
        let _record = self.lock_record(table, id).await?;
        if self.read(table, id, &self.path(table, id)).await?.is_none() {
            return Err(Error::ObjectNotFound { table, id });
        }
        self.write(table, id, &doc).await
    }

    async fn replace_if(
        &self,
        table: Table,
        id: Uuid,
        expected: &serde_json::Value,
        doc: serde_json::Value,
    ) -> Result<bool, Error> {
        let _guard = self.lock.lock().await;
        let _record = self.lock_record(table, id).await?;
        match self.read(table, id, &self.path(table, id)).await? {
            Some(current) if &current == expected => {
                self.write(table, id, &doc).await?;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::ObjectNotFound { table, id }),
        }
    }

    async fn delete(&self, table: Table, id: Uuid) -> Result<bool, Error> {
        let _guard = self.lock.lock().await;
        let _record = self.lock_record(table, id).await?;
        let path = self.path(table, id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(Error::Io { message: format!("removing {path}"), err })
            }
        }
    }

    async fn all(&self, table: Table) -> Result<Vec<serde_json::Value>, Error> {
        let dir = self.root.join(table.name());
        let mut entries =
            tokio::fs::read_dir(&dir).await.map_err(|err| Error::Io {
                message: format!("listing {dir}"),
                err,
            })?;
        let mut docs = Vec::new();
        while let Some(entry) =
            entries.next_entry().await.map_err(|err| Error::Io {
                message: format!("listing {dir}"),
                err,
            })?
        {
            let Ok(path) = Utf8PathBuf::try_from(entry.path()) else {
                continue;
            };
            if path.extension() != Some("json") {
                continue;
            }
            let Some(id) =
                path.file_stem().and_then(|stem| stem.parse::<Uuid>().ok())
            else {
                continue;
            };
            if let Some(doc) = self.read(table, id, &path).await? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }
}
