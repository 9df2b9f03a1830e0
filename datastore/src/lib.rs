// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Primary interface for reading and writing cluster records.
//!
//! Records are stored as JSON documents keyed by id, one table per record
//! type. The storage mechanism sits behind [`StoreBackend`]; callers use the
//! typed [`DataStore`] on top of it.

use async_trait::async_trait;
use gluu_common::api::{Cluster, Node, Provider};
use gluu_common::typed_uuid::{
    ClusterUuid, NodeUuid, ProviderUuid, ToUntypedUuid,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::{debug, o, Logger};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

mod file;
mod memory;

pub use file::JsonFileBackend;
pub use memory::MemoryBackend;

/// A collection of records of one type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    Nodes,
    Clusters,
    Providers,
}

impl Table {
    pub const ALL: [Table; 3] =
        [Table::Nodes, Table::Clusters, Table::Providers];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Nodes => "nodes",
            Table::Clusters => "clusters",
            Table::Providers => "providers",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no {table} record with id {id}")]
    ObjectNotFound { table: Table, id: Uuid },

    #[error("{table} record with id {id} already exists")]
    ObjectAlreadyExists { table: Table, id: Uuid },

    #[error("malformed {table} record {id}")]
    Serde {
        table: Table,
        id: Uuid,
        #[source]
        err: serde_json::Error,
    },

    #[error("I/O error while {message}")]
    Io {
        message: String,
        #[source]
        err: std::io::Error,
    },
}

pub type CreateResult<T> = Result<T, Error>;
pub type LookupResult<T> = Result<T, Error>;
pub type ListResult<T> = Result<Vec<T>, Error>;
pub type UpdateResult<T> = Result<T, Error>;
pub type DeleteResult = Result<(), Error>;

/// Untyped document storage.
///
/// Every operation on a single document is atomic with respect to other
/// operations on the same backend.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn get(
        &self,
        table: Table,
        id: Uuid,
    ) -> Result<Option<serde_json::Value>, Error>;

    /// Stores a new document. Fails with `ObjectAlreadyExists` if `id` is
    /// taken.
    async fn insert(
        &self,
        table: Table,
        id: Uuid,
        doc: serde_json::Value,
    ) -> Result<(), Error>;

    /// Replaces an existing document. Fails with `ObjectNotFound` if there is
    /// none.
    async fn replace(
        &self,
        table: Table,
        id: Uuid,
        doc: serde_json::Value,
    ) -> Result<(), Error>;

    /// Replaces an existing document only if it still equals `expected`.
    ///
    /// Returns `false`, writing nothing, when the stored document differs.
    /// Fails with `ObjectNotFound` if there is none.
    async fn replace_if(
        &self,
        table: Table,
        id: Uuid,
        expected: &serde_json::Value,
        doc: serde_json::Value,
    ) -> Result<bool, Error>;

    /// Removes a document, returning whether it existed.
    async fn delete(&self, table: Table, id: Uuid) -> Result<bool, Error>;

    async fn all(&self, table: Table) -> Result<Vec<serde_json::Value>, Error>;
}

/// A record type with its own table.
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    const TABLE: Table;
    type Id: ToUntypedUuid + Copy + fmt::Display + Send;

    fn id(&self) -> Self::Id;
}

impl Record for Node {
    const TABLE: Table = Table::Nodes;
    type Id = NodeUuid;

    fn id(&self) -> NodeUuid {
        self.id
    }
}

impl Record for Cluster {
    const TABLE: Table = Table::Clusters;
    type Id = ClusterUuid;

    fn id(&self) -> ClusterUuid {
        self.id
    }
}

impl Record for Provider {
    const TABLE: Table = Table::Providers;
    type Id = ProviderUuid;

    fn id(&self) -> ProviderUuid {
        self.id
    }
}

fn to_doc<R: Record>(record: &R) -> Result<serde_json::Value, Error> {
    serde_json::to_value(record).map_err(|err| Error::Serde {
        table: R::TABLE,
        id: record.id().to_untyped_uuid(),
        err,
    })
}

fn from_doc<R: Record>(
    id: Uuid,
    doc: serde_json::Value,
) -> Result<R, Error> {
    serde_json::from_value(doc).map_err(|err| Error::Serde {
        table: R::TABLE,
        id,
        err,
    })
}

// Best effort, for error messages about documents that failed to parse.
fn doc_id(doc: &serde_json::Value) -> Uuid {
    doc.get("id")
        .and_then(|id| id.as_str())
        .and_then(|id| id.parse().ok())
        .unwrap_or_else(Uuid::nil)
}

/// Typed access to the records of one backend.
#[derive(Clone)]
pub struct DataStore {
    log: Logger,
    backend: Arc<dyn StoreBackend>,
}

impl DataStore {
    pub fn new(log: &Logger, backend: Arc<dyn StoreBackend>) -> Self {
        DataStore { log: log.new(o!("component" => "DataStore")), backend }
    }

    /// A store that lives only as long as this process.
    pub fn new_in_memory(log: &Logger) -> Self {
        Self::new(log, Arc::new(MemoryBackend::new()))
    }

    /// Fetch the record with the given id.
    pub async fn get<R: Record>(&self, id: R::Id) -> LookupResult<R> {
        let id = id.to_untyped_uuid();
        match self.backend.get(R::TABLE, id).await? {
            Some(doc) => from_doc(id, doc),
            None => Err(Error::ObjectNotFound { table: R::TABLE, id }),
        }
    }

    /// Store a new record.
    pub async fn persist<R: Record>(&self, record: &R) -> CreateResult<()> {
        let id = record.id().to_untyped_uuid();
        self.backend.insert(R::TABLE, id, to_doc(record)?).await?;
        debug!(self.log, "persisted record"; "table" => %R::TABLE, "id" => %id);
        Ok(())
    }

    /// Overwrite an existing record with `record`.
    pub async fn update<R: Record>(&self, record: &R) -> UpdateResult<()> {
        let id = record.id().to_untyped_uuid();
        self.backend.replace(R::TABLE, id, to_doc(record)?).await?;
        debug!(self.log, "updated record"; "table" => %R::TABLE, "id" => %id);
        Ok(())
    }

    /// Overwrite `current` with `record`, but only if the stored record still
    /// equals `current`.
    ///
    /// Returns `false` when someone else changed the record first, in which
    /// case nothing is written.
    pub async fn update_if_unchanged<R: Record>(
        &self,
        current: &R,
        record: &R,
    ) -> UpdateResult<bool> {
        let id = record.id().to_untyped_uuid();
        debug_assert_eq!(current.id().to_untyped_uuid(), id);
        let swapped = self
            .backend
            .replace_if(R::TABLE, id, &to_doc(current)?, to_doc(record)?)
            .await?;
        debug!(
            self.log,
            "conditional update";
            "table" => %R::TABLE,
            "id" => %id,
            "swapped" => swapped,
        );
        Ok(swapped)
    }

    /// Remove a record. Removing a missing record is an error.
    pub async fn delete<R: Record>(&self, id: R::Id) -> DeleteResult {
        let id = id.to_untyped_uuid();
        if self.backend.delete(R::TABLE, id).await? {
            debug!(
                self.log,
                "deleted record";
                "table" => %R::TABLE,
                "id" => %id,
            );
            Ok(())
        } else {
            Err(Error::ObjectNotFound { table: R::TABLE, id })
        }
    }

    /// All records of a type, in no particular order.
    pub async fn all<R: Record>(&self) -> ListResult<R> {
        self.backend
            .all(R::TABLE)
            .await?
            .into_iter()
            .map(|doc| from_doc(doc_id(&doc), doc))
            .collect()
    }

    /// Records for which `pred` holds, in no particular order.
    pub async fn search<R, F>(&self, pred: F) -> ListResult<R>
    where
        R: Record,
        F: Fn(&R) -> bool,
    {
        Ok(self.all::<R>().await?.into_iter().filter(|r| pred(r)).collect())
    }
}
