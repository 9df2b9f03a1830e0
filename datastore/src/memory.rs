// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory storage backend

use crate::{Error, StoreBackend, Table};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Documents held in process memory. Used by tests and dry runs.
#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<BTreeMap<(Table, Uuid), serde_json::Value>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn get(
        &self,
        table: Table,
        id: Uuid,
    ) -> Result<Option<serde_json::Value>, Error> {
        Ok(self.tables.lock().unwrap().get(&(table, id)).cloned())
    }

    async fn insert(
        &self,
        table: Table,
        id: Uuid,
        doc: serde_json::Value,
    ) -> Result<(), Error> {
        let mut tables = self.tables.lock().unwrap();
        if tables.contains_key(&(table, id)) {
            return Err(Error::ObjectAlreadyExists { table, id });
        }
        tables.insert((table, id), doc);
        Ok(())
    }

    async fn replace(
        &self,
        table: Table,
        id: Uuid,
        doc: serde_json::Value,
    ) -> Result<(), Error> {
        let mut tables = self.tables.lock().unwrap();
        match tables.get_mut(&(table, id)) {
            Some(existing) => {
                *existing = doc;
                Ok(())
            }
            None => Err(Error::ObjectNotFound { table, id }),
        }
    }

    async fn replace_if(
        &self,
        table: Table,
        id: Uuid,
        expected: &serde_json::Value,
        doc: serde_json::Value,
    ) -> Result<bool, Error> {
        let mut tables = self.tables.lock().unwrap();
        match tables.get_mut(&(table, id)) {
            Some(existing) if existing == expected => {
                *existing = doc;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::ObjectNotFound { table, id }),
        }
    }

    async fn delete(&self, table: Table, id: Uuid) -> Result<bool, Error> {
        Ok(self.tables.lock().unwrap().remove(&(table, id)).is_some())
    }

    async fn all(&self, table: Table) -> Result<Vec<serde_json::Value>, Error> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .iter()
            .filter(|((t, _), _)| *t == table)
            .map(|(_, doc)| doc.clone())
            .collect())
    }
}
