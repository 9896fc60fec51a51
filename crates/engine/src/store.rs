//! Versioned storage cells keyed by (scenario instance,
//! data node id).
//!
//! Each scenario instance gets isolated cells: two instances of the same
//! scenario config never share a value. Writes to one cell are serialized by
//! a per-cell lock; workers operating on different cells never contend beyond
//! the brief map lookup. Readers always observe a fully committed write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{DataNodeConfig, EngineError};

/// Who performed a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "task")]
pub enum WriteSource {
    /// `write_input` or a config default.
    External,
    /// The named producing task, during a submission.
    Task(String),
}

/// Point-in-time view of one cell, for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct DataNodeSnapshot {
    pub id: String,
    pub value: Option<Value>,
    pub version: u64,
    pub last_write: Option<DateTime<Utc>>,
    pub last_writer: Option<WriteSource>,
}

/// Mutable state of one cell. Version 0 means "never written".
#[derive(Debug)]
struct Cell {
    id: String,
    value: Option<Value>,
    version: u64,
    last_write: Option<DateTime<Utc>>,
    last_writer: Option<WriteSource>,
}

impl Cell {
    fn unwritten(id: String) -> Self {
        Self {
            id,
            value: None,
            version: 0,
            last_write: None,
            last_writer: None,
        }
    }

    fn commit(&mut self, value: Value, source: WriteSource) {
        self.value = Some(value);
        self.version += 1;
        self.last_write = Some(Utc::now());
        self.last_writer = Some(source);
    }
}

type CellKey = (Uuid, String);

/// In-memory store owning every data-node cell in the process.
///
/// Scenario instances hold only (instance id, node id) keys; the store is the
/// single structure mutated concurrently by workers.
#[derive(Debug, Default)]
pub struct DataNodeStore {
    // The outer lock guards the map shape only; each cell carries its own
    // lock so writes to different cells proceed in parallel.
    cells: RwLock<HashMap<CellKey, Arc<Mutex<Cell>>>>,
}

impl DataNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Materialize a cell for `config` under `instance_id`. A config default
    /// counts as the cell's first write (version 1, external writer).
    pub fn create(&self, config: &DataNodeConfig, instance_id: Uuid) {
        let mut cell = Cell::unwritten(config.id.clone());
        if let Some(default) = &config.default {
            cell.commit(default.clone(), WriteSource::External);
        }
        self.cells
            .write()
            .unwrap()
            .insert((instance_id, config.id.clone()), Arc::new(Mutex::new(cell)));
    }

    fn cell(&self, instance_id: Uuid, node_id: &str) -> Result<Arc<Mutex<Cell>>, EngineError> {
        self.cells
            .read()
            .unwrap()
            .get(&(instance_id, node_id.to_owned()))
            .cloned()
            .ok_or_else(|| EngineError::UnknownDataNode(node_id.to_owned()))
    }

    /// Overwrite the cell's value, bumping version and timestamp.
    ///
    /// A task writer is rejected with `ConflictingWriter` if a *different*
    /// task already wrote this cell: the graph guarantees one producer per
    /// data node, so a second task writer is a programming error upstream.
    pub fn write(
        &self,
        instance_id: Uuid,
        node_id: &str,
        value: Value,
        source: WriteSource,
    ) -> Result<(), EngineError> {
        let cell = self.cell(instance_id, node_id)?;
        let mut cell = cell.lock().unwrap();

        if let (WriteSource::Task(attempted), Some(WriteSource::Task(current))) =
            (&source, &cell.last_writer)
        {
            if attempted != current {
                return Err(EngineError::ConflictingWriter {
                    data_node: cell.id.clone(),
                    current: current.clone(),
                    attempted: attempted.clone(),
                });
            }
        }

        cell.commit(value, source);
        Ok(())
    }

    /// Current value of the cell; `NotWritten` if no write ever happened.
    pub fn read(&self, instance_id: Uuid, node_id: &str) -> Result<Value, EngineError> {
        let cell = self.cell(instance_id, node_id)?;
        let cell = cell.lock().unwrap();
        cell.value.clone().ok_or_else(|| EngineError::NotWritten {
            instance: instance_id,
            data_node: cell.id.clone(),
        })
    }

    /// Whether at least one write (default included) has occurred.
    pub fn is_written(&self, instance_id: Uuid, node_id: &str) -> bool {
        match self.cell(instance_id, node_id) {
            Ok(cell) => cell.lock().unwrap().version > 0,
            Err(_) => false,
        }
    }

    /// Version/timestamp view for status queries.
    pub fn snapshot(
        &self,
        instance_id: Uuid,
        node_id: &str,
    ) -> Result<DataNodeSnapshot, EngineError> {
        let cell = self.cell(instance_id, node_id)?;
        let cell = cell.lock().unwrap();
        Ok(DataNodeSnapshot {
            id: cell.id.clone(),
            value: cell.value.clone(),
            version: cell.version,
            last_write: cell.last_write,
            last_writer: cell.last_writer.clone(),
        })
    }
}
