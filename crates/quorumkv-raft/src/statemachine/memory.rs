//! Volatile state machines: a plain map for tests and light shards, and the
//! payload-free machine run by witnesses.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use super::{SmEntry, SmResult, SnapshotContext, StateMachine};
use crate::error::{Error, Result};

/// Commands understood by [`MemoryStateMachine`], JSON encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryOp {
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl MemoryOp {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Queries understood by [`MemoryStateMachine::lookup`], JSON encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryQuery {
    /// Value of a key, empty if absent.
    Get { key: String },
    /// Number of entries applied so far, as 8 big-endian bytes.
    AppliedCount,
}

impl MemoryQuery {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemoryImage {
    index: u64,
    applied: u64,
    data: BTreeMap<String, Vec<u8>>,
}

/// A map held entirely in memory.
///
/// Each applied entry yields `value` = the running count of applied
/// entries, which makes duplicate application observable.
#[derive(Debug, Default)]
pub struct MemoryStateMachine {
    image: MemoryImage,
}

impl MemoryStateMachine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateMachine for MemoryStateMachine {
    fn open(&mut self) -> Result<u64> {
        Ok(self.image.index)
    }

    fn update(&mut self, entries: &[SmEntry]) -> Result<Vec<SmResult>> {
        let ops = entries
            .iter()
            .map(|entry| {
                serde_json::from_slice::<MemoryOp>(&entry.cmd)
                    .map_err(|e| Error::UnsupportedMethod(format!("entry {}: {e}", entry.index)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut results = Vec::with_capacity(ops.len());
        for (entry, op) in entries.iter().zip(ops) {
            if entry.index <= self.image.index {
                results.push(SmResult::default());
                continue;
            }
            match op {
                MemoryOp::Set { key, value } => {
                    self.image.data.insert(key, value);
                }
                MemoryOp::Delete { key } => {
                    self.image.data.remove(&key);
                }
            }
            self.image.index = entry.index;
            self.image.applied += 1;
            results.push(SmResult {
                value: self.image.applied,
                data: Vec::new(),
            });
        }
        Ok(results)
    }

    fn lookup(&self, query: &[u8]) -> Result<Vec<u8>> {
        let query: MemoryQuery =
            serde_json::from_slice(query).map_err(|e| Error::UnsupportedMethod(e.to_string()))?;
        Ok(match query {
            MemoryQuery::Get { key } => self.image.data.get(&key).cloned().unwrap_or_default(),
            MemoryQuery::AppliedCount => self.image.applied.to_be_bytes().to_vec(),
        })
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn prepare_snapshot(&self) -> Result<SnapshotContext> {
        Ok(Box::new(self.image.clone()))
    }

    fn save_snapshot(&self, ctx: SnapshotContext, writer: &mut dyn Write) -> Result<()> {
        let image = ctx
            .downcast::<MemoryImage>()
            .map_err(|_| Error::Internal("snapshot context is not a memory image".into()))?;
        serde_json::to_writer(writer, &*image)?;
        Ok(())
    }

    fn recover_from_snapshot(&mut self, reader: &mut dyn Read) -> Result<()> {
        self.image = serde_json::from_reader(reader)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// State machine of a witness: acknowledges every entry, stores nothing.
#[derive(Debug, Default)]
pub struct WitnessStateMachine {
    index: u64,
}

impl WitnessStateMachine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateMachine for WitnessStateMachine {
    fn open(&mut self) -> Result<u64> {
        Ok(self.index)
    }

    fn update(&mut self, entries: &[SmEntry]) -> Result<Vec<SmResult>> {
        if let Some(last) = entries.last() {
            self.index = self.index.max(last.index);
        }
        Ok(vec![SmResult::default(); entries.len()])
    }

    fn lookup(&self, _query: &[u8]) -> Result<Vec<u8>> {
        Err(Error::UnsupportedMethod("witnesses hold no data".into()))
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn prepare_snapshot(&self) -> Result<SnapshotContext> {
        Ok(Box::new(self.index))
    }

    fn save_snapshot(&self, ctx: SnapshotContext, writer: &mut dyn Write) -> Result<()> {
        let index = ctx
            .downcast::<u64>()
            .map_err(|_| Error::Internal("snapshot context is not an index".into()))?;
        writer.write_all(&index.to_be_bytes())?;
        Ok(())
    }

    fn recover_from_snapshot(&mut self, reader: &mut dyn Read) -> Result<()> {
        let mut bytes = [0u8; 8];
        reader.read_exact(&mut bytes)?;
        self.index = u64::from_be_bytes(bytes);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
