//! Model-checking harness.
//!
//! Applies the same writes to an index and to a `BTreeMap` and verifies that
//! the index agrees with the model, whatever splits, flushes and compactions
//! happened in between.

use crate::fixtures::TestIndex;
use crate::generators::Op;
use segdb_core::{IndexConfig, Isolation, SegmentIndex, SegmentWindow};
use std::collections::BTreeMap;

/// A test harness tracking the expected contents of an index.
pub struct ModelHarness {
    index: TestIndex,
    model: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl ModelHarness {
    /// Creates a harness over a fresh in-memory index.
    pub fn new(config: IndexConfig) -> Self {
        Self {
            index: TestIndex::memory(config),
            model: BTreeMap::new(),
        }
    }

    /// Returns the index under test.
    pub fn index(&self) -> &SegmentIndex {
        &self.index
    }

    /// Returns the expected contents.
    pub fn model(&self) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.model
    }

    /// Applies `op` to both the index and the model.
    pub fn apply(&mut self, op: &Op) {
        match op {
            Op::Put(key, value) => {
                self.index.put(key, value).expect("Failed to put key");
                self.model.insert(key.clone(), value.clone());
            }
            Op::Delete(key) => {
                self.index.delete(key).expect("Failed to delete key");
                self.model.remove(key);
            }
        }
    }

    /// Waits until splits and maintenance settled.
    pub fn settle(&self) {
        self.index.flush_and_wait().expect("Failed to settle index");
    }

    /// Closes and reopens the index; the model must survive.
    pub fn reopen(self) -> Self {
        Self {
            index: self.index.reopen(),
            model: self.model,
        }
    }

    /// Reads `key` and checks it against the model.
    pub fn get_and_verify(&self, key: &[u8]) -> Option<Vec<u8>> {
        let actual = self.index.get(key).expect("Failed to get key");
        assert_eq!(
            actual.as_ref(),
            self.model.get(key),
            "value mismatch for key {key:?}"
        );
        actual
    }

    /// Checks every modelled key with point reads and a full stream.
    pub fn verify_all(&self) {
        for key in self.model.keys() {
            self.get_and_verify(key);
        }
        let streamed: Vec<(Vec<u8>, Vec<u8>)> = self
            .index
            .get_stream(SegmentWindow::all(), Isolation::FullIsolation)
            .expect("Failed to open stream")
            .collect::<Result<_, _>>()
            .expect("Stream failed");
        assert_eq!(streamed.len(), self.model.len(), "stream length mismatch");
        for ((key, value), (model_key, model_value)) in streamed.iter().zip(&self.model) {
            assert_eq!(key, model_key);
            assert_eq!(value, model_value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::small_config;
    use segdb_core::key_from_u64;

    #[test]
    fn test_harness_tracks_overwrites_and_deletes() {
        let mut harness = ModelHarness::new(small_config());
        for n in 1..=30u64 {
            harness.apply(&Op::Put(key_from_u64(n % 12 + 1), n.to_be_bytes().to_vec()));
        }
        harness.apply(&Op::Delete(key_from_u64(3)));
        harness.apply(&Op::Delete(key_from_u64(99)));
        harness.settle();

        assert_eq!(harness.model().len(), 11);
        assert_eq!(harness.get_and_verify(&key_from_u64(3)), None);
        harness.verify_all();
    }

    #[test]
    fn test_harness_survives_reopen() {
        let mut harness = ModelHarness::new(small_config());
        for n in (1..=25u64).rev() {
            harness.apply(&Op::Put(key_from_u64(n), vec![n as u8]));
        }
        let harness = harness.reopen();
        harness.verify_all();
    }
}
