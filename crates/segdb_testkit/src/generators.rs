//! Property-based test generators using proptest.
//!
//! Provides strategies for generating keys, values and operation
//! sequences accepted by the index.

use proptest::prelude::*;
use segdb_core::key_from_u64;

/// Strategy for generating valid keys (non-empty byte strings).
pub fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..24)
}

/// Strategy for generating keys from a small numeric space, so that
/// operations collide and overwrite each other.
pub fn numeric_key_strategy(key_space: u64) -> impl Strategy<Value = Vec<u8>> {
    (1..=key_space.max(1)).prop_map(key_from_u64)
}

/// Strategy for generating values.
pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..64)
}

/// One write applied to an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Store a value.
    Put(Vec<u8>, Vec<u8>),
    /// Remove a key.
    Delete(Vec<u8>),
}

impl Op {
    /// Returns the key the operation touches.
    pub fn key(&self) -> &[u8] {
        match self {
            Op::Put(key, _) | Op::Delete(key) => key,
        }
    }
}

/// Strategy for generating a single operation; puts outweigh deletes 4:1.
pub fn op_strategy(key_space: u64) -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (numeric_key_strategy(key_space), value_strategy())
            .prop_map(|(key, value)| Op::Put(key, value)),
        1 => numeric_key_strategy(key_space).prop_map(Op::Delete),
    ]
}

/// Strategy for generating operation sequences.
pub fn ops_strategy(key_space: u64, max_len: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_strategy(key_space), 1..=max_len.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{small_config, TestIndex};
    use crate::integration::ModelHarness;
    use segdb_core::{Isolation, SegmentWindow};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn generated_keys_are_never_empty(key in key_strategy()) {
            prop_assert!(!key.is_empty());
        }

        #[test]
        fn index_matches_model(ops in ops_strategy(48, 120)) {
            let mut harness = ModelHarness::new(small_config());
            for op in &ops {
                harness.apply(op);
            }
            harness.settle();
            harness.verify_all();
        }

        #[test]
        fn stream_is_sorted_and_complete(ops in ops_strategy(64, 80)) {
            let mut harness = ModelHarness::new(small_config());
            for op in &ops {
                harness.apply(op);
            }
            let streamed: Vec<(Vec<u8>, Vec<u8>)> = harness
                .index()
                .get_stream(SegmentWindow::all(), Isolation::FullIsolation)
                .unwrap()
                .map(|entry| entry.unwrap())
                .collect();
            let expected: Vec<(Vec<u8>, Vec<u8>)> = harness
                .model()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            prop_assert_eq!(streamed, expected);
        }
    }

    #[test]
    fn test_op_key() {
        assert_eq!(Op::Delete(vec![1]).key(), &[1]);
        assert_eq!(Op::Put(vec![2], vec![]).key(), &[2]);
    }

    #[test]
    fn test_memory_fixture_accepts_generated_keys() {
        let test_index = TestIndex::memory(small_config());
        test_index.put(&[0xFF; 23], b"v").unwrap();
        test_index.put(&[0x00], b"v").unwrap();
        assert_eq!(test_index.get(&[0x00]).unwrap(), Some(b"v".to_vec()));
    }
}
