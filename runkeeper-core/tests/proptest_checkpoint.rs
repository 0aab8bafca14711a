//! Property-based tests for checkpoint persistence using proptest.

use proptest::prelude::*;

use runkeeper_core::checkpoint;
use runkeeper_core::{StateDict, Tensor};
use tempfile::TempDir;

fn tensor_strategy() -> impl Strategy<Value = Tensor> {
    prop::collection::vec(any::<u32>(), 1..64).prop_map(|bits| {
        let data: Vec<f32> = bits.into_iter().map(f32::from_bits).collect();
        let len = data.len();
        Tensor::new(vec![len], data).unwrap()
    })
}

proptest! {
    #[test]
    fn weights_file_reloads_every_bit(
        tensors in prop::collection::btree_map("[a-z]{1,8}(\\.[a-z]{1,8})?", tensor_strategy(), 1..8)
    ) {
        let dir = TempDir::new().unwrap();
        let path = checkpoint::network_file(dir.path(), 1, "G");
        let weights: StateDict = tensors;
        checkpoint::write_weights(&path, &weights).unwrap();
        let loaded = checkpoint::read_weights(&path).unwrap().unwrap();

        prop_assert_eq!(loaded.len(), weights.len());
        for (key, tensor) in &weights {
            prop_assert!(tensor.bit_eq(&loaded[key]));
        }
    }
}
