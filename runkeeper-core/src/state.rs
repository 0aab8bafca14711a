//! Optimizer and scheduler state snapshots.

use crate::error::Result;
use crate::tensor::{DevicePlacement, StateDict, Tensor, place_all};
use serde::{Deserialize, Serialize};

/// Opaque snapshot of an optimizer's or scheduler's internal state.
///
/// The controller never reads `scalars`; it only relocates `tensors` (moment
/// buffers and the like) through the device placement policy on load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub scalars: serde_json::Value,
    #[serde(default)]
    pub tensors: StateDict,
}

impl StateSnapshot {
    pub fn new(scalars: serde_json::Value) -> Self {
        Self {
            scalars,
            tensors: StateDict::new(),
        }
    }

    pub fn with_tensor(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.tensors.insert(name.into(), tensor);
        self
    }

    pub fn placed(self, placement: &dyn DevicePlacement) -> Self {
        Self {
            scalars: self.scalars,
            tensors: place_all(placement, self.tensors),
        }
    }
}

/// Anything whose state can be captured and restored as a [`StateSnapshot`].
///
/// Implemented by optimizers and learning-rate schedulers registered on a run.
/// Loading a snapshot this object produced itself must succeed; a failed
/// resume relies on that to put earlier objects back.
pub trait Checkpointable {
    fn state_dict(&self) -> StateSnapshot;

    fn load_state_dict(&mut self, state: StateSnapshot) -> Result<()>;
}

impl<T: Checkpointable + ?Sized> Checkpointable for Box<T> {
    fn state_dict(&self) -> StateSnapshot {
        (**self).state_dict()
    }

    fn load_state_dict(&mut self, state: StateSnapshot) -> Result<()> {
        (**self).load_state_dict(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunError;
    use crate::tensor::Device;
    use serde_json::json;

    struct Counter {
        steps: u64,
    }

    impl Checkpointable for Counter {
        fn state_dict(&self) -> StateSnapshot {
            StateSnapshot::new(json!({ "steps": self.steps }))
        }

        fn load_state_dict(&mut self, state: StateSnapshot) -> Result<()> {
            self.steps = state
                .scalars
                .get("steps")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| RunError::invalid_snapshot("missing 'steps'"))?;
            Ok(())
        }
    }

    #[test]
    fn test_boxed_checkpointable_delegates() {
        let mut boxed: Box<dyn Checkpointable> = Box::new(Counter { steps: 4 });
        let snap = boxed.state_dict();
        assert_eq!(snap.scalars["steps"], 4);

        boxed
            .load_state_dict(StateSnapshot::new(json!({ "steps": 9 })))
            .unwrap();
        assert_eq!(boxed.state_dict().scalars["steps"], 9);
        assert!(boxed.load_state_dict(StateSnapshot::default()).is_err());
    }

    #[test]
    fn test_placed_moves_tensors_only() {
        let snap = StateSnapshot::new(json!({ "lr": 0.1 }))
            .with_tensor("momentum.weight", Tensor::zeros(vec![3]));
        let placed = snap.placed(&|t: Tensor| t.to_device(Device::Cuda(1)));
        assert_eq!(placed.scalars, json!({ "lr": 0.1 }));
        assert_eq!(placed.tensors["momentum.weight"].device(), Device::Cuda(1));
    }
}
