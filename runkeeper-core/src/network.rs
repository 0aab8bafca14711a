//! Network modules as seen by the lifecycle controller.
//!
//! The controller only reads and writes named weight mappings. A data-parallel
//! wrapper advertises its wrapped module through [`Network::parallel_inner`] so
//! checkpoints always hold the underlying module's keys.

use crate::error::{Result, RunError};
use crate::tensor::{StateDict, Tensor};
use serde::{Deserialize, Serialize};

const PARALLEL_PREFIX: &str = "module.";

/// Outcome of a weight load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    /// Keys the module has but the loaded mapping lacked.
    pub missing_keys: Vec<String>,
    /// Keys the loaded mapping had but the module lacks.
    pub unexpected_keys: Vec<String>,
}

impl LoadReport {
    pub fn is_exact(&self) -> bool {
        self.missing_keys.is_empty() && self.unexpected_keys.is_empty()
    }
}

/// A module owning named weights.
pub trait Network {
    fn state_dict(&self) -> StateDict;

    /// Apply `state` to the module. With `strict`, any key mismatch is an error
    /// and nothing is applied.
    fn load_state_dict(&mut self, state: StateDict, strict: bool) -> Result<LoadReport>;

    /// The wrapped module, when `self` is a data-parallel wrapper.
    fn parallel_inner(&self) -> Option<&dyn Network> {
        None
    }

    fn parallel_inner_mut(&mut self) -> Option<&mut dyn Network> {
        None
    }
}

/// The module checkpoints are taken from: the wrapped module if any, else `network`.
pub fn underlying(network: &dyn Network) -> &dyn Network {
    network.parallel_inner().unwrap_or(network)
}

/// Run `f` on the underlying module of `network`.
pub fn with_underlying_mut<R>(
    network: &mut dyn Network,
    f: impl FnOnce(&mut dyn Network) -> R,
) -> R {
    match network.parallel_inner_mut() {
        Some(inner) => f(inner),
        None => f(network),
    }
}

/// Apply `state` onto `target` by key.
///
/// Shapes are always checked. Every check runs before the first write, so a
/// failed load leaves `target` untouched.
pub fn apply_state_dict(
    target: &mut StateDict,
    state: StateDict,
    strict: bool,
) -> Result<LoadReport> {
    let missing_keys: Vec<String> = target
        .keys()
        .filter(|k| !state.contains_key(*k))
        .cloned()
        .collect();
    let unexpected_keys: Vec<String> = state
        .keys()
        .filter(|k| !target.contains_key(*k))
        .cloned()
        .collect();

    if strict && !(missing_keys.is_empty() && unexpected_keys.is_empty()) {
        return Err(RunError::StrictLoad {
            missing: missing_keys,
            unexpected: unexpected_keys,
        });
    }

    for (key, incoming) in &state {
        if let Some(current) = target.get(key) {
            if current.shape() != incoming.shape() {
                return Err(RunError::ShapeMismatch {
                    key: key.clone(),
                    expected: current.shape().to_vec(),
                    found: incoming.shape().to_vec(),
                });
            }
        }
    }

    for (key, incoming) in state {
        if let Some(slot) = target.get_mut(&key) {
            *slot = incoming;
        }
    }

    Ok(LoadReport {
        missing_keys,
        unexpected_keys,
    })
}

/// A flat container of named parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    params: StateDict,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.params.insert(name.into(), tensor);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.params.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.params.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.params.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl Network for ParameterSet {
    fn state_dict(&self) -> StateDict {
        self.params.clone()
    }

    fn load_state_dict(&mut self, state: StateDict, strict: bool) -> Result<LoadReport> {
        apply_state_dict(&mut self.params, state, strict)
    }
}

/// Data-parallel wrapper around a module.
///
/// Its own weight mapping carries a `module.` key prefix; checkpoint code goes
/// through [`underlying`] so persisted keys never include it.
#[derive(Debug, Clone)]
pub struct DataParallel<N> {
    module: N,
    device_ids: Vec<usize>,
}

impl<N: Network> DataParallel<N> {
    pub fn new(module: N, device_ids: Vec<usize>) -> Self {
        Self { module, device_ids }
    }

    pub fn module(&self) -> &N {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut N {
        &mut self.module
    }

    pub fn device_ids(&self) -> &[usize] {
        &self.device_ids
    }

    pub fn into_inner(self) -> N {
        self.module
    }
}

impl<N: Network> Network for DataParallel<N> {
    fn state_dict(&self) -> StateDict {
        self.module
            .state_dict()
            .into_iter()
            .map(|(k, t)| (format!("{PARALLEL_PREFIX}{k}"), t))
            .collect()
    }

    fn load_state_dict(&mut self, state: StateDict, strict: bool) -> Result<LoadReport> {
        let mut stripped = StateDict::new();
        let mut foreign = Vec::new();
        for (key, tensor) in state {
            match key.strip_prefix(PARALLEL_PREFIX) {
                Some(inner) => {
                    stripped.insert(inner.to_string(), tensor);
                }
                None => foreign.push(key),
            }
        }
        if strict && !foreign.is_empty() {
            return Err(RunError::StrictLoad {
                missing: Vec::new(),
                unexpected: foreign,
            });
        }
        let mut report = self.module.load_state_dict(stripped, strict)?;
        report.missing_keys = report
            .missing_keys
            .into_iter()
            .map(|k| format!("{PARALLEL_PREFIX}{k}"))
            .collect();
        report.unexpected_keys = report
            .unexpected_keys
            .into_iter()
            .map(|k| format!("{PARALLEL_PREFIX}{k}"))
            .chain(foreign)
            .collect();
        Ok(report)
    }

    fn parallel_inner(&self) -> Option<&dyn Network> {
        Some(&self.module)
    }

    fn parallel_inner_mut(&mut self) -> Option<&mut dyn Network> {
        Some(&mut self.module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn linear() -> ParameterSet {
        ParameterSet::new()
            .with("weight", Tensor::full(vec![2, 2], 0.5))
            .with("bias", Tensor::zeros(vec![2]))
    }

    #[test]
    fn test_strict_load_exact_match() {
        let mut net = linear();
        let mut state = net.state_dict();
        state.insert("bias".into(), Tensor::full(vec![2], 1.0));
        let report = net.load_state_dict(state, true).unwrap();
        assert!(report.is_exact());
        assert_eq!(net.get("bias").unwrap().data(), &[1.0, 1.0]);
    }

    #[test]
    fn test_strict_load_rejects_missing_key_without_applying() {
        let mut net = linear();
        let mut state = StateDict::new();
        state.insert("weight".into(), Tensor::full(vec![2, 2], 9.0));
        let err = net.load_state_dict(state, true).unwrap_err();
        match err {
            RunError::StrictLoad {
                missing,
                unexpected,
            } => {
                assert_eq!(missing, vec!["bias".to_string()]);
                assert!(unexpected.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(net.get("weight").unwrap().data(), &[0.5; 4]);
    }

    #[test]
    fn test_non_strict_load_applies_intersection() {
        let mut net = linear();
        let mut state = StateDict::new();
        state.insert("weight".into(), Tensor::full(vec![2, 2], 2.0));
        state.insert("extra".into(), Tensor::scalar(1.0));
        let report = net.load_state_dict(state, false).unwrap();
        assert_eq!(
            report,
            LoadReport {
                missing_keys: vec!["bias".into()],
                unexpected_keys: vec!["extra".into()],
            }
        );
        assert_eq!(net.get("weight").unwrap().data(), &[2.0; 4]);
        assert!(net.get("extra").is_none());
    }

    #[test]
    fn test_shape_mismatch_fails_even_when_not_strict() {
        let mut net = linear();
        let mut state = StateDict::new();
        state.insert("bias".into(), Tensor::zeros(vec![3]));
        assert!(matches!(
            net.load_state_dict(state, false),
            Err(RunError::ShapeMismatch { ref key, .. }) if key == "bias"
        ));
    }

    #[test]
    fn test_data_parallel_prefixes_keys() {
        let wrapped = DataParallel::new(linear(), vec![0, 1]);
        let keys: Vec<String> = wrapped.state_dict().into_keys().collect();
        assert_eq!(keys, vec!["module.bias", "module.weight"]);
        let inner_keys: Vec<String> = underlying(&wrapped).state_dict().into_keys().collect();
        assert_eq!(inner_keys, vec!["bias", "weight"]);
    }

    #[test]
    fn test_with_underlying_mut_reaches_wrapped_module() {
        let mut wrapped = DataParallel::new(linear(), vec![0]);
        let state = linear().state_dict();
        let report = with_underlying_mut(&mut wrapped, |net| net.load_state_dict(state, true))
            .unwrap();
        assert!(report.is_exact());

        let mut plain = linear();
        let keys = with_underlying_mut(&mut plain, |net| net.state_dict().len());
        assert_eq!(keys, 2);
    }

    #[test]
    fn test_data_parallel_strict_rejects_unprefixed_keys() {
        let mut wrapped = DataParallel::new(linear(), vec![0]);
        let state = linear().state_dict();
        assert!(matches!(
            wrapped.load_state_dict(state, true),
            Err(RunError::StrictLoad { .. })
        ));
    }
}
