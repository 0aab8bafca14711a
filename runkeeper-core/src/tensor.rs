//! Tensors, named weight mappings, and device placement.
//!
//! Tensor payloads are persisted as the little-endian byte image of their `f32`
//! values, base64 encoded, so a reload reproduces every bit (NaN payloads and
//! signed zeros included).

use crate::error::{Result, RunError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Named mapping from parameter name to tensor.
pub type StateDict = BTreeMap<String, Tensor>;

/// Where a tensor lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

/// A dense `f32` tensor tagged with its device.
///
/// Deserialization goes through the same element-count check as
/// [`Tensor::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTensor")]
pub struct Tensor {
    shape: Vec<usize>,
    #[serde(with = "f32_payload")]
    data: Vec<f32>,
    #[serde(default)]
    device: Device,
}

/// Wire form of a [`Tensor`] before its shape and payload are reconciled.
#[derive(Deserialize)]
struct RawTensor {
    shape: Vec<usize>,
    #[serde(deserialize_with = "f32_payload::deserialize")]
    data: Vec<f32>,
    #[serde(default)]
    device: Device,
}

impl TryFrom<RawTensor> for Tensor {
    type Error = RunError;

    fn try_from(raw: RawTensor) -> Result<Self> {
        Ok(Tensor::new(raw.shape, raw.data)?.to_device(raw.device))
    }
}

impl Tensor {
    /// Build a CPU tensor; `data.len()` must equal the product of `shape`.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(RunError::ShapeMismatch {
                key: "<new>".into(),
                expected: shape,
                found: vec![data.len()],
            });
        }
        Ok(Self {
            shape,
            data,
            device: Device::Cpu,
        })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; numel],
            device: Device::Cpu,
        }
    }

    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let numel = shape.iter().product();
        Self {
            shape,
            data: vec![value; numel],
            device: Device::Cpu,
        }
    }

    /// A one-element tensor of shape `[]`.
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![value],
            device: Device::Cpu,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn cpu(self) -> Self {
        self.to_device(Device::Cpu)
    }

    /// Equality on the raw bit patterns of the values, plus shape and device.
    pub fn bit_eq(&self, other: &Tensor) -> bool {
        self.shape == other.shape
            && self.device == other.device
            && self.data.len() == other.data.len()
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

mod f32_payload {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(data: &[f32], serializer: S) -> Result<S::Ok, S::Error> {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f32>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)?;
        if bytes.len() % 4 != 0 {
            return Err(D::Error::custom(format!(
                "tensor payload of {} bytes is not a whole number of f32 values",
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

/// Maps a stored tensor onto the device it should live on in this process.
///
/// Applied uniformly to every tensor read back from a checkpoint.
pub trait DevicePlacement: Send + Sync {
    fn place(&self, tensor: Tensor) -> Tensor;
}

impl<F> DevicePlacement for F
where
    F: Fn(Tensor) -> Tensor + Send + Sync,
{
    fn place(&self, tensor: Tensor) -> Tensor {
        self(tensor)
    }
}

/// Places every tensor on the accelerator matching the process rank, or on
/// the CPU when the process has no accelerator.
#[derive(Debug, Clone, Copy)]
pub struct RankPlacement {
    rank: usize,
    accelerator: bool,
}

impl RankPlacement {
    pub fn new(rank: usize, accelerator: bool) -> Self {
        Self { rank, accelerator }
    }

    pub fn target(&self) -> Device {
        if self.accelerator {
            Device::Cuda(self.rank)
        } else {
            Device::Cpu
        }
    }
}

impl DevicePlacement for RankPlacement {
    fn place(&self, tensor: Tensor) -> Tensor {
        tensor.to_device(self.target())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuPlacement;

impl DevicePlacement for CpuPlacement {
    fn place(&self, tensor: Tensor) -> Tensor {
        tensor.cpu()
    }
}

/// Apply `placement` to every tensor of a mapping.
pub fn place_all(placement: &dyn DevicePlacement, state: StateDict) -> StateDict {
    state
        .into_iter()
        .map(|(k, t)| (k, placement.place(t)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_checks_element_count() {
        assert!(Tensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(matches!(
            Tensor::new(vec![2, 3], vec![0.0; 5]),
            Err(RunError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_payload_preserves_special_values() {
        let t = Tensor::new(
            vec![5],
            vec![f32::NAN, -0.0, f32::INFINITY, f32::MIN_POSITIVE, 1.0e-40],
        )
        .unwrap();
        let json = serde_json::to_string(&t).unwrap();
        let back: Tensor = serde_json::from_str(&json).unwrap();
        assert!(t.bit_eq(&back));
    }

    #[test]
    fn test_payload_rejects_truncated_bytes() {
        let json = r#"{"shape":[1],"data":"AAA=","device":"cpu"}"#;
        assert!(serde_json::from_str::<Tensor>(json).is_err());
    }

    #[test]
    fn test_payload_must_fill_shape() {
        // Shape [2, 2] with a single encoded 1.0.
        let json = r#"{"shape":[2,2],"data":"AACAPw=="}"#;
        let err = serde_json::from_str::<Tensor>(json).unwrap_err();
        assert!(err.to_string().contains("Shape mismatch"));

        let json = r#"{"shape":[1],"data":"AACAPw==","device":{"cuda":1}}"#;
        let t: Tensor = serde_json::from_str(json).unwrap();
        assert_eq!(t.data(), &[1.0]);
        assert_eq!(t.device(), Device::Cuda(1));
    }

    #[test]
    fn test_device_display() {
        assert_eq!(Device::Cpu.to_string(), "cpu");
        assert_eq!(Device::Cuda(2).to_string(), "cuda:2");
    }

    #[test]
    fn test_rank_placement() {
        let t = Tensor::scalar(1.0);
        assert_eq!(RankPlacement::new(3, true).place(t.clone()).device(), Device::Cuda(3));
        assert_eq!(RankPlacement::new(3, false).place(t).device(), Device::Cpu);
    }

    #[test]
    fn test_closure_placement() {
        let placement = |t: Tensor| t.to_device(Device::Cuda(7));
        let mut state = StateDict::new();
        state.insert("w".into(), Tensor::zeros(vec![2]));
        let placed = place_all(&placement, state);
        assert_eq!(placed["w"].device(), Device::Cuda(7));
    }
}
