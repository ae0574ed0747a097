//! Host tensors with a tracked precision and device.
//!
//! Storage keeps elements at their declared width so byte footprints are
//! real. Arithmetic always happens on an `f32` working view produced by
//! [`Tensor::to_f32`]; operators cast their result back with
//! [`Tensor::from_f32`].

use std::fmt;
use std::str::FromStr;

use half::{bf16, f16};
use ndarray::{ArrayD, Dimension, IxDyn};
use serde::{Deserialize, Serialize};

use crate::{MergeError, Result};

/// Numeric precision of a tensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    /// 32-bit IEEE float.
    F32,
    /// 16-bit IEEE float.
    #[default]
    F16,
    /// bfloat16.
    BF16,
}

impl Dtype {
    /// Size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            Dtype::F32 => 4,
            Dtype::F16 | Dtype::BF16 => 2,
        }
    }

    /// Canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Dtype::F32 => "f32",
            Dtype::F16 => "f16",
            Dtype::BF16 => "bf16",
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dtype {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "float32" | "fp32" => Ok(Dtype::F32),
            "f16" | "float16" | "fp16" => Ok(Dtype::F16),
            "bf16" | "bfloat16" => Ok(Dtype::BF16),
            other => Err(MergeError::UnsupportedDtype(other.to_string())),
        }
    }
}

/// Compute device a tensor lives on.
///
/// The merge engine runs on host memory only; the device is still tracked so
/// that every tensor re-entering a graph is normalized to one target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Device {
    /// Host CPU memory.
    #[default]
    Cpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
        }
    }
}

impl FromStr for Device {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            other => Err(MergeError::InvalidConfig(format!(
                "unsupported device '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Storage {
    F32(ArrayD<f32>),
    F16(ArrayD<f16>),
    BF16(ArrayD<bf16>),
}

/// An n-dimensional tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    storage: Storage,
    device: Device,
}

impl Tensor {
    /// Build a tensor from an `f32` array, storing it at `dtype`.
    pub fn from_f32(data: ArrayD<f32>, dtype: Dtype) -> Self {
        let storage = match dtype {
            Dtype::F32 => Storage::F32(data),
            Dtype::F16 => Storage::F16(data.mapv(f16::from_f32)),
            Dtype::BF16 => Storage::BF16(data.mapv(bf16::from_f32)),
        };
        Self {
            storage,
            device: Device::Cpu,
        }
    }

    /// Build a tensor from row-major `f32` values.
    pub fn from_vec(shape: &[usize], data: Vec<f32>, dtype: Dtype) -> Result<Self> {
        let len = data.len();
        let array = ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|_| {
            MergeError::ShapeMismatch {
                name: "<literal>".to_string(),
                expected: shape.to_vec(),
                actual: vec![len],
            }
        })?;
        Ok(Self::from_f32(array, dtype))
    }

    /// Decode little-endian bytes as laid out by safetensors.
    pub fn from_le_bytes(shape: &[usize], bytes: &[u8], dtype: Dtype) -> Result<Self> {
        let expected = checked_numel(shape)?
            .checked_mul(dtype.size_in_bytes())
            .ok_or_else(|| overflow(shape))?;
        if bytes.len() != expected {
            return Err(MergeError::ShapeMismatch {
                name: "<bytes>".to_string(),
                expected: vec![expected],
                actual: vec![bytes.len()],
            });
        }
        let shape = IxDyn(shape);
        let storage = match dtype {
            Dtype::F32 => Storage::F32(array_from_bytes(shape, bytes)?),
            Dtype::F16 => Storage::F16(array_from_bytes(shape, bytes)?),
            Dtype::BF16 => Storage::BF16(array_from_bytes(shape, bytes)?),
        };
        Ok(Self {
            storage,
            device: Device::Cpu,
        })
    }

    /// A zero-filled tensor.
    pub fn zeros(shape: &[usize], dtype: Dtype) -> Self {
        Self::from_f32(ArrayD::zeros(IxDyn(shape)), dtype)
    }

    /// Tensor shape.
    pub fn shape(&self) -> &[usize] {
        match &self.storage {
            Storage::F32(a) => a.shape(),
            Storage::F16(a) => a.shape(),
            Storage::BF16(a) => a.shape(),
        }
    }

    /// Element precision.
    pub fn dtype(&self) -> Dtype {
        match self.storage {
            Storage::F32(_) => Dtype::F32,
            Storage::F16(_) => Dtype::F16,
            Storage::BF16(_) => Dtype::BF16,
        }
    }

    /// Device the tensor lives on.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Byte footprint: `numel * element size`.
    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype().size_in_bytes()
    }

    /// Owned `f32` working copy.
    pub fn to_f32(&self) -> ArrayD<f32> {
        match &self.storage {
            Storage::F32(a) => a.clone(),
            Storage::F16(a) => a.mapv(f16::to_f32),
            Storage::BF16(a) => a.mapv(bf16::to_f32),
        }
    }

    /// Row-major `f32` values.
    pub fn to_vec_f32(&self) -> Vec<f32> {
        match &self.storage {
            Storage::F32(a) => a.iter().copied().collect(),
            Storage::F16(a) => a.iter().map(|v| v.to_f32()).collect(),
            Storage::BF16(a) => a.iter().map(|v| v.to_f32()).collect(),
        }
    }

    /// Copy normalized to `device` and `dtype`.
    pub fn to(&self, device: Device, dtype: Dtype) -> Tensor {
        let mut out = if self.dtype() == dtype {
            self.clone()
        } else {
            Tensor::from_f32(self.to_f32(), dtype)
        };
        out.device = device;
        out
    }

    /// Consume and normalize to `device` and `dtype`, skipping the copy when
    /// nothing changes.
    pub fn into_device(self, device: Device, dtype: Dtype) -> Tensor {
        if self.dtype() == dtype && self.device == device {
            self
        } else {
            self.to(device, dtype)
        }
    }

    /// Little-endian bytes in row-major order.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match &self.storage {
            Storage::F32(a) => array_to_bytes(a),
            Storage::F16(a) => array_to_bytes(a),
            Storage::BF16(a) => array_to_bytes(a),
        }
    }
}

/// Element count of `shape`, failing instead of wrapping on overflow.
pub(crate) fn checked_numel(shape: &[usize]) -> Result<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| overflow(shape))
}

fn overflow(shape: &[usize]) -> MergeError {
    MergeError::ResourceExhausted(format!("tensor of shape {shape:?} is not addressable"))
}

fn array_from_bytes<T: bytemuck::Pod>(shape: IxDyn, bytes: &[u8]) -> Result<ArrayD<T>> {
    let values: Vec<T> = bytemuck::pod_collect_to_vec(bytes);
    let actual = values.len();
    ArrayD::from_shape_vec(shape.clone(), values).map_err(|_| MergeError::ShapeMismatch {
        name: "<bytes>".to_string(),
        expected: shape.slice().to_vec(),
        actual: vec![actual],
    })
}

fn array_to_bytes<T: bytemuck::Pod>(array: &ArrayD<T>) -> Vec<u8> {
    let values: Vec<T> = array.iter().copied().collect();
    bytemuck::cast_slice(&values).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_parse() {
        assert_eq!("float16".parse::<Dtype>().unwrap(), Dtype::F16);
        assert_eq!("BF16".parse::<Dtype>().unwrap(), Dtype::BF16);
        assert_eq!("fp32".parse::<Dtype>().unwrap(), Dtype::F32);
        assert!("int8".parse::<Dtype>().is_err());
    }

    #[test]
    fn test_device_parse() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert!("cuda:0".parse::<Device>().is_err());
    }

    #[test]
    fn test_nbytes_follows_dtype() {
        let t = Tensor::zeros(&[4, 8], Dtype::F32);
        assert_eq!(t.nbytes(), 4 * 8 * 4);
        assert_eq!(t.to(Device::Cpu, Dtype::F16).nbytes(), 4 * 8 * 2);
        assert_eq!(t.to(Device::Cpu, Dtype::BF16).nbytes(), 4 * 8 * 2);
    }

    #[test]
    fn test_cast_rounds_through_half() {
        let t = Tensor::from_vec(&[2], vec![1.0, 0.1], Dtype::F32).unwrap();
        let h = t.to(Device::Cpu, Dtype::F16);
        let v = h.to_vec_f32();
        assert_eq!(v[0], 1.0);
        assert_eq!(v[1], f16::from_f32(0.1).to_f32());
    }

    #[test]
    fn test_bytes_roundtrip_bf16() {
        let t = Tensor::from_vec(&[2, 2], vec![1.0, -2.0, 0.5, 4.0], Dtype::BF16).unwrap();
        let bytes = t.to_le_bytes();
        assert_eq!(bytes.len(), 8);
        let back = Tensor::from_le_bytes(&[2, 2], &bytes, Dtype::BF16).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_from_vec_rejects_wrong_len() {
        assert!(Tensor::from_vec(&[3], vec![1.0, 2.0], Dtype::F32).is_err());
    }

    #[test]
    fn test_checked_numel_overflow() {
        let err = checked_numel(&[usize::MAX, 2]).unwrap_err();
        assert!(matches!(err, MergeError::ResourceExhausted(_)));
    }
}
