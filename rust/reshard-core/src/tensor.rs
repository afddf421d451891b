// rust/reshard-core/src/tensor.rs

//! Dense tensor buffers used as shard payloads.
//!
//! A [`Tensor`] is a row-major byte buffer tagged with a [`DType`], a shape and
//! the [`Device`] it lives on. The engine never interprets element values; it
//! only moves N-D regions between buffers, so every operation here is a byte
//! copy driven by the element width of the dtype.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ReshardError, Result};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "uint8")]
    U8,
    #[serde(rename = "int8")]
    I8,
    #[serde(rename = "int16")]
    I16,
    #[serde(rename = "uint16")]
    U16,
    #[serde(rename = "int32")]
    I32,
    #[serde(rename = "int64")]
    I64,
    #[serde(rename = "float16")]
    F16,
    #[serde(rename = "bfloat16")]
    BF16,
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "float64")]
    F64,
    #[serde(rename = "float8_e4m3fn")]
    F8E4M3,
    #[serde(rename = "float8_e5m2")]
    F8E5M2,
}

impl DType {
    /// Width of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::Bool | DType::U8 | DType::I8 | DType::F8E4M3 | DType::F8E5M2 => 1,
            DType::I16 | DType::U16 | DType::F16 | DType::BF16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::U8 => "uint8",
            DType::I8 => "int8",
            DType::I16 => "int16",
            DType::U16 => "uint16",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::F8E4M3 => "float8_e4m3fn",
            DType::F8E5M2 => "float8_e5m2",
        }
    }

    const ALL: [DType; 13] = [
        DType::Bool,
        DType::U8,
        DType::I8,
        DType::I16,
        DType::U16,
        DType::I32,
        DType::I64,
        DType::F16,
        DType::BF16,
        DType::F32,
        DType::F64,
        DType::F8E4M3,
        DType::F8E5M2,
    ];
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = ReshardError;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.to_lowercase();
        DType::ALL
            .iter()
            .copied()
            .find(|d| d.name() == lowered)
            .ok_or_else(|| ReshardError::config(format!("unknown dtype: {s}")))
    }
}

/// Where a tensor buffer lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Host,
    Accelerator(u32),
}

/// Number of elements described by a shape. A rank-0 shape holds one element.
pub fn numel(shape: &[u64]) -> u64 {
    shape.iter().product()
}

/// Row-major element strides for a shape.
pub fn strides(shape: &[u64]) -> Vec<u64> {
    let mut strides = vec![1u64; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

/// A dense, row-major tensor buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<u64>,
    data: Vec<u8>,
    device: Device,
}

impl Tensor {
    /// Wraps raw little-endian bytes as a host tensor.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` does not hold exactly `numel(shape)` elements.
    pub fn new(dtype: DType, shape: Vec<u64>, data: Vec<u8>) -> Result<Self> {
        let expected = numel(&shape) as usize * dtype.size();
        if data.len() != expected {
            return Err(ReshardError::tensor(format!(
                "buffer of {} bytes does not match shape {:?} of {} ({} bytes expected)",
                data.len(),
                shape,
                dtype,
                expected
            )));
        }
        Ok(Self {
            dtype,
            shape,
            data,
            device: Device::Host,
        })
    }

    pub fn zeros(dtype: DType, shape: Vec<u64>) -> Self {
        let len = numel(&shape) as usize * dtype.size();
        Self {
            dtype,
            shape,
            data: vec![0u8; len],
            device: Device::Host,
        }
    }

    pub fn from_f32(shape: Vec<u64>, values: &[f32]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DType::F32, shape, data)
    }

    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        if self.dtype != DType::F32 {
            return Err(ReshardError::tensor(format!(
                "cannot read {} tensor as float32",
                self.dtype
            )));
        }
        Ok(self
            .data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    #[must_use]
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> u64 {
        numel(&self.shape)
    }

    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Reinterprets the buffer with a new shape of the same element count.
    pub fn reshape(&mut self, shape: Vec<u64>) -> Result<()> {
        if numel(&shape) != self.numel() {
            return Err(ReshardError::tensor(format!(
                "cannot reshape {:?} into {:?}",
                self.shape, shape
            )));
        }
        self.shape = shape;
        Ok(())
    }

    pub fn flatten(&mut self) {
        self.shape = vec![self.numel()];
    }

    /// Copies the region `[start, start + shape)` into a new tensor on the same device.
    pub fn slice(&self, start: &[u64], shape: &[u64]) -> Result<Tensor> {
        let mut out = Tensor::zeros(self.dtype, shape.to_vec()).with_device(self.device);
        let origin = vec![0u64; shape.len()];
        copy_region(self, start, &mut out, &origin, shape)?;
        Ok(out)
    }

    /// Writes all of `src` into this tensor at `start`.
    pub fn assign(&mut self, start: &[u64], src: &Tensor) -> Result<()> {
        let origin = vec![0u64; src.rank()];
        copy_region(src, &origin, self, start, src.shape())
    }

    /// Copies the flat element run `[begin, end)` into a new 1-D tensor.
    pub fn flat_slice(&self, begin: u64, end: u64) -> Result<Tensor> {
        self.check_flat_range(begin, end)?;
        let elem = self.dtype.size();
        let bytes = self.data[begin as usize * elem..end as usize * elem].to_vec();
        Ok(Tensor::new(self.dtype, vec![end - begin], bytes)?.with_device(self.device))
    }

    /// Overwrites the flat element run starting at `begin` with the bytes of `src`.
    pub fn flat_assign(&mut self, begin: u64, src: &Tensor) -> Result<()> {
        if src.dtype != self.dtype {
            return Err(dtype_mismatch(src.dtype, self.dtype));
        }
        let end = begin + src.numel();
        self.check_flat_range(begin, end)?;
        let elem = self.dtype.size();
        self.data[begin as usize * elem..end as usize * elem].copy_from_slice(&src.data);
        Ok(())
    }

    fn check_flat_range(&self, begin: u64, end: u64) -> Result<()> {
        if begin > end || end > self.numel() {
            return Err(ReshardError::tensor(format!(
                "flat range [{begin}, {end}) out of bounds for {} elements",
                self.numel()
            )));
        }
        Ok(())
    }
}

fn dtype_mismatch(src: DType, dst: DType) -> ReshardError {
    ReshardError::tensor(format!("dtype mismatch: copying {src} into {dst}"))
}

/// Copies the N-D region of `shape` elements from `src` at `src_start` into
/// `dst` at `dst_start`. Both tensors must have the region's rank.
pub fn copy_region(
    src: &Tensor,
    src_start: &[u64],
    dst: &mut Tensor,
    dst_start: &[u64],
    shape: &[u64],
) -> Result<()> {
    if src.dtype != dst.dtype {
        return Err(dtype_mismatch(src.dtype, dst.dtype));
    }
    check_region(src.shape(), src_start, shape, "source")?;
    check_region(dst.shape(), dst_start, shape, "destination")?;

    let elem = src.dtype.size();
    let rank = shape.len();
    if rank == 0 {
        dst.data[..elem].copy_from_slice(&src.data[..elem]);
        return Ok(());
    }
    if shape.iter().any(|&s| s == 0) {
        return Ok(());
    }

    let src_strides = strides(&src.shape);
    let dst_strides = strides(&dst.shape);
    let row_bytes = shape[rank - 1] as usize * elem;
    let mut idx = vec![0u64; rank - 1];

    loop {
        let mut src_off = src_start[rank - 1];
        let mut dst_off = dst_start[rank - 1];
        for k in 0..rank - 1 {
            src_off += (src_start[k] + idx[k]) * src_strides[k];
            dst_off += (dst_start[k] + idx[k]) * dst_strides[k];
        }
        let s = src_off as usize * elem;
        let d = dst_off as usize * elem;
        dst.data[d..d + row_bytes].copy_from_slice(&src.data[s..s + row_bytes]);

        let mut k = rank - 1;
        loop {
            if k == 0 {
                return Ok(());
            }
            k -= 1;
            idx[k] += 1;
            if idx[k] < shape[k] {
                break;
            }
            idx[k] = 0;
        }
    }
}

fn check_region(tensor_shape: &[u64], start: &[u64], shape: &[u64], side: &str) -> Result<()> {
    if tensor_shape.len() != shape.len() || start.len() != shape.len() {
        return Err(ReshardError::tensor(format!(
            "{side} region rank mismatch: tensor {tensor_shape:?}, start {start:?}, shape {shape:?}"
        )));
    }
    for d in 0..shape.len() {
        if start[d] + shape[d] > tensor_shape[d] {
            return Err(ReshardError::tensor(format!(
                "{side} region {start:?}+{shape:?} exceeds tensor shape {tensor_shape:?}"
            )));
        }
    }
    Ok(())
}
