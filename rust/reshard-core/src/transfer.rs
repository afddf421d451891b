// rust/reshard-core/src/transfer.rs

//! Packing of many small transfers into one broadcast.
//!
//! The source rank appends its slices, the receivers append placeholders of
//! the same shapes, one broadcast moves the used region and every rank
//! recovers the individual tensors in append order.

use crate::error::{ReshardError, Result};
use crate::tensor::{numel, DType, Tensor};

/// Default lower bound on buffer capacity, in elements.
pub const DEFAULT_TRANSFER_FLOOR: u64 = 256 * 1024 * 1024;

/// A fixed-capacity, single-dtype staging buffer.
#[derive(Debug)]
pub struct TransferBuffer {
    dtype: DType,
    capacity: u64,
    used: u64,
    data: Vec<u8>,
    shapes: Vec<Vec<u64>>,
}

impl TransferBuffer {
    /// Creates an empty buffer holding up to `capacity` elements.
    ///
    /// No memory is allocated until the first append.
    pub fn new(dtype: DType, capacity: u64) -> Self {
        Self {
            dtype,
            capacity,
            used: 0,
            data: Vec::new(),
            shapes: Vec::new(),
        }
    }

    /// Creates a buffer large enough for `largest` elements and never
    /// smaller than `floor`.
    pub fn sized_for(dtype: DType, largest: u64, floor: u64) -> Self {
        Self::new(dtype, largest.max(floor))
    }

    /// Appends the bytes of `tensor`.
    ///
    /// # Returns
    /// `false`, leaving the buffer unchanged, when the tensor does not fit.
    ///
    /// # Errors
    /// Returns an error if the tensor dtype differs from the buffer's.
    pub fn append(&mut self, tensor: &Tensor) -> Result<bool> {
        if tensor.dtype() != self.dtype {
            return Err(ReshardError::tensor(format!(
                "cannot pack {} tensor into {} transfer buffer",
                tensor.dtype(),
                self.dtype
            )));
        }
        if !self.fits(tensor.numel()) {
            return Ok(false);
        }
        self.data.extend_from_slice(tensor.as_bytes());
        self.push_shape(tensor.shape().to_vec());
        Ok(true)
    }

    /// Reserves zeroed space for a tensor of `shape` that will be received.
    pub fn append_placeholder(&mut self, shape: &[u64]) -> bool {
        let count = numel(shape);
        if !self.fits(count) {
            return false;
        }
        let len = self.data.len() + count as usize * self.dtype.size();
        self.data.resize(len, 0);
        self.push_shape(shape.to_vec());
        true
    }

    /// Splits the used region back into tensors, in append order.
    pub fn recover(&self) -> Result<Vec<Tensor>> {
        let elem = self.dtype.size();
        let mut start = 0usize;
        let mut out = Vec::with_capacity(self.shapes.len());
        for shape in &self.shapes {
            let len = numel(shape) as usize * elem;
            let bytes = self.data[start..start + len].to_vec();
            out.push(Tensor::new(self.dtype, shape.clone(), bytes)?);
            start += len;
        }
        Ok(out)
    }

    /// Forgets every entry but keeps the allocation.
    pub fn clear(&mut self) {
        self.used = 0;
        self.data.clear();
        self.shapes.clear();
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Elements in use.
    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    /// Bytes of the used region.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn fits(&self, count: u64) -> bool {
        self.used + count <= self.capacity
    }

    fn push_shape(&mut self, shape: Vec<u64>) {
        self.used += numel(&shape);
        self.shapes.push(shape);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(len: u64, value: f32) -> Tensor {
        Tensor::from_f32(vec![len], &vec![value; len as usize]).unwrap()
    }

    #[test]
    fn test_append_until_full() {
        let mut buffer = TransferBuffer::new(DType::F32, 10);

        assert!(buffer.append(&filled(4, 1.0)).unwrap());
        assert!(buffer.append(&filled(4, 2.0)).unwrap());
        assert!(!buffer.append(&filled(4, 3.0)).unwrap());
        assert_eq!(buffer.used(), 8);

        let recovered = buffer.recover().unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered[0].to_f32_vec().unwrap(), vec![1.0; 4]);
        assert_eq!(recovered[1].to_f32_vec().unwrap(), vec![2.0; 4]);
    }

    #[test]
    fn test_dtype_mismatch_is_error() {
        let mut buffer = TransferBuffer::new(DType::BF16, 10);
        assert!(buffer.append(&filled(2, 1.0)).is_err());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_placeholders_receive_bytes() {
        let mut sender = TransferBuffer::new(DType::F32, 16);
        sender
            .append(&Tensor::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap())
            .unwrap();
        sender.append(&filled(3, 9.0)).unwrap();

        let mut receiver = TransferBuffer::new(DType::F32, 16);
        assert!(receiver.append_placeholder(&[2, 2]));
        assert!(receiver.append_placeholder(&[3]));
        assert!(!receiver.append_placeholder(&[10]));

        receiver.as_bytes_mut().copy_from_slice(sender.as_bytes());
        let recovered = receiver.recover().unwrap();
        assert_eq!(recovered[0].shape(), &[2, 2]);
        assert_eq!(recovered[0].to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(recovered[1].to_f32_vec().unwrap(), vec![9.0; 3]);
    }

    #[test]
    fn test_clear_and_sizing() {
        let mut buffer = TransferBuffer::sized_for(DType::F32, 3, 8);
        assert_eq!(buffer.capacity(), 8);
        assert_eq!(TransferBuffer::sized_for(DType::F32, 20, 8).capacity(), 20);

        buffer.append(&filled(8, 1.0)).unwrap();
        buffer.clear();
        assert_eq!(buffer.used(), 0);
        assert!(buffer.as_bytes().is_empty());
        assert!(buffer.append(&filled(8, 1.0)).unwrap());
    }

    #[test]
    fn test_scalar_entries() {
        let mut buffer = TransferBuffer::new(DType::F32, 2);
        assert!(buffer.append(&Tensor::from_f32(vec![], &[5.0]).unwrap()).unwrap());
        let recovered = buffer.recover().unwrap();
        assert!(recovered[0].shape().is_empty());
        assert_eq!(recovered[0].to_f32_vec().unwrap(), vec![5.0]);
    }
}
