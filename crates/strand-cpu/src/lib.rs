//! # strand-cpu
//!
//! The CPU backend. Storage is a plain `Vec` per dtype; kernels read through
//! the layout's strided indices, so views (permuted, narrowed, broadcast)
//! never need to be materialized before an op runs.

mod ops;

use strand_core::backend::{BackendDevice, BackendStorage};
use strand_core::{DType, Error, Result, Tensor, WithDType};

pub use ops::CpuBackend;

/// The host CPU. There is exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuDevice;

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }
}

/// Tensor data in host memory.
#[derive(Debug, Clone, PartialEq)]
pub enum CpuStorage {
    F32(Vec<f32>),
    F64(Vec<f64>),
    U8(Vec<u8>),
    U32(Vec<u32>),
    I64(Vec<i64>),
}

/// Apply the same expression to whichever vector a storage holds.
macro_rules! map_storage {
    ($storage:expr, $v:ident => $body:expr) => {
        match $storage {
            CpuStorage::F32($v) => $body,
            CpuStorage::F64($v) => $body,
            CpuStorage::U8($v) => $body,
            CpuStorage::U32($v) => $body,
            CpuStorage::I64($v) => $body,
        }
    };
}

impl CpuStorage {
    /// Convert host values into storage of `dtype`.
    pub fn from_f64(data: &[f64], dtype: DType) -> Self {
        fn conv<T: WithDType>(data: &[f64]) -> Vec<T> {
            data.iter().map(|&v| T::from_f64(v)).collect()
        }
        match dtype {
            DType::F32 => CpuStorage::F32(conv(data)),
            DType::F64 => CpuStorage::F64(data.to_vec()),
            DType::U8 => CpuStorage::U8(conv(data)),
            DType::U32 => CpuStorage::U32(conv(data)),
            DType::I64 => CpuStorage::I64(conv(data)),
        }
    }

    /// Element at a raw storage position.
    #[inline]
    pub fn get_f64(&self, i: usize) -> f64 {
        map_storage!(self, v => v[i].to_f64())
    }

    /// Read every element of `layout` in logical order.
    pub fn gather(&self, layout: &strand_core::Layout) -> Result<Vec<f64>> {
        let len = self.len();
        let mut out = Vec::with_capacity(layout.elem_count());
        for i in layout.strided_indices() {
            if i >= len {
                return Err(Error::msg(format!(
                    "layout reads index {} of a storage with {} elements",
                    i, len
                )));
            }
            out.push(self.get_f64(i));
        }
        Ok(out)
    }
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
            CpuStorage::U8(_) => DType::U8,
            CpuStorage::U32(_) => DType::U32,
            CpuStorage::I64(_) => DType::I64,
        }
    }

    fn len(&self) -> usize {
        map_storage!(self, v => v.len())
    }
}

/// Convenience alias used throughout tests and examples.
pub type CpuTensor = Tensor<CpuBackend>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_f64_converts() {
        let s = CpuStorage::from_f64(&[1.7, -2.0], DType::I64);
        assert_eq!(s, CpuStorage::I64(vec![1, -2]));
        assert_eq!(s.dtype(), DType::I64);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn test_gather_out_of_range() {
        let s = CpuStorage::from_f64(&[1.0, 2.0], DType::F32);
        let layout = strand_core::Layout::contiguous(strand_core::Shape::from(3));
        assert!(s.gather(&layout).is_err());
    }
}
