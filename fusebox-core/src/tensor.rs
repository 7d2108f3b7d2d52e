use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::engine::{DeviceEngine, EngineKind};
use crate::logical_tensor::dense_strides;
use crate::{bail, LogicalTensor, Result};

/// Raw bytes shared between the caller and the executing entry point.
#[derive(Debug, Clone, Default)]
pub struct Buffer(Arc<RwLock<Vec<u8>>>);

impl Buffer {
    pub fn zeroed(bytes: usize) -> Self {
        Self(Arc::new(RwLock::new(vec![0; bytes])))
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Element offset of every logical (row-major) index under `strides`.
pub(crate) fn strided_offsets(dims: &[i64], strides: &[i64]) -> Vec<usize> {
    let total: usize = dims.iter().map(|d| (*d).max(0) as usize).product();
    (0..total)
        .map(|mut idx| {
            let mut offset = 0;
            for axis in (0..dims.len()).rev() {
                let extent = dims[axis].max(1) as usize;
                offset += (idx % extent) * strides[axis] as usize;
                idx /= extent;
            }
            offset
        })
        .collect()
}

/// Elements spanned by a strided layout.
pub(crate) fn span(dims: &[i64], strides: &[i64]) -> usize {
    if dims.iter().any(|d| *d == 0) {
        return 0;
    }
    1 + dims
        .iter()
        .zip(strides)
        .map(|(d, s)| ((*d).max(1) as usize - 1) * (*s).max(0) as usize)
        .sum::<usize>()
}

/// A logical tensor bound to memory.
#[derive(Debug, Clone)]
pub struct Tensor {
    lt: LogicalTensor,
    buffer: Buffer,
}

impl Tensor {
    /// Allocate zeroed memory for `lt`, which must have known dims.
    pub fn zeros(lt: LogicalTensor) -> Result<Self> {
        if !lt.is_shape_known() {
            bail!("cannot allocate logical tensor {} with unknown shape", lt.id)
        }
        let bytes = Self::required_bytes(&lt)?;
        Ok(Self {
            lt,
            buffer: Buffer::zeroed(bytes),
        })
    }

    /// Bind `lt` to existing memory, which must cover its layout.
    pub fn with_buffer(lt: LogicalTensor, buffer: Buffer) -> Result<Self> {
        if !lt.is_shape_known() {
            bail!("cannot bind logical tensor {} with unknown shape", lt.id)
        }
        let bytes = Self::required_bytes(&lt)?;
        if buffer.len() < bytes {
            bail!(
                "tensor {} needs {bytes} bytes, buffer holds {}",
                lt.id,
                buffer.len()
            )
        }
        Ok(Self { lt, buffer })
    }

    /// Bytes spanned by `lt`'s layout. Strides must match the rank and be non-negative.
    fn required_bytes(lt: &LogicalTensor) -> Result<usize> {
        if let Some(strides) = lt.strides() {
            if strides.len() != lt.vdims().len() {
                bail!(
                    "tensor {} has {} strides for rank {}",
                    lt.id,
                    strides.len(),
                    lt.vdims().len()
                )
            }
            if let Some(s) = strides.iter().find(|s| **s < 0) {
                bail!("tensor {} has negative stride {s}", lt.id)
            }
        }
        let strides = Self::layout_strides(lt);
        Ok(span(lt.vdims(), &strides) * lt.data_type.size_in_bytes())
    }

    /// Allocate and fill from row-major `data`, encoding to the tensor's element type.
    pub fn from_f32(lt: LogicalTensor, data: &[f32]) -> Result<Self> {
        let t = Self::zeros(lt)?;
        if data.len() != t.lt.element_count() {
            bail!(
                "tensor {} has {} elements, got {}",
                t.lt.id,
                t.lt.element_count(),
                data.len()
            )
        }
        t.write_f32(data);
        Ok(t)
    }

    fn layout_strides(lt: &LogicalTensor) -> Vec<i64> {
        lt.strides()
            .map(<[i64]>::to_vec)
            .unwrap_or_else(|| dense_strides(lt.vdims()))
    }

    /// Decode to row-major f32.
    pub fn to_f32(&self) -> Vec<f32> {
        let dtype = self.lt.data_type;
        let bytes = self.buffer.read();
        strided_offsets(self.lt.vdims(), &Self::layout_strides(&self.lt))
            .into_iter()
            .map(|off| dtype.read(&bytes, off))
            .collect()
    }

    /// Encode row-major `data` into the buffer.
    pub fn write_f32(&self, data: &[f32]) {
        let dtype = self.lt.data_type;
        let mut bytes = self.buffer.write();
        for (off, v) in strided_offsets(self.lt.vdims(), &Self::layout_strides(&self.lt))
            .into_iter()
            .zip(data)
        {
            dtype.write(&mut bytes, off, *v);
        }
    }

    pub fn logical_tensor(&self) -> &LogicalTensor {
        &self.lt
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }
}

/// A caller-side execution stream on a device.
#[derive(Debug, Clone)]
pub struct Stream {
    device_id: u64,
    kind: EngineKind,
}

impl Stream {
    pub fn new(device: &DeviceEngine) -> Self {
        Self {
            device_id: device.id(),
            kind: device.kind(),
        }
    }

    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DataType;

    #[test]
    fn strided_round_trip_keeps_logical_order() {
        // 2x3 stored column-major
        let lt = LogicalTensor::new(0, [2, 3], DataType::F32).with_strides([1, 2]);
        let t = Tensor::from_f32(lt, &[1., 2., 3., 4., 5., 6.]).unwrap();
        assert_eq!(t.buffer().len(), 24);
        assert_eq!(t.to_f32(), vec![1., 2., 3., 4., 5., 6.]);
        let raw = t.buffer().read();
        assert_eq!(DataType::F32.read(&raw, 1), 4.);
    }

    #[test]
    fn encodes_element_type() {
        let lt = LogicalTensor::new(0, [3], DataType::U8);
        let t = Tensor::from_f32(lt, &[1.4, 300., -2.]).unwrap();
        assert_eq!(t.buffer().len(), 3);
        assert_eq!(t.to_f32(), vec![1., 255., 0.]);
    }

    #[test]
    fn malformed_strides_are_rejected() {
        let negative = LogicalTensor::new(0, [2, 3], DataType::F32).with_strides([-3, 1]);
        let err = Tensor::zeros(negative).unwrap_err();
        assert!(err.to_string().contains("negative stride -3"));

        let short = LogicalTensor::new(0, [2, 3], DataType::F32).with_strides([1]);
        assert!(Tensor::zeros(short.clone()).is_err());
        assert!(Tensor::from_f32(short, &[0.; 6]).is_err());
    }

    #[test]
    fn bound_buffer_must_cover_the_layout() {
        let lt = LogicalTensor::new(0, [2, 3], DataType::F32).with_strides([1, 2]);
        assert!(Tensor::with_buffer(lt.clone(), Buffer::zeroed(20)).is_err());
        let buffer = Buffer::zeroed(24);
        let t = Tensor::with_buffer(lt.clone(), buffer.clone()).unwrap();
        assert!(t.buffer().ptr_eq(&buffer));
        assert!(Tensor::with_buffer(lt.with_strides([-1, 2]), buffer).is_err());
    }

    #[test]
    fn unknown_shape_cannot_allocate() {
        assert!(Tensor::zeros(LogicalTensor::unknown(0, DataType::F32)).is_err());
    }
}
