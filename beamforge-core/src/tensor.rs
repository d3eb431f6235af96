//! Tensor handles attached to requests
//!
//! The core never inspects tensor memory layout. Optional request tensors
//! (embedding bias, bad/stop words, prompt tables, LoRA weights, draft logits)
//! are carried as [`TensorPtr`] handles and only read, written or migrated
//! through the [`TensorHandle`] capability.

use std::fmt;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

use crate::error::{EngineError, Result};

/// Shared handle to a request tensor
pub type TensorPtr = Arc<dyn TensorHandle>;

/// Where a tensor's storage lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Host,
    Device,
}

/// Capability interface over a concrete tensor representation
pub trait TensorHandle: fmt::Debug + Send + Sync {
    fn shape(&self) -> Vec<usize>;

    fn memory_kind(&self) -> MemoryKind;

    /// Number of elements
    fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Copy the contents out as a flat `f32` vector
    fn read_f32(&self) -> Result<Vec<f32>>;

    /// Overwrite the contents; `data` must match the element count
    fn write_f32(&mut self, data: &[f32]) -> Result<()>;

    /// Copy into device memory on `device`
    fn to_device(&self, device: &Device) -> Result<TensorPtr>;
}

/// Host-resident tensor backed by a plain vector
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl HostTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(EngineError::invalid_argument(format!(
                "host tensor of shape {:?} needs {} elements, got {}",
                shape,
                numel,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; numel],
        }
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

impl TensorHandle for HostTensor {
    fn shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    fn memory_kind(&self) -> MemoryKind {
        MemoryKind::Host
    }

    fn read_f32(&self) -> Result<Vec<f32>> {
        Ok(self.data.clone())
    }

    fn write_f32(&mut self, data: &[f32]) -> Result<()> {
        if data.len() != self.data.len() {
            return Err(EngineError::invalid_argument(format!(
                "write of {} elements into host tensor of {} elements",
                data.len(),
                self.data.len()
            )));
        }
        self.data.copy_from_slice(data);
        Ok(())
    }

    fn to_device(&self, device: &Device) -> Result<TensorPtr> {
        let tensor = Tensor::from_vec(self.data.clone(), self.shape.clone(), device)?;
        Ok(Arc::new(DeviceTensor::new(tensor)))
    }
}

/// Device-resident tensor owned by candle
#[derive(Debug, Clone)]
pub struct DeviceTensor {
    inner: Tensor,
}

impl DeviceTensor {
    pub fn new(inner: Tensor) -> Self {
        Self { inner }
    }

    pub fn tensor(&self) -> &Tensor {
        &self.inner
    }
}

impl TensorHandle for DeviceTensor {
    fn shape(&self) -> Vec<usize> {
        self.inner.dims().to_vec()
    }

    fn memory_kind(&self) -> MemoryKind {
        MemoryKind::Device
    }

    fn read_f32(&self) -> Result<Vec<f32>> {
        Ok(self
            .inner
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?)
    }

    fn write_f32(&mut self, data: &[f32]) -> Result<()> {
        if data.len() != self.inner.elem_count() {
            return Err(EngineError::invalid_argument(format!(
                "write of {} elements into device tensor of {} elements",
                data.len(),
                self.inner.elem_count()
            )));
        }
        let dtype = self.inner.dtype();
        let updated = Tensor::from_vec(data.to_vec(), self.inner.dims().to_vec(), self.inner.device())?;
        self.inner = updated.to_dtype(dtype)?;
        Ok(())
    }

    fn to_device(&self, device: &Device) -> Result<TensorPtr> {
        Ok(Arc::new(DeviceTensor::new(self.inner.to_device(device)?)))
    }
}
