use std::{ops::Range, sync::Arc};

#[cfg(feature = "cuda")]
use crate::{cuda_backend::CudaStorage, Error};
use crate::{
    cpu_storage::{kernel::HostKernel, CpuStorage},
    device::DeviceInfo,
    DType, Result,
};

/// One device-resident buffer. Cloning clones the handle, not the data.
pub(crate) enum Storage<T: DType> {
    #[cfg(feature = "cuda")]
    Cuda(CudaStorage<T>),
    Cpu(CpuStorage<T>),
}

impl<T: DType> Clone for Storage<T> {
    fn clone(&self) -> Self {
        match self {
            #[cfg(feature = "cuda")]
            Self::Cuda(cuda) => Self::Cuda(cuda.clone()),
            Self::Cpu(cpu) => Self::Cpu(cpu.clone()),
        }
    }
}

impl<T: DType> Storage<T> {
    pub(crate) fn as_cpu(&self) -> Result<&CpuStorage<T>> {
        match self {
            Self::Cpu(cpu) => Ok(cpu),
            #[cfg(feature = "cuda")]
            Self::Cuda(_) => Err(Error::msg("expected a host buffer, found a CUDA buffer")),
        }
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn as_cuda(&self) -> Result<&CudaStorage<T>> {
        match self {
            Self::Cuda(cuda) => Ok(cuda),
            Self::Cpu(_) => Err(Error::msg("expected a CUDA buffer, found a host buffer")),
        }
    }
}

/// Buffer management shared by every backend.
///
/// Transfers are ordered after the work already queued on the device.
pub(crate) trait BackendDevice {
    type Storage<T: DType>: Clone + Send + Sync;

    fn info(&self) -> &DeviceInfo;

    fn alloc_zeros<T: DType>(&self, len: usize) -> Result<Self::Storage<T>>;

    fn upload<T: DType>(&self, data: &[T]) -> Result<Self::Storage<T>>;

    fn download<T: DType>(&self, storage: &Self::Storage<T>, range: Range<usize>)
        -> Result<Vec<T>>;

    fn write<T: DType>(&self, storage: &Self::Storage<T>, offset: usize, data: &[T])
        -> Result<()>;

    fn duplicate<T: DType>(&self, storage: &Self::Storage<T>, len: usize)
        -> Result<Self::Storage<T>>;

    /// Number of partial values a reduction over `len` elements leaves behind.
    fn partial_count(&self, len: usize) -> usize;

    /// Block until every queued job has run, surfacing deferred failures.
    fn finish(&self) -> Result<()>;
}

/// A compiled kernel, ready to launch on the device it was built for.
#[derive(Clone)]
pub(crate) enum Program {
    Host(Arc<HostKernel>),
    #[cfg(feature = "cuda")]
    Cuda(cudarc::driver::CudaFunction),
}
