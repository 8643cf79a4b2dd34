use std::{ops::Range, path::PathBuf, sync::Arc};

use cudarc::{
    driver::{
        sys::CUdevice_attribute, CudaContext, CudaSlice, CudaStream, LaunchConfig, PushKernelArg,
    },
    nvrtc::{CompileOptions, Ptx},
};
use error::{build_log, CudaError, WrapErr};
use parking_lot::{RwLock, RwLockReadGuard};

use crate::{
    device::{Backend, DeviceInfo},
    kernel::{codegen::REDUCE_BLOCK, KernelArg, KernelIr, Launch, LaunchTarget},
    storage::{BackendDevice, Program},
    DType, Error, Result,
};

pub(crate) mod error;

/// Threads per block of element-wise and sort kernels.
const BLOCK: usize = 256;
/// Upper bound on the blocks of a reduction, and so on its partial results.
const MAX_REDUCE_BLOCKS: usize = 1024;
const MAX_GRID: usize = 65535;

/// A device buffer. Allocations hold at least one element so that empty partitions
/// still have a valid pointer.
pub(crate) struct CudaStorage<T: DType>(pub(crate) Arc<RwLock<CudaSlice<T>>>);

impl<T: DType> Clone for CudaStorage<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: DType> CudaStorage<T> {
    fn new(slice: CudaSlice<T>) -> Self {
        Self(Arc::new(RwLock::new(slice)))
    }
}

/// One CUDA device with a single in-order stream.
pub struct CudaDevice {
    info: DeviceInfo,
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
}

fn cuda_include_dir() -> Option<PathBuf> {
    // NOTE: copied from cudarc build.rs.
    let env_vars = [
        "CUDA_PATH",
        "CUDA_ROOT",
        "CUDA_TOOLKIT_ROOT_DIR",
        "CUDNN_LIB",
    ];
    let env_vars = env_vars
        .into_iter()
        .map(std::env::var)
        .filter_map(std::result::Result::ok)
        .map(Into::<PathBuf>::into);

    let roots = [
        "/usr",
        "/usr/local/cuda",
        "/opt/cuda",
        "/usr/lib/cuda",
        "C:/Program Files/NVIDIA GPU Computing Toolkit",
        "C:/CUDA",
    ];
    let roots = roots.into_iter().map(Into::<PathBuf>::into);

    env_vars
        .chain(roots)
        .find(|path| path.join("include").join("cuda.h").is_file())
}

/// A kernel argument with its buffer pinned until the launch is enqueued.
enum Held<'a, T: DType> {
    Values(RwLockReadGuard<'a, CudaSlice<T>>),
    Scalar(T),
    Offset(i64),
    Count(u64),
    Rows(RwLockReadGuard<'a, CudaSlice<u64>>),
    Columns(RwLockReadGuard<'a, CudaSlice<u32>>),
    Shifts(RwLockReadGuard<'a, CudaSlice<i32>>),
}

impl<'a, T: DType> Held<'a, T> {
    fn hold(arg: &'a KernelArg<T>) -> Result<Self> {
        Ok(match arg {
            KernelArg::Values(s) => Self::Values(s.as_cuda()?.0.read_recursive()),
            KernelArg::Scalar(v) => Self::Scalar(*v),
            KernelArg::Offset(v) => Self::Offset(*v),
            KernelArg::Count(v) => Self::Count(*v),
            KernelArg::Rows(s) => Self::Rows(s.as_cuda()?.0.read_recursive()),
            KernelArg::Columns(s) => Self::Columns(s.as_cuda()?.0.read_recursive()),
            KernelArg::Shifts(s) => Self::Shifts(s.as_cuda()?.0.read_recursive()),
        })
    }
}

impl CudaDevice {
    /// Describe every visible CUDA device, numbering them from `first_ordinal`.
    pub(crate) fn enumerate(first_ordinal: usize) -> Result<Vec<DeviceInfo>> {
        let count = CudaContext::device_count().w()?;
        (0..count.max(0) as usize)
            .map(|i| {
                let context = CudaContext::new(i).w()?;
                let compute_units = context
                    .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)
                    .w()?;
                Ok(DeviceInfo {
                    ordinal: first_ordinal + i,
                    name: context.name().w()?,
                    vendor: "NVIDIA".to_string(),
                    backend: Backend::Cuda,
                    double_precision: true,
                    compute_units: compute_units.max(0) as usize,
                })
            })
            .collect()
    }

    /// Open CUDA device `cuda_ordinal`, described by `info`.
    pub(crate) fn new(info: DeviceInfo, cuda_ordinal: usize) -> Result<Self> {
        let context = CudaContext::new(cuda_ordinal).w()?;
        let stream = context.new_stream().w()?;
        log::debug!("opened {info}");
        Ok(Self {
            info,
            context,
            stream,
        })
    }

    fn compile_ptx(&self, name: &str, source: &str) -> Result<Ptx> {
        cudarc::nvrtc::compile_ptx_with_opts(
            source,
            // Compile PTX without hardcoding an architecture so it can JIT to the current device
            CompileOptions {
                include_paths: cuda_include_dir()
                    .map(|dir| dir.join("include").display().to_string())
                    .into_iter()
                    .collect(),
                ..Default::default()
            },
        )
        .map_err(|err| Error::Compile {
            name: name.to_string(),
            device: self.info.to_string(),
            log: build_log(&err),
        })
    }

    /// Build `source` and load its entry point `name`.
    pub(crate) fn compile(&self, name: &str, source: &str) -> Result<Program> {
        let ptx = self.compile_ptx(name, source)?;
        let module = self
            .context
            .load_module(ptx)
            .map_err(|cuda| CudaError::Load {
                cuda,
                module_name: name.to_string(),
            })?;
        let func = module.load_function(name).w()?;
        Ok(Program::Cuda(func))
    }

    pub(crate) fn compile_kernel<T: DType>(
        &self,
        ir: &KernelIr<T>,
        name: &str,
        source: &str,
    ) -> Result<Program> {
        if let Some(func) = ir.functions.iter().find(|f| f.inner.device.is_none()) {
            return Err(Error::Compile {
                name: name.to_string(),
                device: self.info.to_string(),
                log: format!("function `{}` has no device implementation", func.name()),
            });
        }
        self.compile(name, source)
    }

    fn grid(threads: usize) -> LaunchConfig {
        LaunchConfig {
            grid_dim: (threads.div_ceil(BLOCK).clamp(1, MAX_GRID) as u32, 1, 1),
            block_dim: (BLOCK as u32, 1, 1),
            shared_mem_bytes: 0,
        }
    }

    pub(crate) fn launch<T: DType>(&self, program: &Program, launch: Launch<T>) -> Result<()> {
        let Program::Cuda(func) = program else {
            crate::bail!("a host program cannot run on {}", self.info);
        };
        let n = launch.len as u64;
        let base = launch.base;
        let held = launch
            .args
            .iter()
            .map(Held::hold)
            .collect::<Result<Vec<_>>>()?;

        let (target, identity, cfg) = match &launch.target {
            LaunchTarget::Assign(out) => (out.as_cuda()?.0.read_recursive(), None, Self::grid(launch.len)),
            LaunchTarget::Reduce(partials) => {
                let crate::kernel::KernelKind::Reduce(op) = launch.kind else {
                    crate::bail!("reduction target on an assignment kernel");
                };
                let blocks = self.partial_count(launch.len);
                (
                    partials.as_cuda()?.0.read_recursive(),
                    Some(op.identity::<T>()),
                    LaunchConfig {
                        grid_dim: (blocks as u32, 1, 1),
                        block_dim: (REDUCE_BLOCK as u32, 1, 1),
                        shared_mem_bytes: 0,
                    },
                )
            }
        };

        let mut builder = self.stream.launch_builder(func);
        builder.arg(&n);
        builder.arg(&base);
        builder.arg(&*target);
        if let Some(identity) = &identity {
            builder.arg(identity);
        }
        for arg in &held {
            match arg {
                Held::Values(s) => builder.arg(&**s),
                Held::Scalar(v) => builder.arg(v),
                Held::Offset(v) => builder.arg(v),
                Held::Count(v) => builder.arg(v),
                Held::Rows(s) => builder.arg(&**s),
                Held::Columns(s) => builder.arg(&**s),
                Held::Shifts(s) => builder.arg(&**s),
            };
        }
        unsafe { builder.launch(cfg).w()? };
        Ok(())
    }

    /// Bitonic sort of the first `len` keys, moving `vals` along.
    pub(crate) fn sort_local<K: DType, V: DType>(
        &self,
        program: &Program,
        keys: &CudaStorage<K>,
        vals: Option<&CudaStorage<V>>,
        len: usize,
    ) -> Result<()> {
        let Program::Cuda(func) = program else {
            crate::bail!("a host program cannot run on {}", self.info);
        };
        if len < 2 {
            return Ok(());
        }
        let keys = keys.0.read_recursive();
        let vals = vals.map(|v| v.0.read_recursive());
        let n = len as u64;
        let padded = len.next_power_of_two();
        let cfg = LaunchConfig {
            grid_dim: ((padded / 2).div_ceil(BLOCK) as u32, 1, 1),
            block_dim: (BLOCK as u32, 1, 1),
            shared_mem_bytes: 0,
        };

        let mut stages = Vec::new();
        let mut k = 2;
        while k <= padded {
            stages.push(((k / 2) as u64, 1u32));
            let mut j = k / 4;
            while j >= 1 {
                stages.push((j as u64, 0u32));
                j /= 2;
            }
            k *= 2;
        }
        for (half, flip) in stages {
            let mut builder = self.stream.launch_builder(func);
            builder.arg(&*keys);
            if let Some(vals) = &vals {
                builder.arg(&**vals);
            }
            builder.arg(&n);
            builder.arg(&half);
            builder.arg(&flip);
            unsafe { builder.launch(cfg).w()? };
        }
        Ok(())
    }
}

impl BackendDevice for CudaDevice {
    type Storage<X: DType> = CudaStorage<X>;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn alloc_zeros<T: DType>(&self, len: usize) -> Result<CudaStorage<T>> {
        let slice = self
            .stream
            .alloc_zeros::<T>(len.max(1))
            .map_err(|_| Error::Allocation {
                device: self.info.to_string(),
                bytes: len.max(1).saturating_mul(size_of::<T>()),
            })?;
        Ok(CudaStorage::new(slice))
    }

    fn upload<T: DType>(&self, data: &[T]) -> Result<CudaStorage<T>> {
        if data.is_empty() {
            return self.alloc_zeros(0);
        }
        let slice = self.stream.memcpy_stod(data).w()?;
        Ok(CudaStorage::new(slice))
    }

    fn download<T: DType>(&self, storage: &CudaStorage<T>, range: Range<usize>) -> Result<Vec<T>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let slice = storage.0.read_recursive();
        if range.end > slice.len() {
            crate::bail!("range {range:?} outside a buffer of {}", slice.len());
        }
        let data = self.stream.memcpy_dtov(&slice.slice(range)).w()?;
        Ok(data)
    }

    fn write<T: DType>(&self, storage: &CudaStorage<T>, offset: usize, data: &[T]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut slice = storage.0.write();
        if offset + data.len() > slice.len() {
            crate::bail!(
                "write of {} at {offset} outside a buffer of {}",
                data.len(),
                slice.len()
            );
        }
        let mut view = slice.slice_mut(offset..offset + data.len());
        self.stream.memcpy_htod(data, &mut view).w()?;
        Ok(())
    }

    fn duplicate<T: DType>(&self, storage: &CudaStorage<T>, len: usize) -> Result<CudaStorage<T>> {
        let copy = self.alloc_zeros::<T>(len)?;
        if len > 0 {
            let src = storage.0.read_recursive();
            let mut dst = copy.0.write();
            self.stream.memcpy_dtod(&src.slice(0..len), &mut *dst).w()?;
        }
        Ok(copy)
    }

    fn partial_count(&self, len: usize) -> usize {
        len.div_ceil(REDUCE_BLOCK).clamp(1, MAX_REDUCE_BLOCKS)
    }

    fn finish(&self) -> Result<()> {
        self.stream.synchronize().w()
    }
}
