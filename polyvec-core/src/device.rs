use std::{
    fmt::{self, Display},
    ops::{BitAnd, BitOr, Not, Range},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

#[cfg(feature = "cuda")]
use crate::cuda_backend::CudaDevice;
use crate::{
    config::parse_var,
    cpu_storage::CpuDevice,
    kernel::{KernelIr, Launch},
    storage::{BackendDevice, Program, Storage},
    DType, Result,
};

pub const ENV_DEVICE: &str = "POLYVEC_DEVICE";
pub const ENV_VENDOR: &str = "POLYVEC_VENDOR";
pub const ENV_BACKEND: &str = "POLYVEC_BACKEND";
pub const ENV_POSITION: &str = "POLYVEC_POSITION";
pub const ENV_MAX_DEVICES: &str = "POLYVEC_MAX_DEVICES";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Cpu,
    Cuda,
}

impl Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
        }
    }
}

/// Identity of an opened device. Keys the kernel cache and tells queues apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u64);

impl DeviceId {
    pub(crate) fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Capabilities a [`Filter`] can select on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Position in the enumeration order, across all backends.
    pub ordinal: usize,
    pub name: String,
    pub vendor: String,
    pub backend: Backend,
    pub double_precision: bool,
    pub compute_units: usize,
}

impl Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, #{})", self.name, self.backend, self.ordinal)
    }
}

type Predicate = Arc<dyn Fn(&DeviceInfo) -> bool + Send + Sync>;

/// A predicate over [`DeviceInfo`], combinable with `&`, `|` and `!`.
#[derive(Clone)]
pub struct Filter {
    pred: Predicate,
    limit: Option<usize>,
}

impl Filter {
    pub fn new(pred: impl Fn(&DeviceInfo) -> bool + Send + Sync + 'static) -> Self {
        Self {
            pred: Arc::new(pred),
            limit: None,
        }
    }

    pub fn all() -> Self {
        Self::new(|_| true)
    }

    /// Devices with `f64` support.
    pub fn double_precision() -> Self {
        Self::new(|info| info.double_precision)
    }

    pub fn backend(backend: Backend) -> Self {
        Self::new(move |info| info.backend == backend)
    }

    /// Case-insensitive substring match on the vendor.
    pub fn vendor(vendor: impl Into<String>) -> Self {
        let vendor = vendor.into().to_lowercase();
        Self::new(move |info| info.vendor.to_lowercase().contains(&vendor))
    }

    /// Case-insensitive substring match on the device name.
    pub fn name(name: impl Into<String>) -> Self {
        let name = name.into().to_lowercase();
        Self::new(move |info| info.name.to_lowercase().contains(&name))
    }

    pub fn position(ordinal: usize) -> Self {
        Self::new(move |info| info.ordinal == ordinal)
    }

    /// At most `n` devices, in enumeration order.
    pub fn count(n: usize) -> Self {
        Self {
            pred: Arc::new(|_| true),
            limit: Some(n),
        }
    }

    /// The selection described by the `POLYVEC_*` environment variables.
    ///
    /// Unset variables select everything.
    pub fn env() -> Self {
        let mut filter = Self::all();
        if let Ok(name) = std::env::var(ENV_DEVICE) {
            filter = filter & Self::name(name);
        }
        if let Ok(vendor) = std::env::var(ENV_VENDOR) {
            filter = filter & Self::vendor(vendor);
        }
        if let Ok(backend) = std::env::var(ENV_BACKEND) {
            match backend.to_lowercase().as_str() {
                "cpu" | "host" => filter = filter & Self::backend(Backend::Cpu),
                "cuda" | "gpu" => filter = filter & Self::backend(Backend::Cuda),
                other => log::warn!("ignoring {ENV_BACKEND}={other:?}: unknown backend"),
            }
        }
        if let Some(ordinal) = parse_var::<usize>(ENV_POSITION) {
            filter = filter & Self::position(ordinal);
        }
        if let Some(n) = parse_var::<usize>(ENV_MAX_DEVICES) {
            filter = filter & Self::count(n);
        }
        filter
    }

    pub fn matches(&self, info: &DeviceInfo) -> bool {
        (self.pred)(info)
    }

    pub(crate) fn select(&self, infos: impl IntoIterator<Item = DeviceInfo>) -> Vec<DeviceInfo> {
        infos
            .into_iter()
            .filter(|info| self.matches(info))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter").field("limit", &self.limit).finish()
    }
}

impl BitAnd for Filter {
    type Output = Filter;

    fn bitand(self, rhs: Filter) -> Filter {
        let (l, r) = (self.pred, rhs.pred);
        Filter {
            pred: Arc::new(move |info| l(info) && r(info)),
            limit: match (self.limit, rhs.limit) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
        }
    }
}

impl BitOr for Filter {
    type Output = Filter;

    fn bitor(self, rhs: Filter) -> Filter {
        let (l, r) = (self.pred, rhs.pred);
        Filter {
            pred: Arc::new(move |info| l(info) || r(info)),
            limit: match (self.limit, rhs.limit) {
                (Some(a), Some(b)) => Some(a.max(b)),
                _ => None,
            },
        }
    }
}

impl Not for Filter {
    type Output = Filter;

    fn not(self) -> Filter {
        let pred = self.pred;
        Filter::new(move |info| !pred(info))
    }
}

/// A concrete, opened device.
pub(crate) enum Device {
    #[cfg(feature = "cuda")]
    Cuda(CudaDevice),
    Cpu(CpuDevice),
}

impl Device {
    pub(crate) fn info(&self) -> &DeviceInfo {
        match self {
            #[cfg(feature = "cuda")]
            Self::Cuda(cuda) => cuda.info(),
            Self::Cpu(cpu) => cpu.info(),
        }
    }

    pub(crate) fn alloc_zeros<T: DType>(&self, len: usize) -> Result<Storage<T>> {
        match self {
            #[cfg(feature = "cuda")]
            Self::Cuda(cuda) => Ok(Storage::Cuda(cuda.alloc_zeros(len)?)),
            Self::Cpu(cpu) => Ok(Storage::Cpu(cpu.alloc_zeros(len)?)),
        }
    }

    pub(crate) fn upload<T: DType>(&self, data: &[T]) -> Result<Storage<T>> {
        match self {
            #[cfg(feature = "cuda")]
            Self::Cuda(cuda) => Ok(Storage::Cuda(cuda.upload(data)?)),
            Self::Cpu(cpu) => Ok(Storage::Cpu(cpu.upload(data)?)),
        }
    }

    pub(crate) fn download<T: DType>(
        &self,
        storage: &Storage<T>,
        range: Range<usize>,
    ) -> Result<Vec<T>> {
        match self {
            #[cfg(feature = "cuda")]
            Self::Cuda(cuda) => cuda.download(storage.as_cuda()?, range),
            Self::Cpu(cpu) => cpu.download(storage.as_cpu()?, range),
        }
    }

    pub(crate) fn write<T: DType>(
        &self,
        storage: &Storage<T>,
        offset: usize,
        data: &[T],
    ) -> Result<()> {
        match self {
            #[cfg(feature = "cuda")]
            Self::Cuda(cuda) => cuda.write(storage.as_cuda()?, offset, data),
            Self::Cpu(cpu) => cpu.write(storage.as_cpu()?, offset, data),
        }
    }

    pub(crate) fn duplicate<T: DType>(&self, storage: &Storage<T>, len: usize) -> Result<Storage<T>> {
        match self {
            #[cfg(feature = "cuda")]
            Self::Cuda(cuda) => Ok(Storage::Cuda(cuda.duplicate(storage.as_cuda()?, len)?)),
            Self::Cpu(cpu) => Ok(Storage::Cpu(cpu.duplicate(storage.as_cpu()?, len)?)),
        }
    }

    pub(crate) fn partial_count(&self, len: usize) -> usize {
        match self {
            #[cfg(feature = "cuda")]
            Self::Cuda(cuda) => cuda.partial_count(len),
            Self::Cpu(cpu) => cpu.partial_count(len),
        }
    }

    pub(crate) fn finish(&self) -> Result<()> {
        match self {
            #[cfg(feature = "cuda")]
            Self::Cuda(cuda) => cuda.finish(),
            Self::Cpu(cpu) => cpu.finish(),
        }
    }

    pub(crate) fn compile<T: DType>(
        &self,
        ir: &KernelIr<T>,
        name: &str,
        source: &str,
    ) -> Result<Program> {
        match self {
            #[cfg(feature = "cuda")]
            Self::Cuda(cuda) => cuda.compile_kernel(ir, name, source),
            Self::Cpu(cpu) => cpu.compile(ir, name, source),
        }
    }

    pub(crate) fn launch<T: DType>(&self, program: &Program, launch: Launch<T>) -> Result<()> {
        match self {
            #[cfg(feature = "cuda")]
            Self::Cuda(cuda) => cuda.launch(program, launch),
            Self::Cpu(cpu) => cpu.launch(program, launch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(ordinal: usize, backend: Backend, double_precision: bool) -> DeviceInfo {
        DeviceInfo {
            ordinal,
            name: format!("Device {ordinal}"),
            vendor: "Acme".to_string(),
            backend,
            double_precision,
            compute_units: 4,
        }
    }

    #[test]
    fn combinators() {
        let infos = vec![
            info(0, Backend::Cpu, true),
            info(1, Backend::Cuda, false),
            info(2, Backend::Cuda, true),
        ];
        let dp = Filter::double_precision() & Filter::backend(Backend::Cuda);
        assert_eq!(dp.select(infos.clone()), vec![infos[2].clone()]);

        let either = Filter::position(0) | Filter::position(1);
        assert_eq!(either.select(infos.clone()).len(), 2);

        let not_cpu = !Filter::backend(Backend::Cpu);
        assert_eq!(not_cpu.select(infos.clone()).len(), 2);

        let limited = Filter::vendor("acme") & Filter::count(2);
        assert_eq!(limited.select(infos.clone()), infos[..2].to_vec());

        assert!(Filter::name("nothing like it").select(infos).is_empty());
    }
}
