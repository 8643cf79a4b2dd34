use std::{fmt, path::PathBuf, sync::Arc};

#[cfg(feature = "cuda")]
use crate::cuda_backend::CudaDevice;
use crate::{
    config::EngineConfig,
    cpu_storage::CpuDevice,
    device::{Backend, Device, DeviceId, DeviceInfo, Filter},
    kernel::{
        cache::KernelCache,
        codegen,
        Launch, LaunchTarget, PartitionKernel,
    },
    partition::Partition,
    sort::Comparator,
    storage::Storage,
    DType, Error, Result,
};

struct QueueInner {
    id: DeviceId,
    device: Device,
    cache: Arc<KernelCache>,
}

/// An in-order command queue on one device.
///
/// Cloning is cheap and yields a handle to the same queue.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.inner.id)
            .field("device", &self.info().to_string())
            .finish()
    }
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Queue {}

impl Queue {
    pub fn id(&self) -> DeviceId {
        self.inner.id
    }

    pub fn info(&self) -> &DeviceInfo {
        self.inner.device.info()
    }

    pub(crate) fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn kernel_cache(&self) -> &KernelCache {
        &self.inner.cache
    }

    /// Block until all work submitted to this queue has completed.
    pub fn finish(&self) -> Result<()> {
        self.inner.device.finish()
    }

    /// Compile (or fetch) the kernel of one partition and enqueue it.
    pub(crate) fn run<T: DType>(
        &self,
        kernel: PartitionKernel<T>,
        target: LaunchTarget<T>,
        part: Partition,
    ) -> Result<()> {
        let PartitionKernel { ir, args } = kernel;
        let (name, source) = codegen::render(&ir);
        let program = self.inner.cache.get_or_compile(self.id(), &name, &source, || {
            self.inner.device.compile(&ir, &name, &source)
        })?;
        self.inner.device.launch(
            &program,
            Launch {
                kind: ir.kind,
                target,
                len: part.len(),
                base: part.start as u64,
                args,
                functions: ir.functions,
            },
        )
    }

    /// Sort one buffer of keys, and values alongside, in place on this queue.
    pub(crate) fn sort_local<K: DType, V: DType>(
        &self,
        keys: &Storage<K>,
        vals: Option<&Storage<V>>,
        len: usize,
        cmp: &Comparator<K>,
    ) -> Result<()> {
        match &self.inner.device {
            Device::Cpu(cpu) => {
                let Some(less) = cmp.host.clone() else {
                    return Err(Error::Compile {
                        name: cmp.name().to_string(),
                        device: self.info().to_string(),
                        log: format!("comparator `{}` has no host implementation", cmp.name()),
                    });
                };
                let vals = vals.map(Storage::as_cpu).transpose()?;
                cpu.sort_local(keys.as_cpu()?, vals, len, less)
            }
            #[cfg(feature = "cuda")]
            Device::Cuda(cuda) => {
                let Some(body) = cmp.device.as_deref() else {
                    return Err(Error::Compile {
                        name: cmp.name().to_string(),
                        device: self.info().to_string(),
                        log: format!("comparator `{}` has no device implementation", cmp.name()),
                    });
                };
                let (name, source) = codegen::render_sort::<K, V>(body, vals.is_some());
                let program = self.inner.cache.get_or_compile(self.id(), &name, &source, || {
                    cuda.compile(&name, &source)
                })?;
                let vals = vals.map(Storage::as_cuda).transpose()?;
                cuda.sort_local(&program, keys.as_cuda()?, vals, len)
            }
        }
    }
}

/// Anything that names a list of queues: a [`Context`], one [`Queue`], or a slice of them.
pub trait AsQueues {
    fn as_queues(&self) -> &[Queue];
}

impl AsQueues for Queue {
    fn as_queues(&self) -> &[Queue] {
        std::slice::from_ref(self)
    }
}

impl AsQueues for [Queue] {
    fn as_queues(&self) -> &[Queue] {
        self
    }
}

impl AsQueues for Vec<Queue> {
    fn as_queues(&self) -> &[Queue] {
        self
    }
}

impl AsQueues for Context {
    fn as_queues(&self) -> &[Queue] {
        &self.queues
    }
}

/// The set of devices a computation runs on, with one queue per device.
///
/// ```
/// use polyvec_core::{Backend, Context, Filter};
///
/// let ctx = Context::builder()
///     .filter(Filter::backend(Backend::Cpu))
///     .host_devices(2)
///     .build()
///     .unwrap();
/// assert_eq!(ctx.size(), 2);
/// ```
pub struct Context {
    queues: Vec<Queue>,
    cache: Arc<KernelCache>,
    config: EngineConfig,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("queues", &self.queues)
            .field("config", &self.config)
            .finish()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, queue) in self.queues.iter().enumerate() {
            writeln!(f, "{}. {}", i + 1, queue.info())?;
        }
        Ok(())
    }
}

impl Context {
    /// Open every device matching `filter`, configured from the environment.
    pub fn new(filter: Filter) -> Result<Self> {
        Self::builder().filter(filter).build()
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Number of queues.
    pub fn size(&self) -> usize {
        self.queues.len()
    }

    pub fn queue(&self, i: usize) -> Option<&Queue> {
        self.queues.get(i)
    }

    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn kernel_cache(&self) -> &KernelCache {
        &self.cache
    }

    /// Wait for every queue. Returns the first deferred failure, after all queues drained.
    pub fn finish(&self) -> Result<()> {
        let mut first = None;
        for queue in &self.queues {
            if let Err(err) = queue.finish() {
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.cache.clear();
    }
}

/// Explicit configuration of a [`Context`].
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    filter: Filter,
    config: EngineConfig,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            filter: Filter::env(),
            config: EngineConfig::from_env(),
        }
    }
}

impl ContextBuilder {
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn host_devices(mut self, n: usize) -> Self {
        self.config.host_devices = n;
        self
    }

    pub fn host_threads(mut self, n: usize) -> Self {
        self.config.host_threads = Some(n);
        self
    }

    pub fn dump_kernels(mut self, dir: Option<PathBuf>) -> Self {
        self.config.dump_kernels = true;
        self.config.kernel_dir = dir;
        self
    }

    pub fn build(self) -> Result<Context> {
        let Self { filter, config } = self;
        let selected = filter.select(enumerate(&config));
        if selected.is_empty() {
            return Err(Error::NoDevice);
        }
        let cache = Arc::new(KernelCache::new(config.kernel_dump_dir()));
        let queues = selected
            .into_iter()
            .map(|info| {
                Ok(Queue {
                    inner: Arc::new(QueueInner {
                        id: DeviceId::new(),
                        device: open(info, &config)?,
                        cache: cache.clone(),
                    }),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let ctx = Context {
            queues,
            cache,
            config,
        };
        log::info!("opened {} device(s):\n{ctx}", ctx.size());
        Ok(ctx)
    }
}

/// Every device this build can drive: the host devices first, then CUDA devices.
fn enumerate(config: &EngineConfig) -> Vec<DeviceInfo> {
    let threads = config.threads_per_host_device();
    #[allow(unused_mut)]
    let mut infos: Vec<DeviceInfo> = (0..config.host_devices)
        .map(|i| DeviceInfo {
            ordinal: i,
            name: format!("Host CPU {i}"),
            vendor: "host".to_string(),
            backend: Backend::Cpu,
            double_precision: true,
            compute_units: threads,
        })
        .collect();
    #[cfg(feature = "cuda")]
    {
        let first = infos.len();
        match CudaDevice::enumerate(first) {
            Ok(cuda) => infos.extend(cuda),
            Err(err) => log::warn!("skipping CUDA devices: {err}"),
        }
    }
    infos
}

fn open(info: DeviceInfo, config: &EngineConfig) -> Result<Device> {
    match info.backend {
        Backend::Cpu => Ok(Device::Cpu(CpuDevice::new(
            info,
            config.threads_per_host_device(),
        )?)),
        #[cfg(feature = "cuda")]
        Backend::Cuda => {
            let cuda_ordinal = info.ordinal - config.host_devices;
            Ok(Device::Cuda(CudaDevice::new(info, cuda_ordinal)?))
        }
        #[cfg(not(feature = "cuda"))]
        Backend::Cuda => crate::bail!("{info} needs the `cuda` feature"),
    }
}
