use std::{
    any::Any,
    cmp::Ordering,
    ops::Range,
    panic::{self, AssertUnwindSafe},
    sync::{mpsc, Arc},
    thread::{self, JoinHandle},
};

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;

use crate::{
    device::DeviceInfo,
    kernel::{AssignOp, KernelIr, KernelKind, Launch, LaunchTarget},
    storage::{BackendDevice, Program},
    DType, Error, ErrorContext, Result,
};
use kernel::{HostArg, HostKernel};

pub(crate) mod kernel;
mod pool;

/// A host buffer. Cloning clones the handle.
pub(crate) struct CpuStorage<T: DType>(pub(crate) Arc<RwLock<Vec<T>>>);

impl<T: DType> Clone for CpuStorage<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: DType> CpuStorage<T> {
    fn new(data: Vec<T>) -> Self {
        Self(Arc::new(RwLock::new(data)))
    }
}

type Job = Box<dyn FnOnce() -> Result<()> + Send>;

enum Command {
    Run(Job),
    Sync(mpsc::Sender<()>),
}

/// A host compute device: one worker thread draining a job queue, with its own rayon
/// pool for the data-parallel part of each job.
///
/// Jobs run in submission order. A failing job does not stop the queue; the first
/// failure is kept and returned by the next [`CpuDevice::finish`].
pub struct CpuDevice {
    info: DeviceInfo,
    sender: Mutex<Option<mpsc::Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    failure: Arc<Mutex<Option<Error>>>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}

impl CpuDevice {
    pub(crate) fn new(info: DeviceInfo, threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name({
                let ordinal = info.ordinal;
                move |i| format!("polyvec-host{ordinal}-{i}")
            })
            .build()
            .map_err(Error::wrap)?;
        let (sender, receiver) = mpsc::channel::<Command>();
        let failure = Arc::new(Mutex::new(None));

        let worker = {
            let failure = failure.clone();
            let device = info.to_string();
            thread::Builder::new()
                .name(format!("polyvec-host{}", info.ordinal))
                .spawn(move || {
                    for command in receiver {
                        match command {
                            Command::Run(job) => {
                                let outcome =
                                    pool.install(|| panic::catch_unwind(AssertUnwindSafe(job)));
                                let err = match outcome {
                                    Ok(Ok(())) => continue,
                                    Ok(Err(err)) => err,
                                    Err(payload) => Error::Device {
                                        device: device.clone(),
                                        message: panic_message(payload.as_ref()),
                                    },
                                };
                                log::error!("job on {device} failed: {err}");
                                failure.lock().get_or_insert(err);
                            }
                            Command::Sync(done) => {
                                let _ = done.send(());
                            }
                        }
                    }
                })
                .with_context(|| format!("spawning the worker of {}", info))?
        };
        log::debug!("started {info} with {threads} threads");

        Ok(Self {
            info,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            failure,
        })
    }

    fn worker_gone(&self) -> Error {
        Error::Device {
            device: self.info.to_string(),
            message: "worker thread has exited".to_string(),
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => sender.send(command).map_err(|_| self.worker_gone()),
            None => Err(self.worker_gone()),
        }
    }

    fn enqueue(&self, job: impl FnOnce() -> Result<()> + Send + 'static) -> Result<()> {
        self.send(Command::Run(Box::new(job)))
    }

    fn allocation(&self, len: usize, size: usize) -> Error {
        Error::Allocation {
            device: self.info.to_string(),
            bytes: len.saturating_mul(size),
        }
    }

    pub(crate) fn compile<T: DType>(
        &self,
        ir: &KernelIr<T>,
        name: &str,
        source: &str,
    ) -> Result<Program> {
        let kernel = HostKernel::compile(ir, name, &self.info.to_string())?;
        log::trace!("{} runs kernel {name} on the host:\n{source}", self.info);
        Ok(Program::Host(Arc::new(kernel)))
    }

    pub(crate) fn launch<T: DType>(&self, program: &Program, launch: Launch<T>) -> Result<()> {
        let kernel = match program {
            Program::Host(kernel) => kernel.clone(),
            #[cfg(feature = "cuda")]
            Program::Cuda(_) => crate::bail!("a CUDA program cannot run on {}", self.info),
        };
        let funcs = launch
            .functions
            .iter()
            .map(|f| {
                f.inner.host.clone().ok_or_else(|| Error::Compile {
                    name: f.name().to_string(),
                    device: self.info.to_string(),
                    log: format!("function `{}` has no host implementation", f.name()),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let Launch {
            kind,
            target,
            len,
            base,
            args,
            ..
        } = launch;
        log::trace!("queued {} over {len} elements on {}", kernel.name(), self.info);

        self.enqueue(move || {
            let held = args.iter().map(HostArg::hold).collect::<Result<Vec<_>>>()?;
            match (kind, target) {
                (KernelKind::Assign(op), LaunchTarget::Assign(out)) => {
                    let values = kernel.evaluate(&held, &funcs, base, len)?;
                    drop(held);
                    let out = out.as_cpu()?;
                    let mut out = out.0.write();
                    apply(op, &mut out[..len], &values);
                }
                (KernelKind::Reduce(op), LaunchTarget::Reduce(partials)) => {
                    let value = kernel.reduce(&held, &funcs, base, len, op)?;
                    drop(held);
                    partials.as_cpu()?.0.write()[0] = value;
                }
                (kind, _) => crate::bail!("launch target does not fit a {kind:?} kernel"),
            }
            Ok(())
        })
    }

    /// Sort the first `len` of `keys`, and `vals` along with them, by the strict weak order
    /// `less`.
    pub(crate) fn sort_local<K: DType, V: DType>(
        &self,
        keys: &CpuStorage<K>,
        vals: Option<&CpuStorage<V>>,
        len: usize,
        less: Arc<dyn Fn(K, K) -> bool + Send + Sync>,
    ) -> Result<()> {
        let keys = keys.clone();
        let vals = vals.cloned();
        self.enqueue(move || {
            let mut keys = keys.0.write();
            if keys.len() < len {
                crate::bail!("cannot sort {len} keys in a buffer of {}", keys.len());
            }
            let mut perm: Vec<usize> = (0..len).collect();
            perm.par_sort_by(|&a, &b| ordering(&*less, keys[a], keys[b]));
            let sorted: Vec<K> = perm.iter().map(|&i| keys[i]).collect();
            keys[..len].copy_from_slice(&sorted);
            if let Some(vals) = vals {
                let mut vals = vals.0.write();
                if vals.len() < len {
                    crate::bail!("cannot move {len} values in a buffer of {}", vals.len());
                }
                let sorted: Vec<V> = perm.iter().map(|&i| vals[i]).collect();
                vals[..len].copy_from_slice(&sorted);
            }
            Ok(())
        })
    }
}

/// Total order derived from a strict weak order.
pub(crate) fn ordering<K: Copy>(less: &dyn Fn(K, K) -> bool, a: K, b: K) -> Ordering {
    if less(a, b) {
        Ordering::Less
    } else if less(b, a) {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

fn apply<T: DType>(op: AssignOp, out: &mut [T], values: &[T]) {
    match op.as_binary() {
        None => out.copy_from_slice(values),
        Some(bin) => out
            .par_iter_mut()
            .zip(values.par_iter())
            .for_each(|(o, v)| *o = T::binary(bin, *o, *v)),
    }
}

impl BackendDevice for CpuDevice {
    type Storage<X: DType> = CpuStorage<X>;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn alloc_zeros<T: DType>(&self, len: usize) -> Result<CpuStorage<T>> {
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| self.allocation(len, size_of::<T>()))?;
        data.resize(len, T::ZERO);
        Ok(CpuStorage::new(data))
    }

    fn upload<T: DType>(&self, src: &[T]) -> Result<CpuStorage<T>> {
        let mut data = Vec::new();
        data.try_reserve_exact(src.len())
            .map_err(|_| self.allocation(src.len(), size_of::<T>()))?;
        data.extend_from_slice(src);
        Ok(CpuStorage::new(data))
    }

    fn download<T: DType>(&self, storage: &CpuStorage<T>, range: Range<usize>) -> Result<Vec<T>> {
        self.finish()?;
        let data = storage.0.read();
        match data.get(range.clone()) {
            Some(slice) => Ok(slice.to_vec()),
            None => crate::bail!("range {range:?} outside a buffer of {}", data.len()),
        }
    }

    fn write<T: DType>(&self, storage: &CpuStorage<T>, offset: usize, src: &[T]) -> Result<()> {
        self.finish()?;
        let mut data = storage.0.write();
        match data.get_mut(offset..offset + src.len()) {
            Some(dst) => {
                dst.copy_from_slice(src);
                Ok(())
            }
            None => crate::bail!(
                "write of {} at {offset} outside a buffer of {}",
                src.len(),
                data.len()
            ),
        }
    }

    fn duplicate<T: DType>(&self, storage: &CpuStorage<T>, len: usize) -> Result<CpuStorage<T>> {
        let data = self.download(storage, 0..len)?;
        Ok(CpuStorage::new(data))
    }

    fn partial_count(&self, _len: usize) -> usize {
        1
    }

    fn finish(&self) -> Result<()> {
        let (done, wait) = mpsc::channel();
        self.send(Command::Sync(done))?;
        wait.recv().map_err(|_| self.worker_gone())?;
        match self.failure.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for CpuDevice {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop once the queue is drained.
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::error!("worker of {} panicked", self.info);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Backend;

    fn device() -> CpuDevice {
        let info = DeviceInfo {
            ordinal: 0,
            name: "Host CPU 0".to_string(),
            vendor: "host".to_string(),
            backend: Backend::Cpu,
            double_precision: true,
            compute_units: 2,
        };
        CpuDevice::new(info, 2).unwrap()
    }

    #[test]
    fn transfers_round_trip() {
        let dev = device();
        let buf = dev.upload(&[1u32, 2, 3, 4]).unwrap();
        dev.write(&buf, 1, &[7, 8]).unwrap();
        assert_eq!(dev.download(&buf, 0..4).unwrap(), vec![1, 7, 8, 4]);
        assert!(dev.download(&buf, 2..6).is_err());
        let copy = dev.duplicate(&buf, 2).unwrap();
        assert_eq!(copy.0.read().as_slice(), &[1, 7]);
    }

    #[test]
    fn failures_surface_at_finish() {
        let dev = device();
        dev.enqueue(|| crate::bail!("first")).unwrap();
        dev.enqueue(|| panic!("second")).unwrap();
        let err = dev.finish().unwrap_err();
        assert!(err.to_string().contains("first"));
        // Only the first failure is kept.
        assert!(dev.finish().is_ok());
    }

    #[test]
    fn local_sort_moves_values() {
        let dev = device();
        let keys = dev.upload(&[3i32, 1, 2, 1]).unwrap();
        let vals = dev.upload(&[30.0f32, 10.0, 20.0, 11.0]).unwrap();
        dev.sort_local(&keys, Some(&vals), 4, Arc::new(|a: i32, b: i32| a < b))
            .unwrap();
        assert_eq!(dev.download(&keys, 0..4).unwrap(), vec![1, 1, 2, 3]);
        assert_eq!(
            dev.download(&vals, 0..4).unwrap(),
            vec![10.0, 11.0, 20.0, 30.0]
        );
    }

    #[test]
    fn local_sort_stops_at_the_length() {
        let dev = device();
        let keys = dev.upload(&[5u32, 4, 3, 2, 1]).unwrap();
        dev.sort_local::<u32, u32>(&keys, None, 3, Arc::new(|a: u32, b: u32| a < b))
            .unwrap();
        assert_eq!(dev.download(&keys, 0..5).unwrap(), vec![3, 4, 5, 2, 1]);

        dev.sort_local::<u32, u32>(&keys, None, 6, Arc::new(|a: u32, b: u32| a < b))
            .unwrap();
        assert!(dev.finish().is_err());
    }
}
