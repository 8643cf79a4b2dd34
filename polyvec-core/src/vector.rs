use std::{
    fmt,
    ops::Range,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    context::{AsQueues, Queue},
    expr::{Expr, Tag},
    kernel::{self, AssignOp},
    partition::{partition, Partition},
    storage::Storage,
    DType, Error, Result,
};

/// How a length is split over a list of queues.
#[derive(Debug)]
pub(crate) struct Layout {
    pub(crate) len: usize,
    pub(crate) queues: Vec<Queue>,
    pub(crate) partitions: Vec<Partition>,
}

impl Layout {
    pub(crate) fn new(queues: &[Queue], len: usize) -> Result<Arc<Self>> {
        if queues.is_empty() {
            return Err(Error::NoDevice);
        }
        Ok(Arc::new(Self {
            len,
            queues: queues.to_vec(),
            partitions: partition(len, queues.len()),
        }))
    }

    /// Operands are compatible when they have the same length on the same queues.
    pub(crate) fn check(&self, other: &Layout) -> Result<()> {
        if self.len != other.len {
            return Err(Error::size_mismatch(format!(
                "operand of length {} used with vectors of length {}",
                other.len, self.len
            )));
        }
        if self.queues != other.queues {
            return Err(Error::size_mismatch(
                "operands are distributed over different queues",
            ));
        }
        Ok(())
    }
}

/// The buffers of a vector, shared with expression trees that read it.
///
/// Opaque outside the crate: an [`Expr`] holding one keeps the buffers alive, nothing more.
pub struct VectorData<T: DType> {
    pub(crate) id: u64,
    pub(crate) layout: Arc<Layout>,
    pub(crate) parts: Vec<Storage<T>>,
}

fn next_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

impl<T: DType> fmt::Debug for VectorData<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VectorData")
            .field("id", &self.id)
            .field("len", &self.layout.len)
            .finish()
    }
}

impl<T: DType> VectorData<T> {
    pub(crate) fn zeroed(layout: Arc<Layout>) -> Result<Self> {
        let parts = layout
            .queues
            .iter()
            .zip(&layout.partitions)
            .map(|(queue, part)| queue.device().alloc_zeros(part.len()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            id: next_id(),
            layout,
            parts,
        })
    }

    pub(crate) fn from_slice(layout: Arc<Layout>, data: &[T]) -> Result<Self> {
        if data.len() != layout.len {
            return Err(Error::size_mismatch(format!(
                "{} host values for a vector of length {}",
                data.len(),
                layout.len
            )));
        }
        let parts = layout
            .queues
            .iter()
            .zip(&layout.partitions)
            .map(|(queue, part)| queue.device().upload(&data[part.range()]))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            id: next_id(),
            layout,
            parts,
        })
    }

    /// Copy the global element range `range` to the host, waiting for the owning queues.
    pub(crate) fn read_range(&self, range: Range<usize>) -> Result<Vec<T>> {
        if range.start > range.end || range.end > self.layout.len {
            return Err(Error::invalid_argument(format!(
                "range {range:?} outside a vector of length {}",
                self.layout.len
            )));
        }
        let mut out = Vec::with_capacity(range.len());
        for ((queue, part), storage) in self
            .layout
            .queues
            .iter()
            .zip(&self.layout.partitions)
            .zip(&self.parts)
        {
            let lo = range.start.max(part.start);
            let hi = range.end.min(part.end);
            if lo < hi {
                out.extend(
                    queue
                        .device()
                        .download(storage, lo - part.start..hi - part.start)?,
                );
            }
        }
        Ok(out)
    }

    pub(crate) fn write_all(&self, data: &[T]) -> Result<()> {
        if data.len() != self.layout.len {
            return Err(Error::size_mismatch(format!(
                "{} host values for a vector of length {}",
                data.len(),
                self.layout.len
            )));
        }
        for ((queue, part), storage) in self
            .layout
            .queues
            .iter()
            .zip(&self.layout.partitions)
            .zip(&self.parts)
        {
            if !part.is_empty() {
                queue.device().write(storage, 0, &data[part.range()])?;
            }
        }
        Ok(())
    }
}

/// A vector split into contiguous partitions, one per queue.
///
/// Arithmetic on `&Vector` builds an [`Expr`]; nothing is computed until the expression is
/// assigned.
///
/// ```
/// use polyvec_core::{Context, Vector};
///
/// let ctx = Context::builder().host_devices(2).build().unwrap();
/// let x = Vector::from_slice(&ctx, &[1.0f32, 2.0, 3.0]).unwrap();
/// let mut y = Vector::<f32>::new(&ctx, 3).unwrap();
/// y.assign(2.0f32 * &x + 1.0).unwrap();
/// assert_eq!(y.to_vec().unwrap(), vec![3.0, 5.0, 7.0]);
/// ```
pub struct Vector<T: DType> {
    pub(crate) data: Arc<VectorData<T>>,
}

impl<T: DType> fmt::Debug for Vector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vector")
            .field("dtype", &T::NAME)
            .field("len", &self.len())
            .field("partitions", &self.partitions())
            .finish()
    }
}

impl<T: DType> Vector<T> {
    /// A zeroed vector of `len` elements partitioned over `queues`.
    pub fn new(queues: &(impl AsQueues + ?Sized), len: usize) -> Result<Self> {
        let layout = Layout::new(queues.as_queues(), len)?;
        Ok(Self {
            data: Arc::new(VectorData::zeroed(layout)?),
        })
    }

    pub fn from_slice(queues: &(impl AsQueues + ?Sized), data: &[T]) -> Result<Self> {
        let layout = Layout::new(queues.as_queues(), data.len())?;
        Ok(Self {
            data: Arc::new(VectorData::from_slice(layout, data)?),
        })
    }

    pub fn len(&self) -> usize {
        self.data.layout.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn queues(&self) -> &[Queue] {
        &self.data.layout.queues
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.data.layout.partitions
    }

    /// This vector as an expression operand.
    pub fn expr(&self) -> Expr<T> {
        Expr::Vector(self.data.clone())
    }

    /// This vector as an operand that is passed to generated kernels once, however often
    /// it appears in a tree.
    pub fn tagged(&self, tag: Tag) -> Expr<T> {
        self.expr().tagged(tag)
    }

    /// Wait for pending work and copy every element to the host.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.data.read_range(0..self.len())
    }

    /// Copy the global element range `range` to the host.
    pub fn read(&self, range: Range<usize>) -> Result<Vec<T>> {
        self.data.read_range(range)
    }

    pub fn copy_from(&mut self, data: &[T]) -> Result<()> {
        self.data.write_all(data)
    }

    pub fn assign(&mut self, expr: impl Into<Expr<T>>) -> Result<()> {
        kernel::assign(&self.data, AssignOp::Set, &expr.into())
    }

    pub fn assign_add(&mut self, expr: impl Into<Expr<T>>) -> Result<()> {
        kernel::assign(&self.data, AssignOp::Add, &expr.into())
    }

    pub fn assign_sub(&mut self, expr: impl Into<Expr<T>>) -> Result<()> {
        kernel::assign(&self.data, AssignOp::Sub, &expr.into())
    }

    pub fn assign_mul(&mut self, expr: impl Into<Expr<T>>) -> Result<()> {
        kernel::assign(&self.data, AssignOp::Mul, &expr.into())
    }

    pub fn assign_div(&mut self, expr: impl Into<Expr<T>>) -> Result<()> {
        kernel::assign(&self.data, AssignOp::Div, &expr.into())
    }

    pub fn fill(&mut self, value: T) -> Result<()> {
        self.assign(Expr::Scalar(value))
    }

    /// A deep copy on the same queues.
    pub fn try_clone(&self) -> Result<Self> {
        let parts = self
            .data
            .layout
            .queues
            .iter()
            .zip(&self.data.layout.partitions)
            .zip(&self.data.parts)
            .map(|((queue, part), storage)| queue.device().duplicate(storage, part.len()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            data: Arc::new(VectorData {
                id: next_id(),
                layout: self.data.layout.clone(),
                parts,
            }),
        })
    }
}

/// Copy `src` into `dst`, which must have `src.len()` elements.
pub fn copy_to_host<T: DType>(src: &Vector<T>, dst: &mut [T]) -> Result<()> {
    if dst.len() != src.len() {
        return Err(Error::size_mismatch(format!(
            "host buffer of {} for a vector of length {}",
            dst.len(),
            src.len()
        )));
    }
    dst.copy_from_slice(&src.to_vec()?);
    Ok(())
}

pub fn copy_to_device<T: DType>(src: &[T], dst: &mut Vector<T>) -> Result<()> {
    dst.copy_from(src)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;

    #[test]
    fn layouts_must_agree() {
        let ctx = Context::builder().host_devices(2).build().unwrap();
        let a = Vector::<f32>::new(&ctx, 10).unwrap();
        let b = Vector::<f32>::new(&ctx, 11).unwrap();
        let c = Vector::<f32>::new(ctx.queue(0).unwrap(), 10).unwrap();
        assert!(a.data.layout.check(&a.data.layout).is_ok());
        assert!(matches!(
            a.data.layout.check(&b.data.layout),
            Err(Error::SizeMismatch(_))
        ));
        assert!(matches!(
            a.data.layout.check(&c.data.layout),
            Err(Error::SizeMismatch(_))
        ));
    }

    #[test]
    fn ranges_cross_partitions() {
        let ctx = Context::builder().host_devices(3).build().unwrap();
        let data: Vec<u32> = (0..10).collect();
        let v = Vector::from_slice(&ctx, &data).unwrap();
        assert_eq!(v.read(2..8).unwrap(), data[2..8].to_vec());
        assert_eq!(v.read(5..5).unwrap(), Vec::<u32>::new());
        assert!(v.read(4..11).is_err());
    }
}
