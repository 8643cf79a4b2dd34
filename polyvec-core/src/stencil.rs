use std::{fmt, ops::Mul, sync::Arc};

use crate::{
    context::{AsQueues, Queue},
    expr::Expr,
    kernel::KernelArg,
    storage::Storage,
    vector::VectorData,
    DType, Error, Result, Vector,
};

struct StencilInner<T: DType> {
    queues: Vec<Queue>,
    /// The weights, uploaded once to every queue.
    weights: Vec<Storage<T>>,
    width: usize,
    center: usize,
}

/// A one-dimensional convolution with clamped boundaries.
///
/// `y[i] = sum_j w[j] * x[clamp(i - center + j, 0, n - 1)]`, summed in ascending `j`.
/// Each partition reads `center` elements to its left and `width - center - 1` to its
/// right from neighbouring partitions.
pub struct Stencil<T: DType> {
    inner: Arc<StencilInner<T>>,
}

impl<T: DType> Clone for Stencil<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: DType> fmt::Debug for Stencil<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stencil")
            .field("width", &self.inner.width)
            .field("center", &self.inner.center)
            .finish()
    }
}

impl<T: DType> Stencil<T> {
    pub fn new(queues: &(impl AsQueues + ?Sized), weights: &[T], center: usize) -> Result<Self> {
        if weights.is_empty() {
            return Err(Error::invalid_argument("stencil needs at least one weight"));
        }
        if center >= weights.len() {
            return Err(Error::invalid_argument(format!(
                "stencil center {center} outside {} weights",
                weights.len()
            )));
        }
        let queues = queues.as_queues().to_vec();
        if queues.is_empty() {
            return Err(Error::NoDevice);
        }
        let width = weights.len();
        let weights = queues
            .iter()
            .map(|q| q.device().upload(weights))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            inner: Arc::new(StencilInner {
                width,
                queues,
                weights,
                center,
            }),
        })
    }

    pub fn width(&self) -> usize {
        self.inner.width
    }

    pub fn center(&self) -> usize {
        self.inner.center
    }

    /// `self` applied to `x`, as an expression operand.
    pub fn apply(&self, x: &Vector<T>) -> Expr<T> {
        Expr::Stencil {
            stencil: self.clone(),
            x: x.data.clone(),
        }
    }

    /// Arguments of partition `part`, with its halos gathered from the other partitions.
    pub(crate) fn kernel_args(&self, x: &VectorData<T>, part: usize) -> Result<Vec<KernelArg<T>>> {
        let layout = &x.layout;
        if self.inner.queues != layout.queues {
            return Err(Error::size_mismatch(
                "stencil and vector are distributed over different queues",
            ));
        }
        let (width, center) = (self.inner.width, self.inner.center);
        let range = layout.partitions[part];
        let left = range.start - center.min(range.start);
        let right = layout.len.min(range.end + width - 1 - center);
        let queue = &layout.queues[part];

        let left_halo = x.read_range(left..range.start)?;
        let right_halo = x.read_range(range.end..right.max(range.end))?;
        if !left_halo.is_empty() || !right_halo.is_empty() {
            log::debug!(
                "stencil halo for partition {part}: {} left, {} right",
                left_halo.len(),
                right_halo.len()
            );
        }
        let device = queue.device();
        Ok(vec![
            KernelArg::Values(self.inner.weights[part].clone()),
            KernelArg::Values(x.parts[part].clone()),
            KernelArg::Values(device.upload(&left_halo)?),
            KernelArg::Values(device.upload(&right_halo)?),
            KernelArg::Count(width as u64),
            KernelArg::Count(center as u64),
            KernelArg::Count(left_halo.len() as u64),
            KernelArg::Count(layout.len as u64),
        ])
    }
}

impl<T: DType> Mul<&Stencil<T>> for &Vector<T> {
    type Output = Expr<T>;

    fn mul(self, stencil: &Stencil<T>) -> Expr<T> {
        stencil.apply(self)
    }
}
