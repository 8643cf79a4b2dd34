use std::{fmt, marker::PhantomData};

use crate::{
    context::{AsQueues, Queue},
    expr::Expr,
    kernel::{self, KernelKind, LaunchTarget, ReduceOpType},
    vector::Layout,
    DType, Error, Result,
};

mod private {
    pub trait Sealed {}
}

/// An associative fold a [`Reductor`] can compute.
pub trait ReduceOperator: private::Sealed {
    const OP: ReduceOpType;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

#[derive(Debug, Clone, Copy, Default)]
pub struct Max;

#[derive(Debug, Clone, Copy, Default)]
pub struct Min;

impl private::Sealed for Sum {}
impl private::Sealed for Max {}
impl private::Sealed for Min {}

impl ReduceOperator for Sum {
    const OP: ReduceOpType = ReduceOpType::Sum;
}

impl ReduceOperator for Max {
    const OP: ReduceOpType = ReduceOpType::Max;
}

impl ReduceOperator for Min {
    const OP: ReduceOpType = ReduceOpType::Min;
}

/// Folds an expression to one value.
///
/// Each partition is reduced on its own device into a buffer of partial results; the
/// partials of all partitions are then folded on the host.
///
/// ```
/// use polyvec_core::{Context, Reductor, Sum, Vector};
///
/// let ctx = Context::builder().host_devices(2).build().unwrap();
/// let x = Vector::from_slice(&ctx, &[1.0f64, 2.0, 3.0, 4.0]).unwrap();
/// let sum = Reductor::<f64, Sum>::new(&ctx).unwrap();
/// assert_eq!(sum.reduce(&x * &x).unwrap(), 30.0);
/// ```
pub struct Reductor<T: DType, R: ReduceOperator = Sum> {
    queues: Vec<Queue>,
    _marker: PhantomData<(T, R)>,
}

impl<T: DType, R: ReduceOperator> fmt::Debug for Reductor<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reductor")
            .field("op", &R::OP)
            .field("queues", &self.queues)
            .finish()
    }
}

impl<T: DType, R: ReduceOperator> Reductor<T, R> {
    pub fn new(queues: &(impl AsQueues + ?Sized)) -> Result<Self> {
        let queues = queues.as_queues().to_vec();
        if queues.is_empty() {
            return Err(Error::NoDevice);
        }
        Ok(Self {
            queues,
            _marker: PhantomData,
        })
    }

    pub fn reduce(&self, expr: impl Into<Expr<T>>) -> Result<T> {
        let expr = expr.into();
        let op = R::OP;
        let layout = match (expr.layout(), expr.index_len()) {
            (Some(layout), _) => layout,
            (None, Some(len)) => Layout::new(&self.queues, len)?,
            (None, None) => {
                return Err(Error::invalid_argument(
                    "cannot infer the length of an expression without vectors; \
                     use an element index with a length",
                ))
            }
        };

        let kernels = kernel::prepare(&expr, &layout, KernelKind::Reduce(op))?;
        let mut partials = Vec::with_capacity(kernels.len());
        for (part, kernel) in kernels.into_iter().enumerate() {
            let Some(kernel) = kernel else {
                continue;
            };
            let queue = &layout.queues[part];
            let range = layout.partitions[part];
            let count = queue.device().partial_count(range.len());
            let target = queue.device().alloc_zeros::<T>(count)?;
            queue.run(kernel, LaunchTarget::Reduce(target.clone()), range)?;
            partials.push((queue, target, count));
        }

        let mut acc = op.identity::<T>();
        for (queue, target, count) in partials {
            acc = queue
                .device()
                .download(&target, 0..count)?
                .into_iter()
                .fold(acc, |acc, x| op.combine(acc, x));
        }
        Ok(acc)
    }
}
