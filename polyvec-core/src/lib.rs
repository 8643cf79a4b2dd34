//! Polyvec runs vector expressions across every compute device of a machine.
//!
//! A [`Vector`] is split into contiguous partitions, one per queue of a [`Context`].
//! Arithmetic on vectors builds an [`Expr`] tree instead of computing anything. When the
//! tree is assigned to a vector or handed to a [`Reductor`], it is fused into a single
//! kernel per partition, compiled once per device and kept in a [`KernelCache`].
//!
//! Host CPUs are split into logical devices which run the generated kernels on a thread
//! pool. With the `cuda` feature, CUDA devices run the same expressions as generated
//! CUDA C compiled through NVRTC.
//!
//! ## A quick guide
//! - Open a [`Context`], usually through [`Context::builder`].
//! - Create vectors on it with [`Vector::new`] or [`Vector::from_slice`].
//! - Combine vectors, scalars, [`element_index`], [`UserFunction`] calls, [`Random`]
//!   streams, [`Stencil`] and [`SparseMatrix`] products into an expression.
//! - Assign it with [`Vector::assign`] (or one of the compound variants), or fold it
//!   with a [`Reductor`].
//! - Sort vectors with [`sort`], [`sort_by`] and [`sort_by_key`].
//!
//! ## What can you do with it?
//! ```
//! use polyvec_core::{Context, Reductor, Sum, Vector};
//!
//! let ctx = Context::builder().host_devices(2).build().unwrap();
//! let x = Vector::from_slice(&ctx, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
//! let mut y = Vector::from_slice(&ctx, &[1.0f32; 4]).unwrap();
//!
//! // One fused kernel per partition: y = 2 * x + y
//! y.assign(2.0f32 * &x + &y).unwrap();
//! assert_eq!(y.to_vec().unwrap(), vec![3.0, 5.0, 7.0, 9.0]);
//!
//! let sum = Reductor::<f32, Sum>::new(&ctx).unwrap();
//! assert_eq!(sum.reduce(&y).unwrap(), 24.0);
//! ```

mod config;
mod context;
mod cpu_storage;
#[cfg(feature = "cuda")]
mod cuda_backend;
mod device;
mod dtype;
mod error;
mod expr;
mod kernel;
mod partition;
mod random;
mod reductor;
mod sort;
mod spmat;
mod stencil;
mod storage;
mod vector;

pub use config::{
    EngineConfig, ENV_DUMP_KERNELS, ENV_HOST_DEVICES, ENV_HOST_THREADS, ENV_KERNEL_DIR,
};
pub use context::{AsQueues, Context, ContextBuilder, Queue};
pub use device::{
    Backend, DeviceId, DeviceInfo, Filter, ENV_BACKEND, ENV_DEVICE, ENV_MAX_DEVICES,
    ENV_POSITION, ENV_VENDOR,
};
pub use dtype::{DType, DTypeOps};
pub use error::{Error, ErrorContext, Result};
pub use expr::{
    element_index, max, min, pow, BinaryOpType, ElementIndex, Expr, HostFn, Tag, UnaryOpType,
    UserFunction,
};
pub use kernel::{
    cache::{CacheStats, KernelCache},
    AssignOp, ReduceOpType,
};
pub use partition::{partition, Partition};
pub use random::{
    philox4x32_10, threefry4x32_20, Philox, Random, RandomFamily, RandomKind, Threefry,
};
pub use reductor::{Max, Min, ReduceOperator, Reductor, Sum};
pub use sort::{sort, sort_by, sort_by_key, sort_by_key_with, Comparator};
pub use spmat::{CompactSparseMatrix, SparseMatrix};
pub use stencil::Stencil;
pub use vector::{copy_to_device, copy_to_host, Vector, VectorData};
