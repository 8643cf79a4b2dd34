//! Host execution of kernel IR.
//!
//! A [`KernelIr`] is lowered once into a flat stack-machine tape. The tape is run over
//! fixed-size chunks of the partition in parallel, one value buffer per tape slot, with
//! the buffers recycled through a per-thread [`BufferPool`].

use parking_lot::RwLockReadGuard;
use rayon::prelude::*;

use super::pool::{BufferPool, PooledBuffer, SharedPool};
use crate::{
    expr::{BinaryOpType, HostFn, UnaryOpType},
    kernel::{KernelArg, KernelIr, Node, ParamKind, ReduceOpType},
    random::RandomKind,
    DType, Error, Result,
};

/// Elements evaluated per tape run.
pub(crate) const CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Instr {
    Vector(usize),
    Scalar(usize),
    Index(usize),
    Local(usize),
    StoreLocal(usize),
    Unary(UnaryOpType),
    Binary(BinaryOpType),
    Call { func: usize, arity: usize },
    Stencil(usize),
    Csr(usize),
    Ccsr(usize),
    Random {
        kind: RandomKind,
        seed: usize,
        offset: usize,
    },
}

impl Instr {
    /// Net change of the stack depth.
    fn depth_change(&self) -> isize {
        match self {
            Self::StoreLocal(_) | Self::Binary(_) => -1,
            Self::Unary(_) => 0,
            Self::Call { arity, .. } => 1 - *arity as isize,
            _ => 1,
        }
    }

    /// Operands popped before pushing.
    fn consumes(&self) -> usize {
        match self {
            Self::StoreLocal(_) | Self::Unary(_) => 1,
            Self::Binary(_) => 2,
            Self::Call { arity, .. } => *arity,
            _ => 0,
        }
    }
}

/// A kernel lowered for host devices.
#[derive(Debug)]
pub(crate) struct HostKernel {
    name: String,
    params: Vec<ParamKind>,
    locals: usize,
    code: Vec<Instr>,
}

/// A kernel argument pinned for the duration of one launch.
pub(crate) enum HostArg<'a, T: DType> {
    Values(RwLockReadGuard<'a, Vec<T>>),
    Scalar(T),
    Offset(i64),
    Count(u64),
    Rows(RwLockReadGuard<'a, Vec<u64>>),
    Columns(RwLockReadGuard<'a, Vec<u32>>),
    Shifts(RwLockReadGuard<'a, Vec<i32>>),
}

impl<'a, T: DType> HostArg<'a, T> {
    /// Read-lock every buffer `arg` refers to.
    ///
    /// Recursive read locks are taken since the same buffer may appear as several
    /// arguments while a writer waits for the target.
    pub(crate) fn hold(arg: &'a KernelArg<T>) -> Result<Self> {
        Ok(match arg {
            KernelArg::Values(s) => Self::Values(s.as_cpu()?.0.read_recursive()),
            KernelArg::Scalar(v) => Self::Scalar(*v),
            KernelArg::Offset(v) => Self::Offset(*v),
            KernelArg::Count(v) => Self::Count(*v),
            KernelArg::Rows(s) => Self::Rows(s.as_cpu()?.0.read_recursive()),
            KernelArg::Columns(s) => Self::Columns(s.as_cpu()?.0.read_recursive()),
            KernelArg::Shifts(s) => Self::Shifts(s.as_cpu()?.0.read_recursive()),
        })
    }

    fn values(&self) -> &[T] {
        match self {
            Self::Values(v) => v,
            _ => unreachable!("parameter kinds are checked when the kernel is compiled"),
        }
    }

    fn scalar(&self) -> T {
        match self {
            Self::Scalar(v) => *v,
            _ => unreachable!("parameter kinds are checked when the kernel is compiled"),
        }
    }

    fn offset(&self) -> i64 {
        match self {
            Self::Offset(v) => *v,
            _ => unreachable!("parameter kinds are checked when the kernel is compiled"),
        }
    }

    fn count(&self) -> u64 {
        match self {
            Self::Count(v) => *v,
            _ => unreachable!("parameter kinds are checked when the kernel is compiled"),
        }
    }

    fn rows(&self) -> &[u64] {
        match self {
            Self::Rows(v) => v,
            _ => unreachable!("parameter kinds are checked when the kernel is compiled"),
        }
    }

    fn columns(&self) -> &[u32] {
        match self {
            Self::Columns(v) => v,
            _ => unreachable!("parameter kinds are checked when the kernel is compiled"),
        }
    }

    fn shifts(&self) -> &[i32] {
        match self {
            Self::Shifts(v) => v,
            _ => unreachable!("parameter kinds are checked when the kernel is compiled"),
        }
    }

    fn kind(&self) -> ParamKind {
        match self {
            Self::Values(_) => ParamKind::Values,
            Self::Scalar(_) => ParamKind::Scalar,
            Self::Offset(_) => ParamKind::Offset,
            Self::Count(_) => ParamKind::Count,
            Self::Rows(_) => ParamKind::Rows,
            Self::Columns(_) => ParamKind::Columns,
            Self::Shifts(_) => ParamKind::Shifts,
        }
    }
}

/// Bindings shared by every chunk of one launch.
struct Frame<'f, 'a, T: DType> {
    args: &'f [HostArg<'a, T>],
    funcs: &'f [HostFn<T>],
    base: u64,
    len: usize,
}

fn pop<T: DType>(stack: &mut Vec<PooledBuffer<T>>) -> PooledBuffer<T> {
    match stack.pop() {
        Some(buf) => buf,
        None => unreachable!("tape depth is checked when the kernel is compiled"),
    }
}

impl HostKernel {
    /// A kernel that evaluates to nothing.
    #[cfg(test)]
    pub(crate) fn empty() -> Self {
        Self {
            name: "empty".to_string(),
            params: Vec::new(),
            locals: 0,
            code: Vec::new(),
        }
    }

    pub(crate) fn compile<T: DType>(ir: &KernelIr<T>, name: &str, device: &str) -> Result<Self> {
        let failure = |log: String| Error::Compile {
            name: name.to_string(),
            device: device.to_string(),
            log,
        };
        if let Some(func) = ir.functions.iter().find(|f| f.inner.host.is_none()) {
            return Err(failure(format!(
                "function `{}` has no host implementation",
                func.name()
            )));
        }

        let mut code = Vec::new();
        for (k, local) in ir.locals.iter().enumerate() {
            lower(local, &mut code);
            code.push(Instr::StoreLocal(k));
        }
        lower(&ir.body, &mut code);

        let mut depth = 0isize;
        for instr in &code {
            if depth < instr.consumes() as isize {
                return Err(failure(format!("stack underflow at {instr:?}")));
            }
            depth += instr.depth_change();
        }
        if depth != 1 {
            return Err(failure(format!("tape leaves {depth} values on the stack")));
        }

        Ok(Self {
            name: name.to_string(),
            params: ir.params.clone(),
            locals: ir.locals.len(),
            code,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn check_args<T: DType>(&self, args: &[HostArg<'_, T>]) -> Result<()> {
        let kinds = args.iter().map(HostArg::kind);
        if args.len() != self.params.len() || !kinds.eq(self.params.iter().copied()) {
            crate::bail!("arguments do not match the parameters of kernel {}", self.name);
        }
        Ok(())
    }

    /// Values of elements `base..base + len`.
    pub(crate) fn evaluate<T: DType>(
        &self,
        args: &[HostArg<'_, T>],
        funcs: &[HostFn<T>],
        base: u64,
        len: usize,
    ) -> Result<Vec<T>> {
        self.check_args(args)?;
        let frame = Frame {
            args,
            funcs,
            base,
            len,
        };
        let mut out = vec![T::ZERO; len];
        out.par_chunks_mut(CHUNK).enumerate().for_each_init(
            BufferPool::shared,
            |pool, (c, dst)| {
                let lo = c * CHUNK;
                let values = self.eval_chunk(&frame, lo, lo + dst.len(), pool);
                dst.copy_from_slice(&values);
            },
        );
        Ok(out)
    }

    /// Fold of elements `base..base + len` with `op`.
    pub(crate) fn reduce<T: DType>(
        &self,
        args: &[HostArg<'_, T>],
        funcs: &[HostFn<T>],
        base: u64,
        len: usize,
        op: ReduceOpType,
    ) -> Result<T> {
        self.check_args(args)?;
        let frame = Frame {
            args,
            funcs,
            base,
            len,
        };
        let identity = op.identity::<T>();
        Ok((0..len.div_ceil(CHUNK))
            .into_par_iter()
            .map_init(BufferPool::shared, |pool, c| {
                let lo = c * CHUNK;
                let hi = (lo + CHUNK).min(len);
                self.eval_chunk(&frame, lo, hi, pool)
                    .iter()
                    .fold(identity, |acc, &x| op.combine(acc, x))
            })
            .reduce(|| identity, |a, b| op.combine(a, b)))
    }

    fn eval_chunk<T: DType>(
        &self,
        frame: &Frame<'_, '_, T>,
        lo: usize,
        hi: usize,
        pool: &SharedPool<T>,
    ) -> PooledBuffer<T> {
        let m = hi - lo;
        let args = frame.args;
        let fresh = || PooledBuffer::with_capacity(pool, m);
        let mut stack: Vec<PooledBuffer<T>> = Vec::new();
        let mut locals: Vec<Option<PooledBuffer<T>>> = (0..self.locals).map(|_| None).collect();

        for instr in &self.code {
            match *instr {
                Instr::Vector(s) => {
                    let mut buf = fresh();
                    buf.extend_from_slice(&args[s].values()[lo..hi]);
                    stack.push(buf);
                }
                Instr::Scalar(s) => {
                    let mut buf = fresh();
                    buf.resize(m, args[s].scalar());
                    stack.push(buf);
                }
                Instr::Index(s) => {
                    let offset = args[s].offset();
                    let mut buf = fresh();
                    buf.extend(
                        (lo..hi).map(|i| T::from_index((frame.base + i as u64) as i64 + offset)),
                    );
                    stack.push(buf);
                }
                Instr::Local(k) => {
                    let mut buf = fresh();
                    if let Some(local) = &locals[k] {
                        buf.extend_from_slice(local);
                    }
                    stack.push(buf);
                }
                Instr::StoreLocal(k) => locals[k] = Some(pop(&mut stack)),
                Instr::Unary(op) => {
                    let f = op.to_closure::<T>();
                    let mut buf = pop(&mut stack);
                    buf.iter_mut().for_each(|x| *x = f(*x));
                    stack.push(buf);
                }
                Instr::Binary(op) => {
                    let f = op.as_closure::<T>();
                    let rhs = pop(&mut stack);
                    let mut lhs = pop(&mut stack);
                    lhs.iter_mut().zip(rhs.iter()).for_each(|(l, r)| *l = f(*l, *r));
                    stack.push(lhs);
                }
                Instr::Call { func, arity } => {
                    let operands = stack.split_off(stack.len() - arity);
                    let f = &frame.funcs[func];
                    let mut call_args = Vec::with_capacity(arity);
                    let mut buf = fresh();
                    for i in 0..m {
                        call_args.clear();
                        call_args.extend(operands.iter().map(|o| o[i]));
                        buf.push(f(&call_args));
                    }
                    stack.push(buf);
                }
                Instr::Stencil(s) => {
                    let mut buf = fresh();
                    buf.extend((lo..hi).map(|i| stencil_at(&args[s..], frame, i)));
                    stack.push(buf);
                }
                Instr::Csr(s) => {
                    let mut buf = fresh();
                    buf.extend((lo..hi).map(|i| csr_at(&args[s..], i)));
                    stack.push(buf);
                }
                Instr::Ccsr(s) => {
                    let mut buf = fresh();
                    buf.extend((lo..hi).map(|i| ccsr_at(&args[s..], i)));
                    stack.push(buf);
                }
                Instr::Random { kind, seed, offset } => {
                    let key = args[seed].count();
                    let offset = args[offset].offset();
                    let mut buf = fresh();
                    buf.extend((lo..hi).map(|i| {
                        let ctr = ((frame.base + i as u64) as i64 + offset) as u64;
                        let w = kind.words(ctr, key);
                        T::from_words(w[0], w[1])
                    }));
                    stack.push(buf);
                }
            }
        }
        pop(&mut stack)
    }
}

fn lower(node: &Node, code: &mut Vec<Instr>) {
    match node {
        Node::Vector(s) => code.push(Instr::Vector(*s)),
        Node::Scalar(s) => code.push(Instr::Scalar(*s)),
        Node::Index(s) => code.push(Instr::Index(*s)),
        Node::Local(k) => code.push(Instr::Local(*k)),
        Node::Unary(op, arg) => {
            lower(arg, code);
            code.push(Instr::Unary(*op));
        }
        Node::Binary(op, lhs, rhs) => {
            lower(lhs, code);
            lower(rhs, code);
            code.push(Instr::Binary(*op));
        }
        Node::Call(func, args) => {
            args.iter().for_each(|a| lower(a, code));
            code.push(Instr::Call {
                func: *func,
                arity: args.len(),
            });
        }
        Node::Stencil(s) => code.push(Instr::Stencil(*s)),
        Node::Csr(s) => code.push(Instr::Csr(*s)),
        Node::Ccsr(s) => code.push(Instr::Ccsr(*s)),
        Node::Random { kind, seed, offset } => code.push(Instr::Random {
            kind: *kind,
            seed: *seed,
            offset: *offset,
        }),
    }
}

/// Weighted sum over the clamped window around global element `base + i`.
fn stencil_at<T: DType>(p: &[HostArg<'_, T>], frame: &Frame<'_, '_, T>, i: usize) -> T {
    let (w, x, left, right) = (p[0].values(), p[1].values(), p[2].values(), p[3].values());
    let (width, center) = (p[4].count() as i64, p[5].count() as i64);
    let (nleft, total) = (p[6].count() as i64, p[7].count() as i64);
    let (base, n) = (frame.base as i64, frame.len as i64);
    let mut sum = T::ZERO;
    for j in 0..width {
        let g = (base + i as i64 - center + j).clamp(0, total - 1);
        let l = g - base;
        let v = if l < 0 {
            left[(nleft + l) as usize]
        } else if l >= n {
            right[(l - n) as usize]
        } else {
            x[l as usize]
        };
        sum = T::binary(
            BinaryOpType::Add,
            sum,
            T::binary(BinaryOpType::Mul, w[j as usize], v),
        );
    }
    sum
}

fn csr_at<T: DType>(p: &[HostArg<'_, T>], i: usize) -> T {
    let (row, col, val) = (p[0].rows(), p[1].columns(), p[2].values());
    let (x, ghost, local_cols) = (p[3].values(), p[4].values(), p[5].count() as usize);
    let mut sum = T::ZERO;
    for j in row[i] as usize..row[i + 1] as usize {
        let c = col[j] as usize;
        let xc = if c < local_cols {
            x[c]
        } else {
            ghost[c - local_cols]
        };
        sum = T::binary(
            BinaryOpType::Add,
            sum,
            T::binary(BinaryOpType::Mul, val[j], xc),
        );
    }
    sum
}

fn ccsr_at<T: DType>(p: &[HostArg<'_, T>], i: usize) -> T {
    let (idx, row, col) = (p[0].columns(), p[1].columns(), p[2].shifts());
    let (val, x) = (p[3].values(), p[4].values());
    let pattern = idx[i] as usize;
    let mut sum = T::ZERO;
    for j in row[pattern] as usize..row[pattern + 1] as usize {
        let xc = x[(i as i64 + col[j] as i64) as usize];
        sum = T::binary(
            BinaryOpType::Add,
            sum,
            T::binary(BinaryOpType::Mul, val[j], xc),
        );
    }
    sum
}
