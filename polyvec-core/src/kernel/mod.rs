//! Lowering of expression trees into per-partition kernels.
//!
//! The walk turns an [`Expr`] into a [`KernelIr`] whose shape is independent of runtime
//! values, plus the list of [`KernelArg`]s that feed it. The IR is rendered to device
//! source in [`codegen`], which also serves as the kernel cache key.

use std::{collections::HashMap, sync::Arc};

use crate::{
    context::Queue,
    expr::{BinaryOpType, Expr, UnaryOpType, UserFunction},
    partition::Partition,
    random::RandomKind,
    storage::Storage,
    vector::{Layout, VectorData},
    DType, Error, Result,
};

pub mod cache;
pub(crate) mod codegen;

/// How an assignment combines the evaluated expression with the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
}

impl AssignOp {
    pub(crate) fn as_binary(&self) -> Option<BinaryOpType> {
        match self {
            Self::Set => None,
            Self::Add => Some(BinaryOpType::Add),
            Self::Sub => Some(BinaryOpType::Sub),
            Self::Mul => Some(BinaryOpType::Mul),
            Self::Div => Some(BinaryOpType::Div),
        }
    }
}

/// Associative folds supported by the [`crate::Reductor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOpType {
    Sum,
    Max,
    Min,
}

impl ReduceOpType {
    pub(crate) fn as_binary(&self) -> BinaryOpType {
        match self {
            Self::Sum => BinaryOpType::Add,
            Self::Max => BinaryOpType::Max,
            Self::Min => BinaryOpType::Min,
        }
    }

    pub fn identity<T: DType>(&self) -> T {
        match self {
            Self::Sum => T::ZERO,
            Self::Max => T::LOWEST,
            Self::Min => T::HIGHEST,
        }
    }

    pub fn combine<T: DType>(&self, acc: T, x: T) -> T {
        T::binary(self.as_binary(), acc, x)
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Max => "max",
            Self::Min => "min",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum KernelKind {
    Assign(AssignOp),
    Reduce(ReduceOpType),
}

/// Type of one kernel parameter. Part of the generated source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ParamKind {
    Values,
    Scalar,
    Offset,
    Count,
    Rows,
    Columns,
    Shifts,
}

/// Runtime value bound to one kernel parameter.
pub(crate) enum KernelArg<T: DType> {
    Values(Storage<T>),
    Scalar(T),
    Offset(i64),
    Count(u64),
    Rows(Storage<u64>),
    Columns(Storage<u32>),
    Shifts(Storage<i32>),
}

impl<T: DType> KernelArg<T> {
    pub(crate) fn kind(&self) -> ParamKind {
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

/// Parameters consumed by a stencil node: weights, x, left halo, right halo,
/// width, center, left halo length, vector length.
pub(crate) const STENCIL_PARAMS: usize = 8;
/// Parameters consumed by a CSR node: row pointers, columns, values, x, ghosts, local column count.
pub(crate) const CSR_PARAMS: usize = 6;
/// Parameters consumed by a CCSR node: row pattern index, pattern rows, column offsets, values, x.
pub(crate) const CCSR_PARAMS: usize = 5;

/// Kernel body. Numbers are parameter slots unless noted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Node {
    Vector(usize),
    Scalar(usize),
    /// `base + i + offset`, with the offset in the slot.
    Index(usize),
    /// A value computed once per element, by local number.
    Local(usize),
    Unary(UnaryOpType, Box<Node>),
    Binary(BinaryOpType, Box<Node>, Box<Node>),
    /// User function by position in [`KernelIr::functions`].
    Call(usize, Vec<Node>),
    Stencil(usize),
    Csr(usize),
    Ccsr(usize),
    Random {
        kind: RandomKind,
        seed: usize,
        offset: usize,
    },
}

pub(crate) struct KernelIr<T: DType> {
    pub(crate) kind: KernelKind,
    pub(crate) params: Vec<ParamKind>,
    pub(crate) functions: Vec<UserFunction<T>>,
    pub(crate) locals: Vec<Node>,
    pub(crate) body: Node,
}

pub(crate) enum LaunchTarget<T: DType> {
    Assign(Storage<T>),
    Reduce(Storage<T>),
}

/// Everything a device needs to run one partition's kernel.
pub(crate) struct Launch<T: DType> {
    pub(crate) kind: KernelKind,
    pub(crate) target: LaunchTarget<T>,
    pub(crate) len: usize,
    pub(crate) base: u64,
    pub(crate) args: Vec<KernelArg<T>>,
    pub(crate) functions: Vec<UserFunction<T>>,
}

pub(crate) struct PartitionKernel<T: DType> {
    pub(crate) ir: KernelIr<T>,
    pub(crate) args: Vec<KernelArg<T>>,
}

struct KernelBuilder<'a, T: DType> {
    part: usize,
    layout: &'a Layout,
    args: Vec<KernelArg<T>>,
    functions: Vec<UserFunction<T>>,
    locals: Vec<Node>,
    tags: HashMap<u64, Node>,
}

impl<'a, T: DType> KernelBuilder<'a, T> {
    fn new(part: usize, layout: &'a Layout) -> Self {
        Self {
            part,
            layout,
            args: Vec::new(),
            functions: Vec::new(),
            locals: Vec::new(),
            tags: HashMap::new(),
        }
    }

    fn queue(&self) -> &Queue {
        &self.layout.queues[self.part]
    }

    fn partition(&self) -> Partition {
        self.layout.partitions[self.part]
    }

    fn push(&mut self, arg: KernelArg<T>) -> usize {
        self.args.push(arg);
        self.args.len() - 1
    }

    fn push_all(&mut self, args: Vec<KernelArg<T>>) -> usize {
        let first = self.args.len();
        self.args.extend(args);
        first
    }

    fn vector_arg(&mut self, v: &VectorData<T>) -> Result<usize> {
        self.layout.check(&v.layout)?;
        let part = v.parts[self.part].clone();
        Ok(self.push(KernelArg::Values(part)))
    }

    fn function(&mut self, func: &UserFunction<T>) -> Result<usize> {
        if let Some(pos) = self.functions.iter().position(|f| f.name() == func.name()) {
            if !self.functions[pos].same(func) {
                return Err(Error::invalid_argument(format!(
                    "two different functions are named `{}`",
                    func.name()
                )));
            }
            return Ok(pos);
        }
        let valid = func
            .name()
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && func.name().chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(Error::invalid_argument(format!(
                "function name `{}` is not an identifier",
                func.name()
            )));
        }
        self.functions.push(func.clone());
        Ok(self.functions.len() - 1)
    }

    fn walk(&mut self, expr: &Expr<T>) -> Result<Node> {
        Ok(match expr {
            Expr::Vector(v) => Node::Vector(self.vector_arg(v)?),
            Expr::Scalar(v) => Node::Scalar(self.push(KernelArg::Scalar(*v))),
            Expr::Index(index) => {
                if let Some(len) = index.len {
                    if len != self.layout.len {
                        return Err(Error::size_mismatch(format!(
                            "element index of length {len} used with vectors of length {}",
                            self.layout.len
                        )));
                    }
                }
                Node::Index(self.push(KernelArg::Offset(index.offset)))
            }
            Expr::Tagged { tag, inner } => {
                if let Some(node) = self.tags.get(&tag.id()) {
                    return Ok(node.clone());
                }
                let node = match inner.as_ref() {
                    Expr::Vector(v) => Node::Vector(self.vector_arg(v)?),
                    other => {
                        let value = self.walk(other)?;
                        self.locals.push(value);
                        Node::Local(self.locals.len() - 1)
                    }
                };
                self.tags.insert(tag.id(), node.clone());
                node
            }
            Expr::Unary { op, arg } => Node::Unary(*op, Box::new(self.walk(arg)?)),
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.walk(lhs)?;
                let rhs = self.walk(rhs)?;
                Node::Binary(*op, Box::new(lhs), Box::new(rhs))
            }
            Expr::Call { func, args } => {
                if args.len() != func.arity() {
                    return Err(Error::invalid_argument(format!(
                        "function `{}` takes {} arguments, got {}",
                        func.name(),
                        func.arity(),
                        args.len()
                    )));
                }
                let pos = self.function(func)?;
                let args = args
                    .iter()
                    .map(|a| self.walk(a))
                    .collect::<Result<Vec<_>>>()?;
                Node::Call(pos, args)
            }
            Expr::Stencil { stencil, x } => {
                self.layout.check(&x.layout)?;
                let args = stencil.kernel_args(x, self.part)?;
                Node::Stencil(self.push_all(args))
            }
            Expr::Csr { matrix, x } => {
                self.layout.check(&matrix.layout())?;
                let args = matrix.kernel_args(x, self.part)?;
                Node::Csr(self.push_all(args))
            }
            Expr::Ccsr { matrix, x } => {
                self.layout.check(&matrix.layout())?;
                let args = matrix.kernel_args(x)?;
                Node::Ccsr(self.push_all(args))
            }
            Expr::Random { kind, seed, index } => {
                if let Some(len) = index.len {
                    if len != self.layout.len {
                        return Err(Error::size_mismatch(format!(
                            "random sequence of length {len} used with vectors of length {}",
                            self.layout.len
                        )));
                    }
                }
                let seed = self.push(KernelArg::Count(*seed));
                let offset = self.push(KernelArg::Offset(index.offset));
                Node::Random {
                    kind: *kind,
                    seed,
                    offset,
                }
            }
        })
    }

    fn finish(self, kind: KernelKind, body: Node) -> PartitionKernel<T> {
        PartitionKernel {
            ir: KernelIr {
                kind,
                params: self.args.iter().map(KernelArg::kind).collect(),
                functions: self.functions,
                locals: self.locals,
                body,
            },
            args: self.args,
        }
    }
}

/// Build the kernels of every partition of `layout`.
///
/// All host-mediated halo exchanges happen here, before anything is submitted.
/// Empty partitions yield `None`.
pub(crate) fn prepare<T: DType>(
    expr: &Expr<T>,
    layout: &Layout,
    kind: KernelKind,
) -> Result<Vec<Option<PartitionKernel<T>>>> {
    let mut checked = Ok(());
    expr.visit(&mut |node| {
        if checked.is_err() {
            return;
        }
        checked = match node {
            Expr::Vector(v) | Expr::Stencil { x: v, .. } => layout.check(&v.layout),
            Expr::Csr { matrix, .. } => layout.check(&matrix.layout()),
            Expr::Ccsr { matrix, .. } => layout.check(&matrix.layout()),
            _ => Ok(()),
        };
    });
    checked?;

    (0..layout.partitions.len())
        .map(|part| {
            let mut builder = KernelBuilder::new(part, layout);
            if builder.partition().is_empty() {
                return Ok(None);
            }
            let body = builder.walk(expr)?;
            log::trace!(
                "built {kind:?} kernel for partition {part} on {}",
                builder.queue().info()
            );
            Ok(Some(builder.finish(kind, body)))
        })
        .collect()
}

/// Evaluate `expr` into `target` with `op`, one kernel per partition.
pub(crate) fn assign<T: DType>(target: &VectorData<T>, op: AssignOp, expr: &Expr<T>) -> Result<()> {
    if expr.gathers_from(target.id) {
        // Reads neighbours of the element being written; evaluate out of place first.
        let scratch = Arc::new(VectorData::zeroed(target.layout.clone())?);
        assign(&scratch, AssignOp::Set, expr)?;
        return assign(target, op, &Expr::Vector(scratch));
    }
    let kernels = prepare(expr, &target.layout, KernelKind::Assign(op))?;
    for (part, kernel) in kernels.into_iter().enumerate() {
        let Some(kernel) = kernel else {
            continue;
        };
        let queue = &target.layout.queues[part];
        queue.run(
            kernel,
            LaunchTarget::Assign(target.parts[part].clone()),
            target.layout.partitions[part],
        )?;
    }
    Ok(())
}
