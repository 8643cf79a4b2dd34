//! Expression trees over distributed vectors.
//!
//! Building an [`Expr`] does no device work. The tree is walked once per target partition
//! when it is assigned to a [`crate::Vector`] or handed to a [`crate::Reductor`], and every
//! node ends up inside one generated kernel.

use std::{
    fmt::{self, Display},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    random::RandomKind,
    spmat::{CompactSparseMatrix, SparseMatrix},
    stencil::Stencil,
    vector::{Layout, VectorData},
    DType, Vector,
};

mod ops;

#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum BinaryOpType {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Pow,
}

impl BinaryOpType {
    pub fn as_c_op(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Min => "min",
            Self::Max => "max",
            Self::Pow => "pow",
        }
    }

    /// C expression combining `lhs` and `rhs` inside a kernel templated on `T`.
    pub fn fill_in_c_op<T: DType>(&self, lhs: impl Display, rhs: impl Display) -> String {
        match self {
            Self::Add | Self::Sub | Self::Mul => format!("({lhs} {} {rhs})", self.as_c_op()),
            Self::Div if T::INTEGRAL => format!("polyvec_div<T>({lhs}, {rhs})"),
            Self::Div => format!("({lhs} / {rhs})"),
            Self::Min | Self::Max => format!("{}({lhs}, {rhs})", self.as_c_op()),
            Self::Pow => format!(
                "static_cast<T>(pow(static_cast<double>({lhs}), static_cast<double>({rhs})))"
            ),
        }
    }

    pub fn as_closure<T: DType>(&self) -> impl Fn(T, T) -> T {
        let op = *self;
        move |x, y| T::binary(op, x, y)
    }
}

#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum UnaryOpType {
    Neg,
    Abs,
    Sqrt,
    Exp,
    Log,
    Sin,
    Cos,
    Tanh,
}

impl UnaryOpType {
    pub fn fill_in_c_op<T: DType>(&self, val: impl Display) -> String {
        let via_double =
            |f: &str| format!("static_cast<T>( {f}( static_cast<double>({val}) ) )");
        match self {
            Self::Neg => format!("(-{val})"),
            Self::Abs if !T::SIGNED => format!("({val})"),
            Self::Abs if T::INTEGRAL => format!("(({val}) < 0 ? -({val}) : ({val}))"),
            Self::Abs => via_double("fabs"),
            Self::Sqrt => via_double("sqrt"),
            Self::Exp => via_double("exp"),
            Self::Log => via_double("log"),
            Self::Sin => via_double("sin"),
            Self::Cos => via_double("cos"),
            Self::Tanh => via_double("tanh"),
        }
    }

    pub fn to_closure<T: DType>(&self) -> impl Fn(T) -> T {
        let op = *self;
        move |x| T::unary(op, x)
    }
}

/// Stable identity for a sub-expression.
///
/// Every occurrence of one tag inside a tree is evaluated once per element and shared.
/// Tags are compared by identity, never by the structure of what they wrap.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Tag(u64);

impl Tag {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn id(&self) -> u64 {
        self.0
    }
}

impl Default for Tag {
    fn default() -> Self {
        Self::new()
    }
}

/// The global position of each element, plus a fixed offset.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ElementIndex {
    pub(crate) offset: i64,
    pub(crate) len: Option<usize>,
}

impl ElementIndex {
    /// An index term that takes its length from the other operands.
    pub fn new(offset: i64) -> Self {
        Self { offset, len: None }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn len(&self) -> Option<usize> {
        self.len
    }
}

/// An element index of known length, usable in vector-free reductions.
pub fn element_index(offset: i64, len: usize) -> ElementIndex {
    ElementIndex {
        offset,
        len: Some(len),
    }
}

pub type HostFn<T> = Arc<dyn Fn(&[T]) -> T + Send + Sync>;

pub(crate) struct FunctionInner<T: DType> {
    pub(crate) name: String,
    pub(crate) arity: usize,
    pub(crate) device: Option<String>,
    pub(crate) host: Option<HostFn<T>>,
}

/// A named device-code snippet with an equivalent host function.
///
/// The device body is spliced into generated kernels verbatim as the body of
/// `T name(T prm1, .., T prmN)`, so it must `return` a value.
pub struct UserFunction<T: DType> {
    pub(crate) inner: Arc<FunctionInner<T>>,
}

impl<T: DType> Clone for UserFunction<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: DType> fmt::Debug for UserFunction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserFunction")
            .field("name", &self.inner.name)
            .field("arity", &self.inner.arity)
            .field("device", &self.inner.device)
            .field("host", &self.inner.host.is_some())
            .finish()
    }
}

impl<T: DType> UserFunction<T> {
    pub fn new(
        name: impl Into<String>,
        arity: usize,
        device_body: impl Into<String>,
        host: impl Fn(&[T]) -> T + Send + Sync + 'static,
    ) -> Self {
        Self::from_parts(name.into(), arity, Some(device_body.into()), Some(Arc::new(host)))
    }

    /// A function that can only run on devices compiling generated source.
    pub fn device_only(name: impl Into<String>, arity: usize, device_body: impl Into<String>) -> Self {
        Self::from_parts(name.into(), arity, Some(device_body.into()), None)
    }

    /// A function that can only run on host devices.
    pub fn host_only(
        name: impl Into<String>,
        arity: usize,
        host: impl Fn(&[T]) -> T + Send + Sync + 'static,
    ) -> Self {
        Self::from_parts(name.into(), arity, None, Some(Arc::new(host)))
    }

    fn from_parts(
        name: String,
        arity: usize,
        device: Option<String>,
        host: Option<HostFn<T>>,
    ) -> Self {
        Self {
            inner: Arc::new(FunctionInner {
                name,
                arity,
                device,
                host,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn arity(&self) -> usize {
        self.inner.arity
    }

    /// Apply the function to its arguments, positionally.
    pub fn call<I, E>(&self, args: I) -> Expr<T>
    where
        I: IntoIterator<Item = E>,
        E: Into<Expr<T>>,
    {
        Expr::Call {
            func: self.clone(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub(crate) fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A node of an expression tree.
pub enum Expr<T: DType> {
    Vector(Arc<VectorData<T>>),
    Scalar(T),
    Index(ElementIndex),
    Tagged {
        tag: Tag,
        inner: Box<Expr<T>>,
    },
    Unary {
        op: UnaryOpType,
        arg: Box<Expr<T>>,
    },
    Binary {
        op: BinaryOpType,
        lhs: Box<Expr<T>>,
        rhs: Box<Expr<T>>,
    },
    Call {
        func: UserFunction<T>,
        args: Vec<Expr<T>>,
    },
    Stencil {
        stencil: Stencil<T>,
        x: Arc<VectorData<T>>,
    },
    Csr {
        matrix: SparseMatrix<T>,
        x: Arc<VectorData<T>>,
    },
    Ccsr {
        matrix: CompactSparseMatrix<T>,
        x: Arc<VectorData<T>>,
    },
    Random {
        kind: RandomKind,
        seed: u64,
        index: ElementIndex,
    },
}

impl<T: DType> Clone for Expr<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Vector(v) => Self::Vector(v.clone()),
            Self::Scalar(v) => Self::Scalar(*v),
            Self::Index(i) => Self::Index(*i),
            Self::Tagged { tag, inner } => Self::Tagged {
                tag: *tag,
                inner: inner.clone(),
            },
            Self::Unary { op, arg } => Self::Unary {
                op: *op,
                arg: arg.clone(),
            },
            Self::Binary { op, lhs, rhs } => Self::Binary {
                op: *op,
                lhs: lhs.clone(),
                rhs: rhs.clone(),
            },
            Self::Call { func, args } => Self::Call {
                func: func.clone(),
                args: args.clone(),
            },
            Self::Stencil { stencil, x } => Self::Stencil {
                stencil: stencil.clone(),
                x: x.clone(),
            },
            Self::Csr { matrix, x } => Self::Csr {
                matrix: matrix.clone(),
                x: x.clone(),
            },
            Self::Ccsr { matrix, x } => Self::Ccsr {
                matrix: matrix.clone(),
                x: x.clone(),
            },
            Self::Random { kind, seed, index } => Self::Random {
                kind: *kind,
                seed: *seed,
                index: *index,
            },
        }
    }
}

impl<T: DType> Expr<T> {
    pub fn scalar(v: T) -> Self {
        Self::Scalar(v)
    }

    pub fn index(index: ElementIndex) -> Self {
        Self::Index(index)
    }

    pub(crate) fn binary(op: BinaryOpType, lhs: Self, rhs: Self) -> Self {
        Self::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    fn unary(self, op: UnaryOpType) -> Self {
        Self::Unary {
            op,
            arg: Box::new(self),
        }
    }

    /// Attach `tag` so every occurrence of it in one tree is evaluated once.
    pub fn tagged(self, tag: Tag) -> Self {
        Self::Tagged {
            tag,
            inner: Box::new(self),
        }
    }

    pub fn sqrt(self) -> Self {
        self.unary(UnaryOpType::Sqrt)
    }

    pub fn abs(self) -> Self {
        self.unary(UnaryOpType::Abs)
    }

    pub fn exp(self) -> Self {
        self.unary(UnaryOpType::Exp)
    }

    pub fn ln(self) -> Self {
        self.unary(UnaryOpType::Log)
    }

    pub fn sin(self) -> Self {
        self.unary(UnaryOpType::Sin)
    }

    pub fn cos(self) -> Self {
        self.unary(UnaryOpType::Cos)
    }

    pub fn tanh(self) -> Self {
        self.unary(UnaryOpType::Tanh)
    }

    pub fn min(self, rhs: impl Into<Expr<T>>) -> Self {
        Self::binary(BinaryOpType::Min, self, rhs.into())
    }

    pub fn max(self, rhs: impl Into<Expr<T>>) -> Self {
        Self::binary(BinaryOpType::Max, self, rhs.into())
    }

    pub fn pow(self, rhs: impl Into<Expr<T>>) -> Self {
        Self::binary(BinaryOpType::Pow, self, rhs.into())
    }

    /// Pre-order visit of every node.
    pub(crate) fn visit(&self, f: &mut impl FnMut(&Self)) {
        f(self);
        match self {
            Self::Tagged { inner, .. } => inner.visit(f),
            Self::Unary { arg, .. } => arg.visit(f),
            Self::Binary { lhs, rhs, .. } => {
                lhs.visit(f);
                rhs.visit(f);
            }
            Self::Call { args, .. } => args.iter().for_each(|a| a.visit(f)),
            Self::Vector(_)
            | Self::Scalar(_)
            | Self::Index(_)
            | Self::Stencil { .. }
            | Self::Csr { .. }
            | Self::Ccsr { .. }
            | Self::Random { .. } => {}
        }
    }

    /// Row layout implied by the first operand that has one.
    pub(crate) fn layout(&self) -> Option<Arc<Layout>> {
        let mut found = None;
        self.visit(&mut |node| {
            if found.is_some() {
                return;
            }
            found = match node {
                Self::Vector(v) => Some(v.layout.clone()),
                Self::Stencil { x, .. } => Some(x.layout.clone()),
                Self::Csr { matrix, .. } => Some(matrix.layout()),
                Self::Ccsr { matrix, .. } => Some(matrix.layout()),
                _ => None,
            };
        });
        found
    }

    /// Length requested by an element index, when there is one.
    pub(crate) fn index_len(&self) -> Option<usize> {
        let mut found = None;
        self.visit(&mut |node| match node {
            Self::Index(index) | Self::Random { index, .. } if found.is_none() => {
                found = index.len;
            }
            _ => {}
        });
        found
    }

    /// Whether vector `id` is read at positions other than the element being written.
    pub(crate) fn gathers_from(&self, id: u64) -> bool {
        let mut hit = false;
        self.visit(&mut |node| match node {
            Self::Stencil { x, .. } | Self::Csr { x, .. } | Self::Ccsr { x, .. } => {
                hit |= x.id == id
            }
            _ => {}
        });
        hit
    }
}

impl<T: DType> From<T> for Expr<T> {
    fn from(v: T) -> Self {
        Self::Scalar(v)
    }
}

impl<T: DType> From<&Vector<T>> for Expr<T> {
    fn from(v: &Vector<T>) -> Self {
        v.expr()
    }
}

impl<T: DType> From<ElementIndex> for Expr<T> {
    fn from(index: ElementIndex) -> Self {
        Self::Index(index)
    }
}

pub fn min<T: DType>(lhs: impl Into<Expr<T>>, rhs: impl Into<Expr<T>>) -> Expr<T> {
    lhs.into().min(rhs)
}

pub fn max<T: DType>(lhs: impl Into<Expr<T>>, rhs: impl Into<Expr<T>>) -> Expr<T> {
    lhs.into().max(rhs)
}

pub fn pow<T: DType>(lhs: impl Into<Expr<T>>, rhs: impl Into<Expr<T>>) -> Expr<T> {
    lhs.into().pow(rhs)
}
