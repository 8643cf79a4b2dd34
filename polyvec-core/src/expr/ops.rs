use std::ops::{Add, Div, Mul, Neg, Sub};

use super::{BinaryOpType, Expr, UnaryOpType};
use crate::{DType, Vector};

macro_rules! binary_op {
    ($trait:ident, $fn:ident, $op:ident) => {
        impl<T: DType> $trait<Expr<T>> for Expr<T> {
            type Output = Expr<T>;
            fn $fn(self, rhs: Expr<T>) -> Expr<T> {
                Expr::binary(BinaryOpType::$op, self, rhs)
            }
        }

        impl<T: DType> $trait<T> for Expr<T> {
            type Output = Expr<T>;
            fn $fn(self, rhs: T) -> Expr<T> {
                Expr::binary(BinaryOpType::$op, self, Expr::Scalar(rhs))
            }
        }

        impl<'a, T: DType> $trait<&'a Vector<T>> for Expr<T> {
            type Output = Expr<T>;
            fn $fn(self, rhs: &'a Vector<T>) -> Expr<T> {
                Expr::binary(BinaryOpType::$op, self, rhs.expr())
            }
        }

        impl<'a, T: DType> $trait<Expr<T>> for &'a Vector<T> {
            type Output = Expr<T>;
            fn $fn(self, rhs: Expr<T>) -> Expr<T> {
                Expr::binary(BinaryOpType::$op, self.expr(), rhs)
            }
        }

        impl<'a, 'b, T: DType> $trait<&'b Vector<T>> for &'a Vector<T> {
            type Output = Expr<T>;
            fn $fn(self, rhs: &'b Vector<T>) -> Expr<T> {
                Expr::binary(BinaryOpType::$op, self.expr(), rhs.expr())
            }
        }

        impl<'a, T: DType> $trait<T> for &'a Vector<T> {
            type Output = Expr<T>;
            fn $fn(self, rhs: T) -> Expr<T> {
                Expr::binary(BinaryOpType::$op, self.expr(), Expr::Scalar(rhs))
            }
        }
    };
}

binary_op!(Add, add, Add);
binary_op!(Sub, sub, Sub);
binary_op!(Mul, mul, Mul);
binary_op!(Div, div, Div);

impl<T: DType> Neg for Expr<T> {
    type Output = Expr<T>;
    fn neg(self) -> Expr<T> {
        Expr::Unary {
            op: UnaryOpType::Neg,
            arg: Box::new(self),
        }
    }
}

impl<T: DType> Neg for &Vector<T> {
    type Output = Expr<T>;
    fn neg(self) -> Expr<T> {
        -self.expr()
    }
}

// Scalars on the left need one impl per concrete type.
macro_rules! scalar_lhs {
    (@impl $rt:ty, $trait:ident, $fn:ident, $op:ident) => {
        impl $trait<Expr<$rt>> for $rt {
            type Output = Expr<$rt>;
            fn $fn(self, rhs: Expr<$rt>) -> Expr<$rt> {
                Expr::binary(BinaryOpType::$op, Expr::Scalar(self), rhs)
            }
        }

        impl<'a> $trait<&'a Vector<$rt>> for $rt {
            type Output = Expr<$rt>;
            fn $fn(self, rhs: &'a Vector<$rt>) -> Expr<$rt> {
                Expr::binary(BinaryOpType::$op, Expr::Scalar(self), rhs.expr())
            }
        }
    };
    ($($rt:ty),*) => {
        $(
            scalar_lhs!(@impl $rt, Add, add, Add);
            scalar_lhs!(@impl $rt, Sub, sub, Sub);
            scalar_lhs!(@impl $rt, Mul, mul, Mul);
            scalar_lhs!(@impl $rt, Div, div, Div);
        )*
    };
}

scalar_lhs!(u32, i32, u64, i64, f32, f64);
