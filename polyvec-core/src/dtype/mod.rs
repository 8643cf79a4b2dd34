use std::fmt::Debug;

#[cfg(feature = "cuda")]
use cudarc::driver::{DeviceRepr, ValidAsZeroBits};

use crate::expr::{BinaryOpType, UnaryOpType};

/// Element-wise arithmetic shared by the host evaluator and the reference paths.
///
/// Integer arithmetic wraps and division by zero yields zero, matching the generated
/// device code. Transcendental functions go through `f64` on every backend.
pub trait DTypeOps: Copy {
    fn binary(op: BinaryOpType, lhs: Self, rhs: Self) -> Self;
    fn unary(op: UnaryOpType, x: Self) -> Self;
}

macro_rules! float_ops {
    ($rt:ident) => {
        impl DTypeOps for $rt {
            #[inline]
            fn binary(op: BinaryOpType, lhs: Self, rhs: Self) -> Self {
                match op {
                    BinaryOpType::Add => lhs + rhs,
                    BinaryOpType::Sub => lhs - rhs,
                    BinaryOpType::Mul => lhs * rhs,
                    BinaryOpType::Div => lhs / rhs,
                    BinaryOpType::Min => {
                        if rhs < lhs {
                            rhs
                        } else {
                            lhs
                        }
                    }
                    BinaryOpType::Max => {
                        if rhs > lhs {
                            rhs
                        } else {
                            lhs
                        }
                    }
                    BinaryOpType::Pow => (lhs as f64).powf(rhs as f64) as $rt,
                }
            }

            #[inline]
            fn unary(op: UnaryOpType, x: Self) -> Self {
                match op {
                    UnaryOpType::Neg => -x,
                    UnaryOpType::Abs => x.abs(),
                    UnaryOpType::Sqrt => (x as f64).sqrt() as $rt,
                    UnaryOpType::Exp => (x as f64).exp() as $rt,
                    UnaryOpType::Log => (x as f64).ln() as $rt,
                    UnaryOpType::Sin => (x as f64).sin() as $rt,
                    UnaryOpType::Cos => (x as f64).cos() as $rt,
                    UnaryOpType::Tanh => (x as f64).tanh() as $rt,
                }
            }
        }
    };
}

macro_rules! integral_ops {
    ($rt:ident, $abs:expr) => {
        impl DTypeOps for $rt {
            #[inline]
            fn binary(op: BinaryOpType, lhs: Self, rhs: Self) -> Self {
                match op {
                    BinaryOpType::Add => lhs.wrapping_add(rhs),
                    BinaryOpType::Sub => lhs.wrapping_sub(rhs),
                    BinaryOpType::Mul => lhs.wrapping_mul(rhs),
                    BinaryOpType::Div => {
                        if rhs == 0 {
                            0
                        } else {
                            lhs.wrapping_div(rhs)
                        }
                    }
                    BinaryOpType::Min => lhs.min(rhs),
                    BinaryOpType::Max => lhs.max(rhs),
                    BinaryOpType::Pow => (lhs as f64).powf(rhs as f64) as $rt,
                }
            }

            #[inline]
            fn unary(op: UnaryOpType, x: Self) -> Self {
                match op {
                    UnaryOpType::Neg => x.wrapping_neg(),
                    UnaryOpType::Abs => $abs(x),
                    UnaryOpType::Sqrt => (x as f64).sqrt() as $rt,
                    UnaryOpType::Exp => (x as f64).exp() as $rt,
                    UnaryOpType::Log => (x as f64).ln() as $rt,
                    UnaryOpType::Sin => (x as f64).sin() as $rt,
                    UnaryOpType::Cos => (x as f64).cos() as $rt,
                    UnaryOpType::Tanh => (x as f64).tanh() as $rt,
                }
            }
        }
    };
}

float_ops!(f32);
float_ops!(f64);
integral_ops!(u32, |x: u32| x);
integral_ops!(u64, |x: u64| x);
integral_ops!(i32, |x: i32| x.wrapping_abs());
integral_ops!(i64, |x: i64| x.wrapping_abs());

#[cfg(feature = "cuda")]
pub trait DeviceReprLike: DeviceRepr + ValidAsZeroBits + Unpin {}

#[cfg(not(feature = "cuda"))]
pub trait DeviceReprLike {}

impl DeviceReprLike for u32 {}
impl DeviceReprLike for u64 {}
impl DeviceReprLike for i32 {}
impl DeviceReprLike for i64 {}
impl DeviceReprLike for f32 {}
impl DeviceReprLike for f64 {}

/// Marker trait for vector element types.
pub trait DType:
    Debug + Default + PartialOrd + DTypeOps + Send + Sync + DeviceReprLike + 'static
{
    const ZERO: Self;
    const ONE: Self;
    /// Smallest representable value, the identity of `max`.
    const LOWEST: Self;
    /// Largest representable value, the identity of `min`.
    const HIGHEST: Self;
    const NAME: &'static str;
    const C_NAME: &'static str;
    const INTEGRAL: bool;
    const SIGNED: bool;
    /// C expression converting the random words `w0`, `w1` into a value.
    const C_FROM_WORDS: &'static str;

    fn to_f64(&self) -> f64;
    fn from_f64(x: f64) -> Self;
    fn from_index(i: i64) -> Self;
    fn from_words(w0: u32, w1: u32) -> Self;
}

macro_rules! dtype {
    ($rt:ident, $zero:expr, $one:expr, $lowest:expr, $highest:expr, $c_repr:expr, $integral:expr, $signed:expr, $c_words:expr, $words:expr) => {
        impl DType for $rt {
            const ZERO: $rt = $zero;
            const ONE: $rt = $one;
            const LOWEST: $rt = $lowest;
            const HIGHEST: $rt = $highest;
            const NAME: &'static str = stringify!($rt);
            const C_NAME: &'static str = $c_repr;
            const INTEGRAL: bool = $integral;
            const SIGNED: bool = $signed;
            const C_FROM_WORDS: &'static str = $c_words;

            fn to_f64(&self) -> f64 {
                *self as f64
            }
            fn from_f64(x: f64) -> Self {
                x as $rt
            }
            fn from_index(i: i64) -> Self {
                i as $rt
            }
            fn from_words(w0: u32, w1: u32) -> Self {
                $words(w0, w1)
            }
        }
    };
}

fn join_words(w0: u32, w1: u32) -> u64 {
    ((w1 as u64) << 32) | w0 as u64
}

dtype!(
    u32,
    0u32,
    1u32,
    u32::MIN,
    u32::MAX,
    "uint32_t",
    true,
    false,
    "w0",
    |w0: u32, _w1: u32| w0
);
dtype!(
    i32,
    0i32,
    1i32,
    i32::MIN,
    i32::MAX,
    "int32_t",
    true,
    true,
    "(int32_t)w0",
    |w0: u32, _w1: u32| w0 as i32
);
dtype!(
    u64,
    0u64,
    1u64,
    u64::MIN,
    u64::MAX,
    "uint64_t",
    true,
    false,
    "((((uint64_t)w1) << 32) | (uint64_t)w0)",
    join_words
);
dtype!(
    i64,
    0i64,
    1i64,
    i64::MIN,
    i64::MAX,
    "int64_t",
    true,
    true,
    "(int64_t)((((uint64_t)w1) << 32) | (uint64_t)w0)",
    |w0: u32, w1: u32| join_words(w0, w1) as i64
);
dtype!(
    f32,
    0f32,
    1f32,
    f32::NEG_INFINITY,
    f32::INFINITY,
    "float",
    false,
    true,
    "((float)(w0 >> 8) * 5.9604644775390625e-8f)",
    |w0: u32, _w1: u32| (w0 >> 8) as f32 * (1.0 / 16_777_216.0)
);
dtype!(
    f64,
    0f64,
    1f64,
    f64::NEG_INFINITY,
    f64::INFINITY,
    "double",
    false,
    true,
    "((double)(((((uint64_t)w1) << 32) | (uint64_t)w0) >> 11) * 1.1102230246251565e-16)",
    |w0: u32, w1: u32| (join_words(w0, w1) >> 11) as f64 * (1.0 / 9_007_199_254_740_992.0)
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_division_by_zero_is_zero() {
        assert_eq!(i32::binary(BinaryOpType::Div, 7, 0), 0);
        assert_eq!(u64::binary(BinaryOpType::Div, 7, 0), 0);
        assert_eq!(i32::binary(BinaryOpType::Div, i32::MIN, -1), i32::MIN);
    }

    #[test]
    fn random_words_map_into_unit_interval() {
        assert_eq!(f32::from_words(0, 0), 0.0);
        assert!(f32::from_words(u32::MAX, u32::MAX) < 1.0);
        assert!(f64::from_words(u32::MAX, u32::MAX) < 1.0);
        assert_eq!(u64::from_words(1, 2), (2u64 << 32) | 1);
    }
}
