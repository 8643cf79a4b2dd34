//! Counter-based random numbers.
//!
//! Element `i` of a random sequence is a pure function of the generator family, the seed
//! and `i`, so sequences are reproducible across devices and partitionings. Both families
//! are implemented here on the host and rendered into device code by the kernel generator;
//! the two produce identical bits.

use std::marker::PhantomData;

use crate::{
    expr::{ElementIndex, Expr},
    DType,
};

const PHILOX_M0: u32 = 0xD251_1F53;
const PHILOX_M1: u32 = 0xCD9E_8D57;
const PHILOX_W0: u32 = 0x9E37_79B9;
const PHILOX_W1: u32 = 0xBB67_AE85;

const SKEIN_PARITY: u32 = 0x1BD1_1BDA;
const THREEFRY_ROTATIONS: [[u32; 2]; 8] = [
    [10, 26],
    [11, 21],
    [13, 27],
    [23, 5],
    [6, 20],
    [17, 11],
    [25, 10],
    [18, 20],
];

/// Philox-4x32 with 10 rounds.
pub fn philox4x32_10(ctr: [u32; 4], key: [u32; 2]) -> [u32; 4] {
    let [mut x0, mut x1, mut x2, mut x3] = ctr;
    let [mut k0, mut k1] = key;
    for round in 0..10 {
        if round > 0 {
            k0 = k0.wrapping_add(PHILOX_W0);
            k1 = k1.wrapping_add(PHILOX_W1);
        }
        let p0 = PHILOX_M0 as u64 * x0 as u64;
        let p1 = PHILOX_M1 as u64 * x2 as u64;
        let y0 = (p1 >> 32) as u32 ^ x1 ^ k0;
        let y2 = (p0 >> 32) as u32 ^ x3 ^ k1;
        x1 = p1 as u32;
        x3 = p0 as u32;
        x0 = y0;
        x2 = y2;
    }
    [x0, x1, x2, x3]
}

/// Threefry-4x32 with 20 rounds and the Skein key schedule.
pub fn threefry4x32_20(ctr: [u32; 4], key: [u32; 4]) -> [u32; 4] {
    let ks = [
        key[0],
        key[1],
        key[2],
        key[3],
        SKEIN_PARITY ^ key[0] ^ key[1] ^ key[2] ^ key[3],
    ];
    let mut x = [
        ctr[0].wrapping_add(ks[0]),
        ctr[1].wrapping_add(ks[1]),
        ctr[2].wrapping_add(ks[2]),
        ctr[3].wrapping_add(ks[3]),
    ];
    for round in 0..20u32 {
        let [r0, r1] = THREEFRY_ROTATIONS[round as usize % 8];
        if round % 2 == 0 {
            x[0] = x[0].wrapping_add(x[1]);
            x[1] = x[1].rotate_left(r0) ^ x[0];
            x[2] = x[2].wrapping_add(x[3]);
            x[3] = x[3].rotate_left(r1) ^ x[2];
        } else {
            x[0] = x[0].wrapping_add(x[3]);
            x[3] = x[3].rotate_left(r0) ^ x[0];
            x[2] = x[2].wrapping_add(x[1]);
            x[1] = x[1].rotate_left(r1) ^ x[2];
        }
        if round % 4 == 3 {
            let s = (round + 1) / 4;
            for (k, xk) in x.iter_mut().enumerate() {
                *xk = xk.wrapping_add(ks[(s as usize + k) % 5]);
            }
            x[3] = x[3].wrapping_add(s);
        }
    }
    x
}

/// Generator family of a random node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RandomKind {
    Philox,
    Threefry,
}

impl RandomKind {
    pub(crate) fn c_name(&self) -> &'static str {
        match self {
            Self::Philox => "philox",
            Self::Threefry => "threefry",
        }
    }

    /// The four output words for counter `ctr` under `seed`.
    pub fn words(&self, ctr: u64, seed: u64) -> [u32; 4] {
        let ctr = [ctr as u32, (ctr >> 32) as u32, 0, 0];
        match self {
            Self::Philox => philox4x32_10(ctr, [seed as u32, (seed >> 32) as u32]),
            Self::Threefry => threefry4x32_20(ctr, [seed as u32, (seed >> 32) as u32, 0, 0]),
        }
    }
}

mod private {
    pub trait Sealed {}
}

/// Marker for a generator family.
pub trait RandomFamily: private::Sealed {
    const KIND: RandomKind;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Philox;

#[derive(Debug, Clone, Copy, Default)]
pub struct Threefry;

impl private::Sealed for Philox {}
impl private::Sealed for Threefry {}

impl RandomFamily for Philox {
    const KIND: RandomKind = RandomKind::Philox;
}

impl RandomFamily for Threefry {
    const KIND: RandomKind = RandomKind::Threefry;
}

/// Uniform random values of type `T`, usable as an expression operand.
///
/// Floating point values lie in `[0, 1)`; integers take the raw generator bits.
///
/// ```
/// use polyvec_core::{element_index, Context, Philox, Random, Reductor, Vector};
///
/// let ctx = Context::builder().host_devices(2).build().unwrap();
/// let mut x = Vector::<f64>::new(&ctx, 1000).unwrap();
/// let rnd = Random::<f64, Philox>::new();
/// x.assign(rnd.call(element_index(0, 1000), 42)).unwrap();
///
/// let max = Reductor::<f64, polyvec_core::Max>::new(&ctx).unwrap();
/// assert!(max.reduce(&x).unwrap() < 1.0);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Random<T: DType, F: RandomFamily = Philox> {
    _marker: PhantomData<(T, F)>,
}

impl<T: DType, F: RandomFamily> Default for Random<T, F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DType, F: RandomFamily> Random<T, F> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    /// The value at counter `index + i` for element `i` of the assignment target.
    pub fn call(&self, index: ElementIndex, seed: u64) -> Expr<T> {
        Expr::Random {
            kind: F::KIND,
            seed,
            index,
        }
    }

    /// The value at counter `ctr`, computed on the host.
    pub fn value(&self, ctr: u64, seed: u64) -> T {
        let w = F::KIND.words(ctr, seed);
        T::from_words(w[0], w[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn philox_known_answers() {
        assert_eq!(
            philox4x32_10([0; 4], [0; 2]),
            [0x6627e8d5, 0xe169c58d, 0xbc57ac4c, 0x9b00dbd8]
        );
        assert_eq!(
            philox4x32_10([u32::MAX; 4], [u32::MAX; 2]),
            [0x408f276d, 0x41c83b0e, 0xa20bc7c6, 0x6d5451fd]
        );
    }

    #[test]
    fn threefry_known_answer() {
        assert_eq!(
            threefry4x32_20([0; 4], [0; 4]),
            [0x9c6ca96a, 0xe17eae66, 0xfc10ecd4, 0x5256a7d8]
        );
    }

    #[test]
    fn floats_are_in_unit_interval() {
        let rnd = Random::<f32, Threefry>::new();
        let rnd64 = Random::<f64, Philox>::new();
        for i in 0..1000 {
            let v = rnd.value(i, 7);
            assert!((0.0..1.0).contains(&v));
            let v = rnd64.value(i, 7);
            assert!((0.0..1.0).contains(&v));
        }
        assert_eq!(rnd.value(3, 7), rnd.value(3, 7));
        assert_ne!(rnd.value(3, 7), rnd.value(3, 8));
    }
}
