use polyvec_core::{
    Backend, CompactSparseMatrix, Context, Error, Filter, SparseMatrix, Stencil, Vector,
};

fn host_context(devices: usize) -> Context {
    Context::builder()
        .filter(Filter::backend(Backend::Cpu))
        .host_devices(devices)
        .host_threads(2)
        .build()
        .unwrap()
}

struct Csr {
    n: usize,
    row: Vec<usize>,
    col: Vec<usize>,
    val: Vec<f64>,
}

impl Csr {
    fn spmv(&self, x: &[f64]) -> Vec<f64> {
        (0..self.n)
            .map(|i| {
                (self.row[i]..self.row[i + 1])
                    .map(|j| self.val[j] * x[self.col[j]])
                    .sum()
            })
            .collect()
    }
}

/// 7-point Laplacian on an `m`^3 grid.
fn poisson3d(m: usize) -> Csr {
    let n = m * m * m;
    let h2i = ((m - 1) * (m - 1)) as f64;
    let mut row = vec![0];
    let mut col = Vec::new();
    let mut val = Vec::new();
    for k in 0..m {
        for j in 0..m {
            for i in 0..m {
                let idx = k * m * m + j * m + i;
                let boundary = [i, j, k].iter().any(|&c| c == 0 || c == m - 1);
                if boundary {
                    col.push(idx);
                    val.push(1.0);
                } else {
                    for (offset, w) in [
                        (-((m * m) as isize), -h2i),
                        (-(m as isize), -h2i),
                        (-1, -h2i),
                        (0, 6.0 * h2i),
                        (1, -h2i),
                        (m as isize, -h2i),
                        ((m * m) as isize, -h2i),
                    ] {
                        col.push((idx as isize + offset) as usize);
                        val.push(w);
                    }
                }
                row.push(col.len());
            }
        }
    }
    Csr { n, row, col, val }
}

/// Host reference of a stencil with clamped boundaries.
fn convolve(weights: &[f64], center: usize, x: &[f64]) -> Vec<f64> {
    let n = x.len() as isize;
    (0..n)
        .map(|i| {
            weights
                .iter()
                .enumerate()
                .map(|(j, w)| {
                    let g = (i - center as isize + j as isize).clamp(0, n - 1);
                    w * x[g as usize]
                })
                .sum()
        })
        .collect()
}

fn assert_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= 1e-9 * e.abs().max(1.0), "{i}: {a} != {e}");
    }
}

macro_rules! test_for_devices {
    ($devices:expr, $name:ident) => {
        mod $name {
            use super::*;

            fn ctx() -> Context {
                host_context($devices)
            }

            #[test]
            fn symmetric_stencil() {
                let ctx = ctx();
                let data: Vec<f64> = (0..97).map(|i| ((i * 37) % 11) as f64).collect();
                let x = Vector::from_slice(&ctx, &data).unwrap();
                let mut y = Vector::<f64>::new(&ctx, data.len()).unwrap();
                let s = Stencil::new(&ctx, &[1.0, -2.0, 1.0], 1).unwrap();
                y.assign(&x * &s).unwrap();
                assert_close(&y.to_vec().unwrap(), &convolve(&[1.0, -2.0, 1.0], 1, &data));
            }

            #[test]
            fn lopsided_stencil() {
                let ctx = ctx();
                let data: Vec<f64> = (0..50).map(|i| (i * i) as f64).collect();
                let weights = [0.5, 1.0, 2.0, 4.0, 8.0];
                let x = Vector::from_slice(&ctx, &data).unwrap();
                let mut y = Vector::<f64>::new(&ctx, data.len()).unwrap();
                let s = Stencil::new(&ctx, &weights, 3).unwrap();
                y.assign(s.apply(&x) + &x).unwrap();
                let expected: Vec<f64> = convolve(&weights, 3, &data)
                    .into_iter()
                    .zip(&data)
                    .map(|(a, b)| a + b)
                    .collect();
                assert_close(&y.to_vec().unwrap(), &expected);
            }

            #[test]
            fn stencil_in_place() {
                let ctx = ctx();
                let data: Vec<f64> = (0..20).map(|i| i as f64).collect();
                let mut x = Vector::from_slice(&ctx, &data).unwrap();
                let s = Stencil::new(&ctx, &[1.0, 1.0, 1.0], 1).unwrap();
                x.assign(&x * &s).unwrap();
                assert_close(&x.to_vec().unwrap(), &convolve(&[1.0, 1.0, 1.0], 1, &data));
            }

            #[test]
            fn poisson_spmv() {
                let ctx = ctx();
                let a = poisson3d(6);
                let data: Vec<f64> = (0..a.n).map(|i| (i % 13) as f64 - 6.0).collect();
                let matrix =
                    SparseMatrix::new(&ctx, a.n, a.n, &a.row, &a.col, &a.val).unwrap();
                assert_eq!(matrix.nnz(), a.val.len());

                let x = Vector::from_slice(&ctx, &data).unwrap();
                let mut y = Vector::<f64>::new(&ctx, a.n).unwrap();
                y.assign(&matrix * &x).unwrap();
                assert_close(&y.to_vec().unwrap(), &a.spmv(&data));

                // Residual r = b - A x, fused into one kernel.
                let b = Vector::from_slice(&ctx, &vec![1.0; a.n]).unwrap();
                let mut r = Vector::<f64>::new(&ctx, a.n).unwrap();
                r.assign(&b - matrix.apply(&x)).unwrap();
                let expected: Vec<f64> = a.spmv(&data).iter().map(|v| 1.0 - v).collect();
                assert_close(&r.to_vec().unwrap(), &expected);
            }

            #[test]
            fn spmv_in_place() {
                let ctx = ctx();
                let a = poisson3d(4);
                let data: Vec<f64> = (0..a.n).map(|i| i as f64).collect();
                let matrix =
                    SparseMatrix::new(&ctx, a.n, a.n, &a.row, &a.col, &a.val).unwrap();
                let mut x = Vector::from_slice(&ctx, &data).unwrap();
                x.assign(matrix.apply(&x)).unwrap();
                assert_close(&x.to_vec().unwrap(), &a.spmv(&data));
            }

            #[test]
            fn compact_matrix_matches_csr() {
                let ctx = ctx();
                let q = ctx.queue(0).unwrap();
                let n = 40;
                // Pattern 0 is the identity at the ends, pattern 1 the interior [-1, 2, -1].
                let idx: Vec<usize> = (0..n).map(|i| usize::from(i != 0 && i != n - 1)).collect();
                let matrix = CompactSparseMatrix::new(
                    q,
                    n,
                    2,
                    &idx,
                    &[0, 1, 4],
                    &[0, -1, 0, 1],
                    &[1.0, -1.0, 2.0, -1.0],
                )
                .unwrap();
                assert_eq!(matrix.rows(), n);

                let mut row = vec![0];
                let mut col = Vec::new();
                let mut val = Vec::new();
                for i in 0..n {
                    if idx[i] == 0 {
                        col.push(i);
                        val.push(1.0);
                    } else {
                        col.extend([i - 1, i, i + 1]);
                        val.extend([-1.0, 2.0, -1.0]);
                    }
                    row.push(col.len());
                }
                let reference = Csr { n, row, col, val };

                let data: Vec<f64> = (0..n).map(|i| (i * i % 7) as f64).collect();
                let x = Vector::from_slice(q, &data).unwrap();
                let mut y = Vector::<f64>::new(q, n).unwrap();
                y.assign(&matrix * &x).unwrap();
                assert_close(&y.to_vec().unwrap(), &reference.spmv(&data));
            }
        }
    };
}

test_for_devices!(1, one_device);
test_for_devices!(2, two_devices);
test_for_devices!(3, three_devices);

#[test]
fn distant_columns_are_gathered() {
    // Row 0 reads the last element and the last row reads the first.
    let n = 12;
    let row: Vec<usize> = (0..=n).map(|i| i * 2).collect();
    let mut col = Vec::new();
    for i in 0..n {
        col.push(i);
        col.push(match i {
            0 => n - 1,
            i if i == n - 1 => 0,
            i => (i + 5) % n,
        });
    }
    let val: Vec<f64> = (0..2 * n).map(|j| 1.0 + j as f64).collect();
    let reference = Csr {
        n,
        row: row.clone(),
        col: col.clone(),
        val: val.clone(),
    };
    let data: Vec<f64> = (0..n).map(|i| 10.0 * i as f64).collect();

    for devices in 1..=4 {
        let ctx = host_context(devices);
        let matrix = SparseMatrix::new(&ctx, n, n, &row, &col, &val).unwrap();
        if devices > 1 {
            assert!(matrix.dependencies().contains(&(devices - 1, 0)));
            assert!(matrix.dependencies().contains(&(0, devices - 1)));
        } else {
            assert!(matrix.dependencies().is_empty());
        }
        let x = Vector::from_slice(&ctx, &data).unwrap();
        let mut y = Vector::<f64>::new(&ctx, n).unwrap();
        y.assign(&matrix * &x).unwrap();
        assert_close(&y.to_vec().unwrap(), &reference.spmv(&data));
    }
}

#[test]
fn malformed_stencils_are_rejected() {
    let ctx = host_context(2);
    assert!(matches!(
        Stencil::<f32>::new(&ctx, &[], 0),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        Stencil::new(&ctx, &[1.0f32, 2.0], 2),
        Err(Error::InvalidArgument(_))
    ));
}
