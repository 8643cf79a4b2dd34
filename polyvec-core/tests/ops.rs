use std::sync::Arc;

use polyvec_core::{
    element_index, max, Backend, Context, Error, Expr, Filter, Max, Min, Philox, Queue, Random,
    Reductor, Sum, Tag, Threefry, UserFunction, Vector, VectorData,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn host_context(devices: usize) -> Context {
    Context::builder()
        .filter(Filter::backend(Backend::Cpu))
        .host_devices(devices)
        .host_threads(2)
        .build()
        .unwrap()
}

fn random_f32(n: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.gen::<f32>()).collect()
}

fn relative_error(value: f64, expected: f64) -> f64 {
    ((value - expected) / expected).abs()
}

macro_rules! test_for_devices {
    ($devices:expr, $name:ident) => {
        mod $name {
            use super::*;

            fn ctx() -> Context {
                host_context($devices)
            }

            #[test]
            fn partitions_cover_the_vector() {
                let ctx = ctx();
                let x = Vector::<f32>::new(&ctx, 10).unwrap();
                assert_eq!(x.partitions().len(), $devices);
                assert_eq!(x.partitions().iter().map(|p| p.len()).sum::<usize>(), 10);
                assert_eq!(x.partitions()[0].range().start, 0);
                assert_eq!(x.partitions().last().unwrap().range().end, 10);
            }

            #[test]
            fn fused_arithmetic() {
                let ctx = ctx();
                let n = 1000;
                let a: Vec<f64> = (0..n).map(|i| i as f64).collect();
                let b: Vec<f64> = (0..n).map(|i| (n - i) as f64 * 0.5).collect();
                let x = Vector::from_slice(&ctx, &a).unwrap();
                let y = Vector::from_slice(&ctx, &b).unwrap();
                let mut z = Vector::<f64>::new(&ctx, n).unwrap();

                z.assign((&x + &y) * 2.0 - &x / 4.0).unwrap();
                let expected: Vec<f64> = a
                    .iter()
                    .zip(&b)
                    .map(|(a, b)| (a + b) * 2.0 - a / 4.0)
                    .collect();
                assert_eq!(z.to_vec().unwrap(), expected);
            }

            #[test]
            fn compound_assignment() {
                let ctx = ctx();
                let mut x = Vector::from_slice(&ctx, &[1i32, 2, 3, 4, 5, 6, 7]).unwrap();
                x.assign_add(10).unwrap();
                assert_eq!(x.to_vec().unwrap(), vec![11, 12, 13, 14, 15, 16, 17]);
                x.assign_sub(1).unwrap();
                x.assign_mul(2).unwrap();
                assert_eq!(x.to_vec().unwrap(), vec![20, 22, 24, 26, 28, 30, 32]);
                x.assign_div(4).unwrap();
                assert_eq!(x.to_vec().unwrap(), vec![5, 5, 6, 6, 7, 7, 8]);
            }

            #[test]
            fn unary_functions() {
                let ctx = ctx();
                let data = [-4.0f64, -1.0, 0.0, 2.25, 9.0];
                let x = Vector::from_slice(&ctx, &data).unwrap();
                let mut y = Vector::<f64>::new(&ctx, data.len()).unwrap();
                y.assign(x.expr().abs().sqrt() + max(&x, 0.0)).unwrap();
                let expected: Vec<f64> = data.iter().map(|v| v.abs().sqrt() + v.max(0.0)).collect();
                assert_eq!(y.to_vec().unwrap(), expected);

                y.assign(-&x).unwrap();
                assert_eq!(y.to_vec().unwrap(), vec![4.0, 1.0, -0.0, -2.25, -9.0]);
            }

            #[test]
            fn in_place_update_reads_old_values() {
                let ctx = ctx();
                let mut x = Vector::from_slice(&ctx, &[1.0f32, 2.0, 3.0, 4.0, 5.0]).unwrap();
                let y = x.try_clone().unwrap();
                x.assign(x.expr() * &y + 1.0).unwrap();
                assert_eq!(x.to_vec().unwrap(), vec![2.0, 5.0, 10.0, 17.0, 26.0]);
                assert_eq!(y.to_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
            }

            #[test]
            fn element_index_counts_from_the_offset() {
                let ctx = ctx();
                let mut x = Vector::<i64>::new(&ctx, 9).unwrap();
                x.assign(element_index(100, 9)).unwrap();
                assert_eq!(x.to_vec().unwrap(), (100..109).collect::<Vec<_>>());
            }

            #[test]
            fn tagged_terms_are_shared() {
                let ctx = ctx();
                let x = Vector::from_slice(&ctx, &[1.0f64, 2.0, 3.0]).unwrap();
                let mut y = Vector::<f64>::new(&ctx, 3).unwrap();
                let tag = Tag::new();
                let t = x.tagged(tag);
                y.assign(t.clone() * t + x.tagged(tag)).unwrap();
                assert_eq!(y.to_vec().unwrap(), vec![2.0, 6.0, 12.0]);
            }

            #[test]
            fn user_functions() {
                let ctx = ctx();
                let hypot = UserFunction::new(
                    "hypot2",
                    2,
                    "return sqrt(prm1 * prm1 + prm2 * prm2);",
                    |a: &[f64]| (a[0] * a[0] + a[1] * a[1]).sqrt(),
                );
                let x = Vector::from_slice(&ctx, &[3.0f64, 5.0, 8.0, 7.0]).unwrap();
                let y = Vector::from_slice(&ctx, &[4.0f64, 12.0, 15.0, 24.0]).unwrap();
                let mut z = Vector::<f64>::new(&ctx, 4).unwrap();
                z.assign(hypot.call([&x, &y])).unwrap();
                assert_eq!(z.to_vec().unwrap(), vec![5.0, 13.0, 17.0, 25.0]);
            }

            #[test]
            fn device_only_function_fails_on_host() {
                let ctx = ctx();
                let twice = UserFunction::<f32>::device_only("twice", 1, "return 2 * prm1;");
                let x = Vector::from_slice(&ctx, &[1.0f32, 2.0, 3.0]).unwrap();
                let mut y = Vector::<f32>::new(&ctx, 3).unwrap();
                let err = y.assign(twice.call([&x])).unwrap_err();
                assert!(matches!(err.root(), Error::Compile { .. }), "{err}");

                // The failed build leaves the context usable.
                y.assign(&x * 2.0).unwrap();
                assert_eq!(y.to_vec().unwrap(), vec![2.0, 4.0, 6.0]);
            }

            #[test]
            fn reductions() {
                let ctx = ctx();
                let data: Vec<i64> = (0..5000).map(|i| (i * 7919) % 1013 - 500).collect();
                let x = Vector::from_slice(&ctx, &data).unwrap();

                let sum = Reductor::<i64, Sum>::new(&ctx).unwrap();
                let min = Reductor::<i64, Min>::new(&ctx).unwrap();
                let max = Reductor::<i64, Max>::new(&ctx).unwrap();
                assert_eq!(sum.reduce(&x).unwrap(), data.iter().sum::<i64>());
                assert_eq!(min.reduce(&x).unwrap(), *data.iter().min().unwrap());
                assert_eq!(max.reduce(&x * 2).unwrap(), 2 * *data.iter().max().unwrap());
            }

            #[test]
            fn reduction_without_vectors() {
                let ctx = ctx();
                let sum = Reductor::<f64, Sum>::new(&ctx).unwrap();
                assert_eq!(sum.reduce(element_index(0, 100)).unwrap(), 4950.0);
            }

            #[test]
            fn empty_reduction_is_the_identity() {
                let ctx = ctx();
                let x = Vector::<f32>::new(&ctx, 0).unwrap();
                let sum = Reductor::<f32, Sum>::new(&ctx).unwrap();
                let max = Reductor::<f32, Max>::new(&ctx).unwrap();
                assert_eq!(sum.reduce(&x).unwrap(), 0.0);
                assert_eq!(max.reduce(&x).unwrap(), f32::NEG_INFINITY);
            }

            #[test]
            fn random_streams_are_reproducible() {
                let ctx = ctx();
                let n = 2048;
                let rnd = Random::<f64, Philox>::new();
                let mut x = Vector::<f64>::new(&ctx, n).unwrap();
                let mut y = Vector::<f64>::new(&ctx, n).unwrap();
                x.assign(rnd.call(element_index(0, n), 7)).unwrap();
                y.assign(rnd.call(element_index(0, n), 7)).unwrap();
                let xs = x.to_vec().unwrap();
                assert_eq!(xs, y.to_vec().unwrap());
                assert!(xs.iter().all(|v| (0.0..1.0).contains(v)));
                assert_eq!(xs[5], rnd.value(5, 7));

                y.assign(rnd.call(element_index(0, n), 8)).unwrap();
                assert_ne!(xs, y.to_vec().unwrap());

                let mean = Reductor::<f64, Sum>::new(&ctx).unwrap().reduce(&x).unwrap() / n as f64;
                assert!((mean - 0.5).abs() < 0.05, "{mean}");
            }

            #[test]
            fn threefry_matches_host_values() {
                let ctx = ctx();
                let rnd = Random::<f32, Threefry>::new();
                let mut x = Vector::<f32>::new(&ctx, 64).unwrap();
                x.assign(rnd.call(element_index(1000, 64), 3)).unwrap();
                let expected: Vec<f32> = (0..64).map(|i| rnd.value(1000 + i, 3)).collect();
                assert_eq!(x.to_vec().unwrap(), expected);
            }

            #[test]
            fn kernels_are_compiled_once() {
                let ctx = ctx();
                let x = Vector::from_slice(&ctx, &[1u32, 2, 3, 4, 5, 6]).unwrap();
                let mut y = Vector::<u32>::new(&ctx, 6).unwrap();
                y.assign(&x * 3 + 1).unwrap();
                let first = ctx.kernel_cache().stats();
                assert_eq!(first.compiled, $devices);

                y.assign(&x * 3 + 1).unwrap();
                let second = ctx.kernel_cache().stats();
                assert_eq!(second.compiled, first.compiled);
                assert!(second.hits > first.hits);
                assert_eq!(y.to_vec().unwrap(), vec![4, 7, 10, 13, 16, 19]);
            }

            #[test]
            fn mismatched_lengths_are_rejected() {
                let ctx = ctx();
                let x = Vector::<f32>::new(&ctx, 4).unwrap();
                let mut y = Vector::<f32>::new(&ctx, 5).unwrap();
                assert!(matches!(y.assign(&x), Err(Error::SizeMismatch(_))));
            }

            #[test]
            fn host_copies() {
                let ctx = ctx();
                let mut x = Vector::<u64>::new(&ctx, 5).unwrap();
                polyvec_core::copy_to_device(&[5, 4, 3, 2, 1], &mut x).unwrap();
                let mut out = [0u64; 5];
                polyvec_core::copy_to_host(&x, &mut out).unwrap();
                assert_eq!(out, [5, 4, 3, 2, 1]);
                assert_eq!(x.read(1..3).unwrap(), vec![4, 3]);
                assert!(x.read(4..6).is_err());
            }

            #[test]
            fn saxpy() {
                let ctx = ctx();
                let n = 1 << 14;
                let x = Vector::from_slice(&ctx, &vec![1.0f32; n]).unwrap();
                let mut y = Vector::from_slice(&ctx, &vec![2.0f32; n]).unwrap();
                y.assign_add(2.0f32 * &x).unwrap();
                assert!(y.to_vec().unwrap().iter().all(|v| *v == 4.0));
                let sum = Reductor::<f32, Sum>::new(&ctx).unwrap();
                assert_eq!(sum.reduce(&y).unwrap(), 4.0 * n as f32);
            }

            #[test]
            fn repeated_saxpy_matches_host() {
                let ctx = ctx();
                let n = 1 << 20;
                let iterations = 5;
                let alpha = 2.0f32;
                let b_host = random_f32(n, 17);
                let b = Vector::from_slice(&ctx, &b_host).unwrap();
                let mut a = Vector::<f32>::new(&ctx, n).unwrap();
                for _ in 0..iterations {
                    a.assign(alpha * &a + &b).unwrap();
                }

                let mut a_host = vec![0.0f32; n];
                for _ in 0..iterations {
                    for (a, b) in a_host.iter_mut().zip(&b_host) {
                        *a = alpha * *a + *b;
                    }
                }
                let expected: f64 = a_host
                    .iter()
                    .zip(&b_host)
                    .map(|(a, b)| {
                        let d = (a - b) as f64;
                        d * d
                    })
                    .sum();

                let sum = Reductor::<f32, Sum>::new(&ctx).unwrap();
                let residual = sum.reduce((&a - &b) * (&a - &b)).unwrap();
                assert!(
                    relative_error(residual as f64, expected) < 1e-4,
                    "{residual} vs {expected}"
                );
            }

            #[test]
            fn inner_product_matches_host() {
                let ctx = ctx();
                let n = 100_000;
                let xs = random_f32(n, 1);
                let ys = random_f32(n, 2);
                let x = Vector::from_slice(&ctx, &xs).unwrap();
                let y = Vector::from_slice(&ctx, &ys).unwrap();
                let expected: f64 = xs.iter().zip(&ys).map(|(a, b)| *a as f64 * *b as f64).sum();

                let dot = Reductor::<f32, Sum>::new(&ctx).unwrap().reduce(&x * &y).unwrap();
                assert!(
                    relative_error(dot as f64, expected) < 1e-5,
                    "{dot} vs {expected}"
                );
            }
        }
    };
}

test_for_devices!(1, one_device);
test_for_devices!(2, two_devices);
test_for_devices!(3, three_devices);

#[test]
fn no_queues_is_an_error() {
    let queues: Vec<Queue> = Vec::new();
    assert!(matches!(Vector::<f32>::new(&queues, 3), Err(Error::NoDevice)));
    assert!(matches!(
        Reductor::<f32, Sum>::new(&queues),
        Err(Error::NoDevice)
    ));
}

#[test]
fn filters_select_devices() {
    let ctx = Context::builder()
        .filter(Filter::backend(Backend::Cpu) & Filter::count(2))
        .host_devices(4)
        .host_threads(1)
        .build()
        .unwrap();
    assert_eq!(ctx.size(), 2);

    let err = Context::builder()
        .filter(Filter::vendor("nobody"))
        .host_devices(1)
        .build();
    assert!(matches!(err, Err(Error::NoDevice)));
}

#[test]
fn single_queue_subsets_of_a_context() {
    let ctx = host_context(3);
    let q = ctx.queue(1).unwrap();
    let x = Vector::from_slice(q, &[1.0f64, 2.0, 3.0]).unwrap();
    assert_eq!(x.queues(), std::slice::from_ref(q));
    let sum = Reductor::<f64, Sum>::new(q).unwrap();
    assert_eq!(sum.reduce(&x).unwrap(), 6.0);
}

#[test]
fn results_do_not_depend_on_the_device_count() {
    let n = 50_000;
    let xs = random_f32(n, 3);
    let ys = random_f32(n, 4);
    let run = |devices: usize| {
        let ctx = host_context(devices);
        let x = Vector::from_slice(&ctx, &xs).unwrap();
        let y = Vector::from_slice(&ctx, &ys).unwrap();
        let mut z = Vector::<f32>::new(&ctx, n).unwrap();
        z.assign((&x * 3.0f32 + &y).sqrt() - (&y * 0.5f32).exp() * &x)
            .unwrap();
        let sum = Reductor::<f32, Sum>::new(&ctx).unwrap();
        let total = sum.reduce(&z * &y).unwrap();
        (z.to_vec().unwrap(), total)
    };

    let (z1, total1) = run(1);
    for devices in 2..=4 {
        let (z, total) = run(devices);
        for (a, b) in z1.iter().zip(&z) {
            assert!((a - b).abs() <= 1e-6 * a.abs().max(1.0), "{a} vs {b} on {devices}");
        }
        assert!(
            relative_error(total as f64, total1 as f64) < 1e-5,
            "{total} vs {total1} on {devices}"
        );
    }
}

#[test]
fn vector_operands_share_buffers() {
    let ctx = host_context(2);
    let x = Vector::from_slice(&ctx, &[1.0f32, 2.0, 3.0]).unwrap();
    let Expr::Vector(data) = x.expr() else {
        panic!("a vector converts to a vector operand");
    };
    let data: Arc<VectorData<f32>> = data;
    assert!(format!("{data:?}").contains("len: 3"));
    assert!(Arc::strong_count(&data) >= 2);
}
