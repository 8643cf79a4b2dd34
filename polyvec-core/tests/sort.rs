use polyvec_core::{
    sort, sort_by, sort_by_key, sort_by_key_with, Backend, Comparator, Context, Error, Filter,
    Vector,
};

fn host_context(devices: usize) -> Context {
    Context::builder()
        .filter(Filter::backend(Backend::Cpu))
        .host_devices(devices)
        .host_threads(2)
        .build()
        .unwrap()
}

fn scrambled(n: usize) -> Vec<i32> {
    (0..n as i32).map(|i| (i * 7919 + 13) % 1009 - 504).collect()
}

fn even_first() -> Comparator<i32> {
    Comparator::new(
        "even_first",
        "bool e1 = (prm1 & 1) == 0; bool e2 = (prm2 & 1) == 0; \
         return e1 != e2 ? e1 : prm1 < prm2;",
        |a: i32, b: i32| {
            let (ea, eb) = (a & 1 == 0, b & 1 == 0);
            if ea != eb {
                ea
            } else {
                a < b
            }
        },
    )
}

macro_rules! test_for_devices {
    ($devices:expr, $name:ident) => {
        mod $name {
            use super::*;

            fn ctx() -> Context {
                host_context($devices)
            }

            #[test]
            fn ascending() {
                let ctx = ctx();
                let data = scrambled(3001);
                let mut keys = Vector::from_slice(&ctx, &data).unwrap();
                sort(&mut keys).unwrap();
                let mut expected = data.clone();
                expected.sort();
                assert_eq!(keys.to_vec().unwrap(), expected);
            }

            #[test]
            fn descending_floats() {
                let ctx = ctx();
                let data: Vec<f64> = scrambled(500).into_iter().map(|v| v as f64 / 8.0).collect();
                let mut keys = Vector::from_slice(&ctx, &data).unwrap();
                sort_by(&mut keys, &Comparator::greater()).unwrap();
                let mut expected = data.clone();
                expected.sort_by(|a, b| b.total_cmp(a));
                assert_eq!(keys.to_vec().unwrap(), expected);
            }

            #[test]
            fn custom_comparator() {
                let ctx = ctx();
                let data = scrambled(777);
                let mut keys = Vector::from_slice(&ctx, &data).unwrap();
                sort_by(&mut keys, &even_first()).unwrap();
                let sorted = keys.to_vec().unwrap();

                let evens = sorted.iter().take_while(|v| *v & 1 == 0).count();
                assert_eq!(evens, data.iter().filter(|v| *v & 1 == 0).count());
                assert!(sorted[..evens].windows(2).all(|w| w[0] <= w[1]));
                assert!(sorted[evens..].windows(2).all(|w| w[0] <= w[1]));
            }

            #[test]
            fn values_follow_their_keys() {
                let ctx = ctx();
                let data = scrambled(1500);
                let vals: Vec<f32> = (0..data.len()).map(|i| i as f32).collect();
                let mut keys = Vector::from_slice(&ctx, &data).unwrap();
                let mut values = Vector::from_slice(&ctx, &vals).unwrap();
                sort_by_key(&mut keys, &mut values).unwrap();

                let keys = keys.to_vec().unwrap();
                let values = values.to_vec().unwrap();
                assert!(keys.windows(2).all(|w| w[0] <= w[1]));
                for (k, v) in keys.iter().zip(&values) {
                    assert_eq!(data[*v as usize], *k);
                }
            }

            #[test]
            fn key_value_sort_is_stable_across_partitions() {
                let ctx = ctx();
                let data: Vec<u32> = (0..90).map(|i| i % 3).collect();
                let vals: Vec<u64> = (0..90).collect();
                let mut keys = Vector::from_slice(&ctx, &data).unwrap();
                let mut values = Vector::from_slice(&ctx, &vals).unwrap();
                sort_by_key_with(&mut keys, &mut values, &Comparator::less()).unwrap();

                let values = values.to_vec().unwrap();
                let mut expected: Vec<u64> = (0..90).collect();
                expected.sort_by_key(|i| i % 3);
                assert_eq!(values, expected);
            }

            #[test]
            fn tiny_vectors() {
                let ctx = ctx();
                let mut keys = Vector::<i64>::new(&ctx, 0).unwrap();
                sort(&mut keys).unwrap();
                assert!(keys.to_vec().unwrap().is_empty());

                let mut keys = Vector::from_slice(&ctx, &[2i64, 1]).unwrap();
                sort(&mut keys).unwrap();
                assert_eq!(keys.to_vec().unwrap(), vec![1, 2]);
            }
        }
    };
}

test_for_devices!(1, one_device);
test_for_devices!(2, two_devices);
test_for_devices!(3, three_devices);

#[test]
fn merging_needs_a_host_comparator() {
    let ctx = host_context(2);
    let mut keys = Vector::from_slice(&ctx, &[3i32, 1, 2, 0]).unwrap();
    let cmp = Comparator::device_only("less", "return prm1 < prm2;");
    assert!(sort_by(&mut keys, &cmp).is_err());
}

#[test]
fn mismatched_values_are_rejected() {
    let ctx = host_context(2);
    let mut keys = Vector::from_slice(&ctx, &[3i32, 1, 2]).unwrap();
    let mut values = Vector::from_slice(&ctx, &[1.0f32, 2.0]).unwrap();
    assert!(matches!(
        sort_by_key(&mut keys, &mut values),
        Err(Error::SizeMismatch(_))
    ));
}
