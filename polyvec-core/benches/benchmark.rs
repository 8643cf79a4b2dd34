use criterion::{criterion_group, criterion_main, Criterion};
use polyvec_core::{
    element_index, sort, Backend, CompactSparseMatrix, Context, Filter, Philox, Random,
    Reductor, SparseMatrix, Stencil, Sum, Vector,
};
use rand::Rng;

const N: usize = 1 << 20;

fn host_context(devices: usize) -> Context {
    let _ = env_logger::try_init();
    Context::builder()
        .filter(Filter::backend(Backend::Cpu))
        .host_devices(devices)
        .build()
        .unwrap()
}

fn random_data(n: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..n).map(|_| rng.gen::<f32>()).collect()
}

fn bench_saxpy(c: &mut Criterion) {
    for devices in [1, 4] {
        let ctx = host_context(devices);
        let x = Vector::from_slice(&ctx, &random_data(N)).unwrap();
        let mut y = Vector::from_slice(&ctx, &random_data(N)).unwrap();
        c.bench_function(&format!("saxpy_{N}_on_{devices}"), |bencher| {
            bencher.iter(|| {
                y.assign_add(2.5f32 * &x).unwrap();
                ctx.finish().unwrap();
            });
        });
    }
}

fn bench_vector_arithmetic(c: &mut Criterion) {
    let ctx = host_context(2);
    let a = Vector::from_slice(&ctx, &random_data(N)).unwrap();
    let b = Vector::from_slice(&ctx, &random_data(N)).unwrap();
    let mut y = Vector::<f32>::new(&ctx, N).unwrap();
    c.bench_function(&format!("fused_arith_{N}"), |bencher| {
        bencher.iter(|| {
            y.assign((&a + &b).sqrt() * &a - (&b * 0.5f32).exp()).unwrap();
            ctx.finish().unwrap();
        });
    });
}

fn bench_dot(c: &mut Criterion) {
    let ctx = host_context(2);
    let x = Vector::from_slice(&ctx, &random_data(N)).unwrap();
    let y = Vector::from_slice(&ctx, &random_data(N)).unwrap();
    let sum = Reductor::<f32, Sum>::new(&ctx).unwrap();
    c.bench_function(&format!("dot_{N}"), |bencher| {
        bencher.iter(|| sum.reduce(&x * &y).unwrap());
    });
}

fn bench_stencil(c: &mut Criterion) {
    let ctx = host_context(2);
    let x = Vector::from_slice(&ctx, &random_data(N)).unwrap();
    let mut y = Vector::<f32>::new(&ctx, N).unwrap();
    let s = Stencil::new(&ctx, &[0.25f32, 0.5, 0.25], 1).unwrap();
    c.bench_function(&format!("stencil3_{N}"), |bencher| {
        bencher.iter(|| {
            y.assign(&x * &s).unwrap();
            ctx.finish().unwrap();
        });
    });
}

fn bench_spmv(c: &mut Criterion) {
    const M: usize = 1 << 16;
    let ctx = host_context(2);
    let mut row = vec![0];
    let mut col = Vec::new();
    let mut val = Vec::new();
    for i in 0..M {
        for j in i.saturating_sub(1)..(i + 2).min(M) {
            col.push(j);
            val.push(if j == i { 2.0f32 } else { -1.0 });
        }
        row.push(col.len());
    }
    let a = SparseMatrix::new(&ctx, M, M, &row, &col, &val).unwrap();
    let x = Vector::from_slice(&ctx, &random_data(M)).unwrap();
    let mut y = Vector::<f32>::new(&ctx, M).unwrap();
    c.bench_function(&format!("spmv_tridiag_{M}"), |bencher| {
        bencher.iter(|| {
            y.assign(&a * &x).unwrap();
            ctx.finish().unwrap();
        });
    });
}

fn bench_ccsr(c: &mut Criterion) {
    const M: usize = 1 << 16;
    let ctx = host_context(1);
    let q = ctx.queue(0).unwrap();
    let idx: Vec<usize> = (0..M).map(|i| usize::from(i != 0 && i != M - 1)).collect();
    let a = CompactSparseMatrix::new(
        q,
        M,
        2,
        &idx,
        &[0, 1, 4],
        &[0, -1, 0, 1],
        &[1.0f32, -1.0, 2.0, -1.0],
    )
    .unwrap();
    let x = Vector::from_slice(q, &random_data(M)).unwrap();
    let mut y = Vector::<f32>::new(q, M).unwrap();
    c.bench_function(&format!("ccsr_tridiag_{M}"), |bencher| {
        bencher.iter(|| {
            y.assign(&a * &x).unwrap();
            ctx.finish().unwrap();
        });
    });
}

fn bench_random(c: &mut Criterion) {
    let ctx = host_context(2);
    let rnd = Random::<f32, Philox>::new();
    let mut x = Vector::<f32>::new(&ctx, N).unwrap();
    let mut seed = 0;
    c.bench_function(&format!("philox_{N}"), |bencher| {
        bencher.iter(|| {
            seed += 1;
            x.assign(rnd.call(element_index(0, N), seed)).unwrap();
            ctx.finish().unwrap();
        });
    });
}

fn bench_sort(c: &mut Criterion) {
    let ctx = host_context(2);
    let data = random_data(1 << 16);
    c.bench_function("sort_65536", |bencher| {
        bencher.iter(|| {
            let mut keys = Vector::from_slice(&ctx, &data).unwrap();
            sort(&mut keys).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_saxpy,
    bench_vector_arithmetic,
    bench_dot,
    bench_stencil,
    bench_spmv,
    bench_ccsr,
    bench_random,
    bench_sort
);
criterion_main!(benches);
