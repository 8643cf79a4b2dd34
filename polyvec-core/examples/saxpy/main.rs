use polyvec_core::{Context, Reductor, Result, Sum, Vector};

fn main() -> Result<()> {
    env_logger::init();

    let ctx = Context::builder().build()?;
    println!("{ctx}");

    let n = 1 << 20;
    let x = Vector::from_slice(&ctx, &vec![1.0f32; n])?;
    let mut y = Vector::from_slice(&ctx, &vec![2.0f32; n])?;

    let a = 2.0f32;
    y.assign_add(a * &x)?;

    let sum = Reductor::<f32, Sum>::new(&ctx)?.reduce(&y)?;
    println!("sum(y) = {sum} (expected {})", 4.0 * n as f32);

    let stats = ctx.kernel_cache().stats();
    println!("{} kernel(s) compiled, {} cache hit(s)", stats.compiled, stats.hits);
    Ok(())
}
