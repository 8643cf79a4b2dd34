//! Conjugate gradients on the 3D Poisson problem, distributed over every device.

use polyvec_core::{Context, Reductor, Result, SparseMatrix, Sum, Vector};

const M: usize = 32;

fn laplacian(m: usize) -> (Vec<usize>, Vec<usize>, Vec<f64>) {
    let h2i = ((m - 1) * (m - 1)) as f64;
    let mut row = vec![0];
    let mut col = Vec::new();
    let mut val = Vec::new();
    for k in 0..m {
        for j in 0..m {
            for i in 0..m {
                let idx = k * m * m + j * m + i;
                if [i, j, k].iter().any(|&c| c == 0 || c == m - 1) {
                    col.push(idx);
                    val.push(1.0);
                } else {
                    for (c, w) in [
                        (idx - m * m, -h2i),
                        (idx - m, -h2i),
                        (idx - 1, -h2i),
                        (idx, 6.0 * h2i),
                        (idx + 1, -h2i),
                        (idx + m, -h2i),
                        (idx + m * m, -h2i),
                    ] {
                        col.push(c);
                        val.push(w);
                    }
                }
                row.push(col.len());
            }
        }
    }
    (row, col, val)
}

fn main() -> Result<()> {
    env_logger::init();

    let ctx = Context::builder().build()?;
    println!("{ctx}");

    let n = M * M * M;
    let (row, col, val) = laplacian(M);
    let a = SparseMatrix::new(&ctx, n, n, &row, &col, &val)?;
    println!("{n} unknowns, {} nonzeros", a.nnz());

    let dot = Reductor::<f64, Sum>::new(&ctx)?;
    let f = Vector::from_slice(&ctx, &vec![1.0; n])?;
    let mut u = Vector::<f64>::new(&ctx, n)?;
    let mut r = Vector::<f64>::new(&ctx, n)?;
    let mut p = Vector::<f64>::new(&ctx, n)?;
    let mut q = Vector::<f64>::new(&ctx, n)?;

    r.assign(&f - a.apply(&u))?;
    p.assign(&r)?;
    let mut rho = dot.reduce(&r * &r)?;
    let norm_f = dot.reduce(&f * &f)?.sqrt();

    let mut iter = 0;
    while iter < 1000 && rho.sqrt() > 1e-8 * norm_f {
        q.assign(&a * &p)?;
        let alpha = rho / dot.reduce(&p * &q)?;
        u.assign_add(alpha * &p)?;
        r.assign_sub(alpha * &q)?;
        let rho_next = dot.reduce(&r * &r)?;
        p.assign(&r + (rho_next / rho) * &p)?;
        rho = rho_next;
        iter += 1;
    }
    println!("converged in {iter} iterations, |r| = {:e}", rho.sqrt());

    let stats = ctx.kernel_cache().stats();
    println!("{} kernel(s) compiled, {} cache hit(s)", stats.compiled, stats.hits);
    Ok(())
}
