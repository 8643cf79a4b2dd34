//! Sparse matrices and their products with distributed vectors.
//!
//! A [`SparseMatrix`] is split by rows with the same partition function as vectors, so row
//! partition `p` lives on queue `p`. Its columns are owned the same way: a column referenced
//! by partition `p` but owned by partition `q != p` is a ghost of `p`. Before a product is
//! submitted, every partition's ghost values are gathered from their owners and uploaded
//! next to it. The owner/dependent relation is kept as a directed graph.

use std::{collections::BTreeSet, fmt, ops::Mul, slice, sync::Arc};

use petgraph::{graphmap::DiGraphMap, Direction};

use crate::{
    context::{AsQueues, Queue},
    expr::Expr,
    kernel::KernelArg,
    partition::owner,
    storage::Storage,
    vector::{Layout, VectorData},
    DType, Error, Result, Vector,
};

struct CsrPart<T: DType> {
    row_ptr: Storage<u64>,
    cols: Storage<u32>,
    vals: Storage<T>,
    /// Global indices of the ghost columns, ascending. Local column `local_cols + k`
    /// refers to `ghosts[k]`.
    ghosts: Vec<usize>,
    local_cols: usize,
}

struct CsrInner<T: DType> {
    nnz: usize,
    rows: Arc<Layout>,
    cols: Arc<Layout>,
    parts: Vec<CsrPart<T>>,
    /// Edge `q -> p` when partition `p` reads columns owned by partition `q`.
    deps: DiGraphMap<usize, ()>,
}

/// A CSR matrix distributed by rows over a list of queues.
pub struct SparseMatrix<T: DType> {
    inner: Arc<CsrInner<T>>,
}

impl<T: DType> Clone for SparseMatrix<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: DType> fmt::Debug for SparseMatrix<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparseMatrix")
            .field("rows", &self.rows())
            .field("cols", &self.cols())
            .field("nnz", &self.nnz())
            .field("dependencies", &self.dependencies())
            .finish()
    }
}

fn validate_row_ptr(row_ptr: &[usize], rows: usize, nnz: usize) -> Result<()> {
    if row_ptr.len() != rows + 1 {
        return Err(Error::invalid_argument(format!(
            "{} row pointers for {rows} rows",
            row_ptr.len()
        )));
    }
    if row_ptr[0] != 0 {
        return Err(Error::invalid_argument("row pointers must start at 0"));
    }
    if row_ptr.windows(2).any(|w| w[0] > w[1]) {
        return Err(Error::invalid_argument("row pointers must not decrease"));
    }
    if row_ptr[rows] != nnz {
        return Err(Error::invalid_argument(format!(
            "row pointers end at {}, but there are {nnz} entries",
            row_ptr[rows]
        )));
    }
    Ok(())
}

fn to_u32(v: usize, what: &str) -> Result<u32> {
    u32::try_from(v).map_err(|_| Error::invalid_argument(format!("{what} {v} does not fit 32 bits")))
}

impl<T: DType> SparseMatrix<T> {
    /// A `rows x cols` matrix from host CSR arrays.
    pub fn new(
        queues: &(impl AsQueues + ?Sized),
        rows: usize,
        cols: usize,
        row_ptr: &[usize],
        col: &[usize],
        val: &[T],
    ) -> Result<Self> {
        if col.len() != val.len() {
            return Err(Error::invalid_argument(format!(
                "{} column indices for {} values",
                col.len(),
                val.len()
            )));
        }
        validate_row_ptr(row_ptr, rows, col.len())?;
        if let Some(c) = col.iter().find(|&&c| c >= cols) {
            return Err(Error::invalid_argument(format!(
                "column {c} outside a matrix of {cols} columns"
            )));
        }

        let queues = queues.as_queues();
        let row_layout = Layout::new(queues, rows)?;
        let col_layout = Layout::new(queues, cols)?;
        let mut deps = DiGraphMap::new();
        for p in 0..queues.len() {
            deps.add_node(p);
        }

        let mut parts = Vec::with_capacity(queues.len());
        for (p, (queue, range)) in queues.iter().zip(&row_layout.partitions).enumerate() {
            let owned = col_layout.partitions[p];
            let (lo, hi) = (row_ptr[range.start], row_ptr[range.end]);
            let ghosts: Vec<usize> = col[lo..hi]
                .iter()
                .copied()
                .filter(|c| !owned.contains(*c))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            for &g in &ghosts {
                if let Some(q) = owner(&col_layout.partitions, g) {
                    deps.add_edge(q, p, ());
                }
            }

            let local_cols = owned.len();
            let renumbered = col[lo..hi]
                .iter()
                .map(|&c| {
                    let local = if owned.contains(c) {
                        c - owned.start
                    } else {
                        // Every column outside `owned` was collected into `ghosts` above.
                        let k = ghosts.binary_search(&c).map_err(|_| {
                            Error::msg(format!("column {c} is missing from the ghosts of {p}"))
                        })?;
                        local_cols + k
                    };
                    to_u32(local, "local column")
                })
                .collect::<Result<Vec<_>>>()?;
            let local_ptr: Vec<u64> = row_ptr[range.start..=range.end]
                .iter()
                .map(|&r| (r - lo) as u64)
                .collect();

            let device = queue.device();
            parts.push(CsrPart {
                row_ptr: device.upload(&local_ptr)?,
                cols: device.upload(&renumbered)?,
                vals: device.upload(&val[lo..hi])?,
                ghosts,
                local_cols,
            });
        }
        if deps.edge_count() > 0 {
            log::debug!(
                "sparse matrix {rows}x{cols}: {} halo dependencies",
                deps.edge_count()
            );
        }

        Ok(Self {
            inner: Arc::new(CsrInner {
                nnz: col.len(),
                rows: row_layout,
                cols: col_layout,
                parts,
                deps,
            }),
        })
    }

    pub fn rows(&self) -> usize {
        self.inner.rows.len
    }

    pub fn cols(&self) -> usize {
        self.inner.cols.len
    }

    pub fn nnz(&self) -> usize {
        self.inner.nnz
    }

    /// Pairs `(owner, dependent)` of partitions that exchange ghost values, ascending.
    pub fn dependencies(&self) -> Vec<(usize, usize)> {
        let mut edges: Vec<_> = self.inner.deps.all_edges().map(|(a, b, _)| (a, b)).collect();
        edges.sort_unstable();
        edges
    }

    /// Number of ghost columns of row partition `part`.
    pub fn ghost_count(&self, part: usize) -> usize {
        self.inner.parts.get(part).map_or(0, |p| p.ghosts.len())
    }

    /// `self * x` as an expression operand.
    pub fn apply(&self, x: &Vector<T>) -> Expr<T> {
        Expr::Csr {
            matrix: self.clone(),
            x: x.data.clone(),
        }
    }

    pub(crate) fn layout(&self) -> Arc<Layout> {
        self.inner.rows.clone()
    }

    fn gather_ghosts(&self, x: &VectorData<T>, part: usize) -> Result<Vec<T>> {
        let ghosts = &self.inner.parts[part].ghosts;
        let mut values = Vec::with_capacity(ghosts.len());
        let mut rest = ghosts.as_slice();
        let mut owners: Vec<usize> = self
            .inner
            .deps
            .neighbors_directed(part, Direction::Incoming)
            .collect();
        owners.sort_unstable();
        for q in owners {
            let owned = self.inner.cols.partitions[q];
            let n = rest.iter().take_while(|&&g| owned.contains(g)).count();
            let (mine, tail) = rest.split_at(n);
            rest = tail;
            let (Some(&first), Some(&last)) = (mine.first(), mine.last()) else {
                continue;
            };
            let span = x.read_range(first..last + 1)?;
            values.extend(mine.iter().map(|&g| span[g - first]));
            log::debug!("gathered {} ghost values for partition {part} from {q}", mine.len());
        }
        if values.len() != ghosts.len() {
            crate::bail!(
                "gathered {} of {} ghost values for partition {part}",
                values.len(),
                ghosts.len()
            );
        }
        Ok(values)
    }

    pub(crate) fn kernel_args(&self, x: &VectorData<T>, part: usize) -> Result<Vec<KernelArg<T>>> {
        self.inner.cols.check(&x.layout)?;
        let local = &self.inner.parts[part];
        let ghosts = self.gather_ghosts(x, part)?;
        let device = self.inner.rows.queues[part].device();
        Ok(vec![
            KernelArg::Rows(local.row_ptr.clone()),
            KernelArg::Columns(local.cols.clone()),
            KernelArg::Values(local.vals.clone()),
            KernelArg::Values(x.parts[part].clone()),
            KernelArg::Values(device.upload(&ghosts)?),
            KernelArg::Count(local.local_cols as u64),
        ])
    }
}

impl<T: DType> Mul<&Vector<T>> for &SparseMatrix<T> {
    type Output = Expr<T>;

    fn mul(self, x: &Vector<T>) -> Expr<T> {
        self.apply(x)
    }
}

struct CcsrInner<T: DType> {
    layout: Arc<Layout>,
    row_pattern: Storage<u32>,
    pattern_rows: Storage<u32>,
    col_offsets: Storage<i32>,
    values: Storage<T>,
    patterns: usize,
}

/// A square matrix whose rows are drawn from a small set of patterns.
///
/// Pattern `k` holds entries `pattern_row_ptr[k]..pattern_row_ptr[k + 1]` of the column
/// offsets and values; row `i` with pattern `k` has value `v` at column `i + offset` for each
/// entry. Lives on a single queue.
pub struct CompactSparseMatrix<T: DType> {
    inner: Arc<CcsrInner<T>>,
}

impl<T: DType> Clone for CompactSparseMatrix<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: DType> fmt::Debug for CompactSparseMatrix<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompactSparseMatrix")
            .field("n", &self.inner.layout.len)
            .field("patterns", &self.inner.patterns)
            .finish()
    }
}

impl<T: DType> CompactSparseMatrix<T> {
    pub fn new(
        queue: &Queue,
        n: usize,
        pattern_count: usize,
        row_pattern_idx: &[usize],
        pattern_row_ptr: &[usize],
        pattern_col_offset: &[i32],
        pattern_values: &[T],
    ) -> Result<Self> {
        if pattern_count == 0 {
            return Err(Error::invalid_argument("at least one row pattern is needed"));
        }
        if row_pattern_idx.len() != n {
            return Err(Error::invalid_argument(format!(
                "{} row pattern indices for {n} rows",
                row_pattern_idx.len()
            )));
        }
        if let Some(k) = row_pattern_idx.iter().find(|&&k| k >= pattern_count) {
            return Err(Error::invalid_argument(format!(
                "row pattern {k} outside {pattern_count} patterns"
            )));
        }
        let nnz = pattern_col_offset.len();
        if pattern_values.len() != nnz {
            return Err(Error::invalid_argument(format!(
                "{nnz} column offsets for {} values",
                pattern_values.len()
            )));
        }
        validate_row_ptr(pattern_row_ptr, pattern_count, nnz)?;
        for (i, &k) in row_pattern_idx.iter().enumerate() {
            let entries = &pattern_col_offset[pattern_row_ptr[k]..pattern_row_ptr[k + 1]];
            if let Some(off) = entries
                .iter()
                .find(|&&off| !(0..n as i64).contains(&(i as i64 + off as i64)))
            {
                return Err(Error::invalid_argument(format!(
                    "row {i} references column {} outside [0, {n})",
                    i as i64 + *off as i64
                )));
            }
        }

        let idx = row_pattern_idx
            .iter()
            .map(|&k| to_u32(k, "row pattern"))
            .collect::<Result<Vec<_>>>()?;
        let rows = pattern_row_ptr
            .iter()
            .map(|&r| to_u32(r, "pattern row pointer"))
            .collect::<Result<Vec<_>>>()?;
        let device = queue.device();
        Ok(Self {
            inner: Arc::new(CcsrInner {
                layout: Layout::new(slice::from_ref(queue), n)?,
                row_pattern: device.upload(&idx)?,
                pattern_rows: device.upload(&rows)?,
                col_offsets: device.upload(pattern_col_offset)?,
                values: device.upload(pattern_values)?,
                patterns: pattern_count,
            }),
        })
    }

    pub fn rows(&self) -> usize {
        self.inner.layout.len
    }

    pub fn apply(&self, x: &Vector<T>) -> Expr<T> {
        Expr::Ccsr {
            matrix: self.clone(),
            x: x.data.clone(),
        }
    }

    pub(crate) fn layout(&self) -> Arc<Layout> {
        self.inner.layout.clone()
    }

    pub(crate) fn kernel_args(&self, x: &VectorData<T>) -> Result<Vec<KernelArg<T>>> {
        self.inner.layout.check(&x.layout)?;
        Ok(vec![
            KernelArg::Columns(self.inner.row_pattern.clone()),
            KernelArg::Columns(self.inner.pattern_rows.clone()),
            KernelArg::Shifts(self.inner.col_offsets.clone()),
            KernelArg::Values(self.inner.values.clone()),
            KernelArg::Values(x.parts[0].clone()),
        ])
    }
}

impl<T: DType> Mul<&Vector<T>> for &CompactSparseMatrix<T> {
    type Output = Expr<T>;

    fn mul(self, x: &Vector<T>) -> Expr<T> {
        self.apply(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;

    #[test]
    fn ghosts_and_dependencies() {
        let ctx = Context::builder().host_devices(3).host_threads(1).build().unwrap();
        // 6x6: row 0 couples to column 5, row 5 to column 0, the rest are diagonal.
        let row_ptr = [0, 2, 3, 4, 5, 6, 8];
        let col = [0, 5, 1, 2, 3, 4, 0, 5];
        let val = [1.0f64; 8];
        let m = SparseMatrix::new(&ctx, 6, 6, &row_ptr, &col, &val).unwrap();
        assert_eq!(m.dependencies(), vec![(0, 2), (2, 0)]);
        assert_eq!(m.ghost_count(0), 1);
        assert_eq!(m.ghost_count(1), 0);
        assert_eq!(m.nnz(), 8);
    }

    #[test]
    fn ghosts_from_both_neighbours() {
        let ctx = Context::builder().host_devices(3).host_threads(1).build().unwrap();
        // Rows 2 and 3 read columns owned by partitions 0 and 2.
        let row_ptr = [0, 1, 2, 5, 8, 9, 10];
        let col = [0, 1, 0, 2, 5, 3, 4, 1, 4, 5];
        let val = [1.0f64; 10];
        let m = SparseMatrix::new(&ctx, 6, 6, &row_ptr, &col, &val).unwrap();
        assert_eq!(m.dependencies(), vec![(0, 1), (2, 1)]);
        assert_eq!(m.ghost_count(1), 4);

        let x = Vector::from_slice(&ctx, &[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let mut y = Vector::<f64>::new(&ctx, 6).unwrap();
        y.assign(&m * &x).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![1.0, 2.0, 10.0, 11.0, 5.0, 6.0]);
    }

    #[test]
    fn rejects_malformed_input() {
        let ctx = Context::builder().host_devices(1).build().unwrap();
        let bad = SparseMatrix::<f32>::new(&ctx, 2, 2, &[0, 2, 1], &[0, 1], &[1.0, 1.0]);
        assert!(matches!(bad, Err(Error::InvalidArgument(_))));
        let bad = SparseMatrix::<f32>::new(&ctx, 1, 2, &[0, 1], &[2], &[1.0]);
        assert!(matches!(bad, Err(Error::InvalidArgument(_))));

        let q = ctx.queue(0).unwrap();
        let bad = CompactSparseMatrix::<f32>::new(q, 2, 1, &[0, 0], &[0, 1], &[1], &[1.0]);
        assert!(matches!(bad, Err(Error::InvalidArgument(_))));
        let ok = CompactSparseMatrix::<f32>::new(q, 2, 2, &[0, 1], &[0, 1, 2], &[1, -1], &[1.0, 1.0]);
        assert!(ok.is_ok());
    }
}
