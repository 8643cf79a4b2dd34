//! Distributed sorting.
//!
//! Every partition is first sorted on its own device. The sorted runs are then merged on
//! the host, ties going to the earlier partition, and written back along the original
//! partition boundaries.

use std::{fmt, sync::Arc};

use crate::{cpu_storage::ordering, vector::VectorData, DType, Error, Result, Vector};

type HostLess<K> = Arc<dyn Fn(K, K) -> bool + Send + Sync>;

/// A strict weak order over keys, with a device body and an equivalent host function.
///
/// The device body is the body of `bool cmp(K prm1, K prm2)` and must return whether
/// `prm1` goes before `prm2`.
pub struct Comparator<K: DType> {
    name: String,
    pub(crate) device: Option<String>,
    pub(crate) host: Option<HostLess<K>>,
}

impl<K: DType> Clone for Comparator<K> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            device: self.device.clone(),
            host: self.host.clone(),
        }
    }
}

impl<K: DType> fmt::Debug for Comparator<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Comparator")
            .field("name", &self.name)
            .field("device", &self.device)
            .field("host", &self.host.is_some())
            .finish()
    }
}

impl<K: DType> Comparator<K> {
    pub fn new(
        name: impl Into<String>,
        device_body: impl Into<String>,
        host: impl Fn(K, K) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            device: Some(device_body.into()),
            host: Some(Arc::new(host)),
        }
    }

    pub fn device_only(name: impl Into<String>, device_body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device: Some(device_body.into()),
            host: None,
        }
    }

    pub fn host_only(
        name: impl Into<String>,
        host: impl Fn(K, K) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            device: None,
            host: Some(Arc::new(host)),
        }
    }

    /// Ascending order.
    pub fn less() -> Self {
        Self::new("less", "return prm1 < prm2;", |a: K, b: K| a < b)
    }

    /// Descending order.
    pub fn greater() -> Self {
        Self::new("greater", "return prm1 > prm2;", |a: K, b: K| a > b)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<K: DType> Default for Comparator<K> {
    fn default() -> Self {
        Self::less()
    }
}

/// Sort `keys` in ascending order.
pub fn sort<K: DType>(keys: &mut Vector<K>) -> Result<()> {
    sort_by(keys, &Comparator::less())
}

pub fn sort_by<K: DType>(keys: &mut Vector<K>, cmp: &Comparator<K>) -> Result<()> {
    sort_impl::<K, K>(&keys.data, None, cmp)
}

/// Sort `keys` in ascending order, moving `vals` along with them.
pub fn sort_by_key<K: DType, V: DType>(keys: &mut Vector<K>, vals: &mut Vector<V>) -> Result<()> {
    sort_by_key_with(keys, vals, &Comparator::less())
}

pub fn sort_by_key_with<K: DType, V: DType>(
    keys: &mut Vector<K>,
    vals: &mut Vector<V>,
    cmp: &Comparator<K>,
) -> Result<()> {
    sort_impl(&keys.data, Some(&vals.data), cmp)
}

fn sort_impl<K: DType, V: DType>(
    keys: &VectorData<K>,
    vals: Option<&VectorData<V>>,
    cmp: &Comparator<K>,
) -> Result<()> {
    let layout = &keys.layout;
    if let Some(vals) = vals {
        layout.check(&vals.layout)?;
    }
    let runs: Vec<usize> = (0..layout.partitions.len())
        .filter(|&p| !layout.partitions[p].is_empty())
        .collect();
    let less = match (&cmp.host, runs.len()) {
        (Some(less), _) => Some(less.clone()),
        (None, 0 | 1) => None,
        (None, _) => {
            return Err(Error::invalid_argument(format!(
                "comparator `{}` needs a host implementation to merge {} partitions",
                cmp.name,
                runs.len()
            )))
        }
    };

    for &p in &runs {
        layout.queues[p].sort_local(
            &keys.parts[p],
            vals.map(|v| &v.parts[p]),
            layout.partitions[p].len(),
            cmp,
        )?;
    }
    let Some(less) = less.filter(|_| runs.len() > 1) else {
        return Ok(());
    };

    let key_runs = runs
        .iter()
        .map(|&p| keys.read_range(layout.partitions[p].range()))
        .collect::<Result<Vec<_>>>()?;
    let order = merge(&key_runs, &*less);
    log::debug!("merged {} sorted runs of {} keys", key_runs.len(), order.len());

    let merged: Vec<K> = order.iter().map(|&(r, i)| key_runs[r][i]).collect();
    keys.write_all(&merged)?;
    if let Some(vals) = vals {
        let val_runs = runs
            .iter()
            .map(|&p| vals.read_range(layout.partitions[p].range()))
            .collect::<Result<Vec<_>>>()?;
        let merged: Vec<V> = order.iter().map(|&(r, i)| val_runs[r][i]).collect();
        vals.write_all(&merged)?;
    }
    Ok(())
}

/// Stable k-way merge of sorted runs, as `(run, position)` pairs.
fn merge<K: DType>(runs: &[Vec<K>], less: &dyn Fn(K, K) -> bool) -> Vec<(usize, usize)> {
    let total = runs.iter().map(Vec::len).sum();
    let mut heads = vec![0usize; runs.len()];
    let mut order = Vec::with_capacity(total);
    for _ in 0..total {
        let mut best: Option<usize> = None;
        for (r, run) in runs.iter().enumerate() {
            let Some(&candidate) = run.get(heads[r]) else {
                continue;
            };
            best = match best {
                Some(b) if ordering(less, candidate, runs[b][heads[b]]).is_lt() => Some(r),
                Some(b) => Some(b),
                None => Some(r),
            };
        }
        let Some(b) = best else {
            break;
        };
        order.push((b, heads[b]));
        heads[b] += 1;
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_stable() {
        let runs = vec![vec![1, 3, 5], vec![1, 2, 5]];
        let less = |a: i32, b: i32| a < b;
        assert_eq!(
            merge(&runs, &less),
            vec![(0, 0), (1, 0), (1, 1), (0, 1), (0, 2), (1, 2)]
        );
    }
}
