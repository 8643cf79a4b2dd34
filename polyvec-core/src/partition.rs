use std::ops::Range;

/// A half-open index range `[start, end)` of a logical vector owned by one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Partition {
    pub start: usize,
    pub end: usize,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn contains(&self, idx: usize) -> bool {
        idx >= self.start && idx < self.end
    }
}

/// Split `[0, n)` into `k` contiguous ranges in queue order.
///
/// The first `n % k` ranges hold one extra element, so no range is empty when `n >= k`.
pub fn partition(n: usize, k: usize) -> Vec<Partition> {
    if k == 0 {
        return Vec::new();
    }
    let chunk = n / k;
    let extra = n % k;
    let mut start = 0;
    (0..k)
        .map(|i| {
            let len = chunk + usize::from(i < extra);
            let part = Partition {
                start,
                end: start + len,
            };
            start += len;
            part
        })
        .collect()
}

/// Index of the partition holding `idx`.
pub(crate) fn owner(parts: &[Partition], idx: usize) -> Option<usize> {
    let p = parts.partition_point(|part| part.end <= idx);
    parts.get(p).filter(|part| part.contains(idx)).map(|_| p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_range_without_gaps() {
        for n in [0usize, 1, 2, 7, 100, 1025] {
            for k in 1..6 {
                let parts = partition(n, k);
                assert_eq!(parts.len(), k);
                assert_eq!(parts[0].start, 0);
                assert_eq!(parts[k - 1].end, n);
                for w in parts.windows(2) {
                    assert_eq!(w[0].end, w[1].start);
                }
                assert_eq!(parts.iter().map(Partition::len).sum::<usize>(), n);
                if n >= k {
                    assert!(parts.iter().all(|p| !p.is_empty()));
                }
                let max = parts.iter().map(Partition::len).max().unwrap();
                let min = parts.iter().map(Partition::len).min().unwrap();
                assert!(max - min <= 1);
            }
        }
    }

    #[test]
    fn owner_lookup() {
        let parts = partition(10, 3);
        assert_eq!(owner(&parts, 0), Some(0));
        assert_eq!(owner(&parts, 3), Some(0));
        assert_eq!(owner(&parts, 4), Some(1));
        assert_eq!(owner(&parts, 9), Some(2));
        assert_eq!(owner(&parts, 10), None);
    }
}
