//! Striped async locks over dedup grid cells
//!
//! Serialises merge-or-create decisions between reports whose grid
//! neighbourhoods overlap. Cells hash onto a fixed set of stripes; a caller
//! locks every stripe its neighbourhood touches, in ascending stripe order,
//! so two callers can never wait on each other in a cycle.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::dedup::{CellKey, Neighbourhood};

/// Default number of stripes
pub const DEFAULT_STRIPES: usize = 1024;

pub struct CellLocks {
    stripes: Vec<Arc<Mutex<()>>>,
}

/// Holds a set of stripes until dropped
#[must_use = "cells are unlocked when the guard is dropped"]
pub struct CellGuard {
    _held: Vec<OwnedMutexGuard<()>>,
}

impl CellGuard {
    pub fn stripes_held(&self) -> usize {
        self._held.len()
    }
}

impl CellLocks {
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Arc::new(Mutex::new(()))).collect(),
        }
    }

    fn stripe_of(&self, cell: &CellKey) -> usize {
        let (row, col) = *cell;
        let mixed = (row as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (col as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
        (mixed % self.stripes.len() as u64) as usize
    }

    /// Lock every stripe covering `cells`
    pub async fn acquire(&self, cells: &[CellKey]) -> CellGuard {
        let mut indices: Vec<usize> = cells.iter().map(|c| self.stripe_of(c)).collect();
        indices.sort_unstable();
        indices.dedup();
        self.lock_stripes(indices).await
    }

    /// Lock a query neighbourhood; an unbounded one takes every stripe
    pub async fn acquire_around(&self, neighbourhood: &Neighbourhood) -> CellGuard {
        match neighbourhood {
            Neighbourhood::Cells(cells) => self.acquire(cells).await,
            Neighbourhood::Everywhere => self.lock_stripes((0..self.stripes.len()).collect()).await,
        }
    }

    async fn lock_stripes(&self, indices: Vec<usize>) -> CellGuard {
        let mut held = Vec::with_capacity(indices.len());
        for index in indices {
            held.push(self.stripes[index].clone().lock_owned().await);
        }
        CellGuard { _held: held }
    }
}

impl Default for CellLocks {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_duplicate_cells_lock_once() {
        let locks = CellLocks::new(8);
        let guard = locks.acquire(&[(0, 0), (0, 0), (0, 0)]).await;
        assert_eq!(guard.stripes_held(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_neighbourhoods_are_serialized() {
        let locks = Arc::new(CellLocks::new(64));
        let inside = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for i in 0..16i64 {
            let locks = locks.clone();
            let inside = inside.clone();
            handles.push(tokio::spawn(async move {
                // Every neighbourhood shares cell (5, 5)
                let cells = [(5, 5), (i, 100 - i)];
                let _guard = locks.acquire(&cells).await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(1)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_unbounded_neighbourhood_excludes_every_cell() {
        let locks = CellLocks::new(16);
        let guard = locks.acquire_around(&Neighbourhood::Everywhere).await;
        assert_eq!(guard.stripes_held(), 16);

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), locks.acquire(&[(123, -7)])).await;
        assert!(blocked.is_err());
        drop(guard);
        let _guard = locks.acquire_around(&Neighbourhood::Cells(vec![(123, -7)])).await;
    }

    #[tokio::test]
    async fn test_disjoint_cells_do_not_block() {
        let locks = CellLocks::new(DEFAULT_STRIPES);
        let a = (1, 1);
        let b = (1000, -1000);
        assert_ne!(locks.stripe_of(&a), locks.stripe_of(&b));

        let _first = locks.acquire(&[a]).await;
        let second = tokio::time::timeout(Duration::from_millis(100), locks.acquire(&[b])).await;
        assert!(second.is_ok());
    }
}
