use ndarray::{Array2, ArrayView1};

/// Fixed-capacity sliding window stored in a slot-addressed ring buffer
///
/// Rows are written in place, so per-slot caches kept by the caller (kernel
/// values, partial sums) stay aligned with the window contents.
#[derive(Debug, Clone)]
pub struct RingWindow {
    rows: Array2<f64>,
    len: usize,
    next: usize,
}

/// Where a pushed row landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Push {
    pub slot: usize,
    /// The slot held the oldest row, which was overwritten
    pub evicted: bool,
}

impl RingWindow {
    pub fn new(capacity: usize, width: usize) -> Self {
        Self {
            rows: Array2::zeros((capacity.max(1), width)),
            len: 0,
            next: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.rows.nrows()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Oldest row, which the next push overwrites once the window is full
    pub fn oldest(&self) -> Option<ArrayView1<'_, f64>> {
        if self.is_empty() {
            None
        } else {
            Some(self.rows.row(self.slot_of(0)))
        }
    }

    pub fn push(&mut self, row: ArrayView1<f64>) -> Push {
        let slot = self.next;
        let evicted = self.is_full();
        self.rows.row_mut(slot).assign(&row);
        self.next = (self.next + 1) % self.capacity();
        if !evicted {
            self.len += 1;
        }
        Push { slot, evicted }
    }

    pub fn row(&self, slot: usize) -> ArrayView1<'_, f64> {
        self.rows.row(slot)
    }

    /// Slot of the `k`-th oldest row
    fn slot_of(&self, k: usize) -> usize {
        let cap = self.capacity();
        (self.next + cap - self.len + k) % cap
    }

    /// Occupied slots from oldest to newest
    pub fn slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).map(move |k| self.slot_of(k))
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.next = 0;
    }
}
