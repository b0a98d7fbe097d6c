//! Fixed-capacity ring buffer backing a `Live` signal.
//!
//! Two parallel arrays (x, y) preallocated at capacity; a push past
//! capacity overwrites the oldest entry in place rather than reallocating.

pub struct LiveRing {
    xs: Box<[f64]>,
    ys: Box<[f64]>,
    head: usize,
    len: usize,
}

impl LiveRing {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            xs: vec![0.0; capacity].into_boxed_slice(),
            ys: vec![0.0; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.xs.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `(x, y)`, evicting the oldest point if at capacity.
    pub fn push(&mut self, x: f64, y: f64) {
        let cap = self.xs.len();
        if self.len < cap {
            let idx = (self.head + self.len) % cap;
            self.xs[idx] = x;
            self.ys[idx] = y;
            self.len += 1;
        } else {
            self.xs[self.head] = x;
            self.ys[self.head] = y;
            self.head = (self.head + 1) % cap;
        }
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    pub fn tail(&self) -> Option<(f64, f64)> {
        if self.len == 0 {
            return None;
        }
        let idx = (self.head + self.len - 1) % self.xs.len();
        Some((self.xs[idx], self.ys[idx]))
    }

    /// Returns the most recent `min(n, len)` points in chronological order.
    pub fn window(&self, n: usize) -> Vec<(f64, f64)> {
        let count = n.min(self.len);
        let cap = self.xs.len();
        let start = (self.head + self.len - count) % cap;
        (0..count)
            .map(|i| {
                let idx = (start + i) % cap;
                (self.xs[idx], self.ys[idx])
            })
            .collect()
    }
}
