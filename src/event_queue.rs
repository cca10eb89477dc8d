//! A binned priority queue over the collision horizon: events are bucketed by
//! predicted time into bins of width horizon/n_buckets, doubly linked within each
//! bin through parallel per-particle arrays, giving O(1) removal and near-O(1)
//! amortized extraction of the minimum.
//!
//! Each particle holds at most one queued event, so the link arrays are indexed by
//! particle. If any bucket's occupancy exceeds the configured limit, the bucket
//! count grows by ~1.5× and everything is rehashed.

pub(crate) const NONE: usize = usize::MAX;

pub(crate) struct EventQueue {
    /// Bucket → first queued particle, or NONE.
    heads: Vec<usize>,
    occupancy: Vec<u32>,
    /// Per-particle intrusive links.
    next: Vec<usize>,
    prev: Vec<usize>,
    bucket_of: Vec<usize>,
    time_of: Vec<f64>,
    horizon: f64,
    width: f64,
    /// Buckets below this are known empty; scanning resumes here.
    scan_start: usize,
    occupancy_limit: u32,
}

impl EventQueue {
    pub fn new(n_particles: usize, n_buckets: usize, horizon: f64, occupancy_limit: u32) -> Self {
        assert!(n_buckets > 0 && horizon > 0.);
        Self {
            heads: vec![NONE; n_buckets],
            occupancy: vec![0; n_buckets],
            next: vec![NONE; n_particles],
            prev: vec![NONE; n_particles],
            bucket_of: vec![NONE; n_particles],
            time_of: vec![f64::INFINITY; n_particles],
            horizon,
            width: horizon / n_buckets as f64,
            scan_start: 0,
            occupancy_limit,
        }
    }

    /// Empty the queue for a fresh horizon, keeping the current bucket count.
    pub fn reset(&mut self, n_particles: usize, horizon: f64) {
        assert!(horizon > 0.);
        for h in &mut self.heads {
            *h = NONE;
        }
        for o in &mut self.occupancy {
            *o = 0;
        }
        self.next.clear();
        self.next.resize(n_particles, NONE);
        self.prev.clear();
        self.prev.resize(n_particles, NONE);
        self.bucket_of.clear();
        self.bucket_of.resize(n_particles, NONE);
        self.time_of.clear();
        self.time_of.resize(n_particles, f64::INFINITY);
        self.horizon = horizon;
        self.width = horizon / self.heads.len() as f64;
        self.scan_start = 0;
    }

    fn bucket_index(&self, t: f64) -> usize {
        // Events beyond the horizon clamp into the last bucket; they are superseded
        // by the next full recomputation before they could fire.
        let idx = (t / self.width) as usize;
        idx.min(self.heads.len() - 1)
    }

    pub fn scheduled_time(&self, i: usize) -> f64 {
        self.time_of[i]
    }

    /// Schedule (or reschedule) particle `i` at time `t`, measured from the horizon
    /// start. Must be finite and non-negative.
    pub fn insert(&mut self, i: usize, t: f64) {
        debug_assert!(t.is_finite() && t >= 0., "event time {t}");
        if self.bucket_of[i] != NONE {
            self.remove(i);
        }

        let b = self.bucket_index(t);
        self.time_of[i] = t;
        self.bucket_of[i] = b;

        // Link at head.
        let head = self.heads[b];
        self.next[i] = head;
        self.prev[i] = NONE;
        if head != NONE {
            self.prev[head] = i;
        }
        self.heads[b] = i;
        self.occupancy[b] += 1;

        if b < self.scan_start {
            self.scan_start = b;
        }

        if self.occupancy[b] > self.occupancy_limit {
            self.grow();
        }
    }

    pub fn remove(&mut self, i: usize) {
        let b = self.bucket_of[i];
        if b == NONE {
            return;
        }

        let (p, n) = (self.prev[i], self.next[i]);
        if p != NONE {
            self.next[p] = n;
        } else {
            self.heads[b] = n;
        }
        if n != NONE {
            self.prev[n] = p;
        }

        self.bucket_of[i] = NONE;
        self.next[i] = NONE;
        self.prev[i] = NONE;
        self.time_of[i] = f64::INFINITY;
        self.occupancy[b] -= 1;
    }

    /// The queued event with the numerically smallest time: scan buckets in
    /// increasing time order from the remembered start, then linear-scan the first
    /// non-empty bucket (buckets partition time, so its minimum is global).
    pub fn peek_min(&mut self) -> Option<(usize, f64)> {
        let n_buckets = self.heads.len();

        while self.scan_start < n_buckets && self.heads[self.scan_start] == NONE {
            self.scan_start += 1;
        }
        if self.scan_start >= n_buckets {
            return None;
        }

        let mut best = NONE;
        let mut best_time = f64::INFINITY;
        let mut cursor = self.heads[self.scan_start];
        while cursor != NONE {
            if self.time_of[cursor] < best_time {
                best_time = self.time_of[cursor];
                best = cursor;
            }
            cursor = self.next[cursor];
        }

        Some((best, best_time))
    }

    /// Rebalance: ~1.5× the bucket count, rehash every queued event.
    fn grow(&mut self) {
        let new_count = self.heads.len() * 3 / 2 + 1;

        let queued: Vec<(usize, f64)> = (0..self.bucket_of.len())
            .filter(|&i| self.bucket_of[i] != NONE)
            .map(|i| (i, self.time_of[i]))
            .collect();

        self.heads = vec![NONE; new_count];
        self.occupancy = vec![0; new_count];
        self.width = self.horizon / new_count as f64;
        self.scan_start = 0;
        for link in self.next.iter_mut() {
            *link = NONE;
        }
        for link in self.prev.iter_mut() {
            *link = NONE;
        }
        for b in self.bucket_of.iter_mut() {
            *b = NONE;
        }

        for (i, t) in queued {
            // Re-link directly; occupancy growth is not re-triggered mid-rehash.
            let b = self.bucket_index(t);
            self.time_of[i] = t;
            self.bucket_of[i] = b;
            let head = self.heads[b];
            self.next[i] = head;
            if head != NONE {
                self.prev[head] = i;
            }
            self.heads[b] = i;
            self.occupancy[b] += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_extraction_order() {
        let mut q = EventQueue::new(8, 4, 10., 32);
        q.insert(0, 7.0);
        q.insert(1, 2.0);
        q.insert(2, 4.5);
        q.insert(3, 2.1);

        let mut order = Vec::new();
        while let Some((i, _t)) = q.peek_min() {
            order.push(i);
            q.remove(i);
        }
        assert_eq!(order, vec![1, 3, 2, 0]);
    }

    #[test]
    fn reinsert_moves_event() {
        let mut q = EventQueue::new(4, 4, 10., 32);
        q.insert(0, 9.0);
        q.insert(1, 5.0);

        // Rescheduling particle 0 earlier must beat particle 1.
        q.insert(0, 1.0);
        let (i, t) = q.peek_min().unwrap();
        assert_eq!(i, 0);
        assert!((t - 1.0).abs() < 1e-12);
    }

    #[test]
    fn growth_preserves_contents() {
        // Occupancy limit 2 with many same-bucket events forces growth.
        let mut q = EventQueue::new(16, 2, 10., 2);
        for i in 0..16 {
            q.insert(i, 0.1 + (i as f64) * 0.01);
        }

        let mut count = 0;
        let mut last = f64::NEG_INFINITY;
        while let Some((i, t)) = q.peek_min() {
            assert!(t >= last);
            last = t;
            q.remove(i);
            count += 1;
        }
        assert_eq!(count, 16);
    }

    #[test]
    fn beyond_horizon_clamps() {
        let mut q = EventQueue::new(2, 4, 10., 32);
        q.insert(0, 25.0); // beyond horizon
        q.insert(1, 1.0);
        let (i, _) = q.peek_min().unwrap();
        assert_eq!(i, 1);
    }

    #[test]
    fn scan_start_rewinds_on_early_insert() {
        let mut q = EventQueue::new(4, 8, 8., 32);
        q.insert(0, 7.0);
        let _ = q.peek_min(); // scan advances near the end
        q.insert(1, 0.5);
        let (i, _) = q.peek_min().unwrap();
        assert_eq!(i, 1);
    }
}
