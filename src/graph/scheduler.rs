use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Deterministic dependency-count scheduler over operation indices.
///
/// Determinism rule: when multiple operations are ready, the smallest index (earliest declared) is
/// returned first.
pub(crate) struct DagScheduler {
    indeg: Vec<u32>,
    dependents: Vec<Vec<u32>>,
    ready: BinaryHeap<Reverse<u32>>,
    remaining: usize,
}

impl DagScheduler {
    /// `deps[i]` lists the operation indices operation `i` consumes. Repeats are allowed.
    pub(crate) fn new(deps: &[Vec<u32>]) -> Self {
        let n = deps.len();
        let mut indeg = vec![0u32; n];
        let mut dependents = vec![Vec::<u32>::new(); n];

        for (oi, op_deps) in deps.iter().enumerate() {
            let mut count = 0u32;
            for &d in op_deps {
                dependents[d as usize].push(oi as u32);
                count = count.saturating_add(1);
            }
            indeg[oi] = count;
        }

        let mut ready = BinaryHeap::<Reverse<u32>>::new();
        for (i, &deg) in indeg.iter().enumerate() {
            if deg == 0 {
                ready.push(Reverse(i as u32));
            }
        }

        Self {
            indeg,
            dependents,
            ready,
            remaining: n,
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.remaining
    }

    pub(crate) fn pop_ready(&mut self) -> Option<u32> {
        let Reverse(id) = self.ready.pop()?;
        Some(id)
    }

    pub(crate) fn mark_done(&mut self, done: u32) {
        self.remaining = self.remaining.saturating_sub(1);
        for &dep in &self.dependents[done as usize] {
            let d = &mut self.indeg[dep as usize];
            *d = d.saturating_sub(1);
            if *d == 0 {
                self.ready.push(Reverse(dep));
            }
        }
    }

    /// Drain into a full order, or return the indices left unscheduled (sorted) on a cycle.
    pub(crate) fn into_order(mut self) -> Result<Vec<u32>, Vec<u32>> {
        let mut order = Vec::with_capacity(self.remaining);
        while let Some(next) = self.pop_ready() {
            order.push(next);
            self.mark_done(next);
        }
        if self.remaining() == 0 {
            return Ok(order);
        }
        let mut stuck: Vec<u32> = self
            .indeg
            .iter()
            .enumerate()
            .filter(|(_, d)| **d > 0)
            .map(|(i, _)| i as u32)
            .collect();
        stuck.sort_unstable();
        Err(stuck)
    }
}
