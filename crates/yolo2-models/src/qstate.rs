//! Activation Q tracking across layers
//!
//! Each conv writes its output at `Qa_out`, and the next conv must read it
//! at that same Q. Routes and the host-side reorg break the simple chain:
//! a route can re-expose an old tensor with its own Q, and the passthrough
//! concat joins two tensors that were written at different Qs.
//!
//! Transitions:
//!
//! | Layer | Effect |
//! |-------|--------|
//! | conv | `Qa_in` = pending or table; `current = Qa_out` |
//! | conv (branch) | as above, then `branch = current` |
//! | pool | none |
//! | reorg | with a branch: `current = pending = min(branch, current)` |
//! | route, one source | `current = pending = Q of source` |
//! | route, many | none |

use yolo2_chip::QValues;

/// How the reorg output and the cached branch are brought to one Q
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignment {
    /// Q both halves of the concat end up at.
    pub target: i32,
    /// Right shift applied to the reorg output.
    pub reorg_shift: i32,
    /// Right shift applied to the branch tensor.
    pub branch_shift: i32,
}

/// Q bookkeeping for one inference
#[derive(Debug, Clone)]
pub struct QState {
    current: i32,
    pending: Option<i32>,
    branch: Option<i32>,
    recorded: Vec<Option<i32>>,
}

impl QState {
    /// Start at the network input Q.
    pub fn new(input_q: i32, layers: usize) -> Self {
        Self {
            current: input_q,
            pending: None,
            branch: None,
            recorded: vec![None; layers],
        }
    }

    /// Q of the tensor the next layer reads.
    pub const fn current(&self) -> i32 {
        self.current
    }

    /// Override for the next conv's input Q.
    pub const fn pending(&self) -> Option<i32> {
        self.pending
    }

    /// Cached output Q of the branch layer.
    pub const fn branch(&self) -> Option<i32> {
        self.branch
    }

    /// Output Q recorded for layer `index`.
    pub fn recorded(&self, index: usize) -> Option<i32> {
        self.recorded.get(index).copied().flatten()
    }

    /// Output Q of every layer run so far.
    pub fn layer_q(&self) -> &[Option<i32>] {
        &self.recorded
    }

    /// Q values for a conv: table values with any pending input override
    /// applied. The override is consumed.
    pub fn begin_conv(&mut self, table: QValues) -> QValues {
        match self.pending.take() {
            Some(q) => QValues { act_in: q, ..table },
            None => table,
        }
    }

    /// Record a finished conv that wrote at `q_out`.
    pub fn finish_conv(&mut self, index: usize, q_out: i32) {
        self.current = q_out;
        self.record(index);
    }

    /// Remember the current Q as the branch Q; called after the branch
    /// layer's conv.
    pub fn cache_branch(&mut self) {
        self.branch = Some(self.current);
    }

    /// Pools leave Q alone.
    pub fn pass_through(&mut self, index: usize) {
        self.record(index);
    }

    /// Reorg: with a cached branch, pick the shared Q for the concat.
    ///
    /// Returns the shifts to apply, or `None` if there is nothing to align.
    pub fn align_reorg(&mut self, index: usize) -> Option<Alignment> {
        let alignment = self.branch.map(|branch| {
            let target = branch.min(self.current);
            Alignment {
                target,
                reorg_shift: self.current - target,
                branch_shift: branch - target,
            }
        });
        if let Some(a) = alignment {
            self.current = a.target;
            self.pending = Some(a.target);
            self.branch = Some(a.target);
        }
        self.record(index);
        alignment
    }

    /// Route: a single source re-exposes its own Q; a concat keeps the
    /// current one.
    ///
    /// The routed Q is marked pending so the next conv reads the tensor at
    /// the Q it was stored with, even when the table's input Q for that
    /// conv names a different one.
    pub fn route(&mut self, index: usize, sources: &[usize]) {
        if let [source] = sources {
            if let Some(q) = self.recorded(*source) {
                self.current = q;
                self.pending = Some(q);
            }
        }
        self.record(index);
    }

    fn record(&mut self, index: usize) {
        if let Some(slot) = self.recorded.get_mut(index) {
            *slot = Some(self.current);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(act_in: i32, act_out: i32) -> QValues {
        QValues {
            weight: 14,
            act_in,
            act_out,
            bias: 12,
        }
    }

    #[test]
    fn test_conv_chain_uses_table_values() {
        let mut q = QState::new(8, 3);
        let v = q.begin_conv(table(8, 6));
        assert_eq!(v.act_in, 8);
        q.finish_conv(0, v.act_out);
        q.pass_through(1);
        assert_eq!(q.current(), 6);
        assert_eq!(q.recorded(1), Some(6));
        assert_eq!(q.pending(), None);
    }

    #[test]
    fn test_pending_overrides_input_once() {
        let mut q = QState::new(8, 4);
        q.finish_conv(0, 5);
        q.finish_conv(1, 9);
        q.route(2, &[0]);
        assert_eq!((q.current(), q.pending()), (5, Some(5)));

        let v = q.begin_conv(table(9, 7));
        assert_eq!(v.act_in, 5);
        assert_eq!((v.weight, v.act_out, v.bias), (14, 7, 12));
        assert_eq!(q.pending(), None);
        q.finish_conv(3, v.act_out);
        assert_eq!(q.begin_conv(table(7, 7)).act_in, 7);
    }

    #[test]
    fn test_concat_route_keeps_current() {
        let mut q = QState::new(8, 3);
        q.finish_conv(0, 4);
        q.finish_conv(1, 6);
        q.route(2, &[0, 1]);
        assert_eq!(q.current(), 6);
        assert_eq!(q.pending(), None);
    }

    #[test]
    fn test_reorg_aligns_down_to_lower_q() {
        let mut q = QState::new(8, 4);
        q.finish_conv(0, 7);
        q.cache_branch();
        q.finish_conv(1, 9);
        let a = q.align_reorg(2).unwrap();
        assert_eq!(
            a,
            Alignment {
                target: 7,
                reorg_shift: 2,
                branch_shift: 0
            }
        );
        assert_eq!((q.current(), q.pending(), q.branch()), (7, Some(7), Some(7)));
        assert_eq!(q.recorded(2), Some(7));
    }

    #[test]
    fn test_reorg_shifts_branch_when_it_is_higher() {
        let mut q = QState::new(8, 3);
        q.finish_conv(0, 11);
        q.cache_branch();
        q.finish_conv(1, 8);
        let a = q.align_reorg(2).unwrap();
        assert_eq!((a.target, a.reorg_shift, a.branch_shift), (8, 0, 3));
    }

    #[test]
    fn test_reorg_without_branch_passes_through() {
        let mut q = QState::new(8, 2);
        q.finish_conv(0, 9);
        assert_eq!(q.align_reorg(1), None);
        assert_eq!((q.current(), q.pending()), (9, None));
    }
}
