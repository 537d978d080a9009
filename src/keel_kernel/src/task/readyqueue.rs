//! Task ready queue implementation (internal use only).
//!
//! One FIFO ring per priority level, plus a level bitmap so selection is a
//! find-first-set followed by a ring pop. A task becoming ready is enqueued
//! at the tail of its level; rotation within a level is pop-head /
//! push-tail.
use alloc::collections::VecDeque;

use crate::task::{Priority, TaskId};
use crate::utils::{Init, LevelBitmap, PrioBitmap};

pub(crate) struct ReadyQueue {
    /// The set of segregated rings, in which each ring stores the ready
    /// tasks at the corresponding priority level in FIFO order.
    ///
    /// Invariant: `!rings[i].is_empty() == bitmap.get(i)`
    rings: [VecDeque<TaskId>; Priority::LEVELS],

    /// The ready bitmap; bit `i` indicates ring `i` is non-empty.
    bitmap: LevelBitmap,
}

impl ReadyQueue {
    pub(crate) const fn new() -> Self {
        const EMPTY: VecDeque<TaskId> = VecDeque::new();
        Self {
            rings: [EMPTY; Priority::LEVELS],
            bitmap: LevelBitmap::INIT,
        }
    }

    /// Insert `task` at the tail of its level's ring.
    pub(crate) fn push_back(&mut self, level: usize, task: TaskId) {
        debug_assert!(!self.rings[level].contains(&task));
        self.rings[level].push_back(task);
        self.bitmap.set(level);
    }

    /// The highest (numerically lowest) non-empty level.
    pub(crate) fn highest_level(&self) -> Option<usize> {
        self.bitmap.find_set()
    }

    /// Pop the head of the highest non-empty ring.
    pub(crate) fn pop_highest(&mut self) -> Option<(usize, TaskId)> {
        let level = self.bitmap.find_set()?;
        let task = self.rings[level].pop_front();
        debug_assert!(task.is_some());
        if self.rings[level].is_empty() {
            self.bitmap.clear(level);
        }
        task.map(|t| (level, t))
    }

    /// Remove `task` from its level's ring, wherever it sits. Used when a
    /// ready task is suspended, cancelled, re-prioritized, or claimed by the
    /// real-time hook.
    pub(crate) fn remove(&mut self, level: usize, task: TaskId) -> bool {
        let ring = &mut self.rings[level];
        if let Some(pos) = ring.iter().position(|&t| t == task) {
            ring.remove(pos);
            if ring.is_empty() {
                self.bitmap.clear(level);
            }
            true
        } else {
            false
        }
    }

    pub(crate) fn contains(&self, level: usize, task: TaskId) -> bool {
        self.rings[level].contains(&task)
    }

    /// Ready tasks in selection order (level-major, FIFO within a level).
    pub(crate) fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.rings.iter().flat_map(|ring| ring.iter().copied())
    }
}

impl Init for ReadyQueue {
    const INIT: Self = Self::new();
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn tid(n: u16) -> TaskId {
        TaskId::new(n).unwrap()
    }

    /// A naive reference model: a single vector of `(level, id)` pairs in
    /// insertion order.
    #[derive(Default)]
    struct Model {
        entries: Vec<(usize, TaskId)>,
    }

    impl Model {
        fn push_back(&mut self, level: usize, task: TaskId) {
            self.entries.push((level, task));
        }

        fn pop_highest(&mut self) -> Option<(usize, TaskId)> {
            let mut best: Option<(usize, usize)> = None;
            for (i, &(level, _)) in self.entries.iter().enumerate() {
                if best.map_or(true, |(best_level, _)| level < best_level) {
                    best = Some((level, i));
                }
            }
            best.map(|(_, i)| self.entries.remove(i))
        }

        fn remove(&mut self, level: usize, task: TaskId) -> bool {
            if let Some(i) = self
                .entries
                .iter()
                .position(|&(l, t)| l == level && t == task)
            {
                self.entries.remove(i);
                true
            } else {
                false
            }
        }
    }

    #[quickcheck]
    fn matches_reference_model(ops: Vec<(u8, u8)>) {
        let mut subject = ReadyQueue::new();
        let mut model = Model::default();
        let mut next = 1u16;
        let mut live: Vec<(usize, TaskId)> = Vec::new();

        for (op, data) in ops {
            match op % 3 {
                0 => {
                    let level = (data % 8) as usize;
                    let task = tid(next);
                    next += 1;
                    subject.push_back(level, task);
                    model.push_back(level, task);
                    live.push((level, task));
                }
                1 => {
                    let a = subject.pop_highest();
                    let b = model.pop_highest();
                    assert_eq!(a, b);
                    if let Some(e) = a {
                        live.retain(|&x| x != e);
                    }
                }
                _ => {
                    if !live.is_empty() {
                        let (level, task) = live.remove(data as usize % live.len());
                        assert!(subject.remove(level, task));
                        assert!(model.remove(level, task));
                    }
                }
            }
            assert_eq!(
                subject.highest_level(),
                model.entries.iter().map(|&(l, _)| l).min()
            );
        }

        // Drain both; order must agree the whole way down.
        loop {
            let a = subject.pop_highest();
            let b = model.pop_highest();
            assert_eq!(a, b);
            if a.is_none() {
                break;
            }
        }
    }

    #[test]
    fn fifo_within_level() {
        let mut q = ReadyQueue::new();
        q.push_back(4, tid(1));
        q.push_back(4, tid(2));
        q.push_back(4, tid(3));
        assert_eq!(q.pop_highest(), Some((4, tid(1))));
        q.push_back(4, tid(1));
        assert_eq!(q.pop_highest(), Some((4, tid(2))));
        assert_eq!(q.pop_highest(), Some((4, tid(3))));
        assert_eq!(q.pop_highest(), Some((4, tid(1))));
        assert_eq!(q.pop_highest(), None);
    }

    #[test]
    fn higher_level_wins() {
        let mut q = ReadyQueue::new();
        q.push_back(7, tid(1));
        q.push_back(0, tid(2));
        q.push_back(4, tid(3));
        assert_eq!(q.pop_highest(), Some((0, tid(2))));
        assert_eq!(q.pop_highest(), Some((4, tid(3))));
        assert_eq!(q.pop_highest(), Some((7, tid(1))));
    }
}
