//! 文件的待分配状态
//!
//! 写入只标记被触及的文件块，物理块推迟到提交数据时才换入。

use alloc::collections::BTreeMap;
use core::ops::Range;

#[derive(Debug, Clone, Default)]
pub(crate) struct PendingAllocationState {
    /// 文件块号 -> 标记时是否已映射
    pending: BTreeMap<u32, bool>,
    /// 写入者看到的文件大小，可能领先于 inode 中的大小
    node_size: u32,
}

impl PendingAllocationState {
    pub(crate) fn new(node_size: u32) -> Self {
        Self {
            pending: BTreeMap::new(),
            node_size,
        }
    }

    /// 重复标记保留第一次记录的映射状态
    pub(crate) fn set_pending(&mut self, local: u32, allocated: bool) {
        self.pending.entry(local).or_insert(allocated);
    }

    /// 返回被清除的标记是否对应已映射的块
    pub(crate) fn clear_pending(&mut self, local: u32) -> Option<bool> {
        self.pending.remove(&local)
    }

    pub(crate) fn is_pending(&self, local: u32) -> bool {
        self.pending.contains_key(&local)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn total_pending(&self) -> usize {
        self.pending.len()
    }

    /// 需要新增（而非替换）物理块的数量
    pub(crate) fn new_pending(&self) -> usize {
        self.pending.values().filter(|&&allocated| !allocated).count()
    }

    /// 第一段连续的待分配块
    pub(crate) fn next_range(&self) -> Option<Range<u32>> {
        let mut locals = self.pending.keys().copied();
        let start = locals.next()?;
        let mut end = start + 1;
        for local in locals {
            if local != end {
                break;
            }
            end += 1;
        }
        Some(start..end)
    }

    pub(crate) fn node_size(&self) -> u32 {
        self.node_size
    }

    pub(crate) fn set_node_size(&mut self, size: u32) {
        self.node_size = size;
    }

    /// 丢弃全部标记
    pub(crate) fn reset(&mut self, size: u32) {
        self.pending.clear();
        self.node_size = size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_follow_contiguous_marks() {
        let mut state = PendingAllocationState::new(0);
        assert_eq!(None, state.next_range());

        for local in [7, 3, 4, 5, 9] {
            state.set_pending(local, local == 4);
        }
        assert_eq!(Some(3..6), state.next_range());
        assert_eq!(5, state.total_pending());
        assert_eq!(4, state.new_pending());

        for local in 3..6 {
            assert!(state.clear_pending(local).is_some());
        }
        assert_eq!(Some(7..8), state.next_range());
        assert!(state.is_pending(9));
        assert!(!state.is_pending(4));
    }

    #[test]
    fn first_mark_wins() {
        let mut state = PendingAllocationState::new(0);
        state.set_pending(2, false);
        state.set_pending(2, true);
        assert_eq!(Some(false), state.clear_pending(2));
        assert_eq!(None, state.clear_pending(2));
        assert!(state.is_empty());
    }

    #[test]
    fn reset_discards_marks() {
        let mut state = PendingAllocationState::new(10);
        state.set_pending(0, true);
        state.set_node_size(4096);
        state.reset(100);
        assert!(state.is_empty());
        assert_eq!(100, state.node_size());
    }
}
