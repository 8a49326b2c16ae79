//! 格式化与挂载参数

use crate::layout::POINTERS_PER_BLOCK;

/// 写回管线默认容量（块）
pub const WRITEBACK_CAPACITY: usize = 256;

/// 一批数据分配最多触及的间接块数
pub const MAX_INDIRECT_PER_BATCH: usize = 4;

/// 单个事务内一次换入的数据块数上限
///
/// 取触及至多 [`MAX_INDIRECT_PER_BATCH`] 个间接块（含二级间接块本身与
/// 跨边界时的首尾两块）所能覆盖的数据块数，与写回容量的一半二者中的较小者。
pub const fn batch_block_limit(writeback_capacity: usize) -> usize {
    let reachable = (MAX_INDIRECT_PER_BATCH - 2) * POINTERS_PER_BLOCK;
    let half = writeback_capacity / 2;
    let limit = if reachable < half { reachable } else { half };
    if limit == 0 { 1 } else { limit }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountOptions {
    /// 挂载时校验超级块
    pub integrity_check: bool,
    /// 主超级块损坏时尝试从备份恢复
    pub repair: bool,
    /// 卸载时同步备份超级块
    pub update_backup_superblock: bool,
    pub writeback_capacity: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            integrity_check: true,
            repair: true,
            update_backup_superblock: true,
            writeback_capacity: WRITEBACK_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatOptions {
    /// 数据区块数，`None` 表示占满设备
    ///
    /// 托管卷上表示初始分配的数据块数，至少一个分片。
    pub data_blocks: Option<usize>,
    pub inode_count: usize,
    /// 按托管卷布局格式化
    pub fvm: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            data_blocks: None,
            inode_count: 128,
            fvm: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::DIRECT_COUNT;

    #[test]
    fn batch_limit() {
        assert_eq!(128, batch_block_limit(WRITEBACK_CAPACITY));
        assert_eq!(2 * POINTERS_PER_BLOCK, batch_block_limit(4096));
        assert_eq!(1, batch_block_limit(1));
        assert!(batch_block_limit(WRITEBACK_CAPACITY) > DIRECT_COUNT);
    }
}
