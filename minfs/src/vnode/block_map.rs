//! 文件内块号到块指针位置的换算
//!
//! 间接块缓存在 vnode 的间接块区里，按槽位编址：
//! `0..31` 对应 `inum`，31 号是二级间接块，其子块从 32 号开始。

use vfs::Error;

use crate::layout::{BLOCK_SIZE, DIRECT_COUNT, INDIRECT_COUNT, MAX_FILE_BLOCKS, POINTERS_PER_BLOCK};
use crate::Result;

/// 二级间接块所在槽位
pub(crate) const DOUBLY_SLOT: usize = INDIRECT_COUNT;

/// 一级间接块覆盖的第一个文件块
pub(crate) const INDIRECT_START: usize = DIRECT_COUNT;
/// 二级间接块覆盖的第一个文件块
pub(crate) const DOUBLY_START: usize = INDIRECT_START + INDIRECT_COUNT * POINTERS_PER_BLOCK;

#[inline]
pub(crate) const fn doubly_child_slot(child: usize) -> usize {
    DOUBLY_SLOT + 1 + child
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockPosition {
    Direct(usize),
    /// `inum[slot]` 指向的间接块中的第 `index` 项
    Indirect { slot: usize, index: usize },
    /// 二级间接块第 `child` 项指向的间接块中的第 `index` 项
    DoublyIndirect { child: usize, index: usize },
}

impl BlockPosition {
    pub(crate) fn of(local: usize) -> Result<Self> {
        if local < INDIRECT_START {
            Ok(Self::Direct(local))
        } else if local < DOUBLY_START {
            let n = local - INDIRECT_START;
            Ok(Self::Indirect {
                slot: n / POINTERS_PER_BLOCK,
                index: n % POINTERS_PER_BLOCK,
            })
        } else if local < MAX_FILE_BLOCKS {
            let n = local - DOUBLY_START;
            Ok(Self::DoublyIndirect {
                child: n / POINTERS_PER_BLOCK,
                index: n % POINTERS_PER_BLOCK,
            })
        } else {
            Err(Error::FileTooLarge)
        }
    }
}

/// 写入 `[offset, offset + length)` 最坏情况下需要新分配的块数
///
/// 计入每个数据块，以及范围内可能需要新建的间接块。
pub(crate) fn required_block_count(offset: usize, length: usize) -> usize {
    if length == 0 {
        return 0;
    }
    let first = offset / BLOCK_SIZE;
    let last = ((offset + length - 1) / BLOCK_SIZE).min(MAX_FILE_BLOCKS - 1);
    if first > last {
        return 0;
    }
    let mut count = last - first + 1;

    let (lo, hi) = (first.max(INDIRECT_START), last.min(DOUBLY_START - 1));
    if lo <= hi {
        count += (hi - INDIRECT_START) / POINTERS_PER_BLOCK
            - (lo - INDIRECT_START) / POINTERS_PER_BLOCK
            + 1;
    }
    if last >= DOUBLY_START {
        let lo = first.max(DOUBLY_START) - DOUBLY_START;
        let hi = last - DOUBLY_START;
        count += 1 + hi / POINTERS_PER_BLOCK - lo / POINTERS_PER_BLOCK + 1;
    }
    count
}
