//! # inode 表
//!
//! 整张表按块映射在内存里，读取只是内存复制；更新时把记录写入映射区，
//! 再为所在的块登记一次元数据写回。
//!
//! 托管卷上 inode 池可以扩容，扩容回调会同步增长映射区。

use alloc::boxed::Box;
use alloc::sync::Arc;

use vfs::Error;

use crate::allocator::{Allocator, PersistentStorage};
use crate::buffer::BlockBuffer;
use crate::layout::{
    blocks_for_inodes, DiskInode, Superblock, BLOCK_BITS, FVM_ABM_START, FVM_DAT_START,
    FVM_IBM_START, FVM_INO_START, FVM_SLICE_BLOCKS, INODES_PER_BLOCK, INODE_SIZE,
};
use crate::operation::{BlockId, Operation, OperationBuilder, PendingWork};
use crate::Result;

#[derive(Debug)]
pub struct InodeManager {
    start_block: BlockId,
    table: InodeTable,
    allocator: Arc<Allocator>,
}

/// 映射区与其增长上限，扩容回调持有一份克隆
#[derive(Debug, Clone)]
struct InodeTable {
    buffer: BlockBuffer,
    max_blocks: usize,
}

impl InodeTable {
    fn capacity(&self) -> usize {
        self.buffer.block_count() * INODES_PER_BLOCK
    }

    fn grow(&self, inode_count: usize) -> Result<()> {
        let blocks = blocks_for_inodes(inode_count);
        if blocks > self.max_blocks {
            log::warn!(
                "inode table cannot hold {inode_count} inodes, region has {} blocks",
                self.max_blocks
            );
            return Err(Error::NoSpace);
        }
        self.buffer.grow(blocks);
        Ok(())
    }
}

impl InodeManager {
    /// 映射 inode 表、登记读入操作，并建立 inode 池
    pub fn create(
        builder: &mut OperationBuilder,
        sb: &Superblock,
        start_block: BlockId,
        inode_count: usize,
    ) -> Self {
        let blocks = blocks_for_inodes(inode_count);
        let table = InodeTable {
            buffer: BlockBuffer::new(blocks),
            max_blocks: if sb.is_fvm() {
                (FVM_DAT_START - FVM_INO_START) as usize
            } else {
                blocks
            },
        };
        builder.add(Operation::read(0, start_block, blocks), &table.buffer);

        let ibm_block = BlockId::from(sb.ibm_block);
        let storage = if sb.is_fvm() {
            let limit = ((FVM_ABM_START - FVM_IBM_START) as usize * BLOCK_BITS)
                .min(table.max_blocks * INODES_PER_BLOCK);
            let grown = table.clone();
            PersistentStorage::growable(
                "inodes",
                ibm_block,
                limit,
                FVM_SLICE_BLOCKS as usize * INODES_PER_BLOCK,
            )
            .with_grow_callback(Box::new(move |count| grown.grow(count)))
        } else {
            PersistentStorage::fixed("inodes", ibm_block)
        };
        let allocator = Allocator::create(builder, storage, inode_count);

        Self {
            start_block,
            table,
            allocator,
        }
    }

    /// inode 池
    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    /// 写入映射区并登记所在块的写回
    pub fn update(&self, work: &mut dyn PendingWork, ino: u32, inode: &DiskInode) {
        let ino = ino as usize;
        assert!(
            ino < self.table.capacity(),
            "inode {ino} beyond table of {}",
            self.table.capacity()
        );
        self.table.buffer.set(ino * INODE_SIZE, inode);

        let block = ino / INODES_PER_BLOCK;
        work.enqueue_metadata(
            Operation::write(block, self.start_block + block, 1),
            &self.table.buffer,
        );
    }

    pub fn load(&self, ino: u32) -> Result<DiskInode> {
        let index = ino as usize;
        if index >= self.table.capacity() {
            log::error!(
                "inode {ino} outside the table of {} records",
                self.table.capacity()
            );
            return Err(Error::Io);
        }
        Ok(self.table.buffer.get(index * INODE_SIZE))
    }

    /// 增长到至少容纳 `inode_count` 条记录，失败时保持原大小
    pub fn grow(&self, inode_count: usize) -> Result<()> {
        self.table.grow(inode_count)
    }
}
