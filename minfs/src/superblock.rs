//! 超级块管理
//!
//! 内存中的副本是两次提交之间唯一可信的来源，写回时才重新计算校验和。

use block_dev::BlockDevice;
use vfs::Error;

use crate::buffer::BlockBuffer;
use crate::layout::{Superblock, BLOCK_SIZE, SUPERBLOCK_START};
use crate::operation::{Operation, PendingWork};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityCheck {
    /// 跳过校验，仅供恢复工具使用
    None,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateBackup {
    No,
    Yes,
}

#[derive(Debug)]
pub struct SuperblockManager {
    info: Superblock,
    buffer: BlockBuffer,
    dirty: bool,
}

impl SuperblockManager {
    pub fn create(
        device: &dyn BlockDevice,
        candidate: &Superblock,
        max_blocks: usize,
        check: IntegrityCheck,
    ) -> Result<Self> {
        if device.block_size() != BLOCK_SIZE {
            log::error!(
                "device block size {} does not match {BLOCK_SIZE}",
                device.block_size()
            );
            return Err(Error::NotSupported);
        }
        if check == IntegrityCheck::All {
            candidate.check(max_blocks)?;
        }

        let buffer = BlockBuffer::new(1);
        buffer.set(0, candidate);
        Ok(Self {
            info: *candidate,
            buffer,
            dirty: false,
        })
    }

    pub fn info(&self) -> &Superblock {
        &self.info
    }

    /// 取得可修改的超级块，并标记为脏
    pub fn mutable_info(&mut self) -> &mut Superblock {
        self.dirty = true;
        &mut self.info
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// 登记主超级块（以及可选的备份）的写回
    pub fn write(&mut self, work: &mut dyn PendingWork, backup: UpdateBackup) {
        self.info.update_checksum();
        self.buffer.set(0, &self.info);

        work.enqueue_metadata(Operation::write(0, SUPERBLOCK_START, 1), &self.buffer);
        if backup == UpdateBackup::Yes {
            work.enqueue_metadata(
                Operation::write(0, self.info.backup_location(), 1),
                &self.buffer,
            );
        }
        self.dirty = false;
    }
}
