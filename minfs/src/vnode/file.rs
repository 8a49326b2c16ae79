//! # 普通文件
//!
//! 写入只修改内容缓存并标记待分配的文件块。提交数据时
//! [`Minfs::allocate_and_commit_data`] 分批为待分配块换入新的物理块，
//! 每批之后推进磁盘上的文件大小，崩溃时文件最多只是变短。

use vfs::Error;

use super::required_block_count;
use crate::config::batch_block_limit;
use crate::fs::Minfs;
use crate::layout::{BLOCK_SIZE, MAX_FILE_SIZE};
use crate::transaction::Transaction;
use crate::Result;

impl Minfs {
    fn ensure_file(&self, ino: u32) -> Result<()> {
        if self.vnode(ino).is_directory() {
            Err(Error::IsADirectory)
        } else {
            Ok(())
        }
    }

    pub(crate) fn file_read(&mut self, ino: u32, off: usize, buf: &mut [u8]) -> Result<usize> {
        self.ensure_file(ino)?;
        let (vnode, writeback) = self.vnode_io(ino);
        vnode.load_range(writeback, off, buf.len())?;
        Ok(vnode.read_internal(off, buf))
    }

    /// 写入 `buf`，超出文件上限的部分被截掉
    pub(crate) fn file_write(&mut self, ino: u32, off: usize, buf: &[u8]) -> Result<usize> {
        self.ensure_file(ino)?;
        if buf.is_empty() {
            return Ok(0);
        }
        if off >= MAX_FILE_SIZE {
            return Err(Error::FileTooLarge);
        }
        let len = buf.len().min(MAX_FILE_SIZE - off);
        let (vnode, writeback) = self.vnode_io(ino);
        vnode.prepare_write(writeback, off, len)?;

        let mut txn = self.begin_transaction(0, required_block_count(off, len))?;
        let written = self.vnode_mut(ino).write_internal(&mut txn, off, &buf[..len])?;
        txn.pin_vnode(ino);
        self.allocate_and_commit_data(ino, txn)?;
        Ok(written)
    }

    /// 追加到文件末尾，返回新的末尾与写入的字节数
    pub(crate) fn file_append(&mut self, ino: u32, buf: &[u8]) -> Result<(usize, usize)> {
        self.ensure_file(ino)?;
        let off = self.vnode(ino).size();
        let written = self.file_write(ino, off, buf)?;
        Ok((off + written, written))
    }

    pub(crate) fn file_truncate(&mut self, ino: u32, len: usize) -> Result<()> {
        self.ensure_file(ino)?;
        if len > MAX_FILE_SIZE {
            return Err(Error::FileTooLarge);
        }

        let (vnode, writeback) = self.vnode_io(ino);
        vnode.prepare_truncate(writeback, len)?;

        // 截断到块中间时，末块需要写时复制
        let mut txn = self.begin_transaction(0, 1)?;
        self.vnode_mut(ino).truncate_internal(&mut txn, len)?;
        txn.pin_vnode(ino);

        let vnode = self.vnode_mut(ino);
        if !vnode.allocation_state().is_empty() {
            return self.allocate_and_commit_data(ino, txn);
        }
        vnode.inode.size = len as u32;
        vnode.allocation_state().reset(len as u32);
        self.inode_sync(&mut txn, ino);
        self.commit_transaction(txn);
        log::debug!("inode {ino}: truncated to {len}");
        Ok(())
    }

    /// 为全部待分配块换入物理块，并提交数据与元数据
    ///
    /// 每个事务最多换入 [`batch_block_limit`] 块；剩余的预留转交给下一个事务。
    pub(crate) fn allocate_and_commit_data(&mut self, ino: u32, mut txn: Transaction) -> Result<()> {
        let limit = batch_block_limit(self.writeback.capacity());
        {
            let state = self.vnode_mut(ino).allocation_state();
            log::debug!(
                "inode {ino}: {} blocks pending, {} of them new",
                state.total_pending(),
                state.new_pending()
            );
        }

        loop {
            let vnode = self.vnode_mut(ino);
            let mut batched = 0;
            while batched < limit {
                let Some(range) = vnode.allocation_state().next_range() else {
                    break;
                };
                let end = range.end.min(range.start + (limit - batched) as u32);
                let range = range.start..end;

                let swapped = vnode.blocks_swap(&mut txn, range.clone())?;
                // 物理块不一定连续，逐块写回
                for (local, bno) in range.clone().zip(swapped) {
                    vnode.issue_writeback(&mut txn, local as usize, bno);
                }
                batched += range.len();

                let mapped = (range.end as usize * BLOCK_SIZE).min(vnode.size()) as u32;
                if mapped > vnode.inode.size {
                    vnode.inode.size = mapped;
                }
            }
            if vnode.allocation_state().is_empty() {
                break;
            }

            self.inode_sync(&mut txn, ino);
            let cached = txn.take_block_reservations();
            log::trace!(
                "inode {ino}: batch of {batched} blocks committed, {} blocks still reserved",
                cached.reserved()
            );
            self.commit_transaction(txn);
            txn = Transaction::from_cached_block_transaction(self.inodes.allocator(), cached);
            txn.pin_vnode(ino);
        }

        let vnode = self.vnode_mut(ino);
        let size = vnode.size() as u32;
        vnode.inode.size = size;
        vnode.allocation_state().reset(size);
        self.inode_sync(&mut txn, ino);
        txn.pin_vnode(ino);
        self.commit_transaction(txn);
        Ok(())
    }
}
