//! # vnode
//!
//! [`VnodeMinfs`] 是文件与目录共享的内存状态：inode 记录、内容缓存与间接块缓存。
//! 二者的差别集中在可写块的获取与写回方式上：
//!
//! - 目录原地写，缺块时立即分配，写回归入元数据队列；
//! - 文件只标记待分配，提交数据时再换入新块（写时复制），写回归入数据队列。
//!
//! 所有 vnode 都存放在 [`Minfs`](crate::Minfs) 的缓存里，按 inode 编号索引，
//! 对外只交出持有编号的 [`Vnode`] 句柄。

mod allocation_state;
mod block_map;
mod directory;
mod file;
mod handle;

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::mem;
use core::ops::Range;

use vfs::{DirEntryType, Error, Stat};

use self::allocation_state::PendingAllocationState;
use self::block_map::{BlockPosition, DOUBLY_SLOT, DOUBLY_START, INDIRECT_START, doubly_child_slot};
use crate::buffer::BlockBuffer;
use crate::inode_manager::InodeManager;
use crate::layout::{
    Dirent, DiskInode, Superblock, BLOCK_SIZE, DIRECT_COUNT, INDIRECT_COUNT, MAX_DIRECTORY_SIZE,
    MAX_DIRENT_SIZE, MAX_FILE_BLOCKS, MAX_FILE_SIZE, POINTERS_PER_BLOCK,
};
use crate::operation::{BlockId, Operation, OperationBuilder, PendingWork};
use crate::transaction::Transaction;
use crate::writeback::Writeback;
use crate::Result;

pub use self::handle::{DirCookie, Vnode};
pub(crate) use self::block_map::required_block_count;

#[derive(Debug)]
pub(crate) enum VnodeKind {
    File(PendingAllocationState),
    Directory {
        /// 挂载点
        remote: bool,
    },
}

#[derive(Debug)]
pub(crate) struct VnodeMinfs {
    pub(crate) ino: u32,
    pub(crate) inode: DiskInode,
    /// 数据区起始块
    dat_block: BlockId,
    /// 内容缓存，第 i 块对应文件块 i；按需增长
    data: BlockBuffer,
    /// 缓存内容可信的文件块，未映射的块读作零，不必登记
    loaded: BTreeSet<usize>,
    /// 间接块缓存，槽位划分见 [`block_map`]
    indirect: BlockBuffer,
    /// 修改过、待写回的间接块槽位
    dirty_indirect: BTreeSet<usize>,
    pub(crate) open_count: usize,
    pub(crate) kind: VnodeKind,
}

impl VnodeMinfs {
    /// 新建的 inode，尚无任何块
    pub(crate) fn new(ino: u32, inode: DiskInode, dat_block: BlockId) -> Self {
        let kind = if inode.is_directory() {
            VnodeKind::Directory { remote: false }
        } else {
            VnodeKind::File(PendingAllocationState::new(inode.size))
        };
        Self {
            ino,
            inode,
            dat_block,
            data: BlockBuffer::default(),
            loaded: BTreeSet::new(),
            indirect: BlockBuffer::default(),
            dirty_indirect: BTreeSet::new(),
            open_count: 0,
            kind,
        }
    }

    /// 校验 inode 并读入间接块
    ///
    /// 目录的每个操作都要遍历目录项，内容随之整体读入；文件内容等到读写时才按块读入。
    pub(crate) fn load(
        ino: u32,
        inode: DiskInode,
        sb: &Superblock,
        writeback: &Writeback,
    ) -> Result<Self> {
        let max_size = match inode.kind() {
            Some(DirEntryType::Directory) => MAX_DIRECTORY_SIZE,
            Some(DirEntryType::Regular) => MAX_FILE_SIZE,
            None => {
                log::error!("inode {ino} has bad magic {:#x}", inode.magic);
                return Err(Error::Io);
            }
        };
        if inode.size as usize > max_size {
            log::error!("inode {ino} claims size {}", inode.size);
            return Err(Error::Io);
        }

        let block_count = sb.block_count;
        let check = |bno: u32| {
            if bno < block_count {
                Ok(())
            } else {
                log::error!("inode {ino} points at block {bno} outside {block_count} data blocks");
                Err(Error::Io)
            }
        };
        let roots = inode.dnum.iter().chain(&inode.inum).chain(&inode.dinum);
        for &bno in roots {
            check(bno)?;
        }

        let mut vnode = Self::new(ino, inode, BlockId::from(sb.dat_block));
        let mut builder = OperationBuilder::default();

        for (slot, &bno) in inode.inum.iter().enumerate() {
            if bno != 0 {
                vnode.read_indirect(&mut builder, slot, bno);
            }
        }
        if inode.dinum[0] != 0 {
            vnode.read_indirect(&mut builder, DOUBLY_SLOT, inode.dinum[0]);
        }
        writeback.transact(builder.take());

        if inode.dinum[0] != 0 {
            for child in 0..POINTERS_PER_BLOCK {
                let bno = vnode.slot_get(DOUBLY_SLOT, child);
                if bno != 0 {
                    check(bno)?;
                    vnode.read_indirect(&mut builder, doubly_child_slot(child), bno);
                }
            }
            writeback.transact(builder.take());
        }

        for slot in 0..vnode.indirect.block_count() {
            if vnode.slot_pointer(slot) == 0 {
                continue;
            }
            for index in 0..POINTERS_PER_BLOCK {
                check(vnode.slot_get(slot, index))?;
            }
        }

        if vnode.is_directory() {
            let blocks = vnode.size().div_ceil(BLOCK_SIZE);
            vnode.ensure_loaded(writeback, 0..blocks)?;
        }
        Ok(vnode)
    }

    fn read_indirect(&mut self, builder: &mut OperationBuilder, slot: usize, bno: u32) {
        self.indirect.grow(slot + 1);
        builder.add(
            Operation::read(slot, self.dat_block + bno as usize, 1),
            &self.indirect,
        );
    }

    pub(crate) fn is_directory(&self) -> bool {
        matches!(self.kind, VnodeKind::Directory { .. })
    }

    pub(crate) fn is_unlinked(&self) -> bool {
        self.inode.link_count == 0
    }

    pub(crate) fn is_remote(&self) -> bool {
        matches!(self.kind, VnodeKind::Directory { remote: true })
    }

    /// 文件的待分配状态
    pub(crate) fn allocation_state(&mut self) -> &mut PendingAllocationState {
        match &mut self.kind {
            VnodeKind::File(state) => state,
            VnodeKind::Directory { .. } => panic!("directory {} has no allocation state", self.ino),
        }
    }

    /// 写入者看到的大小
    pub(crate) fn size(&self) -> usize {
        match &self.kind {
            VnodeKind::File(state) => state.node_size() as usize,
            VnodeKind::Directory { .. } => self.inode.size as usize,
        }
    }

    fn set_size(&mut self, size: usize) {
        match &mut self.kind {
            VnodeKind::File(state) => state.set_node_size(size as u32),
            VnodeKind::Directory { .. } => self.inode.size = size as u32,
        }
    }

    pub(crate) fn stat(&self) -> Stat {
        Stat {
            mode: if self.is_directory() {
                DirEntryType::Directory
            } else {
                DirEntryType::Regular
            },
            ino: self.ino as u64,
            links: self.inode.link_count,
            block_size: BLOCK_SIZE as u64,
            blocks: self.inode.block_count as u64,
            size: self.size() as u64,
        }
    }

    pub(crate) fn can_unlink(&self) -> Result<()> {
        if !self.is_directory() {
            return Ok(());
        }
        // 只剩 `.` 与 `..`
        if self.inode.dirent_count != 2 {
            return Err(Error::DirectoryNotEmpty);
        }
        if self.is_remote() {
            return Err(Error::Unavailable);
        }
        Ok(())
    }
}

/// 块指针的读写
impl VnodeMinfs {
    fn slot_get(&self, slot: usize, index: usize) -> u32 {
        if slot >= self.indirect.block_count() {
            return 0;
        }
        self.indirect.get(slot * BLOCK_SIZE + index * mem::size_of::<u32>())
    }

    fn slot_set(&mut self, slot: usize, index: usize, bno: u32) {
        self.indirect.grow(slot + 1);
        self.indirect
            .set(slot * BLOCK_SIZE + index * mem::size_of::<u32>(), &bno);
        self.dirty_indirect.insert(slot);
    }

    /// 槽位对应的间接块块号
    fn slot_pointer(&self, slot: usize) -> u32 {
        if slot < INDIRECT_COUNT {
            self.inode.inum[slot]
        } else if slot == DOUBLY_SLOT {
            self.inode.dinum[0]
        } else {
            self.slot_get(DOUBLY_SLOT, slot - DOUBLY_SLOT - 1)
        }
    }

    /// 新建一个清零的间接块
    fn new_indirect(&mut self, txn: &mut Transaction, slot: usize) -> u32 {
        let bno = txn.allocate_block();
        self.inode.block_count += 1;
        self.indirect.grow(slot + 1);
        self.indirect.fill(slot * BLOCK_SIZE, BLOCK_SIZE, 0);
        self.dirty_indirect.insert(slot);
        bno
    }

    /// 文件块对应的数据块号，0 表示未映射
    pub(crate) fn block_get(&self, local: usize) -> Result<u32> {
        Ok(match BlockPosition::of(local)? {
            BlockPosition::Direct(i) => self.inode.dnum[i],
            BlockPosition::Indirect { slot, index } => {
                if self.inode.inum[slot] == 0 {
                    0
                } else {
                    self.slot_get(slot, index)
                }
            }
            BlockPosition::DoublyIndirect { child, index } => {
                if self.inode.dinum[0] == 0 || self.slot_get(DOUBLY_SLOT, child) == 0 {
                    0
                } else {
                    self.slot_get(doubly_child_slot(child), index)
                }
            }
        })
    }

    /// 映射一个数据块，途经的间接块缺失时一并分配
    pub(crate) fn block_set(&mut self, txn: &mut Transaction, local: usize, bno: u32) -> Result<()> {
        match BlockPosition::of(local)? {
            BlockPosition::Direct(i) => self.inode.dnum[i] = bno,
            BlockPosition::Indirect { slot, index } => {
                if self.inode.inum[slot] == 0 {
                    let indirect = self.new_indirect(txn, slot);
                    self.inode.inum[slot] = indirect;
                }
                self.slot_set(slot, index, bno);
            }
            BlockPosition::DoublyIndirect { child, index } => {
                if self.inode.dinum[0] == 0 {
                    let doubly = self.new_indirect(txn, DOUBLY_SLOT);
                    self.inode.dinum[0] = doubly;
                }
                let child_slot = doubly_child_slot(child);
                if self.slot_get(DOUBLY_SLOT, child) == 0 {
                    let indirect = self.new_indirect(txn, child_slot);
                    self.slot_set(DOUBLY_SLOT, child, indirect);
                }
                self.slot_set(child_slot, index, bno);
            }
        }
        Ok(())
    }

    fn flush_indirect(&mut self, txn: &mut Transaction) {
        for slot in mem::take(&mut self.dirty_indirect) {
            let bno = self.slot_pointer(slot);
            if bno != 0 {
                txn.enqueue_metadata(
                    Operation::write(slot, self.dat_block + bno as usize, 1),
                    &self.indirect,
                );
            }
        }
    }

    /// 登记间接块与 inode 的写回
    pub(crate) fn inode_sync(&mut self, txn: &mut Transaction, inodes: &InodeManager) {
        self.flush_indirect(txn);
        inodes.update(txn, self.ino, &self.inode);
    }
}

/// 按类型分派的块操作
impl VnodeMinfs {
    /// 准备写入文件块 `local`
    ///
    /// 文件只记下待分配标记，返回 `None`；目录缺块时立即分配，返回可原地写的块号。
    pub(crate) fn acquire_writable_block(
        &mut self,
        txn: &mut Transaction,
        local: usize,
    ) -> Result<Option<u32>> {
        let bno = self.block_get(local)?;
        if let VnodeKind::File(state) = &mut self.kind {
            state.set_pending(local as u32, bno != 0);
            return Ok(None);
        }
        if bno != 0 {
            return Ok(Some(bno));
        }
        let bno = txn.allocate_block();
        self.block_set(txn, local, bno)?;
        self.inode.block_count += 1;
        Ok(Some(bno))
    }

    /// 登记文件块 `local`（位于数据块 `bno`）的写回
    pub(crate) fn issue_writeback(&self, txn: &mut Transaction, local: usize, bno: u32) {
        let op = Operation::write(local, self.dat_block + bno as usize, 1);
        if self.is_directory() {
            txn.enqueue_metadata(op, &self.data);
        } else {
            txn.enqueue_data(op, &self.data);
        }
    }

    /// 释放一个块，并扣减块数
    ///
    /// 数据块同时清除残留的待分配标记，免得之后把它当作仍待换入。
    pub(crate) fn delete_block(
        &mut self,
        txn: &mut Transaction,
        local: usize,
        old: u32,
        indirect: bool,
    ) {
        txn.deallocate_block(old);
        self.inode.block_count -= 1;
        if !indirect {
            if let VnodeKind::File(state) = &mut self.kind {
                state.clear_pending(local as u32);
            }
        }
    }

    /// 为待分配的一段文件块换入新块，返回换入的块号
    ///
    /// 原先已映射的块在提交时释放，内容不会被原地覆盖。
    pub(crate) fn blocks_swap(
        &mut self,
        txn: &mut Transaction,
        range: Range<u32>,
    ) -> Result<Vec<u32>> {
        let mut swapped = Vec::with_capacity(range.len());
        for local in range {
            debug_assert!(self.allocation_state().is_pending(local));
            let local = local as usize;
            let old = self.block_get(local)?;
            let bno = txn.allocate_block();
            self.block_set(txn, local, bno)?;
            if old != 0 {
                self.delete_block(txn, local, old, false);
            }
            self.inode.block_count += 1;
            self.allocation_state().clear_pending(local as u32);
            swapped.push(bno);
        }
        Ok(swapped)
    }

    /// 释放文件块 `start` 及之后的全部块，间接块在不再需要时一并释放
    pub(crate) fn blocks_shrink(&mut self, txn: &mut Transaction, start: usize) {
        for i in start.min(DIRECT_COUNT)..DIRECT_COUNT {
            let bno = self.inode.dnum[i];
            if bno != 0 {
                self.delete_block(txn, i, bno, false);
                self.inode.dnum[i] = 0;
            }
        }

        for slot in 0..INDIRECT_COUNT {
            let base = INDIRECT_START + slot * POINTERS_PER_BLOCK;
            let indirect = self.inode.inum[slot];
            if indirect == 0 || start >= base + POINTERS_PER_BLOCK {
                continue;
            }
            let first = start.saturating_sub(base);
            self.shrink_indirect(txn, slot, base, first);
            if first == 0 {
                self.delete_block(txn, base, indirect, true);
                self.inode.inum[slot] = 0;
                self.dirty_indirect.remove(&slot);
            }
        }

        let doubly = self.inode.dinum[0];
        if doubly == 0 || start >= MAX_FILE_BLOCKS {
            return;
        }
        for child in 0..POINTERS_PER_BLOCK {
            let base = DOUBLY_START + child * POINTERS_PER_BLOCK;
            let indirect = self.slot_get(DOUBLY_SLOT, child);
            if indirect == 0 || start >= base + POINTERS_PER_BLOCK {
                continue;
            }
            let first = start.saturating_sub(base);
            let child_slot = doubly_child_slot(child);
            self.shrink_indirect(txn, child_slot, base, first);
            if first == 0 {
                self.delete_block(txn, base, indirect, true);
                self.slot_set(DOUBLY_SLOT, child, 0);
                self.dirty_indirect.remove(&child_slot);
            }
        }
        if start <= DOUBLY_START {
            self.delete_block(txn, DOUBLY_START, doubly, true);
            self.inode.dinum[0] = 0;
            self.dirty_indirect.remove(&DOUBLY_SLOT);
        }
    }

    fn shrink_indirect(&mut self, txn: &mut Transaction, slot: usize, base: usize, first: usize) {
        for index in first..POINTERS_PER_BLOCK {
            let bno = self.slot_get(slot, index);
            if bno != 0 {
                self.delete_block(txn, base + index, bno, false);
                self.slot_set(slot, index, 0);
            }
        }
    }
}

/// 按需读入
impl VnodeMinfs {
    /// 读入文件块 `blocks` 中尚未缓存的已映射块
    pub(crate) fn ensure_loaded(&mut self, writeback: &Writeback, blocks: Range<usize>) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        self.data.grow(blocks.end);

        let mut builder = OperationBuilder::default();
        for local in blocks {
            if self.loaded.contains(&local) {
                continue;
            }
            let bno = self.block_get(local)?;
            if bno != 0 {
                builder.add(
                    Operation::read(local, self.dat_block + bno as usize, 1),
                    &self.data,
                );
            }
            self.loaded.insert(local);
        }
        if !builder.is_empty() {
            log::trace!("inode {}: loading {} data blocks", self.ino, builder.len());
        }
        writeback.transact(builder.take());
        Ok(())
    }

    /// 读入覆盖 `[off, off + len)` 的块，区间截到文件大小以内
    pub(crate) fn load_range(&mut self, writeback: &Writeback, off: usize, len: usize) -> Result<()> {
        let end = off.saturating_add(len).min(self.size());
        if off >= end {
            return Ok(());
        }
        self.ensure_loaded(writeback, off / BLOCK_SIZE..end.div_ceil(BLOCK_SIZE))
    }

    /// 写入 `[off, off + len)` 之前读入只被部分覆盖的首尾块
    pub(crate) fn prepare_write(&mut self, writeback: &Writeback, off: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let end = off + len;
        if off % BLOCK_SIZE != 0 {
            let first = off / BLOCK_SIZE;
            self.ensure_loaded(writeback, first..first + 1)?;
        }
        if end % BLOCK_SIZE != 0 {
            let last = end / BLOCK_SIZE;
            self.ensure_loaded(writeback, last..last + 1)?;
        }
        Ok(())
    }

    /// 截断到块中间时，保留下来的末块要先读入
    pub(crate) fn prepare_truncate(&mut self, writeback: &Writeback, len: usize) -> Result<()> {
        if len < self.size() && len % BLOCK_SIZE != 0 {
            let local = len / BLOCK_SIZE;
            self.ensure_loaded(writeback, local..local + 1)?;
        }
        Ok(())
    }
}

/// 字节级读写
impl VnodeMinfs {
    /// 调用者负责先读入涉及的块
    pub(crate) fn read_internal(&self, off: usize, buf: &mut [u8]) -> usize {
        let size = self.size();
        if off >= size {
            return 0;
        }
        let len = buf.len().min(size - off);
        self.data.read(off, &mut buf[..len]);
        len
    }

    /// 写入内容缓存并准备涉及的块，返回写入的字节数
    pub(crate) fn write_internal(
        &mut self,
        txn: &mut Transaction,
        off: usize,
        buf: &[u8],
    ) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let max = if self.is_directory() {
            MAX_DIRECTORY_SIZE
        } else {
            MAX_FILE_SIZE
        };
        if off >= max {
            return Err(if self.is_directory() {
                Error::NoSpace
            } else {
                Error::FileTooLarge
            });
        }

        let len = buf.len().min(max - off);
        let end = off + len;
        self.data.grow(end.div_ceil(BLOCK_SIZE));
        self.data.write(off, &buf[..len]);
        self.loaded.extend(off / BLOCK_SIZE..end.div_ceil(BLOCK_SIZE));

        for local in off / BLOCK_SIZE..=(end - 1) / BLOCK_SIZE {
            if let Some(bno) = self.acquire_writable_block(txn, local)? {
                self.issue_writeback(txn, local, bno);
            }
        }
        if end > self.size() {
            self.set_size(end);
        }
        Ok(len)
    }

    /// 调整大小，缩小时释放越界的块并清零末块的尾部
    pub(crate) fn truncate_internal(&mut self, txn: &mut Transaction, len: usize) -> Result<()> {
        let size = self.size();
        if len < size {
            let keep = len.div_ceil(BLOCK_SIZE);
            self.blocks_shrink(txn, keep);
            self.data.shrink(keep);
            self.loaded.split_off(&keep);

            if len % BLOCK_SIZE != 0 {
                let local = len / BLOCK_SIZE;
                debug_assert!(self.loaded.contains(&local), "block {local} not loaded");
                self.data.fill(len, keep * BLOCK_SIZE - len, 0);
                if self.block_get(local)? != 0 {
                    if let Some(bno) = self.acquire_writable_block(txn, local)? {
                        self.issue_writeback(txn, local, bno);
                    }
                }
            }
            // 磁盘上的大小不能超过仍然映射的范围
            if self.inode.size as usize > len {
                self.inode.size = len as u32;
            }
        }
        self.set_size(len);
        Ok(())
    }
}

/// 链接计数与回收
impl VnodeMinfs {
    /// 去掉一个链接；既无链接又无打开者时立即回收
    pub(crate) fn remove_inode_link(&mut self, txn: &mut Transaction, inodes: &InodeManager) {
        assert!(self.inode.link_count > 0, "inode {} has no link to remove", self.ino);
        self.inode.link_count -= 1;
        // 只剩 `.` 的目录视为已脱离
        if self.is_directory() && self.inode.link_count == 1 {
            self.inode.link_count = 0;
        }

        if self.is_unlinked() && self.open_count == 0 {
            self.purge(txn, inodes);
        } else {
            self.inode_sync(txn, inodes);
        }
    }

    /// 释放全部块与 inode 本身
    pub(crate) fn purge(&mut self, txn: &mut Transaction, inodes: &InodeManager) {
        assert!(self.is_unlinked(), "purging linked inode {}", self.ino);
        self.blocks_shrink(txn, 0);
        self.data.shrink(0);
        self.loaded.clear();
        txn.deallocate_inode(self.ino);

        self.inode = DiskInode::purged();
        self.inode_sync(txn, inodes);
        log::debug!("purged inode {}", self.ino);
    }
}

/// 目录项读写
impl VnodeMinfs {
    pub(crate) fn read_dirent(&self, off: usize) -> Result<Dirent> {
        let mut bytes = [0; MAX_DIRENT_SIZE];
        let len = self.read_internal(off, &mut bytes);
        let de = Dirent::decode(&bytes[..len], off)?;
        if !de.is_last && off + de.reclen_at(off) > self.size() {
            log::error!(
                "directory {}: dirent at {off} runs past size {}",
                self.ino,
                self.size()
            );
            return Err(Error::Io);
        }
        log::trace!("directory {}: dirent at {off}: {:?}", self.ino, de.name);
        Ok(de)
    }

    pub(crate) fn write_dirent(&mut self, txn: &mut Transaction, off: usize, de: &Dirent) -> Result<()> {
        self.write_internal(txn, off, &de.encode())?;
        Ok(())
    }
}
