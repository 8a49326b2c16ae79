//! # 文件系统
//!
//! [`Minfs`] 持有超级块、两个分配池、inode 表与 vnode 缓存，
//! 整体放在一把互斥锁之后，所有操作都在持锁期间同步完成。
//!
//! vnode 缓存只保留仍被打开的 vnode；其余的在提交时随钉住列表释放，
//! 或在每次操作结束时清理。

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;

use block_dev::BlockDevice;
use spin::Mutex;
use vfs::Error;

use crate::allocator::{Allocator, PersistentStorage};
use crate::config::MountOptions;
use crate::inode_manager::InodeManager;
use crate::layout::{
    Superblock, SuperblockFlag, BLOCK_BITS, BLOCK_SIZE, FVM_ABM_START, FVM_DAT_START,
    FVM_INO_START, FVM_SUPERBLOCK_BACKUP, NON_FVM_SUPERBLOCK_BACKUP, ROOT_INO, SUPERBLOCK_START,
};
use crate::operation::OperationBuilder;
use crate::superblock::{IntegrityCheck, SuperblockManager, UpdateBackup};
use crate::transaction::Transaction;
use crate::vnode::{Vnode, VnodeMinfs};
use crate::writeback::Writeback;
use crate::Result;

/// 类似 statfs 的统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilesystemInfo {
    pub block_size: usize,
    pub total_blocks: usize,
    pub used_blocks: usize,
    pub total_inodes: usize,
    pub used_inodes: usize,
    pub generation: u32,
    pub fvm: bool,
}

pub struct Minfs {
    pub(crate) writeback: Writeback,
    pub(crate) superblock: SuperblockManager,
    pub(crate) inodes: InodeManager,
    pub(crate) block_allocator: Arc<Allocator>,
    pub(crate) vnodes: BTreeMap<u32, VnodeMinfs>,
    options: MountOptions,
}

impl Minfs {
    pub fn mount(device: Arc<dyn BlockDevice>, options: MountOptions) -> Result<Arc<Mutex<Self>>> {
        if device.block_size() != BLOCK_SIZE {
            log::error!(
                "device block size {} does not match {BLOCK_SIZE}",
                device.block_size()
            );
            return Err(Error::NotSupported);
        }
        let max_blocks = device.block_count();
        let check = if options.integrity_check {
            IntegrityCheck::All
        } else {
            IntegrityCheck::None
        };

        let primary = read_superblock(&*device, SUPERBLOCK_START as usize);
        let mut superblock = match SuperblockManager::create(&*device, &primary, max_blocks, check) {
            Ok(manager) => manager,
            Err(Error::Io) if options.repair => {
                let mut manager = repair_superblock(&*device, max_blocks)?;
                // 下一次提交把备份写回主超级块
                manager.mutable_info();
                manager
            }
            Err(err) => return Err(err),
        };

        let sb = *superblock.info();
        let mut builder = OperationBuilder::default();
        let block_storage = if sb.is_fvm() {
            let limit = ((FVM_INO_START - FVM_ABM_START) as usize * BLOCK_BITS)
                .min(max_blocks.saturating_sub(FVM_DAT_START as usize));
            PersistentStorage::growable(
                "blocks",
                sb.abm_block.into(),
                limit,
                sb.slice_size as usize,
            )
        } else {
            PersistentStorage::fixed("blocks", sb.abm_block.into())
        };
        let block_allocator = Allocator::create(&mut builder, block_storage, sb.block_count as usize);
        let inodes = InodeManager::create(
            &mut builder,
            &sb,
            sb.ino_block.into(),
            sb.inode_count as usize,
        );

        let writeback = Writeback::new(device, options.writeback_capacity);
        writeback.transact(builder.take());
        block_allocator.load();
        inodes.allocator().load();

        let used_blocks = block_allocator.pool_used() as u32;
        let used_inodes = inodes.allocator().pool_used() as u32;
        if used_blocks != sb.alloc_block_count || used_inodes != sb.alloc_inode_count {
            log::warn!(
                "superblock counts ({} blocks, {} inodes) disagree with bitmaps ({used_blocks}, {used_inodes})",
                sb.alloc_block_count,
                sb.alloc_inode_count
            );
        }

        {
            let info = superblock.mutable_info();
            info.set_flag(SuperblockFlag::Clean, false);
            info.generation_count = info.generation_count.wrapping_add(1);
        }

        let mut fs = Self {
            writeback,
            superblock,
            inodes,
            block_allocator,
            vnodes: BTreeMap::new(),
            options,
        };
        let txn = fs.begin_transaction(0, 0)?;
        fs.commit_transaction(txn);

        fs.vnode_get(ROOT_INO)?;
        fs.evict_idle();

        log::info!(
            "mounted minfs: {} data blocks, {} inodes, generation {}",
            sb.block_count,
            sb.inode_count,
            fs.superblock.info().generation_count
        );
        Ok(Arc::new(Mutex::new(fs)))
    }

    /// 打开根目录
    pub fn root(fs: &Arc<Mutex<Self>>) -> Result<Vnode> {
        fs.lock().open(ROOT_INO)?;
        Ok(Vnode::opened(fs, ROOT_INO))
    }

    /// 标记干净卸载，写回主超级块与备份
    ///
    /// 卸载后仍可继续使用，之后的第一次修改会重新清除干净标记。
    pub fn unmount(&mut self) {
        self.superblock
            .mutable_info()
            .set_flag(SuperblockFlag::Clean, true);
        let backup = if self.options.update_backup_superblock {
            UpdateBackup::Yes
        } else {
            UpdateBackup::No
        };
        match self.begin_transaction(0, 0) {
            Ok(mut txn) => {
                self.superblock.write(&mut txn, backup);
                // 经由提交会清掉刚设置的干净标记
                self.writeback.transact(txn.remove_metadata_operations());
                log::info!("unmounted minfs, {} vnodes still open", self.vnodes.len());
            }
            Err(err) => log::error!("unmount: {err}"),
        }
    }

    pub fn info(&self) -> FilesystemInfo {
        FilesystemInfo {
            block_size: BLOCK_SIZE,
            total_blocks: self.block_allocator.pool_total(),
            used_blocks: self.block_allocator.pool_used(),
            total_inodes: self.inodes.allocator().pool_total(),
            used_inodes: self.inodes.allocator().pool_used(),
            generation: self.superblock.info().generation_count,
            fvm: self.superblock.info().is_fvm(),
        }
    }

    pub fn superblock(&self) -> &Superblock {
        self.superblock.info()
    }
}

/// 事务
impl Minfs {
    pub(crate) fn begin_transaction(&self, inodes: usize, blocks: usize) -> Result<Transaction> {
        Transaction::create(self.inodes.allocator(), &self.block_allocator, inodes, blocks)
    }

    /// 持久化预留，必要时同步超级块，然后先写数据、再按登记顺序写元数据
    pub(crate) fn commit_transaction(&mut self, mut txn: Transaction) {
        let persisted = txn.commit_reservations();
        if txn.has_work() && self.superblock.info().flags().contains(SuperblockFlag::Clean) {
            self.superblock
                .mutable_info()
                .set_flag(SuperblockFlag::Clean, false);
        }

        let (total_blocks, used_blocks) = (
            self.block_allocator.pool_total() as u32,
            self.block_allocator.pool_used() as u32,
        );
        let (total_inodes, used_inodes) = (
            self.inodes.allocator().pool_total() as u32,
            self.inodes.allocator().pool_used() as u32,
        );
        let info = self.superblock.info();
        let changed = info.block_count != total_blocks
            || info.alloc_block_count != used_blocks
            || info.inode_count != total_inodes
            || info.alloc_inode_count != used_inodes;
        if persisted || changed || self.superblock.is_dirty() {
            let info = self.superblock.mutable_info();
            info.block_count = total_blocks;
            info.alloc_block_count = used_blocks;
            info.inode_count = total_inodes;
            info.alloc_inode_count = used_inodes;
            self.superblock.write(&mut txn, UpdateBackup::No);
        }

        let data = txn.remove_data_operations();
        let metadata = txn.remove_metadata_operations();
        log::debug!(
            "commit: {} data, {} metadata operations",
            data.len(),
            metadata.len()
        );
        self.writeback.transact(data);
        self.writeback.transact(metadata);

        for ino in txn.remove_pinned_vnodes() {
            self.release(ino);
        }
    }
}

/// vnode 缓存
impl Minfs {
    /// 确保 `ino` 已载入缓存
    pub(crate) fn vnode_get(&mut self, ino: u32) -> Result<()> {
        if self.vnodes.contains_key(&ino) {
            return Ok(());
        }
        if ino == 0 || !self.inodes.allocator().is_allocated(ino as usize) {
            log::error!("inode {ino} is not allocated");
            return Err(Error::Io);
        }
        let inode = self.inodes.load(ino)?;
        let vnode = VnodeMinfs::load(ino, inode, self.superblock.info(), &self.writeback)?;
        self.vnodes.insert(ino, vnode);
        Ok(())
    }

    pub(crate) fn vnode(&self, ino: u32) -> &VnodeMinfs {
        self.vnodes
            .get(&ino)
            .unwrap_or_else(|| panic!("vnode {ino} is not loaded"))
    }

    pub(crate) fn vnode_mut(&mut self, ino: u32) -> &mut VnodeMinfs {
        self.vnodes
            .get_mut(&ino)
            .unwrap_or_else(|| panic!("vnode {ino} is not loaded"))
    }

    /// 同时借出 vnode 与 inode 表
    pub(crate) fn vnode_parts(&mut self, ino: u32) -> (&mut VnodeMinfs, &InodeManager) {
        let vnode = self
            .vnodes
            .get_mut(&ino)
            .unwrap_or_else(|| panic!("vnode {ino} is not loaded"));
        (vnode, &self.inodes)
    }

    /// 同时借出 vnode 与写回通道，供按需读入内容
    pub(crate) fn vnode_io(&mut self, ino: u32) -> (&mut VnodeMinfs, &Writeback) {
        let vnode = self
            .vnodes
            .get_mut(&ino)
            .unwrap_or_else(|| panic!("vnode {ino} is not loaded"));
        (vnode, &self.writeback)
    }

    pub(crate) fn inode_sync(&mut self, txn: &mut Transaction, ino: u32) {
        let (vnode, inodes) = self.vnode_parts(ino);
        vnode.inode_sync(txn, inodes);
    }

    pub(crate) fn remove_inode_link(&mut self, txn: &mut Transaction, ino: u32) {
        let (vnode, inodes) = self.vnode_parts(ino);
        vnode.remove_inode_link(txn, inodes);
    }

    pub(crate) fn open(&mut self, ino: u32) -> Result<()> {
        self.vnode_get(ino)?;
        self.vnode_mut(ino).open_count += 1;
        Ok(())
    }

    /// 最后一个打开者关闭时，回收已脱离的 vnode
    pub(crate) fn close(&mut self, ino: u32) {
        let vnode = self.vnode_mut(ino);
        assert!(vnode.open_count > 0, "closing vnode {ino} that is not open");
        vnode.open_count -= 1;
        if vnode.open_count > 0 {
            return;
        }

        if vnode.is_unlinked() {
            match self.begin_transaction(0, 0) {
                Ok(mut txn) => {
                    let (vnode, inodes) = self.vnode_parts(ino);
                    vnode.purge(&mut txn, inodes);
                    self.commit_transaction(txn);
                }
                Err(err) => log::error!("purge of inode {ino} failed: {err}"),
            }
        }
        self.vnodes.remove(&ino);
    }

    /// 释放一个不再被打开的 vnode
    pub(crate) fn release(&mut self, ino: u32) {
        if self.vnodes.get(&ino).is_some_and(|vnode| vnode.open_count == 0) {
            self.vnodes.remove(&ino);
        }
    }

    /// 清理操作期间临时载入的 vnode
    pub(crate) fn evict_idle(&mut self) {
        self.vnodes.retain(|_, vnode| vnode.open_count > 0);
    }
}

fn read_superblock(device: &dyn BlockDevice, block: usize) -> Superblock {
    let mut buf = vec![0; BLOCK_SIZE];
    device.read_block(block, &mut buf);
    Superblock::from_bytes(&buf)
}

/// 依次尝试两个可能的备份位置
fn repair_superblock(device: &dyn BlockDevice, max_blocks: usize) -> Result<SuperblockManager> {
    for location in [NON_FVM_SUPERBLOCK_BACKUP, FVM_SUPERBLOCK_BACKUP] {
        if location as usize >= max_blocks {
            continue;
        }
        let candidate = read_superblock(device, location as usize);
        if candidate.backup_location() != location {
            continue;
        }
        if let Ok(manager) =
            SuperblockManager::create(device, &candidate, max_blocks, IntegrityCheck::All)
        {
            log::warn!("primary superblock is corrupt, recovered from backup at block {location}");
            return Ok(manager);
        }
    }
    log::error!("no usable superblock found");
    Err(Error::Io)
}
