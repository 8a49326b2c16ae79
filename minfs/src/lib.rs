//! # minfs
//!
//! 基于块位图与 inode 表的磁盘文件系统引擎。
//!
//! 磁盘布局（非托管卷）：
//!
//! | 超级块 | 备份超级块 | inode 位图 | 数据块位图 | inode 表 | 数据区 |
//!
//! 托管卷（FVM）下各区域起始块固定，位图、inode 表与数据区都可以在原位增长。
//!
//! 所有修改都经由 [`Transaction`]：事务在开始时预留 inode 与数据块，
//! 执行过程中只修改内存并登记写回操作，提交时按登记顺序批量写回。

#![no_std]

extern crate alloc;

mod allocator;
mod buffer;
mod config;
mod format;
mod fs;
mod inode_manager;
pub mod layout;
mod operation;
mod superblock;
mod transaction;
mod vnode;
mod writeback;

pub use self::{
    allocator::{Allocator, AllocatorReservation, GrowCallback, PersistentStorage},
    buffer::BlockBuffer,
    config::{FormatOptions, MountOptions, MAX_INDIRECT_PER_BATCH, WRITEBACK_CAPACITY},
    format::format,
    fs::{FilesystemInfo, Minfs},
    inode_manager::InodeManager,
    operation::{BlockId, BufferedOperation, Operation, OperationBuilder, OperationType, PendingWork},
    superblock::{IntegrityCheck, SuperblockManager, UpdateBackup},
    transaction::{CachedBlockTransaction, Transaction},
    vnode::{DirCookie, Vnode},
    writeback::Writeback,
};

pub use block_dev::BlockDevice;
pub use vfs::{DirEntry, DirEntryType, Error, Stat};

pub type Result<T> = core::result::Result<T, Error>;
