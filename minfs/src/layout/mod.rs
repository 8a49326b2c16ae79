//! 磁盘布局

mod dir_entry;
mod inode;
mod super_block;

pub use self::{
    dir_entry::{
        dirent_size, Dirent, DIRENT_HEADER_SIZE, MAX_DIRECTORY_SIZE, MAX_DIRENT_SIZE, NAME_MAX,
    },
    inode::{
        DiskInode, DIRECT_COUNT, DOUBLY_INDIRECT_COUNT, INDIRECT_COUNT, INODES_PER_BLOCK,
        INODE_SIZE, MAGIC_DIR, MAGIC_FILE, MAGIC_PURGED, MAX_FILE_BLOCKS, MAX_FILE_SIZE,
        POINTERS_PER_BLOCK,
    },
    super_block::{Superblock, SuperblockFlag, FORMAT_VERSION, MAGIC0, MAGIC1},
};

pub const BLOCK_SIZE: usize = 512;
/// 每个位图块能描述的单元数
pub const BLOCK_BITS: usize = BLOCK_SIZE * 8;

/// 根目录的 inode 编号，0 号 inode 保留不用
pub const ROOT_INO: u32 = 1;

pub const SUPERBLOCK_START: u32 = 0;

pub const NON_FVM_SUPERBLOCK_BACKUP: u32 = 1;
pub const NON_FVM_IBM_START: u32 = 2;

pub const FVM_SUPERBLOCK_BACKUP: u32 = 0x40;
pub const FVM_IBM_START: u32 = 0x80;
pub const FVM_ABM_START: u32 = 0x100;
pub const FVM_INO_START: u32 = 0x180;
pub const FVM_DAT_START: u32 = 0x400;
/// 托管卷每次扩容的块数
pub const FVM_SLICE_BLOCKS: u32 = 8;

#[inline]
pub const fn blocks_for_bits(bits: usize) -> usize {
    bits.div_ceil(BLOCK_BITS)
}

#[inline]
pub const fn blocks_for_inodes(inodes: usize) -> usize {
    inodes.div_ceil(INODES_PER_BLOCK)
}
