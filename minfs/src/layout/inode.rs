use core::mem;

use bytemuck::{Pod, Zeroable};
use vfs::DirEntryType;

use super::BLOCK_SIZE;

pub const INODE_SIZE: usize = mem::size_of::<DiskInode>();
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;

pub const DIRECT_COUNT: usize = 16;
pub const INDIRECT_COUNT: usize = 31;
pub const DOUBLY_INDIRECT_COUNT: usize = 1;
/// 一个间接块容纳的块号数
pub const POINTERS_PER_BLOCK: usize = BLOCK_SIZE / mem::size_of::<u32>();

pub const MAX_FILE_BLOCKS: usize = DIRECT_COUNT
    + INDIRECT_COUNT * POINTERS_PER_BLOCK
    + DOUBLY_INDIRECT_COUNT * POINTERS_PER_BLOCK * POINTERS_PER_BLOCK;
pub const MAX_FILE_SIZE: usize = MAX_FILE_BLOCKS * BLOCK_SIZE;

pub const MAGIC_FILE: u32 = u32::from_be_bytes(*b"minF");
pub const MAGIC_DIR: u32 = u32::from_be_bytes(*b"minD");
pub const MAGIC_PURGED: u32 = 0xdead_beef;

/// 磁盘上的 inode
///
/// 块号都是相对数据区起点的编号，0 表示未映射。
/// `block_count` 等于从此 inode 可达的非零块号个数，间接块本身也计入。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DiskInode {
    pub magic: u32,
    pub size: u32,
    pub block_count: u32,
    pub link_count: u32,
    /// 每次结构性修改都递增，目录遍历游标据此判断是否失效
    pub seq_num: u32,
    pub gen_num: u32,
    pub dirent_count: u32,
    _reserved: [u32; 9],
    pub dnum: [u32; DIRECT_COUNT],
    pub inum: [u32; INDIRECT_COUNT],
    pub dinum: [u32; DOUBLY_INDIRECT_COUNT],
}

impl DiskInode {
    pub fn new(ty: DirEntryType) -> Self {
        let mut inode = Self::zeroed();
        match ty {
            DirEntryType::Directory => {
                inode.magic = MAGIC_DIR;
                // `.` 与父目录中的目录项
                inode.link_count = 2;
            }
            DirEntryType::Regular => {
                inode.magic = MAGIC_FILE;
                inode.link_count = 1;
            }
        }
        inode
    }

    /// 回收后留在表中的记录
    pub fn purged() -> Self {
        Self {
            magic: MAGIC_PURGED,
            ..Self::zeroed()
        }
    }

    /// 空闲或已回收的 inode 返回 `None`
    pub fn kind(&self) -> Option<DirEntryType> {
        match self.magic {
            MAGIC_DIR => Some(DirEntryType::Directory),
            MAGIC_FILE => Some(DirEntryType::Regular),
            _ => None,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.magic == MAGIC_DIR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_size() {
        assert_eq!(256, INODE_SIZE);
        assert_eq!(2, INODES_PER_BLOCK);
        assert_eq!(128, POINTERS_PER_BLOCK);
    }

    #[test]
    fn new_directory_has_two_links() {
        let dir = DiskInode::new(DirEntryType::Directory);
        assert_eq!(Some(DirEntryType::Directory), dir.kind());
        assert_eq!(2, dir.link_count);

        let file = DiskInode::new(DirEntryType::Regular);
        assert!(!file.is_directory());
        assert_eq!(1, file.link_count);

        assert_eq!(None, DiskInode::purged().kind());
    }
}
