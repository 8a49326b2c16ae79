use bytemuck::{Pod, Zeroable};
use enumflags2::{bitflags, BitFlags};
use vfs::Error;

use super::*;
use crate::Result;

pub const MAGIC0: u64 = u64::from_be_bytes(*b"!MinFS!\0");
pub const MAGIC1: u64 = u64::from_be_bytes(*b"blkmap01");
pub const FORMAT_VERSION: u32 = 1;

/// CRC32C（Castagnoli）
const CASTAGNOLI: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);

#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperblockFlag {
    /// 上次卸载是干净的
    Clean = 0b01,
    /// 位于托管卷上，各区域可增长
    Fvm = 0b10,
}

/// 超级块，位于 0 号块
///
/// 块号字段都是设备块号；`block_count` 只计数据区。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Superblock {
    pub magic0: u64,
    pub magic1: u64,
    pub format_version: u32,
    pub checksum: u32,
    pub generation_count: u32,
    pub flags: u32,
    pub block_size: u32,
    pub inode_size: u32,
    pub block_count: u32,
    pub inode_count: u32,
    pub alloc_block_count: u32,
    pub alloc_inode_count: u32,
    /// inode 位图起始块
    pub ibm_block: u32,
    /// 数据块位图起始块
    pub abm_block: u32,
    /// inode 表起始块
    pub ino_block: u32,
    /// 数据区起始块
    pub dat_block: u32,
    /// 托管卷每次扩容的块数，非托管卷为 0
    pub slice_size: u32,
    _reserved: u32,
}

impl Superblock {
    pub fn new() -> Self {
        Self {
            magic0: MAGIC0,
            magic1: MAGIC1,
            format_version: FORMAT_VERSION,
            block_size: BLOCK_SIZE as u32,
            inode_size: INODE_SIZE as u32,
            ..Self::zeroed()
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(&bytes[..core::mem::size_of::<Self>()])
    }

    pub fn flags(&self) -> BitFlags<SuperblockFlag> {
        BitFlags::from_bits_truncate(self.flags)
    }

    pub fn set_flag(&mut self, flag: SuperblockFlag, on: bool) {
        let mut flags = self.flags();
        if on {
            flags.insert(flag);
        } else {
            flags.remove(flag);
        }
        self.flags = flags.bits();
    }

    pub fn is_fvm(&self) -> bool {
        self.flags().contains(SuperblockFlag::Fvm)
    }

    pub fn backup_location(&self) -> u32 {
        if self.is_fvm() {
            FVM_SUPERBLOCK_BACKUP
        } else {
            NON_FVM_SUPERBLOCK_BACKUP
        }
    }

    /// 校验和字段清零后的 CRC32C
    pub fn compute_checksum(&self) -> u32 {
        let mut copy = *self;
        copy.checksum = 0;
        CASTAGNOLI.checksum(bytemuck::bytes_of(&copy))
    }

    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// 对照设备几何检查各字段
    pub fn check(&self, max_blocks: usize) -> Result<()> {
        if self.magic0 != MAGIC0 || self.magic1 != MAGIC1 {
            log::error!("bad superblock magic: {:#x} {:#x}", self.magic0, self.magic1);
            return Err(Error::Io);
        }
        if self.format_version != FORMAT_VERSION {
            log::error!("unsupported format version {}", self.format_version);
            return Err(Error::Io);
        }
        if self.block_size as usize != BLOCK_SIZE || self.inode_size as usize != INODE_SIZE {
            log::error!(
                "unexpected block size {} or inode size {}",
                self.block_size,
                self.inode_size
            );
            return Err(Error::Io);
        }
        let checksum = self.compute_checksum();
        if self.checksum != checksum {
            log::error!(
                "superblock checksum mismatch: stored {:#x}, computed {checksum:#x}",
                self.checksum
            );
            return Err(Error::Io);
        }
        if self.alloc_block_count > self.block_count || self.alloc_inode_count > self.inode_count {
            log::error!("superblock allocation counts exceed pool sizes");
            return Err(Error::Io);
        }

        let (ibm, abm) = (self.ibm_block as usize, self.abm_block as usize);
        let (ino, dat) = (self.ino_block as usize, self.dat_block as usize);
        let fixed = if self.is_fvm() {
            self.ibm_block == FVM_IBM_START
                && self.abm_block == FVM_ABM_START
                && self.ino_block == FVM_INO_START
                && self.dat_block == FVM_DAT_START
                && self.slice_size == FVM_SLICE_BLOCKS
        } else {
            self.ibm_block == NON_FVM_IBM_START
        };
        let ordered = ibm + blocks_for_bits(self.inode_count as usize) <= abm
            && abm + blocks_for_bits(self.block_count as usize) <= ino
            && ino + blocks_for_inodes(self.inode_count as usize) <= dat;
        if !fixed || !ordered {
            log::error!("inconsistent superblock layout: {self:?}");
            return Err(Error::Io);
        }
        if dat + self.block_count as usize > max_blocks {
            log::error!(
                "superblock claims {} blocks, device holds {max_blocks}",
                dat + self.block_count as usize
            );
            return Err(Error::Io);
        }

        Ok(())
    }
}

impl Default for Superblock {
    fn default() -> Self {
        Self::new()
    }
}
