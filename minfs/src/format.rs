//! # 格式化
//!
//! 按设备大小规划各区域，写入超级块与备份、清零的位图、inode 表，
//! 以及只含 `.` 与 `..` 的根目录。两个位图的 0 号单元保留不用。

use alloc::sync::Arc;

use block_dev::BlockDevice;
use vfs::{DirEntryType, Error};

use crate::buffer::BlockBuffer;
use crate::config::{FormatOptions, WRITEBACK_CAPACITY};
use crate::layout::{
    blocks_for_bits, blocks_for_inodes, Dirent, DiskInode, Superblock, SuperblockFlag, BLOCK_BITS,
    BLOCK_SIZE, FVM_ABM_START, FVM_DAT_START, FVM_IBM_START, FVM_INO_START, FVM_SLICE_BLOCKS,
    INODES_PER_BLOCK, INODE_SIZE, NON_FVM_IBM_START, ROOT_INO, SUPERBLOCK_START,
};
use crate::operation::{Operation, OperationBuilder};
use crate::writeback::Writeback;
use crate::Result;

/// 根目录的第一个数据块
const ROOT_DATA_BLOCK: u32 = 1;

pub fn format(device: &Arc<dyn BlockDevice>, options: FormatOptions) -> Result<()> {
    if device.block_size() != BLOCK_SIZE {
        log::error!(
            "device block size {} does not match {BLOCK_SIZE}",
            device.block_size()
        );
        return Err(Error::NotSupported);
    }
    let total = device.block_count();

    let mut sb = if options.fvm {
        fvm_layout(total, &options)?
    } else {
        plain_layout(total, &options)?
    };
    sb.alloc_block_count = 2;
    sb.alloc_inode_count = 2;
    sb.generation_count = 1;
    sb.set_flag(SuperblockFlag::Clean, true);
    sb.update_checksum();
    sb.check(total)?;

    let mut builder = OperationBuilder::default();

    let sb_buffer = BlockBuffer::new(1);
    sb_buffer.set(0, &sb);
    builder.add(Operation::write(0, SUPERBLOCK_START, 1), &sb_buffer);
    builder.add(Operation::write(0, sb.backup_location(), 1), &sb_buffer);

    // 0 号单元保留，1 号分别是根目录的 inode 与首个数据块
    let ibm_blocks = blocks_for_bits(sb.inode_count as usize);
    let inode_bitmap = BlockBuffer::new(ibm_blocks);
    inode_bitmap.map_mut(|bits| bits[0] = 0b11);
    builder.add(Operation::write(0, sb.ibm_block, ibm_blocks), &inode_bitmap);

    let abm_blocks = blocks_for_bits(sb.block_count as usize);
    let block_bitmap = BlockBuffer::new(abm_blocks);
    block_bitmap.map_mut(|bits| bits[0] = 0b11);
    builder.add(Operation::write(0, sb.abm_block, abm_blocks), &block_bitmap);

    let [dot, dotdot] = Dirent::dots(ROOT_INO, ROOT_INO);
    let mut root = DiskInode::new(DirEntryType::Directory);
    root.size = (dot.size() + dotdot.size()) as u32;
    root.block_count = 1;
    root.dirent_count = 2;
    root.dnum[0] = ROOT_DATA_BLOCK;

    let ino_blocks = blocks_for_inodes(sb.inode_count as usize);
    let table = BlockBuffer::new(ino_blocks);
    table.set(ROOT_INO as usize * INODE_SIZE, &root);
    builder.add(Operation::write(0, sb.ino_block, ino_blocks), &table);

    let root_data = BlockBuffer::new(1);
    root_data.write(0, &dot.encode());
    root_data.write(dot.size(), &dotdot.encode());
    builder.add(
        Operation::write(0, sb.dat_block + ROOT_DATA_BLOCK, 1),
        &root_data,
    );

    Writeback::new(Arc::clone(device), WRITEBACK_CAPACITY).transact(builder.take());

    log::info!(
        "formatted minfs{}: {} data blocks from block {}, {} inodes",
        if sb.is_fvm() { " (fvm)" } else { "" },
        sb.block_count,
        sb.dat_block,
        sb.inode_count
    );
    Ok(())
}

/// 非托管卷：各区域依次紧挨，数据区默认占满余下的空间
fn plain_layout(total: usize, options: &FormatOptions) -> Result<Superblock> {
    let inode_count = inode_count(options)?;
    let ibm_blocks = blocks_for_bits(inode_count);
    let ino_blocks = blocks_for_inodes(inode_count);
    let abm = NON_FVM_IBM_START as usize + ibm_blocks;

    let remaining = total
        .checked_sub(abm + ino_blocks)
        .ok_or_else(|| too_small(total))?;
    // 每 BLOCK_BITS 个数据块需要一个位图块
    let max_data = remaining - remaining.div_ceil(BLOCK_BITS + 1);
    let data_blocks = options.data_blocks.unwrap_or(max_data);
    if data_blocks > max_data || data_blocks < 2 {
        log::error!("cannot fit {data_blocks} data blocks, at most {max_data} available");
        return Err(Error::NoSpace);
    }

    let ino = abm + blocks_for_bits(data_blocks);
    let mut sb = Superblock::new();
    sb.inode_count = inode_count as u32;
    sb.block_count = data_blocks as u32;
    sb.ibm_block = NON_FVM_IBM_START;
    sb.abm_block = abm as u32;
    sb.ino_block = ino as u32;
    sb.dat_block = (ino + ino_blocks) as u32;
    Ok(sb)
}

/// 托管卷：区域起点固定，inode 数与数据块数都按分片取整
fn fvm_layout(total: usize, options: &FormatOptions) -> Result<Superblock> {
    let slice_inodes = FVM_SLICE_BLOCKS as usize * INODES_PER_BLOCK;
    let inode_count = inode_count(options)?.next_multiple_of(slice_inodes);
    let max_inodes = (FVM_DAT_START - FVM_INO_START) as usize * INODES_PER_BLOCK;
    if inode_count > max_inodes {
        log::error!("{inode_count} inodes exceed the table region of {max_inodes}");
        return Err(Error::NoSpace);
    }

    let room = total
        .checked_sub(FVM_DAT_START as usize)
        .ok_or_else(|| too_small(total))?;
    let max_data = room.min((FVM_INO_START - FVM_ABM_START) as usize * BLOCK_BITS);
    let data_blocks = options
        .data_blocks
        .unwrap_or(max_data)
        .next_multiple_of(FVM_SLICE_BLOCKS as usize);
    if data_blocks > max_data {
        log::error!("cannot fit {data_blocks} data blocks, at most {max_data} available");
        return Err(Error::NoSpace);
    }

    let mut sb = Superblock::new();
    sb.set_flag(SuperblockFlag::Fvm, true);
    sb.inode_count = inode_count as u32;
    sb.block_count = data_blocks as u32;
    sb.ibm_block = FVM_IBM_START;
    sb.abm_block = FVM_ABM_START;
    sb.ino_block = FVM_INO_START;
    sb.dat_block = FVM_DAT_START;
    sb.slice_size = FVM_SLICE_BLOCKS;
    Ok(sb)
}

fn inode_count(options: &FormatOptions) -> Result<usize> {
    // 保留的 0 号与根目录
    if options.inode_count < 2 {
        log::error!("at least 2 inodes are required, got {}", options.inode_count);
        return Err(Error::InvalidArgs);
    }
    Ok(options.inode_count.next_multiple_of(INODES_PER_BLOCK))
}

fn too_small(total: usize) -> Error {
    log::error!("device of {total} blocks is too small");
    Error::NoSpace
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_layout_fills_device() {
        let sb = plain_layout(4096, &FormatOptions::default()).unwrap();
        assert_eq!(NON_FVM_IBM_START, sb.ibm_block);
        assert_eq!(3, sb.abm_block);
        assert_eq!(4, sb.ino_block);
        assert_eq!(68, sb.dat_block);
        assert_eq!(4096 - 68, sb.block_count as usize);
    }

    #[test]
    fn plain_layout_limits() {
        let options = FormatOptions {
            data_blocks: Some(5000),
            ..FormatOptions::default()
        };
        assert_eq!(Err(Error::NoSpace), plain_layout(4096, &options).map(|_| ()));
        assert_eq!(
            Err(Error::NoSpace),
            plain_layout(10, &FormatOptions::default()).map(|_| ())
        );
        let options = FormatOptions {
            inode_count: 1,
            ..FormatOptions::default()
        };
        assert_eq!(Err(Error::InvalidArgs), plain_layout(4096, &options).map(|_| ()));
    }

    #[test]
    fn fvm_layout_rounds_to_slices() {
        let options = FormatOptions {
            data_blocks: Some(10),
            inode_count: 20,
            fvm: true,
        };
        let sb = fvm_layout(4096, &options).unwrap();
        assert!(sb.is_fvm());
        assert_eq!(16, sb.block_count);
        assert_eq!(32, sb.inode_count);
        assert_eq!(FVM_DAT_START, sb.dat_block);

        // 数据区起点之前就到了设备末尾
        assert_eq!(Err(Error::NoSpace), fvm_layout(0x200, &options).map(|_| ()));
    }
}
