//! # 块设备接口层
//!
//! 块设备是以**块**为单位存储数据的设备，例如磁盘、U盘等；
//! [`BlockDevice`] 就是对读写块设备的抽象，
//! 实现了此特质的类型称为**块设备驱动**。
//!
//! 文件系统只通过块设备驱动读写块设备，且只在一次批量写回中下发写请求。

#![no_std]

extern crate alloc;

mod ram_disk;

use core::any::Any;

pub use self::ram_disk::RamDisk;

/// 块设备驱动特质
pub trait BlockDevice: Send + Sync + Any {
    fn read_block(&self, block_id: usize, buf: &mut [u8]);

    fn write_block(&self, block_id: usize, buf: &[u8]);

    /// 块的字节数
    fn block_size(&self) -> usize;

    /// 设备的总块数
    fn block_count(&self) -> usize;

    /// 保证此前下发的写请求均已落盘
    fn flush(&self) {}
}
