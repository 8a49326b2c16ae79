//! 内存块设备，主机侧工具与测试使用

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::BlockDevice;

#[derive(Debug)]
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    block_size: usize,
    /// 已下发的块写入次数
    writes: AtomicUsize,
}

impl RamDisk {
    pub fn new(block_count: usize, block_size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0; block_count * block_size]),
            block_size,
            writes: AtomicUsize::new(0),
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    fn range(&self, block_id: usize) -> core::ops::Range<usize> {
        let start = block_id * self.block_size;
        start..start + self.block_size
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        assert!(block_id < self.block_count(), "block {block_id} out of device");
        assert_eq!(buf.len(), self.block_size, "not a complete block!");
        buf.copy_from_slice(&self.data.lock()[self.range(block_id)]);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        assert!(block_id < self.block_count(), "block {block_id} out of device");
        assert_eq!(buf.len(), self.block_size, "not a complete block!");
        self.data.lock()[self.range(block_id)].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> usize {
        self.data.lock().len() / self.block_size
    }
}
