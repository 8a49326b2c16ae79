//! # 映射缓冲区
//!
//! 超级块、位图、inode 表、间接块与文件内容都缓存在按块编址的内存区域里。
//! 写回操作只记录块号并持有缓冲区的引用，真正的数据在写回时才从缓冲区复制出去。
//!
//! 缓冲区只能按块增长或截断，新增部分清零；访问越界会直接 panic。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;

use bytemuck::Pod;
use spin::Mutex;

use crate::layout::BLOCK_SIZE;

#[derive(Debug, Clone, Default)]
pub struct BlockBuffer(Arc<Mutex<Vec<u8>>>);

impl BlockBuffer {
    pub fn new(blocks: usize) -> Self {
        Self(Arc::new(Mutex::new(alloc::vec![0; blocks * BLOCK_SIZE])))
    }

    pub fn block_count(&self) -> usize {
        self.0.lock().len() / BLOCK_SIZE
    }

    /// 增长到至少 `blocks` 块
    pub fn grow(&self, blocks: usize) {
        let mut data = self.0.lock();
        if data.len() < blocks * BLOCK_SIZE {
            data.resize(blocks * BLOCK_SIZE, 0);
        }
    }

    /// 截断到至多 `blocks` 块
    pub fn shrink(&self, blocks: usize) {
        self.0.lock().truncate(blocks * BLOCK_SIZE);
    }

    pub fn map<V>(&self, f: impl FnOnce(&[u8]) -> V) -> V {
        f(&self.0.lock())
    }

    pub fn map_mut<V>(&self, f: impl FnOnce(&mut [u8]) -> V) -> V {
        f(&mut self.0.lock())
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        self.map(|data| buf.copy_from_slice(&data[offset..offset + buf.len()]));
    }

    pub fn write(&self, offset: usize, buf: &[u8]) {
        self.map_mut(|data| data[offset..offset + buf.len()].copy_from_slice(buf));
    }

    pub fn fill(&self, offset: usize, len: usize, byte: u8) {
        self.map_mut(|data| data[offset..offset + len].fill(byte));
    }

    pub fn read_block(&self, block: usize, buf: &mut [u8]) {
        self.read(block * BLOCK_SIZE, &mut buf[..BLOCK_SIZE]);
    }

    pub fn write_block(&self, block: usize, buf: &[u8]) {
        self.write(block * BLOCK_SIZE, &buf[..BLOCK_SIZE]);
    }

    pub fn get<T: Pod>(&self, offset: usize) -> T {
        self.map(|data| bytemuck::pod_read_unaligned(&data[offset..offset + mem::size_of::<T>()]))
    }

    pub fn set<T: Pod>(&self, offset: usize, value: &T) {
        self.write(offset, bytemuck::bytes_of(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_zero_fills() {
        let buffer = BlockBuffer::new(1);
        buffer.fill(0, BLOCK_SIZE, 0xff);
        buffer.grow(3);
        assert_eq!(3, buffer.block_count());
        assert_eq!(0u32, buffer.get(BLOCK_SIZE));
        assert_eq!(u32::MAX, buffer.get(BLOCK_SIZE - 4));

        buffer.shrink(1);
        buffer.grow(2);
        assert_eq!(0u64, buffer.get(BLOCK_SIZE + 8));
    }

    #[test]
    fn clones_share_storage() {
        let buffer = BlockBuffer::new(2);
        let alias = buffer.clone();
        alias.set(700, &0xdead_beefu32);
        assert_eq!(0xdead_beefu32, buffer.get(700));
    }

    #[test]
    #[should_panic]
    fn out_of_bounds() {
        BlockBuffer::new(1).write(BLOCK_SIZE - 2, &[0; 4]);
    }
}
