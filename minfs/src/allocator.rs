//! # 位图分配器
//!
//! 分配分两步：先**预留**数量，再在预留范围内**分配**具体的单元。
//! 预留只改计数；分配会立即在内存位图中置位，但直到事务提交时
//! 才把受影响的位图块登记为元数据写回。释放同样推迟到提交时生效，
//! 因此同一事务内刚释放的单元不会被再次分配。
//!
//! 任何时刻都满足 `available + reserved + used == total`。

use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::mem;

use spin::Mutex;
use vfs::Error;

use crate::buffer::BlockBuffer;
use crate::layout::{blocks_for_bits, BLOCK_BITS};
use crate::operation::{BlockId, Operation, OperationBuilder, PendingWork};
use crate::Result;

/// 池扩容时的回调，参数为扩容后的单元总数
pub type GrowCallback = Box<dyn FnMut(usize) -> Result<()> + Send>;

/// 位图在设备上的位置与扩容能力
pub struct PersistentStorage {
    name: &'static str,
    /// 位图起始块
    start: BlockId,
    /// 池最多可增长到的单元数
    unit_limit: usize,
    /// 每次扩容增加的单元数
    slice_units: usize,
    grow: Option<GrowCallback>,
}

impl PersistentStorage {
    /// 不可扩容的池
    pub fn fixed(name: &'static str, start: BlockId) -> Self {
        Self {
            name,
            start,
            unit_limit: 0,
            slice_units: 0,
            grow: None,
        }
    }

    /// 可以按 `slice_units` 逐步扩容到 `unit_limit` 的池
    pub fn growable(
        name: &'static str,
        start: BlockId,
        unit_limit: usize,
        slice_units: usize,
    ) -> Self {
        Self {
            name,
            start,
            unit_limit,
            slice_units,
            grow: None,
        }
    }

    pub fn with_grow_callback(mut self, grow: GrowCallback) -> Self {
        self.grow = Some(grow);
        self
    }
}

impl fmt::Debug for PersistentStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentStorage")
            .field("name", &self.name)
            .field("start", &self.start)
            .field("unit_limit", &self.unit_limit)
            .field("slice_units", &self.slice_units)
            .finish()
    }
}

#[derive(Debug)]
pub struct Allocator {
    inner: Mutex<AllocatorInner>,
}

#[derive(Debug)]
struct AllocatorInner {
    storage: PersistentStorage,
    bitmap: BlockBuffer,
    total: usize,
    used: usize,
    reserved: usize,
    /// 下次查找空闲位的起点
    hint: usize,
}

impl Allocator {
    /// 为 `total` 个单元建立位图，并登记从设备读入位图的操作
    ///
    /// 登记的操作执行完后需调用 [`Allocator::load`]。
    pub fn create(
        builder: &mut OperationBuilder,
        storage: PersistentStorage,
        total: usize,
    ) -> Arc<Self> {
        let blocks = blocks_for_bits(total);
        let bitmap = BlockBuffer::new(blocks);
        builder.add(Operation::read(0, storage.start, blocks), &bitmap);

        Arc::new(Self {
            inner: Mutex::new(AllocatorInner {
                storage,
                bitmap,
                total,
                used: 0,
                reserved: 0,
                hint: 0,
            }),
        })
    }

    /// 根据读入的位图重新统计已用单元
    pub fn load(&self) {
        let mut inner = self.inner.lock();
        let total = inner.total;
        let used = (0..total).filter(|&index| inner.test(index)).count();
        inner.used = used;
        log::debug!(
            "{}: {} of {total} units in use",
            inner.storage.name,
            inner.used
        );
    }

    pub fn pool_total(&self) -> usize {
        self.inner.lock().total
    }

    pub fn pool_used(&self) -> usize {
        self.inner.lock().used
    }

    pub fn pool_reserved(&self) -> usize {
        self.inner.lock().reserved
    }

    pub fn pool_available(&self) -> usize {
        self.inner.lock().available()
    }

    pub fn is_allocated(&self, index: usize) -> bool {
        let inner = self.inner.lock();
        index < inner.total && inner.test(index)
    }

    /// 预留 `count` 个单元；池不够时尝试扩容
    pub fn reserve(
        self: &Arc<Self>,
        work: &mut dyn PendingWork,
        count: usize,
    ) -> Result<AllocatorReservation> {
        self.reserve_units(work, count)?;
        Ok(AllocatorReservation {
            allocator: self.clone(),
            reserved: count,
            allocated: Vec::new(),
            freed: Vec::new(),
        })
    }

    /// 不论是否需要扩容，池能否提供 `count` 个单元
    pub fn can_reserve(&self, count: usize) -> bool {
        let inner = self.inner.lock();
        count <= inner.available() + inner.growth_room()
    }

    fn reserve_units(&self, work: &mut dyn PendingWork, count: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        let available = inner.available();
        if available < count {
            inner.extend(work, count - available)?;
        }
        inner.reserved += count;
        Ok(())
    }

    fn unreserve(&self, count: usize) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.reserved >= count);
        inner.reserved -= count;
    }

    /// 从预留中取出一个单元并置位
    fn allocate_reserved(&self) -> usize {
        let mut inner = self.inner.lock();
        assert!(inner.reserved > 0, "{}: allocation without reservation", inner.storage.name);
        let index = inner
            .find_free()
            .unwrap_or_else(|| panic!("{}: reserved pool has no free unit", inner.storage.name));
        inner.set(index, true);
        inner.used += 1;
        inner.reserved -= 1;
        inner.hint = index + 1;
        log::trace!("{}: allocated {index}", inner.storage.name);
        index
    }

    /// 撤销尚未持久化的分配
    fn rollback(&self, allocated: &[usize]) {
        let mut inner = self.inner.lock();
        for &index in allocated {
            inner.set(index, false);
            inner.used -= 1;
            inner.hint = inner.hint.min(index);
        }
    }

    /// 应用释放，并登记所有受影响的位图块
    fn persist(&self, work: &mut dyn PendingWork, allocated: &[usize], freed: &[usize]) {
        let mut inner = self.inner.lock();
        for &index in freed {
            assert!(inner.test(index), "{}: double free of {index}", inner.storage.name);
            inner.set(index, false);
            inner.used -= 1;
            inner.hint = inner.hint.min(index);
        }

        let blocks: BTreeSet<usize> = allocated
            .iter()
            .chain(freed)
            .map(|index| index / BLOCK_BITS)
            .collect();
        for block in blocks {
            work.enqueue_metadata(
                Operation::write(block, inner.storage.start + block, 1),
                &inner.bitmap,
            );
        }
    }
}

impl AllocatorInner {
    fn available(&self) -> usize {
        self.total - self.used - self.reserved
    }

    fn test(&self, index: usize) -> bool {
        self.bitmap.map(|bits| bits[index / 8] & (1 << (index % 8)) != 0)
    }

    fn set(&self, index: usize, on: bool) {
        self.bitmap.map_mut(|bits| {
            if on {
                bits[index / 8] |= 1 << (index % 8);
            } else {
                bits[index / 8] &= !(1 << (index % 8));
            }
        });
    }

    fn find_free(&self) -> Option<usize> {
        let total = self.total;
        let hint = self.hint.min(total);
        self.bitmap.map(|bits| {
            let free = |index: &usize| bits[index / 8] & (1 << (index % 8)) == 0;
            (hint..total).find(free).or_else(|| (0..hint).find(free))
        })
    }

    /// 还能扩容的单元数
    fn growth_room(&self) -> usize {
        if self.storage.slice_units == 0 {
            0
        } else {
            self.storage.unit_limit.saturating_sub(self.total)
        }
    }

    /// 至少扩容 `needed` 个单元，按分片取整
    ///
    /// 先确认上限与回调都允许，再一次性增长位图与总量；失败时池保持原状。
    fn extend(&mut self, work: &mut dyn PendingWork, needed: usize) -> Result<()> {
        if needed > self.growth_room() {
            log::debug!(
                "{}: pool of {} cannot grow by {needed}",
                self.storage.name,
                self.total
            );
            return Err(Error::NoSpace);
        }
        let slice = self.storage.slice_units;
        let new_total = (self.total + needed.div_ceil(slice) * slice).min(self.storage.unit_limit);
        if let Some(grow) = self.storage.grow.as_mut() {
            grow(new_total)?;
        }

        let old_blocks = self.bitmap.block_count();
        let new_blocks = blocks_for_bits(new_total);
        if new_blocks > old_blocks {
            self.bitmap.grow(new_blocks);
            work.enqueue_metadata(
                Operation::write(
                    old_blocks,
                    self.storage.start + old_blocks,
                    new_blocks - old_blocks,
                ),
                &self.bitmap,
            );
        }
        log::info!(
            "{}: pool grown from {} to {new_total} units",
            self.storage.name,
            self.total
        );
        self.total = new_total;
        Ok(())
    }
}

/// 从某个池中预留的单元
///
/// 记录在预留范围内分配与释放的单元，提交时一并持久化。
/// 丢弃时归还未用完的预留，并撤销尚未持久化的分配。
#[derive(Debug)]
pub struct AllocatorReservation {
    allocator: Arc<Allocator>,
    reserved: usize,
    allocated: Vec<usize>,
    freed: Vec<usize>,
}

impl AllocatorReservation {
    pub fn empty(allocator: &Arc<Allocator>) -> Self {
        Self {
            allocator: allocator.clone(),
            reserved: 0,
            allocated: Vec::new(),
            freed: Vec::new(),
        }
    }

    /// 剩余可分配的单元数
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    /// 追加预留，失败时已有的预留不受影响
    pub fn extend(&mut self, work: &mut dyn PendingWork, count: usize) -> Result<()> {
        self.allocator.reserve_units(work, count)?;
        self.reserved += count;
        Ok(())
    }

    pub fn allocate(&mut self) -> usize {
        assert!(self.reserved > 0, "reservation exhausted");
        let index = self.allocator.allocate_reserved();
        self.reserved -= 1;
        self.allocated.push(index);
        index
    }

    /// 释放推迟到提交时生效
    pub fn deallocate(&mut self, index: usize) {
        self.freed.push(index);
    }

    /// 把尚未使用的预留转移到一个新的预留中，已分配与释放的记录留在原处
    pub fn take_reserved(&mut self) -> Self {
        Self {
            allocator: self.allocator.clone(),
            reserved: mem::take(&mut self.reserved),
            allocated: Vec::new(),
            freed: Vec::new(),
        }
    }

    /// 持久化本预留中的分配与释放，返回位图是否有改动
    pub fn commit(&mut self, work: &mut dyn PendingWork) -> bool {
        if self.allocated.is_empty() && self.freed.is_empty() {
            return false;
        }
        let allocated = mem::take(&mut self.allocated);
        let freed = mem::take(&mut self.freed);
        self.allocator.persist(work, &allocated, &freed);
        true
    }
}

impl Drop for AllocatorReservation {
    fn drop(&mut self) {
        if self.reserved > 0 {
            self.allocator.unreserve(self.reserved);
        }
        if !self.allocated.is_empty() {
            log::debug!("rolling back {} unpersisted allocations", self.allocated.len());
            self.allocator.rollback(&self.allocated);
        }
    }
}
