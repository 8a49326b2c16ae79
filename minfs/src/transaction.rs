//! # 事务
//!
//! 事务在开始时一次性预留 inode 与数据块，之后的修改只作用于内存，
//! 同时登记元数据与数据两条写回队列。提交由 [`Minfs`](crate::Minfs) 完成；
//! 未提交就丢弃的事务会归还全部预留，不触及已持久化的位图。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;

use vfs::Error;

use crate::allocator::{Allocator, AllocatorReservation};
use crate::buffer::BlockBuffer;
use crate::operation::{BufferedOperation, Operation, PendingWork};
use crate::Result;

/// 脱离事务单独持有的数据块预留
///
/// 同一时刻只能挂在一个事务上，由所有权保证。
#[derive(Debug)]
pub struct CachedBlockTransaction {
    reservation: AllocatorReservation,
}

impl CachedBlockTransaction {
    pub fn reserved(&self) -> usize {
        self.reservation.reserved()
    }
}

#[derive(Debug, Default)]
struct WorkQueue {
    metadata: Vec<BufferedOperation>,
    data: Vec<BufferedOperation>,
}

impl PendingWork for WorkQueue {
    fn enqueue_metadata(&mut self, op: Operation, buffer: &BlockBuffer) {
        self.metadata.push(BufferedOperation {
            op,
            buffer: buffer.clone(),
        });
    }

    fn enqueue_data(&mut self, op: Operation, buffer: &BlockBuffer) {
        self.data.push(BufferedOperation {
            op,
            buffer: buffer.clone(),
        });
    }
}

#[derive(Debug)]
pub struct Transaction {
    inode_reservation: AllocatorReservation,
    block_reservation: AllocatorReservation,
    work: WorkQueue,
    /// 写回完成前需要保留的 vnode，允许重复
    pinned: Vec<u32>,
}

impl Transaction {
    /// 预留 `inodes` 个 inode 与 `blocks` 个数据块，任一不足则都不预留
    pub fn create(
        inode_pool: &Arc<Allocator>,
        block_pool: &Arc<Allocator>,
        inodes: usize,
        blocks: usize,
    ) -> Result<Self> {
        // 两个池都够才动手，免得一个池已经扩容而另一个失败
        if !inode_pool.can_reserve(inodes) || !block_pool.can_reserve(blocks) {
            log::debug!("transaction cannot reserve {inodes} inodes, {blocks} blocks");
            return Err(Error::NoSpace);
        }
        let mut work = WorkQueue::default();
        let inode_reservation = inode_pool.reserve(&mut work, inodes)?;
        let block_reservation = block_pool.reserve(&mut work, blocks)?;
        log::trace!("transaction reserved {inodes} inodes, {blocks} blocks");

        Ok(Self {
            inode_reservation,
            block_reservation,
            work,
            pinned: Vec::new(),
        })
    }

    /// 接上先前取出的数据块预留，不再检查可用量
    pub fn from_cached_block_transaction(
        inode_pool: &Arc<Allocator>,
        cached: CachedBlockTransaction,
    ) -> Self {
        Self {
            inode_reservation: AllocatorReservation::empty(inode_pool),
            block_reservation: cached.reservation,
            work: WorkQueue::default(),
            pinned: Vec::new(),
        }
    }

    /// 取出尚未使用的数据块预留，已分配的块仍随本事务提交
    pub fn take_block_reservations(&mut self) -> CachedBlockTransaction {
        CachedBlockTransaction {
            reservation: self.block_reservation.take_reserved(),
        }
    }

    pub fn allocate_inode(&mut self) -> u32 {
        self.inode_reservation.allocate() as u32
    }

    pub fn allocate_block(&mut self) -> u32 {
        self.block_reservation.allocate() as u32
    }

    pub fn deallocate_inode(&mut self, ino: u32) {
        self.inode_reservation.deallocate(ino as usize);
    }

    /// 块数的扣减由调用者负责
    pub fn deallocate_block(&mut self, bno: u32) {
        self.block_reservation.deallocate(bno as usize);
    }

    pub fn block_reserved(&self) -> usize {
        self.block_reservation.reserved()
    }

    /// 追加数据块预留，失败时已有预留不变
    pub fn extend_block_reservation(&mut self, blocks: usize) -> Result<()> {
        self.block_reservation.extend(&mut self.work, blocks)
    }

    pub fn pin_vnode(&mut self, ino: u32) {
        self.pinned.push(ino);
    }

    pub fn remove_pinned_vnodes(&mut self) -> Vec<u32> {
        mem::take(&mut self.pinned)
    }

    /// 是否登记了任何写回
    pub fn has_work(&self) -> bool {
        !self.work.metadata.is_empty() || !self.work.data.is_empty()
    }

    pub fn remove_metadata_operations(&mut self) -> Vec<BufferedOperation> {
        mem::take(&mut self.work.metadata)
    }

    pub fn remove_data_operations(&mut self) -> Vec<BufferedOperation> {
        mem::take(&mut self.work.data)
    }

    /// 持久化两份预留中的分配与释放，返回位图是否有改动
    pub(crate) fn commit_reservations(&mut self) -> bool {
        let inodes = self.inode_reservation.commit(&mut self.work);
        let blocks = self.block_reservation.commit(&mut self.work);
        inodes || blocks
    }
}

impl PendingWork for Transaction {
    fn enqueue_metadata(&mut self, op: Operation, buffer: &BlockBuffer) {
        self.work.enqueue_metadata(op, buffer);
    }

    fn enqueue_data(&mut self, op: Operation, buffer: &BlockBuffer) {
        self.work.enqueue_data(op, buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::PersistentStorage;
    use crate::operation::OperationBuilder;

    fn pools() -> (Arc<Allocator>, Arc<Allocator>) {
        let mut builder = OperationBuilder::default();
        let inodes =
            Allocator::create(&mut builder, PersistentStorage::fixed("inodes", 2usize.into()), 16);
        let blocks =
            Allocator::create(&mut builder, PersistentStorage::fixed("blocks", 3usize.into()), 64);
        (inodes, blocks)
    }

    #[test]
    #[should_panic(expected = "reservation exhausted")]
    fn allocate_past_reservation() {
        let (inodes, blocks) = pools();
        let mut txn = Transaction::create(&inodes, &blocks, 1, 5).unwrap();
        txn.allocate_inode();
        for _ in 0..5 {
            txn.allocate_block();
        }
        txn.allocate_block();
    }

    #[test]
    fn failed_create_takes_nothing() {
        let (inodes, blocks) = pools();
        assert_eq!(
            Err(Error::NoSpace),
            Transaction::create(&inodes, &blocks, 2, 65).map(|_| ())
        );
        assert_eq!(0, inodes.pool_reserved());
        assert_eq!(0, blocks.pool_reserved());
    }

    #[test]
    fn failed_create_leaves_growable_pool_alone() {
        let mut builder = OperationBuilder::default();
        let storage = PersistentStorage::growable("inodes", 2usize.into(), 64, 16);
        let inodes = Allocator::create(&mut builder, storage, 16);
        let blocks =
            Allocator::create(&mut builder, PersistentStorage::fixed("blocks", 3usize.into()), 64);

        assert_eq!(
            Err(Error::NoSpace),
            Transaction::create(&inodes, &blocks, 20, 65).map(|_| ())
        );
        assert_eq!(16, inodes.pool_total());
        assert_eq!(0, inodes.pool_reserved());

        let txn = Transaction::create(&inodes, &blocks, 20, 64).unwrap();
        assert_eq!(32, inodes.pool_total());
        drop(txn);
    }

    #[test]
    fn abandoned_transaction_releases() {
        let (inodes, blocks) = pools();
        let mut txn = Transaction::create(&inodes, &blocks, 1, 4).unwrap();
        txn.allocate_inode();
        txn.allocate_block();
        // 3 块仍在预留中，1 块已分配
        assert_eq!(60, blocks.pool_available());
        assert_eq!(3, blocks.pool_reserved());
        drop(txn);

        assert_eq!(16, inodes.pool_available());
        assert_eq!(64, blocks.pool_available());
    }

    #[test]
    fn extension_keeps_existing_reservation() {
        let (inodes, blocks) = pools();
        let mut txn = Transaction::create(&inodes, &blocks, 0, 60).unwrap();
        assert_eq!(Err(Error::NoSpace), txn.extend_block_reservation(5));
        assert_eq!(60, txn.block_reserved());
        assert_eq!(Ok(()), txn.extend_block_reservation(4));
        assert_eq!(64, txn.block_reserved());
    }

    #[test]
    fn cached_reservation_moves_between_transactions() {
        let (inodes, blocks) = pools();
        let mut first = Transaction::create(&inodes, &blocks, 0, 10).unwrap();
        let bno = first.allocate_block();
        let cached = first.take_block_reservations();
        assert_eq!(9, cached.reserved());

        assert!(first.commit_reservations());
        drop(first);
        assert!(blocks.is_allocated(bno as usize));
        assert_eq!(9, blocks.pool_reserved());

        let mut second = Transaction::from_cached_block_transaction(&inodes, cached);
        for _ in 0..9 {
            second.allocate_block();
        }
        assert!(second.commit_reservations());
        assert_eq!(10, blocks.pool_used());
        assert_eq!(0, blocks.pool_reserved());
    }

    #[test]
    fn queues_drain_and_pins_keep_duplicates() {
        let (inodes, blocks) = pools();
        let mut txn = Transaction::create(&inodes, &blocks, 0, 0).unwrap();
        let buffer = BlockBuffer::new(1);
        txn.enqueue_metadata(Operation::write(0, 7usize, 1), &buffer);
        txn.enqueue_data(Operation::write(0, 8usize, 1), &buffer);
        txn.pin_vnode(3);
        txn.pin_vnode(3);

        assert_eq!(1, txn.remove_metadata_operations().len());
        assert!(txn.remove_metadata_operations().is_empty());
        assert_eq!(1, txn.remove_data_operations().len());
        assert!(txn.remove_data_operations().is_empty());
        assert_eq!(alloc::vec![3, 3], txn.remove_pinned_vnodes());
    }
}
