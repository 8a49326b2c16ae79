//! 写回操作的描述

use alloc::vec::Vec;

use derive_more::{Add, From, Into};

use crate::buffer::BlockBuffer;

/// 设备块号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Add, From, Into)]
#[repr(transparent)]
pub struct BlockId(usize);

impl core::ops::Add<usize> for BlockId {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        self + Self(rhs)
    }
}

impl From<u32> for BlockId {
    fn from(value: u32) -> Self {
        Self(value as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Read,
    Write,
}

/// 以块为单位的一次传输
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub ty: OperationType,
    /// 缓冲区内的起始块
    pub buffer_offset: usize,
    pub dev_offset: BlockId,
    /// 块数
    pub length: usize,
}

impl Operation {
    pub fn read(buffer_offset: usize, dev_offset: impl Into<BlockId>, length: usize) -> Self {
        Self {
            ty: OperationType::Read,
            buffer_offset,
            dev_offset: dev_offset.into(),
            length,
        }
    }

    pub fn write(buffer_offset: usize, dev_offset: impl Into<BlockId>, length: usize) -> Self {
        Self {
            ty: OperationType::Write,
            buffer_offset,
            dev_offset: dev_offset.into(),
            length,
        }
    }
}

/// 操作与其源（或目标）缓冲区
#[derive(Debug, Clone)]
pub struct BufferedOperation {
    pub op: Operation,
    pub buffer: BlockBuffer,
}

/// 可以登记待写回操作的对象
pub trait PendingWork {
    fn enqueue_metadata(&mut self, op: Operation, buffer: &BlockBuffer);

    fn enqueue_data(&mut self, op: Operation, buffer: &BlockBuffer);
}

/// 挂载与格式化时收集的一批操作
///
/// 不区分元数据与数据，按登记顺序执行。
#[derive(Debug, Default)]
pub struct OperationBuilder {
    ops: Vec<BufferedOperation>,
}

impl OperationBuilder {
    pub fn add(&mut self, op: Operation, buffer: &BlockBuffer) {
        self.ops.push(BufferedOperation {
            op,
            buffer: buffer.clone(),
        });
    }

    pub fn take(&mut self) -> Vec<BufferedOperation> {
        core::mem::take(&mut self.ops)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl PendingWork for OperationBuilder {
    fn enqueue_metadata(&mut self, op: Operation, buffer: &BlockBuffer) {
        self.add(op, buffer);
    }

    fn enqueue_data(&mut self, op: Operation, buffer: &BlockBuffer) {
        self.add(op, buffer);
    }
}
