//! 写回：把一批操作按顺序下发给块设备

use alloc::sync::Arc;
use alloc::vec::Vec;

use block_dev::BlockDevice;

use crate::layout::BLOCK_SIZE;
use crate::operation::{BufferedOperation, OperationType};

pub struct Writeback {
    device: Arc<dyn BlockDevice>,
    /// 写回管线的容量（块）
    capacity: usize,
}

impl Writeback {
    pub fn new(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        Self { device, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 依次执行，读操作填充缓冲区，写操作从缓冲区取数据；结束后刷新设备
    pub fn transact(&self, ops: Vec<BufferedOperation>) {
        if ops.is_empty() {
            return;
        }

        let mut block = [0; BLOCK_SIZE];
        let mut written = 0;
        for BufferedOperation { op, buffer } in ops {
            for i in 0..op.length {
                let dev_block = usize::from(op.dev_offset + i);
                match op.ty {
                    OperationType::Read => {
                        self.device.read_block(dev_block, &mut block);
                        buffer.write_block(op.buffer_offset + i, &block);
                    }
                    OperationType::Write => {
                        buffer.read_block(op.buffer_offset + i, &mut block);
                        self.device.write_block(dev_block, &block);
                        written += 1;
                    }
                }
            }
        }
        if written > 0 {
            self.device.flush();
        }
        log::trace!("writeback: {written} blocks written");
    }
}
