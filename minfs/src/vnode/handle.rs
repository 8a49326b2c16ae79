//! # vnode 句柄
//!
//! [`Vnode`] 只持有 inode 编号与文件系统的引用，每个操作都在持锁期间完成。
//! 句柄计入 vnode 的打开计数，克隆时加一，析构时减一；
//! 最后一个句柄关闭时，已脱离目录树的 vnode 被回收。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;
use vfs::{DirEntry, DirEntryType, Error, Stat};

use crate::fs::Minfs;
use crate::Result;

/// 目录遍历游标
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirCookie {
    /// 下一次开始读取的目录偏移
    pub(crate) off: usize,
    /// 上次读取时目录的序列号
    pub(crate) seqno: u32,
}

pub struct Vnode {
    ino: u32,
    fs: Arc<Mutex<Minfs>>,
}

impl fmt::Debug for Vnode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vnode")
            .field("ino", &self.ino)
            .finish_non_exhaustive()
    }
}

impl Vnode {
    /// 包装一个已计入打开计数的 vnode
    pub(crate) fn opened(fs: &Arc<Mutex<Minfs>>, ino: u32) -> Self {
        Self {
            ino,
            fs: Arc::clone(fs),
        }
    }

    /// 持锁执行 `f`，结束后清理临时载入的 vnode
    fn with_fs<V>(&self, f: impl FnOnce(&mut Minfs) -> V) -> V {
        let mut fs = self.fs.lock();
        let result = f(&mut fs);
        fs.evict_idle();
        result
    }

    /// 打开 `ino` 并交出句柄
    fn open(&self, ino: u32) -> Result<Self> {
        self.with_fs(|fs| fs.open(ino))?;
        Ok(Self::opened(&self.fs, ino))
    }

    fn same_fs(&self, other: &Vnode) -> Result<()> {
        if Arc::ptr_eq(&self.fs, &other.fs) {
            Ok(())
        } else {
            Err(Error::InvalidArgs)
        }
    }

    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn is_directory(&self) -> bool {
        self.with_fs(|fs| fs.vnode(self.ino).is_directory())
    }

    pub fn get_size(&self) -> usize {
        self.with_fs(|fs| fs.vnode(self.ino).size())
    }

    pub fn set_size(&self, len: usize) -> Result<()> {
        self.truncate(len)
    }

    /// 已映射的块数，含间接块
    pub fn get_block_count(&self) -> u32 {
        self.with_fs(|fs| fs.vnode(self.ino).inode.block_count)
    }

    pub fn stat(&self) -> Stat {
        self.with_fs(|fs| fs.vnode(self.ino).stat())
    }
}

/// 文件操作
impl Vnode {
    /// 读到文件末尾为止，返回读到的字节数
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        self.with_fs(|fs| fs.file_read(self.ino, offset, buf))
    }

    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize> {
        self.with_fs(|fs| fs.file_write(self.ino, offset, buf))
    }

    /// 返回写入后的文件末尾与写入的字节数
    pub fn append(&self, buf: &[u8]) -> Result<(usize, usize)> {
        self.with_fs(|fs| fs.file_append(self.ino, buf))
    }

    pub fn truncate(&self, len: usize) -> Result<()> {
        self.with_fs(|fs| fs.file_truncate(self.ino, len))
    }
}

/// 目录操作
impl Vnode {
    pub fn lookup(&self, name: &str) -> Result<Self> {
        let ino = self.with_fs(|fs| fs.lookup(self.ino, name))?;
        self.open(ino)
    }

    pub fn create(&self, name: &str, ty: DirEntryType) -> Result<Self> {
        let ino = self.with_fs(|fs| fs.create(self.ino, name, ty))?;
        Ok(Self::opened(&self.fs, ino))
    }

    /// `must_be_dir` 为真时只删除目录
    pub fn unlink(&self, name: &str, must_be_dir: bool) -> Result<()> {
        self.with_fs(|fs| fs.unlink(self.ino, name, must_be_dir))
    }

    /// 把本目录下的 `old` 移到 `dst` 目录下，命名为 `new`
    pub fn rename(
        &self,
        old: &str,
        dst: &Vnode,
        new: &str,
        src_must_be_dir: bool,
        dst_must_be_dir: bool,
    ) -> Result<()> {
        self.same_fs(dst)?;
        self.with_fs(|fs| {
            fs.rename(
                self.ino,
                old,
                dst.ino,
                new,
                src_must_be_dir,
                dst_must_be_dir,
            )
        })
    }

    /// 在本目录下为 `target` 新建名字 `name`
    pub fn link(&self, name: &str, target: &Vnode) -> Result<()> {
        self.same_fs(target)?;
        self.with_fs(|fs| fs.link(self.ino, name, target.ino))
    }

    /// 从 `cookie` 处继续列出最多 `max` 项；返回空表示已到末尾
    pub fn readdir(&self, cookie: &mut DirCookie, max: usize) -> Result<Vec<DirEntry>> {
        self.with_fs(|fs| fs.readdir(self.ino, cookie, max))
    }

    pub fn can_unlink(&self) -> Result<()> {
        self.with_fs(|fs| fs.vnode(self.ino).can_unlink())
    }

    /// 标记或取消挂载点
    pub fn set_remote(&self, remote: bool) -> Result<()> {
        self.with_fs(|fs| fs.set_remote(self.ino, remote))
    }
}

impl Clone for Vnode {
    fn clone(&self) -> Self {
        self.fs.lock().vnode_mut(self.ino).open_count += 1;
        Self::opened(&self.fs, self.ino)
    }
}

impl Drop for Vnode {
    fn drop(&mut self) {
        self.fs.lock().close(self.ino);
    }
}
