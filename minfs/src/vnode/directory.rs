//! # 目录
//!
//! 目录内容就是一串紧密拼接的目录项，没有额外索引。
//! 查找、建立空间、删除、改名都通过同一个遍历原语 [`Minfs::for_each_dirent`]
//! 配合不同的访问函数完成，访问函数用 [`IterCommand`] 告诉遍历下一步做什么。

use alloc::vec::Vec;

use vfs::{DirEntry, DirEntryType, Error};

use super::handle::DirCookie;
use super::required_block_count;
use crate::fs::Minfs;
use crate::layout::{
    dirent_size, Dirent, DiskInode, DIRENT_HEADER_SIZE, MAX_DIRECTORY_SIZE, NAME_MAX, ROOT_INO,
};
use crate::transaction::Transaction;
use crate::Result;

/// 访问函数的返回
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IterCommand {
    Next,
    Done,
    /// 停止遍历，并提交目录自身的 inode
    SaveSync,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DirOffsets {
    /// 当前目录项
    pub(crate) off: usize,
    /// 前一个目录项，位于开头时与 `off` 相同
    pub(crate) off_prev: usize,
}

pub(crate) struct DirArgs<'a> {
    name: &'a str,
    ino: u32,
    ty: DirEntryType,
    must_be_dir: bool,
    /// 需要的记录长度
    reclen: usize,
    txn: Option<&'a mut Transaction>,
    offs: DirOffsets,
}

impl<'a> DirArgs<'a> {
    fn new(name: &'a str) -> Self {
        Self {
            name,
            ino: 0,
            ty: DirEntryType::default(),
            must_be_dir: false,
            reclen: 0,
            txn: None,
            offs: DirOffsets::default(),
        }
    }

    fn with_transaction(mut self, txn: &'a mut Transaction) -> Self {
        self.txn = Some(txn);
        self
    }

    fn transaction(&mut self) -> &mut Transaction {
        self.txn
            .as_deref_mut()
            .unwrap_or_else(|| panic!("directory mutation of {:?} without a transaction", self.name))
    }
}

type DirentCallback = fn(&mut Minfs, u32, &Dirent, &mut DirArgs<'_>) -> Result<IterCommand>;

/// 新名字不能为空，不能是 `.`、`..` 或包含 `/`
fn check_name(name: &str) -> Result<()> {
    if name.len() > NAME_MAX {
        return Err(Error::NameTooLong);
    }
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(Error::InvalidArgs);
    }
    Ok(())
}

fn find(_: &mut Minfs, _: u32, de: &Dirent, args: &mut DirArgs<'_>) -> Result<IterCommand> {
    if de.is_free() || de.name != args.name {
        return Ok(IterCommand::Next);
    }
    args.ino = de.ino;
    args.ty = de.ty;
    Ok(IterCommand::Done)
}

/// 找到一个空闲记录，或一个尾部空余足够拆分的记录
fn find_space(_: &mut Minfs, _: u32, de: &Dirent, args: &mut DirArgs<'_>) -> Result<IterCommand> {
    let reclen = de.reclen_at(args.offs.off);
    let room = if de.is_free() {
        reclen
    } else {
        reclen - de.size()
    };
    if room >= args.reclen {
        Ok(IterCommand::Done)
    } else {
        Ok(IterCommand::Next)
    }
}

fn unlink(fs: &mut Minfs, dir: u32, de: &Dirent, args: &mut DirArgs<'_>) -> Result<IterCommand> {
    if de.is_free() || de.name != args.name {
        return Ok(IterCommand::Next);
    }
    fs.vnode_get(de.ino)?;
    let child = fs.vnode(de.ino);
    if args.must_be_dir && !child.is_directory() {
        return Err(Error::NotADirectory);
    }
    child.can_unlink()?;
    fs.unlink_child(dir, de, args)
}

/// 不检查能否删除，供改名移除旧名字
fn force_unlink(
    fs: &mut Minfs,
    dir: u32,
    de: &Dirent,
    args: &mut DirArgs<'_>,
) -> Result<IterCommand> {
    if de.is_free() || de.name != args.name {
        return Ok(IterCommand::Next);
    }
    fs.vnode_get(de.ino)?;
    fs.unlink_child(dir, de, args)
}

/// 目标名字已存在时，让它改指向被移动的 inode
fn attempt_rename(
    fs: &mut Minfs,
    dir: u32,
    de: &Dirent,
    args: &mut DirArgs<'_>,
) -> Result<IterCommand> {
    if de.is_free() || de.name != args.name {
        return Ok(IterCommand::Next);
    }
    fs.check_rename_target(args.ino, args.ty, de.ino)?;

    let off = args.offs.off;
    let mut replaced = de.clone();
    replaced.ino = args.ino;
    replaced.ty = args.ty;
    let txn = args.transaction();
    fs.vnode_mut(dir).write_dirent(txn, off, &replaced)?;
    fs.remove_inode_link(txn, de.ino);
    txn.pin_vnode(de.ino);
    Ok(IterCommand::SaveSync)
}

/// 改写指定名字的 inode 编号，用于更新 `..`
fn update_inode(
    fs: &mut Minfs,
    dir: u32,
    de: &Dirent,
    args: &mut DirArgs<'_>,
) -> Result<IterCommand> {
    if de.is_free() || de.name != args.name {
        return Ok(IterCommand::Next);
    }
    let off = args.offs.off;
    let mut updated = de.clone();
    updated.ino = args.ino;
    let txn = args.transaction();
    fs.vnode_mut(dir).write_dirent(txn, off, &updated)?;
    Ok(IterCommand::SaveSync)
}

impl Minfs {
    fn ensure_directory(&self, ino: u32) -> Result<()> {
        if self.vnode(ino).is_directory() {
            Ok(())
        } else {
            Err(Error::NotADirectory)
        }
    }

    /// 从头遍历目录项，直到访问函数结束遍历或出错
    ///
    /// 走到目录末尾仍未结束时返回 [`Error::NotFound`]。
    pub(crate) fn for_each_dirent(
        &mut self,
        dir: u32,
        args: &mut DirArgs<'_>,
        callback: DirentCallback,
    ) -> Result<()> {
        args.offs = DirOffsets::default();
        while args.offs.off + DIRENT_HEADER_SIZE < MAX_DIRECTORY_SIZE {
            let off = args.offs.off;
            let de = self.vnode(dir).read_dirent(off)?;
            match callback(self, dir, &de, args)? {
                IterCommand::Next => {
                    args.offs.off_prev = off;
                    args.offs.off = off + de.reclen_at(off);
                }
                IterCommand::Done => return Ok(()),
                IterCommand::SaveSync => {
                    let txn = args.transaction();
                    self.vnode_mut(dir).inode.seq_num += 1;
                    self.inode_sync(txn, dir);
                    txn.pin_vnode(dir);
                    return Ok(());
                }
            }
        }
        Err(Error::NotFound)
    }

    /// 在 `args.offs.off` 处写入新目录项
    ///
    /// 空闲记录整条占用；已占用的记录先缩到自身大小，新目录项接管剩余部分
    /// 并继承末项标记。
    fn append_dirent(&mut self, dir: u32, args: &mut DirArgs<'_>) -> Result<()> {
        let mut off = args.offs.off;
        let (name, ino, ty, needed) = (args.name, args.ino, args.ty, args.reclen);
        let txn = args.transaction();

        let mut de = self.vnode(dir).read_dirent(off)?;
        let reclen = de.reclen_at(off);
        let (new_reclen, is_last) = if de.is_free() {
            if needed > reclen {
                return Err(Error::NoSpace);
            }
            (de.reclen, de.is_last)
        } else {
            let size = de.size();
            let extra = reclen - size;
            if extra < needed {
                return Err(Error::NoSpace);
            }
            let was_last = de.is_last;
            de.reclen = size as u32;
            de.is_last = false;
            self.vnode_mut(dir).write_dirent(txn, off, &de)?;
            off += size;
            (extra as u32, was_last)
        };

        let mut entry = Dirent::new(ino, ty, name);
        entry.reclen = new_reclen;
        entry.is_last = is_last;
        self.vnode_mut(dir).write_dirent(txn, off, &entry)?;

        let (vnode, inodes) = self.vnode_parts(dir);
        if ty == DirEntryType::Directory {
            // 子目录的 `..`
            vnode.inode.link_count += 1;
        }
        vnode.inode.dirent_count += 1;
        vnode.inode.seq_num += 1;
        vnode.inode_sync(txn, inodes);
        txn.pin_vnode(dir);
        log::debug!("directory {dir}: added {name:?} -> {ino} at {off}");
        Ok(())
    }

    /// 把 `args.offs.off` 处的目录项改为空闲，并与相邻的空闲记录合并
    fn unlink_child(
        &mut self,
        dir: u32,
        de: &Dirent,
        args: &mut DirArgs<'_>,
    ) -> Result<IterCommand> {
        let DirOffsets { off, off_prev } = args.offs;
        let txn = args.transaction();
        let child = de.ino;

        let mut coalesced = de.reclen_at(off);
        let mut is_last = de.is_last;
        let mut start = off;
        // 先合并后一项，末项标记才能顺势前移
        if !de.is_last {
            let next_off = off + coalesced;
            let next = self.vnode(dir).read_dirent(next_off)?;
            if next.is_free() {
                coalesced += next.reclen_at(next_off);
                is_last = next.is_last;
            }
        }
        if off_prev != off {
            let prev = self.vnode(dir).read_dirent(off_prev)?;
            if prev.is_free() {
                coalesced += prev.reclen_at(off_prev);
                start = off_prev;
            }
        }

        let free = Dirent::free(coalesced as u32, is_last);
        let vnode = self.vnode_mut(dir);
        vnode.write_dirent(txn, start, &free)?;
        if is_last {
            // 只是去掉尾部的空闲空间，失败也无妨
            if let Err(err) = vnode.truncate_internal(txn, start + DIRENT_HEADER_SIZE) {
                log::warn!("directory {dir}: trimming free tail failed: {err}");
            }
        }
        vnode.inode.dirent_count -= 1;
        if self.vnode(child).is_directory() {
            // 子目录的 `..` 不再指向这里
            self.vnode_mut(dir).inode.link_count -= 1;
        }
        self.remove_inode_link(txn, child);
        txn.pin_vnode(dir);
        txn.pin_vnode(child);
        log::debug!("directory {dir}: removed {:?} -> {child}", de.name);
        Ok(IterCommand::SaveSync)
    }

    /// 改名覆盖 `target` 前的检查
    fn check_rename_target(&mut self, moved: u32, ty: DirEntryType, target: u32) -> Result<()> {
        if target == moved {
            return Err(Error::BadState);
        }
        self.vnode_get(target)?;
        let target = self.vnode(target);
        let moving_dir = ty == DirEntryType::Directory;
        if moving_dir != target.is_directory() {
            return Err(if moving_dir {
                Error::NotADirectory
            } else {
                Error::IsADirectory
            });
        }
        target.can_unlink()
    }

    /// 查找名字，返回 inode 编号与类型
    fn lookup_entry(&mut self, dir: u32, name: &str) -> Result<(u32, DirEntryType)> {
        let mut args = DirArgs::new(name);
        self.for_each_dirent(dir, &mut args, find)?;
        Ok((args.ino, args.ty))
    }

    /// 确认名字尚不存在，并找到能容纳它的位置
    fn find_space_for(&mut self, dir: u32, name: &str) -> Result<usize> {
        match self.lookup_entry(dir, name) {
            Ok(_) => return Err(Error::AlreadyExists),
            Err(Error::NotFound) => {}
            Err(err) => return Err(err),
        }
        self.find_space_in(dir, dirent_size(name.len()))
    }

    /// 找到能放下 `reclen` 字节新记录的位置
    fn find_space_in(&mut self, dir: u32, reclen: usize) -> Result<usize> {
        let mut args = DirArgs::new("");
        args.reclen = reclen;
        match self.for_each_dirent(dir, &mut args, find_space) {
            Ok(()) => Ok(args.offs.off),
            Err(Error::NotFound) => Err(Error::NoSpace),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn lookup(&mut self, dir: u32, name: &str) -> Result<u32> {
        self.ensure_directory(dir)?;
        if name.len() > NAME_MAX {
            return Err(Error::NameTooLong);
        }
        if name.is_empty() {
            return Err(Error::InvalidArgs);
        }
        self.lookup_entry(dir, name).map(|(ino, _)| ino)
    }

    /// 新建文件或子目录，返回已打开的子节点
    pub(crate) fn create(&mut self, dir: u32, name: &str, ty: DirEntryType) -> Result<u32> {
        check_name(name)?;
        self.ensure_directory(dir)?;
        if self.vnode(dir).is_unlinked() {
            return Err(Error::BadState);
        }
        let off = self.find_space_for(dir, name)?;

        let reclen = dirent_size(name.len());
        let mut blocks = required_block_count(self.vnode(dir).size(), reclen);
        if ty == DirEntryType::Directory {
            // 子目录的 `.` 与 `..`
            blocks += 1;
        }
        let mut txn = self.begin_transaction(1, blocks)?;
        let ino = txn.allocate_inode();
        let dat_block = self.superblock.info().dat_block.into();
        self.vnodes.insert(
            ino,
            super::VnodeMinfs::new(ino, DiskInode::new(ty), dat_block),
        );

        let mut args = DirArgs::new(name).with_transaction(&mut txn);
        args.ino = ino;
        args.ty = ty;
        args.reclen = reclen;
        args.offs = DirOffsets { off, off_prev: off };
        if let Err(err) = self.link_new_child(dir, &mut args) {
            self.vnodes.remove(&ino);
            return Err(err);
        }

        self.vnode_mut(ino).open_count += 1;
        self.commit_transaction(txn);
        log::debug!("created {ty:?} {name:?} as inode {ino} in directory {dir}");
        Ok(ino)
    }

    fn link_new_child(&mut self, dir: u32, args: &mut DirArgs<'_>) -> Result<()> {
        let ino = args.ino;
        let txn = args.transaction();
        if self.vnode(ino).is_directory() {
            let [dot, dotdot] = Dirent::dots(ino, dir);
            let child = self.vnode_mut(ino);
            child.write_dirent(txn, 0, &dot)?;
            child.write_dirent(txn, dot.size(), &dotdot)?;
            child.inode.dirent_count = 2;
        }
        self.inode_sync(txn, ino);
        txn.pin_vnode(ino);
        self.append_dirent(dir, args)
    }

    pub(crate) fn unlink(&mut self, dir: u32, name: &str, must_be_dir: bool) -> Result<()> {
        check_name(name)?;
        self.ensure_directory(dir)?;

        let mut txn = self.begin_transaction(0, 0)?;
        let mut args = DirArgs::new(name).with_transaction(&mut txn);
        args.must_be_dir = must_be_dir;
        self.for_each_dirent(dir, &mut args, unlink)?;
        self.commit_transaction(txn);
        Ok(())
    }

    /// 沿 `..` 从 `dst` 走到根，确认不会把目录移进自己的子树
    fn check_not_subdirectory(&mut self, moved: u32, dst: u32) -> Result<()> {
        let mut current = dst;
        while current != ROOT_INO {
            if current == moved {
                return Err(Error::InvalidArgs);
            }
            self.vnode_get(current)?;
            current = self.lookup_entry(current, "..")?.0;
        }
        Ok(())
    }

    pub(crate) fn rename(
        &mut self,
        src: u32,
        old: &str,
        dst: u32,
        new: &str,
        src_must_be_dir: bool,
        dst_must_be_dir: bool,
    ) -> Result<()> {
        check_name(old)?;
        check_name(new)?;
        self.ensure_directory(src)?;
        self.ensure_directory(dst)?;
        if self.vnode(dst).is_unlinked() {
            return Err(Error::NotFound);
        }

        let mut args = DirArgs::new(old);
        self.for_each_dirent(src, &mut args, find)?;
        let (moved, old_off) = (args.ino, args.offs.off);
        self.vnode_get(moved)?;
        let is_dir = self.vnode(moved).is_directory();
        if !is_dir && (src_must_be_dir || dst_must_be_dir) {
            return Err(Error::NotADirectory);
        }
        if src != dst && is_dir {
            self.check_not_subdirectory(moved, dst)?;
        }
        if src == dst && old == new {
            return Ok(());
        }

        let ty = if is_dir {
            DirEntryType::Directory
        } else {
            DirEntryType::Regular
        };
        let reclen = dirent_size(new.len());

        // 可能失败的读取与检查都放在修改之前，出错时两个目录都保持原样
        let append_at = match self.lookup_entry(dst, new) {
            Ok((target, _)) => {
                self.check_rename_target(moved, ty, target)?;
                None
            }
            Err(Error::NotFound) => Some(self.find_space_in(dst, reclen)?),
            Err(err) => return Err(err),
        };
        // 移除旧名字时会与后一项合并
        let src_vnode = self.vnode(src);
        let old_de = src_vnode.read_dirent(old_off)?;
        if !old_de.is_last {
            src_vnode.read_dirent(old_off + old_de.reclen_at(old_off))?;
        }
        if is_dir && src != dst {
            self.lookup_entry(moved, "..")?;
        }

        let blocks = required_block_count(self.vnode(dst).size(), reclen);
        let mut txn = self.begin_transaction(0, blocks)?;
        let mut args = DirArgs::new(new).with_transaction(&mut txn);
        args.ino = moved;
        args.ty = ty;
        args.reclen = reclen;
        match append_at {
            None => self.for_each_dirent(dst, &mut args, attempt_rename)?,
            Some(off) => {
                args.offs = DirOffsets { off, off_prev: off };
                self.append_dirent(dst, &mut args)?;
            }
        }

        if is_dir && src != dst {
            let mut args = DirArgs::new("..").with_transaction(&mut txn);
            args.ino = dst;
            self.for_each_dirent(moved, &mut args, update_inode)?;
        }

        // 先多挂一个链接，移除旧名字的任一时刻都至少有一条路径可达
        self.vnode_mut(moved).inode.link_count += 1;
        let mut args = DirArgs::new(old).with_transaction(&mut txn);
        self.for_each_dirent(src, &mut args, force_unlink)?;

        self.commit_transaction(txn);
        log::debug!("renamed {old:?} in {src} to {new:?} in {dst}");
        Ok(())
    }

    /// 为已有文件再建一个名字
    pub(crate) fn link(&mut self, dir: u32, name: &str, target: u32) -> Result<()> {
        check_name(name)?;
        self.ensure_directory(dir)?;
        if self.vnode(dir).is_unlinked() {
            return Err(Error::BadState);
        }
        self.vnode_get(target)?;
        let vnode = self.vnode(target);
        if vnode.is_directory() {
            return Err(Error::IsADirectory);
        }
        if vnode.is_unlinked() {
            return Err(Error::NotFound);
        }
        let off = self.find_space_for(dir, name)?;

        let reclen = dirent_size(name.len());
        let blocks = required_block_count(self.vnode(dir).size(), reclen);
        let mut txn = self.begin_transaction(0, blocks)?;
        let mut args = DirArgs::new(name).with_transaction(&mut txn);
        args.ino = target;
        args.ty = DirEntryType::Regular;
        args.reclen = reclen;
        args.offs = DirOffsets { off, off_prev: off };
        self.append_dirent(dir, &mut args)?;

        self.vnode_mut(target).inode.link_count += 1;
        self.inode_sync(&mut txn, target);
        txn.pin_vnode(target);
        self.commit_transaction(txn);
        Ok(())
    }

    /// 从游标处继续列出目录，最多 `max` 项，跳过 `..`
    ///
    /// 目录在两次调用之间被修改过时，从头重走到游标位置以找回合法偏移；
    /// 途中遇到损坏的记录直接报错。
    pub(crate) fn readdir(
        &mut self,
        dir: u32,
        cookie: &mut DirCookie,
        max: usize,
    ) -> Result<Vec<DirEntry>> {
        self.ensure_directory(dir)?;
        let vnode = self.vnode(dir);

        let mut off = cookie.off;
        if off != 0 && cookie.seqno != vnode.inode.seq_num {
            let mut recovered = 0;
            while recovered < off {
                if recovered + DIRENT_HEADER_SIZE >= MAX_DIRECTORY_SIZE {
                    log::error!("directory {dir}: readdir recovery ran past the directory");
                    cookie.off = 0;
                    return Err(Error::Io);
                }
                match vnode.read_dirent(recovered) {
                    Ok(de) => recovered += de.reclen_at(recovered),
                    Err(err) => {
                        log::error!("directory {dir}: corrupt dirent during readdir recovery");
                        cookie.off = 0;
                        return Err(err);
                    }
                }
            }
            off = recovered;
        }

        let mut entries = Vec::new();
        while off + DIRENT_HEADER_SIZE < MAX_DIRECTORY_SIZE && entries.len() < max {
            let de = match vnode.read_dirent(off) {
                Ok(de) => de,
                Err(err) => {
                    cookie.off = 0;
                    return Err(err);
                }
            };
            if !de.is_free() && de.name != ".." {
                entries.push(DirEntry {
                    inode: de.ino as u64,
                    ty: de.ty,
                    name: de.name.clone(),
                });
            }
            off += de.reclen_at(off);
        }

        cookie.off = off;
        cookie.seqno = vnode.inode.seq_num;
        Ok(entries)
    }

    pub(crate) fn set_remote(&mut self, dir: u32, remote: bool) -> Result<()> {
        match &mut self.vnode_mut(dir).kind {
            super::VnodeKind::Directory { remote: flag } => {
                *flag = remote;
                Ok(())
            }
            super::VnodeKind::File(_) => Err(Error::NotADirectory),
        }
    }
}
