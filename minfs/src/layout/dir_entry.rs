//! 目录项
//!
//! 目录数据由变长记录紧密拼接而成，记录长度按 4 字节对齐。
//! 磁盘上 `reclen` 的最高位标记最后一条记录；最后一条记录的有效长度
//! 延伸到目录的最大尺寸，因此目录尾部的空闲空间是虚拟的。

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::mem;

use bytemuck::{Pod, Zeroable};
use vfs::{DirEntryType, Error};

use super::BLOCK_SIZE;
use crate::Result;

pub const DIRENT_HEADER_SIZE: usize = mem::size_of::<RawHeader>();
pub const NAME_MAX: usize = 255;
pub const MAX_DIRENT_SIZE: usize = dirent_size(NAME_MAX);
pub const MAX_DIRECTORY_SIZE: usize = 128 * BLOCK_SIZE;

const RECLEN_LAST: u32 = 0x8000_0000;
const RECLEN_MASK: u32 = 0x0fff_ffff;

const TYPE_DIR: u8 = 4;
const TYPE_FILE: u8 = 8;

/// 名字长度为 `namelen` 的目录项所占字节数
#[inline]
pub const fn dirent_size(namelen: usize) -> usize {
    (DIRENT_HEADER_SIZE + namelen + 3) & !3
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
struct RawHeader {
    ino: u32,
    reclen: u32,
    namelen: u8,
    ty: u8,
}

/// 内存中的目录项，`ino` 为 0 表示空闲记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub ino: u32,
    pub reclen: u32,
    pub is_last: bool,
    pub ty: DirEntryType,
    pub name: String,
}

impl Dirent {
    pub fn new(ino: u32, ty: DirEntryType, name: &str) -> Self {
        Self {
            ino,
            reclen: dirent_size(name.len()) as u32,
            is_last: false,
            ty,
            name: String::from(name),
        }
    }

    pub fn free(reclen: u32, is_last: bool) -> Self {
        Self {
            ino: 0,
            reclen,
            is_last,
            ty: DirEntryType::default(),
            name: String::new(),
        }
    }

    /// 新目录的 `.` 与 `..`
    pub fn dots(ino: u32, parent: u32) -> [Self; 2] {
        let dot = Self::new(ino, DirEntryType::Directory, ".");
        let mut dotdot = Self::new(parent, DirEntryType::Directory, "..");
        dotdot.is_last = true;
        [dot, dotdot]
    }

    pub fn is_free(&self) -> bool {
        self.ino == 0
    }

    /// 记录内容实际占用的字节数
    pub fn size(&self) -> usize {
        dirent_size(self.name.len())
    }

    /// 位于目录偏移 `off` 处时的有效记录长度
    pub fn reclen_at(&self, off: usize) -> usize {
        if self.is_last {
            MAX_DIRECTORY_SIZE - off
        } else {
            (self.reclen & RECLEN_MASK) as usize
        }
    }

    /// 写回时的字节表示；空闲记录只写头部
    pub fn encode(&self) -> Vec<u8> {
        let len = if self.is_free() {
            DIRENT_HEADER_SIZE
        } else {
            self.size()
        };
        let header = RawHeader {
            ino: self.ino,
            reclen: (self.reclen & RECLEN_MASK) | if self.is_last { RECLEN_LAST } else { 0 },
            namelen: self.name.len() as u8,
            ty: match self.ty {
                _ if self.is_free() => 0,
                DirEntryType::Directory => TYPE_DIR,
                DirEntryType::Regular => TYPE_FILE,
            },
        };

        let mut bytes = vec![0; len];
        bytes[..DIRENT_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        bytes[DIRENT_HEADER_SIZE..DIRENT_HEADER_SIZE + self.name.len()]
            .copy_from_slice(self.name.as_bytes());
        bytes
    }

    /// 解析并校验位于目录偏移 `off` 处的记录
    ///
    /// `bytes` 是从 `off` 起读到的全部内容，可能短于最大记录长度。
    pub fn decode(bytes: &[u8], off: usize) -> Result<Self> {
        if bytes.len() < DIRENT_HEADER_SIZE {
            log::error!("dirent at {off}: only {} bytes readable", bytes.len());
            return Err(Error::Io);
        }
        let raw: RawHeader = bytemuck::pod_read_unaligned(&bytes[..DIRENT_HEADER_SIZE]);
        let (ino, raw_reclen, namelen, raw_ty) = (raw.ino, raw.reclen, raw.namelen, raw.ty);

        let mut de = Self::free(raw_reclen & RECLEN_MASK, raw_reclen & RECLEN_LAST != 0);
        let reclen = de.reclen_at(off);
        if reclen < DIRENT_HEADER_SIZE || reclen % 4 != 0 {
            log::error!("dirent at {off}: bad record length {reclen}");
            return Err(Error::Io);
        }
        if ino == 0 {
            return Ok(de);
        }

        let namelen = namelen as usize;
        if namelen == 0
            || dirent_size(namelen) > reclen
            || DIRENT_HEADER_SIZE + namelen > bytes.len()
        {
            log::error!("dirent at {off}: name length {namelen} out of record bounds");
            return Err(Error::Io);
        }
        de.ty = match raw_ty {
            TYPE_DIR => DirEntryType::Directory,
            TYPE_FILE => DirEntryType::Regular,
            other => {
                log::error!("dirent at {off}: unknown type {other}");
                return Err(Error::Io);
            }
        };
        let name = &bytes[DIRENT_HEADER_SIZE..DIRENT_HEADER_SIZE + namelen];
        de.name = String::from(core::str::from_utf8(name).map_err(|_| {
            log::error!("dirent at {off}: name is not valid UTF-8");
            Error::Io
        })?);
        de.ino = ino;

        Ok(de)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(10, DIRENT_HEADER_SIZE);
        assert_eq!(12, dirent_size(1));
        assert_eq!(12, dirent_size(2));
        assert_eq!(16, dirent_size(3));
        assert_eq!(268, MAX_DIRENT_SIZE);
    }

    #[test]
    fn last_record_spans_to_directory_end() {
        let [dot, dotdot] = Dirent::dots(5, 1);
        assert_eq!(12, dot.reclen_at(0));
        assert_eq!(MAX_DIRECTORY_SIZE - 12, dotdot.reclen_at(12));

        let bytes = dotdot.encode();
        assert_eq!(12, bytes.len());
        let decoded = Dirent::decode(&bytes, 12).unwrap();
        assert_eq!(dotdot, decoded);
    }

    #[test]
    fn free_record_keeps_length() {
        let free = Dirent::free(40, false);
        let bytes = free.encode();
        assert_eq!(DIRENT_HEADER_SIZE, bytes.len());
        let decoded = Dirent::decode(&bytes, 24).unwrap();
        assert!(decoded.is_free());
        assert_eq!(40, decoded.reclen_at(24));
    }

    #[test]
    fn rejects_malformed() {
        let mut bytes = Dirent::new(3, DirEntryType::Regular, "file").encode();
        // 记录长度不足以容纳名字
        bytes[4] = 12;
        assert_eq!(Err(Error::Io), Dirent::decode(&bytes, 0));

        let mut bytes = Dirent::new(3, DirEntryType::Regular, "file").encode();
        bytes[4] = 17;
        assert_eq!(Err(Error::Io), Dirent::decode(&bytes, 0));

        let bytes = Dirent::new(3, DirEntryType::Regular, "file").encode();
        assert_eq!(Err(Error::Io), Dirent::decode(&bytes[..12], 0));
        assert_eq!(Err(Error::Io), Dirent::decode(&bytes[..6], 0));
    }
}
