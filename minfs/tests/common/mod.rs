#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use block_dev::RamDisk;
use minfs::layout::DIRENT_HEADER_SIZE;
use minfs::{BlockDevice, FormatOptions, Minfs, MountOptions, Vnode};
use spin::Mutex;

pub const DISK_BLOCKS: usize = 4096;
pub const BLOCK_SIZE: usize = 512;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn disk() -> Arc<dyn BlockDevice> {
    Arc::new(RamDisk::new(DISK_BLOCKS, BLOCK_SIZE))
}

pub fn formatted(options: FormatOptions) -> Arc<dyn BlockDevice> {
    init_logger();
    let device = disk();
    minfs::format(&device, options).unwrap();
    device
}

pub fn mount(device: &Arc<dyn BlockDevice>) -> Arc<Mutex<Minfs>> {
    Minfs::mount(Arc::clone(device), MountOptions::default()).unwrap()
}

/// 默认参数格式化并挂载，返回文件系统与根目录
pub fn setup() -> (Arc<dyn BlockDevice>, Arc<Mutex<Minfs>>, Vnode) {
    let device = formatted(FormatOptions::default());
    let fs = mount(&device);
    let root = Minfs::root(&fs).unwrap();
    (device, fs, root)
}

/// 可辨认的内容，第 i 个字节随块号与块内偏移变化
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i / BLOCK_SIZE) as u8).wrapping_mul(31) ^ (i as u8) ^ seed)
        .collect()
}

pub fn names(dir: &Vnode) -> Vec<String> {
    let mut cookie = Default::default();
    let mut names = Vec::new();
    loop {
        let entries = dir.readdir(&mut cookie, 4).unwrap();
        if entries.is_empty() {
            break;
        }
        names.extend(entries.into_iter().map(|entry| entry.name));
    }
    names
}

/// 记录读次数与每次写入内容的内存盘
pub struct SpyDisk {
    disk: RamDisk,
    reads: AtomicUsize,
    writes: Mutex<Vec<(usize, Vec<u8>)>>,
}

impl SpyDisk {
    pub fn new() -> Self {
        Self {
            disk: RamDisk::new(DISK_BLOCKS, BLOCK_SIZE),
            reads: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// 取走迄今为止的写入，按发生顺序
    pub fn take_writes(&self) -> Vec<(usize, Vec<u8>)> {
        std::mem::take(&mut *self.writes.lock())
    }

    pub fn reset(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.writes.lock().clear();
    }
}

impl BlockDevice for SpyDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.disk.read_block(block_id, buf);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        self.writes.lock().push((block_id, buf.to_vec()));
        self.disk.write_block(block_id, buf);
    }

    fn block_size(&self) -> usize {
        self.disk.block_size()
    }

    fn block_count(&self) -> usize {
        self.disk.block_count()
    }
}

/// 格式化一块 [`SpyDisk`]，返回它本身与作为设备的同一引用
pub fn spy_formatted() -> (Arc<SpyDisk>, Arc<dyn BlockDevice>) {
    init_logger();
    let spy = Arc::new(SpyDisk::new());
    let device: Arc<dyn BlockDevice> = spy.clone();
    minfs::format(&device, FormatOptions::default()).unwrap();
    (spy, device)
}

/// 在盘上找到名为 `name` 的目录项，把它的记录长度改成放不下头部的值
pub fn corrupt_dirent(device: &Arc<dyn BlockDevice>, name: &str) {
    let mut buf = vec![0; BLOCK_SIZE];
    for block in 0..device.block_count() {
        device.read_block(block, &mut buf);
        let Some(pos) = buf.windows(name.len()).position(|w| w == name.as_bytes()) else {
            continue;
        };
        // 头部依次是 inode 编号与记录长度，各 4 字节
        let header = pos - DIRENT_HEADER_SIZE;
        buf[header + 4..header + 8].copy_from_slice(&3u32.to_le_bytes());
        device.write_block(block, &buf);
        return;
    }
    panic!("no dirent named {name:?} on the device");
}
