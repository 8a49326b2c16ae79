mod common;

use minfs::layout::{DiskInode, INODE_SIZE, INODES_PER_BLOCK};
use minfs::{DirEntryType, Error, Minfs, MountOptions};

use common::{BLOCK_SIZE, formatted, mount, pattern, setup, spy_formatted};

/// 二级间接块覆盖的第一个文件块
const DOUBLY_START: usize = 16 + 31 * 128;

#[test]
fn write_then_read() {
    let (_device, _fs, root) = setup();
    let file = root.create("f", DirEntryType::Regular).unwrap();
    assert_eq!(0, file.get_size());

    assert_eq!(10, file.write_at(0, b"0123456789").unwrap());
    assert_eq!(10, file.get_size());
    assert_eq!(1, file.get_block_count());

    let mut buf = [0; 10];
    assert_eq!(10, file.read_at(0, &mut buf).unwrap());
    assert_eq!(b"0123456789", &buf);

    let mut tail = [0; 16];
    assert_eq!(4, file.read_at(6, &mut tail).unwrap());
    assert_eq!(b"6789", &tail[..4]);
    assert_eq!(0, file.read_at(10, &mut tail).unwrap());
}

#[test]
fn truncate_releases_blocks() {
    let (_device, fs, root) = setup();
    let file = root.create("f", DirEntryType::Regular).unwrap();
    let data = pattern(8192, 7);
    file.write_at(0, &data).unwrap();
    assert_eq!(16, file.get_block_count());
    let used = fs.lock().info().used_blocks;

    file.truncate(100).unwrap();
    assert_eq!(100, file.get_size());
    assert_eq!(1, file.get_block_count());
    assert_eq!(used - 15, fs.lock().info().used_blocks);

    let mut buf = vec![0; 512];
    assert_eq!(0, file.read_at(100, &mut buf).unwrap());
    assert_eq!(100, file.read_at(0, &mut buf).unwrap());
    assert_eq!(&data[..100], &buf[..100]);

    // 重新变长的部分读出来是零
    file.set_size(1000).unwrap();
    assert_eq!(1000, file.get_size());
    assert_eq!(512, file.read_at(0, &mut buf).unwrap());
    assert_eq!(&data[..100], &buf[..100]);
    assert!(buf[100..].iter().all(|&b| b == 0));
    assert_eq!(1, file.get_block_count());
}

#[test]
fn truncate_on_block_boundary() {
    let (_device, _fs, root) = setup();
    let file = root.create("f", DirEntryType::Regular).unwrap();
    file.write_at(0, &pattern(4 * BLOCK_SIZE, 1)).unwrap();

    file.truncate(2 * BLOCK_SIZE).unwrap();
    assert_eq!(2, file.get_block_count());
    file.truncate(0).unwrap();
    assert_eq!(0, file.get_size());
    assert_eq!(0, file.get_block_count());
}

#[test]
fn indirect_mapping() {
    let (_device, _fs, root) = setup();
    let file = root.create("f", DirEntryType::Regular).unwrap();
    let data = pattern(40 * BLOCK_SIZE, 3);
    assert_eq!(data.len(), file.write_at(0, &data).unwrap());
    // 40 个数据块与一个一级间接块
    assert_eq!(41, file.get_block_count());

    let mut buf = vec![0; data.len()];
    assert_eq!(data.len(), file.read_at(0, &mut buf).unwrap());
    assert_eq!(data, buf);

    file.truncate(16 * BLOCK_SIZE).unwrap();
    assert_eq!(16, file.get_block_count());
}

#[test]
fn sparse_doubly_indirect_write() {
    let (_device, _fs, root) = setup();
    let file = root.create("sparse", DirEntryType::Regular).unwrap();
    file.write_at(0, b"head").unwrap();
    assert_eq!(1, file.get_block_count());

    let offset = DOUBLY_START * BLOCK_SIZE + 5;
    file.write_at(offset, b"far").unwrap();
    // 数据块、二级间接块与其一个子块
    assert_eq!(1 + 3, file.get_block_count());
    assert_eq!(offset + 3, file.get_size());

    let mut buf = [0xff; 8];
    assert_eq!(8, file.read_at(offset - 5, &mut buf).unwrap());
    assert_eq!(&[0, 0, 0, 0, 0, b'f', b'a', b'r'], &buf);
    // 空洞读出零
    assert_eq!(8, file.read_at(BLOCK_SIZE * 100, &mut buf).unwrap());
    assert_eq!([0; 8], buf);

    file.truncate(4).unwrap();
    assert_eq!(1, file.get_block_count());
}

#[test]
fn overwrite_copies_on_write() {
    let (_device, fs, root) = setup();
    let file = root.create("f", DirEntryType::Regular).unwrap();
    file.write_at(0, &pattern(3 * BLOCK_SIZE, 0)).unwrap();
    let used = fs.lock().info().used_blocks;

    file.write_at(BLOCK_SIZE + 10, b"patched").unwrap();
    // 旧块在提交时释放，总量不变
    assert_eq!(3, file.get_block_count());
    assert_eq!(used, fs.lock().info().used_blocks);
    assert_eq!(3 * BLOCK_SIZE, file.get_size());

    let mut buf = [0; 7];
    file.read_at(BLOCK_SIZE + 10, &mut buf).unwrap();
    assert_eq!(b"patched", &buf);
}

#[test]
fn append_moves_end() {
    let (_device, _fs, root) = setup();
    let file = root.create("log", DirEntryType::Regular).unwrap();
    assert_eq!((5, 5), file.append(b"first").unwrap());
    assert_eq!((11, 6), file.append(b"second").unwrap());

    let mut buf = [0; 11];
    file.read_at(0, &mut buf).unwrap();
    assert_eq!(b"firstsecond", &buf);
    assert_eq!(11, file.stat().size);
}

#[test]
fn large_write_spans_batches() {
    let device = formatted(Default::default());
    // 每批最多换入 8 块
    let options = MountOptions {
        writeback_capacity: 16,
        ..MountOptions::default()
    };
    let fs = Minfs::mount(device.clone(), options).unwrap();
    let root = Minfs::root(&fs).unwrap();
    let file = root.create("big", DirEntryType::Regular).unwrap();

    let data = pattern(300 * BLOCK_SIZE, 9);
    assert_eq!(data.len(), file.write_at(0, &data).unwrap());
    // 三个一级间接块
    assert_eq!(303, file.get_block_count());
    assert_eq!(data.len(), file.get_size());
    drop(file);
    drop(root);

    // 重新挂载后从磁盘读回
    let fs = mount(&device);
    let root = Minfs::root(&fs).unwrap();
    let file = root.lookup("big").unwrap();
    assert_eq!(data.len(), file.get_size());
    let mut buf = vec![0; data.len()];
    file.read_at(0, &mut buf).unwrap();
    assert_eq!(data, buf);
}

#[test]
fn each_batch_advances_size_on_disk() {
    let (spy, device) = spy_formatted();
    let options = MountOptions {
        writeback_capacity: 16,
        ..MountOptions::default()
    };
    let fs = Minfs::mount(device, options).unwrap();
    let root = Minfs::root(&fs).unwrap();
    let file = root.create("big", DirEntryType::Regular).unwrap();

    let ino = file.ino() as usize;
    let table_block = fs.lock().superblock().ino_block as usize + ino / INODES_PER_BLOCK;
    let record = ino % INODES_PER_BLOCK * INODE_SIZE;
    spy.reset();
    file.write_at(0, &pattern(30 * BLOCK_SIZE, 3)).unwrap();

    let mut sizes: Vec<u32> = spy
        .take_writes()
        .into_iter()
        .filter(|(block, _)| *block == table_block)
        .map(|(_, bytes)| {
            bytemuck::pod_read_unaligned::<DiskInode>(&bytes[record..record + INODE_SIZE]).size
        })
        .collect();
    sizes.dedup();
    // 每批 8 块，最后一批只剩 6 块
    assert_eq!(vec![4096, 8192, 12288, 15360], sizes);
}

#[test]
fn file_contents_load_on_demand() {
    let (spy, device) = spy_formatted();
    let fs = mount(&device);
    let root = Minfs::root(&fs).unwrap();
    let data = pattern(400 * BLOCK_SIZE, 4);
    let file = root.create("big", DirEntryType::Regular).unwrap();
    file.write_at(0, &data).unwrap();
    drop(file);

    let file = root.lookup("big").unwrap();
    spy.reset();
    let mut buf = [0; 16];
    let off = 200 * BLOCK_SIZE + 7;
    assert_eq!(16, file.read_at(off, &mut buf).unwrap());
    assert_eq!(&data[off..off + 16], &buf);
    assert_eq!(1, spy.reads());
    file.read_at(off, &mut buf).unwrap();
    assert_eq!(1, spy.reads());

    // 改写块中间时只读入这一块
    file.write_at(300 * BLOCK_SIZE + 100, b"patch").unwrap();
    assert_eq!(2, spy.reads());
    let mut block = vec![0; BLOCK_SIZE];
    file.read_at(300 * BLOCK_SIZE, &mut block).unwrap();
    assert_eq!(&data[300 * BLOCK_SIZE..300 * BLOCK_SIZE + 100], &block[..100]);
    assert_eq!(b"patch", &block[100..105]);
    assert_eq!(&data[300 * BLOCK_SIZE + 105..301 * BLOCK_SIZE], &block[105..]);
    drop(file);

    // 回收只需要三个一级间接块，不读文件内容
    spy.reset();
    root.unlink("big", false).unwrap();
    assert_eq!(3, spy.reads());
}

#[test]
fn truncate_keeps_unloaded_head() {
    let device = formatted(Default::default());
    let data = pattern(8 * BLOCK_SIZE, 6);
    {
        let fs = mount(&device);
        let root = Minfs::root(&fs).unwrap();
        let file = root.create("f", DirEntryType::Regular).unwrap();
        file.write_at(0, &data).unwrap();
    }

    let fs = mount(&device);
    let root = Minfs::root(&fs).unwrap();
    let file = root.lookup("f").unwrap();
    file.truncate(3 * BLOCK_SIZE + 10).unwrap();
    file.truncate(5 * BLOCK_SIZE).unwrap();

    let mut buf = vec![0; 5 * BLOCK_SIZE];
    assert_eq!(buf.len(), file.read_at(0, &mut buf).unwrap());
    let kept = 3 * BLOCK_SIZE + 10;
    assert_eq!(&data[..kept], &buf[..kept]);
    assert!(buf[kept..].iter().all(|&b| b == 0));
}

#[test]
fn write_limits() {
    let (_device, fs, root) = setup();
    let file = root.create("f", DirEntryType::Regular).unwrap();
    let max_size = (DOUBLY_START + 128 * 128) * BLOCK_SIZE;
    assert_eq!(
        Error::FileTooLarge,
        file.write_at(max_size, b"x").unwrap_err()
    );
    assert_eq!(Error::FileTooLarge, file.truncate(max_size + 1).unwrap_err());

    // 超出数据区的写入在预留时失败，不留下任何分配
    let before = fs.lock().info();
    let huge = vec![0xab; (before.total_blocks + 1) * BLOCK_SIZE];
    assert_eq!(Error::NoSpace, file.write_at(0, &huge).unwrap_err());
    assert_eq!(before.used_blocks, fs.lock().info().used_blocks);
    assert_eq!(0, file.get_block_count());
    assert_eq!(Ok(0), file.write_at(0, b""));
}
