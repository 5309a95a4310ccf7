use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};

use lib_blockbuf::{
    AlignedBuffer, BlockDevice, BufferedProxy, Config, FileDevice, Flags, MemoryDevice, OpenMode,
};
use tempfile::TempDir;

const BLOCK: usize = 512;
const WINDOW: usize = 4096;

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn geometry() -> Config {
    Config { block_size: BLOCK, sector_align: BLOCK, ..Config::default() }
}

/// Records every transfer the proxy issues, with the memory address it used.
struct Recorder {
    inner: MemoryDevice,
    transfers: Vec<(usize, u64, usize)>,
}

impl Recorder {
    fn new(inner: MemoryDevice) -> Self {
        Self { inner, transfers: Vec::new() }
    }
}

impl BlockDevice for Recorder {
    fn read(&mut self, dst: &mut [u8], blocks: usize) -> usize {
        self.transfers.push((dst.as_ptr() as usize, self.inner.position(), blocks));
        self.inner.read(dst, blocks)
    }

    fn write(&mut self, src: &[u8], blocks: usize) -> usize {
        self.transfers.push((src.as_ptr() as usize, self.inner.position(), blocks));
        self.inner.write(src, blocks)
    }

    fn seek(&mut self, block: u64) -> u64 {
        self.inner.seek(block)
    }
}

#[test]
fn test_write_then_read_back_across_windows() {
    let data = pattern(10_000, 7);
    let mut dev = MemoryDevice::new(32, BLOCK);

    {
        let mut proxy = BufferedProxy::with_capacity(WINDOW, &mut dev, geometry()).unwrap();
        assert_eq!(proxy.write(&data), 10_000);
        assert_eq!(proxy.position(), 10_000);

        assert_eq!(proxy.seek(0), 0);
        let mut out = vec![0; 10_000];
        assert_eq!(proxy.read(&mut out), 10_000);
        assert_eq!(out, data);

        let stats = proxy.stats();
        assert_eq!(stats.direct_writes, 1);
        assert_eq!(stats.direct_reads, 1);
    }

    assert_eq!(&dev.as_bytes()[..10_000], &data[..]);
    assert!(dev.as_bytes()[10_000..].iter().all(|&b| b == 0));
}

#[test]
fn test_small_writes_preserve_neighbours() {
    let original = pattern(16 * BLOCK, 1);
    let mut dev = MemoryDevice::from_bytes(original.clone(), BLOCK);

    {
        let mut proxy = BufferedProxy::with_capacity(WINDOW, &mut dev, geometry()).unwrap();
        proxy.seek(100);
        proxy.write(b"foo");
        proxy.seek(5000);
        proxy.write(b"bar");
        proxy.close().unwrap();
    }

    let mut expected = original;
    expected[100..103].copy_from_slice(b"foo");
    expected[5000..5003].copy_from_slice(b"bar");
    assert_eq!(dev.as_bytes(), &expected[..]);
}

#[test]
fn test_sequential_small_reads_fill_once_per_window() {
    let data = pattern(16 * BLOCK, 3);
    let mut dev = MemoryDevice::from_bytes(data.clone(), BLOCK);
    let mut proxy = BufferedProxy::with_capacity(WINDOW, &mut dev, geometry()).unwrap();

    let mut out = Vec::new();
    let mut chunk = [0; 100];
    loop {
        let n = proxy.read(&mut chunk);
        if n == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n]);
    }

    assert_eq!(out, data);
    // Two windows of data, plus the fill that finds the end.
    assert_eq!(proxy.stats().fills, 3);
}

#[test]
fn test_no_fills_write_through() {
    let mut dev = MemoryDevice::new(WINDOW, 1);
    let config = Config { flags: Flags::NO_FILLS, ..Config::default() };

    {
        let mut proxy = BufferedProxy::with_capacity(WINDOW, &mut dev, config).unwrap();
        let data = pattern(100, 9);
        assert_eq!(proxy.write(&data), 100);
        assert_eq!(proxy.seek(0), 0);

        let mut out = [0; 100];
        assert_eq!(proxy.read(&mut out), 100);
        assert_eq!(&out[..], &data[..]);

        let stats = proxy.stats();
        assert_eq!(stats.fills, 0);
        assert_eq!(stats.blocks_read, 0);
    }

    assert_eq!(&dev.as_bytes()[..100], &pattern(100, 9)[..]);
}

#[test]
fn test_random_ops_match_flat_model() {
    const CAPACITY: usize = 64 * BLOCK;

    let configs = [
        geometry(),
        Config { flags: Flags::NO_DIRECT_IO, ..geometry() },
        Config { sector_align: 2048, ..geometry() },
        Config::default(),
    ];

    for (round, config) in configs.into_iter().enumerate() {
        let mut rng = fastrand::Rng::with_seed(0xB10C + round as u64);
        let initial = pattern(CAPACITY, round as u8);
        let mut model = initial.clone();
        let mut dev = MemoryDevice::from_bytes(initial, config.block_size);
        let mut proxy = BufferedProxy::with_capacity(WINDOW, &mut dev, config).unwrap();
        let mut pos = 0usize;

        for step in 0..2_000 {
            match rng.u8(0..3) {
                0 => {
                    pos = rng.usize(0..CAPACITY);
                    assert_eq!(proxy.seek(pos as u64), pos as u64);
                }
                1 => {
                    let len = rng.usize(0..=(CAPACITY - pos).min(3 * WINDOW));
                    let src = pattern(len, rng.u8(..));
                    assert_eq!(proxy.write(&src), len, "round {round} step {step}");
                    model[pos..pos + len].copy_from_slice(&src);
                    pos += len;
                }
                _ => {
                    let len = rng.usize(0..=(CAPACITY - pos).min(3 * WINDOW));
                    let mut dst = vec![0; len];
                    assert_eq!(proxy.read(&mut dst), len, "round {round} step {step}");
                    assert_eq!(dst, model[pos..pos + len], "round {round} step {step}");
                    pos += len;
                }
            }
            assert_eq!(proxy.position(), pos as u64, "round {round} step {step}");
        }

        proxy.close().unwrap();
        assert_eq!(dev.as_bytes(), &model[..], "round {round}");
    }
}

#[test]
fn test_device_transfers_stay_aligned() {
    const ALIGN: usize = 4096;
    const CAPACITY: usize = 64 * BLOCK;

    let config = Config {
        block_size: BLOCK,
        sector_align: ALIGN,
        buffer_align: ALIGN,
        flags: Flags::empty(),
    };
    let mut dev = Recorder::new(MemoryDevice::new(64, BLOCK));
    let mut rng = fastrand::Rng::with_seed(42);

    {
        let mut proxy = BufferedProxy::with_capacity(2 * ALIGN, &mut dev, config).unwrap();
        let mut scratch = AlignedBuffer::new(3 * ALIGN + 1, ALIGN).unwrap();

        for _ in 0..1_000 {
            let offset = if rng.bool() { 0 } else { 1 };
            let pos = rng.usize(0..CAPACITY);
            let len = rng.usize(0..=(CAPACITY - pos).min(3 * ALIGN));
            let buf = &mut scratch.as_mut_slice()[offset..offset + len];

            proxy.seek(pos as u64);
            if rng.bool() {
                proxy.write(buf);
            } else {
                proxy.read(buf);
            }
        }
    }

    assert!(!dev.transfers.is_empty());
    for &(addr, block, _) in &dev.transfers {
        assert_eq!(addr % ALIGN, 0, "transfer from unaligned memory {addr:#x}");
        assert_eq!(block as usize * BLOCK % ALIGN, 0, "transfer at unaligned block {block}");
    }
}

#[test]
fn test_file_device_roundtrip_through_proxy() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("disk.img");
    let data = pattern(10_000, 5);

    {
        let dev = FileDevice::open(&path, BLOCK, OpenMode::Create, false).unwrap();
        let mut proxy = BufferedProxy::with_capacity(WINDOW, dev, geometry()).unwrap();
        assert_eq!(proxy.write(&data), 10_000);
        proxy.close().unwrap();
    }

    let bytes = fs::read(&path).unwrap();
    assert_eq!(bytes.len(), 20 * BLOCK);
    assert_eq!(&bytes[..10_000], &data[..]);

    let dev = FileDevice::open(&path, BLOCK, OpenMode::Read, false).unwrap();
    let mut proxy = BufferedProxy::with_capacity(WINDOW, dev, geometry()).unwrap();
    proxy.seek(1234);
    let mut out = vec![0; 5000];
    assert_eq!(proxy.read(&mut out), 5000);
    assert_eq!(&out[..], &data[1234..6234]);
}

#[test]
fn test_file_device_reads_unaligned_tail() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tail.bin");
    let data = pattern(1000, 2);
    fs::write(&path, &data).unwrap();

    let dev = FileDevice::open(&path, BLOCK, OpenMode::Read, false).unwrap();
    let mut proxy = BufferedProxy::with_capacity(WINDOW, dev, geometry()).unwrap();

    let mut out = vec![0; 2000];
    assert_eq!(proxy.read(&mut out), 1024);
    assert_eq!(&out[..1000], &data[..]);
    assert!(out[1000..1024].iter().all(|&b| b == 0));
}

#[test]
fn test_write_past_end_of_file_zeroes_rest_of_block() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("disk.img");
    fs::write(&path, vec![b'A'; 9 * BLOCK]).unwrap();

    let dev = FileDevice::open(&path, BLOCK, OpenMode::ReadWrite, false).unwrap();
    let mut proxy = BufferedProxy::with_capacity(WINDOW, dev, geometry()).unwrap();

    // The first window leaves its bytes behind in memory.
    assert_eq!(proxy.seek(0), 0);
    assert_eq!(proxy.seek(10 * BLOCK as u64), 10 * BLOCK as u64);
    assert_eq!(proxy.write(b"Z"), 1);
    proxy.close().unwrap();

    let bytes = fs::read(&path).unwrap();
    assert_eq!(bytes.len(), 11 * BLOCK);
    assert!(bytes[..9 * BLOCK].iter().all(|&b| b == b'A'));
    assert!(bytes[9 * BLOCK..10 * BLOCK].iter().all(|&b| b == 0));
    assert_eq!(bytes[10 * BLOCK], b'Z');
    assert!(bytes[10 * BLOCK + 1..].iter().all(|&b| b == 0));
}

#[test]
fn test_std_io_traits() {
    let mut dev = MemoryDevice::new(32, BLOCK);

    {
        let mut proxy = BufferedProxy::with_capacity(WINDOW, &mut dev, geometry()).unwrap();
        proxy.write_all(b"hello, ").unwrap();
        write!(proxy, "block {}", 42).unwrap();
        Write::flush(&mut proxy).unwrap();

        Seek::seek(&mut proxy, SeekFrom::Start(7)).unwrap();
        let mut word = [0; 5];
        proxy.read_exact(&mut word).unwrap();
        assert_eq!(&word, b"block");

        Seek::rewind(&mut proxy).unwrap();
        let mut src = io::Cursor::new(pattern(9000, 4));
        Seek::seek(&mut proxy, SeekFrom::Start(3 * BLOCK as u64)).unwrap();
        assert_eq!(io::copy(&mut src, &mut proxy).unwrap(), 9000);
    }

    assert_eq!(&dev.as_bytes()[..15], b"hello, block 42");
    assert_eq!(&dev.as_bytes()[3 * BLOCK..3 * BLOCK + 9000], &pattern(9000, 4)[..]);
}
