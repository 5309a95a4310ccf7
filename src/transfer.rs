//! File-to-file copies and hex dumps through the buffering engine.
//!
//! Both operations open their files as [`FileDevice`]s, so every byte moves through a
//! [`BufferedProxy`] with the configured geometry. With `o_direct` set this is a working example
//! of byte-granular access to files opened with `O_DIRECT`.

use std::fmt;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use lib_blockbuf::{
    AlignedBuffer, BufferedProxy, FileDevice, Flags, OpenMode, ProxyStats, map_err, proxy,
};

use crate::config::AppConfig;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Proxy(proxy::Error),
    Open { path: PathBuf, source: io::Error },
    ShortWrite { offset: u64 },
}

map_err!(Io, io::Error);
map_err!(Proxy, proxy::Error);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => e.fmt(f),
            Self::Proxy(e) => e.fmt(f),
            Self::Open { path, source } => write!(f, "failed to open {}: {source}", path.display()),
            Self::ShortWrite { offset } => write!(f, "output refused data at byte {offset}"),
        }
    }
}

impl std::error::Error for Error {}

pub struct CopyOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Bytes skipped at the start of the input.
    pub skip: u64,
    /// Bytes skipped at the start of the output.
    pub seek: u64,
    pub count: Option<u64>,
}

#[derive(Debug)]
pub struct CopyReport {
    pub bytes: u64,
    pub input: ProxyStats,
    pub output: ProxyStats,
}

fn open(path: &Path, config: &AppConfig, mode: OpenMode) -> Result<FileDevice, Error> {
    FileDevice::open(path, config.geometry.block_size, mode, config.io.o_direct)
        .map_err(|source| Error::Open { path: path.to_path_buf(), source })
}

/// Copies `count` bytes (or everything after `skip`) from `input` to `output`.
///
/// The output keeps whatever precedes `seek` and is truncated right after the copied range.
pub fn run_copy(config: &AppConfig, options: &CopyOptions) -> Result<CopyReport, Error> {
    let block_size = config.geometry.block_size;
    let buffer_size = config.geometry.buffer_size;

    let input = open(&options.input, config, OpenMode::Read)?;
    // The last block of a file is padded with zeros on read; never copy past the real end.
    let available = input.len()?.saturating_sub(options.skip);
    let limit = options.count.map_or(available, |count| count.min(available));

    let mode = if options.output.exists() { OpenMode::ReadWrite } else { OpenMode::Create };
    let mut output = open(&options.output, config, mode)?;

    let mut reader =
        BufferedProxy::with_capacity(buffer_size, input, config.proxy_config(Flags::READ_ONLY))?;
    let mut writer = BufferedProxy::with_capacity(
        buffer_size,
        &mut output,
        config.proxy_config(Flags::WRITE_ONLY),
    )?;

    reader.seek(options.skip);
    writer.seek(options.seek);

    let mut chunk = AlignedBuffer::new(config.io.chunk_size, config.geometry.buffer_align)
        .map_err(proxy::Error::from)?;
    let mut copied = 0u64;

    while copied < limit {
        let want = usize::try_from(limit - copied).unwrap_or(usize::MAX).min(chunk.len());
        let read = reader.read(&mut chunk.as_mut_slice()[..want]);
        if read == 0 {
            log::warn!("input ended early at byte {}", options.skip + copied);
            break;
        }

        let written = writer.write(&chunk.as_slice()[..read]);
        if written != read {
            return Err(Error::ShortWrite { offset: options.seek + copied + written as u64 });
        }
        copied += read as u64;
    }

    writer.flush();
    let output_stats = writer.stats();
    writer.close()?;

    output.set_len(options.seek + copied)?;
    output.sync()?;

    log::debug!("copied {copied} bytes with {block_size}-byte blocks");

    Ok(CopyReport { bytes: copied, input: reader.stats(), output: output_stats })
}

pub struct DumpOptions {
    pub file: PathBuf,
    pub offset: u64,
    pub length: u64,
}

/// Writes a hex dump of a byte range of `file` to standard output. Returns the bytes dumped.
pub fn run_dump(config: &AppConfig, options: &DumpOptions) -> Result<u64, Error> {
    let device = open(&options.file, config, OpenMode::Read)?;
    let end = options.offset.saturating_add(options.length).min(device.len()?);
    let len = end.saturating_sub(options.offset);

    let buffer_size = config.geometry.buffer_size;
    let proxy_config = config.proxy_config(Flags::READ_ONLY | Flags::RANDOM_ACCESS);
    let mut proxy = BufferedProxy::with_capacity(buffer_size, device, proxy_config)?;

    proxy.seek(options.offset);

    let stdout = io::stdout();
    let mut writer = BufWriter::new(stdout.lock());
    let mut line = [0; HEX_LINE_BYTES];
    let mut dumped = 0u64;

    while dumped < len {
        let want = usize::try_from(len - dumped).unwrap_or(usize::MAX).min(line.len());
        let read = proxy.read(&mut line[..want]);
        if read == 0 {
            break;
        }
        write_hex_line(&mut writer, options.offset + dumped, &line[..read])?;
        dumped += read as u64;
    }

    writer.flush()?;

    if dumped == 0 {
        eprintln!("Nothing to dump at offset {}", options.offset);
    }

    Ok(dumped)
}

const HEX_LINE_BYTES: usize = 16;

// `00000010  66 6f 6f 20 62 61 72 0a  00 00 00 00 00 00 00 00  |foo bar.........|`
fn write_hex_line<W: Write>(writer: &mut W, offset: u64, data: &[u8]) -> io::Result<()> {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    write!(writer, "{offset:08x} ")?;

    let mut hex = [b' '; HEX_LINE_BYTES * 3 + 1];
    for (i, &byte) in data.iter().enumerate() {
        // An extra space splits the line into two groups of eight.
        let at = i * 3 + 1 + usize::from(i >= HEX_LINE_BYTES / 2);
        hex[at] = HEX[(byte >> 4) as usize];
        hex[at + 1] = HEX[(byte & 0x0f) as usize];
    }
    writer.write_all(&hex)?;

    let mut ascii = [b'.'; HEX_LINE_BYTES];
    for (slot, &byte) in ascii.iter_mut().zip(data) {
        if byte.is_ascii_graphic() || byte == b' ' {
            *slot = byte;
        }
    }

    writer.write_all(b" |")?;
    writer.write_all(&ascii[..data.len()])?;
    writer.write_all(b"|\n")
}
