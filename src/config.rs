//! Three-layer configuration for the `blockbuf` tool.
//!
//! Values come from CLI flags, then `BLOCKBUF_*` environment variables, then a TOML file, in that
//! order of precedence. Each layer produces a [`PartialConfig`] where every field is optional; the
//! merged result becomes an [`AppConfig`] once defaults are applied and [`validate`] accepts it.
//! The TOML schema uses `deny_unknown_fields` so a misspelt key is an error rather than a silent
//! no-op.

use std::path::{Path, PathBuf};
use std::{env, fmt, fs, io};

use lib_blockbuf::{Flags, KIBI, SECTOR_SIZE, map_err};
use serde::Deserialize;

const ENV_PREFIX: &str = "BLOCKBUF_";
const CONFIG_FILE_NAME: &str = "blockbuf.toml";

const DEFAULT_BLOCK_SIZE: usize = 512;
const DEFAULT_BUFFER_SIZE: usize = 64 * KIBI;
const DEFAULT_SECTOR_ALIGN: usize = 512;
const DEFAULT_BUFFER_ALIGN: usize = SECTOR_SIZE;
const DEFAULT_CHUNK_SIZE: usize = 64 * KIBI;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Parse(toml::de::Error),
    Validation(ValidationError),
}

#[derive(Debug)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

map_err!(Io, io::Error);
map_err!(Parse, toml::de::Error);
map_err!(Validation, ValidationError);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => e.fmt(f),
            Self::Parse(e) => e.fmt(f),
            Self::Validation(e) => write!(f, "{}: {}", e.field, e.message),
        }
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlConfig {
    geometry: Option<TomlGeometryConfig>,
    io: Option<TomlIoConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlGeometryConfig {
    block_size: Option<usize>,
    buffer_size_kib: Option<usize>,
    sector_align: Option<usize>,
    buffer_align: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlIoConfig {
    direct_io: Option<bool>,
    fills: Option<bool>,
    o_direct: Option<bool>,
    chunk_size_kib: Option<usize>,
}

impl From<TomlConfig> for PartialConfig {
    fn from(toml: TomlConfig) -> Self {
        let mut config = Self::default();

        if let Some(geometry) = toml.geometry {
            config.block_size = geometry.block_size;
            config.buffer_size = geometry.buffer_size_kib.map(|v| v * KIBI);
            config.sector_align = geometry.sector_align;
            config.buffer_align = geometry.buffer_align;
        }

        if let Some(io) = toml.io {
            config.direct_io = io.direct_io;
            config.fills = io.fills;
            config.o_direct = io.o_direct;
            config.chunk_size = io.chunk_size_kib.map(|v| v * KIBI);
        }

        config
    }
}

#[derive(Debug, Clone)]
pub struct GeometryConfig {
    pub block_size: usize,
    pub buffer_size: usize,
    pub sector_align: usize,
    pub buffer_align: usize,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            sector_align: DEFAULT_SECTOR_ALIGN,
            buffer_align: DEFAULT_BUFFER_ALIGN,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IoConfig {
    /// Large aligned transfers may bypass the window.
    pub direct_io: bool,
    /// The window is loaded from the device before partial updates.
    pub fills: bool,
    /// Open files with `O_DIRECT` (Linux only).
    pub o_direct: bool,
    pub chunk_size: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self { direct_io: true, fills: true, o_direct: false, chunk_size: DEFAULT_CHUNK_SIZE }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub geometry: GeometryConfig,
    pub io: IoConfig,
}

impl AppConfig {
    /// Engine configuration for this geometry, with `extra` added to the flags implied by the
    /// I/O settings.
    pub fn proxy_config(&self, extra: Flags) -> lib_blockbuf::Config {
        let mut flags = extra;
        flags.set(Flags::NO_DIRECT_IO, !self.io.direct_io);
        flags.set(Flags::NO_FILLS, !self.io.fills);

        lib_blockbuf::Config {
            block_size: self.geometry.block_size,
            sector_align: self.geometry.sector_align,
            buffer_align: self.geometry.buffer_align,
            flags,
        }
    }
}

#[derive(Debug, Default)]
pub struct PartialConfig {
    pub config_file: Option<PathBuf>,
    pub block_size: Option<usize>,
    pub buffer_size: Option<usize>,
    pub sector_align: Option<usize>,
    pub buffer_align: Option<usize>,
    pub direct_io: Option<bool>,
    pub fills: Option<bool>,
    pub o_direct: Option<bool>,
    pub chunk_size: Option<usize>,
}

impl PartialConfig {
    fn merge_from(&mut self, other: Self) {
        if other.config_file.is_some() {
            self.config_file = other.config_file;
        }
        if other.block_size.is_some() {
            self.block_size = other.block_size;
        }
        if other.buffer_size.is_some() {
            self.buffer_size = other.buffer_size;
        }
        if other.sector_align.is_some() {
            self.sector_align = other.sector_align;
        }
        if other.buffer_align.is_some() {
            self.buffer_align = other.buffer_align;
        }
        if other.direct_io.is_some() {
            self.direct_io = other.direct_io;
        }
        if other.fills.is_some() {
            self.fills = other.fills;
        }
        if other.o_direct.is_some() {
            self.o_direct = other.o_direct;
        }
        if other.chunk_size.is_some() {
            self.chunk_size = other.chunk_size;
        }
    }

    fn into_app_config(self) -> AppConfig {
        let geometry = GeometryConfig {
            block_size: self.block_size.unwrap_or(DEFAULT_BLOCK_SIZE),
            buffer_size: self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
            sector_align: self.sector_align.unwrap_or(DEFAULT_SECTOR_ALIGN),
            buffer_align: self.buffer_align.unwrap_or(DEFAULT_BUFFER_ALIGN),
        };

        let io = IoConfig {
            direct_io: self.direct_io.unwrap_or(true),
            fills: self.fills.unwrap_or(true),
            o_direct: self.o_direct.unwrap_or_default(),
            chunk_size: self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
        };

        AppConfig { geometry, io }
    }
}

pub fn load_from_toml(path: &Path) -> Result<PartialConfig, Error> {
    let content = fs::read_to_string(path)?;
    let toml_config: TomlConfig = toml::from_str(&content)?;
    Ok(toml_config.into())
}

pub fn load_from_env() -> PartialConfig {
    let mut config = PartialConfig::default();

    if let Some(v) = env_var("BLOCK_SIZE") {
        config.block_size = v.parse().ok();
    }

    if let Some(v) = env_var("BUFFER_SIZE_KIB") {
        config.buffer_size = v.parse::<usize>().ok().map(|v| v * KIBI);
    }

    if let Some(v) = env_var("SECTOR_ALIGN") {
        config.sector_align = v.parse().ok();
    }

    if let Some(v) = env_var("BUFFER_ALIGN") {
        config.buffer_align = v.parse().ok();
    }

    if let Some(v) = env_var("DIRECT_IO") {
        config.direct_io = parse_bool(&v);
    }

    if let Some(v) = env_var("FILLS") {
        config.fills = parse_bool(&v);
    }

    if let Some(v) = env_var("O_DIRECT") {
        config.o_direct = parse_bool(&v);
    }

    if let Some(v) = env_var("CHUNK_SIZE_KIB") {
        config.chunk_size = v.parse::<usize>().ok().map(|v| v * KIBI);
    }

    config
}

fn env_var(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{name}")).ok()
}

// Unrecognised values fall back to the next layer instead of failing.
fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn power_of_two(field: &'static str, value: usize) -> Result<(), ValidationError> {
    if value.is_power_of_two() {
        return Ok(());
    }
    Err(ValidationError { field, message: format!("must be a power of two, got {value}") })
}

pub fn validate(config: &AppConfig) -> Result<(), ValidationError> {
    let GeometryConfig { block_size, buffer_size, sector_align, buffer_align } = config.geometry;

    if block_size == 0 {
        return Err(ValidationError { field: "block_size", message: "must be at least 1".into() });
    }

    power_of_two("sector_align", sector_align)?;
    power_of_two("buffer_align", buffer_align)?;

    if buffer_size == 0 || !buffer_size.is_multiple_of(block_size) {
        return Err(ValidationError {
            field: "buffer_size",
            message: format!("must be a non-zero multiple of the block size ({block_size})"),
        });
    }

    let compatible = if sector_align > block_size {
        sector_align.is_multiple_of(block_size)
    } else {
        block_size.is_multiple_of(sector_align)
    };
    if !compatible {
        return Err(ValidationError {
            field: "sector_align",
            message: format!("must divide or be a multiple of the block size ({block_size})"),
        });
    }

    if !buffer_size.is_multiple_of(sector_align) {
        return Err(ValidationError {
            field: "buffer_size",
            message: format!("must be a multiple of the sector alignment ({sector_align})"),
        });
    }

    if config.io.chunk_size == 0 {
        return Err(ValidationError {
            field: "chunk_size_kib",
            message: "must be at least 1".into(),
        });
    }

    // O_DIRECT rejects any offset, length or address that is not sector-aligned.
    if config.io.o_direct {
        if !block_size.is_multiple_of(SECTOR_SIZE) {
            return Err(ValidationError {
                field: "block_size",
                message: "must be a multiple of 4 KiB with o_direct".into(),
            });
        }

        if buffer_align < SECTOR_SIZE {
            return Err(ValidationError {
                field: "buffer_align",
                message: "must be at least 4 KiB with o_direct".into(),
            });
        }
    }

    Ok(())
}

pub fn load(cli: PartialConfig) -> Result<AppConfig, Error> {
    let mut merged = PartialConfig::default();

    let config_path = cli.config_file.clone().unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));

    // An explicit --config must exist; the implicit one is optional.
    if cli.config_file.is_some() || config_path.exists() {
        let toml_config = load_from_toml(&config_path)?;
        merged.merge_from(toml_config);
    }

    let env_config = load_from_env();
    merged.merge_from(env_config);

    merged.merge_from(cli);

    let config = merged.into_app_config();
    validate(&config)?;

    Ok(config)
}
