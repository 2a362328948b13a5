//! World persistence and transfer encoding.
//!
//! On-disk layout (all integers big-endian):
//!
//! ```text
//! magic u64 | name_len i32, name | motd_len i32, motd
//! | width i32 | height i32 | depth i32
//! | spawn x/y/z f32 | spawn yaw/pitch f32
//! | build_permission i32 | visit_permission i32
//! | volume × block i32
//! ```
//!
//! The magic selects the decoder, so older layouts can be registered next to
//! the current one. Files are always written in the current layout.
//!
//! The wire transfer encoding is a gzip stream of `volume u32` followed by
//! one byte per block.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use classic_shared::block::BlockId;
use classic_shared::math::{Orientation, Position};
use flate2::{write::GzEncoder, Compression};

use super::grid::{BlockGrid, Dimensions};

/// Magic of the layout written by this version.
pub const CURRENT_MAGIC: u64 = 0x0000_0000_0000_0000;

/// Upper bound on stored string lengths; anything larger is corruption.
const MAX_STRING_BYTES: usize = 64 * 1024;

/// Blocks decoded or encoded per read or write call.
const BLOCK_BATCH: usize = 16 * 1024;

/// Errors emitted by world storage.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown world format magic {0:#018x}")]
    UnknownFormat(u64),
    #[error("corrupt world file: {0}")]
    Corrupt(String),
}

/// Everything stored ahead of the block data.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldHeader {
    pub name: String,
    pub motd: Option<String>,
    pub dims: Dimensions,
    pub spawn: Position,
    pub spawn_orientation: Orientation,
    pub build_permission: i32,
    pub visit_permission: i32,
}

/// A decoder for one on-disk layout.
pub trait WorldFormat: Send + Sync {
    fn magic(&self) -> u64;

    /// Reads the header. The reader is positioned just past the magic.
    fn read_header(&self, r: &mut dyn Read) -> Result<WorldHeader, StoreError>;

    /// Reads the grid. The reader is positioned just past the header.
    fn read_blocks(&self, r: &mut dyn Read, dims: Dimensions) -> Result<BlockGrid, StoreError>;
}

/// The current layout, magic `0x0000000000000000`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FormatV0;

impl WorldFormat for FormatV0 {
    fn magic(&self) -> u64 {
        CURRENT_MAGIC
    }

    fn read_header(&self, r: &mut dyn Read) -> Result<WorldHeader, StoreError> {
        let name = read_string(r)?;
        let motd = Some(read_string(r)?).filter(|m| !m.is_empty());
        let (width, height, depth) = (read_i32(r)?, read_i32(r)?, read_i32(r)?);
        let dims = Dimensions::new(width.into(), height.into(), depth.into())
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let spawn = Position::new(read_f32(r)?, read_f32(r)?, read_f32(r)?);
        let spawn_orientation = Orientation::new(read_f32(r)?, read_f32(r)?);
        Ok(WorldHeader {
            name,
            motd,
            dims,
            spawn,
            spawn_orientation,
            build_permission: read_i32(r)?,
            visit_permission: read_i32(r)?,
        })
    }

    fn read_blocks(&self, r: &mut dyn Read, dims: Dimensions) -> Result<BlockGrid, StoreError> {
        let volume = dims.volume();
        let mut blocks: Vec<BlockId> = Vec::with_capacity(volume);
        let mut raw = vec![0u8; BLOCK_BATCH * 4];
        while blocks.len() < volume {
            let batch = (volume - blocks.len()).min(BLOCK_BATCH);
            let raw = &mut raw[..batch * 4];
            r.read_exact(raw)?;
            for word in raw.chunks_exact(4) {
                let id = i32::from_be_bytes([word[0], word[1], word[2], word[3]]);
                let id = BlockId::try_from(id).map_err(|_| {
                    StoreError::Corrupt(format!(
                        "block {} has id {id} outside 0..=255",
                        blocks.len()
                    ))
                })?;
                blocks.push(id);
            }
        }
        BlockGrid::from_blocks(dims, blocks)
            .ok_or_else(|| StoreError::Corrupt("block count does not match volume".into()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("a world format with magic {0:#018x} is already registered")]
pub struct DuplicateFormat(pub u64);

/// Magic value to decoder.
#[derive(Clone)]
pub struct FormatRegistry {
    formats: HashMap<u64, Arc<dyn WorldFormat>>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self {
            formats: HashMap::new(),
        }
    }

    /// A registry holding every layout this version can read.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.formats.insert(CURRENT_MAGIC, Arc::new(FormatV0));
        registry
    }

    pub fn register(&mut self, format: Arc<dyn WorldFormat>) -> Result<(), DuplicateFormat> {
        let magic = format.magic();
        if self.formats.contains_key(&magic) {
            return Err(DuplicateFormat(magic));
        }
        self.formats.insert(magic, format);
        Ok(())
    }

    pub fn get(&self, magic: u64) -> Option<Arc<dyn WorldFormat>> {
        self.formats.get(&magic).cloned()
    }

    /// Opens a world file and returns its decoder with the reader positioned
    /// just past the magic.
    fn open(&self, path: &Path) -> Result<(Arc<dyn WorldFormat>, BufReader<File>), StoreError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        let magic = u64::from_be_bytes(magic);
        let format = self.get(magic).ok_or(StoreError::UnknownFormat(magic))?;
        Ok((format, reader))
    }

    /// Reads only the header of a world file.
    pub fn read_header(&self, path: &Path) -> Result<WorldHeader, StoreError> {
        let (format, mut reader) = self.open(path)?;
        format.read_header(&mut reader)
    }

    /// Reads header and grid of a world file.
    pub fn read_world(&self, path: &Path) -> Result<(WorldHeader, BlockGrid), StoreError> {
        let (format, mut reader) = self.open(path)?;
        let header = format.read_header(&mut reader)?;
        let grid = format.read_blocks(&mut reader, header.dims)?;
        Ok((header, grid))
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Writes a world in the current layout. Blocks are encoded in fixed-size
/// batches, so memory use does not grow with the world.
pub fn encode_world<W: Write>(
    w: &mut W,
    header: &WorldHeader,
    grid: &BlockGrid,
) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(BLOCK_BATCH * 4);
    buf.put_u64(CURRENT_MAGIC);
    put_string(&mut buf, &header.name);
    put_string(&mut buf, header.motd.as_deref().unwrap_or(""));
    buf.put_i32(header.dims.width as i32);
    buf.put_i32(header.dims.height as i32);
    buf.put_i32(header.dims.depth as i32);
    buf.put_f32(header.spawn.x);
    buf.put_f32(header.spawn.y);
    buf.put_f32(header.spawn.z);
    buf.put_f32(header.spawn_orientation.yaw());
    buf.put_f32(header.spawn_orientation.pitch());
    buf.put_i32(header.build_permission);
    buf.put_i32(header.visit_permission);
    w.write_all(&buf)?;

    for batch in grid.as_slice().chunks(BLOCK_BATCH) {
        buf.clear();
        for &block in batch {
            buf.put_i32(block.into());
        }
        w.write_all(&buf)?;
    }
    Ok(())
}

/// Writes a world file through a temporary sibling and renames it into place.
pub fn write_world(path: &Path, header: &WorldHeader, grid: &BlockGrid) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    let mut out = BufWriter::new(File::create(&tmp)?);
    encode_world(&mut out, header, grid)?;
    let file = out.into_inner().map_err(io::IntoInnerError::into_error)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Gzip stream of the block count followed by one byte per block.
pub fn compress_blocks(grid: &BlockGrid) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&(grid.len() as u32).to_be_bytes())?;
    encoder.write_all(grid.as_slice())?;
    encoder.finish()
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_i32(s.len() as i32);
    buf.put_slice(s.as_bytes());
}

fn read_i32(r: &mut dyn Read) -> io::Result<i32> {
    let mut raw = [0u8; 4];
    r.read_exact(&mut raw)?;
    Ok(i32::from_be_bytes(raw))
}

fn read_f32(r: &mut dyn Read) -> io::Result<f32> {
    let mut raw = [0u8; 4];
    r.read_exact(&mut raw)?;
    Ok(f32::from_be_bytes(raw))
}

fn read_string(r: &mut dyn Read) -> Result<String, StoreError> {
    let len = read_i32(r)?;
    let len = usize::try_from(len)
        .ok()
        .filter(|&len| len <= MAX_STRING_BYTES)
        .ok_or_else(|| StoreError::Corrupt(format!("string length {len}")))?;
    let mut raw = vec![0u8; len];
    r.read_exact(&mut raw)?;
    String::from_utf8(raw).map_err(|e| StoreError::Corrupt(e.to_string()))
}
