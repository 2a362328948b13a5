//! Block grid storage.
//!
//! Blocks are stored y-major: `index = (y * depth + z) * width + x`.

use classic_shared::block::BlockId;

/// Smallest and largest permitted extent along any axis.
pub const MIN_EXTENT: usize = 16;
pub const MAX_EXTENT: usize = 1024;

/// World extents in blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dimensions {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {axis} {value}: must be a multiple of 16 in [16, 1024]")]
pub struct DimensionError {
    pub axis: &'static str,
    pub value: i64,
}

impl Dimensions {
    /// Validates each axis is a multiple of 16 in `[16, 1024]`.
    pub fn new(width: i64, height: i64, depth: i64) -> Result<Self, DimensionError> {
        Ok(Self {
            width: check_extent("width", width)?,
            height: check_extent("height", height)?,
            depth: check_extent("depth", depth)?,
        })
    }

    pub fn volume(&self) -> usize {
        self.width * self.height * self.depth
    }

    pub fn contains(&self, x: usize, y: usize, z: usize) -> bool {
        x < self.width && y < self.height && z < self.depth
    }

    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        (y * self.depth + z) * self.width + x
    }
}

fn check_extent(axis: &'static str, value: i64) -> Result<usize, DimensionError> {
    let in_range = (MIN_EXTENT as i64..=MAX_EXTENT as i64).contains(&value);
    if in_range && value % 16 == 0 {
        Ok(value as usize)
    } else {
        Err(DimensionError { axis, value })
    }
}

/// A dense block grid. Its length always equals the volume of its dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockGrid {
    dims: Dimensions,
    blocks: Vec<BlockId>,
}

impl BlockGrid {
    /// An all-air grid.
    pub fn new(dims: Dimensions) -> Self {
        Self {
            dims,
            blocks: vec![0; dims.volume()],
        }
    }

    /// Wraps raw blocks; `None` if the length does not match the volume.
    pub fn from_blocks(dims: Dimensions, blocks: Vec<BlockId>) -> Option<Self> {
        (blocks.len() == dims.volume()).then_some(Self { dims, blocks })
    }

    pub fn dims(&self) -> Dimensions {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn as_slice(&self) -> &[BlockId] {
        &self.blocks
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> Option<BlockId> {
        self.dims
            .contains(x, y, z)
            .then(|| self.blocks[self.dims.index(x, y, z)])
    }

    /// Writes one block and returns the previous id, or `None` if out of bounds.
    pub fn set(&mut self, x: usize, y: usize, z: usize, block: BlockId) -> Option<BlockId> {
        if !self.dims.contains(x, y, z) {
            return None;
        }
        let index = self.dims.index(x, y, z);
        Some(std::mem::replace(&mut self.blocks[index], block))
    }

    /// Fills the horizontal layer at `y` inside `[x0, x1) × [z0, z1)`.
    pub fn fill_layer(&mut self, y: usize, x0: usize, x1: usize, z0: usize, z1: usize, block: BlockId) {
        for z in z0..z1 {
            let row = self.dims.index(x0, y, z);
            self.blocks[row..row + (x1 - x0)].fill(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_length_matches_volume_for_valid_dimensions() {
        for extent in [16, 32, 128, 1024] {
            let dims = Dimensions::new(extent, 16, 32).unwrap();
            let grid = BlockGrid::new(dims);
            assert_eq!(grid.len(), (extent * 16 * 32) as usize);
        }
    }

    #[test]
    fn invalid_extents_are_rejected() {
        assert!(Dimensions::new(15, 16, 16).is_err());
        assert!(Dimensions::new(16, 0, 16).is_err());
        assert!(Dimensions::new(16, 16, 1040).is_err());
        assert!(Dimensions::new(24, 16, 16).is_err());
        let err = Dimensions::new(16, 16, -16).unwrap_err();
        assert_eq!(err.axis, "depth");
    }

    #[test]
    fn index_is_y_major() {
        let dims = Dimensions::new(16, 32, 48).unwrap();
        assert_eq!(dims.index(0, 0, 0), 0);
        assert_eq!(dims.index(1, 0, 0), 1);
        assert_eq!(dims.index(0, 0, 1), 16);
        assert_eq!(dims.index(0, 1, 0), 16 * 48);
    }

    #[test]
    fn set_and_get_respect_bounds() {
        let mut grid = BlockGrid::new(Dimensions::new(16, 16, 16).unwrap());
        assert_eq!(grid.set(3, 4, 5, 7), Some(0));
        assert_eq!(grid.get(3, 4, 5), Some(7));
        assert_eq!(grid.set(16, 0, 0, 1), None);
        assert_eq!(grid.get(0, 16, 0), None);
    }

    #[test]
    fn from_blocks_checks_length() {
        let dims = Dimensions::new(16, 16, 16).unwrap();
        assert!(BlockGrid::from_blocks(dims, vec![0; 10]).is_none());
        assert!(BlockGrid::from_blocks(dims, vec![0; 4096]).is_some());
    }
}
