//! World generation.
//!
//! A generator is a strategy object looked up by name. The unit of work is a
//! chunk: a 16×16 column spanning the full height of the grid.

use std::collections::HashMap;
use std::sync::Arc;

use classic_shared::block::Block;

use crate::world::grid::BlockGrid;

/// Horizontal size of a generation chunk.
pub const CHUNK_SIZE: usize = 16;

pub trait WorldGenerator: Send + Sync {
    /// Fills the column whose origin is `(chunk_x * 16, chunk_z * 16)`.
    fn generate_chunk(&self, grid: &mut BlockGrid, chunk_x: usize, chunk_z: usize, seed: i64);

    /// Fills the whole grid. Override when a generator can do better than
    /// chunk-by-chunk.
    fn generate_world(&self, grid: &mut BlockGrid, seed: i64) {
        generate_by_chunks(self, grid, seed);
    }
}

/// Calls `generate_chunk` once for every chunk of the grid.
pub fn generate_by_chunks<G: WorldGenerator + ?Sized>(generator: &G, grid: &mut BlockGrid, seed: i64) {
    let dims = grid.dims();
    for chunk_x in 0..dims.width / CHUNK_SIZE {
        for chunk_z in 0..dims.depth / CHUNK_SIZE {
            generator.generate_chunk(grid, chunk_x, chunk_z, seed);
        }
    }
}

/// Dirt below mid-height, one layer of grass at mid-height, air above.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatgrassGenerator;

impl FlatgrassGenerator {
    fn fill(grid: &mut BlockGrid, x0: usize, x1: usize, z0: usize, z1: usize) {
        let surface = grid.dims().height / 2;
        for y in 0..surface {
            grid.fill_layer(y, x0, x1, z0, z1, Block::Dirt.id());
        }
        grid.fill_layer(surface, x0, x1, z0, z1, Block::Grass.id());
    }
}

impl WorldGenerator for FlatgrassGenerator {
    fn generate_chunk(&self, grid: &mut BlockGrid, chunk_x: usize, chunk_z: usize, _seed: i64) {
        let x0 = chunk_x * CHUNK_SIZE;
        let z0 = chunk_z * CHUNK_SIZE;
        Self::fill(grid, x0, x0 + CHUNK_SIZE, z0, z0 + CHUNK_SIZE);
    }

    fn generate_world(&self, grid: &mut BlockGrid, _seed: i64) {
        let dims = grid.dims();
        Self::fill(grid, 0, dims.width, 0, dims.depth);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("a world generator named {0:?} is already registered")]
pub struct DuplicateGenerator(pub String);

/// Name-keyed generator lookup.
#[derive(Clone)]
pub struct GeneratorRegistry {
    generators: HashMap<String, Arc<dyn WorldGenerator>>,
}

impl GeneratorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            generators: HashMap::new(),
        }
    }

    /// A registry with the built-in generators.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.generators.insert("flatgrass".to_string(), Arc::new(FlatgrassGenerator));
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        generator: Arc<dyn WorldGenerator>,
    ) -> Result<(), DuplicateGenerator> {
        if self.generators.contains_key(name) {
            return Err(DuplicateGenerator(name.to_string()));
        }
        self.generators.insert(name.to_string(), generator);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WorldGenerator>> {
        self.generators.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.generators.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for GeneratorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
