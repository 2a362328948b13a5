//! Worlds.
//!
//! A [`World`] pairs immutable metadata with a block grid. The grid exists
//! only while the world is `Loaded`:
//!
//! ```text
//! Unloaded --load--> Loading --ok--> Loaded --unload--> Unloading --ok--> Unloaded
//!     ^                 |              ^                     |
//!     +-----error-------+              +-------error---------+
//! ```
//!
//! The state flag and the grid sit behind separate locks. The state lock is
//! only ever held for a flip or a read, so async code may query it. The grid
//! lock is held while the grid is read for saving or streaming, and file I/O
//! can happen under it; async callers reach the grid through
//! `spawn_blocking`. When both are needed the grid lock is taken first.

pub mod grid;
pub mod registry;
pub mod store;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use classic_shared::block::BlockId;
use classic_shared::math::{Orientation, Position};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::worldgen::WorldGenerator;
use grid::{BlockGrid, DimensionError, Dimensions};
use store::{FormatRegistry, StoreError, WorldHeader};

/// Height of a player's eyes above the block they stand on.
pub const SPAWN_EYE_HEIGHT: f32 = 1.59375;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldLoadState {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
}

impl WorldLoadState {
    /// Whether a load or unload is in flight.
    pub fn is_transient(self) -> bool {
        matches!(self, WorldLoadState::Loading | WorldLoadState::Unloading)
    }
}

impl fmt::Display for WorldLoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorldLoadState::Unloaded => "unloaded",
            WorldLoadState::Loading => "loading",
            WorldLoadState::Loaded => "loaded",
            WorldLoadState::Unloading => "unloading",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    /// The operation is not allowed in the current state. Indicates a caller bug.
    #[error("world {world:?}: cannot {op} while {state}")]
    InvalidTransition {
        world: String,
        op: &'static str,
        state: WorldLoadState,
    },
    #[error(transparent)]
    Dimensions(#[from] DimensionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorldError {
    /// Whether this error comes from misuse rather than the environment.
    pub fn is_logic_error(&self) -> bool {
        matches!(self, WorldError::InvalidTransition { .. })
    }
}

impl From<std::io::Error> for WorldError {
    fn from(e: std::io::Error) -> Self {
        WorldError::Store(StoreError::Io(e))
    }
}

pub struct World {
    name: String,
    motd: Option<String>,
    dims: Dimensions,
    spawn: Position,
    spawn_orientation: Orientation,
    build_permission: i32,
    visit_permission: i32,
    path: PathBuf,
    state: Mutex<WorldLoadState>,
    grid: Mutex<Option<BlockGrid>>,
    /// Woken whenever a load or unload finishes.
    settled: Notify,
}

impl World {
    /// Creates a new world filled by `generator`. The result is `Loaded` but
    /// not yet saved.
    pub fn generate(
        name: &str,
        dims: Dimensions,
        path: PathBuf,
        generator: &dyn WorldGenerator,
        seed: i64,
    ) -> Self {
        let mut grid = BlockGrid::new(dims);
        generator.generate_world(&mut grid, seed);
        let spawn = Position::new(
            dims.width as f32 / 2.0,
            dims.height as f32 / 2.0 + SPAWN_EYE_HEIGHT,
            dims.depth as f32 / 2.0,
        );
        Self {
            name: name.to_string(),
            motd: None,
            dims,
            spawn,
            spawn_orientation: Orientation::new(0.0, 0.0),
            build_permission: 0,
            visit_permission: 0,
            path,
            state: Mutex::new(WorldLoadState::Loaded),
            grid: Mutex::new(Some(grid)),
            settled: Notify::new(),
        }
    }

    /// Creates an `Unloaded` world from stored metadata. The grid is read by
    /// [`World::load`].
    pub fn from_header(header: WorldHeader, path: PathBuf) -> Self {
        Self {
            name: header.name,
            motd: header.motd,
            dims: header.dims,
            spawn: header.spawn,
            spawn_orientation: header.spawn_orientation,
            build_permission: header.build_permission,
            visit_permission: header.visit_permission,
            path,
            state: Mutex::new(WorldLoadState::Unloaded),
            grid: Mutex::new(None),
            settled: Notify::new(),
        }
    }

    /// Reads the metadata of a world file.
    pub fn open(path: &Path, formats: &FormatRegistry) -> Result<Self, WorldError> {
        let header = formats.read_header(path)?;
        Ok(Self::from_header(header, path.to_path_buf()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn motd(&self) -> Option<&str> {
        self.motd.as_deref()
    }

    pub fn dims(&self) -> Dimensions {
        self.dims
    }

    pub fn spawn(&self) -> Position {
        self.spawn
    }

    pub fn spawn_orientation(&self) -> Orientation {
        self.spawn_orientation
    }

    pub fn build_permission(&self) -> i32 {
        self.build_permission
    }

    pub fn visit_permission(&self) -> i32 {
        self.visit_permission
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> WorldHeader {
        WorldHeader {
            name: self.name.clone(),
            motd: self.motd.clone(),
            dims: self.dims,
            spawn: self.spawn,
            spawn_orientation: self.spawn_orientation,
            build_permission: self.build_permission,
            visit_permission: self.visit_permission,
        }
    }

    pub fn state(&self) -> WorldLoadState {
        *self.lock_state()
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == WorldLoadState::Loaded
    }

    /// Waits out an in-flight load or unload and returns the state it
    /// settled in.
    pub async fn settled_state(&self) -> WorldLoadState {
        loop {
            // Registered before the check, so a wakeup in between is kept.
            let settled = self.settled.notified();
            let state = self.state();
            if !state.is_transient() {
                return state;
            }
            settled.await;
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, WorldLoadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_grid(&self) -> MutexGuard<'_, Option<BlockGrid>> {
        self.grid.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, state: WorldLoadState) {
        *self.lock_state() = state;
        self.settled.notify_waiters();
    }

    fn invalid(&self, op: &'static str, state: WorldLoadState) -> WorldError {
        WorldError::InvalidTransition {
            world: self.name.clone(),
            op,
            state,
        }
    }

    /// Moves from `from` to `to`, or reports the state that forbids it.
    fn flip(
        &self,
        op: &'static str,
        from: WorldLoadState,
        to: WorldLoadState,
    ) -> Result<(), WorldError> {
        let mut state = self.lock_state();
        if *state != from {
            return Err(self.invalid(op, *state));
        }
        *state = to;
        Ok(())
    }

    /// Reads the grid from disk. Valid only from `Unloaded`; on failure the
    /// world returns to `Unloaded`.
    pub fn load(&self, formats: &FormatRegistry) -> Result<(), WorldError> {
        self.flip("load", WorldLoadState::Unloaded, WorldLoadState::Loading)?;

        match self.read_grid(formats) {
            Ok(grid) => {
                let mut slot = self.lock_grid();
                *slot = Some(grid);
                self.settle(WorldLoadState::Loaded);
                drop(slot);
                info!(world = %self.name, path = %self.path.display(), "World loaded");
                Ok(())
            }
            Err(e) => {
                self.settle(WorldLoadState::Unloaded);
                Err(e)
            }
        }
    }

    fn read_grid(&self, formats: &FormatRegistry) -> Result<BlockGrid, WorldError> {
        let (header, grid) = formats.read_world(&self.path)?;
        if header.dims != self.dims {
            return Err(StoreError::Corrupt(format!(
                "dimensions changed from {:?} to {:?}",
                self.dims, header.dims
            ))
            .into());
        }
        Ok(grid)
    }

    /// Writes the world file. Valid only while `Loaded`. Holds the grid lock
    /// for the whole write, so call it off the async runtime.
    pub fn save(&self) -> Result<(), WorldError> {
        let grid = self.lock_grid();
        let state = self.state();
        match (state, grid.as_ref()) {
            (WorldLoadState::Loaded, Some(grid)) => {
                store::write_world(&self.path, &self.header(), grid)?;
                info!(world = %self.name, "World saved");
                Ok(())
            }
            (state, _) => Err(self.invalid("save", state)),
        }
    }

    /// Saves and releases the grid. Valid only while `Loaded`. If the save
    /// fails the grid is kept and the world stays `Loaded`.
    pub fn unload(&self) -> Result<(), WorldError> {
        self.flip("unload", WorldLoadState::Loaded, WorldLoadState::Unloading)?;
        let grid = self.lock_grid().take();

        let result = match grid.as_ref() {
            Some(grid) => store::write_world(&self.path, &self.header(), grid),
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                self.settle(WorldLoadState::Unloaded);
                info!(world = %self.name, "World unloaded");
                Ok(())
            }
            Err(e) => {
                let mut slot = self.lock_grid();
                *slot = grid;
                self.settle(WorldLoadState::Loaded);
                drop(slot);
                warn!(world = %self.name, error = %e, "Unload aborted, save failed");
                Err(e.into())
            }
        }
    }

    /// Runs `f` on the grid while the world is `Loaded`.
    fn with_grid<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut BlockGrid) -> T,
    ) -> Result<T, WorldError> {
        let mut grid = self.lock_grid();
        let state = self.state();
        match (state, grid.as_mut()) {
            (WorldLoadState::Loaded, Some(grid)) => Ok(f(grid)),
            (state, _) => Err(self.invalid(op, state)),
        }
    }

    /// The gzip transfer payload of the current grid.
    pub fn compressed_blocks(&self) -> Result<Vec<u8>, WorldError> {
        self.with_grid("stream", |grid| store::compress_blocks(grid))?
            .map_err(WorldError::from)
    }

    /// The block at a position, `None` when out of bounds.
    pub fn block(&self, x: usize, y: usize, z: usize) -> Result<Option<BlockId>, WorldError> {
        self.with_grid("read blocks", |grid| grid.get(x, y, z))
    }

    /// Replaces a block and returns the previous id, `None` when out of bounds.
    pub fn set_block(
        &self,
        x: usize,
        y: usize,
        z: usize,
        block: BlockId,
    ) -> Result<Option<BlockId>, WorldError> {
        self.with_grid("write blocks", |grid| grid.set(x, y, z, block))
    }

    /// Holds the grid lock on the calling thread, as a long save would.
    #[cfg(test)]
    pub(crate) fn hold_grid(&self, duration: std::time::Duration) {
        let _grid = self.lock_grid();
        std::thread::sleep(duration);
    }
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("name", &self.name)
            .field("dims", &self.dims)
            .field("path", &self.path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worldgen::FlatgrassGenerator;
    use std::sync::Arc;
    use classic_shared::block::Block;

    fn flat(dir: &Path) -> World {
        let dims = Dimensions::new(32, 32, 32).unwrap();
        World::generate("flat", dims, dir.join("flat.world"), &FlatgrassGenerator, 7)
    }

    #[test]
    fn generated_world_is_loaded_with_centered_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let world = flat(dir.path());
        assert_eq!(world.state(), WorldLoadState::Loaded);
        assert_eq!(world.spawn(), Position::new(16.0, 16.0 + SPAWN_EYE_HEIGHT, 16.0));
        assert_eq!(world.block(0, 16, 0).unwrap(), Some(Block::Grass.id()));
    }

    #[test]
    fn save_then_load_reproduces_world() {
        let dir = tempfile::tempdir().unwrap();
        let world = flat(dir.path());
        world.set_block(3, 20, 4, Block::Gold.id()).unwrap();
        world.save().unwrap();

        let formats = FormatRegistry::with_defaults();
        let reopened = World::open(world.path(), &formats).unwrap();
        assert_eq!(reopened.state(), WorldLoadState::Unloaded);
        assert_eq!(reopened.header(), world.header());

        reopened.load(&formats).unwrap();
        assert_eq!(reopened.block(3, 20, 4).unwrap(), Some(Block::Gold.id()));
        assert_eq!(
            reopened.compressed_blocks().unwrap().len(),
            world.compressed_blocks().unwrap().len()
        );
    }

    #[test]
    fn invalid_transitions_leave_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let formats = FormatRegistry::with_defaults();
        let world = flat(dir.path());

        let err = world.load(&formats).unwrap_err();
        assert!(err.is_logic_error());
        assert_eq!(world.state(), WorldLoadState::Loaded);

        world.unload().unwrap();
        assert_eq!(world.state(), WorldLoadState::Unloaded);

        assert!(world.unload().unwrap_err().is_logic_error());
        assert!(world.save().unwrap_err().is_logic_error());
        assert!(world.block(0, 0, 0).unwrap_err().is_logic_error());
        assert!(world.compressed_blocks().unwrap_err().is_logic_error());
        assert_eq!(world.state(), WorldLoadState::Unloaded);
    }

    #[test]
    fn failed_load_reverts_to_unloaded() {
        let dir = tempfile::tempdir().unwrap();
        let formats = FormatRegistry::with_defaults();
        let world = flat(dir.path());
        world.unload().unwrap();
        std::fs::remove_file(world.path()).unwrap();

        let err = world.load(&formats).unwrap_err();
        assert!(!err.is_logic_error());
        assert_eq!(world.state(), WorldLoadState::Unloaded);
    }

    #[test]
    fn failed_unload_keeps_grid() {
        let dir = tempfile::tempdir().unwrap();
        let dims = Dimensions::new(16, 16, 16).unwrap();
        let missing = dir.path().join("no-such-dir").join("w.world");
        let world = World::generate("w", dims, missing, &FlatgrassGenerator, 0);

        let err = world.unload().unwrap_err();
        assert!(!err.is_logic_error());
        assert_eq!(world.state(), WorldLoadState::Loaded);
        assert_eq!(world.block(0, 8, 0).unwrap(), Some(Block::Grass.id()));
    }

    #[test]
    fn block_access_is_bounds_checked() {
        let dir = tempfile::tempdir().unwrap();
        let world = flat(dir.path());
        assert_eq!(world.block(32, 0, 0).unwrap(), None);
        assert_eq!(world.set_block(0, 32, 0, 1).unwrap(), None);
        assert_eq!(world.set_block(0, 31, 0, 1).unwrap(), Some(Block::Air.id()));
    }

    #[tokio::test]
    async fn waiters_see_the_state_a_load_settles_in() {
        let dir = tempfile::tempdir().unwrap();
        let formats = FormatRegistry::with_defaults();
        let world = Arc::new(flat(dir.path()));
        world.unload().unwrap();

        world.flip("load", WorldLoadState::Unloaded, WorldLoadState::Loading).unwrap();
        let waiter = tokio::spawn({
            let world = Arc::clone(&world);
            async move { world.settled_state().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // Finish the load the way `load` does.
        let grid = formats.read_world(world.path()).unwrap().1;
        *world.lock_grid() = Some(grid);
        world.settle(WorldLoadState::Loaded);

        assert_eq!(waiter.await.unwrap(), WorldLoadState::Loaded);
        assert_eq!(world.settled_state().await, WorldLoadState::Loaded);
    }
}
