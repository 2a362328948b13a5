//! Name-keyed world lookup.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use super::store::FormatRegistry;
use super::World;

/// File extension of world files.
pub const WORLD_EXTENSION: &str = "world";

#[derive(Debug, thiserror::Error)]
#[error("a world named {0:?} is already registered")]
pub struct DuplicateWorld(pub String);

#[derive(Debug, Default)]
pub struct WorldRegistry {
    worlds: Mutex<HashMap<String, Arc<World>>>,
}

impl WorldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<World>>> {
        self.worlds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, world: World) -> Result<Arc<World>, DuplicateWorld> {
        let mut worlds = self.lock();
        if worlds.contains_key(world.name()) {
            return Err(DuplicateWorld(world.name().to_string()));
        }
        let world = Arc::new(world);
        worlds.insert(world.name().to_string(), Arc::clone(&world));
        Ok(world)
    }

    pub fn get(&self, name: &str) -> Option<Arc<World>> {
        self.lock().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Worlds currently holding a grid.
    pub fn loaded(&self) -> Vec<Arc<World>> {
        let mut worlds: Vec<Arc<World>> = self
            .lock()
            .values()
            .filter(|w| w.is_loaded())
            .cloned()
            .collect();
        worlds.sort_by(|a, b| a.name().cmp(b.name()));
        worlds
    }

    /// Registers every readable `*.world` file in `dir` as an unloaded world,
    /// creating the directory if needed. Returns how many were added.
    ///
    /// Files with unknown magic or a bad header are skipped. Names that are
    /// already registered are left alone.
    pub fn discover(&self, dir: &Path, formats: &FormatRegistry) -> io::Result<usize> {
        fs::create_dir_all(dir)?;
        let mut added = 0;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(WORLD_EXTENSION) {
                continue;
            }
            let world = match World::open(&path, formats) {
                Ok(world) => world,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable world file");
                    continue;
                }
            };
            match self.insert(world) {
                Ok(world) => {
                    debug!(world = %world.name(), path = %path.display(), "Discovered world");
                    added += 1;
                }
                Err(DuplicateWorld(name)) => {
                    debug!(world = %name, path = %path.display(), "World already registered");
                }
            }
        }
        info!(dir = %dir.display(), added, "World discovery finished");
        Ok(added)
    }
}
