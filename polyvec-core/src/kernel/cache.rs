use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::RwLock;

use crate::{device::DeviceId, storage::Program, Result};

/// Counters describing how often the cache avoided a compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Programs compiled since the context was created.
    pub compiled: usize,
    /// Lookups answered by an already compiled program.
    pub hits: usize,
    /// Programs currently held.
    pub entries: usize,
}

/// Compiled programs keyed by device and generated source.
///
/// Owned by a [`crate::Context`] and shared with its queues. A program is compiled at
/// most once per (device, source) pair while the context lives.
pub struct KernelCache {
    programs: RwLock<HashMap<DeviceId, HashMap<String, Program>>>,
    compiled: AtomicUsize,
    hits: AtomicUsize,
    dump_dir: Option<PathBuf>,
}

impl KernelCache {
    pub(crate) fn new(dump_dir: Option<PathBuf>) -> Self {
        Self {
            programs: RwLock::new(HashMap::new()),
            compiled: AtomicUsize::new(0),
            hits: AtomicUsize::new(0),
            dump_dir,
        }
    }

    /// Return the program for `source` on `device`, compiling it on a miss.
    pub(crate) fn get_or_compile(
        &self,
        device: DeviceId,
        name: &str,
        source: &str,
        compile: impl FnOnce() -> Result<Program>,
    ) -> Result<Program> {
        if let Some(program) = self.lookup(device, source) {
            return Ok(program);
        }

        let mut programs = self.programs.write();
        // Another thread may have compiled it while we waited for the lock.
        if let Some(program) = programs.get(&device).and_then(|p| p.get(source)) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(program.clone());
        }
        self.dump(name, source);
        let program = compile()?;
        self.compiled.fetch_add(1, Ordering::Relaxed);
        log::debug!("compiled kernel {name} for device {device:?}");
        programs
            .entry(device)
            .or_default()
            .insert(source.to_string(), program.clone());
        Ok(program)
    }

    fn lookup(&self, device: DeviceId, source: &str) -> Option<Program> {
        let programs = self.programs.read();
        let program = programs.get(&device)?.get(source)?.clone();
        self.hits.fetch_add(1, Ordering::Relaxed);
        log::trace!("kernel cache hit on device {device:?}");
        Some(program)
    }

    fn dump(&self, name: &str, source: &str) {
        let Some(dir) = &self.dump_dir else {
            return;
        };
        let path = dir.join(format!("{name}.cu"));
        if let Err(err) = fs::create_dir_all(dir).and_then(|_| fs::write(&path, source)) {
            log::warn!("could not write kernel source to {}: {err}", path.display());
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            compiled: self.compiled.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            entries: self.programs.read().values().map(HashMap::len).sum(),
        }
    }

    pub fn len(&self) -> usize {
        self.stats().entries
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every compiled program.
    pub fn clear(&self) {
        self.programs.write().clear();
    }
}
