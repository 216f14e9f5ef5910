//! Shared test utilities for all integration test suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]
#![allow(unused_imports)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;

pub use pmobj::limits::{MIN_PART, MIN_POOL};
pub use pmobj::{
    errormsg, AllocFlags, CrashPoint, CtlValue, DataState, Error, ObjectId, PartDesc, Pool, PoolKind,
    PoolOptions, PoolSetDescriptor,
};
use tempfile::TempDir;

pub const K: u64 = 1024;
pub const M: u64 = 1024 * 1024;

/// Chunk size of the heap; huge objects are rounded up to it
pub const CHUNK: u64 = 256 * K;

/// Header in front of every huge object
pub const HUGE_HEADER: u64 = 16;

static TRACING: Once = Once::new();

/// Install a subscriber once per test binary; `RUST_LOG` controls the level
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Replica layout: one list of `(size, directory name)` per replica
pub type DirLayout<'a> = &'a [&'a [(u64, &'a str)]];

// ============================================================================
// TestPool - pool in a temporary directory, reopenable
// ============================================================================

/// Pool living in a temporary directory
pub struct TestPool {
    pub dir: TempDir,
    pub path: PathBuf,
    pub layout: String,
    pub options: PoolOptions,
    pool: Option<Pool>,
}

impl TestPool {
    /// Single-file pool of `size` bytes
    pub fn single_file(size: u64) -> Self {
        Self::single_file_with(size, PoolOptions::for_testing())
    }

    /// Single-file pool with options
    pub fn single_file_with(size: u64, options: PoolOptions) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("pool.obj");
        let pool = Pool::create_with_options(&path, "test", size, &options).expect("Failed to create pool");
        TestPool {
            dir,
            path,
            layout: "test".to_string(),
            options,
            pool: Some(pool),
        }
    }

    /// Directory-based pool set with `SINGLEHDR`
    pub fn directories(replicas: DirLayout<'_>, options: PoolOptions) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_dir_set(dir.path(), replicas);
        let pool = Pool::create_with_options(&path, "test", 0, &options).expect("Failed to create pool");
        TestPool {
            dir,
            path,
            layout: "test".to_string(),
            options,
            pool: Some(pool),
        }
    }

    /// The open pool
    pub fn pool(&self) -> &Pool {
        self.pool.as_ref().expect("pool is closed")
    }

    /// Take the pool out, e.g. to interrupt a publish
    pub fn take(&mut self) -> Pool {
        self.pool.take().expect("pool is closed")
    }

    /// Close the pool
    pub fn close(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.close();
        }
    }

    /// Close and reopen with the same options
    pub fn reopen(&mut self) -> &Pool {
        self.try_reopen().expect("Failed to reopen pool")
    }

    /// Close and try to reopen
    pub fn try_reopen(&mut self) -> pmobj::Result<&Pool> {
        self.close();
        let pool = Pool::open_with_options(&self.path, Some(&self.layout), &self.options)?;
        self.pool = Some(pool);
        Ok(self.pool())
    }

    /// Path of a directory inside the temp dir
    pub fn subdir(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Write a `SINGLEHDR` pool set of growth directories under `root`
pub fn write_dir_set(root: &Path, replicas: DirLayout<'_>) -> PathBuf {
    let mut desc = PoolSetDescriptor::new().with_single_header(true);
    for parts in replicas {
        let parts = parts
            .iter()
            .map(|(size, name)| {
                let dir = root.join(name);
                fs::create_dir_all(&dir).expect("Failed to create part dir");
                PartDesc::directory(*size, dir)
            })
            .collect();
        desc = desc.with_replica(parts);
    }
    let path = root.join("pool.set");
    desc.write_to(&path).expect("Failed to write pool set");
    path
}

/// Sizes of the part files in `dir`, in name order
pub fn part_sizes(dir: &Path) -> Vec<u64> {
    let mut parts: Vec<(PathBuf, u64)> = fs::read_dir(dir)
        .expect("Failed to list part dir")
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map_or(false, |ext| ext == "pmem"))
        .map(|e| (e.path(), e.metadata().map(|m| m.len()).unwrap_or(0)))
        .collect();
    parts.sort();
    parts.into_iter().map(|(_, len)| len).collect()
}

/// Number of part files in `dir`
pub fn count_parts(dir: &Path) -> usize {
    part_sizes(dir).len()
}

/// Largest request that fills exactly `chunks` chunks as a huge object
pub fn huge_fitting(chunks: u64) -> u64 {
    chunks * CHUNK - HUGE_HEADER
}

/// Deterministic payload for object `seed`
pub fn pattern(seed: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| (seed as usize * 31 + i) as u8).collect()
}

/// All published objects in enumeration order
pub fn collect_objects(pool: &Pool) -> Vec<ObjectId> {
    pool.objects().collect()
}
