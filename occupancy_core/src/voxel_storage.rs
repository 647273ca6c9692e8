//! The "GRID" Engine - Chunked Voxel Storage
//!
//! An in-memory occupancy grid split into cubic chunks. The depth pipeline
//! rewrites the whole grid around the drone once per processed frame:
//!
//! 1. `start_transaction(drone_position)` - the first call fixes the grid
//!    origin, later calls compute how far the drone moved from it
//! 2. `add_point(voxel)` for every occupied voxel of the frame
//! 3. `end_transaction()` - diffs the frame against the stored chunks and
//!    records the changed chunk keys in the [`TransactionHistory`]
//!
//! Readers (render loop, beam) never see a half-built frame: chunks are
//! swapped in whole, as `Arc<ChunkStorage>`.

use crate::config::StorageConfig;
use crate::transaction_history::{ChangeSet, TransactionHistory};
use nalgebra::{Point3, Vector3};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

/// World voxel coordinate (one unit = one voxel).
pub type VoxelKey = Point3<i32>;

/// Chunk coordinate (`voxel.div_euclid(chunk_size)`).
pub type ChunkKey = Point3<i32>;

// ============================================================================
// CHUNK
// ============================================================================

/// Dense occupancy bitset of one `size³` chunk.
///
/// Indexed by the euclidean remainder of world voxel coordinates, so a chunk
/// can be queried with world keys directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkStorage {
    size: i32,
    bits: Vec<u64>,
}

impl ChunkStorage {
    /// Creates an empty chunk. A size below 1 is coerced to 1.
    pub fn new(size: i32) -> Self {
        let size = size.max(1);
        let cells = (size as usize).pow(3);
        Self {
            size,
            bits: vec![0; cells.div_ceil(64)],
        }
    }

    pub fn size(&self) -> i32 {
        self.size
    }

    /// Marks a voxel (world or local coordinates) as occupied.
    pub fn set_point(&mut self, voxel: &VoxelKey) {
        let index = self.index(voxel);
        self.bits[index / 64] |= 1 << (index % 64);
    }

    /// Returns true if the voxel is occupied.
    pub fn contains(&self, voxel: &VoxelKey) -> bool {
        let index = self.index(voxel);
        self.bits[index / 64] & (1 << (index % 64)) != 0
    }

    /// Number of occupied voxels.
    pub fn occupied_count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    /// World keys of the occupied voxels, assuming this chunk sits at `key`.
    pub fn occupied_voxels(&self, key: &ChunkKey) -> Vec<VoxelKey> {
        let size = self.size;
        let base = key.coords * size;
        let mut voxels = Vec::with_capacity(self.occupied_count());
        for z in 0..size {
            for y in 0..size {
                for x in 0..size {
                    let local = Point3::new(x, y, z);
                    if self.contains(&local) {
                        voxels.push(Point3::from(base + local.coords));
                    }
                }
            }
        }
        voxels
    }

    fn index(&self, voxel: &VoxelKey) -> usize {
        let s = self.size;
        let x = voxel.x.rem_euclid(s) as usize;
        let y = voxel.y.rem_euclid(s) as usize;
        let z = voxel.z.rem_euclid(s) as usize;
        let s = s as usize;
        x + s * (y + s * z)
    }
}

// ============================================================================
// WORLD
// ============================================================================

/// Chunk map shared between the producer and the readers.
#[derive(Debug, Default)]
pub struct WorldData {
    chunks: RwLock<HashMap<ChunkKey, Arc<ChunkStorage>>>,
}

impl WorldData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ChunkKey) -> Option<Arc<ChunkStorage>> {
        self.read().get(key).cloned()
    }

    pub fn insert(&self, key: ChunkKey, chunk: Arc<ChunkStorage>) {
        self.write().insert(key, chunk);
    }

    pub fn remove(&self, key: &ChunkKey) -> Option<Arc<ChunkStorage>> {
        self.write().remove(key)
    }

    /// Keys of every stored chunk.
    pub fn keys(&self) -> HashSet<ChunkKey> {
        self.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ChunkKey, Arc<ChunkStorage>>> {
        self.chunks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ChunkKey, Arc<ChunkStorage>>> {
        self.chunks.write().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// STORE BOUNDARY
// ============================================================================

/// Read side of a voxel grid, as seen by the render loop and the beam.
pub trait VoxelStore: Send + Sync {
    /// Chunk at `key`, if any voxel of it is occupied.
    fn chunk(&self, key: &ChunkKey) -> Option<Arc<ChunkStorage>>;

    /// Chunk and voxel keys containing a scene position (voxel units).
    fn convert_world_position(&self, position: &Vector3<f64>) -> (ChunkKey, VoxelKey);

    /// Chunks changed since `*watermark`, advancing it.
    ///
    /// Never fails: a watermark older than the retained history yields
    /// every stored chunk, a future one yields nothing.
    fn updated_chunks(&self, watermark: &mut u64) -> HashSet<ChunkKey>;

    /// Returns true if the voxel at a world key is occupied.
    fn is_occupied(&self, voxel: &VoxelKey) -> bool {
        let position = voxel.coords.cast::<f64>();
        let (key, voxel) = self.convert_world_position(&position);
        self.chunk(&key).is_some_and(|chunk| chunk.contains(&voxel))
    }
}

// ============================================================================
// CORE STORAGE
// ============================================================================

#[derive(Debug, Default)]
struct TransactionState {
    /// Drone position (NED, meters) of the first transaction
    grid_origin: Option<Vector3<f64>>,

    /// Drone displacement from the origin, in scene voxels
    grid_offset: Vector3<i32>,
}

/// Chunked voxel grid with a versioned change log.
#[derive(Debug)]
pub struct VoxelStorageCore {
    chunk_size: i32,
    voxel_real_size: f64,

    /// Scene position of the grid center
    center: Vector3<f64>,

    history: TransactionHistory<ChunkKey>,
    world: WorldData,
    state: Mutex<TransactionState>,
}

impl VoxelStorageCore {
    pub fn new(config: &StorageConfig) -> Self {
        let [sx, sy, sz] = config.grid_size;
        Self {
            chunk_size: config.chunk_size.max(1),
            voxel_real_size: config.voxel_real_size,
            center: Vector3::new(
                f64::from(sx - 1) / 2.0,
                f64::from(sy - 1) / 2.0,
                f64::from(sz - 1) / 2.0,
            ),
            history: TransactionHistory::new(config.history_capacity),
            world: WorldData::new(),
            state: Mutex::new(TransactionState::default()),
        }
    }

    pub fn chunk_size(&self) -> i32 {
        self.chunk_size
    }

    pub fn voxel_real_size(&self) -> f64 {
        self.voxel_real_size
    }

    pub fn center(&self) -> Vector3<f64> {
        self.center
    }

    /// NED position fixed by the first transaction.
    pub fn grid_origin(&self) -> Option<Vector3<f64>> {
        self.lock_state().grid_origin
    }

    pub fn grid_offset(&self) -> Vector3<i32> {
        self.lock_state().grid_offset
    }

    pub fn current_version(&self) -> u64 {
        self.history.current_version()
    }

    pub fn history(&self) -> &TransactionHistory<ChunkKey> {
        &self.history
    }

    pub fn all_chunk_keys(&self) -> HashSet<ChunkKey> {
        self.world.keys()
    }

    pub fn chunk_count(&self) -> usize {
        self.world.len()
    }

    /// Opens a transaction for a frame captured at `drone_position` (NED).
    ///
    /// Only one transaction runs at a time; a second caller waits until the
    /// first one ends.
    pub fn start_transaction(&self, drone_position: &Vector3<f64>) -> Transaction<'_> {
        let mut state = self.lock_state();
        match state.grid_origin {
            Some(origin) => {
                state.grid_offset = grid_offset(&origin, drone_position, self.voxel_real_size);
            }
            None => {
                info!(
                    north = drone_position.x,
                    east = drone_position.y,
                    down = drone_position.z,
                    "Grid origin fixed"
                );
                state.grid_origin = Some(*drone_position);
            }
        }
        let offset = state.grid_offset;

        Transaction {
            storage: self,
            _state: state,
            offset,
            chunks: HashMap::with_capacity(100),
        }
    }

    fn end_transaction(&self, chunks: HashMap<ChunkKey, ChunkStorage>) -> u64 {
        let in_transaction: HashSet<ChunkKey> = chunks.keys().copied().collect();
        let mut updated = ChangeSet::new();

        for (key, chunk) in chunks {
            let changed = self
                .world
                .get(&key)
                .map_or(true, |stored| *stored != chunk);
            if changed {
                self.world.insert(key, Arc::new(chunk));
                updated.insert(key);
            }
        }
        let replaced = updated.len();

        let removed: Vec<ChunkKey> = self
            .world
            .keys()
            .difference(&in_transaction)
            .copied()
            .collect();
        for key in &removed {
            self.world.remove(key);
        }
        updated.extend(removed.iter().copied());

        let version = self.history.append(updated);
        debug!(version, replaced, removed = removed.len(), "Grid transaction committed");
        version
    }

    fn lock_state(&self) -> MutexGuard<'_, TransactionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl VoxelStore for VoxelStorageCore {
    fn chunk(&self, key: &ChunkKey) -> Option<Arc<ChunkStorage>> {
        self.world.get(key)
    }

    fn convert_world_position(&self, position: &Vector3<f64>) -> (ChunkKey, VoxelKey) {
        let voxel = Point3::new(
            position.x.floor() as i32,
            position.y.floor() as i32,
            position.z.floor() as i32,
        );
        let chunk = voxel.map(|c| c.div_euclid(self.chunk_size));
        (chunk, voxel)
    }

    fn updated_chunks(&self, watermark: &mut u64) -> HashSet<ChunkKey> {
        let asked = *watermark;
        match self.history.query(watermark) {
            Some(changed) => changed,
            // The watermark moved: the requested version was evicted
            None if *watermark > asked => {
                debug!(asked, now = *watermark, "History evicted, full resync");
                self.world.keys()
            }
            None => HashSet::new(),
        }
    }
}

/// Scene displacement (voxels) of `position` from `origin`, both NED.
///
/// Scene axes: x = -east, y = -down, z = north.
fn grid_offset(origin: &Vector3<f64>, position: &Vector3<f64>, voxel_size: f64) -> Vector3<i32> {
    let to_voxels = |meters: f64| (meters / voxel_size).round() as i32;
    Vector3::new(
        to_voxels(origin.y - position.y),
        to_voxels(origin.z - position.z),
        to_voxels(position.x - origin.x),
    )
}

/// One frame being written into a [`VoxelStorageCore`].
///
/// Dropping it without calling [`Transaction::end_transaction`] discards the
/// frame and leaves the grid untouched.
pub struct Transaction<'a> {
    storage: &'a VoxelStorageCore,
    _state: MutexGuard<'a, TransactionState>,
    offset: Vector3<i32>,
    chunks: HashMap<ChunkKey, ChunkStorage>,
}

impl Transaction<'_> {
    /// Adds an occupied voxel given in sensor grid coordinates.
    pub fn add_point(&mut self, point: &VoxelKey) {
        let shifted = Point3::from(point.coords + self.offset);
        let size = self.storage.chunk_size;
        let key = shifted.map(|c| c.div_euclid(size));
        self.chunks
            .entry(key)
            .or_insert_with(|| ChunkStorage::new(size))
            .set_point(&shifted);
    }

    /// Offset applied to incoming points.
    pub fn offset(&self) -> Vector3<i32> {
        self.offset
    }

    /// Number of chunks touched so far.
    pub fn pending_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Commits the frame and returns the change-log version recorded for it.
    pub fn end_transaction(self) -> u64 {
        let Transaction {
            storage, chunks, ..
        } = self;
        storage.end_transaction(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(history: usize) -> VoxelStorageCore {
        VoxelStorageCore::new(&StorageConfig {
            chunk_size: 4,
            history_capacity: history,
            ..StorageConfig::default()
        })
    }

    fn commit(storage: &VoxelStorageCore, at: Vector3<f64>, points: &[(i32, i32, i32)]) -> u64 {
        let mut tx = storage.start_transaction(&at);
        for &(x, y, z) in points {
            tx.add_point(&Point3::new(x, y, z));
        }
        tx.end_transaction()
    }

    #[test]
    fn test_chunk_bits() {
        let mut chunk = ChunkStorage::new(4);
        assert!(chunk.is_empty());
        chunk.set_point(&Point3::new(1, 2, 3));
        chunk.set_point(&Point3::new(1, 2, 3));
        assert!(chunk.contains(&Point3::new(1, 2, 3)));
        // Same local cell seen from another chunk
        assert!(chunk.contains(&Point3::new(-3, 6, -1)));
        assert!(!chunk.contains(&Point3::new(2, 2, 3)));
        assert_eq!(chunk.occupied_count(), 1);
        assert_eq!(chunk.occupied_voxels(&Point3::new(-1, 0, 2)), vec![Point3::new(-3, 2, 11)]);
    }

    #[test]
    fn test_chunk_equality_compares_bits() {
        let mut a = ChunkStorage::new(4);
        let mut b = ChunkStorage::new(4);
        a.set_point(&Point3::new(0, 0, 0));
        assert_ne!(a, b);
        b.set_point(&Point3::new(4, 4, 4));
        assert_eq!(a, b);
    }

    #[test]
    fn test_first_transaction_creates_chunks() {
        let s = storage(8);
        let v = commit(&s, Vector3::zeros(), &[(0, 0, 0), (5, 0, 0), (-1, 0, 0)]);
        assert_eq!(v, 1);
        assert_eq!(s.chunk_count(), 3);
        assert!(s.is_occupied(&Point3::new(-1, 0, 0)));
        assert!(!s.is_occupied(&Point3::new(1, 0, 0)));

        let mut watermark = 1;
        let changed = s.updated_chunks(&mut watermark);
        let expected: HashSet<ChunkKey> =
            [Point3::new(0, 0, 0), Point3::new(1, 0, 0), Point3::new(-1, 0, 0)].into();
        assert_eq!(changed, expected);
        assert_eq!(watermark, 2);
    }

    #[test]
    fn test_unchanged_frame_records_empty_change_set() {
        let s = storage(8);
        commit(&s, Vector3::zeros(), &[(0, 0, 0)]);
        let mut watermark = 2;
        let v = commit(&s, Vector3::zeros(), &[(0, 0, 0)]);
        assert_eq!(v, 2);
        assert!(s.updated_chunks(&mut watermark).is_empty());
        assert_eq!(watermark, 3);
    }

    #[test]
    fn test_missing_chunks_are_removed() {
        let s = storage(8);
        commit(&s, Vector3::zeros(), &[(0, 0, 0), (8, 0, 0)]);
        let mut watermark = 2;
        commit(&s, Vector3::zeros(), &[(1, 0, 0)]);

        let changed = s.updated_chunks(&mut watermark);
        let expected: HashSet<ChunkKey> = [Point3::new(0, 0, 0), Point3::new(2, 0, 0)].into();
        assert_eq!(changed, expected);
        assert_eq!(s.chunk_count(), 1);
        assert!(s.chunk(&Point3::new(2, 0, 0)).is_none());
        assert!(s.is_occupied(&Point3::new(1, 0, 0)));
    }

    #[test]
    fn test_offset_follows_drone_motion() {
        let s = storage(8);
        commit(&s, Vector3::new(10.0, 20.0, -5.0), &[]);
        assert_eq!(s.grid_origin(), Some(Vector3::new(10.0, 20.0, -5.0)));

        // 1m north, 0.5m east, 1m up with 0.5m voxels
        let mut tx = s.start_transaction(&Vector3::new(11.0, 20.5, -6.0));
        assert_eq!(tx.offset(), Vector3::new(-1, 2, 2));
        tx.add_point(&Point3::new(0, 0, 0));
        tx.end_transaction();

        assert!(s.is_occupied(&Point3::new(-1, 2, 2)));
        assert!(!s.is_occupied(&Point3::new(0, 0, 0)));
    }

    #[test]
    fn test_dropped_transaction_leaves_grid_untouched() {
        let s = storage(8);
        commit(&s, Vector3::zeros(), &[(0, 0, 0)]);
        {
            let mut tx = s.start_transaction(&Vector3::zeros());
            tx.add_point(&Point3::new(9, 9, 9));
            assert_eq!(tx.pending_chunks(), 1);
        }
        assert_eq!(s.current_version(), 1);
        assert!(s.is_occupied(&Point3::new(0, 0, 0)));
        assert!(!s.is_occupied(&Point3::new(9, 9, 9)));
    }

    #[test]
    fn test_evicted_watermark_resyncs_everything() {
        let s = storage(2);
        commit(&s, Vector3::zeros(), &[(0, 0, 0), (4, 0, 0)]);
        commit(&s, Vector3::zeros(), &[(0, 0, 0), (4, 0, 0)]);
        commit(&s, Vector3::zeros(), &[(0, 0, 0), (4, 0, 0)]);

        let mut watermark = 1;
        let changed = s.updated_chunks(&mut watermark);
        assert_eq!(changed, s.all_chunk_keys());
        assert_eq!(changed.len(), 2);
        assert_eq!(watermark, 4);
    }

    #[test]
    fn test_future_watermark_is_empty() {
        let s = storage(2);
        commit(&s, Vector3::zeros(), &[(0, 0, 0)]);
        let mut watermark = 9;
        assert!(s.updated_chunks(&mut watermark).is_empty());
        assert_eq!(watermark, 9);
    }

    #[test]
    fn test_convert_world_position_floors() {
        let s = storage(2);
        let (chunk, voxel) = s.convert_world_position(&Vector3::new(-0.5, 3.9, 4.0));
        assert_eq!(voxel, Point3::new(-1, 3, 4));
        assert_eq!(chunk, Point3::new(-1, 0, 1));
    }

    #[test]
    fn test_concurrent_readers_during_commits() {
        let s = Arc::new(storage(4));
        let writer = {
            let s = Arc::clone(&s);
            std::thread::spawn(move || {
                for i in 0..50 {
                    commit(&s, Vector3::zeros(), &[(i % 8, 0, 0)]);
                }
            })
        };
        let mut watermark = 1;
        while s.current_version() < 50 {
            for key in s.updated_chunks(&mut watermark) {
                let _ = s.chunk(&key);
            }
        }
        writer.join().unwrap();
        assert_eq!(s.current_version(), 50);
    }
}
