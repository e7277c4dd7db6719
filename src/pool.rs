//! Pooled staging buffers for enumeration.
//!
//! Copying a bucket out of a live table needs a scratch buffer for the pairs.
//! Allocating one per bucket would dwarf the copy itself, so the map keeps a
//! small shelf of used buffers around. Renting hands out exclusive ownership;
//! the buffer comes back on every exit path, including an enumerator dropped
//! half way through.

use parking_lot::Mutex;

/// The initial capacity of a staging buffer.
const INITIAL_STAGING: usize = 32;
/// The maximal number of parked buffers.
const SHELF_LIMIT: usize = 8;

/// A shared pool of `(key, value)` staging buffers.
pub struct Pool<K, V> {
    /// The parked buffers.
    shelf: Mutex<Vec<Vec<(K, V)>>>,
}

impl<K, V> Pool<K, V> {
    /// Create an empty pool.
    pub fn new() -> Pool<K, V> {
        Pool {
            shelf: Mutex::new(Vec::new()),
        }
    }

    /// Take a buffer out of the pool, or allocate a fresh one.
    ///
    /// The returned buffer is empty and has room for at least
    /// `INITIAL_STAGING` pairs.
    pub fn rent(&self) -> Vec<(K, V)> {
        self.shelf
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(INITIAL_STAGING))
    }

    /// Park a buffer for reuse.
    ///
    /// The buffer is cleared, and dropped instead if the shelf is full.
    pub fn hand_back(&self, mut stage: Vec<(K, V)>) {
        stage.clear();

        let mut shelf = self.shelf.lock();
        if shelf.len() < SHELF_LIMIT {
            shelf.push(stage);
        }
    }
}
