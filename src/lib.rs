//! Striped hash maps with lock-free reads.
//!
//! This crate implements a concurrent associative array for the
//! single-writer, many-reader regime: one thread (at a time) mutates the map,
//! while any number of threads look keys up and enumerate pairs without ever
//! taking a lock. The design goal is holding millions of pairs with modest
//! memory overhead and steady allocation behavior¹, not general multi-writer
//! concurrency; for that, use a hash map built on bucket-level locks.
//!
//! The map is striped over a prime number of *segments*, each a small
//! open-chaining hash table with a dense entry pool and 16-bit chain links.
//! An operation hashes its key, routes to a segment, and runs there. Readers
//! are coordinated with the writer through per-bucket-group version words (a
//! seqlock discipline): a racing read is detected and retried rather than
//! ever blocking the writer. As segments fill up, the map re-stripes itself
//! over more segments; as it empties, over fewer.
//!
//! Keys and values are plain data (`Copy`): the map stores them inline in the
//! segment pools, copies them out of racing reads only after validation, and
//! never runs destructors. Store an `Option` to represent absent values.
//!
//! Every mutating operation serializes on an internal mutex, so the map can
//! be shared freely; the cost is that writes contend with each other, which
//! the intended workloads (read-mostly, low removal rate) do not mind.
//!
//! ¹No single allocation crosses the large-allocation threshold (85 000
//!  bytes) while the map can still split instead, keeping segment pools
//!  cache-friendly and reallocation pauses bounded.

#[macro_use]
extern crate quick_error;
#[macro_use]
extern crate slog;
extern crate arc_swap;
extern crate atomic_memcpy;
extern crate parking_lot;
extern crate seahash;
#[cfg(test)]
extern crate rand;

mod ops;
mod pool;
mod prime;
mod segment;


pub use ops::{KeyOps, Sea};
pub use segment::{max_capacity_before_large, LARGE_ALLOCATION, MAX_CAPACITY};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use slog::{Discard, Logger};
use std::hash::Hash;
use std::sync::Arc;
use std::{cmp, fmt, iter};

use pool::Pool;
use segment::{Segment, Table};

/// The fewest segments a map stripes over.
const MINIMUM_SEGMENTS: usize = 7;
/// The smallest capacity a segment is created with.
const MINIMUM_SEGMENT_CAPACITY: usize = 16;
/// The capacity `new` constructs with.
const DEFAULT_CAPACITY: usize = 128;
/// The targeted fill of a segment pool, as a fraction of the pool fence.
const OPTIMAL_NUM: usize = 9;
const OPTIMAL_DENOM: usize = 10;
/// The capacity growth factor of a re-stripe, as a fraction.
const GROW_NUM: usize = 7;
const GROW_DENOM: usize = 4;
/// The occupancy below which the map shrinks, as a fraction of capacity.
const SHRINK_NUM: usize = 2;
const SHRINK_DENOM: usize = 5;
/// How many times a growing re-stripe is retried with a bigger capacity.
const MAX_RESIZE_ATTEMPTS: usize = 3;
/// The number of adds a failed re-stripe cycle suppresses further cycles for.
const RESIZE_COOLDOWN: usize = 1000;

quick_error! {
    /// A map operation failure.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Error {
        /// `add` was called with a key the map already holds.
        DuplicateKey {
            display("the key is already in the map")
        }
        /// `lookup` was called with a key the map does not hold.
        KeyNotFound {
            display("the key is not in the map")
        }
        /// A segment ran into its entry-index ceiling, even after a full
        /// re-stripe cycle.
        ///
        /// The map is left exactly as it was before the failing insert.
        CapacityExceeded {
            display("a segment hit its entry-index ceiling")
        }
    }
}

/// The stripe directory: one generation of the segment array.
///
/// The directory is immutable in shape. Re-striping builds a whole new
/// directory and publishes it with one atomic swap; readers and enumerators
/// that loaded the old one simply finish on it.
struct Stripes<K, V> {
    /// The segments, in routing order.
    segments: Box<[Segment<K, V>]>,
}

impl<K: Copy, V: Copy> Stripes<K, V> {
    /// Build an empty directory sized for `desired` pairs.
    ///
    /// The segment count is the next prime fitting `desired` at the optimal
    /// per-segment fill, and at least `MINIMUM_SEGMENTS`. The segments
    /// initialize lazily to their share of `desired`.
    fn blank(desired: usize) -> Stripes<K, V> {
        let fence = max_capacity_before_large::<K, V>();
        let optimal = fence * OPTIMAL_NUM / OPTIMAL_DENOM;
        let count = cmp::max(MINIMUM_SEGMENTS, prime::next_prime(desired / optimal));
        let per = cmp::max(MINIMUM_SEGMENT_CAPACITY, desired / count);

        let mut segments = Vec::with_capacity(count);
        for _ in 0..count {
            segments.push(Segment::new(per));
        }

        Stripes {
            segments: segments.into_boxed_slice(),
        }
    }

    /// The number of live pairs, summed over the segments.
    fn len(&self) -> usize {
        self.segments
            .iter()
            .fold(0, |sum, segment| sum + segment.live())
    }

    /// The nominal capacity: segments times the per-segment working size.
    fn capacity(&self) -> usize {
        self.segments.len() * max_capacity_before_large::<K, V>()
    }
}

/// The writer-only bookkeeping, kept under the write mutex.
struct Writer {
    /// Adds left before another growing re-stripe may be attempted.
    ///
    /// Zero means no cooldown is active. The counter is armed when a full
    /// re-stripe cycle fails and drained by one on every subsequent add.
    cooldown: usize,
}

/// A striped hash map with lock-free reads.
///
/// See the crate documentation for the design. In short: reads and
/// enumeration never block and never lock; mutations serialize on an internal
/// mutex; keys and values are inline plain data.
///
/// The map is generic over a [`KeyOps`](trait.KeyOps.html) capability
/// bundling hashing and equality; the default, [`Sea`](struct.Sea.html),
/// covers any `Hash + Eq` key with SeaHash.
pub struct SeqMap<K, V, C = Sea> {
    /// The current stripe directory.
    stripes: ArcSwap<Stripes<K, V>>,
    /// The writer serialization and bookkeeping.
    writer: Mutex<Writer>,
    /// The staging buffers for enumeration.
    pool: Pool<K, V>,
    /// The hash/equality capability.
    ops: C,
    /// The log output.
    log: Logger,
}

impl<K: Copy + Hash + Eq, V: Copy> SeqMap<K, V, Sea> {
    /// Create a map with the default capacity.
    pub fn new() -> SeqMap<K, V, Sea> {
        SeqMap::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a map sized for `capacity` pairs.
    ///
    /// A map stays at its construction size as long as it holds at most
    /// `capacity` pairs (under a reasonably distributed hash); beyond that it
    /// re-stripes itself as needed.
    pub fn with_capacity(capacity: usize) -> SeqMap<K, V, Sea> {
        SeqMap::with_ops(capacity, Sea)
    }
}

impl<K: Copy, V: Copy, C: KeyOps<K>> SeqMap<K, V, C> {
    /// Create a map with a custom key capability.
    pub fn with_ops(capacity: usize, ops: C) -> SeqMap<K, V, C> {
        SeqMap::with_logger(capacity, ops, Logger::root(Discard, o!()))
    }

    /// Create a map with a custom key capability and log output.
    ///
    /// The map logs structurally, in the `debug`/`warn` range, and only on
    /// cold paths (construction and re-stripes).
    pub fn with_logger(capacity: usize, ops: C, log: Logger) -> SeqMap<K, V, C> {
        let stripes = Stripes::blank(capacity);
        debug!(log, "creating the map";
               "segments" => stripes.segments.len(),
               "capacity" => stripes.capacity());

        SeqMap {
            stripes: ArcSwap::from_pointee(stripes),
            writer: Mutex::new(Writer { cooldown: 0 }),
            pool: Pool::new(),
            ops: ops,
            log: log,
        }
    }

    /// Route a key to its hash.
    fn hash(&self, key: &K) -> usize {
        ops::mask(self.ops.hash(key))
    }

    /// Insert a pair if the key is absent.
    ///
    /// Returns true if the pair went in, and false (leaving the stored value
    /// untouched) if the key was already there.
    pub fn try_add(&self, key: K, value: V) -> Result<bool, Error> {
        let hash = self.hash(&key);
        let mut writer = self.writer.lock();
        let stripes = self.stripes.load_full();

        let index = hash % stripes.segments.len();
        let added = stripes.segments[index].insert(key, value, hash, false, &self.ops)?;
        if added {
            self.tend_growth(&mut writer, &stripes, index);
        }

        Ok(added)
    }

    /// Insert a pair the map must not already hold.
    ///
    /// Fails with `DuplicateKey`, leaving the stored value untouched, if
    /// the key was already there.
    pub fn add(&self, key: K, value: V) -> Result<(), Error> {
        if self.try_add(key, value)? {
            Ok(())
        } else {
            Err(Error::DuplicateKey)
        }
    }

    /// Insert or overwrite a pair.
    pub fn set(&self, key: K, value: V) -> Result<(), Error> {
        let hash = self.hash(&key);
        let mut writer = self.writer.lock();
        let stripes = self.stripes.load_full();

        let index = hash % stripes.segments.len();
        let added = stripes.segments[index].insert(key, value, hash, true, &self.ops)?;
        if added {
            self.tend_growth(&mut writer, &stripes, index);
        }

        Ok(())
    }

    /// Remove a pair.
    ///
    /// Returns true if the key was in the map.
    pub fn remove(&self, key: &K) -> bool {
        let hash = self.hash(key);
        let _writer = self.writer.lock();
        let stripes = self.stripes.load_full();

        let index = hash % stripes.segments.len();
        let removed = stripes.segments[index].remove(key, hash, &self.ops);
        if removed {
            self.tend_shrink(&stripes);
        }

        removed
    }

    /// Look a key up.
    ///
    /// Lock-free: the read retries past concurrent mutations of its bucket
    /// instead of ever blocking the writer.
    pub fn get(&self, key: &K) -> Option<V> {
        let hash = self.hash(key);
        let stripes = self.stripes.load();

        let index = hash % stripes.segments.len();
        stripes.segments[index].get(key, hash, &self.ops)
    }

    /// Does the map hold this key?
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Look a key up, failing with `KeyNotFound` if it is absent.
    pub fn lookup(&self, key: &K) -> Result<V, Error> {
        self.get(key).ok_or(Error::KeyNotFound)
    }

    /// The number of live pairs.
    ///
    /// Under concurrent mutation the figure is advisory: it sums per-segment
    /// counters without stopping the writer.
    pub fn len(&self) -> usize {
        self.stripes.load().len()
    }

    /// Is the map empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The nominal capacity.
    ///
    /// This is the segment count times the per-segment working size; the map
    /// re-stripes itself when its occupancy leaves the band around this
    /// figure, so the value moves in steps as the map grows and shrinks.
    pub fn capacity(&self) -> usize {
        self.stripes.load().capacity()
    }

    /// The number of segments.
    pub fn segments(&self) -> usize {
        self.stripes.load().segments.len()
    }

    /// Has any segment pool outgrown the large-allocation threshold?
    ///
    /// This only happens when a single segment is forced past its working
    /// size (e.g. by a badly clustering hash) faster than re-striping can
    /// spread the load.
    pub fn has_large_allocations(&self) -> bool {
        self.stripes
            .load()
            .segments
            .iter()
            .any(|segment| segment.footprint() > LARGE_ALLOCATION)
    }

    /// Enumerate the pairs.
    ///
    /// The enumeration is a weakly consistent snapshot, taken bucket by
    /// bucket: no pair is yielded twice, no pair is fabricated, and a pair
    /// that stays put (same key, same bucket) for the whole enumeration is
    /// yielded. Pairs inserted or removed while the enumeration runs may or
    /// may not appear. The iterator never blocks the writer.
    pub fn iter(&self) -> Iter<K, V> {
        Iter {
            stripes: self.stripes.load_full(),
            pool: &self.pool,
            segment: 0,
            table: None,
            bucket: 0,
            stage: Some(self.pool.rent()),
            cursor: 0,
        }
    }

    /// React to a completed add: drain the cooldown, or grow the directory.
    ///
    /// A growing re-stripe is due when the just-touched segment's pool
    /// reached its working size. Up to `MAX_RESIZE_ATTEMPTS` capacities are
    /// tried, each the previous grown by the growth factor; if every attempt
    /// overflows a segment, the cooldown is armed instead.
    fn tend_growth(&self, writer: &mut Writer, stripes: &Stripes<K, V>, index: usize) {
        if writer.cooldown > 0 {
            writer.cooldown -= 1;
            return;
        }

        if stripes.segments[index].used() < max_capacity_before_large::<K, V>() {
            return;
        }

        let mut desired = stripes.capacity();
        for _ in 0..MAX_RESIZE_ATTEMPTS {
            desired = desired * GROW_NUM / GROW_DENOM;
            if self.resize(stripes, desired).is_ok() {
                return;
            }
        }

        warn!(self.log, "every growing re-stripe overflowed a segment; cooling down";
              "adds" => RESIZE_COOLDOWN);
        writer.cooldown = RESIZE_COOLDOWN;
    }

    /// React to a completed remove: shrink the directory if it got sparse.
    ///
    /// One attempt at half the capacity, and only while there is something to
    /// fold away; a failed attempt is simply dropped.
    fn tend_shrink(&self, stripes: &Stripes<K, V>) {
        if stripes.segments.len() <= MINIMUM_SEGMENTS {
            return;
        }

        let capacity = stripes.capacity();
        if stripes.len() * SHRINK_DENOM > capacity * SHRINK_NUM {
            return;
        }

        let _ = self.resize(stripes, capacity / 2);
    }

    /// Re-stripe the map over a directory sized for `desired` pairs.
    ///
    /// Builds the new segments, pours every pair over, and publishes the new
    /// directory with one swap; readers keep working against the old one
    /// until then. Fails (leaving the map untouched) when some new segment
    /// would overflow its entry-index ceiling during the pour.
    fn resize(&self, stripes: &Stripes<K, V>, desired: usize) -> Result<(), Error> {
        let fence = max_capacity_before_large::<K, V>();
        let optimal = fence * OPTIMAL_NUM / OPTIMAL_DENOM;
        let count = cmp::max(MINIMUM_SEGMENTS, prime::next_prime(desired / optimal));
        if count == stripes.segments.len() {
            // Same shape; nothing to redistribute.
            return Ok(());
        }

        let per = cmp::max(MINIMUM_SEGMENT_CAPACITY, desired / count);
        let mut fresh = Vec::with_capacity(count);
        for _ in 0..count {
            fresh.push(Segment::new(per));
        }

        for segment in stripes.segments.iter() {
            segment.scan(|key, value| {
                let hash = ops::mask(self.ops.hash(&key));
                fresh[hash % count].add_unsafe(key, value, hash, &self.ops)
            })?;
        }

        let fresh = Stripes {
            segments: fresh.into_boxed_slice(),
        };
        debug!(self.log, "re-striped the map";
               "segments" => count,
               "capacity" => fresh.capacity());
        self.stripes.store(Arc::new(fresh));

        Ok(())
    }
}

impl<K: Copy + Hash + Eq, V: Copy> Default for SeqMap<K, V, Sea> {
    fn default() -> SeqMap<K, V, Sea> {
        SeqMap::new()
    }
}

impl<K: Copy + fmt::Debug, V: Copy + fmt::Debug, C: KeyOps<K>> fmt::Debug for SeqMap<K, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (key, value) in self {
            write!(f, "{:?} => {:?}", key, value)?;
        }

        Ok(())
    }
}

impl<K: Copy + Hash + Eq, V: Copy> iter::FromIterator<(K, V)> for SeqMap<K, V, Sea> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> SeqMap<K, V, Sea> {
        // We need the length to size the map up front.
        let vec: Vec<_> = iter.into_iter().collect();

        let map = SeqMap::with_capacity(vec.len());
        for (key, value) in vec {
            // Overflow takes a segment pinned past its ceiling, which a
            // growable directory does not produce under an honest hash.
            map.set(key, value)
                .expect("a segment overflowed while collecting");
        }

        map
    }
}

impl<'a, K: Copy + 'a, V: Copy + 'a, C: KeyOps<K>> IntoIterator for &'a SeqMap<K, V, C> {
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Iter<'a, K, V> {
        self.iter()
    }
}

/// An enumeration of a map's pairs.
///
/// See [`SeqMap::iter`](struct.SeqMap.html#method.iter) for the consistency
/// guarantees. The iterator pins the directory generation it started on and
/// stages one bucket at a time through a pooled buffer, which goes back to
/// the pool on every exit path.
pub struct Iter<'a, K: 'a, V: 'a> {
    /// The pinned directory generation.
    stripes: Arc<Stripes<K, V>>,
    /// Where the staging buffer goes back to.
    pool: &'a Pool<K, V>,
    /// The next segment to enter.
    segment: usize,
    /// The pinned table of the segment being walked.
    table: Option<Arc<Table<K, V>>>,
    /// The next bucket to copy.
    bucket: usize,
    /// The staged bucket; `None` once handed back.
    stage: Option<Vec<(K, V)>>,
    /// The yield position within the stage.
    cursor: usize,
}

impl<'a, K: Copy + 'a, V: Copy + 'a> Iterator for Iter<'a, K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            // Drain the staged bucket first.
            {
                let stage = match self.stage {
                    Some(ref stage) => stage,
                    None => return None,
                };

                if self.cursor < stage.len() {
                    let pair = stage[self.cursor];
                    self.cursor += 1;
                    return Some(pair);
                }
            }

            // The stage ran dry; move to the next bucket, entering the next
            // segment (pinning its table) when the buckets run out.
            let exhausted = match self.table {
                Some(ref table) => self.bucket >= table.width(),
                None => true,
            };

            if exhausted {
                if self.segment >= self.stripes.segments.len() {
                    if let Some(stage) = self.stage.take() {
                        self.pool.hand_back(stage);
                    }

                    return None;
                }

                self.table = self.stripes.segments[self.segment].snapshot();
                self.segment += 1;
                self.bucket = 0;
                continue;
            }

            if let Some(ref table) = self.table {
                if let Some(ref mut stage) = self.stage {
                    table.fill_from_bucket(self.bucket, stage);
                }
            }
            self.bucket += 1;
            self.cursor = 0;
        }
    }
}

impl<'a, K: 'a, V: 'a> Drop for Iter<'a, K, V> {
    fn drop(&mut self) {
        if let Some(stage) = self.stage.take() {
            self.pool.hand_back(stage);
        }
    }
}
