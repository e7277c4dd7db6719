//! The segment: one shard of the striped map.
//!
//! A segment is a small open-chaining hash table with a twist: readers take
//! no locks at all. The writer stamps a version word before and after every
//! bucket mutation, and readers bracket their traversal with loads of that
//! word, throwing the read away and retrying whenever the word moved. Since
//! the writer is serialized externally (the map wraps every mutation in one
//! mutex), the protocol only has to defend readers against the one writer.
//!
//! # Layout
//!
//! The table state is three parallel allocations bundled into one handle:
//!
//! - `entries`: a dense pool of slots, each holding a key, a value and a
//!   16-bit `next` link (`-1` ends a chain). A slot is either live (reachable
//!   from exactly one bucket) or parked on the free list, which is threaded
//!   through the same `next` links.
//! - `buckets`: 16-bit chain heads, one per pool slot.
//! - `versions`: one 32-bit word per four consecutive buckets. Bit 31 flags a
//!   mutation in progress; the low 31 bits count completed mutations.
//!
//! The 16-bit links halve the footprint of a slot and put a hard ceiling of
//! `MAX_CAPACITY` entries on a segment; the striped directory above responds
//! by adding segments rather than ever relaxing the index width.
//!
//! The handle is immutable in shape: growing the pool builds a whole new
//! handle and publishes it with one atomic swap. A reader keeps the handle it
//! started with, so its traversal is always consistent with one table shape,
//! and the old handle is freed when the last such reader lets go.
//!
//! # Torn reads
//!
//! A slot is *not* read atomically. Keys and values are copied field by
//! field, and a copy that raced the writer may interleave two generations of
//! the slot. The version word is what makes this sound: the reader re-checks
//! it after every field load and only materializes the copied bytes once the
//! bracket closed unchanged, so a torn copy is discarded while still inert.

use arc_swap::ArcSwapOption;
use atomic_memcpy::{atomic_load, atomic_store};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{self, AtomicI16, AtomicU32, AtomicUsize};
use std::sync::Arc;
use std::{cmp, hint, mem, ptr};

use ops::{self, KeyOps};
use prime;
use Error;

/// The hard ceiling on entries in one segment.
///
/// This is the largest prime below `i16::MAX`, the last pool size the 16-bit
/// chain links can address.
pub const MAX_CAPACITY: usize = 32749;

/// The large-allocation threshold in bytes.
///
/// No single pool allocation should cross this boundary while the segment can
/// still be split instead. The figure matches the large-object tier of the
/// common generational collectors; here it survives as a cache-locality cap
/// on how big one contiguous pool gets.
pub const LARGE_ALLOCATION: usize = 85_000;

/// The number of buckets sharing one version word.
const GROUP: usize = 4;
/// The mutation-in-progress bit of a version word.
const WRITE_FLAG: u32 = 1 << 31;
/// The counter bits of a version word.
const VERSION_MASK: u32 = !WRITE_FLAG;
/// The end-of-chain (and empty-bucket, and empty-free-list) marker.
const NIL: i16 = -1;
/// The growth factor of the entry pool, as a fraction.
const EXPAND_NUM: usize = 3;
const EXPAND_DENOM: usize = 2;
/// The ceiling on the exponential retry back-off shift.
const SPIN_LIMIT: u32 = 6;

/// The largest pool size that stays below the large-allocation threshold.
///
/// This is the preferred working size of a segment: pools first grow up to
/// it, and the directory above splits the map into more segments once one is
/// reached. The value depends on the slot footprint and is clamped into
/// `[17, MAX_CAPACITY]`, so oversized values degenerate gracefully into tiny
/// (but legal) segments.
pub fn max_capacity_before_large<K, V>() -> usize {
    let slot = mem::size_of::<Slot<K, V>>();
    let bound = LARGE_ALLOCATION / slot;

    if bound >= MAX_CAPACITY {
        MAX_CAPACITY
    } else {
        cmp::max(prime::prev_prime(cmp::max(bound, 2)), 17)
    }
}

/// Spin for a short, growing while.
///
/// This is the pause between seqlock retries. The writer's critical sections
/// are a handful of stores, so the first retries come almost immediately;
/// the shift cap keeps the pause bounded under a pathologically busy writer.
fn patience(step: &mut u32) {
    for _ in 0..1u32 << cmp::min(*step, SPIN_LIMIT) {
        hint::spin_loop();
    }

    *step += 1;
}

/// One slot of the entry pool.
///
/// Only `next` is a machine atomic; the key and value cells are copied with
/// per-field atomic memcpys and validated through the version protocol.
struct Slot<K, V> {
    /// The stored key, if the slot is live.
    key: UnsafeCell<MaybeUninit<K>>,
    /// The stored value, if the slot is live.
    value: UnsafeCell<MaybeUninit<V>>,
    /// The next slot in the chain (or free list), or `NIL`.
    next: AtomicI16,
}

impl<K, V> Slot<K, V> {
    /// An unoccupied slot.
    fn vacant() -> Slot<K, V> {
        Slot {
            key: UnsafeCell::new(MaybeUninit::uninit()),
            value: UnsafeCell::new(MaybeUninit::uninit()),
            next: AtomicI16::new(NIL),
        }
    }

    /// Borrow the stored key.
    ///
    /// Only the writer may call this, and only on a live slot: readers must
    /// go through the copying protocol instead of forming references.
    unsafe fn key_ref(&self) -> &K {
        &*(*self.key.get()).as_ptr()
    }

    /// Copy the stored key out.
    ///
    /// Same contract as `key_ref`.
    unsafe fn key_out(&self) -> K {
        (*self.key.get()).as_ptr().read()
    }

    /// Copy the stored value out.
    ///
    /// Same contract as `key_ref`.
    unsafe fn value_out(&self) -> V {
        (*self.value.get()).as_ptr().read()
    }
}

/// The table state of a segment: pool, chain heads and version words.
pub struct Table<K, V> {
    /// The chain heads; `NIL` marks an empty bucket.
    buckets: Box<[AtomicI16]>,
    /// The version words, one per `GROUP` buckets (plus slack).
    versions: Box<[AtomicU32]>,
    /// The slot pool.
    entries: Box<[Slot<K, V>]>,
}

// Readers never form references into the cells; every concurrent access is a
// validated atomic copy of plain (`Copy`) data, so sharing the table is fine.
unsafe impl<K: Copy + Send, V: Copy + Send> Sync for Table<K, V> {}

impl<K: Copy, V: Copy> Table<K, V> {
    /// Allocate an empty table with `n` slots and buckets.
    fn new(n: usize) -> Table<K, V> {
        let mut buckets = Vec::with_capacity(n);
        let mut entries = Vec::with_capacity(n);
        for _ in 0..n {
            buckets.push(AtomicI16::new(NIL));
            entries.push(Slot::vacant());
        }

        let words = (n + GROUP - 1) / GROUP + 1;
        let mut versions = Vec::with_capacity(words);
        for _ in 0..words {
            versions.push(AtomicU32::new(0));
        }

        Table {
            buckets: buckets.into_boxed_slice(),
            versions: versions.into_boxed_slice(),
            entries: entries.into_boxed_slice(),
        }
    }

    /// The number of buckets.
    pub fn width(&self) -> usize {
        self.buckets.len()
    }

    /// Flag the bucket group as mutation-in-progress.
    ///
    /// The flag is set with an acquire RMW, so the field stores of the
    /// mutation cannot become visible before the flag itself.
    fn begin_write(&self, group: usize) {
        self.versions[group].fetch_or(WRITE_FLAG, atomic::Ordering::Acquire);
    }

    /// Clear the flag and count the mutation.
    ///
    /// The release store fences all the field stores of the mutation before
    /// the new version value.
    fn end_write(&self, group: usize) {
        let version = self.versions[group].load(atomic::Ordering::Relaxed);
        self.versions[group].store(
            ((version & VERSION_MASK) + 1) & VERSION_MASK,
            atomic::Ordering::Release,
        );
    }

    /// One optimistic pass over a bucket's chain.
    ///
    /// `stamp` is the version word observed before the pass, with the write
    /// flag clear. Every field load is followed by a re-check of the word;
    /// `Err(())` means the bracket broke and the pass must be retried. Any
    /// index read under an unbroken bracket is a valid pool index, since the
    /// writer only ever stores indices of this very table into it.
    fn try_find<C: KeyOps<K>>(
        &self,
        bucket: usize,
        group: usize,
        stamp: u32,
        key: &K,
        ops: &C,
    ) -> Result<Option<V>, ()> {
        let mut i = self.buckets[bucket].load(atomic::Ordering::Acquire);

        while i != NIL {
            let slot = &self.entries[i as usize];

            let candidate = unsafe { atomic_load(slot.key.get(), atomic::Ordering::Acquire) };
            if self.versions[group].load(atomic::Ordering::Acquire) != stamp {
                return Err(());
            }
            // The bracket held, so the copied bytes are a coherent live key.
            let candidate = unsafe { candidate.assume_init().assume_init() };

            if ops.eq(&candidate, key) {
                let value = unsafe { atomic_load(slot.value.get(), atomic::Ordering::Acquire) };
                if self.versions[group].load(atomic::Ordering::Acquire) != stamp {
                    return Err(());
                }

                return Ok(Some(unsafe { value.assume_init().assume_init() }));
            }

            let next = slot.next.load(atomic::Ordering::Acquire);
            if self.versions[group].load(atomic::Ordering::Acquire) != stamp {
                return Err(());
            }

            i = next;
        }

        // The closing check covers the head load of an empty or exhausted
        // chain.
        if self.versions[group].load(atomic::Ordering::Acquire) != stamp {
            return Err(());
        }

        Ok(None)
    }

    /// Copy a whole bucket into a staging buffer.
    ///
    /// This is the enumeration primitive: a seqlock'd linear copy of the
    /// chain under `bucket`, retried until one consistent snapshot lands in
    /// `stage`. If the chain outgrows the buffer, the buffer is doubled and
    /// the copy redone, so a successful return never holds a partial chain.
    pub fn fill_from_bucket(&self, bucket: usize, stage: &mut Vec<(K, V)>) {
        let group = bucket / GROUP;
        let mut step = 0;

        'attempt: loop {
            stage.clear();

            let stamp = self.versions[group].load(atomic::Ordering::Acquire);
            if stamp & WRITE_FLAG != 0 {
                patience(&mut step);
                continue;
            }

            let mut i = self.buckets[bucket].load(atomic::Ordering::Acquire);
            while i != NIL {
                let slot = &self.entries[i as usize];

                let key = unsafe { atomic_load(slot.key.get(), atomic::Ordering::Acquire) };
                if self.versions[group].load(atomic::Ordering::Acquire) != stamp {
                    patience(&mut step);
                    continue 'attempt;
                }

                let value = unsafe { atomic_load(slot.value.get(), atomic::Ordering::Acquire) };
                if self.versions[group].load(atomic::Ordering::Acquire) != stamp {
                    patience(&mut step);
                    continue 'attempt;
                }

                if stage.len() == stage.capacity() {
                    // The chain outgrew the buffer; double it and redo. This
                    // is our own fault, not contention, so no pause.
                    let capacity = cmp::max(stage.capacity(), 1);
                    stage.reserve(capacity);
                    continue 'attempt;
                }

                let pair = unsafe {
                    (
                        key.assume_init().assume_init(),
                        value.assume_init().assume_init(),
                    )
                };
                stage.push(pair);

                let next = slot.next.load(atomic::Ordering::Acquire);
                if self.versions[group].load(atomic::Ordering::Acquire) != stamp {
                    patience(&mut step);
                    continue 'attempt;
                }

                i = next;
            }

            if self.versions[group].load(atomic::Ordering::Acquire) == stamp {
                return;
            }

            patience(&mut step);
        }
    }

    /// Build a grown copy of `old` with `n` slots.
    ///
    /// The first `len` pool slots are moved over in one block, which carries
    /// the free-list links with them; the buckets are then rebuilt by
    /// re-hashing every live chain.
    fn rebuilt<C: KeyOps<K>>(old: &Table<K, V>, len: usize, n: usize, ops: &C) -> Table<K, V> {
        let mut fresh = Table::new(n);

        unsafe {
            ptr::copy_nonoverlapping(old.entries.as_ptr(), fresh.entries.as_mut_ptr(), len);
        }

        for bucket in old.buckets.iter() {
            let mut i = bucket.load(atomic::Ordering::Relaxed);
            while i != NIL {
                let slot = &old.entries[i as usize];
                let next = slot.next.load(atomic::Ordering::Relaxed);

                let hash = ops::mask(ops.hash(unsafe { slot.key_ref() }));
                let chain = &fresh.buckets[hash % n];
                fresh.entries[i as usize]
                    .next
                    .store(chain.load(atomic::Ordering::Relaxed), atomic::Ordering::Relaxed);
                chain.store(i, atomic::Ordering::Relaxed);

                i = next;
            }
        }

        fresh
    }
}

/// One shard of the striped map.
///
/// The scalars live outside the table handle: `len` is the slot watermark
/// (live plus freed), `free_len`/`free_head` describe the free list. Only the
/// (externally serialized) writer touches them; readers treat `len` and
/// `free_len` as advisory.
pub struct Segment<K, V> {
    /// The current table state; absent until the first write.
    table: ArcSwapOption<Table<K, V>>,
    /// The capacity the first write initializes the table to.
    boot: usize,
    /// The slot watermark.
    len: AtomicUsize,
    /// The number of slots parked on the free list.
    free_len: AtomicUsize,
    /// The head of the free list, or `NIL`.
    free_head: AtomicI16,
}

impl<K: Copy, V: Copy> Segment<K, V> {
    /// Create an empty segment which will initialize to around `boot` slots.
    pub fn new(boot: usize) -> Segment<K, V> {
        Segment {
            table: ArcSwapOption::empty(),
            boot: boot,
            len: AtomicUsize::new(0),
            free_len: AtomicUsize::new(0),
            free_head: AtomicI16::new(NIL),
        }
    }

    /// The number of live pairs.
    pub fn live(&self) -> usize {
        self.len
            .load(atomic::Ordering::Relaxed)
            .saturating_sub(self.free_len.load(atomic::Ordering::Relaxed))
    }

    /// The slot watermark: live pairs plus freed slots.
    pub fn used(&self) -> usize {
        self.len.load(atomic::Ordering::Relaxed)
    }

    /// The number of slots in the pool.
    pub fn capacity(&self) -> usize {
        match self.table.load_full() {
            Some(table) => table.entries.len(),
            None => 0,
        }
    }

    /// The size of the pool allocation in bytes.
    pub fn footprint(&self) -> usize {
        self.capacity() * mem::size_of::<Slot<K, V>>()
    }

    /// Snapshot the current table state, if any.
    pub fn snapshot(&self) -> Option<Arc<Table<K, V>>> {
        self.table.load_full()
    }

    /// Get the table, initializing it on the first write.
    fn acquire(&self) -> Arc<Table<K, V>> {
        if let Some(table) = self.table.load_full() {
            return table;
        }

        let n = cmp::min(
            prime::next_prime(self.boot),
            max_capacity_before_large::<K, V>(),
        );
        let table = Arc::new(Table::new(n));
        self.table.store(Some(table.clone()));

        table
    }

    /// Insert a pair.
    ///
    /// Returns true if a new pair was added, and false if the key was already
    /// in the segment, in which case the value is replaced iff `overwrite`.
    /// Fails when the pool cannot grow past `MAX_CAPACITY`, in which case
    /// nothing was inserted.
    pub fn insert<C: KeyOps<K>>(
        &self,
        key: K,
        value: V,
        hash: usize,
        overwrite: bool,
        ops: &C,
    ) -> Result<bool, Error> {
        let mut table = self.acquire();

        // Look for the key first. The writer is the only mutator, so plain
        // walks need no validation.
        let bucket = hash % table.entries.len();
        let mut i = table.buckets[bucket].load(atomic::Ordering::Relaxed);
        while i != NIL {
            let slot = &table.entries[i as usize];

            if ops.eq(unsafe { slot.key_ref() }, &key) {
                if overwrite {
                    let group = bucket / GROUP;
                    table.begin_write(group);
                    unsafe {
                        atomic_store(
                            slot.value.get(),
                            MaybeUninit::new(value),
                            atomic::Ordering::Relaxed,
                        );
                    }
                    table.end_write(group);
                }

                return Ok(false);
            }

            i = slot.next.load(atomic::Ordering::Relaxed);
        }

        // Pick a slot: a freed one if any, the next virgin slot otherwise,
        // and only grow the pool when both run out.
        let index;
        let free = self.free_len.load(atomic::Ordering::Relaxed);
        if free != 0 {
            index = self.free_head.load(atomic::Ordering::Relaxed);
            let slot = &table.entries[index as usize];
            self.free_head.store(
                slot.next.load(atomic::Ordering::Relaxed),
                atomic::Ordering::Release,
            );
            self.free_len.store(free - 1, atomic::Ordering::Release);
        } else {
            let len = self.len.load(atomic::Ordering::Relaxed);
            if len == table.entries.len() {
                table = self.grow(&table, ops)?;
            }

            index = len as i16;
            self.len.store(len + 1, atomic::Ordering::Release);
        }

        let bucket = hash % table.entries.len();
        let group = bucket / GROUP;
        let slot = &table.entries[index as usize];

        table.begin_write(group);
        unsafe {
            atomic_store(slot.key.get(), MaybeUninit::new(key), atomic::Ordering::Relaxed);
            atomic_store(
                slot.value.get(),
                MaybeUninit::new(value),
                atomic::Ordering::Relaxed,
            );
        }
        // The fields are in place before the slot becomes the chain head, so
        // a reader seeing the head sees a formed first link.
        slot.next.store(
            table.buckets[bucket].load(atomic::Ordering::Relaxed),
            atomic::Ordering::Relaxed,
        );
        table.buckets[bucket].store(index, atomic::Ordering::Release);
        table.end_write(group);

        Ok(true)
    }

    /// Remove a pair.
    ///
    /// Returns true if the key was in the segment. The freed slot is zeroed
    /// and parked on the free list.
    pub fn remove<C: KeyOps<K>>(&self, key: &K, hash: usize, ops: &C) -> bool {
        let table = match self.table.load_full() {
            Some(table) => table,
            None => return false,
        };

        let bucket = hash % table.entries.len();
        let mut previous = NIL;
        let mut i = table.buckets[bucket].load(atomic::Ordering::Relaxed);

        while i != NIL {
            let slot = &table.entries[i as usize];
            let next = slot.next.load(atomic::Ordering::Relaxed);

            if ops.eq(unsafe { slot.key_ref() }, key) {
                let group = bucket / GROUP;

                table.begin_write(group);
                if previous == NIL {
                    table.buckets[bucket].store(next, atomic::Ordering::Release);
                } else {
                    table.entries[previous as usize]
                        .next
                        .store(next, atomic::Ordering::Release);
                }
                // Zero the cells, so the recycled slot cannot leak the old
                // pair to a reader in mid-retry.
                unsafe {
                    atomic_store(slot.key.get(), MaybeUninit::zeroed(), atomic::Ordering::Relaxed);
                    atomic_store(
                        slot.value.get(),
                        MaybeUninit::zeroed(),
                        atomic::Ordering::Relaxed,
                    );
                }
                table.end_write(group);

                // Park the slot on the free list. The list is not reachable
                // from any bucket, so this needs no versioning.
                slot.next
                    .store(self.free_head.load(atomic::Ordering::Relaxed), atomic::Ordering::Relaxed);
                self.free_head.store(i, atomic::Ordering::Release);
                self.free_len.store(
                    self.free_len.load(atomic::Ordering::Relaxed) + 1,
                    atomic::Ordering::Release,
                );

                return true;
            }

            previous = i;
            i = next;
        }

        false
    }

    /// Look a key up without taking any lock.
    ///
    /// The read retries (with a growing pause) for as long as it keeps
    /// racing the writer; under the expected low write rate per bucket this
    /// terminates after a pass or two. The table handle is snapshotted once,
    /// so a concurrent pool growth does not disturb the traversal.
    pub fn get<C: KeyOps<K>>(&self, key: &K, hash: usize, ops: &C) -> Option<V> {
        let guard = self.table.load();
        let table = match *guard {
            Some(ref table) => table,
            None => return None,
        };

        let bucket = hash % table.entries.len();
        let group = bucket / GROUP;
        let mut step = 0;

        loop {
            let stamp = table.versions[group].load(atomic::Ordering::Acquire);
            if stamp & WRITE_FLAG == 0 {
                if let Ok(hit) = table.try_find(bucket, group, stamp, key, ops) {
                    return hit;
                }
            }

            patience(&mut step);
        }
    }

    /// Insert a pair, skipping the reader coordination.
    ///
    /// This is the redistribution path of a directory resize: the segment is
    /// freshly built and unreachable to any reader, every key is distinct,
    /// and no slot has ever been freed, so neither versioning nor the free
    /// list nor the duplicate scan apply. Fails when the pool cannot grow
    /// past `MAX_CAPACITY`, which aborts the resize.
    pub fn add_unsafe<C: KeyOps<K>>(
        &self,
        key: K,
        value: V,
        hash: usize,
        ops: &C,
    ) -> Result<(), Error> {
        let mut table = self.acquire();

        let len = self.len.load(atomic::Ordering::Relaxed);
        if len == table.entries.len() {
            table = self.grow(&table, ops)?;
        }

        let bucket = hash % table.entries.len();
        let slot = &table.entries[len];
        unsafe {
            *slot.key.get() = MaybeUninit::new(key);
            *slot.value.get() = MaybeUninit::new(value);
        }
        slot.next.store(
            table.buckets[bucket].load(atomic::Ordering::Relaxed),
            atomic::Ordering::Relaxed,
        );
        table.buckets[bucket].store(len as i16, atomic::Ordering::Relaxed);
        self.len.store(len + 1, atomic::Ordering::Relaxed);

        Ok(())
    }

    /// Walk every live pair on the writer side.
    ///
    /// This is the feed of a directory resize. Plain reads throughout; the
    /// caller holds the writer serialization.
    pub fn scan<F>(&self, mut f: F) -> Result<(), Error>
    where
        F: FnMut(K, V) -> Result<(), Error>,
    {
        let table = match self.table.load_full() {
            Some(table) => table,
            None => return Ok(()),
        };

        for bucket in table.buckets.iter() {
            let mut i = bucket.load(atomic::Ordering::Relaxed);
            while i != NIL {
                let slot = &table.entries[i as usize];
                f(unsafe { slot.key_out() }, unsafe { slot.value_out() })?;
                i = slot.next.load(atomic::Ordering::Relaxed);
            }
        }

        Ok(())
    }

    /// Grow the pool and publish the new table.
    ///
    /// The new size is the pool grown by half, except that a pool below the
    /// large-allocation fence lands exactly on the fence before crossing it,
    /// and nothing grows past `MAX_CAPACITY`.
    fn grow<C: KeyOps<K>>(&self, old: &Table<K, V>, ops: &C) -> Result<Arc<Table<K, V>>, Error> {
        let n = old.entries.len();
        if n >= MAX_CAPACITY {
            return Err(Error::CapacityExceeded);
        }

        let len = self.len.load(atomic::Ordering::Relaxed);
        let fence = max_capacity_before_large::<K, V>();
        let mut target = prime::next_prime(len * EXPAND_NUM / EXPAND_DENOM);
        if n < fence && target > fence {
            target = fence;
        }
        if target > MAX_CAPACITY {
            target = MAX_CAPACITY;
        }

        let table = Arc::new(Table::rebuilt(old, len, target, ops));
        self.table.store(Some(table.clone()));

        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Identity-ish key ops for deterministic routing.
    struct Plain;

    impl KeyOps<u64> for Plain {
        fn hash(&self, key: &u64) -> i32 {
            *key as i32
        }

        fn eq(&self, a: &u64, b: &u64) -> bool {
            a == b
        }
    }

    fn h(key: u64) -> usize {
        ops::mask(Plain.hash(&key))
    }

    #[test]
    fn insert_get_remove() {
        let segment: Segment<u64, u64> = Segment::new(16);

        for key in 0..64 {
            assert_eq!(segment.insert(key, !key, h(key), false, &Plain), Ok(true));
        }
        assert_eq!(segment.live(), 64);

        for key in 0..64 {
            assert_eq!(segment.get(&key, h(key), &Plain), Some(!key));
        }
        assert_eq!(segment.get(&64, h(64), &Plain), None);

        for key in 0..32 {
            assert!(segment.remove(&key, h(key), &Plain));
            assert_eq!(segment.get(&key, h(key), &Plain), None);
        }
        assert!(!segment.remove(&0, h(0), &Plain));
        assert_eq!(segment.live(), 32);
    }

    #[test]
    fn get_on_a_virgin_segment() {
        let segment: Segment<u64, u64> = Segment::new(16);
        assert_eq!(segment.get(&1, h(1), &Plain), None);
        assert_eq!(segment.capacity(), 0);
    }

    #[test]
    fn duplicate_keys_respect_the_overwrite_flag() {
        let segment: Segment<u64, u64> = Segment::new(16);

        assert_eq!(segment.insert(1, 100, h(1), false, &Plain), Ok(true));
        assert_eq!(segment.insert(1, 200, h(1), false, &Plain), Ok(false));
        assert_eq!(segment.get(&1, h(1), &Plain), Some(100));

        assert_eq!(segment.insert(1, 300, h(1), true, &Plain), Ok(false));
        assert_eq!(segment.get(&1, h(1), &Plain), Some(300));
        assert_eq!(segment.live(), 1);
    }

    #[test]
    fn freed_slots_are_recycled() {
        let segment: Segment<u64, u64> = Segment::new(16);

        for key in 0..11 {
            segment.insert(key, key, h(key), false, &Plain).unwrap();
        }
        assert_eq!(segment.used(), 11);

        assert!(segment.remove(&3, h(3), &Plain));
        assert_eq!(segment.used(), 11);
        assert_eq!(segment.live(), 10);

        // The freed slot is reused, so the watermark must not move.
        segment.insert(100, 100, h(100), false, &Plain).unwrap();
        assert_eq!(segment.used(), 11);
        assert_eq!(segment.live(), 11);
        assert_eq!(segment.get(&3, h(3), &Plain), None);
        assert_eq!(segment.get(&100, h(100), &Plain), Some(100));
    }

    #[test]
    fn growth_keeps_every_pair() {
        let segment: Segment<u64, u64> = Segment::new(4);
        let initial = {
            segment.insert(0, 0, h(0), false, &Plain).unwrap();
            segment.capacity()
        };

        for key in 1..500 {
            segment.insert(key, !key, h(key), false, &Plain).unwrap();
        }

        assert!(segment.capacity() > initial);
        for key in 0..500 {
            assert_eq!(segment.get(&key, h(key), &Plain), Some(!key));
        }
    }

    #[test]
    fn chains_collapse_into_one_bucket() {
        let segment: Segment<u64, u64> = Segment::new(16);
        let width = {
            segment.insert(0, 0, h(0), false, &Plain).unwrap();
            segment.snapshot().unwrap().width() as u64
        };

        // All of these collide into bucket zero.
        segment.insert(width, 1, h(width), false, &Plain).unwrap();
        segment
            .insert(width * 2, 2, h(width * 2), false, &Plain)
            .unwrap();

        let mut stage = Vec::with_capacity(8);
        segment.snapshot().unwrap().fill_from_bucket(0, &mut stage);
        stage.sort();
        assert_eq!(stage, vec![(0, 0), (width, 1), (width * 2, 2)]);

        // Unlink the middle link and copy again.
        assert!(segment.remove(&width, h(width), &Plain));
        let mut stage = Vec::with_capacity(8);
        segment.snapshot().unwrap().fill_from_bucket(0, &mut stage);
        stage.sort();
        assert_eq!(stage, vec![(0, 0), (width * 2, 2)]);
    }

    #[test]
    fn bucket_copies_outgrow_the_stage() {
        let segment: Segment<u64, u64> = Segment::new(16);
        segment.insert(0, 0, h(0), false, &Plain).unwrap();
        let width = segment.snapshot().unwrap().width() as u64;

        for link in 1..10 {
            segment
                .insert(width * link, link, h(width * link), false, &Plain)
                .unwrap();
        }

        // A two-slot buffer has to double its way up to the chain.
        let mut stage = Vec::with_capacity(2);
        segment.snapshot().unwrap().fill_from_bucket(0, &mut stage);
        assert_eq!(stage.len(), 10);
        assert!(stage.capacity() >= 10);
    }

    #[test]
    fn add_unsafe_feeds_a_fresh_segment() {
        let segment: Segment<u64, u64> = Segment::new(16);

        for key in 0..100 {
            segment.add_unsafe(key, key * 7, h(key), &Plain).unwrap();
        }

        assert_eq!(segment.live(), 100);
        for key in 0..100 {
            assert_eq!(segment.get(&key, h(key), &Plain), Some(key * 7));
        }
    }

    #[test]
    fn scan_visits_the_live_pairs() {
        let segment: Segment<u64, u64> = Segment::new(16);
        for key in 0..50 {
            segment.insert(key, !key, h(key), false, &Plain).unwrap();
        }
        segment.remove(&7, h(7), &Plain);

        let mut seen = Vec::new();
        segment
            .scan(|key, value| {
                seen.push((key, value));
                Ok(())
            })
            .unwrap();
        seen.sort();

        assert_eq!(seen.len(), 49);
        for &(key, value) in &seen {
            assert!(key != 7);
            assert_eq!(value, !key);
        }
    }

    #[test]
    fn the_writer_always_quiesces_the_versions() {
        let segment: Segment<u64, u64> = Segment::new(16);
        for key in 0..100 {
            segment.insert(key, key, h(key), false, &Plain).unwrap();
        }
        for key in 0..50 {
            segment.remove(&key, h(key), &Plain);
        }

        let table = segment.snapshot().unwrap();
        let mut bumped = 0;
        for version in table.versions.iter() {
            let version = version.load(atomic::Ordering::Relaxed);
            assert_eq!(version & WRITE_FLAG, 0);
            if version != 0 {
                bumped += 1;
            }
        }
        assert!(bumped > 0);
    }

    #[test]
    fn the_pool_hits_its_ceiling() {
        let segment: Segment<u64, u64> = Segment::new(16);

        for key in 0..MAX_CAPACITY as u64 {
            segment.insert(key, key, h(key), false, &Plain).unwrap();
        }
        assert_eq!(segment.live(), MAX_CAPACITY);
        assert_eq!(segment.capacity(), MAX_CAPACITY);

        let overflow = MAX_CAPACITY as u64;
        assert_eq!(
            segment.insert(overflow, overflow, h(overflow), false, &Plain),
            Err(Error::CapacityExceeded)
        );
        // The failed insert must not have touched anything.
        assert_eq!(segment.live(), MAX_CAPACITY);
        assert_eq!(segment.get(&overflow, h(overflow), &Plain), None);
    }

    #[test]
    fn the_fence_is_a_prime_below_the_threshold() {
        let fence = max_capacity_before_large::<u64, u64>();
        assert!(prime::is_prime(fence));
        assert!(fence <= MAX_CAPACITY);
        assert!(fence * mem::size_of::<Slot<u64, u64>>() <= LARGE_ALLOCATION);

        // Huge values degrade to the floor instead of zero.
        assert!(max_capacity_before_large::<u64, [u64; 4096]>() >= 17);
    }
}
