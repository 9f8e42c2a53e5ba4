use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Payload bytes per chunk.
pub const CHUNK_DATA_SIZE: usize = 1 << 16;
/// Header slots per chunk.
const CHUNK_SLOTS: usize = 1 << 12;

const CODED_ALPHABET: &[u8; 64] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_-";

fn coded_value(b: u8) -> Option<u64> {
    match b {
        b'a'..=b'z' => Some((b - b'a') as u64),
        b'A'..=b'Z' => Some((b - b'A') as u64 + 26),
        b'0'..=b'9' => Some((b - b'0') as u64 + 52),
        b'_' => Some(62),
        b'-' => Some(63),
        _ => None,
    }
}

pub fn content_hash(bytes: &[u8]) -> u64 {
    let mut h = DefaultHasher::new();
    bytes.hash(&mut h);
    h.finish()
}

/// An interned byte string.
///
/// Up to 7 arbitrary bytes, or up to 10 ASCII word characters, are packed
/// inline in a tagged 8-byte word and never touch a pool. Anything larger is
/// stored in a [`StringPool`] chunk and addressed as a `(chunk, slot)` pair
/// so the compactor is free to move the bytes underneath the handle.
#[derive(Clone)]
pub enum Sym {
    Small(u64),
    Pooled(PooledSym),
}

impl Sym {
    /// Inline-encode `bytes` if they fit one of the small formats.
    pub fn small(bytes: &[u8]) -> Option<Sym> {
        if bytes.len() < 8 {
            let mut data: u64 = ((bytes.len() as u64) << 2) | 0b01;
            for (i, b) in bytes.iter().enumerate() {
                data |= (*b as u64) << (8 * (i + 1));
            }
            return Some(Sym::Small(data));
        }
        if bytes.len() <= 10 {
            let mut data: u64 = (((bytes.len() - 8) as u64) << 2) | 0b11;
            for (i, b) in bytes.iter().enumerate() {
                data |= coded_value(*b)? << (4 + 6 * i);
            }
            return Some(Sym::Small(data));
        }
        None
    }

    pub fn len(&self) -> usize {
        match self {
            Sym::Small(data) => {
                if data & 0b10 != 0 {
                    (((data >> 2) & 0b11) + 8) as usize
                } else {
                    ((data >> 2) & 0b111) as usize
                }
            }
            Sym::Pooled(p) => p.len as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hash_value(&self) -> u64 {
        match self {
            Sym::Small(data) => *data,
            Sym::Pooled(p) => p.hash,
        }
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match self {
            Sym::Small(data) => {
                let mut buf = [0u8; 10];
                let len = self.len();
                if data & 0b10 != 0 {
                    let mut rest = data >> 4;
                    for slot in buf.iter_mut().take(len) {
                        *slot = CODED_ALPHABET[(rest & 63) as usize];
                        rest >>= 6;
                    }
                } else {
                    let mut rest = *data;
                    for slot in buf.iter_mut().take(len) {
                        rest >>= 8;
                        *slot = (rest & 255) as u8;
                    }
                }
                f(&buf[..len])
            }
            Sym::Pooled(p) => {
                let data = p.chunk.data.read().unwrap();
                let off = p.chunk.slots[p.slot as usize].off.load(Ordering::Acquire) as usize;
                f(&data.bytes[off..off + p.len as usize])
            }
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.with_bytes(|b| b.to_vec())
    }

    /// Lossy UTF-8 view; interned document text is UTF-8 except for `!!binary`
    /// payloads, which are only ever emitted as raw bytes.
    pub fn to_string_lossy(&self) -> String {
        self.with_bytes(|b| String::from_utf8_lossy(b).into_owned())
    }
}

impl PartialEq for Sym {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Sym::Small(a), Sym::Small(b)) => a == b,
            (Sym::Pooled(a), Sym::Pooled(b)) => {
                if Arc::ptr_eq(&a.chunk, &b.chunk) && a.slot == b.slot {
                    return true;
                }
                if a.hash != b.hash || a.len != b.len {
                    return false;
                }
                // Copy one side out so two chunk locks are never held at once.
                let lhs = Sym::Pooled(a.clone()).to_vec();
                Sym::Pooled(b.clone()).with_bytes(|rhs| lhs == rhs)
            }
            // Small strings never enter the pool, so the representations
            // cannot alias.
            _ => false,
        }
    }
}

impl Eq for Sym {}

impl Hash for Sym {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash_value());
    }
}

impl PartialEq<str> for Sym {
    fn eq(&self, other: &str) -> bool {
        self.len() == other.len() && self.with_bytes(|b| b == other.as_bytes())
    }
}

impl PartialEq<&str> for Sym {
    fn eq(&self, other: &&str) -> bool {
        self == *other
    }
}

impl std::fmt::Display for Sym {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl std::fmt::Debug for Sym {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

pub struct PooledSym {
    chunk: Arc<Chunk>,
    slot: u32,
    len: u32,
    hash: u64,
}

impl Clone for PooledSym {
    fn clone(&self) -> Self {
        self.chunk.slots[self.slot as usize]
            .refs
            .fetch_add(1, Ordering::Relaxed);
        PooledSym {
            chunk: Arc::clone(&self.chunk),
            slot: self.slot,
            len: self.len,
            hash: self.hash,
        }
    }
}

impl Drop for PooledSym {
    fn drop(&mut self) {
        let slot = &self.chunk.slots[self.slot as usize];
        if slot.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.chunk.released(self.len);
        }
    }
}

struct Slot {
    refs: AtomicU32,
    off: AtomicU32,
}

struct ChunkData {
    bytes: Box<[u8]>,
    next_off: usize,
    next_slot: usize,
    free_slots: Vec<u32>,
    /// (slot, len) of every allocation still occupying bytes, in offset order.
    allocated: Vec<(u32, u32)>,
}

pub struct Chunk {
    slots: Box<[Slot]>,
    data: RwLock<ChunkData>,
    fragmented: AtomicU32,
    live: AtomicU32,
    pool: Weak<PoolInner>,
}

impl Chunk {
    fn new(pool: Weak<PoolInner>) -> Arc<Chunk> {
        let slots = (0..CHUNK_SLOTS)
            .map(|_| Slot {
                refs: AtomicU32::new(0),
                off: AtomicU32::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(Chunk {
            slots,
            data: RwLock::new(ChunkData {
                bytes: vec![0u8; CHUNK_DATA_SIZE].into_boxed_slice(),
                next_off: 0,
                next_slot: 0,
                free_slots: Vec::new(),
                allocated: Vec::new(),
            }),
            fragmented: AtomicU32::new(0),
            live: AtomicU32::new(0),
            pool,
        })
    }

    fn released(&self, len: u32) {
        let fragmented = self.fragmented.fetch_add(len, Ordering::AcqRel) + len;
        let live = self.live.fetch_sub(1, Ordering::AcqRel) - 1;
        if live == 0 {
            if let Some(pool) = self.pool.upgrade() {
                pool.forget_chunk(self);
            }
        } else if fragmented as usize > CHUNK_DATA_SIZE / 2 {
            self.compact();
        }
    }

    /// Rewrite the chunk in place: copy survivors forward, update headers.
    /// Outstanding handles stay valid since they resolve offsets through the
    /// slot table on every read.
    fn compact(&self) {
        let mut data = self.data.write().unwrap();
        let mut write_off = 0usize;
        let mut survivors = Vec::with_capacity(data.allocated.len());
        let entries = std::mem::take(&mut data.allocated);
        for (slot_idx, len) in entries {
            let slot = &self.slots[slot_idx as usize];
            if slot.refs.load(Ordering::Acquire) == 0 {
                data.free_slots.push(slot_idx);
                continue;
            }
            let read_off = slot.off.load(Ordering::Acquire) as usize;
            data.bytes.copy_within(read_off..read_off + len as usize, write_off);
            slot.off.store(write_off as u32, Ordering::Release);
            write_off += len as usize;
            survivors.push((slot_idx, len));
        }
        data.allocated = survivors;
        data.next_off = write_off;
        self.fragmented.store(0, Ordering::Release);
        tracing::trace!(used = write_off, "compacted interner chunk");
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub strings: usize,
    pub chunks: usize,
    pub used_bytes: usize,
    pub fragmented_bytes: usize,
}

struct SetEntry {
    chunk: Arc<Chunk>,
    slot: u32,
    len: u32,
}

impl SetEntry {
    fn is_live(&self) -> bool {
        self.chunk.slots[self.slot as usize].refs.load(Ordering::Acquire) > 0
    }

    /// Bump the refcount if the string is still live; a zero count means the
    /// bytes are pending reclamation and must not be revived.
    fn acquire(&self, hash: u64) -> Option<PooledSym> {
        let refs = &self.chunk.slots[self.slot as usize].refs;
        let mut current = refs.load(Ordering::Acquire);
        while current > 0 {
            match refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(PooledSym {
                        chunk: Arc::clone(&self.chunk),
                        slot: self.slot,
                        len: self.len,
                        hash,
                    })
                }
                Err(seen) => current = seen,
            }
        }
        None
    }

    fn bytes_eq(&self, bytes: &[u8]) -> bool {
        if self.len as usize != bytes.len() {
            return false;
        }
        let data = self.chunk.data.read().unwrap();
        let off = self.chunk.slots[self.slot as usize].off.load(Ordering::Acquire) as usize;
        &data.bytes[off..off + bytes.len()] == bytes
    }
}

struct PoolInner {
    set: RwLock<HashMap<u64, Vec<SetEntry>>>,
    chunks: Mutex<Vec<Arc<Chunk>>>,
}

impl PoolInner {
    fn forget_chunk(&self, chunk: &Chunk) {
        let mut chunks = self.chunks.lock().unwrap();
        chunks.retain(|c| {
            !(std::ptr::eq(Arc::as_ptr(c), chunk) && c.live.load(Ordering::Acquire) == 0)
        });
    }
}

/// Per-namespace interning pool.
///
/// Hot-path lookups hold the set reader lock; insertion re-probes under the
/// writer lock so concurrent interns of the same content converge on one
/// handle.
#[derive(Clone)]
pub struct StringPool {
    inner: Arc<PoolInner>,
}

impl Default for StringPool {
    fn default() -> Self {
        StringPool::new()
    }
}

impl StringPool {
    pub fn new() -> Self {
        StringPool {
            inner: Arc::new(PoolInner {
                set: RwLock::new(HashMap::new()),
                chunks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn intern(&self, bytes: &[u8]) -> Sym {
        if let Some(sym) = Sym::small(bytes) {
            return sym;
        }
        let hash = content_hash(bytes);

        {
            let set = self.inner.set.read().unwrap();
            if let Some(sym) = Self::probe(&set, hash, bytes) {
                return Sym::Pooled(sym);
            }
        }

        let mut set = self.inner.set.write().unwrap();
        if let Some(sym) = Self::probe(&set, hash, bytes) {
            return Sym::Pooled(sym);
        }
        let sym = self.store(bytes, hash);
        let entries = set.entry(hash).or_default();
        entries.retain(|e| e.is_live());
        entries.push(SetEntry {
            chunk: Arc::clone(&sym.chunk),
            slot: sym.slot,
            len: sym.len,
        });
        Sym::Pooled(sym)
    }

    pub fn intern_str(&self, s: &str) -> Sym {
        self.intern(s.as_bytes())
    }

    fn probe(set: &HashMap<u64, Vec<SetEntry>>, hash: u64, bytes: &[u8]) -> Option<PooledSym> {
        let entries = set.get(&hash)?;
        for entry in entries {
            if entry.is_live() && entry.bytes_eq(bytes) {
                if let Some(sym) = entry.acquire(hash) {
                    return Some(sym);
                }
            }
        }
        None
    }

    fn store(&self, bytes: &[u8], hash: u64) -> PooledSym {
        let mut chunks = self.inner.chunks.lock().unwrap();
        for chunk in chunks.iter() {
            if let Some(sym) = Self::append(chunk, bytes, hash) {
                return sym;
            }
        }
        let chunk = Chunk::new(Arc::downgrade(&self.inner));
        let sym = Self::append(&chunk, bytes, hash)
            .expect("fresh chunk must fit a string within the data size limit");
        chunks.push(chunk);
        sym
    }

    fn append(chunk: &Arc<Chunk>, bytes: &[u8], hash: u64) -> Option<PooledSym> {
        let mut data = chunk.data.write().unwrap();
        if data.next_off + bytes.len() > CHUNK_DATA_SIZE {
            return None;
        }
        let slot_idx = if let Some(free) = data.free_slots.pop() {
            free
        } else if data.next_slot < CHUNK_SLOTS {
            let idx = data.next_slot as u32;
            data.next_slot += 1;
            idx
        } else {
            return None;
        };

        let off = data.next_off;
        data.bytes[off..off + bytes.len()].copy_from_slice(bytes);
        data.next_off += bytes.len();
        data.allocated.push((slot_idx, bytes.len() as u32));

        let slot = &chunk.slots[slot_idx as usize];
        slot.off.store(off as u32, Ordering::Release);
        slot.refs.store(1, Ordering::Release);
        chunk.live.fetch_add(1, Ordering::AcqRel);

        Some(PooledSym {
            chunk: Arc::clone(chunk),
            slot: slot_idx,
            len: bytes.len() as u32,
            hash,
        })
    }

    /// Compact every chunk with reclaimable bytes and drop dead set entries.
    /// Driven by the maintenance scheduler; the inline path in `released`
    /// only fires past the half-capacity threshold.
    pub fn compact(&self) {
        let chunks: Vec<Arc<Chunk>> = self.inner.chunks.lock().unwrap().clone();
        for chunk in &chunks {
            if chunk.fragmented.load(Ordering::Acquire) > 0 {
                chunk.compact();
            }
        }
        let mut set = self.inner.set.write().unwrap();
        set.retain(|_, entries| {
            entries.retain(|e| e.is_live());
            !entries.is_empty()
        });
    }

    pub fn stats(&self) -> PoolStats {
        let chunks = self.inner.chunks.lock().unwrap();
        let mut stats = PoolStats {
            chunks: chunks.len(),
            ..PoolStats::default()
        };
        for chunk in chunks.iter() {
            let data = chunk.data.read().unwrap();
            stats.strings += chunk.live.load(Ordering::Acquire) as usize;
            stats.used_bytes += data.next_off;
            stats.fragmented_bytes += chunk.fragmented.load(Ordering::Acquire) as usize;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_strings_stay_out_of_the_pool() {
        let pool = StringPool::new();
        let a = pool.intern_str("port");
        let b = pool.intern_str("port");
        assert!(matches!(a, Sym::Small(_)));
        assert_eq!(a, b);
        assert_eq!(a, "port");
        assert_eq!(pool.stats().strings, 0);
    }

    #[test]
    fn small_plus_encoding_round_trips_word_chars() {
        let pool = StringPool::new();
        let sym = pool.intern_str("member_10");
        assert!(matches!(sym, Sym::Small(_)));
        assert_eq!(sym.to_string_lossy(), "member_10");
        assert_eq!(sym.len(), 9);
    }

    #[test]
    fn long_strings_are_deduplicated() {
        let pool = StringPool::new();
        let a = pool.intern_str("a value that is clearly too long for inlining");
        let b = pool.intern_str("a value that is clearly too long for inlining");
        assert_eq!(a, b);
        assert_eq!(a.hash_value(), b.hash_value());
        assert_eq!(pool.stats().strings, 1);
    }

    #[test]
    fn eight_byte_non_word_strings_go_to_the_pool() {
        let pool = StringPool::new();
        let sym = pool.intern_str("has spc!");
        assert!(matches!(sym, Sym::Pooled(_)));
        assert_eq!(sym, "has spc!");
    }

    #[test]
    fn dropping_all_handles_reclaims_the_chunk() {
        let pool = StringPool::new();
        let sym = pool.intern_str("only resident of its chunk, briefly");
        assert_eq!(pool.stats().chunks, 1);
        drop(sym);
        assert_eq!(pool.stats().chunks, 0);
        // A fresh intern starts a new chunk.
        let again = pool.intern_str("only resident of its chunk, briefly");
        assert_eq!(again, "only resident of its chunk, briefly");
        assert_eq!(pool.stats().chunks, 1);
    }

    #[test]
    fn compaction_preserves_outstanding_handles() {
        let pool = StringPool::new();
        let keep = pool.intern_str(&"k".repeat(1000));
        let dropped: Vec<Sym> = (0..40)
            .map(|i| pool.intern(format!("{i:>4}{}", "x".repeat(996)).as_bytes()))
            .collect();
        let tail = pool.intern_str(&"t".repeat(1000));
        drop(dropped);
        pool.compact();
        assert_eq!(keep, "k".repeat(1000).as_str());
        assert_eq!(tail, "t".repeat(1000).as_str());
        let stats = pool.stats();
        assert_eq!(stats.strings, 2);
        assert_eq!(stats.fragmented_bytes, 0);
    }
}
