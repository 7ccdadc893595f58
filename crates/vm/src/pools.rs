//! The small bucketed pools: interned UTF strings and native methods.
//!
//! Both are fixed-bucket hash tables with chained entries; xxh3 picks the
//! bucket and the chain is scanned linearly comparing keys. UTF entries
//! live in the arena as single contiguous STATIC chunks (chain link, length,
//! bytes, NUL) so the GC never scans or frees them; native-method entries
//! carry host function pointers and live outside the arena.

use crate::cell::Ref;
use crate::error::VmResult;
use crate::heap::Heap;
use crate::thread::ThreadId;
use crate::vm::Vm;
use xxhash_rust::xxh3::xxh3_64;

/// Word offsets inside a UTF pool entry payload.
const UTF_NEXT: u32 = 0;
const UTF_LEN: u32 = 4;
const UTF_BYTES: u32 = 8;

/// The interned UTF string pool.
pub struct UtfPool {
    buckets: Vec<Ref>,
}

impl UtfPool {
    /// Builds a pool with a fixed bucket count.
    pub fn new(bucket_count: usize) -> Self {
        Self {
            buckets: vec![Ref::NULL; bucket_count],
        }
    }

    fn bucket_of(&self, bytes: &[u8]) -> usize {
        (xxh3_64(bytes) % self.buckets.len() as u64) as usize
    }

    /// The arena bytes an entry for `bytes` needs: link word, length word,
    /// the bytes, and a NUL terminator.
    pub fn entry_size(bytes: &[u8]) -> usize {
        UTF_BYTES as usize + bytes.len() + 1
    }

    /// Looks up an interned entry by bytes.
    pub fn find(&self, heap: &Heap, bytes: &[u8]) -> Option<Ref> {
        let mut cursor = self.buckets[self.bucket_of(bytes)];
        while let Some(entry) = cursor.non_null() {
            if Self::bytes_of(heap, entry) == bytes {
                return Some(entry);
            }
            cursor = heap.cell(entry.offset() + UTF_NEXT).as_ref();
        }
        None
    }

    /// Links a freshly allocated STATIC chunk into the pool as the entry for
    /// `bytes`, writing the entry layout into its payload. Prepends to the
    /// bucket chain.
    pub fn insert(&mut self, heap: &mut Heap, entry: Ref, bytes: &[u8]) {
        let bucket = self.bucket_of(bytes);
        let head = self.buckets[bucket];
        heap.set_word(entry.offset() + UTF_NEXT, head.offset());
        heap.set_word(entry.offset() + UTF_LEN, bytes.len() as u32);
        let payload = heap.bytes_mut(
            Ref::from_offset(entry.offset() + UTF_BYTES),
            bytes.len() + 1,
        );
        payload[..bytes.len()].copy_from_slice(bytes);
        payload[bytes.len()] = 0;
        self.buckets[bucket] = entry;
    }

    /// The bytes of an interned entry.
    pub fn bytes_of(heap: &Heap, entry: Ref) -> &[u8] {
        let len = heap.word(entry.offset() + UTF_LEN) as usize;
        heap.bytes(Ref::from_offset(entry.offset() + UTF_BYTES), len)
    }

    /// Number of live entries, by chain walk.
    pub fn len(&self, heap: &Heap) -> usize {
        let mut count = 0;
        for &head in &self.buckets {
            let mut cursor = head;
            while let Some(entry) = cursor.non_null() {
                count += 1;
                cursor = heap.cell(entry.offset() + UTF_NEXT).as_ref();
            }
        }
        count
    }

    /// True when the pool holds no entries.
    pub fn is_empty(&self, heap: &Heap) -> bool {
        self.len(heap) == 0
    }
}

/// A host-native method body.
pub type NativeMethod = fn(&mut Vm, ThreadId) -> VmResult<()>;

struct NativeEntry {
    class: Ref,
    name: String,
    signature: String,
    method: NativeMethod,
    next: Option<usize>,
}

/// The native method registry, keyed by (class, name, signature).
pub struct NativeMethodPool {
    buckets: Vec<Option<usize>>,
    entries: Vec<NativeEntry>,
}

impl NativeMethodPool {
    /// Builds a pool with a fixed bucket count.
    pub fn new(bucket_count: usize) -> Self {
        Self {
            buckets: vec![None; bucket_count],
            entries: Vec::new(),
        }
    }

    fn bucket_of(&self, class: Ref, name: &str, signature: &str) -> usize {
        let mut key = Vec::with_capacity(8 + name.len() + signature.len());
        key.extend_from_slice(&class.offset().to_le_bytes());
        key.extend_from_slice(name.as_bytes());
        key.push(0);
        key.extend_from_slice(signature.as_bytes());
        (xxh3_64(&key) % self.buckets.len() as u64) as usize
    }

    /// Registers a native method body. Prepends to the bucket chain, so a
    /// re-registration shadows the earlier entry.
    pub fn register(&mut self, class: Ref, name: &str, signature: &str, method: NativeMethod) {
        let bucket = self.bucket_of(class, name, signature);
        let entry = NativeEntry {
            class,
            name: name.to_owned(),
            signature: signature.to_owned(),
            method,
            next: self.buckets[bucket],
        };
        self.entries.push(entry);
        self.buckets[bucket] = Some(self.entries.len() - 1);
    }

    /// Looks up a native method body.
    pub fn get(&self, class: Ref, name: &str, signature: &str) -> Option<NativeMethod> {
        let mut cursor = self.buckets[self.bucket_of(class, name, signature)];
        while let Some(index) = cursor {
            let entry = &self.entries[index];
            if entry.class == class && entry.name == name && entry.signature == signature {
                return Some(entry.method);
            }
            cursor = entry.next;
        }
        None
    }

    /// Number of registered bodies.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::AllocType;

    fn heap() -> Heap {
        Heap::new(64 * 1024).expect("heap")
    }

    #[test]
    fn test_utf_insert_and_find() {
        let mut heap = heap();
        let mut pool = UtfPool::new(4);

        let bytes = b"java/lang/Object";
        assert!(pool.find(&heap, bytes).is_none());

        let entry = heap
            .alloc(UtfPool::entry_size(bytes), AllocType::Static)
            .expect("entry");
        pool.insert(&mut heap, entry, bytes);

        assert_eq!(pool.find(&heap, bytes), Some(entry));
        assert_eq!(UtfPool::bytes_of(&heap, entry), bytes);
        assert_eq!(pool.len(&heap), 1);
    }

    #[test]
    fn test_utf_chains_survive_collisions() {
        let mut heap = heap();
        // One bucket forces every entry onto one chain.
        let mut pool = UtfPool::new(1);
        let names: &[&[u8]] = &[b"a", b"bb", b"ccc", b"dddd"];
        let mut entries = Vec::new();
        for name in names {
            let entry = heap
                .alloc(UtfPool::entry_size(name), AllocType::Static)
                .expect("entry");
            pool.insert(&mut heap, entry, name);
            entries.push(entry);
        }
        for (name, entry) in names.iter().zip(&entries) {
            assert_eq!(pool.find(&heap, name), Some(*entry));
        }
        assert_eq!(pool.len(&heap), names.len());
    }

    fn nop_native(_vm: &mut Vm, _thread: ThreadId) -> VmResult<()> {
        Ok(())
    }

    fn other_native(_vm: &mut Vm, _thread: ThreadId) -> VmResult<()> {
        Ok(())
    }

    #[test]
    fn test_native_pool_keys_on_class_name_signature() {
        let mut pool = NativeMethodPool::new(4);
        let class_a = Ref::from_offset(16);
        let class_b = Ref::from_offset(32);

        pool.register(class_a, "hash", "()I", nop_native);
        pool.register(class_b, "hash", "()I", other_native);

        assert_eq!(
            pool.get(class_a, "hash", "()I").map(|f| f as usize),
            Some(nop_native as usize)
        );
        assert_eq!(
            pool.get(class_b, "hash", "()I").map(|f| f as usize),
            Some(other_native as usize)
        );
        assert!(pool.get(class_a, "hash", "()J").is_none());
        assert!(pool.get(class_a, "equals", "()I").is_none());
        assert_eq!(pool.len(), 2);
    }
}
