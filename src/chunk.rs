//! Fixed-size chunk buffers and the global chunk pool.
//!
//! Chunks are 64 KiB byte buffers carved out of large anonymous mmap
//! batches. A batch is mapped once and never unmapped; retired chunks go
//! back on a global free list and circulate between buckets for the
//! lifetime of the process. Keeping the arena outside the ordinary heap
//! means a multi-gigabyte cache adds nothing to allocator churn.

use memmap2::MmapMut;
use parking_lot::Mutex;

/// Size of one chunk buffer.
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks mapped per batch when the free list runs dry (64 MiB).
const CHUNKS_PER_ALLOC: usize = 1024;

static FREE_CHUNKS: Mutex<Vec<&'static mut [u8]>> = Mutex::new(Vec::new());

/// A pooled 64 KiB buffer, returned to the free list on drop.
#[derive(Debug)]
pub(crate) struct Chunk {
    buf: Option<&'static mut [u8]>,
}

impl Chunk {
    #[inline]
    pub(crate) fn bytes(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    #[inline]
    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            FREE_CHUNKS.lock().push(buf);
        }
    }
}

/// Pop a chunk off the free list, mapping a fresh batch if it is empty.
pub(crate) fn acquire() -> Chunk {
    let mut free = FREE_CHUNKS.lock();
    if free.is_empty() {
        refill(&mut free);
    }
    Chunk { buf: free.pop() }
}

/// Map one batch of chunks and push them all onto the free list.
///
/// The mapping is leaked: chunk buffers only ever move between buckets
/// and the free list, never back to the operating system.
fn refill(free: &mut Vec<&'static mut [u8]>) {
    let batch = CHUNK_SIZE * CHUNKS_PER_ALLOC;
    let mmap = match MmapMut::map_anon(batch) {
        Ok(m) => m,
        Err(e) => panic!("cannot map {batch} bytes for a chunk batch: {e}"),
    };
    tracing::debug!(batch_bytes = batch, chunks = CHUNKS_PER_ALLOC, "mapped chunk batch");

    let mut rest: &'static mut [u8] = Box::leak(Box::new(mmap)).as_mut();
    while rest.len() >= CHUNK_SIZE {
        let (chunk, tail) = std::mem::take(&mut rest).split_at_mut(CHUNK_SIZE);
        free.push(chunk);
        rest = tail;
    }
}
