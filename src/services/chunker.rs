//! Splitting an object's bytes into attachment-sized parts.

use bytes::Bytes;

/// Largest part written to the platform: 23 MiB, below the 25 MiB upload
/// ceiling to leave room for the multipart envelope.
pub const MAX_PART_SIZE: usize = 23 * 1024 * 1024;

/// Split `buffer` into consecutive slices of `chunk_size` bytes.
///
/// Every slice but the last is exactly `chunk_size` long; the last holds the
/// remainder. An empty buffer yields no slices. Slices share `buffer`'s
/// allocation, so no bytes are copied.
///
/// # Panics
///
/// Panics if `chunk_size` is zero.
pub fn split(buffer: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    assert!(chunk_size > 0, "chunk size must be positive");
    (0..buffer.len())
        .step_by(chunk_size)
        .map(|start| buffer.slice(start..(start + chunk_size).min(buffer.len())))
        .collect()
}

/// The parts an upload is written as.
///
/// Same as [`split`], except that an empty object becomes a single empty part
/// so that every stored object has at least one part.
pub fn plan_parts(buffer: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    if buffer.is_empty() {
        return vec![Bytes::new()];
    }
    split(buffer, chunk_size)
}
