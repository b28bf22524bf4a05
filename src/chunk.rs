//! Fixed-size chunk of encoded bytes.

use std::sync::Arc;

/// A fixed-length slice of encoder output.
///
/// `Chunk` is the unit handed from the [`ChunkAccumulator`] to the relay. Its length is always
/// the accumulator's configured chunk size; partial data is never wrapped in a `Chunk`.
///
/// Bytes are stored in an `Arc<Vec<u8>>`, so cloning a chunk to hand it to several observers
/// does not copy the payload.
///
/// # Example
///
/// ```
/// use stream_relay::Chunk;
///
/// let chunk = Chunk::new(vec![1, 2, 3, 4], 0);
/// assert_eq!(chunk.len(), 4);
/// assert_eq!(chunk.as_bytes(), &[1, 2, 3, 4]);
///
/// let shared = chunk.clone(); // cheap, shares the payload
/// assert_eq!(shared.sequence, 0);
/// ```
///
/// [`ChunkAccumulator`]: crate::ChunkAccumulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Encoded bytes, exactly one chunk long.
    pub data: Arc<Vec<u8>>,

    /// Zero-based position of this chunk in the stream it was cut from.
    pub sequence: u64,
}

impl Chunk {
    /// Creates a chunk from owned bytes.
    pub fn new(data: Vec<u8>, sequence: u64) -> Self {
        Self {
            data: Arc::new(data),
            sequence,
        }
    }

    /// Returns the chunk payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Returns the payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the chunk carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl AsRef<[u8]> for Chunk {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_len() {
        let chunk = Chunk::new(vec![0u8; 512], 3);
        assert_eq!(chunk.len(), 512);
        assert_eq!(chunk.sequence, 3);
        assert!(!chunk.is_empty());
    }

    #[test]
    fn test_chunk_clone_shares_payload() {
        let chunk = Chunk::new(vec![7u8; 16], 0);
        let cloned = chunk.clone();
        assert!(Arc::ptr_eq(&chunk.data, &cloned.data));
    }

    #[test]
    fn test_empty_chunk() {
        let chunk = Chunk::new(Vec::new(), 0);
        assert!(chunk.is_empty());
        assert_eq!(chunk.as_ref(), &[] as &[u8]);
    }
}
