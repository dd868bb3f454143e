//! Fixed-size batching of decoded rows. Purely a memory bound: ordering is
//! preserved and nothing is deduplicated or dropped here.

/// Groups items into chunks of at most `cap`, emitting each chunk as soon
/// as it fills. The final partial chunk is emitted by [`flush`].
///
/// [`flush`]: ChunkAccumulator::flush
#[derive(Debug)]
pub struct ChunkAccumulator<T> {
    cap: usize,
    buf: Vec<T>,
}

impl<T> ChunkAccumulator<T> {
    /// `cap` is clamped to at least 1.
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            cap,
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Add one item; returns a full chunk of exactly `cap` items when the
    /// boundary is reached, `None` otherwise.
    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.buf.push(item);
        if self.buf.len() >= self.cap {
            let full = std::mem::replace(&mut self.buf, Vec::with_capacity(self.cap));
            Some(full)
        } else {
            None
        }
    }

    /// Emit whatever remains (size 1..cap), or `None` when nothing is
    /// buffered. Call once at end of stream.
    pub fn flush(&mut self) -> Option<Vec<T>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }

    /// Release the spare backing capacity. Invoked by the memory governor's
    /// reclamation pass between chunks.
    pub fn shrink(&mut self) {
        self.buf.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// M items at capacity N always partition into ⌈M/N⌉ chunks, all of
    /// size N except possibly the last.
    #[test]
    fn partitions_into_ceiling_chunks() {
        for n in [1usize, 2, 3, 7, 100] {
            for m in [0usize, 1, 2, 5, 99, 100, 101] {
                let mut acc = ChunkAccumulator::new(n);
                let mut chunks = Vec::new();
                for i in 0..m {
                    if let Some(c) = acc.push(i) {
                        chunks.push(c);
                    }
                }
                if let Some(c) = acc.flush() {
                    chunks.push(c);
                }
                assert_eq!(chunks.len(), m.div_ceil(n), "m={m} n={n}");
                for (i, c) in chunks.iter().enumerate() {
                    if i + 1 < chunks.len() {
                        assert_eq!(c.len(), n);
                    } else {
                        assert!(c.len() >= 1 && c.len() <= n);
                    }
                }
                // ordering preserved across chunk boundaries
                let flat: Vec<usize> = chunks.into_iter().flatten().collect();
                assert_eq!(flat, (0..m).collect::<Vec<_>>());
            }
        }
    }

    #[test]
    fn flush_on_empty_is_none() {
        let mut acc: ChunkAccumulator<u8> = ChunkAccumulator::new(4);
        assert!(acc.flush().is_none());
    }

    #[test]
    fn zero_capacity_clamped_to_one() {
        let mut acc = ChunkAccumulator::new(0);
        assert_eq!(acc.capacity(), 1);
        assert_eq!(acc.push(42), Some(vec![42]));
    }
}
