//! Chunk buffer: sparse, index-addressed slots filled in any order, joined in index order.

use std::collections::BTreeMap;

/// Result of storing one decrypted chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Chunk stored; transfer is now complete.
    Complete,
    /// Chunk stored; more chunks outstanding.
    InProgress,
    /// Slot was already filled; chunk ignored.
    Duplicate,
}

/// Sparse buffer of `total` slots. Complete iff every slot is filled.
/// Only filled slots take memory, so a large announced total costs nothing
/// until chunks actually arrive.
#[derive(Debug)]
pub struct ChunkBuffer {
    slots: BTreeMap<u32, Vec<u8>>,
    total: u32,
    bytes: u64,
}

impl ChunkBuffer {
    pub fn new(total: u32) -> Self {
        Self {
            slots: BTreeMap::new(),
            total,
            bytes: 0,
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn filled(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Plaintext bytes held so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn is_complete(&self) -> bool {
        self.filled() == self.total
    }

    /// Indices still empty, ascending.
    pub fn missing(&self) -> Vec<u32> {
        (0..self.total)
            .filter(|i| !self.slots.contains_key(i))
            .collect()
    }

    pub fn insert(&mut self, index: u32, chunk: Vec<u8>) -> Result<InsertOutcome, AssemblyError> {
        if index >= self.total {
            return Err(AssemblyError::IndexOutOfRange {
                index,
                total: self.total,
            });
        }
        if self.slots.contains_key(&index) {
            return Ok(InsertOutcome::Duplicate);
        }
        self.bytes += chunk.len() as u64;
        self.slots.insert(index, chunk);
        Ok(if self.is_complete() {
            InsertOutcome::Complete
        } else {
            InsertOutcome::InProgress
        })
    }

    /// Concatenate slots in index order. `expected_len` is the size announced
    /// in the metadata; a mismatch means the sender's chunking disagreed.
    pub fn assemble(self, expected_len: u64) -> Result<Vec<u8>, AssemblyError> {
        if !self.is_complete() {
            return Err(AssemblyError::Incomplete {
                missing: self.total - self.filled(),
            });
        }
        if self.bytes != expected_len {
            return Err(AssemblyError::LengthMismatch {
                expected: expected_len,
                actual: self.bytes,
            });
        }
        let mut out = Vec::with_capacity(self.bytes as usize);
        for chunk in self.slots.into_values() {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssemblyError {
    #[error("chunk index {index} out of range (total {total})")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("{missing} chunks still missing")]
    Incomplete { missing: u32 },
    #[error("assembled {actual} bytes, metadata announced {expected}")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("metadata announced {file_size} bytes, offer announced {offered}")]
    SizeMismatch { offered: u64, file_size: u64 },
    #[error("{total_chunks} chunks cannot carry {file_size} bytes")]
    InvalidLayout { file_size: u64, total_chunks: u32 },
}

/// Whether `total_chunks` non-empty chunks of at most `max_chunk` bytes can
/// carry exactly `file_size` bytes.
pub fn layout_is_valid(file_size: u64, total_chunks: u32, max_chunk: u32) -> bool {
    let total = total_chunks as u64;
    total <= file_size && file_size.div_ceil(max_chunk.max(1) as u64) <= total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkPlan;
    use rand::seq::SliceRandom;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn in_order_reassembly() {
        let data = payload(100);
        let plan = ChunkPlan::new(100, 30);
        let mut buf = ChunkBuffer::new(plan.total_chunks);
        for i in 0..plan.total_chunks {
            let r = buf.insert(i, plan.slice(&data, i).to_vec()).unwrap();
            let last = i + 1 == plan.total_chunks;
            assert_eq!(r == InsertOutcome::Complete, last);
        }
        assert_eq!(buf.assemble(100).unwrap(), data);
    }

    #[test]
    fn any_permutation_yields_same_bytes() {
        let data = payload(4096 + 17);
        let plan = ChunkPlan::new(data.len() as u64, 256);
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let mut order: Vec<u32> = (0..plan.total_chunks).collect();
            order.shuffle(&mut rng);
            let mut buf = ChunkBuffer::new(plan.total_chunks);
            for &i in &order {
                buf.insert(i, plan.slice(&data, i).to_vec()).unwrap();
            }
            assert!(buf.is_complete());
            assert_eq!(buf.assemble(data.len() as u64).unwrap(), data);
        }
    }

    #[test]
    fn duplicate_chunk_is_idempotent() {
        let mut buf = ChunkBuffer::new(2);
        assert_eq!(buf.insert(0, vec![1; 4]).unwrap(), InsertOutcome::InProgress);
        assert_eq!(buf.insert(0, vec![9; 4]).unwrap(), InsertOutcome::Duplicate);
        assert_eq!(buf.filled(), 1);
        assert_eq!(buf.bytes(), 4);
        assert_eq!(buf.insert(1, vec![2; 4]).unwrap(), InsertOutcome::Complete);
        assert_eq!(buf.assemble(8).unwrap(), vec![1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn out_of_range_rejected() {
        let mut buf = ChunkBuffer::new(2);
        assert_eq!(
            buf.insert(2, vec![0]),
            Err(AssemblyError::IndexOutOfRange { index: 2, total: 2 })
        );
    }

    #[test]
    fn missing_slots_reported() {
        let mut buf = ChunkBuffer::new(4);
        buf.insert(1, vec![0]).unwrap();
        buf.insert(3, vec![0]).unwrap();
        assert_eq!(buf.missing(), vec![0, 2]);
        assert_eq!(
            buf.assemble(2),
            Err(AssemblyError::Incomplete { missing: 2 })
        );
    }

    #[test]
    fn length_mismatch_is_assembly_error() {
        let mut buf = ChunkBuffer::new(1);
        buf.insert(0, vec![0; 10]).unwrap();
        assert_eq!(
            buf.assemble(11),
            Err(AssemblyError::LengthMismatch {
                expected: 11,
                actual: 10
            })
        );
    }

    #[test]
    fn huge_total_allocates_nothing_up_front() {
        let mut buf = ChunkBuffer::new(u32::MAX);
        assert_eq!(buf.filled(), 0);
        assert_eq!(buf.insert(u32::MAX - 1, vec![1]).unwrap(), InsertOutcome::InProgress);
        assert_eq!(buf.bytes(), 1);
    }

    #[test]
    fn layout_bounds() {
        assert!(layout_is_valid(0, 0, 1024));
        assert!(layout_is_valid(4000, 4, 1024));
        assert!(layout_is_valid(4000, 4000, 1024));
        assert!(!layout_is_valid(4000, 3, 1024));
        assert!(!layout_is_valid(4000, 4001, 1024));
        assert!(!layout_is_valid(10, u32::MAX, 1024));
        assert!(!layout_is_valid(5, 0, 1024));
    }

    #[test]
    fn empty_buffer_is_complete() {
        let buf = ChunkBuffer::new(0);
        assert!(buf.is_complete());
        assert_eq!(buf.assemble(0).unwrap(), Vec::<u8>::new());
    }
}
