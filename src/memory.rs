use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use derive_more::Deref;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("word {index} out of range ({words} words)")]
pub struct AccessError {
    pub index: usize,
    pub words: usize,
}

/// Shared word-addressed storage backing buffers and workgroup memory.
///
/// Cells are atomic so shader-visible stores stay well-defined under any
/// interleaving; all accesses are `Relaxed`, ordering between subgroups comes
/// from the driver's barrier rendezvous. Clones alias the same cells.
#[derive(Debug, Clone)]
pub struct Storage(Arc<[AtomicU32]>);

impl Storage {
    pub fn zeroed(words: usize) -> Self {
        Self((0..words).map(|_| AtomicU32::new(0)).collect())
    }

    pub fn from_words(words: &[u32]) -> Self {
        Self(words.iter().map(|&word| AtomicU32::new(word)).collect())
    }

    /// Packs native-endian bytes into words, zero-padding a trailing partial
    /// word.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut chunks = bytes.chunks_exact(4);
        let mut words: Vec<u32> = chunks
            .by_ref()
            .map(|chunk| u32::from_ne_bytes(chunk.try_into().expect("chunk of 4")))
            .collect();
        if !chunks.remainder().is_empty() {
            let mut last = [0; 4];
            last[..chunks.remainder().len()].copy_from_slice(chunks.remainder());
            words.push(u32::from_ne_bytes(last));
        }
        Self::from_words(&words)
    }

    #[inline]
    pub fn words(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn load(&self, index: usize) -> Result<u32, AccessError> {
        match self.0.get(index) {
            Some(cell) => Ok(cell.load(Ordering::Relaxed)),
            None => Err(AccessError {
                index,
                words: self.words(),
            }),
        }
    }

    #[inline]
    pub fn store(&self, index: usize, value: u32) -> Result<(), AccessError> {
        match self.0.get(index) {
            Some(cell) => Ok(cell.store(value, Ordering::Relaxed)),
            None => Err(AccessError {
                index,
                words: self.words(),
            }),
        }
    }

    pub fn to_words(&self) -> Vec<u32> {
        self.0.iter().map(|cell| cell.load(Ordering::Relaxed)).collect()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bytemuck::cast_slice(&self.to_words()).to_vec()
    }
}

/// Scratch shared by all coroutines of one workgroup.
///
/// The driver allocates one per workgroup coordinate and hands clones to the
/// workgroup's coroutines; the cells live until the last handle drops.
#[derive(Debug, Clone, Deref)]
pub struct WorkgroupMemory(Storage);

impl WorkgroupMemory {
    pub fn new(words: usize) -> Self {
        Self(Storage::zeroed(words))
    }
}
