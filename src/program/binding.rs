use derive_more::{Deref, From, Into};

use crate::memory::{AccessError, Storage};

/// One bound memory resource: a storage handle viewed through a byte length.
///
/// The length caps what shader code may address through this binding; the
/// backing storage may be larger.
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    storage: Storage,
    len: usize,
}

impl BufferDescriptor {
    /// Binds the whole of `storage`.
    pub fn new(storage: Storage) -> Self {
        let len = storage.words() * 4;
        Self { storage, len }
    }

    /// Shrinks the bound view to `len` bytes.
    pub fn with_len(mut self, len: usize) -> Self {
        assert!(
            len <= self.storage.words() * 4,
            "descriptor length exceeds storage"
        );
        self.len = len;
        self
    }

    /// Bound length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bound length in whole words.
    #[inline]
    pub fn words(&self) -> usize {
        self.len / 4
    }

    #[inline]
    pub fn load(&self, index: usize) -> Result<u32, AccessError> {
        if index >= self.words() {
            return Err(AccessError {
                index,
                words: self.words(),
            });
        }
        self.storage.load(index)
    }

    #[inline]
    pub fn store(&self, index: usize, value: u32) -> Result<(), AccessError> {
        if index >= self.words() {
            return Err(AccessError {
                index,
                words: self.words(),
            });
        }
        self.storage.store(index, value)
    }

    /// Reads back the bound view.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.storage.to_bytes();
        bytes.truncate(self.len);
        bytes
    }

    pub fn to_words(&self) -> Vec<u32> {
        let mut words = self.storage.to_words();
        words.truncate(self.words());
        words
    }
}

impl From<Storage> for BufferDescriptor {
    fn from(value: Storage) -> Self {
        Self::new(value)
    }
}

/// Ordered buffer descriptors; position is the binding slot.
///
/// Immutable once a `ProgramData` is bound over it.
#[derive(Debug, Default, Clone, Deref, From, Into)]
pub struct DescriptorSetLayout(Vec<BufferDescriptor>);

impl DescriptorSetLayout {
    pub fn new(descriptors: impl Into<Vec<BufferDescriptor>>) -> Self {
        Self(descriptors.into())
    }

    #[inline]
    pub fn slots(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn slot(&self, binding: u32) -> Option<&BufferDescriptor> {
        self.0.get(binding as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::BufferDescriptor;
    use crate::memory::Storage;

    #[test]
    fn test_view_caps_access() {
        let descriptor = BufferDescriptor::new(Storage::zeroed(8)).with_len(16);
        assert_eq!(descriptor.words(), 4);
        assert!(descriptor.store(3, 1).is_ok());
        // word 4 is inside the storage but outside the bound view
        assert!(descriptor.store(4, 1).is_err());
    }

    #[test]
    #[should_panic(expected = "descriptor length exceeds storage")]
    fn test_oversized_view() {
        let _ = BufferDescriptor::new(Storage::zeroed(2)).with_len(12);
    }
}
