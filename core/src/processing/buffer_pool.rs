use crate::prelude::StageError;

/// Scoped buffer pool that caps the number of scratch buffers a stage holds.
pub struct BufferPool<T> {
    buffers: Vec<Vec<T>>,
    max_capacity: usize,
    outstanding: usize,
}

impl<T: Copy + Default> BufferPool<T> {
    pub fn with_capacity(max_capacity: usize) -> Self {
        Self {
            buffers: Vec::with_capacity(max_capacity),
            max_capacity,
            outstanding: 0,
        }
    }

    /// Hands out a zeroed buffer of `length`, reusing a released one if possible.
    pub fn checkout(&mut self, length: usize) -> Result<Vec<T>, StageError> {
        if self.outstanding >= self.max_capacity {
            return Err(StageError::BufferExhaustion(format!(
                "all {} buffers checked out",
                self.max_capacity
            )));
        }
        let mut buffer = self.buffers.pop().unwrap_or_default();
        buffer.clear();
        buffer.resize(length, T::default());
        self.outstanding += 1;
        Ok(buffer)
    }

    /// Returns a buffer back to the pool for reuse.
    pub fn release(&mut self, buffer: Vec<T>) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.buffers.len() < self.max_capacity {
            self.buffers.push(buffer);
        }
    }

    pub fn reset(&mut self) {
        self.buffers.clear();
        self.outstanding = 0;
    }
}
