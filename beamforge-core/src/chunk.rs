//! Resumable cursor over a request's prompt
//!
//! An unset chunk size means "process everything that is left in one go".

/// How much of the prompt has been handed to the compute step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextCursor {
    position: usize,
    chunk_size: Option<usize>,
}

impl ContextCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn chunk_size(&self) -> Option<usize> {
        self.chunk_size
    }

    pub fn is_chunked(&self) -> bool {
        self.chunk_size.is_some()
    }

    pub fn remaining(&self, prompt_len: usize) -> usize {
        prompt_len.saturating_sub(self.position)
    }

    /// Set the next chunk, clamped to what is left of the prompt
    pub fn set_chunk_size(&mut self, size: usize, prompt_len: usize) {
        self.chunk_size = Some(size.min(self.remaining(prompt_len)));
    }

    /// Size of the next chunk the cursor will consume
    pub fn next_chunk_len(&self, prompt_len: usize) -> usize {
        self.chunk_size.unwrap_or_else(|| self.remaining(prompt_len))
    }

    pub fn is_first_chunk(&self) -> bool {
        self.position == 0
    }

    pub fn is_last_chunk(&self, prompt_len: usize) -> bool {
        self.position + self.next_chunk_len(prompt_len) == prompt_len
    }

    /// Consume the current chunk and unset the chunk size
    pub fn advance(&mut self, prompt_len: usize) {
        self.position += self.next_chunk_len(prompt_len);
        self.chunk_size = None;
    }

    pub fn is_complete(&self, prompt_len: usize) -> bool {
        self.position >= prompt_len
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
