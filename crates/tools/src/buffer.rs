//! Bounded output buffer shared by the exec paths.

/// Accumulates combined process output with a size cap. When the cap is
/// exceeded the oldest quarter is dropped at a char boundary, and the
/// buffer remembers that it truncated.
pub struct OutputBuffer {
    combined: String,
    max_chars: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            combined: String::new(),
            max_chars,
            truncated: false,
        }
    }

    pub fn push(&mut self, text: &str) {
        self.combined.push_str(text);
        if self.combined.len() > self.max_chars {
            self.truncated = true;
            let keep = self.max_chars * 3 / 4;
            let drain_count = self.combined.len() - keep;
            // Find a char boundary to avoid splitting a multi-byte character.
            let mut boundary = drain_count;
            while boundary < self.combined.len() && !self.combined.is_char_boundary(boundary) {
                boundary += 1;
            }
            self.combined.drain(..boundary);
        }
    }

    pub fn as_str(&self) -> &str {
        &self.combined
    }

    pub fn len(&self) -> usize {
        self.combined.len()
    }

    pub fn is_empty(&self) -> bool {
        self.combined.is_empty()
    }

    /// Whether the cap ever forced a drop.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Incremental read from a byte offset (clamped to boundaries).
    pub fn read_from(&self, offset: usize) -> &str {
        let mut start = offset.min(self.combined.len());
        while start < self.combined.len() && !self.combined.is_char_boundary(start) {
            start += 1;
        }
        &self.combined[start..]
    }

    /// Drain and return everything accumulated so far.
    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.combined)
    }
}
