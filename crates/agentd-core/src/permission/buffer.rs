//! Bounded trailing window of agent output

/// The most recent `cap` characters of output
///
/// Offsets are absolute character positions in the whole stream, so callers
/// can remember how far they have looked even after old text is discarded.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    text: String,
    cap: usize,
    chars: usize,
    dropped: usize,
}

impl OutputBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            text: String::with_capacity(cap.min(64 * 1024)),
            cap: cap.max(1),
            chars: 0,
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.text.push_str(chunk);
        self.chars += chunk.chars().count();

        if self.chars > self.cap {
            let excess = self.chars - self.cap;
            let cut = self
                .text
                .char_indices()
                .nth(excess)
                .map(|(i, _)| i)
                .unwrap_or(self.text.len());
            self.text.drain(..cut);
            self.chars = self.cap;
            self.dropped += excess;
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Characters currently held (never more than the cap)
    pub fn len(&self) -> usize {
        self.chars
    }

    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Absolute offset of the first held character
    pub fn start_offset(&self) -> usize {
        self.dropped
    }

    /// Absolute offset just past the last held character
    pub fn end_offset(&self) -> usize {
        self.dropped + self.chars
    }

    /// Byte index in [`text`](Self::text) of an absolute character offset
    pub fn byte_index(&self, offset: usize) -> usize {
        let rel = offset.saturating_sub(self.dropped);
        self.text
            .char_indices()
            .nth(rel)
            .map(|(i, _)| i)
            .unwrap_or(self.text.len())
    }

    /// Absolute character offset of a byte index in [`text`](Self::text)
    pub fn offset_of(&self, byte: usize) -> usize {
        self.dropped + self.text[..byte].chars().count()
    }
}

/// Last `n` characters of `text`
pub fn tail_chars(text: &str, n: usize) -> &str {
    let count = text.chars().count();
    if count <= n {
        return text;
    }
    let start = text
        .char_indices()
        .nth(count - n)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &text[start..]
}
