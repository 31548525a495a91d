use bytes::Bytes;

/// Fixed generator seed; both peers must produce identical bytes, so the
/// pattern never depends on process-local randomness.
const PATTERN_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// Smallest pattern we bother generating.
const MIN_PATTERN_LEN: usize = 0x10000;

/// Deterministic byte pattern shared by both peers
///
/// The buffer is generated once at startup and is read-only afterwards,
/// so it is shared across connections without synchronization. Sends
/// take windows into it; receives are verified against it byte-for-byte
/// at their stream offset.
#[derive(Debug, Clone)]
pub struct PatternBuffer {
    data: Bytes,
}

impl PatternBuffer {
    /// Builds a pattern at least twice `max_buffer_size` long.
    pub fn for_max_buffer(max_buffer_size: usize) -> Self {
        Self::sized((max_buffer_size * 2).max(MIN_PATTERN_LEN))
    }

    /// Builds a pattern of exactly `len` bytes from the fixed seed.
    pub fn sized(len: usize) -> Self {
        assert!(len > 0, "pattern length must be nonzero");
        let mut state = PATTERN_SEED;
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            // xorshift64*: cheap, stable, and identical on every host.
            state ^= state >> 12;
            state ^= state << 25;
            state ^= state >> 27;
            let word = state.wrapping_mul(0x2545_F491_4F6C_DD1D);
            let remaining = len - data.len();
            data.extend_from_slice(&word.to_le_bytes()[..remaining.min(8)]);
        }
        Self { data: data.into() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns a read-only window starting at `offset mod len`, clamped
    /// so it never crosses the wrap point. Callers re-request for the
    /// remainder.
    pub fn send_window(&self, offset: u64, len: usize) -> &[u8] {
        let start = (offset % self.data.len() as u64) as usize;
        let end = (start + len).min(self.data.len());
        &self.data[start..end]
    }

    /// Copies `out.len()` pattern bytes starting at `offset`, wrapping as
    /// many times as needed. Used to build fixed-size media frames.
    pub fn fill(&self, offset: u64, out: &mut [u8]) {
        let mut filled = 0;
        while filled < out.len() {
            let window = self.send_window(offset + filled as u64, out.len() - filled);
            out[filled..filled + window.len()].copy_from_slice(window);
            filled += window.len();
        }
    }

    /// Compares a received window against the pattern at `stream_offset`.
    ///
    /// Returns the offset within `window` of the first mismatching byte.
    pub fn verify(&self, window: &[u8], stream_offset: u64) -> Result<(), usize> {
        let mut checked = 0;
        while checked < window.len() {
            let expected = self.send_window(stream_offset + checked as u64, window.len() - checked);
            let actual = &window[checked..checked + expected.len()];
            if actual != expected {
                let local = actual
                    .iter()
                    .zip(expected.iter())
                    .position(|(a, b)| a != b)
                    .unwrap_or(0);
                return Err(checked + local);
            }
            checked += expected.len();
        }
        Ok(())
    }
}
