//! Windowed duplicate-frame filter: suppresses repeated frames arriving
//! within a short age-out window, as happens on noisy RTU links with
//! retransmitting masters.

/// Default window size/age-out used by `ServerConfig`/`ClientConfig`
/// unless overridden via configuration.
pub const DEFAULT_WINDOW_SIZE: usize = 8;
pub const DEFAULT_WINDOW_MS: u64 = 500;

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    hash: u64,
    timestamp_ms: u64,
    occupied: bool,
}

/// A light mix of `(unit, function_code, first 4 payload bytes)` — cheap,
/// not cryptographic; collisions are accepted and counted as
/// `false_positives` when the underlying bytes actually differ.
pub fn frame_hash(unit_id: u8, function: u8, payload: &[u8]) -> u64 {
    let mut buf = [0u8; 4];
    let n = payload.len().min(4);
    buf[..n].copy_from_slice(&payload[..n]);
    let mut h = (unit_id as u64) << 56 | (function as u64) << 48;
    h ^= u32::from_be_bytes(buf) as u64;
    h
}

pub struct DuplicateFilter<const N: usize> {
    entries: [Entry; N],
    window_ms: u64,
    last_added_hash: Option<u64>,
    pub frames_checked: u64,
    pub duplicates_found: u64,
    pub false_positives: u64,
}

impl<const N: usize> DuplicateFilter<N> {
    pub fn new(window_ms: u64) -> Self {
        Self {
            entries: [Entry::default(); N],
            window_ms,
            last_added_hash: None,
            frames_checked: 0,
            duplicates_found: 0,
            false_positives: 0,
        }
    }

    pub fn with_default_window() -> Self {
        Self::new(DEFAULT_WINDOW_MS)
    }

    /// Drops entries older than the window relative to `now`.
    pub fn age_out(&mut self, now: u64) {
        for e in self.entries.iter_mut() {
            if e.occupied && now.saturating_sub(e.timestamp_ms) > self.window_ms {
                e.occupied = false;
            }
        }
    }

    /// Returns whether `hash` is a recent duplicate. Does not insert it;
    /// call `add` separately once the caller decides to accept the frame.
    pub fn check(&mut self, hash: u64, now: u64) -> bool {
        self.frames_checked += 1;
        self.age_out(now);
        let hit = self.entries.iter().any(|e| e.occupied && e.hash == hash);
        if hit {
            self.duplicates_found += 1;
            if self.last_added_hash != Some(hash) {
                self.false_positives += 1;
            }
        }
        hit
    }

    /// Records `hash` as seen at `now`, evicting the oldest slot if full.
    pub fn add(&mut self, hash: u64, now: u64) {
        self.last_added_hash = Some(hash);
        if let Some(free) = self.entries.iter_mut().find(|e| !e.occupied) {
            *free = Entry {
                hash,
                timestamp_ms: now,
                occupied: true,
            };
            return;
        }
        // Full: evict the oldest entry.
        let oldest = self
            .entries
            .iter_mut()
            .min_by_key(|e| e.timestamp_ms)
            .expect("N > 0");
        *oldest = Entry {
            hash,
            timestamp_ms: now,
            occupied: true,
        };
    }

    /// Clears the window, required whenever identity changes or a batch is
    /// aborted.
    pub fn clear(&mut self) {
        self.entries = [Entry::default(); N];
        self.last_added_hash = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_repeat_within_window() {
        let mut f = DuplicateFilter::<8>::new(500);
        let h = frame_hash(0x11, 0x03, &[0x00, 0x00, 0x00, 0x02]);
        assert!(!f.check(h, 100));
        f.add(h, 100);
        assert!(f.check(h, 200));
    }

    #[test]
    fn ages_out_after_window() {
        let mut f = DuplicateFilter::<8>::new(500);
        let h = frame_hash(0x11, 0x03, &[0, 0, 0, 2]);
        f.add(h, 0);
        assert!(f.check(h, 100));
        assert!(!f.check(h, 700));
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut f = DuplicateFilter::<2>::new(5000);
        let h1 = frame_hash(1, 3, &[0, 0, 0, 1]);
        let h2 = frame_hash(1, 3, &[0, 0, 0, 2]);
        let h3 = frame_hash(1, 3, &[0, 0, 0, 3]);
        f.add(h1, 0);
        f.add(h2, 10);
        f.add(h3, 20);
        assert!(!f.check(h1, 30));
        assert!(f.check(h3, 30));
    }
}
