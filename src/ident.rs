use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Process-wide identity stamp for trackers.
///
/// Live updates move preserved trackers between arenas, so pointer identity
/// means nothing; a tracker that survives an update keeps its generation,
/// a rebuilt one gets a fresh stamp.
pub fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generations_monotonic() {
        let a = next_generation();
        let b = next_generation();
        assert!(b > a);
    }
}
