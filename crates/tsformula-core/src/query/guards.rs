//! Shared guardrails for evaluation depth, generated payloads and caches.

// Evaluation guards
pub const MAX_EVAL_DEPTH: usize = 128;
pub const MIN_EVAL_DEPTH: usize = 4;
pub const MAX_EVAL_DEPTH_CEILING: usize = 4096;
pub const MAX_GENERATED_POINTS: usize = 1_000_000;
pub const MAX_TIMEOUT_MS: u64 = 3_600_000;

// Parser guards
pub const MAX_PARSE_DEPTH: usize = 256;

// Resolver guards
pub const MAX_RESOLVE_DEPTH: usize = 64;
pub const MAX_WRITE_ATTEMPTS: usize = 3;

// Cache guards
pub const DEFAULT_CACHE_ENTRIES: usize = 512;
pub const MAX_CACHE_ENTRIES: usize = 65_536;
pub const DEFAULT_CACHE_TTL_SECONDS: f64 = 300.0;

pub fn clamp_int(value: i64, minimum: i64, maximum: i64) -> i64 {
    value.max(minimum).min(maximum)
}

pub fn clamp_depth(value: i64) -> usize {
    clamp_int(value, MIN_EVAL_DEPTH as i64, MAX_EVAL_DEPTH_CEILING as i64) as usize
}

pub fn clamp_cache_entries(value: i64) -> usize {
    clamp_int(value, 1, MAX_CACHE_ENTRIES as i64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_is_clamped_to_sane_bounds() {
        assert_eq!(clamp_depth(0), MIN_EVAL_DEPTH);
        assert_eq!(clamp_depth(64), 64);
        assert_eq!(clamp_depth(1 << 40), MAX_EVAL_DEPTH_CEILING);
    }

    #[test]
    fn cache_entries_stay_positive() {
        assert_eq!(clamp_cache_entries(-5), 1);
        assert_eq!(clamp_cache_entries(10), 10);
    }
}
