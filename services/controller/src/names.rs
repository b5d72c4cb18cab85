//! Name generation for new instances.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

/// Length of the random suffix appended to generated names.
pub const SUFFIX_LEN: usize = 5;

/// Produces lowercase suffixes for generated object names.
pub trait NameGenerator: Send + Sync {
    fn suffix(&self, len: usize) -> String;

    /// `<prefix>-<suffix>`.
    fn generate(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.suffix(SUFFIX_LEN))
    }
}

/// Random lowercase ASCII letters.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomNameGenerator;

impl NameGenerator for RandomNameGenerator {
    fn suffix(&self, len: usize) -> String {
        let mut rng = rand::rng();
        (0..len)
            .map(|_| char::from(b'a' + rng.random_range(0..26u8)))
            .collect()
    }
}

/// Deterministic suffixes `aaaaa`, `aaaab`, ... for tests.
#[derive(Debug, Default)]
pub struct SequentialNameGenerator {
    next: AtomicU64,
}

impl SequentialNameGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NameGenerator for SequentialNameGenerator {
    fn suffix(&self, len: usize) -> String {
        let mut n = self.next.fetch_add(1, Ordering::SeqCst);
        let mut out = vec![b'a'; len];
        for slot in out.iter_mut().rev() {
            *slot = b'a' + (n % 26) as u8;
            n /= 26;
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_suffix_shape() {
        let name = RandomNameGenerator.generate("arena");
        let suffix = name.strip_prefix("arena-").unwrap();
        assert_eq!(suffix.len(), SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));
    }

    #[test]
    fn test_sequential_suffixes() {
        let names = SequentialNameGenerator::new();
        assert_eq!(names.generate("arena"), "arena-aaaaa");
        assert_eq!(names.generate("arena"), "arena-aaaab");
        assert_eq!(names.suffix(2), "ac");
    }
}
