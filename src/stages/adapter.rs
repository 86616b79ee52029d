//! Adapter Assignment
//!
//! Spreads mounts over the NFS server's adapter addresses.

use crate::error::{Error, Result};

/// Round-robin over a fixed, ordered adapter list.
///
/// Stateless: the caller supplies the index, so `next(i)` is always
/// `adapters[i % len]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterAssigner {
    adapters: Vec<String>,
}

impl AdapterAssigner {
    pub fn new(adapters: Vec<String>) -> Result<Self> {
        if adapters.is_empty() {
            return Err(Error::config("adapter list must not be empty"));
        }
        if let Some(blank) = adapters.iter().find(|a| a.trim().is_empty()) {
            return Err(Error::config(format!("blank adapter address {:?}", blank)));
        }
        Ok(Self { adapters })
    }

    pub fn next(&self, index: usize) -> &str {
        &self.adapters[index % self.adapters.len()]
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn adapters(&self) -> &[String] {
        &self.adapters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    #[test]
    fn test_empty_list_is_config_error() {
        assert_matches!(AdapterAssigner::new(vec![]), Err(Error::Config(_)));
        assert_matches!(
            AdapterAssigner::new(vec!["10.0.0.1".into(), " ".into()]),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_round_robin_from_zero() {
        let assigner = AdapterAssigner::new(vec!["a1".into(), "a2".into()]).unwrap();
        let picks: Vec<_> = (0..3).map(|i| assigner.next(i)).collect();
        assert_eq!(picks, vec!["a1", "a2", "a1"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_assignment_is_periodic(
            adapters in prop::collection::vec("[a-z0-9.]{1,15}", 1..8),
            index in 0usize..10_000,
        ) {
            let n = adapters.len();
            let assigner = AdapterAssigner::new(adapters.clone()).unwrap();
            prop_assert_eq!(assigner.next(index), assigner.next(index + n));
            prop_assert_eq!(assigner.next(index), adapters[index % n].as_str());
        }
    }
}
