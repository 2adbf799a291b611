//! Queue list resolution.
//!
//! A worker's configured queue list is either static (plain names, used as
//! given) or dynamic (contains glob characters). A dynamic list is re-matched
//! against the live queue set on every reservation cycle, so queues created
//! at runtime become visible without a restart.

use std::collections::HashSet;

use crate::config::ConfigError;
use crate::store::{Store, StoreError};

/// Characters that switch the resolver into dynamic mode.
pub const WILDCARD_CHARS: [char; 6] = ['*', '?', '{', '}', '[', ']'];

/// Resolves the configured queue list to a concrete ordered list.
#[derive(Debug)]
pub struct QueueResolver {
    patterns: Vec<String>,
    // Compiled only in dynamic mode.
    compiled: Option<Vec<glob::Pattern>>,
}

impl QueueResolver {
    /// Build a resolver from the configured list.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NoQueues`] for an empty list,
    /// [`ConfigError::QueuePattern`] for a glob that does not parse.
    pub fn new<I, S>(patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        if patterns.is_empty() {
            return Err(ConfigError::NoQueues);
        }

        let dynamic = patterns
            .iter()
            .any(|pattern| pattern.contains(WILDCARD_CHARS));
        let compiled = if dynamic {
            Some(
                patterns
                    .iter()
                    .map(|pattern| {
                        glob::Pattern::new(pattern).map_err(|err| ConfigError::QueuePattern {
                            pattern: pattern.clone(),
                            detail: err.to_string(),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            )
        } else {
            None
        };

        Ok(Self { patterns, compiled })
    }

    /// Whether this resolver re-matches against the live queue set.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.compiled.is_some()
    }

    /// The configured list, as given.
    #[must_use]
    pub fn configured(&self) -> &[String] {
        &self.patterns
    }

    /// Resolve to a concrete ordered queue list.
    ///
    /// Static lists pass through untouched. Dynamic lists match each pattern
    /// against the current queue set (case-sensitive), sort each pattern's
    /// matches alphabetically, concatenate in configured order, and
    /// de-duplicate keeping the first occurrence. A literal `*` therefore
    /// yields every queue in ascending alphabetical order.
    ///
    /// # Errors
    ///
    /// Returns an error if the live queue set cannot be fetched.
    pub async fn resolve(&self, store: &dyn Store) -> Result<Vec<String>, StoreError> {
        let Some(compiled) = &self.compiled else {
            return Ok(self.patterns.clone());
        };

        // BTreeSet iteration is already alphabetical, which gives the
        // per-pattern sort for free.
        let live = store.queues().await?;
        let mut resolved = Vec::new();
        let mut seen = HashSet::new();
        for pattern in compiled {
            for name in &live {
                if pattern.matches(name) && seen.insert(name.clone()) {
                    resolved.push(name.clone());
                }
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn store_with_queues(names: &[&str]) -> MemoryStore {
        let store = MemoryStore::new();
        for name in names {
            store.push(name, "{}").await.unwrap();
        }
        store
    }

    #[test]
    fn test_empty_list_is_a_config_error() {
        let result = QueueResolver::new(Vec::<String>::new());
        assert!(matches!(result, Err(ConfigError::NoQueues)));
    }

    #[test]
    fn test_static_list_is_not_dynamic() {
        let resolver = QueueResolver::new(["high", "low"]).unwrap();
        assert!(!resolver.is_dynamic());
    }

    #[test]
    fn test_wildcard_chars_mark_dynamic() {
        for pattern in ["*", "qu?ue", "q[ab]", "q{a,b}"] {
            let resolver = QueueResolver::new([pattern]).unwrap();
            assert!(resolver.is_dynamic(), "{pattern} should be dynamic");
        }
    }

    #[tokio::test]
    async fn test_static_list_passes_through_in_order() {
        let store = store_with_queues(&["low"]).await;
        let resolver = QueueResolver::new(["high", "low"]).unwrap();

        // Static lists are not filtered by existence.
        assert_eq!(resolver.resolve(&store).await.unwrap(), ["high", "low"]);
    }

    #[tokio::test]
    async fn test_star_yields_all_queues_sorted() {
        let store = store_with_queues(&["zebra", "apple", "mango"]).await;
        let resolver = QueueResolver::new(["*"]).unwrap();

        assert_eq!(
            resolver.resolve(&store).await.unwrap(),
            ["apple", "mango", "zebra"]
        );
    }

    #[tokio::test]
    async fn test_patterns_keep_configured_order_and_dedupe() {
        let store = store_with_queues(&["critical", "crawl_a", "crawl_b", "archive"]).await;
        let resolver = QueueResolver::new(["critical", "crawl_*", "*"]).unwrap();

        // "critical" first, then the crawl queues alphabetically, then the
        // rest of the fleet; nothing repeats.
        assert_eq!(
            resolver.resolve(&store).await.unwrap(),
            ["critical", "crawl_a", "crawl_b", "archive"]
        );
    }

    #[tokio::test]
    async fn test_matching_is_case_sensitive() {
        let store = store_with_queues(&["Crawl", "crawl"]).await;
        let resolver = QueueResolver::new(["crawl*"]).unwrap();

        assert_eq!(resolver.resolve(&store).await.unwrap(), ["crawl"]);
    }

    #[tokio::test]
    async fn test_queues_added_at_runtime_become_visible() {
        let store = store_with_queues(&["a"]).await;
        let resolver = QueueResolver::new(["*"]).unwrap();

        assert_eq!(resolver.resolve(&store).await.unwrap(), ["a"]);

        store.push("b", "{}").await.unwrap();
        assert_eq!(resolver.resolve(&store).await.unwrap(), ["a", "b"]);
    }
}
