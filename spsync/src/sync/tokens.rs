//! Symbolic url prefixes (`~site/`, `~hubsite/`, ...) used in published urls.
//!
//! Tokens that need substitution are resolved lazily, once per process. A
//! failed resolution is memoized too, so every later url carrying that token
//! resolves to `None` without touching the network again.

use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::remote::TokenSource;

pub const PUBLISH_ROOT: &str = "~publishroot/";
pub const SITE: &str = "~site/";
pub const SITE_COLLECTION: &str = "~sitecollection/";
pub const HUB_SITE: &str = "~hubsite/";

/// Registry order is resolution order.
const REGISTRY: [(&str, bool); 4] = [
    (PUBLISH_ROOT, true),
    (SITE, false),
    (SITE_COLLECTION, false),
    (HUB_SITE, true),
];

struct HashToken {
    key: &'static str,
    needs_resolution: bool,
    cached: OnceCell<Option<String>>,
}

pub struct TokenResolver<S> {
    source: S,
    tokens: Vec<HashToken>,
}

impl<S: TokenSource> TokenResolver<S> {
    pub fn new(source: S) -> Self {
        let tokens = REGISTRY
            .iter()
            .map(|&(key, needs_resolution)| HashToken {
                key,
                needs_resolution,
                cached: OnceCell::new(),
            })
            .collect();
        Self { source, tokens }
    }

    pub fn is_tokenized(&self, uri: &str) -> bool {
        let lower = uri.to_ascii_lowercase();
        self.tokens.iter().any(|token| lower.contains(token.key))
    }

    /// Substitutes every token that needs resolution. `None` tells the caller
    /// to skip the item: one of its tokens points at something that does not
    /// exist.
    pub async fn resolve(&self, uri: &str) -> Option<String> {
        let lower = uri.to_ascii_lowercase();
        let mut resolved = uri.to_string();
        for token in self.tokens.iter().filter(|t| lower.contains(t.key)) {
            if !token.needs_resolution {
                continue;
            }
            let value = token
                .cached
                .get_or_init(|| self.fetch(token.key))
                .await
                .as_deref()?;
            let replacement = format!("{}/", value.trim_end_matches('/'));
            resolved = replace_ignore_case(&resolved, token.key, &replacement);
        }
        Some(resolved)
    }

    async fn fetch(&self, key: &'static str) -> Option<String> {
        match self.source.resolve_token(key).await {
            Ok(Some(value)) if !value.is_empty() => {
                debug!(token = key, value = %value, "token resolved");
                Some(value)
            }
            Ok(_) => {
                warn!(token = key, "token target does not exist");
                None
            }
            Err(err) => {
                warn!(token = key, error = %err, "token resolution failed");
                None
            }
        }
    }
}

/// `needle` must be ASCII; byte offsets in the lowercased copy then line up
/// with `haystack`.
fn replace_ignore_case(haystack: &str, needle: &str, replacement: &str) -> String {
    let lower = haystack.to_ascii_lowercase();
    let needle = needle.to_ascii_lowercase();
    let mut out = String::with_capacity(haystack.len());
    let mut last = 0;
    for (idx, _) in lower.match_indices(&needle) {
        out.push_str(&haystack[last..idx]);
        out.push_str(replacement);
        last = idx + needle.len();
    }
    out.push_str(&haystack[last..]);
    out
}
