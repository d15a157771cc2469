//! Sitemap delta cache: snapshot pages, assign content hashes, and compute
//! structural-equivalence deltas on demand (design notes §4.G).

pub mod cache;
pub mod hash;
pub mod snapshot;

pub use cache::{DeltaCache, DeltaResponse};
pub use snapshot::{build_snapshot, PageSnapshot, WidgetSnapshot};

/// The delta cache's key is the sitemap path stripped of its leading `rest/`
/// prefix and any query string, so the HTTP delta route and the WebSocket
/// `fetchDelta` path agree on the same key for the same page.
pub fn canonical_key(raw: &str) -> String {
    let without_query = raw.split('?').next().unwrap_or(raw);
    without_query
        .trim_start_matches('/')
        .trim_start_matches("rest/")
        .to_string()
}

#[cfg(test)]
mod canonical_key_tests {
    use super::canonical_key;

    #[test]
    fn strips_query_and_rest_prefix() {
        assert_eq!(
            canonical_key("/rest/sitemaps/home/group?delta=1&since=abc"),
            "sitemaps/home/group"
        );
        assert_eq!(canonical_key("sitemaps/home"), "sitemaps/home");
    }
}
