//! Provider routing of Web Push endpoints to outbound queues.

use std::collections::{BTreeMap, BTreeSet};

/// Queue used for endpoints that match no configured provider.
pub const DEFAULT_QUEUE_NAME: &str = "webpush.default";

/// Prefix of every provider queue name.
const QUEUE_PREFIX: &str = "webpush";

/// Maps Web Push endpoint URLs to the queue of the push service that owns them.
#[derive(Debug, Clone, Default)]
pub struct ProviderRouter {
    /// (url prefix, queue name) in provider key order, then configured order.
    routes: Vec<(String, String)>,
}

impl ProviderRouter {
    /// Builds a router from `provider -> [url prefix]` mappings.
    ///
    /// Providers are matched in key order and each provider's prefixes in the
    /// order given; the first matching prefix wins.
    pub fn new(mappings: &BTreeMap<String, Vec<String>>) -> Self {
        let routes = mappings
            .iter()
            .flat_map(|(provider, prefixes)| {
                let queue = queue_name(provider);
                prefixes
                    .iter()
                    .map(|p| p.trim())
                    .filter(|p| !p.is_empty())
                    .map(move |prefix| (prefix.to_string(), queue.clone()))
            })
            .collect();

        Self { routes }
    }

    /// Resolves the queue for an endpoint URL (case-insensitive prefix match).
    pub fn resolve_queue(&self, endpoint_url: &str) -> &str {
        self.routes
            .iter()
            .find(|(prefix, _)| starts_with_ignore_case(endpoint_url, prefix))
            .map(|(_, queue)| queue.as_str())
            .unwrap_or(DEFAULT_QUEUE_NAME)
    }

    /// Queue names this router can resolve to, default queue included.
    pub fn queue_names(&self) -> BTreeSet<&str> {
        self.routes
            .iter()
            .map(|(_, queue)| queue.as_str())
            .chain([DEFAULT_QUEUE_NAME])
            .collect()
    }
}

/// Queue name for a provider key.
pub fn queue_name(provider: &str) -> String {
    format!("{QUEUE_PREFIX}.{}", provider.trim().to_ascii_lowercase())
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> ProviderRouter {
        let mut mappings = BTreeMap::new();
        mappings.insert(
            "google".to_string(),
            vec!["https://fcm.googleapis.com".to_string()],
        );
        mappings.insert(
            "mozilla".to_string(),
            vec![
                "https://updates.push.services.mozilla.com".to_string(),
                "https://push.services.mozilla.com".to_string(),
            ],
        );
        mappings.insert(
            "apple".to_string(),
            vec!["https://web.push.apple.com".to_string()],
        );
        ProviderRouter::new(&mappings)
    }

    #[test]
    fn test_configured_prefix_resolves_to_provider_queue() {
        let router = router();
        assert_eq!(
            router.resolve_queue("https://fcm.googleapis.com/fcm/send/abc"),
            "webpush.google"
        );
        assert_eq!(
            router.resolve_queue("https://updates.push.services.mozilla.com/wpush/v2/x"),
            "webpush.mozilla"
        );
        assert_eq!(
            router.resolve_queue("https://web.push.apple.com/QGx"),
            "webpush.apple"
        );
    }

    #[test]
    fn test_match_is_case_insensitive() {
        assert_eq!(
            router().resolve_queue("HTTPS://FCM.GoogleApis.com/fcm/send/abc"),
            "webpush.google"
        );
    }

    #[test]
    fn test_unmatched_endpoint_uses_default_queue() {
        let router = router();
        assert_eq!(
            router.resolve_queue("https://notify.windows.com/w/?token=1"),
            DEFAULT_QUEUE_NAME
        );
        assert_eq!(router.resolve_queue(""), DEFAULT_QUEUE_NAME);
        assert_eq!(router.resolve_queue("https://fcm"), DEFAULT_QUEUE_NAME);
        assert_eq!(
            ProviderRouter::default().resolve_queue("https://fcm.googleapis.com/x"),
            DEFAULT_QUEUE_NAME
        );
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let router = router();
        let endpoint = "https://fcm.googleapis.com/fcm/send/abc";
        let first = router.resolve_queue(endpoint).to_string();
        for _ in 0..10 {
            assert_eq!(router.resolve_queue(endpoint), first);
        }
    }

    #[test]
    fn test_queue_names_are_unique() {
        let mut mappings = BTreeMap::new();
        mappings.insert(
            "apple".to_string(),
            vec!["https://web.push.apple.com".to_string()],
        );
        mappings.insert(
            "default".to_string(),
            vec!["https://push.example.net".to_string()],
        );
        mappings.insert(
            "google".to_string(),
            vec![
                "https://fcm.googleapis.com".to_string(),
                "https://android.googleapis.com".to_string(),
            ],
        );
        mappings.insert(
            "mozilla".to_string(),
            vec!["https://updates.push.services.mozilla.com".to_string()],
        );

        let router = ProviderRouter::new(&mappings);
        let names: Vec<&str> = router
            .queue_names()
            .into_iter()
            .collect();
        assert_eq!(
            names,
            [
                "webpush.apple",
                "webpush.default",
                "webpush.google",
                "webpush.mozilla"
            ]
        );
        assert_eq!(
            ProviderRouter::default().queue_names(),
            BTreeSet::from([DEFAULT_QUEUE_NAME])
        );
    }

    #[test]
    fn test_non_ascii_endpoint_does_not_panic() {
        assert_eq!(router().resolve_queue("https://fcmé"), DEFAULT_QUEUE_NAME);
    }
}
