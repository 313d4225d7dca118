//! Maps a hostname to the configured DNS provider that serves it.

use crate::config::DnsProviderConfig;

/// Outcome of provider resolution for one hostname.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The winning provider, or `None` for the manual fallback.
    pub provider: Option<DnsProviderConfig>,

    /// Two or more providers tied at the longest suffix. The returned
    /// provider is the deterministic pick (lowest id); callers surface a
    /// warning but proceed.
    pub ambiguous: bool,
}

/// Longest-suffix matcher over the configured providers.
pub struct ProviderResolver {
    providers: Vec<DnsProviderConfig>,
}

impl ProviderResolver {
    pub fn new(providers: Vec<DnsProviderConfig>) -> Self {
        Self { providers }
    }

    /// Find the provider for `hostname`.
    ///
    /// A stored suffix matches the hostname itself and any subdomain of it,
    /// on label boundaries: `example.com` matches `example.com` and
    /// `api.example.com` but never `notexample.com`. The longest matching
    /// suffix wins; ties are broken by lowest provider id and flagged
    /// ambiguous. No match falls back to the manual adapter.
    pub fn resolve(&self, hostname: &str) -> Resolution {
        let hostname = canonical(hostname);

        let mut best: Option<(&DnsProviderConfig, usize)> = None;
        let mut ambiguous = false;

        for provider in &self.providers {
            for suffix in &provider.domain_suffixes {
                let suffix = canonical(suffix);
                if !suffix_matches(&hostname, &suffix) {
                    continue;
                }

                match best {
                    Some((winner, len)) if suffix.len() == len => {
                        ambiguous = true;
                        if provider.id < winner.id {
                            best = Some((provider, len));
                        }
                    }
                    Some((_, len)) if suffix.len() > len => {
                        ambiguous = false;
                        best = Some((provider, suffix.len()));
                    }
                    None => {
                        best = Some((provider, suffix.len()));
                    }
                    _ => {}
                }
            }
        }

        if ambiguous {
            if let Some((winner, _)) = best {
                log::warn!(
                    "Multiple providers match {hostname} at the same suffix length; using {}",
                    winner.id
                );
            }
        }

        Resolution {
            provider: best.map(|(provider, _)| provider.clone()),
            ambiguous,
        }
    }
}

fn canonical(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

fn suffix_matches(hostname: &str, suffix: &str) -> bool {
    hostname == suffix
        || (hostname.len() > suffix.len()
            && hostname.ends_with(suffix)
            && hostname.as_bytes()[hostname.len() - suffix.len() - 1] == b'.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::ProviderType;

    fn provider(id: &str, suffixes: &[&str]) -> DnsProviderConfig {
        DnsProviderConfig {
            id: id.to_owned(),
            provider_type: ProviderType::Cloudflare,
            label: id.to_owned(),
            domain_suffixes: suffixes.iter().map(|s| (*s).to_owned()).collect(),
            credential_ref: None,
        }
    }

    #[test]
    fn longest_suffix_wins() {
        let resolver = ProviderResolver::new(vec![
            provider("p-broad", &["example.com"]),
            provider("p-narrow", &["api.example.com"]),
        ]);

        let res = resolver.resolve("api.example.com");
        assert_eq!(res.provider.unwrap().id, "p-narrow");
        assert!(!res.ambiguous);
    }

    #[test]
    fn suffix_matches_subdomains_and_itself() {
        let resolver = ProviderResolver::new(vec![provider("p1", &["example.com"])]);

        assert_eq!(
            resolver.resolve("example.com").provider.unwrap().id,
            "p1"
        );
        assert_eq!(
            resolver.resolve("deep.sub.example.com").provider.unwrap().id,
            "p1"
        );
    }

    #[test]
    fn no_partial_label_match() {
        let resolver = ProviderResolver::new(vec![provider("p1", &["example.com"])]);
        assert!(resolver.resolve("notexample.com").provider.is_none());
    }

    #[test]
    fn unmatched_hostname_falls_back_to_manual() {
        let resolver = ProviderResolver::new(vec![provider("p1", &["example.com"])]);
        let res = resolver.resolve("other.example.net");
        assert!(res.provider.is_none());
        assert!(!res.ambiguous);
    }

    #[test]
    fn ties_are_ambiguous_and_deterministic() {
        let resolver = ProviderResolver::new(vec![
            provider("p-b", &["example.com"]),
            provider("p-a", &["example.com"]),
        ]);

        let first = resolver.resolve("example.com");
        assert!(first.ambiguous);
        assert_eq!(first.provider.as_ref().unwrap().id, "p-a");

        // same answer every time
        for _ in 0..10 {
            let again = resolver.resolve("example.com");
            assert_eq!(again.provider.as_ref().unwrap().id, "p-a");
            assert!(again.ambiguous);
        }
    }

    #[test]
    fn case_and_trailing_dot_are_ignored() {
        let resolver = ProviderResolver::new(vec![provider("p1", &["Example.COM"])]);
        assert_eq!(
            resolver.resolve("API.example.com.").provider.unwrap().id,
            "p1"
        );
    }
}
