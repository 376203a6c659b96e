//! URL block-rule compilation.
//!
//! Three rule classes share one normalization path: the built-in ad/tracker
//! catalog (silently dropped), user URL blocks (aborted), and link-policy
//! blocks (served an interstitial). Rules are compiled once at session
//! start; a pattern that fails to compile is logged and skipped without
//! affecting the rest of the set.

use {regex::Regex, tracing::warn};

use crate::error::SessionError;

/// Hosts that must never be caught by link-policy rules: blocking a site
/// must not break the third-party sign-in flows needed to use it.
pub const AUTH_WHITELIST: &[&str] = &[
    "accounts.google.com",
    "accounts.youtube.com",
    "login.microsoftonline.com",
    "appleid.apple.com",
    "www.facebook.com/login",
    "api.twitter.com/oauth",
    "github.com/login",
];

/// Ad and tracker hosts dropped on every session. Kept as bare fragments;
/// a request matches when the fragment appears in its URL.
pub const AD_TRACKER_CATALOG: &[&str] = &[
    "googleads.g.doubleclick.net",
    "pagead2.googlesyndication.com",
    "googlesyndication.com",
    "adservice.google.com",
    "ads.google.com",
    "doubleclick.net",
    "criteo.com",
    "taboola.com",
    "outbrain.com",
    "facebook.com/tr",
    "connect.facebook.net",
    "analytics.google.com",
    "google-analytics.com",
    "mc.yandex.ru",
    "adnxs.com",
    "adsrvr.org",
    "amazon-adsystem.com",
    "openx.net",
    "pubmatic.com",
    "rubiconproject.com",
    "casalemedia.com",
    "eskimi.com",
    "seedtag.com",
    "stickyadstv.com",
    "safeframe.googlesyndication.com",
    "nextmillmedia.com",
    "adkernel.com",
    "cootlogix.com",
    "ingage.tech",
    "onetag-sys.com",
    "yellowblue.io",
    "minutemedia-prebid.com",
    "adtarget.com.tr",
];

/// Simple URL matcher used by element rules and the ad catalog. A closed
/// set of kinds derived from where `*` sits in the pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlPattern {
    Any,
    Exact(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
}

impl UrlPattern {
    #[must_use]
    pub fn parse(pattern: &str) -> Self {
        let p = pattern.trim().to_lowercase();
        if p == "*" {
            return Self::Any;
        }
        match (p.starts_with('*'), p.ends_with('*')) {
            (true, true) => Self::Contains(p[1..p.len() - 1].to_string()),
            (true, false) => Self::Suffix(p[1..].to_string()),
            (false, true) => Self::Prefix(p[..p.len() - 1].to_string()),
            // Bare fragments match anywhere in the URL.
            (false, false) => Self::Contains(p),
        }
    }

    #[must_use]
    pub fn matches(&self, url: &str) -> bool {
        let u = url.to_lowercase();
        match self {
            Self::Any => true,
            Self::Exact(p) => u == *p,
            Self::Prefix(p) => u.starts_with(p),
            Self::Suffix(p) => u.ends_with(p),
            Self::Contains(p) => u.contains(p),
        }
    }
}

/// A user-supplied block pattern compiled to an anchored, case-insensitive
/// regex. Immutable after compilation.
#[derive(Debug, Clone)]
pub struct BlockRule {
    raw: String,
    regex: Regex,
}

impl BlockRule {
    /// Compile one pattern. Scheme and a leading `www.` are stripped, regex
    /// metacharacters escaped, and `*` widened to `.*`. Patterns without a
    /// wildcard also match any subdomain and any path.
    pub fn compile(pattern: &str) -> Result<Self, SessionError> {
        let raw = pattern.trim();
        if raw.is_empty() {
            return Err(SessionError::Rule {
                pattern: pattern.to_string(),
                reason: "empty pattern".into(),
            });
        }

        let mut clean = raw;
        if let Some((_, rest)) = clean.split_once("://") {
            clean = rest;
        }
        clean = clean.strip_prefix("www.").unwrap_or(clean);

        let escaped = escape_keeping_star(clean);
        let source = if clean.contains('*') {
            format!(r"^https?://(www\.)?{}(/.*)?$", escaped.replace('*', ".*"))
        } else {
            format!(r"^https?://([a-zA-Z0-9-]+\.)*{escaped}(/.*)?$")
        };

        let regex = Regex::new(&format!("(?i){source}")).map_err(|e| SessionError::Rule {
            pattern: raw.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            raw: raw.to_string(),
            regex,
        })
    }

    #[must_use]
    pub fn matches(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.raw
    }
}

/// Escape regex metacharacters but leave `*` for wildcard expansion.
fn escape_keeping_star(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '.' | '+' | '^' | '$' | '{' | '}' | '(' | ')' | '|' | '[' | ']' | '\\' | '?' => {
                out.push('\\');
                out.push(c);
            },
            _ => out.push(c),
        }
    }
    out
}

/// Compile a set of user patterns, dropping the ones that fail.
#[must_use]
pub fn compile_all(patterns: &[String], class: &str) -> Vec<BlockRule> {
    patterns
        .iter()
        .filter_map(|p| match BlockRule::compile(p) {
            Ok(rule) => Some(rule),
            Err(e) => {
                warn!(class, pattern = %p, error = %e, "skipping bad block pattern");
                None
            },
        })
        .collect()
}

/// Whether the request targets an ad or tracker host from the catalog.
#[must_use]
pub fn is_ad_or_tracker(url: &str) -> bool {
    static CATALOG: std::sync::OnceLock<Vec<UrlPattern>> = std::sync::OnceLock::new();
    let patterns = CATALOG.get_or_init(|| {
        AD_TRACKER_CATALOG
            .iter()
            .map(|frag| UrlPattern::parse(frag))
            .collect()
    });
    patterns.iter().any(|p| p.matches(url))
}

/// Whether the URL belongs to a whitelisted authentication provider.
#[must_use]
pub fn is_auth_whitelisted(url: &str) -> bool {
    AUTH_WHITELIST.iter().any(|domain| url.contains(domain))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_literal_segments_in_order() {
        let rule = BlockRule::compile("*.badsite.com").unwrap();
        assert!(rule.matches("https://ads.badsite.com"));
        assert!(rule.matches("https://tracker.badsite.com"));
        assert!(rule.matches("HTTPS://ADS.BADSITE.COM"));
        assert!(!rule.matches("https://badsite.com.safe.net"));
    }

    #[test]
    fn wildcard_matches_urls_with_paths() {
        let rule = BlockRule::compile("*.badsite.com").unwrap();
        assert!(rule.matches("https://ads.badsite.com/x"));
        assert!(rule.matches("https://tracker.badsite.com/pixel?id=1"));
        assert!(!rule.matches("https://badsite.com.safe.net/x"));
    }

    #[test]
    fn wildcard_is_case_insensitive_and_spans_arbitrary_content() {
        let rule = BlockRule::compile("shop.*.example.com").unwrap();
        assert!(rule.matches("https://shop.EU.example.com"));
        assert!(rule.matches("https://shop.anything.at.all.example.com"));
        assert!(!rule.matches("https://shop.example.org"));
    }

    #[test]
    fn plain_pattern_matches_subdomains_and_paths() {
        let rule = BlockRule::compile("badsite.com").unwrap();
        assert!(rule.matches("https://badsite.com"));
        assert!(rule.matches("http://www.badsite.com/path?q=1"));
        assert!(rule.matches("https://cdn.badsite.com/asset.js"));
        assert!(!rule.matches("https://notbadsite.com"));
    }

    #[test]
    fn scheme_and_www_are_stripped_before_compilation() {
        let rule = BlockRule::compile("https://www.badsite.com").unwrap();
        assert!(rule.matches("http://badsite.com"));
        assert!(rule.matches("https://www.badsite.com/a"));
    }

    #[test]
    fn empty_pattern_is_rejected() {
        assert!(BlockRule::compile("   ").is_err());
    }

    #[test]
    fn compile_all_isolates_bad_patterns() {
        let rules = compile_all(
            &["good.example".into(), String::new(), "also-good.example".into()],
            "url-block",
        );
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn ad_catalog_matches() {
        assert!(is_ad_or_tracker(
            "https://googleads.g.doubleclick.net/pagead/ads"
        ));
        assert!(is_ad_or_tracker("https://cdn.Taboola.com/thing.js"));
        assert!(!is_ad_or_tracker("https://example.com/news"));
    }

    #[test]
    fn auth_whitelist_matches() {
        assert!(is_auth_whitelisted(
            "https://accounts.google.com/o/oauth2/v2/auth"
        ));
        assert!(is_auth_whitelisted("https://github.com/login/oauth"));
        assert!(!is_auth_whitelisted("https://example.com/login"));
    }

    #[test]
    fn url_pattern_kinds() {
        assert!(UrlPattern::parse("*").matches("https://x.example"));
        assert!(UrlPattern::parse("*checkout*").matches("https://x.example/Checkout/cart"));
        assert!(UrlPattern::parse("https://x.example/*").matches("https://x.example/deep/path"));
        assert!(UrlPattern::parse("*.example/landing").matches("https://x.example/landing"));
        assert!(UrlPattern::parse("x.example").matches("https://x.example/anything"));
        assert!(!UrlPattern::parse("*checkout*").matches("https://x.example/cart"));
    }
}
