//! Egress Proxy Selector — derives a per-request egress URL with a rotating session
//! identifier spliced into the credentials, to force the upstream provider to observe a
//! fresh IP per request.

use rand::Rng;
use url::Url;

const SESSION_TOKEN_LEN: usize = 8;
const SESSION_MARKER: &str = "-session-";
const SESSION_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Selects and rewrites the outbound proxy URL per call.
#[derive(Clone)]
pub struct EgressSelector {
    configured: Option<Url>,
}

impl EgressSelector {
    pub fn new(configured: Option<Url>) -> Self {
        Self { configured }
    }

    pub fn is_configured(&self) -> bool {
        self.configured.is_some()
    }

    /// Returns the proxy URL to use for one model-execution call, or `None` for a direct
    /// connection. Model-listing calls never pass through here (the Retry Controller
    /// disables the proxy for that path entirely).
    pub fn select(&self) -> Option<Url> {
        let base = self.configured.as_ref()?;
        Some(splice_session(base, &random_session_token()))
    }

    /// Records that a rotated egress session produced a bad response (407/502/503 while
    /// the proxy was in use). The session token is single-use and random, so there is no
    /// persistent state to quarantine here beyond logging for operators.
    pub fn mark_session_bad(&self) {
        tracing::warn!("egress proxy session returned a failure status");
    }
}

fn random_session_token() -> String {
    let mut rng = rand::thread_rng();
    (0..SESSION_TOKEN_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..SESSION_ALPHABET.len());
            SESSION_ALPHABET[idx] as char
        })
        .collect()
}

/// Splices `<base-user>-session-<token>` into the user portion of `url`, replacing any
/// pre-existing session segment. If `url` carries no username, it's returned unchanged
/// (it doesn't match the recognized credential-bearing pattern).
fn splice_session(url: &Url, token: &str) -> Url {
    let username = url.username();
    if username.is_empty() {
        return url.clone();
    }
    let base_user = username.split(SESSION_MARKER).next().unwrap_or(username);
    let new_user = format!("{base_user}{SESSION_MARKER}{token}");

    let mut spliced = url.clone();
    let _ = spliced.set_username(&new_user);
    spliced
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_configured_proxy_means_direct_connection() {
        let selector = EgressSelector::new(None);
        assert!(selector.select().is_none());
    }

    #[test]
    fn splices_session_token_into_username() {
        let base = Url::parse("http://baseuser:pw@proxy.example.com:8080").unwrap();
        let selector = EgressSelector::new(Some(base));
        let selected = selector.select().unwrap();
        assert!(selected.username().starts_with("baseuser-session-"));
        assert_eq!(selected.username().len(), "baseuser-session-".len() + 8);
    }

    #[test]
    fn replaces_preexisting_session_segment_rather_than_appending() {
        let base = Url::parse("http://baseuser-session-aaaaaaaa:pw@proxy.example.com:8080").unwrap();
        let spliced = splice_session(&base, "bbbbbbbb");
        assert_eq!(spliced.username(), "baseuser-session-bbbbbbbb");
    }

    #[test]
    fn url_without_username_is_returned_verbatim() {
        let base = Url::parse("http://proxy.example.com:8080").unwrap();
        let selector = EgressSelector::new(Some(base.clone()));
        assert_eq!(selector.select().unwrap(), base);
    }

    #[test]
    fn two_calls_produce_different_sessions() {
        let base = Url::parse("http://baseuser:pw@proxy.example.com:8080").unwrap();
        let selector = EgressSelector::new(Some(base));
        let a = selector.select().unwrap();
        let b = selector.select().unwrap();
        assert_ne!(a.username(), b.username());
    }
}
