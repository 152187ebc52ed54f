//! Admin session-cookie login. The HTML dashboard and the cookie-based UX it drives
//! are out of core scope (external collaborators); what's implemented here is just
//! enough of the interface for `/admin/login` and `/admin/logout` to exist and for the
//! rest of the admin surface to recognize a logged-in session.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

const SESSION_TOKEN_LEN: usize = 32;
const SESSION_TTL: Duration = Duration::from_secs(12 * 3600);
const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// In-memory admin session store. A single-process gateway doesn't need a distributed
/// session backend; sessions are lost on restart, which is acceptable since the static
/// admin bearer token remains a valid credential throughout.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Instant>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self) -> String {
        let token = random_token();
        self.sessions.lock().unwrap().insert(token.clone(), Instant::now() + SESSION_TTL);
        token
    }

    pub fn is_valid(&self, token: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get(token) {
            Some(expiry) if *expiry >= Instant::now() => true,
            Some(_) => {
                sessions.remove(token);
                false
            }
            None => false,
        }
    }

    pub fn remove(&self, token: &str) {
        self.sessions.lock().unwrap().remove(token);
    }
}

fn random_token() -> String {
    let mut rng = rand::thread_rng();
    (0..SESSION_TOKEN_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..TOKEN_ALPHABET.len());
            TOKEN_ALPHABET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_session_is_valid_until_removed() {
        let store = SessionStore::new();
        let token = store.create();
        assert!(store.is_valid(&token));
        store.remove(&token);
        assert!(!store.is_valid(&token));
    }

    #[test]
    fn unknown_token_is_invalid() {
        let store = SessionStore::new();
        assert!(!store.is_valid("not-a-real-token"));
    }
}
