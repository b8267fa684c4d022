//! Server-assigned session token.

use parking_lot::RwLock;
use tracing::debug;

/// The session token the server hands back after first contact.
///
/// Written only by the reader loop, read when stamping outgoing requests.
#[derive(Debug, Default)]
pub struct SessionState {
    token: RwLock<Option<String>>,
}

impl SessionState {
    /// Create an empty session.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current token, if one is known.
    pub fn current(&self) -> Option<String> {
        self.token.read().clone()
    }

    /// Record a token seen on the wire.
    ///
    /// Returns `true` if it replaced a different (or missing) value.
    pub fn observe(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        if self.token.read().as_deref() == Some(token) {
            return false;
        }
        let mut slot = self.token.write();
        if slot.as_deref() == Some(token) {
            return false;
        }
        debug!(previous = ?slot.as_deref(), session_id = token, "session id updated");
        *slot = Some(token.to_owned());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn starts_empty() {
        let session = SessionState::new();
        assert!(session.current().is_none());
    }

    #[test]
    fn observe_sets_token() {
        let session = SessionState::new();
        assert!(session.observe("sess-1"));
        assert_eq!(session.current().as_deref(), Some("sess-1"));
    }

    #[test]
    fn observe_same_token_is_noop() {
        let session = SessionState::new();
        assert!(session.observe("sess-1"));
        assert!(!session.observe("sess-1"));
    }

    #[test]
    fn observe_new_token_replaces() {
        let session = SessionState::new();
        let _ = session.observe("sess-1");
        assert!(session.observe("sess-2"));
        assert_eq!(session.current().as_deref(), Some("sess-2"));
    }

    #[test]
    fn empty_token_ignored() {
        let session = SessionState::new();
        let _ = session.observe("sess-1");
        assert!(!session.observe(""));
        assert_eq!(session.current().as_deref(), Some("sess-1"));
    }

    #[test]
    fn concurrent_reads_never_see_torn_values() {
        let session = Arc::new(SessionState::new());
        let writer = {
            let session = Arc::clone(&session);
            std::thread::spawn(move || {
                for i in 0..500 {
                    let _ = session.observe(&format!("token-{i}"));
                }
            })
        };
        let reader = {
            let session = Arc::clone(&session);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    if let Some(token) = session.current() {
                        assert!(token.starts_with("token-"));
                    }
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(session.current().as_deref(), Some("token-499"));
    }
}
