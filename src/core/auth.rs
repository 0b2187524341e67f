//! Authentication token holder shared by the orchestrator and HTTP adapters.

use std::sync::RwLock;

/// Holds the current bearer token, if any
#[derive(Debug, Default)]
pub struct AuthToken {
    token: RwLock<Option<String>>,
}

impl AuthToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    /// Replace the token; empty strings clear it
    pub fn set(&self, token: impl Into<String>) {
        let token = token.into();
        let value = if token.trim().is_empty() { None } else { Some(token) };
        match self.token.write() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }

    pub fn clear(&self) {
        match self.token.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    pub fn get(&self) -> Option<String> {
        match self.token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_clear() {
        let auth = AuthToken::new();
        assert!(!auth.is_set());

        auth.set("abc");
        assert_eq!(auth.get(), Some("abc".to_string()));

        auth.set("  ");
        assert!(!auth.is_set());

        auth.set("xyz");
        auth.clear();
        assert!(auth.get().is_none());
    }
}
