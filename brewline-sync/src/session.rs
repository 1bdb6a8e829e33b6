//! The acting user's credential.

use std::sync::{Arc, RwLock};

/// Shared, cloneable holder of the opaque credential. Empty when signed out.
#[derive(Debug, Clone, Default)]
pub struct Session {
    credential: Arc<RwLock<Option<String>>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, credential: impl Into<String>) {
        *self.credential.write().unwrap_or_else(|e| e.into_inner()) = Some(credential.into());
    }

    pub fn sign_out(&self) {
        *self.credential.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn credential(&self) -> Option<String> {
        self.credential.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.credential
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_deref()
            .is_some_and(|c| !c.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_in_out() {
        let session = Session::new();
        assert!(!session.is_authenticated());

        let shared = session.clone();
        session.sign_in("tok");
        assert!(shared.is_authenticated());
        assert_eq!(shared.credential().as_deref(), Some("tok"));

        shared.sign_out();
        assert!(!session.is_authenticated());
    }

    #[test]
    fn test_empty_credential_is_not_authenticated() {
        let session = Session::new();
        session.sign_in("");
        assert!(!session.is_authenticated());
    }
}
