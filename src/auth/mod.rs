//! Bearer token sources.
//!
//! The dashboard stores the signed-in user's token locally; requests carry
//! it as `Authorization: Bearer <token>` when one exists and go out
//! anonymously otherwise.

use std::path::PathBuf;

use tracing::warn;

/// Supplies the current bearer token, if any.
///
/// Called once per request so a token written by a login flow is picked up
/// without rebuilding the client.
pub trait TokenStore: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Anonymous access.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoToken;

impl TokenStore for NoToken {
    fn token(&self) -> Option<String> {
        None
    }
}

/// A fixed token held in memory.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenStore for StaticToken {
    fn token(&self) -> Option<String> {
        normalize(&self.0)
    }
}

/// Reads the token from a file on every call.
///
/// A missing file or one holding only whitespace means "no token". Other
/// read errors are logged and also treated as "no token".
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenStore for FileTokenStore {
    fn token(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => normalize(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read token file");
                None
            }
        }
    }
}

/// Trims surrounding whitespace. A token with control characters inside
/// could split the `Authorization` header, so it is dropped.
fn normalize(raw: &str) -> Option<String> {
    let token = raw.trim();
    if token.is_empty() {
        return None;
    }
    if token.chars().any(|c| c.is_control()) {
        warn!("bearer token contains control characters, sending request without it");
        return None;
    }
    Some(token.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_token_trims_and_rejects_blank() {
        assert_eq!(StaticToken::new("  abc\n").token().as_deref(), Some("abc"));
        assert_eq!(StaticToken::new("   ").token(), None);
        assert_eq!(NoToken.token(), None);
    }

    #[test]
    fn token_with_control_characters_is_dropped() {
        assert_eq!(StaticToken::new("abc\r\nX-Injected: evil").token(), None);
        assert_eq!(StaticToken::new("ab\0c").token(), None);
        assert_eq!(StaticToken::new("a\tb").token(), None);
    }

    #[test]
    fn file_token_store_reads_current_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        let store = FileTokenStore::new(&path);

        assert_eq!(store.token(), None);

        std::fs::write(&path, "first-token\n").unwrap();
        assert_eq!(store.token().as_deref(), Some("first-token"));

        std::fs::write(&path, "second-token").unwrap();
        assert_eq!(store.token().as_deref(), Some("second-token"));

        std::fs::write(&path, "").unwrap();
        assert_eq!(store.token(), None);

        std::fs::write(&path, "abc\r\nX-Injected: evil\n").unwrap();
        assert_eq!(store.token(), None);
    }
}
