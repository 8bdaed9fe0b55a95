//! Token resolution for outgoing requests.

use crate::error::{Error, Result};

/// How strictly the client requires an auth token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// Attach a token when one resolves; proceed anonymously otherwise.
    #[default]
    Auto,
    /// Fail with [`Error::MissingCredential`] when no token resolves.
    Required,
    /// Never attach a token, even when one is available.
    None,
}

/// Resolves the auth token for outgoing requests.
///
/// Stateless: every call re-reads the environment, so a token rotated
/// mid-run is picked up on the next request rather than at startup.
/// Failures are not cached either.
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    /// An explicit token (e.g. from a config file) that wins over the
    /// environment lookup.
    token: Option<String>,
    sources: Vec<String>,
    mode: AuthMode,
}

impl CredentialResolver {
    pub fn new(sources: Vec<String>, mode: AuthMode) -> Self {
        Self {
            token: None,
            sources,
            mode,
        }
    }

    /// Use an explicit token instead of the environment lookup.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    /// Resolve the token to attach, if any.
    ///
    /// Returns `Ok(None)` in `Auto` mode when nothing resolves, and in
    /// `None` mode always.
    pub fn resolve(&self) -> Result<Option<String>> {
        if self.mode == AuthMode::None {
            return Ok(None);
        }

        if let Some(token) = &self.token
            && !token.is_empty()
        {
            return Ok(Some(token.clone()));
        }

        for var in &self.sources {
            if let Ok(value) = std::env::var(var)
                && !value.is_empty()
            {
                return Ok(Some(value));
            }
        }

        match self.mode {
            AuthMode::Required => Err(Error::MissingCredential {
                sources: self.sources.clone(),
            }),
            _ => Ok(None),
        }
    }
}
