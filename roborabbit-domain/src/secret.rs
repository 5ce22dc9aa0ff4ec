use std::fmt;

// ---------------------------------------------------------------------------
// Secret
// ---------------------------------------------------------------------------

/// A credential string that never shows up in `Debug` output or logs.
///
/// Equality compares the underlying value so the connection manager can
/// tell whether the configured password changed between two updates.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Secret(String);

// ---

impl Secret {
    // ---
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The plain-text value. Only the broker adapter should call this.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

// ---

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}
