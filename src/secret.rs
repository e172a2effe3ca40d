use std::fmt;

use zeroize::Zeroize;

/// A wrapper that keeps plaintext field values and key material out of logs.
///
/// `Secret<T>` is used for every decrypted value and every raw key buffer the
/// crate handles. The wrapped value is only reachable through
/// [`expose_secret`](Self::expose_secret), and it is zeroized when dropped.
///
/// # Security Properties
///
/// - Does NOT implement `Deref`, `AsRef`, `Borrow`, `Clone`, `Copy` or `Serialize`
/// - Debug and Display output is always `[REDACTED]`
/// - No type information is leaked in formatted output
/// - Memory is wiped on drop
///
/// # Examples
///
/// ```
/// use fieldguard_core::Secret;
///
/// let plaintext = Secret::new("A1234567".to_string());
///
/// assert_eq!(format!("{:?}", plaintext), "[REDACTED]");
/// assert_eq!(plaintext.to_string(), "[REDACTED]");
///
/// assert_eq!(plaintext.expose_secret(), "A1234567");
/// ```
// BREAKING CHANGE WARNING: Do NOT add Clone, Copy, Default or Serialize derives.
// These would let plaintext be duplicated or written out without an explicit expose call.
pub struct Secret<T: Zeroize> {
    // BREAKING CHANGE WARNING: This field MUST remain private (CWE-532).
    inner: T,
}

impl<T: Zeroize> Secret<T> {
    /// Wraps a sensitive value.
    pub fn new(value: T) -> Self {
        Self { inner: value }
    }

    /// Explicitly exposes the secret value.
    ///
    /// # Security Warning
    ///
    /// The returned reference must not be logged, formatted into an error
    /// message, or written to an audit record.
    pub fn expose_secret(&self) -> &T {
        &self.inner
    }

    /// Applies `f` to the inner value, producing a new secret.
    ///
    /// The original value is zeroized once `f` returns.
    pub fn map<U: Zeroize>(self, f: impl FnOnce(&T) -> U) -> Secret<U> {
        Secret::new(f(&self.inner))
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.inner.zeroize();
    }
}

impl<T: Zeroize> From<T> for Secret<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    /// BREAKING CHANGE WARNING: This MUST unconditionally return "[REDACTED]".
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    /// BREAKING CHANGE WARNING: This MUST unconditionally return "[REDACTED]".
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_redacts_debug() {
        let value = Secret::new("A1234567".to_string());
        let debug_output = format!("{:?}", value);

        assert_eq!(debug_output, "[REDACTED]");
        assert!(!debug_output.contains("A1234567"));
        assert!(!debug_output.contains("String"));
    }

    #[test]
    fn secret_redacts_display() {
        let key = Secret::new(vec![0xAAu8; 32]);
        assert_eq!(format!("{}", key), "[REDACTED]");
    }

    #[test]
    fn secret_exposes_when_explicit() {
        let secret = Secret::new(42u32);
        assert_eq!(*secret.expose_secret(), 42);
    }

    #[test]
    fn secret_map_converts_bytes_to_string() {
        let bytes = Secret::new(b"estate-001".to_vec());
        let text = bytes.map(|b| String::from_utf8_lossy(b).into_owned());
        assert_eq!(text.expose_secret(), "estate-001");
    }

    #[test]
    fn redaction_survives_nesting() {
        let nested = Some(Secret::new("hunter2".to_string()));
        let debug_output = format!("{:?}", nested);
        assert_eq!(debug_output, "Some([REDACTED])");
    }
}
