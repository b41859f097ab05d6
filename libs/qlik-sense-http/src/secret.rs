use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Password for network (NTLM) credentials.
///
/// `Debug` and `Display` print `[REDACTED]`; the buffer is zeroed on drop.
/// Use [`expose`](Self::expose) only where the handshake needs the cleartext.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Password(String);

impl Password {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Read-only access to the cleartext; never log or persist the result.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Clone for Password {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl From<&str> for Password {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Password {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Environment-sourced settings may hand a numeric-looking password over as a
/// number, so any scalar is accepted and kept as text.
impl<'de> Deserialize<'de> for Password {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct PasswordVisitor;

        impl Visitor<'_> for PasswordVisitor {
            type Value = Password;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a password string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Password, E> {
                Ok(Password::new(v))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Password, E> {
                Ok(Password(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Password, E> {
                Ok(Password(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Password, E> {
                Ok(Password(v.to_string()))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Password, E> {
                Ok(Password(v.to_string()))
            }
        }

        d.deserialize_any(PasswordVisitor)
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn debug_and_display_are_redacted() {
        let p = Password::new("hunter2");
        assert_eq!(format!("{p:?}"), "[REDACTED]");
        assert_eq!(format!("{p}"), "[REDACTED]");
    }

    #[test]
    fn expose_returns_original_value() {
        let p = Password::from("hunter2");
        assert_eq!(p.expose(), "hunter2");
        assert!(!p.is_empty());
    }

    #[test]
    fn zeroize_clears_buffer() {
        let mut p = Password::new("hunter2");
        p.zeroize();
        assert!(p.is_empty());
    }

    #[test]
    fn deserializes_from_plain_string() {
        let p: Password = serde_json::from_str("\"s3cret\"").unwrap();
        assert_eq!(p.expose(), "s3cret");
    }

    #[test]
    fn deserializes_numeric_password() {
        let p: Password = serde_json::from_str("123456").unwrap();
        assert_eq!(p.expose(), "123456");
    }

    #[test]
    fn struct_debug_does_not_leak() {
        #[derive(Debug)]
        #[allow(dead_code)]
        struct Creds {
            user: String,
            password: Password,
        }

        let c = Creds {
            user: "alice".to_owned(),
            password: Password::new("p@ss"),
        };
        let dbg = format!("{c:?}");
        assert!(dbg.contains("alice"));
        assert!(!dbg.contains("p@ss"));
    }
}
