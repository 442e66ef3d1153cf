//! Immutable byte strings with an encoding tag.
//!
//! PHP strings are byte sequences; the encoding tag is advisory and never
//! changes comparison or concatenation semantics. Mutating operations build
//! a new string.

use std::fmt;

/// Strings shorter than this are interned in the heap's content-keyed pool.
pub const INTERN_MAX_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringEncoding {
    Ascii,
    Utf8,
    Binary,
}

#[derive(Debug, Clone)]
pub struct PhpString {
    bytes: Vec<u8>,
    encoding: StringEncoding,
}

impl PhpString {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let encoding = detect_encoding(&bytes);
        Self { bytes, encoding }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn encoding(&self) -> StringEncoding {
        self.encoding
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Lossy UTF-8 view; binary strings get replacement characters.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// Build the concatenation of two strings.
    pub fn concat(&self, other: &PhpString) -> PhpString {
        let mut bytes = Vec::with_capacity(self.bytes.len() + other.bytes.len());
        bytes.extend_from_slice(&self.bytes);
        bytes.extend_from_slice(&other.bytes);
        PhpString::from_bytes(bytes)
    }

    pub fn is_interned_size(&self) -> bool {
        self.bytes.len() < INTERN_MAX_LEN
    }
}

impl From<&str> for PhpString {
    fn from(s: &str) -> Self {
        PhpString::from_bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for PhpString {
    fn from(s: String) -> Self {
        PhpString::from_bytes(s.into_bytes())
    }
}

impl fmt::Display for PhpString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.bytes))
    }
}

fn detect_encoding(bytes: &[u8]) -> StringEncoding {
    if bytes.is_ascii() {
        StringEncoding::Ascii
    } else if std::str::from_utf8(bytes).is_ok() {
        StringEncoding::Utf8
    } else {
        StringEncoding::Binary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_detection() {
        assert_eq!(PhpString::from("abc").encoding(), StringEncoding::Ascii);
        assert_eq!(PhpString::from("héllo").encoding(), StringEncoding::Utf8);
        assert_eq!(
            PhpString::from_bytes(vec![0xff, 0xfe]).encoding(),
            StringEncoding::Binary
        );
    }

    #[test]
    fn concat_builds_new_string() {
        let a = PhpString::from("foo");
        let b = PhpString::from("bar");
        assert_eq!(a.concat(&b).as_bytes(), b"foobar");
        assert_eq!(a.as_bytes(), b"foo");
    }
}
