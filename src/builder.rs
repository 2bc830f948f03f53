//! Path construction schemes and service-name validation.
//!
//! The server owns one [`PathScheme`] and uses it to turn the segment list
//! `group prefixes + type name + method name` into the registered path.
//! [`UrlPathScheme`] is the default; [`DottedPathScheme`] reproduces the
//! historical `Type.Method` wire contract.

use crate::server::RegisterError;

/// Strategy assembling a service path from its raw segments.
pub trait PathScheme: Send + Sync + 'static {
    /// Join `segments` into the final routable path.
    fn assemble(&self, segments: &[&str]) -> String;
}

/// URL-style paths: `/prefix/type/method`, each segment snake-cased and
/// percent-escaped.
#[derive(Clone, Copy, Debug, Default)]
pub struct UrlPathScheme;

impl PathScheme for UrlPathScheme {
    fn assemble(&self, segments: &[&str]) -> String {
        let mut path = String::new();
        for segment in segments {
            path.push('/');
            path.push_str(&percent_escape(&snake_string(segment)));
        }
        path
    }
}

/// Dot-joined paths: `Type.Method`, segments kept verbatim.
#[derive(Clone, Copy, Debug, Default)]
pub struct DottedPathScheme;

impl PathScheme for DottedPathScheme {
    fn assemble(&self, segments: &[&str]) -> String {
        segments.join(".")
    }
}

/// Validate a user-supplied name segment against `[A-Za-z0-9._-]*`.
pub(crate) fn check_name(name: &str) -> Result<(), RegisterError> {
    let valid = name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(RegisterError::InvalidName(name.to_owned()))
    }
}

/// Convert `XxYy` to `xx_yy`. Existing underscores are preserved and never
/// doubled.
pub(crate) fn snake_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 2);
    let mut boundary = false;
    for ch in s.chars() {
        if ch.is_ascii_uppercase() && boundary {
            out.push('_');
        }
        if ch != '_' {
            boundary = true;
        }
        out.push(ch.to_ascii_lowercase());
    }
    out
}

/// Percent-escape every byte outside the URL unreserved set.
fn percent_escape(s: &str) -> String {
    fn unreserved(b: u8) -> bool {
        b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
    }
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if unreserved(b) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(char::from_digit(u32::from(b >> 4), 16).unwrap_or('0').to_ascii_uppercase());
            out.push(char::from_digit(u32::from(b & 0xf), 16).unwrap_or('0').to_ascii_uppercase());
        }
    }
    out
}
