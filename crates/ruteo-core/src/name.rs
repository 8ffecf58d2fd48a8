//! Client and port naming rules.
//!
//! A port's full name is `<client>:<port>`. Both components are bounded,
//! NUL-free, UTF-8 clean byte strings; the `:` separator is forbidden
//! inside either component. Names travel across process boundaries in
//! fixed-width NUL-padded byte arrays, so the bounds here are wire-format
//! constants, not suggestions.

use thiserror::Error;

/// Maximum client name length in bytes, including the trailing NUL.
pub const CLIENT_NAME_MAX: usize = 32;

/// Maximum port short-name length in bytes, including the trailing NUL.
pub const PORT_NAME_MAX: usize = 32;

/// Maximum full (`client:port`) name length in bytes, including NUL.
pub const FULL_NAME_MAX: usize = 64;

/// Why a proposed name was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    /// Empty names are not addressable.
    #[error("name is empty")]
    Empty,
    /// The name does not fit its fixed-width wire field.
    #[error("name is longer than {0} bytes")]
    TooLong(usize),
    /// `:` separates client from port and may not appear in either part.
    #[error("name contains ':'")]
    Separator,
    /// Interior NULs would truncate the name in its wire field.
    #[error("name contains a NUL byte")]
    Nul,
}

fn validate(name: &str, max_with_nul: usize) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() >= max_with_nul {
        return Err(NameError::TooLong(max_with_nul - 1));
    }
    if name.contains(':') {
        return Err(NameError::Separator);
    }
    if name.contains('\0') {
        return Err(NameError::Nul);
    }
    Ok(())
}

/// Validate a client name against [`CLIENT_NAME_MAX`].
pub fn validate_client_name(name: &str) -> Result<(), NameError> {
    validate(name, CLIENT_NAME_MAX)
}

/// Validate a port short name against [`PORT_NAME_MAX`].
pub fn validate_port_name(name: &str) -> Result<(), NameError> {
    validate(name, PORT_NAME_MAX)
}

/// Build the full `client:port` name from validated components.
pub fn full_name(client: &str, port: &str) -> String {
    format!("{client}:{port}")
}

/// Copy `s` into a fixed-width NUL-padded array.
///
/// The caller must have validated the length; overlong input is truncated
/// to keep the array NUL-terminated rather than panicking in wire code.
pub fn to_fixed<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let n = s.len().min(N - 1);
    out[..n].copy_from_slice(&s.as_bytes()[..n]);
    out
}

/// Read a NUL-padded fixed-width array back into a `&str`.
///
/// Non-UTF-8 content (which validation never lets in) comes back as an
/// empty string rather than an error; wire code treats it as a bad name.
pub fn from_fixed(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end]).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rejects_bad_names() {
        assert_eq!(validate_client_name(""), Err(NameError::Empty));
        assert_eq!(validate_client_name("a:b"), Err(NameError::Separator));
        assert_eq!(validate_client_name("a\0b"), Err(NameError::Nul));
        let long = "x".repeat(CLIENT_NAME_MAX);
        assert_eq!(
            validate_client_name(&long),
            Err(NameError::TooLong(CLIENT_NAME_MAX - 1))
        );
    }

    #[test]
    fn full_name_fits_wire_field() {
        let client = "c".repeat(CLIENT_NAME_MAX - 1);
        let port = "p".repeat(PORT_NAME_MAX - 1);
        assert!(full_name(&client, &port).len() < FULL_NAME_MAX);
    }

    proptest! {
        #[test]
        fn fixed_roundtrip(name in "[a-zA-Z0-9_ .-]{1,31}") {
            prop_assert!(validate_client_name(&name).is_ok());
            let arr: [u8; CLIENT_NAME_MAX] = to_fixed(&name);
            prop_assert_eq!(from_fixed(&arr), name.as_str());
        }
    }
}
