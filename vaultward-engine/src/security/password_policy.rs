use crate::error::{SecurityError, SecurityResult};

/// Character classes a password can draw from.
const REQUIRED_CLASSES: usize = 3;

/// Accept or reject a new master password.
///
/// Requires at least `min_length` characters and at least three of: upper
/// case, lower case, digit, symbol. Anything that is not alphanumeric counts
/// as a symbol, including whitespace and non-ASCII.
pub fn check_password(password: &[u8], min_length: usize) -> SecurityResult<()> {
    let text = std::str::from_utf8(password)
        .map_err(|_| SecurityError::InvalidInput("password must be valid UTF-8".into()))?;

    let length = text.chars().count();
    if length < min_length {
        return Err(SecurityError::WeakPassword(format!(
            "must be at least {} characters",
            min_length
        )));
    }

    let mut upper = false;
    let mut lower = false;
    let mut digit = false;
    let mut symbol = false;
    for c in text.chars() {
        if c.is_uppercase() {
            upper = true;
        } else if c.is_lowercase() {
            lower = true;
        } else if c.is_numeric() {
            digit = true;
        } else {
            symbol = true;
        }
    }

    let classes = [upper, lower, digit, symbol].iter().filter(|&&c| c).count();
    if classes < REQUIRED_CLASSES {
        return Err(SecurityError::WeakPassword(
            "must mix at least three of upper case, lower case, digits and symbols".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strong_password_accepted() {
        assert!(check_password(b"Str0ng!Pass", 8).is_ok());
        assert!(check_password(b"lower-and-UPPER", 8).is_ok());
    }

    #[test]
    fn test_too_short() {
        assert!(matches!(
            check_password(b"S0!a", 8),
            Err(SecurityError::WeakPassword(_))
        ));
    }

    #[test]
    fn test_too_few_classes() {
        assert!(matches!(
            check_password(b"hunter2hunter2", 8),
            Err(SecurityError::WeakPassword(_))
        ));
        assert!(check_password(b"ALLUPPERCASE", 8).is_err());
    }

    #[test]
    fn test_length_counts_characters_not_bytes() {
        // 7 characters, 14 bytes
        assert!(check_password("Ää1!Ää1".as_bytes(), 8).is_err());
    }

    #[test]
    fn test_invalid_utf8() {
        assert!(matches!(
            check_password(&[0xff, 0xfe, 0x41, 0x61, 0x31, 0x21, 0x21, 0x21], 8),
            Err(SecurityError::InvalidInput(_))
        ));
    }
}
