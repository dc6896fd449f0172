use aliri_braid::braid;

/// An Application Entity title: 1 to 16 ASCII characters without leading or trailing spaces.
#[braid(serde, validator)]
pub struct AeTitle;

/// Reason why a string is not a valid [AeTitle].
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum InvalidAeTitle {
    #[error("AE title must not be empty")]
    Empty,
    #[error("AE title must be at most 16 characters, got {0}")]
    TooLong(usize),
    #[error("AE title contains a disallowed character")]
    BadCharacter,
    #[error("AE title has leading or trailing spaces")]
    Untrimmed,
}

impl From<std::convert::Infallible> for InvalidAeTitle {
    fn from(x: std::convert::Infallible) -> Self {
        match x {}
    }
}

impl aliri_braid::Validator for AeTitle {
    type Error = InvalidAeTitle;

    fn validate(raw: &str) -> Result<(), Self::Error> {
        if raw.is_empty() {
            return Err(InvalidAeTitle::Empty);
        }
        if raw.len() > MAX_AE_TITLE_LENGTH {
            return Err(InvalidAeTitle::TooLong(raw.len()));
        }
        if raw.chars().any(|c| !c.is_ascii() || c.is_ascii_control() || c == '\\') {
            return Err(InvalidAeTitle::BadCharacter);
        }
        if raw.trim() != raw {
            return Err(InvalidAeTitle::Untrimmed);
        }
        Ok(())
    }
}

const MAX_AE_TITLE_LENGTH: usize = 16;

impl AeTitle {
    /// Parse an AE title the way it appears on the wire: space padded, possibly NUL terminated.
    pub fn from_padded(raw: &str) -> Result<Self, InvalidAeTitle> {
        Self::new(raw.trim_matches(|c| c == ' ' || c == '\0').to_string())
    }
}
