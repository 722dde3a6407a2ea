use axum::http::HeaderMap;

#[cfg(test)]
mod tests;

/// Header carrying the caller's user key
pub const USER_KEY_HEADER: &str = "x-user-key";

/// Longest accepted user key
pub const MAX_USER_KEY_LEN: usize = 256;

/// Extract the caller's user key from the request headers
///
/// Expected format: "X-User-Key: <opaque id>"
/// The key is trimmed. It identifies whose connections a request acts on and
/// is never interpreted beyond that.
pub fn extract_user_key(headers: &HeaderMap) -> Result<String, UserKeyError> {
    let value = headers
        .get(USER_KEY_HEADER)
        .ok_or(UserKeyError::Missing)?
        .to_str()
        .map_err(|_| UserKeyError::InvalidFormat)?;

    parse_user_key(value)
}

fn parse_user_key(value: &str) -> Result<String, UserKeyError> {
    let key = value.trim();

    if key.is_empty() {
        return Err(UserKeyError::Empty);
    }
    if key.len() > MAX_USER_KEY_LEN {
        return Err(UserKeyError::TooLong);
    }
    if key.chars().any(char::is_control) {
        return Err(UserKeyError::InvalidFormat);
    }

    Ok(key.to_string())
}

/// User key extraction errors
#[derive(Debug, PartialEq, Clone)]
pub enum UserKeyError {
    /// X-User-Key header not present
    Missing,
    /// Header is not printable text
    InvalidFormat,
    /// Header is blank
    Empty,
    /// Longer than MAX_USER_KEY_LEN
    TooLong,
}

impl std::fmt::Display for UserKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserKeyError::Missing => write!(f, "X-User-Key header not provided"),
            UserKeyError::InvalidFormat => write!(f, "Invalid X-User-Key header format"),
            UserKeyError::Empty => write!(f, "X-User-Key header is empty"),
            UserKeyError::TooLong => write!(
                f,
                "X-User-Key header exceeds {} characters",
                MAX_USER_KEY_LEN
            ),
        }
    }
}

impl std::error::Error for UserKeyError {}
