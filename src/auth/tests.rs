use super::*;
use axum::http::{HeaderMap, HeaderValue};

fn headers_with(value: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("x-user-key", value.parse().unwrap());
    headers
}

#[test]
fn valid_user_key() {
    let result = extract_user_key(&headers_with("user-42"));
    assert_eq!(result, Ok("user-42".to_string()));
}

#[test]
fn header_name_is_case_insensitive() {
    let mut headers = HeaderMap::new();
    headers.insert("X-User-Key", "alice@example.com".parse().unwrap());

    assert_eq!(extract_user_key(&headers), Ok("alice@example.com".to_string()));
}

#[test]
fn surrounding_whitespace_trimmed() {
    let result = extract_user_key(&headers_with("  alice  "));
    assert_eq!(result, Ok("alice".to_string()));
}

#[test]
fn missing_header() {
    let headers = HeaderMap::new();
    assert_eq!(extract_user_key(&headers), Err(UserKeyError::Missing));
}

#[test]
fn empty_header() {
    assert_eq!(extract_user_key(&headers_with("")), Err(UserKeyError::Empty));
    assert_eq!(extract_user_key(&headers_with("   ")), Err(UserKeyError::Empty));
}

#[test]
fn non_text_header() {
    let mut headers = HeaderMap::new();
    headers.insert("x-user-key", HeaderValue::from_bytes(b"caf\xc3\xa9").unwrap());

    assert_eq!(extract_user_key(&headers), Err(UserKeyError::InvalidFormat));
}

#[test]
fn control_characters_rejected() {
    assert_eq!(parse_user_key("ali\tce"), Err(UserKeyError::InvalidFormat));
}

#[test]
fn overlong_key() {
    let at_limit = "k".repeat(MAX_USER_KEY_LEN);
    assert_eq!(extract_user_key(&headers_with(&at_limit)), Ok(at_limit.clone()));

    let over = "k".repeat(MAX_USER_KEY_LEN + 1);
    assert_eq!(extract_user_key(&headers_with(&over)), Err(UserKeyError::TooLong));
}

#[test]
fn error_messages() {
    assert_eq!(UserKeyError::Missing.to_string(), "X-User-Key header not provided");
    assert!(UserKeyError::TooLong.to_string().contains("256"));
}
