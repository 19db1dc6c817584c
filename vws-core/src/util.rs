//! Small helpers shared by the transport and its callers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Sleep for `ms` milliseconds.
pub fn msleep(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

pub fn is_flag(flags: u64, flag: u64) -> bool {
    flags & flag == flag
}

pub fn set_flag(flags: &mut u64, flag: u64) {
    *flags |= flag;
}

pub fn clear_flag(flags: &mut u64, flag: u64) {
    *flags &= !flag;
}

/// Random (v4) UUID in hyphenated form.
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().hyphenated().to_string()
}

pub fn base64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Returns `None` if `data` is not valid standard base64.
pub fn base64_decode(data: &str) -> Option<Vec<u8>> {
    STANDARD.decode(data.trim()).ok()
}

/// Join a directory and a file name.
pub fn file_path(root: impl AsRef<Path>, filename: &str) -> PathBuf {
    root.as_ref().join(filename)
}

/// Parse a whole string as a base-10 integer. Surrounding whitespace, empty
/// input, trailing garbage and overflow all yield `None`.
pub fn parse_long(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    s.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags() {
        let mut f = 0u64;
        set_flag(&mut f, 0b100);
        set_flag(&mut f, 0b001);
        assert!(is_flag(f, 0b100));
        assert!(is_flag(f, 0b101));
        assert!(!is_flag(f, 0b010));
        clear_flag(&mut f, 0b100);
        assert_eq!(f, 0b001);
    }

    #[test]
    fn uuid_shape() {
        let a = generate_uuid();
        let b = generate_uuid();
        assert_eq!(a.len(), 36);
        assert_eq!(a.matches('-').count(), 4);
        assert_ne!(a, b);
    }

    #[test]
    fn base64() {
        assert_eq!(base64_encode(b"hello world"), "aGVsbG8gd29ybGQ=");
        assert_eq!(base64_decode("aGVsbG8gd29ybGQ=").unwrap(), b"hello world");
        assert!(base64_decode("not base64!").is_none());
    }

    #[test]
    fn paths() {
        let p = file_path("/var/lib/vws", "state.json");
        assert_eq!(p, PathBuf::from("/var/lib/vws/state.json"));
    }

    #[test]
    fn parse_long_whole_string() {
        assert_eq!(parse_long("42"), Some(42));
        assert_eq!(parse_long(" -7 "), Some(-7));
        assert_eq!(parse_long(""), None);
        assert_eq!(parse_long("12ab"), None);
        assert_eq!(parse_long("99999999999999999999"), None);
    }
}
