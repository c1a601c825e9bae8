//! Object-key sanitization for archive entry paths.
//!
//! Keys arrive from untrusted notification payloads and become entry names
//! in archives that downstream consumers extract onto arbitrary
//! filesystems. The sanitizer canonicalizes first (percent-decoding,
//! Unicode NFKC, separator normalization) and only then validates, so an
//! encoded or homoglyph variant of a traversal cannot slip past the checks.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Keys longer than this after normalization are rejected outright.
const MAX_KEY_BYTES: usize = 1024;

/// Rounds of percent-decoding applied before validation; enough to unwrap
/// any practical nesting without looping on self-referential input.
const MAX_DECODE_ROUNDS: usize = 5;

static DRIVE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z]:").expect("drive prefix pattern"));
static FORMAT_CHAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\p{Cf}").expect("format character pattern"));

const WINDOWS_DEVICE_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Why a key was refused. Each variant maps to a stable code used in
/// structured logs and skip metrics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyRejected {
    #[error("object key is empty")]
    Empty,
    #[error("object key decodes to invalid UTF-8")]
    InvalidEncoding,
    #[error("object key exceeds the {MAX_KEY_BYTES}-byte UTF-8 limit")]
    TooLong,
    #[error("object key contains a control character (0x{0:02X})")]
    ControlCharacter(u32),
    #[error("object key contains an invisible format character (U+{0:04X})")]
    FormatCharacter(u32),
    #[error("object key contains a path traversal component")]
    Traversal,
    #[error("object key component has leading or trailing whitespace: {0:?}")]
    ComponentWhitespace(String),
    #[error("object key contains a reserved device name: {0}")]
    ReservedDeviceName(String),
    #[error("object key resolves to an empty path")]
    EmptyResult,
}

impl KeyRejected {
    pub fn code(&self) -> &'static str {
        match self {
            KeyRejected::Empty
            | KeyRejected::InvalidEncoding
            | KeyRejected::ComponentWhitespace(_) => "INVALID_KEY_FORMAT",
            KeyRejected::TooLong => "INVALID_KEY_LENGTH",
            KeyRejected::ControlCharacter(_) | KeyRejected::FormatCharacter(_) => {
                "INVALID_KEY_CHARACTER"
            }
            KeyRejected::Traversal
            | KeyRejected::ReservedDeviceName(_)
            | KeyRejected::EmptyResult => "UNSAFE_KEY_PATH",
        }
    }
}

/// Sanitize an untrusted object key into a safe relative archive path.
///
/// Canonicalization happens before any validation: the key is recursively
/// percent-decoded (up to five rounds or until stable), NFKC-normalized,
/// stripped of a Windows drive-letter prefix, and switched to `/`
/// separators. The canonical form is then validated: byte-length ceiling,
/// control and format characters, `..` components, component whitespace,
/// and Windows reserved device names. `..` inside a component (such as
/// `backup..old.txt`) is allowed; only a whole `..` component is a
/// traversal.
///
/// ```
/// use baler_core::path_safety::sanitize_object_key;
///
/// assert_eq!(sanitize_object_key("folder/file.txt").unwrap(), "folder/file.txt");
/// assert_eq!(sanitize_object_key(r"C:\Users\test.csv").unwrap(), "Users/test.csv");
/// assert_eq!(sanitize_object_key("/absolute/path//file").unwrap(), "absolute/path/file");
/// assert!(sanitize_object_key("folder/../secrets.txt").is_err());
/// assert!(sanitize_object_key("..%2F..%2Fetc/passwd").is_err());
/// ```
pub fn sanitize_object_key(key: &str) -> Result<String, KeyRejected> {
    if key.is_empty() {
        return Err(KeyRejected::Empty);
    }

    let mut decoded = key.to_string();
    for _ in 0..MAX_DECODE_ROUNDS {
        let next = urlencoding::decode(&decoded).map_err(|_| KeyRejected::InvalidEncoding)?;
        if next.as_ref() == decoded.as_str() {
            break;
        }
        decoded = next.into_owned();
    }

    let normalized: String = decoded.nfkc().collect();

    if normalized.len() > MAX_KEY_BYTES {
        return Err(KeyRejected::TooLong);
    }

    for ch in normalized.chars() {
        let code = ch as u32;
        if code < 0x20 || code == 0x7F {
            return Err(KeyRejected::ControlCharacter(code));
        }
    }
    if let Some(found) = FORMAT_CHAR.find(&normalized) {
        let code = found
            .as_str()
            .chars()
            .next()
            .map(|ch| ch as u32)
            .unwrap_or(0);
        return Err(KeyRejected::FormatCharacter(code));
    }

    let no_drive = DRIVE_PREFIX.replace(&normalized, "");
    let posix = no_drive.replace('\\', "/");

    let mut components = Vec::new();
    for part in posix.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        if part == ".." {
            return Err(KeyRejected::Traversal);
        }
        if part.trim() != part {
            return Err(KeyRejected::ComponentWhitespace(part.to_string()));
        }
        let base = part
            .split('.')
            .next()
            .unwrap_or(part)
            .to_ascii_uppercase();
        if WINDOWS_DEVICE_NAMES.contains(&base.as_str()) {
            return Err(KeyRejected::ReservedDeviceName(part.to_string()));
        }
        components.push(part);
    }

    if components.is_empty() {
        return Err(KeyRejected::EmptyResult);
    }
    Ok(components.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_keys() {
        assert_eq!(
            sanitize_object_key("folder/file.txt").unwrap(),
            "folder/file.txt"
        );
        assert_eq!(
            sanitize_object_key("my-backup..old.txt").unwrap(),
            "my-backup..old.txt"
        );
        assert_eq!(sanitize_object_key("a/./b").unwrap(), "a/b");
        assert_eq!(sanitize_object_key("deep//nested///key").unwrap(), "deep/nested/key");
    }

    #[test]
    fn relativizes_absolute_and_windows_paths() {
        assert_eq!(
            sanitize_object_key("/absolute/path/file").unwrap(),
            "absolute/path/file"
        );
        assert_eq!(
            sanitize_object_key(r"C:\Users\test.csv").unwrap(),
            "Users/test.csv"
        );
        assert_eq!(sanitize_object_key(r"d:data\x.bin").unwrap(), "data/x.bin");
    }

    #[test]
    fn rejects_traversal_components() {
        for key in [
            "../secret",
            "folder/../secret",
            "folder/../../etc/passwd",
            "..%2F..%2Fetc/passwd",
            "%2e%2e/config",
            "%252e%252e%252fdeep",
            r"..\windows\system32",
        ] {
            let err = sanitize_object_key(key).unwrap_err();
            assert_eq!(err, KeyRejected::Traversal, "key: {key}");
        }
    }

    #[test]
    fn rejects_unicode_obfuscation() {
        // Full-width dots collapse to ASCII '.' under NFKC.
        assert_eq!(
            sanitize_object_key("a/\u{FF0E}\u{FF0E}/b").unwrap_err(),
            KeyRejected::Traversal
        );
        assert!(matches!(
            sanitize_object_key("file\u{200B}name").unwrap_err(),
            KeyRejected::FormatCharacter(_)
        ));
        assert!(matches!(
            sanitize_object_key("rtl\u{202E}gnp.txt").unwrap_err(),
            KeyRejected::FormatCharacter(_)
        ));
        assert!(matches!(
            sanitize_object_key("\u{FEFF}bom.txt").unwrap_err(),
            KeyRejected::FormatCharacter(_)
        ));
    }

    #[test]
    fn rejects_control_characters() {
        assert!(matches!(
            sanitize_object_key("nul\u{0}byte").unwrap_err(),
            KeyRejected::ControlCharacter(0)
        ));
        assert!(matches!(
            sanitize_object_key("line\nbreak").unwrap_err(),
            KeyRejected::ControlCharacter(0x0A)
        ));
        assert!(matches!(
            sanitize_object_key("del\u{7F}ete").unwrap_err(),
            KeyRejected::ControlCharacter(0x7F)
        ));
    }

    #[test]
    fn rejects_device_names_and_whitespace() {
        for key in ["CON", "prn.txt", "folder/aux", "com1.log", "LPT9.tmp"] {
            assert!(
                matches!(
                    sanitize_object_key(key).unwrap_err(),
                    KeyRejected::ReservedDeviceName(_)
                ),
                "key: {key}"
            );
        }
        // COM without a digit is a normal name.
        assert_eq!(sanitize_object_key("COM/readme").unwrap(), "COM/readme");

        assert!(matches!(
            sanitize_object_key(" a / b ").unwrap_err(),
            KeyRejected::ComponentWhitespace(_)
        ));
        assert!(matches!(
            sanitize_object_key("trailing /file").unwrap_err(),
            KeyRejected::ComponentWhitespace(_)
        ));
    }

    #[test]
    fn rejects_degenerate_keys() {
        assert_eq!(sanitize_object_key("").unwrap_err(), KeyRejected::Empty);
        assert_eq!(sanitize_object_key(".").unwrap_err(), KeyRejected::EmptyResult);
        assert_eq!(sanitize_object_key("/").unwrap_err(), KeyRejected::EmptyResult);
        assert_eq!(sanitize_object_key("//.//").unwrap_err(), KeyRejected::EmptyResult);
        assert_eq!(
            sanitize_object_key(&"x".repeat(MAX_KEY_BYTES + 1)).unwrap_err(),
            KeyRejected::TooLong
        );
    }

    #[test]
    fn length_limit_applies_after_normalization() {
        // U+FF41 (full-width 'a') is 3 UTF-8 bytes but normalizes to 1.
        let wide = "\u{FF41}".repeat(600);
        assert_eq!(sanitize_object_key(&wide).unwrap(), "a".repeat(600));
    }

    #[test]
    fn sanitize_is_idempotent_on_accepted_keys() {
        for key in [
            "folder/file.txt",
            r"C:\Users\test.csv",
            "/absolute//path/./file",
            "a%20b/c.txt",
            "my-backup..old.txt",
        ] {
            let once = sanitize_object_key(key).unwrap();
            let twice = sanitize_object_key(&once).unwrap();
            assert_eq!(once, twice, "key: {key}");
        }
    }
}
