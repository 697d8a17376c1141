//! Path/URI conversion and workspace discovery helpers.

use std::path::{Path, PathBuf};

use lsp_types::Url;

use crate::error::{Error, Result};

/// Converts a filesystem path to a `file://` URL.
///
/// Relative paths are resolved against the current directory first. The path
/// is percent-encoded byte-wise; on Windows-style paths (`C:\…`) backslashes
/// are normalized and a leading slash is inserted, yielding `file:///C:/…`.
pub fn file_uri(path: &Path) -> Result<Url> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| Error::NotFound(format!("cannot resolve {}: {}", path.display(), e)))?
            .join(path)
    };

    let mut text = absolute.to_string_lossy().replace('\\', "/");
    if !text.starts_with('/') {
        text.insert(0, '/');
    }

    let uri = format!("file://{}", percent_encode(&text));
    uri.parse()
        .map_err(|e| Error::NotFound(format!("invalid file URI for {}: {}", path.display(), e)))
}

/// Converts a `file://` URL back to a filesystem path.
///
/// Percent-escapes are decoded; `file:///C:/…` style URLs lose the spurious
/// leading slash in front of the drive letter.
pub fn uri_to_path(uri: &Url) -> PathBuf {
    let raw = uri.as_str();
    let path = raw.strip_prefix("file://").unwrap_or(raw);
    let path = path.strip_prefix("localhost").unwrap_or(path);
    let decoded = percent_decode(path);

    let bytes = decoded.as_bytes();
    if bytes.len() >= 3 && bytes[0] == b'/' && bytes[1].is_ascii_alphabetic() && bytes[2] == b':' {
        return PathBuf::from(&decoded[1..]);
    }
    PathBuf::from(decoded)
}

fn percent_encode(path: &str) -> String {
    let mut encoded = String::with_capacity(path.len());
    for &b in path.as_bytes() {
        if is_unreserved_path_byte(b) {
            encoded.push(char::from(b));
        } else {
            encoded.push('%');
            encoded.push(hex_upper(b >> 4));
            encoded.push(hex_upper(b & 0x0f));
        }
    }
    encoded
}

fn percent_decode(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                decoded.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

const fn is_unreserved_path_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || b == b'-'
        || b == b'.'
        || b == b'_'
        || b == b'~'
        || b == b'/'
        || b == b':'
}

const fn hex_upper(nibble: u8) -> char {
    match nibble {
        0..=9 => (b'0' + nibble) as char,
        10..=15 => (b'A' + (nibble - 10)) as char,
        _ => '?',
    }
}

const fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Maps a file extension to the LSP `languageId` expected in `didOpen`.
///
/// Falls back to `"plaintext"` for unrecognized extensions.
pub fn language_id_for(path: &Path) -> &'static str {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "rs" => "rust",
        "py" | "pyi" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" | "mts" | "cts" => "typescript",
        "jsx" => "javascriptreact",
        "tsx" => "typescriptreact",
        "go" => "go",
        "c" => "c",
        "cpp" | "cc" | "cxx" | "h" | "hpp" => "cpp",
        "rb" => "ruby",
        "java" => "java",
        "json" => "json",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "md" | "markdown" => "markdown",
        "sh" | "bash" | "zsh" => "shellscript",
        "html" | "htm" => "html",
        "css" => "css",
        _ => "plaintext",
    }
}

/// Walks up from `file` looking for the first directory containing one of the
/// given marker files, in marker priority order per directory level.
///
/// Falls back to the file's own directory (or `.`) when nothing matches.
pub fn find_workspace_root(file: &Path, markers: &[String]) -> PathBuf {
    let start = if file.is_dir() {
        file
    } else {
        file.parent().unwrap_or(Path::new("."))
    };

    let mut dir = Some(start);
    while let Some(current) = dir {
        for marker in markers {
            if current.join(marker).exists() {
                return current.to_path_buf();
            }
        }
        dir = current.parent();
    }

    start.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_uri_round_trip() {
        let uri = file_uri(Path::new("/tmp/test.rs")).unwrap();
        assert_eq!(uri.as_str(), "file:///tmp/test.rs");
        assert_eq!(uri_to_path(&uri), PathBuf::from("/tmp/test.rs"));
    }

    #[test]
    fn file_uri_percent_encodes_spaces() {
        let uri = file_uri(Path::new("/tmp/space file.py")).unwrap();
        assert_eq!(uri.as_str(), "file:///tmp/space%20file.py");
        assert_eq!(uri_to_path(&uri), PathBuf::from("/tmp/space file.py"));
    }

    #[test]
    fn uri_to_path_handles_windows_drive_letters() {
        let uri: Url = "file:///C:/Users/dev/main.ts".parse().unwrap();
        assert_eq!(uri_to_path(&uri), PathBuf::from("C:/Users/dev/main.ts"));
    }

    #[test]
    fn uri_to_path_decodes_escapes() {
        let uri: Url = "file:///tmp/a%20b/%C3%A9.py".parse().unwrap();
        assert_eq!(uri_to_path(&uri), PathBuf::from("/tmp/a b/é.py"));
    }

    #[test]
    fn language_id_common_extensions() {
        assert_eq!(language_id_for(Path::new("/x/a.py")), "python");
        assert_eq!(language_id_for(Path::new("/x/a.rs")), "rust");
        assert_eq!(language_id_for(Path::new("/x/a.tsx")), "typescriptreact");
        assert_eq!(language_id_for(Path::new("/x/a.unknown")), "plaintext");
        assert_eq!(language_id_for(Path::new("/x/noext")), "plaintext");
    }

    #[test]
    fn workspace_root_walks_up_to_marker() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src/deep")).unwrap();
        std::fs::write(root.join("pyproject.toml"), "").unwrap();
        let file = root.join("src/deep/mod.py");
        std::fs::write(&file, "x = 1\n").unwrap();

        let markers = vec![".git".to_string(), "pyproject.toml".to_string()];
        assert_eq!(find_workspace_root(&file, &markers), root);
    }

    #[test]
    fn workspace_root_defaults_to_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("lone.py");
        std::fs::write(&file, "").unwrap();

        let markers = vec!["definitely-not-present".to_string()];
        assert_eq!(find_workspace_root(&file, &markers), dir.path());
    }
}
