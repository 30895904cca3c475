//! Socket naming shared by the bridge daemon and the client stub.
//!
//! The daemon binds one Unix socket per (native app config, extension) pair
//! and the browser-launched client stub has to find the very same socket with
//! nothing but the extension identifier, so both sides link this crate and
//! derive the file name the same way. Extension identifiers can exceed
//! filesystem name limits and may contain characters that are unsafe in file
//! names, so the identifier is encoded and truncated rather than used as-is.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

pub const SOCKET_SUFFIX: &str = ".socket";

/// Chromium-style origins carry this scheme prefix; it adds no entropy and
/// wastes the length budget, so it is stripped before encoding.
const ORIGIN_PREFIX: &str = "chrome-extension://";

/// Longest encoded identifier kept in the file name. Unix socket paths are
/// limited to ~108 bytes total, so the name has to stay well below that.
const MAX_ENCODED_LEN: usize = 50;

/// Deterministic, filesystem-safe socket file name for an extension
/// identifier.
pub fn socket_file_name(extension_id: &str) -> String {
    let trimmed = extension_id
        .strip_prefix(ORIGIN_PREFIX)
        .unwrap_or(extension_id)
        .trim_end_matches('/');
    let mut encoded = URL_SAFE_NO_PAD.encode(trimmed.as_bytes());
    encoded.truncate(MAX_ENCODED_LEN);
    encoded.push_str(SOCKET_SUFFIX);
    encoded
}

pub fn socket_path_in(dir: &Path, extension_id: &str) -> PathBuf {
    dir.join(socket_file_name(extension_id))
}
