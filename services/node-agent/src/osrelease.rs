//! Operating system version detection from `/etc/os-release`.

use std::path::Path;

use crate::fs::{FileSystem, FsError};

/// Extract the OS version from os-release content.
///
/// The version is the first `<digits>.<digits>` in `PRETTY_NAME`, which is
/// what in-place update targets are expressed in.
pub fn parse_os_version(content: &str) -> Option<String> {
    let pretty_name = content
        .lines()
        .find_map(|line| line.trim().strip_prefix("PRETTY_NAME="))?
        .trim_matches(|c| c == '"' || c == '\'');

    first_dotted_number(pretty_name)
}

fn first_dotted_number(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut start = 0;

    while start < bytes.len() {
        if !bytes[start].is_ascii_digit() {
            start += 1;
            continue;
        }

        let major_end = digits_end(bytes, start);
        if major_end < bytes.len() && bytes[major_end] == b'.' {
            let minor_end = digits_end(bytes, major_end + 1);
            if minor_end > major_end + 1 {
                return Some(s[start..minor_end].to_string());
            }
        }
        start = major_end;
    }

    None
}

fn digits_end(bytes: &[u8], from: usize) -> usize {
    bytes[from..]
        .iter()
        .position(|b| !b.is_ascii_digit())
        .map_or(bytes.len(), |p| from + p)
}

/// Read the current OS version. `None` if the file or version is missing.
pub async fn current_os_version(fs: &dyn FileSystem, path: &Path) -> Result<Option<String>, FsError> {
    let Some(content) = fs.read(path).await? else {
        return Ok(None);
    };
    Ok(parse_os_version(&String::from_utf8_lossy(&content)))
}
