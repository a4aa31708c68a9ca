//! Host filesystem probing used at server startup: which mount backs a
//! path, and which block device backs that mount. The device numbers feed
//! the default `io.max` limit.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const PROC_MOUNTS: &str = "/proc/mounts";

/// Returns the mount point whose path is the longest ancestor of `path`,
/// by scanning `/proc/mounts`.
pub fn filesystem_mount(path: &Path) -> Result<PathBuf> {
    let abs = std::path::absolute(path).map_err(|e| Error::host("resolve", path, e))?;
    let content =
        fs::read_to_string(PROC_MOUNTS).map_err(|e| Error::host("read", PROC_MOUNTS, e))?;
    longest_mount_ancestor(&content, &abs)
        .ok_or_else(|| Error::host("probe", abs, std::io::Error::from(std::io::ErrorKind::NotFound)))
}

/// Derives `(major, minor)` for the device backing `path` from its device
/// id, the way the kernel packs dev_t.
pub fn device_numbers(path: &Path) -> Result<(u32, u32)> {
    let st = nix::sys::stat::stat(path).map_err(|e| Error::host_errno("stat", path, e))?;
    let dev = st.st_dev;
    let major = ((dev >> 8) & 0xfff) as u32;
    let minor = (dev & 0xff) as u32;
    Ok((major, minor))
}

fn longest_mount_ancestor(mounts: &str, abs: &Path) -> Option<PathBuf> {
    let mut best: Option<PathBuf> = None;
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let mount_point = match (fields.next(), fields.next()) {
            (Some(_source), Some(p)) => unescape_mount_path(p),
            _ => continue,
        };
        let mount_point = PathBuf::from(mount_point);
        if !abs.starts_with(&mount_point) {
            continue;
        }
        // Ties broken by longest mount-point string.
        let longer = best
            .as_ref()
            .map(|b| mount_point.as_os_str().len() > b.as_os_str().len())
            .unwrap_or(true);
        if longer {
            best = Some(mount_point);
        }
    }
    best
}

/// `/proc/mounts` escapes whitespace and backslashes in mount points as
/// three-digit octal sequences.
pub(crate) fn unescape_mount_path(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() && bytes[i + 1..i + 4].iter().all(u8::is_ascii_digit) {
            if let Ok(v) = u8::from_str_radix(&s[i + 1..i + 4], 8) {
                out.push(v);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
