//! Profile layout inside a client installation.
//!
//! A profile is a directory directly below the installation root. Exactly
//! one of them sits at the active slot (`tdata`), the one the client reads.
//! The others are parked under arbitrary names and are told apart only by a
//! marker file whose name is the profile's tag.
//!
//! Everything here is a pure read of the filesystem; nothing is renamed.

use anyhow::{Result, bail};
use std::fs;
use std::path::{Path, PathBuf};

/// Directory name the client reads at startup
pub const ACTIVE_SLOT: &str = "tdata";

/// The one file per profile eligible for encryption at rest
pub const CREDENTIAL_FILE: &str = "key_datas";

/// Sidecar copy of the credential file taken before a swap
pub const CREDENTIAL_BACKUP: &str = "key_datas.bak";

/// Prefix of the temporary names used while swapping
pub const SCRATCH_PREFIX: &str = "tdata-";

/// A profile directory found under the installation root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileDir {
    pub dir: PathBuf,
    /// Registered tags (and the default) whose marker lives in this directory
    pub tags: Vec<String>,
    pub is_active: bool,
}

/// Find the profile directory carrying the marker for `tag`
///
/// Only immediate subdirectories of `root` are scanned. When several carry
/// the same marker, the lexicographically first directory name wins.
pub fn find_tag_dir(root: &Path, tag: &str) -> Option<PathBuf> {
    if tag.is_empty() || !is_marker_name(tag) {
        return None;
    }
    subdirs(root)
        .into_iter()
        .find(|dir| dir.join(tag).is_file())
}

/// Check whether the active slot currently holds the profile for `tag`
pub fn is_tag_active(root: &Path, tag: &str) -> bool {
    is_marker_name(tag) && !tag.is_empty() && root.join(ACTIVE_SLOT).join(tag).is_file()
}

/// Sorted immediate subdirectories of `root`; unreadable roots yield nothing
fn subdirs(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    dirs.sort();
    dirs
}

fn is_marker_name(tag: &str) -> bool {
    !tag.contains(['/', '\\']) && tag != "." && tag != ".."
}

/// List every profile directory that carries at least one known marker
pub fn list_profiles(root: &Path, known_tags: &[String]) -> Vec<ProfileDir> {
    subdirs(root)
        .into_iter()
        .filter_map(|dir| {
            let tags: Vec<String> = known_tags
                .iter()
                .filter(|tag| is_marker_name(tag) && dir.join(tag.as_str()).is_file())
                .cloned()
                .collect();
            if tags.is_empty() {
                return None;
            }
            let is_active = dir.file_name().is_some_and(|n| n == ACTIVE_SLOT);
            Some(ProfileDir {
                dir,
                tags,
                is_active,
            })
        })
        .collect()
}

/// Scratch directories left behind under the installation root
pub fn scratch_dirs(root: &Path) -> Vec<PathBuf> {
    subdirs(root)
        .into_iter()
        .filter(|dir| {
            dir.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(SCRATCH_PREFIX))
        })
        .collect()
}

/// Validate a tag name
///
/// Tags become file names inside profile directories, so path separators
/// and control characters are refused.
pub fn validate_tag_name(tag: &str) -> Result<()> {
    if tag.trim().is_empty() {
        bail!("Tag cannot be empty");
    }

    if tag.chars().count() > 64 {
        bail!("Tag cannot be longer than 64 characters");
    }

    if !is_marker_name(tag) || tag.chars().any(|c| c.is_control()) {
        bail!(
            "Invalid tag '{}'.\n\n Tags are used as marker file names and cannot contain path separators.",
            tag
        );
    }

    if tag == ACTIVE_SLOT || tag == CREDENTIAL_FILE || tag == CREDENTIAL_BACKUP {
        bail!("'{}' is reserved by the profile layout", tag);
    }

    Ok(())
}
