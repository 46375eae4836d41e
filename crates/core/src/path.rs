//! Portable paths: absolute save locations rewritten against symbolic roots
//!
//! A portable path replaces the machine-specific prefix of a file with a
//! marker so the same record resolves on a machine where the application is
//! installed somewhere else:
//!
//! ```text
//! /home/ana/Games/Foo/Saves/slot1.sav  ->  %GAMEPATH%/Saves/slot1.sav
//! /home/ana/.config/foo/settings.ini   ->  %USERPROFILE%/.config/foo/settings.ini
//! /mnt/elsewhere/slot1.sav             ->  slot1.sav
//! ```
//!
//! The last form is lossy: files outside every known root keep only their
//! file name, so two such files with the same name collide. That matches
//! how existing record files were written and is kept as is.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Marker for the application's install directory
pub const INSTALL_MARKER: &str = "%GAMEPATH%";

/// Marker for the current user's profile (home) directory
pub const PROFILE_MARKER: &str = "%USERPROFILE%";

/// Which root a portable path is anchored to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Anchor {
    Install,
    UserProfile,
    /// Bare file name produced by the fallback branch
    None,
}

/// A validated, location-independent path. Always `/`-separated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortablePath(String);

impl PortablePath {
    /// Parse and normalise a portable path string.
    ///
    /// Backslashes are accepted and rewritten; `.` and empty segments are
    /// dropped.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] for empty paths, absolute prefixes,
    /// drive letters, `..` segments, unknown markers or a marker with
    /// nothing after it.
    pub fn parse(raw: &str) -> Result<Self> {
        let unified = raw.replace('\\', "/");
        if unified.trim().is_empty() {
            return Err(SyncError::validation(raw, "empty path"));
        }
        if unified.starts_with('/') {
            return Err(SyncError::validation(raw, "absolute prefix"));
        }

        let segments: Vec<&str> = unified
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();

        for (index, segment) in segments.iter().enumerate() {
            if *segment == ".." {
                return Err(SyncError::validation(raw, "parent directory segment"));
            }
            if index == 0 && is_drive_letter(segment) {
                return Err(SyncError::validation(raw, "drive letter"));
            }
            if is_marker_token(segment) {
                if index != 0 {
                    return Err(SyncError::validation(raw, "marker must lead the path"));
                }
                if *segment != INSTALL_MARKER && *segment != PROFILE_MARKER {
                    return Err(SyncError::validation(raw, format!("unknown marker {segment}")));
                }
            }
        }

        match segments.as_slice() {
            [] => Err(SyncError::validation(raw, "empty path")),
            [only] if is_marker_token(only) => {
                Err(SyncError::validation(raw, "marker without a file"))
            }
            _ => Ok(Self(segments.join("/"))),
        }
    }

    fn from_parts(marker: &str, relative: &[String]) -> Result<Self> {
        let mut s = String::from(marker);
        for segment in relative {
            s.push('/');
            s.push_str(segment);
        }
        Self::parse(&s)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn anchor(&self) -> Anchor {
        match self.0.split('/').next() {
            Some(INSTALL_MARKER) => Anchor::Install,
            Some(PROFILE_MARKER) => Anchor::UserProfile,
            _ => Anchor::None,
        }
    }

    /// Path below the anchor, or the whole path for bare names
    #[must_use]
    pub fn relative(&self) -> &str {
        match self.anchor() {
            Anchor::Install | Anchor::UserProfile => {
                self.0.split_once('/').map_or("", |(_, rest)| rest)
            }
            Anchor::None => &self.0,
        }
    }

    /// Last path segment
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Whether this path kept its directory structure
    #[must_use]
    pub fn has_structure(&self) -> bool {
        self.anchor() != Anchor::None || self.0.contains('/')
    }

    /// Relative location of this file inside a remote item folder.
    ///
    /// Install-rooted files are stored by their path under the install
    /// root, profile-rooted files keep the marker as the leading folder and
    /// bare names stay bare.
    #[must_use]
    pub fn storage_key(&self) -> String {
        match self.anchor() {
            Anchor::Install => self.relative().to_string(),
            Anchor::UserProfile | Anchor::None => self.0.clone(),
        }
    }
}

impl fmt::Display for PortablePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PortablePath {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PortablePath> for String {
    fn from(value: PortablePath) -> Self {
        value.0
    }
}

/// The machine-specific roots portable paths are resolved against.
///
/// Passed explicitly into every call; nothing in the engine looks these up
/// on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRoots {
    install_root: PathBuf,
    user_profile: Option<PathBuf>,
}

impl PathRoots {
    /// Roots with only an install directory known
    #[must_use]
    pub fn new(install_root: impl AsRef<Path>) -> Self {
        Self {
            install_root: normalize(install_root.as_ref()),
            user_profile: None,
        }
    }

    #[must_use]
    pub fn with_user_profile(mut self, profile: impl AsRef<Path>) -> Self {
        self.user_profile = Some(normalize(profile.as_ref()));
        self
    }

    /// Install root plus the current user's home directory
    #[must_use]
    pub fn detect(install_root: impl AsRef<Path>) -> Self {
        let roots = Self::new(install_root);
        match dirs::home_dir() {
            Some(home) => roots.with_user_profile(home),
            None => roots,
        }
    }

    #[must_use]
    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    /// Rewrite a file location as a portable path.
    ///
    /// Relative input is taken relative to the install root. Input that
    /// already carries a known marker is normalised and returned. Absolute
    /// input outside both roots collapses to its bare file name.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] if the path has no file name or
    /// starts with an unknown marker.
    pub fn contract(&self, path: &Path) -> Result<PortablePath> {
        let raw = path.to_string_lossy();
        let unified = raw.replace('\\', "/");

        let first = unified.split('/').find(|s| !s.is_empty()).unwrap_or("");
        if is_marker_token(first) {
            return PortablePath::parse(&unified);
        }

        let as_path = PathBuf::from(&unified);
        let absolute = if is_absolute(&as_path, first) {
            normalize(&as_path)
        } else {
            normalize(&self.install_root.join(&as_path))
        };

        if let Some(relative) = relative_segments(&absolute, &self.install_root) {
            return PortablePath::from_parts(INSTALL_MARKER, &relative);
        }
        if let Some(profile) = &self.user_profile
            && let Some(relative) = relative_segments(&absolute, profile)
        {
            return PortablePath::from_parts(PROFILE_MARKER, &relative);
        }

        let name = absolute
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SyncError::validation(raw.to_string(), "path has no file name"))?;
        PortablePath::parse(&name)
    }

    /// [`Self::contract`] for files the engine will read back later.
    ///
    /// A bare-name fallback would expand to a different file under the
    /// install root, so paths outside both roots are refused.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] for paths outside the install root
    /// and user profile, and everything [`Self::contract`] rejects.
    pub fn contract_tracked(&self, path: &Path) -> Result<PortablePath> {
        let portable = self.contract(path)?;
        if portable.anchor() == Anchor::None {
            return Err(SyncError::validation(
                path.to_string_lossy(),
                "outside the install root and user profile",
            ));
        }
        Ok(portable)
    }

    /// Resolve a portable path to an absolute location on this machine.
    ///
    /// Bare names resolve directly under the install root.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when the path is anchored to the
    /// user profile but no profile root is known.
    pub fn expand(&self, portable: &PortablePath) -> Result<PathBuf> {
        let base = match portable.anchor() {
            Anchor::Install | Anchor::None => &self.install_root,
            Anchor::UserProfile => self.user_profile.as_ref().ok_or_else(|| {
                SyncError::validation(portable.as_str(), "no user profile root configured")
            })?,
        };

        let mut out = base.clone();
        for segment in portable.relative().split('/') {
            out.push(segment);
        }
        Ok(out)
    }

    /// Parse then expand
    ///
    /// # Errors
    /// See [`PortablePath::parse`] and [`PathRoots::expand`].
    pub fn expand_str(&self, portable: &str) -> Result<PathBuf> {
        self.expand(&PortablePath::parse(portable)?)
    }
}

fn is_drive_letter(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn is_marker_token(segment: &str) -> bool {
    segment.len() > 2 && segment.starts_with('%') && segment.ends_with('%')
}

fn is_absolute(path: &Path, first_segment: &str) -> bool {
    path.has_root() || is_drive_letter(first_segment)
}

/// Lexical normalisation: unify separators, drop `.`, fold `..`.
fn normalize(path: &Path) -> PathBuf {
    let unified = PathBuf::from(path.to_string_lossy().replace('\\', "/"));
    let mut out = PathBuf::new();
    for component in unified.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn relative_segments(path: &Path, root: &Path) -> Option<Vec<String>> {
    let rest = path.strip_prefix(root).ok()?;
    let segments: Vec<String> = rest
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if segments.is_empty() {
        None
    } else {
        Some(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots() -> PathRoots {
        PathRoots::new("/games/foo").with_user_profile("/home/ana")
    }

    #[test]
    fn test_contract_install_root() {
        let p = roots()
            .contract(Path::new("/games/foo/Saves/slot1.sav"))
            .unwrap();
        assert_eq!(p.as_str(), "%GAMEPATH%/Saves/slot1.sav");
        assert_eq!(p.anchor(), Anchor::Install);
        assert_eq!(p.relative(), "Saves/slot1.sav");
    }

    #[test]
    fn test_contract_user_profile() {
        let p = roots()
            .contract(Path::new("/home/ana/.config/foo/settings.ini"))
            .unwrap();
        assert_eq!(p.as_str(), "%USERPROFILE%/.config/foo/settings.ini");
    }

    #[test]
    fn test_install_root_wins_over_profile() {
        let roots = PathRoots::new("/home/ana/games/foo").with_user_profile("/home/ana");
        let p = roots
            .contract(Path::new("/home/ana/games/foo/save.dat"))
            .unwrap();
        assert_eq!(p.as_str(), "%GAMEPATH%/save.dat");
    }

    #[test]
    fn test_contract_outside_roots_falls_back_to_file_name() {
        let p = roots().contract(Path::new("/mnt/usb/deep/slot1.sav")).unwrap();
        assert_eq!(p.as_str(), "slot1.sav");
        assert_eq!(p.anchor(), Anchor::None);
        assert!(!p.has_structure());
    }

    #[test]
    fn test_contract_tracked_refuses_outside_roots() {
        let err = roots()
            .contract_tracked(Path::new("/mnt/usb/deep/slot1.sav"))
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }), "{err}");
        let p = roots()
            .contract_tracked(Path::new("Saves/slot1.sav"))
            .unwrap();
        assert_eq!(p.as_str(), "%GAMEPATH%/Saves/slot1.sav");
    }

    #[test]
    fn test_contract_drive_letter_falls_back() {
        let p = roots().contract(Path::new("D:\\Other\\Saves\\slot1.sav")).unwrap();
        assert_eq!(p.as_str(), "slot1.sav");
    }

    #[test]
    fn test_contract_windows_style_install_root() {
        let roots = PathRoots::new("C:\\Games\\Foo");
        let p = roots.contract(Path::new("C:\\Games\\Foo\\Saves\\a.sav")).unwrap();
        assert_eq!(p.as_str(), "%GAMEPATH%/Saves/a.sav");
    }

    #[test]
    fn test_contract_relative_is_under_install_root() {
        let p = roots().contract(Path::new("Saves/./slot1.sav")).unwrap();
        assert_eq!(p.as_str(), "%GAMEPATH%/Saves/slot1.sav");
    }

    #[test]
    fn test_contract_already_portable_is_normalised() {
        let p = roots()
            .contract(Path::new("%GAMEPATH%\\Saves\\slot1.sav"))
            .unwrap();
        assert_eq!(p.as_str(), "%GAMEPATH%/Saves/slot1.sav");
    }

    #[test]
    fn test_round_trip_under_install_root() {
        let roots = roots();
        for raw in [
            "/games/foo/save.dat",
            "/games/foo/Saves/slot1.sav",
            "/games/foo/a/b/c/d.bin",
        ] {
            let original = PathBuf::from(raw);
            let portable = roots.contract(&original).unwrap();
            assert_eq!(roots.expand(&portable).unwrap(), original);
        }
    }

    #[test]
    fn test_round_trip_under_profile() {
        let roots = roots();
        let original = PathBuf::from("/home/ana/Documents/Foo/profile.sav");
        let portable = roots.contract(&original).unwrap();
        assert_eq!(roots.expand(&portable).unwrap(), original);
    }

    #[test]
    fn test_expand_bare_name_under_install_root() {
        let expanded = roots().expand_str("slot1.sav").unwrap();
        assert_eq!(expanded, PathBuf::from("/games/foo/slot1.sav"));
    }

    #[test]
    fn test_expand_profile_without_profile_root() {
        let roots = PathRoots::new("/games/foo");
        let err = roots.expand_str("%USERPROFILE%/a.sav").unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "",
            "   ",
            "/abs/path.sav",
            "C:/Games/a.sav",
            "%GAMEPATH%/../escape.sav",
            "%STEAM%/a.sav",
            "Saves/%GAMEPATH%/a.sav",
            "%GAMEPATH%",
        ] {
            assert!(
                matches!(PortablePath::parse(bad), Err(SyncError::Validation { .. })),
                "expected rejection for {bad:?}"
            );
        }
    }

    #[test]
    fn test_storage_key() {
        let p = PortablePath::parse("%GAMEPATH%/Saves/save.dat").unwrap();
        assert_eq!(p.storage_key(), "Saves/save.dat");
        let p = PortablePath::parse("%USERPROFILE%/foo/a.ini").unwrap();
        assert_eq!(p.storage_key(), "%USERPROFILE%/foo/a.ini");
        let p = PortablePath::parse("save.dat").unwrap();
        assert_eq!(p.storage_key(), "save.dat");
        assert_eq!(p.file_name(), "save.dat");
    }

    #[test]
    fn test_serde_validates() {
        let ok: PortablePath = serde_json::from_str("\"%GAMEPATH%/a.sav\"").unwrap();
        assert_eq!(ok.as_str(), "%GAMEPATH%/a.sav");
        assert!(serde_json::from_str::<PortablePath>("\"/etc/passwd\"").is_err());
    }
}
