//! Catalog file identity.

use std::path::{Component, Path, PathBuf};

/// Identifies a file in the catalog.
///
/// The identity is the normalized path the catalog knows the file by. It is
/// hashable and totally ordered, and it is the key for the thumbnail cache.
/// For most requests it is also the file that gets decoded; video requests
/// decode a snapshot file instead (see [`super::RequestKind::VideoRescale`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileIdentity(String);

impl FileIdentity {
    /// Creates an identity from a path, normalizing `.` and `..` components.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self(normalize(path.as_ref()).to_string_lossy().into_owned())
    }

    /// Creates an identity only if the normalized path is valid UTF-8.
    ///
    /// [`Self::new`] replaces invalid sequences, which leaves an identity
    /// that no longer names the file on disk.
    #[must_use]
    pub fn try_new(path: impl AsRef<Path>) -> Option<Self> {
        normalize(path.as_ref()).into_os_string().into_string().ok().map(Self)
    }

    /// Returns the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the identity as a filesystem path.
    #[must_use]
    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }

    /// Returns the `file://` URI used for content-addressed thumbnail keys.
    #[must_use]
    pub fn uri(&self) -> String {
        uri_for_path(self.as_path())
    }

    /// Returns the lowercase file extension, if any.
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        extension_of(self.as_path())
    }
}

impl std::fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FileIdentity {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<PathBuf> for FileIdentity {
    fn from(p: PathBuf) -> Self {
        Self::new(p)
    }
}

/// Returns the `file://` URI for a path after normalization.
#[must_use]
pub fn uri_for_path(path: &Path) -> String {
    let absolute = if path.is_absolute() {
        normalize(path)
    } else {
        std::env::current_dir()
            .map(|cwd| normalize(&cwd.join(path)))
            .unwrap_or_else(|_| normalize(path))
    };
    format!("file://{}", absolute.to_string_lossy())
}

/// Returns the lowercase extension of a path, if any.
#[must_use]
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_dot_components() {
        let id = FileIdentity::new("/photos/./2020/../2021/img.jpg");
        assert_eq!(id.as_str(), "/photos/2021/img.jpg");
    }

    #[test]
    fn test_equal_after_normalization() {
        assert_eq!(
            FileIdentity::new("/a/b/../c.png"),
            FileIdentity::new("/a/c.png")
        );
    }

    #[test]
    fn test_extension_is_lowercase() {
        let id = FileIdentity::new("/photos/IMG_0001.CR2");
        assert_eq!(id.extension().as_deref(), Some("cr2"));
    }

    #[test]
    fn test_uri_for_absolute_path() {
        let id = FileIdentity::new("/photos/img.jpg");
        assert_eq!(id.uri(), "file:///photos/img.jpg");
    }

    #[test]
    fn test_try_new_accepts_utf8_paths() {
        assert_eq!(
            FileIdentity::try_new("/photos/./été.jpg"),
            Some(FileIdentity::new("/photos/été.jpg"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_try_new_rejects_non_utf8_paths() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let path = Path::new(OsStr::from_bytes(b"/photos/\xff.jpg"));
        assert!(FileIdentity::try_new(path).is_none());
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        assert!(FileIdentity::new("/a.jpg") < FileIdentity::new("/b.jpg"));
    }
}
