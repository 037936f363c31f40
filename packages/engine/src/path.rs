//! Path handling tailored to the engine.
//!
//! Module identity is a path, so path comparison rules matter more here than
//! in most code: two modules are the same iff their directory paths are equal
//! under [`path_equals`]. The rule mirrors how editors report paths on
//! Windows, where the drive letter casing varies between clients while the
//! rest of the path is reported verbatim.

use std::{
    hash::{Hash, Hasher},
    path::{Component, Path, PathBuf},
};

use derive_more::Display;

/// Compare two paths for equality: volume designators (drive letters, UNC
/// hosts) compare case-insensitively, every remaining byte compares exactly.
pub fn path_equals(a: &Path, b: &Path) -> bool {
    let (vol_a, rest_a) = split_volume(a);
    let (vol_b, rest_b) = split_volume(b);
    match (vol_a, vol_b) {
        (Some(va), Some(vb)) if !va.eq_ignore_ascii_case(vb) => return false,
        (Some(_), None) | (None, Some(_)) => return false,
        _ => {}
    }
    rest_a == rest_b
}

/// Split off the volume prefix, returning it (if any) and the remaining
/// bytes of the path.
fn split_volume(path: &Path) -> (Option<&str>, &[u8]) {
    let bytes = path.as_os_str().as_encoded_bytes();
    match path.components().next() {
        Some(Component::Prefix(prefix)) => {
            let len = prefix.as_os_str().len();
            (prefix.as_os_str().to_str(), &bytes[len..])
        }
        _ => (None, bytes),
    }
}

/// Lexically normalize a path: drop `.` components and resolve `..` against
/// preceding components. Purely textual, no filesystem access, symlinks are
/// not followed.
pub fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::Normal(_) => {
                out.push(component.as_os_str());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                let last_is_normal =
                    matches!(out.components().next_back(), Some(Component::Normal(_)));
                let last_is_rooted = matches!(
                    out.components().next_back(),
                    Some(Component::RootDir | Component::Prefix(_))
                );
                if last_is_normal {
                    out.pop();
                } else if !last_is_rooted {
                    out.push("..");
                }
                // `..` directly at the root stays at the root
            }
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

/// Convert a forward-slash path (the manifest's on-disk form) to the native
/// separator.
pub fn from_slash(raw: &str) -> PathBuf {
    if std::path::MAIN_SEPARATOR == '/' {
        PathBuf::from(raw)
    } else {
        PathBuf::from(raw.replace('/', std::path::MAIN_SEPARATOR_STR))
    }
}

/// An absolute, lexically cleaned directory path identifying a module.
///
/// Construction cleans the path; equality and hashing follow
/// [`path_equals`], so a `ModulePath` is safe to use as a registry key.
#[derive(Clone, Debug, Display)]
#[display("{}", self.inner.display())]
pub struct ModulePath {
    inner: PathBuf,
}

impl ModulePath {
    /// Clean the given path and take it as a module identity.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            inner: clean(path.as_ref()),
        }
    }

    pub fn as_path(&self) -> &Path {
        &self.inner
    }

    /// Join a path fragment below this module directory. The result is
    /// cleaned but intentionally stays a plain [`PathBuf`]; only module
    /// directories get the identity type.
    pub fn join(&self, rel: impl AsRef<Path>) -> PathBuf {
        clean(&self.inner.join(rel.as_ref()))
    }

    /// Whether `other` names the same directory under [`path_equals`].
    pub fn matches(&self, other: &Path) -> bool {
        path_equals(&self.inner, &clean(other))
    }

    /// Render the path relative to a workspace root for display. Falls back
    /// to the full path when the module is not under the root.
    pub fn human_readable(&self, root: &Path) -> String {
        match self.inner.strip_prefix(root) {
            Ok(rel) if rel.as_os_str().is_empty() => root
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.inner.display().to_string()),
            Ok(rel) => rel.display().to_string(),
            Err(_) => self.inner.display().to_string(),
        }
    }
}

impl PartialEq for ModulePath {
    fn eq(&self, other: &Self) -> bool {
        path_equals(&self.inner, &other.inner)
    }
}

impl Eq for ModulePath {}

impl Hash for ModulePath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let (volume, rest) = split_volume(&self.inner);
        if let Some(volume) = volume {
            volume.to_ascii_lowercase().hash(state);
        }
        rest.hash(state);
    }
}

impl AsRef<Path> for ModulePath {
    fn as_ref(&self) -> &Path {
        &self.inner
    }
}

impl From<&Path> for ModulePath {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}
