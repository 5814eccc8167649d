// Copyright 2024 The Meridian Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::iter::FusedIterator;
use std::ops::Deref;
use std::path::Path;
use std::path::PathBuf;

use ref_cast::RefCastCustom;
use ref_cast::ref_cast_custom;
use thiserror::Error;

/// Owned `TreePath` component.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TreePathComponentBuf {
    // Don't add more fields. Eq, Hash, and Ord must be compatible with the
    // borrowed TreePathComponent type.
    value: String,
}

impl TreePathComponentBuf {
    /// Wraps `value` as `TreePathComponentBuf`.
    ///
    /// Returns an error if the input `value` is empty or contains a path
    /// separator.
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidNewTreePathError> {
        let value: String = value.into();
        if is_valid_tree_path_component_str(&value) {
            Ok(Self { value })
        } else {
            Err(InvalidNewTreePathError { value })
        }
    }
}

/// Borrowed `TreePath` component.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, RefCastCustom)]
#[repr(transparent)]
pub struct TreePathComponent {
    value: str,
}

impl TreePathComponent {
    /// Wraps `value` as `TreePathComponent`.
    pub fn new(value: &str) -> Result<&Self, InvalidNewTreePathError> {
        if is_valid_tree_path_component_str(value) {
            Ok(Self::new_unchecked(value))
        } else {
            Err(InvalidNewTreePathError {
                value: value.to_string(),
            })
        }
    }

    #[ref_cast_custom]
    pub(crate) const fn new_unchecked(value: &str) -> &Self;

    /// Returns the underlying string representation.
    pub fn as_internal_str(&self) -> &str {
        &self.value
    }
}

impl Debug for TreePathComponent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &self.value)
    }
}

impl Debug for TreePathComponentBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        <TreePathComponent as Debug>::fmt(self, f)
    }
}

impl AsRef<Self> for TreePathComponent {
    fn as_ref(&self) -> &Self {
        self
    }
}

impl AsRef<TreePathComponent> for TreePathComponentBuf {
    fn as_ref(&self) -> &TreePathComponent {
        self
    }
}

impl Borrow<TreePathComponent> for TreePathComponentBuf {
    fn borrow(&self) -> &TreePathComponent {
        self
    }
}

impl Deref for TreePathComponentBuf {
    type Target = TreePathComponent;

    fn deref(&self) -> &Self::Target {
        TreePathComponent::new_unchecked(&self.value)
    }
}

impl ToOwned for TreePathComponent {
    type Owned = TreePathComponentBuf;

    fn to_owned(&self) -> Self::Owned {
        let value = self.value.to_owned();
        TreePathComponentBuf { value }
    }

    fn clone_into(&self, target: &mut Self::Owned) {
        self.value.clone_into(&mut target.value);
    }
}

/// Iterator over `TreePath` components.
#[derive(Clone, Debug)]
pub struct TreePathComponentsIter<'a> {
    value: &'a str,
}

impl<'a> TreePathComponentsIter<'a> {
    /// Returns the remaining part as a tree path.
    pub fn as_path(&self) -> &'a TreePath {
        TreePath::from_internal_string_unchecked(self.value)
    }
}

impl<'a> Iterator for TreePathComponentsIter<'a> {
    type Item = &'a TreePathComponent;

    fn next(&mut self) -> Option<Self::Item> {
        if self.value.is_empty() {
            return None;
        }
        let (name, remainder) = self
            .value
            .split_once('/')
            .unwrap_or_else(|| (self.value, &self.value[self.value.len()..]));
        self.value = remainder;
        Some(TreePathComponent::new_unchecked(name))
    }
}

impl DoubleEndedIterator for TreePathComponentsIter<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.value.is_empty() {
            return None;
        }
        let (remainder, name) = self
            .value
            .rsplit_once('/')
            .unwrap_or_else(|| (&self.value[..0], self.value));
        self.value = remainder;
        Some(TreePathComponent::new_unchecked(name))
    }
}

impl FusedIterator for TreePathComponentsIter<'_> {}

/// Owned path of an object inside the repository tree.
#[derive(Clone, Eq, Hash, PartialEq, serde::Serialize)]
#[serde(transparent)]
pub struct TreePathBuf {
    // Don't add more fields. Eq, Hash, and Ord must be compatible with the
    // borrowed TreePath type.
    value: String,
}

/// Borrowed path of an object inside the repository tree.
#[derive(Eq, Hash, PartialEq, RefCastCustom, serde::Serialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct TreePath {
    value: str,
}

impl Debug for TreePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &self.value)
    }
}

impl Debug for TreePathBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        <TreePath as Debug>::fmt(self, f)
    }
}

/// The `value` is not a valid tree path because it is empty or contains an
/// empty path component. For example, `"/"`, `"/foo"`, `"foo/"`, `"foo//bar"`
/// are all invalid.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error(r#"Invalid tree path input "{value}""#)]
pub struct InvalidNewTreePathError {
    value: String,
}

impl TreePathBuf {
    /// Creates an owned tree path pointing to the root.
    pub const fn root() -> Self {
        Self {
            value: String::new(),
        }
    }

    /// Creates `TreePathBuf` from a valid string representation.
    pub fn from_internal_string(value: impl Into<String>) -> Result<Self, InvalidNewTreePathError> {
        let value: String = value.into();
        if is_valid_tree_path_str(&value) {
            Ok(Self { value })
        } else {
            Err(InvalidNewTreePathError { value })
        }
    }

    /// Consumes this and returns the underlying string representation.
    pub fn into_internal_string(self) -> String {
        self.value
    }
}

impl TreePath {
    /// Returns the tree path pointing to the root.
    pub const fn root() -> &'static Self {
        Self::from_internal_string_unchecked("")
    }

    /// Wraps a valid string representation as `TreePath`.
    pub fn from_internal_string(value: &str) -> Result<&Self, InvalidNewTreePathError> {
        if is_valid_tree_path_str(value) {
            Ok(Self::from_internal_string_unchecked(value))
        } else {
            Err(InvalidNewTreePathError {
                value: value.to_owned(),
            })
        }
    }

    #[ref_cast_custom]
    pub(crate) const fn from_internal_string_unchecked(value: &str) -> &Self;

    /// The full string form used internally. This format includes a trailing
    /// slash, unless this path represents the root directory. That way it can
    /// be concatenated with a basename and produce a valid path.
    pub fn to_internal_dir_string(&self) -> String {
        if self.value.is_empty() {
            String::new()
        } else {
            [&self.value, "/"].concat()
        }
    }

    /// The full string form used internally.
    pub fn as_internal_file_string(&self) -> &str {
        &self.value
    }

    /// Converts the tree path to a filesystem path relative to `base`.
    pub fn to_fs_path(&self, base: &Path) -> PathBuf {
        let mut result = PathBuf::with_capacity(base.as_os_str().len() + self.value.len() + 1);
        result.push(base);
        result.extend(self.components().map(TreePathComponent::as_internal_str));
        if result.as_os_str().is_empty() {
            result.push(".");
        }
        result
    }

    pub fn is_root(&self) -> bool {
        self.value.is_empty()
    }

    /// Returns true if the `base` is a prefix of this path.
    pub fn starts_with(&self, base: &Self) -> bool {
        self.strip_prefix(base).is_some()
    }

    /// Returns the remaining path with the `base` path removed.
    pub fn strip_prefix(&self, base: &Self) -> Option<&Self> {
        if base.value.is_empty() {
            Some(self)
        } else {
            let tail = self.value.strip_prefix(&base.value)?;
            if tail.is_empty() {
                Some(Self::from_internal_string_unchecked(tail))
            } else {
                tail.strip_prefix('/')
                    .map(Self::from_internal_string_unchecked)
            }
        }
    }

    /// Returns the parent path without the base name component.
    pub fn parent(&self) -> Option<&Self> {
        self.split().map(|(parent, _)| parent)
    }

    /// Splits this into the parent path and base name component.
    pub fn split(&self) -> Option<(&Self, &TreePathComponent)> {
        let mut components = self.components();
        let basename = components.next_back()?;
        Some((components.as_path(), basename))
    }

    pub fn components(&self) -> TreePathComponentsIter<'_> {
        TreePathComponentsIter { value: &self.value }
    }

    pub fn ancestors(&self) -> impl Iterator<Item = &Self> {
        std::iter::successors(Some(self), |path| path.parent())
    }

    pub fn join(&self, entry: &TreePathComponent) -> TreePathBuf {
        let value = if self.value.is_empty() {
            entry.as_internal_str().to_owned()
        } else {
            [&self.value, "/", entry.as_internal_str()].concat()
        };
        TreePathBuf { value }
    }

    /// Appends another relative path to this one.
    pub fn concat(&self, tail: &Self) -> TreePathBuf {
        if self.value.is_empty() {
            tail.to_owned()
        } else if tail.value.is_empty() {
            self.to_owned()
        } else {
            TreePathBuf {
                value: [&self.value, "/", &tail.value].concat(),
            }
        }
    }
}

impl AsRef<Self> for TreePath {
    fn as_ref(&self) -> &Self {
        self
    }
}

impl AsRef<TreePath> for TreePathBuf {
    fn as_ref(&self) -> &TreePath {
        self
    }
}

impl Borrow<TreePath> for TreePathBuf {
    fn borrow(&self) -> &TreePath {
        self
    }
}

impl Deref for TreePathBuf {
    type Target = TreePath;

    fn deref(&self) -> &Self::Target {
        TreePath::from_internal_string_unchecked(&self.value)
    }
}

impl ToOwned for TreePath {
    type Owned = TreePathBuf;

    fn to_owned(&self) -> Self::Owned {
        let value = self.value.to_owned();
        TreePathBuf { value }
    }

    fn clone_into(&self, target: &mut Self::Owned) {
        self.value.clone_into(&mut target.value);
    }
}

impl Ord for TreePath {
    fn cmp(&self, other: &Self) -> Ordering {
        // Compare by components such that "a/b" sorts before "ab".
        self.components().cmp(other.components())
    }
}

impl Ord for TreePathBuf {
    fn cmp(&self, other: &Self) -> Ordering {
        <TreePath as Ord>::cmp(self, other)
    }
}

impl PartialOrd for TreePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialOrd for TreePathBuf {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn is_valid_tree_path_component_str(value: &str) -> bool {
    !value.is_empty() && !value.contains('/')
}

fn is_valid_tree_path_str(value: &str) -> bool {
    !value.starts_with('/') && !value.ends_with('/') && !value.contains("//")
}

/// Device names that cannot be used as dataset path components because they
/// are reserved on Windows filesystems.
const RESERVED_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "CLOCK$", "CONIN$", "CONOUT$", "COM0", "COM1", "COM2", "COM3",
    "COM4", "COM5", "COM6", "COM7", "COM8", "COM9", "LPT0", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5",
    "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Printable characters disallowed in dataset paths. Mostly because they are
/// disallowed in Windows filenames, but also because allowing ':' would make
/// filter-spec parsing ambiguous.
const DISALLOWED_PATH_CHARS: &str = ":<>\"|?*";

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum InvalidDatasetPathError {
    #[error("Dataset path {path:?} may not be empty")]
    Empty { path: String },
    #[error("Dataset path {path:?} may not contain ASCII control characters")]
    ControlCharacter { path: String },
    #[error("Dataset path {path:?} may not contain any of these characters: {DISALLOWED_PATH_CHARS}")]
    DisallowedCharacter { path: String },
    #[error("Dataset path {path:?} may not start with a '/'")]
    LeadingSlash { path: String },
    #[error("Dataset path {path:?} may not contain empty components")]
    EmptyComponent { path: String },
    #[error("Dataset path {path:?} may not contain a component called {component}")]
    ReservedComponent { path: String, component: String },
    #[error("Dataset path {path:?} may not contain a component starting or ending with a '.'")]
    DotComponent { path: String },
    #[error("Dataset path {path:?} may not contain a component ending with a ' '")]
    TrailingSpaceComponent { path: String },
    #[error("Dataset path {path:?} conflicts with existing path {existing:?}")]
    CaseConflict { path: String, existing: String },
}

/// Checks that the given dataset path has no disallowed characters or path
/// components.
pub fn validate_dataset_path(path: &str) -> Result<(), InvalidDatasetPathError> {
    let err_path = || path.to_owned();
    if path.is_empty() {
        return Err(InvalidDatasetPathError::Empty { path: err_path() });
    }
    if path.bytes().any(|b| b < 0x20) {
        return Err(InvalidDatasetPathError::ControlCharacter { path: err_path() });
    }
    if path.chars().any(|c| DISALLOWED_PATH_CHARS.contains(c)) {
        return Err(InvalidDatasetPathError::DisallowedCharacter { path: err_path() });
    }
    if path.starts_with('/') {
        return Err(InvalidDatasetPathError::LeadingSlash { path: err_path() });
    }
    for component in path.split('/') {
        if component.is_empty() {
            return Err(InvalidDatasetPathError::EmptyComponent { path: err_path() });
        }
        let upper = component.to_uppercase();
        if RESERVED_DEVICE_NAMES.contains(&upper.as_str()) {
            return Err(InvalidDatasetPathError::ReservedComponent {
                path: err_path(),
                component: upper,
            });
        }
        if component.starts_with('.') || component.ends_with('.') {
            return Err(InvalidDatasetPathError::DotComponent { path: err_path() });
        }
        if component.ends_with(' ') {
            return Err(InvalidDatasetPathError::TrailingSpaceComponent { path: err_path() });
        }
    }
    Ok(())
}

/// Validates a set of dataset paths together: each path individually, plus
/// case-insensitive collisions between them.
pub fn validate_dataset_paths<'a>(
    paths: impl IntoIterator<Item = &'a str>,
) -> Result<(), InvalidDatasetPathError> {
    let mut seen: HashMap<String, &str> = HashMap::new();
    for path in paths {
        validate_dataset_path(path)?;
        let lower = path.to_lowercase();
        if let Some(existing) = seen.get(&lower) {
            return Err(InvalidDatasetPathError::CaseConflict {
                path: path.to_owned(),
                existing: (*existing).to_owned(),
            });
        }
        seen.insert(lower, path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn path(value: &str) -> &TreePath {
        TreePath::from_internal_string(value).unwrap()
    }

    #[test]
    fn test_root_and_empty() {
        assert!(TreePath::root().is_root());
        assert_eq!(TreePath::root().as_internal_file_string(), "");
        assert!(TreePath::from_internal_string("/foo").is_err());
        assert!(TreePath::from_internal_string("foo/").is_err());
        assert!(TreePath::from_internal_string("foo//bar").is_err());
    }

    #[test]
    fn test_split_join() {
        let p = path("a/b/c");
        let (parent, name) = p.split().unwrap();
        assert_eq!(parent.as_internal_file_string(), "a/b");
        assert_eq!(name.as_internal_str(), "c");
        let joined = parent.join(name);
        assert_eq!(joined.as_internal_file_string(), "a/b/c");
        assert_eq!(
            path("a").concat(path("b/c")).as_internal_file_string(),
            "a/b/c"
        );
    }

    #[test]
    fn test_order() {
        // "a/b" sorts before "ab"
        assert!(path("a/b") < path("ab"));
        assert!(path("a") < path("a/b"));
    }

    #[test]
    fn test_strip_prefix() {
        assert_eq!(
            path("a/b/c").strip_prefix(path("a/b")),
            Some(path("c"))
        );
        assert_eq!(path("a/bc").strip_prefix(path("a/b")), None);
        assert_eq!(path("a/b").strip_prefix(path("a/b")), Some(path("")));
    }

    #[test]
    fn test_validate_dataset_path() {
        assert_matches!(validate_dataset_path("points/topo"), Ok(()));
        assert_matches!(
            validate_dataset_path(""),
            Err(InvalidDatasetPathError::Empty { .. })
        );
        assert_matches!(
            validate_dataset_path("bad\u{7}path"),
            Err(InvalidDatasetPathError::ControlCharacter { .. })
        );
        assert_matches!(
            validate_dataset_path("what?"),
            Err(InvalidDatasetPathError::DisallowedCharacter { .. })
        );
        assert_matches!(
            validate_dataset_path("/abs"),
            Err(InvalidDatasetPathError::LeadingSlash { .. })
        );
        assert_matches!(
            validate_dataset_path("a//b"),
            Err(InvalidDatasetPathError::EmptyComponent { .. })
        );
        assert_matches!(
            validate_dataset_path("a/com1/b"),
            Err(InvalidDatasetPathError::ReservedComponent { .. })
        );
        assert_matches!(
            validate_dataset_path("a/.hidden"),
            Err(InvalidDatasetPathError::DotComponent { .. })
        );
        assert_matches!(
            validate_dataset_path("a/name "),
            Err(InvalidDatasetPathError::TrailingSpaceComponent { .. })
        );
    }

    #[test]
    fn test_reserved_device_names() {
        assert_eq!(RESERVED_DEVICE_NAMES.len(), 27);
        for name in RESERVED_DEVICE_NAMES {
            assert_matches!(
                validate_dataset_path(&name.to_lowercase()),
                Err(InvalidDatasetPathError::ReservedComponent { .. })
            );
        }
    }

    #[test]
    fn test_validate_dataset_paths_case_collision() {
        assert_matches!(validate_dataset_paths(["a/b", "a/c"]), Ok(()));
        assert_matches!(
            validate_dataset_paths(["a/b", "A/B"]),
            Err(InvalidDatasetPathError::CaseConflict { .. })
        );
    }
}
