//! Element names and labels.
//!
//! Storage, stream, transform and data-space names all compare
//! case-insensitively while preserving the casing they were created with.

use std::{
    borrow::Borrow,
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
};

use crate::error::{Error, Result};

/// Longest element name accepted, in UTF-16 code units.
pub const MAX_ELEMENT_NAME_LEN: usize = 31;

/// Stream name reserved for an encrypted package envelope.
pub const PACKAGE_STREAM_NAME: &str = "EncryptedPackage";

const INVALID_NAME_CHARS: [char; 4] = ['\\', '/', ':', '!'];

/// A name compared by its case-folded form.
#[derive(Clone)]
pub struct NameKey {
    folded: String,
    original: String,
}

impl NameKey {
    /// Wraps `name`, keeping its casing for display.
    pub fn new(name: impl Into<String>) -> Self {
        let original = name.into();
        Self { folded: fold(&original), original }
    }

    /// The name as originally supplied.
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// The case-folded comparison key.
    pub fn folded(&self) -> &str {
        &self.folded
    }
}

impl PartialEq for NameKey {
    fn eq(&self, other: &Self) -> bool {
        self.folded == other.folded
    }
}

impl Eq for NameKey {}

impl PartialOrd for NameKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NameKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.folded.cmp(&other.folded)
    }
}

impl Hash for NameKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.folded.hash(state);
    }
}

impl fmt::Debug for NameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.original, f)
    }
}

impl fmt::Display for NameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

/// Lookup by folded form: `map.get(fold(name).as_str())`.
impl Borrow<str> for NameKey {
    fn borrow(&self) -> &str {
        &self.folded
    }
}

impl From<&str> for NameKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Case-folds `name` for comparison.
pub fn fold(name: &str) -> String {
    name.to_lowercase()
}

/// Case-insensitive equality.
pub fn names_equal(a: &str, b: &str) -> bool {
    fold(a) == fold(b)
}

/// Whether `name` is reserved for internal bookkeeping.
pub fn is_reserved_name(name: &str) -> bool {
    name.chars().next().is_some_and(char::is_control)
}

/// Checks the character and length restrictions on an element name.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if the name is empty, too long or
/// contains a path separator.
pub fn validate_element_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument { reason: "element name is empty".to_string() });
    }
    let len = name.encode_utf16().count();
    if len > MAX_ELEMENT_NAME_LEN {
        return Err(Error::InvalidArgument {
            reason: format!(
                "element name {name:?} is {len} units long (max {MAX_ELEMENT_NAME_LEN})"
            ),
        });
    }
    if let Some(c) = name.chars().find(|c| INVALID_NAME_CHARS.contains(c)) {
        return Err(Error::InvalidArgument {
            reason: format!("element name {name:?} contains invalid character {c:?}"),
        });
    }
    Ok(())
}

/// Validates a caller-supplied element name, rejecting reserved names.
///
/// # Errors
///
/// Returns [`Error::ReservedName`] for reserved names, otherwise see
/// [`validate_element_name`].
pub fn validate_user_name(name: &str) -> Result<()> {
    validate_element_name(name)?;
    if is_reserved_name(name) {
        return Err(Error::ReservedName { name: name.to_string() });
    }
    Ok(())
}
