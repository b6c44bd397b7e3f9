// Copyright 2018-2019 Mozilla

// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    ops, str,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A GUID for an item in a bookmark tree.
#[derive(Clone)]
pub struct Guid(Repr);

/// The internal representation of a GUID. Valid GUIDs are 12 bytes, and contain
/// only Base64url characters; we can store them on the stack without a heap
/// allocation. However, both local and remote items might have invalid GUIDs,
/// in which case we fall back to a heap-allocated string.
#[derive(Clone)]
enum Repr {
    Valid([u8; 12]),
    Invalid(Box<str>),
}

/// The Places root GUID, used to root all items in a bookmark tree.
pub const ROOT_GUID: Guid = Guid(Repr::Valid(*b"root________"));

/// The bookmarks menu GUID.
pub const MENU_GUID: Guid = Guid(Repr::Valid(*b"menu________"));

/// The bookmarks toolbar GUID.
pub const TOOLBAR_GUID: Guid = Guid(Repr::Valid(*b"toolbar_____"));

/// The "Other Bookmarks" GUID, used to hold items without a parent.
pub const UNFILED_GUID: Guid = Guid(Repr::Valid(*b"unfiled_____"));

/// The mobile bookmarks GUID.
pub const MOBILE_GUID: Guid = Guid(Repr::Valid(*b"mobile______"));

/// A pseudo-root for grouping Desktop bookmarks in views on other platforms.
/// Never persisted to storage, and never transmitted to the server.
pub const DESKTOP_GUID: Guid = Guid(Repr::Valid(*b"desktop_____"));

/// The four user content roots, in canonical order. A merged tree's root
/// always has exactly these children, in exactly this order.
pub const USER_CONTENT_ROOTS: [Guid; 4] = [MENU_GUID, TOOLBAR_GUID, UNFILED_GUID, MOBILE_GUID];

const VALID_GUID_BYTES: [u8; 255] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0,
    0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 1,
    0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

impl Guid {
    /// Converts a UTF-8 byte slice to a GUID, without normalizing root
    /// names. This is the ingress point for row storage, where the extended
    /// root GUIDs are already canonical.
    pub fn from_utf8(b: &[u8]) -> crate::error::Result<Guid> {
        let repr = if is_valid_guid(b) {
            let mut bytes = [0u8; 12];
            bytes.copy_from_slice(b);
            Repr::Valid(bytes)
        } else {
            match str::from_utf8(b) {
                Ok(s) => Repr::Invalid(s.into()),
                Err(err) => return Err(err.into()),
            }
        };
        Ok(Guid(repr))
    }

    /// Converts a server record ID to a GUID, normalizing the six historical
    /// short root names to their extended forms. Incoming record `id`s and
    /// `parentid`s must pass through here; everything else on the wire is
    /// passed through unchanged.
    pub fn from_server_id(s: &str) -> Guid {
        match s {
            "places" | "root" => ROOT_GUID,
            "menu" => MENU_GUID,
            "toolbar" => TOOLBAR_GUID,
            "unfiled" => UNFILED_GUID,
            "mobile" => MOBILE_GUID,
            _ => Guid::from(s),
        }
    }

    /// The inverse of `from_server_id`: returns the historical short name
    /// for outgoing root records.
    pub fn as_server_id(&self) -> &str {
        match self.as_str() {
            "root________" => "places",
            "menu________" => "menu",
            "toolbar_____" => "toolbar",
            "unfiled_____" => "unfiled",
            "mobile______" => "mobile",
            s => s,
        }
    }

    /// Returns the GUID as a byte slice.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self.0 {
            Repr::Valid(ref bytes) => bytes,
            Repr::Invalid(ref s) => s.as_bytes(),
        }
    }

    /// Returns the GUID as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        match self.0 {
            Repr::Valid(ref bytes) => str::from_utf8(bytes).unwrap(),
            Repr::Invalid(ref s) => s,
        }
    }

    /// Indicates if the GUID is well-formed: 12 Base64url bytes.
    #[inline]
    pub fn is_valid(&self) -> bool {
        match self.0 {
            Repr::Valid(_) => true,
            Repr::Invalid(_) => false,
        }
    }

    /// Indicates if the GUID is the Places root.
    #[inline]
    pub fn is_root(&self) -> bool {
        self == ROOT_GUID
    }

    /// Indicates if the GUID is one of the four user content roots.
    #[inline]
    pub fn is_user_content_root(&self) -> bool {
        USER_CONTENT_ROOTS.contains(self)
    }

    /// Indicates if the GUID is any built-in root, including the Places root
    /// and the Desktop pseudo-root.
    #[inline]
    pub fn is_built_in_root(&self) -> bool {
        self.is_root() || self.is_user_content_root() || self == DESKTOP_GUID
    }
}

/// Equivalent to `PlacesUtils.isValidGuid`.
#[inline]
fn is_valid_guid(bytes: &[u8]) -> bool {
    bytes.len() == 12
        && bytes
            .iter()
            .all(|&byte| VALID_GUID_BYTES.get(byte as usize).map_or(false, |&b| b == 1))
}

impl From<String> for Guid {
    #[inline]
    fn from(s: String) -> Guid {
        Guid::from(s.as_str())
    }
}

impl<'a> From<&'a str> for Guid {
    #[inline]
    fn from(s: &'a str) -> Guid {
        let repr = if is_valid_guid(s.as_bytes()) {
            assert!(s.is_char_boundary(12));
            let mut bytes = [0u8; 12];
            bytes.copy_from_slice(s.as_bytes());
            Repr::Valid(bytes)
        } else {
            Repr::Invalid(s.into())
        };
        Guid(repr)
    }
}

impl AsRef<str> for Guid {
    #[inline]
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl ops::Deref for Guid {
    type Target = str;

    #[inline]
    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl Ord for Guid {
    fn cmp(&self, other: &Guid) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl PartialOrd for Guid {
    fn partial_cmp(&self, other: &Guid) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Allow direct comparison with str
impl PartialEq<str> for Guid {
    #[inline]
    fn eq(&self, other: &str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl<'a> PartialEq<&'a str> for Guid {
    #[inline]
    fn eq(&self, other: &&'a str) -> bool {
        self == *other
    }
}

impl PartialEq for Guid {
    #[inline]
    fn eq(&self, other: &Guid) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl<'a> PartialEq<Guid> for &'a Guid {
    #[inline]
    fn eq(&self, other: &Guid) -> bool {
        *self == other
    }
}

impl Eq for Guid {}

impl Hash for Guid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl Serialize for Guid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_server_id())
    }
}

impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Guid, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Guid::from_server_id(&s))
    }
}

// The default Debug impl is pretty unhelpful here.
impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({:?})", self.as_str())
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_valid() {
        let valid_guids = &[
            "bookmarkAAAA",
            "menu________",
            "__folderBB__",
            "queryAAAAAAA",
        ];
        for s in valid_guids {
            assert!(Guid::from(*s).is_valid(), "{:?} should validate", s);
        }

        let invalid_guids = &["bookmarkAAA", "folder!", "b@dgu1d!"];
        for s in invalid_guids {
            assert!(!Guid::from(*s).is_valid(), "{:?} should not validate", s);
        }
    }

    #[test]
    fn normalizes_historical_root_names() {
        assert_eq!(Guid::from_server_id("places"), ROOT_GUID);
        assert_eq!(Guid::from_server_id("root"), ROOT_GUID);
        assert_eq!(Guid::from_server_id("menu"), MENU_GUID);
        assert_eq!(Guid::from_server_id("toolbar"), TOOLBAR_GUID);
        assert_eq!(Guid::from_server_id("unfiled"), UNFILED_GUID);
        assert_eq!(Guid::from_server_id("mobile"), MOBILE_GUID);
        assert_eq!(
            Guid::from_server_id("bookmarkAAAA"),
            Guid::from("bookmarkAAAA")
        );

        assert_eq!(ROOT_GUID.as_server_id(), "places");
        assert_eq!(MOBILE_GUID.as_server_id(), "mobile");
        assert_eq!(Guid::from("bookmarkAAAA").as_server_id(), "bookmarkAAAA");
    }

    #[test]
    fn canonical_order() {
        assert_eq!(
            USER_CONTENT_ROOTS
                .iter()
                .map(Guid::as_str)
                .collect::<Vec<_>>(),
            &["menu________", "toolbar_____", "unfiled_____", "mobile______"]
        );
    }
}
