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

use std::fmt;

use serde_derive::{Deserialize, Serialize};

use crate::guid::Guid;

/// Timestamps are wall-clock milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Synced item kinds. Each corresponds to a Sync record type.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Kind {
    #[serde(rename = "bookmark")]
    Bookmark,
    #[serde(rename = "query")]
    Query,
    #[serde(rename = "folder")]
    Folder,
    #[serde(rename = "livemark")]
    Livemark,
    #[serde(rename = "separator")]
    Separator,
    #[serde(rename = "dynamic-container")]
    DynamicContainer,
}

impl Kind {
    /// Indicates if an item of this kind may have children.
    #[inline]
    pub fn is_container(self) -> bool {
        matches!(self, Kind::Folder | Kind::Livemark | Kind::DynamicContainer)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The change status of a local row. New and changed rows are pending upload;
/// synced rows match the mirror.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SyncStatus {
    Synced,
    New,
    Changed,
}

impl SyncStatus {
    /// Indicates if a row with this status has outstanding local changes.
    #[inline]
    pub fn needs_upload(self) -> bool {
        !matches!(self, SyncStatus::Synced)
    }
}

/// A value record for one item, as stored in the mirror and exchanged with
/// the server. The same shape backs all kinds; kind-specific fields are
/// optional and absent for other kinds.
///
/// The serialized form is the Sync wire payload, with the historical field
/// names. `Guid`'s serde impls normalize the six short root names on ingress,
/// for both `id` and `parentid`, and denormalize them on egress.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(rename = "id")]
    pub guid: Guid,

    #[serde(rename = "type")]
    pub kind: Kind,

    #[serde(rename = "deleted", default, skip_serializing_if = "is_false")]
    pub is_deleted: bool,

    #[serde(rename = "hasDupe", default, skip_serializing_if = "is_false")]
    pub has_dupe: bool,

    #[serde(rename = "parentid", default, skip_serializing_if = "Option::is_none")]
    pub parent_guid: Option<Guid>,

    #[serde(rename = "parentName", default, skip_serializing_if = "Option::is_none")]
    pub parent_title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "bmkUri", default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,

    #[serde(rename = "feedUri", default, skip_serializing_if = "Option::is_none")]
    pub feed_url: Option<String>,

    #[serde(rename = "siteUri", default, skip_serializing_if = "Option::is_none")]
    pub site_url: Option<String>,

    #[serde(rename = "queryId", default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,

    #[serde(rename = "folderName", default, skip_serializing_if = "Option::is_none")]
    pub smart_folder_name: Option<String>,

    /// Separator position, from older clients that sync it.
    #[serde(rename = "pos", default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,

    /// Ordered child GUIDs; folders only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<Guid>>,

    /// Server timestamp from the record envelope, not the payload.
    #[serde(skip)]
    pub server_modified: Option<Timestamp>,

    // Internal metadata. Never serialized, never part of `same_as`.
    #[serde(skip)]
    pub favicon_id: Option<i64>,

    #[serde(skip)]
    pub local_modified: Option<Timestamp>,

    #[serde(skip)]
    pub sync_status: Option<SyncStatus>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Item {
    /// Creates a bare item with the given kind.
    pub fn new(guid: Guid, kind: Kind) -> Item {
        Item {
            guid,
            kind,
            is_deleted: false,
            has_dupe: false,
            parent_guid: None,
            parent_title: None,
            title: None,
            description: None,
            url: None,
            tags: None,
            keyword: None,
            feed_url: None,
            site_url: None,
            query_id: None,
            smart_folder_name: None,
            position: None,
            children: None,
            server_modified: None,
            favicon_id: None,
            local_modified: None,
            sync_status: None,
        }
    }

    /// Creates a folder with the given ordered children.
    pub fn folder(guid: Guid, title: &str, children: &[Guid]) -> Item {
        let mut item = Item::new(guid, Kind::Folder);
        item.title = Some(title.into());
        item.children = Some(children.to_vec());
        item
    }

    /// Creates a bookmark pointing at a URL.
    pub fn bookmark(guid: Guid, title: &str, url: &str) -> Item {
        let mut item = Item::new(guid, Kind::Bookmark);
        item.title = Some(title.into());
        item.url = Some(url.into());
        item
    }

    /// Creates a tombstone for a deleted item.
    pub fn tombstone(guid: Guid, kind: Kind) -> Item {
        let mut item = Item::new(guid, kind);
        item.is_deleted = true;
        item
    }

    /// Sets the parent fields, for chaining in builders and tests.
    pub fn with_parent(mut self, parent_guid: &Guid, parent_title: Option<&str>) -> Item {
        self.parent_guid = Some(parent_guid.clone());
        self.parent_title = parent_title.map(Into::into);
        self
    }

    #[inline]
    pub fn is_folder(&self) -> bool {
        self.kind == Kind::Folder
    }

    /// Indicates if the item can be merged with another item. Only items with
    /// compatible kinds can be merged. Bookmarks and queries are
    /// interchangeable, as simply changing the URL can cause one to flip
    /// kinds.
    pub fn has_compatible_kind(&self, other: &Item) -> bool {
        match (self.kind, other.kind) {
            (Kind::Bookmark, Kind::Query) | (Kind::Query, Kind::Bookmark) => true,
            (this, that) => this == that,
        }
    }

    /// Semantic content equality, used to match duplicates with different
    /// GUIDs. Compares every user-visible field, and child GUID lists
    /// element-wise; ignores the GUID itself, `hasDupe`, server timestamps,
    /// and internal metadata.
    pub fn same_as(&self, other: &Item) -> bool {
        self.kind == other.kind
            && self.is_deleted == other.is_deleted
            && self.parent_guid == other.parent_guid
            && self.parent_title == other.parent_title
            && self.title == other.title
            && self.description == other.description
            && self.url == other.url
            && self.tags == other.tags
            && self.keyword == other.keyword
            && self.feed_url == other.feed_url
            && self.site_url == other.site_url
            && self.query_id == other.query_id
            && self.smart_folder_name == other.smart_folder_name
            && self.position == other.position
            && self.children == other.children
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_deleted {
            write!(f, "{} (Tombstone)", self.guid)
        } else {
            write!(f, "{} ({})", self.guid, self.kind)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::{MOBILE_GUID, UNFILED_GUID};

    #[test]
    fn same_as_ignores_guid_and_metadata() {
        let mut a = Item::folder("folderAAAAAA".into(), "Empty", &[])
            .with_parent(&MOBILE_GUID, Some("mobile"));
        let mut b = Item::folder("folderBBBBBB".into(), "Empty", &[])
            .with_parent(&MOBILE_GUID, Some("mobile"));
        b.has_dupe = true;
        b.server_modified = Some(1_500_000_000_000);
        a.favicon_id = Some(11);
        a.sync_status = Some(SyncStatus::New);
        assert!(a.same_as(&b));
        assert!(b.same_as(&a));

        b.title = Some("Not empty".into());
        assert!(!a.same_as(&b));
    }

    #[test]
    fn same_as_compares_children_elementwise() {
        let a = Item::folder(
            "folderAAAAAA".into(),
            "F",
            &["bookmarkAAAA".into(), "bookmarkBBBB".into()],
        );
        let mut b = a.clone();
        b.guid = "folderBBBBBB".into();
        assert!(a.same_as(&b));

        b.children = Some(vec!["bookmarkBBBB".into(), "bookmarkAAAA".into()]);
        assert!(!a.same_as(&b));
    }

    #[test]
    fn wire_round_trip_normalizes_roots() {
        let payload = r#"{
            "id": "bookmarkAAAA",
            "type": "bookmark",
            "parentid": "unfiled",
            "parentName": "Other Bookmarks",
            "title": "Example",
            "bmkUri": "http://example.com/"
        }"#;
        let item: Item = serde_json::from_str(payload).unwrap();
        assert_eq!(item.parent_guid.as_ref().unwrap(), &UNFILED_GUID);
        assert_eq!(item.kind, Kind::Bookmark);

        let out = serde_json::to_value(&item).unwrap();
        assert_eq!(out["parentid"], "unfiled");
        assert_eq!(out["id"], "bookmarkAAAA");
        assert!(out.get("deleted").is_none());
    }

    #[test]
    fn tombstone_wire_shape() {
        let tombstone: Item =
            serde_json::from_str(r#"{"id": "places", "type": "folder", "deleted": true}"#).unwrap();
        assert!(tombstone.is_deleted);
        assert!(tombstone.guid.is_root());
    }
}
