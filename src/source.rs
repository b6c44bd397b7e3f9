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

use std::collections::HashMap;

use crate::error::Result;
use crate::guid::Guid;
use crate::record::Item;

/// A uniform read interface over one of the three row stores. The merger
/// depends only on this contract: it resolves value records lazily while
/// walking the trees, and never writes through a source.
///
/// `fetch_batch` and `prefetch` exist so that backends over a real database
/// can satisfy a merge pass in a handful of statements instead of one per
/// item. A source's cache is its own business; `prefetch` must be idempotent
/// and have no effect beyond that cache.
pub trait ItemSource {
    /// Returns the value record for `guid`, or `None` if the source doesn't
    /// have one. Missing records are a structural inconsistency, not an
    /// error; the merger degrades the affected node to an unknown leaf.
    fn fetch(&self, guid: &Guid) -> Result<Option<Item>>;

    /// Returns value records for all of `guids` that the source can resolve.
    /// Unresolved GUIDs are simply absent from the map.
    fn fetch_batch(&self, guids: &[Guid]) -> Result<HashMap<Guid, Item>> {
        let mut items = HashMap::with_capacity(guids.len());
        for guid in guids {
            if let Some(item) = self.fetch(guid)? {
                items.insert(guid.clone(), item);
            }
        }
        Ok(items)
    }

    /// Hints that the caller is about to fetch `guids`.
    fn prefetch(&self, _guids: &[Guid]) -> Result<()> {
        Ok(())
    }
}

/// Reads value records for items changed locally since the last sync.
pub trait LocalItemSource: ItemSource {}

/// Reads value records from the last-synced snapshot.
pub trait MirrorItemSource: ItemSource {}

/// Reads staged incoming records from the buffer.
pub trait BufferItemSource: ItemSource {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Kind;

    struct OneItem(Item);

    impl ItemSource for OneItem {
        fn fetch(&self, guid: &Guid) -> Result<Option<Item>> {
            Ok((&self.0.guid == guid).then(|| self.0.clone()))
        }
    }

    #[test]
    fn batch_omits_unresolved_guids() {
        let source = OneItem(Item::new("bookmarkAAAA".into(), Kind::Bookmark));
        let batch = source
            .fetch_batch(&["bookmarkAAAA".into(), "bookmarkMIAA".into()])
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch.contains_key(&Guid::from("bookmarkAAAA")));
        assert!(source.prefetch(&["bookmarkAAAA".into()]).is_ok());
    }
}
