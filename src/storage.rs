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
    cell::RefCell,
    collections::{HashMap, HashSet},
};

use crate::error::Result;
use crate::guid::Guid;
use crate::ops::{BufferCompletionOp, LocalOverrideCompletionOp, PostResult, UpstreamCompletionOp};
use crate::record::{Item, SyncStatus, Timestamp};
use crate::source::{BufferItemSource, ItemSource, LocalItemSource, MirrorItemSource};
use crate::tree::{BookmarkTree, ItemRow, StructureRow};

/// A row in the favicons table. The merge core only ever preserves the
/// `favicon_id` linking a bookmark to its row here; it never touches the
/// payload.
#[derive(Clone, Debug)]
pub struct FaviconRow {
    pub id: i64,
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub date: Timestamp,
}

/// Posts outgoing records to the server. Injected into the applier; the
/// wire protocol behind it is out of scope here.
pub trait Uploader {
    fn upload(&mut self, op: &UpstreamCompletionOp) -> Result<PostResult>;
}

/// Commits a merge to storage. `apply` must be a single transaction: an
/// outside reader never sees the buffer drained without the mirror updated,
/// or vice versa.
pub trait Storer {
    fn apply(
        &self,
        local_override: &LocalOverrideCompletionOp,
        buffer: &BufferCompletionOp,
    ) -> Result<()>;
}

/// Builds the three trees a sync pass merges. Implementations overlay the
/// change tables onto the mirror, so the merger always sees complete trees.
pub trait TreeSource {
    fn build_local_tree(&self) -> Result<BookmarkTree>;
    fn build_mirror_tree(&self) -> Result<BookmarkTree>;
    fn build_remote_tree(&self) -> Result<BookmarkTree>;
}

/// An in-memory stand-in for the relational store backing the local,
/// mirror, and buffer tables. Structure rows are derived from folder
/// records' `children`, so a consistent caller keeps value and structure in
/// step, the way the real schema's triggers do.
///
/// Tables live behind `RefCell`s because a sync pass holds logical exclusive
/// access (one borrow at a time, single thread), while the applier needs the
/// store as a `Storer` and as three item sources in the same call.
#[derive(Debug, Default)]
pub struct MemoryStore {
    local_values: RefCell<HashMap<Guid, Item>>,
    local_structure: RefCell<Vec<StructureRow>>,
    mirror_values: RefCell<HashMap<Guid, Item>>,
    mirror_structure: RefCell<Vec<StructureRow>>,
    buffer_values: RefCell<HashMap<Guid, Item>>,
    buffer_structure: RefCell<Vec<StructureRow>>,
    favicons: RefCell<HashMap<i64, FaviconRow>>,
    prefetched_guids: RefCell<HashSet<Guid>>,
    added: RefCell<Vec<Guid>>,
    deletions: RefCell<Vec<Guid>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Inserts a changed or new row into the local table. Folder rows carry
    /// their complete ordered children.
    pub fn insert_local(&self, item: Item) {
        Self::upsert(
            &mut self.local_values.borrow_mut(),
            &mut self.local_structure.borrow_mut(),
            item,
        );
    }

    /// Inserts a row into the last-synced mirror.
    pub fn insert_mirror(&self, item: Item) {
        Self::upsert(
            &mut self.mirror_values.borrow_mut(),
            &mut self.mirror_structure.borrow_mut(),
            item,
        );
    }

    /// Stages an incoming record, or tombstone, in the buffer.
    pub fn insert_buffer(&self, item: Item) {
        Self::upsert(
            &mut self.buffer_values.borrow_mut(),
            &mut self.buffer_structure.borrow_mut(),
            item,
        );
    }

    pub fn insert_favicon(&self, row: FaviconRow) {
        self.favicons.borrow_mut().insert(row.id, row);
    }

    fn upsert(values: &mut HashMap<Guid, Item>, structure: &mut Vec<StructureRow>, item: Item) {
        structure.retain(|row| row.parent != item.guid);
        if !item.is_deleted {
            if let Some(children) = &item.children {
                for (position, child) in children.iter().enumerate() {
                    structure.push(StructureRow {
                        parent: item.guid.clone(),
                        child: child.clone(),
                        position: position as i64,
                    });
                }
            }
        }
        values.insert(item.guid.clone(), item);
    }

    /// Returns the mirror row for a GUID, if any.
    pub fn mirror_item(&self, guid: &Guid) -> Option<Item> {
        self.mirror_values.borrow().get(guid).cloned()
    }

    /// Returns the local row for a GUID, if any.
    pub fn local_item(&self, guid: &Guid) -> Option<Item> {
        self.local_values.borrow().get(guid).cloned()
    }

    pub fn buffer_is_empty(&self) -> bool {
        self.buffer_values.borrow().is_empty()
    }

    pub fn local_is_empty(&self) -> bool {
        self.local_values.borrow().is_empty()
    }

    pub fn favicon(&self, id: i64) -> Option<FaviconRow> {
        self.favicons.borrow().get(&id).cloned()
    }

    /// GUIDs written to the mirror by `apply`, in write order.
    pub fn added(&self) -> Vec<Guid> {
        self.added.borrow().clone()
    }

    /// GUIDs removed from the local store or mirror by `apply`.
    pub fn deletions(&self) -> Vec<Guid> {
        self.deletions.borrow().clone()
    }

    /// GUIDs that sources were asked to prefetch, for cache assertions.
    pub fn prefetched(&self) -> HashSet<Guid> {
        self.prefetched_guids.borrow().clone()
    }

    pub fn local_source(&self) -> LocalStoreView<'_> {
        LocalStoreView(self)
    }

    pub fn mirror_source(&self) -> MirrorStoreView<'_> {
        MirrorStoreView(self)
    }

    pub fn buffer_source(&self) -> BufferStoreView<'_> {
        BufferStoreView(self)
    }

    /// Overlays change rows onto the mirror to build one complete tree. A
    /// folder row in the overlay replaces the mirror's structure for that
    /// folder; everything else passes through.
    fn overlay_tree(
        &self,
        overlay_values: &HashMap<Guid, Item>,
        overlay_structure: &[StructureRow],
        overlay_always_modified: bool,
    ) -> Result<BookmarkTree> {
        let mirror_values = self.mirror_values.borrow();
        let mirror_structure = self.mirror_structure.borrow();

        let mut items = Vec::with_capacity(mirror_values.len() + overlay_values.len());
        for item in mirror_values.values() {
            if !overlay_values.contains_key(&item.guid) {
                items.push(ItemRow::new(item.guid.clone(), item.kind));
            }
        }
        for item in overlay_values.values() {
            let mut row = ItemRow::new(item.guid.clone(), item.kind);
            row.deleted = item.is_deleted;
            row.modified = overlay_always_modified
                || item.sync_status.map_or(true, SyncStatus::needs_upload);
            items.push(row);
        }

        let mut structure = Vec::with_capacity(mirror_structure.len() + overlay_structure.len());
        for row in mirror_structure.iter() {
            let parent_overlaid = overlay_values.contains_key(&row.parent);
            let child_tombstoned = overlay_values
                .get(&row.child)
                .map_or(false, |item| item.is_deleted);
            if !parent_overlaid && !child_tombstoned {
                structure.push(row.clone());
            }
        }
        structure.extend(overlay_structure.iter().cloned());

        BookmarkTree::from_rows(items, structure)
    }
}

impl TreeSource for MemoryStore {
    fn build_local_tree(&self) -> Result<BookmarkTree> {
        self.overlay_tree(
            &self.local_values.borrow(),
            &self.local_structure.borrow(),
            false,
        )
    }

    fn build_mirror_tree(&self) -> Result<BookmarkTree> {
        if self.mirror_values.borrow().is_empty() {
            // First sync: pretend the mirror is the five-node skeleton.
            return Ok(BookmarkTree::empty_mirror());
        }
        self.overlay_tree(&HashMap::new(), &[], false)
    }

    fn build_remote_tree(&self) -> Result<BookmarkTree> {
        self.overlay_tree(
            &self.buffer_values.borrow(),
            &self.buffer_structure.borrow(),
            true,
        )
    }
}

impl Storer for MemoryStore {
    fn apply(
        &self,
        local_override: &LocalOverrideCompletionOp,
        buffer: &BufferCompletionOp,
    ) -> Result<()> {
        let mut local_values = self.local_values.borrow_mut();
        let mut local_structure = self.local_structure.borrow_mut();
        let mut mirror_values = self.mirror_values.borrow_mut();
        let mut mirror_structure = self.mirror_structure.borrow_mut();
        let mut buffer_values = self.buffer_values.borrow_mut();
        let mut buffer_structure = self.buffer_structure.borrow_mut();

        for guid in &local_override.mirror_items_to_delete {
            mirror_values.remove(guid);
            mirror_structure.retain(|row| &row.parent != guid && &row.child != guid);
            self.deletions.borrow_mut().push(guid.clone());
        }

        let copies = local_override
            .mirror_values_to_copy_from_buffer
            .iter()
            .chain(local_override.mirror_values_to_copy_from_local.iter());
        for record in copies {
            let mut item = record.clone();
            if let Some(modified) = local_override.modified_times.get(&item.guid) {
                item.server_modified = Some(*modified);
            }
            item.sync_status = Some(SyncStatus::Synced);
            Self::upsert(&mut mirror_values, &mut mirror_structure, item);
            self.added.borrow_mut().push(record.guid.clone());
            local_values.remove(&record.guid);
            local_structure.retain(|row| row.parent != record.guid);
        }

        for guid in local_override.modified_times.keys() {
            // Uploaded tombstones and deduped rows are done with the local
            // table too.
            local_values.remove(guid);
        }

        for guid in &local_override.local_items_to_delete {
            local_values.remove(guid);
            local_structure.retain(|row| &row.parent != guid && &row.child != guid);
            self.deletions.borrow_mut().push(guid.clone());
        }

        for guid in &buffer.processed_buffer_guids {
            buffer_values.remove(guid);
            buffer_structure.retain(|row| &row.parent != guid && &row.child != guid);
        }

        Ok(())
    }
}

/// Reads the local change table.
pub struct LocalStoreView<'a>(&'a MemoryStore);

impl<'a> ItemSource for LocalStoreView<'a> {
    fn fetch(&self, guid: &Guid) -> Result<Option<Item>> {
        Ok(self.0.local_values.borrow().get(guid).cloned())
    }

    fn prefetch(&self, guids: &[Guid]) -> Result<()> {
        self.0
            .prefetched_guids
            .borrow_mut()
            .extend(guids.iter().cloned());
        Ok(())
    }
}

impl<'a> LocalItemSource for LocalStoreView<'a> {}

/// Reads the mirror.
pub struct MirrorStoreView<'a>(&'a MemoryStore);

impl<'a> ItemSource for MirrorStoreView<'a> {
    fn fetch(&self, guid: &Guid) -> Result<Option<Item>> {
        Ok(self.0.mirror_values.borrow().get(guid).cloned())
    }

    fn prefetch(&self, guids: &[Guid]) -> Result<()> {
        self.0
            .prefetched_guids
            .borrow_mut()
            .extend(guids.iter().cloned());
        Ok(())
    }
}

impl<'a> MirrorItemSource for MirrorStoreView<'a> {}

/// Reads the staged incoming buffer.
pub struct BufferStoreView<'a>(&'a MemoryStore);

impl<'a> ItemSource for BufferStoreView<'a> {
    fn fetch(&self, guid: &Guid) -> Result<Option<Item>> {
        Ok(self.0.buffer_values.borrow().get(guid).cloned())
    }

    fn prefetch(&self, guids: &[Guid]) -> Result<()> {
        self.0
            .prefetched_guids
            .borrow_mut()
            .extend(guids.iter().cloned());
        Ok(())
    }
}

impl<'a> BufferItemSource for BufferStoreView<'a> {}
