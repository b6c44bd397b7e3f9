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

use std::collections::{HashMap, HashSet};

use crate::driver::{Driver, GreenLight};
use crate::error::Result;
use crate::guid::Guid;
use crate::merge::{MergedTree, MergedTreeNode, StructureState, ValueState};
use crate::record::{Item, Kind, Timestamp};
use crate::source::{BufferItemSource, LocalItemSource, MirrorItemSource};
use crate::tree::BookmarkTree;

/// Outgoing records to POST, parents before children, with tombstones last.
#[derive(Clone, Debug, Default)]
pub struct UpstreamCompletionOp {
    pub records: Vec<Item>,
}

impl UpstreamCompletionOp {
    /// The GUIDs of all records staged for upload.
    pub fn guids(&self) -> Vec<Guid> {
        self.records
            .iter()
            .map(|record| record.guid.clone())
            .collect()
    }
}

/// The server's answer to an upload: its new collection timestamp, the
/// records it took, and the ones it refused.
#[derive(Clone, Debug)]
pub struct PostResult {
    pub modified: Timestamp,
    pub success: Vec<Guid>,
    pub failed: HashMap<Guid, String>,
}

impl PostResult {
    /// A fully-successful result for the given GUIDs.
    pub fn accepted(modified: Timestamp, success: Vec<Guid>) -> PostResult {
        PostResult {
            modified,
            success,
            failed: HashMap::new(),
        }
    }
}

/// GUIDs to drop from the incoming buffer once the pass commits.
#[derive(Clone, Debug, Default)]
pub struct BufferCompletionOp {
    pub processed_buffer_guids: HashSet<Guid>,
}

/// Everything the storage layer needs to make the mirror and local store
/// reflect the merged tree: value rows to overwrite, rows to drop, and the
/// server timestamps to stamp on uploaded rows.
#[derive(Clone, Debug, Default)]
pub struct LocalOverrideCompletionOp {
    pub mirror_values_to_copy_from_buffer: Vec<Item>,
    pub mirror_values_to_copy_from_local: Vec<Item>,
    pub mirror_items_to_delete: HashSet<Guid>,
    pub modified_times: HashMap<Guid, Timestamp>,
    pub local_items_to_delete: HashSet<Guid>,
}

/// The flattened product of a merge, ready for the applier.
#[derive(Clone, Debug, Default)]
pub struct MergeResult {
    pub upstream: UpstreamCompletionOp,
    pub buffer: BufferCompletionOp,
    pub local_override: LocalOverrideCompletionOp,
}

impl MergeResult {
    /// Indicates if applying this result would change nothing anywhere:
    /// nothing to upload, nothing to write or delete, nothing staged.
    pub fn is_no_op(&self) -> bool {
        self.upstream.records.is_empty()
            && self.buffer.processed_buffer_guids.is_empty()
            && self
                .local_override
                .mirror_values_to_copy_from_buffer
                .is_empty()
            && self
                .local_override
                .mirror_values_to_copy_from_local
                .is_empty()
            && self.local_override.mirror_items_to_delete.is_empty()
            && self.local_override.local_items_to_delete.is_empty()
    }

    /// Returns a printable summary of the result, for logging.
    pub fn summarize(&self) -> Vec<String> {
        let mut summary = Vec::new();
        for record in &self.upstream.records {
            if record.is_deleted {
                summary.push(format!("Upload tombstone {}", record.guid));
            } else {
                summary.push(format!("Upload item {}", record.guid));
            }
        }
        for record in &self.local_override.mirror_values_to_copy_from_buffer {
            summary.push(format!("Copy buffer value {} to mirror", record.guid));
        }
        for record in &self.local_override.mirror_values_to_copy_from_local {
            summary.push(format!("Copy local value {} to mirror", record.guid));
        }
        for guid in &self.local_override.mirror_items_to_delete {
            summary.push(format!("Delete mirror row {}", guid));
        }
        for guid in &self.local_override.local_items_to_delete {
            summary.push(format!("Delete local item {}", guid));
        }
        summary
    }
}

/// Flattens a merged tree into completion ops. The builder resolves value
/// records through the item sources: outgoing and mirror-bound records are
/// rewritten in place with their merged parent and children, so both sides
/// converge on the merged shape, not the shape either side uploaded.
pub struct ResultBuilder<'t, D, G> {
    driver: &'t D,
    signal: &'t G,
    merged: &'t MergedTree<'t>,
    remote_tree: &'t BookmarkTree,
    local_items: &'t dyn LocalItemSource,
    mirror_items: &'t dyn MirrorItemSource,
    buffer_items: &'t dyn BufferItemSource,
}

impl<'t, D: Driver, G: GreenLight> ResultBuilder<'t, D, G> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver: &'t D,
        signal: &'t G,
        merged: &'t MergedTree<'t>,
        remote_tree: &'t BookmarkTree,
        local_items: &'t dyn LocalItemSource,
        mirror_items: &'t dyn MirrorItemSource,
        buffer_items: &'t dyn BufferItemSource,
    ) -> ResultBuilder<'t, D, G> {
        ResultBuilder {
            driver,
            signal,
            merged,
            remote_tree,
            local_items,
            mirror_items,
            buffer_items,
        }
    }

    /// Builds the result. Emits upload records parents-first, then
    /// tombstones for everything deleted remotely.
    pub fn build(&self) -> Result<MergeResult> {
        let mut result = MergeResult::default();

        let root = self.merged.root();
        let root_title = self.resolve_title(root)?;
        for child in &root.merged_children {
            self.signal.err_if_revoked()?;
            self.accumulate(&mut result, child, &root.guid, &root_title)?;
        }

        let mut tombstoned = self
            .merged
            .delete_remotely()
            .iter()
            .cloned()
            .collect::<Vec<_>>();
        tombstoned.sort();
        for guid in tombstoned {
            self.signal.err_if_revoked()?;
            let kind = self
                .mirror_items
                .fetch(&guid)?
                .map_or(Kind::Bookmark, |item| item.kind);
            result.upstream.records.push(Item::tombstone(guid, kind));
        }

        // Only rows actually staged in the buffer are consumed; the rest of
        // the remote tree is mirror fill.
        result.buffer.processed_buffer_guids = self
            .remote_tree
            .guids()
            .filter(|guid| {
                self.remote_tree.is_modified(guid) || self.remote_tree.is_deleted(guid)
            })
            .cloned()
            .collect::<HashSet<_>>();
        result.local_override.mirror_items_to_delete = self.merged.delete_from_mirror().clone();
        result.local_override.local_items_to_delete = self.merged.delete_locally().clone();

        debug!(
            self.driver,
            "Built merge result\n{}",
            result.summarize().join("\n")
        );
        Ok(result)
    }

    fn accumulate(
        &self,
        result: &mut MergeResult,
        node: &MergedTreeNode<'t>,
        parent_guid: &Guid,
        parent_title: &Option<String>,
    ) -> Result<()> {
        self.signal.err_if_revoked()?;
        match &node.value_state {
            ValueState::Unchanged => match node.structure_state {
                StructureState::Unchanged => {}
                StructureState::Remote => {
                    // The incoming side reordered this folder; its record
                    // lands in the mirror as-is, children rewritten to the
                    // merged shape.
                    if let Some(base) = self.fetch_base(node)? {
                        let record = self.rewrite(node, base, parent_guid, parent_title);
                        result
                            .local_override
                            .mirror_values_to_copy_from_buffer
                            .push(record);
                    }
                }
                StructureState::Local | StructureState::New => {
                    // The server doesn't know this folder's merged children
                    // yet, so the record goes up even though its own value
                    // didn't change.
                    if let Some(base) = self.fetch_base(node)? {
                        let record = self.rewrite(node, base, parent_guid, parent_title);
                        result.upstream.records.push(record.clone());
                        result
                            .local_override
                            .mirror_values_to_copy_from_local
                            .push(record);
                    }
                }
            },
            ValueState::Local => {
                let local_guid = node
                    .local_node
                    .map_or(&node.guid, |local_node| local_node.guid());
                match self.local_items.fetch(local_guid)? {
                    Some(base) => {
                        let record = self.rewrite(node, base, parent_guid, parent_title);
                        result.upstream.records.push(record.clone());
                        result
                            .local_override
                            .mirror_values_to_copy_from_local
                            .push(record);
                    }
                    None => {
                        warn!(
                            self.driver,
                            "Local record for {} went missing; skipping upload", node.guid
                        );
                    }
                }
            }
            ValueState::New(item) => {
                let record = self.rewrite(node, item.as_ref().clone(), parent_guid, parent_title);
                result.upstream.records.push(record.clone());
                result
                    .local_override
                    .mirror_values_to_copy_from_local
                    .push(record);
            }
            ValueState::Remote => {
                match self.buffer_items.fetch(&node.guid)? {
                    Some(base) => {
                        let mut record = self.rewrite(node, base, parent_guid, parent_title);
                        // The server doesn't carry favicons; a local row for
                        // the same GUID keeps its icon through the override.
                        if record.favicon_id.is_none() {
                            if let Some(local_node) = node.local_node {
                                if let Some(local_item) =
                                    self.local_items.fetch(local_node.guid())?
                                {
                                    record.favicon_id = local_item.favicon_id;
                                }
                            }
                        }
                        result
                            .local_override
                            .mirror_values_to_copy_from_buffer
                            .push(record);
                    }
                    None => {
                        warn!(
                            self.driver,
                            "Buffer record for {} went missing; leaving mirror row", node.guid
                        );
                    }
                }
                if node.structure_state == StructureState::New {
                    // Remote value, but merged children the server hasn't
                    // seen. Reupload with the merged shape.
                    if let Some(base) = self.fetch_base(node)? {
                        let record = self.rewrite(node, base, parent_guid, parent_title);
                        result.upstream.records.push(record);
                    }
                }
            }
        }

        if node.is_folder() {
            let title = self.resolve_title(node)?;
            for child in &node.merged_children {
                self.accumulate(result, child, &node.guid, &title)?;
            }
        }
        Ok(())
    }

    /// Rewrites a base record so it describes the merged node: merged GUID,
    /// merged parent, and merged children for folders.
    fn rewrite(
        &self,
        node: &MergedTreeNode<'t>,
        mut record: Item,
        parent_guid: &Guid,
        parent_title: &Option<String>,
    ) -> Item {
        record.guid = node.guid.clone();
        record.is_deleted = false;
        record.parent_guid = Some(parent_guid.clone());
        record.parent_title = parent_title.clone();
        if node.is_folder() {
            record.children = Some(node.merged_child_guids());
        }
        record
    }

    /// Fetches the record behind a node: buffer, then local, then mirror.
    fn fetch_base(&self, node: &MergedTreeNode<'t>) -> Result<Option<Item>> {
        if node.remote_node.is_some() {
            if let Some(item) = self.buffer_items.fetch(&node.guid)? {
                return Ok(Some(item));
            }
        }
        if let Some(local_node) = node.local_node {
            if let Some(item) = self.local_items.fetch(local_node.guid())? {
                return Ok(Some(item));
            }
        }
        self.mirror_items.fetch(&node.guid)
    }

    fn resolve_title(&self, node: &MergedTreeNode<'t>) -> Result<Option<String>> {
        Ok(self.fetch_base(node)?.and_then(|item| item.title))
    }
}
