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
    collections::{HashMap, HashSet},
    fmt,
};

use crate::driver::{AlwaysGreen, DefaultDriver, Driver, GreenLight};
use crate::error::{ErrorKind, Result};
use crate::guid::{Guid, ROOT_GUID, UNFILED_GUID, USER_CONTENT_ROOTS};
use crate::record::{Item, Kind};
use crate::source::{BufferItemSource, LocalItemSource, MirrorItemSource};
use crate::tree::{BookmarkTree, ItemRow, Node, NodeKind, StructureRow};

/// Records structure change counters for telemetry.
#[derive(Clone, Copy, Default, Debug, Eq, Hash, PartialEq)]
pub struct StructureCounts {
    /// Remote non-folder change wins over local deletion.
    pub remote_revives: usize,
    /// Local folder deletion wins over remote change.
    pub local_deletes: usize,
    /// Local non-folder change wins over remote deletion.
    pub local_revives: usize,
    /// Remote folder deletion wins over local change.
    pub remote_deletes: usize,
    /// Deduped local items.
    pub dupes: usize,
    /// Total number of nodes in the merged tree, excluding the
    /// root.
    pub merged_nodes: usize,
}

/// Which side's value record wins for a merged node.
#[derive(Clone, Debug, PartialEq)]
pub enum ValueState {
    /// Neither side changed the record; the mirror copy stands.
    Unchanged,
    /// The local record wins, and should be uploaded.
    Local,
    /// The incoming record wins, and should be copied to the mirror.
    Remote,
    /// The merger synthesized a record neither side has verbatim, usually to
    /// rewrite the parent of a relocated item. It should be uploaded and
    /// copied to the mirror.
    New(Box<Item>),
}

impl ValueState {
    /// Indicates if this node's record should be posted to the server.
    #[inline]
    pub fn should_upload(&self) -> bool {
        matches!(self, ValueState::Local | ValueState::New(_))
    }
}

/// Which side's child ordering wins for a merged folder.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StructureState {
    Unchanged,
    Local,
    Remote,
    /// The merged children match neither input; both sides need the new
    /// ordering.
    New,
}

/// A merged node, labeled with the value and structure decisions, and
/// holding the up-to-three tree nodes it was merged from.
#[derive(Debug)]
pub struct MergedTreeNode<'t> {
    pub guid: Guid,
    pub local_node: Option<Node<'t>>,
    pub mirror_node: Option<Node<'t>>,
    pub remote_node: Option<Node<'t>>,
    pub value_state: ValueState,
    pub structure_state: StructureState,
    pub merged_children: Vec<MergedTreeNode<'t>>,
}

impl<'t> MergedTreeNode<'t> {
    fn new(guid: Guid, value_state: ValueState) -> MergedTreeNode<'t> {
        MergedTreeNode {
            guid,
            local_node: None,
            mirror_node: None,
            remote_node: None,
            value_state,
            structure_state: StructureState::Unchanged,
            merged_children: Vec::new(),
        }
    }

    /// Indicates if the node has been processed and its children decided.
    #[inline]
    pub fn has_decided_children(&self) -> bool {
        !self.is_folder() || self.structure_state != StructureState::Unchanged
            || !self.merged_children.is_empty()
            || self.sides().all(|node| {
                node.children().next().is_none()
            })
    }

    /// Indicates if any side knows this node as a folder.
    pub fn is_folder(&self) -> bool {
        self.sides().any(|node| node.is_folder())
    }

    /// The record kind for this node, preferring the incoming side. Built-in
    /// roots synthesized without a backing node are always folders.
    pub fn kind(&self) -> Kind {
        self.sides()
            .find_map(|node| match node.kind() {
                NodeKind::Folder => Some(Kind::Folder),
                NodeKind::NonFolder(kind) => Some(kind),
                NodeKind::Unknown => None,
            })
            .unwrap_or(if self.guid.is_built_in_root() {
                Kind::Folder
            } else {
                Kind::Bookmark
            })
    }

    fn sides(&self) -> impl Iterator<Item = &Node<'t>> {
        self.remote_node
            .iter()
            .chain(self.local_node.iter())
            .chain(self.mirror_node.iter())
    }

    /// The GUIDs of the merged children, in order.
    pub fn merged_child_guids(&self) -> Vec<Guid> {
        self.merged_children
            .iter()
            .map(|child| child.guid.clone())
            .collect()
    }

    fn to_ascii_fragment(&self, prefix: &str) -> String {
        if self.is_folder() || !self.merged_children.is_empty() {
            let children_prefix = format!("{}| ", prefix);
            let children = self
                .merged_children
                .iter()
                .map(|n| n.to_ascii_fragment(&children_prefix))
                .collect::<Vec<String>>();
            if children.is_empty() {
                format!("{}📂 {}", prefix, &self)
            } else {
                format!("{}📂 {}\n{}", prefix, &self, children.join("\n"))
            }
        } else {
            format!("{}🔖 {}", prefix, &self)
        }
    }
}

impl<'t> fmt::Display for MergedTreeNode<'t> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match &self.value_state {
            ValueState::Unchanged => "Unchanged",
            ValueState::Local => "Local",
            ValueState::Remote => "Remote",
            ValueState::New(_) => "New",
        };
        let structure = match self.structure_state {
            StructureState::Unchanged => "Unchanged",
            StructureState::Local => "Local",
            StructureState::Remote => "Remote",
            StructureState::New => "New",
        };
        write!(f, "{} ({}, {})", self.guid, value, structure)
    }
}

/// The result of a merge: a tree rooted at the canonical root, plus the
/// deletion sets that, together with the tree, account for every GUID in the
/// inputs.
#[derive(Debug)]
pub struct MergedTree<'t> {
    root: MergedTreeNode<'t>,
    merged_guids: HashSet<Guid>,
    delete_locally: HashSet<Guid>,
    delete_remotely: HashSet<Guid>,
    delete_from_mirror: HashSet<Guid>,
    accept_local_deletion: HashSet<Guid>,
    accept_remote_deletion: HashSet<Guid>,
    counts: StructureCounts,
}

impl<'t> MergedTree<'t> {
    /// Returns the merged root node.
    #[inline]
    pub fn root(&self) -> &MergedTreeNode<'t> {
        &self.root
    }

    /// Returns every GUID placed in the merged tree.
    pub fn all_guids(&self) -> HashSet<Guid> {
        fn accumulate(guids: &mut HashSet<Guid>, node: &MergedTreeNode<'_>) {
            guids.insert(node.guid.clone());
            for child in &node.merged_children {
                accumulate(guids, child);
            }
        }
        let mut guids = HashSet::new();
        accumulate(&mut guids, &self.root);
        guids
    }

    /// Items to remove from the local store.
    #[inline]
    pub fn delete_locally(&self) -> &HashSet<Guid> {
        &self.delete_locally
    }

    /// Items to tombstone on the server.
    #[inline]
    pub fn delete_remotely(&self) -> &HashSet<Guid> {
        &self.delete_remotely
    }

    /// Rows to drop from the mirror.
    #[inline]
    pub fn delete_from_mirror(&self) -> &HashSet<Guid> {
        &self.delete_from_mirror
    }

    /// Local deletions that won against the other side.
    #[inline]
    pub fn accept_local_deletion(&self) -> &HashSet<Guid> {
        &self.accept_local_deletion
    }

    /// Remote deletions that won against the other side.
    #[inline]
    pub fn accept_remote_deletion(&self) -> &HashSet<Guid> {
        &self.accept_remote_deletion
    }

    /// Returns structure change counts for this merge.
    #[inline]
    pub fn counts(&self) -> &StructureCounts {
        &self.counts
    }

    /// Indicates if the merge accounted for the GUID: placed in the tree, or
    /// covered by a deletion set.
    pub fn mentions(&self, guid: &Guid) -> bool {
        self.merged_guids.contains(guid)
            || self.delete_locally.contains(guid)
            || self.delete_remotely.contains(guid)
            || self.delete_from_mirror.contains(guid)
    }

    /// Indicates if the merge accounted for every node and tombstone in the
    /// given tree.
    pub fn subsumes(&self, tree: &BookmarkTree) -> bool {
        tree.guids().all(|guid| self.mentions(guid))
    }

    /// Indicates if every node reachable from the merged root exists in one
    /// of `trees`, or is an unknown leaf.
    pub fn is_fully_rooted_in(&self, trees: &[&BookmarkTree]) -> bool {
        fn check(node: &MergedTreeNode<'_>, trees: &[&BookmarkTree]) -> bool {
            let known = node
                .sides()
                .next()
                .map_or(true, |_| {
                    trees
                        .iter()
                        .any(|tree| tree.node_for_guid(&node.guid).is_some())
                })
                || node.local_node.map_or(false, |n| n.kind() == NodeKind::Unknown)
                || node.remote_node.map_or(false, |n| n.kind() == NodeKind::Unknown);
            known && node.merged_children.iter().all(|child| check(child, trees))
        }
        // The merged GUID of a deduped pair only exists remotely, so check by
        // GUID, not by side.
        check(&self.root, trees)
    }

    /// Projects the merged tree onto a plain `BookmarkTree`, for comparisons
    /// in tests and logging.
    pub fn to_tree(&self) -> Result<BookmarkTree> {
        let mut items = Vec::new();
        let mut structure = Vec::new();
        fn accumulate(
            items: &mut Vec<ItemRow>,
            structure: &mut Vec<StructureRow>,
            node: &MergedTreeNode<'_>,
        ) {
            items.push(ItemRow::new(node.guid.clone(), node.kind()));
            for (position, child) in node.merged_children.iter().enumerate() {
                structure.push(StructureRow {
                    parent: node.guid.clone(),
                    child: child.guid.clone(),
                    position: position as i64,
                });
                accumulate(items, structure, child);
            }
        }
        accumulate(&mut items, &mut structure, &self.root);
        BookmarkTree::from_rows(items, structure)
    }

    /// Returns an ASCII art representation of the merged tree, for logging.
    pub fn to_ascii_string(&self) -> String {
        self.root.to_ascii_fragment("")
    }
}

/// Holds (matching remote dupes for local GUIDs, matching local dupes for
/// remote GUIDs).
type MatchingDupes<'t> = (HashMap<Guid, Node<'t>>, HashMap<Guid, Node<'t>>);

/// Content info for matching items with similar contents and different
/// GUIDs.
///
/// - Bookmarks and queries must have the same title and URL.
/// - Folders and livemarks must have the same title.
/// - Separators must have the same position within their parents.
#[derive(Debug, Eq, Hash, PartialEq)]
enum Content {
    Bookmark { title: String, url: String },
    Folder { title: String },
    Separator,
}

fn content_of(item: &Item) -> Option<Content> {
    Some(match item.kind {
        Kind::Bookmark | Kind::Query => Content::Bookmark {
            title: item.title.clone().unwrap_or_default(),
            url: item.url.clone().unwrap_or_default(),
        },
        Kind::Folder | Kind::Livemark => Content::Folder {
            title: item.title.clone().unwrap_or_default(),
        },
        Kind::Separator => Content::Separator,
        Kind::DynamicContainer => return None,
    })
}

/// A hash key used to match dupes by content. Separators are matched by
/// position, everything else by content alone.
#[derive(Debug, Eq, Hash, PartialEq)]
enum DupeKey {
    WithoutPosition(Content),
    WithPosition(Content, usize),
}

fn dupe_key_for(content: Content, position: usize) -> DupeKey {
    match content {
        Content::Separator => DupeKey::WithPosition(content, position),
        _ => DupeKey::WithoutPosition(content),
    }
}

/// A three-way merger that walks the local tree, the last-synced mirror, and
/// the staged incoming buffer in parallel, and produces a complete merged
/// tree with a value and structure decision for every node.
///
/// The mirror is the shared parent: a node that matches the mirror on one
/// side and diverges on the other merges cleanly, without guessing which
/// side the user meant. Only nodes changed on both sides are true conflicts,
/// and those resolve server-side by rule.
pub struct Merger<'t, D = DefaultDriver, G = AlwaysGreen> {
    driver: &'t D,
    signal: &'t G,
    local_tree: &'t BookmarkTree,
    mirror_tree: &'t BookmarkTree,
    remote_tree: &'t BookmarkTree,
    local_items: &'t dyn LocalItemSource,
    mirror_items: &'t dyn MirrorItemSource,
    buffer_items: &'t dyn BufferItemSource,
    matching_dupes_by_local_parent_guid: HashMap<Guid, MatchingDupes<'t>>,
    merged_guids: HashSet<Guid>,
    delete_locally: HashSet<Guid>,
    delete_remotely: HashSet<Guid>,
    delete_from_mirror: HashSet<Guid>,
    accept_local_deletion: HashSet<Guid>,
    accept_remote_deletion: HashSet<Guid>,
    structure_counts: StructureCounts,
}

impl<'t, D: Driver, G: GreenLight> Merger<'t, D, G> {
    /// Creates a merger over the three trees and their item sources.
    #[allow(clippy::too_many_arguments)]
    pub fn with_driver(
        driver: &'t D,
        signal: &'t G,
        local_tree: &'t BookmarkTree,
        mirror_tree: &'t BookmarkTree,
        remote_tree: &'t BookmarkTree,
        local_items: &'t dyn LocalItemSource,
        mirror_items: &'t dyn MirrorItemSource,
        buffer_items: &'t dyn BufferItemSource,
    ) -> Merger<'t, D, G> {
        Merger {
            driver,
            signal,
            local_tree,
            mirror_tree,
            remote_tree,
            local_items,
            mirror_items,
            buffer_items,
            matching_dupes_by_local_parent_guid: HashMap::new(),
            merged_guids: HashSet::new(),
            delete_locally: HashSet::new(),
            delete_remotely: HashSet::new(),
            delete_from_mirror: HashSet::new(),
            accept_local_deletion: HashSet::new(),
            accept_remote_deletion: HashSet::new(),
            structure_counts: StructureCounts::default(),
        }
    }

    /// Builds the merged tree. Consumes the merger.
    pub fn merge(mut self) -> Result<MergedTree<'t>> {
        let mut merged_root = MergedTreeNode::new(ROOT_GUID, ValueState::Unchanged);
        merged_root.local_node = self.local_tree.root();
        merged_root.mirror_node = self.mirror_tree.root();
        merged_root.remote_node = self.remote_tree.root();
        self.merged_guids.insert(ROOT_GUID);

        // The canonical roots always exist in the merged tree, in canonical
        // order, whatever the inputs say.
        for root_guid in &USER_CONTENT_ROOTS {
            self.signal.err_if_revoked()?;
            let merged_child = self.merge_content_root(root_guid)?;
            merged_root.merged_children.push(merged_child);
            self.structure_counts.merged_nodes += 1;
        }

        // Extra children of the root, and nodes whose parents never
        // materialized, all land under unfiled as a last resort. Remote
        // orphans first, then local, preserving discovery order within each.
        let mut orphans = Vec::new();
        for tree in &[self.remote_tree, self.local_tree, self.mirror_tree] {
            for guid in tree.orphans() {
                if !orphans.contains(guid) {
                    orphans.push(guid.clone());
                }
            }
            if let Some(root) = tree.root() {
                for child in root.children() {
                    if !child.guid().is_user_content_root() && !orphans.contains(child.guid()) {
                        orphans.push(child.guid().clone());
                    }
                }
            }
        }
        if !orphans.is_empty() {
            let unfiled = merged_root
                .merged_children
                .iter_mut()
                .find(|child| child.guid == UNFILED_GUID)
                .expect("Canonical roots are always merged");
            for guid in orphans {
                self.signal.err_if_revoked()?;
                if self.mentions(&guid) {
                    continue;
                }
                debug!(self.driver, "Reattaching orphan {} to unfiled", guid);
                let before = unfiled.merged_children.len();
                self.merge_child_into(unfiled, &guid)?;
                for child in &mut unfiled.merged_children[before..] {
                    self.flag_for_reupload(child)?;
                }
            }
        }

        // Any remaining tombstones on one side should be deleted on the
        // other side. This happens when the buffer has tombstones for items
        // that don't exist locally, or the local store has tombstones for
        // items that aren't on the server.
        let local_tombstones = self
            .local_tree
            .deletions()
            .cloned()
            .collect::<Vec<_>>();
        for guid in local_tombstones {
            self.signal.err_if_revoked()?;
            if !self.mentions(&guid) {
                if !self.remote_tree.is_deleted(&guid) {
                    self.accept_local_deletion.insert(guid.clone());
                    self.delete_remotely.insert(guid.clone());
                }
                self.delete_from_mirror.insert(guid);
            }
        }
        let remote_tombstones = self
            .remote_tree
            .deletions()
            .cloned()
            .collect::<Vec<_>>();
        for guid in remote_tombstones {
            self.signal.err_if_revoked()?;
            if !self.mentions(&guid) {
                self.accept_remote_deletion.insert(guid.clone());
                self.delete_locally.insert(guid.clone());
                self.delete_from_mirror.insert(guid);
            }
        }

        // The merged tree should know about all items mentioned in the local
        // tree and the buffer. Otherwise, it's incomplete, and we can't
        // apply it. This indicates a bug in the merger.
        for guid in self.local_tree.guids() {
            self.signal.err_if_revoked()?;
            if !self.mentions(guid) {
                return Err(ErrorKind::UnmergedLocalItems.into());
            }
        }
        for guid in self.remote_tree.guids() {
            self.signal.err_if_revoked()?;
            if !self.mentions(guid) {
                return Err(ErrorKind::UnmergedRemoteItems.into());
            }
        }

        Ok(MergedTree {
            root: merged_root,
            merged_guids: self.merged_guids,
            delete_locally: self.delete_locally,
            delete_remotely: self.delete_remotely,
            delete_from_mirror: self.delete_from_mirror,
            accept_local_deletion: self.accept_local_deletion,
            accept_remote_deletion: self.accept_remote_deletion,
            counts: self.structure_counts,
        })
    }

    #[inline]
    fn mentions(&self, guid: &Guid) -> bool {
        self.merged_guids.contains(guid)
            || self.delete_locally.contains(guid)
            || self.delete_remotely.contains(guid)
            || self.delete_from_mirror.contains(guid)
    }

    /// Merges one of the four canonical roots. Roots are never deleted,
    /// deduped, or moved; only their values and children merge.
    fn merge_content_root(&mut self, guid: &Guid) -> Result<MergedTreeNode<'t>> {
        let local_node = self.local_tree.node_for_guid(guid);
        let mirror_node = self.mirror_tree.node_for_guid(guid);
        let remote_node = self.remote_tree.node_for_guid(guid);
        self.merge_node(guid.clone(), local_node, mirror_node, remote_node)
    }

    /// Merges a node that exists on at least one side, resolving its value
    /// state and walking its children.
    fn merge_node(
        &mut self,
        guid: Guid,
        local_node: Option<Node<'t>>,
        mirror_node: Option<Node<'t>>,
        remote_node: Option<Node<'t>>,
    ) -> Result<MergedTreeNode<'t>> {
        trace!(
            self.driver,
            "Merging {} (local: {}, mirror: {}, remote: {})",
            guid,
            local_node.is_some(),
            mirror_node.is_some(),
            remote_node.is_some()
        );
        self.merged_guids.insert(guid.clone());
        if let Some(local_node) = local_node {
            // For deduped items, the local GUID differs from the merged one.
            self.merged_guids.insert(local_node.guid().clone());
        }

        if let (Some(local_node), Some(remote_node)) = (local_node, remote_node) {
            if let (NodeKind::NonFolder(local_kind), NodeKind::NonFolder(remote_kind)) =
                (local_node.kind(), remote_node.kind())
            {
                let compatible = match (local_kind, remote_kind) {
                    (Kind::Bookmark, Kind::Query) | (Kind::Query, Kind::Bookmark) => true,
                    (this, that) => this == that,
                };
                if !compatible {
                    error!(
                        self.driver,
                        "Merging local {} and remote {} with different kinds",
                        local_node.guid(),
                        remote_node.guid()
                    );
                    return Err(ErrorKind::MismatchedItemKind(local_kind, remote_kind).into());
                }
            }
        }

        let value_state = self.resolve_value_state(&guid, local_node, mirror_node, remote_node)?;
        let mut merged_node = MergedTreeNode::new(guid, value_state);
        merged_node.local_node = local_node;
        merged_node.mirror_node = mirror_node;
        merged_node.remote_node = remote_node;

        let is_folder = merged_node.is_folder();
        if is_folder {
            let local_list = child_guid_list(local_node);
            let mirror_list = child_guid_list(mirror_node);
            let remote_list = child_guid_list(remote_node);

            let local_changed = local_node.is_some() && local_list != mirror_list;
            let remote_changed = remote_node.is_some() && remote_list != mirror_list;

            let target = match (local_changed, remote_changed) {
                (false, false) => {
                    // All present sides agree with the mirror; walk whichever
                    // list exists.
                    if mirror_node.is_some() {
                        mirror_list.clone()
                    } else if remote_node.is_some() {
                        remote_list.clone()
                    } else {
                        local_list.clone()
                    }
                }
                (true, false) => concat_distinct(&local_list, &remote_list),
                (false, true) => concat_distinct(&remote_list, &local_list),
                (true, true) => {
                    trace!(
                        self.driver,
                        "Children of {} changed on both sides; interleaving",
                        merged_node.guid
                    );
                    merge_child_lists(&local_list, &remote_list)
                }
            };

            for child_guid in &target {
                self.signal.err_if_revoked()?;
                self.merge_child_into(&mut merged_node, child_guid)?;
            }

            // Also visit mirror children both sides dropped without a
            // tombstone; they either merged from a new parent already, or
            // need their own deletion handling.
            for child_guid in &mirror_list {
                if !target.contains(child_guid) {
                    self.signal.err_if_revoked()?;
                    self.merge_child_into(&mut merged_node, child_guid)?;
                }
            }

            let final_list = merged_node.merged_child_guids();
            merged_node.structure_state = if (mirror_node.is_some()
                || (local_node.is_none() && remote_node.is_none()))
                && final_list == mirror_list
                && (local_node.is_none() || local_list == mirror_list)
                && (remote_node.is_none() || remote_list == mirror_list)
            {
                StructureState::Unchanged
            } else if remote_node.is_some() && final_list == remote_list {
                StructureState::Remote
            } else if local_node.is_some() && final_list == local_list {
                StructureState::Local
            } else {
                StructureState::New
            };
        }

        Ok(merged_node)
    }

    /// Resolves which side's value record wins for a node.
    fn resolve_value_state(
        &mut self,
        guid: &Guid,
        local_node: Option<Node<'t>>,
        mirror_node: Option<Node<'t>>,
        remote_node: Option<Node<'t>>,
    ) -> Result<ValueState> {
        if guid.is_root() {
            // The root's record is synthetic; nothing to win.
            return Ok(ValueState::Unchanged);
        }
        let local_changed = local_node.map_or(false, |node| {
            mirror_node.is_none() || self.local_tree.is_modified(node.guid())
        });
        let remote_changed = remote_node.map_or(false, |node| {
            mirror_node.is_none() || self.remote_tree.is_modified(node.guid())
        });
        Ok(match (local_changed, remote_changed) {
            (false, false) => ValueState::Unchanged,
            (true, false) => ValueState::Local,
            (false, true) => ValueState::Remote,
            (true, true) => {
                let local_guid = local_node.map_or(guid, |node| node.guid());
                let local_item = self.local_items.fetch(local_guid)?;
                let remote_item = self.buffer_items.fetch(guid)?;
                match (local_item, remote_item) {
                    (Some(local_item), Some(remote_item)) => {
                        if local_item.same_as(&remote_item) {
                            trace!(
                                self.driver,
                                "Both sides changed {} identically; no-op conflict",
                                guid
                            );
                        } else {
                            warn!(
                                self.driver,
                                "Both sides changed {}; taking remote (ties included)", guid
                            );
                        }
                        ValueState::Remote
                    }
                    _ => {
                        // One record didn't resolve; degrade rather than
                        // abort, and let the server copy stand.
                        warn!(
                            self.driver,
                            "Missing value record for doubly-changed {}; taking remote", guid
                        );
                        ValueState::Remote
                    }
                }
            }
        })
    }

    /// Merges the child with the given GUID into a merged folder, handling
    /// deletions on either side, moves, and duplicates. A child that
    /// belongs under a different merged parent, or was already merged there,
    /// is skipped; the folder's final structure state accounts for it.
    fn merge_child_into(
        &mut self,
        merged_node: &mut MergedTreeNode<'t>,
        child_guid: &Guid,
    ) -> Result<()> {
        if self.merged_guids.contains(child_guid) {
            trace!(
                self.driver,
                "Child {} already merged into another folder",
                child_guid
            );
            return Ok(());
        }

        let local_node = self.local_tree.node_for_guid(child_guid);
        let mirror_node = self.mirror_tree.node_for_guid(child_guid);
        let remote_node = self.remote_tree.node_for_guid(child_guid);

        if !child_guid.is_built_in_root() {
            let locally_deleted = self.local_tree.is_deleted(child_guid);
            let remotely_deleted = self.remote_tree.is_deleted(child_guid);
            match (locally_deleted, remotely_deleted) {
                (true, true) => {
                    trace!(self.driver, "Child {} deleted on both sides", child_guid);
                    self.delete_from_mirror.insert(child_guid.clone());
                    return Ok(());
                }
                (true, false) => {
                    return self.check_local_deletion(merged_node, child_guid, remote_node);
                }
                (false, true) => {
                    return self.check_remote_deletion(merged_node, child_guid, local_node);
                }
                (false, false) => {}
            }
        }

        if !self.child_belongs_here(merged_node, child_guid, local_node, remote_node) {
            trace!(
                self.driver,
                "Child {} belongs under a different merged parent",
                child_guid
            );
            return Ok(());
        }

        // A child known on one side only might be a duplicate of a
        // differently-identified item on the other. Flagged duplicates
        // collapse to the remote GUID; everything else keeps its own.
        if local_node.is_none() && mirror_node.is_none() {
            if let Some(remote_child_node) = remote_node {
                if let Some(local_dupe_node) =
                    self.find_local_dupe_of_remote_node(merged_node, remote_child_node)?
                {
                    return self.merge_dupe_pair(merged_node, local_dupe_node, remote_child_node);
                }
            }
        }
        if remote_node.is_none() && mirror_node.is_none() {
            if let Some(local_child_node) = local_node {
                if let Some(remote_dupe_node) =
                    self.find_remote_dupe_of_local_node(merged_node, local_child_node)?
                {
                    return self.merge_dupe_pair(merged_node, local_child_node, remote_dupe_node);
                }
            }
        }

        let merged_child =
            self.merge_node(child_guid.clone(), local_node, mirror_node, remote_node)?;
        merged_node.merged_children.push(merged_child);
        self.structure_counts.merged_nodes += 1;
        Ok(())
    }

    /// Merges a matched (local, remote) duplicate pair under the remote
    /// GUID. The local GUID is removed locally and, defensively, tombstoned
    /// on the server; it was never uploaded, but another device might know
    /// it.
    fn merge_dupe_pair(
        &mut self,
        merged_node: &mut MergedTreeNode<'t>,
        local_node: Node<'t>,
        remote_node: Node<'t>,
    ) -> Result<()> {
        debug!(
            self.driver,
            "Deduping local {} to remote {}",
            local_node.guid(),
            remote_node.guid()
        );
        self.structure_counts.dupes += 1;
        self.delete_locally.insert(local_node.guid().clone());
        self.delete_remotely.insert(local_node.guid().clone());
        let merged_child = self.merge_node(
            remote_node.guid().clone(),
            Some(local_node),
            None,
            Some(remote_node),
        )?;
        merged_node.merged_children.push(merged_child);
        self.structure_counts.merged_nodes += 1;
        Ok(())
    }

    /// Decides where a child that exists on multiple sides ends up: under
    /// the side that moved it, or under the incoming parent when both sides
    /// moved it apart.
    fn child_belongs_here(
        &self,
        merged_node: &MergedTreeNode<'t>,
        child_guid: &Guid,
        local_node: Option<Node<'t>>,
        remote_node: Option<Node<'t>>,
    ) -> bool {
        if child_guid.is_user_content_root() {
            return merged_node.guid.is_root();
        }
        let local_parent = local_node.and_then(|_| self.local_tree.parent_guid_of(child_guid));
        let remote_parent = remote_node.and_then(|_| self.remote_tree.parent_guid_of(child_guid));
        let mirror_parent = self.mirror_tree.parent_guid_of(child_guid);
        let winner = match (local_parent, remote_parent) {
            (Some(local_parent), Some(remote_parent)) => {
                if local_parent == remote_parent {
                    Some(local_parent)
                } else {
                    let local_moved = mirror_parent.map_or(true, |p| p != local_parent);
                    let remote_moved = mirror_parent.map_or(true, |p| p != remote_parent);
                    match (local_moved, remote_moved) {
                        (true, false) => Some(local_parent),
                        (false, true) => Some(remote_parent),
                        _ => {
                            trace!(
                                self.driver,
                                "Child {} moved to {} locally and {} remotely; remote wins",
                                child_guid,
                                local_parent,
                                remote_parent
                            );
                            Some(remote_parent)
                        }
                    }
                }
            }
            (Some(local_parent), None) => Some(local_parent),
            (None, Some(remote_parent)) => Some(remote_parent),
            (None, None) => mirror_parent,
        };
        match winner {
            Some(parent_guid) if parent_guid == &merged_node.guid => true,
            // If the winning parent is itself dead, the child is being
            // relocated; it hangs here, under the nearest survivor.
            Some(parent_guid) => !self.parent_is_alive(parent_guid),
            None => true,
        }
    }

    /// Indicates if a folder can still receive children: it isn't tombstoned
    /// on either side, and hasn't lost a deletion conflict this merge.
    fn parent_is_alive(&self, guid: &Guid) -> bool {
        !(self.local_tree.is_deleted(guid)
            || self.remote_tree.is_deleted(guid)
            || self.delete_locally.contains(guid)
            || self.delete_remotely.contains(guid)
            || self.delete_from_mirror.contains(guid))
    }

    /// Handles a child deleted locally and live remotely: a changed
    /// non-folder revives, a folder stays deleted and its live descendants
    /// climb to the nearest surviving merged ancestor.
    fn check_local_deletion(
        &mut self,
        merged_node: &mut MergedTreeNode<'t>,
        child_guid: &Guid,
        remote_node: Option<Node<'t>>,
    ) -> Result<()> {
        if let Some(remote_node) = remote_node {
            let remotely_changed = self.remote_tree.is_modified(child_guid);
            if remotely_changed && !remote_node.is_folder() {
                trace!(
                    self.driver,
                    "Remote non-folder {} deleted locally and changed remotely; \
                     taking remote change",
                    child_guid
                );
                self.structure_counts.remote_revives += 1;
                let merged_child =
                    self.merge_node(child_guid.clone(), None, None, Some(remote_node))?;
                merged_node.merged_children.push(merged_child);
                self.structure_counts.merged_nodes += 1;
                return Ok(());
            }
            if remotely_changed {
                trace!(
                    self.driver,
                    "Remote folder {} deleted locally and changed remotely; \
                     taking local deletion",
                    child_guid
                );
                self.structure_counts.local_deletes += 1;
            }
            self.accept_local_deletion.insert(child_guid.clone());
            self.delete_remotely.insert(child_guid.clone());
            self.delete_from_mirror.insert(child_guid.clone());
            let relocated = remote_node
                .children()
                .map(|child| child.guid().clone())
                .collect::<Vec<_>>();
            self.relocate_into(merged_node, relocated)
        } else {
            // Deleted locally, and not in the buffer at all.
            self.accept_local_deletion.insert(child_guid.clone());
            self.delete_remotely.insert(child_guid.clone());
            self.delete_from_mirror.insert(child_guid.clone());
            if let Some(mirror_node) = self.mirror_tree.node_for_guid(child_guid) {
                let relocated = mirror_node
                    .children()
                    .map(|child| child.guid().clone())
                    .collect::<Vec<_>>();
                self.relocate_into(merged_node, relocated)?;
            }
            Ok(())
        }
    }

    /// The inverse of `check_local_deletion`: a child deleted remotely and
    /// live locally.
    fn check_remote_deletion(
        &mut self,
        merged_node: &mut MergedTreeNode<'t>,
        child_guid: &Guid,
        local_node: Option<Node<'t>>,
    ) -> Result<()> {
        if let Some(local_node) = local_node {
            let locally_changed = self.local_tree.is_modified(child_guid);
            if locally_changed && !local_node.is_folder() {
                trace!(
                    self.driver,
                    "Local non-folder {} deleted remotely and changed locally; \
                     taking local change",
                    child_guid
                );
                self.structure_counts.local_revives += 1;
                let merged_child =
                    self.merge_node(child_guid.clone(), Some(local_node), None, None)?;
                merged_node.merged_children.push(merged_child);
                self.structure_counts.merged_nodes += 1;
                return Ok(());
            }
            if locally_changed {
                trace!(
                    self.driver,
                    "Local folder {} deleted remotely and changed locally; \
                     taking remote deletion",
                    child_guid
                );
                self.structure_counts.remote_deletes += 1;
            }
            self.accept_remote_deletion.insert(child_guid.clone());
            self.delete_locally.insert(child_guid.clone());
            self.delete_from_mirror.insert(child_guid.clone());
            let relocated = local_node
                .children()
                .map(|child| child.guid().clone())
                .collect::<Vec<_>>();
            self.relocate_into(merged_node, relocated)
        } else {
            self.accept_remote_deletion.insert(child_guid.clone());
            self.delete_locally.insert(child_guid.clone());
            self.delete_from_mirror.insert(child_guid.clone());
            if let Some(mirror_node) = self.mirror_tree.node_for_guid(child_guid) {
                let relocated = mirror_node
                    .children()
                    .map(|child| child.guid().clone())
                    .collect::<Vec<_>>();
                self.relocate_into(merged_node, relocated)?;
            }
            Ok(())
        }
    }

    /// Merges the children of a deleted folder into `merged_node`, which is
    /// their lowest surviving ancestor: the walk that got here skipped every
    /// deleted folder in between, so relocation climbs exactly as far as it
    /// must, bottoming out at a canonical root. Relocated children are
    /// flagged for reupload with their rewritten parent.
    fn relocate_into(
        &mut self,
        merged_node: &mut MergedTreeNode<'t>,
        child_guids: Vec<Guid>,
    ) -> Result<()> {
        for child_guid in child_guids {
            self.signal.err_if_revoked()?;
            trace!(
                self.driver,
                "Relocating {} to surviving ancestor {}",
                child_guid,
                merged_node.guid
            );
            let before = merged_node.merged_children.len();
            self.merge_child_into(merged_node, &child_guid)?;
            for child in &mut merged_node.merged_children[before..] {
                self.flag_for_reupload(child)?;
            }
        }
        Ok(())
    }

    /// Upgrades a relocated or reattached node's value state so that its
    /// record, with the dead parent rewritten, goes back to the server.
    fn flag_for_reupload(&mut self, merged_node: &mut MergedTreeNode<'t>) -> Result<()> {
        match merged_node.value_state {
            ValueState::Local | ValueState::New(_) => Ok(()),
            ValueState::Unchanged | ValueState::Remote => {
                let item = self.resolve_item(merged_node)?;
                match item {
                    Some(item) => {
                        merged_node.value_state = ValueState::New(Box::new(item));
                    }
                    None => {
                        // An unknown leaf we can't resolve; leave its state
                        // alone and let the next pass pick it up.
                        warn!(
                            self.driver,
                            "Can't resolve {} for reupload in any source", merged_node.guid
                        );
                    }
                }
                Ok(())
            }
        }
    }

    /// Fetches the value record behind a merged node, trying the buffer,
    /// then the local store, then the mirror.
    fn resolve_item(&self, merged_node: &MergedTreeNode<'t>) -> Result<Option<Item>> {
        if merged_node.remote_node.is_some() {
            if let Some(item) = self.buffer_items.fetch(&merged_node.guid)? {
                return Ok(Some(item));
            }
        }
        if let Some(local_node) = merged_node.local_node {
            if let Some(item) = self.local_items.fetch(local_node.guid())? {
                return Ok(Some(item));
            }
        }
        self.mirror_items.fetch(&merged_node.guid)
    }

    /// Finds a local child of the merged folder that duplicates the content
    /// of a flagged incoming child with a different GUID.
    fn find_local_dupe_of_remote_node(
        &mut self,
        merged_node: &MergedTreeNode<'t>,
        remote_child_node: Node<'t>,
    ) -> Result<Option<Node<'t>>> {
        let (local_parent_node, remote_parent_node) =
            match (merged_node.local_node, merged_node.remote_node) {
                (Some(local), Some(remote)) => (local, remote),
                _ => return Ok(None),
            };
        let dupes = self.matching_dupes_for(local_parent_node, remote_parent_node)?;
        Ok(dupes.1.get(remote_child_node.guid()).copied())
    }

    /// The inverse of `find_local_dupe_of_remote_node`.
    fn find_remote_dupe_of_local_node(
        &mut self,
        merged_node: &MergedTreeNode<'t>,
        local_child_node: Node<'t>,
    ) -> Result<Option<Node<'t>>> {
        let (local_parent_node, remote_parent_node) =
            match (merged_node.local_node, merged_node.remote_node) {
                (Some(local), Some(remote)) => (local, remote),
                _ => return Ok(None),
            };
        let dupes = self.matching_dupes_for(local_parent_node, remote_parent_node)?;
        Ok(dupes.0.get(local_child_node.guid()).copied())
    }

    fn matching_dupes_for(
        &mut self,
        local_parent_node: Node<'t>,
        remote_parent_node: Node<'t>,
    ) -> Result<&MatchingDupes<'t>> {
        if !self
            .matching_dupes_by_local_parent_guid
            .contains_key(local_parent_node.guid())
        {
            trace!(
                self.driver,
                "Finding all matching dupes in local {} and remote {}",
                local_parent_node.guid(),
                remote_parent_node.guid()
            );
            let dupes =
                self.find_all_matching_dupes_in_folders(local_parent_node, remote_parent_node)?;
            self.matching_dupes_by_local_parent_guid
                .insert(local_parent_node.guid().clone(), dupes);
        }
        Ok(&self.matching_dupes_by_local_parent_guid[local_parent_node.guid()])
    }

    /// Finds all children of a local folder with the same content as
    /// children of the corresponding remote folder. Only new local items
    /// (not in the mirror or the buffer) match, and only against incoming
    /// items flagged `hasDupe` that don't exist locally. Matching is
    /// first-come in canonical child order on both sides, so several
    /// identical incoming folders never collapse together: each match
    /// consumes its local candidate.
    ///
    /// Finding all possible dupes is O(m + n) in the worst case, where `m`
    /// is the number of local children, and `n` is the number of remote
    /// children. We cache matches per folder, so deduping all remaining
    /// children of the same folder, on both sides, only needs two O(1) map
    /// lookups per child.
    fn find_all_matching_dupes_in_folders(
        &self,
        local_parent_node: Node<'t>,
        remote_parent_node: Node<'t>,
    ) -> Result<MatchingDupes<'t>> {
        let local_candidates = local_parent_node
            .children()
            .enumerate()
            .filter(|(_, node)| {
                !node.guid().is_built_in_root()
                    && !self.remote_tree.mentions(node.guid())
                    && !self.mirror_tree.mentions(node.guid())
                    && self.local_tree.is_modified(node.guid())
            })
            .collect::<Vec<_>>();
        if local_candidates.is_empty() {
            return Ok((HashMap::new(), HashMap::new()));
        }
        let candidate_guids = local_candidates
            .iter()
            .map(|(_, node)| node.guid().clone())
            .collect::<Vec<_>>();
        self.local_items.prefetch(&candidate_guids)?;
        let local_items_by_guid = self.local_items.fetch_batch(&candidate_guids)?;

        let mut local_nodes_by_dupe_key: HashMap<DupeKey, Vec<Node<'t>>> = HashMap::new();
        for (local_position, local_child_node) in local_candidates {
            self.signal.err_if_revoked()?;
            let local_child_item = match local_items_by_guid.get(local_child_node.guid()) {
                Some(item) => item,
                None => {
                    trace!(
                        self.driver,
                        "Not deduping local child {} without value record",
                        local_child_node.guid()
                    );
                    continue;
                }
            };
            if let Some(content) = content_of(local_child_item) {
                // Deduped in FIFO order, in case multiple children share a
                // key; for example, a toolbar containing several identical
                // empty folders.
                local_nodes_by_dupe_key
                    .entry(dupe_key_for(content, local_position))
                    .or_default()
                    .push(local_child_node);
            }
        }

        let remote_candidate_guids = remote_parent_node
            .children()
            .filter(|node| {
                !node.guid().is_built_in_root()
                    && !self.local_tree.mentions(node.guid())
                    && !self.mirror_tree.mentions(node.guid())
            })
            .map(|node| node.guid().clone())
            .collect::<Vec<_>>();
        self.buffer_items.prefetch(&remote_candidate_guids)?;
        let remote_items_by_guid = self.buffer_items.fetch_batch(&remote_candidate_guids)?;

        let mut local_to_remote = HashMap::new();
        let mut remote_to_local = HashMap::new();
        for (remote_position, remote_child_node) in remote_parent_node.children().enumerate() {
            self.signal.err_if_revoked()?;
            let remote_child_item = match remote_items_by_guid.get(remote_child_node.guid()) {
                Some(item) => item,
                None => continue,
            };
            if !remote_child_item.has_dupe {
                trace!(
                    self.driver,
                    "Not deduping remote child {}; not flagged as a dupe",
                    remote_child_node.guid()
                );
                continue;
            }
            if let Some(content) = content_of(remote_child_item) {
                let key = dupe_key_for(content, remote_position);
                if let Some(local_nodes) = local_nodes_by_dupe_key.get_mut(&key) {
                    if !local_nodes.is_empty() {
                        let local_child_node = local_nodes.remove(0);
                        trace!(
                            self.driver,
                            "Deduping local child {} to remote child {}",
                            local_child_node.guid(),
                            remote_child_node.guid()
                        );
                        local_to_remote
                            .insert(local_child_node.guid().clone(), remote_child_node);
                        remote_to_local
                            .insert(remote_child_node.guid().clone(), local_child_node);
                    }
                }
            }
        }

        Ok((local_to_remote, remote_to_local))
    }
}

fn child_guid_list(node: Option<Node<'_>>) -> Vec<Guid> {
    node.map_or_else(Vec::new, |node| {
        node.children().map(|child| child.guid().clone()).collect()
    })
}

/// Appends the items of `extras` that aren't in `base` to `base`.
fn concat_distinct(base: &[Guid], extras: &[Guid]) -> Vec<Guid> {
    let mut target = base.to_vec();
    for guid in extras {
        if !base.contains(guid) {
            target.push(guid.clone());
        }
    }
    target
}

/// Interleaves two child lists that both diverged from the mirror,
/// producing an order consistent with both wherever their constraints
/// agree. Additions unordered between the sides go remote-first; pairs the
/// sides order differently follow the remote order.
fn merge_child_lists(local_list: &[Guid], remote_list: &[Guid]) -> Vec<Guid> {
    let local_positions = local_list
        .iter()
        .enumerate()
        .map(|(position, guid)| (guid.clone(), position))
        .collect::<HashMap<_, _>>();
    let remote_positions = remote_list
        .iter()
        .enumerate()
        .map(|(position, guid)| (guid.clone(), position))
        .collect::<HashMap<_, _>>();

    let mut target = Vec::with_capacity(local_list.len().max(remote_list.len()));
    let mut placed = HashSet::new();
    let mut local_index = 0;
    let mut remote_index = 0;
    while local_index < local_list.len() || remote_index < remote_list.len() {
        while local_index < local_list.len() && placed.contains(&local_list[local_index]) {
            local_index += 1;
        }
        while remote_index < remote_list.len() && placed.contains(&remote_list[remote_index]) {
            remote_index += 1;
        }
        let next = match (local_list.get(local_index), remote_list.get(remote_index)) {
            (Some(local_guid), Some(remote_guid)) => {
                if local_guid == remote_guid {
                    local_guid
                } else if !local_positions.contains_key(remote_guid) {
                    // A remote-only addition slots in ahead of unordered
                    // local ones.
                    remote_guid
                } else if !remote_positions.contains_key(local_guid) {
                    local_guid
                } else {
                    // Both lists have both items, in opposite orders.
                    remote_guid
                }
            }
            (Some(local_guid), None) => local_guid,
            (None, Some(remote_guid)) => remote_guid,
            (None, None) => break,
        };
        placed.insert(next.clone());
        target.push(next.clone());
    }
    target
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guids(names: &[&str]) -> Vec<Guid> {
        names.iter().map(|&name| Guid::from(name)).collect()
    }

    #[test]
    fn interleaves_consistent_orders() {
        // Local inserts X between A and B; remote leaves them alone.
        let merged = merge_child_lists(
            &guids(&["bookmarkAAAA", "bookmarkXXXX", "bookmarkBBBB"]),
            &guids(&["bookmarkAAAA", "bookmarkBBBB"]),
        );
        assert_eq!(merged, guids(&["bookmarkAAAA", "bookmarkXXXX", "bookmarkBBBB"]));
    }

    #[test]
    fn remote_wins_conflicting_pairs() {
        let merged = merge_child_lists(
            &guids(&["bookmarkAAAA", "bookmarkBBBB"]),
            &guids(&["bookmarkBBBB", "bookmarkAAAA"]),
        );
        assert_eq!(merged, guids(&["bookmarkBBBB", "bookmarkAAAA"]));
    }

    #[test]
    fn unordered_additions_go_remote_first() {
        let merged = merge_child_lists(
            &guids(&["bookmarkAAAA", "bookmarkLLLL"]),
            &guids(&["bookmarkAAAA", "bookmarkRRRR"]),
        );
        assert_eq!(
            merged,
            guids(&["bookmarkAAAA", "bookmarkRRRR", "bookmarkLLLL"])
        );
    }
}
