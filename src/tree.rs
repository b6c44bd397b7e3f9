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

use smallbitvec::SmallBitVec;

use crate::error::{ErrorKind, Result, TreeProblem};
use crate::guid::{Guid, ROOT_GUID, USER_CONTENT_ROOTS};
use crate::record::Kind;

/// The type for entry indices in the tree.
type Index = usize;

/// A distilled value row, as the tree builder consumes it. The richer row
/// types in `storage` project down to this.
#[derive(Clone, Debug)]
pub struct ItemRow {
    pub guid: Guid,
    pub kind: Kind,
    /// Tombstone rows mark deletions and never become nodes.
    pub deleted: bool,
    /// Rows whose status column marks them changed since the last snapshot.
    pub modified: bool,
}

impl ItemRow {
    pub fn new(guid: Guid, kind: Kind) -> ItemRow {
        ItemRow {
            guid,
            kind,
            deleted: false,
            modified: false,
        }
    }
}

/// One parent-child association, with the child's position in the parent.
#[derive(Clone, Debug)]
pub struct StructureRow {
    pub parent: Guid,
    pub child: Guid,
    pub position: i64,
}

/// What a tree knows about one node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// A folder; the only kind that owns children.
    Folder,
    /// A value-typed leaf.
    NonFolder(Kind),
    /// Referenced by a parent's structure, but not materialized: the value
    /// record lives behind an item source. Always a leaf.
    Unknown,
}

impl NodeKind {
    #[inline]
    pub fn is_folder(self) -> bool {
        self == NodeKind::Folder
    }
}

/// A complete bookmark tree with tombstones and change flags.
///
/// The tree stores nodes in a vector, and uses indices in the vector to
/// identify parents and children. This makes traversal and lookup very
/// efficient: retrieving a node's parent takes one indexing operation,
/// retrieving children takes one indexing operation per child, and
/// retrieving a node by random GUID takes one hash map lookup and one
/// indexing operation.
#[derive(Debug)]
pub struct BookmarkTree {
    entries: Vec<TreeEntry>,
    index_by_guid: HashMap<Guid, Index>,
    subtree_indices: Vec<Index>,
    orphan_guids: Vec<Guid>,
    deleted_guids: HashSet<Guid>,
    modified_guids: HashSet<Guid>,
}

/// An entry wraps a node with references to its parent and children, which
/// index into the tree's `entries` vector. This indirection exists because
/// Rust is more strict about ownership of parents and children: we can't
/// have entries own their children without sacrificing fast random lookup,
/// and we never embed back-pointers. Identity is by GUID.
#[derive(Debug)]
struct TreeEntry {
    guid: Guid,
    kind: NodeKind,
    parent_index: Option<Index>,
    child_indices: Vec<Index>,
}

impl BookmarkTree {
    /// Returns a tree with zero subtrees.
    pub fn empty() -> BookmarkTree {
        BookmarkTree {
            entries: Vec::new(),
            index_by_guid: HashMap::new(),
            subtree_indices: Vec::new(),
            orphan_guids: Vec::new(),
            deleted_guids: HashSet::new(),
            modified_guids: HashSet::new(),
        }
    }

    /// Returns the synthetic first-sync mirror: the Places root with the four
    /// user content roots as empty folders, and nothing else.
    pub fn empty_mirror() -> BookmarkTree {
        let mut items = vec![ItemRow::new(ROOT_GUID, Kind::Folder)];
        let mut structure = Vec::with_capacity(USER_CONTENT_ROOTS.len());
        for (position, guid) in USER_CONTENT_ROOTS.iter().enumerate() {
            items.push(ItemRow::new(guid.clone(), Kind::Folder));
            structure.push(StructureRow {
                parent: ROOT_GUID,
                child: guid.clone(),
                position: position as i64,
            });
        }
        BookmarkTree::from_rows(items, structure)
            .expect("Synthetic mirror skeleton must be well-formed")
    }

    /// Builds a tree from value rows and structure rows, rejecting structure
    /// that cycles, lists a child under two parents, or references a
    /// non-folder as a parent. Children referenced by a folder but missing
    /// from the value rows become unknown leaves; children whose parent is
    /// missing are recorded as orphans.
    pub fn from_rows(
        items: Vec<ItemRow>,
        mut structure: Vec<StructureRow>,
    ) -> Result<BookmarkTree> {
        let mut tree = BookmarkTree::empty();

        for row in items {
            if row.deleted {
                tree.deleted_guids.insert(row.guid.clone());
                if row.modified {
                    tree.modified_guids.insert(row.guid);
                }
                continue;
            }
            if tree.index_by_guid.contains_key(&row.guid) {
                // A value row for a GUID we've already seen wins over a
                // lazily-created unknown leaf; anything else is the storage
                // layer's bug, and the kind stays first-writer-wins.
                let index = tree.index_by_guid[&row.guid];
                if tree.entries[index].kind == NodeKind::Unknown {
                    tree.entries[index].kind = kind_for(row.kind);
                }
            } else {
                tree.push_entry(row.guid.clone(), kind_for(row.kind));
            }
            if row.modified {
                tree.modified_guids.insert(row.guid);
            }
        }

        structure.sort_by(|a, b| (&a.parent, a.position).cmp(&(&b.parent, b.position)));
        for row in structure {
            if tree.deleted_guids.contains(&row.child) {
                // A tombstone can't be anyone's child (I3); skip the stale
                // association.
                continue;
            }
            let child_index = match tree.index_by_guid.get(&row.child) {
                Some(&index) => index,
                None => tree.push_entry(row.child.clone(), NodeKind::Unknown),
            };
            let parent_index = match tree.index_by_guid.get(&row.parent) {
                Some(&index) => index,
                None => {
                    // Present in structure, unreachable from a root. The
                    // merger reattaches these under unfiled.
                    tree.note_orphan(row.child);
                    continue;
                }
            };
            match tree.entries[parent_index].kind {
                NodeKind::Folder => {}
                NodeKind::Unknown => {
                    // The parent is referenced, but has no value row of its
                    // own, so the child hangs in the air just the same.
                    tree.note_orphan(row.child);
                    continue;
                }
                NodeKind::NonFolder(_) => {
                    return Err(ErrorKind::MalformedTree(TreeProblem::NonFolderParent {
                        parent: row.parent,
                        child: row.child,
                    })
                    .into());
                }
            }
            if let Some(first_parent_index) = tree.entries[child_index].parent_index {
                return Err(ErrorKind::MalformedTree(TreeProblem::DuplicateParentage {
                    child: row.child,
                    first_parent: tree.entries[first_parent_index].guid.clone(),
                    second_parent: row.parent,
                })
                .into());
            }
            tree.entries[child_index].parent_index = Some(parent_index);
            tree.entries[parent_index].child_indices.push(child_index);
        }

        if let Some(index) = detect_cycles(&tree.entries) {
            return Err(
                ErrorKind::MalformedTree(TreeProblem::Cycle(tree.entries[index].guid.clone()))
                    .into(),
            );
        }

        tree.subtree_indices = tree
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| entry.parent_index.is_none().then(|| index))
            .collect();

        // Parentless non-root nodes are orphans too, even without a structure
        // row to say so.
        for &index in &tree.subtree_indices.clone() {
            let guid = tree.entries[index].guid.clone();
            if guid != ROOT_GUID && !tree.orphan_guids.contains(&guid) {
                tree.note_orphan(guid);
            }
        }

        Ok(tree)
    }

    fn push_entry(&mut self, guid: Guid, kind: NodeKind) -> Index {
        let index = self.entries.len();
        self.index_by_guid.insert(guid.clone(), index);
        self.entries.push(TreeEntry {
            guid,
            kind,
            parent_index: None,
            child_indices: Vec::new(),
        });
        index
    }

    fn note_orphan(&mut self, guid: Guid) {
        if !self.orphan_guids.contains(&guid) {
            self.orphan_guids.push(guid);
        }
    }

    /// Returns the node for the canonical root, if this tree has one.
    pub fn root(&self) -> Option<Node<'_>> {
        self.node_for_guid(&ROOT_GUID)
    }

    /// Returns the top-level nodes, in row order. A well-formed tree has
    /// exactly one, rooted at the canonical root.
    pub fn subtrees(&self) -> impl Iterator<Item = Node<'_>> {
        self.subtree_indices
            .iter()
            .map(move |&index| Node(self, &self.entries[index]))
    }

    /// Returns the node for a given `guid`, or `None` if a node with the
    /// `guid` doesn't exist in the tree, or was deleted.
    pub fn node_for_guid(&self, guid: &Guid) -> Option<Node<'_>> {
        self.index_by_guid
            .get(guid)
            .map(|&index| Node(self, &self.entries[index]))
    }

    /// Returns the parent GUID recorded for `guid`, if any.
    pub fn parent_guid_of(&self, guid: &Guid) -> Option<&Guid> {
        let &index = self.index_by_guid.get(guid)?;
        self.entries[index]
            .parent_index
            .map(|parent_index| &self.entries[parent_index].guid)
    }

    /// Indicates if the GUID is known to be deleted. If `node_for_guid`
    /// returns `None` and `is_deleted` returns `false`, the item doesn't
    /// exist in the tree at all.
    #[inline]
    pub fn is_deleted(&self, guid: &Guid) -> bool {
        self.deleted_guids.contains(guid)
    }

    /// Indicates if the GUID's value or structure changed since the last
    /// snapshot.
    #[inline]
    pub fn is_modified(&self, guid: &Guid) -> bool {
        self.modified_guids.contains(guid)
    }

    /// Notes a tombstone for a deleted item.
    #[inline]
    pub fn note_deleted(&mut self, guid: Guid) {
        self.deleted_guids.insert(guid);
    }

    /// Returns an iterator for all tombstoned GUIDs.
    #[inline]
    pub fn deletions(&self) -> impl Iterator<Item = &Guid> {
        self.deleted_guids.iter()
    }

    /// Returns the GUIDs of nodes that exist in structure but can't be
    /// reached from a root, in discovery order.
    #[inline]
    pub fn orphans(&self) -> &[Guid] {
        &self.orphan_guids
    }

    /// Returns an iterator for all node and tombstone GUIDs.
    pub fn guids(&self) -> impl Iterator<Item = &Guid> {
        self.entries
            .iter()
            .map(|entry| &entry.guid)
            .chain(self.deleted_guids.iter())
    }

    /// Indicates if the tree mentions the GUID, as a node or a tombstone.
    pub fn mentions(&self, guid: &Guid) -> bool {
        self.index_by_guid.contains_key(guid) || self.deleted_guids.contains(guid)
    }

    /// Indicates if every GUID reachable from this tree's root either exists
    /// in one of `others`, or is an unknown leaf to be resolved via an item
    /// source.
    pub fn is_fully_rooted_in(&self, others: &[&BookmarkTree]) -> bool {
        let mut stack = match self.root() {
            Some(root) => vec![root],
            None => return self.entries.is_empty(),
        };
        while let Some(node) = stack.pop() {
            if node.kind() != NodeKind::Unknown
                && !others.iter().any(|tree| {
                    tree.index_by_guid.contains_key(node.guid())
                })
            {
                return false;
            }
            stack.extend(node.children());
        }
        true
    }

    /// Returns an indented text dump of every subtree, for logging and tests.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, subtree) in self.subtrees().enumerate() {
            if i != 0 {
                out.push('\n');
            }
            out.push_str(&subtree.to_ascii_fragment(""));
        }
        out
    }
}

#[inline]
fn kind_for(kind: Kind) -> NodeKind {
    if kind == Kind::Folder {
        NodeKind::Folder
    } else {
        NodeKind::NonFolder(kind)
    }
}

impl fmt::Display for BookmarkTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dump())?;
        if !self.deleted_guids.is_empty() {
            f.write_str("\nDeleted: [")?;
            for (i, guid) in self.deleted_guids.iter().enumerate() {
                if i != 0 {
                    f.write_str(", ")?;
                }
                f.write_str(guid.as_ref())?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
impl PartialEq for BookmarkTree {
    fn eq(&self, other: &BookmarkTree) -> bool {
        if self.subtree_indices.len() != other.subtree_indices.len() {
            return false;
        }
        let mut deletions = self.deleted_guids.iter().collect::<Vec<_>>();
        let mut other_deletions = other.deleted_guids.iter().collect::<Vec<_>>();
        deletions.sort();
        other_deletions.sort();
        deletions == other_deletions && self.subtrees().eq(other.subtrees())
    }
}

/// A node in a bookmark tree that knows its parent and children.
#[derive(Clone, Copy, Debug)]
pub struct Node<'t>(&'t BookmarkTree, &'t TreeEntry);

impl<'t> Node<'t> {
    #[inline]
    pub fn guid(&self) -> &'t Guid {
        &self.1.guid
    }

    #[inline]
    pub fn kind(&self) -> NodeKind {
        self.1.kind
    }

    #[inline]
    pub fn is_folder(&self) -> bool {
        self.1.kind.is_folder()
    }

    /// Returns an iterator for all children of this node.
    pub fn children<'n>(&'n self) -> impl Iterator<Item = Node<'t>> + 'n {
        self.1
            .child_indices
            .iter()
            .map(move |&child_index| Node(self.0, &self.0.entries[child_index]))
    }

    /// Returns this node's child GUIDs, in order.
    pub fn child_guids(&self) -> Vec<&'t Guid> {
        self.1
            .child_indices
            .iter()
            .map(|&child_index| &self.0.entries[child_index].guid)
            .collect()
    }

    /// Returns the parent of this node, or `None` for top-level nodes.
    pub fn parent(&self) -> Option<Node<'t>> {
        self.1
            .parent_index
            .map(|parent_index| Node(self.0, &self.0.entries[parent_index]))
    }

    /// Indicates if this node is the canonical root.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.1.guid.is_root()
    }

    /// Indicates if this node is the root of its subtree.
    #[inline]
    pub fn is_subtree_root(&self) -> bool {
        self.1.parent_index.is_none()
    }

    /// Returns an ASCII art representation of this node and all its
    /// descendants. Handy for logging.
    pub fn to_ascii_string(&self) -> String {
        self.to_ascii_fragment("")
    }

    fn to_ascii_fragment(&self, prefix: &str) -> String {
        match self.1.kind {
            NodeKind::Folder => {
                let children_prefix = format!("{}| ", prefix);
                let children = self
                    .children()
                    .map(|n| n.to_ascii_fragment(&children_prefix))
                    .collect::<Vec<String>>();
                if children.is_empty() {
                    format!("{}📂 {}", prefix, self.1.guid)
                } else {
                    format!("{}📂 {}\n{}", prefix, self.1.guid, children.join("\n"))
                }
            }
            NodeKind::NonFolder(_) => format!("{}🔖 {}", prefix, self.1.guid),
            NodeKind::Unknown => format!("{}❓ {}", prefix, self.1.guid),
        }
    }
}

#[cfg(test)]
impl<'t> PartialEq for Node<'t> {
    fn eq(&self, other: &Node<'_>) -> bool {
        if self.1.guid != other.1.guid || self.1.kind != other.1.kind {
            return false;
        }
        if std::ptr::eq(self.1, other.1) {
            return true;
        }
        self.children().eq(other.children())
    }
}

/// Detects cycles in entry parents, using Floyd's tortoise and the hare
/// algorithm. Returns the index of the entry where the cycle was detected,
/// or `None` if there aren't any cycles.
fn detect_cycles(entries: &[TreeEntry]) -> Option<Index> {
    let mut seen = SmallBitVec::from_elem(entries.len(), false);
    for (entry_index, entry) in entries.iter().enumerate() {
        if seen[entry_index] {
            continue;
        }
        let mut parent_index = entry.parent_index;
        let mut grandparent_index = entry
            .parent_index
            .and_then(|index| entries[index].parent_index);
        while let (Some(i), Some(j)) = (parent_index, grandparent_index) {
            if i == j {
                return Some(i);
            }
            if seen[i] || seen[j] {
                break;
            }
            parent_index = parent_index.and_then(|index| entries[index].parent_index);
            grandparent_index = grandparent_index
                .and_then(|index| entries[index].parent_index)
                .and_then(|index| entries[index].parent_index);
        }
        seen.set(entry_index, true);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::{MENU_GUID, MOBILE_GUID, TOOLBAR_GUID, UNFILED_GUID};

    fn folder(guid: &str) -> ItemRow {
        ItemRow::new(guid.into(), Kind::Folder)
    }

    fn bookmark(guid: &str) -> ItemRow {
        ItemRow::new(guid.into(), Kind::Bookmark)
    }

    fn structure(parent: &str, child: &str, position: i64) -> StructureRow {
        StructureRow {
            parent: parent.into(),
            child: child.into(),
            position,
        }
    }

    #[test]
    fn builds_rooted_tree() {
        let tree = BookmarkTree::from_rows(
            vec![
                folder("root________"),
                folder("menu________"),
                bookmark("bookmarkAAAA"),
                bookmark("bookmarkBBBB"),
            ],
            vec![
                structure("root________", "menu________", 0),
                structure("menu________", "bookmarkBBBB", 1),
                structure("menu________", "bookmarkAAAA", 0),
            ],
        )
        .unwrap();

        let root = tree.root().unwrap();
        assert!(root.is_subtree_root());
        let menu = tree.node_for_guid(&MENU_GUID).unwrap();
        // Positions sort ascending regardless of row order.
        assert_eq!(
            menu.child_guids(),
            vec![&Guid::from("bookmarkAAAA"), &Guid::from("bookmarkBBBB")]
        );
        assert_eq!(
            tree.parent_guid_of(&"bookmarkAAAA".into()),
            Some(&MENU_GUID)
        );
        assert!(tree.orphans().is_empty());
    }

    #[test]
    fn missing_child_becomes_unknown_leaf() {
        let tree = BookmarkTree::from_rows(
            vec![folder("root________"), folder("menu________")],
            vec![
                structure("root________", "menu________", 0),
                structure("menu________", "bookmarkAAAA", 0),
            ],
        )
        .unwrap();
        let unknown = tree.node_for_guid(&"bookmarkAAAA".into()).unwrap();
        assert_eq!(unknown.kind(), NodeKind::Unknown);
        assert!(tree.is_fully_rooted_in(&[&tree]));
    }

    #[test]
    fn missing_parent_records_orphan() {
        let tree = BookmarkTree::from_rows(
            vec![folder("root________"), bookmark("bookmarkAAAA")],
            vec![structure("folderMIAAAA", "bookmarkAAAA", 0)],
        )
        .unwrap();
        assert_eq!(tree.orphans(), &[Guid::from("bookmarkAAAA")]);
    }

    #[test]
    fn rejects_duplicate_parentage() {
        let err = BookmarkTree::from_rows(
            vec![
                folder("root________"),
                folder("menu________"),
                folder("toolbar_____"),
                bookmark("bookmarkAAAA"),
            ],
            vec![
                structure("root________", "menu________", 0),
                structure("root________", "toolbar_____", 1),
                structure("menu________", "bookmarkAAAA", 0),
                structure("toolbar_____", "bookmarkAAAA", 0),
            ],
        )
        .unwrap_err();
        match err.kind() {
            ErrorKind::MalformedTree(TreeProblem::DuplicateParentage { child, .. }) => {
                assert_eq!(child, &Guid::from("bookmarkAAAA"));
            }
            kind => panic!("Unexpected error: {:?}", kind),
        }
    }

    #[test]
    fn rejects_non_folder_parent() {
        let err = BookmarkTree::from_rows(
            vec![
                folder("root________"),
                bookmark("bookmarkAAAA"),
                bookmark("bookmarkBBBB"),
            ],
            vec![
                structure("root________", "bookmarkAAAA", 0),
                structure("bookmarkAAAA", "bookmarkBBBB", 0),
            ],
        )
        .unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::MalformedTree(TreeProblem::NonFolderParent { .. })
        ));
    }

    #[test]
    fn rejects_cycles() {
        let err = BookmarkTree::from_rows(
            vec![folder("folderAAAAAA"), folder("folderBBBBBB")],
            vec![
                structure("folderAAAAAA", "folderBBBBBB", 0),
                structure("folderBBBBBB", "folderAAAAAA", 0),
            ],
        )
        .unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::MalformedTree(TreeProblem::Cycle(_))
        ));
    }

    #[test]
    fn empty_mirror_has_canonical_skeleton() {
        let mirror = BookmarkTree::empty_mirror();
        let root = mirror.root().unwrap();
        assert_eq!(
            root.child_guids(),
            vec![&MENU_GUID, &TOOLBAR_GUID, &UNFILED_GUID, &MOBILE_GUID]
        );
        assert_eq!(mirror.deletions().count(), 0);
        assert!(BookmarkTree::empty().subtrees().next().is_none());
    }
}
