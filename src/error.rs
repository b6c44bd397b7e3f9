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

use std::{error, fmt, result, str::Utf8Error};

use crate::guid::Guid;

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug)]
pub struct Error(ErrorKind);

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    /// Indicates if this error is the sync pass being waved off, rather than
    /// a failure. Callers surface it as a distinct outcome.
    pub fn is_abort(&self) -> bool {
        matches!(self.kind(), ErrorKind::Aborted)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self.kind() {
            ErrorKind::MalformedString(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error(kind)
    }
}

impl From<Utf8Error> for Error {
    fn from(error: Utf8Error) -> Error {
        Error(ErrorKind::MalformedString(error.into()))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // We format the guid-specific params with <guid: {}> to make it easier
        // on the telemetry side to parse out the user-specific guid and
        // normalize the errors to better aggregate the data
        match self.kind() {
            ErrorKind::NotFound(guid) => {
                write!(f, "Can't resolve item <guid: {}> in any source", guid)
            }
            ErrorKind::MalformedTree(problem) => problem.fmt(f),
            ErrorKind::MergeConflict(guid) => write!(
                f,
                "Item <guid: {}> hit a conflict the merge rules don't cover",
                guid
            ),
            ErrorKind::UnmergedLocalItems => {
                write!(f, "Merged tree doesn't mention all items from local tree")
            }
            ErrorKind::UnmergedRemoteItems => {
                write!(f, "Merged tree doesn't mention all items from buffer")
            }
            ErrorKind::MismatchedItemKind(local_kind, remote_kind) => write!(
                f,
                "Can't merge local {} and remote {} for the same item",
                local_kind, remote_kind
            ),
            ErrorKind::Io(message) => write!(f, "Storage or upload failure: {}", message),
            ErrorKind::MalformedString(err) => err.fmt(f),
            ErrorKind::Aborted => write!(f, "Sync pass aborted"),
        }
    }
}

#[derive(Debug)]
pub enum ErrorKind {
    /// An item source couldn't resolve a referenced GUID. Recoverable inside
    /// the merger (the affected subtree degrades to an unknown leaf); fatal
    /// only when the unresolved record is needed for upload.
    NotFound(Guid),

    /// The structure rows describe something that isn't a tree. Always fatal:
    /// the merger never receives a cyclic or diverged tree.
    MalformedTree(TreeProblem),

    /// A conflict the deterministic merge rules don't cover. Unreachable in a
    /// correct implementation.
    MergeConflict(Guid),

    /// The merged tree doesn't subsume the local tree.
    UnmergedLocalItems,

    /// The merged tree doesn't subsume the buffer.
    UnmergedRemoteItems,

    /// An item changed kind between sides in a way that can't be merged.
    MismatchedItemKind(crate::record::Kind, crate::record::Kind),

    /// An external collaborator (uploader or storage) failed. The applier
    /// gives up on the pass; the outer scheduler may retry it whole.
    Io(String),

    MalformedString(Box<dyn error::Error + Send + Sync + 'static>),

    /// The green light went red. Not a failure; no partial state is kept.
    Aborted,
}

/// Describes how a set of structure rows fails to form a tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TreeProblem {
    /// A chain of parents loops back on itself.
    Cycle(Guid),

    /// A child is listed under two different parents.
    DuplicateParentage {
        child: Guid,
        first_parent: Guid,
        second_parent: Guid,
    },

    /// A structure row names a non-folder as a parent.
    NonFolderParent { parent: Guid, child: Guid },
}

impl fmt::Display for TreeProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeProblem::Cycle(guid) => {
                write!(f, "Item <guid: {}> can't contain itself", guid)
            }
            TreeProblem::DuplicateParentage {
                child,
                first_parent,
                second_parent,
            } => write!(
                f,
                "Item <guid: {}> is in children of both <guid: {}> and <guid: {}>",
                child, first_parent, second_parent
            ),
            TreeProblem::NonFolderParent { parent, child } => write!(
                f,
                "Can't insert <guid: {}> into non-folder <guid: {}>",
                child, parent
            ),
        }
    }
}
