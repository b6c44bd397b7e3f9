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

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

#[macro_use]
mod driver;
mod apply;
mod error;
mod guid;
mod merge;
mod ops;
mod record;
mod source;
mod storage;
mod tree;


pub use crate::apply::{Applier, ApplyOutcome, MergeTimings, Stats};
pub use crate::driver::{AlwaysGreen, DefaultDriver, Driver, GreenLight, LightSwitch};
pub use crate::error::{Error, ErrorKind, Result, TreeProblem};
pub use crate::guid::{
    Guid, DESKTOP_GUID, MENU_GUID, MOBILE_GUID, ROOT_GUID, TOOLBAR_GUID, UNFILED_GUID,
    USER_CONTENT_ROOTS,
};
pub use crate::merge::{
    MergedTree, MergedTreeNode, Merger, StructureCounts, StructureState, ValueState,
};
pub use crate::ops::{
    BufferCompletionOp, LocalOverrideCompletionOp, MergeResult, PostResult, ResultBuilder,
    UpstreamCompletionOp,
};
pub use crate::record::{Item, Kind, SyncStatus, Timestamp};
pub use crate::source::{BufferItemSource, ItemSource, LocalItemSource, MirrorItemSource};
pub use crate::storage::{FaviconRow, MemoryStore, Storer, TreeSource, Uploader};
pub use crate::tree::{BookmarkTree, ItemRow, Node, NodeKind, StructureRow};
