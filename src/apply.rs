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

use std::time::Duration;

use crate::driver::{Driver, GreenLight};
use crate::error::Result;
use crate::merge::{Merger, StructureCounts};
use crate::ops::ResultBuilder;
use crate::source::{BufferItemSource, LocalItemSource, MirrorItemSource};
use crate::storage::{Storer, TreeSource, Uploader};

/// Records timings and counters for telemetry.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    pub timings: MergeTimings,
    pub counts: StructureCounts,
}

/// Records timings for each stage of a sync pass.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MergeTimings {
    pub fetch_local_tree: Duration,
    pub fetch_mirror_tree: Duration,
    pub fetch_remote_tree: Duration,
    pub merge: Duration,
    pub build_result: Duration,
    pub upload: Duration,
    pub apply: Duration,
}

macro_rules! time {
    ($timings:ident, $name:ident, $op:expr) => {{
        let now = std::time::Instant::now();
        let result = $op;
        $timings.$name = now.elapsed();
        result
    }};
}

/// How a sync pass ended.
#[derive(Debug)]
pub enum ApplyOutcome {
    /// The pass merged, uploaded, and committed.
    Applied(Stats),
    /// Nothing on either side had changed; nothing was written.
    NoOp(Stats),
    /// The green light went red. No partial state was persisted; the next
    /// pass starts over.
    Aborted,
}

impl ApplyOutcome {
    /// Indicates if the pass changed nothing.
    pub fn is_no_op(&self) -> bool {
        matches!(self, ApplyOutcome::NoOp(_))
    }
}

/// Orchestrates one sync pass: trees, merge, result, upload, commit. The
/// uploader and storage are injected, and the green light is polled before
/// merging, before upload, and before commit; a red light unwinds without
/// partial writes.
pub struct Applier<'a, D, G> {
    driver: &'a D,
    signal: &'a G,
}

impl<'a, D: Driver, G: GreenLight> Applier<'a, D, G> {
    pub fn new(driver: &'a D, signal: &'a G) -> Applier<'a, D, G> {
        Applier { driver, signal }
    }

    /// Runs a pass to completion. Upload happens before the commit of the
    /// mirror override and the buffer drain, which the storer applies as one
    /// transaction. If the server refuses some records, only the accepted
    /// ones are stamped into the mirror; the rest stay in the local table
    /// for the next pass.
    #[allow(clippy::too_many_arguments)]
    pub fn sync_pass(
        &self,
        trees: &dyn TreeSource,
        local_items: &dyn LocalItemSource,
        mirror_items: &dyn MirrorItemSource,
        buffer_items: &dyn BufferItemSource,
        uploader: &mut dyn Uploader,
        storer: &dyn Storer,
    ) -> Result<ApplyOutcome> {
        match self.run(
            trees,
            local_items,
            mirror_items,
            buffer_items,
            uploader,
            storer,
        ) {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_abort() => {
                debug!(self.driver, "Sync pass waved off; nothing persisted");
                Ok(ApplyOutcome::Aborted)
            }
            Err(err) => Err(err),
        }
    }

    fn run(
        &self,
        trees: &dyn TreeSource,
        local_items: &dyn LocalItemSource,
        mirror_items: &dyn MirrorItemSource,
        buffer_items: &dyn BufferItemSource,
        uploader: &mut dyn Uploader,
        storer: &dyn Storer,
    ) -> Result<ApplyOutcome> {
        let mut timings = MergeTimings::default();

        self.signal.err_if_revoked()?;
        let local_tree = time!(timings, fetch_local_tree, trees.build_local_tree())?;
        debug!(self.driver, "Built local tree\n{}", local_tree);

        let mirror_tree = time!(timings, fetch_mirror_tree, trees.build_mirror_tree())?;

        let remote_tree = time!(timings, fetch_remote_tree, trees.build_remote_tree())?;
        debug!(self.driver, "Built remote tree\n{}", remote_tree);

        self.signal.err_if_revoked()?;
        let merger = Merger::with_driver(
            self.driver,
            self.signal,
            &local_tree,
            &mirror_tree,
            &remote_tree,
            local_items,
            mirror_items,
            buffer_items,
        );
        let merged = time!(timings, merge, merger.merge())?;
        debug!(
            self.driver,
            "Built new merged tree\n{}\nDelete Locally: [{}]\nDelete Remotely: [{}]",
            merged.to_ascii_string(),
            merged
                .delete_locally()
                .iter()
                .map(|d| d.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            merged
                .delete_remotely()
                .iter()
                .map(|d| d.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let builder = ResultBuilder::new(
            self.driver,
            self.signal,
            &merged,
            &remote_tree,
            local_items,
            mirror_items,
            buffer_items,
        );
        let mut result = time!(timings, build_result, builder.build())?;

        let counts = *merged.counts();
        if result.is_no_op() {
            debug!(self.driver, "Nothing to apply");
            return Ok(ApplyOutcome::NoOp(Stats { timings, counts }));
        }

        self.signal.err_if_revoked()?;
        let post = time!(timings, upload, uploader.upload(&result.upstream))?;
        for (guid, reason) in &post.failed {
            warn!(
                self.driver,
                "Server rejected {}: {}; leaving for next pass", guid, reason
            );
        }
        for guid in &post.success {
            result
                .local_override
                .modified_times
                .insert(guid.clone(), post.modified);
        }
        result
            .local_override
            .mirror_values_to_copy_from_local
            .retain(|record| !post.failed.contains_key(&record.guid));

        self.signal.err_if_revoked()?;
        time!(
            timings,
            apply,
            storer.apply(&result.local_override, &result.buffer)
        )?;

        Ok(ApplyOutcome::Applied(Stats { timings, counts }))
    }
}
