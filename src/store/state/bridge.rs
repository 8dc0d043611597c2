//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Mailcol.
//
// Mailcol is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailcol is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mailcol. If not, see <http://www.gnu.org/licenses/>.

//! Reads that span both generations of message records, and the background
//! rewriting of V1 records into V2.
//!
//! A retrieval looks for each message in V2 first and falls back to V1. A V1
//! hit is returned to the caller straight away and, if on-the-fly migration
//! is enabled, also offered to a bounded queue served by a fixed group of
//! workers. Each worker has its own connection; in one transaction it deletes
//! the V1 row and saves the record as V2, and then reports the outcome to the
//! tracker. An entry whose V1 row is already gone (expunged, or migrated by
//! an earlier entry) is skipped without writing anything. Nothing about migration ever fails a read: if the queue is full,
//! the entry is dropped, and a later read or full sweep will offer it again.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::tracker::MigrationTracker;
use crate::{
    store::{model::*, storage::Connection},
    support::{
        error::Error, log_prefix::LogPrefix, system_config::StoreConfig,
        threading::WorkerGroup,
    },
};

/// The outcome of one sweep over the V1 records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FullMigrationReport {
    /// Records accepted by the queue.
    pub offered: u64,
    /// Records dropped because the queue was full.
    pub dropped: u64,
}

pub struct MigrationBridge {
    log_prefix: LogPrefix,
    on_the_fly: bool,
    workers: WorkerGroup<MessageRecord>,
    tracker: Arc<MigrationTracker>,
}

impl MigrationBridge {
    /// Starts the migration workers for the database at `path`.
    pub fn start(
        path: &Path,
        config: Arc<StoreConfig>,
        tracker: Arc<MigrationTracker>,
        log_prefix: LogPrefix,
    ) -> Result<Self, Error> {
        let count = config.migration.effective_workers();
        Self::spawn(path, config, tracker, log_prefix, count)
    }

    fn spawn(
        path: &Path,
        config: Arc<StoreConfig>,
        tracker: Arc<MigrationTracker>,
        log_prefix: LogPrefix,
        count: usize,
    ) -> Result<Self, Error> {
        let workers = WorkerGroup::spawn(
            "mailcol-migrate",
            count,
            config.migration.queue_capacity,
            |ix| {
                let mut cxn = Connection::new(path, Arc::clone(&config))?;
                cxn.set_log_prefix(
                    log_prefix.for_worker(format!("migrate-{ix}")),
                );
                let tracker = Arc::clone(&tracker);
                Ok(move |record: MessageRecord| {
                    migrate_one(&cxn, &tracker, record)
                })
            },
        )?;

        info!(
            "{} Started {} migration workers (on-the-fly: {})",
            log_prefix, count, config.migration.on_the_fly,
        );

        Ok(Self {
            log_prefix,
            on_the_fly: config.migration.on_the_fly,
            workers,
            tracker,
        })
    }

    pub fn tracker(&self) -> &Arc<MigrationTracker> {
        &self.tracker
    }

    /// Retrieves the given messages at `depth`, from V2 if present and from
    /// V1 otherwise.
    ///
    /// Messages in neither store are skipped. Once every V1 record has been
    /// migrated (schema version 2), V1 is no longer consulted.
    pub fn retrieve(
        &self,
        cxn: &Connection,
        ids: &[ComposedMessageId],
        depth: FetchDepth,
    ) -> Result<Vec<MessageRecord>, Error> {
        let consult_v1 = cxn.schema_version()? < 2;
        // Migration needs the whole record regardless of what the caller
        // asked for.
        let v1_depth = if self.on_the_fly {
            FetchDepth::Full
        } else {
            depth
        };

        let mut ret = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = cxn.retrieve_message_v2(id, depth)? {
                ret.push(record);
                continue;
            }

            if !consult_v1 {
                continue;
            }

            let Some(record) = cxn.retrieve_message_v1(id, v1_depth)? else {
                continue;
            };

            if self.on_the_fly {
                self.offer(record.clone());
            }
            ret.push(record.at_depth(depth));
        }

        Ok(ret)
    }

    /// Offers every V1 record to the migration queue.
    ///
    /// This is best-effort: records that do not fit in the queue are dropped
    /// and counted in the report. Running the sweep again picks them up.
    pub fn run_full_migration(
        &self,
        cxn: &Connection,
    ) -> Result<FullMigrationReport, Error> {
        let mut report = FullMigrationReport::default();
        cxn.scan_all_messages_v1(&mut |record| {
            if self.offer(record) {
                report.offered += 1;
            } else {
                report.dropped += 1;
            }
            Ok(())
        })?;

        info!(
            "{} Full migration sweep offered {} records, dropped {}",
            self.log_prefix, report.offered, report.dropped,
        );
        Ok(report)
    }

    /// If the workers are idle and no V1 records remain, raises the schema
    /// version to 2 and returns true.
    pub fn finish_migration(&self, cxn: &Connection) -> Result<bool, Error> {
        if !self.workers.is_idle() || 0 != cxn.count_messages_v1()? {
            return Ok(false);
        }

        if cxn.schema_version()? < 2 {
            cxn.set_schema_version(2)?;
            info!("{} All V1 records migrated", self.log_prefix);
        }
        Ok(true)
    }

    /// Waits up to `timeout` for every queued entry to be processed. Returns
    /// whether the queue became idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.workers.is_idle() {
                return true;
            }

            if Instant::now() >= deadline {
                return false;
            }

            thread::sleep(Duration::from_millis(5));
        }
    }

    /// The number of entries queued or being processed.
    pub fn pending(&self) -> usize {
        self.workers.pending()
    }

    /// Stops the workers, discarding anything still queued.
    pub fn shutdown(self) {
        let pending = self.workers.pending();
        if 0 != pending {
            info!(
                "{} Shutting down with {} migration entries pending",
                self.log_prefix, pending,
            );
        }
        self.workers.shutdown();
    }

    fn offer(&self, record: MessageRecord) -> bool {
        match self.workers.offer(record) {
            Ok(()) => true,
            Err(record) => {
                warn!(
                    "{} Migration queue full; not migrating {:?} for now",
                    self.log_prefix, record.id,
                );
                false
            },
        }
    }
}

fn migrate_one(
    cxn: &Connection,
    tracker: &MigrationTracker,
    record: MessageRecord,
) {
    match cxn.migrate_message_v1(&record) {
        Ok(false) => {
            debug!(
                "{} {:?} is no longer in V1; skipping",
                cxn.log_prefix(),
                record.id,
            );
        },
        Ok(true) => {
            let state = tracker.report_success();
            debug!(
                "{} Migrated {:?} ({} ok, {} failed so far)",
                cxn.log_prefix(),
                record.id,
                state.num_success,
                state.num_error,
            );
        },
        Err(e) => {
            let state = tracker.report_error();
            warn!(
                "{} Failed to migrate {:?} ({} failed so far): {}",
                cxn.log_prefix(),
                record.id,
                state.num_error,
                e,
            );
        },
    }
}

#[cfg(test)]
mod test {
    use chrono::prelude::*;

    use super::*;
    use crate::store::state::MigrationState;
    use crate::store::storage::test_support::{sample_record, Fixture};
    use crate::support::system_config::MigrationConfig;

    const WAIT: Duration = Duration::from_secs(30);

    fn config(on_the_fly: bool, queue_capacity: usize) -> StoreConfig {
        StoreConfig {
            migration: MigrationConfig {
                on_the_fly,
                queue_capacity,
                workers: 2,
            },
            ..StoreConfig::default()
        }
    }

    fn bridge(
        fixture: &Fixture,
        count: usize,
    ) -> (MigrationBridge, Arc<MigrationTracker>) {
        let tracker = Arc::new(MigrationTracker::new());
        let bridge = MigrationBridge::spawn(
            &fixture.path(),
            Arc::clone(fixture.cxn.config()),
            Arc::clone(&tracker),
            fixture.cxn.log_prefix().clone(),
            count,
        )
        .unwrap();
        (bridge, tracker)
    }

    #[test]
    fn v1_reads_are_migrated() {
        let fixture = Fixture::with_config(config(true, 16));
        let (bridge, tracker) = bridge(&fixture, 2);
        let cxn = &fixture.cxn;

        let v1 = sample_record(1);
        let v2 = sample_record(2);
        cxn.save_message_v1(&v1).unwrap();
        cxn.save_message_v2(&v2).unwrap();
        let nx = sample_record(3).id;

        let records = bridge
            .retrieve(cxn, &[v1.id, nx, v2.id], FetchDepth::Headers)
            .unwrap();
        assert_eq!(
            vec![
                v1.clone().at_depth(FetchDepth::Headers),
                v2.clone().at_depth(FetchDepth::Headers),
            ],
            records
        );

        assert!(bridge.wait_idle(WAIT));
        assert_eq!(
            MigrationState {
                num_success: 1,
                num_error: 0,
            },
            tracker.state()
        );
        assert_eq!(0, cxn.count_messages_v1().unwrap());
        assert_eq!(
            Some(v1.clone()),
            cxn.retrieve_message_v2(&v1.id, FetchDepth::Full).unwrap()
        );

        // Now served from V2 without further migration
        assert_eq!(
            vec![v1.clone()],
            bridge.retrieve(cxn, &[v1.id], FetchDepth::Full).unwrap()
        );
        assert!(bridge.wait_idle(WAIT));
        assert_eq!(1, tracker.state().num_success);

        bridge.shutdown();
    }

    #[test]
    fn v1_reads_without_on_the_fly_migration() {
        let fixture = Fixture::with_config(config(false, 16));
        let (bridge, tracker) = bridge(&fixture, 2);
        let cxn = &fixture.cxn;

        let v1 = sample_record(1);
        cxn.save_message_v1(&v1).unwrap();

        assert_eq!(
            vec![v1.clone().at_depth(FetchDepth::Body)],
            bridge.retrieve(cxn, &[v1.id], FetchDepth::Body).unwrap()
        );
        assert_eq!(0, bridge.pending());
        assert_eq!(MigrationState::default(), tracker.state());
        assert_eq!(1, cxn.count_messages_v1().unwrap());
    }

    #[test]
    fn full_queue_drops_entries() {
        let fixture = Fixture::with_config(config(true, 1));
        // No workers, so nothing ever leaves the queue
        let (bridge, tracker) = bridge(&fixture, 0);
        let cxn = &fixture.cxn;

        let records = (1..=3).map(sample_record).collect::<Vec<_>>();
        for record in &records {
            cxn.save_message_v1(record).unwrap();
        }

        let ids = records.iter().map(|r| r.id).collect::<Vec<_>>();
        // Reads still succeed in full
        assert_eq!(
            records,
            bridge.retrieve(cxn, &ids, FetchDepth::Full).unwrap()
        );
        assert_eq!(1, bridge.pending());

        let report = bridge.run_full_migration(cxn).unwrap();
        assert_eq!(
            FullMigrationReport {
                offered: 0,
                dropped: 3,
            },
            report
        );
        assert!(!bridge.wait_idle(Duration::from_millis(20)));
        assert!(!bridge.finish_migration(cxn).unwrap());
        assert_eq!(MigrationState::default(), tracker.state());

        // Shutdown discards the queued entry
        bridge.shutdown();
        assert_eq!(3, cxn.count_messages_v1().unwrap());
        assert_eq!(0, cxn.count_messages_v2().unwrap());
    }

    #[test]
    fn full_migration_raises_schema_version() {
        let fixture = Fixture::with_config(config(true, 100));
        let (bridge, tracker) = bridge(&fixture, 2);
        let cxn = &fixture.cxn;

        let records = (1..=20).map(sample_record).collect::<Vec<_>>();
        for record in &records {
            cxn.save_message_v1(record).unwrap();
        }

        let report = bridge.run_full_migration(cxn).unwrap();
        assert_eq!(20, report.offered);
        assert_eq!(0, report.dropped);
        assert!(bridge.wait_idle(WAIT));
        assert!(bridge.finish_migration(cxn).unwrap());

        assert_eq!(2, cxn.schema_version().unwrap());
        assert_eq!(0, cxn.count_messages_v1().unwrap());
        assert_eq!(20, cxn.count_messages_v2().unwrap());
        assert_eq!(
            MigrationState {
                num_success: 20,
                num_error: 0,
            },
            tracker.state()
        );

        let ids = records.iter().map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(
            records,
            bridge.retrieve(cxn, &ids, FetchDepth::Full).unwrap()
        );

        // V1 is no longer consulted at all
        let straggler = sample_record(21);
        cxn.save_message_v1(&straggler).unwrap();
        assert!(bridge
            .retrieve(cxn, &[straggler.id], FetchDepth::Full)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn duplicate_migration_is_idempotent() {
        let fixture = Fixture::with_config(config(true, 100));
        let (bridge, tracker) = bridge(&fixture, 2);
        let cxn = &fixture.cxn;

        let record = sample_record(1);
        cxn.save_message_v1(&record).unwrap();

        // Whichever entry is processed second finds nothing left to do.
        bridge.offer(record.clone());
        bridge.offer(record.clone());
        assert!(bridge.wait_idle(WAIT));

        assert_eq!(
            MigrationState {
                num_success: 1,
                num_error: 0,
            },
            tracker.state()
        );
        assert_eq!(0, cxn.count_messages_v1().unwrap());
        assert_eq!(1, cxn.count_messages_v2().unwrap());
        assert_eq!(
            Some(record.clone()),
            cxn.retrieve_message_v2(&record.id, FetchDepth::Full).unwrap()
        );
    }

    #[test]
    fn expunged_message_is_not_migrated() {
        let fixture = Fixture::with_config(config(true, 16));
        // No workers, so the entry stays queued until run by hand
        let (bridge, tracker) = bridge(&fixture, 0);
        let cxn = &fixture.cxn;

        let mailbox_id = cxn
            .save_mailbox(&Mailbox::new(MailboxPath::private("alice", "INBOX")))
            .unwrap()
            .id
            .unwrap();
        let state = cxn
            .append_message(
                mailbox_id,
                Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
                b"Subject: hi\r\n\r\nHello",
                15,
                vec![],
                Flags::default(),
            )
            .unwrap();

        // Turn the message into a legacy record
        let record = cxn
            .retrieve_message_v2(&state.id, FetchDepth::Full)
            .unwrap()
            .unwrap();
        cxn.save_message_v1(&record).unwrap();
        cxn.delete_message_v2(mailbox_id, state.id.message_id).unwrap();

        assert_eq!(
            vec![record.clone()],
            bridge.retrieve(cxn, &[state.id], FetchDepth::Full).unwrap()
        );
        assert_eq!(1, bridge.pending());

        cxn.expunge(mailbox_id, state.id.uid).unwrap();

        // The queued entry only gets processed now
        let worker = fixture.connect();
        migrate_one(&worker, &tracker, record);

        assert_eq!(MigrationState::default(), tracker.state());
        assert_eq!(0, cxn.count_messages_v1().unwrap());
        assert_eq!(0, cxn.count_messages_v2().unwrap());
        assert!(bridge
            .retrieve(cxn, &[state.id], FetchDepth::Full)
            .unwrap()
            .is_empty());
        assert_matches!(
            Err(Error::NxMessage),
            cxn.message_state(mailbox_id, state.id.uid)
        );

        bridge.shutdown();
    }
}
