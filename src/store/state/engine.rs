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

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use super::bridge::{FullMigrationReport, MigrationBridge};
use super::tracker::{MigrationState, MigrationTracker};
use crate::{
    store::{model::*, storage::Connection},
    support::{
        error::Error, log_prefix::LogPrefix, system_config::StoreConfig,
    },
};

/// An open Mailcol database together with its migration workers.
///
/// The engine is shared between threads by reference. Each thread that wants
/// to do anything gets its own `Session` from `connect`.
pub struct Engine {
    path: PathBuf,
    config: Arc<StoreConfig>,
    log_prefix: LogPrefix,
    bridge: MigrationBridge,
}

impl Engine {
    /// Opens (creating if needed) the database at `path` and starts the
    /// migration workers.
    pub fn open(path: &Path, config: StoreConfig) -> Result<Self, Error> {
        let config = Arc::new(config);
        // Apply the schema once up front rather than having every worker
        // race to do it.
        let cxn = Connection::new(path, Arc::clone(&config))?;
        let log_prefix = cxn.log_prefix().clone();
        info!(
            "{} Opened at schema version {}",
            log_prefix,
            cxn.schema_version()?,
        );

        let bridge = MigrationBridge::start(
            path,
            Arc::clone(&config),
            Arc::new(MigrationTracker::new()),
            log_prefix.clone(),
        )?;

        Ok(Self {
            path: path.to_owned(),
            config,
            log_prefix,
            bridge,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Opens a new session on this engine.
    pub fn connect(&self) -> Result<Session<'_>, Error> {
        Ok(Session {
            engine: self,
            cxn: Connection::new(&self.path, Arc::clone(&self.config))?,
        })
    }

    /// Runs one best-effort sweep offering every V1 record for migration.
    pub fn run_full_migration(&self) -> Result<FullMigrationReport, Error> {
        let cxn = Connection::new(&self.path, Arc::clone(&self.config))?;
        self.bridge.run_full_migration(&cxn)
    }

    /// Repeatedly sweeps the V1 records until none remain, raising the schema
    /// version when that happens.
    ///
    /// Each round waits up to `round_timeout` for the workers to go idle.
    /// Gives up and returns false after `max_rounds` rounds, or as soon as a
    /// round makes no progress.
    pub fn migrate_fully(
        &self,
        max_rounds: u32,
        round_timeout: Duration,
    ) -> Result<bool, Error> {
        let cxn = Connection::new(&self.path, Arc::clone(&self.config))?;

        for round in 1..=max_rounds {
            let remaining = cxn.count_messages_v1()?;
            let report = self.bridge.run_full_migration(&cxn)?;
            if !self.bridge.wait_idle(round_timeout) {
                warn!(
                    "{} Migration round {} did not finish within {:?}",
                    self.log_prefix, round, round_timeout,
                );
                return Ok(false);
            }

            if self.bridge.finish_migration(&cxn)? {
                return Ok(true);
            }

            if 0 == report.offered || cxn.count_messages_v1()? >= remaining {
                warn!(
                    "{} Migration round {} made no progress; {} V1 records \
                     remain",
                    self.log_prefix,
                    round,
                    cxn.count_messages_v1()?,
                );
                return Ok(false);
            }
        }

        Ok(false)
    }

    pub fn migration_state(&self) -> MigrationState {
        self.bridge.tracker().state()
    }

    /// Waits up to `timeout` for the migration queue to drain.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.bridge.wait_idle(timeout)
    }

    /// Stops the migration workers. Entries still queued are discarded.
    pub fn shutdown(self) {
        self.bridge.shutdown();
    }
}

/// One thread's handle on an `Engine`.
///
/// Most operations are those of the underlying `Connection`, reached through
/// `storage()`. Message reads go through the session so that they see both
/// generations of records.
pub struct Session<'a> {
    engine: &'a Engine,
    cxn: Connection,
}

impl Session<'_> {
    pub fn storage(&self) -> &Connection {
        &self.cxn
    }

    /// Saves a message record in the current format.
    pub fn save_message(&self, record: &MessageRecord) -> Result<(), Error> {
        self.cxn.save_message_v2(record)
    }

    /// Retrieves the given messages, whichever generation they are stored in.
    pub fn retrieve_messages(
        &self,
        ids: &[ComposedMessageId],
        depth: FetchDepth,
    ) -> Result<Vec<MessageRecord>, Error> {
        self.engine.bridge.retrieve(&self.cxn, ids, depth)
    }

    /// Retrieves the messages with the given UIDs in `mailbox_id`.
    ///
    /// UIDs not in the mailbox are skipped.
    pub fn fetch(
        &self,
        mailbox_id: MailboxId,
        uids: &[Uid],
        depth: FetchDepth,
    ) -> Result<Vec<MessageRecord>, Error> {
        let mut ids = Vec::with_capacity(uids.len());
        for &uid in uids {
            match self.cxn.message_state(mailbox_id, uid) {
                Ok(state) => ids.push(state.id),
                Err(Error::NxMessage) => continue,
                Err(e) => return Err(e),
            }
        }

        self.retrieve_messages(&ids, depth)
    }

    /// Invokes `receiver` with every stored message, of either generation.
    ///
    /// A message that is mid-migration is only delivered once.
    pub fn scan_all_messages(
        &self,
        depth: FetchDepth,
        receiver: &mut dyn FnMut(MessageRecord) -> Result<(), Error>,
    ) -> Result<(), Error> {
        self.cxn.scan_all_messages_v2(depth, receiver)?;
        if self.cxn.schema_version()? >= 2 {
            return Ok(());
        }

        self.cxn.scan_all_messages_v1(&mut |record| {
            if self
                .cxn
                .retrieve_message_v2(&record.id, FetchDepth::Metadata)?
                .is_some()
            {
                return Ok(());
            }
            receiver(record.at_depth(depth))
        })
    }
}
