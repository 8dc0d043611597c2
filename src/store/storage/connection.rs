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

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::prelude::*;
use log::info;

use super::types::*;
use crate::support::{
    error::Error, log_prefix::LogPrefix, system_config::StoreConfig,
};

/// A connection to a Mailcol database.
///
/// Table-specific operations are implemented in the sibling modules.
pub struct Connection {
    pub(super) cxn: rusqlite::Connection,
    pub(super) config: Arc<StoreConfig>,
    pub(super) log_prefix: LogPrefix,
}

static MIGRATIONS: &[&str] = &[include_str!("schema.v1.sql")];

impl Connection {
    /// Opens the database at `path`, creating it if it does not exist.
    pub fn new(path: &Path, config: Arc<StoreConfig>) -> Result<Self, Error> {
        Self::open(
            path,
            config,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    }

    /// Opens the database at `path`, failing if it does not exist.
    pub fn open_existing(
        path: &Path,
        config: Arc<StoreConfig>,
    ) -> Result<Self, Error> {
        Self::open(
            path,
            config,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    }

    fn open(
        path: &Path,
        config: Arc<StoreConfig>,
        flags: rusqlite::OpenFlags,
    ) -> Result<Self, Error> {
        let mut cxn = rusqlite::Connection::open_with_flags(path, flags)?;

        // WAL lets readers proceed while a writer holds the lock, which
        // matters since every migration worker has its own connection.
        cxn.pragma_update(None, "journal_mode", "WAL")?;
        cxn.pragma_update(None, "synchronous", "NORMAL")?;
        cxn.busy_timeout(Duration::from_millis(
            config.allocation.busy_timeout_ms,
        ))?;

        let log_prefix = LogPrefix::for_database(path);
        apply_migrations(&log_prefix, &mut cxn, MIGRATIONS)?;

        Ok(Self {
            cxn,
            config,
            log_prefix,
        })
    }

    /// Replaces the prefix this connection logs with.
    pub fn set_log_prefix(&mut self, log_prefix: LogPrefix) {
        self.log_prefix = log_prefix;
    }

    pub fn config(&self) -> &Arc<StoreConfig> {
        &self.config
    }

    pub fn log_prefix(&self) -> &LogPrefix {
        &self.log_prefix
    }

    /// Returns the generation of message records currently in force.
    ///
    /// 1 means that V1 records may still exist; 2 means that every V1 record
    /// has been migrated.
    pub fn schema_version(&self) -> Result<u32, Error> {
        self.cxn
            .prepare_cached(
                "SELECT `version` FROM `schema_version` WHERE `id` = 0",
            )?
            .query_row((), from_single::<u32>)
            .map_err(Into::into)
    }

    /// Overwrites the schema version. Last writer wins.
    pub fn set_schema_version(&self, version: u32) -> Result<(), Error> {
        self.cxn
            .prepare_cached(
                "INSERT OR REPLACE INTO `schema_version` (`id`, `version`) \
                 VALUES (0, ?)",
            )?
            .execute((version,))?;
        Ok(())
    }

    /// Runs `f` inside a savepoint, so that its writes land together or not
    /// at all.
    ///
    /// Savepoints nest, so this may be used whether or not a transaction is
    /// already open on this connection.
    pub(super) fn with_savepoint<T>(
        &self,
        f: impl FnOnce() -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.cxn.execute_batch("SAVEPOINT `mailcol`")?;
        match f() {
            Ok(v) => {
                self.cxn.execute_batch("RELEASE `mailcol`")?;
                Ok(v)
            },
            Err(e) => {
                let _ = self
                    .cxn
                    .execute_batch("ROLLBACK TO `mailcol`; RELEASE `mailcol`");
                Err(e)
            },
        }
    }

    /// Runs `f` inside a transaction which takes the write lock up front.
    ///
    /// Anything `f` reads cannot be changed by another connection before the
    /// transaction commits. `f` returning an error rolls everything back.
    pub(super) fn with_write_lock<T>(
        &self,
        f: impl FnOnce() -> Result<T, Error>,
    ) -> Result<T, Error> {
        let txn = rusqlite::Transaction::new_unchecked(
            &self.cxn,
            rusqlite::TransactionBehavior::Immediate,
        )?;
        let ret = f()?;
        txn.commit()?;
        Ok(ret)
    }
}

fn apply_migrations(
    log_prefix: &LogPrefix,
    cxn: &mut rusqlite::Connection,
    migrations: &[&str],
) -> Result<(), Error> {
    let latest_version = migrations.len();

    if Ok(latest_version)
        == cxn.query_row(
            "SELECT MAX(`version`) FROM `migration`",
            (),
            from_single::<usize>,
        )
    {
        return Ok(());
    }

    let txn = cxn
        .transaction_with_behavior(rusqlite::TransactionBehavior::Exclusive)?;
    txn.execute(
        "CREATE TABLE IF NOT EXISTS `migration` (\
         `version` INTEGER NOT NULL PRIMARY KEY, \
         `applied_at` INTEGER NOT NULL\
         ) STRICT",
        (),
    )?;

    let current_version = txn
        .query_row(
            "SELECT MAX(`version`) FROM `migration`",
            (),
            from_single::<Option<usize>>,
        )?
        .unwrap_or(0);

    for (version, migration) in migrations
        .iter()
        .copied()
        .enumerate()
        .map(|(ix, migration)| (ix + 1, migration))
        .skip(current_version)
    {
        info!("{log_prefix} Applying schema migration #{version}");
        txn.execute_batch(migration)?;
        txn.execute(
            "INSERT INTO `migration` (`version`, `applied_at`) \
             VALUES (?, ?)",
            (version, UnixMillis(Utc::now())),
        )?;
    }

    txn.commit()?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use tempfile::TempDir;

    use super::*;
    use crate::store::model::*;

    pub struct Fixture {
        pub tmpdir: TempDir,
        pub cxn: Connection,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self::with_config(StoreConfig::default())
        }

        pub fn with_config(config: StoreConfig) -> Self {
            crate::init_test_log();

            let tmpdir = TempDir::new().unwrap();
            let cxn = Connection::new(
                &tmpdir.path().join("mailcol.sqlite"),
                Arc::new(config),
            )
            .unwrap();

            Self { tmpdir, cxn }
        }

        pub fn path(&self) -> std::path::PathBuf {
            self.tmpdir.path().join("mailcol.sqlite")
        }

        /// Opens another connection to the same database, as another process
        /// would.
        pub fn connect(&self) -> Connection {
            Connection::new(
                &self.tmpdir.path().join("mailcol.sqlite"),
                Arc::clone(&self.cxn.config),
            )
            .unwrap()
        }
    }

    /// A full record of a small message in a fresh mailbox.
    pub fn sample_record(uid: u64) -> MessageRecord {
        let header = format!("Subject: {}\r\n\r\n", uid);
        MessageRecord::new(
            ComposedMessageId {
                mailbox_id: MailboxId::generate(),
                message_id: MessageId::generate(),
                uid: Uid::u(uid),
            },
            Utc.timestamp_opt(1_600_000_000 + uid as i64, 0).unwrap(),
            format!("{}Hello {}", header, uid).as_bytes(),
            header.len(),
            vec![AttachmentRef {
                attachment_id: format!("att-{}", uid),
                name: Some("a.txt".to_owned()),
                cid: None,
                inline: false,
            }],
        )
    }
}
