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

//! Derived per-mailbox indexes.
//!
//! Four tables are folded incrementally as messages are added, deleted and
//! re-flagged: the counters, the set of recent UIDs, the first-unseen pointer
//! and the applicable flags. They are not written atomically with each other
//! nor with `mailbox_messages`. Each fold attempts every table even if an
//! earlier one failed, and reports the first failure.
//!
//! The first-unseen pointer is only ever set when it is absent and cleared
//! when the message holding it stops being unseen. Nothing recomputes it
//! automatically; `recompute_first_unseen` exists for callers that want it.

use log::error;
use rusqlite::OptionalExtension as _;

use super::{connection::Connection, types::*};
use crate::{store::model::*, support::error::Error};

impl Connection {
    /// Folds a newly added message into the indexes of its mailbox.
    pub fn index_on_add(&self, message: &MessageState) -> Result<(), Error> {
        let mailbox_id = message.id.mailbox_id;
        let uid = message.id.uid;
        let unseen = !message.flags.is_seen();

        self.settle(
            "add",
            mailbox_id,
            [
                (
                    "counters",
                    self.adjust_counters(mailbox_id, 1, i64::from(unseen)),
                ),
                ("recent", {
                    if message.flags.is_recent() {
                        self.add_recent(mailbox_id, uid)
                    } else {
                        Ok(())
                    }
                }),
                ("first unseen", {
                    if unseen {
                        self.offer_first_unseen(mailbox_id, uid)
                    } else {
                        Ok(())
                    }
                }),
                (
                    "applicable flags",
                    self.extend_applicable_flags(mailbox_id, &message.flags),
                ),
            ],
        )
    }

    /// Removes a message from the indexes of its mailbox.
    ///
    /// `message` carries the flags the caller believes the message had. The
    /// UID is removed from the recent set regardless of them.
    pub fn index_on_delete(&self, message: &MessageState) -> Result<(), Error> {
        let mailbox_id = message.id.mailbox_id;
        let uid = message.id.uid;
        let unseen = !message.flags.is_seen();

        self.settle(
            "delete",
            mailbox_id,
            [
                (
                    "counters",
                    self.adjust_counters(mailbox_id, -1, -i64::from(unseen)),
                ),
                ("recent", self.remove_recent(mailbox_id, uid)),
                ("first unseen", self.clear_first_unseen(mailbox_id, uid)),
                ("applicable flags", Ok(())),
            ],
        )
    }

    /// Folds a flag change of one message into the indexes of `mailbox_id`.
    pub fn index_on_flags_update(
        &self,
        mailbox_id: MailboxId,
        updated: &UpdatedFlags,
    ) -> Result<(), Error> {
        let uid = updated.uid;
        let seen = updated.transition(SystemFlags::SEEN);

        self.settle(
            "flags update",
            mailbox_id,
            [
                ("counters", match seen {
                    Some(true) => self.adjust_counters(mailbox_id, 0, -1),
                    Some(false) => self.adjust_counters(mailbox_id, 0, 1),
                    None => Ok(()),
                }),
                ("recent", match updated.transition(SystemFlags::RECENT) {
                    Some(true) => self.add_recent(mailbox_id, uid),
                    Some(false) => self.remove_recent(mailbox_id, uid),
                    None => Ok(()),
                }),
                ("first unseen", match seen {
                    Some(true) => self.clear_first_unseen(mailbox_id, uid),
                    Some(false) => self.offer_first_unseen(mailbox_id, uid),
                    None => Ok(()),
                }),
                (
                    "applicable flags",
                    self.extend_applicable_flags(
                        mailbox_id,
                        &updated.new_flags,
                    ),
                ),
            ],
        )
    }

    /// Returns the message counters of the given mailbox.
    pub fn counters(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<MailboxCounters, Error> {
        Ok(self
            .cxn
            .prepare_cached(
                "SELECT `total_count`, `unseen_count` FROM `mailbox_counters` \
                 WHERE `mailbox_id` = ?",
            )?
            .query_row((mailbox_id,), from_row)
            .optional()?
            .unwrap_or_default())
    }

    /// Returns the UIDs in the recent set of the given mailbox, ascending.
    pub fn recent_uids(&self, mailbox_id: MailboxId) -> Result<Vec<Uid>, Error> {
        self.cxn
            .prepare_cached(
                "SELECT `uid` FROM `mailbox_recent` WHERE `mailbox_id` = ? \
                 ORDER BY `uid`",
            )?
            .query_map((mailbox_id,), from_single)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Returns the first-unseen pointer of the given mailbox, if set.
    pub fn first_unseen(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<Option<Uid>, Error> {
        self.cxn
            .prepare_cached(
                "SELECT `uid` FROM `mailbox_first_unseen` \
                 WHERE `mailbox_id` = ?",
            )?
            .query_row((mailbox_id,), from_single)
            .optional()
            .map_err(Into::into)
    }

    /// Returns every flag ever seen in the given mailbox, other than
    /// `\Recent`.
    pub fn applicable_flags(&self, mailbox_id: MailboxId) -> Result<Flags, Error> {
        let flags = self
            .cxn
            .prepare_cached(
                "SELECT `flag` FROM `mailbox_applicable_flags` \
                 WHERE `mailbox_id` = ?",
            )?
            .query_map((mailbox_id,), from_single::<Flag>)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Flags::of(flags))
    }

    /// Points the first-unseen pointer of the given mailbox at the lowest UID
    /// in `mailbox_messages` without `\Seen`, or clears it if there is none.
    pub fn recompute_first_unseen(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<Option<Uid>, Error> {
        let first = self
            .cxn
            .prepare_cached(
                "SELECT MIN(`uid`) FROM `mailbox_messages` \
                 WHERE `mailbox_id` = ? AND (`system_flags` & ?) = 0",
            )?
            .query_row((mailbox_id, SystemFlags::SEEN), from_single::<Option<Uid>>)?;

        match first {
            Some(uid) => {
                self.cxn
                    .prepare_cached(
                        "INSERT OR REPLACE INTO `mailbox_first_unseen` \
                         (`mailbox_id`, `uid`) VALUES (?, ?)",
                    )?
                    .execute((mailbox_id, uid))?;
            },
            None => {
                self.cxn
                    .prepare_cached(
                        "DELETE FROM `mailbox_first_unseen` \
                         WHERE `mailbox_id` = ?",
                    )?
                    .execute((mailbox_id,))?;
            },
        }

        Ok(first)
    }

    /// Removes every index row of a deleted mailbox.
    pub(super) fn delete_indexes(&self, mailbox_id: MailboxId) -> Result<(), Error> {
        for table in [
            "mailbox_counters",
            "mailbox_recent",
            "mailbox_first_unseen",
            "mailbox_applicable_flags",
        ] {
            self.cxn
                .prepare_cached(&format!(
                    "DELETE FROM `{table}` WHERE `mailbox_id` = ?"
                ))?
                .execute((mailbox_id,))?;
        }
        Ok(())
    }

    fn settle(
        &self,
        what: &str,
        mailbox_id: MailboxId,
        results: [(&str, Result<(), Error>); 4],
    ) -> Result<(), Error> {
        let mut first_error = None;
        for (table, result) in results {
            if let Err(e) = result {
                error!(
                    "{} Index {} in mailbox {} failed to update {}: {}",
                    self.log_prefix, what, mailbox_id, table, e,
                );
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn adjust_counters(
        &self,
        mailbox_id: MailboxId,
        total: i64,
        unseen: i64,
    ) -> Result<(), Error> {
        if 0 == total && 0 == unseen {
            return Ok(());
        }

        self.cxn
            .prepare_cached(
                "INSERT INTO `mailbox_counters` \
                 (`mailbox_id`, `total_count`, `unseen_count`) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT (`mailbox_id`) DO UPDATE SET \
                 `total_count` = `total_count` + ?2, \
                 `unseen_count` = `unseen_count` + ?3",
            )?
            .execute((mailbox_id, total, unseen))?;
        Ok(())
    }

    fn add_recent(&self, mailbox_id: MailboxId, uid: Uid) -> Result<(), Error> {
        self.cxn
            .prepare_cached(
                "INSERT OR IGNORE INTO `mailbox_recent` (`mailbox_id`, `uid`) \
                 VALUES (?, ?)",
            )?
            .execute((mailbox_id, uid))?;
        Ok(())
    }

    fn remove_recent(&self, mailbox_id: MailboxId, uid: Uid) -> Result<(), Error> {
        self.cxn
            .prepare_cached(
                "DELETE FROM `mailbox_recent` \
                 WHERE `mailbox_id` = ? AND `uid` = ?",
            )?
            .execute((mailbox_id, uid))?;
        Ok(())
    }

    /// Sets the first-unseen pointer to `uid` if it is not set.
    fn offer_first_unseen(
        &self,
        mailbox_id: MailboxId,
        uid: Uid,
    ) -> Result<(), Error> {
        self.cxn
            .prepare_cached(
                "INSERT OR IGNORE INTO `mailbox_first_unseen` \
                 (`mailbox_id`, `uid`) VALUES (?, ?)",
            )?
            .execute((mailbox_id, uid))?;
        Ok(())
    }

    /// Clears the first-unseen pointer if it is held by `uid`.
    fn clear_first_unseen(
        &self,
        mailbox_id: MailboxId,
        uid: Uid,
    ) -> Result<(), Error> {
        self.cxn
            .prepare_cached(
                "DELETE FROM `mailbox_first_unseen` \
                 WHERE `mailbox_id` = ? AND `uid` = ?",
            )?
            .execute((mailbox_id, uid))?;
        Ok(())
    }

    fn extend_applicable_flags(
        &self,
        mailbox_id: MailboxId,
        flags: &Flags,
    ) -> Result<(), Error> {
        let mut stmt = self.cxn.prepare_cached(
            "INSERT OR IGNORE INTO `mailbox_applicable_flags` \
             (`mailbox_id`, `flag`) VALUES (?, ?)",
        )?;
        for flag in flags.applicable() {
            stmt.execute((mailbox_id, flag))?;
        }
        Ok(())
    }
}
