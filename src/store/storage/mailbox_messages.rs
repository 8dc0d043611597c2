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

//! The current state of the messages in each mailbox.
//!
//! `mailbox_messages` holds one row per message per mailbox with its UID,
//! modseq and flags. The operations here tie the other tables together:
//! appending allocates a UID and modseq, saves the V2 record and folds the
//! new message into the indexes; flag changes and expunges do likewise.

use chrono::prelude::*;
use rusqlite::OptionalExtension as _;

use super::{connection::Connection, types::*};
use crate::{
    store::model::*,
    support::{
        error::Error,
        retry::{with_bounded_attempts, Attempt},
    },
};

impl FromRow for MessageState {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: ComposedMessageId::from_row(row)?,
            modseq: row.get("modseq")?,
            flags: Flags {
                system: row.get("system_flags")?,
                keywords: parse_keywords(&row.get::<_, String>("keywords")?),
            },
        })
    }
}

impl Connection {
    /// Appends a new message to the given mailbox.
    ///
    /// `body_start` is the length of the header within `content`.
    pub fn append_message(
        &self,
        mailbox_id: MailboxId,
        internal_date: DateTime<Utc>,
        content: &[u8],
        body_start: usize,
        attachments: Vec<AttachmentRef>,
        mut flags: Flags,
    ) -> Result<MessageState, Error> {
        flags.system.remove(SystemFlags::USER);

        let uid = self.next_uid(mailbox_id)?;
        let modseq = self.next_modseq(mailbox_id)?;
        let id = ComposedMessageId {
            mailbox_id,
            message_id: MessageId::generate(),
            uid,
        };

        self.save_message_v2(&MessageRecord::new(
            id,
            internal_date,
            content,
            body_start,
            attachments,
        ))?;

        self.cxn
            .prepare_cached(
                "INSERT INTO `mailbox_messages` (\
                   `mailbox_id`, `uid`, `message_id`, `modseq`, \
                   `system_flags`, `keywords`\
                 ) VALUES (?, ?, ?, ?, ?, ?)",
            )?
            .execute((
                id.mailbox_id,
                id.uid,
                id.message_id,
                modseq,
                flags.system,
                Keywords(&flags.keywords),
            ))?;

        let state = MessageState { id, modseq, flags };
        self.index_on_add(&state)?;
        Ok(state)
    }

    /// Returns the current state of the message with the given UID.
    pub fn message_state(
        &self,
        mailbox_id: MailboxId,
        uid: Uid,
    ) -> Result<MessageState, Error> {
        self.cxn
            .prepare_cached(
                "SELECT * FROM `mailbox_messages` \
                 WHERE `mailbox_id` = ? AND `uid` = ?",
            )?
            .query_row((mailbox_id, uid), from_row)
            .optional()?
            .ok_or(Error::NxMessage)
    }

    /// Returns the state of every message in the given mailbox, by ascending
    /// UID.
    pub fn list_messages(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<Vec<MessageState>, Error> {
        self.cxn
            .prepare_cached(
                "SELECT * FROM `mailbox_messages` WHERE `mailbox_id` = ? \
                 ORDER BY `uid`",
            )?
            .query_map((mailbox_id,), from_row)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Applies `update` to the flags of one message, stamping it with a new
    /// modseq.
    ///
    /// The row is rewritten with an update predicated on the modseq that was
    /// read, so a concurrent change causes this one to be recomputed on top
    /// of it.
    pub fn set_flags(
        &self,
        mailbox_id: MailboxId,
        uid: Uid,
        update: &FlagsUpdate,
    ) -> Result<UpdatedFlags, Error> {
        let mut update = update.clone();
        update.flags.system.remove(SystemFlags::USER);

        let updated =
            with_bounded_attempts(self.config.allocation.max_attempts, || {
                let current = self.message_state(mailbox_id, uid)?;
                let modseq = self.next_modseq(mailbox_id)?;
                let (new_state, updated) =
                    current.with_flags_update(&update, modseq);

                let written = self
                    .cxn
                    .prepare_cached(
                        "UPDATE `mailbox_messages` \
                         SET `modseq` = ?, `system_flags` = ?, `keywords` = ? \
                         WHERE `mailbox_id` = ? AND `uid` = ? AND `modseq` = ?",
                    )?
                    .execute((
                        new_state.modseq,
                        new_state.flags.system,
                        Keywords(&new_state.flags.keywords),
                        mailbox_id,
                        uid,
                        current.modseq,
                    ))?;

                Ok(if 1 == written {
                    Attempt::Done(updated)
                } else {
                    Attempt::Conflict
                })
            })?;

        self.index_on_flags_update(mailbox_id, &updated)?;
        Ok(updated)
    }

    /// Removes one message from its mailbox, returning the state it had.
    pub fn expunge(
        &self,
        mailbox_id: MailboxId,
        uid: Uid,
    ) -> Result<MessageState, Error> {
        let state = self.message_state(mailbox_id, uid)?;
        let deleted = self
            .cxn
            .prepare_cached(
                "DELETE FROM `mailbox_messages` \
                 WHERE `mailbox_id` = ? AND `uid` = ?",
            )?
            .execute((mailbox_id, uid))?;
        if 0 == deleted {
            // Someone else got there first and has already updated the
            // indexes.
            return Err(Error::NxMessage);
        }

        // V1 first: once it is gone, a pending migration of this message
        // cannot write a V2 record any more.
        self.delete_message_v1(mailbox_id, state.id.message_id)?;
        self.delete_message_v2(mailbox_id, state.id.message_id)?;
        self.index_on_delete(&state)?;
        Ok(state)
    }

    /// Removes every message row and record of a deleted mailbox.
    pub(super) fn delete_mailbox_messages(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<(), Error> {
        for table in ["mailbox_messages", "messages_v2", "messages_v1"] {
            self.cxn
                .prepare_cached(&format!(
                    "DELETE FROM `{table}` WHERE `mailbox_id` = ?"
                ))?
                .execute((mailbox_id,))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::super::connection::test_support::Fixture;
    use super::*;

    fn append(cxn: &Connection, mailbox_id: MailboxId, flags: Flags) -> MessageState {
        cxn.append_message(
            mailbox_id,
            Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
            b"Subject: hi\r\n\r\nHello",
            15,
            vec![],
            flags,
        )
        .unwrap()
    }

    #[test]
    fn append_assigns_ids_and_indexes() {
        let fixture = Fixture::new();
        let cxn = &fixture.cxn;
        let mailbox_id = MailboxId::generate();

        let m1 = append(cxn, mailbox_id, Flags::of([Flag::Recent]));
        let m2 = append(
            cxn,
            mailbox_id,
            Flags::of([
                Flag::Seen,
                Flag::AnyUser,
                Flag::Keyword("$Important".to_owned()),
            ]),
        );

        assert_eq!(Uid::u(1), m1.id.uid);
        assert_eq!(Uid::u(2), m2.id.uid);
        assert!(m2.modseq > m1.modseq);
        assert!(!m2.flags.contains(&Flag::AnyUser));

        assert_eq!(m1, cxn.message_state(mailbox_id, Uid::u(1)).unwrap());
        assert_eq!(m2, cxn.message_state(mailbox_id, Uid::u(2)).unwrap());
        assert_eq!(vec![m1.clone(), m2.clone()], cxn.list_messages(mailbox_id).unwrap());

        let record = cxn
            .retrieve_message_v2(&m1.id, FetchDepth::Full)
            .unwrap()
            .unwrap();
        assert_eq!(
            b"Subject: hi\r\n\r\n".to_vec(),
            record.header.unwrap()
        );
        assert_eq!(b"Hello".to_vec(), record.body.unwrap());

        assert_eq!(
            MailboxCounters {
                total: 2,
                unseen: 1
            },
            cxn.counters(mailbox_id).unwrap()
        );
        assert_eq!(vec![Uid::u(1)], cxn.recent_uids(mailbox_id).unwrap());
        assert_eq!(Some(Uid::u(1)), cxn.first_unseen(mailbox_id).unwrap());
        assert_eq!(
            Flags::of([Flag::Seen, Flag::Keyword("$Important".to_owned())]),
            cxn.applicable_flags(mailbox_id).unwrap()
        );
    }

    #[test]
    fn set_flags_and_expunge() {
        let fixture = Fixture::new();
        let cxn = &fixture.cxn;
        let mailbox_id = MailboxId::generate();

        let m1 = append(cxn, mailbox_id, Flags::new());
        let m2 = append(cxn, mailbox_id, Flags::new());

        let updated = cxn
            .set_flags(
                mailbox_id,
                m1.id.uid,
                &FlagsUpdate::add(Flags::of([Flag::Seen, Flag::Deleted])),
            )
            .unwrap();
        assert_eq!(Some(true), updated.transition(SystemFlags::SEEN));
        assert!(updated.modseq > m2.modseq);

        let m1 = cxn.message_state(mailbox_id, m1.id.uid).unwrap();
        assert_eq!(updated.modseq, m1.modseq);
        assert_eq!(updated.new_flags, m1.flags);
        assert_eq!(
            MailboxCounters {
                total: 2,
                unseen: 1
            },
            cxn.counters(mailbox_id).unwrap()
        );
        // The pointer was held by m1; it is not moved on to m2
        assert_eq!(None, cxn.first_unseen(mailbox_id).unwrap());
        assert_eq!(
            Some(Uid::u(2)),
            cxn.recompute_first_unseen(mailbox_id).unwrap()
        );
        assert_eq!(Some(Uid::u(2)), cxn.first_unseen(mailbox_id).unwrap());

        let expunged = cxn.expunge(mailbox_id, m1.id.uid).unwrap();
        assert_eq!(m1, expunged);
        assert_matches!(
            Err(Error::NxMessage),
            cxn.message_state(mailbox_id, m1.id.uid)
        );
        assert_matches!(Err(Error::NxMessage), cxn.expunge(mailbox_id, m1.id.uid));
        assert_matches!(
            Err(Error::NxMessage),
            cxn.set_flags(mailbox_id, m1.id.uid, &FlagsUpdate::add(Flags::new()))
        );
        assert_eq!(
            None,
            cxn.retrieve_message_v2(&m1.id, FetchDepth::Metadata).unwrap()
        );
        assert_eq!(
            MailboxCounters {
                total: 1,
                unseen: 1
            },
            cxn.counters(mailbox_id).unwrap()
        );

        // UIDs are never reused
        let m3 = append(cxn, mailbox_id, Flags::new());
        assert_eq!(Uid::u(3), m3.id.uid);
    }

    #[test]
    fn recompute_with_everything_seen_clears_pointer() {
        let fixture = Fixture::new();
        let cxn = &fixture.cxn;
        let mailbox_id = MailboxId::generate();

        let m1 = append(cxn, mailbox_id, Flags::new());
        assert_eq!(Some(Uid::u(1)), cxn.first_unseen(mailbox_id).unwrap());

        // Mark everything seen without going through the indexes
        cxn.cxn
            .execute(
                "UPDATE `mailbox_messages` SET `system_flags` = ?",
                (SystemFlags::SEEN,),
            )
            .unwrap();
        assert_eq!(Some(m1.id.uid), cxn.first_unseen(mailbox_id).unwrap());

        assert_eq!(None, cxn.recompute_first_unseen(mailbox_id).unwrap());
        assert_eq!(None, cxn.first_unseen(mailbox_id).unwrap());
    }

    #[test]
    fn deleting_mailbox_removes_its_messages() {
        let fixture = Fixture::new();
        let cxn = &fixture.cxn;

        let mailbox = cxn
            .save_mailbox(&Mailbox::new(MailboxPath::private("alice", "INBOX")))
            .unwrap();
        let mailbox_id = mailbox.id.unwrap();
        let other = MailboxId::generate();

        append(cxn, mailbox_id, Flags::of([Flag::Recent]));
        append(cxn, other, Flags::new());

        cxn.delete_mailbox(&mailbox).unwrap();
        assert!(cxn.list_messages(mailbox_id).unwrap().is_empty());
        assert_eq!(None, cxn.last_uid(mailbox_id).unwrap());
        assert_eq!(
            MailboxCounters::default(),
            cxn.counters(mailbox_id).unwrap()
        );
        assert!(cxn.recent_uids(mailbox_id).unwrap().is_empty());
        assert_eq!(1, cxn.count_messages_v2().unwrap());
        assert_eq!(1, cxn.list_messages(other).unwrap().len());
    }
}
