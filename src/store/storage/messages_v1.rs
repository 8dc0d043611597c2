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

//! The legacy message record store.
//!
//! V1 records carry the header and body inline on the message row. Nothing
//! writes new V1 records in normal operation; they are read through the
//! migration bridge and rewritten into V2.

use super::{connection::Connection, types::*};
use crate::{store::model::*, support::error::Error};

fn select_v1(depth: FetchDepth) -> String {
    format!(
        "SELECT `mailbox_id`, `message_id`, `uid`, `internal_date`, \
         `body_start`, length(`header`) + length(`body`) AS `size`, \
         {} AS `header`, {} AS `body`, `attachments` \
         FROM `messages_v1`",
        if depth.wants_header() { "`header`" } else { "NULL" },
        if depth.wants_body() { "`body`" } else { "NULL" },
    )
}

impl Connection {
    /// Saves `record`, which must have been loaded at full depth.
    ///
    /// Any existing record for the same message in the same mailbox is
    /// replaced.
    pub fn save_message_v1(&self, record: &MessageRecord) -> Result<(), Error> {
        let (Some(header), Some(body)) = (&record.header, &record.body) else {
            return Err(Error::CorruptRecord("partial message record"));
        };

        self.cxn
            .prepare_cached(
                "INSERT OR REPLACE INTO `messages_v1` (\
                   `mailbox_id`, `message_id`, `uid`, `internal_date`, \
                   `header`, `body`, `body_start`, `attachments`\
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute((
                record.id.mailbox_id,
                record.id.message_id,
                record.id.uid,
                UnixMillis(record.internal_date),
                header,
                body,
                record.body_start,
                Cbor(&record.attachments),
            ))?;
        Ok(())
    }

    /// Retrieves the V1 record of one message, if it exists.
    pub fn retrieve_message_v1(
        &self,
        id: &ComposedMessageId,
        depth: FetchDepth,
    ) -> Result<Option<MessageRecord>, Error> {
        use rusqlite::OptionalExtension as _;

        self.cxn
            .prepare_cached(&format!(
                "{} WHERE `mailbox_id` = ? AND `message_id` = ?",
                select_v1(depth),
            ))?
            .query_row((id.mailbox_id, id.message_id), from_row)
            .optional()
            .map_err(Into::into)
    }

    /// Retrieves the V1 records of the given messages.
    ///
    /// Messages with no V1 record are silently skipped.
    pub fn retrieve_messages_v1(
        &self,
        ids: &[ComposedMessageId],
        depth: FetchDepth,
    ) -> Result<Vec<MessageRecord>, Error> {
        let mut ret = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.retrieve_message_v1(id, depth)? {
                ret.push(record);
            }
        }
        Ok(ret)
    }

    /// Invokes `receiver` with every V1 record, loaded at full depth.
    ///
    /// Records are delivered in no particular order. If `receiver` fails, the
    /// scan stops and the error is returned.
    pub fn scan_all_messages_v1(
        &self,
        receiver: &mut dyn FnMut(MessageRecord) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let mut stmt = self.cxn.prepare(&select_v1(FetchDepth::Full))?;
        let mut rows = stmt.query(())?;
        while let Some(row) = rows.next()? {
            receiver(MessageRecord::from_row(row)?)?;
        }
        Ok(())
    }

    /// Deletes the V1 record of the given message, if there is one. Returns
    /// whether there was.
    pub fn delete_message_v1(
        &self,
        mailbox_id: MailboxId,
        message_id: MessageId,
    ) -> Result<bool, Error> {
        let deleted = self
            .cxn
            .prepare_cached(
                "DELETE FROM `messages_v1` \
                 WHERE `mailbox_id` = ? AND `message_id` = ?",
            )?
            .execute((mailbox_id, message_id))?;
        Ok(0 != deleted)
    }

    pub fn count_messages_v1(&self) -> Result<u64, Error> {
        self.cxn
            .prepare_cached("SELECT COUNT(*) FROM `messages_v1`")?
            .query_row((), from_single::<u64>)
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod test {
    use super::super::connection::test_support::{sample_record, Fixture};
    use super::*;

    #[test]
    fn v1_crud() {
        let fixture = Fixture::new();
        let record = sample_record(1);
        fixture.cxn.save_message_v1(&record).unwrap();

        assert_eq!(
            Some(record.clone()),
            fixture
                .cxn
                .retrieve_message_v1(&record.id, FetchDepth::Full)
                .unwrap()
        );

        for depth in
            [FetchDepth::Metadata, FetchDepth::Headers, FetchDepth::Body]
        {
            assert_eq!(
                Some(record.clone().at_depth(depth)),
                fixture.cxn.retrieve_message_v1(&record.id, depth).unwrap(),
                "depth {:?}",
                depth,
            );
        }

        let other = sample_record(2);
        assert_eq!(
            vec![record.clone().at_depth(FetchDepth::Metadata)],
            fixture
                .cxn
                .retrieve_messages_v1(
                    &[other.id, record.id],
                    FetchDepth::Metadata
                )
                .unwrap()
        );

        assert_eq!(1, fixture.cxn.count_messages_v1().unwrap());
        assert!(fixture
            .cxn
            .delete_message_v1(record.id.mailbox_id, record.id.message_id)
            .unwrap());
        assert!(!fixture
            .cxn
            .delete_message_v1(record.id.mailbox_id, record.id.message_id)
            .unwrap());
        assert_eq!(0, fixture.cxn.count_messages_v1().unwrap());
        assert_eq!(
            None,
            fixture
                .cxn
                .retrieve_message_v1(&record.id, FetchDepth::Full)
                .unwrap()
        );
    }

    #[test]
    fn partial_records_are_rejected() {
        let fixture = Fixture::new();
        let record = sample_record(1).at_depth(FetchDepth::Headers);
        assert_matches!(
            Err(Error::CorruptRecord(_)),
            fixture.cxn.save_message_v1(&record)
        );
    }

    #[test]
    fn scan_all_sees_everything() {
        let fixture = Fixture::new();
        let records = (1..=5).map(sample_record).collect::<Vec<_>>();
        for record in &records {
            fixture.cxn.save_message_v1(record).unwrap();
        }

        let mut scanned = Vec::new();
        fixture
            .cxn
            .scan_all_messages_v1(&mut |record| {
                scanned.push(record);
                Ok(())
            })
            .unwrap();
        scanned.sort_by_key(|r| r.id.uid);
        assert_eq!(records, scanned);
    }
}
