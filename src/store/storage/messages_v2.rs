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

//! The current message record store.
//!
//! A V2 record holds a reference to the full content of the message in the
//! blob store plus the offset at which the body starts. Saving the same
//! record twice produces the same row, since blob IDs are derived from the
//! content.

use std::io::Read;

use rusqlite::OptionalExtension as _;

use super::{connection::Connection, types::*};
use crate::{store::model::*, support::error::Error};

impl Connection {
    /// Saves `record`, which must have been loaded at full depth.
    ///
    /// The content is written to the blob store before the record row, so the
    /// row never refers to a blob that does not exist yet. Any existing record
    /// for the same message in the same mailbox is replaced.
    pub fn save_message_v2(&self, record: &MessageRecord) -> Result<(), Error> {
        let content = full_content(record)?;
        let blob_id = self.save_blob(&content[..])?;
        self.insert_message_v2(record, &blob_id, content.len())
    }

    /// Rewrites the V1 record of the message `record` was loaded from into
    /// V2, deleting the V1 record.
    ///
    /// This only happens if the V1 record still exists. Otherwise, the message
    /// has been expunged or migrated by someone else since `record` was
    /// loaded, nothing is written, and false is returned.
    pub fn migrate_message_v1(
        &self,
        record: &MessageRecord,
    ) -> Result<bool, Error> {
        let content = full_content(record)?;
        self.with_write_lock(|| {
            if !self
                .delete_message_v1(record.id.mailbox_id, record.id.message_id)?
            {
                return Ok(false);
            }

            let blob_id = self.save_blob(&content[..])?;
            self.insert_message_v2(record, &blob_id, content.len())?;
            Ok(true)
        })
    }

    fn insert_message_v2(
        &self,
        record: &MessageRecord,
        blob_id: &BlobId,
        size: usize,
    ) -> Result<(), Error> {
        self.cxn
            .prepare_cached(
                "INSERT OR REPLACE INTO `messages_v2` (\
                   `mailbox_id`, `message_id`, `uid`, `internal_date`, \
                   `blob_id`, `body_start`, `size`, `attachments`\
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute((
                record.id.mailbox_id,
                record.id.message_id,
                record.id.uid,
                UnixMillis(record.internal_date),
                blob_id,
                record.body_start,
                size as u64,
                Cbor(&record.attachments),
            ))?;
        Ok(())
    }

    /// Retrieves the V2 record of one message, if it exists.
    ///
    /// Only the chunks needed for `depth` are read: none for `Metadata`, the
    /// chunks covering the header for `Headers`, and everything otherwise.
    pub fn retrieve_message_v2(
        &self,
        id: &ComposedMessageId,
        depth: FetchDepth,
    ) -> Result<Option<MessageRecord>, Error> {
        let Some(row) = self
            .cxn
            .prepare_cached(
                "SELECT * FROM `messages_v2` \
                 WHERE `mailbox_id` = ? AND `message_id` = ?",
            )?
            .query_row((id.mailbox_id, id.message_id), from_row)
            .optional()?
        else {
            return Ok(None);
        };

        self.load_v2(row, depth).map(Some)
    }

    /// Retrieves the V2 records of the given messages.
    ///
    /// Messages with no V2 record are silently skipped.
    pub fn retrieve_messages_v2(
        &self,
        ids: &[ComposedMessageId],
        depth: FetchDepth,
    ) -> Result<Vec<MessageRecord>, Error> {
        let mut ret = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.retrieve_message_v2(id, depth)? {
                ret.push(record);
            }
        }
        Ok(ret)
    }

    /// Invokes `receiver` with every V2 record, loaded at `depth`.
    pub fn scan_all_messages_v2(
        &self,
        depth: FetchDepth,
        receiver: &mut dyn FnMut(MessageRecord) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let mut stmt = self.cxn.prepare("SELECT * FROM `messages_v2`")?;
        let mut rows = stmt.query(())?;
        while let Some(row) = rows.next()? {
            receiver(self.load_v2(MessageV2Row::from_row(row)?, depth)?)?;
        }
        Ok(())
    }

    /// Deletes the V2 record of the given message, if there is one.
    ///
    /// The chunks of the content are left in place.
    pub fn delete_message_v2(
        &self,
        mailbox_id: MailboxId,
        message_id: MessageId,
    ) -> Result<(), Error> {
        self.cxn
            .prepare_cached(
                "DELETE FROM `messages_v2` \
                 WHERE `mailbox_id` = ? AND `message_id` = ?",
            )?
            .execute((mailbox_id, message_id))?;
        Ok(())
    }

    pub fn count_messages_v2(&self) -> Result<u64, Error> {
        self.cxn
            .prepare_cached("SELECT COUNT(*) FROM `messages_v2`")?
            .query_row((), from_single::<u64>)
            .map_err(Into::into)
    }

    fn load_v2(
        &self,
        row: MessageV2Row,
        depth: FetchDepth,
    ) -> Result<MessageRecord, Error> {
        let body_start = row.body_start.min(row.size) as usize;
        let (header, body) = match depth {
            FetchDepth::Metadata => (None, None),

            FetchDepth::Headers => {
                let mut header = Vec::with_capacity(body_start);
                self.read_blob(&row.blob_id)?
                    .into_reader()
                    .take(body_start as u64)
                    .read_to_end(&mut header)?;
                if header.len() != body_start {
                    return Err(Error::CorruptRecord("truncated message blob"));
                }
                (Some(header), None)
            },

            FetchDepth::Body | FetchDepth::Full => {
                let mut content = self.read_blob_fully(&row.blob_id)?;
                if content.len() as u64 != row.size {
                    return Err(Error::CorruptRecord("truncated message blob"));
                }

                let body = content.split_off(body_start);
                let header = if depth.wants_header() {
                    Some(content)
                } else {
                    None
                };
                (header, Some(body))
            },
        };

        Ok(MessageRecord {
            id: row.id,
            internal_date: row.internal_date,
            body_start: row.body_start,
            size: row.size,
            header,
            body,
            attachments: row.attachments,
        })
    }
}

fn full_content(record: &MessageRecord) -> Result<Vec<u8>, Error> {
    record
        .content()
        .ok_or(Error::CorruptRecord("partial message record"))
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::super::connection::test_support::{sample_record, Fixture};
    use super::*;
    use crate::support::system_config::StoreConfig;

    fn raw_rows(fixture: &Fixture) -> Vec<(String, String, i64, Vec<u8>)> {
        fixture
            .cxn
            .cxn
            .prepare(
                "SELECT `message_id`, `blob_id`, `size`, `attachments` \
                 FROM `messages_v2` ORDER BY `message_id`",
            )
            .unwrap()
            .query_map((), from_row)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn v2_crud_at_every_depth() {
        let mut config = StoreConfig::default();
        config.blob.chunk_size = 4;
        let fixture = Fixture::with_config(config);

        let record = sample_record(7);
        fixture.cxn.save_message_v2(&record).unwrap();

        for depth in [
            FetchDepth::Metadata,
            FetchDepth::Headers,
            FetchDepth::Body,
            FetchDepth::Full,
        ] {
            assert_eq!(
                Some(record.clone().at_depth(depth)),
                fixture.cxn.retrieve_message_v2(&record.id, depth).unwrap(),
                "depth {:?}",
                depth,
            );
        }

        let absent = sample_record(8);
        assert_eq!(
            1,
            fixture
                .cxn
                .retrieve_messages_v2(&[absent.id, record.id], FetchDepth::Full)
                .unwrap()
                .len()
        );

        fixture
            .cxn
            .delete_message_v2(record.id.mailbox_id, record.id.message_id)
            .unwrap();
        assert_eq!(
            None,
            fixture
                .cxn
                .retrieve_message_v2(&record.id, FetchDepth::Metadata)
                .unwrap()
        );
    }

    #[test]
    fn saving_twice_is_idempotent() {
        let fixture = Fixture::new();
        let record = sample_record(1);

        fixture.cxn.save_message_v2(&record).unwrap();
        let once = raw_rows(&fixture);
        fixture.cxn.save_message_v2(&record).unwrap();
        let twice = raw_rows(&fixture);

        assert_eq!(1, once.len());
        assert_eq!(once, twice);
        assert_eq!(
            Some(record.clone()),
            fixture
                .cxn
                .retrieve_message_v2(&record.id, FetchDepth::Full)
                .unwrap()
        );
    }

    #[test]
    fn resaving_content_under_other_chunk_size() {
        let mut config = StoreConfig::default();
        config.blob.chunk_size = 4;
        let fixture = Fixture::with_config(config);

        let record = sample_record(1);
        fixture.cxn.save_message_v2(&record).unwrap();

        // Another message with the same content, saved by a connection with
        // the default chunk size
        let copy = sample_record(1);
        assert_eq!(record.content(), copy.content());
        let other = Connection::new(
            &fixture.path(),
            Arc::new(StoreConfig::default()),
        )
        .unwrap();
        other.save_message_v2(&copy).unwrap();

        for id in [&record.id, &copy.id] {
            assert_eq!(
                record.content(),
                fixture
                    .cxn
                    .retrieve_message_v2(id, FetchDepth::Full)
                    .unwrap()
                    .unwrap()
                    .content()
            );
        }
    }

    #[test]
    fn migrating_v1_record() {
        let fixture = Fixture::new();
        let record = sample_record(1);
        fixture.cxn.save_message_v1(&record).unwrap();

        assert!(fixture.cxn.migrate_message_v1(&record).unwrap());
        assert_eq!(0, fixture.cxn.count_messages_v1().unwrap());
        assert_eq!(
            Some(record.clone()),
            fixture
                .cxn
                .retrieve_message_v2(&record.id, FetchDepth::Full)
                .unwrap()
        );

        // Already done
        assert!(!fixture.cxn.migrate_message_v1(&record).unwrap());
        assert_eq!(1, fixture.cxn.count_messages_v2().unwrap());

        // Gone from V1 without ever reaching V2
        let expunged = sample_record(2);
        fixture.cxn.save_message_v1(&expunged).unwrap();
        fixture
            .cxn
            .delete_message_v1(expunged.id.mailbox_id, expunged.id.message_id)
            .unwrap();
        assert!(!fixture.cxn.migrate_message_v1(&expunged).unwrap());
        assert_eq!(
            None,
            fixture
                .cxn
                .retrieve_message_v2(&expunged.id, FetchDepth::Metadata)
                .unwrap()
        );

        assert_matches!(
            Err(Error::CorruptRecord(_)),
            fixture
                .cxn
                .migrate_message_v1(&record.clone().at_depth(FetchDepth::Body))
        );
    }

    #[test]
    fn truncated_blob_is_reported() {
        let fixture = Fixture::new();
        let record = sample_record(1);
        fixture.cxn.save_message_v2(&record).unwrap();
        fixture.cxn.cxn.execute("DELETE FROM `blobs`", ()).unwrap();

        assert_matches!(
            Err(Error::CorruptRecord(_)),
            fixture.cxn.retrieve_message_v2(&record.id, FetchDepth::Full)
        );
        assert_matches!(
            Err(Error::CorruptRecord(_)),
            fixture.cxn.retrieve_message_v2(&record.id, FetchDepth::Headers)
        );
        // Metadata never touches the blob
        assert!(fixture
            .cxn
            .retrieve_message_v2(&record.id, FetchDepth::Metadata)
            .unwrap()
            .is_some());
    }

    #[test]
    fn scan_all_v2() {
        let fixture = Fixture::new();
        for uid in 1..=3 {
            fixture.cxn.save_message_v2(&sample_record(uid)).unwrap();
        }

        let mut count = 0;
        fixture
            .cxn
            .scan_all_messages_v2(FetchDepth::Full, &mut |record| {
                assert!(record.content().is_some());
                count += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(3, count);
        assert_eq!(3, fixture.cxn.count_messages_v2().unwrap());
    }
}
