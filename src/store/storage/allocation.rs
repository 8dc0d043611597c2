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

//! UID and modseq allocation.
//!
//! Each mailbox has one counter row per sequence holding the last value
//! handed out. Allocation reads the counter and then advances it with an
//! update predicated on the value read; if another connection advanced it in
//! between, the update matches no row and the whole thing is retried. The
//! first allocation in a mailbox creates the row with a conditional insert
//! instead.
//!
//! Since a value is only returned once the conditional write which claimed it
//! has succeeded, the values handed out for a mailbox form a gap-free
//! sequence regardless of how many writers contend.

use rusqlite::OptionalExtension as _;

use super::{connection::Connection, types::*};
use crate::{
    store::model::*,
    support::{
        error::Error,
        retry::{with_bounded_attempts, Attempt},
    },
};

/// Describes one of the per-mailbox counter tables.
struct Counter {
    select: &'static str,
    insert: &'static str,
    update: &'static str,
}

static UID_COUNTER: Counter = Counter {
    select: "SELECT `last_uid` FROM `uid_counter` WHERE `mailbox_id` = ?",
    insert: "INSERT OR IGNORE INTO `uid_counter` (`mailbox_id`, `last_uid`) \
             VALUES (?, 1)",
    update: "UPDATE `uid_counter` SET `last_uid` = ?3 \
             WHERE `mailbox_id` = ?1 AND `last_uid` = ?2",
};

static MODSEQ_COUNTER: Counter = Counter {
    select: "SELECT `last_modseq` FROM `modseq_counter` \
             WHERE `mailbox_id` = ?",
    insert: "INSERT OR IGNORE INTO `modseq_counter` \
             (`mailbox_id`, `last_modseq`) VALUES (?, 1)",
    update: "UPDATE `modseq_counter` SET `last_modseq` = ?3 \
             WHERE `mailbox_id` = ?1 AND `last_modseq` = ?2",
};

impl Connection {
    /// Allocates the next UID in the given mailbox.
    pub fn next_uid(&self, mailbox_id: MailboxId) -> Result<Uid, Error> {
        let raw = self.allocate(&UID_COUNTER, mailbox_id)?;
        Uid::of(raw).ok_or(Error::MailboxFull)
    }

    /// Allocates the next modseq in the given mailbox.
    pub fn next_modseq(&self, mailbox_id: MailboxId) -> Result<Modseq, Error> {
        let raw = self.allocate(&MODSEQ_COUNTER, mailbox_id)?;
        Modseq::of(raw).ok_or(Error::MailboxFull)
    }

    /// Returns the last UID allocated in the given mailbox, if any.
    pub fn last_uid(&self, mailbox_id: MailboxId) -> Result<Option<Uid>, Error> {
        self.cxn
            .prepare_cached(UID_COUNTER.select)?
            .query_row((mailbox_id,), from_single)
            .optional()
            .map_err(Into::into)
    }

    /// Returns the last modseq allocated in the given mailbox, if any.
    pub fn last_modseq(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<Option<Modseq>, Error> {
        self.cxn
            .prepare_cached(MODSEQ_COUNTER.select)?
            .query_row((mailbox_id,), from_single)
            .optional()
            .map_err(Into::into)
    }

    /// Removes the counters of a deleted mailbox.
    pub(super) fn delete_counters(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<(), Error> {
        self.cxn
            .prepare_cached("DELETE FROM `uid_counter` WHERE `mailbox_id` = ?")?
            .execute((mailbox_id,))?;
        self.cxn
            .prepare_cached(
                "DELETE FROM `modseq_counter` WHERE `mailbox_id` = ?",
            )?
            .execute((mailbox_id,))?;
        Ok(())
    }

    fn allocate(
        &self,
        counter: &Counter,
        mailbox_id: MailboxId,
    ) -> Result<u64, Error> {
        with_bounded_attempts(self.config.allocation.max_attempts, || {
            let current = self
                .cxn
                .prepare_cached(counter.select)?
                .query_row((mailbox_id,), from_single::<i64>)
                .optional()?;

            match current {
                None => {
                    let inserted = self
                        .cxn
                        .prepare_cached(counter.insert)?
                        .execute((mailbox_id,))?;
                    Ok(if 1 == inserted {
                        Attempt::Done(1)
                    } else {
                        Attempt::Conflict
                    })
                },

                Some(current) => {
                    if current >= i64::MAX {
                        return Err(Error::MailboxFull);
                    }

                    let next = current + 1;
                    let updated = self
                        .cxn
                        .prepare_cached(counter.update)?
                        .execute((mailbox_id, current, next))?;
                    Ok(if 1 == updated {
                        Attempt::Done(next as u64)
                    } else {
                        Attempt::Conflict
                    })
                },
            }
        })
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use rayon::prelude::*;

    use super::super::connection::test_support::Fixture;
    use super::*;
    use crate::support::system_config::StoreConfig;

    #[test]
    fn sequential_allocation() {
        let fixture = Fixture::new();
        let a = MailboxId::generate();
        let b = MailboxId::generate();

        assert_eq!(None, fixture.cxn.last_uid(a).unwrap());
        assert_eq!(Uid::u(1), fixture.cxn.next_uid(a).unwrap());
        assert_eq!(Uid::u(2), fixture.cxn.next_uid(a).unwrap());
        assert_eq!(Uid::u(1), fixture.cxn.next_uid(b).unwrap());
        assert_eq!(Some(Uid::u(2)), fixture.cxn.last_uid(a).unwrap());

        // The sequences are independent of each other
        assert_eq!(Modseq::u(1), fixture.cxn.next_modseq(a).unwrap());
        assert_eq!(Modseq::u(2), fixture.cxn.next_modseq(a).unwrap());
        assert_eq!(Uid::u(3), fixture.cxn.next_uid(a).unwrap());
        assert_eq!(Some(Modseq::u(2)), fixture.cxn.last_modseq(a).unwrap());
    }

    #[test]
    fn concurrent_allocation_is_gap_free() {
        const CALLERS: usize = 8;
        const PER_CALLER: usize = 25;

        let mut config = StoreConfig::default();
        config.allocation.max_attempts = 10_000;
        let fixture = Fixture::with_config(config);
        let path = fixture.path();
        let config = Arc::clone(&fixture.cxn.config);
        let mailbox_id = MailboxId::generate();

        let (uids, modseqs): (Vec<Vec<Uid>>, Vec<Vec<Modseq>>) = (0..CALLERS)
            .into_par_iter()
            .map(|_| {
                // Each caller has its own connection, as separate processes
                // would.
                let cxn =
                    Connection::new(&path, Arc::clone(&config)).unwrap();
                let mut uids = Vec::new();
                let mut modseqs = Vec::new();
                for _ in 0..PER_CALLER {
                    uids.push(cxn.next_uid(mailbox_id).unwrap());
                    modseqs.push(cxn.next_modseq(mailbox_id).unwrap());
                }
                (uids, modseqs)
            })
            .unzip();

        for caller in &uids {
            assert!(caller.windows(2).all(|w| w[0] < w[1]));
        }
        for caller in &modseqs {
            assert!(caller.windows(2).all(|w| w[0] < w[1]));
        }

        let all_uids = uids
            .into_iter()
            .flatten()
            .map(Uid::get)
            .collect::<BTreeSet<_>>();
        let all_modseqs = modseqs
            .into_iter()
            .flatten()
            .map(Modseq::raw)
            .collect::<BTreeSet<_>>();

        let expected =
            (1..=(CALLERS * PER_CALLER) as u64).collect::<BTreeSet<_>>();
        assert_eq!(expected, all_uids);
        assert_eq!(expected, all_modseqs);
    }

    #[test]
    fn exhaustion_is_fatal() {
        let mut config = StoreConfig::default();
        config.allocation.max_attempts = 0;
        let fixture = Fixture::with_config(config);

        assert_matches!(
            Err(Error::AllocationExhausted(0)),
            fixture.cxn.next_uid(MailboxId::generate())
        );
    }
}
