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

//! Bounded retry of conditional writes.
//!
//! The only atomicity primitive the storage layer relies on is a single-row
//! conditional write. Operations which need read-modify-write semantics (UID
//! and modseq allocation) read the current value, attempt a conditional write
//! predicated on that value, and start over if another writer got there
//! first. `with_bounded_attempts` is the loop around that.

use std::thread;
use std::time::Duration;

use rand::Rng;

use super::error::Error;

/// The result of a single attempt of a conditional write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attempt<T> {
    /// The write was applied and produced this value.
    Done(T),
    /// Another writer changed the row between our read and our write.
    Conflict,
}

/// Runs `attempt` until it returns `Attempt::Done`, at most `max_attempts`
/// times.
///
/// Errors returned by `attempt` are propagated immediately. If every attempt
/// conflicts, fails with `Error::AllocationExhausted`; the caller must never
/// fall back to a value read during a failed attempt.
///
/// Between conflicting attempts, sleeps for a short random interval which
/// grows with the number of conflicts so that contending writers spread out.
pub fn with_bounded_attempts<T>(
    max_attempts: u32,
    mut attempt: impl FnMut() -> Result<Attempt<T>, Error>,
) -> Result<T, Error> {
    for n in 0..max_attempts {
        if let Attempt::Done(value) = attempt()? {
            return Ok(value);
        }

        if n + 1 < max_attempts {
            backoff(n);
        }
    }

    Err(Error::AllocationExhausted(max_attempts))
}

fn backoff(conflicts: u32) {
    let ceiling = 20u64 << conflicts.min(6);
    let micros = rand::thread_rng().gen_range(0, ceiling);
    thread::sleep(Duration::from_micros(micros));
}
