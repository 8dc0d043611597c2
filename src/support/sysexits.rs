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

//! Exit codes from `sysexits.h`, as used by the command-line tools.

use super::error::Error;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Sysexit(pub i32);

pub const EX_USAGE: Sysexit = Sysexit(64);
pub const EX_NOINPUT: Sysexit = Sysexit(66);
pub const EX_UNAVAILABLE: Sysexit = Sysexit(69);
pub const EX_SOFTWARE: Sysexit = Sysexit(70);
pub const EX_IOERR: Sysexit = Sysexit(74);
pub const EX_TEMPFAIL: Sysexit = Sysexit(75);
pub const EX_CONFIG: Sysexit = Sysexit(78);

impl Sysexit {
    pub fn exit(self) -> ! {
        std::process::exit(self.0)
    }

    /// The exit code for a tool which failed with `error`.
    pub fn for_error(error: &Error) -> Self {
        match *error {
            Error::StorageUnavailable | Error::AllocationExhausted(_) => {
                EX_TEMPFAIL
            },
            Error::Io(_) => EX_IOERR,
            Error::Config(_) => EX_CONFIG,
            Error::Sqlite(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error {
                    code: rusqlite::ErrorCode::CannotOpen,
                    ..
                },
                _,
            )) => EX_NOINPUT,
            Error::Sqlite(_) => EX_UNAVAILABLE,
            _ => EX_SOFTWARE,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transient_errors_are_tempfail() {
        assert_eq!(EX_TEMPFAIL, Sysexit::for_error(&Error::StorageUnavailable));
        assert_eq!(
            EX_TEMPFAIL,
            Sysexit::for_error(&Error::AllocationExhausted(3))
        );
        assert_eq!(EX_SOFTWARE, Sysexit::for_error(&Error::NxMailbox));
    }

    #[test]
    fn unopenable_database_is_noinput() {
        let cant_open = Error::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
            None,
        ));
        assert_eq!(EX_NOINPUT, Sysexit::for_error(&cant_open));

        let other = Error::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CORRUPT),
            None,
        ));
        assert_eq!(EX_UNAVAILABLE, Sysexit::for_error(&other));
    }
}
