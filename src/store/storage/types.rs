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

//! Bindings for our model types to `rusqlite`.

use std::str::FromStr;

use chrono::prelude::*;
use rusqlite::types::{
    FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::store::model::*;

macro_rules! hex_id_sql {
    ($t:ident) => {
        impl ToSql for $t {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.to_string()))
            }
        }

        impl FromSql for $t {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                Self::from_str(s).map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

hex_id_sql!(MailboxId);
hex_id_sql!(MessageId);
hex_id_sql!(ChunkId);

impl ToSql for BlobId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(ValueRef::Text(self.0.as_bytes())))
    }
}

impl FromSql for BlobId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        String::column_result(value).map(Self)
    }
}

impl ToSql for Uid {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        // Uid::MAX is i64::MAX, so this never wraps.
        Ok(ToSqlOutput::from(self.get() as i64))
    }
}

impl FromSql for Uid {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let inner = i64::column_result(value)?;
        u64::try_from(inner)
            .ok()
            .and_then(Self::of)
            .ok_or(FromSqlError::OutOfRange(inner))
    }
}

impl ToSql for Modseq {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.raw() as i64))
    }
}

impl FromSql for Modseq {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let inner = i64::column_result(value)?;
        u64::try_from(inner)
            .ok()
            .and_then(Self::of)
            .ok_or(FromSqlError::OutOfRange(inner))
    }
}

impl ToSql for Flag {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for Flag {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let as_str = value.as_str()?;
        Self::from_str(as_str).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for SystemFlags {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(i64::from(self.bits())))
    }
}

impl FromSql for SystemFlags {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let inner = i64::column_result(value)?;
        u32::try_from(inner)
            .ok()
            .and_then(SystemFlags::from_bits)
            .ok_or(FromSqlError::OutOfRange(inner))
    }
}

/// A timestamp stored as milliseconds since the UNIX epoch.
///
/// Sub-millisecond precision is discarded on the way in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnixMillis(pub DateTime<Utc>);

impl ToSql for UnixMillis {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.timestamp_millis()))
    }
}

impl FromSql for UnixMillis {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let inner = i64::column_result(value)?;
        Utc.timestamp_millis_opt(inner)
            .single()
            .ok_or(FromSqlError::OutOfRange(inner))
            .map(Self)
    }
}

/// Keywords are stored as a single space-separated string. Keywords are
/// atoms, so they never contain spaces themselves.
pub struct Keywords<'a>(pub &'a std::collections::BTreeSet<String>);

impl ToSql for Keywords<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let mut s = String::new();
        for kw in self.0 {
            if !s.is_empty() {
                s.push(' ');
            }
            s.push_str(kw);
        }
        Ok(ToSqlOutput::from(s))
    }
}

pub fn parse_keywords(s: &str) -> std::collections::BTreeSet<String> {
    s.split(' ')
        .filter(|kw| !kw.is_empty())
        .map(str::to_owned)
        .collect()
}

/// A value stored as a CBOR blob.
pub struct Cbor<T>(pub T);

impl<T: Serialize> ToSql for Cbor<T> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        serde_cbor::to_vec(&self.0)
            .map(ToSqlOutput::from)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
    }
}

impl<T: DeserializeOwned> FromSql for Cbor<T> {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let bytes = value.as_blob()?;
        serde_cbor::from_slice(bytes)
            .map(Self)
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

pub fn from_row<T: FromRow>(row: &rusqlite::Row<'_>) -> rusqlite::Result<T> {
    T::from_row(row)
}

pub fn from_single<T: FromSql>(row: &rusqlite::Row<'_>) -> rusqlite::Result<T> {
    row.get(0)
}

pub trait FromRow: Sized {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self>;
}

macro_rules! from_row_tuple {
    ($($ix:tt: $t:ident),*) => {
        impl<$($t: FromSql,)*> FromRow
        for ($($t,)*) {
            fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
                Ok(($(row.get($ix)?,)*))
            }
        }
    }
}

from_row_tuple!(0: A);
from_row_tuple!(0: A, 1: B);
from_row_tuple!(0: A, 1: B, 2: C);
from_row_tuple!(0: A, 1: B, 2: C, 3: D);

impl FromRow for MailboxCounters {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            total: row.get("total_count")?,
            unseen: row.get("unseen_count")?,
        })
    }
}

impl FromRow for ComposedMessageId {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            mailbox_id: row.get("mailbox_id")?,
            message_id: row.get("message_id")?,
            uid: row.get("uid")?,
        })
    }
}

/// Reads a V1 record. `header` and `body` may be `NULL` if the query did not
/// select them.
impl FromRow for MessageRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: ComposedMessageId::from_row(row)?,
            internal_date: row.get::<_, UnixMillis>("internal_date")?.0,
            body_start: row.get("body_start")?,
            size: row.get("size")?,
            header: row.get("header")?,
            body: row.get("body")?,
            attachments: row
                .get::<_, Cbor<Vec<AttachmentRef>>>("attachments")?
                .0,
        })
    }
}

/// A row of `messages_v2`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageV2Row {
    pub id: ComposedMessageId,
    pub internal_date: DateTime<Utc>,
    pub blob_id: BlobId,
    pub body_start: u64,
    pub size: u64,
    pub attachments: Vec<AttachmentRef>,
}

impl FromRow for MessageV2Row {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: ComposedMessageId::from_row(row)?,
            internal_date: row.get::<_, UnixMillis>("internal_date")?.0,
            blob_id: row.get("blob_id")?,
            body_start: row.get("body_start")?,
            size: row.get("size")?,
            attachments: row
                .get::<_, Cbor<Vec<AttachmentRef>>>("attachments")?
                .0,
        })
    }
}
