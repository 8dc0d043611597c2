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

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::num::NonZeroU64;
use std::str::FromStr;

use bitflags::bitflags;
use chrono::prelude::*;
use serde::{Deserialize, Serialize};

use crate::support::error::Error;

/// Generates a new 128-bit identifier which sorts by creation time.
///
/// The upper 48 bits are the milliseconds since the UNIX epoch; the rest is
/// random. Two identifiers generated in the same millisecond have no defined
/// order relative to each other.
fn time_ordered_id() -> u128 {
    let millis = Utc::now().timestamp_millis().max(0) as u128;
    let random = rand::random::<u128>() & ((1u128 << 80) - 1);
    (millis << 80) | random
}

macro_rules! time_ordered_id_type {
    ($(#[$meta:meta])* $t:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $t(pub u128);

        impl $t {
            pub fn generate() -> Self {
                Self(time_ordered_id())
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{:032x}", self.0)
            }
        }

        impl fmt::Debug for $t {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}({})", stringify!($t), self)
            }
        }

        impl FromStr for $t {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Error> {
                if 32 != s.len() {
                    return Err(Error::CorruptRecord(stringify!($t)));
                }

                u128::from_str_radix(s, 16)
                    .map(Self)
                    .map_err(|_| Error::CorruptRecord(stringify!($t)))
            }
        }
    };
}

time_ordered_id_type! {
    /// Identifies a mailbox for its entire lifetime, independent of its path.
    MailboxId
}

time_ordered_id_type! {
    /// Identifies the content of a message, independent of any mailbox it may
    /// be in.
    MessageId
}

time_ordered_id_type! {
    /// Identifies a single stored chunk of a blob.
    ///
    /// Chunk IDs are only discoverable through the index of the blob which
    /// owns them.
    ChunkId
}

/// Identifies a blob in the chunked blob store.
///
/// Blob IDs are the lowercase hex SHA3-256 of the blob content, so storing
/// the same content twice yields the same ID.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobId(pub String);

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BlobId({})", self.0)
    }
}

/// Uniquely identifies a message within a single mailbox.
///
/// UIDs start at 1 and increase monotonically as messages are added to the
/// mailbox. UIDs are never reused, even after the message they were assigned
/// to is expunged.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Uid(pub NonZeroU64);

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uid({})", self.0.get())
    }
}

impl Uid {
    // Unsafe because new() isn't const for some reason
    pub const MIN: Self = unsafe { Uid(NonZeroU64::new_unchecked(1)) };
    // The storage engine only has signed 64-bit integers.
    pub const MAX: Self =
        unsafe { Uid(NonZeroU64::new_unchecked(i64::MAX as u64)) };

    pub fn of(uid: u64) -> Option<Self> {
        NonZeroU64::new(uid).map(Uid).filter(|&u| u <= Uid::MAX)
    }

    pub fn next(self) -> Option<Self> {
        Uid::of(self.0.get() + 1)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }

    #[cfg(test)]
    pub fn u(uid: u64) -> Self {
        Uid::of(uid).unwrap()
    }
}

/// A modification sequence number.
///
/// Every insertion and every flag change in a mailbox is assigned a new
/// modseq, strictly greater than every modseq previously assigned in that
/// mailbox.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Modseq(NonZeroU64);

impl fmt::Debug for Modseq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Modseq({})", self.0.get())
    }
}

impl Modseq {
    pub const MIN: Self = unsafe { Modseq(NonZeroU64::new_unchecked(1)) };
    pub const MAX: Self =
        unsafe { Modseq(NonZeroU64::new_unchecked(i64::MAX as u64)) };

    pub fn of(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Modseq).filter(|&m| m <= Modseq::MAX)
    }

    pub fn next(self) -> Option<Self> {
        Modseq::of(self.0.get() + 1)
    }

    pub fn raw(self) -> u64 {
        self.0.get()
    }

    #[cfg(test)]
    pub fn u(raw: u64) -> Self {
        Modseq::of(raw).unwrap()
    }
}

/// Identifies one occurrence of a message within one mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComposedMessageId {
    pub mailbox_id: MailboxId,
    pub message_id: MessageId,
    pub uid: Uid,
}

bitflags! {
    /// The system flag vocabulary.
    ///
    /// `USER` is the "any user flag" marker, which indicates that clients may
    /// create arbitrary keywords. It is never stored on a message.
    #[derive(Default)]
    pub struct SystemFlags: u32 {
        const ANSWERED = 1 << 0;
        const DELETED = 1 << 1;
        const DRAFT = 1 << 2;
        const FLAGGED = 1 << 3;
        const RECENT = 1 << 4;
        const SEEN = 1 << 5;
        const USER = 1 << 6;
    }
}

/// A single message flag.
///
/// The `Display` format of this type is the exact string value that would be
/// sent over the wire. `FromStr` does the reverse conversion, and also
/// understands non-standard casing of the system flags.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Recent,
    Seen,
    AnyUser,
    Keyword(String),
}

impl Flag {
    fn as_system(&self) -> Option<SystemFlags> {
        match *self {
            Flag::Answered => Some(SystemFlags::ANSWERED),
            Flag::Deleted => Some(SystemFlags::DELETED),
            Flag::Draft => Some(SystemFlags::DRAFT),
            Flag::Flagged => Some(SystemFlags::FLAGGED),
            Flag::Recent => Some(SystemFlags::RECENT),
            Flag::Seen => Some(SystemFlags::SEEN),
            Flag::AnyUser => Some(SystemFlags::USER),
            Flag::Keyword(_) => None,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Recent => write!(f, "\\Recent"),
            Flag::Seen => write!(f, "\\Seen"),
            Flag::AnyUser => write!(f, "\\*"),
            Flag::Keyword(ref kw) => write!(f, "{}", kw),
        }
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <Flag as fmt::Display>::fmt(self, f)
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("\\answered") {
            Ok(Flag::Answered)
        } else if s.eq_ignore_ascii_case("\\deleted") {
            Ok(Flag::Deleted)
        } else if s.eq_ignore_ascii_case("\\draft") {
            Ok(Flag::Draft)
        } else if s.eq_ignore_ascii_case("\\flagged") {
            Ok(Flag::Flagged)
        } else if s.eq_ignore_ascii_case("\\recent") {
            Ok(Flag::Recent)
        } else if s.eq_ignore_ascii_case("\\seen") {
            Ok(Flag::Seen)
        } else if "\\*" == s {
            Ok(Flag::AnyUser)
        } else if !s.is_empty() && s.as_bytes().iter().copied().all(is_atom_char)
        {
            Ok(Flag::Keyword(s.to_owned()))
        } else {
            Err(Error::UnsafeName)
        }
    }
}

fn is_atom_char(ch: u8) -> bool {
    match ch {
        0..=b' ' => false,
        127..=255 => false,
        b'(' | b')' | b'{' | b'*' | b'%' | b'\\' | b'"' | b']' => false,
        _ => true,
    }
}

/// The full flag set of a message: system flags plus keywords.
///
/// Keywords are case-sensitive.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    pub system: SystemFlags,
    pub keywords: BTreeSet<String>,
}

impl Flags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of(flags: impl IntoIterator<Item = Flag>) -> Self {
        let mut this = Self::new();
        for flag in flags {
            this.insert(flag);
        }
        this
    }

    pub fn insert(&mut self, flag: Flag) {
        match flag.as_system() {
            Some(system) => self.system |= system,
            None => {
                if let Flag::Keyword(kw) = flag {
                    self.keywords.insert(kw);
                }
            },
        }
    }

    pub fn remove(&mut self, flag: &Flag) {
        match (flag.as_system(), flag) {
            (Some(system), _) => self.system.remove(system),
            (None, &Flag::Keyword(ref kw)) => {
                self.keywords.remove(kw);
            },
            (None, _) => (),
        }
    }

    pub fn contains(&self, flag: &Flag) -> bool {
        match (flag.as_system(), flag) {
            (Some(system), _) => self.system.contains(system),
            (None, &Flag::Keyword(ref kw)) => self.keywords.contains(kw),
            (None, _) => false,
        }
    }

    pub fn is_seen(&self) -> bool {
        self.system.contains(SystemFlags::SEEN)
    }

    pub fn is_recent(&self) -> bool {
        self.system.contains(SystemFlags::RECENT)
    }

    pub fn union(&self, other: &Flags) -> Flags {
        Flags {
            system: self.system | other.system,
            keywords: self.keywords.union(&other.keywords).cloned().collect(),
        }
    }

    pub fn difference(&self, other: &Flags) -> Flags {
        Flags {
            system: self.system - other.system,
            keywords: self
                .keywords
                .difference(&other.keywords)
                .cloned()
                .collect(),
        }
    }

    /// Iterates every flag in this set, system flags first.
    pub fn iter(&self) -> impl Iterator<Item = Flag> + '_ {
        const SYSTEM: [(SystemFlags, Flag); 7] = [
            (SystemFlags::ANSWERED, Flag::Answered),
            (SystemFlags::DELETED, Flag::Deleted),
            (SystemFlags::DRAFT, Flag::Draft),
            (SystemFlags::FLAGGED, Flag::Flagged),
            (SystemFlags::RECENT, Flag::Recent),
            (SystemFlags::SEEN, Flag::Seen),
            (SystemFlags::USER, Flag::AnyUser),
        ];

        SYSTEM
            .into_iter()
            .filter(move |&(bit, _)| self.system.contains(bit))
            .map(|(_, flag)| flag)
            .chain(self.keywords.iter().cloned().map(Flag::Keyword))
    }

    /// The flags of this set which contribute to the applicable flags of a
    /// mailbox, i.e., everything except `\Recent` and `\*`.
    pub fn applicable(&self) -> impl Iterator<Item = Flag> + '_ {
        self.iter()
            .filter(|flag| !matches!(*flag, Flag::Recent | Flag::AnyUser))
    }
}

/// How a `FlagsUpdate` combines with the existing flags of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagsUpdateMode {
    Add,
    Remove,
    Replace,
}

/// A pending change to the flags of a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlagsUpdate {
    pub mode: FlagsUpdateMode,
    pub flags: Flags,
}

impl FlagsUpdate {
    pub fn add(flags: Flags) -> Self {
        Self {
            mode: FlagsUpdateMode::Add,
            flags,
        }
    }

    pub fn remove(flags: Flags) -> Self {
        Self {
            mode: FlagsUpdateMode::Remove,
            flags,
        }
    }

    pub fn replace(flags: Flags) -> Self {
        Self {
            mode: FlagsUpdateMode::Replace,
            flags,
        }
    }

    /// Computes the flags resulting from applying this update to `current`.
    pub fn apply(&self, current: &Flags) -> Flags {
        match self.mode {
            FlagsUpdateMode::Add => current.union(&self.flags),
            FlagsUpdateMode::Remove => current.difference(&self.flags),
            FlagsUpdateMode::Replace => self.flags.clone(),
        }
    }
}

/// The current state of one message within one mailbox.
///
/// This is an immutable value; changes are made by computing a new state
/// with `with_flags_update`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageState {
    pub id: ComposedMessageId,
    pub modseq: Modseq,
    pub flags: Flags,
}

impl MessageState {
    /// Applies `update` to this state, producing the new state (stamped with
    /// `modseq`) and the description of the change to be fed to the indexes.
    pub fn with_flags_update(
        &self,
        update: &FlagsUpdate,
        modseq: Modseq,
    ) -> (MessageState, UpdatedFlags) {
        let new_flags = update.apply(&self.flags);
        let updated = UpdatedFlags {
            uid: self.id.uid,
            modseq,
            old_flags: self.flags.clone(),
            new_flags: new_flags.clone(),
        };

        (
            MessageState {
                id: self.id,
                modseq,
                flags: new_flags,
            },
            updated,
        )
    }
}

/// Describes a change to the flags of a single message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdatedFlags {
    pub uid: Uid,
    pub modseq: Modseq,
    pub old_flags: Flags,
    pub new_flags: Flags,
}

impl UpdatedFlags {
    /// `Some(true)` if the flag was newly set, `Some(false)` if it was newly
    /// cleared, `None` if it did not change.
    pub fn transition(&self, flag: SystemFlags) -> Option<bool> {
        match (
            self.old_flags.system.contains(flag),
            self.new_flags.system.contains(flag),
        ) {
            (false, true) => Some(true),
            (true, false) => Some(false),
            _ => None,
        }
    }
}

/// How much of a message a retrieval needs.
///
/// This only controls which byte ranges are loaded; everything else about
/// the message is returned at every depth.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FetchDepth {
    Metadata,
    Headers,
    Body,
    Full,
}

impl FetchDepth {
    pub fn wants_header(self) -> bool {
        matches!(self, FetchDepth::Headers | FetchDepth::Full)
    }

    pub fn wants_body(self) -> bool {
        matches!(self, FetchDepth::Body | FetchDepth::Full)
    }
}

/// A reference from a message to an attachment stored elsewhere.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub attachment_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub cid: Option<String>,
    #[serde(default)]
    pub inline: bool,
}

/// A stored message in the shape shared by both record generations.
///
/// `header` and `body` are `None` when the fetch depth did not ask for them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: ComposedMessageId,
    pub internal_date: DateTime<Utc>,
    /// The octet offset of the start of the body within the full content,
    /// i.e., the length of the header.
    pub body_start: u64,
    /// The length of the full content.
    pub size: u64,
    pub header: Option<Vec<u8>>,
    pub body: Option<Vec<u8>>,
    pub attachments: Vec<AttachmentRef>,
}

impl MessageRecord {
    /// Builds a full record by splitting `content` at `body_start`.
    pub fn new(
        id: ComposedMessageId,
        internal_date: DateTime<Utc>,
        content: &[u8],
        body_start: usize,
        attachments: Vec<AttachmentRef>,
    ) -> Self {
        let body_start = body_start.min(content.len());
        let (header, body) = content.split_at(body_start);
        Self {
            id,
            internal_date,
            body_start: body_start as u64,
            size: content.len() as u64,
            header: Some(header.to_vec()),
            body: Some(body.to_vec()),
            attachments,
        }
    }

    /// Discards the byte ranges that `depth` does not ask for.
    pub fn at_depth(mut self, depth: FetchDepth) -> Self {
        if !depth.wants_header() {
            self.header = None;
        }
        if !depth.wants_body() {
            self.body = None;
        }
        self
    }

    /// Returns the full content, or `None` if this record was not loaded at
    /// full depth.
    pub fn content(&self) -> Option<Vec<u8>> {
        let header = self.header.as_ref()?;
        let body = self.body.as_ref()?;
        let mut content = Vec::with_capacity(header.len() + body.len());
        content.extend_from_slice(header);
        content.extend_from_slice(body);
        Some(content)
    }
}

/// The path of a mailbox.
///
/// At most one mailbox has any given path at any time.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MailboxPath {
    pub namespace: String,
    pub owner: String,
    pub name: String,
}

impl MailboxPath {
    pub fn new(namespace: &str, owner: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_owned(),
            owner: owner.to_owned(),
            name: name.to_owned(),
        }
    }

    pub fn private(owner: &str, name: &str) -> Self {
        Self::new("#private", owner, name)
    }
}

impl fmt::Display for MailboxPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.owner, self.name)
    }
}

/// The access control list of a mailbox, mapping each entry key to its
/// rights string.
///
/// The store does not interpret ACLs.
pub type MailboxAcl = BTreeMap<String, String>;

/// The metadata of a mailbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mailbox {
    /// `None` until the mailbox is first saved.
    pub id: Option<MailboxId>,
    pub path: MailboxPath,
    /// `None` until the mailbox is first saved.
    pub uid_validity: Option<u32>,
    pub acl: MailboxAcl,
}

impl Mailbox {
    pub fn new(path: MailboxPath) -> Self {
        Self {
            id: None,
            path,
            uid_validity: None,
            acl: MailboxAcl::new(),
        }
    }
}

/// The message counters of a mailbox.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MailboxCounters {
    pub total: i64,
    pub unseen: i64,
}
