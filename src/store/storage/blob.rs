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

//! The chunked blob store.
//!
//! Content is split into chunks of at most `blob.chunk_size` bytes. Each
//! chunk is stored under its own freshly generated `ChunkId`, and then the
//! blob's index (one row per chunk position) is written. A chunk is never
//! modified once written; saving the same content again writes new chunks and
//! replaces the whole index in one transaction, leaving the old chunks
//! orphaned.
//!
//! Reading produces a forward-only stream which only fetches a chunk once the
//! previous one has been consumed, so a reader which only needs a prefix of
//! the content (e.g. just the header of a message) only loads the chunks
//! covering that prefix.

use std::io::{self, Read};

use log::error;
use rusqlite::OptionalExtension as _;
use tiny_keccak::{Hasher, Sha3};

use super::{connection::Connection, types::*};
use crate::{store::model::*, support::error::Error};

impl Connection {
    /// Saves the content read from `data` as a new blob.
    ///
    /// The returned ID is derived from the content.
    pub fn save_blob(&self, mut data: impl Read) -> Result<BlobId, Error> {
        let chunk_size = self.config.blob.chunk_size.max(1);
        let mut sha3 = Sha3::v256();
        let mut chunk_ids = Vec::<ChunkId>::new();
        let mut buf = vec![0u8; chunk_size];

        let mut insert_chunk = self.cxn.prepare_cached(
            "INSERT INTO `blob_chunks` (`chunk_id`, `data`) VALUES (?, ?)",
        )?;

        loop {
            let len = fill(&mut data, &mut buf)?;
            if 0 == len {
                break;
            }

            let chunk = &buf[..len];
            sha3.update(chunk);

            let chunk_id = ChunkId::generate();
            insert_chunk.execute((chunk_id, chunk))?;
            chunk_ids.push(chunk_id);

            if len < chunk_size {
                break;
            }
        }

        let mut hash = [0u8; 32];
        sha3.finalize(&mut hash);
        let blob_id =
            BlobId(hash.iter().map(|b| format!("{:02x}", b)).collect());

        // The same content saved under another chunk size has a different
        // number of positions, so the whole index is replaced at once.
        self.with_savepoint(|| {
            self.cxn
                .prepare_cached("DELETE FROM `blobs` WHERE `blob_id` = ?")?
                .execute((&blob_id,))?;
            let mut insert_index = self.cxn.prepare_cached(
                "INSERT INTO `blobs` (`blob_id`, `position`, `chunk_id`) \
                 VALUES (?, ?, ?)",
            )?;
            for (position, &chunk_id) in chunk_ids.iter().enumerate() {
                insert_index.execute((&blob_id, position as i64, chunk_id))?;
            }
            Ok(())
        })?;

        Ok(blob_id)
    }

    /// Saves `data` if present. Absent content is not stored and has no ID.
    pub fn save_optional_blob(
        &self,
        data: Option<impl Read>,
    ) -> Result<Option<BlobId>, Error> {
        data.map(|data| self.save_blob(data)).transpose()
    }

    /// Opens the blob with the given ID for reading.
    ///
    /// A blob with no chunks reads as empty content; this is indistinguishable
    /// from a blob which was never saved, so callers which know the expected
    /// length should check it.
    pub fn read_blob(&self, blob_id: &BlobId) -> Result<ChunkStream<'_>, Error> {
        let chunks = self
            .cxn
            .prepare_cached(
                "SELECT `position`, `chunk_id` FROM `blobs` \
                 WHERE `blob_id` = ? ORDER BY `position`",
            )?
            .query_map((blob_id,), from_row::<(i64, ChunkId)>)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ChunkStream {
            cxn: self,
            blob_id: blob_id.clone(),
            chunks: chunks.into_iter(),
            next_position: 0,
            failed: false,
        })
    }

    /// Reads the entire content of the given blob into memory.
    pub fn read_blob_fully(&self, blob_id: &BlobId) -> Result<Vec<u8>, Error> {
        let mut content = Vec::new();
        for chunk in self.read_blob(blob_id)? {
            content.extend_from_slice(&chunk?);
        }
        Ok(content)
    }

    fn fetch_chunk(&self, chunk_id: ChunkId) -> Result<Option<Vec<u8>>, Error> {
        self.cxn
            .prepare_cached(
                "SELECT `data` FROM `blob_chunks` WHERE `chunk_id` = ?",
            )?
            .query_row((chunk_id,), from_single::<Vec<u8>>)
            .optional()
            .map_err(Into::into)
    }
}

/// Reads from `src` until `buf` is full or EOF is reached.
fn fill(src: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut len = 0;
    while len < buf.len() {
        match src.read(&mut buf[len..]) {
            Ok(0) => break,
            Ok(n) => len += n,
            Err(e) if io::ErrorKind::Interrupted == e.kind() => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(len)
}

/// The content of a blob as a sequence of chunks.
///
/// The stream is finite and cannot be restarted. Each chunk is fetched from
/// storage when `next()` is called for it.
///
/// If a chunk is missing from storage, or the index of the blob has a hole,
/// the stream yields a single `Error::MissingChunk` and then ends. It never
/// silently yields truncated content.
pub struct ChunkStream<'a> {
    cxn: &'a Connection,
    blob_id: BlobId,
    chunks: std::vec::IntoIter<(i64, ChunkId)>,
    next_position: i64,
    failed: bool,
}

impl ChunkStream<'_> {
    pub fn into_reader(self) -> BlobReader<Self> {
        BlobReader::new(self)
    }

    fn missing(&mut self, position: i64) -> Error {
        self.failed = true;
        error!(
            "{} Blob {} is missing chunk #{}",
            self.cxn.log_prefix, self.blob_id, position,
        );
        Error::MissingChunk(self.blob_id.to_string(), position as u32)
    }
}

impl Iterator for ChunkStream<'_> {
    type Item = Result<Vec<u8>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let (position, chunk_id) = self.chunks.next()?;
        if position != self.next_position {
            let expected = self.next_position;
            return Some(Err(self.missing(expected)));
        }

        match self.cxn.fetch_chunk(chunk_id) {
            Ok(Some(data)) => {
                self.next_position += 1;
                Some(Ok(data))
            },
            Ok(None) => Some(Err(self.missing(position))),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            },
        }
    }
}

/// Adapts a stream of chunks to `io::Read`.
pub struct BlobReader<I> {
    chunks: I,
    current: Vec<u8>,
    offset: usize,
}

impl<I: Iterator<Item = Result<Vec<u8>, Error>>> BlobReader<I> {
    pub fn new(chunks: I) -> Self {
        Self {
            chunks,
            current: Vec::new(),
            offset: 0,
        }
    }
}

impl<I: Iterator<Item = Result<Vec<u8>, Error>>> Read for BlobReader<I> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        while self.offset >= self.current.len() {
            match self.chunks.next() {
                None => return Ok(0),
                Some(Ok(chunk)) => {
                    self.current = chunk;
                    self.offset = 0;
                },
                Some(Err(Error::Io(e))) => return Err(e),
                Some(Err(e)) => {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e))
                },
            }
        }

        let n = dst.len().min(self.current.len() - self.offset);
        dst[..n].copy_from_slice(&self.current[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::super::connection::test_support::Fixture;
    use super::*;
    use crate::support::system_config::StoreConfig;

    fn small_chunks(chunk_size: usize) -> Fixture {
        let mut config = StoreConfig::default();
        config.blob.chunk_size = chunk_size;
        Fixture::with_config(config)
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn chunk_count(fixture: &Fixture, blob_id: &BlobId) -> i64 {
        fixture
            .cxn
            .cxn
            .query_row(
                "SELECT COUNT(*) FROM `blobs` WHERE `blob_id` = ?",
                (blob_id,),
                from_single,
            )
            .unwrap()
    }

    #[test]
    fn round_trip_at_chunk_boundaries() {
        let fixture = Fixture::new();
        let chunk = fixture.cxn.config().blob.chunk_size;
        assert_eq!(1024, chunk);

        for (len, expected_chunks) in [
            (0, 0),
            (chunk - 1, 1),
            (chunk, 1),
            (chunk + 1, 2),
            (10 * chunk + 37, 11),
        ] {
            let data = content(len);
            let blob_id = fixture.cxn.save_blob(&data[..]).unwrap();
            assert_eq!(
                data,
                fixture.cxn.read_blob_fully(&blob_id).unwrap(),
                "round trip of {} bytes",
                len,
            );
            assert_eq!(
                expected_chunks,
                chunk_count(&fixture, &blob_id),
                "chunks for {} bytes",
                len,
            );

            let lengths = fixture
                .cxn
                .read_blob(&blob_id)
                .unwrap()
                .map(|c| c.unwrap().len())
                .collect::<Vec<_>>();
            assert!(lengths.iter().all(|&l| l > 0 && l <= chunk));
        }
    }

    #[test]
    fn absent_content_is_not_stored() {
        let fixture = Fixture::new();
        assert_eq!(
            None,
            fixture.cxn.save_optional_blob(None::<&[u8]>).unwrap()
        );
        assert!(fixture
            .cxn
            .save_optional_blob(Some(&b"x"[..]))
            .unwrap()
            .is_some());
    }

    #[test]
    fn same_content_same_id() {
        let fixture = small_chunks(4);
        let a = fixture.cxn.save_blob(&b"hello world"[..]).unwrap();
        let b = fixture.cxn.save_blob(&b"hello world"[..]).unwrap();
        let c = fixture.cxn.save_blob(&b"hello world!"[..]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(3, chunk_count(&fixture, &a));
        assert_eq!(
            b"hello world".to_vec(),
            fixture.cxn.read_blob_fully(&a).unwrap()
        );
    }

    #[test]
    fn resaving_with_other_chunk_size_replaces_index() {
        let fixture = small_chunks(4);
        let data = b"aaaabbbbcccc";
        let blob_id = fixture.cxn.save_blob(&data[..]).unwrap();
        assert_eq!(3, chunk_count(&fixture, &blob_id));

        let mut config = StoreConfig::default();
        config.blob.chunk_size = 8;
        let wide = Connection::new(&fixture.path(), Arc::new(config)).unwrap();
        assert_eq!(blob_id, wide.save_blob(&data[..]).unwrap());
        assert_eq!(2, chunk_count(&fixture, &blob_id));
        assert_eq!(data.to_vec(), fixture.cxn.read_blob_fully(&blob_id).unwrap());

        // And back to the smaller size
        assert_eq!(blob_id, fixture.cxn.save_blob(&data[..]).unwrap());
        assert_eq!(3, chunk_count(&fixture, &blob_id));
        assert_eq!(data.to_vec(), wide.read_blob_fully(&blob_id).unwrap());
    }

    #[test]
    fn missing_chunk_ends_stream_with_error() {
        let fixture = small_chunks(4);
        let blob_id = fixture.cxn.save_blob(&b"aaaabbbbcccc"[..]).unwrap();

        fixture
            .cxn
            .cxn
            .execute(
                "DELETE FROM `blob_chunks` WHERE `chunk_id` = (\
                   SELECT `chunk_id` FROM `blobs` \
                   WHERE `blob_id` = ? AND `position` = 1)",
                (&blob_id,),
            )
            .unwrap();

        let mut stream = fixture.cxn.read_blob(&blob_id).unwrap();
        assert_eq!(b"aaaa".to_vec(), stream.next().unwrap().unwrap());
        assert_matches!(
            Some(Err(Error::MissingChunk(_, 1))),
            stream.next()
        );
        assert!(stream.next().is_none());

        let mut content = Vec::new();
        let err = fixture
            .cxn
            .read_blob(&blob_id)
            .unwrap()
            .into_reader()
            .read_to_end(&mut content)
            .unwrap_err();
        assert_eq!(io::ErrorKind::InvalidData, err.kind());
    }

    #[test]
    fn hole_in_index_is_detected() {
        let fixture = small_chunks(2);
        let blob_id = fixture.cxn.save_blob(&b"aabbcc"[..]).unwrap();
        fixture
            .cxn
            .cxn
            .execute(
                "DELETE FROM `blobs` WHERE `blob_id` = ? AND `position` = 1",
                (&blob_id,),
            )
            .unwrap();

        let mut chunks = fixture
            .cxn
            .read_blob(&blob_id)
            .unwrap()
            .collect::<Vec<_>>()
            .into_iter();
        assert_eq!(b"aa".to_vec(), chunks.next().unwrap().unwrap());
        assert_matches!(Some(Err(Error::MissingChunk(_, 1))), chunks.next());
        assert!(chunks.next().is_none());
    }

    #[test]
    fn reader_stops_early_on_prefix() {
        let fixture = small_chunks(4);
        let blob_id =
            fixture.cxn.save_blob(&b"0123456789abcdef"[..]).unwrap();

        // Remove the last chunk; reading only a prefix never touches it.
        fixture
            .cxn
            .cxn
            .execute(
                "DELETE FROM `blob_chunks` WHERE `chunk_id` = (\
                   SELECT `chunk_id` FROM `blobs` \
                   WHERE `blob_id` = ? AND `position` = 3)",
                (&blob_id,),
            )
            .unwrap();

        let mut prefix = Vec::new();
        fixture
            .cxn
            .read_blob(&blob_id)
            .unwrap()
            .into_reader()
            .take(6)
            .read_to_end(&mut prefix)
            .unwrap();
        assert_eq!(b"012345".to_vec(), prefix);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn blob_round_trip(
            data in prop::collection::vec(any::<u8>(), 0..200),
            chunk_size in 1usize..40,
        ) {
            let fixture = small_chunks(chunk_size);
            let blob_id = fixture.cxn.save_blob(&data[..]).unwrap();
            prop_assert_eq!(
                &data,
                &fixture.cxn.read_blob_fully(&blob_id).unwrap()
            );
            prop_assert_eq!(
                ((data.len() + chunk_size - 1) / chunk_size) as i64,
                chunk_count(&fixture, &blob_id)
            );
        }
    }
}
