//! Append-only journal of committed transactions.
//!
//! Every committed transaction is one frame: a little-endian `u32` length,
//! the MessagePack encoding of a [`JournalEntry`], and a CRC32 of the
//! encoded bytes. On open the whole journal is read back; a frame cut
//! short by a crash is dropped and the file truncated to the last whole
//! frame, while a frame whose checksum does not match is corruption.
//!
//! No frame is ever written that the reader would refuse: an entry over
//! the journal's limit fails before any byte reaches the file, and a
//! rewrite spreads its mutations over as many frames as it needs.

use crate::error::{Result, TetherError};
use crate::transaction::Mutation;
use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"TJL\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

const HEADER_LEN: u64 = 5;

/// Upper bound on a single frame, as a sanity check against garbage lengths.
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Room left in a frame for everything but the mutations.
const ENTRY_OVERHEAD: usize = 64;

/// One committed transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub timestamp: Timestamp,
    pub mutations: Vec<Mutation>,
}

/// Borrowed form of [`JournalEntry`] for encoding without cloning.
#[derive(Serialize)]
struct EntryRef<'a> {
    seq: u64,
    timestamp: Timestamp,
    mutations: &'a [Mutation],
}

enum Frame {
    Entry(JournalEntry, u64),
    End,
    Torn,
}

/// Journal file handle.
pub struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
    next_seq: u64,
    entries: usize,
    sync: bool,

    /// Largest encoded entry this journal writes.
    max_entry_len: usize,
}

impl Journal {
    /// Open or create the journal at `path`, returning it together with
    /// every entry it holds, oldest first.
    pub fn open(path: impl AsRef<Path>, sync: bool) -> Result<(Self, Vec<JournalEntry>)> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            let file = Self::create_empty(&path)?;
            let journal = Self {
                path,
                writer: BufWriter::new(file),
                next_seq: 1,
                entries: 0,
                sync,
                max_entry_len: MAX_FRAME_LEN,
            };
            return Ok((journal, Vec::new()));
        }

        let mut reader = BufReader::new(File::open(&path)?);
        Self::read_header(&mut reader)?;

        let mut entries = Vec::new();
        let mut valid_len = HEADER_LEN;
        loop {
            match Self::read_frame(&mut reader)? {
                Frame::Entry(entry, frame_len) => {
                    valid_len += frame_len;
                    entries.push(entry);
                }
                Frame::End => break,
                Frame::Torn => {
                    tracing::warn!(
                        path = %path.display(),
                        valid_len,
                        "journal ends in a partial frame, truncating"
                    );
                    let file = OpenOptions::new().write(true).open(&path)?;
                    file.set_len(valid_len)?;
                    file.sync_all()?;
                    break;
                }
            }
        }

        let next_seq = entries.last().map(|e| e.seq + 1).unwrap_or(1);
        let file = OpenOptions::new().append(true).open(&path)?;
        let journal = Self {
            path,
            writer: BufWriter::new(file),
            next_seq,
            entries: entries.len(),
            sync,
            max_entry_len: MAX_FRAME_LEN,
        };
        Ok((journal, entries))
    }

    /// Cap the encoded size of entries written from now on. Capped at
    /// [`MAX_FRAME_LEN`], which is what the reader accepts.
    pub fn with_entry_limit(mut self, limit: usize) -> Self {
        self.max_entry_len = limit.clamp(ENTRY_OVERHEAD + 1, MAX_FRAME_LEN);
        self
    }

    /// Append one transaction. Returns its sequence number.
    ///
    /// On error nothing of the entry is left in the file.
    pub fn append(&mut self, mutations: &[Mutation]) -> Result<u64> {
        let seq = self.next_seq;
        let entry = EntryRef {
            seq,
            timestamp: Timestamp::now(),
            mutations,
        };
        let encoded = Self::encode(&entry, self.max_entry_len)?;

        let start = self.writer.get_ref().metadata()?.len();
        if let Err(e) = self.write_encoded(&encoded) {
            if let Err(undo) = self.truncate_to(start) {
                tracing::error!(
                    path = %self.path.display(),
                    error = %undo,
                    "could not remove a failed journal append"
                );
            }
            return Err(e);
        }

        self.next_seq += 1;
        self.entries += 1;
        tracing::trace!(seq, mutations = mutations.len(), "journal append");
        Ok(seq)
    }

    /// Replace the journal with entries holding `mutations`, in order,
    /// using as few entries as the entry limit allows. Written to a
    /// temporary file first and renamed into place.
    pub fn rewrite(&mut self, mutations: &[Mutation]) -> Result<()> {
        let chunks = self.split(mutations)?;
        let tmp_path = self.path.with_extension("log.tmp");
        {
            let file = Self::create_empty(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            for (i, chunk) in chunks.iter().enumerate() {
                let entry = EntryRef {
                    seq: i as u64 + 1,
                    timestamp: Timestamp::now(),
                    mutations: chunk,
                };
                let encoded = Self::encode(&entry, self.max_entry_len)?;
                Self::write_frame(&mut writer, &encoded)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        self.writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        self.entries = chunks.len();
        self.next_seq = self.entries as u64 + 1;
        Ok(())
    }

    /// Group `mutations` into runs that each encode within the entry limit.
    fn split<'m>(&self, mutations: &'m [Mutation]) -> Result<Vec<&'m [Mutation]>> {
        let budget = self.max_entry_len - ENTRY_OVERHEAD;
        let mut chunks = Vec::new();
        let mut start = 0;
        let mut size = 0;

        for (i, mutation) in mutations.iter().enumerate() {
            let len = rmp_serde::to_vec(mutation)?.len();
            if len > budget {
                return Err(TetherError::EntryTooLarge {
                    len: len + ENTRY_OVERHEAD,
                    limit: self.max_entry_len,
                });
            }
            if size + len > budget {
                chunks.push(&mutations[start..i]);
                start = i;
                size = 0;
            }
            size += len;
        }
        if start < mutations.len() {
            chunks.push(&mutations[start..]);
        }
        Ok(chunks)
    }

    /// Number of entries in the journal.
    pub fn entry_count(&self) -> usize {
        self.entries
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn create_empty(path: &Path) -> Result<File> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(JOURNAL_MAGIC)?;
        file.write_all(&[JOURNAL_VERSION])?;
        file.sync_all()?;
        Ok(file)
    }

    fn read_header(reader: &mut impl Read) -> Result<()> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(TetherError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(TetherError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }
        Ok(())
    }

    fn write_encoded(&mut self, encoded: &[u8]) -> Result<()> {
        Self::write_frame(&mut self.writer, encoded)?;
        self.writer.flush()?;
        if self.sync {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Cut the file back to `len` bytes, discarding anything still
    /// buffered, and reopen the writer at the new end.
    fn truncate_to(&mut self, len: u64) -> Result<()> {
        let fresh = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        let stale = std::mem::replace(&mut self.writer, fresh);
        // Dropping a BufWriter flushes it; its leftover bytes must not land.
        let (file, _unflushed) = stale.into_parts();
        file.set_len(len)?;
        file.sync_all()?;
        tracing::warn!(path = %self.path.display(), len, "rolled back journal append");
        Ok(())
    }

    fn encode(entry: &EntryRef<'_>, limit: usize) -> Result<Vec<u8>> {
        let encoded = rmp_serde::to_vec(entry)?;
        if encoded.len() > limit {
            return Err(TetherError::EntryTooLarge {
                len: encoded.len(),
                limit,
            });
        }
        Ok(encoded)
    }

    fn write_frame(writer: &mut impl Write, encoded: &[u8]) -> Result<()> {
        let len = encoded.len() as u32;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(encoded)?;
        writer.write_all(&crc32fast::hash(encoded).to_le_bytes())?;
        Ok(())
    }

    fn read_frame(reader: &mut impl Read) -> Result<Frame> {
        let mut len_bytes = [0u8; 4];
        match read_full(reader, &mut len_bytes)? {
            0 => return Ok(Frame::End),
            4 => {}
            _ => return Ok(Frame::Torn),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(TetherError::Corruption(format!(
                "journal frame of {} bytes",
                len
            )));
        }

        let mut encoded = vec![0u8; len];
        if read_full(reader, &mut encoded)? < len {
            return Ok(Frame::Torn);
        }

        let mut checksum_bytes = [0u8; 4];
        if read_full(reader, &mut checksum_bytes)? < 4 {
            return Ok(Frame::Torn);
        }
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(TetherError::ChecksumMismatch { expected, got });
        }

        let entry = rmp_serde::from_slice(&encoded)?;
        Ok(Frame::Entry(entry, (len + 8) as u64))
    }
}

/// Read until `buf` is full or EOF. Returns the number of bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
