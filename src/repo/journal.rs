//! Commit journal for crash recovery.
//!
//! Every committed repository transaction appends one entry holding the
//! transaction's redo operations. Rolled-back transactions never reach the
//! file, so replay applies every readable entry in order. A crash while a
//! commit was being written leaves a torn trailing entry, which recovery
//! truncates; a checksum mismatch anywhere else is corruption and refuses to
//! open.

use crate::error::{RelayError, Result};
use crate::repo::model::{ClientRecord, NotificationRecord, SubscriptionRecord};
use crate::types::{SubscriptionId, TransportId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for journal files.
const JOURNAL_MAGIC: &[u8; 4] = b"TRJ\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Header size: magic + version byte.
const JOURNAL_HEADER_LEN: u64 = 5;

/// Sanity cap on a single entry (a batch of serialized entity clones).
const MAX_ENTRY_LEN: usize = 256 * 1024 * 1024;

/// A single repository mutation, as written to the journal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepoOp {
    PutClient(ClientRecord),
    DeleteClient(TransportId),
    PutSubscription(SubscriptionRecord),
    DeleteSubscription(SubscriptionId),
    PutNotification(NotificationRecord),
    DeleteNotification { client: TransportId, index: u64 },
    /// Wipe everything. Written by the startup reset.
    Clear,
}

/// One committed transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Commit sequence number, strictly increasing within one journal file.
    pub seq: u64,
    pub ops: Vec<RepoOp>,
}

/// Append-only commit journal.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    next_seq: Mutex<u64>,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl Journal {
    /// Create or open a journal file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (next_seq, writer) = if path.exists() {
            let file = File::open(&path)?;
            let mut reader = BufReader::new(file);
            Self::verify_header(&mut reader)?;

            let mut max_seq = 0u64;
            let mut offset = JOURNAL_HEADER_LEN;
            loop {
                match Self::read_entry(&mut reader) {
                    Ok((entry, len)) => {
                        max_seq = max_seq.max(entry.seq);
                        offset += len;
                    }
                    Err(ReadOutcome::Eof) => break,
                    Err(ReadOutcome::Torn) => {
                        // Crash mid-append. Drop the torn tail.
                        let file = OpenOptions::new().write(true).open(&path)?;
                        file.set_len(offset)?;
                        file.sync_all()?;
                        break;
                    }
                    Err(ReadOutcome::Failed(e)) => return Err(e),
                }
            }

            let file = OpenOptions::new().append(true).open(&path)?;
            (max_seq + 1, Some(BufWriter::new(file)))
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.write_all(JOURNAL_MAGIC)?;
            file.write_all(&[JOURNAL_VERSION])?;
            file.sync_all()?;

            (1, Some(BufWriter::new(file)))
        };

        Ok(Self {
            path,
            next_seq: Mutex::new(next_seq),
            writer: Mutex::new(writer),
        })
    }

    /// Append a committed transaction (returns its sequence number).
    ///
    /// The entry is flushed and fsynced before this returns; a transaction
    /// only counts as committed once its journal entry is durable.
    pub fn append(&self, ops: Vec<RepoOp>) -> Result<u64> {
        let mut next_seq = self.next_seq.lock();
        let seq = *next_seq;
        *next_seq += 1;

        let entry = JournalEntry { seq, ops };

        let mut writer = self.writer.lock();
        if let Some(ref mut w) = *writer {
            Self::write_entry(w, &entry)?;
            w.flush()?;
            w.get_ref().sync_all()?;
        }

        Ok(seq)
    }

    /// Read every committed entry, in commit order.
    pub fn replay(&self) -> Result<Vec<JournalEntry>> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        Self::verify_header(&mut reader)?;

        let mut entries = Vec::new();
        loop {
            match Self::read_entry(&mut reader) {
                Ok((entry, _)) => entries.push(entry),
                Err(ReadOutcome::Eof) | Err(ReadOutcome::Torn) => break,
                Err(ReadOutcome::Failed(e)) => return Err(e),
            }
        }

        Ok(entries)
    }

    /// Truncate the journal back to an empty file (after a checkpoint or a
    /// startup reset has made the history redundant).
    pub fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        *writer = None;

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(JOURNAL_MAGIC)?;
        file.write_all(&[JOURNAL_VERSION])?;
        file.sync_all()?;

        *writer = Some(BufWriter::new(
            OpenOptions::new().append(true).open(&self.path)?,
        ));
        *self.next_seq.lock() = 1;

        Ok(())
    }

    /// Replace the journal's contents with a single checkpoint entry.
    pub fn rewrite(&self, ops: Vec<RepoOp>) -> Result<()> {
        self.clear()?;
        if !ops.is_empty() {
            self.append(ops)?;
        }
        Ok(())
    }

    fn verify_header<R: Read>(reader: &mut R) -> Result<()> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(RelayError::InvalidFormat("invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(RelayError::InvalidFormat(format!(
                "unsupported journal version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn write_entry(writer: &mut BufWriter<File>, entry: &JournalEntry) -> Result<()> {
        let encoded = rmp_serde::to_vec(entry)?;

        writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        writer.write_all(&encoded)?;

        let checksum = crc32fast::hash(&encoded);
        writer.write_all(&checksum.to_le_bytes())?;

        Ok(())
    }

    /// Returns the entry and its on-disk length.
    fn read_entry<R: Read>(
        reader: &mut R,
    ) -> std::result::Result<(JournalEntry, u64), ReadOutcome> {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(ReadOutcome::Eof),
            Err(e) => return Err(ReadOutcome::Failed(e.into())),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_ENTRY_LEN {
            return Err(ReadOutcome::Failed(RelayError::Corruption(
                "journal entry too large".into(),
            )));
        }

        let mut encoded = vec![0u8; len];
        if read_exact_or_torn(reader, &mut encoded)? {
            return Err(ReadOutcome::Torn);
        }

        let mut checksum_bytes = [0u8; 4];
        if read_exact_or_torn(reader, &mut checksum_bytes)? {
            return Err(ReadOutcome::Torn);
        }
        let stored = u32::from_le_bytes(checksum_bytes);

        if stored != crc32fast::hash(&encoded) {
            return Err(ReadOutcome::Failed(RelayError::Corruption(
                "journal checksum mismatch".into(),
            )));
        }

        let entry: JournalEntry = rmp_serde::from_slice(&encoded)
            .map_err(|e| ReadOutcome::Failed(RelayError::Deserialization(e.to_string())))?;

        let disk_len = 4 + len as u64 + 4;
        Ok((entry, disk_len))
    }
}

/// How reading one entry ended when it didn't produce an entry.
enum ReadOutcome {
    /// Clean end of file at an entry boundary.
    Eof,
    /// File ends inside an entry: crash during append.
    Torn,
    /// Unreadable for a reason recovery must not paper over.
    Failed(RelayError),
}

/// True if EOF was hit mid-buffer.
fn read_exact_or_torn<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::result::Result<bool, ReadOutcome> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(true),
        Err(e) => Err(ReadOutcome::Failed(e.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};
    use tempfile::TempDir;

    fn sample_op() -> RepoOp {
        RepoOp::PutClient(ClientRecord::new(TransportId::random()))
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path().join("commits.trj")).unwrap();

        let seq1 = journal.append(vec![sample_op()]).unwrap();
        let seq2 = journal.append(vec![sample_op(), RepoOp::Clear]).unwrap();
        assert_eq!(seq1, 1);
        assert_eq!(seq2, 2);

        let entries = journal.replay().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ops.len(), 1);
        assert_eq!(entries[1].ops.len(), 2);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commits.trj");

        let client = ClientRecord::new(TransportId::random());
        {
            let journal = Journal::open(&path).unwrap();
            journal.append(vec![RepoOp::PutClient(client.clone())]).unwrap();
        }

        let journal = Journal::open(&path).unwrap();
        let entries = journal.replay().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].ops, vec![RepoOp::PutClient(client)]);

        // Sequence numbers continue after the replayed history.
        let seq = journal.append(vec![sample_op()]).unwrap();
        assert_eq!(seq, 2);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commits.trj");

        {
            let journal = Journal::open(&path).unwrap();
            journal.append(vec![sample_op()]).unwrap();
        }

        // Simulate a crash mid-append: a length prefix with half an entry.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&100u32.to_le_bytes()).unwrap();
            file.write_all(&[0xAB; 10]).unwrap();
        }

        let journal = Journal::open(&path).unwrap();
        let entries = journal.replay().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_checksum_mismatch_refuses_to_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commits.trj");

        {
            let journal = Journal::open(&path).unwrap();
            journal.append(vec![sample_op()]).unwrap();
            journal.append(vec![sample_op()]).unwrap();
        }

        // Flip a byte inside the first entry's body.
        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(JOURNAL_HEADER_LEN + 6)).unwrap();
            let mut byte = [0u8; 1];
            file.read_exact(&mut byte).unwrap();
            file.seek(SeekFrom::Start(JOURNAL_HEADER_LEN + 6)).unwrap();
            file.write_all(&[byte[0] ^ 0xFF]).unwrap();
        }

        let err = Journal::open(&path).unwrap_err();
        assert!(matches!(err, RelayError::Corruption(_)));
    }

    #[test]
    fn test_clear_resets_sequence() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path().join("commits.trj")).unwrap();

        journal.append(vec![sample_op()]).unwrap();
        journal.clear().unwrap();

        assert!(journal.replay().unwrap().is_empty());
        assert_eq!(journal.append(vec![sample_op()]).unwrap(), 1);
    }

    #[test]
    fn test_rewrite_compacts_to_one_entry() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path().join("commits.trj")).unwrap();

        for _ in 0..5 {
            journal.append(vec![sample_op()]).unwrap();
        }

        let checkpoint = vec![sample_op(), sample_op()];
        journal.rewrite(checkpoint.clone()).unwrap();

        let entries = journal.replay().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].ops, checkpoint);
    }
}
