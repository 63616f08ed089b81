//! Append-only write-ahead log: after-images of page writes plus commit
//! markers, replayed on `open` so a crash before checkpoint cannot lose a
//! committed write.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crc32fast::Hasher;
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::page::PAGE_SIZE;

const WAL_MAGIC: &[u8; 4] = b"DWAL";
const WAL_VERSION: u32 = 1;
const WAL_HEADER_LEN: u64 = 16; // magic(4) + version(4) + reserved(8)

pub const REC_PAGE_WRITE: u8 = 1;
pub const REC_COMMIT: u8 = 2;
pub const REC_CHECKPOINT: u8 = 3;

#[derive(Debug, Clone)]
pub struct WalRecord {
    pub lsn: u64,
    pub kind: u8,
    pub page_id: u32,
    pub data: Vec<u8>,
}

impl WalRecord {
    fn body_without_crc(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(17 + self.data.len());
        out.extend_from_slice(&self.lsn.to_le_bytes());
        out.push(self.kind);
        out.extend_from_slice(&self.page_id.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    fn encode(&self) -> Vec<u8> {
        let mut body = self.body_without_crc();
        let mut hasher = Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();
        body.extend_from_slice(&crc.to_le_bytes());
        body
    }
}

struct Inner {
    file: File,
    next_lsn: u64,
}

pub struct Wal {
    inner: Mutex<Inner>,
}

impl Wal {
    pub fn open(path: &Path) -> Result<Self> {
        let is_new = !path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if is_new {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(WAL_MAGIC)?;
            file.write_all(&WAL_VERSION.to_le_bytes())?;
            file.write_all(&[0u8; 8])?;
            file.sync_all()?;
        } else {
            let mut header = [0u8; WAL_HEADER_LEN as usize];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
            if &header[0..4] != WAL_MAGIC {
                return Err(Error::WalCorruption("bad wal magic".into()));
            }
        }
        Ok(Self {
            inner: Mutex::new(Inner { file, next_lsn: 1 }),
        })
    }

    /// Scans the log validating CRCs. The first CRC-bad record, or any
    /// truncated tail, terminates the scan and is treated as a torn tail from
    /// a crash rather than an error. Returns every record read before the
    /// torn tail (or end of file), in file order.
    pub fn load(&self) -> Result<Vec<WalRecord>> {
        let mut inner = self.inner.lock().unwrap();
        inner.file.seek(SeekFrom::Start(WAL_HEADER_LEN))?;
        let mut records = Vec::new();
        let mut max_lsn = 0u64;
        loop {
            match read_one_record(&mut inner.file)? {
                Some(rec) => {
                    max_lsn = max_lsn.max(rec.lsn);
                    records.push(rec);
                }
                None => break,
            }
        }
        inner.next_lsn = max_lsn + 1;
        debug!("wal load: {} usable records", records.len());
        Ok(records)
    }

    pub fn log_page_write(&self, page_id: u32, after_image: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let lsn = inner.next_lsn;
        inner.next_lsn += 1;
        let rec = WalRecord {
            lsn,
            kind: REC_PAGE_WRITE,
            page_id,
            data: after_image.to_vec(),
        };
        append(&mut inner.file, &rec)?;
        Ok(())
    }

    /// Appends a `Commit` record and fsyncs. Every `PageWrite` appended since
    /// the previous `Commit` is durable once this returns.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let lsn = inner.next_lsn;
        inner.next_lsn += 1;
        let rec = WalRecord {
            lsn,
            kind: REC_COMMIT,
            page_id: 0,
            data: Vec::new(),
        };
        append(&mut inner.file, &rec)?;
        inner.file.sync_all()?;
        Ok(())
    }

    pub fn checkpoint_marker(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let lsn = inner.next_lsn;
        inner.next_lsn += 1;
        let rec = WalRecord {
            lsn,
            kind: REC_CHECKPOINT,
            page_id: 0,
            data: Vec::new(),
        };
        append(&mut inner.file, &rec)?;
        inner.file.sync_all()?;
        Ok(())
    }

    /// Replays the log (per `load`'s torn-tail rule) and returns, in file
    /// order, every `PageWrite` that precedes a `Commit` record. Writes after
    /// the last `Commit` are pending and are ignored.
    pub fn committed_page_writes(&self) -> Result<Vec<(u32, Vec<u8>)>> {
        let records = self.load()?;
        let mut pending: Vec<(u32, Vec<u8>)> = Vec::new();
        let mut committed: Vec<(u32, Vec<u8>)> = Vec::new();
        for rec in records {
            match rec.kind {
                REC_PAGE_WRITE => pending.push((rec.page_id, rec.data)),
                REC_COMMIT => {
                    committed.append(&mut pending);
                    pending.clear();
                }
                REC_CHECKPOINT => {}
                other => {
                    warn!("unknown wal record type {other}, skipping");
                }
            }
        }
        Ok(committed)
    }

    /// Resets the file to the empty header and fsyncs. Called after a
    /// successful checkpoint and after rollback.
    pub fn truncate(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.file.set_len(WAL_HEADER_LEN)?;
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(WAL_MAGIC)?;
        inner.file.write_all(&WAL_VERSION.to_le_bytes())?;
        inner.file.write_all(&[0u8; 8])?;
        inner.file.sync_all()?;
        inner.next_lsn = 1;
        Ok(())
    }
}

fn append(file: &mut File, rec: &WalRecord) -> Result<()> {
    file.seek(SeekFrom::End(0))?;
    file.write_all(&rec.encode())?;
    Ok(())
}

/// Reads one record at the file's current position. Returns `Ok(None)` at a
/// clean EOF, a truncated/partial record, or a CRC mismatch — all three are
/// the torn-tail case and must not surface as an error.
fn read_one_record(file: &mut File) -> Result<Option<WalRecord>> {
    let mut fixed = [0u8; 17];
    match file.read_exact(&mut fixed) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let lsn = u64::from_le_bytes(fixed[0..8].try_into().unwrap());
    let kind = fixed[8];
    let page_id = u32::from_le_bytes(fixed[9..13].try_into().unwrap());
    let data_len = u32::from_le_bytes(fixed[13..17].try_into().unwrap()) as usize;

    let mut data = vec![0u8; data_len];
    if file.read_exact(&mut data).is_err() {
        return Ok(None);
    }
    let mut crc_bytes = [0u8; 4];
    if file.read_exact(&mut crc_bytes).is_err() {
        return Ok(None);
    }
    let stored_crc = u32::from_le_bytes(crc_bytes);

    let mut hasher = Hasher::new();
    hasher.update(&fixed);
    hasher.update(&data);
    let computed_crc = hasher.finalize();
    if computed_crc != stored_crc {
        return Ok(None);
    }

    Ok(Some(WalRecord {
        lsn,
        kind,
        page_id,
        data,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn page_bytes(fill: u8) -> [u8; PAGE_SIZE] {
        [fill; PAGE_SIZE]
    }

    #[test]
    fn replay_returns_only_committed_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let wal = Wal::open(&path).unwrap();
        wal.log_page_write(1, &page_bytes(1)).unwrap();
        wal.log_page_write(2, &page_bytes(2)).unwrap();
        wal.commit().unwrap();
        wal.log_page_write(3, &page_bytes(3)).unwrap(); // uncommitted tail

        let committed = wal.committed_page_writes().unwrap();
        assert_eq!(committed.len(), 2);
        assert_eq!(committed[0].0, 1);
        assert_eq!(committed[1].0, 2);
    }

    #[test]
    fn truncated_trailing_record_is_ignored_not_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let wal = Wal::open(&path).unwrap();
        wal.log_page_write(1, &page_bytes(1)).unwrap();
        wal.commit().unwrap();

        {
            let mut inner = wal.inner.lock().unwrap();
            let len = inner.file.metadata().unwrap().len();
            inner.file.set_len(len - 3).unwrap();
        }

        // Torn tail should not surface as an error; prior committed data remains usable.
        let committed = wal.committed_page_writes().unwrap();
        assert_eq!(committed.len(), 1);
    }

    #[test]
    fn truncate_resets_to_empty_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let wal = Wal::open(&path).unwrap();
        wal.log_page_write(1, &page_bytes(1)).unwrap();
        wal.commit().unwrap();
        wal.truncate().unwrap();
        assert!(wal.committed_page_writes().unwrap().is_empty());
    }

    #[test]
    fn reopen_replays_prior_committed_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            let wal = Wal::open(&path).unwrap();
            wal.log_page_write(5, &page_bytes(7)).unwrap();
            wal.commit().unwrap();
        }
        let wal2 = Wal::open(&path).unwrap();
        let committed = wal2.committed_page_writes().unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].0, 5);
    }
}
