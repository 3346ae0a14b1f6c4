//! # Write-Ahead Log (WAL)
//!
//! **Crash-Safe Commit Log for the Ledger**
//!
//! Every ledger transaction is appended here before it becomes visible in
//! memory. On restart the log is replayed:
//! - Committed transactions: replayed in log order
//! - Torn tail (crash mid-append): discarded and truncated
//!
//! ## Guarantees
//!
//! 1. **Durability**: once `append()` returns with `sync_on_commit`, the
//!    transaction is on disk
//! 2. **Atomicity**: a transaction is one contiguous write; a failed write is
//!    truncated away so it can never be replayed
//! 3. **Idempotent replay**: operations are row post-images, replaying them in
//!    order rebuilds the exact committed state
//!
//! ## Format
//!
//! ```text
//! [4 bytes: magic "CWAL"]
//! [4 bytes: version]
//! [8 bytes: next LSN at last checkpoint]
//!
//! Entry format:
//! [8 bytes: LSN (Log Sequence Number)]
//! [1 byte: record type (BEGIN/OP/COMMIT)]
//! [4 bytes: payload length]
//! [N bytes: payload (bincode LedgerOp)]
//! [4 bytes: CRC32 of above]
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::card::{Card, UserAccount};
use crate::error::{EconomyError, EconomyResult};

/// Magic bytes identifying a WAL file.
const WAL_MAGIC: &[u8; 4] = b"CWAL";

/// Current WAL format version.
const WAL_VERSION: u32 = 1;

/// Header size in bytes.
const HEADER_LEN: u64 = 16;

/// WAL record types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Begin a new transaction.
    Begin = 1,
    /// An operation within a transaction.
    Operation = 2,
    /// Commit the transaction (durable).
    Commit = 3,
}

impl RecordType {
    /// Converts from u8.
    const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Begin),
            2 => Some(Self::Operation),
            3 => Some(Self::Commit),
            _ => None,
        }
    }
}

/// A logged row change. Each carries the full row after the change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerOp {
    /// User row after the transaction.
    PutUser(UserAccount),
    /// Card row after the transaction.
    PutCard(Card),
}

/// A WAL record decoded from disk.
#[derive(Clone, Debug)]
struct WalRecord {
    lsn: u64,
    record_type: RecordType,
    payload: Vec<u8>,
}

/// What `open` found on disk.
#[derive(Clone, Debug, Default)]
pub struct Recovered {
    /// Operations of every committed transaction, in log order.
    pub ops: Vec<LedgerOp>,
    /// Number of committed transactions.
    pub transactions: usize,
    /// Bytes of torn tail that were truncated.
    pub discarded_bytes: u64,
}

struct Scan {
    recovered: Recovered,
    valid_len: u64,
    next_lsn: u64,
}

struct WalFile {
    file: File,
    len: u64,
    next_lsn: u64,
}

/// Write-ahead log for ledger transactions.
pub struct WriteAheadLog {
    /// Path to the WAL file.
    path: PathBuf,
    /// Fsync after every append.
    sync_on_commit: bool,
    /// File handle, length and LSN counter (one writer at a time).
    file: Mutex<WalFile>,
    /// Makes the next appends tear halfway and fail.
    #[cfg(test)]
    fail_appends: std::sync::atomic::AtomicBool,
}

impl WriteAheadLog {
    /// Opens or creates a WAL file and recovers its committed transactions.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::StoreUnavailable`] on I/O failure and
    /// [`EconomyError::InvalidConfig`] if the file is not a ledger WAL.
    pub fn open(path: impl AsRef<Path>, sync_on_commit: bool) -> EconomyResult<(Self, Recovered)> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| store_err("failed to open WAL", &e))?;

        let bytes = fs::read(&path).map_err(|e| store_err("failed to read WAL", &e))?;

        let outcome = if bytes.is_empty() {
            let header = encode_header(0);
            write_at(&mut file, 0, &header, true).map_err(|e| store_err("failed to write WAL header", &e))?;
            Scan {
                recovered: Recovered::default(),
                valid_len: HEADER_LEN,
                next_lsn: 0,
            }
        } else {
            scan(&bytes)?
        };

        let mut recovered = outcome.recovered;
        let file_len = bytes.len().max(HEADER_LEN as usize) as u64;
        if outcome.valid_len < file_len {
            recovered.discarded_bytes = file_len - outcome.valid_len;
            warn!(
                path = %path.display(),
                discarded_bytes = recovered.discarded_bytes,
                "WAL recovery: torn tail discarded"
            );
            file.set_len(outcome.valid_len)
                .map_err(|e| store_err("failed to truncate WAL", &e))?;
        }

        info!(
            path = %path.display(),
            transactions = recovered.transactions,
            operations = recovered.ops.len(),
            "WAL recovered"
        );

        let wal = Self {
            path,
            sync_on_commit,
            file: Mutex::new(WalFile {
                file,
                len: outcome.valid_len,
                next_lsn: outcome.next_lsn,
            }),
            #[cfg(test)]
            fail_appends: std::sync::atomic::AtomicBool::new(false),
        };
        Ok((wal, recovered))
    }

    /// Appends one committed transaction.
    ///
    /// BEGIN, the operations and COMMIT are written as one contiguous block.
    /// If the write or sync fails the file is truncated back to where the
    /// block started.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::StoreUnavailable`] if the transaction could not
    /// be made durable.
    pub fn append(&self, ops: &[LedgerOp]) -> EconomyResult<u64> {
        let payloads = encode_ops(ops)?;

        let mut wal = self.file.lock();
        let begin_lsn = wal.next_lsn;
        let block = encode_transaction(begin_lsn, &payloads)?;

        let start = wal.len;
        if let Err(e) = self.write_block(&mut wal.file, start, &block) {
            if let Err(truncate_err) = wal.file.set_len(start) {
                warn!(error = %truncate_err, "WAL truncate after failed append failed");
            }
            return Err(store_err("WAL append failed", &e));
        }

        wal.len = start + block.len() as u64;
        wal.next_lsn = begin_lsn + payloads.len() as u64 + 2;
        Ok(begin_lsn)
    }

    #[cfg(not(test))]
    fn write_block(&self, file: &mut File, offset: u64, block: &[u8]) -> std::io::Result<()> {
        write_at(file, offset, block, self.sync_on_commit)
    }

    #[cfg(test)]
    fn write_block(&self, file: &mut File, offset: u64, block: &[u8]) -> std::io::Result<()> {
        if self.fail_appends.load(std::sync::atomic::Ordering::SeqCst) {
            write_at(file, offset, &block[..block.len() / 2], true)?;
            return Err(std::io::Error::other("injected append failure"));
        }
        write_at(file, offset, block, self.sync_on_commit)
    }

    /// Makes every following append tear and fail until switched off.
    #[cfg(test)]
    pub(crate) fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Replaces the whole log with a single transaction holding `ops`.
    ///
    /// The new log is written to a sibling file, synced, then renamed over the
    /// old one, so a crash leaves either the old or the new log intact.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::StoreUnavailable`] on I/O failure; the old log
    /// stays in place.
    pub fn rewrite(&self, ops: &[LedgerOp]) -> EconomyResult<()> {
        let payloads = encode_ops(ops)?;

        let mut wal = self.file.lock();
        let begin_lsn = wal.next_lsn;

        let mut block = encode_header(begin_lsn).to_vec();
        block.extend_from_slice(&encode_transaction(begin_lsn, &payloads)?);

        let tmp = tmp_path(&self.path);
        let write_tmp = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&block)?;
            file.sync_all()
        };
        write_tmp().map_err(|e| store_err("failed to write WAL checkpoint", &e))?;
        fs::rename(&tmp, &self.path).map_err(|e| store_err("failed to install WAL checkpoint", &e))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| store_err("failed to reopen WAL", &e))?;

        wal.file = file;
        wal.len = block.len() as u64;
        wal.next_lsn = begin_lsn + payloads.len() as u64 + 2;
        Ok(())
    }

    /// Path to the WAL file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the log in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.file.lock().len
    }
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("path", &self.path)
            .field("sync_on_commit", &self.sync_on_commit)
            .finish_non_exhaustive()
    }
}

fn store_err(context: &str, err: &std::io::Error) -> EconomyError {
    EconomyError::StoreUnavailable(format!("{context}: {err}"))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_at(file: &mut File, offset: u64, bytes: &[u8], sync: bool) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)?;
    if sync {
        file.sync_data()?;
    }
    Ok(())
}

fn encode_header(next_lsn: u64) -> [u8; HEADER_LEN as usize] {
    let mut header = [0u8; HEADER_LEN as usize];
    header[0..4].copy_from_slice(WAL_MAGIC);
    header[4..8].copy_from_slice(&WAL_VERSION.to_le_bytes());
    header[8..16].copy_from_slice(&next_lsn.to_le_bytes());
    header
}

fn encode_ops(ops: &[LedgerOp]) -> EconomyResult<Vec<Vec<u8>>> {
    ops.iter()
        .map(|op| {
            bincode::serialize(op)
                .map_err(|e| EconomyError::StoreUnavailable(format!("failed to encode WAL op: {e}")))
        })
        .collect()
}

fn encode_transaction(begin_lsn: u64, payloads: &[Vec<u8>]) -> EconomyResult<Vec<u8>> {
    let mut block = Vec::new();
    let mut lsn = begin_lsn;
    encode_record(&mut block, lsn, RecordType::Begin, &[])?;
    for payload in payloads {
        lsn += 1;
        encode_record(&mut block, lsn, RecordType::Operation, payload)?;
    }
    encode_record(&mut block, lsn + 1, RecordType::Commit, &[])?;
    Ok(block)
}

fn encode_record(out: &mut Vec<u8>, lsn: u64, record_type: RecordType, payload: &[u8]) -> EconomyResult<()> {
    let len = u32::try_from(payload.len()).map_err(|_| EconomyError::ArithmeticOverflow)?;
    let start = out.len();
    out.extend_from_slice(&lsn.to_le_bytes());
    out.push(record_type as u8);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    let crc = crc32fast::hash(&out[start..]);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(())
}

/// Decodes one record from the front of `buf`.
///
/// Returns the record and the number of bytes it used, or `None` if the bytes
/// are short, the record type is unknown or the CRC does not match.
fn decode_record(buf: &[u8]) -> Option<(WalRecord, usize)> {
    let lsn = u64::from_le_bytes(buf.get(0..8)?.try_into().ok()?);
    let record_type = RecordType::from_u8(*buf.get(8)?)?;
    let len = u32::from_le_bytes(buf.get(9..13)?.try_into().ok()?) as usize;
    let payload_end = 13usize.checked_add(len)?;
    let payload = buf.get(13..payload_end)?;
    let stored_crc = u32::from_le_bytes(buf.get(payload_end..payload_end + 4)?.try_into().ok()?);

    if crc32fast::hash(buf.get(..payload_end)?) != stored_crc {
        return None;
    }

    Some((
        WalRecord {
            lsn,
            record_type,
            payload: payload.to_vec(),
        },
        payload_end + 4,
    ))
}

fn scan(bytes: &[u8]) -> EconomyResult<Scan> {
    let header = bytes
        .get(..HEADER_LEN as usize)
        .ok_or_else(|| EconomyError::InvalidConfig("truncated WAL header".to_string()))?;
    if &header[0..4] != WAL_MAGIC {
        return Err(EconomyError::InvalidConfig("invalid WAL magic".to_string()));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != WAL_VERSION {
        return Err(EconomyError::InvalidConfig(format!("unsupported WAL version: {version}")));
    }
    let mut lsn_bytes = [0u8; 8];
    lsn_bytes.copy_from_slice(&header[8..16]);
    let mut next_lsn = u64::from_le_bytes(lsn_bytes);

    let mut recovered = Recovered::default();
    let mut pending: Option<Vec<LedgerOp>> = None;
    let mut offset = HEADER_LEN as usize;
    let mut valid_len = HEADER_LEN;

    while let Some((record, used)) = bytes.get(offset..).and_then(decode_record) {
        offset += used;
        next_lsn = next_lsn.max(record.lsn + 1);

        match record.record_type {
            // A BEGIN inside an open transaction means the previous one was torn.
            RecordType::Begin => pending = Some(Vec::new()),
            RecordType::Operation => {
                let Some(ops) = pending.as_mut() else { break };
                match bincode::deserialize::<LedgerOp>(&record.payload) {
                    Ok(op) => ops.push(op),
                    Err(_) => break,
                }
            }
            RecordType::Commit => {
                let Some(ops) = pending.take() else { break };
                recovered.ops.extend(ops);
                recovered.transactions += 1;
                valid_len = offset as u64;
            }
        }
    }

    Ok(Scan {
        recovered,
        valid_len,
        next_lsn,
    })
}
