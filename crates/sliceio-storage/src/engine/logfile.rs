//! Append-only log file engine
//!
//! Every put or delete appends one checksummed record; an in-memory index
//! maps live keys to the offset of their latest value. On open the file is
//! replayed to rebuild the index, and a torn tail left by a crash is cut off.
//!
//! Record format (little-endian):
//! ```text
//! +-------+----+------------+--------------+-----+-------+--------+
//! | Magic | Op | Key length | Value length | Key | Value | CRC32C |
//! | 4B    | 1B | 4B         | 4B           | var | var   | 4B     |
//! +-------+----+------------+--------------+-----+-------+--------+
//! ```

use super::KvEngine;
use parking_lot::Mutex;
use sliceio_common::{Error, Result, StorageBackend};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Record magic number
const LOG_MAGIC: u32 = 0x474F_4C53; // "SLOG"

/// Header size (magic + op + key length + value length)
const HEADER_SIZE: usize = 13;

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// Location of a live value inside the file
#[derive(Clone, Copy, Debug)]
struct ValueRef {
    offset: u64,
    len: u32,
}

struct LogState {
    file: File,
    index: HashMap<Vec<u8>, ValueRef>,
    size: u64,
    /// Set when a failed append could not be rolled back; writes are refused
    poisoned: bool,
}

fn encode_record(op: u8, key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + key.len() + value.len() + 4);
    buf.extend_from_slice(&LOG_MAGIC.to_le_bytes());
    buf.push(op);
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    let crc = crc32c::crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}

/// Key-value engine over a single append-only file
pub struct LogFileEngine {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl LogFileEngine {
    /// Open (or create) the log at `path`, replaying existing records
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (index, valid_len) = Self::replay(path)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let file_len = file.metadata()?.len();
        if file_len > valid_len {
            warn!(
                path = %path.display(),
                dropped = file_len - valid_len,
                "Truncating torn tail of slice log"
            );
            file.set_len(valid_len)?;
        }

        debug!(path = %path.display(), keys = index.len(), "Opened slice log");

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(LogState {
                file,
                index,
                size: valid_len,
                poisoned: false,
            }),
        })
    }

    /// Rebuild the index from the file; returns it with the length of the
    /// longest prefix made of intact records.
    fn replay(path: &Path) -> Result<(HashMap<Vec<u8>, ValueRef>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((HashMap::new(), 0));
            }
            Err(e) => return Err(e.into()),
        };

        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut index = HashMap::new();
        let mut pos = 0u64;
        let mut header = [0u8; HEADER_SIZE];

        loop {
            if reader.read_exact(&mut header).is_err() {
                break;
            }
            if le_u32(&header[0..4]) != LOG_MAGIC {
                break;
            }
            let op = header[4];
            let key_len = le_u32(&header[5..9]) as usize;
            let value_len = le_u32(&header[9..13]) as usize;
            let record_len = (HEADER_SIZE + key_len + value_len + 4) as u64;
            if pos + record_len > file_len {
                break;
            }

            let mut body = vec![0u8; key_len + value_len + 4];
            if reader.read_exact(&mut body).is_err() {
                break;
            }
            let stored_crc = le_u32(&body[key_len + value_len..]);
            let mut crc = crc32c::crc32c(&header);
            crc = crc32c::crc32c_append(crc, &body[..key_len + value_len]);
            if crc != stored_crc {
                break;
            }

            let key = body[..key_len].to_vec();
            match op {
                OP_PUT => {
                    let value_ref = ValueRef {
                        offset: pos + (HEADER_SIZE + key_len) as u64,
                        len: value_len as u32,
                    };
                    index.insert(key, value_ref);
                }
                OP_DELETE => {
                    index.remove(&key);
                }
                _ => break,
            }
            pos += record_len;
        }

        Ok((index, pos))
    }

    fn append(&self, state: &mut LogState, record: &[u8]) -> Result<u64> {
        self.append_with(state, record, |file, record| file.write_all(record))
    }

    /// Append `record` through `write`, returning its start offset.
    ///
    /// A write may fail after part of the record reached the file. The file
    /// is then cut back to `start` so the next record lands where the index
    /// expects it; if that fails too, the log refuses further writes.
    fn append_with(
        &self,
        state: &mut LogState,
        record: &[u8],
        write: impl FnOnce(&mut File, &[u8]) -> std::io::Result<()>,
    ) -> Result<u64> {
        if state.poisoned {
            return Err(Error::engine(format!(
                "{}: log is read-only after a failed append",
                self.path.display()
            )));
        }

        let start = state.size;
        if let Err(e) = write(&mut state.file, record) {
            if let Err(truncate_err) = state.file.set_len(start) {
                error!(
                    path = %self.path.display(),
                    offset = start,
                    error = %truncate_err,
                    "Cannot roll back partial append"
                );
                state.poisoned = true;
            } else {
                warn!(path = %self.path.display(), offset = start, error = %e, "Append failed, rolled back");
            }
            return Err(e.into());
        }
        state.size += record.len() as u64;
        Ok(start)
    }
}

impl KvEngine for LogFileEngine {
    fn backend(&self) -> StorageBackend {
        StorageBackend::LogFile
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let value_len = u32::try_from(value.len())
            .map_err(|_| Error::engine(format!("value of {} bytes too large", value.len())))?;
        let record = encode_record(OP_PUT, key, value);

        let mut state = self.state.lock();
        let start = self.append(&mut state, &record)?;
        state.index.insert(
            key.to_vec(),
            ValueRef {
                offset: start + (HEADER_SIZE + key.len()) as u64,
                len: value_len,
            },
        );
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        let Some(value_ref) = state.index.get(key).copied() else {
            return Ok(None);
        };
        let mut value = vec![0u8; value_ref.len as usize];
        state.file.seek(SeekFrom::Start(value_ref.offset))?;
        state.file.read_exact(&mut value).map_err(|e| {
            Error::DataCorruption(format!(
                "{}: short read at offset {}: {e}",
                self.path.display(),
                value_ref.offset
            ))
        })?;
        Ok(Some(value))
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.index.contains_key(key) {
            return Ok(false);
        }
        let record = encode_record(OP_DELETE, key, &[]);
        self.append(&mut state, &record)?;
        state.index.remove(key);
        Ok(true)
    }

    fn approx_size(&self) -> Result<u64> {
        Ok(self.state.lock().size)
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.file.flush()?;
        state.file.sync_data()?;
        Ok(())
    }
}

impl Drop for LogFileEngine {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(path = %self.path.display(), error = %e, "Failed to sync slice log on close");
        }
    }
}
