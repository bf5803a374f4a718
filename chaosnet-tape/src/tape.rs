//! Tape image files.
//!
//! Record layout:
//!
//! ```text
//! +------------+------------------------+------------+
//! | length     | data (padded to even)  | length     |
//! | u32 LE     | length bytes (+ pad)   | u32 LE     |
//! +------------+------------------------+------------+
//! ```
//!
//! A zero length word is a file mark and `0xFFFFFFFF` ends the recorded
//! medium. Running off the end of the file reads as end of medium too.

use crate::error::TapeError;
use crate::{EOM_WORD, ERROR_BIT, LENGTH_WORD_SIZE, MARK_WORD, MAX_RECORD};
use bytes::{BufMut, Bytes, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One item read from a tape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Data(Bytes),
    Mark,
    EndOfMedium,
}

/// Reads records from any byte source, such as standard input.
pub struct RecordReader<R> {
    inner: R,
    offset: u64,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    /// Returns the offset of the next record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn read_record(&mut self) -> Result<Record, TapeError> {
        let (record, consumed) = read_framed(&mut self.inner, self.offset)?;
        self.offset += consumed;
        Ok(record)
    }
}

/// A tape image mounted on a drive.
pub struct TapeImage {
    path: PathBuf,
    file: File,
    writable: bool,
    /// End of the last write since the last rewind.
    written_end: Option<u64>,
}

impl TapeImage {
    /// Opens an existing image for reading only.
    pub fn open_read(path: impl AsRef<Path>) -> Result<Self, TapeError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).open(&path)?;
        Ok(Self::from_file(path, file, false))
    }

    /// Creates an image, discarding any previous contents.
    pub fn open_write(path: impl AsRef<Path>) -> Result<Self, TapeError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self::from_file(path, file, true))
    }

    /// Opens an image for reading and writing, creating it if absent.
    pub fn open_both(path: impl AsRef<Path>) -> Result<Self, TapeError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self::from_file(path, file, true))
    }

    fn from_file(path: PathBuf, file: File, writable: bool) -> Self {
        debug!("Opened tape image {} (writable: {})", path.display(), writable);
        Self {
            path,
            file,
            writable,
            written_end: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Returns the current offset within the image.
    pub fn position(&mut self) -> Result<u64, TapeError> {
        Ok(self.file.stream_position()?)
    }

    /// Reads the next record.
    ///
    /// An end-of-medium word is left in place so that writing continues the
    /// tape from there.
    pub fn read_record(&mut self) -> Result<Record, TapeError> {
        let offset = self.file.stream_position()?;
        let (record, consumed) = read_framed(&mut self.file, offset)?;
        if record == Record::EndOfMedium && consumed > 0 {
            self.file.seek(SeekFrom::Start(offset))?;
        }
        Ok(record)
    }

    /// Writes one data record.
    pub fn write_record(&mut self, data: &[u8]) -> Result<(), TapeError> {
        self.check_writable()?;
        if data.len() > MAX_RECORD {
            return Err(TapeError::RecordTooLarge {
                size: data.len(),
                max: MAX_RECORD,
            });
        }

        let padded = data.len() + (data.len() & 1);
        let mut buf = BytesMut::with_capacity(2 * LENGTH_WORD_SIZE + padded);
        buf.put_u32_le(data.len() as u32);
        buf.put_slice(data);
        buf.put_bytes(0, padded - data.len());
        buf.put_u32_le(data.len() as u32);

        self.file.write_all(&buf)?;
        self.written_end = Some(self.file.stream_position()?);
        Ok(())
    }

    /// Writes a file mark.
    pub fn write_mark(&mut self) -> Result<(), TapeError> {
        self.check_writable()?;
        self.file.write_all(&MARK_WORD.to_le_bytes())?;
        self.written_end = Some(self.file.stream_position()?);
        Ok(())
    }

    /// Ends the recorded medium after the last write.
    ///
    /// Only acts if the tape was written since the last rewind: the
    /// end-of-medium word goes right after the last record or mark written,
    /// anything after it is cut off, and the position is restored. Backing
    /// over a mark does not move the end, so a double mark survives. An
    /// image that was only read is not touched.
    pub fn write_eot(&mut self) -> Result<(), TapeError> {
        self.check_writable()?;
        let Some(end) = self.written_end.take() else {
            return Ok(());
        };

        let position = self.file.stream_position()?;
        self.file.seek(SeekFrom::Start(end))?;
        self.file.write_all(&EOM_WORD.to_le_bytes())?;
        self.file.set_len(end + LENGTH_WORD_SIZE as u64)?;
        self.file.seek(SeekFrom::Start(position.min(end)))?;
        self.file.sync_data()?;

        debug!("Wrote end of medium at offset {} of {}", end, self.path.display());
        Ok(())
    }

    /// Repositions to the beginning of the tape.
    pub fn rewind(&mut self) -> Result<(), TapeError> {
        self.file.seek(SeekFrom::Start(0))?;
        self.written_end = None;
        Ok(())
    }

    /// Backs up over the file mark just written.
    pub fn back_over_mark(&mut self) -> Result<(), TapeError> {
        self.file.seek(SeekFrom::Current(-(LENGTH_WORD_SIZE as i64)))?;
        Ok(())
    }

    fn check_writable(&self) -> Result<(), TapeError> {
        if self.writable {
            Ok(())
        } else {
            Err(TapeError::NotWritable)
        }
    }
}

/// Reads as much of `buf` as the source can supply.
fn read_fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_length<R: Read>(reader: &mut R, offset: u64) -> Result<Option<u32>, TapeError> {
    let mut word = [0u8; LENGTH_WORD_SIZE];
    match read_fill(reader, &mut word)? {
        0 => Ok(None),
        LENGTH_WORD_SIZE => Ok(Some(u32::from_le_bytes(word))),
        n => Err(TapeError::Corrupt {
            offset,
            reason: format!("partial length word ({} bytes)", n),
        }),
    }
}

/// Reads one framed record, returning it with the number of bytes consumed.
fn read_framed<R: Read>(reader: &mut R, offset: u64) -> Result<(Record, u64), TapeError> {
    let length = match read_length(reader, offset)? {
        None => return Ok((Record::EndOfMedium, 0)),
        Some(MARK_WORD) => return Ok((Record::Mark, LENGTH_WORD_SIZE as u64)),
        Some(EOM_WORD) => return Ok((Record::EndOfMedium, LENGTH_WORD_SIZE as u64)),
        Some(length) => length,
    };

    if length & ERROR_BIT != 0 {
        return Err(TapeError::Corrupt {
            offset,
            reason: format!("error record (length word {:#010x})", length),
        });
    }

    let size = length as usize;
    if size > MAX_RECORD {
        return Err(TapeError::Corrupt {
            offset,
            reason: format!("record length {} exceeds {}", size, MAX_RECORD),
        });
    }

    let padded = size + (size & 1);
    let mut data = vec![0u8; padded];
    if read_fill(reader, &mut data)? < padded {
        return Err(TapeError::Corrupt {
            offset,
            reason: "truncated record data".to_string(),
        });
    }
    data.truncate(size);

    match read_length(reader, offset)? {
        Some(trailer) if trailer == length => {}
        _ => {
            return Err(TapeError::Corrupt {
                offset,
                reason: "length words disagree".to_string(),
            })
        }
    }

    let consumed = (2 * LENGTH_WORD_SIZE + padded) as u64;
    Ok((Record::Data(Bytes::from(data)), consumed))
}
