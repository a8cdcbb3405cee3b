//! Immutable sequence-of-words files.
//!
//! A word file is an ordered list of opaque byte strings, each addressable
//! by the byte offset at which it starts. The writer produces the file in
//! one pass and seals it with a footer (data length, word count, CRC-64,
//! magic); readers open it read-only through a memory mapping and walk it
//! with a cursor. Everything above this module treats word files as the
//! compression-codec collaborator: an ordered, offset-addressable store.

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{Crc, CRC_64_ECMA_182};
use memmap2::Mmap;

use crate::error::{Error, Result};

const WORDS_MAGIC: u32 = 0x5354_5257; // "STRW"
const FOOTER_LEN: u64 = 28; // data_len + count + crc + magic

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

fn write_uvarint(out: &mut impl Write, mut v: u64) -> std::io::Result<u64> {
    let mut written = 0u64;
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.write_all(&[byte])?;
        written += 1;
        if v == 0 {
            return Ok(written);
        }
    }
}

fn read_uvarint(data: &[u8], pos: usize) -> Result<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    let mut at = pos;
    loop {
        let byte = *data
            .get(at)
            .ok_or_else(|| Error::Corruption("word length runs past end of data".into()))?;
        if shift >= 64 {
            return Err(Error::Corruption("word length varint overflows u64".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        at += 1;
        if byte & 0x80 == 0 {
            return Ok((value, at));
        }
        shift += 7;
    }
}

/// Single-pass writer producing a sealed word file.
pub struct WordWriter {
    file: BufWriter<File>,
    path: PathBuf,
    offset: u64,
    count: u64,
}

impl WordWriter {
    pub fn create(path: &Path) -> Result<Self> {
        // Opened read+write: finish() streams the data back through the
        // checksum before sealing the footer.
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: BufWriter::new(file),
            path: path.to_path_buf(),
            offset: 0,
            count: 0,
        })
    }

    /// Append one word, returning the offset it starts at.
    pub fn add_word(&mut self, word: &[u8]) -> Result<u64> {
        let offset = self.offset;
        self.offset += write_uvarint(&mut self.file, word.len() as u64)?;
        self.file.write_all(word)?;
        self.offset += word.len() as u64;
        self.count += 1;
        Ok(offset)
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seal the file: checksum the data region and append the footer.
    pub fn finish(self) -> Result<()> {
        let data_len = self.offset;
        let count = self.count;
        let mut file = self
            .file
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;

        file.seek(SeekFrom::Start(0))?;
        let mut digest = CRC64.digest();
        let mut remaining = data_len;
        let mut buf = [0u8; 64 * 1024];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            file.read_exact(&mut buf[..want])?;
            digest.update(&buf[..want]);
            remaining -= want as u64;
        }
        let checksum = digest.finalize();

        file.seek(SeekFrom::Start(data_len))?;
        let mut footer = BufWriter::new(&mut file);
        footer.write_u64::<BigEndian>(data_len)?;
        footer.write_u64::<BigEndian>(count)?;
        footer.write_u64::<BigEndian>(checksum)?;
        footer.write_u32::<BigEndian>(WORDS_MAGIC)?;
        footer.flush()?;
        drop(footer);
        file.sync_all()?;
        Ok(())
    }
}

/// Sealed word file, memory-mapped read-only.
pub struct WordFile {
    mmap: Mmap,
    data_len: usize,
    count: u64,
    path: PathBuf,
}

impl WordFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < FOOTER_LEN {
            return Err(Error::Corruption(format!(
                "word file {} too short for footer",
                path.display()
            )));
        }
        let mmap = unsafe { Mmap::map(&file)? };
        let footer = &mmap[(len - FOOTER_LEN) as usize..];
        let data_len = BigEndian::read_u64(&footer[0..8]);
        let count = BigEndian::read_u64(&footer[8..16]);
        let checksum = BigEndian::read_u64(&footer[16..24]);
        let magic = BigEndian::read_u32(&footer[24..28]);
        if magic != WORDS_MAGIC {
            return Err(Error::Corruption(format!(
                "word file {} has bad magic",
                path.display()
            )));
        }
        if data_len.checked_add(FOOTER_LEN) != Some(len) {
            return Err(Error::Corruption(format!(
                "word file {} data length disagrees with file size",
                path.display()
            )));
        }
        let data = &mmap[..data_len as usize];
        if CRC64.checksum(data) != checksum {
            return Err(Error::Corruption(format!(
                "word file {} failed checksum",
                path.display()
            )));
        }
        Ok(Self {
            mmap,
            data_len: data_len as usize,
            count,
            path: path.to_path_buf(),
        })
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn getter(&self) -> WordGetter<'_> {
        WordGetter {
            data: &self.mmap[..self.data_len],
            pos: 0,
        }
    }
}

/// Cursor over the words of a [`WordFile`].
pub struct WordGetter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WordGetter<'a> {
    pub fn has_next(&self) -> bool {
        self.pos < self.data.len()
    }

    pub fn offset(&self) -> u64 {
        self.pos as u64
    }

    pub fn reset(&mut self, offset: u64) {
        self.pos = offset as usize;
    }

    /// Read the word at the cursor and advance past it.
    pub fn next(&mut self) -> Result<&'a [u8]> {
        let (len, start) = read_uvarint(self.data, self.pos)?;
        let end = start
            .checked_add(len as usize)
            .filter(|&e| e <= self.data.len())
            .ok_or_else(|| Error::Corruption("word runs past end of data".into()))?;
        self.pos = end;
        Ok(&self.data[start..end])
    }

    /// Advance past the word at the cursor, returning the next offset.
    pub fn skip(&mut self) -> Result<u64> {
        self.next()?;
        Ok(self.pos as u64)
    }

    /// Compare the word at the cursor against `expected`, advancing past it.
    pub fn match_word(&mut self, expected: &[u8]) -> Result<bool> {
        Ok(self.next()? == expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::NamedTempFile;

    fn build(words: &[&[u8]]) -> (NamedTempFile, Vec<u64>) {
        let tmp = NamedTempFile::new().unwrap();
        let mut writer = WordWriter::create(tmp.path()).unwrap();
        let mut offsets = Vec::new();
        for word in words {
            offsets.push(writer.add_word(word).unwrap());
        }
        writer.finish().unwrap();
        (tmp, offsets)
    }

    #[test]
    fn test_write_read_roundtrip() {
        let words: Vec<&[u8]> = vec![b"alpha", b"", b"beta", b"a much longer word payload"];
        let (tmp, _) = build(&words);

        let file = WordFile::open(tmp.path()).unwrap();
        assert_eq!(file.count(), 4);
        let mut getter = file.getter();
        for word in &words {
            assert!(getter.has_next());
            assert_eq!(getter.next().unwrap(), *word);
        }
        assert!(!getter.has_next());
    }

    #[test]
    fn test_reset_and_match() {
        let (tmp, offsets) = build(&[b"k1", b"v1", b"k2", b"v2"]);
        let file = WordFile::open(tmp.path()).unwrap();
        let mut getter = file.getter();

        getter.reset(offsets[2]);
        assert!(getter.match_word(b"k2").unwrap());
        assert_eq!(getter.next().unwrap(), b"v2");

        getter.reset(offsets[0]);
        assert!(!getter.match_word(b"k2").unwrap());
    }

    #[test]
    fn test_skip_returns_next_offset() {
        let (tmp, offsets) = build(&[b"first", b"second"]);
        let file = WordFile::open(tmp.path()).unwrap();
        let mut getter = file.getter();
        assert_eq!(getter.skip().unwrap(), offsets[1]);
        assert_eq!(getter.next().unwrap(), b"second");
    }

    #[test]
    fn test_empty_file() {
        let (tmp, _) = build(&[]);
        let file = WordFile::open(tmp.path()).unwrap();
        assert_eq!(file.count(), 0);
        assert!(!file.getter().has_next());
    }

    #[test]
    fn test_detects_corruption() {
        let (tmp, _) = build(&[b"payload"]);
        let mut bytes = std::fs::read(tmp.path()).unwrap();
        bytes[2] ^= 0xff;
        std::fs::write(tmp.path(), &bytes).unwrap();
        assert!(matches!(
            WordFile::open(tmp.path()),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_rejects_truncated_file() {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"short").unwrap();
        assert!(matches!(
            WordFile::open(tmp.path()),
            Err(Error::Corruption(_))
        ));
    }
}
