//! Side index of a zip archive's member payloads.
//!
//! For every non-directory member the index records where the member's compressed bytes start
//! inside the archive and how many there are. With it one member can be fetched with a single
//! ranged read and inflated locally, without downloading the archive.
//!
//! Persisted as headerless CSV, one `name,header_offset,compress_size` record per member,
//! sorted by name. Stored members (symlinks) carry a fourth `stored` column.

use std::io::{Cursor, Read};

use flate2::read::DeflateDecoder;
use serde::{Deserialize, Serialize};
use zip::{CompressionMethod, ZipArchive};

use crate::artifact::error::ZipIndexError;
use crate::core::client::storage::ByteRange;

const LOCAL_FILE_HEADER_SIGNATURE: u32 = 0x0403_4b50;
/// Fixed part of a local file header, before the file name and extra field
const LOCAL_FILE_HEADER_SIZE: u64 = 30;
const FILE_NAME_LENGTH_OFFSET: usize = 26;
const EXTRA_FIELD_LENGTH_OFFSET: usize = 28;

/// How a member's payload is encoded in the archive
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    #[default]
    Deflated,
    Stored,
}

impl PayloadEncoding {
    fn is_deflated(&self) -> bool {
        *self == PayloadEncoding::Deflated
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ZipIndexEntry {
    /// Member path relative to the archive root
    pub name: String,
    /// Absolute offset of the member's compressed payload (past its local header)
    pub header_offset: u64,
    pub compress_size: u64,
    #[serde(default, skip_serializing_if = "PayloadEncoding::is_deflated")]
    pub encoding: PayloadEncoding,
}

impl ZipIndexEntry {
    pub fn deflated(name: impl Into<String>, header_offset: u64, compress_size: u64) -> Self {
        Self { name: name.into(), header_offset, compress_size, encoding: PayloadEncoding::Deflated }
    }

    /// Byte range of the compressed payload. `None` for zero-length payloads.
    pub fn range(&self) -> Result<Option<ByteRange>, ZipIndexError> {
        if self.compress_size == 0 {
            return Ok(None);
        }
        ByteRange::from_offset(self.header_offset, self.compress_size)
            .map(Some)
            .ok_or_else(|| self.corrupt(format!("range at offset {} overflows", self.header_offset)))
    }

    /// Fails when the payload does not fit in an archive of `archive_size` bytes.
    pub fn check_bounds(&self, archive_size: u64) -> Result<(), ZipIndexError> {
        match self.header_offset.checked_add(self.compress_size) {
            Some(end) if end <= archive_size => Ok(()),
            _ => Err(self.corrupt(format!(
                "{} bytes at offset {} do not fit in an archive of {archive_size} bytes",
                self.compress_size, self.header_offset
            ))),
        }
    }

    /// Decode the raw payload fetched for this entry.
    pub fn decompress(&self, payload: &[u8]) -> Result<Vec<u8>, ZipIndexError> {
        if payload.len() as u64 != self.compress_size {
            return Err(self.corrupt(format!("expected {} payload bytes, got {}", self.compress_size, payload.len())));
        }
        if payload.is_empty() || self.encoding == PayloadEncoding::Stored {
            return Ok(payload.to_vec());
        }

        let mut content = Vec::new();
        DeflateDecoder::new(payload).read_to_end(&mut content).map_err(|e| self.corrupt(e.to_string()))?;
        Ok(content)
    }

    fn corrupt(&self, reason: String) -> ZipIndexError {
        ZipIndexError::IndexCorrupt { name: self.name.clone(), reason }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZipIndex {
    entries: Vec<ZipIndexEntry>,
}

impl ZipIndex {
    /// Build the index of an archive held in memory. Directories are not indexed.
    ///
    /// Payload offsets come from each member's actual local header (fixed fields, file name and
    /// extra field lengths), so archives with per-member extra fields (zip64, timestamps, unix
    /// ids) are indexed correctly.
    pub fn from_archive(archive_bytes: &[u8]) -> Result<Self, ZipIndexError> {
        let mut archive = ZipArchive::new(Cursor::new(archive_bytes))?;
        let mut entries = Vec::with_capacity(archive.len());

        for i in 0..archive.len() {
            let member = archive.by_index_raw(i)?;
            if member.is_dir() {
                continue;
            }

            let name = member.name().to_string();
            let encoding = match member.compression() {
                CompressionMethod::Deflated => PayloadEncoding::Deflated,
                CompressionMethod::Stored => PayloadEncoding::Stored,
                method => return Err(ZipIndexError::UnsupportedCompression { name, method: format!("{method:?}") }),
            };

            let header_offset = payload_offset(archive_bytes, member.header_start(), &name)?;
            let entry = ZipIndexEntry { name, header_offset, compress_size: member.compressed_size(), encoding };
            entry.check_bounds(archive_bytes.len() as u64)?;
            entries.push(entry);
        }

        Ok(Self::from_entries(entries))
    }

    /// Sorts by name; binary search relies on it.
    pub fn from_entries(mut entries: Vec<ZipIndexEntry>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Self { entries }
    }

    pub fn entries(&self) -> &[ZipIndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    pub fn find(&self, name: &str) -> Result<&ZipIndexEntry, ZipIndexError> {
        self.entries
            .binary_search_by(|entry| entry.name.as_str().cmp(name))
            .map(|position| &self.entries[position])
            .map_err(|_| ZipIndexError::EntryNotFound(name.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ZipIndexError> {
        let mut writer = csv::WriterBuilder::new().has_headers(false).flexible(true).from_writer(Vec::new());
        for entry in &self.entries {
            writer.serialize(entry)?;
        }
        writer.into_inner().map_err(|e| ZipIndexError::IoError(e.into_error()))
    }

    pub fn parse(data: &[u8]) -> Result<Self, ZipIndexError> {
        let mut reader = csv::ReaderBuilder::new().has_headers(false).flexible(true).from_reader(data);
        let entries = reader.deserialize().collect::<Result<Vec<ZipIndexEntry>, _>>()?;
        Ok(Self::from_entries(entries))
    }
}

/// Offset of a member's payload, read from its local file header at `header_start`.
fn payload_offset(archive: &[u8], header_start: u64, name: &str) -> Result<u64, ZipIndexError> {
    let invalid = || ZipIndexError::InvalidLocalHeader { name: name.to_string(), offset: header_start };

    let start = usize::try_from(header_start).map_err(|_| invalid())?;
    let header = archive.get(start..start + LOCAL_FILE_HEADER_SIZE as usize).ok_or_else(invalid)?;

    let signature = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if signature != LOCAL_FILE_HEADER_SIGNATURE {
        return Err(invalid());
    }

    let name_len = u16::from_le_bytes([header[FILE_NAME_LENGTH_OFFSET], header[FILE_NAME_LENGTH_OFFSET + 1]]);
    let extra_len = u16::from_le_bytes([header[EXTRA_FIELD_LENGTH_OFFSET], header[EXTRA_FIELD_LENGTH_OFFSET + 1]]);

    Ok(header_start + LOCAL_FILE_HEADER_SIZE + u64::from(name_len) + u64::from(extra_len))
}
