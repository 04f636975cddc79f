//! Stored file identifiers.
//!
//! A file id is URL-safe base64 over a zero-run-length-encoded little-endian
//! record:
//!
//! ```text
//! i32 type | flags   i32 datacenter
//! [bytes file_reference]          (when FILE_REFERENCE_FLAG is set)
//! i64 media_id       i64 access_hash
//! [string thumbnail_size]         (photo types only)
//! u8 minor_version   u8 major_version
//! ```
//!
//! `bytes`/`string` fields use the length-prefixed, 4-byte padded layout of
//! the backend's wire format. Zero bytes are run-length encoded as a `0x00`
//! marker followed by the run length.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use thiserror::Error;

use crate::error::ProxyError;

pub type DcId = i32;

const MAJOR_VERSION: u8 = 4;
const MINOR_VERSION: u8 = 30;
const WEB_LOCATION_FLAG: u32 = 1 << 24;
const FILE_REFERENCE_FLAG: u32 = 1 << 25;
const TYPE_MASK: u32 = 0x00ff_ffff;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocationError {
    #[error("file id is not valid base64")]
    Base64,

    #[error("file id truncated")]
    Truncated,

    #[error("unsupported file id version {0}")]
    Version(u8),

    #[error("unknown file type {0}")]
    UnknownType(u32),

    #[error("web locations cannot be streamed")]
    WebLocation,

    #[error("{0} trailing bytes in file id")]
    Trailing(usize),
}

impl From<LocationError> for ProxyError {
    fn from(err: LocationError) -> Self {
        ProxyError::Internal(format!("file id: {err}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Photo,
    Voice,
    Video,
    Document,
    Sticker,
    Audio,
    Animation,
    VideoNote,
    DocumentAsFile,
}

impl FileType {
    fn code(self) -> u32 {
        match self {
            FileType::Photo => 2,
            FileType::Voice => 3,
            FileType::Video => 4,
            FileType::Document => 5,
            FileType::Sticker => 8,
            FileType::Audio => 9,
            FileType::Animation => 10,
            FileType::VideoNote => 13,
            FileType::DocumentAsFile => 17,
        }
    }

    fn from_code(code: u32) -> Result<Self, LocationError> {
        Ok(match code {
            2 => FileType::Photo,
            3 => FileType::Voice,
            4 => FileType::Video,
            5 => FileType::Document,
            8 => FileType::Sticker,
            9 => FileType::Audio,
            10 => FileType::Animation,
            13 => FileType::VideoNote,
            17 => FileType::DocumentAsFile,
            other => return Err(LocationError::UnknownType(other)),
        })
    }

    fn has_thumbnail_size(self) -> bool {
        matches!(self, FileType::Photo)
    }
}

/// Where a stored file lives and how to ask for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocation {
    pub file_type: FileType,
    pub datacenter: DcId,
    pub media_id: i64,
    pub access_hash: i64,
    pub file_reference: Vec<u8>,
    pub thumbnail_size: Option<String>,
}

impl FileLocation {
    pub fn decode(file_id: &str) -> Result<Self, LocationError> {
        let packed = URL_SAFE_NO_PAD
            .decode(file_id.trim_end_matches('='))
            .map_err(|_| LocationError::Base64)?;
        let raw = rle_decode(&packed);

        let (body, versions) = raw
            .split_at_checked(raw.len().saturating_sub(2))
            .filter(|(_, v)| v.len() == 2)
            .ok_or(LocationError::Truncated)?;
        if versions[1] != MAJOR_VERSION {
            return Err(LocationError::Version(versions[1]));
        }

        let mut r = Reader { buf: body };
        let type_word = r.u32()?;
        if type_word & WEB_LOCATION_FLAG != 0 {
            return Err(LocationError::WebLocation);
        }
        let file_type = FileType::from_code(type_word & TYPE_MASK)?;
        let datacenter = r.i32()?;
        let file_reference = if type_word & FILE_REFERENCE_FLAG != 0 {
            r.tl_bytes()?
        } else {
            Vec::new()
        };
        let media_id = r.i64()?;
        let access_hash = r.i64()?;
        let thumbnail_size = if file_type.has_thumbnail_size() {
            let raw = r.tl_bytes()?;
            Some(String::from_utf8_lossy(&raw).into_owned())
        } else {
            None
        };
        if !r.buf.is_empty() {
            return Err(LocationError::Trailing(r.buf.len()));
        }

        Ok(Self {
            file_type,
            datacenter,
            media_id,
            access_hash,
            file_reference,
            thumbnail_size,
        })
    }

    pub fn encode(&self) -> String {
        let mut type_word = self.file_type.code();
        if !self.file_reference.is_empty() {
            type_word |= FILE_REFERENCE_FLAG;
        }
        let mut raw = Vec::with_capacity(64);
        raw.extend_from_slice(&type_word.to_le_bytes());
        raw.extend_from_slice(&self.datacenter.to_le_bytes());
        if !self.file_reference.is_empty() {
            write_tl_bytes(&mut raw, &self.file_reference);
        }
        raw.extend_from_slice(&self.media_id.to_le_bytes());
        raw.extend_from_slice(&self.access_hash.to_le_bytes());
        if self.file_type.has_thumbnail_size() {
            let size = self.thumbnail_size.as_deref().unwrap_or_default();
            write_tl_bytes(&mut raw, size.as_bytes());
        }
        raw.push(MINOR_VERSION);
        raw.push(MAJOR_VERSION);
        URL_SAFE_NO_PAD.encode(rle_encode(&raw))
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], LocationError> {
        let (head, rest) = self
            .buf
            .split_at_checked(n)
            .ok_or(LocationError::Truncated)?;
        self.buf = rest;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], LocationError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, LocationError> {
        self.array().map(u32::from_le_bytes)
    }

    fn i32(&mut self) -> Result<i32, LocationError> {
        self.array().map(i32::from_le_bytes)
    }

    fn i64(&mut self) -> Result<i64, LocationError> {
        self.array().map(i64::from_le_bytes)
    }

    fn tl_bytes(&mut self) -> Result<Vec<u8>, LocationError> {
        let first = self.take(1)?[0];
        let (len, header) = if first < 254 {
            (first as usize, 1)
        } else {
            let l = self.take(3)?;
            (usize::from(l[0]) | usize::from(l[1]) << 8 | usize::from(l[2]) << 16, 4)
        };
        let data = self.take(len)?.to_vec();
        self.take(padding(header + len))?;
        Ok(data)
    }
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

fn write_tl_bytes(out: &mut Vec<u8>, data: &[u8]) {
    let header = if data.len() < 254 {
        out.push(data.len() as u8);
        1
    } else {
        let len = data.len() as u32;
        out.push(254);
        out.extend_from_slice(&len.to_le_bytes()[..3]);
        4
    };
    out.extend_from_slice(data);
    out.resize(out.len() + padding(header + data.len()), 0);
}

fn rle_decode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() * 2);
    let mut zero_marker = false;
    for &b in input {
        if zero_marker {
            out.resize(out.len() + b as usize, 0);
            zero_marker = false;
        } else if b == 0 {
            zero_marker = true;
        } else {
            out.push(b);
        }
    }
    out
}

fn rle_encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut zeros: u8 = 0;
    for &b in input {
        if b == 0 {
            if zeros == u8::MAX {
                out.extend_from_slice(&[0, zeros]);
                zeros = 0;
            }
            zeros += 1;
            continue;
        }
        if zeros > 0 {
            out.extend_from_slice(&[0, zeros]);
            zeros = 0;
        }
        out.push(b);
    }
    if zeros > 0 {
        out.extend_from_slice(&[0, zeros]);
    }
    out
}
