//! yEnc transport encoding
//!
//! Article bodies arrive as `=ybegin` / optional `=ypart` / data lines / `=yend`.
//! Parsing and unescaping is done by `nntp-rs`; this module locates the yEnc
//! block inside a body and holds the decoded part to its declared size and its
//! `pcrc32` (or `crc32` for single-part posts) trailer.

use crate::error::YencError;

/// Default encoded line length used by posting tools
const LINE_LENGTH: usize = 128;

/// A decoded article body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPart {
    /// File name from the `=ybegin` header
    pub name: String,
    /// Size of the whole file
    pub file_size: u64,
    /// Part number for multi-part posts
    pub part: Option<u32>,
    /// 1-based offset of the first byte within the file
    pub begin: u64,
    /// 1-based offset of the last byte within the file
    pub end: u64,
    /// Decoded bytes
    pub data: Vec<u8>,
    /// CRC32 of `data`
    pub crc32: u32,
}

impl DecodedPart {
    /// Zero-based position of `data` within the file
    pub fn offset(&self) -> u64 {
        self.begin.saturating_sub(1)
    }
}

/// Decode a complete article body
///
/// Lines before `=ybegin` (article headers, blank lines) are ignored.
pub fn decode(body: &[u8]) -> Result<DecodedPart, YencError> {
    let start = line_starts(body)
        .find(|&at| body[at..].starts_with(b"=ybegin "))
        .ok_or(YencError::MissingHeader)?;
    let block = &body[start..];
    if !line_starts(block).any(|at| block[at..].starts_with(b"=yend")) {
        return Err(YencError::MissingTrailer);
    }

    let decoded = nntp_rs::yenc_decode(block).map_err(|e| YencError::Malformed(e.to_string()))?;
    let actual = decoded.data.len() as u64;

    let (begin, end) = match &decoded.part {
        Some(part) if part.begin >= 1 && part.end >= part.begin => (part.begin, part.end),
        Some(part) => {
            return Err(YencError::Malformed(format!(
                "=ypart begin={} end={}",
                part.begin, part.end
            )));
        }
        None => (1, actual),
    };
    let declared = match &decoded.part {
        Some(_) => end - begin + 1,
        None => decoded.trailer.size,
    };
    for expected in [declared, decoded.trailer.size] {
        if expected != actual {
            return Err(YencError::SizeMismatch { expected, actual });
        }
    }

    let expected_crc = match decoded.header.part {
        Some(_) => decoded.trailer.pcrc32,
        None => decoded.trailer.crc32.or(decoded.trailer.pcrc32),
    };
    if let Some(expected) = expected_crc
        && expected != decoded.calculated_crc32
    {
        return Err(YencError::CrcMismatch {
            expected,
            actual: decoded.calculated_crc32,
        });
    }

    Ok(DecodedPart {
        name: decoded.header.name,
        file_size: decoded.header.size,
        part: decoded.header.part,
        begin,
        end,
        data: decoded.data,
        crc32: decoded.calculated_crc32,
    })
}

/// Position of one part within a multi-part post
#[derive(Debug, Clone, Copy)]
pub struct PartInfo {
    /// 1-based part number
    pub number: u32,
    /// Total number of parts
    pub total: u32,
    /// 1-based offset of the first byte within the file
    pub begin: u64,
    /// Size of the whole file
    pub file_size: u64,
}

/// Encode `data` as a yEnc article body
///
/// With `part = None` a single-part post is produced.
pub fn encode(name: &str, data: &[u8], part: Option<PartInfo>) -> Result<Vec<u8>, YencError> {
    let range = part.map(|p| {
        let end = (p.begin + data.len() as u64).saturating_sub(1);
        (p.number, p.total, p.begin, end, p.file_size)
    });
    nntp_rs::yenc_encode(data, name, LINE_LENGTH, range).map_err(|e| YencError::Malformed(e.to_string()))
}

fn line_starts(body: &[u8]) -> impl Iterator<Item = usize> + '_ {
    std::iter::once(0).chain(
        body.iter()
            .enumerate()
            .filter(|&(_, &b)| b == b'\n')
            .map(|(at, _)| at + 1),
    )
}
