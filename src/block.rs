//! IEEE 488.2 block data and numeric list decoding.
//!
//! Numeric replies arrive either as ASCII (`1.5,2.25,-3`) or as a binary
//! block (`#<n><n digits of length><payload>`, or the indefinite form
//! `#0<payload>\n`). Both decode to the same list of values.

use strum_macros::{AsRefStr, EnumIter, EnumString};

use crate::error::{Error, Result};

/// Encoding of floats inside a binary block. The instrument does not tag
/// the block itself, so the session has to be told which one to expect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, EnumIter, EnumString, AsRefStr)]
#[strum(ascii_case_insensitive)]
pub enum BinFloatFormat {
    /// IEEE-754 single, little-endian (`FORM REAL,32` + `FORM:BORD SWAP`)
    #[default]
    Single4Le,
    /// IEEE-754 single, big-endian (`FORM REAL,32` + `FORM:BORD NORM`)
    Single4Be,
    /// IEEE-754 double, little-endian
    Double8Le,
    /// IEEE-754 double, big-endian
    Double8Be,
}
impl BinFloatFormat {
    pub fn size(&self) -> usize {
        match self {
            Self::Single4Le | Self::Single4Be => 4,
            Self::Double8Le | Self::Double8Be => 8,
        }
    }

    pub fn decode(&self, data: &[u8]) -> Result<Vec<f64>> {
        let size = self.size();
        if data.len() % size != 0 {
            return Err(Error::Decode(format!(
                "Block of {} bytes is not a multiple of {} ({})",
                data.len(),
                size,
                self.as_ref()
            )));
        }

        let values = data.chunks_exact(size).map(|c| match self {
            /* chunks_exact guarantees the slice lengths */
            Self::Single4Le => f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64,
            Self::Single4Be => f32::from_be_bytes([c[0], c[1], c[2], c[3]]) as f64,
            Self::Double8Le => {
                f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
            }
            Self::Double8Be => {
                f64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
            }
        });

        Ok(values.collect())
    }

    pub fn encode(&self, values: &[f64]) -> Vec<u8> {
        let mut out = Vec::with_capacity(values.len() * self.size());
        for &v in values {
            match self {
                Self::Single4Le => out.extend_from_slice(&(v as f32).to_le_bytes()),
                Self::Single4Be => out.extend_from_slice(&(v as f32).to_be_bytes()),
                Self::Double8Le => out.extend_from_slice(&v.to_le_bytes()),
                Self::Double8Be => out.extend_from_slice(&v.to_be_bytes()),
            }
        }
        out
    }
}

/// Parsed `#<n><length>` prefix
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockHeader {
    /// `#<n><length>`: payload of exactly `length` bytes follows
    Definite(usize),
    /// `#0`: payload runs until the terminating newline. Read off the wire,
    /// the first 0x0A byte ends the payload, so binary data that may contain
    /// one needs a definite-length block. [`decode_block`] on a complete
    /// in-memory reply only strips the final newline.
    Indefinite,
}
impl BlockHeader {
    /// Number of length digits announced by the byte following `#`
    pub fn digit_count(digit: u8) -> Result<usize> {
        if !digit.is_ascii_digit() {
            return Err(Error::Decode(format!(
                "Bad block header digit count `{}`",
                digit.escape_ascii()
            )));
        }
        Ok((digit - b'0') as usize)
    }

    /// Parse the ASCII length field that follows the digit count
    pub fn from_length_digits(digits: &[u8]) -> Result<Self> {
        if digits.is_empty() {
            return Ok(Self::Indefinite);
        }
        let text = std::str::from_utf8(digits)
            .map_err(|_| Error::Decode("Non-ASCII block length".into()))?;
        let length = text
            .parse()
            .map_err(|e| Error::Decode(format!("Bad block length `{text}`: {e}")))?;
        Ok(Self::Definite(length))
    }
}

/// Build `#<n><length><payload>`
pub fn encode_block(payload: &[u8]) -> Vec<u8> {
    let length = payload.len().to_string();
    let mut out = Vec::with_capacity(2 + length.len() + payload.len());
    out.push(b'#');
    out.extend_from_slice(length.len().to_string().as_bytes());
    out.extend_from_slice(length.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Extract the payload of a complete in-memory block. Trailing bytes
/// after a definite block (usually the newline) are ignored.
pub fn decode_block(data: &[u8]) -> Result<&[u8]> {
    let Some((&b'#', rest)) = data.split_first() else {
        return Err(Error::Decode("Block does not start with `#`".into()));
    };
    let Some((&digit, rest)) = rest.split_first() else {
        return Err(Error::Decode("Truncated block header".into()));
    };
    let n = BlockHeader::digit_count(digit)?;
    if rest.len() < n {
        return Err(Error::Decode("Truncated block length".into()));
    }

    match BlockHeader::from_length_digits(&rest[..n])? {
        BlockHeader::Definite(length) => {
            let payload = &rest[n..];
            if payload.len() < length {
                return Err(Error::Decode(format!(
                    "Block announced {} bytes, got {}",
                    length,
                    payload.len()
                )));
            }
            Ok(&payload[..length])
        }
        BlockHeader::Indefinite => Ok(rest.strip_suffix(b"\n").unwrap_or(rest)),
    }
}

/// Parse a comma-separated ASCII list of numbers. An empty reply is an
/// empty list.
pub fn parse_ascii_floats(text: &str) -> Result<Vec<f64>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(vec![]);
    }

    text.split(',')
        .map(|v| {
            let v = v.trim();
            v.parse()
                .map_err(|e| Error::Decode(format!("Could not parse `{v}` as float: {e}")))
        })
        .collect()
}

/// Decode a float list from a whole reply, whichever way it was encoded
pub fn parse_float_list(reply: &[u8], format: BinFloatFormat) -> Result<Vec<f64>> {
    if reply.first() == Some(&b'#') {
        format.decode(decode_block(reply)?)
    } else {
        let text = std::str::from_utf8(reply)
            .map_err(|_| Error::Decode("ASCII float list is not valid UTF-8".into()))?;
        parse_ascii_floats(text)
    }
}
