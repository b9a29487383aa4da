//! Tagged-field framing used by key bag blobs
//!
//! A blob is a flat sequence of fields:
//!
//! ```text
//! [ tag: 4 ASCII bytes ][ length: u32 BE ][ value: length bytes ] ...
//! ```
//!
//! The sequence ends at the end of the buffer or at a tag made of four NUL
//! bytes (which also covers zero padding). Callers decide what to do with
//! tags they do not recognise; the framing layer never rejects them.

use std::fmt;

/// Size of a field tag in bytes
pub const TAG_SIZE: usize = 4;
/// Size of the tag + length header in bytes
pub const HEADER_SIZE: usize = TAG_SIZE + 4;

const END_MARKER: [u8; TAG_SIZE] = [0; TAG_SIZE];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TlvError {
    #[error("field header truncated at offset {0}")]
    TruncatedHeader(usize),
    #[error("field {tag} at offset {offset} declares {len} bytes, only {remaining} remain")]
    Overrun {
        tag: Tag,
        offset: usize,
        len: usize,
        remaining: usize,
    },
}

/// A four byte field tag, e.g. `VERS` or `WPKY`
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub [u8; TAG_SIZE]);

impl Tag {
    pub const fn new(tag: &[u8; TAG_SIZE]) -> Self {
        Tag(*tag)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", self)
    }
}

/// A single decoded field borrowing from the source blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field<'a> {
    pub tag: Tag,
    pub value: &'a [u8],
}

impl Field<'_> {
    /// Interpret the value as a big-endian integer.
    ///
    /// Values of up to eight bytes are accepted; anything wider is `None`.
    pub fn as_uint(&self) -> Option<u64> {
        if self.value.is_empty() || self.value.len() > 8 {
            return None;
        }
        Some(
            self.value
                .iter()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
        )
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_uint().and_then(|v| u32::try_from(v).ok())
    }
}

/// Iterator over the fields of a blob
pub struct Fields<'a> {
    data: &'a [u8],
    offset: usize,
    done: bool,
}

pub fn fields(data: &[u8]) -> Fields<'_> {
    Fields {
        data,
        offset: 0,
        done: false,
    }
}

impl<'a> Iterator for Fields<'a> {
    type Item = Result<Field<'a>, TlvError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let rest = &self.data[self.offset..];
        if rest.is_empty() {
            self.done = true;
            return None;
        }
        if rest.len() >= TAG_SIZE && rest[..TAG_SIZE] == END_MARKER {
            self.done = true;
            return None;
        }
        if rest.len() < HEADER_SIZE {
            self.done = true;
            // a short run of zeroes is padding, not a field
            if rest.iter().all(|b| *b == 0) {
                return None;
            }
            return Some(Err(TlvError::TruncatedHeader(self.offset)));
        }

        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&rest[..TAG_SIZE]);
        let tag = Tag(tag);
        let mut len = [0u8; 4];
        len.copy_from_slice(&rest[TAG_SIZE..HEADER_SIZE]);
        let len = u32::from_be_bytes(len) as usize;

        let remaining = rest.len() - HEADER_SIZE;
        if len > remaining {
            self.done = true;
            return Some(Err(TlvError::Overrun {
                tag,
                offset: self.offset,
                len,
                remaining,
            }));
        }

        let value = &rest[HEADER_SIZE..HEADER_SIZE + len];
        self.offset += HEADER_SIZE + len;
        Some(Ok(Field { tag, value }))
    }
}

/// Append a single field to `out`
pub fn encode_field(tag: &[u8; TAG_SIZE], value: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(tag);
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fields_in_order() {
        let mut blob = Vec::new();
        encode_field(b"VERS", &3u32.to_be_bytes(), &mut blob);
        encode_field(b"SALT", &[7u8; 20], &mut blob);

        let parsed: Vec<_> = fields(&blob).collect::<Result<_, _>>().unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].tag, Tag::new(b"VERS"));
        assert_eq!(parsed[0].as_u32(), Some(3));
        assert_eq!(parsed[1].value, &[7u8; 20]);
    }

    #[test]
    fn test_end_marker_stops_iteration() {
        let mut blob = Vec::new();
        encode_field(b"VERS", &4u32.to_be_bytes(), &mut blob);
        blob.extend_from_slice(&[0u8; 16]);
        encode_field(b"TYPE", &1u32.to_be_bytes(), &mut blob);

        let parsed: Vec<_> = fields(&blob).collect::<Result<_, _>>().unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn test_overrun_is_an_error() {
        let mut blob = Vec::new();
        encode_field(b"WPKY", &[1u8; 40], &mut blob);
        blob.truncate(blob.len() - 1);

        let result: Result<Vec<_>, _> = fields(&blob).collect();
        assert!(matches!(result, Err(TlvError::Overrun { len: 40, .. })));
    }

    #[test]
    fn test_short_garbage_is_truncated_header() {
        let blob = [b'V', b'E', b'R'];
        let result: Result<Vec<_>, _> = fields(&blob).collect();
        assert_eq!(result, Err(TlvError::TruncatedHeader(0)));
    }
}
