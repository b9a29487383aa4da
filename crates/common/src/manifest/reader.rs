use std::collections::{BTreeMap, HashMap};

use super::record::{FileType, ManifestRecord, ENCRYPTION_KEY_ATTRIBUTE};
use crate::backup::storage_id;

/// Magic bytes opening every manifest stream
pub const MAGIC: &[u8; 4] = b"mbdb";
/// The only major version this reader accepts
pub const MAJOR_VERSION: u8 = 5;
/// `record_count` value meaning "read to the end of the stream"
pub const UNSPECIFIED_COUNT: u32 = u32::MAX;
/// `magic || major || minor || record_count`
pub const HEADER_SIZE: usize = 4 + 1 + 1 + 4;
/// String length marking an absent string
pub const ABSENT_STRING: u16 = u16::MAX;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("not a manifest stream")]
    BadMagic,
    #[error("unsupported manifest version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },
    #[error("manifest truncated at offset {offset} (record {record:?}): {reason}")]
    Truncated {
        record: Option<usize>,
        offset: usize,
        reason: String,
    },
    #[error("record {record} at offset {offset} is malformed: {reason}")]
    Malformed {
        record: usize,
        offset: usize,
        reason: String,
    },
}

/// Big-endian reader over one record body
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(out)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }

    fn u8(&mut self) -> Option<u8> {
        self.array::<1>().map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.array().map(u16::from_be_bytes)
    }

    fn u32(&mut self) -> Option<u32> {
        self.array().map(u32::from_be_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.array().map(u64::from_be_bytes)
    }

    fn bytes(&mut self) -> Option<&'a [u8]> {
        match self.u16()? {
            ABSENT_STRING => Some(&[]),
            len => self.take(len as usize),
        }
    }
}

/// Raw fields of a record body, before validation
struct RawRecord<'a> {
    domain: &'a [u8],
    path: &'a [u8],
    link_target: &'a [u8],
    data_hash: &'a [u8],
    mode: u16,
    inode: u64,
    uid: u32,
    gid: u32,
    mtime: u32,
    atime: u32,
    ctime: u32,
    size: u64,
    protection_class: u8,
    attributes: Vec<(&'a [u8], &'a [u8])>,
}

fn read_raw<'a>(cursor: &mut Cursor<'a>) -> Option<RawRecord<'a>> {
    let domain = cursor.bytes()?;
    let path = cursor.bytes()?;
    let link_target = cursor.bytes()?;
    let data_hash = cursor.bytes()?;
    let mode = cursor.u16()?;
    let inode = cursor.u64()?;
    let uid = cursor.u32()?;
    let gid = cursor.u32()?;
    let mtime = cursor.u32()?;
    let atime = cursor.u32()?;
    let ctime = cursor.u32()?;
    let size = cursor.u64()?;
    let protection_class = cursor.u8()?;
    let attribute_count = cursor.u8()?;
    let mut attributes = Vec::with_capacity(attribute_count as usize);
    for _ in 0..attribute_count {
        let name = cursor.bytes()?;
        let value = cursor.bytes()?;
        attributes.push((name, value));
    }
    Some(RawRecord {
        domain,
        path,
        link_target,
        data_hash,
        mode,
        inode,
        uid,
        gid,
        mtime,
        atime,
        ctime,
        size,
        protection_class,
        attributes,
    })
}

fn parse_record(body: &[u8], record: usize, offset: usize) -> Result<ManifestRecord, ParseError> {
    let malformed = |reason: String| ParseError::Malformed {
        record,
        offset,
        reason,
    };

    let mut cursor = Cursor::new(body);
    let raw = read_raw(&mut cursor).ok_or_else(|| ParseError::Truncated {
        record: Some(record),
        offset,
        reason: format!("fields overrun the declared length of {} bytes", body.len()),
    })?;
    if cursor.remaining() != 0 {
        return Err(ParseError::Truncated {
            record: Some(record),
            offset,
            reason: format!(
                "declared length {} but fields end after {} bytes",
                body.len(),
                cursor.pos
            ),
        });
    }

    let text = |name: &str, bytes: &[u8]| {
        String::from_utf8(bytes.to_vec()).map_err(|_| malformed(format!("{} is not UTF-8", name)))
    };
    let domain = text("domain", raw.domain)?;
    let relative_path = text("path", raw.path)?;
    let link_target = text("link target", raw.link_target)?;

    if domain.is_empty() {
        return Err(malformed("empty domain".to_string()));
    }
    let file_type = FileType::from_mode(raw.mode)
        .ok_or_else(|| malformed(format!("unknown file type in mode {:#06o}", raw.mode)))?;

    let mut protection_class = raw.protection_class as u32;
    let mut wrapped_file_key = None;
    let mut attributes = BTreeMap::new();
    for (name, value) in raw.attributes {
        let name = String::from_utf8_lossy(name).into_owned();
        if name == ENCRYPTION_KEY_ATTRIBUTE {
            let Some((class, wrapped)) = value.split_first_chunk::<4>() else {
                return Err(malformed(format!(
                    "{} attribute is only {} bytes",
                    ENCRYPTION_KEY_ATTRIBUTE,
                    value.len()
                )));
            };
            protection_class = u32::from_le_bytes(*class);
            wrapped_file_key = Some(wrapped.to_vec());
        }
        attributes.insert(name, value.to_vec());
    }

    Ok(ManifestRecord {
        storage_id: storage_id(&domain, &relative_path),
        domain,
        relative_path,
        link_target,
        protection_class,
        wrapped_file_key,
        file_type,
        file_size: raw.size,
        data_hash: raw.data_hash.to_vec(),
        mode: raw.mode,
        inode: raw.inode,
        uid: raw.uid,
        gid: raw.gid,
        mtime: raw.mtime,
        atime: raw.atime,
        ctime: raw.ctime,
        attributes,
    })
}

/// Parse a manifest stream into records, in manifest order.
///
/// A record that repeats an earlier `(domain, relative_path)` replaces the
/// earlier one in place.
pub fn parse(bytes: &[u8]) -> Result<Vec<ManifestRecord>, ParseError> {
    if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
        return Err(ParseError::BadMagic);
    }
    if bytes.len() < HEADER_SIZE {
        return Err(ParseError::Truncated {
            record: None,
            offset: bytes.len(),
            reason: "incomplete header".to_string(),
        });
    }
    let major = bytes[4];
    let minor = bytes[5];
    if major != MAJOR_VERSION {
        return Err(ParseError::UnsupportedVersion { major, minor });
    }
    let declared = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
    let limit = (declared != UNSPECIFIED_COUNT).then_some(declared as usize);

    let mut records: Vec<ManifestRecord> = Vec::new();
    let mut slots: HashMap<(String, String), usize> = HashMap::new();
    let mut offset = HEADER_SIZE;
    let mut index = 0usize;

    while limit.map_or(true, |limit| index < limit) {
        let rest = &bytes[offset..];
        if rest.iter().all(|b| *b == 0) {
            break;
        }
        let Some(len) = rest.first_chunk::<4>().map(|b| u32::from_be_bytes(*b) as usize) else {
            return Err(ParseError::Truncated {
                record: Some(index),
                offset,
                reason: "incomplete record length".to_string(),
            });
        };
        let body_start = offset + 4;
        if len > bytes.len() - body_start {
            return Err(ParseError::Truncated {
                record: Some(index),
                offset,
                reason: format!(
                    "declared length {} exceeds the {} bytes left",
                    len,
                    bytes.len() - body_start
                ),
            });
        }

        let record = parse_record(&bytes[body_start..body_start + len], index, offset)?;
        let key = (record.domain.clone(), record.relative_path.clone());
        match slots.get(&key) {
            Some(&slot) => {
                tracing::debug!(record = %record, "duplicate manifest record, keeping the later one");
                records[slot] = record;
            }
            None => {
                slots.insert(key, records.len());
                records.push(record);
            }
        }
        offset = body_start + len;
        index += 1;
    }

    if let Some(limit) = limit {
        if index < limit {
            tracing::debug!(declared = limit, parsed = index, "manifest ended before its record count");
        }
    }
    tracing::debug!(records = records.len(), bytes = offset, "parsed manifest");
    Ok(records)
}
