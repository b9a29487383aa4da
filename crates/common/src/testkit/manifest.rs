use crate::manifest::{
    ManifestRecord, ABSENT_STRING, ENCRYPTION_KEY_ATTRIBUTE, MAGIC, MAJOR_VERSION,
    UNSPECIFIED_COUNT,
};

/// Encodes manifest record streams
#[derive(Debug, Clone)]
pub struct ManifestWriter {
    major: u8,
    minor: u8,
    unspecified_count: bool,
    count: u32,
    body: Vec<u8>,
}

impl Default for ManifestWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Panics on strings the stream cannot represent: lengths at or above the
/// absent marker do not fit a `u16` length prefix.
fn put_str(out: &mut Vec<u8>, bytes: &[u8]) {
    if bytes.is_empty() {
        out.extend_from_slice(&ABSENT_STRING.to_be_bytes());
        return;
    }
    let len = u16::try_from(bytes.len())
        .ok()
        .filter(|&len| len != ABSENT_STRING)
        .unwrap_or_else(|| panic!("manifest string too long: {} bytes", bytes.len()));
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
}

impl ManifestWriter {
    pub fn new() -> Self {
        Self {
            major: MAJOR_VERSION,
            minor: 0,
            unspecified_count: false,
            count: 0,
            body: Vec::new(),
        }
    }

    pub fn version(mut self, major: u8, minor: u8) -> Self {
        self.major = major;
        self.minor = minor;
        self
    }

    /// Write `0xFFFFFFFF` as the record count
    pub fn unspecified_count(mut self) -> Self {
        self.unspecified_count = true;
        self
    }

    /// Encode a record body without its length prefix.
    ///
    /// A wrapped file key is written as the `EncryptionKey` attribute.
    pub fn encode_body(&self, record: &ManifestRecord) -> Vec<u8> {
        let mut attributes: Vec<(&[u8], Vec<u8>)> = record
            .attributes
            .iter()
            .filter(|(name, _)| {
                record.wrapped_file_key.is_none() || name.as_str() != ENCRYPTION_KEY_ATTRIBUTE
            })
            .map(|(name, value)| (name.as_bytes(), value.clone()))
            .collect();
        if let Some(wrapped) = &record.wrapped_file_key {
            let mut value = record.protection_class.to_le_bytes().to_vec();
            value.extend_from_slice(wrapped);
            attributes.push((ENCRYPTION_KEY_ATTRIBUTE.as_bytes(), value));
        }

        let mut out = Vec::new();
        put_str(&mut out, record.domain.as_bytes());
        put_str(&mut out, record.relative_path.as_bytes());
        put_str(&mut out, record.link_target.as_bytes());
        put_str(&mut out, &record.data_hash);
        out.extend_from_slice(&record.mode.to_be_bytes());
        out.extend_from_slice(&record.inode.to_be_bytes());
        out.extend_from_slice(&record.uid.to_be_bytes());
        out.extend_from_slice(&record.gid.to_be_bytes());
        out.extend_from_slice(&record.mtime.to_be_bytes());
        out.extend_from_slice(&record.atime.to_be_bytes());
        out.extend_from_slice(&record.ctime.to_be_bytes());
        out.extend_from_slice(&record.file_size.to_be_bytes());
        out.push(record.protection_class as u8);
        out.push(attributes.len() as u8);
        for (name, value) in &attributes {
            put_str(&mut out, name);
            put_str(&mut out, value);
        }
        out
    }

    /// Append a length-prefixed record body as-is
    pub fn raw_record(mut self, body: &[u8]) -> Self {
        self.body
            .extend_from_slice(&(body.len() as u32).to_be_bytes());
        self.body.extend_from_slice(body);
        self.count += 1;
        self
    }

    pub fn record(self, record: &ManifestRecord) -> Self {
        let body = self.encode_body(record);
        self.raw_record(&body)
    }

    pub fn records(self, records: &[ManifestRecord]) -> Self {
        records.iter().fold(self, |writer, record| writer.record(record))
    }

    pub fn finish(self) -> Vec<u8> {
        let count = if self.unspecified_count {
            UNSPECIFIED_COUNT
        } else {
            self.count
        };
        let mut out = Vec::with_capacity(10 + self.body.len());
        out.extend_from_slice(MAGIC);
        out.push(self.major);
        out.push(self.minor);
        out.extend_from_slice(&count.to_be_bytes());
        out.extend(self.body);
        out
    }
}
