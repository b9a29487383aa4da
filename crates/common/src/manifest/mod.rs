//! Backup manifest parsing
//!
//! The manifest lists every file, directory and symlink in a backup together
//! with its protection class and, for encrypted backups, its wrapped file
//! key. It is a binary record stream:
//!
//! ```text
//! header:  "mbdb" | major u8 (5) | minor u8 | record_count u32
//! record:  length u32 | body[length]
//! body:    domain | path | link_target | data_hash
//!          | mode u16 | inode u64 | uid u32 | gid u32
//!          | mtime u32 | atime u32 | ctime u32 | size u64
//!          | protection_class u8 | attribute_count u8
//!          | attribute_count * (name | value)
//! ```
//!
//! Integers are big-endian and strings are `len u16 || bytes`, with
//! `len == 0xFFFF` meaning absent. A `record_count` of `0xFFFFFFFF` reads to
//! the end of the stream.

mod reader;
mod record;

pub use reader::{parse, ParseError, HEADER_SIZE, MAGIC, MAJOR_VERSION, UNSPECIFIED_COUNT};
pub use record::{
    FileType, ManifestRecord, ENCRYPTION_KEY_ATTRIBUTE, MODE_DIRECTORY, MODE_REGULAR,
    MODE_SYMLINK, MODE_TYPE_MASK,
};

pub(crate) use reader::ABSENT_STRING;
