use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    Document,
    Photo,
    Video,
    Audio,
    Animation,
    VoiceNote,
    Sticker,
    Thumbnail,
    Temp,
    Secret,
    SecretThumbnail,
}

impl FileType {
    pub fn is_secret(self) -> bool {
        matches!(self, FileType::Secret | FileType::SecretThumbnail)
    }

    pub fn to_secret(self) -> FileType {
        match self {
            FileType::Thumbnail | FileType::SecretThumbnail => FileType::SecretThumbnail,
            _ => FileType::Secret,
        }
    }
}

/// Provenance of a remote location; server-confirmed coordinates are trusted
/// over user-supplied ones when nodes merge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileLocationSource {
    #[default]
    None,
    FromUser,
    FromDb,
    FromServer,
}

/// Complete on-disk identity. Two locations are the same file iff type and
/// path match; mtime is advisory and excluded from the natural key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FullLocalFileLocation {
    pub file_type: FileType,
    pub path: String,
    pub mtime_nsec: u64,
}

impl PartialEq for FullLocalFileLocation {
    fn eq(&self, other: &Self) -> bool {
        self.file_type == other.file_type && self.path == other.path
    }
}

impl Eq for FullLocalFileLocation {}

impl Hash for FullLocalFileLocation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.file_type.hash(state);
        self.path.hash(state);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialLocalFileLocation {
    pub file_type: FileType,
    pub path: String,
    pub part_size: i32,
    pub ready_part_count: i32,
    pub iv: Vec<u8>,
}

impl PartialLocalFileLocation {
    pub fn ready_prefix_size(&self) -> i64 {
        i64::from(self.part_size) * i64::from(self.ready_part_count)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalFileLocation {
    #[default]
    Empty,
    Partial(PartialLocalFileLocation),
    Full(FullLocalFileLocation),
}

impl LocalFileLocation {
    pub fn full(&self) -> Option<&FullLocalFileLocation> {
        match self {
            LocalFileLocation::Full(full) => Some(full),
            _ => None,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, LocalFileLocation::Full(_))
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, LocalFileLocation::Partial(_))
    }

    pub fn file_type(&self) -> Option<FileType> {
        match self {
            LocalFileLocation::Empty => None,
            LocalFileLocation::Partial(partial) => Some(partial.file_type),
            LocalFileLocation::Full(full) => Some(full.file_type),
        }
    }
}

/// Complete server identity. Natural key is (dc_id, id); the access hash is a
/// capability that may be refreshed without changing identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FullRemoteFileLocation {
    pub file_type: FileType,
    pub dc_id: i32,
    pub id: i64,
    pub access_hash: i64,
}

impl PartialEq for FullRemoteFileLocation {
    fn eq(&self, other: &Self) -> bool {
        self.dc_id == other.dc_id && self.id == other.id
    }
}

impl Eq for FullRemoteFileLocation {}

impl Hash for FullRemoteFileLocation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.dc_id.hash(state);
        self.id.hash(state);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialRemoteFileLocation {
    pub id: i64,
    pub part_count: i32,
    pub part_size: i32,
    pub ready_part_count: i32,
    pub is_big: bool,
}

impl PartialRemoteFileLocation {
    pub fn ready_size(&self) -> i64 {
        i64::from(self.part_size) * i64::from(self.ready_part_count)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteFileLocation {
    #[default]
    Empty,
    Partial(PartialRemoteFileLocation),
    Full(FullRemoteFileLocation),
}

impl RemoteFileLocation {
    pub fn full(&self) -> Option<&FullRemoteFileLocation> {
        match self {
            RemoteFileLocation::Full(full) => Some(full),
            _ => None,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, RemoteFileLocation::Full(_))
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, RemoteFileLocation::Partial(_))
    }

    pub fn file_type(&self) -> Option<FileType> {
        self.full().map(|full| full.file_type)
    }
}

/// Recipe for producing the bytes locally: run `conversion` over
/// `original_path`. Natural key is the (path, conversion) pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FullGenerateFileLocation {
    pub file_type: FileType,
    pub original_path: String,
    pub conversion: String,
    pub mtime_nsec: u64,
}

impl PartialEq for FullGenerateFileLocation {
    fn eq(&self, other: &Self) -> bool {
        self.original_path == other.original_path && self.conversion == other.conversion
    }
}

impl Eq for FullGenerateFileLocation {}

impl Hash for FullGenerateFileLocation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.original_path.hash(state);
        self.conversion.hash(state);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerateFileLocation {
    #[default]
    Empty,
    Full(FullGenerateFileLocation),
}

impl GenerateFileLocation {
    pub fn full(&self) -> Option<&FullGenerateFileLocation> {
        match self {
            GenerateFileLocation::Full(full) => Some(full),
            GenerateFileLocation::Empty => None,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, GenerateFileLocation::Full(_))
    }

    pub fn file_type(&self) -> Option<FileType> {
        self.full().map(|full| full.file_type)
    }
}

/// Opaque content key. Empty means the file is not encrypted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEncryptionKey(Vec<u8>);

impl FileEncryptionKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn fingerprint(&self) -> i64 {
        if self.0.is_empty() {
            return 0;
        }
        let hash = blake3::hash(&self.0);
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&hash.as_bytes()[..8]);
        i64::from_le_bytes(buf)
    }
}

/// Value handed to upload callbacks once all parts are on the server, so the
/// caller can attach the file to an outgoing message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputFileToken {
    Plain {
        id: i64,
        part_count: i32,
        name: String,
    },
    Encrypted {
        id: i64,
        part_count: i32,
        key_fingerprint: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_natural_key_ignores_mtime() {
        let a = FullLocalFileLocation {
            file_type: FileType::Document,
            path: "/tmp/a.bin".to_string(),
            mtime_nsec: 1,
        };
        let b = FullLocalFileLocation {
            file_type: FileType::Document,
            path: "/tmp/a.bin".to_string(),
            mtime_nsec: 999,
        };
        assert_eq!(a, b);
        let c = FullLocalFileLocation {
            file_type: FileType::Photo,
            ..a.clone()
        };
        assert_ne!(a, c);
    }

    #[test]
    fn remote_natural_key_ignores_access_hash() {
        let a = FullRemoteFileLocation {
            file_type: FileType::Video,
            dc_id: 2,
            id: 42,
            access_hash: 7,
        };
        let b = FullRemoteFileLocation {
            access_hash: 8,
            ..a.clone()
        };
        assert_eq!(a, b);
        let c = FullRemoteFileLocation { id: 43, ..a };
        assert_ne!(b, c);
    }

    #[test]
    fn secret_mapping() {
        assert_eq!(FileType::Document.to_secret(), FileType::Secret);
        assert_eq!(FileType::Thumbnail.to_secret(), FileType::SecretThumbnail);
        assert!(FileType::SecretThumbnail.is_secret());
        assert!(!FileType::Photo.is_secret());
    }

    #[test]
    fn key_fingerprint_is_stable_and_nonzero() {
        let key = FileEncryptionKey::new(vec![1, 2, 3, 4]);
        assert_eq!(key.fingerprint(), key.fingerprint());
        assert_ne!(key.fingerprint(), 0);
        assert_eq!(FileEncryptionKey::empty().fingerprint(), 0);
    }
}
