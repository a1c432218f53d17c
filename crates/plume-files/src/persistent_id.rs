use crate::error::FileError;
use crate::location::{FileType, FullRemoteFileLocation};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

pub const PERSISTENT_ID_VERSION: u8 = 2;

// Binary layout: [type tag][dc_id le][id le][access_hash le][version].
// The version byte stays last so future layouts can be parsed back to front.
const BODY_LEN: usize = 1 + 4 + 8 + 8;

pub fn encode(location: &FullRemoteFileLocation) -> String {
    let mut raw = Vec::with_capacity(BODY_LEN + 1);
    raw.push(file_type_tag(location.file_type));
    raw.extend_from_slice(&location.dc_id.to_le_bytes());
    raw.extend_from_slice(&location.id.to_le_bytes());
    raw.extend_from_slice(&location.access_hash.to_le_bytes());
    raw.push(PERSISTENT_ID_VERSION);
    URL_SAFE_NO_PAD.encode(raw)
}

pub fn decode(persistent_id: &str) -> Result<FullRemoteFileLocation, FileError> {
    let raw = URL_SAFE_NO_PAD
        .decode(persistent_id)
        .map_err(|_| FileError::WrongPersistentId)?;
    let Some((&version, body)) = raw.split_last() else {
        return Err(FileError::WrongPersistentId);
    };
    if version != PERSISTENT_ID_VERSION {
        return Err(FileError::UnsupportedVersion(version));
    }
    if body.len() != BODY_LEN {
        return Err(FileError::WrongPersistentId);
    }
    let file_type = file_type_from_tag(body[0]).ok_or(FileError::WrongPersistentId)?;
    Ok(FullRemoteFileLocation {
        file_type,
        dc_id: read_i32(&body[1..5]),
        id: read_i64(&body[5..13]),
        access_hash: read_i64(&body[13..21]),
    })
}

fn read_i32(bytes: &[u8]) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    i32::from_le_bytes(buf)
}

fn read_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    i64::from_le_bytes(buf)
}

fn file_type_tag(file_type: FileType) -> u8 {
    match file_type {
        FileType::Document => 0,
        FileType::Photo => 1,
        FileType::Video => 2,
        FileType::Audio => 3,
        FileType::Animation => 4,
        FileType::VoiceNote => 5,
        FileType::Sticker => 6,
        FileType::Thumbnail => 7,
        FileType::Temp => 8,
        FileType::Secret => 9,
        FileType::SecretThumbnail => 10,
    }
}

fn file_type_from_tag(tag: u8) -> Option<FileType> {
    Some(match tag {
        0 => FileType::Document,
        1 => FileType::Photo,
        2 => FileType::Video,
        3 => FileType::Audio,
        4 => FileType::Animation,
        5 => FileType::VoiceNote,
        6 => FileType::Sticker,
        7 => FileType::Thumbnail,
        8 => FileType::Temp,
        9 => FileType::Secret,
        10 => FileType::SecretThumbnail,
        _ => return None,
    })
}
