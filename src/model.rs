//! ALFA Photos Sync - Data Model
//!
//! Records as they travel between the server delta, the local index and the
//! reconciler. Enum wire values match the server protocol.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GeneralError, VaultError};

/// Envelope content type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum FileType {
    General = 1,
    Photo = 2,
    Video = 3,
}

impl TryFrom<u8> for FileType {
    type Error = VaultError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(FileType::General),
            2 => Ok(FileType::Photo),
            3 => Ok(FileType::Video),
            _ => Err(GeneralError::IncorrectParameterSize.into()),
        }
    }
}

impl From<FileType> for u8 {
    fn from(t: FileType) -> u8 {
        t as u8
    }
}

/// Logical set a file belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum FileSet {
    Null = 0,
    Empty = 1,
    Gallery = 2,
    Trash = 3,
    Album = 4,
}

impl TryFrom<u8> for FileSet {
    type Error = VaultError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(FileSet::Null),
            1 => Ok(FileSet::Empty),
            2 => Ok(FileSet::Gallery),
            3 => Ok(FileSet::Trash),
            4 => Ok(FileSet::Album),
            _ => Err(GeneralError::IncorrectParameterSize.into()),
        }
    }
}

impl From<FileSet> for u8 {
    fn from(s: FileSet) -> u8 {
        s as u8
    }
}

impl fmt::Display for FileSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileSet::Null => "null",
            FileSet::Empty => "empty",
            FileSet::Gallery => "gallery",
            FileSet::Trash => "trash",
            FileSet::Album => "album",
        };
        f.write_str(s)
    }
}

/// Index partition a stored record lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Gallery,
    Trash,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::Gallery, RecordKind::Trash];

    /// Server folder number used by download and upload
    pub fn folder(self) -> u8 {
        match self {
            RecordKind::Gallery => 0,
            RecordKind::Trash => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Gallery => "gallery",
            RecordKind::Trash => "trash",
        }
    }

    pub fn set(self) -> FileSet {
        match self {
            RecordKind::Gallery => FileSet::Gallery,
            RecordKind::Trash => FileSet::Trash,
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "gallery" => Some(RecordKind::Gallery),
            "trash" => Some(RecordKind::Trash),
            _ => None,
        }
    }
}

impl TryFrom<FileSet> for RecordKind {
    type Error = FileSet;

    fn try_from(set: FileSet) -> Result<Self, FileSet> {
        match set {
            FileSet::Gallery => Ok(RecordKind::Gallery),
            FileSet::Trash => Ok(RecordKind::Trash),
            other => Err(other),
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file in the remote index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Opaque token assigned at import; not the original filename
    pub name: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub version: u64,
    pub date_created: String,
    pub date_modified: String,
    /// `*`-separated base64url envelope headers, original first
    pub headers: String,
    /// Records arriving from the server are remote unless they say otherwise
    #[serde(default = "remote_by_default")]
    pub is_remote: bool,
    #[serde(default)]
    pub duration: Option<u32>,
}

impl FileRecord {
    /// `date_modified` as epoch milliseconds; unparsable values compare as 0
    pub fn date_modified_millis(&self) -> u64 {
        parse_millis(&self.date_modified)
    }

    pub fn date_created_millis(&self) -> u64 {
        parse_millis(&self.date_created)
    }

    /// Individual header segments, skipping empty ones
    pub fn header_segments(&self) -> impl Iterator<Item = &str> {
        self.headers.split('*').filter(|s| !s.is_empty())
    }
}

fn remote_by_default() -> bool {
    true
}

pub(crate) fn parse_millis(s: &str) -> u64 {
    s.trim().parse().unwrap_or(0)
}

/// Remote deletion event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum DeleteEvent {
    Trash = 1,
    Restore = 2,
    Delete = 3,
}

impl TryFrom<u8> for DeleteEvent {
    type Error = VaultError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(DeleteEvent::Trash),
            2 => Ok(DeleteEvent::Restore),
            3 => Ok(DeleteEvent::Delete),
            _ => Err(GeneralError::IncorrectParameterSize.into()),
        }
    }
}

impl From<DeleteEvent> for u8 {
    fn from(e: DeleteEvent) -> u8 {
        e as u8
    }
}

/// Deletion entry in a delta
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedFile {
    pub name: String,
    #[serde(rename = "type")]
    pub event: DeleteEvent,
    /// Epoch milliseconds
    pub date: u64,
}

/// Sync high-water marks and quota
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub last_seen: u64,
    pub last_del_seen: u64,
    pub space_quota: u64,
    pub space_used: u64,
}

/// Server delta since the client's high-water marks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub files: Vec<FileRecord>,
    #[serde(default)]
    pub trash: Vec<FileRecord>,
    #[serde(default)]
    pub deletes: Vec<DeletedFile>,
    #[serde(default)]
    pub space_used: Option<u64>,
    #[serde(default)]
    pub space_quota: Option<u64>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.trash.is_empty() && self.deletes.is_empty()
    }
}

/// Position of a record in its partition, newest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPath {
    pub section: usize,
    pub row: usize,
}

/// Quota figures returned by upload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceUsage {
    pub used: u64,
    pub quota: u64,
}
