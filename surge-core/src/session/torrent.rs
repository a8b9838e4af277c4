//! Per-torrent state inside a session.

use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;

use crate::torrent::{InfoHash, PieceFile, PiecePicker, TorrentInfo};

/// Lifecycle state of a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TorrentState {
    /// Hash-checking content already on disk
    #[default]
    CheckingFiles,
    /// Missing pieces are being fetched
    Downloading,
    /// Every piece is present
    Seeding,
}

impl fmt::Display for TorrentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CheckingFiles => f.write_str("checking_files"),
            Self::Downloading => f.write_str("downloading"),
            Self::Seeding => f.write_str("seeding"),
        }
    }
}

/// Snapshot of a torrent's progress.
///
/// The default value describes an invalid handle: no torrent, no metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TorrentStatus {
    /// Whether the handle still refers to a torrent
    pub is_valid: bool,
    /// Torrent identity
    pub info_hash: Option<InfoHash>,
    /// Torrent name
    pub name: String,
    /// Lifecycle state
    pub state: TorrentState,
    /// Whether metadata is available
    pub has_metadata: bool,
    /// Whether every piece is present and the torrent is uploading
    pub is_seeding: bool,
    /// Whether every wanted piece is present
    pub is_finished: bool,
    /// Whether the torrent is paused
    pub paused: bool,
    /// Pieces we have
    pub num_pieces: u32,
    /// Pieces in the torrent
    pub total_pieces: u32,
    /// Established peer connections
    pub num_peers: usize,
    /// Payload bytes downloaded
    pub total_download: u64,
    /// Payload bytes uploaded
    pub total_upload: u64,
    /// Directory holding the content
    pub save_path: PathBuf,
}

#[derive(Debug)]
pub(crate) struct Torrent {
    pub(crate) info: Rc<TorrentInfo>,
    pub(crate) save_path: PathBuf,
    pub(crate) storage: PieceFile,
    pub(crate) picker: PiecePicker,
    pub(crate) state: TorrentState,
    pub(crate) paused: bool,
    pub(crate) total_download: u64,
    pub(crate) total_upload: u64,
}

impl Torrent {
    pub(crate) fn new(info: Rc<TorrentInfo>, save_path: PathBuf, paused: bool) -> Self {
        let storage = PieceFile::new(&save_path, &info);
        let picker = PiecePicker::new(&info, Vec::new());
        Self {
            info,
            save_path,
            storage,
            picker,
            state: TorrentState::CheckingFiles,
            paused,
            total_download: 0,
            total_upload: 0,
        }
    }

    pub(crate) fn info_hash(&self) -> InfoHash {
        self.info.info_hash()
    }

    pub(crate) fn status(&self, num_peers: usize) -> TorrentStatus {
        let complete = self.picker.is_complete();
        TorrentStatus {
            is_valid: true,
            info_hash: Some(self.info_hash()),
            name: self.info.name().to_string(),
            state: self.state,
            has_metadata: true,
            is_seeding: self.state == TorrentState::Seeding,
            is_finished: complete && self.state != TorrentState::CheckingFiles,
            paused: self.paused,
            num_pieces: self.picker.num_have(),
            total_pieces: self.info.num_pieces(),
            num_peers,
            total_download: self.total_download,
            total_upload: self.total_upload,
            save_path: self.save_path.clone(),
        }
    }
}
