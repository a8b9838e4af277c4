//! Parameters for adding a torrent to a session.

use std::path::PathBuf;
use std::rc::Rc;

use crate::torrent::TorrentInfo;

/// Everything a session needs to start a torrent.
#[derive(Debug, Clone)]
pub struct AddTorrentParams {
    /// Torrent metadata; adding without it fails with an alert
    pub ti: Option<Rc<TorrentInfo>>,
    /// Directory the content file lives in
    pub save_path: PathBuf,
    /// Start paused: no connections are made or accepted
    pub paused: bool,
    /// Assume every piece is present without checking the files
    pub seed_mode: bool,
}

impl Default for AddTorrentParams {
    fn default() -> Self {
        Self {
            ti: None,
            save_path: PathBuf::from("."),
            paused: true,
            seed_mode: false,
        }
    }
}

impl AddTorrentParams {
    /// Parameters for `ti` saved under `save_path`, started unpaused.
    pub fn new(ti: Rc<TorrentInfo>, save_path: impl Into<PathBuf>) -> Self {
        Self {
            ti: Some(ti),
            save_path: save_path.into(),
            paused: false,
            seed_mode: false,
        }
    }
}
