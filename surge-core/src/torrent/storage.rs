//! Single-file piece storage under a torrent's save path

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{PieceIndex, TorrentError, TorrentInfo};

/// Content file of a torrent, addressed by piece.
///
/// The file lives at `save_path/name`. Pieces are read and written at their
/// offsets, so a partially downloaded file is sparse until complete.
#[derive(Debug, Clone)]
pub struct PieceFile {
    path: PathBuf,
}

impl PieceFile {
    /// Storage for `info` rooted at `save_path`.
    pub fn new(save_path: &Path, info: &TorrentInfo) -> Self {
        Self {
            path: save_path.join(info.name()),
        }
    }

    /// Full path of the content file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads one piece.
    ///
    /// # Errors
    /// - `TorrentError::Io` - File missing, short or unreadable
    pub fn read_piece(&self, info: &TorrentInfo, index: PieceIndex) -> Result<Vec<u8>, TorrentError> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(info.piece_offset(index)))?;

        let mut piece = vec![0u8; info.piece_size(index) as usize];
        file.read_exact(&mut piece)?;
        Ok(piece)
    }

    /// Writes one piece, creating the save path if needed.
    ///
    /// # Errors
    /// - `TorrentError::Io` - Directory creation or write failed
    pub fn write_piece(
        &self,
        info: &TorrentInfo,
        index: PieceIndex,
        data: &[u8],
    ) -> Result<(), TorrentError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)?;
        file.seek(SeekFrom::Start(info.piece_offset(index)))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Hash-checks every piece present on disk.
    ///
    /// A missing file means no pieces. Short files count the pieces that
    /// are fully present and verify.
    ///
    /// # Errors
    /// - `TorrentError::Io` - The file exists but could not be read
    pub fn check_pieces(&self, info: &TorrentInfo) -> Result<Vec<bool>, TorrentError> {
        let mut have = vec![false; info.num_pieces() as usize];

        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(have),
            Err(e) => return Err(e.into()),
        };

        for (slot, index) in have.iter_mut().zip(0..info.num_pieces()) {
            let index = PieceIndex::new(index);
            let mut piece = vec![0u8; info.piece_size(index) as usize];
            file.seek(SeekFrom::Start(info.piece_offset(index)))?;
            match file.read_exact(&mut piece) {
                Ok(()) => *slot = info.verify_piece(index, &piece),
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
        }

        tracing::debug!(
            "Checked {}: {}/{} pieces",
            self.path.display(),
            have.iter().filter(|&&h| h).count(),
            have.len()
        );
        Ok(have)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::torrent::create_torrent;

    #[test]
    fn test_missing_file_has_no_pieces() {
        let dir = TempDir::new().unwrap();
        let info = create_torrent(None, "temporary", 1024, 4, false).unwrap();
        let storage = PieceFile::new(dir.path(), &info);

        assert_eq!(storage.check_pieces(&info).unwrap(), vec![false; 4]);
        assert!(storage.read_piece(&info, PieceIndex::new(0)).is_err());
    }

    #[test]
    fn test_write_then_check_out_of_order() {
        let dir = TempDir::new().unwrap();
        let mut content = Vec::new();
        let info = create_torrent(Some(&mut content), "temporary", 1024, 4, false).unwrap();
        let storage = PieceFile::new(&dir.path().join("nested"), &info);

        storage
            .write_piece(&info, PieceIndex::new(2), &content[2048..3072])
            .unwrap();
        assert_eq!(
            storage.check_pieces(&info).unwrap(),
            vec![false, false, true, false]
        );

        storage
            .write_piece(&info, PieceIndex::new(0), &content[..1024])
            .unwrap();
        assert_eq!(
            storage.read_piece(&info, PieceIndex::new(0)).unwrap(),
            &content[..1024]
        );
        assert_eq!(
            storage.check_pieces(&info).unwrap(),
            vec![true, false, true, false]
        );
    }

    #[test]
    fn test_full_file_checks_complete() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temporary");
        let mut file = File::create(&path).unwrap();
        let info = create_torrent(Some(&mut file), "temporary", 1024, 3, false).unwrap();
        drop(file);

        let storage = PieceFile::new(dir.path(), &info);
        assert_eq!(storage.path(), path);
        assert_eq!(storage.check_pieces(&info).unwrap(), vec![true; 3]);
    }
}
