//! Torrent synthesis with piece splitting and hashing
//!
//! Generates deterministic content for test swarms, hashes it into pieces
//! and optionally writes it to disk so seeds have something to serve.

use std::io::Write;

use sha1::{Digest, Sha1};

use super::{InfoHash, PieceIndex, TorrentError};

/// Piece size used by test swarms (16 KiB)
pub const DEFAULT_PIECE_SIZE: u32 = 0x4000;

/// Immutable metadata describing a single-file torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentInfo {
    name: String,
    piece_length: u32,
    piece_hashes: Vec<[u8; 20]>,
    total_length: u64,
    private: bool,
    info_hash: InfoHash,
}

impl TorrentInfo {
    /// Creates torrent metadata and derives its info hash.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Empty name, zero piece length or
    ///   a hash count that does not cover `total_length`
    pub fn new(
        name: impl Into<String>,
        piece_length: u32,
        piece_hashes: Vec<[u8; 20]>,
        total_length: u64,
        private: bool,
    ) -> Result<Self, TorrentError> {
        let name = name.into();
        if name.is_empty() {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Torrent name is empty".to_string(),
            });
        }
        if piece_length == 0 || total_length == 0 {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Torrent has no content".to_string(),
            });
        }

        let expected = total_length.div_ceil(u64::from(piece_length));
        if piece_hashes.len() as u64 != expected {
            return Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "Expected {expected} piece hashes, found {}",
                    piece_hashes.len()
                ),
            });
        }

        let info_hash = calculate_info_hash(&name, piece_length, total_length, private, &piece_hashes);

        Ok(Self {
            name,
            piece_length,
            piece_hashes,
            total_length,
            private,
            info_hash,
        })
    }

    /// File name of the torrent's single file.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nominal piece length in bytes.
    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    /// Total content length in bytes.
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Whether the torrent is flagged private.
    pub fn is_private(&self) -> bool {
        self.private
    }

    /// Info hash identifying the torrent.
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// Number of pieces.
    pub fn num_pieces(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Expected SHA-1 hash of a piece.
    pub fn piece_hash(&self, index: PieceIndex) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index.as_usize())
    }

    /// Byte offset of a piece within the content.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        u64::from(index.as_u32()) * u64::from(self.piece_length)
    }

    /// Length of a piece; the last piece may be shorter.
    pub fn piece_size(&self, index: PieceIndex) -> u32 {
        let remaining = self.total_length.saturating_sub(self.piece_offset(index));
        remaining.min(u64::from(self.piece_length)) as u32
    }

    /// Whether `data` hashes to the expected value for `index`.
    pub fn verify_piece(&self, index: PieceIndex, data: &[u8]) -> bool {
        self.piece_hash(index)
            .is_some_and(|expected| *expected == hash_piece(data))
    }
}

/// SHA-1 hash of piece data.
pub fn hash_piece(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let hash = hasher.finalize();

    let mut hash_array = [0u8; 20];
    hash_array.copy_from_slice(&hash[..20]);
    hash_array
}

/// Synthesizes a torrent of `num_pieces` pieces of `piece_size` bytes.
///
/// Content is a deterministic byte pattern, so every call with the same
/// arguments yields the same info hash. When `file` is given the content is
/// written to it.
///
/// # Errors
/// - `TorrentError::InvalidTorrentFile` - Zero pieces or zero piece size
/// - `TorrentError::Io` - Writing the content failed
pub fn create_torrent(
    file: Option<&mut dyn Write>,
    name: &str,
    piece_size: u32,
    num_pieces: u32,
    private: bool,
) -> Result<TorrentInfo, TorrentError> {
    if piece_size == 0 || num_pieces == 0 {
        return Err(TorrentError::InvalidTorrentFile {
            reason: format!("Cannot create {num_pieces} pieces of {piece_size} bytes"),
        });
    }

    let mut piece_hashes = Vec::with_capacity(num_pieces as usize);
    let mut file = file;

    for index in 0..num_pieces {
        let piece = piece_content(index, piece_size);
        piece_hashes.push(hash_piece(&piece));
        if let Some(out) = file.as_mut() {
            out.write_all(&piece)?;
        }
    }
    if let Some(out) = file.as_mut() {
        out.flush()?;
    }

    let total_length = u64::from(piece_size) * u64::from(num_pieces);
    TorrentInfo::new(name, piece_size, piece_hashes, total_length, private)
}

fn piece_content(index: u32, piece_size: u32) -> Vec<u8> {
    (0..piece_size)
        .map(|offset| (index.wrapping_mul(31).wrapping_add(offset.wrapping_mul(7)) % 251) as u8)
        .collect()
}

/// Hashes a bencode-ordered rendering of the info dictionary.
fn calculate_info_hash(
    name: &str,
    piece_length: u32,
    length: u64,
    private: bool,
    piece_hashes: &[[u8; 20]],
) -> InfoHash {
    let mut info_dict = Vec::new();

    // bencode dictionaries keep their keys sorted
    info_dict.push(b'd');
    info_dict.extend_from_slice(b"6:lengthi");
    info_dict.extend_from_slice(length.to_string().as_bytes());
    info_dict.extend_from_slice(b"e4:name");
    info_dict.extend_from_slice(name.len().to_string().as_bytes());
    info_dict.push(b':');
    info_dict.extend_from_slice(name.as_bytes());
    info_dict.extend_from_slice(b"12:piece lengthi");
    info_dict.extend_from_slice(piece_length.to_string().as_bytes());
    info_dict.extend_from_slice(b"e6:pieces");
    info_dict.extend_from_slice((piece_hashes.len() * 20).to_string().as_bytes());
    info_dict.push(b':');
    for hash in piece_hashes {
        info_dict.extend_from_slice(hash);
    }
    if private {
        info_dict.extend_from_slice(b"7:privatei1e");
    }
    info_dict.push(b'e');

    InfoHash::new(hash_piece(&info_dict))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_torrent_layout() {
        let mut content = Vec::new();
        let info = create_torrent(Some(&mut content), "temporary", 0x4000, 9, false).unwrap();

        assert_eq!(info.name(), "temporary");
        assert_eq!(info.num_pieces(), 9);
        assert_eq!(info.piece_length(), 0x4000);
        assert_eq!(info.total_length(), 9 * 0x4000);
        assert!(!info.is_private());
        assert_eq!(content.len(), 9 * 0x4000);

        for index in 0..9 {
            let index = PieceIndex::new(index);
            let start = info.piece_offset(index) as usize;
            let end = start + info.piece_size(index) as usize;
            assert!(info.verify_piece(index, &content[start..end]));
        }
    }

    #[test]
    fn test_create_torrent_is_deterministic() {
        let a = create_torrent(None, "temporary", 0x4000, 9, false).unwrap();
        let b = create_torrent(None, "temporary", 0x4000, 9, false).unwrap();
        let private = create_torrent(None, "temporary", 0x4000, 9, true).unwrap();

        assert_eq!(a.info_hash(), b.info_hash());
        assert_ne!(a.info_hash(), private.info_hash());
    }

    #[test]
    fn test_corrupt_piece_fails_verification() {
        let mut content = Vec::new();
        let info = create_torrent(Some(&mut content), "t", 1024, 2, false).unwrap();
        content[3] ^= 0xff;
        assert!(!info.verify_piece(PieceIndex::new(0), &content[..1024]));
        assert!(info.verify_piece(PieceIndex::new(1), &content[1024..]));
    }

    #[test]
    fn test_short_last_piece() {
        let hashes = vec![[0u8; 20]; 3];
        let info = TorrentInfo::new("t", 100, hashes, 250, false).unwrap();
        assert_eq!(info.piece_size(PieceIndex::new(0)), 100);
        assert_eq!(info.piece_size(PieceIndex::new(2)), 50);
    }

    #[test]
    fn test_rejects_degenerate_torrents() {
        assert!(create_torrent(None, "t", 0x4000, 0, false).is_err());
        assert!(TorrentInfo::new("", 100, vec![[0u8; 20]], 100, false).is_err());
        assert!(TorrentInfo::new("t", 100, vec![[0u8; 20]], 250, false).is_err());
    }
}
