//! The disk layer: a single dedicated worker task owning a FIFO queue of
//! (torrent, piece) writes plus a `read_block` path for peer serving.
//!
//! Grounded on `examples/original_source/src/file_writer.cpp`'s
//! temp-file scheme (`.zit_downloading` suffix for single-file torrents, a
//! 1-byte sentinel file alongside a multi-file directory), its
//! file-at-pos map for spanning a piece across several destination files,
//! and its verify-then-write-then-rename completion sequence (spec §4.10,
//! §6). The original's dedicated OS thread plus condition-variable queue
//! becomes a `tokio::task` reading an `mpsc` channel, which is itself the
//! FIFO queue.
use crate::hash;
use crate::piece::Piece;
use crate::torrent::file::TorrentFile;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error)]
pub enum FileWriterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("piece {0} failed SHA-1 verification and was not written")]
    HashMismatch(u32),

    #[error("file writer task is no longer running")]
    WorkerGone,
}

/// A single pending disk write, queued in arrival order.
struct WriteJob {
    piece_id: u32,
    piece: Arc<Piece>,
}

enum Command {
    Write(WriteJob),
    ReadBlock {
        piece_id: u32,
        offset: u32,
        length: u32,
        reply: oneshot::Sender<Result<Vec<u8>, FileWriterError>>,
    },
}

/// A handle to the running file writer task. Cheap to clone and share
/// across peer sessions (for `read_block`) and the torrent session (for
/// enqueuing writes).
#[derive(Clone)]
pub struct Handle {
    tx: mpsc::UnboundedSender<Command>,
}

impl Handle {
    /// Enqueues a piece for verification and writing. Fire-and-forget:
    /// failures are logged by the worker and the piece is left to the
    /// retry loop.
    pub fn enqueue_write(&self, piece_id: u32, piece: Arc<Piece>) {
        let _ = self.tx.send(Command::Write(WriteJob { piece_id, piece }));
    }

    /// Reads a block from disk — used when a peer requests a block for a
    /// piece whose in-memory buffer has already been released.
    pub async fn read_block(
        &self,
        piece_id: u32,
        offset: u32,
        length: u32,
    ) -> Result<Vec<u8>, FileWriterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::ReadBlock {
                piece_id,
                offset,
                length,
                reply,
            })
            .map_err(|_| FileWriterError::WorkerGone)?;
        rx.await.map_err(|_| FileWriterError::WorkerGone)?
    }
}

/// Spawns the worker task and returns a handle to it. `on_written` is
/// invoked (from the worker task) with a piece id every time that piece
/// is successfully verified and persisted; the torrent session uses it to
/// update `client_pieces` and check for overall completion.
pub fn spawn(
    metadata: Arc<TorrentFile>,
    base_dir: PathBuf,
    on_written: Arc<dyn Fn(u32) + Send + Sync>,
) -> Handle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(metadata, base_dir, rx, on_written));
    Handle { tx }
}

async fn run(
    metadata: Arc<TorrentFile>,
    base_dir: PathBuf,
    mut rx: mpsc::UnboundedReceiver<Command>,
    on_written: Arc<dyn Fn(u32) + Send + Sync>,
) {
    if let Err(e) = ensure_allocated(&metadata, &base_dir) {
        tracing::error!(error = %e, "failed to allocate destination files");
    }

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Write(job) => {
                let metadata = metadata.clone();
                let base_dir = base_dir.clone();
                let piece_id = job.piece_id;
                let result =
                    tokio::task::spawn_blocking(move || write_piece(&metadata, &base_dir, &job))
                        .await
                        .expect("file writer blocking task panicked");
                match result {
                    Ok(()) => on_written(piece_id),
                    Err(e) => tracing::warn!(piece_id, error = %e, "piece write failed, will retry"),
                }
            }
            Command::ReadBlock {
                piece_id,
                offset,
                length,
                reply,
            } => {
                let metadata = metadata.clone();
                let base_dir = base_dir.clone();
                let result = tokio::task::spawn_blocking(move || {
                    read_block(&metadata, &base_dir, piece_id, offset, length)
                })
                .await
                .expect("file writer blocking task panicked");
                let _ = reply.send(result);
            }
        }
    }
}

/// The physical path of the single file backing a single-file torrent:
/// the `.zit_downloading` temp name while incomplete, the final name once
/// `finalize_completed_torrent` has renamed it.
fn single_file_physical_path(metadata: &TorrentFile, base_dir: &Path) -> PathBuf {
    let final_path = base_dir.join(metadata.final_name());
    if final_path.exists() {
        final_path
    } else {
        base_dir.join(metadata.downloading_name())
    }
}

fn sentinel_path(metadata: &TorrentFile, base_dir: &Path) -> PathBuf {
    base_dir.join(metadata.downloading_name())
}

/// Creates destination file(s) at the correct sizes if they don't already
/// exist: a zero-filled temp file for single-file torrents, or the
/// directory tree plus each member file (zero-filled at its declared
/// length) plus a 1-byte sentinel for multi-file torrents.
fn ensure_allocated(metadata: &TorrentFile, base_dir: &Path) -> std::io::Result<()> {
    if !metadata.info.is_directory {
        let path = single_file_physical_path(metadata, base_dir);
        if !path.exists() {
            let file = File::create(&path)?;
            file.set_len(metadata.total_length() as u64)?;
        }
        return Ok(());
    }

    let root = base_dir.join(metadata.final_name());
    std::fs::create_dir_all(&root)?;
    for file_info in &metadata.info.files {
        let mut path = root.clone();
        for component in &file_info.path {
            path = path.join(component);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            let file = File::create(&path)?;
            file.set_len(file_info.length as u64)?;
        }
    }
    let sentinel = sentinel_path(metadata, base_dir);
    if !sentinel.exists() {
        std::fs::write(&sentinel, [0u8])?;
    }
    Ok(())
}

/// Verifies a piece's in-memory buffer against its expected hash, then
/// writes it to the correct destination file(s), possibly spanning
/// several in a multi-file layout.
fn write_piece(
    metadata: &TorrentFile,
    base_dir: &Path,
    job: &WriteJob,
) -> Result<(), FileWriterError> {
    let data = job.piece.buffer_snapshot();
    let expected = metadata
        .pieces_hash
        .get(job.piece_id as usize)
        .copied()
        .unwrap_or([0u8; 20]);
    let actual = hash::sha1(&data);
    if actual != expected {
        return Err(FileWriterError::HashMismatch(job.piece_id));
    }

    let mut global_offset = job.piece_id as i64 * metadata.info.piece_length;
    let mut remaining = &data[..];

    while !remaining.is_empty() {
        let (path, file_offset, space_in_file) = if !metadata.info.is_directory {
            let path = single_file_physical_path(metadata, base_dir);
            let space = metadata.total_length() - global_offset;
            (path, global_offset, space)
        } else {
            let (rel, file_offset, space) = metadata
                .file_at_pos(global_offset)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            (base_dir.join(metadata.final_name()).join(rel), file_offset, space)
        };

        let chunk_len = remaining.len().min(space_in_file.max(0) as usize);
        let chunk_len = chunk_len.max(1).min(remaining.len());
        let mut file = OpenOptions::new().write(true).open(&path)?;
        file.seek(SeekFrom::Start(file_offset as u64))?;
        file.write_all(&remaining[..chunk_len])?;

        remaining = &remaining[chunk_len..];
        global_offset += chunk_len as i64;
    }

    job.piece.set_piece_written(true);
    Ok(())
}

/// Reads `length` bytes at `offset` within piece `piece_id` from disk,
/// for serving a block that's no longer buffered in memory.
fn read_block(
    metadata: &TorrentFile,
    base_dir: &Path,
    piece_id: u32,
    offset: u32,
    length: u32,
) -> Result<Vec<u8>, FileWriterError> {
    let mut global_offset = piece_id as i64 * metadata.info.piece_length + offset as i64;
    let mut remaining = length as usize;
    let mut out = Vec::with_capacity(length as usize);

    while remaining > 0 {
        let (path, file_offset, space_in_file) = if !metadata.info.is_directory {
            let path = single_file_physical_path(metadata, base_dir);
            let space = metadata.total_length() - global_offset;
            (path, global_offset, space)
        } else {
            let (rel, file_offset, space) = metadata
                .file_at_pos(global_offset)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            (base_dir.join(metadata.final_name()).join(rel), file_offset, space)
        };

        let want = remaining.min(space_in_file.max(0) as usize).max(1).min(remaining);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(file_offset as u64))?;
        let mut buf = vec![0u8; want];
        file.read_exact(&mut buf)?;
        out.extend_from_slice(&buf);

        remaining -= want;
        global_offset += want as i64;
    }

    Ok(out)
}

/// Once every piece is written: renames the single-file temp to its final
/// name, or removes the multi-file sentinel.
pub fn finalize_completed_torrent(
    metadata: &TorrentFile,
    base_dir: &Path,
) -> std::io::Result<()> {
    if !metadata.info.is_directory {
        let temp = base_dir.join(metadata.downloading_name());
        let final_path = base_dir.join(metadata.final_name());
        if temp.exists() {
            std::fs::rename(temp, final_path)?;
        }
    } else {
        let sentinel = sentinel_path(metadata, base_dir);
        if sentinel.exists() {
            std::fs::remove_file(sentinel)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, BencodeValue};
    use crate::runtime::SystemClock;
    use std::collections::BTreeMap;

    fn new_piece(id: u32, piece_size: u32) -> Piece {
        Piece::new(id, piece_size, Arc::new(SystemClock))
    }

    fn single_file_torrent(piece_length: i64, total_length: i64) -> TorrentFile {
        let mut info = BTreeMap::new();
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(piece_length));
        let num_pieces = total_length.div_ceil(piece_length) as usize;
        info.insert(
            b"pieces".to_vec(),
            BencodeValue::String(vec![0u8; 20 * num_pieces]),
        );
        info.insert(b"name".to_vec(), BencodeValue::String(b"out.bin".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(total_length));
        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            BencodeValue::String(b"http://t.example/a".to_vec()),
        );
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));
        let bytes = bencode::encode(&BencodeValue::Dict(root)).unwrap();
        TorrentFile::parse(bencode::decode(&bytes).unwrap()).unwrap()
    }

    #[test]
    fn ensure_allocated_creates_zero_filled_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = single_file_torrent(16384, 32768);
        ensure_allocated(&metadata, dir.path()).unwrap();
        let temp = dir.path().join(metadata.downloading_name());
        assert!(temp.exists());
        assert_eq!(temp.metadata().unwrap().len(), 32768);
    }

    #[test]
    fn write_piece_rejects_on_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = single_file_torrent(16384, 16384);
        ensure_allocated(&metadata, dir.path()).unwrap();
        let piece = Arc::new(new_piece(0, 16384));
        piece.set_block(0, &vec![9u8; 16384]).unwrap();
        let job = WriteJob { piece_id: 0, piece: piece.clone() };
        let err = write_piece(&metadata, dir.path(), &job).unwrap_err();
        assert!(matches!(err, FileWriterError::HashMismatch(0)));
        assert!(!piece.written());
    }

    #[test]
    fn write_piece_then_read_block_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut metadata = single_file_torrent(16384, 16384);
        let piece = Arc::new(new_piece(0, 16384));
        let payload = vec![0xABu8; 16384];
        piece.set_block(0, &payload).unwrap();
        metadata.pieces_hash[0] = hash::sha1(&payload);
        ensure_allocated(&metadata, dir.path()).unwrap();
        let job = WriteJob { piece_id: 0, piece: piece.clone() };
        write_piece(&metadata, dir.path(), &job).unwrap();
        assert!(piece.written());

        let read_back = read_block(&metadata, dir.path(), 0, 0, 16384).unwrap();
        assert_eq!(read_back, payload);
    }

    #[test]
    fn finalize_renames_single_file_temp_to_final_name() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = single_file_torrent(16384, 16384);
        ensure_allocated(&metadata, dir.path()).unwrap();
        finalize_completed_torrent(&metadata, dir.path()).unwrap();
        assert!(dir.path().join(metadata.final_name()).exists());
        assert!(!dir.path().join(metadata.downloading_name()).exists());
    }
}
