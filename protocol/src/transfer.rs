//! # Transfer Pipeline
//!
//! The streaming halves of a transfer and the post-reveal decryption pass.
//!
//! Wire format, repeated until a clean EOF at a record boundary:
//!
//! ```text
//! uvarint(len) || cipher_bytes[len] || clear_hash[32]
//! ```
//!
//! `len` equals the chunk size except possibly on the last record. EOF in
//! the middle of a record is a fatal transport error — HTTP content framing
//! delimits the body, so a clean close is the only valid terminator.
//!
//! Ordering is strict: chunks are received, persisted, and fed to the
//! interleaved Merkle builder in index order, and the buyer proposes
//! payment only after the stream closes with a matching clear root. A
//! mismatched root before the key reveal means the seller committed to the
//! wrong content, and the transfer aborts with no funds committed.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::chunk::{clear_hash, decrypt_chunk, encrypt_chunk, uvarint};
use crate::config::HASH_LENGTH;
use crate::merkle::{InterleavedBuilder, MerkleError};
use crate::store::{ChunkStore, StoreError};
use crate::types::{hex32, Hash32};

/// Errors from the transfer pipeline.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The stream ended inside a record.
    #[error("chunk stream truncated mid-record")]
    TruncatedStream,

    /// A record length field was zero or larger than the chunk size.
    #[error("malformed chunk record: length {len}, chunk size {chunk_size}")]
    MalformedRecord { len: u64, chunk_size: usize },

    /// The stream closed before any record arrived.
    #[error("empty chunk stream")]
    EmptyStream,

    /// The computed clear root disagrees with the requested one. The seller
    /// committed to different content; nothing has been proposed or paid.
    #[error("clear root mismatch: got {}, want {}", hex32(got), hex32(want))]
    ClearRootMismatch { got: Box<Hash32>, want: Box<Hash32> },

    /// Decryption produced a chunk whose hash disagrees with the committed
    /// clear hash. The index feeds the fraud proof.
    #[error("bad clear hash for chunk {index}")]
    BadClearHash { index: u64 },

    /// A stored clear hash is not 32 bytes.
    #[error("stored clear hash {index} has length {len}")]
    CorruptHashRecord { index: u64, len: usize },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Merkle(#[from] MerkleError),

    #[error("stream i/o error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Buyer Side
// ---------------------------------------------------------------------------

/// Receives a chunk stream, persisting cipher chunks and clear hashes and
/// maintaining both Merkle roots.
///
/// On success the computed clear root equals `expected_clear_root` and the
/// computed cipher root is returned for binding into the payment proposal.
pub async fn receive<R, H, C>(
    stream: &mut R,
    chunk_size: usize,
    expected_clear_root: &Hash32,
    hashes: &mut H,
    chunks: &mut C,
) -> Result<Hash32, TransferError>
where
    R: AsyncRead + Unpin,
    H: ChunkStore,
    C: ChunkStore,
{
    let mut builder = InterleavedBuilder::new();
    let mut index: u64 = 0;

    loop {
        let len = match read_record_len(stream).await? {
            Some(len) => len,
            None => break,
        };
        if len == 0 || len > chunk_size as u64 {
            return Err(TransferError::MalformedRecord { len, chunk_size });
        }

        let mut cipher = vec![0u8; len as usize];
        read_exact_or_truncated(stream, &mut cipher).await?;
        let mut hash = [0u8; HASH_LENGTH];
        read_exact_or_truncated(stream, &mut hash).await?;

        chunks.append(&cipher)?;
        hashes.append(&hash)?;
        builder.add(index, &hash, &cipher)?;
        index += 1;
    }

    if index == 0 {
        return Err(TransferError::EmptyStream);
    }

    let (clear_root, cipher_root) = builder.finish();
    if clear_root != *expected_clear_root {
        return Err(TransferError::ClearRootMismatch {
            got: Box::new(clear_root),
            want: Box::new(*expected_clear_root),
        });
    }
    tracing::debug!(chunks = index, cipher_root = %hex32(&cipher_root), "stream received");
    Ok(cipher_root)
}

/// Decrypts the stored cipher chunks under the revealed key, verifying each
/// chunk against its committed clear hash before writing it out.
///
/// Halts at the first mismatch with [`TransferError::BadClearHash`]; the
/// stores are left intact for fraud-proof construction.
pub async fn decrypt<W, H, C>(
    out: &mut W,
    key: &Hash32,
    hashes: &H,
    chunks: &C,
) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
    H: ChunkStore,
    C: ChunkStore,
{
    for index in 0..chunks.len() {
        let cipher = chunks.get(index)?;
        let plaintext = decrypt_chunk(key, index, &cipher);

        let stored = hashes.get(index)?;
        let stored: Hash32 = stored
            .as_slice()
            .try_into()
            .map_err(|_| TransferError::CorruptHashRecord {
                index,
                len: stored.len(),
            })?;
        if clear_hash(index, &plaintext) != stored {
            return Err(TransferError::BadClearHash { index });
        }
        out.write_all(&plaintext).await?;
    }
    out.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Seller Side
// ---------------------------------------------------------------------------

/// Streams `content` as encrypted chunk records into `sink`, computing both
/// roots concurrently. Returns `(clear_root, cipher_root)`.
pub async fn serve<R, W>(
    content: &mut R,
    sink: &mut W,
    chunk_size: usize,
    key: &Hash32,
) -> Result<(Hash32, Hash32), TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut builder = InterleavedBuilder::new();
    let mut index: u64 = 0;
    let mut buf = vec![0u8; chunk_size];

    loop {
        let filled = read_up_to(content, &mut buf).await?;
        if filled == 0 {
            break;
        }
        let plaintext = &buf[..filled];
        let hash = clear_hash(index, plaintext);
        let cipher = encrypt_chunk(key, index, plaintext);

        sink.write_all(&uvarint(cipher.len() as u64)).await?;
        sink.write_all(&cipher).await?;
        sink.write_all(&hash).await?;
        builder.add(index, &hash, &cipher)?;
        index += 1;

        if filled < chunk_size {
            break;
        }
    }
    sink.flush().await?;

    if index == 0 {
        return Err(TransferError::EmptyStream);
    }
    Ok(builder.finish())
}

// ---------------------------------------------------------------------------
// Stream Helpers
// ---------------------------------------------------------------------------

/// Reads the varint length of the next record. `None` on a clean EOF at a
/// record boundary; truncation inside the varint is fatal.
async fn read_record_len<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<Option<u64>, TransferError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    let mut first = true;
    loop {
        let mut byte = [0u8; 1];
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            if first {
                return Ok(None);
            }
            return Err(TransferError::TruncatedStream);
        }
        first = false;
        let b = byte[0];
        if shift >= 64 {
            return Err(TransferError::MalformedRecord {
                len: u64::MAX,
                chunk_size: 0,
            });
        }
        value |= u64::from(b & 0x7f) << shift;
        if b < 0x80 {
            return Ok(Some(value));
        }
        shift += 7;
    }
}

async fn read_exact_or_truncated<R: AsyncRead + Unpin>(
    stream: &mut R,
    buf: &mut [u8],
) -> Result<(), TransferError> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(TransferError::TruncatedStream)
        }
        Err(e) => Err(e.into()),
    }
}

/// Fills `buf` as far as the stream allows; a short return means EOF.
async fn read_up_to<R: AsyncRead + Unpin>(
    stream: &mut R,
    buf: &mut [u8],
) -> Result<usize, TransferError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
