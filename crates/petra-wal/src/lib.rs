//! Write-ahead logging for petra.
//!
//! The WAL turns a commit into an append: page images go to a side file
//! (`<db>-wal`) as checksummed frames, the wal-index shared-memory hash maps
//! page numbers to the newest frame, and checkpoints migrate frames back
//! into the database file. Readers pin a snapshot via published read marks,
//! so one writer and many readers proceed without blocking each other.
//!
//! Layering: [`checksum`] is the on-disk format, [`wal_index`] is the shm
//! structure, [`wal`] is the per-connection protocol object, and
//! [`checkpoint`] adds the backfill algorithm on top of it.

pub mod checkpoint;
pub mod checksum;
pub mod wal;
pub mod wal_index;

pub use checkpoint::{CheckpointResult, CheckpointTarget};
pub use checksum::{
    WAL_FRAME_HEADER_SIZE, WAL_HEADER_SIZE, WalChecksum, WalFrameHeader, WalHeader, WalSalts,
};
pub use wal::{WAL_RETRY_LIMIT, Wal, wal_path};
pub use wal_index::{WalCkptInfo, WalIndex, WalIndexHdr};
