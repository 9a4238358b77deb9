//! The sector-addressed contract consumed by a virtual disk controller.

use crate::{client::Client, remote::Disk, Error};
use std::future::Future;
use streamdisk_storage::store::Store;

/// Size of a sector, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// A read-only device addressed in [SECTOR_SIZE] sectors.
pub trait BlockDevice: Send + Sync {
    /// Number of whole sectors on the device.
    fn capacity(&self) -> u64;

    /// Fill `buf` starting at sector `lba`. `buf` must hold a whole number of sectors.
    fn read_sectors(
        &self,
        lba: u64,
        buf: &mut [u8],
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Always fails with [Error::ReadOnly].
    fn write_sectors(
        &self,
        lba: u64,
        buf: &[u8],
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Persist any pending state.
    fn flush(&self) -> impl Future<Output = Result<(), Error>> + Send;
}

impl<S: Store, C: Client> BlockDevice for Disk<S, C> {
    fn capacity(&self) -> u64 {
        self.size() / SECTOR_SIZE as u64
    }

    async fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() % SECTOR_SIZE != 0 {
            return Err(Error::Unaligned {
                lba,
                len: buf.len(),
            });
        }
        let offset = lba
            .checked_mul(SECTOR_SIZE as u64)
            .ok_or(Error::OutOfBounds {
                offset: u64::MAX,
                len: buf.len() as u64,
                size: self.size(),
            })?;
        self.read_at(offset, buf).await
    }

    async fn write_sectors(&self, _: u64, _: &[u8]) -> Result<(), Error> {
        Err(Error::ReadOnly)
    }

    async fn flush(&self) -> Result<(), Error> {
        Disk::flush(self).await
    }
}
