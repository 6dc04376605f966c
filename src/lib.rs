//! Power-loss-safe key/value store for byte-addressable non-volatile
//! memories: on-chip or serial flash, FeRAM, EEPROM, or a file standing in
//! for one.
//!
//! The memory is treated as a circular ring of sectors, each a miniature
//! append-only log with an allocation table growing from the low end and
//! data blobs growing from the high end. One sector is open for writes at a
//! time; when it fills it is sealed and the oldest sector is copied forward
//! and erased. Data is always written before the table entry referencing
//! it, so after a power cut [`Storage::mount`] recovers a state in which
//! every completed write is visible and every torn one is invisible.

#![cfg_attr(not(test), no_std)]
#![allow(async_fn_in_trait)]

use core::sync::atomic::{AtomicU8, Ordering};

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::mutex::Mutex;
use log::{debug, info, warn};

use crate::gc::Gc;
use crate::ll::entry::{Payload, ENTRY_BYTES, INLINE_MAX, TERMINATOR_ID};
use crate::ll::sector::{Head, SectorOps, SectorState};
use crate::medium::{BusDevice, Memory};

pub mod diag;
mod gc;
mod ll;
pub mod medium;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The store is not mounted.
    NotReady,
    /// Reserved for drivers that surface media-level checksum failures.
    /// Entries whose own checksum fails are simply treated as absent.
    Checksum,
    /// The id is reserved.
    InvalidId,
    /// The value cannot fit a sector alongside its table entries.
    WriteSizeExceeded,
    /// Every sector was collected within one write and there is still no
    /// room.
    OutOfMemory,
    /// The driver completed a transfer short; the media is not usable.
    Fatal,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum State {
    NotMounted = 0,
    Ready = 1,
    Busy = 2,
}

/// Shape of the store, fixed at construction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Geometry {
    /// Smallest atomic write unit, a power of two.
    pub block_size: usize,
    /// Smallest erasable unit, a power of two, at least `block_size`.
    pub page_size: usize,
    /// Multiple of `page_size`, at most `32768 * block_size`.
    pub sector_size: usize,
    /// At least 2.
    pub sector_count: usize,
}

impl Geometry {
    fn check(&self) {
        assert!(self.block_size >= 1 && self.block_size.is_power_of_two());
        assert!(self.page_size >= self.block_size && self.page_size.is_power_of_two());
        assert!(self.sector_size % self.page_size == 0);
        assert!(self.sector_size <= 32768 * self.block_size);
        assert!(self.sector_size >= 2 * self.entry_size());
        assert!(self.sector_count >= 2);
    }

    /// Table slot pitch: the 8-byte record rounded up to the write block.
    pub(crate) fn entry_size(&self) -> usize {
        (ENTRY_BYTES + self.block_size - 1) & !(self.block_size - 1)
    }

    /// Stored data offsets are right-shifted by this so they fit 16 bits.
    pub(crate) fn offset_shift(&self) -> u32 {
        self.block_size.trailing_zeros()
    }

    pub(crate) fn sector_base(&self, sector: usize) -> usize {
        sector * self.sector_size
    }

    pub(crate) fn next_sector(&self, sector: usize) -> usize {
        if sector + 1 == self.sector_count {
            0
        } else {
            sector + 1
        }
    }

    pub(crate) fn prev_sector(&self, sector: usize) -> usize {
        if sector == 0 {
            self.sector_count - 1
        } else {
            sector - 1
        }
    }

    pub(crate) fn align_data(&self, size: usize) -> usize {
        (size + self.block_size - 1) & !(self.block_size - 1)
    }

    /// Largest storable value: a sector must hold the value, its table
    /// entry and the terminator.
    pub fn max_data_size(&self) -> usize {
        self.sector_size - 2 * self.entry_size()
    }
}

/// The store handle. All operations serialise on an internal mutex; callers
/// queue in arrival order. `BUF_SIZE` is the capacity of the one transfer
/// buffer every byte of data moves through.
pub struct Storage<B, const BUF_SIZE: usize> {
    inner: Mutex<NoopRawMutex, Inner<B, BUF_SIZE>>,
    state: AtomicU8,
}

struct Inner<B, const BUF_SIZE: usize> {
    memory: Memory<B, BUF_SIZE>,
    geo: Geometry,
    mounted: bool,
    head: Head,
}

impl<B: BusDevice, const BUF_SIZE: usize> Storage<B, BUF_SIZE> {
    /// Panics if the geometry is inconsistent or the transfer buffer is too
    /// small for an entry or a write block.
    pub fn new(memory: Memory<B, BUF_SIZE>, geometry: Geometry) -> Self {
        geometry.check();
        assert!(BUF_SIZE >= ENTRY_BYTES && BUF_SIZE >= geometry.block_size);

        Self {
            inner: Mutex::new(Inner {
                memory,
                geo: geometry,
                mounted: false,
                head: Head::default(),
            }),
            state: AtomicU8::new(State::NotMounted as u8),
        }
    }

    pub fn state(&self) -> State {
        match self.state.load(Ordering::Relaxed) {
            0 => State::NotMounted,
            1 => State::Ready,
            _ => State::Busy,
        }
    }

    /// Recovers the store from whatever the media holds and brings it
    /// READY. Safe to call repeatedly; a failure leaves the store
    /// unmounted.
    pub async fn mount(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;

        self.set_state(State::Busy);
        let result = inner.mount().await;
        self.set_state(match result {
            Ok(()) => State::Ready,
            Err(_) => State::NotMounted,
        });

        result
    }

    /// Erases every sector and leaves the store READY. No prior mount is
    /// required.
    pub async fn clear(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;

        self.set_state(State::Busy);
        let result = inner.clear().await;
        self.set_state(match result {
            Ok(()) => State::Ready,
            Err(_) => State::NotMounted,
        });

        result
    }

    /// Looks up `id` and copies its value into `dst`, which is zero-filled
    /// first. Returns the stored size — possibly larger than `dst`, in
    /// which case `dst` holds the prefix — or 0 if the id is absent.
    pub async fn read(&self, id: u16, dst: &mut [u8]) -> Result<usize, Error> {
        dst.fill(0);

        let mut inner = self.inner.lock().await;
        if !inner.mounted {
            return Err(Error::NotReady);
        }
        if id == TERMINATOR_ID {
            return Err(Error::InvalidId);
        }

        self.set_state(State::Busy);
        let result = inner.read(id, dst).await;
        self.set_state(State::Ready);

        result
    }

    /// Stores `data` under `id`, replacing any previous value. Once this
    /// returns, the value survives any sequence of power cuts. Returns the
    /// byte count written.
    pub async fn write(&self, id: u16, data: &[u8]) -> Result<usize, Error> {
        let mut inner = self.inner.lock().await;
        if !inner.mounted {
            return Err(Error::NotReady);
        }
        if id == TERMINATOR_ID {
            return Err(Error::InvalidId);
        }

        self.set_state(State::Busy);
        let result = inner.write(id, data).await;
        self.set_state(State::Ready);

        result
    }

    /// Removes `id`; equivalent to writing a zero-length value.
    pub async fn erase(&self, id: u16) -> Result<usize, Error> {
        self.write(id, &[]).await
    }

    /// Stored size of `id` without transferring the value; 0 if absent.
    pub async fn size(&self, id: u16) -> Result<usize, Error> {
        self.read(id, &mut []).await
    }

    pub fn into_inner(self) -> Memory<B, BUF_SIZE> {
        self.inner.into_inner().memory
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Relaxed);
    }
}

impl<B: BusDevice, const BUF_SIZE: usize> Inner<B, BUF_SIZE> {
    /// Walks the ring once to find the head, guarantees the sector after it
    /// is empty, then recovers the write cursors from the head's state. A
    /// head that was sealed but never collected means power was lost during
    /// collection; the collection is replayed.
    async fn mount(&mut self) -> Result<(), Error> {
        self.mounted = false;

        let count = self.geo.sector_count;
        let mut prev = SectorOps::new(&mut self.memory, &self.geo)
            .state(count - 1)
            .await?;
        let mut head = 0;
        let mut head_state = SectorState::Empty;
        let mut found_empty = false;

        for sector in 0..count {
            let current = SectorOps::new(&mut self.memory, &self.geo)
                .state(sector)
                .await?;
            let previous = if sector == 0 { count - 1 } else { sector - 1 };

            // a non-empty sector followed by an empty one is the head
            if prev != SectorState::Empty && current == SectorState::Empty {
                head = previous;
                head_state = prev;
                found_empty = true;
            }
            // a closed sector followed by an open one is the head, unless
            // the empty boundary already settled it
            if !found_empty && prev == SectorState::Closed && current == SectorState::Open {
                head = previous;
                head_state = prev;
            }

            prev = current;
        }

        // the sector after the head must be empty; it may hold the partial
        // image of an interrupted collection
        let next = self.geo.next_sector(head);
        SectorOps::new(&mut self.memory, &self.geo).erase(next).await?;

        match head_state {
            SectorState::Empty => {
                // fresh media
                self.head.reset(&self.geo, head);
            }
            SectorState::Open => {
                let (entry_write, data_write) = SectorOps::new(&mut self.memory, &self.geo)
                    .detect_offsets(head)
                    .await?;
                self.head = Head {
                    sector: head,
                    entry_write,
                    data_write,
                };
            }
            SectorState::Closed => {
                warn!("mount: interrupted collection, replaying into sector {}", next);
                self.head.reset(&self.geo, next);
                self.collect(next).await?;
            }
        }

        debug!(
            "mounted: head sector {} was {:?}, cursors {}/{}",
            self.head.sector, head_state, self.head.entry_write, self.head.data_write
        );
        self.mounted = true;
        Ok(())
    }

    async fn clear(&mut self) -> Result<(), Error> {
        self.mounted = false;
        info!("clearing {} sectors", self.geo.sector_count);

        for sector in 0..self.geo.sector_count {
            SectorOps::new(&mut self.memory, &self.geo).erase(sector).await?;
        }

        self.head.reset(&self.geo, 0);
        self.mounted = true;
        Ok(())
    }

    /// Scans sectors newest to oldest and table slots newest to oldest
    /// within each, so the first match is the live value.
    async fn read(&mut self, id: u16, dst: &mut [u8]) -> Result<usize, Error> {
        let mut sector = self.head.sector;
        let mut entry_offset = self.head.entry_write - self.geo.entry_size();

        let mut ops = SectorOps::new(&mut self.memory, &self.geo);
        let geo = ops.geo;
        let entry_size = geo.entry_size();
        let chunk = ops.chunk_size();
        let mut base = geo.sector_base(sector);

        let mut walked = 0;
        loop {
            while entry_offset > 0 {
                let entry = ops.read_entry(base + entry_offset).await?;
                if ops.entry_valid(&entry, entry_offset, geo.sector_size) && entry.id() == id {
                    return match entry.payload() {
                        Payload::Small { data, len } => {
                            let n = dst.len().min(len as usize);
                            dst[..n].copy_from_slice(&data[..n]);
                            Ok(len as usize)
                        }
                        Payload::Long { size, offset } => {
                            let size = size as usize;
                            let mut src = base + ((offset as usize) << geo.offset_shift());
                            let mut copied = 0;
                            let mut remaining = dst.len().min(size);
                            while remaining > 0 {
                                let span = chunk.min(remaining);
                                let bytes = ops.memory.read(src, span).await?;
                                dst[copied..copied + span].copy_from_slice(bytes);
                                src += span;
                                copied += span;
                                remaining -= span;
                            }
                            Ok(size)
                        }
                    };
                }
                entry_offset -= entry_size;
            }

            // the sector after the head is empty, so the ring holds at most
            // sector_count - 1 sectors worth of entries
            walked += 1;
            if walked == geo.sector_count - 1 {
                break;
            }

            sector = geo.prev_sector(sector);
            base = geo.sector_base(sector);
            entry_offset = ops.last_entry_offset(base).await?;
        }

        Ok(0)
    }

    async fn write(&mut self, id: u16, data: &[u8]) -> Result<usize, Error> {
        if data.len() > self.geo.max_data_size() {
            return Err(Error::WriteSizeExceeded);
        }

        // make room, sealing and collecting until the entry fits
        let mut rounds = 0;
        while self.head.entry_write + self.geo.entry_size() + data.len() > self.head.data_write {
            rounds += 1;
            if rounds >= self.geo.sector_count {
                warn!("write {}: every sector collected, store is full", id);
                return Err(Error::OutOfMemory);
            }

            debug!("sector {} is full, sealing", self.head.sector);
            SectorOps::new(&mut self.memory, &self.geo)
                .close(&mut self.head)
                .await?;
            self.collect(self.head.sector).await?;
        }

        if data.len() > INLINE_MAX {
            // blob first, table entry second: a cut between the two leaves
            // dead bytes but nothing reachable
            let offset = self.head.data_write - self.geo.align_data(data.len());
            self.head.data_write = offset;

            let chunk = BUF_SIZE & !(self.geo.block_size - 1);
            let mut at = self.geo.sector_base(self.head.sector) + offset;
            let mut src = data;
            while !src.is_empty() {
                let span = chunk.min(src.len());
                self.memory.payload_mut()[..span].copy_from_slice(&src[..span]);
                self.memory.write(at, span).await?;
                at += span;
                src = &src[span..];
            }

            SectorOps::new(&mut self.memory, &self.geo)
                .write_long_entry(&mut self.head, id, data.len())
                .await?;
        } else {
            SectorOps::new(&mut self.memory, &self.geo)
                .write_small_entry(&mut self.head, id, data)
                .await?;
        }

        Ok(data.len())
    }

    async fn collect(&mut self, empty_sector: usize) -> Result<(), Error> {
        Gc::new(&mut self.memory, &self.geo, &mut self.head)
            .run(empty_sector)
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::medium::ram::RamDevice;
    use crate::medium::{Framing, MemoryKind, MemoryProfile};

    const GEO: Geometry = Geometry {
        block_size: 4,
        page_size: 128,
        sector_size: 512,
        sector_count: 3,
    };

    const PROFILE: MemoryProfile = MemoryProfile {
        address: 0,
        kind: MemoryKind::Ram,
        framing: Framing::Native4,
    };

    type TestStorage = Storage<RamDevice<1536>, 32>;

    fn create_storage() -> TestStorage {
        Storage::new(Memory::new(RamDevice::new(), PROFILE), GEO)
    }

    fn remount(storage: TestStorage) -> TestStorage {
        let bus = storage.into_inner().into_inner();
        Storage::new(Memory::new(bus, PROFILE), GEO)
    }

    #[async_std::test]
    async fn operations_require_a_mount() {
        let storage = create_storage();

        assert_eq!(storage.state(), State::NotMounted);
        assert_eq!(storage.read(1, &mut [0; 4]).await, Err(Error::NotReady));
        assert_eq!(storage.write(1, b"x").await, Err(Error::NotReady));
    }

    #[async_std::test]
    async fn mounting_fresh_media_yields_an_empty_store() {
        let storage = create_storage();

        storage.mount().await.unwrap();
        assert_eq!(storage.state(), State::Ready);

        let mut buf = [0xAA; 8];
        assert_eq!(storage.read(1, &mut buf).await.unwrap(), 0);
        assert_eq!(buf, [0; 8]);
    }

    #[async_std::test]
    async fn terminator_id_is_rejected() {
        let storage = create_storage();
        storage.clear().await.unwrap();

        assert_eq!(storage.write(0xFFFF, b"x").await, Err(Error::InvalidId));
        assert_eq!(storage.read(0xFFFF, &mut []).await, Err(Error::InvalidId));
    }

    #[async_std::test]
    async fn oversized_writes_are_rejected() {
        let storage = create_storage();
        storage.clear().await.unwrap();

        let max = GEO.max_data_size();
        let data = vec![0x5A; max + 1];

        assert_eq!(storage.write(1, &data[..max]).await.unwrap(), max);
        assert_eq!(
            storage.write(1, &data).await,
            Err(Error::WriteSizeExceeded)
        );
    }

    #[async_std::test]
    async fn filling_the_ring_reports_out_of_memory() {
        let geo = Geometry {
            block_size: 4,
            page_size: 32,
            sector_size: 128,
            sector_count: 2,
        };
        let storage: Storage<RamDevice<256>, 32> =
            Storage::new(Memory::new(RamDevice::new(), PROFILE), geo);
        storage.clear().await.unwrap();

        let value = vec![1; geo.max_data_size()];
        storage.write(1, &value).await.unwrap();
        assert_eq!(storage.write(2, &value).await, Err(Error::OutOfMemory));

        // the store stays usable and the first value stays readable
        assert_eq!(storage.state(), State::Ready);
        let mut buf = vec![0; value.len()];
        assert_eq!(storage.read(1, &mut buf).await.unwrap(), value.len());
        assert_eq!(buf, value);
    }

    #[async_std::test]
    async fn mount_replays_an_interrupted_collection() {
        let storage = create_storage();
        storage.clear().await.unwrap();

        storage.write(1, b"first value").await.unwrap();
        storage.write(2, b"second value").await.unwrap();
        storage.write(1, b"newer").await.unwrap();

        // seal the head as if power was lost right before the collection
        // that normally follows
        {
            let mut inner = storage.inner.lock().await;
            let Inner {
                memory, geo, head, ..
            } = &mut *inner;
            SectorOps::new(memory, geo).close(head).await.unwrap();
        }

        let storage = remount(storage);
        storage.mount().await.unwrap();

        let mut buf = [0; 16];
        assert_eq!(storage.read(1, &mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"newer");
        assert_eq!(storage.read(2, &mut buf).await.unwrap(), 12);
        assert_eq!(&buf[..12], b"second value");
    }

    #[async_std::test]
    async fn mount_discards_a_partial_collection_image() {
        let storage = create_storage();
        storage.clear().await.unwrap();

        storage.write(7, b"durable").await.unwrap();

        // seal the head, then fake a half-copied image in the next sector
        {
            let mut inner = storage.inner.lock().await;
            let Inner {
                memory, geo, head, ..
            } = &mut *inner;
            SectorOps::new(memory, geo).close(head).await.unwrap();

            let next_base = geo.sector_base(head.sector);
            memory.payload_mut()[..4].copy_from_slice(&[0x12, 0x34, 0x56, 0x78]);
            memory.write(next_base + geo.sector_size - 4, 4).await.unwrap();
        }

        let storage = remount(storage);
        storage.mount().await.unwrap();

        let mut buf = [0; 8];
        assert_eq!(storage.read(7, &mut buf).await.unwrap(), 7);
        assert_eq!(&buf[..7], b"durable");
    }

    #[async_std::test]
    async fn size_reports_without_reading() {
        let storage = create_storage();
        storage.clear().await.unwrap();

        storage.write(3, &[9; 40]).await.unwrap();
        assert_eq!(storage.size(3).await.unwrap(), 40);
        assert_eq!(storage.size(4).await.unwrap(), 0);
    }

    #[async_std::test]
    async fn erase_hides_an_id_and_survives_collection() {
        let storage = create_storage();
        storage.clear().await.unwrap();

        storage.write(1, &[1; 60]).await.unwrap();
        storage.erase(1).await.unwrap();
        assert_eq!(storage.read(1, &mut [0; 4]).await.unwrap(), 0);

        // push enough data through to cycle every sector
        for round in 0..20u8 {
            storage.write(2, &[round; 60]).await.unwrap();
        }
        assert_eq!(storage.read(1, &mut [0; 4]).await.unwrap(), 0);

        let mut buf = [0; 60];
        assert_eq!(storage.read(2, &mut buf).await.unwrap(), 60);
        assert_eq!(buf, [19; 60]);
    }
}
