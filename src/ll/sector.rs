use log::trace;

use crate::ll::entry::{Entry, Payload, ENTRY_BYTES, TERMINATOR_ID};
use crate::medium::{BusDevice, Memory, MemoryKind};
use crate::{Error, Geometry};

/// State of one sector, derived from its first two table slots.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum SectorState {
    Empty,
    Open,
    Closed,
}

/// Write cursors of the open sector. The allocation table grows upward from
/// `entry_write`, data blobs grow downward from `data_write`; the two must
/// never cross.
#[derive(Clone, Copy, Default)]
pub(crate) struct Head {
    pub sector: usize,
    pub entry_write: usize,
    pub data_write: usize,
}

impl Head {
    pub fn base(&self, geo: &Geometry) -> usize {
        geo.sector_base(self.sector)
    }

    /// Points the cursors at a fresh (erased) sector.
    pub fn reset(&mut self, geo: &Geometry, sector: usize) {
        self.sector = sector;
        self.entry_write = geo.entry_size();
        self.data_write = geo.sector_size;
    }

    fn advance(&mut self, geo: &Geometry) {
        self.reset(geo, geo.next_sector(self.sector));
    }
}

/// Sector-level operations over the memory adapter.
pub(crate) struct SectorOps<'a, B, const BUF_SIZE: usize> {
    pub memory: &'a mut Memory<B, BUF_SIZE>,
    pub geo: &'a Geometry,
}

impl<'a, B: BusDevice, const BUF_SIZE: usize> SectorOps<'a, B, BUF_SIZE> {
    pub fn new(memory: &'a mut Memory<B, BUF_SIZE>, geo: &'a Geometry) -> Self {
        Self { memory, geo }
    }

    /// Largest block-aligned span that fits the transfer buffer.
    pub fn chunk_size(&self) -> usize {
        self.memory.capacity() & !(self.geo.block_size - 1)
    }

    pub async fn read_entry(&mut self, offset: usize) -> Result<Entry, Error> {
        let mut raw = [0; ENTRY_BYTES];
        raw.copy_from_slice(self.memory.read(offset, ENTRY_BYTES).await?);
        Ok(Entry::from_raw(raw))
    }

    pub async fn state(&mut self, sector: usize) -> Result<SectorState, Error> {
        let base = self.geo.sector_base(sector);

        if !self.read_entry(base).await?.is_empty() {
            return Ok(SectorState::Closed);
        }
        if self.read_entry(base + self.geo.entry_size()).await?.is_empty() {
            Ok(SectorState::Empty)
        } else {
            Ok(SectorState::Open)
        }
    }

    /// Checks a table entry read from `entry_offset`. For long entries the
    /// data region must start past this slot and end at or below
    /// `data_bound`, the start of the previously placed blob.
    pub fn entry_valid(&self, entry: &Entry, entry_offset: usize, data_bound: usize) -> bool {
        if !entry.checksum_ok() {
            return false;
        }

        match entry.payload() {
            Payload::Small { .. } => true,
            Payload::Long { size, offset } => {
                let data = (offset as usize) << self.geo.offset_shift();
                data >= entry_offset + self.geo.entry_size()
                    && data + size as usize <= data_bound
            }
        }
    }

    /// Checks the terminator record of a sealed sector.
    pub fn close_entry_valid(&self, entry: &Entry) -> bool {
        if entry.is_empty() || !entry.checksum_ok() || entry.id() != TERMINATOR_ID {
            return false;
        }

        match entry.payload() {
            Payload::Long { size: 0, offset } => {
                let last = (offset as usize) << self.geo.offset_shift();
                last >= self.geo.entry_size() && last < self.geo.sector_size
            }
            _ => false,
        }
    }

    /// Table offset of the newest valid entry in a sealed sector, 0 if the
    /// sector holds none. Trusts the terminator when it is intact, otherwise
    /// sweeps the table.
    pub async fn last_entry_offset(&mut self, sector_base: usize) -> Result<usize, Error> {
        let terminator = self.read_entry(sector_base).await?;
        if self.close_entry_valid(&terminator) {
            if let Payload::Long { offset, .. } = terminator.payload() {
                return Ok((offset as usize) << self.geo.offset_shift());
            }
        }

        let entry_size = self.geo.entry_size();
        let mut entry_offset = entry_size;
        let mut data_bound = self.geo.sector_size;
        let mut newest = 0;

        while entry_offset + ENTRY_BYTES <= data_bound {
            let entry = self.read_entry(sector_base + entry_offset).await?;
            if entry.is_empty() {
                break;
            }
            if self.entry_valid(&entry, entry_offset, data_bound) {
                newest = entry_offset;
                if let Payload::Long { offset, .. } = entry.payload() {
                    data_bound = (offset as usize) << self.geo.offset_shift();
                }
            }
            entry_offset += entry_size;
        }

        Ok(newest)
    }

    /// Recovers the write cursors of an open sector: scans the table for the
    /// first free slot, then sweeps the gap between table and data for a
    /// torn blob write. If any byte in the gap is programmed, the data
    /// cursor drops to the first such byte, down-aligned to the block size,
    /// turning the remnant into dead space.
    pub async fn detect_offsets(&mut self, sector: usize) -> Result<(usize, usize), Error> {
        let base = self.geo.sector_base(sector);
        let entry_size = self.geo.entry_size();
        let mut entry_offset = entry_size;
        let mut data_offset = self.geo.sector_size;

        while entry_offset + ENTRY_BYTES <= data_offset {
            let entry = self.read_entry(base + entry_offset).await?;
            if entry.is_empty() {
                break;
            }
            if self.entry_valid(&entry, entry_offset, data_offset) {
                if let Payload::Long { offset, .. } = entry.payload() {
                    data_offset = (offset as usize) << self.geo.offset_shift();
                }
            }
            entry_offset += entry_size;
        }

        let chunk = self.chunk_size();
        let block_mask = !(self.geo.block_size - 1);
        let mut checked = entry_offset;
        'sweep: while checked < data_offset {
            let span = chunk.min(data_offset - checked);
            let bytes = self.memory.read(base + checked, span).await?;
            for (i, byte) in bytes.iter().enumerate() {
                if *byte != 0xFF {
                    data_offset = (checked + i) & block_mask;
                    break 'sweep;
                }
            }
            checked += span;
        }

        Ok((entry_offset, data_offset))
    }

    /// Erases one sector: page erase on flash-like memory, an explicit 0xFF
    /// fill on RAM-like memory.
    pub async fn erase(&mut self, sector: usize) -> Result<(), Error> {
        trace!("erasing sector {}", sector);
        let base = self.geo.sector_base(sector);

        match self.memory.kind() {
            MemoryKind::Ram => {
                let chunk = self.chunk_size();
                let mut offset = base;
                let mut remaining = self.geo.sector_size;
                while remaining > 0 {
                    let span = chunk.min(remaining);
                    self.memory.fill(0xFF);
                    self.memory.write(offset, span).await?;
                    offset += span;
                    remaining -= span;
                }
            }
            MemoryKind::Flash => {
                for page in (0..self.geo.sector_size).step_by(self.geo.page_size) {
                    self.memory.erase_page(base + page).await?;
                }
            }
        }

        Ok(())
    }

    async fn write_record(&mut self, offset: usize, entry: Entry) -> Result<(), Error> {
        self.memory.payload_mut()[..ENTRY_BYTES].copy_from_slice(entry.as_bytes());
        self.memory.write(offset, ENTRY_BYTES).await
    }

    /// Appends a small entry, payload inlined, and advances the table cursor.
    pub async fn write_small_entry(
        &mut self,
        head: &mut Head,
        id: u16,
        data: &[u8],
    ) -> Result<(), Error> {
        let offset = head.base(self.geo) + head.entry_write;
        head.entry_write += self.geo.entry_size();
        self.write_record(offset, Entry::small(id, data)).await
    }

    /// Appends a long entry referencing the blob at the data cursor. The
    /// blob itself must already be on media; the record is what makes it
    /// reachable.
    pub async fn write_long_entry(
        &mut self,
        head: &mut Head,
        id: u16,
        size: usize,
    ) -> Result<(), Error> {
        let offset = head.base(self.geo) + head.entry_write;
        head.entry_write += self.geo.entry_size();

        let shifted = (head.data_write >> self.geo.offset_shift()) as u16;
        self.write_record(offset, Entry::long(id, size as u16, shifted))
            .await
    }

    /// Seals the current sector with a terminator recording the newest entry
    /// position, then points the head at the next sector in the ring.
    pub async fn close(&mut self, head: &mut Head) -> Result<(), Error> {
        let last = head.entry_write - self.geo.entry_size();
        let entry = Entry::terminator((last >> self.geo.offset_shift()) as u16);
        let offset = head.base(self.geo);

        head.advance(self.geo);
        self.write_record(offset, entry).await
    }
}
