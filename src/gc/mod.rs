//! Copy-forward collection of the oldest sector in the ring.

use log::trace;

use crate::ll::entry::{Entry, Payload};
use crate::ll::sector::{Head, SectorOps};
use crate::medium::{BusDevice, Memory};
use crate::{Error, Geometry};

pub(crate) struct Gc<'a, B, const BUF_SIZE: usize> {
    memory: &'a mut Memory<B, BUF_SIZE>,
    geo: &'a Geometry,
    head: &'a mut Head,
}

impl<'a, B: BusDevice, const BUF_SIZE: usize> Gc<'a, B, BUF_SIZE> {
    pub fn new(
        memory: &'a mut Memory<B, BUF_SIZE>,
        geo: &'a Geometry,
        head: &'a mut Head,
    ) -> Self {
        Self { memory, geo, head }
    }

    /// Folds the tail sector — the one after the freshly opened head in ring
    /// order — into the head: every live entry is re-appended, then the tail
    /// is erased. This is the only transition from CLOSED back to EMPTY.
    ///
    /// Safe to replay after a crash: entries copied before the interruption
    /// show up twice, and the newer copy wins on lookup.
    pub async fn run(&mut self, empty_sector: usize) -> Result<(), Error> {
        let geo = self.geo;
        let tail = geo.next_sector(empty_sector);
        let tail_base = geo.sector_base(tail);
        let entry_size = geo.entry_size();

        trace!("gc: folding sector {} into {}", tail, empty_sector);

        let mut ops = SectorOps::new(self.memory, geo);
        let last = ops.last_entry_offset(tail_base).await?;

        let mut entry_offset = entry_size;
        let mut data_bound = geo.sector_size;
        while entry_offset <= last {
            let entry = ops.read_entry(tail_base + entry_offset).await?;
            if ops.entry_valid(&entry, entry_offset, data_bound) {
                let data_offset = match entry.payload() {
                    Payload::Long { offset, .. } => {
                        data_bound = (offset as usize) << geo.offset_shift();
                        data_bound
                    }
                    Payload::Small { .. } => 0,
                };

                let newer =
                    shadowed(&mut ops, tail, entry_offset + entry_size, data_bound, &entry)
                        .await?;
                if !newer {
                    match entry.payload() {
                        Payload::Long { size, .. } if size > 0 => {
                            copy_blob(
                                &mut ops,
                                self.head,
                                tail_base + data_offset,
                                size as usize,
                            )
                            .await?;
                            ops.write_long_entry(self.head, entry.id(), size as usize)
                                .await?;
                        }
                        Payload::Small { data, len } if len > 0 => {
                            ops.write_small_entry(self.head, entry.id(), &data[..len as usize])
                                .await?;
                        }
                        // size 0 is an erased element, dropped here
                        _ => {}
                    }
                }
            }
            entry_offset += entry_size;
        }

        ops.erase(tail).await
    }
}

/// Looks for a newer valid entry with the same id: first in the remainder of
/// the tail, then forward around the ring. The head is never searched — it
/// holds only what this (or an interrupted) collection already copied.
async fn shadowed<B: BusDevice, const BUF_SIZE: usize>(
    ops: &mut SectorOps<'_, B, BUF_SIZE>,
    tail: usize,
    start_offset: usize,
    start_bound: usize,
    entry: &Entry,
) -> Result<bool, Error> {
    let geo = ops.geo;
    let entry_size = geo.entry_size();

    let mut sector = tail;
    let mut entry_offset = start_offset;
    let mut data_bound = start_bound;

    for _ in 0..geo.sector_count - 1 {
        let base = geo.sector_base(sector);
        let last = ops.last_entry_offset(base).await?;

        while entry_offset <= last {
            let candidate = ops.read_entry(base + entry_offset).await?;
            if ops.entry_valid(&candidate, entry_offset, data_bound) {
                if candidate.id() == entry.id() {
                    return Ok(true);
                }
                if let Payload::Long { offset, .. } = candidate.payload() {
                    data_bound = (offset as usize) << geo.offset_shift();
                }
            }
            entry_offset += entry_size;
        }

        sector = geo.next_sector(sector);
        entry_offset = entry_size;
        data_bound = geo.sector_size;
    }

    Ok(false)
}

/// Streams a blob from the tail into the head's data region, reserving the
/// space first. The table entry referencing the new location is written by
/// the caller afterwards, so a crash mid-copy leaves only dead bytes.
async fn copy_blob<B: BusDevice, const BUF_SIZE: usize>(
    ops: &mut SectorOps<'_, B, BUF_SIZE>,
    head: &mut Head,
    src: usize,
    size: usize,
) -> Result<(), Error> {
    let geo = ops.geo;
    head.data_write -= geo.align_data(size);

    let chunk = ops.chunk_size();
    let mut src = src;
    let mut dst = head.base(geo) + head.data_write;
    let mut remaining = size;
    while remaining > 0 {
        let span = chunk.min(remaining);
        ops.memory.read(src, span).await?;
        // the transfer buffer still holds the chunk just read
        ops.memory.write(dst, span).await?;
        src += span;
        dst += span;
        remaining -= span;
    }

    Ok(())
}
