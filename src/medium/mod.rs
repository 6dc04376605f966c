//! The memory-driver contract and the adapter that frames engine offsets
//! into the wire shapes the drivers understand.

pub mod flash;
pub mod ram;

use crate::Error;

/// Transfer opcode, used as the index into a serial memory's command table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Op {
    Read = 0,
    Write = 1,
    Erase = 2,
}

/// How the memory forgets: RAM-like parts (FeRAM, EEPROM, files) are
/// overwritten with 0xFF explicitly, flash-like parts erase whole pages.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MemoryKind {
    Ram,
    Flash,
}

/// Address header layout expected by the driver.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Framing {
    /// A single 32-bit little-endian absolute address.
    Native4,
    /// One opcode byte followed by a 16-bit big-endian address, for serial
    /// parts. The opcodes are indexed by [`Op`].
    Command1Addr2 { opcodes: [u8; 3] },
}

/// Where and how the store lives inside the device.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MemoryProfile {
    /// Device address of the store's first sector.
    pub address: u32,
    pub kind: MemoryKind,
    pub framing: Framing,
}

/// A raw byte device consuming framed transfers.
///
/// `header` carries the already-framed address (and opcode, for serial
/// parts). Transfers may complete short; the returned count is what actually
/// moved, and the engine treats anything short as fatal.
pub trait BusDevice {
    async fn read(&mut self, header: &[u8], data: &mut [u8]) -> Result<usize, Error>;
    async fn write(&mut self, header: &[u8], data: &[u8]) -> Result<usize, Error>;
    async fn erase(&mut self, header: &[u8]) -> Result<(), Error>;
}

/// The adapter between the engine and a [`BusDevice`].
///
/// Owns the one transfer buffer every byte of data moves through, applies the
/// base address, and frames `(offset, op)` for the device. `BUF_SIZE` is the
/// payload capacity; the engine chunks streams to it.
pub struct Memory<B, const BUF_SIZE: usize> {
    bus: B,
    profile: MemoryProfile,
    header: [u8; 4],
    header_len: usize,
    buffer: [u8; BUF_SIZE],
}

impl<B: BusDevice, const BUF_SIZE: usize> Memory<B, BUF_SIZE> {
    pub fn new(bus: B, profile: MemoryProfile) -> Self {
        Self {
            bus,
            profile,
            header: [0; 4],
            header_len: 0,
            buffer: [0; BUF_SIZE],
        }
    }

    pub const fn capacity(&self) -> usize {
        BUF_SIZE
    }

    pub fn kind(&self) -> MemoryKind {
        self.profile.kind
    }

    /// The transfer buffer, for staging an outgoing payload.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn fill(&mut self, byte: u8) {
        self.buffer.fill(byte);
    }

    pub fn into_inner(self) -> B {
        self.bus
    }

    fn frame(&mut self, op: Op, offset: usize) {
        let address = self.profile.address + offset as u32;
        match self.profile.framing {
            Framing::Native4 => {
                self.header = address.to_le_bytes();
                self.header_len = 4;
            }
            Framing::Command1Addr2 { opcodes } => {
                self.header[0] = opcodes[op as usize];
                self.header[1] = (address >> 8) as u8;
                self.header[2] = address as u8;
                self.header_len = 3;
            }
        }
    }

    /// Reads `len` bytes at the store-relative `offset` into the transfer
    /// buffer and returns them. A short transfer is fatal.
    pub async fn read(&mut self, offset: usize, len: usize) -> Result<&[u8], Error> {
        debug_assert!(len <= BUF_SIZE);

        self.frame(Op::Read, offset);
        let transferred = self
            .bus
            .read(&self.header[..self.header_len], &mut self.buffer[..len])
            .await?;
        if transferred < len {
            return Err(Error::Fatal);
        }

        Ok(&self.buffer[..len])
    }

    /// Writes the first `len` bytes of the transfer buffer to the
    /// store-relative `offset`. A short transfer is fatal.
    pub async fn write(&mut self, offset: usize, len: usize) -> Result<(), Error> {
        debug_assert!(len <= BUF_SIZE);

        self.frame(Op::Write, offset);
        let transferred = self
            .bus
            .write(&self.header[..self.header_len], &self.buffer[..len])
            .await?;
        if transferred < len {
            return Err(Error::Fatal);
        }

        Ok(())
    }

    /// Erases the page starting at the store-relative `offset`. Only issued
    /// for flash-like memories.
    pub async fn erase_page(&mut self, offset: usize) -> Result<(), Error> {
        self.frame(Op::Erase, offset);
        self.bus.erase(&self.header[..self.header_len]).await
    }
}

pub(crate) fn native_address(header: &[u8]) -> Result<usize, Error> {
    match header {
        [a, b, c, d] => Ok(u32::from_le_bytes([*a, *b, *c, *d]) as usize),
        _ => Err(Error::Fatal),
    }
}

/// Decodes the 1-command/2-address framing in front of a natively addressed
/// device, checking the opcode against the expected table. Lets the tests
/// run the serial wire shape against the simulated mediums.
pub struct SerialBridge<D> {
    device: D,
    opcodes: [u8; 3],
}

impl<D: BusDevice> SerialBridge<D> {
    pub fn new(device: D, opcodes: [u8; 3]) -> Self {
        Self { device, opcodes }
    }

    pub fn into_inner(self) -> D {
        self.device
    }

    fn reframe(&self, header: &[u8], op: Op) -> Result<[u8; 4], Error> {
        match header {
            [cmd, hi, lo] if *cmd == self.opcodes[op as usize] => {
                Ok((u32::from(*hi) << 8 | u32::from(*lo)).to_le_bytes())
            }
            _ => Err(Error::Fatal),
        }
    }
}

impl<D: BusDevice> BusDevice for SerialBridge<D> {
    async fn read(&mut self, header: &[u8], data: &mut [u8]) -> Result<usize, Error> {
        let native = self.reframe(header, Op::Read)?;
        self.device.read(&native, data).await
    }

    async fn write(&mut self, header: &[u8], data: &[u8]) -> Result<usize, Error> {
        let native = self.reframe(header, Op::Write)?;
        self.device.write(&native, data).await
    }

    async fn erase(&mut self, header: &[u8]) -> Result<(), Error> {
        let native = self.reframe(header, Op::Erase)?;
        self.device.erase(&native).await
    }
}

#[cfg(test)]
mod tests {
    use super::ram::RamDevice;
    use super::*;

    const RAM: MemoryProfile = MemoryProfile {
        address: 0,
        kind: MemoryKind::Ram,
        framing: Framing::Native4,
    };

    struct HeaderProbe {
        seen: Option<([u8; 4], usize)>,
    }

    impl BusDevice for HeaderProbe {
        async fn read(&mut self, header: &[u8], data: &mut [u8]) -> Result<usize, Error> {
            self.capture(header);
            Ok(data.len())
        }

        async fn write(&mut self, header: &[u8], data: &[u8]) -> Result<usize, Error> {
            self.capture(header);
            Ok(data.len())
        }

        async fn erase(&mut self, header: &[u8]) -> Result<(), Error> {
            self.capture(header);
            Ok(())
        }
    }

    impl HeaderProbe {
        fn capture(&mut self, header: &[u8]) {
            let mut bytes = [0; 4];
            bytes[..header.len()].copy_from_slice(header);
            self.seen = Some((bytes, header.len()));
        }
    }

    #[async_std::test]
    async fn native_framing_is_little_endian_and_base_offset() {
        let profile = MemoryProfile {
            address: 0x1_0000,
            ..RAM
        };
        let mut memory = Memory::<_, 16>::new(HeaderProbe { seen: None }, profile);

        memory.read(0x0234, 8).await.unwrap();

        let (header, len) = memory.bus.seen.unwrap();
        assert_eq!(len, 4);
        assert_eq!(header, [0x34, 0x02, 0x01, 0x00]);
    }

    #[async_std::test]
    async fn serial_framing_carries_opcode_and_big_endian_address() {
        let profile = MemoryProfile {
            framing: Framing::Command1Addr2 {
                opcodes: [0x03, 0x02, 0x20],
            },
            ..RAM
        };
        let mut memory = Memory::<_, 16>::new(HeaderProbe { seen: None }, profile);

        memory.payload_mut()[..4].copy_from_slice(b"data");
        memory.write(0x1234, 4).await.unwrap();

        let (header, len) = memory.bus.seen.unwrap();
        assert_eq!(len, 3);
        assert_eq!(&header[..3], &[0x02, 0x12, 0x34]);
    }

    #[async_std::test]
    async fn short_transfer_is_fatal() {
        struct Short;

        impl BusDevice for Short {
            async fn read(&mut self, _: &[u8], data: &mut [u8]) -> Result<usize, Error> {
                Ok(data.len().saturating_sub(1))
            }

            async fn write(&mut self, _: &[u8], data: &[u8]) -> Result<usize, Error> {
                Ok(data.len().saturating_sub(1))
            }

            async fn erase(&mut self, _: &[u8]) -> Result<(), Error> {
                Ok(())
            }
        }

        let mut memory = Memory::<_, 16>::new(Short, RAM);
        assert_eq!(memory.read(0, 8).await, Err(Error::Fatal));
        assert_eq!(memory.write(0, 8).await, Err(Error::Fatal));
    }

    #[async_std::test]
    async fn serial_bridge_round_trips_through_ram() {
        const OPCODES: [u8; 3] = [0x03, 0x02, 0x20];

        let bridge = SerialBridge::new(RamDevice::<256>::new(), OPCODES);
        let profile = MemoryProfile {
            framing: Framing::Command1Addr2 { opcodes: OPCODES },
            ..RAM
        };
        let mut memory = Memory::<_, 16>::new(bridge, profile);

        memory.payload_mut()[..5].copy_from_slice(b"hello");
        memory.write(0x40, 5).await.unwrap();
        assert_eq!(memory.read(0x40, 5).await.unwrap(), b"hello");
    }

    #[async_std::test]
    async fn serial_bridge_rejects_unknown_opcode() {
        let mut bridge = SerialBridge::new(RamDevice::<256>::new(), [0x03, 0x02, 0x20]);
        let mut buf = [0; 4];

        assert_eq!(bridge.read(&[0x55, 0, 0], &mut buf).await, Err(Error::Fatal));
    }
}
