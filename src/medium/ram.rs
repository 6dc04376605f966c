use crate::medium::{native_address, BusDevice};
use crate::Error;

/// Byte-addressable memory backed by an array, with overwrite semantics.
///
/// Stands in for FeRAM, EEPROM or a file during tests; such parts have no
/// erase operation, so the store is configured RAM-like on top of it and
/// fills with 0xFF instead.
#[derive(Clone)]
pub struct RamDevice<const SIZE: usize> {
    data: [u8; SIZE],
}

impl<const SIZE: usize> RamDevice<SIZE> {
    pub fn new() -> Self {
        Self { data: [0xFF; SIZE] }
    }

    pub fn from_image(data: [u8; SIZE]) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn span(&self, header: &[u8], len: usize) -> Result<Option<usize>, Error> {
        let address = native_address(header)?;
        // past-the-end transfers complete short, the engine turns that fatal
        Ok((address + len <= SIZE).then_some(address))
    }
}

impl<const SIZE: usize> Default for RamDevice<SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const SIZE: usize> BusDevice for RamDevice<SIZE> {
    async fn read(&mut self, header: &[u8], data: &mut [u8]) -> Result<usize, Error> {
        let Some(address) = self.span(header, data.len())? else {
            return Ok(0);
        };

        data.copy_from_slice(&self.data[address..address + data.len()]);
        Ok(data.len())
    }

    async fn write(&mut self, header: &[u8], data: &[u8]) -> Result<usize, Error> {
        let Some(address) = self.span(header, data.len())? else {
            return Ok(0);
        };

        self.data[address..address + data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    async fn erase(&mut self, _header: &[u8]) -> Result<(), Error> {
        // no page erase on RAM-like parts
        Err(Error::Fatal)
    }
}
