use crate::medium::{native_address, BusDevice};
use crate::Error;

/// NOR-flash-like memory backed by an array: writes can only clear bits,
/// erasing flips a whole `PAGE`-sized page back to 0xFF.
#[derive(Clone)]
pub struct FlashDevice<const SIZE: usize, const PAGE: usize> {
    data: [u8; SIZE],
}

impl<const SIZE: usize, const PAGE: usize> FlashDevice<SIZE, PAGE> {
    pub fn new() -> Self {
        Self { data: [0xFF; SIZE] }
    }

    pub fn from_image(data: [u8; SIZE]) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl<const SIZE: usize, const PAGE: usize> Default for FlashDevice<SIZE, PAGE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const SIZE: usize, const PAGE: usize> BusDevice for FlashDevice<SIZE, PAGE> {
    async fn read(&mut self, header: &[u8], data: &mut [u8]) -> Result<usize, Error> {
        let address = native_address(header)?;
        if address + data.len() > SIZE {
            return Ok(0);
        }

        data.copy_from_slice(&self.data[address..address + data.len()]);
        Ok(data.len())
    }

    async fn write(&mut self, header: &[u8], data: &[u8]) -> Result<usize, Error> {
        let address = native_address(header)?;
        if address + data.len() > SIZE {
            return Ok(0);
        }

        for (cell, byte) in self.data[address..].iter_mut().zip(data) {
            *cell &= byte;
        }
        Ok(data.len())
    }

    async fn erase(&mut self, header: &[u8]) -> Result<(), Error> {
        let address = native_address(header)?;
        if address % PAGE != 0 || address + PAGE > SIZE {
            return Err(Error::Fatal);
        }

        self.data[address..address + PAGE].fill(0xFF);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(address: u32) -> [u8; 4] {
        address.to_le_bytes()
    }

    #[async_std::test]
    async fn writes_only_clear_bits() {
        let mut device = FlashDevice::<64, 16>::new();

        device.write(&header(0), &[0xF0]).await.unwrap();
        device.write(&header(0), &[0x0F]).await.unwrap();

        let mut buf = [0xFF; 1];
        device.read(&header(0), &mut buf).await.unwrap();
        assert_eq!(buf, [0x00]);
    }

    #[async_std::test]
    async fn erase_restores_a_full_page() {
        let mut device = FlashDevice::<64, 16>::new();

        device.write(&header(0), &[0; 20]).await.unwrap();
        device.erase(&header(0)).await.unwrap();

        let mut buf = [0; 20];
        device.read(&header(0), &mut buf).await.unwrap();
        assert_eq!(&buf[..16], &[0xFF; 16]);
        assert_eq!(&buf[16..], &[0; 4]);
    }

    #[async_std::test]
    async fn unaligned_erase_is_rejected() {
        let mut device = FlashDevice::<64, 16>::new();
        assert_eq!(device.erase(&header(8)).await, Err(Error::Fatal));
    }
}
