//! Transfer accounting for tests and wear diagnostics.

use crate::medium::BusDevice;
use crate::Error;

/// Wraps a bus device and counts the transfers going through it.
pub struct Counters<B> {
    device: B,
    pub read_count: usize,
    pub write_count: usize,
    pub erase_count: usize,
    pub written_bytes: usize,
}

impl<B> Counters<B> {
    pub fn new(device: B) -> Self {
        Self {
            device,
            read_count: 0,
            write_count: 0,
            erase_count: 0,
            written_bytes: 0,
        }
    }

    pub fn into_inner(self) -> B {
        self.device
    }
}

impl<B: BusDevice> BusDevice for Counters<B> {
    async fn read(&mut self, header: &[u8], data: &mut [u8]) -> Result<usize, Error> {
        self.read_count = self.read_count.saturating_add(1);
        self.device.read(header, data).await
    }

    async fn write(&mut self, header: &[u8], data: &[u8]) -> Result<usize, Error> {
        self.write_count = self.write_count.saturating_add(1);
        self.written_bytes = self.written_bytes.saturating_add(data.len());
        self.device.write(header, data).await
    }

    async fn erase(&mut self, header: &[u8]) -> Result<(), Error> {
        self.erase_count = self.erase_count.saturating_add(1);
        self.device.erase(header).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::ram::RamDevice;

    #[async_std::test]
    async fn counts_transfers() {
        let mut counters = Counters::new(RamDevice::<64>::new());
        let header = 0u32.to_le_bytes();

        counters.write(&header, &[1, 2, 3]).await.unwrap();
        let mut buf = [0; 3];
        counters.read(&header, &mut buf).await.unwrap();

        assert_eq!(counters.write_count, 1);
        assert_eq!(counters.written_bytes, 3);
        assert_eq!(counters.read_count, 1);
        assert_eq!(counters.erase_count, 0);
    }
}
