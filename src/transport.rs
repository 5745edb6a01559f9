use embedded_hal::spi::SpiDevice;

use crate::{ProtocolError, ProtocolResult};

/// The byte channel to the NWP.
///
/// Both calls are blocking and must transfer exactly `buf.len()` bytes. The implementation is
/// expected to own the bus for the duration of a single call, which includes asserting and
/// releasing chip select.
pub trait Transport {
    type Error;

    /// Clock in `buf.len()` bytes from the NWP.
    fn read(&mut self, buf: &mut [u8]) -> Result<(), Self::Error>;
    /// Clock out `buf` to the NWP.
    fn write(&mut self, buf: &[u8]) -> Result<(), Self::Error>;
}
impl<T: Transport + ?Sized> Transport for &mut T {
    type Error = T::Error;
    fn read(&mut self, buf: &mut [u8]) -> Result<(), Self::Error> {
        T::read(self, buf)
    }
    fn write(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        T::write(self, buf)
    }
}

/// The interrupt line, through which the NWP signals that a response is ready.
///
/// Binding the actual handler is left to the board, its vector only has to call
/// [ProtocolEngine::on_nwp_irq](crate::ProtocolEngine::on_nwp_irq).
pub trait InterruptSource {
    /// Unmask the interrupt.
    fn enable(&mut self);
    /// Mask the interrupt.
    fn disable(&mut self);
    /// Clear a latched interrupt.
    fn clear(&mut self);
}

/// A [Transport] on top of an [embedded_hal] SPI device.
pub struct SpiTransport<D> {
    device: D,
}
impl<D: SpiDevice> SpiTransport<D> {
    pub const fn new(device: D) -> Self {
        Self { device }
    }
    /// Returns the SPI device.
    pub fn into_inner(self) -> D {
        self.device
    }
}
impl<D: SpiDevice> Transport for SpiTransport<D> {
    type Error = D::Error;
    fn read(&mut self, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.device.read(buf)
    }
    fn write(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        self.device.write(buf)
    }
}

pub(crate) fn read_bytes<T: Transport>(transport: &mut T, buf: &mut [u8]) -> ProtocolResult<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let len = buf.len();
    transport.read(buf).map_err(|_| {
        error!("Transport read of {} bytes failed.", len);
        ProtocolError::Transport
    })
}
pub(crate) fn write_bytes<T: Transport>(transport: &mut T, buf: &[u8]) -> ProtocolResult<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let len = buf.len();
    transport.write(buf).map_err(|_| {
        error!("Transport write of {} bytes failed.", len);
        ProtocolError::Transport
    })
}

#[cfg(test)]
mod tests {
    use core::convert::Infallible;

    use embedded_hal::spi::{ErrorType, Operation};

    use super::*;
    use crate::test_util::ScriptedTransport;

    struct LoopbackDevice {
        written: Vec<u8>,
        fill: u8,
    }
    impl ErrorType for LoopbackDevice {
        type Error = Infallible;
    }
    impl SpiDevice for LoopbackDevice {
        fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), Infallible> {
            for operation in operations {
                match operation {
                    Operation::Read(buf) => buf.fill(self.fill),
                    Operation::Write(buf) => self.written.extend_from_slice(buf),
                    Operation::Transfer(read, write) => {
                        self.written.extend_from_slice(write);
                        read.fill(self.fill);
                    }
                    Operation::TransferInPlace(buf) => {
                        self.written.extend_from_slice(buf);
                        buf.fill(self.fill);
                    }
                    Operation::DelayNs(_) => {}
                }
            }
            Ok(())
        }
    }

    #[test]
    fn spi_transport_forwards_reads_and_writes() {
        let mut transport = SpiTransport::new(LoopbackDevice {
            written: Vec::new(),
            fill: 0x5a,
        });
        let mut buf = [0u8; 3];
        transport.read(&mut buf).unwrap();
        transport.write(&[1, 2, 3, 4]).unwrap();
        assert_eq!(buf, [0x5a; 3]);
        assert_eq!(transport.into_inner().written, [1, 2, 3, 4]);
    }

    #[test]
    fn empty_transfers_never_reach_the_bus() {
        let mut transport = ScriptedTransport::new();
        read_bytes(&mut transport, &mut []).unwrap();
        write_bytes(&mut transport, &[]).unwrap();
        assert_eq!(transport.transfers(), 0);
    }

    #[test]
    fn transport_errors_are_mapped() {
        let mut transport = ScriptedTransport::new();
        let mut buf = [0u8; 4];
        assert_eq!(
            read_bytes(&mut transport, &mut buf),
            Err(ProtocolError::Transport)
        );
    }
}
