//! Serial byte transport: owns the tty and its line discipline.

use std::io;
use std::thread;
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use snafu::ResultExt;

use crate::{Result, TtyAttrSnafu, TtyOpenSnafu};

/// Serial line configuration for [`open`](crate::Sdi12Recorder::open).
#[derive(Debug, Clone)]
pub struct PortSettings {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    /// Timeout for a single read; a read seeing no byte within it yields
    /// zero bytes.
    pub read_timeout: Duration,
}

impl PortSettings {
    /// The standard SDI-12 line settings: 1200 baud, 7E1, 50 ms read
    /// timeout.
    pub fn sdi12() -> Self {
        PortSettings {
            baud_rate: 1200,
            data_bits: DataBits::Seven,
            parity: Parity::Even,
            read_timeout: Duration::from_millis(50),
        }
    }
}

impl Default for PortSettings {
    fn default() -> Self {
        Self::sdi12()
    }
}

/// One end of the half-duplex bus, as consumed by the protocol engine.
///
/// Read semantics follow the termios contract of the original driver: a
/// read that sees no byte within the configured timeout returns `Ok(0)`,
/// not an error.
pub trait BusPort: Send {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Hold the line at spacing for `duration`.
    fn send_break(&mut self, duration: Duration) -> io::Result<()>;
    fn read_timeout(&self) -> Duration;
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;
    /// Discard unread input bytes.
    fn flush_input(&mut self) -> io::Result<()>;
    /// A second handle to the same line, for the direct passthrough thread.
    fn try_clone_port(&self) -> io::Result<Box<dyn BusPort>>;
}

pub(crate) fn write_full(port: &mut (impl BusPort + ?Sized), mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match port.write(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// [`BusPort`] over a [`serialport`] device.
///
/// The UART break generation relies on the driver's `set_break`; platforms
/// whose UART cannot hold the line low long enough should provide their own
/// [`BusPort`] implementation (GPIO bit-banging, RS-485 DE control) and hand
/// it to [`attach`](crate::Sdi12Recorder::attach).
pub struct UartPort {
    port: Box<dyn SerialPort>,
}

impl UartPort {
    /// Open `path` and apply `settings`. A partially configured port is
    /// released on failure.
    pub fn open(path: &str, settings: &PortSettings) -> Result<Self> {
        let mut port = serialport::new(path, settings.baud_rate)
            .open()
            .context(TtyOpenSnafu)?;
        port.set_data_bits(settings.data_bits).context(TtyAttrSnafu)?;
        port.set_parity(settings.parity).context(TtyAttrSnafu)?;
        port.set_stop_bits(StopBits::One).context(TtyAttrSnafu)?;
        port.set_timeout(settings.read_timeout)
            .context(TtyAttrSnafu)?;
        Ok(UartPort { port })
    }
}

fn to_io(e: serialport::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

impl BusPort for UartPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn send_break(&mut self, duration: Duration) -> io::Result<()> {
        self.port.set_break().map_err(to_io)?;
        thread::sleep(duration);
        self.port.clear_break().map_err(to_io)
    }

    fn read_timeout(&self) -> Duration {
        self.port.timeout()
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(to_io)
    }

    fn flush_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(to_io)
    }

    fn try_clone_port(&self) -> io::Result<Box<dyn BusPort>> {
        let port = self.port.try_clone().map_err(to_io)?;
        Ok(Box::new(UartPort { port }))
    }
}
