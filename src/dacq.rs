//! The generic data-acquisition contract sensor protocol engines implement.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, SystemTime};

use crate::transport::PortSettings;
use crate::types::{Acquisition, Address, Version};
use crate::{Error, Result};

/// A client stream wired to the sensor port by [`Dacq::direct`]. The
/// receive direction runs on its own thread, so the stream must be
/// cloneable, and reads must give up periodically so the passthrough can
/// notice the idle timeout.
pub trait DirectStream: Read + Write + Send {
    fn try_clone_stream(&self) -> io::Result<Box<dyn DirectStream>>;
    fn set_stream_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

impl DirectStream for TcpStream {
    fn try_clone_stream(&self) -> io::Result<Box<dyn DirectStream>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn set_stream_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }
}

/// Uniform acquisition entry points, so clients can drive different sensor
/// protocols through one interface.
///
/// Capabilities a protocol does not have keep the default implementations,
/// which refuse with the matching error; SDI-12 leaves the acquisition
/// interval and the sensor date unsupported.
pub trait Dacq {
    /// Open the serial device the engine was created for.
    fn open(&self, settings: &PortSettings) -> Result<()>;

    fn close(&self);

    /// Whether a transaction currently holds the bus.
    fn is_busy(&self) -> bool;

    fn version(&self) -> Version;

    /// Read the sensor identification into `out`, returning its length.
    fn get_info(&self, address: Address, out: &mut [u8]) -> Result<usize>;

    /// Re-address a sensor.
    fn change_id(&self, address: Address, new_address: Address) -> Result<()>;

    /// Run one acquisition described by the handle.
    fn retrieve(&self, acq: &mut Acquisition) -> Result<()>;

    /// Send a raw command and hand back the raw response.
    fn transparent(&self, command: &[u8], out: &mut [u8]) -> Result<usize>;

    /// Wire `client` to the sensor port in both directions until the client
    /// sends `Ctrl-X` or stays idle for `idle_timeout`.
    fn direct(&self, client: &mut dyn DirectStream, idle_timeout: Duration) -> Result<()>;

    fn set_acq_interval(&self, _interval: Duration) -> Result<()> {
        Err(Error::SetAcqIntervalFailed)
    }

    fn get_acq_interval(&self) -> Result<Duration> {
        Err(Error::SetAcqIntervalFailed)
    }

    fn set_date(&self, _date: SystemTime) -> Result<()> {
        Err(Error::SetTimeError)
    }

    fn get_date(&self) -> Option<SystemTime> {
        None
    }

    /// Request cancellation of the acquisition in flight. Returns whether
    /// the protocol supports aborting.
    fn abort(&self) -> bool {
        false
    }
}
