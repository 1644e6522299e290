//! Master-side driver for the SDI-12 v1.3 sensor protocol.
//!
//! SDI-12 is a 1200 baud, 7E1, half-duplex serial protocol used by
//! environmental sensors. This crate implements the data-recorder (master)
//! role: it owns the serial line, generates the break/marking framing the
//! standard requires, sequences the measurement state machine
//! (start → service request → `D0!`…`D9!` reads) and multiplexes up to
//! [`MAX_CONCURRENT_REQUESTS`] asynchronous concurrent-measurement sessions
//! on the shared bus.
//!
//! The entry point is [`Sdi12Recorder`], which also implements the generic
//! [`Dacq`] acquisition contract so clients can drive different sensor
//! protocols through one interface.

use snafu::Snafu;

mod command;
#[cfg(feature = "concurrent")]
mod collector;
mod crc;
mod frame;
mod nom_parser;
mod types;

pub mod dacq;
pub mod recorder;
pub mod transport;

pub use dacq::{Dacq, DirectStream};
pub use frame::DumpFn;
pub use recorder::Sdi12Recorder;
pub use transport::{BusPort, PortSettings};
pub use types::{AcqCallback, Acquisition, Address, Method, Request, ValueStatus, Version};

/// Longest legal SDI-12 frame: 75 value bytes plus address, CRC and CR/LF,
/// word aligned.
pub const SDI12_LONGEST_FRAME: usize = 84;

/// Break length in milliseconds. The standard requires at least 12 ms of
/// spacing to wake a sleeping sensor.
pub const SDI_BREAK_LEN_MS: u64 = 20;

/// Size of the concurrent session table.
pub const MAX_CONCURRENT_REQUESTS: usize = 10;

/// Error type for the whole crate.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// The engine already owns an open serial device.
    #[snafu(display("tty already in use"))]
    TtyInUse,
    /// The serial device could not be acquired.
    #[snafu(display("cannot open tty: {source}"))]
    TtyOpen { source: serialport::Error },
    /// The serial device attributes could not be applied.
    #[snafu(display("cannot set tty attributes: {source}"))]
    TtyAttr { source: serialport::Error },
    /// The serial device failed during a transfer. The caller must close
    /// and reopen the port.
    #[snafu(display("tty error: {source}"))]
    TtyError { source: std::io::Error },
    /// Another transaction held the bus for longer than the lock timeout.
    #[snafu(display("recorder busy"))]
    DacqBusy,
    #[snafu(display("sensor timed out"))]
    Timeout,
    #[snafu(display("unexpected answer"))]
    UnexpectedAnswer,
    /// A concurrent session for this address is already outstanding.
    #[snafu(display("sensor busy"))]
    SensorBusy,
    /// All concurrent session slots are taken.
    #[snafu(display("too many concurrent requests"))]
    TooManyRequests,
    /// Command variant index outside `0..=9`.
    #[snafu(display("invalid index"))]
    InvalidIndex,
    #[snafu(display("crc error"))]
    CrcError,
    #[snafu(display("conversion to float error"))]
    ConversionToFloatError,
    #[snafu(display("no valid data from sensor"))]
    NoSensorData,
    #[snafu(display("cannot set date"))]
    SetTimeError,
    #[snafu(display("buffer too small"))]
    BufferTooSmall,
    #[snafu(display("cannot set acquisition interval"))]
    SetAcqIntervalFailed,
    /// A wire operation was attempted before `open`.
    #[snafu(display("initialisation required"))]
    InitialisationRequired,
    /// The value isn't a valid SDI-12 sensor address.
    #[snafu(display("invalid sensor address"))]
    InvalidAddress,
    /// The operation was cancelled by `abort`.
    #[snafu(display("aborted by user"))]
    Aborted,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
