use snafu::ensure;

use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::{Error, InvalidAddressSnafu, Result};

/// `Address` is a range-checked SDI-12 sensor address: one of `'0'..='9'`,
/// `'A'..='Z'` or `'a'..='z'`.
///
/// ## Example
/// ```
/// use sdi12_dr::Address;
/// use std::convert::TryInto;
/// let addr = Address::new('0').unwrap();
/// let addr: Address = '5'.try_into().unwrap();
/// ```
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash)]
#[repr(transparent)]
pub struct Address(u8);

impl Address {
    /// Create a new address, checking the SDI-12 address alphabet.
    /// # Errors
    /// Returns [`Error::InvalidAddress`] if `address` is out of range.
    pub fn new(address: char) -> Result<Self> {
        ensure!(address.is_ascii_alphanumeric(), InvalidAddressSnafu);
        Ok(Self(address as u8))
    }

    pub const fn as_byte(self) -> u8 {
        self.0
    }

    pub const fn as_char(self) -> char {
        self.0 as char
    }
}

impl TryFrom<char> for Address {
    type Error = Error;

    fn try_from(value: char) -> Result<Self> {
        Self::new(value)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Self::new(c),
            _ => Err(Error::InvalidAddress),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// The measurement command family.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
pub enum Method {
    /// `aM!` — start a measurement, wait for the service request, read data.
    Measure,
    /// `aC!` — start a concurrent measurement; data is collected later.
    Concurrent,
    /// `aRn!` — read continuous values without starting a measurement.
    Continuous,
    /// `aV!` — start a verify sequence.
    Verify,
    /// `aDn!` — read out buffered data.
    Data,
}

impl Method {
    pub(crate) const fn letter(self) -> u8 {
        match self {
            Method::Measure => b'M',
            Method::Concurrent => b'C',
            Method::Continuous => b'R',
            Method::Verify => b'V',
            Method::Data => b'D',
        }
    }
}

/// One measurement request on the bus.
#[derive(Debug, Copy, Clone)]
pub struct Request {
    pub address: Address,
    pub method: Method,
    /// Command variant selector, `0..=9` (`aM1!`…`aM9!`, `aR0!`…`aR9!`).
    pub index: u8,
    /// Issue the CRC-requesting command variant and verify received frames.
    pub use_crc: bool,
    /// Advisory upper bound on the sensor's response time. When set, it caps
    /// the collector deadline of a concurrent session.
    pub max_wait: Option<Duration>,
}

impl Request {
    pub fn new(address: Address, method: Method) -> Self {
        Request {
            address,
            method,
            index: 0,
            use_crc: false,
            max_wait: None,
        }
    }
}

/// Per-value acquisition status.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueStatus {
    Ok = 0,
    Missing = 1,
    Implausible = 2,
}

/// Driver version triple.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Completion callback, invoked with the finished acquisition.
pub type AcqCallback = Arc<dyn Fn(&Acquisition) + Send + Sync>;

/// A transient acquisition handle passed to
/// [`retrieve`](crate::Sdi12Recorder::retrieve).
///
/// `values` and `statuses` are parallel arrays sized to the caller's
/// capacity; `count` is the capacity on input and the number of values
/// actually produced on output. For concurrent requests the handle is copied
/// into a session slot, so the buffers and the callback are owned values.
#[derive(Clone)]
pub struct Acquisition {
    pub timestamp: SystemTime,
    pub values: Vec<f32>,
    pub statuses: Vec<ValueStatus>,
    pub count: usize,
    pub request: Request,
    pub callback: Option<AcqCallback>,
}

impl Acquisition {
    /// A handle with room for `capacity` values, all marked missing.
    pub fn new(request: Request, capacity: usize) -> Self {
        Acquisition {
            timestamp: SystemTime::now(),
            values: vec![0.0; capacity],
            statuses: vec![ValueStatus::Missing; capacity],
            count: capacity,
            request,
            callback: None,
        }
    }
}

impl fmt::Debug for Acquisition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acquisition")
            .field("timestamp", &self.timestamp)
            .field("values", &&self.values[..self.count.min(self.values.len())])
            .field("count", &self.count)
            .field("request", &self.request)
            .field("callback", &self.callback.as_ref().map(|_| "..."))
            .finish()
    }
}
