//! The SDI-12 data recorder: measurement state machine and acquisition
//! facade.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use ascii::AsciiChar;
use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard};
use snafu::{ensure, ResultExt};

use crate::command;
use crate::dacq::{Dacq, DirectStream};
use crate::frame::{BusState, DumpFn, FrameBuf};
use crate::nom_parser::{self, MeasurementHeader};
use crate::transport::{write_full, BusPort, PortSettings, UartPort};
use crate::types::{Acquisition, Address, Method, Request, ValueStatus, Version};
use crate::{
    AbortedSnafu, BufferTooSmallSnafu, Error, InvalidIndexSnafu, NoSensorDataSnafu, Result,
    TimeoutSnafu, TtySnafu, TtyInUseSnafu, UnexpectedAnswerSnafu, SDI12_LONGEST_FRAME,
};

#[cfg(feature = "concurrent")]
use crate::collector;

const VERSION: Version = Version {
    major: 1,
    minor: 0,
    patch: 0,
};

/// Timeout to wait on an already running transaction.
const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Outer attempts per protocol step; a break is forced between them.
const RETRIES_WITH_BREAK: u32 = 3;

/// Read timeout while polling for a service request.
const SERVICE_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Grace period past the announced delay when no service request arrived.
const SERVICE_GRACE: Duration = Duration::from_millis(500);

/// The identification response carries up to 33 characters plus the
/// address byte and the terminator.
const MIN_INFO_BUFFER: usize = 36;

/// Client byte (`Ctrl-X`) that ends a direct session.
const DIRECT_QUIT: u8 = AsciiChar::CAN as u8;

pub(crate) struct Inner {
    pub(crate) name: String,
    pub(crate) bus: Mutex<BusState>,
    pub(crate) abort: AtomicBool,
    #[cfg(feature = "concurrent")]
    pub(crate) slots: collector::SlotTable,
}

/// SDI-12 protocol engine, bound to one serial device.
///
/// All entry points serialize on an internal bus mutex, so a shared
/// reference is enough; the engine may be driven from several threads and
/// coexists with its own collector thread.
pub struct Sdi12Recorder {
    pub(crate) inner: Arc<Inner>,
    #[cfg(feature = "concurrent")]
    collector: Option<thread::JoinHandle<()>>,
}

impl Sdi12Recorder {
    /// Create an engine for the serial device at `device`. The device is
    /// not touched until [`open`](Self::open); collector resources live
    /// until the engine is dropped.
    pub fn new(device: impl Into<String>) -> Self {
        let inner = Arc::new(Inner {
            name: device.into(),
            bus: Mutex::new(BusState::new()),
            abort: AtomicBool::new(false),
            #[cfg(feature = "concurrent")]
            slots: collector::SlotTable::new(),
        });
        Sdi12Recorder {
            #[cfg(feature = "concurrent")]
            collector: Some(collector::spawn(Arc::clone(&inner))),
            inner,
        }
    }

    pub fn version(&self) -> Version {
        VERSION
    }

    /// Open and configure the serial device.
    /// # Errors
    /// [`Error::TtyInUse`] when already open, [`Error::TtyOpen`] /
    /// [`Error::TtyAttr`] when the device can't be acquired or configured.
    pub fn open(&self, settings: &PortSettings) -> Result<()> {
        let mut bus = self.lock_bus()?;
        ensure!(!bus.is_open(), TtyInUseSnafu);
        let port = UartPort::open(&self.inner.name, settings)?;
        bus.attach(Box::new(port));
        Ok(())
    }

    /// Drive the bus through a caller-supplied transport instead of a
    /// [`UartPort`] (GPIO break generation, RS-485 transceiver control,
    /// tests).
    pub fn attach(&self, port: Box<dyn BusPort>) -> Result<()> {
        let mut bus = self.lock_bus()?;
        ensure!(!bus.is_open(), TtyInUseSnafu);
        bus.attach(port);
        Ok(())
    }

    pub fn close(&self) {
        self.inner.bus.lock().detach();
    }

    /// Whether a transaction currently holds the bus.
    pub fn is_busy(&self) -> bool {
        self.inner.bus.try_lock().is_none()
    }

    /// Install an observer for formatted wire events (`break`, `tx`, `rx`,
    /// `timeout`, `write failed`). The hook runs on the thread driving the
    /// bus and must not call back into the engine.
    pub fn set_dump_fn(&self, hook: DumpFn) {
        self.inner.bus.lock().set_dump(Some(hook));
    }

    pub fn unset_dump_fn(&self) {
        self.inner.bus.lock().set_dump(None);
    }

    /// Request cancellation of the acquisition in flight. Checked at
    /// data-frame boundaries; the flag is consumed when observed.
    pub fn abort(&self) -> bool {
        self.inner.abort.store(true, Ordering::SeqCst);
        true
    }

    /// `a!` — check that a sensor answers on the bus.
    pub fn ack_active(&self, address: Address) -> Result<()> {
        let mut bus = self.lock_bus()?;
        let cmd = command::acknowledge(address);
        let mut resp = FrameBuf::new();
        with_break_retries(&mut bus, |bus| {
            bus.transaction(&cmd, &mut resp)?;
            let echoed = nom_parser::parse_address_echo(&resp)?;
            ensure!(echoed == address.as_byte(), UnexpectedAnswerSnafu);
            Ok(())
        })
    }

    /// `aI!` — read the sensor identification into `out` and return its
    /// length. `out` must hold more than 36 bytes.
    pub fn get_info(&self, address: Address, out: &mut [u8]) -> Result<usize> {
        ensure!(out.len() > MIN_INFO_BUFFER, BufferTooSmallSnafu);
        let mut bus = self.lock_bus()?;
        let cmd = command::identify(address);
        let mut resp = FrameBuf::new();
        with_break_retries(&mut bus, |bus| {
            bus.transaction(&cmd, &mut resp)?;
            let id = nom_parser::parse_identification(&resp, address)?;
            ensure!(id.len() <= out.len(), BufferTooSmallSnafu);
            out[..id.len()].copy_from_slice(id);
            Ok(id.len())
        })
    }

    /// `aAb!` — re-address a sensor. The sensor must echo the new address.
    pub fn change_id(&self, address: Address, new_address: Address) -> Result<()> {
        let mut bus = self.lock_bus()?;
        let cmd = command::change_address(address, new_address);
        let mut resp = FrameBuf::new();
        with_break_retries(&mut bus, |bus| {
            bus.transaction(&cmd, &mut resp)?;
            let echoed = nom_parser::parse_address_echo(&resp)?;
            ensure!(echoed == new_address.as_byte(), UnexpectedAnswerSnafu);
            Ok(())
        })
    }

    /// Send a raw, caller-built command and return the raw response
    /// (terminator included) in `out`. The command is clamped to the
    /// longest legal frame.
    pub fn transparent(&self, cmd: &[u8], out: &mut [u8]) -> Result<usize> {
        ensure!(!cmd.is_empty(), BufferTooSmallSnafu);
        let cmd = &cmd[..cmd.len().min(SDI12_LONGEST_FRAME)];
        let mut bus = self.lock_bus()?;
        let mut resp = FrameBuf::new();
        with_break_retries(&mut bus, |bus| bus.transaction(cmd, &mut resp))?;
        ensure!(resp.len() <= out.len(), BufferTooSmallSnafu);
        out[..resp.len()].copy_from_slice(&resp);
        Ok(resp.len())
    }

    /// Run one acquisition described by the handle.
    ///
    /// Concurrent requests are handed to the collector and return as soon
    /// as the sensor accepted the measurement; the callback fires from the
    /// collector thread once the data was read. Every other method blocks
    /// until the data is in the handle.
    pub fn retrieve(&self, acq: &mut Acquisition) -> Result<()> {
        ensure!(acq.request.index <= 9, InvalidIndexSnafu);

        #[cfg(feature = "concurrent")]
        if acq.request.method == Method::Concurrent {
            return collector::enqueue(self, acq);
        }

        let mut bus = self.lock_bus()?;
        retrieve_on_bus(&self.inner, &mut bus, acq)
    }

    /// Direct passthrough between `client` and the sensor port, for site
    /// maintenance tools. Runs until the client sends `Ctrl-X`, goes away,
    /// or stays idle for `idle_timeout`; a forwarding thread carries the
    /// port-to-client direction.
    pub fn direct(&self, client: &mut dyn DirectStream, idle_timeout: Duration) -> Result<()> {
        let mut bus = self.lock_bus()?;
        let port = bus.port_mut()?;
        let mut port_rx = port.try_clone_port().context(TtySnafu)?;
        let mut client_tx = client.try_clone_stream().context(TtySnafu)?;
        client
            .set_stream_timeout(Some(Duration::from_millis(100)))
            .context(TtySnafu)?;

        let stop = AtomicBool::new(false);
        let result = thread::scope(|scope| {
            scope.spawn(|| {
                let mut buf = [0u8; 512];
                while !stop.load(Ordering::Relaxed) {
                    match port_rx.read(&mut buf) {
                        Ok(0) => continue,
                        Ok(n) => {
                            if client_tx.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });

            let mut buf = [0u8; 512];
            let mut last_rx = Instant::now();
            let result = loop {
                if last_rx.elapsed() >= idle_timeout {
                    break Ok(());
                }
                match client.read(&mut buf) {
                    Ok(0) => break Ok(()), // client hung up
                    Ok(n) => {
                        last_rx = Instant::now();
                        if n <= 3 && buf[0] == DIRECT_QUIT {
                            break Ok(());
                        }
                        if let Err(source) = write_full(port.as_mut(), &buf[..n]) {
                            break Err(Error::TtyError { source });
                        }
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                        ) => {}
                    Err(_) => break Ok(()),
                }
            };
            stop.store(true, Ordering::Relaxed);
            result
        });
        let _ = client.set_stream_timeout(None);
        result
    }

    pub(crate) fn lock_bus(&self) -> Result<MutexGuard<'_, BusState>> {
        let mut bus = self
            .inner
            .bus
            .try_lock_for(LOCK_TIMEOUT)
            .ok_or(Error::DacqBusy)?;
        bus.mark_origin();
        Ok(bus)
    }
}

#[cfg(feature = "concurrent")]
impl Drop for Sdi12Recorder {
    fn drop(&mut self) {
        collector::shutdown(&self.inner);
        if let Some(handle) = self.collector.take() {
            let _ = handle.join();
        }
    }
}

impl Dacq for Sdi12Recorder {
    fn open(&self, settings: &PortSettings) -> Result<()> {
        Sdi12Recorder::open(self, settings)
    }

    fn close(&self) {
        Sdi12Recorder::close(self)
    }

    fn is_busy(&self) -> bool {
        Sdi12Recorder::is_busy(self)
    }

    fn version(&self) -> Version {
        Sdi12Recorder::version(self)
    }

    fn get_info(&self, address: Address, out: &mut [u8]) -> Result<usize> {
        Sdi12Recorder::get_info(self, address, out)
    }

    fn change_id(&self, address: Address, new_address: Address) -> Result<()> {
        Sdi12Recorder::change_id(self, address, new_address)
    }

    fn retrieve(&self, acq: &mut Acquisition) -> Result<()> {
        Sdi12Recorder::retrieve(self, acq)
    }

    fn transparent(&self, command: &[u8], out: &mut [u8]) -> Result<usize> {
        Sdi12Recorder::transparent(self, command, out)
    }

    fn direct(&self, client: &mut dyn DirectStream, idle_timeout: Duration) -> Result<()> {
        Sdi12Recorder::direct(self, client, idle_timeout)
    }

    fn abort(&self) -> bool {
        Sdi12Recorder::abort(self)
    }
}

/// The synchronous retrieve path. Also runs on the collector thread with a
/// slot's handle copy, which arrives with the method switched to `Data`.
pub(crate) fn retrieve_on_bus(
    inner: &Inner,
    bus: &mut BusState,
    acq: &mut Acquisition,
) -> Result<()> {
    let request = acq.request;
    let capacity = acq.count.min(acq.values.len()).min(acq.statuses.len());
    for status in &mut acq.statuses[..] {
        *status = ValueStatus::Missing;
    }

    let mut cap = capacity;
    if !matches!(request.method, Method::Continuous | Method::Data) {
        let header = start_measurement(bus, &request)?;
        cap = cap.min(header.count);
        if request.method == Method::Concurrent {
            // synchronous fallback: no collector, sit out the whole delay
            thread::sleep(header.delay);
        } else if !header.delay.is_zero() {
            wait_for_service_request(inner, bus, request.address, header.delay)?;
        }
    }

    let collected = collect_data(inner, bus, acq, cap);
    acq.count = *collected.as_ref().unwrap_or(&0);
    acq.timestamp = SystemTime::now();
    if let Some(callback) = acq.callback.clone() {
        callback(acq);
    }
    ensure!(collected? > 0, NoSensorDataSnafu);
    Ok(())
}

/// Issue the start-measurement command and parse the `atttn` header.
pub(crate) fn start_measurement(
    bus: &mut BusState,
    request: &Request,
) -> Result<MeasurementHeader> {
    let cmd = command::measurement(request)?;
    let mut resp = FrameBuf::new();
    with_break_retries(bus, |bus| {
        bus.transaction(&cmd, &mut resp)?;
        let header = nom_parser::parse_measurement_header(&resp)?;
        ensure!(
            header.address == request.address.as_byte(),
            UnexpectedAnswerSnafu
        );
        Ok(header)
    })
}

/// Poll for the sensor's unsolicited `a<CR><LF>` during the announced
/// delay, with the read timeout temporarily widened to one second. An
/// expired delay is not an error; it only costs the extra grace sleep, and
/// the subsequent `D0!` decides whether data actually exists.
fn wait_for_service_request(
    inner: &Inner,
    bus: &mut BusState,
    address: Address,
    delay: Duration,
) -> Result<()> {
    let port = bus.port_mut()?;
    let saved_timeout = port.read_timeout();
    port.set_read_timeout(SERVICE_POLL_TIMEOUT)
        .context(TtySnafu)?;

    let mut seconds_left = delay.as_secs();
    let mut outcome: Result<bool> = Ok(false);
    loop {
        if inner.abort.swap(false, Ordering::SeqCst) {
            outcome = AbortedSnafu.fail();
            break;
        }
        let mut buf = [0u8; 4];
        match port.read(&mut buf) {
            Ok(0) => {
                if seconds_left == 0 {
                    break;
                }
                seconds_left -= 1;
            }
            Ok(_) if buf[0] == address.as_byte() => {
                outcome = Ok(true);
                break;
            }
            Ok(_) => {} // foreign traffic, keep listening
            Err(source) => {
                outcome = Err(Error::TtyError { source });
                break;
            }
        }
    }
    port.set_read_timeout(saved_timeout).context(TtySnafu)?;

    if outcome? {
        debug!("service request from {}", address);
        bus.touch(address.as_byte());
    } else {
        debug!("no service request from {}, proceeding", address);
        thread::sleep(SERVICE_GRACE);
    }
    Ok(())
}

/// Issue `D0!`…`D9!` (or a single `R` read) until `cap` values were
/// parsed or the sensor runs dry. A failure after the first successful
/// frame keeps the partial result; the unfilled statuses stay missing.
fn collect_data(
    inner: &Inner,
    bus: &mut BusState,
    acq: &mut Acquisition,
    cap: usize,
) -> Result<usize> {
    let request = acq.request;
    let address = request.address;
    let mut parsed = 0usize;
    let mut index = 0u8;

    while parsed < cap {
        if inner.abort.swap(false, Ordering::SeqCst) {
            return AbortedSnafu.fail();
        }
        let cmd = if request.method == Method::Continuous {
            command::measurement(&request)?
        } else {
            command::send_data(address, index)?
        };
        let mut resp = FrameBuf::new();
        let frame = with_break_retries(bus, |bus| {
            bus.transaction(&cmd, &mut resp)?;
            let frame = nom_parser::parse_data_frame(&resp, request.use_crc)?;
            ensure!(frame.address == address.as_byte(), UnexpectedAnswerSnafu);
            Ok(frame)
        });
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) if parsed > 0 && !matches!(e, Error::Aborted) => {
                warn!("data collection from {} stopped early: {}", address, e);
                break;
            }
            Err(e) => return Err(e),
        };
        if frame.values.is_empty() {
            break; // the sensor has nothing (more) to send
        }
        for value in frame.values {
            if parsed >= cap {
                break;
            }
            acq.values[parsed] = value;
            acq.statuses[parsed] = ValueStatus::Ok;
            parsed += 1;
        }
        if request.method == Method::Continuous {
            break;
        }
        index += 1;
        if index > 9 {
            break;
        }
    }
    Ok(parsed)
}

/// Run a protocol step up to three times, forcing a break between
/// attempts. Only errors the wire can cause transiently are retried.
fn with_break_retries<T>(
    bus: &mut BusState,
    mut step: impl FnMut(&mut BusState) -> Result<T>,
) -> Result<T> {
    let mut last = TimeoutSnafu.build();
    for attempt in 0..RETRIES_WITH_BREAK {
        if attempt > 0 {
            bus.force_break();
        }
        match step(bus) {
            Ok(value) => return Ok(value),
            Err(e @ (Error::Timeout | Error::UnexpectedAnswer | Error::CrcError)) => {
                debug!("attempt {} failed: {}", attempt + 1, e);
                last = e;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last)
}
