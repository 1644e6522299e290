//! Frame layer: one command/response exchange with break policy, timing
//! and retries.

use std::thread;
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;
use log::{debug, trace};
use snafu::ResultExt;

use crate::nom_parser::TERMINATOR;
use crate::transport::{write_full, BusPort};
use crate::{Error, Result, TimeoutSnafu, TtySnafu, SDI12_LONGEST_FRAME, SDI_BREAK_LEN_MS};

/// Observer for pre-formatted, time-stamped wire event lines.
pub type DumpFn = Box<dyn Fn(&str) + Send>;

pub(crate) type FrameBuf = ArrayVec<u8, SDI12_LONGEST_FRAME>;

/// Nobody has been addressed yet.
const NO_ADDRESS: u8 = b'?';

/// A sensor may go to sleep once the bus has idled this long; a break
/// re-wakes it.
const WAKE_AFTER_IDLE: Duration = Duration::from_millis(85);

/// Marking between break and first command byte; the standard wants at
/// least 8.33 ms.
const POST_BREAK_MARKING: Duration = Duration::from_millis(10);

/// Settling time after a complete response frame.
const RESPONSE_SETTLE: Duration = Duration::from_millis(20);

/// Send attempts per transaction before the caller forces a break.
const INNER_RETRIES: u32 = 3;

/// Transmission time of `len` bytes at 1200 baud 7E1 (10 bit times per
/// byte, 8.33 ms), rounded up.
fn byte_time(len: usize) -> Duration {
    Duration::from_millis((len as u64 * 25 + 2) / 3)
}

fn fmt_ts(at: Duration) -> String {
    format!("{}.{:03}", at.as_secs(), at.subsec_millis())
}

fn dump_line(hook: &Option<DumpFn>, line: impl FnOnce() -> String) {
    if let Some(hook) = hook {
        hook(&line());
    }
}

/// The serial line plus the bus bookkeeping the break policy needs. Owned
/// by the bus mutex; exactly one transaction runs at a time.
pub(crate) struct BusState {
    port: Option<Box<dyn BusPort>>,
    last_addressed: u8,
    last_activity: Option<Instant>,
    origin: Instant,
    dump: Option<DumpFn>,
}

impl BusState {
    pub(crate) fn new() -> Self {
        BusState {
            port: None,
            last_addressed: NO_ADDRESS,
            last_activity: None,
            origin: Instant::now(),
            dump: None,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.port.is_some()
    }

    pub(crate) fn attach(&mut self, port: Box<dyn BusPort>) {
        self.port = Some(port);
        self.last_addressed = NO_ADDRESS;
        self.last_activity = None;
    }

    pub(crate) fn detach(&mut self) {
        self.port = None;
        self.last_addressed = NO_ADDRESS;
        self.last_activity = None;
    }

    pub(crate) fn port_mut(&mut self) -> Result<&mut Box<dyn BusPort>> {
        self.port.as_mut().ok_or(Error::InitialisationRequired)
    }

    pub(crate) fn set_dump(&mut self, hook: Option<DumpFn>) {
        self.dump = hook;
    }

    /// Reference instant for the dump timestamps of one external operation.
    pub(crate) fn mark_origin(&mut self) {
        self.origin = Instant::now();
    }

    /// Make the next transaction start with a break.
    pub(crate) fn force_break(&mut self) {
        self.last_activity = None;
    }

    /// Note unsolicited activity from `address` (service request).
    pub(crate) fn touch(&mut self, address: u8) {
        self.last_addressed = address;
        self.last_activity = Some(Instant::now());
    }

    /// Send `cmd` and collect one `<CR><LF>`-terminated response into
    /// `resp`, retrying the send up to three times on timeout or malformed
    /// frames. Returns the response length including the terminator.
    pub(crate) fn transaction(&mut self, cmd: &[u8], resp: &mut FrameBuf) -> Result<usize> {
        debug_assert!(!cmd.is_empty());
        let origin = self.origin;
        let wants_break = self.last_addressed != cmd[0]
            || self
                .last_activity
                .map_or(true, |at| at.elapsed() > WAKE_AFTER_IDLE);
        let port = self.port.as_mut().ok_or(Error::InitialisationRequired)?;

        if wants_break {
            trace!("break");
            let started = origin.elapsed();
            port.send_break(Duration::from_millis(SDI_BREAK_LEN_MS))
                .context(TtySnafu)?;
            dump_line(&self.dump, || {
                format!(
                    "{}..{} break",
                    fmt_ts(started),
                    fmt_ts(origin.elapsed())
                )
            });
        }
        self.last_addressed = cmd[0];
        thread::sleep(POST_BREAK_MARKING);

        port.flush_input().context(TtySnafu)?;

        let mut retries = INNER_RETRIES;
        loop {
            let tx_end = Instant::now() + byte_time(cmd.len());
            if let Err(source) = write_full(port.as_mut(), cmd) {
                dump_line(&self.dump, || {
                    format!("{} write failed", fmt_ts(origin.elapsed()))
                });
                return Err(Error::TtyError { source });
            }
            dump_line(&self.dump, || {
                format!("{} tx \"{}\"", fmt_ts(origin.elapsed()), cmd.escape_ascii())
            });
            // half duplex: hold off reading until the command left the wire
            let now = Instant::now();
            if tx_end > now {
                thread::sleep(tx_end - now);
            }
            self.last_activity = Some(Instant::now());

            resp.clear();
            let mut complete = false;
            'collect: loop {
                let mut chunk = [0u8; 16];
                let n = port.read(&mut chunk).context(TtySnafu)?;
                if n == 0 {
                    break; // read timeout
                }
                self.last_activity = Some(Instant::now());
                for &byte in &chunk[..n] {
                    if resp.try_push(byte).is_err() {
                        break 'collect; // oversized frame, discard
                    }
                }
                if resp.ends_with(&TERMINATOR) {
                    complete = true;
                    break;
                }
            }

            if complete {
                thread::sleep(RESPONSE_SETTLE);
                self.last_activity = Some(Instant::now());
                dump_line(&self.dump, || {
                    format!("{} rx \"{}\"", fmt_ts(origin.elapsed()), resp.escape_ascii())
                });
                return Ok(resp.len());
            }

            dump_line(&self.dump, || {
                format!("{} timeout", fmt_ts(origin.elapsed()))
            });
            retries -= 1;
            if retries == 0 {
                return TimeoutSnafu.fail();
            }
            debug!(
                "no valid frame from {}, {} send attempts left",
                cmd[0] as char, retries
            );
        }
    }
}
