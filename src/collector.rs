//! Concurrent measurement scheduler: the session slot table and the
//! collector thread that reads sessions out at their deadlines.

use std::array;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use snafu::ensure;

use crate::recorder::{self, Inner, Sdi12Recorder};
use crate::types::{Acquisition, Method, ValueStatus};
use crate::{Error, Result, SensorBusySnafu, MAX_CONCURRENT_REQUESTS};

struct Slot {
    acq: Acquisition,
    deadline: Instant,
}

struct Table {
    entries: [Option<Slot>; MAX_CONCURRENT_REQUESTS],
    shutdown: bool,
}

pub(crate) struct SlotTable {
    table: Mutex<Table>,
    ready: Condvar,
}

impl SlotTable {
    pub(crate) fn new() -> Self {
        SlotTable {
            table: Mutex::new(Table {
                entries: array::from_fn(|_| None),
                shutdown: false,
            }),
            ready: Condvar::new(),
        }
    }
}

/// Earliest deadline over the populated slots; ties keep the lowest index.
fn nearest(table: &Table) -> Option<(usize, Instant)> {
    let mut best: Option<(usize, Instant)> = None;
    for (idx, entry) in table.entries.iter().enumerate() {
        if let Some(slot) = entry {
            if best.map_or(true, |(_, deadline)| slot.deadline < deadline) {
                best = Some((idx, slot.deadline));
            }
        }
    }
    best
}

pub(crate) fn spawn(inner: Arc<Inner>) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("sdi12-collect".into())
        .spawn(move || collect(inner))
        .expect("failed to spawn the collector thread")
}

pub(crate) fn shutdown(inner: &Inner) {
    inner.slots.table.lock().shutdown = true;
    inner.slots.ready.notify_all();
}

/// Queue a concurrent session: start the measurement under the bus mutex,
/// then park a copy of the handle in a free slot for the collector. The
/// caller's statuses are preset to missing here; they only turn `Ok` in
/// the copy the callback receives.
pub(crate) fn enqueue(recorder: &Sdi12Recorder, acq: &mut Acquisition) -> Result<()> {
    let inner = &recorder.inner;
    let address = acq.request.address;

    let mut bus = recorder.lock_bus()?;
    for status in &mut acq.statuses[..] {
        *status = ValueStatus::Missing;
    }

    // enqueues serialize on the bus mutex and the collector only ever
    // clears entries, so the chosen slot stays free until it is filled
    let idx = {
        let table = inner.slots.table.lock();
        ensure!(
            table
                .entries
                .iter()
                .flatten()
                .all(|slot| slot.acq.request.address != address),
            SensorBusySnafu
        );
        table
            .entries
            .iter()
            .position(Option::is_none)
            .ok_or(Error::TooManyRequests)?
    };

    let header = recorder::start_measurement(&mut bus, &acq.request)?;
    let mut slot_acq = acq.clone();
    slot_acq.count = slot_acq.count.min(slot_acq.values.len()).min(header.count);
    let mut delay = header.delay;
    if let Some(max_wait) = acq.request.max_wait {
        delay = delay.min(max_wait);
    }
    debug!(
        "concurrent session for {}: {} values due in {:?}",
        address, slot_acq.count, delay
    );
    let deadline = Instant::now() + delay;
    inner.slots.table.lock().entries[idx] = Some(Slot {
        acq: slot_acq,
        deadline,
    });
    inner.slots.ready.notify_all();
    Ok(())
}

fn collect(inner: Arc<Inner>) {
    loop {
        let due = {
            let mut table = inner.slots.table.lock();
            loop {
                if table.shutdown {
                    return;
                }
                match nearest(&table) {
                    Some((idx, deadline)) => {
                        let now = Instant::now();
                        if deadline <= now {
                            break idx;
                        }
                        inner.slots.ready.wait_for(&mut table, deadline - now);
                    }
                    None => {
                        inner.slots.ready.wait(&mut table);
                    }
                }
            }
        };
        service(&inner, due);
    }
}

/// Claim the bus, read out one elapsed session, then release its slot.
fn service(inner: &Inner, idx: usize) {
    let mut bus = inner.bus.lock();
    bus.mark_origin();
    let mut acq = {
        let table = inner.slots.table.lock();
        match &table.entries[idx] {
            Some(slot) => slot.acq.clone(),
            None => return,
        }
    };
    acq.request.method = Method::Data;
    acq.request.index = 0;
    if let Err(e) = recorder::retrieve_on_bus(inner, &mut bus, &mut acq) {
        warn!(
            "concurrent collection for {} failed: {}",
            acq.request.address, e
        );
    }
    drop(bus);
    inner.slots.table.lock().entries[idx] = None;
}
