#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use sdi12_dr::{BusPort, DirectStream};

/// Scripted far end of the bus: a fake sensor answering from an ordered
/// expectation queue.
///
/// The strict ordering doubles as the wire mutual-exclusion check:
/// interleaved transactions from two threads would present commands out of
/// script order and panic.
pub struct MockBus {
    state: Arc<Mutex<Script>>,
}

struct Script {
    expectations: VecDeque<Expectation>,
    /// Response frames pending on the wire. Reads never cross a frame
    /// boundary, mirroring the temporal separation of real responses.
    rx: VecDeque<VecDeque<u8>>,
    breaks: usize,
    read_timeout: Duration,
}

struct Expectation {
    command: Vec<u8>,
    replies: Vec<Vec<u8>>,
}

impl MockBus {
    pub fn new() -> Self {
        MockBus {
            state: Arc::new(Mutex::new(Script {
                expectations: VecDeque::new(),
                rx: VecDeque::new(),
                breaks: 0,
                read_timeout: Duration::from_millis(5),
            })),
        }
    }

    /// Script one command and the response frames the sensor sends for it.
    pub fn expect(&self, command: &[u8], replies: &[&[u8]]) {
        self.state.lock().unwrap().expectations.push_back(Expectation {
            command: command.to_vec(),
            replies: replies.iter().map(|r| r.to_vec()).collect(),
        });
    }

    pub fn port(&self) -> Box<dyn BusPort> {
        Box::new(MockPort {
            state: Arc::clone(&self.state),
        })
    }

    pub fn breaks(&self) -> usize {
        self.state.lock().unwrap().breaks
    }

    pub fn assert_done(&self) {
        let state = self.state.lock().unwrap();
        assert!(
            state.expectations.is_empty(),
            "{} scripted commands were never sent",
            state.expectations.len()
        );
    }
}

struct MockPort {
    state: Arc<Mutex<Script>>,
}

impl BusPort for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        let expected = match state.expectations.pop_front() {
            Some(e) => e,
            None => panic!("unscripted command {:?}", String::from_utf8_lossy(buf)),
        };
        assert_eq!(
            buf,
            &expected.command[..],
            "command out of script order: got {:?}, expected {:?}",
            String::from_utf8_lossy(buf),
            String::from_utf8_lossy(&expected.command)
        );
        for reply in expected.replies {
            state.rx.push_back(reply.into_iter().collect());
        }
        Ok(buf.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = {
            let mut state = self.state.lock().unwrap();
            if let Some(frame) = state.rx.front_mut() {
                let n = buf.len().min(frame.len());
                for slot in buf[..n].iter_mut() {
                    *slot = frame.pop_front().unwrap();
                }
                if state.rx.front().map_or(false, |f| f.is_empty()) {
                    state.rx.pop_front();
                }
                return Ok(n);
            }
            state.read_timeout
        };
        thread::sleep(timeout);
        Ok(0)
    }

    fn send_break(&mut self, _duration: Duration) -> io::Result<()> {
        self.state.lock().unwrap().breaks += 1;
        Ok(())
    }

    fn read_timeout(&self) -> Duration {
        self.state.lock().unwrap().read_timeout
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.state.lock().unwrap().read_timeout = timeout;
        Ok(())
    }

    fn flush_input(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().rx.clear();
        Ok(())
    }

    fn try_clone_port(&self) -> io::Result<Box<dyn BusPort>> {
        Ok(Box::new(MockPort {
            state: Arc::clone(&self.state),
        }))
    }
}

/// Maintenance-console stand-in for the direct passthrough: feeds scripted
/// chunks to the engine and, once the sensor side answered, a `Ctrl-X`.
pub struct MockClient {
    state: Arc<Mutex<ClientState>>,
}

struct ClientState {
    to_engine: VecDeque<Vec<u8>>,
    from_engine: Vec<u8>,
    quit_when_answered: bool,
    quit_sent: bool,
}

impl MockClient {
    pub fn new(chunks: &[&[u8]], quit_when_answered: bool) -> Self {
        MockClient {
            state: Arc::new(Mutex::new(ClientState {
                to_engine: chunks.iter().map(|c| c.to_vec()).collect(),
                from_engine: Vec::new(),
                quit_when_answered,
                quit_sent: false,
            })),
        }
    }

    pub fn received(&self) -> Vec<u8> {
        self.state.lock().unwrap().from_engine.clone()
    }
}

impl Read for MockClient {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(chunk) = state.to_engine.pop_front() {
                let n = buf.len().min(chunk.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                return Ok(n);
            }
            if state.quit_when_answered && !state.from_engine.is_empty() && !state.quit_sent {
                state.quit_sent = true;
                buf[0] = 0x18; // Ctrl-X
                return Ok(1);
            }
        }
        thread::sleep(Duration::from_millis(10));
        Err(io::ErrorKind::WouldBlock.into())
    }
}

impl Write for MockClient {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.lock().unwrap().from_engine.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DirectStream for MockClient {
    fn try_clone_stream(&self) -> io::Result<Box<dyn DirectStream>> {
        Ok(Box::new(MockClient {
            state: Arc::clone(&self.state),
        }))
    }

    fn set_stream_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
}
