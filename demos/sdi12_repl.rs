use anyhow::{Context, Result};
use std::io::Write;
use std::str::SplitWhitespace;
use std::sync::Arc;

use sdi12_dr::{
    Acquisition, Address, Method, PortSettings, Request, Sdi12Recorder, SDI12_LONGEST_FRAME,
};

fn cmd_info(args: &mut Args, sdi12: &Sdi12Recorder) -> Result<()> {
    let mut buf = [0u8; 100];
    let n = sdi12.get_info(args.address()?, &mut buf)?;
    println!("{}", String::from_utf8_lossy(&buf[..n]));
    Ok(())
}

fn cmd_change(args: &mut Args, sdi12: &Sdi12Recorder) -> Result<()> {
    let old = args.address()?;
    let new = args.address()?;
    sdi12.change_id(old, new)?;
    println!("sensor address changed to {}", new);
    Ok(())
}

fn cmd_measure(args: &mut Args, sdi12: &Sdi12Recorder, method: Method) -> Result<()> {
    let request = args.measurement(method)?;
    let mut acq = Acquisition::new(request, 20);
    if method == Method::Concurrent {
        acq.callback = Some(Arc::new(|acq: &Acquisition| {
            println!(
                "\ngot {} values from sensor {}: {:?}",
                acq.count,
                acq.request.address,
                &acq.values[..acq.count]
            );
        }));
        sdi12.retrieve(&mut acq)?;
        println!("measurement started, data will follow");
    } else {
        sdi12.retrieve(&mut acq)?;
        for (value, status) in acq.values.iter().zip(&acq.statuses).take(acq.count) {
            println!("{} [{:?}]", value, status);
        }
    }
    Ok(())
}

fn cmd_transparent(args: &mut Args, sdi12: &Sdi12Recorder) -> Result<()> {
    let cmd = args.word().context("raw command expected, e.g. 0I!")?;
    let mut buf = [0u8; SDI12_LONGEST_FRAME];
    let n = sdi12.transparent(cmd.as_bytes(), &mut buf)?;
    println!("{:?}", String::from_utf8_lossy(&buf[..n]));
    Ok(())
}

fn print_help() {
    println!("info <addr>                  read the sensor identification");
    println!("change <addr> <new>          re-address a sensor");
    println!("measure <addr> [n] [crc]     start a measurement and read data");
    println!("concurrent <addr> [n] [crc]  concurrent measurement, data via callback");
    println!("continuous <addr> [n] [crc]  continuous read");
    println!("verify <addr>                verify sequence");
    println!("trans <cmd>                  send a raw command");
    println!("quit");
}

fn main() {
    env_logger::init();

    let device = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let sdi12 = Sdi12Recorder::new(device);
    sdi12
        .open(&PortSettings::sdi12())
        .expect("Failed to open serial port");
    println!(
        "SDI-12 recorder {} ready, type 'help' for commands",
        sdi12.version()
    );

    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        print!("sdi12> ");
        std::io::stdout().flush().unwrap();
        line.clear();
        if stdin.read_line(&mut line).unwrap_or(0) == 0 {
            break; // EOF
        }
        let mut args = Args::new(&line);
        let result = match args.word() {
            None => continue,
            Some("help") | Some("h") => {
                print_help();
                continue;
            }
            Some("info") | Some("i") => cmd_info(&mut args, &sdi12),
            Some("change") | Some("a") => cmd_change(&mut args, &sdi12),
            Some("measure") | Some("m") => cmd_measure(&mut args, &sdi12, Method::Measure),
            Some("concurrent") | Some("c") => cmd_measure(&mut args, &sdi12, Method::Concurrent),
            Some("continuous") | Some("r") => cmd_measure(&mut args, &sdi12, Method::Continuous),
            Some("verify") | Some("v") => cmd_measure(&mut args, &sdi12, Method::Verify),
            Some("trans") | Some("t") => cmd_transparent(&mut args, &sdi12),
            Some("quit") | Some("q") => break,
            Some(other) => {
                println!("unknown command {:?}, try 'help'", other);
                continue;
            }
        };
        if let Err(err) = result {
            println!("error: {:#}", err);
        }
    }
}

/// Prompt-line tokenizer for the SDI-12 shaped arguments: sensor
/// addresses, the optional command variant index, the `crc` flag.
struct Args<'a> {
    words: SplitWhitespace<'a>,
}

impl<'a> Args<'a> {
    fn new(line: &'a str) -> Self {
        Args {
            words: line.split_whitespace(),
        }
    }

    fn word(&mut self) -> Option<&'a str> {
        self.words.next()
    }

    fn address(&mut self) -> Result<Address> {
        self.word()
            .context("sensor address expected")?
            .parse()
            .ok()
            .context("one of 0-9, A-Z or a-z expected")
    }

    /// Assemble a measurement request from `<addr> [index] [crc]`; the two
    /// trailing words may come in either order.
    fn measurement(&mut self, method: Method) -> Result<Request> {
        let mut request = Request::new(self.address()?, method);
        while let Some(word) = self.word() {
            if word == "crc" {
                request.use_crc = true;
            } else {
                request.index = word.parse().ok().context("variant index expected")?;
            }
        }
        Ok(request)
    }
}
