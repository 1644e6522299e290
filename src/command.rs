//! Builders for the ASCII command strings the recorder sends.

use arrayvec::ArrayVec;
use snafu::ensure;

use crate::types::{Address, Method, Request};
use crate::{InvalidIndexSnafu, Result};

/// Longest command the recorder issues is five bytes (`aCC9!`).
pub(crate) type CommandBuf = ArrayVec<u8, 8>;

/// `a!` — acknowledge active.
pub(crate) fn acknowledge(address: Address) -> CommandBuf {
    let mut cmd = CommandBuf::new();
    cmd.push(address.as_byte());
    cmd.push(b'!');
    cmd
}

/// `aI!` — send identification.
pub(crate) fn identify(address: Address) -> CommandBuf {
    let mut cmd = CommandBuf::new();
    cmd.push(address.as_byte());
    cmd.push(b'I');
    cmd.push(b'!');
    cmd
}

/// `aAb!` — change address from `a` to `b`.
pub(crate) fn change_address(address: Address, new_address: Address) -> CommandBuf {
    let mut cmd = CommandBuf::new();
    cmd.push(address.as_byte());
    cmd.push(b'A');
    cmd.push(new_address.as_byte());
    cmd.push(b'!');
    cmd
}

/// Start-measurement command for the request's method and variant:
/// `aM!`/`aMC!`/`aMn!`/`aMCn!`, same for `C`, `aV!`, `aRn!`/`aRCn!`.
///
/// Verify has no CRC or indexed variant; continuous is always indexed per
/// SDI-12 v1.3.
pub(crate) fn measurement(request: &Request) -> Result<CommandBuf> {
    ensure!(request.index <= 9, InvalidIndexSnafu);
    let mut cmd = CommandBuf::new();
    cmd.push(request.address.as_byte());
    match request.method {
        Method::Measure | Method::Concurrent => {
            cmd.push(request.method.letter());
            if request.use_crc {
                cmd.push(b'C');
            }
            if request.index > 0 {
                cmd.push(b'0' + request.index);
            }
        }
        Method::Continuous => {
            cmd.push(b'R');
            if request.use_crc {
                cmd.push(b'C');
            }
            cmd.push(b'0' + request.index);
        }
        Method::Verify => cmd.push(b'V'),
        Method::Data => {
            cmd.push(b'D');
            cmd.push(b'0' + request.index);
        }
    }
    cmd.push(b'!');
    Ok(cmd)
}

/// `aDn!` — send data, index `0..=9`.
pub(crate) fn send_data(address: Address, index: u8) -> Result<CommandBuf> {
    ensure!(index <= 9, InvalidIndexSnafu);
    let mut cmd = CommandBuf::new();
    cmd.push(address.as_byte());
    cmd.push(b'D');
    cmd.push(b'0' + index);
    cmd.push(b'!');
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn request(method: Method, index: u8, use_crc: bool) -> Request {
        let mut r = Request::new(Address::new('0').unwrap(), method);
        r.index = index;
        r.use_crc = use_crc;
        r
    }

    #[test]
    fn test_fixed_commands() {
        let a = Address::new('3').unwrap();
        let b = Address::new('z').unwrap();
        assert_eq!(acknowledge(a).as_slice(), b"3!");
        assert_eq!(identify(a).as_slice(), b"3I!");
        assert_eq!(change_address(a, b).as_slice(), b"3Az!");
        assert_eq!(send_data(a, 4).unwrap().as_slice(), b"3D4!");
        assert!(matches!(send_data(a, 10), Err(Error::InvalidIndex)));
    }

    #[test]
    fn test_measurement_variants() {
        for (method, index, use_crc, expected) in [
            (Method::Measure, 0, false, &b"0M!"[..]),
            (Method::Measure, 0, true, b"0MC!"),
            (Method::Measure, 3, false, b"0M3!"),
            (Method::Measure, 3, true, b"0MC3!"),
            (Method::Concurrent, 0, false, b"0C!"),
            (Method::Concurrent, 0, true, b"0CC!"),
            (Method::Concurrent, 9, true, b"0CC9!"),
            (Method::Verify, 0, false, b"0V!"),
            (Method::Continuous, 0, false, b"0R0!"),
            (Method::Continuous, 5, false, b"0R5!"),
            (Method::Continuous, 5, true, b"0RC5!"),
            (Method::Data, 2, false, b"0D2!"),
        ] {
            let cmd = measurement(&request(method, index, use_crc)).unwrap();
            assert_eq!(cmd.as_slice(), expected);
        }
    }

    #[test]
    fn test_measurement_rejects_index_ten() {
        assert!(matches!(
            measurement(&request(Method::Measure, 10, false)),
            Err(Error::InvalidIndex)
        ));
    }
}
