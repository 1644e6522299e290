//! Parsers for the response frames the recorder receives.

use std::time::Duration;

use ascii::AsciiChar;
use nom::bytes::complete::{tag, take, take_while1, take_while_m_n};
use nom::character::complete::one_of;
use nom::combinator::{all_consuming, map_res, recognize};
use nom::sequence::{pair, tuple};
use nom::IResult;
use snafu::ensure;

use crate::types::Address;
use crate::{crc, ConversionToFloatSnafu, Error, Result, UnexpectedAnswerSnafu};

/// Every SDI-12 response ends with `<CR><LF>`.
pub(crate) const TERMINATOR: [u8; 2] = [
    AsciiChar::CarriageReturn as u8,
    AsciiChar::LineFeed as u8,
];

type Buf = [u8];

/// Parsed `atttn`…`atttnnn` start-measurement response.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct MeasurementHeader {
    pub address: u8,
    /// Announced delay until the data is ready.
    pub delay: Duration,
    /// Number of values the sensor will provide.
    pub count: usize,
}

/// Parsed `a<±value>…` data frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DataFrame {
    pub address: u8,
    pub values: Vec<f32>,
}

pub(crate) fn parse_measurement_header(frame: &Buf) -> Result<MeasurementHeader> {
    let result: IResult<&Buf, _> = all_consuming(tuple((
        take(1usize),
        take_while_m_n(3, 3, |c: u8| c.is_ascii_digit()),
        take_while_m_n(1, 3, |c: u8| c.is_ascii_digit()),
        tag(&TERMINATOR[..]),
    )))(frame);
    match result {
        Ok((_, (address, delay, count, _))) => Ok(MeasurementHeader {
            address: address[0],
            delay: Duration::from_secs(u64::from(ascii_num(delay))),
            count: ascii_num(count) as usize,
        }),
        Err(_) => UnexpectedAnswerSnafu.fail(),
    }
}

/// Parse a `aDn!`/`aRn!` response into floats, validating and stripping the
/// CRC trailer first when one was requested.
///
/// The value scanner only succeeds when it consumes input; a residue that
/// yields no value is a conversion failure, never a zero.
pub(crate) fn parse_data_frame(frame: &Buf, with_crc: bool) -> Result<DataFrame> {
    let body = frame
        .strip_suffix(&TERMINATOR)
        .ok_or(Error::UnexpectedAnswer)?;
    ensure!(!body.is_empty(), UnexpectedAnswerSnafu);
    let payload = if with_crc {
        crc::strip_verified(body)?
    } else {
        body
    };
    ensure!(!payload.is_empty(), UnexpectedAnswerSnafu);

    let address = payload[0];
    let mut rest = &payload[1..];
    let mut values = Vec::new();
    while !rest.is_empty() {
        match value(rest) {
            Ok((remaining, v)) => {
                rest = remaining;
                values.push(v);
            }
            Err(_) => return ConversionToFloatSnafu.fail(),
        }
    }
    Ok(DataFrame { address, values })
}

/// Validate an `aI!` response and return the identification text with the
/// address byte and terminator stripped.
pub(crate) fn parse_identification<'a>(frame: &'a Buf, address: Address) -> Result<&'a Buf> {
    let body = frame
        .strip_suffix(&TERMINATOR)
        .ok_or(Error::UnexpectedAnswer)?;
    ensure!(!body.is_empty(), UnexpectedAnswerSnafu);
    ensure!(body[0] == address.as_byte(), UnexpectedAnswerSnafu);
    Ok(&body[1..])
}

/// Parse a bare `b<CR><LF>` address echo (acknowledge and address-change
/// responses).
pub(crate) fn parse_address_echo(frame: &Buf) -> Result<u8> {
    match frame {
        [address, b'\r', b'\n'] => Ok(*address),
        _ => UnexpectedAnswerSnafu.fail(),
    }
}

/// One signed value: the sign doubles as the delimiter, digits and at most
/// one decimal point follow.
fn value(input: &Buf) -> IResult<&Buf, f32> {
    map_res(
        recognize(pair(
            one_of("+-"),
            take_while1(|c: u8| c.is_ascii_digit() || c == b'.'),
        )),
        |bytes: &Buf| String::from_utf8_lossy(bytes).parse::<f32>(),
    )(input)
}

fn ascii_num(digits: &Buf) -> u32 {
    digits
        .iter()
        .fold(0, |acc, d| acc * 10 + u32::from(d - b'0'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_header() {
        let h = parse_measurement_header(b"00013\r\n").unwrap();
        assert_eq!(
            h,
            MeasurementHeader {
                address: b'0',
                delay: Duration::from_secs(1),
                count: 3
            }
        );

        // concurrent sensors announce up to three digits
        let h = parse_measurement_header(b"5120123\r\n").unwrap();
        assert_eq!(h.address, b'5');
        assert_eq!(h.delay, Duration::from_secs(120));
        assert_eq!(h.count, 123);

        for bad in [
            &b"0\r\n"[..],
            b"000\r\n",
            b"00013",
            b"0001x\r\n",
            b"00013333\r\n",
        ] {
            assert!(matches!(
                parse_measurement_header(bad),
                Err(Error::UnexpectedAnswer)
            ));
        }
    }

    #[test]
    fn test_data_frame() {
        let f = parse_data_frame(b"0+1.23+4.56+7.89\r\n", false).unwrap();
        assert_eq!(f.address, b'0');
        assert_eq!(f.values, vec![1.23, 4.56, 7.89]);

        let f = parse_data_frame(b"0+1-2.5+3.\r\n", false).unwrap();
        assert_eq!(f.values, vec![1.0, -2.5, 3.0]);

        // empty response carries the address only
        let f = parse_data_frame(b"0\r\n", false).unwrap();
        assert!(f.values.is_empty());
    }

    #[test]
    fn test_data_frame_with_crc() {
        let f = parse_data_frame(b"0+3.14OqZ\r\n", true).unwrap();
        assert_eq!(f.values, vec![3.14]);

        assert!(matches!(
            parse_data_frame(b"0+3.14OqY\r\n", true),
            Err(Error::CrcError)
        ));
    }

    #[test]
    fn test_data_frame_conversion_failure() {
        // a sign with no digits advances nothing
        assert!(matches!(
            parse_data_frame(b"0+1.0+\r\n", false),
            Err(Error::ConversionToFloatError)
        ));
        // unexpected residue between values
        assert!(matches!(
            parse_data_frame(b"0+1.0abc\r\n", false),
            Err(Error::ConversionToFloatError)
        ));
        // more than one decimal point never parses as zero
        assert!(matches!(
            parse_data_frame(b"0+1.2.3\r\n", false),
            Err(Error::ConversionToFloatError)
        ));
    }

    #[test]
    fn test_identification() {
        let addr = Address::new('0').unwrap();
        let id = parse_identification(b"013CORPXXXXXXVVVSN01234567\r\n", addr).unwrap();
        assert_eq!(id, b"13CORPXXXXXXVVVSN01234567");
        assert!(parse_identification(b"113CORP\r\n", addr).is_err());
        assert!(parse_identification(b"013CORP", addr).is_err());
    }

    #[test]
    fn test_address_echo() {
        assert_eq!(parse_address_echo(b"1\r\n").unwrap(), b'1');
        assert!(parse_address_echo(b"12\r\n").is_err());
        assert!(parse_address_echo(b"1").is_err());
    }
}
