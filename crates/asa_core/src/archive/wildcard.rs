//! The byte-stuffing layer nested archives apply under zlib.
//!
//! Escapes, as read from the inflated stream:
//!
//! | input          | output                              |
//! |----------------|-------------------------------------|
//! | `F0 b`         | `b`                                 |
//! | `F1 b`         | `F0 \| b >> 4`, `F0 \| b & 0x0F`    |
//! | `F2 n`         | `n` zero bytes                      |
//! | `F3`..=`FE`    | `byte & 0x0F` zero bytes            |
//! | `FF a b`       | `00 00 00 a 00 00 00 b 00 00 00`    |
//! | anything else  | itself                              |

use std::collections::VecDeque;
use std::io::{self, BufReader, Read};

use crate::error::{Result, SaveError};

const ESCAPE: u8 = 0xF0;
const NIBBLES: u8 = 0xF1;
const ZERO_RUN: u8 = 0xF2;
const MARKER: u8 = 0xFF;
const MAX_SHORT_RUN: usize = 0x0E;
const MIN_SHORT_RUN: usize = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Literal,
    Escaped,
    Nibbles,
    ZeroRun,
    Marker(Option<u8>),
}

/// Streaming reader that undoes the escapes above, one byte of lookahead at
/// a time.
#[derive(Debug)]
pub struct WildcardDecoder<R: Read> {
    inner: BufReader<R>,
    state: State,
    pending: VecDeque<u8>,
}

impl<R: Read> WildcardDecoder<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            state: State::Literal,
            pending: VecDeque::new(),
        }
    }

    fn zeros(&mut self, n: usize) {
        self.pending.extend(std::iter::repeat_n(0u8, n));
    }

    fn step(&mut self, byte: u8) {
        self.state = match self.state {
            State::Literal => match byte {
                ESCAPE => State::Escaped,
                NIBBLES => State::Nibbles,
                ZERO_RUN => State::ZeroRun,
                MARKER => State::Marker(None),
                0xF3..=0xFE => {
                    self.zeros(usize::from(byte & 0x0F));
                    State::Literal
                }
                _ => {
                    self.pending.push_back(byte);
                    State::Literal
                }
            },
            State::Escaped => {
                self.pending.push_back(byte);
                State::Literal
            }
            State::Nibbles => {
                self.pending.push_back(0xF0 | (byte >> 4));
                self.pending.push_back(0xF0 | (byte & 0x0F));
                State::Literal
            }
            State::ZeroRun => {
                self.zeros(usize::from(byte));
                State::Literal
            }
            State::Marker(None) => State::Marker(Some(byte)),
            State::Marker(Some(first)) => {
                self.pending
                    .extend([0, 0, 0, first, 0, 0, 0, byte, 0, 0, 0]);
                State::Literal
            }
        };
    }

    fn next_input(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl<R: Read> Read for WildcardDecoder<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        while self.pending.is_empty() {
            match self.next_input()? {
                Some(byte) => self.step(byte),
                None if self.state == State::Literal => return Ok(0),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("stream ends inside a wildcard escape ({:?})", self.state),
                    ));
                }
            }
        }

        let n = out.len().min(self.pending.len());
        for (slot, byte) in out.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

/// Undo the escapes over an in-memory buffer.
pub fn wildcard_inflate(escaped: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(escaped.len());
    WildcardDecoder::new(escaped)
        .read_to_end(&mut out)
        .map_err(|e| SaveError::Decompress(e.to_string()))?;
    Ok(out)
}

/// Escape `raw` so that [`wildcard_inflate`] restores it. Zero runs become
/// `F3..FE` or `F2 n`, bytes in `F0..=FF` are escaped with `F0`.
pub fn wildcard_deflate(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let byte = raw[i];
        if byte == 0 {
            let run = raw[i..]
                .iter()
                .take(usize::from(u8::MAX))
                .take_while(|&&b| b == 0)
                .count();
            match run {
                0..MIN_SHORT_RUN => out.extend(std::iter::repeat_n(0u8, run)),
                MIN_SHORT_RUN..=MAX_SHORT_RUN => out.push(0xF0 | run as u8),
                _ => out.extend([ZERO_RUN, run as u8]),
            }
            i += run;
            continue;
        }
        if byte >= ESCAPE {
            out.push(ESCAPE);
        }
        out.push(byte);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::{WildcardDecoder, wildcard_deflate, wildcard_inflate};
    use crate::error::SaveError;

    #[test]
    fn zero_run_with_explicit_count() {
        assert_eq!(wildcard_inflate(&[0xF2, 0x03]).unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn marker_record_places_both_bytes() {
        let out = wildcard_inflate(&[0xFF, 0x11, 0x22]).unwrap();
        assert_eq!(out.len(), 11);
        assert_eq!(out[3], 0x11);
        assert_eq!(out[7], 0x22);
        for (i, b) in out.iter().enumerate() {
            if i != 3 && i != 7 {
                assert_eq!(*b, 0, "byte {i}");
            }
        }
    }

    #[test]
    fn short_runs_escapes_and_nibbles() {
        let out = wildcard_inflate(&[0x41, 0xF5, 0xF0, 0xF7, 0xF1, 0xAB, 0x42]).unwrap();
        assert_eq!(out, vec![0x41, 0, 0, 0, 0, 0, 0xF7, 0xFA, 0xFB, 0x42]);
    }

    #[test]
    fn truncated_escape_is_an_error() {
        let err = wildcard_inflate(&[0x01, 0xFF, 0x11]).unwrap_err();
        assert!(matches!(err, SaveError::Decompress(_)));
    }

    #[test]
    fn deflate_output_inflates_back() {
        let mut raw = vec![7u8, 0, 0xF0, 0xFF, 0, 0, 0, 0, 9];
        raw.extend(std::iter::repeat_n(0u8, 300));
        raw.push(0xF3);
        let escaped = wildcard_deflate(&raw);
        assert!(escaped.len() < raw.len());
        assert_eq!(wildcard_inflate(&escaped).unwrap(), raw);
    }

    #[test]
    fn small_reads_see_the_same_stream() {
        let escaped = [0xF4, 0x05, 0xFF, 0x01, 0x02];
        let mut decoder = WildcardDecoder::new(&escaped[..]);
        let mut out = Vec::new();
        let mut chunk = [0u8; 3];
        loop {
            let n = decoder.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out, wildcard_inflate(&escaped).unwrap());
        assert_eq!(out.len(), 4 + 1 + 11);
    }
}
