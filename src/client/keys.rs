//! ANSI key sequences to Doorway mode codes.
//!
//! DOS doors read extended keys as `0x00` followed by the PC scan code.
//! Terminals send cursor and function keys as `ESC [ ...` or `ESC O ...`
//! sequences, which may arrive split across reads.

const ESC: u8 = 0x1B;
/// Longest sequence we try to recognise before giving up and passing it on.
const MAX_SEQUENCE: usize = 8;

#[derive(Debug, Default)]
pub struct KeyTranslator {
    pending: Vec<u8>,
}

impl KeyTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        for &b in data {
            if self.pending.is_empty() {
                if b == ESC {
                    self.pending.push(b);
                } else {
                    out.push(b);
                }
                continue;
            }
            if b == ESC {
                out.append(&mut self.pending);
                self.pending.push(b);
                continue;
            }
            self.pending.push(b);
            self.step(&mut out);
        }
        out
    }

    /// An escape sequence is waiting for more bytes.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Forward whatever is pending as-is, typically a lone Escape keypress.
    pub fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    fn step(&mut self, out: &mut Vec<u8>) {
        let seq = &self.pending[..];
        let complete = match seq {
            [ESC, b'[' | b'O'] => false,
            [ESC, b'O', _] => true,
            [ESC, b'[', .., last] => {
                !(last.is_ascii_digit() || *last == b';') || seq.len() >= MAX_SEQUENCE
            }
            _ => true,
        };
        if !complete {
            return;
        }
        match scan_code(seq) {
            Some(code) => out.extend_from_slice(&[0x00, code]),
            None => out.extend_from_slice(seq),
        }
        self.pending.clear();
    }
}

fn scan_code(seq: &[u8]) -> Option<u8> {
    match seq {
        [ESC, b'[' | b'O', final_byte] => match final_byte {
            b'A' => Some(0x48),
            b'B' => Some(0x50),
            b'C' => Some(0x4D),
            b'D' => Some(0x4B),
            b'H' => Some(0x47),
            b'F' => Some(0x4F),
            b'P' if seq[1] == b'O' => Some(0x3B),
            b'Q' if seq[1] == b'O' => Some(0x3C),
            b'R' if seq[1] == b'O' => Some(0x3D),
            b'S' if seq[1] == b'O' => Some(0x3E),
            _ => None,
        },
        [ESC, b'[', params @ .., b'~'] => {
            let n: u8 = std::str::from_utf8(params).ok()?.parse().ok()?;
            match n {
                1 | 7 => Some(0x47),
                2 => Some(0x52),
                3 => Some(0x53),
                4 | 8 => Some(0x4F),
                5 => Some(0x49),
                6 => Some(0x51),
                11..=15 => Some(0x3B + (n - 11)),
                17..=21 => Some(0x40 + (n - 17)),
                23 => Some(0x85),
                24 => Some(0x86),
                _ => None,
            }
        }
        _ => None,
    }
}
