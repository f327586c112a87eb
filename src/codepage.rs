//! Code page 437 translation and emulator stream encodings.
//!
//! DOS doors emit CP437 bytes (box drawing, shading, accented letters). The
//! browser and the WebSocket wire speak UTF-8, so every byte crossing the
//! bridge goes through one of the [`WireEncoding`] variants.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Unicode code points for CP437 bytes 0x80..=0xFF.
const CP437_HIGH: [char; 128] = [
    '\u{00C7}', '\u{00FC}', '\u{00E9}', '\u{00E2}', '\u{00E4}', '\u{00E0}', '\u{00E5}', '\u{00E7}',
    '\u{00EA}', '\u{00EB}', '\u{00E8}', '\u{00EF}', '\u{00EE}', '\u{00EC}', '\u{00C4}', '\u{00C5}',
    '\u{00C9}', '\u{00E6}', '\u{00C6}', '\u{00F4}', '\u{00F6}', '\u{00F2}', '\u{00FB}', '\u{00F9}',
    '\u{00FF}', '\u{00D6}', '\u{00DC}', '\u{00A2}', '\u{00A3}', '\u{00A5}', '\u{20A7}', '\u{0192}',
    '\u{00E1}', '\u{00ED}', '\u{00F3}', '\u{00FA}', '\u{00F1}', '\u{00D1}', '\u{00AA}', '\u{00BA}',
    '\u{00BF}', '\u{2310}', '\u{00AC}', '\u{00BD}', '\u{00BC}', '\u{00A1}', '\u{00AB}', '\u{00BB}',
    '\u{2591}', '\u{2592}', '\u{2593}', '\u{2502}', '\u{2524}', '\u{2561}', '\u{2562}', '\u{2556}',
    '\u{2555}', '\u{2563}', '\u{2551}', '\u{2557}', '\u{255D}', '\u{255C}', '\u{255B}', '\u{2510}',
    '\u{2514}', '\u{2534}', '\u{252C}', '\u{251C}', '\u{2500}', '\u{253C}', '\u{255E}', '\u{255F}',
    '\u{255A}', '\u{2554}', '\u{2569}', '\u{2566}', '\u{2560}', '\u{2550}', '\u{256C}', '\u{2567}',
    '\u{2568}', '\u{2564}', '\u{2565}', '\u{2559}', '\u{2558}', '\u{2552}', '\u{2553}', '\u{256B}',
    '\u{256A}', '\u{2518}', '\u{250C}', '\u{2588}', '\u{2584}', '\u{258C}', '\u{2590}', '\u{2580}',
    '\u{03B1}', '\u{00DF}', '\u{0393}', '\u{03C0}', '\u{03A3}', '\u{03C3}', '\u{00B5}', '\u{03C4}',
    '\u{03A6}', '\u{0398}', '\u{03A9}', '\u{03B4}', '\u{221E}', '\u{03C6}', '\u{03B5}', '\u{2229}',
    '\u{2261}', '\u{00B1}', '\u{2265}', '\u{2264}', '\u{2320}', '\u{2321}', '\u{00F7}', '\u{2248}',
    '\u{00B0}', '\u{2219}', '\u{00B7}', '\u{221A}', '\u{207F}', '\u{00B2}', '\u{25A0}', '\u{00A0}',
];

/// Byte written for characters CP437 cannot represent.
const UNMAPPABLE: u8 = b'?';

fn reverse_table() -> &'static HashMap<char, u8> {
    static TABLE: OnceLock<HashMap<char, u8>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut map: HashMap<char, u8> = CP437_HIGH
            .iter()
            .enumerate()
            .map(|(i, ch)| (*ch, 0x80 + i as u8))
            .collect();
        // Look-alikes that browsers and modern keyboards produce.
        map.insert('\u{03B2}', 0xE1);
        map.insert('\u{2205}', 0xED);
        map.insert('\u{2208}', 0xEE);
        map
    })
}

/// Decode CP437 bytes into a UTF-8 string. Bytes below 0x80 map to ASCII,
/// control characters included, so ANSI escape sequences survive.
pub fn decode_cp437(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b < 0x80 {
                b as char
            } else {
                CP437_HIGH[usize::from(b - 0x80)]
            }
        })
        .collect()
}

/// Encode a UTF-8 string into CP437 bytes. Characters with no CP437
/// equivalent become `?`.
pub fn encode_cp437(text: &str) -> Vec<u8> {
    let table = reverse_table();
    text.chars()
        .map(|ch| {
            if (ch as u32) < 0x80 {
                ch as u8
            } else {
                table.get(&ch).copied().unwrap_or(UNMAPPABLE)
            }
        })
        .collect()
}

/// Byte encoding used on the emulator side of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireEncoding {
    /// Legacy DOS code page; translated to and from UTF-8 at the bridge.
    Cp437,
    /// Host-native UTF-8 produced by the emulator itself; passed through.
    Native,
}

impl WireEncoding {
    /// Encode client text for the emulator.
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            WireEncoding::Cp437 => encode_cp437(text),
            WireEncoding::Native => text.as_bytes().to_vec(),
        }
    }
}

/// Incremental decoder for emulator output.
///
/// CP437 is stateless, but a native UTF-8 stream can split a multi-byte
/// sequence across reads, so the incomplete tail is held for the next chunk.
#[derive(Debug)]
pub struct StreamDecoder {
    encoding: WireEncoding,
    pending: Vec<u8>,
}

impl StreamDecoder {
    pub fn new(encoding: WireEncoding) -> Self {
        Self {
            encoding,
            pending: Vec::new(),
        }
    }

    /// Decode the next chunk of emulator output.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        match self.encoding {
            WireEncoding::Cp437 => decode_cp437(chunk),
            WireEncoding::Native => {
                self.pending.extend_from_slice(chunk);
                let mut text = String::with_capacity(self.pending.len());
                let mut start = 0;
                while start < self.pending.len() {
                    match std::str::from_utf8(&self.pending[start..]) {
                        Ok(valid) => {
                            text.push_str(valid);
                            start = self.pending.len();
                        }
                        Err(e) => {
                            let valid_end = start + e.valid_up_to();
                            text.push_str(&String::from_utf8_lossy(
                                &self.pending[start..valid_end],
                            ));
                            match e.error_len() {
                                // Invalid sequence mid-stream.
                                Some(len) => {
                                    text.push(char::REPLACEMENT_CHARACTER);
                                    start = valid_end + len;
                                }
                                // Incomplete tail: hold it for the next chunk.
                                None => {
                                    start = valid_end;
                                    break;
                                }
                            }
                        }
                    }
                }
                self.pending.drain(..start);
                text
            }
        }
    }
}
