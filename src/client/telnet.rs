//! Telnet stream handling for the door client.

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

pub const ECHO: u8 = 1;
pub const SUPPRESS_GO_AHEAD: u8 = 3;
pub const NAWS: u8 = 31;

/// Negotiation sent on connect: character mode, no local echo, report size.
pub fn negotiation_preamble() -> Vec<u8> {
    vec![
        IAC, WILL, ECHO,
        IAC, WILL, SUPPRESS_GO_AHEAD,
        IAC, DO, SUPPRESS_GO_AHEAD,
        IAC, DO, NAWS,
    ]
}

/// Double every 0xFF so it survives as data on a telnet stream.
pub fn escape_iac(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    for &b in bytes {
        out.push(b);
        if b == IAC {
            out.push(IAC);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    Iac,
    Option,
    Subneg,
    SubnegIac,
}

/// Strips telnet commands from caller input.
///
/// State carries across calls, so commands split between reads are handled.
/// `CR LF` and `CR NUL` collapse to `CR`; other NULs are dropped.
#[derive(Debug)]
pub struct TelnetFilter {
    state: State,
    after_cr: bool,
    subneg: Vec<u8>,
    window_size: Option<(u16, u16)>,
}

impl Default for TelnetFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl TelnetFilter {
    pub fn new() -> Self {
        Self {
            state: State::Normal,
            after_cr: false,
            subneg: Vec::new(),
            window_size: None,
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        for &b in data {
            match self.state {
                State::Normal => match b {
                    IAC => self.state = State::Iac,
                    b'\n' | 0 if self.after_cr => self.after_cr = false,
                    0 => {}
                    _ => {
                        self.after_cr = b == b'\r';
                        out.push(b);
                    }
                },
                State::Iac => match b {
                    IAC => {
                        self.state = State::Normal;
                        self.after_cr = false;
                        out.push(IAC);
                    }
                    WILL | WONT | DO | DONT => self.state = State::Option,
                    SB => {
                        self.subneg.clear();
                        self.state = State::Subneg;
                    }
                    _ => self.state = State::Normal,
                },
                State::Option => self.state = State::Normal,
                State::Subneg => match b {
                    IAC => self.state = State::SubnegIac,
                    _ => self.subneg.push(b),
                },
                State::SubnegIac => match b {
                    SE => {
                        self.finish_subnegotiation();
                        self.state = State::Normal;
                    }
                    IAC => {
                        self.subneg.push(IAC);
                        self.state = State::Subneg;
                    }
                    _ => self.state = State::Subneg,
                },
            }
        }
        out
    }

    /// Most recent NAWS report, cleared once taken.
    pub fn take_window_size(&mut self) -> Option<(u16, u16)> {
        self.window_size.take()
    }

    fn finish_subnegotiation(&mut self) {
        if let [NAWS, w0, w1, h0, h1] = self.subneg[..] {
            self.window_size = Some((
                u16::from_be_bytes([w0, w1]),
                u16::from_be_bytes([h0, h1]),
            ));
        }
        self.subneg.clear();
    }
}
