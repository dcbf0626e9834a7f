//! SLCAN (Lawicel ASCII) adapter over a native serial port.
//!
//! USB CAN dongles running stock slcan firmware enumerate as a serial port
//! and speak a line-based ASCII protocol:
//!
//! ```text
//! S6\r                 set bitrate (500 kbit/s)
//! O\r                  open channel
//! t7008000400...\r     standard frame: id(3 hex) dlc(1 hex) data(2 hex/byte)
//! T000007008...\r      extended frame: id(8 hex) dlc(1 hex) data
//! C\r                  close channel
//! ```
//!
//! The adapter acknowledges commands with `\r` (or `z`/`Z` after a
//! transmit) and reports errors with BEL (`0x07`).

use {
    crate::{
        error::{Error, Result},
        port::{CanBus, CanFrame, MAX_DATA_LEN},
    },
    log::{debug, trace},
    std::{
        io::{Read, Write},
        thread,
        time::{Duration, Instant},
    },
};

/// Serial baud rate used to talk to the adapter.
pub const DEFAULT_SERIAL_BAUD: u32 = 115200;

/// CAN bitrate used by the bootloader.
pub const DEFAULT_BITRATE: u32 = 500_000;

/// Longest single blocking read while polling for a frame.
const READ_SLICE: Duration = Duration::from_millis(10);

/// Delay after open/close commands so the adapter settles.
const COMMAND_DELAY: Duration = Duration::from_millis(20);

const CR: u8 = b'\r';
const BEL: u8 = 0x07;

/// Map a CAN bitrate to its `S<n>` setup code.
pub fn bitrate_code(bitrate: u32) -> Result<u8> {
    match bitrate {
        10_000 => Ok(b'0'),
        20_000 => Ok(b'1'),
        50_000 => Ok(b'2'),
        100_000 => Ok(b'3'),
        125_000 => Ok(b'4'),
        250_000 => Ok(b'5'),
        500_000 => Ok(b'6'),
        800_000 => Ok(b'7'),
        1_000_000 => Ok(b'8'),
        _ => Err(Error::Config(format!(
            "Unsupported SLCAN bitrate {bitrate} (use 10k, 20k, 50k, 100k, 125k, 250k, 500k, 800k or 1M)"
        ))),
    }
}

/// Encode a frame as an SLCAN transmit command, including the trailing `\r`.
pub fn encode_frame(frame: &CanFrame) -> Vec<u8> {
    let mut line = if frame.is_extended() {
        format!("T{:08X}{:X}", frame.id(), frame.dlc())
    } else {
        format!("t{:03X}{:X}", frame.id(), frame.dlc())
    };
    for byte in frame.data() {
        line.push_str(&format!("{byte:02X}"));
    }
    let mut bytes = line.into_bytes();
    bytes.push(CR);
    bytes
}

/// Parse one received SLCAN line (without the trailing `\r`).
///
/// Returns `None` for acknowledgements, remote frames, status replies and
/// malformed input. Trailing timestamp digits are ignored.
pub fn parse_frame(line: &[u8]) -> Option<CanFrame> {
    let (extended, id_len) = match line.first()? {
        b't' => (false, 3),
        b'T' => (true, 8),
        _ => return None,
    };
    let id = parse_hex(line.get(1..=id_len)?)?;
    let dlc = usize::try_from(parse_hex(line.get(id_len + 1..=id_len + 1)?)?).ok()?;
    if dlc > MAX_DATA_LEN {
        return None;
    }
    let start = id_len + 2;
    let hex = line.get(start..start + dlc * 2)?;
    let mut data = [0u8; MAX_DATA_LEN];
    for (i, pair) in hex.chunks(2).enumerate() {
        data[i] = u8::try_from(parse_hex(pair)?).ok()?;
    }
    if extended {
        CanFrame::new_extended(id, &data[..dlc]).ok()
    } else {
        CanFrame::new(u16::try_from(id).ok()?, &data[..dlc]).ok()
    }
}

fn parse_hex(digits: &[u8]) -> Option<u32> {
    let text = std::str::from_utf8(digits).ok()?;
    u32::from_str_radix(text, 16).ok()
}

/// List serial port names that could host an SLCAN adapter.
pub fn available_ports() -> Result<Vec<String>> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|p| p.port_name)
        .collect())
}

/// SLCAN adapter on a native serial port.
pub struct SlcanPort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    bitrate: u32,
    rx: Vec<u8>,
}

impl SlcanPort {
    /// Open the serial port and bring the CAN channel up at `bitrate`.
    pub fn open(port_name: &str, bitrate: u32) -> Result<Self> {
        let code = bitrate_code(bitrate)?;
        let port = serialport::new(port_name, DEFAULT_SERIAL_BAUD)
            .timeout(READ_SLICE)
            .open()?;

        let mut slcan = Self {
            port: Some(port),
            name: port_name.to_string(),
            bitrate,
            rx: Vec::new(),
        };

        // Close any channel left open by a previous session, ignoring the reply
        slcan.write_command(b"C\r")?;
        thread::sleep(COMMAND_DELAY);
        slcan.write_command(&[b'S', code, CR])?;
        slcan.write_command(b"O\r")?;
        thread::sleep(COMMAND_DELAY);
        if let Some(ref mut p) = slcan.port {
            p.clear(serialport::ClearBuffer::Input)?;
        }

        debug!("Opened SLCAN channel on {port_name} at {bitrate} bit/s");
        Ok(slcan)
    }

    /// CAN bitrate the channel was opened with.
    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| Error::Transport(format!("{} is closed", self.name)))
    }

    fn write_command(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.port_mut()?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    /// Pop the next complete line out of the receive buffer.
    fn next_line(&mut self) -> Option<Vec<u8>> {
        let end = self
            .rx
            .iter()
            .position(|&b| b == CR || b == BEL)?;
        let mut line: Vec<u8> = self.rx.drain(..=end).collect();
        if line.pop() == Some(BEL) {
            trace!("SLCAN adapter reported an error");
        }
        Some(line)
    }
}

impl CanBus for SlcanPort {
    fn send(&mut self, frame: &CanFrame, timeout: Duration) -> Result<()> {
        let bytes = encode_frame(frame);
        let name = self.name.clone();
        let port = self.port_mut()?;
        port.set_timeout(timeout)?;
        let result = port.write_all(&bytes).and_then(|()| port.flush());
        port.set_timeout(READ_SLICE)?;
        result.map_err(|e| Error::Transport(format!("send on {name} failed: {e}")))
    }

    fn try_receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 64];

        loop {
            while let Some(line) = self.next_line() {
                if let Some(frame) = parse_frame(&line) {
                    return Ok(Some(frame));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let port = self.port_mut()?;
            port.set_timeout(remaining.min(READ_SLICE))?;
            match port.read(&mut buf) {
                Ok(n) => self.rx.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        if self.port.is_some() {
            let _ = self.write_command(b"C\r");
        }
        // Take ownership of the port and let it drop (close)
        self.port.take();
        Ok(())
    }
}

impl Drop for SlcanPort {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
