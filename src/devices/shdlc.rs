use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const FRAME_DELIMITER: u8 = 0x7E;
const ESCAPE: u8 = 0x7D;
const ESCAPE_XOR: u8 = 0x20;
const XON: u8 = 0x11;
const XOFF: u8 = 0x13;

/// Largest payload a single SHDLC frame can carry (the length field is one byte).
pub const MAX_PAYLOAD: usize = 255;

/// Address the SPS30 answers on.
pub const DEFAULT_ADDRESS: u8 = 0x00;

// The serial read timeout only bounds a single read call; the response
// deadline is enforced by the channel itself.
const READ_POLL_TIMEOUT: Duration = Duration::from_millis(50);
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Error, Debug)]
pub enum ShdlcError {
    #[error("Serial port error: {0}")]
    Transport(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("No response to command {command:#04x} within {timeout:?}")]
    Timeout { command: u8, timeout: Duration },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Device rejected command {command:#04x} with error code {code:#04x}")]
    DeviceState { command: u8, code: u8 },
}

pub type Result<T> = std::result::Result<T, ShdlcError>;

/// A channel that can run one SHDLC command and hand back the reply payload.
///
/// This is the seam between the device session and the wire: the real
/// implementation is [`ShdlcChannel`], tests plug in a scripted fake.
pub trait ShdlcPort {
    fn execute(&mut self, command: u8, data: &[u8]) -> Result<Vec<u8>>;
}

impl<P: ShdlcPort + ?Sized> ShdlcPort for &mut P {
    fn execute(&mut self, command: u8, data: &[u8]) -> Result<Vec<u8>> {
        (**self).execute(command, data)
    }
}

/// Decoded device-to-host frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MisoFrame {
    pub address: u8,
    pub command: u8,
    pub state: u8,
    pub data: Vec<u8>,
}

impl MisoFrame {
    /// Execution error code reported by the device, 0 on success.
    pub fn error_code(&self) -> u8 {
        self.state & 0x7F
    }

    /// Set when the device status register holds an error flag.
    pub fn device_error_flag(&self) -> bool {
        self.state & 0x80 != 0
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    !bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn stuff(bytes: &[u8], out: &mut Vec<u8>) {
    for &byte in bytes {
        match byte {
            FRAME_DELIMITER | ESCAPE | XON | XOFF => {
                out.push(ESCAPE);
                out.push(byte ^ ESCAPE_XOR);
            }
            _ => out.push(byte),
        }
    }
}

fn unstuff(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter();
    while let Some(&byte) = iter.next() {
        if byte == ESCAPE {
            match iter.next() {
                Some(&escaped) => out.push(escaped ^ ESCAPE_XOR),
                None => {
                    return Err(ShdlcError::Protocol(
                        "frame ends inside an escape sequence".to_string(),
                    ));
                }
            }
        } else {
            out.push(byte);
        }
    }
    Ok(out)
}

/// Builds a complete host-to-device frame, delimiters included.
pub fn encode_request(address: u8, command: u8, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() > MAX_PAYLOAD {
        return Err(ShdlcError::Protocol(format!(
            "request payload of {} bytes exceeds the {} byte frame limit",
            data.len(),
            MAX_PAYLOAD
        )));
    }

    let mut body = Vec::with_capacity(data.len() + 4);
    body.push(address);
    body.push(command);
    body.push(data.len() as u8);
    body.extend_from_slice(data);
    body.push(checksum(&body));

    let mut frame = Vec::with_capacity(body.len() * 2 + 2);
    frame.push(FRAME_DELIMITER);
    stuff(&body, &mut frame);
    frame.push(FRAME_DELIMITER);
    Ok(frame)
}

/// Decodes the bytes found between the two delimiters of a device reply.
pub fn decode_response(content: &[u8]) -> Result<MisoFrame> {
    let body = unstuff(content)?;
    if body.len() < 5 {
        return Err(ShdlcError::Protocol(format!(
            "response frame too short ({} bytes)",
            body.len()
        )));
    }

    let (header_and_data, received) = body.split_at(body.len() - 1);
    let calculated = checksum(header_and_data);
    if received[0] != calculated {
        return Err(ShdlcError::Protocol(format!(
            "checksum mismatch: received {:#04x}, calculated {:#04x}",
            received[0], calculated
        )));
    }

    let length = header_and_data[3] as usize;
    let data = &header_and_data[4..];
    if data.len() != length {
        return Err(ShdlcError::Protocol(format!(
            "length field announces {} bytes but frame carries {}",
            length,
            data.len()
        )));
    }

    Ok(MisoFrame {
        address: header_and_data[0],
        command: header_and_data[1],
        state: header_and_data[2],
        data: data.to_vec(),
    })
}

/// SHDLC master over any byte stream, normally a serial port.
pub struct ShdlcChannel<T = Box<dyn SerialPort>> {
    io: T,
    name: String,
    address: u8,
    timeout: Duration,
}

impl ShdlcChannel {
    /// Opens and configures the serial port (8N1, no flow control).
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        info!("Opening serial port {} at {} baud", port_name, baud_rate);
        let port = serialport::new(port_name, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_POLL_TIMEOUT)
            .open()
            .map_err(|e| {
                error!("Failed to open serial port {}: {}", port_name, e);
                ShdlcError::Transport(e)
            })?;
        info!("Serial port {} opened", port_name);
        Ok(Self::new(port, port_name, timeout))
    }
}

impl<T: Read + Write> ShdlcChannel<T> {
    pub fn new(io: T, name: impl Into<String>, timeout: Duration) -> Self {
        ShdlcChannel {
            io,
            name: name.into(),
            address: DEFAULT_ADDRESS,
            timeout,
        }
    }

    fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.io.write_all(frame)?;
        self.io.flush()?;
        Ok(())
    }

    /// Reads until one complete frame has arrived and returns what sits
    /// between its delimiters. Bytes before the first delimiter are noise.
    fn receive(&mut self, command: u8) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        let mut content = Vec::new();
        let mut in_frame = false;
        let mut byte = [0u8; 1];

        loop {
            if Instant::now() >= deadline {
                return Err(ShdlcError::Timeout {
                    command,
                    timeout: self.timeout,
                });
            }

            match self.io.read(&mut byte) {
                Ok(0) => {
                    std::thread::sleep(IDLE_BACKOFF);
                    continue;
                }
                Ok(_) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            if byte[0] == FRAME_DELIMITER {
                // Back-to-back delimiters: the second one opens the frame.
                if in_frame && !content.is_empty() {
                    return Ok(content);
                }
                in_frame = true;
                content.clear();
            } else if in_frame {
                content.push(byte[0]);
                // Fully stuffed maximum frame: 2 * (4 header + payload + checksum).
                if content.len() > 2 * (MAX_PAYLOAD + 5) {
                    return Err(ShdlcError::Protocol(
                        "response frame exceeds maximum size".to_string(),
                    ));
                }
            }
        }
    }
}

impl<T: Read + Write> ShdlcPort for ShdlcChannel<T> {
    fn execute(&mut self, command: u8, data: &[u8]) -> Result<Vec<u8>> {
        let request = encode_request(self.address, command, data)?;
        debug!("[{}] Sending frame: {:02X?}", self.name, request);
        self.send(&request)?;

        let content = self.receive(command)?;
        let frame = decode_response(&content)?;
        debug!(
            "[{}] Received frame for command {:#04x}: state {:#04x}, {} data bytes",
            self.name,
            frame.command,
            frame.state,
            frame.data.len()
        );

        if frame.address != self.address || frame.command != command {
            return Err(ShdlcError::Protocol(format!(
                "reply for address {:#04x} command {:#04x} does not match request for address {:#04x} command {:#04x}",
                frame.address, frame.command, self.address, command
            )));
        }

        if frame.error_code() != 0 {
            error!(
                "[{}] Device rejected command {:#04x} with error code {:#04x}",
                self.name,
                command,
                frame.error_code()
            );
            return Err(ShdlcError::DeviceState {
                command,
                code: frame.error_code(),
            });
        }

        if frame.device_error_flag() {
            warn!("[{}] Device status register reports an error flag", self.name);
        }

        Ok(frame.data)
    }
}
