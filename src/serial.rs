use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use serialport::{SerialPort, SerialPortType};
use std::io::{BufRead, ErrorKind, Read, Write};
use std::time::Duration;

use crate::error::TransportError;

/// FTDI vendor id used by the RAVEn USB stick.
pub const RAVEN_VID: u16 = 0x0403;
/// RAVEn product id.
pub const RAVEN_PID: u16 = 0x8A28;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Blocking source of raw lines.
pub trait LineSource {
    /// Next line including its terminator. End of stream and I/O faults are
    /// both errors; a read timeout is not.
    fn next_line(&mut self) -> Result<Vec<u8>, TransportError>;
}

/// Longest line accepted; the device's lines are well under 100 bytes.
pub const MAX_LINE_BYTES: usize = 4096;

/// Splits a byte stream into `\n`-terminated lines. Lines longer than
/// [`MAX_LINE_BYTES`] are dropped through their terminator.
pub struct Lines<R> {
    reader: R,
}

impl<R: BufRead> Lines<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Discard input up to and including the next `\n`, or to end of stream.
    fn skip_line(&mut self) -> Result<(), TransportError> {
        loop {
            let buf = match self.reader.fill_buf() {
                Ok(buf) => buf,
                Err(e) if is_retryable(&e) => continue,
                Err(e) => return Err(TransportError::Io(e)),
            };
            if buf.is_empty() {
                return Ok(());
            }
            let (done, used) = match buf.iter().position(|&b| b == b'\n') {
                Some(end) => (true, end + 1),
                None => (false, buf.len()),
            };
            self.reader.consume(used);
            if done {
                return Ok(());
            }
        }
    }
}

impl<R: BufRead> LineSource for Lines<R> {
    fn next_line(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut line = Vec::new();
        loop {
            // Bytes read before a timeout stay in `line`; keep appending.
            let room = (MAX_LINE_BYTES - line.len()) as u64;
            match (&mut self.reader).take(room).read_until(b'\n', &mut line) {
                Ok(0) if line.is_empty() => return Err(TransportError::Closed),
                Ok(_) if line.ends_with(b"\n") => return Ok(line),
                Ok(_) if line.len() >= MAX_LINE_BYTES => {
                    warn!("Dropping line longer than {} bytes", MAX_LINE_BYTES);
                    self.skip_line()?;
                    line.clear();
                }
                Ok(_) => return Ok(line),
                Err(e) if is_retryable(&e) => {
                    debug!("Serial read interrupted, waiting");
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }
}

/// Serial read timeouts are routine, not faults.
fn is_retryable(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted)
}

/// Open the serial port 8N1 at the given baud rate.
pub fn open_port(path: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn SerialPort>> {
    let port = serialport::new(path, baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(timeout)
        .open()
        .with_context(|| format!("Failed to open serial port {}", path))?;
    Ok(port)
}

/// Find the first USB serial port with the RAVEn's vendor and product id.
pub fn find_raven_port() -> Result<String> {
    let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;

    let found = ports.into_iter().find(|p| match &p.port_type {
        SerialPortType::UsbPort(usb) => usb.vid == RAVEN_VID && usb.pid == RAVEN_PID,
        _ => false,
    });

    match found {
        Some(port) => {
            info!("Found RAVEn on port {}", port.port_name);
            Ok(port.port_name)
        }
        None => bail!(
            "No USB serial port with id {:04x}:{:04x} found",
            RAVEN_VID,
            RAVEN_PID
        ),
    }
}

/// Render a device command, e.g. `get_current_summation_delivered`.
pub fn command_frame(name: &str) -> String {
    format!("<Command>\r\n<Name>{}</Name>\r\n</Command>\r\n", name)
}

/// Ask the device to send a summation now rather than on its own schedule.
pub fn request_summation<W: Write + ?Sized>(port: &mut W) -> Result<()> {
    port.write_all(command_frame("get_current_summation_delivered").as_bytes())
        .context("Failed to send summation request")?;
    port.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor};

    #[test]
    fn splits_lines_keeping_terminators() {
        let mut lines = Lines::new(Cursor::new(b"<A>\r\n\0\r\n</A>".to_vec()));
        assert_eq!(lines.next_line().unwrap(), b"<A>\r\n");
        assert_eq!(lines.next_line().unwrap(), b"\0\r\n");
        assert_eq!(lines.next_line().unwrap(), b"</A>");
        assert!(matches!(lines.next_line(), Err(TransportError::Closed)));
    }

    #[test]
    fn empty_line_is_not_end_of_stream() {
        let mut lines = Lines::new(Cursor::new(b"\n".to_vec()));
        assert_eq!(lines.next_line().unwrap(), b"\n");
        assert!(matches!(lines.next_line(), Err(TransportError::Closed)));
    }

    /// Yields a timeout between each chunk, like a serial port with a read timeout.
    struct Stuttering {
        chunks: Vec<&'static [u8]>,
        timed_out: bool,
    }

    impl Read for Stuttering {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.timed_out && !self.chunks.is_empty() {
                self.timed_out = true;
                return Err(std::io::Error::new(ErrorKind::TimedOut, "timeout"));
            }
            self.timed_out = false;
            if self.chunks.is_empty() {
                return Ok(0);
            }
            let chunk = self.chunks.remove(0);
            buf[..chunk.len()].copy_from_slice(chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn timeouts_are_retried_without_losing_bytes() {
        let reader = Stuttering {
            chunks: vec![b"<Dem", b"and>0x1</Demand>\n"],
            timed_out: false,
        };
        let mut lines = Lines::new(BufReader::new(reader));
        assert_eq!(lines.next_line().unwrap(), b"<Demand>0x1</Demand>\n");
        assert!(matches!(lines.next_line(), Err(TransportError::Closed)));
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(ErrorKind::BrokenPipe, "unplugged"))
        }
    }

    #[test]
    fn io_fault_is_a_transport_error() {
        let mut lines = Lines::new(BufReader::new(Broken));
        assert!(matches!(lines.next_line(), Err(TransportError::Io(_))));
    }

    #[test]
    fn summation_request_frame() {
        let mut out = Vec::new();
        request_summation(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "<Command>\r\n<Name>get_current_summation_delivered</Name>\r\n</Command>\r\n"
        );
    }

    #[test]
    fn overlong_line_is_dropped() {
        let mut input = vec![b'x'; MAX_LINE_BYTES + 100];
        input.extend_from_slice(b"\r\n<Demand>0x1</Demand>\n");
        let mut lines = Lines::new(Cursor::new(input));
        assert_eq!(lines.next_line().unwrap(), b"<Demand>0x1</Demand>\n");
        assert!(matches!(lines.next_line(), Err(TransportError::Closed)));
    }

    #[test]
    fn overlong_line_at_end_of_stream_closes() {
        let mut lines = Lines::new(Cursor::new(vec![0xFFu8; MAX_LINE_BYTES * 3]));
        assert!(matches!(lines.next_line(), Err(TransportError::Closed)));
    }

    #[test]
    fn line_of_exactly_max_bytes_is_kept() {
        let mut input = vec![b'x'; MAX_LINE_BYTES - 1];
        input.push(b'\n');
        let mut lines = Lines::new(Cursor::new(input.clone()));
        assert_eq!(lines.next_line().unwrap(), input);
    }
}
