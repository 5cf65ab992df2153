//! Serial transport abstraction
//!
//! The driver needs three things from a serial port: a writable sink for
//! command frames, an independent readable source that the background
//! [Reader](crate::reader::Reader) can own, and control over the DTR/RTS
//! modem lines used to reset the chip into download mode.

use std::{io::Read, time::Duration};

use serialport::SerialPort;

use crate::error::ConnectionError;

/// Read timeout for the reader's half of the port. Short enough that the
/// background thread notices a shutdown request promptly.
const READ_CHUNK_TIMEOUT: Duration = Duration::from_millis(100);

/// An open serial link to the target device.
pub trait Transport: Send {
    /// Write an outbound frame in full.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ConnectionError>;

    /// Flush the outbound half.
    fn flush(&mut self) -> Result<(), ConnectionError>;

    /// Obtain an independent handle on the inbound byte stream.
    ///
    /// The handle must return from blocked reads within a bounded time so
    /// that its owner can observe shutdown requests.
    fn reader(&mut self) -> Result<Box<dyn Read + Send>, ConnectionError>;

    /// Drive the DTR and RTS modem lines.
    fn set_signals(&mut self, dtr: bool, rts: bool) -> Result<(), ConnectionError>;

    /// Reconfigure the link speed.
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), ConnectionError>;

    fn baud_rate(&self) -> Result<u32, ConnectionError>;
}

/// [Transport] backed by a [serialport] port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open the named port at the given baud rate.
    pub fn open(path: &str, baud: u32) -> Result<Self, ConnectionError> {
        let port = serialport::new(path, baud)
            .timeout(READ_CHUNK_TIMEOUT)
            .open()
            .map_err(ConnectionError::from)?;

        Ok(SerialTransport { port })
    }

    /// Wrap an already-open port.
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        SerialTransport { port }
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.port.write_all(bytes)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ConnectionError> {
        self.port.flush()?;
        Ok(())
    }

    fn reader(&mut self) -> Result<Box<dyn Read + Send>, ConnectionError> {
        let mut half = self.port.try_clone().map_err(ConnectionError::from)?;
        half.set_timeout(READ_CHUNK_TIMEOUT)
            .map_err(ConnectionError::from)?;

        Ok(Box::new(half))
    }

    fn set_signals(&mut self, dtr: bool, rts: bool) -> Result<(), ConnectionError> {
        self.port
            .write_data_terminal_ready(dtr)
            .map_err(ConnectionError::from)?;
        self.port
            .write_request_to_send(rts)
            .map_err(ConnectionError::from)?;

        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), ConnectionError> {
        self.port.set_baud_rate(baud).map_err(ConnectionError::from)
    }

    fn baud_rate(&self) -> Result<u32, ConnectionError> {
        self.port.baud_rate().map_err(ConnectionError::from)
    }
}
