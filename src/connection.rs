//! Establish a connection with a target device
//!
//! [Connection] owns the serial transport and the background [Reader], and
//! layers the request/response command protocol on top: SLIP-framed commands
//! out, demultiplexed response packets back in.

use std::{thread::sleep, time::Duration};

use log::debug;

use crate::{
    buffer::ByteBuffer,
    command::{Command, CommandType, MAX_TIMEOUT},
    error::{ConnectionError, Error, ResultExt},
    reader::{ListenGuard, Reader},
    transport::Transport,
};

const MAX_CONNECT_ATTEMPTS: usize = 7;
const MAX_SYNC_ATTEMPTS: usize = 7;
const SYNC_RETRY_DELAY: Duration = Duration::from_millis(50);

/// A response always carries at least the direction byte, the echoed opcode,
/// the length word and the value word; with the two framing bytes that puts
/// the smallest interesting buffer at 12 bytes.
const RESPONSE_MIN_BUFFERED: usize = 12;

/// The value/data split of a decoded response packet.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub value: u32,
    pub data: Vec<u8>,
}

/// What a command transaction hands back to the caller: the trailing data
/// section when the response carries one beyond the status word, the value
/// word otherwise.
#[derive(Debug, Clone)]
pub enum CommandResponseValue {
    Value(u32),
    Data(Vec<u8>),
}

impl CommandResponseValue {
    pub(crate) fn as_value(&self) -> Result<u32, Error> {
        match self {
            CommandResponseValue::Value(value) => Ok(*value),
            CommandResponseValue::Data(_) => {
                Err(Error::Connection(ConnectionError::MalformedResponse))
            }
        }
    }
}

/// An established connection with a target device.
///
/// Operations take `&mut self`; overlapping transactions on one connection
/// are unrepresentable in safe code.
pub struct Connection {
    transport: Box<dyn Transport>,
    reader: Reader,
    baud: u32,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>, baud: u32) -> Self {
        Connection {
            transport,
            reader: Reader::new(),
            baud,
        }
    }

    /// Arm the background reader and enter the bootloader.
    ///
    /// Runs the full connect sequence: pulse the reset lines, wait for the
    /// boot banner to drain, then sync with the ROM loader, retrying the
    /// whole sequence a handful of times before giving up.
    pub fn begin(&mut self) -> Result<(), Error> {
        if !self.reader.is_running() {
            self.start_reader()?;
        }

        for attempt in 0..MAX_CONNECT_ATTEMPTS {
            debug!("Connect attempt {}", attempt + 1);
            if self.connect_attempt()? {
                // Consume whatever the ROM still has queued before the first
                // real command goes out.
                self.reader.wait_silent(1, Duration::from_millis(200))?;
                return Ok(());
            }
        }

        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    fn connect_attempt(&mut self) -> Result<bool, Error> {
        self.reset_to_bootloader()?;

        if !self.reader.wait_silent(20, Duration::from_secs(1))? {
            debug!("Line did not go quiet after reset");
            return Ok(false);
        }

        for _ in 0..MAX_SYNC_ATTEMPTS {
            match self.sync() {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(Error::Connection(
                    ConnectionError::Timeout(_)
                    | ConnectionError::InvalidResponse { .. }
                    | ConnectionError::MalformedResponse,
                )) => {}
                Err(err) => return Err(err),
            }
            sleep(SYNC_RETRY_DELAY);
        }

        Ok(false)
    }

    /// Pulse DTR/RTS to force the chip into its serial download mode.
    pub fn reset_to_bootloader(&mut self) -> Result<(), Error> {
        debug!("Resetting chip into download mode");

        self.transport.set_signals(false, true)?; // EN low, chip in reset
        sleep(Duration::from_millis(100));
        self.transport.set_signals(true, false)?; // IO0 low, EN high
        sleep(Duration::from_millis(50));
        self.transport.set_signals(false, false)?;

        Ok(())
    }

    /// Pulse RTS to reset the chip back into its application.
    pub fn hard_reset(&mut self) -> Result<(), Error> {
        sleep(Duration::from_millis(100));
        self.transport.set_signals(false, true)?;
        sleep(Duration::from_millis(100));
        self.transport.set_signals(false, false)?;

        Ok(())
    }

    /// Send one `SYNC` and check for a well-formed reply.
    pub fn sync(&mut self) -> Result<bool, Error> {
        let response = self.command(Command::Sync, CommandType::Sync.timeout())?;

        Ok(response.data.len() >= 2 && response.data[..2] == [0, 0])
    }

    /// Run one command transaction and return the full value/data split.
    pub fn command(
        &mut self,
        command: Command<'_>,
        timeout: Duration,
    ) -> Result<CommandResponse, Error> {
        let ty = command.command_type();

        // The listener must be in place before the first frame byte leaves,
        // otherwise a fast reply could be discarded.
        let _listen = self.reader.listen()?;
        self.write_command(&command)?;

        let timeout = Duration::min(timeout, MAX_TIMEOUT);
        let packet = self
            .reader
            .packet(RESPONSE_MIN_BUFFERED, timeout)
            .map_err(Error::from)
            .for_command(ty)?;

        if packet.len() < 8 {
            return Err(Error::Connection(ConnectionError::MalformedResponse));
        }
        if packet[1] != ty as u8 {
            return Err(Error::Connection(ConnectionError::InvalidResponse {
                expected: ty,
                received: packet[1],
            }));
        }

        let value = u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]);
        let data = packet[8..].to_vec();

        Ok(CommandResponse { value, data })
    }

    /// Run one command transaction and apply the value-vs-data rule.
    pub fn check_command(
        &mut self,
        command: Command<'_>,
        timeout: Duration,
    ) -> Result<CommandResponseValue, Error> {
        let response = self.command(command, timeout)?;

        if response.data.len() > 4 {
            Ok(CommandResponseValue::Data(response.data))
        } else {
            Ok(CommandResponseValue::Value(response.value))
        }
    }

    /// Frame and write a command without waiting for the reply.
    pub fn write_command(&mut self, command: &Command<'_>) -> Result<(), Error> {
        let ty = command.command_type();
        debug!("Writing {} command", ty);

        let mut payload = ByteBuffer::new();
        command.write_payload(&mut payload);

        let mut frame = ByteBuffer::with_capacity(payload.view().len() + 16);
        frame.push(0xC0);
        frame.push(0x00);
        frame.push(ty as u8);
        frame.pack("<H", &[payload.view().len() as u32]);
        frame.set_slip_encode(true);
        frame.pack("<I", &[command.checksum()]);
        frame.copy(payload.view());
        frame.set_slip_encode(false);
        frame.push(0xC0);

        self.transport.write_all(frame.view())?;
        self.transport.flush()?;

        Ok(())
    }

    /// Read a 32-bit register.
    pub fn read_reg(&mut self, address: u32) -> Result<u32, Error> {
        self.check_command(
            Command::ReadReg { address },
            CommandType::ReadReg.timeout(),
        )?
        .as_value()
    }

    /// Write a 32-bit register.
    pub fn write_reg(&mut self, address: u32, value: u32, mask: Option<u32>) -> Result<(), Error> {
        self.command(
            Command::WriteReg {
                address,
                value,
                mask,
            },
            CommandType::WriteReg.timeout(),
        )?;

        Ok(())
    }

    /// Reconfigure the link speed, cycling the reader around the change.
    pub fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        if let Some(err) = self.reader.stop() {
            return Err(err.into());
        }
        self.transport.set_baud_rate(baud)?;
        self.start_reader()?;
        self.baud = baud;

        Ok(())
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn start_reader(&mut self) -> Result<(), Error> {
        let source = self.transport.reader()?;
        self.reader.start(source)?;

        Ok(())
    }

    /// Stop the background reader, returning the error it terminated with
    /// instead of raising it.
    pub fn stop_reader(&mut self) -> Option<ConnectionError> {
        self.reader.stop()
    }

    /// Register a listener scope on the reader.
    pub fn listen(&self) -> Result<ListenGuard, Error> {
        Ok(self.reader.listen()?)
    }

    /// Wait for one SLIP packet; requires an active listener.
    pub fn read_packet(&self, min_len: usize, timeout: Duration) -> Result<Vec<u8>, Error> {
        Ok(self.reader.packet(min_len, timeout)?)
    }

    /// Wait for the line to go quiet; see [Reader::wait_silent].
    pub fn wait_silent(&self, retries: usize, timeout: Duration) -> Result<bool, Error> {
        Ok(self.reader.wait_silent(retries, timeout)?)
    }
}
