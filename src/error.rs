//! Library errors

use std::{
    fmt::{Display, Formatter},
    io,
};

use miette::Diagnostic;
use thiserror::Error;

use crate::{chip::Chip, command::CommandType};

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("Error while communicating with device")]
    #[diagnostic(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Chip not recognized, supported chip types are esp32, esp32-s2, and esp8266")]
    #[diagnostic(
        code(esploader::unrecognized_chip),
        help("If your chip is supported, try hard-resetting the device and try again")
    )]
    ChipDetect(#[from] ChipDetectError),

    #[error("No flash stub is available for the {0}")]
    #[diagnostic(
        code(esploader::unsupported_chip),
        help("Provide a stub binary for this chip, or stay on the ROM loader")
    )]
    UnsupportedChip(Chip),

    #[error("MAC address eFuses are blank, no OUI can be derived")]
    #[diagnostic(code(esploader::unknown_oui))]
    UnknownOui,

    #[error("Memory range {offset:#010x}..{end:#010x} overlaps the running stub")]
    #[diagnostic(
        code(esploader::stub_overlap),
        help("Hard-reset the device to return to the ROM loader before loading this range")
    )]
    StubOverlap { offset: u32, end: u32 },

    #[error("The {0} command is only supported by the flash stub")]
    #[diagnostic(code(esploader::stub_required))]
    StubRequired(CommandType),
}

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(esploader::serial_error))]
    Serial(#[source] serialport::Error),

    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(esploader::connection_failed),
        help("Ensure that the device is connected and the reset and boot pins are not being held down")
    )]
    ConnectionFailed,

    #[error("Serial port not found")]
    #[diagnostic(
        code(esploader::device_not_found),
        help("Ensure that the device is connected and your host recognizes the serial adapter")
    )]
    DeviceNotFound,

    #[error("Timeout while running {0}command")]
    #[diagnostic(code(esploader::timeout))]
    Timeout(TimedOutCommand),

    #[error("Response opcode {received:#04x} does not match the sent {expected} command")]
    #[diagnostic(code(esploader::invalid_response))]
    InvalidResponse { expected: CommandType, received: u8 },

    #[error("Received a malformed response packet")]
    #[diagnostic(
        code(esploader::malformed_response),
        help("Try hard-resetting the device and try again, if the error persists your rom might be corrupted")
    )]
    MalformedResponse,

    #[error("Invalid stub handshake response received")]
    #[diagnostic(code(esploader::stub_handshake))]
    InvalidStubHandshake,

    #[error("The serial reader is already running")]
    #[diagnostic(code(esploader::reader_running))]
    ReaderAlreadyRunning,

    #[error("The serial reader is not running")]
    #[diagnostic(code(esploader::reader_not_running))]
    ReaderNotRunning,

    #[error("No listener is registered on the serial reader")]
    #[diagnostic(code(esploader::not_listening))]
    NotListening,
}

/// The command that was being run when a timeout occurred, if any.
#[derive(Debug, Default, Clone)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl From<CommandType> for TimedOutCommand {
    fn from(command: CommandType) -> Self {
        TimedOutCommand {
            command: Some(command),
        }
    }
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Error)]
#[error("Unrecognized magic value {0:#x}")]
pub struct ChipDetectError(u32);

impl From<u32> for ChipDetectError {
    fn from(magic: u32) -> Self {
        ChipDetectError(magic)
    }
}

impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(kind) => from_error_kind(kind, err),
            serialport::ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        from_error_kind(err.kind(), err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

fn from_error_kind<E: Into<serialport::Error>>(kind: io::ErrorKind, err: E) -> ConnectionError {
    match kind {
        io::ErrorKind::TimedOut => ConnectionError::Timeout(TimedOutCommand::default()),
        io::ErrorKind::NotFound => ConnectionError::DeviceNotFound,
        _ => ConnectionError::Serial(err.into()),
    }
}

pub(crate) trait ResultExt {
    /// mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => {
                Err(Error::Connection(ConnectionError::Timeout(command.into())))
            }
            res => res,
        }
    }
}
