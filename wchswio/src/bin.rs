// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! wchswio binary API server
//!
//! Serves the protocol defined in the `wchswio-bin` crate over any
//! [`embedded_io`] byte stream, driving a [`DebugInterface`].

use alloc::vec::Vec;
use core::fmt;
use embedded_io::{Read, ReadExactError, Write};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use wchswio_bin::{Op, ParseError, ProtocolError, ResponseCode, VERSION};
use wchswio_core::rv::Gpr;

use crate::SwioError;
use crate::debug::{DebugInterface, ResetKind};
use crate::protocol::{ResetPin, SwioPin};

// Log every X binary API calls
const API_CALL_LOG_INTERVAL: usize = 1000;

/// Reasons a binary API session ended other than a clean disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiError {
    /// The stream failed on read or write
    Network,

    /// The client acknowledged the handshake with the wrong version
    Version(u8),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Network => write!(f, "network error"),
            ApiError::Version(v) => write!(f, "version mismatch 0x{v:02X}"),
        }
    }
}

/// Represents a binary API instance.
///
/// Create, then call [`Self::serve()`] to serve binary API requests on a
/// connected stream until the client disconnects.
pub struct Api {
    /// The number of binary API calls handled in this instance.
    pub binary_api_calls: usize,
}

impl Default for Api {
    fn default() -> Self {
        Api::new()
    }
}

impl Api {
    /// Creates a new instance of the binary API.
    pub fn new() -> Self {
        Api {
            binary_api_calls: 0,
        }
    }

    /// Serves the binary API on `stream` until the client disconnects, a
    /// malformed command is received, or the stream fails.
    ///
    /// Returns `Ok(())` if the session ended cleanly, including when the
    /// stream reached end of file between commands.
    pub fn serve<P, R, S>(
        &mut self,
        debug_if: &mut DebugInterface<P, R>,
        stream: &mut S,
    ) -> Result<(), ApiError>
    where
        P: SwioPin,
        R: ResetPin,
        S: Read + Write,
    {
        info!("Exec:  Binary API session started");

        let result = match self.main_loop(debug_if, stream) {
            Ok(Some(rsp)) => Self::send(stream, rsp, None),
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!("Error: Binary API exited {e}");
        }

        info!(
            "Note:  Binary API handled {} calls this session",
            self.binary_api_calls
        );
        result
    }

    // Performs the binary API handshake:
    // - Sends a version byte
    // - Reads the version ack
    fn handshake<S: Read + Write>(stream: &mut S) -> Result<(), ApiError> {
        debug!("Exec:  Binary API handshake");

        stream
            .write_all(&[VERSION])
            .and_then(|()| stream.flush())
            .map_err(|e| {
                warn!("Error: Binary API failed to send version: {e:?}");
                ApiError::Network
            })?;

        let mut version = [0u8; 1];
        stream.read_exact(&mut version).map_err(|e| {
            warn!("Error: Binary API failed to read version ack: {e:?}");
            ApiError::Network
        })?;

        if version[0] == VERSION {
            debug!("OK:    Binary API handshake complete");
            Ok(())
        } else {
            warn!(
                "Error: Binary API version mismatch: got 0x{:02X}, expected 0x{VERSION:02X}",
                version[0]
            );
            Err(ApiError::Version(version[0]))
        }
    }

    // The loop continues until a malformed command, a disconnect, or a
    // stream failure.  A final response code to send is returned for the
    // first two.  Stream failures return directly, as there is no point
    // trying to respond.
    //
    // Errors from the operations themselves are reported to the client and
    // the session continues.
    fn main_loop<P, R, S>(
        &mut self,
        debug_if: &mut DebugInterface<P, R>,
        stream: &mut S,
    ) -> Result<Option<ResponseCode>, ApiError>
    where
        P: SwioPin,
        R: ResetPin,
        S: Read + Write,
    {
        Self::handshake(stream)?;

        loop {
            let command = match Op::recv_cmd(stream) {
                Ok(command) => command,
                Err(ParseError::Transport(ReadExactError::UnexpectedEof)) => {
                    info!("Note:  Binary API client closed the stream");
                    break Ok(None);
                }
                Err(ParseError::Transport(e)) => {
                    warn!("Error: Binary API stream read failure {e:?}");
                    return Err(ApiError::Network);
                }
                Err(ParseError::Protocol(e)) => {
                    warn!("Error: Binary API received {e}");
                    break Ok(Some(ResponseCode::Cmd));
                }
            };

            let op = match Op::recv(command, stream) {
                Ok(op) => op,
                Err(ParseError::Protocol(ProtocolError::Arg)) => {
                    warn!("Error: Binary API received invalid argument on cmd {command}");
                    break Ok(Some(ResponseCode::Api));
                }
                Err(ParseError::Protocol(e)) => {
                    warn!("Error: Binary API failed to parse command {command}: {e}");
                    break Ok(Some(ResponseCode::Cmd));
                }
                Err(ParseError::Transport(e)) => {
                    warn!("Error: Binary API failed to read command {command} {e:?}");
                    return Err(ApiError::Network);
                }
            };

            if let Op::Disconnect = op {
                info!("Exec:  Binary API received disconnect command");
                break Ok(Some(ResponseCode::Ok));
            }

            trace!("Exec:  Binary API operation {op:#}");
            let (rsp, data) = match Self::handle_op(debug_if, op) {
                Ok(data) => (ResponseCode::Ok, data),
                Err(e) => {
                    warn!("Error: Binary API command {command} failed: {e}");
                    (response_from_swio_error(e), None)
                }
            };

            Self::send(stream, rsp, data.as_deref())?;

            self.binary_api_calls += 1;
            if self.binary_api_calls.is_multiple_of(API_CALL_LOG_INTERVAL) {
                info!(
                    "Note:  Binary API handled {} calls so far this session",
                    self.binary_api_calls
                );
            }
        }
    }

    fn send<S: Write>(
        stream: &mut S,
        rsp: ResponseCode,
        data: Option<&[u8]>,
    ) -> Result<(), ApiError> {
        trace!("Exec:  Binary API sending response {rsp}");
        stream.write_all(&[rsp as u8]).map_err(|e| {
            warn!("Error: Binary API failed to send response: {e:?}");
            ApiError::Network
        })?;
        if let Some(data) = data {
            trace!("Exec:  Binary API sending response data len: {}", data.len());
            stream.write_all(data).map_err(|e| {
                warn!("Error: Binary API failed to send response data: {e:?}");
                ApiError::Network
            })?;
        }
        stream.flush().map_err(|_| ApiError::Network)
    }

    // Handles a single binary API operation, returning any response data
    fn handle_op<P: SwioPin, R: ResetPin>(
        debug_if: &mut DebugInterface<P, R>,
        op: Op,
    ) -> Result<Option<Vec<u8>>, SwioError> {
        match op {
            Op::DmRead { addr } => debug_if
                .swio_if()
                .read_dm_register_raw(addr)
                .map(|data| Some(data.to_le_bytes().to_vec())),
            Op::DmWrite { addr, data } => debug_if
                .swio_if()
                .write_dm_register_raw(addr, data)
                .map(|()| None),
            Op::MemRead { addr } => debug_if
                .get_mem_u32(addr)
                .map(|data| Some(data.to_le_bytes().to_vec())),
            Op::MemWrite { addr, data } => debug_if.set_mem_u32(addr, data).map(|()| None),
            Op::GprRead { reg } => debug_if
                .get_gpr(Gpr(reg))
                .map(|data| Some(data.to_le_bytes().to_vec())),
            Op::GprWrite { reg, data } => debug_if.set_gpr(Gpr(reg), data).map(|()| None),
            Op::BlockRead { addr, count } => {
                let words = debug_if.get_block_aligned(addr, count as usize * 4)?;

                let mut response = Vec::with_capacity(2 + words.len() * 4);
                response.extend(count.to_le_bytes());
                response.extend(words.iter().flat_map(|word| word.to_le_bytes()));
                Ok(Some(response))
            }
            Op::ChipInfo => {
                let info = debug_if.get_chip_info()?;
                let mut response = Vec::with_capacity(14);
                response.extend(info.flash_size_kb.to_le_bytes());
                response.extend(info.uid.iter().flat_map(|word| word.to_le_bytes()));
                Ok(Some(response))
            }
            Op::Reset { kind } => debug_if.reset(reset_kind(kind)).map(|()| None),
            Op::Halt => debug_if.halt().map(|()| None),
            Op::Resume => debug_if.resume().map(|()| None),
            Op::IsHalted => debug_if
                .is_halted()
                .map(|halted| Some(alloc::vec![halted as u8])),
            Op::Unlock => debug_if.unlock().map(|()| None),
            Op::Lock => debug_if.lock().map(|()| None),
            Op::WipePage { addr } => debug_if.wipe_page(addr).map(|()| None),
            Op::WipeSector { addr } => debug_if.wipe_sector(addr).map(|()| None),
            Op::WipeChip => debug_if.wipe_chip().map(|()| None),
            Op::WriteFlash { addr, data } => debug_if.write_flash(addr, &data).map(|()| None),
            Op::Ping => Ok(None),
            Op::Disconnect => {
                unreachable!("Binary API Disconnect should be handled in the main loop")
            }
        }
    }
}

fn reset_kind(kind: wchswio_bin::ResetKind) -> ResetKind {
    match kind {
        wchswio_bin::ResetKind::ToHalt => ResetKind::ToHalt,
        wchswio_bin::ResetKind::ToRun => ResetKind::ToRun,
        wchswio_bin::ResetKind::ToRunNoCheck => ResetKind::ToRunNoCheck,
    }
}

fn response_from_swio_error(e: SwioError) -> ResponseCode {
    match e {
        SwioError::Timeout => ResponseCode::Timeout,
        SwioError::DirtyRegs(_) | SwioError::InvalidArgument => ResponseCode::Api,
        SwioError::ProgramRunError(_) | SwioError::ProgramNotFinishedYet => ResponseCode::Program,
        SwioError::ResetDetected
        | SwioError::ParityError
        | SwioError::TargetNotKnown(_)
        | SwioError::TargetInInvalidState
        | SwioError::NoFreeMemory => ResponseCode::Swio,
    }
}
