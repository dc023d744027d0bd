//! Command bytes of the master/worker protocol.

use thiserror::Error;

/// One-byte command leading every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Positive acknowledgement; may carry a payload.
    Ok = 0,
    /// Worker's first frame; payload is its endian flag.
    Connect = 1,
    /// Submit a job configuration.
    AddJob = 2,
    /// Modify a submitted job.
    ModJob = 3,
    /// Remove a job.
    DelJob = 4,
    /// Request one part to process.
    GetWork = 5,
    /// Request the job list.
    GetJoblist = 6,
    /// Return finished parts.
    PutParts = 7,
    /// Host status of every connected peer.
    Stat = 8,
    /// Job status table.
    Jstat = 9,
    /// Part status table for one job.
    Pstat = 10,
    /// Fetch a job configuration by id.
    SlvCfg = 11,
    /// Worker I/O channel (reserved).
    SlvIo = 12,
    /// Worker result channel (reserved).
    SlvRes = 13,
    /// Worker rejected a part.
    SlvRej = 14,
    /// Deregister a worker.
    DelSlv = 15,
    /// Authentication (reserved).
    Auth = 16,
    /// Master's handshake reply; payload is its endian flag.
    Cfg = 17,
    /// Orderly connection close.
    Disconnect = 18,
    /// Attach a log stream.
    LogConnect = 19,
    /// Drop terminal jobs.
    Reset = 20,
    /// Shut the peer down.
    Die = 21,
    /// Negative acknowledgement; payload is a message.
    Err = 255,
}

impl Command {
    /// Decode a command byte.
    pub fn from_byte(v: u8) -> Result<Self, ProtocolError> {
        Ok(match v {
            0 => Self::Ok,
            1 => Self::Connect,
            2 => Self::AddJob,
            3 => Self::ModJob,
            4 => Self::DelJob,
            5 => Self::GetWork,
            6 => Self::GetJoblist,
            7 => Self::PutParts,
            8 => Self::Stat,
            9 => Self::Jstat,
            10 => Self::Pstat,
            11 => Self::SlvCfg,
            12 => Self::SlvIo,
            13 => Self::SlvRes,
            14 => Self::SlvRej,
            15 => Self::DelSlv,
            16 => Self::Auth,
            17 => Self::Cfg,
            18 => Self::Disconnect,
            19 => Self::LogConnect,
            20 => Self::Reset,
            21 => Self::Die,
            255 => Self::Err,
            other => return Err(ProtocolError::UnknownCommand(other)),
        })
    }
}

/// Failures on the framed link.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unrecognized command byte.
    #[error("unknown command byte {0}")]
    UnknownCommand(u8),

    /// Frame length beyond the sanity limit.
    #[error("frame of {got} bytes exceeds the {limit}-byte limit")]
    FrameTooLarge {
        /// Declared payload length.
        got: u64,
        /// Hard limit.
        limit: u64,
    },

    /// A command arrived that this peer does not accept in its state.
    #[error("unexpected command {0:?}")]
    UnexpectedCommand(Command),

    /// Peer replied ERR.
    #[error("peer error: {0}")]
    PeerError(String),

    /// Record could not be decoded.
    #[error(transparent)]
    Wire(#[from] shared::WireError),

    /// Socket failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_bytes_roundtrip() {
        for v in [0u8, 1, 2, 5, 7, 11, 17, 20, 21, 255] {
            let cmd = Command::from_byte(v).unwrap();
            assert_eq!(cmd as u8, v);
        }
        assert!(matches!(
            Command::from_byte(99),
            Err(ProtocolError::UnknownCommand(99))
        ));
    }
}
