use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::types::RetainPolicy;

/// Leading byte of every response frame sent by the watch
pub const RESPONSE_MARKER: u8 = 0x10;

/// Status byte meaning success
pub const STATUS_SUCCESS: u8 = 0x01;

/// Length of the authentication nonce and of its ciphertext
pub const NONCE_LEN: usize = 16;

/// Length of every fetch negotiation command
pub const FETCH_COMMAND_LEN: usize = 10;

/// Auth opcodes, shared by requests and the `10 <opcode> <status>` responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthOpcode {
    /// Key exchange / pairing
    SendKey = 0x01,
    /// Ask the watch for a random nonce
    RequestRandom = 0x02,
    /// Send the encrypted nonce
    SendEncrypted = 0x03,
}

/// "Request random" command: `02 00`
pub const AUTH_REQUEST_RANDOM: [u8; 2] = [AuthOpcode::RequestRandom as u8, 0x00];

/// Fetch control opcodes, shared by requests and responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FetchOpcode {
    /// Negotiate what to fetch (`01 <class> <filter>`)
    Negotiate = 0x01,
    /// Start streaming / transfer status
    Transfer = 0x02,
    /// End-of-transfer acknowledgement
    Acknowledge = 0x03,
}

/// Record class requested from the watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ActivityClass {
    /// Minute-level history (steps, sleep, heart rate)
    History = 0x01,
    /// Workout tracks with GPS fixes
    SportsDetails = 0x06,
    /// Force-authorize header used as a last resort
    Authorize = 0x10,
}

/// One inbound frame on the auth endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFrame {
    /// `10 02 01 <nonce>`
    Challenge([u8; NONCE_LEN]),
    /// `10 03 01`
    Accepted,
    /// `10 <opcode> <status != 01>`
    Rejected {
        /// Opcode the response refers to
        opcode: u8,
        /// Status byte
        status: u8,
    },
    /// `10 02 01` carrying fewer than 16 nonce bytes
    MalformedChallenge,
}

impl AuthFrame {
    /// Parse an auth notification
    ///
    /// Returns `None` for frames that are not handshake responses.
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        let (&marker, rest) = data.split_first()?;
        if marker != RESPONSE_MARKER || rest.len() < 2 {
            return None;
        }

        let opcode = rest[0];
        let status = rest[1];
        if status != STATUS_SUCCESS {
            return Some(Self::Rejected { opcode, status });
        }

        match opcode {
            op if op == AuthOpcode::RequestRandom as u8 => {
                let nonce = &rest[2..];
                if nonce.len() < NONCE_LEN {
                    return Some(Self::MalformedChallenge);
                }
                let mut challenge = [0u8; NONCE_LEN];
                challenge.copy_from_slice(&nonce[..NONCE_LEN]);
                Some(Self::Challenge(challenge))
            }
            op if op == AuthOpcode::SendEncrypted as u8 => Some(Self::Accepted),
            _ => None,
        }
    }
}

/// Build the `03 00 <ciphertext>` handshake response
#[must_use]
pub fn auth_response(ciphertext: &[u8; NONCE_LEN]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + NONCE_LEN);
    buf.put_u8(AuthOpcode::SendEncrypted as u8);
    buf.put_u8(0x00);
    buf.extend_from_slice(ciphertext);
    buf.freeze()
}

/// Commands written to the fetch control endpoint
///
/// The negotiation variants share one 10-byte layout observed on the wire:
///
/// ```text
/// 01 <class> <year u16 LE> <month> <day> <hour> <minute> 00 00
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchCommand {
    /// Phase 1: class + date-only filter
    DirectFetch {
        /// Record class
        class: ActivityClass,
        /// Start-date filter
        since: NaiveDateTime,
    },
    /// Phase 2: class + minute-resolution filter
    Secondary {
        /// Record class
        class: ActivityClass,
        /// Start-date filter
        since: NaiveDateTime,
    },
    /// Phase 3: authorize header with an all-zero filter
    EmergencyAuthorize,
    /// `02`: begin streaming
    StartTransfer,
    /// `02`: flow-control nudge while streaming
    KeepAlive,
    /// `03 <flag>`: end-of-transfer acknowledgement
    TransferAck(RetainPolicy),
}

impl FetchCommand {
    /// Serialize command to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        match *self {
            Self::DirectFetch { class, since } => negotiate(class, Some((since, false))),
            Self::Secondary { class, since } => negotiate(class, Some((since, true))),
            Self::EmergencyAuthorize => negotiate(ActivityClass::Authorize, None),
            Self::StartTransfer | Self::KeepAlive => {
                Bytes::from_static(&[FetchOpcode::Transfer as u8])
            }
            Self::TransferAck(retain) => {
                let flag = match retain {
                    RetainPolicy::Keep => 0x09,
                    RetainPolicy::Delete => 0x01,
                };
                Bytes::from(vec![FetchOpcode::Acknowledge as u8, flag])
            }
        }
    }

    /// Short name for logs
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::DirectFetch { .. } => "DIRECT_FETCH",
            Self::Secondary { .. } => "SECONDARY",
            Self::EmergencyAuthorize => "EMERGENCY_AUTHORIZE",
            Self::StartTransfer => "START_TRANSFER",
            Self::KeepAlive => "KEEP_ALIVE",
            Self::TransferAck(_) => "TRANSFER_ACK",
        }
    }
}

fn negotiate(class: ActivityClass, filter: Option<(NaiveDateTime, bool)>) -> Bytes {
    let mut buf = BytesMut::with_capacity(FETCH_COMMAND_LEN);
    buf.put_u8(FetchOpcode::Negotiate as u8);
    buf.put_u8(class as u8);

    if let Some((since, with_time)) = filter {
        buf.put_u16_le(u16::try_from(since.year()).unwrap_or(0));
        buf.put_u8(since.month() as u8);
        buf.put_u8(since.day() as u8);
        if with_time {
            buf.put_u8(since.hour() as u8);
            buf.put_u8(since.minute() as u8);
        } else {
            buf.put_u16(0);
        }
    }

    buf.resize(FETCH_COMMAND_LEN, 0);
    buf.freeze()
}

/// Status frames received on the fetch control endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    /// `10 01 01 [count u32 LE]`: request accepted
    FetchAccepted {
        /// Pending record count, when the firmware reports one
        expected: Option<u32>,
    },
    /// `10 01 02`: request refused, try another variant
    FetchRejected,
    /// `10 02 01`: end of transfer
    TransferEnded,
    /// `10 02 <status != 01>`: transfer aborted by the watch
    TransferFailed {
        /// Status byte
        status: u8,
    },
    /// Any other `10 <opcode> <status>` frame
    Other {
        /// Opcode byte
        opcode: u8,
        /// Status byte
        status: u8,
    },
}

impl ControlFrame {
    /// Parse a control notification
    ///
    /// Returns `None` unless the frame starts with the response marker and
    /// carries at least an opcode and a status.
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 3 || data[0] != RESPONSE_MARKER {
            return None;
        }

        let mut buf = &data[1..];
        let opcode = buf.get_u8();
        let status = buf.get_u8();

        let frame = match (opcode, status) {
            (0x01, STATUS_SUCCESS) => Self::FetchAccepted {
                expected: (buf.remaining() >= 4).then(|| buf.get_u32_le()),
            },
            (0x01, 0x02) => Self::FetchRejected,
            (0x02, STATUS_SUCCESS) => Self::TransferEnded,
            (0x02, status) => Self::TransferFailed { status },
            (opcode, status) => Self::Other { opcode, status },
        };
        Some(frame)
    }
}

/// Current-time packets, most specific first
///
/// 1. 11 bytes: Huami date-time with weekday, fractions, timezone and DST
/// 2. 10 bytes: Exact Time 256 with adjust reason "manual"
/// 3. 7 bytes: plain Date Time
#[must_use]
pub fn time_sync_packets(now: NaiveDateTime) -> [Bytes; 3] {
    let mut date_time = BytesMut::with_capacity(7);
    date_time.put_u16_le(u16::try_from(now.year()).unwrap_or(0));
    date_time.put_u8(now.month() as u8);
    date_time.put_u8(now.day() as u8);
    date_time.put_u8(now.hour() as u8);
    date_time.put_u8(now.minute() as u8);
    date_time.put_u8(now.second() as u8);

    let weekday = now.weekday().number_from_monday() as u8;

    let mut huami = date_time.clone();
    huami.put_u8(weekday);
    huami.put_slice(&[0, 0, 0]);

    let mut exact = date_time.clone();
    exact.put_u8(weekday);
    exact.put_slice(&[0, 1]);

    [huami.freeze(), exact.freeze(), date_time.freeze()]
}
