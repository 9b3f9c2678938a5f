//! TactileNav Pin Display Protocol
//!
//! Wire formats for frames written to the pin display and for the status
//! notifications it sends back. All multi-byte integers are big-endian and
//! every packet ends with a running XOR checksum (not a CRC).

use crate::domain::grid::Grid;
use crate::domain::models::{ButtonEvent, DeviceStatus, Mode};
use std::ops::Range;
use thiserror::Error;
use tracing::trace;

/// Pin display BLE Service UUID
/// Decoded: "TactileNav" in ASCII (54 61 63 74 69 6C 65 4E 61 76) followed by 0x0001
pub const SERVICE_UUID: &str = "54616374-696c-654e-6176-000000000001";

/// Tactile Write Characteristic UUID - where frames are written
pub const TACTILE_CHAR_UUID: &str = "54616374-696c-654e-6176-000000000002";

/// Mode Write Characteristic UUID - where mode commands are written
pub const MODE_CHAR_UUID: &str = "54616374-696c-654e-6176-000000000003";

/// Status Notify Characteristic UUID - battery / error / button reports
pub const STATUS_CHAR_UUID: &str = "54616374-696c-654e-6176-000000000004";

/// Frame-type tags
pub const TAG_FULL_FRAME: u8 = 0x01;
pub const TAG_DIFF_FRAME: u8 = 0x02;
pub const TAG_MODE_COMMAND: u8 = 0x10;
pub const TAG_STATUS: u8 = 0x20;

/// Header lengths, tag included
pub const FULL_HEADER_LEN: usize = 4;
pub const DIFF_HEADER_LEN: usize = 4;
pub const MODE_COMMAND_LEN: usize = 4;
pub const DIFF_RECORD_LEN: usize = 3;
pub const STATUS_MIN_LEN: usize = 5;

/// Battery byte meaning "not measured"
pub const BATTERY_UNKNOWN: u8 = 0xFF;

const LEVELS_PER_BYTE: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Grid length {actual} does not match layout length {expected}")]
    GridLength { expected: usize, actual: usize },

    #[error("Diff frame needs at least one change")]
    EmptyDiff,

    #[error("Packet truncated: {0} bytes")]
    Truncated(usize),

    #[error("Unknown frame tag: {0:#04X}")]
    UnknownTag(u8),

    #[error("Checksum mismatch: expected {expected:#04X}, found {found:#04X}")]
    Checksum { expected: u8, found: u8 },
}

/// One changed pin in a diff frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinChange {
    pub index: u16,
    pub value: u8,
}

/// A decoded wire packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Full { seq: u8, mode: u8, grid: Grid },
    Diff { seq: u8, changes: Vec<PinChange> },
    ModeCommand { mode: u8, direction: u8 },
}

/// Report decoded from the status characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub status: DeviceStatus,
    pub button: Option<ButtonEvent>,
}

/// Number of bytes needed to pack `len` levels
pub fn packed_len(len: usize) -> usize {
    len.div_ceil(LEVELS_PER_BYTE)
}

/// Pack levels at 2 bits each, most significant pair first
pub fn pack_grid(grid: &[u8]) -> Vec<u8> {
    let mut packed = vec![0u8; packed_len(grid.len())];
    for (i, &level) in grid.iter().enumerate() {
        let byte_index = i / LEVELS_PER_BYTE;
        let bit_shift = (3 - (i % LEVELS_PER_BYTE)) * 2;
        packed[byte_index] |= (level & 0b11) << bit_shift;
    }
    packed
}

/// Inverse of [`pack_grid`] for a known pin count
pub fn unpack_grid(packed: &[u8], len: usize) -> Result<Grid, CodecError> {
    if packed.len() < packed_len(len) {
        return Err(CodecError::Truncated(packed.len()));
    }
    Ok((0..len)
        .map(|i| {
            let bit_shift = (3 - (i % LEVELS_PER_BYTE)) * 2;
            (packed[i / LEVELS_PER_BYTE] >> bit_shift) & 0b11
        })
        .collect())
}

/// XOR fold over a half-open byte range
pub fn checksum(bytes: &[u8], range: Range<usize>) -> u8 {
    bytes[range].iter().fold(0u8, |acc, b| acc ^ b)
}

/// Appends the checksum over everything after the tag byte
fn seal(mut packet: Vec<u8>) -> Vec<u8> {
    let sum = checksum(&packet, 1..packet.len());
    packet.push(sum);
    packet
}

/// Build a full frame
///
/// ```text
/// [0]     : 0x01
/// [1]     : sequence (mod 256)
/// [2]     : mode
/// [3]     : reserved (0)
/// [4..n]  : packed grid, ceil(N/4) bytes
/// [n]     : XOR of [1..n]
/// ```
pub fn build_full_frame(seq: u32, mode: Mode, grid: &[u8]) -> Vec<u8> {
    let packed = pack_grid(grid);
    let mut packet = Vec::with_capacity(FULL_HEADER_LEN + packed.len() + 1);
    packet.extend_from_slice(&[TAG_FULL_FRAME, seq as u8, mode.as_byte(), 0x00]);
    packet.extend_from_slice(&packed);
    seal(packet)
}

/// Build a diff frame from changes in ascending index order
///
/// ```text
/// [0]     : 0x02
/// [1]     : sequence (mod 256)
/// [2-3]   : change count (u16 big-endian)
/// [4..n]  : records of index (u16 big-endian) + level
/// [n]     : XOR of [1..n]
/// ```
pub fn build_diff_frame(seq: u32, changes: &[PinChange]) -> Result<Vec<u8>, CodecError> {
    if changes.is_empty() {
        return Err(CodecError::EmptyDiff);
    }
    let mut packet = Vec::with_capacity(DIFF_HEADER_LEN + changes.len() * DIFF_RECORD_LEN + 1);
    packet.push(TAG_DIFF_FRAME);
    packet.push(seq as u8);
    packet.extend_from_slice(&(changes.len() as u16).to_be_bytes());
    for change in changes {
        packet.extend_from_slice(&change.index.to_be_bytes());
        packet.push(change.value);
    }
    Ok(seal(packet))
}

/// Build a mode command: tag, mode, direction, XOR of the first three
pub fn build_mode_command(mode: Mode, direction: u8) -> [u8; MODE_COMMAND_LEN] {
    let mut packet = [TAG_MODE_COMMAND, mode.as_byte(), direction, 0];
    packet[3] = checksum(&packet, 0..3);
    packet
}

/// Ordered list of pins whose level differs between two grids
pub fn diff_grids(previous: &[u8], next: &[u8]) -> Vec<PinChange> {
    previous
        .iter()
        .zip(next)
        .enumerate()
        .filter(|(_, (old, new))| old != new)
        .map(|(index, (_, &value))| PinChange {
            index: index as u16,
            value,
        })
        .collect()
}

/// Apply diff records on top of a previous grid
pub fn apply_changes(previous: &[u8], changes: &[PinChange]) -> Grid {
    let mut grid = previous.to_vec();
    for change in changes {
        if let Some(level) = grid.get_mut(change.index as usize) {
            *level = change.value;
        }
    }
    grid
}

/// Decode and verify a frame written to the device.
///
/// `grid_len` is needed because full frames do not carry N.
pub fn decode_frame(bytes: &[u8], grid_len: usize) -> Result<WireFrame, CodecError> {
    let tag = *bytes.first().ok_or(CodecError::Truncated(0))?;
    match tag {
        TAG_FULL_FRAME => {
            let expected_len = FULL_HEADER_LEN + packed_len(grid_len) + 1;
            if bytes.len() < expected_len {
                return Err(CodecError::Truncated(bytes.len()));
            }
            verify(bytes, 1)?;
            let grid = unpack_grid(&bytes[FULL_HEADER_LEN..bytes.len() - 1], grid_len)?;
            Ok(WireFrame::Full {
                seq: bytes[1],
                mode: bytes[2],
                grid,
            })
        }
        TAG_DIFF_FRAME => {
            if bytes.len() < DIFF_HEADER_LEN + 1 {
                return Err(CodecError::Truncated(bytes.len()));
            }
            let count = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
            if bytes.len() < DIFF_HEADER_LEN + count * DIFF_RECORD_LEN + 1 {
                return Err(CodecError::Truncated(bytes.len()));
            }
            verify(bytes, 1)?;
            let changes = bytes[DIFF_HEADER_LEN..DIFF_HEADER_LEN + count * DIFF_RECORD_LEN]
                .chunks_exact(DIFF_RECORD_LEN)
                .map(|record| PinChange {
                    index: u16::from_be_bytes([record[0], record[1]]),
                    value: record[2],
                })
                .collect();
            Ok(WireFrame::Diff {
                seq: bytes[1],
                changes,
            })
        }
        TAG_MODE_COMMAND => {
            if bytes.len() < MODE_COMMAND_LEN {
                return Err(CodecError::Truncated(bytes.len()));
            }
            verify(&bytes[..MODE_COMMAND_LEN], 0)?;
            Ok(WireFrame::ModeCommand {
                mode: bytes[1],
                direction: bytes[2],
            })
        }
        other => Err(CodecError::UnknownTag(other)),
    }
}

/// Checks the trailing byte against the XOR of `[start..len-1]`
fn verify(bytes: &[u8], start: usize) -> Result<(), CodecError> {
    let last = bytes.len() - 1;
    let expected = checksum(bytes, start..last);
    let found = bytes[last];
    if expected != found {
        return Err(CodecError::Checksum { expected, found });
    }
    Ok(())
}

/// Parse a status notification
///
/// # Status Packet Structure (>= 5 bytes)
///
/// ```text
/// [0]     : 0x20
/// [1]     : battery percent (0xFF = unknown)
/// [2]     : error code (0 = none)
/// [3]     : last sequence received
/// [4]     : button event (0 = none, 1 = toggle mode)
/// ```
///
/// Returns `None` for anything that is not a status packet.
pub fn parse_status_packet(bytes: &[u8]) -> Option<StatusReport> {
    if bytes.len() < STATUS_MIN_LEN || bytes[0] != TAG_STATUS {
        trace!("Ignoring notification: {:02X?}", bytes);
        return None;
    }

    let battery = match bytes[1] {
        BATTERY_UNKNOWN => -1,
        percent => percent as i32,
    };
    let button = match bytes[4] {
        0 => None,
        value => Some(ButtonEvent { value }),
    };

    Some(StatusReport {
        status: DeviceStatus {
            battery,
            error_code: bytes[2],
            last_seq: bytes[3],
        },
        button,
    })
}
