use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum payload of a classic CAN frame.
pub const CLASSIC_MAX_DLEN: usize = 8;
/// Maximum payload of a CAN-FD frame.
pub const FD_MAX_DLEN: usize = 64;
/// Highest valid data length code.
pub const MAX_DLC: u8 = 15;

/// 29-bit extended identifier mask.
pub const EFF_MASK: u32 = 0x1FFF_FFFF;
/// 11-bit standard identifier mask.
pub const SFF_MASK: u32 = 0x0000_07FF;

/// Map a data length code to the payload length in bytes.
#[inline]
pub fn dlc_to_len(dlc: u8) -> usize {
    match dlc {
        0..=8 => dlc as usize,
        9 => 12,
        10 => 16,
        11 => 20,
        12 => 24,
        13 => 32,
        14 => 48,
        _ => 64,
    }
}

/// Map a payload length to the smallest data length code that carries it.
#[inline]
pub fn len_to_dlc(len: usize) -> u8 {
    match len {
        0..=8 => len as u8,
        9..=12 => 9,
        13..=16 => 10,
        17..=20 => 11,
        21..=24 => 12,
        25..=32 => 13,
        33..=48 => 14,
        _ => 15,
    }
}

/// CAN bus fault confinement state, worst first when ordering matters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusState {
    ErrorActive,
    ErrorWarning,
    ErrorPassive,
    BusOff,
}

impl Default for BusState {
    fn default() -> Self {
        BusState::ErrorActive
    }
}

/// Protocol error kind reported by the device for a single mangled frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolErrorKind {
    None,
    Stuff,
    Form,
    Ack,
    Bit1,
    Bit0,
    Crc,
}

/// A CAN or CAN-FD frame as it moves through the stack.
///
/// Invariants are established at construction time: payload length matches
/// the dlc, RTR frames carry no data, and the FD-only flags imply `fdf`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanFrame {
    id: u32,
    extended: bool,
    rtr: bool,
    fdf: bool,
    brs: bool,
    esi: bool,
    dlc: u8,
    data: Vec<u8>,
    timestamp_us: Option<u64>,
}

impl CanFrame {
    /// Classic data frame with a standard (11-bit) identifier.
    pub fn new(id: u32, data: &[u8]) -> Result<Self> {
        if id > SFF_MASK || data.len() > CLASSIC_MAX_DLEN {
            return Err(Error::InvalidParam);
        }
        Ok(Self {
            id,
            extended: false,
            rtr: false,
            fdf: false,
            brs: false,
            esi: false,
            dlc: len_to_dlc(data.len()),
            data: data.to_vec(),
            timestamp_us: None,
        })
    }

    /// Classic data frame with an extended (29-bit) identifier.
    pub fn new_eff(id: u32, data: &[u8]) -> Result<Self> {
        if id > EFF_MASK || data.len() > CLASSIC_MAX_DLEN {
            return Err(Error::InvalidParam);
        }
        Ok(Self {
            id,
            extended: true,
            rtr: false,
            fdf: false,
            brs: false,
            esi: false,
            dlc: len_to_dlc(data.len()),
            data: data.to_vec(),
            timestamp_us: None,
        })
    }

    /// Remote request frame. The dlc is carried but no payload follows.
    pub fn new_remote(id: u32, dlc: u8, extended: bool) -> Result<Self> {
        let mask = if extended { EFF_MASK } else { SFF_MASK };
        if id > mask || dlc > CLASSIC_MAX_DLEN as u8 {
            return Err(Error::InvalidParam);
        }
        Ok(Self {
            id,
            extended,
            rtr: true,
            fdf: false,
            brs: false,
            esi: false,
            dlc,
            data: Vec::new(),
            timestamp_us: None,
        })
    }

    /// CAN-FD data frame. Payload lengths between dlc steps are rejected.
    pub fn new_fd(id: u32, data: &[u8], extended: bool, brs: bool, esi: bool) -> Result<Self> {
        let mask = if extended { EFF_MASK } else { SFF_MASK };
        if id > mask || data.len() > FD_MAX_DLEN {
            return Err(Error::InvalidParam);
        }
        let dlc = len_to_dlc(data.len());
        if dlc_to_len(dlc) != data.len() {
            return Err(Error::InvalidParam);
        }
        Ok(Self {
            id,
            extended,
            rtr: false,
            fdf: true,
            brs,
            esi,
            dlc,
            data: data.to_vec(),
            timestamp_us: None,
        })
    }

    /// Rebuild a frame from raw wire fields. Used by the stream decoder.
    pub(crate) fn from_wire(
        id: u32,
        dlc: u8,
        extended: bool,
        rtr: bool,
        fdf: bool,
        brs: bool,
        esi: bool,
        data: &[u8],
    ) -> Result<Self> {
        if dlc > MAX_DLC {
            return Err(Error::InvalidParam);
        }
        if fdf && rtr {
            return Err(Error::InvalidParam);
        }
        if !fdf && (brs || esi || dlc > CLASSIC_MAX_DLEN as u8) {
            return Err(Error::InvalidParam);
        }
        if !rtr && data.len() != dlc_to_len(dlc) {
            return Err(Error::InvalidParam);
        }
        Ok(Self {
            id: id & if extended { EFF_MASK } else { SFF_MASK },
            extended,
            rtr,
            fdf,
            brs,
            esi,
            dlc,
            data: if rtr { Vec::new() } else { data.to_vec() },
            timestamp_us: None,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn is_rtr(&self) -> bool {
        self.rtr
    }

    pub fn is_fd(&self) -> bool {
        self.fdf
    }

    pub fn is_brs(&self) -> bool {
        self.brs
    }

    pub fn is_esi(&self) -> bool {
        self.esi
    }

    pub fn timestamp_us(&self) -> Option<u64> {
        self.timestamp_us
    }

    pub fn set_timestamp(&mut self, timestamp_us: Option<u64>) {
        self.timestamp_us = timestamp_us;
    }

    /// Validate the frame against the channel's negotiated mode.
    pub fn check_against_mode(&self, fd_enabled: bool) -> Result<()> {
        if self.fdf && !fd_enabled {
            return Err(Error::InvalidParam);
        }
        Ok(())
    }
}
