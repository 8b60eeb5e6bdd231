//! SCSI RDMA Protocol initiator.
//!
//! This module frames SCSI commands into SRP information units carried
//! over a reliable message socket: the login handshake, the tagged
//! outstanding-command table, and response demultiplexing.

use alloc::boxed::Box;
use alloc::vec::Vec;

use bitflags::bitflags;
use hashbrown::HashMap;
use log::{debug, warn};

use crate::sbft;
use crate::scsi::{ScsiCmd, ScsiLun, ScsiResponse, ScsiSense, ScsiTransport};
use crate::{IuSocket, SanError};

/// LOGIN_REQ information unit type.
pub const SRP_LOGIN_REQ: u8 = 0x00;
/// CMD information unit type.
pub const SRP_CMD: u8 = 0x02;
/// LOGIN_RSP information unit type.
pub const SRP_LOGIN_RSP: u8 = 0xC0;
/// RSP information unit type.
pub const SRP_RSP: u8 = 0xC1;
/// LOGIN_REJ information unit type.
pub const SRP_LOGIN_REJ: u8 = 0xC2;

/// Fixed high dword of every tag sent by this initiator.
pub const SRP_TAG_MAGIC: u32 = 0x6950_5845;

/// Maximum length of any initiator-to-target IU that we will send.
///
/// The longest IU is a CMD with no additional CDB length and two direct
/// data buffer descriptors, which comes to 80 bytes.
pub const SRP_MAX_I_T_IU_LEN: usize = 80;

/// Common (type, tag) IU prefix length.
const SRP_COMMON_LEN: usize = 16;

bitflags! {
    /// Data buffer formats a login requires of the target.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferFormats: u8 {
        /// Direct data buffer descriptors.
        const DIRECT = 0x02;
        /// Indirect data buffer descriptors.
        const INDIRECT = 0x04;
    }
}

bitflags! {
    /// RSP field-validity flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RspFlags: u8 {
        /// Response data is present.
        const RSPVALID = 0x01;
        /// Sense data is present.
        const SNSVALID = 0x02;
        /// Data-out overrun occurred.
        const DOOVER = 0x04;
        /// Data-out underrun occurred.
        const DOUNDER = 0x08;
        /// Data-in overrun occurred.
        const DIOVER = 0x10;
        /// Data-in underrun occurred.
        const DIUNDER = 0x20;
    }
}

/// CMD data-out direct descriptor format bit.
const SRP_CMD_DO_FMT_DIRECT: u8 = 0x10;
/// CMD data-in direct descriptor format bit.
const SRP_CMD_DI_FMT_DIRECT: u8 = 0x01;

/// An SRP port identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SrpPortId([u8; 16]);

impl SrpPortId {
    /// Construct a port ID from its wire representation.
    pub fn new(bytes: [u8; 16]) -> Self {
        SrpPortId(bytes)
    }

    /// Wire representation.
    pub fn bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl core::fmt::Display for SrpPortId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for chunk in self.0.chunks(4) {
            write!(
                f,
                "{:08x}",
                u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
            )?;
        }
        Ok(())
    }
}

/// Write the common (type, tag) prefix.
fn put_common(iu: &mut [u8], iu_type: u8, tag: u32) {
    iu[0] = iu_type;
    iu[8..12].copy_from_slice(&SRP_TAG_MAGIC.to_be_bytes());
    iu[12..16].copy_from_slice(&tag.to_be_bytes());
}

/// Read the session-local half of an IU tag.
fn get_tag(iu: &[u8]) -> u32 {
    u32::from_be_bytes([iu[12], iu[13], iu[14], iu[15]])
}

/// A LOGIN_REQ information unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginReq {
    /// Session-local tag.
    pub tag: u32,
    /// Maximum initiator-to-target IU length.
    pub max_iu_len: u64,
    /// Required data buffer formats.
    pub required_formats: BufferFormats,
    /// Initiator port ID.
    pub initiator: SrpPortId,
    /// Target port ID.
    pub target: SrpPortId,
}

impl LoginReq {
    /// Encoded length.
    pub const LEN: usize = 64;

    /// Encode to the wire form.
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut iu = [0u8; Self::LEN];
        put_common(&mut iu, SRP_LOGIN_REQ, self.tag);
        iu[16..24].copy_from_slice(&self.max_iu_len.to_be_bytes());
        iu[24] = self.required_formats.bits();
        iu[32..48].copy_from_slice(self.initiator.bytes());
        iu[48..64].copy_from_slice(self.target.bytes());
        iu
    }

    /// Decode from the wire form.
    pub fn decode(iu: &[u8]) -> Result<Self, SanError> {
        if iu.len() < Self::LEN || iu[0] != SRP_LOGIN_REQ {
            return Err(SanError::Invalid);
        }
        Ok(LoginReq {
            tag: get_tag(iu),
            max_iu_len: u64::from_be_bytes(iu[16..24].try_into().unwrap()),
            required_formats: BufferFormats::from_bits_truncate(iu[24]),
            initiator: SrpPortId(iu[32..48].try_into().unwrap()),
            target: SrpPortId(iu[48..64].try_into().unwrap()),
        })
    }
}

/// A LOGIN_RSP information unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginRsp {
    /// Session-local tag.
    pub tag: u32,
    /// Request limit delta granted by the target.
    pub request_limit_delta: i32,
    /// Maximum initiator-to-target IU length.
    pub max_it_iu_len: u32,
    /// Maximum target-to-initiator IU length.
    pub max_ti_iu_len: u32,
}

impl LoginRsp {
    /// Encoded length.
    pub const LEN: usize = 36;

    /// Encode to the wire form.
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut iu = [0u8; Self::LEN];
        put_common(&mut iu, SRP_LOGIN_RSP, self.tag);
        iu[16..20].copy_from_slice(&self.request_limit_delta.to_be_bytes());
        iu[20..24].copy_from_slice(&self.max_it_iu_len.to_be_bytes());
        iu[24..28].copy_from_slice(&self.max_ti_iu_len.to_be_bytes());
        iu
    }

    /// Decode from the wire form.
    pub fn decode(iu: &[u8]) -> Result<Self, SanError> {
        if iu.len() < Self::LEN || iu[0] != SRP_LOGIN_RSP {
            return Err(SanError::Invalid);
        }
        Ok(LoginRsp {
            tag: get_tag(iu),
            request_limit_delta: i32::from_be_bytes(iu[16..20].try_into().unwrap()),
            max_it_iu_len: u32::from_be_bytes(iu[20..24].try_into().unwrap()),
            max_ti_iu_len: u32::from_be_bytes(iu[24..28].try_into().unwrap()),
        })
    }
}

/// A LOGIN_REJ information unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginRej {
    /// Session-local tag.
    pub tag: u32,
    /// Rejection reason code.
    pub reason: u32,
}

impl LoginRej {
    /// Encoded length.
    pub const LEN: usize = 36;

    /// Encode to the wire form.
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut iu = [0u8; Self::LEN];
        put_common(&mut iu, SRP_LOGIN_REJ, self.tag);
        iu[16..20].copy_from_slice(&self.reason.to_be_bytes());
        iu
    }

    /// Decode from the wire form.
    pub fn decode(iu: &[u8]) -> Result<Self, SanError> {
        if iu.len() < Self::LEN || iu[0] != SRP_LOGIN_REJ {
            return Err(SanError::Invalid);
        }
        Ok(LoginRej {
            tag: get_tag(iu),
            reason: u32::from_be_bytes(iu[16..20].try_into().unwrap()),
        })
    }
}

/// A direct data buffer descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDescriptor {
    /// Buffer bus address.
    pub addr: u64,
    /// Memory registration handle.
    pub handle: u32,
    /// Buffer length in bytes.
    pub len: u32,
}

impl MemoryDescriptor {
    /// Encoded length.
    pub const LEN: usize = 16;

    fn put(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.addr.to_be_bytes());
        out.extend_from_slice(&self.handle.to_be_bytes());
        out.extend_from_slice(&self.len.to_be_bytes());
    }

    fn get(data: &[u8]) -> Self {
        MemoryDescriptor {
            addr: u64::from_be_bytes(data[0..8].try_into().unwrap()),
            handle: u32::from_be_bytes(data[8..12].try_into().unwrap()),
            len: u32::from_be_bytes(data[12..16].try_into().unwrap()),
        }
    }
}

/// A CMD information unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdIu {
    /// Session-local tag.
    pub tag: u32,
    /// Logical unit.
    pub lun: ScsiLun,
    /// Command descriptor block.
    pub cdb: [u8; 16],
    /// Data-out direct descriptor.
    pub data_out: Option<MemoryDescriptor>,
    /// Data-in direct descriptor.
    pub data_in: Option<MemoryDescriptor>,
}

impl CmdIu {
    /// Encoded length without descriptors.
    pub const BASE_LEN: usize = 48;

    /// Encode to the wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut iu = Vec::with_capacity(SRP_MAX_I_T_IU_LEN);
        iu.resize(Self::BASE_LEN, 0);
        put_common(&mut iu, SRP_CMD, self.tag);
        let mut formats = 0;
        if self.data_out.is_some() {
            formats |= SRP_CMD_DO_FMT_DIRECT;
            iu[21] = 1;
        }
        if self.data_in.is_some() {
            formats |= SRP_CMD_DI_FMT_DIRECT;
            iu[22] = 1;
        }
        iu[20] = formats;
        iu[24..32].copy_from_slice(self.lun.bytes());
        iu[32..48].copy_from_slice(&self.cdb);
        if let Some(data_out) = &self.data_out {
            data_out.put(&mut iu);
        }
        if let Some(data_in) = &self.data_in {
            data_in.put(&mut iu);
        }
        iu
    }

    /// Decode from the wire form.
    pub fn decode(iu: &[u8]) -> Result<Self, SanError> {
        if iu.len() < Self::BASE_LEN || iu[0] != SRP_CMD {
            return Err(SanError::Invalid);
        }
        let mut offset = Self::BASE_LEN;
        let mut take = |present: bool| -> Result<Option<MemoryDescriptor>, SanError> {
            if !present {
                return Ok(None);
            }
            if iu.len() < offset + MemoryDescriptor::LEN {
                return Err(SanError::Invalid);
            }
            let desc = MemoryDescriptor::get(&iu[offset..]);
            offset += MemoryDescriptor::LEN;
            Ok(Some(desc))
        };
        let data_out = take(iu[20] & SRP_CMD_DO_FMT_DIRECT != 0)?;
        let data_in = take(iu[20] & SRP_CMD_DI_FMT_DIRECT != 0)?;
        Ok(CmdIu {
            tag: get_tag(iu),
            lun: ScsiLun::new(iu[24..32].try_into().unwrap()),
            cdb: iu[32..48].try_into().unwrap(),
            data_out,
            data_in,
        })
    }
}

/// An RSP information unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RspIu {
    /// Session-local tag.
    pub tag: u32,
    /// Field-validity flags.
    pub flags: RspFlags,
    /// SCSI status byte.
    pub status: u8,
    /// Data-out residual count.
    pub data_out_residual: u32,
    /// Data-in residual count.
    pub data_in_residual: u32,
    /// Response data.
    pub response_data: Vec<u8>,
    /// Sense data.
    pub sense_data: Vec<u8>,
}

impl RspIu {
    /// Encoded length without trailing data.
    pub const BASE_LEN: usize = 36;

    /// Encode to the wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut iu = Vec::with_capacity(
            Self::BASE_LEN + self.response_data.len() + self.sense_data.len(),
        );
        iu.resize(Self::BASE_LEN, 0);
        put_common(&mut iu, SRP_RSP, self.tag);
        iu[18] = self.flags.bits();
        iu[19] = self.status;
        iu[20..24].copy_from_slice(&self.data_out_residual.to_be_bytes());
        iu[24..28].copy_from_slice(&self.data_in_residual.to_be_bytes());
        iu[28..32].copy_from_slice(&(self.response_data.len() as u32).to_be_bytes());
        iu[32..36].copy_from_slice(&(self.sense_data.len() as u32).to_be_bytes());
        iu.extend_from_slice(&self.response_data);
        iu.extend_from_slice(&self.sense_data);
        iu
    }

    /// Decode from the wire form.
    pub fn decode(iu: &[u8]) -> Result<Self, SanError> {
        if iu.len() < Self::BASE_LEN || iu[0] != SRP_RSP {
            return Err(SanError::Invalid);
        }
        let flags = RspFlags::from_bits_truncate(iu[18]);
        let response_len = u32::from_be_bytes(iu[28..32].try_into().unwrap()) as usize;
        let sense_len = u32::from_be_bytes(iu[32..36].try_into().unwrap()) as usize;
        let response_end = Self::BASE_LEN
            .checked_add(response_len)
            .ok_or(SanError::Invalid)?;
        let sense_end = response_end.checked_add(sense_len).ok_or(SanError::Invalid)?;
        if iu.len() < sense_end {
            return Err(SanError::Invalid);
        }
        Ok(RspIu {
            tag: get_tag(iu),
            flags,
            status: iu[19],
            data_out_residual: u32::from_be_bytes(iu[20..24].try_into().unwrap()),
            data_in_residual: u32::from_be_bytes(iu[24..28].try_into().unwrap()),
            response_data: iu[Self::BASE_LEN..response_end].to_vec(),
            sense_data: iu[response_end..sense_end].to_vec(),
        })
    }

    /// Signed overrun derived from the residual counts.
    ///
    /// The first present flag among DOOVER, DOUNDER, DIOVER, DIUNDER
    /// wins; underruns are reported as negative overruns.
    pub fn overrun(&self) -> i64 {
        let data_out = self.data_out_residual as i64;
        let data_in = self.data_in_residual as i64;
        if self.flags.contains(RspFlags::DOOVER) {
            data_out
        } else if self.flags.contains(RspFlags::DOUNDER) {
            -data_out
        } else if self.flags.contains(RspFlags::DIOVER) {
            data_in
        } else if self.flags.contains(RspFlags::DIUNDER) {
            -data_in
        } else {
            0
        }
    }
}

/// Login progress of an SRP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginState {
    /// LOGIN_REQ sent, no response yet. Window is zero.
    LoggingIn,
    /// LOGIN_RSP accepted. Window is unbounded.
    LoggedIn,
    /// Fatal failure; the session is unusable.
    Dead,
}

/// Event surfaced by IU delivery.
#[derive(Debug, Clone)]
pub enum SrpEvent {
    /// Login completed; the flow-control window is now open.
    LoggedIn,
    /// A response matched an outstanding command.
    Response {
        /// Caller cookie registered with the command.
        cookie: u32,
        /// Decoded SCSI response.
        response: ScsiResponse,
    },
}

/// An SRP initiator session.
pub struct SrpSession {
    socket: Box<dyn IuSocket>,
    memory_handle: u32,
    state: LoginState,
    fault: Option<SanError>,
    tag_idx: u16,
    outstanding: HashMap<u32, u32>,
    initiator: SrpPortId,
    target: SrpPortId,
    lun: ScsiLun,
}

impl SrpSession {
    /// Open a session and initiate login.
    ///
    /// The LOGIN_REQ is sent immediately; the call does not wait for
    /// the response. Until LOGIN_RSP arrives the window stays zero and
    /// command issuance fails with [`SanError::Busy`].
    pub fn open(
        socket: Box<dyn IuSocket>,
        initiator: SrpPortId,
        target: SrpPortId,
        memory_handle: u32,
        lun: ScsiLun,
    ) -> Result<Self, SanError> {
        let mut session = SrpSession {
            socket,
            memory_handle,
            state: LoginState::LoggingIn,
            fault: None,
            tag_idx: 0,
            outstanding: HashMap::new(),
            initiator,
            target,
            lun,
        };
        debug!("SRP {}->{} logging in", initiator, target);
        // Cannot fail while no commands are in progress.
        let tag = session.new_tag()?;
        let login = LoginReq {
            tag,
            max_iu_len: SRP_MAX_I_T_IU_LEN as u64,
            required_formats: BufferFormats::DIRECT,
            initiator,
            target,
        };
        session.socket.send(&login.encode())?;
        Ok(session)
    }

    /// Choose a new command tag.
    ///
    /// The 16-bit counter wraps; a full cycle with no free slot means
    /// the tag space is exhausted.
    fn new_tag(&mut self) -> Result<u32, SanError> {
        for _ in 0..=u16::MAX {
            self.tag_idx = self.tag_idx.wrapping_add(1);
            let tag = self.tag_idx as u32;
            if !self.outstanding.contains_key(&tag) {
                return Ok(tag);
            }
        }
        Err(SanError::AddrInUse)
    }

    /// Demultiplex one received IU.
    ///
    /// An `Err` return means the session has been closed with that
    /// reason; the caller fans the reason out to every outstanding
    /// command.
    pub fn deliver(&mut self, iu: &[u8]) -> Result<Option<SrpEvent>, SanError> {
        let result = self.deliver_iu(iu);
        if let Err(err) = result {
            self.close(err);
        }
        result
    }

    fn deliver_iu(&mut self, iu: &[u8]) -> Result<Option<SrpEvent>, SanError> {
        if iu.len() < SRP_COMMON_LEN {
            warn!("SRP IU too short ({} bytes)", iu.len());
            return Err(SanError::Invalid);
        }
        match iu[0] {
            SRP_LOGIN_RSP => self.login_rsp(iu),
            SRP_LOGIN_REJ => self.login_rej(iu),
            SRP_RSP => self.rsp(iu),
            unknown => {
                warn!("SRP tag {:08x} unrecognised IU type {:02x}", get_tag(iu), unknown);
                Err(SanError::Unsupported)
            }
        }
    }

    fn login_rsp(&mut self, iu: &[u8]) -> Result<Option<SrpEvent>, SanError> {
        let rsp = LoginRsp::decode(iu).map_err(|err| {
            warn!("SRP LOGIN_RSP too short ({} bytes)", iu.len());
            err
        })?;
        debug!("SRP tag {:08x} logged in", rsp.tag);
        self.state = LoginState::LoggedIn;
        Ok(Some(SrpEvent::LoggedIn))
    }

    fn login_rej(&mut self, iu: &[u8]) -> Result<Option<SrpEvent>, SanError> {
        let rej = LoginRej::decode(iu).map_err(|err| {
            warn!("SRP LOGIN_REJ too short ({} bytes)", iu.len());
            err
        })?;
        // Login rejection always indicates an error.
        warn!("SRP tag {:08x} login rejected (reason {:08x})", rej.tag, rej.reason);
        Err(SanError::PermissionDenied)
    }

    fn rsp(&mut self, iu: &[u8]) -> Result<Option<SrpEvent>, SanError> {
        let rsp = RspIu::decode(iu).map_err(|err| {
            warn!("SRP RSP too short ({} bytes)", iu.len());
            err
        })?;
        let cookie = match self.outstanding.remove(&rsp.tag) {
            Some(cookie) => cookie,
            None => {
                // A stale response for a command that timed out locally;
                // ignore it without tearing the session down.
                debug!("SRP tag {:08x} unrecognised RSP", rsp.tag);
                return Ok(None);
            }
        };
        let sense = if rsp.flags.contains(RspFlags::SNSVALID) {
            ScsiSense::parse(&rsp.sense_data)
        } else {
            None
        };
        let response = ScsiResponse {
            status: rsp.status,
            overrun: rsp.overrun(),
            sense,
        };
        debug!(
            "SRP tag {:08x} RSP stat {:02x} overrun {}",
            rsp.tag, rsp.status, response.overrun
        );
        Ok(Some(SrpEvent::Response { cookie, response }))
    }

    /// Close the session.
    fn close(&mut self, err: SanError) {
        if self.state != LoginState::Dead {
            warn!("SRP session closed: {:?}", err);
            self.state = LoginState::Dead;
            self.fault = Some(err);
            self.outstanding.clear();
        }
    }
}

impl ScsiTransport for SrpSession {
    fn command(&mut self, cookie: u32, cmd: &ScsiCmd) -> Result<u32, SanError> {
        if let Some(err) = self.fault {
            return Err(err);
        }
        if self.state != LoginState::LoggedIn {
            debug!("SRP cannot send CMD before login completes");
            return Err(SanError::Busy);
        }
        let tag = self.new_tag()?;
        let iu = CmdIu {
            tag,
            lun: cmd.lun,
            cdb: cmd.cdb.encode(),
            data_out: cmd.data_out.map(|buffer| MemoryDescriptor {
                addr: buffer.addr(),
                handle: self.memory_handle,
                len: buffer.len(),
            }),
            data_in: cmd.data_in.map(|buffer| MemoryDescriptor {
                addr: buffer.addr(),
                handle: self.memory_handle,
                len: buffer.len(),
            }),
        };
        debug!("SRP tag {:08x} CMD {:02x?}", tag, iu.cdb);
        self.outstanding.insert(tag, cookie);
        if let Err(err) = self.socket.send(&iu.encode()) {
            warn!("SRP tag {:08x} could not send CMD: {:?}", tag, err);
            self.outstanding.remove(&tag);
            return Err(err);
        }
        Ok(tag)
    }

    fn window(&self) -> usize {
        match self.state {
            LoginState::LoggedIn => usize::MAX,
            _ => 0,
        }
    }

    fn poll(&mut self) -> Result<Option<(u32, ScsiResponse)>, SanError> {
        if let Some(err) = self.fault {
            return Err(err);
        }
        while let Some(iu) = self.socket.recv() {
            match self.deliver(&iu)? {
                Some(SrpEvent::Response { cookie, response }) => {
                    return Ok(Some((cookie, response)));
                }
                Some(SrpEvent::LoggedIn) | None => continue,
            }
        }
        Ok(None)
    }

    fn abort(&mut self, tag: u32) {
        if self.outstanding.remove(&tag).is_some() {
            debug!("SRP tag {:08x} abandoned", tag);
        }
    }

    fn describe(&mut self, table: &mut [u8]) -> Result<(), SanError> {
        if table.len() < sbft::SBFT_LEN {
            return Err(SanError::BufferTooSmall);
        }
        table[sbft::SIGNATURE].copy_from_slice(&sbft::SBFT_SIG);
        table[sbft::LENGTH].copy_from_slice(&(sbft::SBFT_LEN as u32).to_le_bytes());
        table[sbft::REVISION] = 1;
        table[sbft::SCSI_OFFSET]
            .copy_from_slice(&(sbft::SCSI_SUBTABLE as u16).to_le_bytes());
        table[sbft::SRP_OFFSET].copy_from_slice(&(sbft::SRP_SUBTABLE as u16).to_le_bytes());
        table[sbft::SCSI_SUBTABLE..sbft::SCSI_SUBTABLE + 8]
            .copy_from_slice(self.lun.bytes());
        table[sbft::SRP_SUBTABLE..sbft::SRP_SUBTABLE + 16]
            .copy_from_slice(self.initiator.bytes());
        table[sbft::SRP_SUBTABLE + 16..sbft::SRP_SUBTABLE + 32]
            .copy_from_slice(self.target.bytes());
        // Ask the transport layer to describe its own portions.
        self.socket.describe(table)
    }
}
