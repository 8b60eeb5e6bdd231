//! SCSI session layer.
//!
//! This module provides the SCSI block device: command descriptor block
//! construction, capacity discovery with the READ CAPACITY (10) to (16)
//! fallback, and transparent retries over a command transport.

use alloc::boxed::Box;

use hashbrown::HashMap;
use log::{debug, warn};

use crate::{BlockCapacity, BlockDevice, CommandHandle, SanError, UserBuffer};

/// Maximum number of command retries.
///
/// SCSI targets have a habit of returning occasional pointless "error"
/// responses such as "power-on occurred", so commands are reissued
/// rather than failed on the first non-zero status.
pub const SCSI_MAX_RETRIES: u32 = 10;

/// Highest block addressable by a 10-byte READ/WRITE CDB.
pub const SCSI_MAX_BLOCK_10: u64 = 0xFFFF_FFFF;

/// READ (10) opcode.
pub const SCSI_OPCODE_READ_10: u8 = 0x28;
/// WRITE (10) opcode.
pub const SCSI_OPCODE_WRITE_10: u8 = 0x2A;
/// READ (16) opcode.
pub const SCSI_OPCODE_READ_16: u8 = 0x88;
/// WRITE (16) opcode.
pub const SCSI_OPCODE_WRITE_16: u8 = 0x8A;
/// READ CAPACITY (10) opcode.
pub const SCSI_OPCODE_READ_CAPACITY_10: u8 = 0x25;
/// SERVICE ACTION IN opcode, carrier for READ CAPACITY (16).
pub const SCSI_OPCODE_SERVICE_ACTION_IN: u8 = 0x9E;
/// READ CAPACITY (16) service action.
pub const SCSI_SERVICE_ACTION_READ_CAPACITY_16: u8 = 0x10;

/// Length of a READ CAPACITY (10) parameter data block.
const CAPACITY_10_LEN: usize = 8;
/// Length of a READ CAPACITY (16) parameter data block.
const CAPACITY_16_LEN: usize = 32;

/// A SCSI logical unit number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScsiLun([u8; 8]);

impl ScsiLun {
    /// Construct a LUN from its wire representation.
    pub fn new(bytes: [u8; 8]) -> Self {
        ScsiLun(bytes)
    }

    /// Wire representation.
    pub fn bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Parse a textual LUN of up to four hyphen-separated 16-bit hex words.
    ///
    /// The empty string parses as LUN zero.
    pub fn parse(lun: &str) -> Result<Self, SanError> {
        let mut bytes = [0u8; 8];
        if lun.is_empty() {
            return Ok(ScsiLun(bytes));
        }
        let mut words = 0;
        for word in lun.split('-') {
            if words >= 4 || word.is_empty() || word.len() > 4 {
                return Err(SanError::Invalid);
            }
            let value = u16::from_str_radix(word, 16).map_err(|_| SanError::Invalid)?;
            bytes[words * 2..words * 2 + 2].copy_from_slice(&value.to_be_bytes());
            words += 1;
        }
        Ok(ScsiLun(bytes))
    }
}

impl core::fmt::Display for ScsiLun {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (i, pair) in self.0.chunks(2).enumerate() {
            if i > 0 {
                write!(f, "-")?;
            }
            write!(f, "{:04x}", u16::from_be_bytes([pair[0], pair[1]]))?;
        }
        Ok(())
    }
}

/// A SCSI command descriptor block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cdb {
    /// READ (10): 4-byte LBA, 2-byte block count.
    Read10 { lba: u32, len: u16 },
    /// READ (16): 8-byte LBA, 4-byte block count.
    Read16 { lba: u64, len: u32 },
    /// WRITE (10): 4-byte LBA, 2-byte block count.
    Write10 { lba: u32, len: u16 },
    /// WRITE (16): 8-byte LBA, 4-byte block count.
    Write16 { lba: u64, len: u32 },
    /// READ CAPACITY (10): no parameters.
    ReadCapacity10,
    /// READ CAPACITY (16), encoded as SERVICE ACTION IN.
    ReadCapacity16 { alloc_len: u32 },
}

impl Cdb {
    /// Encoded CDB length.
    pub const LEN: usize = 16;

    /// Build the read CDB for a block range.
    ///
    /// READ (10) is used whenever the range fits below
    /// [`SCSI_MAX_BLOCK_10`]; READ (16) otherwise.
    pub fn read(lba: u64, count: u32) -> Self {
        if lba + count as u64 > SCSI_MAX_BLOCK_10 {
            Cdb::Read16 { lba, len: count }
        } else {
            Cdb::Read10 {
                lba: lba as u32,
                len: count as u16,
            }
        }
    }

    /// Build the write CDB for a block range.
    pub fn write(lba: u64, count: u32) -> Self {
        if lba + count as u64 > SCSI_MAX_BLOCK_10 {
            Cdb::Write16 { lba, len: count }
        } else {
            Cdb::Write10 {
                lba: lba as u32,
                len: count as u16,
            }
        }
    }

    /// Encode to the 16-byte wire form.
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut cdb = [0u8; Self::LEN];
        match *self {
            Cdb::Read10 { lba, len } | Cdb::Write10 { lba, len } => {
                cdb[0] = match self {
                    Cdb::Read10 { .. } => SCSI_OPCODE_READ_10,
                    _ => SCSI_OPCODE_WRITE_10,
                };
                cdb[2..6].copy_from_slice(&lba.to_be_bytes());
                cdb[7..9].copy_from_slice(&len.to_be_bytes());
            }
            Cdb::Read16 { lba, len } | Cdb::Write16 { lba, len } => {
                cdb[0] = match self {
                    Cdb::Read16 { .. } => SCSI_OPCODE_READ_16,
                    _ => SCSI_OPCODE_WRITE_16,
                };
                cdb[2..10].copy_from_slice(&lba.to_be_bytes());
                cdb[10..14].copy_from_slice(&len.to_be_bytes());
            }
            Cdb::ReadCapacity10 => {
                cdb[0] = SCSI_OPCODE_READ_CAPACITY_10;
            }
            Cdb::ReadCapacity16 { alloc_len } => {
                cdb[0] = SCSI_OPCODE_SERVICE_ACTION_IN;
                cdb[1] = SCSI_SERVICE_ACTION_READ_CAPACITY_16;
                cdb[10..14].copy_from_slice(&alloc_len.to_be_bytes());
            }
        }
        cdb
    }

    /// Decode from the 16-byte wire form.
    pub fn decode(cdb: &[u8; Self::LEN]) -> Result<Self, SanError> {
        match cdb[0] {
            SCSI_OPCODE_READ_10 => Ok(Cdb::Read10 {
                lba: u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]),
                len: u16::from_be_bytes([cdb[7], cdb[8]]),
            }),
            SCSI_OPCODE_WRITE_10 => Ok(Cdb::Write10 {
                lba: u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]),
                len: u16::from_be_bytes([cdb[7], cdb[8]]),
            }),
            SCSI_OPCODE_READ_16 => Ok(Cdb::Read16 {
                lba: u64::from_be_bytes([
                    cdb[2], cdb[3], cdb[4], cdb[5], cdb[6], cdb[7], cdb[8], cdb[9],
                ]),
                len: u32::from_be_bytes([cdb[10], cdb[11], cdb[12], cdb[13]]),
            }),
            SCSI_OPCODE_WRITE_16 => Ok(Cdb::Write16 {
                lba: u64::from_be_bytes([
                    cdb[2], cdb[3], cdb[4], cdb[5], cdb[6], cdb[7], cdb[8], cdb[9],
                ]),
                len: u32::from_be_bytes([cdb[10], cdb[11], cdb[12], cdb[13]]),
            }),
            SCSI_OPCODE_READ_CAPACITY_10 => Ok(Cdb::ReadCapacity10),
            SCSI_OPCODE_SERVICE_ACTION_IN
                if cdb[1] & 0x1F == SCSI_SERVICE_ACTION_READ_CAPACITY_16 =>
            {
                Ok(Cdb::ReadCapacity16 {
                    alloc_len: u32::from_be_bytes([cdb[10], cdb[11], cdb[12], cdb[13]]),
                })
            }
            _ => Err(SanError::Invalid),
        }
    }
}

/// Fixed-format SCSI sense data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScsiSense {
    /// Response code.
    pub code: u8,
    /// Sense key.
    pub key: u8,
    /// Information field.
    pub info: u32,
}

impl ScsiSense {
    /// Parse the leading portion of a fixed-format sense block.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        Some(ScsiSense {
            code: data[0] & 0x7F,
            key: data[2] & 0x0F,
            info: u32::from_be_bytes([data[3], data[4], data[5], data[6]]),
        })
    }
}

/// A SCSI command as handed to the transport.
#[derive(Debug, Clone, Copy)]
pub struct ScsiCmd {
    /// Logical unit.
    pub lun: ScsiLun,
    /// Command descriptor block.
    pub cdb: Cdb,
    /// Data-out (initiator to target) buffer.
    pub data_out: Option<UserBuffer>,
    /// Data-in (target to initiator) buffer.
    pub data_in: Option<UserBuffer>,
}

/// A SCSI response as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScsiResponse {
    /// SCSI status byte.
    pub status: u8,
    /// Data overrun (positive) or underrun (negative) byte count.
    pub overrun: i64,
    /// Sense data, if the target supplied any.
    pub sense: Option<ScsiSense>,
}

/// Command transport underneath the SCSI session.
///
/// Implemented by the SRP session; test fakes script it directly.
pub trait ScsiTransport: Send {
    /// Issue a command. Returns the assigned transport tag.
    fn command(&mut self, cookie: u32, cmd: &ScsiCmd) -> Result<u32, SanError>;

    /// Current flow-control window. Zero blocks issuance.
    fn window(&self) -> usize;

    /// Poll for one completed command.
    ///
    /// `Err` means the transport has failed fatally; the caller fans
    /// the reason out to every in-flight command.
    fn poll(&mut self) -> Result<Option<(u32, ScsiResponse)>, SanError>;

    /// Forget an in-flight command. Any late response is discarded.
    fn abort(&mut self, tag: u32);

    /// Fill the protocol portions of a boot firmware table.
    fn describe(&mut self, table: &mut [u8]) -> Result<(), SanError>;
}

/// Kind-specific command state.
#[derive(Debug)]
enum CommandKind {
    Read,
    Write,
    /// Capacity discovery, with its staging buffer.
    ///
    /// The buffer is boxed so that the bus address handed to the
    /// transport stays stable while the command moves between tables.
    ReadCapacity { use16: bool, data: Box<[u8; CAPACITY_16_LEN]> },
}

/// An in-flight SCSI command.
#[derive(Debug)]
struct ScsiCommand {
    kind: CommandKind,
    lba: u64,
    count: u32,
    buffer: Option<UserBuffer>,
    tag: u32,
    retries: u32,
    outcome: Option<Result<(), SanError>>,
}

impl ScsiCommand {
    /// Build the transport-level command for the current attempt.
    fn build(&self, lun: ScsiLun) -> ScsiCmd {
        match &self.kind {
            CommandKind::Read => ScsiCmd {
                lun,
                cdb: Cdb::read(self.lba, self.count),
                data_out: None,
                data_in: self.buffer,
            },
            CommandKind::Write => ScsiCmd {
                lun,
                cdb: Cdb::write(self.lba, self.count),
                data_out: self.buffer,
                data_in: None,
            },
            CommandKind::ReadCapacity { use16, data } => {
                let len = if *use16 { CAPACITY_16_LEN } else { CAPACITY_10_LEN };
                let cdb = if *use16 {
                    Cdb::ReadCapacity16 {
                        alloc_len: len as u32,
                    }
                } else {
                    Cdb::ReadCapacity10
                };
                ScsiCmd {
                    lun,
                    cdb,
                    data_out: None,
                    data_in: Some(UserBuffer::new(data.as_ptr() as u64, len as u32)),
                }
            }
        }
    }
}

/// A SCSI block device session.
pub struct ScsiDevice {
    transport: Box<dyn ScsiTransport>,
    lun: ScsiLun,
    commands: HashMap<u32, ScsiCommand>,
    next_handle: u32,
    capacity: Option<BlockCapacity>,
    failed: Option<SanError>,
}

impl ScsiDevice {
    /// Open a SCSI device over a command transport.
    pub fn new(transport: Box<dyn ScsiTransport>, lun: ScsiLun) -> Self {
        debug!("SCSI created for LUN {}", lun);
        ScsiDevice {
            transport,
            lun,
            commands: HashMap::new(),
            next_handle: 0,
            capacity: None,
            failed: None,
        }
    }

    /// Start a command of the given kind.
    fn start(
        &mut self,
        kind: CommandKind,
        lba: u64,
        count: u32,
        buffer: Option<UserBuffer>,
    ) -> Result<CommandHandle, SanError> {
        if let Some(err) = self.failed {
            return Err(err);
        }
        self.next_handle = self.next_handle.wrapping_add(1);
        let cookie = self.next_handle;
        let mut command = ScsiCommand {
            kind,
            lba,
            count,
            buffer,
            tag: 0,
            retries: 0,
            outcome: None,
        };
        self.issue(cookie, &mut command)?;
        self.commands.insert(cookie, command);
        Ok(CommandHandle(cookie))
    }

    /// Construct and issue one attempt of a command.
    fn issue(&mut self, cookie: u32, command: &mut ScsiCommand) -> Result<(), SanError> {
        let cmd = command.build(self.lun);
        let tag = self.transport.command(cookie, &cmd)?;
        if command.tag != 0 {
            debug!("SCSI tag {:08x} is now tag {:08x}", command.tag, tag);
        }
        command.tag = tag;
        Ok(())
    }

    /// Complete a command attempt, retrying if the budget allows.
    fn complete(&mut self, cookie: u32, mut command: ScsiCommand, rc: Result<(), SanError>) {
        if let Err(mut err) = rc {
            if command.retries < SCSI_MAX_RETRIES {
                command.retries += 1;
                debug!(
                    "SCSI tag {:08x} failed: {:?}, retrying (retry {})",
                    command.tag, err, command.retries
                );
                match self.issue(cookie, &mut command) {
                    Ok(()) => {
                        self.commands.insert(cookie, command);
                        return;
                    }
                    Err(reissue) => err = reissue,
                }
            }
            command.outcome = Some(Err(err));
            self.commands.insert(cookie, command);
            return;
        }

        match &mut command.kind {
            CommandKind::Read | CommandKind::Write => {
                command.outcome = Some(Ok(()));
            }
            CommandKind::ReadCapacity { use16, data } => {
                let (blocks, blksize) = if *use16 {
                    let lba = u64::from_be_bytes(data[0..8].try_into().unwrap());
                    let blksize = u32::from_be_bytes(data[8..12].try_into().unwrap());
                    (lba + 1, blksize)
                } else {
                    let lba = u32::from_be_bytes(data[0..4].try_into().unwrap());
                    let blksize = u32::from_be_bytes(data[4..8].try_into().unwrap());
                    if lba == u32::MAX {
                        // Capacity range exceeded. READ CAPACITY (16) is
                        // not mandatory on all targets, so it is only
                        // tried once the 10-byte form has overflowed.
                        // The retry budget carries over to the reissue.
                        *use16 = true;
                        if let Err(err) = self.issue(cookie, &mut command) {
                            command.outcome = Some(Err(err));
                        }
                        self.commands.insert(cookie, command);
                        return;
                    }
                    (lba as u64 + 1, blksize)
                };
                self.capacity = Some(BlockCapacity {
                    blocks,
                    blksize,
                    max_count: BlockCapacity::UNLIMITED,
                });
                command.outcome = Some(Ok(()));
            }
        }
        self.commands.insert(cookie, command);
    }

    /// Handle one transport response.
    fn handle_response(&mut self, cookie: u32, response: ScsiResponse) {
        let command = match self.commands.remove(&cookie) {
            Some(command) => command,
            None => return,
        };
        let rc = if response.status == 0 {
            Ok(())
        } else {
            if let Some(sense) = response.sense {
                warn!(
                    "SCSI tag {:08x} status {:02x} overrun {} sense {:02x}:{:02x}:{:08x}",
                    command.tag,
                    response.status,
                    response.overrun,
                    sense.code,
                    sense.key,
                    sense.info
                );
            } else {
                warn!(
                    "SCSI tag {:08x} status {:02x} overrun {}",
                    command.tag, response.status, response.overrun
                );
            }
            Err(SanError::Io)
        };
        self.complete(cookie, command, rc);
    }

    /// Fail every in-flight command and latch the device error.
    fn fail_all(&mut self, err: SanError) {
        if self.failed.is_none() {
            warn!("SCSI device failed: {:?}", err);
            self.failed = Some(err);
        }
        for command in self.commands.values_mut() {
            if command.outcome.is_none() {
                command.outcome = Some(Err(err));
            }
        }
    }
}

impl BlockDevice for ScsiDevice {
    fn window(&self) -> usize {
        self.transport.window()
    }

    fn read(
        &mut self,
        lba: u64,
        count: u32,
        buffer: UserBuffer,
    ) -> Result<CommandHandle, SanError> {
        self.start(CommandKind::Read, lba, count, Some(buffer))
    }

    fn write(
        &mut self,
        lba: u64,
        count: u32,
        buffer: UserBuffer,
    ) -> Result<CommandHandle, SanError> {
        self.start(CommandKind::Write, lba, count, Some(buffer))
    }

    fn read_capacity(&mut self) -> Result<CommandHandle, SanError> {
        let kind = CommandKind::ReadCapacity {
            use16: false,
            data: Box::new([0u8; CAPACITY_16_LEN]),
        };
        self.start(kind, 0, 0, None)
    }

    fn poll(&mut self, handle: CommandHandle) -> Option<Result<(), SanError>> {
        let outcome = self.commands.get(&handle.0)?.outcome?;
        self.commands.remove(&handle.0);
        Some(outcome)
    }

    fn abort(&mut self, handle: CommandHandle, reason: SanError) {
        if let Some(command) = self.commands.remove(&handle.0) {
            debug!("SCSI tag {:08x} aborted: {:?}", command.tag, reason);
            self.transport.abort(command.tag);
        }
    }

    fn step(&mut self) {
        loop {
            match self.transport.poll() {
                Ok(Some((cookie, response))) => self.handle_response(cookie, response),
                Ok(None) => break,
                Err(err) => {
                    self.fail_all(err);
                    break;
                }
            }
        }
    }

    fn capacity(&self) -> Option<BlockCapacity> {
        self.capacity
    }

    fn error(&self) -> Option<SanError> {
        self.failed
    }

    fn describe(&mut self, table: &mut [u8]) -> Result<(), SanError> {
        self.transport.describe(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeTransportState {
        issued: Vec<(u32, ScsiCmd)>,
        responses: VecDeque<(u32, ScsiResponse)>,
        aborted: Vec<u32>,
        next_tag: u32,
        window: usize,
        fail_command: Option<SanError>,
        fail_poll: Option<SanError>,
        capacity_data: Option<Vec<u8>>,
    }

    #[derive(Clone)]
    struct FakeTransport(Arc<Mutex<FakeTransportState>>);

    impl FakeTransport {
        fn new() -> Self {
            let state = FakeTransportState {
                window: usize::MAX,
                ..Default::default()
            };
            FakeTransport(Arc::new(Mutex::new(state)))
        }

        fn state(&self) -> std::sync::MutexGuard<'_, FakeTransportState> {
            self.0.lock().unwrap()
        }

        fn respond(&self, cookie: u32, status: u8) {
            self.state().responses.push_back((
                cookie,
                ScsiResponse {
                    status,
                    ..Default::default()
                },
            ));
        }
    }

    impl ScsiTransport for FakeTransport {
        fn command(&mut self, cookie: u32, cmd: &ScsiCmd) -> Result<u32, SanError> {
            let mut state = self.state();
            if let Some(err) = state.fail_command {
                return Err(err);
            }
            // Stand in for the target's RDMA engine on capacity reads.
            if let Some(data) = state.capacity_data.clone() {
                if let Some(buffer) = cmd.data_in {
                    if matches!(
                        cmd.cdb,
                        Cdb::ReadCapacity10 | Cdb::ReadCapacity16 { .. }
                    ) {
                        let len = data.len().min(buffer.len() as usize);
                        unsafe { buffer.bytes_mut()[..len].copy_from_slice(&data[..len]) };
                    }
                }
            }
            state.issued.push((cookie, *cmd));
            state.next_tag += 1;
            Ok(state.next_tag)
        }

        fn window(&self) -> usize {
            self.state().window
        }

        fn poll(&mut self) -> Result<Option<(u32, ScsiResponse)>, SanError> {
            let mut state = self.state();
            if let Some(err) = state.fail_poll {
                return Err(err);
            }
            Ok(state.responses.pop_front())
        }

        fn abort(&mut self, tag: u32) {
            self.state().aborted.push(tag);
        }

        fn describe(&mut self, _table: &mut [u8]) -> Result<(), SanError> {
            Ok(())
        }
    }

    fn device(transport: &FakeTransport) -> ScsiDevice {
        ScsiDevice::new(Box::new(transport.clone()), ScsiLun::default())
    }

    #[test]
    fn test_lun_parse() {
        assert_eq!(ScsiLun::parse("").unwrap(), ScsiLun::default());
        let lun = ScsiLun::parse("1").unwrap();
        assert_eq!(lun.bytes(), &[0, 1, 0, 0, 0, 0, 0, 0]);
        let lun = ScsiLun::parse("1-2-3-4").unwrap();
        assert_eq!(lun.bytes(), &[0, 1, 0, 2, 0, 3, 0, 4]);
        let lun = ScsiLun::parse("ff00").unwrap();
        assert_eq!(lun.bytes(), &[0xFF, 0, 0, 0, 0, 0, 0, 0]);
        assert!(ScsiLun::parse("1-2-3-4-5").is_err());
        assert!(ScsiLun::parse("1--2").is_err());
        assert!(ScsiLun::parse("xyzzy").is_err());
        assert!(ScsiLun::parse("12345").is_err());
    }

    #[test]
    fn test_lun_display() {
        let lun = ScsiLun::parse("1-2").unwrap();
        assert_eq!(format!("{}", lun), "0001-0002-0000-0000");
    }

    #[test]
    fn test_cdb_roundtrip() {
        let cdbs = [
            Cdb::Read10 {
                lba: 0x1234_5678,
                len: 0x9ABC,
            },
            Cdb::Write10 { lba: 1, len: 2 },
            Cdb::Read16 {
                lba: 0x1_0000_0000,
                len: 0x1234_5678,
            },
            Cdb::Write16 {
                lba: u64::MAX,
                len: u32::MAX,
            },
            Cdb::ReadCapacity10,
            Cdb::ReadCapacity16 { alloc_len: 32 },
        ];
        for cdb in cdbs {
            assert_eq!(Cdb::decode(&cdb.encode()).unwrap(), cdb);
        }
        assert!(Cdb::decode(&[0xFFu8; 16]).is_err());
    }

    #[test]
    fn test_cdb_opcode_selection() {
        // Boundary: lba + count == 2^32 - 1 still fits the 10-byte form.
        assert!(matches!(
            Cdb::read(0xFFFF_FFFE, 1),
            Cdb::Read10 { lba: 0xFFFF_FFFE, len: 1 }
        ));
        assert!(matches!(Cdb::read(0xFFFF_FFFF, 1), Cdb::Read16 { .. }));
        assert!(matches!(Cdb::write(0, 1), Cdb::Write10 { .. }));
        assert!(matches!(
            Cdb::write(0x1_0000_0000, 1),
            Cdb::Write16 { lba: 0x1_0000_0000, len: 1 }
        ));
    }

    #[test]
    fn test_sense_parse() {
        let mut data = [0u8; 18];
        data[0] = 0xF0;
        data[2] = 0x26;
        data[3..7].copy_from_slice(&0x1234_5678u32.to_be_bytes());
        let sense = ScsiSense::parse(&data).unwrap();
        assert_eq!(sense.code, 0x70);
        assert_eq!(sense.key, 0x06);
        assert_eq!(sense.info, 0x1234_5678);
        assert!(ScsiSense::parse(&data[..4]).is_none());
    }

    #[test]
    fn test_read_issues_data_in() {
        let transport = FakeTransport::new();
        let mut dev = device(&transport);
        let buffer = UserBuffer::new(0x1000, 4096);
        let handle = dev.read(8, 8, buffer).unwrap();
        assert!(dev.poll(handle).is_none());
        let state = transport.state();
        let (_, cmd) = &state.issued[0];
        assert_eq!(cmd.cdb, Cdb::Read10 { lba: 8, len: 8 });
        assert_eq!(cmd.data_in, Some(buffer));
        assert_eq!(cmd.data_out, None);
    }

    #[test]
    fn test_write_completes() {
        let transport = FakeTransport::new();
        let mut dev = device(&transport);
        let handle = dev.write(0, 1, UserBuffer::new(0x2000, 512)).unwrap();
        let cookie = transport.state().issued[0].0;
        transport.respond(cookie, 0);
        dev.step();
        assert_eq!(dev.poll(handle), Some(Ok(())));
        // Outcome is taken exactly once.
        assert!(dev.poll(handle).is_none());
    }

    #[test]
    fn test_retry_ceiling() {
        let transport = FakeTransport::new();
        let mut dev = device(&transport);
        let handle = dev.read(0, 1, UserBuffer::new(0x1000, 512)).unwrap();
        let cookie = transport.state().issued[0].0;
        // Ten failures are absorbed by retries.
        for attempt in 1..=SCSI_MAX_RETRIES {
            transport.respond(cookie, 0x02);
            dev.step();
            assert!(dev.poll(handle).is_none(), "attempt {}", attempt);
            assert_eq!(transport.state().issued.len() as u32, attempt + 1);
        }
        // The eleventh completion surfaces to the caller.
        transport.respond(cookie, 0x02);
        dev.step();
        assert_eq!(dev.poll(handle), Some(Err(SanError::Io)));
        assert_eq!(transport.state().issued.len() as u32, SCSI_MAX_RETRIES + 1);
    }

    #[test]
    fn test_retry_uses_fresh_tag() {
        let transport = FakeTransport::new();
        let mut dev = device(&transport);
        let handle = dev.read(0, 1, UserBuffer::new(0x1000, 512)).unwrap();
        let cookie = transport.state().issued[0].0;
        transport.respond(cookie, 0x08);
        dev.step();
        assert!(dev.poll(handle).is_none());
        // Fresh tag per attempt; same cookie.
        let state = transport.state();
        assert_eq!(state.issued[0].0, state.issued[1].0);
        assert_eq!(state.next_tag, 2);
    }

    #[test]
    fn test_read_capacity() {
        let transport = FakeTransport::new();
        let mut dev = device(&transport);
        let mut data = Vec::new();
        data.extend_from_slice(&999u32.to_be_bytes());
        data.extend_from_slice(&512u32.to_be_bytes());
        transport.state().capacity_data = Some(data);
        let handle = dev.read_capacity().unwrap();
        let cookie = transport.state().issued[0].0;
        transport.respond(cookie, 0);
        dev.step();
        assert_eq!(dev.poll(handle), Some(Ok(())));
        let capacity = dev.capacity().unwrap();
        assert_eq!(capacity.blocks, 1000);
        assert_eq!(capacity.blksize, 512);
        assert_eq!(capacity.max_count, BlockCapacity::UNLIMITED);
    }

    #[test]
    fn test_read_capacity_fallback_to_16() {
        let transport = FakeTransport::new();
        let mut dev = device(&transport);
        // READ CAPACITY (10) reports the wrap marker.
        let mut data = Vec::new();
        data.extend_from_slice(&u32::MAX.to_be_bytes());
        data.extend_from_slice(&512u32.to_be_bytes());
        transport.state().capacity_data = Some(data);
        let handle = dev.read_capacity().unwrap();
        let cookie = transport.state().issued[0].0;
        assert_eq!(transport.state().issued[0].1.cdb, Cdb::ReadCapacity10);
        // Switch the scripted data to the 16-byte form before responding.
        let mut data = Vec::new();
        data.extend_from_slice(&0xFFFF_FFFFu64.to_be_bytes());
        data.extend_from_slice(&512u32.to_be_bytes());
        data.resize(32, 0);
        transport.state().capacity_data = Some(data);
        transport.respond(cookie, 0);
        dev.step();
        // The fallback reissued as READ CAPACITY (16).
        assert!(dev.poll(handle).is_none());
        assert_eq!(
            transport.state().issued[1].1.cdb,
            Cdb::ReadCapacity16 { alloc_len: 32 }
        );
        transport.respond(cookie, 0);
        dev.step();
        assert_eq!(dev.poll(handle), Some(Ok(())));
        assert_eq!(dev.capacity().unwrap().blocks, 1u64 << 32);
    }

    #[test]
    fn test_read_capacity_fallback_keeps_retry_budget() {
        let transport = FakeTransport::new();
        let mut dev = device(&transport);
        let mut data = Vec::new();
        data.extend_from_slice(&u32::MAX.to_be_bytes());
        data.extend_from_slice(&512u32.to_be_bytes());
        transport.state().capacity_data = Some(data);
        let handle = dev.read_capacity().unwrap();
        let cookie = transport.state().issued[0].0;
        // Exhaust the budget on the 10-byte form.
        for _ in 0..SCSI_MAX_RETRIES {
            transport.respond(cookie, 0x02);
            dev.step();
        }
        assert!(dev.poll(handle).is_none());
        // The wrap marker triggers the 16-byte reissue without
        // consuming a retry.
        transport.respond(cookie, 0);
        dev.step();
        assert!(dev.poll(handle).is_none());
        // No budget remains for the next failure.
        transport.respond(cookie, 0x02);
        dev.step();
        assert_eq!(dev.poll(handle), Some(Err(SanError::Io)));
    }

    #[test]
    fn test_transport_failure_fans_out() {
        let transport = FakeTransport::new();
        let mut dev = device(&transport);
        let first = dev.read(0, 1, UserBuffer::new(0x1000, 512)).unwrap();
        let second = dev.read(1, 1, UserBuffer::new(0x2000, 512)).unwrap();
        transport.state().fail_poll = Some(SanError::NotConnected);
        dev.step();
        assert_eq!(dev.poll(first), Some(Err(SanError::NotConnected)));
        assert_eq!(dev.poll(second), Some(Err(SanError::NotConnected)));
        assert_eq!(dev.error(), Some(SanError::NotConnected));
        // New commands fail immediately on a dead device.
        assert_eq!(
            dev.read(2, 1, UserBuffer::new(0x3000, 512)),
            Err(SanError::NotConnected)
        );
    }

    #[test]
    fn test_abort_forgets_command() {
        let transport = FakeTransport::new();
        let mut dev = device(&transport);
        let handle = dev.read(0, 1, UserBuffer::new(0x1000, 512)).unwrap();
        dev.abort(handle, SanError::TimedOut);
        assert_eq!(transport.state().aborted, vec![1]);
        assert!(dev.poll(handle).is_none());
        // A late response for the aborted command is ignored.
        transport.respond(1, 0);
        dev.step();
        assert!(dev.poll(handle).is_none());
    }
}
