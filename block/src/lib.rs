//! SAN block-device stack.
//!
//! This crate implements the protocol side of a SAN-booted disk:
//! - SCSI session layer: command construction, capacity discovery,
//!   transparent retries (`scsi`)
//! - SRP (SCSI RDMA Protocol) initiator: login handshake, command
//!   framing, response demultiplexing (`srp`)
//! - Boot firmware table layout shared with the firmware-facing
//!   emulator (`sbft`)
//!
//! The reliable message socket that carries SRP information units is an
//! external collaborator behind the [`IuSocket`] trait; the firmware
//! emulator drives a finished device through the [`BlockDevice`] trait.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod sbft;
pub mod scsi;
pub mod srp;

use alloc::vec::Vec;

/// Block stack error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanError {
    /// Overall command deadline expired.
    TimedOut,
    /// SCSI status byte was non-zero after all retries.
    Io,
    /// Malformed parameter or wire record.
    Invalid,
    /// Command issued before login completed.
    Busy,
    /// Drive number collision or tag space exhaustion.
    AddrInUse,
    /// Login rejected by the target.
    PermissionDenied,
    /// No matching drive, command, or tag.
    NotFound,
    /// Unrecognised information-unit type.
    Unsupported,
    /// Session or device is no longer connected.
    NotConnected,
    /// Connection dropped while reopening a device.
    ConnectionReset,
    /// Description buffer too small.
    BufferTooSmall,
    /// Boot sector declined to run.
    Canceled,
    /// Loaded sector is not executable boot code.
    NotExecutable,
}

/// Block device capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCapacity {
    /// Total number of addressable blocks.
    pub blocks: u64,
    /// Block size in bytes.
    pub blksize: u32,
    /// Maximum number of blocks per request.
    pub max_count: u32,
}

impl BlockCapacity {
    /// Per-request block count of a transport with no fragmentation limit.
    pub const UNLIMITED: u32 = u32::MAX;

    /// Total capacity in bytes.
    pub fn bytes(&self) -> u64 {
        self.blocks * self.blksize as u64
    }
}

/// A caller-owned data buffer identified by bus address.
///
/// SRP moves data with target-initiated RDMA: the initiator only ever
/// places the buffer address and length into a direct data descriptor,
/// and the bytes themselves never pass through this code. Non-RDMA
/// backends (and test fakes standing in for the target's DMA engine)
/// may resolve the address with the unsafe accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserBuffer {
    addr: u64,
    len: u32,
}

impl UserBuffer {
    /// Describe the buffer at `addr` spanning `len` bytes.
    pub fn new(addr: u64, len: u32) -> Self {
        UserBuffer { addr, len }
    }

    /// Buffer bus address.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Check for a zero-length buffer.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Resolve the buffer for writing.
    ///
    /// # Safety
    ///
    /// The address range must be valid, exclusively owned by the caller
    /// of the in-flight command, and mapped one-to-one to CPU addresses.
    pub unsafe fn bytes_mut(&self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.addr as *mut u8, self.len as usize)
    }

    /// Resolve the buffer for reading.
    ///
    /// # Safety
    ///
    /// Same requirements as [`UserBuffer::bytes_mut`].
    pub unsafe fn bytes(&self) -> &[u8] {
        core::slice::from_raw_parts(self.addr as *const u8, self.len as usize)
    }
}

/// Caller's handle to an in-flight block command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandHandle(pub u32);

/// Asynchronous block device interface.
///
/// All operations start a command and return a handle immediately; the
/// caller advances the device with [`BlockDevice::step`] until
/// [`BlockDevice::poll`] yields the outcome. A synchronous front end
/// (the firmware emulator's command pump) layers its own deadline on
/// top of this contract.
pub trait BlockDevice: Send {
    /// Current transmit window. Zero blocks issuance.
    fn window(&self) -> usize;

    /// Start reading `count` blocks at `lba` into `buffer`.
    fn read(&mut self, lba: u64, count: u32, buffer: UserBuffer)
        -> Result<CommandHandle, SanError>;

    /// Start writing `count` blocks at `lba` from `buffer`.
    fn write(&mut self, lba: u64, count: u32, buffer: UserBuffer)
        -> Result<CommandHandle, SanError>;

    /// Start discovering the device capacity.
    ///
    /// The result is reported out of band through
    /// [`BlockDevice::capacity`] once the command completes.
    fn read_capacity(&mut self) -> Result<CommandHandle, SanError>;

    /// Take the outcome of a command, if complete.
    fn poll(&mut self, handle: CommandHandle) -> Option<Result<(), SanError>>;

    /// Abandon an in-flight command locally with the given reason.
    fn abort(&mut self, handle: CommandHandle, reason: SanError);

    /// Let received messages, completions, and timers advance.
    fn step(&mut self);

    /// Most recently discovered capacity.
    fn capacity(&self) -> Option<BlockCapacity>;

    /// Latched fatal device error, if the device has failed.
    fn error(&self) -> Option<SanError>;

    /// Fill the protocol portions of a boot firmware table.
    fn describe(&mut self, table: &mut [u8]) -> Result<(), SanError>;
}

/// Reliable message socket carrying SRP information units.
///
/// One `send` or `recv` moves exactly one IU; the transport preserves
/// message boundaries and ordering.
pub trait IuSocket: Send {
    /// Send one information unit.
    fn send(&mut self, iu: &[u8]) -> Result<(), SanError>;

    /// Poll for one received information unit.
    fn recv(&mut self) -> Option<Vec<u8>>;

    /// Fill the transport-specific boot firmware sub-table.
    fn describe(&mut self, table: &mut [u8]) -> Result<(), SanError> {
        let _ = table;
        Ok(())
    }
}
