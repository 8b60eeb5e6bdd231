//! Shared test fixtures.
//!
//! An in-memory firmware environment and a scripted block device, plus
//! a guard serializing tests that touch the process-wide statics (the
//! drive registry, the pump slot, and the table buffer).

use std::sync::{Arc, Mutex, MutexGuard};

use sanboot_block::{sbft, BlockCapacity, BlockDevice, CommandHandle, SanError, UserBuffer};

use crate::drive::{Drive, DeviceOpener};
use crate::firmware::Firmware;

static SERIAL: Mutex<()> = Mutex::new(());

/// Serialize tests using the process-wide statics, starting from an
/// empty registry.
pub fn serialize() -> MutexGuard<'static, ()> {
    let guard = SERIAL.lock().unwrap_or_else(|poison| poison.into_inner());
    crate::drive::clear_registry();
    guard
}

/// Scripted firmware environment state.
pub struct FwState {
    pub drive_count: u8,
    pub vector_hooked: bool,
    pub hooks: u32,
    pub unhooks: u32,
    pub ticks: u64,
    /// Ticks added per `ticks()` call, standing in for wall time.
    pub auto_tick: u64,
    /// Real-mode memory image.
    pub memory: Vec<u8>,
    pub bootsector_result: Result<(), SanError>,
    pub bootsector_calls: Vec<(u16, u16, u8)>,
    pub memmap_snapshots: u32,
}

/// Scripted firmware environment.
#[derive(Clone)]
pub struct FakeFirmware(Arc<Mutex<FwState>>);

impl FakeFirmware {
    pub fn new() -> Self {
        FakeFirmware(Arc::new(Mutex::new(FwState {
            drive_count: 0,
            vector_hooked: false,
            hooks: 0,
            unhooks: 0,
            ticks: 0,
            auto_tick: 1,
            memory: vec![0; 0x11_0000],
            bootsector_result: Ok(()),
            bootsector_calls: Vec::new(),
            memmap_snapshots: 0,
        })))
    }

    pub fn state(&self) -> MutexGuard<'_, FwState> {
        self.0.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn linear(&self, segment: u16, offset: u16) -> usize {
        ((segment as usize) << 4) + offset as usize
    }
}

impl Firmware for FakeFirmware {
    fn drive_count(&self) -> u8 {
        self.state().drive_count
    }

    fn set_drive_count(&mut self, count: u8) {
        self.state().drive_count = count;
    }

    fn hook_disk_vector(&mut self) {
        let mut state = self.state();
        state.vector_hooked = true;
        state.hooks += 1;
    }

    fn unhook_disk_vector(&mut self) {
        let mut state = self.state();
        state.vector_hooked = false;
        state.unhooks += 1;
    }

    fn ticks(&self) -> u64 {
        let mut state = self.state();
        state.ticks += state.auto_tick;
        state.ticks
    }

    fn ticks_per_sec(&self) -> u64 {
        100
    }

    fn real_to_addr(&self, segment: u16, offset: u16) -> u64 {
        let state = self.state();
        state.memory.as_ptr() as u64 + self.linear(segment, offset) as u64
    }

    fn read_real(&self, segment: u16, offset: u16, buf: &mut [u8]) {
        let state = self.state();
        let start = self.linear(segment, offset);
        buf.copy_from_slice(&state.memory[start..start + buf.len()]);
    }

    fn write_real(&mut self, segment: u16, offset: u16, data: &[u8]) {
        let mut state = self.state();
        let start = self.linear(segment, offset);
        state.memory[start..start + data.len()].copy_from_slice(data);
    }

    fn call_bootsector(
        &mut self,
        segment: u16,
        offset: u16,
        drive: u8,
    ) -> Result<(), SanError> {
        let mut state = self.state();
        state.bootsector_calls.push((segment, offset, drive));
        state.bootsector_result
    }

    fn snapshot_memory_map(&self) {
        self.state().memmap_snapshots += 1;
    }
}

/// Scripted block device state.
pub struct DevState {
    pub capacity: BlockCapacity,
    pub window: usize,
    /// Open the window once this many steps have elapsed.
    pub open_window_after: Option<u64>,
    pub steps: u64,
    /// Recorded reads: (lba, count, buffer address).
    pub reads: Vec<(u64, u32, u64)>,
    /// Recorded writes: (lba, count, buffer address).
    pub writes: Vec<(u64, u32, u64)>,
    pub capacity_reads: u32,
    /// Data served for reads of block zero.
    pub sector0: Option<Vec<u8>>,
    /// Fail the n-th and later commands with the given reason.
    pub fail_after: Option<(u32, SanError)>,
    /// Accept commands but never complete them.
    pub never_complete: bool,
    pub latched: Option<SanError>,
    pub aborted: Vec<CommandHandle>,
    pub described: bool,
    pub opens: u32,
    ops: u32,
    pending: Vec<(u32, Option<Result<(), SanError>>)>,
    next_handle: u32,
}

/// Scripted block device.
#[derive(Clone)]
pub struct FakeBlockDevice(Arc<Mutex<DevState>>);

impl FakeBlockDevice {
    /// Device with the given block count, 512-byte blocks, and no
    /// fragmentation limit.
    pub fn with_blocks(blocks: u64) -> Self {
        FakeBlockDevice(Arc::new(Mutex::new(DevState {
            capacity: BlockCapacity {
                blocks,
                blksize: 512,
                max_count: BlockCapacity::UNLIMITED,
            },
            window: usize::MAX,
            open_window_after: None,
            steps: 0,
            reads: Vec::new(),
            writes: Vec::new(),
            capacity_reads: 0,
            sector0: None,
            fail_after: None,
            never_complete: false,
            latched: None,
            aborted: Vec::new(),
            described: false,
            opens: 0,
            ops: 0,
            pending: Vec::new(),
            next_handle: 0,
        })))
    }

    pub fn state(&self) -> MutexGuard<'_, DevState> {
        self.0.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Device opener sharing this device's scripted state.
    pub fn opener(&self) -> DeviceOpener {
        let dev = self.clone();
        Box::new(move |_uri| {
            dev.state().opens += 1;
            Ok(Box::new(dev.clone()))
        })
    }

    fn start(&mut self) -> CommandHandle {
        let mut state = self.state();
        state.ops += 1;
        let outcome = match state.fail_after {
            Some((nth, err)) if state.ops >= nth => Err(err),
            _ => Ok(()),
        };
        state.next_handle += 1;
        let handle = state.next_handle;
        let outcome = if state.never_complete {
            None
        } else {
            Some(outcome)
        };
        state.pending.push((handle, outcome));
        CommandHandle(handle)
    }
}

impl BlockDevice for FakeBlockDevice {
    fn window(&self) -> usize {
        let state = self.state();
        match state.open_window_after {
            Some(after) if state.steps < after => 0,
            Some(_) => usize::MAX,
            None => state.window,
        }
    }

    fn read(
        &mut self,
        lba: u64,
        count: u32,
        buffer: UserBuffer,
    ) -> Result<CommandHandle, SanError> {
        {
            let state = self.state();
            if let Some(data) = &state.sector0 {
                if lba == 0 {
                    let len = data.len().min(buffer.len() as usize);
                    unsafe { buffer.bytes_mut()[..len].copy_from_slice(&data[..len]) };
                }
            }
        }
        self.state().reads.push((lba, count, buffer.addr()));
        Ok(self.start())
    }

    fn write(
        &mut self,
        lba: u64,
        count: u32,
        buffer: UserBuffer,
    ) -> Result<CommandHandle, SanError> {
        self.state().writes.push((lba, count, buffer.addr()));
        Ok(self.start())
    }

    fn read_capacity(&mut self) -> Result<CommandHandle, SanError> {
        self.state().capacity_reads += 1;
        Ok(self.start())
    }

    fn poll(&mut self, handle: CommandHandle) -> Option<Result<(), SanError>> {
        let mut state = self.state();
        let index = state.pending.iter().position(|(h, _)| *h == handle.0)?;
        let outcome = state.pending[index].1?;
        state.pending.remove(index);
        Some(outcome)
    }

    fn abort(&mut self, handle: CommandHandle, _reason: SanError) {
        let mut state = self.state();
        state.pending.retain(|(h, _)| *h != handle.0);
        state.aborted.push(handle);
    }

    fn step(&mut self) {
        self.state().steps += 1;
    }

    fn capacity(&self) -> Option<BlockCapacity> {
        Some(self.state().capacity)
    }

    fn error(&self) -> Option<SanError> {
        self.state().latched
    }

    fn describe(&mut self, table: &mut [u8]) -> Result<(), SanError> {
        if table.len() < sbft::SBFT_LEN {
            return Err(SanError::BufferTooSmall);
        }
        table[sbft::SIGNATURE].copy_from_slice(&sbft::SBFT_SIG);
        table[sbft::LENGTH].copy_from_slice(&(sbft::SBFT_LEN as u32).to_le_bytes());
        table[sbft::REVISION] = 1;
        table[sbft::SCSI_SUBTABLE] = 0x7B;
        self.state().described = true;
        Ok(())
    }
}

/// A drive record backed by a scripted device, bypassing registration.
pub fn test_drive(dev: &FakeBlockDevice) -> Drive {
    Drive {
        device: Box::new(dev.clone()),
        opener: dev.opener(),
        uri: "srp:test".into(),
        drive: 0x80,
        natural_drive: 0x80,
        cylinders: 64,
        heads: 16,
        sectors_per_track: 63,
        capacity: dev.state().capacity,
        block_err: None,
        last_status: 0,
    }
}

/// A boot sector holding one used partition with the given CHS end
/// head and sector fields.
pub fn mbr_with_partition(end_head: u8, end_sector: u8) -> [u8; 512] {
    let mut mbr = [0u8; 512];
    let entry = 0x1BE;
    mbr[entry + 4] = 0x83;
    mbr[entry + 5] = end_head;
    mbr[entry + 6] = end_sector & 0x3F;
    mbr[0x1FE] = 0x55;
    mbr[0x1FF] = 0xAA;
    mbr
}
