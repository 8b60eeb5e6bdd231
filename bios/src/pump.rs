//! The command pump.
//!
//! The disk-interrupt interface is synchronous: the caller sits in the
//! emulated interrupt until the operation finishes. The underlying
//! block stack is asynchronous. The pump is the single place where the
//! two worlds meet: it drives one command at a time to completion,
//! yielding to the rest of the stack on every step, under an overall
//! deadline.
//!
//! The interrupt interface gives the caller no way to cancel a command,
//! so a wedged device would otherwise hang the machine; the deadline
//! bounces such failures back to the caller instead.

use spin::Mutex;

use sanboot_block::{BlockCapacity, BlockDevice, CommandHandle, SanError, UserBuffer};

use crate::drive::Drive;
use crate::firmware::Firmware;

/// Overall timeout for emulated disk commands, in seconds.
pub const COMMAND_TIMEOUT_SECS: u64 = 15;

/// The single active command slot.
static COMMAND: Mutex<Slot> = Mutex::new(Slot { active: false });

struct Slot {
    active: bool,
}

/// Block access direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
}

/// Run one command against a drive's block device.
///
/// Claims the process-wide command slot, arms the deadline, waits for a
/// positive transmit window, issues the command, and waits for its
/// outcome, stepping the device between polls.
pub(crate) fn run(
    drive: &mut Drive,
    fw: &mut dyn Firmware,
    issue: impl FnOnce(&mut dyn BlockDevice) -> Result<CommandHandle, SanError>,
) -> Result<(), SanError> {
    {
        let mut slot = COMMAND.lock();
        if slot.active {
            return Err(SanError::Busy);
        }
        slot.active = true;
    }
    let result = run_slot(drive, fw, issue);
    COMMAND.lock().active = false;
    result
}

fn run_slot(
    drive: &mut Drive,
    fw: &mut dyn Firmware,
    issue: impl FnOnce(&mut dyn BlockDevice) -> Result<CommandHandle, SanError>,
) -> Result<(), SanError> {
    let deadline = fw.ticks() + COMMAND_TIMEOUT_SECS * fw.ticks_per_sec();

    // Wait for the device to report a positive transmit window.
    loop {
        if let Some(err) = drive.block_err {
            return Err(err);
        }
        if let Some(err) = drive.device.error() {
            drive.block_err = Some(err);
            return Err(err);
        }
        if drive.device.window() > 0 {
            break;
        }
        if fw.ticks() >= deadline {
            return Err(SanError::TimedOut);
        }
        drive.device.step();
    }

    let handle = issue(drive.device.as_mut())?;

    // Wait for the outcome, yielding to the network stack on each step.
    loop {
        if let Some(outcome) = drive.device.poll(handle) {
            return outcome;
        }
        if fw.ticks() >= deadline {
            drive.device.abort(handle, SanError::TimedOut);
            return Err(SanError::TimedOut);
        }
        drive.device.step();
    }
}

/// Read or write a block range, fragmenting per the device limit.
///
/// Fragments are issued strictly in order; the first failure aborts
/// the whole call.
pub(crate) fn rw(
    drive: &mut Drive,
    fw: &mut dyn Firmware,
    mut lba: u64,
    mut count: u32,
    buffer: UserBuffer,
    access: Access,
) -> Result<(), SanError> {
    let blksize = drive.capacity.blksize as u64;
    let mut addr = buffer.addr();
    while count > 0 {
        let frag = count.min(drive.capacity.max_count);
        let len =
            u32::try_from(frag as u64 * blksize).map_err(|_| SanError::Invalid)?;
        let frag_buffer = UserBuffer::new(addr, len);
        run(drive, fw, |device| match access {
            Access::Read => device.read(lba, frag, frag_buffer),
            Access::Write => device.write(lba, frag, frag_buffer),
        })?;
        lba += frag as u64;
        count -= frag;
        addr += len as u64;
    }
    Ok(())
}

/// Discover and cache a drive's capacity.
pub(crate) fn read_capacity(
    drive: &mut Drive,
    fw: &mut dyn Firmware,
) -> Result<BlockCapacity, SanError> {
    run(drive, fw, |device| device.read_capacity())?;
    let capacity = drive.device.capacity().ok_or(SanError::Io)?;
    drive.capacity = capacity;
    Ok(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_drive, FakeBlockDevice, FakeFirmware};

    #[test]
    fn test_run_completes_immediately_ready_command() {
        let _guard = crate::testutil::serialize();
        let mut fw = FakeFirmware::new();
        let dev = FakeBlockDevice::with_blocks(1024);
        let mut drive = test_drive(&dev);
        run(&mut drive, &mut fw, |device| {
            device.read(4, 2, UserBuffer::new(0x1000, 1024))
        })
        .unwrap();
        assert_eq!(dev.state().reads, vec![(4, 2, 0x1000)]);
    }

    #[test]
    fn test_busy_slot_is_rejected() {
        let _guard = crate::testutil::serialize();
        let mut fw = FakeFirmware::new();
        let dev = FakeBlockDevice::with_blocks(1024);
        let mut drive = test_drive(&dev);
        COMMAND.lock().active = true;
        let result = run(&mut drive, &mut fw, |device| {
            device.read(0, 1, UserBuffer::new(0x1000, 512))
        });
        COMMAND.lock().active = false;
        assert_eq!(result, Err(SanError::Busy));
        assert!(dev.state().reads.is_empty());
    }

    #[test]
    fn test_window_timeout() {
        let _guard = crate::testutil::serialize();
        let mut fw = FakeFirmware::new();
        let dev = FakeBlockDevice::with_blocks(1024);
        dev.state().window = 0;
        let mut drive = test_drive(&dev);
        let start = fw.state().ticks;
        let result = run(&mut drive, &mut fw, |device| {
            device.read(0, 1, UserBuffer::new(0x1000, 512))
        });
        assert_eq!(result, Err(SanError::TimedOut));
        // The deadline is the full command timeout.
        let elapsed = fw.state().ticks - start;
        assert!(elapsed >= COMMAND_TIMEOUT_SECS * fw.ticks_per_sec());
        // Nothing was issued, and the slot is free again.
        assert!(dev.state().reads.is_empty());
        assert!(!COMMAND.lock().active);
    }

    #[test]
    fn test_completion_timeout_aborts_command() {
        let _guard = crate::testutil::serialize();
        let mut fw = FakeFirmware::new();
        let dev = FakeBlockDevice::with_blocks(1024);
        dev.state().never_complete = true;
        let mut drive = test_drive(&dev);
        let result = run(&mut drive, &mut fw, |device| {
            device.read(0, 1, UserBuffer::new(0x1000, 512))
        });
        assert_eq!(result, Err(SanError::TimedOut));
        assert_eq!(dev.state().aborted.len(), 1);
        assert!(!COMMAND.lock().active);
        // The pump remains usable for the next command.
        dev.state().never_complete = false;
        run(&mut drive, &mut fw, |device| {
            device.read(1, 1, UserBuffer::new(0x1000, 512))
        })
        .unwrap();
    }

    #[test]
    fn test_latched_error_short_circuits() {
        let _guard = crate::testutil::serialize();
        let mut fw = FakeFirmware::new();
        let dev = FakeBlockDevice::with_blocks(1024);
        let mut drive = test_drive(&dev);
        drive.block_err = Some(SanError::NotConnected);
        let result = run(&mut drive, &mut fw, |device| {
            device.read(0, 1, UserBuffer::new(0x1000, 512))
        });
        assert_eq!(result, Err(SanError::NotConnected));
        assert!(dev.state().reads.is_empty());
    }

    #[test]
    fn test_device_error_is_latched() {
        let _guard = crate::testutil::serialize();
        let mut fw = FakeFirmware::new();
        let dev = FakeBlockDevice::with_blocks(1024);
        dev.state().latched = Some(SanError::ConnectionReset);
        let mut drive = test_drive(&dev);
        let result = run(&mut drive, &mut fw, |device| {
            device.read(0, 1, UserBuffer::new(0x1000, 512))
        });
        assert_eq!(result, Err(SanError::ConnectionReset));
        assert_eq!(drive.block_err, Some(SanError::ConnectionReset));
    }

    #[test]
    fn test_window_opens_while_waiting() {
        let _guard = crate::testutil::serialize();
        let mut fw = FakeFirmware::new();
        let dev = FakeBlockDevice::with_blocks(1024);
        dev.state().window = 0;
        dev.state().open_window_after = Some(10);
        let mut drive = test_drive(&dev);
        run(&mut drive, &mut fw, |device| {
            device.read(0, 1, UserBuffer::new(0x1000, 512))
        })
        .unwrap();
        assert_eq!(dev.state().reads.len(), 1);
    }

    #[test]
    fn test_rw_fragments_by_max_count() {
        let _guard = crate::testutil::serialize();
        let mut fw = FakeFirmware::new();
        let dev = FakeBlockDevice::with_blocks(1024);
        dev.state().capacity.max_count = 8;
        let mut drive = test_drive(&dev);
        let base = 0x4_0000;
        rw(
            &mut drive,
            &mut fw,
            100,
            20,
            UserBuffer::new(base, 20 * 512),
            Access::Read,
        )
        .unwrap();
        assert_eq!(
            dev.state().reads,
            vec![
                (100, 8, base),
                (108, 8, base + 8 * 512),
                (116, 4, base + 16 * 512),
            ]
        );
    }

    #[test]
    fn test_rw_stops_at_first_failing_fragment() {
        let _guard = crate::testutil::serialize();
        let mut fw = FakeFirmware::new();
        let dev = FakeBlockDevice::with_blocks(1024);
        dev.state().capacity.max_count = 8;
        dev.state().fail_after = Some((2, SanError::Io));
        let mut drive = test_drive(&dev);
        let result = rw(
            &mut drive,
            &mut fw,
            0,
            20,
            UserBuffer::new(0x1000, 20 * 512),
            Access::Write,
        );
        assert_eq!(result, Err(SanError::Io));
        // The third fragment was never issued.
        assert_eq!(dev.state().writes.len(), 2);
    }

    #[test]
    fn test_read_capacity_caches_result() {
        let _guard = crate::testutil::serialize();
        let mut fw = FakeFirmware::new();
        let dev = FakeBlockDevice::with_blocks(4096);
        let mut drive = test_drive(&dev);
        drive.capacity.blocks = 0;
        let capacity = read_capacity(&mut drive, &mut fw).unwrap();
        assert_eq!(capacity.blocks, 4096);
        assert_eq!(drive.capacity.blocks, 4096);
    }
}
