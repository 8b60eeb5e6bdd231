//! Boot path and boot firmware table publication.
//!
//! Booting loads the master boot record through the emulated disk
//! interrupt, checks its signature, and jumps to it; the boot firmware
//! table describes the SAN drive so the booted operating system can
//! rediscover it after the emulator is gone.

use log::debug;
use spin::Mutex;

use sanboot_block::{sbft, SanError};

use crate::drive;
use crate::firmware::Firmware;
use crate::handler::{self, INT13_READ_SECTORS};
use crate::registers::{Flags, Registers};

/// Boot sector load segment.
const BOOTSECTOR_SEGMENT: u16 = 0x0000;
/// Boot sector load offset.
const BOOTSECTOR_OFFSET: u16 = 0x7C00;
/// Location of the boot signature within the loaded sector.
const BOOT_SIGNATURE_OFFSET: u16 = 0x7DFE;
/// Boot signature bytes as they appear in memory.
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// OEM ID published in the table header.
const OEM_ID: &[u8; 6] = b"SANBT ";
/// OEM table ID published in the table header.
const OEM_TABLE_ID: &[u8; 8] = b"SANBOOT ";

/// The reserved boot firmware table buffer.
#[repr(align(16))]
struct TableBuffer([u8; sbft::SBFT_BUFFER_LEN]);

static XBFT: Mutex<TableBuffer> = Mutex::new(TableBuffer([0; sbft::SBFT_BUFFER_LEN]));

/// Attempt to boot from an emulated drive.
///
/// Loads the master boot record to 0000:7C00 with an emulated CHS read
/// of one sector, validates the 0x55AA signature, snapshots the memory
/// map for post-mortem use, and jumps to the loaded sector with the
/// drive number in DL.
///
/// By definition this function cannot succeed; it returns the reason
/// the machine is still running.
pub fn boot(fw: &mut dyn Firmware, drive: u8) -> SanError {
    debug!("INT13 drive {:02x} booting", drive);

    let mut regs = Registers::new();
    regs.set_ah(INT13_READ_SECTORS);
    regs.set_al(1);
    regs.cx = 0x0001; // cylinder 0, sector 1
    regs.set_dh(0);
    regs.set_dl(drive);
    regs.es = BOOTSECTOR_SEGMENT;
    regs.bx = BOOTSECTOR_OFFSET;
    handler::int13(fw, &mut regs);
    if !regs.flags.contains(Flags::OVERFLOW) {
        debug!("INT13 cannot find emulated drive {:02x}", drive);
        return SanError::NotFound;
    }
    if regs.flags.contains(Flags::CARRY) {
        return SanError::Io;
    }

    let mut signature = [0u8; 2];
    fw.read_real(BOOTSECTOR_SEGMENT, BOOT_SIGNATURE_OFFSET, &mut signature);
    if signature != BOOT_SIGNATURE {
        debug!(
            "INT13 drive {:02x} invalid disk signature {:02x}{:02x}",
            drive, signature[0], signature[1]
        );
        return SanError::NotExecutable;
    }

    // Keep a memory-map record around; boot failures are regularly
    // memory-map problems.
    fw.snapshot_memory_map();

    match fw.call_bootsector(BOOTSECTOR_SEGMENT, BOOTSECTOR_OFFSET, drive) {
        Ok(()) => SanError::Canceled,
        Err(err) => {
            debug!("INT13 drive {:02x} boot returned: {:?}", drive, err);
            err
        }
    }
}

/// Describe an emulated drive for the SAN-booted operating system.
///
/// Zeroes the reserved table buffer, fills the OEM identity fields,
/// hands the protocol sub-tables to the block stack, and fixes up the
/// header checksum so the table sums to zero modulo 256.
pub fn describe(number: u8) -> Result<(), SanError> {
    let mut drives = drive::DRIVES.lock();
    let Some(drive) = drives.iter_mut().find(|d| d.drive == number) else {
        debug!("INT13 cannot find emulated drive {:02x}", number);
        return Err(SanError::NotFound);
    };

    let mut table = XBFT.lock();
    table.0.fill(0);
    table.0[sbft::OEM_ID].copy_from_slice(OEM_ID);
    table.0[sbft::OEM_TABLE_ID].copy_from_slice(OEM_TABLE_ID);
    drive.device.describe(&mut table.0)?;
    sbft::fix_checksum(&mut table.0);
    debug!(
        "INT13 drive {:02x} described using boot firmware table",
        number
    );
    Ok(())
}

/// Run `f` over the published boot firmware table.
pub fn with_table<R>(f: impl FnOnce(&[u8]) -> R) -> R {
    let table = XBFT.lock();
    f(&table.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeBlockDevice, FakeFirmware};

    fn bootable_sector() -> Vec<u8> {
        let mut sector = vec![0u8; 512];
        sector[0x1FE] = 0x55;
        sector[0x1FF] = 0xAA;
        sector
    }

    #[test]
    fn test_boot_loads_and_jumps() {
        let _guard = crate::testutil::serialize();
        let mut fw = FakeFirmware::new();
        let dev = FakeBlockDevice::with_blocks(1 << 20);
        dev.state().sector0 = Some(bootable_sector());
        let number = drive::hook(&mut fw, dev.opener(), "srp:target0", None).unwrap();
        dev.state().reads.clear();
        fw.state().bootsector_result = Err(SanError::Io);
        let err = boot(&mut fw, number);
        assert_eq!(err, SanError::Io);
        // One single-sector read of block zero into 0000:7C00.
        let addr = fw.real_to_addr(0x0000, 0x7C00);
        assert_eq!(dev.state().reads, vec![(0, 1, addr)]);
        assert_eq!(fw.state().bootsector_calls, vec![(0x0000, 0x7C00, number)]);
        assert_eq!(fw.state().memmap_snapshots, 1);
        drive::unhook(&mut fw, number);
    }

    #[test]
    fn test_boot_never_succeeds() {
        let _guard = crate::testutil::serialize();
        let mut fw = FakeFirmware::new();
        let dev = FakeBlockDevice::with_blocks(1 << 20);
        dev.state().sector0 = Some(bootable_sector());
        let number = drive::hook(&mut fw, dev.opener(), "srp:target0", None).unwrap();
        // Even a boot sector that "returns success" is a failure here.
        fw.state().bootsector_result = Ok(());
        assert_eq!(boot(&mut fw, number), SanError::Canceled);
        drive::unhook(&mut fw, number);
    }

    #[test]
    fn test_boot_rejects_bad_signature() {
        let _guard = crate::testutil::serialize();
        let mut fw = FakeFirmware::new();
        let dev = FakeBlockDevice::with_blocks(1 << 20);
        let number = drive::hook(&mut fw, dev.opener(), "srp:target0", None).unwrap();
        assert_eq!(boot(&mut fw, number), SanError::NotExecutable);
        assert!(fw.state().bootsector_calls.is_empty());
        drive::unhook(&mut fw, number);
    }

    #[test]
    fn test_boot_unknown_drive() {
        let _guard = crate::testutil::serialize();
        let mut fw = FakeFirmware::new();
        assert_eq!(boot(&mut fw, 0x9E), SanError::NotFound);
    }

    #[test]
    fn test_boot_read_failure() {
        let _guard = crate::testutil::serialize();
        let mut fw = FakeFirmware::new();
        let dev = FakeBlockDevice::with_blocks(1 << 20);
        let number = drive::hook(&mut fw, dev.opener(), "srp:target0", None).unwrap();
        dev.state().fail_after = Some((1, SanError::Io));
        assert_eq!(boot(&mut fw, number), SanError::Io);
        drive::unhook(&mut fw, number);
    }

    #[test]
    fn test_describe_builds_checksummed_table() {
        let _guard = crate::testutil::serialize();
        let mut fw = FakeFirmware::new();
        let dev = FakeBlockDevice::with_blocks(1 << 20);
        let number = drive::hook(&mut fw, dev.opener(), "srp:target0", None).unwrap();
        describe(number).unwrap();
        assert!(dev.state().described);
        with_table(|table| {
            assert_eq!(&table[sbft::SIGNATURE], b"sBFT");
            assert_eq!(&table[sbft::OEM_ID], OEM_ID);
            assert_eq!(&table[sbft::OEM_TABLE_ID], OEM_TABLE_ID);
            let length = sbft::table_length(table);
            assert_eq!(length, sbft::SBFT_LEN);
            let sum = table[..length]
                .iter()
                .fold(0u8, |sum, byte| sum.wrapping_add(*byte));
            assert_eq!(sum, 0);
        });
        drive::unhook(&mut fw, number);
    }

    #[test]
    fn test_describe_unknown_drive() {
        let _guard = crate::testutil::serialize();
        assert_eq!(describe(0x9E), Err(SanError::NotFound));
    }
}
