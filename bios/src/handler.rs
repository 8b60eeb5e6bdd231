//! INT 13 dispatch and function handlers.
//!
//! Each firmware entry locates the target drive by its caller-supplied
//! number, dispatches on the function code in AH, and translates the
//! handler result into the status-byte / carry-flag convention. The
//! overflow flag tells the interrupt trampoline that the call was
//! fully handled; without it the trampoline chains to the previous
//! handler.

use log::{debug, warn};

use sanboot_block::UserBuffer;

use crate::drive::{self, Drive};
use crate::firmware::Firmware;
use crate::pump::{self, Access};
use crate::registers::{Flags, Registers};
use crate::SECTOR_SIZE;

/// INT 13,00 - Reset disk system.
pub const INT13_RESET: u8 = 0x00;
/// INT 13,01 - Get status of last operation.
pub const INT13_GET_LAST_STATUS: u8 = 0x01;
/// INT 13,02 - Read sectors.
pub const INT13_READ_SECTORS: u8 = 0x02;
/// INT 13,03 - Write sectors.
pub const INT13_WRITE_SECTORS: u8 = 0x03;
/// INT 13,08 - Get drive parameters.
pub const INT13_GET_PARAMETERS: u8 = 0x08;
/// INT 13,15 - Get disk type.
pub const INT13_GET_DISK_TYPE: u8 = 0x15;
/// INT 13,41 - Extensions installation check.
pub const INT13_EXTENSION_CHECK: u8 = 0x41;
/// INT 13,42 - Extended read.
pub const INT13_EXTENDED_READ: u8 = 0x42;
/// INT 13,43 - Extended write.
pub const INT13_EXTENDED_WRITE: u8 = 0x43;
/// INT 13,48 - Get extended parameters.
pub const INT13_GET_EXTENDED_PARAMETERS: u8 = 0x48;

/// Status: invalid function or parameter.
pub const INT13_STATUS_INVALID: i32 = 0x01;
/// Status: read error.
pub const INT13_STATUS_READ_ERROR: i32 = 0x04;
/// Status: reset failed.
pub const INT13_STATUS_RESET_FAILED: i32 = 0x05;

/// Disk type: hard disk.
pub const INT13_DISK_TYPE_HDD: i32 = 0x03;
/// Extensions API bitmap: extended disk access functions supported.
pub const INT13_EXTENSION_LINEAR: u16 = 0x0001;
/// Extensions API version 1.x.
pub const INT13_EXTENSION_VER_1_X: i32 = 0x01;
/// Extended parameter flag: DMA boundary errors handled transparently.
pub const INT13_FL_DMA_TRANSPARENT: u16 = 0x0001;

/// A disk address packet, the extended read/write parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskAddressPacket {
    /// Number of blocks to transfer.
    pub count: u16,
    /// Data buffer offset.
    pub offset: u16,
    /// Data buffer segment.
    pub segment: u16,
    /// Starting linear block address.
    pub lba: u64,
}

impl DiskAddressPacket {
    /// Packet length.
    pub const LEN: usize = 16;

    /// Parse from real-mode memory. Packet fields are little-endian.
    pub fn parse(data: &[u8; Self::LEN]) -> Self {
        DiskAddressPacket {
            count: u16::from_le_bytes([data[2], data[3]]),
            offset: u16::from_le_bytes([data[4], data[5]]),
            segment: u16::from_le_bytes([data[6], data[7]]),
            lba: u64::from_le_bytes(data[8..16].try_into().unwrap()),
        }
    }

    /// Encode to real-mode memory form.
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut data = [0u8; Self::LEN];
        data[0] = Self::LEN as u8;
        data[2..4].copy_from_slice(&self.count.to_le_bytes());
        data[4..6].copy_from_slice(&self.offset.to_le_bytes());
        data[6..8].copy_from_slice(&self.segment.to_le_bytes());
        data[8..16].copy_from_slice(&self.lba.to_le_bytes());
        data
    }
}

/// Extended drive parameters, the function 0x48 result block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedParameters {
    /// Information flags.
    pub flags: u16,
    /// Number of cylinders.
    pub cylinders: u32,
    /// Number of heads.
    pub heads: u32,
    /// Number of sectors per track.
    pub sectors_per_track: u32,
    /// Total sector count.
    pub sectors: u64,
    /// Sector size in bytes.
    pub sector_size: u16,
}

impl ExtendedParameters {
    /// Result block length.
    pub const LEN: usize = 26;

    /// Encode to real-mode memory form. Fields are little-endian.
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut data = [0u8; Self::LEN];
        data[0..2].copy_from_slice(&(Self::LEN as u16).to_le_bytes());
        data[2..4].copy_from_slice(&self.flags.to_le_bytes());
        data[4..8].copy_from_slice(&self.cylinders.to_le_bytes());
        data[8..12].copy_from_slice(&self.heads.to_le_bytes());
        data[12..16].copy_from_slice(&self.sectors_per_track.to_le_bytes());
        data[16..24].copy_from_slice(&self.sectors.to_le_bytes());
        data[24..26].copy_from_slice(&self.sector_size.to_le_bytes());
        data
    }

    /// Parse from real-mode memory form.
    pub fn parse(data: &[u8; Self::LEN]) -> Self {
        ExtendedParameters {
            flags: u16::from_le_bytes([data[2], data[3]]),
            cylinders: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            heads: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            sectors_per_track: u32::from_le_bytes(data[12..16].try_into().unwrap()),
            sectors: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            sector_size: u16::from_le_bytes([data[24], data[25]]),
        }
    }
}

/// Emulated INT 13 handler.
///
/// Looks up the drive addressed by DL and dispatches on the function
/// code in AH. Accesses to a drive's natural number are remapped to
/// its assigned number and chained; calls for unknown drives are
/// chained untouched.
pub fn int13(fw: &mut dyn Firmware, regs: &mut Registers) {
    let function = regs.ah();
    let caller_drive = regs.dl();

    // Check the firmware hasn't killed off our drives.
    drive::check_num_drives(fw);

    let mut drives = drive::DRIVES.lock();
    let Some(index) = drives.iter().position(|d| d.drive == caller_drive) else {
        if let Some(d) = drives.iter().find(|d| d.natural_drive == caller_drive) {
            debug!(
                "INT13,{:02x} ({:02x}) remapped to ({:02x})",
                function, caller_drive, d.drive
            );
            regs.set_dl(d.drive);
        }
        return;
    };
    let drive = &mut drives[index];

    debug!("INT13,{:02x} ({:02x})", function, caller_drive);
    let status = match function {
        INT13_RESET => reset(drive, fw),
        INT13_GET_LAST_STATUS => get_last_status(drive),
        INT13_READ_SECTORS => rw_sectors(drive, fw, regs, Access::Read),
        INT13_WRITE_SECTORS => rw_sectors(drive, fw, regs, Access::Write),
        INT13_GET_PARAMETERS => get_parameters(drive, regs),
        INT13_GET_DISK_TYPE => get_disk_type(drive, regs),
        INT13_EXTENSION_CHECK => extension_check(regs),
        INT13_EXTENDED_READ => extended_rw(drive, fw, regs, Access::Read),
        INT13_EXTENDED_WRITE => extended_rw(drive, fw, regs, Access::Write),
        INT13_GET_EXTENDED_PARAMETERS => get_extended_parameters(drive, fw, regs),
        _ => {
            debug!("INT13,{:02x} ({:02x}) unrecognised", function, caller_drive);
            -INT13_STATUS_INVALID
        }
    };

    // Store status for INT 13,01.
    drive.last_status = status;

    // Negative status indicates an error.
    let code = if status < 0 {
        warn!(
            "INT13,{:02x} ({:02x}) failed with status {:02x}",
            function, caller_drive, -status
        );
        regs.flags.insert(Flags::CARRY);
        -status
    } else {
        regs.flags.remove(Flags::CARRY);
        status
    };
    regs.set_ah(code as u8);

    // DL follows per-function legacy rules: 0x08 reports the drive
    // count, 0x15 returns the sector count low word in DX, everything
    // else gets the caller's value back.
    match function {
        INT13_GET_DISK_TYPE => {}
        INT13_GET_PARAMETERS => regs.set_dl(fw.drive_count()),
        _ => regs.set_dl(caller_drive),
    }

    // Tell the trampoline not to chain this call.
    regs.flags.insert(Flags::OVERFLOW);
}

/// INT 13,00 - Reset disk system.
///
/// Reopens the underlying block device and re-reads its capacity.
fn reset(drive: &mut Drive, fw: &mut dyn Firmware) -> i32 {
    debug!("Reset drive");
    if drive.reopen(fw).is_err() {
        return -INT13_STATUS_RESET_FAILED;
    }
    0
}

/// INT 13,01 - Get status of last operation.
fn get_last_status(drive: &Drive) -> i32 {
    debug!("Get status of last operation");
    drive.last_status
}

/// Read or write sectors addressed by CHS.
///
/// AL holds the sector count, CH/CL the cylinder and sector, DH the
/// head, and ES:BX the data buffer.
fn rw_sectors(
    drive: &mut Drive,
    fw: &mut dyn Firmware,
    regs: &Registers,
    access: Access,
) -> i32 {
    // Classic CHS transfers require firmware-sized blocks.
    if drive.capacity.blksize != SECTOR_SIZE {
        warn!(
            "INT13 drive {:02x} invalid blocksize ({}) for non-extended \
             read/write",
            drive.drive, drive.capacity.blksize
        );
        return -INT13_STATUS_INVALID;
    }

    // The ten-bit cylinder number is split across CL and CH.
    let cylinder = ((regs.cl() as u32 & 0xC0) << 2) | regs.ch() as u32;
    let head = regs.dh() as u32;
    let sector = (regs.cl() & 0x3F) as u32;
    if cylinder >= drive.cylinders
        || head >= drive.heads
        || sector < 1
        || sector > drive.sectors_per_track
    {
        warn!(
            "INT13 drive {:02x} C/H/S {}/{}/{} out of range {}/{}/{}",
            drive.drive,
            cylinder,
            head,
            sector,
            drive.cylinders,
            drive.heads,
            drive.sectors_per_track
        );
        return -INT13_STATUS_INVALID;
    }
    let lba = ((cylinder * drive.heads + head) * drive.sectors_per_track + sector - 1) as u64;
    let count = regs.al() as u32;
    let addr = fw.real_to_addr(regs.es, regs.bx);
    let buffer = UserBuffer::new(addr, count * SECTOR_SIZE);

    debug!(
        "C/H/S {}/{}/{} = LBA {:08x} <-> {:04x}:{:04x} (count {})",
        cylinder, head, sector, lba, regs.es, regs.bx, count
    );

    if let Err(err) = pump::rw(drive, fw, lba, count, buffer, access) {
        warn!("INT13 drive {:02x} I/O failed: {:?}", drive.drive, err);
        return -INT13_STATUS_READ_ERROR;
    }
    0
}

/// INT 13,08 - Get drive parameters.
///
/// Returns the maximum cylinder, head, and sector numbers in the
/// legacy bit packing. The maximum sector number is the count itself,
/// since sector numbering starts at 1.
fn get_parameters(drive: &Drive, regs: &mut Registers) -> i32 {
    debug!("Get drive parameters");
    let max_cylinder = drive.cylinders.saturating_sub(1);
    let max_head = drive.heads.saturating_sub(1);
    let max_sector = drive.sectors_per_track;
    regs.set_ch(max_cylinder as u8);
    regs.set_cl((((max_cylinder >> 8) as u8) << 6) | (max_sector as u8 & 0x3F));
    regs.set_dh(max_head as u8);
    0
}

/// INT 13,15 - Get disk type.
///
/// Returns the 32-bit sector count in CX:DX, clamped for larger disks.
fn get_disk_type(drive: &Drive, regs: &mut Registers) -> i32 {
    debug!("Get disk type");
    let blocks = drive.capacity.blocks.min(u32::MAX as u64) as u32;
    regs.cx = (blocks >> 16) as u16;
    regs.dx = blocks as u16;
    INT13_DISK_TYPE_HDD
}

/// INT 13,41 - Extensions installation check.
fn extension_check(regs: &mut Registers) -> i32 {
    if regs.bx != 0x55AA {
        return -INT13_STATUS_INVALID;
    }
    debug!("INT13 extensions installation check");
    regs.bx = 0xAA55;
    regs.cx = INT13_EXTENSION_LINEAR;
    INT13_EXTENSION_VER_1_X
}

/// Extended read or write via a disk address packet at DS:SI.
fn extended_rw(
    drive: &mut Drive,
    fw: &mut dyn Firmware,
    regs: &Registers,
    access: Access,
) -> i32 {
    let mut raw = [0u8; DiskAddressPacket::LEN];
    fw.read_real(regs.ds, regs.si, &mut raw);
    let packet = DiskAddressPacket::parse(&raw);
    let count = packet.count as u32;
    let addr = fw.real_to_addr(packet.segment, packet.offset);
    let buffer = UserBuffer::new(addr, count.saturating_mul(drive.capacity.blksize));

    debug!(
        "Extended: LBA {:08x} <-> {:04x}:{:04x} (count {})",
        packet.lba, packet.segment, packet.offset, count
    );

    if let Err(err) = pump::rw(drive, fw, packet.lba, count, buffer, access) {
        warn!(
            "INT13 drive {:02x} extended I/O failed: {:?}",
            drive.drive, err
        );
        return -INT13_STATUS_READ_ERROR;
    }
    0
}

/// INT 13,48 - Get extended parameters, written to DS:SI.
fn get_extended_parameters(
    drive: &Drive,
    fw: &mut dyn Firmware,
    regs: &Registers,
) -> i32 {
    let params = ExtendedParameters {
        flags: INT13_FL_DMA_TRANSPARENT,
        cylinders: drive.cylinders,
        heads: drive.heads,
        sectors_per_track: drive.sectors_per_track,
        sectors: drive.capacity.blocks,
        sector_size: drive.capacity.blksize as u16,
    };
    debug!(
        "Get extended drive parameters to {:04x}:{:04x}",
        regs.ds, regs.si
    );
    fw.write_real(regs.ds, regs.si, &params.encode());
    0
}
