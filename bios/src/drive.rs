//! Emulated drive records and registry.
//!
//! Each registered drive pairs a firmware drive number with a block
//! device, its inferred CHS geometry, and its cached capacity. The
//! registry owns the firmware-global drive-count byte and the interrupt
//! vector slot: the vector is installed exactly while the registry is
//! non-empty, and the count byte is repaired on every dispatch if the
//! host firmware changed it behind our back.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};

use log::{debug, warn};
use spin::Mutex;

use sanboot_block::{BlockCapacity, BlockDevice, SanError, UserBuffer};

use crate::firmware::Firmware;
use crate::pump::{self, Access};
use crate::SECTOR_SIZE;

/// Opens the block device behind a drive's URI.
pub type DeviceOpener =
    Box<dyn FnMut(&str) -> Result<Box<dyn BlockDevice>, SanError> + Send>;

/// Offset of the partition table within the boot sector.
const PARTITIONS_OFFSET: usize = 0x1BE;
/// Length of one partition table entry.
const PARTITION_ENTRY_LEN: usize = 16;

/// An emulated drive.
pub struct Drive {
    /// Underlying block device.
    pub(crate) device: Box<dyn BlockDevice>,
    /// Reopens the block device for reset.
    pub(crate) opener: DeviceOpener,
    /// Block device URI.
    pub(crate) uri: String,
    /// Firmware in-use drive number (0x80-0xFF).
    pub(crate) drive: u8,
    /// Firmware natural drive number (0x80-0xFF).
    ///
    /// The number this drive would have been assigned by appending it
    /// to the end of the firmware drive list. If the emulated drive
    /// replaces a preexisting drive, accesses to this number are
    /// remapped to the assigned number.
    pub(crate) natural_drive: u8,
    /// Number of cylinders.
    ///
    /// The cylinder field of a disk-interrupt call is ten bits wide,
    /// so at most 1024 cylinders are addressable; past the CHS limit
    /// it is the cylinder count that saturates.
    pub(crate) cylinders: u32,
    /// Number of heads. At most 255: historical consumers fail at 256.
    pub(crate) heads: u32,
    /// Number of sectors per track.
    ///
    /// The sector field is six bits wide and numbering starts at 1,
    /// giving at most 63 sectors.
    pub(crate) sectors_per_track: u32,
    /// Cached block device capacity.
    pub(crate) capacity: BlockCapacity,
    /// Latched underlying device error.
    pub(crate) block_err: Option<SanError>,
    /// Status of the last emulated call.
    pub(crate) last_status: i32,
}

impl Drive {
    /// Open a drive: open the device by URI, read its capacity, and
    /// infer a geometry.
    fn open(
        fw: &mut dyn Firmware,
        mut opener: DeviceOpener,
        uri: &str,
        drive: u8,
        natural_drive: u8,
    ) -> Result<Self, SanError> {
        let device = opener(uri)?;
        let mut drive = Drive {
            device,
            opener,
            uri: String::from(uri),
            drive,
            natural_drive,
            cylinders: 0,
            heads: 0,
            sectors_per_track: 0,
            capacity: BlockCapacity {
                blocks: 0,
                blksize: 0,
                max_count: 0,
            },
            block_err: None,
            last_status: 0,
        };
        pump::read_capacity(&mut drive, fw)?;
        drive.guess_geometry(fw)?;
        Ok(drive)
    }

    /// Reopen the underlying block device and re-read its capacity.
    pub(crate) fn reopen(&mut self, fw: &mut dyn Firmware) -> Result<(), SanError> {
        // The old device is torn down whether or not the reopen works.
        self.block_err = Some(SanError::ConnectionReset);
        let device = match (self.opener)(&self.uri) {
            Ok(device) => device,
            Err(err) => {
                warn!(
                    "INT13 drive {:02x} could not reopen block device: {:?}",
                    self.drive, err
                );
                self.block_err = Some(err);
                return Err(err);
            }
        };
        self.device = device;
        self.block_err = None;
        pump::read_capacity(self, fw)?;
        Ok(())
    }

    /// Guess the drive geometry by inspecting the partition table.
    fn guess_geometry(&mut self, fw: &mut dyn Firmware) -> Result<(), SanError> {
        // Geometry only makes sense for firmware-sized sectors.
        if self.capacity.blksize != SECTOR_SIZE {
            return Ok(());
        }

        let mut sector = [0u8; SECTOR_SIZE as usize];
        let buffer = UserBuffer::new(sector.as_mut_ptr() as u64, SECTOR_SIZE);
        if let Err(err) = pump::rw(self, fw, 0, 1, buffer, Access::Read) {
            warn!(
                "INT13 drive {:02x} could not read partition table to guess \
                 geometry: {:?}",
                self.drive, err
            );
            return Err(err);
        }

        // Every used partition overwrites the running guesses; the last
        // one wins.
        let mut heads: u32 = 255;
        let mut sectors_per_track: u32 = 63;
        for index in 0..4 {
            let entry =
                &sector[PARTITIONS_OFFSET + index * PARTITION_ENTRY_LEN..][..PARTITION_ENTRY_LEN];
            if entry[4] == 0 {
                continue;
            }
            let end_head = entry[5];
            let end_sector = entry[6] & 0x3F;
            if end_sector == 0 {
                continue;
            }
            heads = end_head as u32 + 1;
            sectors_per_track = end_sector as u32;
            debug!(
                "INT13 drive {:02x} guessing C/H/S xx/{}/{} based on partition {}",
                self.drive,
                heads,
                sectors_per_track,
                index + 1
            );
        }

        // Apply guesses only where no geometry was already supplied.
        if self.heads == 0 {
            self.heads = heads;
        }
        if self.sectors_per_track == 0 {
            self.sectors_per_track = sectors_per_track;
        }
        if self.cylinders == 0 {
            // Keep the division inside the native word size.
            let blocks = self.capacity.blocks.min(usize::MAX as u64);
            let per_cylinder = (self.heads * self.sectors_per_track) as u64;
            self.cylinders = (blocks / per_cylinder).min(1024) as u32;
        }

        Ok(())
    }
}

/// Registered emulated drives.
pub(crate) static DRIVES: Mutex<Vec<Drive>> = Mutex::new(Vec::new());

/// Mirror of the firmware drive-count byte.
static NUM_DRIVES: AtomicU8 = AtomicU8::new(0);

/// Raise the firmware drive count to cover every registered drive.
fn set_num_drives(fw: &mut dyn Firmware, drives: &[Drive]) {
    let mut count = fw.drive_count();
    for drive in drives {
        if count <= drive.drive & 0x7F {
            count = (drive.drive & 0x7F) + 1;
        }
    }
    fw.set_drive_count(count);
    NUM_DRIVES.store(count, Ordering::Relaxed);
}

/// Repair the firmware drive count if it was changed behind our back.
pub(crate) fn check_num_drives(fw: &mut dyn Firmware) {
    let expected = NUM_DRIVES.load(Ordering::Relaxed);
    let found = fw.drive_count();
    if found != expected {
        let drives = DRIVES.lock();
        set_num_drives(fw, &drives);
        debug!(
            "INT13 fixing up number of drives from {} to {}",
            found,
            NUM_DRIVES.load(Ordering::Relaxed)
        );
    }
}

/// Register an emulated drive.
///
/// The natural drive number is computed by appending to the firmware
/// drive list; `requested` (forced into the 0x80-0xFF range) overrides
/// it. The disk-interrupt vector is installed when the registry becomes
/// non-empty. Returns the assigned drive number.
pub fn hook(
    fw: &mut dyn Firmware,
    opener: DeviceOpener,
    uri: &str,
    requested: Option<u8>,
) -> Result<u8, SanError> {
    let natural_drive = 0x80 | fw.drive_count();
    let number = requested.unwrap_or(natural_drive) | 0x80;

    if DRIVES.lock().iter().any(|d| d.drive == number) {
        return Err(SanError::AddrInUse);
    }

    let drive = Drive::open(fw, opener, uri, number, natural_drive)?;
    debug!(
        "INT13 drive {:02x} (naturally {:02x}) registered with C/H/S \
         geometry {}/{}/{}",
        drive.drive, drive.natural_drive, drive.cylinders, drive.heads, drive.sectors_per_track
    );

    let mut drives = DRIVES.lock();
    if drives.is_empty() {
        fw.hook_disk_vector();
    }
    drives.push(drive);
    set_num_drives(fw, &drives);
    Ok(number)
}

/// Unregister an emulated drive.
///
/// The disk-interrupt vector is removed when the registry becomes
/// empty. The firmware drive count is left alone: lowering it reliably
/// is not possible once the firmware has observed the raised value.
pub fn unhook(fw: &mut dyn Firmware, number: u8) {
    let mut drives = DRIVES.lock();
    let Some(index) = drives.iter().position(|d| d.drive == number) else {
        debug!("INT13 cannot find emulated drive {:02x}", number);
        return;
    };
    let drive = drives.remove(index);
    debug!("INT13 drive {:02x} unregistered", drive.drive);
    drop(drive);
    if drives.is_empty() {
        fw.unhook_disk_vector();
    }
}

#[cfg(test)]
pub(crate) fn clear_registry() {
    DRIVES.lock().clear();
    NUM_DRIVES.store(0, Ordering::Relaxed);
}
