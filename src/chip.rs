//! Hardware identifiers: bridge-chip types and the VID/PID triples of the
//! three Openterface device generations.
//!
//! All VID/PID comparison in this crate is case-insensitive hex on four-digit
//! strings, because the two platform enumerators surface identifiers in
//! different cases (`534d` from sysfs, `VID_534D` from SetupAPI).

use serde::{Deserialize, Serialize};

/// The video/HID bridge chip on the integrated device. Determines the
/// feature-report framing and the register map the transport uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChipType {
    /// Gen1 bridge (534D:2109), USB 2.0 only.
    Ms2109,
    /// Gen2 bridge (345F:2132), USB 3.0 split configuration.
    Ms2130s,
    /// Not yet detected, or an unrecognized device.
    Unknown,
}

impl ChipType {
    pub fn name(self) -> &'static str {
        match self {
            ChipType::Ms2109 => "MS2109",
            ChipType::Ms2130s => "MS2130S",
            ChipType::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for ChipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Gen1 serial interface (CH340 style): 1A86:7523.
pub const SERIAL_VID: &str = "1A86";
pub const SERIAL_PID: &str = "7523";

/// Gen1 integrated video/HID device: MS2109.
pub const OPENTERFACE_VID: &str = "534D";
pub const OPENTERFACE_PID: &str = "2109";

/// Gen2/Gen3 split serial (CH32V208): 1A86:FE0C.
pub const SERIAL_VID_V2: &str = "1A86";
pub const SERIAL_PID_V2: &str = "FE0C";

/// Gen2 integrated device: MS2130S.
pub const OPENTERFACE_VID_V2: &str = "345F";
pub const OPENTERFACE_PID_V2: &str = "2132";

/// Gen3 integrated device: MS2109 silicon behind the Gen2 vendor ID.
pub const OPENTERFACE_VID_V3: &str = "345F";
pub const OPENTERFACE_PID_V3: &str = "2109";

/// A device generation, i.e. one (serial VID/PID, integrated VID/PID) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    Gen1,
    Gen2,
    Gen3,
}

impl Generation {
    pub const ALL: [Generation; 3] = [Generation::Gen1, Generation::Gen2, Generation::Gen3];

    /// (VID, PID) of the serial-side USB device for this generation.
    pub fn serial_ids(self) -> (&'static str, &'static str) {
        match self {
            Generation::Gen1 => (SERIAL_VID, SERIAL_PID),
            Generation::Gen2 | Generation::Gen3 => (SERIAL_VID_V2, SERIAL_PID_V2),
        }
    }

    /// (VID, PID) of the integrated video/HID device for this generation.
    pub fn integrated_ids(self) -> (&'static str, &'static str) {
        match self {
            Generation::Gen1 => (OPENTERFACE_VID, OPENTERFACE_PID),
            Generation::Gen2 => (OPENTERFACE_VID_V2, OPENTERFACE_PID_V2),
            Generation::Gen3 => (OPENTERFACE_VID_V3, OPENTERFACE_PID_V3),
        }
    }

    /// Gen1 is the integrated USB 2.0 layout; Gen2/Gen3 split the serial
    /// device onto its own port chain.
    pub fn is_split(self) -> bool {
        !matches!(self, Generation::Gen1)
    }

    pub fn label(self) -> &'static str {
        match self {
            Generation::Gen1 => "Gen1",
            Generation::Gen2 => "Gen2",
            Generation::Gen3 => "Gen3",
        }
    }
}

/// Case-insensitive VID/PID pair comparison.
pub fn ids_match(vid: &str, pid: &str, want_vid: &str, want_pid: &str) -> bool {
    vid.eq_ignore_ascii_case(want_vid) && pid.eq_ignore_ascii_case(want_pid)
}

/// True if (vid, pid) names a serial-side device of any generation.
pub fn is_known_serial(vid: &str, pid: &str) -> bool {
    Generation::ALL.iter().any(|g| {
        let (v, p) = g.serial_ids();
        ids_match(vid, pid, v, p)
    })
}

/// True if (vid, pid) names an integrated device of any generation.
pub fn is_known_integrated(vid: &str, pid: &str) -> bool {
    Generation::ALL.iter().any(|g| {
        let (v, p) = g.integrated_ids();
        ids_match(vid, pid, v, p)
    })
}

/// Maps an integrated-device VID/PID onto a chip type. Anything other than
/// the two known bridges is `Unknown` (including every serial-side ID).
pub fn chip_type_for_ids(vid: &str, pid: &str) -> ChipType {
    if ids_match(vid, pid, OPENTERFACE_VID, OPENTERFACE_PID) {
        ChipType::Ms2109
    } else if ids_match(vid, pid, OPENTERFACE_VID_V2, OPENTERFACE_PID_V2) {
        ChipType::Ms2130s
    } else {
        ChipType::Unknown
    }
}
