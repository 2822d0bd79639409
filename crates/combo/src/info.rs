use core::fmt::{self, Display};

/// Firmware build timestamp as packed into the card's `BUILD_TIME` register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuildTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
}

impl BuildTime {
    pub const fn from_raw(raw: u32) -> Self {
        Self {
            year: ((raw & 0xF000_0000) >> 28) as u16 + 2000,
            month: ((raw & 0x0F00_0000) >> 24) as u8,
            day: ((raw & 0x00FF_0000) >> 16) as u8,
            hour: ((raw & 0x0000_FF00) >> 8) as u8,
            minute: (raw & 0x0000_00FF) as u8,
        }
    }
}

impl Display for BuildTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}/{:02}/{:02} {:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute
        )
    }
}

/// Identification read from the card during attach.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id_revision: u32,
    pub build: BuildTime,
}

impl Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ID & revision: {:08x}, build time (YYYY/MM/DD hh:mm): {}",
            self.id_revision, self.build
        )
    }
}
