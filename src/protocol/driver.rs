//! Known panel drivers and color modes.
//!
//! The driver id is byte 7 of the config snapshot and the payload of
//! `INIT` when selecting a driver.

/// How the caller's pixel encoder packed the image, and therefore which
/// planes are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorMode {
    /// One black/white plane.
    BlackWhite,
    /// Black/white plane followed by a red plane of equal size.
    ThreeColor,
    /// One packed four-color plane.
    FourColor,
}

/// A supported panel/controller combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverModel {
    /// Id as stored in the peripheral's config.
    pub id: u8,
    /// Controller chip.
    pub controller: &'static str,
    /// Panel width in pixels.
    pub width: u16,
    /// Panel height in pixels.
    pub height: u16,
    /// Color mode the panel expects.
    pub color_mode: ColorMode,
}

/// All drivers known to the stock firmware.
pub const DRIVERS: &[DriverModel] = &[
    DriverModel {
        id: 0x01,
        controller: "UC8176",
        width: 400,
        height: 300,
        color_mode: ColorMode::BlackWhite,
    },
    DriverModel {
        id: 0x02,
        controller: "SSD1619",
        width: 400,
        height: 300,
        color_mode: ColorMode::ThreeColor,
    },
    DriverModel {
        id: 0x03,
        controller: "UC8176",
        width: 400,
        height: 300,
        color_mode: ColorMode::ThreeColor,
    },
    DriverModel {
        id: 0x04,
        controller: "SSD1619",
        width: 400,
        height: 300,
        color_mode: ColorMode::BlackWhite,
    },
    DriverModel {
        id: 0x05,
        controller: "JD79668",
        width: 400,
        height: 300,
        color_mode: ColorMode::FourColor,
    },
];

impl DriverModel {
    /// Look up a driver by id.
    pub fn lookup(id: u8) -> Option<&'static DriverModel> {
        DRIVERS.iter().find(|d| d.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known() {
        let d = DriverModel::lookup(0x03).unwrap();
        assert_eq!(d.controller, "UC8176");
        assert_eq!(d.color_mode, ColorMode::ThreeColor);
        assert_eq!((d.width, d.height), (400, 300));
    }

    #[test]
    fn test_lookup_unknown() {
        assert!(DriverModel::lookup(0x00).is_none());
        assert!(DriverModel::lookup(0xFF).is_none());
    }

    #[test]
    fn test_ids_unique() {
        for (i, a) in DRIVERS.iter().enumerate() {
            for b in &DRIVERS[i + 1..] {
                assert_ne!(a.id, b.id);
            }
        }
    }
}
