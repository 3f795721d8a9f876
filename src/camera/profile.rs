//! Per-sensor constants
//!
//! The two sensors of the board differ in input index, mount orientation,
//! supported geometry and feature set. A [`DeviceProfile`] is selected once
//! when a camera is opened and consulted everywhere a per-sensor value is
//! needed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::settings::{Effect, FocusMode, Iso};
use crate::error::{CameraError, Result};
use crate::video::format::Resolution;

/// Which way a sensor faces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    #[default]
    Back,
    Front,
}

impl fmt::Display for Facing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Facing::Back => write!(f, "back"),
            Facing::Front => write!(f, "front"),
        }
    }
}

impl FromStr for Facing {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "back" => Ok(Facing::Back),
            "front" => Ok(Facing::Front),
            _ => Err(CameraError::InvalidArgument(format!(
                "Invalid facing '{}', expected back or front",
                s
            ))),
        }
    }
}

const BACK_PREVIEW_SIZES: &[Resolution] = &[
    Resolution::HD720,
    Resolution::WVGA,
    Resolution::new(720, 480),
    Resolution::VGA,
    Resolution::new(592, 480),
    Resolution::QVGA,
    Resolution::QCIF,
];

const FRONT_PREVIEW_SIZES: &[Resolution] = &[Resolution::VGA, Resolution::QVGA, Resolution::QCIF];

const BACK_PICTURE_SIZES: &[Resolution] = &[
    Resolution::new(2560, 1920),
    Resolution::new(2048, 1536),
    Resolution::new(1600, 1200),
    Resolution::new(1280, 960),
    Resolution::VGA,
];

const FRONT_PICTURE_SIZES: &[Resolution] = &[Resolution::VGA];

const BACK_FOCUS_MODES: &[FocusMode] = &[FocusMode::Auto, FocusMode::Infinity, FocusMode::Macro];
const FRONT_FOCUS_MODES: &[FocusMode] = &[FocusMode::Auto];

const BACK_ISO: &[Iso] = &[
    Iso::Auto,
    Iso::Iso100,
    Iso::Iso200,
    Iso::Iso400,
    Iso::Iso800,
    Iso::Iso1600,
    Iso::Sports,
    Iso::Night,
    Iso::Movie,
];
const FRONT_ISO: &[Iso] = &[Iso::Iso50, Iso::Iso100, Iso::Iso200, Iso::Iso400];

const BACK_EFFECTS: &[Effect] = &[
    Effect::None,
    Effect::Mono,
    Effect::Negative,
    Effect::Sepia,
    Effect::Aqua,
    Effect::Antique,
    Effect::Sharpen,
];
const FRONT_EFFECTS: &[Effect] = &[Effect::None, Effect::Mono, Effect::Negative, Effect::Sepia];

/// Sensor profile, fixed for the lifetime of an open camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceProfile {
    Back,
    Front,
}

impl DeviceProfile {
    pub fn for_facing(facing: Facing) -> Self {
        match facing {
            Facing::Back => DeviceProfile::Back,
            Facing::Front => DeviceProfile::Front,
        }
    }

    pub fn facing(&self) -> Facing {
        match self {
            DeviceProfile::Back => Facing::Back,
            DeviceProfile::Front => Facing::Front,
        }
    }

    /// Capture device input the sensor is wired to
    pub fn input(&self) -> u32 {
        match self {
            DeviceProfile::Back => 0,
            DeviceProfile::Front => 1,
        }
    }

    /// Clockwise mount rotation in degrees
    pub fn orientation(&self) -> u32 {
        match self {
            DeviceProfile::Back => 90,
            DeviceProfile::Front => 270,
        }
    }

    pub fn preview_sizes(&self) -> &'static [Resolution] {
        match self {
            DeviceProfile::Back => BACK_PREVIEW_SIZES,
            DeviceProfile::Front => FRONT_PREVIEW_SIZES,
        }
    }

    pub fn picture_sizes(&self) -> &'static [Resolution] {
        match self {
            DeviceProfile::Back => BACK_PICTURE_SIZES,
            DeviceProfile::Front => FRONT_PICTURE_SIZES,
        }
    }

    pub fn default_preview_size(&self) -> Resolution {
        Resolution::VGA
    }

    /// Largest picture size
    pub fn default_picture_size(&self) -> Resolution {
        self.picture_sizes()[0]
    }

    pub fn default_thumbnail_size(&self) -> Resolution {
        match self {
            DeviceProfile::Back => Resolution::QVGA,
            DeviceProfile::Front => Resolution::new(160, 120),
        }
    }

    pub fn frame_rate(&self) -> u32 {
        match self {
            DeviceProfile::Back => 30,
            DeviceProfile::Front => 15,
        }
    }

    /// Preview fps range in milli-fps
    pub fn fps_range(&self) -> (u32, u32) {
        match self {
            DeviceProfile::Back => (15000, 30000),
            DeviceProfile::Front => (7500, 30000),
        }
    }

    pub fn focus_modes(&self) -> &'static [FocusMode] {
        match self {
            DeviceProfile::Back => BACK_FOCUS_MODES,
            DeviceProfile::Front => FRONT_FOCUS_MODES,
        }
    }

    pub fn iso_values(&self) -> &'static [Iso] {
        match self {
            DeviceProfile::Back => BACK_ISO,
            DeviceProfile::Front => FRONT_ISO,
        }
    }

    pub fn default_iso(&self) -> Iso {
        match self {
            DeviceProfile::Back => Iso::Auto,
            DeviceProfile::Front => Iso::Iso100,
        }
    }

    pub fn effects(&self) -> &'static [Effect] {
        match self {
            DeviceProfile::Back => BACK_EFFECTS,
            DeviceProfile::Front => FRONT_EFFECTS,
        }
    }

    /// Near, optimal and far focus distances in metres for `mode`
    pub fn focus_distances(&self, mode: FocusMode) -> &'static str {
        match (self, mode) {
            (DeviceProfile::Front, _) => "0.20,0.25,Infinity",
            (DeviceProfile::Back, FocusMode::Macro) => "0.10,0.20,Infinity",
            (DeviceProfile::Back, _) => "0.10,1.20,Infinity",
        }
    }

    pub fn focal_length(&self) -> f32 {
        match self {
            DeviceProfile::Back => 3.43,
            DeviceProfile::Front => 0.9,
        }
    }

    /// Only the back sensor has a focus motor and a flash
    pub fn has_autofocus(&self) -> bool {
        matches!(self, DeviceProfile::Back)
    }

    pub fn supports_preview_size(&self, size: Resolution) -> bool {
        self.preview_sizes().contains(&size)
    }

    pub fn supports_picture_size(&self, size: Resolution) -> bool {
        self.picture_sizes().contains(&size)
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.facing())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_constants() {
        let back = DeviceProfile::for_facing(Facing::Back);
        assert_eq!(back.input(), 0);
        assert_eq!(back.orientation(), 90);
        assert_eq!(back.preview_sizes().len(), 7);
        assert_eq!(back.default_picture_size(), Resolution::new(2560, 1920));
        assert_eq!(back.default_iso(), Iso::Auto);

        let front = DeviceProfile::for_facing(Facing::Front);
        assert_eq!(front.input(), 1);
        assert_eq!(front.orientation(), 270);
        assert_eq!(front.frame_rate(), 15);
        assert_eq!(front.fps_range(), (7500, 30000));
        assert_eq!(front.default_thumbnail_size(), Resolution::new(160, 120));
        assert!(!front.iso_values().contains(&Iso::Auto));
    }

    #[test]
    fn test_supported_sizes() {
        let back = DeviceProfile::Back;
        assert!(back.supports_preview_size(Resolution::new(592, 480)));
        assert!(!back.supports_preview_size(Resolution::new(1920, 1080)));
        assert!(!DeviceProfile::Front.supports_preview_size(Resolution::HD720));
        assert!(DeviceProfile::Front.supports_picture_size(Resolution::VGA));
    }

    #[test]
    fn test_focus_distances() {
        let back = DeviceProfile::Back;
        assert_eq!(back.focus_distances(FocusMode::Auto), "0.10,1.20,Infinity");
        assert_eq!(back.focus_distances(FocusMode::Infinity), "0.10,1.20,Infinity");
        assert_eq!(back.focus_distances(FocusMode::Macro), "0.10,0.20,Infinity");
        assert_eq!(
            DeviceProfile::Front.focus_distances(FocusMode::Auto),
            "0.20,0.25,Infinity"
        );
    }

    #[test]
    fn test_facing_parse() {
        assert_eq!("Front".parse::<Facing>().unwrap(), Facing::Front);
        assert_eq!(Facing::Back.to_string(), "back");
        assert!("side".parse::<Facing>().is_err());
    }
}
