//! Typed camera settings and the deferred-apply ledger
//!
//! Client requests are validated and recorded in a [`SettingsLedger`]
//! immediately, but only pushed to the capture device on the next
//! capture-affecting operation (a preview frame, a still capture). The
//! ledger remembers what the device last accepted and only re-sends
//! settings whose requested value differs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use super::profile::DeviceProfile;
use crate::error::{CameraError, Result};
use crate::video::device::{ControlId, Rect};
use crate::video::format::Resolution;
use crate::video::session::CaptureSession;

pub const MIN_FRAME_RATE: u32 = 1;
pub const MAX_FRAME_RATE: u32 = 30;
pub const MIN_BRIGHTNESS: i32 = -4;
pub const MAX_BRIGHTNESS: i32 = 4;
/// Range shared by contrast, sharpness and saturation
pub const MIN_ADJUST: i32 = -2;
pub const MAX_ADJUST: i32 = 2;
pub const MAX_ZOOM: u32 = 12;

/// Enum whose variants travel as fixed strings and map to a device value
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $wire:literal = $value:expr),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $wire)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }

            /// Value written to the device control
            pub fn control_value(&self) -> i32 {
                match self {
                    $($name::$variant => $value),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CameraError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    _ => Err(CameraError::InvalidArgument(format!(
                        "Invalid {} '{}'",
                        stringify!($name),
                        s
                    ))),
                }
            }
        }
    };
}

wire_enum! {
    /// Scene program
    SceneMode {
        Auto => "auto" = 0,
        Portrait => "portrait" = 1,
        Landscape => "landscape" = 2,
        Sports => "sports" = 3,
        Party => "party" = 4,
        Beach => "beach" = 5,
        Snow => "snow" = 5,
        Sunset => "sunset" = 6,
        Night => "night" = 8,
        Fireworks => "fireworks" = 10,
        Candlelight => "candlelight" = 12,
    }
}

wire_enum! {
    WhiteBalance {
        Auto => "auto" = 1,
        Daylight => "daylight" = 2,
        CloudyDaylight => "cloudy-daylight" = 3,
        Incandescent => "incandescent" = 4,
        Fluorescent => "fluorescent" = 5,
    }
}

wire_enum! {
    /// Colour effect
    Effect {
        None => "none" = 0,
        Mono => "mono" = 1,
        Negative => "negative" = 2,
        Sepia => "sepia" = 3,
        Aqua => "aqua" = 4,
        Sharpen => "sharpen" = 5,
        Antique => "antique" = 6,
    }
}

wire_enum! {
    Metering {
        Matrix => "matrix" = 1,
        Center => "center" = 2,
        Spot => "spot" = 3,
    }
}

wire_enum! {
    Iso {
        Auto => "auto" = 0,
        Iso50 => "50" = 1,
        Iso100 => "100" = 2,
        Iso200 => "200" = 3,
        Iso400 => "400" = 4,
        Iso800 => "800" = 5,
        Iso1600 => "1600" = 6,
        Sports => "sports" = 7,
        Night => "night" = 8,
        Movie => "movie" = 9,
    }
}

wire_enum! {
    FocusMode {
        Auto => "auto" = 0,
        Macro => "macro" = 1,
        Infinity => "infinity" = 2,
    }
}

wire_enum! {
    FlashMode {
        Off => "off" = 1,
        Auto => "auto" = 2,
        On => "on" = 3,
        Torch => "torch" = 4,
    }
}

/// Ledger keys, declared in flush order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SettingId {
    FrameRate,
    SceneMode,
    WhiteBalance,
    Effect,
    Brightness,
    Contrast,
    Metering,
    Sharpness,
    Saturation,
    Iso,
    Zoom,
    FocusMode,
}

/// A validated-on-set value for one ledger key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    FrameRate(u32),
    SceneMode(SceneMode),
    WhiteBalance(WhiteBalance),
    Effect(Effect),
    Brightness(i32),
    Contrast(i32),
    Metering(Metering),
    Sharpness(i32),
    Saturation(i32),
    Iso(Iso),
    Zoom(u32),
    FocusMode(FocusMode),
}

impl Setting {
    pub fn id(&self) -> SettingId {
        match self {
            Setting::FrameRate(_) => SettingId::FrameRate,
            Setting::SceneMode(_) => SettingId::SceneMode,
            Setting::WhiteBalance(_) => SettingId::WhiteBalance,
            Setting::Effect(_) => SettingId::Effect,
            Setting::Brightness(_) => SettingId::Brightness,
            Setting::Contrast(_) => SettingId::Contrast,
            Setting::Metering(_) => SettingId::Metering,
            Setting::Sharpness(_) => SettingId::Sharpness,
            Setting::Saturation(_) => SettingId::Saturation,
            Setting::Iso(_) => SettingId::Iso,
            Setting::Zoom(_) => SettingId::Zoom,
            Setting::FocusMode(_) => SettingId::FocusMode,
        }
    }

    fn validate(&self, profile: DeviceProfile) -> Result<()> {
        let in_range = |name: &str, value: i32, min: i32, max: i32| {
            if (min..=max).contains(&value) {
                Ok(())
            } else {
                Err(CameraError::InvalidArgument(format!(
                    "{} {} out of range {}..={}",
                    name, value, min, max
                )))
            }
        };
        match *self {
            Setting::FrameRate(fps) => in_range(
                "Frame rate",
                fps as i32,
                MIN_FRAME_RATE as i32,
                MAX_FRAME_RATE as i32,
            ),
            Setting::Brightness(v) => in_range("Brightness", v, MIN_BRIGHTNESS, MAX_BRIGHTNESS),
            Setting::Contrast(v) => in_range("Contrast", v, MIN_ADJUST, MAX_ADJUST),
            Setting::Sharpness(v) => in_range("Sharpness", v, MIN_ADJUST, MAX_ADJUST),
            Setting::Saturation(v) => in_range("Saturation", v, MIN_ADJUST, MAX_ADJUST),
            Setting::Zoom(z) => in_range("Zoom", z as i32, 0, MAX_ZOOM as i32),
            Setting::Iso(iso) if !profile.iso_values().contains(&iso) => Err(
                CameraError::InvalidArgument(format!("ISO {} not supported by {} camera", iso, profile)),
            ),
            Setting::FocusMode(mode) if !profile.focus_modes().contains(&mode) => {
                Err(CameraError::InvalidArgument(format!(
                    "Focus mode {} not supported by {} camera",
                    mode, profile
                )))
            }
            Setting::Effect(effect) if !profile.effects().contains(&effect) => {
                Err(CameraError::InvalidArgument(format!(
                    "Effect {} not supported by {} camera",
                    effect, profile
                )))
            }
            _ => Ok(()),
        }
    }

    /// Device control and value for scalar settings; `None` for settings
    /// applied through another request (frame rate, zoom)
    fn control(&self) -> Option<(ControlId, i32)> {
        match *self {
            Setting::SceneMode(m) => Some((ControlId::SceneMode, m.control_value())),
            Setting::WhiteBalance(wb) => Some((ControlId::WhiteBalance, wb.control_value())),
            Setting::Effect(e) => Some((ControlId::ColorEffect, e.control_value())),
            Setting::Brightness(v) => Some((ControlId::Exposure, v)),
            Setting::Contrast(v) => Some((ControlId::Contrast, v)),
            Setting::Metering(m) => Some((ControlId::Metering, m.control_value())),
            Setting::Sharpness(v) => Some((ControlId::Sharpness, v)),
            Setting::Saturation(v) => Some((ControlId::Saturation, v)),
            Setting::Iso(iso) => Some((ControlId::Iso, iso.control_value())),
            Setting::FocusMode(m) => Some((ControlId::FocusMode, m.control_value())),
            Setting::FrameRate(_) | Setting::Zoom(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    requested: Setting,
    applied: Option<Setting>,
}

/// Requested settings and what the device last accepted
#[derive(Debug, Clone)]
pub struct SettingsLedger {
    profile: DeviceProfile,
    entries: BTreeMap<SettingId, Entry>,
    /// A crop narrower than the bounds is in effect on the primary pipe
    crop_active: bool,
}

impl SettingsLedger {
    /// Ledger holding the profile defaults, none of them applied yet
    pub fn new(profile: DeviceProfile) -> Self {
        let defaults = [
            Setting::FrameRate(profile.frame_rate()),
            Setting::SceneMode(SceneMode::Auto),
            Setting::WhiteBalance(WhiteBalance::Auto),
            Setting::Effect(Effect::None),
            Setting::Brightness(0),
            Setting::Contrast(0),
            Setting::Metering(Metering::Center),
            Setting::Sharpness(0),
            Setting::Saturation(0),
            Setting::Iso(profile.default_iso()),
            Setting::Zoom(0),
            Setting::FocusMode(FocusMode::Auto),
        ];
        let entries = defaults
            .into_iter()
            .map(|s| {
                (
                    s.id(),
                    Entry {
                        requested: s,
                        applied: None,
                    },
                )
            })
            .collect();
        Self {
            profile,
            entries,
            crop_active: false,
        }
    }

    pub fn profile(&self) -> DeviceProfile {
        self.profile
    }

    /// Record a requested value.
    ///
    /// Returns `Ok(true)` when the request changed, `Ok(false)` when it
    /// equals the current request. A rejected value leaves the ledger as is.
    pub fn set(&mut self, setting: Setting) -> Result<bool> {
        setting.validate(self.profile)?;
        let entry = self.entries.entry(setting.id()).or_insert(Entry {
            requested: setting,
            applied: None,
        });
        if entry.requested == setting {
            return Ok(false);
        }
        entry.requested = setting;
        Ok(true)
    }

    /// Current requested value
    pub fn get(&self, id: SettingId) -> Option<Setting> {
        self.entries.get(&id).map(|e| e.requested)
    }

    /// Value the device last accepted
    pub fn applied(&self, id: SettingId) -> Option<Setting> {
        self.entries.get(&id).and_then(|e| e.applied)
    }

    /// Any requested value differs from what the device holds
    pub fn is_dirty(&self) -> bool {
        self.entries
            .values()
            .any(|e| e.applied != Some(e.requested))
    }

    /// Keys still waiting to be applied, in flush order
    pub fn pending(&self) -> Vec<SettingId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.applied != Some(e.requested))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Forget what the device holds, so the next flush re-sends everything
    pub fn invalidate(&mut self) {
        for entry in self.entries.values_mut() {
            entry.applied = None;
        }
    }

    /// Push every pending setting to `session` in priority order.
    ///
    /// Failures are logged and skipped; the return value is the number of
    /// settings the device rejected. Zoom is also cropped on `record` when
    /// it is streaming.
    pub fn flush_to(
        &mut self,
        session: &mut CaptureSession,
        mut record: Option<&mut CaptureSession>,
    ) -> usize {
        let mut failures = 0;
        let mut crop_active = self.crop_active;

        for (id, entry) in self.entries.iter_mut() {
            if entry.applied == Some(entry.requested) {
                continue;
            }
            let result = match entry.requested {
                Setting::FrameRate(fps) => session.set_frame_rate(fps),
                Setting::Zoom(level) => {
                    apply_zoom(session, level, &mut crop_active).and_then(|_| {
                        match record.as_deref_mut() {
                            Some(rec) if rec.is_streaming() => {
                                let mut rec_crop = true;
                                apply_zoom(rec, level, &mut rec_crop)
                            }
                            _ => Ok(()),
                        }
                    })
                }
                other => match other.control() {
                    Some((control, value)) => session.apply_control(control, value).map(|_| ()),
                    None => Ok(()),
                },
            };
            match result {
                Ok(()) => {
                    debug!("Applied {:?}", entry.requested);
                    entry.applied = Some(entry.requested);
                }
                Err(e) => {
                    warn!("Failed to apply {:?}: {}", id, e);
                    failures += 1;
                }
            }
        }

        self.crop_active = crop_active;
        if failures > 0 {
            debug!("Settings flush finished with {} failures", failures);
        }
        failures
    }
}

fn apply_zoom(session: &mut CaptureSession, level: u32, crop_active: &mut bool) -> Result<()> {
    let bounds = session.crop_bounds()?;
    let output = session
        .format()
        .map(|f| f.resolution)
        .unwrap_or_else(|| Resolution::new(bounds.width, bounds.height));
    let rect = zoom_crop(bounds, output, level);
    if rect == bounds && !*crop_active {
        return Ok(());
    }
    session.set_crop(rect)?;
    *crop_active = rect != bounds;
    Ok(())
}

/// Crop window for `zoom` steps inside `bounds`, matching the aspect ratio
/// of `output` and centred on the sensor
pub fn zoom_crop(bounds: Rect, output: Resolution, zoom: u32) -> Rect {
    let src_w = bounds.width;
    let src_h = bounds.height;
    let mut width = src_w;
    let mut height = src_h;

    if output.is_valid() && src_w > 0 && src_h > 0 {
        let src_cross = src_w as u64 * output.height as u64;
        let dst_cross = output.width as u64 * src_h as u64;
        if src_cross < dst_cross {
            // Source is taller than the output
            height = (src_w as u64 * output.height as u64 / output.width as u64) as u32;
        } else if src_cross > dst_cross {
            width = (src_h as u64 * output.width as u64 / output.height as u64) as u32;
        }
    }

    let zoom = zoom.min(MAX_ZOOM);
    if zoom > 0 {
        let step_w = (src_w - (src_w >> 2)) / MAX_ZOOM;
        let step_h = (src_h - (src_h >> 2)) / MAX_ZOOM;
        width = width.saturating_sub(step_w * zoom);
        height = height.saturating_sub(step_h * zoom);
    }

    Rect::new(
        bounds.left + ((src_w - width) / 2) as i32,
        bounds.top + ((src_h - height) / 2) as i32,
        width,
        height,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::PixelFormat;
    use crate::video::session::DEFAULT_FRAME_TIMEOUT;
    use crate::video::sim::{SimBackend, SimConfig, SimEncoderConfig};

    const NODE: &str = "/dev/video0";

    fn session(backend: &SimBackend) -> CaptureSession {
        let mut session = CaptureSession::open(backend, NODE, 0, DEFAULT_FRAME_TIMEOUT).unwrap();
        session
            .negotiate_format(Resolution::VGA, PixelFormat::Yuv420)
            .unwrap();
        session
    }

    #[test]
    fn test_range_checks() {
        let mut ledger = SettingsLedger::new(DeviceProfile::Back);
        assert!(ledger.set(Setting::Zoom(13)).is_err());
        assert!(ledger.set(Setting::Brightness(-5)).is_err());
        assert!(ledger.set(Setting::Contrast(3)).is_err());
        assert!(ledger.set(Setting::FrameRate(0)).is_err());
        assert!(ledger.set(Setting::FrameRate(31)).is_err());
        assert_eq!(ledger.get(SettingId::Zoom), Some(Setting::Zoom(0)));

        // Front sensor has no macro mode and no auto ISO
        let mut front = SettingsLedger::new(DeviceProfile::Front);
        assert!(front.set(Setting::FocusMode(FocusMode::Macro)).is_err());
        assert!(front.set(Setting::Iso(Iso::Auto)).is_err());
        assert!(front.set(Setting::Effect(Effect::Aqua)).is_err());
    }

    #[test]
    fn test_repeated_set_is_noop() {
        let backend = SimBackend::new();
        let mut session = session(&backend);
        let mut ledger = SettingsLedger::new(DeviceProfile::Back);
        assert!(ledger.is_dirty());
        assert_eq!(ledger.flush_to(&mut session, None), 0);
        assert!(!ledger.is_dirty());

        // Same as current: no change
        assert!(!ledger.set(Setting::Contrast(0)).unwrap());
        assert!(!ledger.is_dirty());

        assert!(ledger.set(Setting::Contrast(2)).unwrap());
        assert!(ledger.is_dirty());
        assert!(!ledger.set(Setting::Contrast(2)).unwrap());
        assert!(ledger.is_dirty());
        assert_eq!(ledger.pending(), vec![SettingId::Contrast]);
    }

    #[test]
    fn test_flush_round_trip() {
        let backend = SimBackend::new();
        let mut session = session(&backend);
        let mut ledger = SettingsLedger::new(DeviceProfile::Back);
        ledger.set(Setting::Brightness(3)).unwrap();
        ledger.set(Setting::Sharpness(-1)).unwrap();
        ledger
            .set(Setting::WhiteBalance(WhiteBalance::CloudyDaylight))
            .unwrap();
        ledger.set(Setting::Effect(Effect::Sepia)).unwrap();

        assert_eq!(ledger.flush_to(&mut session, None), 0);
        assert_eq!(session.read_control(ControlId::Exposure).unwrap(), 3);
        assert_eq!(session.read_control(ControlId::Sharpness).unwrap(), -1);
        assert_eq!(session.read_control(ControlId::WhiteBalance).unwrap(), 3);
        assert_eq!(session.read_control(ControlId::ColorEffect).unwrap(), 3);
        assert_eq!(backend.node_state(NODE).frame_rate, Some(30));
    }

    #[test]
    fn test_flush_skips_failures() {
        let backend = SimBackend::with_config(
            SimConfig {
                failing_controls: vec![ControlId::Contrast, ControlId::Iso],
                ..Default::default()
            },
            SimEncoderConfig::default(),
        );
        let mut session = session(&backend);
        let mut ledger = SettingsLedger::new(DeviceProfile::Back);
        ledger.set(Setting::Saturation(1)).unwrap();

        assert_eq!(ledger.flush_to(&mut session, None), 2);
        assert!(ledger.is_dirty());
        assert_eq!(ledger.pending(), vec![SettingId::Contrast, SettingId::Iso]);
        // Settings after the failures were still applied
        assert_eq!(session.read_control(ControlId::Saturation).unwrap(), 1);
        assert_eq!(
            ledger.applied(SettingId::FocusMode),
            Some(Setting::FocusMode(FocusMode::Auto))
        );
    }

    #[test]
    fn test_flush_only_sends_changes() {
        let backend = SimBackend::new();
        let mut session = session(&backend);
        let mut ledger = SettingsLedger::new(DeviceProfile::Back);
        ledger.flush_to(&mut session, None);

        ledger.set(Setting::Metering(Metering::Spot)).unwrap();
        session.apply_control(ControlId::Contrast, 2).unwrap();
        ledger.flush_to(&mut session, None);
        // Contrast was not pending, so the out-of-band value survives
        assert_eq!(session.read_control(ControlId::Contrast).unwrap(), 2);
        assert_eq!(session.read_control(ControlId::Metering).unwrap(), 3);

        ledger.invalidate();
        assert_eq!(ledger.pending().len(), 12);
        ledger.flush_to(&mut session, None);
        assert_eq!(session.read_control(ControlId::Contrast).unwrap(), 0);
    }

    #[test]
    fn test_zoom_crop_math() {
        let bounds = Rect::new(0, 0, 2560, 1920);
        assert_eq!(zoom_crop(bounds, Resolution::VGA, 0), bounds);
        assert_eq!(
            zoom_crop(bounds, Resolution::VGA, 12),
            Rect::new(960, 720, 640, 480)
        );
        assert_eq!(
            zoom_crop(bounds, Resolution::VGA, 6),
            Rect::new(480, 360, 1600, 1200)
        );
        // 16:9 output on a 4:3 sensor trims height
        assert_eq!(
            zoom_crop(bounds, Resolution::HD720, 0),
            Rect::new(0, 240, 2560, 1440)
        );
    }

    #[test]
    fn test_zoom_crop_requests() {
        let backend = SimBackend::new();
        let mut session = session(&backend);
        let mut ledger = SettingsLedger::new(DeviceProfile::Back);
        ledger.flush_to(&mut session, None);
        // Full-bounds crop is never requested
        assert!(backend.node_state(NODE).crops.is_empty());

        ledger.set(Setting::Zoom(12)).unwrap();
        ledger.flush_to(&mut session, None);
        assert_eq!(
            backend.node_state(NODE).crops,
            vec![Rect::new(960, 720, 640, 480)]
        );

        // Zooming back out restores the full window
        ledger.set(Setting::Zoom(0)).unwrap();
        ledger.flush_to(&mut session, None);
        assert_eq!(
            backend.node_state(NODE).crops.last(),
            Some(&Rect::new(0, 0, 2560, 1920))
        );
    }

    #[test]
    fn test_wire_names() {
        assert_eq!("cloudy-daylight".parse::<WhiteBalance>().unwrap(), WhiteBalance::CloudyDaylight);
        assert_eq!(Iso::Iso400.as_str(), "400");
        assert_eq!(Effect::Antique.control_value(), 6);
        assert!("posterize".parse::<Effect>().is_err());
        assert_eq!(SceneMode::Snow.control_value(), SceneMode::Beach.control_value());
    }
}
