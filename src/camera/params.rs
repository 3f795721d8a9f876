//! Client-facing camera parameters
//!
//! [`CameraParameters`] is the typed configuration a client sees.
//! [`ParameterMap`] adapts it to the flat `key=value;key=value` wire format
//! at the boundary. [`apply_parameters`] implements the update policy: every
//! key is validated on its own, valid keys are committed (device settings
//! are staged in the [`SettingsLedger`]), and all rejected keys are reported
//! together.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use super::profile::DeviceProfile;
use super::settings::{
    Effect, FlashMode, FocusMode, Iso, Metering, SceneMode, Setting, SettingsLedger,
    WhiteBalance, MAX_ADJUST, MAX_BRIGHTNESS, MAX_ZOOM, MIN_ADJUST, MIN_BRIGHTNESS,
};
use crate::error::{CameraError, Result};
use crate::video::encoder::GpsInfo;
use crate::video::format::{PixelFormat, Resolution};

/// Preview fps range forced by the night scene, in milli-fps
pub const NIGHT_FPS_RANGE: (u32, u32) = (4000, 30000);

const ZOOM_RATIOS: &str = "100,125,150,175,200,225,250,275,300,325,350,375,400";

/// Layout of preview frames handed to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PreviewFormat {
    /// Semi-planar, V before U (NV21)
    #[default]
    #[serde(rename = "yuv420sp")]
    Yuv420sp,
    #[serde(rename = "yuv420p")]
    Yuv420p,
}

impl PreviewFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreviewFormat::Yuv420sp => "yuv420sp",
            PreviewFormat::Yuv420p => "yuv420p",
        }
    }
}

impl fmt::Display for PreviewFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PreviewFormat {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "yuv420sp" => Ok(PreviewFormat::Yuv420sp),
            "yuv420p" => Ok(PreviewFormat::Yuv420p),
            _ => Err(CameraError::InvalidArgument(format!(
                "Invalid preview format '{}'",
                s
            ))),
        }
    }
}

/// Snapshot format requested from the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PictureFormat {
    /// The sensor encodes the JPEG itself
    #[default]
    #[serde(rename = "jpeg")]
    Jpeg,
    #[serde(rename = "yuv420sp")]
    Yuv420sp,
    /// Tiled NV12 for zero-copy handoff
    #[serde(rename = "yuv420sp_custom")]
    Yuv420spCustom,
    #[serde(rename = "yuv420p")]
    Yuv420p,
    #[serde(rename = "yuv422i")]
    Yuv422i,
    #[serde(rename = "uyv422i")]
    Uyv422i,
    #[serde(rename = "yuv422p")]
    Yuv422p,
    #[serde(rename = "rgb565")]
    Rgb565,
}

impl PictureFormat {
    pub const ALL: &'static [PictureFormat] = &[
        PictureFormat::Jpeg,
        PictureFormat::Yuv420sp,
        PictureFormat::Yuv420spCustom,
        PictureFormat::Yuv420p,
        PictureFormat::Yuv422i,
        PictureFormat::Uyv422i,
        PictureFormat::Yuv422p,
        PictureFormat::Rgb565,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PictureFormat::Jpeg => "jpeg",
            PictureFormat::Yuv420sp => "yuv420sp",
            PictureFormat::Yuv420spCustom => "yuv420sp_custom",
            PictureFormat::Yuv420p => "yuv420p",
            PictureFormat::Yuv422i => "yuv422i",
            PictureFormat::Uyv422i => "uyv422i",
            PictureFormat::Yuv422p => "yuv422p",
            PictureFormat::Rgb565 => "rgb565",
        }
    }

    /// Pixel format negotiated with the capture device
    pub fn capture_format(&self) -> PixelFormat {
        match self {
            PictureFormat::Jpeg => PixelFormat::Jpeg,
            PictureFormat::Yuv420sp => PixelFormat::Nv21,
            PictureFormat::Yuv420spCustom => PixelFormat::Nv12t,
            PictureFormat::Yuv420p => PixelFormat::Yuv420,
            PictureFormat::Yuv422i => PixelFormat::Yuyv,
            PictureFormat::Uyv422i => PixelFormat::Uyvy,
            PictureFormat::Yuv422p => PixelFormat::Yuv422p,
            PictureFormat::Rgb565 => PixelFormat::Rgb565,
        }
    }
}

impl fmt::Display for PictureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PictureFormat {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self> {
        let s = if s == "uyv422i_custom" { "uyv422i" } else { s };
        PictureFormat::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| CameraError::InvalidArgument(format!("Invalid picture format '{}'", s)))
    }
}

/// Metering/focus rectangle in normalised coordinates (-1000..=1000)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FocusArea {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub weight: i32,
}

impl FocusArea {
    /// The all-zero area means "let the camera choose"
    pub fn is_dummy(&self) -> bool {
        *self == FocusArea::default()
    }

    /// Centre of the area in preview pixels
    pub fn preview_position(&self, preview: Resolution) -> (u32, u32) {
        // Shift into 0..=2000 first
        let x = ((self.left + self.right) / 2 + 1000).clamp(0, 2000) as u64;
        let y = ((self.top + self.bottom) / 2 + 1000).clamp(0, 2000) as u64;
        (
            (x * preview.width as u64 / 2000) as u32,
            (y * preview.height as u64 / 2000) as u32,
        )
    }
}

impl fmt::Display for FocusArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{},{},{},{})",
            self.left, self.top, self.right, self.bottom, self.weight
        )
    }
}

impl FromStr for FocusArea {
    type Err = CameraError;

    /// Parses the first `(l,t,r,b,w)` group
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CameraError::InvalidArgument(format!("Invalid focus area '{}'", s));
        let inner = s
            .trim()
            .strip_prefix('(')
            .and_then(|rest| rest.split(')').next())
            .ok_or_else(invalid)?;
        let values: Vec<i32> = inner
            .split(',')
            .map(|v| v.trim().parse::<i32>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| invalid())?;
        let [left, top, right, bottom, weight] = values[..] else {
            return Err(invalid());
        };
        let area = FocusArea {
            left,
            top,
            right,
            bottom,
            weight,
        };
        if area.is_dummy() {
            return Ok(area);
        }
        let coords_ok = [left, top, right, bottom]
            .iter()
            .all(|v| (-1000..=1000).contains(v));
        if !coords_ok || left >= right || top >= bottom || !(1..=1000).contains(&weight) {
            return Err(invalid());
        }
        Ok(area)
    }
}

/// Typed client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraParameters {
    pub preview_size: Resolution,
    pub preview_format: PreviewFormat,
    pub picture_size: Resolution,
    pub picture_format: PictureFormat,
    pub jpeg_quality: u32,
    /// 0x0 disables the thumbnail
    pub thumbnail_size: Resolution,
    pub thumbnail_quality: u32,
    pub frame_rate: u32,
    /// Preview fps range in milli-fps
    pub fps_range: (u32, u32),
    /// Clockwise rotation of the output in degrees
    pub rotation: u32,
    pub zoom: u32,
    pub exposure_compensation: i32,
    pub contrast: i32,
    pub sharpness: i32,
    pub saturation: i32,
    pub metering: Metering,
    pub white_balance: WhiteBalance,
    pub effect: Effect,
    pub scene_mode: SceneMode,
    pub flash_mode: FlashMode,
    pub focus_mode: FocusMode,
    pub focus_distances: String,
    pub focus_area: FocusArea,
    pub iso: Iso,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
    pub gps_altitude: Option<f64>,
    pub gps_timestamp: Option<i64>,
    pub gps_processing_method: Option<String>,
    /// Record pipe geometry; the preview size when unset
    pub recording_size: Option<Resolution>,
}

impl CameraParameters {
    pub fn defaults(profile: DeviceProfile) -> Self {
        Self {
            preview_size: profile.default_preview_size(),
            preview_format: PreviewFormat::Yuv420sp,
            picture_size: profile.default_picture_size(),
            picture_format: PictureFormat::Jpeg,
            jpeg_quality: 100,
            thumbnail_size: profile.default_thumbnail_size(),
            thumbnail_quality: 100,
            frame_rate: profile.frame_rate(),
            fps_range: profile.fps_range(),
            rotation: 0,
            zoom: 0,
            exposure_compensation: 0,
            contrast: 0,
            sharpness: 0,
            saturation: 0,
            metering: Metering::Center,
            white_balance: WhiteBalance::Auto,
            effect: Effect::None,
            scene_mode: SceneMode::Auto,
            flash_mode: FlashMode::Off,
            focus_mode: FocusMode::Auto,
            focus_distances: profile.focus_distances(FocusMode::Auto).to_string(),
            focus_area: FocusArea::default(),
            iso: profile.default_iso(),
            gps_latitude: None,
            gps_longitude: None,
            gps_altitude: None,
            gps_timestamp: None,
            gps_processing_method: None,
            recording_size: None,
        }
    }

    /// GPS tags for the encoder, when a position is set
    pub fn gps_info(&self) -> Option<GpsInfo> {
        Some(GpsInfo {
            latitude: self.gps_latitude?,
            longitude: self.gps_longitude?,
            altitude: self.gps_altitude.unwrap_or(0.0),
            timestamp: self.gps_timestamp.unwrap_or(0),
            processing_method: self.gps_processing_method.clone(),
        })
    }

    pub fn thumbnail(&self) -> Option<Resolution> {
        self.thumbnail_size
            .is_valid()
            .then_some(self.thumbnail_size)
    }

    pub fn recording_size(&self) -> Resolution {
        self.recording_size.unwrap_or(self.preview_size)
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Flat string-keyed view of the parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterMap {
    entries: BTreeMap<String, String>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key=value;key=value`. Empty segments are skipped.
    pub fn unflatten(s: &str) -> Result<Self> {
        let mut map = Self::new();
        for segment in s.split(';').filter(|seg| !seg.trim().is_empty()) {
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                CameraError::InvalidArgument(format!("Malformed parameter '{}'", segment))
            })?;
            map.set(key.trim(), value.trim());
        }
        Ok(map)
    }

    pub fn flatten(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(";")
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl ToString) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current values plus the read-only capability keys of `profile`
    pub fn from_parameters(params: &CameraParameters, profile: DeviceProfile) -> Self {
        let mut map = Self::new();

        map.set("preview-size", params.preview_size);
        map.set("preview-format", params.preview_format);
        map.set("preview-size-values", join(profile.preview_sizes()));
        map.set("preview-format-values", "yuv420sp,yuv420p");
        map.set("picture-size", params.picture_size);
        map.set("picture-format", params.picture_format);
        map.set("picture-size-values", join(profile.picture_sizes()));
        map.set("picture-format-values", PictureFormat::Jpeg);
        map.set("video-frame-format", "yuv420p");

        map.set("jpeg-quality", params.jpeg_quality);
        map.set("jpeg-thumbnail-width", params.thumbnail_size.width);
        map.set("jpeg-thumbnail-height", params.thumbnail_size.height);
        map.set("jpeg-thumbnail-quality", params.thumbnail_quality);
        map.set(
            "jpeg-thumbnail-size-values",
            format!("{},0x0", profile.default_thumbnail_size()),
        );

        map.set("preview-frame-rate", params.frame_rate);
        map.set("preview-frame-rate-values", profile.frame_rate());
        map.set(
            "preview-fps-range",
            format!("{},{}", params.fps_range.0, params.fps_range.1),
        );
        let (min_fps, max_fps) = profile.fps_range();
        map.set("preview-fps-range-values", format!("({},{})", min_fps, max_fps));
        map.set("rotation", params.rotation);

        map.set("zoom", params.zoom);
        map.set("max-zoom", MAX_ZOOM);
        map.set("zoom-ratios", ZOOM_RATIOS);
        map.set("zoom-supported", "true");

        map.set("exposure-compensation", params.exposure_compensation);
        map.set("min-exposure-compensation", MIN_BRIGHTNESS);
        map.set("max-exposure-compensation", MAX_BRIGHTNESS);
        map.set("exposure-compensation-step", "0.5");
        map.set("contrast", params.contrast);
        map.set("min-contrast", MIN_ADJUST);
        map.set("max-contrast", MAX_ADJUST);
        map.set("sharpness", params.sharpness);
        map.set("saturation", params.saturation);
        map.set("metering", params.metering);

        map.set("whitebalance", params.white_balance);
        map.set("whitebalance-values", join(WhiteBalance::ALL));
        map.set("effect", params.effect);
        map.set("effect-values", join(profile.effects()));
        map.set("scene-mode", params.scene_mode);
        map.set("scene-mode-values", join(SceneMode::ALL));
        map.set("flash-mode", params.flash_mode);
        map.set("flash-mode-values", join(flash_modes(profile)));
        map.set("focus-mode", params.focus_mode);
        map.set("focus-mode-values", join(profile.focus_modes()));
        map.set("focus-distances", &params.focus_distances);
        map.set("focus-areas", params.focus_area);
        map.set("max-num-focus-areas", if profile.has_autofocus() { 1 } else { 0 });
        map.set("iso", params.iso);
        map.set("iso-values", join(profile.iso_values()));

        map.set("focal-length", profile.focal_length());
        map.set("horizontal-view-angle", "51.2");
        map.set("vertical-view-angle", "39.4");

        if let Some(v) = params.gps_latitude {
            map.set("gps-latitude", v);
        }
        if let Some(v) = params.gps_longitude {
            map.set("gps-longitude", v);
        }
        if let Some(v) = params.gps_altitude {
            map.set("gps-altitude", v);
        }
        if let Some(v) = params.gps_timestamp {
            map.set("gps-timestamp", v);
        }
        if let Some(v) = &params.gps_processing_method {
            map.set("gps-processing-method", v);
        }
        if let Some(size) = params.recording_size {
            map.set("recording-size", size);
        }
        map
    }
}

impl fmt::Display for ParameterMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.flatten())
    }
}

fn flash_modes(profile: DeviceProfile) -> &'static [FlashMode] {
    if profile.has_autofocus() {
        FlashMode::ALL
    } else {
        &[FlashMode::Off]
    }
}

/// What a parameter update changed beyond the stored values
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterChanges {
    /// Keys whose value was rejected and left unchanged
    pub rejected: Vec<String>,
    pub preview_changed: bool,
    /// The colour effect changed; frames should be skipped while it settles
    pub effect_changed: bool,
    /// New touch-focus target: `Some(None)` returns to full-frame focus
    pub focus_position: Option<Option<(u32, u32)>>,
}

impl ParameterChanges {
    /// One `InvalidArgument` naming every rejected key
    pub fn rejection_error(&self) -> Option<CameraError> {
        if self.rejected.is_empty() {
            None
        } else {
            Some(CameraError::InvalidArgument(format!(
                "Rejected parameters: {}",
                self.rejected.join(", ")
            )))
        }
    }
}

/// Collects rejected keys while an update is applied
struct Update<'a> {
    map: &'a ParameterMap,
    changes: ParameterChanges,
}

impl Update<'_> {
    /// Parsed value of `key`; `None` when absent or unparsable (the latter
    /// is recorded as a rejection)
    fn value<T: FromStr>(&mut self, key: &str) -> Option<T> {
        let raw = self.map.get(key)?;
        match raw.parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                self.reject(key, &format!("cannot parse '{}'", raw));
                None
            }
        }
    }

    /// Record a rejection when `result` is an error
    fn check(&mut self, key: &str, result: Result<()>) {
        if let Err(e) = result {
            self.reject(key, &e.to_string());
        }
    }

    fn reject(&mut self, key: &str, reason: &str) {
        warn!("Rejected parameter {}: {}", key, reason);
        self.changes.rejected.push(key.to_string());
    }
}

fn parse_fps_range(s: &str) -> Option<(u32, u32)> {
    let (min, max) = s
        .trim_matches(|c| c == '(' || c == ')')
        .split_once(',')?;
    let min = min.trim().parse().ok()?;
    let max = max.trim().parse().ok()?;
    (min <= max).then_some((min, max))
}

fn normalize_rotation(rotation: i32) -> Result<u32> {
    match rotation {
        0 | 90 | 180 | 270 | -90 | -180 | -270 => Ok(rotation.rem_euclid(360) as u32),
        _ => Err(CameraError::InvalidArgument(format!(
            "Rotation {} is not a multiple of 90",
            rotation
        ))),
    }
}

fn check_quality(q: u32) -> Result<()> {
    if (1..=100).contains(&q) {
        Ok(())
    } else {
        Err(CameraError::InvalidArgument(format!(
            "Quality {} out of range 1-100",
            q
        )))
    }
}

fn set_focus_mode(
    params: &mut CameraParameters,
    ledger: &mut SettingsLedger,
    mode: FocusMode,
) -> Result<()> {
    ledger.set(Setting::FocusMode(mode))?;
    params.focus_mode = mode;
    params.focus_distances = ledger.profile().focus_distances(mode).to_string();
    Ok(())
}

/// Stage a ledger setting and mirror it into `params` when accepted
fn stage(
    up: &mut Update<'_>,
    ledger: &mut SettingsLedger,
    key: &str,
    setting: Setting,
    commit: impl FnOnce(),
) -> bool {
    match ledger.set(setting) {
        Ok(changed) => {
            commit();
            changed
        }
        Err(e) => {
            up.reject(key, &e.to_string());
            false
        }
    }
}

/// Apply a client update.
///
/// Keys absent from `map` keep their value, except the GPS keys, which
/// describe the current fix and are cleared when absent. Read-only
/// capability keys are ignored.
pub fn apply_parameters(
    params: &mut CameraParameters,
    ledger: &mut SettingsLedger,
    map: &ParameterMap,
) -> ParameterChanges {
    let profile = ledger.profile();
    let mut up = Update {
        map,
        changes: ParameterChanges::default(),
    };

    if let Some(size) = up.value::<Resolution>("preview-size") {
        if !profile.supports_preview_size(size) {
            up.reject("preview-size", &format!("{} is not a supported preview size", size));
        } else if size != params.preview_size {
            params.preview_size = size;
            up.changes.preview_changed = true;
        }
    }
    if let Some(format) = up.value::<PreviewFormat>("preview-format") {
        if format != params.preview_format {
            params.preview_format = format;
            up.changes.preview_changed = true;
        }
    }
    if let Some(size) = up.value::<Resolution>("picture-size") {
        if size.is_valid() {
            params.picture_size = size;
        } else {
            up.reject("picture-size", "empty size");
        }
    }
    if let Some(format) = up.value::<PictureFormat>("picture-format") {
        params.picture_format = format;
    }
    if let Some(q) = up.value::<u32>("jpeg-quality") {
        let result = check_quality(q).map(|_| params.jpeg_quality = q);
        up.check("jpeg-quality", result);
    }
    if let Some(q) = up.value::<u32>("jpeg-thumbnail-quality") {
        let result = check_quality(q).map(|_| params.thumbnail_quality = q);
        up.check("jpeg-thumbnail-quality", result);
    }
    let thumb_w = up.value::<u32>("jpeg-thumbnail-width");
    let thumb_h = up.value::<u32>("jpeg-thumbnail-height");
    if thumb_w.is_some() || thumb_h.is_some() {
        params.thumbnail_size = Resolution::new(
            thumb_w.unwrap_or(params.thumbnail_size.width),
            thumb_h.unwrap_or(params.thumbnail_size.height),
        );
    }
    if let Some(rotation) = up.value::<i32>("rotation") {
        let result = normalize_rotation(rotation).map(|r| params.rotation = r);
        up.check("rotation", result);
    }
    if let Some(size) = up.value::<Resolution>("recording-size") {
        if size.is_valid() {
            params.recording_size = Some(size);
        } else {
            up.reject("recording-size", "empty size");
        }
    }

    if let Some(fps) = up.value::<u32>("preview-frame-rate") {
        stage(&mut up, ledger, "preview-frame-rate", Setting::FrameRate(fps), || {
            params.frame_rate = fps
        });
    }
    if let Some(zoom) = up.value::<u32>("zoom") {
        stage(&mut up, ledger, "zoom", Setting::Zoom(zoom), || params.zoom = zoom);
    }
    if let Some(v) = up.value::<i32>("exposure-compensation") {
        stage(&mut up, ledger, "exposure-compensation", Setting::Brightness(v), || {
            params.exposure_compensation = v
        });
    }
    if let Some(v) = up.value::<i32>("contrast") {
        stage(&mut up, ledger, "contrast", Setting::Contrast(v), || params.contrast = v);
    }
    if let Some(v) = up.value::<i32>("sharpness") {
        stage(&mut up, ledger, "sharpness", Setting::Sharpness(v), || params.sharpness = v);
    }
    if let Some(v) = up.value::<i32>("saturation") {
        stage(&mut up, ledger, "saturation", Setting::Saturation(v), || {
            params.saturation = v
        });
    }
    if let Some(m) = up.value::<Metering>("metering") {
        stage(&mut up, ledger, "metering", Setting::Metering(m), || params.metering = m);
    }
    if let Some(wb) = up.value::<WhiteBalance>("whitebalance") {
        stage(&mut up, ledger, "whitebalance", Setting::WhiteBalance(wb), || {
            params.white_balance = wb
        });
    }
    if let Some(iso) = up.value::<Iso>("iso") {
        stage(&mut up, ledger, "iso", Setting::Iso(iso), || params.iso = iso);
    }
    if let Some(mode) = up.value::<FocusMode>("focus-mode") {
        let result = set_focus_mode(params, ledger, mode);
        up.check("focus-mode", result);
    }

    // The fps range is tied to the scene mode
    let new_scene = up.value::<SceneMode>("scene-mode");
    let scene_changed = new_scene.is_some_and(|s| s != params.scene_mode);
    if let Some(raw) = map.get("preview-fps-range") {
        match parse_fps_range(raw) {
            Some(range) if range == params.fps_range => {}
            Some(range) if scene_changed => params.fps_range = range,
            Some(_) => up.reject("preview-fps-range", "fixed unless the scene mode changes"),
            None => up.reject("preview-fps-range", "not a valid range"),
        }
    }
    let mut flash = up.value::<FlashMode>("flash-mode");
    if let Some(scene) = new_scene {
        match ledger.set(Setting::SceneMode(scene)) {
            Ok(_) => {
                if scene_changed {
                    params.fps_range = profile.fps_range();
                }
                if scene != SceneMode::Auto {
                    if profile.has_autofocus() {
                        if let Err(e) = set_focus_mode(params, ledger, FocusMode::Auto) {
                            warn!("Scene {} could not reset focus: {}", scene, e);
                        }
                    }
                    flash = Some(match scene {
                        SceneMode::Portrait | SceneMode::Party => FlashMode::Auto,
                        _ => FlashMode::Off,
                    });
                    if scene == SceneMode::Night {
                        params.fps_range = NIGHT_FPS_RANGE;
                    }
                }
                params.scene_mode = scene;
            }
            Err(e) => up.reject("scene-mode", &e.to_string()),
        }
    }
    if let Some(mode) = flash {
        if flash_modes(profile).contains(&mode) {
            params.flash_mode = mode;
        } else {
            up.reject("flash-mode", &format!("{} not supported by this camera", mode));
        }
    }

    if let Some(effect) = up.value::<Effect>("effect") {
        if stage(&mut up, ledger, "effect", Setting::Effect(effect), || {
            params.effect = effect
        }) {
            up.changes.effect_changed = true;
        }
    }

    if let Some(area) = up.value::<FocusArea>("focus-areas") {
        if !area.is_dummy() && !profile.has_autofocus() {
            up.reject("focus-areas", "camera has no focus control");
        } else if area != params.focus_area {
            params.focus_area = area;
            up.changes.focus_position = Some(
                (!area.is_dummy()).then(|| area.preview_position(params.preview_size)),
            );
        }
    }

    params.gps_latitude = up.value("gps-latitude");
    params.gps_longitude = up.value("gps-longitude");
    params.gps_altitude = up.value("gps-altitude");
    params.gps_timestamp = up.value("gps-timestamp");
    params.gps_processing_method = map.get("gps-processing-method").map(str::to_string);

    debug!(
        "Parameters applied with {} rejected keys",
        up.changes.rejected.len()
    );
    up.changes
}
