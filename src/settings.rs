// SPDX-License-Identifier: GPL-3.0-only

//! Capture settings snapshot
//!
//! Settings are an immutable value object supplied by a provider; the core
//! never persists them. Each numeric field is optional: `None` leaves the
//! driver default untouched. Out-of-range values are clamped into the valid
//! range rather than rejected.
//!
//! Exposure convention: manual exposure is expressed in log2-seconds,
//! valid range -13..=-1 (so -5 is 1/32 s). It is only applied when the
//! profile's exposure mode is `Manual`; in `Auto` mode the driver owns it.

use crate::device::{CaptureDevice, ControlId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Exposure control ownership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureMode {
    #[default]
    Auto,
    Manual,
}

/// Which settings profile to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Video,
    Photo,
}

/// Valid range for one control
const BRIGHTNESS_RANGE: (f64, f64) = (0.0, 255.0);
const CONTRAST_RANGE: (f64, f64) = (0.0, 255.0);
const SATURATION_RANGE: (f64, f64) = (0.0, 255.0);
const GAIN_RANGE: (f64, f64) = (0.0, 10.0);
const EXPOSURE_RANGE: (f64, f64) = (-13.0, -1.0);

/// Capture parameters for one profile
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSettings {
    pub brightness: Option<f64>,
    pub contrast: Option<f64>,
    pub saturation: Option<f64>,
    pub gain: Option<f64>,
    /// Manual exposure in log2-seconds; ignored when `exposure_mode` is auto
    pub exposure: Option<f64>,
    pub exposure_mode: ExposureMode,
}

/// Timelapse scheduler parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelapseSettings {
    pub enabled: bool,
    /// Minutes between captures, clamped to 1..=60
    pub interval_min: u32,
}

impl Default for TimelapseSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_min: 2,
        }
    }
}

impl TimelapseSettings {
    pub fn clamped_interval_min(&self) -> u32 {
        self.interval_min.clamp(1, 60)
    }
}

/// Full settings snapshot: one profile per consumer plus the timelapse knobs
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub video: ProfileSettings,
    pub photo: ProfileSettings,
    pub timelapse: TimelapseSettings,
}

impl CaptureSettings {
    pub fn profile(&self, profile: Profile) -> &ProfileSettings {
        match profile {
            Profile::Video => &self.video,
            Profile::Photo => &self.photo,
        }
    }
}

/// Read-only source of settings snapshots
pub trait SettingsProvider: Send + Sync {
    /// Current snapshot. Called on every open/apply so external changes are
    /// picked up without a restart.
    fn snapshot(&self) -> CaptureSettings;
}

/// Fixed settings, mainly for tests and the virtual demo
pub struct StaticSettings(pub CaptureSettings);

impl SettingsProvider for StaticSettings {
    fn snapshot(&self) -> CaptureSettings {
        self.0
    }
}

/// Settings read from a JSON file on every snapshot
///
/// A missing or malformed file falls back to defaults so a bad edit can
/// never take the camera down.
pub struct JsonFileSettings {
    path: PathBuf,
}

impl JsonFileSettings {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Default location under the user config directory
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("camkeeper")
            .join("settings.json")
    }
}

impl SettingsProvider for JsonFileSettings {
    fn snapshot(&self) -> CaptureSettings {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "settings file invalid, using defaults");
                    CaptureSettings::default()
                }
            },
            Err(_) => CaptureSettings::default(),
        }
    }
}

fn clamp_into(value: f64, range: (f64, f64), control: ControlId) -> f64 {
    let clamped = value.clamp(range.0, range.1);
    if clamped != value {
        warn!(%control, value, clamped, "settings value out of range, clamping");
    }
    clamped
}

/// Apply one profile to an open device
///
/// The exposure mode selector goes first so the driver accepts a manual
/// exposure value afterwards. Rejected controls are logged and skipped;
/// drivers routinely lack some of these.
pub fn apply_profile(device: &mut dyn CaptureDevice, settings: &CaptureSettings, profile: Profile) {
    let prof = settings.profile(profile);

    let mode_value = match prof.exposure_mode {
        ExposureMode::Auto => 0.0,
        ExposureMode::Manual => 1.0,
    };
    if !device.set_control(ControlId::AutoExposure, mode_value) {
        debug!("driver rejected exposure mode selector");
    }

    let mut apply = |control: ControlId, value: Option<f64>, range: (f64, f64)| {
        let Some(value) = value else { return };
        let value = clamp_into(value, range, control);
        if device.set_control(control, value) {
            let actual = device.get_control(control);
            debug!(%control, requested = value, ?actual, "applied setting");
        } else {
            warn!(%control, value, "driver rejected setting");
        }
    };

    apply(ControlId::Brightness, prof.brightness, BRIGHTNESS_RANGE);
    apply(ControlId::Contrast, prof.contrast, CONTRAST_RANGE);
    apply(ControlId::Saturation, prof.saturation, SATURATION_RANGE);
    apply(ControlId::Gain, prof.gain, GAIN_RANGE);
    if prof.exposure_mode == ExposureMode::Manual {
        apply(ControlId::Exposure, prof.exposure, EXPOSURE_RANGE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingDevice {
        values: HashMap<ControlId, f64>,
    }

    impl CaptureDevice for RecordingDevice {
        fn read_frame(&mut self) -> crate::errors::CameraResult<crate::frame::Frame> {
            unreachable!("settings tests never read frames")
        }
        fn set_control(&mut self, control: ControlId, value: f64) -> bool {
            self.values.insert(control, value);
            true
        }
        fn get_control(&self, control: ControlId) -> Option<f64> {
            self.values.get(&control).copied()
        }
        fn is_open(&self) -> bool {
            true
        }
        fn release(&mut self) {}
    }

    #[test]
    fn manual_exposure_is_applied_and_clamped() {
        let mut dev = RecordingDevice::default();
        let settings = CaptureSettings {
            photo: ProfileSettings {
                exposure: Some(-20.0),
                exposure_mode: ExposureMode::Manual,
                ..Default::default()
            },
            ..Default::default()
        };
        apply_profile(&mut dev, &settings, Profile::Photo);
        assert_eq!(dev.get_control(ControlId::Exposure), Some(-13.0));
        assert_eq!(dev.get_control(ControlId::AutoExposure), Some(1.0));
    }

    #[test]
    fn auto_mode_skips_exposure_value() {
        let mut dev = RecordingDevice::default();
        let settings = CaptureSettings {
            video: ProfileSettings {
                exposure: Some(-5.0),
                exposure_mode: ExposureMode::Auto,
                brightness: Some(128.0),
                ..Default::default()
            },
            ..Default::default()
        };
        apply_profile(&mut dev, &settings, Profile::Video);
        assert_eq!(dev.get_control(ControlId::Exposure), None);
        assert_eq!(dev.get_control(ControlId::Brightness), Some(128.0));
        assert_eq!(dev.get_control(ControlId::AutoExposure), Some(0.0));
    }

    #[test]
    fn none_fields_leave_driver_defaults() {
        let mut dev = RecordingDevice::default();
        apply_profile(&mut dev, &CaptureSettings::default(), Profile::Video);
        assert_eq!(dev.get_control(ControlId::Brightness), None);
        assert_eq!(dev.get_control(ControlId::Gain), None);
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let settings = CaptureSettings {
            video: ProfileSettings {
                brightness: Some(100.0),
                exposure_mode: ExposureMode::Manual,
                exposure: Some(-6.0),
                ..Default::default()
            },
            timelapse: TimelapseSettings {
                enabled: true,
                interval_min: 5,
            },
            ..Default::default()
        };
        let json = serde_json::to_string(&settings).unwrap();
        let back: CaptureSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn timelapse_interval_is_clamped() {
        let t = TimelapseSettings {
            enabled: true,
            interval_min: 0,
        };
        assert_eq!(t.clamped_interval_min(), 1);
        let t = TimelapseSettings {
            enabled: true,
            interval_min: 600,
        };
        assert_eq!(t.clamped_interval_min(), 60);
    }
}
