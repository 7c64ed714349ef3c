// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Structured configuration for the decode and encode adapters.
//!
//! Encoder tuning and custom GOP structures are passed the way users of the
//! hardware are used to, as `key=value` pairs separated by `:`, and are
//! validated into [`EncoderParams`] before any session is opened.

pub mod gop;

use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::config::gop::CustomGop;
use crate::config::gop::GopPicType;
use crate::config::gop::GopPreset;
use crate::config::gop::MAX_CUSTOM_GOP_SIZE;
use crate::Codec;
use crate::ColorDescription;
use crate::PixelFormat;
use crate::Rational;
use crate::Resolution;
use crate::MAX_HEIGHT;
use crate::MAX_WIDTH;

/// Custom transfer sizes must be a multiple of this.
pub const IO_SIZE_ALIGNMENT: u32 = 4096;
/// Smallest picture accepted at all; anything below the hardware minimum but
/// above this is padded.
pub const ABSOLUTE_MIN_DIMENSION: u32 = 32;
pub const MAX_RESOLUTION_AREA: u64 = 8192 * 5120;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown option: {0}")]
    InvalidName(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("invalid {key}: too big")]
    TooBig { key: String },
    #[error("invalid {key}: too small")]
    TooSmall { key: String },
    #[error("invalid {key}: out of range")]
    OutOfRange { key: String },
    #[error("error setting option {key} to value 0")]
    Zero { key: String },
    #[error("intraPeriod {intra_period} incompatible with GOP size {gop_size}")]
    GopIntraIncompatible { intra_period: u32, gop_size: u32 },
    #[error("malformed option string near {0:?}")]
    Malformed(String),
    #[error("iosize {0} is not 4KB aligned")]
    IoSizeNotAligned(u32),
    #[error("device listing requested, no session can be opened")]
    ListRequested,
    #[error("invalid picture width {0}")]
    Width(u32),
    #[error("invalid picture height {0}")]
    Height(u32),
    #[error("picture area {0} exceeds {MAX_RESOLUTION_AREA}")]
    AreaTooBig(u64),
    #[error("reconfiguration file line {line}: {reason}")]
    ReconfFile { line: usize, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// How the device and core are picked when a session opens.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum DeviceSelector {
    /// Least loaded device.
    #[default]
    BestLoad,
    /// Device with the fewest instances.
    BestInstance,
    /// List devices instead of opening a session.
    List,
    /// An explicit device node name.
    Named(String),
}

impl FromStr for DeviceSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "bestload" => DeviceSelector::BestLoad,
            "bestinst" => DeviceSelector::BestInstance,
            "list" => DeviceSelector::List,
            name => DeviceSelector::Named(name.to_string()),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    pub selector: DeviceSelector,
    /// Core index, -1 picks one automatically.
    pub hw_index: i32,
    /// Custom transfer size in bytes.
    pub io_size: Option<u32>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            selector: DeviceSelector::default(),
            hw_index: -1,
            io_size: None,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.selector == DeviceSelector::List {
            return Err(ConfigError::ListRequested);
        }

        if self.hw_index < -1 {
            return Err(ConfigError::TooSmall {
                key: "enc/dec".into(),
            });
        }

        match self.io_size {
            Some(size) if size == 0 || size % IO_SIZE_ALIGNMENT != 0 => {
                Err(ConfigError::IoSizeNotAligned(size))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DecoderConfig {
    pub device: DeviceConfig,
    pub codec: Codec,
    /// Resolution announced by the container, used until the hardware
    /// reports the real one.
    pub resolution: Resolution,
    /// Out of band parameter sets.
    pub extradata: Vec<u8>,
    /// Attach user data unregistered SEI found in the stream to output frames.
    pub user_data_sei_passthru: bool,
    /// Decoded frames the caller may hold at once.
    pub output_buffers: usize,
    /// Duration added to the running clock for frames without a PTS.
    pub frame_duration: i64,
}

impl DecoderConfig {
    pub fn new(codec: Codec, resolution: Resolution) -> Self {
        Self {
            device: DeviceConfig::default(),
            codec,
            resolution,
            extradata: Vec::new(),
            user_data_sei_passthru: false,
            output_buffers: 16,
            frame_duration: 1,
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.device.validate()?;

        if self.resolution.is_empty() {
            return Err(ConfigError::Width(self.resolution.width));
        }
        if self.output_buffers == 0 {
            return Err(ConfigError::Zero {
                key: "output_buffers".into(),
            });
        }

        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct EncoderConfig {
    pub device: DeviceConfig,
    pub codec: Codec,
    pub resolution: Resolution,
    pub pixel_format: PixelFormat,
    pub time_base: Rational,
    pub ticks_per_frame: i64,
    pub bit_rate: i64,
    pub sample_aspect_ratio: Rational,
    /// Colour metadata that overrides the frames' own, field by field.
    pub color: ColorDescription,
    /// Carry parameter sets out of band instead of in the first packet.
    pub global_header: bool,
    /// Allow passing page aligned frames to the device without copying.
    pub yuv_copy_bypass: bool,
    /// `key=value:key=value` encoder tuning.
    pub xcoder_params: Option<String>,
    /// `key=value:key=value` custom GOP description.
    pub xcoder_gop: Option<String>,
}

impl EncoderConfig {
    pub fn new(codec: Codec, resolution: Resolution) -> Self {
        Self {
            device: DeviceConfig::default(),
            codec,
            resolution,
            pixel_format: PixelFormat::I420,
            time_base: Rational::new(1, 30),
            ticks_per_frame: 1,
            bit_rate: 0,
            sample_aspect_ratio: Rational::new(0, 1),
            color: ColorDescription::default(),
            global_header: false,
            yuv_copy_bypass: true,
            xcoder_params: None,
            xcoder_gop: None,
        }
    }

    /// Validates the whole configuration and resolves the tuning strings.
    pub fn params(&self) -> ConfigResult<EncoderParams> {
        self.device.validate()?;
        check_dimensions(self.resolution)?;

        let mut params = EncoderParams::default();
        if self.bit_rate > 0 {
            params.bitrate = self.bit_rate;
        }
        if self.time_base.num > 0 && self.ticks_per_frame > 0 {
            params.frame_rate =
                (self.time_base.den as i64 / (self.time_base.num as i64 * self.ticks_per_frame))
                    .max(1) as u32;
        }

        if let Some(opts) = &self.xcoder_params {
            for (key, value) in parse_key_values(opts)? {
                params.set_value(&key, &value)?;
            }
        }

        if let Some(opts) = &self.xcoder_gop {
            let mut gop = params.custom_gop.take().unwrap_or_default();
            for (key, value) in parse_key_values(opts)? {
                set_gop_value(&mut gop, &key, &value)?;
            }
            params.custom_gop = Some(gop);
        }

        params.validate()?;
        Ok(params)
    }
}

/// Rounds odd dimensions up and checks them against the hardware limits.
pub fn check_dimensions(resolution: Resolution) -> ConfigResult<Resolution> {
    let width = resolution.width + resolution.width % 2;
    let height = resolution.height + resolution.height % 2;

    if width < ABSOLUTE_MIN_DIMENSION {
        return Err(ConfigError::Width(width));
    }
    if height < ABSOLUTE_MIN_DIMENSION {
        return Err(ConfigError::Height(height));
    }
    if width > MAX_WIDTH {
        return Err(ConfigError::TooBig { key: "width".into() });
    }
    if height > MAX_HEIGHT {
        return Err(ConfigError::TooBig {
            key: "height".into(),
        });
    }

    let area = width as u64 * height as u64;
    if area > MAX_RESOLUTION_AREA {
        return Err(ConfigError::AreaTooBig(area));
    }

    Ok(Resolution::new(width, height))
}

/// Splits `a=1:b=2` into its pairs.
pub fn parse_key_values(s: &str) -> ConfigResult<Vec<(String, String)>> {
    s.split(':')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(ConfigError::Malformed(pair.to_string())),
        })
        .collect()
}

fn parse_int(key: &str, value: &str) -> ConfigResult<i64> {
    value.trim().parse::<i64>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn int_in(key: &str, value: &str, min: i64, max: i64) -> ConfigResult<i64> {
    let v = parse_int(key, value)?;
    if v < min {
        return Err(ConfigError::TooSmall { key: key.into() });
    }
    if v > max {
        return Err(ConfigError::TooBig { key: key.into() });
    }
    Ok(v)
}

/// Like [`int_in`] for enumerated settings, where a bad value is just out of
/// range.
fn choice(key: &str, value: &str, min: i64, max: i64) -> ConfigResult<i64> {
    let v = parse_int(key, value)?;
    if !(min..=max).contains(&v) {
        return Err(ConfigError::OutOfRange { key: key.into() });
    }
    Ok(v)
}

fn flag(key: &str, value: &str) -> ConfigResult<bool> {
    Ok(choice(key, value, 0, 1)? == 1)
}

/// Demo mode replaying dynamic reconfiguration from a file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReconfDemoMode {
    #[default]
    Off,
    Bitrate,
    IntraPeriod,
    LongTermRef,
    RateControl,
    MinMaxQp,
}

impl ReconfDemoMode {
    fn from_value(key: &str, v: i64) -> ConfigResult<Self> {
        Ok(match v {
            0 => ReconfDemoMode::Off,
            1 => ReconfDemoMode::Bitrate,
            2 => ReconfDemoMode::IntraPeriod,
            3 => ReconfDemoMode::LongTermRef,
            5 => ReconfDemoMode::RateControl,
            6 => ReconfDemoMode::MinMaxQp,
            // 4 loaded VUI/HRD blobs from separate files and is not offered.
            4 => {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    value: v.to_string(),
                })
            }
            _ => return Err(ConfigError::OutOfRange { key: key.into() }),
        })
    }

    /// Values each reconfiguration file line carries after the frame number.
    pub fn values_per_entry(&self) -> usize {
        match self {
            ReconfDemoMode::Off => 0,
            ReconfDemoMode::Bitrate => 1,
            ReconfDemoMode::IntraPeriod => 3,
            ReconfDemoMode::LongTermRef => 2,
            ReconfDemoMode::RateControl => 5,
            ReconfDemoMode::MinMaxQp => 7,
        }
    }
}

/// Encoder tuning resolved from [`EncoderConfig`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderParams {
    pub gop_preset_index: i32,
    pub intra_period: u32,
    pub rc_enable: bool,
    pub bitrate: i64,
    pub frame_rate: u32,
    pub intra_qp: i32,
    /// 0 off, 1 headers on every IRAP, 2 on the first IRAP only.
    pub forced_header_enable: u32,
    pub intra_refresh_mode: u32,
    pub intra_refresh_min_period: u32,
    pub roi_enable: bool,
    pub roi_demo_mode: u32,
    pub reconf_demo_mode: ReconfDemoMode,
    pub reconf_file: Option<PathBuf>,
    pub force_pic_qp_demo_mode: u32,
    pub force_frame_type: bool,
    pub strict_timeout: bool,
    pub low_delay: bool,
    pub padding: bool,
    /// Preferred transfer characteristics SEI value, negative when disabled.
    pub preferred_transfer: i32,
    pub generate_enc_hdrs: bool,
    pub conf_win_right: u32,
    pub conf_win_bottom: u32,
    pub custom_gop: Option<CustomGop>,
}

impl Default for EncoderParams {
    fn default() -> Self {
        Self {
            gop_preset_index: 5,
            intra_period: 92,
            rc_enable: false,
            bitrate: 200_000,
            frame_rate: 30,
            intra_qp: 22,
            forced_header_enable: 0,
            intra_refresh_mode: 0,
            intra_refresh_min_period: 0,
            roi_enable: false,
            roi_demo_mode: 0,
            reconf_demo_mode: ReconfDemoMode::Off,
            reconf_file: None,
            force_pic_qp_demo_mode: 0,
            force_frame_type: false,
            strict_timeout: false,
            low_delay: false,
            padding: true,
            preferred_transfer: -1,
            generate_enc_hdrs: false,
            conf_win_right: 0,
            conf_win_bottom: 0,
            custom_gop: None,
        }
    }
}

impl EncoderParams {
    pub fn set_value(&mut self, key: &str, value: &str) -> ConfigResult<()> {
        log::trace!("xcoder-params {}={}", key, value);

        match key {
            "gopPresetIndex" => self.gop_preset_index = choice(key, value, 0, 9)? as i32,
            "intraPeriod" => self.intra_period = int_in(key, value, 0, 1024)? as u32,
            "RcEnable" => self.rc_enable = flag(key, value)?,
            "bitrate" => self.bitrate = int_in(key, value, 10_000, 700_000_000)?,
            "frameRate" => {
                let v = int_in(key, value, 0, 240)?;
                if v == 0 {
                    return Err(ConfigError::Zero { key: key.into() });
                }
                self.frame_rate = v as u32;
            }
            "intraQP" => self.intra_qp = choice(key, value, 0, 51)? as i32,
            "forcedHeaderEnable" => self.forced_header_enable = choice(key, value, 0, 2)? as u32,
            "intraRefreshMode" => self.intra_refresh_mode = choice(key, value, 0, 4)? as u32,
            "intraRefreshMinPeriod" => {
                self.intra_refresh_min_period = int_in(key, value, 0, 8191)? as u32
            }
            "roiEnable" => self.roi_enable = flag(key, value)?,
            "RoiDemoMode" => self.roi_demo_mode = choice(key, value, 0, 2)? as u32,
            "ReconfDemoMode" => {
                self.reconf_demo_mode = ReconfDemoMode::from_value(key, parse_int(key, value)?)?
            }
            "ReconfFile" => {
                if value.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        key: key.into(),
                        value: value.into(),
                    });
                }
                self.reconf_file = Some(PathBuf::from(value));
            }
            "forcePicQpDemoMode" => self.force_pic_qp_demo_mode = choice(key, value, 0, 51)? as u32,
            "forceFrameType" => self.force_frame_type = flag(key, value)?,
            "strictTimeout" => self.strict_timeout = flag(key, value)?,
            "lowDelay" => self.low_delay = flag(key, value)?,
            "padding" => self.padding = flag(key, value)?,
            "prefTRC" => self.preferred_transfer = int_in(key, value, -1, 255)? as i32,
            "generateEncHdrs" => self.generate_enc_hdrs = flag(key, value)?,
            "confWinRight" => self.conf_win_right = int_in(key, value, 0, MAX_WIDTH as i64)? as u32,
            "confWinBottom" => {
                self.conf_win_bottom = int_in(key, value, 0, MAX_HEIGHT as i64)? as u32
            }
            _ => return Err(ConfigError::InvalidName(key.to_string())),
        }

        Ok(())
    }

    pub fn gop_preset(&self) -> Option<GopPreset> {
        GopPreset::from_index(self.gop_preset_index)
    }

    /// Cross-field checks, run once every key has been applied.
    pub fn validate(&self) -> ConfigResult<()> {
        let gop_size = match self.gop_preset() {
            Some(GopPreset::Custom) => match &self.custom_gop {
                Some(gop) if gop.size > 0 => gop.size as u32,
                _ => {
                    return Err(ConfigError::Zero {
                        key: "customGopSize".into(),
                    })
                }
            },
            Some(preset) => preset.gop_size().unwrap_or(1),
            None => {
                return Err(ConfigError::OutOfRange {
                    key: "gopPresetIndex".into(),
                })
            }
        };

        if self.intra_period > 0 && self.intra_period % gop_size != 0 {
            return Err(ConfigError::GopIntraIncompatible {
                intra_period: self.intra_period,
                gop_size,
            });
        }

        if self.reconf_demo_mode != ReconfDemoMode::Off && self.reconf_file.is_none() {
            return Err(ConfigError::InvalidValue {
                key: "ReconfFile".into(),
                value: String::new(),
            });
        }

        Ok(())
    }

    /// Cycle, in packets, at which intra refresh forces a header.
    pub fn intra_refresh_cycle(&self) -> Option<u32> {
        if self.forced_header_enable != 0
            && (1..=3).contains(&self.intra_refresh_mode)
            && self.intra_refresh_min_period > 0
        {
            Some(self.intra_refresh_min_period)
        } else {
            None
        }
    }

    pub fn dts_offset(&self) -> u32 {
        gop::dts_offset(self.gop_preset_index, self.force_frame_type)
    }
}

/// Applies one `xcoder-gop` pair. Picture keys are `g<N><field>` with `N`
/// below [`MAX_CUSTOM_GOP_SIZE`].
fn set_gop_value(gop: &mut CustomGop, key: &str, value: &str) -> ConfigResult<()> {
    if key == "customGopSize" {
        let size = int_in(key, value, 0, MAX_CUSTOM_GOP_SIZE as i64)?;
        if size == 0 {
            return Err(ConfigError::Zero { key: key.into() });
        }
        gop.size = size as usize;
        return Ok(());
    }

    let invalid = || ConfigError::InvalidName(key.to_string());
    let rest = key.strip_prefix('g').ok_or_else(invalid)?;
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    let index: usize = rest[..digits].parse().map_err(|_| invalid())?;
    if index >= MAX_CUSTOM_GOP_SIZE {
        return Err(invalid());
    }

    let pic = &mut gop.pictures[index];
    match &rest[digits..] {
        "picType" => {
            pic.pic_type = match choice(key, value, 0, 2)? {
                0 => GopPicType::I,
                1 => GopPicType::P,
                _ => GopPicType::B,
            }
        }
        "pocOffset" => pic.poc_offset = int_in(key, value, 1, MAX_CUSTOM_GOP_SIZE as i64)? as i32,
        "picQp" => pic.pic_qp = int_in(key, value, -51, 51)? as i32,
        "numRefPicL0" => pic.num_ref_pic_l0 = int_in(key, value, 0, 2)? as u32,
        "refPocL0" => pic.ref_poc_l0 = int_in(key, value, -64, 64)? as i32,
        "refPocL1" => pic.ref_poc_l1 = int_in(key, value, -64, 64)? as i32,
        "temporalId" => pic.temporal_id = int_in(key, value, 0, 7)? as u32,
        _ => return Err(invalid()),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(params: &str) -> EncoderConfig {
        let mut config = EncoderConfig::new(Codec::H265, Resolution::new(1920, 1080));
        config.xcoder_params = Some(params.to_string());
        config
    }

    #[test]
    fn device_selector() {
        assert_eq!("bestload".parse::<DeviceSelector>().unwrap(), DeviceSelector::BestLoad);
        assert_eq!(
            "/dev/nvme1".parse::<DeviceSelector>().unwrap(),
            DeviceSelector::Named("/dev/nvme1".into())
        );

        let device = DeviceConfig {
            selector: DeviceSelector::List,
            ..Default::default()
        };
        assert!(matches!(device.validate(), Err(ConfigError::ListRequested)));
    }

    #[test]
    fn io_size_alignment() {
        let mut device = DeviceConfig {
            io_size: Some(8192),
            ..Default::default()
        };
        assert!(device.validate().is_ok());
        device.io_size = Some(5000);
        assert!(matches!(device.validate(), Err(ConfigError::IoSizeNotAligned(5000))));
        device.io_size = Some(0);
        assert!(device.validate().is_err());
    }

    #[test]
    fn key_value_pairs() {
        let pairs = parse_key_values("gopPresetIndex=2:intraPeriod=30:").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("gopPresetIndex".to_string(), "2".to_string()),
                ("intraPeriod".to_string(), "30".to_string())
            ]
        );
        assert!(matches!(parse_key_values("lowDelay"), Err(ConfigError::Malformed(_))));
    }

    #[test]
    fn params_errors() {
        assert!(matches!(config("noSuchKey=1").params(), Err(ConfigError::InvalidName(_))));
        assert!(matches!(config("intraQP=abc").params(), Err(ConfigError::InvalidValue { .. })));
        assert!(matches!(config("intraQP=60").params(), Err(ConfigError::OutOfRange { .. })));
        assert!(matches!(config("bitrate=1").params(), Err(ConfigError::TooSmall { .. })));
        assert!(matches!(config("intraPeriod=5000").params(), Err(ConfigError::TooBig { .. })));
        assert!(matches!(config("frameRate=0").params(), Err(ConfigError::Zero { .. })));
        assert!(matches!(
            config("gopPresetIndex=5:intraPeriod=30").params(),
            Err(ConfigError::GopIntraIncompatible {
                intra_period: 30,
                gop_size: 4
            })
        ));
        assert!(matches!(
            config("ReconfDemoMode=4:ReconfFile=x").params(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn params_applied() {
        let params = config("gopPresetIndex=2:lowDelay=1:prefTRC=18:padding=0")
            .params()
            .unwrap();
        assert_eq!(params.gop_preset(), Some(GopPreset::Ipp));
        assert_eq!(params.dts_offset(), 0);
        assert!(params.low_delay);
        assert!(!params.padding);
        assert_eq!(params.preferred_transfer, 18);
        assert_eq!(params.frame_rate, 30);

        let params = config("forcedHeaderEnable=1:intraRefreshMode=2:intraRefreshMinPeriod=10")
            .params()
            .unwrap();
        assert_eq!(params.intra_refresh_cycle(), Some(10));
    }

    #[test]
    fn custom_gop() {
        let mut cfg = config("gopPresetIndex=0:intraPeriod=4");
        cfg.xcoder_gop = Some(
            "customGopSize=2:g0picType=1:g0pocOffset=2:g1picType=2:g1pocOffset=1:g1numRefPicL0=1"
                .to_string(),
        );
        let params = cfg.params().unwrap();
        let gop = params.custom_gop.unwrap();
        assert_eq!(gop.size, 2);
        assert_eq!(gop.pictures[1].pic_type, GopPicType::B);
        assert_eq!(gop.num_reorder(), 1);

        cfg.xcoder_gop = Some("g9picType=1".into());
        assert!(matches!(cfg.params(), Err(ConfigError::InvalidName(_))));
        cfg.xcoder_gop = Some("customGopSize=0".into());
        assert!(matches!(cfg.params(), Err(ConfigError::Zero { .. })));
    }

    #[test]
    fn dimensions() {
        assert_eq!(
            check_dimensions(Resolution::new(175, 99)).unwrap(),
            Resolution::new(176, 100)
        );
        assert!(matches!(check_dimensions(Resolution::new(16, 100)), Err(ConfigError::Width(16))));
        assert!(matches!(
            check_dimensions(Resolution::new(1920, 9000)),
            Err(ConfigError::TooBig { .. })
        ));
        assert!(matches!(
            check_dimensions(Resolution::new(8192, 8192)),
            Err(ConfigError::AreaTooBig(_))
        ));
    }
}
