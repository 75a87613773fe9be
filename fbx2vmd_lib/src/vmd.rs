//! Keyframe-per-bone motion container used by the MMD ecosystem.
//!
//! The container is a flat little-endian stream: a fixed header, bone keyframe
//! records, empty morph/camera/light/self-shadow sections, and property
//! keyframes toggling visibility and IK chains. Bone names are stored in
//! fixed-width Shift-JIS fields. Build a [Vmd] value and serialize it with
//! [Vmd::write] or [Vmd::to_bytes].
use std::{
    io::{BufWriter, Cursor, Seek, Write},
    path::Path,
};

use binrw::{binwrite, BinWrite};
use encoding_rs::SHIFT_JIS;

/// Filler for the per-keyframe interpolation-curve table.
///
/// Only linear playback is produced, so every control point is this value.
pub const CURVE_FILL: u8 = 20;

/// A motion file holding every section the format defines.
#[binwrite]
#[derive(Debug, PartialEq, Clone, Default)]
#[bw(magic(b"Vocaloid Motion Data 0002\0\0\0\0\0"))]
pub struct Vmd {
    /// Name of the model this motion targets. Usually left empty.
    #[bw(map = |name: &String| encode_text(name, 20), pad_size_to = 20)]
    pub model_name: String,

    #[bw(try_calc = u32::try_from(bone_frames.len()))]
    bone_frame_count: u32,
    pub bone_frames: Vec<BoneFrame>,

    #[bw(calc = 0u32)]
    morph_frame_count: u32,
    #[bw(calc = 0u32)]
    camera_frame_count: u32,
    #[bw(calc = 0u32)]
    light_frame_count: u32,
    #[bw(calc = 0u32)]
    self_shadow_frame_count: u32,

    #[bw(try_calc = u32::try_from(property_frames.len()))]
    property_frame_count: u32,
    pub property_frames: Vec<PropertyFrame>,
}

/// A single 111-byte bone keyframe record.
#[binwrite]
#[derive(Debug, PartialEq, Clone)]
pub struct BoneFrame {
    #[bw(map = |name: &String| encode_text(name, 15), pad_size_to = 15)]
    pub name: String,
    pub frame: u32,
    pub translation: [f32; 3],
    /// x, y, z, w.
    pub rotation: [f32; 4],
    #[bw(calc = [CURVE_FILL; 64])]
    interpolation: [u8; 64],
}

/// A display and IK state keyframe.
#[binwrite]
#[derive(Debug, PartialEq, Clone)]
pub struct PropertyFrame {
    pub frame: u32,
    #[bw(map = |v: &bool| u8::from(*v))]
    pub visible: bool,
    #[bw(try_calc = u32::try_from(ik_states.len()))]
    ik_count: u32,
    pub ik_states: Vec<IkState>,
}

#[binwrite]
#[derive(Debug, PartialEq, Clone)]
pub struct IkState {
    #[bw(map = |name: &String| encode_text(name, 20), pad_size_to = 20)]
    pub name: String,
    #[bw(map = |v: &bool| u8::from(*v))]
    pub enabled: bool,
}

impl Vmd {
    pub fn write<W: Write + Seek>(&self, writer: &mut W) -> Result<(), binrw::Error> {
        self.write_le(writer)
    }

    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), binrw::Error> {
        let mut writer = BufWriter::new(std::fs::File::create(path)?);
        self.write_le(&mut writer)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, binrw::Error> {
        let mut writer = Cursor::new(Vec::new());
        self.write_le(&mut writer)?;
        Ok(writer.into_inner())
    }
}

/// Shift-JIS encode `text` truncated to the fixed field width.
///
/// The caller pads the remainder with NUL bytes.
pub fn encode_text(text: &str, limit: usize) -> Vec<u8> {
    let (encoded, _, _) = SHIFT_JIS.encode(text);
    let mut bytes = encoded.into_owned();
    bytes.truncate(limit);
    bytes
}
