//! VMD assembly from retargeted clips.
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Included, Unbounded};

use fbx2vmd_lib::vmd::{BoneFrame, IkState, PropertyFrame, Vmd};
use glam::{DQuat, DVec3};
use ordered_float::OrderedFloat;

use crate::animation::slerp;
use crate::error::WriteVmdError;
use crate::retarget::{RetargetedBoneTrack, RetargetedClip};

/// Output frame rate when the caller does not specify one.
pub const DEFAULT_FRAME_RATE: f64 = 30.0;

/// IK chains switched off so converted rotations play back as authored.
const DISABLED_IK_BONES: [&str; 6] = [
    "左足ＩＫ",
    "右足ＩＫ",
    "左つま先ＩＫ",
    "右つま先ＩＫ",
    "左足ＩＫ親",
    "右足ＩＫ親",
];

/// Encode `clip` at `fps` into a motion container blob.
pub fn write_vmd(clip: &RetargetedClip, fps: f64) -> Result<Vec<u8>, WriteVmdError> {
    vmd_from_clip(clip, fps).to_bytes().map_err(Into::into)
}

/// Build the container value without serializing it.
pub fn vmd_from_clip(clip: &RetargetedClip, fps: f64) -> Vmd {
    let mut bone_frames: Vec<BoneFrame> = clip
        .tracks
        .iter()
        .flat_map(|track| track_frames(track, fps))
        .collect();
    bone_frames.sort_by(|a, b| a.frame.cmp(&b.frame).then_with(|| a.name.cmp(&b.name)));

    Vmd {
        model_name: String::new(),
        bone_frames,
        property_frames: vec![ik_disable_frame()],
    }
}

/// One record per merged keyframe time the bone participates in.
fn track_frames(track: &RetargetedBoneTrack, fps: f64) -> Vec<BoneFrame> {
    let times: BTreeSet<OrderedFloat<f64>> = track
        .rotations
        .keys()
        .chain(track.positions.keys())
        .copied()
        .collect();

    times
        .into_iter()
        .map(|time| {
            let rotation = sanitize_rotation(sample_rotation(&track.rotations, time));
            let position = sanitize_position(sample_position(&track.positions, time));
            BoneFrame {
                name: track.dest_name.clone(),
                frame: (time.0 * fps).round().max(0.0) as u32,
                translation: [position.x as f32, position.y as f32, position.z as f32],
                rotation: [
                    rotation.x as f32,
                    rotation.y as f32,
                    rotation.z as f32,
                    rotation.w as f32,
                ],
            }
        })
        .collect()
}

fn sample_rotation(keys: &BTreeMap<OrderedFloat<f64>, DQuat>, time: OrderedFloat<f64>) -> DQuat {
    if let Some(q) = keys.get(&time) {
        return *q;
    }
    let before = keys.range((Unbounded, Included(time))).next_back();
    let after = keys.range((Excluded(time), Unbounded)).next();
    match (before, after) {
        (Some((t0, q0)), Some((t1, q1))) => {
            let factor = (time.0 - t0.0) / (t1.0 - t0.0);
            slerp(*q0, *q1, factor)
        }
        (Some((_, q)), None) | (None, Some((_, q))) => *q,
        (None, None) => DQuat::IDENTITY,
    }
}

fn sample_position(keys: &BTreeMap<OrderedFloat<f64>, DVec3>, time: OrderedFloat<f64>) -> DVec3 {
    if let Some(v) = keys.get(&time) {
        return *v;
    }
    let before = keys.range((Unbounded, Included(time))).next_back();
    let after = keys.range((Excluded(time), Unbounded)).next();
    match (before, after) {
        (Some((t0, v0)), Some((t1, v1))) => {
            let factor = (time.0 - t0.0) / (t1.0 - t0.0);
            v0.lerp(*v1, factor)
        }
        (Some((_, v)), None) | (None, Some((_, v))) => *v,
        (None, None) => DVec3::ZERO,
    }
}

fn sanitize_rotation(q: DQuat) -> DQuat {
    if q.is_finite() {
        q
    } else {
        DQuat::IDENTITY
    }
}

fn sanitize_position(v: DVec3) -> DVec3 {
    DVec3::new(
        finite_or_zero(v.x),
        finite_or_zero(v.y),
        finite_or_zero(v.z),
    )
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn ik_disable_frame() -> PropertyFrame {
    PropertyFrame {
        frame: 0,
        visible: true,
        ik_states: DISABLED_IK_BONES
            .iter()
            .map(|name| IkState {
                name: (*name).to_string(),
                enabled: false,
            })
            .collect(),
    }
}
