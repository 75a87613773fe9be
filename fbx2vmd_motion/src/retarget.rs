//! Bone retargeting onto the destination rig.
//!
//! Each mapped bone carries a precomputed pair `(q_l, q_r)` so a source-local
//! rotation becomes `q_l * q * q_r` in the destination bone's local space,
//! followed by a handedness flip into the destination coordinate system.
//! The pairs are derived from a fixed rest-orientation table plus an A-pose
//! arm correction and are computed once per process.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::f64::consts::{FRAC_PI_2, PI};
use std::sync::OnceLock;

use glam::{DQuat, DVec3};
use indexmap::IndexMap;
use ordered_float::OrderedFloat;

use crate::animation::AnimationClip;

/// Uniform source-to-destination position scale.
const POSITION_SCALE: f64 = 1.0 / 12.5;

/// Vertical offset applied to positions after scaling.
const HEIGHT_OFFSET: f64 = -8.3;

/// A-pose arm correction angle in degrees.
const ARM_CORRECTION_DEGREES: f64 = 35.0;

/// Source rig namespace prefix.
const RIG_PREFIX: &str = "mixamorig:";

/// English source bone names to destination rig names.
/// Unlisted bones pass through unchanged.
const BONE_NAMES: &[(&str, &str)] = &[
    ("Hips", "センター"),
    ("Spine", "上半身"),
    ("Spine1", "上半身2"),
    ("Neck", "首"),
    ("Head", "頭"),
    ("LeftShoulder", "左肩"),
    ("LeftArm", "左腕"),
    ("LeftForeArm", "左ひじ"),
    ("LeftHand", "左手首"),
    ("RightShoulder", "右肩"),
    ("RightArm", "右腕"),
    ("RightForeArm", "右ひじ"),
    ("RightHand", "右手首"),
    ("LeftUpLeg", "左足"),
    ("LeftLeg", "左ひざ"),
    ("LeftFoot", "左足首"),
    ("LeftToeBase", "左つま先"),
    ("RightUpLeg", "右足"),
    ("RightLeg", "右ひざ"),
    ("RightFoot", "右足首"),
    ("RightToeBase", "右つま先"),
    ("LeftHandThumb1", "左親指０"),
    ("LeftHandThumb2", "左親指１"),
    ("LeftHandThumb3", "左親指２"),
    ("LeftHandIndex1", "左人指１"),
    ("LeftHandIndex2", "左人指２"),
    ("LeftHandIndex3", "左人指３"),
    ("LeftHandMiddle1", "左中指１"),
    ("LeftHandMiddle2", "左中指２"),
    ("LeftHandMiddle3", "左中指３"),
    ("LeftHandRing1", "左薬指１"),
    ("LeftHandRing2", "左薬指２"),
    ("LeftHandRing3", "左薬指３"),
    ("LeftHandPinky1", "左小指１"),
    ("LeftHandPinky2", "左小指２"),
    ("LeftHandPinky3", "左小指３"),
    ("RightHandThumb1", "右親指０"),
    ("RightHandThumb2", "右親指１"),
    ("RightHandThumb3", "右親指２"),
    ("RightHandIndex1", "右人指１"),
    ("RightHandIndex2", "右人指２"),
    ("RightHandIndex3", "右人指３"),
    ("RightHandMiddle1", "右中指１"),
    ("RightHandMiddle2", "右中指２"),
    ("RightHandMiddle3", "右中指３"),
    ("RightHandRing1", "右薬指１"),
    ("RightHandRing2", "右薬指２"),
    ("RightHandRing3", "右薬指３"),
    ("RightHandPinky1", "右小指１"),
    ("RightHandPinky2", "右小指２"),
    ("RightHandPinky3", "右小指３"),
];

/// A clip expressed in the destination rig's local space and coordinates.
#[derive(Debug, PartialEq, Clone)]
pub struct RetargetedClip {
    pub name: String,
    pub duration: f64,
    pub tracks: Vec<RetargetedBoneTrack>,
}

/// One bone's motion after retargeting.
#[derive(Debug, PartialEq, Clone)]
pub struct RetargetedBoneTrack {
    /// Destination rig bone name.
    pub dest_name: String,
    /// Source bone name kept for reference.
    pub source_name: String,
    pub rotations: BTreeMap<OrderedFloat<f64>, DQuat>,
    pub positions: BTreeMap<OrderedFloat<f64>, DVec3>,
}

/// Strip the source rig namespace prefix, ignoring case.
pub fn strip_rig_prefix(name: &str) -> &str {
    name.get(..RIG_PREFIX.len())
        .filter(|head| head.eq_ignore_ascii_case(RIG_PREFIX))
        .map(|_| &name[RIG_PREFIX.len()..])
        .unwrap_or(name)
}

/// Destination name for a stripped source bone name.
pub fn map_bone_name(name: &str) -> &str {
    BONE_NAMES
        .iter()
        .find(|(english, _)| *english == name)
        .map(|(_, japanese)| *japanese)
        .unwrap_or(name)
}

/// Retarget every clip onto the destination rig.
pub fn retarget(clips: &[AnimationClip]) -> Vec<RetargetedClip> {
    clips.iter().map(retarget_clip).collect()
}

fn retarget_clip(clip: &AnimationClip) -> RetargetedClip {
    let table = retarget_table();
    let mut tracks: IndexMap<String, RetargetedBoneTrack> = IndexMap::new();

    for rotation in &clip.rotation_tracks {
        let source = strip_rig_prefix(&rotation.bone);
        let pair = table.get(source).copied();
        let entry = track_entry(&mut tracks, source, &rotation.bone);
        entry.rotations = rotation
            .keyframes
            .iter()
            .map(|(time, q)| {
                let local = match pair {
                    Some((q_l, q_r)) => q_l * *q * q_r,
                    None => *q,
                };
                (*time, flip_handedness(local))
            })
            .collect();
    }

    for position in &clip.position_tracks {
        let source = strip_rig_prefix(&position.bone);
        let q_l = table
            .get(source)
            .map(|(q_l, _)| *q_l)
            .unwrap_or(DQuat::IDENTITY);
        let entry = track_entry(&mut tracks, source, &position.bone);
        entry.positions = position
            .keyframes
            .iter()
            .map(|(time, value)| (*time, retarget_position(q_l, *value)))
            .collect();
    }

    let duration = if clip.duration > 0.0 {
        clip.duration
    } else {
        max_track_time(&tracks)
    };

    RetargetedClip {
        name: clip.name.clone(),
        duration,
        tracks: tracks.into_values().collect(),
    }
}

fn track_entry<'a>(
    tracks: &'a mut IndexMap<String, RetargetedBoneTrack>,
    source: &str,
    source_name: &str,
) -> &'a mut RetargetedBoneTrack {
    tracks
        .entry(source.to_string())
        .or_insert_with(|| RetargetedBoneTrack {
            dest_name: map_bone_name(source).to_string(),
            source_name: source_name.to_string(),
            rotations: BTreeMap::new(),
            positions: BTreeMap::new(),
        })
}

/// Mirror into the destination coordinate system.
fn flip_handedness(q: DQuat) -> DQuat {
    DQuat::from_xyzw(q.x, q.y, -q.z, -q.w)
}

fn retarget_position(q_l: DQuat, value: DVec3) -> DVec3 {
    let scaled = (q_l * value) * POSITION_SCALE;
    DVec3::new(scaled.x, scaled.y + HEIGHT_OFFSET, -scaled.z)
}

fn max_track_time(tracks: &IndexMap<String, RetargetedBoneTrack>) -> f64 {
    tracks
        .values()
        .flat_map(|track| track.rotations.keys().chain(track.positions.keys()))
        .map(|time| time.0)
        .fold(0.0, f64::max)
}

fn retarget_table() -> &'static HashMap<String, (DQuat, DQuat)> {
    static TABLE: OnceLock<HashMap<String, (DQuat, DQuat)>> = OnceLock::new();
    TABLE.get_or_init(build_retarget_table)
}

fn build_retarget_table() -> HashMap<String, (DQuat, DQuat)> {
    // Source bone frames point +y along the bone, so lateral chains swing
    // y onto ±x and the leg chain flips y downward.
    let arm_left = DQuat::from_rotation_z(-FRAC_PI_2) * DQuat::from_rotation_y(FRAC_PI_2);
    let arm_right = DQuat::from_rotation_z(FRAC_PI_2) * DQuat::from_rotation_y(-FRAC_PI_2);
    let leg = DQuat::from_rotation_z(PI);

    let correction = ARM_CORRECTION_DEGREES.to_radians();
    let lean_left = DQuat::from_rotation_z(correction);
    let lean_right = DQuat::from_rotation_z(-correction);

    let mut rest: Vec<(String, DQuat)> = Vec::new();
    for (side, orientation) in [("Left", arm_left), ("Right", arm_right)] {
        for bone in arm_chain(side) {
            rest.push((bone, orientation));
        }
        rest.push((format!("{side}UpLeg"), leg));
        rest.push((format!("{side}Leg"), leg));
    }

    let pre_left = adjusted_bones("Left", "Arm");
    let pre_right = adjusted_bones("Right", "Arm");
    let post_left = adjusted_bones("Left", "ForeArm");
    let post_right = adjusted_bones("Right", "ForeArm");

    rest.into_iter()
        .map(|(bone, q_a)| {
            let q_l = if pre_left.contains(&bone) {
                lean_right * q_a
            } else if pre_right.contains(&bone) {
                lean_left * q_a
            } else {
                q_a
            };
            let q_r = if post_left.contains(&bone) {
                q_a.inverse() * lean_left
            } else if post_right.contains(&bone) {
                q_a.inverse() * lean_right
            } else {
                q_a.inverse()
            };
            (bone, (q_l, q_r))
        })
        .collect()
}

fn arm_chain(side: &str) -> Vec<String> {
    let mut bones = vec![
        format!("{side}Shoulder"),
        format!("{side}Arm"),
        format!("{side}ForeArm"),
        format!("{side}Hand"),
    ];
    bones.extend(finger_bones(side));
    bones
}

fn finger_bones(side: &str) -> Vec<String> {
    ["Thumb", "Index", "Middle", "Ring", "Pinky"]
        .iter()
        .flat_map(|finger| (1..=3).map(move |joint| format!("{side}Hand{finger}{joint}")))
        .collect()
}

/// The named arm bone plus every finger bone on `side`.
fn adjusted_bones(side: &str, arm_bone: &str) -> HashSet<String> {
    let mut bones: HashSet<String> = finger_bones(side).into_iter().collect();
    bones.insert(format!("{side}{arm_bone}"));
    bones
}
