//! Animation extraction from the decoded scene container.
//!
//! Stacks, layers, curve nodes, and curves are related by an object connection
//! list keyed by 64-bit IDs. Walking it yields per-axis Euler curves that are
//! merged onto a shared timeline and converted to unit quaternion tracks.
use std::collections::{BTreeMap, BTreeSet};

use fbx2vmd_lib::fbx::{Fbx, Node, Property};
use glam::{DQuat, DVec3};
use indexmap::IndexMap;
use log::{debug, warn};
use ordered_float::OrderedFloat;

use crate::retarget::strip_rig_prefix;

/// Seconds per integer time tick in the source container.
pub const SECONDS_PER_TICK: f64 = 1.0 / 46_186_158_000.0;

const MICROSECONDS_PER_SECOND: f64 = 1_000_000.0;

/// A single animation take extracted from the scene.
#[derive(Debug, PartialEq, Clone)]
pub struct AnimationClip {
    pub name: String,
    /// Negative until recomputed from track extents during retargeting.
    pub duration: f64,
    /// The duration the source stack declares, kept for diagnostics only.
    pub declared_duration: Option<f64>,
    pub rotation_tracks: Vec<RotationTrack>,
    pub position_tracks: Vec<PositionTrack>,
    /// Bone name to parent bone name for the tracked bones, rig prefix stripped.
    pub parents: IndexMap<String, String>,
}

/// Orientation keys for one bone.
#[derive(Debug, PartialEq, Clone)]
pub struct RotationTrack {
    pub bone: String,
    /// Unit quaternions keyed by seconds, unrolled so adjacent keys have a
    /// non-negative dot product.
    pub keyframes: BTreeMap<OrderedFloat<f64>, DQuat>,
    pub rest: Option<RestPose>,
}

/// Translation keys for one bone in source units.
#[derive(Debug, PartialEq, Clone)]
pub struct PositionTrack {
    pub bone: String,
    pub keyframes: BTreeMap<OrderedFloat<f64>, DVec3>,
    pub rest: Option<RestPose>,
}

/// Rest-pose attributes read from a bone model node. Rotations in radians.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct RestPose {
    pub pre_rotation: Option<DVec3>,
    pub post_rotation: Option<DVec3>,
    pub rotation: Option<DVec3>,
    pub translation: Option<DVec3>,
}

#[derive(Debug, Clone, Copy)]
struct Connection<'a> {
    source: i64,
    dest: i64,
    relationship: Option<&'a str>,
}

/// Animation objects indexed by ID in declaration order.
struct Objects<'a> {
    models: IndexMap<i64, &'a Node>,
    stacks: IndexMap<i64, &'a Node>,
    layers: IndexMap<i64, &'a Node>,
    curve_nodes: IndexMap<i64, &'a Node>,
    curves: IndexMap<i64, &'a Node>,
}

impl<'a> Objects<'a> {
    fn from_node(objects: &'a Node) -> Self {
        let mut index = Self {
            models: IndexMap::new(),
            stacks: IndexMap::new(),
            layers: IndexMap::new(),
            curve_nodes: IndexMap::new(),
            curves: IndexMap::new(),
        };
        for child in &objects.children {
            let Some(id) = child.prop(0).and_then(Property::as_i64) else {
                continue;
            };
            match child.name.as_str() {
                "Model" => {
                    index.models.insert(id, child);
                }
                "AnimationStack" => {
                    index.stacks.insert(id, child);
                }
                "AnimationLayer" => {
                    index.layers.insert(id, child);
                }
                "AnimationCurveNode" => {
                    index.curve_nodes.insert(id, child);
                }
                "AnimationCurve" => {
                    index.curves.insert(id, child);
                }
                _ => (),
            }
        }
        index
    }
}

/// Walk the object graph and collect every animation stack as a clip.
pub fn extract_clips(fbx: &Fbx) -> Vec<AnimationClip> {
    let Some(objects_node) = fbx.root.child("Objects") else {
        warn!("scene contains no Objects group");
        return Vec::new();
    };
    let objects = Objects::from_node(objects_node);
    let connections = object_connections(&fbx.root);

    objects
        .stacks
        .iter()
        .map(|(stack_id, stack)| extract_clip(*stack_id, stack, &objects, &connections))
        .collect()
}

fn object_connections(root: &Node) -> Vec<Connection> {
    root.child("Connections")
        .map(|connections| {
            connections
                .children_named("C")
                .filter(|c| c.prop(0).and_then(Property::as_str) == Some("OO"))
                .filter_map(|c| {
                    Some(Connection {
                        source: c.prop(1).and_then(Property::as_i64)?,
                        dest: c.prop(2).and_then(Property::as_i64)?,
                        relationship: c.prop(3).and_then(Property::as_str),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn extract_clip(
    stack_id: i64,
    stack: &Node,
    objects: &Objects,
    connections: &[Connection],
) -> AnimationClip {
    let name = stack
        .prop(1)
        .and_then(Property::as_str)
        .map(display_name)
        .filter(|name| !name.is_empty())
        .unwrap_or("Animation")
        .to_string();

    let declared_duration = declared_duration(stack);
    if let Some(declared) = declared_duration {
        debug!("{name}: stack declares a duration of {declared}s");
    }

    let mut rotation_tracks = Vec::new();
    let mut position_tracks = Vec::new();

    for layer_id in connection_sources(connections, stack_id, &objects.layers) {
        for curve_node_id in connection_sources(connections, layer_id, &objects.curve_nodes) {
            let Some(curve_node) = objects.curve_nodes.get(&curve_node_id).copied() else {
                continue;
            };
            // The animated model is the destination of the one connection
            // leaving the curve node with a relationship string.
            let Some(model) = connections
                .iter()
                .find(|c| {
                    c.source == curve_node_id
                        && c.relationship.is_some_and(|r| !r.is_empty())
                        && objects.models.contains_key(&c.dest)
                })
                .and_then(|c| objects.models.get(&c.dest).copied())
            else {
                continue;
            };
            let Some(bone) = model_name(model) else {
                continue;
            };
            let rest = rest_pose(model);

            match curve_node.prop(1).and_then(Property::as_str).map(display_name) {
                Some("R") => {
                    if let Some(track) =
                        rotation_track(curve_node_id, bone, rest, objects, connections)
                    {
                        rotation_tracks.push(track);
                    }
                }
                Some("T") => {
                    if let Some(track) =
                        position_track(curve_node_id, bone, rest, objects, connections)
                    {
                        position_tracks.push(track);
                    }
                }
                // Scale and custom attributes are not converted.
                _ => (),
            }
        }
    }

    let tracked: BTreeSet<String> = rotation_tracks
        .iter()
        .map(|t| &t.bone)
        .chain(position_tracks.iter().map(|t| &t.bone))
        .map(|bone| strip_rig_prefix(bone).to_string())
        .collect();
    let parents = parent_map(connections, objects, &tracked);

    AnimationClip {
        name,
        duration: -1.0,
        declared_duration,
        rotation_tracks,
        position_tracks,
        parents,
    }
}

/// Sources of connections into `dest` restricted to IDs in `pool`,
/// in connection declaration order.
fn connection_sources(
    connections: &[Connection],
    dest: i64,
    pool: &IndexMap<i64, &Node>,
) -> Vec<i64> {
    connections
        .iter()
        .filter(|c| c.dest == dest && pool.contains_key(&c.source))
        .map(|c| c.source)
        .collect()
}

fn model_name(model: &Node) -> Option<&str> {
    model
        .prop(1)
        .and_then(Property::as_str)
        .map(display_name)
        .filter(|name| !name.is_empty())
}

/// The unqualified half of a `Class::Name` property value.
fn display_name(qualified: &str) -> &str {
    qualified.rsplit("::").next().unwrap_or(qualified)
}

fn declared_duration(stack: &Node) -> Option<f64> {
    let properties = stack.child("Properties70")?;
    let stop = properties.child_where("P", &[(0, Property::String("LocalStop".to_string()))])?;
    let ticks = stop.prop(4).and_then(Property::as_i64)?;
    Some(ticks as f64 * SECONDS_PER_TICK)
}

fn rest_pose(model: &Node) -> Option<RestPose> {
    let pre_rotation = model_vector(model, "PreRotation").map(radians_vector);
    let post_rotation = model_vector(model, "PostRotation").map(radians_vector);
    let rotation = model_vector(model, "Lcl Rotation").map(radians_vector);
    let translation = model_vector(model, "Lcl Translation");

    if pre_rotation.is_none() && post_rotation.is_none() && rotation.is_none() && translation.is_none()
    {
        return None;
    }
    Some(RestPose {
        pre_rotation,
        post_rotation,
        rotation,
        translation,
    })
}

fn model_vector(model: &Node, name: &str) -> Option<DVec3> {
    if let Some(properties) = model.child("Properties70") {
        if let Some(p) = properties.child_where("P", &[(0, Property::String(name.to_string()))]) {
            let x = p.prop(4).and_then(Property::to_f64)?;
            let y = p.prop(5).and_then(Property::to_f64)?;
            let z = p.prop(6).and_then(Property::to_f64)?;
            return Some(DVec3::new(x, y, z));
        }
    }

    // Older exporters store these as direct child nodes holding one numeric array.
    let values = model.child(name)?.prop(0).and_then(Property::to_f64_vec)?;
    (values.len() == 3).then(|| DVec3::new(values[0], values[1], values[2]))
}

fn radians_vector(degrees: DVec3) -> DVec3 {
    DVec3::new(
        degrees.x.to_radians(),
        degrees.y.to_radians(),
        degrees.z.to_radians(),
    )
}

fn parent_map(
    connections: &[Connection],
    objects: &Objects,
    tracked: &BTreeSet<String>,
) -> IndexMap<String, String> {
    let mut parents = IndexMap::new();
    for connection in connections {
        let (Some(child), Some(parent)) = (
            objects.models.get(&connection.source).copied(),
            objects.models.get(&connection.dest).copied(),
        ) else {
            continue;
        };
        let (Some(child_name), Some(parent_name)) = (model_name(child), model_name(parent)) else {
            continue;
        };
        let child_name = strip_rig_prefix(child_name);
        if tracked.contains(child_name) {
            parents.insert(
                child_name.to_string(),
                strip_rig_prefix(parent_name).to_string(),
            );
        }
    }
    parents
}

fn rotation_track(
    curve_node_id: i64,
    bone: &str,
    rest: Option<RestPose>,
    objects: &Objects,
    connections: &[Connection],
) -> Option<RotationTrack> {
    let axes = ["X", "Y", "Z"].map(|axis| axis_curve(curve_node_id, axis, objects, connections));
    let [Some(x), Some(y), Some(z)] = axes else {
        warn!("{bone}: rotation curves are missing an axis");
        return None;
    };

    let merged = merge_axes(&[x, y, z]);
    if merged.is_empty() {
        return None;
    }
    let keyframes = unrolled_quaternions(&subdivide_large_arcs(&merged));

    Some(RotationTrack {
        bone: bone.to_string(),
        keyframes,
        rest,
    })
}

fn position_track(
    curve_node_id: i64,
    bone: &str,
    rest: Option<RestPose>,
    objects: &Objects,
    connections: &[Connection],
) -> Option<PositionTrack> {
    let axes = ["X", "Y", "Z"].map(|axis| axis_curve(curve_node_id, axis, objects, connections));
    let [Some(x), Some(y), Some(z)] = axes else {
        warn!("{bone}: translation curves are missing an axis");
        return None;
    };

    let merged = merge_axes(&[x, y, z]);
    if merged.is_empty() {
        return None;
    }
    let keyframes = merged
        .into_iter()
        .map(|(time, values)| {
            (
                OrderedFloat(time),
                DVec3::new(values[0], values[1], values[2]),
            )
        })
        .collect();

    Some(PositionTrack {
        bone: bone.to_string(),
        keyframes,
        rest,
    })
}

/// The curve feeding one axis of a curve node.
fn axis_curve(
    curve_node_id: i64,
    axis: &str,
    objects: &Objects,
    connections: &[Connection],
) -> Option<BTreeMap<i64, f64>> {
    let suffix = format!("|{axis}");
    let curve = connections
        .iter()
        .find(|c| {
            c.dest == curve_node_id
                && objects.curves.contains_key(&c.source)
                && c.relationship
                    .is_some_and(|r| r == axis || r.ends_with(&suffix))
        })
        .and_then(|c| objects.curves.get(&c.source).copied())?;
    curve_keys(curve)
}

/// Keyframes as microsecond time to raw value.
///
/// Rounding to 1 µs merges keys that only differ by tick noise.
fn curve_keys(curve: &Node) -> Option<BTreeMap<i64, f64>> {
    let times = curve
        .child("KeyTime")
        .and_then(|n| n.prop(0))
        .or_else(|| curve.prop(4))
        .and_then(Property::as_i64_array)?;
    let values = curve
        .child("KeyValueFloat")
        .and_then(|n| n.prop(0))
        .or_else(|| curve.prop(5))
        .and_then(Property::as_f32_array)?;

    if times.len() != values.len() {
        warn!(
            "curve has {} times but {} values",
            times.len(),
            values.len()
        );
        return None;
    }

    Some(
        times
            .iter()
            .zip(values)
            .map(|(ticks, value)| (ticks_to_microseconds(*ticks), f64::from(*value)))
            .collect(),
    )
}

fn ticks_to_microseconds(ticks: i64) -> i64 {
    (ticks as f64 * SECONDS_PER_TICK * MICROSECONDS_PER_SECOND).round() as i64
}

/// Union the axis timelines and linearly resample each axis at every merged time.
fn merge_axes(axes: &[BTreeMap<i64, f64>; 3]) -> Vec<(f64, [f64; 3])> {
    let times: BTreeSet<i64> = axes.iter().flat_map(|axis| axis.keys().copied()).collect();
    times
        .into_iter()
        .map(|time| {
            (
                time as f64 / MICROSECONDS_PER_SECOND,
                [
                    sample_axis(&axes[0], time),
                    sample_axis(&axes[1], time),
                    sample_axis(&axes[2], time),
                ],
            )
        })
        .collect()
}

fn sample_axis(axis: &BTreeMap<i64, f64>, time: i64) -> f64 {
    if let Some(value) = axis.get(&time) {
        return *value;
    }
    let before = axis.range(..time).next_back();
    let after = axis.range(time..).next();
    match (before, after) {
        (Some((t0, v0)), Some((t1, v1))) => {
            let factor = (time - t0) as f64 / (t1 - t0) as f64;
            v0 + (v1 - v0) * factor
        }
        (Some((_, value)), None) | (None, Some((_, value))) => *value,
        (None, None) => 0.0,
    }
}

/// Insert keys so no adjacent pair spans 180 degrees or more on any axis.
///
/// Sub-interval boundaries interpolate the endpoint Euler angles and are
/// normalized through a quaternion round trip; the segment endpoint is kept
/// in exact Euler form. Input in degrees, output in radians.
fn subdivide_large_arcs(keys: &[(f64, [f64; 3])]) -> Vec<(f64, DVec3)> {
    let mut out = Vec::with_capacity(keys.len());
    let Some((first_time, first_euler)) = keys.first() else {
        return out;
    };
    out.push((*first_time, radians(*first_euler)));

    for pair in keys.windows(2) {
        let (t0, e0) = pair[0];
        let (t1, e1) = pair[1];
        let max_delta = e1
            .iter()
            .zip(e0)
            .map(|(next, prev)| (next - prev).abs())
            .fold(0.0, f64::max);
        if max_delta >= 180.0 {
            let steps = (max_delta / 180.0).ceil() as usize;
            for step in 1..steps {
                let factor = step as f64 / steps as f64;
                let time = t0 + (t1 - t0) * factor;
                let euler = [
                    e0[0] + (e1[0] - e0[0]) * factor,
                    e0[1] + (e1[1] - e0[1]) * factor,
                    e0[2] + (e1[2] - e0[2]) * factor,
                ];
                let q = quat_from_euler_zxy(radians(euler));
                out.push((time, euler_zxy_from_quat(q)));
            }
        }
        out.push((t1, radians(e1)));
    }
    out
}

fn radians(degrees: [f64; 3]) -> DVec3 {
    DVec3::new(
        degrees[0].to_radians(),
        degrees[1].to_radians(),
        degrees[2].to_radians(),
    )
}

/// Convert Euler keys to quaternions, negating any key whose dot product
/// with its predecessor is negative.
fn unrolled_quaternions(keys: &[(f64, DVec3)]) -> BTreeMap<OrderedFloat<f64>, DQuat> {
    let mut previous: Option<DQuat> = None;
    keys.iter()
        .map(|(time, euler)| {
            let mut q = quat_from_euler_zxy(*euler);
            if let Some(prev) = previous {
                if prev.dot(q) < 0.0 {
                    q = -q;
                }
            }
            previous = Some(q);
            (OrderedFloat(*time), q)
        })
        .collect()
}

/// Compose a rotation from Euler radians in ZXY order.
pub fn quat_from_euler_zxy(euler: DVec3) -> DQuat {
    DQuat::from_rotation_z(euler.z) * DQuat::from_rotation_x(euler.x) * DQuat::from_rotation_y(euler.y)
}

/// Extract Euler radians in ZXY order, branching to a fixed roll at gimbal lock.
pub fn euler_zxy_from_quat(q: DQuat) -> DVec3 {
    let sin_x = 2.0 * (q.y * q.z + q.w * q.x);
    if sin_x.abs() >= 0.9999 {
        DVec3::new(
            std::f64::consts::FRAC_PI_2.copysign(sin_x),
            (2.0 * (q.x * q.y + q.w * q.z)).atan2(1.0 - 2.0 * (q.y * q.y + q.z * q.z)),
            0.0,
        )
    } else {
        DVec3::new(
            sin_x.asin(),
            (-2.0 * (q.x * q.z - q.w * q.y)).atan2(1.0 - 2.0 * (q.x * q.x + q.y * q.y)),
            (-2.0 * (q.x * q.y - q.w * q.z)).atan2(1.0 - 2.0 * (q.x * q.x + q.z * q.z)),
        )
    }
}

/// Shortest-arc spherical interpolation between unit quaternions,
/// blending linearly when the inputs are nearly aligned.
pub fn slerp(a: DQuat, b: DQuat, t: f64) -> DQuat {
    let dot = a.dot(b);
    if dot.abs() > 0.9995 {
        let b = if dot < 0.0 { -b } else { b };
        return (a * (1.0 - t) + b * t).normalize();
    }

    let theta = dot.abs().min(1.0).acos();
    let sin_theta = theta.sin();
    let w0 = ((1.0 - t) * theta).sin() / sin_theta;
    let mut w1 = (t * theta).sin() / sin_theta;
    if dot < 0.0 {
        w1 = -w1;
    }
    a * w0 + b * w1
}
