//! # fbx2vmd_motion
//! fbx2vmd_motion turns skeletal animation parsed by `fbx2vmd_lib` into
//! motion data for the destination rig.
//!
//! The pipeline is [load] (parse and extract clips), [retarget] (express each
//! bone track in the destination rig's local space), and [write_vmd] (encode
//! one clip as a motion container blob).
use fbx2vmd_lib::fbx::Fbx;

pub mod animation;
pub mod error;
pub mod export;
pub mod retarget;

pub use animation::{extract_clips, AnimationClip, PositionTrack, RestPose, RotationTrack};
pub use error::{LoadAnimationError, WriteVmdError};
pub use export::{vmd_from_clip, write_vmd, DEFAULT_FRAME_RATE};
pub use retarget::{retarget, RetargetedBoneTrack, RetargetedClip};

/// Parse a scene container and extract its animation clips.
pub fn load(bytes: &[u8]) -> Result<Vec<AnimationClip>, LoadAnimationError> {
    let fbx = Fbx::from_bytes(bytes)?;
    Ok(extract_clips(&fbx))
}

#[cfg(test)]
mod tests {
    use super::*;

    use fbx2vmd_lib::fbx::{Node, Property};
    use pretty_assertions::assert_eq;

    fn encode_property(property: &Property) -> Vec<u8> {
        let mut out = Vec::new();
        match property {
            Property::I64(v) => {
                out.push(b'L');
                out.extend(v.to_le_bytes());
            }
            Property::String(v) => {
                out.push(b'S');
                out.extend((v.len() as u32).to_le_bytes());
                out.extend(v.as_bytes());
            }
            Property::I64Array(v) => {
                out.push(b'l');
                out.extend((v.len() as u32).to_le_bytes());
                out.extend(0u32.to_le_bytes());
                out.extend((v.len() as u32 * 8).to_le_bytes());
                for value in v {
                    out.extend(value.to_le_bytes());
                }
            }
            Property::F32Array(v) => {
                out.push(b'f');
                out.extend((v.len() as u32).to_le_bytes());
                out.extend(0u32.to_le_bytes());
                out.extend((v.len() as u32 * 4).to_le_bytes());
                for value in v {
                    out.extend(value.to_le_bytes());
                }
            }
            other => panic!("fixture does not encode {other:?}"),
        }
        out
    }

    fn node_size(node: &Node) -> u64 {
        let properties: usize = node.properties.iter().map(|p| encode_property(p).len()).sum();
        let children: u64 = node.children.iter().map(node_size).sum();
        let terminator = if node.children.is_empty() { 0 } else { 13 };
        13 + node.name.len() as u64 + properties as u64 + children + terminator
    }

    fn encode_node(node: &Node, start: u64, out: &mut Vec<u8>) {
        let properties: Vec<Vec<u8>> = node.properties.iter().map(encode_property).collect();
        let properties_len: usize = properties.iter().map(Vec::len).sum();
        out.extend(((start + node_size(node)) as u32).to_le_bytes());
        out.extend((node.properties.len() as u32).to_le_bytes());
        out.extend((properties_len as u32).to_le_bytes());
        out.push(node.name.len() as u8);
        out.extend(node.name.as_bytes());
        for property in properties {
            out.extend(property);
        }
        let mut pos = start + 13 + node.name.len() as u64 + properties_len as u64;
        for child in &node.children {
            encode_node(child, pos, out);
            pos += node_size(child);
        }
        if !node.children.is_empty() {
            out.extend([0u8; 13]);
        }
    }

    fn encode_file(top_level: &[Node]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(b"Kaydara FBX Binary  \x00\x1a\x00");
        out.extend(7400u32.to_le_bytes());
        let mut pos = out.len() as u64;
        for node in top_level {
            encode_node(node, pos, &mut out);
            pos += node_size(node);
        }
        out.extend([0u8; 13]);
        out
    }

    fn node(name: &str, properties: Vec<Property>, children: Vec<Node>) -> Node {
        Node {
            name: name.to_string(),
            properties,
            children,
        }
    }

    fn p_str(value: &str) -> Property {
        Property::String(value.to_string())
    }

    fn curve(id: i64, ticks: Vec<i64>, values: Vec<f32>) -> Node {
        node(
            "AnimationCurve",
            vec![Property::I64(id)],
            vec![
                node("KeyTime", vec![Property::I64Array(ticks)], Vec::new()),
                node("KeyValueFloat", vec![Property::F32Array(values)], Vec::new()),
            ],
        )
    }

    fn oo(source: i64, dest: i64, relationship: Option<&str>) -> Node {
        let mut properties = vec![p_str("OO"), Property::I64(source), Property::I64(dest)];
        if let Some(relationship) = relationship {
            properties.push(p_str(relationship));
        }
        node("C", properties, Vec::new())
    }

    #[test]
    fn load_retarget_write_identity_hips() {
        let second = (1.0 / animation::SECONDS_PER_TICK).round() as i64;
        let mut objects = vec![
            node(
                "Model",
                vec![
                    Property::I64(400),
                    p_str("Model::mixamorig:Hips"),
                    p_str("LimbNode"),
                ],
                Vec::new(),
            ),
            node(
                "AnimationStack",
                vec![Property::I64(100), p_str("AnimStack::Take 001"), p_str("")],
                Vec::new(),
            ),
            node(
                "AnimationLayer",
                vec![Property::I64(200), p_str("AnimLayer::Base"), p_str("")],
                Vec::new(),
            ),
            node(
                "AnimationCurveNode",
                vec![Property::I64(300), p_str("AnimCurveNode::R"), p_str("")],
                Vec::new(),
            ),
        ];
        for id in [501, 502, 503] {
            objects.push(curve(id, vec![0, second], vec![0.0, 0.0]));
        }
        let connections = vec![
            oo(200, 100, None),
            oo(300, 200, None),
            oo(300, 400, Some("LimbNode")),
            oo(501, 300, Some("d|X")),
            oo(502, 300, Some("d|Y")),
            oo(503, 300, Some("d|Z")),
        ];
        let bytes = encode_file(&[
            node("Objects", Vec::new(), objects),
            node("Connections", Vec::new(), connections),
        ]);

        let clips = load(&bytes).unwrap();
        assert_eq!(1, clips.len());
        assert_eq!(1, clips[0].rotation_tracks.len());

        let retargeted = retarget(&clips);
        assert_eq!(1.0, retargeted[0].duration);
        assert_eq!("センター", retargeted[0].tracks[0].dest_name);

        let vmd = write_vmd(&retargeted[0], DEFAULT_FRAME_RATE).unwrap();
        assert_eq!(50 + 4 + 111 * 2 + 4 * 4 + 4 + 135, vmd.len());

        // Two records at frames 0 and 30 with the sign-flipped identity rotation.
        assert_eq!(2u32.to_le_bytes(), vmd[50..54]);
        assert_eq!(0u32.to_le_bytes(), vmd[54 + 15..54 + 19]);
        assert_eq!(30u32.to_le_bytes(), vmd[165 + 15..165 + 19]);
        assert_eq!(0.0f32.to_le_bytes(), vmd[54 + 31..54 + 35]);
        assert_eq!((-1.0f32).to_le_bytes(), vmd[54 + 43..54 + 47]);
    }
}
