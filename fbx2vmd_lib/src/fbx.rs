//! Binary scene container used to interchange character animation between DCC tools.
//!
//! The container stores a tree of tagged records with typed properties.
//! Large numeric arrays may carry a zlib stream that is inflated while reading.
//! Parse the whole tree using [Fbx::from_bytes] and locate data with the
//! [Node] query helpers.
use std::{
    io::{Cursor, Read, Seek, SeekFrom},
    path::Path,
};

use binrw::{BinRead, BinReaderExt, BinResult, Endian, VecArgs};
use log::trace;
use zune_inflate::{DeflateDecoder, DeflateOptions};

use crate::error::{DecompressArrayError, ReadFileError};

/// Node headers switch from 32-bit to 64-bit fields at this version.
const WIDE_HEADER_VERSION: u32 = 7500;

/// The size of the zeroed record terminating a sibling list.
const NULL_RECORD_LEN: u64 = 13;

/// A parsed scene file.
#[derive(Debug, BinRead, PartialEq, Clone)]
#[br(magic(b"Kaydara FBX Binary  \x00\x1a\x00"))]
pub struct Fbx {
    pub version: u32,

    /// Synthetic unnamed node owning the top-level records in declaration order.
    #[br(parse_with = parse_root, args(version >= WIDE_HEADER_VERSION))]
    pub root: Node,
}

impl Fbx {
    pub fn read<R: Read + Seek>(reader: &mut R) -> BinResult<Self> {
        reader.read_le()
    }

    /// Read from `path` using a fully buffered reader for performance.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ReadFileError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| ReadFileError {
            path: path.to_owned(),
            source: e.into(),
        })?;
        Self::from_bytes(&bytes).map_err(|source| ReadFileError {
            path: path.to_owned(),
            source,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> BinResult<Self> {
        Self::read(&mut Cursor::new(bytes))
    }
}

/// A single record in the node tree.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Node {
    /// Short ASCII tag.
    pub name: String,
    pub properties: Vec<Property>,
    pub children: Vec<Node>,
}

impl Node {
    /// The first child named `name`.
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All children named `name` in declaration order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// The first child named `name` whose properties exactly equal `expected`
    /// at the given indices.
    pub fn child_where(&self, name: &str, expected: &[(usize, Property)]) -> Option<&Node> {
        self.children.iter().find(|c| {
            c.name == name
                && expected
                    .iter()
                    .all(|(index, value)| c.prop(*index) == Some(value))
        })
    }

    pub fn prop(&self, index: usize) -> Option<&Property> {
        self.properties.get(index)
    }
}

/// A typed property value attached to a [Node].
#[derive(Debug, PartialEq, Clone)]
pub enum Property {
    I16(i16),
    Bool(bool),
    I32(i32),
    F32(f32),
    F64(f64),
    I64(i64),
    F32Array(Vec<f32>),
    F64Array(Vec<f64>),
    I64Array(Vec<i64>),
    I32Array(Vec<i32>),
    BoolArray(Vec<bool>),
    String(String),
    Bytes(Vec<u8>),
}

impl Property {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64_array(&self) -> Option<&[i64]> {
        match self {
            Self::I64Array(v) => Some(v),
            other if other.is_empty_array() => Some(&[]),
            _ => None,
        }
    }

    pub fn as_i32_array(&self) -> Option<&[i32]> {
        match self {
            Self::I32Array(v) => Some(v),
            other if other.is_empty_array() => Some(&[]),
            _ => None,
        }
    }

    pub fn as_f32_array(&self) -> Option<&[f32]> {
        match self {
            Self::F32Array(v) => Some(v),
            other if other.is_empty_array() => Some(&[]),
            _ => None,
        }
    }

    pub fn as_f64_array(&self) -> Option<&[f64]> {
        match self {
            Self::F64Array(v) => Some(v),
            other if other.is_empty_array() => Some(&[]),
            _ => None,
        }
    }

    /// Any scalar numeric variant widened to f64.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Self::I16(v) => Some(f64::from(*v)),
            Self::I32(v) => Some(f64::from(*v)),
            Self::I64(v) => Some(*v as f64),
            Self::F32(v) => Some(f64::from(*v)),
            Self::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// Any numeric array variant widened to f64.
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        match self {
            Self::F32Array(v) => Some(v.iter().map(|v| f64::from(*v)).collect()),
            Self::F64Array(v) => Some(v.clone()),
            Self::I32Array(v) => Some(v.iter().map(|v| f64::from(*v)).collect()),
            Self::I64Array(v) => Some(v.iter().map(|v| *v as f64).collect()),
            _ => None,
        }
    }

    fn is_empty_array(&self) -> bool {
        match self {
            Self::F32Array(v) => v.is_empty(),
            Self::F64Array(v) => v.is_empty(),
            Self::I64Array(v) => v.is_empty(),
            Self::I32Array(v) => v.is_empty(),
            Self::BoolArray(v) => v.is_empty(),
            _ => false,
        }
    }
}

impl BinRead for Property {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        args: Self::Args<'_>,
    ) -> BinResult<Self> {
        let pos = reader.stream_position()?;
        let tag = u8::read_options(reader, endian, args)?;
        match tag {
            b'Y' => i16::read_options(reader, endian, args).map(Self::I16),
            b'C' => u8::read_options(reader, endian, args).map(|b| Self::Bool(b != 0)),
            b'I' => i32::read_options(reader, endian, args).map(Self::I32),
            b'F' => f32::read_options(reader, endian, args).map(Self::F32),
            b'D' => f64::read_options(reader, endian, args).map(Self::F64),
            b'L' => i64::read_options(reader, endian, args).map(Self::I64),
            b'f' => read_array::<f32, _>(reader, endian).map(Self::F32Array),
            b'd' => read_array::<f64, _>(reader, endian).map(Self::F64Array),
            b'l' => read_array::<i64, _>(reader, endian).map(Self::I64Array),
            b'i' => read_array::<i32, _>(reader, endian).map(Self::I32Array),
            b'b' => read_array::<u8, _>(reader, endian)
                .map(|bytes| Self::BoolArray(bytes.into_iter().map(|b| b != 0).collect())),
            b'S' => read_bytes(reader, endian).map(|bytes| Self::String(decode_string(&bytes))),
            b'R' => read_bytes(reader, endian).map(Self::Bytes),
            tag => Err(binrw::Error::AssertFail {
                pos,
                message: format!("unknown property type {:?}", tag as char),
            }),
        }
    }
}

fn parse_root<R: Read + Seek>(reader: &mut R, endian: Endian, (wide,): (bool,)) -> BinResult<Node> {
    let mut children = Vec::new();
    while let Some(node) = read_node(reader, endian, wide)? {
        children.push(node);
    }
    Ok(Node {
        name: String::new(),
        properties: Vec::new(),
        children,
    })
}

/// Read one record, returning `None` for the zeroed end-of-list sentinel.
fn read_node<R: Read + Seek>(
    reader: &mut R,
    endian: Endian,
    wide: bool,
) -> BinResult<Option<Node>> {
    let end_offset = read_header_word(reader, endian, wide)?;
    let num_properties = read_header_word(reader, endian, wide)?;
    let _property_list_len = read_header_word(reader, endian, wide)?;
    let name_len = u8::read_options(reader, endian, ())?;
    let mut name_bytes = vec![0u8; name_len as usize];
    reader.read_exact(&mut name_bytes)?;

    if end_offset == 0 {
        return Ok(None);
    }

    let name = String::from_utf8_lossy(&name_bytes).into_owned();
    trace!("{name}: {num_properties} properties, ends at {end_offset}");

    let mut properties = Vec::with_capacity(num_properties as usize);
    for _ in 0..num_properties {
        properties.push(Property::read_options(reader, endian, ())?);
    }

    let mut children = Vec::new();
    while end_offset.saturating_sub(reader.stream_position()?) > NULL_RECORD_LEN {
        match read_node(reader, endian, wide)? {
            Some(child) => children.push(child),
            None => break,
        }
    }
    reader.seek(SeekFrom::Start(end_offset))?;

    Ok(Some(Node {
        name,
        properties,
        children,
    }))
}

fn read_header_word<R: Read + Seek>(reader: &mut R, endian: Endian, wide: bool) -> BinResult<u64> {
    if wide {
        u64::read_options(reader, endian, ())
    } else {
        u32::read_options(reader, endian, ()).map(u64::from)
    }
}

/// Read a length-prefixed array that is either raw or a zlib stream.
fn read_array<T, R>(reader: &mut R, endian: Endian) -> BinResult<Vec<T>>
where
    for<'a> T: BinRead<Args<'a> = ()> + 'static,
    R: Read + Seek,
{
    let count = u32::read_options(reader, endian, ())? as usize;
    let encoding = u32::read_options(reader, endian, ())?;
    let compressed_len = u32::read_options(reader, endian, ())? as usize;

    match encoding {
        0 => Vec::<T>::read_options(reader, endian, VecArgs { count, inner: () }),
        1 => {
            let pos = reader.stream_position()?;
            let mut compressed = vec![0u8; compressed_len];
            reader.read_exact(&mut compressed)?;
            let decompressed = DeflateDecoder::new_with_options(
                &compressed,
                DeflateOptions::default().set_size_hint(count * std::mem::size_of::<T>()),
            )
            .decode_zlib()
            .map_err(|e| binrw::Error::Custom {
                pos,
                err: Box::new(DecompressArrayError::from(e)),
            })?;
            Vec::<T>::read_options(
                &mut Cursor::new(decompressed),
                endian,
                VecArgs { count, inner: () },
            )
        }
        other => Err(binrw::Error::AssertFail {
            pos: reader.stream_position()?,
            message: format!("unsupported array encoding {other}"),
        }),
    }
}

fn read_bytes<R: Read + Seek>(reader: &mut R, endian: Endian) -> BinResult<Vec<u8>> {
    let len = u32::read_options(reader, endian, ())? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Swap the halves of a qualified name around the two-byte sentinel.
fn decode_string(bytes: &[u8]) -> String {
    match bytes.windows(2).position(|pair| pair == [0x00, 0x01]) {
        Some(split) => format!(
            "{}::{}",
            String::from_utf8_lossy(&bytes[split + 2..]),
            String::from_utf8_lossy(&bytes[..split])
        ),
        None => String::from_utf8_lossy(bytes).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    struct TestNode {
        name: &'static str,
        properties: Vec<Vec<u8>>,
        children: Vec<TestNode>,
    }

    impl TestNode {
        fn new(name: &'static str, properties: Vec<Vec<u8>>, children: Vec<TestNode>) -> Self {
            Self {
                name,
                properties,
                children,
            }
        }

        fn size(&self, wide: bool) -> u64 {
            let properties: usize = self.properties.iter().map(Vec::len).sum();
            let children: u64 = self.children.iter().map(|c| c.size(wide)).sum();
            let terminator = if self.children.is_empty() {
                0
            } else {
                header_len(wide)
            };
            header_len(wide) + self.name.len() as u64 + properties as u64 + children + terminator
        }

        fn encode(&self, start: u64, wide: bool, out: &mut Vec<u8>) {
            let properties_len: usize = self.properties.iter().map(Vec::len).sum();
            push_header_word(out, start + self.size(wide), wide);
            push_header_word(out, self.properties.len() as u64, wide);
            push_header_word(out, properties_len as u64, wide);
            out.push(self.name.len() as u8);
            out.extend(self.name.as_bytes());
            for property in &self.properties {
                out.extend(property);
            }
            let mut pos = start + header_len(wide) + self.name.len() as u64 + properties_len as u64;
            for child in &self.children {
                child.encode(pos, wide, out);
                pos += child.size(wide);
            }
            if !self.children.is_empty() {
                out.extend(vec![0u8; header_len(wide) as usize]);
            }
        }
    }

    // Node header and null-record size for each header width.
    fn header_len(wide: bool) -> u64 {
        if wide {
            25
        } else {
            13
        }
    }

    fn push_header_word(out: &mut Vec<u8>, value: u64, wide: bool) {
        if wide {
            out.extend(value.to_le_bytes());
        } else {
            out.extend((value as u32).to_le_bytes());
        }
    }

    fn file(nodes: &[TestNode]) -> Vec<u8> {
        file_with_version(nodes, 7400)
    }

    fn file_with_version(nodes: &[TestNode], version: u32) -> Vec<u8> {
        let wide = version >= WIDE_HEADER_VERSION;
        let mut out = Vec::new();
        out.extend(b"Kaydara FBX Binary  \x00\x1a\x00");
        out.extend(version.to_le_bytes());
        let mut pos = out.len() as u64;
        for node in nodes {
            node.encode(pos, wide, &mut out);
            pos += node.size(wide);
        }
        out.extend(vec![0u8; header_len(wide) as usize]);
        out
    }

    fn p_i64(value: i64) -> Vec<u8> {
        let mut bytes = vec![b'L'];
        bytes.extend(value.to_le_bytes());
        bytes
    }

    fn p_f64(value: f64) -> Vec<u8> {
        let mut bytes = vec![b'D'];
        bytes.extend(value.to_le_bytes());
        bytes
    }

    fn p_string(value: &[u8]) -> Vec<u8> {
        let mut bytes = vec![b'S'];
        bytes.extend((value.len() as u32).to_le_bytes());
        bytes.extend(value);
        bytes
    }

    fn p_f32_array(values: &[f32]) -> Vec<u8> {
        let mut bytes = vec![b'f'];
        bytes.extend((values.len() as u32).to_le_bytes());
        bytes.extend(0u32.to_le_bytes());
        bytes.extend((values.len() as u32 * 4).to_le_bytes());
        for value in values {
            bytes.extend(value.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn read_magic_mismatch() {
        let result = Fbx::from_bytes(b"Kaydara FBX ASCII   \x00\x1a\x00\x00\x00\x00\x00");
        assert!(result.is_err());
    }

    #[test]
    fn read_empty_file() {
        let fbx = Fbx::from_bytes(&file(&[])).unwrap();
        assert_eq!(7400, fbx.version);
        assert!(fbx.root.children.is_empty());
    }

    #[test]
    fn read_nodes_and_properties() {
        let bytes = file(&[TestNode::new(
            "Objects",
            Vec::new(),
            vec![TestNode::new(
                "Model",
                vec![p_i64(12345), p_string(b"mixamorig:Hips\x00\x01Model")],
                vec![TestNode::new(
                    "Lcl Translation",
                    vec![p_f64(1.0), p_f64(2.0), p_f64(3.0)],
                    Vec::new(),
                )],
            )],
        )]);

        let fbx = Fbx::from_bytes(&bytes).unwrap();
        let objects = fbx.root.child("Objects").unwrap();
        let model = objects.child("Model").unwrap();
        assert_eq!(Some(12345), model.prop(0).and_then(Property::as_i64));
        assert_eq!(
            Some("Model::mixamorig:Hips"),
            model.prop(1).and_then(Property::as_str)
        );

        let translation = model.child("Lcl Translation").unwrap();
        assert_eq!(Some(2.0), translation.prop(1).and_then(Property::as_f64));
        assert_eq!(None, translation.prop(3));
    }

    #[test]
    fn read_consumes_node_records() {
        let bytes = file(&[
            TestNode::new("A", vec![p_f32_array(&[1.0, 2.0])], Vec::new()),
            TestNode::new("B", Vec::new(), Vec::new()),
        ]);

        let mut reader = Cursor::new(&bytes);
        let fbx = Fbx::read(&mut reader).unwrap();
        assert_eq!(2, fbx.root.children.len());
        assert_eq!(bytes.len() as u64, reader.stream_position().unwrap());
    }

    #[test]
    fn read_wide_header_file() {
        let nodes = [TestNode::new(
            "Objects",
            vec![p_i64(1)],
            vec![TestNode::new(
                "Model",
                vec![
                    p_string(b"mixamorig:Hips\x00\x01Model"),
                    p_f32_array(&[1.0, 2.0]),
                ],
                Vec::new(),
            )],
        )];
        let narrow = Fbx::from_bytes(&file(&nodes)).unwrap();

        // The same tree with 64-bit header words and 25-byte terminators.
        let bytes = file_with_version(&nodes, WIDE_HEADER_VERSION);
        let mut reader = Cursor::new(&bytes);
        let wide = Fbx::read(&mut reader).unwrap();

        assert_eq!(WIDE_HEADER_VERSION, wide.version);
        assert_eq!(narrow.root, wide.root);
        assert_eq!(bytes.len() as u64, reader.stream_position().unwrap());
    }

    #[test]
    fn read_compressed_array() {
        // Stored-block zlib stream holding the i64 values [1, 2].
        let mut property = vec![b'l'];
        property.extend(2u32.to_le_bytes());
        property.extend(1u32.to_le_bytes());
        property.extend(27u32.to_le_bytes());
        property.extend([0x78, 0x01, 0x01, 0x10, 0x00, 0xef, 0xff]);
        property.extend(1i64.to_le_bytes());
        property.extend(2i64.to_le_bytes());
        property.extend([0x00, 0x30, 0x00, 0x04]);

        let bytes = file(&[TestNode::new("KeyTime", vec![property], Vec::new())]);
        let fbx = Fbx::from_bytes(&bytes).unwrap();
        let times = fbx.root.child("KeyTime").unwrap();
        assert_eq!(
            Some(&Property::I64Array(vec![1, 2])),
            times.prop(0)
        );
    }

    #[test]
    fn read_corrupt_compressed_array_fails() {
        let mut property = vec![b'l'];
        property.extend(2u32.to_le_bytes());
        property.extend(1u32.to_le_bytes());
        property.extend(4u32.to_le_bytes());
        property.extend([0xde, 0xad, 0xbe, 0xef]);

        let bytes = file(&[TestNode::new("KeyTime", vec![property], Vec::new())]);
        assert!(Fbx::from_bytes(&bytes).is_err());
    }

    #[test]
    fn read_unknown_property_tag_fails() {
        let bytes = file(&[TestNode::new("A", vec![vec![b'Q', 0, 0]], Vec::new())]);
        assert!(Fbx::from_bytes(&bytes).is_err());
    }

    #[test]
    fn read_truncated_record_fails() {
        let mut bytes = file(&[TestNode::new("A", vec![p_f64(1.0)], Vec::new())]);
        bytes.truncate(bytes.len() - 16);
        assert!(Fbx::from_bytes(&bytes).is_err());
    }

    #[test]
    fn child_where_matches_properties() {
        let bytes = file(&[TestNode::new(
            "Properties70",
            Vec::new(),
            vec![
                TestNode::new("P", vec![p_string(b"Lcl Rotation"), p_f64(1.0)], Vec::new()),
                TestNode::new("P", vec![p_string(b"PreRotation"), p_f64(2.0)], Vec::new()),
            ],
        )]);

        let fbx = Fbx::from_bytes(&bytes).unwrap();
        let properties = fbx.root.child("Properties70").unwrap();
        let pre_rotation = properties
            .child_where("P", &[(0, Property::String("PreRotation".to_string()))])
            .unwrap();
        assert_eq!(Some(2.0), pre_rotation.prop(1).and_then(Property::as_f64));
        assert_eq!(
            None,
            properties.child_where("P", &[(0, Property::String("PostRotation".to_string()))])
        );
    }

    #[test]
    fn unqualified_string_unchanged() {
        let bytes = file(&[TestNode::new("A", vec![p_string(b"OO")], Vec::new())]);
        let fbx = Fbx::from_bytes(&bytes).unwrap();
        assert_eq!(
            Some("OO"),
            fbx.root.child("A").unwrap().prop(0).and_then(Property::as_str)
        );
    }

    #[test]
    fn typed_accessors_permit_empty_arrays() {
        let empty = Property::F64Array(Vec::new());
        assert_eq!(Some(&[] as &[i64]), empty.as_i64_array());
        assert_eq!(Some(&[] as &[f32]), empty.as_f32_array());

        let filled = Property::F64Array(vec![1.0]);
        assert_eq!(None, filled.as_i64_array());
        assert_eq!(Some(&[1.0] as &[f64]), filled.as_f64_array());
    }
}
