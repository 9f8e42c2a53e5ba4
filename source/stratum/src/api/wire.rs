//! Wire form of a resolved element: a prefix-ordered stream of nodes, each
//! carrying its value type, optional key, optional position and the distance
//! to its next same-level sibling, so a client can decode the tree linearly
//! without recursion. The payload ends with the source table addressed by
//! the position blocks.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use stratum_model::{Element, Map, Origin, StringPool, ValueKind};

use super::SourceInfo;

const WIRE_MAGIC: u8 = 0x01;

const VT_UNDEFINED: u8 = 0;
const VT_NONE: u8 = 1;
const VT_STR: u8 = 2;
const VT_BIN: u8 = 3;
const VT_INT: u8 = 4;
const VT_DOUBLE: u8 = 5;
const VT_BOOL: u8 = 6;
const VT_MAP: u8 = 7;
const VT_SEQUENCE: u8 = 8;

const FLAG_KEY: u8 = 0b01;
const FLAG_POSITION: u8 = 0b10;

#[derive(Debug, Default, Clone)]
struct Node {
    value_type: u8,
    key: Option<Vec<u8>>,
    position: Option<(u32, u16, u16)>,
    sibling_offset: u32,
    size: u32,
    scalar: Scalar,
}

#[derive(Debug, Default, Clone)]
enum Scalar {
    #[default]
    None,
    Bytes(Vec<u8>),
    Int(i64),
    Double(f64),
    Bool(bool),
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("the payload is truncated")]
    Truncated,
    #[error("unknown wire marker {0}")]
    BadMagic(u8),
    #[error("unknown value type {0}")]
    BadValueType(u8),
}

/// Maps each distinct `(document_id, raw_config_id)` origin to its index in
/// the emitted source table.
struct SourceTable<'a> {
    lookup: &'a HashMap<(u16, u32), SourceInfo>,
    ids: HashMap<(u16, u32), u32>,
    sources: Vec<SourceInfo>,
}

impl<'a> SourceTable<'a> {
    fn source_id(&mut self, origin: Origin) -> Option<u32> {
        if !origin.is_some() {
            return None;
        }
        let key = (origin.document_id, origin.raw_config_id);
        if let Some(id) = self.ids.get(&key) {
            return Some(*id);
        }
        let info = self.lookup.get(&key)?.clone();
        let id = self.sources.len() as u32;
        self.sources.push(info);
        self.ids.insert(key, id);
        Some(id)
    }
}

pub struct EncodedElement {
    pub payload: Bytes,
    pub sources: Vec<SourceInfo>,
}

pub fn encode(
    element: &Element,
    with_position: bool,
    source_lookup: &HashMap<(u16, u32), SourceInfo>,
) -> EncodedElement {
    let mut nodes = Vec::new();
    let mut table = SourceTable {
        lookup: source_lookup,
        ids: HashMap::new(),
        sources: Vec::new(),
    };
    fill(element, &mut nodes, with_position, &mut table);

    let mut buf = BytesMut::new();
    buf.put_u8(WIRE_MAGIC);
    buf.put_u32_le(nodes.len() as u32);
    for node in &nodes {
        let mut flags = 0u8;
        if node.key.is_some() {
            flags |= FLAG_KEY;
        }
        if node.position.is_some() {
            flags |= FLAG_POSITION;
        }
        buf.put_u8(node.value_type);
        buf.put_u8(flags);
        if let Some(key) = &node.key {
            buf.put_u32_le(key.len() as u32);
            buf.put_slice(key);
        }
        if let Some((source_id, line, col)) = node.position {
            buf.put_u32_le(source_id);
            buf.put_u16_le(line);
            buf.put_u16_le(col);
        }
        buf.put_u32_le(node.sibling_offset);
        match node.value_type {
            VT_MAP | VT_SEQUENCE => buf.put_u32_le(node.size),
            _ => {}
        }
        match &node.scalar {
            Scalar::None => {}
            Scalar::Bytes(bytes) => {
                buf.put_u32_le(bytes.len() as u32);
                buf.put_slice(bytes);
            }
            Scalar::Int(v) => buf.put_i64_le(*v),
            Scalar::Double(v) => buf.put_u64_le(v.to_bits()),
            Scalar::Bool(v) => buf.put_u8(*v as u8),
        }
    }
    buf.put_u32_le(table.sources.len() as u32);
    for source in &table.sources {
        buf.put_u16_le(source.document_id);
        buf.put_u32_le(source.raw_config_id);
        buf.put_u32_le(source.checksum);
        buf.put_u32_le(source.path.len() as u32);
        buf.put_slice(source.path.as_bytes());
    }

    EncodedElement {
        payload: buf.freeze(),
        sources: table.sources,
    }
}

/// Returns the subtree node count; every child's `sibling_offset` is the
/// size of its own subtree minus one, and the last child at each level
/// carries zero.
fn fill(
    element: &Element,
    nodes: &mut Vec<Node>,
    with_position: bool,
    table: &mut SourceTable<'_>,
) -> u32 {
    let my_idx = nodes.len();
    nodes.push(Node::default());

    let position = if with_position {
        let origin = element.origin();
        table
            .source_id(origin)
            .map(|id| (id, origin.line, origin.col))
    } else {
        None
    };

    let mut node = Node {
        position,
        ..Node::default()
    };
    let mut count = 1u32;

    match element.kind() {
        ValueKind::Undefined => node.value_type = VT_UNDEFINED,
        ValueKind::Null => node.value_type = VT_NONE,
        ValueKind::Str => {
            node.value_type = VT_STR;
            node.scalar = Scalar::Bytes(element.as_str().map(|s| s.to_vec()).unwrap_or_default());
        }
        ValueKind::Bin => {
            node.value_type = VT_BIN;
            node.scalar = Scalar::Bytes(element.as_bin().map(|s| s.to_vec()).unwrap_or_default());
        }
        ValueKind::Int => {
            node.value_type = VT_INT;
            node.scalar = Scalar::Int(element.as_int().unwrap_or_default());
        }
        ValueKind::Double => {
            node.value_type = VT_DOUBLE;
            node.scalar = Scalar::Double(element.as_double().unwrap_or_default());
        }
        ValueKind::Bool => {
            node.value_type = VT_BOOL;
            node.scalar = Scalar::Bool(element.as_bool().unwrap_or_default());
        }
        ValueKind::Map => {
            node.value_type = VT_MAP;
            let map = element.as_map().expect("kind checked");
            node.size = map.len() as u32;
            let mut last_child = None;
            for (key, value) in map {
                let child_idx = nodes.len();
                let sub = fill(value, nodes, with_position, table);
                nodes[child_idx].key = Some(key.to_vec());
                nodes[child_idx].sibling_offset = sub - 1;
                last_child = Some(child_idx);
                count += sub;
            }
            if let Some(last) = last_child {
                nodes[last].sibling_offset = 0;
            }
        }
        ValueKind::Sequence => {
            node.value_type = VT_SEQUENCE;
            let seq = element.as_sequence().expect("kind checked");
            node.size = seq.len() as u32;
            let mut last_child = None;
            for value in seq {
                let child_idx = nodes.len();
                let sub = fill(value, nodes, with_position, table);
                nodes[child_idx].sibling_offset = sub - 1;
                last_child = Some(child_idx);
                count += sub;
            }
            if let Some(last) = last_child {
                nodes[last].sibling_offset = 0;
            }
        }
    }

    nodes[my_idx] = node;
    count
}

pub struct DecodedElement {
    pub element: Element,
    pub sources: Vec<SourceInfo>,
}

pub fn decode(pool: &StringPool, payload: &Bytes) -> Result<DecodedElement, WireError> {
    let mut buf = payload.clone();
    if buf.remaining() < 5 {
        return Err(WireError::Truncated);
    }
    let magic = buf.get_u8();
    if magic != WIRE_MAGIC {
        return Err(WireError::BadMagic(magic));
    }
    let node_count = buf.get_u32_le() as usize;
    let mut nodes = Vec::with_capacity(node_count);
    for _ in 0..node_count {
        nodes.push(read_node(&mut buf)?);
    }
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    let source_count = buf.get_u32_le() as usize;
    let mut sources = Vec::with_capacity(source_count);
    for _ in 0..source_count {
        if buf.remaining() < 14 {
            return Err(WireError::Truncated);
        }
        let document_id = buf.get_u16_le();
        let raw_config_id = buf.get_u32_le();
        let checksum = buf.get_u32_le();
        let path = String::from_utf8_lossy(&read_bytes(&mut buf)?).into_owned();
        sources.push(SourceInfo {
            document_id,
            raw_config_id,
            checksum,
            path,
        });
    }

    let mut cursor = 0usize;
    let element = build_element(pool, &nodes, &sources, &mut cursor)?;
    Ok(DecodedElement { element, sources })
}

fn read_bytes(buf: &mut Bytes) -> Result<Vec<u8>, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn read_node(buf: &mut Bytes) -> Result<Node, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Truncated);
    }
    let value_type = buf.get_u8();
    let flags = buf.get_u8();
    let key = if flags & FLAG_KEY != 0 {
        Some(read_bytes(buf)?)
    } else {
        None
    };
    let position = if flags & FLAG_POSITION != 0 {
        if buf.remaining() < 8 {
            return Err(WireError::Truncated);
        }
        Some((buf.get_u32_le(), buf.get_u16_le(), buf.get_u16_le()))
    } else {
        None
    };
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    let sibling_offset = buf.get_u32_le();
    let mut node = Node {
        value_type,
        key,
        position,
        sibling_offset,
        ..Node::default()
    };
    match value_type {
        VT_UNDEFINED | VT_NONE => {}
        VT_STR | VT_BIN => node.scalar = Scalar::Bytes(read_bytes(buf)?),
        VT_INT => {
            if buf.remaining() < 8 {
                return Err(WireError::Truncated);
            }
            node.scalar = Scalar::Int(buf.get_i64_le());
        }
        VT_DOUBLE => {
            if buf.remaining() < 8 {
                return Err(WireError::Truncated);
            }
            node.scalar = Scalar::Double(f64::from_bits(buf.get_u64_le()));
        }
        VT_BOOL => {
            if buf.remaining() < 1 {
                return Err(WireError::Truncated);
            }
            node.scalar = Scalar::Bool(buf.get_u8() != 0);
        }
        VT_MAP | VT_SEQUENCE => {
            if buf.remaining() < 4 {
                return Err(WireError::Truncated);
            }
            node.size = buf.get_u32_le();
        }
        other => return Err(WireError::BadValueType(other)),
    }
    Ok(node)
}

fn build_element(
    pool: &StringPool,
    nodes: &[Node],
    sources: &[SourceInfo],
    cursor: &mut usize,
) -> Result<Element, WireError> {
    let node = nodes.get(*cursor).ok_or(WireError::Truncated)?;
    *cursor += 1;
    let mut element = match node.value_type {
        VT_UNDEFINED => Element::undefined(),
        VT_NONE => Element::null(),
        VT_STR => match &node.scalar {
            Scalar::Bytes(b) => Element::str(pool.intern(b)),
            _ => Element::undefined(),
        },
        VT_BIN => match &node.scalar {
            Scalar::Bytes(b) => Element::bin(pool.intern(b)),
            _ => Element::undefined(),
        },
        VT_INT => match node.scalar {
            Scalar::Int(v) => Element::int(v),
            _ => Element::undefined(),
        },
        VT_DOUBLE => match node.scalar {
            Scalar::Double(v) => Element::double(v),
            _ => Element::undefined(),
        },
        VT_BOOL => match node.scalar {
            Scalar::Bool(v) => Element::bool(v),
            _ => Element::undefined(),
        },
        VT_MAP => {
            let mut entries = Map::with_capacity(node.size as usize);
            for _ in 0..node.size {
                let key = nodes
                    .get(*cursor)
                    .and_then(|n| n.key.clone())
                    .ok_or(WireError::Truncated)?;
                let child = build_element(pool, nodes, sources, cursor)?;
                entries.insert(pool.intern(&key), child);
            }
            Element::map(entries)
        }
        VT_SEQUENCE => {
            let mut items = Vec::with_capacity(node.size as usize);
            for _ in 0..node.size {
                items.push(build_element(pool, nodes, sources, cursor)?);
            }
            Element::sequence(items)
        }
        other => return Err(WireError::BadValueType(other)),
    };
    if let Some((source_id, line, col)) = node.position {
        if let Some(source) = sources.get(source_id as usize) {
            element = element.with_origin(Origin {
                document_id: source.document_id,
                raw_config_id: source.raw_config_id,
                line,
                col,
            });
        }
    }
    Ok(element)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_model::Tag;

    fn sample(pool: &StringPool) -> Element {
        let mut inner = Map::new();
        inner.insert(pool.intern_str("host"), Element::str(pool.intern_str("a")));
        inner.insert(pool.intern_str("port"), Element::int(5432));
        let mut root = Map::new();
        root.insert(pool.intern_str("db"), Element::map(inner));
        root.insert(
            pool.intern_str("replicas"),
            Element::sequence(vec![
                Element::str(pool.intern_str("r1")),
                Element::str(pool.intern_str("r2")),
            ]),
        );
        root.insert(pool.intern_str("ratio"), Element::double(0.25));
        root.insert(pool.intern_str("off"), Element::bool(false));
        root.insert(pool.intern_str("nothing"), Element::null());
        Element::map(root)
    }

    #[test]
    fn round_trip_preserves_the_checksum() {
        let pool = StringPool::new();
        let element = sample(&pool);
        let encoded = encode(&element, false, &HashMap::new());
        let decoded = decode(&pool, &encoded.payload).unwrap();
        assert_eq!(decoded.element.checksum(), element.checksum());
        assert_eq!(decoded.element, element);
    }

    #[test]
    fn positions_are_present_exactly_when_requested() {
        let pool = StringPool::new();
        let origin = Origin {
            document_id: 1,
            raw_config_id: 7,
            line: 3,
            col: 2,
        };
        let element = Element::map(Map::from_iter([(
            pool.intern_str("k"),
            Element::int(1).with_origin(origin),
        )]))
        .with_origin(origin);
        let mut lookup = HashMap::new();
        lookup.insert(
            (1u16, 7u32),
            SourceInfo {
                document_id: 1,
                raw_config_id: 7,
                checksum: 0xdead_beef,
                path: "db.yaml".to_string(),
            },
        );

        let with = encode(&element, true, &lookup);
        assert_eq!(with.sources.len(), 1);
        let decoded = decode(&pool, &with.payload).unwrap();
        assert_eq!(decoded.sources.len(), 1);
        assert_eq!(decoded.element.origin().raw_config_id, 7);
        assert_eq!(decoded.element.origin().line, 3);

        let without = encode(&element, false, &lookup);
        assert!(without.sources.is_empty());
        let decoded = decode(&pool, &without.payload).unwrap();
        assert!(!decoded.element.origin().is_some());
    }

    #[test]
    fn tags_never_reach_the_wire() {
        // Virtual tags are resolved before a payload is emitted; the encoder
        // writes the value form only.
        let pool = StringPool::new();
        let element = Element::sequence(vec![Element::int(1)]).with_tag(Tag::Override);
        let encoded = encode(&element, false, &HashMap::new());
        let decoded = decode(&pool, &encoded.payload).unwrap();
        assert_eq!(decoded.element.tag(), Tag::Plain);
        assert_eq!(decoded.element.as_sequence().unwrap().len(), 1);
    }

    #[test]
    fn truncated_payloads_error() {
        let pool = StringPool::new();
        let element = sample(&pool);
        let encoded = encode(&element, false, &HashMap::new());
        let cut = encoded.payload.slice(0..encoded.payload.len() / 2);
        assert!(decode(&pool, &cut).is_err());
    }
}
