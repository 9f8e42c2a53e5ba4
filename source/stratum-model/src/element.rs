use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::pool::Sym;

pub type Map = HashMap<Sym, Element>;
pub type Seq = Vec<Element>;

/// Where an element came from, for diagnostics and the wire position block.
/// `document_id == u16::MAX` means "no origin".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Origin {
    pub document_id: u16,
    pub raw_config_id: u32,
    pub line: u16,
    pub col: u16,
}

impl Origin {
    pub const NONE: Origin = Origin {
        document_id: u16::MAX,
        raw_config_id: u32::MAX,
        line: 0,
        col: 0,
    };

    pub fn new(document_id: u16, raw_config_id: u32) -> Origin {
        Origin {
            document_id,
            raw_config_id,
            line: 0,
            col: 0,
        }
    }

    pub fn is_some(&self) -> bool {
        self.document_id != u16::MAX && self.raw_config_id != u32::MAX
    }
}

impl Default for Origin {
    fn default() -> Self {
        Origin::NONE
    }
}

/// Virtual tag altering the merge semantics of the node it annotates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    Plain,
    Override,
    Ref,
    Sref,
    Format,
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Undefined,
    Null,
    Str,
    Bin,
    Int,
    Double,
    Bool,
    Map,
    Sequence,
}

impl ValueKind {
    pub fn name(&self) -> &'static str {
        match self {
            ValueKind::Undefined => "undefined",
            ValueKind::Null => "null",
            ValueKind::Str => "str",
            ValueKind::Bin => "bin",
            ValueKind::Int => "int",
            ValueKind::Double => "double",
            ValueKind::Bool => "bool",
            ValueKind::Map => "map",
            ValueKind::Sequence => "sequence",
        }
    }
}

#[derive(Debug)]
pub struct MapPayload {
    entries: Map,
    checksum: OnceLock<[u8; 32]>,
}

impl Clone for MapPayload {
    fn clone(&self) -> Self {
        MapPayload {
            entries: self.entries.clone(),
            checksum: OnceLock::new(),
        }
    }
}

#[derive(Debug)]
pub struct SeqPayload {
    items: Seq,
    checksum: OnceLock<[u8; 32]>,
}

impl Clone for SeqPayload {
    fn clone(&self) -> Self {
        SeqPayload {
            items: self.items.clone(),
            checksum: OnceLock::new(),
        }
    }
}

#[derive(Clone, Debug)]
enum Data {
    Empty,
    Null,
    Str(Sym),
    Bin(Sym),
    Int(i64),
    Double(f64),
    Bool(bool),
    Map(Arc<MapPayload>),
    Seq(Arc<SeqPayload>),
}

/// One node of a configuration tree.
///
/// Containers are shared: cloning bumps a refcount, mutation through the
/// `_mut` accessors clones the payload first when it is shared. Scalars are
/// copied inline.
#[derive(Clone, Debug)]
pub struct Element {
    data: Data,
    tag: Tag,
    origin: Origin,
}

impl Default for Element {
    fn default() -> Self {
        Element {
            data: Data::Empty,
            tag: Tag::Plain,
            origin: Origin::NONE,
        }
    }
}

impl Element {
    pub fn undefined() -> Element {
        Element::default()
    }

    pub fn null() -> Element {
        Element {
            data: Data::Null,
            ..Element::default()
        }
    }

    pub fn str(value: Sym) -> Element {
        Element {
            data: Data::Str(value),
            ..Element::default()
        }
    }

    pub fn bin(value: Sym) -> Element {
        Element {
            data: Data::Bin(value),
            ..Element::default()
        }
    }

    pub fn int(value: i64) -> Element {
        Element {
            data: Data::Int(value),
            ..Element::default()
        }
    }

    pub fn double(value: f64) -> Element {
        Element {
            data: Data::Double(value),
            ..Element::default()
        }
    }

    pub fn bool(value: bool) -> Element {
        Element {
            data: Data::Bool(value),
            ..Element::default()
        }
    }

    pub fn map(entries: Map) -> Element {
        Element {
            data: Data::Map(Arc::new(MapPayload {
                entries,
                checksum: OnceLock::new(),
            })),
            ..Element::default()
        }
    }

    pub fn sequence(items: Seq) -> Element {
        Element {
            data: Data::Seq(Arc::new(SeqPayload {
                items,
                checksum: OnceLock::new(),
            })),
            ..Element::default()
        }
    }

    pub fn delete_marker() -> Element {
        Element::null().with_tag(Tag::Delete)
    }

    pub fn with_tag(mut self, tag: Tag) -> Element {
        self.tag = tag;
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Element {
        self.origin = origin;
        self
    }

    pub fn set_origin_of(mut self, other: &Element) -> Element {
        self.origin = other.origin;
        self
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn kind(&self) -> ValueKind {
        match &self.data {
            Data::Empty => ValueKind::Undefined,
            Data::Null => ValueKind::Null,
            Data::Str(_) => ValueKind::Str,
            Data::Bin(_) => ValueKind::Bin,
            Data::Int(_) => ValueKind::Int,
            Data::Double(_) => ValueKind::Double,
            Data::Bool(_) => ValueKind::Bool,
            Data::Map(_) => ValueKind::Map,
            Data::Seq(_) => ValueKind::Sequence,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.data, Data::Empty)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.data, Data::Null)
    }

    pub fn is_map(&self) -> bool {
        matches!(self.data, Data::Map(_))
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self.data, Data::Seq(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self.data, Data::Str(_))
    }

    pub fn is_scalar(&self) -> bool {
        matches!(
            self.data,
            Data::Null | Data::Str(_) | Data::Bin(_) | Data::Int(_) | Data::Double(_) | Data::Bool(_)
        )
    }

    pub fn is_override(&self) -> bool {
        self.tag == Tag::Override
    }

    pub fn as_map(&self) -> Option<&Map> {
        match &self.data {
            Data::Map(p) => Some(&p.entries),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&Seq> {
        match &self.data {
            Data::Seq(p) => Some(&p.items),
            _ => None,
        }
    }

    /// Clones the payload first when it is shared.
    pub fn as_map_mut(&mut self) -> Option<&mut Map> {
        match &mut self.data {
            Data::Map(p) => {
                let payload = Arc::make_mut(p);
                payload.checksum = OnceLock::new();
                Some(&mut payload.entries)
            }
            _ => None,
        }
    }

    /// Clones the payload first when it is shared.
    pub fn as_sequence_mut(&mut self) -> Option<&mut Seq> {
        match &mut self.data {
            Data::Seq(p) => {
                let payload = Arc::make_mut(p);
                payload.checksum = OnceLock::new();
                Some(&mut payload.items)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<Sym> {
        match &self.data {
            Data::Str(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn as_bin(&self) -> Option<Sym> {
        match &self.data {
            Data::Bin(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.data {
            Data::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self.data {
            Data::Double(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.data {
            Data::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// The string form of a scalar, as used by `!format` concatenation.
    pub fn as_scalar_string(&self) -> Option<String> {
        match &self.data {
            Data::Str(s) | Data::Bin(s) => Some(s.to_string_lossy()),
            Data::Int(v) => Some(v.to_string()),
            Data::Double(v) => Some(v.to_string()),
            Data::Bool(v) => Some(v.to_string()),
            _ => None,
        }
    }

    pub fn has(&self, key: &str) -> bool {
        match &self.data {
            Data::Map(p) => Self::lookup(&p.entries, key).is_some(),
            _ => false,
        }
    }

    /// Child by key; `undefined` when absent or not a map, so walks can
    /// proceed without branching at every step.
    pub fn get(&self, key: &str) -> Element {
        match &self.data {
            Data::Map(p) => Self::lookup(&p.entries, key)
                .cloned()
                .unwrap_or_default(),
            _ => Element::undefined(),
        }
    }

    pub fn get_by_sym(&self, key: &Sym) -> Element {
        match &self.data {
            Data::Map(p) => p.entries.get(key).cloned().unwrap_or_default(),
            _ => Element::undefined(),
        }
    }

    // Interning always prefers the inline encoding, so content that fits it
    // is never pooled and a hashed miss is a real miss.
    fn lookup<'m>(entries: &'m Map, key: &str) -> Option<&'m Element> {
        if let Some(small) = Sym::small(key.as_bytes()) {
            return entries.get(&small);
        }
        entries.iter().find(|(k, _)| **k == *key).map(|(_, v)| v)
    }

    pub fn get_index(&self, index: usize) -> Element {
        if let Data::Seq(p) = &self.data {
            if let Some(v) = p.items.get(index) {
                return v.clone();
            }
        }
        Element::undefined()
    }

    /// Same node without its virtual tag.
    pub fn clone_without_virtual(&self) -> Element {
        let mut out = self.clone();
        out.tag = Tag::Plain;
        out
    }

    /// Seal the tree: fill every container checksum cache bottom-up so later
    /// readers share the cached values instead of racing to compute them.
    pub fn freeze(&self) {
        self.checksum();
        match &self.data {
            Data::Map(p) => {
                for v in p.entries.values() {
                    v.freeze();
                }
            }
            Data::Seq(p) => {
                for v in &p.items {
                    v.freeze();
                }
            }
            _ => {}
        }
    }

    fn tag_byte(&self) -> u8 {
        match self.tag {
            Tag::Plain => 0,
            Tag::Override => 1,
            Tag::Ref => 2,
            Tag::Sref => 3,
            Tag::Format => 4,
            Tag::Delete => 5,
        }
    }

    fn body_checksum(&self) -> [u8; 32] {
        match &self.data {
            Data::Empty | Data::Null => blake3::hash(&[]).into(),
            Data::Str(s) | Data::Bin(s) => s.with_bytes(|b| blake3::hash(b).into()),
            Data::Int(v) => blake3::hash(&v.to_le_bytes()).into(),
            Data::Double(v) => blake3::hash(&v.to_bits().to_le_bytes()).into(),
            Data::Bool(v) => blake3::hash(&[*v as u8]).into(),
            Data::Map(p) => *p.checksum.get_or_init(|| {
                let mut entries: Vec<(Vec<u8>, [u8; 32])> = p
                    .entries
                    .iter()
                    .map(|(k, v)| (k.to_vec(), v.checksum()))
                    .collect();
                entries.sort();
                let mut hasher = blake3::Hasher::new();
                for (key, checksum) in &entries {
                    hasher.update(&(key.len() as u64).to_le_bytes());
                    hasher.update(key);
                    hasher.update(checksum);
                }
                hasher.finalize().into()
            }),
            Data::Seq(p) => *p.checksum.get_or_init(|| {
                let mut hasher = blake3::Hasher::new();
                for item in &p.items {
                    hasher.update(&item.checksum());
                }
                hasher.finalize().into()
            }),
        }
    }

    /// 256-bit checksum over the canonical serialization: maps by sorted
    /// key, sequences in order, scalars by kind and bytes. Equal checksums
    /// mean element-equal trees.
    pub fn checksum(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[self.tag_byte(), self.kind() as u8]);
        hasher.update(&self.body_checksum());
        hasher.finalize().into()
    }

    /// Compact single-line description for log events.
    pub fn repr(&self) -> String {
        match &self.data {
            Data::Empty => "undefined".to_string(),
            Data::Null => "null".to_string(),
            Data::Str(s) => format!("str[{s}]"),
            Data::Bin(s) => format!("bin[{} bytes]", s.len()),
            Data::Int(v) => format!("int[{v}]"),
            Data::Double(v) => format!("double[{v}]"),
            Data::Bool(v) => format!("bool[{v}]"),
            Data::Map(p) => format!("map[{} keys]", p.entries.len()),
            Data::Seq(p) => format!("sequence[{} items]", p.items.len()),
        }
    }
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        if self.tag != other.tag {
            return false;
        }
        match (&self.data, &other.data) {
            (Data::Empty, Data::Empty) | (Data::Null, Data::Null) => true,
            (Data::Str(a), Data::Str(b)) | (Data::Bin(a), Data::Bin(b)) => a == b,
            (Data::Int(a), Data::Int(b)) => a == b,
            (Data::Double(a), Data::Double(b)) => a.to_bits() == b.to_bits(),
            (Data::Bool(a), Data::Bool(b)) => a == b,
            (Data::Map(a), Data::Map(b)) => {
                Arc::ptr_eq(a, b)
                    || (a.entries.len() == b.entries.len()
                        && a.entries
                            .iter()
                            .all(|(k, v)| b.entries.get(k).is_some_and(|bv| bv == v)))
            }
            (Data::Seq(a), Data::Seq(b)) => Arc::ptr_eq(a, b) || a.items == b.items,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::StringPool;

    fn sample_map(pool: &StringPool) -> Element {
        let mut entries = Map::new();
        entries.insert(pool.intern_str("host"), Element::str(pool.intern_str("a")));
        entries.insert(pool.intern_str("port"), Element::int(5432));
        Element::map(entries)
    }

    #[test]
    fn clone_is_shallow_and_mutation_detaches() {
        let pool = StringPool::new();
        let original = sample_map(&pool);
        let mut copy = original.clone();
        copy.as_map_mut()
            .unwrap()
            .insert(pool.intern_str("extra"), Element::bool(true));
        assert!(copy.has("extra"));
        assert!(!original.has("extra"));
        assert_eq!(original.get("port").as_int(), Some(5432));
    }

    #[test]
    fn checksum_is_stable_across_insertion_order() {
        let pool = StringPool::new();
        let mut a = Map::new();
        a.insert(pool.intern_str("x"), Element::int(1));
        a.insert(pool.intern_str("y"), Element::int(2));
        let mut b = Map::new();
        b.insert(pool.intern_str("y"), Element::int(2));
        b.insert(pool.intern_str("x"), Element::int(1));
        assert_eq!(Element::map(a).checksum(), Element::map(b).checksum());
    }

    #[test]
    fn checksum_distinguishes_values_and_kinds() {
        let pool = StringPool::new();
        assert_ne!(Element::int(1).checksum(), Element::int(2).checksum());
        assert_ne!(
            Element::str(pool.intern_str("1")).checksum(),
            Element::int(1).checksum()
        );
        assert_ne!(Element::null().checksum(), Element::undefined().checksum());
    }

    #[test]
    fn get_walks_return_undefined_on_missing() {
        let pool = StringPool::new();
        let root = sample_map(&pool);
        assert!(root.get("absent").is_undefined());
        assert!(root.get("host").get("nested").is_undefined());
        assert_eq!(root.get("host").as_str().unwrap(), "a");
    }

    #[test]
    fn clone_without_virtual_drops_the_tag() {
        let tagged = Element::sequence(vec![Element::int(1)]).with_tag(Tag::Override);
        assert!(tagged.is_override());
        let plain = tagged.clone_without_virtual();
        assert_eq!(plain.tag(), Tag::Plain);
        assert_eq!(plain.as_sequence().unwrap().len(), 1);
    }

    #[test]
    fn equal_elements_have_equal_checksums() {
        let pool = StringPool::new();
        let a = sample_map(&pool);
        let b = sample_map(&pool);
        assert_eq!(a, b);
        assert_eq!(a.checksum(), b.checksum());
    }
}
