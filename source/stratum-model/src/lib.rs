//! Data model for the stratum configuration service: interned strings,
//! copy-on-write element trees, label sets, and the YAML element builder.

pub mod element;
pub mod labels;
pub mod pool;
pub mod yaml;

pub use element::{Element, Map, Origin, Seq, Tag, ValueKind};
pub use labels::{Label, Labels};
pub use pool::{StringPool, Sym};
