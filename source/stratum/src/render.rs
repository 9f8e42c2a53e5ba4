use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use stratum_model::{Element, ValueKind};

use crate::error::ResolveError;

/// Serde view of an element tree, for handing resolved configs to the
/// template engine.
pub struct ElementSer<'a>(pub &'a Element);

impl Serialize for ElementSer<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0.kind() {
            ValueKind::Undefined | ValueKind::Null => serializer.serialize_unit(),
            ValueKind::Str | ValueKind::Bin => {
                serializer.serialize_str(&self.0.as_scalar_string().unwrap_or_default())
            }
            ValueKind::Int => serializer.serialize_i64(self.0.as_int().unwrap_or_default()),
            ValueKind::Double => serializer.serialize_f64(self.0.as_double().unwrap_or_default()),
            ValueKind::Bool => serializer.serialize_bool(self.0.as_bool().unwrap_or_default()),
            ValueKind::Map => {
                let map = self.0.as_map().expect("kind checked");
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    out.serialize_entry(&key.to_string_lossy(), &ElementSer(value))?;
                }
                out.end()
            }
            ValueKind::Sequence => {
                let seq = self.0.as_sequence().expect("kind checked");
                let mut out = serializer.serialize_seq(Some(seq.len()))?;
                for value in seq {
                    out.serialize_element(&ElementSer(value))?;
                }
                out.end()
            }
        }
    }
}

/// Render a `_tmpl.` document over a resolved element. Includes are
/// unavailable on purpose: the environment has no loader, so a template
/// can only see its own source and the context.
pub fn render_template(source: &str, context: &Element) -> Result<String, ResolveError> {
    let mut env = minijinja::Environment::new();
    env.add_template("config", source)
        .map_err(|err| ResolveError::Build {
            reason: format!("can't compile the template: {err}"),
        })?;
    let template = env.get_template("config").expect("just added");
    template
        .render(minijinja::value::Value::from_serialize(ElementSer(context)))
        .map_err(|err| ResolveError::Build {
            reason: format!("can't render the template: {err}"),
        })
}
