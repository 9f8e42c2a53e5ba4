use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use derive_more::Deref;

pub type Label = (String, String);

/// An immutable, sorted set of `(key, value)` pairs.
///
/// The ordering is fixed at construction so equality is element-wise and the
/// hash can be precomputed once. Containment is an ordered linear merge.
#[derive(Clone, Debug, Deref)]
pub struct Labels {
    #[deref]
    items: Vec<Label>,
    hash: u64,
}

impl Default for Labels {
    fn default() -> Self {
        Labels::new(Vec::new())
    }
}

impl Labels {
    pub fn empty() -> Labels {
        Labels::default()
    }

    /// Keys need not be unique here; request validation rejects duplicates
    /// before a `Labels` is built from client input.
    pub fn new(mut items: Vec<Label>) -> Labels {
        items.sort();
        let mut hasher = DefaultHasher::new();
        for (k, v) in &items {
            k.hash(&mut hasher);
            v.hash(&mut hasher);
        }
        Labels {
            hash: hasher.finish(),
            items,
        }
    }

    /// True iff every member of `subset` appears in `self`.
    pub fn contains(&self, subset: &Labels) -> bool {
        let mut it = self.items.iter();
        'outer: for label in &subset.items {
            for candidate in it.by_ref() {
                if candidate == label {
                    continue 'outer;
                }
                if candidate > label {
                    return false;
                }
            }
            return false;
        }
        true
    }

    pub fn has_unique_keys(&self) -> bool {
        self.items.windows(2).all(|w| w[0].0 != w[1].0)
    }

    pub fn repr(&self) -> String {
        let pairs: Vec<String> = self
            .items
            .iter()
            .map(|(k, v)| format!("{k}/{v}"))
            .collect();
        format!("[{}]", pairs.join(","))
    }
}

impl PartialEq for Labels {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.items == other.items
    }
}

impl Eq for Labels {}

impl Hash for Labels {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl FromIterator<Label> for Labels {
    fn from_iter<T: IntoIterator<Item = Label>>(iter: T) -> Self {
        Labels::new(iter.into_iter().collect())
    }
}

#[macro_export]
macro_rules! labels {
    () => { $crate::labels::Labels::empty() };
    ($($k:expr => $v:expr),+ $(,)?) => {
        $crate::labels::Labels::new(vec![
            $(($k.to_string(), $v.to_string())),+
        ])
    };
}
