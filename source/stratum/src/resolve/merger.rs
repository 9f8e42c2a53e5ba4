use std::collections::HashMap;

use stratum_model::{Element, StringPool, Tag, ValueKind};

use crate::api::RequestLog;
use crate::error::ResolveError;

/// Virtual-type view of an element as the override algebra sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VirtualNode {
    Undefined,
    Literal,
    Map,
    Sequence,
    Ref,
}

fn virtual_node(element: &Element) -> VirtualNode {
    match element.tag() {
        Tag::Ref => VirtualNode::Ref,
        Tag::Sref | Tag::Format => VirtualNode::Literal,
        _ => match element.kind() {
            ValueKind::Undefined => VirtualNode::Undefined,
            ValueKind::Map => VirtualNode::Map,
            ValueKind::Sequence => VirtualNode::Sequence,
            _ => VirtualNode::Literal,
        },
    }
}

/// Recursion cap for the tag expansion, bounding per-request work against
/// pathological self-references the DAG check can't see.
const MAX_TAG_DEPTH: u32 = 100;

/// Folds the raw configs of one document and expands its virtual tags.
/// Cross-document `!ref` targets come from the already-resolved documents of
/// the same request.
pub struct ElementMerger<'a> {
    pool: &'a StringPool,
    elements_by_document: &'a HashMap<String, Element>,
    log: &'a RequestLog,
}

impl<'a> ElementMerger<'a> {
    pub fn new(
        pool: &'a StringPool,
        elements_by_document: &'a HashMap<String, Element>,
        log: &'a RequestLog,
    ) -> ElementMerger<'a> {
        ElementMerger {
            pool,
            elements_by_document,
            log,
        }
    }

    /// Left-to-right fold in override order, then the bottom-up tag pass.
    pub fn merge(
        &self,
        contributors: impl IntoIterator<Item = Element>,
    ) -> Result<Element, ResolveError> {
        let mut root = Element::undefined();
        let mut empty = true;
        for element in contributors {
            if empty {
                root = element;
                empty = false;
            } else {
                root = self.override_with(&root, &element);
            }
        }
        if empty {
            return Ok(root);
        }
        if !root.is_undefined() {
            let expanded = self.apply_tags(root.clone(), &root, 0)?;
            root = expanded;
        }
        if root.tag() == Tag::Delete {
            self.log
                .warn("removing an unused deletion node", root.origin());
            root = Element::undefined().set_origin_of(&root);
        }
        root.freeze();
        Ok(root)
    }

    /// Layer `b` over `a` per the override algebra.
    pub fn override_with(&self, a: &Element, b: &Element) -> Element {
        if b.is_override() {
            self.log.debug(
                format!("overriding {} with {}", a.repr(), b.repr()),
                b.origin(),
            );
            return b.clone_without_virtual();
        }

        let a_is_ref = a.tag() == Tag::Ref;
        if a_is_ref || b.tag() == Tag::Ref {
            let referenced = self.apply_tag_ref(if a_is_ref { a } else { b });
            return if a_is_ref {
                self.override_with(&referenced, b)
            } else {
                self.override_with(a, &referenced)
            };
        }

        match virtual_node(b) {
            VirtualNode::Literal => {
                if virtual_node(a) != VirtualNode::Literal {
                    return self.without_override_warning(a, b);
                }
                self.log.debug(
                    format!("overriding {} with {}", a.repr(), b.repr()),
                    b.origin(),
                );
                b.clone()
            }

            VirtualNode::Map => {
                if !a.is_map() {
                    return self.without_override_warning(a, b);
                }
                self.log.debug(
                    format!("merging {} with {}", a.repr(), b.repr()),
                    b.origin(),
                );

                let mut result = a.clone();
                let map_b = b.as_map().expect("virtual node checked");
                {
                    let map_a = result.as_map_mut().expect("kind checked");
                    map_a.reserve(map_b.len());
                    for (key, value) in map_b {
                        match map_a.get(key) {
                            None => {
                                if value.tag() == Tag::Delete {
                                    self.log.warn(
                                        format!("trying to remove the non-existent key '{key}'"),
                                        value.origin(),
                                    );
                                } else {
                                    map_a.insert(key.clone(), value.clone());
                                }
                            }
                            Some(_) if value.tag() == Tag::Delete => {
                                map_a.remove(key);
                            }
                            Some(current) if current.tag() == Tag::Delete => {
                                map_a.insert(key.clone(), value.clone());
                            }
                            Some(current) => {
                                let merged = self.override_with(current, value);
                                map_a.insert(key.clone(), merged);
                            }
                        }
                    }
                }
                result
            }

            VirtualNode::Sequence => {
                if !a.is_sequence() {
                    return self.without_override_warning(a, b);
                }
                self.log.debug(
                    format!("appending {} to {}", b.repr(), a.repr()),
                    b.origin(),
                );

                let mut result = a.clone();
                let seq_b = b.as_sequence().expect("virtual node checked");
                {
                    let seq_a = result.as_sequence_mut().expect("kind checked");
                    seq_a.extend(seq_b.iter().cloned());
                }
                result
            }

            VirtualNode::Ref => unreachable!("refs are resolved before dispatch"),

            VirtualNode::Undefined => {
                self.log.error(
                    format!("can't override {} with {}", a.repr(), b.repr()),
                    b.origin(),
                );
                Element::undefined().set_origin_of(a)
            }
        }
    }

    fn without_override_warning(&self, a: &Element, b: &Element) -> Element {
        self.log.warn(
            format!(
                "can't override {} with {} without the '!override' tag",
                a.repr(),
                b.repr()
            ),
            b.origin(),
        );
        a.clone()
    }

    /// Bottom-up rewrite of virtual-tag nodes: leftover deletion markers go
    /// away with a warning, `!sref`/`!ref`/`!format` are replaced by their
    /// targets.
    pub fn apply_tags(
        &self,
        element: Element,
        root: &Element,
        depth: u32,
    ) -> Result<Element, ResolveError> {
        if depth >= MAX_TAG_DEPTH {
            self.log.error(
                "aborting the tag expansion, it is likely that a cycle exists",
                element.origin(),
            );
            return Err(ResolveError::DepthLimit);
        }

        let mut element = element;
        match element.kind() {
            ValueKind::Map => {
                let entries: Vec<_> = element
                    .as_map()
                    .expect("kind checked")
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let map = element.as_map_mut().expect("kind checked");
                for (key, value) in entries {
                    if value.tag() == Tag::Delete {
                        self.log
                            .warn("removing an unused deletion node", value.origin());
                        map.remove(&key);
                    } else {
                        let rewritten = self.apply_tags(value, root, depth + 1)?;
                        map.insert(key, rewritten);
                    }
                }
            }
            ValueKind::Sequence => {
                let items: Vec<_> = element
                    .as_sequence()
                    .expect("kind checked")
                    .to_vec();
                let seq = element.as_sequence_mut().expect("kind checked");
                seq.clear();
                for item in items {
                    if item.tag() == Tag::Delete {
                        self.log.warn(
                            "a deletion node doesn't make sense inside a sequence, removing it",
                            item.origin(),
                        );
                    } else {
                        seq.push(self.apply_tags(item, root, depth + 1)?);
                    }
                }
            }
            _ => {}
        }

        match element.tag() {
            Tag::Sref => self.apply_tag_sref(&element, root, depth),
            Tag::Ref => Ok(self.apply_tag_ref(&element)),
            Tag::Format => self.apply_tag_format(&element, root, depth),
            _ => Ok(element),
        }
    }

    /// `!ref [doc, path...]`: walk from another document's resolved root.
    fn apply_tag_ref(&self, element: &Element) -> Element {
        let Some(path) = element.as_sequence() else {
            self.log
                .error("the '!ref' node must hold a path", element.origin());
            return Element::undefined().set_origin_of(element);
        };
        let Some(document) = path.first().and_then(|e| e.as_str()) else {
            self.log.error(
                "the first '!ref' path element must be a string",
                element.origin(),
            );
            return Element::undefined().set_origin_of(element);
        };
        let document = document.to_string_lossy();
        let Some(mut target) = self.elements_by_document.get(&document).cloned() else {
            self.log.error(
                format!("can't ref to the document '{document}'"),
                element.origin(),
            );
            return Element::undefined().set_origin_of(element);
        };
        for step in &path[1..] {
            match step.as_str() {
                Some(key) => target = target.get_by_sym(&key),
                None => {
                    self.log.error(
                        "all the '!ref' path elements must be strings",
                        element.origin(),
                    );
                    return Element::undefined().set_origin_of(element);
                }
            }
        }
        self.log.debug(
            format!("applied ref to '{document}': {}", target.repr()),
            element.origin(),
        );
        target
    }

    /// `!sref [path...]`: walk from the root of the currently-resolving
    /// document; the target must expand to a scalar.
    fn apply_tag_sref(
        &self,
        element: &Element,
        root: &Element,
        depth: u32,
    ) -> Result<Element, ResolveError> {
        let Some(path) = element.as_sequence() else {
            self.log
                .error("the '!sref' node must hold a path", element.origin());
            return Ok(Element::undefined().set_origin_of(element));
        };
        let mut target = root.clone();
        for step in path {
            match step.as_str() {
                Some(key) => target = target.get_by_sym(&key),
                None => {
                    self.log.error(
                        "all the '!sref' path elements must be strings",
                        element.origin(),
                    );
                    return Ok(Element::undefined().set_origin_of(element));
                }
            }
        }
        let expanded = self.apply_tags(target, root, depth + 1)?;
        if !expanded.is_scalar() {
            self.log.error(
                "the element referenced by '!sref' must be a scalar",
                element.origin(),
            );
            return Ok(Element::undefined().set_origin_of(element));
        }
        Ok(expanded.set_origin_of(element))
    }

    /// `!format [parts...]`: concatenate the string form of every
    /// (tag-expanded) part into one interned string.
    fn apply_tag_format(
        &self,
        element: &Element,
        root: &Element,
        depth: u32,
    ) -> Result<Element, ResolveError> {
        let Some(parts) = element.as_sequence() else {
            self.log
                .error("the '!format' node must hold a sequence", element.origin());
            return Ok(Element::undefined().set_origin_of(element));
        };
        let mut out = String::new();
        for part in parts {
            let expanded = self.apply_tags(part.clone(), root, depth + 1)?;
            match expanded.as_scalar_string() {
                Some(s) => out.push_str(&s),
                None => {
                    self.log.error(
                        "the '!format' tag references must be scalars",
                        element.origin(),
                    );
                    return Ok(Element::undefined().set_origin_of(element));
                }
            }
        }
        self.log
            .debug(format!("formatted string '{out}'"), element.origin());
        Ok(Element::str(self.pool.intern_str(&out)).set_origin_of(element))
    }
}
