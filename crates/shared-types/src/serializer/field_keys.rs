//! Struct-field key renaming.
//!
//! Naming policies and null omission apply to struct fields only. Map keys,
//! enum variant names and string values pass through untouched.
//!
//! Which object keys are struct fields is learned from the target type's own
//! `Deserialize` impl, driven over the JSON tree: a key requested as an
//! identifier is a field, a key requested as a string (or number) is data.
//!
//! Where serde hands over the field list (`deserialize_struct`) names map
//! exactly in both directions. Structs with a `#[serde(flatten)]` member are
//! read through `deserialize_map` without a field list; there a field is only
//! renamed when the wire name maps back to it unambiguously, otherwise it is
//! written as-is.

use std::cell::RefCell;
use std::collections::HashMap;

use serde::de::{self, DeserializeOwned, DeserializeSeed, IntoDeserializer, Visitor};
use serde::forward_to_deserialize_any;
use serde_json::{Map, Value};

use super::NamingPolicy;

type Error = serde_json::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Key(String),
    Index(usize),
}

type Path = Vec<Segment>;

/// Field keys to rewrite, per object path: Rust name -> wire name.
#[derive(Debug, Default)]
pub(super) struct RenamePlan {
    objects: HashMap<Path, HashMap<String, String>>,
}

impl RenamePlan {
    /// Rewrite field keys of `value`, dropping null fields if `omit_nulls`.
    pub(super) fn apply(&self, value: Value, omit_nulls: bool) -> Value {
        let mut path = Vec::new();
        self.rewrite(value, &mut path, omit_nulls)
    }

    fn rewrite(&self, value: Value, path: &mut Path, omit_nulls: bool) -> Value {
        match value {
            Value::Object(map) => {
                let fields = self.objects.get(path.as_slice());
                let mut out = Map::new();
                for (key, inner) in map {
                    let wire = fields.and_then(|fields| fields.get(&key)).cloned();
                    if wire.is_some() && omit_nulls && inner.is_null() {
                        continue;
                    }
                    let wire = wire.unwrap_or_else(|| key.clone());
                    path.push(Segment::Key(key));
                    let inner = self.rewrite(inner, path, omit_nulls);
                    path.pop();
                    out.insert(wire, inner);
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(index, item)| {
                        path.push(Segment::Index(index));
                        let item = self.rewrite(item, path, omit_nulls);
                        path.pop();
                        item
                    })
                    .collect(),
            ),
            other => other,
        }
    }
}

/// Find the struct-field keys of `tree`, an as-is encoding of a `T`.
pub(super) fn plan<T: DeserializeOwned>(tree: &Value, naming: NamingPolicy) -> Result<RenamePlan, Error> {
    let context = Context {
        naming,
        plan: Some(RefCell::new(RenamePlan::default())),
    };
    T::deserialize(Node::root(tree, &context))?;
    Ok(context.plan.map(RefCell::into_inner).unwrap_or_default())
}

/// Decode a `T` from a tree whose field keys were written with `naming`.
pub(super) fn decode<T: DeserializeOwned>(tree: &Value, naming: NamingPolicy) -> Result<T, Error> {
    let context = Context { naming, plan: None };
    T::deserialize(Node::root(tree, &context))
}

// =============================================================================
// NAME MAPPING
// =============================================================================

fn encode_field(naming: NamingPolicy, key: &str, fields: Option<&[&str]>) -> String {
    match fields {
        Some(fields) if fields.contains(&key) => naming.encode_key(key),
        Some(_) => key.to_string(),
        None => encode_unlisted(naming, key),
    }
}

fn encode_unlisted(naming: NamingPolicy, key: &str) -> String {
    let encoded = naming.encode_key(key);
    if naming.decode_key(&encoded) == key {
        encoded
    } else {
        key.to_string()
    }
}

fn decode_field(naming: NamingPolicy, wire: &str, fields: Option<&[&str]>) -> String {
    match fields {
        Some(fields) => fields
            .iter()
            .find(|field| naming.encode_key(field) == wire)
            .map_or_else(|| wire.to_string(), |field| (*field).to_string()),
        None => {
            let candidate = naming.decode_key(wire);
            if encode_unlisted(naming, &candidate) == wire {
                candidate
            } else {
                wire.to_string()
            }
        }
    }
}

// =============================================================================
// TREE DESERIALIZER
// =============================================================================

struct Context {
    naming: NamingPolicy,
    /// Present while planning an encode; absent while decoding.
    plan: Option<RefCell<RenamePlan>>,
}

struct Node<'a> {
    value: &'a Value,
    path: Path,
    context: &'a Context,
}

impl<'a> Node<'a> {
    fn root(value: &'a Value, context: &'a Context) -> Self {
        Self {
            value,
            path: Vec::new(),
            context,
        }
    }

    fn child(&self, segment: Segment, value: &'a Value) -> Self {
        let mut path = self.path.clone();
        path.push(segment);
        Self {
            value,
            path,
            context: self.context,
        }
    }

    fn visit_object<V: Visitor<'a>>(
        self,
        map: &'a Map<String, Value>,
        fields: Option<&'static [&'static str]>,
        visitor: V,
    ) -> Result<V::Value, Error> {
        visitor.visit_map(Entries {
            entries: map.iter(),
            pending: None,
            path: self.path,
            context: self.context,
            fields,
        })
    }
}

impl<'a> de::Deserializer<'a> for Node<'a> {
    type Error = Error;

    fn deserialize_any<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Error> {
        let value = self.value;
        match value {
            Value::Null => visitor.visit_unit(),
            Value::Bool(b) => visitor.visit_bool(*b),
            Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    visitor.visit_u64(u)
                } else if let Some(i) = n.as_i64() {
                    visitor.visit_i64(i)
                } else if let Some(f) = n.as_f64() {
                    visitor.visit_f64(f)
                } else {
                    Err(de::Error::custom(format!("unsupported number {n}")))
                }
            }
            Value::String(s) => visitor.visit_borrowed_str(s),
            Value::Array(items) => visitor.visit_seq(Items {
                items: items.iter().enumerate(),
                path: self.path,
                context: self.context,
            }),
            Value::Object(map) => self.visit_object(map, None, visitor),
        }
    }

    fn deserialize_option<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Error> {
        let value = self.value;
        match value {
            Value::Null => visitor.visit_none(),
            _ => visitor.visit_some(self),
        }
    }

    fn deserialize_newtype_struct<V: Visitor<'a>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_struct<V: Visitor<'a>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Error> {
        let value = self.value;
        match value {
            Value::Object(map) => self.visit_object(map, Some(fields), visitor),
            _ => self.deserialize_any(visitor),
        }
    }

    fn deserialize_enum<V: Visitor<'a>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Error> {
        let value = self.value;
        match value {
            Value::String(variant) => {
                visitor.visit_enum(IntoDeserializer::<'a, Error>::into_deserializer(variant.as_str()))
            }
            Value::Object(map) => match (map.len(), map.iter().next()) {
                (1, Some((variant, inner))) => visitor.visit_enum(Variant {
                    name: variant,
                    value: self.child(Segment::Key(variant.clone()), inner),
                }),
                _ => Err(de::Error::custom("enum object must have exactly one key")),
            },
            _ => Err(de::Error::custom("expected a string or an object for an enum")),
        }
    }

    fn deserialize_ignored_any<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_unit()
    }

    forward_to_deserialize_any! {
        <W: Visitor<'a>>
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct seq tuple tuple_struct map identifier
    }
}

struct Items<'a> {
    items: std::iter::Enumerate<std::slice::Iter<'a, Value>>,
    path: Path,
    context: &'a Context,
}

impl<'a> de::SeqAccess<'a> for Items<'a> {
    type Error = Error;

    fn next_element_seed<S: DeserializeSeed<'a>>(&mut self, seed: S) -> Result<Option<S::Value>, Error> {
        let Some((index, value)) = self.items.next() else {
            return Ok(None);
        };
        let mut path = self.path.clone();
        path.push(Segment::Index(index));
        seed.deserialize(Node {
            value,
            path,
            context: self.context,
        })
        .map(Some)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.items.len())
    }
}

struct Entries<'a> {
    entries: serde_json::map::Iter<'a>,
    pending: Option<(&'a str, &'a Value)>,
    path: Path,
    context: &'a Context,
    fields: Option<&'static [&'static str]>,
}

impl<'a> de::MapAccess<'a> for Entries<'a> {
    type Error = Error;

    fn next_key_seed<K: DeserializeSeed<'a>>(&mut self, seed: K) -> Result<Option<K::Value>, Error> {
        let Some((key, value)) = self.entries.next() else {
            return Ok(None);
        };
        let key = key.as_str();
        self.pending = Some((key, value));
        seed.deserialize(Key {
            key,
            object: &self.path,
            context: self.context,
            fields: self.fields,
        })
        .map(Some)
    }

    fn next_value_seed<S: DeserializeSeed<'a>>(&mut self, seed: S) -> Result<S::Value, Error> {
        let (key, value) = self
            .pending
            .take()
            .ok_or_else(|| de::Error::custom("map value requested before its key"))?;
        let mut path = self.path.clone();
        path.push(Segment::Key(key.to_string()));
        seed.deserialize(Node {
            value,
            path,
            context: self.context,
        })
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.entries.len())
    }
}

/// An object key. Only `deserialize_identifier` renames.
struct Key<'p, 'a> {
    key: &'a str,
    object: &'p Path,
    context: &'a Context,
    fields: Option<&'static [&'static str]>,
}

impl<'a> de::Deserializer<'a> for Key<'_, 'a> {
    type Error = Error;

    fn deserialize_any<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_borrowed_str(self.key)
    }

    fn deserialize_identifier<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Error> {
        let naming = self.context.naming;
        match &self.context.plan {
            Some(plan) => {
                let wire = encode_field(naming, self.key, self.fields);
                plan.borrow_mut()
                    .objects
                    .entry(self.object.clone())
                    .or_default()
                    .insert(self.key.to_string(), wire);
                visitor.visit_borrowed_str(self.key)
            }
            None => visitor.visit_string(decode_field(naming, self.key, self.fields)),
        }
    }

    fn deserialize_option<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_some(self)
    }

    fn deserialize_newtype_struct<V: Visitor<'a>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_enum<V: Visitor<'a>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Error> {
        visitor.visit_enum(IntoDeserializer::<'a, Error>::into_deserializer(self.key))
    }

    // Integer map keys are quoted on the wire.
    fn deserialize_i64<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Error> {
        match self.key.parse::<i64>() {
            Ok(n) => visitor.visit_i64(n),
            Err(_) => visitor.visit_borrowed_str(self.key),
        }
    }

    fn deserialize_u64<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Error> {
        match self.key.parse::<u64>() {
            Ok(n) => visitor.visit_u64(n),
            Err(_) => visitor.visit_borrowed_str(self.key),
        }
    }

    fn deserialize_i8<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_i64(visitor)
    }

    fn deserialize_i16<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_i64(visitor)
    }

    fn deserialize_i32<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_i64(visitor)
    }

    fn deserialize_u8<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_u64(visitor)
    }

    fn deserialize_u16<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_u64(visitor)
    }

    fn deserialize_u32<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_u64(visitor)
    }

    forward_to_deserialize_any! {
        <W: Visitor<'a>>
        bool i128 u128 f32 f64 char str string bytes byte_buf unit unit_struct
        seq tuple tuple_struct map struct ignored_any
    }
}

struct Variant<'a> {
    name: &'a str,
    value: Node<'a>,
}

impl<'a> de::EnumAccess<'a> for Variant<'a> {
    type Error = Error;
    type Variant = Node<'a>;

    fn variant_seed<S: DeserializeSeed<'a>>(self, seed: S) -> Result<(S::Value, Node<'a>), Error> {
        let variant = seed.deserialize(IntoDeserializer::<'a, Error>::into_deserializer(self.name))?;
        Ok((variant, self.value))
    }
}

impl<'a> de::VariantAccess<'a> for Node<'a> {
    type Error = Error;

    fn unit_variant(self) -> Result<(), Error> {
        Ok(())
    }

    fn newtype_variant_seed<S: DeserializeSeed<'a>>(self, seed: S) -> Result<S::Value, Error> {
        seed.deserialize(self)
    }

    fn tuple_variant<V: Visitor<'a>>(self, _len: usize, visitor: V) -> Result<V::Value, Error> {
        de::Deserializer::deserialize_seq(self, visitor)
    }

    fn struct_variant<V: Visitor<'a>>(
        self,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Error> {
        de::Deserializer::deserialize_struct(self, "", fields, visitor)
    }
}
