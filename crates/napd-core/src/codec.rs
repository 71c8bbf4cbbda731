//! Structured-value to wire-message codec.
//!
//! Policy documents are opaque JSON trees; the service surface speaks a typed
//! wire format in which every value carries (or is covered by) a type
//! signature. This module converts between the two representations:
//!
//! - [`encode`] turns a [`serde_json::Value`] into a [`WireValue`]
//! - [`signature_of`] infers the wire [`Signature`] of a value without
//!   materializing the encoded form
//! - [`decode`] recovers the JSON tree from a wire value
//! - [`encode_str`] is a convenience entry point for raw JSON text
//!
//! # Array typing
//!
//! An array is encoded as a directly-typed sequence only when it is non-empty
//! and every element has the same *leaf kind*. The leaf kinds are string,
//! integer, real, `true`, `false` and null; note that `true` and `false`
//! count as distinct kinds, so `[true, false]` is NOT homogeneous and is
//! wrapped per element. Empty arrays, mixed arrays, and arrays whose elements
//! are themselves arrays or objects are always encoded as sequences of
//! variant-wrapped (self-describing) values; nested containers are never
//! typed as nested homogeneous sequences.
//!
//! Objects are always encoded as an ordered sequence of
//! `(string key, variant value)` entries, regardless of value homogeneity.
//!
//! # Integer width
//!
//! Wire integers are signed 64-bit, fixed by this codec rather than derived
//! from any host characteristic. JSON integers that do not fit are carried
//! as doubles.

use serde_json::Value;

/// Wire type signature.
///
/// Signatures describe the shape of a [`WireValue`]. A directly-typed array
/// carries the element signature; an array of variant-wrapped values carries
/// [`Signature::Variant`] as its element signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    /// Boolean.
    Bool,
    /// Signed 64-bit integer (the codec's fixed integer width).
    Int64,
    /// Double-precision float.
    Double,
    /// UTF-8 string.
    Str,
    /// The null unit value.
    Null,
    /// Sequence with the given element signature.
    Array(Box<Signature>),
    /// A self-describing value: the signature travels with the value.
    Variant,
    /// Ordered sequence of `(string, variant)` entries.
    Dict,
}

/// A value in wire form.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int64(i64),
    /// Double-precision float.
    Double(f64),
    /// UTF-8 string.
    Str(String),
    /// The null unit value.
    Null,
    /// Sequence of elements.
    ///
    /// When `elem` is anything other than [`Signature::Variant`], the items
    /// are plain values of exactly that signature. When `elem` is
    /// [`Signature::Variant`], every item is a [`WireValue::Variant`].
    Array {
        /// Element signature shared by all items.
        elem: Signature,
        /// The items, in order.
        items: Vec<WireValue>,
    },
    /// Ordered `(key, value)` entries; every value is variant-wrapped.
    Dict(Vec<(String, WireValue)>),
    /// A value tagged with its own signature.
    Variant(Box<WireValue>),
}

impl WireValue {
    /// Returns the signature of this value.
    #[must_use]
    pub fn signature(&self) -> Signature {
        match self {
            Self::Bool(_) => Signature::Bool,
            Self::Int64(_) => Signature::Int64,
            Self::Double(_) => Signature::Double,
            Self::Str(_) => Signature::Str,
            Self::Null => Signature::Null,
            Self::Array { elem, .. } => Signature::Array(Box::new(elem.clone())),
            Self::Dict(_) => Signature::Dict,
            Self::Variant(_) => Signature::Variant,
        }
    }
}

/// Leaf kinds used for the array homogeneity test.
///
/// `true` and `false` are distinct kinds on purpose: a boolean array with
/// mixed values is not homogeneous. Containers have no leaf kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeafKind {
    Str,
    Int,
    Real,
    True,
    False,
    Null,
}

impl LeafKind {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::String(_) => Some(Self::Str),
            Value::Number(n) => {
                if n.as_i64().is_some() {
                    Some(Self::Int)
                } else {
                    Some(Self::Real)
                }
            }
            Value::Bool(true) => Some(Self::True),
            Value::Bool(false) => Some(Self::False),
            Value::Null => Some(Self::Null),
            Value::Array(_) | Value::Object(_) => None,
        }
    }
}

/// Returns the shared leaf kind of the array elements, or `None` when the
/// array is empty, mixed, or contains nested containers.
fn array_leaf_kind(items: &[Value]) -> Option<LeafKind> {
    let first = LeafKind::of(items.first()?)?;
    for item in &items[1..] {
        if LeafKind::of(item)? != first {
            return None;
        }
    }
    Some(first)
}

/// Infers the wire signature of a JSON value without encoding it.
#[must_use]
pub fn signature_of(value: &Value) -> Signature {
    match value {
        Value::Bool(_) => Signature::Bool,
        Value::Number(n) => {
            if n.as_i64().is_some() {
                Signature::Int64
            } else {
                Signature::Double
            }
        }
        Value::String(_) => Signature::Str,
        Value::Null => Signature::Null,
        Value::Array(items) => {
            let elem = match array_leaf_kind(items) {
                // Homogeneous leaf array: the element signature is that of
                // the first element.
                Some(_) => signature_of(&items[0]),
                None => Signature::Variant,
            };
            Signature::Array(Box::new(elem))
        }
        Value::Object(_) => Signature::Dict,
    }
}

/// Encodes a JSON value into wire form.
///
/// This is a pure transformation and is total over JSON values; inputs are
/// decoded from valid JSON upstream.
#[must_use]
pub fn encode(value: &Value) -> WireValue {
    match value {
        Value::Bool(b) => WireValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => WireValue::Int64(i),
            // Reals, and the rare integer outside the fixed 64-bit signed
            // range. Every serde_json number has an f64 rendering.
            None => WireValue::Double(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => WireValue::Str(s.clone()),
        Value::Null => WireValue::Null,
        Value::Array(items) => match array_leaf_kind(items) {
            Some(_) => WireValue::Array {
                elem: signature_of(&items[0]),
                items: items.iter().map(encode).collect(),
            },
            None => WireValue::Array {
                elem: Signature::Variant,
                items: items
                    .iter()
                    .map(|item| WireValue::Variant(Box::new(encode(item))))
                    .collect(),
            },
        },
        Value::Object(entries) => WireValue::Dict(
            entries
                .iter()
                .map(|(key, val)| (key.clone(), WireValue::Variant(Box::new(encode(val)))))
                .collect(),
        ),
    }
}

/// Decodes a wire value back into a JSON tree.
#[must_use]
pub fn decode(value: &WireValue) -> Value {
    match value {
        WireValue::Bool(b) => Value::Bool(*b),
        WireValue::Int64(i) => Value::Number((*i).into()),
        // Wire doubles originate from JSON and are therefore finite.
        WireValue::Double(d) => serde_json::Number::from_f64(*d)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        WireValue::Str(s) => Value::String(s.clone()),
        WireValue::Null => Value::Null,
        WireValue::Array { items, .. } => Value::Array(items.iter().map(decode).collect()),
        WireValue::Dict(entries) => Value::Object(
            entries
                .iter()
                .map(|(key, val)| (key.clone(), decode(val)))
                .collect(),
        ),
        WireValue::Variant(inner) => decode(inner),
    }
}

/// Convenience entry point: decodes raw JSON text and encodes the result.
///
/// Returns `None` when the text is not valid JSON; the failure is silent by
/// contract since callers hand in documents that were validated on load.
#[must_use]
pub fn encode_str(json: &str) -> Option<WireValue> {
    serde_json::from_str::<Value>(json).ok().map(|v| encode(&v))
}
