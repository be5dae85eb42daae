//! String-keyed attribute maps exposed by graph nodes.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::IrError;

/// A single attribute value.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f32),
    Str(String),
    Ints(Vec<i64>),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => f.write_str(s),
            Self::Ints(v) => {
                write!(f, "(")?;
                for (i, x) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{x}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Ordered attribute map of a node, keyed by attribute name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Attributes(BTreeMap<String, AttrValue>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: AttrValue) {
        self.0.insert(key.into(), value);
    }

    /// Inserts `key = true` only when `flag` is set.
    pub fn set_flag(&mut self, key: &str, flag: bool) {
        if flag {
            self.insert(key, AttrValue::Bool(true));
        }
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.0.iter()
    }

    pub fn extend(&mut self, other: Attributes) {
        self.0.extend(other.0);
    }

    /// A boolean flag; absent means `false`.
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.0.get(key), Some(AttrValue::Bool(true)))
    }

    pub(crate) fn require_int(&self, op_type: &str, key: &str) -> Result<i64, IrError> {
        match self.0.get(key) {
            Some(AttrValue::Int(i)) => Ok(*i),
            other => Err(bad_attr(op_type, key, "an integer", other)),
        }
    }

    pub(crate) fn require_float(&self, op_type: &str, key: &str) -> Result<f32, IrError> {
        match self.0.get(key) {
            Some(AttrValue::Float(x)) => Ok(*x),
            Some(AttrValue::Int(i)) => Ok(*i as f32),
            other => Err(bad_attr(op_type, key, "a float", other)),
        }
    }

    pub(crate) fn require_str(&self, op_type: &str, key: &str) -> Result<&str, IrError> {
        match self.0.get(key) {
            Some(AttrValue::Str(s)) => Ok(s),
            other => Err(bad_attr(op_type, key, "a string", other)),
        }
    }

    pub(crate) fn require_pair(&self, op_type: &str, key: &str) -> Result<[usize; 2], IrError> {
        match self.0.get(key) {
            Some(AttrValue::Ints(v)) if v.len() == 2 && v.iter().all(|&x| x >= 0) => {
                Ok([v[0] as usize, v[1] as usize])
            }
            other => Err(bad_attr(op_type, key, "a pair of non-negative integers", other)),
        }
    }
}

impl FromIterator<(String, AttrValue)> for Attributes {
    fn from_iter<T: IntoIterator<Item = (String, AttrValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Attributes {
    type Item = (&'a String, &'a AttrValue);
    type IntoIter = std::collections::btree_map::Iter<'a, String, AttrValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

fn bad_attr(op_type: &str, key: &str, wanted: &str, found: Option<&AttrValue>) -> IrError {
    IrError::InvalidAttribute {
        op_type: op_type.into(),
        attr: key.into(),
        detail: match found {
            Some(v) => format!("expected {wanted}, found `{v}`"),
            None => format!("missing, expected {wanted}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_only_inserted_when_set() {
        let mut attrs = Attributes::new();
        attrs.set_flag("with_bn", true);
        attrs.set_flag("with_relu", false);
        assert!(attrs.contains_key("with_bn"));
        assert!(!attrs.contains_key("with_relu"));
        assert!(attrs.flag("with_bn"));
        assert!(!attrs.flag("with_relu"));
    }

    #[test]
    fn display_values() {
        assert_eq!(AttrValue::Ints(vec![3, 3]).to_string(), "(3, 3)");
        assert_eq!(AttrValue::Bool(true).to_string(), "true");
        assert_eq!(AttrValue::Str("relu".into()).to_string(), "relu");
    }

    #[test]
    fn typed_lookup_errors_name_the_attribute() {
        let mut attrs = Attributes::new();
        attrs.insert("kernel", AttrValue::Ints(vec![3]));
        let err = attrs.require_pair("Convolution", "kernel").unwrap_err();
        assert!(err.to_string().contains("kernel"));
        assert!(attrs.require_int("Convolution", "num_filter").is_err());
    }
}
