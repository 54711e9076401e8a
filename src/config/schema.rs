// src/config/schema.rs

//! Configuration schema
//!
//! Every category of the store has a fixed schema: known keys with known
//! value kinds. Loading fails fast on a key the schema does not allow, so
//! a typo in a defines file is caught before any generation happens.
//! A few categories carry free-form keys (description parts, relation
//! overrides) and are marked open or given key patterns.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;

/// A typed configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<String>),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    /// Render for use as a make flag value
    pub fn render(&self) -> String {
        match self {
            Value::Bool(v) => (if *v { "True" } else { "False" }).to_string(),
            Value::Int(v) => v.to_string(),
            Value::Str(v) => v.clone(),
            Value::List(v) => v.join(" "),
        }
    }
}

/// The value kind of a schema key
#[derive(Debug, Clone, Copy)]
pub enum SchemaItem {
    Boolean,
    Integer,
    Str,
    /// Whitespace-separated list
    List,
    /// List with a custom separator
    ListSep(char),
}

impl SchemaItem {
    pub fn parse(&self, raw: &str) -> Result<Value> {
        let raw = raw.trim();
        match self {
            SchemaItem::Boolean => match raw.to_lowercase().as_str() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(Error::Schema(format!("invalid boolean \"{raw}\""))),
            },
            SchemaItem::Integer => raw
                .parse()
                .map(Value::Int)
                .map_err(|_| Error::Schema(format!("invalid integer \"{raw}\""))),
            SchemaItem::Str => Ok(Value::Str(raw.to_string())),
            SchemaItem::List => {
                if raw.is_empty() {
                    return Ok(Value::List(Vec::new()));
                }
                Ok(Value::List(
                    raw.split_whitespace().map(str::to_string).collect(),
                ))
            }
            SchemaItem::ListSep(sep) => {
                if raw.is_empty() {
                    return Ok(Value::List(Vec::new()));
                }
                Ok(Value::List(
                    raw.split(*sep)
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                ))
            }
        }
    }
}

/// Schema of one category
pub struct CategorySchema {
    keys: HashMap<&'static str, SchemaItem>,
    /// Key prefixes allowed in addition to the fixed keys, typed as strings
    patterns: &'static [&'static str],
    /// Open categories accept any key as a string
    open: bool,
}

impl CategorySchema {
    fn closed(keys: &[(&'static str, SchemaItem)]) -> Self {
        Self {
            keys: keys.iter().copied().collect(),
            patterns: &[],
            open: false,
        }
    }

    fn with_patterns(
        keys: &[(&'static str, SchemaItem)],
        patterns: &'static [&'static str],
    ) -> Self {
        Self {
            keys: keys.iter().copied().collect(),
            patterns,
            open: false,
        }
    }

    fn open() -> Self {
        Self {
            keys: HashMap::new(),
            patterns: &[],
            open: true,
        }
    }

    /// Parse a raw value for a key, or fail when the key is not allowed
    pub fn parse(&self, key: &str, raw: &str) -> Result<Option<Value>> {
        if let Some(item) = self.keys.get(key) {
            return item.parse(raw).map(Some);
        }
        if self.open || self.patterns.iter().any(|p| key.starts_with(p)) {
            return Ok(Some(Value::Str(raw.trim().to_string())));
        }
        Ok(None)
    }
}

static SCHEMAS: Lazy<HashMap<&'static str, CategorySchema>> = Lazy::new(|| {
    use SchemaItem::*;

    let mut schemas = HashMap::new();
    schemas.insert(
        "base",
        CategorySchema::closed(&[
            ("arches", List),
            ("cflags", Str),
            ("compat-deb-arch", Str),
            ("compat-gnu-type", Str),
            ("compiler", Str),
            ("compiler-filename", Str),
            ("default-flavour", Str),
            ("enabled", Boolean),
            ("featuresets", List),
            ("flavours", List),
            ("kernel-arch", Str),
            ("kernel-deb-arch", Str),
            ("kernel-gnu-type", Str),
            ("modules", Boolean),
            ("quick-flavour", Str),
        ]),
    );
    schemas.insert(
        "build",
        CategorySchema::closed(&[
            ("debug-info", Boolean),
            ("image-file", Str),
            ("signed-code", Boolean),
            ("vdso", Boolean),
        ]),
    );
    schemas.insert(
        "description",
        CategorySchema::with_patterns(
            &[
                ("hardware", Str),
                ("hardware-long", Str),
                ("parts", List),
            ],
            &["part-long-", "part-short-"],
        ),
    );
    schemas.insert(
        "image",
        CategorySchema::closed(&[
            ("bootloaders", List),
            ("breaks", ListSep(',')),
            ("check-size", Integer),
            ("check-size-with-dtb", Boolean),
            ("check-uncompressed-size", Integer),
            ("configs", List),
            ("conflicts", ListSep(',')),
            ("depends", ListSep(',')),
            ("initramfs-generators", List),
            ("install-stem", Str),
            ("override-localversion", Str),
            ("provides", ListSep(',')),
            ("recommends", ListSep(',')),
            ("suggests", ListSep(',')),
        ]),
    );
    schemas.insert(
        "packages",
        CategorySchema::closed(&[
            ("docs", Boolean),
            ("installer", Boolean),
            ("libc-dev", Boolean),
            ("meta", Boolean),
            ("source", Boolean),
            ("tools-unversioned", Boolean),
            ("tools-versioned", Boolean),
        ]),
    );
    schemas.insert(
        "abi",
        CategorySchema::closed(&[("abiname", Str), ("ignore-changes", List)]),
    );
    schemas.insert("relations", CategorySchema::open());
    schemas.insert("version", CategorySchema::open());
    schemas
});

/// Look up the schema of a category; unknown categories are a schema error
pub fn category_schema(category: &str) -> Option<&'static CategorySchema> {
    SCHEMAS.get(category)
}

/// True when the name is a known category
pub fn is_category(name: &str) -> bool {
    SCHEMAS.contains_key(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boolean_parse() {
        assert_eq!(SchemaItem::Boolean.parse("true").unwrap(), Value::Bool(true));
        assert_eq!(SchemaItem::Boolean.parse("0").unwrap(), Value::Bool(false));
        assert!(SchemaItem::Boolean.parse("maybe").is_err());
    }

    #[test]
    fn test_integer_parse() {
        assert_eq!(SchemaItem::Integer.parse(" 42 ").unwrap(), Value::Int(42));
        assert!(SchemaItem::Integer.parse("4x").is_err());
    }

    #[test]
    fn test_list_parse() {
        assert_eq!(
            SchemaItem::List.parse("amd64  arm64\n i386").unwrap(),
            Value::List(vec!["amd64".into(), "arm64".into(), "i386".into()])
        );
        assert_eq!(SchemaItem::List.parse("").unwrap(), Value::List(vec![]));
    }

    #[test]
    fn test_list_custom_separator() {
        assert_eq!(
            SchemaItem::ListSep(',')
                .parse("initramfs-tools, dracut (>= 042)")
                .unwrap(),
            Value::List(vec!["initramfs-tools".into(), "dracut (>= 042)".into()])
        );
    }

    #[test]
    fn test_unknown_key_rejected() {
        let schema = category_schema("build").unwrap();
        assert!(schema.parse("signed-code", "true").unwrap().is_some());
        assert!(schema.parse("sined-code", "true").unwrap().is_none());
    }

    #[test]
    fn test_pattern_keys_allowed() {
        let schema = category_schema("description").unwrap();
        let v = schema.parse("part-long-xen", "text").unwrap();
        assert_eq!(v, Some(Value::Str("text".into())));
        assert!(schema.parse("part-title-xen", "text").unwrap().is_none());
    }

    #[test]
    fn test_open_category() {
        let schema = category_schema("relations").unwrap();
        assert!(schema.parse("gcc-12", "gcc-12 <!cross>").unwrap().is_some());
    }
}
