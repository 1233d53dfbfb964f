//! Path-addressable view over structured, semi-schemaless query results.
//!
//! A [`Node`] is what every live query and every structured stack output is
//! turned into. Lookups never fail: a path that does not resolve yields
//! [`Node::Absent`], so callers can check presence separately from value.
//!
//! Path syntax:
//! - `a.b.c` walks object keys (case-sensitive)
//! - `items.0.name` or `items[0].name` indexes into arrays
//! - `items.#` is the length of an array
//! - `items.#.name` maps `name` over every element, keeping present results
//! - `\.` escapes a literal dot, e.g. `cymbal-shop\.cymbalshop.project_id`

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};

/// Tagged-union tree of scalars, arrays and objects plus an explicit
/// "absent" sentinel.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Node {
    #[default]
    Absent,
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Node>),
    Object(BTreeMap<String, Node>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Name(String),
    Index(usize),
    Hash,
}

impl Node {
    /// Parse JSON text into a node tree.
    pub fn parse(text: &str) -> Result<Node, serde_json::Error> {
        serde_json::from_str::<Value>(text).map(Node::from)
    }

    /// Build an array node from anything convertible into nodes.
    pub fn array<I, T>(items: I) -> Node
    where
        I: IntoIterator<Item = T>,
        T: Into<Node>,
    {
        Node::Array(items.into_iter().map(Into::into).collect())
    }

    /// Resolve `path` against this node. Unresolvable paths yield `Absent`.
    pub fn get(&self, path: &str) -> Node {
        let segments = parse_path(path);
        walk(self, &segments)
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Node::Absent)
    }

    pub fn is_present(&self) -> bool {
        !self.is_absent()
    }

    /// Borrow the string payload, if this is a string node.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::String(s) => Some(s),
            _ => None,
        }
    }

    /// String coercion: strings verbatim, scalars rendered, `Absent` and
    /// `Null` as the empty string, containers as compact JSON.
    pub fn text(&self) -> String {
        match self {
            Node::Absent | Node::Null => String::new(),
            Node::Bool(b) => b.to_string(),
            Node::Number(n) => n.to_string(),
            Node::String(s) => s.clone(),
            Node::Array(_) | Node::Object(_) => self.to_value().to_string(),
        }
    }

    /// Boolean coercion. Anything that is not clearly true is false.
    pub fn as_bool(&self) -> bool {
        match self {
            Node::Bool(b) => *b,
            Node::String(s) => s.eq_ignore_ascii_case("true") || s == "1",
            Node::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            _ => false,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Node::Number(n) => n.as_i64(),
            Node::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Array coercion: array elements, nothing for `Absent`/`Null`, and a
    /// single-element vector for any other value.
    pub fn items(&self) -> Vec<Node> {
        match self {
            Node::Absent | Node::Null => Vec::new(),
            Node::Array(items) => items.clone(),
            other => vec![other.clone()],
        }
    }

    /// Object coercion: entries of an object, empty for anything else.
    pub fn entries(&self) -> BTreeMap<String, Node> {
        match self {
            Node::Object(map) => map.clone(),
            _ => BTreeMap::new(),
        }
    }

    /// `get(path).items()` rendered through [`Node::text`].
    pub fn texts(&self, path: &str) -> Vec<String> {
        self.get(path).items().iter().map(Node::text).collect()
    }

    /// Convert back into a `serde_json::Value`; `Absent` becomes `null`.
    pub fn to_value(&self) -> Value {
        match self {
            Node::Absent | Node::Null => Value::Null,
            Node::Bool(b) => Value::Bool(*b),
            Node::Number(n) => Value::Number(n.clone()),
            Node::String(s) => Value::String(s.clone()),
            Node::Array(items) => Value::Array(items.iter().map(Node::to_value).collect()),
            Node::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_value()))
                    .collect(),
            ),
        }
    }
}

/// For every node, the text of `get(path)`.
pub fn field_texts(nodes: &[Node], path: &str) -> Vec<String> {
    let segments = parse_path(path);
    nodes.iter().map(|n| walk(n, &segments).text()).collect()
}

fn parse_path(path: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut escaped_any = false;
    let mut chars = path.chars();

    fn flush(segments: &mut Vec<Segment>, current: &mut String, escaped_any: &mut bool) {
        if current.is_empty() {
            return;
        }
        let name = std::mem::take(current);
        if name == "#" && !*escaped_any {
            segments.push(Segment::Hash);
        } else {
            segments.push(Segment::Name(name));
        }
        *escaped_any = false;
    }

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    escaped_any = true;
                }
            }
            '.' => flush(&mut segments, &mut current, &mut escaped_any),
            '[' => {
                flush(&mut segments, &mut current, &mut escaped_any);
                let inner: String = chars.by_ref().take_while(|c| *c != ']').collect();
                let inner = inner.trim().trim_matches(|c| c == '"' || c == '\'');
                match inner.parse::<usize>() {
                    Ok(idx) => segments.push(Segment::Index(idx)),
                    Err(_) if !inner.is_empty() => segments.push(Segment::Name(inner.to_string())),
                    Err(_) => {}
                }
            }
            other => current.push(other),
        }
    }
    flush(&mut segments, &mut current, &mut escaped_any);
    segments
}

fn walk(node: &Node, segments: &[Segment]) -> Node {
    let Some((head, rest)) = segments.split_first() else {
        return node.clone();
    };
    match (head, node) {
        (Segment::Hash, Node::Array(items)) if rest.is_empty() => {
            Node::Number(Number::from(items.len()))
        }
        (Segment::Hash, Node::Array(items)) => Node::Array(
            items
                .iter()
                .map(|item| walk(item, rest))
                .filter(Node::is_present)
                .collect(),
        ),
        (Segment::Name(name), Node::Object(map)) => map
            .get(name)
            .map(|child| walk(child, rest))
            .unwrap_or_default(),
        (Segment::Name(name), Node::Array(items)) => name
            .parse::<usize>()
            .ok()
            .and_then(|idx| items.get(idx))
            .map(|child| walk(child, rest))
            .unwrap_or_default(),
        (Segment::Index(idx), Node::Array(items)) => items
            .get(*idx)
            .map(|child| walk(child, rest))
            .unwrap_or_default(),
        _ => Node::Absent,
    }
}

impl From<Value> for Node {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Node::Null,
            Value::Bool(b) => Node::Bool(b),
            Value::Number(n) => Node::Number(n),
            Value::String(s) => Node::String(s),
            Value::Array(items) => Node::Array(items.into_iter().map(Node::from).collect()),
            Value::Object(map) => Node::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Node::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Node {
    fn from(value: &str) -> Self {
        Node::String(value.to_string())
    }
}

impl From<String> for Node {
    fn from(value: String) -> Self {
        Node::String(value)
    }
}

impl From<bool> for Node {
    fn from(value: bool) -> Self {
        Node::Bool(value)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Node::from)
    }
}
