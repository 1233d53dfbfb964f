//! Cross-stack fact aggregation.
//!
//! A [`FactTable`] maps a logical key (environment name, `app.service`,
//! folder id) to the named facts read from that key's stack. Tables are
//! built once and only read afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinSet;

use crate::error::{AggregateError, StackError};
use crate::node::Node;
use crate::stack::StackHandle;

/// Named facts for one logical key.
pub type Facts = BTreeMap<String, Node>;

/// Resolves a logical key to an applied stack.
#[async_trait]
pub trait StackSource: Send + Sync {
    async fn open(&self, key: &str) -> Result<Arc<StackHandle>, StackError>;
}

/// Required shape of the keys of a structured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyShape {
    Any,
    /// Exactly `n` dot-separated, non-empty parts, e.g. `app.service`.
    Dotted(usize),
}

impl KeyShape {
    /// Split `key` into its parts, checking the shape.
    pub fn split(&self, key: &str) -> Result<Vec<String>, AggregateError> {
        match self {
            KeyShape::Any => Ok(vec![key.to_string()]),
            KeyShape::Dotted(n) => {
                let parts: Vec<String> = key.split('.').map(str::to_string).collect();
                if parts.len() != *n || parts.iter().any(String::is_empty) {
                    return Err(AggregateError::Shape {
                        key: key.to_string(),
                        detail: format!("expected {n} dot-separated parts, found {}", parts.len()),
                    });
                }
                Ok(parts)
            }
        }
    }
}

/// Immutable table of facts keyed by logical identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FactTable {
    entries: BTreeMap<String, Facts>,
}

impl FactTable {
    /// One entry per key of a structured output, e.g. the `app-group` map.
    /// Every value must be an object; its fields become the entry's facts.
    pub fn from_object(node: &Node, shape: KeyShape) -> Result<Self, AggregateError> {
        let Node::Object(map) = node else {
            return Err(AggregateError::Shape {
                key: String::new(),
                detail: format!("expected an object of entries, found {}", node.text()),
            });
        };
        let mut entries = BTreeMap::new();
        for (key, value) in map {
            shape.split(key)?;
            let Node::Object(fields) = value else {
                return Err(AggregateError::Shape {
                    key: key.clone(),
                    detail: "entry is not an object".to_string(),
                });
            };
            entries.insert(key.clone(), fields.clone());
        }
        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&Facts> {
        self.entries.get(key)
    }

    /// Entry for `key`, or a cardinality error if it is missing.
    pub fn require(&self, key: &str) -> Result<&Facts, AggregateError> {
        self.entries
            .get(key)
            .ok_or_else(|| AggregateError::Cardinality {
                key: key.to_string(),
                found: 0,
            })
    }

    /// Every expected key resolves to exactly one entry.
    pub fn require_keys<S: AsRef<str>>(&self, expected: &[S]) -> Result<(), AggregateError> {
        for key in expected {
            self.require(key.as_ref())?;
        }
        Ok(())
    }

    /// Fact `name` of `key`; `Absent` when either is missing.
    pub fn fact(&self, key: &str, name: &str) -> Node {
        self.entries
            .get(key)
            .and_then(|facts| facts.get(name))
            .cloned()
            .unwrap_or_default()
    }

    /// Flatten fact `name` across all entries in key order. Arrays
    /// contribute their elements, objects their values.
    pub fn collect(&self, name: &str) -> Vec<Node> {
        self.entries
            .values()
            .filter_map(|facts| facts.get(name))
            .flat_map(|fact| match fact {
                Node::Object(map) => map.values().cloned().collect(),
                other => other.items(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Facts)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, Facts)> for FactTable {
    fn from_iter<I: IntoIterator<Item = (String, Facts)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Reads outputs from many stacks concurrently into one [`FactTable`].
pub struct FactAggregator {
    source: Arc<dyn StackSource>,
}

impl FactAggregator {
    pub fn new(source: Arc<dyn StackSource>) -> Self {
        Self { source }
    }

    /// Open every key's stack and read `outputs` from it.
    ///
    /// Stacks are resolved concurrently. The first failure aborts the whole
    /// aggregation; remaining tasks are cancelled.
    pub async fn aggregate<K: AsRef<str>>(
        &self,
        keys: &[K],
        outputs: &[&str],
    ) -> Result<FactTable, AggregateError> {
        let mut seen = BTreeSet::new();
        for key in keys {
            if !seen.insert(key.as_ref()) {
                return Err(AggregateError::Cardinality {
                    key: key.as_ref().to_string(),
                    found: 2,
                });
            }
        }

        let names: Arc<Vec<String>> = Arc::new(outputs.iter().map(|s| s.to_string()).collect());
        let mut join_set = JoinSet::new();
        for key in keys {
            let key = key.as_ref().to_string();
            let source = Arc::clone(&self.source);
            let names = Arc::clone(&names);
            join_set.spawn(async move {
                let read = match source.open(&key).await {
                    Ok(handle) => names
                        .iter()
                        .map(|name| handle.json_output(name).map(|v| (name.clone(), v)))
                        .collect::<Result<Facts, StackError>>(),
                    Err(err) => Err(err),
                };
                match read {
                    Ok(facts) => Ok((key, facts)),
                    Err(source) => Err(AggregateError::Stack { key, source }),
                }
            });
        }

        let mut entries = BTreeMap::new();
        while let Some(joined) = join_set.join_next().await {
            let (key, facts) =
                joined.map_err(|e| AggregateError::Join(format!("fact task join error: {e}")))??;
            entries.insert(key, facts);
        }
        tracing::debug!(entries = entries.len(), "facts aggregated");
        Ok(FactTable { entries })
    }
}
