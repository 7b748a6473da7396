//! Keyspace/table selection, written as `ks1,ks2.table2`.
//!
//! An empty selector means every keyspace. A keyspace named on its own selects all of
//! its tables and must not also appear with an explicit table.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::BackupError;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_]{1,48}$").expect("identifier pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Entity {
    Keyspace(String),
    Table { keyspace: String, table: String },
}

impl Entity {
    pub fn keyspace(&self) -> &str {
        match self {
            Entity::Keyspace(keyspace) => keyspace,
            Entity::Table { keyspace, .. } => keyspace,
        }
    }

    /// Whether this entity selects `keyspace.table`.
    pub fn matches(&self, keyspace: &str, table: &str) -> bool {
        match self {
            Entity::Keyspace(k) => k == keyspace,
            Entity::Table { keyspace: k, table: t } => k == keyspace && t == table,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Keyspace(keyspace) => f.write_str(keyspace),
            Entity::Table { keyspace, table } => write!(f, "{keyspace}.{table}"),
        }
    }
}

/// Tables selected within one keyspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableSelection {
    All,
    Tables(BTreeSet<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DatabaseEntities {
    // Kept in input order so the text form round-trips exactly.
    entities: Vec<Entity>,
}

impl DatabaseEntities {
    /// Selects every keyspace.
    pub fn all() -> Self {
        DatabaseEntities::default()
    }

    /// Builds a selector without checking it; see [`DatabaseEntities::validate`].
    pub fn from_entities(entities: Vec<Entity>) -> Self {
        DatabaseEntities { entities }
    }

    pub fn parse(text: &str) -> Result<Self, BackupError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(DatabaseEntities::all());
        }

        let entities = text
            .split(',')
            .map(|token| {
                let token = token.trim();
                match token.split_once('.') {
                    Some((keyspace, table)) => Entity::Table {
                        keyspace: keyspace.to_string(),
                        table: table.to_string(),
                    },
                    None => Entity::Keyspace(token.to_string()),
                }
            })
            .collect();

        let parsed = DatabaseEntities { entities };
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<(), BackupError> {
        let invalid = |reason: String| BackupError::InvalidRequest(format!("entities: {reason}"));

        let mut seen = BTreeSet::new();
        for entity in &self.entities {
            let names = match entity {
                Entity::Keyspace(keyspace) => vec![keyspace.as_str()],
                Entity::Table { keyspace, table } => vec![keyspace.as_str(), table.as_str()],
            };
            for name in names {
                if !IDENTIFIER.is_match(name) {
                    return Err(invalid(format!("'{entity}' is not a valid keyspace or table name")));
                }
            }
            if !seen.insert(entity.clone()) {
                return Err(invalid(format!("'{entity}' is listed more than once")));
            }
        }

        let whole: BTreeSet<&str> = self
            .entities
            .iter()
            .filter_map(|e| match e {
                Entity::Keyspace(keyspace) => Some(keyspace.as_str()),
                Entity::Table { .. } => None,
            })
            .collect();
        for entity in &self.entities {
            if let Entity::Table { keyspace, .. } = entity {
                if whole.contains(keyspace.as_str()) {
                    return Err(invalid(format!(
                        "keyspace '{keyspace}' is selected whole and also with table '{entity}'"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn is_all(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Structured view: keyspace to its selected tables.
    pub fn selection(&self) -> BTreeMap<String, TableSelection> {
        let mut selection = BTreeMap::new();
        for entity in &self.entities {
            match entity {
                Entity::Keyspace(keyspace) => {
                    selection.insert(keyspace.clone(), TableSelection::All);
                }
                Entity::Table { keyspace, table } => {
                    let entry = selection
                        .entry(keyspace.clone())
                        .or_insert_with(|| TableSelection::Tables(BTreeSet::new()));
                    if let TableSelection::Tables(tables) = entry {
                        tables.insert(table.clone());
                    }
                }
            }
        }
        selection
    }

    /// Distinct keyspaces named, in input order.
    pub fn keyspaces(&self) -> Vec<&str> {
        let mut keyspaces: Vec<&str> = Vec::new();
        for entity in &self.entities {
            if !keyspaces.contains(&entity.keyspace()) {
                keyspaces.push(entity.keyspace());
            }
        }
        keyspaces
    }

    pub fn includes(&self, keyspace: &str, table: &str) -> bool {
        self.is_all()
            || self.entities.iter().any(|e| match e {
                Entity::Keyspace(ks) => ks == keyspace,
                Entity::Table { keyspace: ks, table: t } => ks == keyspace && t == table,
            })
    }
}

impl fmt::Display for DatabaseEntities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .entities
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&joined)
    }
}

impl Serialize for DatabaseEntities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DatabaseEntities {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = Option::<String>::deserialize(deserializer)?;
        match text {
            None => Ok(DatabaseEntities::all()),
            Some(text) => DatabaseEntities::parse(&text).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyspace_and_table_tokens_round_trip() {
        let entities = DatabaseEntities::parse("ks1,ks2.cf2").unwrap();

        let mut expected = BTreeMap::new();
        expected.insert("ks1".to_string(), TableSelection::All);
        expected.insert(
            "ks2".to_string(),
            TableSelection::Tables(["cf2".to_string()].into_iter().collect()),
        );
        assert_eq!(entities.selection(), expected);
        assert_eq!(entities.to_string(), "ks1,ks2.cf2");
    }

    #[test]
    fn input_order_is_preserved() {
        for text in ["b,a", "ks2.t9,ks2.t1,ks1", "system_auth"] {
            assert_eq!(DatabaseEntities::parse(text).unwrap().to_string(), text);
        }
    }

    #[test]
    fn empty_text_selects_everything() {
        let entities = DatabaseEntities::parse("  ").unwrap();
        assert!(entities.is_all());
        assert!(entities.includes("any", "table"));
        assert_eq!(entities.to_string(), "");
    }

    #[test]
    fn rejects_inconsistent_selectors() {
        for text in ["ks1,,ks2", "ks1.", ".t1", "ks-1", "ks1,ks1", "ks1,ks1.t1", "ks1.t1.x"] {
            let err = DatabaseEntities::parse(text).unwrap_err();
            assert!(matches!(err, BackupError::InvalidRequest(_)), "{text}");
        }
    }

    #[test]
    fn includes_respects_table_selection() {
        let entities = DatabaseEntities::parse("ks1,ks2.cf2").unwrap();
        assert!(entities.includes("ks1", "whatever"));
        assert!(entities.includes("ks2", "cf2"));
        assert!(!entities.includes("ks2", "cf3"));
        assert!(!entities.includes("ks3", "cf2"));
        assert_eq!(entities.keyspaces(), vec!["ks1", "ks2"]);
    }

    #[test]
    fn serde_uses_comma_joined_string() {
        let entities = DatabaseEntities::parse("ks1,ks2.cf2").unwrap();
        assert_eq!(serde_json::to_string(&entities).unwrap(), "\"ks1,ks2.cf2\"");

        let back: DatabaseEntities = serde_json::from_str("\"ks1,ks2.cf2\"").unwrap();
        assert_eq!(back, entities);

        let null: DatabaseEntities = serde_json::from_str("null").unwrap();
        assert!(null.is_all());
        assert!(serde_json::from_str::<DatabaseEntities>("\"ks1,,\"").is_err());
    }
}
