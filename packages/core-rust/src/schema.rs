//! Collection definitions and the read-only schema accessor used by the evaluator.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::types::Value;

/// Fields every record carries regardless of its collection.
pub const SYSTEM_FIELDS: [&str; 4] = ["id", "created", "updated", "collectionName"];

/// Extra implicit fields of `auth` collections.
pub const AUTH_SYSTEM_FIELDS: [&str; 3] = ["email", "username", "verified"];

/// Kind of collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionType {
    #[default]
    Base,
    /// Records of this collection can authenticate.
    Auth,
    /// Read-only collection backed by a query.
    View,
}

/// Declared data type of a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Number,
    Bool,
    Date,
    Email,
    Url,
    Json,
    Select {
        #[serde(rename = "maxSelect", default, skip_serializing_if = "Option::is_none")]
        max_select: Option<usize>,
    },
    Relation {
        /// Name of the collection the stored ids point into.
        #[serde(rename = "collectionId")]
        collection: String,
        #[serde(rename = "maxSelect", default, skip_serializing_if = "Option::is_none")]
        max_select: Option<usize>,
    },
}

impl FieldType {
    /// Whether the field stores an array of values instead of a single one.
    #[must_use]
    pub fn is_multiple(&self) -> bool {
        match self {
            Self::Select { max_select } | Self::Relation { max_select, .. } => {
                max_select.is_some_and(|max| max > 1)
            }
            _ => false,
        }
    }

    /// Target collection for relation fields.
    #[must_use]
    pub fn relation_target(&self) -> Option<&str> {
        match self {
            Self::Relation { collection, .. } => Some(collection),
            _ => None,
        }
    }
}

/// Single field definition within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Name of the field.
    pub name: String,
    /// Whether the field must hold a non-blank value in every record.
    #[serde(default)]
    pub required: bool,
    #[serde(flatten)]
    pub field_type: FieldType,
}

impl FieldDef {
    #[must_use]
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            required: false,
            field_type,
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// The five access rules of a collection.
///
/// `None` restricts the operation to admins, `Some("")` allows everyone,
/// anything else is a filter expression.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSet {
    #[serde(default)]
    pub list_rule: Option<String>,
    #[serde(default)]
    pub view_rule: Option<String>,
    #[serde(default)]
    pub create_rule: Option<String>,
    #[serde(default)]
    pub update_rule: Option<String>,
    #[serde(default)]
    pub delete_rule: Option<String>,
}

impl RuleSet {
    /// Every operation open to everyone.
    #[must_use]
    pub fn public() -> Self {
        Self {
            list_rule: Some(String::new()),
            view_rule: Some(String::new()),
            create_rule: Some(String::new()),
            update_rule: Some(String::new()),
            delete_rule: Some(String::new()),
        }
    }
}

/// A dynamically defined collection of records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: CollectionType,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(flatten)]
    pub rules: RuleSet,
}

/// Result of validating record data against a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    /// The data conforms to the collection.
    Valid,
    /// The data violates one or more field constraints.
    Invalid {
        /// Field name -> human-readable failure.
        errors: BTreeMap<String, String>,
    },
}

impl ValidationResult {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

impl Collection {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: CollectionType) -> Self {
        Self {
            name: name.into(),
            kind,
            fields: Vec::new(),
            rules: RuleSet::default(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    #[must_use]
    pub fn is_auth(&self) -> bool {
        self.kind == CollectionType::Auth
    }

    /// Looks up a user-declared field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Resolves the type of any readable field name, including system fields.
    ///
    /// Returns `None` for names the collection does not know, which the
    /// evaluator treats as an unresolvable path.
    #[must_use]
    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        match name {
            "id" | "collectionName" => return Some(FieldType::Text),
            "created" | "updated" => return Some(FieldType::Date),
            _ => {}
        }
        if self.is_auth() {
            match name {
                "email" => return Some(FieldType::Email),
                "username" => return Some(FieldType::Text),
                "verified" => return Some(FieldType::Bool),
                _ => {}
            }
        }
        self.field(name).map(|f| f.field_type.clone())
    }

    /// Target collection of a relation field.
    #[must_use]
    pub fn relation_target(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(|f| f.field_type.relation_target())
    }

    /// Checks the structural invariants of the definition itself.
    ///
    /// Rule syntax is checked separately by
    /// [`CompiledRules::compile`](crate::access::CompiledRules::compile);
    /// relation targets need the schema store and are checked there.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate_definition(&self) -> Result<(), SchemaError> {
        if !is_valid_name(&self.name) {
            return Err(SchemaError::InvalidName(self.name.clone()));
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !is_valid_name(&field.name) {
                return Err(SchemaError::InvalidFieldName(field.name.clone()));
            }
            let reserved = SYSTEM_FIELDS.contains(&field.name.as_str())
                || (self.is_auth() && AUTH_SYSTEM_FIELDS.contains(&field.name.as_str()));
            if reserved {
                return Err(SchemaError::ReservedField(field.name.clone()));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField(field.name.clone()));
            }
        }
        Ok(())
    }

    /// Validates submitted record data against the declared fields.
    ///
    /// Unknown keys are rejected, required fields must be non-blank and
    /// present values must match the declared type.
    #[must_use]
    pub fn validate_data(&self, data: &BTreeMap<String, Value>) -> ValidationResult {
        let mut errors = BTreeMap::new();

        for key in data.keys() {
            if self.field_type(key).is_none() {
                errors.insert(key.clone(), "unknown field".to_string());
            }
        }

        for field in &self.fields {
            match data.get(&field.name) {
                None => {
                    if field.required {
                        errors.insert(field.name.clone(), "missing required value".to_string());
                    }
                }
                Some(value) if value.is_blank() => {
                    if field.required {
                        errors.insert(field.name.clone(), "missing required value".to_string());
                    }
                }
                Some(value) => {
                    if let Err(reason) = check_type(&field.field_type, value) {
                        errors.insert(field.name.clone(), reason);
                    }
                }
            }
        }

        if errors.is_empty() {
            ValidationResult::Valid
        } else {
            ValidationResult::Invalid { errors }
        }
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 100
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_type(field_type: &FieldType, value: &Value) -> Result<(), String> {
    let ok = match (field_type, value) {
        (FieldType::Text | FieldType::Email | FieldType::Url, Value::String(_))
        | (FieldType::Number, Value::Int(_) | Value::Float(_))
        | (FieldType::Bool, Value::Bool(_))
        | (FieldType::Json, _) => true,
        (FieldType::Date, Value::String(s)) => parse_datetime(s).is_some(),
        (FieldType::Select { .. } | FieldType::Relation { .. }, Value::String(_)) => true,
        (FieldType::Select { max_select } | FieldType::Relation { max_select, .. }, Value::Array(items)) => {
            if !items.iter().all(|v| matches!(v, Value::String(_))) {
                return Err("expected a list of strings".to_string());
            }
            let max = max_select.unwrap_or(1);
            if items.len() > max {
                return Err(format!("at most {max} values allowed"));
            }
            true
        }
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(format!("unexpected {} value", value.type_name()))
    }
}

/// Parses the date formats accepted in records and rules.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff][Z]` and a bare `YYYY-MM-DD`
/// (midnight UTC).
#[must_use]
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = s.strip_suffix('Z').unwrap_or(s);
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, fmt) {
            return Some(dt.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}
