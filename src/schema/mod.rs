//! Table-driven property updates.
//!
//! Each entity type owns one static table from upper-case wire name to a
//! typed accessor. The table is built on first use and shared afterwards, so
//! applying `CALL 42 DURATION 17` is one hash lookup plus a parse.

use crate::protocol::DecodeError;
use std::collections::HashMap;
use thiserror::Error;

pub trait Entity: Sized + 'static {
    /// Wire name of the entity class, used in logs and errors.
    const KIND: &'static str;

    fn schema() -> &'static Schema<Self>;
}

/// Follow-up query an accessor wants sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependentFetch {
    pub property: &'static str,
    pub argument: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("index {index} outside 1..={len}")]
    OutOfRange { index: usize, len: usize },
    #[error("{value} exceeds the maximum of {max}")]
    TooLarge { value: u64, max: u64 },
    #[error("malformed value")]
    Malformed,
}

pub enum Accessor<E> {
    /// Raw text; a missing value clears the field.
    Text(fn(&mut E, Option<String>)),
    /// Unsigned integer.
    Number(fn(&mut E, u64)),
    /// Unsigned integer whose change may resize state and request follow-ups.
    Count(fn(&mut E, u64) -> Result<Vec<DependentFetch>, FieldError>),
    /// Slot assignment; the 1-based index is the token at `index_at` of the value.
    Indexed {
        index_at: usize,
        apply: fn(&mut E, usize, &str) -> Result<(), FieldError>,
    },
}

pub struct Schema<E> {
    accessors: HashMap<&'static str, Accessor<E>>,
}

impl<E: Entity> Schema<E> {
    pub fn builder() -> SchemaBuilder<E> {
        SchemaBuilder {
            accessors: HashMap::new(),
        }
    }

    /// Case-insensitive lookup.
    pub fn accessor(&self, property: &str) -> Option<&Accessor<E>> {
        self.accessors.get(property.to_ascii_uppercase().as_str())
    }

    pub fn properties(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.accessors.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.accessors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accessors.is_empty()
    }
}

pub struct SchemaBuilder<E> {
    accessors: HashMap<&'static str, Accessor<E>>,
}

impl<E: Entity> SchemaBuilder<E> {
    pub fn text(mut self, name: &'static str, set: fn(&mut E, Option<String>)) -> Self {
        self.accessors.insert(name, Accessor::Text(set));
        self
    }

    pub fn number(mut self, name: &'static str, set: fn(&mut E, u64)) -> Self {
        self.accessors.insert(name, Accessor::Number(set));
        self
    }

    pub fn count(
        mut self,
        name: &'static str,
        set: fn(&mut E, u64) -> Result<Vec<DependentFetch>, FieldError>,
    ) -> Self {
        self.accessors.insert(name, Accessor::Count(set));
        self
    }

    pub fn indexed(
        mut self,
        name: &'static str,
        index_at: usize,
        apply: fn(&mut E, usize, &str) -> Result<(), FieldError>,
    ) -> Self {
        self.accessors
            .insert(name, Accessor::Indexed { index_at, apply });
        self
    }

    pub fn build(self) -> Schema<E> {
        Schema {
            accessors: self.accessors,
        }
    }
}

/// Applies one named property to `entity`.
///
/// Unknown names and conversion failures leave the entity untouched.
pub fn update<E: Entity>(
    entity: &mut E,
    property: &str,
    raw: Option<&str>,
) -> Result<Vec<DependentFetch>, DecodeError> {
    let accessor = E::schema()
        .accessor(property)
        .ok_or_else(|| DecodeError::UnknownProperty {
            entity: E::KIND,
            property: property.to_string(),
        })?;

    match accessor {
        Accessor::Text(set) => {
            set(entity, raw.map(str::to_string));
            Ok(Vec::new())
        }
        Accessor::Number(set) => {
            let value = parse_number(property, raw)?;
            set(entity, value);
            Ok(Vec::new())
        }
        Accessor::Count(set) => {
            let value = parse_number(property, raw)?;
            set(entity, value).map_err(|err| invalid(property, &value.to_string(), err))
        }
        Accessor::Indexed { index_at, apply } => {
            let raw = require(property, raw)?;
            let index = raw
                .split(' ')
                .nth(*index_at)
                .and_then(|token| token.parse::<usize>().ok())
                .ok_or_else(|| invalid(property, raw, FieldError::Malformed))?;
            apply(entity, index, raw).map_err(|err| invalid(property, raw, err))?;
            Ok(Vec::new())
        }
    }
}

fn require<'a>(property: &str, raw: Option<&'a str>) -> Result<&'a str, DecodeError> {
    raw.ok_or_else(|| DecodeError::MissingValue {
        property: property.to_string(),
    })
}

fn parse_number(property: &str, raw: Option<&str>) -> Result<u64, DecodeError> {
    let raw = require(property, raw)?;
    raw.trim().parse::<u64>().map_err(|err| DecodeError::InvalidValue {
        property: property.to_string(),
        value: raw.to_string(),
        reason: err.to_string(),
    })
}

fn invalid(property: &str, value: &str, err: FieldError) -> DecodeError {
    DecodeError::InvalidValue {
        property: property.to_string(),
        value: value.to_string(),
        reason: err.to_string(),
    }
}
