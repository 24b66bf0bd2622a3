//! Change descriptors: one versioned, immutable unit of schema change.

use std::collections::BTreeMap;
use std::fmt;

use crate::core::{MigrationError, Result};
use crate::schema::{self, Blueprint, Footprint, SchemaOperation};

/// Reverse half of a descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum Down {
    Reversible(Vec<SchemaOperation>),
    /// The change has no valid inverse; rolling it back is refused.
    Irreversible,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeDescriptor {
    id: String,
    up: Vec<SchemaOperation>,
    down: Down,
}

impl ChangeDescriptor {
    pub fn new(id: impl Into<String>, up: Vec<SchemaOperation>, down: Vec<SchemaOperation>) -> Self {
        Self {
            id: id.into(),
            up,
            down: Down::Reversible(down),
        }
    }

    pub fn irreversible(id: impl Into<String>, up: Vec<SchemaOperation>) -> Self {
        Self {
            id: id.into(),
            up,
            down: Down::Irreversible,
        }
    }

    /// Creates the blueprint's table; the reverse drops that same table.
    pub fn create_table(id: impl Into<String>, blueprint: Blueprint) -> Self {
        let table = blueprint.table_name().to_string();
        Self::new(
            id,
            blueprint.into_operations(),
            vec![SchemaOperation::drop_table_if_exists(table)],
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn up(&self) -> &[SchemaOperation] {
        &self.up
    }

    pub fn down(&self) -> &Down {
        &self.down
    }

    pub fn is_reversible(&self) -> bool {
        matches!(self.down, Down::Reversible(_))
    }

    /// Checks that the descriptor is well formed and that `down` undoes exactly the
    /// objects `up` touches.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(MigrationError::invalid(&self.id, "id must not be empty"));
        }
        if self.id.chars().any(char::is_whitespace) {
            return Err(MigrationError::invalid(&self.id, "id must not contain whitespace"));
        }
        if self.up.is_empty() {
            return Err(MigrationError::invalid(&self.id, "up has no operations"));
        }

        let up = self.normalized(&self.up)?;
        let down = match &self.down {
            Down::Irreversible => return Ok(()),
            Down::Reversible(ops) if ops.is_empty() => {
                return Err(MigrationError::invalid(
                    &self.id,
                    "down has no operations; mark the migration irreversible instead",
                ));
            }
            Down::Reversible(ops) => self.normalized(ops)?,
        };

        let mut expected: Vec<Footprint> = schema::footprints(&up)
            .iter()
            .map(Footprint::inverse)
            .collect();
        expected.sort();
        let actual = schema::footprints(&down);

        if expected != actual {
            return Err(MigrationError::invalid(
                &self.id,
                format!(
                    "down does not reverse up: expected [{}], found [{}]",
                    join(&expected),
                    join(&actual)
                ),
            ));
        }
        Ok(())
    }

    fn normalized(&self, ops: &[SchemaOperation]) -> Result<Vec<SchemaOperation>> {
        let mut out = Vec::with_capacity(ops.len());
        for op in ops {
            let expanded = op
                .normalize()
                .map_err(|e| MigrationError::invalid(&self.id, e.to_string()))?;
            out.extend(expanded);
        }
        Ok(out)
    }
}

impl fmt::Display for ChangeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

fn join(footprints: &[Footprint]) -> String {
    footprints
        .iter()
        .map(|fp| fp.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Every descriptor the application knows about, keyed and ordered by id.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSet {
    descriptors: BTreeMap<String, ChangeDescriptor>,
}

impl DescriptorSet {
    /// Validates and registers all descriptors; the first invalid one aborts.
    pub fn new(descriptors: impl IntoIterator<Item = ChangeDescriptor>) -> Result<Self> {
        let mut set = Self::default();
        for descriptor in descriptors {
            set.register(descriptor)?;
        }
        Ok(set)
    }

    pub fn register(&mut self, descriptor: ChangeDescriptor) -> Result<()> {
        descriptor.validate()?;
        if self.descriptors.contains_key(descriptor.id()) {
            return Err(MigrationError::invalid(descriptor.id(), "duplicate migration id"));
        }
        self.descriptors.insert(descriptor.id().to_string(), descriptor);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ChangeDescriptor> {
        self.descriptors.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.descriptors.contains_key(id)
    }

    /// Descriptors in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &ChangeDescriptor> {
        self.descriptors.values()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
