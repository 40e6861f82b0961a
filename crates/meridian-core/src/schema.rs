//! Entity schemas and per-column merge rules.
//!
//! A [`Schema`] is the declared, ordered list of columns of one model. Each
//! column carries a [`MergeOperation`] that decides how two records sharing
//! an [`EntityId`] are combined:
//!
//! - [`MergeOperation::Add`]: numeric sum (commutative, associative)
//! - [`MergeOperation::Cover`]: the latest arrival replaces the stored value
//! - [`MergeOperation::Non`]: the first set value is kept (identity/key fields)
//!
//! Business code works with typed structs implementing [`Entity`]. The
//! positional [`Value`] slots exist only at the merge and serialization
//! boundaries, where the schema's declared column order is the contract.

use std::collections::HashMap;
use std::fmt;
use std::vec::IntoIter;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::MeridianError;
use crate::types::{Downsampling, EntityId};
use crate::Result;

/// Primitive type of a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Str,
    Long,
    Int,
    Double,
    Bool,
    Bytes,
}

impl ColumnType {
    /// Whether [`MergeOperation::Add`] is defined for this type.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Long | Self::Int | Self::Double)
    }
}

/// How two values of the same column are combined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeOperation {
    /// Numeric sum.
    Add,
    /// Replace with the latest arrival.
    Cover,
    /// Keep the first set value.
    Non,
}

/// A single declared column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    pub op: MergeOperation,
}

/// A typed column value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Str(String),
    Long(i64),
    Int(i32),
    Double(f64),
    Bool(bool),
    Bytes(Bytes),
}

impl Value {
    /// The column type this value belongs to.
    pub fn column_type(&self) -> ColumnType {
        match self {
            Self::Str(_) => ColumnType::Str,
            Self::Long(_) => ColumnType::Long,
            Self::Int(_) => ColumnType::Int,
            Self::Double(_) => ColumnType::Double,
            Self::Bool(_) => ColumnType::Bool,
            Self::Bytes(_) => ColumnType::Bytes,
        }
    }

    /// The zero value of a column type.
    pub fn zero(ty: ColumnType) -> Self {
        match ty {
            ColumnType::Str => Self::Str(String::new()),
            ColumnType::Long => Self::Long(0),
            ColumnType::Int => Self::Int(0),
            ColumnType::Double => Self::Double(0.0),
            ColumnType::Bool => Self::Bool(false),
            ColumnType::Bytes => Self::Bytes(Bytes::new()),
        }
    }

    /// Strings and byte sequences count as unset while empty.
    fn is_unset(&self) -> bool {
        match self {
            Self::Str(s) => s.is_empty(),
            Self::Bytes(b) => b.is_empty(),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// The declared column layout of one model.
#[derive(Clone, Debug)]
pub struct Schema {
    name: String,
    columns: Vec<Column>,
    slots: HashMap<String, usize>,
}

impl Schema {
    /// Start building a schema for the named model.
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Model name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Columns in declared order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Slot number of a named column.
    pub fn slot(&self, column: &str) -> Option<usize> {
        self.slots.get(column).copied()
    }

    /// Check the declaration itself: non-empty, unique names, `Add` only on numbers.
    pub fn check(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(MeridianError::shape(&self.name, "schema declares no columns"));
        }
        if self.slots.len() != self.columns.len() {
            return Err(MeridianError::shape(&self.name, "duplicate column names"));
        }
        for column in &self.columns {
            if column.op == MergeOperation::Add && !column.ty.is_numeric() {
                return Err(MeridianError::shape(
                    &self.name,
                    format!("column '{}' of type {:?} cannot use Add", column.name, column.ty),
                ));
            }
        }
        Ok(())
    }

    /// Verify that a value row matches the declared column count and types.
    pub fn validate(&self, values: &[Value]) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(MeridianError::shape(
                &self.name,
                format!("expected {} columns, got {}", self.columns.len(), values.len()),
            ));
        }
        for (column, value) in self.columns.iter().zip(values) {
            if value.column_type() != column.ty {
                return Err(MeridianError::shape(
                    &self.name,
                    format!(
                        "column '{}' expects {:?}, got {:?}",
                        column.name,
                        column.ty,
                        value.column_type()
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Merge `incoming` into `current` column by column.
    ///
    /// Both rows are validated first, so a mismatched row leaves `current` untouched.
    pub fn merge_values(&self, current: &mut [Value], incoming: &[Value]) -> Result<()> {
        self.validate(current)?;
        self.validate(incoming)?;
        for ((column, cur), inc) in self.columns.iter().zip(current.iter_mut()).zip(incoming) {
            match column.op {
                MergeOperation::Add => add_into(cur, inc),
                MergeOperation::Cover => *cur = inc.clone(),
                MergeOperation::Non => {
                    if cur.is_unset() {
                        *cur = inc.clone();
                    }
                }
            }
        }
        Ok(())
    }

    /// Subtract `baseline` from `current` on `Add` columns; other columns keep `current`.
    pub fn subtract_values(&self, current: &mut [Value], baseline: &[Value]) -> Result<()> {
        self.validate(current)?;
        self.validate(baseline)?;
        for ((column, cur), base) in self.columns.iter().zip(current.iter_mut()).zip(baseline) {
            if column.op == MergeOperation::Add {
                sub_from(cur, base);
            }
        }
        Ok(())
    }

    /// Zero every `Add` column, keeping `Cover` and `Non` columns.
    pub fn reset_values(&self, values: &mut [Value]) -> Result<()> {
        self.validate(values)?;
        for (column, value) in self.columns.iter().zip(values.iter_mut()) {
            if column.op == MergeOperation::Add {
                *value = Value::zero(column.ty);
            }
        }
        Ok(())
    }
}

fn add_into(cur: &mut Value, inc: &Value) {
    match (cur, inc) {
        (Value::Long(a), Value::Long(b)) => *a = a.wrapping_add(*b),
        (Value::Int(a), Value::Int(b)) => *a = a.wrapping_add(*b),
        (Value::Double(a), Value::Double(b)) => *a += *b,
        // Unreachable after validate() + check().
        _ => {}
    }
}

fn sub_from(cur: &mut Value, base: &Value) {
    match (cur, base) {
        (Value::Long(a), Value::Long(b)) => *a = a.wrapping_sub(*b),
        (Value::Int(a), Value::Int(b)) => *a = a.wrapping_sub(*b),
        (Value::Double(a), Value::Double(b)) => *a -= *b,
        _ => {}
    }
}

/// Builder for [`Schema`].
pub struct SchemaBuilder {
    name: String,
    columns: Vec<Column>,
}

impl SchemaBuilder {
    /// Append a column. Declaration order is the wire order.
    pub fn column(mut self, name: impl Into<String>, ty: ColumnType, op: MergeOperation) -> Self {
        self.columns.push(Column {
            name: name.into(),
            ty,
            op,
        });
        self
    }

    /// Finish the schema. Call [`Schema::check`] to validate the declaration.
    pub fn build(self) -> Schema {
        let slots = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        Schema {
            name: self.name,
            columns: self.columns,
            slots,
        }
    }
}

/// Sequential typed reader over a validated value row, used by
/// [`Entity::from_values`] implementations.
pub struct ValueReader {
    model: String,
    values: IntoIter<Value>,
}

impl ValueReader {
    /// Validate `values` against `schema` and prepare to read them in order.
    pub fn new(schema: &Schema, values: Vec<Value>) -> Result<Self> {
        schema.validate(&values)?;
        Ok(Self {
            model: schema.name().to_string(),
            values: values.into_iter(),
        })
    }

    fn next_value(&mut self) -> Result<Value> {
        self.values
            .next()
            .ok_or_else(|| MeridianError::shape(&self.model, "row exhausted"))
    }

    fn mismatch(&self, expected: ColumnType, found: &Value) -> MeridianError {
        MeridianError::shape(
            &self.model,
            format!("expected {:?}, read {:?}", expected, found.column_type()),
        )
    }

    pub fn string(&mut self) -> Result<String> {
        match self.next_value()? {
            Value::Str(v) => Ok(v),
            other => Err(self.mismatch(ColumnType::Str, &other)),
        }
    }

    pub fn long(&mut self) -> Result<i64> {
        match self.next_value()? {
            Value::Long(v) => Ok(v),
            other => Err(self.mismatch(ColumnType::Long, &other)),
        }
    }

    pub fn int(&mut self) -> Result<i32> {
        match self.next_value()? {
            Value::Int(v) => Ok(v),
            other => Err(self.mismatch(ColumnType::Int, &other)),
        }
    }

    pub fn double(&mut self) -> Result<f64> {
        match self.next_value()? {
            Value::Double(v) => Ok(v),
            other => Err(self.mismatch(ColumnType::Double, &other)),
        }
    }

    pub fn bool(&mut self) -> Result<bool> {
        match self.next_value()? {
            Value::Bool(v) => Ok(v),
            other => Err(self.mismatch(ColumnType::Bool, &other)),
        }
    }

    pub fn bytes(&mut self) -> Result<Bytes> {
        match self.next_value()? {
            Value::Bytes(v) => Ok(v),
            other => Err(self.mismatch(ColumnType::Bytes, &other)),
        }
    }
}

/// A schema-typed record flowing through the pipeline.
///
/// Implementors expose named fields to business code and translate to and
/// from the positional [`Value`] row in [`Schema`] declaration order. The
/// default [`merge`](Entity::merge) and [`reset`](Entity::reset) evaluate the
/// schema's merge operations on that row.
pub trait Entity:
    Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// The declared schema of this model.
    fn schema() -> &'static Schema;

    /// Identity used for aggregation and routing.
    fn id(&self) -> EntityId;

    /// Values in schema declaration order.
    fn to_values(&self) -> Vec<Value>;

    /// Rebuild an entity from values in schema declaration order.
    fn from_values(values: Vec<Value>) -> Result<Self>;

    /// Check this record against its declared schema.
    fn validate(&self) -> Result<()> {
        Self::schema().validate(&self.to_values())
    }

    /// Merge `incoming` into `self` using each column's [`MergeOperation`].
    fn merge(&mut self, incoming: &Self) -> Result<()> {
        let schema = Self::schema();
        let mut current = self.to_values();
        schema.merge_values(&mut current, &incoming.to_values())?;
        *self = Self::from_values(current)?;
        Ok(())
    }

    /// The same aggregate re-keyed to a coarser time bucket, or `None` for
    /// models that are not bucketed by minute.
    fn rebucket(&self, _to: Downsampling) -> Option<Self> {
        None
    }

    /// Zero every `Add` column.
    fn reset(&mut self) -> Result<()> {
        let schema = Self::schema();
        let mut current = self.to_values();
        schema.reset_values(&mut current)?;
        *self = Self::from_values(current)?;
        Ok(())
    }
}

/// The increment of `current` over `baseline`: `Add` columns subtracted,
/// every other column taken from `current`.
pub fn delta<E: Entity>(current: &E, baseline: &E) -> Result<E> {
    let schema = E::schema();
    let mut values = current.to_values();
    schema.subtract_values(&mut values, &baseline.to_values())?;
    E::from_values(values)
}
