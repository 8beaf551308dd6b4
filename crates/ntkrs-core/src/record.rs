//! Record registration: custom aggregate types as tree nodes
//!
//! A [`Record`] declares its fields through [`FieldSpec`]s. Data fields hold
//! structured values and take part in flattening and differentiation; meta
//! fields hold static configuration (flags, sizes, names) that is carried
//! through a [`RecordDef`] but never appears among the leaves.
//!
//! Three operations make up the capability:
//!
//! * [`flatten_record`] produces the data leaves plus a `RecordDef`
//! * [`unflatten_record`] rebuilds the record from a `RecordDef` and leaves
//! * [`replace`] returns a copy with some fields swapped out
//!
//! [`TreeRegistry`] stores the same three operations type-erased and keyed by
//! record type name, so code that only sees `&dyn Any` can still flatten.
//!
//! # Examples
//!
//! ```
//! use ntkrs_core::dense::DenseND;
//! use ntkrs_core::error::NtkResult;
//! use ntkrs_core::record::{self, FieldSpec, FieldValue, MetaValue, Record};
//! use ntkrs_core::tree::NtTree;
//!
//! #[derive(Clone, Debug, PartialEq)]
//! struct Scaled {
//!     value: DenseND<f64>,
//!     frozen: bool,
//! }
//!
//! impl Record<f64> for Scaled {
//!     const TYPE_NAME: &'static str = "Scaled";
//!
//!     fn fields() -> &'static [FieldSpec] {
//!         const FIELDS: [FieldSpec; 2] = [FieldSpec::data("value"), FieldSpec::meta("frozen")];
//!         &FIELDS
//!     }
//!
//!     fn to_fields(&self) -> Vec<FieldValue<f64>> {
//!         vec![
//!             FieldValue::Data(NtTree::leaf(self.value.clone())),
//!             FieldValue::Meta(MetaValue::Bool(self.frozen)),
//!         ]
//!     }
//!
//!     fn from_fields(fields: Vec<FieldValue<f64>>) -> NtkResult<Self> {
//!         let mut it = fields.into_iter();
//!         let value = record::take_leaf(it.next(), "value")?;
//!         let frozen = record::take_bool(it.next(), "frozen")?;
//!         Ok(Self { value, frozen })
//!     }
//! }
//!
//! let s = Scaled { value: DenseND::ones(&[2]), frozen: true };
//! let (leaves, def) = record::flatten_record(&s);
//! assert_eq!(leaves.len(), 1);
//!
//! let back: Scaled = record::unflatten_record(&def, leaves).unwrap();
//! assert_eq!(back, s);
//! ```

use crate::dense::DenseND;
use crate::error::{NtkError, NtkResult};
use crate::tree::{NtTree, StructuredValue, TreeDef};
use crate::types::Scalar;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;

/// Static (non-participating) field value
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    /// Boolean flag
    Bool(bool),
    /// Integer setting
    Int(i64),
    /// Floating-point setting
    Float(f64),
    /// Text setting
    Text(String),
}

/// Value of one record field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue<T> {
    /// Participates in flattening
    Data(StructuredValue<T>),
    /// Carried as auxiliary metadata
    Meta(MetaValue),
}

/// Declaration of one record field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Field name
    pub name: &'static str,
    /// Whether the field is a tree node (data) or metadata
    pub tree_node: bool,
}

impl FieldSpec {
    /// A data field
    pub const fn data(name: &'static str) -> Self {
        Self {
            name,
            tree_node: true,
        }
    }

    /// A metadata field
    pub const fn meta(name: &'static str) -> Self {
        Self {
            name,
            tree_node: false,
        }
    }
}

/// A record type that can be flattened into tensor leaves
pub trait Record<T: Scalar>: Clone + Send + Sync + 'static {
    /// Registry key
    const TYPE_NAME: &'static str;

    /// Field declarations, in declaration order
    fn fields() -> &'static [FieldSpec];

    /// Current field values, in declaration order
    fn to_fields(&self) -> Vec<FieldValue<T>>;

    /// Build from field values in declaration order
    fn from_fields(fields: Vec<FieldValue<T>>) -> NtkResult<Self>;
}

/// Auxiliary data needed to rebuild a flattened record
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDef {
    /// Record type name
    pub type_name: &'static str,
    /// Metadata fields with their values
    pub meta: Vec<(&'static str, MetaValue)>,
    /// Data fields with their tree structure
    pub data: Vec<(&'static str, TreeDef)>,
}

impl RecordDef {
    /// Total number of leaves across data fields
    pub fn num_leaves(&self) -> usize {
        self.data.iter().map(|(_, d)| d.num_leaves()).sum()
    }
}

fn check_arity<T: Scalar, R: Record<T>>(values: &[FieldValue<T>]) -> NtkResult<()> {
    if values.len() != R::fields().len() {
        return Err(NtkError::structure_mismatch(format!(
            "{} declares {} fields, produced {}",
            R::TYPE_NAME,
            R::fields().len(),
            values.len()
        )));
    }
    Ok(())
}

/// Flatten a record into its data leaves and a [`RecordDef`]
pub fn flatten_record<T: Scalar, R: Record<T>>(record: &R) -> (Vec<DenseND<T>>, RecordDef) {
    let mut leaves = Vec::new();
    let mut def = RecordDef {
        type_name: R::TYPE_NAME,
        meta: Vec::new(),
        data: Vec::new(),
    };
    for (spec, value) in R::fields().iter().zip(record.to_fields()) {
        match value {
            FieldValue::Data(tree) => {
                let (mut l, d) = tree.flatten();
                leaves.append(&mut l);
                def.data.push((spec.name, d));
            }
            FieldValue::Meta(m) => def.meta.push((spec.name, m)),
        }
    }
    (leaves, def)
}

/// Rebuild a record from a [`RecordDef`] and leaves
pub fn unflatten_record<T: Scalar, R: Record<T>>(
    def: &RecordDef,
    leaves: Vec<DenseND<T>>,
) -> NtkResult<R> {
    if def.type_name != R::TYPE_NAME {
        return Err(NtkError::structure_mismatch(format!(
            "record definition is for {}, not {}",
            def.type_name,
            R::TYPE_NAME
        )));
    }
    if leaves.len() != def.num_leaves() {
        return Err(NtkError::structure_mismatch(format!(
            "{} expects {} leaves, got {}",
            R::TYPE_NAME,
            def.num_leaves(),
            leaves.len()
        )));
    }
    let mut leaves = leaves.into_iter();
    let mut data = def.data.iter();
    let mut meta = def.meta.iter();
    let mut values = Vec::with_capacity(R::fields().len());
    for spec in R::fields() {
        if spec.tree_node {
            let (name, tree_def) = data
                .next()
                .ok_or_else(|| NtkError::structure_mismatch("missing data field"))?;
            if *name != spec.name {
                return Err(NtkError::structure_mismatch(format!(
                    "expected data field {}, found {}",
                    spec.name, name
                )));
            }
            let chunk: Vec<_> = leaves.by_ref().take(tree_def.num_leaves()).collect();
            values.push(FieldValue::Data(tree_def.unflatten(chunk)?));
        } else {
            let (name, value) = meta
                .next()
                .ok_or_else(|| NtkError::structure_mismatch("missing meta field"))?;
            if *name != spec.name {
                return Err(NtkError::structure_mismatch(format!(
                    "expected meta field {}, found {}",
                    spec.name, name
                )));
            }
            values.push(FieldValue::Meta(value.clone()));
        }
    }
    R::from_fields(values)
}

/// Copy of `record` with the named fields replaced
///
/// Data fields accept any structured value, meta fields any metadata value;
/// swapping one kind for the other is rejected.
pub fn replace<T: Scalar, R: Record<T>>(
    record: &R,
    updates: Vec<(&str, FieldValue<T>)>,
) -> NtkResult<R> {
    let mut values = record.to_fields();
    check_arity::<T, R>(&values)?;
    for (name, value) in updates {
        let idx = R::fields()
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| {
                NtkError::structure_mismatch(format!("{} has no field {}", R::TYPE_NAME, name))
            })?;
        let kind_matches = matches!(
            (R::fields()[idx].tree_node, &value),
            (true, FieldValue::Data(_)) | (false, FieldValue::Meta(_))
        );
        if !kind_matches {
            return Err(NtkError::structure_mismatch(format!(
                "field {}.{} cannot change between data and metadata",
                R::TYPE_NAME,
                name
            )));
        }
        values[idx] = value;
    }
    R::from_fields(values)
}

/// Field names paired with their values
pub fn as_fields<T: Scalar, R: Record<T>>(record: &R) -> Vec<(&'static str, FieldValue<T>)> {
    R::fields()
        .iter()
        .map(|f| f.name)
        .zip(record.to_fields())
        .collect()
}

/// Data fields only, as a tuple tree in declaration order
pub fn to_data_tree<T: Scalar, R: Record<T>>(record: &R) -> StructuredValue<T> {
    NtTree::Tuple(
        record
            .to_fields()
            .into_iter()
            .filter_map(|v| match v {
                FieldValue::Data(t) => Some(t),
                FieldValue::Meta(_) => None,
            })
            .collect(),
    )
}

/// Rebuild a record from a data tuple produced by [`to_data_tree`] and its metadata
pub fn from_data_tree<T: Scalar, R: Record<T>>(
    tree: &StructuredValue<T>,
    meta: Vec<MetaValue>,
) -> NtkResult<R> {
    let data = tree.children().ok_or_else(|| {
        NtkError::structure_mismatch(format!("{} data must be a tuple", R::TYPE_NAME))
    })?;
    let mut data = data.iter();
    let mut meta = meta.into_iter();
    let mut values = Vec::with_capacity(R::fields().len());
    for spec in R::fields() {
        let value = if spec.tree_node {
            data.next().cloned().map(FieldValue::Data)
        } else {
            meta.next().map(FieldValue::Meta)
        };
        values.push(value.ok_or_else(|| {
            NtkError::structure_mismatch(format!("{}.{} is missing", R::TYPE_NAME, spec.name))
        })?);
    }
    if data.next().is_some() || meta.next().is_some() {
        return Err(NtkError::structure_mismatch(format!(
            "too many fields for {}",
            R::TYPE_NAME
        )));
    }
    R::from_fields(values)
}

/// Extract a single-leaf data field
pub fn take_leaf<T: Scalar>(value: Option<FieldValue<T>>, name: &str) -> NtkResult<DenseND<T>> {
    match value {
        Some(FieldValue::Data(NtTree::Leaf(t))) => Ok(t),
        _ => Err(NtkError::structure_mismatch(format!(
            "field {} must be a single tensor",
            name
        ))),
    }
}

/// Extract a data field of any structure
pub fn take_tree<T: Scalar>(
    value: Option<FieldValue<T>>,
    name: &str,
) -> NtkResult<StructuredValue<T>> {
    match value {
        Some(FieldValue::Data(t)) => Ok(t),
        _ => Err(NtkError::structure_mismatch(format!(
            "field {} must be a data field",
            name
        ))),
    }
}

/// Extract a boolean metadata field
pub fn take_bool<T>(value: Option<FieldValue<T>>, name: &str) -> NtkResult<bool> {
    match value {
        Some(FieldValue::Meta(MetaValue::Bool(b))) => Ok(b),
        _ => Err(NtkError::structure_mismatch(format!(
            "field {} must be a boolean",
            name
        ))),
    }
}

type FlattenFn<T> = fn(&dyn Any) -> NtkResult<(Vec<DenseND<T>>, RecordDef)>;
type UnflattenFn<T> = fn(&RecordDef, Vec<DenseND<T>>) -> NtkResult<Box<dyn Any + Send + Sync>>;
type WithFieldsFn<T> =
    fn(&dyn Any, Vec<(&str, FieldValue<T>)>) -> NtkResult<Box<dyn Any + Send + Sync>>;

struct RegistryEntry<T> {
    flatten: FlattenFn<T>,
    unflatten: UnflattenFn<T>,
    with_fields: WithFieldsFn<T>,
}

/// Type-erased flatten, unflatten and field-update functions keyed by record type name
pub struct TreeRegistry<T> {
    entries: HashMap<&'static str, RegistryEntry<T>>,
}

impl<T: Scalar> Default for TreeRegistry<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> fmt::Debug for TreeRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("TreeRegistry").field("types", &names).finish()
    }
}

fn downcast<'a, R: 'static>(value: &'a dyn Any, name: &str) -> NtkResult<&'a R> {
    value
        .downcast_ref::<R>()
        .ok_or_else(|| NtkError::structure_mismatch(format!("value is not a {}", name)))
}

fn erased_flatten<T: Scalar, R: Record<T>>(
    value: &dyn Any,
) -> NtkResult<(Vec<DenseND<T>>, RecordDef)> {
    Ok(flatten_record::<T, R>(downcast::<R>(value, R::TYPE_NAME)?))
}

fn erased_unflatten<T: Scalar, R: Record<T>>(
    def: &RecordDef,
    leaves: Vec<DenseND<T>>,
) -> NtkResult<Box<dyn Any + Send + Sync>> {
    Ok(Box::new(unflatten_record::<T, R>(def, leaves)?))
}

fn erased_with_fields<T: Scalar, R: Record<T>>(
    value: &dyn Any,
    updates: Vec<(&str, FieldValue<T>)>,
) -> NtkResult<Box<dyn Any + Send + Sync>> {
    Ok(Box::new(replace::<T, R>(
        downcast::<R>(value, R::TYPE_NAME)?,
        updates,
    )?))
}

impl<T: Scalar> TreeRegistry<T> {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record type; re-registering replaces the entry
    pub fn register<R: Record<T>>(&mut self) -> &mut Self {
        self.entries.insert(
            R::TYPE_NAME,
            RegistryEntry {
                flatten: erased_flatten::<T, R>,
                unflatten: erased_unflatten::<T, R>,
                with_fields: erased_with_fields::<T, R>,
            },
        );
        self
    }

    /// Whether `type_name` is registered
    pub fn contains(&self, type_name: &str) -> bool {
        self.entries.contains_key(type_name)
    }

    fn entry(&self, type_name: &str) -> NtkResult<&RegistryEntry<T>> {
        self.entries.get(type_name).ok_or_else(|| {
            NtkError::structure_mismatch(format!("{} is not a registered record", type_name))
        })
    }

    /// Flatten a registered record
    pub fn flatten(
        &self,
        type_name: &str,
        value: &dyn Any,
    ) -> NtkResult<(Vec<DenseND<T>>, RecordDef)> {
        (self.entry(type_name)?.flatten)(value)
    }

    /// Rebuild a registered record
    pub fn unflatten(
        &self,
        def: &RecordDef,
        leaves: Vec<DenseND<T>>,
    ) -> NtkResult<Box<dyn Any + Send + Sync>> {
        (self.entry(def.type_name)?.unflatten)(def, leaves)
    }

    /// Immutable field update of a registered record
    pub fn with_fields(
        &self,
        type_name: &str,
        value: &dyn Any,
        updates: Vec<(&str, FieldValue<T>)>,
    ) -> NtkResult<Box<dyn Any + Send + Sync>> {
        (self.entry(type_name)?.with_fields)(value, updates)
    }
}
