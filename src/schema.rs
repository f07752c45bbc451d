//! Container schemas: the per-container table that tells the engine what a leaf stores and
//! which summaries a branch keeps.
//!
//! A schema is resolved once, when a tree is opened, and shared by every operation on it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{Result, TreeError};
use crate::packed::{FixedArray, IndexKind, PackedStream, RleSequence, VleArray};

/// One entry of a container: a value per schema stream (a symbol for run-length streams).
pub type Entry = SmallVec<[u64; 4]>;

/// Encoding of one leaf stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    /// Fixed-width values with an optional block index.
    Fixed { width: u8, index: IndexKind },
    /// LEB128 values with a SUM index.
    Vle,
    /// Run-length coded symbols of `bits` bits.
    Rle { bits: u8 },
}

impl StreamKind {
    pub(crate) fn empty(self) -> PackedStream {
        match self {
            Self::Fixed { width, index } => PackedStream::Fixed(FixedArray::new(width, index)),
            Self::Vle => PackedStream::Vle(VleArray::new()),
            Self::Rle { bits } => PackedStream::Rle(RleSequence::new(bits)),
        }
    }

    pub(crate) fn matches(self, stream: &PackedStream) -> bool {
        match (self, stream) {
            (Self::Fixed { width, index }, PackedStream::Fixed(array)) => {
                array.width() == width && array.index_kind() == index
            }
            (Self::Vle, PackedStream::Vle(_)) => true,
            (Self::Rle { bits }, PackedStream::Rle(seq)) => seq.bits() == bits,
            _ => false,
        }
    }
}

/// Aggregate a summary column keeps about a subtree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    /// Number of entries.
    Count,
    /// Sum of the stream's values.
    Sum,
    /// Largest value of the stream.
    Max,
    /// Occurrences of one symbol of a run-length stream.
    Symbol(u8),
}

/// How child values of a column combine into the parent's value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Combinator {
    Sum,
    Max,
}

impl ColumnKind {
    pub fn combinator(self) -> Combinator {
        match self {
            Self::Max => Combinator::Max,
            Self::Count | Self::Sum | Self::Symbol(_) => Combinator::Sum,
        }
    }

    /// Branch column arrays are indexed the way their values combine.
    pub(crate) fn index_kind(self) -> IndexKind {
        match self.combinator() {
            Combinator::Sum => IndexKind::Sum,
            Combinator::Max => IndexKind::Max,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub stream: usize,
    pub kind: ColumnKind,
}

impl Column {
    pub const fn new(stream: usize, kind: ColumnKind) -> Self {
        Self { stream, kind }
    }
}

/// Shape of a container: leaf streams, branch summary columns and the search key.
///
/// Every entry holds one value per stream. Column 0 always counts the entries of stream 0.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub id: u32,
    pub name: String,
    pub streams: Vec<StreamKind>,
    pub columns: Vec<Column>,
    /// Column searched by `find`; must be a `Max` column when `sorted`.
    pub key_column: Option<usize>,
    /// Entries are kept in non-decreasing key order.
    pub sorted: bool,
}

impl Schema {
    pub const ORDERED_SET: u32 = 1;
    pub const MAP: u32 = 2;
    pub const VECTOR: u32 = 3;
    pub const VLE_VECTOR: u32 = 4;
    pub const SEQUENCE: u32 = 5;

    /// Sorted set of `u64` keys.
    pub fn ordered_set() -> Self {
        Self {
            id: Self::ORDERED_SET,
            name: "ordered_set".to_string(),
            streams: vec![StreamKind::Fixed {
                width: 8,
                index: IndexKind::Max,
            }],
            columns: vec![Column::new(0, ColumnKind::Count), Column::new(0, ColumnKind::Max)],
            key_column: Some(1),
            sorted: true,
        }
    }

    /// Sorted map from `u64` keys to variable-length `u64` values.
    pub fn map() -> Self {
        Self {
            id: Self::MAP,
            name: "map".to_string(),
            streams: vec![
                StreamKind::Fixed {
                    width: 8,
                    index: IndexKind::Max,
                },
                StreamKind::Vle,
            ],
            columns: vec![
                Column::new(0, ColumnKind::Count),
                Column::new(0, ColumnKind::Max),
                Column::new(1, ColumnKind::Sum),
            ],
            key_column: Some(1),
            sorted: true,
        }
    }

    /// Positional vector of fixed-width values with prefix sums.
    pub fn vector() -> Self {
        Self {
            id: Self::VECTOR,
            name: "vector".to_string(),
            streams: vec![StreamKind::Fixed {
                width: 8,
                index: IndexKind::Sum,
            }],
            columns: vec![Column::new(0, ColumnKind::Count), Column::new(0, ColumnKind::Sum)],
            key_column: None,
            sorted: false,
        }
    }

    /// Positional vector of variable-length values with prefix sums.
    pub fn vle_vector() -> Self {
        Self {
            id: Self::VLE_VECTOR,
            name: "vle_vector".to_string(),
            streams: vec![StreamKind::Vle],
            columns: vec![Column::new(0, ColumnKind::Count), Column::new(0, ColumnKind::Sum)],
            key_column: None,
            sorted: false,
        }
    }

    /// Symbol sequence over a 4-symbol alphabet.
    pub fn sequence() -> Self {
        Self::symbol_sequence(Self::SEQUENCE, "sequence", 2)
    }

    /// Symbol sequence of `bits`-bit symbols with one rank column per symbol.
    pub fn symbol_sequence(id: u32, name: &str, bits: u8) -> Self {
        let mut columns = vec![Column::new(0, ColumnKind::Count)];
        columns.extend((0..1u8 << bits.min(4)).map(|symbol| Column::new(0, ColumnKind::Symbol(symbol))));
        Self {
            id,
            name: name.to_string(),
            streams: vec![StreamKind::Rle { bits }],
            columns,
            key_column: None,
            sorted: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(TreeError::InvalidSchema(format!("{}: {reason}", self.name)));

        if self.streams.is_empty() {
            return invalid("no streams".to_string());
        }
        if self.columns.first() != Some(&Column::new(0, ColumnKind::Count)) {
            return invalid("column 0 must count stream 0".to_string());
        }
        for (idx, stream) in self.streams.iter().enumerate() {
            match *stream {
                StreamKind::Fixed { width, .. } if !(1..=8).contains(&width) => {
                    return invalid(format!("stream {idx} has width {width}"));
                }
                StreamKind::Rle { bits } if !(1..=4).contains(&bits) => {
                    return invalid(format!("stream {idx} has {bits}-bit symbols"));
                }
                _ => {}
            }
        }
        for (idx, column) in self.columns.iter().enumerate() {
            let Some(stream) = self.streams.get(column.stream) else {
                return invalid(format!("column {idx} names missing stream {}", column.stream));
            };
            let ok = match (column.kind, *stream) {
                (ColumnKind::Count, _) => true,
                (ColumnKind::Sum, StreamKind::Fixed { index, .. }) => index == IndexKind::Sum,
                (ColumnKind::Sum, StreamKind::Vle) => true,
                (ColumnKind::Max, StreamKind::Fixed { index, .. }) => index == IndexKind::Max,
                (ColumnKind::Symbol(symbol), StreamKind::Rle { bits }) => symbol < (1 << bits),
                _ => false,
            };
            if !ok {
                return invalid(format!("column {idx} ({:?}) does not fit stream {}", column.kind, column.stream));
            }
        }
        if let Some(key) = self.key_column {
            match self.columns.get(key) {
                Some(column) if column.kind == ColumnKind::Max => {}
                _ => return invalid(format!("key column {key} must be a Max column")),
            }
        } else if self.sorted {
            return invalid("sorted schema needs a key column".to_string());
        }
        Ok(())
    }

    /// Number of values in one entry.
    pub fn arity(&self) -> usize {
        self.streams.len()
    }

    /// Stream holding the search key.
    pub fn key_stream(&self) -> Option<usize> {
        self.key_column.map(|column| self.columns[column].stream)
    }

    /// Column counting occurrences of `symbol`.
    pub fn symbol_column(&self, symbol: u8) -> Option<usize> {
        self.columns.iter().position(|column| column.kind == ColumnKind::Symbol(symbol))
    }

    /// First `Sum` column over `stream`.
    pub fn sum_column(&self, stream: usize) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.stream == stream && column.kind == ColumnKind::Sum)
    }

    /// Stream holding run-length symbols when it is the schema's only stream.
    pub(crate) fn run_stream(&self) -> Option<usize> {
        match self.streams.as_slice() {
            [StreamKind::Rle { .. }] => Some(0),
            _ => None,
        }
    }
}

/// Registry of schemas, looked up by name or by the id stored in every node header.
///
/// Built once and passed to whatever needs to interpret blocks of several container types.
#[derive(Clone, Debug, Default)]
pub struct SchemaRegistry {
    by_id: BTreeMap<u32, Arc<Schema>>,
    by_name: BTreeMap<String, u32>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every stock schema.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for schema in [
            Schema::ordered_set(),
            Schema::map(),
            Schema::vector(),
            Schema::vle_vector(),
            Schema::sequence(),
        ] {
            // Stock schemas are valid and have distinct ids and names.
            let _ = registry.register(schema);
        }
        registry
    }

    pub fn register(&mut self, schema: Schema) -> Result<Arc<Schema>> {
        schema.validate()?;
        if self.by_id.contains_key(&schema.id) || self.by_name.contains_key(&schema.name) {
            return Err(TreeError::DuplicateSchema(schema.name));
        }
        let schema = Arc::new(schema);
        self.by_name.insert(schema.name.clone(), schema.id);
        self.by_id.insert(schema.id, Arc::clone(&schema));
        Ok(schema)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Schema>> {
        self.by_name
            .get(name)
            .and_then(|id| self.by_id.get(id))
            .cloned()
            .ok_or_else(|| TreeError::UnknownSchema(name.to_string()))
    }

    pub fn by_id(&self, id: u32) -> Result<Arc<Schema>> {
        self.by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| TreeError::UnknownSchema(format!("id {id}")))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
