use bytes::Bytes;
use smallvec::SmallVec;

use super::summary::Summary;
use crate::block::BlockId;
use crate::error::{Result, TreeError};
use crate::packed::{read_u16, read_u32, read_u64, FixedArray, IndexKind, PackedStream};
use crate::schema::{Column, ColumnKind, Combinator, Entry, Schema};

pub(crate) const MAGIC: [u8; 4] = *b"PKTN";
pub(crate) const VERSION: u8 = 1;
pub(crate) const HEADER_SIZE: usize = 32;

const KIND_LEAF: u8 = 1;
const KIND_BRANCH: u8 = 2;

/// Fields of a node header that can be read without knowing the node's schema.
///
/// Layout (32 bytes, then one `u32` length per stream):
/// - magic: 4 bytes (`PKTN`)
/// - version: 1 byte
/// - kind: 1 byte (1 = leaf, 2 = branch)
/// - level: 2 bytes (0 for leaves)
/// - schema id: 4 bytes
/// - stream count: 2 bytes
/// - reserved: 2 bytes
/// - generation: 8 bytes
/// - payload length: 4 bytes
/// - reserved: 4 bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct NodeHeader {
    pub(crate) is_leaf: bool,
    pub(crate) level: u16,
    pub(crate) schema_id: u32,
    pub(crate) stream_count: usize,
    pub(crate) generation: u64,
}

impl NodeHeader {
    /// Parses and validates the fixed header of a node block.
    pub(crate) fn parse(id: BlockId, data: &[u8]) -> Result<Self> {
        let format = |reason: String| TreeError::Format { block: id, reason };
        if data.len() < HEADER_SIZE {
            return Err(format(format!("block holds {} bytes, less than a node header", data.len())));
        }
        if data[..4] != MAGIC {
            return Err(format("bad magic".to_string()));
        }
        if data[4] != VERSION {
            return Err(format(format!("unsupported node version {}", data[4])));
        }
        let is_leaf = match data[5] {
            KIND_LEAF => true,
            KIND_BRANCH => false,
            kind => return Err(format(format!("unknown node kind {kind}"))),
        };
        let level = read_u16(data, 6)?;
        if is_leaf != (level == 0) {
            return Err(format(format!("level {level} does not match node kind")));
        }
        let payload = read_u32(data, 24)? as usize;
        if data.len() != HEADER_SIZE + payload {
            return Err(format(format!(
                "payload of {payload} bytes does not match block of {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            is_leaf,
            level,
            schema_id: read_u32(data, 8)?,
            stream_count: usize::from(read_u16(data, 12)?),
            generation: read_u64(data, 16)?,
        })
    }
}

/// Splits a node block into its header and its raw streams.
pub(crate) fn raw_streams(id: BlockId, data: &Bytes) -> Result<(NodeHeader, Vec<Bytes>)> {
    let header = NodeHeader::parse(id, data)?;
    let table_end = HEADER_SIZE + 4 * header.stream_count;
    if data.len() < table_end {
        return Err(TreeError::Format {
            block: id,
            reason: format!("stream table of {} entries runs past the block", header.stream_count),
        });
    }
    let mut streams = Vec::with_capacity(header.stream_count);
    let mut at = table_end;
    for idx in 0..header.stream_count {
        let len = read_u32(data, HEADER_SIZE + 4 * idx)? as usize;
        if at + len > data.len() {
            return Err(TreeError::Format {
                block: id,
                reason: format!("stream {idx} runs past the block"),
            });
        }
        streams.push(data.slice(at..at + len));
        at += len;
    }
    if at != data.len() {
        return Err(TreeError::Format {
            block: id,
            reason: "trailing bytes after last stream".to_string(),
        });
    }
    Ok((header, streams))
}

/// Child identifiers of a node block, read without its schema. Leaves have none.
pub(crate) fn child_ids(id: BlockId, data: &Bytes) -> Result<Vec<BlockId>> {
    let (header, streams) = raw_streams(id, data)?;
    if header.is_leaf {
        return Ok(Vec::new());
    }
    let Some(children) = streams.last() else {
        return Err(TreeError::Format {
            block: id,
            reason: "branch without a child stream".to_string(),
        });
    };
    decode_children(id, children.clone())
}

fn decode_children(id: BlockId, data: Bytes) -> Result<Vec<BlockId>> {
    let array = FixedArray::from_bytes(data)?;
    if array.width() != 8 || array.index_kind() != IndexKind::None {
        return Err(TreeError::Format {
            block: id,
            reason: "child stream has the wrong layout".to_string(),
        });
    }
    array
        .iter()
        .map(|raw| {
            BlockId::from_raw(raw).ok_or_else(|| TreeError::Format {
                block: id,
                reason: "null child reference".to_string(),
            })
        })
        .collect()
}

fn encode(kind: u8, level: u16, schema_id: u32, generation: u64, streams: &[&Bytes]) -> Result<Bytes> {
    let payload: usize = 4 * streams.len() + streams.iter().map(|stream| stream.len()).sum::<usize>();
    let mut out = Vec::with_capacity(HEADER_SIZE + payload);
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);
    out.push(kind);
    out.extend_from_slice(&level.to_le_bytes());
    out.extend_from_slice(&schema_id.to_le_bytes());
    let count = u16::try_from(streams.len()).map_err(|_| TreeError::MalformedPacked("too many streams".to_string()))?;
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&[0; 2]);
    out.extend_from_slice(&generation.to_le_bytes());
    let payload = u32::try_from(payload).map_err(|_| TreeError::MalformedPacked("node payload too large".to_string()))?;
    out.extend_from_slice(&payload.to_le_bytes());
    out.extend_from_slice(&[0; 4]);
    for stream in streams {
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(stream.len() as u32).to_le_bytes());
    }
    for stream in streams {
        out.extend_from_slice(stream);
    }
    Ok(Bytes::from(out))
}

#[allow(clippy::large_enum_variant)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Node {
    Branch(BranchNode),
    Leaf(LeafNode),
}

impl Node {
    /// Decodes a node block for `schema`, validating its header and stream layout.
    pub(crate) fn decode(id: BlockId, data: &Bytes, schema: &Schema) -> Result<Self> {
        let (header, streams) = raw_streams(id, data)?;
        if header.schema_id != schema.id {
            return Err(TreeError::SchemaMismatch {
                expected: schema.id,
                found: header.schema_id,
            });
        }
        if header.is_leaf {
            LeafNode::decode(id, header, streams, schema).map(Node::Leaf)
        } else {
            BranchNode::decode(id, header, streams, schema).map(Node::Branch)
        }
    }

    /// Creates a new empty leaf node.
    pub(crate) fn new_leaf(schema: &Schema, generation: u64) -> Self {
        Node::Leaf(LeafNode::new(schema, generation))
    }

    /// Returns true if this is a leaf node.
    pub(crate) fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Returns the leaf node, panicking if this is not a leaf.
    pub(crate) fn as_leaf(&self) -> &LeafNode {
        match self {
            Node::Leaf(leaf) => leaf,
            Node::Branch(_) => panic!("expected leaf node"),
        }
    }

    /// Returns the leaf node mutably, panicking if this is not a leaf.
    pub(crate) fn as_leaf_mut(&mut self) -> &mut LeafNode {
        match self {
            Node::Leaf(leaf) => leaf,
            Node::Branch(_) => panic!("expected leaf node"),
        }
    }

    /// Returns the branch node, panicking if this is not a branch.
    pub(crate) fn as_branch(&self) -> &BranchNode {
        match self {
            Node::Branch(branch) => branch,
            Node::Leaf(_) => panic!("expected branch node"),
        }
    }

    /// Returns the branch node mutably, panicking if this is not a branch.
    pub(crate) fn as_branch_mut(&mut self) -> &mut BranchNode {
        match self {
            Node::Branch(branch) => branch,
            Node::Leaf(_) => panic!("expected branch node"),
        }
    }

    /// Returns the number of entries (leaf) or children (branch).
    pub(crate) fn len(&self) -> usize {
        match self {
            Node::Branch(branch) => branch.child_count(),
            Node::Leaf(leaf) => leaf.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn level(&self) -> u16 {
        match self {
            Node::Branch(branch) => branch.level,
            Node::Leaf(_) => 0,
        }
    }

    /// Returns the generation of the transaction that wrote this node.
    pub(crate) fn generation(&self) -> u64 {
        match self {
            Node::Branch(branch) => branch.generation,
            Node::Leaf(leaf) => leaf.generation,
        }
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        match self {
            Node::Branch(branch) => branch.generation = generation,
            Node::Leaf(leaf) => leaf.generation = generation,
        }
    }

    /// Returns the aggregate of everything below this node.
    pub(crate) fn summary(&self, schema: &Schema) -> Summary {
        match self {
            Node::Branch(branch) => branch.summary(schema),
            Node::Leaf(leaf) => leaf.summary(schema),
        }
    }

    /// Returns the size of this node once encoded.
    pub(crate) fn encoded_len(&self) -> usize {
        match self {
            Node::Branch(branch) => branch.encoded_len(),
            Node::Leaf(leaf) => leaf.encoded_len(),
        }
    }

    pub(crate) fn encode(&self) -> Result<Bytes> {
        match self {
            Node::Branch(branch) => branch.encode(),
            Node::Leaf(leaf) => leaf.encode(),
        }
    }

    /// Moves everything from `at` onwards into a new node of the same kind.
    pub(crate) fn split_off(&mut self, at: usize) -> Result<Node> {
        match self {
            Node::Branch(branch) => branch.split_off(at).map(Node::Branch),
            Node::Leaf(leaf) => leaf.split_off(at).map(Node::Leaf),
        }
    }

    /// Appends the contents of a node of the same kind and level.
    pub(crate) fn append_from(&mut self, other: &Node) -> Result<()> {
        match (self, other) {
            (Node::Branch(branch), Node::Branch(other)) => branch.append_from(other),
            (Node::Leaf(leaf), Node::Leaf(other)) => leaf.append_from(other),
            _ => Err(TreeError::MalformedPacked("cannot merge a leaf with a branch".to_string())),
        }
    }
}

/// Leaf node: one packed stream per schema stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LeafNode {
    schema_id: u32,
    generation: u64,
    streams: SmallVec<[PackedStream; 4]>,
}

impl LeafNode {
    /// Creates a new empty leaf node.
    pub(crate) fn new(schema: &Schema, generation: u64) -> Self {
        Self {
            schema_id: schema.id,
            generation,
            streams: schema.streams.iter().map(|kind| kind.empty()).collect(),
        }
    }

    fn decode(id: BlockId, header: NodeHeader, raw: Vec<Bytes>, schema: &Schema) -> Result<Self> {
        if raw.len() != schema.streams.len() {
            return Err(TreeError::Format {
                block: id,
                reason: format!("leaf has {} streams, schema {} has {}", raw.len(), schema.name, schema.streams.len()),
            });
        }
        let mut streams = SmallVec::with_capacity(raw.len());
        for (idx, (data, kind)) in raw.into_iter().zip(&schema.streams).enumerate() {
            let stream = PackedStream::from_bytes(data)?;
            if !kind.matches(&stream) {
                return Err(TreeError::Format {
                    block: id,
                    reason: format!("stream {idx} does not match {kind:?}"),
                });
            }
            streams.push(stream);
        }
        Ok(Self {
            schema_id: header.schema_id,
            generation: header.generation,
            streams,
        })
    }

    fn encode(&self) -> Result<Bytes> {
        let streams: SmallVec<[&Bytes; 4]> = self.streams.iter().map(PackedStream::as_bytes).collect();
        encode(KIND_LEAF, 0, self.schema_id, self.generation, &streams)
    }

    fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.streams.iter().map(|stream| 4 + stream.encoded_len()).sum::<usize>()
    }

    /// Returns the number of entries, taken from stream 0.
    pub(crate) fn len(&self) -> usize {
        self.streams.first().map_or(0, PackedStream::len)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn streams(&self) -> &[PackedStream] {
        &self.streams
    }

    pub(crate) fn stream(&self, idx: usize) -> &PackedStream {
        &self.streams[idx]
    }

    /// Returns the entry at the given index.
    pub(crate) fn entry(&self, idx: usize) -> Option<Entry> {
        self.streams.iter().map(|stream| stream.get(idx)).collect()
    }

    /// Returns every entry of this leaf in order.
    pub(crate) fn entries(&self) -> Vec<Entry> {
        (0..self.len()).filter_map(|idx| self.entry(idx)).collect()
    }

    /// Returns the value of the key stream at the given index.
    pub(crate) fn key(&self, idx: usize, schema: &Schema) -> Option<u64> {
        schema.key_stream().and_then(|stream| self.streams[stream].get(idx))
    }

    /// Returns the first index whose key is `>= key` (or `> key` when `strict`), or `len()`.
    pub(crate) fn find_key(&self, key: u64, strict: bool, schema: &Schema) -> usize {
        let found = schema
            .key_stream()
            .and_then(|stream| self.streams[stream].as_fixed())
            .and_then(|keys| if strict { keys.find_gt(key) } else { keys.find_ge(key) });
        found.unwrap_or_else(|| self.len())
    }

    /// Aggregate of one summary column over entries `[from, to)`.
    pub(crate) fn column_range(&self, column: &Column, from: usize, to: usize) -> u64 {
        let stream = &self.streams[column.stream];
        match column.kind {
            ColumnKind::Count => (to - from) as u64,
            ColumnKind::Sum => stream.sum(from, to),
            ColumnKind::Max if from == 0 && to == stream.len() => stream.max(),
            ColumnKind::Max => (from..to).filter_map(|idx| stream.get(idx)).max().unwrap_or(0),
            ColumnKind::Symbol(symbol) => stream.as_rle().map_or(0, |seq| seq.rank_range(from, to, symbol) as u64),
        }
    }

    pub(crate) fn summary(&self, schema: &Schema) -> Summary {
        Summary::from_values(
            schema
                .columns
                .iter()
                .map(|column| self.column_range(column, 0, self.streams[column.stream].len())),
        )
    }

    /// Applies `edit` to a copy of every stream, each with the bytes left in `budget` once the
    /// other streams are accounted for, and keeps the result only if every edit succeeded.
    fn edit_streams(
        &mut self,
        budget: usize,
        mut edit: impl FnMut(usize, &mut PackedStream, usize) -> Result<()>,
    ) -> Result<()> {
        let mut streams = self.streams.clone();
        let fixed = HEADER_SIZE + 4 * streams.len();
        let mut pending: usize = streams.iter().map(PackedStream::encoded_len).sum();
        let mut done = 0usize;
        for (idx, stream) in streams.iter_mut().enumerate() {
            pending -= stream.encoded_len();
            let available = budget.saturating_sub(fixed + done + pending);
            edit(idx, stream, available)?;
            done += stream.encoded_len();
        }
        self.streams = streams;
        Ok(())
    }

    /// Inserts one entry at `offset` if the leaf still fits in `budget` bytes afterwards.
    pub(crate) fn try_insert(&mut self, offset: usize, entry: &[u64], budget: usize) -> Result<()> {
        self.edit_streams(budget, |idx, stream, available| stream.insert(offset, entry[idx], available))
    }

    /// Inserts a run of `len` copies of `symbol` into the run-length stream at `offset`.
    pub(crate) fn try_insert_run(&mut self, offset: usize, symbol: u8, len: usize, budget: usize) -> Result<()> {
        self.edit_streams(budget, |_, stream, available| match stream.as_rle_mut() {
            Some(seq) => seq.insert(offset, symbol, len, available),
            None => Err(TreeError::MalformedPacked("runs need a run-length stream".to_string())),
        })
    }

    pub(crate) fn remove_space(&mut self, at: usize, count: usize) -> Result<()> {
        self.edit_streams(usize::MAX, |_, stream, _| stream.remove_space(at, count))
    }

    fn split_off(&mut self, at: usize) -> Result<LeafNode> {
        let mut streams = SmallVec::with_capacity(self.streams.len());
        for stream in &mut self.streams {
            streams.push(stream.split_off(at)?);
        }
        Ok(Self {
            schema_id: self.schema_id,
            generation: self.generation,
            streams,
        })
    }

    fn append_from(&mut self, other: &LeafNode) -> Result<()> {
        self.edit_streams(usize::MAX, |idx, stream, _| stream.append_from(&other.streams[idx], usize::MAX))
    }
}

/// Branch node: a packed array per summary column plus the child references.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct BranchNode {
    level: u16,
    schema_id: u32,
    generation: u64,
    // One array per schema column; entry `i` summarizes child `i`.
    columns: SmallVec<[FixedArray; 8]>,
    children: SmallVec<[BlockId; 16]>,
}

impl BranchNode {
    /// Creates a new empty branch node at `level`.
    pub(crate) fn new(schema: &Schema, level: u16, generation: u64) -> Self {
        Self {
            level,
            schema_id: schema.id,
            generation,
            columns: schema
                .columns
                .iter()
                .map(|column| FixedArray::new(8, column.kind.index_kind()))
                .collect(),
            children: SmallVec::new(),
        }
    }

    fn decode(id: BlockId, header: NodeHeader, mut raw: Vec<Bytes>, schema: &Schema) -> Result<Self> {
        if raw.len() != schema.columns.len() + 1 {
            return Err(TreeError::Format {
                block: id,
                reason: format!("branch has {} streams, schema {} needs {}", raw.len(), schema.name, schema.columns.len() + 1),
            });
        }
        let children_raw = raw.pop().unwrap_or_default();
        let children: SmallVec<[BlockId; 16]> = decode_children(id, children_raw)?.into_iter().collect();

        let mut columns = SmallVec::with_capacity(raw.len());
        for (idx, (data, column)) in raw.into_iter().zip(&schema.columns).enumerate() {
            let array = FixedArray::from_bytes(data)?;
            if array.width() != 8 || array.index_kind() != column.kind.index_kind() {
                return Err(TreeError::Format {
                    block: id,
                    reason: format!("summary column {idx} has the wrong layout"),
                });
            }
            if array.len() != children.len() {
                return Err(TreeError::Format {
                    block: id,
                    reason: format!("summary column {idx} has {} values for {} children", array.len(), children.len()),
                });
            }
            columns.push(array);
        }
        Ok(Self {
            level: header.level,
            schema_id: header.schema_id,
            generation: header.generation,
            columns,
            children,
        })
    }

    fn children_array(&self) -> Result<FixedArray> {
        let raw: SmallVec<[u64; 16]> = self.children.iter().map(|child| child.to_raw()).collect();
        FixedArray::from_values(8, IndexKind::None, &raw)
    }

    fn encode(&self) -> Result<Bytes> {
        let children = self.children_array()?;
        let mut streams: SmallVec<[&Bytes; 9]> = self.columns.iter().map(FixedArray::as_bytes).collect();
        streams.push(children.as_bytes());
        encode(KIND_BRANCH, self.level, self.schema_id, self.generation, &streams)
    }

    fn encoded_len(&self) -> usize {
        let children = FixedArray::encoded_len_for(self.children.len(), 8, IndexKind::None);
        HEADER_SIZE + 4 + children + self.columns.iter().map(|column| 4 + column.encoded_len()).sum::<usize>()
    }

    /// Returns the encoded size of a branch of `schema` holding `children` children.
    pub(crate) fn encoded_len_for(schema: &Schema, children: usize) -> usize {
        let columns: usize = schema
            .columns
            .iter()
            .map(|column| 4 + FixedArray::encoded_len_for(children, 8, column.kind.index_kind()))
            .sum();
        HEADER_SIZE + 4 + FixedArray::encoded_len_for(children, 8, IndexKind::None) + columns
    }

    /// Returns the number of children in this node.
    pub(crate) fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Returns the child reference at the given index.
    #[inline]
    pub(crate) fn child(&self, idx: usize) -> BlockId {
        self.children[idx]
    }

    /// Returns all children.
    pub(crate) fn children(&self) -> &[BlockId] {
        &self.children
    }

    /// Returns the packed summary array of one column.
    pub(crate) fn column(&self, column: usize) -> &FixedArray {
        &self.columns[column]
    }

    /// Returns the summary of the child at the given index.
    pub(crate) fn child_summary(&self, idx: usize) -> Summary {
        Summary::from_values(self.columns.iter().map(|column| column.get(idx).unwrap_or(0)))
    }

    /// Returns the combined summary of all children.
    pub(crate) fn summary(&self, schema: &Schema) -> Summary {
        Summary::from_values(self.columns.iter().zip(&schema.columns).map(|(array, column)| {
            match column.kind.combinator() {
                Combinator::Sum => array.total(),
                Combinator::Max => array.max(),
            }
        }))
    }

    /// Sets the child reference at the given index.
    pub(crate) fn set_child(&mut self, idx: usize, child: BlockId) {
        self.children[idx] = child;
    }

    /// Sets the summary of the child at the given index.
    pub(crate) fn set_child_summary(&mut self, idx: usize, summary: &Summary) -> Result<()> {
        for (column, array) in self.columns.iter_mut().enumerate() {
            array.set(idx, summary.get(column), usize::MAX)?;
        }
        Ok(())
    }

    /// Inserts a child and its summary at the given position.
    pub(crate) fn insert_child(&mut self, idx: usize, child: BlockId, summary: &Summary) -> Result<()> {
        for (column, array) in self.columns.iter_mut().enumerate() {
            array.insert(idx, &[summary.get(column)], usize::MAX)?;
        }
        self.children.insert(idx, child);
        Ok(())
    }

    /// Removes the child at the given position and returns its reference.
    pub(crate) fn remove_child(&mut self, idx: usize) -> Result<BlockId> {
        for array in &mut self.columns {
            array.remove_space(idx, 1)?;
        }
        Ok(self.children.remove(idx))
    }

    fn split_off(&mut self, at: usize) -> Result<BranchNode> {
        let mut columns = SmallVec::with_capacity(self.columns.len());
        for array in &mut self.columns {
            columns.push(array.split_off(at)?);
        }
        Ok(Self {
            level: self.level,
            schema_id: self.schema_id,
            generation: self.generation,
            columns,
            children: self.children.drain(at..).collect(),
        })
    }

    fn append_from(&mut self, other: &BranchNode) -> Result<()> {
        for (array, other) in self.columns.iter_mut().zip(&other.columns) {
            array.append_from(other, usize::MAX)?;
        }
        self.children.extend_from_slice(&other.children);
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn id(index: usize) -> BlockId {
        BlockId::from_index(index)
    }

    fn map_leaf(pairs: &[(u64, u64)]) -> LeafNode {
        let schema = Schema::map();
        let mut leaf = LeafNode::new(&schema, 3);
        for (idx, &(key, value)) in pairs.iter().enumerate() {
            leaf.try_insert(idx, &[key, value], usize::MAX).unwrap();
        }
        leaf
    }

    #[test]
    fn leaf_round_trip() {
        let schema = Schema::map();
        let node = Node::Leaf(map_leaf(&[(1, 10), (5, 500), (9, 90)]));
        let bytes = node.encode().unwrap();
        assert_eq!(bytes.len(), node.encoded_len());
        let decoded = Node::decode(id(0), &bytes, &schema).unwrap();
        assert_eq!(decoded, node);
        assert_eq!(decoded.generation(), 3);
        assert_eq!(decoded.summary(&schema).as_slice(), &[3, 9, 600]);
        assert_eq!(decoded.as_leaf().entry(1), Some(smallvec![5, 500]));
        assert!(child_ids(id(0), &bytes).unwrap().is_empty());
    }

    #[test]
    fn branch_round_trip() {
        let schema = Schema::map();
        let mut branch = BranchNode::new(&schema, 1, 7);
        branch.insert_child(0, id(4), &Summary::from_values([3, 9, 600])).unwrap();
        branch.insert_child(1, id(8), &Summary::from_values([2, 20, 5])).unwrap();
        let node = Node::Branch(branch);

        let bytes = node.encode().unwrap();
        assert_eq!(bytes.len(), node.encoded_len());
        let decoded = Node::decode(id(1), &bytes, &schema).unwrap();
        assert_eq!(decoded, node);
        assert_eq!(decoded.summary(&schema).as_slice(), &[5, 20, 605]);
        assert_eq!(decoded.as_branch().child_summary(1).as_slice(), &[2, 20, 5]);
        assert_eq!(child_ids(id(1), &bytes).unwrap(), vec![id(4), id(8)]);
    }

    #[test]
    fn header_validation() {
        let schema = Schema::map();
        let bytes = Node::Leaf(map_leaf(&[(1, 1)])).encode().unwrap();

        let mut bad = bytes.to_vec();
        bad[0] = b'X';
        let err = Node::decode(id(2), &Bytes::from(bad), &schema).unwrap_err();
        assert!(matches!(err, TreeError::Format { reason, .. } if reason == "bad magic"));

        let mut bad = bytes.to_vec();
        bad[4] = 2;
        assert!(matches!(Node::decode(id(2), &Bytes::from(bad), &schema), Err(TreeError::Format { .. })));

        let mut bad = bytes.to_vec();
        bad[5] = 9;
        assert!(Node::decode(id(2), &Bytes::from(bad), &schema).is_err());

        let truncated = bytes.slice(..bytes.len() - 1);
        assert!(Node::decode(id(2), &truncated, &schema).is_err());

        let err = Node::decode(id(2), &bytes, &Schema::ordered_set()).unwrap_err();
        assert!(matches!(err, TreeError::SchemaMismatch { expected: 1, found: 2 }));
    }

    #[test]
    fn stream_kinds_are_checked() {
        let schema = Schema::vector();
        let mut other = Schema::vle_vector();
        other.id = schema.id;
        let bytes = Node::new_leaf(&other, 1).encode().unwrap();
        assert!(matches!(Node::decode(id(0), &bytes, &schema), Err(TreeError::Format { .. })));
    }

    #[test]
    fn insert_respects_budget() {
        let schema = Schema::map();
        let mut leaf = LeafNode::new(&schema, 1);
        let budget = leaf.encoded_len() + 64;
        let mut inserted = 0;
        while leaf.try_insert(inserted, &[inserted as u64, 1], budget).is_ok() {
            inserted += 1;
        }
        assert!(inserted > 0);
        assert!(leaf.encoded_len() <= budget);
        assert_eq!(leaf.len(), inserted);
        // A failed insert leaves both streams untouched.
        assert_eq!(leaf.stream(0).len(), leaf.stream(1).len());
    }

    #[test]
    fn split_and_merge_leaf() {
        let schema = Schema::map();
        let pairs: Vec<(u64, u64)> = (0..40).map(|i| (i, i * 3)).collect();
        let mut node = Node::Leaf(map_leaf(&pairs));
        let original = node.clone();

        let right = node.split_off(15).unwrap();
        assert_eq!(node.len(), 15);
        assert_eq!(right.len(), 25);
        assert_eq!(right.as_leaf().key(0, &schema), Some(15));

        node.append_from(&right).unwrap();
        assert_eq!(node, original);
    }

    #[test]
    fn find_key_in_leaf() {
        let schema = Schema::map();
        let leaf = map_leaf(&[(2, 0), (4, 0), (4, 1), (8, 0)]);
        assert_eq!(leaf.find_key(4, false, &schema), 1);
        assert_eq!(leaf.find_key(4, true, &schema), 3);
        assert_eq!(leaf.find_key(9, false, &schema), 4);
        assert_eq!(leaf.find_key(0, true, &schema), 0);
    }

    #[test]
    fn sequence_leaf_columns() {
        let schema = Schema::sequence();
        let mut leaf = LeafNode::new(&schema, 1);
        leaf.try_insert_run(0, 0, 5, usize::MAX).unwrap();
        leaf.try_insert_run(5, 1, 3, usize::MAX).unwrap();
        leaf.try_insert_run(8, 0, 2, usize::MAX).unwrap();
        assert_eq!(leaf.len(), 10);
        assert_eq!(leaf.summary(&schema).as_slice(), &[10, 7, 3, 0, 0]);
        assert_eq!(leaf.column_range(&schema.columns[1], 3, 9), 3);

        let mut vector = LeafNode::new(&Schema::vector(), 1);
        assert!(vector.try_insert_run(0, 1, 1, usize::MAX).is_err());
    }

    #[test]
    fn branch_child_edits() {
        let schema = Schema::vector();
        let mut branch = BranchNode::new(&schema, 2, 1);
        for i in 0..5 {
            branch.insert_child(i, id(i), &Summary::from_values([i as u64 + 1, 10])).unwrap();
        }
        assert_eq!(branch.summary(&schema).as_slice(), &[15, 50]);

        branch.set_child_summary(0, &Summary::from_values([7, 1])).unwrap();
        branch.set_child(0, id(99));
        assert_eq!(branch.remove_child(2).unwrap(), id(2));
        assert_eq!(branch.children(), &[id(99), id(1), id(3), id(4)]);
        assert_eq!(branch.summary(&schema).as_slice(), &[18, 31]);

        assert_eq!(BranchNode::encoded_len_for(&schema, 4), branch.encoded_len());

        let mut node = Node::Branch(branch);
        let right = node.split_off(2).unwrap();
        assert_eq!(right.as_branch().children(), &[id(3), id(4)]);
        assert_eq!(right.level(), 2);
        assert_eq!(node.summary(&schema).as_slice(), &[9, 11]);
    }
}
