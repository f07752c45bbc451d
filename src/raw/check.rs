//! Read-only consistency checks.
//!
//! [`check_tree`] walks every node reachable from one root and reports structural problems
//! through a callback; [`check_store`] recomputes block reference counts from all snapshot
//! labels of a store and compares them with what the store recorded. Neither repairs anything.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use super::node::{child_ids, raw_streams, Node};
use super::summary::Summary;
use crate::block::BlockId;
use crate::config::{MergePolicy, TreeConfig};
use crate::error::Result;
use crate::schema::{Schema, SchemaRegistry};
use crate::store::BlockStore;

/// Severity of a consistency finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Totals of one consistency check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub nodes: usize,
    pub warnings: usize,
    pub errors: usize,
}

impl CheckReport {
    /// Returns true if no error was found.
    pub fn is_ok(&self) -> bool {
        self.errors == 0
    }

    fn merge(&mut self, other: CheckReport) {
        self.nodes += other.nodes;
        self.warnings += other.warnings;
        self.errors += other.errors;
    }
}

struct Reporter<F> {
    consumer: F,
    report: CheckReport,
}

impl<F: FnMut(Severity, &str)> Reporter<F> {
    fn emit(&mut self, severity: Severity, message: &str) {
        match severity {
            Severity::Error => {
                self.report.errors += 1;
                warn!("{message}");
            }
            Severity::Warning => self.report.warnings += 1,
            Severity::Info => {}
        }
        (self.consumer)(severity, message);
    }

    fn error(&mut self, block: BlockId, message: impl AsRef<str>) {
        self.emit(Severity::Error, &format!("block {block}: {}", message.as_ref()));
    }
}

struct Visit {
    id: BlockId,
    level: Option<u16>,
    parent_generation: u64,
    // Summary recorded for this node by its parent.
    expected: Option<Summary>,
}

/// Checks the tree of `schema` under `root`.
///
/// Reports decode failures, uneven depth, children newer than their parent, blocks referenced
/// twice, empty nodes, streams of different lengths, malformed packed streams, symbol
/// counts that disagree with the stream length, unsorted keys, summaries that disagree with the
/// child they describe and oversized blocks. Under [`MergePolicy::Eager`] under-filled nodes are
/// reported as warnings.
pub(crate) fn check_tree<S, F>(
    store: &S,
    schema: &Schema,
    config: &TreeConfig,
    root: Option<BlockId>,
    consumer: F,
) -> Result<CheckReport>
where
    S: BlockStore + ?Sized,
    F: FnMut(Severity, &str),
{
    let mut reporter = Reporter {
        consumer,
        report: CheckReport::default(),
    };
    let Some(root) = root else {
        reporter.emit(Severity::Info, "tree is empty");
        return Ok(reporter.report);
    };

    let block_size = store.block_size();
    let mut seen = BTreeSet::new();
    let mut last_key: Option<u64> = None;
    let mut stack = vec![Visit {
        id: root,
        level: None,
        parent_generation: u64::MAX,
        expected: None,
    }];
    while let Some(visit) = stack.pop() {
        let id = visit.id;
        if !seen.insert(id) {
            reporter.error(id, "referenced more than once");
            continue;
        }
        let block = match store.get(id) {
            Ok(block) => block,
            Err(err) => {
                reporter.error(id, format!("cannot be read: {err}"));
                continue;
            }
        };
        if block.len() > block_size {
            reporter.error(id, format!("holds {} bytes, more than the block size {block_size}", block.len()));
        }
        let node = match Node::decode(id, &block.data, schema) {
            Ok(node) => node,
            Err(err) => {
                reporter.error(id, format!("cannot be decoded: {err}"));
                continue;
            }
        };
        reporter.report.nodes += 1;

        if let Some(level) = visit.level {
            if node.level() != level {
                reporter.error(id, format!("is at level {}, expected {level}", node.level()));
            }
        }
        if node.generation() > visit.parent_generation {
            reporter.error(
                id,
                format!(
                    "generation {} is newer than its parent's {}",
                    node.generation(),
                    visit.parent_generation
                ),
            );
        }
        let is_root = id == root;
        if node.is_empty() {
            // An empty tree has no root block at all.
            reporter.error(id, if is_root { "is an empty root" } else { "is empty" });
        }
        if config.merge_policy == MergePolicy::Eager && !is_root && config.is_underfilled(block.len(), block_size) {
            reporter.emit(Severity::Warning, &format!("block {id}: under-filled ({} bytes)", block.len()));
        }
        let summary = node.summary(schema);
        if let Some(expected) = &visit.expected {
            for column in 0..schema.columns.len() {
                if summary.get(column) != expected.get(column) {
                    reporter.error(
                        id,
                        format!(
                            "summary column {column} is {} in the parent, {} in the node",
                            expected.get(column),
                            summary.get(column)
                        ),
                    );
                }
            }
        }

        match &node {
            Node::Leaf(leaf) => {
                let len = leaf.len();
                for (idx, stream) in leaf.streams().iter().enumerate() {
                    if stream.len() != len {
                        reporter.error(id, format!("stream {idx} holds {} entries, stream 0 holds {len}", stream.len()));
                    }
                    if let Err(err) = stream.validate() {
                        reporter.error(id, format!("stream {idx} is malformed: {err}"));
                    }
                    if let Some(seq) = stream.as_rle() {
                        let counted: usize = (0..seq.alphabet()).map(|symbol| seq.count(symbol as u8)).sum();
                        if counted != seq.len() {
                            reporter.error(
                                id,
                                format!("stream {idx} counts {counted} symbols for a length of {}", seq.len()),
                            );
                        }
                    }
                }
                if schema.sorted {
                    for idx in 0..len {
                        let Some(key) = leaf.key(idx, schema) else { continue };
                        if last_key.is_some_and(|last| key < last) {
                            reporter.error(id, format!("key {key} at entry {idx} is out of order"));
                        }
                        last_key = Some(key);
                    }
                }
            }
            Node::Branch(branch) => {
                let level = node.level().checked_sub(1);
                // Pushed in reverse so children are visited left to right.
                for (idx, &child) in branch.children().iter().enumerate().rev() {
                    stack.push(Visit {
                        id: child,
                        level,
                        parent_generation: node.generation(),
                        expected: Some(branch.child_summary(idx)),
                    });
                }
            }
        }
    }
    let summary = format!("checked {} nodes", reporter.report.nodes);
    reporter.emit(Severity::Info, &summary);
    Ok(reporter.report)
}

/// Checks every snapshot of `store`.
///
/// Each labelled tree is checked with the schema its root names in `registry`. Reference counts
/// are recomputed from the labels and child pointers and compared with the store's; blocks
/// nothing refers to are reported as leaked.
pub fn check_store<S, F>(store: &S, registry: &SchemaRegistry, consumer: F) -> Result<CheckReport>
where
    S: BlockStore + ?Sized,
    F: FnMut(Severity, &str),
{
    let mut reporter = Reporter {
        consumer,
        report: CheckReport::default(),
    };
    let config = TreeConfig::default();
    let mut expected: BTreeMap<BlockId, u32> = BTreeMap::new();
    let mut visited = BTreeSet::new();

    for name in store.root_names() {
        let Some(root) = store.root(&name)? else { continue };
        *expected.entry(root).or_default() += 1;

        match store.get(root).and_then(|block| raw_streams(root, &block.data)) {
            Ok((header, _)) => match registry.by_id(header.schema_id) {
                Ok(schema) => {
                    let report = check_tree(store, &schema, &config, Some(root), |severity, message| {
                        (reporter.consumer)(severity, &format!("snapshot {name}: {message}"));
                    })?;
                    reporter.report.merge(report);
                }
                Err(err) => reporter.emit(Severity::Error, &format!("snapshot {name}: {err}")),
            },
            Err(err) => reporter.emit(Severity::Error, &format!("snapshot {name}: root {root} is unreadable: {err}")),
        }

        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Ok(children) = store.get(id).and_then(|block| child_ids(id, &block.data)) else {
                continue;
            };
            for child in children {
                *expected.entry(child).or_default() += 1;
                stack.push(child);
            }
        }
    }

    let live: BTreeMap<BlockId, u32> = store.live_blocks().into_iter().collect();
    for (&id, &refs) in &live {
        match expected.get(&id) {
            None => reporter.error(id, format!("is leaked ({refs} references, unreachable)")),
            Some(&count) if count != refs => {
                reporter.error(id, format!("has {refs} references, {count} expected"));
            }
            Some(_) => {}
        }
    }
    for &id in expected.keys() {
        if !live.contains_key(&id) {
            reporter.error(id, "is referenced but not allocated");
        }
    }
    let summary = format!("checked {} blocks", live.len());
    reporter.emit(Severity::Info, &summary);
    Ok(reporter.report)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::raw::node::BranchNode;
    use crate::store::MemoryStore;

    fn write(store: &MemoryStore, node: &Node) -> BlockId {
        let id = store.allocate(store.block_size()).unwrap();
        store.write(id, node.encode().unwrap()).unwrap();
        id
    }

    fn leaf(schema: &Schema, keys: &[u64]) -> Node {
        let mut node = Node::new_leaf(schema, 1);
        for (at, &key) in keys.iter().enumerate() {
            node.as_leaf_mut().try_insert(at, &[key], usize::MAX).unwrap();
        }
        node
    }

    fn messages(store: &MemoryStore, schema: &Schema, root: BlockId) -> (CheckReport, Vec<String>) {
        let mut errors = Vec::new();
        let report = check_tree(store, schema, &TreeConfig::default(), Some(root), |severity, message| {
            if severity == Severity::Error {
                errors.push(message.to_string());
            }
        })
        .unwrap();
        (report, errors)
    }

    #[test]
    fn clean_tree_passes() {
        let store = MemoryStore::default();
        let schema = Schema::ordered_set();
        let left = leaf(&schema, &[1, 2]);
        let right = leaf(&schema, &[5, 8]);
        let mut branch = BranchNode::new(&schema, 1, 2);
        branch.insert_child(0, write(&store, &left), &left.summary(&schema)).unwrap();
        branch.insert_child(1, write(&store, &right), &right.summary(&schema)).unwrap();
        let root = write(&store, &Node::Branch(branch));

        let (report, errors) = messages(&store, &schema, root);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(report.nodes, 3);
        assert!(report.is_ok());
    }

    #[test]
    fn empty_root_is_an_error() {
        let store = MemoryStore::default();
        let schema = Schema::sequence();
        let root = write(&store, &Node::new_leaf(&schema, 1));

        let (report, errors) = messages(&store, &schema, root);
        assert_eq!(errors, vec![format!("block {root}: is an empty root")]);
        assert!(!report.is_ok());
    }

    #[test]
    fn reports_structural_problems() {
        let store = MemoryStore::default();
        let schema = Schema::ordered_set();
        let left = leaf(&schema, &[4, 9]);
        let right = leaf(&schema, &[5]);
        let left_id = write(&store, &left);
        let mut branch = BranchNode::new(&schema, 1, 0);
        // Wrong summary, unsorted keys, the same leaf twice and a child newer than its parent.
        branch.insert_child(0, left_id, &Summary::from_values([3, 9])).unwrap();
        branch.insert_child(1, write(&store, &right), &right.summary(&schema)).unwrap();
        branch.insert_child(2, left_id, &left.summary(&schema)).unwrap();
        let root = write(&store, &Node::Branch(branch));

        let (report, errors) = messages(&store, &schema, root);
        assert!(errors.iter().any(|e| e.contains("summary column 0")), "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("out of order")), "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("referenced more than once")), "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("newer than its parent")), "{errors:?}");
        assert_eq!(report.errors, errors.len());
    }

    #[test]
    fn store_check_finds_leaks_and_bad_counts() {
        let store = MemoryStore::default();
        let schema = Schema::ordered_set();
        let mut registry = SchemaRegistry::new();
        registry.register(schema.clone()).unwrap();

        let root = write(&store, &leaf(&schema, &[1]));
        store.create_root("main").unwrap();
        store.set_root("main", Some(root)).unwrap();
        let mut errors = Vec::new();
        let report = check_store(&store, &registry, |severity, message| {
            if severity == Severity::Error {
                errors.push(message.to_string());
            }
        })
        .unwrap();
        assert_eq!(report.errors, 1);
        assert!(errors[0].contains("has 0 references, 1 expected"), "{errors:?}");

        store.ref_block(root).unwrap();
        let leaked = write(&store, &leaf(&schema, &[2]));
        let mut errors = Vec::new();
        check_store(&store, &registry, |severity, message| {
            if severity == Severity::Error {
                errors.push(message.to_string());
            }
        })
        .unwrap();
        assert_eq!(errors, vec![format!("block {leaked}: is leaked (0 references, unreachable)")]);
    }
}
