#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};

use anyhow::{Context, Result};

use crate::wire;

/// Inclusion decision produced by a rule lookup. Higher rank dominates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Condition {
    pub(crate) inclusion: bool,
    pub(crate) rank: i32,
}

impl Condition {
    /// Sentinel returned when no rule applies.
    pub(crate) fn default_exclude() -> Self {
        Self {
            inclusion: false,
            rank: -1,
        }
    }
}

/// Node kinds stored in a condition tree.
///
/// `In` answers with its own inclusion, `Not` with the inverse. `Implied`
/// nodes are created for intermediate path fragments and answer through
/// their highest-ranked child. The root is an `Implied` whose own condition
/// is only surfaced while the tree is empty.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum NodeKind {
    Root,
    Implied,
    In,
    Not,
}

impl NodeKind {
    fn type_code(self) -> u8 {
        match self {
            NodeKind::Root => 0,
            NodeKind::Implied => 1,
            NodeKind::In => 2,
            NodeKind::Not => 3,
        }
    }

    fn from_type_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(NodeKind::Root),
            1 => Ok(NodeKind::Implied),
            2 => Ok(NodeKind::In),
            3 => Ok(NodeKind::Not),
            other => anyhow::bail!("unknown condition node type {other}"),
        }
    }
}

/// One node of a hierarchical ranked rule store.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ConditionNode {
    kind: NodeKind,
    rank: i32,
    inclusion: bool,
    max_child_rank: i32,
    ranking_child: Option<String>,
    children: BTreeMap<String, ConditionNode>,
}

impl ConditionNode {
    pub(crate) fn root(inclusion: bool, rank: i32) -> Self {
        Self {
            kind: NodeKind::Root,
            rank,
            inclusion,
            max_child_rank: -1,
            ranking_child: None,
            children: BTreeMap::new(),
        }
    }

    fn implied(rank: i32) -> Self {
        Self {
            kind: NodeKind::Implied,
            rank,
            inclusion: false,
            max_child_rank: -1,
            ranking_child: None,
            children: BTreeMap::new(),
        }
    }

    pub(crate) fn in_node(inclusion: bool, rank: i32) -> Self {
        Self {
            kind: NodeKind::In,
            rank,
            inclusion,
            max_child_rank: -1,
            ranking_child: None,
            children: BTreeMap::new(),
        }
    }

    pub(crate) fn not_node(inclusion: bool, rank: i32) -> Self {
        Self {
            kind: NodeKind::Not,
            rank,
            inclusion,
            max_child_rank: -1,
            ranking_child: None,
            children: BTreeMap::new(),
        }
    }

    /// Inclusion rule node.
    pub(crate) fn include(rank: i32) -> Self {
        Self::in_node(true, rank)
    }

    /// Exclusion rule node, `Not` over an inclusion.
    pub(crate) fn exclude(rank: i32) -> Self {
        Self::not_node(true, rank)
    }

    pub(crate) fn kind(&self) -> NodeKind {
        self.kind
    }

    pub(crate) fn rank(&self) -> i32 {
        self.rank
    }

    pub(crate) fn max_child_rank(&self) -> i32 {
        self.max_child_rank
    }

    pub(crate) fn ranking_child(&self) -> Option<&str> {
        self.ranking_child.as_deref()
    }

    pub(crate) fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// The decision this node answers with when a lookup lands on it.
    pub(crate) fn condition(&self) -> Condition {
        match self.kind {
            NodeKind::In => Condition {
                inclusion: self.inclusion,
                rank: self.rank,
            },
            NodeKind::Not => Condition {
                inclusion: !self.inclusion,
                rank: self.rank,
            },
            NodeKind::Root | NodeKind::Implied => match &self.ranking_child {
                Some(key) => match self.children.get(key) {
                    Some(child) => child.condition(),
                    None => self.own_condition(),
                },
                None => self.own_condition(),
            },
        }
    }

    fn own_condition(&self) -> Condition {
        Condition {
            inclusion: self.inclusion,
            rank: self.rank,
        }
    }

    fn recompute_caches(&mut self) {
        let mut max = -1;
        let mut ranking: Option<(&String, i32)> = None;
        for (key, child) in &self.children {
            max = max.max(child.rank).max(child.max_child_rank);
            match ranking {
                Some((_, best)) if best >= child.rank => {}
                _ => ranking = Some((key, child.rank)),
            }
        }
        self.max_child_rank = max;
        self.ranking_child = ranking.map(|(key, _)| key.clone());
    }
}

/// Ranked, hierarchical key-to-decision store with wildcard keys.
///
/// Keys are dotted location fragments (`pkg.Class.method.sig`); a trailing
/// `.*` is normalized away, prefix matching falls out of the path walk.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ConditionTree {
    root: ConditionNode,
}

/// Strip a trailing wildcard fragment from a dotted key.
pub(crate) fn normalize_key(key: &str) -> &str {
    key.strip_suffix(".*").unwrap_or(key)
}

impl Default for ConditionTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionTree {
    /// An empty tree whose default answer is exclusion.
    pub(crate) fn new() -> Self {
        Self {
            root: ConditionNode::root(false, 0),
        }
    }

    pub(crate) fn with_root(root: ConditionNode) -> Self {
        Self { root }
    }

    pub(crate) fn root(&self) -> &ConditionNode {
        &self.root
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    /// Insert or override the node at `key`.
    ///
    /// Missing intermediate fragments become `Implied` nodes inheriting the
    /// inserted rank. An existing node is replaced iff the new rank is at
    /// least the old one; the old subtree is pruned when the new rank
    /// dominates it, and migrated otherwise. Returns whether the tree
    /// changed.
    pub(crate) fn add(&mut self, key: &str, node: ConditionNode) -> bool {
        self.add_with(key, node, false)
    }

    /// Force-insert: the node receives a rank above every rank currently on
    /// the path, so a later adaptive change dominates all prior conditions
    /// on the same key.
    pub(crate) fn add_force(&mut self, key: &str, node: ConditionNode) -> bool {
        self.add_with(key, node, true)
    }

    fn add_with(&mut self, key: &str, mut node: ConditionNode, force: bool) -> bool {
        let key = normalize_key(key);
        let tokens: Vec<&str> = key.split('.').filter(|t| !t.is_empty()).collect();
        if tokens.is_empty() {
            return false;
        }
        if force {
            let mut max_rank = self.root.rank;
            let mut cur = &self.root;
            for token in &tokens {
                match cur.children.get(*token) {
                    Some(child) => {
                        max_rank = max_rank.max(child.rank).max(child.max_child_rank);
                        cur = child;
                    }
                    None => break,
                }
            }
            node.rank = max_rank + 1;
        }
        add_inner(&mut self.root, &tokens, node, force)
    }

    /// Walk `loc_key` and answer with the highest-ranked applicable decision.
    ///
    /// `Implied` nodes passed through mid-walk are structural and carry no
    /// decision; a walk that terminates on one surfaces its ranking child.
    pub(crate) fn check(&self, loc_key: &str) -> Condition {
        if self.root.children.is_empty() {
            return self.root.own_condition();
        }
        let key = normalize_key(loc_key);
        let mut best = Condition::default_exclude();
        let mut cur = &self.root;
        for token in key.split('.') {
            let Some(child) = cur.children.get(token) else {
                return best;
            };
            match child.kind {
                NodeKind::In | NodeKind::Not => {
                    let cond = child.condition();
                    if cond.rank >= best.rank {
                        best = cond;
                    }
                }
                NodeKind::Root | NodeKind::Implied => {}
            }
            cur = child;
        }
        if matches!(cur.kind, NodeKind::Root | NodeKind::Implied) {
            let cond = cur.condition();
            if cond.rank >= best.rank {
                best = cond;
            }
        }
        best
    }

    /// Conservative reachability probe: does any inclusion possibly fire?
    ///
    /// May over-report; must never report a false negative.
    pub(crate) fn any_inclusions(&self) -> Condition {
        let root_cond = self.root.own_condition();
        if self.root.children.is_empty() {
            return root_cond;
        }
        if root_cond.inclusion && self.root.rank >= self.root.max_child_rank {
            return root_cond;
        }
        let mut best: Option<Condition> = None;
        for entry in self.preorder() {
            let cond = match entry.node.kind() {
                NodeKind::In | NodeKind::Not => entry.node.condition(),
                NodeKind::Root | NodeKind::Implied => continue,
            };
            if cond.inclusion && best.map(|b| cond.rank > b.rank).unwrap_or(true) {
                best = Some(cond);
            }
        }
        match best {
            Some(cond) => cond,
            None if root_cond.inclusion => root_cond,
            None => Condition {
                inclusion: false,
                rank: self.root.rank,
            },
        }
    }

    /// Copy every path of `other` into this tree through `add`.
    pub(crate) fn merge(&mut self, other: &ConditionTree) {
        for entry in other.preorder() {
            let mut node = entry.node.clone();
            node.children = BTreeMap::new();
            node.max_child_rank = -1;
            node.ranking_child = None;
            self.add(&entry.full_key, node);
        }
    }

    /// Replace the root, then add each `(key, node)` pair in lockstep.
    pub(crate) fn merge_with_root(
        &mut self,
        mut root_override: ConditionNode,
        keys: &[&str],
        nodes: Vec<ConditionNode>,
        force: bool,
    ) -> Result<()> {
        if keys.len() != nodes.len() {
            anyhow::bail!(
                "merge key/node arity mismatch: {} keys, {} nodes",
                keys.len(),
                nodes.len()
            );
        }
        root_override.children = std::mem::take(&mut self.root.children);
        root_override.recompute_caches();
        self.root = root_override;
        for (key, node) in keys.iter().zip(nodes) {
            if force {
                self.add_force(key, node);
            } else {
                self.add(key, node);
            }
        }
        Ok(())
    }

    /// Drop everything and install a fresh root.
    pub(crate) fn clear(&mut self, root_override: ConditionNode) {
        self.root = root_override;
        self.root.children.clear();
        self.root.max_child_rank = -1;
        self.root.ranking_child = None;
    }

    pub(crate) fn preorder(&self) -> TreeIter<'_> {
        let mut entries = VecDeque::new();
        collect_preorder(&self.root, "", 0, &mut entries);
        TreeIter { entries }
    }

    pub(crate) fn postorder(&self) -> TreeIter<'_> {
        let mut entries = VecDeque::new();
        collect_postorder(&self.root, "", 0, &mut entries);
        TreeIter { entries }
    }

    pub(crate) fn leaves(&self) -> TreeIter<'_> {
        let mut entries = VecDeque::new();
        collect_leaves(&self.root, "", 0, &mut entries);
        TreeIter { entries }
    }

    /// Serialize in preorder: per node `(key, typeCode, rank, inclusion,
    /// maxChildRank, rankingChildKey?, childCount, children...)`.
    pub(crate) fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        write_node(out, "", &self.root)
    }

    pub(crate) fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let (key, root) = read_node(input).context("read condition tree")?;
        if !key.is_empty() {
            anyhow::bail!("condition tree root carries key {key:?}");
        }
        Ok(Self { root })
    }
}

/// A condition tree wrapping the rules for one named observable.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct EventConditions {
    observable: String,
    tree: ConditionTree,
}

impl EventConditions {
    pub(crate) fn new(observable: impl Into<String>) -> Self {
        Self {
            observable: observable.into(),
            tree: ConditionTree::new(),
        }
    }

    pub(crate) fn with_tree(observable: impl Into<String>, tree: ConditionTree) -> Self {
        Self {
            observable: observable.into(),
            tree,
        }
    }

    pub(crate) fn observable(&self) -> &str {
        &self.observable
    }

    pub(crate) fn tree(&self) -> &ConditionTree {
        &self.tree
    }

    pub(crate) fn tree_mut(&mut self) -> &mut ConditionTree {
        &mut self.tree
    }

    pub(crate) fn add(&mut self, key: &str, node: ConditionNode) -> bool {
        self.tree.add(key, node)
    }

    pub(crate) fn add_force(&mut self, key: &str, node: ConditionNode) -> bool {
        self.tree.add_force(key, node)
    }

    pub(crate) fn check(&self, loc_key: &str) -> Condition {
        self.tree.check(loc_key)
    }

    pub(crate) fn any_inclusions(&self) -> Condition {
        self.tree.any_inclusions()
    }

    pub(crate) fn clear(&mut self, root_override: ConditionNode) {
        self.tree.clear(root_override);
    }

    pub(crate) fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        wire::write_utf(out, &self.observable)?;
        self.tree.write_to(out)
    }

    pub(crate) fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let observable = wire::read_utf(input)?;
        let tree = ConditionTree::read_from(input)
            .with_context(|| format!("read conditions for {observable}"))?;
        Ok(Self { observable, tree })
    }
}

fn add_inner(parent: &mut ConditionNode, tokens: &[&str], node: ConditionNode, force: bool) -> bool {
    let (head, rest) = tokens.split_first().expect("token path is never empty");
    let changed = if rest.is_empty() {
        match parent.children.get_mut(*head) {
            Some(existing) => {
                if !force && node.rank < existing.rank {
                    false
                } else {
                    let prune = force || node.rank > existing.max_child_rank;
                    let mut node = node;
                    if !prune {
                        node.children = std::mem::take(&mut existing.children);
                        node.recompute_caches();
                    }
                    *existing = node;
                    true
                }
            }
            None => {
                parent.children.insert(head.to_string(), node);
                true
            }
        }
    } else {
        let rank = node.rank;
        let child = parent
            .children
            .entry(head.to_string())
            .or_insert_with(|| ConditionNode::implied(rank));
        add_inner(child, rest, node, force)
    };
    if changed {
        refresh_parent_caches(parent, head);
    }
    changed
}

/// Reverse-path cache repair after a mutation below `written_key`.
fn refresh_parent_caches(parent: &mut ConditionNode, written_key: &str) {
    let mut max = -1;
    for child in parent.children.values() {
        max = max.max(child.rank).max(child.max_child_rank);
    }
    parent.max_child_rank = max;

    let written_rank = parent
        .children
        .get(written_key)
        .map(|child| child.rank)
        .unwrap_or(-1);
    let current_rank = parent
        .ranking_child
        .as_ref()
        .and_then(|key| parent.children.get(key))
        .map(|child| child.rank);
    match current_rank {
        Some(rank) if rank > written_rank => {}
        _ => parent.ranking_child = Some(written_key.to_string()),
    }
}

/// Entry yielded by tree iterators.
pub(crate) struct TreeEntry<'a> {
    pub(crate) key_prefix: String,
    pub(crate) key: String,
    pub(crate) full_key: String,
    pub(crate) node: &'a ConditionNode,
    pub(crate) parent: Option<&'a ConditionNode>,
    pub(crate) depth: usize,
}

/// Single-pass, consuming iterator over tree entries.
pub(crate) struct TreeIter<'a> {
    entries: VecDeque<TreeEntry<'a>>,
}

impl<'a> Iterator for TreeIter<'a> {
    type Item = TreeEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.pop_front()
    }
}

fn entry<'a>(
    key: &str,
    prefix: &str,
    node: &'a ConditionNode,
    parent: Option<&'a ConditionNode>,
    depth: usize,
) -> TreeEntry<'a> {
    let full_key = if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    };
    TreeEntry {
        key_prefix: prefix.to_string(),
        key: key.to_string(),
        full_key,
        node,
        parent,
        depth,
    }
}

fn collect_preorder<'a>(
    node: &'a ConditionNode,
    prefix: &str,
    depth: usize,
    out: &mut VecDeque<TreeEntry<'a>>,
) {
    for (key, child) in &node.children {
        let item = entry(key, prefix, child, Some(node), depth);
        let child_prefix = item.full_key.clone();
        out.push_back(item);
        collect_preorder(child, &child_prefix, depth + 1, out);
    }
}

fn collect_postorder<'a>(
    node: &'a ConditionNode,
    prefix: &str,
    depth: usize,
    out: &mut VecDeque<TreeEntry<'a>>,
) {
    for (key, child) in &node.children {
        let item = entry(key, prefix, child, Some(node), depth);
        let child_prefix = item.full_key.clone();
        collect_postorder(child, &child_prefix, depth + 1, out);
        out.push_back(item);
    }
}

fn collect_leaves<'a>(
    node: &'a ConditionNode,
    prefix: &str,
    depth: usize,
    out: &mut VecDeque<TreeEntry<'a>>,
) {
    for (key, child) in &node.children {
        let item = entry(key, prefix, child, Some(node), depth);
        let child_prefix = item.full_key.clone();
        if child.children.is_empty() {
            out.push_back(item);
        } else {
            collect_leaves(child, &child_prefix, depth + 1, out);
        }
    }
}

fn write_node<W: Write>(out: &mut W, key: &str, node: &ConditionNode) -> Result<()> {
    wire::write_utf(out, key)?;
    wire::write_u8(out, node.kind.type_code())?;
    wire::write_i32(out, node.rank)?;
    wire::write_bool(out, node.inclusion)?;
    wire::write_i32(out, node.max_child_rank)?;
    match node.kind {
        NodeKind::Root | NodeKind::Implied => match &node.ranking_child {
            Some(child) => {
                wire::write_bool(out, true)?;
                wire::write_utf(out, child)?;
            }
            None => wire::write_bool(out, false)?,
        },
        NodeKind::In | NodeKind::Not => {}
    }
    wire::write_u32(out, node.children.len() as u32)?;
    for (child_key, child) in &node.children {
        write_node(out, child_key, child)?;
    }
    Ok(())
}

fn read_node<R: Read>(input: &mut R) -> Result<(String, ConditionNode)> {
    let key = wire::read_utf(input)?;
    let kind = NodeKind::from_type_code(wire::read_u8(input)?)?;
    let rank = wire::read_i32(input)?;
    let inclusion = wire::read_bool(input)?;
    let max_child_rank = wire::read_i32(input)?;
    let ranking_child = match kind {
        NodeKind::Root | NodeKind::Implied => {
            if wire::read_bool(input)? {
                Some(wire::read_utf(input)?)
            } else {
                None
            }
        }
        NodeKind::In | NodeKind::Not => None,
    };
    let child_count = wire::read_u32(input)?;
    let mut children = BTreeMap::new();
    for _ in 0..child_count {
        let (child_key, child) = read_node(input)?;
        children.insert(child_key, child);
    }
    Ok((
        key,
        ConditionNode {
            kind,
            rank,
            inclusion,
            max_child_rank,
            ranking_child,
            children,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn tree_with(rules: &[(&str, ConditionNode)]) -> ConditionTree {
        let mut tree = ConditionTree::new();
        for (key, node) in rules {
            tree.add(key, node.clone());
        }
        tree
    }

    fn subtree_max_rank(node: &ConditionNode) -> i32 {
        let mut max = -1;
        for child in node.children.values() {
            max = max.max(child.rank()).max(subtree_max_rank(child));
        }
        max
    }

    fn assert_caches_tight(node: &ConditionNode) {
        assert_eq!(node.max_child_rank(), subtree_max_rank(node));
        for child in node.children.values() {
            assert_caches_tight(child);
        }
    }

    #[test]
    fn inserted_key_is_found_with_its_rank_and_inclusion() {
        let tree = tree_with(&[
            ("pkg.A.m", ConditionNode::include(3)),
            ("pkg.B", ConditionNode::exclude(2)),
        ]);

        let found = tree.check("pkg.A.m");
        assert!(found.inclusion);
        assert!(found.rank >= 3);

        let excluded = tree.check("pkg.B");
        assert!(!excluded.inclusion);
        assert!(excluded.rank >= 2);
    }

    #[test]
    fn missing_key_answers_default_exclude() {
        let tree = tree_with(&[("pkg.A", ConditionNode::include(1))]);
        assert_eq!(tree.check("other.C"), Condition::default_exclude());
    }

    #[test]
    fn empty_tree_answers_root_condition() {
        let tree = ConditionTree::with_root(ConditionNode::root(true, 5));
        let cond = tree.check("anything.at.all");
        assert!(cond.inclusion);
        assert_eq!(cond.rank, 5);
    }

    #[test]
    fn trailing_wildcard_is_normalized() {
        let tree = tree_with(&[("pkg.A.*", ConditionNode::include(1))]);
        let cond = tree.check("pkg.A.m.sig");
        assert!(cond.inclusion);
    }

    #[test]
    fn higher_rank_exclusion_dominates_on_deeper_path() {
        let tree = tree_with(&[
            ("pkg", ConditionNode::include(1)),
            ("pkg.A.m", ConditionNode::exclude(5)),
        ]);
        let cond = tree.check("pkg.A.m");
        assert!(!cond.inclusion);
        assert_eq!(cond.rank, 5);
    }

    #[test]
    fn lower_rank_insert_does_not_replace() {
        let mut tree = tree_with(&[("pkg.A", ConditionNode::include(5))]);
        let changed = tree.add("pkg.A", ConditionNode::exclude(2));
        assert!(!changed);
        assert!(tree.check("pkg.A").inclusion);
    }

    #[test]
    fn equal_rank_insert_replaces() {
        let mut tree = tree_with(&[("pkg.A", ConditionNode::include(5))]);
        let changed = tree.add("pkg.A", ConditionNode::exclude(5));
        assert!(changed);
        assert!(!tree.check("pkg.A").inclusion);
    }

    #[test]
    fn replacement_migrates_children_when_subtree_outranks() {
        let mut tree = tree_with(&[
            ("pkg.A", ConditionNode::include(1)),
            ("pkg.A.m", ConditionNode::exclude(6)),
        ]);
        // Rank 2 beats the node (1) but not the subtree (6): children survive.
        tree.add("pkg.A", ConditionNode::include(2));
        assert!(!tree.check("pkg.A.m").inclusion);
        assert_caches_tight(tree.root());
    }

    #[test]
    fn replacement_prunes_when_rank_exceeds_subtree() {
        let mut tree = tree_with(&[
            ("pkg.A", ConditionNode::include(1)),
            ("pkg.A.m", ConditionNode::exclude(3)),
        ]);
        tree.add("pkg.A", ConditionNode::include(7));
        // Subtree dropped: the lookup now stops at pkg.A's rule.
        let cond = tree.check("pkg.A.m");
        assert!(cond.inclusion);
        assert_eq!(cond.rank, 7);
        assert_caches_tight(tree.root());
    }

    #[test]
    fn force_insert_outranks_everything_on_the_path() {
        let mut tree = tree_with(&[
            ("pkg", ConditionNode::include(4)),
            ("pkg.A.m", ConditionNode::include(9)),
        ]);
        tree.add_force("pkg.A.m", ConditionNode::exclude(0));
        let cond = tree.check("pkg.A.m");
        assert!(!cond.inclusion);
        assert!(cond.rank > 9);
        assert_caches_tight(tree.root());
    }

    #[test]
    fn max_child_rank_is_tight_after_mutations() {
        let mut tree = ConditionTree::new();
        tree.add("a.b.c", ConditionNode::include(2));
        tree.add("a.b.d", ConditionNode::exclude(8));
        tree.add("a.x", ConditionNode::include(5));
        tree.add_force("a.b.c", ConditionNode::include(0));
        assert_caches_tight(tree.root());
    }

    #[test]
    fn implied_node_surfaces_ranking_child_condition() {
        let tree = tree_with(&[
            ("pkg.A.m", ConditionNode::include(2)),
            ("pkg.A.n", ConditionNode::exclude(7)),
        ]);
        // Lookup terminating on the implied pkg.A surfaces its highest child.
        let cond = tree.check("pkg.A");
        assert!(!cond.inclusion);
        assert_eq!(cond.rank, 7);
    }

    #[test]
    fn any_inclusions_sees_buried_inclusion() {
        let tree = tree_with(&[
            ("pkg.A", ConditionNode::exclude(5)),
            ("pkg.B.deep.m", ConditionNode::include(1)),
        ]);
        assert!(tree.any_inclusions().inclusion);
    }

    #[test]
    fn any_inclusions_false_when_only_exclusions() {
        let tree = tree_with(&[("pkg.A", ConditionNode::exclude(5))]);
        assert!(!tree.any_inclusions().inclusion);
    }

    #[test]
    fn merge_copies_paths() {
        let mut left = tree_with(&[("pkg.A", ConditionNode::include(1))]);
        let right = tree_with(&[("pkg.B.m", ConditionNode::exclude(4))]);
        left.merge(&right);
        assert!(left.check("pkg.A").inclusion);
        assert!(!left.check("pkg.B.m").inclusion);
        assert_caches_tight(left.root());
    }

    #[test]
    fn merge_with_root_installs_override_and_pairs() {
        let mut tree = tree_with(&[("pkg.A", ConditionNode::include(3))]);
        tree.merge_with_root(
            ConditionNode::root(false, 1),
            &["pkg.A"],
            vec![ConditionNode::exclude(1)],
            true,
        )
        .expect("merge with root");
        assert!(!tree.check("pkg.A").inclusion);
    }

    #[test]
    fn clear_installs_fresh_root() {
        let mut tree = tree_with(&[("pkg.A", ConditionNode::include(3))]);
        tree.clear(ConditionNode::root(true, 1));
        assert!(tree.is_empty());
        assert!(tree.check("pkg.A").inclusion);
    }

    #[test]
    fn iterators_agree_on_node_count_and_order() {
        let tree = tree_with(&[
            ("a.b", ConditionNode::include(1)),
            ("a.c", ConditionNode::exclude(2)),
            ("d", ConditionNode::include(3)),
        ]);

        let pre: Vec<String> = tree.preorder().map(|e| e.full_key).collect();
        assert_eq!(pre, vec!["a", "a.b", "a.c", "d"]);

        let post: Vec<String> = tree.postorder().map(|e| e.full_key).collect();
        assert_eq!(post, vec!["a.b", "a.c", "a", "d"]);

        let leaves: Vec<String> = tree.leaves().map(|e| e.full_key).collect();
        assert_eq!(leaves, vec!["a.b", "a.c", "d"]);

        let depths: Vec<usize> = tree.preorder().map(|e| e.depth).collect();
        assert_eq!(depths, vec![0, 1, 1, 0]);
    }

    #[test]
    fn serialization_round_trip_preserves_answers() {
        let tree = tree_with(&[
            ("pkg.A.m", ConditionNode::include(3)),
            ("pkg.A.n", ConditionNode::exclude(7)),
            ("pkg.B", ConditionNode::include(1)),
            ("other", ConditionNode::exclude(2)),
        ]);

        let mut buf = Vec::new();
        tree.write_to(&mut buf).expect("serialize tree");
        let restored =
            ConditionTree::read_from(&mut Cursor::new(buf)).expect("deserialize tree");

        for key in [
            "pkg.A.m", "pkg.A.n", "pkg.A", "pkg.B", "pkg", "other", "missing.key",
        ] {
            assert_eq!(tree.check(key), restored.check(key), "key {key}");
        }
        assert_eq!(tree, restored);
    }

    #[test]
    fn deserialization_rejects_unknown_node_type() {
        let mut buf = Vec::new();
        crate::wire::write_utf(&mut buf, "").expect("key");
        crate::wire::write_u8(&mut buf, 9).expect("type code");
        assert!(ConditionTree::read_from(&mut Cursor::new(buf)).is_err());
    }
}
