//! Structured tree of one script.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]. Every
//! node has at most one parent; moving a node under a new parent detaches
//! it from the old one. Successor edges between code blocks are plain ids
//! and only matter while control flow is being recovered.
//!
//! Pipeline (see [`decompile`]):
//! 1. one [`NodeKind::CodeBlock`] per basic block, holding raw operations
//! 2. per block: increment folding, multi-assign coalescing, argument
//!    binding, function binds
//! 3. control flow recovery: if/else, `&&`/`||`, switch, while, merging of
//!    straight-line successors

mod build;
mod control;
mod cursor;

pub use build::decompile;
pub use cursor::RewriteCursor;

use crate::define_entity;
use crate::entity::PrimaryMap;
use crate::error::{CoreError, Result};
use crate::ops::named::{self, OpId, RETURN};
use crate::ops::{OpcodeRegistry, Operation};
use crate::stack::{StackDiff, StackInOut, StackList};

define_entity!(NodeId);

/// State of the join point computation of a code block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BranchEnd {
    #[default]
    Pending,
    Computing,
    Done(Option<NodeId>),
}

#[derive(Debug, Clone, Default)]
pub struct CodeBlock {
    pub script_id: u32,
    /// Instruction index of the first operation.
    pub start: usize,
    pub successors: Vec<NodeId>,
    pub predecessors: usize,
    pub first_pointer: Option<NodeId>,
    pub last_pointer: Option<NodeId>,
    /// Index past which this block may not absorb its successors.
    pub max_end: Option<usize>,
    pub branch_end: BranchEnd,
    /// Some operation in this block has no known stack effect.
    pub unexplained: bool,
}

#[derive(Debug, Clone)]
pub struct IfStatement {
    pub condition: NodeId,
    pub true_branch: NodeId,
    pub false_branch: Option<NodeId>,
    /// Block where both arms join again.
    pub end_block: Option<NodeId>,
    pub end_index: usize,
}

#[derive(Debug, Clone)]
pub struct SwitchStatement {
    pub value: Option<NodeId>,
    /// Case value and target block, in table order. Several values may
    /// share a block.
    pub cases: Vec<(i32, NodeId)>,
    pub default: Option<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposedKind {
    /// `v++`, evaluates to the old value.
    PostInc,
    PostDec,
    /// `++v`, evaluates to the new value.
    PreInc,
    PreDec,
}

/// An increment or decrement folded from the five operations implementing
/// it, kept verbatim for recompilation.
#[derive(Debug, Clone)]
pub struct ComposedOp {
    pub kind: ComposedKind,
    /// The variable read, `push*` form.
    pub target: Operation,
    pub ops: Vec<Operation>,
}

#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub args: StackList,
    pub returns: StackList,
    /// Local slots including the argument slots.
    pub locals: StackDiff,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    RawOp(Operation),
    CodeBlock(CodeBlock),
    If(IfStatement),
    While { condition: NodeId, body: NodeId },
    Switch(SwitchStatement),
    /// Comparison or synthetic `&&`/`||`; children are the two operands.
    Branching(OpId),
    /// Pops into the targets, reverse pop order; children are the values.
    VarAssign { targets: Vec<Operation> },
    Composed(ComposedOp),
    /// Script reference with bound arguments, packed into a vararg. The
    /// first child is the script id.
    FunctionBind { tag: String },
    /// Call of a function defined in the same unit; children are the args.
    Subcall { name: String },
    Intrinsic { name: String },
    /// Single child: the body block.
    Function(FunctionDef),
}

#[derive(Debug, Clone)]
pub struct AstNode {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Instruction the node was decoded from, `None` for synthetic nodes.
    pub original_index: Option<usize>,
    pub known_stack: Option<StackInOut>,
}

#[derive(Debug, Clone, Default)]
pub struct Ast {
    nodes: PrimaryMap<NodeId, AstNode>,
}

impl std::ops::Index<NodeId> for Ast {
    type Output = AstNode;
    fn index(&self, id: NodeId) -> &AstNode {
        &self.nodes[id]
    }
}

impl std::ops::IndexMut<NodeId> for Ast {
    fn index_mut(&mut self, id: NodeId) -> &mut AstNode {
        &mut self.nodes[id]
    }
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add(&mut self, kind: NodeKind, original_index: Option<usize>) -> NodeId {
        self.nodes.push(AstNode {
            kind,
            parent: None,
            children: Vec::new(),
            original_index,
            known_stack: None,
        })
    }

    /// Add a node with `children` attached in order.
    pub fn add_with(&mut self, kind: NodeKind, children: &[NodeId]) -> Result<NodeId> {
        let id = self.add(kind, None);
        self.push_list(id, children)?;
        Ok(id)
    }

    pub fn raw(&mut self, op: Operation) -> NodeId {
        self.add(NodeKind::RawOp(op), None)
    }

    pub fn code_block(&mut self, script_id: u32, start: usize) -> NodeId {
        self.add(
            NodeKind::CodeBlock(CodeBlock {
                script_id,
                start,
                ..Default::default()
            }),
            Some(start),
        )
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id].kind
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn raw_op(&self, id: NodeId) -> Option<&Operation> {
        match &self.nodes[id].kind {
            NodeKind::RawOp(op) => Some(op),
            _ => None,
        }
    }

    pub fn block(&self, id: NodeId) -> Option<&CodeBlock> {
        match &self.nodes[id].kind {
            NodeKind::CodeBlock(b) => Some(b),
            _ => None,
        }
    }

    pub fn block_mut(&mut self, id: NodeId) -> Option<&mut CodeBlock> {
        match &mut self.nodes[id].kind {
            NodeKind::CodeBlock(b) => Some(b),
            _ => None,
        }
    }

    fn expect_block(&self, id: NodeId) -> Result<&CodeBlock> {
        self.block(id)
            .ok_or_else(|| CoreError::Structure(format!("{id} is not a code block")))
    }

    /// Position used to order blocks.
    pub fn start_of(&self, id: NodeId) -> usize {
        match &self.nodes[id].kind {
            NodeKind::CodeBlock(b) => b.start,
            _ => self.nodes[id].original_index.unwrap_or(usize::MAX),
        }
    }

    /// Stack effect of a node as seen by its consumers.
    pub fn stack<'a>(&'a self, id: NodeId, registry: &'a OpcodeRegistry) -> Option<&'a StackInOut> {
        let node = &self.nodes[id];
        if let Some(known) = &node.known_stack {
            return Some(known);
        }
        match &node.kind {
            NodeKind::RawOp(op) => registry.stack_of(op.opcode),
            _ => None,
        }
    }

    // ---------------------------------------------------------------------
    // Tree edits
    // ---------------------------------------------------------------------

    fn detach(&mut self, child: NodeId) {
        if let Some(parent) = self.nodes[child].parent.take() {
            self.nodes[parent].children.retain(|&c| c != child);
        }
    }

    pub fn push(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        if parent == child {
            return Err(CoreError::Structure(format!("tried to add {child} to itself")));
        }
        self.detach(child);
        self.nodes[parent].children.push(child);
        self.nodes[child].parent = Some(parent);
        Ok(())
    }

    pub fn push_list(&mut self, parent: NodeId, children: &[NodeId]) -> Result<()> {
        for &child in children {
            self.push(parent, child)?;
        }
        Ok(())
    }

    pub fn unshift(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        if parent == child {
            return Err(CoreError::Structure(format!("tried to add {child} to itself")));
        }
        self.detach(child);
        self.nodes[parent].children.insert(0, child);
        self.nodes[child].parent = Some(parent);
        Ok(())
    }

    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        let index = self.nodes[parent]
            .children
            .iter()
            .position(|&c| c == child)
            .ok_or_else(|| CoreError::Structure(format!("{child} is not a child of {parent}")))?;
        self.nodes[parent].children.remove(index);
        self.nodes[child].parent = None;
        Ok(())
    }

    pub fn replace_child(&mut self, parent: NodeId, old: NodeId, new: NodeId) -> Result<()> {
        if new == parent {
            return Err(CoreError::Structure(format!("tried to add {new} to itself")));
        }
        self.detach(new);
        let index = self.nodes[parent]
            .children
            .iter()
            .position(|&c| c == old)
            .ok_or_else(|| CoreError::Structure(format!("{old} is not a child of {parent}")))?;
        self.nodes[parent].children[index] = new;
        self.nodes[new].parent = Some(parent);
        self.nodes[old].parent = None;
        Ok(())
    }

    /// Replace the children of `parent` wholesale.
    pub fn set_children(&mut self, parent: NodeId, children: Vec<NodeId>) -> Result<()> {
        for child in std::mem::take(&mut self.nodes[parent].children) {
            self.nodes[child].parent = None;
        }
        self.push_list(parent, &children)
    }

    /// Nodes below `root` in pre-order, `root` included.
    pub fn descendants(&self, root: NodeId) -> Vec<NodeId> {
        let mut res = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            res.push(id);
            stack.extend(self.nodes[id].children.iter().rev());
        }
        res
    }

    // ---------------------------------------------------------------------
    // Code block graph
    // ---------------------------------------------------------------------

    pub fn add_successor(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        let from_start = self.expect_block(from)?.start;
        let to_start = self.expect_block(to)?.start;
        if self.expect_block(from)?.successors.contains(&to) {
            return Err(CoreError::Structure(format!("{to} added as successor of {from} twice")));
        }
        let first = self.expect_block(to)?.first_pointer.map(|p| self.start_of(p));
        let last = self.expect_block(to)?.last_pointer.map(|p| self.start_of(p));
        if let Some(target) = self.block_mut(to) {
            target.predecessors += 1;
            if from_start < to_start && first.map_or(true, |f| from_start < f) {
                target.first_pointer = Some(from);
            }
            if from_start > to_start && last.map_or(true, |l| from_start > l) {
                target.last_pointer = Some(from);
                target.max_end = Some(from_start);
            }
        }
        if let Some(source) = self.block_mut(from) {
            source.successors.push(to);
        }
        Ok(())
    }

    /// The block where all paths out of `id` join again, memoized.
    /// `None` when the paths never join (returns, loops back).
    pub fn find_next(&mut self, id: NodeId) -> Option<NodeId> {
        let (successors, start) = match self.block(id) {
            Some(b) => match b.branch_end {
                BranchEnd::Done(end) => return end,
                BranchEnd::Computing => return None,
                BranchEnd::Pending => (b.successors.clone(), b.start),
            },
            None => return None,
        };
        if let Some(b) = self.block_mut(id) {
            b.branch_end = BranchEnd::Computing;
        }
        let end = match successors.as_slice() {
            [] => None,
            [only] if self.start_of(*only) < start => None,
            [only] => Some(*only),
            _ => {
                let mut options: Vec<Option<NodeId>> = successors.into_iter().map(Some).collect();
                let cap = self.len() * options.len() + 1;
                let mut res = None;
                for _ in 0..cap {
                    let Some(first) = options.iter().flatten().copied().min_by_key(|&n| self.start_of(n)) else {
                        break;
                    };
                    if options.iter().all(|o| o.map_or(true, |o| o == first)) {
                        res = Some(first);
                        break;
                    }
                    let next = self.find_next(first);
                    if let Some(slot) = options.iter_mut().find(|o| **o == Some(first)) {
                        *slot = next;
                    }
                }
                res
            }
        };
        if let Some(b) = self.block_mut(id) {
            b.branch_end = BranchEnd::Done(end);
        }
        end
    }

    /// Absorb `block` into `into`: its children when flattening, else the
    /// block itself. `into` takes over the successors of `block`.
    pub fn merge_block(&mut self, into: NodeId, block: NodeId, flatten: bool) -> Result<()> {
        if flatten {
            let children = std::mem::take(&mut self.nodes[block].children);
            for &child in &children {
                self.nodes[child].parent = None;
            }
            self.push_list(into, &children)?;
        } else {
            self.push(into, block)?;
        }
        let (successors, branch_end) = {
            let b = self.expect_block(block)?;
            (b.successors.clone(), b.branch_end)
        };
        if let Some(b) = self.block_mut(into) {
            b.successors = successors;
            b.branch_end = branch_end;
        }
        Ok(())
    }

    /// Block ends in a `return` and has nowhere else to go.
    pub fn is_terminal_block(&self, id: NodeId) -> bool {
        let Some(b) = self.block(id) else {
            return false;
        };
        b.successors.is_empty()
            && b.last_pointer.is_none()
            && self.nodes[id]
                .children
                .last()
                .and_then(|&c| self.raw_op(c))
                .is_some_and(|op| op.opcode == RETURN)
    }

    /// A block holding nothing but one `jump`.
    pub fn is_lone_jump(&self, id: NodeId) -> bool {
        matches!(self.nodes[id].children.as_slice(), [only] if self.raw_op(*only).is_some_and(|op| op.opcode == named::JUMP))
    }

    // ---------------------------------------------------------------------
    // Statements
    // ---------------------------------------------------------------------

    pub fn if_statement(&self, id: NodeId) -> Option<&IfStatement> {
        match &self.nodes[id].kind {
            NodeKind::If(s) => Some(s),
            _ => None,
        }
    }

    /// Create an if node over the given parts.
    pub fn new_if(
        &mut self,
        condition: NodeId,
        true_branch: NodeId,
        false_branch: Option<NodeId>,
        end_block: Option<NodeId>,
        end_index: usize,
    ) -> Result<NodeId> {
        if Some(true_branch) == false_branch {
            return Err(CoreError::Structure("if with identical branches".into()));
        }
        let original_index = self.nodes[condition].original_index;
        let id = self.add(
            NodeKind::If(IfStatement {
                condition,
                true_branch,
                false_branch,
                end_block,
                end_index,
            }),
            original_index,
        );
        self.set_if_branches(id, condition, true_branch, false_branch)?;
        Ok(id)
    }

    /// Rewire an if node. Children are kept in instruction order so that
    /// later `&&`/`||` merges see the branches the way they were laid out.
    pub fn set_if_branches(
        &mut self,
        id: NodeId,
        condition: NodeId,
        true_branch: NodeId,
        false_branch: Option<NodeId>,
    ) -> Result<()> {
        let end_index = match &mut self.nodes[id].kind {
            NodeKind::If(s) => {
                s.condition = condition;
                s.true_branch = true_branch;
                s.false_branch = false_branch;
                s.end_index
            }
            _ => return Err(CoreError::Structure(format!("{id} is not an if statement"))),
        };
        for branch in std::iter::once(true_branch).chain(false_branch) {
            if let Some(b) = self.block_mut(branch) {
                b.max_end = Some(end_index);
            }
        }
        let mut order = vec![condition];
        match false_branch {
            Some(f) if self.start_of(f) < self.start_of(true_branch) => order.extend([f, true_branch]),
            Some(f) => order.extend([true_branch, f]),
            None => order.push(true_branch),
        }
        self.set_children(id, order)
    }
}
