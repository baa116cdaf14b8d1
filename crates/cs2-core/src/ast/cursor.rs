use super::{Ast, NodeId};
use crate::error::{CoreError, Result};

/// Post-order walk over a tree that is being rewritten underneath it.
///
/// The cursor keeps the path from the root to the current node. Rewrites
/// go through the cursor (or are followed by [`rebuild_stack`]) so the
/// path stays valid. A stalled cursor returns the current node once more
/// on the next step instead of advancing.
///
/// [`rebuild_stack`]: RewriteCursor::rebuild_stack
#[derive(Debug, Clone)]
pub struct RewriteCursor {
    root: NodeId,
    stack: Vec<NodeId>,
    stalled: bool,
}

impl RewriteCursor {
    pub fn new(root: NodeId) -> Self {
        Self {
            root,
            stack: Vec::new(),
            stalled: true,
        }
    }

    pub fn current(&self) -> Option<NodeId> {
        self.stack.last().copied()
    }

    /// Move to the first leaf below `target`.
    pub fn set_first_child(&mut self, ast: &Ast, target: NodeId, stall: bool) -> Option<NodeId> {
        self.stalled = stall;
        if self.stack.last() != Some(&target) {
            self.stack.push(target);
        }
        let mut node = target;
        while let Some(&first) = ast.children(node).first() {
            self.stack.push(first);
            node = first;
        }
        self.current()
    }

    /// Detach the current node and step back to its predecessor.
    pub fn remove(&mut self, ast: &mut Ast) -> Result<Option<NodeId>> {
        let node = self
            .current()
            .ok_or_else(|| CoreError::Structure("no node selected".into()))?;
        let parent = ast
            .parent(node)
            .ok_or_else(|| CoreError::Structure("cannot remove the root node".into()))?;
        let prev = self.prev(ast);
        ast.remove_child(parent, node)?;
        Ok(prev)
    }

    /// Recompute the path after the current node moved.
    pub fn rebuild_stack(&mut self, ast: &Ast) {
        let Some(current) = self.current() else {
            return;
        };
        self.stack.clear();
        let mut node = Some(current);
        while let Some(n) = node {
            self.stack.push(n);
            node = ast.parent(n);
        }
        self.stack.reverse();
    }

    pub fn replace_node(&mut self, ast: &mut Ast, new: NodeId) -> Result<NodeId> {
        let node = self
            .current()
            .ok_or_else(|| CoreError::Structure("no node selected".into()))?;
        let parent = ast
            .parent(node)
            .ok_or_else(|| CoreError::Structure("cannot replace the root node".into()))?;
        ast.replace_child(parent, node, new)?;
        if let Some(top) = self.stack.last_mut() {
            *top = new;
        }
        Ok(new)
    }

    pub fn next(&mut self, ast: &Ast) -> Option<NodeId> {
        if self.stalled {
            self.stalled = false;
            if self.stack.is_empty() {
                return self.go_to_start(ast);
            }
            return self.current();
        }
        let current = self.stack.pop()?;
        let parent = *self.stack.last()?;
        let children = ast.children(parent);
        match children.iter().position(|&c| c == current) {
            Some(i) if i + 1 < children.len() => {
                let next = children[i + 1];
                self.set_first_child(ast, next, false)
            }
            Some(_) => Some(parent),
            // the node moved away, walk the parent again from its start
            None => match children.first() {
                Some(&first) => self.set_first_child(ast, first, false),
                None => Some(parent),
            },
        }
    }

    /// Step back to the node visited before the current one. At the start
    /// of the walk the cursor stalls so that [`next`](Self::next) restarts.
    pub fn prev(&mut self, ast: &Ast) -> Option<NodeId> {
        if self.stalled {
            self.stalled = false;
            return self.current();
        }
        let current = self.current()?;
        if let Some(&last) = ast.children(current).last() {
            self.stack.push(last);
            return Some(last);
        }
        loop {
            let node = self.stack.pop()?;
            let Some(&parent) = self.stack.last() else {
                self.stalled = true;
                return None;
            };
            let children = ast.children(parent);
            if let Some(i) = children.iter().position(|&c| c == node).filter(|&i| i > 0) {
                let prev = children[i - 1];
                self.stack.push(prev);
                return Some(prev);
            }
        }
    }

    pub fn go_to_start(&mut self, ast: &Ast) -> Option<NodeId> {
        self.stalled = false;
        self.stack.clear();
        self.set_first_child(ast, self.root, false)
    }
}
