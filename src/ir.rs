//! Register-transfer-level intermediate representation of a single function.
//!
//! A [`Flow`] owns every expression node and statement of the function in flat arenas. Nodes refer
//! to each other by [`ExprId`], and statements by [`StmtId`]; neither is ever freed while the flow
//! is alive, so removing a statement is a tombstone rather than a graph-wide rewrite, and
//! definition/use links never dangle.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::config::CONFIG;

/// An index into the expression arena of a [`Flow`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExprId(pub(crate) usize);

impl std::fmt::Debug for ExprId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// An index into the statement arena of a [`Flow`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StmtId(pub(crate) usize);

impl std::fmt::Debug for StmtId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "stmt{}", self.0)
    }
}

/// Binary operators
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum BinOp {
    /// Wrapping sum `lhs + rhs`
    Add,
    /// Wrapping subtraction `lhs - rhs`
    Sub,
    /// Wrapping multiplication `lhs * rhs`
    Mul,
    /// Bitwise AND
    And,
    /// Bitwise OR
    Or,
    /// Bitwise XOR
    Xor,
    /// Left shift `lhs << rhs`
    Shl,
    /// Logical right shift `lhs >> rhs`
    Shr,
    /// Comparison `lhs == rhs`
    Eq,
    /// Comparison `lhs != rhs`
    Ne,
    /// Signed comparison `lhs < rhs`
    Lt,
    /// Signed comparison `lhs <= rhs`
    Le,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::And => "&",
            BinOp::Or => "|",
            BinOp::Xor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
        }
    }

    /// Binding strength, as in C; higher binds tighter.
    pub fn precedence(&self) -> u8 {
        match self {
            BinOp::Mul => 10,
            BinOp::Add | BinOp::Sub => 9,
            BinOp::Shl | BinOp::Shr => 8,
            BinOp::Lt | BinOp::Le => 7,
            BinOp::Eq | BinOp::Ne => 6,
            BinOp::And => 5,
            BinOp::Xor => 4,
            BinOp::Or => 3,
        }
    }

    /// Evaluate on constants, wrapping on overflow
    pub fn fold(&self, a: i64, b: i64) -> i64 {
        match self {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::And => a & b,
            BinOp::Or => a | b,
            BinOp::Xor => a ^ b,
            BinOp::Shl => a.wrapping_shl(b as u32),
            BinOp::Shr => ((a as u64).wrapping_shr(b as u32)) as i64,
            BinOp::Eq => (a == b) as i64,
            BinOp::Ne => (a != b) as i64,
            BinOp::Lt => (a < b) as i64,
            BinOp::Le => (a <= b) as i64,
        }
    }
}

/// Unary operators
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum UnOp {
    /// Two's complement negation `-x`
    Neg,
    /// Logical negation `!x`
    Not,
}

impl UnOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnOp::Neg => "-",
            UnOp::Not => "!",
        }
    }
}

/// A node in the expression tree.
///
/// `Register`, `Deref`, and `Var` are _assignable_: they may appear on the left of an
/// [`Expr::Assign`], and carry an SSA `index` once they have been tagged.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Expr {
    /// A machine register location
    Register { name: String, index: Option<usize> },
    /// A memory read or write through the address computed by `inner`
    Deref { inner: ExprId, index: Option<usize> },
    /// The address of `inner`
    Address(ExprId),
    /// A synthesized variable. `origin` is a detached snapshot of the operand it replaced; it is
    /// not a child of this node and is never traversed.
    Var {
        name: String,
        index: Option<usize>,
        origin: ExprId,
    },
    /// An immediate value
    Value(i64),
    /// Binary arithmetic, bitwise, or comparison operation
    Binary { op: BinOp, lhs: ExprId, rhs: ExprId },
    /// Unary operation
    Unary { op: UnOp, operand: ExprId },
    /// A call to `target`. Calls may have arbitrary side effects.
    Call { target: ExprId, args: Vec<ExprId> },
    /// A merge of several SSA definitions of the same location at a control-flow join
    Theta(Vec<ExprId>),
    /// Assignment of `rhs` to the assignable `lhs`
    Assign { lhs: ExprId, rhs: ExprId },
    /// Conditional branch to `target` taken iff `cond` is non-zero
    Branch { cond: ExprId, target: u64 },
    /// Unconditional branch
    Goto(u64),
    /// Return from the function, optionally with a value
    Return(Option<ExprId>),
}

impl Expr {
    pub fn is_assignable(&self) -> bool {
        matches!(
            self,
            Expr::Register { .. } | Expr::Deref { .. } | Expr::Var { .. }
        )
    }

    /// The SSA index of an assignable expression, if it has been tagged
    pub fn index(&self) -> Option<usize> {
        match self {
            Expr::Register { index, .. } | Expr::Deref { index, .. } | Expr::Var { index, .. } => {
                *index
            }
            _ => None,
        }
    }

    /// Children in traversal order (left to right)
    pub fn children(&self) -> Vec<ExprId> {
        match self {
            Expr::Register { .. } | Expr::Var { .. } | Expr::Value(_) | Expr::Goto(_) => vec![],
            Expr::Deref { inner, .. } | Expr::Address(inner) => vec![*inner],
            Expr::Binary { lhs, rhs, .. } | Expr::Assign { lhs, rhs } => vec![*lhs, *rhs],
            Expr::Unary { operand, .. } => vec![*operand],
            Expr::Call { target, args } => std::iter::once(*target)
                .chain(args.iter().cloned())
                .collect(),
            Expr::Theta(ops) => ops.clone(),
            Expr::Branch { cond, .. } => vec![*cond],
            Expr::Return(v) => v.iter().cloned().collect(),
        }
    }

    /// Rebuild this expression with each child id passed through `f`
    fn map_children(&self, mut f: impl FnMut(ExprId) -> ExprId) -> Expr {
        match self {
            Expr::Register { .. }
            | Expr::Var { .. }
            | Expr::Value(_)
            | Expr::Goto(_) => self.clone(),
            Expr::Deref { inner, index } => Expr::Deref {
                inner: f(*inner),
                index: *index,
            },
            Expr::Address(inner) => Expr::Address(f(*inner)),
            Expr::Binary { op, lhs, rhs } => Expr::Binary {
                op: *op,
                lhs: f(*lhs),
                rhs: f(*rhs),
            },
            Expr::Unary { op, operand } => Expr::Unary {
                op: *op,
                operand: f(*operand),
            },
            Expr::Call { target, args } => Expr::Call {
                target: f(*target),
                args: args.iter().map(|&a| f(a)).collect(),
            },
            Expr::Theta(ops) => Expr::Theta(ops.iter().map(|&o| f(o)).collect()),
            Expr::Assign { lhs, rhs } => Expr::Assign {
                lhs: f(*lhs),
                rhs: f(*rhs),
            },
            Expr::Branch { cond, target } => Expr::Branch {
                cond: f(*cond),
                target: *target,
            },
            Expr::Return(v) => Expr::Return(v.map(f)),
        }
    }
}

/// Who owns a node
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Parent {
    /// Not reachable from any statement (snapshots, and nodes orphaned by replacement)
    Detached,
    /// A child of another node
    Expr(ExprId),
    /// The top-level expression of a statement
    Statement(StmtId),
}

/// SSA definition/use bookkeeping of a node. Links are non-owning: they are plain ids into the same
/// flow.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub enum SsaLink {
    #[default]
    None,
    /// This node is a definition site; `uses` are the nodes that read it.
    Definition { uses: Vec<ExprId> },
    /// This node reads a definition. `None` refers to the value live on function entry.
    Use { definition: Option<ExprId> },
}

#[derive(Clone, Debug)]
pub struct Node {
    pub expr: Expr,
    pub parent: Parent,
    pub ssa: SsaLink,
}

/// One instruction-level operation within a block.
#[derive(Clone, Debug)]
pub struct Statement {
    /// Address of the machine instruction this statement was lowered from
    pub address: u64,
    /// The top-level expression
    pub expr: ExprId,
    /// Address of the block holding this statement
    pub block: u64,
    /// Whether this statement has been removed from its block
    pub removed: bool,
}

/// A basic block.
#[derive(Clone, Debug)]
pub struct Block {
    pub address: u64,
    /// Addresses of the machine instructions making up this block
    pub instructions: Vec<u64>,
    /// Live statements, in execution order
    pub container: Vec<StmtId>,
    /// Addresses of successor blocks
    pub successors: Vec<u64>,
}

/// The function being decompiled.
#[derive(Clone)]
pub struct Flow {
    /// Entry address of the function
    pub entry: u64,
    nodes: Vec<Node>,
    statements: Vec<Statement>,
    /// Blocks, keyed by (and iterated in order of) their start address
    blocks: BTreeMap<u64, Block>,
}

impl Flow {
    /// A new, empty flow for the function at `entry`
    pub fn new(entry: u64) -> Self {
        Self {
            entry,
            nodes: Vec::new(),
            statements: Vec::new(),
            blocks: BTreeMap::new(),
        }
    }

    /// Add a block at `address` made of the given instructions, with no statements yet
    pub fn add_block(&mut self, address: u64, instructions: Vec<u64>, successors: Vec<u64>) {
        let prev = self.blocks.insert(
            address,
            Block {
                address,
                instructions,
                container: vec![],
                successors,
            },
        );
        assert!(prev.is_none(), "Block {:#x} added twice", address);
    }

    pub fn block(&self, address: u64) -> Option<&Block> {
        self.blocks.get(&address)
    }

    /// All blocks, in ascending address order
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    /// Predecessor block addresses of the block at `address`
    pub fn predecessors(&self, address: u64) -> Vec<u64> {
        self.blocks
            .values()
            .filter(|b| b.successors.contains(&address))
            .map(|b| b.address)
            .collect()
    }

    /// Allocate a new node holding `expr`, adopting its children.
    pub fn alloc(&mut self, expr: Expr) -> ExprId {
        let id = ExprId(self.nodes.len());
        for c in expr.children() {
            self.nodes[c.0].parent = Parent::Expr(id);
        }
        self.nodes.push(Node {
            expr,
            parent: Parent::Detached,
            ssa: SsaLink::None,
        });
        id
    }

    pub fn node(&self, id: ExprId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.nodes[id.0].expr
    }

    pub fn link(&self, id: ExprId) -> &SsaLink {
        &self.nodes[id.0].ssa
    }

    pub fn set_link(&mut self, id: ExprId, link: SsaLink) {
        self.nodes[id.0].ssa = link;
    }

    pub(crate) fn link_mut(&mut self, id: ExprId) -> &mut SsaLink {
        &mut self.nodes[id.0].ssa
    }

    /// Set the SSA index of an assignable node. Panics if the node is not assignable.
    pub fn set_index(&mut self, id: ExprId, new_index: Option<usize>) {
        match &mut self.nodes[id.0].expr {
            Expr::Register { index, .. } | Expr::Deref { index, .. } | Expr::Var { index, .. } => {
                *index = new_index
            }
            e => panic!("Tried to set SSA index on non-assignable {:?}", e),
        }
    }

    /// Number of nodes ever allocated, including detached ones
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Replace the contents of node `id` with `expr`, in place. The node keeps its parent and its
    /// SSA link; old children that are not reused by `expr` become detached.
    pub fn replace(&mut self, id: ExprId, expr: Expr) {
        for c in self.nodes[id.0].expr.children() {
            self.nodes[c.0].parent = Parent::Detached;
        }
        for c in expr.children() {
            self.nodes[c.0].parent = Parent::Expr(id);
        }
        self.nodes[id.0].expr = expr;
    }

    /// Put the existing node `new` in the place `old` holds in its parent. `old` becomes detached.
    /// Unlike [`Self::replace`], this keeps the identity (and SSA link) of `new`.
    pub fn replace_in_parent(&mut self, old: ExprId, new: ExprId) {
        let parent = self.nodes[old.0].parent;
        match parent {
            Parent::Expr(p) => {
                let e = self.nodes[p.0]
                    .expr
                    .map_children(|c| if c == old { new } else { c });
                self.nodes[p.0].expr = e;
            }
            Parent::Statement(s) => self.statements[s.0].expr = new,
            Parent::Detached => {}
        }
        self.nodes[new.0].parent = parent;
        self.nodes[old.0].parent = Parent::Detached;
    }

    /// Children of `id`, left to right
    pub fn children(&self, id: ExprId) -> Vec<ExprId> {
        self.nodes[id.0].expr.children()
    }

    /// The parent node of `id`, if `id` is nested inside another expression
    pub fn parent_expr(&self, id: ExprId) -> Option<ExprId> {
        match self.nodes[id.0].parent {
            Parent::Expr(p) => Some(p),
            Parent::Statement(_) | Parent::Detached => None,
        }
    }

    /// The statement that (transitively) holds `id`, if any
    pub fn statement_of(&self, id: ExprId) -> Option<StmtId> {
        let mut cur = id;
        loop {
            match self.nodes[cur.0].parent {
                Parent::Expr(p) => cur = p,
                Parent::Statement(s) => return Some(s),
                Parent::Detached => return None,
            }
        }
    }

    /// Whether `id` is reachable from a live statement
    pub fn is_live(&self, id: ExprId) -> bool {
        self.statement_of(id)
            .map(|s| !self.statements[s.0].removed)
            .unwrap_or(false)
    }

    /// Deep copy of the subtree at `id`. Uses inside the copy are registered with their
    /// definitions, so the copy is a legitimate new reader of the same values.
    pub fn copy_subtree(&mut self, id: ExprId) -> ExprId {
        self.copy_rec(id, true)
    }

    /// Deep copy of the subtree at `id`, with no SSA links at all. Used for keeping a record of
    /// what an operand looked like before it was rewritten.
    pub fn snapshot(&mut self, id: ExprId) -> ExprId {
        self.copy_rec(id, false)
    }

    fn copy_rec(&mut self, orig: ExprId, linked: bool) -> ExprId {
        let children = self.nodes[orig.0].expr.children();
        let copies: Vec<ExprId> = children
            .iter()
            .map(|&c| self.copy_rec(c, linked))
            .collect();
        let mut it = copies.into_iter();
        let expr = self.nodes[orig.0].expr.map_children(|_| {
            it.next()
                .expect("map_children visits children in the same order as children()")
        });
        let new = self.alloc(expr);
        if linked {
            if let SsaLink::Use { definition } = self.nodes[orig.0].ssa.clone() {
                self.nodes[new.0].ssa = SsaLink::Use { definition };
                if let Some(d) = definition {
                    if let SsaLink::Definition { uses } = &mut self.nodes[d.0].ssa {
                        uses.push(new);
                    }
                }
            }
        }
        new
    }

    /// Drop all SSA links of `id`: detach it from its definition's use list if it is a use, and
    /// point its uses at the entry value if it is a definition.
    pub fn unlink(&mut self, id: ExprId) {
        match std::mem::take(&mut self.nodes[id.0].ssa) {
            SsaLink::None => {}
            SsaLink::Use { definition } => {
                if let Some(d) = definition {
                    if let SsaLink::Definition { uses } = &mut self.nodes[d.0].ssa {
                        uses.retain(|&u| u != id);
                    }
                }
            }
            SsaLink::Definition { uses } => {
                for u in uses {
                    self.nodes[u.0].ssa = SsaLink::Use { definition: None };
                }
            }
        }
    }

    /// Drop the SSA links of every node in the subtree at `id`
    pub fn unlink_subtree(&mut self, id: ExprId) {
        for c in self.nodes[id.0].expr.children() {
            self.unlink_subtree(c);
        }
        self.unlink(id);
    }

    /// The uses recorded for definition `id`; empty if `id` is not a definition site.
    pub fn uses_of(&self, id: ExprId) -> &[ExprId] {
        match &self.nodes[id.0].ssa {
            SsaLink::Definition { uses } => uses,
            _ => &[],
        }
    }

    /// Create a statement holding `expr` and append it to the block at `block`
    pub fn push_statement(&mut self, block: u64, address: u64, expr: ExprId) -> StmtId {
        let len = self.blocks[&block].container.len();
        self.insert_statement(block, len, address, expr)
    }

    /// Create a statement holding `expr` and insert it at `position` in the block at `block`
    pub fn insert_statement(
        &mut self,
        block: u64,
        position: usize,
        address: u64,
        expr: ExprId,
    ) -> StmtId {
        let id = StmtId(self.statements.len());
        self.statements.push(Statement {
            address,
            expr,
            block,
            removed: false,
        });
        self.nodes[expr.0].parent = Parent::Statement(id);
        self.blocks
            .get_mut(&block)
            .unwrap_or_else(|| panic!("No block at {:#x}", block))
            .container
            .insert(position, id);
        id
    }

    pub fn statement(&self, id: StmtId) -> &Statement {
        &self.statements[id.0]
    }

    /// Remove statement `id` from its block. The statement and its nodes stay in the arenas as a
    /// tombstone.
    pub fn remove_statement(&mut self, id: StmtId) {
        let stmt = &mut self.statements[id.0];
        assert!(!stmt.removed, "Statement {:?} removed twice", id);
        stmt.removed = true;
        let block = stmt.block;
        self.blocks
            .get_mut(&block)
            .expect("statements always belong to an existing block")
            .container
            .retain(|&s| s != id);
    }

    /// All live statements: blocks in address order, then container order
    pub fn statements(&self) -> Vec<StmtId> {
        self.blocks
            .values()
            .flat_map(|b| b.container.iter().cloned())
            .collect()
    }

    /// Operands of statement `id`: every node below its top-level expression, outer-to-inner and
    /// left-to-right (pre-order).
    pub fn operands_of(&self, id: StmtId) -> Vec<ExprId> {
        let mut result = vec![];
        let root = self.statements[id.0].expr;
        for c in self.nodes[root.0].expr.children() {
            self.preorder(c, &mut result);
        }
        result
    }

    fn preorder(&self, id: ExprId, out: &mut Vec<ExprId>) {
        out.push(id);
        for c in self.nodes[id.0].expr.children() {
            self.preorder(c, out);
        }
    }

    /// A displayable view of the expression at `id`
    pub fn display(&self, id: ExprId) -> DisplayExpr<'_> {
        DisplayExpr { flow: self, id }
    }

    /// A debugging-friendly view on the whole flow
    pub fn debug_flow(&self) -> DebugFlow<'_> {
        DebugFlow {
            flow: self,
            show_addresses: CONFIG.debug_print_addresses,
        }
    }

    /// Render the statement `id` as text
    pub fn statement_text(&self, id: StmtId) -> String {
        self.display(self.statements[id.0].expr).to_string()
    }
}

/// Display adapter for a single expression of a [`Flow`].
pub struct DisplayExpr<'a> {
    flow: &'a Flow,
    id: ExprId,
}

impl DisplayExpr<'_> {
    fn child(&self, id: ExprId) -> Self {
        DisplayExpr {
            flow: self.flow,
            id,
        }
    }

    fn write_operand(&self, f: &mut std::fmt::Formatter, id: ExprId) -> std::fmt::Result {
        match self.flow.expr(id) {
            Expr::Binary { .. } => write!(f, "({})", self.child(id)),
            _ => write!(f, "{}", self.child(id)),
        }
    }
}

impl std::fmt::Display for DisplayExpr<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        fn suffix(index: &Option<usize>) -> String {
            index.map(|i| format!("@{}", i)).unwrap_or_default()
        }
        match self.flow.expr(self.id) {
            Expr::Register { name, index } => write!(f, "{}{}", name, suffix(index)),
            Expr::Deref { inner, index } => {
                write!(f, "[{}]{}", self.child(*inner), suffix(index))
            }
            Expr::Address(inner) => {
                write!(f, "&")?;
                self.write_operand(f, *inner)
            }
            Expr::Var { name, index, .. } => write!(f, "{}{}", name, suffix(index)),
            Expr::Value(v) => {
                if v.unsigned_abs() >= 0x1000 {
                    if *v < 0 {
                        write!(f, "-{:#x}", v.unsigned_abs())
                    } else {
                        write!(f, "{:#x}", v)
                    }
                } else {
                    write!(f, "{}", v)
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                self.write_operand(f, *lhs)?;
                write!(f, " {} ", op.symbol())?;
                self.write_operand(f, *rhs)
            }
            Expr::Unary { op, operand } => {
                write!(f, "{}", op.symbol())?;
                self.write_operand(f, *operand)
            }
            Expr::Call { target, args } => write!(
                f,
                "call {}({})",
                self.child(*target),
                args.iter().map(|&a| self.child(a).to_string()).join(", ")
            ),
            Expr::Theta(ops) => write!(
                f,
                "THETA({})",
                ops.iter().map(|&o| self.child(o).to_string()).join(", ")
            ),
            Expr::Assign { lhs, rhs } => {
                write!(f, "{} = {}", self.child(*lhs), self.child(*rhs))
            }
            Expr::Branch { cond, target } => {
                write!(f, "if {} goto {:#x}", self.child(*cond), target)
            }
            Expr::Goto(target) => write!(f, "goto {:#x}", target),
            Expr::Return(None) => write!(f, "return"),
            Expr::Return(Some(v)) => write!(f, "return {}", self.child(*v)),
        }
    }
}

/// A debugging-friendly view on a flow.
pub struct DebugFlow<'a> {
    flow: &'a Flow,
    show_addresses: bool,
}

impl std::fmt::Debug for DebugFlow<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "Flow({:#x})", self.flow.entry)?;
        for block in self.flow.blocks() {
            writeln!(f)?;
            write!(f, "{:#x}:", block.address)?;
            if !block.successors.is_empty() {
                write!(
                    f,
                    "  -> {}",
                    block
                        .successors
                        .iter()
                        .map(|s| format!("{:#x}", s))
                        .join(", ")
                )?;
            }
            writeln!(f)?;
            for &s in &block.container {
                if self.show_addresses {
                    write!(f, "  [{:#x}]", self.flow.statement(s).address)?;
                }
                writeln!(f, "    {}", self.flow.statement_text(s))?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.debug_flow().fmt(f)
    }
}

impl Flow {
    /// Render the block graph as a GraphViz graph, onto `w`
    pub fn render_dot<W: std::io::Write>(&self, w: &mut W) -> std::io::Result<()> {
        type Node = u64;
        type Edge = (u64, u64);

        struct Graph<'a> {
            flow: &'a Flow,
        }

        impl<'a> dot::Labeller<'a, Node, Edge> for Graph<'a> {
            fn graph_id(&'a self) -> dot::Id<'a> {
                dot::Id::new(format!("flow_{:x}", self.flow.entry)).unwrap()
            }
            fn node_id(&'a self, n: &Node) -> dot::Id<'a> {
                dot::Id::new(format!("b{:x}", n)).unwrap()
            }
            fn node_label<'b>(&'b self, n: &Node) -> dot::LabelText<'b> {
                let block = &self.flow.blocks[n];
                let body = block
                    .container
                    .iter()
                    .map(|&s| self.flow.statement_text(s))
                    .join("\n");
                dot::LabelText::escaped(
                    format!("{:#x}:\n{}\n", n, body)
                        .replace('"', "\\\"")
                        .replace('\n', "\\l"),
                )
            }
            fn node_shape(&'a self, _n: &Node) -> Option<dot::LabelText<'a>> {
                Some(dot::LabelText::label("box"))
            }
        }

        impl<'a> dot::GraphWalk<'a, Node, Edge> for Graph<'a> {
            fn nodes(&self) -> dot::Nodes<'a, Node> {
                self.flow.blocks.keys().cloned().collect::<Vec<_>>().into()
            }
            fn edges(&'a self) -> dot::Edges<'a, Edge> {
                self.flow
                    .blocks
                    .values()
                    .flat_map(|b| b.successors.iter().map(move |&s| (b.address, s)))
                    .collect::<Vec<_>>()
                    .into()
            }
            fn source(&self, e: &Edge) -> Node {
                e.0
            }
            fn target(&self, e: &Edge) -> Node {
                e.1
            }
        }

        dot::render(&Graph { flow: self }, w)
    }

    /// Generate a `.dot` file representing the block graph
    pub fn generate_dot(&self) -> String {
        let mut s: Vec<u8> = vec![];
        self.render_dot(&mut s)
            .expect("writing into a Vec<u8> cannot fail");
        String::from_utf8(s).expect("dot output is always valid UTF-8")
    }
}
