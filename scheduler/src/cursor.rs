// cursor.rs — Version-scoped handles into a procedure
//
// A `Cursor` pairs a location with the version it was captured in. The
// location names statements by `NodeId`, so it survives edits that move
// those statements: `Proc::forward` re-resolves it in a newer version.
// Navigation never fails loudly; walking off the tree yields `None`.

use std::fmt;

use crate::ast::{Branch, Expr, Stmt, StmtKind};
use crate::id::NodeId;
use crate::proc::Proc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Before,
    After,
}

/// Expression position owned by a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExprSlot {
    Lo,
    Hi,
    Cond,
    Rhs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Loc {
    /// A statement.
    Node(NodeId),
    /// The gap immediately before or after a statement.
    Gap(NodeId, Side),
    /// Contiguous siblings from `first` through `last`.
    Block(NodeId, NodeId),
    Expr(NodeId, ExprSlot),
}

impl Loc {
    /// Statement ids this location depends on.
    pub fn ids(&self) -> Vec<NodeId> {
        match *self {
            Loc::Node(id) | Loc::Gap(id, _) | Loc::Expr(id, _) => vec![id],
            Loc::Block(first, last) => vec![first, last],
        }
    }

    /// The statement the location is anchored to; the first one for blocks.
    pub fn anchor(&self) -> NodeId {
        match *self {
            Loc::Node(id) | Loc::Gap(id, _) | Loc::Expr(id, _) | Loc::Block(id, _) => id,
        }
    }
}

#[derive(Clone)]
pub struct Cursor {
    snap: Proc,
    loc: Loc,
}

impl Cursor {
    pub(crate) fn new(snap: Proc, loc: Loc) -> Self {
        Self { snap, loc }
    }

    pub fn loc(&self) -> &Loc {
        &self.loc
    }

    /// The version this cursor was captured in.
    pub fn proc(&self) -> &Proc {
        &self.snap
    }

    pub fn version(&self) -> u32 {
        self.snap.version()
    }

    /// Statement id for node cursors.
    pub fn id(&self) -> Option<NodeId> {
        match self.loc {
            Loc::Node(id) => Some(id),
            _ => None,
        }
    }

    pub fn stmt(&self) -> Option<&Stmt> {
        self.snap.stmt(self.id()?)
    }

    /// Statements covered by a node or block cursor.
    pub fn stmts(&self) -> Vec<&Stmt> {
        match self.loc {
            Loc::Node(id) => self.snap.stmt(id).into_iter().collect(),
            Loc::Block(..) => match self.block_range() {
                Some((siblings, lo, hi)) => siblings[lo..=hi].iter().collect(),
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// Node cursors for each statement of a node or block cursor.
    pub fn nodes(&self) -> Vec<Cursor> {
        self.stmts().into_iter().map(|s| self.node(s.id)).collect()
    }

    /// Sibling list of the anchor statement and the anchor's index in it.
    fn siblings(&self) -> Option<(&[Stmt], usize)> {
        let path = self.snap.path(self.loc.anchor())?;
        let block = self.snap.block_containing(path)?;
        Some((block.as_slice(), path[path.len() - 1].index))
    }

    /// Sibling list and inclusive index range for node and block cursors.
    pub(crate) fn block_range(&self) -> Option<(&[Stmt], usize, usize)> {
        let (siblings, first) = self.siblings()?;
        match self.loc {
            Loc::Node(_) => Some((siblings, first, first)),
            Loc::Block(_, last) => {
                let path = self.snap.path(last)?;
                Some((siblings, first, path[path.len() - 1].index))
            }
            _ => None,
        }
    }

    fn node(&self, id: NodeId) -> Cursor {
        self.snap.cursor(Loc::Node(id))
    }

    // ── Navigation ──────────────────────────────────────────────────────────

    pub fn next(&self) -> Option<Cursor> {
        let (siblings, _, hi) = self.block_range()?;
        siblings.get(hi + 1).map(|s| self.node(s.id))
    }

    pub fn prev(&self) -> Option<Cursor> {
        let (siblings, lo, _) = self.block_range()?;
        let i = lo.checked_sub(1)?;
        Some(self.node(siblings[i].id))
    }

    /// Enclosing statement; for expression cursors, the owning statement.
    pub fn parent(&self) -> Option<Cursor> {
        match self.loc {
            Loc::Expr(id, _) => Some(self.node(id)),
            _ => self.snap.parent_of(self.loc.anchor()).map(|id| self.node(id)),
        }
    }

    /// Cursors to the statements of a loop or `if` body.
    pub fn body(&self) -> Vec<Cursor> {
        self.children(Branch::Body)
    }

    pub fn orelse(&self) -> Vec<Cursor> {
        self.children(Branch::OrElse)
    }

    fn children(&self, branch: Branch) -> Vec<Cursor> {
        self.stmt()
            .and_then(|s| s.block(branch))
            .map(|b| b.iter().map(|s| self.node(s.id)).collect())
            .unwrap_or_default()
    }

    pub fn before(&self) -> Option<Cursor> {
        match self.loc {
            Loc::Node(id) | Loc::Block(id, _) => {
                Some(self.snap.cursor(Loc::Gap(id, Side::Before)))
            }
            _ => None,
        }
    }

    pub fn after(&self) -> Option<Cursor> {
        match self.loc {
            Loc::Node(id) | Loc::Block(_, id) => Some(self.snap.cursor(Loc::Gap(id, Side::After))),
            _ => None,
        }
    }

    /// Grow a node or block cursor by `n_before` preceding and `n_after`
    /// following siblings.
    pub fn expand(&self, n_before: usize, n_after: usize) -> Option<Cursor> {
        let (siblings, lo, hi) = self.block_range()?;
        let lo = lo.checked_sub(n_before)?;
        let hi = hi + n_after;
        if hi >= siblings.len() {
            return None;
        }
        Some(
            self.snap
                .cursor(Loc::Block(siblings[lo].id, siblings[hi].id)),
        )
    }

    // ── Introspection ───────────────────────────────────────────────────────

    pub fn is_loop(&self) -> bool {
        self.stmt().is_some_and(Stmt::is_loop)
    }

    pub fn loop_var(&self) -> Option<&str> {
        self.stmt()?.as_loop().map(|l| l.var.as_str())
    }

    pub fn lo(&self) -> Option<Cursor> {
        self.slot(ExprSlot::Lo)
    }

    pub fn hi(&self) -> Option<Cursor> {
        self.slot(ExprSlot::Hi)
    }

    pub fn cond(&self) -> Option<Cursor> {
        self.slot(ExprSlot::Cond)
    }

    pub fn rhs(&self) -> Option<Cursor> {
        self.slot(ExprSlot::Rhs)
    }

    fn slot(&self, slot: ExprSlot) -> Option<Cursor> {
        let id = self.id()?;
        let c = self.snap.cursor(Loc::Expr(id, slot));
        if c.expr().is_some() { Some(c) } else { None }
    }

    /// Expression under an expression cursor.
    pub fn expr(&self) -> Option<&Expr> {
        let Loc::Expr(id, slot) = self.loc else {
            return None;
        };
        let s = self.snap.stmt(id)?;
        match (&s.kind, slot) {
            (StmtKind::For(l), ExprSlot::Lo) => Some(&l.lo),
            (StmtKind::For(l), ExprSlot::Hi) => Some(&l.hi),
            (StmtKind::If(i), ExprSlot::Cond) => Some(&i.cond),
            (StmtKind::Assign(st) | StmtKind::Reduce(st), ExprSlot::Rhs) => Some(&st.rhs),
            _ => None,
        }
    }

    /// Value of an integer literal expression.
    pub fn literal(&self) -> Option<i64> {
        self.expr()?.as_int()
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("proc", &self.snap.name())
            .field("version", &self.snap.version())
            .field("loc", &self.loc)
            .finish()
    }
}

impl PartialEq for Cursor {
    fn eq(&self, other: &Self) -> bool {
        self.loc == other.loc && self.snap.same_version(&other.snap)
    }
}
