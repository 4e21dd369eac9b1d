// proc.rs — Persistent procedure versions
//
// A `Proc` is an immutable snapshot of one procedure, shared by `Arc`.
// Edits never mutate a version: they copy it into an `Editor`, rewrite the
// copy, and `finish()` it into the successor version of the same lineage.
// Each version records the keys of all of its ancestors, so a cursor can be
// forwarded exactly when it was captured in an ancestor (or the same)
// version.
//
// Preconditions: statement ids are unique within a version.
// Postconditions: `finish()` produces `version + 1` with a rebuilt id index.
// Failure modes: cursor misuse yields `StaleCursor` / `ForwardingFailure`.
// Side effects: a process-wide counter hands out version keys.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::ast::{Branch, ProcDef, Stmt, StmtKind};
use crate::cursor::{Cursor, Loc};
use crate::error::{EditError, EditResult, LoadError};
use crate::id::{NodeId, NodeIdAllocator};
use crate::walk;

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

fn next_key() -> u64 {
    NEXT_KEY.fetch_add(1, Ordering::Relaxed)
}

/// One step of a statement path: the `branch` block of the current
/// container, element `index`. The first step always selects the
/// procedure body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Step {
    pub branch: Branch,
    pub index: usize,
}

struct Version {
    def: ProcDef,
    /// Keys of every version in this lineage up to and including this one;
    /// `history[v]` is the key of version `v`.
    history: Vec<u64>,
    next_id: u32,
    paths: HashMap<NodeId, Vec<Step>>,
}

/// Immutable, cheaply clonable procedure version.
#[derive(Clone)]
pub struct Proc {
    inner: Arc<Version>,
}

impl Proc {
    /// Start a new lineage. Statement ids are reassigned in pre-order.
    pub fn from_def(mut def: ProcDef) -> Self {
        let mut ids = NodeIdAllocator::new();
        walk::renumber(&mut def.body, &mut ids);
        Self::build(def, vec![next_key()], ids.peek())
    }

    /// Parse a single-procedure source.
    pub fn parse(source: &str) -> Result<Self, LoadError> {
        crate::parser::parse_proc(source).map(Self::from_def)
    }

    fn build(def: ProcDef, history: Vec<u64>, next_id: u32) -> Self {
        let mut paths = HashMap::new();
        index_block(&def.body, Branch::Body, &mut Vec::new(), &mut paths);
        Proc {
            inner: Arc::new(Version {
                def,
                history,
                next_id,
                paths,
            }),
        }
    }

    pub fn def(&self) -> &ProcDef {
        &self.inner.def
    }

    pub fn name(&self) -> &str {
        &self.inner.def.name
    }

    pub fn version(&self) -> u32 {
        (self.inner.history.len() - 1) as u32
    }

    /// Identifier shared by every version derived from the same root.
    pub fn lineage(&self) -> u64 {
        self.inner.history[0]
    }

    fn key(&self) -> u64 {
        self.inner.history[self.inner.history.len() - 1]
    }

    /// Whether `self` and `other` are the same version.
    pub fn same_version(&self, other: &Proc) -> bool {
        self.key() == other.key()
    }

    /// Whether `older` is this version or one of its ancestors.
    pub fn descends_from(&self, older: &Proc) -> bool {
        self.inner.history.get(older.version() as usize) == Some(&older.key())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.inner.paths.contains_key(&id)
    }

    pub fn path(&self, id: NodeId) -> Option<&[Step]> {
        self.inner.paths.get(&id).map(Vec::as_slice)
    }

    pub fn stmt(&self, id: NodeId) -> Option<&Stmt> {
        self.stmt_at(self.path(id)?)
    }

    pub fn stmt_at(&self, path: &[Step]) -> Option<&Stmt> {
        let (last, _) = path.split_last()?;
        self.block_containing(path)?.get(last.index)
    }

    /// The statement list holding the statement at `path`.
    pub fn block_containing(&self, path: &[Step]) -> Option<&Vec<Stmt>> {
        let (last, outer) = path.split_last()?;
        if outer.is_empty() {
            return Some(&self.inner.def.body);
        }
        self.stmt_at(outer)?.block(last.branch)
    }

    /// Id of the statement enclosing `id`, `None` at top level.
    pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        let path = self.path(id)?;
        let outer = &path[..path.len() - 1];
        if outer.is_empty() {
            return None;
        }
        self.stmt_at(outer).map(|s| s.id)
    }

    // ── Cursors ─────────────────────────────────────────────────────────────

    pub fn cursor(&self, loc: Loc) -> Cursor {
        Cursor::new(self.clone(), loc)
    }

    /// Cursors to the top-level statements.
    pub fn body(&self) -> Vec<Cursor> {
        self.inner
            .def
            .body
            .iter()
            .map(|s| self.cursor(Loc::Node(s.id)))
            .collect()
    }

    /// First statement in pre-order satisfying `pred`.
    pub fn find_stmt(&self, what: &str, pred: impl Fn(&Stmt) -> bool) -> EditResult<Cursor> {
        let mut found = None;
        walk::visit_stmts(&self.inner.def.body, &mut |s| {
            if found.is_none() && pred(s) {
                found = Some(s.id);
            }
        });
        found
            .map(|id| self.cursor(Loc::Node(id)))
            .ok_or_else(|| EditError::mismatch("find", format!("no {what} in `{}`", self.name())))
    }

    /// First loop over `var` in pre-order.
    pub fn find_loop(&self, var: &str) -> EditResult<Cursor> {
        self.find_stmt(&format!("loop over `{var}`"), |s| {
            s.as_loop().is_some_and(|l| l.var == var)
        })
    }

    /// First allocation of `name` in pre-order.
    pub fn find_alloc(&self, name: &str) -> EditResult<Cursor> {
        self.find_stmt(&format!("allocation of `{name}`"), |s| {
            s.as_alloc().is_some_and(|a| a.name == name)
        })
    }

    /// Check that `c` was captured in exactly this version.
    pub fn check(&self, c: &Cursor) -> EditResult<()> {
        let snap = c.proc();
        if self.same_version(snap) {
            return Ok(());
        }
        if snap.lineage() != self.lineage() {
            return Err(EditError::ForwardingFailure {
                reason: format!(
                    "cursor belongs to a different procedure than `{}`",
                    self.name()
                ),
            });
        }
        Err(EditError::StaleCursor {
            cursor_version: snap.version(),
            proc_version: self.version(),
        })
    }

    /// Map a cursor captured in an ancestor version into this version.
    pub fn forward(&self, c: &Cursor) -> EditResult<Cursor> {
        let snap = c.proc();
        if !self.descends_from(snap) {
            let reason = if snap.lineage() != self.lineage() {
                "cursor belongs to a different lineage".to_string()
            } else {
                format!(
                    "version {} is not an ancestor of version {}",
                    snap.version(),
                    self.version()
                )
            };
            return Err(EditError::ForwardingFailure { reason });
        }
        let loc = *c.loc();
        for id in loc.ids() {
            if !self.contains(id) {
                return Err(EditError::ForwardingFailure {
                    reason: format!("statement #{} no longer exists", id.0),
                });
            }
        }
        if let Loc::Block(first, last) = loc {
            let (a, b) = (self.path(first), self.path(last));
            let contiguous = match (a, b) {
                (Some(a), Some(b)) => {
                    a.len() == b.len()
                        && a[..a.len() - 1] == b[..b.len() - 1]
                        && a[a.len() - 1].branch == b[b.len() - 1].branch
                        && a[a.len() - 1].index <= b[b.len() - 1].index
                }
                _ => false,
            };
            if !contiguous {
                return Err(EditError::ForwardingFailure {
                    reason: "block endpoints are no longer siblings".to_string(),
                });
            }
        }
        let out = self.cursor(loc);
        if let Loc::Expr(id, slot) = loc {
            if out.expr().is_none() {
                return Err(EditError::ForwardingFailure {
                    reason: format!("statement #{} no longer has a {:?} expression", id.0, slot),
                });
            }
        }
        Ok(out)
    }

    // ── Editing ─────────────────────────────────────────────────────────────

    pub fn editor(&self) -> Editor<'_> {
        Editor {
            base: self,
            def: self.inner.def.clone(),
            ids: NodeIdAllocator::starting_at(self.inner.next_id),
        }
    }

    /// SHA-256 over the printed form, as 64 hex characters.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.inner.def.to_string().as_bytes());
        let hash = hasher.finalize();
        let mut s = String::with_capacity(64);
        for b in hash.iter() {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
        }
        s
    }
}

impl fmt::Display for Proc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.def)
    }
}

impl fmt::Debug for Proc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proc")
            .field("name", &self.name())
            .field("lineage", &self.lineage())
            .field("version", &self.version())
            .finish()
    }
}

fn index_block(
    stmts: &[Stmt],
    branch: Branch,
    prefix: &mut Vec<Step>,
    out: &mut HashMap<NodeId, Vec<Step>>,
) {
    for (index, s) in stmts.iter().enumerate() {
        prefix.push(Step { branch, index });
        out.insert(s.id, prefix.clone());
        match &s.kind {
            StmtKind::For(l) => index_block(&l.body, Branch::Body, prefix, out),
            StmtKind::If(i) => {
                index_block(&i.body, Branch::Body, prefix, out);
                index_block(&i.orelse, Branch::OrElse, prefix, out);
            }
            _ => {}
        }
        prefix.pop();
    }
}

// ── Editor ──────────────────────────────────────────────────────────────────

/// Working copy of a version. Paths are those of the base version; an edit
/// resolves everything it needs before restructuring the copy.
pub struct Editor<'p> {
    base: &'p Proc,
    def: ProcDef,
    ids: NodeIdAllocator,
}

impl<'p> Editor<'p> {
    pub fn base(&self) -> &'p Proc {
        self.base
    }

    pub fn def_mut(&mut self) -> &mut ProcDef {
        &mut self.def
    }

    pub fn fresh_id(&mut self) -> NodeId {
        self.ids.alloc()
    }

    pub fn ids(&mut self) -> &mut NodeIdAllocator {
        &mut self.ids
    }

    /// The statement list holding the statement at `path`.
    pub fn block_mut(&mut self, path: &[Step]) -> EditResult<&mut Vec<Stmt>> {
        block_mut(&mut self.def.body, path)
            .ok_or_else(|| EditError::mismatch("edit", "path does not resolve"))
    }

    pub fn stmt_mut(&mut self, path: &[Step]) -> EditResult<&mut Stmt> {
        let index = path
            .last()
            .map(|s| s.index)
            .ok_or_else(|| EditError::mismatch("edit", "empty path"))?;
        self.block_mut(path)?
            .get_mut(index)
            .ok_or_else(|| EditError::mismatch("edit", "path does not resolve"))
    }

    /// Seal the copy as the successor version.
    pub fn finish(self) -> Proc {
        let mut history = self.base.inner.history.clone();
        history.push(next_key());
        Proc::build(self.def, history, self.ids.peek())
    }
}

fn block_mut<'a>(body: &'a mut Vec<Stmt>, path: &[Step]) -> Option<&'a mut Vec<Stmt>> {
    let (last, outer) = path.split_last()?;
    if outer.is_empty() {
        return Some(body);
    }
    let container = block_mut(body, outer)?;
    let parent = container.get_mut(outer[outer.len() - 1].index)?;
    parent.block_mut(last.branch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::StmtKind;

    fn sample() -> Proc {
        Proc::parse(
            "proc f(a: i32[4, 4] @ DRAM) {
                for i in seq(0, 4) {
                    for j in seq(0, 4) { a[i, j] = 0; }
                }
                pass;
            }",
        )
        .unwrap()
    }

    #[test]
    fn paths_resolve() {
        let p = sample();
        let j = p.find_loop("j").unwrap();
        let id = j.id().unwrap();
        assert_eq!(p.stmt(id).unwrap().as_loop().unwrap().var, "j");
        assert_eq!(p.path(id).unwrap().len(), 2);
        assert_eq!(p.parent_of(id), p.find_loop("i").unwrap().id());
    }

    #[test]
    fn versions_advance_in_one_lineage() {
        let p0 = sample();
        let p1 = p0.editor().finish();
        let p2 = p1.editor().finish();
        assert_eq!(p0.version(), 0);
        assert_eq!(p2.version(), 2);
        assert_eq!(p2.lineage(), p0.lineage());
        assert!(p2.descends_from(&p0));
        assert!(!p0.descends_from(&p2));
    }

    #[test]
    fn forward_reresolves_ids() {
        let p0 = sample();
        let j = p0.find_loop("j").unwrap();
        // Move the `pass` to the front; `j` keeps its id.
        let mut ed = p0.editor();
        let body = &mut ed.def_mut().body;
        let pass = body.remove(1);
        body.insert(0, pass);
        let p1 = ed.finish();
        let fwd = p1.forward(&j).unwrap();
        assert_eq!(fwd.loop_var(), Some("j"));
        assert_eq!(fwd.version(), 1);
        assert_eq!(p1.path(fwd.id().unwrap()).unwrap()[0].index, 1);
    }

    #[test]
    fn forward_fails_for_deleted_node() {
        let p0 = sample();
        let last = p0.body()[1].clone();
        let mut ed = p0.editor();
        ed.def_mut().body.pop();
        let p1 = ed.finish();
        assert!(matches!(
            p1.forward(&last),
            Err(EditError::ForwardingFailure { .. })
        ));
    }

    #[test]
    fn sibling_branches_do_not_forward() {
        let p0 = sample();
        let a = p0.editor().finish();
        let b = p0.editor().finish();
        let c = a.body()[0].clone();
        assert!(matches!(b.forward(&c), Err(EditError::ForwardingFailure { .. })));
        let other = sample();
        assert!(matches!(
            other.forward(&c),
            Err(EditError::ForwardingFailure { .. })
        ));
    }

    #[test]
    fn check_detects_stale_cursor() {
        let p0 = sample();
        let c = p0.body()[0].clone();
        let p1 = p0.editor().finish();
        assert_eq!(
            p1.check(&c),
            Err(EditError::StaleCursor {
                cursor_version: 0,
                proc_version: 1
            })
        );
        assert!(p1.check(&p1.forward(&c).unwrap()).is_ok());
    }

    #[test]
    fn fresh_ids_do_not_collide() {
        let p0 = sample();
        let mut ed = p0.editor();
        let id = ed.fresh_id();
        assert!(!p0.contains(id));
        ed.def_mut().body.push(Stmt::new(id, StmtKind::Pass));
        let p1 = ed.finish();
        let mut ed = p1.editor();
        assert_ne!(ed.fresh_id(), id);
    }

    #[test]
    fn fingerprint_tracks_structure() {
        let p0 = sample();
        let p1 = p0.editor().finish();
        assert_eq!(p0.fingerprint(), p1.fingerprint());
        assert_eq!(p0.fingerprint().len(), 64);
        let mut ed = p1.editor();
        ed.def_mut().body.pop();
        assert_ne!(ed.finish().fingerprint(), p0.fingerprint());
    }

    #[test]
    fn find_reports_mismatch() {
        let p = sample();
        assert!(matches!(
            p.find_loop("k"),
            Err(EditError::StructuralMismatch { op: "find", .. })
        ));
    }
}
