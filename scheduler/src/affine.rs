// affine.rs — Affine view of index expressions
//
// `Affine` is `constant + Σ coef·var` over loop variables and size
// parameters. It is the normal form used by `simplify`, by the dependence
// tests, and by window inference when staging or matching instructions.

use std::collections::BTreeMap;

use crate::ast::{BinOp, Expr};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Affine {
    pub terms: BTreeMap<String, i64>,
    pub constant: i64,
}

impl Affine {
    pub fn constant(c: i64) -> Self {
        Self {
            terms: BTreeMap::new(),
            constant: c,
        }
    }

    pub fn var(name: &str) -> Self {
        let mut terms = BTreeMap::new();
        terms.insert(name.to_string(), 1);
        Self { terms, constant: 0 }
    }

    /// Affine form of `e`, or `None` if it reads buffers or is non-linear.
    pub fn from_expr(e: &Expr) -> Option<Self> {
        match e {
            Expr::Int(n) => Some(Self::constant(*n)),
            Expr::Var(v) => Some(Self::var(v)),
            Expr::Neg(inner) => Some(Self::from_expr(inner)?.scale(-1)),
            Expr::Bin(op, l, r) => {
                let (l, r) = (Self::from_expr(l)?, Self::from_expr(r)?);
                match op {
                    BinOp::Add => Some(l.add(&r)),
                    BinOp::Sub => Some(l.add(&r.scale(-1))),
                    BinOp::Mul => match (l.as_constant(), r.as_constant()) {
                        (Some(k), _) => Some(r.scale(k)),
                        (_, Some(k)) => Some(l.scale(k)),
                        _ => None,
                    },
                    BinOp::Div => {
                        let (a, b) = (l.as_constant()?, r.as_constant()?);
                        (b != 0).then(|| Self::constant(a.div_euclid(b)))
                    }
                    BinOp::Mod => {
                        let (a, b) = (l.as_constant()?, r.as_constant()?);
                        (b != 0).then(|| Self::constant(a.rem_euclid(b)))
                    }
                    _ => None,
                }
            }
            Expr::Read(_) | Expr::Window(_) => None,
        }
    }

    pub fn as_constant(&self) -> Option<i64> {
        self.terms.is_empty().then_some(self.constant)
    }

    pub fn coef(&self, var: &str) -> i64 {
        self.terms.get(var).copied().unwrap_or(0)
    }

    pub fn mentions(&self, var: &str) -> bool {
        self.coef(var) != 0
    }

    pub fn add(&self, other: &Affine) -> Affine {
        let mut out = self.clone();
        out.constant += other.constant;
        for (v, c) in &other.terms {
            *out.terms.entry(v.clone()).or_insert(0) += c;
        }
        out.terms.retain(|_, c| *c != 0);
        out
    }

    pub fn scale(&self, k: i64) -> Affine {
        if k == 0 {
            return Affine::default();
        }
        Affine {
            terms: self.terms.iter().map(|(v, c)| (v.clone(), c * k)).collect(),
            constant: self.constant * k,
        }
    }

    /// Split into the part over `vars` and the rest.
    pub fn split(&self, vars: impl Fn(&str) -> bool) -> (Affine, Affine) {
        let mut inner = Affine::default();
        let mut outer = Affine::constant(self.constant);
        for (v, c) in &self.terms {
            if vars(v) {
                inner.terms.insert(v.clone(), *c);
            } else {
                outer.terms.insert(v.clone(), *c);
            }
        }
        (inner, outer)
    }

    /// Canonical expression: constant first, then terms ordered by
    /// coefficient magnitude and name, e.g. `4 + ii + 4 * ioi`.
    pub fn to_expr(&self) -> Expr {
        let mut terms: Vec<(&String, i64)> = self.terms.iter().map(|(v, c)| (v, *c)).collect();
        terms.sort_by(|a, b| a.1.abs().cmp(&b.1.abs()).then_with(|| a.0.cmp(b.0)));

        let mut acc = (self.constant != 0).then_some(Expr::Int(self.constant));
        for (v, c) in terms {
            let magnitude = if c.abs() == 1 {
                Expr::var(v.as_str())
            } else {
                Expr::bin(BinOp::Mul, Expr::Int(c.abs()), Expr::var(v.as_str()))
            };
            acc = Some(match acc {
                None if c > 0 => magnitude,
                None if c == -1 => Expr::Neg(Box::new(magnitude)),
                None => Expr::bin(BinOp::Mul, Expr::Int(c), Expr::var(v.as_str())),
                Some(lhs) if c > 0 => Expr::bin(BinOp::Add, lhs, magnitude),
                Some(lhs) => Expr::bin(BinOp::Sub, lhs, magnitude),
            });
        }
        acc.unwrap_or(Expr::Int(0))
    }
}
