//! Symbolic integer index expressions.
//!
//! Index arithmetic inside a fused node is kept symbolic so the code
//! generator can substitute iteration variables, rewrite the innermost
//! index for vector access and decide access legality from the affine
//! structure. Expressions normalize to a linear form over atoms: plain
//! variables plus opaque subtrees (floor division, modular indexing,
//! variable-by-variable products) that affine reasoning cannot see into.

use std::collections::{BTreeMap, HashMap};

/// A symbolic integer expression over iteration variables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Expr {
    Int(i64),
    Var(String),
    Add(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    /// Integer floor division `x / div`.
    FloorDiv(Box<Expr>, Box<Expr>),
    /// Modular indexing `(x / div) % modulus`.
    ModularIndexing(Box<Expr>, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn int(value: i64) -> Expr {
        Expr::Int(value)
    }

    pub fn var(name: impl Into<String>) -> Expr {
        Expr::Var(name.into())
    }

    /// Addition with constant folding and identity elimination.
    pub fn add(lhs: Expr, rhs: Expr) -> Expr {
        match (lhs, rhs) {
            (Expr::Int(a), Expr::Int(b)) => Expr::Int(a + b),
            (Expr::Int(0), e) | (e, Expr::Int(0)) => e,
            (a, b) => Expr::Add(Box::new(a), Box::new(b)),
        }
    }

    /// Multiplication with constant folding and identity elimination.
    pub fn mul(lhs: Expr, rhs: Expr) -> Expr {
        match (lhs, rhs) {
            (Expr::Int(a), Expr::Int(b)) => Expr::Int(a * b),
            (Expr::Int(0), _) | (_, Expr::Int(0)) => Expr::Int(0),
            (Expr::Int(1), e) | (e, Expr::Int(1)) => e,
            (a, b) => Expr::Mul(Box::new(a), Box::new(b)),
        }
    }

    pub fn floor_div(lhs: Expr, rhs: Expr) -> Expr {
        match (lhs, rhs) {
            (Expr::Int(a), Expr::Int(b)) if b != 0 => Expr::Int(a.div_euclid(b)),
            (e, Expr::Int(1)) => e,
            (a, b) => Expr::FloorDiv(Box::new(a), Box::new(b)),
        }
    }

    pub fn modular(x: Expr, div: Expr, modulus: Expr) -> Expr {
        match (x, div, modulus) {
            (Expr::Int(x), Expr::Int(d), Expr::Int(m)) if d != 0 && m != 0 => {
                Expr::Int(x.div_euclid(d).rem_euclid(m))
            }
            (x, d, m) => Expr::ModularIndexing(Box::new(x), Box::new(d), Box::new(m)),
        }
    }

    /// Substitute variables, rebuilding through the folding constructors.
    pub fn subst(&self, map: &HashMap<String, Expr>) -> Expr {
        match self {
            Expr::Int(_) => self.clone(),
            Expr::Var(name) => map.get(name).cloned().unwrap_or_else(|| self.clone()),
            Expr::Add(a, b) => Expr::add(a.subst(map), b.subst(map)),
            Expr::Mul(a, b) => Expr::mul(a.subst(map), b.subst(map)),
            Expr::FloorDiv(a, b) => Expr::floor_div(a.subst(map), b.subst(map)),
            Expr::ModularIndexing(x, d, m) => Expr::modular(x.subst(map), d.subst(map), m.subst(map)),
        }
    }

    pub fn contains_var(&self, name: &str) -> bool {
        match self {
            Expr::Int(_) => false,
            Expr::Var(v) => v == name,
            Expr::Add(a, b) | Expr::Mul(a, b) | Expr::FloorDiv(a, b) => {
                a.contains_var(name) || b.contains_var(name)
            }
            Expr::ModularIndexing(x, d, m) => {
                x.contains_var(name) || d.contains_var(name) || m.contains_var(name)
            }
        }
    }

    /// Visit every variable name occurring in the expression.
    pub fn for_each_var(&self, f: &mut impl FnMut(&str)) {
        match self {
            Expr::Int(_) => {}
            Expr::Var(v) => f(v),
            Expr::Add(a, b) | Expr::Mul(a, b) | Expr::FloorDiv(a, b) => {
                a.for_each_var(f);
                b.for_each_var(f);
            }
            Expr::ModularIndexing(x, d, m) => {
                x.for_each_var(f);
                d.for_each_var(f);
                m.for_each_var(f);
            }
        }
    }

    /// Expand into a sum of `coefficient * atom` terms plus a constant.
    pub fn linearize(&self) -> LinearExpr {
        match self {
            Expr::Int(value) => LinearExpr { constant: *value, ..Default::default() },
            Expr::Var(name) => LinearExpr::term(Atom::Var(name.clone()), 1),
            Expr::Add(a, b) => {
                let mut lin = a.linearize();
                lin.accumulate(b.linearize(), 1);
                lin
            }
            Expr::Mul(a, b) => {
                let la = a.linearize();
                let lb = b.linearize();
                if la.is_constant() {
                    lb.scaled(la.constant)
                } else if lb.is_constant() {
                    la.scaled(lb.constant)
                } else {
                    LinearExpr::term(Atom::Opaque(self.clone()), 1)
                }
            }
            Expr::FloorDiv(..) | Expr::ModularIndexing(..) => {
                LinearExpr::term(Atom::Opaque(self.clone()), 1)
            }
        }
    }

    /// Coefficient of `var` in the expanded affine form.
    ///
    /// Returns `None` when `var` occurs inside an opaque atom (division,
    /// modulo, variable product) where a single stride is not defined.
    pub fn stride_of(&self, var: &str) -> Option<i64> {
        let lin = self.linearize();
        let mut coefficient = 0;
        for (atom, coeff) in &lin.terms {
            match atom {
                Atom::Var(v) if v == var => coefficient = *coeff,
                Atom::Var(_) => {}
                Atom::Opaque(e) => {
                    if e.contains_var(var) {
                        return None;
                    }
                }
            }
        }
        Some(coefficient)
    }

    /// The expression does not depend on `var` at all.
    pub fn is_invariant_in(&self, var: &str) -> bool {
        self.stride_of(var) == Some(0)
    }

    /// `var` advances the expression by exactly one per step.
    pub fn is_unit_stride_in(&self, var: &str) -> bool {
        self.stride_of(var) == Some(1)
    }
}

impl std::ops::Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        Expr::add(self, rhs)
    }
}

impl std::ops::Mul for Expr {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Expr {
        Expr::mul(self, rhs)
    }
}

impl From<i64> for Expr {
    fn from(value: i64) -> Expr {
        Expr::Int(value)
    }
}

/// An atom of the expanded linear form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Atom {
    Var(String),
    /// Subtree affine expansion cannot look into.
    Opaque(Expr),
}

/// `sum(coefficient * atom) + constant`, the normal form used for access
/// legality and index-equality checks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinearExpr {
    pub terms: BTreeMap<Atom, i64>,
    pub constant: i64,
}

impl LinearExpr {
    fn term(atom: Atom, coeff: i64) -> LinearExpr {
        let mut lin = LinearExpr::default();
        lin.add_term(atom, coeff);
        lin
    }

    fn is_constant(&self) -> bool {
        self.terms.is_empty()
    }

    fn add_term(&mut self, atom: Atom, coeff: i64) {
        if coeff == 0 {
            return;
        }
        let entry = self.terms.entry(atom).or_insert(0);
        *entry += coeff;
        if *entry == 0 {
            // re-borrow to drop the zeroed term
            self.terms.retain(|_, c| *c != 0);
        }
    }

    fn accumulate(&mut self, other: LinearExpr, scale: i64) {
        self.constant += other.constant * scale;
        for (atom, coeff) in other.terms {
            self.add_term(atom, coeff * scale);
        }
    }

    fn scaled(mut self, scale: i64) -> LinearExpr {
        if scale == 0 {
            return LinearExpr::default();
        }
        self.constant *= scale;
        for coeff in self.terms.values_mut() {
            *coeff *= scale;
        }
        self
    }
}
