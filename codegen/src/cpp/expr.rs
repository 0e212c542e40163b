//! Rendering of symbolic index expressions as C++ arithmetic.

use weft_ir::Expr;

/// Render an index expression as C++ source text.
///
/// Pure function of the expression tree: deterministic and re-entrant.
pub fn cexpr(expr: &Expr) -> String {
    print(expr, Prec::Add)
}

/// Precedence context of the surrounding expression.
#[derive(Clone, Copy, PartialEq, PartialOrd)]
enum Prec {
    Add,
    Mul,
}

fn print(expr: &Expr, parent: Prec) -> String {
    match expr {
        Expr::Int(value) => {
            if *value < 0 && parent > Prec::Add {
                format!("({value})")
            } else {
                value.to_string()
            }
        }
        Expr::Var(name) => name.clone(),
        Expr::Add(a, b) => {
            let text = format!("{} + {}", print(a, Prec::Add), print(b, Prec::Add));
            if parent > Prec::Add { format!("({text})") } else { text }
        }
        Expr::Mul(a, b) => {
            format!("{}*{}", print(a, Prec::Mul), print(b, Prec::Mul))
        }
        // Integer floor division always prints parenthesized.
        Expr::FloorDiv(a, b) => {
            format!("({} / {})", print(a, Prec::Mul), print(b, Prec::Mul))
        }
        // `(x/div) % mod`; the inner division is grouped only when div != 1.
        Expr::ModularIndexing(x, div, modulus) => {
            let x = print(x, Prec::Mul);
            let div = print(div, Prec::Mul);
            let modulus = print(modulus, Prec::Mul);
            let lhs = if div != "1" { format!("({x} / {div})") } else { x };
            let text = format!("{lhs} % {modulus}");
            if parent > Prec::Add { format!("({text})") } else { text }
        }
    }
}
