//! Node replay tests with a recording handler.

use weft_dtype::DType;

use crate::error::Error;
use crate::expr::Expr;
use crate::node::{Bindings, FusedNode, Group, Op, OpsHandler, Stmt, eval};
use crate::types::{BinaryOp, ConstValue, RandKind, ReduceOp, StoreMode, UnaryOp};

/// Records every handler call in order.
#[derive(Default)]
struct Recorder {
    calls: Vec<String>,
}

impl OpsHandler for Recorder {
    type Value = String;
    type Error = Error;

    fn constant(&mut self, value: ConstValue, _dtype: DType) -> Result<String, Error> {
        self.calls.push(format!("constant {value:?}"));
        Ok("c".to_string())
    }

    fn load(&mut self, buffer: &str, index: &Expr) -> Result<String, Error> {
        self.calls.push(format!("load {buffer} {index:?}"));
        Ok(format!("v_{buffer}"))
    }

    fn store(
        &mut self,
        buffer: &str,
        _index: &Expr,
        value: String,
        _mode: StoreMode,
    ) -> Result<(), Error> {
        self.calls.push(format!("store {buffer} {value}"));
        Ok(())
    }

    fn reduction(
        &mut self,
        buffer: &str,
        _dtype: DType,
        _src_dtype: DType,
        op: ReduceOp,
        _index: &Expr,
        value: String,
    ) -> Result<(), Error> {
        self.calls.push(format!("reduction {buffer} {op:?} {value}"));
        Ok(())
    }

    fn unary(&mut self, op: UnaryOp, src: String) -> Result<String, Error> {
        self.calls.push(format!("unary {op:?} {src}"));
        Ok(format!("u({src})"))
    }

    fn binary(&mut self, op: BinaryOp, lhs: String, rhs: String) -> Result<String, Error> {
        self.calls.push(format!("binary {op:?} {lhs} {rhs}"));
        Ok(format!("b({lhs},{rhs})"))
    }

    fn select(&mut self, cond: String, then: String, other: String) -> Result<String, Error> {
        self.calls.push(format!("select {cond} {then} {other}"));
        Ok("sel".to_string())
    }

    fn cast(&mut self, src: String, dtype: DType) -> Result<String, Error> {
        self.calls.push(format!("cast {src} {dtype:?}"));
        Ok(src)
    }

    fn index_expr(&mut self, expr: &Expr, _dtype: DType) -> Result<String, Error> {
        self.calls.push(format!("index_expr {expr:?}"));
        Ok("idx".to_string())
    }

    fn indirect_indexing(&mut self, value: String) -> Result<Expr, Error> {
        self.calls.push(format!("indirect {value}"));
        Ok(Expr::var(value))
    }

    fn rand(
        &mut self,
        _kind: RandKind,
        _seed: &Expr,
        _offset: &Expr,
        _dtype: DType,
    ) -> Result<String, Error> {
        self.calls.push("rand".to_string());
        Ok("rnd".to_string())
    }

    fn masked(
        &mut self,
        mask: String,
        body: &Op,
        bindings: &Bindings,
        _other: f64,
    ) -> Result<String, Error> {
        self.calls.push(format!("masked {mask}"));
        eval(body, bindings, self)
    }
}

#[test]
fn run_substitutes_placeholders_and_orders_calls() {
    let node = FusedNode::new(
        Group::new(&[16], &[]),
        vec![Stmt::store(
            "out0",
            Expr::var("x0"),
            Op::binary(
                BinaryOp::Add,
                Op::load("in0", Expr::var("x0")),
                Op::load("in1", Expr::var("x0")),
            ),
            StoreMode::Plain,
        )],
    );

    let mut handler = Recorder::default();
    node.run(&mut handler, &[Expr::var("i0")], &[]).unwrap();

    assert_eq!(
        handler.calls,
        vec![
            "load in0 Var(\"i0\")",
            "load in1 Var(\"i0\")",
            "binary Add v_in0 v_in1",
            "store out0 b(v_in0,v_in1)",
        ]
    );
}

#[test]
fn run_binds_reduction_placeholders() {
    let node = FusedNode::new(
        Group::new(&[8], &[32]),
        vec![Stmt::reduction(
            "out0",
            DType::Float32,
            DType::Float32,
            ReduceOp::Sum,
            Expr::var("x0"),
            Op::load("in0", Expr::mul(Expr::var("x0"), Expr::int(32)) + Expr::var("r0")),
        )],
    );

    let mut handler = Recorder::default();
    node.run(&mut handler, &[Expr::var("i0")], &[Expr::var("i1")]).unwrap();

    assert_eq!(handler.calls[0], "load in0 Add(Mul(Var(\"i0\"), Int(32)), Var(\"i1\"))");
    assert_eq!(handler.calls[1], "reduction out0 Sum v_in0");
}

#[test]
fn unbound_placeholder_is_an_error() {
    let node = FusedNode::new(
        Group::new(&[8], &[32]),
        vec![Stmt::store(
            "out0",
            Expr::var("x0"),
            Op::load("in0", Expr::var("r0")),
            StoreMode::Plain,
        )],
    );

    let mut handler = Recorder::default();
    let err = node.run(&mut handler, &[Expr::var("i0")], &[]).unwrap_err();
    assert!(matches!(err, Error::UnboundPlaceholder { name } if name == "r0"));
}

#[test]
fn masked_body_is_replayed_through_the_handler() {
    let node = FusedNode::new(
        Group::new(&[4], &[]),
        vec![Stmt::store(
            "out0",
            Expr::var("x0"),
            Op::masked(
                Op::binary(
                    BinaryOp::Lt,
                    Op::index_expr(Expr::var("x0"), DType::Int64),
                    Op::constant(ConstValue::Int(3), DType::Int64),
                ),
                Op::load("in0", Expr::var("x0")),
                0.0,
            ),
            StoreMode::Plain,
        )],
    );

    let mut handler = Recorder::default();
    node.run(&mut handler, &[Expr::var("i0")], &[]).unwrap();

    // the body load happens inside the masked call
    let masked_pos = handler.calls.iter().position(|c| c.starts_with("masked")).unwrap();
    let load_pos = handler.calls.iter().position(|c| c.starts_with("load in0")).unwrap();
    assert!(load_pos > masked_pos);
}

#[test]
fn group_flattening() {
    let group = Group::new(&[8, 4], &[32]);
    assert!(group.is_reduction());
    assert_eq!(group.flattened().as_slice(), &[8, 4, 32]);
    assert_eq!(group.numel(), 1024);
}
