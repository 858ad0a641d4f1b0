//! Expression compilation and evaluation for execution operators.
//!
//! Input contract:
//! - [`Expr`] trees travel inside vertex parameters and are compiled once per vertex;
//! - column references are positional over the tuple the expression is evaluated against.
//!
//! Output contract:
//! - evaluation returns one [`Value`] per tuple; `Value::Null` follows SQL three-valued logic.

use std::cmp::Ordering;
use std::sync::Arc;

use dtx_common::{DtxError, Result, Value};
use serde::{Deserialize, Serialize};

/// Binary operators understood by [`Expr::Binary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    /// `=`
    Eq,
    /// `<>`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Multiply,
    /// `/`
    Divide,
}

/// Serializable expression tree shipped with vertex parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Positional column reference.
    Column(usize),
    /// Constant.
    Literal(Value),
    /// Comparison or arithmetic.
    Binary {
        /// Left operand.
        left: Box<Expr>,
        /// Operator.
        op: BinaryOp,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Kleene AND.
    And(Box<Expr>, Box<Expr>),
    /// Kleene OR.
    Or(Box<Expr>, Box<Expr>),
    /// Boolean negation; null stays null.
    Not(Box<Expr>),
    /// `IS NULL`.
    IsNull(Box<Expr>),
}

impl Expr {
    /// Column reference shortcut.
    pub fn col(index: usize) -> Self {
        Expr::Column(index)
    }

    /// Literal shortcut.
    pub fn lit(value: Value) -> Self {
        Expr::Literal(value)
    }

    /// `self <op> right`.
    pub fn binary(self, op: BinaryOp, right: Expr) -> Self {
        Expr::Binary {
            left: Box::new(self),
            op,
            right: Box::new(right),
        }
    }

    /// `self AND right`.
    pub fn and(self, right: Expr) -> Self {
        Expr::And(Box::new(self), Box::new(right))
    }
}

/// Executable expression.
pub trait PhysicalExpr: Send + Sync {
    /// Evaluate against one tuple.
    fn evaluate(&self, tuple: &[Value]) -> Result<Value>;
}

/// Compiles `expr` for tuples of `input_arity` columns.
pub fn compile_expr(expr: &Expr, input_arity: usize) -> Result<Arc<dyn PhysicalExpr>> {
    match expr {
        Expr::Column(index) => {
            if *index >= input_arity {
                return Err(DtxError::Planning(format!(
                    "column #{index} out of range for arity {input_arity}"
                )));
            }
            Ok(Arc::new(ColumnExpr { index: *index }))
        }
        Expr::Literal(v) => Ok(Arc::new(LiteralExpr { v: v.clone() })),
        Expr::Binary { left, op, right } => Ok(Arc::new(BinaryExpr {
            left: compile_expr(left, input_arity)?,
            right: compile_expr(right, input_arity)?,
            op: *op,
        })),
        Expr::And(a, b) => Ok(Arc::new(BoolBinaryExpr {
            left: compile_expr(a, input_arity)?,
            right: compile_expr(b, input_arity)?,
            op: BoolOp::And,
        })),
        Expr::Or(a, b) => Ok(Arc::new(BoolBinaryExpr {
            left: compile_expr(a, input_arity)?,
            right: compile_expr(b, input_arity)?,
            op: BoolOp::Or,
        })),
        Expr::Not(e) => Ok(Arc::new(NotExpr {
            inner: compile_expr(e, input_arity)?,
        })),
        Expr::IsNull(e) => Ok(Arc::new(IsNullExpr {
            inner: compile_expr(e, input_arity)?,
        })),
    }
}

struct ColumnExpr {
    index: usize,
}

impl PhysicalExpr for ColumnExpr {
    fn evaluate(&self, tuple: &[Value]) -> Result<Value> {
        tuple.get(self.index).cloned().ok_or_else(|| {
            DtxError::Execution(format!(
                "column #{} missing from tuple of arity {}",
                self.index,
                tuple.len()
            ))
        })
    }
}

struct LiteralExpr {
    v: Value,
}

impl PhysicalExpr for LiteralExpr {
    fn evaluate(&self, _tuple: &[Value]) -> Result<Value> {
        Ok(self.v.clone())
    }
}

struct BinaryExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: BinaryOp,
}

impl PhysicalExpr for BinaryExpr {
    fn evaluate(&self, tuple: &[Value]) -> Result<Value> {
        let l = self.left.evaluate(tuple)?;
        let r = self.right.evaluate(tuple)?;
        if l.is_null() || r.is_null() {
            return Ok(Value::Null);
        }
        let cmp = |pred: fn(Ordering) -> bool| -> Result<Value> {
            let ord = l.compare(&r).ok_or_else(|| {
                DtxError::Execution(format!("cannot compare {l} with {r}"))
            })?;
            Ok(Value::Boolean(pred(ord)))
        };
        match self.op {
            BinaryOp::Eq => cmp(|o| o == Ordering::Equal),
            BinaryOp::NotEq => cmp(|o| o != Ordering::Equal),
            BinaryOp::Lt => cmp(|o| o == Ordering::Less),
            BinaryOp::LtEq => cmp(|o| o != Ordering::Greater),
            BinaryOp::Gt => cmp(|o| o == Ordering::Greater),
            BinaryOp::GtEq => cmp(|o| o != Ordering::Less),
            BinaryOp::Plus | BinaryOp::Minus | BinaryOp::Multiply | BinaryOp::Divide => {
                arithmetic(self.op, &l, &r)
            }
        }
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    if let (Value::Int64(a), Value::Int64(b)) = (l, r) {
        let out = match op {
            BinaryOp::Plus => a.checked_add(*b),
            BinaryOp::Minus => a.checked_sub(*b),
            BinaryOp::Multiply => a.checked_mul(*b),
            BinaryOp::Divide => a.checked_div(*b),
            _ => None,
        };
        return out.map(Value::Int64).ok_or_else(|| {
            DtxError::Execution(format!("integer overflow or division by zero in {a} {op:?} {b}"))
        });
    }
    let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
        return Err(DtxError::Execution(format!(
            "arithmetic on non-numeric operands {l} and {r}"
        )));
    };
    Ok(Value::Float64(match op {
        BinaryOp::Plus => a + b,
        BinaryOp::Minus => a - b,
        BinaryOp::Multiply => a * b,
        _ => a / b,
    }))
}

#[derive(Clone, Copy)]
enum BoolOp {
    And,
    Or,
}

struct BoolBinaryExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: BoolOp,
}

fn as_tristate(v: Value) -> Result<Option<bool>> {
    match v {
        Value::Null => Ok(None),
        Value::Boolean(b) => Ok(Some(b)),
        other => Err(DtxError::Execution(format!(
            "expected boolean operand, got {other}"
        ))),
    }
}

impl PhysicalExpr for BoolBinaryExpr {
    fn evaluate(&self, tuple: &[Value]) -> Result<Value> {
        let l = as_tristate(self.left.evaluate(tuple)?)?;
        let r = as_tristate(self.right.evaluate(tuple)?)?;
        let out = match self.op {
            BoolOp::And => match (l, r) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            },
            BoolOp::Or => match (l, r) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            },
        };
        Ok(out.map_or(Value::Null, Value::Boolean))
    }
}

struct NotExpr {
    inner: Arc<dyn PhysicalExpr>,
}

impl PhysicalExpr for NotExpr {
    fn evaluate(&self, tuple: &[Value]) -> Result<Value> {
        Ok(as_tristate(self.inner.evaluate(tuple)?)?.map_or(Value::Null, |b| Value::Boolean(!b)))
    }
}

struct IsNullExpr {
    inner: Arc<dyn PhysicalExpr>,
}

impl PhysicalExpr for IsNullExpr {
    fn evaluate(&self, tuple: &[Value]) -> Result<Value> {
        Ok(Value::Boolean(self.inner.evaluate(tuple)?.is_null()))
    }
}
