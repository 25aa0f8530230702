//! Host-language query expressions.
//!
//! A query pipeline arrives as an [`Expr`] graph: entity-set roots, constants,
//! captured host variables, lambda parameters, member access, method calls,
//! lambdas, operators, conditionals and record construction. Sequence
//! operators are extension calls whose first argument is the source
//! sequence, e.g. `Queryable.Where(books, x => x.Price > 10)`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::{HostType, Value};

/// Type that declares a called method. Dispatch keys on it together with
/// the method name and operand count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Declaring {
    /// Query operators over entity sets.
    Queryable,
    /// Sequence operators over in-memory or nested sequences.
    Enumerable,
    /// Instance methods of in-memory collections (`list.Contains(x)`).
    Collection,
    String,
    Math,
    DateTime,
    TimeSpan,
    Object,
}

impl Declaring {
    /// Whether calls of this type take a source sequence.
    pub fn is_sequence(self) -> bool {
        matches!(
            self,
            Declaring::Queryable | Declaring::Enumerable | Declaring::Collection
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    AndAlso,
    OrElse,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Coalesce,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqual => ">=",
            BinaryOp::AndAlso => "&&",
            BinaryOp::OrElse => "||",
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Coalesce => "??",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Negate,
    Convert(HostType),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lambda {
    pub params: Vec<String>,
    pub body: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub declaring: Declaring,
    pub method: String,
    /// Receiver of an instance call.
    pub target: Option<Box<Expr>>,
    pub args: Vec<Expr>,
    pub type_args: Vec<HostType>,
}

impl MethodCall {
    /// Source sequence of a sequence operator: the receiver of an instance
    /// call, otherwise the first argument.
    pub fn source(&self) -> Option<&Expr> {
        if !self.declaring.is_sequence() {
            return None;
        }
        match &self.target {
            Some(target) => Some(target),
            None => self.args.first(),
        }
    }

    /// Arguments after the source (sequence operators) or all arguments.
    pub fn operands(&self) -> &[Expr] {
        if self.declaring.is_sequence() && self.target.is_none() && !self.args.is_empty() {
            &self.args[1..]
        } else {
            &self.args
        }
    }
}

/// A node of the host expression graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Root collection of a mapped entity.
    EntitySet(String),
    Constant(Value),
    /// A captured host variable; becomes an external value.
    Variable {
        name: String,
        ty: HostType,
    },
    /// Reference to a lambda parameter.
    Parameter(String),
    Member {
        target: Box<Expr>,
        member: String,
    },
    Call(MethodCall),
    Lambda(Lambda),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Conditional {
        test: Box<Expr>,
        if_true: Box<Expr>,
        if_false: Box<Expr>,
    },
    /// Anonymous record construction.
    New(Vec<(String, Expr)>),
}

// ── Builders ───────────────────────────────────────────────────────────────

impl Expr {
    pub fn entity_set(entity: impl Into<String>) -> Expr {
        Expr::EntitySet(entity.into())
    }

    pub fn constant(value: impl Into<Value>) -> Expr {
        Expr::Constant(value.into())
    }

    pub fn null() -> Expr {
        Expr::Constant(Value::Null)
    }

    pub fn variable(name: impl Into<String>, ty: HostType) -> Expr {
        Expr::Variable {
            name: name.into(),
            ty,
        }
    }

    pub fn param(name: impl Into<String>) -> Expr {
        Expr::Parameter(name.into())
    }

    pub fn lambda(params: &[&str], body: Expr) -> Expr {
        Expr::Lambda(Lambda {
            params: params.iter().map(|p| p.to_string()).collect(),
            body: Box::new(body),
        })
    }

    pub fn member(self, member: impl Into<String>) -> Expr {
        Expr::Member {
            target: Box::new(self),
            member: member.into(),
        }
    }

    /// `Queryable.<method>(self, operands...)`.
    pub fn query(self, method: &str, operands: Vec<Expr>) -> Expr {
        self.sequence_call(Declaring::Queryable, method, operands)
    }

    /// `Enumerable.<method>(self, operands...)`.
    pub fn enumerable(self, method: &str, operands: Vec<Expr>) -> Expr {
        self.sequence_call(Declaring::Enumerable, method, operands)
    }

    fn sequence_call(self, declaring: Declaring, method: &str, operands: Vec<Expr>) -> Expr {
        let mut args = Vec::with_capacity(operands.len() + 1);
        args.push(self);
        args.extend(operands);
        Expr::Call(MethodCall {
            declaring,
            method: method.to_string(),
            target: None,
            args,
            type_args: Vec::new(),
        })
    }

    /// Instance call `self.<method>(args...)`.
    pub fn method(self, declaring: Declaring, method: &str, args: Vec<Expr>) -> Expr {
        Expr::Call(MethodCall {
            declaring,
            method: method.to_string(),
            target: Some(Box::new(self)),
            args,
            type_args: Vec::new(),
        })
    }

    /// Static call `<Declaring>.<method>(args...)`.
    pub fn static_call(declaring: Declaring, method: &str, args: Vec<Expr>) -> Expr {
        Expr::Call(MethodCall {
            declaring,
            method: method.to_string(),
            target: None,
            args,
            type_args: Vec::new(),
        })
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eq(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::Equal, self, other)
    }

    pub fn ne(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::NotEqual, self, other)
    }

    pub fn lt(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::LessThan, self, other)
    }

    pub fn le(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::LessThanOrEqual, self, other)
    }

    pub fn gt(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::GreaterThan, self, other)
    }

    pub fn ge(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::GreaterThanOrEqual, self, other)
    }

    pub fn and(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::AndAlso, self, other)
    }

    pub fn or(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::OrElse, self, other)
    }

    pub fn add(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::Add, self, other)
    }

    pub fn sub(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::Subtract, self, other)
    }

    pub fn mul(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::Multiply, self, other)
    }

    pub fn coalesce(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::Coalesce, self, other)
    }

    pub fn not(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(self),
        }
    }

    pub fn negate(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Negate,
            operand: Box::new(self),
        }
    }

    pub fn convert(self, ty: HostType) -> Expr {
        Expr::Unary {
            op: UnaryOp::Convert(ty),
            operand: Box::new(self),
        }
    }

    pub fn conditional(test: Expr, if_true: Expr, if_false: Expr) -> Expr {
        Expr::Conditional {
            test: Box::new(test),
            if_true: Box::new(if_true),
            if_false: Box::new(if_false),
        }
    }

    pub fn record(fields: Vec<(&str, Expr)>) -> Expr {
        Expr::New(
            fields
                .into_iter()
                .map(|(name, e)| (name.to_string(), e))
                .collect(),
        )
    }
}

// ── Inspection ─────────────────────────────────────────────────────────────

impl Expr {
    /// Whether the whole subtree can be evaluated on the host before the
    /// query runs: no lambda parameters, entity sets or lambdas inside.
    pub fn is_host_evaluable(&self) -> bool {
        match self {
            Expr::EntitySet(_) | Expr::Parameter(_) | Expr::Lambda(_) => false,
            Expr::Constant(_) | Expr::Variable { .. } => true,
            Expr::Member { target, .. } => target.is_host_evaluable(),
            Expr::Call(call) => {
                call.target.as_ref().is_none_or(|t| t.is_host_evaluable())
                    && call.args.iter().all(Expr::is_host_evaluable)
            }
            Expr::Binary { left, right, .. } => {
                left.is_host_evaluable() && right.is_host_evaluable()
            }
            Expr::Unary { operand, .. } => operand.is_host_evaluable(),
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => test.is_host_evaluable() && if_true.is_host_evaluable() && if_false.is_host_evaluable(),
            Expr::New(fields) => fields.iter().all(|(_, e)| e.is_host_evaluable()),
        }
    }

    pub fn as_lambda(&self) -> Option<&Lambda> {
        match self {
            Expr::Lambda(l) => Some(l),
            _ => None,
        }
    }

    /// Parameter count of a lambda; zero for anything else.
    pub fn lambda_arity(&self) -> usize {
        self.as_lambda().map_or(0, |l| l.params.len())
    }

    /// Source text of the expression, for error messages and logs.
    pub fn to_text(&self) -> String {
        self.to_string()
    }
}

fn write_value(f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
    match value {
        Value::Null => write!(f, "null"),
        Value::Bool(b) => write!(f, "{b}"),
        Value::Int(i) => write!(f, "{i}"),
        Value::Float(x) => write!(f, "{x}"),
        Value::Text(s) => write!(f, "\"{s}\""),
        Value::DateTime(dt) => write!(f, "#{dt}#"),
        Value::TimeSpan(ms) => write!(f, "{ms}ms"),
        Value::List(items) => {
            write!(f, "[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write_value(f, item)?;
            }
            write!(f, "]")
        }
        other => write!(f, "<{}>", other.type_name()),
    }
}

fn write_args(f: &mut fmt::Formatter<'_>, args: &[Expr]) -> fmt::Result {
    for (i, a) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{a}")?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::EntitySet(entity) => write!(f, "{entity}s"),
            Expr::Constant(v) => write_value(f, v),
            Expr::Variable { name, .. } => write!(f, "{name}"),
            Expr::Parameter(name) => write!(f, "{name}"),
            Expr::Member { target, member } => write!(f, "{target}.{member}"),
            Expr::Call(call) => {
                if let Some(source) = call.source() {
                    write!(f, "{source}.{}(", call.method)?;
                    write_args(f, call.operands())?;
                } else if let Some(target) = &call.target {
                    write!(f, "{target}.{}(", call.method)?;
                    write_args(f, &call.args)?;
                } else {
                    write!(f, "{:?}.{}(", call.declaring, call.method)?;
                    write_args(f, &call.args)?;
                }
                write!(f, ")")
            }
            Expr::Lambda(l) => {
                if l.params.len() == 1 {
                    write!(f, "{} => {}", l.params[0], l.body)
                } else {
                    write!(f, "({}) => {}", l.params.join(", "), l.body)
                }
            }
            Expr::Binary { op, left, right } => write!(f, "({left} {} {right})", op.symbol()),
            Expr::Unary { op, operand } => match op {
                UnaryOp::Not => write!(f, "!{operand}"),
                UnaryOp::Negate => write!(f, "-{operand}"),
                UnaryOp::Convert(ty) => write!(f, "({ty}){operand}"),
            },
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => write!(f, "({test} ? {if_true} : {if_false})"),
            Expr::New(fields) => {
                write!(f, "new {{ ")?;
                for (i, (name, e)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name} = {e}")?;
                }
                write!(f, " }}")
            }
        }
    }
}
