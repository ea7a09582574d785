//! Compiler and work-item interpreter for the OpenCL C subset understood by
//! [`super::HostRuntime`].
//!
//! Supported: `__kernel void` entry points with `__global float*` and scalar
//! (`float`, `int`, `uint`, `long`, `ulong`, `size_t`) parameters, local
//! declarations, `if`/`else`, `return;`, assignments, arithmetic,
//! comparisons, `&&`/`||`, casts and the `get_*_id`/`get_*_size` builtins.
//!
//! Compilation runs in four passes: [`lexer`] tokenizes with logos and
//! bounds nesting, [`parser`] builds a syntax tree with chumsky,
//! [`resolve`] binds names to parameter and local slots, and [`interp`]
//! executes the result one work-item at a time.

mod interp;
mod lexer;
mod parser;
mod resolve;

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

pub(crate) use interp::Resolved;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScalarType {
    Float,
    Int,
    UInt,
    Long,
    ULong,
}

impl ScalarType {
    pub(crate) fn size(self) -> usize {
        match self {
            ScalarType::Float | ScalarType::Int | ScalarType::UInt => 4,
            ScalarType::Long | ScalarType::ULong => 8,
        }
    }

    fn c_name(self) -> &'static str {
        match self {
            ScalarType::Float => "float",
            ScalarType::Int => "int",
            ScalarType::UInt => "uint",
            ScalarType::Long => "long",
            ScalarType::ULong => "ulong",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParamType {
    GlobalFloatPtr,
    Scalar(ScalarType),
}

impl ParamType {
    /// Size in bytes of the value bound to a parameter of this type.
    pub(crate) fn arg_size(self) -> usize {
        match self {
            ParamType::GlobalFloatPtr => std::mem::size_of::<u64>(),
            ParamType::Scalar(t) => t.size(),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::GlobalFloatPtr => f.write_str("__global float*"),
            ParamType::Scalar(t) => f.write_str(t.c_name()),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Param {
    pub(crate) name: String,
    pub(crate) ty: ParamType,
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Byte range into the kernel source.
type Span = Range<usize>;

/// An error raised by one of the compile passes, located by byte span.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SyntaxError {
    span: Span,
    message: String,
}

impl SyntaxError {
    fn new(span: Span, message: impl Into<String>) -> Self {
        Self { span, message: message.into() }
    }

    /// Translate the span start into a 1-based line and column.
    fn locate(self, source: &str) -> Diagnostic {
        let before = source.get(..self.span.start).unwrap_or(source);
        let line = before.matches('\n').count() + 1;
        let col = before.rsplit('\n').next().map_or(0, |l| l.chars().count()) + 1;
        Diagnostic { line, col, message: self.message }
    }
}

/// A compile error with its source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Diagnostic {
    pub(crate) line: usize,
    pub(crate) col: usize,
    pub(crate) message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<source>:{}:{}: error: {}", self.line, self.col, self.message)
    }
}

// ---------------------------------------------------------------------------
// Module
// ---------------------------------------------------------------------------

/// A compiled program: one or more entry points.
#[derive(Debug)]
pub(crate) struct Module {
    entries: Vec<Arc<EntryPoint>>,
}

impl Module {
    pub(crate) fn compile(source: &str) -> Result<Module, Diagnostic> {
        Self::passes(source)
            .map(|entries| Module { entries })
            .map_err(|e| e.locate(source))
    }

    fn passes(source: &str) -> Result<Vec<Arc<EntryPoint>>, SyntaxError> {
        let tokens = lexer::lex(source)?;
        lexer::check_nesting(&tokens)?;
        let kernels = parser::parse(source.len(), tokens)?;
        resolve::resolve(kernels)
    }

    pub(crate) fn entry(&self, name: &str) -> Option<Arc<EntryPoint>> {
        self.entries.iter().find(|e| e.name == name).cloned()
    }

    pub(crate) fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }
}

// ---------------------------------------------------------------------------
// Resolved program
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    GlobalId,
    LocalId,
    GroupId,
    GlobalSize,
    LocalSize,
}

#[derive(Debug, Clone)]
enum Expr {
    Float(f32),
    Int(i64),
    Slot(usize),
    Load { param: usize, index: Box<Expr> },
    Call(Builtin, Box<Expr>),
    Neg(Box<Expr>),
    Cast(ScalarType, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone)]
enum Stmt {
    Set { slot: usize, ty: ScalarType, value: Expr },
    Store { param: usize, index: Expr, value: Expr },
    If { cond: Expr, then: Vec<Stmt>, otherwise: Vec<Stmt> },
    Block(Vec<Stmt>),
    Return,
}

/// One compiled `__kernel` function.
#[derive(Debug)]
pub(crate) struct EntryPoint {
    pub(crate) name: String,
    pub(crate) params: Vec<Param>,
    body: Vec<Stmt>,
    /// Frame size: parameters first, then one slot per local declaration.
    slots: usize,
}
