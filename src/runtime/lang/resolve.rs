use std::collections::HashMap;
use std::sync::Arc;

use super::parser::{SynExpr, SynKernel, SynParam, SynStmt};
use super::{Builtin, EntryPoint, Expr, Param, ParamType, ScalarType, Span, Stmt, SyntaxError};

#[derive(Debug, Clone, Copy)]
enum Binding {
    /// Index of a `__global float*` parameter.
    Pointer(usize),
    /// Frame slot of a scalar parameter or local.
    Scalar(usize, ScalarType),
}

/// Bind every name in `kernels` and lay out their frames.
pub(super) fn resolve(kernels: Vec<SynKernel>) -> Result<Vec<Arc<EntryPoint>>, SyntaxError> {
    let mut entries: Vec<Arc<EntryPoint>> = Vec::new();
    for kernel in kernels {
        if entries.iter().any(|e| e.name == kernel.name) {
            return Err(SyntaxError::new(kernel.span, format!("redefinition of '{}'", kernel.name)));
        }
        entries.push(Arc::new(Resolver::default().kernel(kernel)?));
    }
    Ok(entries)
}

#[derive(Default)]
struct Resolver {
    scopes: Vec<HashMap<String, Binding>>,
    slots: usize,
}

impl Resolver {
    fn kernel(mut self, kernel: SynKernel) -> Result<EntryPoint, SyntaxError> {
        self.scopes.push(HashMap::new());
        let mut params = Vec::with_capacity(kernel.params.len());
        for param in kernel.params {
            let ty = param_type(&param)?;
            if self.lookup(&param.name).is_some() {
                return Err(SyntaxError::new(
                    param.span,
                    format!("redefinition of parameter '{}'", param.name),
                ));
            }
            let binding = match ty {
                ParamType::GlobalFloatPtr => Binding::Pointer(params.len()),
                ParamType::Scalar(t) => Binding::Scalar(params.len(), t),
            };
            self.declare(param.name.clone(), binding);
            params.push(Param { name: param.name, ty });
            self.slots += 1;
        }
        let body = self.block(kernel.body)?;
        Ok(EntryPoint { name: kernel.name, params, body, slots: self.slots })
    }

    fn lookup(&self, name: &str) -> Option<Binding> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name).copied())
    }

    fn declare(&mut self, name: String, binding: Binding) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name, binding);
        }
    }

    fn block(&mut self, stmts: Vec<SynStmt>) -> Result<Vec<Stmt>, SyntaxError> {
        self.scopes.push(HashMap::new());
        let mut out = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            out.extend(self.statement(stmt)?);
        }
        self.scopes.pop();
        Ok(out)
    }

    /// An `if`/`else` body gets its own scope even without braces.
    fn branch(&mut self, stmt: SynStmt) -> Result<Vec<Stmt>, SyntaxError> {
        self.block(vec![stmt])
    }

    fn statement(&mut self, stmt: SynStmt) -> Result<Option<Stmt>, SyntaxError> {
        Ok(Some(match stmt {
            SynStmt::Empty => return Ok(None),
            SynStmt::Return => Stmt::Return,
            SynStmt::Block(inner) => Stmt::Block(self.block(inner)?),
            SynStmt::If { cond, then, otherwise } => Stmt::If {
                cond: self.expr(cond)?,
                then: self.branch(*then)?,
                otherwise: match otherwise {
                    Some(stmt) => self.branch(*stmt)?,
                    None => Vec::new(),
                },
            },
            SynStmt::Decl { ty, name, span, value } => {
                if self.scopes.last().is_some_and(|scope| scope.contains_key(&name)) {
                    return Err(SyntaxError::new(span, format!("redefinition of '{name}'")));
                }
                let value = match value {
                    Some(value) => self.expr(value)?,
                    None => Expr::Int(0),
                };
                let slot = self.slots;
                self.slots += 1;
                self.declare(name, Binding::Scalar(slot, ty));
                Stmt::Set { slot, ty, value }
            }
            SynStmt::Assign { name, span, index, value } => match (self.lookup(&name), index) {
                (None, _) => return Err(undeclared(span, &name)),
                (Some(Binding::Pointer(param)), Some(index)) => Stmt::Store {
                    param,
                    index: self.expr(index)?,
                    value: self.expr(value)?,
                },
                (Some(Binding::Pointer(_)), None) => {
                    return Err(SyntaxError::new(
                        span,
                        format!("pointer parameter '{name}' cannot be assigned; index it"),
                    ))
                }
                (Some(Binding::Scalar(_, _)), Some(_)) => return Err(not_a_pointer(span, &name)),
                (Some(Binding::Scalar(slot, ty)), None) => Stmt::Set { slot, ty, value: self.expr(value)? },
            },
        }))
    }

    fn expr(&mut self, expr: SynExpr) -> Result<Expr, SyntaxError> {
        Ok(match expr {
            SynExpr::Float(v) => Expr::Float(v),
            SynExpr::Int(v) => Expr::Int(v),
            SynExpr::Name { name, span } => match self.lookup(&name) {
                Some(Binding::Scalar(slot, _)) => Expr::Slot(slot),
                Some(Binding::Pointer(_)) => {
                    return Err(SyntaxError::new(
                        span,
                        format!("pointer parameter '{name}' cannot be used as a value"),
                    ))
                }
                None => return Err(undeclared(span, &name)),
            },
            SynExpr::Index { name, span, index } => match self.lookup(&name) {
                Some(Binding::Pointer(param)) => Expr::Load { param, index: Box::new(self.expr(*index)?) },
                Some(Binding::Scalar(_, _)) => return Err(not_a_pointer(span, &name)),
                None => return Err(undeclared(span, &name)),
            },
            SynExpr::Call { name, span, arg } => {
                let builtin = match name.as_str() {
                    "get_global_id" => Builtin::GlobalId,
                    "get_local_id" => Builtin::LocalId,
                    "get_group_id" => Builtin::GroupId,
                    "get_global_size" => Builtin::GlobalSize,
                    "get_local_size" => Builtin::LocalSize,
                    _ => {
                        return Err(SyntaxError::new(
                            span,
                            format!("implicit declaration of function '{name}' is invalid in OpenCL"),
                        ))
                    }
                };
                Expr::Call(builtin, Box::new(self.expr(*arg)?))
            }
            SynExpr::Neg(inner) => Expr::Neg(Box::new(self.expr(*inner)?)),
            SynExpr::Cast(ty, inner) => Expr::Cast(ty, Box::new(self.expr(*inner)?)),
            SynExpr::Binary(op, lhs, rhs) => {
                Expr::Binary(op, Box::new(self.expr(*lhs)?), Box::new(self.expr(*rhs)?))
            }
        })
    }
}

fn param_type(param: &SynParam) -> Result<ParamType, SyntaxError> {
    let name = &param.name;
    let message = match (param.pointer, param.global) {
        (true, true) if param.ty == ScalarType::Float => return Ok(ParamType::GlobalFloatPtr),
        (false, false) => return Ok(ParamType::Scalar(param.ty)),
        (true, true) => format!(
            "unsupported pointer element type '{}' for parameter '{name}'",
            param.ty.c_name()
        ),
        (true, false) => format!("pointer parameter '{name}' must be declared in the __global address space"),
        (false, true) => format!("parameter '{name}' may not be qualified with an address space"),
    };
    Err(SyntaxError::new(param.span.clone(), message))
}

fn undeclared(span: Span, name: &str) -> SyntaxError {
    SyntaxError::new(span, format!("use of undeclared identifier '{name}'"))
}

fn not_a_pointer(span: Span, name: &str) -> SyntaxError {
    SyntaxError::new(span, format!("subscripted value '{name}' is not a pointer"))
}
