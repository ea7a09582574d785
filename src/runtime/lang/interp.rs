use super::{BinOp, Builtin, EntryPoint, Expr, Param, ParamType, ScalarType, Stmt};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    Float(f32),
    Int(i64),
}

impl Value {
    fn truthy(self) -> bool {
        match self {
            Value::Float(v) => v != 0.0,
            Value::Int(v) => v != 0,
        }
    }

    fn as_f32(self) -> f32 {
        match self {
            Value::Float(v) => v,
            Value::Int(v) => v as f32,
        }
    }

    fn convert(self, ty: ScalarType) -> Value {
        let wide = match self {
            Value::Float(v) if ty == ScalarType::Float => return Value::Float(v),
            Value::Int(v) if ty == ScalarType::Float => return Value::Float(v as f32),
            Value::Float(v) => v as i64,
            Value::Int(v) => v,
        };
        Value::Int(match ty {
            ScalarType::Int => wide as i32 as i64,
            ScalarType::UInt => wide as u32 as i64,
            _ => wide,
        })
    }

    fn decode(ty: ScalarType, bytes: &[u8]) -> Option<Value> {
        let value = match ty {
            ScalarType::Float => Value::Float(f32::from_ne_bytes(bytes.try_into().ok()?)),
            ScalarType::Int => Value::Int(i32::from_ne_bytes(bytes.try_into().ok()?) as i64),
            ScalarType::UInt => Value::Int(u32::from_ne_bytes(bytes.try_into().ok()?) as i64),
            ScalarType::Long => Value::Int(i64::from_ne_bytes(bytes.try_into().ok()?)),
            ScalarType::ULong => Value::Int(u64::from_ne_bytes(bytes.try_into().ok()?) as i64),
        };
        Some(value)
    }
}

/// A kernel argument resolved for execution.
#[derive(Debug, Clone)]
pub(crate) enum Resolved {
    /// Index into the memory slice passed to [`EntryPoint::execute`].
    Memory(usize),
    Scalar(Vec<u8>),
}

enum Flow {
    Next,
    Return,
}

struct WorkItem<'m> {
    global_id: usize,
    global: usize,
    group: usize,
    frame: Vec<Value>,
    pointers: Vec<Option<usize>>,
    memory: &'m mut [Vec<u8>],
}

impl EntryPoint {
    /// Run every work-item of a 1-D launch, group by group.
    pub(crate) fn execute(
        &self,
        args: &[Resolved],
        memory: &mut [Vec<u8>],
        global: usize,
        group: usize,
    ) -> Result<(), String> {
        let mut frame = vec![Value::Int(0); self.slots];
        let mut pointers = vec![None; self.params.len()];
        for (index, (param, arg)) in self.params.iter().zip(args).enumerate() {
            match (param.ty, arg) {
                (ParamType::GlobalFloatPtr, Resolved::Memory(m)) => pointers[index] = Some(*m),
                (ParamType::Scalar(ty), Resolved::Scalar(bytes)) => {
                    frame[index] = Value::decode(ty, bytes)
                        .ok_or_else(|| format!("argument {index} has the wrong size"))?;
                }
                _ => return Err(format!("argument {index} does not match parameter '{}'", param.name)),
            }
        }

        let mut item = WorkItem { global_id: 0, global, group, frame: frame.clone(), pointers, memory };
        for global_id in 0..global {
            item.global_id = global_id;
            item.frame.copy_from_slice(&frame);
            item.run(&self.params, &self.body)?;
        }
        Ok(())
    }
}

impl WorkItem<'_> {
    fn run(&mut self, params: &[Param], body: &[Stmt]) -> Result<Flow, String> {
        for stmt in body {
            match stmt {
                Stmt::Set { slot, ty, value } => {
                    let v = self.eval(params, value)?.convert(*ty);
                    self.frame[*slot] = v;
                }
                Stmt::Store { param, index, value } => {
                    let idx = self.index(params, *param, index)?;
                    let v = self.eval(params, value)?.as_f32();
                    let mem = self.buffer(params, *param, idx)?;
                    mem.copy_from_slice(&v.to_ne_bytes());
                }
                Stmt::If { cond, then, otherwise } => {
                    let branch = if self.eval(params, cond)?.truthy() { then } else { otherwise };
                    if let Flow::Return = self.run(params, branch)? {
                        return Ok(Flow::Return);
                    }
                }
                Stmt::Block(inner) => {
                    if let Flow::Return = self.run(params, inner)? {
                        return Ok(Flow::Return);
                    }
                }
                Stmt::Return => return Ok(Flow::Return),
            }
        }
        Ok(Flow::Next)
    }

    fn index(&mut self, params: &[Param], param: usize, index: &Expr) -> Result<usize, String> {
        match self.eval(params, index)? {
            Value::Int(i) if i >= 0 => usize::try_from(i)
                .map_err(|_| format!("index {i} into '{}' exceeds the address space", params[param].name)),
            Value::Int(i) => Err(format!(
                "negative index {i} into '{}' (work-item {})",
                params[param].name, self.global_id
            )),
            Value::Float(_) => Err(format!(
                "array subscript into '{}' is not an integer",
                params[param].name
            )),
        }
    }

    fn buffer(&mut self, params: &[Param], param: usize, idx: usize) -> Result<&mut [u8], String> {
        let name = &params[param].name;
        let mem = self.pointers[param]
            .and_then(|m| self.memory.get_mut(m))
            .ok_or_else(|| format!("pointer parameter '{name}' is not bound"))?;
        let end = idx
            .checked_mul(4)
            .and_then(|start| start.checked_add(4))
            .filter(|end| *end <= mem.len())
            .ok_or_else(|| {
                format!(
                    "out-of-bounds access '{name}[{idx}]' (buffer holds {} floats, work-item {})",
                    mem.len() / 4,
                    self.global_id
                )
            })?;
        Ok(&mut mem[end - 4..end])
    }

    fn eval(&mut self, params: &[Param], expr: &Expr) -> Result<Value, String> {
        Ok(match expr {
            Expr::Float(v) => Value::Float(*v),
            Expr::Int(v) => Value::Int(*v),
            Expr::Slot(slot) => self.frame[*slot],
            Expr::Load { param, index } => {
                let idx = self.index(params, *param, index)?;
                let bytes = self.buffer(params, *param, idx)?;
                let mut raw = [0u8; 4];
                raw.copy_from_slice(bytes);
                Value::Float(f32::from_ne_bytes(raw))
            }
            Expr::Call(builtin, dim) => {
                let first_dim = self.eval(params, dim)? == Value::Int(0);
                let v = match builtin {
                    Builtin::GlobalId if first_dim => self.global_id,
                    Builtin::LocalId if first_dim => self.global_id % self.group,
                    Builtin::GroupId if first_dim => self.global_id / self.group,
                    Builtin::GlobalSize if first_dim => self.global,
                    Builtin::LocalSize if first_dim => self.group,
                    Builtin::GlobalSize | Builtin::LocalSize => 1,
                    _ => 0,
                };
                Value::Int(v as i64)
            }
            Expr::Neg(inner) => match self.eval(params, inner)? {
                Value::Float(v) => Value::Float(-v),
                Value::Int(v) => Value::Int(v.wrapping_neg()),
            },
            Expr::Cast(ty, inner) => self.eval(params, inner)?.convert(*ty),
            Expr::Binary(BinOp::And, lhs, rhs) => {
                let v = self.eval(params, lhs)?.truthy() && self.eval(params, rhs)?.truthy();
                Value::Int(v as i64)
            }
            Expr::Binary(BinOp::Or, lhs, rhs) => {
                let v = self.eval(params, lhs)?.truthy() || self.eval(params, rhs)?.truthy();
                Value::Int(v as i64)
            }
            Expr::Binary(op, lhs, rhs) => {
                let l = self.eval(params, lhs)?;
                let r = self.eval(params, rhs)?;
                apply(*op, l, r)?
            }
        })
    }
}

fn apply(op: BinOp, l: Value, r: Value) -> Result<Value, String> {
    if let (Value::Int(a), Value::Int(b)) = (l, r) {
        return Ok(Value::Int(match op {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div if b == 0 => return Err("integer division by zero".into()),
            BinOp::Div => a.wrapping_div(b),
            BinOp::Lt => (a < b) as i64,
            BinOp::Le => (a <= b) as i64,
            BinOp::Gt => (a > b) as i64,
            BinOp::Ge => (a >= b) as i64,
            BinOp::Eq => (a == b) as i64,
            BinOp::Ne => (a != b) as i64,
            BinOp::And => (a != 0 && b != 0) as i64,
            BinOp::Or => (a != 0 || b != 0) as i64,
        }));
    }
    let (a, b) = (l.as_f32(), r.as_f32());
    Ok(match op {
        BinOp::Add => Value::Float(a + b),
        BinOp::Sub => Value::Float(a - b),
        BinOp::Mul => Value::Float(a * b),
        BinOp::Div => Value::Float(a / b),
        BinOp::Lt => Value::Int((a < b) as i64),
        BinOp::Le => Value::Int((a <= b) as i64),
        BinOp::Gt => Value::Int((a > b) as i64),
        BinOp::Ge => Value::Int((a >= b) as i64),
        BinOp::Eq => Value::Int((a == b) as i64),
        BinOp::Ne => Value::Int((a != b) as i64),
        BinOp::And => Value::Int((a != 0.0 && b != 0.0) as i64),
        BinOp::Or => Value::Int((a != 0.0 || b != 0.0) as i64),
    })
}
