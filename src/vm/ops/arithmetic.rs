//! Arithmetic and bitwise handlers.
//!
//! The typed opcodes run their fast path when both operand tags match and
//! otherwise fall back to the general coercing routines here. Integer
//! overflow promotes to float, matching PHP.

use crate::errors::VmError;
use crate::runtime::{ArrayKey, PhpArray, Value};
use crate::vm::values::{parse_numeric, Numeric};
use crate::vm::Vm;
use std::io::Write;

/// A coerced numeric operand.
#[derive(Clone, Copy)]
pub(crate) enum Num {
    Int(i64),
    Float(f64),
}

/// Coerce an operand for arithmetic. Non-numeric strings and composite
/// values raise TypeError, as PHP 8 does.
pub(crate) fn coerce_num<W: Write>(
    vm: &mut Vm<W>,
    v: &Value,
    op: &str,
) -> Result<Num, VmError> {
    match v {
        Value::Null => Ok(Num::Int(0)),
        Value::Bool(b) => Ok(Num::Int(*b as i64)),
        Value::Int(n) => Ok(Num::Int(*n)),
        Value::Float(f) => Ok(Num::Float(*f)),
        Value::String(h) => {
            let s = vm.heap.string(*h).to_string_lossy();
            match parse_numeric(&s) {
                Some(Numeric::Int(n)) => Ok(Num::Int(n)),
                Some(Numeric::Float(f)) => Ok(Num::Float(f)),
                None => Err(vm.raise(
                    "TypeError",
                    &format!("Unsupported operand types: string {} ...", op),
                )),
            }
        }
        Value::Ref(h) => {
            let inner = vm.heap.ref_get(*h).clone();
            coerce_num(vm, &inner, op)
        }
        other => Err(vm.raise(
            "TypeError",
            &format!("Unsupported operand types: {} {} ...", other.type_name(), op),
        )),
    }
}

fn binary_operands<W: Write>(vm: &mut Vm<W>) -> Result<(Value, Value), VmError> {
    let right = vm.pop()?;
    let left = vm.pop()?;
    Ok((left, right))
}

fn finish<W: Write>(
    vm: &mut Vm<W>,
    left: Value,
    right: Value,
    result: Result<Value, VmError>,
) -> Result<(), VmError> {
    vm.heap.release_value(&left);
    vm.heap.release_value(&right);
    vm.stack.push(result?);
    Ok(())
}

pub fn add<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let (left, right) = binary_operands(vm)?;
    if let (Value::Int(a), Value::Int(b)) = (&left, &right) {
        let v = match a.checked_add(*b) {
            Some(n) => Value::Int(n),
            None => Value::Float(*a as f64 + *b as f64),
        };
        vm.stack.push(v);
        return Ok(());
    }
    let result = add_general(vm, &left, &right);
    finish(vm, left, right, result)
}

fn add_general<W: Write>(vm: &mut Vm<W>, left: &Value, right: &Value) -> Result<Value, VmError> {
    // Array union: keys of the left operand win.
    if let (Value::Array(x), Value::Array(y)) = (left, right) {
        let mut union = PhpArray::with_capacity(vm.heap.array(*x).len());
        let left_entries: Vec<(ArrayKey, Value)> = vm.heap.array(*x).entries().to_vec();
        for (k, v) in left_entries {
            vm.heap.retain_value(&v);
            union.insert(k, v);
        }
        let right_entries: Vec<(ArrayKey, Value)> = vm.heap.array(*y).entries().to_vec();
        for (k, v) in right_entries {
            if !union.contains_key(&k) {
                vm.heap.retain_value(&v);
                union.insert(k, v);
            }
        }
        return Ok(Value::Array(vm.heap.alloc_array(union)));
    }
    let a = coerce_num(vm, left, "+")?;
    let b = coerce_num(vm, right, "+")?;
    Ok(match (a, b) {
        (Num::Int(x), Num::Int(y)) => match x.checked_add(y) {
            Some(n) => Value::Int(n),
            None => Value::Float(x as f64 + y as f64),
        },
        (x, y) => Value::Float(num_f64(x) + num_f64(y)),
    })
}

pub fn add_float<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let (left, right) = binary_operands(vm)?;
    if let (Value::Float(a), Value::Float(b)) = (&left, &right) {
        vm.stack.push(Value::Float(a + b));
        return Ok(());
    }
    let result = add_general(vm, &left, &right);
    finish(vm, left, right, result)
}

pub fn sub<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let (left, right) = binary_operands(vm)?;
    if let (Value::Int(a), Value::Int(b)) = (&left, &right) {
        let v = match a.checked_sub(*b) {
            Some(n) => Value::Int(n),
            None => Value::Float(*a as f64 - *b as f64),
        };
        vm.stack.push(v);
        return Ok(());
    }
    let result = sub_general(vm, &left, &right);
    finish(vm, left, right, result)
}

fn sub_general<W: Write>(vm: &mut Vm<W>, left: &Value, right: &Value) -> Result<Value, VmError> {
    let a = coerce_num(vm, left, "-")?;
    let b = coerce_num(vm, right, "-")?;
    Ok(match (a, b) {
        (Num::Int(x), Num::Int(y)) => match x.checked_sub(y) {
            Some(n) => Value::Int(n),
            None => Value::Float(x as f64 - y as f64),
        },
        (x, y) => Value::Float(num_f64(x) - num_f64(y)),
    })
}

pub fn sub_float<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let (left, right) = binary_operands(vm)?;
    if let (Value::Float(a), Value::Float(b)) = (&left, &right) {
        vm.stack.push(Value::Float(a - b));
        return Ok(());
    }
    let result = sub_general(vm, &left, &right);
    finish(vm, left, right, result)
}

pub fn mul<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let (left, right) = binary_operands(vm)?;
    if let (Value::Int(a), Value::Int(b)) = (&left, &right) {
        let v = match a.checked_mul(*b) {
            Some(n) => Value::Int(n),
            None => Value::Float(*a as f64 * *b as f64),
        };
        vm.stack.push(v);
        return Ok(());
    }
    let result = mul_general(vm, &left, &right);
    finish(vm, left, right, result)
}

fn mul_general<W: Write>(vm: &mut Vm<W>, left: &Value, right: &Value) -> Result<Value, VmError> {
    let a = coerce_num(vm, left, "*")?;
    let b = coerce_num(vm, right, "*")?;
    Ok(match (a, b) {
        (Num::Int(x), Num::Int(y)) => match x.checked_mul(y) {
            Some(n) => Value::Int(n),
            None => Value::Float(x as f64 * y as f64),
        },
        (x, y) => Value::Float(num_f64(x) * num_f64(y)),
    })
}

pub fn mul_float<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let (left, right) = binary_operands(vm)?;
    if let (Value::Float(a), Value::Float(b)) = (&left, &right) {
        vm.stack.push(Value::Float(a * b));
        return Ok(());
    }
    let result = mul_general(vm, &left, &right);
    finish(vm, left, right, result)
}

/// PHP `/`: exact integer division stays integral, everything else is
/// float. Zero divisors raise DivisionByZeroError.
pub fn div<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let (left, right) = binary_operands(vm)?;
    let result = div_general(vm, &left, &right);
    finish(vm, left, right, result)
}

fn div_general<W: Write>(vm: &mut Vm<W>, left: &Value, right: &Value) -> Result<Value, VmError> {
    let a = coerce_num(vm, left, "/")?;
    let b = coerce_num(vm, right, "/")?;
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => {
            if y == 0 {
                return Err(vm.raise("DivisionByZeroError", "Division by zero"));
            }
            if x % y == 0 {
                Ok(Value::Int(x / y))
            } else {
                Ok(Value::Float(x as f64 / y as f64))
            }
        }
        (x, y) => {
            let fy = num_f64(y);
            if fy == 0.0 {
                return Err(vm.raise("DivisionByZeroError", "Division by zero"));
            }
            Ok(Value::Float(num_f64(x) / fy))
        }
    }
}

pub fn div_float<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let (left, right) = binary_operands(vm)?;
    if let (Value::Float(a), Value::Float(b)) = (&left, &right) {
        if *b == 0.0 {
            let e = vm.raise("DivisionByZeroError", "Division by zero");
            vm.heap.release_value(&left);
            vm.heap.release_value(&right);
            return Err(e);
        }
        vm.stack.push(Value::Float(a / b));
        return Ok(());
    }
    let result = div_general(vm, &left, &right);
    finish(vm, left, right, result)
}

pub fn modulo<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let (left, right) = binary_operands(vm)?;
    let result = (|| {
        let a = coerce_num(vm, &left, "%")?;
        let b = coerce_num(vm, &right, "%")?;
        let x = num_i64(a);
        let y = num_i64(b);
        if y == 0 {
            return Err(vm.raise("DivisionByZeroError", "Modulo by zero"));
        }
        // i64::MIN % -1 would trap in Rust; PHP yields 0.
        if y == -1 {
            return Ok(Value::Int(0));
        }
        Ok(Value::Int(x % y))
    })();
    finish(vm, left, right, result)
}

pub fn mod_float<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let (left, right) = binary_operands(vm)?;
    if let (Value::Float(a), Value::Float(b)) = (&left, &right) {
        if *b == 0.0 {
            let e = vm.raise("DivisionByZeroError", "Modulo by zero");
            vm.heap.release_value(&left);
            vm.heap.release_value(&right);
            return Err(e);
        }
        vm.stack.push(Value::Float(a % b));
        return Ok(());
    }
    let result = (|| {
        let a = coerce_num(vm, &left, "%")?;
        let b = coerce_num(vm, &right, "%")?;
        let fy = num_f64(b);
        if fy == 0.0 {
            return Err(vm.raise("DivisionByZeroError", "Modulo by zero"));
        }
        Ok(Value::Float(num_f64(a) % fy))
    })();
    finish(vm, left, right, result)
}

pub fn pow<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let (left, right) = binary_operands(vm)?;
    let result = (|| {
        let a = coerce_num(vm, &left, "**")?;
        let b = coerce_num(vm, &right, "**")?;
        match (a, b) {
            (Num::Int(x), Num::Int(y)) if y >= 0 => {
                match y.try_into().ok().and_then(|e| x.checked_pow(e)) {
                    Some(n) => Ok(Value::Int(n)),
                    None => Ok(Value::Float((x as f64).powf(y as f64))),
                }
            }
            (x, y) => Ok(Value::Float(num_f64(x).powf(num_f64(y)))),
        }
    })();
    finish(vm, left, right, result)
}

pub fn pow_float<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let (left, right) = binary_operands(vm)?;
    if let (Value::Float(a), Value::Float(b)) = (&left, &right) {
        vm.stack.push(Value::Float(a.powf(*b)));
        return Ok(());
    }
    vm.stack.push(left);
    vm.stack.push(right);
    pow(vm)
}

pub fn neg<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let v = vm.pop()?;
    let result = match &v {
        Value::Int(n) => match n.checked_neg() {
            Some(m) => Ok(Value::Int(m)),
            None => Ok(Value::Float(-(*n as f64))),
        },
        Value::Float(f) => Ok(Value::Float(-f)),
        other => match coerce_num(vm, other, "-") {
            Ok(Num::Int(n)) => Ok(Value::Int(n.checked_neg().unwrap_or(0))),
            Ok(Num::Float(f)) => Ok(Value::Float(-f)),
            Err(e) => Err(e),
        },
    };
    vm.heap.release_value(&v);
    vm.stack.push(result?);
    Ok(())
}

/// In-place integer increment/decrement of a local slot (`++$i` fast path).
/// Non-integer slots fall back to the general numeric rules; PHP leaves
/// null unchanged on decrement and treats it as 0 on increment.
pub fn inc_local<W: Write>(vm: &mut Vm<W>, slot: u16, delta: i64) -> Result<(), VmError> {
    let cur = vm.load_local(slot);
    let next = match &cur {
        Value::Int(n) => match n.checked_add(delta) {
            Some(m) => Value::Int(m),
            None => Value::Float(*n as f64 + delta as f64),
        },
        Value::Float(f) => Value::Float(f + delta as f64),
        Value::Null => {
            if delta > 0 {
                Value::Int(1)
            } else {
                Value::Null
            }
        }
        other => match coerce_num(vm, other, if delta > 0 { "++" } else { "--" }) {
            Ok(Num::Int(n)) => Value::Int(n.wrapping_add(delta)),
            Ok(Num::Float(f)) => Value::Float(f + delta as f64),
            Err(e) => {
                vm.heap.release_value(&cur);
                return Err(e);
            }
        },
    };
    vm.heap.release_value(&cur);
    vm.store_local(slot, next);
    Ok(())
}

// ==================== Bitwise ====================

pub fn bit_and<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    bitwise(vm, |a, b| a & b)
}

pub fn bit_or<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    bitwise(vm, |a, b| a | b)
}

pub fn bit_xor<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    bitwise(vm, |a, b| a ^ b)
}

fn bitwise<W: Write>(vm: &mut Vm<W>, f: impl Fn(i64, i64) -> i64) -> Result<(), VmError> {
    let (left, right) = binary_operands(vm)?;
    let a = vm.to_int_value(&left);
    let b = vm.to_int_value(&right);
    vm.heap.release_value(&left);
    vm.heap.release_value(&right);
    vm.stack.push(Value::Int(f(a, b)));
    Ok(())
}

pub fn bit_not<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let v = vm.pop()?;
    let n = vm.to_int_value(&v);
    vm.heap.release_value(&v);
    vm.stack.push(Value::Int(!n));
    Ok(())
}

pub fn shl<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let (left, right) = binary_operands(vm)?;
    let a = vm.to_int_value(&left);
    let b = vm.to_int_value(&right);
    vm.heap.release_value(&left);
    vm.heap.release_value(&right);
    if b < 0 {
        return Err(vm.raise("ArithmeticError", "Bit shift by negative number"));
    }
    let v = if b >= 64 { 0 } else { ((a as u64) << b) as i64 };
    vm.stack.push(Value::Int(v));
    Ok(())
}

pub fn shr<W: Write>(vm: &mut Vm<W>) -> Result<(), VmError> {
    let (left, right) = binary_operands(vm)?;
    let a = vm.to_int_value(&left);
    let b = vm.to_int_value(&right);
    vm.heap.release_value(&left);
    vm.heap.release_value(&right);
    if b < 0 {
        return Err(vm.raise("ArithmeticError", "Bit shift by negative number"));
    }
    let v = if b >= 64 {
        if a < 0 {
            -1
        } else {
            0
        }
    } else {
        a >> b
    };
    vm.stack.push(Value::Int(v));
    Ok(())
}

pub(crate) fn num_f64(n: Num) -> f64 {
    match n {
        Num::Int(i) => i as f64,
        Num::Float(f) => f,
    }
}

pub(crate) fn num_i64(n: Num) -> i64 {
    match n {
        Num::Int(i) => i,
        Num::Float(f) => f as i64,
    }
}
