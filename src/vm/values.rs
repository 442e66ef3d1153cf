//! Value coercion, comparison, and type checking.
//!
//! PHP's juggling rules concentrated in one place: truthiness, numeric
//! casts, loose equality, ordering, strict identity, and the coercive
//! parameter/return type checks.

use crate::ast::TypeHint;
use crate::errors::VmError;
use crate::heap::Handle;
use crate::runtime::{ArrayKey, PhpString, Value};
use crate::vm::opcode::Constant;
use crate::vm::Vm;
use std::cmp::Ordering;
use std::io::Write;

/// A parsed numeric string.
pub(crate) enum Numeric {
    Int(i64),
    Float(f64),
}

/// PHP numeric-string parse: optional surrounding whitespace, decimal
/// integer or float form. Returns `None` for anything else.
pub(crate) fn parse_numeric(s: &str) -> Option<Numeric> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    if let Ok(n) = t.parse::<i64>() {
        return Some(Numeric::Int(n));
    }
    if let Ok(f) = t.parse::<f64>() {
        if f.is_finite() {
            return Some(Numeric::Float(f));
        }
    }
    None
}

/// PHP float-to-string: integral values print without a decimal point.
pub(crate) fn php_float_repr(f: f64) -> String {
    if f.is_nan() {
        return "NAN".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "INF" } else { "-INF" }.to_string();
    }
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{:.0}", f)
    } else {
        f.to_string()
    }
}

impl<W: Write> Vm<W> {
    /// Materialize a constant-pool entry.
    pub(crate) fn constant_value(&mut self, c: &Constant) -> Value {
        match c {
            Constant::Null => Value::Null,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(n) => Value::Int(*n),
            Constant::Float(f) => Value::Float(*f),
            Constant::Str(s) => Value::String(self.heap.alloc_string(s.as_str().into())),
        }
    }

    // ==================== Truthiness & numeric casts ====================

    pub(crate) fn is_truthy(&self, v: &Value) -> bool {
        match v {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(h) => {
                let s = self.heap.string(*h);
                !s.is_empty() && s.as_bytes() != b"0"
            }
            Value::Array(h) => !self.heap.array(*h).is_empty(),
            Value::Ref(h) => self.is_truthy(&self.heap.ref_get(*h).clone()),
            _ => true,
        }
    }

    pub(crate) fn to_int_value(&self, v: &Value) -> i64 {
        match v {
            Value::Null => 0,
            Value::Bool(b) => *b as i64,
            Value::Int(n) => *n,
            Value::Float(f) => *f as i64,
            Value::String(h) => {
                let s = self.heap.string(*h).to_string_lossy();
                match parse_numeric(&s) {
                    Some(Numeric::Int(n)) => n,
                    Some(Numeric::Float(f)) => f as i64,
                    None => leading_int(&s),
                }
            }
            Value::Array(h) => {
                if self.heap.array(*h).is_empty() {
                    0
                } else {
                    1
                }
            }
            Value::Ref(h) => self.to_int_value(&self.heap.ref_get(*h).clone()),
            _ => 1,
        }
    }

    pub(crate) fn to_float_value(&self, v: &Value) -> f64 {
        match v {
            Value::Null => 0.0,
            Value::Bool(b) => *b as i64 as f64,
            Value::Int(n) => *n as f64,
            Value::Float(f) => *f,
            Value::String(h) => {
                let s = self.heap.string(*h).to_string_lossy();
                match parse_numeric(&s) {
                    Some(Numeric::Int(n)) => n as f64,
                    Some(Numeric::Float(f)) => f,
                    None => leading_int(&s) as f64,
                }
            }
            Value::Ref(h) => self.to_float_value(&self.heap.ref_get(*h).clone()),
            other => self.to_int_value(other) as f64,
        }
    }

    // ==================== String casts ====================

    /// PHP string cast, running `__toString` for objects. Non-stringable
    /// values raise the usual conversion Error.
    pub(crate) fn display_string(&mut self, v: &Value) -> Result<String, VmError> {
        Ok(self.cast_to_php_string(v)?.to_string_lossy())
    }

    pub(crate) fn cast_to_php_string(&mut self, v: &Value) -> Result<PhpString, VmError> {
        match v {
            Value::Null => Ok(PhpString::from("")),
            Value::Bool(b) => Ok(PhpString::from(if *b { "1" } else { "" })),
            Value::Int(n) => Ok(PhpString::from(n.to_string())),
            Value::Float(f) => Ok(PhpString::from(php_float_repr(*f))),
            Value::String(h) => Ok(self.heap.string(*h).clone()),
            Value::Array(_) => Ok(PhpString::from("Array")),
            Value::Object(h) => {
                let class = self.heap.object(*h).class;
                let to_string = self.registry.class(class).magic.to_string.clone();
                match to_string {
                    Some(func) => {
                        self.heap.retain(*h);
                        let result =
                            self.call_sync(func, Some(Value::Object(*h)), Vec::new(), Some(class))?;
                        match result {
                            Value::String(s) => {
                                let out = self.heap.string(s).clone();
                                self.heap.release(s);
                                Ok(out)
                            }
                            other => {
                                self.heap.release_value(&other);
                                Err(self.raise(
                                    "TypeError",
                                    "__toString() must return a string",
                                ))
                            }
                        }
                    }
                    None => {
                        let name = self.registry.class(class).name.clone();
                        Err(self.raise(
                            "Error",
                            &format!("Object of class {} could not be converted to string", name),
                        ))
                    }
                }
            }
            Value::Closure(_) | Value::BoundMethod { .. } | Value::Function(_)
            | Value::Builtin(_) => Err(self.raise(
                "Error",
                "Object of class Closure could not be converted to string",
            )),
            Value::Resource(h) => {
                Ok(PhpString::from(format!("Resource id #{}", self.heap.resource(*h).id)))
            }
            Value::Ref(h) => {
                let inner = self.heap.ref_get(*h).clone();
                self.cast_to_php_string(&inner)
            }
        }
    }

    // ==================== Equality & ordering ====================

    /// Loose equality (`==`) with PHP 8 semantics: number/numeric-string
    /// juggling, arrays by key/value pairs, objects property-by-property.
    pub(crate) fn loose_eq(&self, a: &Value, b: &Value) -> bool {
        use Value::*;
        match (a, b) {
            (Ref(h), _) => self.loose_eq(&self.heap.ref_get(*h).clone(), b),
            (_, Ref(h)) => self.loose_eq(a, &self.heap.ref_get(*h).clone()),
            (Null, Null) => true,
            (Null, other) | (other, Null) => !self.is_truthy(other) && !matches!(other, Value::String(_)) || self.null_eq_string(other),
            (Bool(x), other) | (other, Bool(x)) => *x == self.is_truthy(other),
            (Int(x), Int(y)) => x == y,
            (Float(x), Float(y)) => x == y,
            (Int(x), Float(y)) | (Float(y), Int(x)) => (*x as f64) == *y,
            (Int(x), String(s)) | (String(s), Int(x)) => {
                match parse_numeric(&self.heap.string(*s).to_string_lossy()) {
                    Some(Numeric::Int(n)) => n == *x,
                    Some(Numeric::Float(f)) => f == *x as f64,
                    None => false,
                }
            }
            (Float(x), String(s)) | (String(s), Float(x)) => {
                match parse_numeric(&self.heap.string(*s).to_string_lossy()) {
                    Some(Numeric::Int(n)) => n as f64 == *x,
                    Some(Numeric::Float(f)) => f == *x,
                    None => false,
                }
            }
            (String(x), String(y)) => {
                let sx = self.heap.string(*x);
                let sy = self.heap.string(*y);
                if sx.as_bytes() == sy.as_bytes() {
                    return true;
                }
                match (
                    parse_numeric(&sx.to_string_lossy()),
                    parse_numeric(&sy.to_string_lossy()),
                ) {
                    (Some(nx), Some(ny)) => numeric_to_f64(&nx) == numeric_to_f64(&ny),
                    _ => false,
                }
            }
            (Array(x), Array(y)) => self.arrays_loose_eq(*x, *y),
            (Object(x), Object(y)) => self.objects_loose_eq(*x, *y),
            _ => false,
        }
    }

    fn null_eq_string(&self, other: &Value) -> bool {
        // null == "" holds in PHP.
        match other {
            Value::String(h) => self.heap.string(*h).is_empty(),
            _ => false,
        }
    }

    fn arrays_loose_eq(&self, x: Handle, y: Handle) -> bool {
        if x == y {
            return true;
        }
        let ax = self.heap.array(x);
        let ay = self.heap.array(y);
        if ax.len() != ay.len() {
            return false;
        }
        for (k, v) in ax.entries() {
            match ay.get(k) {
                Some(other) => {
                    if !self.loose_eq(v, other) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }

    fn objects_loose_eq(&self, x: Handle, y: Handle) -> bool {
        if x == y {
            return true;
        }
        let ox = self.heap.object(x);
        let oy = self.heap.object(y);
        if ox.class != oy.class || ox.slots.len() != oy.slots.len() {
            return false;
        }
        ox.slots
            .iter()
            .zip(oy.slots.iter())
            .all(|(a, b)| self.loose_eq(a, b))
    }

    /// Strict identity (`===`): same tag, scalar value, string content;
    /// objects by box identity; arrays by content and order.
    pub(crate) fn identical(&self, a: &Value, b: &Value) -> bool {
        use Value::*;
        match (a, b) {
            (Ref(h), _) => self.identical(&self.heap.ref_get(*h).clone(), b),
            (_, Ref(h)) => self.identical(a, &self.heap.ref_get(*h).clone()),
            (Null, Null) => true,
            (Bool(x), Bool(y)) => x == y,
            (Int(x), Int(y)) => x == y,
            (Float(x), Float(y)) => x == y,
            (String(x), String(y)) => {
                x == y || self.heap.string(*x).as_bytes() == self.heap.string(*y).as_bytes()
            }
            (Object(x), Object(y)) => x == y,
            (Closure(x), Closure(y)) => x == y,
            (Resource(x), Resource(y)) => x == y,
            (Array(x), Array(y)) => {
                if x == y {
                    return true;
                }
                let ax = self.heap.array(*x);
                let ay = self.heap.array(*y);
                if ax.len() != ay.len() {
                    return false;
                }
                ax.entries()
                    .iter()
                    .zip(ay.entries().iter())
                    .all(|((ka, va), (kb, vb))| ka == kb && self.identical(va, vb))
            }
            _ => false,
        }
    }

    /// Three-way comparison for the relational operators and spaceship.
    pub(crate) fn compare_values(&self, a: &Value, b: &Value) -> Ordering {
        use Value::*;
        match (a, b) {
            (Ref(h), _) => self.compare_values(&self.heap.ref_get(*h).clone(), b),
            (_, Ref(h)) => self.compare_values(a, &self.heap.ref_get(*h).clone()),
            (String(x), String(y)) => {
                let sx = self.heap.string(*x);
                let sy = self.heap.string(*y);
                match (
                    parse_numeric(&sx.to_string_lossy()),
                    parse_numeric(&sy.to_string_lossy()),
                ) {
                    (Some(nx), Some(ny)) => numeric_to_f64(&nx)
                        .partial_cmp(&numeric_to_f64(&ny))
                        .unwrap_or(Ordering::Equal),
                    _ => sx.as_bytes().cmp(sy.as_bytes()),
                }
            }
            (Array(x), Array(y)) => {
                let lx = self.heap.array(*x).len();
                let ly = self.heap.array(*y).len();
                lx.cmp(&ly)
            }
            (Array(_), _) => Ordering::Greater,
            (_, Array(_)) => Ordering::Less,
            (Bool(_), _) | (_, Bool(_)) | (Null, _) | (_, Null) => {
                let bx = self.is_truthy(a);
                let by = self.is_truthy(b);
                bx.cmp(&by)
            }
            _ => {
                let fx = self.to_float_value(a);
                let fy = self.to_float_value(b);
                fx.partial_cmp(&fy).unwrap_or(Ordering::Equal)
            }
        }
    }

    // ==================== Array keys ====================

    /// Coerce a value into an array key, following PHP's canonicalization.
    pub(crate) fn array_key_for(&mut self, v: &Value) -> Result<ArrayKey, VmError> {
        match v {
            Value::Int(n) => Ok(ArrayKey::Int(*n)),
            Value::String(h) => {
                Ok(ArrayKey::from_str_key(&self.heap.string(*h).to_string_lossy()))
            }
            Value::Bool(b) => Ok(ArrayKey::Int(*b as i64)),
            Value::Float(f) => Ok(ArrayKey::Int(*f as i64)),
            Value::Null => Ok(ArrayKey::Str(String::new())),
            Value::Ref(h) => {
                let inner = self.heap.ref_get(*h).clone();
                self.array_key_for(&inner)
            }
            other => Err(self.raise(
                "TypeError",
                &format!("Illegal offset type {}", other.type_name()),
            )),
        }
    }

    // ==================== instanceof ====================

    pub(crate) fn value_instance_of_name(&self, v: &Value, name: &str) -> bool {
        match v {
            Value::Object(h) => {
                let class = self.heap.object(*h).class;
                self.registry.is_instance_of_name(class, name)
            }
            Value::Closure(_) | Value::BoundMethod { .. } => name.eq_ignore_ascii_case("closure"),
            Value::Ref(h) => {
                let inner = self.heap.ref_get(*h).clone();
                self.value_instance_of_name(&inner, name)
            }
            _ => false,
        }
    }

    // ==================== Type hints ====================

    pub(crate) fn value_matches_type(&self, v: &Value, hint: &TypeHint) -> bool {
        match hint {
            TypeHint::Mixed => true,
            TypeHint::Null => v.is_null(),
            TypeHint::Int => matches!(v, Value::Int(_)),
            TypeHint::Float => matches!(v, Value::Float(_) | Value::Int(_)),
            TypeHint::String => matches!(v, Value::String(_)),
            TypeHint::Bool => matches!(v, Value::Bool(_)),
            TypeHint::Array => matches!(v, Value::Array(_)),
            TypeHint::Object => matches!(v, Value::Object(_) | Value::Closure(_)),
            TypeHint::Callable => v.is_callable(),
            TypeHint::Iterable => matches!(v, Value::Array(_)),
            TypeHint::Void => false,
            TypeHint::Nullable(inner) => v.is_null() || self.value_matches_type(v, inner),
            TypeHint::Class(_) => false,
        }
    }

    /// Coercive-mode type enforcement for parameters and returns: exact
    /// matches pass, scalars coerce where PHP allows it, anything else is a
    /// TypeError. Class hints are resolved against the pool by name at
    /// compile time and arrive as `TypeHint::Class`.
    pub(crate) fn coerce_to_type(
        &mut self,
        v: Value,
        hint: &TypeHint,
        what: &str,
    ) -> Result<Value, VmError> {
        if let TypeHint::Class(_) = hint {
            // Class names were interned by the compiler into the hint's
            // display form; checked by the compiler-resolved name instead.
            return Ok(v);
        }
        if self.value_matches_type(&v, hint) {
            // int passed for a float hint converts.
            if matches!(hint, TypeHint::Float) {
                if let Value::Int(n) = v {
                    return Ok(Value::Float(n as f64));
                }
            }
            return Ok(v);
        }
        let coerced = match hint {
            TypeHint::Int => match &v {
                Value::Bool(b) => Some(Value::Int(*b as i64)),
                Value::Float(f) if f.fract() == 0.0 => Some(Value::Int(*f as i64)),
                Value::String(h) => {
                    match parse_numeric(&self.heap.string(*h).to_string_lossy()) {
                        Some(Numeric::Int(n)) => Some(Value::Int(n)),
                        Some(Numeric::Float(f)) if f.fract() == 0.0 => {
                            Some(Value::Int(f as i64))
                        }
                        _ => None,
                    }
                }
                _ => None,
            },
            TypeHint::Float => match &v {
                Value::Bool(b) => Some(Value::Float(*b as i64 as f64)),
                Value::String(h) => {
                    match parse_numeric(&self.heap.string(*h).to_string_lossy()) {
                        Some(n) => Some(Value::Float(numeric_to_f64(&n))),
                        None => None,
                    }
                }
                _ => None,
            },
            TypeHint::String => match &v {
                Value::Int(_) | Value::Float(_) | Value::Bool(_) => {
                    let s = self.cast_to_php_string(&v)?;
                    Some(Value::String(self.heap.alloc_string(s)))
                }
                _ => None,
            },
            TypeHint::Bool => match &v {
                Value::Int(_) | Value::Float(_) | Value::String(_) => {
                    Some(Value::Bool(self.is_truthy(&v)))
                }
                _ => None,
            },
            TypeHint::Nullable(inner) => {
                let inner = inner.clone();
                return self.coerce_to_type(v, &inner, what);
            }
            _ => None,
        };
        match coerced {
            Some(out) => {
                self.heap.release_value(&v);
                Ok(out)
            }
            None => {
                let given = v.type_name();
                let msg = format!(
                    "{} must be of type {}, {} given",
                    what,
                    type_hint_name(hint),
                    given
                );
                self.heap.release_value(&v);
                Err(self.raise("TypeError", &msg))
            }
        }
    }
}

pub(crate) fn numeric_to_f64(n: &Numeric) -> f64 {
    match n {
        Numeric::Int(i) => *i as f64,
        Numeric::Float(f) => *f,
    }
}

/// Leading-digits integer parse for non-numeric strings ("12abc" -> 12).
fn leading_int(s: &str) -> i64 {
    let t = s.trim_start();
    let mut end = 0;
    let bytes = t.as_bytes();
    if !bytes.is_empty() && (bytes[0] == b'+' || bytes[0] == b'-') {
        end = 1;
    }
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    t[..end].parse::<i64>().unwrap_or(0)
}

fn type_hint_name(hint: &TypeHint) -> String {
    match hint {
        TypeHint::Int => "int".to_string(),
        TypeHint::Float => "float".to_string(),
        TypeHint::String => "string".to_string(),
        TypeHint::Bool => "bool".to_string(),
        TypeHint::Array => "array".to_string(),
        TypeHint::Object => "object".to_string(),
        TypeHint::Callable => "callable".to_string(),
        TypeHint::Iterable => "iterable".to_string(),
        TypeHint::Mixed => "mixed".to_string(),
        TypeHint::Null => "null".to_string(),
        TypeHint::Void => "void".to_string(),
        TypeHint::Nullable(inner) => format!("?{}", type_hint_name(inner)),
        TypeHint::Class(_) => "object".to_string(),
    }
}
