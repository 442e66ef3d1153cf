//! Built-in functions.
//!
//! Only a small core set lives here; the full standard-library surface is
//! host territory. Each builtin is declared in the static table with its
//! arity; the generator resolves known names to `call_builtin` ids at
//! compile time, and the VM validates arity before dispatch. Handlers
//! receive arguments by value (shared via their boxes), may retain what
//! they keep, and return a value or raise.

use crate::errors::VmError;
use crate::runtime::{ArrayKey, PhpArray, PhpString, Value};
use crate::vm::Vm;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::io::Write;

#[derive(Debug)]
pub struct BuiltinDef {
    pub id: u16,
    pub name: &'static str,
    pub min_arity: u8,
    pub max_arity: u8,
}

pub static BUILTINS: &[BuiltinDef] = &[
    BuiltinDef { id: 0, name: "strlen", min_arity: 1, max_arity: 1 },
    BuiltinDef { id: 1, name: "count", min_arity: 1, max_arity: 1 },
    BuiltinDef { id: 2, name: "intdiv", min_arity: 2, max_arity: 2 },
    BuiltinDef { id: 3, name: "abs", min_arity: 1, max_arity: 1 },
    BuiltinDef { id: 4, name: "is_numeric", min_arity: 1, max_arity: 1 },
    BuiltinDef { id: 5, name: "var_dump", min_arity: 1, max_arity: 16 },
    BuiltinDef { id: 6, name: "json_encode", min_arity: 1, max_arity: 1 },
    BuiltinDef { id: 7, name: "json_decode", min_arity: 1, max_arity: 2 },
    BuiltinDef { id: 8, name: "gc_collect_cycles", min_arity: 0, max_arity: 0 },
    BuiltinDef { id: 9, name: "spl_object_id", min_arity: 1, max_arity: 1 },
    BuiltinDef { id: 10, name: "get_class", min_arity: 1, max_arity: 1 },
];

lazy_static! {
    static ref BUILTIN_IDS: HashMap<&'static str, u16> =
        BUILTINS.iter().map(|d| (d.name, d.id)).collect();
}

/// Look a builtin up by (lowercased) name.
pub fn lookup(name: &str) -> Option<&'static BuiltinDef> {
    BUILTIN_IDS.get(name).map(|&id| &BUILTINS[id as usize])
}

pub fn def(id: u16) -> &'static BuiltinDef {
    &BUILTINS[id as usize]
}

pub fn dispatch<W: Write>(vm: &mut Vm<W>, id: u16, args: &[Value]) -> Result<Value, VmError> {
    match id {
        0 => strlen(vm, args),
        1 => count(vm, args),
        2 => intdiv(vm, args),
        3 => abs(vm, args),
        4 => is_numeric(vm, args),
        5 => var_dump(vm, args),
        6 => json_encode(vm, args),
        7 => json_decode(vm, args),
        8 => gc_collect_cycles(vm, args),
        9 => spl_object_id(vm, args),
        10 => get_class(vm, args),
        _ => Err(VmError::Fatal(crate::errors::FatalError::CorruptedBytecode(
            format!("unknown builtin id {}", id),
        ))),
    }
}

// ==================== Handlers ====================

fn strlen<W: Write>(vm: &mut Vm<W>, args: &[Value]) -> Result<Value, VmError> {
    let s = vm.cast_to_php_string(&args[0])?;
    Ok(Value::Int(s.len() as i64))
}

fn count<W: Write>(vm: &mut Vm<W>, args: &[Value]) -> Result<Value, VmError> {
    match &args[0] {
        Value::Array(h) => Ok(Value::Int(vm.heap.array(*h).len() as i64)),
        other => Err(vm.raise(
            "TypeError",
            &format!(
                "count(): Argument #1 ($value) must be of type Countable|array, {} given",
                other.type_name()
            ),
        )),
    }
}

fn intdiv<W: Write>(vm: &mut Vm<W>, args: &[Value]) -> Result<Value, VmError> {
    let a = vm.to_int_value(&args[0]);
    let b = vm.to_int_value(&args[1]);
    if b == 0 {
        return Err(vm.raise("DivisionByZeroError", "Division by zero"));
    }
    if a == i64::MIN && b == -1 {
        return Err(vm.raise(
            "ArithmeticError",
            "Division of PHP_INT_MIN by -1 is not an integer",
        ));
    }
    Ok(Value::Int(a / b))
}

fn abs<W: Write>(vm: &mut Vm<W>, args: &[Value]) -> Result<Value, VmError> {
    match &args[0] {
        Value::Int(n) => Ok(match n.checked_abs() {
            Some(m) => Value::Int(m),
            None => Value::Float((*n as f64).abs()),
        }),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => {
            let f = vm.to_float_value(other);
            Ok(Value::Float(f.abs()))
        }
    }
}

fn is_numeric<W: Write>(vm: &mut Vm<W>, args: &[Value]) -> Result<Value, VmError> {
    let result = match &args[0] {
        Value::Int(_) | Value::Float(_) => true,
        Value::String(h) => {
            let s = vm.heap.string(*h).to_string_lossy();
            crate::vm::values::parse_numeric(&s).is_some()
        }
        _ => false,
    };
    Ok(Value::Bool(result))
}

fn var_dump<W: Write>(vm: &mut Vm<W>, args: &[Value]) -> Result<Value, VmError> {
    let mut out = String::new();
    for arg in args {
        dump_value(vm, arg, 0, &mut out);
    }
    vm.write_output(out.as_bytes())?;
    Ok(Value::Null)
}

fn dump_value<W: Write>(vm: &Vm<W>, v: &Value, depth: usize, out: &mut String) {
    let pad = "  ".repeat(depth);
    match v {
        Value::Null => out.push_str(&format!("{}NULL\n", pad)),
        Value::Bool(b) => out.push_str(&format!("{}bool({})\n", pad, b)),
        Value::Int(n) => out.push_str(&format!("{}int({})\n", pad, n)),
        Value::Float(f) => out.push_str(&format!(
            "{}float({})\n",
            pad,
            crate::vm::values::php_float_repr(*f)
        )),
        Value::String(h) => {
            let s = vm.heap.string(*h);
            out.push_str(&format!(
                "{}string({}) \"{}\"\n",
                pad,
                s.len(),
                s.to_string_lossy()
            ));
        }
        Value::Array(h) => {
            let arr = vm.heap.array(*h);
            out.push_str(&format!("{}array({}) {{\n", pad, arr.len()));
            for (k, value) in arr.entries() {
                match k {
                    ArrayKey::Int(n) => out.push_str(&format!("{}  [{}]=>\n", pad, n)),
                    ArrayKey::Str(s) => out.push_str(&format!("{}  [\"{}\"]=>\n", pad, s)),
                }
                dump_value(vm, value, depth + 1, out);
            }
            out.push_str(&format!("{}}}\n", pad));
        }
        Value::Object(h) => {
            let obj = vm.heap.object(*h);
            let class = vm.registry.class(obj.class);
            let shape = vm.registry.shape(obj.shape);
            out.push_str(&format!(
                "{}object({})#{} ({}) {{\n",
                pad,
                class.name,
                h.index(),
                obj.slots.len()
            ));
            for (name, value) in shape.slots.iter().zip(obj.slots.iter()) {
                out.push_str(&format!("{}  [\"{}\"]=>\n", pad, name));
                dump_value(vm, value, depth + 1, out);
            }
            out.push_str(&format!("{}}}\n", pad));
        }
        Value::Closure(_) | Value::BoundMethod { .. } | Value::Function(_)
        | Value::Builtin(_) => out.push_str(&format!("{}object(Closure)#0 (0) {{\n{}}}\n", pad, pad)),
        Value::Resource(h) => {
            out.push_str(&format!("{}resource({})\n", pad, vm.heap.resource(*h).id))
        }
        Value::Ref(h) => dump_value(vm, &vm.heap.ref_get(*h).clone(), depth, out),
    }
}

fn gc_collect_cycles<W: Write>(vm: &mut Vm<W>, _args: &[Value]) -> Result<Value, VmError> {
    let freed = vm.run_cycle_collection();
    Ok(Value::Int(freed as i64))
}

fn spl_object_id<W: Write>(vm: &mut Vm<W>, args: &[Value]) -> Result<Value, VmError> {
    match &args[0] {
        Value::Object(h) | Value::Closure(h) => Ok(Value::Int(h.index() as i64)),
        other => Err(vm.raise(
            "TypeError",
            &format!(
                "spl_object_id(): Argument #1 ($object) must be of type object, {} given",
                other.type_name()
            ),
        )),
    }
}

fn get_class<W: Write>(vm: &mut Vm<W>, args: &[Value]) -> Result<Value, VmError> {
    match &args[0] {
        Value::Object(h) => {
            let class = vm.heap.object(*h).class;
            let name = vm.registry.class(class).name.clone();
            Ok(Value::String(vm.heap.alloc_string(name.into())))
        }
        Value::Closure(_) => Ok(Value::String(vm.heap.alloc_string("Closure".into()))),
        other => Err(vm.raise(
            "TypeError",
            &format!(
                "get_class(): Argument #1 ($object) must be of type object, {} given",
                other.type_name()
            ),
        )),
    }
}

// ==================== JSON ====================

fn json_encode<W: Write>(vm: &mut Vm<W>, args: &[Value]) -> Result<Value, VmError> {
    let mut out = String::new();
    encode_json(vm, &args[0], &mut out)?;
    Ok(Value::String(vm.heap.alloc_string(out.into())))
}

fn encode_json<W: Write>(vm: &mut Vm<W>, v: &Value, out: &mut String) -> Result<(), VmError> {
    match v {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(n) => out.push_str(&n.to_string()),
        Value::Float(f) => {
            if f.is_finite() {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    out.push_str(&format!("{:.1}", f));
                } else {
                    out.push_str(&f.to_string());
                }
            } else {
                return Err(vm.raise(
                    "ValueError",
                    "Inf and NaN cannot be JSON encoded",
                ));
            }
        }
        Value::String(h) => {
            let s = vm.heap.string(*h).to_string_lossy();
            encode_json_string(&s, out);
        }
        Value::Array(h) => {
            let entries: Vec<(ArrayKey, Value)> = vm.heap.array(*h).entries().to_vec();
            let is_list = vm.heap.array(*h).is_list();
            if is_list {
                out.push('[');
                for (i, (_, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    encode_json(vm, value, out)?;
                }
                out.push(']');
            } else {
                out.push('{');
                for (i, (k, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    encode_json_string(&k.to_string(), out);
                    out.push(':');
                    encode_json(vm, value, out)?;
                }
                out.push('}');
            }
        }
        Value::Object(h) => {
            let (shape, slots) = {
                let obj = vm.heap.object(*h);
                (obj.shape, obj.slots.clone())
            };
            let names = vm.registry.shape(shape).slots.clone();
            out.push('{');
            for (i, (name, value)) in names.iter().zip(slots.iter()).enumerate() {
                if i > 0 {
                    out.push(',');
                }
                encode_json_string(name, out);
                out.push(':');
                encode_json(vm, value, out)?;
            }
            out.push('}');
        }
        Value::Ref(h) => {
            let inner = vm.heap.ref_get(*h).clone();
            encode_json(vm, &inner, out)?;
        }
        other => {
            return Err(vm.raise(
                "ValueError",
                &format!("Type {} is not JSON serializable", other.type_name()),
            ))
        }
    }
    Ok(())
}

fn encode_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

/// `json_decode($json, $assoc = false)`: objects decode to `stdClass`
/// instances by default, or to associative arrays when `$assoc` is truthy.
fn json_decode<W: Write>(vm: &mut Vm<W>, args: &[Value]) -> Result<Value, VmError> {
    let Value::String(h) = &args[0] else {
        return Err(vm.raise(
            "TypeError",
            &format!(
                "json_decode(): Argument #1 ($json) must be of type string, {} given",
                args[0].type_name()
            ),
        ));
    };
    let assoc = args.get(1).map(|v| vm.is_truthy(v)).unwrap_or(false);
    let text = vm.heap.string(*h).to_string_lossy();
    let mut p = JsonParser {
        bytes: text.as_bytes(),
        pos: 0,
        assoc,
    };
    p.skip_ws();
    match p.parse(vm) {
        Ok(v) => {
            p.skip_ws();
            if p.pos != p.bytes.len() {
                vm.heap.release_value(&v);
                return Ok(Value::Null);
            }
            Ok(v)
        }
        Err(()) => Ok(Value::Null),
    }
}

struct JsonParser<'a> {
    bytes: &'a [u8],
    pos: usize,
    /// Decode objects to associative arrays instead of `stdClass`.
    assoc: bool,
}

impl<'a> JsonParser<'a> {
    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len()
            && matches!(self.bytes[self.pos], b' ' | b'\t' | b'\n' | b'\r')
        {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn eat(&mut self, b: u8) -> Result<(), ()> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(())
        }
    }

    fn eat_word(&mut self, word: &str) -> Result<(), ()> {
        if self.bytes[self.pos..].starts_with(word.as_bytes()) {
            self.pos += word.len();
            Ok(())
        } else {
            Err(())
        }
    }

    fn parse<W: Write>(&mut self, vm: &mut Vm<W>) -> Result<Value, ()> {
        self.skip_ws();
        match self.peek().ok_or(())? {
            b'n' => {
                self.eat_word("null")?;
                Ok(Value::Null)
            }
            b't' => {
                self.eat_word("true")?;
                Ok(Value::Bool(true))
            }
            b'f' => {
                self.eat_word("false")?;
                Ok(Value::Bool(false))
            }
            b'"' => {
                let s = self.parse_string()?;
                Ok(Value::String(vm.heap.alloc_string(PhpString::from(s))))
            }
            b'[' => {
                self.eat(b'[')?;
                let mut arr = PhpArray::new();
                self.skip_ws();
                if self.peek() == Some(b']') {
                    self.pos += 1;
                } else {
                    loop {
                        let v = self.parse(vm)?;
                        arr.push(v);
                        self.skip_ws();
                        match self.peek() {
                            Some(b',') => {
                                self.pos += 1;
                            }
                            Some(b']') => {
                                self.pos += 1;
                                break;
                            }
                            _ => {
                                release_array(vm, arr);
                                return Err(());
                            }
                        }
                    }
                }
                Ok(Value::Array(vm.heap.alloc_array(arr)))
            }
            b'{' => {
                self.eat(b'{')?;
                if self.assoc {
                    self.parse_object_assoc(vm)
                } else {
                    self.parse_object_std(vm)
                }
            }
            _ => self.parse_number(),
        }
    }

    /// Members of an already-opened `{`, as an associative array.
    fn parse_object_assoc<W: Write>(&mut self, vm: &mut Vm<W>) -> Result<Value, ()> {
        let mut arr = PhpArray::new();
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.pos += 1;
        } else {
            loop {
                self.skip_ws();
                let key = match self.parse_string() {
                    Ok(k) => k,
                    Err(()) => {
                        release_array(vm, arr);
                        return Err(());
                    }
                };
                self.skip_ws();
                if self.eat(b':').is_err() {
                    release_array(vm, arr);
                    return Err(());
                }
                let v = match self.parse(vm) {
                    Ok(v) => v,
                    Err(()) => {
                        release_array(vm, arr);
                        return Err(());
                    }
                };
                if let Some(old) = arr.insert(ArrayKey::from_str_key(&key), v) {
                    vm.heap.release_value(&old);
                }
                self.skip_ws();
                match self.peek() {
                    Some(b',') => {
                        self.pos += 1;
                    }
                    Some(b'}') => {
                        self.pos += 1;
                        break;
                    }
                    _ => {
                        release_array(vm, arr);
                        return Err(());
                    }
                }
            }
        }
        Ok(Value::Array(vm.heap.alloc_array(arr)))
    }

    /// Members of an already-opened `{`, as a `stdClass` instance with one
    /// dynamic property per member.
    fn parse_object_std<W: Write>(&mut self, vm: &mut Vm<W>) -> Result<Value, ()> {
        let oh = crate::vm::ops::casts::new_std_object(vm);
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(Value::Object(oh));
        }
        loop {
            self.skip_ws();
            let key = match self.parse_string() {
                Ok(k) => k,
                Err(()) => {
                    vm.heap.release(oh);
                    return Err(());
                }
            };
            self.skip_ws();
            if self.eat(b':').is_err() {
                vm.heap.release(oh);
                return Err(());
            }
            let v = match self.parse(vm) {
                Ok(v) => v,
                Err(()) => {
                    vm.heap.release(oh);
                    return Err(());
                }
            };
            set_dynamic_prop(vm, oh, &key, v);
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                }
                Some(b'}') => {
                    self.pos += 1;
                    break;
                }
                _ => {
                    vm.heap.release(oh);
                    return Err(());
                }
            }
        }
        Ok(Value::Object(oh))
    }

    fn parse_string(&mut self) -> Result<String, ()> {
        self.eat(b'"')?;
        let mut out = String::new();
        loop {
            match self.peek().ok_or(())? {
                b'"' => {
                    self.pos += 1;
                    return Ok(out);
                }
                b'\\' => {
                    self.pos += 1;
                    match self.peek().ok_or(())? {
                        b'"' => out.push('"'),
                        b'\\' => out.push('\\'),
                        b'/' => out.push('/'),
                        b'n' => out.push('\n'),
                        b'r' => out.push('\r'),
                        b't' => out.push('\t'),
                        b'b' => out.push('\u{8}'),
                        b'f' => out.push('\u{c}'),
                        b'u' => {
                            if self.pos + 4 >= self.bytes.len() {
                                return Err(());
                            }
                            let hex =
                                std::str::from_utf8(&self.bytes[self.pos + 1..self.pos + 5])
                                    .map_err(|_| ())?;
                            let code = u32::from_str_radix(hex, 16).map_err(|_| ())?;
                            out.push(char::from_u32(code).unwrap_or('\u{fffd}'));
                            self.pos += 4;
                        }
                        _ => return Err(()),
                    }
                    self.pos += 1;
                }
                _ => {
                    // Consume one UTF-8 scalar.
                    let rest = std::str::from_utf8(&self.bytes[self.pos..]).map_err(|_| ())?;
                    let c = rest.chars().next().ok_or(())?;
                    out.push(c);
                    self.pos += c.len_utf8();
                }
            }
        }
    }

    fn parse_number(&mut self) -> Result<Value, ()> {
        let start = self.pos;
        while self
            .peek()
            .map(|b| b.is_ascii_digit() || matches!(b, b'-' | b'+' | b'.' | b'e' | b'E'))
            .unwrap_or(false)
        {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).map_err(|_| ())?;
        if text.is_empty() {
            return Err(());
        }
        if !text.contains(['.', 'e', 'E']) {
            if let Ok(n) = text.parse::<i64>() {
                return Ok(Value::Int(n));
            }
        }
        text.parse::<f64>().map(Value::Float).map_err(|_| ())
    }
}

fn release_array<W: Write>(vm: &mut Vm<W>, arr: PhpArray) {
    for (_, v) in arr.entries() {
        vm.heap.release_value(v);
    }
}

/// Write one decoded member onto a `stdClass` box, transitioning its shape
/// for a new name and overwriting the slot when a duplicate key repeats.
fn set_dynamic_prop<W: Write>(
    vm: &mut Vm<W>,
    oh: crate::heap::Handle,
    name: &str,
    v: Value,
) {
    let shape = vm.heap.object(oh).shape;
    if let Some(off) = vm.registry.shape(shape).offset_of(name) {
        let old = std::mem::replace(&mut vm.heap.object_mut(oh).slots[off as usize], v);
        vm.heap.release_value(&old);
        return;
    }
    let (next, off) = vm.registry.transition(shape, name);
    let obj = vm.heap.object_mut(oh);
    obj.shape = next;
    debug_assert_eq!(off as usize, obj.slots.len());
    obj.slots.push(v);
}
