//! Closure instances.

use super::value::Value;
use crate::heap::Handle;
use crate::vm::class::ClassId;
use crate::vm::opcode::UserFunction;
use std::sync::Arc;

/// A closure: a compiled prototype plus its captured environment.
///
/// Captures are positional, aligned with the prototype's declared capture
/// list; by-reference captures hold a `Value::Ref` cell shared with the
/// capturing scope.
#[derive(Debug)]
pub struct PhpClosure {
    pub func: Arc<UserFunction>,
    pub captured: Vec<Value>,
    pub this: Option<Handle>,
    pub scope: Option<ClassId>,
}
