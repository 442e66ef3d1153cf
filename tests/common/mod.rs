//! Shared AST construction helpers for the integration tests.
//!
//! The parser is an external collaborator, so tests assemble programs
//! directly against the AST contract.

use phpvm::ast::*;

pub struct AstBuilder {
    pub pool: StringPool,
}

#[allow(dead_code)]
impl AstBuilder {
    pub fn new() -> Self {
        Self {
            pool: StringPool::new(),
        }
    }

    pub fn id(&mut self, s: &str) -> StringId {
        self.pool.intern(s)
    }

    /// Variable id; the `$` sigil is added if missing.
    pub fn vid(&mut self, name: &str) -> StringId {
        if name.starts_with('$') {
            self.pool.intern(name)
        } else {
            let with_sigil = format!("${}", name);
            self.pool.intern(&with_sigil)
        }
    }

    pub fn v(&mut self, name: &str) -> Expr {
        Expr::Variable(self.vid(name))
    }

    pub fn str_lit(&mut self, s: &str) -> Expr {
        Expr::Str(self.pool.intern(s))
    }

    pub fn int(&mut self, n: i64) -> Expr {
        Expr::Int(n)
    }

    pub fn bin(&mut self, op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn assign(&mut self, target: Expr, value: Expr) -> Expr {
        Expr::Assign {
            target: Box::new(target),
            value: Box::new(value),
        }
    }

    pub fn assign_var(&mut self, name: &str, value: Expr) -> Stmt {
        let var = self.v(name);
        Stmt::Expression(self.assign(var, value))
    }

    pub fn call(&mut self, name: &str, args: Vec<Expr>) -> Expr {
        Expr::Call {
            callee: Callee::Name(self.pool.intern(name)),
            args,
        }
    }

    pub fn call_var(&mut self, name: &str, args: Vec<Expr>) -> Expr {
        let callee = self.v(name);
        Expr::Call {
            callee: Callee::Expr(Box::new(callee)),
            args,
        }
    }

    pub fn method_call(&mut self, target: Expr, method: &str, args: Vec<Expr>) -> Expr {
        Expr::MethodCall {
            target: Box::new(target),
            method: self.pool.intern(method),
            args,
            nullsafe: false,
        }
    }

    pub fn prop(&mut self, target: Expr, name: &str) -> Expr {
        Expr::PropertyAccess {
            target: Box::new(target),
            property: self.pool.intern(name),
            nullsafe: false,
        }
    }

    pub fn new_object(&mut self, class: &str, args: Vec<Expr>) -> Expr {
        Expr::New {
            class: self.pool.intern(class),
            args,
        }
    }

    pub fn echo(&mut self, parts: Vec<Expr>) -> Stmt {
        Stmt::Echo(parts)
    }

    pub fn param(&mut self, name: &str) -> Parameter {
        Parameter {
            name: self.vid(name),
            type_hint: None,
            default: None,
            by_ref: false,
            variadic: false,
            promoted: None,
        }
    }

    pub fn param_by_ref(&mut self, name: &str) -> Parameter {
        Parameter {
            by_ref: true,
            ..self.param(name)
        }
    }

    pub fn function(&mut self, name: &str, params: Vec<Parameter>, body: Vec<Stmt>) -> Stmt {
        Stmt::FunctionDecl(FunctionDecl {
            name: self.pool.intern(name),
            params,
            return_type: None,
            body,
            attributes: Vec::new(),
        })
    }

    pub fn method(&mut self, name: &str, params: Vec<Parameter>, body: Vec<Stmt>) -> MethodDecl {
        MethodDecl {
            name: self.pool.intern(name),
            visibility: Visibility::Public,
            is_static: false,
            is_abstract: false,
            is_final: false,
            params,
            return_type: None,
            body: Some(body),
            attributes: Vec::new(),
        }
    }

    pub fn public_prop(&mut self, name: &str, default: Option<Expr>) -> PropertyDecl {
        PropertyDecl {
            name: self.vid(name),
            visibility: Visibility::Public,
            is_static: false,
            readonly: false,
            type_hint: None,
            default,
            attributes: Vec::new(),
        }
    }

    pub fn class(
        &mut self,
        name: &str,
        parent: Option<&str>,
        properties: Vec<PropertyDecl>,
        methods: Vec<MethodDecl>,
    ) -> Stmt {
        Stmt::ClassDecl(ClassDecl {
            name: self.pool.intern(name),
            parent: parent.map(|p| self.pool.intern(p)),
            interfaces: Vec::new(),
            traits: Vec::new(),
            is_abstract: false,
            is_final: false,
            constants: Vec::new(),
            properties,
            methods,
            attributes: Vec::new(),
        })
    }

    pub fn program(self, statements: Vec<Stmt>) -> Program {
        Program {
            pool: self.pool,
            statements,
        }
    }
}

/// Run a program and return its output, panicking on any engine error.
#[allow(dead_code)]
pub fn run_ok(program: &Program) -> String {
    phpvm::run(program).expect("program should run cleanly")
}
