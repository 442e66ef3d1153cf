//! Class, interface, trait, and enum declaration compilation.

use super::functions::lit_const;
use crate::ast::{
    ClassDecl, EnumBacking, EnumDecl, InterfaceDecl, MethodDecl, PropertyDecl, TraitDecl,
};
use crate::errors::CompileError;
use crate::vm::class::{ClassDef, ClassKind, MethodDef, PropertyDef};
use crate::vm::compiler::{Compiler, Scope};
use crate::vm::opcode::{Constant, Op};
use std::sync::Arc;

impl<'a> Compiler<'a> {
    pub(crate) fn compile_class_decl(&mut self, decl: &ClassDecl) -> Result<(), CompileError> {
        let name = self.name(decl.name).to_string();
        let mut def = ClassDef::new(name.clone(), ClassKind::Class);
        def.parent = decl.parent.map(|p| self.name(p).to_string());
        def.interfaces = decl
            .interfaces
            .iter()
            .map(|i| self.name(*i).to_string())
            .collect();
        def.traits = decl
            .traits
            .iter()
            .map(|t| self.name(*t).to_string())
            .collect();
        def.is_abstract = decl.is_abstract;
        def.is_final = decl.is_final;
        def.attributes = decl
            .attributes
            .iter()
            .map(|a| self.name(a.name).to_string())
            .collect();

        for (const_name, value) in &decl.constants {
            let const_name = self.name(*const_name).to_string();
            let value = lit_const(self, value).ok_or(CompileError::NonLiteralConstant)?;
            def.constants.push((const_name, value));
        }
        for prop in &decl.properties {
            def.properties.push(self.compile_property(prop)?);
        }
        for method in &decl.methods {
            def.methods.push(self.compile_method(&name, method)?);
            // Promoted constructor parameters declare matching properties.
            if self.name(method.name) == "__construct" {
                for param in &method.params {
                    if let Some(visibility) = param.promoted {
                        def.properties.push(PropertyDef {
                            name: self.var_name(param.name).to_string(),
                            visibility,
                            is_static: false,
                            readonly: false,
                            type_hint: param.type_hint.clone(),
                            default: Some(Constant::Null),
                        });
                    }
                }
            }
        }

        self.declare_unit_class(def)
    }

    pub(crate) fn compile_interface_decl(
        &mut self,
        decl: &InterfaceDecl,
    ) -> Result<(), CompileError> {
        let name = self.name(decl.name).to_string();
        let mut def = ClassDef::new(name, ClassKind::Interface);
        def.interfaces = decl
            .parents
            .iter()
            .map(|p| self.name(*p).to_string())
            .collect();
        def.attributes = decl
            .attributes
            .iter()
            .map(|a| self.name(a.name).to_string())
            .collect();
        for (const_name, value) in &decl.constants {
            let const_name = self.name(*const_name).to_string();
            let value = lit_const(self, value).ok_or(CompileError::NonLiteralConstant)?;
            def.constants.push((const_name, value));
        }
        self.declare_unit_class(def)
    }

    pub(crate) fn compile_trait_decl(&mut self, decl: &TraitDecl) -> Result<(), CompileError> {
        let name = self.name(decl.name).to_string();
        let mut def = ClassDef::new(name.clone(), ClassKind::Trait);
        def.attributes = decl
            .attributes
            .iter()
            .map(|a| self.name(a.name).to_string())
            .collect();
        for prop in &decl.properties {
            def.properties.push(self.compile_property(prop)?);
        }
        for method in &decl.methods {
            def.methods.push(self.compile_method(&name, method)?);
        }
        self.declare_unit_class(def)
    }

    pub(crate) fn compile_enum_decl(&mut self, decl: &EnumDecl) -> Result<(), CompileError> {
        let name = self.name(decl.name).to_string();
        let mut def = ClassDef::new(name.clone(), ClassKind::Enum(decl.backing));
        def.interfaces = decl
            .interfaces
            .iter()
            .map(|i| self.name(*i).to_string())
            .collect();
        def.attributes = decl
            .attributes
            .iter()
            .map(|a| self.name(a.name).to_string())
            .collect();
        for case in &decl.cases {
            let case_name = self.name(case.name).to_string();
            let value = match (&case.value, decl.backing) {
                (Some(e), EnumBacking::Int | EnumBacking::String) => {
                    Some(lit_const(self, e).ok_or(CompileError::NonLiteralEnumCase)?)
                }
                (Some(_), EnumBacking::None) => {
                    return Err(CompileError::NonLiteralEnumCase);
                }
                (None, _) => None,
            };
            def.enum_cases.push((case_name, value));
        }
        for method in &decl.methods {
            def.methods.push(self.compile_method(&name, method)?);
        }
        self.declare_unit_class(def)
    }

    // ==================== Members ====================

    fn compile_property(&mut self, prop: &PropertyDecl) -> Result<PropertyDef, CompileError> {
        let default = match &prop.default {
            Some(e) => Some(lit_const(self, e).ok_or(CompileError::NonLiteralConstant)?),
            None => None,
        };
        Ok(PropertyDef {
            name: self.var_name(prop.name).to_string(),
            visibility: prop.visibility,
            is_static: prop.is_static,
            readonly: prop.readonly,
            type_hint: prop.type_hint.clone(),
            default,
        })
    }

    fn compile_method(
        &mut self,
        class: &str,
        method: &MethodDecl,
    ) -> Result<MethodDef, CompileError> {
        let method_name = self.name(method.name).to_string();
        let scope = Scope::Method {
            class: class.to_string(),
            is_static: method.is_static,
        };
        let body: &[crate::ast::Stmt] = match &method.body {
            Some(b) => b,
            None => &[],
        };
        let func = self.compile_function_parts(
            method_name,
            &method.params,
            &method.return_type,
            body,
            scope,
            &[],
            Some(class.to_string()),
            &method.attributes,
        )?;
        Ok(MethodDef {
            func: Arc::new(func),
            visibility: method.visibility,
            is_static: method.is_static,
            is_abstract: method.is_abstract,
            is_final: method.is_final,
        })
    }

    fn declare_unit_class(&mut self, def: ClassDef) -> Result<(), CompileError> {
        if self
            .classes
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(&def.name))
        {
            return Err(CompileError::DuplicateDeclaration(def.name));
        }
        let idx = self.classes.len() as u16;
        self.classes.push(def);
        self.emit_a(Op::DeclareClass, idx);
        Ok(())
    }
}
