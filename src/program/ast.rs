// Program model definitions for the simulator

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an allocation site (a declaration, parameter, named result, or `new`)
pub type SiteId = String;

/// Name of the root frame holding process-wide slots
pub const GLOBALS_FRAME: &str = "<globals>";

/// Position of a statement inside the program, used for panic and trace reporting
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub function: String,
    pub statement: usize, // Index into the function body (or the globals list)
}

impl Location {
    pub fn new(function: impl Into<String>, statement: usize) -> Self {
        Self {
            function: function.into(),
            statement,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.function, self.statement)
    }
}

/// Declared kind of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VarKind {
    #[default]
    Value,
    Pointer,
    ReferenceHeader,
    KeyValueHeader,
    InterfaceBox,
}

impl VarKind {
    pub fn name(self) -> &'static str {
        match self {
            VarKind::Value => "value",
            VarKind::Pointer => "pointer",
            VarKind::ReferenceHeader => "reference_header",
            VarKind::KeyValueHeader => "key_value_header",
            VarKind::InterfaceBox => "interface_box",
        }
    }
}

/// Primitive literal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Primitive {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

/// Variable declaration (local or global)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarDecl {
    pub name: String,
    #[serde(default)]
    pub kind: VarKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<SiteId>, // Overrides the default "<function>.<name>" id
}

impl VarDecl {
    pub fn new(name: impl Into<String>, kind: VarKind, init: Option<Expr>) -> Self {
        VarDecl {
            name: name.into(),
            kind,
            init,
            site: None,
        }
    }

    pub fn with_site(mut self, site: impl Into<SiteId>) -> Self {
        self.site = Some(site.into());
        self
    }

    /// Allocation site id of this declaration inside `function`
    pub fn site_id(&self, function: &str) -> SiteId {
        self.site
            .clone()
            .unwrap_or_else(|| default_site(function, &self.name))
    }
}

/// Default site id for a named slot
pub fn default_site(function: &str, name: &str) -> SiteId {
    format!("{}.{}", function, name)
}

/// Function parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default)]
    pub kind: VarKind,
}

impl Param {
    pub fn new(name: impl Into<String>, kind: VarKind) -> Self {
        Param {
            name: name.into(),
            kind,
        }
    }
}

/// Result declaration; a named result gets its own slot in the frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: VarKind,
}

/// Function definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultDecl>,
    #[serde(default)]
    pub body: Vec<Stmt>,
}

impl FunctionDef {
    pub fn new(name: impl Into<String>, params: Vec<Param>, body: Vec<Stmt>) -> Self {
        FunctionDef {
            name: name.into(),
            params,
            result: None,
            body,
        }
    }

    pub fn with_result(mut self, name: Option<&str>, kind: VarKind) -> Self {
        self.result = Some(ResultDecl {
            name: name.map(str::to_string),
            kind,
        });
        self
    }

    /// Name of the named result slot, if any
    pub fn named_result(&self) -> Option<&str> {
        self.result.as_ref().and_then(|r| r.name.as_deref())
    }
}

/// Call expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub callee: String,
    #[serde(default)]
    pub args: Vec<Expr>,
}

/// Field initializer inside a composite literal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInit {
    pub name: String,
    pub value: Expr,
}

/// Entry inside a map literal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEntry {
    pub key: Expr,
    pub value: Expr,
}

/// Assignable location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "place", rename_all = "snake_case")]
pub enum Place {
    Var { name: String },
    Field { base: Box<Place>, field: String }, // Auto-dereferences a pointer base
    Deref { pointer: Box<Expr> },
}

impl Place {
    pub fn var(name: impl Into<String>) -> Self {
        Place::Var { name: name.into() }
    }

    pub fn field(base: Place, field: impl Into<String>) -> Self {
        Place::Field {
            base: Box::new(base),
            field: field.into(),
        }
    }

    pub fn deref(pointer: Expr) -> Self {
        Place::Deref {
            pointer: Box::new(pointer),
        }
    }

    /// Variable at the root of this place, unless it goes through a dereference
    pub fn root_var(&self) -> Option<&str> {
        match self {
            Place::Var { name } => Some(name),
            Place::Field { base, .. } => base.root_var(),
            Place::Deref { .. } => None,
        }
    }
}

/// Expressions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "expr", rename_all = "snake_case")]
pub enum Expr {
    Lit {
        value: Primitive,
    },
    Nil,
    Var {
        name: String,
    },
    Field {
        base: Box<Expr>,
        field: String,
    },
    Deref {
        pointer: Box<Expr>,
    },
    AddrOf {
        place: Place,
    },
    New {
        init: Box<Expr>,
        site: SiteId,
    },
    Composite {
        type_name: String,
        #[serde(default)]
        fields: Vec<FieldInit>,
    },
    SliceLit {
        #[serde(default)]
        elems: Vec<Expr>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capacity: Option<usize>,
    },
    MakeSlice {
        len: usize,
        cap: usize,
        zero: Box<Expr>,
    },
    MapLit {
        #[serde(default)]
        entries: Vec<MapEntry>,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Lookup {
        base: Box<Expr>,
        key: Box<Expr>,
        default: Box<Expr>,
    },
    Len {
        base: Box<Expr>,
    },
    Cap {
        base: Box<Expr>,
    },
    Reslice {
        base: Box<Expr>,
        low: usize,
        high: usize,
    },
    #[serde(rename = "box")]
    Boxed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        type_tag: Option<String>,
        value: Box<Expr>,
    },
    IsNil {
        value: Box<Expr>,
    },
    Call(Call),
}

impl Expr {
    pub fn int(n: i64) -> Self {
        Expr::Lit {
            value: Primitive::Int(n),
        }
    }

    pub fn boolean(b: bool) -> Self {
        Expr::Lit {
            value: Primitive::Bool(b),
        }
    }

    pub fn string(s: impl Into<String>) -> Self {
        Expr::Lit {
            value: Primitive::String(s.into()),
        }
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var { name: name.into() }
    }

    pub fn field(base: Expr, field: impl Into<String>) -> Self {
        Expr::Field {
            base: Box::new(base),
            field: field.into(),
        }
    }

    pub fn deref(pointer: Expr) -> Self {
        Expr::Deref {
            pointer: Box::new(pointer),
        }
    }

    pub fn addr_of(name: impl Into<String>) -> Self {
        Expr::AddrOf {
            place: Place::var(name),
        }
    }

    pub fn new_slot(init: Expr, site: impl Into<SiteId>) -> Self {
        Expr::New {
            init: Box::new(init),
            site: site.into(),
        }
    }

    pub fn composite(type_name: impl Into<String>, fields: Vec<(&str, Expr)>) -> Self {
        Expr::Composite {
            type_name: type_name.into(),
            fields: fields
                .into_iter()
                .map(|(name, value)| FieldInit {
                    name: name.to_string(),
                    value,
                })
                .collect(),
        }
    }

    pub fn slice(elems: Vec<Expr>, capacity: Option<usize>) -> Self {
        Expr::SliceLit { elems, capacity }
    }

    pub fn index(base: Expr, index: Expr) -> Self {
        Expr::Index {
            base: Box::new(base),
            index: Box::new(index),
        }
    }

    pub fn len(base: Expr) -> Self {
        Expr::Len {
            base: Box::new(base),
        }
    }

    pub fn reslice(base: Expr, low: usize, high: usize) -> Self {
        Expr::Reslice {
            base: Box::new(base),
            low,
            high,
        }
    }

    pub fn boxed(type_tag: Option<&str>, value: Expr) -> Self {
        Expr::Boxed {
            type_tag: type_tag.map(str::to_string),
            value: Box::new(value),
        }
    }

    pub fn is_nil(value: Expr) -> Self {
        Expr::IsNil {
            value: Box::new(value),
        }
    }

    pub fn call(callee: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call(Call {
            callee: callee.into(),
            args,
        })
    }
}

/// Statements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stmt", rename_all = "snake_case")]
pub enum Stmt {
    Declare(VarDecl),
    Assign {
        target: String,
        value: Expr,
    },
    SetField {
        target: Place,
        field: String,
        value: Expr,
    },
    Store {
        pointer: Expr,
        value: Expr,
    },
    SetIndex {
        target: Place,
        index: Expr,
        value: Expr,
    },
    SetKey {
        target: Place,
        key: Expr,
        value: Expr,
    },
    Append {
        target: Place,
        values: Vec<Expr>,
    },
    Call(Call),
    Return {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Expr>,
    },
}

impl Stmt {
    pub fn declare(name: &str, kind: VarKind, init: Expr) -> Self {
        Stmt::Declare(VarDecl::new(name, kind, Some(init)))
    }

    pub fn assign(target: &str, value: Expr) -> Self {
        Stmt::Assign {
            target: target.to_string(),
            value,
        }
    }

    pub fn set_field(target: Place, field: &str, value: Expr) -> Self {
        Stmt::SetField {
            target,
            field: field.to_string(),
            value,
        }
    }

    pub fn store(pointer: Expr, value: Expr) -> Self {
        Stmt::Store { pointer, value }
    }

    pub fn call(callee: &str, args: Vec<Expr>) -> Self {
        Stmt::Call(Call {
            callee: callee.to_string(),
            args,
        })
    }

    pub fn ret(value: Option<Expr>) -> Self {
        Stmt::Return { value }
    }
}

/// Top-level program structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub globals: Vec<VarDecl>, // Slots of the root frame, initialized once in order
    #[serde(default)]
    pub functions: Vec<FunctionDef>,
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }

    pub fn with_global(mut self, decl: VarDecl) -> Self {
        self.globals.push(decl);
        self
    }

    pub fn with_function(mut self, function: FunctionDef) -> Self {
        self.functions.push(function);
        self
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.iter().find(|f| f.name == name)
    }
}
