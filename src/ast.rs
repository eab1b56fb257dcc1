// File: src/ast.rs
//
// Abstract syntax tree consumed by the bytecode compiler.
// Every node carries its source line; payloads are reached by matching on
// the kind tag.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Is,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    /// `#e`, compiled to a `__len__()` invocation.
    Len,
    /// `##e`, compiled to a `__string__()` invocation.
    Stringify,
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub line: u32,
    pub kind: ExprKind,
}

impl Expr {
    pub fn new(line: u32, kind: ExprKind) -> Self {
        Self { line, kind }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Num(f64),
    /// Raw string contents; escape sequences are decoded by the compiler.
    Str(String),
    True,
    False,
    Null,
    Var(String),
    This,
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        /// The trailing argument is an `...expr` spread.
        unpack_last: bool,
    },
    Invoke {
        object: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        unpack_last: bool,
    },
    /// `super(...)`, `super.m(...)` or the bare bound form `super.m`.
    Super {
        /// None resolves to the enclosing method's own name.
        name: Option<String>,
        args: Vec<Expr>,
        unpack_last: bool,
        call: bool,
    },
    Field {
        object: Box<Expr>,
        name: String,
    },
    Subscript {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    ListLit(Vec<Expr>),
    TupleLit(Vec<Expr>),
    TableLit(Vec<(Expr, Expr)>),
    /// Anonymous function literal.
    Fun(Box<FunLit>),
}

/// The shared shape of function bodies: named declarations, methods and
/// anonymous literals.
#[derive(Debug, Clone)]
pub struct FunLit {
    pub line: u32,
    pub params: Vec<String>,
    /// Constant default expressions for the trailing parameters.
    pub defaults: Vec<Expr>,
    /// Name of the vararg collector, when declared as `...rest`.
    pub vararg: Option<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub line: u32,
    pub kind: StmtKind,
}

impl Stmt {
    pub fn new(line: u32, kind: StmtKind) -> Self {
        Self { line, kind }
    }
}

#[derive(Debug, Clone)]
pub struct ExceptClause {
    pub line: u32,
    /// Expression evaluating to the class filter.
    pub class: Expr,
    pub var: Option<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct MethodDecl {
    pub line: u32,
    pub name: String,
    /// None for `native fun` declarations resolved through the registry.
    pub fun: Option<FunLit>,
    pub arity: u8,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Expr(Expr),
    /// `var a = e`, `var a, b = e`, `static var a = e`.
    VarDecl {
        names: Vec<String>,
        init: Option<Expr>,
        is_static: bool,
    },
    FunDecl {
        name: String,
        fun: FunLit,
        is_static: bool,
    },
    NativeDecl {
        name: String,
        arity: u8,
    },
    ClassDecl {
        name: String,
        superclass: Option<Expr>,
        methods: Vec<MethodDecl>,
        is_static: bool,
    },
    Block(Vec<Stmt>),
    If {
        cond: Expr,
        then: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        incr: Option<Box<Stmt>>,
        body: Vec<Stmt>,
    },
    ForEach {
        name: String,
        iterable: Expr,
        body: Vec<Stmt>,
    },
    Return(Option<Expr>),
    Break,
    Continue,
    Raise(Expr),
    Try {
        body: Vec<Stmt>,
        excepts: Vec<ExceptClause>,
        ensure: Option<Vec<Stmt>>,
    },
    With {
        expr: Expr,
        var: String,
        body: Vec<Stmt>,
    },
    Import {
        module: String,
        /// `import m for a, b`
        names: Vec<String>,
        /// `import m as alias`
        alias: Option<String>,
    },
    /// `targets = value` (several targets unpack), possibly compound.
    Assign {
        targets: Vec<Expr>,
        op: Option<BinOp>,
        value: Expr,
    },
}
