// File: src/parser.rs
//
// Recursive-descent parser for Vesper source.
// Statements are keyword-introduced and blocks are closed by `end`;
// `then`/`do` after a condition and `;` between statements are optional.
// Errors are collected as diagnostics and parsing resynchronizes at the
// next statement keyword.

use crate::ast::*;
use crate::errors::Diagnostic;
use crate::lexer::{Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    file: String,
    diagnostics: Vec<Diagnostic>,
}

impl Parser {
    pub fn new(file: &str, tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0, file: file.to_string(), diagnostics: Vec::new() }
    }

    pub fn parse(mut self) -> Result<Vec<Stmt>, Vec<Diagnostic>> {
        let mut stmts = Vec::new();
        while !self.at_eof() {
            match self.parse_stmt() {
                Some(stmt) => stmts.push(stmt),
                None => self.synchronize(),
            }
        }
        if self.diagnostics.is_empty() {
            Ok(stmts)
        } else {
            Err(self.diagnostics)
        }
    }

    // === Token plumbing ===

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn peek_ahead(&self, n: usize) -> &TokenKind {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)].kind
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn advance(&mut self) -> TokenKind {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), TokenKind::Eof)
    }

    fn check_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), TokenKind::Keyword(k) if k == kw)
    }

    fn match_keyword(&mut self, kw: &str) -> bool {
        if self.check_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn check_op(&self, op: &str) -> bool {
        matches!(self.peek(), TokenKind::Operator(o) if o == op)
    }

    fn match_op(&mut self, op: &str) -> bool {
        if self.check_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn check_punct(&self, p: char) -> bool {
        matches!(self.peek(), TokenKind::Punctuation(c) if *c == p)
    }

    fn match_punct(&mut self, p: char) -> bool {
        if self.check_punct(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        let line = self.line();
        self.diagnostics.push(Diagnostic::new(&self.file, line, message));
    }

    fn expect_punct(&mut self, p: char, what: &str) -> Option<()> {
        if self.match_punct(p) {
            Some(())
        } else {
            self.error(format!("expected '{}' {}", p, what));
            None
        }
    }

    fn expect_keyword(&mut self, kw: &str, what: &str) -> Option<()> {
        if self.match_keyword(kw) {
            Some(())
        } else {
            self.error(format!("expected '{}' {}", kw, what));
            None
        }
    }

    fn expect_identifier(&mut self, what: &str) -> Option<String> {
        if let TokenKind::Identifier(name) = self.peek() {
            let name = name.clone();
            self.advance();
            Some(name)
        } else {
            self.error(format!("expected {}", what));
            None
        }
    }

    fn synchronize(&mut self) {
        while !self.at_eof() {
            match self.peek() {
                TokenKind::Punctuation(';') => {
                    self.advance();
                    return;
                }
                TokenKind::Keyword(k)
                    if matches!(
                        k.as_str(),
                        "var" | "fun" | "class" | "if" | "while" | "for" | "return" | "raise"
                            | "try" | "with" | "import" | "end"
                    ) =>
                {
                    if k == "end" {
                        self.advance();
                    }
                    return;
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    // === Statements ===

    fn parse_stmt(&mut self) -> Option<Stmt> {
        let stmt = self.parse_stmt_inner()?;
        // Optional separators between juxtaposed statements.
        while self.match_punct(';') {}
        Some(stmt)
    }

    fn parse_stmt_inner(&mut self) -> Option<Stmt> {
        let line = self.line();
        match self.peek() {
            TokenKind::Keyword(k) => match k.as_str() {
                "var" => self.parse_var_decl(false),
                "static" => {
                    self.advance();
                    match self.peek() {
                        TokenKind::Keyword(k2) if k2 == "var" => self.parse_var_decl(true),
                        TokenKind::Keyword(k2) if k2 == "fun" => self.parse_fun_decl(true),
                        TokenKind::Keyword(k2) if k2 == "class" => self.parse_class_decl(true),
                        _ => {
                            self.error("expected 'var', 'fun' or 'class' after 'static'");
                            None
                        }
                    }
                }
                "fun" if matches!(self.peek_ahead(1), TokenKind::Identifier(_)) => {
                    self.parse_fun_decl(false)
                }
                "native" => self.parse_native_decl(),
                "class" => self.parse_class_decl(false),
                "if" => self.parse_if(),
                "while" => self.parse_while(),
                "for" => self.parse_for(),
                "return" => {
                    self.advance();
                    let value = if self.starts_expression() {
                        Some(self.parse_expr()?)
                    } else {
                        None
                    };
                    Some(Stmt::new(line, StmtKind::Return(value)))
                }
                "break" => {
                    self.advance();
                    Some(Stmt::new(line, StmtKind::Break))
                }
                "continue" => {
                    self.advance();
                    Some(Stmt::new(line, StmtKind::Continue))
                }
                "raise" => {
                    self.advance();
                    let value = self.parse_expr()?;
                    Some(Stmt::new(line, StmtKind::Raise(value)))
                }
                "try" => self.parse_try(),
                "with" => self.parse_with(),
                "import" => self.parse_import(),
                "begin" => {
                    self.advance();
                    let body = self.parse_block(&["end"])?;
                    self.expect_keyword("end", "to close 'begin' block")?;
                    Some(Stmt::new(line, StmtKind::Block(body)))
                }
                _ => self.parse_expr_or_assign(),
            },
            _ => self.parse_expr_or_assign(),
        }
    }

    fn starts_expression(&self) -> bool {
        match self.peek() {
            TokenKind::Identifier(_) | TokenKind::Number(_) | TokenKind::Str(_) => true,
            TokenKind::Punctuation(p) => matches!(p, '(' | '[' | '{'),
            TokenKind::Operator(o) => matches!(o.as_str(), "-" | "!" | "#" | "##"),
            TokenKind::Keyword(k) => {
                matches!(k.as_str(), "true" | "false" | "null" | "this" | "super" | "fun" | "not")
            }
            _ => false,
        }
    }

    /// Statements terminated by any of `terminators` (not consumed).
    fn parse_block(&mut self, terminators: &[&str]) -> Option<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            if self.at_eof() {
                self.error(format!("expected '{}' before end of input", terminators[0]));
                return None;
            }
            if let TokenKind::Keyword(k) = self.peek() {
                if terminators.contains(&k.as_str()) {
                    return Some(stmts);
                }
            }
            match self.parse_stmt() {
                Some(stmt) => stmts.push(stmt),
                None => self.synchronize(),
            }
        }
    }

    fn parse_var_decl(&mut self, is_static: bool) -> Option<Stmt> {
        let line = self.line();
        self.advance(); // var
        let mut names = vec![self.expect_identifier("variable name")?];
        while self.match_punct(',') {
            names.push(self.expect_identifier("variable name")?);
        }
        let init = if self.match_op("=") {
            if names.len() > 1 {
                Some(self.parse_expr_list(line)?)
            } else {
                Some(self.parse_expr()?)
            }
        } else {
            if names.len() > 1 {
                self.error("unpacking declaration requires an initializer");
                return None;
            }
            None
        };
        Some(Stmt::new(line, StmtKind::VarDecl { names, init, is_static }))
    }

    fn parse_params(&mut self) -> Option<(Vec<String>, Vec<Expr>, Option<String>)> {
        self.expect_punct('(', "before parameter list")?;
        let mut params = Vec::new();
        let mut defaults = Vec::new();
        let mut vararg = None;
        if !self.check_punct(')') {
            loop {
                if self.match_op("...") {
                    vararg = Some(self.expect_identifier("vararg name")?);
                    break;
                }
                let name = self.expect_identifier("parameter name")?;
                if self.match_op("=") {
                    let dflt = self.parse_expr()?;
                    if !is_const_literal(&dflt) {
                        self.error("default parameter values must be constant literals");
                    }
                    defaults.push(dflt);
                } else if !defaults.is_empty() {
                    self.error("non-default parameter follows a default parameter");
                }
                params.push(name);
                if !self.match_punct(',') {
                    break;
                }
            }
        }
        self.expect_punct(')', "after parameter list")?;
        if params.len() > u8::MAX as usize {
            self.error("too many parameters");
        }
        Some((params, defaults, vararg))
    }

    fn parse_fun_tail(&mut self, line: u32) -> Option<FunLit> {
        let (params, defaults, vararg) = self.parse_params()?;
        let body = self.parse_block(&["end"])?;
        self.expect_keyword("end", "to close function body")?;
        Some(FunLit { line, params, defaults, vararg, body })
    }

    fn parse_fun_decl(&mut self, is_static: bool) -> Option<Stmt> {
        let line = self.line();
        self.advance(); // fun
        let name = self.expect_identifier("function name")?;
        let fun = self.parse_fun_tail(line)?;
        Some(Stmt::new(line, StmtKind::FunDecl { name, fun, is_static }))
    }

    fn parse_native_decl(&mut self) -> Option<Stmt> {
        let line = self.line();
        self.advance(); // native
        self.expect_keyword("fun", "after 'native'")?;
        let name = self.expect_identifier("native function name")?;
        let (params, _, _) = self.parse_params()?;
        Some(Stmt::new(line, StmtKind::NativeDecl { name, arity: params.len() as u8 }))
    }

    fn parse_class_decl(&mut self, is_static: bool) -> Option<Stmt> {
        let line = self.line();
        self.advance(); // class
        let name = self.expect_identifier("class name")?;
        let superclass = if self.match_keyword("is") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        let mut methods = Vec::new();
        loop {
            if self.match_keyword("end") {
                break;
            }
            let m_line = self.line();
            if self.match_keyword("native") {
                self.expect_keyword("fun", "after 'native'")?;
                let m_name = self.expect_identifier("method name")?;
                let (params, _, _) = self.parse_params()?;
                methods.push(MethodDecl {
                    line: m_line,
                    name: m_name,
                    fun: None,
                    arity: params.len() as u8,
                });
            } else if self.match_keyword("fun") {
                let m_name = self.expect_identifier("method name")?;
                let fun = self.parse_fun_tail(m_line)?;
                let arity = fun.params.len() as u8;
                methods.push(MethodDecl { line: m_line, name: m_name, fun: Some(fun), arity });
            } else {
                self.error("expected method declaration or 'end' in class body");
                return None;
            }
        }
        Some(Stmt::new(line, StmtKind::ClassDecl { name, superclass, methods, is_static }))
    }

    fn parse_if(&mut self) -> Option<Stmt> {
        let line = self.line();
        self.advance(); // if or elif
        let cond = self.parse_expr()?;
        self.match_keyword("then");
        let then = self.parse_block(&["elif", "else", "end"])?;
        let orelse = if self.check_keyword("elif") {
            // Desugar elif into a nested if in the else branch.
            vec![self.parse_if()?]
        } else if self.match_keyword("else") {
            let body = self.parse_block(&["end"])?;
            self.expect_keyword("end", "to close 'if'")?;
            body
        } else {
            self.expect_keyword("end", "to close 'if'")?;
            Vec::new()
        };
        Some(Stmt::new(line, StmtKind::If { cond, then, orelse }))
    }

    fn parse_while(&mut self) -> Option<Stmt> {
        let line = self.line();
        self.advance();
        let cond = self.parse_expr()?;
        self.match_keyword("do");
        let body = self.parse_block(&["end"])?;
        self.expect_keyword("end", "to close 'while'")?;
        Some(Stmt::new(line, StmtKind::While { cond, body }))
    }

    fn parse_for(&mut self) -> Option<Stmt> {
        let line = self.line();
        self.advance(); // for
        // `for var v in e` is the iterator form.
        if self.check_keyword("var") && matches!(self.peek_ahead(2), TokenKind::Keyword(k) if k == "in")
        {
            self.advance(); // var
            let name = self.expect_identifier("loop variable")?;
            self.expect_keyword("in", "in for-each loop")?;
            let iterable = self.parse_expr()?;
            self.match_keyword("do");
            let body = self.parse_block(&["end"])?;
            self.expect_keyword("end", "to close 'for'")?;
            return Some(Stmt::new(line, StmtKind::ForEach { name, iterable, body }));
        }
        // C-style: for init ; cond ; incr do body end
        let init = if self.check_punct(';') {
            None
        } else if self.check_keyword("var") {
            Some(Box::new(self.parse_var_decl(false)?))
        } else {
            Some(Box::new(self.parse_expr_or_assign()?))
        };
        self.expect_punct(';', "after for-loop initializer")?;
        let cond = if self.check_punct(';') { None } else { Some(self.parse_expr()?) };
        self.expect_punct(';', "after for-loop condition")?;
        let incr = if self.check_keyword("do") || self.starts_statement_body() {
            None
        } else {
            Some(Box::new(self.parse_expr_or_assign()?))
        };
        self.match_keyword("do");
        let body = self.parse_block(&["end"])?;
        self.expect_keyword("end", "to close 'for'")?;
        Some(Stmt::new(line, StmtKind::For { init, cond, incr, body }))
    }

    fn starts_statement_body(&self) -> bool {
        matches!(self.peek(), TokenKind::Keyword(k) if k == "end")
    }

    fn parse_try(&mut self) -> Option<Stmt> {
        let line = self.line();
        self.advance(); // try
        let body = self.parse_block(&["except", "ensure", "end"])?;
        let mut excepts = Vec::new();
        while self.check_keyword("except") {
            let e_line = self.line();
            self.advance();
            let class = self.parse_expr()?;
            let var = if let TokenKind::Identifier(_) = self.peek() {
                self.expect_identifier("exception variable")
            } else {
                None
            };
            let e_body = self.parse_block(&["except", "ensure", "end"])?;
            excepts.push(ExceptClause { line: e_line, class, var, body: e_body });
        }
        let ensure = if self.match_keyword("ensure") {
            Some(self.parse_block(&["end"])?)
        } else {
            None
        };
        self.expect_keyword("end", "to close 'try'")?;
        if excepts.is_empty() && ensure.is_none() {
            self.error("'try' requires at least one 'except' or an 'ensure' clause");
            return None;
        }
        Some(Stmt::new(line, StmtKind::Try { body, excepts, ensure }))
    }

    fn parse_with(&mut self) -> Option<Stmt> {
        let line = self.line();
        self.advance(); // with
        let expr = self.parse_expr()?;
        let var = self.expect_identifier("resource variable in 'with'")?;
        self.match_keyword("do");
        let body = self.parse_block(&["end"])?;
        self.expect_keyword("end", "to close 'with'")?;
        Some(Stmt::new(line, StmtKind::With { expr, var, body }))
    }

    fn parse_import(&mut self) -> Option<Stmt> {
        let line = self.line();
        self.advance(); // import
        let module = self.expect_identifier("module name")?;
        let mut names = Vec::new();
        let mut alias = None;
        if self.match_keyword("for") {
            names.push(self.expect_identifier("imported name")?);
            while self.match_punct(',') {
                names.push(self.expect_identifier("imported name")?);
            }
        } else if self.match_keyword("as") {
            alias = Some(self.expect_identifier("module alias")?);
        }
        Some(Stmt::new(line, StmtKind::Import { module, names, alias }))
    }

    /// One or more comma-separated expressions; several become an implicit
    /// tuple literal (`a, b = x, y` unpacks like `(x, y)`).
    fn parse_expr_list(&mut self, line: u32) -> Option<Expr> {
        let first = self.parse_expr()?;
        if !self.check_punct(',') {
            return Some(first);
        }
        let mut items = vec![first];
        while self.match_punct(',') {
            items.push(self.parse_expr()?);
        }
        Some(Expr::new(line, ExprKind::TupleLit(items)))
    }

    fn parse_expr_or_assign(&mut self) -> Option<Stmt> {
        let line = self.line();
        let first = self.parse_expr()?;
        // Tuple assignment targets: a, b = rhs
        if self.check_punct(',') && is_assign_target(&first) {
            let mut targets = vec![first];
            while self.match_punct(',') {
                targets.push(self.parse_expr()?);
            }
            if !self.match_op("=") {
                self.error("expected '=' after unpacking targets");
                return None;
            }
            for t in &targets {
                if !is_assign_target(t) {
                    self.error("invalid assignment target");
                    return None;
                }
            }
            let value = self.parse_expr_list(line)?;
            return Some(Stmt::new(line, StmtKind::Assign { targets, op: None, value }));
        }
        // Parenthesized targets: (a, b) = rhs
        if let ExprKind::TupleLit(items) = &first.kind {
            if self.check_op("=") && !items.is_empty() && items.iter().all(is_assign_target) {
                self.advance();
                let targets = items.clone();
                let value = self.parse_expr_list(line)?;
                return Some(Stmt::new(line, StmtKind::Assign { targets, op: None, value }));
            }
        }
        let compound = match self.peek() {
            TokenKind::Operator(o) => match o.as_str() {
                "=" => Some(None),
                "+=" => Some(Some(BinOp::Add)),
                "-=" => Some(Some(BinOp::Sub)),
                "*=" => Some(Some(BinOp::Mul)),
                "/=" => Some(Some(BinOp::Div)),
                "%=" => Some(Some(BinOp::Mod)),
                _ => None,
            },
            _ => None,
        };
        if let Some(op) = compound {
            self.advance();
            if !is_assign_target(&first) {
                self.error("invalid assignment target");
                return None;
            }
            let value = self.parse_expr()?;
            return Some(Stmt::new(line, StmtKind::Assign { targets: vec![first], op, value }));
        }
        Some(Stmt::new(line, StmtKind::Expr(first)))
    }

    // === Expressions ===

    fn parse_expr(&mut self) -> Option<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Option<Expr> {
        let mut left = self.parse_and()?;
        while self.match_keyword("or") {
            let line = left.line;
            let right = self.parse_and()?;
            left = Expr::new(line, ExprKind::Or(Box::new(left), Box::new(right)));
        }
        Some(left)
    }

    fn parse_and(&mut self) -> Option<Expr> {
        let mut left = self.parse_equality()?;
        while self.match_keyword("and") {
            let line = left.line;
            let right = self.parse_equality()?;
            left = Expr::new(line, ExprKind::And(Box::new(left), Box::new(right)));
        }
        Some(left)
    }

    fn parse_equality(&mut self) -> Option<Expr> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = if self.match_op("==") {
                BinOp::Eq
            } else if self.match_op("!=") {
                BinOp::Neq
            } else if self.match_keyword("is") {
                BinOp::Is
            } else {
                return Some(left);
            };
            let line = left.line;
            let right = self.parse_comparison()?;
            left = Expr::new(line, ExprKind::Binary(op, Box::new(left), Box::new(right)));
        }
    }

    fn parse_comparison(&mut self) -> Option<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = if self.match_op("<=") {
                BinOp::Le
            } else if self.match_op("<") {
                BinOp::Lt
            } else if self.match_op(">=") {
                BinOp::Ge
            } else if self.match_op(">") {
                BinOp::Gt
            } else {
                return Some(left);
            };
            let line = left.line;
            let right = self.parse_additive()?;
            left = Expr::new(line, ExprKind::Binary(op, Box::new(left), Box::new(right)));
        }
    }

    fn parse_additive(&mut self) -> Option<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = if self.match_op("+") {
                BinOp::Add
            } else if self.match_op("-") {
                BinOp::Sub
            } else {
                return Some(left);
            };
            let line = left.line;
            let right = self.parse_multiplicative()?;
            left = Expr::new(line, ExprKind::Binary(op, Box::new(left), Box::new(right)));
        }
    }

    fn parse_multiplicative(&mut self) -> Option<Expr> {
        let mut left = self.parse_power()?;
        loop {
            let op = if self.match_op("*") {
                BinOp::Mul
            } else if self.match_op("/") {
                BinOp::Div
            } else if self.match_op("%") {
                BinOp::Mod
            } else {
                return Some(left);
            };
            let line = left.line;
            let right = self.parse_power()?;
            left = Expr::new(line, ExprKind::Binary(op, Box::new(left), Box::new(right)));
        }
    }

    fn parse_power(&mut self) -> Option<Expr> {
        let left = self.parse_unary()?;
        if self.match_op("^") {
            let line = left.line;
            // Right-associative.
            let right = self.parse_power()?;
            return Some(Expr::new(line, ExprKind::Binary(BinOp::Pow, Box::new(left), Box::new(right))));
        }
        Some(left)
    }

    fn parse_unary(&mut self) -> Option<Expr> {
        let line = self.line();
        let op = if self.match_op("-") {
            Some(UnaryOp::Neg)
        } else if self.match_op("!") || self.match_keyword("not") {
            Some(UnaryOp::Not)
        } else if self.match_op("#") {
            Some(UnaryOp::Len)
        } else if self.match_op("##") {
            Some(UnaryOp::Stringify)
        } else {
            None
        };
        if let Some(op) = op {
            let operand = self.parse_unary()?;
            return Some(Expr::new(line, ExprKind::Unary(op, Box::new(operand))));
        }
        self.parse_postfix()
    }

    fn parse_args(&mut self) -> Option<(Vec<Expr>, bool)> {
        // '(' already consumed
        let mut args = Vec::new();
        let mut unpack_last = false;
        if !self.check_punct(')') {
            loop {
                if self.match_op("...") {
                    args.push(self.parse_expr()?);
                    unpack_last = true;
                    break;
                }
                args.push(self.parse_expr()?);
                if !self.match_punct(',') {
                    break;
                }
            }
        }
        self.expect_punct(')', "after arguments")?;
        if args.len() > u8::MAX as usize {
            self.error("too many arguments");
        }
        Some((args, unpack_last))
    }

    fn parse_postfix(&mut self) -> Option<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            let line = self.line();
            if self.match_punct('(') {
                let (args, unpack_last) = self.parse_args()?;
                expr = Expr::new(line, ExprKind::Call { callee: Box::new(expr), args, unpack_last });
            } else if self.match_op(".") {
                let name = self.expect_identifier("field name after '.'")?;
                if self.match_punct('(') {
                    let (args, unpack_last) = self.parse_args()?;
                    expr = Expr::new(
                        line,
                        ExprKind::Invoke { object: Box::new(expr), name, args, unpack_last },
                    );
                } else {
                    expr = Expr::new(line, ExprKind::Field { object: Box::new(expr), name });
                }
            } else if self.match_punct('[') {
                let index = self.parse_expr()?;
                self.expect_punct(']', "after subscript")?;
                expr = Expr::new(
                    line,
                    ExprKind::Subscript { object: Box::new(expr), index: Box::new(index) },
                );
            } else {
                return Some(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> Option<Expr> {
        let line = self.line();
        match self.advance() {
            TokenKind::Number(n) => Some(Expr::new(line, ExprKind::Num(n))),
            TokenKind::Str(raw) => Some(Expr::new(line, ExprKind::Str(raw))),
            TokenKind::Identifier(name) => Some(Expr::new(line, ExprKind::Var(name))),
            TokenKind::Keyword(k) => match k.as_str() {
                "true" => Some(Expr::new(line, ExprKind::True)),
                "false" => Some(Expr::new(line, ExprKind::False)),
                "null" => Some(Expr::new(line, ExprKind::Null)),
                "this" => Some(Expr::new(line, ExprKind::This)),
                "super" => self.parse_super(line),
                "fun" => {
                    let fun = self.parse_fun_tail(line)?;
                    Some(Expr::new(line, ExprKind::Fun(Box::new(fun))))
                }
                other => {
                    self.error(format!("unexpected keyword '{}'", other));
                    None
                }
            },
            TokenKind::Punctuation('(') => self.parse_paren(line),
            TokenKind::Punctuation('[') => {
                let mut items = Vec::new();
                if !self.check_punct(']') {
                    loop {
                        items.push(self.parse_expr()?);
                        if !self.match_punct(',') {
                            break;
                        }
                    }
                }
                self.expect_punct(']', "after list literal")?;
                Some(Expr::new(line, ExprKind::ListLit(items)))
            }
            TokenKind::Punctuation('{') => self.parse_table(line),
            other => {
                self.error(format!("unexpected token {:?}", other));
                None
            }
        }
    }

    fn parse_paren(&mut self, line: u32) -> Option<Expr> {
        if self.match_punct(')') {
            return Some(Expr::new(line, ExprKind::TupleLit(Vec::new())));
        }
        let first = self.parse_expr()?;
        if self.check_punct(',') {
            let mut items = vec![first];
            while self.match_punct(',') {
                if self.check_punct(')') {
                    break; // trailing comma: (x,)
                }
                items.push(self.parse_expr()?);
            }
            self.expect_punct(')', "after tuple literal")?;
            return Some(Expr::new(line, ExprKind::TupleLit(items)));
        }
        self.expect_punct(')', "after expression")?;
        Some(first)
    }

    fn parse_table(&mut self, line: u32) -> Option<Expr> {
        let mut entries = Vec::new();
        if !self.check_punct('}') {
            loop {
                let k_line = self.line();
                let key = if self.match_op(".") {
                    // `.name:` sugar for a string key.
                    let name = self.expect_identifier("table key after '.'")?;
                    Expr::new(k_line, ExprKind::Str(name))
                } else {
                    self.parse_expr()?
                };
                self.expect_punct(':', "between table key and value")?;
                let value = self.parse_expr()?;
                entries.push((key, value));
                if !self.match_punct(',') {
                    break;
                }
            }
        }
        self.expect_punct('}', "after table literal")?;
        Some(Expr::new(line, ExprKind::TableLit(entries)))
    }

    fn parse_super(&mut self, line: u32) -> Option<Expr> {
        if self.match_punct('(') {
            let (args, unpack_last) = self.parse_args()?;
            return Some(Expr::new(line, ExprKind::Super { name: None, args, unpack_last, call: true }));
        }
        if self.match_op(".") {
            let name = self.expect_identifier("method name after 'super.'")?;
            if self.match_punct('(') {
                let (args, unpack_last) = self.parse_args()?;
                return Some(Expr::new(
                    line,
                    ExprKind::Super { name: Some(name), args, unpack_last, call: true },
                ));
            }
            return Some(Expr::new(
                line,
                ExprKind::Super { name: Some(name), args: Vec::new(), unpack_last: false, call: false },
            ));
        }
        self.error("expected '(' or '.' after 'super'");
        None
    }
}

fn is_assign_target(e: &Expr) -> bool {
    matches!(e.kind, ExprKind::Var(_) | ExprKind::Field { .. } | ExprKind::Subscript { .. })
}

fn is_const_literal(e: &Expr) -> bool {
    matches!(
        e.kind,
        ExprKind::Num(_) | ExprKind::Str(_) | ExprKind::True | ExprKind::False | ExprKind::Null
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse_src(src: &str) -> Vec<Stmt> {
        let tokens = tokenize("test.vsp", src).unwrap();
        Parser::new("test.vsp", tokens).parse().unwrap()
    }

    #[test]
    fn parses_class_with_super() {
        let stmts = parse_src("class B is A fun hi() return super() + \"B\" end end");
        assert_eq!(stmts.len(), 1);
        match &stmts[0].kind {
            StmtKind::ClassDecl { name, superclass, methods, .. } => {
                assert_eq!(name, "B");
                assert!(superclass.is_some());
                assert_eq!(methods.len(), 1);
                assert_eq!(methods[0].name, "hi");
            }
            other => panic!("expected class, got {:?}", other),
        }
    }

    #[test]
    fn parses_table_with_dot_key_sugar() {
        let stmts = parse_src("var t = {.name: \"x\", \"k\": 1}");
        match &stmts[0].kind {
            StmtKind::VarDecl { init: Some(e), .. } => match &e.kind {
                ExprKind::TableLit(entries) => {
                    assert_eq!(entries.len(), 2);
                    assert!(matches!(&entries[0].0.kind, ExprKind::Str(s) if s == "name"));
                }
                other => panic!("expected table literal, got {:?}", other),
            },
            other => panic!("expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn parses_foreach() {
        let stmts = parse_src("for var i in [1,2,3] print(i) end");
        assert!(matches!(&stmts[0].kind, StmtKind::ForEach { name, .. } if name == "i"));
    }

    #[test]
    fn parses_try_except_ensure() {
        let stmts = parse_src("try f() except Exception e print(e) ensure g() end");
        match &stmts[0].kind {
            StmtKind::Try { excepts, ensure, .. } => {
                assert_eq!(excepts.len(), 1);
                assert_eq!(excepts[0].var.as_deref(), Some("e"));
                assert!(ensure.is_some());
            }
            other => panic!("expected try, got {:?}", other),
        }
    }

    #[test]
    fn try_without_clauses_is_an_error() {
        let tokens = tokenize("t.vsp", "try f() end").unwrap();
        assert!(Parser::new("t.vsp", tokens).parse().is_err());
    }

    #[test]
    fn parses_unpack_assignment() {
        let stmts = parse_src("a, b = x, y");
        // The rvalue `x, y` parses as the start of targets; the statement
        // is targets [a, b] with value being a tuple-less expression list?
        match &stmts[0].kind {
            StmtKind::Assign { targets, op, .. } => {
                assert_eq!(targets.len(), 2);
                assert!(op.is_none());
            }
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn parses_vararg_function() {
        let stmts = parse_src("fun f(a, b=1, ...rest) end");
        match &stmts[0].kind {
            StmtKind::FunDecl { fun, .. } => {
                assert_eq!(fun.params, vec!["a".to_string(), "b".to_string()]);
                assert_eq!(fun.defaults.len(), 1);
                assert_eq!(fun.vararg.as_deref(), Some("rest"));
            }
            other => panic!("expected fun decl, got {:?}", other),
        }
    }

    #[test]
    fn parses_compound_assignment() {
        let stmts = parse_src("x += 2");
        assert!(matches!(&stmts[0].kind, StmtKind::Assign { op: Some(BinOp::Add), .. }));
    }

    #[test]
    fn parses_unpack_call() {
        let stmts = parse_src("f(a, ...b)");
        match &stmts[0].kind {
            StmtKind::Expr(e) => match &e.kind {
                ExprKind::Call { args, unpack_last, .. } => {
                    assert_eq!(args.len(), 2);
                    assert!(unpack_last);
                }
                other => panic!("expected call, got {:?}", other),
            },
            other => panic!("expected expr stmt, got {:?}", other),
        }
    }
}
