//! Recursive-descent parser producing the line-tagged statement tree
//!
//! Grammar (keywords case-insensitive):
//!
//! ```text
//! program   := { var_block | statement }
//! var_block := VAR { ident ':' type [ ':=' expr ] ';' } END_VAR [';']
//! statement := ident ':=' expr ';'
//!            | Device '.' fn '(' args ')' ';'
//!            | IF expr THEN block { ELSIF expr THEN block } [ ELSE block ] END_IF [';']
//!            | WHILE expr DO block END_WHILE [';']
//!            | ';'
//! expr      := or    (OR < AND < = <> < relational < + - < * / MOD < unary)
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use gridsim_types::Value;

use crate::ast::*;
use crate::error::CompileError;
use crate::lexer::{Tok, Token, tokenize};

/// Deepest allowed nesting of blocks, parentheses and operator trees
pub const MAX_NESTING: usize = 128;

const RESERVED: &[&str] = &[
    "VAR", "END_VAR", "IF", "THEN", "ELSIF", "ELSE", "END_IF", "WHILE", "DO", "END_WHILE", "AND",
    "OR", "NOT", "MOD", "TRUE", "FALSE",
];

/// Compile a complete program
///
/// All-or-nothing: the first problem aborts compilation.
pub fn compile(source: &str) -> Result<Program, CompileError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(&tokens);
    let mut vars: Vec<VarDecl> = Vec::new();
    let mut body = Vec::new();

    while !parser.at_end() {
        if parser.peek_keyword("VAR") {
            parser.var_block(&mut vars)?;
        } else if let Some(stmt) = parser.statement()? {
            body.push(stmt);
        }
    }

    let mut declared = HashSet::new();
    for decl in &vars {
        if !declared.insert(decl.key.clone()) {
            return Err(CompileError::at(
                decl.line,
                format!("Duplicate variable '{}'", decl.name),
            ));
        }
        if decl.init.as_ref().is_some_and(Expr::calls_device) {
            return Err(CompileError::at(
                decl.line,
                format!("Initializer for '{}' must not call Device functions", decl.name),
            ));
        }
    }

    check_uses(&parser.uses, &vars)?;

    Ok(Program {
        source: Arc::from(source),
        vars,
        body: Arc::from(body),
    })
}

/// Compile a breakpoint condition against an existing program's variables
pub fn compile_condition(program: &Program, text: &str) -> Result<Expr, CompileError> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return Err(CompileError::unlocated("Empty condition"));
    }
    let mut parser = Parser::new(&tokens);
    let expr = parser.expr()?;
    if !parser.at_end() {
        return Err(CompileError::unlocated(format!(
            "Unexpected {} in condition",
            parser.describe_current()
        )));
    }
    if expr.calls_device() {
        return Err(CompileError::unlocated(
            "Conditions must not call Device functions",
        ));
    }
    check_uses(&parser.uses, &program.vars).map_err(|e| CompileError::unlocated(e.message))?;
    Ok(expr)
}

fn check_uses(uses: &[Use], vars: &[VarDecl]) -> Result<(), CompileError> {
    for u in uses {
        let Some(decl) = vars.iter().find(|v| v.key == u.key) else {
            return Err(CompileError::at(
                u.line,
                format!("Undeclared variable '{}'", u.written),
            ));
        };
        if u.step_time && !decl.is_state_constant() {
            return Err(CompileError::at(
                u.line,
                format!(
                    "'{}' has no stepTime; only initialized STATE_ integer constants do",
                    u.written
                ),
            ));
        }
    }
    Ok(())
}

/// A variable reference seen while parsing
struct Use {
    key: String,
    written: String,
    line: u32,
    step_time: bool,
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    uses: Vec<Use>,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self {
            tokens,
            pos: 0,
            uses: Vec::new(),
            depth: 0,
        }
    }

    /// Run `parse` one nesting level deeper
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, CompileError>,
    ) -> Result<T, CompileError> {
        if self.depth >= MAX_NESTING {
            return Err(CompileError::at(self.line(), "Expression nested too deeply"));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    // ─────────────────────────────────────────────────────────────────────
    // Token helpers
    // ─────────────────────────────────────────────────────────────────────

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&'a Token> {
        self.tokens.get(self.pos + offset)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        self.peek().is_some_and(|t| t.is_keyword(keyword))
    }

    fn peek_tok(&self, tok: &Tok) -> bool {
        self.peek().is_some_and(|t| &t.tok == tok)
    }

    fn advance(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// Line of the current token, or of the last one at end of input
    fn line(&self) -> u32 {
        self.peek()
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn describe_current(&self) -> String {
        match self.peek().map(|t| &t.tok) {
            None => "end of input".to_string(),
            Some(Tok::Ident(s)) => format!("'{s}'"),
            Some(Tok::Int(i)) => format!("'{i}'"),
            Some(Tok::Real(r)) => format!("'{r}'"),
            Some(Tok::Str(s)) => format!("'{s}'"),
            Some(other) => format!("'{}'", symbol(other)),
        }
    }

    fn expect_tok(&mut self, tok: Tok) -> Result<(), CompileError> {
        if self.peek_tok(&tok) {
            self.pos += 1;
            Ok(())
        } else {
            Err(CompileError::at(
                self.line(),
                format!("Expected '{}' but found {}", symbol(&tok), self.describe_current()),
            ))
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), CompileError> {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            Ok(())
        } else {
            Err(CompileError::at(
                self.line(),
                format!("Expected {keyword} but found {}", self.describe_current()),
            ))
        }
    }

    fn skip_semicolon(&mut self) {
        if self.peek_tok(&Tok::Semi) {
            self.pos += 1;
        }
    }

    fn record_use(&mut self, written: &str, line: u32, step_time: bool) -> String {
        let key = written.to_ascii_uppercase();
        self.uses.push(Use {
            key: key.clone(),
            written: written.to_string(),
            line,
            step_time,
        });
        key
    }

    // ─────────────────────────────────────────────────────────────────────
    // Declarations
    // ─────────────────────────────────────────────────────────────────────

    fn var_block(&mut self, vars: &mut Vec<VarDecl>) -> Result<(), CompileError> {
        let block_line = self.line();
        self.expect_keyword("VAR")?;

        loop {
            let Some(token) = self.peek() else {
                return Err(CompileError::at(
                    block_line,
                    "Unterminated VAR block (missing END_VAR)",
                ));
            };
            if token.is_keyword("END_VAR") {
                self.pos += 1;
                self.skip_semicolon();
                return Ok(());
            }

            let line = token.line;
            let malformed = || CompileError::at(line, "Malformed VAR entry");

            let name = match &token.tok {
                Tok::Ident(name) if !is_reserved(name) => name.clone(),
                _ => return Err(malformed()),
            };
            self.pos += 1;

            if !self.peek_tok(&Tok::Colon) {
                return Err(malformed());
            }
            self.pos += 1;

            let ty_name = match self.advance().map(|t| &t.tok) {
                Some(Tok::Ident(ty)) => ty.clone(),
                _ => return Err(malformed()),
            };
            let ty = VarType::parse(&ty_name)
                .ok_or_else(|| CompileError::at(line, format!("Unknown type '{ty_name}'")))?;

            let init = if self.peek_tok(&Tok::Assign) {
                self.pos += 1;
                Some(self.expr()?)
            } else {
                None
            };

            if !self.peek_tok(&Tok::Semi) {
                return Err(malformed());
            }
            self.pos += 1;

            vars.push(VarDecl {
                key: name.to_ascii_uppercase(),
                name,
                ty,
                init,
                line,
            });
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Statements
    // ─────────────────────────────────────────────────────────────────────

    fn statement(&mut self) -> Result<Option<Stmt>, CompileError> {
        let Some(token) = self.peek() else {
            return Ok(None);
        };
        let line = token.line;

        match &token.tok {
            Tok::Semi => {
                self.pos += 1;
                Ok(None)
            }
            Tok::Ident(word) if word.eq_ignore_ascii_case("IF") => {
                self.nested(|p| p.if_statement(line)).map(Some)
            }
            Tok::Ident(word) if word.eq_ignore_ascii_case("WHILE") => {
                self.nested(|p| p.while_statement(line)).map(Some)
            }
            Tok::Ident(word) if word.eq_ignore_ascii_case("Device") => {
                let call = self.device_call()?;
                self.expect_tok(Tok::Semi)?;
                Ok(Some(Stmt {
                    line,
                    kind: StmtKind::Call(call),
                }))
            }
            Tok::Ident(word) if is_reserved(word) => Err(CompileError::at(
                line,
                format!("Unexpected '{word}'"),
            )),
            Tok::Ident(word) => {
                let written = word.clone();
                self.pos += 1;
                if !self.peek_tok(&Tok::Assign) {
                    return Err(CompileError::at(
                        line,
                        format!("Expected ':=' after '{written}'"),
                    ));
                }
                self.pos += 1;
                let target = self.record_use(&written, line, false);
                let value = self.expr()?;
                self.expect_tok(Tok::Semi)?;
                Ok(Some(Stmt {
                    line,
                    kind: StmtKind::Assign { target, value },
                }))
            }
            _ => Err(CompileError::at(
                line,
                format!("Unexpected {}", self.describe_current()),
            )),
        }
    }

    /// Parse statements until one of `terminators` is the next keyword
    ///
    /// Returns `None` when input ends first so the caller can name the
    /// unterminated construct.
    fn block(&mut self, terminators: &[&str]) -> Result<Option<Vec<Stmt>>, CompileError> {
        let mut stmts = Vec::new();
        loop {
            if self.at_end() {
                return Ok(None);
            }
            if terminators.iter().any(|kw| self.peek_keyword(kw)) {
                return Ok(Some(stmts));
            }
            if self.peek_keyword("VAR") {
                return Err(CompileError::at(
                    self.line(),
                    "VAR blocks are only allowed at top level",
                ));
            }
            if let Some(stmt) = self.statement()? {
                stmts.push(stmt);
            }
        }
    }

    fn if_statement(&mut self, line: u32) -> Result<Stmt, CompileError> {
        let unterminated = || CompileError::at(line, "Unterminated IF block (missing END_IF)");
        self.expect_keyword("IF")?;

        let mut branches = Vec::new();
        let mut otherwise = None;

        let cond = self.expr()?;
        self.expect_keyword("THEN")?;
        let body = self
            .block(&["ELSIF", "ELSE", "END_IF"])?
            .ok_or_else(unterminated)?;
        branches.push((cond, Block::from(body)));

        loop {
            if self.peek_keyword("ELSIF") {
                self.pos += 1;
                let cond = self.expr()?;
                self.expect_keyword("THEN")?;
                let body = self
                    .block(&["ELSIF", "ELSE", "END_IF"])?
                    .ok_or_else(unterminated)?;
                branches.push((cond, Block::from(body)));
            } else if self.peek_keyword("ELSE") {
                self.pos += 1;
                let body = self.block(&["END_IF"])?.ok_or_else(unterminated)?;
                otherwise = Some(Block::from(body));
            } else if self.peek_keyword("END_IF") {
                self.pos += 1;
                self.skip_semicolon();
                break;
            } else {
                return Err(unterminated());
            }
        }

        Ok(Stmt {
            line,
            kind: StmtKind::If {
                branches,
                otherwise,
            },
        })
    }

    fn while_statement(&mut self, line: u32) -> Result<Stmt, CompileError> {
        self.expect_keyword("WHILE")?;
        let cond = self.expr()?;
        self.expect_keyword("DO")?;
        let body = self.block(&["END_WHILE"])?.ok_or_else(|| {
            CompileError::at(line, "Unterminated WHILE block (missing END_WHILE)")
        })?;
        self.expect_keyword("END_WHILE")?;
        self.skip_semicolon();

        Ok(Stmt {
            line,
            kind: StmtKind::While {
                cond,
                body: Block::from(body),
            },
        })
    }

    fn device_call(&mut self) -> Result<DeviceCall, CompileError> {
        let line = self.line();
        self.pos += 1; // `Device`
        self.expect_tok(Tok::Dot)?;
        let name = match self.advance().map(|t| &t.tok) {
            Some(Tok::Ident(name)) => name.clone(),
            _ => return Err(CompileError::at(line, "Expected a Device function name")),
        };
        let func = DeviceFn::parse(&name).ok_or_else(|| {
            CompileError::at(line, format!("Unknown device function 'Device.{name}'"))
        })?;
        let args = self.arguments()?;
        if args.len() != func.arity() {
            return Err(CompileError::at(
                line,
                format!(
                    "{func} expects {} argument(s), got {}",
                    func.arity(),
                    args.len()
                ),
            ));
        }
        Ok(DeviceCall { func, args })
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, CompileError> {
        self.expect_tok(Tok::LParen)?;
        let mut args = Vec::new();
        if self.peek_tok(&Tok::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            if self.peek_tok(&Tok::Comma) {
                self.pos += 1;
                continue;
            }
            self.expect_tok(Tok::RParen)?;
            return Ok(args);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Expressions
    // ─────────────────────────────────────────────────────────────────────

    fn expr(&mut self) -> Result<Expr, CompileError> {
        self.nested(Self::or_expr)
    }

    fn or_expr(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.and_expr()?;
        while self.peek_keyword("OR") {
            self.pos += 1;
            let rhs = self.and_expr()?;
            lhs = self.binary(BinaryOp::Or, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.equality()?;
        while self.peek_keyword("AND") {
            self.pos += 1;
            let rhs = self.equality()?;
            lhs = self.binary(BinaryOp::And, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.relational()?;
        loop {
            let op = match self.peek().map(|t| &t.tok) {
                Some(Tok::Eq) => BinaryOp::Eq,
                Some(Tok::Ne) => BinaryOp::Ne,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.relational()?;
            lhs = self.binary(op, lhs, rhs)?;
        }
    }

    fn relational(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek().map(|t| &t.tok) {
                Some(Tok::Lt) => BinaryOp::Lt,
                Some(Tok::Le) => BinaryOp::Le,
                Some(Tok::Gt) => BinaryOp::Gt,
                Some(Tok::Ge) => BinaryOp::Ge,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.additive()?;
            lhs = self.binary(op, lhs, rhs)?;
        }
    }

    fn additive(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek().map(|t| &t.tok) {
                Some(Tok::Plus) => BinaryOp::Add,
                Some(Tok::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = self.binary(op, lhs, rhs)?;
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(t) if t.tok == Tok::Star => BinaryOp::Mul,
                Some(t) if t.tok == Tok::Slash => BinaryOp::Div,
                // Infix MOD; `MOD(` is the function form handled in primary
                Some(t) if t.is_keyword("MOD") && !self.peek_at(1).is_some_and(|n| n.tok == Tok::LParen) => {
                    BinaryOp::Mod
                }
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = self.binary(op, lhs, rhs)?;
        }
    }

    fn unary(&mut self) -> Result<Expr, CompileError> {
        if self.peek_tok(&Tok::Minus) {
            self.pos += 1;
            let operand = self.nested(Self::unary)?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        if self.peek_keyword("NOT") {
            self.pos += 1;
            let operand = self.nested(Self::unary)?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, CompileError> {
        let line = self.line();
        let Some(token) = self.peek() else {
            return Err(CompileError::at(line, "Unexpected end of input in expression"));
        };

        match &token.tok {
            Tok::Int(i) => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Int(*i)))
            }
            Tok::Real(r) => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Float(*r)))
            }
            Tok::Str(s) => {
                self.pos += 1;
                Ok(Expr::Literal(Value::String(s.clone())))
            }
            Tok::LParen => {
                self.pos += 1;
                let inner = self.expr()?;
                self.expect_tok(Tok::RParen)?;
                Ok(inner)
            }
            Tok::Ident(word) if word.eq_ignore_ascii_case("TRUE") => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Bool(true)))
            }
            Tok::Ident(word) if word.eq_ignore_ascii_case("FALSE") => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Bool(false)))
            }
            Tok::Ident(word) if word.eq_ignore_ascii_case("Device") => {
                let call = self.device_call()?;
                if !call.func.returns_value() {
                    return Err(CompileError::at(
                        line,
                        format!("{} does not return a value", call.func),
                    ));
                }
                Ok(Expr::Device(call))
            }
            Tok::Ident(word) if self.peek_at(1).is_some_and(|t| t.tok == Tok::LParen) => {
                let func = Builtin::parse(word)
                    .ok_or_else(|| CompileError::at(line, format!("Unknown function '{word}'")))?;
                self.pos += 1;
                let args = self.arguments()?;
                if args.len() != func.arity() {
                    return Err(CompileError::at(
                        line,
                        format!(
                            "{} expects {} argument(s), got {}",
                            word.to_ascii_uppercase(),
                            func.arity(),
                            args.len()
                        ),
                    ));
                }
                Ok(Expr::Builtin { func, args })
            }
            Tok::Ident(word) if is_reserved(word) => Err(CompileError::at(
                line,
                format!("Unexpected '{word}' in expression"),
            )),
            Tok::Ident(word) => {
                let written = word.clone();
                self.pos += 1;
                if self.peek_tok(&Tok::Dot) {
                    self.pos += 1;
                    let member = match self.advance().map(|t| &t.tok) {
                        Some(Tok::Ident(m)) => m.clone(),
                        _ => {
                            return Err(CompileError::at(
                                line,
                                format!("Expected member name after '{written}.'"),
                            ));
                        }
                    };
                    if !member.eq_ignore_ascii_case("stepTime") {
                        return Err(CompileError::at(
                            line,
                            format!("Unsupported member access '{written}.{member}'"),
                        ));
                    }
                    let key = self.record_use(&written, line, true);
                    return Ok(Expr::StepTime(key));
                }
                let key = self.record_use(&written, line, false);
                Ok(Expr::Var(key))
            }
            _ => Err(CompileError::at(
                line,
                format!("Unexpected {} in expression", self.describe_current()),
            )),
        }
    }

    /// Operator chains are parsed in a loop, so their height is checked here
    fn binary(&self, op: BinaryOp, lhs: Expr, rhs: Expr) -> Result<Expr, CompileError> {
        if 1 + lhs.depth().max(rhs.depth()) > MAX_NESTING {
            return Err(CompileError::at(self.line(), "Expression nested too deeply"));
        }
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }
}

fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|kw| kw.eq_ignore_ascii_case(word))
}

fn symbol(tok: &Tok) -> &'static str {
    match tok {
        Tok::Assign => ":=",
        Tok::Colon => ":",
        Tok::Semi => ";",
        Tok::Comma => ",",
        Tok::Dot => ".",
        Tok::LParen => "(",
        Tok::RParen => ")",
        Tok::Eq => "=",
        Tok::Ne => "<>",
        Tok::Lt => "<",
        Tok::Le => "<=",
        Tok::Gt => ">",
        Tok::Ge => ">=",
        Tok::Plus => "+",
        Tok::Minus => "-",
        Tok::Star => "*",
        Tok::Slash => "/",
        Tok::Ident(_) | Tok::Int(_) | Tok::Real(_) | Tok::Str(_) => "token",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deep_parentheses_are_a_compile_error() {
        let depth = 100_000;
        let source = format!(
            "VAR x : INT; END_VAR\nx := {}1{};",
            "(".repeat(depth),
            ")".repeat(depth)
        );
        let err = compile(&source).unwrap_err();
        assert_eq!(err.message, "Expression nested too deeply");
        assert_eq!(err.line, Some(2));

        let shallow = format!("VAR x : INT; END_VAR\nx := {}1{};", "(".repeat(50), ")".repeat(50));
        assert!(compile(&shallow).is_ok());
    }

    #[test]
    fn test_long_operator_chains_are_bounded() {
        let chain = vec!["1"; 10_000].join(" + ");
        let err = compile(&format!("VAR x : INT; END_VAR\nx := {chain};")).unwrap_err();
        assert_eq!(err.message, "Expression nested too deeply");

        let nots = "NOT ".repeat(10_000);
        let err = compile(&format!("VAR b : BOOL; END_VAR\nb := {nots}TRUE;")).unwrap_err();
        assert_eq!(err.message, "Expression nested too deeply");

        let short = vec!["1"; 100].join(" + ");
        assert!(compile(&format!("VAR x : INT; END_VAR\nx := {short};")).is_ok());
    }

    #[test]
    fn test_deeply_nested_blocks_are_a_compile_error() {
        let depth = 10_000;
        let source = format!(
            "VAR b : BOOL; END_VAR\n{}b := TRUE;\n{}",
            "IF b THEN\n".repeat(depth),
            "END_IF;\n".repeat(depth)
        );
        assert!(compile(&source).is_err());
    }

    #[test]
    fn test_statements_carry_lines() {
        let program = compile(
            "VAR\n  x : INT := 0;\nEND_VAR\nIF x = 0 THEN\n  x := 1;\nELSIF x = 1 THEN\n  x := 2;\nEND_IF;\n",
        )
        .unwrap();
        assert_eq!(program.vars.len(), 1);
        assert_eq!(program.body.len(), 1);
        let stmt = &program.body[0];
        assert_eq!(stmt.line, 4);
        match &stmt.kind {
            StmtKind::If { branches, otherwise } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(branches[0].1[0].line, 5);
                assert_eq!(branches[1].1[0].line, 7);
                assert!(otherwise.is_none());
            }
            other => panic!("expected IF, got {other:?}"),
        }
    }

    #[test]
    fn test_unterminated_if_reports_header_line() {
        let err = compile("VAR x : BOOL; END_VAR\nIF x THEN\n  x := FALSE;\n").unwrap_err();
        assert_eq!(err.line, Some(2));
        assert!(err.message.contains("END_IF"));
    }

    #[test]
    fn test_unterminated_var_block() {
        let err = compile("VAR\n x : INT;\n").unwrap_err();
        assert_eq!(err.line, Some(1));
        assert!(err.message.contains("END_VAR"));
    }

    #[test]
    fn test_malformed_var_entry() {
        let err = compile("VAR\n x INT;\nEND_VAR").unwrap_err();
        assert_eq!(err.line, Some(2));
        assert_eq!(err.message, "Malformed VAR entry");
    }

    #[test]
    fn test_unknown_device_function() {
        let err = compile("VAR x : INT; END_VAR\nx := Device.ReadSomething(3);").unwrap_err();
        assert_eq!(err.line, Some(2));
        assert!(err.message.contains("Device.ReadSomething"));
    }

    #[test]
    fn test_device_arity_is_checked() {
        let err = compile("Device.WriteCoil(1);").unwrap_err();
        assert!(err.message.contains("expects 2"));
    }

    #[test]
    fn test_write_call_is_not_an_expression() {
        let err = compile("VAR x : INT; END_VAR\nx := Device.WriteRegister(1, 2);").unwrap_err();
        assert!(err.message.contains("does not return a value"));
    }

    #[test]
    fn test_undeclared_variable() {
        let err = compile("y := 1;").unwrap_err();
        assert_eq!(err.line, Some(1));
        assert!(err.message.contains("'y'"));
    }

    #[test]
    fn test_step_time_only_on_state_constants() {
        assert!(
            compile(
                "VAR STATE : INT := 0; STATE_RUN : INT := 1; t : INT; END_VAR\nt := STATE_RUN.stepTime;"
            )
            .is_ok()
        );
        let err = compile("VAR x : INT; t : INT; END_VAR\nt := x.stepTime;").unwrap_err();
        assert!(err.message.contains("stepTime"));
    }

    #[test]
    fn test_mod_infix_and_function() {
        let program =
            compile("VAR a : INT; b : INT; END_VAR\na := 7 MOD 3;\nb := MOD(7, 3);").unwrap();
        assert_eq!(program.body.len(), 2);
    }

    #[test]
    fn test_keywords_are_case_insensitive() {
        let program = compile("var x : bool; end_var\nif not x then x := true; end_if").unwrap();
        assert_eq!(program.body.len(), 1);
        assert!(program.var("X").is_some());
    }

    #[test]
    fn test_condition_rejects_device_calls() {
        let program = compile("VAR x : INT; END_VAR").unwrap();
        assert!(compile_condition(&program, "x > 3").is_ok());
        assert!(compile_condition(&program, "Device.ReadRegister(1) > 3").is_err());
        assert!(compile_condition(&program, "missing = 1").is_err());
    }
}
