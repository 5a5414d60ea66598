//! Recursive descent parser for FedGov script.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! module     = fn_def*
//! fn_def     = "fn" IDENT "(" params? ")" ("->" IDENT)? block
//! block      = "{" stmt* "}"
//! expr       = and ("or" and)*
//! and        = not ("and" not)*
//! not        = "not" not | comparison
//! comparison = additive (cmp_op additive)?
//! additive   = term (("+" | "-") term)*
//! term       = unary (("*" | "/" | "%") unary)*
//! unary      = "-" unary | postfix
//! postfix    = primary ("[" expr "]")*
//! ```
//!
//! Nesting is bounded by [`MAX_NESTING`]: every block, sub-expression and
//! chained operator counts one level, so later tree walks stay shallow.

use std::collections::BTreeSet;

use super::ast::{Arg, BinaryOp, Expr, FnDef, Module, Stmt, UnaryOp};
use super::lexer::{Lexer, Token, TokenKind};
use super::{ScriptError, ScriptResult};

pub const MAX_NESTING: usize = 256;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    /// Parse source text into a module of top-level functions.
    pub fn parse(input: &str) -> ScriptResult<Module> {
        let tokens = Lexer::new(input).tokenize()?;
        let mut parser = Self {
            tokens,
            pos: 0,
            depth: 0,
        };
        parser.parse_module()
    }

    fn parse_module(&mut self) -> ScriptResult<Module> {
        let mut items = Vec::new();
        while !self.check(&TokenKind::Eof) {
            if !self.check(&TokenKind::Fn) {
                return Err(self.unexpected("`fn` at top level"));
            }
            items.push(self.parse_fn()?);
        }
        Ok(Module { items })
    }

    fn parse_fn(&mut self) -> ScriptResult<FnDef> {
        self.expect(TokenKind::Fn)?;
        let name = self.expect_ident()?;
        self.expect(TokenKind::LParen)?;

        let mut params = Vec::new();
        let mut seen = BTreeSet::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                let param = self.expect_ident()?;
                if !seen.insert(param.clone()) {
                    return Err(ScriptError::DuplicateParameter {
                        function: name,
                        param,
                    });
                }
                params.push(param);
                if !self.eat(&TokenKind::Comma) || self.check(&TokenKind::RParen) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;

        let returns = if self.eat(&TokenKind::Arrow) {
            Some(self.expect_ident()?)
        } else {
            None
        };
        let body = self.parse_block()?;
        Ok(FnDef {
            name,
            params,
            returns,
            body,
        })
    }

    fn parse_block(&mut self) -> ScriptResult<Vec<Stmt>> {
        self.nested(|parser| {
            parser.expect(TokenKind::LBrace)?;
            let mut stmts = Vec::new();
            while !parser.check(&TokenKind::RBrace) {
                if parser.check(&TokenKind::Eof) {
                    return Err(parser.unexpected("`}`"));
                }
                stmts.push(parser.parse_stmt()?);
            }
            parser.expect(TokenKind::RBrace)?;
            Ok(stmts)
        })
    }

    fn parse_stmt(&mut self) -> ScriptResult<Stmt> {
        match self.peek().kind {
            TokenKind::Let => {
                self.advance();
                let name = self.expect_ident()?;
                self.expect(TokenKind::Assign)?;
                let value = self.parse_expr()?;
                self.expect(TokenKind::Semi)?;
                Ok(Stmt::Let { name, value })
            }
            TokenKind::If => self.parse_if(),
            TokenKind::For => {
                self.advance();
                let var = self.expect_ident()?;
                self.expect(TokenKind::In)?;
                let iter = self.parse_expr()?;
                let body = self.parse_block()?;
                Ok(Stmt::For { var, iter, body })
            }
            TokenKind::While => {
                self.advance();
                let cond = self.parse_expr()?;
                let body = self.parse_block()?;
                Ok(Stmt::While { cond, body })
            }
            TokenKind::Return => {
                self.advance();
                let value = if self.check(&TokenKind::Semi) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(TokenKind::Semi)?;
                Ok(Stmt::Return(value))
            }
            TokenKind::Break => {
                self.advance();
                self.expect(TokenKind::Semi)?;
                Ok(Stmt::Break)
            }
            TokenKind::Continue => {
                self.advance();
                self.expect(TokenKind::Semi)?;
                Ok(Stmt::Continue)
            }
            TokenKind::Fn => Ok(Stmt::Fn(self.parse_fn()?)),
            _ => {
                let start = self.peek().clone();
                let expr = self.parse_expr()?;
                if self.eat(&TokenKind::Assign) {
                    let (name, indices) = assignment_target(expr).ok_or_else(|| {
                        ScriptError::Syntax {
                            line: start.line,
                            col: start.col,
                            message: "invalid assignment target".into(),
                        }
                    })?;
                    let value = self.parse_expr()?;
                    self.expect(TokenKind::Semi)?;
                    Ok(Stmt::Assign {
                        name,
                        indices,
                        value,
                    })
                } else {
                    self.expect(TokenKind::Semi)?;
                    Ok(Stmt::Expr(expr))
                }
            }
        }
    }

    fn parse_if(&mut self) -> ScriptResult<Stmt> {
        self.nested(|parser| {
            parser.expect(TokenKind::If)?;
            let cond = parser.parse_expr()?;
            let then_body = parser.parse_block()?;
            let else_body = if parser.eat(&TokenKind::Else) {
                if parser.check(&TokenKind::If) {
                    Some(vec![parser.parse_if()?])
                } else {
                    Some(parser.parse_block()?)
                }
            } else {
                None
            };
            Ok(Stmt::If {
                cond,
                then_body,
                else_body,
            })
        })
    }

    // ── Expressions ─────────────────────────────────────────────────

    pub(crate) fn parse_expr(&mut self) -> ScriptResult<Expr> {
        self.nested(|parser| {
            let mut lhs = parser.parse_and()?;
            while parser.eat(&TokenKind::Or) {
                parser.descend()?;
                let rhs = parser.parse_and()?;
                lhs = binary(BinaryOp::Or, lhs, rhs);
            }
            Ok(lhs)
        })
    }

    fn parse_and(&mut self) -> ScriptResult<Expr> {
        let mut lhs = self.parse_not()?;
        while self.eat(&TokenKind::And) {
            self.descend()?;
            let rhs = self.parse_not()?;
            lhs = binary(BinaryOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> ScriptResult<Expr> {
        if self.eat(&TokenKind::Not) {
            let expr = self.nested(Self::parse_not)?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> ScriptResult<Expr> {
        let lhs = self.parse_additive()?;
        let Some(op) = comparison_op(&self.peek().kind) else {
            return Ok(lhs);
        };
        self.advance();
        let rhs = self.parse_additive()?;
        if comparison_op(&self.peek().kind).is_some() {
            return Err(self.unexpected("end of comparison (comparisons do not chain)"));
        }
        Ok(binary(op, lhs, rhs))
    }

    fn parse_additive(&mut self) -> ScriptResult<Expr> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            self.descend()?;
            let rhs = self.parse_term()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_term(&mut self) -> ScriptResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Rem,
                _ => return Ok(lhs),
            };
            self.advance();
            self.descend()?;
            let rhs = self.parse_unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_unary(&mut self) -> ScriptResult<Expr> {
        if self.eat(&TokenKind::Minus) {
            let expr = self.nested(Self::parse_unary)?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(expr),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> ScriptResult<Expr> {
        let mut expr = self.parse_primary()?;
        while self.eat(&TokenKind::LBracket) {
            self.descend()?;
            let index = self.parse_expr()?;
            self.expect(TokenKind::RBracket)?;
            expr = Expr::index(expr, index);
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> ScriptResult<Expr> {
        let token = self.advance().clone();
        match token.kind {
            TokenKind::Int(value) => Ok(Expr::Int(value)),
            TokenKind::Float(value) => Ok(Expr::Float(value)),
            TokenKind::Str(value) => Ok(Expr::Str(value)),
            TokenKind::True => Ok(Expr::Bool(true)),
            TokenKind::False => Ok(Expr::Bool(false)),
            TokenKind::None => Ok(Expr::None),
            TokenKind::LParen => {
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                let items = self.parse_list(TokenKind::RBracket, Self::parse_expr)?;
                Ok(Expr::List(items))
            }
            TokenKind::LBrace => {
                let entries = self.parse_list(TokenKind::RBrace, |parser| {
                    let key = parser.parse_expr()?;
                    parser.expect(TokenKind::Colon)?;
                    let value = parser.parse_expr()?;
                    Ok((key, value))
                })?;
                Ok(Expr::Map(entries))
            }
            TokenKind::Ident(name) => {
                if self.eat(&TokenKind::LParen) {
                    let args = self.parse_call_args()?;
                    Ok(Expr::Call { callee: name, args })
                } else {
                    Ok(Expr::Name(name))
                }
            }
            other => Err(ScriptError::Syntax {
                line: token.line,
                col: token.col,
                message: format!("expected expression, found {other}"),
            }),
        }
    }

    /// Comma separated items up to `close`, trailing comma allowed. The
    /// opening delimiter has already been consumed.
    fn parse_list<T>(
        &mut self,
        close: TokenKind,
        mut item: impl FnMut(&mut Self) -> ScriptResult<T>,
    ) -> ScriptResult<Vec<T>> {
        let mut items = Vec::new();
        while !self.check(&close) {
            items.push(item(self)?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(close)?;
        Ok(items)
    }

    fn parse_call_args(&mut self) -> ScriptResult<Vec<Arg>> {
        let mut args = Vec::new();
        let mut seen_keyword = false;
        while !self.check(&TokenKind::RParen) {
            let is_keyword = matches!(self.peek().kind, TokenKind::Ident(_))
                && self.peek_next().kind == TokenKind::Assign;
            if is_keyword {
                let name = self.expect_ident()?;
                self.expect(TokenKind::Assign)?;
                args.push(Arg::Keyword(name, self.parse_expr()?));
                seen_keyword = true;
            } else if seen_keyword {
                return Err(self.unexpected("keyword argument after a keyword argument"));
            } else {
                args.push(Arg::Positional(self.parse_expr()?));
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(args)
    }

    // ── Helpers ──────────────────────────────────────────────────────

    /// Runs `parse` one level deeper. Levels taken by chained operators
    /// inside it are released on return.
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> ScriptResult<T>) -> ScriptResult<T> {
        let mark = self.depth;
        self.descend()?;
        let result = parse(self);
        self.depth = mark;
        result
    }

    fn descend(&mut self) -> ScriptResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            Err(ScriptError::NestingTooDeep { limit: MAX_NESTING })
        } else {
            Ok(())
        }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_next(&self) -> &Token {
        &self.tokens[(self.pos + 1).min(self.tokens.len() - 1)]
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn advance(&mut self) -> &Token {
        let index = self.pos.min(self.tokens.len() - 1);
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        &self.tokens[index]
    }

    fn expect(&mut self, kind: TokenKind) -> ScriptResult<&Token> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&kind.to_string()))
        }
    }

    fn expect_ident(&mut self) -> ScriptResult<String> {
        match &self.peek().kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn unexpected(&self, expected: &str) -> ScriptError {
        let token = self.peek();
        ScriptError::Syntax {
            line: token.line,
            col: token.col,
            message: format!("expected {expected}, found {}", token.kind),
        }
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

fn comparison_op(kind: &TokenKind) -> Option<BinaryOp> {
    match kind {
        TokenKind::Eq => Some(BinaryOp::Eq),
        TokenKind::NotEq => Some(BinaryOp::NotEq),
        TokenKind::Lt => Some(BinaryOp::Lt),
        TokenKind::Le => Some(BinaryOp::Le),
        TokenKind::Gt => Some(BinaryOp::Gt),
        TokenKind::Ge => Some(BinaryOp::Ge),
        TokenKind::In => Some(BinaryOp::In),
        _ => None,
    }
}

/// Flattens `name[a][b]` into `("name", [a, b])`.
fn assignment_target(expr: Expr) -> Option<(String, Vec<Expr>)> {
    match expr {
        Expr::Name(name) => Some((name, Vec::new())),
        Expr::Index { target, index } => {
            let (name, mut indices) = assignment_target(*target)?;
            indices.push(*index);
            Some((name, indices))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_fn(source: &str) -> FnDef {
        let mut module = Parser::parse(source).unwrap();
        assert_eq!(module.items.len(), 1);
        module.items.remove(0)
    }

    #[test]
    fn parses_a_function_with_annotation() {
        let def = single_fn("fn f(a, b,) -> Table { return a + b * 2; }");
        assert_eq!(def.name, "f");
        assert_eq!(def.params, vec!["a", "b"]);
        assert_eq!(def.returns.as_deref(), Some("Table"));
        assert_eq!(
            def.body,
            vec![Stmt::Return(Some(binary(
                BinaryOp::Add,
                Expr::name("a"),
                binary(BinaryOp::Mul, Expr::name("b"), Expr::Int(2)),
            )))]
        );
    }

    #[test]
    fn indexed_assignment_flattens_targets() {
        let def = single_fn(r#"fn f(m) { m["a"][0] = 1; }"#);
        assert_eq!(
            def.body,
            vec![Stmt::Assign {
                name: "m".into(),
                indices: vec![Expr::string("a"), Expr::Int(0)],
                value: Expr::Int(1),
            }]
        );
    }

    #[test]
    fn keyword_arguments_follow_positionals() {
        let def = single_fn("fn f(x) { return g(x, k = 2); fn g(a, k) { return a; } }");
        let Stmt::Return(Some(Expr::Call { callee, args })) = &def.body[0] else {
            panic!("expected call");
        };
        assert_eq!(callee, "g");
        assert_eq!(
            args,
            &vec![
                Arg::Positional(Expr::name("x")),
                Arg::Keyword("k".into(), Expr::Int(2))
            ]
        );

        let err = Parser::parse("fn f(x) { return g(k = 1, x); }").unwrap_err();
        assert!(matches!(err, ScriptError::Syntax { .. }));
    }

    #[test]
    fn else_if_nests_in_the_else_branch() {
        let def = single_fn("fn f(x) { if x { return 1; } else if not x { return 2; } }");
        let Stmt::If { else_body, .. } = &def.body[0] else {
            panic!("expected if");
        };
        assert!(matches!(
            else_body.as_deref(),
            Some([Stmt::If { else_body: None, .. }])
        ));
    }

    #[test]
    fn rejects_chained_comparisons_and_duplicate_params() {
        assert!(matches!(
            Parser::parse("fn f(a, b, c) { return a < b < c; }"),
            Err(ScriptError::Syntax { .. })
        ));
        assert_eq!(
            Parser::parse("fn f(a, a) { }").unwrap_err(),
            ScriptError::DuplicateParameter {
                function: "f".into(),
                param: "a".into()
            }
        );
    }

    #[test]
    fn deep_nesting_is_a_validation_error() {
        let parens = format!(
            "fn f() {{ return {}1{}; }}",
            "(".repeat(200_000),
            ")".repeat(200_000)
        );
        let chain = format!("fn f(x) {{ return x{}; }}", "[0]".repeat(200_000));
        let sum = format!("fn f() {{ return 1{}; }}", " + 1".repeat(200_000));
        let blocks = format!("fn f() {{ {}{} }}", "if true { ".repeat(5_000), "}".repeat(5_000));
        let negations = format!("fn f() {{ return {}1; }}", "-".repeat(200_000));
        for source in [parens, chain, sum, blocks, negations] {
            assert_eq!(
                Parser::parse(&source).unwrap_err(),
                ScriptError::NestingTooDeep { limit: MAX_NESTING }
            );
        }
    }

    #[test]
    fn ordinary_nesting_parses() {
        let source = format!("fn f() {{ return {}1{}; }}", "(".repeat(40), ")".repeat(40));
        assert_eq!(single_fn(&source).body, vec![Stmt::Return(Some(Expr::Int(1)))]);
    }

    #[test]
    fn rejects_statements_at_top_level() {
        let err = Parser::parse("let x = 1;").unwrap_err();
        assert_eq!(
            err,
            ScriptError::Syntax {
                line: 1,
                col: 1,
                message: "expected `fn` at top level, found `let`".into()
            }
        );
    }
}
