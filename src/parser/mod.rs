//! Recursive-descent statement parser with precedence climbing for
//! expressions.

pub mod ast;

use crate::error::{Line, LuaError, LuaResult};
use crate::lexer::{Lexer, Token, TokenKind};
use ast::*;

pub struct Parser<'a> {
    lex: Lexer<'a>,
    cur: Token,
    loop_depth: u32,
}

impl<'a> Parser<'a> {
    pub fn new(src: &'a [u8], chunk_name: impl Into<String>) -> LuaResult<Self> {
        let mut lex = Lexer::new(src, chunk_name);
        let cur = lex.next_token()?;
        Ok(Parser { lex, cur, loop_depth: 0 })
    }

    pub fn chunk_name(&self) -> &str {
        self.lex.chunk_name()
    }

    fn line(&self) -> Line {
        self.cur.line
    }

    fn err(&self, message: impl Into<String>) -> LuaError {
        LuaError::Parse {
            message: message.into(),
            line: self.cur.line,
        }
    }

    fn advance(&mut self) -> LuaResult<Token> {
        let next = self.lex.next_token()?;
        Ok(std::mem::replace(&mut self.cur, next))
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.cur.kind == kind
    }

    fn accept(&mut self, kind: &TokenKind) -> LuaResult<bool> {
        if self.check(kind) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, kind: TokenKind) -> LuaResult<Token> {
        if self.check(&kind) {
            self.advance()
        } else {
            Err(self.err(format!(
                "{} expected near {}",
                kind.describe(),
                self.cur.kind.describe()
            )))
        }
    }

    fn expect_name(&mut self) -> LuaResult<String> {
        match self.cur.kind.clone() {
            TokenKind::Name(n) => {
                self.advance()?;
                Ok(n)
            }
            other => Err(self.err(format!("<name> expected near {}", other.describe()))),
        }
    }

    /// Parses an entire chunk (a block followed by end-of-file).
    pub fn parse_chunk(&mut self) -> LuaResult<Block> {
        let block = self.parse_block()?;
        self.expect(TokenKind::Eof)?;
        Ok(block)
    }

    fn block_follows(&self) -> bool {
        matches!(
            self.cur.kind,
            TokenKind::Eof
                | TokenKind::End
                | TokenKind::Else
                | TokenKind::Elseif
                | TokenKind::Until
        )
    }

    fn parse_block(&mut self) -> LuaResult<Block> {
        let mut stats = Vec::new();
        while !self.block_follows() {
            if self.check(&TokenKind::Return) {
                stats.push(self.parse_return()?);
                break;
            }
            if let Some(s) = self.parse_stat()? {
                stats.push(s);
            }
        }
        Ok(Block { stats })
    }

    fn parse_return(&mut self) -> LuaResult<Stat> {
        let line = self.line();
        self.advance()?; // return
        let exprs = if self.block_follows() || self.check(&TokenKind::Semi) {
            Vec::new()
        } else {
            self.parse_expr_list()?
        };
        self.accept(&TokenKind::Semi)?;
        Ok(Stat::Return { exprs, line })
    }

    /// Returns `None` for a bare `;`, which produces no statement node.
    fn parse_stat(&mut self) -> LuaResult<Option<Stat>> {
        let line = self.line();
        Ok(Some(match self.cur.kind.clone() {
            TokenKind::Semi => {
                self.advance()?;
                return Ok(None);
            }
            TokenKind::DColon => {
                self.advance()?;
                let name = self.expect_name()?;
                self.expect(TokenKind::DColon)?;
                Stat::Label { name, line }
            }
            TokenKind::Break => {
                self.advance()?;
                if self.loop_depth == 0 {
                    return Err(self.err("break outside a loop"));
                }
                Stat::Break(line)
            }
            TokenKind::Goto => {
                self.advance()?;
                let label = self.expect_name()?;
                Stat::Goto { label, line }
            }
            TokenKind::Do => {
                self.advance()?;
                let body = self.parse_block()?;
                self.expect(TokenKind::End)?;
                Stat::Do(body)
            }
            TokenKind::While => {
                self.advance()?;
                let cond = self.parse_expr()?;
                self.expect(TokenKind::Do)?;
                self.loop_depth += 1;
                let body = self.parse_block()?;
                self.loop_depth -= 1;
                self.expect(TokenKind::End)?;
                Stat::While { cond, body, line }
            }
            TokenKind::Repeat => {
                self.advance()?;
                self.loop_depth += 1;
                let body = self.parse_block()?;
                self.loop_depth -= 1;
                self.expect(TokenKind::Until)?;
                let cond = self.parse_expr()?;
                Stat::Repeat { body, cond, line }
            }
            TokenKind::If => self.parse_if()?,
            TokenKind::For => self.parse_for()?,
            TokenKind::Function => self.parse_function_stat()?,
            TokenKind::Local => self.parse_local()?,
            _ => self.parse_expr_stat()?,
        }))
    }

    fn parse_if(&mut self) -> LuaResult<Stat> {
        let line = self.line();
        self.advance()?; // if
        let mut arms = Vec::new();
        let cond = self.parse_expr()?;
        self.expect(TokenKind::Then)?;
        let body = self.parse_block()?;
        arms.push((cond, body));
        while self.check(&TokenKind::Elseif) {
            self.advance()?;
            let cond = self.parse_expr()?;
            self.expect(TokenKind::Then)?;
            let body = self.parse_block()?;
            arms.push((cond, body));
        }
        let else_block = if self.accept(&TokenKind::Else)? {
            Some(self.parse_block()?)
        } else {
            None
        };
        self.expect(TokenKind::End)?;
        Ok(Stat::If { arms, else_block, line })
    }

    fn parse_for(&mut self) -> LuaResult<Stat> {
        let line = self.line();
        self.advance()?; // for
        let first = self.expect_name()?;
        if self.check(&TokenKind::Assign) {
            self.advance()?;
            let start = self.parse_expr()?;
            self.expect(TokenKind::Comma)?;
            let stop = self.parse_expr()?;
            let step = if self.accept(&TokenKind::Comma)? {
                Some(self.parse_expr()?)
            } else {
                None
            };
            self.expect(TokenKind::Do)?;
            self.loop_depth += 1;
            let body = self.parse_block()?;
            self.loop_depth -= 1;
            self.expect(TokenKind::End)?;
            Ok(Stat::NumericFor {
                var: first,
                start,
                stop,
                step,
                body,
                line,
            })
        } else {
            let mut names = vec![first];
            while self.accept(&TokenKind::Comma)? {
                names.push(self.expect_name()?);
            }
            self.expect(TokenKind::In)?;
            let exprs = self.parse_expr_list()?;
            self.expect(TokenKind::Do)?;
            self.loop_depth += 1;
            let body = self.parse_block()?;
            self.loop_depth -= 1;
            self.expect(TokenKind::End)?;
            Ok(Stat::GenericFor { names, exprs, body, line })
        }
    }

    fn parse_function_stat(&mut self) -> LuaResult<Stat> {
        let line = self.line();
        self.advance()?; // function
        let base = self.expect_name()?;
        let mut path = Vec::new();
        while self.accept(&TokenKind::Dot)? {
            path.push(self.expect_name()?);
        }
        let method = if self.accept(&TokenKind::Colon)? {
            Some(self.expect_name()?)
        } else {
            None
        };
        let display = {
            let mut s = base.clone();
            for p in &path {
                s.push('.');
                s.push_str(p);
            }
            if let Some(m) = &method {
                s.push(':');
                s.push_str(m);
            }
            s
        };
        let body = self.parse_func_body(method.is_some(), Some(display))?;
        Ok(Stat::FunctionDecl {
            name: FuncName { base, path, method },
            body,
            line,
        })
    }

    fn parse_local(&mut self) -> LuaResult<Stat> {
        let line = self.line();
        self.advance()?; // local
        if self.accept(&TokenKind::Function)? {
            let name = self.expect_name()?;
            let body = self.parse_func_body(false, Some(name.clone()))?;
            return Ok(Stat::LocalFunction { name, body, line });
        }
        let mut names = vec![self.expect_name()?];
        self.skip_attrib()?;
        while self.accept(&TokenKind::Comma)? {
            names.push(self.expect_name()?);
            self.skip_attrib()?;
        }
        let values = if self.accept(&TokenKind::Assign)? {
            self.parse_expr_list()?
        } else {
            Vec::new()
        };
        Ok(Stat::LocalAssign { names, values, line })
    }

    /// Lua 5.4 adds `<const>`/`<close>` attributes; 5.3 has none, but we
    /// tolerate and ignore them so a near-5.4 script doesn't just blow up
    /// on this one cosmetic difference.
    fn skip_attrib(&mut self) -> LuaResult<()> {
        if self.accept(&TokenKind::Lt)? {
            self.expect_name()?;
            self.expect(TokenKind::Gt)?;
        }
        Ok(())
    }

    fn parse_func_body(&mut self, is_method: bool, name: Option<String>) -> LuaResult<FuncBody> {
        let line = self.line();
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if is_method {
            params.push("self".to_string());
        }
        let mut is_vararg = false;
        if !self.check(&TokenKind::RParen) {
            loop {
                if self.accept(&TokenKind::Ellipsis)? {
                    is_vararg = true;
                    break;
                }
                params.push(self.expect_name()?);
                if !self.accept(&TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        let body = self.parse_block()?;
        let end_line = self.line();
        self.expect(TokenKind::End)?;
        Ok(FuncBody {
            params,
            is_vararg,
            body,
            line,
            end_line,
            name,
        })
    }

    /// An expression statement: either a (possibly multiple) assignment, or
    /// a bare function/method call.
    fn parse_expr_stat(&mut self) -> LuaResult<Stat> {
        let line = self.line();
        let first = self.parse_suffixed_expr()?;
        if self.check(&TokenKind::Assign) || self.check(&TokenKind::Comma) {
            let mut targets = vec![first];
            while self.accept(&TokenKind::Comma)? {
                targets.push(self.parse_suffixed_expr()?);
            }
            for t in &targets {
                if !matches!(t, Expr::Name(..) | Expr::Index { .. }) {
                    return Err(self.err("syntax error: cannot assign to this expression"));
                }
            }
            self.expect(TokenKind::Assign)?;
            let values = self.parse_expr_list()?;
            Ok(Stat::Assign { targets, values, line })
        } else {
            match &first {
                Expr::Call { .. } | Expr::MethodCall { .. } => Ok(Stat::ExprStat(first)),
                _ => Err(self.err("syntax error: expression statement must be a function call")),
            }
        }
    }

    fn parse_expr_list(&mut self) -> LuaResult<Vec<Expr>> {
        let mut exprs = vec![self.parse_expr()?];
        while self.accept(&TokenKind::Comma)? {
            exprs.push(self.parse_expr()?);
        }
        Ok(exprs)
    }

    // ---- expressions: precedence climbing ----

    fn parse_expr(&mut self) -> LuaResult<Expr> {
        self.parse_subexpr(0)
    }

    fn binop_of(kind: &TokenKind) -> Option<BinOp> {
        use TokenKind as T;
        Some(match kind {
            T::Plus => BinOp::Add,
            T::Minus => BinOp::Sub,
            T::Star => BinOp::Mul,
            T::Slash => BinOp::Div,
            T::DSlash => BinOp::IDiv,
            T::Percent => BinOp::Mod,
            T::Caret => BinOp::Pow,
            T::Concat => BinOp::Concat,
            T::Eq => BinOp::Eq,
            T::Ne => BinOp::Ne,
            T::Lt => BinOp::Lt,
            T::Le => BinOp::Le,
            T::Gt => BinOp::Gt,
            T::Ge => BinOp::Ge,
            T::And => BinOp::And,
            T::Or => BinOp::Or,
            T::Amp => BinOp::BAnd,
            T::Pipe => BinOp::BOr,
            T::Tilde => BinOp::BXor,
            T::LShift => BinOp::Shl,
            T::RShift => BinOp::Shr,
            _ => return None,
        })
    }

    /// `(left binding power, right binding power)`, matching Lua's own
    /// `priority` table in `lparser.c`.
    fn binop_priority(op: BinOp) -> (u8, u8) {
        use BinOp::*;
        match op {
            Or => (1, 1),
            And => (2, 2),
            Lt | Gt | Le | Ge | Ne | Eq => (3, 3),
            BOr => (4, 4),
            BXor => (5, 5),
            BAnd => (6, 6),
            Shl | Shr => (7, 7),
            Concat => (9, 8),
            Add | Sub => (10, 10),
            Mul | Mod | Div | IDiv => (11, 11),
            Pow => (14, 13),
        }
    }

    const UNARY_PRIORITY: u8 = 12;

    fn parse_subexpr(&mut self, limit: u8) -> LuaResult<Expr> {
        let line = self.line();
        let mut left = if let Some(unop) = self.unop_of(&self.cur.kind) {
            self.advance()?;
            let operand = self.parse_subexpr(Self::UNARY_PRIORITY)?;
            Expr::Unop {
                op: unop,
                operand: Box::new(operand),
                line,
            }
        } else {
            self.parse_simple_expr()?
        };

        while let Some(op) = Self::binop_of(&self.cur.kind) {
            let (left_pri, right_pri) = Self::binop_priority(op);
            if left_pri <= limit {
                break;
            }
            let line = self.line();
            self.advance()?;
            let rhs = self.parse_subexpr(right_pri)?;
            left = Expr::Binop {
                op,
                lhs: Box::new(left),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(left)
    }

    fn unop_of(&self, kind: &TokenKind) -> Option<UnOp> {
        match kind {
            TokenKind::Minus => Some(UnOp::Neg),
            TokenKind::Not => Some(UnOp::Not),
            TokenKind::Hash => Some(UnOp::Len),
            TokenKind::Tilde => Some(UnOp::BNot),
            _ => None,
        }
    }

    fn parse_simple_expr(&mut self) -> LuaResult<Expr> {
        let line = self.line();
        match self.cur.kind.clone() {
            TokenKind::Int(n) => {
                self.advance()?;
                Ok(Expr::Int(n, line))
            }
            TokenKind::Float(n) => {
                self.advance()?;
                Ok(Expr::Float(n, line))
            }
            TokenKind::Str(s) => {
                self.advance()?;
                Ok(Expr::Str(s, line))
            }
            TokenKind::Nil => {
                self.advance()?;
                Ok(Expr::Nil(line))
            }
            TokenKind::True => {
                self.advance()?;
                Ok(Expr::True(line))
            }
            TokenKind::False => {
                self.advance()?;
                Ok(Expr::False(line))
            }
            TokenKind::Ellipsis => {
                self.advance()?;
                Ok(Expr::Vararg(line))
            }
            TokenKind::Function => {
                self.advance()?;
                let body = self.parse_func_body(false, None)?;
                Ok(Expr::Function(body))
            }
            TokenKind::LBrace => self.parse_table(),
            _ => self.parse_suffixed_expr(),
        }
    }

    fn parse_primary_expr(&mut self) -> LuaResult<Expr> {
        let line = self.line();
        match self.cur.kind.clone() {
            TokenKind::LParen => {
                self.advance()?;
                let e = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(Expr::Paren(Box::new(e)))
            }
            TokenKind::Name(n) => {
                self.advance()?;
                Ok(Expr::Name(n, line))
            }
            other => Err(self.err(format!("unexpected symbol near {}", other.describe()))),
        }
    }

    fn parse_suffixed_expr(&mut self) -> LuaResult<Expr> {
        let mut e = self.parse_primary_expr()?;
        loop {
            let line = self.line();
            match self.cur.kind.clone() {
                TokenKind::Dot => {
                    self.advance()?;
                    let name = self.expect_name()?;
                    e = Expr::Index {
                        obj: Box::new(e),
                        key: Box::new(Expr::Str(name.into_bytes(), line)),
                        line,
                    };
                }
                TokenKind::LBracket => {
                    self.advance()?;
                    let key = self.parse_expr()?;
                    self.expect(TokenKind::RBracket)?;
                    e = Expr::Index {
                        obj: Box::new(e),
                        key: Box::new(key),
                        line,
                    };
                }
                TokenKind::Colon => {
                    self.advance()?;
                    let method = self.expect_name()?;
                    let args = self.parse_call_args()?;
                    e = Expr::MethodCall {
                        obj: Box::new(e),
                        method,
                        args,
                        line,
                    };
                }
                TokenKind::LParen | TokenKind::Str(_) | TokenKind::LBrace => {
                    let args = self.parse_call_args()?;
                    e = Expr::Call {
                        func: Box::new(e),
                        args,
                        line,
                    };
                }
                _ => break,
            }
        }
        Ok(e)
    }

    fn parse_call_args(&mut self) -> LuaResult<Vec<Expr>> {
        let line = self.line();
        match self.cur.kind.clone() {
            TokenKind::LParen => {
                self.advance()?;
                let args = if self.check(&TokenKind::RParen) {
                    Vec::new()
                } else {
                    self.parse_expr_list()?
                };
                self.expect(TokenKind::RParen)?;
                Ok(args)
            }
            TokenKind::Str(s) => {
                self.advance()?;
                Ok(vec![Expr::Str(s, line)])
            }
            TokenKind::LBrace => Ok(vec![self.parse_table()?]),
            other => Err(self.err(format!("function arguments expected near {}", other.describe()))),
        }
    }

    fn parse_table(&mut self) -> LuaResult<Expr> {
        let line = self.line();
        self.expect(TokenKind::LBrace)?;
        let mut fields = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            match self.cur.kind.clone() {
                TokenKind::LBracket => {
                    self.advance()?;
                    let key = self.parse_expr()?;
                    self.expect(TokenKind::RBracket)?;
                    self.expect(TokenKind::Assign)?;
                    let value = self.parse_expr()?;
                    fields.push(TableField::Indexed(key, value));
                }
                TokenKind::Name(n) if self.peek_is_assign_after_name() => {
                    self.advance()?; // name
                    self.advance()?; // =
                    let value = self.parse_expr()?;
                    fields.push(TableField::Named(n, value));
                }
                _ => {
                    let value = self.parse_expr()?;
                    fields.push(TableField::Positional(value));
                }
            }
            if !self.accept(&TokenKind::Comma)? && !self.accept(&TokenKind::Semi)? {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Expr::Table { fields, line })
    }

    /// Table constructors need one token of lookahead to distinguish
    /// `{ name = expr }` from `{ name }` (a bare positional name). We peek
    /// by cloning the lexer's position via a fresh token pull; since the
    /// lexer is a simple cursor, the cheapest correct approach is to
    /// tentatively lex the next token and remember it.
    fn peek_is_assign_after_name(&mut self) -> bool {
        // `cur` is the Name token; we need to know if the token after it is `=`.
        // We look past it without permanently consuming by snapshotting the
        // lexer's byte position and line, which `Lexer` exposes indirectly
        // through cloning (Lexer holds only Copy-able cursor state plus a
        // borrowed slice, so cloning is cheap and exact).
        let mut probe = self.lex.clone();
        probe
            .next_token()
            .map(|t| t.kind == TokenKind::Assign)
            .unwrap_or(false)
    }
}
