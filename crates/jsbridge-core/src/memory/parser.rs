//! Recursive-descent parser for the script subset.
//!
//! Statements: `var`/`let`/`const`, function declarations, `if`, `while`,
//! `for`, `return`, `break`, `continue`, `throw`, blocks and expressions.
//! Semicolons may be omitted before a newline, a `}` or the end of input.

use std::rc::Rc;

use super::ast::{
    AssignOp, BinaryOp, Expr, ExprKind, FunctionDef, LogicalOp, Name, Program, Stmt, StmtKind,
    UnaryOp,
};
use super::lexer::{Pos, SyntaxError, Token, TokenKind, tokenize};

const KEYWORDS: &[&str] = &[
    "var", "let", "const", "function", "return", "if", "else", "while", "for", "break",
    "continue", "throw", "try", "catch", "finally", "new", "typeof", "delete", "void", "true",
    "false", "null", "this",
];

type ParseResult<T> = Result<T, SyntaxError>;

/// Parse `source`, rejecting scripts nested deeper than `max_depth`
/// statements and expression operators.
pub(crate) fn parse_program(
    source: &str,
    document: &str,
    max_depth: usize,
) -> ParseResult<Program> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        index: 0,
        depth: 0,
        max_depth,
        document: Rc::from(document),
        source: Rc::from(source),
    };
    let mut body = Vec::new();
    while !parser.at_eof() {
        body.push(parser.statement()?);
    }
    Ok(Program {
        body,
        source: parser.source,
    })
}

struct Parser {
    tokens: Vec<Token>,
    index: usize,
    /// Open statements, operator chain links and unary prefixes.
    depth: usize,
    max_depth: usize,
    document: Name,
    source: Name,
}

impl Parser {
    // ── token cursor ─────────────────────────────────────────

    fn peek(&self) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.index.min(last)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn pos(&self) -> Pos {
        self.peek().pos
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.index < self.tokens.len() {
            self.index += 1;
        }
        token
    }

    fn is_punct(&self, punct: &str) -> bool {
        matches!(self.peek_kind(), TokenKind::Punct(p) if *p == punct)
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek_kind(), TokenKind::Ident(name) if name == keyword)
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if self.is_punct(punct) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> ParseResult<()> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(SyntaxError::new(format!("Expected '{punct}'"), self.pos()))
        }
    }

    fn unexpected(&self) -> SyntaxError {
        let token = self.peek();
        match &token.kind {
            TokenKind::Eof => SyntaxError::new("Unexpected end of script", token.pos),
            other => SyntaxError::new(format!("Unexpected token {other}"), token.pos),
        }
    }

    fn identifier(&mut self) -> ParseResult<Name> {
        let name: Option<Name> = match self.peek_kind() {
            TokenKind::Ident(name) if !KEYWORDS.contains(&name.as_str()) => {
                Some(Rc::from(name.as_str()))
            }
            _ => None,
        };
        let name = name.ok_or_else(|| SyntaxError::new("Expected identifier", self.pos()))?;
        self.advance();
        Ok(name)
    }

    /// Property names after `.` and in object literals may be keywords.
    fn property_name(&mut self) -> ParseResult<Name> {
        let name: Name = match self.peek_kind() {
            TokenKind::Ident(name) | TokenKind::Str(name) => Rc::from(name.as_str()),
            TokenKind::Number(n) => Rc::from(n.to_string().as_str()),
            _ => return Err(SyntaxError::new("Expected identifier", self.pos())),
        };
        self.advance();
        Ok(name)
    }

    /// One more level of nesting. A parse error abandons the whole script,
    /// so only successful paths give the level back.
    fn descend(&mut self) -> ParseResult<()> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(SyntaxError::new("Script is nested too deeply", self.pos()));
        }
        Ok(())
    }

    fn consume_semicolon(&mut self) -> ParseResult<()> {
        if self.eat_punct(";") || self.is_punct("}") || self.peek().newline_before {
            return Ok(());
        }
        Err(SyntaxError::new("Expected ';'", self.pos()))
    }

    // ── statements ───────────────────────────────────────────

    fn statement(&mut self) -> ParseResult<Stmt> {
        self.descend()?;
        let stmt = self.statement_inner()?;
        self.depth -= 1;
        Ok(stmt)
    }

    fn statement_inner(&mut self) -> ParseResult<Stmt> {
        let pos = self.pos();
        let kind = match self.peek_kind().clone() {
            TokenKind::Punct("{") => StmtKind::Block(self.block()?),
            TokenKind::Punct(";") => {
                self.advance();
                StmtKind::Empty
            }
            TokenKind::Ident(word) => match word.as_str() {
                "var" | "let" | "const" => {
                    let kind = self.var_declaration()?;
                    self.consume_semicolon()?;
                    kind
                }
                "function" => {
                    self.advance();
                    let def = self.function_rest(true, pos)?;
                    StmtKind::Function(def)
                }
                "return" => {
                    self.advance();
                    let value = if self.is_punct(";")
                        || self.is_punct("}")
                        || self.peek().newline_before
                    {
                        None
                    } else {
                        Some(self.expression()?)
                    };
                    self.consume_semicolon()?;
                    StmtKind::Return(value)
                }
                "if" => {
                    self.advance();
                    self.expect_punct("(")?;
                    let test = self.expression()?;
                    self.expect_punct(")")?;
                    let then = Box::new(self.statement()?);
                    let otherwise = if self.is_keyword("else") {
                        self.advance();
                        Some(Box::new(self.statement()?))
                    } else {
                        None
                    };
                    StmtKind::If {
                        test,
                        then,
                        otherwise,
                    }
                }
                "while" => {
                    self.advance();
                    self.expect_punct("(")?;
                    let test = self.expression()?;
                    self.expect_punct(")")?;
                    StmtKind::While {
                        test,
                        body: Box::new(self.statement()?),
                    }
                }
                "for" => self.for_statement()?,
                "break" | "continue" => {
                    let is_break = word == "break";
                    self.advance();
                    self.consume_semicolon()?;
                    if is_break {
                        StmtKind::Break
                    } else {
                        StmtKind::Continue
                    }
                }
                "throw" => {
                    self.advance();
                    if self.peek().newline_before {
                        return Err(SyntaxError::new("Expected expression", self.pos()));
                    }
                    let value = self.expression()?;
                    self.consume_semicolon()?;
                    StmtKind::Throw(value)
                }
                "try" => self.try_statement()?,
                _ => self.expression_statement()?,
            },
            _ => self.expression_statement()?,
        };
        Ok(Stmt { kind, pos })
    }

    fn expression_statement(&mut self) -> ParseResult<StmtKind> {
        let expr = self.expression()?;
        self.consume_semicolon()?;
        Ok(StmtKind::Expr(expr))
    }

    fn block(&mut self) -> ParseResult<Vec<Stmt>> {
        self.expect_punct("{")?;
        let mut body = Vec::new();
        while !self.is_punct("}") {
            if self.at_eof() {
                return Err(SyntaxError::new("Expected '}'", self.pos()));
            }
            body.push(self.statement()?);
        }
        self.advance();
        Ok(body)
    }

    fn var_declaration(&mut self) -> ParseResult<StmtKind> {
        self.advance();
        let mut declarations = Vec::new();
        loop {
            let name = self.identifier()?;
            let init = if self.eat_punct("=") {
                Some(self.assignment()?)
            } else {
                None
            };
            declarations.push((name, init));
            if !self.eat_punct(",") {
                return Ok(StmtKind::Var(declarations));
            }
        }
    }

    fn try_statement(&mut self) -> ParseResult<StmtKind> {
        self.advance();
        let block = self.block()?;
        let handler = if self.is_keyword("catch") {
            self.advance();
            self.expect_punct("(")?;
            let param = self.identifier()?;
            self.expect_punct(")")?;
            Some((param, self.block()?))
        } else {
            None
        };
        let finalizer = if self.is_keyword("finally") {
            self.advance();
            Some(self.block()?)
        } else {
            None
        };
        if handler.is_none() && finalizer.is_none() {
            return Err(SyntaxError::new("Expected 'catch'", self.pos()));
        }
        Ok(StmtKind::Try {
            block,
            handler,
            finalizer,
        })
    }

    fn for_statement(&mut self) -> ParseResult<StmtKind> {
        self.advance();
        self.expect_punct("(")?;
        let init = if self.is_punct(";") {
            None
        } else {
            let pos = self.pos();
            let declares = ["var", "let", "const"].iter().any(|k| self.is_keyword(k));
            let kind = if declares {
                self.var_declaration()?
            } else {
                StmtKind::Expr(self.expression()?)
            };
            Some(Box::new(Stmt { kind, pos }))
        };
        self.expect_punct(";")?;
        let test = if self.is_punct(";") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(";")?;
        let update = if self.is_punct(")") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(")")?;
        Ok(StmtKind::For {
            init,
            test,
            update,
            body: Box::new(self.statement()?),
        })
    }

    /// Parse after the `function` keyword.
    fn function_rest(&mut self, require_name: bool, pos: Pos) -> ParseResult<Rc<FunctionDef>> {
        let name = if require_name || matches!(self.peek_kind(), TokenKind::Ident(_)) {
            Some(self.identifier()?)
        } else {
            None
        };
        self.expect_punct("(")?;
        let mut params = Vec::new();
        if !self.eat_punct(")") {
            loop {
                params.push(self.identifier()?);
                if self.eat_punct(")") {
                    break;
                }
                self.expect_punct(",")?;
            }
        }
        let body = self.block()?;
        Ok(Rc::new(FunctionDef {
            name,
            params,
            body,
            document: Rc::clone(&self.document),
            source: Rc::clone(&self.source),
            pos,
        }))
    }

    // ── expressions ──────────────────────────────────────────

    fn expression(&mut self) -> ParseResult<Expr> {
        self.assignment()
    }

    fn assignment(&mut self) -> ParseResult<Expr> {
        self.descend()?;
        let expr = self.assignment_inner()?;
        self.depth -= 1;
        Ok(expr)
    }

    fn assignment_inner(&mut self) -> ParseResult<Expr> {
        let target = self.conditional()?;
        let op = match self.peek_kind() {
            TokenKind::Punct("=") => AssignOp::Assign,
            TokenKind::Punct("+=") => AssignOp::Add,
            TokenKind::Punct("-=") => AssignOp::Sub,
            TokenKind::Punct("*=") => AssignOp::Mul,
            TokenKind::Punct("/=") => AssignOp::Div,
            TokenKind::Punct("%=") => AssignOp::Mod,
            _ => return Ok(target),
        };
        if !target.kind.is_assignable() {
            return Err(SyntaxError::new(
                "Invalid left-hand side in assignment",
                target.pos,
            ));
        }
        self.advance();
        let value = self.assignment()?;
        let pos = target.pos;
        Ok(Expr {
            kind: ExprKind::Assign(op, Box::new(target), Box::new(value)),
            pos,
        })
    }

    fn conditional(&mut self) -> ParseResult<Expr> {
        let test = self.logical_or()?;
        if !self.eat_punct("?") {
            return Ok(test);
        }
        let then = self.assignment()?;
        self.expect_punct(":")?;
        let otherwise = self.assignment()?;
        let pos = test.pos;
        Ok(Expr {
            kind: ExprKind::Conditional(Box::new(test), Box::new(then), Box::new(otherwise)),
            pos,
        })
    }

    fn logical_or(&mut self) -> ParseResult<Expr> {
        let mut left = self.logical_and()?;
        let links = self.depth;
        while self.eat_punct("||") {
            self.descend()?;
            let right = self.logical_and()?;
            left = logical(LogicalOp::Or, left, right);
        }
        self.depth = links;
        Ok(left)
    }

    fn logical_and(&mut self) -> ParseResult<Expr> {
        let mut left = self.equality()?;
        let links = self.depth;
        while self.eat_punct("&&") {
            self.descend()?;
            let right = self.equality()?;
            left = logical(LogicalOp::And, left, right);
        }
        self.depth = links;
        Ok(left)
    }

    fn equality(&mut self) -> ParseResult<Expr> {
        let mut left = self.relational()?;
        let links = self.depth;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Punct("==") => BinaryOp::Eq,
                TokenKind::Punct("!=") => BinaryOp::Ne,
                TokenKind::Punct("===") => BinaryOp::StrictEq,
                TokenKind::Punct("!==") => BinaryOp::StrictNe,
                _ => {
                    self.depth = links;
                    return Ok(left);
                }
            };
            self.advance();
            self.descend()?;
            let right = self.relational()?;
            left = binary(op, left, right);
        }
    }

    fn relational(&mut self) -> ParseResult<Expr> {
        let mut left = self.additive()?;
        let links = self.depth;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Punct("<") => BinaryOp::Lt,
                TokenKind::Punct(">") => BinaryOp::Gt,
                TokenKind::Punct("<=") => BinaryOp::Le,
                TokenKind::Punct(">=") => BinaryOp::Ge,
                _ => {
                    self.depth = links;
                    return Ok(left);
                }
            };
            self.advance();
            self.descend()?;
            let right = self.additive()?;
            left = binary(op, left, right);
        }
    }

    fn additive(&mut self) -> ParseResult<Expr> {
        let mut left = self.multiplicative()?;
        let links = self.depth;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Punct("+") => BinaryOp::Add,
                TokenKind::Punct("-") => BinaryOp::Sub,
                _ => {
                    self.depth = links;
                    return Ok(left);
                }
            };
            self.advance();
            self.descend()?;
            let right = self.multiplicative()?;
            left = binary(op, left, right);
        }
    }

    fn multiplicative(&mut self) -> ParseResult<Expr> {
        let mut left = self.unary()?;
        let links = self.depth;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Punct("*") => BinaryOp::Mul,
                TokenKind::Punct("/") => BinaryOp::Div,
                TokenKind::Punct("%") => BinaryOp::Mod,
                _ => {
                    self.depth = links;
                    return Ok(left);
                }
            };
            self.advance();
            self.descend()?;
            let right = self.unary()?;
            left = binary(op, left, right);
        }
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        self.descend()?;
        let expr = self.unary_inner()?;
        self.depth -= 1;
        Ok(expr)
    }

    fn unary_inner(&mut self) -> ParseResult<Expr> {
        let pos = self.pos();
        let op = match self.peek_kind() {
            TokenKind::Punct("!") => Some(UnaryOp::Not),
            TokenKind::Punct("-") => Some(UnaryOp::Neg),
            TokenKind::Punct("+") => Some(UnaryOp::Plus),
            TokenKind::Ident(word) if word == "typeof" => Some(UnaryOp::Typeof),
            TokenKind::Ident(word) if word == "void" => Some(UnaryOp::Void),
            TokenKind::Ident(word) if word == "delete" => Some(UnaryOp::Delete),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.unary()?;
            return Ok(Expr {
                kind: ExprKind::Unary(op, Box::new(operand)),
                pos,
            });
        }
        if self.is_punct("++") || self.is_punct("--") {
            let increment = self.is_punct("++");
            self.advance();
            let target = self.unary()?;
            return self.update(increment, true, target, pos);
        }
        self.postfix()
    }

    fn postfix(&mut self) -> ParseResult<Expr> {
        let expr = self.call_member()?;
        if (self.is_punct("++") || self.is_punct("--")) && !self.peek().newline_before {
            let increment = self.is_punct("++");
            self.advance();
            let pos = expr.pos;
            return self.update(increment, false, expr, pos);
        }
        Ok(expr)
    }

    fn update(&self, increment: bool, prefix: bool, target: Expr, pos: Pos) -> ParseResult<Expr> {
        if !target.kind.is_assignable() {
            return Err(SyntaxError::new(
                "Invalid left-hand side expression in update operation",
                target.pos,
            ));
        }
        Ok(Expr {
            kind: ExprKind::Update {
                increment,
                prefix,
                target: Box::new(target),
            },
            pos,
        })
    }

    fn call_member(&mut self) -> ParseResult<Expr> {
        let mut expr = if self.is_keyword("new") {
            self.new_expression()?
        } else {
            self.primary()?
        };
        let links = self.depth;
        loop {
            if self.is_punct(".") || self.is_punct("[") || self.is_punct("(") {
                self.descend()?;
            }
            expr = if self.eat_punct(".") {
                let name = self.property_name()?;
                let pos = expr.pos;
                Expr {
                    kind: ExprKind::Member(Box::new(expr), name),
                    pos,
                }
            } else if self.eat_punct("[") {
                let index = self.expression()?;
                self.expect_punct("]")?;
                let pos = expr.pos;
                Expr {
                    kind: ExprKind::Index(Box::new(expr), Box::new(index)),
                    pos,
                }
            } else if self.is_punct("(") {
                let args = self.arguments()?;
                let pos = expr.pos;
                Expr {
                    kind: ExprKind::Call(Box::new(expr), args),
                    pos,
                }
            } else {
                self.depth = links;
                return Ok(expr);
            };
        }
    }

    /// `new Callee(args)`; the callee is a member chain without calls.
    fn new_expression(&mut self) -> ParseResult<Expr> {
        let pos = self.pos();
        self.advance();
        self.descend()?;
        let mut callee = if self.is_keyword("new") {
            self.new_expression()?
        } else {
            self.primary()?
        };
        let links = self.depth;
        loop {
            if self.is_punct(".") || self.is_punct("[") {
                self.descend()?;
            }
            callee = if self.eat_punct(".") {
                let name = self.property_name()?;
                let pos = callee.pos;
                Expr {
                    kind: ExprKind::Member(Box::new(callee), name),
                    pos,
                }
            } else if self.eat_punct("[") {
                let index = self.expression()?;
                self.expect_punct("]")?;
                let pos = callee.pos;
                Expr {
                    kind: ExprKind::Index(Box::new(callee), Box::new(index)),
                    pos,
                }
            } else {
                break;
            };
        }
        self.depth = links;
        let args = if self.is_punct("(") {
            self.arguments()?
        } else {
            Vec::new()
        };
        self.depth -= 1;
        Ok(Expr {
            kind: ExprKind::New(Box::new(callee), args),
            pos,
        })
    }

    fn arguments(&mut self) -> ParseResult<Vec<Expr>> {
        self.expect_punct("(")?;
        let mut args = Vec::new();
        if self.eat_punct(")") {
            return Ok(args);
        }
        loop {
            args.push(self.assignment()?);
            if self.eat_punct(")") {
                return Ok(args);
            }
            self.expect_punct(",")?;
        }
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let pos = self.pos();
        let kind = match self.peek_kind().clone() {
            TokenKind::Number(n) => {
                self.advance();
                ExprKind::Number(n)
            }
            TokenKind::Str(s) => {
                self.advance();
                ExprKind::Str(Rc::from(s.as_str()))
            }
            TokenKind::Punct("(") => {
                self.advance();
                let inner = self.expression()?;
                self.expect_punct(")")?;
                return Ok(inner);
            }
            TokenKind::Punct("[") => {
                self.advance();
                let mut elements = Vec::new();
                while !self.eat_punct("]") {
                    elements.push(self.assignment()?);
                    if !self.is_punct("]") {
                        self.expect_punct(",")?;
                    }
                }
                ExprKind::Array(elements)
            }
            TokenKind::Punct("{") => {
                self.advance();
                let mut properties = Vec::new();
                while !self.eat_punct("}") {
                    let key = self.property_name()?;
                    self.expect_punct(":")?;
                    properties.push((key, self.assignment()?));
                    if !self.is_punct("}") {
                        self.expect_punct(",")?;
                    }
                }
                ExprKind::Object(properties)
            }
            TokenKind::Ident(word) => match word.as_str() {
                "true" | "false" => {
                    self.advance();
                    ExprKind::Bool(word == "true")
                }
                "null" => {
                    self.advance();
                    ExprKind::Null
                }
                "undefined" => {
                    self.advance();
                    ExprKind::Undefined
                }
                "this" => {
                    self.advance();
                    ExprKind::This
                }
                "function" => {
                    self.advance();
                    ExprKind::Function(self.function_rest(false, pos)?)
                }
                _ => ExprKind::Ident(self.identifier().map_err(|_| self.unexpected())?),
            },
            _ => return Err(self.unexpected()),
        };
        Ok(Expr { kind, pos })
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    let pos = left.pos;
    Expr {
        kind: ExprKind::Binary(op, Box::new(left), Box::new(right)),
        pos,
    }
}

fn logical(op: LogicalOp, left: Expr, right: Expr) -> Expr {
    let pos = left.pos;
    Expr {
        kind: ExprKind::Logical(op, Box::new(left), Box::new(right)),
        pos,
    }
}
