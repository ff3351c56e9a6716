//! Parser for map expressions.
//!
//! Binary operators use precedence climbing. From loosest to tightest:
//! `?:`, `||`, `&&`, comparisons, `+ -`, `* / %`, `^`. Only `^` groups to
//! the right. Unary `-` and `!` bind tighter than every binary operator.

use hashbrown::HashSet;

use super::ast::{BinaryOp, Expr, Function, Program, Statement, Target, UnaryOp};
use super::lexer::{Token, TokenKind};
use crate::{Error, Result};

/// Parse a token stream ending in `TokenKind::End`.
pub fn parse(tokens: &[Token], max_depth: usize) -> Result<Program> {
    if tokens.last().map(|t| t.kind) != Some(TokenKind::End) {
        return Err(syntax(0, "token stream is not terminated"));
    }
    let mut parser = Parser { tokens, cursor: 0, depth: 0, max_depth, locals: HashSet::new() };
    parser.program()
}

fn syntax(position: usize, message: impl Into<String>) -> Error {
    Error::SyntaxError { position, message: message.into() }
}

fn binary_op(kind: TokenKind) -> Option<(BinaryOp, u8)> {
    use BinaryOp as B;
    use TokenKind as T;
    Some(match kind {
        T::Or => (B::Or, 1),
        T::And => (B::And, 2),
        T::Eq => (B::Eq, 3),
        T::Neq => (B::Neq, 3),
        T::Lt => (B::Lt, 3),
        T::Lte => (B::Lte, 3),
        T::Gt => (B::Gt, 3),
        T::Gte => (B::Gte, 3),
        T::Plus => (B::Add, 4),
        T::Minus => (B::Sub, 4),
        T::Star => (B::Mul, 5),
        T::Slash => (B::Div, 5),
        T::Percent => (B::Mod, 5),
        T::Caret => (B::Pow, 6),
        _ => return None,
    })
}

struct Parser<'t> {
    tokens: &'t [Token],
    /// Never moves past the trailing `End`.
    cursor: usize,
    depth: usize,
    max_depth: usize,
    /// Variables assigned by earlier statements.
    locals: HashSet<String>,
}

impl<'t> Parser<'t> {
    fn current(&self) -> &'t Token {
        &self.tokens[self.cursor]
    }

    fn bump(&mut self) -> &'t Token {
        let token = self.current();
        if token.kind != TokenKind::End {
            self.cursor += 1;
        }
        token
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current().kind == kind
    }

    fn accept(&mut self, kind: TokenKind) -> bool {
        let hit = self.check(kind);
        if hit {
            self.bump();
        }
        hit
    }

    fn require(&mut self, kind: TokenKind) -> Result<&'t Token> {
        if self.check(kind) {
            Ok(self.bump())
        } else {
            Err(self.fail(format!("expected {kind:?}, found {:?}", self.current().kind)))
        }
    }

    fn fail(&self, message: impl Into<String>) -> Error {
        syntax(self.current().offset, message)
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= self.max_depth {
            return Err(self.fail(format!("expression nested deeper than {}", self.max_depth)));
        }
        self.depth += 1;
        let out = f(self);
        self.depth -= 1;
        out
    }

    fn program(&mut self) -> Result<Program> {
        let mut statements = Vec::new();
        loop {
            while self.accept(TokenKind::Semicolon) {}
            if self.check(TokenKind::End) {
                break;
            }
            statements.push(self.statement()?);
            if !self.check(TokenKind::End) {
                self.require(TokenKind::Semicolon)?;
            }
        }

        let writes_output = statements
            .iter()
            .any(|s| matches!(s.target, Target::Output | Target::OutputElement(_)));
        if !writes_output {
            return Err(syntax(0, "expression never assigns the output 'y'"));
        }
        Ok(Program { statements })
    }

    fn statement(&mut self) -> Result<Statement> {
        let name = &self.require(TokenKind::Identifier)?.text;
        let target = match name.as_str() {
            "y" => match self.subscript()? {
                Some(index) => Target::OutputElement(index),
                None => Target::Output,
            },
            "x" | "pi" => return Err(self.fail(format!("cannot assign to '{name}'"))),
            _ if Function::lookup(name).is_some() => {
                return Err(self.fail(format!("cannot assign to function '{name}'")));
            }
            _ => Target::Local(name.clone()),
        };
        self.require(TokenKind::Assign)?;
        let expr = self.expression()?;
        if let Target::Local(local) = &target {
            self.locals.insert(local.clone());
        }
        Ok(Statement { target, expr })
    }

    /// Optional `[n]` after `x` or `y`.
    fn subscript(&mut self) -> Result<Option<usize>> {
        if !self.accept(TokenKind::LBracket) {
            return Ok(None);
        }
        let token = self.require(TokenKind::Number)?;
        let index = token.text.parse::<usize>().map_err(|_| {
            syntax(token.offset, format!("index must be a non-negative integer, got '{}'", token.text))
        })?;
        self.require(TokenKind::RBracket)?;
        Ok(Some(index))
    }

    fn expression(&mut self) -> Result<Expr> {
        self.nested(|p| {
            let cond = p.binary(1)?;
            if !p.accept(TokenKind::Question) {
                return Ok(cond);
            }
            let then = p.expression()?;
            p.require(TokenKind::Colon)?;
            let otherwise = p.expression()?;
            Ok(Expr::Conditional {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            })
        })
    }

    /// Operators binding at least as tightly as `min`.
    fn binary(&mut self, min: u8) -> Result<Expr> {
        let mut left = self.unary()?;
        while let Some((op, prec)) = binary_op(self.current().kind) {
            if prec < min {
                break;
            }
            self.bump();
            let right = if op == BinaryOp::Pow {
                self.nested(|p| p.binary(prec))?
            } else {
                self.binary(prec + 1)?
            };
            left = Expr::Binary { left: Box::new(left), op, right: Box::new(right) };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        let op = match self.current().kind {
            TokenKind::Minus => UnaryOp::Negate,
            TokenKind::Not => UnaryOp::Not,
            _ => return self.primary(),
        };
        self.bump();
        let expr = self.nested(Self::unary)?;
        Ok(Expr::Unary { op, expr: Box::new(expr) })
    }

    fn primary(&mut self) -> Result<Expr> {
        let token = self.bump();
        match token.kind {
            TokenKind::Number => token
                .text
                .parse()
                .map(Expr::Number)
                .map_err(|_| syntax(token.offset, "invalid number")),
            TokenKind::LParen => {
                let inner = self.expression()?;
                self.require(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::Identifier => self.name(token),
            TokenKind::End => Err(syntax(token.offset, "unexpected end of expression")),
            other => Err(syntax(token.offset, format!("unexpected {other:?} '{}'", token.text))),
        }
    }

    fn name(&mut self, token: &'t Token) -> Result<Expr> {
        let name = token.text.as_str();
        match name {
            "x" => Ok(match self.subscript()? {
                Some(index) => Expr::InputElement(index),
                None => Expr::Input,
            }),
            "y" => Err(syntax(token.offset, "the output 'y' cannot be read")),
            "pi" => Ok(Expr::Number(std::f64::consts::PI)),
            _ if self.check(TokenKind::LParen) => self.call(token),
            _ if self.locals.contains(name) => Ok(Expr::Variable(name.to_owned())),
            _ => Err(syntax(token.offset, format!("unknown variable '{name}'"))),
        }
    }

    fn call(&mut self, token: &'t Token) -> Result<Expr> {
        let name = token.text.as_str();
        let func = Function::lookup(name)
            .ok_or_else(|| syntax(token.offset, format!("unknown function '{name}'")))?;
        self.require(TokenKind::LParen)?;
        let mut args = Vec::new();
        if !self.accept(TokenKind::RParen) {
            loop {
                args.push(self.expression()?);
                if !self.accept(TokenKind::Comma) {
                    break;
                }
            }
            self.require(TokenKind::RParen)?;
        }
        if args.len() != func.arity() {
            return Err(syntax(
                token.offset,
                format!("'{name}' takes {} argument(s), got {}", func.arity(), args.len()),
            ));
        }
        Ok(Expr::Call { func, args })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::lexer::tokenize;

    fn parse_str(source: &str) -> Result<Program> {
        parse(&tokenize(source)?, 64)
    }

    fn root(source: &str) -> Expr {
        parse_str(source).unwrap().statements.remove(0).expr
    }

    #[test]
    fn test_scale() {
        let program = parse_str("y=x*100").unwrap();
        assert_eq!(program.statements.len(), 1);
        assert_eq!(program.statements[0].target, Target::Output);
        assert_eq!(
            program.statements[0].expr,
            Expr::Binary {
                left: Box::new(Expr::Input),
                op: BinaryOp::Mul,
                right: Box::new(Expr::Number(100.0)),
            }
        );
    }

    #[test]
    fn test_tighter_operators_nest_deeper() {
        let Expr::Binary { op: BinaryOp::Add, right, .. } = root("y = 1 + 2 * 3 ^ 2") else {
            panic!("addition should be the root");
        };
        let Expr::Binary { op: BinaryOp::Mul, right, .. } = *right else {
            panic!("multiplication should sit under the addition");
        };
        assert!(matches!(*right, Expr::Binary { op: BinaryOp::Pow, .. }));
    }

    #[test]
    fn test_grouping() {
        // subtraction is left-grouped, power right-grouped
        let Expr::Binary { left, .. } = root("y = 8 - 4 - 2") else { panic!("binary") };
        assert!(matches!(*left, Expr::Binary { op: BinaryOp::Sub, .. }));

        let Expr::Binary { left, right, .. } = root("y = 2 ^ 3 ^ 2") else { panic!("binary") };
        assert_eq!(*left, Expr::Number(2.0));
        assert!(matches!(*right, Expr::Binary { op: BinaryOp::Pow, .. }));
    }

    #[test]
    fn test_unary_binds_tighter_than_power() {
        let Expr::Binary { op: BinaryOp::Pow, left, .. } = root("y = -x ^ 2") else {
            panic!("power should be the root");
        };
        assert!(matches!(*left, Expr::Unary { op: UnaryOp::Negate, .. }));
    }

    #[test]
    fn test_conditional() {
        let program = parse_str("k = x[0]; y = k > 0 ? k : -k").unwrap();
        assert!(matches!(program.statements[1].expr, Expr::Conditional { .. }));
    }

    #[test]
    fn test_locals_and_elements() {
        let program = parse_str("k = x[1] * 2; y[0] = k; y[1] = max(k, 3);").unwrap();
        assert_eq!(program.statements.len(), 3);
        assert_eq!(program.statements[0].target, Target::Local("k".into()));
        assert_eq!(program.statements[1].target, Target::OutputElement(0));
    }

    #[test]
    fn test_rejections() {
        for source in [
            "k = x",
            "y = z",
            "y = y + 1",
            "x = 3; y = x",
            "sin = 1; y = x",
            "y = pow(x)",
            "y = frobnicate(x)",
            "y = (x",
            "y = x[-1]",
            "y = x y = x",
        ] {
            assert!(parse_str(source).is_err(), "{source} should not parse");
        }
    }

    #[test]
    fn test_unterminated_token_stream() {
        assert!(parse(&[], 64).is_err());
    }

    #[test]
    fn test_depth_limit() {
        let deep = format!("y = {}x{}", "(".repeat(10), ")".repeat(10));
        assert!(parse(&tokenize(&deep).unwrap(), 64).is_ok());
        assert!(matches!(parse(&tokenize(&deep).unwrap(), 5), Err(Error::SyntaxError { .. })));

        let negations = format!("y = {}x", "-".repeat(10));
        assert!(parse(&tokenize(&negations).unwrap(), 5).is_err());
    }
}
