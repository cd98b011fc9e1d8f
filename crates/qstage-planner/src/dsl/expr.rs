//! Recursive-descent parser for DSL expressions and aggregate specs.
//!
//! Grammar (lowest precedence first):
//! ```text
//! named   := or [AS ident]
//! or      := and (OR and)*
//! and     := not (AND not)*
//! not     := NOT not | cmp
//! cmp     := sum [(= | == | != | <> | < | <= | > | >=) sum]
//! sum     := product ((+ | -) product)*
//! product := unary (* unary)*
//! unary   := - unary | primary
//! primary := number | 'string' | "string" | TRUE | FALSE | NULL
//!          | ident | $subquery | ( or )
//! ```
//! Keywords are case-insensitive. Columns come out unresolved.

use qstage_core::expr::{AggregateExpr, Aggregation, BinaryOp, Expr};
use qstage_core::logical::LogicalPlan;
use qstage_core::types::Scalar;

use super::DslError;

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Subquery(String),
    Int(i64),
    Float(f64),
    Str(String),
    Op(&'static str),
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Tok)>, DslError> {
    let err = |offset, message: &str| DslError::Expr {
        input: input.to_string(),
        offset,
        message: message.to_string(),
    };
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let (pos, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' || c == '$' {
            let start = if c == '$' { i + 1 } else { i };
            let mut j = start;
            while j < chars.len() && (chars[j].1.is_ascii_alphanumeric() || chars[j].1 == '_') {
                j += 1;
            }
            let word: String = chars[start..j].iter().map(|(_, c)| *c).collect();
            if word.is_empty() {
                return Err(err(pos, "expected a subquery name after '$'"));
            }
            out.push((pos, if c == '$' { Tok::Subquery(word) } else { Tok::Ident(word) }));
            i = j;
            continue;
        }
        if c.is_ascii_digit() {
            let mut j = i;
            let mut seen_dot = false;
            while j < chars.len() && (chars[j].1.is_ascii_digit() || (chars[j].1 == '.' && !seen_dot)) {
                seen_dot |= chars[j].1 == '.';
                j += 1;
            }
            let text: String = chars[i..j].iter().map(|(_, c)| *c).collect();
            let tok = if seen_dot {
                Tok::Float(text.parse().map_err(|_| err(pos, "malformed number"))?)
            } else {
                Tok::Int(text.parse().map_err(|_| err(pos, "integer out of range"))?)
            };
            out.push((pos, tok));
            i = j;
            continue;
        }
        if c == '\'' || c == '"' {
            let mut j = i + 1;
            let mut s = String::new();
            while j < chars.len() && chars[j].1 != c {
                s.push(chars[j].1);
                j += 1;
            }
            if j == chars.len() {
                return Err(err(pos, "unterminated string literal"));
            }
            out.push((pos, Tok::Str(s)));
            i = j + 1;
            continue;
        }
        let next = chars.get(i + 1).map(|(_, c)| *c);
        let (tok, width) = match (c, next) {
            ('(', _) => (Tok::LParen, 1),
            (')', _) => (Tok::RParen, 1),
            ('=', Some('=')) => (Tok::Op("="), 2),
            ('=', _) => (Tok::Op("="), 1),
            ('!', Some('=')) => (Tok::Op("!="), 2),
            ('<', Some('>')) => (Tok::Op("!="), 2),
            ('<', Some('=')) => (Tok::Op("<="), 2),
            ('<', _) => (Tok::Op("<"), 1),
            ('>', Some('=')) => (Tok::Op(">="), 2),
            ('>', _) => (Tok::Op(">"), 1),
            ('+', _) => (Tok::Op("+"), 1),
            ('-', _) => (Tok::Op("-"), 1),
            ('*', _) => (Tok::Op("*"), 1),
            _ => return Err(err(pos, &format!("unexpected character '{c}'"))),
        };
        out.push((pos, tok));
        i += width;
    }
    Ok(out)
}

struct Parser<'a> {
    input: &'a str,
    toks: Vec<(usize, Tok)>,
    pos: usize,
    subqueries: &'a dyn Fn(&str) -> Option<LogicalPlan>,
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> DslError {
        let offset = self
            .toks
            .get(self.pos)
            .map(|(o, _)| *o)
            .unwrap_or(self.input.len());
        DslError::Expr {
            input: self.input.to_string(),
            offset,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|(_, t)| t)
    }

    fn bump(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        t
    }

    fn keyword(&mut self, kw: &str) -> bool {
        match self.peek() {
            Some(Tok::Ident(w)) if w.eq_ignore_ascii_case(kw) => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some(Tok::Op(o)) if ops.contains(o) => {
                let o = *o;
                self.pos += 1;
                Some(o)
            }
            _ => None,
        }
    }

    fn named(&mut self) -> Result<Expr, DslError> {
        let e = self.or()?;
        if self.keyword("as") {
            match self.bump() {
                Some(Tok::Ident(name)) => Ok(e.alias(name)),
                _ => Err(self.error("expected an alias after AS")),
            }
        } else {
            Ok(e)
        }
    }

    fn or(&mut self) -> Result<Expr, DslError> {
        let mut e = self.and()?;
        while self.keyword("or") {
            e = Expr::binary(e, BinaryOp::Or, self.and()?);
        }
        Ok(e)
    }

    fn and(&mut self) -> Result<Expr, DslError> {
        let mut e = self.not()?;
        while self.keyword("and") {
            e = Expr::binary(e, BinaryOp::And, self.not()?);
        }
        Ok(e)
    }

    fn not(&mut self) -> Result<Expr, DslError> {
        if self.keyword("not") {
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.cmp()
    }

    fn cmp(&mut self) -> Result<Expr, DslError> {
        let left = self.sum()?;
        let op = match self.op(&["=", "!=", "<", "<=", ">", ">="]) {
            Some("=") => BinaryOp::Eq,
            Some("!=") => BinaryOp::NotEq,
            Some("<") => BinaryOp::Lt,
            Some("<=") => BinaryOp::LtEq,
            Some(">") => BinaryOp::Gt,
            Some(">=") => BinaryOp::GtEq,
            _ => return Ok(left),
        };
        Ok(Expr::binary(left, op, self.sum()?))
    }

    fn sum(&mut self) -> Result<Expr, DslError> {
        let mut e = self.product()?;
        while let Some(o) = self.op(&["+", "-"]) {
            let op = if o == "+" { BinaryOp::Plus } else { BinaryOp::Minus };
            e = Expr::binary(e, op, self.product()?);
        }
        Ok(e)
    }

    fn product(&mut self) -> Result<Expr, DslError> {
        let mut e = self.unary()?;
        while self.op(&["*"]).is_some() {
            e = Expr::binary(e, BinaryOp::Multiply, self.unary()?);
        }
        Ok(e)
    }

    fn unary(&mut self) -> Result<Expr, DslError> {
        if self.op(&["-"]).is_some() {
            return Ok(match self.unary()? {
                Expr::Literal(Scalar::I32(v)) => Expr::lit(Scalar::I32(-v)),
                Expr::Literal(Scalar::I64(v)) => Expr::lit(Scalar::I64(-v)),
                Expr::Literal(Scalar::F64(v)) => Expr::lit(Scalar::F64(-v)),
                other => Expr::binary(Expr::lit(Scalar::I32(0)), BinaryOp::Minus, other),
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, DslError> {
        match self.bump() {
            Some(Tok::Int(v)) => Ok(Expr::lit(match i32::try_from(v) {
                Ok(small) => Scalar::I32(small),
                Err(_) => Scalar::I64(v),
            })),
            Some(Tok::Float(v)) => Ok(Expr::lit(Scalar::F64(v))),
            Some(Tok::Str(s)) => Ok(Expr::lit(Scalar::Str(s))),
            Some(Tok::Ident(w)) => Ok(match w.to_ascii_lowercase().as_str() {
                "true" => Expr::lit(Scalar::Bool(true)),
                "false" => Expr::lit(Scalar::Bool(false)),
                "null" => Expr::lit(Scalar::Null),
                _ => Expr::col(w),
            }),
            Some(Tok::Subquery(name)) => match (self.subqueries)(&name) {
                Some(plan) => Ok(Expr::ScalarSubquery(Box::new(plan))),
                None => {
                    self.pos -= 1;
                    Err(self.error(format!("unknown subquery '${name}'")))
                }
            },
            Some(Tok::LParen) => {
                let e = self.or()?;
                match self.bump() {
                    Some(Tok::RParen) => Ok(e),
                    _ => {
                        self.pos -= 1;
                        Err(self.error("expected ')'"))
                    }
                }
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("expected an expression"))
            }
        }
    }

    fn finish(&self) -> Result<(), DslError> {
        if self.pos < self.toks.len() {
            Err(self.error("unexpected trailing input"))
        } else {
            Ok(())
        }
    }
}

/// Parse an expression that may not reference subqueries.
pub fn parse_expr(input: &str) -> Result<Expr, DslError> {
    parse_expr_with(input, &|_| None)
}

/// Parse an expression, optionally aliased with `AS`. `$name` references
/// are looked up in `subqueries` and become scalar subqueries.
pub fn parse_expr_with(
    input: &str,
    subqueries: &dyn Fn(&str) -> Option<LogicalPlan>,
) -> Result<Expr, DslError> {
    let mut p = Parser {
        input,
        toks: tokenize(input)?,
        pos: 0,
        subqueries,
    };
    let e = p.named()?;
    p.finish()?;
    Ok(e)
}

/// Parse `func(col) [as alias]`, with `count(*)` / `count(1)` counting rows.
/// Without an alias the output column is named after the call.
pub fn parse_aggregate(spec: &str) -> Result<AggregateExpr, DslError> {
    let err = |message: &str| DslError::Expr {
        input: spec.to_string(),
        offset: 0,
        message: message.to_string(),
    };
    let (call, alias) = split_alias(spec);
    let open = call.find('(').ok_or_else(|| err("expected func(column)"))?;
    let close = call.rfind(')').filter(|c| *c > open).ok_or_else(|| err("missing ')'"))?;
    if !call[close + 1..].trim().is_empty() {
        return Err(err("unexpected input after ')'"));
    }
    let func = call[..open].trim().to_ascii_lowercase();
    let arg = call[open + 1..close].trim();
    let agg = match (func.as_str(), arg) {
        ("count", "*" | "1") => Aggregation::Count,
        (_, "") => return Err(err("missing aggregate argument")),
        ("count", _) => Aggregation::Count,
        ("sum", c) => Aggregation::Sum(c.to_string()),
        ("avg", c) => Aggregation::Avg(c.to_string()),
        ("min", c) => Aggregation::Min(c.to_string()),
        ("max", c) => Aggregation::Max(c.to_string()),
        (other, _) => return Err(err(&format!("unknown aggregate function '{other}'"))),
    };
    let alias = match alias {
        Some(a) => a.to_string(),
        None => agg.to_string(),
    };
    Ok(AggregateExpr::new(agg, alias))
}

fn split_alias(spec: &str) -> (&str, Option<&str>) {
    let lower = spec.to_ascii_lowercase();
    match lower.rfind(" as ") {
        Some(i) if lower[i..].find(')').is_none() => {
            (spec[..i].trim(), Some(spec[i + 4..].trim()))
        }
        _ => (spec.trim(), None),
    }
}
