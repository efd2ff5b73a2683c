//! Eligibility predicate language
//!
//! ```text
//! expr    := or
//! or      := and (("OR" | "||") and)*
//! and     := unary (("AND" | "&&") unary)*
//! unary   := ("NOT" | "!") unary | primary
//! primary := "(" expr ")"
//!          | "has" "(" facet ")"
//!          | "geo_within" "(" string ")"
//!          | facet op number
//! facet   := ns "." key ["_count"]
//! op      := ">" | ">=" | "<" | "<=" | "==" | "!="
//! ```
//!
//! Facet references resolve to local ODX counts; geo checks are local containment.

use std::collections::BTreeSet;
use yachaq_core::{GeoCell, NodeError, Result};

/// Deepest nesting accepted
pub const MAX_DEPTH: usize = 16;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `==`
    Eq,
    /// `!=`
    Ne,
}

impl CmpOp {
    fn apply(self, left: f64, right: f64) -> bool {
        match self {
            Self::Gt => left > right,
            Self::Ge => left >= right,
            Self::Lt => left < right,
            Self::Le => left <= right,
            Self::Eq => (left - right).abs() < f64::EPSILON,
            Self::Ne => (left - right).abs() >= f64::EPSILON,
        }
    }
}

/// Parsed predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// All must hold
    And(Vec<Predicate>),
    /// Any must hold
    Or(Vec<Predicate>),
    /// Negation
    Not(Box<Predicate>),
    /// Facet count comparison
    Compare {
        /// Facet key (`ns:key`)
        facet: String,
        /// Operator
        op: CmpOp,
        /// Right-hand side
        value: f64,
    },
    /// Facet has any observations
    Has(String),
    /// Device lies within the area
    GeoWithin(GeoCell),
}

/// What a predicate is evaluated against
pub trait FacetSource {
    /// Observation count of a facet
    fn count(&self, facet_key: &str) -> u64;

    /// Whether the device's coarse location lies within `area`
    fn within(&self, area: &GeoCell) -> bool;
}

impl Predicate {
    /// Parse predicate text no longer than `max_len` bytes
    pub fn parse(text: &str, max_len: usize) -> Result<Self> {
        if text.len() > max_len {
            return Err(NodeError::validation(format!(
                "predicate longer than {max_len} bytes"
            )));
        }
        let tokens = tokenize(text)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let predicate = parser.or()?;
        if parser.pos != parser.tokens.len() {
            return Err(NodeError::validation("trailing tokens in predicate"));
        }
        Ok(predicate)
    }

    /// Evaluate against local state
    pub fn evaluate(&self, source: &dyn FacetSource) -> bool {
        match self {
            Self::And(items) => items.iter().all(|p| p.evaluate(source)),
            Self::Or(items) => items.iter().any(|p| p.evaluate(source)),
            Self::Not(inner) => !inner.evaluate(source),
            Self::Compare { facet, op, value } => op.apply(source.count(facet) as f64, *value),
            Self::Has(facet) => source.count(facet) > 0,
            Self::GeoWithin(area) => source.within(area),
        }
    }

    /// Facets the predicate references
    pub fn facets(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_facets(&mut out);
        out
    }

    /// Facets referenced outside any negation; these must be published
    pub fn positive_facets(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_positive(&mut out);
        out
    }

    fn collect_facets(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::And(items) | Self::Or(items) => {
                items.iter().for_each(|p| p.collect_facets(out));
            }
            Self::Not(inner) => inner.collect_facets(out),
            Self::Compare { facet, .. } | Self::Has(facet) => {
                out.insert(facet.clone());
            }
            Self::GeoWithin(_) => {}
        }
    }

    fn collect_positive(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::And(items) | Self::Or(items) => {
                items.iter().for_each(|p| p.collect_positive(out));
            }
            Self::Not(_) | Self::GeoWithin(_) => {}
            Self::Compare { facet, .. } | Self::Has(facet) => {
                out.insert(facet.clone());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Op(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' | '<' | '=' => {
                let (op, width) = match (c, next) {
                    ('>', Some('=')) => (CmpOp::Ge, 2),
                    ('<', Some('=')) => (CmpOp::Le, 2),
                    ('=', Some('=')) => (CmpOp::Eq, 2),
                    ('>', _) => (CmpOp::Gt, 1),
                    ('<', _) => (CmpOp::Lt, 1),
                    _ => return Err(NodeError::validation("use == for equality")),
                };
                tokens.push(Token::Op(op));
                i += width;
            }
            '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == '"')
                    .ok_or_else(|| NodeError::validation("unterminated string"))?;
                tokens.push(Token::Str(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let value: f64 = literal
                    .parse()
                    .map_err(|_| NodeError::validation(format!("bad number {literal}")))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(NodeError::validation(format!(
                    "unexpected character {other:?} in predicate"
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| NodeError::validation("unexpected end of predicate"))?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        let token = self.next()?;
        if &token == expected {
            Ok(())
        } else {
            Err(NodeError::validation(format!(
                "expected {expected:?}, found {token:?}"
            )))
        }
    }

    fn descend(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(NodeError::validation("predicate nested too deeply"));
        }
        Ok(())
    }

    fn or(&mut self) -> Result<Predicate> {
        let mut items = vec![self.and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            items.push(self.and()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Predicate::Or(items)
        })
    }

    fn and(&mut self) -> Result<Predicate> {
        let mut items = vec![self.unary()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            items.push(self.unary()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Predicate::And(items)
        })
    }

    fn unary(&mut self) -> Result<Predicate> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Predicate::Not(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Predicate> {
        match self.next()? {
            Token::LParen => {
                self.descend()?;
                let inner = self.or()?;
                self.depth -= 1;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(word) if word == "has" => {
                self.expect(&Token::LParen)?;
                let facet = match self.next()? {
                    Token::Ident(name) => facet_key(&name)?,
                    other => {
                        return Err(NodeError::validation(format!(
                            "has() expects a facet, found {other:?}"
                        )))
                    }
                };
                self.expect(&Token::RParen)?;
                Ok(Predicate::Has(facet))
            }
            Token::Ident(word) if word == "geo_within" => {
                self.expect(&Token::LParen)?;
                let area = match self.next()? {
                    Token::Str(cell) => GeoCell::parse(&cell)?,
                    other => {
                        return Err(NodeError::validation(format!(
                            "geo_within() expects a quoted cell, found {other:?}"
                        )))
                    }
                };
                self.expect(&Token::RParen)?;
                Ok(Predicate::GeoWithin(area))
            }
            Token::Ident(name) => {
                let facet = facet_key(&name)?;
                let op = match self.next()? {
                    Token::Op(op) => op,
                    other => {
                        return Err(NodeError::validation(format!(
                            "expected comparison after {name}, found {other:?}"
                        )))
                    }
                };
                let value = match self.next()? {
                    Token::Number(n) if n.is_finite() => n,
                    other => {
                        return Err(NodeError::validation(format!(
                            "expected number after operator, found {other:?}"
                        )))
                    }
                };
                Ok(Predicate::Compare { facet, op, value })
            }
            other => Err(NodeError::validation(format!(
                "unexpected token {other:?}"
            ))),
        }
    }
}

/// `mobility.trip_count` / `mobility.trip` to `mobility:trip`
fn facet_key(reference: &str) -> Result<String> {
    let (namespace, key) = reference
        .split_once('.')
        .ok_or_else(|| NodeError::validation(format!("facet {reference} needs ns.key")))?;
    let key = key.strip_suffix("_count").unwrap_or(key);
    let facet = format!("{namespace}:{key}");
    if yachaq_labels::label::is_valid_label(&facet) {
        Ok(facet)
    } else {
        Err(NodeError::validation(format!("invalid facet {reference}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct Counts(BTreeMap<&'static str, u64>, Option<GeoCell>);

    impl FacetSource for Counts {
        fn count(&self, facet_key: &str) -> u64 {
            self.0.get(facet_key).copied().unwrap_or(0)
        }

        fn within(&self, area: &GeoCell) -> bool {
            self.1.as_ref().is_some_and(|c| c.within(area))
        }
    }

    fn counts() -> Counts {
        Counts(
            [("mobility:trip", 120), ("mode:cycle", 30)].into_iter().collect(),
            Some(GeoCell::region("PE", "LIM").unwrap()),
        )
    }

    #[test]
    fn test_trip_count_predicate() {
        let p = Predicate::parse("mobility.trip_count>10", 256).unwrap();
        assert_eq!(
            p,
            Predicate::Compare {
                facet: "mobility:trip".into(),
                op: CmpOp::Gt,
                value: 10.0
            }
        );
        assert!(p.evaluate(&counts()));
    }

    #[test]
    fn test_boolean_combinations() {
        let source = counts();
        let cases = [
            ("mobility.trip_count > 10 AND has(mode.cycle)", true),
            ("mobility.trip_count > 500 || mode.cycle >= 30", true),
            ("NOT has(health.steps)", true),
            ("!(mobility.trip_count > 10) OR health.steps_count != 0", false),
            ("geo_within(\"PE\") && geo_within(\"PE:LIM\")", true),
            ("geo_within(\"CO\")", false),
        ];
        for (text, expected) in cases {
            let p = Predicate::parse(text, 256).unwrap();
            assert_eq!(p.evaluate(&source), expected, "{text}");
        }
    }

    #[test]
    fn test_positive_facets_skip_negations() {
        let p = Predicate::parse("mobility.trip_count > 1 AND NOT has(health.steps)", 256).unwrap();
        assert_eq!(p.facets().len(), 2);
        let positive: Vec<_> = p.positive_facets().into_iter().collect();
        assert_eq!(positive, vec!["mobility:trip".to_string()]);
    }

    #[test]
    fn test_malformed_predicates() {
        for bad in [
            "",
            "mobility.trip_count >",
            "mobility.trip_count = 3",
            "has(mobility)",
            "geo_within(PE)",
            "(mobility.trip_count > 1",
            "mobility.trip_count > 1 extra",
            "exec(\"rm -rf\")",
            "Mobility.Trip > 1",
        ] {
            assert!(Predicate::parse(bad, 256).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_bounds() {
        let long = format!("{}has(mobility.trip){}", "(".repeat(40), ")".repeat(40));
        assert!(Predicate::parse(&long, 4096).is_err());
        assert!(Predicate::parse("has(mobility.trip)", 5).is_err());
    }
}
