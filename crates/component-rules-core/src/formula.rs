//! Quantity formulas.
//!
//! Grammar:
//!
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := factor (('*' | '/') factor)*
//! factor := NUMBER | IDENT | '(' expr ')'
//! ```
//!
//! A formula is parsed once into a [`QuantityExpr`] tree and then evaluated against an
//! [`EvaluationContext`]. The numeric result is rounded up to a whole unit count.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::EvaluationContext;

pub const MAX_FORMULA_LEN: usize = 128;
pub const MAX_NESTING_DEPTH: usize = 8;

/// Results within this many ulps of a whole number are treated as that number.
const SNAP_ULPS: f64 = 4.0;
/// 2^53: the largest count an f64 carries exactly.
const MAX_QUANTITY: f64 = 9_007_199_254_740_992.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "camelCase")]
pub enum FormulaErrorKind {
    SyntaxError,
    UnknownVariable,
    DivisionByZero,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum FormulaError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),
    #[error("division by zero: {0}")]
    DivisionByZero(String),
}

impl FormulaError {
    #[must_use]
    pub fn kind(&self) -> FormulaErrorKind {
        match self {
            Self::Syntax(_) => FormulaErrorKind::SyntaxError,
            Self::UnknownVariable(_) => FormulaErrorKind::UnknownVariable,
            Self::DivisionByZero(_) => FormulaErrorKind::DivisionByZero,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
        }
    }

    fn precedence(self) -> u8 {
        match self {
            Self::Add | Self::Sub => 1,
            Self::Mul | Self::Div => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuantityExpr {
    Literal(f64),
    Variable(String),
    Binary { op: BinaryOp, lhs: Box<QuantityExpr>, rhs: Box<QuantityExpr> },
}

impl QuantityExpr {
    /// Parse a formula string.
    ///
    /// # Errors
    /// Returns [`FormulaError::Syntax`] for malformed input, for formulas longer than
    /// [`MAX_FORMULA_LEN`] characters, or for parentheses nested deeper than
    /// [`MAX_NESTING_DEPTH`].
    pub fn parse(formula: &str) -> Result<Self, FormulaError> {
        if formula.chars().count() > MAX_FORMULA_LEN {
            return Err(FormulaError::Syntax(format!(
                "formula exceeds {MAX_FORMULA_LEN} characters"
            )));
        }
        if formula.trim().is_empty() {
            return Err(FormulaError::Syntax("formula is empty".to_string()));
        }

        let tokens = Lexer::new(formula).tokenize()?;
        let mut parser = Parser { tokens, position: 0, depth: 0 };
        let expr = parser.parse_expr()?;
        if let Some(token) = parser.current() {
            return Err(FormulaError::Syntax(format!("unexpected `{token}` after expression")));
        }
        Ok(expr)
    }

    /// Evaluate to a real number.
    ///
    /// # Errors
    /// Returns [`FormulaError::UnknownVariable`] for identifiers missing from `context`
    /// and [`FormulaError::DivisionByZero`] when a divisor evaluates to zero.
    pub fn evaluate(&self, context: &EvaluationContext) -> Result<f64, FormulaError> {
        match self {
            Self::Literal(value) => Ok(*value),
            Self::Variable(name) => context
                .get(name)
                .copied()
                .ok_or_else(|| FormulaError::UnknownVariable(name.clone())),
            Self::Binary { op, lhs, rhs } => {
                let left = lhs.evaluate(context)?;
                let right = rhs.evaluate(context)?;
                match op {
                    BinaryOp::Add => Ok(left + right),
                    BinaryOp::Sub => Ok(left - right),
                    BinaryOp::Mul => Ok(left * right),
                    BinaryOp::Div => {
                        if right == 0.0 {
                            return Err(FormulaError::DivisionByZero(format!(
                                "divisor `{rhs}` evaluates to zero"
                            )));
                        }
                        Ok(left / right)
                    }
                }
            }
        }
    }

    /// Evaluate and round up to a whole, nonnegative unit count.
    ///
    /// # Errors
    /// Everything [`QuantityExpr::evaluate`] returns, plus [`FormulaError::Syntax`] when
    /// the result is negative, not finite, or too large to count.
    pub fn resolve_quantity(&self, context: &EvaluationContext) -> Result<u64, FormulaError> {
        ceil_quantity(self.evaluate(context)?)
    }

    /// Identifiers referenced by the formula.
    #[must_use]
    pub fn variables(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_variables(&mut names);
        names
    }

    fn collect_variables(&self, names: &mut BTreeSet<String>) {
        match self {
            Self::Literal(_) => {}
            Self::Variable(name) => {
                names.insert(name.clone());
            }
            Self::Binary { lhs, rhs, .. } => {
                lhs.collect_variables(names);
                rhs.collect_variables(names);
            }
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Self::Binary { op, .. } => op.precedence(),
            Self::Literal(_) | Self::Variable(_) => u8::MAX,
        }
    }
}

impl Display for QuantityExpr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Literal(value) => write!(f, "{value}"),
            Self::Variable(name) => write!(f, "{name}"),
            Self::Binary { op, lhs, rhs } => {
                let own = op.precedence();
                if lhs.precedence() < own {
                    write!(f, "({lhs})")?;
                } else {
                    write!(f, "{lhs}")?;
                }
                write!(f, " {} ", op.symbol())?;
                // `a - (b + c)` and `a / (b * c)` need their parentheses back.
                let rhs_needs_parens = rhs.precedence() < own
                    || (rhs.precedence() == own && matches!(op, BinaryOp::Sub | BinaryOp::Div));
                if rhs_needs_parens {
                    write!(f, "({rhs})")
                } else {
                    write!(f, "{rhs}")
                }
            }
        }
    }
}

/// Parse and evaluate `formula` against `context` in one step.
///
/// # Errors
/// Returns [`FormulaError`] as described on [`QuantityExpr::parse`] and
/// [`QuantityExpr::resolve_quantity`].
pub fn resolve(formula: &str, context: &EvaluationContext) -> Result<u64, FormulaError> {
    QuantityExpr::parse(formula)?.resolve_quantity(context)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn ceil_quantity(value: f64) -> Result<u64, FormulaError> {
    if !value.is_finite() {
        return Err(FormulaError::Syntax("formula result is not a finite number".to_string()));
    }

    let tolerance = SNAP_ULPS * f64::EPSILON * value.abs().max(1.0);
    let snapped = if (value - value.round()).abs() <= tolerance { value.round() } else { value };
    if snapped < 0.0 {
        return Err(FormulaError::Syntax(format!("formula result {value} is negative")));
    }

    let ceiled = snapped.ceil();
    if ceiled > MAX_QUANTITY {
        return Err(FormulaError::Syntax(format!(
            "formula result {value} exceeds the largest supported quantity"
        )));
    }

    Ok(ceiled as u64)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LeftParen,
    RightParen,
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Ident(name) => write!(f, "{name}"),
            Self::Plus => write!(f, "+"),
            Self::Minus => write!(f, "-"),
            Self::Star => write!(f, "*"),
            Self::Slash => write!(f, "/"),
            Self::LeftParen => write!(f, "("),
            Self::RightParen => write!(f, ")"),
        }
    }
}

struct Lexer<'a> {
    input: &'a str,
    position: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, position: 0 }
    }

    fn tokenize(&mut self) -> Result<Vec<Token>, FormulaError> {
        let mut tokens = Vec::new();
        while let Some(ch) = self.current_char() {
            let token = match ch {
                ch if ch.is_whitespace() => {
                    self.advance();
                    continue;
                }
                '+' => self.single(Token::Plus),
                '-' => self.single(Token::Minus),
                '*' => self.single(Token::Star),
                '/' => self.single(Token::Slash),
                '(' => self.single(Token::LeftParen),
                ')' => self.single(Token::RightParen),
                ch if ch.is_ascii_digit() => self.read_number()?,
                ch if ch.is_ascii_alphabetic() || ch == '_' => self.read_ident(),
                other => {
                    return Err(FormulaError::Syntax(format!(
                        "unexpected character `{other}` at offset {}",
                        self.position
                    )))
                }
            };
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn current_char(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.position += ch.len_utf8();
        }
    }

    fn single(&mut self, token: Token) -> Token {
        self.advance();
        token
    }

    fn read_number(&mut self) -> Result<Token, FormulaError> {
        let start = self.position;
        self.skip_while(|ch| ch.is_ascii_digit());
        if self.current_char() == Some('.') {
            self.advance();
            let fraction_start = self.position;
            self.skip_while(|ch| ch.is_ascii_digit());
            if self.position == fraction_start {
                return Err(FormulaError::Syntax(format!(
                    "number `{}` is missing digits after the decimal point",
                    &self.input[start..self.position]
                )));
            }
        }

        let literal = &self.input[start..self.position];
        literal
            .parse::<f64>()
            .map(Token::Number)
            .map_err(|err| FormulaError::Syntax(format!("invalid number `{literal}`: {err}")))
    }

    fn read_ident(&mut self) -> Token {
        let start = self.position;
        self.skip_while(|ch| ch.is_ascii_alphanumeric() || ch == '_');
        Token::Ident(self.input[start..self.position].to_string())
    }

    fn skip_while(&mut self, predicate: impl Fn(char) -> bool) {
        while let Some(ch) = self.current_char() {
            if !predicate(ch) {
                break;
            }
            self.advance();
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
    depth: usize,
}

impl Parser {
    fn current(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn parse_expr(&mut self) -> Result<QuantityExpr, FormulaError> {
        let mut expr = self.parse_term()?;
        loop {
            let op = match self.current() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_term()?;
            expr = QuantityExpr::Binary { op, lhs: Box::new(expr), rhs: Box::new(rhs) };
        }
        Ok(expr)
    }

    fn parse_term(&mut self) -> Result<QuantityExpr, FormulaError> {
        let mut expr = self.parse_factor()?;
        loop {
            let op = match self.current() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_factor()?;
            expr = QuantityExpr::Binary { op, lhs: Box::new(expr), rhs: Box::new(rhs) };
        }
        Ok(expr)
    }

    fn parse_factor(&mut self) -> Result<QuantityExpr, FormulaError> {
        match self.advance() {
            Some(Token::Number(value)) => Ok(QuantityExpr::Literal(value)),
            Some(Token::Ident(name)) => Ok(QuantityExpr::Variable(name)),
            Some(Token::LeftParen) => {
                self.depth += 1;
                if self.depth > MAX_NESTING_DEPTH {
                    return Err(FormulaError::Syntax(format!(
                        "parentheses nest deeper than {MAX_NESTING_DEPTH} levels"
                    )));
                }
                let inner = self.parse_expr()?;
                match self.advance() {
                    Some(Token::RightParen) => {
                        self.depth -= 1;
                        Ok(inner)
                    }
                    Some(token) => Err(FormulaError::Syntax(format!("expected `)`, found `{token}`"))),
                    None => Err(FormulaError::Syntax("unclosed `(`".to_string())),
                }
            }
            Some(token) => {
                Err(FormulaError::Syntax(format!("expected a number, variable or `(`, found `{token}`")))
            }
            None => Err(FormulaError::Syntax("formula ends where an operand was expected".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn context(pairs: &[(&str, f64)]) -> EvaluationContext {
        pairs.iter().map(|(name, value)| ((*name).to_string(), *value)).collect()
    }

    fn resolved(formula: &str, ctx: &EvaluationContext) -> u64 {
        match resolve(formula, ctx) {
            Ok(value) => value,
            Err(err) => panic!("`{formula}` should resolve: {err}"),
        }
    }

    #[test]
    fn division_rounds_up_to_whole_units() {
        assert_eq!(resolved("numPanels/4", &context(&[("numPanels", 10.0)])), 3);
        assert_eq!(resolved("numPanels/4", &context(&[("numPanels", 8.0)])), 2);
    }

    #[test]
    fn literal_and_bare_variable_formulas_resolve() {
        let ctx = context(&[("numInverters", 2.0)]);
        assert_eq!(resolved("1", &ctx), 1);
        assert_eq!(resolved("numInverters", &ctx), 2);
        assert_eq!(resolved("  0.5 ", &ctx), 1);
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let ctx = context(&[("numPanels", 6.0)]);
        assert_eq!(resolved("1 + numPanels * 2", &ctx), 13);
        assert_eq!(resolved("(1 + numPanels) * 2", &ctx), 14);
        assert_eq!(resolved("10 - 4 - 3", &ctx), 3);
    }

    #[test]
    fn floating_noise_does_not_inflate_the_count() {
        assert_eq!(resolved("(0.1 + 0.2) * 10", &EvaluationContext::new()), 3);
    }

    #[test]
    fn small_genuine_fractions_still_round_up() {
        assert_eq!(resolved("2.0000000005", &EvaluationContext::new()), 3);
        assert_eq!(resolved("numPanels/4", &context(&[("numPanels", 4.000_000_002)])), 2);
    }

    #[test]
    fn unknown_variable_is_reported_by_name() {
        let err = resolve("numStrings * 2", &context(&[("numPanels", 4.0)]));
        assert_eq!(err, Err(FormulaError::UnknownVariable("numStrings".to_string())));
    }

    #[test]
    fn division_by_zero_is_reported() {
        let err = match resolve("numPanels / 0", &context(&[("numPanels", 4.0)])) {
            Ok(value) => panic!("expected division by zero, got {value}"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), FormulaErrorKind::DivisionByZero);

        let err = resolve("4 / (numPanels - numPanels)", &context(&[("numPanels", 4.0)]));
        assert!(matches!(err, Err(FormulaError::DivisionByZero(_))));
    }

    #[test]
    fn negative_results_are_syntax_errors() {
        let err = resolve("1 - numPanels", &context(&[("numPanels", 4.0)]));
        assert!(matches!(err, Err(FormulaError::Syntax(message)) if message.contains("negative")));
    }

    #[test]
    fn non_finite_context_values_are_rejected() {
        let err = resolve("numPanels * 2", &context(&[("numPanels", f64::INFINITY)]));
        assert!(matches!(err, Err(FormulaError::Syntax(message)) if message.contains("finite")));
    }

    #[test]
    fn malformed_formulas_are_syntax_errors() {
        for formula in ["", "   ", "1 +", "(2", "2)", "-1", "3 % 2", "1.", "2 3", "numPanels /", "()"] {
            let result = QuantityExpr::parse(formula);
            assert!(
                matches!(result, Err(FormulaError::Syntax(_))),
                "`{formula}` should be a syntax error, got {result:?}"
            );
        }
    }

    #[test]
    fn formula_length_is_bounded() {
        let at_limit = format!("1{}", "+1".repeat((MAX_FORMULA_LEN - 1) / 2));
        assert!(at_limit.len() <= MAX_FORMULA_LEN);
        assert!(QuantityExpr::parse(&at_limit).is_ok());

        let over_limit = "1".repeat(MAX_FORMULA_LEN + 1);
        assert!(matches!(QuantityExpr::parse(&over_limit), Err(FormulaError::Syntax(_))));
    }

    #[test]
    fn nesting_depth_is_bounded() {
        let nested = |depth: usize| format!("{}1{}", "(".repeat(depth), ")".repeat(depth));

        assert!(QuantityExpr::parse(&nested(MAX_NESTING_DEPTH)).is_ok());
        let err = QuantityExpr::parse(&nested(MAX_NESTING_DEPTH + 1));
        assert!(matches!(err, Err(FormulaError::Syntax(message)) if message.contains("nest")));
    }

    #[test]
    fn sibling_groups_do_not_accumulate_depth() {
        let formula = "(((1))) + (((2))) + (((3)))";
        assert_eq!(resolved(formula, &EvaluationContext::new()), 6);
    }

    #[test]
    fn variables_are_collected_once() {
        let expr = match QuantityExpr::parse("numPanels / 4 + numPanels * numInverters") {
            Ok(expr) => expr,
            Err(err) => panic!("formula should parse: {err}"),
        };
        let names = expr.variables().into_iter().collect::<Vec<_>>();
        assert_eq!(names, vec!["numInverters".to_string(), "numPanels".to_string()]);
    }

    #[test]
    fn display_keeps_required_parentheses() {
        for (formula, rendered) in [
            ("numPanels/4", "numPanels / 4"),
            ("(1 + 2) * 3", "(1 + 2) * 3"),
            ("10 - (4 - 3)", "10 - (4 - 3)"),
            ("(10 - 4) - 3", "10 - 4 - 3"),
            ("8 / (2 * 2)", "8 / (2 * 2)"),
        ] {
            let expr = match QuantityExpr::parse(formula) {
                Ok(expr) => expr,
                Err(err) => panic!("`{formula}` should parse: {err}"),
            };
            assert_eq!(expr.to_string(), rendered);
        }
    }

    proptest! {
        #[test]
        fn property_ceiling_never_understates(panels in 0_u32..10_000, per_unit in 1_u32..64) {
            let ctx = context(&[("numPanels", f64::from(panels))]);
            let required = resolve(&format!("numPanels / {per_unit}"), &ctx);
            prop_assert!(required.is_ok());
            let required = required.unwrap_or_default();

            prop_assert!(required * u64::from(per_unit) >= u64::from(panels));
            prop_assert!(required == 0 || (required - 1) * u64::from(per_unit) < u64::from(panels));
        }
    }
}
