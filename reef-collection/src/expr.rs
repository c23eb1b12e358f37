//! The find/count expression grammar.
//!
//! An expression is a conjunction of terms joined by `&&`; a term is
//! `field op literal` with `op` one of `=`, `!=`, `<`, `<=`, `>`, `>=` or
//! the word `contains`. Literals may be single-quoted to protect spaces.
//! There is no disjunction and no free-text search.

use std::fmt;

use crate::{Error, Result};

/// Comparison operator of a term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `contains`, for map and list columns.
    Contains,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::Eq => "=",
            Op::Ne => "!=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Contains => "contains",
        };
        write!(f, "{s}")
    }
}

/// One `field op literal` comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Term {
    /// The document field, dotted for nested access.
    pub field: String,
    /// The comparison.
    pub op: Op,
    /// The right-hand side, unquoted.
    pub literal: String,
}

/// A parsed conjunction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expr {
    /// The terms; all must hold.
    pub terms: Vec<Term>,
}

impl Expr {
    /// Parse an expression string.
    pub fn parse(input: &str) -> Result<Expr> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::invalid("empty expression"));
        }
        let terms = input
            .split("&&")
            .map(parse_term)
            .collect::<Result<Vec<_>>>()?;
        Ok(Expr { terms })
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                write!(f, " && ")?;
            }
            write!(f, "{} {} {}", term.field, term.op, term.literal)?;
        }
        Ok(())
    }
}

fn parse_term(input: &str) -> Result<Term> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::invalid("empty term"));
    }

    // the word operator first: `field contains literal`
    if let Some((field, literal)) = input.split_once(" contains ") {
        return build_term(field, Op::Contains, literal);
    }

    // two-character operators before their one-character prefixes
    for (token, op) in [
        ("<=", Op::Le),
        (">=", Op::Ge),
        ("!=", Op::Ne),
        ("<", Op::Lt),
        (">", Op::Gt),
        ("=", Op::Eq),
    ] {
        if let Some(pos) = input.find(token) {
            let (field, rest) = input.split_at(pos);
            return build_term(field, op, &rest[token.len()..]);
        }
    }
    Err(Error::invalid(format!("no operator in term {input:?}")))
}

fn build_term(field: &str, op: Op, literal: &str) -> Result<Term> {
    let field = field.trim();
    if field.is_empty() {
        return Err(Error::invalid("term without a field"));
    }
    let literal = literal.trim();
    let literal = literal
        .strip_prefix('\'')
        .and_then(|l| l.strip_suffix('\''))
        .unwrap_or(literal);
    if literal.is_empty() {
        return Err(Error::invalid("term without a literal"));
    }
    Ok(Term {
        field: field.to_string(),
        op,
        literal: literal.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term(field: &str, op: Op, literal: &str) -> Term {
        Term {
            field: field.to_string(),
            op,
            literal: literal.to_string(),
        }
    }

    #[test]
    fn test_parse_single_term() {
        let expr = Expr::parse("name=ann").unwrap();
        assert_eq!(expr.terms, vec![term("name", Op::Eq, "ann")]);
    }

    #[test]
    fn test_parse_operators() {
        for (input, op) in [
            ("age<30", Op::Lt),
            ("age<=30", Op::Le),
            ("age>30", Op::Gt),
            ("age>=30", Op::Ge),
            ("age!=30", Op::Ne),
            ("age=30", Op::Eq),
        ] {
            let expr = Expr::parse(input).unwrap();
            assert_eq!(expr.terms[0].op, op, "{input}");
            assert_eq!(expr.terms[0].literal, "30", "{input}");
        }
    }

    #[test]
    fn test_parse_contains() {
        let expr = Expr::parse("tags contains b").unwrap();
        assert_eq!(expr.terms, vec![term("tags", Op::Contains, "b")]);
    }

    #[test]
    fn test_parse_conjunction() {
        let expr = Expr::parse("name=ann && age>=30 && tags contains x").unwrap();
        assert_eq!(
            expr.terms,
            vec![
                term("name", Op::Eq, "ann"),
                term("age", Op::Ge, "30"),
                term("tags", Op::Contains, "x"),
            ]
        );
    }

    #[test]
    fn test_parse_quoted_literal() {
        let expr = Expr::parse("name='ann lee'").unwrap();
        assert_eq!(expr.terms[0].literal, "ann lee");
    }

    #[test]
    fn test_literal_may_carry_equals() {
        // map equality: the literal itself contains a key=value pair
        let expr = Expr::parse("addresses=home=berlin").unwrap();
        assert_eq!(expr.terms, vec![term("addresses", Op::Eq, "home=berlin")]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("name").is_err());
        assert!(Expr::parse("=x").is_err());
        assert!(Expr::parse("name=").is_err());
        assert!(Expr::parse("a=1 && ").is_err());
    }
}
