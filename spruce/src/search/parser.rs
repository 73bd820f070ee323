//! # Search expression parser
//!
//! The search grammar is a small S-expression dialect: fully
//! parenthesized forms `(op arg…)`, double-quoted strings with `\`
//! escaping, and unquoted atoms decoding as booleans, numbers or
//! symbols. Parsing is based on the great lib [`chumsky`].

use std::fmt;

use chumsky::prelude::*;

use crate::error::{Error, Result};

pub(crate) type ParserError<'a> = extra::Err<Rich<'a, char>>;

/// One node of a parsed search expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Term {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Symbol(String),
    List(Vec<Term>),
}

/// Classify an unquoted atom: booleans first, then integers, then
/// floats (the atom must look fractional), otherwise a symbol.
fn classify_atom(atom: String) -> Term {
    match atom.as_str() {
        "true" | "#t" => return Term::Bool(true),
        "false" | "#f" => return Term::Bool(false),
        _ => {}
    }

    if let Ok(n) = atom.parse::<i64>() {
        return Term::Int(n);
    }

    if atom.contains(['.', 'e', 'E']) {
        if let Ok(f) = atom.parse::<f64>() {
            return Term::Float(f);
        }
    }

    Term::Symbol(atom)
}

fn ws<'a>() -> impl Parser<'a, &'a str, (), ParserError<'a>> + Clone {
    one_of([' ', '\t', '\r', '\n']).repeated().ignored()
}

fn lparen<'a>() -> impl Parser<'a, &'a str, char, ParserError<'a>> + Clone {
    just('(').labelled("opening '('")
}

fn rparen<'a>() -> impl Parser<'a, &'a str, char, ParserError<'a>> + Clone {
    just(')').labelled("closing ')'")
}

fn bslash<'a>() -> impl Parser<'a, &'a str, char, ParserError<'a>> + Clone {
    just('\\').labelled("backslash")
}

fn dquote<'a>() -> impl Parser<'a, &'a str, char, ParserError<'a>> + Clone {
    just('"').labelled("double quote")
}

fn string<'a>() -> impl Parser<'a, &'a str, Term, ParserError<'a>> + Clone {
    let escapable_chars = ['\\', '"'];

    dquote()
        .ignore_then(
            choice((
                bslash().ignore_then(one_of(escapable_chars)),
                none_of(escapable_chars),
            ))
            .repeated()
            .collect::<String>(),
        )
        .then_ignore(dquote())
        .map(Term::Str)
}

fn atom<'a>() -> impl Parser<'a, &'a str, Term, ParserError<'a>> + Clone {
    none_of([' ', '\t', '\r', '\n', '(', ')', '"'])
        .repeated()
        .at_least(1)
        .collect::<String>()
        .map(classify_atom)
        .labelled("atom")
}

fn term<'a>() -> impl Parser<'a, &'a str, Term, ParserError<'a>> + Clone {
    recursive(|term| {
        let list = term
            .then_ignore(ws())
            .repeated()
            .collect::<Vec<Term>>()
            .delimited_by(lparen().then_ignore(ws()), rparen())
            .map(Term::List);

        choice((string(), list, atom()))
    })
}

fn expression<'a>() -> impl Parser<'a, &'a str, Term, ParserError<'a>> + Clone {
    ws().ignore_then(
        term()
            .try_map(|term, span| match term {
                Term::List(_) => Ok(term),
                _ => Err(Rich::custom(span, "expected a parenthesized expression")),
            })
            .labelled("parenthesized expression"),
    )
    .then_ignore(ws())
}

/// Parse a complete search expression. The whole input must be one
/// parenthesized form.
pub fn parse(input: &str) -> Result<Term> {
    expression().parse(input).into_result().map_err(|errs| {
        let reasons: Vec<String> = errs.into_iter().map(|err| err.to_string()).collect();
        Error::Search(format!("cannot parse expression: {}", reasons.join("; ")))
    })
}

/// The canonical rendering of a term: parsing it back yields an
/// equivalent expression.
impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Bool(true) => write!(f, "true"),
            Term::Bool(false) => write!(f, "false"),
            Term::Int(n) => write!(f, "{n}"),
            Term::Float(x) => {
                let s = format!("{x:?}");
                if s.contains(['.', 'e', 'E', 'N', 'i']) {
                    write!(f, "{s}")
                } else {
                    write!(f, "{s}.0")
                }
            }
            Term::Str(s) => {
                write!(f, "\"")?;
                for c in s.chars() {
                    if c == '"' || c == '\\' {
                        write!(f, "\\")?;
                    }
                    write!(f, "{c}")?;
                }
                write!(f, "\"")
            }
            Term::Symbol(s) => write!(f, "{s}"),
            Term::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse, Term};

    #[test]
    fn atoms() {
        assert_eq!(
            parse("(x true #f 42 -7 3.5 \"hi\")").unwrap(),
            Term::List(vec![
                Term::Symbol("x".into()),
                Term::Bool(true),
                Term::Bool(false),
                Term::Int(42),
                Term::Int(-7),
                Term::Float(3.5),
                Term::Str("hi".into()),
            ])
        );
    }

    #[test]
    fn nesting_and_whitespace() {
        assert_eq!(
            parse("  ( and (= 1 1)\n\t(> 2 1) )  ").unwrap(),
            Term::List(vec![
                Term::Symbol("and".into()),
                Term::List(vec![
                    Term::Symbol("=".into()),
                    Term::Int(1),
                    Term::Int(1)
                ]),
                Term::List(vec![
                    Term::Symbol(">".into()),
                    Term::Int(2),
                    Term::Int(1)
                ]),
            ])
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            parse(r#"(f "a \"quoted\" \\ thing")"#).unwrap(),
            Term::List(vec![
                Term::Symbol("f".into()),
                Term::Str(r#"a "quoted" \ thing"#.into()),
            ])
        );
    }

    #[test]
    fn top_level_must_be_parenthesized() {
        assert!(parse("42").is_err());
        assert!(parse("(unclosed").is_err());
        assert!(parse("(a) trailing").is_err());
    }

    #[test]
    fn pretty_round_trips() {
        let exprs = [
            "(and (match-all (system-flag \"seen\")) (match-all (system-flag \"answered\")))",
            "(if (> 3 2) \"y\\\"es\" (+ 1 2.5))",
            "(begin (cast-string 1) (cast-int \"42\"))",
        ];

        for expr in exprs {
            let term = parse(expr).unwrap();
            let pretty = term.to_string();
            assert_eq!(parse(&pretty).unwrap(), term, "{expr} -> {pretty}");
        }
    }
}
