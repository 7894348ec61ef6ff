//! Rewriting of mapping expressions against a base path.
//!
//! Mappings are written relative to the view that declares them. Before they
//! can be projected, every attribute path in them is re-rooted at the path
//! through which the view is reached (`name` under `e.owner` becomes
//! `e.owner.name`). Function names, keywords, literals and `:parameters`
//! stay as they are.

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, take_while, take_while1},
    character::complete::{char, digit1, multispace1, one_of},
    combinator::{map, opt, recognize},
    multi::many0,
    sequence::{delimited, pair},
    IResult,
};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token<'a> {
    Path(&'a str),
    Parameter(&'a str),
    StringLit(&'a str),
    Number(&'a str),
    Symbol(char),
    Whitespace(&'a str),
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn parse_ws(input: &str) -> IResult<&str, Token<'_>> {
    map(multispace1, Token::Whitespace)(input)
}

fn parse_string_lit(input: &str) -> IResult<&str, Token<'_>> {
    map(
        recognize(delimited(
            char('\''),
            many0(alt((tag("''"), is_not("'")))),
            char('\''),
        )),
        Token::StringLit,
    )(input)
}

fn parse_parameter(input: &str) -> IResult<&str, Token<'_>> {
    map(
        recognize(pair(char(':'), take_while1(is_ident_char))),
        Token::Parameter,
    )(input)
}

fn parse_number(input: &str) -> IResult<&str, Token<'_>> {
    map(
        recognize(pair(digit1, opt(pair(char('.'), digit1)))),
        Token::Number,
    )(input)
}

fn parse_path(input: &str) -> IResult<&str, Token<'_>> {
    map(
        recognize(pair(
            pair(take_while1(is_ident_start), take_while(is_ident_char)),
            many0(pair(char('.'), take_while1(is_ident_char))),
        )),
        Token::Path,
    )(input)
}

fn parse_symbol(input: &str) -> IResult<&str, Token<'_>> {
    map(one_of("=<>!+-*/%(),|[]?&"), Token::Symbol)(input)
}

fn tokenize(input: &str) -> Result<Vec<Token<'_>>, String> {
    let (rest, tokens) = many0(alt((
        parse_ws,
        parse_string_lit,
        parse_parameter,
        parse_number,
        parse_path,
        parse_symbol,
    )))(input)
    .map_err(|e| format!("parse error: {}", e))?;

    if rest.starts_with('\'') {
        return Err("unterminated string literal".to_string());
    }
    if !rest.is_empty() {
        return Err(format!("unexpected input at '{}'", rest));
    }

    let mut depth = 0i32;
    for token in &tokens {
        match token {
            Token::Symbol('(') => depth += 1,
            Token::Symbol(')') => {
                depth -= 1;
                if depth < 0 {
                    return Err("unbalanced parentheses".to_string());
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err("unbalanced parentheses".to_string());
    }
    Ok(tokens)
}

fn is_keyword(s: &str) -> bool {
    const KEYWORDS: [&str; 26] = [
        "AND", "OR", "NOT", "IS", "NULL", "TRUE", "FALSE", "IN", "LIKE", "BETWEEN", "CASE",
        "WHEN", "THEN", "ELSE", "END", "AS", "ASC", "DESC", "DISTINCT", "MEMBER", "OF", "EMPTY",
        "ESCAPE", "NULLS", "FIRST", "LAST",
    ];
    KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(s))
}

fn next_significant<'t, 'a>(tokens: &'t [Token<'a>], from: usize) -> Option<(usize, &'t Token<'a>)> {
    tokens
        .iter()
        .enumerate()
        .skip(from)
        .find(|(_, t)| !matches!(t, Token::Whitespace(_)))
}

/// `VIEW_ROOT ( path )` starting at `at`: the path and the index of `)`.
fn view_root_argument<'a>(tokens: &[Token<'a>], at: usize) -> Option<(&'a str, usize)> {
    let (open, token) = next_significant(tokens, at + 1)?;
    if *token != Token::Symbol('(') {
        return None;
    }
    let (path_at, token) = next_significant(tokens, open + 1)?;
    let path = match token {
        Token::Path(path) => *path,
        _ => return None,
    };
    let (close, token) = next_significant(tokens, path_at + 1)?;
    (*token == Token::Symbol(')')).then_some((path, close))
}

/// Re-roots every attribute path of `expression` at `prefix`.
///
/// `this` (alone or as first segment) stands for the prefix itself; an empty
/// expression maps to the prefix. `VIEW_ROOT(path)` resolves `path` against
/// `root` instead.
pub fn prefix_expression(
    prefix: Option<&str>,
    root: Option<&str>,
    expression: &str,
) -> Result<String, String> {
    let trimmed = expression.trim();
    if trimmed.is_empty() || trimmed == "this" {
        return prefix
            .map(str::to_string)
            .ok_or_else(|| format!("'{}' needs a base path", trimmed));
    }

    let tokens = tokenize(trimmed)?;
    let mut out = String::with_capacity(trimmed.len() + 16);
    let mut i = 0;
    while i < tokens.len() {
        match tokens[i] {
            Token::Path(path) if path.eq_ignore_ascii_case("VIEW_ROOT") => {
                let inner = view_root_argument(&tokens, i);
                let (inner, close) =
                    inner.ok_or_else(|| "VIEW_ROOT expects a single path".to_string())?;
                let root = root.ok_or_else(|| "VIEW_ROOT is not available here".to_string())?;
                out.push_str(root);
                out.push('.');
                out.push_str(inner);
                i = close + 1;
                continue;
            }
            Token::Path(path) => {
                let is_function = matches!(next_significant(&tokens, i + 1), Some((_, Token::Symbol('('))));
                if is_function || is_keyword(path) {
                    out.push_str(path);
                } else {
                    let (head, tail) = match path.split_once('.') {
                        Some((head, tail)) => (head, Some(tail)),
                        None => (path, None),
                    };
                    match (head, prefix) {
                        ("this", Some(prefix)) => {
                            out.push_str(prefix);
                            if let Some(tail) = tail {
                                out.push('.');
                                out.push_str(tail);
                            }
                        }
                        ("this", None) => return Err("'this' needs a base path".to_string()),
                        (_, Some(prefix)) => {
                            out.push_str(prefix);
                            out.push('.');
                            out.push_str(path);
                        }
                        (_, None) => out.push_str(path),
                    }
                }
            }
            Token::Parameter(s) | Token::StringLit(s) | Token::Number(s) | Token::Whitespace(s) => {
                out.push_str(s)
            }
            Token::Symbol(c) => out.push(c),
        }
        i += 1;
    }
    Ok(out)
}

/// True for a single attribute path such as `owner.name` or `this`.
pub fn is_plain_path(expression: &str) -> bool {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return true;
    }
    match tokenize(trimmed) {
        Ok(tokens) => matches!(tokens.as_slice(), [Token::Path(p)] if !is_keyword(p)),
        Err(_) => false,
    }
}

/// Validates an expression without rewriting it.
pub fn check_expression(expression: &str) -> Result<(), String> {
    tokenize(expression.trim()).map(|_| ())
}
