//! Text → expression tree.
//!
//! Grammar: `(<op> <pos>... #:<kw> <value>...)`, literals are integers,
//! floats, double-quoted strings and `#t`/`#f`; `;` comments run to the end
//! of the line.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{FormulaError, FormulaResult};
use crate::expr::ast::{Call, Expr, Literal};
use crate::query::guards::MAX_PARSE_DEPTH;

static INT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[+-]?[0-9]+$").unwrap());
static FLOAT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?([0-9]+\.[0-9]*|\.[0-9]+|[0-9]+)([eE][+-]?[0-9]+)?$").unwrap()
});
static NUMERIC_START_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?\.?[0-9]").unwrap());

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Str(String),
    Keyword(String),
    Atom(String),
    Eof,
}

struct Lexer<'a> {
    input: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().peekable(),
        }
    }

    fn tokenize(mut self) -> FormulaResult<Vec<(usize, Token)>> {
        let mut tokens = Vec::new();
        loop {
            let (pos, token) = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push((pos, token));
            if done {
                return Ok(tokens);
            }
        }
    }

    fn skip_ws_and_comments(&mut self) {
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_whitespace() {
                self.chars.next();
            } else if ch == ';' {
                while let Some((_, c)) = self.chars.next() {
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn next_token(&mut self) -> FormulaResult<(usize, Token)> {
        self.skip_ws_and_comments();
        let Some(&(pos, ch)) = self.chars.peek() else {
            return Ok((self.input.len(), Token::Eof));
        };
        match ch {
            '(' => {
                self.chars.next();
                Ok((pos, Token::LParen))
            }
            ')' => {
                self.chars.next();
                Ok((pos, Token::RParen))
            }
            '"' => {
                self.chars.next();
                self.string(pos).map(|s| (pos, Token::Str(s)))
            }
            _ => {
                let word = self.bare_word();
                if let Some(name) = word.strip_prefix("#:") {
                    if name.is_empty() {
                        return Err(FormulaError::parse(pos, "keyword marker without a name"));
                    }
                    return Ok((pos, Token::Keyword(name.to_string())));
                }
                Ok((pos, Token::Atom(word)))
            }
        }
    }

    fn bare_word(&mut self) -> String {
        let mut word = String::new();
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_whitespace() || matches!(ch, '(' | ')' | '"' | ';') {
                break;
            }
            word.push(ch);
            self.chars.next();
        }
        word
    }

    fn string(&mut self, start: usize) -> FormulaResult<String> {
        let mut out = String::new();
        while let Some((pos, ch)) = self.chars.next() {
            match ch {
                '"' => return Ok(out),
                '\\' => match self.chars.next() {
                    Some((_, '"')) => out.push('"'),
                    Some((_, '\\')) => out.push('\\'),
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, other)) => {
                        return Err(FormulaError::parse(
                            pos,
                            format!("unknown escape sequence `\\{other}`"),
                        ))
                    }
                    None => break,
                },
                c => out.push(c),
            }
        }
        Err(FormulaError::parse(start, "unterminated string literal"))
    }
}

fn atom(pos: usize, word: &str) -> FormulaResult<Expr> {
    match word {
        "#t" => return Ok(Expr::Literal(Literal::Bool(true))),
        "#f" => return Ok(Expr::Literal(Literal::Bool(false))),
        _ => {}
    }
    if word.starts_with('#') {
        return Err(FormulaError::parse(
            pos,
            format!("unknown literal `{word}`"),
        ));
    }
    if INT_RE.is_match(word) {
        return word
            .parse::<i64>()
            .map(Expr::int)
            .map_err(|_| FormulaError::parse(pos, format!("integer `{word}` out of range")));
    }
    if FLOAT_RE.is_match(word) {
        return match word.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(Expr::float(v)),
            Ok(_) => Err(FormulaError::parse(pos, format!("float `{word}` out of range"))),
            Err(_) => Err(FormulaError::parse(pos, format!("malformed float `{word}`"))),
        };
    }
    if NUMERIC_START_RE.is_match(word) {
        return Err(FormulaError::parse(
            pos,
            format!("unknown literal `{word}`"),
        ));
    }
    Ok(Expr::Symbol(word.to_string()))
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    cursor: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &(usize, Token) {
        // the token list always ends with Eof
        &self.tokens[self.cursor.min(self.tokens.len() - 1)]
    }

    fn bump(&mut self) -> (usize, Token) {
        let tok = self.peek().clone();
        if self.cursor < self.tokens.len() - 1 {
            self.cursor += 1;
        }
        tok
    }

    fn expr(&mut self) -> FormulaResult<Expr> {
        let (pos, token) = self.bump();
        match token {
            Token::LParen => {
                if self.depth >= MAX_PARSE_DEPTH {
                    return Err(FormulaError::parse(
                        pos,
                        format!("expression nested deeper than {MAX_PARSE_DEPTH} levels"),
                    ));
                }
                self.depth += 1;
                let list = self.list(pos);
                self.depth -= 1;
                list
            }
            Token::RParen => Err(FormulaError::parse(pos, "unbalanced `)`")),
            Token::Str(s) => Ok(Expr::Literal(Literal::Str(s))),
            Token::Keyword(name) => Err(FormulaError::parse(
                pos,
                format!("keyword `#:{name}` outside of an argument list"),
            )),
            Token::Atom(word) => atom(pos, &word),
            Token::Eof => Err(FormulaError::parse(pos, "unexpected end of input")),
        }
    }

    fn list(&mut self, open: usize) -> FormulaResult<Expr> {
        let (pos, head) = self.bump();
        let op = match head {
            Token::Atom(word) => match atom(pos, &word)? {
                Expr::Symbol(name) => name,
                _ => {
                    return Err(FormulaError::parse(
                        pos,
                        format!("operator expected, found literal `{word}`"),
                    ))
                }
            },
            Token::RParen => return Err(FormulaError::parse(open, "empty expression `()`")),
            Token::Eof => {
                return Err(FormulaError::parse(open, "unbalanced `(`: missing `)`"));
            }
            _ => return Err(FormulaError::parse(pos, "operator expected")),
        };

        let mut args = Vec::new();
        let mut kwargs = BTreeMap::new();
        loop {
            let (pos, token) = self.peek().clone();
            match token {
                Token::RParen => {
                    self.bump();
                    break;
                }
                Token::Eof => {
                    return Err(FormulaError::parse(open, "unbalanced `(`: missing `)`"));
                }
                Token::Keyword(name) => {
                    self.bump();
                    if matches!(
                        self.peek().1,
                        Token::RParen | Token::Eof | Token::Keyword(_)
                    ) {
                        return Err(FormulaError::parse(
                            pos,
                            format!("keyword `#:{name}` has no value"),
                        ));
                    }
                    let value = self.expr()?;
                    if kwargs.insert(name.clone(), value).is_some() {
                        return Err(FormulaError::parse(
                            pos,
                            format!("duplicate keyword `#:{name}`"),
                        ));
                    }
                }
                _ if !kwargs.is_empty() => {
                    return Err(FormulaError::parse(
                        pos,
                        "positional argument after keyword arguments",
                    ));
                }
                _ => args.push(self.expr()?),
            }
        }
        Ok(Expr::Call(Call { op, args, kwargs }))
    }
}

/// Parse a single expression.
pub fn parse(text: &str) -> FormulaResult<Expr> {
    let tokens = Lexer::new(text).tokenize()?;
    let mut parser = Parser {
        tokens,
        cursor: 0,
        depth: 0,
    };
    let expr = parser.expr()?;
    match parser.bump() {
        (_, Token::Eof) => Ok(expr),
        (pos, Token::RParen) => Err(FormulaError::parse(pos, "unbalanced `)`")),
        (pos, _) => Err(FormulaError::parse(pos, "unexpected input after expression")),
    }
}
