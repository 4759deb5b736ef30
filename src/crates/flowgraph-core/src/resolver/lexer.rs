//! Tokenizer for the expression sublanguage.
//!
//! Malformed input produces a [`LexError`]; callers degrade that to a
//! `null` resolution. The lexer itself never panics.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    True,
    False,
    Null,
    Bang,
    OrOr,
    AndAnd,
    EqEq,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
    Question,
    Colon,
    LParen,
    RParen,
    Dot,
    LBracket,
    RBracket,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LexError(pub String);

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lex error: {}", self.0)
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

pub(crate) fn tokenize(src: &str) -> Result<Vec<Token>, LexError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(LexError("'=' is not an operator, use '=='".to_string()));
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(LexError("single '|'".to_string()));
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(LexError("single '&'".to_string()));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < chars.len() {
                    let ch = chars[j];
                    if ch == '\\' && j + 1 < chars.len() {
                        let next = chars[j + 1];
                        match next {
                            '\\' | '\'' | '"' => value.push(next),
                            'n' => value.push('\n'),
                            't' => value.push('\t'),
                            other => {
                                value.push('\\');
                                value.push(other);
                            }
                        }
                        j += 2;
                    } else if ch == quote {
                        closed = true;
                        j += 1;
                        break;
                    } else {
                        value.push(ch);
                        j += 1;
                    }
                }
                if !closed {
                    return Err(LexError("unterminated string literal".to_string()));
                }
                tokens.push(Token::Str(value));
                i = j;
            }
            '-' | '0'..='9' => {
                let start = i;
                let mut j = i;
                if chars[j] == '-' {
                    j += 1;
                    if !matches!(chars.get(j), Some(&('0'..='9'))) {
                        return Err(LexError("'-' not followed by a digit".to_string()));
                    }
                }
                while matches!(chars.get(j), Some(&('0'..='9'))) {
                    j += 1;
                }
                let mut is_float = false;
                if chars.get(j) == Some(&'.') && matches!(chars.get(j + 1), Some(&('0'..='9'))) {
                    is_float = true;
                    j += 1;
                    while matches!(chars.get(j), Some(&('0'..='9'))) {
                        j += 1;
                    }
                }
                let text: String = chars[start..j].iter().collect();
                if is_float {
                    let value = text
                        .parse::<f64>()
                        .map_err(|_| LexError(format!("bad number '{}'", text)))?;
                    tokens.push(Token::Float(value));
                } else {
                    let value = text
                        .parse::<i64>()
                        .map_err(|_| LexError(format!("bad number '{}'", text)))?;
                    tokens.push(Token::Int(value));
                }
                i = j;
            }
            c if is_ident_start(c) => {
                let mut j = i;
                while matches!(chars.get(j), Some(&ch) if is_ident_continue(ch)) {
                    j += 1;
                }
                let text: String = chars[i..j].iter().collect();
                tokens.push(match text.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(text),
                });
                i = j;
            }
            other => return Err(LexError(format!("unexpected character '{}'", other))),
        }
    }

    Ok(tokens)
}
