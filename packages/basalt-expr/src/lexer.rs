//! Hand-written lexer over a peekable char stream.

use basalt_core::{BasaltError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Long(i64),
    Double(f64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
    Comma,
}

pub fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut chars = input.chars().peekable();
    let mut out = Vec::new();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '0'..='9' => {
                let mut text = String::new();
                let mut is_double = false;
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        text.push(d);
                        chars.next();
                    } else if d == '.' && !is_double {
                        is_double = true;
                        text.push(d);
                        chars.next();
                    } else if (d == 'e' || d == 'E') && !text.is_empty() {
                        is_double = true;
                        text.push(d);
                        chars.next();
                        if let Some(&s) = chars.peek() {
                            if s == '+' || s == '-' {
                                text.push(s);
                                chars.next();
                            }
                        }
                    } else {
                        break;
                    }
                }
                if is_double {
                    let v: f64 = text
                        .parse()
                        .map_err(|_| BasaltError::ParseFailure(text.clone()))?;
                    out.push(Token::Double(v));
                } else {
                    let v: i64 = text
                        .parse()
                        .map_err(|_| BasaltError::ParseFailure(text.clone()))?;
                    out.push(Token::Long(v));
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                while let Some(d) = chars.next() {
                    if d == '\\' {
                        match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(esc) => text.push(esc),
                            None => break,
                        }
                    } else if d == quote {
                        closed = true;
                        break;
                    } else {
                        text.push(d);
                    }
                }
                if !closed {
                    return Err(BasaltError::ParseFailure(format!(
                        "unterminated string: {input}"
                    )));
                }
                out.push(Token::Str(text));
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' || d == '$' || d == '.' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push(Token::Ident(text));
            }
            '+' => {
                chars.next();
                out.push(Token::Plus);
            }
            '-' => {
                chars.next();
                out.push(Token::Minus);
            }
            '*' => {
                chars.next();
                out.push(Token::Star);
            }
            '/' => {
                chars.next();
                out.push(Token::Slash);
            }
            '%' => {
                chars.next();
                out.push(Token::Percent);
            }
            '(' => {
                chars.next();
                out.push(Token::LParen);
            }
            ')' => {
                chars.next();
                out.push(Token::RParen);
            }
            ',' => {
                chars.next();
                out.push(Token::Comma);
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    out.push(Token::Le);
                } else {
                    out.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    out.push(Token::Ge);
                } else {
                    out.push(Token::Gt);
                }
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                }
                out.push(Token::EqEq);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    out.push(Token::NotEq);
                } else {
                    out.push(Token::Bang);
                }
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(BasaltError::ParseFailure(format!("stray & in: {input}")));
                }
                out.push(Token::AndAnd);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(BasaltError::ParseFailure(format!("stray | in: {input}")));
                }
                out.push(Token::OrOr);
            }
            other => {
                return Err(BasaltError::ParseFailure(format!(
                    "unexpected character '{other}' in: {input}"
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_mixed() {
        let tokens = tokenize("x + 1.5 >= foo('a', 2)").unwrap();
        assert_eq!(tokens[0], Token::Ident("x".into()));
        assert_eq!(tokens[1], Token::Plus);
        assert_eq!(tokens[2], Token::Double(1.5));
        assert_eq!(tokens[3], Token::Ge);
        assert_eq!(tokens[4], Token::Ident("foo".into()));
    }

    #[test]
    fn test_unterminated_string() {
        assert!(tokenize("'abc").is_err());
    }
}
