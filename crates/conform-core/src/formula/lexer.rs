//! Tokenizer for spreadsheet-style formulas.

use crate::error::FormulaError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Str(String),
    /// `{{FieldName}}`
    Ref(String),
    /// Function name or bare `TRUE` / `FALSE`, upper-cased
    Ident(String),
    LParen,
    RParen,
    Comma,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Amp,
    Plus,
    Minus,
    Star,
    Slash,
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Token::Int(i) => format!("integer {i}"),
            Token::Str(s) => format!("string {s:?}"),
            Token::Ref(r) => format!("reference {{{{{r}}}}}"),
            Token::Ident(i) => format!("identifier {i}"),
            Token::LParen => "'('".into(),
            Token::RParen => "')'".into(),
            Token::Comma => "','".into(),
            Token::Eq => "'='".into(),
            Token::Ne => "'<>'".into(),
            Token::Lt => "'<'".into(),
            Token::Le => "'<='".into(),
            Token::Gt => "'>'".into(),
            Token::Ge => "'>='".into(),
            Token::Amp => "'&'".into(),
            Token::Plus => "'+'".into(),
            Token::Minus => "'-'".into(),
            Token::Star => "'*'".into(),
            Token::Slash => "'/'".into(),
        }
    }
}

/// Split a formula into tokens. A single leading `=` is dropped.
pub fn tokenize(src: &str) -> Result<Vec<Token>, FormulaError> {
    let body = src.trim_start();
    let body = body.strip_prefix('=').unwrap_or(body);
    let offset_base = src.len() - body.len();
    let chars: Vec<(usize, char)> = body.char_indices().collect();

    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let (pos, c) = chars[i];
        let offset = offset_base + pos;
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
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '&' => {
                tokens.push(Token::Amp);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '=' => {
                // `==` is accepted as a synonym for `=`
                i += if peek(&chars, i + 1) == Some('=') { 2 } else { 1 };
                tokens.push(Token::Eq);
            }
            '!' if peek(&chars, i + 1) == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '<' => match peek(&chars, i + 1) {
                Some('=') => {
                    tokens.push(Token::Le);
                    i += 2;
                }
                Some('>') => {
                    tokens.push(Token::Ne);
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            },
            '>' => {
                if peek(&chars, i + 1) == Some('=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '"' | '\'' => {
                let (s, next) = lex_string(&chars, i, c, offset)?;
                tokens.push(Token::Str(s));
                i = next;
            }
            '{' if peek(&chars, i + 1) == Some('{') => {
                let (name, next) = lex_reference(&chars, i + 2, offset)?;
                tokens.push(Token::Ref(name));
                i = next;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while peek(&chars, i).is_some_and(|d| d.is_ascii_digit()) {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().map(|(_, ch)| ch).collect();
                let n = literal
                    .parse::<i64>()
                    .map_err(|_| FormulaError::IntegerRange { literal })?;
                tokens.push(Token::Int(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while peek(&chars, i).is_some_and(|d| d.is_ascii_alphanumeric() || d == '_' || d == '.') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().map(|(_, ch)| ch).collect();
                tokens.push(Token::Ident(ident.to_ascii_uppercase()));
            }
            other => {
                return Err(FormulaError::UnexpectedChar { ch: other, offset });
            }
        }
    }
    Ok(tokens)
}

fn peek(chars: &[(usize, char)], i: usize) -> Option<char> {
    chars.get(i).map(|(_, c)| *c)
}

/// Quoted string; a doubled quote inside is an escaped quote.
fn lex_string(
    chars: &[(usize, char)],
    open: usize,
    quote: char,
    offset: usize,
) -> Result<(String, usize), FormulaError> {
    let mut out = String::new();
    let mut i = open + 1;
    loop {
        match peek(chars, i) {
            None => {
                return Err(FormulaError::Unterminated {
                    what: "string",
                    offset,
                })
            }
            Some(c) if c == quote => {
                if peek(chars, i + 1) == Some(quote) {
                    out.push(quote);
                    i += 2;
                } else {
                    return Ok((out, i + 1));
                }
            }
            Some(c) => {
                out.push(c);
                i += 1;
            }
        }
    }
}

fn lex_reference(
    chars: &[(usize, char)],
    start: usize,
    offset: usize,
) -> Result<(String, usize), FormulaError> {
    let mut i = start;
    while i < chars.len() {
        if peek(chars, i) == Some('}') && peek(chars, i + 1) == Some('}') {
            let name: String = chars[start..i].iter().map(|(_, c)| c).collect();
            return Ok((name.trim().to_string(), i + 2));
        }
        i += 1;
    }
    Err(FormulaError::Unterminated {
        what: "reference",
        offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_comparison_and_call() {
        let toks = tokenize("={{HasSyntax}} = TRUE()").unwrap();
        assert_eq!(
            toks,
            vec![
                Token::Ref("HasSyntax".into()),
                Token::Eq,
                Token::Ident("TRUE".into()),
                Token::LParen,
                Token::RParen,
            ]
        );
    }

    #[test]
    fn strings_with_escaped_quotes() {
        let toks = tokenize(r#"="say ""hi""" & 'it''s'"#).unwrap();
        assert_eq!(
            toks,
            vec![
                Token::Str("say \"hi\"".into()),
                Token::Amp,
                Token::Str("it's".into())
            ]
        );
    }

    #[test]
    fn two_char_operators() {
        let toks = tokenize("1 <> 2 != 3 <= 4 >= 5 == 6").unwrap();
        assert_eq!(
            toks,
            vec![
                Token::Int(1),
                Token::Ne,
                Token::Int(2),
                Token::Ne,
                Token::Int(3),
                Token::Le,
                Token::Int(4),
                Token::Ge,
                Token::Int(5),
                Token::Eq,
                Token::Int(6),
            ]
        );
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(matches!(
            tokenize("=\"open"),
            Err(FormulaError::Unterminated { what: "string", .. })
        ));
    }

    #[test]
    fn stray_character_reports_offset() {
        assert_eq!(
            tokenize("=1 # 2"),
            Err(FormulaError::UnexpectedChar { ch: '#', offset: 3 })
        );
    }
}
