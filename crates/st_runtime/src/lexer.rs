//! Tokenizer for the Structured Text subset

use crate::error::CompileError;

/// A lexical token
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Ident(String),
    Int(i64),
    Real(f64),
    Str(String),
    /// `:=`
    Assign,
    Colon,
    Semi,
    Comma,
    Dot,
    LParen,
    RParen,
    Eq,
    /// `<>`
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
}

/// A token tagged with its 1-based source line
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub tok: Tok,
    pub line: u32,
}

impl Token {
    /// Whether this token is the given keyword (case-insensitive)
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(&self.tok, Tok::Ident(s) if s.eq_ignore_ascii_case(keyword))
    }
}

/// Split source text into tokens, dropping whitespace and `(* ... *)` comments
pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, CompileError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut line: u32 = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '\n' {
            line += 1;
            i += 1;
            continue;
        }
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // Block comment
        if c == '(' && chars.get(i + 1) == Some(&'*') {
            let start_line = line;
            i += 2;
            loop {
                match chars.get(i) {
                    None => return Err(CompileError::at(start_line, "Unterminated comment")),
                    Some('*') if chars.get(i + 1) == Some(&')') => {
                        i += 2;
                        break;
                    }
                    Some('\n') => {
                        line += 1;
                        i += 1;
                    }
                    Some(_) => i += 1,
                }
            }
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            tokens.push(Token {
                tok: Tok::Ident(word),
                line,
            });
            continue;
        }

        if c.is_ascii_digit() {
            let (tok, next) = lex_number(&chars, i, line)?;
            tokens.push(Token { tok, line });
            i = next;
            continue;
        }

        if c == '\'' || c == '"' {
            let start_line = line;
            i += 1;
            let mut text = String::new();
            loop {
                match chars.get(i) {
                    None | Some('\n') => {
                        return Err(CompileError::at(start_line, "Unterminated string literal"));
                    }
                    Some(&q) if q == c => {
                        i += 1;
                        break;
                    }
                    Some(&other) => {
                        text.push(other);
                        i += 1;
                    }
                }
            }
            tokens.push(Token {
                tok: Tok::Str(text),
                line,
            });
            continue;
        }

        let next = chars.get(i + 1).copied();
        let (tok, width) = match (c, next) {
            (':', Some('=')) => (Tok::Assign, 2),
            ('<', Some('>')) => (Tok::Ne, 2),
            ('<', Some('=')) => (Tok::Le, 2),
            ('>', Some('=')) => (Tok::Ge, 2),
            (':', _) => (Tok::Colon, 1),
            (';', _) => (Tok::Semi, 1),
            (',', _) => (Tok::Comma, 1),
            ('.', _) => (Tok::Dot, 1),
            ('(', _) => (Tok::LParen, 1),
            (')', _) => (Tok::RParen, 1),
            ('=', _) => (Tok::Eq, 1),
            ('<', _) => (Tok::Lt, 1),
            ('>', _) => (Tok::Gt, 1),
            ('+', _) => (Tok::Plus, 1),
            ('-', _) => (Tok::Minus, 1),
            ('*', _) => (Tok::Star, 1),
            ('/', _) => (Tok::Slash, 1),
            _ => return Err(CompileError::at(line, format!("Unexpected character '{c}'"))),
        };
        tokens.push(Token { tok, line });
        i += width;
    }

    Ok(tokens)
}

fn lex_number(chars: &[char], start: usize, line: u32) -> Result<(Tok, usize), CompileError> {
    let mut i = start;
    let mut text = String::new();
    let mut is_real = false;

    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '_') {
        if chars[i] != '_' {
            text.push(chars[i]);
        }
        i += 1;
    }

    // Fractional part only when a digit follows the dot
    if chars.get(i) == Some(&'.') && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) {
        is_real = true;
        text.push('.');
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
            text.push(chars[i]);
            i += 1;
        }
    }

    if matches!(chars.get(i), Some('e') | Some('E')) {
        let mut j = i + 1;
        let mut exponent = String::from("e");
        if matches!(chars.get(j), Some('+') | Some('-')) {
            exponent.push(chars[j]);
            j += 1;
        }
        if chars.get(j).is_some_and(|c| c.is_ascii_digit()) {
            while j < chars.len() && chars[j].is_ascii_digit() {
                exponent.push(chars[j]);
                j += 1;
            }
            is_real = true;
            text.push_str(&exponent);
            i = j;
        }
    }

    let tok = if is_real {
        text.parse::<f64>()
            .map(Tok::Real)
            .map_err(|_| CompileError::at(line, format!("Invalid number '{text}'")))?
    } else {
        text.parse::<i64>()
            .map(Tok::Int)
            .map_err(|_| CompileError::at(line, format!("Invalid number '{text}'")))?
    };
    Ok((tok, i))
}
