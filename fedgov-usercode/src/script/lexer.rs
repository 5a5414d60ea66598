//! Tokenizer for FedGov script.

use std::fmt;

use super::{ScriptError, ScriptResult};

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub col: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    // Keywords
    Fn,
    Let,
    If,
    Else,
    For,
    In,
    While,
    Return,
    Break,
    Continue,
    And,
    Or,
    Not,
    True,
    False,
    None,

    // Identifiers and literals
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),

    // Structural
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Semi,
    Arrow,

    // Operators
    Assign,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Fn => write!(f, "`fn`"),
            TokenKind::Let => write!(f, "`let`"),
            TokenKind::If => write!(f, "`if`"),
            TokenKind::Else => write!(f, "`else`"),
            TokenKind::For => write!(f, "`for`"),
            TokenKind::In => write!(f, "`in`"),
            TokenKind::While => write!(f, "`while`"),
            TokenKind::Return => write!(f, "`return`"),
            TokenKind::Break => write!(f, "`break`"),
            TokenKind::Continue => write!(f, "`continue`"),
            TokenKind::And => write!(f, "`and`"),
            TokenKind::Or => write!(f, "`or`"),
            TokenKind::Not => write!(f, "`not`"),
            TokenKind::True => write!(f, "`true`"),
            TokenKind::False => write!(f, "`false`"),
            TokenKind::None => write!(f, "`none`"),
            TokenKind::Ident(name) => write!(f, "identifier `{name}`"),
            TokenKind::Int(value) => write!(f, "integer {value}"),
            TokenKind::Float(value) => write!(f, "float {value:?}"),
            TokenKind::Str(_) => write!(f, "string literal"),
            TokenKind::LParen => write!(f, "`(`"),
            TokenKind::RParen => write!(f, "`)`"),
            TokenKind::LBrace => write!(f, "`{{`"),
            TokenKind::RBrace => write!(f, "`}}`"),
            TokenKind::LBracket => write!(f, "`[`"),
            TokenKind::RBracket => write!(f, "`]`"),
            TokenKind::Comma => write!(f, "`,`"),
            TokenKind::Colon => write!(f, "`:`"),
            TokenKind::Semi => write!(f, "`;`"),
            TokenKind::Arrow => write!(f, "`->`"),
            TokenKind::Assign => write!(f, "`=`"),
            TokenKind::Eq => write!(f, "`==`"),
            TokenKind::NotEq => write!(f, "`!=`"),
            TokenKind::Lt => write!(f, "`<`"),
            TokenKind::Le => write!(f, "`<=`"),
            TokenKind::Gt => write!(f, "`>`"),
            TokenKind::Ge => write!(f, "`>=`"),
            TokenKind::Plus => write!(f, "`+`"),
            TokenKind::Minus => write!(f, "`-`"),
            TokenKind::Star => write!(f, "`*`"),
            TokenKind::Slash => write!(f, "`/`"),
            TokenKind::Percent => write!(f, "`%`"),
            TokenKind::Eof => write!(f, "end of input"),
        }
    }
}

pub struct Lexer {
    input: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    pub fn tokenize(&mut self) -> ScriptResult<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace_and_comments();
            if self.pos >= self.input.len() {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    line: self.line,
                    col: self.col,
                });
                break;
            }
            tokens.push(self.next_token()?);
        }
        Ok(tokens)
    }

    fn next_token(&mut self) -> ScriptResult<Token> {
        let ch = self.input[self.pos];
        let (line, col) = (self.line, self.col);
        let kind = match ch {
            '(' => self.single(TokenKind::LParen),
            ')' => self.single(TokenKind::RParen),
            '{' => self.single(TokenKind::LBrace),
            '}' => self.single(TokenKind::RBrace),
            '[' => self.single(TokenKind::LBracket),
            ']' => self.single(TokenKind::RBracket),
            ',' => self.single(TokenKind::Comma),
            ':' => self.single(TokenKind::Colon),
            ';' => self.single(TokenKind::Semi),
            '+' => self.single(TokenKind::Plus),
            '*' => self.single(TokenKind::Star),
            '/' => self.single(TokenKind::Slash),
            '%' => self.single(TokenKind::Percent),
            '-' if self.peek_at(1) == Some('>') => self.double(TokenKind::Arrow),
            '-' => self.single(TokenKind::Minus),
            '=' if self.peek_at(1) == Some('=') => self.double(TokenKind::Eq),
            '=' => self.single(TokenKind::Assign),
            '!' if self.peek_at(1) == Some('=') => self.double(TokenKind::NotEq),
            '<' if self.peek_at(1) == Some('=') => self.double(TokenKind::Le),
            '<' => self.single(TokenKind::Lt),
            '>' if self.peek_at(1) == Some('=') => self.double(TokenKind::Ge),
            '>' => self.single(TokenKind::Gt),
            '"' => self.read_string()?,
            c if c.is_ascii_digit() => self.read_number()?,
            c if c.is_ascii_alphabetic() || c == '_' => self.read_word(),
            other => {
                return Err(ScriptError::Syntax {
                    line,
                    col,
                    message: format!("unexpected character `{other}`"),
                })
            }
        };
        Ok(Token { kind, line, col })
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.advance();
        kind
    }

    fn double(&mut self, kind: TokenKind) -> TokenKind {
        self.advance();
        self.advance();
        kind
    }

    fn read_string(&mut self) -> ScriptResult<TokenKind> {
        let (line, col) = (self.line, self.col);
        self.advance();
        let mut text = String::new();
        loop {
            let Some(ch) = self.peek_at(0) else {
                return Err(ScriptError::Syntax {
                    line,
                    col,
                    message: "unterminated string literal".into(),
                });
            };
            self.advance();
            match ch {
                '"' => break,
                '\\' => {
                    let escaped = match self.peek_at(0) {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('"') => '"',
                        Some('\\') => '\\',
                        other => {
                            return Err(ScriptError::Syntax {
                                line: self.line,
                                col: self.col,
                                message: format!("unknown escape `\\{}`", other.unwrap_or(' ')),
                            })
                        }
                    };
                    self.advance();
                    text.push(escaped);
                }
                other => text.push(other),
            }
        }
        Ok(TokenKind::Str(text))
    }

    fn read_number(&mut self) -> ScriptResult<TokenKind> {
        let (line, col) = (self.line, self.col);
        let mut text = String::new();
        let mut is_float = false;
        while let Some(ch) = self.peek_at(0) {
            if ch.is_ascii_digit() {
                text.push(ch);
            } else if ch == '.'
                && !is_float
                && self.peek_at(1).is_some_and(|next| next.is_ascii_digit())
            {
                is_float = true;
                text.push(ch);
            } else if (ch == 'e' || ch == 'E') && self.exponent_follows() {
                is_float = true;
                text.push(ch);
                self.advance();
                if let Some(sign @ ('+' | '-')) = self.peek_at(0) {
                    text.push(sign);
                    self.advance();
                }
                continue;
            } else {
                break;
            }
            self.advance();
        }
        let malformed = |message: String| ScriptError::Syntax { line, col, message };
        if is_float {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|err| malformed(format!("invalid float `{text}`: {err}")))
        } else {
            text.parse::<i64>()
                .map(TokenKind::Int)
                .map_err(|err| malformed(format!("invalid integer `{text}`: {err}")))
        }
    }

    fn exponent_follows(&self) -> bool {
        match self.peek_at(1) {
            Some(d) if d.is_ascii_digit() => true,
            Some('+' | '-') => self.peek_at(2).is_some_and(|d| d.is_ascii_digit()),
            _ => false,
        }
    }

    fn read_word(&mut self) -> TokenKind {
        let mut text = String::new();
        while let Some(ch) = self.peek_at(0) {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                text.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        match text.as_str() {
            "fn" => TokenKind::Fn,
            "let" => TokenKind::Let,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "for" => TokenKind::For,
            "in" => TokenKind::In,
            "while" => TokenKind::While,
            "return" => TokenKind::Return,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => TokenKind::Not,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "none" => TokenKind::None,
            _ => TokenKind::Ident(text),
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        while let Some(ch) = self.peek_at(0) {
            if ch.is_whitespace() {
                self.advance();
            } else if ch == '#' {
                while let Some(c) = self.peek_at(0) {
                    if c == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else {
                break;
            }
        }
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.input.get(self.pos) {
            if *ch == '\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
            self.pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|token| token.kind)
            .collect()
    }

    #[test]
    fn tokenizes_operators_and_keywords() {
        assert_eq!(
            kinds("fn f(a) -> Table { return a <= 2.5e1; } # trailing"),
            vec![
                TokenKind::Fn,
                TokenKind::Ident("f".into()),
                TokenKind::LParen,
                TokenKind::Ident("a".into()),
                TokenKind::RParen,
                TokenKind::Arrow,
                TokenKind::Ident("Table".into()),
                TokenKind::LBrace,
                TokenKind::Return,
                TokenKind::Ident("a".into()),
                TokenKind::Le,
                TokenKind::Float(25.0),
                TokenKind::Semi,
                TokenKind::RBrace,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn decodes_string_escapes() {
        assert_eq!(
            kinds(r#""a\"b\n""#),
            vec![TokenKind::Str("a\"b\n".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn reports_position_of_bad_characters() {
        let err = Lexer::new("let x = 1;\nlet y = $;").tokenize().unwrap_err();
        assert_eq!(
            err,
            ScriptError::Syntax {
                line: 2,
                col: 9,
                message: "unexpected character `$`".into()
            }
        );
    }
}
