//! SQL lexer: turns a statement string into a stream of tokens.

use std::iter::Peekable;
use std::str::Chars;

use super::token::{Keyword, Token};
use crate::error::{Error, Result};

pub struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
        }
    }
}

impl Iterator for Lexer<'_> {
    type Item = Result<Token>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.scan() {
            Ok(Some(token)) => Some(Ok(token)),
            // Nothing scanned: either end of input or a character no rule
            // accepts. The character is consumed so lexing can't stall on it.
            Ok(None) => self
                .chars
                .next()
                .map(|c| Err(Error::Parse(format!("unexpected character {c}")))),
            Err(err) => Some(Err(err)),
        }
    }
}

impl Lexer<'_> {
    fn scan(&mut self) -> Result<Option<Token>> {
        self.skip_whitespace();
        match self.chars.peek() {
            Some('\'') => self.scan_string(),
            Some('"') => self.scan_quoted_identifier(),
            Some(c) if c.is_ascii_digit() => Ok(self.scan_number()),
            Some(c) if c.is_alphabetic() => Ok(self.scan_word()),
            Some(_) => Ok(self.scan_symbol()),
            None => Ok(None),
        }
    }

    fn skip_whitespace(&mut self) {
        self.next_while(|c| c.is_whitespace());
    }

    fn scan_number(&mut self) -> Option<Token> {
        let mut number = self.next_while(|c| c.is_ascii_digit())?;
        if let Some(sep) = self.next_if(|c| c == '.') {
            number.push(sep);
            if let Some(fraction) = self.next_while(|c| c.is_ascii_digit()) {
                number.push_str(&fraction);
            }
        }
        if let Some(exp) = self.next_if(|c| c == 'e' || c == 'E') {
            number.push(exp);
            if let Some(sign) = self.next_if(|c| c == '+' || c == '-') {
                number.push(sign);
            }
            if let Some(digits) = self.next_while(|c| c.is_ascii_digit()) {
                number.push_str(&digits);
            }
        }
        Some(Token::Number(number))
    }

    /// Single-quoted string literal; '' is an escaped quote.
    fn scan_string(&mut self) -> Result<Option<Token>> {
        if self.next_if(|c| c == '\'').is_none() {
            return Ok(None);
        }
        let mut s = String::new();
        loop {
            match self.chars.next() {
                Some('\'') if self.next_is('\'') => s.push('\''),
                Some('\'') => break,
                Some(c) => s.push(c),
                None => return Err(Error::Parse("unexpected end of string literal".into())),
            }
        }
        Ok(Some(Token::String(s)))
    }

    /// Double-quoted identifier; case is preserved and "" is an escaped quote.
    fn scan_quoted_identifier(&mut self) -> Result<Option<Token>> {
        if self.next_if(|c| c == '"').is_none() {
            return Ok(None);
        }
        let mut ident = String::new();
        loop {
            match self.chars.next() {
                Some('"') if self.next_is('"') => ident.push('"'),
                Some('"') => break,
                Some(c) => ident.push(c),
                None => return Err(Error::Parse("unexpected end of quoted identifier".into())),
            }
        }
        Ok(Some(Token::Identifier(ident)))
    }

    fn scan_word(&mut self) -> Option<Token> {
        let mut word = self.next_if(|c| c.is_alphabetic())?.to_lowercase().collect::<String>();
        while let Some(c) = self.next_if(|c| c.is_alphanumeric() || c == '_') {
            word.extend(c.to_lowercase());
        }
        match Keyword::lookup(&word) {
            Some(keyword) => Some(Token::Keyword(keyword)),
            None => Some(Token::Identifier(word)),
        }
    }

    fn scan_symbol(&mut self) -> Option<Token> {
        let token = match self.chars.peek()? {
            '.' => Token::Period,
            '=' => Token::Equal,
            '>' => Token::GreaterThan,
            '<' => Token::LessThan,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Asterisk,
            '/' => Token::Slash,
            '^' => Token::Caret,
            '%' => Token::Percent,
            '!' => Token::Exclamation,
            '?' => Token::Question,
            ',' => Token::Comma,
            ';' => Token::Semicolon,
            '(' => Token::OpenParen,
            ')' => Token::CloseParen,
            _ => return None,
        };
        self.chars.next();
        Some(match token {
            Token::Exclamation if self.next_is('=') => Token::NotEqual,
            Token::LessThan if self.next_is('>') => Token::LessOrGreaterThan,
            Token::LessThan if self.next_is('=') => Token::LessThanOrEqual,
            Token::GreaterThan if self.next_is('=') => Token::GreaterThanOrEqual,
            token => token,
        })
    }

    fn next_if(&mut self, predicate: impl Fn(char) -> bool) -> Option<char> {
        self.chars.next_if(|&c| predicate(c))
    }

    fn next_is(&mut self, expected: char) -> bool {
        self.next_if(|c| c == expected).is_some()
    }

    /// Consumes contiguous matching characters. None if nothing matched.
    fn next_while(&mut self, predicate: impl Fn(char) -> bool) -> Option<String> {
        let mut s = String::new();
        while let Some(c) = self.next_if(&predicate) {
            s.push(c);
        }
        Some(s).filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lex(input: &str) -> Result<Vec<Token>> {
        Lexer::new(input).collect()
    }

    #[test]
    fn select_statement() {
        let tokens = lex("SELECT id, Name FROM users WHERE id >= 10;").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Keyword(Keyword::Select),
                Token::Identifier("id".into()),
                Token::Comma,
                Token::Identifier("name".into()),
                Token::Keyword(Keyword::From),
                Token::Identifier("users".into()),
                Token::Keyword(Keyword::Where),
                Token::Identifier("id".into()),
                Token::GreaterThanOrEqual,
                Token::Number("10".into()),
                Token::Semicolon,
            ]
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(
            lex("3 3.14 1.8e-3 2E10 7.").unwrap(),
            vec![
                Token::Number("3".into()),
                Token::Number("3.14".into()),
                Token::Number("1.8e-3".into()),
                Token::Number("2E10".into()),
                Token::Number("7.".into()),
            ]
        );
    }

    #[test]
    fn strings_and_quoted_identifiers() {
        assert_eq!(
            lex(r#"'It''s' "Mixed ""Case""""#).unwrap(),
            vec![
                Token::String("It's".into()),
                Token::Identifier(r#"Mixed "Case""#.into()),
            ]
        );
    }

    #[test]
    fn two_character_symbols() {
        assert_eq!(
            lex("a != b <> c <= d >= e < f ! g").unwrap(),
            vec![
                Token::Identifier("a".into()),
                Token::NotEqual,
                Token::Identifier("b".into()),
                Token::LessOrGreaterThan,
                Token::Identifier("c".into()),
                Token::LessThanOrEqual,
                Token::Identifier("d".into()),
                Token::GreaterThanOrEqual,
                Token::Identifier("e".into()),
                Token::LessThan,
                Token::Identifier("f".into()),
                Token::Exclamation,
                Token::Identifier("g".into()),
            ]
        );
    }

    #[test]
    fn identifiers_allow_digits_and_underscores() {
        assert_eq!(
            lex("col_1").unwrap(),
            vec![Token::Identifier("col_1".into())]
        );
    }

    #[test]
    fn unterminated_string_is_error() {
        assert!(matches!(lex("'abc"), Err(Error::Parse(_))));
        assert!(matches!(lex("\"abc"), Err(Error::Parse(_))));
    }

    #[test]
    fn unknown_character_is_error() {
        assert!(matches!(lex("a # b"), Err(Error::Parse(_))));

        let mut lexer = Lexer::new("a # b");
        assert_eq!(lexer.next(), Some(Ok(Token::Identifier("a".into()))));
        assert!(matches!(lexer.next(), Some(Err(Error::Parse(_)))));
        assert_eq!(lexer.next(), Some(Ok(Token::Identifier("b".into()))));
        assert_eq!(lexer.next(), None);
    }
}
