use std::iter::Peekable;
use std::str::CharIndices;

/// Longest expression text accepted between markers
pub const MAX_EXPR_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    In,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

pub fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    if text.len() > MAX_EXPR_LEN {
        return Err(format!("expression longer than {} bytes", MAX_EXPR_LEN));
    }
    let mut lexer = Lexer {
        chars: text.char_indices().peekable(),
        text,
    };
    let mut tokens = Vec::new();
    while let Some(token) = lexer.next_token()? {
        tokens.push(token);
    }
    Ok(tokens)
}

struct Lexer<'a> {
    chars: Peekable<CharIndices<'a>>,
    text: &'a str,
}

impl<'a> Lexer<'a> {
    fn next_token(&mut self) -> Result<Option<Token>, String> {
        while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}

        let Some((start, c)) = self.chars.next() else {
            return Ok(None);
        };

        let token = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            ',' => Token::Comma,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '.' if !self.peek_is_digit() => Token::Dot,
            '=' if self.eat('=') => Token::Eq,
            '!' if self.eat('=') => Token::NotEq,
            '<' if self.eat('=') => Token::LtEq,
            '<' => Token::Lt,
            '>' if self.eat('=') => Token::GtEq,
            '>' => Token::Gt,
            '"' | '\'' => Token::Str(self.string(c)?),
            c if c.is_ascii_digit() || c == '.' => Token::Number(self.number(start)?),
            c if c.is_alphabetic() || c == '_' => self.word(start),
            other => return Err(format!("unexpected character '{}' at {}", other, start)),
        };
        Ok(Some(token))
    }

    fn eat(&mut self, expected: char) -> bool {
        self.chars.next_if(|(_, c)| *c == expected).is_some()
    }

    fn peek_is_digit(&mut self) -> bool {
        self.chars.peek().is_some_and(|(_, c)| c.is_ascii_digit())
    }

    fn string(&mut self, quote: char) -> Result<String, String> {
        let mut out = String::new();
        loop {
            match self.chars.next() {
                Some((_, c)) if c == quote => return Ok(out),
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, c)) => out.push(c),
                    None => break,
                },
                Some((_, c)) => out.push(c),
                None => break,
            }
        }
        Err("unterminated string literal".to_string())
    }

    fn number(&mut self, start: usize) -> Result<f64, String> {
        let mut end = start + 1;
        while let Some((i, c)) = self
            .chars
            .next_if(|(_, c)| c.is_ascii_digit() || *c == '.' || *c == '_')
        {
            end = i + c.len_utf8();
        }
        let raw = self.text[start..end].replace('_', "");
        raw.parse::<f64>()
            .map_err(|_| format!("invalid number literal '{}'", raw))
    }

    fn word(&mut self, start: usize) -> Token {
        let mut end = self.text.len();
        while self
            .chars
            .next_if(|(_, c)| c.is_alphanumeric() || *c == '_')
            .is_some()
        {}
        if let Some((i, _)) = self.chars.peek() {
            end = *i;
        }
        match &self.text[start..end] {
            "true" | "True" => Token::True,
            "false" | "False" => Token::False,
            "null" | "None" => Token::Null,
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            "in" => Token::In,
            word => Token::Ident(word.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operators_and_words() {
        let tokens = tokenize("a.b >= 2 and not 'x' in items").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("a".into()),
                Token::Dot,
                Token::Ident("b".into()),
                Token::GtEq,
                Token::Number(2.0),
                Token::And,
                Token::Not,
                Token::Str("x".into()),
                Token::In,
                Token::Ident("items".into()),
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(tokenize("1_000.5").unwrap(), vec![Token::Number(1000.5)]);
        assert_eq!(tokenize(".25").unwrap(), vec![Token::Number(0.25)]);
        assert!(tokenize("1.2.3").is_err());
    }

    #[test]
    fn test_rejects_unknown_characters() {
        assert!(tokenize("a; b").is_err());
        assert!(tokenize("'open").is_err());
        assert!(tokenize("a = b").is_err());
    }
}
