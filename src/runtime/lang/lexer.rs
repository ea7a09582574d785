use std::fmt;

use logos::Logos;

use super::{Span, SyntaxError};

/// Deepest combined nesting of blocks, `if`/`else` bodies, parentheses
/// and subscripts the parser accepts.
const MAX_NESTING: usize = 32;

/// Most tokens a single statement may span.
const MAX_STATEMENT_TOKENS: usize = 256;

#[derive(Logos, Debug, Clone, PartialEq, Eq, Hash)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"/\*([^*]|\*+[^*/])*\*+/")]
pub(super) enum Token {
    // Keywords are identifiers here; the parser matches them by text.
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[regex(r"[0-9]+[uUlL]*", int_literal)]
    Int(i64),

    /// IEEE-754 bits, so tokens stay `Eq + Hash`.
    #[regex(r"[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?[fF]?", float_literal)]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?[fF]?", float_literal)]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+[fF]?", float_literal)]
    Float(u32),

    #[regex(r"#[^\n]*", |lex| lex.slice().to_string())]
    Directive(String),

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
    #[token("=")]
    Assign,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
}

fn int_literal(lex: &mut logos::Lexer<Token>) -> Option<i64> {
    lex.slice()
        .trim_end_matches(|c: char| matches!(c, 'u' | 'U' | 'l' | 'L'))
        .parse()
        .ok()
}

fn float_literal(lex: &mut logos::Lexer<Token>) -> Option<u32> {
    lex.slice()
        .trim_end_matches(|c: char| matches!(c, 'f' | 'F'))
        .parse::<f32>()
        .ok()
        .map(f32::to_bits)
}

impl Token {
    fn symbol(&self) -> &'static str {
        match self {
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::Comma => ",",
            Token::Semi => ";",
            Token::Assign => "=",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Lt => "<",
            Token::Le => "<=",
            Token::Gt => ">",
            Token::Ge => ">=",
            Token::EqEq => "==",
            Token::NotEq => "!=",
            Token::AndAnd => "&&",
            Token::OrOr => "||",
            Token::Ident(_) | Token::Int(_) | Token::Float(_) | Token::Directive(_) => "",
        }
    }

    fn is_word(&self, word: &str) -> bool {
        matches!(self, Token::Ident(w) if w == word)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // An empty identifier stands for "any identifier" in parse errors.
            Token::Ident(name) if name.is_empty() => f.write_str("identifier"),
            Token::Ident(name) => write!(f, "'{name}'"),
            Token::Int(v) => write!(f, "'{v}'"),
            Token::Float(bits) => write!(f, "'{}'", f32::from_bits(*bits)),
            Token::Directive(text) => write!(f, "'{text}'"),
            punct => write!(f, "'{}'", punct.symbol()),
        }
    }
}

/// Tokenize `source`. Preprocessor lines are rejected here; `#error` reports
/// its own text.
pub(super) fn lex(source: &str) -> Result<Vec<(Token, Span)>, SyntaxError> {
    let mut tokens = Vec::new();
    for (token, span) in Token::lexer(source).spanned() {
        match token {
            Ok(Token::Directive(text)) => {
                let message = match text.strip_prefix("#error") {
                    Some(reason) => reason.trim().to_string(),
                    None => "preprocessor directives are not supported".to_string(),
                };
                return Err(SyntaxError::new(span, message));
            }
            Ok(token) => tokens.push((token, span)),
            Err(()) => {
                let text = source.get(span.clone()).unwrap_or_default();
                let message = match text.chars().next() {
                    Some(c) if c.is_ascii_digit() || c == '.' => {
                        format!("invalid numeric literal '{text}'")
                    }
                    Some(c) => format!("unexpected character '{c}'"),
                    None => "unexpected end of input".to_string(),
                };
                return Err(SyntaxError::new(span, message));
            }
        }
    }
    Ok(tokens)
}

enum Frame {
    Block,
    /// The body of an `if` or `else` that has not completed yet.
    Branch,
}

/// Reject token streams whose nesting or statement length would make the
/// recursive passes run away, before any of them start.
pub(super) fn check_nesting(tokens: &[(Token, Span)]) -> Result<(), SyntaxError> {
    let mut frames: Vec<Frame> = Vec::new();
    let mut groups = 0usize;
    let mut run = 0usize;

    for (i, (token, span)) in tokens.iter().enumerate() {
        let next = tokens.get(i + 1).map(|(t, _)| t);
        run += 1;
        if run > MAX_STATEMENT_TOKENS {
            return Err(SyntaxError::new(span.clone(), "statement is too complex"));
        }
        let nested = match token {
            Token::LParen | Token::LBracket => {
                groups += 1;
                Some("expression")
            }
            Token::RParen | Token::RBracket => {
                groups = groups.saturating_sub(1);
                None
            }
            Token::LBrace => {
                run = 0;
                frames.push(Frame::Block);
                Some("statement")
            }
            Token::RBrace => {
                run = 0;
                while let Some(frame) = frames.pop() {
                    if let Frame::Block = frame {
                        break;
                    }
                }
                complete(&mut frames, next);
                None
            }
            Token::Semi => {
                run = 0;
                complete(&mut frames, next);
                None
            }
            t if t.is_word("if") || t.is_word("else") => {
                frames.push(Frame::Branch);
                Some("statement")
            }
            _ => None,
        };
        if let Some(what) = nested {
            if frames.len() + groups > MAX_NESTING {
                return Err(SyntaxError::new(span.clone(), format!("{what} nested too deeply")));
            }
        }
    }
    Ok(())
}

/// A statement just ended: close the branches it completes, stopping after
/// one that an `else` continues.
fn complete(frames: &mut Vec<Frame>, next: Option<&Token>) {
    while let Some(Frame::Branch) = frames.last() {
        frames.pop();
        if next.is_some_and(|t| t.is_word("else")) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        lex(src).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_literals_and_operators() {
        assert_eq!(
            kinds("x <= 2.5f && 10UL != .5e1"),
            vec![
                Token::Ident("x".into()),
                Token::Le,
                Token::Float(2.5f32.to_bits()),
                Token::AndAnd,
                Token::Int(10),
                Token::NotEq,
                Token::Float(5.0f32.to_bits()),
            ]
        );
    }

    #[test]
    fn test_spans_are_byte_offsets() {
        let tokens = lex("a /* c */ = 1;").unwrap();
        assert_eq!(tokens[1], (Token::Assign, 10..11));
    }

    #[test]
    fn test_unknown_character() {
        let err = lex("a = !b;").unwrap_err();
        assert_eq!(err.span.start, 4);
        assert_eq!(err.message, "unexpected character '!'");
    }

    #[test]
    fn test_overlong_integer() {
        let err = lex("a = 99999999999999999999;").unwrap_err();
        assert_eq!(err.message, "invalid numeric literal '99999999999999999999'");
    }

    #[test]
    fn test_else_if_chain_depth() {
        let chain = |links: usize| {
            let body = (0..links)
                .map(|i| format!("if (x == {i}) y = 1;"))
                .collect::<Vec<_>>()
                .join(" else ");
            lex(&format!("{{ {body} }}")).unwrap()
        };
        assert!(check_nesting(&chain(8)).is_ok());
        let err = check_nesting(&chain(40)).unwrap_err();
        assert!(err.message.ends_with("nested too deeply"), "{}", err.message);
    }

    #[test]
    fn test_sequential_ifs_do_not_accumulate() {
        let body = "if (x) y = 1; ".repeat(200);
        assert!(check_nesting(&lex(&format!("{{ {body} }}")).unwrap()).is_ok());
    }

    #[test]
    fn test_long_statement_is_rejected() {
        let src = format!("a = {}1;", "1 + ".repeat(MAX_STATEMENT_TOKENS));
        let err = check_nesting(&lex(&src).unwrap()).unwrap_err();
        assert_eq!(err.message, "statement is too complex");
    }
}
