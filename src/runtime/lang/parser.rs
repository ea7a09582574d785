use chumsky::error::{Error as _, Simple, SimpleReason};
use chumsky::prelude::*;
use chumsky::stream::Stream;

use super::lexer::Token;
use super::{BinOp, ScalarType, Span, SyntaxError};

type PError = Simple<Token>;

// ---------------------------------------------------------------------------
// Syntax tree
// ---------------------------------------------------------------------------

/// Expressions as written, before names are bound.
#[derive(Debug, Clone)]
pub(super) enum SynExpr {
    Float(f32),
    Int(i64),
    Name { name: String, span: Span },
    Index { name: String, span: Span, index: Box<SynExpr> },
    Call { name: String, span: Span, arg: Box<SynExpr> },
    Neg(Box<SynExpr>),
    Cast(ScalarType, Box<SynExpr>),
    Binary(BinOp, Box<SynExpr>, Box<SynExpr>),
}

#[derive(Debug, Clone)]
pub(super) enum SynStmt {
    Decl { ty: ScalarType, name: String, span: Span, value: Option<SynExpr> },
    Assign { name: String, span: Span, index: Option<SynExpr>, value: SynExpr },
    If { cond: SynExpr, then: Box<SynStmt>, otherwise: Option<Box<SynStmt>> },
    Block(Vec<SynStmt>),
    Return,
    Empty,
}

#[derive(Debug, Clone)]
pub(super) struct SynParam {
    pub(super) name: String,
    pub(super) span: Span,
    pub(super) ty: ScalarType,
    pub(super) pointer: bool,
    pub(super) global: bool,
}

#[derive(Debug, Clone)]
pub(super) struct SynKernel {
    pub(super) name: String,
    pub(super) span: Span,
    pub(super) params: Vec<SynParam>,
    pub(super) body: Vec<SynStmt>,
}

// ---------------------------------------------------------------------------
// Grammar
// ---------------------------------------------------------------------------

const RESERVED: &[&str] = &[
    "__kernel", "kernel", "void", "const", "restrict", "__global", "global", "float", "int",
    "uint", "unsigned", "long", "ulong", "size_t", "if", "else", "return",
];

fn kw(word: &'static str) -> impl Parser<Token, Token, Error = PError> + Clone {
    just(Token::Ident(word.to_string()))
}

fn ident() -> impl Parser<Token, String, Error = PError> + Clone {
    filter_map(|span: Span, token: Token| match token {
        Token::Ident(name) if !RESERVED.contains(&name.as_str()) => Ok(name),
        other => Err(PError::expected_input_found(
            span,
            [Some(Token::Ident(String::new()))],
            Some(other),
        )),
    })
}

fn spanned_ident() -> impl Parser<Token, (String, Span), Error = PError> + Clone {
    ident().map_with_span(|name, span| (name, span))
}

fn scalar_type() -> impl Parser<Token, ScalarType, Error = PError> + Clone {
    choice((
        kw("unsigned")
            .ignore_then(choice((kw("long").to(ScalarType::ULong), kw("int").to(ScalarType::UInt))).or_not())
            .map(|ty| ty.unwrap_or(ScalarType::UInt)),
        kw("float").to(ScalarType::Float),
        kw("int").to(ScalarType::Int),
        kw("uint").to(ScalarType::UInt),
        kw("long").to(ScalarType::Long),
        kw("ulong").to(ScalarType::ULong),
        kw("size_t").to(ScalarType::ULong),
    ))
}

fn parens<O>(
    inner: impl Parser<Token, O, Error = PError> + Clone,
) -> impl Parser<Token, O, Error = PError> + Clone {
    inner.delimited_by(just(Token::LParen), just(Token::RParen))
}

#[derive(Clone)]
enum Prefix {
    Neg,
    Plus,
    Cast(ScalarType),
}

/// One left-associative precedence level.
fn binary<L, O>(lower: L, op: O) -> BoxedParser<'static, Token, SynExpr, PError>
where
    L: Parser<Token, SynExpr, Error = PError> + Clone + 'static,
    O: Parser<Token, BinOp, Error = PError> + Clone + 'static,
{
    lower
        .clone()
        .then(op.then(lower).repeated())
        .foldl(|lhs, (op, rhs)| SynExpr::Binary(op, Box::new(lhs), Box::new(rhs)))
        .boxed()
}

fn expr() -> impl Parser<Token, SynExpr, Error = PError> + Clone {
    recursive(|expr| {
        let literal = filter_map(|span: Span, token: Token| match token {
            Token::Int(v) => Ok(SynExpr::Int(v)),
            Token::Float(bits) => Ok(SynExpr::Float(f32::from_bits(bits))),
            other => Err(PError::expected_input_found(span, Vec::new(), Some(other))),
        });
        let call = spanned_ident()
            .then(parens(expr.clone()))
            .map(|((name, span), arg)| SynExpr::Call { name, span, arg: Box::new(arg) });
        let index = spanned_ident()
            .then(expr.clone().delimited_by(just(Token::LBracket), just(Token::RBracket)))
            .map(|((name, span), index)| SynExpr::Index { name, span, index: Box::new(index) });
        let name = spanned_ident().map(|(name, span)| SynExpr::Name { name, span });
        let atom = choice((literal, call, index, name, parens(expr)));

        let prefix = choice((
            just(Token::Minus).to(Prefix::Neg),
            just(Token::Plus).to(Prefix::Plus),
            parens(scalar_type()).map(Prefix::Cast),
        ));
        let unary = prefix
            .repeated()
            .then(atom)
            .foldr(|prefix, operand| match prefix {
                Prefix::Neg => SynExpr::Neg(Box::new(operand)),
                Prefix::Plus => operand,
                Prefix::Cast(ty) => SynExpr::Cast(ty, Box::new(operand)),
            })
            .boxed();

        let product = binary(
            unary,
            choice((just(Token::Star).to(BinOp::Mul), just(Token::Slash).to(BinOp::Div))),
        );
        let sum = binary(
            product,
            choice((just(Token::Plus).to(BinOp::Add), just(Token::Minus).to(BinOp::Sub))),
        );
        let compare = binary(
            sum,
            choice((
                just(Token::Le).to(BinOp::Le),
                just(Token::Ge).to(BinOp::Ge),
                just(Token::Lt).to(BinOp::Lt),
                just(Token::Gt).to(BinOp::Gt),
            )),
        );
        let equality = binary(
            compare,
            choice((just(Token::EqEq).to(BinOp::Eq), just(Token::NotEq).to(BinOp::Ne))),
        );
        let and = binary(equality, just(Token::AndAnd).to(BinOp::And));
        binary(and, just(Token::OrOr).to(BinOp::Or))
    })
}

fn statement() -> impl Parser<Token, SynStmt, Error = PError> + Clone {
    recursive(|stmt| {
        let block = stmt
            .clone()
            .repeated()
            .delimited_by(just(Token::LBrace), just(Token::RBrace))
            .map(SynStmt::Block);
        let branch = kw("if")
            .ignore_then(parens(expr()))
            .then(stmt.clone())
            .then(kw("else").ignore_then(stmt).or_not())
            .map(|((cond, then), otherwise)| SynStmt::If {
                cond,
                then: Box::new(then),
                otherwise: otherwise.map(Box::new),
            });
        let ret = kw("return").then(just(Token::Semi)).to(SynStmt::Return);
        let decl = kw("const")
            .or_not()
            .ignore_then(scalar_type())
            .then(spanned_ident())
            .then(just(Token::Assign).ignore_then(expr()).or_not())
            .then_ignore(just(Token::Semi))
            .map(|((ty, (name, span)), value)| SynStmt::Decl { ty, name, span, value });
        let assign = spanned_ident()
            .then(expr().delimited_by(just(Token::LBracket), just(Token::RBracket)).or_not())
            .then_ignore(just(Token::Assign))
            .then(expr())
            .then_ignore(just(Token::Semi))
            .map(|(((name, span), index), value)| SynStmt::Assign { name, span, index, value });
        let empty = just(Token::Semi).to(SynStmt::Empty);
        choice((block, branch, ret, decl, assign, empty))
    })
}

fn module() -> impl Parser<Token, Vec<SynKernel>, Error = PError> {
    let qualifier = choice((
        kw("__global").to(true),
        kw("global").to(true),
        kw("const").to(false),
        kw("restrict").to(false),
    ));
    let param = qualifier
        .repeated()
        .then(scalar_type())
        .then(just(Token::Star).or_not())
        .then_ignore(choice((kw("const"), kw("restrict"))).repeated())
        .then(spanned_ident())
        .map(|(((qualifiers, ty), star), (name, span))| SynParam {
            name,
            span,
            ty,
            pointer: star.is_some(),
            global: qualifiers.contains(&true),
        });
    let params = parens(
        kw("void")
            .to(Vec::new())
            .or(param.separated_by(just(Token::Comma))),
    );
    let body = statement()
        .repeated()
        .delimited_by(just(Token::LBrace), just(Token::RBrace));
    let kernel = choice((kw("__kernel"), kw("kernel")))
        .ignore_then(kw("void"))
        .ignore_then(spanned_ident())
        .then(params)
        .then(body)
        .map(|(((name, span), params), body)| SynKernel { name, span, params, body });

    kernel.repeated().then_ignore(end())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Parse a token stream produced by [`super::lexer::lex`] into kernel
/// definitions. Only the furthest error is reported.
pub(super) fn parse(source_len: usize, tokens: Vec<(Token, Span)>) -> Result<Vec<SynKernel>, SyntaxError> {
    let eoi = source_len..source_len;
    module()
        .parse(Stream::from_iter(eoi.clone(), tokens.into_iter()))
        .map_err(|errors| match errors.into_iter().next() {
            Some(error) => SyntaxError::new(error.span(), describe(&error)),
            None => SyntaxError::new(eoi, "invalid kernel source"),
        })
}

/// Render a chumsky error the way clang phrases the common cases.
fn describe(error: &PError) -> String {
    match error.reason() {
        SimpleReason::Custom(message) => return message.clone(),
        SimpleReason::Unclosed { delimiter, .. } => return format!("expected matching {delimiter}"),
        SimpleReason::Unexpected => {}
    }
    let expected: Vec<&Token> = error.expected().flatten().collect();
    // A missing terminator is the likeliest reading whenever one would fit.
    for closer in [Token::Semi, Token::RParen, Token::RBracket, Token::RBrace] {
        if expected.contains(&&closer) {
            return format!("expected {closer}");
        }
    }
    let wants_identifier = expected.iter().any(|t| matches!(t, Token::Ident(name) if name.is_empty()));
    if wants_identifier && expected.contains(&&Token::LParen) {
        return "expected expression".to_string();
    }
    if wants_identifier {
        return "expected identifier".to_string();
    }
    let mut names: Vec<String> = expected.iter().map(|t| t.to_string()).collect();
    names.sort();
    names.dedup();
    match (names.as_slice(), error.found()) {
        ([], Some(found)) => format!("unexpected {found}"),
        ([], None) => "unexpected end of input".to_string(),
        ([one], _) => format!("expected {one}"),
        (many, _) => format!("expected one of {}", many.join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use super::super::lexer::lex;
    use super::*;

    fn parse_src(src: &str) -> Result<Vec<SynKernel>, SyntaxError> {
        parse(src.len(), lex(src).unwrap())
    }

    #[test]
    fn test_precedence_and_associativity() {
        let kernels = parse_src("kernel void k(float x) { x = 1 - 2 - 3 * 4; }").unwrap();
        let SynStmt::Assign { value, .. } = &kernels[0].body[0] else {
            panic!("expected an assignment");
        };
        // (1 - 2) - (3 * 4)
        let SynExpr::Binary(BinOp::Sub, lhs, rhs) = value else {
            panic!("expected subtraction at the root, got {value:?}");
        };
        assert!(matches!(**lhs, SynExpr::Binary(BinOp::Sub, _, _)));
        assert!(matches!(**rhs, SynExpr::Binary(BinOp::Mul, _, _)));
    }

    #[test]
    fn test_cast_versus_parenthesised_expression() {
        let kernels = parse_src("kernel void k(float x) { x = (float)(x) + (x); }").unwrap();
        let SynStmt::Assign { value: SynExpr::Binary(BinOp::Add, lhs, rhs), .. } = &kernels[0].body[0]
        else {
            panic!("expected an addition");
        };
        assert!(matches!(**lhs, SynExpr::Cast(ScalarType::Float, _)));
        assert!(matches!(**rhs, SynExpr::Name { .. }));
    }

    #[test]
    fn test_dangling_else_binds_to_inner_if() {
        let kernels = parse_src("kernel void k(int x) { if (x) if (x) ; else return; }").unwrap();
        let SynStmt::If { then, otherwise, .. } = &kernels[0].body[0] else {
            panic!("expected an if");
        };
        assert!(otherwise.is_none());
        assert!(matches!(**then, SynStmt::If { otherwise: Some(_), .. }));
    }

    #[test]
    fn test_param_qualifiers() {
        let kernels =
            parse_src("__kernel void k(__global const float* restrict a, const unsigned long n) {}")
                .unwrap();
        let params = &kernels[0].params;
        assert!(params[0].global && params[0].pointer);
        assert_eq!(params[0].ty, ScalarType::Float);
        assert!(!params[1].global && !params[1].pointer);
        assert_eq!(params[1].ty, ScalarType::ULong);
    }

    #[test]
    fn test_unclosed_parameter_list() {
        let err = parse_src("__kernel void square(__global float* input {").unwrap_err();
        assert_eq!(err.message, "expected ')'");
    }

    #[test]
    fn test_keyword_is_not_an_identifier() {
        let err = parse_src("kernel void k(int if) {}").unwrap_err();
        assert_eq!(err.message, "expected identifier");
    }

    #[test]
    fn test_truncated_source_reports_end_of_input() {
        let src = "kernel void k(void) { return;";
        let err = parse_src(src).unwrap_err();
        assert_eq!(err.span, src.len()..src.len());
    }
}
