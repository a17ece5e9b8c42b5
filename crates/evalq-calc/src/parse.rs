use crate::api::CalcError;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Value),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Power,
    LParen,
    RParen,
    Comma,
    Assign,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(v) => format!("number {}", v.display(6)),
            Token::Ident(name) => format!("name {name:?}"),
            Token::Plus => "'+'".to_string(),
            Token::Minus => "'-'".to_string(),
            Token::Star => "'*'".to_string(),
            Token::Slash => "'/'".to_string(),
            Token::Percent => "'%'".to_string(),
            Token::Power => "'**'".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::Comma => "','".to_string(),
            Token::Assign => "'='".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Num(Value),
    Var(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Stmt {
    Assign(String, Expr),
    Expr(Expr),
}

fn single_char_token(c: char) -> Option<Token> {
    let tok = match c {
        '+' => Token::Plus,
        '-' => Token::Minus,
        '/' => Token::Slash,
        '%' => Token::Percent,
        '^' => Token::Power,
        '(' => Token::LParen,
        ')' => Token::RParen,
        ',' => Token::Comma,
        '=' => Token::Assign,
        _ => return None,
    };
    Some(tok)
}

fn tokenize(input: &str) -> Result<Vec<Token>, CalcError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if let Some(tok) = single_char_token(c) {
            tokens.push(tok);
            i += 1;
            continue;
        }
        match c {
            ' ' | '\t' | '\r' => i += 1,
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    tokens.push(Token::Power);
                    i += 2;
                } else {
                    tokens.push(Token::Star);
                    i += 1;
                }
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(parse_number(&raw)?));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            c => return Err(CalcError::UnexpectedChar(c)),
        }
    }

    Ok(tokens)
}

fn parse_number(raw: &str) -> Result<Value, CalcError> {
    if !raw.contains('.') {
        // Integer literals too large for i64 degrade to floats.
        if let Ok(v) = raw.parse::<i64>() {
            return Ok(Value::Int(v));
        }
    }
    raw.parse::<f64>()
        .map(Value::Float)
        .map_err(|_| CalcError::InvalidNumber(raw.to_string()))
}

/// Deepest expression tree the parser builds. Evaluation recurses once per
/// level, so this bounds its stack use too.
pub(crate) const MAX_DEPTH: usize = 256;

/// Parse one statement (no `;` or newline inside).
pub(crate) fn parse_statement(input: &str) -> Result<Stmt, CalcError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        nesting: 0,
    };

    let stmt = match (tokens.first(), tokens.get(1)) {
        (Some(Token::Ident(name)), Some(Token::Assign)) => {
            parser.pos = 2;
            Stmt::Assign(name.clone(), parser.expr()?.expr)
        }
        _ => Stmt::Expr(parser.expr()?.expr),
    };

    if let Some(tok) = parser.peek() {
        return Err(CalcError::UnexpectedToken(tok.describe()));
    }
    Ok(stmt)
}

/// An expression and the height of its tree.
struct Node {
    expr: Expr,
    depth: usize,
}

impl Node {
    fn leaf(expr: Expr) -> Self {
        Self { expr, depth: 1 }
    }

    fn over(expr: Expr, child_depth: usize) -> Result<Self, CalcError> {
        let depth = child_depth + 1;
        if depth > MAX_DEPTH {
            return Err(CalcError::TooDeep(MAX_DEPTH));
        }
        Ok(Self { expr, depth })
    }

    fn binary(op: BinOp, lhs: Node, rhs: Node) -> Result<Self, CalcError> {
        let depth = lhs.depth.max(rhs.depth);
        Self::over(
            Expr::Binary(op, Box::new(lhs.expr), Box::new(rhs.expr)),
            depth,
        )
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    // Active `unary` frames; every recursive path passes through it.
    nesting: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, want: Token) -> Result<(), CalcError> {
        match self.next() {
            Some(tok) if *tok == want => Ok(()),
            Some(tok) => Err(CalcError::UnexpectedToken(tok.describe())),
            None => Err(CalcError::UnexpectedEnd),
        }
    }

    fn expr(&mut self) -> Result<Node, CalcError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Node::binary(op, lhs, rhs)?;
        }
    }

    fn term(&mut self) -> Result<Node, CalcError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Node::binary(op, lhs, rhs)?;
        }
    }

    fn unary(&mut self) -> Result<Node, CalcError> {
        if self.nesting >= MAX_DEPTH {
            return Err(CalcError::TooDeep(MAX_DEPTH));
        }
        self.nesting += 1;
        let node = self.unary_inner();
        self.nesting -= 1;
        node
    }

    fn unary_inner(&mut self) -> Result<Node, CalcError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                let inner = self.unary()?;
                Node::over(Expr::Neg(Box::new(inner.expr)), inner.depth)
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    // Right-associative; the exponent may carry its own sign.
    fn power(&mut self) -> Result<Node, CalcError> {
        let base = self.primary()?;
        if self.peek() == Some(&Token::Power) {
            self.pos += 1;
            let exp = self.unary()?;
            return Node::binary(BinOp::Pow, base, exp);
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Node, CalcError> {
        match self.next().cloned() {
            Some(Token::Number(v)) => Ok(Node::leaf(Expr::Num(v))),
            Some(Token::Ident(name)) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok(Node::leaf(Expr::Var(name)));
                }
                self.pos += 1;
                let mut args = Vec::new();
                let mut depth = 0;
                if self.peek() == Some(&Token::RParen) {
                    self.pos += 1;
                    return Ok(Node::leaf(Expr::Call(name, args)));
                }
                loop {
                    let arg = self.expr()?;
                    depth = depth.max(arg.depth);
                    args.push(arg.expr);
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RParen) => break,
                        Some(tok) => return Err(CalcError::UnexpectedToken(tok.describe())),
                        None => return Err(CalcError::UnexpectedEnd),
                    }
                }
                Node::over(Expr::Call(name, args), depth)
            }
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(tok) => Err(CalcError::UnexpectedToken(tok.describe())),
            None => Err(CalcError::UnexpectedEnd),
        }
    }
}
