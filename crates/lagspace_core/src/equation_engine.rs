use crate::errors::{CompileError, SyntaxError};
use crate::traits::Scalar;
use indexmap::IndexSet;
use std::fmt;

/// OpCodes for the Stack-based Virtual Machine.
/// The VM operates on a stack of `Scalar` values (f64 or Dual).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant `f64` value onto the stack.
    LoadConst(f64),
    /// Pushes an input slot onto the stack.
    /// Slots are the equation's time-series references followed by its
    /// steady-state references.
    LoadVar(usize),
    /// Pushes the value of a parameter (by index) onto the stack.
    LoadParam(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top value (a), pushes a^n for a compile-time integer n.
    Powi(i32),
    /// Pops top two values (b, a), pushes min(a, b).
    Min,
    /// Pops top two values (b, a), pushes max(a, b).
    Max,
    Sin,
    Cos,
    Tan,
    Exp,
    Log,
    Sqrt,
    Abs,
    /// Pops top value (a), pushes -a.
    Neg,
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
    /// Deepest stack the ops reach; used to pre-size VM stacks.
    pub max_stack: usize,
}

impl Bytecode {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Stack-based Virtual Machine for evaluating equations.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: Instructions to run.
/// - `inputs`: Input slot values (read-only).
/// - `params`: Parameter vector (read-only).
/// - `stack`: A mutable buffer for intermediate computations.
///
/// Returns the result of the evaluation (the value left on the stack).
/// Malformed bytecode yields NaN rather than panicking.
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(
        bytecode: &Bytecode,
        inputs: &[T],
        params: &[T],
        stack: &mut Vec<T>,
    ) -> T {
        stack.clear();

        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => stack.push(T::from_f64(val).unwrap_or_else(T::nan)),
                OpCode::LoadVar(idx) => stack.push(inputs.get(idx).copied().unwrap_or_else(T::nan)),
                OpCode::LoadParam(idx) => {
                    stack.push(params.get(idx).copied().unwrap_or_else(T::nan))
                }
                OpCode::Add => binary(stack, |a, b| a + b),
                OpCode::Sub => binary(stack, |a, b| a - b),
                OpCode::Mul => binary(stack, |a, b| a * b),
                OpCode::Div => binary(stack, |a, b| a / b),
                OpCode::Pow => binary(stack, |a, b| a.powf(b)),
                OpCode::Min => binary(stack, |a, b| a.min(b)),
                OpCode::Max => binary(stack, |a, b| a.max(b)),
                OpCode::Powi(n) => unary(stack, |a| a.powi(n)),
                OpCode::Sin => unary(stack, T::sin),
                OpCode::Cos => unary(stack, T::cos),
                OpCode::Tan => unary(stack, T::tan),
                OpCode::Exp => unary(stack, T::exp),
                OpCode::Log => unary(stack, T::ln),
                OpCode::Sqrt => unary(stack, T::sqrt),
                OpCode::Abs => unary(stack, T::abs),
                OpCode::Neg => unary(stack, |a| -a),
            }
        }

        stack.pop().unwrap_or_else(T::nan)
    }
}

fn unary<T: Scalar>(stack: &mut Vec<T>, f: impl Fn(T) -> T) {
    let a = stack.pop().unwrap_or_else(T::nan);
    stack.push(f(a));
}

fn binary<T: Scalar>(stack: &mut Vec<T>, f: impl Fn(T, T) -> T) {
    let b = stack.pop().unwrap_or_else(T::nan);
    let a = stack.pop().unwrap_or_else(T::nan);
    stack.push(f(a, b));
}

// --- AST ---

/// Expression tree for equations.
///
/// `Indexed` only exists between parsing and normalization; after
/// normalization every time reference is a `Series` with an integer
/// offset from `t`.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    /// Parameter name, or the time symbol `t` inside an index.
    Symbol(String),
    /// `x[i]`, `x[i][j]`: raw indexed reference.
    Indexed(String, Vec<Expr>),
    /// `x[t+k]`.
    Series(String, i32),
    /// `@sstate(x)`.
    SteadyState(String),
    Unary(char, Box<Expr>), // '-'
    Binary(Box<Expr>, char, Box<Expr>), // char is operator +, -, *, /, ^
    Call(String, Vec<Expr>),
}

impl Expr {
    pub fn binary(lhs: Expr, op: char, rhs: Expr) -> Expr {
        Expr::Binary(Box::new(lhs), op, Box::new(rhs))
    }

    /// Evaluates the expression if it is built only from numbers.
    pub fn constant_value(&self) -> Option<f64> {
        match self {
            Expr::Number(n) => Some(*n),
            Expr::Unary('-', e) => e.constant_value().map(|v| -v),
            Expr::Binary(l, op, r) => {
                let (a, b) = (l.constant_value()?, r.constant_value()?);
                match op {
                    '+' => Some(a + b),
                    '-' => Some(a - b),
                    '*' => Some(a * b),
                    '/' => Some(a / b),
                    '^' => Some(a.powf(b)),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Calls `f` on every node, parents before children.
    pub fn visit(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Indexed(_, args) | Expr::Call(_, args) => {
                for a in args {
                    a.visit(&mut *f);
                }
            }
            Expr::Unary(_, e) => e.visit(&mut *f),
            Expr::Binary(l, _, r) => {
                l.visit(&mut *f);
                r.visit(&mut *f);
            }
            Expr::Number(_) | Expr::Symbol(_) | Expr::Series(..) | Expr::SteadyState(_) => {}
        }
    }
}

/// Canonical, fully parenthesized rendering; structurally equal trees
/// render identically.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{n:?}"),
            Expr::Symbol(s) => write!(f, "{s}"),
            Expr::Indexed(name, idx) => {
                write!(f, "{name}")?;
                for i in idx {
                    write!(f, "[{i}]")?;
                }
                Ok(())
            }
            Expr::Series(name, 0) => write!(f, "{name}[t]"),
            Expr::Series(name, k) => write!(f, "{name}[t{k:+}]"),
            Expr::SteadyState(name) => write!(f, "@sstate({name})"),
            Expr::Unary(op, e) => write!(f, "({op}{e})"),
            Expr::Binary(l, op, r) => write!(f, "({l} {op} {r})"),
            Expr::Call(name, args) => {
                write!(f, "{name}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Compiles an AST (`Expr`) into `Bytecode`.
/// Resolves normalized references and parameter names to slot indices.
pub struct Compiler<'a> {
    pub series: &'a IndexSet<(String, i32)>,
    pub steady: &'a IndexSet<String>,
    pub params: &'a IndexSet<String>,
}

impl<'a> Compiler<'a> {
    pub fn new(
        series: &'a IndexSet<(String, i32)>,
        steady: &'a IndexSet<String>,
        params: &'a IndexSet<String>,
    ) -> Self {
        Self {
            series,
            steady,
            params,
        }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode, CompileError> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        let max_stack = stack_depth(&ops);
        Ok(Bytecode { ops, max_stack })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<(), CompileError> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Series(name, offset) => {
                let idx = self
                    .series
                    .get_index_of(&(name.clone(), *offset))
                    .ok_or_else(|| CompileError::UnknownIdentifier(expr.to_string()))?;
                ops.push(OpCode::LoadVar(idx));
            }
            Expr::SteadyState(name) => {
                let idx = self
                    .steady
                    .get_index_of(name)
                    .ok_or_else(|| CompileError::UnknownSteadyState(name.clone()))?;
                ops.push(OpCode::LoadVar(self.series.len() + idx));
            }
            Expr::Symbol(name) => {
                let idx = self
                    .params
                    .get_index_of(name)
                    .ok_or_else(|| CompileError::UnknownIdentifier(name.clone()))?;
                ops.push(OpCode::LoadParam(idx));
            }
            Expr::Indexed(name, idx) if idx.len() > 1 => {
                return Err(CompileError::MultipleTimeIndices(name.clone()));
            }
            Expr::Indexed(..) => {
                return Err(CompileError::UnnormalizedReference(expr.to_string()));
            }
            Expr::Binary(left, '^', right) => {
                self.compile_recursive(left, ops)?;
                match right.constant_value() {
                    Some(p) if p.fract() == 0.0 && p.abs() <= i32::MAX as f64 => {
                        ops.push(OpCode::Powi(p as i32));
                    }
                    _ => {
                        self.compile_recursive(right, ops)?;
                        ops.push(OpCode::Pow);
                    }
                }
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    _ => {
                        return Err(CompileError::UnknownFunction {
                            name: op.to_string(),
                            arity: 2,
                        })
                    }
                });
            }
            Expr::Unary(op, operand) => {
                self.compile_recursive(operand, ops)?;
                match op {
                    '-' => ops.push(OpCode::Neg),
                    _ => {
                        return Err(CompileError::UnknownFunction {
                            name: op.to_string(),
                            arity: 1,
                        })
                    }
                }
            }
            Expr::Call(func, args) => {
                let op = match (func.as_str(), args.len()) {
                    ("sin", 1) => OpCode::Sin,
                    ("cos", 1) => OpCode::Cos,
                    ("tan", 1) => OpCode::Tan,
                    ("exp", 1) => OpCode::Exp,
                    ("log", 1) => OpCode::Log,
                    ("sqrt", 1) => OpCode::Sqrt,
                    ("abs", 1) => OpCode::Abs,
                    ("min", 2) => OpCode::Min,
                    ("max", 2) => OpCode::Max,
                    _ => {
                        return Err(CompileError::UnknownFunction {
                            name: func.clone(),
                            arity: args.len(),
                        })
                    }
                };
                for arg in args {
                    self.compile_recursive(arg, ops)?;
                }
                ops.push(op);
            }
        }
        Ok(())
    }
}

fn stack_depth(ops: &[OpCode]) -> usize {
    let mut depth = 0usize;
    let mut max = 0usize;
    for op in ops {
        match op {
            OpCode::LoadConst(_) | OpCode::LoadVar(_) | OpCode::LoadParam(_) => depth += 1,
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Pow
            | OpCode::Min
            | OpCode::Max => depth = depth.saturating_sub(1),
            _ => {}
        }
        max = max.max(depth);
    }
    max
}

// --- Parser ---

/// An equation as written: residual expression plus its declaration flags.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEquation {
    pub expr: Expr,
    /// Declared with a leading `@lin`.
    pub linearize: bool,
}

/// Parses `lhs = rhs` (or a bare expression) into a residual `lhs - rhs`.
pub fn parse_equation(input: &str) -> Result<ParsedEquation, SyntaxError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };

    let mut linearize = false;
    if parser.peek() == Some(Token::At)
        && parser.tokens.get(1) == Some(&Token::Identifier("lin".to_string()))
    {
        parser.pos = 2;
        linearize = true;
    }

    let lhs = parser.parse_expression()?;
    let expr = match parser.peek() {
        Some(Token::Equals) => {
            parser.consume();
            let rhs = parser.parse_expression()?;
            Expr::binary(lhs, '-', rhs)
        }
        _ => lhs,
    };
    parser.expect_end()?;
    Ok(ParsedEquation { expr, linearize })
}

/// Parses a single expression.
pub fn parse(input: &str) -> Result<Expr, SyntaxError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    parser.expect_end()?;
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Equals,
    At,
}

fn tokenize(input: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num_str.push(d);
                    chars.next();
                } else if d == 'e' || d == 'E' {
                    // exponent: 1e-3, 2.5E+4
                    num_str.push(d);
                    chars.next();
                    if let Some(&s) = chars.peek() {
                        if s == '+' || s == '-' {
                            num_str.push(s);
                            chars.next();
                        }
                    }
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| SyntaxError::InvalidNumber(num_str.clone()))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            tokens.push(match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                '[' => Token::LBracket,
                ']' => Token::RBracket,
                ',' => Token::Comma,
                '=' => Token::Equals,
                '@' => Token::At,
                other => return Err(SyntaxError::UnexpectedChar(other)),
            });
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).cloned()
    }

    fn consume(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: Token) -> Result<(), SyntaxError> {
        match self.consume() {
            Some(t) if t == expected => Ok(()),
            Some(t) => Err(SyntaxError::UnexpectedToken(format!("{t:?}"))),
            None => Err(SyntaxError::UnexpectedEnd),
        }
    }

    fn expect_end(&self) -> Result<(), SyntaxError> {
        match self.peek() {
            None => Ok(()),
            Some(t) => Err(SyntaxError::UnexpectedToken(format!("{t:?}"))),
        }
    }

    fn parse_expression(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_term()
    }

    fn parse_term(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_factor()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Plus => '+',
                Token::Minus => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_factor()?;
            left = Expr::binary(left, op, right);
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_unary()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Star => '*',
                Token::Slash => '/',
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::binary(left, op, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, SyntaxError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.consume();
                let expr = self.parse_unary()?;
                Ok(Expr::Unary('-', Box::new(expr)))
            }
            Some(Token::Plus) => {
                self.consume();
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    // right-associative: a^b^c == a^(b^c)
    fn parse_power(&mut self) -> Result<Expr, SyntaxError> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::binary(base, '^', exponent));
        }
        Ok(base)
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, SyntaxError> {
        let mut args = Vec::new();
        if let Some(Token::RParen) = self.peek() {
            self.consume();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expression()?);
            match self.consume() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                Some(t) => return Err(SyntaxError::UnexpectedToken(format!("{t:?}"))),
                None => return Err(SyntaxError::UnexpectedEnd),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, SyntaxError> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => match self.peek() {
                Some(Token::LParen) => {
                    self.consume();
                    let args = self.parse_args()?;
                    Ok(Expr::Call(name, args))
                }
                Some(Token::LBracket) => {
                    let mut indices = Vec::new();
                    while let Some(Token::LBracket) = self.peek() {
                        self.consume();
                        indices.push(self.parse_expression()?);
                        while let Some(Token::Comma) = self.peek() {
                            self.consume();
                            indices.push(self.parse_expression()?);
                        }
                        self.expect(Token::RBracket)?;
                    }
                    Ok(Expr::Indexed(name, indices))
                }
                _ => Ok(Expr::Symbol(name)),
            },
            Some(Token::At) => self.parse_macro(),
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(t) => Err(SyntaxError::UnexpectedToken(format!("{t:?}"))),
            None => Err(SyntaxError::UnexpectedEnd),
        }
    }

    fn parse_macro(&mut self) -> Result<Expr, SyntaxError> {
        let name = match self.consume() {
            Some(Token::Identifier(name)) => name,
            Some(t) => return Err(SyntaxError::UnexpectedToken(format!("{t:?}"))),
            None => return Err(SyntaxError::UnexpectedEnd),
        };
        if name != "sstate" {
            return Err(SyntaxError::UnknownMacro(name));
        }
        self.expect(Token::LParen)?;
        let args = self.parse_args()?;
        match args.as_slice() {
            [Expr::Symbol(var)] => Ok(Expr::SteadyState(var.clone())),
            [Expr::Indexed(var, _)] => Err(SyntaxError::BadMacroArgument {
                name: "@sstate".to_string(),
                reason: format!("`{var}` must not carry a time index"),
            }),
            _ => Err(SyntaxError::BadMacroArgument {
                name: "@sstate".to_string(),
                reason: "expected a single variable name".to_string(),
            }),
        }
    }
}
