use super::{funcs::Func, Error};

const LEFT: &str = "{{";
const RIGHT: &str = "}}";
const RIGHT_TRIM: &str = "-}}";

#[derive(Clone, Debug, PartialEq)]
pub(super) enum Node {
    Text(String),
    Action(Pipeline),
    If {
        cond: Pipeline,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

/// One or more commands joined by `|`. The result of each command is passed
/// as the final argument of the next.
#[derive(Clone, Debug, PartialEq)]
pub(super) struct Pipeline(pub(super) Vec<Command>);

#[derive(Clone, Debug, PartialEq)]
pub(super) enum Command {
    Call(Func, Vec<Operand>),
    Operand(Operand),
}

#[derive(Clone, Debug, PartialEq)]
pub(super) enum Operand {
    /// A chain of field names starting at the root context. An empty chain is `.`.
    Field(Vec<String>),
    Str(String),
    Bool(bool),
    Nil,
    Pipeline(Box<Pipeline>),
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Field(Vec<String>),
    Ident(String),
    Str(String),
    Pipe,
    LParen,
    RParen,
}

#[derive(Debug)]
enum Segment {
    Text(String),
    Action(Vec<Token>),
}

enum Terminator {
    Else(Vec<Token>),
    End,
}

pub(super) fn parse(text: &str) -> Result<Vec<Node>, Error> {
    let mut parser = Parser {
        segments: lex(text)?.into_iter(),
    };
    match parser.parse_list()? {
        (nodes, None) => Ok(nodes),
        (_, Some(Terminator::End)) => Err(Error::parse("unexpected {{end}}")),
        (_, Some(Terminator::Else(_))) => Err(Error::parse("unexpected {{else}}")),
    }
}

// === Lexing ===

fn lex(text: &str) -> Result<Vec<Segment>, Error> {
    let mut segments = Vec::new();
    let mut pos = 0;
    let mut trim_leading = false;
    while pos < text.len() {
        let rest = &text[pos..];
        let open = match rest.find(LEFT) {
            Some(open) => open,
            None => {
                push_text(&mut segments, rest, trim_leading, false);
                break;
            }
        };

        let mut inner = pos + open + LEFT.len();
        let trim_trailing = has_left_trim_marker(&text[inner..]);
        if trim_trailing {
            inner += 2;
        }
        push_text(&mut segments, &rest[..open], trim_leading, trim_trailing);

        let mut lexer = Lexer { text, pos: inner };
        let (tokens, trim) = lexer.action()?;
        if let Some(tokens) = tokens {
            segments.push(Segment::Action(tokens));
        }
        pos = lexer.pos;
        trim_leading = trim;
    }
    Ok(segments)
}

fn push_text(segments: &mut Vec<Segment>, text: &str, trim_leading: bool, trim_trailing: bool) {
    let mut text = text;
    if trim_leading {
        text = text.trim_start();
    }
    if trim_trailing {
        text = text.trim_end();
    }
    if !text.is_empty() {
        segments.push(Segment::Text(text.to_string()));
    }
}

fn has_left_trim_marker(s: &str) -> bool {
    let b = s.as_bytes();
    b.first() == Some(&b'-') && b.get(1).is_some_and(u8::is_ascii_whitespace)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

struct Lexer<'t> {
    text: &'t str,
    pos: usize,
}

impl<'t> Lexer<'t> {
    fn rest(&self) -> &'t str {
        &self.text[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_space(&mut self) -> bool {
        let rest = self.rest();
        let trimmed = rest.trim_start();
        self.pos += rest.len() - trimmed.len();
        rest.len() != trimmed.len()
    }

    /// Consumes the closing delimiter if it is next, returning whether it
    /// carried a trim marker.
    fn close(&mut self, after_space: bool) -> Option<bool> {
        if after_space && self.rest().starts_with(RIGHT_TRIM) {
            self.pos += RIGHT_TRIM.len();
            return Some(true);
        }
        if self.rest().starts_with(RIGHT) {
            self.pos += RIGHT.len();
            return Some(false);
        }
        None
    }

    /// Lexes the body of an action, up to and including its closing
    /// delimiter. Comments yield no tokens.
    fn action(&mut self) -> Result<(Option<Vec<Token>>, bool), Error> {
        let spaced = self.skip_space();
        if self.rest().starts_with("/*") {
            let end = self
                .rest()
                .find("*/")
                .ok_or_else(|| Error::parse("unclosed comment"))?;
            self.pos += end + 2;
            let spaced = self.skip_space();
            let trim = self
                .close(spaced)
                .ok_or_else(|| Error::parse("comment ends before closing delimiter"))?;
            return Ok((None, trim));
        }

        let mut tokens = Vec::new();
        let mut spaced = spaced;
        loop {
            if let Some(trim) = self.close(spaced) {
                return Ok((Some(tokens), trim));
            }
            let c = self
                .peek()
                .ok_or_else(|| Error::parse("unclosed action"))?;
            let token = match c {
                '.' => self.field()?,
                '"' => self.quoted()?,
                '`' => self.raw()?,
                '|' => {
                    self.bump();
                    Token::Pipe
                }
                '(' => {
                    self.bump();
                    Token::LParen
                }
                ')' => {
                    self.bump();
                    Token::RParen
                }
                c if c.is_alphabetic() || c == '_' => Token::Ident(self.ident()),
                c => return Err(Error::parse(format!("unexpected {c:?} in action"))),
            };
            tokens.push(token);
            spaced = self.skip_space();
        }
    }

    fn ident(&mut self) -> String {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.bump();
        }
        self.text[start..self.pos].to_string()
    }

    fn field(&mut self) -> Result<Token, Error> {
        let mut chain = Vec::new();
        while self.peek() == Some('.') {
            self.bump();
            let name = self.ident();
            if name.is_empty() {
                if chain.is_empty() {
                    // A bare `.` refers to the root context.
                    return Ok(Token::Field(chain));
                }
                return Err(Error::parse("bad field chain: trailing '.'"));
            }
            chain.push(name);
        }
        Ok(Token::Field(chain))
    }

    fn quoted(&mut self) -> Result<Token, Error> {
        self.bump();
        let mut s = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(Error::parse("unterminated quoted string")),
                Some('"') => return Ok(Token::Str(s)),
                Some('\\') => match self.bump() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some('r') => s.push('\r'),
                    Some(c @ ('\\' | '"')) => s.push(c),
                    Some(c) => {
                        return Err(Error::parse(format!("unknown escape sequence: \\{c}")))
                    }
                    None => return Err(Error::parse("unterminated quoted string")),
                },
                Some(c) => s.push(c),
            }
        }
    }

    fn raw(&mut self) -> Result<Token, Error> {
        self.bump();
        let end = self
            .rest()
            .find('`')
            .ok_or_else(|| Error::parse("unterminated raw quoted string"))?;
        let s = self.rest()[..end].to_string();
        self.pos += end + 1;
        Ok(Token::Str(s))
    }
}

// === Parsing ===

struct Parser {
    segments: std::vec::IntoIter<Segment>,
}

impl Parser {
    fn parse_list(&mut self) -> Result<(Vec<Node>, Option<Terminator>), Error> {
        let mut nodes = Vec::new();
        while let Some(segment) = self.segments.next() {
            let tokens = match segment {
                Segment::Text(text) => {
                    nodes.push(Node::Text(text));
                    continue;
                }
                Segment::Action(tokens) => tokens,
            };

            match tokens.first() {
                Some(Token::Ident(kw)) if kw == "if" => {
                    nodes.push(self.parse_if(&tokens[1..])?);
                }
                Some(Token::Ident(kw)) if kw == "else" => {
                    return Ok((nodes, Some(Terminator::Else(tokens[1..].to_vec()))));
                }
                Some(Token::Ident(kw)) if kw == "end" => {
                    if tokens.len() > 1 {
                        return Err(Error::parse("unexpected tokens after end"));
                    }
                    return Ok((nodes, Some(Terminator::End)));
                }
                _ => nodes.push(Node::Action(parse_pipeline(&tokens)?)),
            }
        }
        Ok((nodes, None))
    }

    fn parse_if(&mut self, cond: &[Token]) -> Result<Node, Error> {
        let cond = parse_pipeline(cond)?;
        let (then, terminator) = self.parse_list()?;
        let otherwise = match terminator {
            None => return Err(Error::parse("unexpected EOF in if")),
            Some(Terminator::End) => Vec::new(),
            Some(Terminator::Else(rest)) => match rest.first() {
                None => match self.parse_list()? {
                    (otherwise, Some(Terminator::End)) => otherwise,
                    (_, Some(Terminator::Else(_))) => {
                        return Err(Error::parse("expected end; found else"))
                    }
                    (_, None) => return Err(Error::parse("unexpected EOF in else")),
                },
                // `else if` shares the enclosing `end`.
                Some(Token::Ident(kw)) if kw == "if" => vec![self.parse_if(&rest[1..])?],
                Some(_) => return Err(Error::parse("unexpected tokens after else")),
            },
        };
        Ok(Node::If {
            cond,
            then,
            otherwise,
        })
    }
}

type Cursor<'a> = std::iter::Peekable<std::slice::Iter<'a, Token>>;

fn parse_pipeline(tokens: &[Token]) -> Result<Pipeline, Error> {
    let mut cursor = tokens.iter().peekable();
    let pipeline = parse_pipe(&mut cursor)?;
    match cursor.next() {
        None => Ok(pipeline),
        Some(_) => Err(Error::parse("unexpected right paren")),
    }
}

fn parse_pipe(cursor: &mut Cursor<'_>) -> Result<Pipeline, Error> {
    let mut commands = vec![parse_command(cursor)?];
    while cursor.next_if_eq(&&Token::Pipe).is_some() {
        commands.push(parse_command(cursor)?);
    }
    Ok(Pipeline(commands))
}

fn parse_command(cursor: &mut Cursor<'_>) -> Result<Command, Error> {
    let func = match cursor.peek().copied() {
        Some(Token::Ident(name)) if !is_literal(name) => {
            let func = Func::lookup(name)
                .ok_or_else(|| Error::parse(format!("function {name:?} not defined")))?;
            cursor.next();
            Some(func)
        }
        _ => None,
    };

    let mut operands = Vec::new();
    while let Some(&token) = cursor.peek() {
        if matches!(token, Token::Pipe | Token::RParen) {
            break;
        }
        cursor.next();
        operands.push(parse_operand(token, cursor)?);
    }

    if let Some(func) = func {
        return Ok(Command::Call(func, operands));
    }
    let mut operands = operands.into_iter();
    match (operands.next(), operands.next()) {
        (None, _) => Err(Error::parse("missing value for command")),
        (Some(Operand::Nil), None) => Err(Error::parse("nil is not a command")),
        (Some(operand), None) => Ok(Command::Operand(operand)),
        (Some(_), Some(_)) => Err(Error::parse("can't give argument to non-function")),
    }
}

fn parse_operand(token: &Token, cursor: &mut Cursor<'_>) -> Result<Operand, Error> {
    match token {
        Token::Field(chain) => Ok(Operand::Field(chain.clone())),
        Token::Str(s) => Ok(Operand::Str(s.clone())),
        Token::Ident(name) => match name.as_str() {
            "nil" => Ok(Operand::Nil),
            "true" => Ok(Operand::Bool(true)),
            "false" => Ok(Operand::Bool(false)),
            name if Func::lookup(name).is_some() => Err(Error::parse(format!(
                "function {name:?} used as an argument; wrap the call in parentheses"
            ))),
            name => Err(Error::parse(format!("function {name:?} not defined"))),
        },
        Token::LParen => {
            let pipeline = parse_pipe(cursor)?;
            match cursor.next() {
                Some(Token::RParen) => Ok(Operand::Pipeline(Box::new(pipeline))),
                _ => Err(Error::parse("unclosed left paren")),
            }
        }
        Token::RParen | Token::Pipe => Err(Error::parse("unexpected token in operand")),
    }
}

fn is_literal(name: &str) -> bool {
    matches!(name, "nil" | "true" | "false")
}
