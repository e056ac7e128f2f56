//! Büchi automata read from Promela never claims.
//!
//! ```text
//! never {
//! T0_init:
//!   if
//!   :: (!p) -> goto accept_S2
//!   :: (1) -> goto T0_init
//!   fi;
//! accept_S2:
//!   if
//!   :: (!p) -> goto accept_S2
//!   fi;
//! }
//! ```
//!
//! States whose name contains `init` are initial, names starting with
//! `accept` are accepting. `skip` is an unconditional self loop.

use crate::ExploreError;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Label {
    True,
    /// Index into [`Automaton::propositions`].
    Proposition(usize),
    Not(Box<Label>),
    And(Box<Label>, Box<Label>),
    Or(Box<Label>, Box<Label>),
}

impl Label {
    pub fn eval(&self, values: &[bool]) -> bool {
        match self {
            Self::True => true,
            Self::Proposition(i) => values.get(*i).copied().unwrap_or(false),
            Self::Not(inner) => !inner.eval(values),
            Self::And(a, b) => a.eval(values) && b.eval(values),
            Self::Or(a, b) => a.eval(values) || b.eval(values),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub label: Label,
    pub dst: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomatonState {
    pub name: String,
    pub initial: bool,
    pub accepting: bool,
    pub out: Vec<Edge>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Automaton {
    pub states: Vec<AutomatonState>,
    /// Proposition names in order of first use.
    pub propositions: Vec<String>,
}

impl Automaton {
    pub fn load(path: &Path) -> Result<Self, ExploreError> {
        let text = std::fs::read_to_string(path).map_err(|e| ExploreError::Property {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&text).map_err(|reason| ExploreError::Property {
            path: path.display().to_string(),
            reason,
        })
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let tokens = tokenize(text)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            automaton: Automaton {
                states: Vec::new(),
                propositions: Vec::new(),
            },
            by_name: HashMap::new(),
            defined: Vec::new(),
        };
        parser.never_claim()?;
        parser.finish()
    }

    pub fn initial_states(&self) -> impl Iterator<Item = usize> + '_ {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.initial)
            .map(|(i, _)| i)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Number(i64),
    LBrace,
    RBrace,
    LParen,
    RParen,
    Colon,
    DoubleColon,
    Semi,
    Arrow,
    Or,
    And,
    Not,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
            Self::LBrace => f.write_str("{"),
            Self::RBrace => f.write_str("}"),
            Self::LParen => f.write_str("("),
            Self::RParen => f.write_str(")"),
            Self::Colon => f.write_str(":"),
            Self::DoubleColon => f.write_str("::"),
            Self::Semi => f.write_str(";"),
            Self::Arrow => f.write_str("->"),
            Self::Or => f.write_str("||"),
            Self::And => f.write_str("&&"),
            Self::Not => f.write_str("!"),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '/' if next == Some('*') => {
                let rest: String = chars[i + 2..].iter().collect();
                let end = rest.find("*/").ok_or("unterminated comment")?;
                i += 2 + rest[..end].chars().count() + 2;
            }
            '/' if next == Some('/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ';' => {
                tokens.push(Token::Semi);
                i += 1;
            }
            ':' if next == Some(':') => {
                tokens.push(Token::DoubleColon);
                i += 2;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '-' if next == Some('>') => {
                tokens.push(Token::Arrow);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let digits: String = chars[start..i].iter().collect();
                let n = digits
                    .parse()
                    .map_err(|e| format!("bad number {digits}: {e}"))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character {other:?}")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    automaton: Automaton,
    by_name: HashMap<String, usize>,
    defined: Vec<bool>,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, want: Token) -> Result<(), String> {
        match self.bump() {
            Some(got) if got == want => Ok(()),
            Some(got) => Err(format!("expected `{want}`, found `{got}`")),
            None => Err(format!("expected `{want}`, found end of input")),
        }
    }

    fn keyword(&mut self, word: &str) -> Result<(), String> {
        match self.bump() {
            Some(Token::Ident(s)) if s == word => Ok(()),
            Some(got) => Err(format!("expected `{word}`, found `{got}`")),
            None => Err(format!("expected `{word}`, found end of input")),
        }
    }

    fn ident(&mut self) -> Result<String, String> {
        match self.bump() {
            Some(Token::Ident(s)) => Ok(s),
            Some(got) => Err(format!("expected a name, found `{got}`")),
            None => Err("expected a name, found end of input".to_string()),
        }
    }

    fn state(&mut self, name: &str) -> usize {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = self.automaton.states.len();
        self.automaton.states.push(AutomatonState {
            name: name.to_string(),
            initial: name.contains("init"),
            accepting: name.starts_with("accept"),
            out: Vec::new(),
        });
        self.defined.push(false);
        self.by_name.insert(name.to_string(), id);
        id
    }

    fn proposition(&mut self, name: &str) -> usize {
        let props = &mut self.automaton.propositions;
        match props.iter().position(|p| p == name) {
            Some(i) => i,
            None => {
                props.push(name.to_string());
                props.len() - 1
            }
        }
    }

    fn never_claim(&mut self) -> Result<(), String> {
        self.keyword("never")?;
        self.expect(Token::LBrace)?;
        while !matches!(self.peek(), Some(Token::RBrace) | None) {
            self.state_block()?;
        }
        self.expect(Token::RBrace)?;
        if let Some(extra) = self.peek() {
            return Err(format!("unexpected `{extra}` after the never claim"));
        }
        Ok(())
    }

    fn state_block(&mut self) -> Result<(), String> {
        let name = self.ident()?;
        self.expect(Token::Colon)?;
        let src = self.state(&name);
        if self.defined[src] {
            return Err(format!("state {name} defined twice"));
        }
        self.defined[src] = true;

        match self.bump() {
            Some(Token::Ident(word)) if word == "skip" => {
                self.automaton.states[src].out.push(Edge {
                    label: Label::True,
                    dst: src,
                });
            }
            Some(Token::Ident(word)) if word == "if" => {
                while matches!(self.peek(), Some(Token::DoubleColon)) {
                    self.bump();
                    let label = self.label()?;
                    self.expect(Token::Arrow)?;
                    self.keyword("goto")?;
                    let dst_name = self.ident()?;
                    let dst = self.state(&dst_name);
                    self.automaton.states[src].out.push(Edge { label, dst });
                }
                self.keyword("fi")?;
            }
            Some(Token::Ident(word)) if word == "false" => {}
            Some(got) => return Err(format!("unexpected `{got}` in state {name}")),
            None => return Err(format!("state {name} has no body")),
        }
        if matches!(self.peek(), Some(Token::Semi)) {
            self.bump();
        }
        Ok(())
    }

    fn label(&mut self) -> Result<Label, String> {
        let mut left = self.conjunction()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.bump();
            let right = self.conjunction()?;
            left = Label::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn conjunction(&mut self) -> Result<Label, String> {
        let mut left = self.unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.bump();
            let right = self.unary()?;
            left = Label::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Label, String> {
        match self.bump() {
            Some(Token::Not) => Ok(Label::Not(Box::new(self.unary()?))),
            Some(Token::LParen) => {
                let inner = self.label()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Number(1)) => Ok(Label::True),
            Some(Token::Number(0)) => Ok(Label::Not(Box::new(Label::True))),
            Some(Token::Ident(word)) if word == "true" => Ok(Label::True),
            Some(Token::Ident(word)) if word == "false" => Ok(Label::Not(Box::new(Label::True))),
            Some(Token::Ident(name)) => Ok(Label::Proposition(self.proposition(&name))),
            Some(got) => Err(format!("unexpected `{got}` in a label")),
            None => Err("label cut short by end of input".to_string()),
        }
    }

    fn finish(self) -> Result<Automaton, String> {
        if let Some(i) = self.defined.iter().position(|d| !d) {
            return Err(format!(
                "state {} is the target of a goto but never defined",
                self.automaton.states[i].name
            ));
        }
        if !self.automaton.states.iter().any(|s| s.initial) {
            return Err("no initial state (a state name must contain `init`)".to_string());
        }
        Ok(self.automaton)
    }
}
