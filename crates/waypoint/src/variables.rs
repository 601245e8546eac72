//! Variables store and condition evaluator (`spec.md` §4.1).
//!
//! Variables is a keyed store behind a single mutex; conditions are boolean
//! expressions over variable values. The grammar is parsed by a small
//! recursive-descent parser (`OR` lowest, `NOT` and comparison highest) and
//! evaluated directly against the [`Variant`] values read from the store,
//! the same split a SQL-style expression evaluator makes between an AST and
//! a context that resolves identifiers.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, bail};
use waypoint_types::{Variable, Variant, Version};

/// Initializer for a built-in variable, invoked lazily on first read.
pub type BuiltInInitializer = Box<dyn Fn() -> Variant + Send + Sync>;

/// Process-wide variable store. All access is serialized through one mutex,
/// matching the single-writer discipline the executor and cache worker need
/// when both threads touch the same Variables instance.
pub struct Variables {
    inner: Mutex<Inner>,
}

struct Inner {
    vars: HashMap<String, Variable>,
    built_ins: HashMap<String, BuiltInInitializer>,
}

impl Default for Variables {
    fn default() -> Self {
        Self::new()
    }
}

impl Variables {
    pub fn new() -> Self {
        Variables { inner: Mutex::new(Inner { vars: HashMap::new(), built_ins: HashMap::new() }) }
    }

    /// Register a built-in whose value is computed on first read rather than at startup.
    pub fn register_built_in(&self, name: impl Into<String>, init: BuiltInInitializer) {
        let mut inner = self.inner.lock().expect("variables mutex poisoned");
        inner.built_ins.insert(name.into(), init);
    }

    fn resolve_built_in(&self, inner: &mut Inner, name: &str) {
        if inner.vars.contains_key(name) {
            return;
        }
        if let Some(init) = inner.built_ins.get(name) {
            let value = init();
            inner.vars.insert(
                name.to_string(),
                Variable { built_in: true, ..Variable::new(name, value) },
            );
        }
    }

    pub fn get_variant(&self, name: &str) -> Variant {
        let mut inner = self.inner.lock().expect("variables mutex poisoned");
        self.resolve_built_in(&mut inner, name);
        inner.vars.get(name).map(|v| v.value.clone()).unwrap_or(Variant::None)
    }

    pub fn get_numeric(&self, name: &str) -> Option<i64> {
        match self.get_variant(name) {
            Variant::Numeric(n) => Some(n),
            _ => None,
        }
    }

    pub fn get_string(&self, name: &str) -> Option<String> {
        match self.get_variant(name) {
            Variant::String(s) => Some(s),
            Variant::None => None,
            other => Some(other.to_string()),
        }
    }

    pub fn get_version(&self, name: &str) -> Option<Version> {
        match self.get_variant(name) {
            Variant::Version(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_hidden(&self, name: &str) -> bool {
        let inner = self.inner.lock().expect("variables mutex poisoned");
        inner.vars.get(name).map(|v| v.hidden).unwrap_or(false)
    }

    /// Set a variable's value. Refuses to overwrite a built-in unless `allow_built_in`.
    pub fn set(&self, name: &str, value: Variant, allow_built_in: bool) -> Result<()> {
        let mut inner = self.inner.lock().expect("variables mutex poisoned");
        self.resolve_built_in(&mut inner, name);
        if let Some(existing) = inner.vars.get(name)
            && existing.built_in
            && !allow_built_in
        {
            bail!("cannot overwrite built-in variable {name} without allow-built-in");
        }
        let generation = inner.vars.get(name).map(|v| v.generation + 1).unwrap_or(0);
        let built_in = inner.vars.get(name).map(|v| v.built_in).unwrap_or(false);
        let hidden = inner.vars.get(name).map(|v| v.hidden).unwrap_or(false);
        let literal = inner.vars.get(name).map(|v| v.literal).unwrap_or(false);
        let persisted = inner.vars.get(name).map(|v| v.persisted).unwrap_or(false);
        inner.vars.insert(
            name.to_string(),
            Variable { name: name.to_string(), value, hidden, literal, persisted, built_in, generation },
        );
        Ok(())
    }

    pub fn set_numeric(&self, name: &str, value: i64) -> Result<()> {
        self.set(name, Variant::Numeric(value), false)
    }

    pub fn set_string(&self, name: &str, value: impl Into<String>) -> Result<()> {
        self.set(name, Variant::String(value.into()), false)
    }

    pub fn set_version(&self, name: &str, value: Version) -> Result<()> {
        self.set(name, Variant::Version(value), false)
    }

    /// Apply `Name=Value` command-line overrides, accepting only names present in
    /// `overridable` and silently refusing the rest (the caller logs each rejection).
    /// Returns the names rejected, in the order they were refused.
    pub fn apply_command_line_overrides(
        &self,
        overrides: &[(String, String)],
        overridable: &std::collections::HashSet<String>,
    ) -> Vec<String> {
        let mut rejected = Vec::new();
        for (name, value) in overrides {
            if overridable.contains(name) {
                let _ = self.set_string(name, value.clone());
            } else {
                rejected.push(name.clone());
            }
        }
        rejected
    }

    pub fn set_hidden(&self, name: &str, hidden: bool) {
        let mut inner = self.inner.lock().expect("variables mutex poisoned");
        if let Some(v) = inner.vars.get_mut(name) {
            v.hidden = hidden;
        }
    }

    pub fn set_literal(&self, name: &str, literal: bool) {
        let mut inner = self.inner.lock().expect("variables mutex poisoned");
        if let Some(v) = inner.vars.get_mut(name) {
            v.literal = literal;
        }
    }

    fn is_literal(&self, name: &str) -> bool {
        let inner = self.inner.lock().expect("variables mutex poisoned");
        inner.vars.get(name).map(|v| v.literal).unwrap_or(false)
    }

    pub fn set_persisted(&self, name: &str, persisted: bool) {
        let mut inner = self.inner.lock().expect("variables mutex poisoned");
        if let Some(v) = inner.vars.get_mut(name) {
            v.persisted = persisted;
        }
    }

    /// Expand `[Name]`-delimited references in `template`. `[\[]`/`[\]]` yield literal
    /// brackets, `[]` yields the empty string, and an unterminated `[` is copied verbatim.
    /// A variable marked `literal` is substituted without recursing into its own value;
    /// otherwise the whole template is expanded exactly once (fixpoint-once, not fully
    /// recursive).
    pub fn format(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let bytes: Vec<char> = template.chars().collect();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] != '[' {
                out.push(bytes[i]);
                i += 1;
                continue;
            }
            // Find the matching ']'.
            let Some(close) = bytes[i + 1..].iter().position(|&c| c == ']') else {
                // Unterminated '[': copy verbatim.
                out.push_str(&bytes[i..].iter().collect::<String>());
                break;
            };
            let name: String = bytes[i + 1..i + 1 + close].iter().collect();
            match name.as_str() {
                "" => {}
                "\\[" => out.push('['),
                "\\]" => out.push(']'),
                _ => {
                    let raw = self.get_variant(&name).to_string();
                    if self.is_literal(&name) {
                        out.push_str(&raw);
                    } else {
                        // Non-literal: the substituted value gets one more formatting pass so
                        // brackets nested inside it resolve too, but no further than that.
                        out.push_str(&self.format(&raw));
                    }
                }
            }
            i += close + 2;
        }
        out
    }

    /// Escape `[` and `]` so `text` round-trips through [`format`](Self::format) unchanged.
    pub fn escape(&self, text: &str) -> String {
        text.replace('[', "[\\[]").replace(']', "[\\]]")
    }

    /// Serialize persisted (or all) variables to a JSON byte blob for registration/resume.
    pub fn serialize(&self, persisted_only: bool) -> Result<Vec<u8>> {
        let inner = self.inner.lock().expect("variables mutex poisoned");
        let selected: Vec<&Variable> =
            inner.vars.values().filter(|v| !persisted_only || v.persisted).collect();
        Ok(serde_json::to_vec(&selected)?)
    }

    /// Restore variables from a blob produced by [`serialize`](Self::serialize).
    /// `was_persisted` marks every restored variable as persisted regardless of its
    /// stored flag, matching a resume from a registration blob.
    pub fn deserialize(&self, bytes: &[u8], was_persisted: bool) -> Result<()> {
        let restored: Vec<Variable> = serde_json::from_slice(bytes)?;
        let mut inner = self.inner.lock().expect("variables mutex poisoned");
        for mut v in restored {
            if was_persisted {
                v.persisted = true;
            }
            inner.vars.insert(v.name.clone(), v);
        }
        Ok(())
    }

    pub fn evaluate_condition(&self, expr: &str) -> Result<bool> {
        let ast = parse_condition(expr)?;
        Ok(eval(&ast, self)?.is_truthy())
    }
}

// --- Condition grammar -----------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Ident(String),
    Numeric(i64),
    Version(Version),
    Str(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(Box<Expr>, CmpOp, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    NotEq,
    IEq,
    INotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    BeginsWith,
    EndsWith,
    Contains,
}

struct Parser<'a> {
    tokens: Vec<Tok<'a>>,
    pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Tok<'a> {
    Ident(&'a str),
    Numeric(i64),
    Version(Version),
    Str(String),
    Op(&'static str),
    LParen,
    RParen,
    And,
    Or,
    Not,
}

fn tokenize(input: &str) -> Result<Vec<Tok<'_>>> {
    let mut toks = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            '"' => {
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] as char != '"' {
                    j += 1;
                }
                if j >= bytes.len() {
                    bail!("invalid-condition: unterminated string literal");
                }
                toks.push(Tok::Str(input[start..j].to_string()));
                i = j + 1;
            }
            '~' => {
                if input[i..].starts_with("~=") {
                    toks.push(Tok::Op("~="));
                    i += 2;
                } else if input[i..].starts_with("~<>") {
                    toks.push(Tok::Op("~<>"));
                    i += 3;
                } else {
                    bail!("invalid-condition: unexpected '~'");
                }
            }
            '<' => {
                if input[i..].starts_with("<=") {
                    toks.push(Tok::Op("<="));
                    i += 2;
                } else if input[i..].starts_with("<>") {
                    toks.push(Tok::Op("<>"));
                    i += 2;
                } else if input[i..].starts_with("<<") {
                    toks.push(Tok::Op("<<"));
                    i += 2;
                } else {
                    toks.push(Tok::Op("<"));
                    i += 1;
                }
            }
            '>' => {
                if input[i..].starts_with(">=") {
                    toks.push(Tok::Op(">="));
                    i += 2;
                } else if input[i..].starts_with(">>") {
                    toks.push(Tok::Op(">>"));
                    i += 2;
                } else if input[i..].starts_with("><") {
                    toks.push(Tok::Op("><"));
                    i += 2;
                } else {
                    toks.push(Tok::Op(">"));
                    i += 1;
                }
            }
            '=' => {
                toks.push(Tok::Op("="));
                i += 1;
            }
            'v' | 'V' if bytes.get(i + 1).is_some_and(|b| (*b as char).is_ascii_digit()) => {
                let start = i;
                let mut j = i + 1;
                while j < bytes.len() {
                    let cc = bytes[j] as char;
                    if cc.is_ascii_digit() || cc == '.' {
                        j += 1;
                    } else {
                        break;
                    }
                }
                toks.push(Tok::Version(parse_version(&input[start + 1..j])?));
                i = j;
            }
            _ if c.is_ascii_digit() || c == '-' => {
                let start = i;
                let mut j = i + 1;
                while j < bytes.len() && (bytes[j] as char).is_ascii_digit() {
                    j += 1;
                }
                let n: i64 = input[start..j]
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid-condition: bad integer literal"))?;
                toks.push(Tok::Numeric(n));
                i = j;
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                let mut j = i;
                while j < bytes.len() {
                    let cc = bytes[j] as char;
                    if cc.is_alphanumeric() || cc == '_' || cc == '.' {
                        j += 1;
                    } else {
                        break;
                    }
                }
                let word = &input[start..j];
                match word {
                    "AND" => toks.push(Tok::And),
                    "OR" => toks.push(Tok::Or),
                    "NOT" => toks.push(Tok::Not),
                    _ => toks.push(Tok::Ident(word)),
                }
                i = j;
            }
            _ => bail!("invalid-condition: unexpected character '{c}'"),
        }
    }
    Ok(toks)
}

fn parse_version(s: &str) -> Result<Version> {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.is_empty() || parts.len() > 4 {
        bail!("invalid-condition: version literal must have 1-4 fields");
    }
    let mut fields = [0u16; 4];
    for (idx, p) in parts.iter().enumerate() {
        fields[idx] =
            p.parse().map_err(|_| anyhow::anyhow!("invalid-condition: bad version field"))?;
    }
    Ok(Version(fields[0], fields[1], fields[2], fields[3]))
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Tok<'a>> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok<'a>> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Tok::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Tok::And) {
            self.next();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Tok::Not) {
            self.next();
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let left = self.parse_atom()?;
        let op = match self.peek() {
            Some(Tok::Op(op)) => *op,
            _ => return Ok(left),
        };
        self.next();
        let right = self.parse_atom()?;
        let cmp = match op {
            "=" => CmpOp::Eq,
            "<>" => CmpOp::NotEq,
            "~=" => CmpOp::IEq,
            "~<>" => CmpOp::INotEq,
            "<" => CmpOp::Lt,
            "<=" => CmpOp::LtEq,
            ">" => CmpOp::Gt,
            ">=" => CmpOp::GtEq,
            "<<" => CmpOp::BeginsWith,
            ">>" => CmpOp::EndsWith,
            "><" => CmpOp::Contains,
            _ => bail!("invalid-condition: unknown operator {op}"),
        };
        Ok(Expr::Cmp(Box::new(left), cmp, Box::new(right)))
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Tok::LParen) => {
                let inner = self.parse_or()?;
                if self.next() != Some(Tok::RParen) {
                    bail!("invalid-condition: expected ')'");
                }
                Ok(inner)
            }
            Some(Tok::Ident(name)) => Ok(Expr::Ident(name.to_string())),
            Some(Tok::Numeric(n)) => Ok(Expr::Numeric(n)),
            Some(Tok::Version(v)) => Ok(Expr::Version(v)),
            Some(Tok::Str(s)) => Ok(Expr::Str(s)),
            Some(Tok::Not) => Ok(Expr::Not(Box::new(self.parse_atom()?))),
            other => bail!("invalid-condition: unexpected token {other:?}"),
        }
    }
}

fn parse_condition(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        bail!("invalid-condition: trailing tokens after expression");
    }
    Ok(expr)
}

fn eval(expr: &Expr, vars: &Variables) -> Result<Variant> {
    Ok(match expr {
        Expr::Ident(name) => vars.get_variant(name),
        Expr::Numeric(n) => Variant::Numeric(*n),
        Expr::Version(v) => Variant::Version(*v),
        Expr::Str(s) => Variant::String(s.clone()),
        Expr::Not(inner) => Variant::Numeric(if eval(inner, vars)?.is_truthy() { 0 } else { 1 }),
        Expr::And(l, r) => Variant::Numeric(
            if eval(l, vars)?.is_truthy() && eval(r, vars)?.is_truthy() { 1 } else { 0 },
        ),
        Expr::Or(l, r) => Variant::Numeric(
            if eval(l, vars)?.is_truthy() || eval(r, vars)?.is_truthy() { 1 } else { 0 },
        ),
        Expr::Cmp(l, op, r) => Variant::Numeric(if eval_cmp(&eval(l, vars)?, *op, &eval(r, vars)?)? { 1 } else { 0 }),
    })
}

fn coerce_numeric(v: &Variant) -> Result<i64> {
    match v {
        Variant::Numeric(n) => Ok(*n),
        Variant::String(s) => {
            s.parse().map_err(|_| anyhow::anyhow!("invalid-condition: cannot coerce '{s}' to numeric"))
        }
        _ => bail!("invalid-condition: cannot coerce {} to numeric", v.type_name()),
    }
}

fn coerce_version(v: &Variant) -> Result<Version> {
    match v {
        Variant::Version(ver) => Ok(*ver),
        Variant::String(s) => {
            let s = s.strip_prefix('v').unwrap_or(s);
            parse_version(s)
        }
        _ => bail!("invalid-condition: cannot coerce {} to version", v.type_name()),
    }
}

fn eval_cmp(left: &Variant, op: CmpOp, right: &Variant) -> Result<bool> {
    use Variant::*;
    let (l, r) = match (left, right) {
        (Numeric(_), String(_)) | (String(_), Numeric(_)) => {
            (Numeric(coerce_numeric(left)?), Numeric(coerce_numeric(right)?))
        }
        (Version(_), String(_)) | (String(_), Version(_)) => {
            (Version(coerce_version(left)?), Version(coerce_version(right)?))
        }
        _ => (left.clone(), right.clone()),
    };

    Ok(match op {
        CmpOp::Eq => variant_eq(&l, &r, false),
        CmpOp::NotEq => !variant_eq(&l, &r, false),
        CmpOp::IEq => variant_eq(&l, &r, true),
        CmpOp::INotEq => !variant_eq(&l, &r, true),
        CmpOp::Lt | CmpOp::LtEq | CmpOp::Gt | CmpOp::GtEq => variant_ord(&l, &r, op)?,
        CmpOp::BeginsWith => match (&l, &r) {
            (String(a), String(b)) => a.starts_with(b.as_str()),
            (Numeric(a), Numeric(b)) => (*a & *b) == *b,
            _ => bail!("invalid-condition: '<<' requires matching string or numeric operands"),
        },
        CmpOp::EndsWith => match (&l, &r) {
            (String(a), String(b)) => a.ends_with(b.as_str()),
            (Numeric(a), Numeric(b)) => (*a & *b) == *b,
            _ => bail!("invalid-condition: '>>' requires matching string or numeric operands"),
        },
        CmpOp::Contains => match (&l, &r) {
            (String(a), String(b)) => a.contains(b.as_str()),
            (Numeric(a), Numeric(b)) => (*a & *b) != 0,
            _ => bail!("invalid-condition: '><' requires matching string or numeric operands"),
        },
    })
}

fn variant_eq(l: &Variant, r: &Variant, case_insensitive: bool) -> bool {
    match (l, r) {
        (Variant::String(a), Variant::String(b)) if case_insensitive => {
            a.eq_ignore_ascii_case(b)
        }
        _ => l == r,
    }
}

fn variant_ord(l: &Variant, r: &Variant, op: CmpOp) -> Result<bool> {
    use std::cmp::Ordering;
    let ord = match (l, r) {
        (Variant::Numeric(a), Variant::Numeric(b)) => a.cmp(b),
        (Variant::Version(a), Variant::Version(b)) => a.cmp(b),
        (Variant::String(a), Variant::String(b)) => a.cmp(b),
        _ => bail!("invalid-condition: cannot order-compare mismatched types"),
    };
    Ok(match op {
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::LtEq => ord != Ordering::Greater,
        CmpOp::Gt => ord == Ordering::Greater,
        CmpOp::GtEq => ord != Ordering::Less,
        _ => unreachable!(),
    })
}
