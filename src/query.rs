//! Minimal evaluator for the predicate subset of XPath 1.0 used by stream queries
//! (spec §4.4, §8: "the part of an XPath 1.0 expression that would go inside `[...]`
//! on the root `<info>` element"). The original delegates this wholesale to pugixml's
//! full XPath engine; here only the fragment actually exercised by discovery queries is
//! implemented: equality/inequality/relational comparisons and `starts-with(...)` on a
//! child element's text, `count(path)` over repeated child elements, and `and`/`or`/`not`
//! with parentheses.

use crate::xml::Element;

/// Evaluate `predicate` against `root` (the `<info>` element). Returns the predicate's
/// boolean value.
pub fn eval_predicate(predicate: &str, root: &Element) -> bool {
    let tokens = tokenize(predicate);
    let mut parser = Parser { tokens, pos: 0, root };
    parser.parse_or().unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    String(String),
    Number(f64),
    Op(String),
    LParen,
    RParen,
    Comma,
}

fn tokenize(s: &str) -> Vec<Token> {
    let mut out = Vec::new();
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                out.push(Token::LParen);
                i += 1;
            }
            ')' => {
                out.push(Token::RParen);
                i += 1;
            }
            ',' => {
                out.push(Token::Comma);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                out.push(Token::String(chars[start..i].iter().collect()));
                i += 1; // closing quote
            }
            '=' | '!' | '<' | '>' => {
                let mut op = String::from(c);
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    op.push('=');
                    i += 2;
                } else {
                    i += 1;
                }
                out.push(Token::Op(op));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                out.push(Token::Number(text.parse().unwrap_or(0.0)));
            }
            c if c.is_alphanumeric() || c == '_' || c == '/' || c == '-' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '/' || chars[i] == '-')
                {
                    i += 1;
                }
                out.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => {
                i += 1; // skip unrecognized punctuation
            }
        }
    }
    out
}

/// A scalar value resolved against `root`: either text (from a path) or a plain literal.
enum Scalar {
    Text(String),
    Number(f64),
}

impl Scalar {
    fn as_number(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            Scalar::Text(s) => s.parse().ok(),
        }
    }

    fn as_text(&self) -> String {
        match self {
            Scalar::Number(n) => format!("{n}"),
            Scalar::Text(s) => s.clone(),
        }
    }
}

/// Resolve a `/`-separated path of child-element names starting at `root`, tolerating a
/// redundant leading segment equal to the root's own name (queries are sometimes written
/// with the root name as if it were its own ancestor).
fn resolve_path<'a>(root: &'a Element, path: &str) -> Option<&'a Element> {
    let mut cur = root;
    for (i, seg) in path.split('/').filter(|s| !s.is_empty()).enumerate() {
        if i == 0 && seg == root.name() {
            continue;
        }
        cur = cur.child(seg)?;
    }
    Some(cur)
}

fn count_path(root: &Element, path: &str) -> usize {
    let segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segs.is_empty() {
        return 0;
    }
    let mut parents = vec![root];
    for (i, seg) in segs.iter().enumerate() {
        if i == 0 && *seg == root.name() {
            continue;
        }
        if i == segs.len() - 1 {
            return parents.iter().map(|p| p.children_named(seg).count()).sum();
        }
        parents = parents.iter().filter_map(|p| p.child(seg)).collect();
    }
    0
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    root: &'a Element,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn eat_ident(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(id)) if id == word) {
            self.next();
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Option<bool> {
        let mut left = self.parse_and()?;
        while self.eat_ident("or") {
            let right = self.parse_and()?;
            left = left || right;
        }
        Some(left)
    }

    fn parse_and(&mut self) -> Option<bool> {
        let mut left = self.parse_not()?;
        while self.eat_ident("and") {
            let right = self.parse_not()?;
            left = left && right;
        }
        Some(left)
    }

    fn parse_not(&mut self) -> Option<bool> {
        if self.eat_ident("not") {
            return Some(!self.parse_not()?);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Option<bool> {
        if matches!(self.peek(), Some(Token::LParen)) {
            // could be a grouped boolean expr, or a function call consumed by parse_scalar
            let save = self.pos;
            self.next();
            if let Some(value) = self.parse_or() {
                if matches!(self.peek(), Some(Token::RParen)) {
                    self.next();
                    if let Some(op) = self.peek_op() {
                        self.next();
                        let right = self.parse_scalar()?;
                        let left_text = if value { "1".to_string() } else { "0".to_string() };
                        return Some(compare_text(&left_text, &right.as_text(), &op));
                    }
                    return Some(value);
                }
            }
            self.pos = save;
        }
        let left = self.parse_scalar()?;
        if let Some(op) = self.peek_op() {
            self.next();
            let right = self.parse_scalar()?;
            return Some(compare(&left, &right, &op));
        }
        Some(!left.as_text().is_empty())
    }

    fn peek_op(&self) -> Option<String> {
        match self.peek() {
            Some(Token::Op(op)) => Some(op.clone()),
            _ => None,
        }
    }

    fn parse_scalar(&mut self) -> Option<Scalar> {
        match self.next()? {
            Token::String(s) => Some(Scalar::Text(s)),
            Token::Number(n) => Some(Scalar::Number(n)),
            Token::Ident(id) if id == "count" => {
                self.expect(Token::LParen);
                let path = self.take_path();
                self.expect(Token::RParen);
                Some(Scalar::Number(count_path(self.root, &path) as f64))
            }
            Token::Ident(id) if id == "starts-with" => {
                self.expect(Token::LParen);
                let path = self.take_path();
                self.expect(Token::Comma);
                let prefix = match self.next() {
                    Some(Token::String(s)) => s,
                    _ => String::new(),
                };
                self.expect(Token::RParen);
                let text = resolve_path(self.root, &path).map(|e| e.value().to_string()).unwrap_or_default();
                Some(Scalar::Text(if text.starts_with(&prefix) { "1".into() } else { "".into() }))
            }
            Token::Ident(id) => {
                let text = resolve_path(self.root, &id).map(|e| e.value().to_string()).unwrap_or_default();
                Some(Scalar::Text(text))
            }
            _ => None,
        }
    }

    fn take_path(&mut self) -> String {
        match self.next() {
            Some(Token::Ident(p)) => p,
            _ => String::new(),
        }
    }

    fn expect(&mut self, want: Token) {
        if self.peek() == Some(&want) {
            self.next();
        }
    }
}

fn compare(left: &Scalar, right: &Scalar, op: &str) -> bool {
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        return match op {
            "=" => a == b,
            "!=" => a != b,
            "<" => a < b,
            "<=" => a <= b,
            ">" => a > b,
            ">=" => a >= b,
            _ => false,
        };
    }
    compare_text(&left.as_text(), &right.as_text(), op)
}

fn compare_text(a: &str, b: &str, op: &str) -> bool {
    match op {
        "=" => a == b,
        "!=" => a != b,
        "<" => a < b,
        "<=" => a <= b,
        ">" => a > b,
        ">=" => a >= b,
        _ => false,
    }
}
