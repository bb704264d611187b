//! Query Expressions
//!
//! The full LQL surface lives outside the engine; this module carries the
//! subset the read path consumes: the tag expression that selects source
//! journals and the `where` predicate applied to each record.
//!
//! ## Grammar
//!
//! ```text
//! query    := sources [ "where" predicate ]
//! sources  := src-term  { "or" src-term }
//! src-term := src-atom  { "and" src-atom }
//! src-atom := ident "=" value | "(" sources ")"
//!
//! predicate := p-term { "or" p-term }
//! p-term    := p-atom { "and" p-atom }
//! p-atom    := "msg" ("contains" | "prefix") string
//!            | "ts" ("<" | "<=" | ">" | ">=" | "=") number
//!            | "(" predicate ")"
//! ```
//!
//! Keywords are case-insensitive; `and` binds tighter than `or`. An empty
//! predicate matches everything.

use loghouse_core::{Error, LogEvent, Result, TagSet};

/// Tag expression selecting source journals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagExpr {
    Eq(String, String),
    And(Box<TagExpr>, Box<TagExpr>),
    Or(Box<TagExpr>, Box<TagExpr>),
}

impl TagExpr {
    /// Whether a journal's tags satisfy the expression.
    pub fn matches(&self, tags: &TagSet) -> bool {
        match self {
            TagExpr::Eq(k, v) => tags.get(k) == Some(v.as_str()),
            TagExpr::And(a, b) => a.matches(tags) && b.matches(tags),
            TagExpr::Or(a, b) => a.matches(tags) || b.matches(tags),
        }
    }
}

/// Record predicate from the `where` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhereExpr {
    /// Empty clause: matches everything.
    All,
    MsgContains(String),
    MsgPrefix(String),
    Ts(CmpOp, i64),
    And(Box<WhereExpr>, Box<WhereExpr>),
    Or(Box<WhereExpr>, Box<WhereExpr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl WhereExpr {
    /// Evaluates the predicate against one event.
    pub fn matches(&self, ev: &LogEvent) -> bool {
        match self {
            WhereExpr::All => true,
            WhereExpr::MsgContains(needle) => {
                let needle = needle.as_bytes();
                needle.is_empty()
                    || ev
                        .msg
                        .windows(needle.len())
                        .any(|window| window == needle)
            }
            WhereExpr::MsgPrefix(prefix) => ev.msg.starts_with(prefix.as_bytes()),
            WhereExpr::Ts(op, n) => match op {
                CmpOp::Lt => ev.ts < *n,
                CmpOp::Le => ev.ts <= *n,
                CmpOp::Gt => ev.ts > *n,
                CmpOp::Ge => ev.ts >= *n,
                CmpOp::Eq => ev.ts == *n,
            },
            WhereExpr::And(a, b) => a.matches(ev) && b.matches(ev),
            WhereExpr::Or(a, b) => a.matches(ev) || b.matches(ev),
        }
    }
}

/// Parses a source tag expression, e.g. `name=app and pod=p1 or name=db`.
pub fn parse_source_expr(src: &str) -> Result<TagExpr> {
    let mut p = Parser::new(src)?;
    let expr = p.source_expr()?;
    p.expect_end()?;
    Ok(expr)
}

/// Parses a `where` predicate. An empty string matches everything.
pub fn parse_where(src: &str) -> Result<WhereExpr> {
    if src.trim().is_empty() {
        return Ok(WhereExpr::All);
    }
    let mut p = Parser::new(src)?;
    let expr = p.where_expr()?;
    p.expect_end()?;
    Ok(expr)
}

/// Splits a query line into its sources part and its (possibly empty)
/// `where` part. The keyword is recognized outside quotes only.
pub fn split_query(query: &str) -> (String, String) {
    let lower = query.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let mut in_quotes = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => in_quotes = !in_quotes,
            b'w' if !in_quotes && lower[i..].starts_with("where") => {
                let before_ok = i == 0 || bytes[i - 1].is_ascii_whitespace();
                let after = i + 5;
                let after_ok = after >= bytes.len() || bytes[after].is_ascii_whitespace();
                if before_ok && after_ok {
                    return (
                        query[..i].trim().to_string(),
                        query[after..].trim().to_string(),
                    );
                }
            }
            _ => {}
        }
        i += 1;
    }
    (query.trim().to_string(), String::new())
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(i64),
    Sym(&'static str),
}

struct Parser {
    toks: Vec<Tok>,
    at: usize,
}

impl Parser {
    fn new(src: &str) -> Result<Self> {
        Ok(Self {
            toks: tokenize(src)?,
            at: 0,
        })
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.at)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.at).cloned();
        if tok.is_some() {
            self.at += 1;
        }
        tok
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if let Some(Tok::Ident(id)) = self.peek() {
            if id.eq_ignore_ascii_case(kw) {
                self.at += 1;
                return true;
            }
        }
        false
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if let Some(Tok::Sym(s)) = self.peek() {
            if *s == sym {
                self.at += 1;
                return true;
            }
        }
        false
    }

    fn expect_sym(&mut self, sym: &'static str) -> Result<()> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(Error::Parse(format!("expected \"{}\"", sym)))
        }
    }

    fn expect_end(&self) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(tok) => Err(Error::Parse(format!("unexpected trailing {:?}", tok))),
        }
    }

    fn source_expr(&mut self) -> Result<TagExpr> {
        let mut left = self.source_term()?;
        while self.eat_keyword("or") {
            let right = self.source_term()?;
            left = TagExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn source_term(&mut self) -> Result<TagExpr> {
        let mut left = self.source_atom()?;
        while self.eat_keyword("and") {
            let right = self.source_atom()?;
            left = TagExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn source_atom(&mut self) -> Result<TagExpr> {
        if self.eat_sym("(") {
            let expr = self.source_expr()?;
            self.expect_sym(")")?;
            return Ok(expr);
        }
        let key = match self.bump() {
            Some(Tok::Ident(id)) => id,
            other => return Err(Error::Parse(format!("expected tag key, got {:?}", other))),
        };
        self.expect_sym("=")?;
        let value = match self.bump() {
            Some(Tok::Ident(id)) => id,
            Some(Tok::Str(s)) => s,
            Some(Tok::Num(n)) => n.to_string(),
            other => return Err(Error::Parse(format!("expected tag value, got {:?}", other))),
        };
        Ok(TagExpr::Eq(key, value))
    }

    fn where_expr(&mut self) -> Result<WhereExpr> {
        let mut left = self.where_term()?;
        while self.eat_keyword("or") {
            let right = self.where_term()?;
            left = WhereExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn where_term(&mut self) -> Result<WhereExpr> {
        let mut left = self.where_atom()?;
        while self.eat_keyword("and") {
            let right = self.where_atom()?;
            left = WhereExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn where_atom(&mut self) -> Result<WhereExpr> {
        if self.eat_sym("(") {
            let expr = self.where_expr()?;
            self.expect_sym(")")?;
            return Ok(expr);
        }
        if self.eat_keyword("msg") {
            let op_contains = self.eat_keyword("contains");
            if !op_contains && !self.eat_keyword("prefix") {
                return Err(Error::Parse(
                    "expected \"contains\" or \"prefix\" after msg".to_string(),
                ));
            }
            let needle = match self.bump() {
                Some(Tok::Str(s)) => s,
                other => {
                    return Err(Error::Parse(format!(
                        "expected quoted string, got {:?}",
                        other
                    )))
                }
            };
            return Ok(if op_contains {
                WhereExpr::MsgContains(needle)
            } else {
                WhereExpr::MsgPrefix(needle)
            });
        }
        if self.eat_keyword("ts") {
            let op = if self.eat_sym(">=") {
                CmpOp::Ge
            } else if self.eat_sym("<=") {
                CmpOp::Le
            } else if self.eat_sym(">") {
                CmpOp::Gt
            } else if self.eat_sym("<") {
                CmpOp::Lt
            } else if self.eat_sym("=") {
                CmpOp::Eq
            } else {
                return Err(Error::Parse("expected comparison after ts".to_string()));
            };
            let n = match self.bump() {
                Some(Tok::Num(n)) => n,
                other => return Err(Error::Parse(format!("expected number, got {:?}", other))),
            };
            return Ok(WhereExpr::Ts(op, n));
        }
        Err(Error::Parse(format!(
            "expected msg or ts condition, got {:?}",
            self.peek()
        )))
    }
}

fn tokenize(src: &str) -> Result<Vec<Tok>> {
    let mut toks = Vec::new();
    let bytes = src.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\n' | b'\r' => i += 1,
            b'(' => {
                toks.push(Tok::Sym("("));
                i += 1;
            }
            b')' => {
                toks.push(Tok::Sym(")"));
                i += 1;
            }
            b'>' | b'<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    toks.push(Tok::Sym(if c == b'>' { ">=" } else { "<=" }));
                    i += 2;
                } else {
                    toks.push(Tok::Sym(if c == b'>' { ">" } else { "<" }));
                    i += 1;
                }
            }
            b'=' => {
                toks.push(Tok::Sym("="));
                i += 1;
            }
            b'"' => {
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] != b'"' {
                    j += 1;
                }
                if j == bytes.len() {
                    return Err(Error::Parse("unterminated string".to_string()));
                }
                toks.push(Tok::Str(src[start..j].to_string()));
                i = j + 1;
            }
            b'0'..=b'9' => {
                let start = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let n: i64 = src[start..i]
                    .parse()
                    .map_err(|_| Error::Parse(format!("bad number \"{}\"", &src[start..i])))?;
                toks.push(Tok::Num(n));
            }
            _ if is_ident_char(c) => {
                let start = i;
                while i < bytes.len() && is_ident_char(bytes[i]) {
                    i += 1;
                }
                toks.push(Tok::Ident(src[start..i].to_string()));
            }
            _ => {
                return Err(Error::Parse(format!(
                    "unexpected character '{}'",
                    c as char
                )))
            }
        }
    }
    Ok(toks)
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'_' | b'-' | b'.' | b'/' | b':' | b'*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_parse_single_eq() {
        let expr = parse_source_expr("name=app").unwrap();
        assert_eq!(expr, TagExpr::Eq("name".to_string(), "app".to_string()));
    }

    #[test]
    fn test_parse_and_or_precedence() {
        // a=1 and b=2 or c=3  ==  (a=1 and b=2) or c=3
        let expr = parse_source_expr("a=1 and b=2 or c=3").unwrap();
        let mut matching = TagSet::new();
        matching.set("c", "3");
        assert!(expr.matches(&matching));

        let mut partial = TagSet::new();
        partial.set("a", "1");
        assert!(!expr.matches(&partial));
    }

    #[test]
    fn test_parse_parens() {
        // a=1 and (b=2 or c=3)
        let expr = parse_source_expr("a=1 and (b=2 or c=3)").unwrap();
        let mut tags = TagSet::new();
        tags.set("a", "1").set("c", "3");
        assert!(expr.matches(&tags));

        let mut tags = TagSet::new();
        tags.set("b", "2");
        assert!(!expr.matches(&tags));
    }

    #[test]
    fn test_parse_source_rejects_junk() {
        assert!(parse_source_expr("").is_err());
        assert!(parse_source_expr("name=").is_err());
        assert!(parse_source_expr("name=a extra=").is_err());
        assert!(parse_source_expr("name=a and").is_err());
        assert!(parse_source_expr("(name=a").is_err());
    }

    #[test]
    fn test_parse_where_empty_matches_all() {
        let w = parse_where("").unwrap();
        assert_eq!(w, WhereExpr::All);
        assert!(w.matches(&LogEvent::new(0, "anything")));
    }

    #[test]
    fn test_where_msg_contains() {
        let w = parse_where(r#"msg contains "err""#).unwrap();
        assert!(w.matches(&LogEvent::new(0, "an error happened")));
        assert!(!w.matches(&LogEvent::new(0, "all good")));
    }

    #[test]
    fn test_where_msg_contains_binary_safe() {
        let w = parse_where(r#"msg contains "x""#).unwrap();
        let ev = LogEvent::new(0, Bytes::from(vec![0u8, b'x', 255u8]));
        assert!(w.matches(&ev));
    }

    #[test]
    fn test_where_msg_prefix() {
        let w = parse_where(r#"msg prefix "WARN""#).unwrap();
        assert!(w.matches(&LogEvent::new(0, "WARN disk full")));
        assert!(!w.matches(&LogEvent::new(0, "INFO WARN-adjacent")));
    }

    #[test]
    fn test_where_ts_comparisons() {
        let w = parse_where("ts >= 10 and ts < 20").unwrap();
        assert!(w.matches(&LogEvent::new(10, "m")));
        assert!(w.matches(&LogEvent::new(19, "m")));
        assert!(!w.matches(&LogEvent::new(9, "m")));
        assert!(!w.matches(&LogEvent::new(20, "m")));
    }

    #[test]
    fn test_where_or() {
        let w = parse_where(r#"msg contains "a" or msg contains "b""#).unwrap();
        assert!(w.matches(&LogEvent::new(0, "xxbxx")));
        assert!(!w.matches(&LogEvent::new(0, "xxcxx")));
    }

    #[test]
    fn test_where_rejects_junk() {
        assert!(parse_where("msg").is_err());
        assert!(parse_where("msg contains").is_err());
        assert!(parse_where("msg contains x").is_err());
        assert!(parse_where("ts !! 5").is_err());
        assert!(parse_where("fields = 1").is_err());
    }

    #[test]
    fn test_split_query_basic() {
        let (src, wh) = split_query(r#"name=app where msg contains "x""#);
        assert_eq!(src, "name=app");
        assert_eq!(wh, r#"msg contains "x""#);
    }

    #[test]
    fn test_split_query_no_where() {
        let (src, wh) = split_query("name=app and pod=p1");
        assert_eq!(src, "name=app and pod=p1");
        assert_eq!(wh, "");
    }

    #[test]
    fn test_split_query_where_inside_quotes() {
        let (src, wh) = split_query(r#"name=app where msg contains "where are you""#);
        assert_eq!(src, "name=app");
        assert_eq!(wh, r#"msg contains "where are you""#);
    }

    #[test]
    fn test_split_query_case_insensitive() {
        let (src, wh) = split_query("name=app WHERE ts >= 5");
        assert_eq!(src, "name=app");
        assert_eq!(wh, "ts >= 5");
    }

    #[test]
    fn test_ident_chars_in_values() {
        let expr = parse_source_expr("pod=api-7d9f/main").unwrap();
        let mut tags = TagSet::new();
        tags.set("pod", "api-7d9f/main");
        assert!(expr.matches(&tags));
    }
}
