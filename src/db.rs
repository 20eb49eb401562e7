//! The trace database stores, for each target, the digest of the rule
//! configuration that last built it. It lives at `_build/.db` as a single
//! S-expression of (path digest) pairs and is what makes builds
//! incremental across runs.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, bail, Context};

use crate::hash::Digest;
use crate::path::BuildPath;

/// Where the trace lives, under the build tree.
pub const DB_PATH: &str = "_build/.db";

/// Map from target path to the digest it was last built with.
///
/// Keys are kept sorted so dumping is deterministic and a load/dump
/// round trip is byte-identical.
#[derive(Default)]
pub struct Trace {
    entries: BTreeMap<BuildPath, Digest>,
}

impl Trace {
    pub fn new() -> Trace {
        Trace::default()
    }

    pub fn get(&self, path: &BuildPath) -> Option<&Digest> {
        self.entries.get(path)
    }

    pub fn set(&mut self, path: BuildPath, digest: Digest) {
        self.entries.insert(path, digest);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Loads the trace; a missing file is an empty trace.
    pub fn load(path: &Path) -> anyhow::Result<Trace> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Trace::new());
            }
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        parse(&text).with_context(|| format!("parse trace db {}", path.display()))
    }

    pub fn dump(&self, path: &Path) -> anyhow::Result<()> {
        let file =
            File::create(path).with_context(|| format!("create {}", path.display()))?;
        let mut w = BufWriter::new(file);
        writeln!(w, "(")?;
        for (target, digest) in &self.entries {
            writeln!(
                w,
                " ({} {})",
                quote_atom(&target.to_string()),
                quote_atom(digest.as_hex())
            )?;
        }
        writeln!(w, ")")?;
        w.flush()?;
        Ok(())
    }
}

/// Quotes a string as an S-expression atom.
pub(crate) fn quote_atom(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn path_of_atom(atom: &str) -> BuildPath {
    if Path::new(atom).is_absolute() {
        BuildPath::external(atom)
    } else {
        BuildPath::local(atom)
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    LParen,
    RParen,
    Atom(String),
}

struct Scanner<'a> {
    rest: std::str::Chars<'a>,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Scanner<'a> {
        Scanner { rest: text.chars() }
    }

    fn next_token(&mut self) -> anyhow::Result<Option<Token>> {
        loop {
            let c = match self.rest.next() {
                None => return Ok(None),
                Some(c) => c,
            };
            match c {
                c if c.is_whitespace() => continue,
                '(' => return Ok(Some(Token::LParen)),
                ')' => return Ok(Some(Token::RParen)),
                '"' => return Ok(Some(Token::Atom(self.quoted_atom()?))),
                c => bail!("unexpected character {:?}", c),
            }
        }
    }

    fn quoted_atom(&mut self) -> anyhow::Result<String> {
        let mut atom = String::new();
        loop {
            match self.rest.next() {
                None => bail!("unterminated string"),
                Some('"') => return Ok(atom),
                Some('\\') => match self.rest.next() {
                    Some('n') => atom.push('\n'),
                    Some(c @ ('"' | '\\')) => atom.push(c),
                    other => bail!("bad escape {:?}", other),
                },
                Some(c) => atom.push(c),
            }
        }
    }

    fn expect(&mut self, want: Token) -> anyhow::Result<()> {
        match self.next_token()? {
            Some(tok) if tok == want => Ok(()),
            other => bail!("expected {:?}, got {:?}", want, other),
        }
    }

    fn expect_atom(&mut self) -> anyhow::Result<String> {
        match self.next_token()? {
            Some(Token::Atom(a)) => Ok(a),
            other => bail!("expected atom, got {:?}", other),
        }
    }
}

fn parse(text: &str) -> anyhow::Result<Trace> {
    let mut scanner = Scanner::new(text);
    let mut trace = Trace::new();
    scanner.expect(Token::LParen)?;
    loop {
        match scanner.next_token()? {
            Some(Token::RParen) => break,
            Some(Token::LParen) => {
                let target = scanner.expect_atom()?;
                let digest = scanner.expect_atom()?;
                scanner.expect(Token::RParen)?;
                trace.set(path_of_atom(&target), Digest::from_hex(digest));
            }
            other => bail!("expected pair, got {:?}", other),
        }
    }
    match scanner.next_token()? {
        None => Ok(trace),
        Some(tok) => Err(anyhow!("trailing {:?} after trace", tok)),
    }
}
