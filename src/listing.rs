//! A lifter from textual register-transfer listings.
//!
//! A listing describes one function, one instruction per line:
//!
//! ```text
//! ARCH x86
//! ENTRY 0x1000
//! 0x1000: esp = esp - 4
//! 0x1001: [esp] = ebp
//! 0x1004: if eax == 0 goto 0x1010
//! 0x1006: eax = call 0x2000(eax, 4)
//! 0x1008: goto 0x1010
//! 0x1010: return eax
//! ```
//!
//! Blank lines and anything after a `#` are ignored. `ARCH` and `ENTRY` are optional; the entry
//! defaults to the lowest instruction address.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::ir::{BinOp, UnOp};
use crate::log::*;

/// An operand of a decoded instruction. Unlike the [IR](crate::ir), this is a plain owned tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    Register(String),
    Value(i64),
    Deref(Box<Operand>),
    Address(Box<Operand>),
    Binary(BinOp, Box<Operand>, Box<Operand>),
    Unary(UnOp, Box<Operand>),
    Call(Box<Operand>, Vec<Operand>),
}

impl Operand {
    pub fn is_assignable(&self) -> bool {
        matches!(self, Operand::Register(_) | Operand::Deref(_))
    }
}

/// What a decoded instruction does
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsnKind {
    /// `lhs = rhs`
    Assign(Operand, Operand),
    /// A call whose result is discarded
    Call(Operand),
    /// `goto target`
    Goto(u64),
    /// `if cond goto target`; falls through otherwise
    Branch(Operand, u64),
    /// `return [value]`
    Return(Option<Operand>),
}

/// A decoded instruction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Insn {
    pub address: u64,
    /// Line of the listing this was decoded from (1-based)
    pub line: usize,
    pub kind: InsnKind,
}

impl Insn {
    /// Addresses this instruction may branch to, not including fallthrough
    pub fn branch_targets(&self) -> Vec<u64> {
        match &self.kind {
            InsnKind::Goto(t) | InsnKind::Branch(_, t) => vec![*t],
            _ => vec![],
        }
    }

    /// Whether execution may continue with the next instruction
    pub fn falls_through(&self) -> bool {
        !matches!(self.kind, InsnKind::Goto(_) | InsnKind::Return(_))
    }

    /// Whether this instruction ends a basic block
    pub fn ends_block(&self) -> bool {
        matches!(
            self.kind,
            InsnKind::Goto(_) | InsnKind::Branch(..) | InsnKind::Return(_)
        )
    }
}

/// Instruction decoding service
pub trait Disassembler {
    /// The instruction at `ea`, if one exists there
    fn decode(&self, ea: u64) -> Option<&Insn>;
    /// Address of the instruction immediately following the one at `ea`
    fn next_address(&self, ea: u64) -> Option<u64>;
}

/// A parsed listing
#[derive(Clone, Debug, Default)]
pub struct Listing {
    /// Architecture named by the `ARCH` directive
    pub arch: Option<String>,
    /// Entry point named by the `ENTRY` directive
    pub entry: Option<u64>,
    insns: BTreeMap<u64, Insn>,
}

impl Disassembler for Listing {
    fn decode(&self, ea: u64) -> Option<&Insn> {
        self.insns.get(&ea)
    }

    fn next_address(&self, ea: u64) -> Option<u64> {
        use std::ops::Bound::{Excluded, Unbounded};
        self.insns
            .range((Excluded(ea), Unbounded))
            .next()
            .map(|(&a, _)| a)
    }
}

impl Listing {
    /// Parse the text of a listing
    pub fn parse(text: &str) -> Result<Self> {
        let mut r = Self::default();
        for (i, line) in text.lines().enumerate() {
            let lineno = i + 1;
            let line = match line.split_once('#') {
                Some((l, _comment)) => l,
                None => line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            if let Some(arch) = line.strip_prefix("ARCH ") {
                r.arch = Some(arch.trim().to_owned());
            } else if let Some(entry) = line.strip_prefix("ENTRY ") {
                r.entry = Some(
                    parse_address(entry.trim())
                        .ok_or_else(|| listing_error!(lineno, "Bad entry address `{}`", entry))?,
                );
            } else {
                let (addr, body) = line
                    .split_once(':')
                    .ok_or_else(|| listing_error!(lineno, "Expected `ADDRESS: statement`"))?;
                let address = parse_address(addr.trim())
                    .ok_or_else(|| listing_error!(lineno, "Bad instruction address `{}`", addr))?;
                let kind = Parser::new(body, lineno)?.statement()?;
                trace!("Decoded instruction"; "address" => format_args!("{:#x}", address), "kind" => ?kind);
                let prev = r.insns.insert(
                    address,
                    Insn {
                        address,
                        line: lineno,
                        kind,
                    },
                );
                if prev.is_some() {
                    return Err(listing_error!(
                        lineno,
                        "Duplicate instruction at {:#x}",
                        address
                    ));
                }
            }
        }
        if r.insns.is_empty() {
            return Err(listing_error!(0, "Listing has no instructions"));
        }
        debug!("Parsed listing"; "instructions" => r.insns.len(), "arch" => ?r.arch);
        Ok(r)
    }

    /// The entry point: the `ENTRY` directive if present, else the lowest address
    pub fn entry_point(&self) -> Option<u64> {
        self.entry.or_else(|| self.insns.keys().next().cloned())
    }

    /// All instructions, in address order
    pub fn instructions(&self) -> impl Iterator<Item = &Insn> {
        self.insns.values()
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal address
pub fn parse_address(s: &str) -> Option<u64> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Ident(String),
    Int(i64),
    Sym(&'static str),
}

const SYMBOLS: &[&str] = &[
    "<<", ">>", "==", "!=", "<=", ">=", "[", "]", "(", ")", ",", "&", "+", "-", "*", "|", "^", "<",
    ">", "!", "=",
];

fn tokenize(s: &str, line: usize) -> Result<Vec<Token>> {
    let mut toks = vec![];
    let mut rest = s.trim_start();
    while !rest.is_empty() {
        let c = rest.chars().next().unwrap_or(' ');
        if c.is_ascii_digit() {
            let end = rest
                .find(|c: char| !c.is_ascii_alphanumeric())
                .unwrap_or(rest.len());
            let (num, tail) = rest.split_at(end);
            let v = parse_address(num)
                .ok_or_else(|| listing_error!(line, "Bad integer literal `{}`", num))?;
            toks.push(Token::Int(v as i64));
            rest = tail;
        } else if c.is_ascii_alphabetic() || c == '_' {
            let end = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
                .unwrap_or(rest.len());
            let (ident, tail) = rest.split_at(end);
            toks.push(Token::Ident(ident.to_owned()));
            rest = tail;
        } else if let Some(sym) = SYMBOLS.iter().find(|sym| rest.starts_with(*sym)) {
            toks.push(Token::Sym(sym));
            rest = &rest[sym.len()..];
        } else {
            return Err(listing_error!(line, "Unexpected character `{}`", c));
        }
        rest = rest.trim_start();
    }
    Ok(toks)
}

/// Recursive-descent parser over the tokens of one statement
struct Parser {
    toks: Vec<Token>,
    pos: usize,
    line: usize,
}

impl Parser {
    fn new(s: &str, line: usize) -> Result<Self> {
        Ok(Self {
            toks: tokenize(s, line)?,
            pos: 0,
            line,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.toks.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Some(Token::Sym(s)) if *s == sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(i)) if i == kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: &str) -> Result<()> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(listing_error!(
                self.line,
                "Expected `{}`, found {:?}",
                sym,
                self.peek()
            ))
        }
    }

    fn expect_end(&self) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(t) => Err(listing_error!(self.line, "Unexpected trailing {:?}", t)),
        }
    }

    fn target_address(&mut self) -> Result<u64> {
        match self.next() {
            Some(Token::Int(v)) if v >= 0 => Ok(v as u64),
            t => Err(listing_error!(
                self.line,
                "Expected branch target address, found {:?}",
                t
            )),
        }
    }

    fn statement(&mut self) -> Result<InsnKind> {
        let kind = if self.eat_keyword("goto") {
            InsnKind::Goto(self.target_address()?)
        } else if self.eat_keyword("if") {
            let cond = self.expr(0)?;
            if !self.eat_keyword("goto") {
                return Err(listing_error!(self.line, "Expected `goto` after condition"));
            }
            InsnKind::Branch(cond, self.target_address()?)
        } else if self.eat_keyword("return") {
            if self.peek().is_none() {
                InsnKind::Return(None)
            } else {
                InsnKind::Return(Some(self.expr(0)?))
            }
        } else {
            let lhs = self.expr(0)?;
            if self.eat_sym("=") {
                if !lhs.is_assignable() {
                    return Err(listing_error!(
                        self.line,
                        "Left-hand side {:?} is not assignable",
                        lhs
                    ));
                }
                InsnKind::Assign(lhs, self.expr(0)?)
            } else if let Operand::Call(..) = lhs {
                InsnKind::Call(lhs)
            } else {
                return Err(listing_error!(
                    self.line,
                    "Expected an assignment, a branch, a call, or a return"
                ));
            }
        };
        self.expect_end()?;
        Ok(kind)
    }

    /// Binary operator at the current position, with its precedence and whether its operands are
    /// swapped (`a > b` is `b < a`).
    fn binop(&self) -> Option<(BinOp, u8, bool)> {
        let (op, swapped) = match self.peek()? {
            Token::Sym("+") => (BinOp::Add, false),
            Token::Sym("-") => (BinOp::Sub, false),
            Token::Sym("*") => (BinOp::Mul, false),
            Token::Sym("&") => (BinOp::And, false),
            Token::Sym("|") => (BinOp::Or, false),
            Token::Sym("^") => (BinOp::Xor, false),
            Token::Sym("<<") => (BinOp::Shl, false),
            Token::Sym(">>") => (BinOp::Shr, false),
            Token::Sym("==") => (BinOp::Eq, false),
            Token::Sym("!=") => (BinOp::Ne, false),
            Token::Sym("<") => (BinOp::Lt, false),
            Token::Sym("<=") => (BinOp::Le, false),
            Token::Sym(">") => (BinOp::Lt, true),
            Token::Sym(">=") => (BinOp::Le, true),
            _ => return None,
        };
        Some((op, op.precedence(), swapped))
    }

    /// Precedence climbing; only operators binding tighter than `min_prec` are consumed.
    fn expr(&mut self, min_prec: u8) -> Result<Operand> {
        let mut lhs = self.unary()?;
        while let Some((op, prec, swapped)) = self.binop() {
            if prec <= min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.expr(prec)?;
            lhs = if swapped {
                Operand::Binary(op, Box::new(rhs), Box::new(lhs))
            } else {
                Operand::Binary(op, Box::new(lhs), Box::new(rhs))
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Operand> {
        if self.eat_sym("-") {
            return Ok(match self.unary()? {
                Operand::Value(v) => Operand::Value(v.wrapping_neg()),
                e => Operand::Unary(UnOp::Neg, Box::new(e)),
            });
        }
        if self.eat_sym("!") {
            return Ok(Operand::Unary(UnOp::Not, Box::new(self.unary()?)));
        }
        if self.eat_sym("&") {
            return Ok(Operand::Address(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Operand> {
        match self.next() {
            Some(Token::Int(v)) => Ok(Operand::Value(v)),
            Some(Token::Ident(i)) if i == "call" => {
                let target = self.primary()?;
                self.expect_sym("(")?;
                let mut args = vec![];
                if !self.eat_sym(")") {
                    loop {
                        args.push(self.expr(0)?);
                        if self.eat_sym(")") {
                            break;
                        }
                        self.expect_sym(",")?;
                    }
                }
                Ok(Operand::Call(Box::new(target), args))
            }
            Some(Token::Ident(i)) if ["goto", "if", "return"].contains(&i.as_str()) => Err(
                listing_error!(self.line, "Unexpected keyword `{}` in expression", i),
            ),
            Some(Token::Ident(i)) => Ok(Operand::Register(i)),
            Some(Token::Sym("[")) => {
                let inner = self.expr(0)?;
                self.expect_sym("]")?;
                Ok(Operand::Deref(Box::new(inner)))
            }
            Some(Token::Sym("(")) => {
                let inner = self.expr(0)?;
                self.expect_sym(")")?;
                Ok(inner)
            }
            t => Err(listing_error!(
                self.line,
                "Expected an operand, found {:?}",
                t
            )),
        }
    }
}
