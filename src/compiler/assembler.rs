//! Text assembler
//!
//! Turns `.hhas`-style assembly into a `Unit`. This is the bytecode
//! producer for the CLI, the test-suite and the prelude.
//!
//! ```text
//! .function f($a, $b = DV1, &$c) {
//!   CGetL $a
//!   Int 1
//!   Add
//!   RetC
//! DV1:
//!   Int 2
//!   SetL $b
//!   PopC
//!   Jmp L0
//! }
//!
//! .function [conditional] g(?array $xs, Countable $c) { ... }
//!
//! .class B extends A implements ArrayAccess {
//!   .const LIMIT = 10;
//!   .property [protected] x = 1;
//!   .static [public] count = 0;
//!   .method [private static] m() { Null; RetC }
//! }
//!
//! .main {
//!   .try {
//!     FPushFuncD 1 "f"
//!     FPassC 0
//!     FCall 1
//!     PopR
//!   } .catch (Exception H)
//!   ...
//! }
//! ```
//!
//! Instructions are separated by newlines or `;`. Immediates follow the
//! opcode's immediate list: integers, doubles, `"strings"`, `$locals`,
//! labels, sub-op names (`PlusEqual`, `PreInc`, `Null`...), array
//! literals `[1, "k" => [2]]`, member vectors `<L:$x ET:"k" PC W>` and
//! switch tables `<L0 L1 Ldefault> 0 bounded`.

use crate::compiler::emitter::{ClassEmitter, FuncEmitter, UnitEmitter};
use crate::runtime::class::{ClassAttrs, PreClass, PreProp};
use crate::runtime::unit::{StaticValue, TypeConstraint, Unit, Visibility};
use crate::vm::engine::VmError;
use crate::vm::opcode::{
    ImmType, IncDecOp, IsTypeOp, LocationCode, MemberCode, MemberImm, MemberVector, Op, SetOpOp,
};
use memchr::memchr;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Directive(String),
    Var(String),
    Str(Vec<u8>),
    Int(i64),
    Double(f64),
    Punct(char),
    Arrow,
    Newline,
    Eof,
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'\\'
}

impl<'a> Lexer<'a> {
    fn tokenize(src: &'a str, file: &str) -> Result<Vec<(Tok, u32)>, VmError> {
        let mut lx = Lexer {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
        };
        let mut out = Vec::new();
        loop {
            let tok = lx.next(file)?;
            let line = lx.line;
            let done = tok == Tok::Eof;
            // a newline token belongs to the line it ends
            let line = if tok == Tok::Newline { line - 1 } else { line };
            out.push((tok, line));
            if done {
                return Ok(out);
            }
        }
    }

    fn err(&self, file: &str, msg: &str) -> VmError {
        VmError::load(format!("{}:{}: {}", file, self.line, msg))
    }

    fn peek_byte(&self, off: usize) -> Option<u8> {
        self.src.get(self.pos + off).copied()
    }

    fn next(&mut self, file: &str) -> Result<Tok, VmError> {
        loop {
            match self.peek_byte(0) {
                None => return Ok(Tok::Eof),
                Some(b'\n') => {
                    self.pos += 1;
                    self.line += 1;
                    return Ok(Tok::Newline);
                }
                Some(b) if b.is_ascii_whitespace() => self.pos += 1,
                Some(b'#') => self.skip_comment(),
                Some(b'/') if self.peek_byte(1) == Some(b'/') => self.skip_comment(),
                Some(_) => break,
            }
        }
        let b = self.src[self.pos];
        match b {
            b'"' => self.string(file),
            b'$' => {
                self.pos += 1;
                let name = self.ident_text();
                if name.is_empty() {
                    return Err(self.err(file, "expected variable name after '$'"));
                }
                Ok(Tok::Var(name))
            }
            b'.' if self.peek_byte(1).is_some_and(|c| c.is_ascii_alphabetic()) => {
                self.pos += 1;
                Ok(Tok::Directive(self.ident_text()))
            }
            b'=' if self.peek_byte(1) == Some(b'>') => {
                self.pos += 2;
                Ok(Tok::Arrow)
            }
            b'-' | b'0'..=b'9' => {
                if b == b'-' && !self.peek_byte(1).is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                    return Ok(Tok::Punct('-'));
                }
                self.number(file)
            }
            _ if is_ident_byte(b) => Ok(Tok::Ident(self.ident_text())),
            _ => {
                self.pos += 1;
                Ok(Tok::Punct(b as char))
            }
        }
    }

    fn skip_comment(&mut self) {
        let rest = &self.src[self.pos..];
        self.pos += memchr(b'\n', rest).unwrap_or(rest.len());
    }

    fn ident_text(&mut self) -> String {
        let start = self.pos;
        while self.peek_byte(0).is_some_and(is_ident_byte) {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.src[start..self.pos]).into_owned()
    }

    fn number(&mut self, file: &str) -> Result<Tok, VmError> {
        let start = self.pos;
        if self.peek_byte(0) == Some(b'-') {
            self.pos += 1;
        }
        let mut is_double = false;
        while let Some(b) = self.peek_byte(0) {
            match b {
                b'0'..=b'9' => self.pos += 1,
                b'.' | b'e' | b'E' => {
                    is_double = true;
                    self.pos += 1;
                }
                b'+' | b'-' if matches!(self.src[self.pos - 1], b'e' | b'E') => self.pos += 1,
                _ => break,
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or_default();
        if is_double {
            text.parse::<f64>()
                .map(Tok::Double)
                .map_err(|_| self.err(file, &format!("bad number {}", text)))
        } else {
            text.parse::<i64>()
                .map(Tok::Int)
                .map_err(|_| self.err(file, &format!("bad number {}", text)))
        }
    }

    fn string(&mut self, file: &str) -> Result<Tok, VmError> {
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            let b = self
                .peek_byte(0)
                .ok_or_else(|| self.err(file, "unterminated string literal"))?;
            self.pos += 1;
            match b {
                b'"' => return Ok(Tok::Str(out)),
                b'\n' => {
                    self.line += 1;
                    out.push(b);
                }
                b'\\' => {
                    let esc = self
                        .peek_byte(0)
                        .ok_or_else(|| self.err(file, "unterminated string literal"))?;
                    self.pos += 1;
                    match esc {
                        b'n' => out.push(b'\n'),
                        b'r' => out.push(b'\r'),
                        b't' => out.push(b'\t'),
                        b'0' => out.push(0),
                        b'\\' => out.push(b'\\'),
                        b'"' => out.push(b'"'),
                        b'x' => {
                            let hex = self
                                .src
                                .get(self.pos..self.pos + 2)
                                .and_then(|h| std::str::from_utf8(h).ok())
                                .and_then(|h| u8::from_str_radix(h, 16).ok())
                                .ok_or_else(|| self.err(file, "bad \\x escape"))?;
                            self.pos += 2;
                            out.push(hex);
                        }
                        other => {
                            out.push(b'\\');
                            out.push(other);
                        }
                    }
                }
                _ => out.push(b),
            }
        }
    }
}

struct Assembler<'a> {
    toks: Vec<(Tok, u32)>,
    pos: usize,
    file: &'a str,
    ue: UnitEmitter,
}

/// Assemble `source` into a unit named `filepath`
pub fn assemble(source: &str, filepath: &str) -> Result<Unit, VmError> {
    let span = tracing::debug_span!("assemble", file = filepath);
    let _guard = span.enter();
    let toks = Lexer::tokenize(source, filepath)?;
    let mut asm = Assembler {
        toks,
        pos: 0,
        file: filepath,
        ue: UnitEmitter::new(filepath),
    };
    asm.unit()?;
    let unit = asm.ue.finish()?;
    debug!(
        funcs = unit.funcs.len(),
        classes = unit.classes.len(),
        "unit assembled"
    );
    Ok(unit)
}

impl<'a> Assembler<'a> {
    fn peek(&self) -> &Tok {
        self.toks.get(self.pos).map(|(t, _)| t).unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> u32 {
        self.toks.get(self.pos).map(|(_, l)| *l).unwrap_or(0)
    }

    fn bump(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.toks.len() {
            self.pos += 1;
        }
        tok
    }

    fn err(&self, msg: impl std::fmt::Display) -> VmError {
        VmError::load(format!("{}:{}: {}", self.file, self.line(), msg))
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Tok::Newline | Tok::Punct(';')) {
            self.pos += 1;
        }
    }

    fn expect_punct(&mut self, c: char) -> Result<(), VmError> {
        match self.bump() {
            Tok::Punct(p) if p == c => Ok(()),
            other => Err(self.err(format!("expected '{}', found {:?}", c, other))),
        }
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if *self.peek() == Tok::Punct(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> Result<String, VmError> {
        match self.bump() {
            Tok::Ident(s) => Ok(s),
            other => Err(self.err(format!("expected identifier, found {:?}", other))),
        }
    }

    fn unit(&mut self) -> Result<(), VmError> {
        loop {
            self.skip_newlines();
            match self.bump() {
                Tok::Eof => return Ok(()),
                Tok::Directive(d) => match d.as_str() {
                    "main" => {
                        if self.ue.main.is_some() {
                            return Err(self.err("duplicate .main"));
                        }
                        let mut fe = FuncEmitter::new("", None);
                        fe.is_pseudo_main = true;
                        self.body(&mut fe)?;
                        self.ue.main = Some(fe);
                    }
                    "function" => {
                        let fe = self.function(None)?;
                        self.ue.funcs.push(fe);
                    }
                    "class" => self.class()?,
                    other => return Err(self.err(format!("unknown directive .{}", other))),
                },
                other => return Err(self.err(format!("unexpected {:?} at top level", other))),
            }
        }
    }

    fn attrs(&mut self) -> Result<Vec<String>, VmError> {
        let mut out = Vec::new();
        if self.eat_punct('[') {
            while !self.eat_punct(']') {
                out.push(self.ident()?);
            }
        }
        Ok(out)
    }

    fn visibility(attrs: &[String]) -> Visibility {
        if attrs.iter().any(|a| a == "private") {
            Visibility::Private
        } else if attrs.iter().any(|a| a == "protected") {
            Visibility::Protected
        } else {
            Visibility::Public
        }
    }

    fn class(&mut self) -> Result<(), VmError> {
        let attrs = self.attrs()?;
        let name: Arc<str> = Arc::from(self.ident()?);
        let mut parent = None;
        let mut interfaces = Vec::new();
        loop {
            match self.peek().clone() {
                Tok::Ident(kw) if kw == "extends" => {
                    self.pos += 1;
                    parent = Some(Arc::from(self.ident()?));
                }
                Tok::Ident(kw) if kw == "implements" => {
                    self.pos += 1;
                    interfaces.push(Arc::from(self.ident()?));
                    while self.eat_punct(',') {
                        interfaces.push(Arc::from(self.ident()?));
                    }
                }
                _ => break,
            }
        }
        let mut ce = ClassEmitter {
            pre: PreClass {
                name: name.clone(),
                parent,
                interfaces,
                attrs: ClassAttrs {
                    is_interface: attrs.iter().any(|a| a == "interface"),
                    is_abstract: attrs.iter().any(|a| a == "abstract"),
                    is_trait: attrs.iter().any(|a| a == "trait"),
                    is_conditional: attrs.iter().any(|a| a == "conditional"),
                },
                methods: Vec::new(),
                props: Vec::new(),
                constants: Vec::new(),
            },
            methods: Vec::new(),
        };
        self.skip_newlines();
        self.expect_punct('{')?;
        loop {
            self.skip_newlines();
            match self.bump() {
                Tok::Punct('}') => break,
                Tok::Directive(d) if d == "method" => {
                    let fe = self.function(Some(name.clone()))?;
                    ce.methods.push(fe);
                }
                Tok::Directive(d) if d == "property" || d == "static" => {
                    let attrs = self.attrs()?;
                    let prop_name = self.ident()?;
                    let default_value = if self.eat_punct('=') {
                        self.static_value()?
                    } else {
                        StaticValue::Null
                    };
                    ce.pre.props.push(PreProp {
                        name: Arc::from(prop_name),
                        visibility: Self::visibility(&attrs),
                        is_static: d == "static",
                        default_value,
                    });
                }
                Tok::Directive(d) if d == "const" => {
                    let cns_name = self.ident()?;
                    self.expect_punct('=')?;
                    let value = self.static_value()?;
                    if ce.pre.constants.iter().any(|(n, _)| n.as_ref() == cns_name) {
                        return Err(self.err(format!("duplicate constant {}::{}", name, cns_name)));
                    }
                    ce.pre.constants.push((Arc::from(cns_name), value));
                }
                other => return Err(self.err(format!("unexpected {:?} in class {}", other, name))),
            }
        }
        self.ue.classes.push(ce);
        Ok(())
    }

    fn function(&mut self, cls: Option<Arc<str>>) -> Result<FuncEmitter, VmError> {
        let attrs = self.attrs()?;
        let name = self.ident()?;
        let mut fe = FuncEmitter::new(name, cls);
        fe.attrs.visibility = Self::visibility(&attrs);
        fe.attrs.is_static = attrs.iter().any(|a| a == "static");
        fe.attrs.is_abstract = attrs.iter().any(|a| a == "abstract");
        fe.attrs.is_conditional = attrs.iter().any(|a| a == "conditional");
        self.expect_punct('(')?;
        while !self.eat_punct(')') {
            let type_constraint = self.type_constraint()?;
            let by_ref = self.eat_punct('&');
            let pname = match self.bump() {
                Tok::Var(v) => v,
                other => return Err(self.err(format!("expected parameter, found {:?}", other))),
            };
            let dv = if self.eat_punct('=') {
                Some(self.ident()?)
            } else {
                None
            };
            fe.add_param(&pname, by_ref, dv, type_constraint)
                .map_err(|e| self.err(e))?;
            self.eat_punct(',');
        }
        self.skip_newlines();
        self.body(&mut fe)?;
        Ok(fe)
    }

    /// Optional `?Type` ahead of a parameter
    fn type_constraint(&mut self) -> Result<Option<TypeConstraint>, VmError> {
        let nullable = self.eat_punct('?');
        match self.peek().clone() {
            Tok::Ident(name) => {
                self.pos += 1;
                Ok(Some(TypeConstraint {
                    name: Arc::from(name),
                    nullable,
                }))
            }
            _ if nullable => Err(self.err("expected type name after '?'")),
            _ => Ok(None),
        }
    }

    fn body(&mut self, fe: &mut FuncEmitter) -> Result<(), VmError> {
        self.skip_newlines();
        self.expect_punct('{')?;
        self.statements(fe)
    }

    /// Statements up to and including the closing brace
    fn statements(&mut self, fe: &mut FuncEmitter) -> Result<(), VmError> {
        loop {
            self.skip_newlines();
            let line = self.line();
            match self.bump() {
                Tok::Punct('}') => return Ok(()),
                Tok::Eof => return Err(self.err("unexpected end of file in body")),
                Tok::Directive(d) if d == "try" => {
                    let region = fe.open_try();
                    self.body(fe)?;
                    fe.close_region(region);
                    self.skip_newlines();
                    match self.bump() {
                        Tok::Directive(c) if c == "catch" => {}
                        other => return Err(self.err(format!("expected .catch, found {:?}", other))),
                    }
                    while self.eat_punct('(') {
                        let cls = self.ident()?;
                        let label = self.ident()?;
                        self.expect_punct(')')?;
                        fe.add_catch(region, &cls, &label);
                    }
                }
                Tok::Directive(d) if d == "try_fault" => {
                    let label = self.ident()?;
                    let region = fe.open_fault(&label);
                    self.body(fe)?;
                    fe.close_region(region);
                }
                Tok::Ident(name) => {
                    if self.eat_punct(':') {
                        fe.define_label(&name).map_err(|e| self.err(e))?;
                        continue;
                    }
                    let op = Op::from_name(&name)
                        .ok_or_else(|| self.err(format!("unknown instruction {}", name)))?;
                    self.instruction(fe, op, line)?;
                }
                other => return Err(self.err(format!("unexpected {:?} in body", other))),
            }
        }
    }

    fn instruction(&mut self, fe: &mut FuncEmitter, op: Op, line: u32) -> Result<(), VmError> {
        let start = fe.begin(op, line);
        for ty in op.immediates() {
            match ty {
                ImmType::IVA => {
                    let n = self.int()?;
                    fe.emit_iva(n as u32);
                }
                ImmType::IA => {
                    let n = self.int()? as u32;
                    fe.note_iterator(n);
                    fe.emit_iva(n);
                }
                ImmType::HA => {
                    let id = self.local(fe)?;
                    fe.emit_iva(id);
                }
                ImmType::I64A => {
                    let n = self.int()?;
                    fe.emit_i64(n);
                }
                ImmType::DA => {
                    let d = match self.bump() {
                        Tok::Double(d) => d,
                        Tok::Int(i) => i as f64,
                        Tok::Ident(s) if s == "INF" => f64::INFINITY,
                        Tok::Ident(s) if s == "NAN" => f64::NAN,
                        other => return Err(self.err(format!("expected double, found {:?}", other))),
                    };
                    fe.emit_f64(d);
                }
                ImmType::SA => {
                    let s = self.string()?;
                    let id = self.ue.merge_litstr(&s);
                    fe.emit_u32(id);
                }
                ImmType::AA => {
                    let value = self.static_value()?;
                    let id = self.ue.merge_array(value);
                    fe.emit_u32(id);
                }
                ImmType::BA => {
                    let label = self.ident()?;
                    fe.emit_branch(&label, start);
                }
                ImmType::OA => {
                    let name = self.ident()?;
                    let sub = match op {
                        Op::IsTypeL | Op::IsTypeC => IsTypeOp::from_name(&name).map(|o| o as u8),
                        Op::IncDecL | Op::IncDecN | Op::IncDecG | Op::IncDecS | Op::IncDecM => {
                            IncDecOp::from_name(&name).map(|o| o as u8)
                        }
                        _ => SetOpOp::from_name(&name).map(|o| o as u8),
                    };
                    let sub = sub.ok_or_else(|| self.err(format!("bad sub-op {} for {}", name, op.name())))?;
                    fe.emit_u8(sub);
                }
                ImmType::MA => {
                    let mv = self.member_vector(fe)?;
                    fe.emit_member_vector(&mv);
                }
                ImmType::SLA => self.switch_table(fe, start)?,
            }
        }
        Ok(())
    }

    fn int(&mut self) -> Result<i64, VmError> {
        match self.bump() {
            Tok::Int(i) => Ok(i),
            other => Err(self.err(format!("expected integer, found {:?}", other))),
        }
    }

    fn string(&mut self) -> Result<Vec<u8>, VmError> {
        match self.bump() {
            Tok::Str(s) => Ok(s),
            other => Err(self.err(format!("expected string literal, found {:?}", other))),
        }
    }

    fn local(&mut self, fe: &mut FuncEmitter) -> Result<u32, VmError> {
        match self.bump() {
            Tok::Var(v) => Ok(fe.local_id(&v)),
            other => Err(self.err(format!("expected local, found {:?}", other))),
        }
    }

    fn static_value(&mut self) -> Result<StaticValue, VmError> {
        Ok(match self.bump() {
            Tok::Int(i) => StaticValue::Int(i),
            Tok::Double(d) => StaticValue::Double(d),
            Tok::Str(s) => StaticValue::String(Arc::new(s)),
            Tok::Ident(s) if s.eq_ignore_ascii_case("null") => StaticValue::Null,
            Tok::Ident(s) if s.eq_ignore_ascii_case("true") => StaticValue::Bool(true),
            Tok::Ident(s) if s.eq_ignore_ascii_case("false") => StaticValue::Bool(false),
            Tok::Punct('[') => {
                let mut elems = Vec::new();
                let mut next_index = 0i64;
                loop {
                    self.skip_newlines();
                    if self.eat_punct(']') {
                        break;
                    }
                    let first = self.static_value()?;
                    if *self.peek() == Tok::Arrow {
                        self.pos += 1;
                        let value = self.static_value()?;
                        if let StaticValue::Int(i) = first {
                            next_index = next_index.max(i + 1);
                        }
                        elems.push((first, value));
                    } else {
                        elems.push((StaticValue::Int(next_index), first));
                        next_index += 1;
                    }
                    self.skip_newlines();
                    if !self.eat_punct(',') {
                        self.skip_newlines();
                        self.expect_punct(']')?;
                        break;
                    }
                }
                StaticValue::Array(Arc::new(elems))
            }
            other => return Err(self.err(format!("expected literal, found {:?}", other))),
        })
    }

    fn member_vector(&mut self, fe: &mut FuncEmitter) -> Result<MemberVector, VmError> {
        self.expect_punct('<')?;
        let loc_name = self.ident()?;
        let location = LocationCode::from_name(&loc_name)
            .ok_or_else(|| self.err(format!("bad location code {}", loc_name)))?;
        let loc_local = if location.has_local_imm() {
            self.expect_punct(':')?;
            Some(self.local(fe)?)
        } else {
            None
        };
        let mut num_stack = location.stack_inputs();
        let mut members = SmallVec::new();
        while !self.eat_punct('>') {
            let code_name = self.ident()?;
            let code = MemberCode::from_name(&code_name)
                .ok_or_else(|| self.err(format!("bad member code {}", code_name)))?;
            let imm = match code {
                MemberCode::EL | MemberCode::PL => {
                    self.expect_punct(':')?;
                    MemberImm::Local(self.local(fe)?)
                }
                MemberCode::ET | MemberCode::PT => {
                    self.expect_punct(':')?;
                    let s = self.string()?;
                    MemberImm::Str(self.ue.merge_litstr(&s))
                }
                MemberCode::EI => {
                    self.expect_punct(':')?;
                    MemberImm::Int(self.int()?)
                }
                MemberCode::EC | MemberCode::PC => {
                    num_stack += 1;
                    MemberImm::None
                }
                MemberCode::W => MemberImm::None,
            };
            members.push((code, imm));
        }
        if members.is_empty() {
            return Err(self.err("member vector needs at least one member"));
        }
        Ok(MemberVector {
            location,
            loc_local,
            members,
            num_stack,
        })
    }

    fn switch_table(&mut self, fe: &mut FuncEmitter, start: usize) -> Result<(), VmError> {
        self.expect_punct('<')?;
        let mut labels = Vec::new();
        while !self.eat_punct('>') {
            labels.push(self.ident()?);
        }
        let base = match self.peek() {
            Tok::Int(i) => {
                let i = *i;
                self.pos += 1;
                i
            }
            _ => 0,
        };
        let bounded = matches!(self.peek(), Tok::Ident(s) if s == "bounded");
        if bounded {
            self.pos += 1;
        }
        fe.emit_iva(labels.len() as u32);
        for label in &labels {
            fe.emit_branch(label, start);
        }
        fe.emit_i64(base);
        fe.emit_u8(bounded as u8);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::unit::EhKind;
    use crate::vm::opcode::{Imm, decode, disassemble};

    #[test]
    fn assembles_function_with_defaults_and_refs() {
        let unit = assemble(
            r#"
            .function f($a, $b = DV1, &$c) {
              CGetL $a
              RetC
            DV1:
              Int 2
              SetL $b
              PopC
              CGetL $a
              RetC
            }
            .main { Int 1; RetC }
            "#,
            "t.hhas",
        )
        .unwrap();
        let f = &unit.funcs[0];
        assert_eq!(f.num_params(), 3);
        assert!(f.params[2].by_ref);
        assert_eq!(f.params[1].dv_entry, Some(3));
        assert!(f.params[0].dv_entry.is_none());
        assert!(unit.main.is_pseudo_main);
    }

    #[test]
    fn member_vector_counts_stack_inputs() {
        let unit = assemble(
            r#".main {
              String "k"
              Int 1
              SetM <L:$x EC ET:"a" W>
              RetC
            }"#,
            "t.hhas",
        )
        .unwrap();
        let code = &unit.main.code;
        let first = decode(code, 0).unwrap();
        let second = decode(code, first.len).unwrap();
        let set = decode(code, first.len + second.len).unwrap();
        let mv = set.member_vector().unwrap();
        assert_eq!(mv.num_stack, 1);
        assert_eq!(mv.location, LocationCode::L);
        assert_eq!(mv.members.len(), 3);
        assert_eq!(unit.main.local_names[0].as_ref(), "x");
    }

    #[test]
    fn try_catch_regions() {
        let unit = assemble(
            r#".main {
              .try {
                Null
                Throw
              } .catch (Exception H)
            H:
              Catch
              PopC
              Null
              RetC
            }"#,
            "t.hhas",
        )
        .unwrap();
        let eh = &unit.main.eh_table[0];
        assert_eq!(eh.base, 0);
        assert_eq!(eh.past, 2);
        assert!(matches!(&eh.kind, EhKind::Catch { handlers } if handlers[0].1 == 2));
    }

    #[test]
    fn class_declarations() {
        let unit = assemble(
            r#"
            .class [abstract] A implements ArrayAccess, Countable {
              .property [private] p = [1, "k" => "v"];
              .static s = 3;
              .method [protected static] m($x) { Null; RetC }
            }
            "#,
            "t.hhas",
        )
        .unwrap();
        let a = &unit.classes[0];
        assert!(a.attrs.is_abstract);
        assert_eq!(a.interfaces.len(), 2);
        assert_eq!(a.props.len(), 2);
        assert!(a.props[1].is_static);
        assert_eq!(a.props[0].visibility, Visibility::Private);
        let m = &a.methods[0];
        assert_eq!(m.cls.as_deref(), Some("A"));
        assert!(m.attrs.is_static);
        assert_eq!(m.full_name(), "A::m");
    }

    #[test]
    fn constants_conditionals_and_param_types() {
        let unit = assemble(
            r#"
            .class [conditional trait] T { .const LIMIT = 10; .const NAME = "t"; }
            .function [conditional] f(?array $xs, Countable $c, $plain) { Null; RetC }
            "#,
            "t.hhas",
        )
        .unwrap();
        let t = &unit.classes[0];
        assert!(t.attrs.is_conditional && t.attrs.is_trait);
        assert_eq!(t.constants.len(), 2);
        assert_eq!(t.constants[0].0.as_ref(), "LIMIT");
        assert_eq!(t.constants[0].1, StaticValue::Int(10));

        let f = &unit.funcs[0];
        assert!(f.attrs.is_conditional);
        let xs = f.params[0].type_constraint.as_ref().unwrap();
        assert!(xs.nullable && xs.is_array());
        let c = f.params[1].type_constraint.as_ref().unwrap();
        assert!(!c.nullable);
        assert_eq!(c.name.as_ref(), "Countable");
        assert!(f.params[2].type_constraint.is_none());

        let err = assemble(".class A {\n  .const X = 1;\n  .const X = 2;\n}", "dup.hhas").unwrap_err();
        assert!(err.to_string().ends_with("duplicate constant A::X"));
    }

    #[test]
    fn switch_table_and_sub_ops() {
        let unit = assemble(
            r#".main {
              Int 1
              Switch <A B C> 0 bounded
            A: Int 1; IncDecL $i PreInc; RetC
            B: Int 2; RetC
            C: Int 3; RetC
            }"#,
            "t.hhas",
        )
        .unwrap();
        let listing = disassemble(&unit.main.code).unwrap();
        assert!(listing[1].1.starts_with("Switch"));
        let sw = decode(&unit.main.code, listing[1].0).unwrap();
        let table = sw.switch_table().unwrap();
        assert_eq!(table.targets.len(), 3);
        assert!(table.bounded);
        let incdec = decode(&unit.main.code, listing[3].0).unwrap();
        assert_eq!(incdec.imms[1], Imm::Oa(IncDecOp::PreInc as u8));
    }

    #[test]
    fn errors_carry_file_and_line() {
        let err = assemble(".main {\n  Bogus\n}", "bad.hhas").unwrap_err();
        assert_eq!(err.to_string(), "bad.hhas:2: unknown instruction Bogus");
    }
}
