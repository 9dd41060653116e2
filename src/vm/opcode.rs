//! Instruction set and bytecode decoding
//!
//! ## Encoding
//!
//! Every instruction is a one-byte opcode followed by its immediates:
//!
//! - `IVA`, `HA` (local id), `IA` (iterator id): variable size, one byte
//!   `n << 1` when `n < 128`, else four little-endian bytes `(n << 1) | 1`
//! - `I64A`: 8 bytes, `DA`: 8-byte IEEE double
//! - `SA` / `AA`: u32 index into the unit's string / array literal table
//! - `BA`: i32 branch offset relative to the start of the instruction
//! - `OA`: one-byte sub-op
//! - `MA`: member vector (see `MemberVector`)
//! - `SLA`: switch table (IVA count, i32 offsets, I64A base, u8 bounded)
//!
//! Reference: HHVM `runtime/vm/hhbc.h`

use crate::vm::engine::VmError;
use lazy_static::lazy_static;
use smallvec::SmallVec;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImmType {
    IVA,
    I64A,
    DA,
    SA,
    AA,
    BA,
    OA,
    HA,
    IA,
    MA,
    SLA,
}

macro_rules! opcodes {
    ($($name:ident [$($imm:ident),*];)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Op {
            $($name),*
        }

        impl Op {
            pub const ALL: &'static [Op] = &[$(Op::$name),*];

            /// Assembler mnemonic
            pub fn name(self) -> &'static str {
                match self {
                    $(Op::$name => stringify!($name).trim_end_matches('_')),*
                }
            }

            pub fn immediates(self) -> &'static [ImmType] {
                match self {
                    $(Op::$name => &[$(ImmType::$imm),*]),*
                }
            }
        }
    };
}

opcodes! {
    Nop [];
    PopC [];
    PopV [];
    PopR [];
    Dup [];
    Box [];
    Unbox [];
    BoxR [];
    UnboxR [];
    Null [];
    True [];
    False [];
    Int [I64A];
    Double [DA];
    String [SA];
    Array [AA];
    NewArray [];
    AddElemC [];
    AddElemV [];
    AddNewElemC [];
    AddNewElemV [];
    Cns [SA];
    Concat [];
    Add [];
    Sub [];
    Mul [];
    Div [];
    Mod [];
    Xor [];
    Not [];
    Same [];
    NSame [];
    Eq [];
    Neq [];
    Lt [];
    Lte [];
    Gt [];
    Gte [];
    BitAnd [];
    BitOr [];
    BitXor [];
    BitNot [];
    Shl [];
    Shr [];
    CastBool [];
    CastInt [];
    CastDouble [];
    CastString [];
    CastArray [];
    CastObject [];
    InstanceOf [];
    InstanceOfD [SA];
    Print [];
    Clone [];
    Exit [];
    Fatal [];
    Jmp [BA];
    JmpZ [BA];
    JmpNZ [BA];
    Switch [SLA];
    RetC [];
    RetV [];
    Unwind [];
    Throw [];
    Catch [];
    CGetL [HA];
    CGetL2 [HA];
    CGetL3 [HA];
    CGetN [];
    CGetG [];
    CGetS [];
    CGetM [MA];
    VGetL [HA];
    VGetN [];
    VGetG [];
    VGetS [];
    VGetM [MA];
    AGetC [];
    AGetL [HA];
    IssetC [];
    IssetL [HA];
    IssetN [];
    IssetG [];
    IssetS [];
    IssetM [MA];
    EmptyL [HA];
    EmptyN [];
    EmptyG [];
    EmptyS [];
    EmptyM [MA];
    IsTypeL [HA, OA];
    IsTypeC [OA];
    SetL [HA];
    SetN [];
    SetG [];
    SetS [];
    SetM [MA];
    SetOpL [HA, OA];
    SetOpN [OA];
    SetOpG [OA];
    SetOpS [OA];
    SetOpM [OA, MA];
    IncDecL [HA, OA];
    IncDecN [OA];
    IncDecG [OA];
    IncDecS [OA];
    IncDecM [OA, MA];
    BindL [HA];
    BindN [];
    BindG [];
    BindS [];
    BindM [MA];
    UnsetL [HA];
    UnsetN [];
    UnsetG [];
    UnsetM [MA];
    FPushFunc [IVA];
    FPushFuncD [IVA, SA];
    FPushObjMethod [IVA];
    FPushObjMethodD [IVA, SA];
    FPushClsMethod [IVA];
    FPushClsMethodD [IVA, SA, SA];
    FPushClsMethodF [IVA];
    FPushCtor [IVA];
    FPushCtorD [IVA, SA];
    FPassC [IVA];
    FPassCW [IVA];
    FPassCE [IVA];
    FPassV [IVA];
    FPassR [IVA];
    FPassL [IVA, HA];
    FPassN [IVA];
    FPassG [IVA];
    FPassS [IVA];
    FPassM [IVA, MA];
    FCall [IVA];
    IterInit [IA, BA];
    IterInitM [IA, BA];
    IterValueC [IA];
    IterValueV [IA];
    IterKey [IA];
    IterNext [IA, BA];
    IterFree [IA];
    This [];
    InitThisLoc [HA];
    StaticLoc [HA, SA];
    StaticLocInit [HA, SA];
    LateBoundCls [];
    Self_ [];
    Parent [];
    NativeImpl [];
    DefFunc [IVA];
    DefCls [IVA];
    DefCns [SA];
    ClsCns [SA];
    ClsCnsD [SA, SA];
    ClassExists [];
    InterfaceExists [];
    TraitExists [];
    VerifyParamType [IVA];
    CreateCont [IVA, SA];
    UnpackCont [];
    PackCont [IVA];
    ContReceive [];
    ContRaised [];
    ContDone [];
    ContNext [];
    ContSend [];
    ContRaise [];
    ContEnter [];
    ContValid [];
    ContCurrent [];
    ContKey [];
    ContStarted [];
    ContStopped [];
    ContHandle [];
}

lazy_static! {
    static ref OPS_BY_NAME: HashMap<&'static str, Op> =
        Op::ALL.iter().map(|op| (op.name(), *op)).collect();
}

impl Op {
    pub fn from_u8(byte: u8) -> Option<Op> {
        Op::ALL.get(byte as usize).copied()
    }

    pub fn from_name(name: &str) -> Option<Op> {
        OPS_BY_NAME.get(name).copied()
    }

    /// Instructions that end a basic block
    pub fn is_control_flow(self) -> bool {
        matches!(
            self,
            Op::Jmp
                | Op::JmpZ
                | Op::JmpNZ
                | Op::Switch
                | Op::RetC
                | Op::RetV
                | Op::Unwind
                | Op::Throw
                | Op::FCall
                | Op::IterInit
                | Op::IterInitM
                | Op::IterNext
                | Op::Exit
                | Op::Fatal
                | Op::NativeImpl
                | Op::ContEnter
                | Op::ContHandle
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SetOpOp {
    PlusEqual,
    MinusEqual,
    MulEqual,
    DivEqual,
    ConcatEqual,
    ModEqual,
    AndEqual,
    OrEqual,
    XorEqual,
    SlEqual,
    SrEqual,
}

impl SetOpOp {
    const ALL: [SetOpOp; 11] = [
        SetOpOp::PlusEqual,
        SetOpOp::MinusEqual,
        SetOpOp::MulEqual,
        SetOpOp::DivEqual,
        SetOpOp::ConcatEqual,
        SetOpOp::ModEqual,
        SetOpOp::AndEqual,
        SetOpOp::OrEqual,
        SetOpOp::XorEqual,
        SetOpOp::SlEqual,
        SetOpOp::SrEqual,
    ];

    pub fn from_u8(b: u8) -> Option<Self> {
        Self::ALL.get(b as usize).copied()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| format!("{:?}", op) == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IncDecOp {
    PreInc,
    PostInc,
    PreDec,
    PostDec,
}

impl IncDecOp {
    const ALL: [IncDecOp; 4] = [
        IncDecOp::PreInc,
        IncDecOp::PostInc,
        IncDecOp::PreDec,
        IncDecOp::PostDec,
    ];

    pub fn from_u8(b: u8) -> Option<Self> {
        Self::ALL.get(b as usize).copied()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| format!("{:?}", op) == name)
    }

    pub fn is_inc(self) -> bool {
        matches!(self, IncDecOp::PreInc | IncDecOp::PostInc)
    }

    pub fn is_pre(self) -> bool {
        matches!(self, IncDecOp::PreInc | IncDecOp::PreDec)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IsTypeOp {
    Null,
    Bool,
    Int,
    Double,
    Str,
    Arr,
    Obj,
}

impl IsTypeOp {
    const ALL: [IsTypeOp; 7] = [
        IsTypeOp::Null,
        IsTypeOp::Bool,
        IsTypeOp::Int,
        IsTypeOp::Double,
        IsTypeOp::Str,
        IsTypeOp::Arr,
        IsTypeOp::Obj,
    ];

    pub fn from_u8(b: u8) -> Option<Self> {
        Self::ALL.get(b as usize).copied()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| format!("{:?}", op) == name)
    }
}

/// Where a member vector's base comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LocationCode {
    /// Local by id
    L,
    /// Cell on the stack
    C,
    /// Return value on the stack
    R,
    /// Variable named by a local
    NL,
    /// Variable named by a stack cell
    NC,
    /// Global named by a local
    GL,
    /// Global named by a stack cell
    GC,
    /// Static property: class on the stack, name in a local
    SL,
    /// Static property: name and class on the stack
    SC,
    /// `$this`
    H,
}

impl LocationCode {
    const ALL: [LocationCode; 10] = [
        LocationCode::L,
        LocationCode::C,
        LocationCode::R,
        LocationCode::NL,
        LocationCode::NC,
        LocationCode::GL,
        LocationCode::GC,
        LocationCode::SL,
        LocationCode::SC,
        LocationCode::H,
    ];

    pub fn from_u8(b: u8) -> Option<Self> {
        Self::ALL.get(b as usize).copied()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| format!("{:?}", c) == name)
    }

    pub fn has_local_imm(self) -> bool {
        matches!(
            self,
            LocationCode::L | LocationCode::NL | LocationCode::GL | LocationCode::SL
        )
    }

    pub fn stack_inputs(self) -> u32 {
        match self {
            LocationCode::C
            | LocationCode::R
            | LocationCode::NC
            | LocationCode::GC
            | LocationCode::SL => 1,
            LocationCode::SC => 2,
            LocationCode::L | LocationCode::NL | LocationCode::GL | LocationCode::H => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemberCode {
    /// Element keyed by a local
    EL,
    /// Element keyed by a stack cell
    EC,
    /// Element keyed by a string literal
    ET,
    /// Element keyed by an integer immediate
    EI,
    PL,
    PC,
    PT,
    /// New element (`$a[]`)
    W,
}

impl MemberCode {
    const ALL: [MemberCode; 8] = [
        MemberCode::EL,
        MemberCode::EC,
        MemberCode::ET,
        MemberCode::EI,
        MemberCode::PL,
        MemberCode::PC,
        MemberCode::PT,
        MemberCode::W,
    ];

    pub fn from_u8(b: u8) -> Option<Self> {
        Self::ALL.get(b as usize).copied()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| format!("{:?}", c) == name)
    }

    pub fn is_elem(self) -> bool {
        matches!(
            self,
            MemberCode::EL | MemberCode::EC | MemberCode::ET | MemberCode::EI
        )
    }

    pub fn is_prop(self) -> bool {
        matches!(self, MemberCode::PL | MemberCode::PC | MemberCode::PT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MemberImm {
    None,
    Local(u32),
    Str(u32),
    Int(i64),
}

/// Decoded `MA` immediate
#[derive(Debug, Clone, PartialEq)]
pub struct MemberVector {
    pub location: LocationCode,
    pub loc_local: Option<u32>,
    pub members: SmallVec<[(MemberCode, MemberImm); 4]>,
    /// Number of cells the vector consumes from the stack
    pub num_stack: u32,
}

impl MemberVector {
    pub fn last_member(&self) -> Option<(MemberCode, MemberImm)> {
        self.members.last().copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchTable {
    pub targets: Vec<i32>,
    pub base: i64,
    /// Last target is the default when set
    pub bounded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Imm {
    Iva(u32),
    I64(i64),
    Double(f64),
    Str(u32),
    Arr(u32),
    Ba(i32),
    Oa(u8),
    Ha(u32),
    Ia(u32),
    Ma(Box<MemberVector>),
    Sla(Box<SwitchTable>),
}

/// One decoded instruction
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub op: Op,
    pub imms: SmallVec<[Imm; 3]>,
    pub len: usize,
}

impl Instr {
    /// Integer immediate (`IVA`, `HA` or `IA`) at position `i`
    #[inline]
    pub fn iva(&self, i: usize) -> u32 {
        match self.imms.get(i) {
            Some(Imm::Iva(v) | Imm::Ha(v) | Imm::Ia(v) | Imm::Str(v) | Imm::Arr(v)) => *v,
            _ => 0,
        }
    }

    #[inline]
    pub fn local(&self, i: usize) -> usize {
        self.iva(i) as usize
    }

    pub fn i64(&self, i: usize) -> i64 {
        match self.imms.get(i) {
            Some(Imm::I64(v)) => *v,
            _ => 0,
        }
    }

    pub fn double(&self, i: usize) -> f64 {
        match self.imms.get(i) {
            Some(Imm::Double(v)) => *v,
            _ => 0.0,
        }
    }

    pub fn ba(&self, i: usize) -> i32 {
        match self.imms.get(i) {
            Some(Imm::Ba(v)) => *v,
            _ => 0,
        }
    }

    pub fn oa(&self, i: usize) -> u8 {
        match self.imms.get(i) {
            Some(Imm::Oa(v)) => *v,
            _ => 0,
        }
    }

    pub fn member_vector(&self) -> Option<&MemberVector> {
        self.imms.iter().find_map(|imm| match imm {
            Imm::Ma(mv) => Some(mv.as_ref()),
            _ => None,
        })
    }

    pub fn switch_table(&self) -> Option<&SwitchTable> {
        self.imms.iter().find_map(|imm| match imm {
            Imm::Sla(t) => Some(t.as_ref()),
            _ => None,
        })
    }
}

/// Byte reader over a function's code
struct Reader<'a> {
    code: &'a [u8],
    pos: usize,
    start: usize,
}

impl<'a> Reader<'a> {
    fn err(&self, reason: &str) -> VmError {
        VmError::invalid_bytecode(self.start, reason)
    }

    fn u8(&mut self) -> Result<u8, VmError> {
        let b = *self.code.get(self.pos).ok_or_else(|| self.err("truncated instruction"))?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes<const N: usize>(&mut self) -> Result<[u8; N], VmError> {
        let slice = self
            .code
            .get(self.pos..self.pos + N)
            .ok_or_else(|| self.err("truncated immediate"))?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, VmError> {
        Ok(u32::from_le_bytes(self.bytes::<4>()?))
    }

    fn i32(&mut self) -> Result<i32, VmError> {
        Ok(i32::from_le_bytes(self.bytes::<4>()?))
    }

    fn i64(&mut self) -> Result<i64, VmError> {
        Ok(i64::from_le_bytes(self.bytes::<8>()?))
    }

    fn iva(&mut self) -> Result<u32, VmError> {
        let first = *self.code.get(self.pos).ok_or_else(|| self.err("truncated IVA"))?;
        if first & 1 == 0 {
            self.pos += 1;
            Ok((first >> 1) as u32)
        } else {
            Ok(self.u32()? >> 1)
        }
    }

    fn member_vector(&mut self) -> Result<MemberVector, VmError> {
        let size = self.u32()? as usize;
        let num_stack = self.u32()?;
        let end = self.pos + size;
        let location = LocationCode::from_u8(self.u8()?)
            .ok_or_else(|| self.err("bad location code"))?;
        let loc_local = if location.has_local_imm() {
            Some(self.iva()?)
        } else {
            None
        };
        let mut members = SmallVec::new();
        while self.pos < end {
            let code = MemberCode::from_u8(self.u8()?).ok_or_else(|| self.err("bad member code"))?;
            let imm = match code {
                MemberCode::EL | MemberCode::PL => MemberImm::Local(self.iva()?),
                MemberCode::ET | MemberCode::PT => MemberImm::Str(self.u32()?),
                MemberCode::EI => MemberImm::Int(self.i64()?),
                MemberCode::EC | MemberCode::PC | MemberCode::W => MemberImm::None,
            };
            members.push((code, imm));
        }
        if self.pos != end {
            return Err(self.err("member vector size mismatch"));
        }
        if members.is_empty() {
            return Err(self.err("empty member vector"));
        }
        Ok(MemberVector {
            location,
            loc_local,
            members,
            num_stack,
        })
    }

    fn switch_table(&mut self) -> Result<SwitchTable, VmError> {
        let count = self.iva()? as usize;
        let mut targets = Vec::with_capacity(count);
        for _ in 0..count {
            targets.push(self.i32()?);
        }
        let base = self.i64()?;
        let bounded = self.u8()? != 0;
        Ok(SwitchTable {
            targets,
            base,
            bounded,
        })
    }
}

/// Decode the instruction at `pc`
pub fn decode(code: &[u8], pc: usize) -> Result<Instr, VmError> {
    let mut r = Reader {
        code,
        pos: pc,
        start: pc,
    };
    let byte = r.u8()?;
    let op = Op::from_u8(byte).ok_or_else(|| r.err(&format!("invalid opcode byte {:#04x}", byte)))?;
    let mut imms = SmallVec::new();
    for ty in op.immediates() {
        let imm = match ty {
            ImmType::IVA => Imm::Iva(r.iva()?),
            ImmType::HA => Imm::Ha(r.iva()?),
            ImmType::IA => Imm::Ia(r.iva()?),
            ImmType::I64A => Imm::I64(r.i64()?),
            ImmType::DA => Imm::Double(f64::from_le_bytes(r.bytes::<8>()?)),
            ImmType::SA => Imm::Str(r.u32()?),
            ImmType::AA => Imm::Arr(r.u32()?),
            ImmType::BA => Imm::Ba(r.i32()?),
            ImmType::OA => Imm::Oa(r.u8()?),
            ImmType::MA => Imm::Ma(Box::new(r.member_vector()?)),
            ImmType::SLA => Imm::Sla(Box::new(r.switch_table()?)),
        };
        imms.push(imm);
    }
    Ok(Instr {
        op,
        imms,
        len: r.pos - pc,
    })
}

/// Append an `IVA`-encoded integer
pub fn encode_iva(out: &mut Vec<u8>, n: u32) {
    if n < 128 {
        out.push((n << 1) as u8);
    } else {
        out.extend_from_slice(&((n << 1) | 1).to_le_bytes());
    }
}

/// Append an `MA` immediate
pub fn encode_member_vector(out: &mut Vec<u8>, mv: &MemberVector) {
    let mut body = Vec::new();
    body.push(mv.location as u8);
    if let Some(local) = mv.loc_local {
        encode_iva(&mut body, local);
    }
    for (code, imm) in &mv.members {
        body.push(*code as u8);
        match imm {
            MemberImm::Local(l) => encode_iva(&mut body, *l),
            MemberImm::Str(s) => body.extend_from_slice(&s.to_le_bytes()),
            MemberImm::Int(i) => body.extend_from_slice(&i.to_le_bytes()),
            MemberImm::None => {}
        }
    }
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&mv.num_stack.to_le_bytes());
    out.extend_from_slice(&body);
}

/// Human-readable listing of a function body
pub fn disassemble(code: &[u8]) -> Result<Vec<(usize, String)>, VmError> {
    let mut out = Vec::new();
    let mut pc = 0;
    while pc < code.len() {
        let instr = decode(code, pc)?;
        let mut text = instr.op.name().to_string();
        for imm in &instr.imms {
            let part = match imm {
                Imm::Iva(v) | Imm::Ia(v) => v.to_string(),
                Imm::Ha(v) => format!("L:{}", v),
                Imm::I64(v) => v.to_string(),
                Imm::Double(v) => format!("{:?}", v),
                Imm::Str(v) => format!("S:{}", v),
                Imm::Arr(v) => format!("A:{}", v),
                Imm::Ba(v) => format!("@{}", pc as i64 + *v as i64),
                Imm::Oa(v) => format!("op:{}", v),
                Imm::Ma(mv) => format!("{:?}", mv),
                Imm::Sla(t) => format!("{:?}", t),
            };
            text.push(' ');
            text.push_str(&part);
        }
        out.push((pc, text));
        pc += instr.len;
    }
    Ok(out)
}
