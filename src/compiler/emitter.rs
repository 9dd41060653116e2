//! Bytecode builder
//!
//! `UnitEmitter` owns the literal tables of a unit under construction and a
//! list of `FuncEmitter`s. Each `FuncEmitter` appends encoded instructions,
//! records label definitions and forward references, and tracks exception
//! regions. Branch targets are patched when the function is finished.
//!
//! Reference: HHVM `compiler/emitter` (FuncEmitter / UnitEmitter)

use crate::core::value::StringData;
use crate::runtime::class::PreClass;
use crate::runtime::unit::{
    EhEntry, EhKind, Func, FuncAttrs, Offset, Param, StaticValue, TypeConstraint, Unit, UnitData,
};
use crate::vm::engine::VmError;
use crate::vm::opcode::{MemberVector, Op, encode_iva, encode_member_vector};
use std::collections::HashMap;
use std::sync::Arc;

/// Pending branch immediate
struct Fixup {
    /// Position of the 4-byte immediate
    at: usize,
    /// Offset the branch is relative to
    instr_start: usize,
    label: String,
}

enum PendingEh {
    Fault { label: String },
    Catch { handlers: Vec<(Arc<str>, String)> },
}

struct Region {
    base: Offset,
    past: Offset,
    kind: PendingEh,
    parent: Option<usize>,
}

struct PendingParam {
    name: Arc<str>,
    by_ref: bool,
    dv_label: Option<String>,
    type_constraint: Option<TypeConstraint>,
}

pub struct FuncEmitter {
    pub name: Arc<str>,
    pub cls: Option<Arc<str>>,
    pub attrs: FuncAttrs,
    pub is_pseudo_main: bool,
    params: Vec<PendingParam>,
    local_names: Vec<Arc<str>>,
    num_iterators: usize,
    code: Vec<u8>,
    lines: Vec<(Offset, u32)>,
    labels: HashMap<String, Offset>,
    fixups: Vec<Fixup>,
    regions: Vec<Region>,
    open_regions: Vec<usize>,
    instr_count: usize,
}

impl FuncEmitter {
    pub fn new(name: impl Into<Arc<str>>, cls: Option<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            cls,
            attrs: FuncAttrs::default(),
            is_pseudo_main: false,
            params: Vec::new(),
            local_names: Vec::new(),
            num_iterators: 0,
            code: Vec::new(),
            lines: Vec::new(),
            labels: HashMap::new(),
            fixups: Vec::new(),
            regions: Vec::new(),
            open_regions: Vec::new(),
            instr_count: 0,
        }
    }

    /// Parameters must be added before any other local is named
    pub fn add_param(
        &mut self,
        name: &str,
        by_ref: bool,
        dv_label: Option<String>,
        type_constraint: Option<TypeConstraint>,
    ) -> Result<(), VmError> {
        if self.local_names.len() != self.params.len() {
            return Err(VmError::load(format!(
                "parameter ${} declared after locals in {}",
                name, self.name
            )));
        }
        if self.local_names.iter().any(|n| n.as_ref() == name) {
            return Err(VmError::load(format!("duplicate parameter ${} in {}", name, self.name)));
        }
        let name: Arc<str> = Arc::from(name);
        self.local_names.push(name.clone());
        self.params.push(PendingParam {
            name,
            by_ref,
            dv_label,
            type_constraint,
        });
        Ok(())
    }

    /// Id of a named local, allocated on first use
    pub fn local_id(&mut self, name: &str) -> u32 {
        match self.local_names.iter().position(|n| n.as_ref() == name) {
            Some(id) => id as u32,
            None => {
                self.local_names.push(Arc::from(name));
                (self.local_names.len() - 1) as u32
            }
        }
    }

    pub fn note_iterator(&mut self, id: u32) {
        self.num_iterators = self.num_iterators.max(id as usize + 1);
    }

    pub fn offset(&self) -> Offset {
        self.code.len()
    }

    pub fn define_label(&mut self, label: &str) -> Result<(), VmError> {
        if self.labels.insert(label.to_string(), self.code.len()).is_some() {
            return Err(VmError::load(format!("label {} defined twice in {}", label, self.name)));
        }
        Ok(())
    }

    /// Start an instruction, returning its offset
    pub fn begin(&mut self, op: Op, line: u32) -> Offset {
        let start = self.code.len();
        if self.lines.last().is_none_or(|(_, l)| *l != line) {
            self.lines.push((start, line));
        }
        self.code.push(op as u8);
        self.instr_count += 1;
        start
    }

    pub fn emit_iva(&mut self, n: u32) {
        encode_iva(&mut self.code, n);
    }

    pub fn emit_u8(&mut self, b: u8) {
        self.code.push(b);
    }

    pub fn emit_u32(&mut self, n: u32) {
        self.code.extend_from_slice(&n.to_le_bytes());
    }

    pub fn emit_i64(&mut self, n: i64) {
        self.code.extend_from_slice(&n.to_le_bytes());
    }

    pub fn emit_f64(&mut self, d: f64) {
        self.code.extend_from_slice(&d.to_le_bytes());
    }

    /// Branch offset to `label`, relative to `instr_start`
    pub fn emit_branch(&mut self, label: &str, instr_start: Offset) {
        self.fixups.push(Fixup {
            at: self.code.len(),
            instr_start,
            label: label.to_string(),
        });
        self.code.extend_from_slice(&0i32.to_le_bytes());
    }

    pub fn emit_member_vector(&mut self, mv: &MemberVector) {
        encode_member_vector(&mut self.code, mv);
    }

    pub fn open_try(&mut self) -> usize {
        self.open_region(PendingEh::Catch {
            handlers: Vec::new(),
        })
    }

    pub fn open_fault(&mut self, label: &str) -> usize {
        self.open_region(PendingEh::Fault {
            label: label.to_string(),
        })
    }

    fn open_region(&mut self, kind: PendingEh) -> usize {
        let idx = self.regions.len();
        self.regions.push(Region {
            base: self.code.len(),
            past: self.code.len(),
            kind,
            parent: self.open_regions.last().copied(),
        });
        self.open_regions.push(idx);
        idx
    }

    pub fn close_region(&mut self, idx: usize) {
        self.open_regions.retain(|r| *r != idx);
        if let Some(region) = self.regions.get_mut(idx) {
            region.past = self.code.len();
        }
    }

    pub fn add_catch(&mut self, idx: usize, class: &str, label: &str) {
        if let Some(Region {
            kind: PendingEh::Catch { handlers },
            ..
        }) = self.regions.get_mut(idx)
        {
            handlers.push((Arc::from(class), label.to_string()));
        }
    }

    fn resolve(&self, label: &str) -> Result<Offset, VmError> {
        self.labels
            .get(label)
            .copied()
            .ok_or_else(|| VmError::load(format!("undefined label {} in {}", label, self.name)))
    }

    pub fn finish(mut self, unit: Arc<UnitData>) -> Result<Func, VmError> {
        for fixup in std::mem::take(&mut self.fixups) {
            let target = self.resolve(&fixup.label)?;
            let rel = target as i64 - fixup.instr_start as i64;
            self.code[fixup.at..fixup.at + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }

        let mut params = Vec::with_capacity(self.params.len());
        for p in &self.params {
            let dv_entry = match &p.dv_label {
                Some(label) => Some(self.resolve(label)?),
                None => None,
            };
            params.push(Param {
                name: p.name.clone(),
                by_ref: p.by_ref,
                dv_entry,
                type_constraint: p.type_constraint.clone(),
            });
        }

        let mut eh_table = Vec::with_capacity(self.regions.len());
        for region in &self.regions {
            let kind = match &region.kind {
                PendingEh::Fault { label } => EhKind::Fault {
                    handler: self.resolve(label)?,
                },
                PendingEh::Catch { handlers } => EhKind::Catch {
                    handlers: handlers
                        .iter()
                        .map(|(cls, label)| Ok((cls.clone(), self.resolve(label)?)))
                        .collect::<Result<_, VmError>>()?,
                },
            };
            eh_table.push(EhEntry {
                base: region.base,
                past: region.past,
                kind,
                parent: region.parent,
            });
        }

        Ok(Func {
            name: self.name,
            cls: self.cls,
            attrs: self.attrs,
            params,
            local_names: self.local_names,
            num_iterators: self.num_iterators,
            // no instruction pushes more than two cells net
            max_stack_cells: self.instr_count * 2 + 1,
            code: self.code,
            lines: self.lines,
            eh_table,
            is_pseudo_main: self.is_pseudo_main,
            native: None,
            unit,
        })
    }
}

/// Class under construction; methods are finished with the unit
pub struct ClassEmitter {
    pub pre: PreClass,
    pub methods: Vec<FuncEmitter>,
}

pub struct UnitEmitter {
    filepath: Arc<str>,
    litstrs: Vec<Arc<StringData>>,
    litstr_ids: HashMap<Vec<u8>, u32>,
    arrays: Vec<StaticValue>,
    pub main: Option<FuncEmitter>,
    pub funcs: Vec<FuncEmitter>,
    pub classes: Vec<ClassEmitter>,
}

impl UnitEmitter {
    pub fn new(filepath: &str) -> Self {
        Self {
            filepath: Arc::from(filepath),
            litstrs: Vec::new(),
            litstr_ids: HashMap::new(),
            arrays: Vec::new(),
            main: None,
            funcs: Vec::new(),
            classes: Vec::new(),
        }
    }

    /// Intern a string literal
    pub fn merge_litstr(&mut self, s: &[u8]) -> u32 {
        if let Some(id) = self.litstr_ids.get(s) {
            return *id;
        }
        let id = self.litstrs.len() as u32;
        self.litstrs.push(Arc::new(s.to_vec()));
        self.litstr_ids.insert(s.to_vec(), id);
        id
    }

    pub fn merge_array(&mut self, value: StaticValue) -> u32 {
        self.arrays.push(value);
        (self.arrays.len() - 1) as u32
    }

    pub fn finish(self) -> Result<Unit, VmError> {
        let data = Arc::new(UnitData {
            filepath: self.filepath,
            litstrs: self.litstrs,
            arrays: self.arrays,
        });
        let main = match self.main {
            Some(m) => m,
            None => {
                let mut m = FuncEmitter::new("", None);
                m.is_pseudo_main = true;
                m.begin(Op::Int, 0);
                m.emit_i64(1);
                m.begin(Op::RetC, 0);
                m
            }
        };
        let main = Arc::new(main.finish(data.clone())?);
        let funcs = self
            .funcs
            .into_iter()
            .map(|f| f.finish(data.clone()).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        let mut classes = Vec::with_capacity(self.classes.len());
        for ce in self.classes {
            let mut pre = ce.pre;
            for m in ce.methods {
                pre.methods.push(Arc::new(m.finish(data.clone())?));
            }
            classes.push(pre);
        }
        Ok(Unit {
            data,
            main,
            funcs,
            classes,
        })
    }
}
