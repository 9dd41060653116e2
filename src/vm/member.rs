//! Member access helpers
//!
//! A member vector (`$a[$k]->p[]`) is resolved one step at a time. Each step
//! turns the current base into a [`Place`]: a root storage location plus a
//! path of array keys below it. Places are addresses, not borrows, so a step
//! that calls back into user code (`offsetGet`) can never leave a dangling
//! base behind; the next access simply walks the path again.
//!
//! ## Temporaries
//!
//! Values that live nowhere else are kept in [`MemberState`]:
//!
//! - `scratch`: results of failed or synthesized steps (null, a one-char
//!   string). A step that leaves `scratch` uninit aborts the vector.
//! - `tv_ref` / `tv_ref2`: values returned by `offsetGet`. After every step
//!   the newest one is rotated into `tv_ref2`, releasing the previous one,
//!   so a temporary stays alive exactly one step past the step that made it.
//! - `dummy`: stand-in base for missing named variables and `$this`.
//!
//! ## Writes
//!
//! Writing through a place calls `Rc::make_mut` on every array along the
//! path, which separates shared arrays (copy-on-write) before mutating.
//!
//! Reference: HHVM `runtime/vm/bytecode.cpp` - Elem/ElemD/ElemU/NewElem,
//! prop, SetElem, SetOpElem, IncDecElem, UnsetElem

use crate::core::value::{ArrayData, ArrayKey, ObjectData, PropName, RefData, TypedValue};
use crate::runtime::class::Class;
use crate::vm::assign_op::BinaryOp;
use crate::vm::engine::{VM, VmError};
use crate::vm::inc_dec::inc_dec_cell;
use crate::vm::opcode::{IncDecOp, LocationCode, MemberCode, MemberImm, MemberVector};
use crate::vm::var_env::VarLoc;
use smallvec::SmallVec;
use std::rc::Rc;
use std::sync::Arc;

const SCALAR_AS_ARRAY: &str = "Cannot use a scalar value as an array";
const PROP_ON_NON_OBJECT: &str = "Cannot access property on non-object";

/// Storage a place is rooted in
#[derive(Debug, Clone)]
pub(crate) enum Root {
    Var(VarLoc),
    /// Absolute stack index
    Stack(usize),
    /// (declaring class, lowercased) and property name
    StaticProp(String, String),
    Prop(Rc<ObjectData>, PropName),
    Boxed(Rc<RefData>),
    Scratch,
    TvRef,
    TvRef2,
    Dummy,
}

#[derive(Debug, Clone)]
pub(crate) struct Place {
    pub root: Root,
    pub path: SmallVec<[ArrayKey; 4]>,
}

impl Place {
    pub fn root(root: Root) -> Self {
        Self {
            root,
            path: SmallVec::new(),
        }
    }

    pub fn child(&self, key: ArrayKey) -> Self {
        let mut path = self.path.clone();
        path.push(key);
        Self {
            root: self.root.clone(),
            path,
        }
    }

    fn is_scratch(&self) -> bool {
        matches!(self.root, Root::Scratch) && self.path.is_empty()
    }
}

/// Temporaries of one vector instruction
#[derive(Debug, Default)]
pub(crate) struct MemberState {
    pub scratch: TypedValue,
    pub tv_ref: TypedValue,
    pub tv_ref2: TypedValue,
    pub dummy: TypedValue,
    /// The base was produced by reading a string offset
    pub base_str_off: bool,
}

impl MemberState {
    /// Rotate a fresh `offsetGet` result into `tv_ref2`
    pub fn ratchet(&mut self, result: &mut Place) {
        if self.tv_ref.is_uninit() {
            return;
        }
        self.tv_ref2.assign(std::mem::take(&mut self.tv_ref));
        if matches!(result.root, Root::TvRef) {
            result.root = Root::TvRef2;
        }
    }

    fn scratch(&mut self, value: TypedValue) -> Place {
        self.scratch.assign(value);
        Place::root(Root::Scratch)
    }

    /// A step failed; the instruction stops here
    pub fn aborted(&self, place: &Place) -> bool {
        place.is_scratch() && self.scratch.is_uninit()
    }
}

/// What a base looks like, for the per-type dispatch of each helper
#[derive(Debug, Clone)]
pub(crate) enum Shape {
    Null,
    Bool(bool),
    Number,
    Str { empty: bool },
    Array,
    Object(Rc<ObjectData>),
    Other,
}

impl Shape {
    fn of(value: &TypedValue) -> Self {
        match value {
            TypedValue::Uninit | TypedValue::Null => Shape::Null,
            TypedValue::Bool(b) => Shape::Bool(*b),
            TypedValue::Int(_) | TypedValue::Double(_) => Shape::Number,
            TypedValue::StaticString(_) | TypedValue::String(_) => Shape::Str {
                empty: value.str_bytes().is_none_or(<[u8]>::is_empty),
            },
            TypedValue::Array(_) => Shape::Array,
            TypedValue::Object(o) => Shape::Object(o.clone()),
            TypedValue::Ref(r) => Shape::of(&r.borrow()),
            TypedValue::Class(_) => Shape::Other,
        }
    }

    /// Null, false and "" turn into an array (or object) on write
    fn is_emptyish(&self) -> bool {
        matches!(self, Shape::Null | Shape::Bool(false) | Shape::Str { empty: true })
    }
}

/// How the intermediate members of a vector are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read { warn: bool },
    /// Missing elements and properties are created
    Define { warn: bool },
    Unset,
}

impl Access {
    fn warn(self) -> bool {
        match self {
            Access::Read { warn } | Access::Define { warn } => warn,
            Access::Unset => false,
        }
    }
}

/// Outcome of walking a member vector
#[derive(Debug)]
pub(crate) struct Resolved {
    pub place: Place,
    /// Final member and its key, when the caller handles it
    pub last: Option<(MemberCode, Option<TypedValue>)>,
    pub aborted: bool,
}

/// Walk `path` below `slot` and run `f` on the addressed cell. Arrays are
/// separated on the way down; a path that no longer exists yields a
/// throwaway null.
pub(crate) fn descend<R>(
    slot: &mut TypedValue,
    path: &[ArrayKey],
    f: impl FnOnce(&mut TypedValue) -> R,
) -> R {
    let Some((key, rest)) = path.split_first() else {
        return f(slot);
    };
    match slot {
        TypedValue::Ref(r) => {
            let r = r.clone();
            match r.try_borrow_mut() {
                Some(mut inner) => descend(&mut inner, path, f),
                None => f(&mut TypedValue::Null),
            }
        }
        TypedValue::Array(arr) => match Rc::make_mut(arr).lval_existing(key) {
            Some(child) => descend(child, rest, f),
            None => f(&mut TypedValue::Null),
        },
        _ => f(&mut TypedValue::Null),
    }
}

fn key_display(key: &TypedValue) -> String {
    String::from_utf8_lossy(&key.to_string_bytes()).into_owned()
}

fn new_array_with(key: ArrayKey, value: TypedValue) -> TypedValue {
    let mut arr = ArrayData::new();
    arr.set(key, value);
    TypedValue::Array(Rc::new(arr))
}

impl VM {
    /// Run `f` on the cell a place denotes. A boxed cell anywhere along the
    /// path, the addressed one included, becomes the root of the walk.
    pub(crate) fn with_place<R>(
        &mut self,
        ms: &mut MemberState,
        place: &Place,
        f: impl FnOnce(&mut TypedValue) -> R,
    ) -> R {
        let place = self.rebase(ms, place, true);
        self.with_root(ms, &place, f)
    }

    /// Run `f` on the slot a place denotes; a boxed slot is handed over as
    /// the box itself, for binding.
    pub(crate) fn with_slot<R>(
        &mut self,
        ms: &mut MemberState,
        place: &Place,
        f: impl FnOnce(&mut TypedValue) -> R,
    ) -> R {
        let place = self.rebase(ms, place, false);
        self.with_root(ms, &place, f)
    }

    /// Re-root `place` at the innermost boxed cell on its path, so the walk
    /// below the root never crosses a box. A box that holds an array
    /// containing itself is then borrowed exactly once.
    fn rebase(&self, ms: &MemberState, place: &Place, through_leaf: bool) -> Place {
        let mut root = place.root.clone();
        let mut root_at = 0;
        let mut current = self.root_value(ms, &place.root);
        for i in 0..=place.path.len() {
            if let TypedValue::Ref(r) = &current {
                let r = r.clone();
                if i < place.path.len() || through_leaf {
                    root = Root::Boxed(r.clone());
                    root_at = i;
                }
                current = r.get();
            }
            let Some(key) = place.path.get(i) else { break };
            current = match &current {
                TypedValue::Array(arr) => arr.get(key).cloned().unwrap_or_default(),
                _ => break,
            };
        }
        if root_at == 0 && !matches!(root, Root::Boxed(_)) {
            return place.clone();
        }
        Place {
            root,
            path: place.path[root_at..].iter().cloned().collect(),
        }
    }

    fn with_root<R>(
        &mut self,
        ms: &mut MemberState,
        place: &Place,
        f: impl FnOnce(&mut TypedValue) -> R,
    ) -> R {
        let path = &place.path[..];
        match &place.root {
            Root::Var(loc) => match self.var_mut(loc) {
                Some(slot) => descend(slot, path, f),
                None => f(&mut TypedValue::Null),
            },
            Root::Stack(idx) => descend(self.stack.at_mut(*idx), path, f),
            Root::StaticProp(cls, name) => {
                match self.context.static_props.get_mut(&(cls.clone(), name.clone())) {
                    Some(slot) => descend(slot, path, f),
                    None => f(&mut TypedValue::Null),
                }
            }
            Root::Prop(obj, name) => match obj.props.try_borrow_mut() {
                Ok(mut props) => match props.get_mut(&name[..]) {
                    Some(slot) => descend(slot, path, f),
                    None => f(&mut TypedValue::Null),
                },
                Err(_) => f(&mut TypedValue::Null),
            },
            Root::Boxed(r) => match r.try_borrow_mut() {
                Some(mut inner) => descend(&mut inner, path, f),
                None => f(&mut TypedValue::Null),
            },
            Root::Scratch => descend(&mut ms.scratch, path, f),
            Root::TvRef => descend(&mut ms.tv_ref, path, f),
            Root::TvRef2 => descend(&mut ms.tv_ref2, path, f),
            Root::Dummy => descend(&mut ms.dummy, path, f),
        }
    }

    fn root_value(&self, ms: &MemberState, root: &Root) -> TypedValue {
        match root {
            Root::Var(loc) => self.var_ref(loc).cloned().unwrap_or_default(),
            Root::Stack(idx) => self.stack.at(*idx).clone(),
            Root::StaticProp(cls, name) => self
                .context
                .static_props
                .get(&(cls.clone(), name.clone()))
                .cloned()
                .unwrap_or(TypedValue::Null),
            Root::Prop(obj, name) => obj
                .props
                .try_borrow()
                .ok()
                .and_then(|props| props.get(&name[..]).cloned())
                .unwrap_or(TypedValue::Null),
            Root::Boxed(r) => TypedValue::Ref(r.clone()),
            Root::Scratch => ms.scratch.clone(),
            Root::TvRef => ms.tv_ref.clone(),
            Root::TvRef2 => ms.tv_ref2.clone(),
            Root::Dummy => ms.dummy.clone(),
        }
    }

    /// Copy of the value at a place, without separating anything
    pub(crate) fn place_value(&self, ms: &MemberState, place: &Place) -> TypedValue {
        let root = match &place.root {
            Root::Boxed(r) => r.get(),
            other => self.root_value(ms, other),
        };
        place.path.iter().fold(root, |value, key| {
            value.with_cell(|cell| match cell {
                TypedValue::Array(arr) => arr.get(key).cloned().unwrap_or(TypedValue::Null),
                _ => TypedValue::Null,
            })
        })
    }

    /// The copy taken to compute the shape is released before returning, so
    /// a single-owner string stays single-owner
    fn place_shape(&self, ms: &MemberState, place: &Place) -> Shape {
        let value = self.place_value(ms, place);
        Shape::of(&value)
    }

    /// Box the value at a place, returning the shared cell
    pub(crate) fn box_place(&mut self, ms: &mut MemberState, place: &Place) -> Rc<RefData> {
        self.with_slot(ms, place, TypedValue::box_in_place)
    }

    fn require_array_access(&self, obj: &ObjectData) -> Result<(), VmError> {
        if obj.class.implements_array_access() {
            Ok(())
        } else {
            Err(VmError::fatal("Object does not implement ArrayAccess"))
        }
    }

    fn obj_offset_get(
        &mut self,
        ms: &mut MemberState,
        obj: &Rc<ObjectData>,
        key: &TypedValue,
        validate: bool,
    ) -> Result<Place, VmError> {
        if validate {
            self.require_array_access(obj)?;
        }
        let value = self.invoke_method(obj, "offsetGet", &[key.to_cell()])?;
        ms.tv_ref.assign(value.into_cell());
        Ok(Place::root(Root::TvRef))
    }

    fn obj_offset_set(
        &mut self,
        obj: &Rc<ObjectData>,
        key: &TypedValue,
        value: &TypedValue,
        validate: bool,
    ) -> Result<(), VmError> {
        if validate {
            self.require_array_access(obj)?;
        }
        self.invoke_method(obj, "offsetSet", &[key.to_cell(), value.to_cell()])?;
        Ok(())
    }

    fn obj_offset_exists(&mut self, obj: &Rc<ObjectData>, key: &TypedValue) -> Result<bool, VmError> {
        self.require_array_access(obj)?;
        let result = self.invoke_method(obj, "offsetExists", &[key.to_cell()])?;
        Ok(result.to_bool())
    }

    fn obj_offset_unset(&mut self, obj: &Rc<ObjectData>, key: &TypedValue) -> Result<(), VmError> {
        self.require_array_access(obj)?;
        self.invoke_method(obj, "offsetUnset", &[key.to_cell()])?;
        Ok(())
    }

    /// Replace the base with a fresh array holding null under `key`
    fn autovivify(
        &mut self,
        ms: &mut MemberState,
        base: &Place,
        key: &TypedValue,
        warn: bool,
    ) -> Result<Place, VmError> {
        let Some(k) = key.to_array_key() else {
            self.raise_warning("Illegal offset type")?;
            return Ok(ms.scratch(TypedValue::Uninit));
        };
        let fresh = new_array_with(k.clone(), TypedValue::Null);
        self.with_place(ms, base, |slot| slot.set_cell(fresh));
        if warn {
            self.raise_notice(format!("Undefined index: {}", key_display(key)))?;
        }
        Ok(base.child(k))
    }

    /// `$base[$key]` for reading
    pub(crate) fn elem(
        &mut self,
        ms: &mut MemberState,
        base: &Place,
        key: &TypedValue,
        warn: bool,
    ) -> Result<Place, VmError> {
        let value = self.place_value(ms, base).into_cell();
        match &value {
            TypedValue::StaticString(_) | TypedValue::String(_) => {
                if ms.base_str_off {
                    return Err(VmError::fatal("Cannot use string offset as an array"));
                }
                let bytes = value.str_bytes().unwrap_or_default();
                let x = key.to_int();
                let result = if x < 0 || x as usize >= bytes.len() {
                    if warn {
                        self.raise_warning("Out of bounds")?;
                    }
                    TypedValue::string("")
                } else {
                    TypedValue::string(vec![bytes[x as usize]])
                };
                ms.base_str_off = true;
                Ok(ms.scratch(result))
            }
            TypedValue::Array(arr) => match key.to_array_key() {
                Some(k) if arr.exists(&k) => Ok(base.child(k)),
                Some(_) => {
                    if warn {
                        self.raise_notice(format!("Undefined index: {}", key_display(key)))?;
                    }
                    Ok(ms.scratch(TypedValue::Null))
                }
                None => {
                    self.raise_warning("Illegal offset type")?;
                    Ok(ms.scratch(TypedValue::Null))
                }
            },
            TypedValue::Object(obj) => {
                let obj = obj.clone();
                drop(value);
                self.obj_offset_get(ms, &obj, key, true)
            }
            _ => Ok(ms.scratch(TypedValue::Null)),
        }
    }

    /// Element of an array base, created when missing
    fn elem_d_array(
        &mut self,
        ms: &mut MemberState,
        base: &Place,
        key: &TypedValue,
        warn: bool,
    ) -> Result<Place, VmError> {
        let Some(k) = key.to_array_key() else {
            self.raise_warning("Illegal offset type")?;
            return Ok(ms.scratch(TypedValue::Uninit));
        };
        let defined = self.with_place(ms, base, |slot| {
            slot.with_cell_mut(|cell| match cell {
                TypedValue::Array(arr) => {
                    if arr.exists(&k) {
                        true
                    } else {
                        Rc::make_mut(arr).lval(k.clone());
                        false
                    }
                }
                _ => true,
            })
        });
        if warn && !defined {
            self.raise_notice(format!("Undefined index: {}", key_display(key)))?;
        }
        Ok(base.child(k))
    }

    /// `$base[$key]` as the target of a write
    pub(crate) fn elem_d(
        &mut self,
        ms: &mut MemberState,
        base: &Place,
        key: &TypedValue,
        warn: bool,
    ) -> Result<Place, VmError> {
        match self.place_shape(ms, base) {
            shape if shape.is_emptyish() => self.autovivify(ms, base, key, warn),
            Shape::Str { .. } => Err(VmError::fatal("Operator not supported for strings")),
            Shape::Array => self.elem_d_array(ms, base, key, warn),
            Shape::Object(obj) => self.obj_offset_get(ms, &obj, key, true),
            _ => {
                self.raise_warning(SCALAR_AS_ARRAY)?;
                Ok(ms.scratch(TypedValue::Uninit))
            }
        }
    }

    /// `$base[$key]` on the way to an unset; nothing is created
    pub(crate) fn elem_u(
        &mut self,
        ms: &mut MemberState,
        base: &Place,
        key: &TypedValue,
    ) -> Result<Place, VmError> {
        let value = self.place_value(ms, base).into_cell();
        match &value {
            TypedValue::StaticString(_) | TypedValue::String(_) => {
                Err(VmError::fatal("Operator not supported for strings"))
            }
            TypedValue::Array(arr) => match key.to_array_key() {
                Some(k) if arr.exists(&k) => Ok(base.child(k)),
                _ => Ok(ms.scratch(TypedValue::Uninit)),
            },
            TypedValue::Object(obj) => {
                let obj = obj.clone();
                drop(value);
                self.obj_offset_get(ms, &obj, key, true)
            }
            _ => Ok(ms.scratch(TypedValue::Uninit)),
        }
    }

    /// `$base[]` as the target of a write
    pub(crate) fn new_elem(&mut self, ms: &mut MemberState, base: &Place) -> Result<Place, VmError> {
        match self.place_shape(ms, base) {
            shape if shape.is_emptyish() => {
                let fresh = new_array_with(ArrayKey::Int(0), TypedValue::Null);
                self.with_place(ms, base, |slot| slot.set_cell(fresh));
                Ok(base.child(ArrayKey::Int(0)))
            }
            Shape::Array => {
                let appended = self.with_place(ms, base, |slot| {
                    slot.with_cell_mut(|cell| match cell {
                        TypedValue::Array(arr) => Rc::make_mut(arr).append(TypedValue::Null),
                        _ => None,
                    })
                });
                match appended {
                    Some(k) => Ok(base.child(k)),
                    None => {
                        self.raise_warning(
                            "Cannot add element to the array as the next element is already occupied",
                        )?;
                        Ok(ms.scratch(TypedValue::Uninit))
                    }
                }
            }
            Shape::Object(obj) => self.obj_offset_get(ms, &obj, &TypedValue::Null, true),
            _ => {
                self.raise_warning("Invalid NewElem operand")?;
                Ok(ms.scratch(TypedValue::Uninit))
            }
        }
    }

    fn prop_on_non_object(&mut self, ms: &mut MemberState, warn: bool) -> Result<Place, VmError> {
        if warn {
            self.raise_warning(PROP_ON_NON_OBJECT)?;
        }
        Ok(ms.scratch(TypedValue::Null))
    }

    /// Replace an emptyish base with a fresh `stdClass`
    fn promote_to_std_class(
        &mut self,
        ms: &mut MemberState,
        base: &Place,
    ) -> Result<Rc<ObjectData>, VmError> {
        let obj = self.new_std_class()?;
        let value = TypedValue::Object(obj.clone());
        self.with_place(ms, base, |slot| slot.set_cell(value));
        Ok(obj)
    }

    /// `$base->$key` as an intermediate step
    pub(crate) fn prop(
        &mut self,
        ms: &mut MemberState,
        base: &Place,
        key: &TypedValue,
        ctx: Option<&Arc<Class>>,
        access: Access,
    ) -> Result<Place, VmError> {
        let warn = access.warn();
        let define = matches!(access, Access::Define { .. });
        let obj = match self.place_shape(ms, base) {
            Shape::Object(obj) => obj,
            shape if shape.is_emptyish() && define => {
                let obj = self.promote_to_std_class(ms, base)?;
                if warn {
                    self.raise_warning(PROP_ON_NON_OBJECT)?;
                }
                obj
            }
            _ => return self.prop_on_non_object(ms, warn),
        };
        let name: PropName = Rc::from(key.to_string_bytes());
        self.check_prop_access(&obj.class, &name, ctx.map(|c| c.as_ref()))?;
        let exists = obj.props.borrow().contains_key(&name[..]);
        if exists {
            return Ok(Place::root(Root::Prop(obj, name)));
        }
        match access {
            Access::Define { .. } => {
                obj.props.borrow_mut().insert(name.clone(), TypedValue::Null);
                Ok(Place::root(Root::Prop(obj, name)))
            }
            Access::Unset => Ok(ms.scratch(TypedValue::Uninit)),
            Access::Read { warn } => {
                if warn {
                    self.raise_notice(format!(
                        "Undefined property: {}::${}",
                        obj.class_name(),
                        String::from_utf8_lossy(&name)
                    ))?;
                }
                Ok(ms.scratch(TypedValue::Null))
            }
        }
    }

    /// Key cell of a member, consuming a stack cell for `EC`/`PC`
    fn member_key(
        &self,
        fp: usize,
        code: MemberCode,
        imm: MemberImm,
        depth: &mut usize,
    ) -> Result<Option<TypedValue>, VmError> {
        let key = match (code, imm) {
            (MemberCode::W, _) => return Ok(None),
            (MemberCode::EC | MemberCode::PC, _) => {
                let d = *depth;
                *depth = d.saturating_sub(1);
                self.stack
                    .ind(d)
                    .map(TypedValue::to_cell)
                    .ok_or(VmError::stack_underflow("member key"))?
            }
            (_, MemberImm::Local(id)) => {
                let ar = &self.frames[fp];
                self.stack.at(ar.local_index(id as usize)).to_cell()
            }
            (_, MemberImm::Str(id)) => {
                TypedValue::StaticString(self.frames[fp].func.unit.litstr(id)?.clone())
            }
            (_, MemberImm::Int(i)) => TypedValue::Int(i),
            (_, MemberImm::None) => {
                return Err(VmError::invalid_bytecode(self.op_start, "member without key"));
            }
        };
        Ok(Some(key))
    }

    /// Base of a member vector. `depth` points at the deepest vector cell
    /// and is moved past every cell consumed.
    fn member_base(
        &mut self,
        ms: &mut MemberState,
        mv: &MemberVector,
        depth: &mut usize,
        access: Access,
    ) -> Result<Place, VmError> {
        let fp = self.fp()?;
        let warn = access.warn();
        let define = matches!(access, Access::Define { .. });
        let local_cell = |vm: &VM| -> TypedValue {
            let id = mv.loc_local.unwrap_or(0) as usize;
            vm.stack.at(vm.frames[fp].local_index(id)).to_cell()
        };
        let mut take = || {
            let d = *depth;
            *depth = d.saturating_sub(1);
            d
        };

        let root = match mv.location {
            LocationCode::L => {
                let id = mv.loc_local.unwrap_or(0) as usize;
                let slot = self.frames[fp].local_index(id);
                if warn && self.stack.at(slot).is_uninit() {
                    let name = self.frames[fp].func.local_names.get(id).cloned();
                    self.raise_notice(format!(
                        "Undefined variable: {}",
                        name.as_deref().unwrap_or_default()
                    ))?;
                }
                Root::Var(VarLoc::Slot(slot))
            }
            LocationCode::C | LocationCode::R => Root::Stack(self.stack.index_of(take())),
            LocationCode::NL | LocationCode::NC | LocationCode::GL | LocationCode::GC => {
                let name_cell = match mv.location {
                    LocationCode::NL | LocationCode::GL => local_cell(self),
                    _ => self.stack.at(self.stack.index_of(take())).to_cell(),
                };
                let name = name_cell.to_string_bytes();
                let found = if matches!(mv.location, LocationCode::NL | LocationCode::NC) {
                    self.lookup_var(fp, &name, define)
                } else {
                    self.lookup_global(&name, define)
                };
                match found {
                    Some(loc) => Root::Var(loc),
                    None => {
                        if warn {
                            self.raise_notice(format!(
                                "Undefined variable: {}",
                                String::from_utf8_lossy(&name)
                            ))?;
                        }
                        ms.dummy.assign(TypedValue::Null);
                        Root::Dummy
                    }
                }
            }
            LocationCode::SL | LocationCode::SC => {
                // the class is always the topmost vector cell
                let cls = match self.stack.ind(0) {
                    Some(TypedValue::Class(cls)) => cls.clone(),
                    _ => {
                        return Err(VmError::invalid_bytecode(
                            self.op_start,
                            "static property base without a class",
                        ));
                    }
                };
                let name_cell = match mv.location {
                    LocationCode::SL => local_cell(self),
                    _ => self.stack.at(self.stack.index_of(take())).to_cell(),
                };
                let name = name_cell.to_string_bytes();
                let ctx = self.context_class();
                let (decl, prop) = self.lookup_static_prop(&cls, &name, ctx.as_deref())?;
                self.context.static_prop_mut(&cls, &prop);
                Root::StaticProp(decl, prop)
            }
            LocationCode::H => match self.this() {
                Some(obj) => {
                    ms.dummy.assign(TypedValue::Object(obj));
                    Root::Dummy
                }
                None => return Err(VmError::fatal("Using $this when not in object context")),
            },
        };
        Ok(Place::root(root))
    }

    /// Resolve a member vector whose cells are on top of the stack. With
    /// `leave_last` the final member is returned unprocessed.
    pub(crate) fn resolve_vector(
        &mut self,
        ms: &mut MemberState,
        mv: &MemberVector,
        access: Access,
        leave_last: bool,
    ) -> Result<Resolved, VmError> {
        let fp = self.fp()?;
        let mut depth = (mv.num_stack as usize).saturating_sub(1);
        let mut place = self.member_base(ms, mv, &mut depth, access)?;
        let ctx = self.context_class();
        let count = mv.members.len();

        for (i, &(code, imm)) in mv.members.iter().enumerate() {
            let key = self.member_key(fp, code, imm, &mut depth)?;
            if leave_last && i + 1 == count {
                return Ok(Resolved {
                    place,
                    last: Some((code, key)),
                    aborted: false,
                });
            }
            let key_cell = key.unwrap_or_default();
            let mut result = if code == MemberCode::W {
                match access {
                    Access::Define { .. } => self.new_elem(ms, &place)?,
                    Access::Read { .. } => return Err(VmError::fatal("Cannot use [] for reading")),
                    Access::Unset => return Err(VmError::fatal("Cannot use [] for unsetting")),
                }
            } else if code.is_prop() {
                self.prop(ms, &place, &key_cell, ctx.as_ref(), access)?
            } else {
                match access {
                    Access::Read { warn } => self.elem(ms, &place, &key_cell, warn)?,
                    Access::Define { warn } => self.elem_d(ms, &place, &key_cell, warn)?,
                    Access::Unset => self.elem_u(ms, &place, &key_cell)?,
                }
            };
            ms.ratchet(&mut result);
            if !matches!(access, Access::Read { .. }) && ms.aborted(&result) {
                return Ok(Resolved {
                    place: result,
                    last: None,
                    aborted: true,
                });
            }
            place = result;
        }
        Ok(Resolved {
            place,
            last: None,
            aborted: false,
        })
    }

    /// Apply `op` to the value at a place, storing and returning the result
    fn set_op_at(
        &mut self,
        ms: &mut MemberState,
        place: &Place,
        op: BinaryOp,
        rhs: &TypedValue,
    ) -> Result<TypedValue, VmError> {
        let old = self.place_value(ms, place).into_cell();
        let new = self.binary_op(op, &old, rhs)?;
        let stored = new.clone();
        self.with_place(ms, place, |slot| slot.set_cell(stored));
        Ok(new)
    }

    fn inc_dec_at(&mut self, ms: &mut MemberState, place: &Place, op: IncDecOp) -> TypedValue {
        self.with_place(ms, place, |slot| inc_dec_cell(op, slot))
    }

    fn set_string_offset(
        &mut self,
        ms: &mut MemberState,
        base: &Place,
        key: &TypedValue,
        value: TypedValue,
    ) -> Result<TypedValue, VmError> {
        let x = key.to_int();
        if x < 0 {
            self.raise_warning(format!("Illegal string offset: {}", x))?;
            return Ok(value);
        }
        if x >= i32::MAX as i64 {
            return Err(VmError::fatal("Out of memory"));
        }
        let x = x as usize;
        let y = value.to_string_bytes().first().copied().unwrap_or(0);
        self.with_place(ms, base, |slot| {
            slot.with_cell_mut(|cell| {
                if let TypedValue::String(s) = cell {
                    if x < s.len() {
                        if let Some(buf) = Rc::get_mut(s) {
                            buf[x] = y;
                            return;
                        }
                    }
                }
                let mut bytes = cell.str_bytes().map(<[u8]>::to_vec).unwrap_or_default();
                if x >= bytes.len() {
                    bytes.resize(x, b' ');
                    bytes.push(y);
                } else {
                    bytes[x] = y;
                }
                cell.assign(TypedValue::string(bytes));
            })
        });
        Ok(if y == 0 {
            TypedValue::string("")
        } else {
            TypedValue::string(vec![y])
        })
    }

    /// `$base[$key] = $value`; returns the expression's result
    pub(crate) fn set_elem(
        &mut self,
        ms: &mut MemberState,
        base: &Place,
        key: &TypedValue,
        value: TypedValue,
    ) -> Result<TypedValue, VmError> {
        match self.place_shape(ms, base) {
            shape if shape.is_emptyish() => {
                let Some(k) = key.to_array_key() else {
                    self.raise_warning("Illegal offset type")?;
                    return Ok(TypedValue::Null);
                };
                let fresh = new_array_with(k, value.clone());
                self.with_place(ms, base, |slot| slot.set_cell(fresh));
                Ok(value)
            }
            Shape::Str { .. } => self.set_string_offset(ms, base, key, value),
            Shape::Array => {
                let Some(k) = key.to_array_key() else {
                    self.raise_warning("Illegal offset type")?;
                    return Ok(TypedValue::Null);
                };
                let stored = value.clone();
                self.with_place(ms, base, |slot| {
                    slot.with_cell_mut(|cell| {
                        if let TypedValue::Array(arr) = cell {
                            Rc::make_mut(arr).set(k, stored);
                        }
                    })
                });
                Ok(value)
            }
            Shape::Object(obj) => {
                self.obj_offset_set(&obj, key, &value, true)?;
                Ok(value)
            }
            _ => {
                self.raise_warning(SCALAR_AS_ARRAY)?;
                Ok(TypedValue::Null)
            }
        }
    }

    /// `$base[] = $value`
    pub(crate) fn set_new_elem(
        &mut self,
        ms: &mut MemberState,
        base: &Place,
        value: TypedValue,
    ) -> Result<TypedValue, VmError> {
        match self.place_shape(ms, base) {
            shape if shape.is_emptyish() => {
                let fresh = new_array_with(ArrayKey::Int(0), value.clone());
                self.with_place(ms, base, |slot| slot.set_cell(fresh));
                Ok(value)
            }
            Shape::Str { .. } => Err(VmError::fatal("[] operator not supported for strings")),
            Shape::Array => {
                let stored = value.clone();
                let appended = self.with_place(ms, base, |slot| {
                    slot.with_cell_mut(|cell| match cell {
                        TypedValue::Array(arr) => Rc::make_mut(arr).append(stored).is_some(),
                        _ => true,
                    })
                });
                if !appended {
                    self.raise_warning(
                        "Cannot add element to the array as the next element is already occupied",
                    )?;
                }
                Ok(value)
            }
            Shape::Object(obj) => {
                self.obj_offset_set(&obj, &TypedValue::Null, &value, true)?;
                Ok(value)
            }
            _ => {
                self.raise_warning(SCALAR_AS_ARRAY)?;
                Ok(TypedValue::Null)
            }
        }
    }

    /// `$base[$key] <op>= $rhs`
    pub(crate) fn set_op_elem(
        &mut self,
        ms: &mut MemberState,
        op: BinaryOp,
        base: &Place,
        key: &TypedValue,
        rhs: &TypedValue,
    ) -> Result<TypedValue, VmError> {
        match self.place_shape(ms, base) {
            Shape::Str { empty: false } => Err(VmError::fatal("Invalid SetOpElem operand")),
            Shape::Object(obj) => {
                let target = self.obj_offset_get(ms, &obj, key, true)?;
                let result = self.set_op_at(ms, &target, op, rhs)?;
                self.obj_offset_set(&obj, key, &result, false)?;
                Ok(result)
            }
            shape if shape.is_emptyish() || matches!(shape, Shape::Array) => {
                let strict = self.options.strict_warnings;
                let target = self.elem_d(ms, base, key, strict)?;
                if ms.aborted(&target) {
                    return Ok(TypedValue::Null);
                }
                self.set_op_at(ms, &target, op, rhs)
            }
            _ => {
                self.raise_warning(SCALAR_AS_ARRAY)?;
                Ok(TypedValue::Null)
            }
        }
    }

    /// `$base[] <op>= $rhs`
    pub(crate) fn set_op_new_elem(
        &mut self,
        ms: &mut MemberState,
        op: BinaryOp,
        base: &Place,
        rhs: &TypedValue,
    ) -> Result<TypedValue, VmError> {
        match self.place_shape(ms, base) {
            Shape::Str { empty: false } => Err(VmError::fatal("[] operator not supported for strings")),
            Shape::Object(obj) => {
                let target = self.obj_offset_get(ms, &obj, &TypedValue::Null, true)?;
                let result = self.set_op_at(ms, &target, op, rhs)?;
                self.obj_offset_set(&obj, &TypedValue::Null, &result, false)?;
                Ok(result)
            }
            shape if shape.is_emptyish() || matches!(shape, Shape::Array) => {
                let target = self.new_elem(ms, base)?;
                if ms.aborted(&target) {
                    return Ok(TypedValue::Null);
                }
                self.set_op_at(ms, &target, op, rhs)
            }
            _ => {
                self.raise_warning(SCALAR_AS_ARRAY)?;
                Ok(TypedValue::Null)
            }
        }
    }

    /// `$base[$key]++` and friends. Objects only see `offsetGet`: the
    /// updated temporary is not written back.
    pub(crate) fn inc_dec_elem(
        &mut self,
        ms: &mut MemberState,
        op: IncDecOp,
        base: &Place,
        key: &TypedValue,
    ) -> Result<TypedValue, VmError> {
        match self.place_shape(ms, base) {
            Shape::Str { empty: false } => Err(VmError::fatal("Invalid IncDecElem operand")),
            Shape::Object(obj) => {
                let target = self.obj_offset_get(ms, &obj, key, true)?;
                Ok(self.inc_dec_at(ms, &target, op))
            }
            shape if shape.is_emptyish() || matches!(shape, Shape::Array) => {
                let strict = self.options.strict_warnings;
                let target = self.elem_d(ms, base, key, strict)?;
                if ms.aborted(&target) {
                    return Ok(TypedValue::Null);
                }
                Ok(self.inc_dec_at(ms, &target, op))
            }
            _ => {
                self.raise_warning(SCALAR_AS_ARRAY)?;
                Ok(TypedValue::Null)
            }
        }
    }

    pub(crate) fn inc_dec_new_elem(
        &mut self,
        ms: &mut MemberState,
        op: IncDecOp,
        base: &Place,
    ) -> Result<TypedValue, VmError> {
        match self.place_shape(ms, base) {
            Shape::Str { empty: false } => Err(VmError::fatal("Invalid IncDecNewElem operand")),
            Shape::Object(obj) => {
                let target = self.obj_offset_get(ms, &obj, &TypedValue::Null, true)?;
                Ok(self.inc_dec_at(ms, &target, op))
            }
            shape if shape.is_emptyish() || matches!(shape, Shape::Array) => {
                let target = self.new_elem(ms, base)?;
                if ms.aborted(&target) {
                    return Ok(TypedValue::Null);
                }
                Ok(self.inc_dec_at(ms, &target, op))
            }
            _ => {
                self.raise_warning(SCALAR_AS_ARRAY)?;
                Ok(TypedValue::Null)
            }
        }
    }

    /// `unset($base[$key])`
    pub(crate) fn unset_elem(
        &mut self,
        ms: &mut MemberState,
        base: &Place,
        key: &TypedValue,
    ) -> Result<(), VmError> {
        let value = self.place_value(ms, base).into_cell();
        match &value {
            TypedValue::StaticString(_) | TypedValue::String(_) => {
                Err(VmError::fatal("Cannot unset string offsets"))
            }
            TypedValue::Array(arr) => {
                let Some(k) = key.to_array_key() else {
                    return Ok(());
                };
                if !arr.exists(&k) {
                    return Ok(());
                }
                drop(value);
                self.with_place(ms, base, |slot| {
                    slot.with_cell_mut(|cell| {
                        if let TypedValue::Array(arr) = cell {
                            Rc::make_mut(arr).remove(&k);
                        }
                    })
                });
                Ok(())
            }
            TypedValue::Object(obj) => {
                let obj = obj.clone();
                drop(value);
                self.obj_offset_unset(&obj, key)
            }
            _ => Ok(()),
        }
    }

    /// `isset($base[$key])` / `empty($base[$key])`
    pub(crate) fn isset_empty_elem(
        &mut self,
        ms: &mut MemberState,
        base: &Place,
        key: &TypedValue,
        use_empty: bool,
    ) -> Result<bool, VmError> {
        let value = self.place_value(ms, base).into_cell();
        let result = match &value {
            TypedValue::StaticString(_) | TypedValue::String(_) => {
                if ms.base_str_off {
                    return Ok(use_empty);
                }
                let bytes = value.str_bytes().unwrap_or_default();
                let x = key.to_int();
                if x < 0 || x as usize >= bytes.len() {
                    return Ok(use_empty);
                }
                if !use_empty {
                    return Ok(true);
                }
                TypedValue::string(vec![bytes[x as usize]])
            }
            TypedValue::Array(arr) => key
                .to_array_key()
                .and_then(|k| arr.get(&k).cloned())
                .unwrap_or(TypedValue::Null),
            TypedValue::Object(obj) => {
                let obj = obj.clone();
                if !use_empty {
                    return self.obj_offset_exists(&obj, key);
                }
                if !self.obj_offset_exists(&obj, key)? {
                    return Ok(true);
                }
                let target = self.obj_offset_get(ms, &obj, key, false)?;
                self.place_value(ms, &target)
            }
            _ => return Ok(use_empty),
        };
        Ok(if use_empty {
            !result.to_bool()
        } else {
            !result.to_cell().is_null()
        })
    }

    /// `isset($base->$key)` / `empty($base->$key)`; inaccessible counts as unset
    pub(crate) fn isset_empty_prop(
        &mut self,
        ms: &mut MemberState,
        base: &Place,
        key: &TypedValue,
        ctx: Option<&Arc<Class>>,
        use_empty: bool,
    ) -> Result<bool, VmError> {
        let Shape::Object(obj) = self.place_shape(ms, base) else {
            return Ok(use_empty);
        };
        let name = key.to_string_bytes();
        if self
            .check_prop_access(&obj.class, &name, ctx.map(|c| c.as_ref()))
            .is_err()
        {
            return Ok(use_empty);
        }
        Ok(match obj.get_prop(&name) {
            None => use_empty,
            Some(v) if use_empty => !v.to_bool(),
            Some(v) => !v.to_cell().is_null(),
        })
    }

    /// `$base->$key = $value`
    pub(crate) fn set_prop(
        &mut self,
        ms: &mut MemberState,
        base: &Place,
        key: &TypedValue,
        ctx: Option<&Arc<Class>>,
        value: TypedValue,
    ) -> Result<TypedValue, VmError> {
        let obj = match self.place_shape(ms, base) {
            Shape::Object(obj) => {
                self.check_prop_access(&obj.class, &key.to_string_bytes(), ctx.map(|c| c.as_ref()))?;
                obj
            }
            shape if shape.is_emptyish() => self.promote_to_std_class(ms, base)?,
            _ => {
                self.raise_warning(PROP_ON_NON_OBJECT)?;
                return Ok(TypedValue::Null);
            }
        };
        obj.set_prop(&key.to_string_bytes(), value.clone());
        Ok(value)
    }

    /// `$base->$key <op>= $rhs`
    pub(crate) fn set_op_prop(
        &mut self,
        ms: &mut MemberState,
        op: BinaryOp,
        base: &Place,
        key: &TypedValue,
        ctx: Option<&Arc<Class>>,
        rhs: &TypedValue,
    ) -> Result<TypedValue, VmError> {
        let name = key.to_string_bytes();
        let (obj, old) = match self.place_shape(ms, base) {
            Shape::Object(obj) => {
                self.check_prop_access(&obj.class, &name, ctx.map(|c| c.as_ref()))?;
                let old = match obj.get_prop(&name) {
                    Some(v) => v.into_cell(),
                    None => {
                        self.raise_notice(format!(
                            "Undefined property: {}::${}",
                            obj.class_name(),
                            String::from_utf8_lossy(&name)
                        ))?;
                        TypedValue::Null
                    }
                };
                (obj, old)
            }
            shape if shape.is_emptyish() => (self.promote_to_std_class(ms, base)?, TypedValue::Null),
            _ => {
                self.raise_warning("Attempt to assign property of non-object")?;
                return Ok(TypedValue::Null);
            }
        };
        let new = self.binary_op(op, &old, rhs)?;
        obj.set_prop(&name, new.clone());
        Ok(new)
    }

    /// `$base->$key++` and friends
    pub(crate) fn inc_dec_prop(
        &mut self,
        ms: &mut MemberState,
        op: IncDecOp,
        base: &Place,
        key: &TypedValue,
        ctx: Option<&Arc<Class>>,
    ) -> Result<TypedValue, VmError> {
        let name: PropName = Rc::from(key.to_string_bytes());
        let obj = match self.place_shape(ms, base) {
            Shape::Object(obj) => {
                self.check_prop_access(&obj.class, &name, ctx.map(|c| c.as_ref()))?;
                if !obj.props.borrow().contains_key(&name[..]) {
                    self.raise_notice(format!(
                        "Undefined property: {}::${}",
                        obj.class_name(),
                        String::from_utf8_lossy(&name)
                    ))?;
                    obj.props.borrow_mut().insert(name.clone(), TypedValue::Null);
                }
                obj
            }
            shape if shape.is_emptyish() => {
                let obj = self.promote_to_std_class(ms, base)?;
                obj.props.borrow_mut().insert(name.clone(), TypedValue::Null);
                obj
            }
            _ => {
                self.raise_warning("Attempt to increment/decrement property of non-object")?;
                return Ok(TypedValue::Null);
            }
        };
        let target = Place::root(Root::Prop(obj, name));
        Ok(self.inc_dec_at(ms, &target, op))
    }

    /// `unset($base->$key)`
    pub(crate) fn unset_prop(
        &mut self,
        ms: &mut MemberState,
        base: &Place,
        key: &TypedValue,
        ctx: Option<&Arc<Class>>,
    ) -> Result<(), VmError> {
        let Shape::Object(obj) = self.place_shape(ms, base) else {
            return Ok(());
        };
        let name = key.to_string_bytes();
        self.check_prop_access(&obj.class, &name, ctx.map(|c| c.as_ref()))?;
        let removed = obj.props.borrow_mut().shift_remove(name.as_slice());
        drop(removed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj_value() -> TypedValue {
        TypedValue::string("stand-in")
    }

    #[test]
    fn ratchet_keeps_one_temporary_alive() {
        let mut ms = MemberState::default();
        let mut place = Place::root(Root::TvRef);

        ms.tv_ref = obj_value();
        ms.ratchet(&mut place);
        assert!(matches!(place.root, Root::TvRef2));
        assert!(ms.tv_ref.is_uninit());
        assert_eq!(ms.tv_ref2, obj_value());

        // a second temporary releases the first
        let first = TypedValue::string("first");
        ms.tv_ref2 = first.clone();
        assert_eq!(first.refcount(), 2);
        ms.tv_ref = TypedValue::Int(2);
        let mut next = Place::root(Root::TvRef);
        ms.ratchet(&mut next);
        assert_eq!(first.refcount(), 1);
        assert_eq!(ms.tv_ref2, TypedValue::Int(2));

        // nothing new: nothing moves
        let mut other = Place::root(Root::Scratch);
        ms.ratchet(&mut other);
        assert!(matches!(other.root, Root::Scratch));
        assert_eq!(ms.tv_ref2, TypedValue::Int(2));
    }

    #[test]
    fn ratchet_moves_paths_rooted_in_the_temporary() {
        let mut ms = MemberState::default();
        ms.tv_ref = TypedValue::empty_array();
        let mut place = Place::root(Root::TvRef).child(ArrayKey::Int(0));
        ms.ratchet(&mut place);
        assert!(matches!(place.root, Root::TvRef2));
        assert_eq!(place.path.len(), 1);
    }

    #[test]
    fn descend_separates_shared_arrays() {
        let mut inner = ArrayData::new();
        inner.set(ArrayKey::Int(0), TypedValue::Int(1));
        let mut outer = ArrayData::new();
        outer.set(ArrayKey::Int(0), TypedValue::Array(Rc::new(inner)));
        let mut slot = TypedValue::Array(Rc::new(outer));
        let alias = slot.clone();

        descend(&mut slot, &[ArrayKey::Int(0), ArrayKey::Int(0)], |cell| {
            cell.set_cell(TypedValue::Int(9))
        });

        let read = |v: &TypedValue| {
            let a = v.as_array().unwrap().get(&ArrayKey::Int(0)).unwrap().clone();
            a.as_array().unwrap().get(&ArrayKey::Int(0)).unwrap().clone()
        };
        assert_eq!(read(&slot), TypedValue::Int(9));
        assert_eq!(read(&alias), TypedValue::Int(1));
    }

    #[test]
    fn descend_through_refs_and_missing_keys() {
        let mut arr = ArrayData::new();
        let shared = RefData::new(TypedValue::empty_array());
        arr.set(ArrayKey::Int(0), TypedValue::Ref(shared.clone()));
        let mut slot = TypedValue::Array(Rc::new(arr));

        // missing key: the write lands in a throwaway cell
        let hit = descend(&mut slot, &[ArrayKey::Int(5)], |cell| cell.is_null());
        assert!(hit);
        assert_eq!(slot.as_array().unwrap().len(), 1);

        descend(&mut slot, &[ArrayKey::Int(0)], |cell| {
            cell.set_cell(TypedValue::Int(3))
        });
        assert_eq!(shared.get(), TypedValue::Int(3));
    }

    #[test]
    fn shapes() {
        assert!(Shape::of(&TypedValue::Uninit).is_emptyish());
        assert!(Shape::of(&TypedValue::Bool(false)).is_emptyish());
        assert!(Shape::of(&TypedValue::string("")).is_emptyish());
        assert!(!Shape::of(&TypedValue::string("x")).is_emptyish());
        assert!(!Shape::of(&TypedValue::Bool(true)).is_emptyish());
        let boxed = TypedValue::Ref(RefData::new(TypedValue::Int(1)));
        assert!(matches!(Shape::of(&boxed), Shape::Number));
    }
}
