use std::fmt::{self, Display};
use std::sync::Arc;

use bitflags::bitflags;

use crate::index::ClassId;
use crate::util::float::F64;
use crate::value::{ArrKey, Val};

bitflags! {
    /// The primitive categories a value may inhabit. Every `Ty` is a finite
    /// union of these; specialization data refines the non-null part.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TyBits: u16 {
        const UNINIT = 1 << 0;
        const NULL   = 1 << 1;
        const FALSE  = 1 << 2;
        const TRUE   = 1 << 3;
        const INT    = 1 << 4;
        const DBL    = 1 << 5;
        const STR    = 1 << 6;
        const LIST   = 1 << 7;
        const DICT   = 1 << 8;
        const OBJ    = 1 << 9;
        const CLS    = 1 << 10;
        const REF    = 1 << 11;

        const BOOL = Self::FALSE.bits() | Self::TRUE.bits();
        const NUM = Self::INT.bits() | Self::DBL.bits();
        const ARR = Self::LIST.bits() | Self::DICT.bits();
        const ARR_KEY = Self::INT.bits() | Self::STR.bits();
        const INIT_PRIM = Self::NULL.bits() | Self::BOOL.bits() | Self::NUM.bits();
        const INIT_CELL = Self::INIT_PRIM.bits()
            | Self::STR.bits()
            | Self::ARR.bits()
            | Self::OBJ.bits();
        const CELL = Self::UNINIT.bits() | Self::INIT_CELL.bits();
        const INIT_GEN = Self::INIT_CELL.bits() | Self::REF.bits();
        const GEN = Self::CELL.bits() | Self::REF.bits();
        const TOP = Self::GEN.bits() | Self::CLS.bits();
    }
}

/// An object or class-reference specialization: a known class, either
/// exactly or as an upper bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClsSpec {
    pub cls: ClassId,
    pub exact: bool,
}

/// Shape information for an array-typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrTy {
    /// Exactly this literal array.
    Lit(Val),
    /// A packed array of known length with per-element types.
    Tuple(Arc<[Ty]>),
    /// A packed array of unknown length.
    ListOf(Arc<Ty>),
    /// A keyed array with known key and value categories.
    MapOf(Arc<(Ty, Ty)>),
}

#[derive(Debug, Clone, PartialEq)]
enum TyData {
    Int(i64),
    Dbl(F64),
    Str(Arc<str>),
    Arr(ArrTy),
    Obj(ClsSpec),
    Cls(ClsSpec),
}

impl TyData {
    /// The category bits this datum is able to describe.
    fn carrier(&self) -> TyBits {
        match self {
            Self::Int(_) => TyBits::INT,
            Self::Dbl(_) => TyBits::DBL,
            Self::Str(_) => TyBits::STR,
            Self::Arr(ArrTy::Lit(Val::Dict(_))) => TyBits::DICT,
            Self::Arr(ArrTy::Lit(_)) | Self::Arr(ArrTy::Tuple(_)) | Self::Arr(ArrTy::ListOf(_)) => {
                TyBits::LIST
            }
            Self::Arr(ArrTy::MapOf(_)) => TyBits::ARR,
            Self::Obj(_) => TyBits::OBJ,
            Self::Cls(_) => TyBits::CLS,
        }
    }
}

/// A lattice value over the runtime representations a stack slot or local
/// may hold. `bits` gives the categories; `data`, when present, refines
/// every non-null category bit (constants, array shapes, class bounds).
#[derive(Debug, Clone, PartialEq)]
pub struct Ty {
    bits: TyBits,
    data: Option<TyData>,
}

pub const TBOTTOM: Ty = Ty { bits: TyBits::empty(), data: None };
pub const TUNINIT: Ty = Ty { bits: TyBits::UNINIT, data: None };
pub const TINITNULL: Ty = Ty { bits: TyBits::NULL, data: None };
pub const TNULL: Ty = Ty { bits: TyBits::UNINIT.union(TyBits::NULL), data: None };
pub const TFALSE: Ty = Ty { bits: TyBits::FALSE, data: None };
pub const TTRUE: Ty = Ty { bits: TyBits::TRUE, data: None };
pub const TBOOL: Ty = Ty { bits: TyBits::BOOL, data: None };
pub const TINT: Ty = Ty { bits: TyBits::INT, data: None };
pub const TDBL: Ty = Ty { bits: TyBits::DBL, data: None };
pub const TNUM: Ty = Ty { bits: TyBits::NUM, data: None };
pub const TSTR: Ty = Ty { bits: TyBits::STR, data: None };
pub const TARRKEY: Ty = Ty { bits: TyBits::ARR_KEY, data: None };
pub const TLIST: Ty = Ty { bits: TyBits::LIST, data: None };
pub const TDICT: Ty = Ty { bits: TyBits::DICT, data: None };
pub const TARR: Ty = Ty { bits: TyBits::ARR, data: None };
pub const TOBJ: Ty = Ty { bits: TyBits::OBJ, data: None };
pub const TOPTOBJ: Ty = Ty { bits: TyBits::NULL.union(TyBits::OBJ), data: None };
pub const TCLS: Ty = Ty { bits: TyBits::CLS, data: None };
pub const TREF: Ty = Ty { bits: TyBits::REF, data: None };
pub const TINITPRIM: Ty = Ty { bits: TyBits::INIT_PRIM, data: None };
pub const TINITCELL: Ty = Ty { bits: TyBits::INIT_CELL, data: None };
pub const TCELL: Ty = Ty { bits: TyBits::CELL, data: None };
pub const TINITGEN: Ty = Ty { bits: TyBits::INIT_GEN, data: None };
pub const TGEN: Ty = Ty { bits: TyBits::GEN, data: None };
pub const TTOP: Ty = Ty { bits: TyBits::TOP, data: None };

fn norm(bits: TyBits, data: Option<TyData>) -> Ty {
    let data = data.filter(|d| {
        let carrier = d.carrier();
        bits.intersects(carrier)
            && (bits - carrier - TyBits::NULL - TyBits::UNINIT).is_empty()
    });
    Ty { bits, data }
}

pub fn ival(v: i64) -> Ty {
    Ty { bits: TyBits::INT, data: Some(TyData::Int(v)) }
}

pub fn dval(v: f64) -> Ty {
    Ty { bits: TyBits::DBL, data: Some(TyData::Dbl(v.into())) }
}

pub fn sval(s: impl Into<Arc<str>>) -> Ty {
    Ty { bits: TyBits::STR, data: Some(TyData::Str(s.into())) }
}

pub fn bval(b: bool) -> Ty {
    if b { TTRUE } else { TFALSE }
}

/// The type of exactly this literal array. Panics on a non-array value.
pub fn aval(v: Val) -> Ty {
    let bits = match &v {
        Val::List(_) => TyBits::LIST,
        Val::Dict(_) => TyBits::DICT,
        _ => panic!("aval: not an array value: {v}"),
    };
    Ty { bits, data: Some(TyData::Arr(ArrTy::Lit(v))) }
}

pub fn tuple(elems: Vec<Ty>) -> Ty {
    Ty { bits: TyBits::LIST, data: Some(TyData::Arr(ArrTy::Tuple(elems.into()))) }
}

pub fn list_of(elem: Ty) -> Ty {
    Ty { bits: TyBits::LIST, data: Some(TyData::Arr(ArrTy::ListOf(Arc::new(elem)))) }
}

pub fn dict_of(key: Ty, value: Ty) -> Ty {
    Ty { bits: TyBits::DICT, data: Some(TyData::Arr(ArrTy::MapOf(Arc::new((key, value))))) }
}

pub fn obj_exact(cls: ClassId) -> Ty {
    Ty { bits: TyBits::OBJ, data: Some(TyData::Obj(ClsSpec { cls, exact: true })) }
}

pub fn obj_sub(cls: ClassId) -> Ty {
    Ty { bits: TyBits::OBJ, data: Some(TyData::Obj(ClsSpec { cls, exact: false })) }
}

pub fn obj_of(spec: ClsSpec) -> Ty {
    Ty { bits: TyBits::OBJ, data: Some(TyData::Obj(spec)) }
}

pub fn cls_exact(cls: ClassId) -> Ty {
    Ty { bits: TyBits::CLS, data: Some(TyData::Cls(ClsSpec { cls, exact: true })) }
}

pub fn cls_sub(cls: ClassId) -> Ty {
    Ty { bits: TyBits::CLS, data: Some(TyData::Cls(ClsSpec { cls, exact: false })) }
}

pub fn from_val(v: &Val) -> Ty {
    match v {
        Val::Null => TINITNULL,
        Val::Bool(b) => bval(*b),
        Val::Int(i) => ival(*i),
        Val::Dbl(d) => Ty { bits: TyBits::DBL, data: Some(TyData::Dbl(*d)) },
        Val::Str(s) => sval(Arc::clone(s)),
        Val::List(_) | Val::Dict(_) => aval(v.clone()),
    }
}

impl Ty {
    pub fn bits(&self) -> TyBits {
        self.bits
    }

    pub fn is_bottom(&self) -> bool {
        self.bits.is_empty()
    }

    /// The concrete value this type denotes, if it denotes exactly one.
    pub fn as_const(&self) -> Option<Val> {
        if self.bits == TyBits::NULL {
            return Some(Val::Null);
        }
        if self.bits == TyBits::FALSE {
            return Some(Val::Bool(false));
        }
        if self.bits == TyBits::TRUE {
            return Some(Val::Bool(true));
        }

        if self.bits != self.data.as_ref()?.carrier() {
            return None;
        }

        match self.data.as_ref()? {
            TyData::Int(v) => Some(Val::Int(*v)),
            TyData::Dbl(v) => Some(Val::Dbl(*v)),
            TyData::Str(s) => Some(Val::Str(Arc::clone(s))),
            TyData::Arr(ArrTy::Lit(v)) => Some(v.clone()),
            TyData::Arr(ArrTy::Tuple(elems)) => elems
                .iter()
                .map(Ty::as_const)
                .collect::<Option<Vec<_>>>()
                .map(|vals| Val::List(vals.into())),
            _ => None,
        }
    }

    pub fn is_scalar(&self) -> bool {
        self.as_const().is_some()
    }

    pub fn obj_spec(&self) -> Option<ClsSpec> {
        match &self.data {
            Some(TyData::Obj(spec)) => Some(*spec),
            _ => None,
        }
    }

    pub fn cls_spec(&self) -> Option<ClsSpec> {
        match &self.data {
            Some(TyData::Cls(spec)) => Some(*spec),
            _ => None,
        }
    }

    pub fn arr_shape(&self) -> Option<&ArrTy> {
        match &self.data {
            Some(TyData::Arr(shape)) => Some(shape),
            _ => None,
        }
    }

    pub fn subtype_of(&self, other: &Ty) -> bool {
        if self.is_bottom() {
            return true;
        }
        if !other.bits.contains(self.bits) {
            return false;
        }

        let Some(od) = &other.data else { return true };

        match &self.data {
            // an unspecialized category never fits a specialized bound
            None => !self.bits.intersects(od.carrier()),
            Some(sd) => data_subtype(sd, od),
        }
    }

    /// Whether the two types share any value. Errs toward `true` where the
    /// class hierarchy would be needed to decide.
    pub fn could_be(&self, other: &Ty) -> bool {
        let shared = self.bits & other.bits;
        if shared.is_empty() {
            return false;
        }

        let (Some(sd), Some(od)) = (&self.data, &other.data) else {
            return true;
        };

        // if the overlap includes a null-ish part, the data can't rule it out
        if shared.intersects(TyBits::NULL | TyBits::UNINIT) {
            return true;
        }

        match (sd, od) {
            (TyData::Int(a), TyData::Int(b)) => a == b,
            (TyData::Dbl(a), TyData::Dbl(b)) => a == b,
            (TyData::Str(a), TyData::Str(b)) => a == b,
            (TyData::Arr(ArrTy::Lit(a)), TyData::Arr(ArrTy::Lit(b))) => a == b,
            (TyData::Obj(a), TyData::Obj(b)) | (TyData::Cls(a), TyData::Cls(b))
                if a.exact && b.exact =>
            {
                a.cls == b.cls
            }
            _ => true,
        }
    }
}

fn data_subtype(sd: &TyData, od: &TyData) -> bool {
    match (sd, od) {
        (TyData::Int(a), TyData::Int(b)) => a == b,
        (TyData::Dbl(a), TyData::Dbl(b)) => a == b,
        (TyData::Str(a), TyData::Str(b)) => a == b,
        (TyData::Arr(a), TyData::Arr(b)) => arr_subtype(a, b),
        (TyData::Obj(a), TyData::Obj(b)) | (TyData::Cls(a), TyData::Cls(b)) => {
            if b.exact {
                a.exact && a.cls == b.cls
            } else {
                a.cls == b.cls
            }
        }
        _ => false,
    }
}

fn lit_elem_tys(v: &Val) -> Option<Vec<Ty>> {
    match v {
        Val::List(xs) => Some(xs.iter().map(from_val).collect()),
        _ => None,
    }
}

fn lit_kv_tys(v: &Val) -> Option<(Vec<Ty>, Vec<Ty>)> {
    match v {
        Val::Dict(kvs) => Some(
            kvs.iter()
                .map(|(k, v)| {
                    let k = match k {
                        ArrKey::Int(i) => ival(*i),
                        ArrKey::Str(s) => sval(Arc::clone(s)),
                    };
                    (k, from_val(v))
                })
                .unzip(),
        ),
        _ => None,
    }
}

fn arr_subtype(a: &ArrTy, b: &ArrTy) -> bool {
    match (a, b) {
        (ArrTy::Lit(x), ArrTy::Lit(y)) => x == y,
        (ArrTy::Lit(x), _) => match lit_elem_tys(x) {
            Some(elems) => arr_subtype(&ArrTy::Tuple(elems.into()), b),
            None => {
                let Some((keys, vals)) = lit_kv_tys(x) else { return false };
                let ArrTy::MapOf(kv) = b else { return false };
                keys.iter().all(|k| k.subtype_of(&kv.0))
                    && vals.iter().all(|v| v.subtype_of(&kv.1))
            }
        },
        (ArrTy::Tuple(xs), ArrTy::Tuple(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys.iter()).all(|(x, y)| x.subtype_of(y))
        }
        (ArrTy::Tuple(xs), ArrTy::ListOf(t)) => xs.iter().all(|x| x.subtype_of(t)),
        (ArrTy::Tuple(xs), ArrTy::MapOf(kv)) => {
            TINT.subtype_of(&kv.0) && xs.iter().all(|x| x.subtype_of(&kv.1))
        }
        (ArrTy::ListOf(t), ArrTy::ListOf(u)) => t.subtype_of(u),
        (ArrTy::ListOf(t), ArrTy::MapOf(kv)) => TINT.subtype_of(&kv.0) && t.subtype_of(&kv.1),
        (ArrTy::MapOf(a), ArrTy::MapOf(b)) => a.0.subtype_of(&b.0) && a.1.subtype_of(&b.1),
        _ => false,
    }
}

/// Least upper bound. Never a proper subtype of either operand.
pub fn union_of(a: &Ty, b: &Ty) -> Ty {
    if a.is_bottom() {
        return b.clone();
    }
    if b.is_bottom() {
        return a.clone();
    }

    let bits = a.bits | b.bits;
    let data = match (&a.data, &b.data) {
        (Some(x), Some(y)) => data_union(x, y),
        // data survives a join with a pure null-ish side
        (Some(x), None) if (b.bits - TyBits::NULL - TyBits::UNINIT).is_empty() => Some(x.clone()),
        (None, Some(y)) if (a.bits - TyBits::NULL - TyBits::UNINIT).is_empty() => Some(y.clone()),
        _ => None,
    };

    norm(bits, data)
}

fn data_union(x: &TyData, y: &TyData) -> Option<TyData> {
    match (x, y) {
        (TyData::Int(a), TyData::Int(b)) if a == b => Some(x.clone()),
        (TyData::Dbl(a), TyData::Dbl(b)) if a == b => Some(x.clone()),
        (TyData::Str(a), TyData::Str(b)) if a == b => Some(x.clone()),
        (TyData::Arr(a), TyData::Arr(b)) => arr_union(a, b).map(TyData::Arr),
        (TyData::Obj(a), TyData::Obj(b)) if a.cls == b.cls => Some(TyData::Obj(ClsSpec {
            cls: a.cls,
            exact: a.exact && b.exact,
        })),
        (TyData::Cls(a), TyData::Cls(b)) if a.cls == b.cls => Some(TyData::Cls(ClsSpec {
            cls: a.cls,
            exact: a.exact && b.exact,
        })),
        _ => None,
    }
}

fn join_all(tys: impl IntoIterator<Item = Ty>) -> Ty {
    tys.into_iter().fold(TBOTTOM, |acc, t| union_of(&acc, &t))
}

fn arr_union(a: &ArrTy, b: &ArrTy) -> Option<ArrTy> {
    if a == b {
        return Some(a.clone());
    }

    // generalize literals one step, then merge shapes
    let widen = |shape: &ArrTy| -> Option<ArrTy> {
        match shape {
            ArrTy::Lit(v) => match lit_elem_tys(v) {
                Some(elems) => Some(ArrTy::Tuple(elems.into())),
                None => {
                    let (keys, vals) = lit_kv_tys(v)?;
                    Some(ArrTy::MapOf(Arc::new((join_all(keys), join_all(vals)))))
                }
            },
            other => Some(other.clone()),
        }
    };

    let a = widen(a)?;
    let b = widen(b)?;

    Some(match (&a, &b) {
        (ArrTy::Tuple(xs), ArrTy::Tuple(ys)) if xs.len() == ys.len() => ArrTy::Tuple(
            xs.iter()
                .zip(ys.iter())
                .map(|(x, y)| union_of(x, y))
                .collect(),
        ),
        (ArrTy::Tuple(_) | ArrTy::ListOf(_), ArrTy::Tuple(_) | ArrTy::ListOf(_)) => {
            ArrTy::ListOf(Arc::new(union_of(&packed_elem(&a), &packed_elem(&b))))
        }
        (ArrTy::MapOf(x), ArrTy::MapOf(y)) => {
            ArrTy::MapOf(Arc::new((union_of(&x.0, &y.0), union_of(&x.1, &y.1))))
        }
        (ArrTy::MapOf(kv), other) | (other, ArrTy::MapOf(kv)) => ArrTy::MapOf(Arc::new((
            union_of(&kv.0, &TINT),
            union_of(&kv.1, &packed_elem(other)),
        ))),
        _ => unreachable!("literal shapes were widened away"),
    })
}

fn packed_elem(shape: &ArrTy) -> Ty {
    match shape {
        ArrTy::Tuple(xs) => join_all(xs.iter().cloned()),
        ArrTy::ListOf(t) => (**t).clone(),
        _ => panic!("packed_elem: not a packed shape"),
    }
}

/// Greatest lower bound, possibly over-approximated where the class
/// hierarchy would be needed (an over-approximate meet is still sound for
/// refinement).
pub fn intersection_of(a: &Ty, b: &Ty) -> Ty {
    let mut bits = a.bits & b.bits;
    if bits.is_empty() {
        return TBOTTOM;
    }

    let data = match (&a.data, &b.data) {
        (None, None) => None,
        (Some(x), None) | (None, Some(x)) => Some(x.clone()),
        (Some(x), Some(y)) => match data_meet(x, y) {
            DataMeet::Keep(d) => Some(d),
            DataMeet::RemoveCarrier(carrier) => {
                bits -= carrier;
                if bits.is_empty() {
                    return TBOTTOM;
                }
                None
            }
        },
    };

    norm(bits, data)
}

enum DataMeet {
    Keep(TyData),
    RemoveCarrier(TyBits),
}

fn data_meet(x: &TyData, y: &TyData) -> DataMeet {
    use DataMeet::{Keep, RemoveCarrier};

    match (x, y) {
        (TyData::Int(a), TyData::Int(b)) => {
            if a == b { Keep(x.clone()) } else { RemoveCarrier(TyBits::INT) }
        }
        (TyData::Dbl(a), TyData::Dbl(b)) => {
            if a == b { Keep(x.clone()) } else { RemoveCarrier(TyBits::DBL) }
        }
        (TyData::Str(a), TyData::Str(b)) => {
            if a == b { Keep(x.clone()) } else { RemoveCarrier(TyBits::STR) }
        }
        (TyData::Arr(a), TyData::Arr(b)) => match (a, b) {
            (ArrTy::Lit(v), ArrTy::Lit(w)) => {
                if v == w {
                    Keep(x.clone())
                } else {
                    RemoveCarrier(x.carrier() | y.carrier())
                }
            }
            _ if arr_subtype(a, b) => Keep(x.clone()),
            _ if arr_subtype(b, a) => Keep(y.clone()),
            _ => Keep(x.clone()),
        },
        (TyData::Obj(a), TyData::Obj(b)) => meet_spec(*a, *b, TyBits::OBJ, TyData::Obj),
        (TyData::Cls(a), TyData::Cls(b)) => meet_spec(*a, *b, TyBits::CLS, TyData::Cls),
        // categories already disjoint at the bits level; either datum works
        _ => Keep(x.clone()),
    }
}

fn meet_spec(
    a: ClsSpec,
    b: ClsSpec,
    carrier: TyBits,
    wrap: fn(ClsSpec) -> TyData,
) -> DataMeet {
    if a.cls == b.cls {
        return DataMeet::Keep(wrap(ClsSpec { cls: a.cls, exact: a.exact || b.exact }));
    }
    if a.exact && b.exact {
        return DataMeet::RemoveCarrier(carrier);
    }
    DataMeet::Keep(wrap(if a.exact { a } else { b }))
}

pub fn is_opt(t: &Ty) -> bool {
    t.bits.contains(TyBits::NULL) && !(t.bits - TyBits::NULL - TyBits::UNINIT).is_empty()
}

pub fn opt(t: &Ty) -> Ty {
    norm(t.bits | TyBits::NULL, t.data.clone())
}

pub fn unopt(t: &Ty) -> Ty {
    norm(t.bits - TyBits::NULL, t.data.clone())
}

pub fn remove_uninit(t: &Ty) -> Ty {
    norm(t.bits - TyBits::UNINIT, t.data.clone())
}

/// Drops specialization, keeping only the category bits.
pub fn loosen_values(t: &Ty) -> Ty {
    Ty { bits: t.bits, data: None }
}

/// What a value reads as once an uninit local has been promoted to null.
pub fn to_cell(t: &Ty) -> Ty {
    if t.could_be(&TREF) || !t.bits.intersects(TyBits::CELL) {
        return TINITCELL;
    }
    let had_uninit = t.bits.contains(TyBits::UNINIT);
    let t = remove_uninit(t);
    if had_uninit { union_of(&t, &TINITNULL) } else { t }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emptiness {
    Empty,
    NonEmpty,
    Maybe,
}

/// Truthiness classification of every value the type admits.
pub fn emptiness(t: &Ty) -> Emptiness {
    if let Some(v) = t.as_const() {
        return if v.to_bool() { Emptiness::NonEmpty } else { Emptiness::Empty };
    }

    let falsy_only = TyBits::UNINIT | TyBits::NULL | TyBits::FALSE;
    if (t.bits - falsy_only).is_empty() {
        return Emptiness::Empty;
    }

    let truthy_only = TyBits::TRUE | TyBits::OBJ;
    if !t.bits.is_empty() && (t.bits - truthy_only).is_empty() {
        return Emptiness::NonEmpty;
    }

    // a known-nonempty packed shape is truthy even without full constancy
    if (t.bits - TyBits::ARR).is_empty() {
        match t.arr_shape() {
            Some(ArrTy::Lit(Val::List(xs))) if !xs.is_empty() => return Emptiness::NonEmpty,
            Some(ArrTy::Lit(Val::Dict(kvs))) if !kvs.is_empty() => return Emptiness::NonEmpty,
            Some(ArrTy::Tuple(xs)) if !xs.is_empty() => return Emptiness::NonEmpty,
            _ => {}
        }
    }

    Emptiness::Maybe
}

/// Narrows to the falsy part of the type. Doubles stay unspecialized
/// because both zeroes are falsy.
pub fn assert_emptiness(t: &Ty) -> Ty {
    let mut bits = t.bits & (TyBits::UNINIT | TyBits::NULL | TyBits::FALSE);
    let mut data = None;

    if t.bits.contains(TyBits::INT) {
        match &t.data {
            None => {
                bits |= TyBits::INT;
                data = Some(TyData::Int(0));
            }
            Some(TyData::Int(0)) => {
                bits |= TyBits::INT;
                data = Some(TyData::Int(0));
            }
            _ => {}
        }
    }
    if t.bits.contains(TyBits::DBL) {
        match &t.data {
            Some(TyData::Dbl(d)) if d.to_f64() != 0.0 => {}
            _ => bits |= TyBits::DBL,
        }
    }
    if t.bits.contains(TyBits::STR) {
        match &t.data {
            Some(TyData::Str(s)) if !s.is_empty() && &**s != "0" => {}
            other => {
                bits |= TyBits::STR;
                if let Some(TyData::Str(_)) = other {
                    data = other.clone();
                }
            }
        }
    }
    if t.bits.intersects(TyBits::ARR) {
        let keeps = match t.arr_shape() {
            Some(ArrTy::Lit(Val::List(xs))) => xs.is_empty(),
            Some(ArrTy::Lit(Val::Dict(kvs))) => kvs.is_empty(),
            Some(ArrTy::Tuple(xs)) => xs.is_empty(),
            _ => true,
        };
        if keeps {
            bits |= t.bits & TyBits::ARR;
            if let Some(shape) = t.arr_shape() {
                data = Some(TyData::Arr(shape.clone()));
            }
        }
    }

    norm(bits, data)
}

/// Narrows to the truthy part of the type.
pub fn assert_nonemptiness(t: &Ty) -> Ty {
    if let Some(v) = t.as_const() {
        return if v.to_bool() { t.clone() } else { TBOTTOM };
    }

    let mut bits = t.bits - TyBits::UNINIT - TyBits::NULL - TyBits::FALSE;

    match &t.data {
        Some(TyData::Int(0)) => bits -= TyBits::INT,
        Some(TyData::Dbl(d)) if d.to_f64() == 0.0 => bits -= TyBits::DBL,
        Some(TyData::Str(s)) if s.is_empty() || &**s == "0" => bits -= TyBits::STR,
        Some(TyData::Arr(ArrTy::Lit(Val::List(xs)))) if xs.is_empty() => bits -= TyBits::ARR,
        Some(TyData::Arr(ArrTy::Lit(Val::Dict(kvs)))) if kvs.is_empty() => bits -= TyBits::ARR,
        Some(TyData::Arr(ArrTy::Tuple(xs))) if xs.is_empty() => bits -= TyBits::ARR,
        _ => {}
    }

    norm(bits, t.data.clone())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterCount {
    Empty,
    Single,
    NonEmpty,
    ZeroOrOne,
    Any,
}

impl IterCount {
    pub fn join(self, other: Self) -> Self {
        use IterCount::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Empty, Single) | (Single, Empty) => ZeroOrOne,
            (Empty, ZeroOrOne) | (ZeroOrOne, Empty) => ZeroOrOne,
            (Single, ZeroOrOne) | (ZeroOrOne, Single) => ZeroOrOne,
            (Single, NonEmpty) | (NonEmpty, Single) => NonEmpty,
            _ => Any,
        }
    }
}

/// What a foreach over a value of this type observes.
#[derive(Debug, Clone, PartialEq)]
pub struct IterInfo {
    pub count: IterCount,
    pub key: Ty,
    pub value: Ty,
    pub may_throw_on_init: bool,
    pub may_throw_on_next: bool,
}

impl IterInfo {
    pub fn any() -> Self {
        Self {
            count: IterCount::Any,
            key: TINITCELL,
            value: TINITCELL,
            may_throw_on_init: true,
            may_throw_on_next: true,
        }
    }

    pub fn join(&self, other: &Self) -> Self {
        Self {
            count: self.count.join(other.count),
            key: union_of(&self.key, &other.key),
            value: union_of(&self.value, &other.value),
            may_throw_on_init: self.may_throw_on_init || other.may_throw_on_init,
            may_throw_on_next: self.may_throw_on_next || other.may_throw_on_next,
        }
    }
}

fn count_of_len(len: usize) -> IterCount {
    match len {
        0 => IterCount::Empty,
        1 => IterCount::Single,
        _ => IterCount::NonEmpty,
    }
}

pub fn iter_types(t: &Ty) -> IterInfo {
    if !t.is_bottom() && (t.bits - TyBits::ARR).is_empty() {
        let (count, key, value) = match t.arr_shape() {
            Some(ArrTy::Lit(v)) => match lit_elem_tys(v) {
                Some(elems) => (
                    count_of_len(elems.len()),
                    if elems.is_empty() { TBOTTOM } else { TINT },
                    join_all(elems),
                ),
                None => {
                    let (keys, vals) = lit_kv_tys(v).expect("array literal");
                    (count_of_len(keys.len()), join_all(keys), join_all(vals))
                }
            },
            Some(ArrTy::Tuple(xs)) => (
                count_of_len(xs.len()),
                if xs.is_empty() { TBOTTOM } else { TINT },
                join_all(xs.iter().cloned()),
            ),
            Some(ArrTy::ListOf(elem)) => (IterCount::Any, TINT, (**elem).clone()),
            Some(ArrTy::MapOf(kv)) => (IterCount::Any, kv.0.clone(), kv.1.clone()),
            None => (IterCount::Any, TARRKEY, TINITCELL),
        };
        return IterInfo {
            count,
            key,
            value,
            may_throw_on_init: false,
            may_throw_on_next: false,
        };
    }

    // objects may be traversable (running user code) or not (raising);
    // anything else raises on iteration
    IterInfo::any()
}

/// Whether letting go of a value of this type could run arbitrary code.
/// Literal arrays hold scalars only, so they never can.
pub fn could_run_destructor(t: &Ty) -> bool {
    if t.bits.intersects(TyBits::OBJ | TyBits::REF) {
        return true;
    }
    if !t.bits.intersects(TyBits::ARR) {
        return false;
    }

    match t.arr_shape() {
        Some(ArrTy::Lit(_)) => false,
        Some(ArrTy::Tuple(xs)) => xs.iter().any(could_run_destructor),
        Some(ArrTy::ListOf(elem)) => could_run_destructor(elem),
        Some(ArrTy::MapOf(kv)) => could_run_destructor(&kv.1),
        None => true,
    }
}

impl Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bottom() {
            return write!(f, "Bottom");
        }
        if let Some(v) = self.as_const() {
            return write!(f, "={v}");
        }

        let names: &[(TyBits, &str)] = &[
            (TyBits::UNINIT, "Uninit"),
            (TyBits::NULL, "Null"),
            (TyBits::FALSE, "False"),
            (TyBits::TRUE, "True"),
            (TyBits::INT, "Int"),
            (TyBits::DBL, "Dbl"),
            (TyBits::STR, "Str"),
            (TyBits::LIST, "List"),
            (TyBits::DICT, "Dict"),
            (TyBits::OBJ, "Obj"),
            (TyBits::CLS, "Cls"),
            (TyBits::REF, "Ref"),
        ];

        let mut first = true;
        for (bit, name) in names {
            if self.bits.contains(*bit) {
                if !first {
                    write!(f, "|")?;
                }
                first = false;
                write!(f, "{name}")?;
            }
        }
        if self.data.is_some() {
            write!(f, "<spec>")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Val;

    fn samples() -> Vec<Ty> {
        vec![
            TBOTTOM,
            TUNINIT,
            TINITNULL,
            TNULL,
            TFALSE,
            TTRUE,
            TBOOL,
            TINT,
            TDBL,
            TNUM,
            TSTR,
            TARRKEY,
            TLIST,
            TDICT,
            TARR,
            TOBJ,
            TOPTOBJ,
            TREF,
            TINITCELL,
            TCELL,
            TGEN,
            TTOP,
            ival(0),
            ival(5),
            dval(0.0),
            sval("x"),
            sval("0"),
            union_of(&ival(5), &TINITNULL),
            tuple(vec![TINT, TSTR]),
            list_of(TINT),
            dict_of(TSTR, TINT),
            aval(Val::List(vec![Val::Int(1), Val::Int(2)].into())),
            aval(Val::List(Vec::new().into())),
        ]
    }

    #[test]
    fn test_join_laws() {
        let tys = samples();
        for a in &tys {
            assert_eq!(union_of(a, a), *a, "join not idempotent for {a}");
            for b in &tys {
                let ab = union_of(a, b);
                let ba = union_of(b, a);
                assert_eq!(ab, ba, "join not commutative for {a}, {b}");
                assert!(a.subtype_of(&ab), "{a} not a subtype of join({a}, {b})");
                assert!(b.subtype_of(&ab), "{b} not a subtype of join({a}, {b})");
            }
        }
    }

    #[test]
    fn test_join_associative() {
        let tys = samples();
        for a in &tys {
            for b in &tys {
                for c in &tys {
                    assert_eq!(
                        union_of(&union_of(a, b), c),
                        union_of(a, &union_of(b, c)),
                        "join not associative for {a}, {b}, {c}",
                    );
                }
            }
        }
    }

    #[test]
    fn test_meet_consistent_with_subtype() {
        let tys = samples();
        for a in &tys {
            for b in &tys {
                let m = intersection_of(a, b);
                if a.subtype_of(b) {
                    assert_eq!(m, *a, "meet({a}, {b}) should be {a}");
                }
                // the meet never exceeds the join
                assert!(m.subtype_of(&union_of(a, b)));
            }
        }
    }

    #[test]
    fn test_bottom_identities() {
        assert_eq!(union_of(&TBOTTOM, &TINT), TINT);
        assert_eq!(intersection_of(&TBOTTOM, &TINT), TBOTTOM);
        assert!(TBOTTOM.subtype_of(&TBOTTOM));
    }

    #[test]
    fn test_constants() {
        assert_eq!(ival(5).as_const(), Some(Val::Int(5)));
        assert_eq!(TINT.as_const(), None);
        assert_eq!(TINITNULL.as_const(), Some(Val::Null));
        assert_eq!(union_of(&ival(5), &TINITNULL).as_const(), None);
        assert_eq!(
            tuple(vec![ival(1), ival(2)]).as_const(),
            Some(Val::List(vec![Val::Int(1), Val::Int(2)].into())),
        );
    }

    #[test]
    fn test_literal_join_degrades_gracefully() {
        let a = ival(5);
        let b = ival(7);
        assert_eq!(union_of(&a, &b), TINT);

        let lit1 = aval(Val::List(vec![Val::Int(1)].into()));
        let lit2 = aval(Val::List(vec![Val::Int(2), Val::Int(3)].into()));
        let j = union_of(&lit1, &lit2);
        assert!(lit1.subtype_of(&j));
        assert!(lit2.subtype_of(&j));
    }

    #[test]
    fn test_opt_helpers() {
        let t = union_of(&TOBJ, &TINITNULL);
        assert!(is_opt(&t));
        assert_eq!(unopt(&t), TOBJ);
        assert!(!is_opt(&TINITNULL));
        assert_eq!(opt(&TOBJ), t);
    }

    #[test]
    fn test_emptiness() {
        assert_eq!(emptiness(&TINITNULL), Emptiness::Empty);
        assert_eq!(emptiness(&TFALSE), Emptiness::Empty);
        assert_eq!(emptiness(&TTRUE), Emptiness::NonEmpty);
        assert_eq!(emptiness(&TOBJ), Emptiness::NonEmpty);
        assert_eq!(emptiness(&TINT), Emptiness::Maybe);
        assert_eq!(emptiness(&ival(0)), Emptiness::Empty);
        assert_eq!(emptiness(&ival(3)), Emptiness::NonEmpty);
        assert_eq!(emptiness(&sval("0")), Emptiness::Empty);
        assert_eq!(emptiness(&sval("00")), Emptiness::NonEmpty);
    }

    #[test]
    fn test_assertions_partition_soundly() {
        for t in samples() {
            let empty = assert_emptiness(&t);
            let nonempty = assert_nonemptiness(&t);
            let back = union_of(&empty, &nonempty);
            assert!(
                t.subtype_of(&back),
                "emptiness split of {t} lost values: {empty} | {nonempty}",
            );
        }
    }

    #[test]
    fn test_iter_types() {
        let lit = aval(Val::List(vec![Val::Int(1), Val::Int(2)].into()));
        let info = iter_types(&lit);
        assert_eq!(info.count, IterCount::NonEmpty);
        assert!(info.value.subtype_of(&TINT));
        assert!(!info.may_throw_on_init);

        let single = aval(Val::List(vec![Val::str("a")].into()));
        assert_eq!(iter_types(&single).count, IterCount::Single);

        let unknown = iter_types(&TINITCELL);
        assert_eq!(unknown.count, IterCount::Any);
        assert!(unknown.may_throw_on_init);
    }

    #[test]
    fn test_could_run_destructor() {
        assert!(!could_run_destructor(&TINT));
        assert!(could_run_destructor(&TOBJ));
        assert!(could_run_destructor(&TARR));
        assert!(!could_run_destructor(&aval(Val::List(
            vec![Val::Int(1)].into()
        ))));
        assert!(!could_run_destructor(&tuple(vec![TINT, TSTR])));
        assert!(could_run_destructor(&tuple(vec![TINT, TOBJ])));
    }

    #[test]
    fn test_to_cell() {
        assert_eq!(to_cell(&TUNINIT), TINITNULL);
        assert_eq!(to_cell(&TINT), TINT);
        assert_eq!(to_cell(&union_of(&TUNINIT, &TINT)), union_of(&TINITNULL, &TINT));
        assert_eq!(to_cell(&TGEN), TINITCELL);
    }
}
