use crate::objects::object::ObjRef;

/// A tagged runtime value. Object variants hold a non-owning handle into the heap.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Obj(ObjRef),
}

pub type ValueArray = Vec<Value>;

impl Value {
    #[inline(always)]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    #[inline(always)]
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Number(_))
    }

    #[inline(always)]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(number) => Some(*number),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(boolean) => Some(*boolean),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(obj) => Some(*obj),
            _ => None,
        }
    }

    /// `null` and `false` are falsey, everything else is truthy.
    #[inline(always)]
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Null | Value::Bool(false))
    }

    /// Integral numbers that fit an `i64` exactly, used for array indexing.
    pub fn as_integer(&self) -> Option<i64> {
        let number = self.as_number()?;
        if number.floor() != number || !number.is_finite() {
            return None;
        }
        Some(number as i64)
    }
}

impl From<f64> for Value {
    fn from(number: f64) -> Self {
        Value::Number(number)
    }
}

impl From<bool> for Value {
    fn from(boolean: bool) -> Self {
        Value::Bool(boolean)
    }
}

impl From<ObjRef> for Value {
    fn from(obj: ObjRef) -> Self {
        Value::Obj(obj)
    }
}

/// Formats a number the way `%g` would for the common cases: integral values
/// drop the fractional part.
pub fn format_number(number: f64) -> String {
    if number.is_nan() {
        return "nan".to_string();
    }
    if number.is_infinite() {
        return if number > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if number.floor() == number && number.abs() < 1e15 {
        format!("{}", number as i64)
    } else {
        format!("{}", number)
    }
}
