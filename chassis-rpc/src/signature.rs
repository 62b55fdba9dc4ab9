//! Endpoint signatures: parameter declarations, annotations and binding.
//!
//! A [`Signature`] lists the parameters an endpoint accepts, in the classic
//! order: positional-or-keyword, an optional variadic positional catch-all,
//! keyword-only, then an optional variadic keyword catch-all. Parameters may
//! carry a default and an annotation ([`Coercer`]) that validates and
//! converts the supplied value.
//!
//! # Examples
//!
//! ```
//! use chassis_rpc::signature::{coerce, Param, Signature};
//! use chassis_rpc::{args, kwargs};
//!
//! let sig = Signature::new()
//!     .param(Param::new("a").annotate(coerce::int()))
//!     .param(Param::new("b").annotate(coerce::int()).default(10))
//!     .returns(coerce::int());
//!
//! let (bound, _ret) = sig.check_args(args!["5"], kwargs! {}).unwrap();
//! assert_eq!(bound.get("a").and_then(|v| v.as_i64()), Some(5));
//! assert_eq!(bound.get("b").and_then(|v| v.as_i64()), Some(10));
//! ```

use std::fmt;
use std::rc::Rc;

use hashbrown::HashSet;

use crate::error::{CoerceError, HandlerError, ParametersError, SignatureError};
use crate::value::{Kwargs, Value};

/// Annotation: validates and converts one argument value.
pub type Coercer = Rc<dyn Fn(Value) -> Result<Value, CoerceError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParamKind {
    PositionalOrKeyword,
    VarPositional,
    KeywordOnly,
    VarKeyword,
}

#[derive(Clone)]
pub struct Param {
    name: String,
    kind: ParamKind,
    default: Option<Value>,
    annotation: Option<Coercer>,
}

impl Param {
    /// Positional-or-keyword parameter.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::PositionalOrKeyword,
            default: None,
            annotation: None,
        }
    }

    pub fn keyword_only(name: impl Into<String>) -> Self {
        Self {
            kind: ParamKind::KeywordOnly,
            ..Self::new(name)
        }
    }

    /// Catch-all for extra positional arguments.
    pub fn var_args(name: impl Into<String>) -> Self {
        Self {
            kind: ParamKind::VarPositional,
            ..Self::new(name)
        }
    }

    /// Catch-all for extra keyword arguments.
    pub fn var_kwargs(name: impl Into<String>) -> Self {
        Self {
            kind: ParamKind::VarKeyword,
            ..Self::new(name)
        }
    }

    #[must_use]
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    #[must_use]
    pub fn annotate(mut self, coercer: Coercer) -> Self {
        self.annotation = Some(coercer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    pub fn is_annotated(&self) -> bool {
        self.annotation.is_some()
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Param")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("default", &self.default)
            .field("annotated", &self.annotation.is_some())
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct Signature {
    params: Vec<Param>,
    returns: Option<Coercer>,
}

/// Arguments bound to a signature, annotations applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundArgs {
    named: Vec<(String, Value)>,
    varargs: Vec<Value>,
    varkwargs: Kwargs,
}

impl BoundArgs {
    /// Value of a named parameter (supplied or defaulted), or of an extra
    /// keyword argument.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.named
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .or_else(|| self.varkwargs.get(name))
    }

    pub fn require(&self, name: &str) -> Result<&Value, HandlerError> {
        self.get(name)
            .ok_or_else(|| ParametersError::new(format!("missing argument {name:?}")).into())
    }

    pub fn int(&self, name: &str) -> Result<i64, HandlerError> {
        let v = self.require(name)?;
        v.as_i64().ok_or_else(|| wrong_type(name, "int", v))
    }

    pub fn float(&self, name: &str) -> Result<f64, HandlerError> {
        let v = self.require(name)?;
        v.as_f64().ok_or_else(|| wrong_type(name, "float", v))
    }

    pub fn str(&self, name: &str) -> Result<&str, HandlerError> {
        let v = self.require(name)?;
        v.as_str().ok_or_else(|| wrong_type(name, "str", v))
    }

    pub fn bool(&self, name: &str) -> Result<bool, HandlerError> {
        let v = self.require(name)?;
        v.as_bool().ok_or_else(|| wrong_type(name, "bool", v))
    }

    /// Extra positional arguments.
    pub fn varargs(&self) -> &[Value] {
        &self.varargs
    }

    /// Extra keyword arguments.
    pub fn varkwargs(&self) -> &Kwargs {
        &self.varkwargs
    }

    /// Named values in parameter order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.named.iter().map(|(n, v)| (n.as_str(), v))
    }
}

fn wrong_type(name: &str, expected: &str, got: &Value) -> HandlerError {
    ParametersError::new(format!(
        "Invalid value for argument {name:?}: expected {expected}, got {}",
        got.kind()
    ))
    .into()
}

fn mismatch(message: String) -> ParametersError {
    ParametersError::new(format!("Arguments mismatch: {message}"))
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    /// Positional-or-keyword parameters without defaults or annotations.
    pub fn positional<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            params: names.into_iter().map(Param::new).collect(),
            returns: None,
        }
    }

    #[must_use]
    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    /// Return annotation, applied to the handler's result.
    #[must_use]
    pub fn returns(mut self, coercer: Coercer) -> Self {
        self.returns = Some(coercer);
        self
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn return_annotation(&self) -> Option<&Coercer> {
        self.returns.as_ref()
    }

    /// Check the declaration is well formed.
    pub fn validate(&self) -> Result<(), SignatureError> {
        let mut seen = HashSet::new();
        let mut last_kind = ParamKind::PositionalOrKeyword;
        let mut saw_default = false;
        let mut var_args = 0;
        let mut var_kwargs = 0;

        for param in &self.params {
            if !seen.insert(param.name.as_str()) {
                return Err(SignatureError::DuplicateParameter(param.name.clone()));
            }
            if param.kind < last_kind || last_kind == ParamKind::VarKeyword {
                return Err(SignatureError::OutOfOrder(param.name.clone()));
            }
            last_kind = param.kind;
            match param.kind {
                ParamKind::PositionalOrKeyword => {
                    if param.default.is_some() {
                        saw_default = true;
                    } else if saw_default {
                        return Err(SignatureError::RequiredAfterDefault(param.name.clone()));
                    }
                }
                ParamKind::VarPositional => {
                    var_args += 1;
                    if var_args > 1 {
                        return Err(SignatureError::DuplicateVariadic("variadic positional"));
                    }
                }
                ParamKind::VarKeyword => {
                    var_kwargs += 1;
                    if var_kwargs > 1 {
                        return Err(SignatureError::DuplicateVariadic("variadic keyword"));
                    }
                }
                ParamKind::KeywordOnly => {}
            }
        }
        Ok(())
    }

    /// Bind call arguments without applying annotations.
    ///
    /// Returned values are `(name, value, supplied)`; unsupplied entries hold
    /// the parameter default.
    fn bind_raw(&self, args: Vec<Value>, mut kwargs: Kwargs) -> Result<BoundRaw, ParametersError> {
        let mut positional = args.into_iter();
        let mut raw = BoundRaw::default();

        for param in &self.params {
            match param.kind {
                ParamKind::PositionalOrKeyword => {
                    if let Some(value) = positional.next() {
                        if kwargs.contains_key(&param.name) {
                            return Err(mismatch(format!("multiple values for argument '{}'", param.name)));
                        }
                        raw.named.push((param.name.clone(), value, true));
                    } else {
                        raw.bind_keyword(param, &mut kwargs)?;
                    }
                }
                ParamKind::VarPositional => raw.varargs.extend(positional.by_ref()),
                ParamKind::KeywordOnly => raw.bind_keyword(param, &mut kwargs)?,
                ParamKind::VarKeyword => raw.varkwargs.append(&mut kwargs),
            }
        }

        if positional.next().is_some() {
            return Err(mismatch("too many positional arguments".to_string()));
        }
        if let Some(name) = kwargs.keys().next() {
            return Err(mismatch(format!("got an unexpected keyword argument '{name}'")));
        }
        Ok(raw)
    }

    /// Bind `args`/`kwargs` and apply parameter annotations to supplied values.
    ///
    /// Returns the bound arguments and the return annotation, if any.
    pub fn check_args(
        &self,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<(BoundArgs, Option<Coercer>), ParametersError> {
        let raw = self.bind_raw(args, kwargs)?;
        let annotation = |name: &str| {
            self.params
                .iter()
                .find(|p| p.name == name)
                .and_then(|p| p.annotation.clone())
        };
        let apply = |name: &str, value: Value| match annotation(name) {
            Some(coerce) => coerce(value).map_err(|e| {
                ParametersError::new(format!("Invalid value for argument '{name}': {e}"))
            }),
            None => Ok(value),
        };

        let mut bound = BoundArgs::default();
        for (name, value, supplied) in raw.named {
            let value = if supplied { apply(&name, value)? } else { value };
            bound.named.push((name, value));
        }
        let var_name = self
            .params
            .iter()
            .find(|p| p.kind == ParamKind::VarPositional)
            .map(|p| p.name.clone());
        for value in raw.varargs {
            bound.varargs.push(match &var_name {
                Some(name) => apply(name, value)?,
                None => value,
            });
        }
        let kw_name = self
            .params
            .iter()
            .find(|p| p.kind == ParamKind::VarKeyword)
            .map(|p| p.name.clone());
        for (key, value) in raw.varkwargs {
            let value = match &kw_name {
                Some(name) => apply(name, value)?,
                None => value,
            };
            bound.varkwargs.insert(key, value);
        }
        Ok((bound, self.returns.clone()))
    }
}

#[derive(Default)]
struct BoundRaw {
    named: Vec<(String, Value, bool)>,
    varargs: Vec<Value>,
    varkwargs: Kwargs,
}

impl BoundRaw {
    fn bind_keyword(&mut self, param: &Param, kwargs: &mut Kwargs) -> Result<(), ParametersError> {
        if let Some(value) = kwargs.remove(&param.name) {
            self.named.push((param.name.clone(), value, true));
        } else if let Some(default) = &param.default {
            self.named.push((param.name.clone(), default.clone(), false));
        } else {
            return Err(mismatch(format!("missing a required argument: '{}'", param.name)));
        }
        Ok(())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signature")
            .field("params", &self.params)
            .field("returns", &self.returns.is_some())
            .finish()
    }
}

/// Stock annotations.
pub mod coerce {
    use std::rc::Rc;

    use bytes::Bytes;

    use super::Coercer;
    use crate::error::CoerceError;
    use crate::value::Value;

    /// Annotation from a closure.
    pub fn from_fn<F>(f: F) -> Coercer
    where
        F: Fn(Value) -> Result<Value, CoerceError> + 'static,
    {
        Rc::new(f)
    }

    /// Accepts anything unchanged.
    pub fn any() -> Coercer {
        from_fn(Ok)
    }

    /// Integers; floats truncate, strings parse, booleans map to 0/1.
    pub fn int() -> Coercer {
        from_fn(|v| match v {
            Value::Int(_) | Value::UInt(_) => Ok(v),
            Value::Bool(b) => Ok(Value::Int(i64::from(b))),
            Value::Float(f) if in_i64_range(f) => Ok(Value::Int(f.trunc() as i64)),
            Value::Float(f) => Err(CoerceError(format!("cannot convert float {f} to int"))),
            Value::Str(ref s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| CoerceError(format!("invalid literal for int: {s:?}"))),
            other => Err(CoerceError::expected("int", &other)),
        })
    }

    // -2^63 and 2^63 are exact as f64.
    fn in_i64_range(f: f64) -> bool {
        let t = f.trunc();
        t.is_finite() && t >= -9_223_372_036_854_775_808.0 && t < 9_223_372_036_854_775_808.0
    }

    /// Floats; integers convert, strings parse.
    pub fn float() -> Coercer {
        from_fn(|v| match v {
            Value::Float(_) => Ok(v),
            Value::Int(_) | Value::UInt(_) => Ok(Value::Float(v.as_f64().unwrap_or_default())),
            Value::Str(ref s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| CoerceError(format!("could not convert string to float: {s:?}"))),
            other => Err(CoerceError::expected("float", &other)),
        })
    }

    /// Strings; UTF-8 bytes decode, numbers and booleans format.
    pub fn string() -> Coercer {
        from_fn(|v| match v {
            Value::Str(_) => Ok(v),
            Value::Bin(b) => String::from_utf8(b.to_vec())
                .map(Value::Str)
                .map_err(|_| CoerceError("bytes are not valid UTF-8".into())),
            Value::Int(_) | Value::UInt(_) | Value::Float(_) | Value::Bool(_) => Ok(Value::Str(v.to_string())),
            other => Err(CoerceError::expected("str", &other)),
        })
    }

    pub fn boolean() -> Coercer {
        from_fn(|v| match v {
            Value::Bool(_) => Ok(v),
            Value::Int(i) => Ok(Value::Bool(i != 0)),
            Value::UInt(u) => Ok(Value::Bool(u != 0)),
            other => Err(CoerceError::expected("bool", &other)),
        })
    }

    pub fn bytes() -> Coercer {
        from_fn(|v| match v {
            Value::Bin(_) => Ok(v),
            Value::Str(s) => Ok(Value::Bin(Bytes::from(s))),
            other => Err(CoerceError::expected("bytes", &other)),
        })
    }

    /// Arrays whose items all pass `item`.
    pub fn list_of(item: Coercer) -> Coercer {
        from_fn(move |v| match v {
            Value::Array(items) => items
                .into_iter()
                .map(|i| item(i))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Err(CoerceError::expected("array", &other)),
        })
    }

    /// `nil`, or a value passing `inner`.
    pub fn optional(inner: Coercer) -> Coercer {
        from_fn(move |v| if v.is_nil() { Ok(v) } else { inner(v) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{args, kwargs};

    fn add_sig() -> Signature {
        Signature::new()
            .param(Param::new("a").annotate(coerce::int()))
            .param(Param::new("b").annotate(coerce::int()))
            .returns(coerce::int())
    }

    #[test]
    fn test_bind_positional_and_keyword() {
        let (bound, ret) = add_sig().check_args(args![1], kwargs! { "b" => "2" }).unwrap();
        assert_eq!(bound.int("a").unwrap(), 1);
        assert_eq!(bound.int("b").unwrap(), 2);
        assert!(ret.is_some());
    }

    #[test]
    fn test_binding_failures() {
        let sig = add_sig();
        let err = sig.check_args(args![1], kwargs! {}).err().unwrap();
        assert_eq!(err.message, "Arguments mismatch: missing a required argument: 'b'");

        let err = sig.check_args(args![1, 2, 3], kwargs! {}).err().unwrap();
        assert!(err.message.contains("too many positional arguments"));

        let err = sig.check_args(args![1, 2], kwargs! { "c" => 1 }).err().unwrap();
        assert!(err.message.contains("unexpected keyword argument 'c'"));

        let err = sig.check_args(args![1, 2], kwargs! { "a" => 1 }).err().unwrap();
        assert!(err.message.contains("multiple values for argument 'a'"));
    }

    #[test]
    fn test_annotation_failure_names_parameter() {
        let err = add_sig().check_args(args!["not-an-int", 2], kwargs! {}).err().unwrap();
        assert!(err.message.starts_with("Invalid value for argument 'a'"), "{}", err.message);
    }

    #[test]
    fn test_default_skips_annotation() {
        let sig = Signature::new().param(
            Param::new("a")
                .annotate(coerce::from_fn(|_| Err(CoerceError("always fails".into()))))
                .default("raw"),
        );
        let (bound, ret) = sig.check_args(args![], kwargs! {}).unwrap();
        assert_eq!(bound.str("a").unwrap(), "raw");
        assert!(ret.is_none());
        assert!(sig.check_args(args![1], kwargs! {}).is_err());
    }

    #[test]
    fn test_variadics_and_keyword_only() {
        let sig = Signature::new()
            .param(Param::new("first"))
            .param(Param::var_args("rest").annotate(coerce::int()))
            .param(Param::keyword_only("flag").default(false))
            .param(Param::var_kwargs("extra"));
        sig.validate().unwrap();

        let (bound, _) = sig
            .check_args(args!["x", "1", 2], kwargs! { "flag" => true, "other" => 5 })
            .unwrap();
        assert_eq!(bound.str("first").unwrap(), "x");
        assert_eq!(bound.varargs(), &[Value::Int(1), Value::Int(2)]);
        assert!(bound.bool("flag").unwrap());
        assert_eq!(bound.get("other"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_keyword_only_cannot_be_positional() {
        let sig = Signature::new()
            .param(Param::new("a"))
            .param(Param::keyword_only("k"));
        let err = sig.check_args(args![1, 2], kwargs! {}).err().unwrap();
        assert!(err.message.contains("too many positional arguments"));
    }

    #[test]
    fn test_validate() {
        let dup = Signature::positional(["a", "a"]);
        assert_eq!(dup.validate(), Err(SignatureError::DuplicateParameter("a".into())));

        let order = Signature::new().param(Param::new("a").default(1)).param(Param::new("b"));
        assert_eq!(order.validate(), Err(SignatureError::RequiredAfterDefault("b".into())));

        let misplaced = Signature::new()
            .param(Param::var_kwargs("kw"))
            .param(Param::keyword_only("k"));
        assert_eq!(misplaced.validate(), Err(SignatureError::OutOfOrder("k".into())));

        let two = Signature::new().param(Param::var_args("a")).param(Param::var_args("b"));
        assert!(two.validate().is_err());
    }

    #[test]
    fn test_stock_coercers() {
        assert_eq!(coerce::int()(Value::Float(2.9)).unwrap(), Value::Int(2));
        assert!(coerce::int()(Value::Nil).is_err());
        assert_eq!(coerce::int()(Value::Float(-1e18)).unwrap(), Value::Int(-1_000_000_000_000_000_000));
        assert_eq!(coerce::float()(Value::Int(2)).unwrap(), Value::Float(2.0));
        assert_eq!(coerce::string()(Value::Int(7)).unwrap(), Value::from("7"));
        assert_eq!(coerce::boolean()(Value::Int(0)).unwrap(), Value::Bool(false));
        assert_eq!(
            coerce::list_of(coerce::int())(Value::Array(args!["1", 2])).unwrap(),
            Value::Array(args![1, 2])
        );
        assert_eq!(coerce::optional(coerce::int())(Value::Nil).unwrap(), Value::Nil);
    }

    #[test]
    fn test_int_rejects_unrepresentable_floats() {
        for f in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 1e19, -1e19, 9_223_372_036_854_775_808.0] {
            let err = coerce::int()(Value::Float(f)).unwrap_err();
            assert!(err.to_string().contains("cannot convert float"), "{f}: {err}");
        }
        assert_eq!(
            coerce::int()(Value::Float(-9_223_372_036_854_775_808.0)).unwrap(),
            Value::Int(i64::MIN)
        );
    }
}
