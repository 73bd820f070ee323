//! # Search engine
//!
//! A small S-expression interpreter over typed values, used by
//! folders to filter their summaries. Expressions are parsed by
//! [`parser`] into [`Term`] trees and evaluated by a
//! [`SearchContext`]: a lexical stack of symbol frames over a fixed
//! set of builtins, with folder-specific predicates supplied through
//! the [`SearchExt`] seam (see [`folder`]).
//!
//! Errors use exception-style control flow: a builtin "throws" by
//! returning [`Error::Search`], which unwinds the Rust evaluation
//! stack; the last thrown message stays retrievable on the context.

pub mod folder;
pub mod parser;

use std::collections::HashMap;

use crate::error::{Error, Result};

#[doc(inline)]
pub use self::parser::Term;

/// A runtime value of the search engine.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    /// Epoch seconds.
    Time(i64),
    Float(f64),
    Str(String),
    /// Opaque ids, typically message uids.
    Array(Vec<String>),
    List(Vec<Value>),
    Void,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Time(_) => "time",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::List(_) => "list",
            Value::Void => "void",
        }
    }

    /// Promotion order for comparisons; `None` never promotes.
    fn rank(&self) -> Option<u8> {
        match self {
            Value::Bool(_) => Some(0),
            Value::Int(_) => Some(1),
            Value::Time(_) => Some(2),
            Value::Float(_) => Some(3),
            Value::Str(_) => Some(4),
            _ => None,
        }
    }

    /// `cast-bool`: non-zero numbers are true, `"true"`/`"#t"`
    /// strings are true, everything else is false.
    pub fn cast_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(n) | Value::Time(n) => *n != 0,
            Value::Float(x) => (*x as i64) != 0,
            Value::Str(s) => s == "true" || s == "#t",
            _ => false,
        }
    }

    /// `cast-int`: strings parse their leading decimal digits.
    pub fn cast_int(&self) -> i64 {
        match self {
            Value::Bool(b) => *b as i64,
            Value::Int(n) | Value::Time(n) => *n,
            Value::Float(x) => *x as i64,
            Value::Str(s) => leading_i64(s),
            _ => 0,
        }
    }

    pub fn cast_float(&self) -> f64 {
        match self {
            Value::Bool(b) => *b as i64 as f64,
            Value::Int(n) | Value::Time(n) => *n as f64,
            Value::Float(x) => *x,
            Value::Str(s) => leading_f64(s),
            _ => 0.0,
        }
    }

    pub fn cast_string(&self) -> String {
        match self {
            Value::Bool(true) => "true".into(),
            Value::Bool(false) => "false".into(),
            Value::Int(n) | Value::Time(n) => n.to_string(),
            Value::Float(x) => format!("{x:.2}"),
            Value::Str(s) => s.clone(),
            _ => String::new(),
        }
    }
}

/// Parse the leading decimal integer of a string, `strtol`-style.
fn leading_i64(s: &str) -> i64 {
    let s = s.trim_start();
    let (sign, rest) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<i64>().map(|n| sign * n).unwrap_or_default()
}

/// Parse the leading float of a string, `strtod`-style.
fn leading_f64(s: &str) -> f64 {
    let s = s.trim_start();
    let mut end = 0;
    let bytes = s.as_bytes();
    let mut seen_dot = false;
    while end < bytes.len() {
        let b = bytes[end];
        let ok = b.is_ascii_digit()
            || (end == 0 && (b == b'-' || b == b'+'))
            || (b == b'.' && !seen_dot);
        if !ok {
            break;
        }
        if b == b'.' {
            seen_dot = true;
        }
        end += 1;
    }
    s[..end].parse::<f64>().unwrap_or_default()
}

/// A function over already-evaluated arguments.
pub type Func = fn(&mut SearchContext, &mut dyn SearchExt, &[Value]) -> Result<Value>;
/// An i-function over unevaluated argument terms.
pub type IFunc = fn(&mut SearchContext, &mut dyn SearchExt, &[Term]) -> Result<Value>;

/// What a symbol resolves to.
pub enum Binding {
    /// Operates on already-evaluated arguments.
    Func(Func),
    /// Operates on the unevaluated argument terms.
    IFunc(IFunc),
    /// An evaluated value.
    Var(Value),
}

/// The seam for caller-supplied symbols: consulted for any symbol the
/// context itself does not bind. Arguments arrive unevaluated so the
/// extension decides between function and i-function behavior.
pub trait SearchExt {
    fn call(
        &mut self,
        ctx: &mut SearchContext,
        name: &str,
        args: &[Term],
    ) -> Result<Option<Value>>;
}

/// An extension that supplies nothing; for evaluating pure
/// expressions.
pub struct NoExt;

impl SearchExt for NoExt {
    fn call(
        &mut self,
        _ctx: &mut SearchContext,
        _name: &str,
        _args: &[Term],
    ) -> Result<Option<Value>> {
        Ok(None)
    }
}

/// The evaluator: a stack of symbol frames, innermost last.
pub struct SearchContext {
    frames: Vec<HashMap<String, Binding>>,
    exception: Option<String>,
}

impl Default for SearchContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchContext {
    pub fn new() -> Self {
        let mut root: HashMap<String, Binding> = HashMap::new();

        root.insert("and".into(), Binding::IFunc(term_and));
        root.insert("or".into(), Binding::IFunc(term_or));
        root.insert("not".into(), Binding::Func(term_not));
        root.insert("<".into(), Binding::IFunc(term_lt));
        root.insert(">".into(), Binding::IFunc(term_gt));
        root.insert("=".into(), Binding::IFunc(term_eq));
        root.insert("+".into(), Binding::Func(term_add));
        root.insert("-".into(), Binding::Func(term_sub));
        root.insert("*".into(), Binding::Func(term_mul));
        root.insert("/".into(), Binding::Func(term_div));
        root.insert("if".into(), Binding::IFunc(term_if));
        root.insert("begin".into(), Binding::IFunc(term_begin));
        root.insert("cast-bool".into(), Binding::Func(term_cast_bool));
        root.insert("cast-int".into(), Binding::Func(term_cast_int));
        root.insert("cast-float".into(), Binding::Func(term_cast_float));
        root.insert("cast-string".into(), Binding::Func(term_cast_string));

        Self {
            frames: vec![root],
            exception: None,
        }
    }

    /// Open a new lexical frame.
    pub fn push_frame(&mut self) {
        self.frames.push(HashMap::new());
    }

    pub fn pop_frame(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    /// Bind a variable in the innermost frame.
    pub fn add_variable(&mut self, name: impl Into<String>, value: Value) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.into(), Binding::Var(value));
        }
    }

    /// Remove a symbol from the innermost frame that binds it.
    pub fn remove_symbol(&mut self, name: &str) {
        for frame in self.frames.iter_mut().rev() {
            if frame.remove(name).is_some() {
                return;
            }
        }
    }

    /// The message of the last thrown error, if any.
    pub fn exception(&self) -> Option<&str> {
        self.exception.as_deref()
    }

    /// Throw: record the message and unwind via the error channel.
    pub fn throw<T>(&mut self, message: impl Into<String>) -> Result<T> {
        let message = message.into();
        self.exception = Some(message.clone());
        Err(Error::Search(message))
    }

    fn lookup(&self, name: &str) -> Option<&Binding> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }

    /// Evaluate a full expression, resetting the exception slot.
    pub fn run(&mut self, term: &Term, ext: &mut dyn SearchExt) -> Result<Value> {
        self.exception = None;
        self.eval(term, ext)
    }

    pub fn eval(&mut self, term: &Term, ext: &mut dyn SearchExt) -> Result<Value> {
        match term {
            Term::Bool(b) => Ok(Value::Bool(*b)),
            Term::Int(n) => Ok(Value::Int(*n)),
            Term::Float(x) => Ok(Value::Float(*x)),
            Term::Str(s) => Ok(Value::Str(s.clone())),
            Term::Symbol(name) => self.eval_symbol(name, &[], ext),
            Term::List(items) => match items.split_first() {
                None => self.throw("empty expression"),
                Some((Term::Symbol(name), args)) => {
                    let name = name.clone();
                    self.eval_symbol(&name, args, ext)
                }
                Some(_) => {
                    // a plain list of values
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.eval(item, ext)?);
                    }
                    Ok(Value::List(values))
                }
            },
        }
    }

    fn eval_symbol(
        &mut self,
        name: &str,
        args: &[Term],
        ext: &mut dyn SearchExt,
    ) -> Result<Value> {
        enum Kind {
            Func(Func),
            IFunc(IFunc),
            Var(Value),
        }

        let kind = match self.lookup(name) {
            Some(Binding::Func(f)) => Kind::Func(*f),
            Some(Binding::IFunc(f)) => Kind::IFunc(*f),
            Some(Binding::Var(value)) => Kind::Var(value.clone()),
            None => {
                return match ext.call(self, name, args)? {
                    Some(value) => Ok(value),
                    None => self.throw(format!("unknown symbol {name}")),
                };
            }
        };

        match kind {
            Kind::Var(value) => Ok(value),
            Kind::IFunc(f) => f(self, ext, args),
            Kind::Func(f) => {
                // eager arguments in their own frame
                self.push_frame();
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    match self.eval(arg, ext) {
                        Ok(value) => values.push(value),
                        Err(err) => {
                            self.pop_frame();
                            return Err(err);
                        }
                    }
                }
                let result = f(self, ext, &values);
                self.pop_frame();
                result
            }
        }
    }

    pub fn eval_args(&mut self, args: &[Term], ext: &mut dyn SearchExt) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg, ext)?);
        }
        Ok(values)
    }
}

/// Promote a value to the given rank for a comparison.
fn promote(value: &Value, rank: u8) -> Value {
    match rank {
        0 => Value::Bool(value.cast_bool()),
        1 => Value::Int(value.cast_int()),
        2 => Value::Time(value.cast_int()),
        3 => Value::Float(value.cast_float()),
        _ => Value::Str(value.cast_string()),
    }
}

fn compare(
    ctx: &mut SearchContext,
    ext: &mut dyn SearchExt,
    args: &[Term],
    op: &str,
) -> Result<std::cmp::Ordering> {
    use std::cmp::Ordering;

    if args.len() != 2 {
        return ctx.throw(format!("incorrect number of arguments in ({op} )"));
    }

    let a = ctx.eval(&args[0], ext)?;
    let b = ctx.eval(&args[1], ext)?;

    let (Some(ra), Some(rb)) = (a.rank(), b.rank()) else {
        return ctx.throw(format!(
            "incompatible types in comparison ({op}): {} and {}",
            a.type_name(),
            b.type_name()
        ));
    };

    let rank = ra.max(rb);
    let a = promote(&a, rank);
    let b = promote(&b, rank);

    let ordering = match (&a, &b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Int(x), Value::Int(y)) | (Value::Time(x), Value::Time(y)) => x.cmp(y),
        (Value::Float(x), Value::Float(y)) => {
            x.partial_cmp(y).unwrap_or(Ordering::Equal)
        }
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        _ => return ctx.throw(format!("incompatible types in comparison ({op})")),
    };

    Ok(ordering)
}

fn term_lt(ctx: &mut SearchContext, ext: &mut dyn SearchExt, args: &[Term]) -> Result<Value> {
    Ok(Value::Bool(compare(ctx, ext, args, "<")?.is_lt()))
}

fn term_gt(ctx: &mut SearchContext, ext: &mut dyn SearchExt, args: &[Term]) -> Result<Value> {
    Ok(Value::Bool(compare(ctx, ext, args, ">")?.is_gt()))
}

fn term_eq(ctx: &mut SearchContext, ext: &mut dyn SearchExt, args: &[Term]) -> Result<Value> {
    Ok(Value::Bool(compare(ctx, ext, args, "=")?.is_eq()))
}

/// `and`: logical over booleans, set intersection over arrays
/// (order-of-first-occurrence). Mixing the two throws.
fn term_and(ctx: &mut SearchContext, ext: &mut dyn SearchExt, args: &[Term]) -> Result<Value> {
    if args.is_empty() {
        return ctx.throw("no arguments in (and )");
    }

    match ctx.eval(&args[0], ext)? {
        Value::Array(first) => {
            let mut order: Vec<String> = Vec::new();
            let mut counts: HashMap<String, usize> = HashMap::new();
            for uid in first {
                if !counts.contains_key(&uid) {
                    order.push(uid.clone());
                    counts.insert(uid, 1);
                }
            }

            let total = args.len();
            for arg in &args[1..] {
                match ctx.eval(arg, ext)? {
                    Value::Array(uids) => {
                        let mut seen_this_round: HashMap<&String, bool> = HashMap::new();
                        for uid in &uids {
                            // count each uid once per argument
                            if seen_this_round.insert(uid, true).is_none() {
                                if let Some(count) = counts.get_mut(uid) {
                                    *count += 1;
                                }
                            }
                        }
                    }
                    other => {
                        return ctx.throw(format!(
                            "invalid types in (and ): array and {}",
                            other.type_name()
                        ))
                    }
                }
            }

            let result = order
                .into_iter()
                .filter(|uid| counts.get(uid).copied().unwrap_or(0) >= total)
                .collect();
            Ok(Value::Array(result))
        }
        first => {
            let mut result = first.cast_bool();
            for arg in &args[1..] {
                if !result {
                    break;
                }
                match ctx.eval(arg, ext)? {
                    Value::Array(_) => {
                        return ctx.throw("invalid types in (and ): bool and array")
                    }
                    value => result = result && value.cast_bool(),
                }
            }
            Ok(Value::Bool(result))
        }
    }
}

/// `or`: logical over booleans, set union over arrays. Every array
/// argument contributes to the union regardless of the running state.
fn term_or(ctx: &mut SearchContext, ext: &mut dyn SearchExt, args: &[Term]) -> Result<Value> {
    if args.is_empty() {
        return ctx.throw("no arguments in (or )");
    }

    match ctx.eval(&args[0], ext)? {
        Value::Array(first) => {
            let mut result: Vec<String> = Vec::new();
            let mut seen: HashMap<String, ()> = HashMap::new();
            for uid in first {
                if seen.insert(uid.clone(), ()).is_none() {
                    result.push(uid);
                }
            }

            for arg in &args[1..] {
                match ctx.eval(arg, ext)? {
                    Value::Array(uids) => {
                        for uid in uids {
                            if seen.insert(uid.clone(), ()).is_none() {
                                result.push(uid);
                            }
                        }
                    }
                    other => {
                        return ctx.throw(format!(
                            "invalid types in (or ): array and {}",
                            other.type_name()
                        ))
                    }
                }
            }

            Ok(Value::Array(result))
        }
        first => {
            let mut result = first.cast_bool();
            for arg in &args[1..] {
                if result {
                    break;
                }
                match ctx.eval(arg, ext)? {
                    Value::Array(_) => {
                        return ctx.throw("invalid types in (or ): bool and array")
                    }
                    value => result = result || value.cast_bool(),
                }
            }
            Ok(Value::Bool(result))
        }
    }
}

fn term_not(ctx: &mut SearchContext, _ext: &mut dyn SearchExt, args: &[Value]) -> Result<Value> {
    if args.len() != 1 {
        return ctx.throw("incorrect number of arguments in (not )");
    }

    match &args[0] {
        // inverting an id set is not defined
        Value::Array(_) => Ok(Value::Void),
        value => Ok(Value::Bool(!value.cast_bool())),
    }
}

enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn of(ctx: &mut SearchContext, value: &Value, op: &str) -> Result<Number> {
        match value {
            Value::Int(n) => Ok(Number::Int(*n)),
            Value::Float(x) => Ok(Number::Float(*x)),
            other => ctx.throw(format!("invalid type {} in ({op} )", other.type_name())),
        }
    }

    fn value(self) -> Value {
        match self {
            Number::Int(n) => Value::Int(n),
            Number::Float(x) => Value::Float(x),
        }
    }

    fn apply(self, rhs: Number, int_op: fn(i64, i64) -> i64, float_op: fn(f64, f64) -> f64) -> Number {
        match (self, rhs) {
            (Number::Int(a), Number::Int(b)) => Number::Int(int_op(a, b)),
            (Number::Int(a), Number::Float(b)) => Number::Float(float_op(a as f64, b)),
            (Number::Float(a), Number::Int(b)) => Number::Float(float_op(a, b as f64)),
            (Number::Float(a), Number::Float(b)) => Number::Float(float_op(a, b)),
        }
    }
}

fn term_add(ctx: &mut SearchContext, _ext: &mut dyn SearchExt, args: &[Value]) -> Result<Value> {
    let mut sum = Number::Int(0);
    for arg in args {
        sum = sum.apply(Number::of(ctx, arg, "+")?, |a, b| a.wrapping_add(b), |a, b| a + b);
    }
    Ok(sum.value())
}

fn term_sub(ctx: &mut SearchContext, _ext: &mut dyn SearchExt, args: &[Value]) -> Result<Value> {
    let Some((first, rest)) = args.split_first() else {
        return Ok(Value::Int(0));
    };

    let mut sum = Number::of(ctx, first, "-")?;
    for arg in rest {
        sum = sum.apply(Number::of(ctx, arg, "-")?, |a, b| a.wrapping_sub(b), |a, b| a - b);
    }
    Ok(sum.value())
}

fn term_mul(ctx: &mut SearchContext, _ext: &mut dyn SearchExt, args: &[Value]) -> Result<Value> {
    let mut product = Number::Int(1);
    for arg in args {
        product = product.apply(Number::of(ctx, arg, "*")?, |a, b| a.wrapping_mul(b), |a, b| a * b);
    }
    Ok(product.value())
}

fn term_div(ctx: &mut SearchContext, _ext: &mut dyn SearchExt, args: &[Value]) -> Result<Value> {
    let Some((first, rest)) = args.split_first() else {
        return ctx.throw("incorrect number of arguments in (/ )");
    };

    let mut quotient = Number::of(ctx, first, "/")?;
    for arg in rest {
        let divisor = Number::of(ctx, arg, "/")?;
        let zero = match divisor {
            Number::Int(n) => n == 0,
            Number::Float(x) => x == 0.0,
        };
        if zero {
            return ctx.throw("division by zero in (/ )");
        }
        quotient = quotient.apply(divisor, |a, b| a.wrapping_div(b), |a, b| a / b);
    }
    Ok(quotient.value())
}

fn term_if(ctx: &mut SearchContext, ext: &mut dyn SearchExt, args: &[Term]) -> Result<Value> {
    if args.len() < 2 || args.len() > 3 {
        return ctx.throw("invalid number of arguments in (if <cond> <then> [<else>])");
    }

    let cond = ctx.eval(&args[0], ext)?.cast_bool();
    if cond {
        ctx.eval(&args[1], ext)
    } else if let Some(otherwise) = args.get(2) {
        ctx.eval(otherwise, ext)
    } else {
        Ok(Value::Void)
    }
}

fn term_begin(ctx: &mut SearchContext, ext: &mut dyn SearchExt, args: &[Term]) -> Result<Value> {
    let mut result = Value::Void;
    for arg in args {
        result = ctx.eval(arg, ext)?;
    }
    Ok(result)
}

fn cast_arg<'a>(
    ctx: &mut SearchContext,
    args: &'a [Value],
    name: &str,
) -> Result<&'a Value> {
    match args {
        [value] => Ok(value),
        _ => ctx.throw(format!("incorrect number of arguments in ({name} )")),
    }
}

fn term_cast_bool(ctx: &mut SearchContext, _ext: &mut dyn SearchExt, args: &[Value]) -> Result<Value> {
    Ok(Value::Bool(cast_arg(ctx, args, "cast-bool")?.cast_bool()))
}

fn term_cast_int(ctx: &mut SearchContext, _ext: &mut dyn SearchExt, args: &[Value]) -> Result<Value> {
    Ok(Value::Int(cast_arg(ctx, args, "cast-int")?.cast_int()))
}

fn term_cast_float(ctx: &mut SearchContext, _ext: &mut dyn SearchExt, args: &[Value]) -> Result<Value> {
    Ok(Value::Float(cast_arg(ctx, args, "cast-float")?.cast_float()))
}

fn term_cast_string(ctx: &mut SearchContext, _ext: &mut dyn SearchExt, args: &[Value]) -> Result<Value> {
    Ok(Value::Str(cast_arg(ctx, args, "cast-string")?.cast_string()))
}
