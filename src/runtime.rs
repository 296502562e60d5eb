//! Contract with the compiled configuration handlers
//!
//! The configuration language is compiled ahead of time by an external
//! compiler; the server consumes the result as an opaque handler object.
//! This module defines that boundary: the handler trait, the value kinds
//! crossing it and the registry of native callables the server side
//! exposes to compiled code.

use std::collections::HashMap;

use server::Request;


/// What a handler did with the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Request processing is complete (the handler called `finish`)
    Done,
    /// Asynchronous work was scheduled; `finish` will be called later
    Pending,
}

/// A value crossing the DSL boundary
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Bool(bool),
    Int(i64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Void,
    Bool,
    Int,
    Str,
}

/// How a native callable behaves when compiled code invokes it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallableKind {
    /// Returns a value, request processing continues
    Function,
    /// May terminate request processing (returns `Bool(true)` when it did)
    Handler,
    /// Reads a piece of server state
    Property,
}

pub type NativeFn = Box<Fn(&mut Request, &[Value]) -> Value + Send + Sync>;

pub struct Callable {
    pub kind: CallableKind,
    pub returns: ValueType,
    callback: NativeFn,
}

impl Callable {
    pub fn invoke(&self, req: &mut Request, args: &[Value]) -> Value {
        (self.callback)(req, args)
    }
}

/// Native callables exposed to compiled configuration by name
pub struct Registry {
    callables: HashMap<String, Callable>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            callables: HashMap::new(),
        }
    }

    pub fn register_function<S>(&mut self, name: S, returns: ValueType,
        callback: NativeFn) -> bool
        where S: Into<String>
    {
        self.register(name, CallableKind::Function, returns, callback)
    }

    pub fn register_handler<S>(&mut self, name: S, callback: NativeFn)
        -> bool
        where S: Into<String>
    {
        self.register(name, CallableKind::Handler, ValueType::Bool, callback)
    }

    pub fn register_property<S>(&mut self, name: S, returns: ValueType,
        callback: NativeFn) -> bool
        where S: Into<String>
    {
        self.register(name, CallableKind::Property, returns, callback)
    }

    fn register<S>(&mut self, name: S, kind: CallableKind,
        returns: ValueType, callback: NativeFn) -> bool
        where S: Into<String>
    {
        use std::collections::hash_map::Entry::*;
        match self.callables.entry(name.into()) {
            Occupied(..) => false,
            Vacant(entry) => {
                entry.insert(Callable {
                    kind: kind,
                    returns: returns,
                    callback: callback,
                });
                true
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Callable> {
        self.callables.get(name)
    }
}

/// A compiled unit of the configuration language
///
/// Shared read-only between workers; per-request state lives in the
/// `Request` the server passes in.
pub trait Handler: Send + Sync {
    /// Runs once at startup, before any listener starts
    fn setup(&self) {}

    /// Decide how to answer a request
    fn main(&self, req: &mut Request) -> Outcome;
}

/// The external compiler interface
pub trait Compiler {
    fn compile(&self, source: &str, optimization_level: u32)
        -> Result<Box<Handler>, CompileError>;
}

quick_error! {
    #[derive(Debug)]
    pub enum CompileError {
        Message(msg: String) {
            description("configuration compile error")
            display("configuration compile error: {}", msg)
            from()
        }
    }
}

/// Adapter turning a plain function into a `Handler`
///
/// Mostly useful in tests and small built-in configurations.
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
    where F: Fn(&mut Request) -> Outcome + Send + Sync
{
    pub fn new(f: F) -> FnHandler<F> {
        FnHandler(f)
    }
}

impl<F> Handler for FnHandler<F>
    where F: Fn(&mut Request) -> Outcome + Send + Sync
{
    fn main(&self, req: &mut Request) -> Outcome {
        (self.0)(req)
    }
}
