//! Unevaluated attribute expressions and the context they are evaluated in.

use super::blocks::DatasourceRef;
use super::functions;
use crate::errors::EvalError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Namespace holding input variables.
pub const VAR_NAMESPACE: &str = "var";
/// Namespace holding evaluated locals.
pub const LOCAL_NAMESPACE: &str = "local";
/// Namespace holding resolved data sources.
pub const DATA_NAMESPACE: &str = "data";
/// Namespace describing the source a build job is created from.
pub const SOURCE_NAMESPACE: &str = "source";
/// Namespace holding build-time values visible to provisioners.
pub const BUILD_NAMESPACE: &str = "build";

/// Type tag of an evaluated value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// UTF-8 string.
    String,
    /// Integer or float.
    Number,
    /// Boolean.
    Bool,
    /// Ordered list.
    List,
    /// Map of attribute names to values.
    Object,
    /// Absent value.
    Null,
}

impl ValueType {
    /// Returns the type of `value`.
    #[must_use]
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => Self::String,
            Value::Number(_) => Self::Number,
            Value::Bool(_) => Self::Bool,
            Value::Array(_) => Self::List,
            Value::Object(_) => Self::Object,
            Value::Null => Self::Null,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Object => "object",
            Self::Null => "null",
        };
        f.write_str(name)
    }
}

/// A dotted reference such as `local.region` or `data.http.ami.body`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Traversal {
    root: String,
    steps: Vec<String>,
}

impl Traversal {
    /// Creates a traversal from a root namespace and attribute steps.
    #[must_use]
    pub fn new(root: impl Into<String>, steps: Vec<String>) -> Self {
        Self {
            root: root.into(),
            steps,
        }
    }

    /// Parses a dotted path.
    #[must_use]
    pub fn parse(dotted: &str) -> Self {
        let mut parts = dotted.split('.').map(str::to_string);
        let root = parts.next().unwrap_or_default();
        Self {
            root,
            steps: parts.collect(),
        }
    }

    /// Root namespace.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Attribute steps after the root.
    #[must_use]
    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    /// The data source this traversal points into, if any.
    #[must_use]
    pub fn datasource(&self) -> Option<DatasourceRef> {
        match (self.root.as_str(), self.steps.as_slice()) {
            (DATA_NAMESPACE, [ty, name, ..]) => Some(DatasourceRef::new(ty.as_str(), name.as_str())),
            _ => None,
        }
    }

    /// The local this traversal points at, if any.
    #[must_use]
    pub fn local(&self) -> Option<&str> {
        match (self.root.as_str(), self.steps.first()) {
            (LOCAL_NAMESPACE, Some(name)) => Some(name),
            _ => None,
        }
    }

    /// Number of leading steps that identify an object rather than an attribute.
    fn identity_depth(&self) -> usize {
        if self.root == DATA_NAMESPACE {
            2
        } else {
            1
        }
    }
}

impl fmt::Display for Traversal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.root)?;
        for step in &self.steps {
            write!(f, ".{step}")?;
        }
        Ok(())
    }
}

/// An unevaluated attribute expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant value.
    Literal(Value),
    /// A reference into an evaluation namespace.
    Ref(Traversal),
    /// String interpolation: parts are rendered and concatenated.
    Template(Vec<Expr>),
    /// A list constructor.
    List(Vec<Expr>),
    /// An object constructor.
    Object(Vec<(String, Expr)>),
    /// A builtin function call.
    Call {
        /// Function name.
        name: String,
        /// Argument expressions.
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Literal expression.
    #[must_use]
    pub fn lit(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Reference expression from a dotted path.
    #[must_use]
    pub fn reference(dotted: &str) -> Self {
        Self::Ref(Traversal::parse(dotted))
    }

    /// Template expression.
    #[must_use]
    pub fn template(parts: Vec<Self>) -> Self {
        Self::Template(parts)
    }

    /// Function call expression.
    #[must_use]
    pub fn call(name: impl Into<String>, args: Vec<Self>) -> Self {
        Self::Call {
            name: name.into(),
            args,
        }
    }

    /// Returns true if the expression contains no references or calls.
    #[must_use]
    pub fn is_static(&self) -> bool {
        match self {
            Self::Literal(_) => true,
            Self::Ref(_) | Self::Call { .. } => false,
            Self::Template(parts) | Self::List(parts) => parts.iter().all(Self::is_static),
            Self::Object(entries) => entries.iter().all(|(_, e)| e.is_static()),
        }
    }

    /// Collects every traversal the expression reads.
    #[must_use]
    pub fn traversals(&self) -> Vec<&Traversal> {
        let mut out = Vec::new();
        self.collect_traversals(&mut out);
        out
    }

    fn collect_traversals<'a>(&'a self, out: &mut Vec<&'a Traversal>) {
        match self {
            Self::Literal(_) => {}
            Self::Ref(t) => out.push(t),
            Self::Template(parts) | Self::List(parts) => {
                parts.iter().for_each(|p| p.collect_traversals(out));
            }
            Self::Object(entries) => entries.iter().for_each(|(_, e)| e.collect_traversals(out)),
            Self::Call { args, .. } => args.iter().for_each(|a| a.collect_traversals(out)),
        }
    }

    /// Evaluates the expression.
    pub fn evaluate(&self, ctx: &EvalContext) -> Result<Value, EvalError> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Ref(t) => ctx.lookup(t),
            Self::Template(parts) => {
                let mut out = String::new();
                for part in parts {
                    let value = part.evaluate(ctx)?;
                    out.push_str(&render_template_part(&value)?);
                }
                Ok(Value::String(out))
            }
            Self::List(items) => items
                .iter()
                .map(|e| e.evaluate(ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Self::Object(entries) => {
                let mut map = Map::new();
                for (key, expr) in entries {
                    map.insert(key.clone(), expr.evaluate(ctx)?);
                }
                Ok(Value::Object(map))
            }
            Self::Call { name, args } => {
                let values = args
                    .iter()
                    .map(|e| e.evaluate(ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                functions::call(name, &values)
            }
        }
    }
}

fn render_template_part(value: &Value) -> Result<String, EvalError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(EvalError::TypeMismatch {
            context: "template interpolation".to_string(),
            expected: "string",
            found: ValueType::of(other).to_string(),
        }),
    }
}

/// Namespaces visible to an expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalContext {
    namespaces: BTreeMap<String, Value>,
}

impl EvalContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a namespace.
    #[must_use]
    pub fn with_namespace(mut self, name: impl Into<String>, value: Value) -> Self {
        self.namespaces.insert(name.into(), value);
        self
    }

    /// Adds or replaces a namespace in place.
    pub fn set_namespace(&mut self, name: impl Into<String>, value: Value) {
        self.namespaces.insert(name.into(), value);
    }

    /// Returns true if `name` is a visible namespace.
    #[must_use]
    pub fn has_namespace(&self, name: &str) -> bool {
        self.namespaces.contains_key(name)
    }

    /// Resolves a traversal to its value.
    pub fn lookup(&self, traversal: &Traversal) -> Result<Value, EvalError> {
        let unknown = || EvalError::UnknownReference {
            reference: traversal.to_string(),
        };
        let mut current = self.namespaces.get(traversal.root()).ok_or_else(unknown)?;
        let mut path = traversal.root().to_string();

        for (i, step) in traversal.steps().iter().enumerate() {
            let next = match current {
                Value::Object(map) => map.get(step),
                Value::Array(items) => step.parse::<usize>().ok().and_then(|idx| items.get(idx)),
                _ => None,
            };
            match next {
                Some(value) => {
                    current = value;
                    path.push('.');
                    path.push_str(step);
                }
                None if i < traversal.identity_depth() => return Err(unknown()),
                None => {
                    return Err(EvalError::UnknownAttribute {
                        reference: path,
                        attribute: step.clone(),
                    })
                }
            }
        }
        Ok(current.clone())
    }
}

/// A block's attributes, still unevaluated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Body {
    attributes: BTreeMap<String, Expr>,
}

impl Body {
    /// Creates an empty body.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a body of literal attributes from a JSON object.
    ///
    /// Non-object values produce an empty body.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        let attributes = value
            .as_object()
            .map(|map| {
                map.iter()
                    .map(|(k, v)| (k.clone(), Expr::Literal(v.clone())))
                    .collect()
            })
            .unwrap_or_default();
        Self { attributes }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, expr: Expr) -> Self {
        self.attributes.insert(name.into(), expr);
        self
    }

    /// Sets an attribute in place.
    pub fn set(&mut self, name: impl Into<String>, expr: Expr) {
        self.attributes.insert(name.into(), expr);
    }

    /// Returns an attribute's expression.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Expr> {
        self.attributes.get(name)
    }

    /// Iterates over attributes in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Expr)> {
        self.attributes.iter()
    }

    /// Number of attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Returns true when the body has no attributes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Returns a copy with `overrides` applied on top.
    #[must_use]
    pub fn merge(&self, overrides: &Self) -> Self {
        let mut attributes = self.attributes.clone();
        attributes.extend(overrides.attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { attributes }
    }

    /// Collects every traversal read by any attribute.
    #[must_use]
    pub fn traversals(&self) -> Vec<&Traversal> {
        self.attributes.values().flat_map(Expr::traversals).collect()
    }

    /// Evaluates every attribute into a JSON object.
    ///
    /// All attribute errors are returned, not just the first.
    pub fn evaluate(&self, ctx: &EvalContext) -> Result<Value, Vec<EvalError>> {
        let mut map = Map::new();
        let mut errors = Vec::new();
        for (name, expr) in &self.attributes {
            match expr.evaluate(ctx) {
                Ok(value) => {
                    map.insert(name.clone(), value);
                }
                Err(e) => errors.push(e),
            }
        }
        if errors.is_empty() {
            Ok(Value::Object(map))
        } else {
            Err(errors)
        }
    }
}
