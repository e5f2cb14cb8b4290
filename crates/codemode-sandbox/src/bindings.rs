//! Capability bindings.
//!
//! The host owns a [`CapabilityTable`] of named callables. Only its *names*
//! cross into the worker, as [`SerializedBindings`]. When the worker calls back,
//! the host checks the call against the [`Grant`] compiled from the bindings of
//! the execution that made it; [`PermittedCall`] is the proof that check passed.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use codemode_error::{qualified_name, DispatchError};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SandboxError;
use crate::CapabilityDispatcher;

/// The introspection method present on every group. Never serialized, never dispatched.
pub const HELP_METHOD: &str = "help";

/// Reserved table key under which ungrouped (top-level) methods are stored.
pub const TOP_LEVEL_KEY: &str = "$top";

/// Globals a binding name may not shadow.
const RESERVED_GLOBALS: &[&str] = &[
    "help",
    "codemode",
    "globalThis",
    "undefined",
    "NaN",
    "Infinity",
    "Object",
    "Array",
    "Function",
    "Promise",
    "JSON",
    "Math",
    "String",
    "Number",
    "Boolean",
    "Symbol",
    "BigInt",
    "Error",
    "TypeError",
    "RangeError",
    "Date",
    "RegExp",
    "Map",
    "Set",
    "WeakMap",
    "WeakSet",
    "Reflect",
    "Proxy",
    "eval",
    "Deno",
    "arguments",
];

static IDENTIFIER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("identifier pattern is valid")
});

/// A host-side callable reachable from scripts.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Perform the operation with the script's JSON arguments.
    async fn call(&self, args: Value) -> Result<Value, DispatchError>;
}

struct FnCapability<F>(F);

#[async_trait]
impl<F, Fut> Capability for FnCapability<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, DispatchError>> + Send,
{
    async fn call(&self, args: Value) -> Result<Value, DispatchError> {
        (self.0)(args).await
    }
}

/// Wrap an async closure as a [`Capability`].
pub fn capability_fn<F, Fut>(f: F) -> Arc<dyn Capability>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, DispatchError>> + Send + 'static,
{
    Arc::new(FnCapability(f))
}

/// Host-side table of named capabilities, keyed by group then method.
///
/// Insertion order is preserved so serialized bindings and `help()` output
/// are stable.
#[derive(Clone, Default)]
pub struct CapabilityTable {
    groups: IndexMap<String, IndexMap<String, Arc<dyn Capability>>>,
}

impl CapabilityTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `group.method`. Replaces an existing entry with the same name.
    pub fn register(
        &mut self,
        group: impl Into<String>,
        method: impl Into<String>,
        capability: Arc<dyn Capability>,
    ) -> &mut Self {
        self.groups
            .entry(group.into())
            .or_default()
            .insert(method.into(), capability);
        self
    }

    /// Register an ungrouped method, exposed to scripts as a global function.
    pub fn register_top_level(
        &mut self,
        method: impl Into<String>,
        capability: Arc<dyn Capability>,
    ) -> &mut Self {
        self.register(TOP_LEVEL_KEY, method, capability)
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(
        mut self,
        group: impl Into<String>,
        method: impl Into<String>,
        capability: Arc<dyn Capability>,
    ) -> Self {
        self.register(group, method, capability);
        self
    }

    /// Builder form of [`register_top_level`](Self::register_top_level).
    pub fn with_top_level(mut self, method: impl Into<String>, capability: Arc<dyn Capability>) -> Self {
        self.register_top_level(method, capability);
        self
    }

    /// Find the capability behind a call target.
    pub fn lookup(&self, group: Option<&str>, method: &str) -> Result<&Arc<dyn Capability>, DispatchError> {
        let key = group.unwrap_or(TOP_LEVEL_KEY);
        let methods = self.groups.get(key).ok_or_else(|| match group {
            Some(g) => DispatchError::GroupNotFound(g.to_string()),
            None => DispatchError::MethodNotFound {
                method: method.to_string(),
            },
        })?;
        methods
            .get(method)
            .filter(|_| method != HELP_METHOD)
            .ok_or_else(|| DispatchError::MethodNotFound {
                method: qualified_name(group, method),
            })
    }

    /// Name-only projection of the table. See [`serialize_bindings`].
    pub fn serialize(&self) -> SerializedBindings {
        serialize_bindings(self)
    }

    /// Whether the table holds no capabilities.
    pub fn is_empty(&self) -> bool {
        self.groups.values().all(|m| m.is_empty())
    }
}

impl fmt::Debug for CapabilityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.groups
                    .iter()
                    .map(|(g, methods)| (g, methods.keys().collect::<Vec<_>>())),
            )
            .finish()
    }
}

#[async_trait]
impl CapabilityDispatcher for CapabilityTable {
    async fn dispatch(&self, call: &PermittedCall, args: Value) -> Result<Value, DispatchError> {
        let capability = self.lookup(call.group(), call.method())?;
        capability.call(args).await
    }
}

/// Name-only description of the capabilities granted to one execution.
///
/// This is the only form in which bindings reach the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedBindings {
    /// Group name to method names, `help` excluded.
    #[serde(default)]
    pub groups: IndexMap<String, Vec<String>>,
    /// Ungrouped method names.
    #[serde(default)]
    pub top_level: Vec<String>,
}

/// Project a capability table onto names.
///
/// Each real group maps to its method names minus `help`; entries under the
/// reserved top-level key become `top_level`. An empty table yields empty
/// bindings.
pub fn serialize_bindings(table: &CapabilityTable) -> SerializedBindings {
    let mut out = SerializedBindings::default();
    for (group, methods) in &table.groups {
        let names = methods
            .keys()
            .filter(|m| m.as_str() != HELP_METHOD)
            .cloned()
            .collect::<Vec<_>>();
        if group == TOP_LEVEL_KEY {
            out.top_level.extend(names);
        } else {
            out.groups.insert(group.clone(), names);
        }
    }
    out
}

impl SerializedBindings {
    /// Create empty bindings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a group with the given methods.
    pub fn with_group<I, S>(mut self, group: impl Into<String>, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups
            .insert(group.into(), methods.into_iter().map(Into::into).collect());
        self
    }

    /// Add an ungrouped method.
    pub fn with_top_level(mut self, method: impl Into<String>) -> Self {
        self.top_level.push(method.into());
        self
    }

    /// Keep only the named groups. Top-level methods are kept.
    pub fn retain_groups(mut self, keep: &[&str]) -> Self {
        self.groups.retain(|g, _| keep.contains(&g.as_str()));
        self
    }

    /// True when nothing is granted.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.top_level.is_empty()
    }

    /// Check that every name can be installed as a JavaScript global or property.
    ///
    /// Group and top-level names must be identifiers that do not shadow a
    /// reserved global, must not collide with each other, and methods must be
    /// unique within their group.
    pub fn validate(&self) -> Result<(), SandboxError> {
        let mut globals = HashSet::new();
        for (group, methods) in &self.groups {
            check_global_name(group, "group")?;
            if !globals.insert(group.as_str()) {
                return Err(invalid(format!("duplicate global name '{group}'")));
            }
            let mut seen = HashSet::new();
            for method in methods {
                check_identifier(method, "method")?;
                if method == HELP_METHOD {
                    return Err(invalid(format!("'{group}.help' is reserved")));
                }
                if !seen.insert(method.as_str()) {
                    return Err(invalid(format!("duplicate method '{group}.{method}'")));
                }
            }
        }
        for method in &self.top_level {
            check_global_name(method, "top-level method")?;
            if !globals.insert(method.as_str()) {
                return Err(invalid(format!("duplicate global name '{method}'")));
            }
        }
        Ok(())
    }
}

fn invalid(reason: String) -> SandboxError {
    SandboxError::InvalidBindings { reason }
}

fn check_identifier(name: &str, what: &str) -> Result<(), SandboxError> {
    if IDENTIFIER_RE.is_match(name) {
        Ok(())
    } else {
        Err(invalid(format!("{what} name '{name}' is not a valid identifier")))
    }
}

fn check_global_name(name: &str, what: &str) -> Result<(), SandboxError> {
    check_identifier(name, what)?;
    if RESERVED_GLOBALS.contains(&name) {
        return Err(invalid(format!("{what} name '{name}' shadows a reserved global")));
    }
    Ok(())
}

/// One addressable capability.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallTarget {
    /// `group.method`
    Grouped {
        /// Group name.
        group: String,
        /// Method name.
        method: String,
    },
    /// An ungrouped global function.
    TopLevel {
        /// Method name.
        method: String,
    },
}

impl CallTarget {
    fn new(group: Option<&str>, method: &str) -> Self {
        match group {
            Some(group) => Self::Grouped {
                group: group.to_string(),
                method: method.to_string(),
            },
            None => Self::TopLevel {
                method: method.to_string(),
            },
        }
    }

    /// Group name, `None` for top-level methods.
    pub fn group(&self) -> Option<&str> {
        match self {
            Self::Grouped { group, .. } => Some(group),
            Self::TopLevel { .. } => None,
        }
    }

    /// Method name.
    pub fn method(&self) -> &str {
        match self {
            Self::Grouped { method, .. } | Self::TopLevel { method } => method,
        }
    }
}

impl fmt::Display for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&qualified_name(self.group(), self.method()))
    }
}

/// A call that has passed [`Grant::authorize`].
///
/// Has no public constructor: holding one proves the target was granted.
#[derive(Debug, Clone)]
pub struct PermittedCall {
    target: CallTarget,
}

impl PermittedCall {
    /// The authorized target.
    pub fn target(&self) -> &CallTarget {
        &self.target
    }

    /// Group name, `None` for top-level methods.
    pub fn group(&self) -> Option<&str> {
        self.target.group()
    }

    /// Method name.
    pub fn method(&self) -> &str {
        self.target.method()
    }
}

/// The closed set of targets one execution may call.
#[derive(Debug, Clone, Default)]
pub struct Grant {
    targets: HashSet<CallTarget>,
}

impl Grant {
    /// Compile the bindings of an execution into its grant.
    pub fn from_bindings(bindings: &SerializedBindings) -> Self {
        let grouped = bindings.groups.iter().flat_map(|(group, methods)| {
            methods
                .iter()
                .filter(|m| m.as_str() != HELP_METHOD)
                .map(move |m| CallTarget::new(Some(group), m))
        });
        let top = bindings
            .top_level
            .iter()
            .map(|m| CallTarget::new(None, m));
        Self {
            targets: grouped.chain(top).collect(),
        }
    }

    /// Authorize a call. Anything outside the grant is `NotPermitted`.
    pub fn authorize(&self, group: Option<&str>, method: &str) -> Result<PermittedCall, DispatchError> {
        let target = CallTarget::new(group, method);
        if self.targets.contains(&target) {
            Ok(PermittedCall { target })
        } else {
            Err(DispatchError::NotPermitted {
                method: target.to_string(),
            })
        }
    }

    /// Every granted `(group, method)` pair, sorted; top-level methods use an empty group.
    pub fn known_methods(&self) -> Vec<(&str, &str)> {
        let mut known: Vec<_> = self
            .targets
            .iter()
            .map(|t| (t.group().unwrap_or(""), t.method()))
            .collect();
        known.sort_unstable();
        known
    }

    /// Number of granted targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// True when nothing is granted.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
