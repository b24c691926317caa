use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::value::{Value, ValueShape};

/// Priorities of the built-in resolvers. Higher runs first; ties between
/// custom resolvers fall back to registration order.
pub const PRIORITY_SELF: i32 = 100;
pub const PRIORITY_ITERATION: i32 = 90;
pub const PRIORITY_MAP: i32 = 80;
pub const PRIORITY_INDEX: i32 = 70;
pub const PRIORITY_ACCESSOR: i32 = 60;

/// Per-lookup scratch state. Resolvers may register release callbacks to
/// free resources tied to the resolved value; callbacks run in registration
/// order when the owning lookup finishes.
#[derive(Default)]
pub struct ResolutionContext {
    callbacks: Vec<Box<dyn FnOnce() + Send>>,
}

impl ResolutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_release(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.callbacks.push(Box::new(callback));
    }
}

impl Drop for ResolutionContext {
    fn drop(&mut self) {
        for callback in self.callbacks.drain(..) {
            callback();
        }
    }
}

pub type ResolverFn =
    Arc<dyn Fn(Option<&Value>, &str, &mut ResolutionContext) -> Option<Value> + Send + Sync>;

pub type AccessorFn = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// A user-supplied resolver with an explicit priority.
#[derive(Clone)]
pub struct CustomResolver {
    name: String,
    priority: i32,
    f: ResolverFn,
}

impl CustomResolver {
    pub fn new(
        name: impl Into<String>,
        priority: i32,
        f: impl Fn(Option<&Value>, &str, &mut ResolutionContext) -> Option<Value>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            f: Arc::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for CustomResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomResolver")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

/// The closed set of resolver kinds evaluated by the chain.
#[derive(Debug, Clone)]
enum Resolver {
    SelfRef,
    Iteration,
    Map,
    Index,
    Accessor,
    Custom(CustomResolver),
}

impl Resolver {
    fn priority(&self) -> i32 {
        match self {
            Resolver::SelfRef => PRIORITY_SELF,
            Resolver::Iteration => PRIORITY_ITERATION,
            Resolver::Map => PRIORITY_MAP,
            Resolver::Index => PRIORITY_INDEX,
            Resolver::Accessor => PRIORITY_ACCESSOR,
            Resolver::Custom(c) => c.priority,
        }
    }
}

/// The fast-path kinds a hint can capture. Only the built-in resolvers with
/// a pure, type-keyed lookup produce hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HintKind {
    SelfRef,
    Iteration,
    Map,
    Index,
}

/// A cached fast path for one tag's first key segment.
///
/// Created after the first successful resolution; reused while the context
/// object's shape still matches, otherwise the lookup falls back to the full
/// chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hint {
    kind: HintKind,
    shape: ValueShape,
}

impl Hint {
    pub fn resolve(&self, object: &Value, name: &str) -> Option<Value> {
        if object.shape() != self.shape {
            return None;
        }
        match self.kind {
            HintKind::SelfRef => resolve_self(object, name),
            HintKind::Iteration => resolve_iteration(object, name),
            HintKind::Map => resolve_map(object, name),
            HintKind::Index => resolve_index(object, name),
        }
    }
}

fn resolve_self(object: &Value, name: &str) -> Option<Value> {
    if name == "." || name == "this" {
        Some(object.clone())
    } else {
        None
    }
}

fn resolve_iteration(object: &Value, name: &str) -> Option<Value> {
    let Value::Iteration(meta) = object else {
        return None;
    };
    match name {
        "iter" => Some(object.clone()),
        "index" => Some(Value::Integer(meta.index() as i64)),
        "position" => Some(Value::Integer(meta.position() as i64)),
        "length" => Some(Value::Integer(meta.length() as i64)),
        "first" => Some(Value::Bool(meta.is_first())),
        "last" => Some(Value::Bool(meta.is_last())),
        "hasNext" => Some(Value::Bool(meta.has_next())),
        "odd" => Some(Value::Bool(meta.is_odd())),
        "even" => Some(Value::Bool(meta.is_even())),
        _ => None,
    }
}

fn resolve_map(object: &Value, name: &str) -> Option<Value> {
    let Value::Map(map) = object else {
        return None;
    };
    map.get(name).cloned()
}

fn resolve_index(object: &Value, name: &str) -> Option<Value> {
    let Value::Array(array) = object else {
        return None;
    };
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let index: usize = name.parse().ok()?;
    array.get(index).cloned()
}

/// Bounded cache of member-accessor lookups, keyed by value type tag and
/// member name. Misses are cached too. Once the capacity is reached new
/// entries are computed but not retained.
pub struct MemberCache {
    capacity: usize,
    entries: RwLock<HashMap<(String, String), Option<AccessorFn>>>,
}

impl MemberCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_compute(
        &self,
        type_tag: &str,
        member: &str,
        compute: impl FnOnce() -> Option<AccessorFn>,
    ) -> Option<AccessorFn> {
        if let Ok(entries) = self.entries.read() {
            if let Some(cached) = entries.get(&(type_tag.to_string(), member.to_string())) {
                return cached.clone();
            }
        }
        let computed = compute();
        if let Ok(mut entries) = self.entries.write() {
            if entries.len() < self.capacity {
                entries
                    .entry((type_tag.to_string(), member.to_string()))
                    .or_insert_with(|| computed.clone());
            }
        }
        computed
    }

    /// Drop every entry matched by the predicate.
    pub fn invalidate_matching(&self, predicate: impl Fn(&str, &str) -> bool) {
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|(type_tag, member), _| !predicate(type_tag, member));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The ordered resolver chain shared by every render of an engine.
///
/// Resolution tries resolvers in descending priority and short-circuits on
/// the first match. Resolvers fail closed: an inapplicable resolver returns
/// no match rather than an error.
pub struct ResolverChain {
    resolvers: RwLock<Vec<Resolver>>,
    accessors: RwLock<HashMap<(String, String), AccessorFn>>,
    member_cache: MemberCache,
}

impl ResolverChain {
    pub fn new(member_cache_capacity: usize) -> Self {
        let mut resolvers = vec![
            Resolver::SelfRef,
            Resolver::Iteration,
            Resolver::Map,
            Resolver::Index,
            Resolver::Accessor,
        ];
        resolvers.sort_by_key(|r| std::cmp::Reverse(r.priority()));
        Self {
            resolvers: RwLock::new(resolvers),
            accessors: RwLock::new(HashMap::new()),
            member_cache: MemberCache::new(member_cache_capacity),
        }
    }

    /// Register a custom resolver. The chain stays sorted by priority with
    /// registration order deciding ties.
    pub fn register(&self, resolver: CustomResolver) {
        if let Ok(mut resolvers) = self.resolvers.write() {
            resolvers.push(Resolver::Custom(resolver));
            resolvers.sort_by_key(|r| std::cmp::Reverse(r.priority()));
        }
    }

    /// Register a member accessor for a value type tag, e.g.
    /// `("string", "length")`. Stale cache entries for the member are
    /// invalidated.
    pub fn register_accessor(
        &self,
        type_tag: impl Into<String>,
        member: impl Into<String>,
        f: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    ) {
        let type_tag = type_tag.into();
        let member = member.into();
        if let Ok(mut accessors) = self.accessors.write() {
            accessors.insert((type_tag.clone(), member.clone()), Arc::new(f));
        }
        self.member_cache
            .invalidate_matching(|t, m| t == type_tag && m == member);
    }

    pub fn member_cache(&self) -> &MemberCache {
        &self.member_cache
    }

    /// Resolve one name segment against a context object. Returns the value
    /// and, when the winning resolver supports it, a reusable hint.
    pub fn resolve(
        &self,
        object: Option<&Value>,
        name: &str,
        rctx: &mut ResolutionContext,
    ) -> Option<(Value, Option<Hint>)> {
        let resolvers = self.resolvers.read().ok()?;
        for resolver in resolvers.iter() {
            let (value, kind) = match resolver {
                Resolver::SelfRef => (object.and_then(|o| resolve_self(o, name)), Some(HintKind::SelfRef)),
                Resolver::Iteration => {
                    (object.and_then(|o| resolve_iteration(o, name)), Some(HintKind::Iteration))
                }
                Resolver::Map => (object.and_then(|o| resolve_map(o, name)), Some(HintKind::Map)),
                Resolver::Index => (object.and_then(|o| resolve_index(o, name)), Some(HintKind::Index)),
                Resolver::Accessor => (object.and_then(|o| self.resolve_accessor(o, name)), None),
                Resolver::Custom(custom) => ((custom.f)(object, name, rctx), None),
            };
            if let Some(value) = value {
                let hint = match (kind, object) {
                    (Some(kind), Some(object)) => Some(Hint {
                        kind,
                        shape: object.shape(),
                    }),
                    _ => None,
                };
                return Some((value, hint));
            }
        }
        None
    }

    fn resolve_accessor(&self, object: &Value, name: &str) -> Option<Value> {
        let type_tag = object.type_name();
        let accessor = self.member_cache.get_or_compute(type_tag, name, || {
            self.accessors
                .read()
                .ok()?
                .get(&(type_tag.to_string(), name.to_string()))
                .cloned()
        })?;
        accessor(object)
    }
}

impl fmt::Debug for ResolverChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.resolvers.read().map(|r| r.len()).unwrap_or(0);
        f.debug_struct("ResolverChain")
            .field("resolvers", &count)
            .finish()
    }
}
