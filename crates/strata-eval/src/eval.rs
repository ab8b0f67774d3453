use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use strata_config::{Expr, Reference};
use strata_domain::{
    AbsResource, Diagnostic, Diagnostics, InstanceKey, MarkedValue, Marks, ModuleInstance,
    PathStep, ResourceInstance, Value,
};

use crate::expand::{Expander, Expansion};

// ── Scope ─────────────────────────────────────────────────────────────────────

/// The local bindings one expression evaluation runs under.
#[derive(Debug, Clone)]
pub struct Scope {
    pub module: ModuleInstance,
    pub each: Option<(String, MarkedValue)>,
    pub count_index: Option<i64>,
    pub self_value: Option<MarkedValue>,
}

impl Scope {
    pub fn module(module: ModuleInstance) -> Self {
        Scope { module, each: None, count_index: None, self_value: None }
    }

    pub fn root() -> Self {
        Scope::module(ModuleInstance::root())
    }

    /// Bindings for one instance of a repeated block.
    pub fn with_key(mut self, key: &InstanceKey, each_value: Option<MarkedValue>) -> Self {
        match key {
            InstanceKey::NoKey => {}
            InstanceKey::Int(i) => self.count_index = Some(*i),
            InstanceKey::Str(s) => {
                let value =
                    each_value.unwrap_or_else(|| MarkedValue::unmarked(Value::string(s.clone())));
                self.each = Some((s.clone(), value));
            }
        }
        self
    }

    pub fn with_self(mut self, value: MarkedValue) -> Self {
        self.self_value = Some(value);
        self
    }
}

// ── Shared evaluation tables ──────────────────────────────────────────────────

/// Values produced so far during the walk, shared by every node. Resource
/// entries hold the working value for each instance — refreshed for data
/// reads, planned (possibly partially unknown) for managed resources — so
/// downstream expressions see the post-plan world.
#[derive(Debug)]
pub struct EvalData {
    expander: Arc<Expander>,
    variables: RwLock<HashMap<(ModuleInstance, String), MarkedValue>>,
    locals: RwLock<HashMap<(ModuleInstance, String), MarkedValue>>,
    module_outputs: RwLock<HashMap<ModuleInstance, BTreeMap<String, MarkedValue>>>,
    resources: RwLock<HashMap<ResourceInstance, MarkedValue>>,
}

impl EvalData {
    pub fn new(expander: Arc<Expander>) -> Self {
        EvalData {
            expander,
            variables: RwLock::new(HashMap::new()),
            locals: RwLock::new(HashMap::new()),
            module_outputs: RwLock::new(HashMap::new()),
            resources: RwLock::new(HashMap::new()),
        }
    }

    pub fn expander(&self) -> &Expander {
        &self.expander
    }

    pub fn set_variable(&self, module: &ModuleInstance, name: &str, value: MarkedValue) {
        self.variables
            .write()
            .unwrap()
            .insert((module.clone(), name.to_string()), value);
    }

    pub fn variable(&self, module: &ModuleInstance, name: &str) -> Option<MarkedValue> {
        self.variables
            .read()
            .unwrap()
            .get(&(module.clone(), name.to_string()))
            .cloned()
    }

    pub fn set_local(&self, module: &ModuleInstance, name: &str, value: MarkedValue) {
        self.locals
            .write()
            .unwrap()
            .insert((module.clone(), name.to_string()), value);
    }

    pub fn local(&self, module: &ModuleInstance, name: &str) -> Option<MarkedValue> {
        self.locals
            .read()
            .unwrap()
            .get(&(module.clone(), name.to_string()))
            .cloned()
    }

    pub fn set_module_output(&self, child: &ModuleInstance, name: &str, value: MarkedValue) {
        self.module_outputs
            .write()
            .unwrap()
            .entry(child.clone())
            .or_default()
            .insert(name.to_string(), value);
    }

    /// The outputs of one module instance as an object value.
    pub fn module_outputs_object(&self, child: &ModuleInstance) -> MarkedValue {
        let outputs = self.module_outputs.read().unwrap();
        let Some(entries) = outputs.get(child) else {
            return MarkedValue::unmarked(Value::Map(BTreeMap::new()));
        };
        let mut map = BTreeMap::new();
        let mut marks = Marks::new();
        for (name, mv) in entries {
            map.insert(name.clone(), mv.value.clone());
            marks.merge(mv.marks.ascend(PathStep::Key(name.clone())));
        }
        MarkedValue::new(Value::Map(map), marks)
    }

    pub fn set_resource_value(&self, addr: &ResourceInstance, value: MarkedValue) {
        self.resources
            .write()
            .unwrap()
            .insert(addr.clone(), value);
    }

    pub fn resource_value(&self, addr: &ResourceInstance) -> Option<MarkedValue> {
        self.resources.read().unwrap().get(addr).cloned()
    }

    fn resource_value_or_unknown(&self, addr: &ResourceInstance) -> MarkedValue {
        self.resource_value(addr)
            .unwrap_or_else(|| MarkedValue::unmarked(Value::Unknown))
    }
}

// ── Expression evaluation ─────────────────────────────────────────────────────

fn err(summary: &str, detail: impl Into<String>) -> Diagnostics {
    let mut diags = Diagnostics::new();
    diags.push(Diagnostic::error(summary, detail.into()));
    diags
}

/// Root-collapse the marks of operands feeding a scalar result: any mark kind
/// present anywhere on an input marks the whole output.
fn collapse_marks(inputs: &[&Marks]) -> Marks {
    let mut out = Marks::new();
    for marks in inputs {
        for (_, mark) in marks.iter() {
            out.insert(strata_domain::AttrPath::root(), *mark);
        }
    }
    out
}

pub fn eval_expr(expr: &Expr, scope: &Scope, data: &EvalData) -> Result<MarkedValue, Diagnostics> {
    match expr {
        Expr::Lit(value) => Ok(MarkedValue::unmarked(value.clone())),

        Expr::Ref(reference) => eval_reference(reference, scope, data),

        Expr::GetAttr(base, name) => {
            let base = eval_expr(base, scope, data)?;
            let marks = base.marks.descend(&PathStep::Key(name.clone()));
            match base.value {
                Value::Unknown => Ok(MarkedValue::new(Value::Unknown, marks)),
                Value::Map(mut entries) => {
                    let value = entries.remove(name).unwrap_or(Value::Null);
                    Ok(MarkedValue::new(value, marks))
                }
                Value::Null => Err(err(
                    "Attempt to get attribute from null value",
                    format!("This value has no attribute {:?} because it is null.", name),
                )),
                _ => Err(err(
                    "Unsupported attribute access",
                    format!("Only object values have attributes; {:?} is not one.", name),
                )),
            }
        }

        Expr::Index(base, key_expr) => {
            let base = eval_expr(base, scope, data)?;
            let key = eval_expr(key_expr, scope, data)?;
            let key_marks = collapse_marks(&[&key.marks]);
            if key.value.is_unknown() || base.value.is_unknown() {
                return Ok(MarkedValue::new(
                    Value::Unknown,
                    collapse_marks(&[&base.marks, &key.marks]),
                ));
            }
            match (&base.value, &key.value) {
                (Value::List(items), Value::Number(n)) => {
                    let index = n.as_i64().unwrap_or(-1);
                    let item = usize::try_from(index)
                        .ok()
                        .and_then(|i| items.get(i))
                        .cloned();
                    match item {
                        Some(value) => {
                            let mut marks = base.marks.descend(&PathStep::Index(index));
                            marks.merge(key_marks);
                            Ok(MarkedValue::new(value, marks))
                        }
                        None => Err(err(
                            "Invalid index",
                            format!("The given index {} is out of range.", index),
                        )),
                    }
                }
                (Value::Map(entries), Value::String(k)) => match entries.get(k) {
                    Some(value) => {
                        let mut marks = base.marks.descend(&PathStep::Key(k.clone()));
                        marks.merge(key_marks);
                        Ok(MarkedValue::new(value.clone(), marks))
                    }
                    None => Err(err(
                        "Invalid index",
                        format!("The given key {:?} does not exist in this map.", k),
                    )),
                },
                _ => Err(err(
                    "Invalid index",
                    "Only lists indexed by number and maps indexed by string are supported.",
                )),
            }
        }

        Expr::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            let mut marks = Marks::new();
            let mut diags = Diagnostics::new();
            for (i, item) in items.iter().enumerate() {
                match eval_expr(item, scope, data) {
                    Ok(mv) => {
                        marks.merge(mv.marks.ascend(PathStep::Index(i as i64)));
                        values.push(mv.value);
                    }
                    Err(e) => {
                        diags.append(e);
                    }
                }
            }
            if diags.has_errors() {
                return Err(diags);
            }
            Ok(MarkedValue::new(Value::List(values), marks))
        }

        Expr::Object(entries) => {
            let mut map = BTreeMap::new();
            let mut marks = Marks::new();
            let mut diags = Diagnostics::new();
            for (name, item) in entries {
                match eval_expr(item, scope, data) {
                    Ok(mv) => {
                        marks.merge(mv.marks.ascend(PathStep::Key(name.clone())));
                        map.insert(name.clone(), mv.value);
                    }
                    Err(e) => {
                        diags.append(e);
                    }
                }
            }
            if diags.has_errors() {
                return Err(diags);
            }
            Ok(MarkedValue::new(Value::Map(map), marks))
        }

        Expr::Template(parts) => {
            let mut rendered = String::new();
            let mut marks_in = Vec::new();
            let mut unknown = false;
            let mut parts_v = Vec::with_capacity(parts.len());
            for part in parts {
                let mv = eval_expr(part, scope, data)?;
                parts_v.push(mv);
            }
            for mv in &parts_v {
                marks_in.push(&mv.marks);
                match &mv.value {
                    Value::Unknown => unknown = true,
                    Value::String(s) => rendered.push_str(s),
                    Value::Number(n) => rendered.push_str(&n.to_string()),
                    Value::Bool(b) => rendered.push_str(if *b { "true" } else { "false" }),
                    other => {
                        return Err(err(
                            "Invalid template interpolation value",
                            format!("Cannot include {:?} in a string template.", other),
                        ))
                    }
                }
            }
            let marks = collapse_marks(&marks_in);
            if unknown {
                return Ok(MarkedValue::new(Value::Unknown, marks));
            }
            Ok(MarkedValue::new(Value::String(rendered), marks))
        }

        Expr::Eq(a, b) => {
            let a = eval_expr(a, scope, data)?;
            let b = eval_expr(b, scope, data)?;
            let marks = collapse_marks(&[&a.marks, &b.marks]);
            if a.value.is_unknown() || b.value.is_unknown() {
                return Ok(MarkedValue::new(Value::Unknown, marks));
            }
            Ok(MarkedValue::new(Value::Bool(a.value == b.value), marks))
        }

        Expr::Not(inner) => {
            let inner = eval_expr(inner, scope, data)?;
            let marks = collapse_marks(&[&inner.marks]);
            match inner.value {
                Value::Unknown => Ok(MarkedValue::new(Value::Unknown, marks)),
                Value::Bool(b) => Ok(MarkedValue::new(Value::Bool(!b), marks)),
                _ => Err(err("Invalid operand", "Boolean negation requires a bool value.")),
            }
        }

        Expr::And(a, b) | Expr::Or(a, b) => {
            let is_and = matches!(expr, Expr::And(..));
            let a = eval_expr(a, scope, data)?;
            let b = eval_expr(b, scope, data)?;
            let marks = collapse_marks(&[&a.marks, &b.marks]);
            let short = |v: &Value| match v {
                // The decided operand of and/or settles the result even if
                // the other side is unknown.
                Value::Bool(bv) => {
                    if is_and {
                        (!bv).then_some(false)
                    } else {
                        (*bv).then_some(true)
                    }
                }
                _ => None,
            };
            if let Some(decided) = short(&a.value).or_else(|| short(&b.value)) {
                return Ok(MarkedValue::new(Value::Bool(decided), marks));
            }
            if a.value.is_unknown() || b.value.is_unknown() {
                return Ok(MarkedValue::new(Value::Unknown, marks));
            }
            match (a.value.as_bool(), b.value.as_bool()) {
                (Some(av), Some(bv)) => {
                    let result = if is_and { av && bv } else { av || bv };
                    Ok(MarkedValue::new(Value::Bool(result), marks))
                }
                _ => Err(err("Invalid operand", "Logical operators require bool values.")),
            }
        }

        Expr::Conditional(cond, then, otherwise) => {
            let cond = eval_expr(cond, scope, data)?;
            match cond.value {
                Value::Unknown => {
                    let then = eval_expr(then, scope, data)?;
                    let otherwise = eval_expr(otherwise, scope, data)?;
                    let marks = collapse_marks(&[&cond.marks, &then.marks, &otherwise.marks]);
                    Ok(MarkedValue::new(Value::Unknown, marks))
                }
                Value::Bool(true) => {
                    let mut result = eval_expr(then, scope, data)?;
                    result.marks.merge(collapse_marks(&[&cond.marks]));
                    Ok(result)
                }
                Value::Bool(false) => {
                    let mut result = eval_expr(otherwise, scope, data)?;
                    result.marks.merge(collapse_marks(&[&cond.marks]));
                    Ok(result)
                }
                Value::Null => Err(err(
                    "Invalid condition",
                    "The condition value is null; a bool is required.",
                )),
                _ => Err(err(
                    "Invalid condition",
                    "The condition value is not a bool.",
                )),
            }
        }
    }
}

fn eval_reference(
    reference: &Reference,
    scope: &Scope,
    data: &EvalData,
) -> Result<MarkedValue, Diagnostics> {
    match reference {
        Reference::Var(name) => data.variable(&scope.module, name).ok_or_else(|| {
            err(
                "Reference to undeclared input variable",
                format!("An input variable named {:?} has no value here.", name),
            )
        }),

        Reference::Local(name) => data.local(&scope.module, name).ok_or_else(|| {
            err(
                "Reference to undeclared local value",
                format!("A local value named {:?} has not been declared here.", name),
            )
        }),

        Reference::Resource(resource) => {
            let abs = AbsResource {
                module: scope.module.clone(),
                resource: resource.clone(),
            };
            let Some(expansion) = data.expander().resource_expansion(&abs) else {
                return Err(err(
                    "Reference to undeclared resource",
                    format!("A resource {} has not been declared here.", abs.resource),
                ));
            };
            Ok(aggregate_instances(&abs, &expansion, data))
        }

        Reference::ModuleCall(name) => {
            let Some(expansion) = data.expander().module_expansion(&scope.module, name) else {
                return Err(err(
                    "Reference to undeclared module",
                    format!("No module call named {:?} is declared here.", name),
                ));
            };
            match expansion {
                Expansion::Unknown => Ok(MarkedValue::unmarked(Value::Unknown)),
                Expansion::Single => {
                    let child = scope.module.child(name.clone(), InstanceKey::NoKey);
                    Ok(data.module_outputs_object(&child))
                }
                Expansion::Count(n) => {
                    let mut items = Vec::new();
                    let mut marks = Marks::new();
                    for i in 0..n as i64 {
                        let child = scope.module.child(name.clone(), InstanceKey::Int(i));
                        let mv = data.module_outputs_object(&child);
                        marks.merge(mv.marks.ascend(PathStep::Index(i)));
                        items.push(mv.value);
                    }
                    Ok(MarkedValue::new(Value::List(items), marks))
                }
                Expansion::ForEach(keys) => {
                    let mut map = BTreeMap::new();
                    let mut marks = Marks::new();
                    for key in keys {
                        let child = scope
                            .module
                            .child(name.clone(), InstanceKey::Str(key.clone()));
                        let mv = data.module_outputs_object(&child);
                        marks.merge(mv.marks.ascend(PathStep::Key(key.clone())));
                        map.insert(key, mv.value);
                    }
                    Ok(MarkedValue::new(Value::Map(map), marks))
                }
            }
        }

        Reference::EachKey => match &scope.each {
            Some((key, _)) => Ok(MarkedValue::unmarked(Value::string(key.clone()))),
            None => Err(err(
                "Invalid reference",
                "each.key may only be used inside blocks with for_each set.",
            )),
        },

        Reference::EachValue => match &scope.each {
            Some((_, value)) => Ok(value.clone()),
            None => Err(err(
                "Invalid reference",
                "each.value may only be used inside blocks with for_each set.",
            )),
        },

        Reference::CountIndex => match scope.count_index {
            Some(i) => Ok(MarkedValue::unmarked(Value::int(i))),
            None => Err(err(
                "Invalid reference",
                "count.index may only be used inside blocks with count set.",
            )),
        },

        Reference::SelfRef => match &scope.self_value {
            Some(value) => Ok(value.clone()),
            None => Err(err(
                "Invalid reference",
                "self may only be used inside resource postconditions.",
            )),
        },

        Reference::PathModule => Ok(MarkedValue::unmarked(Value::string(
            scope.module.module().to_string(),
        ))),
    }
}

fn aggregate_instances(abs: &AbsResource, expansion: &Expansion, data: &EvalData) -> MarkedValue {
    match expansion {
        Expansion::Unknown => MarkedValue::unmarked(Value::Unknown),
        Expansion::Single => data.resource_value_or_unknown(&abs.instance(InstanceKey::NoKey)),
        Expansion::Count(n) => {
            let mut items = Vec::new();
            let mut marks = Marks::new();
            for i in 0..*n as i64 {
                let mv = data.resource_value_or_unknown(&abs.instance(InstanceKey::Int(i)));
                marks.merge(mv.marks.ascend(PathStep::Index(i)));
                items.push(mv.value);
            }
            MarkedValue::new(Value::List(items), marks)
        }
        Expansion::ForEach(keys) => {
            let mut map = BTreeMap::new();
            let mut marks = Marks::new();
            for key in keys {
                let mv = data
                    .resource_value_or_unknown(&abs.instance(InstanceKey::Str(key.clone())));
                marks.merge(mv.marks.ascend(PathStep::Key(key.clone())));
                map.insert(key.clone(), mv.value);
            }
            MarkedValue::new(Value::Map(map), marks)
        }
    }
}

/// Evaluate a block body (attribute name → expression) into an object value.
pub fn eval_body(
    body: &BTreeMap<String, Expr>,
    scope: &Scope,
    data: &EvalData,
) -> Result<MarkedValue, Diagnostics> {
    let mut map = BTreeMap::new();
    let mut marks = Marks::new();
    let mut diags = Diagnostics::new();
    for (name, expr) in body {
        match eval_expr(expr, scope, data) {
            Ok(mv) => {
                marks.merge(mv.marks.ascend(PathStep::Key(name.clone())));
                map.insert(name.clone(), mv.value);
            }
            Err(e) => {
                diags.append(e);
            }
        }
    }
    if diags.has_errors() {
        return Err(diags);
    }
    Ok(MarkedValue::new(Value::Map(map), marks))
}

// ── Repetition arguments ──────────────────────────────────────────────────────

/// The outcome of evaluating a block's `count`/`for_each` argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Repetition {
    Single,
    Count(usize),
    /// key → each.value binding, in key order.
    ForEach(Vec<(String, MarkedValue)>),
    Unknown,
}

impl Repetition {
    pub fn expansion(&self) -> Expansion {
        match self {
            Repetition::Single => Expansion::Single,
            Repetition::Count(n) => Expansion::Count(*n),
            Repetition::ForEach(entries) => {
                Expansion::ForEach(entries.iter().map(|(k, _)| k.clone()).collect())
            }
            Repetition::Unknown => Expansion::Unknown,
        }
    }

    /// The each.value binding for one key, if this is a for_each repetition.
    pub fn each_value(&self, key: &InstanceKey) -> Option<MarkedValue> {
        let InstanceKey::Str(key) = key else { return None };
        match self {
            Repetition::ForEach(entries) => entries
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }
}

/// Evaluate `count` / `for_each` on a block. At most one may be set; the
/// loader guarantees that, and this debug-asserts it.
pub fn eval_repetition(
    count: Option<&Expr>,
    for_each: Option<&Expr>,
    scope: &Scope,
    data: &EvalData,
) -> Result<Repetition, Diagnostics> {
    debug_assert!(
        count.is_none() || for_each.is_none(),
        "count and for_each are mutually exclusive"
    );

    if let Some(expr) = for_each {
        let mv = eval_expr(expr, scope, data)?;
        if mv.contains_sensitive() {
            return Err(err(
                "Invalid for_each argument",
                "Sensitive values, or values derived from sensitive values, cannot be used \
                 as for_each arguments.",
            ));
        }
        return match mv.value {
            Value::Unknown => Ok(Repetition::Unknown),
            Value::Null => Err(err(
                "Invalid for_each argument",
                "The given \"for_each\" argument value is unsuitable: must not be null.",
            )),
            // Keys decide the expansion; individual values may still be
            // unknown without deferring it.
            Value::Map(entries) => Ok(Repetition::ForEach(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, MarkedValue::new(v, mv.marks.clone())))
                    .collect(),
            )),
            Value::List(items) => {
                let mut entries = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(s) => {
                            entries.push((s.clone(), MarkedValue::unmarked(Value::String(s))))
                        }
                        Value::Unknown => return Ok(Repetition::Unknown),
                        other => {
                            return Err(err(
                                "Invalid for_each argument",
                                format!(
                                    "Sets used for for_each must contain only strings, \
                                     not {:?}.",
                                    other
                                ),
                            ))
                        }
                    }
                }
                Ok(Repetition::ForEach(entries))
            }
            other => Err(err(
                "Invalid for_each argument",
                format!(
                    "The given \"for_each\" argument value is unsuitable: must be a map or \
                     set of strings, not {:?}.",
                    other
                ),
            )),
        };
    }

    if let Some(expr) = count {
        let mv = eval_expr(expr, scope, data)?;
        return match mv.value {
            Value::Unknown => Ok(Repetition::Unknown),
            Value::Null => Err(err(
                "Invalid count argument",
                "The given \"count\" argument value is null; a number is required.",
            )),
            Value::Number(n) => match n.as_i64() {
                Some(i) if i >= 0 => Ok(Repetition::Count(i as usize)),
                _ => Err(err(
                    "Invalid count argument",
                    "The given \"count\" argument value must be a whole number >= 0.",
                )),
            },
            other => Err(err(
                "Invalid count argument",
                format!("The given \"count\" argument is not a number: {:?}.", other),
            )),
        };
    }

    Ok(Repetition::Single)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_domain::{Mark, Resource};

    fn data() -> EvalData {
        EvalData::new(Arc::new(Expander::new()))
    }

    #[test]
    fn variable_resolution_with_marks() {
        let data = data();
        let scope = Scope::root();
        data.set_variable(
            &scope.module,
            "token",
            MarkedValue::unmarked(Value::string("s3cret")).with_root_mark(Mark::Sensitive),
        );

        let result = eval_expr(&Expr::var("token"), &scope, &data).unwrap();
        assert_eq!(result.value, Value::string("s3cret"));
        assert!(result.is_sensitive());
    }

    #[test]
    fn unknown_propagates_through_eq() {
        let data = data();
        let scope = Scope::root();
        data.set_variable(&scope.module, "x", MarkedValue::unmarked(Value::Unknown));

        let expr = Expr::var("x").eq(Expr::lit("a"));
        let result = eval_expr(&expr, &scope, &data).unwrap();
        assert!(result.value.is_unknown());
    }

    #[test]
    fn template_concatenates_and_collapses_marks() {
        let data = data();
        let scope = Scope::root();
        data.set_variable(
            &scope.module,
            "name",
            MarkedValue::unmarked(Value::string("web")).with_root_mark(Mark::Sensitive),
        );

        let expr = Expr::Template(vec![Expr::lit("svc-"), Expr::var("name")]);
        let result = eval_expr(&expr, &scope, &data).unwrap();
        assert_eq!(result.value, Value::string("svc-web"));
        assert!(result.is_sensitive());
    }

    #[test]
    fn single_resource_reference_reads_working_value() {
        let expander = Arc::new(Expander::new());
        let abs = ModuleInstance::root().resource(Resource::managed("test_object", "a"));
        expander.expand_resource(&abs, Expansion::Single);
        let data = EvalData::new(expander);
        data.set_resource_value(
            &abs.instance(InstanceKey::NoKey),
            MarkedValue::unmarked(Value::from_json(serde_json::json!({"id": "x1"}))),
        );

        let expr = Expr::resource_attr(Resource::managed("test_object", "a"), "id");
        let result = eval_expr(&expr, &Scope::root(), &data).unwrap();
        assert_eq!(result.value, Value::string("x1"));
    }

    #[test]
    fn for_each_resource_reference_builds_map() {
        let expander = Arc::new(Expander::new());
        let abs = ModuleInstance::root().resource(Resource::managed("test_object", "a"));
        expander.expand_resource(
            &abs,
            Expansion::ForEach(vec!["k1".into(), "k2".into()]),
        );
        let data = EvalData::new(expander);
        for key in ["k1", "k2"] {
            data.set_resource_value(
                &abs.instance(InstanceKey::Str(key.into())),
                MarkedValue::unmarked(Value::from_json(serde_json::json!({"id": key}))),
            );
        }

        let expr = Expr::resource(Resource::managed("test_object", "a"))
            .index(Expr::lit("k2"))
            .get_attr("id");
        let result = eval_expr(&expr, &Scope::root(), &data).unwrap();
        assert_eq!(result.value, Value::string("k2"));
    }

    #[test]
    fn for_each_rejects_sensitive() {
        let data = data();
        let scope = Scope::root();
        data.set_variable(
            &scope.module,
            "keys",
            MarkedValue::unmarked(Value::from_json(serde_json::json!({"a": 1})))
                .with_root_mark(Mark::Sensitive),
        );

        let result = eval_repetition(None, Some(&Expr::var("keys")), &scope, &data);
        let diags = result.unwrap_err();
        assert!(diags
            .iter()
            .any(|d| d.summary == "Invalid for_each argument"));
    }

    #[test]
    fn for_each_null_rejected_unknown_deferred() {
        let data = data();
        let scope = Scope::root();

        let null_result =
            eval_repetition(None, Some(&Expr::null()), &scope, &data).unwrap_err();
        assert!(null_result.has_errors());

        data.set_variable(&scope.module, "later", MarkedValue::unmarked(Value::Unknown));
        let unknown_result =
            eval_repetition(None, Some(&Expr::var("later")), &scope, &data).unwrap();
        assert_eq!(unknown_result, Repetition::Unknown);
    }

    #[test]
    fn count_evaluates_to_int_keys() {
        let data = data();
        let scope = Scope::root();
        let result = eval_repetition(Some(&Expr::lit(3i64)), None, &scope, &data).unwrap();
        assert_eq!(result, Repetition::Count(3));
        assert_eq!(
            result.expansion().keys().known(),
            vec![InstanceKey::Int(0), InstanceKey::Int(1), InstanceKey::Int(2)]
        );
    }

    #[test]
    fn each_bindings_from_scope() {
        let data = data();
        let scope = Scope::root().with_key(
            &InstanceKey::Str("k1".into()),
            Some(MarkedValue::unmarked(Value::string("v1"))),
        );
        assert_eq!(
            eval_expr(&Expr::each_key(), &scope, &data).unwrap().value,
            Value::string("k1")
        );
        assert_eq!(
            eval_expr(&Expr::each_value(), &scope, &data).unwrap().value,
            Value::string("v1")
        );
    }
}
