use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use strata_domain::{Resource, Value};

// ── References ────────────────────────────────────────────────────────────────

/// A symbol an expression can refer to, relative to the module the expression
/// appears in. References drive dependency-edge construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reference {
    /// `var.<name>`
    Var(String),
    /// `local.<name>`
    Local(String),
    /// `<type>.<name>` or `data.<type>.<name>` — the whole resource block;
    /// instances and attributes are reached via Index/GetAttr on top.
    Resource(Resource),
    /// `module.<name>` — the outputs object of a child module call.
    ModuleCall(String),
    /// `each.key`
    EachKey,
    /// `each.value`
    EachValue,
    /// `count.index`
    CountIndex,
    /// `self` — only valid inside resource postconditions.
    SelfRef,
    /// `path.module`
    PathModule,
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reference::Var(name) => write!(f, "var.{}", name),
            Reference::Local(name) => write!(f, "local.{}", name),
            Reference::Resource(r) => write!(f, "{}", r),
            Reference::ModuleCall(name) => write!(f, "module.{}", name),
            Reference::EachKey => write!(f, "each.key"),
            Reference::EachValue => write!(f, "each.value"),
            Reference::CountIndex => write!(f, "count.index"),
            Reference::SelfRef => write!(f, "self"),
            Reference::PathModule => write!(f, "path.module"),
        }
    }
}

// ── Expressions ───────────────────────────────────────────────────────────────

/// An already-parsed configuration expression. The external loader produces
/// this tree; the core evaluates it against a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Lit(Value),
    Ref(Reference),
    GetAttr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    List(Vec<Expr>),
    Object(BTreeMap<String, Expr>),
    /// String interpolation: each part is rendered and concatenated.
    Template(Vec<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Lit(value.into())
    }

    pub fn null() -> Self {
        Expr::Lit(Value::Null)
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Ref(Reference::Var(name.into()))
    }

    pub fn local(name: impl Into<String>) -> Self {
        Expr::Ref(Reference::Local(name.into()))
    }

    pub fn resource(resource: Resource) -> Self {
        Expr::Ref(Reference::Resource(resource))
    }

    /// `<resource>.<attr>` on an unexpanded (single-instance) resource.
    pub fn resource_attr(resource: Resource, attr: impl Into<String>) -> Self {
        Expr::GetAttr(Box::new(Expr::resource(resource)), attr.into())
    }

    pub fn self_attr(attr: impl Into<String>) -> Self {
        Expr::GetAttr(Box::new(Expr::Ref(Reference::SelfRef)), attr.into())
    }

    pub fn each_key() -> Self {
        Expr::Ref(Reference::EachKey)
    }

    pub fn each_value() -> Self {
        Expr::Ref(Reference::EachValue)
    }

    pub fn get_attr(self, attr: impl Into<String>) -> Self {
        Expr::GetAttr(Box::new(self), attr.into())
    }

    pub fn index(self, key: Expr) -> Self {
        Expr::Index(Box::new(self), Box::new(key))
    }

    pub fn eq(self, other: Expr) -> Self {
        Expr::Eq(Box::new(self), Box::new(other))
    }

    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    /// All references mentioned anywhere in the expression, in syntax order.
    /// Both condition and error-message expressions feed graph edges through
    /// this.
    pub fn references(&self) -> Vec<Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut Vec<Reference>) {
        match self {
            Expr::Lit(_) => {}
            Expr::Ref(r) => out.push(r.clone()),
            Expr::GetAttr(base, _) => base.collect_references(out),
            Expr::Index(base, key) => {
                base.collect_references(out);
                key.collect_references(out);
            }
            Expr::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Expr::Object(entries) => {
                for expr in entries.values() {
                    expr.collect_references(out);
                }
            }
            Expr::Template(parts) => {
                for part in parts {
                    part.collect_references(out);
                }
            }
            Expr::Eq(a, b) | Expr::And(a, b) | Expr::Or(a, b) => {
                a.collect_references(out);
                b.collect_references(out);
            }
            Expr::Not(inner) => inner.collect_references(out),
            Expr::Conditional(cond, then, otherwise) => {
                cond.collect_references(out);
                then.collect_references(out);
                otherwise.collect_references(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_walk_every_position() {
        let expr = Expr::Conditional(
            Box::new(Expr::var("enabled").eq(Expr::lit(true))),
            Box::new(Expr::resource_attr(Resource::managed("test_object", "a"), "id")),
            Box::new(Expr::local("fallback")),
        );
        let refs = expr.references();
        assert_eq!(
            refs,
            vec![
                Reference::Var("enabled".into()),
                Reference::Resource(Resource::managed("test_object", "a")),
                Reference::Local("fallback".into()),
            ]
        );
    }

    #[test]
    fn index_key_references_count() {
        // import { to = test_object.a[each.key] } — the key expression's
        // references must surface for graph ordering.
        let expr = Expr::resource(Resource::managed("test_object", "a"))
            .index(Expr::each_key());
        assert!(expr.references().contains(&Reference::EachKey));
    }
}
