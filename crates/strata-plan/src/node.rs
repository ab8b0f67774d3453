use strata_domain::{AbsResource, Module, Resource};

/// The sealed set of logical graph-node kinds. The walker dispatches per
/// variant; capabilities are implied by the variant, not by a trait
/// hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Variable { module: Module, name: String },
    Local { module: Module, name: String },
    Output { module: Module, name: String },
    /// One `provider` block, identified by position within its module.
    ProviderConfig { module: Module, index: usize },
    /// Evaluates a module call's repetition argument and registers the
    /// resulting instance keys.
    ModuleExpand { parent: Module, call: String },
    /// A managed or data resource block: expansion plus per-instance
    /// planning or reading.
    Resource { module: Module, resource: Resource },
    /// A prior-state resource with no configuration counterpart.
    Orphan { addr: AbsResource },
    CheckBlock { module: Module, name: String },
}

fn prefixed(module: &Module, rest: std::fmt::Arguments<'_>) -> String {
    if module.is_root() {
        rest.to_string()
    } else {
        format!("{}.{}", module, rest)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Variable { module, name } => {
                write!(f, "{}", prefixed(module, format_args!("var.{}", name)))
            }
            NodeKind::Local { module, name } => {
                write!(f, "{}", prefixed(module, format_args!("local.{}", name)))
            }
            NodeKind::Output { module, name } => {
                write!(f, "{}", prefixed(module, format_args!("output.{}", name)))
            }
            NodeKind::ProviderConfig { module, index } => {
                write!(f, "{}", prefixed(module, format_args!("provider<{}>", index)))
            }
            NodeKind::ModuleExpand { parent, call } => {
                write!(f, "{}", prefixed(parent, format_args!("module.{} (expand)", call)))
            }
            NodeKind::Resource { module, resource } => {
                write!(f, "{}", prefixed(module, format_args!("{}", resource)))
            }
            NodeKind::Orphan { addr } => write!(f, "{} (orphan)", addr),
            NodeKind::CheckBlock { module, name } => {
                write!(f, "{}", prefixed(module, format_args!("check.{}", name)))
            }
        }
    }
}
