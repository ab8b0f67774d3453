//! Resolution of `import` blocks into concrete (instance key, import id)
//! pairs, with the strict rejection rules for values that cannot be decided
//! at plan time.

use strata_config::{Config, ImportBlock};
use strata_domain::{
    Diagnostic, Diagnostics, InstanceKey, Mark, Resource, Value,
};
use strata_eval::{eval_expr, eval_repetition, EvalData, Repetition, Scope};

/// Import blocks may only appear in the root module, matching where their
/// config generation is allowed to land. A block declared anywhere else is
/// rejected outright rather than silently ignored.
pub fn validate_import_placement(config: &Config) -> Diagnostics {
    let mut diags = Diagnostics::new();
    for (path, mc) in config.modules() {
        if path.is_root() {
            continue;
        }
        for block in &mc.imports {
            let mut diag = Diagnostic::error(
                "Invalid import configuration",
                format!(
                    "Import blocks are only allowed in the root module; move the import \
                     of {} out of {}.",
                    block.to, path
                ),
            )
            .with_address(&block.to);
            if let Some(source) = &block.source {
                diag = diag.with_source(source.clone());
            }
            diags.push(diag);
        }
    }
    diags
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedImport {
    pub key: InstanceKey,
    pub id: String,
}

fn import_error(summary: &str, detail: impl Into<String>) -> Diagnostic {
    Diagnostic::error(summary, detail.into())
}

/// Resolve every import block targeting one resource. Each for_each entry
/// yields exactly one import; every value that is null, unknown or sensitive
/// is rejected with a specific diagnostic rather than deferred.
pub fn resolve_imports(
    resource: &Resource,
    blocks: &[&ImportBlock],
    scope: &Scope,
    data: &EvalData,
) -> (Vec<ResolvedImport>, Diagnostics) {
    let mut diags = Diagnostics::new();
    let mut resolved: Vec<ResolvedImport> = Vec::new();

    for block in blocks {
        let bindings: Vec<Option<(String, strata_domain::MarkedValue)>> = match &block.for_each {
            None => vec![None],
            Some(expr) => {
                match eval_repetition(None, Some(expr), scope, data) {
                    Err(errs) => {
                        diags.append(errs);
                        continue;
                    }
                    Ok(Repetition::Unknown) => {
                        diags.push(import_error(
                            "Invalid import for_each argument",
                            "The \"for_each\" expression in an import block must be known \
                             at plan time; it depends on values that cannot be determined \
                             until apply.",
                        ));
                        continue;
                    }
                    Ok(Repetition::ForEach(entries)) => {
                        entries.into_iter().map(Some).collect()
                    }
                    Ok(_) => {
                        diags.push(import_error(
                            "Invalid import for_each argument",
                            "The \"for_each\" argument of an import block must be a map or \
                             set of strings.",
                        ));
                        continue;
                    }
                }
            }
        };

        for binding in bindings {
            let scope = match &binding {
                None => scope.clone(),
                Some((key, value)) => scope
                    .clone()
                    .with_key(&InstanceKey::Str(key.clone()), Some(value.clone())),
            };

            let Some(id) = resolve_id(block, &scope, data, &mut diags) else {
                continue;
            };
            let Some(key) = resolve_target_key(block, &scope, data, &mut diags) else {
                continue;
            };

            if resolved.iter().any(|r| r.key == key) {
                diags.push(import_error(
                    "Duplicate import configuration",
                    format!(
                        "Two import blocks resolved to the same target address {}{}.",
                        resource, key
                    ),
                ));
                continue;
            }
            resolved.push(ResolvedImport { key, id });
        }
    }

    (resolved, diags)
}

fn resolve_id(
    block: &ImportBlock,
    scope: &Scope,
    data: &EvalData,
    diags: &mut Diagnostics,
) -> Option<String> {
    let mv = match eval_expr(&block.id, scope, data) {
        Ok(mv) => mv,
        Err(errs) => {
            diags.append(errs);
            return None;
        }
    };
    if mv.marks.contains(Mark::Sensitive) {
        diags.push(import_error("Invalid import id", "The import ID cannot be sensitive."));
        return None;
    }
    match mv.value {
        Value::Null => {
            diags.push(import_error("Invalid import id", "The import ID cannot be null."));
            None
        }
        Value::Unknown => {
            diags.push(import_error(
                "Invalid import id",
                "The import block \"id\" argument depends on resource attributes that \
                 cannot be determined until apply.",
            ));
            None
        }
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => {
            diags.push(import_error(
                "Invalid import id",
                "The import ID must be a string.",
            ));
            None
        }
    }
}

fn resolve_target_key(
    block: &ImportBlock,
    scope: &Scope,
    data: &EvalData,
    diags: &mut Diagnostics,
) -> Option<InstanceKey> {
    let Some(expr) = &block.to_key_expr else {
        return Some(InstanceKey::NoKey);
    };
    let mv = match eval_expr(expr, scope, data) {
        Ok(mv) => mv,
        Err(errs) => {
            diags.append(errs);
            return None;
        }
    };
    if mv.marks.contains(Mark::Sensitive) {
        diags.push(import_error(
            "Invalid import target address",
            "Import block contained a resource address using an index which is sensitive.",
        ));
        return None;
    }
    match mv.value {
        Value::Null => {
            diags.push(import_error(
                "Invalid import target address",
                "Import block contained a resource address using an index which is null.",
            ));
            None
        }
        Value::Unknown => {
            diags.push(import_error(
                "Invalid import target address",
                "Import block contained a resource address using an index that will only \
                 be known after apply.",
            ));
            None
        }
        Value::String(s) => Some(InstanceKey::Str(s)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(InstanceKey::Int(i)),
            None => {
                diags.push(import_error(
                    "Invalid import target address",
                    "Import block 'to' address contains an invalid key: index must be a \
                     whole number.",
                ));
                None
            }
        },
        _ => {
            diags.push(import_error(
                "Invalid import target address",
                "Import block 'to' address contains an invalid key: only strings and \
                 numbers are valid instance keys.",
            ));
            None
        }
    }
}
