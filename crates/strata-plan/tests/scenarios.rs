//! End-to-end planning scenarios driven through the mock provider.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use strata_config::{
    CheckRuleConfig, Config, Expr, ImportBlock, ModuleCall, ModuleConfig, ProviderConfigBlock,
    RemoveEndpoint, RemovedBlock, ResourceConfig,
};
use strata_domain::{
    DeposedKey, InstanceKey, ModuleInstance, ProviderConfigAddr, ProviderSource, Resource,
    ResourceInstance, Value,
};
use strata_plan::{plan, Action, ActionReason, OutputAction, PlanOpts, PlanRun};
use strata_provider::{MockProvider, ProviderRegistry};
use strata_state::{ObjectState, ObjectStatus, State};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_source() -> ProviderSource {
    ProviderSource::default_registry("core", "test")
}

fn provider_addr() -> ProviderConfigAddr {
    ProviderConfigAddr::root(test_source())
}

fn registry(mock: &Arc<MockProvider>) -> Arc<ProviderRegistry> {
    let mock = mock.clone();
    let mut registry = ProviderRegistry::new();
    registry.register(test_source(), move || mock.clone());
    Arc::new(registry)
}

fn base_module() -> ModuleConfig {
    let mut mc = ModuleConfig::default();
    mc.required_providers.insert("test".into(), test_source());
    mc
}

fn root_instance(resource: Resource, key: InstanceKey) -> ResourceInstance {
    ModuleInstance::root().resource(resource).instance(key)
}

fn seed_current(
    state: &mut State,
    resource: Resource,
    key: InstanceKey,
    attrs: serde_json::Value,
) -> ResourceInstance {
    let addr = root_instance(resource, key);
    state.set_resource_provider(&addr.abs_resource(), provider_addr());
    state.set_instance_current(&addr, Some(ObjectState::new(attrs)));
    addr
}

async fn run_plan(
    config: Config,
    state: State,
    opts: PlanOpts,
    mock: &Arc<MockProvider>,
) -> PlanRun {
    init_tracing();
    plan(config, state, opts, registry(mock), CancellationToken::new())
        .await
        .expect("plan should start")
}

fn assert_unique_change_keys(run: &PlanRun) {
    let mut keys: Vec<String> = run
        .plan
        .changes
        .resources
        .iter()
        .map(|c| format!("{}|{:?}", c.addr, c.deposed))
        .collect();
    let total = keys.len();
    keys.sort();
    keys.dedup();
    assert_eq!(total, keys.len(), "duplicate change addresses in plan");
}

// ── Scenario 1: basic import converges to NoOp ────────────────────────────────

#[tokio::test]
async fn import_basic_noop() {
    let mock = Arc::new(MockProvider::new());
    mock.set_import_result("123", serde_json::json!({"test_string": "foo"}));
    mock.set_read_result("test_object", Some(serde_json::json!({"test_string": "foo"})));

    let mut root = base_module();
    root.add_managed(
        ResourceConfig::managed("test_object", "a").with_attr("test_string", Expr::lit("foo")),
    );
    root.imports.push(ImportBlock {
        to: Resource::managed("test_object", "a"),
        to_key_expr: None,
        id: Expr::lit("123"),
        for_each: None,
        source: None,
    });

    let run = run_plan(Config::new(root), State::new(), PlanOpts::normal(), &mock).await;
    assert!(!run.plan.errored, "{:?}", run.diagnostics);
    assert_eq!(run.plan.changes.resources.len(), 1);

    let change = &run.plan.changes.resources[0];
    assert_eq!(change.addr.to_string(), "test_object.a");
    assert_eq!(change.action, Action::NoOp);
    assert_eq!(change.importing.as_ref().map(|i| i.id.as_str()), Some("123"));
    assert_unique_change_keys(&run);
}

// ── Scenario 2: removed resource with a deposed object ────────────────────────

#[tokio::test]
async fn removed_resource_forgets_current_and_deposed() {
    let mock = Arc::new(MockProvider::new());

    let a = Resource::managed("test_object", "a");
    let mut state = State::new();
    let addr = seed_current(&mut state, a.clone(), InstanceKey::NoKey, serde_json::json!({"id": "cur"}));
    let deposed_key = DeposedKey::new();
    state.set_instance_deposed(
        &addr,
        &deposed_key,
        Some(ObjectState::new(serde_json::json!({"id": "dep"}))),
    );

    let mut root = base_module();
    root.removed.push(RemovedBlock {
        from: RemoveEndpoint::Resource(a),
        source: None,
    });

    let run = run_plan(Config::new(root), state, PlanOpts::normal(), &mock).await;
    assert!(!run.plan.errored, "{:?}", run.diagnostics);
    assert_eq!(run.plan.changes.resources.len(), 2);

    let current = run.plan.changes.for_addr(&addr).expect("current change");
    assert_eq!(current.action, Action::Forget);
    assert_eq!(current.reason, ActionReason::DeleteBecauseNoResourceConfig);

    let deposed = run.plan.changes.deposed_for_addr(&addr);
    assert_eq!(deposed.len(), 1);
    assert_eq!(deposed[0].action, Action::Forget);
    assert_eq!(deposed[0].reason, ActionReason::NoReason);
    assert_eq!(deposed[0].deposed.as_ref(), Some(&deposed_key));
    assert_unique_change_keys(&run);
}

// ── Scenario 3: implied move blocked by a collision ───────────────────────────

#[tokio::test]
async fn move_collision_warns_and_deletes_stale_instance() {
    let mock = Arc::new(MockProvider::new());

    let a = Resource::managed("test_object", "a");
    let mut state = State::new();
    let no_key = seed_current(&mut state, a.clone(), InstanceKey::NoKey, serde_json::json!({"id": "nokey"}));
    let zero = seed_current(&mut state, a.clone(), InstanceKey::Int(0), serde_json::json!({"id": "zero"}));

    let mut root = base_module();
    root.add_managed(ResourceConfig::managed("test_object", "a"));

    let run = run_plan(Config::new(root), state, PlanOpts::normal(), &mock).await;
    assert!(!run.plan.errored, "{:?}", run.diagnostics);

    let warning = run
        .diagnostics
        .iter()
        .find(|d| d.summary == "Unresolved resource instance address changes")
        .expect("collision warning");
    assert!(
        warning.detail.contains("test_object.a[0] could not move to test_object.a"),
        "{}",
        warning.detail
    );

    let keep = run.plan.changes.for_addr(&no_key).expect("kept instance");
    assert_eq!(keep.action, Action::NoOp);
    let doomed = run.plan.changes.for_addr(&zero).expect("stale instance");
    assert_eq!(doomed.action, Action::Delete);
    assert_eq!(doomed.reason, ActionReason::DeleteBecauseWrongRepetition);
    assert_unique_change_keys(&run);
}

// ── Scenario 4: refresh-only reports drift, proposes nothing ──────────────────

#[tokio::test]
async fn refresh_only_separates_upgrade_refresh_and_proposal() {
    let mock = Arc::new(MockProvider::new());
    mock.set_resource_version("test_object", 5);
    mock.set_upgrade_result("test_object", serde_json::json!({"arg": "upgraded"}));
    mock.set_read_result("test_object", Some(serde_json::json!({"arg": "current"})));

    let a = Resource::managed("test_object", "a");
    let mut state = State::new();
    let addr = seed_current(&mut state, a.clone(), InstanceKey::NoKey, serde_json::json!({"arg": "before"}));

    let mut root = base_module();
    root.add_managed(ResourceConfig::managed("test_object", "a").with_attr("arg", Expr::lit("after")));
    root.outputs.insert(
        "out".into(),
        strata_config::OutputConfig::new(Expr::resource_attr(a, "arg")),
    );

    let run = run_plan(Config::new(root), state, PlanOpts::refresh_only(), &mock).await;
    assert!(!run.plan.errored, "{:?}", run.diagnostics);
    assert!(run.plan.changes.resources.is_empty(), "refresh-only must propose nothing");

    let prev = run
        .plan
        .prev_run_state
        .instance(&addr)
        .and_then(|i| i.current.as_ref())
        .expect("prev-run object");
    assert_eq!(prev.attrs, serde_json::json!({"arg": "upgraded"}));

    let prior = run
        .plan
        .prior_state
        .instance(&addr)
        .and_then(|i| i.current.as_ref())
        .expect("prior object");
    assert_eq!(prior.attrs, serde_json::json!({"arg": "current"}));

    assert_eq!(run.plan.drifted_resources.len(), 1);
    assert_eq!(run.plan.drifted_resources[0].action, Action::Update);

    let out = &run.plan.output_changes["out"];
    assert_eq!(out.after, Value::string("current"));
}

// ── Scenario 5: data read deferred behind a pending managed change ────────────

#[tokio::test]
async fn data_read_deferred_by_pending_dependency() {
    let mock = Arc::new(MockProvider::new());

    let managed = Resource::managed("test_resource", "a");
    let mut state = State::new();
    let managed_addr = seed_current(
        &mut state,
        managed.clone(),
        InstanceKey::NoKey,
        serde_json::json!({"id": "a-id", "valid": false}),
    );

    let mut root = base_module();
    root.add_managed(ResourceConfig::managed("test_resource", "a").with_attr("valid", Expr::lit(true)));
    root.locals.insert(
        "object_id".into(),
        Expr::resource_attr(managed.clone(), "id"),
    );
    let mut data = ResourceConfig::data("test_data_source", "a")
        .with_attr("id", Expr::local("object_id"));
    data.lifecycle
        .postconditions
        .push(CheckRuleConfig::new(Expr::lit(true), Expr::lit("always fine")));
    root.add_data(data);

    let run = run_plan(Config::new(root), state, PlanOpts::normal(), &mock).await;
    assert!(!run.plan.errored, "{:?}", run.diagnostics);

    let managed_change = run.plan.changes.for_addr(&managed_addr).expect("managed change");
    assert_eq!(managed_change.action, Action::Update);

    let data_addr = root_instance(Resource::data("test_data_source", "a"), InstanceKey::NoKey);
    let data_change = run.plan.changes.for_addr(&data_addr).expect("data change");
    assert_eq!(data_change.action, Action::Read);
    assert_eq!(data_change.reason, ActionReason::ReadBecauseDependencyPending);
    assert_eq!(mock.calls_of("read_data_source"), 0, "deferred read must not call provider");
    assert_unique_change_keys(&run);
}

// ── Scenario 6: for_each import expands one change per key ────────────────────

#[tokio::test]
async fn for_each_import_one_change_per_key() {
    let mock = Arc::new(MockProvider::new());
    for id in ["val1", "val2", "val3"] {
        mock.set_import_result(id, serde_json::json!({}));
    }

    let map = serde_json::json!({"key1": "val1", "key2": "val2", "key3": "val3"});
    let mut root = base_module();
    root.locals.insert("map".into(), Expr::lit(Value::from_json(map.clone())));
    root.add_managed(
        ResourceConfig::managed("test_object", "a").with_for_each(Expr::local("map")),
    );
    root.imports.push(ImportBlock {
        to: Resource::managed("test_object", "a"),
        to_key_expr: Some(Expr::each_key()),
        id: Expr::each_value(),
        for_each: Some(Expr::local("map")),
        source: None,
    });

    let run = run_plan(Config::new(root), State::new(), PlanOpts::normal(), &mock).await;
    assert!(!run.plan.errored, "{:?}", run.diagnostics);
    assert_eq!(run.plan.changes.resources.len(), 3);

    for (key, id) in [("key1", "val1"), ("key2", "val2"), ("key3", "val3")] {
        let addr = root_instance(
            Resource::managed("test_object", "a"),
            InstanceKey::Str(key.into()),
        );
        let change = run.plan.changes.for_addr(&addr).expect("change per key");
        assert_eq!(change.action, Action::NoOp, "{}", addr);
        assert_eq!(change.importing.as_ref().map(|i| i.id.as_str()), Some(id));
    }
    assert_unique_change_keys(&run);
}

// ── Invariants and supporting behaviors ───────────────────────────────────────

#[tokio::test]
async fn noop_plan_is_idempotent() {
    let mock = Arc::new(MockProvider::new());
    let mut state = State::new();
    seed_current(
        &mut state,
        Resource::managed("test_object", "a"),
        InstanceKey::NoKey,
        serde_json::json!({"id": "1", "arg": "x"}),
    );
    let mut root = base_module();
    root.add_managed(ResourceConfig::managed("test_object", "a").with_attr("arg", Expr::lit("x")));
    let config = Config::new(root);

    let first = run_plan(config.clone(), state, PlanOpts::normal(), &mock).await;
    assert!(!first.plan.errored, "{:?}", first.diagnostics);
    assert!(first.plan.changes.pending().next().is_none(), "first plan must be no-op");

    let second = run_plan(config, first.plan.prior_state, PlanOpts::normal(), &mock).await;
    assert!(second.plan.changes.pending().next().is_none(), "re-plan must stay no-op");
}

#[tokio::test]
async fn destroy_mode_deletes_everything() {
    let mock = Arc::new(MockProvider::new());
    let mut state = State::new();
    let addr = seed_current(
        &mut state,
        Resource::managed("test_object", "a"),
        InstanceKey::NoKey,
        serde_json::json!({"id": "1"}),
    );
    let mut root = base_module();
    root.add_managed(ResourceConfig::managed("test_object", "a"));

    let run = run_plan(Config::new(root), state, PlanOpts::destroy(), &mock).await;
    let change = run.plan.changes.for_addr(&addr).expect("destroy change");
    assert_eq!(change.action, Action::Delete);
    assert_eq!(change.reason, ActionReason::DestroyBecauseDestroyMode);
}

#[tokio::test]
async fn out_of_band_deletion_plans_create() {
    let mock = Arc::new(MockProvider::new());
    mock.set_read_result("test_object", None);

    let mut state = State::new();
    let addr = seed_current(
        &mut state,
        Resource::managed("test_object", "a"),
        InstanceKey::NoKey,
        serde_json::json!({"id": "1"}),
    );
    let mut root = base_module();
    root.add_managed(ResourceConfig::managed("test_object", "a"));

    let run = run_plan(Config::new(root), state, PlanOpts::normal(), &mock).await;
    assert!(!run.plan.errored, "{:?}", run.diagnostics);
    // The instance vanished out-of-band: drift shows the delete, the prior
    // state no longer holds it, and configuration re-creates it.
    assert!(run.plan.prior_state.instance(&addr).is_none());
    assert_eq!(run.plan.drifted_resources.len(), 1);
    assert_eq!(run.plan.drifted_resources[0].action, Action::Delete);
    let change = run.plan.changes.for_addr(&addr).expect("create change");
    assert_eq!(change.action, Action::Create);
}

#[tokio::test]
async fn replacement_triggers() {
    // requires_replace path from the provider forces replacement.
    let mock = Arc::new(MockProvider::new());
    mock.set_requires_replace("test_object", vec![strata_domain::AttrPath::attr("arg")]);
    let mut state = State::new();
    let addr = seed_current(
        &mut state,
        Resource::managed("test_object", "a"),
        InstanceKey::NoKey,
        serde_json::json!({"id": "1", "arg": "old"}),
    );
    let mut root = base_module();
    root.add_managed(ResourceConfig::managed("test_object", "a").with_attr("arg", Expr::lit("new")));
    let run = run_plan(Config::new(root), state, PlanOpts::normal(), &mock).await;
    let change = run.plan.changes.for_addr(&addr).expect("change");
    assert_eq!(change.action, Action::DeleteThenCreate);
    assert_eq!(change.reason, ActionReason::ReplaceBecauseCannotUpdate);

    // force_replace overrides even a clean diff.
    let mock = Arc::new(MockProvider::new());
    let mut state = State::new();
    let addr = seed_current(
        &mut state,
        Resource::managed("test_object", "a"),
        InstanceKey::NoKey,
        serde_json::json!({"id": "1", "arg": "same"}),
    );
    let mut root = base_module();
    root.add_managed(ResourceConfig::managed("test_object", "a").with_attr("arg", Expr::lit("same")));
    let opts = PlanOpts { force_replace: vec![addr.clone()], ..PlanOpts::normal() };
    let run = run_plan(Config::new(root), state, opts, &mock).await;
    let change = run.plan.changes.for_addr(&addr).expect("change");
    assert_eq!(change.action, Action::DeleteThenCreate);
    assert_eq!(change.reason, ActionReason::ReplaceByRequest);

    // create_before_destroy flips the replacement order.
    let mock = Arc::new(MockProvider::new());
    let mut state = State::new();
    let addr = seed_current(
        &mut state,
        Resource::managed("test_object", "a"),
        InstanceKey::NoKey,
        serde_json::json!({"id": "1"}),
    );
    let mut rc = ResourceConfig::managed("test_object", "a");
    rc.lifecycle.create_before_destroy = true;
    let mut root = base_module();
    root.add_managed(rc);
    let opts = PlanOpts { force_replace: vec![addr.clone()], ..PlanOpts::normal() };
    let run = run_plan(Config::new(root), state, opts, &mock).await;
    let change = run.plan.changes.for_addr(&addr).expect("change");
    assert_eq!(change.action, Action::CreateThenDelete);
}

#[tokio::test]
async fn tainted_objects_replace() {
    let mock = Arc::new(MockProvider::new());
    let addr = root_instance(Resource::managed("test_object", "a"), InstanceKey::NoKey);
    let mut state = State::new();
    state.set_resource_provider(&addr.abs_resource(), provider_addr());
    state.set_instance_current(
        &addr,
        Some(
            ObjectState::new(serde_json::json!({"id": "1"}))
                .with_status(ObjectStatus::Tainted),
        ),
    );
    let mut root = base_module();
    root.add_managed(ResourceConfig::managed("test_object", "a"));

    let run = run_plan(Config::new(root), state, PlanOpts::normal(), &mock).await;
    let change = run.plan.changes.for_addr(&addr).expect("change");
    assert_eq!(change.action, Action::DeleteThenCreate);
    assert_eq!(change.reason, ActionReason::ReplaceBecauseTainted);
}

#[tokio::test]
async fn provider_block_configures_exactly_once() {
    let mock = Arc::new(MockProvider::new());
    let mut root = base_module();
    root.provider_configs.push(ProviderConfigBlock::new("test"));
    root.add_managed(ResourceConfig::managed("test_object", "a"));
    root.add_managed(ResourceConfig::managed("test_object", "b"));

    let run = run_plan(Config::new(root), State::new(), PlanOpts::normal(), &mock).await;
    assert!(!run.plan.errored, "{:?}", run.diagnostics);
    assert_eq!(mock.calls_of("configure_provider"), 1);
    assert_eq!(mock.calls_of("plan_resource_change"), 2);
}

#[tokio::test]
async fn eager_data_read_records_no_change() {
    let mock = Arc::new(MockProvider::new());
    mock.set_data_result(
        "test_data_source",
        serde_json::json!({"id": "d", "valid": true, "output": "found"}),
    );
    let mut root = base_module();
    root.add_data(ResourceConfig::data("test_data_source", "a").with_attr("id", Expr::lit("d")));

    let run = run_plan(Config::new(root), State::new(), PlanOpts::normal(), &mock).await;
    assert!(!run.plan.errored, "{:?}", run.diagnostics);
    assert_eq!(mock.calls_of("read_data_source"), 1);
    assert!(run.plan.changes.resources.is_empty());
}

#[tokio::test]
async fn import_without_config_errors_unless_generating() {
    let mock = Arc::new(MockProvider::new());
    mock.set_import_result("xyz", serde_json::json!({"test_string": "gen"}));
    let mut root = base_module();
    root.imports.push(ImportBlock {
        to: Resource::managed("test_object", "b"),
        to_key_expr: None,
        id: Expr::lit("xyz"),
        for_each: None,
        source: None,
    });
    let config = Config::new(root);

    let run = run_plan(config.clone(), State::new(), PlanOpts::normal(), &mock).await;
    assert!(run.plan.errored);
    assert!(run
        .diagnostics
        .iter()
        .any(|d| d.summary == "Configuration for import target does not exist"));

    let opts = PlanOpts {
        generate_config_path: Some("generated.tf".into()),
        ..PlanOpts::normal()
    };
    let run = run_plan(config, State::new(), opts, &mock).await;
    assert!(!run.plan.errored, "{:?}", run.diagnostics);
    let addr = root_instance(Resource::managed("test_object", "b"), InstanceKey::NoKey);
    let change = run.plan.changes.for_addr(&addr).expect("generated import change");
    assert_eq!(change.action, Action::NoOp);
    assert_eq!(change.importing.as_ref().map(|i| i.id.as_str()), Some("xyz"));
    let generated = change.generated_config.as_ref().expect("generated config");
    assert!(generated.contains("resource \"test_object\" \"b\""), "{}", generated);
    assert!(generated.contains("test_string = \"gen\""), "{}", generated);
}

#[tokio::test]
async fn outputs_change_with_planned_values() {
    let mock = Arc::new(MockProvider::new());
    let mut root = base_module();
    root.add_managed(
        ResourceConfig::managed("test_object", "a").with_attr("arg", Expr::lit("hello")),
    );
    root.outputs.insert(
        "arg_out".into(),
        strata_config::OutputConfig::new(Expr::resource_attr(
            Resource::managed("test_object", "a"),
            "arg",
        )),
    );

    let run = run_plan(Config::new(root), State::new(), PlanOpts::normal(), &mock).await;
    assert!(!run.plan.errored, "{:?}", run.diagnostics);
    let out = &run.plan.output_changes["arg_out"];
    assert_eq!(out.action, OutputAction::Create);
    assert_eq!(out.after, Value::string("hello"));
}

fn module_call(name: &str, child: ModuleConfig) -> ModuleCall {
    ModuleCall {
        name: name.to_string(),
        child: Box::new(child),
        count: None,
        for_each: None,
        args: Default::default(),
        source: None,
    }
}

#[tokio::test]
async fn child_module_removed_block_forgets_instead_of_deleting() {
    let mock = Arc::new(MockProvider::new());

    // Prior tracks an object inside module.net; the child module declares a
    // removed block for it, so the object must be forgotten, never destroyed.
    let x = Resource::managed("test_object", "x");
    let mi = ModuleInstance::root().child("net", InstanceKey::NoKey);
    let addr = mi.resource(x.clone()).instance(InstanceKey::NoKey);
    let mut state = State::new();
    state.set_resource_provider(&addr.abs_resource(), provider_addr());
    state.set_instance_current(
        &addr,
        Some(ObjectState::new(serde_json::json!({"id": "in-child"}))),
    );

    let mut child = ModuleConfig::default();
    child.removed.push(RemovedBlock {
        from: RemoveEndpoint::Resource(x),
        source: None,
    });
    let mut root = base_module();
    root.module_calls.insert("net".into(), module_call("net", child));

    let run = run_plan(Config::new(root), state, PlanOpts::normal(), &mock).await;
    assert!(!run.plan.errored, "{:?}", run.diagnostics);

    let change = run.plan.changes.for_addr(&addr).expect("forget change");
    assert_eq!(change.action, Action::Forget);
    assert_eq!(change.reason, ActionReason::DeleteBecauseNoResourceConfig);
}

#[tokio::test]
async fn import_blocks_rejected_outside_root_module() {
    let mock = Arc::new(MockProvider::new());

    let mut child = ModuleConfig::default();
    child.imports.push(ImportBlock {
        to: Resource::managed("test_object", "x"),
        to_key_expr: None,
        id: Expr::lit("1"),
        for_each: None,
        source: None,
    });
    let mut root = base_module();
    root.module_calls.insert("net".into(), module_call("net", child));

    let run = run_plan(Config::new(root), State::new(), PlanOpts::normal(), &mock).await;
    assert!(run.plan.errored);
    assert!(run.plan.changes.resources.is_empty());
    assert!(run
        .diagnostics
        .iter()
        .any(|d| d.detail.contains("Import blocks are only allowed in the root module")));
}

#[tokio::test]
async fn data_read_stays_eager_without_conditions_despite_indirect_dependency() {
    // The same shape as the deferral scenario, minus the conditions: the
    // managed change is pending but the data block reaches it only through a
    // local value, so the read still happens during plan. Two objects that
    // describe the same remote resource without any reference at all behave
    // the same way.
    let mock = Arc::new(MockProvider::new());

    let managed = Resource::managed("test_resource", "a");
    let mut state = State::new();
    let managed_addr = seed_current(
        &mut state,
        managed.clone(),
        InstanceKey::NoKey,
        serde_json::json!({"id": "a-id", "valid": false}),
    );

    let mut root = base_module();
    root.add_managed(ResourceConfig::managed("test_resource", "a").with_attr("valid", Expr::lit(true)));
    root.locals.insert(
        "object_id".into(),
        Expr::resource_attr(managed, "id"),
    );
    root.add_data(
        ResourceConfig::data("test_data_source", "a").with_attr("id", Expr::local("object_id")),
    );

    let run = run_plan(Config::new(root), state, PlanOpts::normal(), &mock).await;
    assert!(!run.plan.errored, "{:?}", run.diagnostics);

    let managed_change = run.plan.changes.for_addr(&managed_addr).expect("managed change");
    assert_eq!(managed_change.action, Action::Update);

    let data_addr = root_instance(Resource::data("test_data_source", "a"), InstanceKey::NoKey);
    assert!(
        run.plan.changes.for_addr(&data_addr).is_none(),
        "eager data read must not record a change"
    );
    assert_eq!(mock.calls_of("read_data_source"), 1, "read must happen during plan");
}

#[tokio::test]
async fn every_prior_instance_gets_exactly_one_change() {
    // Mixed state: one kept, one orphaned, one with wrong repetition.
    let mock = Arc::new(MockProvider::new());
    let mut state = State::new();
    let kept = seed_current(
        &mut state,
        Resource::managed("test_object", "kept"),
        InstanceKey::NoKey,
        serde_json::json!({"id": "1"}),
    );
    let orphaned = seed_current(
        &mut state,
        Resource::managed("test_object", "gone"),
        InstanceKey::NoKey,
        serde_json::json!({"id": "2"}),
    );
    let stale = seed_current(
        &mut state,
        Resource::managed("test_object", "kept"),
        InstanceKey::Str("old".into()),
        serde_json::json!({"id": "3"}),
    );

    let mut root = base_module();
    root.add_managed(ResourceConfig::managed("test_object", "kept"));

    let run = run_plan(Config::new(root), state, PlanOpts::normal(), &mock).await;
    assert!(!run.plan.errored, "{:?}", run.diagnostics);
    assert_unique_change_keys(&run);

    for addr in [&kept, &orphaned, &stale] {
        assert!(
            run.plan.changes.for_addr(addr).is_some(),
            "missing change for {}",
            addr
        );
    }
    assert_eq!(
        run.plan.changes.for_addr(&orphaned).unwrap().reason,
        ActionReason::DeleteBecauseNoResourceConfig
    );
    assert_eq!(
        run.plan.changes.for_addr(&stale).unwrap().reason,
        ActionReason::DeleteBecauseWrongRepetition
    );
}
