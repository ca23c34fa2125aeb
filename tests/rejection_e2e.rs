use std::sync::Arc;

use simbatch::inference::{quantile, Rejection, RejectionConfig, RejectionResult, SamplerState, StoppingRule};
use simbatch::{
    Client, ClientConfig, ComputationContext, DistributedConfig, GraphError, Input, LocalPoolConfig,
    ModelGraph, NodeRole, OpRef, OperationError, OperationRegistry, OutputPool, SimError, ValidationError,
};

/// theta ~ Uniform(0, 1); d = |theta - 0.5|.
fn model(registry: Arc<OperationRegistry>, batch_size: usize, seed: u64) -> ModelGraph {
    let mut graph = ModelGraph::new(registry).with_context(ComputationContext::new(batch_size, seed));
    graph
        .add_node("theta", OpRef::uniform(0.0, 1.0), Vec::<Input>::new(), NodeRole::Stochastic)
        .unwrap();
    graph
        .add_node(
            "d",
            OpRef::new("absolute_difference"),
            [Input::from("theta"), Input::from(0.5)],
            NodeRole::Transform,
        )
        .unwrap();
    graph.freeze().unwrap();
    graph
}

fn pool_client(workers: usize) -> Arc<Client> {
    Arc::new(
        Client::local_pool(&LocalPoolConfig {
            workers,
            queue_capacity: 64,
        })
        .unwrap(),
    )
}

fn assert_consistent(result: &RejectionResult) {
    assert_eq!(result.accepted, result.samples.len());
    for pair in result.samples.windows(2) {
        assert!(pair[0].discrepancy <= pair[1].discrepancy);
    }
    for sample in &result.samples {
        assert!(sample.discrepancy <= result.threshold);
        let theta = sample.parameters["theta"][0];
        assert_eq!((theta - 0.5).abs(), sample.discrepancy);
    }
}

#[test]
fn quantile_run_with_budget_stops_as_soon_as_enough_is_simulated() {
    let registry = Arc::new(OperationRegistry::standard());
    let graph = model(registry, 1000, 11);
    let config = RejectionConfig::new(["theta"], "d", 50, StoppingRule::Quantile(0.01)).with_budget(100_000);

    let mut rejection = Rejection::new(&graph, config, pool_client(4)).unwrap();
    let result = rejection.sample().unwrap();

    assert_eq!(result.accepted, 50);
    assert_eq!(result.simulations, 5000);
    assert_eq!(result.batches, 5);
    assert!(!result.budget_exhausted);
    assert_consistent(&result);

    let all = rejection.accumulator().discrepancies();
    assert_eq!(all.len(), 5000);
    assert_eq!(quantile(&all, 0.01), Some(result.threshold));
    assert!(result.threshold < 0.02);
    assert_eq!(rejection.state(), SamplerState::Done);
}

#[test]
fn quantile_run_without_budget() {
    let registry = Arc::new(OperationRegistry::standard());
    let graph = model(registry, 1000, 12);
    let config = RejectionConfig::new(["theta"], "d", 100, StoppingRule::Quantile(0.05));

    let result = Rejection::new(&graph, config, pool_client(2)).unwrap().sample().unwrap();

    assert_eq!(result.accepted, 100);
    assert_eq!(result.simulations, 2000);
    assert_consistent(&result);
}

#[test]
fn threshold_run_accepts_only_within_threshold() {
    let registry = Arc::new(OperationRegistry::standard());
    let graph = model(registry, 100, 13);
    let config = RejectionConfig::new(["theta"], "d", 30, StoppingRule::Threshold(0.1)).with_budget(100_000);

    let mut rejection = Rejection::new(&graph, config, Arc::new(Client::direct())).unwrap();
    let result = rejection.sample().unwrap();

    assert_eq!(result.accepted, 30);
    assert_eq!(result.threshold, 0.1);
    assert!(result.samples.iter().all(|s| s.discrepancy <= 0.1));
    assert!(rejection.accumulator().count_within(0.1) >= 30);
    assert_eq!(result.simulations % 100, 0);
    assert_consistent(&result);
}

#[test]
fn exhausted_budget_is_reported() {
    let registry = Arc::new(OperationRegistry::standard());
    let graph = model(registry, 100, 14);
    let config = RejectionConfig::new(["theta"], "d", 30, StoppingRule::Threshold(1e-12)).with_budget(550);

    let result = Rejection::new(&graph, config, pool_client(2)).unwrap().sample().unwrap();

    assert!(result.budget_exhausted);
    assert_eq!(result.batches, 5);
    assert_eq!(result.simulations, 500);
    assert!(result.accepted < 30);
    assert_consistent(&result);
}

#[test]
fn backends_agree_when_the_budget_fixes_the_batches() {
    let registry = Arc::new(OperationRegistry::standard());
    let graph = model(Arc::clone(&registry), 1000, 99);
    let config = RejectionConfig::new(["theta"], "d", 50, StoppingRule::Quantile(0.01)).with_budget(5000);

    let direct = Rejection::new(&graph, config.clone(), Arc::new(Client::direct()))
        .unwrap()
        .sample()
        .unwrap();
    let pooled = Rejection::new(&graph, config.clone(), pool_client(3))
        .unwrap()
        .sample()
        .unwrap();
    let remote = Client::from_config(
        &ClientConfig::Distributed(DistributedConfig {
            endpoints: vec!["loopback://w0".to_string(), "loopback://w1".to_string()],
            ..DistributedConfig::default()
        }),
        registry,
    )
    .unwrap();
    let distributed = Rejection::new(&graph, config, remote).unwrap().sample().unwrap();

    assert_eq!(direct, pooled);
    assert_eq!(direct, distributed);
}

#[test]
fn failing_batch_aborts_the_run() {
    let mut registry = OperationRegistry::standard();
    registry.register_fn("fragile", |inputs, ctx| {
        if ctx.batch_index == 3 {
            return Err(OperationError::failed("simulator diverged"));
        }
        Ok(inputs[0].clone())
    });
    let mut graph = ModelGraph::new(Arc::new(registry)).with_context(ComputationContext::new(10, 5));
    graph
        .add_node("theta", OpRef::uniform(0.0, 1.0), Vec::<Input>::new(), NodeRole::Stochastic)
        .unwrap();
    graph
        .add_node("sim", OpRef::new("fragile"), ["theta"], NodeRole::Stochastic)
        .unwrap();
    graph
        .add_node("d", OpRef::new("absolute_difference"), [Input::from("sim"), Input::from(0.5)], NodeRole::Transform)
        .unwrap();
    graph.freeze().unwrap();

    let config = RejectionConfig::new(["theta"], "d", 1000, StoppingRule::Quantile(0.1)).with_max_in_flight(1);
    let mut rejection = Rejection::new(&graph, config, Arc::new(Client::direct())).unwrap();
    let err = rejection.sample().unwrap_err();

    assert_eq!(err.batch_index(), Some(3));
    match err {
        SimError::Execution(e) => {
            assert_eq!(e.node, "sim");
            assert!(e.to_string().contains("simulator diverged"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(rejection.state(), SamplerState::Done);
    assert_eq!(rejection.accumulator().batches(), 3);
}

#[test]
fn configuration_errors_surface_before_any_batch() {
    let registry = Arc::new(OperationRegistry::standard());
    let graph = model(registry, 100, 1);

    let none = RejectionConfig::new(Vec::<String>::new(), "d", 10, StoppingRule::Quantile(0.1));
    let err = Rejection::new(&graph, none, Arc::new(Client::direct())).unwrap_err();
    assert!(matches!(err, SimError::Validation(ValidationError::NoParameters)));

    let small = RejectionConfig::new(["theta"], "d", 10, StoppingRule::Quantile(0.1)).with_budget(10);
    let err = Rejection::new(&graph, small, Arc::new(Client::direct())).unwrap_err();
    assert!(matches!(err, SimError::Validation(ValidationError::BudgetTooSmall { .. })));

    let missing = RejectionConfig::new(["phi"], "d", 10, StoppingRule::Quantile(0.1));
    let err = Rejection::new(&graph, missing, Arc::new(Client::direct())).unwrap_err();
    assert!(matches!(err, SimError::Graph(GraphError::UnknownNode { ref name }) if name == "phi"));
}

#[test]
fn output_pool_records_every_consumed_batch() {
    let registry = Arc::new(OperationRegistry::standard());
    let graph = model(registry, 200, 21);
    let config = RejectionConfig::new(["theta"], "d", 20, StoppingRule::Quantile(0.05)).with_budget(10_000);

    let mut rejection = Rejection::new(&graph, config, pool_client(2))
        .unwrap()
        .with_pool(OutputPool::with_stores(["theta", "d"]))
        .unwrap();
    let result = rejection.sample().unwrap();

    let pool = rejection.pool().unwrap();
    assert_eq!(pool.len() as u64, result.batches);
    assert_eq!(pool.context(), Some(ComputationContext::new(200, 21)));
    let stored: usize = (0..64)
        .filter_map(|i| pool.get_batch(i).get("d").map(|a| a.len()))
        .sum();
    assert_eq!(stored as u64, result.simulations);
}
