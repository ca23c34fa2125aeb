use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use simbatch::{
    compile, execute, BatchArray, BatchHandler, BatchHandlerConfig, Client, ClientConfig, ClientError,
    ComputationContext, DistributedConfig, Input, LocalPoolConfig, ModelGraph, NodeRole, OpRef, OperationRegistry,
    Plan, SimError,
};

fn registry() -> OperationRegistry {
    let mut registry = OperationRegistry::standard();
    registry.register_fn("slow_copy", |inputs, _ctx| {
        thread::sleep(Duration::from_millis(2));
        Ok(inputs[0].clone())
    });
    registry
}

fn plan(registry: &Arc<OperationRegistry>) -> Arc<Plan> {
    let mut graph = ModelGraph::new(Arc::clone(registry)).with_context(ComputationContext::new(16, 2024));
    graph
        .add_node("mu", OpRef::normal(0.0, 2.0), Vec::<Input>::new(), NodeRole::Stochastic)
        .unwrap();
    graph
        .add_node("y", OpRef::with_params("gaussian_noise", serde_json::json!({ "std": 1.0 })), ["mu"], NodeRole::Stochastic)
        .unwrap();
    graph
        .add_node("slow", OpRef::new("slow_copy"), ["y"], NodeRole::Transform)
        .unwrap();
    graph.add_node("obs", OpRef::constant(&[0.3]), Vec::<Input>::new(), NodeRole::Observed)
        .unwrap();
    graph
        .add_node("d", OpRef::new("euclidean"), ["slow", "obs"], NodeRole::Transform)
        .unwrap();
    graph.freeze().unwrap();
    Arc::new(compile(&graph, &["mu", "d"]).unwrap())
}

fn backends(registry: &Arc<OperationRegistry>) -> Vec<Arc<Client>> {
    [
        ClientConfig::Direct,
        ClientConfig::LocalPool(LocalPoolConfig {
            workers: 4,
            queue_capacity: 32,
        }),
        ClientConfig::Distributed(DistributedConfig {
            endpoints: (0..3).map(|i| format!("loopback://worker-{i}")).collect(),
            ..DistributedConfig::default()
        }),
    ]
    .iter()
    .map(|config| Client::from_config(config, Arc::clone(registry)).unwrap())
    .collect()
}

#[test]
fn every_backend_delivers_every_batch_exactly_once() {
    let registry = Arc::new(registry());
    let plan = plan(&registry);

    for client in backends(&registry) {
        let kind = client.kind();
        let mut handler = BatchHandler::new(client);
        handler.start(Arc::clone(&plan), 40).unwrap();

        let mut seen = BTreeSet::new();
        while handler.has_outputs() {
            let result = handler.next_output().unwrap();
            assert_eq!(result.batch_size, 16, "{kind:?}");
            assert!(seen.insert(result.batch_index), "{kind:?} delivered a batch twice");
        }
        assert_eq!(seen, (0..40).collect(), "{kind:?}");
    }
}

#[test]
fn results_depend_only_on_batch_index() {
    let registry = Arc::new(registry());
    let plan = plan(&registry);

    for client in backends(&registry) {
        let mut handles: Vec<_> = (0..12).rev().map(|i| client.submit(&plan, i, 16).unwrap()).collect();
        client.wait_all(&mut handles, Some(Duration::from_secs(30))).unwrap();
        for handle in &mut handles {
            let result = handle.take().unwrap().unwrap();
            let expected = execute(&plan, result.batch_index, 16).unwrap();
            assert_eq!(result, expected, "{:?}", client.kind());
        }
    }
}

#[test]
fn cancelled_batches_are_never_delivered() {
    let registry = Arc::new(registry());
    let plan = plan(&registry);
    let client = Client::from_config(
        &ClientConfig::LocalPool(LocalPoolConfig {
            workers: 1,
            queue_capacity: 64,
        }),
        Arc::clone(&registry),
    )
    .unwrap();

    let mut handles: Vec<_> = (0..30).map(|i| client.submit(&plan, i, 16).unwrap()).collect();
    for handle in handles.iter_mut().skip(5) {
        client.cancel(handle);
    }
    client.wait_all(&mut handles, Some(Duration::from_secs(30))).unwrap();

    for handle in &mut handles {
        if handle.batch_index() < 5 {
            assert!(client.is_done(handle));
            assert!(handle.take().unwrap().is_ok());
        } else {
            assert!(!client.is_done(handle));
            assert!(handle.take().is_none());
        }
    }
}

#[test]
fn handler_respects_the_concurrency_limit() {
    let registry = Arc::new(registry());
    let plan = plan(&registry);
    let client = Client::from_config(
        &ClientConfig::LocalPool(LocalPoolConfig {
            workers: 4,
            queue_capacity: 32,
        }),
        registry,
    )
    .unwrap();
    let mut handler = BatchHandler::with_config(
        client,
        BatchHandlerConfig {
            max_in_flight: Some(2),
        },
    );
    handler.start(plan, 10).unwrap();
    assert_eq!(handler.in_flight(), 2);

    let mut completed = 0;
    while handler.has_outputs() {
        assert!(handler.in_flight() <= 2);
        handler.next_output_timeout(Duration::from_secs(30)).unwrap();
        completed += 1;
    }
    assert_eq!(completed, 10);
}

#[test]
fn handler_timeout_leaves_batches_in_flight() {
    let mut registry = OperationRegistry::new();
    registry.register_fn("stall", |_inputs, ctx| {
        thread::sleep(Duration::from_millis(300));
        Ok(BatchArray::from_scalars(vec![0.0; ctx.batch_size]))
    });
    let registry = Arc::new(registry);
    let mut graph = ModelGraph::new(Arc::clone(&registry)).with_context(ComputationContext::new(2, 0));
    graph
        .add_node("s", OpRef::new("stall"), Vec::<Input>::new(), NodeRole::Stochastic)
        .unwrap();
    graph.freeze().unwrap();
    let plan = Arc::new(compile(&graph, &["s"]).unwrap());

    let client = Client::from_config(
        &ClientConfig::LocalPool(LocalPoolConfig {
            workers: 1,
            queue_capacity: 4,
        }),
        registry,
    )
    .unwrap();
    let mut handler = BatchHandler::new(client);
    handler.start(plan, 1).unwrap();

    let err = handler.next_output_timeout(Duration::from_millis(10)).unwrap_err();
    assert!(matches!(err, SimError::Client(ClientError::Timeout { .. })));
    assert_eq!(handler.in_flight(), 1);
    assert!(handler.next_output().is_ok());
}

#[test]
fn unreachable_workers_make_the_backend_unavailable() {
    let config = ClientConfig::Distributed(DistributedConfig {
        endpoints: vec!["http://127.0.0.1:1".to_string()],
        ..DistributedConfig::default()
    });
    let err = Client::from_config(&config, Arc::new(OperationRegistry::standard())).unwrap_err();
    assert!(matches!(err, SimError::Client(ClientError::BackendUnavailable { .. })));

    let config = ClientConfig::LocalPool(LocalPoolConfig {
        workers: 0,
        queue_capacity: 1,
    });
    let err = Client::from_config(&config, Arc::new(OperationRegistry::standard())).unwrap_err();
    assert!(matches!(err, SimError::Client(ClientError::BackendUnavailable { .. })));
}
