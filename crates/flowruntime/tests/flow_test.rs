// crates/flowruntime/tests/flow_test.rs

use flowcore::{
    ConstructionError, FlowError, FlowEvent, FlowState, NodeContext, NodeError, PortError,
    RoutingError, Task, COMPLETION,
};
use flowruntime::Flow;
use std::time::Duration;
use tokio::sync::broadcast;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

// Start => (A, B) => C => Done

async fn fan_out(ctx: NodeContext) -> Result<(), NodeError> {
    ctx.send("A", 1).await?;
    ctx.close("A")?;
    ctx.send("B", "2").await?;
    ctx.close("B")?;
    Ok(())
}

async fn forward(mut ctx: NodeContext) -> Result<(), NodeError> {
    let value = ctx.recv("Start").await?;
    ctx.send("C", value).await?;
    Ok(())
}

async fn parse_int(mut ctx: NodeContext) -> Result<(), NodeError> {
    let value = ctx.recv("Start").await?;
    let text = value.as_str().ok_or_else(|| NodeError::InvalidInputType {
        edge: "Start2B".to_string(),
        expected: "string".to_string(),
        actual: value.type_name().to_string(),
    })?;
    let parsed: i64 = text
        .parse()
        .map_err(|e| NodeError::failed(format!("cannot parse {text:?}: {e}")))?;
    ctx.send("C", parsed).await?;
    Ok(())
}

async fn sum_sink(mut ctx: NodeContext) -> Result<(), NodeError> {
    let a = ctx.recv("A").await?;
    let b = ctx.recv("B").await?;
    let sum = a.as_i64().zip(b.as_i64()).map(|(a, b)| a + b);
    ctx.complete(sum == Some(3))?;
    Ok(())
}

async fn silent_sink(mut ctx: NodeContext) -> Result<(), NodeError> {
    ctx.recv("A").await?;
    ctx.recv("B").await?;
    Ok(())
}

async fn panics(_ctx: NodeContext) -> Result<(), NodeError> {
    panic!("boom")
}

fn fan_in_flow(
    deadline: Duration,
    a: impl Task + 'static,
    sink: impl Task + 'static,
) -> Flow {
    let mut flow = Flow::new(deadline);
    flow.declare_start("Start").unwrap().set_task(fan_out);
    flow.declare_node("A").unwrap().set_task(a);
    flow.declare_node("B").unwrap().set_task(parse_int);
    flow.declare_sink("C").unwrap().set_task(sink);

    flow.connect("Start", "A").unwrap();
    flow.connect("Start", "B").unwrap();
    flow.connect("A", "C").unwrap();
    flow.connect("B", "C").unwrap();
    flow
}

fn drain(events: &mut broadcast::Receiver<FlowEvent>) -> Vec<FlowEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn fan_out_fan_in_completes() {
    init_tracing();
    let mut flow = fan_in_flow(Duration::from_secs(2), forward, sum_sink);

    let result = flow.run().await;
    assert!(result.is_ok(), "unexpected failure: {result:?}");
    assert_eq!(flow.state(), FlowState::Succeeded);

    flow.cleanup();
}

#[tokio::test]
async fn missing_completion_times_out() {
    init_tracing();
    let mut flow = fan_in_flow(Duration::from_millis(1), forward, silent_sink);

    let error = flow.run().await.unwrap_err();
    assert!(error.is_timeout(), "expected timeout, got {error:?}");
    assert!(matches!(
        error,
        FlowError::Timeout { deadline } if deadline == Duration::from_millis(1)
    ));
    assert_eq!(flow.state(), FlowState::TimedOut);

    flow.cleanup();
}

#[tokio::test]
async fn panic_in_a_node_fails_the_run() {
    init_tracing();
    let mut flow = fan_in_flow(Duration::from_secs(2), panics, sum_sink);

    match flow.run().await {
        Err(FlowError::Panic { node, payload }) => {
            assert_eq!(node, "A");
            assert_eq!(payload, "boom");
        }
        other => panic!("expected panic failure, got {other:?}"),
    }
    assert_eq!(flow.state(), FlowState::Failed);

    flow.cleanup();
}

#[tokio::test]
async fn sink_can_report_incomplete() {
    init_tracing();
    let mut flow = Flow::new(Duration::from_secs(2));
    flow.declare_start("Start")
        .unwrap()
        .set_task(|ctx: NodeContext| async move { ctx.send("C", 1).await });
    flow.declare_sink("C").unwrap().set_task(|mut ctx: NodeContext| async move {
        ctx.recv("Start").await?;
        ctx.complete(false)
    });
    flow.connect("Start", "C").unwrap();

    let error = flow.run().await.unwrap_err();
    assert!(matches!(error, FlowError::Incomplete));
    assert_eq!(error.to_string(), "Task incomplete.");
    assert_eq!(flow.state(), FlowState::Incomplete);
}

#[tokio::test]
async fn task_failure_is_returned() {
    init_tracing();
    let mut flow = Flow::new(Duration::from_secs(2));
    flow.declare_start("Start")
        .unwrap()
        .set_task(|ctx: NodeContext| async move { ctx.send("A", "x").await });
    flow.declare_node("A").unwrap().set_task(parse_int);
    flow.declare_sink("C")
        .unwrap()
        .set_task(|mut ctx: NodeContext| async move {
            ctx.recv("A").await?;
            ctx.complete(true)
        });
    flow.connect("Start", "A").unwrap();
    flow.connect("A", "C").unwrap();

    // parse_int reads from "Start" and fails on the non numeric string.
    match flow.run().await {
        Err(FlowError::Task { node, source }) => {
            assert_eq!(node, "A");
            assert!(matches!(source, NodeError::ExecutionFailed(_)));
        }
        other => panic!("expected task failure, got {other:?}"),
    }
}

#[tokio::test]
async fn failure_reported_before_completion_wins() {
    init_tracing();
    for _ in 0..50 {
        let mut flow = Flow::new(Duration::from_secs(2));
        flow.declare_start("Start")
            .unwrap()
            .set_task(|_ctx: NodeContext| async move { Ok::<_, NodeError>(()) });
        flow.declare_node("A")
            .unwrap()
            .set_task(|_ctx: NodeContext| async move { Err::<(), _>(NodeError::failed("A failed")) });
        flow.declare_sink("C")
            .unwrap()
            .set_task(|mut ctx: NodeContext| async move {
                // A's edge is released only after its failure is reported.
                let _ = ctx.recv("A").await;
                ctx.complete(true)
            });
        flow.connect("A", "C").unwrap();

        match flow.run().await {
            Err(FlowError::Task { node, .. }) => assert_eq!(node, "A"),
            other => panic!("expected A's failure, got {other:?}"),
        }
        assert_eq!(flow.state(), FlowState::Failed);
        flow.cleanup();
    }
}

#[tokio::test]
async fn edge_delivers_every_value_in_order() {
    init_tracing();
    let mut flow = Flow::new(Duration::from_secs(5));
    flow.declare_start("Start")
        .unwrap()
        .set_task(|ctx: NodeContext| async move {
            for i in 0..100i64 {
                ctx.send("Sink", i).await?;
            }
            ctx.close("Sink")?;
            Ok::<_, NodeError>(())
        });
    flow.declare_sink("Sink")
        .unwrap()
        .set_task(|mut ctx: NodeContext| async move {
            let mut received = Vec::new();
            loop {
                match ctx.recv("Start").await {
                    Ok(value) => received.push(value.as_i64()),
                    Err(NodeError::Port(PortError::Closed { .. })) => break,
                    Err(e) => return Err(e),
                }
            }
            let expected: Vec<_> = (0..100i64).map(Some).collect();
            ctx.complete(received == expected)
        });
    flow.connect("Start", "Sink").unwrap();

    flow.run().await.unwrap();
}

#[tokio::test]
async fn reconnect_replaces_the_binding() {
    let mut flow = Flow::new(Duration::from_secs(1));
    flow.declare_start("Start").unwrap();
    flow.declare_node("A").unwrap();

    let first = flow.connect("Start", "A").unwrap();
    let second = flow.connect("Start", "A").unwrap();
    assert_ne!(first, second);

    let start = flow.start().unwrap();
    assert_eq!(start.outbound_to("A").unwrap().id(), second);
    assert_eq!(flow.node("A").unwrap().inbound_from("Start").unwrap().id(), second);

    let registered: Vec<_> = flow.edges("Start", "A").iter().map(|e| e.id()).collect();
    assert_eq!(registered, vec![first, second]);
    assert_eq!(flow.edge_count(), 2);
}

#[tokio::test]
async fn reconnected_edge_carries_the_data() {
    let mut flow = Flow::new(Duration::from_secs(2));
    flow.declare_start("Start")
        .unwrap()
        .set_task(|ctx: NodeContext| async move { ctx.send("C", true).await });
    flow.declare_sink("C").unwrap().set_task(|mut ctx: NodeContext| async move {
        let ok = ctx.recv("Start").await?.as_bool().unwrap_or(false);
        ctx.complete(ok)
    });
    flow.connect("Start", "C").unwrap();
    flow.connect("Start", "C").unwrap();

    flow.run().await.unwrap();
    flow.cleanup();
    assert!(flow.edges("Start", "C").iter().all(|e| e.is_closed()));
}

#[test]
fn invalid_names_are_rejected() {
    let mut flow = Flow::new(Duration::from_secs(1));
    assert_eq!(flow.declare_node("").unwrap_err(), ConstructionError::EmptyName);
    assert_eq!(
        flow.declare_sink(COMPLETION).unwrap_err(),
        ConstructionError::ReservedName(COMPLETION.to_string())
    );
    assert_eq!(flow.declare_start("").unwrap_err(), ConstructionError::EmptyName);
    assert_eq!(flow.node_count(), 0);
}

#[test]
fn duplicate_names_are_rejected() {
    let mut flow = Flow::new(Duration::from_secs(1));
    flow.declare_start("Start").unwrap();
    flow.declare_node("A").unwrap();

    assert_eq!(
        flow.declare_sink("A").unwrap_err(),
        ConstructionError::DuplicateName("A".to_string())
    );
    assert_eq!(
        flow.declare_node("Start").unwrap_err(),
        ConstructionError::DuplicateName("Start".to_string())
    );
    assert!(matches!(
        flow.declare_start("Other"),
        Err(ConstructionError::StartAlreadyDeclared { .. })
    ));
}

#[test]
fn missing_relations_are_routing_errors() {
    let mut flow = Flow::new(Duration::from_secs(1));
    flow.declare_start("Start").unwrap();
    flow.declare_node("A").unwrap();
    flow.declare_sink("C").unwrap();
    flow.connect("Start", "A").unwrap();

    let a = flow.node("A").unwrap();
    assert_eq!(
        a.outbound_to("C").unwrap_err(),
        RoutingError::NotConnected {
            from: "A".to_string(),
            to: "C".to_string()
        }
    );
    assert!(a.inbound_from("C").is_err());
    assert_eq!(
        a.completion_outbound().unwrap_err(),
        RoutingError::NotASink("A".to_string())
    );
    assert!(flow.node("C").unwrap().completion_outbound().is_ok());
    assert_eq!(
        flow.connect("A", "Nowhere").unwrap_err(),
        RoutingError::UnknownNode("Nowhere".to_string())
    );
    // The failed connect left nothing behind.
    assert!(a_has_no_outbound(&flow));
}

fn a_has_no_outbound(flow: &Flow) -> bool {
    flow.node("A").unwrap().ports().outbound_len() == 0
}

#[tokio::test]
async fn run_validates_the_graph_first() {
    let mut flow = Flow::new(Duration::from_secs(1));
    assert!(matches!(
        flow.run().await,
        Err(FlowError::Construction(ConstructionError::MissingStart))
    ));

    flow.declare_start("Start")
        .unwrap()
        .set_task(|_ctx: NodeContext| async move { Ok::<_, NodeError>(()) });
    flow.declare_node("A").unwrap();
    assert!(matches!(
        flow.run().await,
        Err(FlowError::Construction(ConstructionError::MissingTask(name))) if name == "A"
    ));
    assert_eq!(flow.state(), FlowState::Idle);
}

#[tokio::test]
async fn flow_runs_only_once() {
    let mut flow = fan_in_flow(Duration::from_secs(2), forward, sum_sink);
    flow.run().await.unwrap();

    assert!(matches!(
        flow.run().await,
        Err(FlowError::NotIdle(FlowState::Succeeded))
    ));
}

#[tokio::test]
async fn cleanup_is_idempotent() {
    let mut flow = fan_in_flow(Duration::from_secs(1), forward, sum_sink);
    flow.cleanup();
    flow.cleanup();
    assert_eq!(flow.edge_count(), 4);
    assert!(flow.edges("A", "C").iter().all(|e| e.is_closed()));
}

#[tokio::test]
async fn losing_sink_does_not_block() {
    init_tracing();
    let mut flow = Flow::new(Duration::from_secs(2));
    let mut events = flow.subscribe();
    flow.declare_start("Start")
        .unwrap()
        .set_task(|_ctx: NodeContext| async move { Ok::<_, NodeError>(()) });
    for name in ["S1", "S2"] {
        flow.declare_sink(name)
            .unwrap()
            .set_task(|ctx: NodeContext| async move { ctx.complete(true) });
    }

    flow.run().await.unwrap();

    // Both sinks finish even though only one signal was read.
    let mut finished = Vec::new();
    while finished.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("both sinks finish")
            .unwrap();
        if let FlowEvent::NodeFinished { node, .. } = event {
            if node.starts_with('S') {
                finished.push(node);
            }
        }
    }
    finished.sort();
    assert_eq!(finished, vec!["S1", "S2"]);
}

#[tokio::test]
async fn timeout_unwinds_blocked_tasks() {
    init_tracing();
    let mut flow = Flow::new(Duration::from_millis(20));
    let mut events = flow.subscribe();
    flow.declare_start("Start")
        .unwrap()
        .set_task(|ctx: NodeContext| async move {
            // Hold the edge open without ever sending.
            ctx.cancelled().await;
            Ok::<_, NodeError>(())
        });
    flow.declare_sink("C")
        .unwrap()
        .set_task(|mut ctx: NodeContext| async move {
            ctx.recv("Start").await?;
            ctx.complete(true)
        });
    flow.connect("Start", "C").unwrap();

    assert!(flow.run().await.unwrap_err().is_timeout());

    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("blocked sink unwinds")
            .unwrap();
        if let FlowEvent::NodeFailed { node, error, .. } = event {
            assert_eq!(node, "C");
            assert!(error.contains("cancelled"), "unexpected error: {error}");
            break;
        }
    }
}

#[tokio::test]
async fn run_emits_lifecycle_events() {
    let mut flow = fan_in_flow(Duration::from_secs(2), forward, sum_sink);
    let mut events = flow.subscribe();

    flow.run().await.unwrap();

    let seen = drain(&mut events);
    let run_id = seen.first().map(FlowEvent::run_id).expect("events emitted");
    assert!(matches!(seen.first(), Some(FlowEvent::RunStarted { nodes: 4, .. })));
    assert!(seen.iter().all(|e| e.run_id() == run_id));
    assert!(seen.iter().any(|e| matches!(
        e,
        FlowEvent::RunFinished {
            state: FlowState::Succeeded,
            error: None,
            ..
        }
    )));
}
