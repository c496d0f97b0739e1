//! Cross-component invariants that don't fit a single module's test suite.

use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::harness::*;
use crate::bus::{BroadcastNote, Message, MessageKind};
use crate::config::BusConfig;
use crate::hierarchy::{AgentSpec, AgentTier, SelectionStrategy, TaskRef};
use crate::reliability::MetricsSink;
use crate::workflow::{Subtask, SubtaskStatus, Workflow, WorkflowStatus};

/// Concurrent assignment attempts never push an agent past its capacity.
#[tokio::test]
async fn load_never_exceeds_max_concurrent() {
    let stack = build_executor(fast_config().scheduler);
    let hierarchy = stack.hierarchy.clone();
    let agent_id = hierarchy
        .register(
            AgentSpec::new("bounded", AgentTier::Specialist)
                .with_capability("x")
                .with_max_concurrent(2),
        )
        .unwrap();

    let mut handles = Vec::new();
    for n in 0..8 {
        let hierarchy = hierarchy.clone();
        let caps: std::collections::BTreeSet<crate::hierarchy::Capability> =
            [crate::hierarchy::Capability::from("x")].into_iter().collect();
        handles.push(tokio::spawn(async move {
            hierarchy.select_and_assign(
                &caps,
                SelectionStrategy::LeastLoaded,
                TaskRef::new("wf", format!("st-{}", n)),
            )
        }));
    }

    let mut leases = Vec::new();
    let mut misses = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(lease) => leases.push(lease),
            Err(_) => misses += 1,
        }
    }
    assert_eq!(leases.len(), 2);
    assert_eq!(misses, 6);
    assert_eq!(
        hierarchy.agent(&agent_id).unwrap().current_tasks.len(),
        2
    );
}

/// Per-(sender, recipient) FIFO holds with multiple interleaved senders at
/// equal priority.
#[tokio::test]
async fn fifo_holds_per_sender_pair() {
    let bus = crate::bus::MessageBus::new(&BusConfig::default(), Arc::new(MetricsSink::default()));
    bus.register("sink", crate::bus::RecipientProfile::component());

    for i in 0..4 {
        for sender in ["alice", "bob"] {
            bus.send(Message::to(
                sender,
                "sink",
                MessageKind::Broadcast(BroadcastNote {
                    topic: "t".into(),
                    body: format!("{}-{}", sender, i),
                }),
            ));
        }
    }

    let cancel = CancellationToken::new();
    let mut alice_seen = Vec::new();
    let mut bob_seen = Vec::new();
    for _ in 0..8 {
        let msg = bus
            .recv("sink", Duration::from_millis(200), &cancel)
            .await
            .unwrap();
        if let MessageKind::Broadcast(note) = &msg.kind {
            match msg.sender.as_str() {
                "alice" => alice_seen.push(note.body.clone()),
                "bob" => bob_seen.push(note.body.clone()),
                other => panic!("unexpected sender {}", other),
            }
        }
    }
    assert_eq!(alice_seen, vec!["alice-0", "alice-1", "alice-2", "alice-3"]);
    assert_eq!(bob_seen, vec!["bob-0", "bob-1", "bob-2", "bob-3"]);
}

/// A dependent subtask never starts before its dependency completed: with
/// a single serial agent, a chain executes strictly in order.
#[tokio::test]
async fn chain_executes_in_dependency_order() {
    let stack = build_executor(fast_config().scheduler);
    stack.executor.clone().start();
    let agent_id = stack
        .hierarchy
        .register(AgentSpec::new("serial", AgentTier::Specialist).with_capability("general"))
        .unwrap();
    stack
        .bus
        .register(&agent_id, crate::bus::RecipientProfile::component());

    let order = Arc::new(StdMutex::new(Vec::new()));
    let stop = CancellationToken::new();
    {
        let order = order.clone();
        spawn_specialist(stack.bus.clone(), agent_id, stop.clone(), move |a| {
            order.lock().unwrap().push(a.subtask_id.clone());
            success(0.9)
        });
    }

    let mut workflow = Workflow::new("wf-chain", "ordered work");
    workflow.insert_subtask(
        Subtask::new("a", "a", "first")
            .with_capability("general")
            .with_estimated_minutes(1),
    );
    workflow.insert_subtask(
        Subtask::new("b", "b", "second")
            .with_capability("general")
            .with_estimated_minutes(1)
            .with_dependency("a"),
    );
    workflow.insert_subtask(
        Subtask::new("c", "c", "third")
            .with_capability("general")
            .with_estimated_minutes(1)
            .with_dependency("b"),
    );
    let id = stack.executor.admit(workflow).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let report = stack.executor.status(&id).await.unwrap();
        if report.status.is_terminal() {
            assert_eq!(report.status, WorkflowStatus::Completed);
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("chain never completed: {:?}", report.counts);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    stop.cancel();
    stack.executor.stop().await;
}

/// A non-impacting branch failure cancels only its descendants; surviving
/// branches finish and the aggregate decides the workflow's fate.
#[tokio::test]
async fn branch_failure_cancels_only_descendants() {
    let stack = build_executor(fast_config().scheduler);
    stack.executor.clone().start();

    // Two specialists with disjoint capabilities: the flaky branch can die
    // without starving the healthy one.
    let stop = CancellationToken::new();
    for (name, capability) in [("good", "solid"), ("bad", "shaky")] {
        let agent_id = stack
            .hierarchy
            .register(AgentSpec::new(name, AgentTier::Specialist).with_capability(capability))
            .unwrap();
        stack
            .bus
            .register(&agent_id, crate::bus::RecipientProfile::component());
        if capability == "solid" {
            spawn_specialist(stack.bus.clone(), agent_id, stop.clone(), |_| success(0.95));
        } else {
            spawn_specialist(stack.bus.clone(), agent_id, stop.clone(), |_| {
                transient_failure("always broken")
            });
        }
    }

    // Long healthy trunk; short flaky spur with a dependent leaf.
    let mut workflow = Workflow::new("wf-branchy", "two branches");
    workflow.insert_subtask(
        Subtask::new("trunk", "trunk", "healthy work")
            .with_capability("solid")
            .with_estimated_minutes(60),
    );
    workflow.insert_subtask(
        Subtask::new("spur", "spur", "flaky work")
            .with_capability("shaky")
            .with_estimated_minutes(1)
            .with_retry_budget(1),
    );
    workflow.insert_subtask(
        Subtask::new("leaf", "leaf", "depends on flaky work")
            .with_capability("shaky")
            .with_estimated_minutes(1)
            .with_dependency("spur"),
    );
    let id = stack.executor.admit(workflow).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let report = loop {
        let report = stack.executor.status(&id).await.unwrap();
        if report.status.is_terminal() {
            break report;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("workflow never settled: {:?}", report.counts);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    let by_id = |needle: &str| {
        report
            .subtasks
            .iter()
            .find(|st| st.id == needle)
            .unwrap()
            .status
    };
    assert_eq!(by_id("trunk"), SubtaskStatus::Completed);
    assert_eq!(by_id("spur"), SubtaskStatus::Failed);
    assert_eq!(by_id("leaf"), SubtaskStatus::Cancelled);
    // Trunk quality 0.95 over the only completed weight clears the target.
    assert_eq!(report.status, WorkflowStatus::Completed);

    stop.cancel();
    stack.executor.stop().await;
}
