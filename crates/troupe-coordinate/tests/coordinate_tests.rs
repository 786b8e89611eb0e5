mod common;

use futures::future::join_all;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use troupe::actor::{ConnFrame, PushConnDriver, RawFrame, RawInbound, RawOutbound};
use troupe::{ActorError, ActorStatus, ConnId, NodeId, RequestInfo, ToClient, ToServer, Topology};
use troupe_coordinate::{relay, PeerState, LEADER_CHANGED_REASON};

use common::{next_frame, next_message, Cluster};

#[tokio::test(start_paused = true)]
async fn exactly_one_node_wins_the_lease() {
    let cluster = Cluster::new();
    let actor_id = cluster.counter("race").await;
    let names: Vec<String> = (0..5).map(|i| format!("node-{}", i)).collect();
    let nodes = join_all(names.iter().map(|name| cluster.node(name))).await;

    let peers = join_all(nodes.iter().map(|node| node.acquire_actor(&actor_id, "race"))).await;
    let peers: Vec<_> = peers.into_iter().map(Result::unwrap).collect();

    let leaders: Vec<_> = peers.iter().filter(|peer| peer.is_leader()).collect();
    assert_eq!(leaders.len(), 1);

    let lease = cluster.coordinate.lease(&actor_id).unwrap();
    for peer in &peers {
        assert_eq!(peer.leader_node_id(), Some(lease.leader_node_id.clone()));
    }
}

#[tokio::test(start_paused = true)]
async fn releasing_the_last_reference_gives_up_the_lease() {
    let cluster = Cluster::new();
    let actor_id = cluster.counter("refs").await;
    let node = cluster.node("a").await;

    let peer = node.acquire_actor(&actor_id, "first").await.unwrap();
    assert!(peer.retain("second"));
    assert_eq!(peer.reference_count(), 2);

    node.release_actor(&actor_id, "first").await;
    assert_eq!(node.global().peer_count(), 1);
    assert!(cluster.coordinate.lease(&actor_id).is_some());

    node.release_actor(&actor_id, "second").await;
    assert_eq!(node.global().peer_count(), 0);
    assert_eq!(peer.state(), PeerState::Unacquired);
    assert!(!peer.retain("late"));
    assert!(cluster.coordinate.lease(&actor_id).is_none());
}

#[tokio::test(start_paused = true)]
async fn actions_through_a_follower_run_on_the_leader() {
    let cluster = Cluster::new();
    let actor_id = cluster.counter("relay").await;
    let a = cluster.node("a").await;
    let b = cluster.node("b").await;

    a.acquire_actor(&actor_id, "pin").await.unwrap();
    let output = b
        .execute_action(&actor_id, "increment", vec![json!(4)], json!({}), RequestInfo::default())
        .await
        .unwrap();
    assert_eq!(output, json!(4));

    // The follower's request reference is gone again
    assert_eq!(b.global().peer_count(), 0);
    assert_eq!(b.global().pending_relay_count(), 0);
    assert_eq!(cluster.persisted_count(&actor_id), 4);
}

#[tokio::test(start_paused = true)]
async fn relayed_conns_from_a_follower_all_land_on_the_leader() {
    let cluster = Cluster::new();
    let actor_id = cluster.counter("fan-in").await;
    let a = cluster.node("a").await;
    let b = cluster.node("b").await;
    a.acquire_actor(&actor_id, "pin").await.unwrap();

    let mut conns = Vec::new();
    for _ in 0..10 {
        let (driver, mut rx) = PushConnDriver::websocket();
        let connected = b
            .connect(&actor_id, json!({}), RequestInfo::default(), Arc::new(driver))
            .await
            .unwrap();
        match next_message(&mut rx).await {
            ToClient::Init { conn_id, .. } => assert_eq!(conn_id, connected.conn_id),
            other => panic!("expected init, got {:?}", other),
        }
        conns.push((connected, rx));
    }

    let leader_instance = a.global().peer(&actor_id).unwrap().leader_instance().unwrap();
    assert_eq!(leader_instance.conn_ids().len(), 10);

    for (connected, _) in &conns {
        for id in 0..5 {
            let message = ToServer::ActionRequest {
                id,
                name: "increment".to_string(),
                args: vec![json!(1)],
            };
            b.send_message(&actor_id, &connected.conn_id, &connected.conn_token, message)
                .await
                .unwrap();
        }
    }

    for (_, rx) in conns.iter_mut() {
        let mut answered = Vec::new();
        for _ in 0..5 {
            match next_message(rx).await {
                ToClient::ActionResponse { id, .. } => answered.push(id),
                other => panic!("expected an action response, got {:?}", other),
            }
        }
        answered.sort();
        assert_eq!(answered, vec![0, 1, 2, 3, 4]);
    }

    let total = b
        .execute_action(&actor_id, "get", vec![], json!({}), RequestInfo::default())
        .await
        .unwrap();
    assert_eq!(total, json!(50));
    assert_eq!(cluster.persisted_count(&actor_id), 50);
}

#[tokio::test(start_paused = true)]
async fn follower_rejects_messages_with_the_wrong_token() {
    let cluster = Cluster::new();
    let actor_id = cluster.counter("token").await;
    let a = cluster.node("a").await;
    let b = cluster.node("b").await;
    a.acquire_actor(&actor_id, "pin").await.unwrap();

    let (driver, mut rx) = PushConnDriver::websocket();
    let connected = b
        .connect(&actor_id, json!({}), RequestInfo::default(), Arc::new(driver))
        .await
        .unwrap();
    next_message(&mut rx).await;

    let message = ToServer::ActionRequest {
        id: 1,
        name: "increment".to_string(),
        args: vec![json!(1)],
    };
    let err = b
        .send_message(&actor_id, &connected.conn_id, "not-the-token", message)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "incorrect_conn_token");

    let err = b
        .send_message(
            &actor_id,
            &ConnId::generate(),
            &connected.conn_token,
            ToServer::SubscriptionRequest {
                event_name: "count".to_string(),
                subscribe: true,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conn_not_found");
}

#[tokio::test(start_paused = true)]
async fn closing_a_relayed_conn_removes_it_from_the_leader() {
    let cluster = Cluster::new();
    let actor_id = cluster.counter("close").await;
    let a = cluster.node("a").await;
    let b = cluster.node("b").await;
    a.acquire_actor(&actor_id, "pin").await.unwrap();

    let (driver, mut rx) = PushConnDriver::websocket();
    let connected = b
        .connect(&actor_id, json!({}), RequestInfo::default(), Arc::new(driver))
        .await
        .unwrap();
    next_message(&mut rx).await;

    b.disconnect(&actor_id, &connected.conn_id).await.unwrap();
    assert!(!b.global().has_relayed_conn(&connected.conn_id));
    assert_eq!(b.global().peer_count(), 0);

    let leader = a.global().peer(&actor_id).unwrap();
    let instance = leader.leader_instance().unwrap();
    for _ in 0..20 {
        if instance.conn_ids().is_empty() && leader.reference_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(instance.conn_ids().is_empty());
    assert_eq!(leader.reference_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn a_connect_hook_failing_on_the_leader_runs_once() {
    let cluster = Cluster::new();
    let actor_id = cluster.create("flaky", "hook").await;
    let a = cluster.node("a").await;
    let b = cluster.node("b").await;
    a.acquire_actor(&actor_id, "pin").await.unwrap();

    let (driver, mut rx) = PushConnDriver::websocket();
    let closed = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let ConnFrame::Close { reason, ack } = frame {
                let _ = ack.send(());
                return reason;
            }
        }
        None
    });

    let started = tokio::time::Instant::now();
    let err = b
        .connect(&actor_id, json!({}), RequestInfo::default(), Arc::new(driver))
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(err, ActorError::internal("db down"));
    assert_eq!(cluster.persisted_count(&actor_id), 1);

    let reason = closed.await.unwrap();
    assert_eq!(reason.as_deref(), Some("`on_connect` failed"));
    assert_eq!(b.global().peer_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn reconnecting_through_the_same_follower_keeps_the_new_transport() {
    let cluster = Cluster::new();
    let actor_id = cluster.counter("reconnect").await;
    let a = cluster.node("a").await;
    let b = cluster.node("b").await;
    let leader = a.acquire_actor(&actor_id, "pin").await.unwrap();

    let (first, mut rx1) = PushConnDriver::websocket();
    let connected = b
        .connect(&actor_id, json!({}), RequestInfo::default(), Arc::new(first))
        .await
        .unwrap();
    next_message(&mut rx1).await;

    let (second, mut rx2) = PushConnDriver::websocket();
    let reconnected = b
        .reconnect(&actor_id, &connected.conn_id, &connected.conn_token, Arc::new(second))
        .await
        .unwrap();
    assert_eq!(reconnected.conn_id, connected.conn_id);
    match next_message(&mut rx2).await {
        ToClient::Init { conn_id, .. } => assert_eq!(conn_id, connected.conn_id),
        other => panic!("expected init, got {:?}", other),
    }

    // Only the replaced transport is closed
    match next_frame(&mut rx1, Duration::from_secs(1)).await {
        ConnFrame::Close { reason, ack } => {
            let _ = ack.send(());
            assert_eq!(reason.as_deref(), Some("Replaced by reconnect"));
        }
        other => panic!("expected close, got {:?}", other),
    }

    let message = ToServer::ActionRequest {
        id: 1,
        name: "increment".to_string(),
        args: vec![json!(3)],
    };
    b.send_message(&actor_id, &connected.conn_id, &connected.conn_token, message)
        .await
        .unwrap();
    match next_message(&mut rx2).await {
        ToClient::ActionResponse { id, .. } => assert_eq!(id, 1),
        other => panic!("expected an action response, got {:?}", other),
    }
    assert!(rx2.try_recv().is_err());
    assert!(b.global().has_relayed_conn(&connected.conn_id));
    assert_eq!(b.global().peer_count(), 1);

    for _ in 0..20 {
        if leader.reference_count() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(leader.reference_count(), 2);
    assert_eq!(cluster.persisted_count(&actor_id), 3);
}

#[tokio::test(start_paused = true)]
async fn leaders_renew_past_the_lease_and_step_down_once_it_is_taken() {
    let cluster = Cluster::new();
    let actor_id = cluster.counter("renew").await;
    let a = cluster.node("a").await;
    let peer = a.acquire_actor(&actor_id, "pin").await.unwrap();
    let instance = peer.leader_instance().unwrap();
    let first = cluster.coordinate.lease(&actor_id).unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(peer.is_leader());
    let renewed = cluster.coordinate.lease(&actor_id).unwrap();
    assert_eq!(renewed.leader_node_id, NodeId::new("a"));
    assert!(renewed.expires_at > first.expires_at + 5000);

    cluster
        .coordinate
        .reassign_lease(&actor_id, &NodeId::new("thief"), 60_000);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(peer.state(), PeerState::Unacquired);
    assert_eq!(instance.status(), ActorStatus::Stopped);
    assert_eq!(a.global().peer_count(), 0);
    assert_eq!(
        cluster.coordinate.lease(&actor_id).unwrap().leader_node_id,
        NodeId::new("thief")
    );
}

#[tokio::test(start_paused = true)]
async fn a_follower_takes_over_when_the_leader_dies() {
    let cluster = Cluster::new();
    let actor_id = cluster.counter("failover").await;
    let a = cluster.node("a").await;
    let b = cluster.node("b").await;
    let c = cluster.node("c").await;

    a.acquire_actor(&actor_id, "pin").await.unwrap();
    let follower = b.acquire_actor(&actor_id, "pin").await.unwrap();
    assert_eq!(
        follower.state(),
        PeerState::Follower {
            leader: NodeId::new("a")
        }
    );

    let (driver, mut rx) = PushConnDriver::websocket();
    b.connect(&actor_id, json!({}), RequestInfo::default(), Arc::new(driver))
        .await
        .unwrap();
    next_message(&mut rx).await;
    let closed = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let ConnFrame::Close { reason, ack } = frame {
                let _ = ack.send(());
                return reason;
            }
        }
        None
    });

    a.execute_action(&actor_id, "increment", vec![json!(7)], json!({}), RequestInfo::default())
        .await
        .unwrap();

    cluster.coordinate.kill_node(a.node_id());

    // Retried until the new leader answers
    let output = relay::relay_action(
        c.global(),
        &actor_id,
        "increment",
        vec![json!(1)],
        json!({}),
        RequestInfo::default(),
        None,
    )
    .await
    .unwrap();
    assert_eq!(output, json!(8));

    assert!(follower.is_leader());
    assert_eq!(cluster.coordinate.lease(&actor_id).unwrap().leader_node_id, NodeId::new("b"));
    assert_eq!(c.global().pending_relay_count(), 0);

    // Clients relayed to the dead leader are told to reconnect
    let reason = closed.await.unwrap();
    assert_eq!(reason.as_deref(), Some(LEADER_CHANGED_REASON));
}

#[tokio::test(start_paused = true)]
async fn raw_websockets_are_proxied_to_the_leader() {
    let cluster = Cluster::new();
    let actor_id = cluster.counter("raw").await;
    let a = cluster.node("a").await;
    let b = cluster.node("b").await;
    let leader = a.acquire_actor(&actor_id, "pin").await.unwrap();

    let mut transport = b
        .open_raw_websocket(&actor_id, "/raw".to_string(), HashMap::new())
        .await
        .unwrap();
    assert_eq!(leader.reference_count(), 2);

    for frame in [RawFrame::Text("hello".to_string()), RawFrame::Binary(vec![0, 1, 255])] {
        transport.inbound.send(RawInbound::Frame(frame.clone())).unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(1), transport.outbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, RawOutbound::Frame(frame));
    }

    transport
        .inbound
        .send(RawInbound::Close {
            code: 1000,
            reason: String::new(),
        })
        .unwrap();
    for _ in 0..20 {
        if leader.reference_count() == 1 && b.global().peer_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(leader.reference_count(), 1);
    assert_eq!(b.global().peer_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_hands_leadership_back() {
    let cluster = Cluster::new();
    let actor_id = cluster.counter("shutdown").await;
    let a = cluster.node("a").await;

    a.execute_action(&actor_id, "increment", vec![json!(2)], json!({}), RequestInfo::default())
        .await
        .unwrap();
    let (driver, mut rx) = PushConnDriver::websocket();
    a.connect(&actor_id, json!({}), RequestInfo::default(), Arc::new(driver))
        .await
        .unwrap();
    let closed = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let ConnFrame::Close { ack, .. } = frame {
                let _ = ack.send(());
                return true;
            }
        }
        false
    });
    assert!(cluster.coordinate.lease(&actor_id).is_some());

    a.shutdown().await;
    assert!(closed.await.unwrap());
    assert_eq!(a.global().peer_count(), 0);
    assert!(cluster.coordinate.lease(&actor_id).is_none());
    assert_eq!(cluster.persisted_count(&actor_id), 2);

    let err = a
        .acquire_actor(&actor_id, "late")
        .await
        .err()
        .expect("expected acquire_actor to fail");
    assert_eq!(err.code(), "actor_stopped");
}
