mod common;

use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use troupe::actor::{PushConnDriver, RawFrame, RawInbound, RawOutbound};
use troupe::{ActorError, ActorRegistry, ManualClock, StandaloneTopology, ToClient, ToServer, Topology};

use common::*;

fn topology() -> Arc<StandaloneTopology> {
    let echo = counter_definition().on_raw_websocket(|_ctx, socket| async move {
        let (sender, mut inbound) = socket.split();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                match message {
                    RawInbound::Frame(frame) => {
                        sender.send(frame);
                    }
                    RawInbound::Close { .. } => break,
                }
            }
        });
        Ok(())
    });
    let runtime = memory_runtime(
        ActorRegistry::new().with(echo),
        Arc::new(ManualClock::new(0)),
    );
    StandaloneTopology::new(runtime.context)
}

#[tokio::test]
async fn get_or_create_is_stable_per_key() {
    let topology = topology();
    let key = vec!["room".to_string(), "1".to_string()];

    let first = topology.get_or_create("counter", &key, None).await.unwrap();
    let second = topology.get_or_create("counter", &key, None).await.unwrap();
    let other = topology
        .get_or_create("counter", &["room".to_string(), "2".to_string()], None)
        .await
        .unwrap();

    assert_eq!(first.actor_id, second.actor_id);
    assert_ne!(first.actor_id, other.actor_id);

    let err = topology.get_or_create("missing", &key, None).await.unwrap_err();
    assert_eq!(err, ActorError::ActorNotFound("missing".to_string()));
}

#[tokio::test]
async fn concurrent_loads_share_one_instance() {
    let topology = topology();
    let record = topology.get_or_create("counter", &[], None).await.unwrap();

    let loads = futures::future::join_all((0..8).map(|_| topology.load_actor(&record.actor_id))).await;
    assert!(loads.iter().all(|l| l.is_ok()));
    assert_eq!(topology.loaded_actor_count(), 1);
}

#[tokio::test]
async fn http_actions_leave_no_conns_behind() {
    let topology = topology();
    let record = topology.get_or_create("counter", &[], None).await.unwrap();

    for _ in 0..3 {
        topology
            .execute_action(&record.actor_id, "increment", vec![json!(1)], json!({}), Default::default())
            .await
            .unwrap();
    }
    let count = topology
        .execute_action(&record.actor_id, "get", vec![], json!({}), Default::default())
        .await
        .unwrap();
    assert_eq!(count, json!(3));

    let instance = topology.load_actor(&record.actor_id).await.unwrap();
    assert!(instance.conn_ids().is_empty());
}

#[tokio::test]
async fn websocket_conns_round_trip_through_the_topology() {
    let topology = topology();
    let record = topology.get_or_create("counter", &[], None).await.unwrap();
    let (driver, mut rx) = PushConnDriver::websocket();

    let connected = topology
        .connect(&record.actor_id, json!({}), Default::default(), Arc::new(driver))
        .await
        .unwrap();
    assert_eq!(
        next_message(&mut rx).await,
        ToClient::Init {
            actor_id: record.actor_id.clone(),
            conn_id: connected.conn_id.clone(),
            conn_token: connected.conn_token.clone(),
        }
    );

    topology
        .send_message(
            &record.actor_id,
            &connected.conn_id,
            &connected.conn_token,
            ToServer::ActionRequest {
                id: 7,
                name: "increment".to_string(),
                args: vec![json!(2)],
            },
        )
        .await
        .unwrap();
    assert_eq!(
        next_message(&mut rx).await,
        ToClient::ActionResponse {
            id: 7,
            output: json!(2)
        }
    );

    drop(rx);
    topology.disconnect(&record.actor_id, &connected.conn_id).await.unwrap();
    let instance = topology.load_actor(&record.actor_id).await.unwrap();
    assert!(instance.get_conn(&connected.conn_id).is_none());
}

#[tokio::test]
async fn raw_websockets_are_handed_to_the_actor() {
    let topology = topology();
    let record = topology.get_or_create("counter", &[], None).await.unwrap();

    let mut transport = topology
        .open_raw_websocket(&record.actor_id, "/echo".to_string(), HashMap::new())
        .await
        .unwrap();
    transport
        .inbound
        .send(RawInbound::Frame(RawFrame::Text("hello".to_string())))
        .unwrap();

    match transport.outbound.recv().await {
        Some(RawOutbound::Frame(RawFrame::Text(text))) => assert_eq!(text, "hello"),
        other => panic!("unexpected frame {:?}", other),
    }
}

#[tokio::test]
async fn raw_websockets_need_a_handler() {
    let runtime = counter_runtime().0;
    let topology = StandaloneTopology::new(runtime.context);
    let record = topology.get_or_create("counter", &[], None).await.unwrap();

    let err = topology
        .open_raw_websocket(&record.actor_id, "/".to_string(), HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ActorError::Unsupported(_)));
}

#[tokio::test]
async fn shutdown_stops_loaded_actors() {
    let topology = topology();
    let record = topology.get_or_create("counter", &[], None).await.unwrap();
    let instance = topology.load_actor(&record.actor_id).await.unwrap();

    topology.shutdown().await;
    assert_eq!(instance.status(), troupe::ActorStatus::Stopped);
    assert_eq!(topology.loaded_actor_count(), 0);
}
