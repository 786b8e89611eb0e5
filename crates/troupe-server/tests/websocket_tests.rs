mod common;

use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use common::{eventually, spawn_server, App};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn next_json(ws: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("socket closed")
            .unwrap();
        match message {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {:?}", other),
        }
    }
}

async fn next_raw(ws: &mut Client) -> Message {
    tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("socket closed")
        .unwrap()
}

#[tokio::test]
async fn websocket_conns_speak_the_client_protocol() {
    let app = App::new();
    let actor_id = app.create("counter", "ws").await;
    let (address, _stop) = spawn_server(app.topology.clone()).await;

    let url = format!("ws://{}/actors/{}/connect/websocket", address, actor_id);
    let (mut ws, _) = connect_async(url).await.unwrap();

    let init = next_json(&mut ws).await;
    assert_eq!(init["type"], "init");
    assert_eq!(init["actor_id"], actor_id.as_str());

    let subscribe = json!({ "type": "subscription_request", "event_name": "count", "subscribe": true });
    ws.send(Message::Text(subscribe.to_string())).await.unwrap();
    let increment = json!({ "type": "action_request", "id": 1, "name": "increment", "args": [3] });
    ws.send(Message::Text(increment.to_string())).await.unwrap();

    // The broadcast is pushed from inside the action, ahead of its response
    assert_eq!(next_json(&mut ws).await, json!({ "type": "event", "name": "count", "args": [3] }));
    assert_eq!(next_json(&mut ws).await, json!({ "type": "action_response", "id": 1, "output": 3 }));

    ws.send(Message::Text("not json".to_string())).await.unwrap();
    let error = next_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "malformed_message");

    // Binary frames carry the same JSON
    let get = json!({ "type": "action_request", "id": 2, "name": "get" });
    ws.send(Message::Binary(get.to_string().into_bytes())).await.unwrap();
    assert_eq!(next_json(&mut ws).await, json!({ "type": "action_response", "id": 2, "output": 3 }));

    let instance = app.standalone.load_actor(&actor_id).await.unwrap();
    assert_eq!(instance.conn_ids().len(), 1);
    ws.close(None).await.unwrap();
    assert!(eventually(|| instance.conn_ids().is_empty()).await);
}

#[tokio::test]
async fn reconnecting_reattaches_the_same_conn() {
    let app = App::new();
    let actor_id = app.create("counter", "reconnect").await;
    let (address, _stop) = spawn_server(app.topology.clone()).await;

    let url = format!("ws://{}/actors/{}/connect/websocket", address, actor_id);
    let (mut first, _) = connect_async(url).await.unwrap();
    let init = next_json(&mut first).await;
    let conn_id = init["conn_id"].as_str().unwrap().to_string();
    let conn_token = init["conn_token"].as_str().unwrap().to_string();

    let url = format!(
        "ws://{}/actors/{}/connect/websocket?conn_id={}&conn_token={}",
        address, actor_id, conn_id, conn_token
    );
    let (mut second, _) = connect_async(url).await.unwrap();
    let init = next_json(&mut second).await;
    assert_eq!(init["conn_id"], conn_id.as_str());

    // The replaced transport is closed by the server
    let closed = next_raw(&mut first).await;
    assert!(matches!(closed, Message::Close(_)), "got {:?}", closed);

    let get = json!({ "type": "action_request", "id": 1, "name": "get" });
    second.send(Message::Text(get.to_string())).await.unwrap();
    assert_eq!(next_json(&mut second).await["output"], 0);
}

#[tokio::test]
async fn connecting_with_a_wrong_token_is_refused() {
    let app = App::new();
    let actor_id = app.create("counter", "refused").await;
    let (address, _stop) = spawn_server(app.topology.clone()).await;

    let url = format!("ws://{}/actors/{}/connect/websocket", address, actor_id);
    let (mut first, _) = connect_async(url).await.unwrap();
    let conn_id = next_json(&mut first).await["conn_id"].as_str().unwrap().to_string();

    let url = format!(
        "ws://{}/actors/{}/connect/websocket?conn_id={}&conn_token=forged",
        address, actor_id, conn_id
    );
    let (mut intruder, _) = connect_async(url).await.unwrap();
    let error = next_json(&mut intruder).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "incorrect_conn_token");
    let closed = next_raw(&mut intruder).await;
    assert!(matches!(closed, Message::Close(_)), "got {:?}", closed);
}

#[tokio::test]
async fn raw_websockets_reach_the_actor_handler() {
    let app = App::new();
    let actor_id = app.create("counter", "raw").await;
    let (address, _stop) = spawn_server(app.topology.clone()).await;

    let url = format!("ws://{}/actors/{}/raw/websocket", address, actor_id);
    let (mut ws, _) = connect_async(url).await.unwrap();

    ws.send(Message::Text("hello".to_string())).await.unwrap();
    assert_eq!(next_raw(&mut ws).await, Message::Text("hello".to_string()));

    ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    assert_eq!(next_raw(&mut ws).await, Message::Binary(vec![1, 2, 3]));

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn raw_websockets_need_a_handler() {
    let app = App::new();
    let actor_id = app.create("silent", "raw").await;
    let (address, _stop) = spawn_server(app.topology.clone()).await;

    let url = format!("ws://{}/actors/{}/raw/websocket", address, actor_id);
    match connect_async(url).await {
        Err(WsError::Http(response)) => assert!(response.status().is_server_error()),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("upgrade should have been refused"),
    }
}
