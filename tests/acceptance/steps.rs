//! Step definitions.

use std::time::Duration;

use cucumber::{given, then, when};
use serde_json::json;
use uuid::Uuid;

use fatmouse_client::events::EventPayload;
use fatmouse_client::test_utils::{publish_event, FakeWorker};
use fatmouse_client::{ErrorKind, Event, FatmouseError, ResultFuture};

use super::AcceptanceWorld;

const WAIT: Duration = Duration::from_secs(1);

// ============================================================================
// Connection
// ============================================================================

#[given("I connect to fatmouse")]
async fn connect(_world: &mut AcceptanceWorld) {
    // The world connects on creation; the broker starts empty.
}

#[given("a worker is serving the api exchange")]
async fn serve_api(world: &mut AcceptanceWorld) {
    world.worker = Some(FakeWorker::api(&world.broker).await.unwrap());
}

#[when("I reconnect to fatmouse")]
async fn reconnect(world: &mut AcceptanceWorld) {
    world.reconnect().await;
}

// ============================================================================
// Task results
// ============================================================================

#[when(expr = "I send task {string} to fatmouse")]
async fn send_task(world: &mut AcceptanceWorld, task: String) {
    let future: ResultFuture = world
        .client
        .dispatch_async(&task, &json!({"server_id": "srv-1", "env_id": "env-1"}))
        .await
        .unwrap();
    world.correlation_id = Some(future.correlation_id().to_string());
    world.future = Some(future);
}

#[when(expr = "I call task {string}")]
async fn call_task(world: &mut AcceptanceWorld, task: String) {
    send_task(world, task).await;
    see_task(world).await;
    send_result(world).await;
}

#[then("I see this task in the task queue")]
async fn see_task(world: &mut AcceptanceWorld) {
    let task = world.worker().next_task(WAIT).await.unwrap();
    let task = task.expect("task was not delivered to the worker");
    assert_eq!(task.id, world.correlation_id());
    assert!(task.args.is_empty());
}

#[then("I send result to result queue for the task")]
async fn send_result(world: &mut AcceptanceWorld) {
    let id = world.correlation_id().to_string();
    world
        .worker()
        .reply_success(&id, json!({"username": "srv-1", "password": "p"}))
        .await
        .unwrap();
}

#[then(expr = "the worker fails the task with {string}")]
async fn fail_task(world: &mut AcceptanceWorld, exc_type: String) {
    let id = world.correlation_id().to_string();
    world
        .worker()
        .reply_failure(&id, &exc_type, "already exists", json!({"id": "srv-1"}))
        .await
        .unwrap();
}

#[then("I can get result in same process")]
async fn result_same_process(world: &mut AcceptanceWorld) {
    let future = world.future.as_mut().expect("no pending future");
    let result = future.get(Some(WAIT)).await.unwrap();
    assert_eq!(result["username"], "srv-1");
}

#[then("I can get result in other process")]
async fn result_other_process(world: &mut AcceptanceWorld) {
    world.future = None;
    world.reconnect().await;
    receive_result(world).await;
}

#[then("I can acknowledge result")]
async fn acknowledge_result(world: &mut AcceptanceWorld) {
    result_same_process(world).await;
    let future = world.future.as_mut().expect("no pending future");
    future.ack().await.unwrap();
    assert!(future.is_acked());
}

#[then("I can receive task result")]
async fn receive_result(world: &mut AcceptanceWorld) {
    let mut future: ResultFuture = world.client.result_future(world.correlation_id()).unwrap();
    let result = future.get(Some(WAIT)).await.unwrap();
    assert_eq!(result["password"], "p");
    world.future = Some(future);
}

#[when("I acknowledge task result")]
async fn acknowledge_task_result(world: &mut AcceptanceWorld) {
    let future = world.future.as_mut().expect("no pending future");
    future.ack().await.unwrap();
}

#[then("I can't receive task result")]
async fn no_result(world: &mut AcceptanceWorld) {
    let mut future: ResultFuture = world.client.result_future(world.correlation_id()).unwrap();
    let err = future.get(Some(WAIT)).await.unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got {}", err);
}

#[then(expr = "getting the result fails with remote error {string}")]
async fn result_fails(world: &mut AcceptanceWorld, exc_type: String) {
    let future = world.future.as_mut().expect("no pending future");
    let err = future.get(Some(WAIT)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteFailure);
    assert_eq!(err.remote().unwrap().error_type(), exc_type);
}

// ============================================================================
// Events
// ============================================================================

async fn listen(world: &mut AcceptanceWorld) {
    let sink = world.received.clone();
    world
        .client
        .subscribe(move |event: Event| {
            sink.lock().unwrap().push(event);
            std::future::ready(Ok::<(), FatmouseError>(()))
        })
        .await
        .unwrap();
}

/// Poll once and take the single event that arrived.
async fn receive_event(world: &mut AcceptanceWorld) -> Event {
    assert!(world.client.poll_events(Some(WAIT)).await.unwrap());
    let mut received = world.received.lock().unwrap();
    assert_eq!(received.len(), 1, "expected exactly one event");
    received.remove(0)
}

#[when("I start listening for events from fam server")]
async fn start_listening(world: &mut AcceptanceWorld) {
    listen(world).await;
}

#[when("I send random event to event queue")]
async fn send_random_event(world: &mut AcceptanceWorld) {
    let id = Uuid::new_v4().to_string();
    publish_event(
        &world.broker,
        &json!({
            "event_id": id,
            "name": "test_event",
            "date": "2024-03-01T12:00:00",
            "payload": {"n": 1}
        }),
    )
    .await
    .unwrap();
    world.sent_event_id = Some(id);
}

#[then("I see that this very event was handled")]
async fn event_handled(world: &mut AcceptanceWorld) {
    let event = receive_event(world).await;
    assert_eq!(Some(event.id()), world.sent_event_id.as_deref());
    assert_eq!(event.payload(), &EventPayload::Generic(json!({"n": 1})));
    world.last_event = Some(event);
}

#[then("I see that this very event was handled again")]
async fn event_handled_again(world: &mut AcceptanceWorld) {
    let event = receive_event(world).await;
    assert_eq!(Some(event.id()), world.sent_event_id.as_deref());
    assert!(event.is_redelivered());
    world.last_event = Some(event);
}

#[when("I restart event listener")]
async fn restart_listener(world: &mut AcceptanceWorld) {
    world.last_event = None;
    world.reconnect().await;
    listen(world).await;
}

#[when("I acknowledge event")]
async fn acknowledge_event(world: &mut AcceptanceWorld) {
    let event = world.last_event.take().expect("no event to acknowledge");
    event.ack().await.unwrap();
}

#[then("I see no new events were sent")]
async fn no_new_events(world: &mut AcceptanceWorld) {
    let polled = world
        .client
        .poll_events(Some(Duration::from_millis(200)))
        .await
        .unwrap();
    assert!(!polled);
    assert!(world.received.lock().unwrap().is_empty());
}

#[when(expr = "server {string} reports reboot {string}")]
async fn report_reboot(world: &mut AcceptanceWorld, server_id: String, boot_id: String) {
    let id = Uuid::new_v4().to_string();
    publish_event(
        &world.broker,
        &json!({
            "event_id": id,
            "name": "reboot_complete",
            "payload": {"server_id": server_id, "boot_id": boot_id}
        }),
    )
    .await
    .unwrap();
    world.sent_event_id = Some(id);
}

#[then(expr = "I see a reboot of server {string}")]
async fn see_reboot(world: &mut AcceptanceWorld, server_id: String) {
    let event = receive_event(world).await;
    match event.payload() {
        EventPayload::RebootComplete(payload) => assert_eq!(payload.server_id, server_id),
        other => panic!("unexpected payload: {:?}", other),
    }
    event.ack().await.unwrap();
}
