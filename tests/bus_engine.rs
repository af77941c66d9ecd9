//! Connection engine tests against the in-process broker.

mod common;

use common::{eventually, MockBroker, GUID};
use dbus_wire::core::message::{Message, MessageType};
use dbus_wire::core::value::Value;
use dbus_wire::error::constants;
use dbus_wire::service::bus::{
    ConnectionState, HandlerOutcome, NameFlags, ReleaseNameReply, RequestNameReply, SignalFilter,
};
use dbus_wire::{DbusError, ServiceInterface};
use std::sync::Arc;
use std::time::Duration;

fn sleeper() -> Arc<ServiceInterface> {
    Arc::new(
        ServiceInterface::builder("org.example.Sleeper")
            .method("Sleep", "u", "u", |call| async move {
                let ms = call.args()[0].as_u32().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(u64::from(ms))).await;
                Ok(vec![Value::UInt32(ms)])
            })
            .build()
            .unwrap(),
    )
}

fn sleep_call(destination: &str, ms: u32) -> Message {
    Message::method_call("/sleeper", "Sleep")
        .destination(destination)
        .interface("org.example.Sleeper")
        .signature("u")
        .body(vec![Value::UInt32(ms)])
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_connect_assigns_unique_name() {
    let broker = MockBroker::start().await;
    let bus = broker.connect().await;

    assert_eq!(bus.unique_name(), Some(":1.1"));
    assert_eq!(bus.server_guid(), GUID);
    assert_eq!(bus.state(), ConnectionState::Ready);
    assert!(bus.unix_fd_enabled());

    let hello = &broker.trace()[0];
    assert_eq!(hello.member(), Some("Hello"));
    assert_eq!(hello.serial(), 1);
}

#[tokio::test]
async fn test_wrong_guid_is_rejected() {
    let broker = MockBroker::start().await;
    let mut config = broker.config();
    let address = broker
        .address()
        .replace(GUID, "ffffffffffffffffffffffffffffffff");
    config.connection.address = Some(address);

    let result = dbus_wire::MessageBus::connect(&config).await;
    assert!(matches!(result, Err(DbusError::Auth(_))));
}

#[tokio::test]
async fn test_replies_are_matched_out_of_order() {
    let broker = MockBroker::start().await;
    let service = broker.connect().await;
    service.export("/sleeper", sleeper()).await.unwrap();
    let client = broker.connect().await;
    let target = service.unique_name().unwrap().to_owned();

    let (slow, medium, fast) = tokio::join!(
        client.call_checked(sleep_call(&target, 300)),
        client.call_checked(sleep_call(&target, 150)),
        client.call_checked(sleep_call(&target, 10)),
    );
    assert_eq!(slow.unwrap().body(), &[Value::UInt32(300)]);
    assert_eq!(medium.unwrap().body(), &[Value::UInt32(150)]);
    assert_eq!(fast.unwrap().body(), &[Value::UInt32(10)]);

    // replies went out fastest first
    let returns: Vec<u32> = broker
        .peer_traffic()
        .iter()
        .filter(|m| m.message_type() == MessageType::MethodReturn)
        .filter_map(|m| m.body().first().and_then(Value::as_u32))
        .collect();
    assert_eq!(returns, vec![10, 150, 300]);
    // Hello plus the three sleeps
    assert_eq!(client.metrics().snapshot().replies_matched, 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_fails_pending_calls() {
    let broker = MockBroker::start().await;
    broker.swallow_calls_to("org.example.Void");
    let client = broker.connect().await;

    let mut calls = Vec::new();
    for ms in [1, 2, 3] {
        let bus = client.clone();
        calls.push(tokio::spawn(async move {
            bus.call(sleep_call("org.example.Void", ms)).await
        }));
    }
    assert!(
        eventually(|| {
            broker
                .trace()
                .iter()
                .filter(|m| m.destination() == Some("org.example.Void"))
                .count()
                == 3
        })
        .await
    );
    assert_eq!(client.metrics().snapshot().pending_calls, 3);

    client.disconnect().await;
    assert_eq!(client.metrics().snapshot().pending_calls, 0);
    for call in calls {
        let result = call.await.unwrap();
        assert!(matches!(result, Err(DbusError::Disconnected(_))));
    }
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.wait_for_disconnect().await.is_ok());
    assert!(matches!(
        client.send(sleep_call("org.example.Void", 4)),
        Err(DbusError::Disconnected(_))
    ));
}

#[tokio::test]
async fn test_reply_to_unknown_serial_is_discarded() {
    let broker = MockBroker::start().await;
    let client = broker.connect().await;
    let unique = client.unique_name().unwrap().to_owned();

    let orphan = Message::builder(MessageType::MethodReturn)
        .reply_serial(9999)
        .destination(unique.as_str())
        .sender("org.freedesktop.DBus")
        .build()
        .unwrap();
    broker.inject(&unique, orphan);

    assert!(eventually(|| client.metrics().snapshot().replies_discarded == 1).await);
    assert!(client.is_connected());
    assert_eq!(
        client.request_name("org.example.Still", NameFlags::NONE).await.unwrap(),
        RequestNameReply::PrimaryOwner
    );
}

#[tokio::test]
async fn test_call_timeout_forgets_the_call() {
    let broker = MockBroker::start().await;
    broker.swallow_calls_to("org.example.Void");
    let client = broker.connect().await;

    let result = client
        .call_with_timeout(sleep_call("org.example.Void", 1), Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(DbusError::Timeout)));
    assert!(eventually(|| client.metrics().snapshot().pending_calls == 0).await);
    assert!(client.is_connected());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_returns_after_teardown_completes() {
    let broker = MockBroker::start().await;
    broker.swallow_calls_to("org.example.Void");

    for round in 0..20 {
        let client = broker.connect().await;
        let mut calls = Vec::new();
        for ms in [1, 2, 3] {
            let bus = client.clone();
            calls.push(tokio::spawn(async move {
                bus.call(sleep_call("org.example.Void", ms)).await
            }));
        }
        assert!(eventually(|| client.metrics().snapshot().pending_calls == 3).await);

        client.disconnect().await;
        assert_eq!(
            client.metrics().snapshot().pending_calls,
            0,
            "round {round}: disconnect returned with calls still pending"
        );
        for call in calls {
            assert!(matches!(call.await.unwrap(), Err(DbusError::Disconnected(_))));
        }
    }
}

#[tokio::test]
async fn test_broker_hangup_is_a_failure() {
    let broker = MockBroker::start().await;
    let client = broker.connect().await;

    broker.kick_all();
    let result = tokio::time::timeout(Duration::from_secs(2), client.wait_for_disconnect())
        .await
        .unwrap();
    assert!(matches!(result, Err(DbusError::Disconnected(_))));
    assert!(client.disconnect_reason().is_some());
}

#[tokio::test]
async fn test_name_ownership_round_trip() {
    let broker = MockBroker::start().await;
    let first = broker.connect().await;
    let second = broker.connect().await;

    assert_eq!(
        first.request_name("org.example.Svc", NameFlags::NONE).await.unwrap(),
        RequestNameReply::PrimaryOwner
    );
    assert_eq!(
        first.request_name("org.example.Svc", NameFlags::NONE).await.unwrap(),
        RequestNameReply::AlreadyOwner
    );
    assert_eq!(
        second
            .request_name("org.example.Svc", NameFlags::DO_NOT_QUEUE)
            .await
            .unwrap(),
        RequestNameReply::Exists
    );
    assert_eq!(
        second.release_name("org.example.Svc").await.unwrap(),
        ReleaseNameReply::NotOwner
    );
    assert_eq!(
        first.release_name("org.example.Svc").await.unwrap(),
        ReleaseNameReply::Released
    );
    assert!(first.request_name("not a name", NameFlags::NONE).await.is_err());
}

#[tokio::test]
async fn test_signal_subscription_filters_locally() {
    let broker = MockBroker::start().await;
    let emitter = broker.connect().await;
    let listener = broker.connect().await;

    let mut stream = listener
        .subscribe_signals(
            SignalFilter::new()
                .sender(emitter.unique_name().unwrap())
                .interface("org.example.Events")
                .member("Tick"),
        )
        .unwrap();
    listener
        .add_match_rule("type='signal',interface='org.example.Events'")
        .await
        .unwrap();

    for member in ["Tock", "Tick"] {
        emitter
            .send(
                Message::new_signal(
                    "/events",
                    "org.example.Events",
                    member,
                    "u",
                    vec![Value::UInt32(7)],
                )
                .unwrap(),
            )
            .unwrap();
    }

    let signal = tokio::time::timeout(Duration::from_secs(2), stream.next_signal())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(signal.member(), Some("Tick"));
    assert_eq!(signal.sender(), emitter.unique_name());
    assert_eq!(signal.body(), &[Value::UInt32(7)]);
}

#[tokio::test]
async fn test_message_handler_can_answer_calls() {
    let broker = MockBroker::start().await;
    let service = broker.connect().await;
    let client = broker.connect().await;

    let id = service
        .add_message_handler(|message| {
            if message.member() != Some("Ping") {
                return Ok(HandlerOutcome::Continue);
            }
            let reply = Message::new_method_return(message, "s", vec![Value::from("pong")])?;
            Ok(HandlerOutcome::Reply(reply))
        })
        .unwrap();

    let ping = Message::method_call("/anything", "Ping")
        .destination(service.unique_name().unwrap())
        .build()
        .unwrap();
    let reply = client.call_checked(ping.clone()).await.unwrap();
    assert_eq!(reply.body(), &[Value::from("pong")]);

    assert!(service.remove_message_handler(id).unwrap());
    assert!(!service.remove_message_handler(id).unwrap());
    let err = client.call_checked(ping).await.unwrap_err();
    assert_eq!(err.error_name(), constants::UNKNOWN_METHOD);
}

#[tokio::test]
async fn test_failing_handler_produces_error_reply() {
    let broker = MockBroker::start().await;
    let service = broker.connect().await;
    let client = broker.connect().await;

    service
        .add_message_handler(|message| {
            if message.message_type() == MessageType::MethodCall {
                Err(DbusError::remote("org.example.Error.Nope", "handler refused"))
            } else {
                Ok(HandlerOutcome::Continue)
            }
        })
        .unwrap();

    let call = Message::method_call("/x", "Anything")
        .destination(service.unique_name().unwrap())
        .build()
        .unwrap();
    let err = client.call_checked(call).await.unwrap_err();
    assert_eq!(err.error_name(), "org.example.Error.Nope");
    assert_eq!(err.as_remote().unwrap().text, "handler refused");
}

#[tokio::test]
async fn test_match_rules_are_reference_counted() {
    let broker = MockBroker::start().await;
    let bus = broker.connect().await;
    let unique = bus.unique_name().unwrap().to_owned();
    let rule = "type='signal',interface='org.example.Events'";

    bus.add_match_rule(rule).await.unwrap();
    bus.add_match_rule(rule).await.unwrap();
    assert_eq!(bus.match_rule_refs(rule), 2);
    assert_eq!(broker.match_rules(&unique), vec![rule.to_owned()]);

    bus.remove_match_rule(rule).await.unwrap();
    assert_eq!(broker.match_rules(&unique).len(), 1);
    bus.remove_match_rule(rule).await.unwrap();
    assert!(broker.match_rules(&unique).is_empty());
    assert_eq!(bus.match_rule_refs(rule), 0);

    let add_match = broker
        .trace()
        .iter()
        .filter(|m| m.member() == Some("AddMatch"))
        .count();
    assert_eq!(add_match, 1);
}

#[tokio::test]
async fn test_dropping_every_handle_closes_the_connection() {
    let broker = MockBroker::start().await;
    let service = broker.connect().await;
    let client = broker.connect().await;

    let unique = service.unique_name().unwrap().to_owned();
    service.request_name("org.example.Gone", NameFlags::NONE).await.unwrap();
    drop(service);

    let probe = Message::method_call("/x", "GetNameOwner")
        .destination("org.freedesktop.DBus")
        .interface("org.freedesktop.DBus")
        .signature("s")
        .body(vec![Value::from("org.example.Gone")])
        .build()
        .unwrap();
    let mut released = false;
    for _ in 0..100 {
        match client.call_checked(probe.clone()).await {
            Err(e) if e.error_name() == constants::NAME_HAS_NO_OWNER => {
                released = true;
                break;
            }
            _ => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    assert!(released, "{unique} still owns the name");
}
