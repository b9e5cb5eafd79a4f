//! Producer behavior against a scripted nsqd.

mod support;

use std::time::Duration;

use nsq::chan::Channel;
use nsq::{Config, Error, Producer, TransactionResult};
use support::{PubReply, ScriptedNsqd};

fn test_config() -> Config {
    let mut config = Config::default();
    config.dial_timeout = Duration::from_secs(2);
    config
}

#[test]
fn first_publish_connects_implicitly() {
    support::init_logging();
    let nsqd = ScriptedNsqd::start(vec![]);
    let producer = Producer::new(nsqd.addr(), test_config()).unwrap();

    producer.publish("events", b"one").unwrap();
    producer.publish("events", b"two").unwrap();
    producer.stop();

    let cmds = nsqd.commands();
    assert_eq!(
        cmds,
        vec!["IDENTIFY", "PUB events one", "PUB events two"],
        "exactly one handshake for two publishes"
    );
}

#[test]
fn error_frame_fails_the_matching_publish() {
    support::init_logging();
    let nsqd = ScriptedNsqd::start(vec![]);
    nsqd.script_pub_reply(PubReply::Ok);
    nsqd.script_pub_reply(PubReply::Error("E_BAD_MESSAGE PUB failed"));

    let producer = Producer::new(nsqd.addr(), test_config()).unwrap();
    producer.publish("events", b"good").unwrap();
    let err = producer.publish("events", b"bad").unwrap_err();
    match err {
        Error::ProtocolError(text) => assert!(text.starts_with("E_BAD_MESSAGE")),
        other => panic!("expected protocol error, got {other}"),
    }
    // the connection survives a per-message error
    producer.publish("events", b"again").unwrap();
    producer.stop();
}

#[test]
fn publish_async_delivers_result_with_args() {
    support::init_logging();
    let nsqd = ScriptedNsqd::start(vec![]);
    let producer = Producer::new(nsqd.addr(), test_config()).unwrap();

    let done: Channel<TransactionResult> = Channel::bounded(1);
    producer
        .publish_async("events", b"payload", &done, Some(Box::new(1234u32)))
        .unwrap();

    let result = done
        .recv_timeout(Duration::from_secs(2))
        .unwrap()
        .expect("result delivered");
    assert!(result.error.is_none());
    let args = result.args.expect("args round-trip");
    assert_eq!(args.downcast_ref::<u32>(), Some(&1234));
    producer.stop();
}

#[test]
fn multi_publish_sends_one_mpub() {
    support::init_logging();
    let nsqd = ScriptedNsqd::start(vec![]);
    let producer = Producer::new(nsqd.addr(), test_config()).unwrap();

    let bodies = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
    producer.multi_publish("events", &bodies).unwrap();
    producer.stop();

    assert!(nsqd.commands().contains(&"MPUB events 3".to_string()));
}

#[test]
fn publish_after_stop_is_refused() {
    support::init_logging();
    let nsqd = ScriptedNsqd::start(vec![]);
    let producer = Producer::new(nsqd.addr(), test_config()).unwrap();
    producer.publish("events", b"one").unwrap();
    producer.stop();
    producer.stop(); // idempotent

    assert!(matches!(
        producer.publish("events", b"late"),
        Err(Error::Stopped(_))
    ));
}

#[test]
fn invalid_topic_is_rejected_without_connecting() {
    support::init_logging();
    let producer = Producer::new("127.0.0.1:1", test_config()).unwrap();
    assert!(matches!(
        producer.publish("bad topic!", b"x"),
        Err(Error::InvalidName(_))
    ));
}
