//! Consumer flow control and backoff against a scripted nsqd.
//!
//! The scripted daemon delivers one message at a time, each gated on the
//! response to the previous one, so the command transcript it records is
//! deterministic and can be asserted exactly.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nsq::{AdminClient, Config, Consumer, Handler, Message, TopicStats};
use support::ScriptedNsqd;

struct FailOnDemand {
    handled: AtomicUsize,
}

impl Handler for FailOnDemand {
    fn handle_message(
        &self,
        msg: &Message,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        if msg.body == b"fail" {
            return Err("scripted failure".into());
        }
        Ok(())
    }
}

fn wait_for_commands(nsqd: &ScriptedNsqd, done: impl Fn(&[String]) -> bool) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let cmds = nsqd.commands();
        if done(&cmds) {
            return cmds;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for commands, got {cmds:?}"
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn failures_drive_the_exact_backoff_command_sequence() {
    support::init_logging();
    let nsqd = ScriptedNsqd::start(vec![
        b"m1".to_vec(),
        b"m2".to_vec(),
        b"m3".to_vec(),
        b"fail".to_vec(),
        b"fail".to_vec(),
        b"m6".to_vec(),
        b"m7".to_vec(),
    ]);

    let mut config = Config::default();
    config.max_in_flight = 5;
    config.backoff_multiplier = Duration::from_millis(20);
    config.max_backoff_duration = Duration::from_millis(200);

    let consumer = Consumer::new("events", "workers", config).unwrap();
    let handler = Arc::new(FailOnDemand {
        handled: AtomicUsize::new(0),
    });
    consumer.add_handler(Arc::clone(&handler) as Arc<dyn Handler>, 1).unwrap();
    consumer.connect_to_nsqd(nsqd.addr()).unwrap();

    let expected = vec![
        "IDENTIFY", "SUB",
        "RDY 5",          // initial grant
        "FIN", "FIN",     // m1, m2 succeed
        "FIN",            // m3 succeeds, leaving 1 credit
        "RDY 5",          // low-credit refresh on m4 receipt
        "RDY 0", "REQ",   // m4 fails: credit to zero, then requeue
        "RDY 1",          // backoff probe
        "RDY 0", "REQ",   // m5 fails: window doubles
        "RDY 1",          // probe again
        "RDY 0", "FIN",   // m6 succeeds but counter is still nonzero
        "RDY 1",          // final probe
        "RDY 5", "FIN",   // m7 succeeds: backoff over, full grant restored
    ];
    let want = expected.len();
    let cmds = wait_for_commands(&nsqd, |cmds| cmds.len() >= want);
    let got: Vec<&str> = cmds.iter().map(String::as_str).collect();
    assert_eq!(got, expected);
    assert_eq!(handler.handled.load(Ordering::SeqCst), 7);

    let stats = consumer.stats();
    assert_eq!(stats.messages_received, 7);
    assert_eq!(stats.messages_finished, 5);
    assert_eq!(stats.messages_requeued, 2);

    consumer.stop();
}

#[test]
fn clean_run_finishes_every_message_and_stops() {
    support::init_logging();
    let nsqd = ScriptedNsqd::start(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

    let mut config = Config::default();
    config.max_in_flight = 2;
    let consumer = Consumer::new("events", "workers", config).unwrap();
    let handler = Arc::new(FailOnDemand {
        handled: AtomicUsize::new(0),
    });
    consumer.add_handler(Arc::clone(&handler) as Arc<dyn Handler>, 2).unwrap();
    consumer.connect_to_nsqd(nsqd.addr()).unwrap();

    wait_for_commands(&nsqd, |cmds| {
        cmds.iter().filter(|c| c.as_str() == "FIN").count() == 3
    });
    assert_eq!(handler.handled.load(Ordering::SeqCst), 3);

    let stopped = consumer.stopped_chan();
    consumer.stop();
    assert_eq!(stopped.recv(), None, "stopped channel closes on teardown");
    assert_eq!(consumer.stats().connections, 0);

    let cmds = nsqd.commands();
    assert_eq!(cmds.iter().filter(|c| c.as_str() == "FIN").count(), 3);
    assert!(cmds.contains(&"CLS".to_string()));
}

#[test]
fn heartbeat_is_answered_with_nop() {
    support::init_logging();
    let nsqd = ScriptedNsqd::start(vec![b"ping".to_vec()]);
    nsqd.heartbeat_after_sub();

    let mut config = Config::default();
    config.max_in_flight = 1;
    let consumer = Consumer::new("events", "workers", config).unwrap();
    let handler = Arc::new(FailOnDemand {
        handled: AtomicUsize::new(0),
    });
    consumer.add_handler(handler, 1).unwrap();
    consumer.connect_to_nsqd(nsqd.addr()).unwrap();

    let cmds = wait_for_commands(&nsqd, |cmds| {
        cmds.iter().any(|c| c == "NOP") && cmds.iter().any(|c| c == "FIN")
    });
    consumer.stop();

    let sub = cmds.iter().position(|c| c == "SUB").unwrap();
    let nop = cmds.iter().position(|c| c == "NOP").unwrap();
    assert!(sub < nop, "NOP answers the heartbeat sent after SUB");
}

struct DeferLater;

impl Handler for DeferLater {
    fn handle_message(
        &self,
        msg: &Message,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if msg.body == b"later" {
            msg.requeue_without_backoff(Duration::from_millis(5));
        }
        Ok(())
    }
}

#[test]
fn requeue_without_backoff_never_drops_credit() {
    support::init_logging();
    let nsqd = ScriptedNsqd::start(vec![b"later".to_vec(), b"done".to_vec()]);

    let mut config = Config::default();
    config.max_in_flight = 5;
    let consumer = Consumer::new("events", "workers", config).unwrap();
    consumer.add_handler(Arc::new(DeferLater), 1).unwrap();
    consumer.connect_to_nsqd(nsqd.addr()).unwrap();

    let expected = vec!["IDENTIFY", "SUB", "RDY 5", "REQ", "FIN"];
    let want = expected.len();
    let cmds = wait_for_commands(&nsqd, |cmds| cmds.len() >= want);
    let got: Vec<&str> = cmds.iter().map(String::as_str).collect();
    assert_eq!(got, expected);

    let stats = consumer.stats();
    assert_eq!(stats.messages_requeued, 1);
    assert_eq!(stats.messages_finished, 1);

    consumer.stop();
}

struct RecordingAdmin {
    calls: Mutex<Vec<String>>,
}

impl AdminClient for RecordingAdmin {
    fn create_topic(&self, topic: &str) -> nsq::Result<()> {
        self.calls.lock().unwrap().push(format!("topic {topic}"));
        Ok(())
    }

    fn create_channel(&self, topic: &str, channel: &str) -> nsq::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("channel {topic}/{channel}"));
        Ok(())
    }

    fn stats(&self, _topic: &str, _channel: &str) -> nsq::Result<TopicStats> {
        Ok(TopicStats::default())
    }
}

#[test]
fn admin_client_runs_before_each_subscribe() {
    support::init_logging();
    let nsqd = ScriptedNsqd::start(vec![]);

    let consumer = Consumer::new("events", "workers", Config::default()).unwrap();
    let admin = Arc::new(RecordingAdmin {
        calls: Mutex::new(Vec::new()),
    });
    consumer.set_admin_client(Arc::clone(&admin) as Arc<dyn AdminClient>);
    let handler = Arc::new(FailOnDemand {
        handled: AtomicUsize::new(0),
    });
    consumer.add_handler(handler, 1).unwrap();
    consumer.connect_to_nsqd(nsqd.addr()).unwrap();

    assert_eq!(
        admin.calls.lock().unwrap().as_slice(),
        ["topic events", "channel events/workers"]
    );
    consumer.stop();
}
