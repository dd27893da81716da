// Integration tests for the dispatch task: interactive queue, playback and shutdown
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

use krusty_ingest::gcode::{ChannelSink, NullSink};
use krusty_ingest::{
    DispatchConfig, DispatchError, Dispatcher, FileLineSource, InputMessage, LineBuffer, LineInterpreter,
    LineSource, NullMotion, OutputSink, ParseResult, PlaybackError, PlaybackStep, SubmitError,
};

/// Records every line it sees and answers from a script, then `Ok`.
struct Scripted {
    seen: Arc<Mutex<Vec<String>>>,
    script: VecDeque<ParseResult>,
}

impl Scripted {
    fn new(script: impl IntoIterator<Item = ParseResult>) -> (Self, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let interpreter = Self {
            seen: seen.clone(),
            script: script.into_iter().collect(),
        };
        (interpreter, seen)
    }
}

impl LineInterpreter for Scripted {
    fn interpret(&mut self, message: &InputMessage) -> ParseResult {
        assert!(message.in_use(), "message must be held while it is interpreted");
        let line = String::from_utf8_lossy(message.line().as_bytes()).into_owned();
        self.seen.lock().unwrap().push(line);
        self.script.pop_front().unwrap_or(ParseResult::Ok)
    }
}

/// Line source that counts how often it is asked for a line.
struct CountingSource {
    lines: VecDeque<&'static [u8]>,
    reads: Arc<AtomicUsize>,
}

impl CountingSource {
    fn new(lines: &[&'static [u8]]) -> (Self, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        let source = Self {
            lines: lines.iter().copied().collect(),
            reads: reads.clone(),
        };
        (source, reads)
    }
}

impl LineSource for CountingSource {
    fn read_next_line(&mut self, line: &mut LineBuffer) -> bool {
        self.reads.fetch_add(1, Ordering::SeqCst);
        match self.lines.pop_front() {
            Some(text) => {
                line.extend_from_slice(text);
                true
            }
            None => false,
        }
    }
}

fn null_sink() -> Arc<dyn OutputSink> {
    Arc::new(NullSink)
}

#[tokio::test]
async fn test_busy_message_comes_back_intact() {
    let (interpreter, seen) = Scripted::new([ParseResult::Busy]);
    let (mut dispatcher, handle) =
        Dispatcher::start(&DispatchConfig::default(), interpreter, &mut NullMotion).unwrap();

    let pending = assert_ok!(handle.commands.try_enqueue(InputMessage::text(b"G1 X10 F300", null_sink())));
    assert_eq!(dispatcher.poll_once().interactive, Some(ParseResult::Busy));

    let message = assert_ok!(pending.wait().await);
    assert_eq!(message.line().as_bytes(), b"G1 X10 F300");
    assert!(!message.in_use());
    assert_eq!(message.result(), Some(ParseResult::Busy));

    // Resubmitted unchanged, it goes through the second time.
    let pending = assert_ok!(handle.commands.try_enqueue(message));
    assert_eq!(dispatcher.poll_once().interactive, Some(ParseResult::Ok));
    let message = assert_ok!(pending.wait().await);
    assert!(message.line().is_empty());
    assert!(!message.in_use());
    assert_eq!(*seen.lock().unwrap(), vec!["G1 X10 F300", "G1 X10 F300"]);
}

#[tokio::test]
async fn test_non_busy_verdicts_clear_the_line() {
    let verdicts = [ParseResult::UnknownCommand, ParseResult::ChecksumMismatch, ParseResult::Error];
    let (interpreter, _seen) = Scripted::new(verdicts);
    let (mut dispatcher, handle) =
        Dispatcher::start(&DispatchConfig::default(), interpreter, &mut NullMotion).unwrap();

    for verdict in verdicts {
        let pending = assert_ok!(handle.commands.try_enqueue(InputMessage::text(b"X1", null_sink())));
        assert_eq!(dispatcher.poll_once().interactive, Some(verdict));
        let message = assert_ok!(pending.wait().await);
        assert!(message.line().is_empty());
        assert_eq!(message.result(), Some(verdict));
    }
}

#[test]
fn test_playback_streams_every_line_then_notifies_once() {
    let (interpreter, seen) = Scripted::new([]);
    let config = DispatchConfig {
        done_message: "FIN\n".to_string(),
        ..DispatchConfig::default()
    };
    let (mut dispatcher, handle) = Dispatcher::start(&config, interpreter, &mut NullMotion).unwrap();
    let (source, reads) = CountingSource::new(&[b"G28", b"G1 X1", b"G1 X2"]);
    let (sink, mut replies) = ChannelSink::new();
    dispatcher.playback_mut().start(Box::new(source), Arc::new(sink));

    for _ in 0..3 {
        assert_eq!(dispatcher.poll_once().playback, PlaybackStep::Dispatched(ParseResult::Ok));
    }
    assert_eq!(dispatcher.poll_once().playback, PlaybackStep::Finished);
    assert!(!dispatcher.playback().is_active());

    for _ in 0..5 {
        assert!(dispatcher.poll_once().is_idle());
    }
    assert_eq!(reads.load(Ordering::SeqCst), 4);
    assert_eq!(*seen.lock().unwrap(), vec!["G28", "G1 X1", "G1 X2"]);
    assert_eq!(replies.try_recv().unwrap(), "FIN\n");
    assert!(replies.try_recv().is_err());

    let status = handle.playback.latest();
    assert!(!status.active);
    assert_eq!(status.lines_dispatched, 3);
}

#[test]
fn test_playback_busy_is_not_retried() {
    let (interpreter, seen) = Scripted::new([ParseResult::Busy, ParseResult::Busy]);
    let (mut dispatcher, _handle) =
        Dispatcher::start(&DispatchConfig::default(), interpreter, &mut NullMotion).unwrap();
    let (source, _reads) = CountingSource::new(&[b"G1 X1", b"G1 X2"]);
    dispatcher.playback_mut().start(Box::new(source), null_sink());

    assert_eq!(dispatcher.poll_once().playback, PlaybackStep::Dispatched(ParseResult::Busy));
    assert!(dispatcher.playback().message().line().is_empty());
    assert_eq!(dispatcher.poll_once().playback, PlaybackStep::Dispatched(ParseResult::Busy));
    assert_eq!(*seen.lock().unwrap(), vec!["G1 X1", "G1 X2"]);
    assert_eq!(dispatcher.playback().status().last_result, Some(ParseResult::Busy));
}

#[test]
fn test_idle_pass_does_nothing() {
    let (interpreter, seen) = Scripted::new([]);
    let (mut dispatcher, handle) =
        Dispatcher::start(&DispatchConfig::default(), interpreter, &mut NullMotion).unwrap();
    let before = handle.playback.latest();

    let report = dispatcher.poll_once();
    assert!(report.is_idle());
    assert_eq!(report.interactive, None);
    assert_eq!(report.playback, PlaybackStep::Inactive);
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(handle.playback.latest(), before);
}

#[tokio::test]
async fn test_interactive_runs_before_playback_in_one_pass() {
    let (interpreter, seen) = Scripted::new([]);
    let (mut dispatcher, handle) =
        Dispatcher::start(&DispatchConfig::default(), interpreter, &mut NullMotion).unwrap();
    let (source, _reads) = CountingSource::new(&[b"G28"]);
    dispatcher.playback_mut().start(Box::new(source), null_sink());
    let pending = assert_ok!(handle.commands.try_enqueue(InputMessage::text(b"M105", null_sink())));

    let report = dispatcher.poll_once();
    assert_eq!(report.interactive, Some(ParseResult::Ok));
    assert_eq!(report.playback, PlaybackStep::Dispatched(ParseResult::Ok));
    assert_eq!(*seen.lock().unwrap(), vec!["M105", "G28"]);
    assert_ok!(pending.wait().await);
}

#[test]
fn test_full_queue_hands_message_back() {
    let (interpreter, _seen) = Scripted::new([]);
    let config = DispatchConfig::default();
    let (mut dispatcher, handle) = Dispatcher::start(&config, interpreter, &mut NullMotion).unwrap();

    let mut pending = Vec::new();
    for _ in 0..config.queue_len {
        pending.push(assert_ok!(handle.commands.try_enqueue(InputMessage::text(b"M114", null_sink()))));
    }
    assert_eq!(handle.commands.available(), 0);

    let rejected = assert_err!(handle.commands.try_enqueue(InputMessage::text(b"M5", null_sink())));
    assert!(matches!(rejected, SubmitError::Full(_)));
    let message = rejected.into_message();
    assert_eq!(message.line().as_bytes(), b"M5");
    assert!(!message.in_use());

    dispatcher.poll_once();
    assert_eq!(handle.commands.available(), 1);
}

#[tokio::test]
async fn test_messages_are_dispatched_in_queue_order() {
    let (interpreter, seen) = Scripted::new([]);
    let (mut dispatcher, handle) =
        Dispatcher::start(&DispatchConfig::default(), interpreter, &mut NullMotion).unwrap();

    let lines: [&[u8]; 3] = [b"G90", b"G1 Z0.2", b"M106 S255"];
    let pending: Vec<_> = lines
        .iter()
        .map(|line| handle.commands.try_enqueue(InputMessage::text(line, null_sink())).unwrap())
        .collect();
    // One interactive message per pass.
    for _ in 0..lines.len() {
        assert_eq!(dispatcher.poll_once().interactive, Some(ParseResult::Ok));
    }
    assert!(dispatcher.poll_once().is_idle());
    for pending in pending {
        assert_ok!(pending.wait().await);
    }
    assert_eq!(*seen.lock().unwrap(), vec!["G90", "G1 Z0.2", "M106 S255"]);
}

#[tokio::test]
async fn test_dropped_producer_does_not_stall_dispatch() {
    let (interpreter, seen) = Scripted::new([]);
    let (mut dispatcher, handle) =
        Dispatcher::start(&DispatchConfig::default(), interpreter, &mut NullMotion).unwrap();

    let pending = assert_ok!(handle.commands.try_enqueue(InputMessage::text(b"M84", null_sink())));
    drop(pending);
    assert_eq!(dispatcher.poll_once().interactive, Some(ParseResult::Ok));
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_pending_message_reports_stopped_task() {
    let (interpreter, _seen) = Scripted::new([]);
    let (dispatcher, handle) =
        Dispatcher::start(&DispatchConfig::default(), interpreter, &mut NullMotion).unwrap();

    let pending = assert_ok!(handle.commands.try_enqueue(InputMessage::text(b"M84", null_sink())));
    drop(dispatcher);
    assert_eq!(pending.wait().await.unwrap_err(), DispatchError::Closed);
    assert!(handle.commands.is_closed());
    assert_eq!(handle.playback.pause().await, Err(PlaybackError::TaskStopped));
}

#[tokio::test]
async fn test_running_task_serves_both_sources() {
    let (interpreter, seen) = Scripted::new([]);
    let (dispatcher, handle) =
        Dispatcher::start(&DispatchConfig::default(), interpreter, &mut NullMotion).unwrap();
    let task = dispatcher.spawn();

    let (sink, mut replies) = ChannelSink::new();
    let sink: Arc<dyn OutputSink> = Arc::new(sink);
    let mut status = handle.playback.subscribe();

    assert_eq!(handle.playback.pause().await, Err(PlaybackError::NoSession));
    let job = FileLineSource::from_bytes("job.gcode", b"G28\r\nG1 X5 Y5\n".to_vec());
    let id = assert_ok!(handle.playback.start(job, sink.clone()).await);

    let message = assert_ok!(handle.commands.submit(InputMessage::text(b"M105", sink.clone())).await);
    assert!(message.line().is_empty());
    assert_eq!(message.result(), Some(ParseResult::Ok));

    timeout(Duration::from_secs(5), async {
        loop {
            let finished = {
                let current = status.borrow_and_update();
                current.session == Some(id) && !current.active
            };
            if finished {
                break;
            }
            status.changed().await.unwrap();
        }
    })
    .await
    .expect("playback finishes");

    let snapshot = assert_ok!(handle.playback.status().await);
    assert_eq!(snapshot.lines_dispatched, 2);
    assert_eq!(replies.try_recv().unwrap(), "Done printing file\r\n");
    assert!(replies.try_recv().is_err());

    let mut lines = seen.lock().unwrap().clone();
    lines.sort();
    assert_eq!(lines, vec!["G1 X5 Y5", "G28", "M105"]);

    handle.shutdown();
    assert_ok!(timeout(Duration::from_secs(5), task).await.expect("task stops"));
}

#[tokio::test]
async fn test_run_returns_when_every_handle_is_dropped() {
    let (interpreter, _seen) = Scripted::new([]);
    let (dispatcher, handle) =
        Dispatcher::start(&DispatchConfig::default(), interpreter, &mut NullMotion).unwrap();
    drop(handle);
    timeout(Duration::from_secs(5), dispatcher.run())
        .await
        .expect("run returns once inputs are closed");
}

#[test]
fn test_direct_session_changes_are_published() {
    let (interpreter, _seen) = Scripted::new([]);
    let (mut dispatcher, handle) =
        Dispatcher::start(&DispatchConfig::default(), interpreter, &mut NullMotion).unwrap();
    let mut status = handle.playback.subscribe();
    let (source, _reads) = CountingSource::new(&[b"G28", b"G1 X1", b"G1 X2"]);
    let id = dispatcher.playback_mut().start(Box::new(source), null_sink());

    dispatcher.poll_once();
    assert!(handle.playback.is_active());
    assert_eq!(status.borrow_and_update().session, Some(id));

    assert_ok!(dispatcher.playback_mut().pause());
    assert!(dispatcher.poll_once().is_idle());
    assert!(status.has_changed().unwrap());
    assert!(!status.borrow_and_update().active);

    assert_ok!(dispatcher.playback_mut().resume());
    assert_ok!(dispatcher.playback_mut().stop());
    for _ in 0..5 {
        assert!(dispatcher.poll_once().is_idle());
    }
    let latest = handle.playback.latest();
    assert!(!latest.active);
    assert_eq!(latest.session, Some(id));
    assert_eq!(latest.lines_dispatched, 1);

    // Nothing changed, nothing published.
    status.borrow_and_update();
    dispatcher.poll_once();
    assert!(!status.has_changed().unwrap());
}

/// Blocks inside `interpret` until the test lets it go.
struct Gated {
    entered: std::sync::mpsc::Sender<()>,
    release: std::sync::mpsc::Receiver<()>,
}

impl LineInterpreter for Gated {
    fn interpret(&mut self, _message: &InputMessage) -> ParseResult {
        let _ = self.entered.send(());
        let _ = self.release.recv();
        ParseResult::Ok
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_message_in_dispatch_frees_its_queue_slot() {
    let (entered_tx, entered_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let interpreter = Gated {
        entered: entered_tx,
        release: release_rx,
    };
    let config = DispatchConfig::default();
    let (dispatcher, handle) = Dispatcher::start(&config, interpreter, &mut NullMotion).unwrap();
    let task = dispatcher.spawn();

    let first = assert_ok!(handle.commands.try_enqueue(InputMessage::text(b"G28", null_sink())));
    let entered = tokio::task::spawn_blocking(move || entered_rx.recv_timeout(Duration::from_secs(5)));
    assert_ok!(entered.await.unwrap());

    // The task holds "G28" while the whole queue is free again.
    let mut queued = Vec::new();
    for _ in 0..config.queue_len {
        queued.push(assert_ok!(handle.commands.try_enqueue(InputMessage::text(b"G1 X1", null_sink()))));
    }
    let rejected = assert_err!(handle.commands.try_enqueue(InputMessage::text(b"G1 X2", null_sink())));
    assert!(matches!(rejected, SubmitError::Full(_)));

    drop(release_tx);
    assert_ok!(first.wait().await);
    for pending in queued {
        assert_ok!(pending.wait().await);
    }
    handle.shutdown();
    assert_ok!(timeout(Duration::from_secs(5), task).await.expect("task stops"));
}
