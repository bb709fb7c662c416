use std::borrow::Cow;
use std::fs::File;
use std::io::{BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::parser::{Classification, LineClassifier, RecordStats, TelemetryRecord};
use crate::transport::batch::BatchingBuffer;
use crate::transport::client::{connect_with_retry, TransportClient};
use crate::transport::message::{epoch_seconds, DataRecord, Message};

/// Tick used to release time-based batches when input goes quiet.
const MIN_FLUSH_TICK: Duration = Duration::from_millis(1);

/// Where echoed program output goes.
struct Echo {
    console: bool,
    file: Option<BufWriter<File>>,
}

impl Echo {
    fn open(print_out: bool, out_file: Option<&Path>) -> Result<Self> {
        let file = match out_file {
            Some(path) => Some(BufWriter::new(
                File::create(path)
                    .with_context(|| format!("creating output file {}", path.display()))?,
            )),
            None => None,
        };
        Ok(Self {
            console: print_out,
            file,
        })
    }

    fn write_line(&mut self, line: &str) {
        if self.console {
            println!("{line}");
        }
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = writeln!(file, "{line}") {
                warn!(error = %e, "writing output file failed, disabling it");
                self.file = None;
            }
        }
    }

    fn flush(&mut self) {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.flush() {
                warn!(error = %e, "flushing output file failed");
            }
        }
    }
}

/// Options deciding which lines are echoed and forwarded.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardOptions {
    /// Forward program output as `PlainLine` records.
    pub send_stdout: bool,
    /// Keep telemetry lines in echoed and forwarded output.
    pub send_all_stdout: bool,
}

impl From<&AgentConfig> for ForwardOptions {
    fn from(cfg: &AgentConfig) -> Self {
        Self {
            send_stdout: cfg.send_stdout,
            send_all_stdout: cfg.send_all_stdout,
        }
    }
}

/// Classifies lines and turns them into outbound messages.
///
/// Synchronous and free of I/O: the agent's read loop feeds it lines and
/// sends whatever it returns.
pub struct Forwarder {
    classifier: LineClassifier,
    batch: BatchingBuffer,
    options: ForwardOptions,
    stats: Arc<RecordStats>,
}

impl Forwarder {
    pub fn new(
        options: ForwardOptions,
        buffer_timeout: Duration,
        stats: Arc<RecordStats>,
    ) -> Self {
        Self {
            classifier: LineClassifier::new(),
            batch: BatchingBuffer::new(buffer_timeout),
            options,
            stats,
        }
    }

    /// Whether the line should appear in echoed output.
    pub fn keeps_line(&self, classification: &Classification) -> bool {
        self.options.send_all_stdout || !classification.is_telemetry
    }

    /// Classify one line and return the messages it releases, plus whether
    /// the line is kept for echoing.
    pub fn process_line(&mut self, line: &str, now: Instant) -> (Vec<Message>, bool) {
        let classification = self.classifier.classify(line);
        self.stats
            .record(classification.record.kind(), classification.is_telemetry);

        let keep = self.keeps_line(&classification);
        let mut out = Vec::new();

        if let Some(infos) = classification.flushed_infos {
            debug!(count = infos.len(), "counter descriptions complete");
            // Records buffered so far precede the descriptions on the wire.
            out.extend(self.batch.flush());
            out.push(Message::CounterInfos(infos));
        }

        let forward = match &classification.record {
            TelemetryRecord::CounterSample(_) | TelemetryRecord::TaskEvent(_) => true,
            TelemetryRecord::PlainLine { .. } => self.options.send_stdout && keep,
            TelemetryRecord::CounterDescription(_) | TelemetryRecord::RunBoundary { .. } => false,
        };

        if forward {
            if let Some(record) = DataRecord::from_record(classification.record) {
                out.extend(self.batch.push(record, now));
            }
        }

        (out, keep)
    }

    /// Release the pending batch if its window elapsed.
    pub fn poll_flush(&mut self, now: Instant) -> Option<Message> {
        self.batch.poll_flush(now)
    }

    /// Drain everything still held: the partial batch and descriptions that
    /// no counter record flushed.
    pub fn finish(&mut self) -> Vec<Message> {
        let mut out: Vec<Message> = self.batch.flush().into_iter().collect();
        if let Some(infos) = self.classifier.take_descriptions() {
            out.push(Message::CounterInfos(infos));
        }
        out
    }
}

/// Agent reads program output, classifies it and streams records to the
/// server.
pub struct Agent {
    cfg: AgentConfig,
    input: Option<PathBuf>,
    stats: Arc<RecordStats>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent reading `input`, or stdin when `None`.
    pub fn new(cfg: AgentConfig, input: Option<PathBuf>) -> Self {
        Self {
            cfg,
            input,
            stats: Arc::new(RecordStats::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the read loop; the collection is still closed.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal the agent to stop reading input.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run one collection: connect, stream input until exhausted or
    /// stopped, then close the collection and drain the connection.
    ///
    /// Returns the number of messages written.
    pub async fn run(&self) -> Result<u64> {
        let input = self.open_input().await?;
        let mut echo = Echo::open(self.cfg.print_out, self.cfg.out_file.as_deref())?;

        let addr = self.cfg.server_addr();
        let stream = connect_with_retry(
            &addr,
            self.cfg.connect_timeout,
            self.cfg.connect_poll_interval,
        )
        .await?;
        info!(addr = %addr, "connected to server");

        let client = TransportClient::spawn(stream, self.cfg.queue_size);
        client
            .send(Message::TransmissionBegin(epoch_seconds()))
            .await
            .context("sending transmission begin")?;

        let mut forwarder = Forwarder::new(
            ForwardOptions::from(&self.cfg),
            self.cfg.buffer_timeout,
            Arc::clone(&self.stats),
        );

        // Once Begin is out, the collection is always closed so the
        // server never keeps a live run for a dead agent.
        let streamed = self
            .forward_input(input, &client, &mut forwarder, &mut echo)
            .await;
        if let Err(e) = &streamed {
            warn!(error = %e, "forwarding stopped early, closing collection");
        }

        let closed = close_collection(&client, &mut forwarder).await;
        echo.flush();

        let drained = client.shutdown().await.context("draining connection");
        self.report_stats();

        streamed?;
        closed?;
        drained
    }

    /// Pumps input lines through the forwarder until EOF or cancellation.
    ///
    /// Bytes that are not valid UTF-8 are replaced, never fatal.
    async fn forward_input(
        &self,
        input: Box<dyn AsyncRead + Unpin + Send>,
        client: &TransportClient,
        forwarder: &mut Forwarder,
        echo: &mut Echo,
    ) -> Result<()> {
        let mut reader = BufReader::new(input);
        // Partial reads stay in `buf` when the select drops `read_until`.
        let mut buf = Vec::new();
        let mut ticker = tokio::time::interval(self.cfg.buffer_timeout.max(MIN_FLUSH_TICK));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("agent interrupted, closing collection");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Some(msg) = forwarder.poll_flush(Instant::now()) {
                        client.send(msg).await.context("sending batch")?;
                    }
                }
                read = reader.read_until(b'\n', &mut buf) => {
                    let read = read.context("reading input")?;
                    if read == 0 && buf.is_empty() {
                        return Ok(());
                    }
                    let line = decode_line(&buf);
                    let (messages, keep) = forwarder.process_line(&line, Instant::now());
                    if keep {
                        echo.write_line(&line);
                    }
                    buf.clear();
                    for msg in messages {
                        client.send(msg).await.context("sending message")?;
                    }
                }
            }
        }
    }

    async fn open_input(&self) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        match &self.input {
            Some(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("opening input {}", path.display()))?;
                Ok(Box::new(file))
            }
            None => {
                if std::io::stdin().is_terminal() {
                    bail!("no input: pipe program output to stdin or pass --input <file>");
                }
                Ok(Box::new(tokio::io::stdin()))
            }
        }
    }

    fn report_stats(&self) {
        let snap = self.stats.snapshot();
        info!(
            telemetry = snap.telemetry_lines,
            program = snap.program_lines,
            "classified lines",
        );
        for (kind, count) in &snap.by_kind {
            debug!(kind = kind.as_str(), count, "records by kind");
        }
    }
}

/// Flushes pending records and ends the collection.
async fn close_collection(client: &TransportClient, forwarder: &mut Forwarder) -> Result<()> {
    for msg in forwarder.finish() {
        client.send(msg).await.context("sending final batch")?;
    }
    client
        .send(Message::TransmissionEnd(epoch_seconds()))
        .await
        .context("sending transmission end")?;
    Ok(())
}

/// One input line without its terminator, invalid UTF-8 replaced.
fn decode_line(raw: &[u8]) -> Cow<'_, str> {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::classify::{INFO_BANNER, INFO_SEPARATOR};
    use crate::parser::RecordKind;

    const SAMPLE: &str = "/threads{locality#0/total}/count/instantaneous/active,1,0.01,s,4";
    const TASK: &str = "task_data,0,0,myfunc,0.001,0.002";

    fn forwarder(options: ForwardOptions) -> Forwarder {
        Forwarder::new(options, Duration::ZERO, Arc::new(RecordStats::new()))
    }

    fn records(messages: &[Message]) -> Vec<DataRecord> {
        messages
            .iter()
            .filter_map(|m| match m {
                Message::RegularData(r) => Some(r.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn test_program_output_not_forwarded_by_default() {
        let mut fwd = forwarder(ForwardOptions::default());
        let now = Instant::now();

        let (msgs, keep) = fwd.process_line("regular stdout", now);
        assert!(msgs.is_empty());
        assert!(keep);

        let (msgs, keep) = fwd.process_line(SAMPLE, now);
        assert!(!keep, "telemetry is stripped from echo");
        assert!(matches!(
            records(&msgs).as_slice(),
            [DataRecord::CounterSample(_)]
        ));

        let (msgs, _) = fwd.process_line(TASK, now);
        assert!(matches!(records(&msgs).as_slice(), [DataRecord::TaskEvent(_)]));
    }

    #[test]
    fn test_send_stdout_forwards_plain_lines() {
        let mut fwd = forwarder(ForwardOptions {
            send_stdout: true,
            send_all_stdout: false,
        });
        let (msgs, _) = fwd.process_line("regular stdout", Instant::now());
        assert_eq!(
            records(&msgs),
            vec![DataRecord::PlainLine("regular stdout".to_string())]
        );
    }

    #[test]
    fn test_send_all_stdout_keeps_telemetry_in_echo() {
        let fwd_opts = ForwardOptions {
            send_stdout: false,
            send_all_stdout: true,
        };
        let mut fwd = forwarder(fwd_opts);
        let (_, keep) = fwd.process_line(SAMPLE, Instant::now());
        assert!(keep);
    }

    #[test]
    fn test_time_window_batches_records() {
        let stats = Arc::new(RecordStats::new());
        let start = Instant::now();
        let mut fwd = Forwarder::new(ForwardOptions::default(), Duration::from_secs(60), stats);

        let (msgs, _) = fwd.process_line(SAMPLE, start);
        assert!(msgs.is_empty());
        let (msgs, _) = fwd.process_line(TASK, start);
        assert!(msgs.is_empty());
        assert!(fwd.poll_flush(start).is_none());

        let rest = fwd.finish();
        assert_eq!(records(&rest).len(), 2);
        assert!(fwd.finish().is_empty());
    }

    #[test]
    fn test_counter_infos_sent_before_first_sample() {
        let mut fwd = forwarder(ForwardOptions::default());
        let now = Instant::now();
        let block = [
            INFO_BANNER,
            INFO_SEPARATOR,
            "fullname: /threads{locality#0/total}/count/instantaneous/active",
            "helptext: returns the number of active threads",
            "type: counter_raw",
            "version: 1.0.0",
            INFO_SEPARATOR,
        ];
        for line in block {
            let (msgs, keep) = fwd.process_line(line, now);
            assert!(msgs.is_empty());
            assert!(!keep);
        }

        let (msgs, _) = fwd.process_line(SAMPLE, now);
        assert_eq!(msgs.len(), 2);
        match &msgs[0] {
            Message::CounterInfos(infos) => {
                assert!(infos.contains_key("/threads{locality#0/total}/count/instantaneous/active"));
            }
            other => panic!("expected CounterInfos, got {other:?}"),
        }
        assert!(matches!(msgs[1], Message::RegularData(_)));
    }

    #[test]
    fn test_stats_track_kinds() {
        let stats = Arc::new(RecordStats::new());
        let mut fwd = Forwarder::new(
            ForwardOptions::default(),
            Duration::ZERO,
            Arc::clone(&stats),
        );
        let now = Instant::now();
        fwd.process_line("hello", now);
        fwd.process_line(SAMPLE, now);
        fwd.process_line(TASK, now);

        let snap = stats.snapshot();
        assert_eq!(snap.count(RecordKind::PlainLine), 1);
        assert_eq!(snap.count(RecordKind::CounterSample), 1);
        assert_eq!(snap.count(RecordKind::TaskEvent), 1);
        assert_eq!(snap.telemetry_lines, 2);
        assert_eq!(snap.program_lines, 1);
    }

    #[test]
    fn test_decode_line_strips_terminator_and_replaces_invalid_bytes() {
        assert_eq!(decode_line(b"plain\n"), "plain");
        assert_eq!(decode_line(b"crlf\r\n"), "crlf");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"bad \xff byte\n"), "bad \u{fffd} byte");
    }

    #[tokio::test]
    async fn test_run_survives_invalid_utf8_input() {
        use futures::StreamExt;
        use tokio_util::codec::FramedRead;

        use crate::transport::codec::MessageCodec;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let reader = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            let mut frames = FramedRead::new(socket, MessageCodec::new());
            let mut got = Vec::new();
            while let Some(item) = frames.next().await {
                got.push(item.expect("io").expect("valid frame"));
            }
            got
        });

        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("out.txt");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(TASK.as_bytes());
        bytes.extend_from_slice(b"\nbad \xff byte\n");
        bytes.extend_from_slice(b"task_data,0,1,other,0.003,0.004");
        std::fs::write(&input, bytes).expect("write");

        let cfg = AgentConfig {
            port,
            send_stdout: true,
            buffer_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let agent = Agent::new(cfg, Some(input));
        let written = agent.run().await.expect("invalid bytes are not fatal");
        assert_eq!(written, 3);

        let got = reader.await.expect("join");
        assert_eq!(got.len(), 3);
        assert!(matches!(got[0], Message::TransmissionBegin(_)));
        assert!(matches!(got[2], Message::TransmissionEnd(_)));

        let recs = records(&got);
        assert_eq!(recs.len(), 3);
        assert!(matches!(&recs[0], DataRecord::TaskEvent(t) if t.task_name == "myfunc"));
        assert_eq!(recs[1], DataRecord::PlainLine("bad \u{fffd} byte".to_string()));
        assert!(matches!(&recs[2], DataRecord::TaskEvent(t) if t.task_name == "other"));
    }

    #[tokio::test]
    async fn test_run_fails_without_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("out.txt");
        std::fs::write(&input, "hello\n").expect("write");

        let cfg = AgentConfig {
            port,
            connect_timeout: Duration::from_millis(50),
            connect_poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let agent = Agent::new(cfg, Some(input));
        let err = agent.run().await.unwrap_err();
        assert!(err
            .downcast_ref::<crate::transport::client::ConnectError>()
            .is_some());
    }
}
