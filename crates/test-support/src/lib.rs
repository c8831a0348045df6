pub mod fixtures {
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    pub fn root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("tests")
            .join("fixtures")
    }

    pub fn path(relative: impl AsRef<Path>) -> PathBuf {
        root().join(relative.as_ref())
    }

    pub fn read(relative: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(path(relative))
    }

    pub fn stanza(name: &str) -> String {
        read_or_panic(Path::new("stanzas").join(name))
    }

    pub fn config(name: &str) -> String {
        read_or_panic(Path::new("config").join(name))
    }

    fn read_or_panic(relative: impl AsRef<Path>) -> String {
        let relative = relative.as_ref();
        read(relative).unwrap_or_else(|error| {
            panic!(
                "failed to read fixture {}: {error}",
                relative.to_string_lossy()
            )
        })
    }
}

pub mod transport {
    use std::collections::VecDeque;
    use std::str::FromStr;
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use std::time::Duration;

    use async_trait::async_trait;
    use minidom::Element;
    use tern_xmpp::{ConnectionConfig, ConnectionError, Jid, XmppTransport, parse_jid};
    use tokio::sync::{Notify, Semaphore, mpsc};

    type Frame = Result<Vec<u8>, ConnectionError>;
    type Responder = Arc<dyn Fn(&Element) -> Option<String> + Send + Sync>;

    const WAIT_LIMIT: Duration = Duration::from_secs(5);

    /// In-memory transport driven by the test.
    ///
    /// Clones share state, so a test keeps one clone for scripting while the
    /// connection owns another. Every outbound frame is recorded; responders
    /// registered with [`MockTransport::respond_with`] can answer them.
    #[derive(Clone)]
    pub struct MockTransport {
        state: Arc<Mutex<State>>,
        inbound: Arc<tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Frame>>>>,
        sent_signal: Arc<Notify>,
    }

    struct State {
        jid: Jid,
        connect_outcomes: VecDeque<Result<Jid, ConnectionError>>,
        connect_configs: Vec<ConnectionConfig>,
        close_calls: usize,
        sent: Vec<String>,
        inbound_tx: Option<mpsc::UnboundedSender<Frame>>,
        responders: Vec<Responder>,
        fail_sends: bool,
        connect_gate: Option<Arc<Semaphore>>,
    }

    impl Default for MockTransport {
        fn default() -> Self {
            Self::new("alice@example.com/tern")
        }
    }

    impl MockTransport {
        /// A transport whose successful connects bind `jid`.
        pub fn new(jid: &str) -> Self {
            let jid = parse_jid(jid)
                .unwrap_or_else(|error| panic!("invalid mock JID {jid:?}: {error}"));
            Self {
                state: Arc::new(Mutex::new(State {
                    jid,
                    connect_outcomes: VecDeque::new(),
                    connect_configs: Vec::new(),
                    close_calls: 0,
                    sent: Vec::new(),
                    inbound_tx: None,
                    responders: Vec::new(),
                    fail_sends: false,
                    connect_gate: None,
                })),
                inbound: Arc::new(tokio::sync::Mutex::new(None)),
                sent_signal: Arc::new(Notify::new()),
            }
        }

        /// Make the next connect attempt fail with `error`.
        pub fn fail_next_connect(&self, error: ConnectionError) {
            self.lock().connect_outcomes.push_back(Err(error));
        }

        /// Park connect attempts until [`MockTransport::release_connect`].
        pub fn hold_connect(&self) {
            self.lock().connect_gate = Some(Arc::new(Semaphore::new(0)));
        }

        pub fn release_connect(&self) {
            if let Some(gate) = self.lock().connect_gate.take() {
                gate.add_permits(Semaphore::MAX_PERMITS >> 1);
            }
        }

        pub fn fail_sends(&self, fail: bool) {
            self.lock().fail_sends = fail;
        }

        /// Answer outbound stanzas. The first responder returning a frame wins.
        pub fn respond_with<F>(&self, responder: F)
        where
            F: Fn(&Element) -> Option<String> + Send + Sync + 'static,
        {
            self.lock().responders.push(Arc::new(responder));
        }

        /// Deliver a frame as if the server sent it.
        pub fn push_inbound(&self, xml: &str) {
            let state = self.lock();
            let sender = state
                .inbound_tx
                .as_ref()
                .unwrap_or_else(|| panic!("push_inbound on a closed mock transport"));
            let _ = sender.send(Ok(xml.as_bytes().to_vec()));
        }

        /// Break the stream; the next `recv` returns `error`.
        pub fn break_stream(&self, error: ConnectionError) {
            if let Some(sender) = self.lock().inbound_tx.take() {
                let _ = sender.send(Err(error));
            }
        }

        pub fn connect_calls(&self) -> usize {
            self.lock().connect_configs.len()
        }

        pub fn last_connect_config(&self) -> Option<ConnectionConfig> {
            self.lock().connect_configs.last().cloned()
        }

        pub fn close_calls(&self) -> usize {
            self.lock().close_calls
        }

        pub fn is_open(&self) -> bool {
            self.lock().inbound_tx.is_some()
        }

        pub fn sent(&self) -> Vec<String> {
            self.lock().sent.clone()
        }

        pub fn sent_stanzas(&self) -> Vec<Element> {
            self.sent().iter().map(|frame| parse(frame)).collect()
        }

        /// Wait until at least `count` frames were sent and return them all.
        pub async fn wait_for_sent(&self, count: usize) -> Vec<Element> {
            let wait = async {
                loop {
                    let notified = self.sent_signal.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if self.lock().sent.len() >= count {
                        return;
                    }
                    notified.await;
                }
            };
            if tokio::time::timeout(WAIT_LIMIT, wait).await.is_err() {
                panic!(
                    "timed out waiting for {count} sent stanzas; got {:?}",
                    self.sent()
                );
            }
            self.sent_stanzas()
        }

        fn lock(&self) -> MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    fn parse(frame: &str) -> Element {
        Element::from_str(frame)
            .unwrap_or_else(|error| panic!("sent frame is not XML ({error}): {frame}"))
    }

    #[async_trait]
    impl XmppTransport for MockTransport {
        async fn connect(&self, config: &ConnectionConfig) -> Result<Jid, ConnectionError> {
            let gate = {
                let mut state = self.lock();
                state.connect_configs.push(config.clone());
                state.connect_gate.clone()
            };
            if let Some(gate) = gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }

            let (outcome, receiver) = {
                let mut state = self.lock();
                let outcome = state
                    .connect_outcomes
                    .pop_front()
                    .unwrap_or_else(|| Ok(state.jid.clone()));
                let receiver = outcome.is_ok().then(|| {
                    let (sender, receiver) = mpsc::unbounded_channel();
                    state.inbound_tx = Some(sender);
                    receiver
                });
                (outcome, receiver)
            };
            if let Some(receiver) = receiver {
                *self.inbound.lock().await = Some(receiver);
            }
            outcome
        }

        async fn send(&self, data: &[u8]) -> Result<(), ConnectionError> {
            let frame = String::from_utf8_lossy(data).into_owned();
            {
                let mut state = self.lock();
                if state.fail_sends {
                    return Err(ConnectionError::TransportError("send refused".into()));
                }
                state.sent.push(frame.clone());
                let stanza = parse(&frame);
                let reply = state
                    .responders
                    .iter()
                    .find_map(|responder| responder(&stanza));
                if let (Some(reply), Some(sender)) = (reply, &state.inbound_tx) {
                    let _ = sender.send(Ok(reply.into_bytes()));
                }
            }
            self.sent_signal.notify_waiters();
            Ok(())
        }

        async fn recv(&self) -> Result<Vec<u8>, ConnectionError> {
            let mut inbound = self.inbound.lock().await;
            let Some(receiver) = inbound.as_mut() else {
                return Err(ConnectionError::StreamError("not connected".into()));
            };
            match receiver.recv().await {
                Some(frame) => frame,
                None => Err(ConnectionError::StreamError("stream closed".into())),
            }
        }

        async fn close(&self) -> Result<(), ConnectionError> {
            let mut state = self.lock();
            state.close_calls += 1;
            state.inbound_tx = None;
            Ok(())
        }
    }
}

pub use transport::MockTransport;
