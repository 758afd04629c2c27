//! Remote procedure calls over a [`Tube`].
//!
//! Each side keeps a table of the local functions it has exposed to the peer,
//! keyed by random handle id. Sending a call registers every function found in
//! the arguments; receiving one looks the target up and invokes it. A one-shot
//! function is removed from the table right before its first invocation, a
//! kept one stays until the link ends.
//!
//! Both sides pre-register a kept entry under [`BOOTSTRAP_FN`] so the first
//! call of a session has something to land on.

use crate::codec::{self, Call};
use crate::error::{WireError, WireResult};
use crate::link::Tube;
use crate::transport::{DataChannel, Frame};
use crate::value::{Callable, Function, RpcValue};
use bytes::Bytes;
use rand::Rng;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Reserved handle id for the first call of a session.
pub const BOOTSTRAP_FN: &str = "__BOOTSTRAP__";

/// Receives the arguments of the peer's bootstrap call.
pub type BootstrapHandler = Box<dyn Fn(Vec<RpcValue>) + Send + Sync>;

/// RPC endpoint bound to one tube.
///
/// Cloning shares the same exposed table. The endpoint keeps serving calls
/// after every handle is dropped, for as long as the tube stays open.
#[derive(Clone)]
pub struct RpcHandler {
    inner: Arc<RpcInner>,
}

struct RpcInner {
    exposed: Mutex<HashMap<String, Function>>,
    /// Set once the tube has ended; guarded by `exposed`.
    closed: AtomicBool,
    outbound: mpsc::UnboundedSender<Vec<Frame>>,
}

impl RpcHandler {
    /// Serve `tube` without a bootstrap handler. Bootstrap calls from the
    /// peer are accepted and ignored.
    pub fn new(tube: Tube) -> Self {
        Self::start(tube, None)
    }

    /// Serve `tube`, handing the peer's bootstrap arguments to `on_bootstrap`.
    pub fn with_bootstrap<F>(tube: Tube, on_bootstrap: F) -> Self
    where
        F: Fn(Vec<RpcValue>) + Send + Sync + 'static,
    {
        Self::start(tube, Some(Box::new(on_bootstrap)))
    }

    fn start(tube: Tube, on_bootstrap: Option<BootstrapHandler>) -> Self {
        let (channel, incoming) = tube.into_parts();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(RpcInner {
            exposed: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            outbound,
        });

        let bootstrap = Function::kept(move |args| {
            match &on_bootstrap {
                Some(handler) => handler(args),
                None => debug!("Ignoring bootstrap call, no handler installed"),
            }
            Ok(())
        });
        inner.register(BOOTSTRAP_FN.to_string(), bootstrap);

        tokio::spawn(write_loop(channel, outbound_rx));
        tokio::spawn(read_loop(inner.clone(), incoming));

        Self { inner }
    }

    /// Invoke the peer's function `fn_id`.
    ///
    /// Returns once the call is queued; the outcome, if any, comes back
    /// through a function passed in `args`.
    pub fn call_remote(&self, fn_id: &str, args: Vec<RpcValue>) -> WireResult<()> {
        self.inner.call_remote(fn_id, &args)
    }

    /// Invoke the peer's bootstrap entry.
    pub fn bootstrap(&self, args: Vec<RpcValue>) -> WireResult<()> {
        self.call_remote(BOOTSTRAP_FN, args)
    }

    /// Register `function` and return the id the peer can call it by.
    pub fn expose(&self, function: Function) -> String {
        self.inner.expose(function)
    }

    pub fn is_exposed(&self, id: &str) -> bool {
        self.inner.lock_exposed().contains_key(id)
    }

    /// Number of exposed entries, the bootstrap entry included.
    pub fn exposed_count(&self) -> usize {
        self.inner.lock_exposed().len()
    }
}

impl RpcInner {
    fn lock_exposed(&self) -> std::sync::MutexGuard<'_, HashMap<String, Function>> {
        self.exposed.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, id: String, function: Function) {
        self.lock_exposed().insert(id, function);
    }

    fn expose(&self, function: Function) -> String {
        let mut exposed = self.lock_exposed();
        if self.closed.load(Ordering::Acquire) {
            return handle_id();
        }
        loop {
            let id = handle_id();
            if !exposed.contains_key(&id) {
                exposed.insert(id.clone(), function);
                return id;
            }
        }
    }

    fn call_remote(&self, fn_id: &str, args: &[RpcValue]) -> WireResult<()> {
        let frames = codec::encode_call(fn_id, args, &mut |f: &Function| self.expose(f.clone()))?;
        if self.closed.load(Ordering::Acquire) {
            return Err(WireError::Closed);
        }
        debug!(fn_id, frames = frames.len(), "Queueing remote call");
        self.outbound.send(frames).map_err(|_| WireError::Closed)
    }

    fn dispatch(&self, call: Call) {
        let Call { fn_id, args } = call;
        let function = {
            let mut exposed = self.lock_exposed();
            let Some(function) = exposed.get(&fn_id).cloned() else {
                warn!(fn_id = %fn_id, "Call to unknown local function, dropping");
                return;
            };
            if !function.is_kept() {
                exposed.remove(&fn_id);
            }
            function
        };

        match catch_unwind(AssertUnwindSafe(|| function.call(args))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(fn_id = %fn_id, error = %e, "Local function failed"),
            Err(_) => warn!(fn_id = %fn_id, "Local function panicked"),
        }
    }
}

/// Local stand-in for a function living on the peer.
struct RemoteProxy {
    fn_id: String,
    rpc: Weak<RpcInner>,
}

impl Callable for RemoteProxy {
    fn call(&self, args: Vec<RpcValue>) -> WireResult<()> {
        let rpc = self.rpc.upgrade().ok_or(WireError::Closed)?;
        rpc.call_remote(&self.fn_id, &args)
    }
}

/// 20 random decimal digits.
fn handle_id() -> String {
    let mut rng = rand::thread_rng();
    (0..20)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// Sends each call's frames back to back, in queue order.
async fn write_loop(
    channel: Arc<dyn DataChannel>,
    mut outbound: mpsc::UnboundedReceiver<Vec<Frame>>,
) {
    while let Some(frames) = outbound.recv().await {
        for frame in frames {
            if let Err(e) = channel.send(frame).await {
                warn!(label = channel.label(), error = %e, "Dropping rest of call, send failed");
                break;
            }
        }
    }
}

async fn read_loop(inner: Arc<RpcInner>, mut incoming: mpsc::UnboundedReceiver<Frame>) {
    let weak = Arc::downgrade(&inner);
    let proxy = move |fn_id: String| {
        Function::from_callable(Arc::new(RemoteProxy {
            fn_id,
            rpc: weak.clone(),
        }))
    };

    let mut blobs: Vec<Bytes> = Vec::new();
    while let Some(frame) = incoming.recv().await {
        match frame {
            Frame::Binary(data) => blobs.push(data),
            Frame::Text(text) => {
                let decoded = codec::decode_call(&text, &blobs, &proxy);
                blobs.clear();
                match decoded {
                    Ok(call) => inner.dispatch(call),
                    Err(e) => warn!(error = %e, "Dropping undecodable message"),
                }
            }
        }
    }

    debug!("Tube ended, releasing exposed functions");
    let mut exposed = inner.lock_exposed();
    inner.closed.store(true, Ordering::Release);
    exposed.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDataChannel;
    use crate::value::Blob;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn connected_pair() -> (RpcHandler, RpcHandler) {
        let (a, b) = MockDataChannel::pair("rpc");
        a.mark_open();
        b.mark_open();
        (
            RpcHandler::new(Tube::attach(a)),
            RpcHandler::new(Tube::attach(b)),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(Vec<RpcValue>) -> WireResult<()>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (hits, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_handle_id_shape() {
        let id = handle_id();
        assert_eq!(id.len(), 20);
        assert!(id.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_one_shot_function_runs_once() {
        let (a, b) = connected_pair();
        let (hits, f) = counter();
        let id = b.expose(Function::new(f));

        a.call_remote(&id, vec![]).unwrap();
        a.call_remote(&id, vec![]).unwrap();
        settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!b.is_exposed(&id));
    }

    #[tokio::test]
    async fn test_kept_function_runs_every_time() {
        let (a, b) = connected_pair();
        let (hits, f) = counter();
        let id = b.expose(Function::kept(f));

        for _ in 0..3 {
            a.call_remote(&id, vec![]).unwrap();
        }
        settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(b.is_exposed(&id));
    }

    #[tokio::test]
    async fn test_unkeeping_retires_on_next_call() {
        let (a, b) = connected_pair();
        let (hits, f) = counter();
        let function = Function::kept(f);
        let id = b.expose(function.clone());

        a.call_remote(&id, vec![]).unwrap();
        settle().await;
        function.set_kept(false);
        a.call_remote(&id, vec![]).unwrap();
        a.call_remote(&id, vec![]).unwrap();
        settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(!b.is_exposed(&id));
    }

    #[tokio::test]
    async fn test_bootstrap_with_callback() {
        let (a_chan, b_chan) = MockDataChannel::pair("rpc");
        a_chan.mark_open();
        b_chan.mark_open();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let a = RpcHandler::with_bootstrap(Tube::attach(a_chan), move |args| {
            // Answer through the function the peer sent along.
            if let Some(reply) = args.first().and_then(RpcValue::as_function) {
                let _ = reply.call(vec![RpcValue::from("pong")]);
            }
        });
        let b = RpcHandler::new(Tube::attach(b_chan));

        let reply = Function::new(move |args| {
            let text = args.first().and_then(RpcValue::as_str).unwrap_or_default();
            let _ = tx.send(text.to_string());
            Ok(())
        });
        b.bootstrap(vec![RpcValue::Function(reply)]).unwrap();

        let answer = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(answer.as_deref(), Some("pong"));
        assert!(a.is_exposed(BOOTSTRAP_FN));
    }

    #[tokio::test]
    async fn test_blob_arguments_arrive_intact() {
        let (a, b) = connected_pair();
        let (tx, mut rx) = mpsc::unbounded_channel::<(Blob, Blob)>();
        let id = b.expose(Function::new(move |args| {
            let first = args[0].as_blob().cloned().unwrap_or_else(|| Blob::new(Bytes::new()));
            let second = args[1]
                .get("again")
                .and_then(RpcValue::as_blob)
                .cloned()
                .unwrap_or_else(|| Blob::new(Bytes::new()));
            let _ = tx.send((first, second));
            Ok(())
        }));

        let payload = Blob::new(Bytes::from_static(b"attachment body"));
        a.call_remote(
            &id,
            vec![
                RpcValue::Blob(payload.clone()),
                RpcValue::object([("again", RpcValue::Blob(payload.clone()))]),
            ],
        )
        .unwrap();

        let (first, second) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, payload);
        assert_eq!(second, payload);
    }

    #[tokio::test]
    async fn test_unknown_and_failing_calls_do_not_stop_dispatch() {
        let (a, b) = connected_pair();
        let failing = b.expose(Function::new(|_| Err(WireError::Invocation("boom".into()))));
        let panicking = b.expose(Function::new(|_| panic!("boom")));
        let (hits, f) = counter();
        let healthy = b.expose(Function::new(f));

        a.call_remote("no-such-handle", vec![]).unwrap();
        a.call_remote(&failing, vec![]).unwrap();
        a.call_remote(&panicking, vec![]).unwrap();
        a.call_remote(&healthy, vec![]).unwrap();
        settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_calls_dispatch_in_send_order() {
        let (a, b) = connected_pair();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = b.expose(Function::kept(move |args| {
            if let Some(n) = args.first().and_then(|v| v.to_json().as_u64()) {
                sink.lock().unwrap().push(n);
            }
            Ok(())
        }));

        for n in 0..20u64 {
            a.call_remote(&id, vec![RpcValue::from(n)]).unwrap();
        }
        settle().await;

        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_closing_tube_clears_exposed_table() {
        let (a_chan, b_chan) = MockDataChannel::pair("rpc");
        a_chan.mark_open();
        b_chan.mark_open();
        let a = RpcHandler::new(Tube::attach(a_chan.clone()));
        let _b = RpcHandler::new(Tube::attach(b_chan));
        a.expose(Function::kept(|_| Ok(())));
        assert_eq!(a.exposed_count(), 2);

        a_chan.close().await;
        settle().await;
        assert_eq!(a.exposed_count(), 0);

        let reply = Function::new(|_| Ok(()));
        assert!(matches!(
            a.call_remote("12345", vec![RpcValue::Function(reply)]),
            Err(WireError::Closed)
        ));
        assert_eq!(a.exposed_count(), 0);
    }
}
