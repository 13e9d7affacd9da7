//! Test implementation of the Runtime trait. Time is real (tokio), but the
//! RNG is seeded so ids and jitter are reproducible across runs.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    time::{
        Duration,
        SystemTime,
    },
};

use futures::{
    future::{
        BoxFuture,
        FusedFuture,
    },
    FutureExt,
};
use parking_lot::Mutex;
use rand::{
    RngCore,
    SeedableRng,
};
use rand_chacha::ChaCha12Rng;

use crate::runtime::{
    JoinError,
    Runtime,
    SpawnHandle,
};

const DEFAULT_SEED: u64 = 0;

#[derive(Clone)]
pub struct TestRuntime {
    rng: Arc<Mutex<ChaCha12Rng>>,
    handle: tokio::runtime::Handle,
}

impl TestRuntime {
    /// Must be called from within a tokio runtime, e.g. a `#[tokio::test]`.
    pub fn new() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha12Rng::seed_from_u64(seed))),
            handle: tokio::runtime::Handle::current(),
        }
    }
}

pub struct TestFutureHandle {
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl SpawnHandle for TestFutureHandle {
    fn shutdown(&mut self) {
        if let Some(ref handle) = self.handle {
            handle.abort();
        }
    }

    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>> {
        let handle = self.handle.take();
        async move {
            match handle {
                Some(handle) => handle.await.map_err(JoinError::from),
                None => Ok(()),
            }
        }
        .boxed()
    }
}

/// Shared handle to the runtime's seeded generator. Handing out a snapshot
/// would make parallel callers observe the same stream, so every pull goes
/// through the mutex.
struct SharedRng(Arc<Mutex<ChaCha12Rng>>);

impl RngCore for SharedRng {
    fn next_u32(&mut self) -> u32 {
        self.0.lock().next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.0.lock().next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.lock().fill_bytes(dest)
    }
}

impl Runtime for TestRuntime {
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(tokio::time::sleep(duration).fuse())
    }

    fn spawn(
        &self,
        _name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        let handle = self.handle.spawn(f);
        Box::new(TestFutureHandle {
            handle: Some(handle),
        })
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    fn rng(&self) -> Box<dyn RngCore> {
        Box::new(SharedRng(self.rng.clone()))
    }
}
